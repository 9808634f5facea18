//! The card handle contract
//!
//! The core never speaks bytes of the DESFire wire protocol. Everything it
//! needs from a card driver is the verb set of [`CardInterface`], together
//! with the typed settings and error values in this module. Any driver (a
//! PN532 behind an SPI bus, a test double, a remote relay) that satisfies
//! this contract can carry the full token lifecycle.
//!
//! A card handle is exclusively owned for the duration of an operation;
//! authentication state lives in the card, so interleaving two users on one
//! handle would corrupt it.

use crate::keys::Aes128Key;
use crate::{AppId, FileId, TokenId};

#[cfg(test)]
pub(crate) mod emulated;

/// Card-layer errors, as surfaced by the driver and inspected by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// No application with the requested id.
    AppNotFound,
    /// No file with the requested id in the selected application.
    FileNotFound,
    /// The current authentication state does not allow the operation.
    PermissionDenied,
    /// An application exists but violates the invariant settings.
    AppIntegrity,
    /// A file exists but violates the invariant settings.
    FileIntegrity,
    /// The PICC root settings violate the invariants.
    PiccIntegrity,
    /// Sealed data failed to decrypt or re-encrypt.
    Crypto,
    /// Data decrypted but does not parse.
    Malformed,
    /// A caller supplied argument is unusable (wrong key number, id out of
    /// range, mismatching identity).
    Parameter,
    /// No key in the fallback chain authenticated.
    Authentication,
    /// Bus-level failure talking to the NFC controller.
    Controller,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            Error::AppNotFound => write!(f, "app_not_found"),
            Error::FileNotFound => write!(f, "file_not_found"),
            Error::PermissionDenied => write!(f, "permission_denied"),
            Error::AppIntegrity => write!(f, "app_integrity_error"),
            Error::FileIntegrity => write!(f, "file_integrity_error"),
            Error::PiccIntegrity => write!(f, "picc_integrity_error"),
            Error::Crypto => write!(f, "crypto_error"),
            Error::Malformed => write!(f, "malformed"),
            Error::Parameter => write!(f, "parameter_error"),
            Error::Authentication => write!(f, "authentication_error"),
            Error::Controller => write!(f, "controller_error"),
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;

/// Any key a card may be authenticated with.
///
/// Factory cards ship with an all-zero DES key at the root; everything this
/// crate installs is AES128.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnyKey {
    Des { key_no: u8, data: [u8; 8] },
    Aes128(Aes128Key),
}

impl AnyKey {
    /// The factory default root key: all-zero DES at key number 0.
    pub fn default_des() -> Self {
        AnyKey::Des {
            key_no: 0,
            data: [0; 8],
        }
    }

    pub fn key_no(&self) -> u8 {
        match self {
            AnyKey::Des { key_no, .. } => *key_no,
            AnyKey::Aes128(k) => k.key_no(),
        }
    }
}

impl From<Aes128Key> for AnyKey {
    fn from(k: Aes128Key) -> Self {
        AnyKey::Aes128(k)
    }
}

/// Who may issue ChangeKey within an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKeyPolicy {
    /// Only the application master key changes keys.
    OnlyMaster,
    /// Every key can rotate itself, and nothing else.
    SameKey,
    /// Keys are frozen.
    Frozen,
}

/// Application (or PICC root) key settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyRights {
    pub allowed_to_change_keys: ChangeKeyPolicy,
    pub master_key_changeable: bool,
    pub dir_access_without_auth: bool,
    pub create_delete_without_auth: bool,
    pub config_changeable: bool,
}

/// Cipher family of an application's keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppCrypto {
    LegacyDes,
    Aes128,
}

/// Settings of one application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppSettings {
    pub crypto: AppCrypto,
    pub rights: KeyRights,
    /// Key slots in addition to the master (slot 0).
    pub extra_keys: u8,
}

/// One party of a file's access rights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// A specific key slot.
    Key(u8),
    /// Anyone, unauthenticated.
    Free,
    /// Nobody, not even the master.
    Never,
}

/// The four access parties of a data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessRights {
    pub read: Access,
    pub write: Access,
    pub read_write: Access,
    pub change: Access,
}

impl AccessRights {
    /// Readable by exactly one key, nothing else ever.
    pub fn read_only_by(key_no: u8) -> Self {
        AccessRights {
            read: Access::Key(key_no),
            write: Access::Never,
            read_write: Access::Never,
            change: Access::Never,
        }
    }
}

/// Communication security of file data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommMode {
    Plain,
    Ciphered,
}

/// Settings of a standard data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StdFileSettings {
    pub security: CommMode,
    pub rights: AccessRights,
    pub size: u32,
}

/// Settings of any file, as reported by the card.
///
/// The core only ever creates standard data files; every other file type it
/// encounters is a shape violation and reported as `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSettings {
    Standard(StdFileSettings),
    Other,
}

/// Manufacturing information of the card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardInfo {
    pub serial_no: [u8; 7],
}

/// The verb set a DESFire-like card driver must provide.
///
/// Selecting an application clears the authentication state. Authenticating
/// binds the session to one key slot of the selected application. Every
/// verb returns a typed [`Error`]; the enumerated variants are the only
/// failures the core inspects by value.
pub trait CardInterface {
    fn select_application(&mut self, aid: AppId) -> Result<()>;

    fn authenticate(&mut self, key: &AnyKey) -> Result<()>;

    /// Change the key slot named by `new_key` to its value.
    ///
    /// Which slots may be changed under which authentication is governed by
    /// the application's [`KeyRights`]. Changing the slot the session is
    /// authenticated with drops the authentication.
    fn change_key(&mut self, new_key: &AnyKey) -> Result<()>;

    fn change_app_settings(&mut self, rights: KeyRights) -> Result<()>;

    fn get_app_settings(&mut self) -> Result<AppSettings>;

    fn create_application(&mut self, aid: AppId, settings: AppSettings) -> Result<()>;

    fn delete_application(&mut self, aid: AppId) -> Result<()>;

    fn get_application_ids(&mut self) -> Result<Vec<AppId>>;

    fn get_file_ids(&mut self) -> Result<Vec<FileId>>;

    fn create_file(&mut self, fid: FileId, settings: StdFileSettings) -> Result<()>;

    fn delete_file(&mut self, fid: FileId) -> Result<()>;

    fn get_file_settings(&mut self, fid: FileId) -> Result<FileSettings>;

    fn change_file_settings(&mut self, fid: FileId, settings: StdFileSettings) -> Result<()>;

    fn read_data(&mut self, fid: FileId, mode: CommMode) -> Result<Vec<u8>>;

    fn write_data(&mut self, fid: FileId, data: &[u8], mode: CommMode) -> Result<()>;

    /// Erase every application and file. Root authentication required; the
    /// root key itself survives.
    fn format_picc(&mut self) -> Result<()>;

    fn get_info(&mut self) -> Result<CardInfo>;

    fn get_card_uid(&mut self) -> Result<TokenId>;
}
