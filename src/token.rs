//! Member token operations
//!
//! A [`MemberToken`] wraps an exclusively borrowed card handle and applies
//! the on-card data model on top of it: the root settings, the master
//! application and file, the per-gate applications and files. Methods come
//! in three tiers, mirrored in their names:
//!
//! * `check_*` predicates never mutate and answer `Ok(true)` (shape exists
//!   and is correct), `Ok(false)` (shape exists but is wrong) or a typed
//!   error.
//! * raw read/write primitives move file payloads without interpreting
//!   them.
//! * composite operations (`deploy`, `enroll_gate`, `unenroll_gate`,
//!   `is_deployed_correctly`, …) chain the above and are the only API the
//!   devices use.
//!
//! Cascade flags (`check_app`, `check_file`) convert invariant violations
//! into [`Error::AppIntegrity`] / [`Error::FileIntegrity`] before the
//! actual access is attempted.

use crate::card::{
    Access, AccessRights, AnyKey, AppCrypto, AppSettings, CardInterface, ChangeKeyPolicy, CommMode,
    Error, FileSettings, KeyRights, Result, StdFileSettings,
};
use crate::identity::Identity;
use crate::keys::{
    Aes128Key, GateAppMasterKey, GateBaseKey, GateTokenKey, KeyPair, PublicKey, TokenRootKey,
};
use crate::wire;
use crate::{AppId, GateId, TokenId, ROOT_APP};

use log::{info, warn};

/// Public configuration of one gate, as the keymaker stores it.
///
/// Everything needed to enroll cards for the gate; none of it opens the
/// gate's files (that takes the keys derived from `base_key` per card).
#[derive(Debug, Clone)]
pub struct GateConfig {
    pub id: GateId,
    pub gate_pk: PublicKey,
    pub base_key: GateBaseKey,
}

/// Root settings installed by `deploy`: no directory listing, no
/// create/delete without root authentication.
const ROOT_RIGHTS: KeyRights = KeyRights {
    allowed_to_change_keys: ChangeKeyPolicy::OnlyMaster,
    master_key_changeable: true,
    dir_access_without_auth: false,
    create_delete_without_auth: false,
    config_changeable: true,
};

/// The invariant settings of the master application and of every gate
/// application.
const GATE_APP_SETTINGS: AppSettings = AppSettings {
    crypto: AppCrypto::Aes128,
    rights: KeyRights {
        allowed_to_change_keys: ChangeKeyPolicy::SameKey,
        master_key_changeable: true,
        dir_access_without_auth: true,
        create_delete_without_auth: false,
        config_changeable: false,
    },
    extra_keys: GateId::GATES_PER_APP as u8,
};

/// Final settings of a gate or master file: ciphered, readable by exactly
/// one key, nothing else ever.
fn file_settings(key_no: u8, size: u32) -> StdFileSettings {
    StdFileSettings {
        security: CommMode::Ciphered,
        rights: AccessRights::read_only_by(key_no),
        size,
    }
}

/// Settings a file is created with; write and change stay with the master
/// until the payload is in place.
fn file_settings_at_creation(key_no: u8, size: u32) -> StdFileSettings {
    StdFileSettings {
        security: CommMode::Ciphered,
        rights: AccessRights {
            read: Access::Key(key_no),
            write: Access::Key(0),
            read_write: Access::Never,
            change: Access::Key(0),
        },
        size,
    }
}

pub struct MemberToken<'a, C: CardInterface> {
    card: &'a mut C,
}

impl<'a, C: CardInterface> MemberToken<'a, C> {
    pub fn new(card: &'a mut C) -> Self {
        MemberToken { card }
    }

    /// The token id all keys of this card are derived from.
    pub fn id(&mut self) -> Result<TokenId> {
        self.card.get_card_uid()
    }

    /// Whether `key` opens the card root. Does not distinguish why not.
    pub fn check_root_key(&mut self, key: &AnyKey) -> Result<bool> {
        self.card.select_application(ROOT_APP)?;
        match self.card.authenticate(key) {
            Ok(()) => Ok(true),
            Err(Error::PermissionDenied) | Err(Error::Authentication) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Whether the root is deployed correctly: `rkey` must authenticate
    /// (otherwise [`Error::PermissionDenied`]) and the root settings must
    /// forbid directory listing and unauthenticated create/delete.
    pub fn check_root(&mut self, rkey: &TokenRootKey) -> Result<bool> {
        self.card.select_application(ROOT_APP)?;
        self.card.authenticate(&rkey.0.into())?;
        let settings = self.card.get_app_settings()?;
        Ok(!settings.rights.dir_access_without_auth
            && !settings.rights.create_delete_without_auth)
    }

    /// Whether `aid` exists and carries the invariant gate application
    /// settings. Leaves the application selected.
    pub fn check_gate_app(&mut self, aid: AppId) -> Result<bool> {
        if !GateId::is_gate_app(aid) {
            return Err(Error::Parameter);
        }
        self.card.select_application(aid)?;
        let settings = self.card.get_app_settings()?;
        Ok(settings == GATE_APP_SETTINGS)
    }

    /// Whether the gate file of `gid` exists and has the invariant shape.
    pub fn check_gate_file(&mut self, gid: GateId, check_app: bool) -> Result<bool> {
        if !gid.is_valid() {
            return Err(Error::Parameter);
        }
        let (aid, fid) = gid.app_and_file();
        self.enter_app(aid, check_app)?;
        self.check_file_shape(fid, gid.key_no())
    }

    /// Whether the master file (file 0 of the first gate application)
    /// exists and has the invariant shape.
    pub fn check_master_file(&mut self, check_app: bool) -> Result<bool> {
        self.enter_app(GateId::FIRST_AID, check_app)?;
        self.check_file_shape(0, 0)
    }

    /// Whether `key` opens the gate key slot of `gid`.
    pub fn check_gate_key(&mut self, gid: GateId, key: &GateTokenKey) -> Result<bool> {
        if !gid.is_valid() || key.0.key_no() != gid.key_no() {
            return Err(Error::Parameter);
        }
        self.card.select_application(gid.app())?;
        match self.card.authenticate(&key.0.into()) {
            Ok(()) => Ok(true),
            Err(Error::PermissionDenied) | Err(Error::Authentication) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Whether `mkey` opens key 0 of the gate application `aid`.
    pub fn check_master_key(&mut self, mkey: &GateAppMasterKey, aid: AppId) -> Result<bool> {
        if mkey.0.key_no() != 0 || !GateId::is_gate_app(aid) {
            return Err(Error::Parameter);
        }
        self.card.select_application(aid)?;
        match self.card.authenticate(&mkey.0.into()) {
            Ok(()) => Ok(true),
            Err(Error::PermissionDenied) | Err(Error::Authentication) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Read the raw payload of the gate file of `gid` with its slot key.
    pub fn read_gate_file(
        &mut self,
        gid: GateId,
        key: &GateTokenKey,
        check_app: bool,
        check_file: bool,
    ) -> Result<Vec<u8>> {
        if !gid.is_valid() || key.0.key_no() != gid.key_no() {
            return Err(Error::Parameter);
        }
        let (aid, fid) = gid.app_and_file();
        self.read_file_raw(aid, fid, gid.key_no(), &key.0.into(), check_app, check_file)
    }

    /// Read the raw payload of the master file with the application master
    /// key.
    pub fn read_master_file(
        &mut self,
        mkey: &GateAppMasterKey,
        check_app: bool,
        check_file: bool,
    ) -> Result<Vec<u8>> {
        if mkey.0.key_no() != 0 {
            return Err(Error::Parameter);
        }
        self.read_file_raw(GateId::FIRST_AID, 0, 0, &mkey.0.into(), check_app, check_file)
    }

    /// Replace the gate file of `gid` with `data`.
    ///
    /// An existing file is deleted first. On return the application is
    /// selected but no longer authenticated.
    pub fn write_gate_file(
        &mut self,
        gid: GateId,
        mkey: &GateAppMasterKey,
        data: &[u8],
        check_app: bool,
    ) -> Result<()> {
        if !gid.is_valid() || mkey.0.key_no() != 0 {
            return Err(Error::Parameter);
        }
        let (aid, fid) = gid.app_and_file();
        self.write_file_raw(aid, fid, gid.key_no(), mkey, data, check_app)
    }

    /// Replace the master file with `data`.
    pub fn write_master_file(
        &mut self,
        mkey: &GateAppMasterKey,
        data: &[u8],
        check_app: bool,
    ) -> Result<()> {
        if mkey.0.key_no() != 0 {
            return Err(Error::Parameter);
        }
        self.write_file_raw(GateId::FIRST_AID, 0, 0, mkey, data, check_app)
    }

    /// Delete the gate file of `gid`, tolerating its absence.
    pub fn delete_gate_file(
        &mut self,
        gid: GateId,
        mkey: &GateAppMasterKey,
        check_app: bool,
    ) -> Result<()> {
        if !gid.is_valid() || mkey.0.key_no() != 0 {
            return Err(Error::Parameter);
        }
        let (aid, fid) = gid.app_and_file();
        self.enter_app(aid, check_app)?;
        self.card.authenticate(&mkey.0.into())?;
        match self.card.delete_file(fid) {
            Ok(()) | Err(Error::FileNotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Decrypt and parse the identity stored for one gate.
    ///
    /// This is the gate-side read: only the gate base key and the gate's
    /// own key pair are required, the keymaker public key authenticates the
    /// sender. Returns the identity together with the token id the keys
    /// were derived from.
    pub fn read_encrypted_gate_file(
        &mut self,
        gid: GateId,
        base_key: &GateBaseKey,
        gate_kp: &KeyPair,
        keymaker_pk: &PublicKey,
        check_app: bool,
        check_file: bool,
    ) -> Result<(Identity, TokenId)> {
        let tid = self.id()?;
        let key = base_key.derive_token_key(tid, gid);
        let raw = self.read_gate_file(gid, &key, check_app, check_file)?;
        let plain = gate_kp
            .decrypt_from(keymaker_pk, &raw)
            .map_err(|_| Error::Crypto)?;
        let identity = wire::decode::<Identity>(&plain).map_err(|_| Error::Malformed)?;
        Ok((identity, tid))
    }

    /// Decrypt and parse the master file. Keymaker only.
    pub fn read_encrypted_master_file(
        &mut self,
        km: &KeyPair,
        check_app: bool,
        check_file: bool,
    ) -> Result<(Identity, TokenId)> {
        let tid = self.id()?;
        let mkey = km.derive_gate_app_master_key(tid, GateId::new(0));
        let raw = self.read_master_file(&mkey, check_app, check_file)?;
        let plain = km
            .decrypt_from(&km.public_key(), &raw)
            .map_err(|_| Error::Crypto)?;
        let identity = wire::decode::<Identity>(&plain).map_err(|_| Error::Malformed)?;
        Ok((identity, tid))
    }

    /// Seal `identity` for gate `g` and store it in the gate file.
    pub fn write_encrypted_gate_file(
        &mut self,
        km: &KeyPair,
        g: &GateConfig,
        identity: &Identity,
        check_app: bool,
    ) -> Result<TokenId> {
        let tid = self.id()?;
        let mkey = km.derive_gate_app_master_key(tid, g.id);
        let blob = km
            .encrypt_for(&g.gate_pk, &wire::encode(identity))
            .map_err(|_| Error::Crypto)?;
        self.write_gate_file(g.id, &mkey, &blob, check_app)?;
        Ok(tid)
    }

    /// Seal `identity` to the keymaker itself and store it in the master
    /// file.
    pub fn write_encrypted_master_file(
        &mut self,
        km: &KeyPair,
        identity: &Identity,
        check_app: bool,
    ) -> Result<TokenId> {
        let tid = self.id()?;
        let mkey = km.derive_gate_app_master_key(tid, GateId::new(0));
        let blob = km
            .encrypt_for(&km.public_key(), &wire::encode(identity))
            .map_err(|_| Error::Crypto)?;
        self.write_master_file(&mkey, &blob, check_app)?;
        Ok(tid)
    }

    /// Verify, without the gate's secret key, that the gate file of `g`
    /// seals exactly `identity`.
    pub fn check_encrypted_gate_file(
        &mut self,
        km: &KeyPair,
        g: &GateConfig,
        identity: &Identity,
        check_app: bool,
        check_file: bool,
    ) -> Result<(bool, TokenId)> {
        let tid = self.id()?;
        let key = g.base_key.derive_token_key(tid, g.id);
        let raw = self.read_gate_file(g.id, &key, check_app, check_file)?;
        let matches = km
            .blind_check_ciphertext(&g.gate_pk, &wire::encode(identity), &raw)
            .map_err(|_| Error::Crypto)?;
        Ok((matches, tid))
    }

    /// Create a gate application at `aid` with the invariant settings and
    /// install `mkey` as its master. The application must not exist.
    pub fn create_gate_app(
        &mut self,
        aid: AppId,
        rkey: &TokenRootKey,
        mkey: &GateAppMasterKey,
    ) -> Result<()> {
        if !GateId::is_gate_app(aid) || mkey.0.key_no() != 0 {
            return Err(Error::Parameter);
        }
        self.card.select_application(ROOT_APP)?;
        self.card.authenticate(&rkey.0.into())?;
        self.card.create_application(aid, GATE_APP_SETTINGS)?;
        self.card.select_application(aid)?;
        self.card
            .authenticate(&Aes128Key::default_with_no(0).into())?;
        self.card.change_key(&mkey.0.into())?;
        Ok(())
    }

    /// Make sure the gate application `aid` exists with correct settings
    /// and that `mkey` opens it, creating it if absent.
    pub fn ensure_gate_app(
        &mut self,
        aid: AppId,
        rkey: &TokenRootKey,
        mkey: &GateAppMasterKey,
    ) -> Result<()> {
        if !GateId::is_gate_app(aid) || mkey.0.key_no() != 0 {
            return Err(Error::Parameter);
        }
        match self.card.select_application(aid) {
            Err(Error::AppNotFound) => return self.create_gate_app(aid, rkey, mkey),
            Err(e) => return Err(e),
            Ok(()) => {}
        }
        if !self.check_gate_app(aid)? {
            return Err(Error::AppIntegrity);
        }
        if !self.check_master_key(mkey, aid)? {
            return Err(Error::PermissionDenied);
        }
        Ok(())
    }

    /// Install `key` in the gate key slot of `gid`.
    ///
    /// The slot settings let every key rotate only itself, so the rotation
    /// runs in two steps: the master seeds a factory valued slot, an
    /// already enrolled slot is re-authenticated in place.
    pub fn enroll_gate_key(
        &mut self,
        gid: GateId,
        mkey: &GateAppMasterKey,
        key: &GateTokenKey,
        check_app: bool,
    ) -> Result<()> {
        if !gid.is_valid() || mkey.0.key_no() != 0 || key.0.key_no() != gid.key_no() {
            return Err(Error::Parameter);
        }
        self.enter_app(gid.app(), check_app)?;
        self.card.authenticate(&mkey.0.into())?;
        match self.card.change_key(&key.0.into()) {
            Ok(()) => Ok(()),
            Err(Error::PermissionDenied) => {
                // The slot is no longer factory valued; if the target key
                // already opens it, the enrollment is in place.
                self.card.authenticate(&key.0.into())?;
                self.card.change_key(&key.0.into())?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Reset the gate key slot of `gid` to its factory value.
    pub fn unenroll_gate_key(
        &mut self,
        gid: GateId,
        mkey: &GateAppMasterKey,
        key: &GateTokenKey,
        check_app: bool,
    ) -> Result<()> {
        if !gid.is_valid() || mkey.0.key_no() != 0 || key.0.key_no() != gid.key_no() {
            return Err(Error::Parameter);
        }
        self.enter_app(gid.app(), check_app)?;
        self.card.authenticate(&mkey.0.into())?;
        let factory = Aes128Key::default_with_no(gid.key_no());
        match self.card.change_key(&factory.into()) {
            // Already factory valued.
            Ok(()) => Ok(()),
            Err(Error::PermissionDenied) => {
                self.card.authenticate(&key.0.into())?;
                self.card.change_key(&factory.into())?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Install `rkey` as the root key and the invariant root settings.
    ///
    /// Tries, in order: the caller supplied previous key, `rkey` itself,
    /// the factory DES key. When none authenticates the chain ends in
    /// [`Error::Authentication`]. With `format` the card is wiped first.
    pub fn setup_root(
        &mut self,
        rkey: &TokenRootKey,
        format: bool,
        previous: Option<&AnyKey>,
    ) -> Result<()> {
        self.card.select_application(ROOT_APP)?;
        let mut candidates: Vec<AnyKey> = Vec::new();
        if let Some(prev) = previous {
            candidates.push(*prev);
        }
        candidates.push(rkey.0.into());
        candidates.push(AnyKey::default_des());
        let mut unlocked = false;
        for key in &candidates {
            match self.card.authenticate(key) {
                Ok(()) => {
                    unlocked = true;
                    break;
                }
                Err(Error::PermissionDenied) | Err(Error::Authentication) => continue,
                Err(e) => return Err(e),
            }
        }
        if !unlocked {
            warn!("no root key candidate authenticates");
            return Err(Error::Authentication);
        }
        if format {
            self.card.format_picc()?;
        }
        self.card.change_key(&rkey.0.into())?;
        self.card.select_application(ROOT_APP)?;
        self.card.authenticate(&rkey.0.into())?;
        self.card.change_app_settings(ROOT_RIGHTS)?;
        Ok(())
    }

    /// Wipe the card and turn it into a deployed member token: fresh root
    /// key and settings, master application, sealed master file.
    ///
    /// Partial state is recoverable by running `deploy` again.
    pub fn deploy(
        &mut self,
        km: &KeyPair,
        identity: &Identity,
        previous: Option<&AnyKey>,
    ) -> Result<TokenId> {
        let tid = self.id()?;
        if identity.id != tid {
            return Err(Error::Parameter);
        }
        let info = self.card.get_info()?;
        info!(
            "deploying token {} (serial {})",
            tid,
            hex::encode(info.serial_no)
        );
        let rkey = km.derive_token_root_key(tid);
        let mkey = km.derive_gate_app_master_key(tid, GateId::new(0));
        self.setup_root(&rkey, true, previous)?;
        self.create_gate_app(GateId::FIRST_AID, &rkey, &mkey)?;
        self.write_encrypted_master_file(km, identity, false)?;
        Ok(tid)
    }

    /// Enroll this card for gate `g`: ensure the gate application, install
    /// the per-card slot key, seal the identity into the gate file.
    ///
    /// `identity` must match the master file; a mismatch is
    /// [`Error::Parameter`].
    pub fn enroll_gate(
        &mut self,
        km: &KeyPair,
        g: &GateConfig,
        identity: &Identity,
    ) -> Result<TokenId> {
        let (master_identity, tid) = self.read_encrypted_master_file(km, true, true)?;
        if master_identity != *identity {
            warn!("identity does not match the deployed master file");
            return Err(Error::Parameter);
        }
        let rkey = km.derive_token_root_key(tid);
        let mkey = km.derive_gate_app_master_key(tid, g.id);
        self.ensure_gate_app(g.id.app(), &rkey, &mkey)?;
        let key = g.base_key.derive_token_key(tid, g.id);
        self.enroll_gate_key(g.id, &mkey, &key, false)?;
        self.write_encrypted_gate_file(km, g, identity, false)?;
        Ok(tid)
    }

    /// Undo [`MemberToken::enroll_gate`]: reset the slot key and drop the
    /// gate file. Absence of either is tolerated.
    pub fn unenroll_gate(&mut self, km: &KeyPair, g: &GateConfig) -> Result<()> {
        let tid = self.id()?;
        match self.card.select_application(g.id.app()) {
            Err(Error::AppNotFound) => return Ok(()),
            Err(e) => return Err(e),
            Ok(()) => {}
        }
        let mkey = km.derive_gate_app_master_key(tid, g.id);
        let key = g.base_key.derive_token_key(tid, g.id);
        self.unenroll_gate_key(g.id, &mkey, &key, false)?;
        self.delete_gate_file(g.id, &mkey, false)?;
        Ok(())
    }

    /// Whether the gate application and file of `gid` exist.
    pub fn is_gate_enrolled(
        &mut self,
        gid: GateId,
        check_app: bool,
        check_file: bool,
    ) -> Result<bool> {
        if !gid.is_valid() {
            return Err(Error::Parameter);
        }
        let (aid, fid) = gid.app_and_file();
        self.is_file_present(aid, fid, gid.key_no(), check_app, check_file)
    }

    /// Whether the master application and master file exist.
    pub fn is_master_enrolled(&mut self, check_app: bool, check_file: bool) -> Result<bool> {
        self.is_file_present(GateId::FIRST_AID, 0, 0, check_app, check_file)
    }

    /// Full depth verification of one gate enrollment: reads the master
    /// identity and blind-checks the gate file against it.
    pub fn is_gate_enrolled_correctly(
        &mut self,
        km: &KeyPair,
        g: &GateConfig,
    ) -> Result<(bool, TokenId)> {
        let (master_identity, _) = self.read_encrypted_master_file(km, true, true)?;
        self.check_encrypted_gate_file(km, g, &master_identity, true, true)
    }

    /// Full depth verification of the deployment: root key and settings,
    /// master application and file, decryptable master identity.
    pub fn is_deployed_correctly(&mut self, km: &KeyPair) -> Result<TokenId> {
        let tid = self.id()?;
        let rkey = km.derive_token_root_key(tid);
        if !self.check_root(&rkey)? {
            return Err(Error::PiccIntegrity);
        }
        let (identity, tid) = self.read_encrypted_master_file(km, true, true)?;
        if identity.id != tid {
            return Err(Error::Malformed);
        }
        Ok(tid)
    }

    /// All gates with an application and file on this card.
    ///
    /// Listing the application directory requires root access. Shapes that
    /// fail the optional cascade checks are skipped with a warning rather
    /// than aborting the walk.
    pub fn list_gates(
        &mut self,
        rkey: &TokenRootKey,
        check_app: bool,
        check_file: bool,
    ) -> Result<Vec<GateId>> {
        self.card.select_application(ROOT_APP)?;
        self.card.authenticate(&rkey.0.into())?;
        let aids: Vec<AppId> = self
            .card
            .get_application_ids()?
            .into_iter()
            .filter(|aid| GateId::is_gate_app(*aid))
            .collect();
        let mut gates = Vec::new();
        for aid in aids {
            if check_app && !self.check_gate_app(aid)? {
                warn!("skipping gate app {aid} with incorrect settings");
                continue;
            }
            self.card.select_application(aid)?;
            for fid in self.card.get_file_ids()? {
                let Some(gid) = GateId::from_app_and_file(aid, fid) else {
                    continue;
                };
                if check_file && !self.check_file_shape(fid, gid.key_no())? {
                    warn!("skipping gate file {fid} of app {aid} with incorrect settings");
                    continue;
                }
                gates.push(gid);
            }
        }
        gates.sort();
        Ok(gates)
    }

    /// Select `aid`, optionally insisting it passes the gate app check.
    fn enter_app(&mut self, aid: AppId, check_app: bool) -> Result<()> {
        if check_app {
            if !self.check_gate_app(aid)? {
                return Err(Error::AppIntegrity);
            }
            Ok(())
        } else {
            self.card.select_application(aid)
        }
    }

    /// Shape predicate of the file `fid` in the selected application.
    fn check_file_shape(&mut self, fid: u8, key_no: u8) -> Result<bool> {
        match self.card.get_file_settings(fid)? {
            FileSettings::Standard(s) => Ok(s.security == CommMode::Ciphered
                && s.rights == AccessRights::read_only_by(key_no)),
            FileSettings::Other => Ok(false),
        }
    }

    fn read_file_raw(
        &mut self,
        aid: AppId,
        fid: u8,
        key_no: u8,
        key: &AnyKey,
        check_app: bool,
        check_file: bool,
    ) -> Result<Vec<u8>> {
        self.enter_app(aid, check_app)?;
        if check_file && !self.check_file_shape(fid, key_no)? {
            return Err(Error::FileIntegrity);
        }
        self.card.authenticate(key)?;
        self.card.read_data(fid, CommMode::Ciphered)
    }

    fn write_file_raw(
        &mut self,
        aid: AppId,
        fid: u8,
        key_no: u8,
        mkey: &GateAppMasterKey,
        data: &[u8],
        check_app: bool,
    ) -> Result<()> {
        self.enter_app(aid, check_app)?;
        self.card.authenticate(&mkey.0.into())?;
        match self.card.delete_file(fid) {
            Ok(()) | Err(Error::FileNotFound) => {}
            Err(e) => return Err(e),
        }
        self.card
            .create_file(fid, file_settings_at_creation(key_no, data.len() as u32))?;
        self.card.write_data(fid, data, CommMode::Ciphered)?;
        self.card
            .change_file_settings(fid, file_settings(key_no, data.len() as u32))?;
        // Drop the authentication on the way out.
        self.card.select_application(aid)
    }

    fn is_file_present(
        &mut self,
        aid: AppId,
        fid: u8,
        key_no: u8,
        check_app: bool,
        check_file: bool,
    ) -> Result<bool> {
        match self.card.select_application(aid) {
            Err(Error::AppNotFound) => return Ok(false),
            Err(e) => return Err(e),
            Ok(()) => {}
        }
        if check_app && !self.check_gate_app(aid)? {
            return Err(Error::AppIntegrity);
        }
        match self.card.get_file_settings(fid) {
            Err(Error::FileNotFound) => Ok(false),
            Err(e) => Err(e),
            Ok(FileSettings::Standard(s)) => {
                if check_file
                    && !(s.security == CommMode::Ciphered
                        && s.rights == AccessRights::read_only_by(key_no))
                {
                    return Err(Error::FileIntegrity);
                }
                Ok(true)
            }
            Ok(FileSettings::Other) => {
                if check_file {
                    Err(Error::FileIntegrity)
                } else {
                    Ok(true)
                }
            }
        }
    }
}
