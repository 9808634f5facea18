//! Portcullis — access control over DESFire-family contactless cards
//!
//! Three roles cooperate in this library. A *keymaker* is the administrative
//! device: it owns a long lived curve25519 key pair from which every card
//! level key is derived, it deploys *member tokens* (the cards people carry)
//! and it commissions *gates* (the door controllers). A gate, once
//! registered to a keymaker, can authenticate a presented token on its own,
//! using nothing but its per-installation base key and its own key pair.
//!
//! The crate is laid out as a protocol stack, one module per layer:
//!
//! * [`keys`] is the key algebra: one secret begets all card keys.
//! * [`identity`] is the cardholder identity with its canonical form.
//! * [`card`] is the contract a DESFire-like card driver must satisfy; the
//!   rest of the crate speaks only these verbs, never controller bytes.
//! * [`token`] implements the on-card data model and the composite
//!   operations (deploy, enroll, verify) over any [`card::CardInterface`].
//! * [`channel`] is the mutually authenticated secure channel between a
//!   keymaker and a gate, over any half-duplex packet transport.
//! * [`rpc`] is the signature-typed RPC bridge running on such a channel.
//! * [`gate`] and [`keymaker`] are the two endpoints of the commissioning
//!   protocol, plus the gate side authentication responder.
//! * [`storage`] and [`ota`] cover persistence shapes and firmware update
//!   metadata.

pub mod card;
pub mod channel;
pub mod device;
pub mod gate;
pub mod identity;
pub mod keymaker;
pub mod keys;
pub mod ota;
pub mod rpc;
pub mod storage;
pub mod token;
pub mod wire;

/// The unique, factory assigned identifier of a member token.
///
/// Seven bytes, as reported by the card's anticollision UID. Every key in
/// the system is derived from a secret *and* a token id, so two cards never
/// share a key.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TokenId(pub [u8; 7]);

impl TokenId {
    /// Pack into a 64 bit integer, high byte zero, big-endian.
    ///
    /// This is the form used as the sub-key counter of the key derivation
    /// function.
    pub fn pack(&self) -> u64 {
        self.0.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
    }

    /// Build a token id from a scanned NFC id of any length.
    ///
    /// Ids shorter than 7 bytes are zero padded, longer ones truncated. Real
    /// DESFire UIDs are exactly 7 bytes, anything else is logged.
    pub fn from_nfc_id(d: &[u8]) -> Self {
        if d.len() != 7 {
            log::warn!("NFC id should be 7 bytes long, not {}", d.len());
        }
        let mut id = [0u8; 7];
        let n = d.len().min(7);
        id[..n].copy_from_slice(&d[..n]);
        TokenId(id)
    }
}

impl From<[u8; 7]> for TokenId {
    fn from(raw: [u8; 7]) -> Self {
        TokenId(raw)
    }
}

impl core::fmt::Display for TokenId {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// A card application identifier, 3 bytes, big-endian when packed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AppId(pub [u8; 3]);

/// The root (PICC level) application.
pub const ROOT_APP: AppId = AppId([0, 0, 0]);

impl AppId {
    pub fn pack(&self) -> u32 {
        (u32::from(self.0[0]) << 16) | (u32::from(self.0[1]) << 8) | u32::from(self.0[2])
    }

    pub const fn unpack(aid: u32) -> Self {
        AppId([(aid >> 16) as u8, (aid >> 8) as u8, aid as u8])
    }
}

impl core::fmt::Display for AppId {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// A file identifier within a card application.
pub type FileId = u8;

/// Identifies one gate (door controller) installation.
///
/// Gate ids map bijectively onto a `(application id, file id)` pair on the
/// card. Following the Mifare application directory conventions, the first
/// nibble of the application id is locked to `F` and the functional cluster
/// code for access control is `0x51..=0x54`; within that window every
/// application hosts [`GateId::GATES_PER_APP`] gates, one per file and key
/// slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GateId(u32);

impl GateId {
    /// First application id of the gate window (inclusive).
    pub const AID_RANGE_BEGIN: u32 = 0xf5_1000;
    /// End of the gate window (exclusive).
    pub const AID_RANGE_END: u32 = 0xf5_5000;
    /// Gates stored in a single application, one per non-master key slot.
    pub const GATES_PER_APP: u32 = 13;

    /// Application hosting the master file (file 0).
    pub const FIRST_AID: AppId = AppId([0xf5, 0x10, 0x00]);

    /// Number of representable gates.
    pub const COUNT: u32 = (Self::AID_RANGE_END - Self::AID_RANGE_BEGIN) * Self::GATES_PER_APP;

    /// The "no gate" sentinel; maps outside the gate application window.
    pub const NONE: GateId = GateId(u32::MAX);

    pub const fn new(idx: u32) -> Self {
        GateId(idx)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    /// Whether this id denotes an actual gate slot.
    pub const fn is_valid(self) -> bool {
        self.0 < Self::COUNT
    }

    /// The `(application, file)` pair this gate occupies on a card.
    pub const fn app_and_file(self) -> (AppId, FileId) {
        (
            AppId::unpack(Self::AID_RANGE_BEGIN + self.0 / Self::GATES_PER_APP),
            (1 + self.0 % Self::GATES_PER_APP) as FileId,
        )
    }

    pub const fn app(self) -> AppId {
        self.app_and_file().0
    }

    pub const fn file(self) -> FileId {
        self.app_and_file().1
    }

    /// The key slot with exclusive read access to this gate's file.
    ///
    /// Coincides with the file id; key number 0 is always the application
    /// master.
    pub const fn key_no(self) -> u8 {
        self.file()
    }

    /// Whether `aid` lies within the gate application window.
    pub fn is_gate_app(aid: AppId) -> bool {
        let n = aid.pack();
        (Self::AID_RANGE_BEGIN..Self::AID_RANGE_END).contains(&n)
    }

    /// Whether `(aid, fid)` is a gate application and a gate file slot.
    pub fn is_gate_app_and_file(aid: AppId, fid: FileId) -> bool {
        Self::is_gate_app(aid) && fid > 0 && u32::from(fid) <= Self::GATES_PER_APP
    }

    /// Reverse of [`GateId::app_and_file`].
    pub fn from_app_and_file(aid: AppId, fid: FileId) -> Option<GateId> {
        if !Self::is_gate_app_and_file(aid, fid) {
            return None;
        }
        let n = aid.pack();
        Some(GateId(
            (n - Self::AID_RANGE_BEGIN) * Self::GATES_PER_APP + u32::from(fid) - 1,
        ))
    }
}

impl core::fmt::Display for GateId {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        if *self == GateId::NONE {
            write!(f, "gate <none>")
        } else {
            write!(f, "gate {}", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_id_packs_big_endian() {
        let id = TokenId([0xa1, 0xb2, 0xc3, 0xd4, 0xe5, 0xf6, 0x07]);
        assert_eq!(id.pack(), 0x00a1_b2c3_d4e5_f607);
        assert_eq!(TokenId([0; 7]).pack(), 0);
    }

    #[test]
    fn token_id_from_odd_nfc_ids() {
        assert_eq!(
            TokenId::from_nfc_id(&[1, 2, 3]),
            TokenId([1, 2, 3, 0, 0, 0, 0])
        );
        assert_eq!(
            TokenId::from_nfc_id(&[1, 2, 3, 4, 5, 6, 7, 8]),
            TokenId([1, 2, 3, 4, 5, 6, 7])
        );
    }

    #[test]
    fn gate_id_app_and_file_round_trip() {
        for idx in [0u32, 1, 12, 13, 14, 200, GateId::COUNT - 1] {
            let gid = GateId::new(idx);
            let (aid, fid) = gid.app_and_file();
            assert!(GateId::is_gate_app(aid), "{gid} app out of window");
            assert_eq!(GateId::from_app_and_file(aid, fid), Some(gid));
        }
    }

    #[test]
    fn gate_id_zero_maps_to_first_aid() {
        let gid = GateId::new(0);
        assert_eq!(gid.app(), GateId::FIRST_AID);
        assert_eq!(gid.file(), 1);
        assert_eq!(gid.key_no(), 1);
    }

    #[test]
    fn gate_id_thirteen_rolls_to_next_app() {
        let gid = GateId::new(13);
        assert_eq!(gid.app(), AppId([0xf5, 0x10, 0x01]));
        assert_eq!(gid.file(), 1);
    }

    #[test]
    fn gate_id_boundaries() {
        // The last valid id lands on the last file of the last app in the
        // window, one past it maps outside.
        let last = GateId::new(GateId::COUNT - 1);
        let (aid, fid) = last.app_and_file();
        assert_eq!(aid, AppId([0xf5, 0x4f, 0xff]));
        assert_eq!(u32::from(fid), GateId::GATES_PER_APP);
        assert!(GateId::is_gate_app_and_file(aid, fid));

        let past = GateId::new(GateId::COUNT);
        assert!(!past.is_valid());
        assert!(!GateId::is_gate_app(past.app()));

        assert!(!GateId::NONE.is_valid());
        assert!(!GateId::is_gate_app(GateId::NONE.app()));
    }

    #[test]
    fn gate_file_ids_never_touch_the_master_file() {
        for idx in 0..100 {
            assert_ne!(GateId::new(idx).file(), 0);
        }
    }

    #[test]
    fn non_gate_apps_are_rejected() {
        assert!(!GateId::is_gate_app(ROOT_APP));
        assert!(!GateId::is_gate_app(AppId([0xf5, 0x0f, 0xff])));
        assert!(!GateId::is_gate_app(AppId([0xf5, 0x50, 0x00])));
        assert_eq!(GateId::from_app_and_file(GateId::FIRST_AID, 0), None);
        assert_eq!(GateId::from_app_and_file(GateId::FIRST_AID, 14), None);
    }
}
