//! The keymaker device
//!
//! The keymaker owns the master key pair. It keeps one record per gate it
//! ever issued an id to, commissions gates over the secure channel through
//! [`RemoteGate`], and runs the card lifecycle (deploy, enroll, verify)
//! against a card handle.

use crate::card::{self, AnyKey, CardInterface};
use crate::device::{Device, UpdateConfig, UpdateStatus, WifiStatus};
use crate::gate::{GateError, GpioConfig, RegistrationInfo};
use crate::identity::Identity;
use crate::keys::{GateBaseKey, KeyPair, PublicKey};
use crate::ota::{FwInfo, ReleaseInfo};
use crate::rpc::{self, Bridge};
use crate::storage::{self, Namespace};
use crate::token::{GateConfig, MemberToken};
use crate::wire::{ArgList, Stream, StreamError, TransferFormat};
use crate::{GateId, TokenId};

use log::{info, warn};

/// Lifecycle state of a gate record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateStatus {
    /// An id was handed out but no gate was commissioned yet.
    Initialized,
    /// A gate answered `register_gate` and returned its base key.
    Configured,
    /// The gate was decommissioned; the id is never reused.
    Deleted,
    /// The record could not be restored from storage.
    Unknown,
}

impl GateStatus {
    fn code(self) -> u8 {
        match self {
            GateStatus::Initialized => 0,
            GateStatus::Configured => 1,
            GateStatus::Deleted => 2,
            GateStatus::Unknown => 3,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(GateStatus::Initialized),
            1 => Some(GateStatus::Configured),
            2 => Some(GateStatus::Deleted),
            3 => Some(GateStatus::Unknown),
            _ => None,
        }
    }
}

impl core::fmt::Display for GateStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            GateStatus::Initialized => write!(f, "initialized"),
            GateStatus::Configured => write!(f, "configured"),
            GateStatus::Deleted => write!(f, "deleted"),
            GateStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// One gate as the keymaker remembers it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateRecord {
    pub id: GateId,
    pub status: GateStatus,
    pub pk: PublicKey,
    pub base_key: GateBaseKey,
    pub notes: String,
}

impl GateRecord {
    fn fresh(id: GateId, notes: String) -> Self {
        GateRecord {
            id,
            status: GateStatus::Initialized,
            pk: PublicKey::default(),
            base_key: GateBaseKey([0; 32]),
            notes,
        }
    }

    /// The storage key of one record: the 8 hex digit gate id.
    pub fn storage_key(id: GateId) -> String {
        format!("{:08x}", id.value())
    }

    pub fn save_to(&self, ns: &mut dyn Namespace) -> storage::Result<()> {
        storage::set_encode_blob(ns, &Self::storage_key(self.id), self)?;
        ns.commit()
    }

    pub fn load_from(ns: &dyn Namespace, id: GateId) -> storage::Result<GateRecord> {
        storage::get_parse_blob(ns, &Self::storage_key(id))
    }

    /// Restore every record, walking ids from zero until the first gap.
    /// A damaged record keeps its slot with [`GateStatus::Unknown`].
    pub fn load_all(ns: &dyn Namespace) -> Vec<GateRecord> {
        let mut records = Vec::new();
        for idx in 0..GateId::COUNT {
            let id = GateId::new(idx);
            match GateRecord::load_from(ns, id) {
                Ok(record) => records.push(record),
                Err(storage::Error::NotFound) => break,
                Err(e) => {
                    warn!("cannot restore gate {id}: {e}");
                    records.push(GateRecord {
                        status: GateStatus::Unknown,
                        ..GateRecord::fresh(id, String::new())
                    });
                }
            }
        }
        records
    }
}

impl TransferFormat for GateRecord {
    const TYPE_NAME: &'static str = "gate_record";

    fn read_from(s: &mut Stream<'_>) -> Result<Self, StreamError> {
        let id = GateId::read_from(s)?;
        let status = GateStatus::from_code(u8::read_from(s)?).ok_or(StreamError::Invalid)?;
        let pk = PublicKey::read_from(s)?;
        let base_key = GateBaseKey::read_from(s)?;
        let notes_len = u32::read_from(s)? as usize;
        let notes =
            String::from_utf8(s.take(notes_len)?.to_vec()).map_err(|_| StreamError::Invalid)?;
        Ok(GateRecord {
            id,
            status,
            pk,
            base_key,
            notes,
        })
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        self.id.write_to(out);
        self.status.code().write_to(out);
        self.pk.write_to(out);
        self.base_key.write_to(out);
        (self.notes.len() as u32).write_to(out);
        out.extend_from_slice(self.notes.as_bytes());
    }
}

/// A client-side failure: either the RPC machinery broke, or the gate
/// answered with a protocol error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientError {
    Rpc(rpc::Error),
    Gate(GateError),
}

impl core::fmt::Display for ClientError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            ClientError::Rpc(e) => write!(f, "{e}"),
            ClientError::Gate(e) => write!(f, "{e}"),
        }
    }
}

impl From<rpc::Error> for ClientError {
    fn from(e: rpc::Error) -> Self {
        ClientError::Rpc(e)
    }
}

impl From<GateError> for ClientError {
    fn from(e: GateError) -> Self {
        ClientError::Gate(e)
    }
}

/// Collapse the two error layers of a remote call.
pub fn flatten<T>(r: rpc::Result<Result<T, GateError>>) -> Result<T, ClientError> {
    match r {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(ClientError::Gate(e)),
        Err(e) => Err(ClientError::Rpc(e)),
    }
}

/// Client stub for the protocol v0 surface of one connected gate.
///
/// Wraps a bridge whose transport already ran the secure handshake; the
/// authenticated peer key doubles as the gate's identity.
pub struct RemoteGate {
    bridge: Bridge,
    peer_pk: PublicKey,
}

impl RemoteGate {
    pub fn new(bridge: Bridge, peer_pk: PublicKey) -> Self {
        RemoteGate { bridge, peer_pk }
    }

    pub fn peer_pub_key(&self) -> PublicKey {
        self.peer_pk
    }

    fn invoke<As, R>(&mut self, name: &str, args: As) -> rpc::Result<R>
    where
        As: ArgList,
        R: TransferFormat,
    {
        let uuid = rpc::signature_string(name, As::TYPE_NAMES, R::TYPE_NAME);
        self.bridge.remote_invoke(&uuid, args)
    }

    pub fn hello(&mut self) -> rpc::Result<()> {
        self.invoke("hello", ())
    }

    /// End the gate's serve loop.
    pub fn bye(&mut self) -> rpc::Result<()> {
        self.invoke("bye", ())
    }

    pub fn get_fw_info(&mut self) -> rpc::Result<FwInfo> {
        self.invoke("get_fw_info", ())
    }

    pub fn get_update_settings(&mut self) -> rpc::Result<UpdateConfig> {
        self.invoke("get_update_settings", ())
    }

    pub fn get_wifi_status(&mut self) -> rpc::Result<WifiStatus> {
        self.invoke("get_wifi_status", ())
    }

    pub fn get_registration_info(&mut self) -> rpc::Result<RegistrationInfo> {
        self.invoke("get_registration_info", ())
    }

    pub fn get_backend_url(&mut self) -> rpc::Result<String> {
        self.invoke("get_backend_url", ())
    }

    pub fn get_gpio_config(&mut self) -> rpc::Result<GpioConfig> {
        self.invoke("get_gpio_config", ())
    }

    pub fn is_updating(&mut self) -> rpc::Result<UpdateStatus> {
        self.invoke("is_updating", ())
    }

    pub fn check_for_updates(&mut self) -> rpc::Result<Result<ReleaseInfo, GateError>> {
        self.invoke("check_for_updates", ())
    }

    pub fn register_gate(&mut self, id: GateId) -> rpc::Result<Result<GateBaseKey, GateError>> {
        self.invoke("register_gate", (id,))
    }

    pub fn reset_gate(&mut self) -> rpc::Result<Result<(), GateError>> {
        self.invoke("reset_gate", ())
    }

    pub fn set_update_settings(
        &mut self,
        channel: &str,
        auto: bool,
    ) -> rpc::Result<Result<(), GateError>> {
        self.invoke("set_update_settings", (channel.to_string(), auto))
    }

    pub fn update_now(&mut self) -> rpc::Result<Result<ReleaseInfo, GateError>> {
        self.invoke("update_now", ())
    }

    pub fn update_manually(&mut self, url: &str) -> rpc::Result<Result<(), GateError>> {
        self.invoke("update_manually", (url.to_string(),))
    }

    pub fn connect_wifi(
        &mut self,
        ssid: &str,
        password: &str,
    ) -> rpc::Result<Result<bool, GateError>> {
        self.invoke("connect_wifi", (ssid.to_string(), password.to_string()))
    }

    pub fn set_backend_url(
        &mut self,
        url: &str,
        api_key: &str,
    ) -> rpc::Result<Result<(), GateError>> {
        self.invoke("set_backend_url", (url.to_string(), api_key.to_string()))
    }

    pub fn set_gpio_config(&mut self, cfg: GpioConfig) -> rpc::Result<Result<(), GateError>> {
        self.invoke("set_gpio_config", (cfg,))
    }

    pub fn restart_gate(&mut self) -> rpc::Result<Result<(), GateError>> {
        self.invoke("restart_gate", ())
    }
}

pub struct Keymaker {
    device: Device,
    gates: Vec<GateRecord>,
}

impl Keymaker {
    pub fn new(device: Device) -> Self {
        Keymaker {
            device,
            gates: Vec::new(),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut Device {
        &mut self.device
    }

    pub fn keys(&self) -> &KeyPair {
        self.device.keys()
    }

    pub fn public_key(&self) -> PublicKey {
        self.device.public_key()
    }

    /// The NFCID the keymaker fabricates for DEP activation, from its own
    /// public key (gates do the same with theirs).
    pub fn nfc_id(&self) -> [u8; 10] {
        let mut id = [0u8; 10];
        id.copy_from_slice(&self.device.public_key().as_bytes()[..10]);
        id
    }

    pub fn restore_gates(&mut self, ns: &dyn Namespace) {
        self.gates = GateRecord::load_all(ns);
    }

    pub fn gates(&self) -> &[GateRecord] {
        &self.gates
    }

    pub fn gate_record(&self, id: GateId) -> Option<&GateRecord> {
        self.gates.get(id.value() as usize)
    }

    pub fn gate_status(&self, id: GateId) -> GateStatus {
        self.gate_record(id)
            .map(|r| r.status)
            .unwrap_or(GateStatus::Unknown)
    }

    /// The enrollment material of a configured gate.
    pub fn gate_config(&self, id: GateId) -> Option<GateConfig> {
        let record = self.gate_record(id)?;
        if record.status != GateStatus::Configured {
            return None;
        }
        Some(GateConfig {
            id: record.id,
            gate_pk: record.pk,
            base_key: record.base_key,
        })
    }

    /// Hand out the next gate id. The gate itself is commissioned later
    /// with [`Keymaker::configure_gate`].
    pub fn gate_add(&mut self, notes: String, ns: Option<&mut dyn Namespace>) -> GateId {
        let id = GateId::new(self.gates.len() as u32);
        self.gates.push(GateRecord::fresh(id, notes));
        if let Some(ns) = ns {
            if let Err(e) = self.gates.last().expect("just pushed").save_to(ns) {
                warn!("cannot persist gate {id}: {e}");
            }
        }
        info!("issued {id}");
        id
    }

    pub fn set_gate_notes(
        &mut self,
        id: GateId,
        notes: String,
        ns: Option<&mut dyn Namespace>,
    ) -> bool {
        let Some(record) = self.gates.get_mut(id.value() as usize) else {
            return false;
        };
        record.notes = notes;
        if let Some(ns) = ns {
            if let Err(e) = record.save_to(ns) {
                warn!("cannot persist gate {id}: {e}");
            }
        }
        true
    }

    /// Probe who a connected gate belongs to: its id (sentinel when
    /// unconfigured) and whether it is registered to *this* keymaker.
    pub fn identify_gate(&self, rg: &mut RemoteGate) -> Result<(GateId, bool), ClientError> {
        let reg_info = rg.get_registration_info()?;
        if reg_info.id == GateId::NONE {
            info!("this gate is not configured");
            return Ok((GateId::NONE, false));
        }
        let ours = reg_info.keymaker_pk == self.public_key();
        info!(
            "this gate is configured as {} with {} keymaker",
            reg_info.id,
            if ours { "this" } else { "another" }
        );
        Ok((reg_info.id, ours))
    }

    /// Commission the connected gate under the previously issued `id`.
    pub fn configure_gate(
        &mut self,
        id: GateId,
        rg: &mut RemoteGate,
        ns: Option<&mut dyn Namespace>,
    ) -> Result<(), ClientError> {
        let Some(record) = self.gate_record(id) else {
            return Err(ClientError::Gate(GateError::InvalidArgument));
        };
        if record.status != GateStatus::Initialized {
            warn!("gate {id} status is {}", record.status);
            return Err(ClientError::Gate(GateError::InvalidOperation));
        }
        reject_configured(self.identify_gate(rg)?)?;
        let base_key = flatten(rg.register_gate(id))?;
        let record = self
            .gates
            .get_mut(id.value() as usize)
            .expect("record just looked up");
        record.pk = rg.peer_pub_key();
        record.base_key = base_key;
        record.status = GateStatus::Configured;
        if let Some(ns) = ns {
            if let Err(e) = record.save_to(ns) {
                warn!("cannot persist gate {id}: {e}");
            }
        }
        info!("gate {id} configured");
        Ok(())
    }

    /// Decommission a gate: reset the connected device and mark the record
    /// deleted. A never-configured record is deleted locally without a
    /// gate in reach.
    pub fn remove_gate(
        &mut self,
        id: GateId,
        rg: Option<&mut RemoteGate>,
        ns: Option<&mut dyn Namespace>,
    ) -> Result<(), ClientError> {
        let Some(record) = self.gate_record(id) else {
            return Err(ClientError::Gate(GateError::InvalidArgument));
        };
        match record.status {
            GateStatus::Deleted => return Ok(()),
            GateStatus::Configured => {
                let Some(rg) = rg else {
                    return Err(ClientError::Gate(GateError::InvalidOperation));
                };
                if rg.peer_pub_key() != record.pk {
                    warn!("connected gate has a different public key than {id}");
                    return Err(ClientError::Gate(GateError::InvalidOperation));
                }
                expect_gid(reject_not_ours(self.identify_gate(rg)?, false)?, id)?;
                flatten(rg.reset_gate())?;
            }
            GateStatus::Initialized | GateStatus::Unknown => {
                warn!("gate {id} was never configured");
            }
        }
        let record = self
            .gates
            .get_mut(id.value() as usize)
            .expect("record just looked up");
        record.status = GateStatus::Deleted;
        if let Some(ns) = ns {
            if let Err(e) = record.save_to(ns) {
                warn!("cannot persist gate {id}: {e}");
            }
        }
        Ok(())
    }

    /// Change a connected gate's update settings. Allowed on our own gates
    /// and on unconfigured ones.
    pub fn gate_set_update_settings(
        &self,
        rg: &mut RemoteGate,
        channel: &str,
        auto: bool,
    ) -> Result<(), ClientError> {
        reject_not_ours(self.identify_gate(rg)?, true)?;
        flatten(rg.set_update_settings(channel, auto))
    }

    /// Hand Wi-Fi credentials to a connected gate.
    pub fn gate_connect_wifi(
        &self,
        rg: &mut RemoteGate,
        ssid: &str,
        password: &str,
    ) -> Result<bool, ClientError> {
        reject_not_ours(self.identify_gate(rg)?, true)?;
        flatten(rg.connect_wifi(ssid, password))
    }

    /// Change the authentication action of one of our gates.
    pub fn gate_set_gpio_config(
        &self,
        rg: &mut RemoteGate,
        cfg: GpioConfig,
    ) -> Result<(), ClientError> {
        reject_not_ours(self.identify_gate(rg)?, false)?;
        flatten(rg.set_gpio_config(cfg))
    }

    /// Reboot a connected gate of ours.
    pub fn gate_restart(&self, rg: &mut RemoteGate) -> Result<(), ClientError> {
        reject_not_ours(self.identify_gate(rg)?, true)?;
        flatten(rg.restart_gate())
    }

    /// Wipe and deploy a presented card for `holder` / `publisher`.
    pub fn deploy_token<C: CardInterface>(
        &self,
        card: &mut C,
        holder: &str,
        publisher: &str,
        previous: Option<&AnyKey>,
    ) -> card::Result<TokenId> {
        let mut token = MemberToken::new(card);
        let tid = token.id()?;
        let identity = Identity {
            id: tid,
            holder: holder.to_string(),
            publisher: publisher.to_string(),
        };
        token.deploy(self.device.keys(), &identity, previous)
    }

    /// Enroll a presented card for one of our configured gates.
    pub fn enroll_token_gate<C: CardInterface>(
        &self,
        card: &mut C,
        id: GateId,
        holder: &str,
        publisher: &str,
    ) -> card::Result<TokenId> {
        let Some(cfg) = self.gate_config(id) else {
            warn!("gate {id} is not configured");
            return Err(card::Error::Parameter);
        };
        let mut token = MemberToken::new(card);
        let tid = token.id()?;
        let identity = Identity {
            id: tid,
            holder: holder.to_string(),
            publisher: publisher.to_string(),
        };
        token.enroll_gate(self.device.keys(), &cfg, &identity)
    }

    pub fn unenroll_token_gate<C: CardInterface>(
        &self,
        card: &mut C,
        id: GateId,
    ) -> card::Result<()> {
        let Some(record) = self.gate_record(id) else {
            warn!("gate {id} is unknown");
            return Err(card::Error::Parameter);
        };
        let cfg = GateConfig {
            id: record.id,
            gate_pk: record.pk,
            base_key: record.base_key,
        };
        MemberToken::new(card).unenroll_gate(self.device.keys(), &cfg)
    }

    /// Full depth deployment check of a presented card.
    pub fn is_token_deployed<C: CardInterface>(&self, card: &mut C) -> card::Result<TokenId> {
        MemberToken::new(card).is_deployed_correctly(self.device.keys())
    }

    /// Full depth enrollment check of a presented card for one gate.
    pub fn is_token_enrolled<C: CardInterface>(
        &self,
        card: &mut C,
        id: GateId,
    ) -> card::Result<bool> {
        let Some(cfg) = self.gate_config(id) else {
            return Err(card::Error::Parameter);
        };
        let mut token = MemberToken::new(card);
        if !token.is_gate_enrolled(id, true, true)? {
            return Ok(false);
        }
        let (ok, _) = token.is_gate_enrolled_correctly(self.device.keys(), &cfg)?;
        Ok(ok)
    }

    /// The sealed identity of a presented card.
    pub fn token_identity<C: CardInterface>(&self, card: &mut C) -> card::Result<Identity> {
        let (identity, _) =
            MemberToken::new(card).read_encrypted_master_file(self.device.keys(), true, true)?;
        Ok(identity)
    }
}

fn reject_not_ours(
    probe: (GateId, bool),
    accept_unconfigured: bool,
) -> Result<(GateId, bool), ClientError> {
    let (id, ours) = probe;
    if !ours && (!accept_unconfigured || id != GateId::NONE) {
        warn!("this gate is not ours");
        return Err(ClientError::Gate(GateError::Unauthorized));
    }
    Ok(probe)
}

fn reject_configured(probe: (GateId, bool)) -> Result<(GateId, bool), ClientError> {
    if probe.0 != GateId::NONE {
        warn!("this gate is already configured");
        return Err(ClientError::Gate(GateError::InvalidOperation));
    }
    Ok(probe)
}

fn expect_gid(probe: (GateId, bool), id: GateId) -> Result<(GateId, bool), ClientError> {
    if probe.0 != id {
        warn!("this gate is {}, expected {id}", probe.0);
        return Err(ClientError::Gate(GateError::InvalidArgument));
    }
    Ok(probe)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::emulated::EmulatedCard;
    use crate::channel::{loopback, SecureInitiator, SecureTarget};
    use crate::gate::{self, Gate};
    use crate::rpc::{InitiatorBridge, TargetBridge};
    use crate::storage::MemNamespace;
    use hex_literal::hex;
    use std::sync::{Arc, Mutex};
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    const T: Duration = Duration::from_secs(5);
    const TOKEN: TokenId = TokenId([0xa1, 0xb2, 0xc3, 0xd4, 0xe5, 0xf6, 0x07]);

    fn keymaker() -> Keymaker {
        let kp = KeyPair::from_raw_secret(hex!(
            "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f"
        ))
        .unwrap();
        Keymaker::new(Device::detached(kp))
    }

    /// One commissioning session: handshake, serve thread on the gate side,
    /// client stub on the keymaker side.
    fn open_session(
        gate: Arc<Mutex<Gate>>,
        ns: Arc<Mutex<dyn Namespace + Send>>,
        km_keys: &KeyPair,
    ) -> (RemoteGate, JoinHandle<()>) {
        let (ini_raw, tgt_raw) = loopback::pair();
        let gate_keys = gate.lock().unwrap().keys().clone();
        let server = thread::spawn(move || {
            let mut sec = SecureTarget::new(tgt_raw, gate_keys);
            let peer_pk = sec.handshake(T).unwrap();
            let mut bridge = Bridge::new(Box::new(TargetBridge::new(sec)));
            gate::register_commands(&mut bridge, gate, ns, peer_pk).unwrap();
            bridge.serve_loop().unwrap();
        });
        let mut sec = SecureInitiator::new(ini_raw, km_keys.clone());
        let peer_pk = sec.handshake(T).unwrap();
        let bridge = Bridge::new(Box::new(InitiatorBridge::new(sec)));
        (RemoteGate::new(bridge, peer_pk), server)
    }

    #[test]
    fn commission_then_deploy_and_enroll_a_card() {
        let mut km = keymaker();
        let gate = Arc::new(Mutex::new(Gate::new(Device::detached(KeyPair::random()))));
        let gate_ns: Arc<Mutex<dyn Namespace + Send>> =
            Arc::new(Mutex::new(MemNamespace::new()));
        let mut km_ns = MemNamespace::new();

        let gid = km.gate_add("front door".to_string(), Some(&mut km_ns));
        assert_eq!(gid, GateId::new(0));
        assert_eq!(km.gate_status(gid), GateStatus::Initialized);

        let (mut rg, server) = open_session(gate.clone(), gate_ns.clone(), km.keys());
        assert_eq!(rg.peer_pub_key(), gate.lock().unwrap().device().public_key());
        assert_eq!(&km.nfc_id()[..], &km.public_key().as_bytes()[..10]);
        rg.hello().unwrap();
        km.configure_gate(gid, &mut rg, Some(&mut km_ns)).unwrap();
        rg.bye().unwrap();
        server.join().unwrap();

        assert_eq!(km.gate_status(gid), GateStatus::Configured);
        let record = km.gate_record(gid).unwrap();
        assert_eq!(record.pk, gate.lock().unwrap().device().public_key());
        assert_eq!(
            Some(record.base_key),
            gate.lock().unwrap().base_key()
        );

        // The registration reached the gate's storage too.
        {
            let ns = gate_ns.lock().unwrap();
            let mut restored = Gate::new(Device::detached(KeyPair::random()));
            restored.load_from(&*ns).unwrap();
            assert_eq!(restored.id(), gid);
            assert_eq!(restored.keymaker_pk(), Some(km.public_key()));
        }

        // Deploy a card and enroll it for the new gate.
        let mut card = EmulatedCard::new(TOKEN);
        assert_eq!(
            km.deploy_token(&mut card, "Holder", "Publisher", None).unwrap(),
            TOKEN
        );
        assert_eq!(km.is_token_deployed(&mut card).unwrap(), TOKEN);
        km.enroll_token_gate(&mut card, gid, "Holder", "Publisher")
            .unwrap();
        assert!(km.is_token_enrolled(&mut card, gid).unwrap());

        // The gate can now open the card on its own.
        let gate = gate.lock().unwrap();
        let registration_id = gate.id();
        let mut token = MemberToken::new(&mut card);
        let (identity, tid) = token
            .read_encrypted_gate_file(
                registration_id,
                &gate.base_key().unwrap(),
                gate.keys(),
                &gate.keymaker_pk().unwrap(),
                true,
                true,
            )
            .unwrap();
        assert_eq!(tid, TOKEN);
        assert_eq!(
            identity,
            Identity {
                id: TOKEN,
                holder: "Holder".to_string(),
                publisher: "Publisher".to_string(),
            }
        );

        // And the keymaker can take the enrollment back.
        drop(gate);
        km.unenroll_token_gate(&mut card, gid).unwrap();
        assert!(!km.is_token_enrolled(&mut card, gid).unwrap());
    }

    #[test]
    fn foreign_keymakers_are_rejected() {
        let km1 = keymaker();
        let km2 = Keymaker::new(Device::detached(KeyPair::from_password("foobar").unwrap()));
        let gate = Arc::new(Mutex::new(Gate::new(Device::detached(KeyPair::random()))));
        let ns: Arc<Mutex<dyn Namespace + Send>> = Arc::new(Mutex::new(MemNamespace::new()));

        // km1 takes the gate as gate 11.
        let (mut rg, server) = open_session(gate.clone(), ns.clone(), km1.keys());
        flatten(rg.register_gate(GateId::new(11))).unwrap();
        // Registering twice is an invalid operation even for the owner.
        assert_eq!(
            flatten(rg.register_gate(GateId::new(11))).unwrap_err(),
            ClientError::Gate(GateError::InvalidOperation)
        );
        rg.bye().unwrap();
        server.join().unwrap();

        // km2 can neither take over nor manage it.
        let (mut rg, server) = open_session(gate.clone(), ns.clone(), km2.keys());
        assert_eq!(
            flatten(rg.register_gate(GateId::new(12))).unwrap_err(),
            ClientError::Gate(GateError::InvalidOperation)
        );
        assert_eq!(
            flatten(rg.reset_gate()).unwrap_err(),
            ClientError::Gate(GateError::Unauthorized)
        );
        assert_eq!(
            flatten(rg.connect_wifi("foo", "bar")).unwrap_err(),
            ClientError::Gate(GateError::Unauthorized)
        );
        assert_eq!(
            flatten(rg.set_update_settings("foo", false)).unwrap_err(),
            ClientError::Gate(GateError::Unauthorized)
        );
        assert_eq!(
            flatten(rg.update_manually("https://dl/fw.bin")).unwrap_err(),
            ClientError::Gate(GateError::Unauthorized)
        );
        rg.bye().unwrap();
        server.join().unwrap();

        // km1 releases the gate; km2 may then register it.
        let (mut rg, server) = open_session(gate.clone(), ns.clone(), km1.keys());
        flatten(rg.reset_gate()).unwrap();
        rg.bye().unwrap();
        server.join().unwrap();

        let (mut rg, server) = open_session(gate.clone(), ns.clone(), km2.keys());
        flatten(rg.register_gate(GateId::new(11))).unwrap();
        rg.bye().unwrap();
        server.join().unwrap();

        assert_eq!(
            gate.lock().unwrap().keymaker_pk(),
            Some(km2.public_key())
        );
    }

    #[test]
    fn public_surface_and_owner_commands() {
        let _guard = gate::test_support::GPIO_TEST_LOCK.lock().unwrap();
        let km = keymaker();
        let gate = Arc::new(Mutex::new(Gate::new(Device::detached(KeyPair::random()))));
        let ns: Arc<Mutex<dyn Namespace + Send>> = Arc::new(Mutex::new(MemNamespace::new()));

        let (mut rg, server) = open_session(gate.clone(), ns.clone(), km.keys());

        // Public reads answer on an unconfigured gate.
        let fw = rg.get_fw_info().unwrap();
        assert_eq!(fw, *gate.lock().unwrap().device().fw_info());
        let update = rg.get_update_settings().unwrap();
        assert_eq!(
            update.update_channel,
            crate::device::DEFAULT_UPDATE_CHANNEL
        );
        assert!(!update.enable_automatic_update);
        let wifi = rg.get_wifi_status().unwrap();
        assert_eq!(wifi.ssid, "");
        assert!(!wifi.operational);
        assert_eq!(rg.get_backend_url().unwrap(), "");
        assert_eq!(rg.is_updating().unwrap().updating_from, None);
        let reg_info = rg.get_registration_info().unwrap();
        assert_eq!(reg_info.id, GateId::NONE);

        // The offline channel test refuses new update settings.
        assert_eq!(
            flatten(rg.set_update_settings("https://foo.bar", true)).unwrap_err(),
            ClientError::Gate(GateError::InvalidArgument)
        );
        // Polling the (offline) channel reports no release.
        assert!(flatten(rg.check_for_updates()).unwrap().is_none());
        // The backend link is reserved.
        assert_eq!(
            flatten(rg.set_backend_url("foo", "bar")).unwrap_err(),
            ClientError::Gate(GateError::InvalidOperation)
        );
        // A wild id is refused.
        assert_eq!(
            flatten(rg.register_gate(GateId::NONE)).unwrap_err(),
            ClientError::Gate(GateError::InvalidArgument)
        );
        // Owner commands on an unconfigured gate are invalid operations.
        assert_eq!(
            flatten(rg.reset_gate()).unwrap_err(),
            ClientError::Gate(GateError::InvalidOperation)
        );
        assert_eq!(
            flatten(rg.restart_gate()).unwrap_err(),
            ClientError::Gate(GateError::InvalidOperation)
        );
        // Wi-Fi credentials may be handed to an unconfigured gate.
        assert_eq!(flatten(rg.connect_wifi("attic", "pw")).unwrap(), false);
        assert_eq!(rg.get_wifi_status().unwrap().ssid, "attic");

        // Register, then exercise the owner surface.
        flatten(rg.register_gate(GateId::new(7))).unwrap();
        let reg_info = rg.get_registration_info().unwrap();
        assert_eq!(reg_info.id, GateId::new(7));
        assert_eq!(reg_info.keymaker_pk, km.public_key());
        assert_eq!(
            reg_info.gate_pk,
            gate.lock().unwrap().device().public_key()
        );

        let cfg = GpioConfig {
            gpio: 4,
            level: true,
            hold_time: Duration::from_millis(42),
        };
        km.gate_set_gpio_config(&mut rg, cfg).unwrap();
        assert_eq!(rg.get_gpio_config().unwrap(), cfg);

        flatten(rg.update_manually("https://dl/fw.bin")).unwrap();
        assert_eq!(
            rg.is_updating().unwrap().updating_from.as_deref(),
            Some("https://dl/fw.bin")
        );
        // Nothing on the offline channel to update to.
        assert!(flatten(rg.update_now()).unwrap().is_none());

        flatten(rg.restart_gate()).unwrap();
        assert!(gate.lock().unwrap().restart_requested());

        rg.bye().unwrap();
        server.join().unwrap();

        gate::gpio::set_global_config(GpioConfig::default());
    }

    #[test]
    fn gate_records_round_trip_and_reject_overruns() {
        let record = GateRecord {
            id: GateId::new(0x1234),
            status: GateStatus::Configured,
            pk: PublicKey::from([0xaa; 32]),
            base_key: GateBaseKey([0xbb; 32]),
            notes: "side entrance".to_string(),
        };
        let enc = crate::wire::encode(&record);
        // id(4 le) ‖ status(1) ‖ pk(32) ‖ base key(32) ‖ len32(notes) ‖ notes
        assert_eq!(&enc[..4], &[0x34, 0x12, 0, 0]);
        assert_eq!(enc[4], 1);
        assert_eq!(&enc[5..37], &[0xaa; 32]);
        assert_eq!(&enc[37..69], &[0xbb; 32]);
        assert_eq!(&enc[69..73], &[13, 0, 0, 0]);
        assert_eq!(&enc[73..], b"side entrance");
        assert_eq!(crate::wire::decode::<GateRecord>(&enc).unwrap(), record);

        let mut ns = MemNamespace::new();
        record.save_to(&mut ns).unwrap();
        assert_eq!(GateRecord::storage_key(record.id), "00001234");
        assert_eq!(
            GateRecord::load_from(&ns, record.id).unwrap(),
            record
        );

        // A notes length running past the blob is a parsing error.
        let mut bad = enc;
        bad[69] = 0xff;
        ns.set_blob(&GateRecord::storage_key(record.id), &bad).unwrap();
        assert_eq!(
            GateRecord::load_from(&ns, record.id).unwrap_err(),
            storage::Error::Parsing
        );
    }

    #[test]
    fn load_all_stops_at_the_first_gap_and_flags_damage() {
        let mut ns = MemNamespace::new();
        for idx in 0..3u32 {
            GateRecord::fresh(GateId::new(idx), format!("gate {idx}"))
                .save_to(&mut ns)
                .unwrap();
        }
        // Damage the middle record.
        ns.set_blob(&GateRecord::storage_key(GateId::new(1)), &[1, 2, 3])
            .unwrap();
        // A fourth record beyond the gap is never reached.
        GateRecord::fresh(GateId::new(5), String::new())
            .save_to(&mut ns)
            .unwrap();

        let records = GateRecord::load_all(&ns);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].notes, "gate 0");
        assert_eq!(records[1].status, GateStatus::Unknown);
        assert_eq!(records[2].notes, "gate 2");
    }

    #[test]
    fn remove_gate_lifecycle() {
        let mut km = keymaker();
        let gate = Arc::new(Mutex::new(Gate::new(Device::detached(KeyPair::random()))));
        let ns: Arc<Mutex<dyn Namespace + Send>> = Arc::new(Mutex::new(MemNamespace::new()));

        let gid = km.gate_add(String::new(), None);
        // Never configured: removable without a gate in reach.
        km.remove_gate(gid, None, None).unwrap();
        assert_eq!(km.gate_status(gid), GateStatus::Deleted);
        // Removing again is a no-op.
        km.remove_gate(gid, None, None).unwrap();

        // Configure a second gate, then decommission it over the channel.
        let gid = km.gate_add(String::new(), None);
        let (mut rg, server) = open_session(gate.clone(), ns.clone(), km.keys());
        km.configure_gate(gid, &mut rg, None).unwrap();
        // Configuring a configured record is refused locally.
        assert_eq!(
            km.configure_gate(gid, &mut rg, None).unwrap_err(),
            ClientError::Gate(GateError::InvalidOperation)
        );
        km.remove_gate(gid, Some(&mut rg), None).unwrap();
        assert_eq!(km.gate_status(gid), GateStatus::Deleted);
        rg.bye().unwrap();
        server.join().unwrap();
        assert!(!gate.lock().unwrap().is_configured());

        // Unknown ids are rejected.
        assert_eq!(
            km.remove_gate(GateId::new(99), None, None).unwrap_err(),
            ClientError::Gate(GateError::InvalidArgument)
        );
    }
}
