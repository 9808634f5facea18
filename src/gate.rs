//! The gate device
//!
//! A gate is a door controller with a key pair and, once commissioned, a
//! registration binding it to one keymaker: the id it was assigned, the
//! keymaker's public key, and the base key all its per-card slot keys
//! derive from. This module holds the gate state, the RPC surface a
//! keymaker drives over the secure channel (protocol v0), and the
//! authentication responder that decides whether a presented card opens
//! the door.

use crate::card::{CardInterface, Error as CardError};
use crate::device::Device;
use crate::identity::Identity;
use crate::keys::{GateBaseKey, KeyPair, PublicKey};
use crate::rpc::{self, Bridge};
use crate::storage::{self, Namespace};
use crate::token::MemberToken;
use crate::wire::{Stream, StreamError, TransferFormat};
use crate::{GateId, TokenId};

use log::{error, info, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Storage key of the registration blob.
const KEY_REGISTRATION: &str = "registration";
/// Storage key of the GPIO responder configuration.
const KEY_GPIO: &str = "gpio-responder";

/// Gate-protocol errors, carried inside RPC response payloads.
///
/// Their wire discriminants have the high bit set, so a receiver can
/// always tell them apart from RPC-layer error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateError {
    /// The command is reserved to the owning keymaker.
    Unauthorized,
    /// The command does not apply to the gate's current state.
    InvalidOperation,
    /// A command argument was rejected.
    InvalidArgument,
}

/// Discriminant bit separating protocol errors from RPC errors.
pub const PROTO_ERROR_BIT: u8 = 0x80;

impl GateError {
    pub fn code(self) -> u8 {
        match self {
            GateError::Unauthorized => 0,
            GateError::InvalidOperation => 1,
            GateError::InvalidArgument => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(GateError::Unauthorized),
            1 => Some(GateError::InvalidOperation),
            2 => Some(GateError::InvalidArgument),
            _ => None,
        }
    }
}

impl core::fmt::Display for GateError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            GateError::Unauthorized => write!(f, "unauthorized"),
            GateError::InvalidOperation => write!(f, "invalid_operation"),
            GateError::InvalidArgument => write!(f, "invalid_argument"),
        }
    }
}

impl<T: TransferFormat> TransferFormat for Result<T, GateError> {
    const TYPE_NAME: &'static str = "result";

    fn read_from(s: &mut Stream<'_>) -> Result<Self, StreamError> {
        let tag = s.byte()?;
        if tag == 0 {
            Ok(Ok(T::read_from(s)?))
        } else if tag & PROTO_ERROR_BIT != 0 {
            GateError::from_code(tag & !PROTO_ERROR_BIT)
                .map(Err)
                .ok_or(StreamError::Invalid)
        } else {
            Err(StreamError::Invalid)
        }
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        match self {
            Ok(value) => {
                out.push(0);
                value.write_to(out);
            }
            Err(e) => out.push(PROTO_ERROR_BIT | e.code()),
        }
    }
}

/// The gate-side registration record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub id: GateId,
    pub keymaker_pk: PublicKey,
    pub base_key: GateBaseKey,
}

impl TransferFormat for Registration {
    const TYPE_NAME: &'static str = "registration";

    fn read_from(s: &mut Stream<'_>) -> Result<Self, StreamError> {
        Ok(Registration {
            id: GateId::read_from(s)?,
            keymaker_pk: PublicKey::read_from(s)?,
            base_key: GateBaseKey::read_from(s)?,
        })
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        self.id.write_to(out);
        self.keymaker_pk.write_to(out);
        self.base_key.write_to(out);
    }
}

/// What a gate reveals about its registration over RPC.
///
/// An unconfigured gate answers with the sentinel id and an all-zero
/// keymaker key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationInfo {
    pub id: GateId,
    pub gate_pk: PublicKey,
    pub keymaker_pk: PublicKey,
}

impl TransferFormat for RegistrationInfo {
    const TYPE_NAME: &'static str = "registration_info";

    fn read_from(s: &mut Stream<'_>) -> Result<Self, StreamError> {
        Ok(RegistrationInfo {
            id: GateId::read_from(s)?,
            gate_pk: PublicKey::read_from(s)?,
            keymaker_pk: PublicKey::read_from(s)?,
        })
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        self.id.write_to(out);
        self.gate_pk.write_to(out);
        self.keymaker_pk.write_to(out);
    }
}

/// Pin number meaning "drive nothing".
pub const GPIO_NONE: u8 = 0xff;

/// The output action fired on a successful authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpioConfig {
    pub gpio: u8,
    pub level: bool,
    pub hold_time: Duration,
}

impl Default for GpioConfig {
    fn default() -> Self {
        GpioConfig {
            gpio: GPIO_NONE,
            level: false,
            hold_time: Duration::from_millis(100),
        }
    }
}

impl TransferFormat for GpioConfig {
    const TYPE_NAME: &'static str = "gpio_config";

    fn read_from(s: &mut Stream<'_>) -> Result<Self, StreamError> {
        let gpio = u8::read_from(s)?;
        let level = bool::read_from(s)?;
        let ms = u32::read_from(s)?;
        Ok(GpioConfig {
            gpio,
            level,
            hold_time: Duration::from_millis(u64::from(ms)),
        })
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        self.gpio.write_to(out);
        self.level.write_to(out);
        (self.hold_time.as_millis() as u32).write_to(out);
    }
}

/// The pin driving contract; the hardware is outside this crate.
pub trait GpioDriver: Send {
    /// Enable or disable a pin as an output. `false` rejects the pin.
    fn configure_output(&mut self, pin: u8, enable: bool) -> bool;

    fn set_level(&mut self, pin: u8, high: bool);
}

struct GpioControl {
    cfg: GpioConfig,
    driver: Option<Box<dyn GpioDriver>>,
}

lazy_static::lazy_static! {
    /// There is exactly one physical output per gate; its configuration is
    /// process-wide and every transition runs under this lock.
    static ref GPIO: Mutex<GpioControl> = Mutex::new(GpioControl {
        cfg: GpioConfig::default(),
        driver: None,
    });
}

/// Process-wide GPIO responder configuration.
pub mod gpio {
    use super::*;

    pub fn install_driver(driver: Box<dyn GpioDriver>) {
        GPIO.lock().expect("poisoned gpio lock").driver = Some(driver);
    }

    /// Swap the configuration; the old pin is released before the new one
    /// is armed, under one lock acquisition.
    pub fn set_global_config(cfg: GpioConfig) -> bool {
        let mut control = GPIO.lock().expect("poisoned gpio lock");
        let old = control.cfg;
        if let Some(driver) = control.driver.as_mut() {
            if cfg.gpio != GPIO_NONE && !driver.configure_output(cfg.gpio, true) {
                return false;
            }
            if old.gpio != GPIO_NONE && old.gpio != cfg.gpio {
                driver.configure_output(old.gpio, false);
            }
            if cfg.gpio != GPIO_NONE {
                // Park the pin at the inactive level.
                driver.set_level(cfg.gpio, !cfg.level);
            }
        }
        control.cfg = cfg;
        if cfg.gpio == GPIO_NONE {
            info!("on authentication: do nothing");
        } else {
            info!(
                "on authentication: drive gpio {} to {} for {} ms",
                cfg.gpio,
                u8::from(cfg.level),
                cfg.hold_time.as_millis()
            );
        }
        true
    }

    pub fn global_config() -> GpioConfig {
        GPIO.lock().expect("poisoned gpio lock").cfg
    }

    /// Assert the configured action and release it after the hold time,
    /// blocking the caller.
    pub fn hold() {
        let mut control = GPIO.lock().expect("poisoned gpio lock");
        let cfg = control.cfg;
        if cfg.gpio == GPIO_NONE {
            return;
        }
        if let Some(driver) = control.driver.as_mut() {
            driver.set_level(cfg.gpio, cfg.level);
            std::thread::sleep(cfg.hold_time);
            driver.set_level(cfg.gpio, !cfg.level);
        }
    }

    /// Fire the action without blocking the card loop.
    pub fn fire() {
        std::thread::spawn(hold);
    }
}

/// Hooks invoked by [`Gate::try_authenticate`].
pub trait AuthResponder {
    fn on_authentication_success(&mut self, identity: &Identity);

    /// `might_be_tampering` is set when the gate file was readable but its
    /// content failed to decrypt or parse.
    fn on_authentication_fail(&mut self, id: TokenId, error: CardError, might_be_tampering: bool);
}

/// The default responder: a successful authentication fires the GPIO
/// action, failures only log.
#[derive(Debug, Default)]
pub struct GpioAuthResponder;

impl AuthResponder for GpioAuthResponder {
    fn on_authentication_success(&mut self, _: &Identity) {
        gpio::fire();
    }

    fn on_authentication_fail(&mut self, _: TokenId, _: CardError, _: bool) {}
}

pub struct Gate {
    device: Device,
    registration: Option<Registration>,
    restart_requested: bool,
}

impl Gate {
    pub fn new(device: Device) -> Self {
        Gate {
            device,
            registration: None,
            restart_requested: false,
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

    pub fn is_configured(&self) -> bool {
        self.registration.is_some()
    }

    /// The assigned id, or the sentinel when unconfigured.
    pub fn id(&self) -> GateId {
        self.registration
            .as_ref()
            .map(|r| r.id)
            .unwrap_or(GateId::NONE)
    }

    pub fn keymaker_pk(&self) -> Option<PublicKey> {
        self.registration.as_ref().map(|r| r.keymaker_pk)
    }

    pub fn base_key(&self) -> Option<GateBaseKey> {
        self.registration.as_ref().map(|r| r.base_key)
    }

    pub fn registration_info(&self) -> RegistrationInfo {
        RegistrationInfo {
            id: self.id(),
            gate_pk: self.device.public_key(),
            keymaker_pk: self.keymaker_pk().unwrap_or_default(),
        }
    }

    /// Whether a served `restart_gate` command arrived; the hosting loop
    /// performs the actual reboot.
    pub fn restart_requested(&self) -> bool {
        self.restart_requested
    }

    /// The NFCID-3t to present during target activation: the low bytes of
    /// the gate's public key.
    pub fn nfc_id(&self) -> [u8; 10] {
        let mut id = [0u8; 10];
        id.copy_from_slice(&self.device.public_key().as_bytes()[..10]);
        id
    }

    /// Bind this gate to a keymaker under `id`, generating a fresh base
    /// key. The base key is returned so it can travel back over the secure
    /// channel; it never leaves the gate any other way.
    pub fn register(&mut self, id: GateId, keymaker_pk: PublicKey) -> GateBaseKey {
        let base_key = GateBaseKey::random();
        info!("registered as {id} to keymaker {keymaker_pk}");
        self.registration = Some(Registration {
            id,
            keymaker_pk,
            base_key,
        });
        self.restart_requested = false;
        base_key
    }

    /// Drop the registration.
    pub fn reset(&mut self) {
        if let Some(r) = self.registration.take() {
            info!("cleared registration as {}", r.id);
        }
    }

    pub fn save_to(&self, ns: &mut dyn Namespace) -> storage::Result<()> {
        match &self.registration {
            Some(r) => {
                storage::set_encode_blob(ns, KEY_REGISTRATION, r)?;
                ns.commit()
            }
            None => match ns.erase(KEY_REGISTRATION) {
                Ok(()) | Err(storage::Error::NotFound) => ns.commit(),
                Err(e) => Err(e),
            },
        }
    }

    /// Restore a stored registration; an absent blob leaves the gate
    /// unconfigured.
    pub fn load_from(&mut self, ns: &dyn Namespace) -> storage::Result<()> {
        match storage::get_parse_blob::<Registration>(ns, KEY_REGISTRATION) {
            Ok(r) => {
                self.registration = Some(r);
                Ok(())
            }
            Err(storage::Error::NotFound) => {
                self.registration = None;
                Ok(())
            }
            Err(e) => {
                error!("rejecting stored registration: {e}");
                Err(e)
            }
        }
    }

    /// Decide whether a presented card opens this gate.
    ///
    /// Reads and opens the card's gate file for this gate; the outcome is
    /// reported through `responder`. Only a fully verified identity counts
    /// as success.
    pub fn try_authenticate<C: CardInterface>(
        &self,
        token: &mut MemberToken<'_, C>,
        responder: &mut dyn AuthResponder,
    ) {
        let Some(registration) = &self.registration else {
            warn!("card presented to an unconfigured gate");
            return;
        };
        let tid = match token.id() {
            Ok(tid) => tid,
            Err(e) => {
                error!("card communication error: {e}");
                responder.on_authentication_fail(TokenId::default(), e, false);
                return;
            }
        };
        match token.read_encrypted_gate_file(
            registration.id,
            &registration.base_key,
            self.device.keys(),
            &registration.keymaker_pk,
            true,
            true,
        ) {
            Ok((identity, _)) => {
                info!("authenticated {identity}");
                responder.on_authentication_success(&identity);
            }
            Err(e @ (CardError::AppNotFound | CardError::FileNotFound)) => {
                info!("token {tid}: not one of our cards ({e})");
                responder.on_authentication_fail(tid, e, false);
            }
            Err(e @ (CardError::Crypto | CardError::Malformed)) => {
                warn!("token {tid}: tampering suspected ({e})");
                responder.on_authentication_fail(tid, e, true);
            }
            Err(e) => {
                error!("token {tid}: communication error ({e})");
                responder.on_authentication_fail(tid, e, false);
            }
        }
    }
}

fn owner_guard(gate: &Gate, peer: &PublicKey) -> Result<(), GateError> {
    match gate.keymaker_pk() {
        None => Err(GateError::InvalidOperation),
        Some(pk) if pk != *peer => Err(GateError::Unauthorized),
        Some(_) => Ok(()),
    }
}

fn unconfigured_or_owner_guard(gate: &Gate, peer: &PublicKey) -> Result<(), GateError> {
    match gate.keymaker_pk() {
        Some(pk) if pk != *peer => Err(GateError::Unauthorized),
        _ => Ok(()),
    }
}

/// Install the protocol v0 command set on a bridge serving `peer_pk`.
///
/// The peer identity comes from the secure channel handshake; every
/// authorization decision below is made against it.
pub fn register_commands(
    bridge: &mut Bridge,
    gate: Arc<Mutex<Gate>>,
    ns: Arc<Mutex<dyn Namespace + Send>>,
    peer_pk: PublicKey,
) -> rpc::Result<()> {
    bridge.register_fn::<(), (), _>("hello", |()| ())?;
    bridge.register_serve_stop("bye")?;

    {
        let gate = gate.clone();
        bridge.register_fn::<(), crate::ota::FwInfo, _>("get_fw_info", move |()| {
            gate.lock().expect("poisoned gate lock").device().fw_info().clone()
        })?;
    }
    {
        let gate = gate.clone();
        bridge.register_fn::<(), crate::device::UpdateConfig, _>(
            "get_update_settings",
            move |()| gate.lock().expect("poisoned gate lock").device().update_config(),
        )?;
    }
    {
        let gate = gate.clone();
        bridge.register_fn::<(), crate::device::WifiStatus, _>("get_wifi_status", move |()| {
            gate.lock()
                .expect("poisoned gate lock")
                .device_mut()
                .wifi_status()
        })?;
    }
    {
        let gate = gate.clone();
        bridge.register_fn::<(), RegistrationInfo, _>("get_registration_info", move |()| {
            gate.lock().expect("poisoned gate lock").registration_info()
        })?;
    }
    // Reserved for a future backend link.
    bridge.register_fn::<(), String, _>("get_backend_url", |()| String::new())?;
    bridge.register_fn::<(String, String), Result<(), GateError>, _>(
        "set_backend_url",
        |(_url, _api_key)| Err(GateError::InvalidOperation),
    )?;
    bridge.register_fn::<(), GpioConfig, _>("get_gpio_config", |()| gpio::global_config())?;
    {
        let gate = gate.clone();
        bridge.register_fn::<(), crate::device::UpdateStatus, _>("is_updating", move |()| {
            gate.lock().expect("poisoned gate lock").device().update_status()
        })?;
    }
    {
        let gate = gate.clone();
        bridge.register_fn::<(), Result<crate::ota::ReleaseInfo, GateError>, _>(
            "check_for_updates",
            move |()| {
                let mut gate = gate.lock().expect("poisoned gate lock");
                Ok(gate
                    .device_mut()
                    .check_for_updates()
                    .unwrap_or_else(crate::ota::ReleaseInfo::none))
            },
        )?;
    }
    {
        let gate = gate.clone();
        let ns = ns.clone();
        bridge.register_fn::<(GateId,), Result<GateBaseKey, GateError>, _>(
            "register_gate",
            move |(gid,)| {
                let mut gate = gate.lock().expect("poisoned gate lock");
                if gate.is_configured() {
                    return Err(GateError::InvalidOperation);
                }
                if !gid.is_valid() {
                    return Err(GateError::InvalidArgument);
                }
                let base_key = gate.register(gid, peer_pk);
                let mut ns = ns.lock().expect("poisoned storage lock");
                if let Err(e) = gate.save_to(&mut *ns) {
                    error!("cannot persist registration: {e}");
                    gate.reset();
                    return Err(GateError::InvalidOperation);
                }
                Ok(base_key)
            },
        )?;
    }
    {
        let gate = gate.clone();
        let ns = ns.clone();
        bridge.register_fn::<(), Result<(), GateError>, _>("reset_gate", move |()| {
            let mut gate = gate.lock().expect("poisoned gate lock");
            owner_guard(&gate, &peer_pk)?;
            gate.reset();
            let mut ns = ns.lock().expect("poisoned storage lock");
            if let Err(e) = gate.save_to(&mut *ns) {
                error!("cannot clear stored registration: {e}");
            }
            Ok(())
        })?;
    }
    {
        let gate = gate.clone();
        let ns = ns.clone();
        bridge.register_fn::<(String, bool), Result<(), GateError>, _>(
            "set_update_settings",
            move |(channel, auto)| {
                let mut gate = gate.lock().expect("poisoned gate lock");
                unconfigured_or_owner_guard(&gate, &peer_pk)?;
                let mut ns = ns.lock().expect("poisoned storage lock");
                if gate
                    .device_mut()
                    .set_update_settings(&channel, auto, true, Some(&mut *ns))
                {
                    Ok(())
                } else {
                    Err(GateError::InvalidArgument)
                }
            },
        )?;
    }
    {
        let gate = gate.clone();
        bridge.register_fn::<(), Result<crate::ota::ReleaseInfo, GateError>, _>(
            "update_now",
            move |()| {
                let mut gate = gate.lock().expect("poisoned gate lock");
                owner_guard(&gate, &peer_pk)?;
                Ok(gate
                    .device_mut()
                    .update_now()
                    .unwrap_or_else(crate::ota::ReleaseInfo::none))
            },
        )?;
    }
    {
        let gate = gate.clone();
        bridge.register_fn::<(String,), Result<(), GateError>, _>(
            "update_manually",
            move |(url,)| {
                let mut gate = gate.lock().expect("poisoned gate lock");
                owner_guard(&gate, &peer_pk)?;
                gate.device_mut().update_manually(&url);
                Ok(())
            },
        )?;
    }
    {
        let gate = gate.clone();
        bridge.register_fn::<(String, String), Result<bool, GateError>, _>(
            "connect_wifi",
            move |(ssid, password)| {
                let mut gate = gate.lock().expect("poisoned gate lock");
                unconfigured_or_owner_guard(&gate, &peer_pk)?;
                Ok(gate.device_mut().wifi_connect(&ssid, &password))
            },
        )?;
    }
    {
        let gate = gate.clone();
        let ns = ns.clone();
        bridge.register_fn::<(GpioConfig,), Result<(), GateError>, _>(
            "set_gpio_config",
            move |(cfg,)| {
                let gate = gate.lock().expect("poisoned gate lock");
                owner_guard(&gate, &peer_pk)?;
                if !gpio::set_global_config(cfg) {
                    return Err(GateError::InvalidArgument);
                }
                let mut ns = ns.lock().expect("poisoned storage lock");
                if let Err(e) = storage::set_encode_blob(&mut *ns, KEY_GPIO, &cfg) {
                    warn!("cannot persist gpio configuration: {e}");
                }
                Ok(())
            },
        )?;
    }
    {
        let gate = gate.clone();
        bridge.register_fn::<(), Result<(), GateError>, _>("restart_gate", move |()| {
            let mut gate = gate.lock().expect("poisoned gate lock");
            owner_guard(&gate, &peer_pk)?;
            gate.restart_requested = true;
            Ok(())
        })?;
    }
    Ok(())
}

/// Restore the persisted GPIO configuration at boot.
pub fn restore_gpio_config(ns: &dyn Namespace) {
    match storage::get_parse_blob::<GpioConfig>(ns, KEY_GPIO) {
        Ok(cfg) => {
            gpio::set_global_config(cfg);
        }
        Err(storage::Error::NotFound) => {}
        Err(e) => warn!("cannot restore gpio configuration: {e}"),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// The process-wide GPIO state is shared by every test in the binary;
    /// tests touching it serialize on this lock.
    pub(crate) static GPIO_TEST_LOCK: Mutex<()> = Mutex::new(());

    /// A driver recording every transition.
    pub(crate) struct RecordingDriver {
        pub log: Arc<Mutex<Vec<(u8, bool)>>>,
        pub reject_pin: Option<u8>,
    }

    impl GpioDriver for RecordingDriver {
        fn configure_output(&mut self, pin: u8, _enable: bool) -> bool {
            Some(pin) != self.reject_pin
        }

        fn set_level(&mut self, pin: u8, high: bool) {
            self.log.lock().unwrap().push((pin, high));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::card::emulated::EmulatedCard;
    use crate::storage::MemNamespace;
    use crate::token::GateConfig;

    fn gate_with_registration() -> (Gate, KeyPair) {
        let km = KeyPair::random();
        let mut gate = Gate::new(Device::detached(KeyPair::random()));
        gate.register(GateId::new(0), km.public_key());
        (gate, km)
    }

    #[test]
    fn registration_round_trips_through_storage() {
        let (gate, _) = gate_with_registration();
        let mut ns = MemNamespace::new();
        gate.save_to(&mut ns).unwrap();

        let mut restored = Gate::new(Device::detached(KeyPair::random()));
        restored.load_from(&ns).unwrap();
        assert!(restored.is_configured());
        assert_eq!(restored.id(), gate.id());
        assert_eq!(restored.keymaker_pk(), gate.keymaker_pk());
        assert_eq!(restored.base_key(), gate.base_key());
    }

    #[test]
    fn registration_blob_rejects_unknown_trailers() {
        let (gate, _) = gate_with_registration();
        let mut ns = MemNamespace::new();
        gate.save_to(&mut ns).unwrap();
        let mut blob = ns.get_blob("registration").unwrap();
        blob.push(0x00);
        ns.set_blob("registration", &blob).unwrap();

        let mut restored = Gate::new(Device::detached(KeyPair::random()));
        assert_eq!(restored.load_from(&ns).unwrap_err(), storage::Error::Parsing);
        assert!(!restored.is_configured());
    }

    #[test]
    fn reset_erases_the_stored_registration() {
        let (mut gate, _) = gate_with_registration();
        let mut ns = MemNamespace::new();
        gate.save_to(&mut ns).unwrap();
        gate.reset();
        gate.save_to(&mut ns).unwrap();
        assert_eq!(
            ns.get_blob("registration").unwrap_err(),
            storage::Error::NotFound
        );
        let mut restored = Gate::new(Device::detached(KeyPair::random()));
        restored.load_from(&ns).unwrap();
        assert!(!restored.is_configured());
        assert_eq!(restored.id(), GateId::NONE);
    }

    #[test]
    fn registration_info_of_an_unconfigured_gate_is_the_sentinel() {
        let gate = Gate::new(Device::detached(KeyPair::random()));
        let info = gate.registration_info();
        assert_eq!(info.id, GateId::NONE);
        assert_eq!(info.gate_pk, gate.device().public_key());
        assert_eq!(info.keymaker_pk, PublicKey::default());
    }

    #[test]
    fn nfc_id_is_the_low_public_key_bytes() {
        let gate = Gate::new(Device::detached(KeyPair::random()));
        let pk = gate.device().public_key();
        assert_eq!(&gate.nfc_id()[..], &pk.as_bytes()[..10]);
    }

    #[test]
    fn gpio_blob_layout() {
        let cfg = GpioConfig {
            gpio: 12,
            level: true,
            hold_time: Duration::from_millis(0x0102_0304),
        };
        let enc = crate::wire::encode(&cfg);
        assert_eq!(enc, [12, 1, 4, 3, 2, 1]);
        assert_eq!(crate::wire::decode::<GpioConfig>(&enc).unwrap(), cfg);
    }

    #[test]
    fn gpio_global_config_drives_transitions_under_the_lock() {
        let _guard = GPIO_TEST_LOCK.lock().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        gpio::install_driver(Box::new(RecordingDriver {
            log: log.clone(),
            reject_pin: Some(13),
        }));

        assert!(gpio::set_global_config(GpioConfig {
            gpio: 4,
            level: true,
            hold_time: Duration::from_millis(1),
        }));
        assert_eq!(gpio::global_config().gpio, 4);
        // Armed at the inactive level.
        assert_eq!(log.lock().unwrap().last(), Some(&(4, false)));

        // An invalid pin is refused and the old config stays.
        assert!(!gpio::set_global_config(GpioConfig {
            gpio: 13,
            level: true,
            hold_time: Duration::from_millis(1),
        }));
        assert_eq!(gpio::global_config().gpio, 4);

        log.lock().unwrap().clear();
        gpio::hold();
        assert_eq!(*log.lock().unwrap(), vec![(4, true), (4, false)]);

        // The persisted shape comes back at boot.
        let mut ns = MemNamespace::new();
        let stored = GpioConfig {
            gpio: 5,
            level: false,
            hold_time: Duration::from_millis(250),
        };
        storage::set_encode_blob(&mut ns, "gpio-responder", &stored).unwrap();
        restore_gpio_config(&ns);
        assert_eq!(gpio::global_config(), stored);
        // Nothing stored leaves the configuration alone.
        restore_gpio_config(&MemNamespace::new());
        assert_eq!(gpio::global_config(), stored);

        gpio::set_global_config(GpioConfig::default());
    }

    struct Recorder {
        success: Option<Identity>,
        failure: Option<(TokenId, CardError, bool)>,
    }

    impl Recorder {
        fn new() -> Self {
            Recorder {
                success: None,
                failure: None,
            }
        }
    }

    impl AuthResponder for Recorder {
        fn on_authentication_success(&mut self, identity: &Identity) {
            self.success = Some(identity.clone());
        }

        fn on_authentication_fail(&mut self, id: TokenId, error: CardError, tampering: bool) {
            self.failure = Some((id, error, tampering));
        }
    }

    const TOKEN: TokenId = TokenId([0xa1, 0xb2, 0xc3, 0xd4, 0xe5, 0xf6, 0x07]);

    fn enrolled_setup() -> (EmulatedCard, Gate, Identity) {
        let km = KeyPair::random();
        let mut gate = Gate::new(Device::detached(KeyPair::random()));
        let base_key = gate.register(GateId::new(3), km.public_key());
        let cfg = GateConfig {
            id: GateId::new(3),
            gate_pk: gate.device().public_key(),
            base_key,
        };
        let identity = Identity {
            id: TOKEN,
            holder: "Holder".to_string(),
            publisher: "Publisher".to_string(),
        };
        let mut card = EmulatedCard::new(TOKEN);
        let mut token = MemberToken::new(&mut card);
        token.deploy(&km, &identity, None).unwrap();
        token.enroll_gate(&km, &cfg, &identity).unwrap();
        (card, gate, identity)
    }

    #[test]
    fn authentication_succeeds_on_an_enrolled_card() {
        let (mut card, gate, identity) = enrolled_setup();
        let mut token = MemberToken::new(&mut card);
        let mut recorder = Recorder::new();
        gate.try_authenticate(&mut token, &mut recorder);
        assert_eq!(recorder.success, Some(identity));
        assert!(recorder.failure.is_none());
    }

    #[test]
    fn authentication_distinguishes_foreign_cards_from_tampering() {
        let (mut card, gate, _) = enrolled_setup();

        // Flip a ciphertext byte: readable file, undecryptable content.
        card.file_data_mut(GateId::new(3).app(), GateId::new(3).file())[5] ^= 1;
        let mut token = MemberToken::new(&mut card);
        let mut recorder = Recorder::new();
        gate.try_authenticate(&mut token, &mut recorder);
        assert!(recorder.success.is_none());
        let (tid, error, tampering) = recorder.failure.unwrap();
        assert_eq!(tid, TOKEN);
        assert_eq!(error, CardError::Crypto);
        assert!(tampering);

        // A blank card is simply not ours.
        let mut blank = EmulatedCard::new(TokenId([9; 7]));
        let mut token = MemberToken::new(&mut blank);
        let mut recorder = Recorder::new();
        gate.try_authenticate(&mut token, &mut recorder);
        assert!(recorder.success.is_none());
        let (_, error, tampering) = recorder.failure.unwrap();
        assert_eq!(error, CardError::AppNotFound);
        assert!(!tampering);
    }

    #[test]
    fn success_fires_the_gpio_action() {
        let _guard = GPIO_TEST_LOCK.lock().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        gpio::install_driver(Box::new(RecordingDriver {
            log: log.clone(),
            reject_pin: None,
        }));
        gpio::set_global_config(GpioConfig {
            gpio: 7,
            level: true,
            hold_time: Duration::from_millis(1),
        });
        log.lock().unwrap().clear();

        let (mut card, gate, _) = enrolled_setup();
        let mut token = MemberToken::new(&mut card);
        let mut responder = GpioAuthResponder;
        gate.try_authenticate(&mut token, &mut responder);
        // The hold runs on its own thread.
        let begin = std::time::Instant::now();
        while log.lock().unwrap().len() < 2 && begin.elapsed() < Duration::from_secs(1) {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(*log.lock().unwrap(), vec![(7, true), (7, false)]);

        // A tampered card must not fire anything.
        log.lock().unwrap().clear();
        card.file_data_mut(GateId::new(3).app(), GateId::new(3).file())[5] ^= 1;
        let mut token = MemberToken::new(&mut card);
        gate.try_authenticate(&mut token, &mut responder);
        std::thread::sleep(Duration::from_millis(20));
        assert!(log.lock().unwrap().is_empty());

        gpio::set_global_config(GpioConfig::default());
    }
}
