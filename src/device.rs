//! The common device layer
//!
//! Keymakers and gates share a chassis: a long lived key pair (optionally
//! persisted under a password), an update channel with an automatic-update
//! flag, and a Wi-Fi association. [`Device`] bundles those; the concrete
//! radios and flash procedures stay behind the [`Wifi`] and
//! [`ota::HttpClient`] contracts.

use crate::keys::{KeyError, KeyPair, PublicKey};
use crate::ota::{self, FwInfo, HttpClient, ReleaseInfo};
use crate::storage::{self, Namespace};
use crate::wire::{Stream, StreamError, TransferFormat};

use log::{error, info, warn};

/// Storage key of the password wrapped secret key.
const KEY_SECRET: &str = "secret-key";
/// Storage key of the update channel URL.
const KEY_UPDATE_CHANNEL: &str = "update-channel";
/// Storage key of the automatic update flag.
const KEY_UPDATE_ENABLED: &str = "update-enabled";

/// Update channel polled when nothing else was configured.
pub const DEFAULT_UPDATE_CHANNEL: &str =
    "https://updates.portcullis.dev/api/v4/projects/1/releases";

/// Wi-Fi association contract; the radio is outside this crate.
pub trait Wifi: Send {
    /// The configured network, if any.
    fn ssid(&self) -> Option<String>;

    /// Replace the stored credentials.
    fn reconfigure(&mut self, ssid: &str, password: &str);

    /// One-shot association probe with the stored credentials.
    fn ensure_connected(&mut self) -> bool;
}

/// A [`Wifi`] that stores credentials but never associates.
#[derive(Debug, Default)]
pub struct UnconnectedWifi {
    ssid: Option<String>,
}

impl Wifi for UnconnectedWifi {
    fn ssid(&self) -> Option<String> {
        self.ssid.clone()
    }

    fn reconfigure(&mut self, ssid: &str, _: &str) {
        self.ssid = Some(ssid.to_string());
    }

    fn ensure_connected(&mut self) -> bool {
        false
    }
}

/// An [`ota::HttpClient`] with no network.
#[derive(Debug, Default)]
pub struct OfflineHttp;

impl HttpClient for OfflineHttp {
    fn get(&mut self, _: &str) -> Option<(u16, Vec<u8>)> {
        None
    }
}

/// Update channel settings, as exposed over RPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateConfig {
    pub update_channel: String,
    pub enable_automatic_update: bool,
}

impl TransferFormat for UpdateConfig {
    const TYPE_NAME: &'static str = "update_config";

    fn read_from(s: &mut Stream<'_>) -> Result<Self, StreamError> {
        Ok(UpdateConfig {
            update_channel: String::read_from(s)?,
            enable_automatic_update: bool::read_from(s)?,
        })
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        self.update_channel.write_to(out);
        self.enable_automatic_update.write_to(out);
    }
}

/// Wi-Fi association state, as exposed over RPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiStatus {
    pub ssid: String,
    pub operational: bool,
}

impl TransferFormat for WifiStatus {
    const TYPE_NAME: &'static str = "wifi_status";

    fn read_from(s: &mut Stream<'_>) -> Result<Self, StreamError> {
        Ok(WifiStatus {
            ssid: String::read_from(s)?,
            operational: bool::read_from(s)?,
        })
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        self.ssid.write_to(out);
        self.operational.write_to(out);
    }
}

/// Whether (and from where) a firmware download is in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateStatus {
    pub updating_from: Option<String>,
}

impl TransferFormat for UpdateStatus {
    const TYPE_NAME: &'static str = "update_status";

    fn read_from(s: &mut Stream<'_>) -> Result<Self, StreamError> {
        Ok(UpdateStatus {
            updating_from: Option::<String>::read_from(s)?,
        })
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        self.updating_from.write_to(out);
    }
}

pub struct Device {
    kp: KeyPair,
    fw: FwInfo,
    update_channel: String,
    auto_update: bool,
    updating_from: Option<String>,
    wifi: Box<dyn Wifi>,
    http: Box<dyn HttpClient>,
}

impl Device {
    pub fn new(kp: KeyPair, fw: FwInfo, wifi: Box<dyn Wifi>, http: Box<dyn HttpClient>) -> Self {
        info!("device public key {}", kp.public_key());
        Device {
            kp,
            fw,
            update_channel: DEFAULT_UPDATE_CHANNEL.to_string(),
            auto_update: false,
            updating_from: None,
            wifi,
            http,
        }
    }

    /// A bare device for hosted runs and tests: no radio, no network.
    pub fn detached(kp: KeyPair) -> Self {
        Device::new(
            kp,
            FwInfo::unknown(),
            Box::new(UnconnectedWifi::default()),
            Box::new(OfflineHttp),
        )
    }

    pub fn keys(&self) -> &KeyPair {
        &self.kp
    }

    pub fn public_key(&self) -> PublicKey {
        self.kp.public_key()
    }

    pub fn fw_info(&self) -> &FwInfo {
        &self.fw
    }

    /// Store the secret key under a password.
    pub fn store_keypair(
        ns: &mut dyn Namespace,
        kp: &KeyPair,
        password: &str,
    ) -> storage::Result<()> {
        ns.set_blob(KEY_SECRET, &kp.save_encrypted(password))?;
        ns.commit()
    }

    /// Recover a stored key pair. A wrong password or a damaged blob is
    /// [`storage::Error::Parsing`].
    pub fn restore_keypair(ns: &dyn Namespace, password: &str) -> storage::Result<KeyPair> {
        let blob = ns.get_blob(KEY_SECRET)?;
        KeyPair::load_encrypted(&blob, password).map_err(|e| {
            error!(
                "cannot unlock the stored key pair: {}",
                match e {
                    KeyError::Crypto => "incorrect password",
                    _ => "damaged blob",
                }
            );
            storage::Error::Parsing
        })
    }

    /// Load persisted update settings; absent keys keep their defaults.
    pub fn restore_update_settings(&mut self, ns: &dyn Namespace) {
        match ns.get_str(KEY_UPDATE_CHANNEL) {
            Ok(channel) => self.update_channel = channel,
            Err(storage::Error::NotFound) => {}
            Err(e) => warn!("cannot restore update channel: {e}"),
        }
        match ns.get_u8(KEY_UPDATE_ENABLED) {
            Ok(v) => self.auto_update = v != 0,
            Err(storage::Error::NotFound) => {}
            Err(e) => warn!("cannot restore update flag: {e}"),
        }
    }

    pub fn update_config(&self) -> UpdateConfig {
        UpdateConfig {
            update_channel: self.update_channel.clone(),
            enable_automatic_update: self.auto_update,
        }
    }

    /// Probe a channel URL for a parsable release feed.
    pub fn test_update_channel(&mut self, channel: &str) -> bool {
        let prefix = self.fw.bin_prefix();
        ota::fetch_releases(self.http.as_mut(), channel, &prefix).is_some()
    }

    /// Change the update settings. An empty channel keeps the current one.
    /// With `test_before`, an unreachable channel is refused.
    pub fn set_update_settings(
        &mut self,
        channel: &str,
        auto: bool,
        test_before: bool,
        ns: Option<&mut dyn Namespace>,
    ) -> bool {
        if !channel.is_empty() {
            if test_before && !self.test_update_channel(channel) {
                warn!("refusing unusable update channel {channel}");
                return false;
            }
            self.update_channel = channel.to_string();
        }
        self.auto_update = auto;
        if let Some(ns) = ns {
            let mut save = || -> storage::Result<()> {
                ns.set_str(KEY_UPDATE_CHANNEL, &self.update_channel)?;
                ns.set_u8(KEY_UPDATE_ENABLED, u8::from(self.auto_update))?;
                ns.commit()
            };
            if let Err(e) = save() {
                warn!("cannot persist update settings: {e}");
            }
        }
        true
    }

    /// Poll the configured channel for a release ahead of the running
    /// firmware.
    pub fn check_for_updates(&mut self) -> Option<ReleaseInfo> {
        let prefix = self.fw.bin_prefix();
        let channel = self.update_channel.clone();
        let releases = ota::fetch_releases(self.http.as_mut(), &channel, &prefix)?;
        ota::next_release(&releases, &self.fw.semantic_version)
    }

    /// Check the channel and mark the newest release for download.
    pub fn update_now(&mut self) -> Option<ReleaseInfo> {
        let release = self.check_for_updates()?;
        info!("updating to {release}");
        self.updating_from = Some(release.firmware_url.clone());
        Some(release)
    }

    /// Mark an explicit firmware URL for download.
    pub fn update_manually(&mut self, url: &str) {
        info!("updating from {url}");
        self.updating_from = Some(url.to_string());
    }

    pub fn update_status(&self) -> UpdateStatus {
        UpdateStatus {
            updating_from: self.updating_from.clone(),
        }
    }

    pub fn wifi_status(&mut self) -> WifiStatus {
        match self.wifi.ssid() {
            Some(ssid) => {
                let operational = self.wifi.ensure_connected();
                WifiStatus { ssid, operational }
            }
            None => WifiStatus {
                ssid: String::new(),
                operational: false,
            },
        }
    }

    /// Store fresh credentials and probe the association once.
    pub fn wifi_connect(&mut self, ssid: &str, password: &str) -> bool {
        self.wifi.reconfigure(ssid, password);
        self.wifi.ensure_connected()
    }
}
