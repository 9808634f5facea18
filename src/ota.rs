//! Firmware identity and update channel metadata
//!
//! A device knows which firmware it runs ([`FwInfo`]) and can poll an
//! update channel: an HTTP endpoint returning a JSON array of releases,
//! each with a semantic version tag and a list of asset links. A release
//! is eligible when its tag parses as `v<semver>` and one of its links is
//! named exactly `<app>-<platform>-<version>.bin`. Everything else is
//! skipped.
//!
//! The HTTP client and the actual flash procedure live outside this crate;
//! [`HttpClient`] is the contract for the former.

use crate::wire::{Stream, StreamError, TransferFormat};

use log::warn;
use semver::Version;
use serde::Deserialize;

/// Identity of a running firmware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FwInfo {
    pub semantic_version: Version,
    pub commit_info: String,
    pub app_name: String,
    pub platform_code: String,
}

impl FwInfo {
    /// The placeholder identity of an unversioned build.
    pub fn unknown() -> Self {
        FwInfo {
            semantic_version: zero_version(),
            commit_info: String::new(),
            app_name: String::new(),
            platform_code: String::new(),
        }
    }

    /// The prefix every firmware binary of this app/platform carries.
    pub fn bin_prefix(&self) -> String {
        format!("{}-{}", self.app_name, self.platform_code)
    }
}

impl core::fmt::Display for FwInfo {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(
            f,
            "{}-{}-{}",
            self.app_name, self.platform_code, self.semantic_version
        )?;
        if !self.commit_info.is_empty() {
            write!(f, "-{}", self.commit_info)?;
        }
        Ok(())
    }
}

impl TransferFormat for FwInfo {
    const TYPE_NAME: &'static str = "fw_info";

    fn read_from(s: &mut Stream<'_>) -> Result<Self, StreamError> {
        let version = String::read_from(s)?;
        let semantic_version = Version::parse(&version).map_err(|_| StreamError::Invalid)?;
        Ok(FwInfo {
            semantic_version,
            commit_info: String::read_from(s)?,
            app_name: String::read_from(s)?,
            platform_code: String::read_from(s)?,
        })
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        self.semantic_version.to_string().write_to(out);
        self.commit_info.write_to(out);
        self.app_name.write_to(out);
        self.platform_code.write_to(out);
    }
}

/// One eligible release of an update channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseInfo {
    pub semantic_version: Version,
    pub firmware_url: String,
}

impl ReleaseInfo {
    /// The "no release available" placeholder.
    pub fn none() -> Self {
        ReleaseInfo {
            semantic_version: zero_version(),
            firmware_url: String::new(),
        }
    }

    pub fn is_none(&self) -> bool {
        self.firmware_url.is_empty()
    }

    /// Extract the eligible releases for `fw_bin_prefix` out of a channel's
    /// JSON payload.
    pub fn from_channel_json(payload: &serde_json::Value, fw_bin_prefix: &str) -> Vec<ReleaseInfo> {
        let Some(entries) = payload.as_array() else {
            warn!("update channel payload is not an array");
            return Vec::new();
        };
        let mut releases = Vec::new();
        for entry in entries {
            let Ok(entry) = serde_json::from_value::<ReleaseEntry>(entry.clone()) else {
                continue;
            };
            let Some(tag) = entry.tag_name.strip_prefix('v') else {
                continue;
            };
            let Ok(version) = Version::parse(tag) else {
                warn!("invalid release tag {}", entry.tag_name);
                continue;
            };
            let fw_name = format!("{fw_bin_prefix}-{version}.bin");
            if let Some(link) = entry.assets.links.iter().find(|l| l.name == fw_name) {
                releases.push(ReleaseInfo {
                    semantic_version: version,
                    firmware_url: link.url.clone(),
                });
            }
        }
        releases
    }
}

impl core::fmt::Display for ReleaseInfo {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        if self.is_none() {
            write!(f, "no release")
        } else {
            write!(f, "{} from {}", self.semantic_version, self.firmware_url)
        }
    }
}

impl TransferFormat for ReleaseInfo {
    const TYPE_NAME: &'static str = "release_info";

    fn read_from(s: &mut Stream<'_>) -> Result<Self, StreamError> {
        let version = String::read_from(s)?;
        Ok(ReleaseInfo {
            semantic_version: Version::parse(&version).map_err(|_| StreamError::Invalid)?,
            firmware_url: String::read_from(s)?,
        })
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        self.semantic_version.to_string().write_to(out);
        self.firmware_url.write_to(out);
    }
}

#[derive(Deserialize)]
struct ReleaseEntry {
    tag_name: String,
    #[serde(default)]
    assets: Assets,
}

#[derive(Deserialize, Default)]
struct Assets {
    #[serde(default)]
    links: Vec<Link>,
}

#[derive(Deserialize)]
struct Link {
    name: String,
    url: String,
}

/// Minimal HTTP GET contract; the transport is outside this crate.
pub trait HttpClient: Send {
    /// Returns the status code and body, or `None` when the request could
    /// not be made at all.
    fn get(&mut self, url: &str) -> Option<(u16, Vec<u8>)>;
}

/// Fetch and parse an update channel. `None` means the channel is
/// unreachable or not JSON; an empty list means it holds nothing eligible.
pub fn fetch_releases(
    http: &mut dyn HttpClient,
    channel_url: &str,
    fw_bin_prefix: &str,
) -> Option<Vec<ReleaseInfo>> {
    let (status, body) = http.get(channel_url)?;
    if status != 200 {
        warn!("update channel {channel_url} answered {status}");
        return None;
    }
    let Ok(payload) = serde_json::from_slice::<serde_json::Value>(&body) else {
        warn!("update channel {channel_url} returned invalid JSON");
        return None;
    };
    Some(ReleaseInfo::from_channel_json(&payload, fw_bin_prefix))
}

/// The newest release strictly ahead of the running version.
pub fn next_release(releases: &[ReleaseInfo], running: &Version) -> Option<ReleaseInfo> {
    releases
        .iter()
        .filter(|r| r.semantic_version > *running)
        .max_by(|a, b| a.semantic_version.cmp(&b.semantic_version))
        .cloned()
}

fn zero_version() -> Version {
    Version {
        major: 0,
        minor: 0,
        patch: 0,
        pre: semver::Prerelease::new("alpha.0").expect("static prerelease is valid"),
        build: semver::BuildMetadata::EMPTY,
    }
}
