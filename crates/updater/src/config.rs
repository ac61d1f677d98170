//! Configuration for the update pipeline.

use crate::error::{Result, UpdaterError};
use reqwest::Url;
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_ARTIFACT_NAME: &str = "Setup.exe";

#[cfg(windows)]
const STAGING_FILE_NAME: &str = "update-next.exe";
#[cfg(not(windows))]
const STAGING_FILE_NAME: &str = "update-next";

/// Configuration for the update pipeline.
///
/// There is no default builds server: `builds_base` must be supplied, either
/// through [`UpdaterConfig::new`] or as a required key in the JSON file.
#[derive(Debug, Clone, Deserialize)]
pub struct UpdaterConfig {
    /// Root of the builds server; artifacts live at `<base>/<version>/<artifact>`
    #[serde(deserialize_with = "deserialize_url")]
    pub builds_base: Url,
    /// File name of the installer inside each version directory
    #[serde(default = "default_artifact_name")]
    pub artifact_name: String,
    /// Staging slot; defaults to a file in the system temp directory
    #[serde(default)]
    pub staging_path: Option<PathBuf>,
    /// TCP/TLS connect deadline
    #[serde(
        rename = "connect_timeout_secs",
        default = "default_connect_timeout",
        deserialize_with = "deserialize_secs"
    )]
    pub connect_timeout: Duration,
    /// Deadline for fetching the detached signature
    #[serde(
        rename = "signature_timeout_secs",
        default = "default_signature_timeout",
        deserialize_with = "deserialize_secs"
    )]
    pub signature_timeout: Duration,
    /// Deadline for the whole artifact download
    #[serde(
        rename = "download_timeout_secs",
        default = "default_download_timeout",
        deserialize_with = "deserialize_secs"
    )]
    pub download_timeout: Duration,
    /// Longest gap allowed between two body chunks
    #[serde(
        rename = "stall_timeout_secs",
        default = "default_stall_timeout",
        deserialize_with = "deserialize_secs"
    )]
    pub stall_timeout: Duration,
}

fn default_artifact_name() -> String {
    DEFAULT_ARTIFACT_NAME.to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_signature_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_download_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_stall_timeout() -> Duration {
    Duration::from_secs(60)
}

impl UpdaterConfig {
    /// Create a config pointing at the given builds server, with default
    /// artifact name, staging slot and deadlines
    pub fn new(builds_base: Url) -> Self {
        Self {
            builds_base,
            artifact_name: default_artifact_name(),
            staging_path: None,
            connect_timeout: default_connect_timeout(),
            signature_timeout: default_signature_timeout(),
            download_timeout: default_download_timeout(),
            stall_timeout: default_stall_timeout(),
        }
    }

    /// Load a JSON config file. `builds_base` is required; other absent keys
    /// keep their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)
            .map_err(|err| UpdaterError::Config(format!("{}: {err}", path.display())))?;
        let config: Self = serde_json::from_slice(&raw)
            .map_err(|err| UpdaterError::Config(format!("{}: {err}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Set the installer file name
    pub fn artifact_name(mut self, name: impl Into<String>) -> Self {
        self.artifact_name = name.into();
        self
    }

    /// Set the staging slot
    pub fn staging_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.staging_path = Some(path.into());
        self
    }

    /// Set the TCP/TLS connect deadline
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the signature fetch deadline
    pub fn signature_timeout(mut self, timeout: Duration) -> Self {
        self.signature_timeout = timeout;
        self
    }

    /// Set the whole-download deadline
    pub fn download_timeout(mut self, timeout: Duration) -> Self {
        self.download_timeout = timeout;
        self
    }

    /// Set the longest allowed gap between body chunks
    pub fn stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    /// The staging slot this config resolves to.
    pub fn resolved_staging_path(&self) -> PathBuf {
        self.staging_path
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join(STAGING_FILE_NAME))
    }

    /// Reject non-http(s) or opaque builds URLs, path-like artifact names and
    /// zero deadlines.
    pub fn validate(&self) -> Result<()> {
        match self.builds_base.scheme() {
            "https" | "http" => {}
            other => {
                return Err(UpdaterError::Config(format!(
                    "builds base must be http(s), got {other}"
                )))
            }
        }
        if self.builds_base.cannot_be_a_base() {
            return Err(UpdaterError::Config("builds base cannot hold a path".into()));
        }
        let name = self.artifact_name.as_str();
        let path_like = name.contains(|c: char| c == '/' || c == '\\');
        if name.is_empty() || name == "." || name == ".." || path_like {
            return Err(UpdaterError::Config(format!(
                "artifact name {name:?} must be a plain file name"
            )));
        }
        let timeouts = [
            self.connect_timeout,
            self.signature_timeout,
            self.download_timeout,
            self.stall_timeout,
        ];
        if timeouts.iter().any(Duration::is_zero) {
            return Err(UpdaterError::Config("timeouts must be non-zero".into()));
        }
        Ok(())
    }
}

fn deserialize_url<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Url, D::Error> {
    let raw = String::deserialize(deserializer)?;
    Url::parse(&raw).map_err(serde::de::Error::custom)
}

fn deserialize_secs<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_secs)
}
