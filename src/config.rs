//! Run configuration.
//!
//! A [Config] is built once, from an optional YAML file plus command-line overrides, and passed
//! by reference to everything that needs it.

use crate::credentials::{CredentialMode, CredentialPrecedence};
use crate::inventory::InventoryPaths;
use crate::run_backups::{ExecutorOptions, DEFAULT_WORKERS};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Where backups go by default.
pub const DEFAULT_OUTPUT_DIR: &str = "/opt/stockpiler";

/// The credential file used when one is requested without a path.
pub const DEFAULT_CREDENTIAL_FILE: &str = "/opt/stockpiler/credentials.b64";

/// How long a single device may take, in seconds, unless configured otherwise.
pub const DEFAULT_DEVICE_TIMEOUT: u64 = 120;

/// The configuration file read when none is given explicitly, relative to [config_dir].
pub const CONFIG_FILE: &str = "stockpiler.yaml";

/// Returns a [PathBuf] to the directory where Stockpiler's configuration should live.
///
/// When compiled for testing, this returns `CARGO_MANIFEST_DIR` plus `resources/etc/stockpiler`.
/// Otherwise, it returns `/etc/stockpiler`.
pub fn config_dir() -> PathBuf {
    // Omit the leading slash so that PathBuf::push appends instead of replacing.
    const CONFIG_DIR: &str = "etc/stockpiler";

    let mut path = PathBuf::from("/");

    #[cfg(test)]
    {
        path.push(env!("CARGO_MANIFEST_DIR"));
        path.push("resources");
    }

    path.push(CONFIG_DIR);
    path
}

/// Replaces a leading `~` component with the current user's home directory.
///
/// Paths that don't start with `~`, and all paths when the home directory is unknown, are
/// returned unchanged.
pub fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), home::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_owned(),
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("could not parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("proxy {0:?} must be given as host:port")]
    InvalidProxy(String),
}

/// Everything a run needs to know.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub inventory: InventoryPaths,

    /// The backup repository.
    pub output: PathBuf,

    pub credentials: CredentialMode,

    pub credential_precedence: CredentialPrecedence,

    /// How many devices are contacted at once.
    pub workers: NonZeroUsize,

    /// Per-device time limit in seconds. `None` waits indefinitely.
    pub device_timeout: Option<u64>,

    /// A SOCKS5 proxy, as `host:port`, for reaching HTTPS management interfaces. SSH doesn't
    /// use it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,

    /// Only devices with these addresses are contacted. Empty means all devices.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<String>,

    /// Whether to write the run report into the backup repository.
    pub report: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            inventory: InventoryPaths::default(),
            output: PathBuf::from(DEFAULT_OUTPUT_DIR),
            credentials: CredentialMode::default(),
            credential_precedence: CredentialPrecedence::default(),
            workers: NonZeroUsize::new(DEFAULT_WORKERS).unwrap_or(NonZeroUsize::MIN),
            device_timeout: Some(DEFAULT_DEVICE_TIMEOUT),
            proxy: None,
            addresses: Vec::new(),
            report: true,
        }
    }
}

impl Config {
    /// Reads a YAML config file. Fields missing from the file keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file can't be read or parsed, or if it contains an unknown field.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        serde_yaml::from_str::<Option<Self>>(&text)
            .map(Option::unwrap_or_default)
            .map_err(|source| ConfigError::Parse {
                path: path.to_owned(),
                source,
            })
    }

    /// Reads the config file in [config_dir] if it exists, otherwise returns the defaults.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = config_dir().join(CONFIG_FILE);
        match path.is_file() {
            true => Self::load(path),
            false => Ok(Self::default()),
        }
    }

    /// Expands `~` in every configured path. See [expand_home].
    pub fn expand_paths(mut self) -> Self {
        self.inventory.hosts = expand_home(&self.inventory.hosts);
        self.inventory.groups = self.inventory.groups.as_deref().map(expand_home);
        self.inventory.defaults = self.inventory.defaults.as_deref().map(expand_home);
        self.output = expand_home(&self.output);
        if let CredentialMode::EncodedFile { ref mut path } = self.credentials {
            *path = expand_home(path);
        }
        self
    }

    /// Checks settings that can't be expressed in the type system.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(ref proxy) = self.proxy {
            let valid = match proxy.rsplit_once(':') {
                Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
                None => false,
            };
            if !valid {
                return Err(ConfigError::InvalidProxy(proxy.clone()));
            }
        }
        Ok(())
    }

    pub fn device_timeout(&self) -> Option<Duration> {
        self.device_timeout.map(Duration::from_secs)
    }

    pub fn executor_options(&self) -> ExecutorOptions {
        ExecutorOptions {
            workers: self.workers,
            timeout: self.device_timeout(),
        }
    }
}
