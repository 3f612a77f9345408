//! Loads the device inventory.
//!
//! The inventory follows the hosts/groups/defaults layout used by Nornir's `SimpleInventory`:
//!
//! ```yaml
//! # hosts.yaml
//! core-sw1:
//!   hostname: 10.0.0.1
//!   groups: [campus]
//!
//! # groups.yaml
//! campus:
//!   platform: cisco_ios
//!   connection_options:
//!     netmiko:
//!       extras:
//!         secret: enable-me
//!
//! # defaults.yaml
//! username: backup
//! ```
//!
//! Each attribute is looked up on the host first, then on each of its groups in order (walking
//! parent groups depth-first), and finally in the defaults. The top-level key of a host is its
//! name; the `hostname` attribute is the address to connect to. Credential material is the
//! exception: what the host and its groups set is kept apart from what the defaults set, because
//! run credentials rank between the two.

use crate::config;
use crate::credentials::{CredentialMaterial, InventoryCredentials};
use crate::store;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// The SSH port used when the inventory doesn't set one.
pub const DEFAULT_PORT: u16 = 22;

/// The `data` key that overrides a device's backup command.
pub const BACKUP_COMMAND_KEY: &str = "backup_command";

/// The `data` key that turns on HTTPS management for a device that supports it.
pub const HTTP_MANAGEMENT_KEY: &str = "http_management";

/// The `data` key that sets the HTTPS management port.
pub const HTTP_PORT_KEY: &str = "http_mgmt_port";

/// The HTTPS management port used when the inventory doesn't set one.
pub const DEFAULT_HTTP_PORT: u16 = 8443;

/// A device operating system.
///
/// Cisco families have a built-in backup command. Any other name is kept as given and needs
/// [BACKUP_COMMAND_KEY] in the device's data.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Platform {
    CiscoIos,
    CiscoXe,
    CiscoNxos,
    CiscoXr,
    CiscoAsa,
    Other(String),
}

// Maps inventory platform names, including the short forms some inventories use, to platforms.
const PLATFORM_NAMES: &[(&str, Platform)] = &[
    ("cisco_ios", Platform::CiscoIos),
    ("ios", Platform::CiscoIos),
    ("cisco_xe", Platform::CiscoXe),
    ("iosxe", Platform::CiscoXe),
    ("cisco_nxos", Platform::CiscoNxos),
    ("nxos", Platform::CiscoNxos),
    ("cisco_xr", Platform::CiscoXr),
    ("iosxr", Platform::CiscoXr),
    ("cisco_asa", Platform::CiscoAsa),
    ("asa", Platform::CiscoAsa),
];

impl Platform {
    /// Looks up a platform by its inventory name. Case-insensitive; unknown names become
    /// [Platform::Other].
    pub fn from_name(name: &str) -> Self {
        let name = name.trim();
        PLATFORM_NAMES
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, p)| p.clone())
            .unwrap_or_else(|| Platform::Other(name.to_owned()))
    }

    /// The read-only command that prints the running configuration, if the platform has one.
    pub fn backup_command(&self) -> Option<&'static str> {
        match self {
            Platform::CiscoAsa => Some("more system:running-config"),
            Platform::CiscoIos | Platform::CiscoXe | Platform::CiscoNxos | Platform::CiscoXr => {
                Some("show running-config")
            }
            Platform::Other(_) => None,
        }
    }

    /// The command that stops the device's CLI from paging output.
    pub fn disable_paging(&self) -> Option<&'static str> {
        match self {
            Platform::CiscoAsa => Some("terminal pager 0"),
            Platform::CiscoIos | Platform::CiscoXe | Platform::CiscoNxos | Platform::CiscoXr => {
                Some("terminal length 0")
            }
            Platform::Other(_) => None,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Platform::CiscoIos => "cisco_ios",
            Platform::CiscoXe => "cisco_xe",
            Platform::CiscoNxos => "cisco_nxos",
            Platform::CiscoXr => "cisco_xr",
            Platform::CiscoAsa => "cisco_asa",
            Platform::Other(name) => name,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One device, with every inherited attribute resolved.
#[derive(Clone, Debug, PartialEq)]
pub struct Device {
    /// The device's unique name. Also the name of its backup file.
    pub name: String,

    /// The address to connect to.
    pub address: String,

    /// `None` when neither the host, its groups, nor the defaults name one.
    pub platform: Option<Platform>,

    pub port: u16,

    /// Credential material from the inventory, if any.
    pub credentials: InventoryCredentials,

    /// Free-form attributes. Host values override group values, which override defaults.
    pub data: IndexMap<String, Value>,
}

impl Device {
    /// Creates a device with the default port, no credential material, and no data.
    pub fn new(name: impl Into<String>, address: impl Into<String>, platform: Platform) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            platform: Some(platform),
            port: DEFAULT_PORT,
            credentials: InventoryCredentials::default(),
            data: IndexMap::new(),
        }
    }

    /// The command that retrieves this device's running configuration.
    ///
    /// This is the platform's command unless the device's data sets [BACKUP_COMMAND_KEY]. `None`
    /// means neither is available and the device can't be backed up.
    pub fn backup_command(&self) -> Option<&str> {
        match self.data.get(BACKUP_COMMAND_KEY) {
            Some(Value::String(command)) if !command.trim().is_empty() => Some(command),
            _ => self.platform.as_ref().and_then(Platform::backup_command),
        }
    }

    /// The platform name for messages, or `unset`.
    pub fn platform_name(&self) -> &str {
        self.platform.as_ref().map_or("unset", Platform::name)
    }

    /// The HTTPS management port, when the device is an ASA with HTTPS management turned on.
    pub fn http_management_port(&self) -> Option<u16> {
        if self.platform != Some(Platform::CiscoAsa) {
            return None;
        }
        match self.data.get(HTTP_MANAGEMENT_KEY) {
            Some(Value::Bool(true)) => {}
            _ => return None,
        }
        let port = match self.data.get(HTTP_PORT_KEY) {
            Some(Value::Number(port)) => port.as_u64().and_then(|p| u16::try_from(p).ok()),
            _ => None,
        };
        Some(port.unwrap_or(DEFAULT_HTTP_PORT))
    }
}

/// Paths to the inventory files.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct InventoryPaths {
    pub hosts: PathBuf,

    /// Defaults to `groups.yaml` beside the hosts file, if that file exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub groups: Option<PathBuf>,

    /// Defaults to `defaults.yaml` beside the hosts file, if that file exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub defaults: Option<PathBuf>,
}

impl Default for InventoryPaths {
    fn default() -> Self {
        Self {
            hosts: config::config_dir().join("hosts.yaml"),
            groups: None,
            defaults: None,
        }
    }
}

impl InventoryPaths {
    fn groups_path(&self) -> Option<PathBuf> {
        self.sibling_or(&self.groups, "groups.yaml")
    }

    fn defaults_path(&self) -> Option<PathBuf> {
        self.sibling_or(&self.defaults, "defaults.yaml")
    }

    fn sibling_or(&self, configured: &Option<PathBuf>, file_name: &str) -> Option<PathBuf> {
        if configured.is_some() {
            return configured.clone();
        }
        let sibling = self.hosts.with_file_name(file_name);
        sibling.is_file().then_some(sibling)
    }
}

/// Errors that prevent the inventory from loading.
#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("could not read inventory file {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("could not parse inventory file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("{member} belongs to group {group}, which is not defined")]
    UnknownGroup { member: String, group: String },

    #[error("group {0} is its own ancestor")]
    GroupCycle(String),

    #[error("host name {0:?} cannot be used as a backup file name")]
    InvalidName(String),

    #[error("host {0} is defined more than once")]
    DuplicateHost(String),
}

// The attributes shared by hosts, groups, and defaults. Defaults ignore `groups`.
#[derive(Clone, Debug, Default, Deserialize)]
struct Entry {
    hostname: Option<String>,
    platform: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    #[serde(default)]
    groups: Vec<String>,
    #[serde(default)]
    data: IndexMap<String, Value>,
    #[serde(default)]
    connection_options: IndexMap<String, ConnectionOptions>,
}

#[derive(Clone, Debug, Default, Deserialize)]
struct ConnectionOptions {
    #[serde(default)]
    extras: IndexMap<String, Value>,
}

impl CredentialMaterial {
    // The first value of each field along `entries`.
    fn from_entries(entries: &[&Entry]) -> Self {
        let first = |field: fn(&Entry) -> Option<String>| entries.iter().find_map(|e| field(e));
        Self {
            username: first(|e| e.username.clone()),
            password: first(|e| e.password.clone()),
            secret: first(Entry::secret),
        }
    }
}

impl Entry {
    // The enable secret, read from any connection plugin's extras.
    fn secret(&self) -> Option<String> {
        self.connection_options
            .values()
            .find_map(|options| match options.extras.get("secret") {
                Some(Value::String(secret)) => Some(secret.clone()),
                _ => None,
            })
    }
}

/// The loaded inventory: a list of devices in file order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Inventory {
    devices: Vec<Device>,
}

impl Inventory {
    /// Builds an inventory from already-resolved devices.
    ///
    /// # Errors
    ///
    /// Returns an error if two devices share a name, or if a name isn't a safe file name.
    pub fn new(devices: Vec<Device>) -> Result<Self, InventoryError> {
        let mut seen = std::collections::HashSet::new();
        for device in &devices {
            if !store::is_valid_hostname(&device.name) {
                return Err(InventoryError::InvalidName(device.name.clone()));
            }
            if !seen.insert(device.name.as_str()) {
                return Err(InventoryError::DuplicateHost(device.name.clone()));
            }
        }
        Ok(Self { devices })
    }

    /// Reads and resolves the inventory files.
    ///
    /// # Errors
    ///
    /// Returns an error if a file can't be read or parsed, or if any host fails to resolve. See
    /// [InventoryError].
    pub fn load(paths: &InventoryPaths) -> Result<Self, InventoryError> {
        let hosts = read(&paths.hosts)?;
        let groups = paths.groups_path().map(|p| read(&p).map(|t| (p, t))).transpose()?;
        let defaults = paths.defaults_path().map(|p| read(&p).map(|t| (p, t))).transpose()?;

        let inventory = Self::parse(
            (&paths.hosts, &hosts),
            groups.as_ref().map(|(p, t)| (p.as_path(), t.as_str())),
            defaults.as_ref().map(|(p, t)| (p.as_path(), t.as_str())),
        )?;
        info!(
            hosts = %paths.hosts.display(),
            devices = inventory.len(),
            "loaded inventory",
        );
        Ok(inventory)
    }

    /// Resolves an inventory from YAML text. `groups` and `defaults` may be empty.
    pub fn from_yaml(hosts: &str, groups: &str, defaults: &str) -> Result<Self, InventoryError> {
        Self::parse(
            (Path::new("hosts.yaml"), hosts),
            Some((Path::new("groups.yaml"), groups)),
            Some((Path::new("defaults.yaml"), defaults)),
        )
    }

    fn parse(
        hosts: (&Path, &str),
        groups: Option<(&Path, &str)>,
        defaults: Option<(&Path, &str)>,
    ) -> Result<Self, InventoryError> {
        let hosts: IndexMap<String, Entry> = parse_yaml(hosts.0, hosts.1)?;
        let groups: IndexMap<String, Entry> = match groups {
            Some((path, text)) => parse_yaml(path, text)?,
            None => IndexMap::new(),
        };
        let defaults: Entry = match defaults {
            Some((path, text)) => parse_yaml(path, text)?,
            None => Entry::default(),
        };

        let resolver = Resolver {
            groups: &groups,
            defaults: &defaults,
        };
        let devices = hosts
            .iter()
            .map(|(name, entry)| resolver.device(name, entry))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(devices)
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn into_devices(self) -> Vec<Device> {
        self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.name == name)
    }

    /// Keeps only the devices whose address appears in `addresses`. An empty list keeps
    /// everything.
    pub fn filter_addresses(mut self, addresses: &[String]) -> Self {
        if addresses.is_empty() {
            return self;
        }
        let before = self.devices.len();
        self.devices
            .retain(|d| addresses.iter().any(|a| a.trim() == d.address));
        debug!(
            before,
            after = self.devices.len(),
            "filtered inventory by address",
        );
        self
    }
}

fn read(path: &Path) -> Result<String, InventoryError> {
    fs::read_to_string(path).map_err(|source| InventoryError::Io {
        path: path.to_owned(),
        source,
    })
}

// An empty file is an empty inventory, not a parse error.
fn parse_yaml<T: Default + serde::de::DeserializeOwned>(
    path: &Path,
    text: &str,
) -> Result<T, InventoryError> {
    serde_yaml::from_str::<Option<T>>(text)
        .map(Option::unwrap_or_default)
        .map_err(|source| InventoryError::Parse {
            path: path.to_owned(),
            source,
        })
}

/// Walks a host's groups and the defaults to resolve its attributes.
struct Resolver<'i> {
    groups: &'i IndexMap<String, Entry>,
    defaults: &'i Entry,
}

impl<'i> Resolver<'i> {
    fn device(&self, name: &str, host: &'i Entry) -> Result<Device, InventoryError> {
        let mut chain = vec![host];
        let mut path = Vec::new();
        self.collect_groups(name, host, &mut chain, &mut path)?;
        let assigned = chain.len();
        chain.push(self.defaults);

        let first = |field: fn(&Entry) -> Option<String>| chain.iter().find_map(|e| field(e));

        let platform = first(|e| e.platform.clone()).map(|p| Platform::from_name(&p));
        if platform.is_none() {
            debug!(host = name, "host has no platform");
        }

        let mut data = IndexMap::new();
        for entry in chain.iter().rev() {
            data.extend(entry.data.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        Ok(Device {
            name: name.to_owned(),
            address: first(|e| e.hostname.clone()).unwrap_or_else(|| name.to_owned()),
            platform,
            port: chain.iter().find_map(|e| e.port).unwrap_or(DEFAULT_PORT),
            credentials: InventoryCredentials {
                assigned: CredentialMaterial::from_entries(&chain[..assigned]),
                defaults: CredentialMaterial::from_entries(&chain[assigned..]),
            },
            data,
        })
    }

    // Appends `entry`'s groups, and their parents, depth-first. `path` holds the groups currently
    // being expanded so that cycles are caught instead of recursing forever.
    fn collect_groups(
        &self,
        member: &str,
        entry: &'i Entry,
        chain: &mut Vec<&'i Entry>,
        path: &mut Vec<String>,
    ) -> Result<(), InventoryError> {
        for group in &entry.groups {
            if path.contains(group) {
                return Err(InventoryError::GroupCycle(group.clone()));
            }
            let Some(group_entry) = self.groups.get(group) else {
                return Err(InventoryError::UnknownGroup {
                    member: member.to_owned(),
                    group: group.clone(),
                });
            };
            chain.push(group_entry);
            path.push(group.clone());
            self.collect_groups(group, group_entry, chain, path)?;
            path.pop();
        }
        Ok(())
    }
}

#[cfg(test)]
mod test;
