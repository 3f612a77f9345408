//! Resolves the login credentials used for every device in a run.
//!
//! Credentials come from exactly one [CredentialMode], chosen by configuration. Resolution happens
//! once per run, before any device is contacted, so a bad credential source fails the whole run
//! immediately instead of failing once per device.
//!
//! The public entry point is [resolve]. The logic lives in [_resolve], which takes its
//! environment and terminal as trait objects so tests never touch the real process state.

use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::{self, BufRead, IsTerminal, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Environment variable holding the login username.
pub const USER_VAR: &str = "STOCKPILER_USER";

/// Environment variable holding the login password.
pub const PASSWORD_VAR: &str = "STOCKPILER_PW";

/// Environment variable holding the enable password. Optional.
pub const ENABLE_VAR: &str = "STOCKPILER_ENABLE";

// Older credential files spell the enable key this way.
const ENABLE_ALIAS: &str = "STOCKPILER_EN";

/// Where a run's credentials come from.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CredentialMode {
    /// Read [USER_VAR], [PASSWORD_VAR] and [ENABLE_VAR] from the process environment.
    #[default]
    Environment,

    /// Ask on the terminal. Requires an interactive stdin.
    Prompt,

    /// Read a Base64-encoded file of `KEY:VALUE` lines. The file must be private to its owner.
    EncodedFile { path: PathBuf },

    /// Take credentials from the inventory, per device.
    Inventory,
}

/// Decides who wins when both the inventory and the run supply credential material for a device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialPrecedence {
    /// A login set on a host or its groups overrides the run's. The run's overrides the inventory
    /// defaults.
    #[default]
    Inventory,

    /// Run credentials are used for every device; inventory material is ignored.
    Run,
}

/// A validated username, password, and enable password.
///
/// All three fields are guaranteed non-empty. The [Debug] implementation redacts both secrets.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialSet {
    username: String,
    password: String,
    enable_password: String,
}

impl CredentialSet {
    /// Builds a credential set. An absent or empty `enable_password` falls back to `password`.
    ///
    /// # Errors
    ///
    /// Returns [CredentialError::Empty] if `username` or `password` is empty.
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        enable_password: Option<String>,
    ) -> Result<Self, CredentialError> {
        let username = username.into();
        let password = password.into();
        if username.is_empty() {
            return Err(CredentialError::Empty("username"));
        }
        if password.is_empty() {
            return Err(CredentialError::Empty("password"));
        }
        let enable_password = enable_password
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| password.clone());

        Ok(Self {
            username,
            password,
            enable_password,
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn enable_password(&self) -> &str {
        &self.enable_password
    }
}

impl fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSet")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("enable_password", &"<redacted>")
            .finish()
    }
}

/// The outcome of [resolve].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Credentials {
    /// A single credential set for the whole run.
    Resolved(CredentialSet),

    /// Nothing was resolved. Each device's credentials come from the inventory.
    FromInventory,
}

/// Credential material from one level of the inventory. Every field is optional.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CredentialMaterial {
    pub username: Option<String>,
    pub password: Option<String>,
    pub secret: Option<String>,
}

impl CredentialMaterial {
    /// The username and password, which only ever travel together.
    ///
    /// # Errors
    ///
    /// Returns [CredentialError::MissingInventoryCredential] naming the absent half when only one
    /// of the two is set.
    fn login(&self, host: &str) -> Result<Option<(String, String)>, CredentialError> {
        let missing = |field| CredentialError::MissingInventoryCredential {
            host: host.to_owned(),
            field,
        };
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Ok(Some((username.clone(), password.clone()))),
            (Some(_), None) => Err(missing("password")),
            (None, Some(_)) => Err(missing("username")),
            (None, None) => Ok(None),
        }
    }
}

/// Credential material carried by the inventory for one device.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InventoryCredentials {
    /// Set on the host or inherited from one of its groups.
    pub assigned: CredentialMaterial,

    /// Set in the inventory defaults.
    pub defaults: CredentialMaterial,
}

impl Credentials {
    /// Computes the credential set for one device.
    ///
    /// A username and password are always taken together from a single source. With
    /// [Credentials::FromInventory], that source is the host and its groups, falling back to the
    /// inventory defaults. With [Credentials::Resolved] and [CredentialPrecedence::Inventory], a
    /// pair set on the host or its groups beats the run's pair, which beats the defaults. The
    /// enable password is the secret from the same ranking, or else the chosen password.
    ///
    /// # Errors
    ///
    /// Returns [CredentialError::MissingInventoryCredential] if a level that is consulted sets
    /// only half of a login, or if the inventory is the only source and has no login for `host`.
    pub fn for_device(
        &self,
        host: &str,
        material: &InventoryCredentials,
        precedence: CredentialPrecedence,
    ) -> Result<CredentialSet, CredentialError> {
        let InventoryCredentials { assigned, defaults } = material;
        let missing = |field| CredentialError::MissingInventoryCredential {
            host: host.to_owned(),
            field,
        };

        match (self, precedence) {
            (Credentials::Resolved(set), CredentialPrecedence::Run) => Ok(set.clone()),
            (Credentials::Resolved(set), CredentialPrecedence::Inventory) => {
                match assigned.login(host)? {
                    Some((username, password)) => {
                        CredentialSet::new(username, password, assigned.secret.clone())
                    }
                    None => CredentialSet::new(
                        set.username.clone(),
                        set.password.clone(),
                        assigned.secret.clone().or_else(|| Some(set.enable_password.clone())),
                    ),
                }
            }
            (Credentials::FromInventory, _) => {
                let (username, password) = match assigned.login(host)? {
                    Some(login) => login,
                    None => defaults.login(host)?.ok_or_else(|| missing("username"))?,
                };
                let secret = assigned.secret.clone().or_else(|| defaults.secret.clone());
                CredentialSet::new(username, password, secret).map_err(|e| match e {
                    CredentialError::Empty(field) => missing(field),
                    e => e,
                })
            }
        }
    }
}

/// Errors that prevent a run's credentials from being resolved.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("environment variable {0} is not set")]
    MissingVariable(&'static str),

    #[error("credential prompt requires an interactive terminal, but stdin is not a terminal")]
    NoTerminal,

    #[error("failed to read credentials from the terminal: {0}")]
    Prompt(#[source] io::Error),

    #[error("credential file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("could not read credential file {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error(
        "credential file {} has mode {mode:03o}; it must not be accessible to group or others \
        (try chmod 600)",
        path.display()
    )]
    Permissions { path: PathBuf, mode: u32 },

    #[error(
        "credential file {} is owned by uid {owner}, but stockpiler is running as uid {current}",
        path.display()
    )]
    Owner {
        path: PathBuf,
        owner: u32,
        current: u32,
    },

    #[error("credential file {} is not valid Base64: {source}", path.display())]
    Base64 {
        path: PathBuf,
        source: base64::DecodeError,
    },

    #[error("credential file {} does not decode to UTF-8 text: {source}", path.display())]
    Utf8 {
        path: PathBuf,
        source: std::string::FromUtf8Error,
    },

    #[error("credential file {}: {reason}", path.display())]
    Malformed { path: PathBuf, reason: String },

    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("the inventory provides no {field} for host {host}")]
    MissingInventoryCredential { host: String, field: &'static str },
}

impl CredentialError {
    /// Returns `true` for errors caused by the credential file's ownership or permissions.
    pub fn is_permission_error(&self) -> bool {
        matches!(self, Self::Permissions { .. } | Self::Owner { .. })
    }
}

/// A source of environment variables.
pub trait Environment {
    fn var(&self, key: &str) -> Option<String>;
}

/// The real process environment.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessEnvironment;

impl Environment for ProcessEnvironment {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl Environment for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// Reads credentials interactively.
pub trait Prompt {
    /// Whether there is a user to ask.
    fn is_interactive(&self) -> bool;

    /// Reads a line with echo.
    fn read_line(&mut self, prompt: &str) -> io::Result<String>;

    /// Reads a line without echo.
    fn read_secret(&mut self, prompt: &str) -> io::Result<String>;
}

/// The real terminal. Prompts go to stderr so that stdout stays clean for reports.
#[derive(Clone, Copy, Debug, Default)]
pub struct TerminalPrompt;

impl Prompt for TerminalPrompt {
    fn is_interactive(&self) -> bool {
        io::stdin().is_terminal()
    }

    fn read_line(&mut self, prompt: &str) -> io::Result<String> {
        let mut stderr = io::stderr().lock();
        write!(stderr, "{prompt}")?;
        stderr.flush()?;
        drop(stderr);

        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
        Ok(line.trim_end_matches(['\r', '\n']).to_owned())
    }

    fn read_secret(&mut self, prompt: &str) -> io::Result<String> {
        rpassword::prompt_password(prompt)
    }
}

/// Resolves credentials according to `mode`, using the real environment and terminal.
///
/// # Returns
///
/// [Credentials::Resolved] for every mode except [CredentialMode::Inventory], which returns
/// [Credentials::FromInventory] without reading anything.
///
/// # Errors
///
/// Returns a [CredentialError] describing the first problem found. See [_resolve].
pub fn resolve(mode: &CredentialMode) -> Result<Credentials, CredentialError> {
    _resolve(mode, &ProcessEnvironment, &mut TerminalPrompt)
}

/// A testable function containing the logic of [resolve].
pub fn _resolve(
    mode: &CredentialMode,
    env: &dyn Environment,
    prompt: &mut dyn Prompt,
) -> Result<Credentials, CredentialError> {
    let set = match mode {
        CredentialMode::Environment => from_environment(env)?,
        CredentialMode::Prompt => from_prompt(prompt)?,
        CredentialMode::EncodedFile { path } => from_encoded_file(path)?,
        CredentialMode::Inventory => {
            debug!("deferring credentials to the inventory");
            return Ok(Credentials::FromInventory);
        }
    };
    info!(username = %set.username(), "resolved run credentials");
    Ok(Credentials::Resolved(set))
}

fn from_environment(env: &dyn Environment) -> Result<CredentialSet, CredentialError> {
    let required = |key| {
        env.var(key)
            .filter(|v| !v.is_empty())
            .ok_or(CredentialError::MissingVariable(key))
    };
    let username = required(USER_VAR)?;
    let password = required(PASSWORD_VAR)?;
    CredentialSet::new(username, password, env.var(ENABLE_VAR))
}

fn from_prompt(prompt: &mut dyn Prompt) -> Result<CredentialSet, CredentialError> {
    if !prompt.is_interactive() {
        return Err(CredentialError::NoTerminal);
    }
    let username = prompt
        .read_line("Username: ")
        .map_err(CredentialError::Prompt)?;
    let password = prompt
        .read_secret("Password: ")
        .map_err(CredentialError::Prompt)?;
    let enable = prompt
        .read_secret("Enable password (leave blank to reuse the password): ")
        .map_err(CredentialError::Prompt)?;
    CredentialSet::new(username.trim(), password, Some(enable))
}

fn from_encoded_file(path: &Path) -> Result<CredentialSet, CredentialError> {
    let metadata = match fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(CredentialError::FileNotFound(path.to_owned()));
        }
        Err(source) => {
            return Err(CredentialError::Io {
                path: path.to_owned(),
                source,
            })
        }
    };

    // SAFETY: geteuid has no preconditions and cannot fail.
    let current = unsafe { libc::geteuid() };
    check_file_security(path, &metadata, current)?;

    let encoded = fs::read_to_string(path).map_err(|source| CredentialError::Io {
        path: path.to_owned(),
        source,
    })?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|source| CredentialError::Base64 {
            path: path.to_owned(),
            source,
        })?;
    let text = String::from_utf8(decoded).map_err(|source| CredentialError::Utf8 {
        path: path.to_owned(),
        source,
    })?;

    parse_credential_lines(&text).map_err(|e| match e {
        CredentialError::Malformed { reason, .. } => CredentialError::Malformed {
            path: path.to_owned(),
            reason,
        },
        e => e,
    })
}

/// Refuses credential files that other users could read or that belong to someone else.
fn check_file_security(
    path: &Path,
    metadata: &fs::Metadata,
    current_uid: u32,
) -> Result<(), CredentialError> {
    let mode = metadata.mode() & 0o777;
    if mode & 0o077 != 0 {
        return Err(CredentialError::Permissions {
            path: path.to_owned(),
            mode,
        });
    }
    if metadata.uid() != current_uid {
        return Err(CredentialError::Owner {
            path: path.to_owned(),
            owner: metadata.uid(),
            current: current_uid,
        });
    }
    Ok(())
}

/// Parses decoded credential file text. Returned [CredentialError::Malformed] values carry an
/// empty path; the caller fills it in.
fn parse_credential_lines(text: &str) -> Result<CredentialSet, CredentialError> {
    let malformed = |reason: String| CredentialError::Malformed {
        path: PathBuf::new(),
        reason,
    };

    let mut username = None;
    let mut password = None;
    let mut enable = None;

    for (number, line) in text.lines().enumerate().map(|(i, l)| (i + 1, l.trim())) {
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            return Err(malformed(format!("line {number} is not a KEY:VALUE pair")));
        };
        let (key, value) = (key.trim(), value.trim());
        let slot = match key {
            USER_VAR => &mut username,
            PASSWORD_VAR => &mut password,
            ENABLE_VAR | ENABLE_ALIAS => &mut enable,
            other => return Err(malformed(format!("line {number} has unknown key {other:?}"))),
        };
        if slot.replace(value.to_owned()).is_some() {
            return Err(malformed(format!("line {number} repeats key {key}")));
        }
    }

    let username = username.ok_or_else(|| malformed(format!("missing {USER_VAR}")))?;
    let password = password.ok_or_else(|| malformed(format!("missing {PASSWORD_VAR}")))?;
    CredentialSet::new(username, password, enable)
}
