//! Provides an interface to run read-only commands on network devices.
//!
//! The executor only talks to devices through [ManageClient] and [ClientInterface], so tests can
//! substitute fakes. The production implementations, [ConnectionManager] and [Client], log in over
//! SSH with the run's password and drive the device CLI through a [terminal::Terminal]. ASAs with
//! HTTPS management turned on are asked over HTTPS first and fall back to SSH. Both transports are
//! only available with the `transport` feature.

pub mod terminal;

#[cfg(feature = "transport")]
pub mod asdm;
#[cfg(feature = "transport")]
pub mod ssh;

use crate::credentials::CredentialSet;
use crate::inventory::Device;
use async_trait::async_trait;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;

#[cfg(feature = "transport")]
use crate::run_backups::check_output;
#[cfg(feature = "transport")]
use tracing::{debug, warn};

/// How long the reachability probe waits for a management port to accept a connection.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Connects to devices and returns values representing those connections.
#[async_trait]
pub trait ManageClient<CI: ClientInterface> {
    /// Connect to `device` as the user in `credentials` and, on success, return an interface to
    /// the device.
    async fn connect(
        &mut self,
        device: &Device,
        credentials: &CredentialSet,
    ) -> Result<CI, DeviceError>;
}

/// The interface Stockpiler uses to talk to a connected device.
#[async_trait]
pub trait ClientInterface {
    /// Runs `command` on the device and returns everything it printed.
    async fn run(&mut self, command: &str) -> Result<String, DeviceError>;
}

/// Why a single device could not be backed up. These never abort a run.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("cannot reach {address}:{port}: {source}")]
    Unreachable {
        address: String,
        port: u16,
        source: io::Error,
    },

    #[error("SSH connection failed: {0}")]
    Connect(String),

    #[error("the device rejected the login for {0}")]
    AuthenticationFailed(String),

    #[error("SSH session failed: {0}")]
    Session(String),

    #[error("could not enter enable mode: {0}")]
    Enable(String),

    #[error("HTTPS management failed: {0}")]
    Http(String),

    #[error("no backup command is known for platform {0}; set data.backup_command")]
    UnsupportedPlatform(String),

    #[error("`{command}` failed: {reason}")]
    Command { command: String, reason: String },

    #[error("command authorization failed for `{0}`")]
    Unauthorized(String),

    #[error("`{0}` returned no output")]
    EmptyOutput(String),

    #[error("`{0}` returned output that is not valid UTF-8")]
    NonUtf8Output(String),

    #[error("timed out after {}s", .0.as_secs_f64())]
    TimedOut(Duration),

    #[error("device task ended abnormally: {0}")]
    Aborted(String),

    #[error("run cancelled before the device finished")]
    Cancelled,
}

/// Checks that something accepts TCP connections on `address:port`.
///
/// This catches dead or filtered devices in `timeout` instead of waiting out SSH's own
/// connection timeout.
pub async fn probe(address: &str, port: u16, timeout: Duration) -> Result<(), DeviceError> {
    let unreachable = |source| DeviceError::Unreachable {
        address: address.to_owned(),
        port,
        source,
    };
    match tokio::time::timeout(timeout, TcpStream::connect((address, port))).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(unreachable(e)),
        Err(_) => Err(unreachable(io::Error::new(
            io::ErrorKind::TimedOut,
            "no response to TCP probe",
        ))),
    }
}

/// Settings shared by every device connection in a run.
#[cfg(feature = "transport")]
#[derive(Clone, Debug, Default)]
pub struct ConnectOptions {
    /// A SOCKS5 proxy, as `host:port`, for HTTPS management. SSH always connects directly.
    pub proxy: Option<String>,

    /// Limits connecting, and how long a session may sit idle.
    pub timeout: Option<Duration>,
}

/// Production implementation of [ManageClient].
#[cfg(feature = "transport")]
#[derive(Clone, Debug, Default)]
pub struct ConnectionManager {
    options: ConnectOptions,
}

#[cfg(feature = "transport")]
impl ConnectionManager {
    pub fn new(options: ConnectOptions) -> Self {
        Self { options }
    }
}

#[cfg(feature = "transport")]
#[async_trait]
impl ManageClient<Client> for ConnectionManager {
    async fn connect(
        &mut self,
        device: &Device,
        credentials: &CredentialSet,
    ) -> Result<Client, DeviceError> {
        let ssh = probe(&device.address, device.port, PROBE_TIMEOUT).await;

        // A port probe can't see past a proxy, so with one HTTPS is simply tried.
        let https = match device.http_management_port() {
            Some(port) => {
                let reachable = self.options.proxy.is_some()
                    || probe(&device.address, port, PROBE_TIMEOUT).await.is_ok();
                if reachable {
                    Some(asdm::AsdmClient::new(device, port, credentials, &self.options)?)
                } else {
                    debug!(host = %device.name, port, "HTTPS management port is unreachable");
                    None
                }
            }
            None => None,
        };

        let mut client = Client {
            device: device.clone(),
            credentials: credentials.clone(),
            options: self.options.clone(),
            https,
            ssh_reachable: ssh.is_ok(),
            terminal: None,
        };
        if client.https.is_none() {
            ssh?;
            client.terminal = Some(ssh::open(device, credentials, &self.options).await?);
        }
        Ok(client)
    }
}

/// Production implementation of [ClientInterface].
///
/// Commands go over HTTPS while that works, and over an SSH terminal otherwise. The terminal is
/// only opened once it is needed.
#[cfg(feature = "transport")]
pub struct Client {
    device: Device,
    credentials: CredentialSet,
    options: ConnectOptions,
    https: Option<asdm::AsdmClient>,
    ssh_reachable: bool,
    terminal: Option<terminal::Terminal<ssh::ChannelShell>>,
}

#[cfg(feature = "transport")]
#[async_trait]
impl ClientInterface for Client {
    async fn run(&mut self, command: &str) -> Result<String, DeviceError> {
        if let Some(https) = self.https.take() {
            match https.exec(command).await.and_then(|output| check_output(command, output)) {
                Ok(output) => {
                    self.https = Some(https);
                    return Ok(output);
                }
                Err(e) if self.ssh_reachable => {
                    warn!(host = %self.device.name, error = %e, "HTTPS failed, falling back to SSH");
                }
                Err(e) => return Err(e),
            }
        }

        let mut terminal = match self.terminal.take() {
            Some(terminal) => terminal,
            None => ssh::open(&self.device, &self.credentials, &self.options).await?,
        };
        let output = terminal.run(command).await;
        self.terminal = Some(terminal);
        output
    }
}
