//! Password-authenticated SSH sessions to device CLIs.

use super::terminal::{Shell, Terminal};
use super::{ConnectOptions, DeviceError};
use crate::credentials::CredentialSet;
use crate::inventory::Device;
use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::{Channel, ChannelMsg};
use russh_keys::key::PublicKey;
use std::sync::Arc;
use tracing::{debug, warn};

// Wide enough that devices don't wrap long configuration lines.
const TERMINAL_WIDTH: u32 = 511;
const TERMINAL_HEIGHT: u32 = 24;

/// Logs in to `device` with the password in `credentials` and opens its CLI.
///
/// # Errors
///
/// Returns [DeviceError::AuthenticationFailed] if the device rejects the login, and other
/// variants if the connection or the shell can't be set up.
pub async fn open(
    device: &Device,
    credentials: &CredentialSet,
    options: &ConnectOptions,
) -> Result<Terminal<ChannelShell>, DeviceError> {
    let config = Arc::new(client::Config {
        inactivity_timeout: options.timeout,
        ..Default::default()
    });
    let verifier = KnownHosts {
        address: device.address.clone(),
        port: device.port,
    };

    debug!(host = %device.name, address = %device.address, port = device.port, "connecting");
    let mut handle = client::connect(config, (device.address.as_str(), device.port), verifier)
        .await
        .map_err(|e| DeviceError::Connect(e.to_string()))?;

    let accepted = handle
        .authenticate_password(credentials.username(), credentials.password())
        .await
        .map_err(|e| DeviceError::Connect(e.to_string()))?;
    if !accepted {
        return Err(DeviceError::AuthenticationFailed(
            credentials.username().to_owned(),
        ));
    }

    let session = |e: russh::Error| DeviceError::Session(e.to_string());
    let mut channel = handle.channel_open_session().await.map_err(session)?;
    channel
        .request_pty(false, "vt100", TERMINAL_WIDTH, TERMINAL_HEIGHT, 0, 0, &[])
        .await
        .map_err(session)?;
    channel.request_shell(false).await.map_err(session)?;

    let shell = ChannelShell {
        _handle: handle,
        channel,
    };
    Terminal::open(shell, credentials, device.platform.as_ref()).await
}

/// An interactive shell channel. The session stays open as long as this does.
pub struct ChannelShell {
    _handle: Handle<KnownHosts>,
    channel: Channel<Msg>,
}

#[async_trait]
impl Shell for ChannelShell {
    async fn send(&mut self, data: &[u8]) -> Result<(), DeviceError> {
        self.channel
            .data(data)
            .await
            .map_err(|e| DeviceError::Session(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>, DeviceError> {
        loop {
            match self.channel.wait().await {
                Some(ChannelMsg::Data { ref data }) => return Ok(Some(data.to_vec())),
                Some(ChannelMsg::ExtendedData { ref data, .. }) => return Ok(Some(data.to_vec())),
                Some(ChannelMsg::Eof | ChannelMsg::Close) | None => return Ok(None),
                Some(_) => {}
            }
        }
    }
}

/// Accepts keys from `~/.ssh/known_hosts`, and learns the key of a device seen for the first time.
/// A device whose key has changed is refused.
pub struct KnownHosts {
    address: String,
    port: u16,
}

#[async_trait]
impl client::Handler for KnownHosts {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        match russh_keys::check_known_hosts(&self.address, self.port, server_public_key) {
            Ok(true) => Ok(true),
            Ok(false) => {
                if let Err(e) =
                    russh_keys::learn_known_hosts(&self.address, self.port, server_public_key)
                {
                    warn!(address = %self.address, error = %e, "could not record host key");
                }
                Ok(true)
            }
            Err(e) => {
                warn!(address = %self.address, error = %e, "refusing host key");
                Ok(false)
            }
        }
    }
}
