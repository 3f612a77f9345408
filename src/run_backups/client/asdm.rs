//! Runs commands on an ASA through its HTTPS management interface.
//!
//! ASDM accepts `GET /admin/exec/<command>` with basic authentication and answers with the
//! command's output as plain text.

use super::{ConnectOptions, DeviceError};
use crate::credentials::CredentialSet;
use crate::inventory::Device;
use std::net::IpAddr;

const USER_AGENT: &str = "ASDM";

pub struct AsdmClient {
    http: reqwest::Client,
    address: String,
    port: u16,
    username: String,
    password: String,
}

impl AsdmClient {
    /// Prepares a client for `device`'s management interface on `port`.
    ///
    /// Certificates are only verified when the device is addressed by name; an address can't
    /// match the name in a certificate.
    ///
    /// # Errors
    ///
    /// Returns [DeviceError::Http] if the proxy is unusable or the client can't be built.
    pub fn new(
        device: &Device,
        port: u16,
        credentials: &CredentialSet,
        options: &ConnectOptions,
    ) -> Result<Self, DeviceError> {
        let by_address = device.address.parse::<IpAddr>().is_ok();
        let mut builder = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .danger_accept_invalid_certs(by_address);
        if let Some(timeout) = options.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(ref proxy) = options.proxy {
            let proxy = reqwest::Proxy::all(format!("socks5://{proxy}"))
                .map_err(|e| DeviceError::Http(format!("unusable proxy {proxy}: {e}")))?;
            builder = builder.proxy(proxy);
        }
        let http = builder
            .build()
            .map_err(|e| DeviceError::Http(format!("could not create HTTP client: {e}")))?;

        Ok(Self {
            http,
            address: device.address.clone(),
            port,
            username: credentials.username().to_owned(),
            password: credentials.password().to_owned(),
        })
    }

    /// Runs `command` and returns the response body.
    pub async fn exec(&self, command: &str) -> Result<String, DeviceError> {
        let url = exec_url(&self.address, self.port, command);
        let response = self
            .http
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DeviceError::Http(format!("timed out waiting for {}", self.address))
                } else {
                    DeviceError::Http(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeviceError::Command {
                command: command.to_owned(),
                reason: format!("HTTP status {status}"),
            });
        }
        response
            .text()
            .await
            .map_err(|e| DeviceError::Http(e.to_string()))
    }
}

/// The URL that runs `command`. Spaces become `+`, as ASDM expects.
pub fn exec_url(address: &str, port: u16, command: &str) -> String {
    let command = urlencoding::encode(command).replace("%20", "+");
    let host = match address.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => format!("[{v6}]"),
        _ => address.to_owned(),
    };
    format!("https://{host}:{port}/admin/exec/{command}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_url_encodes_the_command() {
        assert_eq!(
            "https://10.0.0.254:8443/admin/exec/more+system%3Arunning-config",
            exec_url("10.0.0.254", 8443, "more system:running-config"),
        );
        assert_eq!(
            "https://fw1.example.net:443/admin/exec/write+mem",
            exec_url("fw1.example.net", 443, "write mem"),
        );
    }

    #[test]
    fn exec_url_brackets_ipv6() {
        assert_eq!(
            "https://[2001:db8::1]:8443/admin/exec/show+version",
            exec_url("2001:db8::1", 8443, "show version"),
        );
    }

    #[test]
    fn proxy_is_socks5() {
        let device = Device::new("fw1", "192.0.2.1", crate::inventory::Platform::CiscoAsa);
        let credentials = CredentialSet::new("admin", "pw", None).unwrap();
        let options = ConnectOptions {
            proxy: Some("127.0.0.1:1080".to_owned()),
            timeout: None,
        };
        assert!(AsdmClient::new(&device, 8443, &credentials, &options).is_ok());
    }
}
