//! Drives a network device's interactive CLI.
//!
//! Devices that don't accept a command on the SSH exec channel are driven through a shell
//! instead: wait for the prompt, raise privileges with `enable` when the prompt says the session
//! isn't privileged, turn off paging, then send one command at a time and collect everything up to
//! the next prompt.

use super::{ClientInterface, DeviceError};
use crate::credentials::CredentialSet;
use crate::inventory::Platform;
use async_trait::async_trait;
use regex::Regex;
use std::sync::OnceLock;
use tracing::debug;

/// A byte stream to and from an interactive device CLI.
#[async_trait]
pub trait Shell: Send {
    async fn send(&mut self, data: &[u8]) -> Result<(), DeviceError>;

    /// Waits for more output. `None` once the device has closed the session.
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, DeviceError>;
}

/// An interactive CLI session that is ready to take commands.
pub struct Terminal<S> {
    shell: S,
    buffer: Vec<u8>,
}

impl<S: Shell> Terminal<S> {
    /// Waits for the first prompt, enters enable mode if needed, and turns off paging.
    ///
    /// Only the Cisco families get `enable` and paging commands. Other platforms are used at
    /// whatever privilege the login lands on.
    ///
    /// # Errors
    ///
    /// Returns [DeviceError::Enable] if the device keeps an unprivileged prompt after the enable
    /// password is sent, or any error from the shell.
    pub async fn open(
        shell: S,
        credentials: &CredentialSet,
        platform: Option<&Platform>,
    ) -> Result<Self, DeviceError> {
        let mut terminal = Self {
            shell,
            buffer: Vec::new(),
        };
        let banner = terminal.read_until(|line| is_prompt(line)).await?;
        let cisco = platform.is_some_and(|p| p.disable_paging().is_some());

        if cisco && last_line(&banner).ends_with('>') {
            terminal.enable(credentials.enable_password()).await?;
        }
        if let Some(command) = platform.and_then(Platform::disable_paging) {
            terminal.send_line(command).await?;
            terminal.read_until(|line| is_prompt(line)).await?;
        }
        Ok(terminal)
    }

    async fn enable(&mut self, password: &str) -> Result<(), DeviceError> {
        debug!("entering enable mode");
        self.send_line("enable").await?;
        let reply = self
            .read_until(|line| is_prompt(line) || is_password_prompt(line))
            .await?;
        let reply = if is_password_prompt(last_line(&reply)) {
            self.send_line(password).await?;
            self.read_until(|line| is_prompt(line)).await?
        } else {
            reply
        };

        if last_line(&reply).ends_with('#') {
            Ok(())
        } else {
            Err(DeviceError::Enable(
                "the device did not accept the enable password".to_owned(),
            ))
        }
    }

    async fn send_line(&mut self, line: &str) -> Result<(), DeviceError> {
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        self.shell.send(&data).await
    }

    // Collects output until its last line satisfies `done`, and returns it.
    async fn read_until(&mut self, done: impl Fn(&str) -> bool) -> Result<String, DeviceError> {
        let raw = self.read_raw_until(done).await?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    async fn read_raw_until(&mut self, done: impl Fn(&str) -> bool) -> Result<Vec<u8>, DeviceError> {
        while !done(last_line(&String::from_utf8_lossy(&self.buffer))) {
            match self.shell.recv().await? {
                Some(chunk) => self.buffer.extend_from_slice(&chunk),
                None => {
                    return Err(DeviceError::Session(
                        "the device closed the session".to_owned(),
                    ))
                }
            }
        }
        Ok(std::mem::take(&mut self.buffer))
    }
}

#[async_trait]
impl<S: Shell> ClientInterface for Terminal<S> {
    async fn run(&mut self, command: &str) -> Result<String, DeviceError> {
        self.send_line(command).await?;
        let raw = self.read_raw_until(|line| is_prompt(line)).await?;
        let text =
            String::from_utf8(raw).map_err(|_| DeviceError::NonUtf8Output(command.to_owned()))?;
        Ok(command_output(&text, command))
    }
}

/// Strips the echoed command and the closing prompt from a command's transcript.
pub fn command_output(transcript: &str, command: &str) -> String {
    let transcript = transcript.replace("\r\n", "\n").replace('\r', "");
    let mut lines: Vec<&str> = transcript.split('\n').collect();

    if lines.last().is_some_and(|line| is_prompt(line)) {
        lines.pop();
    }
    if lines.first().is_some_and(|line| line.trim_end().ends_with(command.trim())) {
        lines.remove(0);
    }

    let mut output = lines.join("\n");
    if !output.is_empty() && !output.ends_with('\n') {
        output.push('\n');
    }
    output
}

fn last_line(text: &str) -> &str {
    text.rsplit('\n').next().unwrap_or(text)
}

/// Whether `line` is a CLI prompt, such as `core-sw1>`, `fw1/admin#` or `r1(config)#`.
pub fn is_prompt(line: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"^[\w.\-@/:]+(\([\w.\-/]+\))?[>#]$")
                .expect("prompt pattern should be a valid regex")
        })
        .is_match(line.trim())
}

fn is_password_prompt(line: &str) -> bool {
    line.trim_end().to_ascii_lowercase().ends_with("password:")
}
