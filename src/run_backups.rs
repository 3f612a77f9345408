//! Fans device tasks out over a bounded worker pool.
//!
//! Each device gets one task: connect, run the backup command, and check the output. Tasks run on
//! their own tokio tasks, so a failure of any kind, panics included, becomes that device's
//! [Outcome::Failure] and never disturbs the other devices.

pub mod client;

use crate::credentials::CredentialSet;
use crate::inventory::Device;
use client::{ClientInterface, DeviceError, ManageClient};
use futures::stream::{self, BoxStream, StreamExt};
use regex::Regex;
use std::num::NonZeroUsize;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// The default number of devices contacted at once.
pub const DEFAULT_WORKERS: usize = 20;

/// One unit of work: a device, the credentials to use on it, and the command to run.
#[derive(Clone, Debug)]
pub struct DeviceJob {
    pub device: Device,
    pub credentials: Arc<CredentialSet>,

    /// `None` when no backup command is known for the device. Such a job fails without
    /// contacting the device.
    pub command: Option<String>,
}

impl DeviceJob {
    /// A job that retrieves `device`'s running configuration.
    pub fn backup(device: Device, credentials: Arc<CredentialSet>) -> Self {
        let command = device.backup_command().map(str::to_owned);
        Self {
            device,
            credentials,
            command,
        }
    }

    /// A job that runs an arbitrary read-only `command` on `device`.
    pub fn command(
        device: Device,
        credentials: Arc<CredentialSet>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            device,
            credentials,
            command: Some(command.into()),
        }
    }
}

/// How a device task ended.
#[derive(Debug)]
pub enum Outcome {
    /// The command's complete output.
    Success(String),
    Failure(DeviceError),
}

/// The result of one device task. Exactly one is produced per job.
#[derive(Debug)]
pub struct DeviceResult {
    pub hostname: String,
    pub outcome: Outcome,
}

impl DeviceResult {
    pub fn failure(hostname: impl Into<String>, error: DeviceError) -> Self {
        Self {
            hostname: hostname.into(),
            outcome: Outcome::Failure(error),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success(_))
    }
}

/// Limits applied to every device task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecutorOptions {
    /// How many devices may be in progress at once.
    pub workers: NonZeroUsize,

    /// How long a single device may take, from connecting to receiving all output.
    pub timeout: Option<Duration>,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            workers: NonZeroUsize::new(DEFAULT_WORKERS).unwrap_or(NonZeroUsize::MIN),
            timeout: None,
        }
    }
}

/// Runs every job, at most `options.workers` at a time, yielding results as devices finish.
///
/// The stream yields exactly one [DeviceResult] per job, in completion order. Dropping the stream
/// aborts the tasks still in flight.
pub fn run_backups<M, CI>(
    jobs: Vec<DeviceJob>,
    options: ExecutorOptions,
    manager: M,
) -> BoxStream<'static, DeviceResult>
where
    M: ManageClient<CI> + Clone + Send + 'static,
    CI: ClientInterface + Send + 'static,
{
    let ExecutorOptions { workers, timeout } = options;
    debug!(jobs = jobs.len(), workers = workers.get(), "starting device tasks");

    stream::iter(jobs)
        .map(move |job| {
            let hostname = job.device.name.clone();
            let job = run_job::<M, CI>(job, manager.clone(), timeout);
            let mut task = DeviceTask(tokio::spawn(job));
            async move {
                match (&mut task.0).await {
                    Ok(result) => result,
                    Err(e) => {
                        error!(host = %hostname, error = %e, "device task did not finish");
                        DeviceResult::failure(hostname, DeviceError::Aborted(e.to_string()))
                    }
                }
            }
        })
        .buffer_unordered(workers.get())
        .boxed()
}

/// Runs every job to completion and returns all results. See [run_backups].
pub async fn collect_backups<M, CI>(
    jobs: Vec<DeviceJob>,
    options: ExecutorOptions,
    manager: M,
) -> Vec<DeviceResult>
where
    M: ManageClient<CI> + Clone + Send + 'static,
    CI: ClientInterface + Send + 'static,
{
    run_backups::<M, CI>(jobs, options, manager)
        .collect()
        .await
}

// Aborts the spawned task if the result is no longer wanted.
struct DeviceTask(JoinHandle<DeviceResult>);

impl Drop for DeviceTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn run_job<M, CI>(job: DeviceJob, mut manager: M, timeout: Option<Duration>) -> DeviceResult
where
    M: ManageClient<CI>,
    CI: ClientInterface,
{
    let DeviceJob {
        device,
        credentials,
        command,
    } = job;

    let fetch = fetch::<M, CI>(&device, &credentials, command.as_deref(), &mut manager);
    let result = match timeout {
        Some(limit) => tokio::time::timeout(limit, fetch)
            .await
            .unwrap_or_else(|_| Err(DeviceError::TimedOut(limit))),
        None => fetch.await,
    };

    let outcome = match result {
        Ok(text) => {
            info!(host = %device.name, bytes = text.len(), "retrieved output");
            Outcome::Success(text)
        }
        Err(e) => {
            warn!(host = %device.name, error = %e, "device task failed");
            Outcome::Failure(e)
        }
    };
    DeviceResult {
        hostname: device.name,
        outcome,
    }
}

async fn fetch<M, CI>(
    device: &Device,
    credentials: &CredentialSet,
    command: Option<&str>,
    manager: &mut M,
) -> Result<String, DeviceError>
where
    M: ManageClient<CI>,
    CI: ClientInterface,
{
    let command = command
        .ok_or_else(|| DeviceError::UnsupportedPlatform(device.platform_name().to_owned()))?;
    let mut client = manager.connect(device, credentials).await?;
    let output = client.run(command).await?;
    check_output(command, output)
}

/// Rejects output that signals a failed command even though the command "succeeded".
///
/// Devices report authorization and syntax failures as ordinary output, and storing that output
/// would replace a good backup with an error message.
pub fn check_output(command: &str, output: String) -> Result<String, DeviceError> {
    if output.trim().is_empty() {
        return Err(DeviceError::EmptyOutput(command.to_owned()));
    }
    if refused(&output) {
        return Err(DeviceError::Unauthorized(command.to_owned()));
    }
    Ok(output)
}

fn refused(output: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"(?im)^\s*%?\s*(command authorization failed|authorization failed|invalid input detected)",
            )
            .expect("refusal pattern should be a valid regex")
        })
        .is_match(output)
}
