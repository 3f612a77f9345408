//! Drives a whole run from credentials to summary.
//!
//! 1. Resolve credentials. Nothing else happens if this fails.
//! 2. Load and filter the inventory, and work out every device's credentials.
//! 3. Open the backup repository.
//! 4. Run the device tasks and commit each successful retrieval as it arrives.
//! 5. Summarize, report, and write the run report.
//!
//! Errors in steps 1 to 3 abort the run with a [RunError] before any device is contacted. After
//! that, every problem is confined to the device it happened on and shows up in the
//! [RunSummary].

use crate::config::Config;
use crate::credentials::{self, CredentialError, CredentialPrecedence, CredentialSet, Credentials};
use crate::inventory::{Device, Inventory, InventoryError};
use crate::report::{DeviceStatus, Report, RunSummary};
use crate::run_backups::client::{ClientInterface, ManageClient};
use crate::run_backups::{run_backups, DeviceJob, DeviceResult, Outcome};
use crate::store::{BackupStore, StorageError};
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use indexmap::IndexSet;
use std::future::Future;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::task;
use tracing::{error, info, warn};

/// Errors that stop a run before any device is contacted.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Credentials(#[from] CredentialError),

    #[error(transparent)]
    Inventory(#[from] InventoryError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Backs up every device in the inventory. See the module documentation for the sequence.
///
/// `shutdown` cancels the run when it completes. In-flight device tasks are abandoned, commits
/// already made stay, and unfinished devices are recorded as failed.
///
/// # Errors
///
/// Returns a [RunError] if credentials, the inventory, or the backup repository are unusable.
/// Per-device failures are not errors; they are in the returned [RunSummary].
pub async fn execute<M, CI, R, S>(
    config: &Config,
    manager: M,
    reporter: &mut R,
    shutdown: S,
) -> Result<RunSummary, RunError>
where
    M: ManageClient<CI> + Clone + Send + 'static,
    CI: ClientInterface + Send + 'static,
    R: Report,
    S: Future<Output = ()>,
{
    let credentials = credentials::resolve(&config.credentials)?;
    execute_with(config, credentials, manager, reporter, shutdown).await
}

/// Like [execute], with credentials that were already resolved.
///
/// Commits run git on the calling worker thread through [task::block_in_place], so this must be
/// driven by a multi-threaded runtime.
pub async fn execute_with<M, CI, R, S>(
    config: &Config,
    credentials: Credentials,
    manager: M,
    reporter: &mut R,
    shutdown: S,
) -> Result<RunSummary, RunError>
where
    M: ManageClient<CI> + Clone + Send + 'static,
    CI: ClientInterface + Send + 'static,
    R: Report,
    S: Future<Output = ()>,
{
    let started_at = Utc::now();
    let inventory = Inventory::load(&config.inventory)?.filter_addresses(&config.addresses);
    let jobs = build_jobs(
        inventory,
        &credentials,
        config.credential_precedence,
        DeviceJob::backup,
    )?;
    let mut store = BackupStore::open(&config.output)?;

    if jobs.is_empty() {
        warn!("the inventory has no devices to back up");
    }
    info!(
        devices = jobs.len(),
        workers = config.workers.get(),
        output = %store.path().display(),
        "starting backup run",
    );

    let pending = hostnames(&jobs);
    let results = run_backups::<M, CI>(jobs, config.executor_options(), manager);
    let summary = drive(results, pending, started_at, reporter, shutdown, |result, _| {
        let hostname = result.hostname;
        match result.outcome {
            Outcome::Success(text) => match task::block_in_place(|| {
                store.commit(&hostname, &text, started_at)
            }) {
                Ok(outcome) => outcome.into(),
                Err(e) => {
                    error!(host = %hostname, error = %e, "could not store configuration");
                    DeviceStatus::failed(format!("could not store configuration: {e}"))
                }
            },
            Outcome::Failure(e) => DeviceStatus::failed(e),
        }
    })
    .await;

    if config.report {
        match summary.to_yaml() {
            Ok(yaml) => {
                if let Err(e) = task::block_in_place(|| store.write_report(&yaml)) {
                    warn!(error = %e, "could not write the run report");
                }
            }
            Err(e) => warn!(error = %e, "could not render the run report"),
        }
    }
    Ok(summary)
}

/// Runs one read-only `command` on every device and prints each device's output. Nothing is
/// stored.
///
/// Credentials, inventory, and cancellation behave as in [execute].
pub async fn execute_command<M, CI, R, S>(
    config: &Config,
    command: &str,
    manager: M,
    reporter: &mut R,
    shutdown: S,
) -> Result<RunSummary, RunError>
where
    M: ManageClient<CI> + Clone + Send + 'static,
    CI: ClientInterface + Send + 'static,
    R: Report,
    S: Future<Output = ()>,
{
    let credentials = credentials::resolve(&config.credentials)?;
    execute_command_with(config, credentials, command, manager, reporter, shutdown).await
}

/// Like [execute_command], with credentials that were already resolved.
pub async fn execute_command_with<M, CI, R, S>(
    config: &Config,
    credentials: Credentials,
    command: &str,
    manager: M,
    reporter: &mut R,
    shutdown: S,
) -> Result<RunSummary, RunError>
where
    M: ManageClient<CI> + Clone + Send + 'static,
    CI: ClientInterface + Send + 'static,
    R: Report,
    S: Future<Output = ()>,
{
    let started_at = Utc::now();
    let inventory = Inventory::load(&config.inventory)?.filter_addresses(&config.addresses);
    let jobs = build_jobs(
        inventory,
        &credentials,
        config.credential_precedence,
        |device, credentials| DeviceJob::command(device, credentials, command),
    )?;
    info!(devices = jobs.len(), %command, "running command");

    let pending = hostnames(&jobs);
    let results = run_backups::<M, CI>(jobs, config.executor_options(), manager);
    let summary = drive(results, pending, started_at, reporter, shutdown, |result, reporter| {
        match result.outcome {
            Outcome::Success(text) => {
                report_io(reporter.output(&result.hostname, &text));
                DeviceStatus::Retrieved
            }
            Outcome::Failure(e) => DeviceStatus::failed(e),
        }
    })
    .await;
    Ok(summary)
}

/// Pairs every device with its effective credentials.
///
/// Devices whose credentials match the run's share one allocation.
fn build_jobs(
    inventory: Inventory,
    credentials: &Credentials,
    precedence: CredentialPrecedence,
    job: impl Fn(Device, Arc<CredentialSet>) -> DeviceJob,
) -> Result<Vec<DeviceJob>, CredentialError> {
    let shared = match credentials {
        Credentials::Resolved(set) => Some(Arc::new(set.clone())),
        Credentials::FromInventory => None,
    };

    inventory
        .into_devices()
        .into_iter()
        .map(|device| {
            let set = credentials.for_device(&device.name, &device.credentials, precedence)?;
            let set = match shared {
                Some(ref run) if **run == set => run.clone(),
                _ => Arc::new(set),
            };
            Ok(job(device, set))
        })
        .collect()
}

fn hostnames(jobs: &[DeviceJob]) -> IndexSet<String> {
    jobs.iter().map(|job| job.device.name.clone()).collect()
}

/// Consumes device results until they run out or `shutdown` completes, recording each one.
///
/// `pending` names every device that will produce a result. `handle` turns a result into a
/// status, doing whatever the run needs with the output.
async fn drive<R, S, F>(
    mut results: BoxStream<'static, DeviceResult>,
    mut pending: IndexSet<String>,
    started_at: DateTime<Utc>,
    reporter: &mut R,
    shutdown: S,
    mut handle: F,
) -> RunSummary
where
    R: Report,
    S: Future<Output = ()>,
    F: FnMut(DeviceResult, &mut R) -> DeviceStatus,
{
    let mut summary = RunSummary::new(started_at, pending.len());
    report_io(reporter.starting(pending.len(), started_at));

    tokio::pin!(shutdown);
    loop {
        let result = tokio::select! {
            biased;
            _ = &mut shutdown => {
                warn!(unfinished = pending.len(), "run cancelled");
                summary.cancel(pending.drain(..));
                break;
            }
            result = results.next() => match result {
                Some(result) => result,
                None => break,
            },
        };

        let hostname = result.hostname.clone();
        pending.shift_remove(&hostname);
        let status = handle(result, reporter);
        report_io(reporter.device(summary.record(hostname, status)));
    }
    // Abandon whatever is still running.
    drop(results);

    summary.finish(Utc::now());
    info!(
        status = %summary.status(),
        succeeded = summary.succeeded,
        failed = summary.failed,
        committed = summary.committed,
        "run finished",
    );
    report_io(reporter.summary(&summary));
    summary
}

// Losing console output must not abort a run that is committing backups.
fn report_io(result: io::Result<()>) {
    if let Err(e) = result {
        warn!(error = %e, "could not write to the console");
    }
}
