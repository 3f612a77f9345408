//! Tallies the outcome of a run and reports it to the user.
//!
//! The arrangement of this module follows a pattern: the user picks a real or fake [Report]
//! implementation and calls its methods. Each method hands off to a testable `_`-prefixed function
//! that writes to whatever stdout and stderr writers it is given. The real implementation,
//! [Reporter], locks the real stdout and stderr just for the duration of one call, so lines from a
//! report never interleave with other output.

use crate::store::CommitOutcome;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::fmt::{self, Display};
use std::io::{self, Write};
use std::ops::DerefMut;

/// The overall result of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every device succeeded. Also the status of a run with no devices.
    Success,

    /// Some devices succeeded and some failed.
    Partial,

    /// No device succeeded.
    Failed,

    /// The run was interrupted.
    Cancelled,
}

impl RunStatus {
    /// The process exit code for this status. Only [RunStatus::Success] exits with zero.
    pub fn exit_code(self) -> i32 {
        match self {
            RunStatus::Success => 0,
            RunStatus::Failed => 1,
            RunStatus::Partial => 2,
            RunStatus::Cancelled => 130,
        }
    }
}

impl Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunStatus::Success => "succeeded",
            RunStatus::Partial => "partially succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        })
    }
}

/// What happened to one device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum DeviceStatus {
    /// The configuration changed and was committed.
    Committed,

    /// The configuration matched the last commit.
    Unchanged,

    /// A command's output was retrieved. Nothing was stored.
    Retrieved,

    Failed { reason: String },
}

impl DeviceStatus {
    pub fn failed(reason: impl Display) -> Self {
        DeviceStatus::Failed {
            reason: reason.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, DeviceStatus::Failed { .. })
    }
}

impl From<CommitOutcome> for DeviceStatus {
    fn from(outcome: CommitOutcome) -> Self {
        match outcome {
            CommitOutcome::Committed => DeviceStatus::Committed,
            CommitOutcome::Unchanged => DeviceStatus::Unchanged,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeviceRecord {
    pub hostname: String,
    #[serde(flatten)]
    pub status: DeviceStatus,
}

/// Totals and per-device records for a run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub committed: usize,
    pub unchanged: usize,
    pub cancelled: bool,
    pub devices: Vec<DeviceRecord>,
}

/// The run report file's layout: the summary plus its status.
#[derive(Serialize)]
struct ReportFile<'s> {
    status: RunStatus,
    #[serde(flatten)]
    summary: &'s RunSummary,
}

impl RunSummary {
    /// Starts a summary for a run over `attempted` devices.
    pub fn new(started_at: DateTime<Utc>, attempted: usize) -> Self {
        Self {
            started_at,
            finished_at: None,
            attempted,
            succeeded: 0,
            failed: 0,
            committed: 0,
            unchanged: 0,
            cancelled: false,
            devices: Vec::with_capacity(attempted),
        }
    }

    /// Records the outcome for one device.
    pub fn record(&mut self, hostname: impl Into<String>, status: DeviceStatus) -> &DeviceRecord {
        match status {
            DeviceStatus::Committed => self.committed += 1,
            DeviceStatus::Unchanged => self.unchanged += 1,
            _ => {}
        }
        if status.is_success() {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        self.devices.push(DeviceRecord {
            hostname: hostname.into(),
            status,
        });
        &self.devices[self.devices.len() - 1]
    }

    /// Marks the run cancelled and records every device in `unfinished` as failed.
    pub fn cancel<I, S>(&mut self, unfinished: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cancelled = true;
        for hostname in unfinished {
            self.record(hostname, DeviceStatus::failed("run cancelled before the device finished"));
        }
    }

    pub fn finish(&mut self, finished_at: DateTime<Utc>) {
        self.finished_at = Some(finished_at);
    }

    pub fn status(&self) -> RunStatus {
        if self.cancelled {
            RunStatus::Cancelled
        } else if self.failed == 0 {
            RunStatus::Success
        } else if self.succeeded == 0 {
            RunStatus::Failed
        } else {
            RunStatus::Partial
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.status().exit_code()
    }

    /// Returns `(hostname, reason)` for each failed device, in the order they finished.
    pub fn failures(&self) -> impl Iterator<Item = (&str, &str)> {
        self.devices.iter().filter_map(|d| match d.status {
            DeviceStatus::Failed { ref reason } => Some((d.hostname.as_str(), reason.as_str())),
            _ => None,
        })
    }

    /// Renders the machine-readable run report.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(&ReportFile {
            status: self.status(),
            summary: self,
        })
    }
}

/// Prints feedback about a run to stdout/stderr to keep the user informed.
pub trait Report {
    /// Reports that a run over `devices` devices is starting.
    fn starting(&mut self, devices: usize, started_at: DateTime<Utc>) -> io::Result<()>;

    /// Reports what happened to one device.
    fn device(&mut self, record: &DeviceRecord) -> io::Result<()>;

    /// Prints output retrieved from a device.
    fn output(&mut self, hostname: &str, output: &str) -> io::Result<()>;

    /// Reports the totals and every failure.
    fn summary(&mut self, summary: &RunSummary) -> io::Result<()>;
}

/// The real, production-ready [Report] implementation. Uses the real stdout/stderr.
#[derive(Clone, Debug, Default)]
pub struct Reporter;

impl Report for Reporter {
    fn starting(&mut self, devices: usize, started_at: DateTime<Utc>) -> io::Result<()> {
        _starting(io::stdout().lock(), devices, started_at)
    }

    fn device(&mut self, record: &DeviceRecord) -> io::Result<()> {
        // Lock both before writing to either, so that nothing lands between them.
        let mut stdout = io::stdout().lock();
        let mut stderr = io::stderr().lock();
        _device(&mut stdout, &mut stderr, record)
    }

    fn output(&mut self, hostname: &str, output: &str) -> io::Result<()> {
        _output(io::stdout().lock(), hostname, output)
    }

    fn summary(&mut self, summary: &RunSummary) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        let mut stderr = io::stderr().lock();
        _summary(&mut stdout, &mut stderr, summary)
    }
}

fn write_indented(mut writer: impl Write, content: impl AsRef<str>) -> io::Result<()> {
    for line in content.as_ref().lines() {
        //                1234
        writeln!(writer, "    {line}")?;
    }
    Ok(())
}

/// A testable function containing the logic for reporting that a run is starting.
pub fn _starting<O: Write>(
    mut stdout: O,
    devices: usize,
    started_at: DateTime<Utc>,
) -> io::Result<()> {
    let plural = if devices == 1 { "" } else { "s" };
    writeln!(
        stdout,
        "Stockpiling {devices} device{plural} at {}",
        started_at.to_rfc3339_opts(SecondsFormat::Secs, true),
    )
}

/// A testable function containing the logic for reporting one device's outcome.
pub fn _device<OT: Write, ET: Write, O: DerefMut<Target = OT>, E: DerefMut<Target = ET>>(
    mut stdout: O,
    mut stderr: E,
    record: &DeviceRecord,
) -> io::Result<()> {
    let host = &record.hostname;
    match record.status {
        DeviceStatus::Committed => writeln!(stdout, "[{host}] Stockpile committed"),
        DeviceStatus::Unchanged => writeln!(stdout, "[{host}] Stockpile unchanged"),
        DeviceStatus::Retrieved => writeln!(stdout, "[{host}] Retrieved output"),
        DeviceStatus::Failed { ref reason } => {
            writeln!(stderr, "[{host}] Stockpile failed: {reason}")
        }
    }
}

/// A testable function containing the logic for printing a device's output.
pub fn _output<O: Write>(mut stdout: O, hostname: &str, output: &str) -> io::Result<()> {
    writeln!(stdout, "[{hostname}] Output:")?;
    write_indented(&mut stdout, output)
}

/// A testable function containing the logic for reporting a run's totals.
pub fn _summary<OT: Write, ET: Write, O: DerefMut<Target = OT>, E: DerefMut<Target = ET>>(
    mut stdout: O,
    mut stderr: E,
    summary: &RunSummary,
) -> io::Result<()> {
    writeln!(
        stdout,
        "Run {}: {} of {} devices succeeded ({} committed, {} unchanged), {} failed",
        summary.status(),
        summary.succeeded,
        summary.attempted,
        summary.committed,
        summary.unchanged,
        summary.failed,
    )?;

    let mut failures = summary.failures().peekable();
    if failures.peek().is_some() {
        let lines: Vec<_> = failures.map(|(host, reason)| format!("[{host}] {reason}")).collect();
        writeln!(stderr, "Failed devices:")?;
        write_indented(stderr.deref_mut(), lines.join("\n"))?;
    }
    Ok(())
}

#[cfg(test)]
mod test;
