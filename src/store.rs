//! Keeps device configurations in a local git repository.
//!
//! Each device has one file in the repository, named exactly after the device. Writing a new
//! snapshot replaces the file atomically and commits it only if its content changed, so the
//! history of a file is the history of changes to that device's configuration.
//!
//! Git is driven through its command-line interface. Every invocation pins line-ending
//! conversion, attributes, ignore files, hooks and signing, so a user's git configuration can't
//! alter stored bytes or block a commit.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::ffi::OsStr;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Output};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};

/// The run report kept in the backup directory but never committed.
pub const REPORT_FILE: &str = "results.yaml";

/// The author recorded on every commit.
pub const AUTHOR_NAME: &str = "Stockpiler";
pub const AUTHOR_EMAIL: &str = "stockpiler@localhost.local";

// Patterns written to .git/info/exclude. Temporary files only linger if a write is interrupted.
const EXCLUDED: &[&str] = &[REPORT_FILE, ".tmp*"];

// Passed to every git invocation with `-c`.
const PINNED_SETTINGS: &[&str] = &[
    "core.autocrlf=false",
    "core.attributesFile=/dev/null",
    "core.excludesFile=/dev/null",
    "core.hooksPath=/dev/null",
    "commit.gpgsign=false",
];

/// Whether `name` can be used verbatim as a backup file name.
///
/// Names must start with an ASCII letter or digit and contain only ASCII letters, digits, `.`,
/// `_`, and `-`. This rules out path separators, `.` and `..`, and hidden files such as `.git`.
pub fn is_valid_hostname(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= 255
        && name != REPORT_FILE
        && first.is_ascii_alphanumeric()
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// The commit message for a snapshot of `hostname` taken during the run started at `timestamp`.
pub fn commit_message(hostname: &str, timestamp: DateTime<Utc>) -> String {
    format!(
        "Stockpile {hostname} at {}",
        timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
    )
}

/// What [BackupStore::commit] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitOutcome {
    /// The content changed and a commit was created.
    Committed,

    /// The content was identical to the last commit. Nothing was committed.
    Unchanged,
}

/// Errors from the backup repository.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("could not create backup directory {}: {source}", path.display())]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("{} exists but is not a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("could not run git: {0}")]
    Spawn(#[source] io::Error),

    #[error("`git {args}` failed with {status}: {stderr}")]
    Git {
        args: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("could not write {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },

    #[error("could not read {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("{0:?} is not a valid backup file name")]
    InvalidName(String),
}

/// A git working directory holding one file per device.
///
/// Mutating methods take `&mut self`, so holding the store is what serializes commits.
#[derive(Debug)]
pub struct BackupStore {
    dir: PathBuf,
}

impl BackupStore {
    /// Opens the repository at `dir`, creating the directory and running `git init` as needed.
    ///
    /// Calling this on an existing repository changes nothing but the exclude list.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory can't be created, isn't a directory, or git fails.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StorageError::CreateDir {
            path: dir.clone(),
            source,
        })?;
        if !dir.is_dir() {
            return Err(StorageError::NotADirectory(dir));
        }

        let store = Self { dir };
        if !store.dir.join(".git").exists() {
            store.git(["init", "--quiet"])?;
            info!(path = %store.dir.display(), "initialized backup repository");
        }
        store.exclude_untracked()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Stores `text` as the latest snapshot for `hostname`, committing it if it changed.
    ///
    /// The file is written to a temporary file and renamed into place, so readers never see a
    /// partial snapshot and a failed write leaves the previous snapshot intact.
    ///
    /// # Returns
    ///
    /// [CommitOutcome::Committed] if the content differed from the last commit of the file,
    /// otherwise [CommitOutcome::Unchanged].
    ///
    /// # Errors
    ///
    /// Returns an error if `hostname` isn't a valid file name (see [is_valid_hostname]), if the
    /// file can't be written, or if git fails.
    pub fn commit(
        &mut self,
        hostname: &str,
        text: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<CommitOutcome, StorageError> {
        if !is_valid_hostname(hostname) {
            return Err(StorageError::InvalidName(hostname.to_owned()));
        }

        self.write_atomic(hostname, text.as_bytes())?;
        self.git(["add", "--force", "--", hostname])?;

        let diff = self.git_output(["diff", "--cached", "--quiet", "--", hostname])?;
        match diff.status.code() {
            Some(0) => {
                debug!(host = %hostname, "configuration unchanged");
                return Ok(CommitOutcome::Unchanged);
            }
            Some(1) => {}
            _ => return Err(git_error(["diff", "--cached", "--quiet", "--", hostname], diff)),
        }

        let message = commit_message(hostname, timestamp);
        self.git([
            "commit",
            "--quiet",
            "--no-verify",
            "-m",
            message.as_str(),
            "--",
            hostname,
        ])?;
        debug!(host = %hostname, %message, "committed configuration");
        Ok(CommitOutcome::Committed)
    }

    /// Returns the subjects of the commits that touched `hostname`'s file, newest first.
    pub fn history(&self, hostname: &str) -> Result<Vec<String>, StorageError> {
        if !is_valid_hostname(hostname) {
            return Err(StorageError::InvalidName(hostname.to_owned()));
        }

        // `git log` fails outright in a repository with no commits.
        let head = self.git_output(["rev-parse", "--verify", "--quiet", "HEAD"])?;
        if !head.status.success() {
            return Ok(vec![]);
        }

        let output = self.git(["log", "--format=%s", "--", hostname])?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_owned)
            .collect())
    }

    /// Returns the current snapshot for `hostname`, or [None] if there is none.
    pub fn read(&self, hostname: &str) -> Result<Option<String>, StorageError> {
        if !is_valid_hostname(hostname) {
            return Err(StorageError::InvalidName(hostname.to_owned()));
        }
        let path = self.dir.join(hostname);
        match fs::read_to_string(&path) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StorageError::Read { path, source }),
        }
    }

    /// Replaces the run report. The report is excluded from git and never committed.
    pub fn write_report(&mut self, yaml: &str) -> Result<PathBuf, StorageError> {
        self.write_atomic(REPORT_FILE, yaml.as_bytes())
    }

    fn write_atomic(&self, file_name: &str, contents: &[u8]) -> Result<PathBuf, StorageError> {
        let path = self.dir.join(file_name);
        let write_error = |source| StorageError::Write {
            path: path.clone(),
            source,
        };

        let mut file = NamedTempFile::new_in(&self.dir).map_err(write_error)?;
        file.write_all(contents).map_err(write_error)?;
        file.as_file().sync_all().map_err(write_error)?;
        file.persist(&path).map_err(|e| write_error(e.error))?;
        Ok(path)
    }

    // Keeps the run report and interrupted temporary files out of `git status`.
    fn exclude_untracked(&self) -> Result<(), StorageError> {
        let git_dir = self.dir.join(".git");
        if !git_dir.is_dir() {
            return Ok(());
        }
        let info = git_dir.join("info");
        let exclude = info.join("exclude");
        let write_error = |source| StorageError::Write {
            path: exclude.clone(),
            source,
        };

        fs::create_dir_all(&info).map_err(write_error)?;
        let existing = match fs::read_to_string(&exclude) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(source) => {
                return Err(StorageError::Read {
                    path: exclude.clone(),
                    source,
                })
            }
        };

        let missing: Vec<_> = EXCLUDED
            .iter()
            .filter(|pattern| !existing.lines().any(|line| line.trim() == **pattern))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&exclude)
            .map_err(write_error)?;
        if !existing.is_empty() && !existing.ends_with('\n') {
            writeln!(file).map_err(write_error)?;
        }
        for pattern in missing {
            writeln!(file, "{pattern}").map_err(write_error)?;
        }
        Ok(())
    }

    // Runs git in the repository and fails unless it exits successfully.
    fn git<I, S>(&self, args: I) -> Result<Output, StorageError>
    where
        I: IntoIterator<Item = S> + Clone,
        S: AsRef<OsStr>,
    {
        let output = self.git_output(args.clone())?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(git_error(args, output))
        }
    }

    // Runs git in the repository and returns its output regardless of exit status.
    fn git_output<I, S>(&self, args: I) -> Result<Output, StorageError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        Command::new("git")
            .arg("-C")
            .arg(&self.dir)
            .args(PINNED_SETTINGS.iter().flat_map(|&setting| ["-c", setting]))
            .arg("-c")
            .arg(format!("user.name={AUTHOR_NAME}"))
            .arg("-c")
            .arg(format!("user.email={AUTHOR_EMAIL}"))
            .args(args)
            .output()
            .map_err(StorageError::Spawn)
    }
}

fn git_error<I, S>(args: I, output: Output) -> StorageError
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args = args
        .into_iter()
        .map(|a| a.as_ref().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    StorageError::Git {
        args,
        status: output.status,
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
    }
}
