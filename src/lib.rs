//! Network configuration backups into git.
//!
//! Stockpiler logs into every device in a Nornir-style inventory, retrieves its running
//! configuration, and commits it to a git repository as a file named after the device. Running it
//! regularly gives a version history of every device's configuration.
//!
//! # Program flow
//!
//! 1. The `stockpiler` binary parses its command line into a [config::Config] with [cli].
//!
//! 2. [coordinator::execute] resolves credentials once with [credentials::resolve], loads the
//!    [inventory::Inventory], and opens the [store::BackupStore].
//!
//! 3. [run_backups::run_backups] contacts devices through a bounded pool of tasks. Each device's
//!    result arrives as soon as it finishes, and a failure on one device never affects another.
//!
//! 4. Every successful retrieval is committed as it arrives. Unchanged configurations produce no
//!    commit.
//!
//! 5. A [report::RunSummary] is printed, written to `results.yaml`, and turned into the exit code.

pub mod cli;
pub mod config;
pub mod coordinator;
pub mod credentials;
pub mod inventory;
pub mod logging;
pub mod report;
pub mod run_backups;
pub mod store;

#[doc(inline)]
pub use coordinator::execute;
