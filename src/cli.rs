//! The `stockpiler` command line.

use crate::config::{Config, ConfigError, DEFAULT_CREDENTIAL_FILE};
use crate::credentials::{CredentialMode, CredentialPrecedence};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::num::NonZeroUsize;
use std::path::PathBuf;

/// Back up network device configurations into a git repository.
#[derive(Debug, Parser)]
#[command(name = "stockpiler", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Read settings from this YAML file instead of /etc/stockpiler/stockpiler.yaml
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// The Nornir-style hosts file
    #[arg(short, long)]
    pub inventory: Option<PathBuf>,

    /// The git repository to commit backups into
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// How many devices to contact at once
    #[arg(short, long)]
    pub workers: Option<NonZeroUsize>,

    /// Give up on a device after this many seconds
    #[arg(long, conflicts_with = "no_timeout")]
    pub timeout: Option<u64>,

    /// Wait for devices indefinitely
    #[arg(long)]
    pub no_timeout: bool,

    /// Reach HTTPS management interfaces through this SOCKS5 proxy (host:port)
    #[arg(short, long)]
    pub proxy: Option<String>,

    /// Only contact devices with these addresses (comma separated)
    #[arg(short, long, value_delimiter = ',')]
    pub addresses: Vec<String>,

    #[command(flatten)]
    pub credentials: CredentialArgs,

    /// Which credentials win when both the run and the inventory supply them
    #[arg(long, value_enum)]
    pub credential_precedence: Option<Precedence>,

    /// Don't write results.yaml into the backup repository
    #[arg(long)]
    pub no_report: bool,

    /// Log level or filter directives; RUST_LOG takes priority
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Append logs to stockpiler.log in this directory instead of stderr
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

/// Where the run's credentials come from. Environment variables are used when none is given.
#[derive(Debug, Args)]
#[group(multiple = false)]
pub struct CredentialArgs {
    /// Prompt for credentials on the terminal
    #[arg(long)]
    pub credential_prompt: bool,

    /// Read credentials from a base64-encoded file
    #[arg(
        long,
        value_name = "PATH",
        num_args = 0..=1,
        default_missing_value = DEFAULT_CREDENTIAL_FILE
    )]
    pub credential_file: Option<PathBuf>,

    /// Take every device's credentials from the inventory
    #[arg(long)]
    pub credential_from_inventory: bool,
}

impl CredentialArgs {
    fn mode(&self) -> Option<CredentialMode> {
        if self.credential_prompt {
            Some(CredentialMode::Prompt)
        } else if let Some(ref path) = self.credential_file {
            Some(CredentialMode::EncodedFile { path: path.clone() })
        } else if self.credential_from_inventory {
            Some(CredentialMode::Inventory)
        } else {
            None
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Precedence {
    Inventory,
    Run,
}

impl From<Precedence> for CredentialPrecedence {
    fn from(value: Precedence) -> Self {
        match value {
            Precedence::Inventory => CredentialPrecedence::Inventory,
            Precedence::Run => CredentialPrecedence::Run,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Subcommand)]
pub enum Commands {
    /// Commit every device's running configuration (the default)
    Backup,

    /// Run one read-only command on every device and print the output
    Command {
        /// The command, exactly as the device should receive it
        command: String,
    },
}

impl Cli {
    /// Loads the config file and applies this command line's overrides to it.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file is unusable or the result fails validation.
    pub fn config(&self) -> Result<Config, ConfigError> {
        let base = match self.config {
            Some(ref path) => Config::load(path)?,
            None => Config::load_default()?,
        };
        let config = self.apply(base).expand_paths();
        config.validate()?;
        Ok(config)
    }

    fn apply(&self, mut config: Config) -> Config {
        if let Some(ref hosts) = self.inventory {
            config.inventory.hosts = hosts.clone();
        }
        if let Some(ref output) = self.output {
            config.output = output.clone();
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if self.no_timeout {
            config.device_timeout = None;
        } else if let Some(timeout) = self.timeout {
            config.device_timeout = Some(timeout);
        }
        if let Some(ref proxy) = self.proxy {
            config.proxy = Some(proxy.clone());
        }
        if !self.addresses.is_empty() {
            config.addresses = self.addresses.clone();
        }
        if let Some(mode) = self.credentials.mode() {
            config.credentials = mode;
        }
        if let Some(precedence) = self.credential_precedence {
            config.credential_precedence = precedence.into();
        }
        if self.no_report {
            config.report = false;
        }
        config
    }

    pub fn subcommand(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Backup)
    }
}

/// Runs the command line to completion and returns the process exit code.
///
/// Logging must already be set up. SIGINT or SIGTERM cancels the run.
#[cfg(feature = "transport")]
pub async fn run(cli: Cli) -> anyhow::Result<i32> {
    use crate::coordinator;
    use crate::report::Reporter;
    use crate::run_backups::client::{ConnectOptions, ConnectionManager};
    use anyhow::Context;

    let config = cli.config().context("could not load configuration")?;
    let manager = ConnectionManager::new(ConnectOptions {
        proxy: config.proxy.clone(),
        timeout: config.device_timeout(),
    });
    let mut reporter = Reporter;
    let shutdown = shutdown_signal();

    let summary = match cli.subcommand() {
        Commands::Backup => coordinator::execute(&config, manager, &mut reporter, shutdown).await,
        Commands::Command { command } => {
            coordinator::execute_command(&config, &command, manager, &mut reporter, shutdown).await
        }
    }
    .context("run aborted")?;
    Ok(summary.exit_code())
}

/// Completes on the first SIGINT or SIGTERM.
#[cfg(feature = "transport")]
async fn shutdown_signal() {
    use std::future::pending;
    use tokio::signal::unix::{signal, SignalKind};

    // A signal that can't be watched never arrives.
    let interrupt = async {
        if tokio::signal::ctrl_c().await.is_err() {
            pending::<()>().await;
        }
    };
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => pending::<()>().await,
        }
    };

    tokio::select! {
        () = interrupt => {}
        () = terminate => {}
    }
    tracing::warn!("received shutdown signal");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{config_dir, CONFIG_FILE};
    use std::time::Duration;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("stockpiler").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn backup_is_the_default_subcommand() {
        assert_eq!(Commands::Backup, parse(&[]).subcommand());
        assert_eq!(Commands::Backup, parse(&["backup"]).subcommand());
        assert_eq!(
            Commands::Command {
                command: "show version".to_owned()
            },
            parse(&["command", "show version"]).subcommand(),
        );
    }

    #[test]
    fn credential_flags_are_exclusive() {
        let result = Cli::try_parse_from([
            "stockpiler",
            "--credential-prompt",
            "--credential-from-inventory",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn credential_file_has_default_path() {
        let cli = parse(&["--credential-file"]);
        assert_eq!(
            Some(CredentialMode::EncodedFile {
                path: PathBuf::from(DEFAULT_CREDENTIAL_FILE)
            }),
            cli.credentials.mode(),
        );

        let cli = parse(&["--credential-file", "/root/creds.b64"]);
        assert_eq!(
            Some(CredentialMode::EncodedFile {
                path: PathBuf::from("/root/creds.b64")
            }),
            cli.credentials.mode(),
        );
    }

    #[test]
    fn no_flags_keep_config_file_values() {
        let cli = parse(&[]);
        let config = cli.config().unwrap();
        assert_eq!(Config::load(config_dir().join(CONFIG_FILE)).unwrap(), config);
    }

    #[test]
    fn flags_override_config_file() {
        let cli = parse(&[
            "--workers",
            "7",
            "--timeout",
            "30",
            "--output",
            "/srv/backups",
            "--addresses",
            "10.0.0.1,10.0.0.2",
            "--credential-prompt",
            "--credential-precedence",
            "inventory",
            "--no-report",
            "command",
            "show clock",
        ]);
        let config = cli.config().unwrap();

        assert_eq!(7, config.workers.get());
        assert_eq!(Some(Duration::from_secs(30)), config.device_timeout());
        assert_eq!(PathBuf::from("/srv/backups"), config.output);
        assert_eq!(vec!["10.0.0.1", "10.0.0.2"], config.addresses);
        assert_eq!(CredentialMode::Prompt, config.credentials);
        assert_eq!(CredentialPrecedence::Inventory, config.credential_precedence);
        assert!(!config.report);
    }

    #[test]
    fn no_timeout_disables_timeout() {
        let config = parse(&["--no-timeout"]).config().unwrap();
        assert_eq!(None, config.device_timeout());
        assert!(Cli::try_parse_from(["stockpiler", "--no-timeout", "--timeout", "5"]).is_err());
    }

    #[test]
    fn zero_workers_rejected() {
        assert!(Cli::try_parse_from(["stockpiler", "--workers", "0"]).is_err());
    }

    #[test]
    fn invalid_proxy_rejected() {
        let cli = parse(&["--proxy", "socks5-host"]);
        assert!(matches!(cli.config(), Err(ConfigError::InvalidProxy(_))));
    }
}
