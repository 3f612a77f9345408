use anyhow::Context;
use clap::Parser;
use stockpiler::cli::{self, Cli};
use stockpiler::logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level, cli.log_dir.as_deref()).context("could not set up logging")?;

    let code = cli::run(cli).await?;
    std::process::exit(code);
}
