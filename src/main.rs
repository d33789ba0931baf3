use anyhow::Result;
use clap::Parser;

use rcache::{cli::Cli, logging, run};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logger(cli.log_format)?;
    let config = cli.to_config()?;
    run(config).await?;
    Ok(())
}
