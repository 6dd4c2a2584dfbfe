use clap::Parser;
use eyre::Result as EyreResult;
use tracing_subscriber::EnvFilter;

use crate::cli::RootCommand;

mod cli;

/// Log everything of ours at info unless `RUST_LOG` says otherwise.
const DEFAULT_LOG_FILTER: &str = "meridiand=info,meridian_=info";

#[tokio::main]
async fn main() -> EyreResult<()> {
    color_eyre::install()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    RootCommand::parse().run().await
}
