//! Tapestage Mover - disk copy and reclaim worker
//!
//! Started by the stager with a job on stdin. Reports go to stdout, one
//! JSON line per file, and logs go to stderr.

mod mover;

use anyhow::{Context, Result};
use clap::Parser;
use tapestage_proto::worker::JobInput;
use tokio::io::AsyncReadExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "tapestage-mover")]
#[command(about = "Tapestage disk mover")]
#[command(version)]
struct Args {
    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut text = String::new();
    tokio::io::stdin()
        .read_to_string(&mut text)
        .await
        .context("reading job")?;
    let input = match JobInput::from_lines(&text) {
        Ok(input) => input,
        Err(e) => {
            tracing::error!("Invalid job: {}", e);
            std::process::exit(1);
        }
    };

    let mut stdout = tokio::io::stdout();
    let code = mover::run_job(&input, &mut stdout)
        .await
        .context("writing reports")?;
    std::process::exit(code);
}
