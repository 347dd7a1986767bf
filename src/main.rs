use anyhow::Result;
use clap::Parser;
use std::io::Write;
use tokio::sync::watch;
use tracing::warn;

use mailgoat::cli::{self, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    let args = Cli::parse();

    // First Ctrl-C stops the batch before the next recipient.
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current message");
            let _ = cancel_tx.send(true);
        }
    });

    let stdin = std::io::stdin();
    let mut input = stdin.lock();
    let mut out = std::io::stdout().lock();
    let code = match cli::run(args, Some(cancel_rx), &mut input, &mut out).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            1
        }
    };
    out.flush()?;
    drop(out);
    std::process::exit(code);
}
