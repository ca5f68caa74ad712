use clap::Parser;
use sonovel::cli::{self, Args};
use std::error::Error;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let level = if args.verbose { "debug" } else { "info" };
    if let Err(e) = sonovel::logging::init(level) {
        eprintln!("{:#}", e);
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, cancelling");
                cancel.cancel();
            }
        });
    }
    if let Some(secs) = args.timeout {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            tracing::warn!(seconds = secs, "overall timeout reached, cancelling");
            cancel.cancel();
        });
    }

    if let Err(e) = cli::run(&args, &cancel).await {
        eprintln!("{}", e);
        if args.verbose {
            let mut source = e.source();
            while let Some(s) = source {
                eprintln!("  cause: {}", s);
                source = s.source();
            }
        }
        std::process::exit(e.exit_code());
    }
}
