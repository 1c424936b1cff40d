//! quiz-forge CLI entry point.
//!
//! Initializes logging, delegates to the CLI module for command handling and
//! maps failures to the process exit status.

use quiz_forge::error::FailureClass;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() {
    // Parse CLI arguments first to get log_level
    let cli = quiz_forge::cli::parse_cli();

    // Priority: RUST_LOG env var > --log-level CLI arg > default "info"
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| cli.log_level.clone());

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_filter)))
        .init();

    if let Err(err) = quiz_forge::cli::run_with_cli(cli).await {
        let class = FailureClass::of(&err);
        eprintln!("error: {err:#}");
        std::process::exit(class.exit_code());
    }
}
