//! Command-line interface for quiz-forge.
//!
//! Provides one subcommand per process role: producing jobs, running workers,
//! aggregating decks and inspecting queues.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli};
