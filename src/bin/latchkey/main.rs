//! latchkey - command-line access to locks, semaphores and delayed task queues.
//!
//! # Usage
//!
//! ```bash
//! # Take a lock with a 30 second lease, then release it
//! TOKEN=$(latchkey --json lock acquire deploy --lease 30000 | jq -r .token)
//! latchkey lock release deploy "$TOKEN"
//!
//! # Schedule a task five seconds out and run the mover and a worker
//! latchkey task schedule default echo "hello" --delay 5000
//! latchkey mover &
//! latchkey worker default
//!
//! # Point at another server
//! export LATCHKEY_REDIS_ADDR=redis.internal:6379
//! latchkey queue stats default
//! ```
//!
//! # Tiger Style
//!
//! - Explicit error handling with anyhow
//! - Bounded timeouts on all operations
//! - Fail-fast on invalid configuration

mod cli;
mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::Cli;

/// Initialize tracing subscriber with environment-based filtering.
///
/// - `quiet`: Suppress all logging output (for scripting)
/// - `verbose`: Enable debug-level logging
fn init_tracing(quiet: bool, verbose: bool) {
    let filter = if quiet {
        EnvFilter::new("off")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).compact().init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.global.is_quiet, cli.global.is_verbose);

    cli.run().await
}
