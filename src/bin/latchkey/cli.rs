//! CLI argument parsing and command dispatch.
//!
//! Uses clap derive macros for declarative argument definition with
//! support for environment variables and global options.

use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use clap::Args;
use clap::Parser;
use clap::Subcommand;
use latchkey::LatchkeyConfig;
use latchkey::StoreBackend;

use crate::client::LatchkeyClient;
use crate::commands::lock::LockCommand;
use crate::commands::mover::MoverArgs;
use crate::commands::queue::QueueCommand;
use crate::commands::semaphore::SemaphoreCommand;
use crate::commands::task::TaskCommand;
use crate::commands::worker::WorkerArgs;

/// Command-line interface for latchkey coordination primitives.
#[derive(Parser)]
#[command(name = "latchkey")]
#[command(version)]
#[command(about = "Distributed locks, semaphores and delayed task queues")]
#[command(propagate_version = true)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOptions,

    #[command(subcommand)]
    pub command: Commands,
}

/// Global options available to all commands.
#[derive(Args, Clone)]
pub struct GlobalOptions {
    /// Path to a TOML configuration file.
    #[arg(long, env = "LATCHKEY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Redis address (`host:port`), overriding the configuration.
    #[arg(long, global = true)]
    pub redis: Option<String>,

    /// Use an in-process store instead of Redis.
    ///
    /// State does not outlive the command; mostly useful for trying things out.
    #[arg(long, global = true, conflicts_with = "redis")]
    pub memory: bool,

    /// Output JSON instead of human-readable format.
    #[arg(long = "json", global = true)]
    pub is_json: bool,

    /// Enable verbose logging.
    #[arg(short = 'v', long = "verbose", global = true)]
    pub is_verbose: bool,

    /// Suppress all logging output (warnings, debug messages).
    ///
    /// Useful for scripting and when parsing JSON output.
    #[arg(short = 'q', long = "quiet", global = true)]
    pub is_quiet: bool,
}

/// Top-level command categories.
#[derive(Subcommand)]
pub enum Commands {
    /// Mutex lock operations.
    #[command(subcommand)]
    Lock(LockCommand),

    /// Counting semaphore operations.
    #[command(subcommand)]
    Semaphore(SemaphoreCommand),

    /// Schedule tasks.
    #[command(subcommand)]
    Task(TaskCommand),

    /// Inspect queues.
    #[command(subcommand)]
    Queue(QueueCommand),

    /// Promote due delayed tasks until interrupted.
    Mover(MoverArgs),

    /// Consume ready queues with the built-in handlers until interrupted.
    Worker(WorkerArgs),
}

impl GlobalOptions {
    /// Load configuration and apply command-line overrides.
    pub fn load_config(&self) -> Result<LatchkeyConfig> {
        let mut config = LatchkeyConfig::load_with_optional_file(self.config.as_deref())
            .context("failed to load configuration")?;
        if let Some(addr) = &self.redis {
            config.store.backend = StoreBackend::Redis;
            config.store.redis.addr = addr.clone();
        }
        if self.memory {
            config.store.backend = StoreBackend::Memory;
        }
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

impl Cli {
    /// Execute the CLI command.
    pub async fn run(self) -> Result<()> {
        let config = self.global.load_config()?;
        let client = LatchkeyClient::connect(config).await.context("failed to open store")?;
        let json = self.global.is_json;

        match self.command {
            Commands::Lock(cmd) => cmd.run(&client, json).await,
            Commands::Semaphore(cmd) => cmd.run(&client, json).await,
            Commands::Task(cmd) => cmd.run(&client, json).await,
            Commands::Queue(cmd) => cmd.run(&client, json).await,
            Commands::Mover(args) => args.run(&client, json).await,
            Commands::Worker(args) => args.run(&client, json).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_help_does_not_panic() {
        // --help causes clap to return an error with exit code 0
        let result = Cli::try_parse_from(["latchkey", "--help"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_global_flags_parsed() {
        let cli = Cli::try_parse_from(["latchkey", "--json", "-v", "--redis", "10.0.0.1:6379", "lock", "holder", "a"])
            .unwrap();
        assert!(cli.global.is_json);
        assert!(cli.global.is_verbose);
        assert_eq!(cli.global.redis.as_deref(), Some("10.0.0.1:6379"));
    }

    #[test]
    fn test_memory_conflicts_with_redis() {
        let result = Cli::try_parse_from(["latchkey", "--memory", "--redis", "x:1", "lock", "holder", "a"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_lock_release_requires_token() {
        assert!(Cli::try_parse_from(["latchkey", "lock", "release", "deploy"]).is_err());
        assert!(Cli::try_parse_from(["latchkey", "lock", "release", "deploy", "123-abc"]).is_ok());
    }

    #[test]
    fn test_semaphore_guarded_implies_fair_flag_parses() {
        let cli = Cli::try_parse_from(["latchkey", "semaphore", "acquire", "db", "--limit", "3", "--guarded"]).unwrap();
        assert!(matches!(cli.command, Commands::Semaphore(_)));
    }

    #[test]
    fn test_task_schedule_parses_delay() {
        let result = Cli::try_parse_from(["latchkey", "task", "schedule", "q", "ping", "x", "--delay", "5000"]);
        assert!(result.is_ok());
    }

    #[test]
    fn test_memory_flag_selects_memory_backend() {
        let cli = Cli::try_parse_from(["latchkey", "--memory", "queue", "stats", "q"]).unwrap();
        let config = cli.global.load_config().unwrap();
        assert_eq!(config.store.backend, StoreBackend::Memory);
    }
}
