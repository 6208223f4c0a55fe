//! Worker command with built-in handlers.

use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Args;
use latchkey::coordination::HandlerRegistry;
use latchkey::coordination::TaskRecord;
use latchkey::coordination::WorkerStatsSnapshot;
use tracing::info;

use crate::client::LatchkeyClient;
use crate::output::Outputable;
use crate::output::print_output;

#[derive(Args)]
pub struct WorkerArgs {
    /// Ready queues in priority order. Defaults to `worker.queues`.
    pub queues: Vec<String>,
}

/// Handlers available to the CLI worker.
///
/// - `echo`: prints the task payload to stdout
pub fn builtin_handlers() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register_fn("echo", |task: TaskRecord| async move {
        println!("{}", task.args);
        Ok::<(), anyhow::Error>(())
    });
    registry
}

/// Worker summary printed on shutdown.
pub struct WorkerOutput {
    pub stats: WorkerStatsSnapshot,
}

impl Outputable for WorkerOutput {
    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self.stats).unwrap_or(serde_json::Value::Null)
    }

    fn to_human(&self) -> String {
        format!(
            "Worker stopped. dispatched: {}, failed: {}, unknown: {}, malformed: {}",
            self.stats.dispatched, self.stats.failed, self.stats.unknown, self.stats.malformed
        )
    }
}

impl WorkerArgs {
    /// Run the worker until Ctrl-C, or until the worker loop fails.
    pub async fn run(self, client: &LatchkeyClient, json: bool) -> Result<()> {
        let queues = if self.queues.is_empty() {
            client.config().worker.queues.clone()
        } else {
            self.queues
        };
        let worker = Arc::new(client.worker(builtin_handlers()));
        info!(queues = ?queues, handlers = ?worker.registry().names(), "worker running, press Ctrl-C to stop");
        let mut handle = worker.spawn(queues);

        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl-C")?;
            }
            ended = handle.finished() => {
                ended.context("worker stopped")?;
            }
        }
        let stats = handle.stop().await?;
        print_output(&WorkerOutput { stats }, json);
        Ok(())
    }
}
