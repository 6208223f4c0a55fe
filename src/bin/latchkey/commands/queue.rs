//! Queue inspection commands.

use anyhow::Result;
use clap::Args;
use clap::Subcommand;

use crate::client::LatchkeyClient;
use crate::output::Outputable;
use crate::output::print_output;

/// Queue operations.
#[derive(Subcommand)]
pub enum QueueCommand {
    /// Show delayed and ready task counts.
    Stats(StatsArgs),
}

#[derive(Args)]
pub struct StatsArgs {
    /// Ready queues to report. Defaults to `worker.queues`.
    pub queues: Vec<String>,
}

/// Queue statistics output.
pub struct QueueStatsOutput {
    pub delayed: u64,
    pub ready: Vec<(String, u64)>,
}

impl Outputable for QueueStatsOutput {
    fn to_json(&self) -> serde_json::Value {
        let ready: serde_json::Map<String, serde_json::Value> =
            self.ready.iter().map(|(queue, len)| (queue.clone(), serde_json::json!(len))).collect();
        serde_json::json!({
            "delayed": self.delayed,
            "ready": ready,
        })
    }

    fn to_human(&self) -> String {
        let mut out = format!("delayed: {}", self.delayed);
        for (queue, len) in &self.ready {
            out.push_str(&format!("\nqueue:{}: {}", queue, len));
        }
        out
    }
}

impl QueueCommand {
    /// Execute the queue command.
    pub async fn run(self, client: &LatchkeyClient, json: bool) -> Result<()> {
        match self {
            QueueCommand::Stats(args) => {
                let queues = if args.queues.is_empty() {
                    client.config().worker.queues.clone()
                } else {
                    args.queues
                };
                let queue = client.queue();
                let delayed = queue.delayed_len().await?;
                let mut ready = Vec::with_capacity(queues.len());
                for name in queues {
                    let len = queue.ready_len(&name).await?;
                    ready.push((name, len));
                }
                print_output(&QueueStatsOutput { delayed, ready }, json);
                Ok(())
            }
        }
    }
}
