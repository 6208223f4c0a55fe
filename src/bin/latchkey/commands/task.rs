//! Task scheduling commands.

use std::time::Duration;

use anyhow::Result;
use clap::Args;
use clap::Subcommand;

use crate::client::LatchkeyClient;
use crate::output::Outputable;
use crate::output::print_output;

/// Task operations.
#[derive(Subcommand)]
pub enum TaskCommand {
    /// Schedule a task on a queue, optionally delayed.
    Schedule(ScheduleArgs),
}

#[derive(Args)]
pub struct ScheduleArgs {
    /// Destination queue.
    pub queue: String,

    /// Handler name.
    pub name: String,

    /// Payload passed to the handler.
    #[arg(default_value = "")]
    pub args: String,

    /// Delay in milliseconds. Zero queues the task immediately.
    #[arg(long, default_value = "0")]
    pub delay: u64,
}

/// Scheduled task output.
pub struct ScheduleOutput {
    pub task_id: String,
    pub queue: String,
    pub delay_ms: u64,
}

impl Outputable for ScheduleOutput {
    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "task_id": self.task_id,
            "queue": self.queue,
            "delay_ms": self.delay_ms,
        })
    }

    fn to_human(&self) -> String {
        if self.delay_ms == 0 {
            format!("Task {} queued on '{}'.", self.task_id, self.queue)
        } else {
            format!("Task {} scheduled on '{}' in {} ms.", self.task_id, self.queue, self.delay_ms)
        }
    }
}

impl TaskCommand {
    /// Execute the task command.
    pub async fn run(self, client: &LatchkeyClient, json: bool) -> Result<()> {
        match self {
            TaskCommand::Schedule(args) => {
                let task_id = client
                    .queue()
                    .schedule_later(&args.queue, &args.name, &args.args, Duration::from_millis(args.delay))
                    .await?;
                print_output(
                    &ScheduleOutput {
                        task_id,
                        queue: args.queue,
                        delay_ms: args.delay,
                    },
                    json,
                );
                Ok(())
            }
        }
    }
}
