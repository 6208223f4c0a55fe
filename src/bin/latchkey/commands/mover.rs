//! Delayed task mover command.

use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Args;
use tracing::info;

use crate::client::LatchkeyClient;
use crate::output::Outputable;
use crate::output::print_output;

#[derive(Args)]
pub struct MoverArgs {}

/// Mover summary printed on shutdown.
pub struct MoverOutput {
    pub promoted: u64,
}

impl Outputable for MoverOutput {
    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "promoted": self.promoted })
    }

    fn to_human(&self) -> String {
        format!("Mover stopped. Promoted {} task(s).", self.promoted)
    }
}

impl MoverArgs {
    /// Run the mover until Ctrl-C.
    pub async fn run(self, client: &LatchkeyClient, json: bool) -> Result<()> {
        let queue = Arc::new(client.queue());
        let handle = queue.spawn_mover();
        info!("mover running, press Ctrl-C to stop");

        tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
        let promoted = handle.stop().await;
        print_output(&MoverOutput { promoted }, json);
        Ok(())
    }
}
