//! Mutex lock commands.

use std::time::Duration;

use anyhow::Result;
use clap::Args;
use clap::Subcommand;
use latchkey::coordination::Token;

use crate::client::LatchkeyClient;
use crate::output::Outputable;
use crate::output::print_output;

/// Mutex lock operations.
#[derive(Subcommand)]
pub enum LockCommand {
    /// Acquire a lock, waiting up to the acquire timeout.
    ///
    /// Prints the holder token on success. Exits with status 1 if the lock is
    /// still held when the timeout elapses.
    Acquire(AcquireArgs),

    /// Release a lock held by the given token.
    Release(ReleaseArgs),

    /// Show the current holder of a lock.
    Holder(HolderArgs),
}

#[derive(Args)]
pub struct AcquireArgs {
    /// Lock name.
    pub name: String,

    /// Acquire timeout in milliseconds. Defaults to `lock.acquire_timeout_ms`.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Lease in milliseconds after which the lock frees itself.
    ///
    /// Without a lease the lock is held until released.
    #[arg(long)]
    pub lease: Option<u64>,
}

#[derive(Args)]
pub struct ReleaseArgs {
    /// Lock name.
    pub name: String,

    /// Token returned by `lock acquire`.
    pub token: String,
}

#[derive(Args)]
pub struct HolderArgs {
    /// Lock name.
    pub name: String,
}

/// Lock operation output.
pub struct LockOutput {
    pub operation: &'static str,
    pub name: String,
    pub success: bool,
    pub token: Option<String>,
}

impl Outputable for LockOutput {
    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "operation": self.operation,
            "name": self.name,
            "success": self.success,
            "token": self.token,
        })
    }

    fn to_human(&self) -> String {
        match (self.operation, self.success) {
            ("acquire", true) => format!("Lock acquired. Token: {}", self.token.as_deref().unwrap_or("N/A")),
            ("acquire", false) => format!("Lock '{}' is held; timed out waiting.", self.name),
            ("release", true) => "Lock released.".to_string(),
            ("release", false) => format!("Lock '{}' was not held by this token.", self.name),
            ("holder", _) => match &self.token {
                Some(token) => format!("Lock '{}' held by {}", self.name, token),
                None => format!("Lock '{}' is free.", self.name),
            },
            (op, success) => format!("{} {}", op, if success { "succeeded" } else { "failed" }),
        }
    }
}

impl LockCommand {
    /// Execute the lock command.
    pub async fn run(self, client: &LatchkeyClient, json: bool) -> Result<()> {
        match self {
            LockCommand::Acquire(args) => lock_acquire(client, args, json).await,
            LockCommand::Release(args) => lock_release(client, args, json).await,
            LockCommand::Holder(args) => lock_holder(client, args, json).await,
        }
    }
}

async fn lock_acquire(client: &LatchkeyClient, args: AcquireArgs, json: bool) -> Result<()> {
    let lock = client.lock();
    let timeout = Duration::from_millis(args.timeout.unwrap_or(client.config().lock.acquire_timeout_ms));

    let token = match args.lease {
        Some(lease) => lock.acquire_with_lease(&args.name, timeout, Duration::from_millis(lease)).await?,
        None => lock.acquire(&args.name, timeout).await?,
    };

    let success = token.is_some();
    let output = LockOutput {
        operation: "acquire",
        name: args.name,
        success,
        token: token.map(Token::into_inner),
    };
    print_output(&output, json);
    if !success {
        std::process::exit(1);
    }
    Ok(())
}

async fn lock_release(client: &LatchkeyClient, args: ReleaseArgs, json: bool) -> Result<()> {
    let released = client.lock().release(&args.name, &Token::new(args.token.clone())).await?;
    let output = LockOutput {
        operation: "release",
        name: args.name,
        success: released,
        token: Some(args.token),
    };
    print_output(&output, json);
    if !released {
        std::process::exit(1);
    }
    Ok(())
}

async fn lock_holder(client: &LatchkeyClient, args: HolderArgs, json: bool) -> Result<()> {
    let holder = client.lock().holder(&args.name).await?;
    let output = LockOutput {
        operation: "holder",
        name: args.name,
        success: true,
        token: holder.map(Token::into_inner),
    };
    print_output(&output, json);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_human_output() {
        let output = LockOutput {
            operation: "holder",
            name: "deploy".to_string(),
            success: true,
            token: None,
        };
        assert_eq!(output.to_human(), "Lock 'deploy' is free.");
        assert_eq!(output.to_json()["token"], serde_json::Value::Null);
    }
}
