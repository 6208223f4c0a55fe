//! Counting semaphore commands.

use std::time::Duration;

use anyhow::Result;
use clap::Args;
use clap::Subcommand;
use latchkey::coordination::Token;

use crate::client::LatchkeyClient;
use crate::output::Outputable;
use crate::output::print_output;

/// Counting semaphore operations.
#[derive(Subcommand)]
pub enum SemaphoreCommand {
    /// Take a slot. Exits with status 1 if all slots are taken.
    Acquire(AcquireArgs),

    /// Give back a slot.
    Release(ReleaseArgs),

    /// Extend a fair semaphore hold. Exits with status 1 if it already timed out.
    Refresh(RefreshArgs),

    /// Count holders that have not timed out.
    Count(CountArgs),
}

#[derive(Args)]
pub struct AcquireArgs {
    /// Semaphore name.
    pub name: String,

    /// Number of slots. Defaults to `semaphore.limit`.
    #[arg(long)]
    pub limit: Option<u32>,

    /// Holder timeout in milliseconds. Defaults to `semaphore.timeout_ms`.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Rank by request order instead of client clock.
    #[arg(long)]
    pub fair: bool,

    /// Fair acquisition serialized behind a guard lock.
    #[arg(long)]
    pub guarded: bool,
}

#[derive(Args)]
pub struct ReleaseArgs {
    /// Semaphore name.
    pub name: String,

    /// Token returned by `semaphore acquire`.
    pub token: String,

    /// The slot was taken with `--fair` or `--guarded`.
    #[arg(long)]
    pub fair: bool,
}

#[derive(Args)]
pub struct RefreshArgs {
    /// Semaphore name.
    pub name: String,

    /// Token returned by `semaphore acquire --fair`.
    pub token: String,
}

#[derive(Args)]
pub struct CountArgs {
    /// Semaphore name.
    pub name: String,

    /// Holder timeout in milliseconds. Defaults to `semaphore.timeout_ms`.
    #[arg(long)]
    pub timeout: Option<u64>,
}

/// Semaphore operation output.
pub struct SemaphoreOutput {
    pub operation: &'static str,
    pub name: String,
    pub success: bool,
    pub token: Option<String>,
    pub count: Option<u64>,
}

impl Outputable for SemaphoreOutput {
    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "operation": self.operation,
            "name": self.name,
            "success": self.success,
            "token": self.token,
            "count": self.count,
        })
    }

    fn to_human(&self) -> String {
        match (self.operation, self.success) {
            ("acquire", true) => format!("Slot acquired. Token: {}", self.token.as_deref().unwrap_or("N/A")),
            ("acquire", false) => format!("Semaphore '{}' is full.", self.name),
            ("release", true) => "Slot released.".to_string(),
            ("release", false) => "Slot had already timed out.".to_string(),
            ("refresh", true) => "Slot refreshed.".to_string(),
            ("refresh", false) => "Slot had already timed out; acquire again.".to_string(),
            ("count", _) => format!("Semaphore '{}' holders: {}", self.name, self.count.unwrap_or(0)),
            (op, success) => format!("{} {}", op, if success { "succeeded" } else { "failed" }),
        }
    }
}

impl SemaphoreCommand {
    /// Execute the semaphore command.
    pub async fn run(self, client: &LatchkeyClient, json: bool) -> Result<()> {
        let output = match self {
            SemaphoreCommand::Acquire(args) => semaphore_acquire(client, args).await?,
            SemaphoreCommand::Release(args) => semaphore_release(client, args).await?,
            SemaphoreCommand::Refresh(args) => semaphore_refresh(client, args).await?,
            SemaphoreCommand::Count(args) => semaphore_count(client, args).await?,
        };
        print_output(&output, json);
        if !output.success {
            std::process::exit(1);
        }
        Ok(())
    }
}

async fn semaphore_acquire(client: &LatchkeyClient, args: AcquireArgs) -> Result<SemaphoreOutput> {
    let section = &client.config().semaphore;
    let limit = args.limit.unwrap_or(section.limit);
    let timeout = Duration::from_millis(args.timeout.unwrap_or(section.timeout_ms));
    let semaphores = client.semaphores();

    let token = if args.guarded {
        semaphores.acquire_fair_guarded(&args.name, limit, timeout).await?
    } else if args.fair {
        semaphores.acquire_fair(&args.name, limit, timeout).await?
    } else {
        semaphores.acquire(&args.name, limit, timeout).await?
    };

    Ok(SemaphoreOutput {
        operation: "acquire",
        name: args.name,
        success: token.is_some(),
        token: token.map(Token::into_inner),
        count: None,
    })
}

async fn semaphore_release(client: &LatchkeyClient, args: ReleaseArgs) -> Result<SemaphoreOutput> {
    let semaphores = client.semaphores();
    let token = Token::new(args.token);
    let released = if args.fair {
        semaphores.release_fair(&args.name, &token).await?
    } else {
        semaphores.release(&args.name, &token).await?
    };

    Ok(SemaphoreOutput {
        operation: "release",
        name: args.name,
        success: released,
        token: Some(token.into_inner()),
        count: None,
    })
}

async fn semaphore_refresh(client: &LatchkeyClient, args: RefreshArgs) -> Result<SemaphoreOutput> {
    let token = Token::new(args.token);
    let held = client.semaphores().refresh_fair(&args.name, &token).await?;
    Ok(SemaphoreOutput {
        operation: "refresh",
        name: args.name,
        success: held,
        token: Some(token.into_inner()),
        count: None,
    })
}

async fn semaphore_count(client: &LatchkeyClient, args: CountArgs) -> Result<SemaphoreOutput> {
    let timeout = Duration::from_millis(args.timeout.unwrap_or(client.config().semaphore.timeout_ms));
    let count = client.semaphores().holder_count(&args.name, timeout).await?;
    Ok(SemaphoreOutput {
        operation: "count",
        name: args.name,
        success: true,
        token: None,
        count: Some(count),
    })
}
