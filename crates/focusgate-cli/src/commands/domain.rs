use clap::Subcommand;
use focusgate_core::Command;

use crate::common;

#[derive(Subcommand)]
pub enum DomainAction {
    /// Add a domain to the blocklist
    Add {
        /// Domain to block, e.g. "reddit.com"
        domain: String,
    },
    /// Remove a domain from the blocklist
    Remove {
        /// Domain to unblock
        domain: String,
    },
    /// List blocked domains and active overrides
    List,
    /// Record a blocked access attempt (for host integrations)
    Attempt {
        /// Domain that was blocked
        domain: String,
    },
}

pub async fn run(action: DomainAction) -> Result<(), Box<dyn std::error::Error>> {
    let cli = common::start().await?;
    let command = match action {
        DomainAction::Add { domain } => Command::AddBlockedDomain { domain },
        DomainAction::Remove { domain } => Command::RemoveBlockedDomain { domain },
        DomainAction::List => Command::GetBlockedDomains,
        DomainAction::Attempt { domain } => Command::RecordBlockedAttempt { domain },
    };
    common::print_response(cli.engine.handle(command).await)
}

pub async fn run_override(domain: String, minutes: u64) -> Result<(), Box<dyn std::error::Error>> {
    let cli = common::start().await?;
    let response = cli
        .engine
        .handle(Command::OverrideDomain {
            domain,
            duration_ms: minutes * 60 * 1000,
        })
        .await;
    common::print_response(response)
}
