use clap::{Parser, Subcommand};

mod commands;
mod common;

#[derive(Parser)]
#[command(name = "focusgate-cli", version, about = "Focusgate CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Focus mode control
    Focus {
        #[command(subcommand)]
        action: commands::focus::FocusAction,
    },
    /// Blocked domain management
    Domain {
        #[command(subcommand)]
        action: commands::domain::DomainAction,
    },
    /// Temporarily exempt a blocked domain
    Override {
        /// Domain to exempt
        domain: String,
        /// Minutes the exemption lasts
        #[arg(long, default_value = "5")]
        minutes: u64,
    },
    /// Today's usage
    Usage,
    /// Ship pending records to the analytics backend
    Sync,
    /// Show the blocking rules the current state derives
    Rules,
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: commands::config::ConfigAction,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Focus { action } => commands::focus::run(action).await,
        Commands::Domain { action } => commands::domain::run(action).await,
        Commands::Override { domain, minutes } => {
            commands::domain::run_override(domain, minutes).await
        }
        Commands::Usage => commands::usage::run().await,
        Commands::Sync => commands::sync::run().await,
        Commands::Rules => commands::rules::run().await,
        Commands::Config { action } => commands::config::run(action),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
