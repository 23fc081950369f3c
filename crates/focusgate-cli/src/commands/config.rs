use clap::Subcommand;
use focusgate_core::EngineConfig;

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the full configuration as JSON
    Show,
    /// Set the user the sessions belong to
    SetUser {
        /// User id, e.g. "u-42"
        user_id: String,
    },
    /// Set the analytics backend endpoint
    SetEndpoint {
        /// Full URL, e.g. "https://api.example.com/ingest"
        url: String,
    },
    /// Set the fixed UTC offset used for local calendar dates
    SetOffset {
        /// Offset in minutes, e.g. 120 for UTC+02:00
        minutes: i32,
    },
    /// Reset config to defaults
    Reset,
}

pub fn run(action: ConfigAction) -> Result<(), Box<dyn std::error::Error>> {
    match action {
        ConfigAction::Show => {
            let config = EngineConfig::load()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        ConfigAction::SetUser { user_id } => {
            let mut config = EngineConfig::load()?;
            config.user_id = Some(user_id);
            config.save()?;
            println!("ok");
        }
        ConfigAction::SetEndpoint { url } => {
            let mut config = EngineConfig::load()?;
            config.sync_endpoint = Some(url);
            config.save()?;
            println!("ok");
        }
        ConfigAction::SetOffset { minutes } => {
            let mut config = EngineConfig::load()?;
            config.utc_offset_minutes = minutes;
            config.save()?;
            println!("ok");
        }
        ConfigAction::Reset => {
            let config = EngineConfig::default();
            config.save()?;
            println!("config reset to defaults");
        }
    }
    Ok(())
}
