//! Shared engine bootstrap for the command modules.

use std::sync::Arc;

use focusgate_core::{
    CommandResponse, Engine, EngineConfig, HttpSyncBackend, MemoryRuleHost, MemorySyncBackend,
    RuleHost, SqliteHostStore, SyncBackend,
};

/// Engine plus the in-process rule host, so `rules` can show what the
/// current state derives.
pub struct CliEngine {
    pub engine: Arc<Engine>,
    pub rule_host: Arc<MemoryRuleHost>,
}

/// Assemble an engine over the default SQLite store.
///
/// The CLI has no browser to enforce rules in, so rules land in an
/// in-process host; they are derived from state and any real host would
/// reconstruct the same set.
pub async fn start() -> Result<CliEngine, Box<dyn std::error::Error>> {
    let config = EngineConfig::load()?;
    let host = Arc::new(SqliteHostStore::open_default()?);
    let rule_host = Arc::new(MemoryRuleHost::new());
    let backend: Arc<dyn SyncBackend> = match &config.sync_endpoint {
        Some(endpoint) => Arc::new(HttpSyncBackend::new(endpoint.clone())),
        None => Arc::new(MemorySyncBackend::new()),
    };
    let engine = Engine::start(
        config,
        host,
        Arc::clone(&rule_host) as Arc<dyn RuleHost>,
        backend,
    )
    .await?;
    Ok(CliEngine { engine, rule_host })
}

/// Print a response the way every subcommand does: data (or ok) on
/// stdout, errors on stderr with a failing exit.
pub fn print_response(response: CommandResponse) -> Result<(), Box<dyn std::error::Error>> {
    if !response.success {
        return Err(response
            .error
            .unwrap_or_else(|| "command failed".to_string())
            .into());
    }
    match response.data {
        Some(data) => println!("{}", serde_json::to_string_pretty(&data)?),
        None => println!("ok"),
    }
    Ok(())
}
