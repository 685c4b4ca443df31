mod bootstrap_helpers;
mod cli_args;

use std::sync::Arc;

use anketa_gateway::{run_gateway_server, GatewayConfig};
use anketa_session::NoopExtractionService;
use anketa_store::{InMemorySessionStore, SessionStore, SqliteSessionStore};
use anyhow::{Context, Result};
use clap::Parser;

use bootstrap_helpers::init_tracing;
use cli_args::Cli;

const SESSION_DB_FILE: &str = "sessions.sqlite";

fn build_session_store(cli: &Cli) -> Result<Arc<dyn SessionStore>> {
    if cli.in_memory_store {
        tracing::warn!("using in-memory session store; sessions are lost on exit");
        return Ok(Arc::new(InMemorySessionStore::new()));
    }
    let path = cli.state_dir.join(SESSION_DB_FILE);
    let store = SqliteSessionStore::new(&path)
        .with_context(|| format!("failed to open session store {}", path.display()))?;
    tracing::info!(path = %path.display(), "session store opened");
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    let store = build_session_store(&cli)?;
    let config = GatewayConfig {
        bind: cli.bind,
        media_url: cli.media_url,
        credential_secret: cli.credential_secret,
        credential_ttl_seconds: cli.credential_ttl_seconds,
    };
    run_gateway_server(config, store, Arc::new(NoopExtractionService)).await
}
