use std::path::PathBuf;

use clap::{ArgAction, Parser};

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(
    name = "anketa",
    about = "Gateway for resumable voice consultation sessions",
    version
)]
pub struct Cli {
    #[arg(
        long,
        env = "ANKETA_BIND",
        default_value = "127.0.0.1:8790",
        help = "Socket address the HTTP gateway binds to"
    )]
    pub bind: String,

    #[arg(
        long = "state-dir",
        env = "ANKETA_STATE_DIR",
        default_value = ".anketa",
        help = "Directory holding the SQLite session store"
    )]
    pub state_dir: PathBuf,

    #[arg(
        long = "media-url",
        env = "ANKETA_MEDIA_URL",
        default_value = "ws://127.0.0.1:7880",
        help = "Media server URL handed to clients in join credentials"
    )]
    pub media_url: String,

    #[arg(
        long = "credential-secret",
        env = "ANKETA_CREDENTIAL_SECRET",
        hide_env_values = true,
        help = "Shared secret used to sign join credentials"
    )]
    pub credential_secret: String,

    #[arg(
        long = "credential-ttl-seconds",
        env = "ANKETA_CREDENTIAL_TTL_SECONDS",
        default_value_t = 3_600,
        value_parser = parse_positive_u64,
        help = "Lifetime of a minted join credential"
    )]
    pub credential_ttl_seconds: u64,

    #[arg(
        long = "in-memory-store",
        env = "ANKETA_IN_MEMORY_STORE",
        default_value_t = false,
        action = ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        help = "Keep sessions in memory instead of SQLite; everything is lost on exit"
    )]
    pub in_memory_store: bool,

    #[arg(
        long = "log-level",
        env = "ANKETA_LOG_LEVEL",
        help = "Default log directive when RUST_LOG is unset (e.g. info, anketa_gateway=debug)"
    )]
    pub log_level: Option<String>,
}
