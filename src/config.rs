//! CLI surface and connection-config loading.

use std::path::{Path, PathBuf};

use clap::Parser;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;

use crate::error::{Error, Result};

lazy_static! {
    static ref ENV_REF: Regex = Regex::new(r"env\[([^\]]+)\]").unwrap();
}

#[derive(Parser, Debug)]
#[command(name = "cros-session-deriver", about = "Derives custom sessions from raw ChromeOS-like telemetry events")]
pub struct Cli {
    /// Raw event source connection config (JSON)
    #[arg(short, long)]
    pub raw: PathBuf,

    /// Derived ("cros") session sink connection config (JSON)
    #[arg(short, long)]
    pub cros: PathBuf,

    /// Pending-session store connection config (JSON). Defaults to --cros
    /// when omitted.
    #[arg(short, long)]
    pub intermediate: Option<PathBuf>,

    /// Previous processor state (JSON: {"max_raw_event_receiving_time": ...})
    #[arg(short, long)]
    pub state: Option<PathBuf>,

    /// Suppress commits and stdout state emission.
    #[arg(long, default_value_t = false)]
    pub debug: bool,

    /// Drop the derived-session and pending-session tables, then exit.
    #[arg(long, default_value_t = false)]
    pub drop: bool,
}

/// A PostgreSQL connection descriptor.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    pub database: String,
    pub host: String,
    pub user: String,
    pub password: String,
    pub port: u16,
}

impl ConnectionConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let expanded = expand_env_refs(&text);
        serde_json::from_str(&expanded)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// `host=... user=... password=... port=... dbname=...`, the form
    /// `tokio_postgres::Config`'s `FromStr` expects.
    pub fn to_postgres_config_string(&self) -> String {
        format!(
            "host={} port={} user={} password={} dbname={}",
            self.host, self.port, self.user, self.password, self.database
        )
    }
}

/// Substitute every `env[NAME]` occurrence in `text` with the value of the
/// `NAME` environment variable (empty string if unset).
fn expand_env_refs(text: &str) -> String {
    ENV_REF
        .replace_all(text, |caps: &regex::Captures| std::env::var(&caps[1]).unwrap_or_default())
        .into_owned()
}
