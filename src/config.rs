//! Configuration loading from `.env` files.

use std::{env, path::PathBuf, time::Duration};

use anyhow::{Context, Result};

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory holding the session file.
    pub session_dir: PathBuf,
    /// Hex secret key for the local signer; `None` means no signer.
    pub secret_key: Option<String>,
    /// Relays reported by the local signer at login.
    pub relays: Vec<String>,
    /// Optional Tor SOCKS proxy (host:port).
    pub tor_socks: Option<String>,
    /// How long an action waits for the first relay acknowledgment.
    pub ack_timeout: Duration,
    /// How long the CLI waits for the follow list before acting.
    pub sync_timeout: Duration,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let session_dir = PathBuf::from(env::var("SESSION_DIR").context("SESSION_DIR not set")?);
        let secret_key = env::var("SECRET_KEY").ok().filter(|s| !s.trim().is_empty());
        let relays = csv_strings(env::var("RELAYS").unwrap_or_default());
        let tor_socks = env::var("TOR_SOCKS").ok().filter(|s| !s.is_empty());
        let ack_timeout = secs_var("ACK_TIMEOUT_SECS", 10);
        let sync_timeout = secs_var("SYNC_TIMEOUT_SECS", 5);
        Ok(Self {
            session_dir,
            secret_key,
            relays,
            tor_socks,
            ack_timeout,
            sync_timeout,
        })
    }
}

fn secs_var(name: &str, default: u64) -> Duration {
    let secs = env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default);
    Duration::from_secs(secs)
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    let s = input.as_ref();
    s.split(',')
        .filter_map(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .collect()
}
