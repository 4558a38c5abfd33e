//! Small `std::env`-based configuration loader.
//!
//! Mirrors the shape of `toka-llm-gateway`'s `EnvLoader` — gather a fixed
//! list of named variables up front, then hand out typed, defaulted
//! accessors — simplified since none of drylab's knobs are secrets.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

struct EnvLoader {
    vars: HashMap<&'static str, String>,
}

impl EnvLoader {
    fn gather(names: &[&'static str]) -> Self {
        let vars = names
            .iter()
            .filter_map(|&name| std::env::var(name).ok().map(|v| (name, v)))
            .collect();
        Self { vars }
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(|s| s.as_str())
    }

    fn get_numeric<T: FromStr>(&self, name: &str, default: T) -> T {
        self.get(name).and_then(|v| v.parse().ok()).unwrap_or(default)
    }
}

/// Resolved runtime configuration, gathered once at startup.
pub struct Config {
    /// Path to the SQLite database file (`:memory:` for an ephemeral store).
    pub db_path: String,
    /// Directory the schema registry loads `NAME.vVERSION.json` from.
    pub schema_dir: PathBuf,
    /// Idle window shared by `subscribe` and the pipeline watchdog.
    pub idle_timeout: Duration,
}

impl Config {
    /// Gather configuration from the environment, falling back to the
    /// defaults documented for `DRYLAB_DB_PATH`, `DRYLAB_SCHEMA_DIR` and
    /// `IDLE_TIMEOUT_MS`.
    pub fn from_env() -> Self {
        let loader = EnvLoader::gather(&["DRYLAB_DB_PATH", "DRYLAB_SCHEMA_DIR", "IDLE_TIMEOUT_MS"]);

        Self {
            db_path: loader.get("DRYLAB_DB_PATH").unwrap_or("drylab.db").to_string(),
            schema_dir: PathBuf::from(loader.get("DRYLAB_SCHEMA_DIR").unwrap_or("./schemas")),
            idle_timeout: Duration::from_millis(loader.get_numeric("IDLE_TIMEOUT_MS", 5_000u64)),
        }
    }
}
