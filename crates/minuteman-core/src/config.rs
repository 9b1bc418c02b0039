use std::collections::BTreeMap;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::types::JobOptions;

/// Top-level config (minuteman.toml + MINUTEMAN_* env overrides).
///
/// ```toml
/// [defaults]
/// output = "/var/log/minuteman/jobs.log"
/// recipients = "ops@example.com"
///
/// [jobs.backup]
/// command = "/usr/local/bin/backup.sh"
/// schedule = "0 3 * * *"
/// max_runtime = 3600
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MinutemanConfig {
    /// Merged under every job's own options.
    #[serde(default)]
    pub defaults: JobOptions,
    /// Jobs keyed by name, in name order.
    #[serde(default)]
    pub jobs: BTreeMap<String, JobOptions>,
}

impl MinutemanConfig {
    /// Load config from a TOML file with MINUTEMAN_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `MINUTEMAN_DEFAULTS__RECIPIENTS=ops@example.com`.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. $MINUTEMAN_CONFIG
    ///   3. ~/.minuteman/minuteman.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("MINUTEMAN_CONFIG").ok())
            .unwrap_or_else(default_config_path);

        tracing::debug!(%path, "loading configuration");

        let config: MinutemanConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("MINUTEMAN_").split("__"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.minuteman/minuteman.toml", home)
}
