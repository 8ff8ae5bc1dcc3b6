use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Ambient settings shared by every subcommand. Built once in `main` and
/// threaded through constructors — never read from globals (design note,
/// SPEC_FULL section 9).
///
/// Layered, lowest to highest precedence: built-in defaults, `hypershell.toml`
/// in the current directory, then `HYPERSHELL_*` environment variables, then
/// explicit CLI flags (applied by the caller after `HyperShellConfig::load`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HyperShellConfig {
    pub host: String,
    pub port: u16,
    pub authkey: String,
    pub template: String,
    pub maxsize: usize,
    pub max_attempts: u32,
    pub lease_ttl_secs: i64,
    pub drain_deadline_secs: u64,
    pub num_cores: usize,
    pub capture: bool,
    pub no_db: bool,
    pub db_path: PathBuf,
    pub logging_level: String,
}

impl Default for HyperShellConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 50001,
            authkey: hypershell_protocol::SENTINEL_AUTHKEY.to_string(),
            template: hypershell_template::DEFAULT_TEMPLATE.to_string(),
            maxsize: 10_000,
            max_attempts: 1,
            lease_ttl_secs: 60,
            drain_deadline_secs: 30,
            num_cores: num_cpus(),
            capture: false,
            no_db: false,
            db_path: PathBuf::from("hypershell.db"),
            logging_level: "info".to_string(),
        }
    }
}

impl HyperShellConfig {
    /// Loads defaults, then `hypershell.toml` if present, then `HYPERSHELL_*`
    /// environment variables (spec section 6).
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("hypershell").required(false))
            .add_source(config::Environment::with_prefix("HYPERSHELL").separator("_"));
        builder.build()?.try_deserialize()
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let value = serde_json::to_value(self).ok()?;
        value.get(key).map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}
