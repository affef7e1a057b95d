use crate::error::{KeeperError, KeeperResult};
use crate::executor::ExecutorSettings;
use crate::orchestrator::OrchestratorSettings;
use crate::stanza::SynthSettings;
use chrono_tz::Tz;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use std::time::Duration;

/// Process-wide configuration, loaded on first access.
pub static CONFIG: LazyLock<Config> = LazyLock::new(|| {
    Config::load().unwrap_or_else(|e| panic!("failed to load configuration: {e}"))
});

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database_url: String,
    pub listen_addr: String,
    pub loglevel: String,
    /// Base64 of the 32-byte vault master key.
    pub master_key: String,
    pub timezone: String,
    pub scheduler_tick_ms: u64,
    pub command_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub safety_timeout_secs: u64,
    pub max_incremental_chain: u32,
    pub compress_type: String,
    pub compress_level: u8,
    pub default_pg_version: String,
    pub pgbackrest_conf_dir: String,
    pub local_repo_root: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite:pgkeeper.sqlite".to_string(),
            listen_addr: "0.0.0.0:8000".to_string(),
            loglevel: "info".to_string(),
            master_key: String::new(),
            timezone: "UTC".to_string(),
            scheduler_tick_ms: 1000,
            command_timeout_secs: 3600,
            connect_timeout_secs: 15,
            safety_timeout_secs: 600,
            max_incremental_chain: 6,
            compress_type: "zst".to_string(),
            compress_level: 3,
            default_pg_version: "16".to_string(),
            pgbackrest_conf_dir: "/etc/pgbackrest/conf.d".to_string(),
            local_repo_root: "/var/lib/pgbackrest".to_string(),
        }
    }
}

impl Config {
    /// Defaults, then the optional TOML file named by `PGKEEPER_CONFIG`,
    /// then `PGKEEPER_*` environment variables.
    pub fn load() -> KeeperResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Ok(path) = std::env::var("PGKEEPER_CONFIG") {
            figment = figment.merge(Toml::file(path));
        }
        figment
            .merge(Env::prefixed("PGKEEPER_").ignore(&["CONFIG"]))
            .extract()
            .map_err(|e| KeeperError::config(e.to_string()))
    }

    pub fn timezone(&self) -> KeeperResult<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| KeeperError::config(format!("invalid timezone {:?}: {e}", self.timezone)))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn safety_timeout(&self) -> Duration {
        Duration::from_secs(self.safety_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms.max(10))
    }

    pub fn synth_settings(&self) -> SynthSettings {
        SynthSettings {
            compress_type: self.compress_type.clone(),
            compress_level: self.compress_level,
            local_repo_root: self.local_repo_root.clone(),
            conf_dir: self.pgbackrest_conf_dir.clone(),
        }
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            synth: self.synth_settings(),
            command_timeout: self.command_timeout(),
            max_incremental_chain: self.max_incremental_chain,
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            synth: self.synth_settings(),
            command_timeout: self.command_timeout(),
            safety_timeout: self.safety_timeout(),
            health_retry_delay: Duration::from_secs(3),
        }
    }
}
