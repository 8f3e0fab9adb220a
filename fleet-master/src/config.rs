use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::TimeDelta;
use serde::Deserialize;

use crate::orchestrator::OrchestratorSettings;
use crate::policy::PolicyConfig;

/// Unrecoverable configuration problems. These are the only fatal errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("at least one runner slot must be configured")]
    NoSlots,
    #[error("fleet size must be between 1 and the slot count ({slots}), got {fleet_size}")]
    FleetSize { fleet_size: usize, slots: usize },
    #[error("{name} must be a positive duration")]
    NonPositive { name: &'static str },
    #[error("template {name} must contain the {{index}} placeholder: {value}")]
    Template { name: &'static str, value: String },
    #[error("runner ports overflow: base {base} with {slots} slots")]
    PortRange { base: u16, slots: usize },
}

/// PoolTool tip reporting, enabled when a pool id is set.
#[derive(Debug, Clone)]
pub struct PoolToolConfig {
    pub pool_id: String,
    pub user_id: String,
    /// Genesis block hash; only its first 14 characters are sent.
    pub genesis: String,
    /// Minimum time between two requests of the same kind.
    pub period: Duration,
    pub share_tip_url: String,
    pub stats_url: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Number of runner slots (`0..runners`)
    pub runners: usize,
    /// How many runners may be alive at once in steady state
    pub fleet_size: usize,
    /// systemd unit per runner, `{index}` is substituted
    pub unit_template: String,
    /// Host the runner REST APIs listen on
    pub rest_host: String,
    /// REST port of runner 0; runner `i` listens on `base + i`
    pub rest_port_base: u16,
    pub storage_template: String,
    pub config_template: String,
    /// YAML node secret posted to a runner when it is promoted
    pub node_secret_path: PathBuf,
    /// Fixed delay between two poll cycles
    pub cycle_period: Duration,
    pub pre_rollover_margin: Duration,
    pub event_lead_margin: Duration,
    /// No runner is warmed up when an event or rollover is closer than this
    pub warmup_horizon: Duration,
    /// Sleep through events starting closer than this
    pub hibernate_margin: Duration,
    pub max_boot_time: Duration,
    /// How long a freshly launched unit may keep its REST API closed
    pub rest_grace: Duration,
    pub request_timeout: Duration,
    pub max_height_lag: u64,
    pub leader_lag_tolerance: u64,
    /// Emit the fleet health line every N cycles
    pub health_log_every: u64,
    /// Consecutive failed cycles before a slot's transition failures are escalated
    pub persistent_failure_threshold: u32,
    /// Admin API bind address; `None` disables the API
    pub admin_addr: Option<String>,
    pub pooltool: Option<PoolToolConfig>,
}

/// Optional TOML layer. Environment variables override every field.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub runners: Option<usize>,
    pub fleet_size: Option<usize>,
    pub unit_template: Option<String>,
    pub rest_host: Option<String>,
    pub rest_port_base: Option<u16>,
    pub storage_template: Option<String>,
    pub config_template: Option<String>,
    pub node_secret_path: Option<String>,
    pub cycle_period_secs: Option<u64>,
    pub pre_rollover_margin_secs: Option<u64>,
    pub event_lead_margin_secs: Option<u64>,
    pub warmup_horizon_secs: Option<u64>,
    pub hibernate_margin_secs: Option<u64>,
    pub max_boot_time_secs: Option<u64>,
    pub rest_grace_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub max_height_lag: Option<u64>,
    pub leader_lag_tolerance: Option<u64>,
    pub health_log_every: Option<u64>,
    pub persistent_failure_threshold: Option<u32>,
    pub admin_addr: Option<String>,
    pub pooltool_pool_id: Option<String>,
    pub pooltool_user_id: Option<String>,
    pub pooltool_genesis: Option<String>,
    pub pooltool_period_secs: Option<u64>,
}

impl FileConfig {
    pub fn read(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {}: {e}", path.display()))?;
        toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file {}: {e}", path.display()))
    }
}

impl Config {
    /// Load `.env`, the optional `FLEET_CONFIG_FILE`, then the environment.
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let file = match std::env::var("FLEET_CONFIG_FILE") {
            Ok(path) => FileConfig::read(Path::new(&path))?,
            Err(_) => FileConfig::default(),
        };
        let config = Self::from_sources(file, |key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_sources(
        file: FileConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let env = &env;
        let runners = env_parse(env, "FLEET_RUNNERS", file.runners.unwrap_or(3))?;

        let pool_id = env_str(env, "POOLTOOL_POOL_ID", file.pooltool_pool_id.unwrap_or_default());
        let pooltool = if pool_id.trim().is_empty() {
            None
        } else {
            Some(PoolToolConfig {
                pool_id,
                user_id: env_str(env, "POOLTOOL_USER_ID", file.pooltool_user_id.unwrap_or_default()),
                genesis: env_str(env, "POOLTOOL_GENESIS", file.pooltool_genesis.unwrap_or_default()),
                period: secs(env_parse(
                    env,
                    "POOLTOOL_PERIOD_SECS",
                    file.pooltool_period_secs.unwrap_or(30),
                )?),
                share_tip_url: "https://api.pooltool.io/v0/sharemytip".to_string(),
                stats_url: "https://pooltool.s3-us-west-2.amazonaws.com/stats/stats.json"
                    .to_string(),
            })
        };

        let admin_addr = env_str(
            env,
            "FLEET_ADMIN_ADDR",
            file.admin_addr.unwrap_or_else(|| "127.0.0.1:9390".to_string()),
        );

        Ok(Self {
            runners,
            fleet_size: env_parse(env, "FLEET_SIZE", file.fleet_size.unwrap_or(runners))?,
            unit_template: env_str(
                env,
                "RUNNER_UNIT_TEMPLATE",
                file.unit_template
                    .unwrap_or_else(|| "jorm_runner@{index}.service".to_string()),
            ),
            rest_host: env_str(
                env,
                "RUNNER_REST_HOST",
                file.rest_host.unwrap_or_else(|| "127.0.0.1".to_string()),
            ),
            rest_port_base: env_parse(
                env,
                "RUNNER_REST_PORT_BASE",
                file.rest_port_base.unwrap_or(3100),
            )?,
            storage_template: env_str(
                env,
                "RUNNER_STORAGE_TEMPLATE",
                file.storage_template
                    .unwrap_or_else(|| "/var/lib/jormungandr/runner-{index}".to_string()),
            ),
            config_template: env_str(
                env,
                "RUNNER_CONFIG_TEMPLATE",
                file.config_template
                    .unwrap_or_else(|| "/etc/cardano/runner-{index}.yaml".to_string()),
            ),
            node_secret_path: PathBuf::from(env_str(
                env,
                "NODE_SECRET_PATH",
                file.node_secret_path
                    .unwrap_or_else(|| "/etc/cardano/node_secret.yaml".to_string()),
            )),
            cycle_period: secs(env_parse(
                env,
                "FLEET_CYCLE_PERIOD_SECS",
                file.cycle_period_secs.unwrap_or(2),
            )?),
            pre_rollover_margin: secs(env_parse(
                env,
                "FLEET_PRE_ROLLOVER_MARGIN_SECS",
                file.pre_rollover_margin_secs.unwrap_or(30),
            )?),
            event_lead_margin: secs(env_parse(
                env,
                "FLEET_EVENT_LEAD_MARGIN_SECS",
                file.event_lead_margin_secs.unwrap_or(30),
            )?),
            warmup_horizon: secs(env_parse(
                env,
                "FLEET_WARMUP_HORIZON_SECS",
                file.warmup_horizon_secs.unwrap_or(300),
            )?),
            hibernate_margin: secs(env_parse(
                env,
                "FLEET_HIBERNATE_MARGIN_SECS",
                file.hibernate_margin_secs.unwrap_or(10),
            )?),
            max_boot_time: secs(env_parse(
                env,
                "FLEET_MAX_BOOT_TIME_SECS",
                file.max_boot_time_secs.unwrap_or(900),
            )?),
            rest_grace: secs(env_parse(
                env,
                "RUNNER_REST_GRACE_SECS",
                file.rest_grace_secs.unwrap_or(60),
            )?),
            request_timeout: secs(env_parse(
                env,
                "RUNNER_REQUEST_TIMEOUT_SECS",
                file.request_timeout_secs.unwrap_or(5),
            )?),
            max_height_lag: env_parse(
                env,
                "FLEET_MAX_HEIGHT_LAG",
                file.max_height_lag.unwrap_or(5),
            )?,
            leader_lag_tolerance: env_parse(
                env,
                "FLEET_LEADER_LAG_TOLERANCE",
                file.leader_lag_tolerance.unwrap_or(1),
            )?,
            health_log_every: env_parse(
                env,
                "FLEET_HEALTH_LOG_EVERY",
                file.health_log_every.unwrap_or(30),
            )?,
            persistent_failure_threshold: env_parse(
                env,
                "FLEET_PERSISTENT_FAILURE_THRESHOLD",
                file.persistent_failure_threshold.unwrap_or(5),
            )?,
            admin_addr: Some(admin_addr).filter(|a| !a.trim().is_empty()),
            pooltool,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.runners == 0 {
            return Err(ConfigError::NoSlots);
        }
        if self.fleet_size == 0 || self.fleet_size > self.runners {
            return Err(ConfigError::FleetSize {
                fleet_size: self.fleet_size,
                slots: self.runners,
            });
        }
        for (name, value) in [
            ("unit_template", &self.unit_template),
            ("storage_template", &self.storage_template),
            ("config_template", &self.config_template),
        ] {
            if !value.contains("{index}") {
                return Err(ConfigError::Template {
                    name,
                    value: value.clone(),
                });
            }
        }
        if usize::from(self.rest_port_base) + self.runners - 1 > usize::from(u16::MAX) {
            return Err(ConfigError::PortRange {
                base: self.rest_port_base,
                slots: self.runners,
            });
        }
        for (name, value) in [
            ("cycle_period", self.cycle_period),
            ("pre_rollover_margin", self.pre_rollover_margin),
            ("event_lead_margin", self.event_lead_margin),
            ("warmup_horizon", self.warmup_horizon),
            ("max_boot_time", self.max_boot_time),
        ] {
            if value.is_zero() {
                return Err(ConfigError::NonPositive { name });
            }
        }
        Ok(())
    }

    /// Margins and thresholds consumed by the role-selection policy.
    pub fn policy(&self) -> Result<PolicyConfig, ConfigError> {
        Ok(PolicyConfig {
            fleet_size: self.fleet_size,
            pre_rollover_margin: delta("pre_rollover_margin", self.pre_rollover_margin)?,
            event_lead_margin: delta("event_lead_margin", self.event_lead_margin)?,
            warmup_horizon: delta("warmup_horizon", self.warmup_horizon)?,
            leader_lag_tolerance: self.leader_lag_tolerance,
            max_height_lag: self.max_height_lag,
            max_boot_time: delta("max_boot_time", self.max_boot_time)?,
        })
    }

    pub fn orchestrator(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            cycle_period: self.cycle_period,
            hibernate_margin: TimeDelta::from_std(self.hibernate_margin)
                .unwrap_or_else(|_| TimeDelta::zero()),
            health_log_every: self.health_log_every.max(1),
            persistent_failure_threshold: self.persistent_failure_threshold.max(1),
        }
    }
}

fn secs(value: u64) -> Duration {
    Duration::from_secs(value)
}

fn delta(name: &'static str, value: Duration) -> Result<TimeDelta, ConfigError> {
    TimeDelta::from_std(value)
        .ok()
        .filter(|d| *d > TimeDelta::zero())
        .ok_or(ConfigError::NonPositive { name })
}

fn env_str(env: &impl Fn(&str) -> Option<String>, key: &str, default: String) -> String {
    env(key).unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match env(key) {
        Some(val) => val
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
        None => Ok(default),
    }
}
