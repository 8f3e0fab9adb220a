use shared_types::SlotInfo;

use crate::config::Config;

/// A runner identity slot with the fixed resources derived from its index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerSlot {
    pub index: usize,
    /// systemd unit supervising the node process
    pub unit: String,
    pub rest_host: String,
    pub rest_port: u16,
    pub storage_path: String,
    pub config_path: String,
}

impl RunnerSlot {
    pub fn rest_url(&self) -> String {
        format!("http://{}:{}", self.rest_host, self.rest_port)
    }

    pub fn info(&self) -> SlotInfo {
        SlotInfo {
            index: self.index,
            unit: self.unit.clone(),
            rest_port: self.rest_port,
            storage_path: self.storage_path.clone(),
            config_path: self.config_path.clone(),
        }
    }
}

impl std::fmt::Display for RunnerSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "runner {}", self.index)
    }
}

/// Enumerate the configured slots `0..runners`.
///
/// Assumes a validated config; ports past `u16::MAX` saturate.
pub fn slots(config: &Config) -> Vec<RunnerSlot> {
    (0..config.runners)
        .map(|index| RunnerSlot {
            index,
            unit: expand(&config.unit_template, index),
            rest_host: config.rest_host.clone(),
            rest_port: u16::try_from(index)
                .ok()
                .and_then(|i| config.rest_port_base.checked_add(i))
                .unwrap_or(u16::MAX),
            storage_path: expand(&config.storage_template, index),
            config_path: expand(&config.config_template, index),
        })
        .collect()
}

fn expand(template: &str, index: usize) -> String {
    template.replace("{index}", &index.to_string())
}
