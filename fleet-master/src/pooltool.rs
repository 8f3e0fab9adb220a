//! PoolTool integration: share the fleet tip and learn the network majority tip.
//!
//! Both calls are throttled to one attempt per configured period, failed or
//! not, and never fail the caller; the last known majority tip is kept on errors.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::PoolToolConfig;

#[derive(Debug, Deserialize)]
struct PoolToolStats {
    #[serde(rename = "majoritymax")]
    majority_max: crate::node_api::Height,
}

#[derive(Debug, Default)]
struct Throttle {
    last_sent: Option<DateTime<Utc>>,
    last_received: Option<DateTime<Utc>>,
    majority_max: Option<u64>,
}

pub struct PoolTool {
    client: reqwest::Client,
    config: PoolToolConfig,
    period: TimeDelta,
    state: Mutex<Throttle>,
}

impl PoolTool {
    pub fn new(config: PoolToolConfig, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let period = TimeDelta::from_std(config.period)?;
        Ok(Self {
            client,
            config,
            period,
            state: Mutex::new(Throttle::default()),
        })
    }

    fn due(&self, last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        last.map_or(true, |at| now.signed_duration_since(at) >= self.period)
    }

    fn genesis_prefix(&self) -> &str {
        let genesis = self.config.genesis.as_str();
        genesis.get(..14).unwrap_or(genesis)
    }

    /// Report the best local height. Zero heights are not reported.
    pub async fn send_height(&self, height: u64, now: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        if height == 0 || !self.due(state.last_sent, now) {
            return;
        }
        state.last_sent = Some(now);

        let tip = height.to_string();
        let request = self.client.get(&self.config.share_tip_url).query(&[
            ("poolid", self.config.pool_id.as_str()),
            ("userid", self.config.user_id.as_str()),
            ("genesispref", self.genesis_prefix()),
            ("mytip", tip.as_str()),
        ]);
        match request.send().await.and_then(reqwest::Response::error_for_status) {
            Ok(_) => info!(height, "tip sent to PoolTool"),
            Err(e) => warn!(error = %e, "cannot send tip to PoolTool"),
        }
    }

    /// Network majority tip, refreshed at most once per period.
    pub async fn majority_max(&self, now: DateTime<Utc>) -> Option<u64> {
        let mut state = self.state.lock().await;
        if !self.due(state.last_received, now) {
            return state.majority_max;
        }
        state.last_received = Some(now);

        let response = match self
            .client
            .get(&self.config.stats_url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
        {
            Ok(response) => response.json::<PoolToolStats>().await,
            Err(e) => Err(e),
        };
        match response.map(|stats| stats.majority_max.value()) {
            Ok(Some(value)) => state.majority_max = Some(value),
            Ok(None) => warn!("PoolTool majority max is not a number"),
            Err(e) => warn!(
                error = %e,
                last_known = ?state.majority_max,
                "cannot update majority max from PoolTool, using last known value"
            ),
        }
        state.majority_max
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn pooltool(genesis: &str) -> PoolTool {
        PoolTool::new(
            PoolToolConfig {
                pool_id: "pool".to_string(),
                user_id: "user".to_string(),
                genesis: genesis.to_string(),
                period: Duration::from_secs(30),
                share_tip_url: "http://127.0.0.1:9/sharemytip".to_string(),
                stats_url: "http://127.0.0.1:9/stats.json".to_string(),
            },
            Duration::from_millis(200),
        )
        .unwrap()
    }

    #[test]
    fn test_genesis_prefix_is_fourteen_chars() {
        let tool = pooltool("8e4d2a343f3dcf9330ad9035b3e8d168e6728904262f2c434a4f8f934ec7b676");
        assert_eq!(tool.genesis_prefix(), "8e4d2a343f3dcf");
        assert_eq!(pooltool("abc").genesis_prefix(), "abc");
    }

    #[test]
    fn test_throttle_period() {
        let tool = pooltool("abc");
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        assert!(tool.due(None, t0));
        assert!(!tool.due(Some(t0), t0 + TimeDelta::seconds(29)));
        assert!(tool.due(Some(t0), t0 + TimeDelta::seconds(30)));
    }

    #[test]
    fn test_stats_majority_max_parses() {
        let stats: PoolToolStats = serde_json::from_str(r#"{"majoritymax": "4242", "x": 1}"#).unwrap();
        assert_eq!(stats.majority_max.value(), Some(4242));
    }

    #[tokio::test]
    async fn test_unreachable_pooltool_keeps_last_known_value() {
        let tool = pooltool("abc");
        tool.state.lock().await.majority_max = Some(77);

        let value = tool.majority_max(Utc::now()).await;

        assert_eq!(value, Some(77));
    }

    #[tokio::test]
    async fn test_failed_attempts_still_wait_a_full_period() {
        let tool = pooltool("abc");
        let now = Utc::now();

        tool.send_height(1_000, now).await;
        assert_eq!(tool.majority_max(now).await, None);

        let state = tool.state.lock().await;
        assert_eq!(state.last_sent, Some(now));
        assert_eq!(state.last_received, Some(now));
        assert!(!tool.due(state.last_received, now + TimeDelta::seconds(29)));
        assert!(tool.due(state.last_received, now + TimeDelta::seconds(30)));
    }

    #[tokio::test]
    async fn test_zero_height_is_not_an_attempt() {
        let tool = pooltool("abc");

        tool.send_height(0, Utc::now()).await;

        assert_eq!(tool.state.lock().await.last_sent, None);
    }
}
