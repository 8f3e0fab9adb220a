//! Client for a runner's node REST API.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum NodeApiError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("invalid timestamp {value:?}: {reason}")]
    Timestamp { value: String, reason: String },
}

/// `GET /api/v0/node/stats`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStats {
    pub state: String,
    #[serde(default)]
    pub last_block_height: Option<Height>,
}

impl NodeStats {
    /// Whether initial block sync has completed.
    pub fn is_synced(&self) -> bool {
        self.state == "Running"
    }

    pub fn height(&self) -> Option<u64> {
        self.last_block_height.as_ref().and_then(Height::value)
    }
}

/// Heights are reported as strings by some node versions and numbers by others.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Height {
    Number(u64),
    Text(String),
}

impl Height {
    pub fn value(&self) -> Option<u64> {
        match self {
            Height::Number(n) => Some(*n),
            Height::Text(s) => s.trim().parse().ok(),
        }
    }
}

/// `GET /api/v0/settings`, only the fields needed to locate epochs.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSettings {
    pub block0_time: String,
    /// Seconds.
    pub slot_duration: u64,
    pub slots_per_epoch: u64,
}

impl NodeSettings {
    pub fn block0(&self) -> Result<DateTime<Utc>, NodeApiError> {
        parse_time(&self.block0_time)
    }
}

/// One entry of `GET /api/v0/leaders/logs`.
#[derive(Debug, Clone, Deserialize)]
pub struct LeaderLog {
    pub scheduled_at_time: String,
}

impl LeaderLog {
    pub fn scheduled_at(&self) -> Result<DateTime<Utc>, NodeApiError> {
        parse_time(&self.scheduled_at_time)
    }
}

/// Parse node timestamps such as `2019-12-13T19:13:37+00:00`.
pub fn parse_time(value: &str) -> Result<DateTime<Utc>, NodeApiError> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| NodeApiError::Timestamp {
            value: value.to_string(),
            reason: e.to_string(),
        })
}

#[derive(Debug, Clone)]
pub struct NodeApi {
    client: reqwest::Client,
    base_url: String,
}

impl NodeApi {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, NodeApiError> {
        let base_url = base_url.into();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| NodeApiError::Http {
                url: base_url.clone(),
                source,
            })?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v0/{path}", self.base_url.trim_end_matches('/'))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, NodeApiError> {
        let url = self.url(path);
        let wrap = |source| NodeApiError::Http {
            url: url.clone(),
            source,
        };
        self.client
            .get(&url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(wrap)?
            .json::<T>()
            .await
            .map_err(wrap)
    }

    pub async fn stats(&self) -> Result<NodeStats, NodeApiError> {
        self.get_json("node/stats").await
    }

    pub async fn settings(&self) -> Result<NodeSettings, NodeApiError> {
        self.get_json("settings").await
    }

    /// Ids of the leaders registered on this node; empty means leader-disabled.
    pub async fn leaders(&self) -> Result<Vec<u64>, NodeApiError> {
        self.get_json("leaders").await
    }

    pub async fn leader_logs(&self) -> Result<Vec<LeaderLog>, NodeApiError> {
        self.get_json("leaders/logs").await
    }

    /// Register the node secret, enabling block production.
    pub async fn register_leader(&self, secret: &serde_yaml::Value) -> Result<(), NodeApiError> {
        let url = self.url("leaders");
        self.client
            .post(&url)
            .json(secret)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map(|_| ())
            .map_err(|source| NodeApiError::Http { url, source })
    }

    pub async fn remove_leader(&self, id: u64) -> Result<(), NodeApiError> {
        let url = self.url(&format!("leaders/{id}"));
        self.client
            .delete(&url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map(|_| ())
            .map_err(|source| NodeApiError::Http { url, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_stats_accept_string_and_numeric_heights() {
        let text: NodeStats =
            serde_json::from_str(r#"{"state":"Running","lastBlockHeight":"1234"}"#).unwrap();
        let number: NodeStats =
            serde_json::from_str(r#"{"state":"Running","lastBlockHeight":1234}"#).unwrap();
        let booting: NodeStats = serde_json::from_str(r#"{"state":"Bootstrapping"}"#).unwrap();

        assert!(text.is_synced());
        assert_eq!(text.height(), Some(1234));
        assert_eq!(number.height(), Some(1234));
        assert!(!booting.is_synced());
        assert_eq!(booting.height(), None);
    }

    #[test]
    fn test_parse_node_timestamp() {
        let parsed = parse_time("2019-12-13T19:13:37+00:00").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2019, 12, 13, 19, 13, 37).unwrap());
        assert!(parse_time("yesterday").is_err());
    }

    #[test]
    fn test_settings_and_leader_logs_deserialize() {
        let settings: NodeSettings = serde_json::from_str(
            r#"{"block0Time":"2019-12-13T19:13:37+00:00","slotDuration":2,"slotsPerEpoch":43200,"fees":{}}"#,
        )
        .unwrap();
        assert_eq!(settings.slot_duration, 2);
        assert_eq!(settings.slots_per_epoch, 43200);
        assert!(settings.block0().is_ok());

        let logs: Vec<LeaderLog> = serde_json::from_str(
            r#"[{"created_at_time":"x","scheduled_at_time":"2019-12-14T00:00:01+00:00","status":"Pending"}]"#,
        )
        .unwrap();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].scheduled_at().is_ok());
    }

    #[test]
    fn test_url_joins_api_prefix() {
        let api = NodeApi::with_client(reqwest::Client::new(), "http://127.0.0.1:3100/");
        assert_eq!(api.url("node/stats"), "http://127.0.0.1:3100/api/v0/node/stats");
    }
}
