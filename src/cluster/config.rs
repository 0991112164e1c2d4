use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_OOB_JOIN_TIME_MS: u64 = 100;
const DEFAULT_WORKER_NAME: &str = "cluster-events";

pub const ENV_OOB_JOIN_TIME_MS: &str = "CLUSTER_EVENTS_OOB_JOIN_TIME_MS";
pub const ENV_WORKER_NAME: &str = "CLUSTER_EVENTS_WORKER_NAME";

/// Tunables for a `ClusterEngine`.
///
/// Embedding applications may deserialize this from their own configuration
/// source; missing fields fall back to the defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClusterConfig {
    /// How long the out-of-band dispatcher waits for one listener task
    /// before moving on to the next.
    pub oob_join_time_ms: u64,
    /// Thread name of the ordered delivery worker.
    pub ordered_worker_name: String,
}

impl ClusterConfig {
    /// Defaults overridden by `CLUSTER_EVENTS_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_OOB_JOIN_TIME_MS) {
            config.oob_join_time_ms = raw
                .trim()
                .parse()
                .with_context(|| format!("invalid {}: {:?}", ENV_OOB_JOIN_TIME_MS, raw))?;
        }

        if let Some(name) = lookup(ENV_WORKER_NAME)
            && !name.trim().is_empty()
        {
            config.ordered_worker_name = name.trim().to_string();
        }

        Ok(config)
    }

    pub fn oob_join_timeout(&self) -> Duration {
        Duration::from_millis(self.oob_join_time_ms)
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            oob_join_time_ms: DEFAULT_OOB_JOIN_TIME_MS,
            ordered_worker_name: DEFAULT_WORKER_NAME.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = ClusterConfig::default();
        assert_eq!(config.oob_join_timeout(), Duration::from_millis(100));
        assert_eq!(config.ordered_worker_name, "cluster-events");
    }

    #[test]
    fn test_lookup_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            (ENV_OOB_JOIN_TIME_MS, " 250 "),
            (ENV_WORKER_NAME, "events-worker"),
        ]);

        let config = ClusterConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()))
            .expect("valid overrides");

        assert_eq!(config.oob_join_time_ms, 250);
        assert_eq!(config.ordered_worker_name, "events-worker");
    }

    #[test]
    fn test_lookup_rejects_bad_timeout() {
        let result = ClusterConfig::from_lookup(|key| {
            (key == ENV_OOB_JOIN_TIME_MS).then(|| "soon".to_string())
        });

        let err = result.unwrap_err();
        assert!(err.to_string().contains(ENV_OOB_JOIN_TIME_MS));
    }

    #[test]
    fn test_deserialize_partial_json() {
        let config: ClusterConfig =
            serde_json::from_str(r#"{"oob_join_time_ms": 500}"#).expect("valid json");

        assert_eq!(config.oob_join_time_ms, 500);
        assert_eq!(config.ordered_worker_name, "cluster-events");
    }
}
