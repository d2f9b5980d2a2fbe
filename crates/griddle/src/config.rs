//! Startup configuration.
//!
//! Read once when a server is launched and immutable afterwards.

use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tracing::warn;
use crate::error::ServerError;

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Number of slots (parallel sequences).
    pub n_slots: usize,
    /// Total context size of the shared KV cache, in positions.
    pub n_ctx: usize,
    /// Maximum number of positions submitted in one engine invocation.
    pub n_batch: usize,
    /// With a unified cache every slot may grow up to `n_ctx` positions while
    /// the sum over all slots is bounded by `n_ctx`. Otherwise each slot owns
    /// a fixed `n_ctx / n_slots` partition.
    pub kv_unified: bool,
    /// Maximum number of queued tasks. `None` means unbounded.
    pub queue_capacity: Option<usize>,
    /// Bytes of engine state kept as prompt checkpoints. `0` disables
    /// checkpoint retention.
    pub checkpoint_budget_bytes: usize,
    /// Upper bound on the number of retained checkpoints.
    pub max_checkpoints: usize,
    /// Prefixes shorter than this are not worth checkpointing.
    pub checkpoint_min_tokens: usize,
    /// Directory for slot save/restore files. `None` disables the feature.
    pub slot_save_path: Option<PathBuf>,
    /// How long results of a finished task wait for a consumer before they
    /// are dropped.
    #[serde(with = "duration_secs")]
    pub result_retention: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            n_slots: 4,
            n_ctx: 4096,
            n_batch: 512,
            kv_unified: true,
            queue_capacity: None,
            checkpoint_budget_bytes: 0,
            max_checkpoints: 32,
            checkpoint_min_tokens: 4,
            slot_save_path: None,
            result_retention: Duration::from_secs(300),
        }
    }
}

impl ServerConfig {
    /// Parse a JSON configuration document. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self, ServerError> {
        serde_json::from_str(json).map_err(|e| ServerError::Config(e.to_string()))
    }

    /// Read a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ServerError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    /// Reject impossible settings and apply the single-slot promotion.
    ///
    /// A lone slot with a split cache is promoted to four slots sharing a
    /// unified cache, which serves local use far better at no extra memory.
    pub fn validated(mut self) -> Result<Self, ServerError> {
        if self.n_slots == 0 {
            return Err(ServerError::Config("n_slots must be at least 1".into()));
        }
        if self.n_batch == 0 {
            return Err(ServerError::Config("n_batch must be at least 1".into()));
        }
        if self.n_slots == 1 && !self.kv_unified {
            warn!("setting n_slots = 4 and kv_unified = true");
            self.n_slots = 4;
            self.kv_unified = true;
        }
        if self.n_ctx < self.n_slots {
            return Err(ServerError::Config(format!(
                "n_ctx ({}) is smaller than n_slots ({})",
                self.n_ctx, self.n_slots
            )));
        }
        if self.n_batch < self.n_slots {
            return Err(ServerError::Config(format!(
                "n_batch ({}) is smaller than n_slots ({}), some slots would never be decoded",
                self.n_batch, self.n_slots
            )));
        }
        if self.queue_capacity == Some(0) {
            return Err(ServerError::Config("queue_capacity must be positive".into()));
        }
        Ok(self)
    }

    /// Context positions available to a single slot.
    pub fn n_ctx_slot(&self) -> usize {
        if self.kv_unified {
            self.n_ctx
        } else {
            self.n_ctx / self.n_slots
        }
    }
}

/// Router configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// A ready instance with no activity for this long is stopped by the reaper.
    #[serde(with = "duration_secs")]
    pub idle_timeout: Duration,
    /// Interval between reaper passes when the background reaper runs.
    #[serde(with = "duration_secs")]
    pub reap_interval: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(600),
            reap_interval: Duration::from_secs(10),
        }
    }
}

mod duration_secs {
    use std::time::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_slot_promotion() {
        let config = ServerConfig { n_slots: 1, kv_unified: false, ..Default::default() }
            .validated()
            .unwrap();
        assert_eq!(config.n_slots, 4);
        assert!(config.kv_unified);
    }

    #[test]
    fn test_per_slot_context() {
        let config = ServerConfig { n_slots: 4, n_ctx: 1024, kv_unified: false, ..Default::default() };
        assert_eq!(config.n_ctx_slot(), 256);
        let config = ServerConfig { kv_unified: true, ..config };
        assert_eq!(config.n_ctx_slot(), 1024);
    }

    #[test]
    fn test_rejects_invalid() {
        assert!(ServerConfig { n_slots: 0, ..Default::default() }.validated().is_err());
        assert!(ServerConfig { n_batch: 0, ..Default::default() }.validated().is_err());
        assert!(ServerConfig { queue_capacity: Some(0), ..Default::default() }.validated().is_err());
    }

    #[test]
    fn test_batch_must_cover_every_slot() {
        let config = ServerConfig { n_slots: 8, n_batch: 4, ..Default::default() };
        assert!(matches!(config.validated(), Err(ServerError::Config(_))));
        assert!(ServerConfig { n_slots: 8, n_batch: 8, ..Default::default() }.validated().is_ok());

        // Checked after the single-slot promotion.
        let promoted = ServerConfig { n_slots: 1, n_batch: 2, kv_unified: false, ..Default::default() };
        assert!(promoted.validated().is_err());
    }

    #[test]
    fn test_from_json() {
        let config = ServerConfig::from_json(r#"{"n_slots": 2, "n_ctx": 256}"#).unwrap();
        assert_eq!(config.n_slots, 2);
        assert_eq!(config.n_ctx, 256);
        assert_eq!(config.n_batch, 512);
        assert!(ServerConfig::from_json("{").is_err());

        assert_eq!(config.result_retention, Duration::from_secs(300));
        let config = ServerConfig::from_json(r#"{"result_retention": 0.25}"#).unwrap();
        assert_eq!(config.result_retention, Duration::from_millis(250));

        let router: RouterConfig = serde_json::from_str(r#"{"idle_timeout": 1.5}"#).unwrap();
        assert_eq!(router.idle_timeout, Duration::from_millis(1500));
    }
}
