use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Session engine settings.
///
/// Deserializable so applications can embed it in their own config files;
/// every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Capacity of the session's event channel.
    pub event_buffer: usize,
    /// Emit a `Tick` on this interval. `None` disables the ticker.
    pub tick_interval_ms: Option<u64>,
    /// Start the session offline, queueing actions until `go_online`.
    pub start_offline: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_buffer: 256,
            tick_interval_ms: None,
            start_offline: false,
        }
    }
}

impl EngineConfig {
    pub fn with_event_buffer(mut self, event_buffer: usize) -> Self {
        self.event_buffer = event_buffer.max(1);
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval_ms = Some(u64::try_from(interval.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn with_start_offline(mut self, start_offline: bool) -> Self {
        self.start_offline = start_offline;
        self
    }

    pub fn tick_interval(&self) -> Option<Duration> {
        self.tick_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

/// Dispatch hub settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Per-resource capacity of the realtime broadcast channel. Slow
    /// subscribers that fall further behind skip ahead to the newest push.
    pub broadcast_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 64,
        }
    }
}

impl HubConfig {
    pub fn with_broadcast_capacity(mut self, capacity: usize) -> Self {
        self.broadcast_capacity = capacity.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_config_fills_missing_fields_with_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{ "tick_interval_ms": 250 }"#).unwrap();
        assert_eq!(config.event_buffer, 256);
        assert_eq!(config.tick_interval(), Some(Duration::from_millis(250)));
        assert!(!config.start_offline);
    }

    #[test]
    fn zero_tick_interval_disables_ticker() {
        let config = EngineConfig {
            tick_interval_ms: Some(0),
            ..EngineConfig::default()
        };
        assert_eq!(config.tick_interval(), None);
    }

    #[test]
    fn huge_tick_interval_saturates() {
        let config = EngineConfig::default().with_tick_interval(Duration::MAX);
        assert_eq!(config.tick_interval_ms, Some(u64::MAX));
    }

    #[test]
    fn hub_config_default_capacity() {
        let config: HubConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, HubConfig::default().with_broadcast_capacity(64));
    }
}
