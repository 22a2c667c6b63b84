//! Local node settings.
//!
//! Unlike [`Config`](crate::config::Config), which every validator agrees on
//! through the host chain, these are per-node knobs an operator may tune.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{AnchorError, Result};

/// Default Bitcoin confirmations before a funding transaction is accepted.
pub const DEFAULT_FUNDING_CONFIRMATIONS: u32 = 6;

/// Default capacity of the service's outbound message channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Settings for one anchoring node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Confirmations required before `AddFunds` is applied.
    pub funding_confirmations: u32,

    /// Blocks between relay sync passes; `None` means half the anchoring
    /// interval.
    pub sync_interval_blocks: Option<u64>,

    /// Outbound message channel capacity.
    pub channel_capacity: usize,

    /// Relay retry tick in milliseconds.
    pub relay_tick_ms: u64,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            funding_confirmations: DEFAULT_FUNDING_CONFIRMATIONS,
            sync_interval_blocks: None,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            relay_tick_ms: 30_000,
        }
    }
}

impl NodeSettings {
    /// Set required funding confirmations.
    pub fn with_funding_confirmations(mut self, confirmations: u32) -> Self {
        self.funding_confirmations = confirmations;
        self
    }

    /// Set a fixed relay sync interval.
    pub fn with_sync_interval(mut self, blocks: u64) -> Self {
        self.sync_interval_blocks = Some(blocks);
        self
    }

    /// Set the outbound channel capacity.
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Set the relay retry tick.
    pub fn with_relay_tick(mut self, tick: Duration) -> Self {
        self.relay_tick_ms = tick.as_millis() as u64;
        self
    }

    /// Relay retry tick.
    pub fn relay_tick(&self) -> Duration {
        Duration::from_millis(self.relay_tick_ms)
    }

    /// Blocks between relay sync passes for `anchoring_interval`.
    pub fn sync_interval(&self, anchoring_interval: u64) -> u64 {
        self.sync_interval_blocks
            .unwrap_or(anchoring_interval / 2)
            .max(1)
    }

    /// Validate the settings.
    pub fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 {
            return Err(AnchorError::InvalidSettings(
                "channel capacity must be at least 1".into(),
            ));
        }
        if self.relay_tick_ms == 0 {
            return Err(AnchorError::InvalidSettings(
                "relay tick must be positive".into(),
            ));
        }
        if self.sync_interval_blocks == Some(0) {
            return Err(AnchorError::InvalidSettings(
                "sync interval must be at least one block".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_builder() {
        let settings = NodeSettings::default()
            .with_funding_confirmations(1)
            .with_sync_interval(3)
            .with_relay_tick(Duration::from_secs(2));

        assert_eq!(settings.funding_confirmations, 1);
        assert_eq!(settings.sync_interval(100), 3);
        assert_eq!(settings.relay_tick(), Duration::from_secs(2));
        settings.validate().unwrap();
    }

    #[test]
    fn test_default_sync_interval() {
        let settings = NodeSettings::default();
        assert_eq!(settings.sync_interval(10), 5);
        assert_eq!(settings.sync_interval(1), 1);
    }

    #[test]
    fn test_validate() {
        assert!(NodeSettings::default()
            .with_channel_capacity(0)
            .validate()
            .is_err());
        assert!(NodeSettings::default()
            .with_sync_interval(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_partial_json() {
        let settings: NodeSettings =
            serde_json::from_str(r#"{"funding_confirmations": 2}"#).unwrap();
        assert_eq!(settings.funding_confirmations, 2);
        assert_eq!(settings.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
    }
}
