//! Engine configuration.

use std::path::PathBuf;
use std::str::FromStr;

/// Configuration for a Cairn engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Data directory for the on-device cache
    pub data_dir: PathBuf,

    /// Remote collection holding drops and their vote aggregates
    pub drops_collection: String,

    /// Remote collection holding per-user inventories
    pub inventory_collection: String,

    /// Attempts a vote transaction gets before failing with a conflict
    pub tx_max_attempts: u32,

    /// Capacity of change-event broadcast channels
    pub event_capacity: usize,

    /// Number of pushed inventory fingerprints remembered for echo suppression
    pub echo_window: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./cairn-data"),
            drops_collection: "drops".to_string(),
            inventory_collection: "inventories".to_string(),
            tx_max_attempts: 5,
            event_capacity: 256,
            echo_window: 8,
        }
    }
}

impl EngineConfig {
    /// Create config from environment variables with sensible defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let data_dir = std::env::var("CAIRN_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let drops_collection =
            std::env::var("CAIRN_DROPS_COLLECTION").unwrap_or(defaults.drops_collection);

        let inventory_collection =
            std::env::var("CAIRN_INVENTORY_COLLECTION").unwrap_or(defaults.inventory_collection);

        Self {
            data_dir,
            drops_collection,
            inventory_collection,
            tx_max_attempts: env_number("CAIRN_TX_MAX_ATTEMPTS", defaults.tx_max_attempts).max(1),
            event_capacity: env_number("CAIRN_EVENT_CAPACITY", defaults.event_capacity).max(1),
            echo_window: env_number("CAIRN_ECHO_WINDOW", defaults.echo_window),
        }
    }

    /// Builder: set the data directory.
    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    /// Builder: set the transaction retry bound.
    pub fn with_tx_max_attempts(mut self, attempts: u32) -> Self {
        self.tx_max_attempts = attempts.max(1);
        self
    }
}

fn env_number<T: FromStr + Copy + std::fmt::Display>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("Invalid {}={:?}, using {}", name, raw, default);
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.drops_collection, "drops");
        assert_eq!(config.inventory_collection, "inventories");
        assert_eq!(config.tx_max_attempts, 5);
    }

    #[test]
    fn invalid_number_falls_back() {
        std::env::set_var("CAIRN_TEST_BOGUS_NUMBER", "many");
        assert_eq!(env_number("CAIRN_TEST_BOGUS_NUMBER", 7u32), 7);
        std::env::set_var("CAIRN_TEST_BOGUS_NUMBER", " 12 ");
        assert_eq!(env_number("CAIRN_TEST_BOGUS_NUMBER", 7u32), 12);
        std::env::remove_var("CAIRN_TEST_BOGUS_NUMBER");
    }

    #[test]
    fn builder_clamps_attempts() {
        let config = EngineConfig::default().with_tx_max_attempts(0);
        assert_eq!(config.tx_max_attempts, 1);
    }
}
