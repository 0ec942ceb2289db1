use std::time::Duration;

use anyhow::Result;
use figment::{
    providers::{Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Cluster driver options. Field names are the externally visible option
/// keys; durations are expressed in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub overcommit: f64,
    pub createretry: i64,
    pub upgradedelay: u64,
    pub migratedelay: u64,
    pub recoveryinterval: u64,
    pub location: String,
    pub cacheroot: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            overcommit: 0.05,
            createretry: 0,
            upgradedelay: 10,
            migratedelay: 30,
            recoveryinterval: 120,
            location: String::new(),
            cacheroot: String::new(),
        }
    }
}

impl ClusterConfig {
    pub fn from_path(path: &str) -> Result<ClusterConfig> {
        let config_str = std::fs::read_to_string(path)?;
        let config: ClusterConfig = Figment::from(Serialized::defaults(ClusterConfig::default()))
            .merge(Yaml::string(&config_str))
            .extract()?;
        Ok(config.normalized())
    }

    /// Out-of-range options fall back to their defaults; the caller keeps
    /// running with a sane configuration.
    pub fn normalized(mut self) -> Self {
        let defaults = ClusterConfig::default();
        if self.overcommit <= -1.0 {
            warn!(
                overcommit = self.overcommit,
                "overcommit must be larger than -1, keeping default"
            );
            self.overcommit = defaults.overcommit;
        } else if self.overcommit < 0.0 {
            warn!(
                overcommit = self.overcommit,
                "-1 < overcommit < 0 reserves headroom below the reported capacity"
            );
        }
        if self.createretry < 0 {
            warn!(
                createretry = self.createretry,
                "createretry must not be negative, keeping default"
            );
            self.createretry = defaults.createretry;
        }
        self.location = self.location.trim().to_string();
        self
    }

    pub fn create_retry(&self) -> u32 {
        self.createretry.max(0) as u32
    }

    pub fn upgrade_delay(&self) -> Duration {
        Duration::from_secs(self.upgradedelay)
    }

    pub fn migrate_delay(&self) -> Duration {
        Duration::from_secs(self.migratedelay)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recoveryinterval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClusterConfig::default();
        assert_eq!(config.overcommit, 0.05);
        assert_eq!(config.create_retry(), 0);
        assert_eq!(config.upgrade_delay(), Duration::from_secs(10));
        assert_eq!(config.migrate_delay(), Duration::from_secs(30));
        assert_eq!(config.recovery_interval(), Duration::from_secs(120));
        assert!(config.cacheroot.is_empty());
    }

    #[test]
    fn test_normalized_keeps_defaults_for_invalid_values() {
        let config = ClusterConfig {
            overcommit: -1.5,
            createretry: -3,
            location: "  dc-east  ".to_string(),
            ..Default::default()
        }
        .normalized();
        assert_eq!(config.overcommit, 0.05);
        assert_eq!(config.create_retry(), 0);
        assert_eq!(config.location, "dc-east");
    }

    #[test]
    fn test_normalized_allows_undersubscription() {
        let config = ClusterConfig {
            overcommit: -0.25,
            ..Default::default()
        }
        .normalized();
        assert_eq!(config.overcommit, -0.25);
    }
}
