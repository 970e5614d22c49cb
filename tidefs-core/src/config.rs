//! Centralized configuration for tidefs.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::path::PathBuf;
use std::time::Duration;

/// Central configuration for all tidefs components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct TidefsConfig {
    pub lifecycle: LifecycleConfig,
    pub accounting: AccountingConfig,
    pub namespace: NamespaceConfig,
    pub swarm: SwarmConfig,
}

/// Lifecycle state machine policy.
///
/// Thresholds governing when an item's engine moves between leeching,
/// seeding, and freed. Policy constants, not invariants.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Continuous disinterest required before a leeching item becomes a seed
    pub interest_grace: Duration,
    /// Wall-clock interval between seed-hour credits while seeding
    pub seed_hour_interval: Duration,
    /// Accumulated seed hours after which an item is eligible for freeing
    pub seed_retention_hours: u32,
    /// Trailing no-read window required before a retained seed is freed
    pub idle_free_window: Duration,
    /// Base cadence of the lifecycle supervisor tick
    pub tick_interval: Duration,
    /// Upper bound of the random jitter added to each tick
    pub tick_jitter: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            interest_grace: Duration::from_secs(5 * 60),
            seed_hour_interval: Duration::from_secs(60 * 60),
            seed_retention_hours: 100,
            idle_free_window: Duration::from_secs(24 * 60 * 60),
            tick_interval: Duration::from_secs(30),
            tick_jitter: Duration::from_secs(5),
        }
    }
}

/// Usage accounting cadence.
#[derive(Debug, Clone)]
pub struct AccountingConfig {
    /// Base interval between transfer-counter samples
    pub sample_interval: Duration,
    /// Upper bound of the random jitter added to each sample
    pub sample_jitter: Duration,
}

impl Default for AccountingConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(120),
            sample_jitter: Duration::from_secs(5),
        }
    }
}

/// Namespace refresh policy.
#[derive(Debug, Clone)]
pub struct NamespaceConfig {
    /// Interval between catalog re-reads and index rebuild checks
    pub refresh_interval: Duration,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(5),
        }
    }
}

/// Swarm engine collaborator settings.
///
/// Passed through to whatever `EngineLauncher` implementation backs the
/// mount.
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    /// TCP port engines listen on when an item requires active participation
    pub listen_port: u16,
    /// Scratch directory handed to engines for piece caching
    pub scratch_dir: PathBuf,
    /// Maximum peer connections per engine
    pub max_connections: usize,
    /// Maximum concurrent upload slots per engine
    pub max_uploads: usize,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            listen_port: 65510,
            scratch_dir: std::env::temp_dir(),
            max_connections: 20,
            max_uploads: 8,
        }
    }
}

impl TidefsConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(port) = std::env::var("TIDEFS_LISTEN_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                config.swarm.listen_port = port;
            }
        }

        if let Ok(dir) = std::env::var("TIDEFS_SCRATCH_DIR") {
            config.swarm.scratch_dir = PathBuf::from(dir);
        }

        if let Ok(hours) = std::env::var("TIDEFS_SEED_RETENTION_HOURS") {
            if let Ok(hours) = hours.parse::<u32>() {
                config.lifecycle.seed_retention_hours = hours;
            }
        }

        if let Ok(secs) = std::env::var("TIDEFS_IDLE_FREE_WINDOW_SECS") {
            if let Ok(secs) = secs.parse::<u64>() {
                config.lifecycle.idle_free_window = Duration::from_secs(secs);
            }
        }

        config
    }

    /// Creates a configuration optimized for testing.
    ///
    /// Shrinks every wall-clock threshold to milliseconds so lifecycle
    /// scenarios complete within a test run.
    pub fn for_testing() -> Self {
        Self {
            lifecycle: LifecycleConfig {
                interest_grace: Duration::from_millis(50),
                seed_hour_interval: Duration::from_millis(40),
                seed_retention_hours: 2,
                idle_free_window: Duration::from_millis(100),
                tick_interval: Duration::from_millis(20),
                tick_jitter: Duration::from_millis(2),
            },
            accounting: AccountingConfig {
                sample_interval: Duration::from_millis(30),
                sample_jitter: Duration::from_millis(2),
            },
            namespace: NamespaceConfig {
                refresh_interval: Duration::from_millis(20),
            },
            swarm: SwarmConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = TidefsConfig::default();

        assert_eq!(config.lifecycle.interest_grace, Duration::from_secs(300));
        assert_eq!(config.lifecycle.seed_retention_hours, 100);
        assert_eq!(
            config.lifecycle.idle_free_window,
            Duration::from_secs(86400)
        );
        assert_eq!(config.accounting.sample_interval, Duration::from_secs(120));
        assert_eq!(config.namespace.refresh_interval, Duration::from_secs(5));
        assert_eq!(config.swarm.listen_port, 65510);
        assert_eq!(config.swarm.max_connections, 20);
    }

    #[test]
    fn test_testing_preset_is_fast() {
        let config = TidefsConfig::for_testing();

        assert!(config.lifecycle.interest_grace < Duration::from_secs(1));
        assert!(config.lifecycle.tick_interval < Duration::from_secs(1));
        assert!(config.accounting.sample_interval < Duration::from_secs(1));
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("TIDEFS_LISTEN_PORT", "6900");
            std::env::set_var("TIDEFS_SEED_RETENTION_HOURS", "10");
        }

        let config = TidefsConfig::from_env();

        assert_eq!(config.swarm.listen_port, 6900);
        assert_eq!(config.lifecycle.seed_retention_hours, 10);

        // Cleanup
        unsafe {
            std::env::remove_var("TIDEFS_LISTEN_PORT");
            std::env::remove_var("TIDEFS_SEED_RETENTION_HOURS");
        }
    }
}
