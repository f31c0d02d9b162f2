//! livesync configuration file parsing (.livesync.toml)

use std::path::Path;
use std::time::Duration;

use crate::conflict::InitialPolicy;
use crate::exclude::ExclusionRule;
use crate::orchestrator::SyncOptions;

/// livesync project configuration
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct LivesyncConfig {
    /// Patterns anchored at the sync root
    pub exclude: Vec<String>,

    /// Patterns matched at any depth
    pub exclude_anywhere: Vec<String>,

    pub sync: SyncSection,

    pub retry: RetrySection,
}

/// `[sync]` table; unset keys keep the engine defaults
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct SyncSection {
    pub policy: Option<InitialPolicy>,
    pub debounce_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub echo_expiry_ms: Option<u64>,
    pub reconnect_timeout_ms: Option<u64>,
}

/// `[retry]` table
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: Option<u32>,
    pub initial_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
}

/// Config file name
pub const CONFIG_FILE: &str = ".livesync.toml";

impl LivesyncConfig {
    /// Load config from the local sync root.
    ///
    /// Returns default config if .livesync.toml doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be parsed.
    pub fn load(root: &Path) -> color_eyre::Result<Self> {
        let config_path = root.join(CONFIG_FILE);
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Exclusion rules in file order, anchored ones first
    #[must_use]
    pub fn exclusion_rules(&self) -> Vec<ExclusionRule> {
        self.exclude
            .iter()
            .map(|pattern| ExclusionRule::new(pattern.as_str()))
            .chain(
                self.exclude_anywhere
                    .iter()
                    .map(|pattern| ExclusionRule::anywhere(pattern.as_str())),
            )
            .collect()
    }

    /// Engine options with this file's values applied over the defaults
    #[must_use]
    pub fn to_options(&self) -> SyncOptions {
        let mut options = SyncOptions::default().exclude(self.exclusion_rules());
        let sync = &self.sync;
        if let Some(policy) = sync.policy {
            options.policy = policy;
        }
        if let Some(ms) = sync.debounce_ms {
            options.batcher.window = Duration::from_millis(ms);
        }
        if let Some(ms) = sync.poll_interval_ms {
            options.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = sync.echo_expiry_ms {
            options.echo_expiry = Duration::from_millis(ms);
        }
        if let Some(ms) = sync.reconnect_timeout_ms {
            options.reconnect_timeout = Duration::from_millis(ms);
        }

        let retry = &self.retry;
        if let Some(attempts) = retry.max_attempts {
            options.retry.max_attempts = attempts.max(1);
        }
        if let Some(ms) = retry.initial_backoff_ms {
            options.retry.initial_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = retry.max_backoff_ms {
            options.retry.max_backoff = Duration::from_millis(ms);
        }
        options
    }
}
