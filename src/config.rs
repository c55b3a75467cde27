use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use validator::Validate;

use crate::core::backend::BackendOptions;
use crate::core::retry::RetryConfig;
use crate::core::scenarios::backfill_delete_condition;
use crate::models::{DoubleRangeFilter, MatchProfile, Pool, RangeExclusion, StringEqualsFilter, TagPresentFilter};
use crate::statestore::LockOptions;

/// Application configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub backend: BackendSettings,
    #[serde(default)]
    pub locks: LockSettings,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub scenario: ScenarioSettings,
    #[serde(default)]
    pub profiles: Vec<ProfileSettings>,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub workers: Option<usize>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            workers: None,
        }
    }
}

fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreSettings {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// SSCAN batch size for pool queries
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            page_size: default_page_size(),
        }
    }
}

fn default_redis_url() -> String { "redis://127.0.0.1:6379".to_string() }
fn default_key_prefix() -> String { "matchmaker".to_string() }
fn default_page_size() -> usize { 500 }

#[derive(Debug, Clone, Deserialize)]
pub struct BackendSettings {
    /// Run cycles periodically in the server process
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_max_concurrent_cycles")]
    pub max_concurrent_cycles: usize,
    #[serde(default = "default_true")]
    pub assign_tickets: bool,
    #[serde(default = "default_true")]
    pub acknowledge_backfills: bool,
    #[serde(default)]
    pub delete_backfills: bool,
    #[serde(default)]
    pub delete_tickets: bool,
    #[serde(default = "default_cycle_deadline_ms")]
    pub cycle_deadline_ms: u64,
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default = "default_proposal_buffer")]
    pub proposal_buffer: usize,
    #[serde(default = "default_assignment_connection")]
    pub assignment_connection: String,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_interval_ms(),
            max_concurrent_cycles: default_max_concurrent_cycles(),
            assign_tickets: true,
            acknowledge_backfills: true,
            delete_backfills: false,
            delete_tickets: false,
            cycle_deadline_ms: default_cycle_deadline_ms(),
            parallelism: default_parallelism(),
            proposal_buffer: default_proposal_buffer(),
            assignment_connection: default_assignment_connection(),
        }
    }
}

fn default_true() -> bool { true }
fn default_interval_ms() -> u64 { 1000 }
fn default_max_concurrent_cycles() -> usize { 2 }
fn default_cycle_deadline_ms() -> u64 { 10_000 }
fn default_parallelism() -> usize { 8 }
fn default_proposal_buffer() -> usize { 64 }
fn default_assignment_connection() -> String { "server://{match_id}".to_string() }

#[derive(Debug, Clone, Deserialize)]
pub struct LockSettings {
    #[serde(default = "default_lease_ms")]
    pub lease_ms: u64,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            lease_ms: default_lease_ms(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_lease_ms() -> u64 { 10_000 }
fn default_acquire_timeout_ms() -> u64 { 5_000 }
fn default_poll_interval_ms() -> u64 { 20 }

#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioSettings {
    #[serde(default = "default_tickets_per_match")]
    pub tickets_per_match: usize,
}

impl Default for ScenarioSettings {
    fn default() -> Self {
        Self {
            tickets_per_match: default_tickets_per_match(),
        }
    }
}

fn default_tickets_per_match() -> usize { 2 }

/// Match profile as written in config files
///
/// Keys stay snake_case here; the camelCase JSON form is only used over HTTP.
#[derive(Debug, Clone, Deserialize)]
pub struct ProfileSettings {
    pub name: String,
    #[serde(default)]
    pub pools: Vec<PoolSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolSettings {
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub string_equals: Vec<StringEqualsSettings>,
    #[serde(default)]
    pub double_ranges: Vec<DoubleRangeSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StringEqualsSettings {
    pub arg: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DoubleRangeSettings {
    pub arg: String,
    pub min: Option<f64>,
    pub max: Option<f64>,
    #[serde(default)]
    pub exclude: RangeExclusion,
}

impl From<&PoolSettings> for Pool {
    fn from(pool: &PoolSettings) -> Self {
        Pool {
            name: pool.name.clone(),
            double_range_filters: pool
                .double_ranges
                .iter()
                .map(|r| DoubleRangeFilter {
                    double_arg: r.arg.clone(),
                    min: r.min.unwrap_or(f64::NEG_INFINITY),
                    max: r.max.unwrap_or(f64::INFINITY),
                    exclude: r.exclude,
                })
                .collect(),
            string_equals_filters: pool
                .string_equals
                .iter()
                .map(|s| StringEqualsFilter {
                    string_arg: s.arg.clone(),
                    value: s.value.clone(),
                })
                .collect(),
            tag_present_filters: pool
                .tags
                .iter()
                .map(|tag| TagPresentFilter { tag: tag.clone() })
                .collect(),
            ..Default::default()
        }
    }
}

impl From<&ProfileSettings> for MatchProfile {
    fn from(profile: &ProfileSettings) -> Self {
        MatchProfile {
            name: profile.name.clone(),
            pools: profile.pools.iter().map(Pool::from).collect(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl LoggingSettings {
    /// Human readable multi-line output instead of the compact default
    pub fn is_pretty(&self) -> bool {
        self.format.eq_ignore_ascii_case("pretty")
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "json".to_string() }

impl Settings {
    /// Load configuration from file and environment variables
    ///
    /// Configuration is loaded in the following order (later overrides earlier):
    /// 1. Default values in the struct
    /// 2. Configuration file (config/default.toml)
    /// 3. Environment variables (prefixed with MATCHMAKER__)
    pub fn load() -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            // Local overrides for development
            .add_source(File::with_name("config/local").required(false))
            // e.g., MATCHMAKER__STORE__BACKEND=redis -> store.backend
            .add_source(
                Environment::with_prefix("MATCHMAKER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings = apply_env_overrides(settings, |name| std::env::var(name).ok())?;

        settings.try_deserialize()
    }

    /// Configured profiles, validated
    pub fn match_profiles(&self) -> Result<Vec<MatchProfile>, ConfigError> {
        let mut names = HashSet::new();
        let mut profiles = Vec::with_capacity(self.profiles.len());

        for settings in &self.profiles {
            let profile = MatchProfile::from(settings);
            profile
                .validate()
                .map_err(|e| ConfigError::Message(format!("profile '{}': {}", profile.name, e)))?;
            if !names.insert(profile.name.clone()) {
                return Err(ConfigError::Message(format!(
                    "profile '{}' is defined more than once",
                    profile.name
                )));
            }
            profiles.push(profile);
        }

        Ok(profiles)
    }

    pub fn lock_options(&self) -> LockOptions {
        LockOptions {
            lease: Duration::from_millis(self.locks.lease_ms),
            acquire_timeout: Duration::from_millis(self.locks.acquire_timeout_ms),
            poll_interval: Duration::from_millis(self.locks.poll_interval_ms.max(1)),
        }
    }

    pub fn backend_options(&self) -> BackendOptions {
        let backend = &self.backend;
        BackendOptions {
            assign_tickets: backend.assign_tickets,
            acknowledge_backfills: backend.acknowledge_backfills,
            delete_backfills: backend.delete_backfills,
            delete_tickets: backend.delete_tickets,
            cycle_deadline: Duration::from_millis(backend.cycle_deadline_ms),
            parallelism: backend.parallelism.max(1),
            proposal_buffer: backend.proposal_buffer.max(1),
            assignment_connection: backend.assignment_connection.clone(),
            lock: self.lock_options(),
            retry: self.retry,
            delete_predicate: Arc::new(backfill_delete_condition),
        }
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.backend.interval_ms.max(1))
    }
}

/// Conventional unprefixed variables that win over the files
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("REDIS_URL", "store.redis_url"),
    ("LOG_LEVEL", "logging.level"),
    ("LOG_FORMAT", "logging.format"),
];

fn apply_env_overrides<F>(settings: Config, lookup: F) -> Result<Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut builder = Config::builder().add_source(settings);
    for (var, key) in ENV_OVERRIDES {
        if let Some(value) = lookup(var) {
            builder = builder.set_override(*key, value)?;
        }
    }
    builder.build()
}
