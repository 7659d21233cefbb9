//! Process-wide configuration.
//!
//! Loaded once at startup from a TOML file (path from `--config` or
//! `JANITOR_CONFIG`); environment variables override the file for the
//! handful of deployment-specific locations. The loaded snapshot is
//! immutable; reloads produce a new snapshot swapped behind a shared
//! pointer.

use crate::publish::Mode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Complete configuration shared by all control-plane services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Instance name, used in event payloads and proposal footers.
    #[serde(default = "default_instance_name")]
    pub instance_name: String,
    /// Externally-visible base URL of this instance.
    pub external_url: Option<url::Url>,
    /// Committer identity used when pushing.
    pub committer: Option<String>,
    /// Database configuration.
    pub database: DatabaseConfig,
    /// Redis configuration; optional, degrades to polling.
    pub redis: Option<RedisConfig>,
    /// Log storage location.
    #[serde(default)]
    pub logs: StorageConfig,
    /// Artifact storage location.
    #[serde(default)]
    pub artifacts: StorageConfig,
    /// VCS store holding the result branches workers pushed.
    #[serde(default)]
    pub vcs: VcsStoreConfig,
    /// Campaign definitions.
    #[serde(default, rename = "campaign")]
    pub campaigns: Vec<Campaign>,
    /// Forge definitions.
    #[serde(default, rename = "forge")]
    pub forges: Vec<ForgeConfig>,
    /// Per-bucket open-proposal limits.
    #[serde(default)]
    pub rate_limits: RateLimitConfig,
    /// Runner-specific settings.
    #[serde(default)]
    pub runner: RunnerSection,
    /// Publisher-specific settings.
    #[serde(default)]
    pub publisher: PublisherSection,
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL.
    pub url: String,
    /// Maximum number of connections in the pool.
    #[serde(default = "default_db_max_connections")]
    pub max_connections: u32,
}

/// Redis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL.
    #[serde(default = "default_redis_url")]
    pub url: String,
}

/// Location of a blob store (logs or artifacts).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    /// Storage location; currently a filesystem path or file: URL.
    pub location: Option<String>,
}

/// Location of the VCS store that holds worker result branches.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VcsStoreConfig {
    /// Base URL; a codebase's result repository lives at `<location>/<name>`.
    pub location: Option<url::Url>,
}

/// A named improvement program.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    /// Campaign name; unique.
    pub name: String,
    /// Command template run by the worker.
    pub command: String,
    /// Scheme for naming the derived branch, e.g. "lintian-fixes".
    pub branch_name: Option<String>,
    /// Default publish mode for branches produced by this campaign.
    #[serde(default)]
    pub default_mode: Mode,
    /// Per-role publish mode overrides.
    #[serde(default)]
    pub publish: Vec<BranchPolicy>,
    /// Rate-limit bucket; falls back to the codebase bucket.
    pub rate_limit_bucket: Option<String>,
    /// Wall-clock timeout for runs, in minutes.
    pub run_timeout: Option<u64>,
    /// Capabilities a worker must declare to be handed runs of this
    /// campaign.
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    /// Merge proposal settings.
    #[serde(default)]
    pub merge_proposal: MergeProposalConfig,
    /// Opaque build configuration handed to workers as-is.
    #[serde(default)]
    pub build: serde_json::Value,
}

impl Campaign {
    /// Publish mode for a given branch role, falling back to the campaign
    /// default.
    pub fn mode_for_role(&self, role: &str) -> Mode {
        self.publish
            .iter()
            .find(|p| p.role == role)
            .map_or(self.default_mode, |p| p.mode)
    }
}

/// Per-role publish policy inside a campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchPolicy {
    /// Branch role this policy applies to.
    pub role: String,
    /// Publish mode for the role.
    pub mode: Mode,
}

/// Merge-proposal settings of a campaign.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MergeProposalConfig {
    /// Minijinja template for the proposal title.
    pub title_template: Option<String>,
    /// Minijinja template for the proposal body.
    pub body_template: Option<String>,
    /// Minimum run value required before opening a proposal.
    pub value_threshold: Option<i32>,
    /// Labels to apply to created proposals.
    #[serde(default)]
    pub labels: Vec<String>,
}

/// A code-hosting forge reachable through the capability interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgeConfig {
    /// Forge kind; selects the client implementation.
    pub kind: ForgeKind,
    /// Hostname this entry covers, e.g. "gitlab.com".
    pub host: String,
    /// Base URL of the API, when not the default for the kind.
    pub api_base: Option<url::Url>,
    /// Environment variable holding the API token.
    pub token_env: Option<String>,
}

/// Closed set of supported forge kinds; selected at config load.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ForgeKind {
    Github,
    Gitlab,
}

/// Per-bucket limits on concurrently-open merge proposals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Limit applied to buckets without an explicit entry.
    #[serde(default = "default_max_open_mps")]
    pub default_max_open: usize,
    /// Explicit per-bucket limits.
    #[serde(default)]
    pub per_bucket: HashMap<String, usize>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_max_open: default_max_open_mps(),
            per_bucket: HashMap::new(),
        }
    }
}

impl RateLimitConfig {
    /// Open-proposal limit for a bucket.
    pub fn max_open(&self, bucket: &str) -> usize {
        self.per_bucket
            .get(bucket)
            .copied()
            .unwrap_or(self.default_max_open)
    }
}

/// Runner service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerSection {
    /// Listen address.
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Port for the worker-facing API.
    #[serde(default = "default_runner_port")]
    pub port: u16,
    /// Seconds a new assignment may sit in `Assigning` before it is rolled
    /// back to the queue.
    #[serde(default = "default_handshake_window")]
    pub handshake_window: u64,
    /// Seconds between liveness scans.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
    /// Seconds of heartbeat silence before a run is timed out.
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout: u64,
    /// Default run wall-clock timeout in minutes, when the campaign does
    /// not set one.
    #[serde(default = "default_run_timeout")]
    pub run_timeout: u64,
    /// Seconds a codebase is held back after a run finishes.
    #[serde(default = "default_cooldown")]
    pub codebase_cooldown: u64,
    /// Seconds between full candidate recomputes by the scheduler.
    #[serde(default = "default_schedule_interval")]
    pub schedule_interval: u64,
    /// Hosts to avoid handing out assignments for.
    #[serde(default)]
    pub avoid_hosts: Vec<String>,
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            port: default_runner_port(),
            handshake_window: default_handshake_window(),
            heartbeat_interval: default_heartbeat_interval(),
            heartbeat_timeout: default_heartbeat_timeout(),
            run_timeout: default_run_timeout(),
            codebase_cooldown: default_cooldown(),
            schedule_interval: default_schedule_interval(),
            avoid_hosts: Vec::new(),
        }
    }
}

/// Publisher service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherSection {
    /// Listen address.
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Port for the publish API.
    #[serde(default = "default_publish_port")]
    pub port: u16,
    /// Seconds between publish cycles.
    #[serde(default = "default_publish_interval")]
    pub interval: u64,
    /// Seconds before an open proposal is rescanned.
    #[serde(default = "default_rescan_interval")]
    pub rescan_interval: u64,
    /// Minimum seconds between publishes to the same target branch.
    #[serde(default = "default_min_publish_interval")]
    pub min_publish_interval: u64,
    /// Path to the template environment for proposal rendering.
    pub template_env_path: Option<String>,
    /// Optional limit on pushes per cycle.
    pub push_limit: Option<usize>,
}

impl Default for PublisherSection {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            port: default_publish_port(),
            interval: default_publish_interval(),
            rescan_interval: default_rescan_interval(),
            min_publish_interval: default_min_publish_interval(),
            template_env_path: None,
            push_limit: None,
        }
    }
}

fn default_instance_name() -> String {
    "janitor".to_string()
}
fn default_db_max_connections() -> u32 {
    5
}
fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}
fn default_max_open_mps() -> usize {
    10
}
fn default_listen_address() -> String {
    "localhost".to_string()
}
fn default_runner_port() -> u16 {
    9911
}
fn default_publish_port() -> u16 {
    9912
}
fn default_handshake_window() -> u64 {
    60
}
fn default_heartbeat_interval() -> u64 {
    60
}
fn default_heartbeat_timeout() -> u64 {
    300
}
fn default_run_timeout() -> u64 {
    120
}
fn default_cooldown() -> u64 {
    300
}
fn default_schedule_interval() -> u64 {
    1200
}
fn default_publish_interval() -> u64 {
    7200
}
fn default_rescan_interval() -> u64 {
    3600
}
fn default_min_publish_interval() -> u64 {
    86400
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error reading config: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Shared pointer to the current configuration snapshot.
///
/// Snapshots are immutable; a reload parses a whole new [`Config`] and
/// swaps it in atomically. Readers keep whatever snapshot they took until
/// their operation completes.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: std::sync::Arc<std::sync::RwLock<std::sync::Arc<Config>>>,
    path: Option<std::path::PathBuf>,
}

impl ConfigHandle {
    pub fn new(config: Config, path: Option<std::path::PathBuf>) -> Self {
        Self {
            inner: std::sync::Arc::new(std::sync::RwLock::new(std::sync::Arc::new(config))),
            path,
        }
    }

    /// Take the current snapshot.
    pub fn get(&self) -> std::sync::Arc<Config> {
        self.inner.read().expect("lock poisoned").clone()
    }

    /// Swap in a new snapshot.
    pub fn swap(&self, config: Config) {
        *self.inner.write().expect("lock poisoned") = std::sync::Arc::new(config);
    }

    /// Re-read the config file this handle was loaded from and swap the
    /// result in. A parse failure leaves the old snapshot in place.
    pub fn reload(&self) -> Result<(), Error> {
        let path = self
            .path
            .as_deref()
            .ok_or_else(|| Error::Invalid("no config path to reload from".to_string()))?;
        let config = Config::read_file(path)?;
        self.swap(config);
        log::info!("Reloaded configuration from {}", path.display());
        Ok(())
    }
}

impl Config {
    /// Read configuration from a TOML file and apply environment overrides.
    pub fn read_file(path: &Path) -> Result<Config, Error> {
        let text = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&text)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `DATABASE_URL`, `REDIS_URL`, `ARTIFACT_URL` and `LOGFILE_URL`
    /// from the environment, overriding the file.
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database.url = url;
        }
        if let Ok(url) = std::env::var("REDIS_URL") {
            match self.redis.as_mut() {
                Some(redis) => redis.url = url,
                None => self.redis = Some(RedisConfig { url }),
            }
        }
        if let Ok(url) = std::env::var("ARTIFACT_URL") {
            self.artifacts.location = Some(url);
        }
        if let Ok(url) = std::env::var("LOGFILE_URL") {
            self.logs.location = Some(url);
        }
    }

    fn validate(&self) -> Result<(), Error> {
        let mut seen = std::collections::HashSet::new();
        for campaign in &self.campaigns {
            if !seen.insert(campaign.name.as_str()) {
                return Err(Error::Invalid(format!(
                    "duplicate campaign: {}",
                    campaign.name
                )));
            }
            if campaign.command.is_empty() {
                return Err(Error::Invalid(format!(
                    "campaign {} has an empty command",
                    campaign.name
                )));
            }
        }
        Ok(())
    }

    /// Look up a campaign by name.
    pub fn get_campaign(&self, name: &str) -> Option<&Campaign> {
        self.campaigns.iter().find(|c| c.name == name)
    }

    /// Look up the forge entry covering a host.
    pub fn get_forge(&self, host: &str) -> Option<&ForgeConfig> {
        self.forges.iter().find(|f| f.host == host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
instance_name = "janitor-test"

[database]
url = "postgresql://localhost/janitor"

[redis]
url = "redis://localhost:6379"

[[campaign]]
name = "lintian-fixes"
command = "lintian-brush"
branch_name = "lintian-fixes"
default_mode = "propose"
required_capabilities = ["debian"]

[[campaign.publish]]
role = "main"
mode = "attempt-push"

[[forge]]
kind = "gitlab"
host = "salsa.debian.org"
token_env = "SALSA_TOKEN"

[rate_limits]
default_max_open = 5

[rate_limits.per_bucket]
"maint:alice" = 2
"#;

    #[test]
    fn test_parse_example() {
        let config: Config = toml::from_str(EXAMPLE).unwrap();
        assert_eq!(config.instance_name, "janitor-test");
        let campaign = config.get_campaign("lintian-fixes").unwrap();
        assert_eq!(campaign.default_mode, Mode::Propose);
        assert_eq!(campaign.mode_for_role("main"), Mode::AttemptPush);
        assert_eq!(campaign.mode_for_role("pristine-tar"), Mode::Propose);
        assert_eq!(config.rate_limits.max_open("maint:alice"), 2);
        assert_eq!(config.rate_limits.max_open("maint:bob"), 5);
        assert!(config.get_forge("salsa.debian.org").is_some());
        assert!(config.get_forge("github.com").is_none());
    }

    #[test]
    fn test_config_handle_swap() {
        let config: Config = toml::from_str(EXAMPLE).unwrap();
        let handle = ConfigHandle::new(config, None);
        assert_eq!(handle.get().instance_name, "janitor-test");

        // Old snapshots stay valid across a swap.
        let before = handle.get();
        let mut updated: Config = toml::from_str(EXAMPLE).unwrap();
        updated.instance_name = "janitor-updated".to_string();
        handle.swap(updated);
        assert_eq!(before.instance_name, "janitor-test");
        assert_eq!(handle.get().instance_name, "janitor-updated");

        // Reload without a backing file fails without touching the snapshot.
        assert!(handle.reload().is_err());
        assert_eq!(handle.get().instance_name, "janitor-updated");
    }

    #[test]
    fn test_duplicate_campaign_rejected() {
        let mut config: Config = toml::from_str(EXAMPLE).unwrap();
        let dup = config.campaigns[0].clone();
        config.campaigns.push(dup);
        assert!(config.validate().is_err());
    }
}
