//! Configuration for stagehand.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (STAGEHAND_HOME, STAGEHAND_OFFLINE, STAGEHAND_TELEMETRY_URL,
//!    STAGEHAND_TELEMETRY_TOKEN, STAGEHAND_REMOTE_URL, STAGEHAND_REMOTE_TOKEN)
//! 2. Config file (.stagehand/config.yaml)
//! 3. Defaults (~/.stagehand, local collector and service URLs)
//!
//! Config file discovery:
//! - Searches current directory and parents for .stagehand/config.yaml
//! - `paths.home` is relative to the .stagehand/ directory
//!
//! There is no process-wide cache: callers load a [`ResolvedConfig`] once and
//! hand the derived settings to the components they construct.

pub mod paths;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::clients::{MutationConfig, ReporterConfig, RetryPolicy};

const DEFAULT_TELEMETRY_URL: &str = "http://127.0.0.1:8765";
const DEFAULT_REMOTE_URL: &str = "http://127.0.0.1:8080";
const DEFAULT_TELEMETRY_TIMEOUT_SECS: u64 = 5;
const DEFAULT_REMOTE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_HEALTH_TIMEOUT_SECS: u64 = 3;
const DEFAULT_MAX_OUTBOX_BYTES: u64 = 1_048_576; // 1MB

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub event_log: EventLogConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to .stagehand/)
    pub home: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventLogConfig {
    #[serde(default = "default_hash_chain")]
    pub hash_chain: bool,
}

fn default_hash_chain() -> bool {
    true
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            hash_chain: default_hash_chain(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetryConfig {
    pub base_url: Option<String>,
    pub token: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub max_outbox_bytes: Option<u64>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteConfig {
    pub base_url: Option<String>,
    pub token: Option<String>,
    pub offline: Option<bool>,
    pub timeout_seconds: Option<u64>,
    pub health_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Values taken from the environment
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub home: Option<PathBuf>,
    pub offline: Option<bool>,
    pub telemetry_url: Option<String>,
    pub telemetry_token: Option<String>,
    pub remote_url: Option<String>,
    pub remote_token: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        Self {
            home: var("STAGEHAND_HOME").map(PathBuf::from),
            offline: var("STAGEHAND_OFFLINE").and_then(|v| parse_flag("STAGEHAND_OFFLINE", &v)),
            telemetry_url: var("STAGEHAND_TELEMETRY_URL"),
            telemetry_token: var("STAGEHAND_TELEMETRY_TOKEN"),
            remote_url: var("STAGEHAND_REMOTE_URL"),
            remote_token: var("STAGEHAND_REMOTE_TOKEN"),
        }
    }
}

fn parse_flag(name: &str, value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        other => {
            warn!(variable = name, value = other, "Ignoring unrecognised boolean");
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct TelemetrySettings {
    pub base_url: String,
    pub token: Option<String>,
    pub timeout: Duration,
    pub max_outbox_bytes: u64,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone)]
pub struct RemoteSettings {
    pub base_url: String,
    pub token: Option<String>,
    pub offline: bool,
    pub timeout: Duration,
    pub health_timeout: Duration,
    pub retry: RetryPolicy,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// State directory holding runs, the outbox and offline bundles
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    /// Whether new events are hash-chained
    pub hash_chain: bool,
    pub telemetry: TelemetrySettings,
    pub remote: RemoteSettings,
}

impl ResolvedConfig {
    pub fn runs_dir(&self) -> PathBuf {
        paths::runs_dir(&self.home)
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        paths::run_dir(&self.home, run_id)
    }

    pub fn outbox_path(&self) -> PathBuf {
        paths::outbox_path(&self.home)
    }

    pub fn bundle_dir(&self) -> PathBuf {
        paths::bundle_dir(&self.home)
    }

    /// Settings for a [`crate::clients::TelemetryReporter`]
    pub fn reporter_config(&self) -> ReporterConfig {
        ReporterConfig {
            base_url: self.telemetry.base_url.clone(),
            token: self.telemetry.token.clone(),
            timeout: self.telemetry.timeout,
            retry: self.telemetry.retry.clone(),
            outbox_path: self.outbox_path(),
            max_outbox_bytes: self.telemetry.max_outbox_bytes,
        }
    }

    /// Settings for a [`crate::clients::MutationClient`]. Online use requires a token.
    pub fn mutation_config(&self) -> Result<MutationConfig> {
        if !self.remote.offline && self.remote.token.is_none() {
            bail!(
                "Remote service token not configured: set STAGEHAND_REMOTE_TOKEN, \
                 remote.token in the config file, or enable offline mode"
            );
        }

        Ok(MutationConfig {
            base_url: self.remote.base_url.clone(),
            token: self.remote.token.clone(),
            timeout: self.remote.timeout,
            health_timeout: self.remote.health_timeout,
            retry: self.remote.retry.clone(),
            offline: self.remote.offline,
            bundle_dir: self.bundle_dir(),
        })
    }
}

/// Find config file by searching `start` and its parents
pub fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(".stagehand").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Merge file, environment and defaults
pub fn resolve(
    file: Option<(&Path, ConfigFile)>,
    env: &EnvOverrides,
    default_home: PathBuf,
) -> ResolvedConfig {
    let (config_file, config) = match file {
        Some((path, config)) => (Some(path.to_path_buf()), Some(config)),
        None => (None, None),
    };

    let file_home = match (&config_file, &config) {
        (Some(path), Some(config)) => config.paths.home.as_ref().map(|home| {
            let stagehand_dir = path.parent().unwrap_or(Path::new("."));
            resolve_path(stagehand_dir, home)
        }),
        _ => None,
    };
    let home = env.home.clone().or(file_home).unwrap_or(default_home);

    let (event_log, telemetry, remote) = match config {
        Some(config) => (config.event_log, config.telemetry, config.remote),
        None => Default::default(),
    };

    let telemetry = TelemetrySettings {
        base_url: env
            .telemetry_url
            .clone()
            .or(telemetry.base_url)
            .unwrap_or_else(|| DEFAULT_TELEMETRY_URL.to_string()),
        token: env.telemetry_token.clone().or(telemetry.token),
        timeout: Duration::from_secs(
            telemetry
                .timeout_seconds
                .unwrap_or(DEFAULT_TELEMETRY_TIMEOUT_SECS),
        ),
        max_outbox_bytes: telemetry.max_outbox_bytes.unwrap_or(DEFAULT_MAX_OUTBOX_BYTES),
        retry: telemetry.retry,
    };

    let remote = RemoteSettings {
        base_url: env
            .remote_url
            .clone()
            .or(remote.base_url)
            .unwrap_or_else(|| DEFAULT_REMOTE_URL.to_string()),
        token: env.remote_token.clone().or(remote.token),
        offline: env.offline.or(remote.offline).unwrap_or(false),
        timeout: Duration::from_secs(remote.timeout_seconds.unwrap_or(DEFAULT_REMOTE_TIMEOUT_SECS)),
        health_timeout: Duration::from_secs(
            remote
                .health_timeout_seconds
                .unwrap_or(DEFAULT_HEALTH_TIMEOUT_SECS),
        ),
        retry: remote.retry,
    };

    ResolvedConfig {
        home,
        config_file,
        hash_chain: event_log.hash_chain,
        telemetry,
        remote,
    }
}

/// Load configuration from all sources
pub fn load_config() -> Result<ResolvedConfig> {
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    load_config_from(&cwd, &EnvOverrides::from_env())
}

/// Load configuration, discovering the config file from `start`
pub fn load_config_from(start: &Path, env: &EnvOverrides) -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".stagehand");

    let config = match find_config_file(start) {
        Some(path) => {
            debug!(path = %path.display(), "Using config file");
            let parsed = load_config_file(&path)?;
            resolve(Some((path.as_path(), parsed)), env, default_home)
        }
        None => resolve(None, env, default_home),
    };

    Ok(config)
}
