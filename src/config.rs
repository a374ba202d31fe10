//! Configuration loading and runtime constants for flowrelay.
//!
//! The document lives at `config.yml` in the working directory. Missing file
//! writes the default document and continues; a missing or non-array
//! `listeners` field is a fatal startup error.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Tolerance window for identity-map lookups and pending-flow correlation (ms).
pub const CORRELATION_TOLERANCE_MS: i64 = 30_000;

/// Age at which a stale identity-map login record is swept (ms).
pub const LOGIN_TTL_MS: i64 = 5 * 60 * 1_000;

/// Interval at which the orchestrator sweeps the identity map (seconds).
pub const IDENTITY_CLEANUP_INTERVAL_SECS: u64 = 60;

/// Per-pending-flow timeout before it fires with no identity (seconds).
pub const PENDING_FLOW_TIMEOUT_SECS: u64 = 30;

/// Aggregator flush window from first bucket insertion (ms).
pub const AGGREGATOR_FLUSH_WINDOW_MS: u64 = 3_000;

/// UDP pseudo-session idle timeout (ms). Compared against i64 timestamp
/// deltas, so kept signed rather than matching the `Duration`-facing
/// constants above.
pub const UDP_SESSION_IDLE_MS: i64 = 60_000;

/// Maximum PPv2 header layers decoded from a single chain.
pub const MAX_PPV2_CHAIN_DEPTH: usize = 32;

/// Default control-endpoint port when `endpoint` is omitted.
const DEFAULT_ENDPOINT: u16 = 6000;

const CONFIG_FILE_NAME: &str = "config.yml";

fn default_endpoint() -> u16 {
    DEFAULT_ENDPOINT
}

fn default_save_player_ip() -> bool {
    true
}

/// A single proxied target: host plus the protocol-specific backend ports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub host: String,
    #[serde(default)]
    pub tcp: Option<u16>,
    #[serde(default)]
    pub udp: Option<u16>,
}

/// One listener rule: where to accept traffic and where to send it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listener {
    pub bind: String,
    #[serde(default)]
    pub tcp: Option<u16>,
    #[serde(default)]
    pub udp: Option<u16>,
    #[serde(default)]
    pub haproxy: bool,
    #[serde(default)]
    pub webhook: Option<String>,
    pub target: Target,
}

impl Listener {
    /// Whether this rule has a usable TCP half (listen port + target port).
    pub fn tcp_active(&self) -> bool {
        self.tcp.is_some() && self.target.tcp.is_some()
    }

    /// Whether this rule has a usable UDP half (listen port + target port).
    pub fn udp_active(&self) -> bool {
        self.udp.is_some() && self.target.udp.is_some()
    }

    /// Webhook URL, if any, with blank/whitespace-only values treated as absent.
    pub fn webhook_url(&self) -> Option<&str> {
        self.webhook
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// Top-level configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_endpoint")]
    pub endpoint: u16,
    #[serde(rename = "useRestApi", default)]
    pub use_rest_api: bool,
    #[serde(rename = "savePlayerIP", default = "default_save_player_ip")]
    pub save_player_ip: bool,
    pub listeners: Vec<Listener>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            endpoint: default_endpoint(),
            use_rest_api: false,
            save_player_ip: default_save_player_ip(),
            listeners: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from `dir/config.yml`, writing a default document
    /// if the file is missing. A present-but-invalid document (unparsable
    /// YAML or a `listeners` field that isn't a sequence) is a fatal error.
    pub fn load(dir: &Path) -> Result<Self, AppError> {
        let path = dir.join(CONFIG_FILE_NAME);
        if !path.exists() {
            let default = Config::default();
            let yaml = serde_yaml::to_string(&default)?;
            std::fs::write(&path, yaml)?;
            tracing::info!(path = %path.display(), "wrote default config.yml");
            return Ok(default);
        }

        let raw = std::fs::read_to_string(&path)?;
        let value: serde_yaml::Value = serde_yaml::from_str(&raw)?;

        match value.get("listeners") {
            Some(serde_yaml::Value::Sequence(_)) => {}
            _ => {
                return Err(AppError::Config(
                    "config.yml: `listeners` must be a non-null array".into(),
                ))
            }
        }

        let config: Config = serde_yaml::from_value(value)?;
        Ok(config)
    }
}
