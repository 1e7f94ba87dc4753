use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Default cap on an encoded command, matching the transport's default
/// maximum payload length.
pub const DEFAULT_MAX_COMMAND_LEN: usize = 64 * 1024;

/// Tunables for the session engine. Every field has a documented default;
/// deployments normally run with `CrosslinkConfig::default()`.
#[derive(Deserialize, Debug, Clone)]
pub struct CrosslinkConfig {
    /// How long a session may sit short of `Connected` before it is forced
    /// into a terminal timeout. Default 30s.
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// Bounded wait for the out-of-band connect decision on the sink.
    /// Default 5s.
    #[serde(default = "default_connect_decision_timeout_ms")]
    pub connect_decision_timeout_ms: u64,

    /// Hard cap on peer identity resolution attempts. Not a backoff
    /// schedule. Default 5.
    #[serde(default = "default_resolve_retry_max")]
    pub resolve_retry_max: u32,

    /// Grace period before the source ability is released after a
    /// clean-mission continuation succeeds. Default 5s.
    #[serde(default = "default_background_release_grace_ms")]
    pub background_release_grace_ms: u64,

    /// Continuation-type strings are considered equal if they match after
    /// adding or stripping this suffix on either side.
    #[serde(default = "default_quick_start_suffix")]
    pub quick_start_suffix: String,

    /// Cap on an encoded command frame. Default 64 KiB.
    #[serde(default = "default_max_command_len")]
    pub max_command_len: usize,
}

impl CrosslinkConfig {
    /// Load from a TOML file, falling back to defaults when the file does
    /// not exist.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn connect_decision_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_decision_timeout_ms)
    }

    pub fn background_release_grace(&self) -> Duration {
        Duration::from_millis(self.background_release_grace_ms)
    }
}

impl Default for CrosslinkConfig {
    fn default() -> Self {
        Self {
            session_timeout_ms: default_session_timeout_ms(),
            connect_decision_timeout_ms: default_connect_decision_timeout_ms(),
            resolve_retry_max: default_resolve_retry_max(),
            background_release_grace_ms: default_background_release_grace_ms(),
            quick_start_suffix: default_quick_start_suffix(),
            max_command_len: default_max_command_len(),
        }
    }
}

fn default_session_timeout_ms() -> u64 {
    30_000
}

fn default_connect_decision_timeout_ms() -> u64 {
    5_000
}

fn default_resolve_retry_max() -> u32 {
    5
}

fn default_background_release_grace_ms() -> u64 {
    5_000
}

fn default_quick_start_suffix() -> String {
    "_QuickStart".to_string()
}

fn default_max_command_len() -> usize {
    DEFAULT_MAX_COMMAND_LEN
}
