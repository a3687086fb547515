//! Client config load/save for `~/.chat-stream/config.yaml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::connection::{ClientOptions, CredentialPlacement};
use crate::policy::{RetryPolicy, DEFAULT_RECONNECT_DELAY};

pub const TOKEN_ENV: &str = "CHAT_STREAM_TOKEN";

/// How the credential is attached when opening the socket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialMode {
    #[default]
    Header,
    Query,
}

/// Server section (url, credential placement).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ServerSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub credential: CredentialMode,
    /// Query parameter name when `credential: query`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_param: Option<String>,
}

/// Auth section. `token` wins over the environment variable named by `token_env`.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct AuthSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,
}

/// Chat section (dataset, conversation, streaming).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ChatSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub streaming: Option<bool>,
}

/// Reconnect section. Missing `max_attempts` retries forever.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ReconnectSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_multiplier: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct RequestSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub chat: ChatSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub request: RequestSection,
}

impl Config {
    pub fn retry_policy(&self) -> RetryPolicy {
        let r = &self.reconnect;
        let delay = r
            .delay_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_RECONNECT_DELAY);
        let mut policy = match r.backoff_multiplier {
            Some(m) if m > 1.0 => {
                let max = r.max_delay_ms.map(Duration::from_millis).unwrap_or(delay * 10);
                RetryPolicy::backoff(delay, m, max)
            }
            _ => RetryPolicy::fixed(delay),
        };
        if let Some(max) = r.max_attempts {
            policy = policy.with_max_attempts(max);
        }
        policy
    }

    pub fn client_options(&self) -> ClientOptions {
        let credential_placement = match self.server.credential {
            CredentialMode::Header => CredentialPlacement::Header,
            CredentialMode::Query => CredentialPlacement::Query {
                param: self
                    .server
                    .token_param
                    .clone()
                    .unwrap_or_else(|| "token".into()),
            },
        };
        ClientOptions {
            retry: self.retry_policy(),
            request_timeout: self.request.timeout_secs.map(Duration::from_secs),
            credential_placement,
            ..ClientOptions::default()
        }
    }

    /// Token from the file, else from the configured (or default) env var.
    pub fn resolve_token(&self) -> Option<String> {
        if let Some(t) = self.auth.token.as_ref().filter(|t| !t.is_empty()) {
            return Some(t.clone());
        }
        let var = self.auth.token_env.as_deref().unwrap_or(TOKEN_ENV);
        std::env::var(var).ok().filter(|t| !t.is_empty())
    }
}

/// Returns the default config file path: `~/.chat-stream/config.yaml` (platform-specific).
pub fn default_config_path() -> Option<PathBuf> {
    let home = home_dir()?;
    Some(home.join(".chat-stream").join("config.yaml"))
}

#[cfg(unix)]
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

#[cfg(windows)]
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("USERPROFILE").map(PathBuf::from)
}

#[cfg(not(any(unix, windows)))]
fn home_dir() -> Option<PathBuf> {
    None
}

pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&contents)?)
}

/// Save config to a YAML file. Creates parent directory if missing.
pub fn save(path: &Path, config: &Config) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let contents = serde_yaml::to_string(config)?;
    std::fs::write(path, contents)?;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_keeps_reference_reconnect_behavior() {
        let cfg: Config = serde_yaml::from_str("{}").unwrap();
        let policy = cfg.retry_policy();
        assert_eq!(policy, RetryPolicy::default());
        assert_eq!(cfg.client_options().request_timeout, None);
        assert_eq!(cfg.client_options().credential_placement, CredentialPlacement::Header);
    }

    #[test]
    fn backoff_section_builds_backoff_policy() {
        let cfg: Config = serde_yaml::from_str(
            "reconnect:\n  delay_ms: 100\n  backoff_multiplier: 2.0\n  max_delay_ms: 1000\n  max_attempts: 5\n",
        )
        .unwrap();
        let policy = cfg.retry_policy();
        assert_eq!(policy.next_delay(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.next_delay(6), None);
    }

    #[test]
    fn query_mode_defaults_param_name() {
        let cfg: Config = serde_yaml::from_str("server:\n  credential: query\n").unwrap();
        assert_eq!(
            cfg.client_options().credential_placement,
            CredentialPlacement::Query {
                param: "token".into()
            }
        );
    }

    #[test]
    fn file_token_wins_over_env() {
        let mut cfg = Config::default();
        cfg.auth.token = Some("from-file".into());
        cfg.auth.token_env = Some("CHAT_STREAM_TEST_UNSET_VAR".into());
        assert_eq!(cfg.resolve_token().as_deref(), Some("from-file"));

        cfg.auth.token = None;
        assert_eq!(cfg.resolve_token(), None);
    }
}
