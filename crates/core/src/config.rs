use crate::presenter::CardMode;
use config::{Config, Environment, File, FileFormat};
use homeops_wecom::client::{ClientConfig, DEFAULT_API_BASE_URL};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";
pub const ENV_PREFIX: &str = "HOMEOPS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid config: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub wecom: WeComConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    /// Directory for daily-rolled `audit.jsonl` files. Audit records are
    /// dropped when unset.
    pub audit_dir: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            audit_dir: None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub http_client_timeout_secs: u64,
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            http_client_timeout_secs: 15,
            max_body_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct CoreConfig {
    pub state_ttl_secs: u64,
    pub dedupe_ttl_secs: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            state_ttl_secs: 30 * 60,
            dedupe_ttl_secs: 10 * 60,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct WeComConfig {
    pub corp_id: String,
    pub agent_id: i64,
    pub secret: String,
    pub token: String,
    pub encoding_aes_key: String,
    pub api_base_url: String,
    pub template_card_mode: String,
}

impl Default for WeComConfig {
    fn default() -> Self {
        Self {
            corp_id: String::new(),
            agent_id: 0,
            secret: String::new(),
            token: String::new(),
            encoding_aes_key: String::new(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            template_card_mode: "template_card".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct AuthConfig {
    pub allowed_user_ids: Vec<String>,
}

impl AppConfig {
    /// Reads `config.yaml` (or `custom_path`, which must exist) and layers
    /// `HOMEOPS__SECTION__KEY` environment variables on top.
    pub fn load(custom_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match custom_path {
            Some(path) => (path.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };

        let s = Config::builder()
            .add_source(File::from(path).required(required))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("auth.allowed_user_ids")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: AppConfig = s.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?;
        let cfg: AppConfig = s.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Collects every problem before failing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();
        let w = &self.wecom;

        for (name, value) in [
            ("wecom.corp_id", &w.corp_id),
            ("wecom.secret", &w.secret),
            ("wecom.token", &w.token),
            ("wecom.encoding_aes_key", &w.encoding_aes_key),
            ("wecom.api_base_url", &w.api_base_url),
        ] {
            if value.trim().is_empty() {
                problems.push(format!("{} is required", name));
            }
        }
        if w.agent_id <= 0 {
            problems.push("wecom.agent_id must be a positive integer".to_string());
        }
        let key_len = w.encoding_aes_key.trim().chars().count();
        if key_len != 0 && key_len != 43 {
            problems.push(format!("wecom.encoding_aes_key must be 43 characters, got {}", key_len));
        }
        if let Err(e) = w.template_card_mode.parse::<CardMode>() {
            problems.push(format!("wecom.template_card_mode: {}", e));
        }
        if self.server.listen_addr.trim().is_empty() {
            problems.push("server.listen_addr is required".to_string());
        }
        if self.server.max_body_bytes == 0 {
            problems.push("server.max_body_bytes must be greater than 0".to_string());
        }
        if self.core.state_ttl_secs == 0 {
            problems.push("core.state_ttl_secs must be greater than 0".to_string());
        }
        if self.core.dedupe_ttl_secs == 0 {
            problems.push("core.dedupe_ttl_secs must be greater than 0".to_string());
        }
        if self.allowed_user_ids().is_empty() {
            problems.push("auth.allowed_user_ids must list at least one user".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    pub fn allowed_user_ids(&self) -> Vec<String> {
        self.auth
            .allowed_user_ids
            .iter()
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .collect()
    }

    pub fn card_mode(&self) -> CardMode {
        self.wecom.template_card_mode.parse().unwrap_or_default()
    }

    pub fn state_ttl(&self) -> Duration {
        Duration::from_secs(self.core.state_ttl_secs)
    }

    pub fn dedupe_ttl(&self) -> Duration {
        Duration::from_secs(self.core.dedupe_ttl_secs)
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            api_base_url: self.wecom.api_base_url.clone(),
            corp_id: self.wecom.corp_id.clone(),
            agent_id: self.wecom.agent_id,
            secret: self.wecom.secret.clone(),
            timeout: Duration::from_secs(self.server.http_client_timeout_secs.max(1)),
        }
    }

    /// One-line summary safe for logs.
    pub fn summary(&self) -> String {
        format!(
            "listen_addr={} corp_id={} agent_id={} secret_len={} token_len={} card_mode={} allowed_users={} state_ttl={}s dedupe_ttl={}s",
            self.server.listen_addr,
            mask_secret(&self.wecom.corp_id),
            self.wecom.agent_id,
            self.wecom.secret.len(),
            self.wecom.token.len(),
            self.wecom.template_card_mode,
            self.allowed_user_ids().len(),
            self.core.state_ttl_secs,
            self.core.dedupe_ttl_secs,
        )
    }
}

/// Keeps the first and last four characters.
pub fn mask_secret(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}****{}", head, tail)
}
