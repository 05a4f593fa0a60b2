use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::AppError;

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful AI assistant. Provide clear, concise, and accurate responses.";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub api_key: Option<String>,
    pub provider_label: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:1234/v1".to_string(),
            timeout_secs: 120,
            api_key: None,
            provider_label: "LMStudio".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatConfig {
    pub system_prompt: String,
    /// Number of prior messages replayed to the provider.
    pub context_messages: i64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            context_messages: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelDefaults {
    pub max_tokens: i64,
    pub temperature: f64,
}

impl Default for ModelDefaults {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            temperature: 0.7,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub max_read_connections: u32,
    pub log_filter: String,
    pub provider: ProviderConfig,
    pub chat: ChatConfig,
    pub models: ModelDefaults,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            max_read_connections: 4,
            log_filter: "warn,lmchat_lib=info,lmchat=info".to_string(),
            provider: ProviderConfig::default(),
            chat: ChatConfig::default(),
            models: ModelDefaults::default(),
        }
    }
}

impl AppConfig {
    /// Build from `LMCHAT_*` environment variables on top of the defaults.
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let mut config = Self::default();

        if let Some(dir) = lookup("LMCHAT_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(value) = parse_var(&lookup, "LMCHAT_DB_READ_CONNECTIONS")? {
            config.max_read_connections = value;
        }
        if let Some(filter) = lookup("LMCHAT_LOG_FILTER") {
            config.log_filter = filter;
        }
        if let Some(url) = lookup("LMCHAT_PROVIDER_URL") {
            config.provider.base_url = url;
        }
        if let Some(value) = parse_var(&lookup, "LMCHAT_PROVIDER_TIMEOUT_SECS")? {
            config.provider.timeout_secs = value;
        }
        if let Some(key) = lookup("LMCHAT_PROVIDER_API_KEY").filter(|k| !k.trim().is_empty()) {
            config.provider.api_key = Some(key);
        }
        if let Some(value) = parse_var(&lookup, "LMCHAT_CONTEXT_MESSAGES")? {
            config.chat.context_messages = value;
        }
        if let Some(prompt) = lookup("LMCHAT_SYSTEM_PROMPT") {
            config.chat.system_prompt = prompt;
        }
        if let Some(value) = parse_var(&lookup, "LMCHAT_DEFAULT_MAX_TOKENS")? {
            config.models.max_tokens = value;
        }
        if let Some(value) = parse_var(&lookup, "LMCHAT_DEFAULT_TEMPERATURE")? {
            config.models.temperature = value;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.provider.base_url.trim().is_empty() {
            return Err(AppError::Config("provider base URL is empty".to_string()));
        }
        if self.chat.context_messages <= 0 {
            return Err(AppError::Config(
                "context window must hold at least one message".to_string(),
            ));
        }
        if !(0.0..=2.0).contains(&self.models.temperature) {
            return Err(AppError::Config(format!(
                "default temperature {} is outside 0-2",
                self.models.temperature
            )));
        }
        if self.models.max_tokens <= 0 {
            return Err(AppError::Config("default max tokens must be positive".to_string()));
        }
        if self.max_read_connections == 0 {
            return Err(AppError::Config("read pool needs at least one connection".to_string()));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, AppError>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| AppError::Config(format!("{key}={raw:?}: {e}"))),
        None => Ok(None),
    }
}
