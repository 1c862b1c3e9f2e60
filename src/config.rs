//! Configuration loader (component K): a single JSON document, loaded once
//! at startup from `--config` or `NOTIFY_SERVER_CONFIG`, with all
//! cross-field validation (duplicate ids, missing defaults, bad durations)
//! performed before the rest of the process starts.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid duration {0:?}: expected a number followed by ms/s/m/h")]
    InvalidDuration(String),

    #[error("duplicate notifier id in configuration: {0}")]
    DuplicateNotifierId(String),

    #[error("default_notifier_id {0:?} is not present in notifier.telegrams")]
    MissingDefaultNotifier(String),

    #[error("duplicate task id in configuration: {0}")]
    DuplicateTaskId(String),

    #[error("duplicate application_id in configuration: {0}")]
    DuplicateApplicationId(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub debug: bool,
    pub http_retry: HttpRetryConfig,
    pub notifier: NotifierConfig,
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
    pub notify_api: NotifyApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpRetryConfig {
    pub max_retries: u32,
    pub retry_delay: String,
}

impl HttpRetryConfig {
    pub fn retry_delay_duration(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.retry_delay)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifierConfig {
    pub default_notifier_id: String,
    #[serde(default)]
    pub telegrams: Vec<TelegramNotifierConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramNotifierConfig {
    pub id: String,
    pub bot_token: String,
    pub chat_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    pub id: String,
    #[serde(default = "serde_json::Value::default")]
    pub data: serde_json::Value,
    #[serde(default)]
    pub commands: Vec<CommandConfigEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandConfigEntry {
    pub id: String,
    #[serde(default)]
    pub default_notifier_id: Option<String>,
    #[serde(default)]
    pub allow_multiple: bool,
    #[serde(default)]
    pub scheduler: Option<SchedulerConfig>,
    #[serde(default = "serde_json::Value::default")]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    pub runnable: bool,
    pub time_spec: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifyApiConfig {
    pub ws: WsConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub applications: Vec<ApplicationConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WsConfig {
    #[serde(default)]
    pub tls_server: bool,
    pub listen_port: u16,
    #[serde(default)]
    pub tls_cert_file: Option<String>,
    #[serde(default)]
    pub tls_key_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CorsConfig {
    #[serde(default)]
    pub allow_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApplicationConfig {
    pub application_id: String,
    pub app_key: String,
    pub default_notifier_id: String,
}

impl AppConfig {
    /// Resolves the config path from the CLI override, falling back to
    /// `NOTIFY_SERVER_CONFIG`, then loads and validates it.
    pub async fn load(cli_path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match cli_path {
            Some(p) => p.to_path_buf(),
            None => std::env::var("NOTIFY_SERVER_CONFIG")
                .map(std::path::PathBuf::from)
                .unwrap_or_else(|_| std::path::PathBuf::from("notify-server.json")),
        };

        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;

        let config: AppConfig =
            serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.http_retry.retry_delay_duration()?;

        let mut seen_notifiers = std::collections::HashSet::new();
        for tg in &self.notifier.telegrams {
            if !seen_notifiers.insert(tg.id.clone()) {
                return Err(ConfigError::DuplicateNotifierId(tg.id.clone()));
            }
        }
        if !seen_notifiers.contains(&self.notifier.default_notifier_id) {
            return Err(ConfigError::MissingDefaultNotifier(
                self.notifier.default_notifier_id.clone(),
            ));
        }

        let mut seen_tasks = std::collections::HashSet::new();
        for task in &self.tasks {
            if !seen_tasks.insert(task.id.clone()) {
                return Err(ConfigError::DuplicateTaskId(task.id.clone()));
            }
        }

        let mut seen_apps = std::collections::HashSet::new();
        for app in &self.notify_api.applications {
            if !seen_apps.insert(app.application_id.clone()) {
                return Err(ConfigError::DuplicateApplicationId(
                    app.application_id.clone(),
                ));
            }
        }

        Ok(())
    }
}

/// Parses a Go-style duration string (`"500ms"`, `"5s"`, `"2m"`, `"1h"`).
/// Only a single unit is supported; config files are expected to use the
/// smallest unit that keeps the number readable.
fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let s = s.trim();
    let split_at = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| ConfigError::InvalidDuration(s.to_string()))?;
    let (digits, unit) = s.split_at(split_at);
    let value: u64 = digits
        .parse()
        .map_err(|_| ConfigError::InvalidDuration(s.to_string()))?;

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(ConfigError::InvalidDuration(s.to_string())),
    }
}
