use std::{collections::HashMap, time::Duration};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key} must be a valid {expected}, got '{value}'")]
    InvalidValue {
        key: &'static str,
        expected: &'static str,
        value: String,
    },
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatClientKind {
    Bridge,
    Memory,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub kind: StoreKind,
    pub database_url: String,
}

#[derive(Debug, Clone)]
pub struct ChatClientConfig {
    pub kind: ChatClientKind,
    pub bridge_url: String,
    pub bridge_token: String,
    pub webhook_secret: String,
    pub address_suffix: String,
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub business_name: String,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub pairing_timeout: Duration,
    pub teardown_timeout: Duration,
    pub send_interval: Duration,
    pub address_suffix: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub public_base_url: String,
    pub api_token: Option<String>,
    pub store: StoreConfig,
    pub chat: ChatClientConfig,
    pub openai: OpenAiConfig,
    pub pairing_timeout: Duration,
    pub teardown_timeout: Duration,
    pub reconcile_interval: Duration,
    pub send_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_map(values: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::from_lookup(|key| values.get(key).cloned())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let port = match text("PORT") {
            Some(value) => value.parse::<u16>().map_err(|_| ConfigError::InvalidValue {
                key: "PORT",
                expected: "port number",
                value,
            })?,
            None => 4000,
        };

        let store_kind = match text("STORE_KIND").as_deref() {
            None | Some("postgres") => StoreKind::Postgres,
            Some("memory") => StoreKind::Memory,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "STORE_KIND",
                    expected: "store kind (postgres|memory)",
                    value: other.to_string(),
                })
            }
        };

        let chat_kind = match text("CHAT_CLIENT").as_deref() {
            None | Some("bridge") => ChatClientKind::Bridge,
            Some("memory") => ChatClientKind::Memory,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "CHAT_CLIENT",
                    expected: "chat client kind (bridge|memory)",
                    value: other.to_string(),
                })
            }
        };

        let public_base_url = text("API_PUBLIC_URL")
            .unwrap_or_else(|| format!("http://localhost:{port}"))
            .trim_end_matches('/')
            .to_string();

        let pairing_timeout = seconds(&text, "PAIRING_TIMEOUT_SECS", 120)?;
        let teardown_timeout = seconds(&text, "TEARDOWN_TIMEOUT_SECS", 10)?;
        let reconcile_interval = seconds(&text, "RECONCILE_INTERVAL_SECS", 60)?;
        let send_interval = Duration::from_millis(number(&text, "DISPATCH_SEND_INTERVAL_MS", 1500)?);

        Ok(Self {
            port,
            public_base_url,
            api_token: text("API_TOKEN"),
            store: StoreConfig {
                kind: store_kind,
                database_url: resolve_database_url(&text),
            },
            chat: ChatClientConfig {
                kind: chat_kind,
                bridge_url: text("CHAT_BRIDGE_URL")
                    .unwrap_or_else(|| "http://localhost:3001".to_string())
                    .trim_end_matches('/')
                    .to_string(),
                bridge_token: text("CHAT_BRIDGE_TOKEN").unwrap_or_default(),
                webhook_secret: text("CHAT_BRIDGE_WEBHOOK_SECRET").unwrap_or_default(),
                address_suffix: text("CHAT_ADDRESS_SUFFIX").unwrap_or_else(|| "c.us".to_string()),
            },
            openai: OpenAiConfig {
                api_key: text("OPENAI_API_KEY").unwrap_or_default(),
                model: text("OPENAI_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
                base_url: text("OPENAI_BASE_URL")
                    .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
                    .trim_end_matches('/')
                    .to_string(),
                business_name: text("BUSINESS_NAME").unwrap_or_default(),
            },
            pairing_timeout,
            teardown_timeout,
            reconcile_interval,
            send_interval,
        })
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            pairing_timeout: self.pairing_timeout,
            teardown_timeout: self.teardown_timeout,
            send_interval: self.send_interval,
            address_suffix: self.chat.address_suffix.clone(),
        }
    }
}

fn number<F>(text: &F, key: &'static str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match text(key) {
        Some(value) => value.parse::<u64>().map_err(|_| ConfigError::InvalidValue {
            key,
            expected: "non-negative integer",
            value,
        }),
        None => Ok(default),
    }
}

fn seconds<F>(text: &F, key: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = number(text, key, default)?;
    if value == 0 {
        return Err(ConfigError::ZeroDuration(key));
    }
    Ok(Duration::from_secs(value))
}

fn resolve_database_url<F>(text: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = text("DATABASE_URL") {
        return url;
    }
    let pick = |primary: &str, fallback: &str, default: &str| {
        text(primary)
            .or_else(|| text(fallback))
            .unwrap_or_else(|| default.to_string())
    };
    let host = pick("POSTGRES_HOST", "PGHOST", "localhost");
    let port = pick("POSTGRES_PORT", "PGPORT", "5432");
    let user = pick("POSTGRES_USER", "PGUSER", "postgres");
    let password = pick("POSTGRES_PASSWORD", "PGPASSWORD", "postgres");
    let db = pick("POSTGRES_DB", "PGDATABASE", "recovery");
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}
