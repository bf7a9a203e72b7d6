//! Configuration loading with env-var overrides.
//!
//! Reads `config/default.toml` (or an explicit path) relative to the current
//! working directory, then applies `NEKO_LOG_LEVEL`. Service credentials are
//! read from `ANUNEKO_TOKEN` / `ANUNEKO_COOKIE` only; they never live in TOML.

use std::{
    env, fs,
    path::Path,
};

use serde::Deserialize;

use crate::error::AppError;
use crate::logger;
use crate::neko::NekoModel;

/// PTY (console) channel configuration.
#[derive(Debug, Clone)]
pub struct PtyConfig {
    pub enabled: bool,
}

/// Telegram channel configuration.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    /// Telegram must be explicitly enabled; the token comes from `TELEGRAM_BOT_TOKEN`.
    pub enabled: bool,
}

/// Comms subsystem configuration.
#[derive(Debug, Clone)]
pub struct CommsConfig {
    pub pty: PtyConfig,
    pub telegram: TelegramConfig,
}

/// Remote Neko service configuration (`[neko]`).
#[derive(Debug, Clone)]
pub struct NekoConfig {
    /// API root; endpoint paths are appended to it.
    pub api_base_url: String,
    /// Sent as `x-device_id` on every API call.
    pub device_id: String,
    /// Model used for users who never ran `switch`.
    pub default_model: NekoModel,
    /// Budget for create-conversation and select-model calls.
    pub request_timeout_seconds: u64,
    /// Budget for the select-choice call after a reply.
    pub choice_timeout_seconds: u64,
    /// Appended to every chat reply. Usually empty.
    pub watermark: String,
}

/// Token and cookie forwarded to the service. Env-only.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub token: Option<String>,
    pub cookie: Option<String>,
}

impl Credentials {
    /// Read `ANUNEKO_TOKEN` and `ANUNEKO_COOKIE`; empty values count as unset.
    pub fn from_env() -> Self {
        Self {
            token: non_empty_env("ANUNEKO_TOKEN"),
            cookie: non_empty_env("ANUNEKO_COOKIE"),
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Fully-resolved bot configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub bot_name: String,
    pub log_level: String,
    pub comms: CommsConfig,
    pub neko: NekoConfig,
    pub credentials: Credentials,
}

impl Config {
    pub fn comms_pty_should_load(&self) -> bool {
        self.comms.pty.enabled
    }

    pub fn comms_telegram_should_load(&self) -> bool {
        self.comms.telegram.enabled
    }
}

/// Raw TOML shape — `serde` target before resolution.
#[derive(Deserialize)]
struct RawConfig {
    supervisor: RawSupervisor,
    #[serde(default)]
    comms: RawComms,
    #[serde(default)]
    neko: RawNeko,
}

#[derive(Deserialize)]
struct RawSupervisor {
    bot_name: String,
    log_level: String,
}

#[derive(Deserialize, Default)]
struct RawComms {
    #[serde(default)]
    pty: RawPty,
    #[serde(default)]
    telegram: RawTelegram,
}

#[derive(Deserialize)]
struct RawPty {
    #[serde(default = "default_true")]
    enabled: bool,
}

impl Default for RawPty {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Deserialize, Default)]
struct RawTelegram {
    #[serde(default)]
    enabled: bool,
}

#[derive(Deserialize)]
struct RawNeko {
    #[serde(default = "default_api_base_url")]
    api_base_url: String,
    #[serde(default = "default_device_id")]
    device_id: String,
    #[serde(default)]
    default_model: NekoModel,
    #[serde(default = "default_request_timeout_seconds")]
    request_timeout_seconds: u64,
    #[serde(default = "default_choice_timeout_seconds")]
    choice_timeout_seconds: u64,
    #[serde(default)]
    watermark: String,
}

impl Default for RawNeko {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            device_id: default_device_id(),
            default_model: NekoModel::default(),
            request_timeout_seconds: default_request_timeout_seconds(),
            choice_timeout_seconds: default_choice_timeout_seconds(),
            watermark: String::new(),
        }
    }
}

fn default_api_base_url() -> String { "https://anuneko.com/api/v1".to_string() }
fn default_device_id() -> String { "7b75a432-6b24-48ad-b9d3-3dc57648e3e3".to_string() }
fn default_request_timeout_seconds() -> u64 { 10 }
fn default_choice_timeout_seconds() -> u64 { 5 }

fn default_true() -> bool {
    true
}

/// Load config from `path` (default `config/default.toml`), then apply
/// env-var overrides.
pub fn load(path: Option<&str>) -> Result<Config, AppError> {
    let log_level_override = env::var("NEKO_LOG_LEVEL").ok();
    load_from(
        Path::new(path.unwrap_or("config/default.toml")),
        log_level_override.as_deref(),
        Credentials::from_env(),
    )
}

/// Loader with explicit path and overrides.
/// Tests pass overrides directly instead of mutating env vars.
pub fn load_from(
    path: &Path,
    log_level_override: Option<&str>,
    credentials: Credentials,
) -> Result<Config, AppError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;

    let parsed: RawConfig = toml::from_str(&raw)
        .map_err(|e| AppError::Config(format!("parse error in {}: {e}", path.display())))?;

    let s = parsed.supervisor;
    let n = parsed.neko;

    if n.api_base_url.trim().is_empty() {
        return Err(AppError::Config("neko.api_base_url must not be empty".into()));
    }

    let log_level = log_level_override.unwrap_or(&s.log_level).to_string();
    logger::parse_level(&log_level)?;

    Ok(Config {
        bot_name: s.bot_name,
        log_level,
        comms: CommsConfig {
            pty: PtyConfig { enabled: parsed.comms.pty.enabled },
            telegram: TelegramConfig { enabled: parsed.comms.telegram.enabled },
        },
        neko: NekoConfig {
            api_base_url: n.api_base_url.trim_end_matches('/').to_string(),
            device_id: n.device_id,
            default_model: n.default_model,
            request_timeout_seconds: n.request_timeout_seconds,
            choice_timeout_seconds: n.choice_timeout_seconds,
            watermark: n.watermark,
        },
        credentials,
    })
}

impl NekoConfig {
    /// Built-in defaults with a different API root (mock servers, staging).
    pub fn with_base_url(api_base_url: impl Into<String>) -> Self {
        let raw = RawNeko::default();
        Self {
            api_base_url: api_base_url.into(),
            device_id: raw.device_id,
            default_model: raw.default_model,
            request_timeout_seconds: raw.request_timeout_seconds,
            choice_timeout_seconds: raw.choice_timeout_seconds,
            watermark: raw.watermark,
        }
    }
}
