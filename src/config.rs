//! Configuration loading.
//!
//! A TOML file with serde defaults for every field: a missing file or an
//! empty table is a valid configuration, except that LINE credentials must
//! come from somewhere — the file or the environment — before the gateway
//! will start. Environment variables win over the file so tokens can stay
//! out of it entirely.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

pub const ENV_LINE_ACCESS_TOKEN: &str = "LINE_CHANNEL_ACCESS_TOKEN";
pub const ENV_LINE_CHANNEL_SECRET: &str = "LINE_CHANNEL_SECRET";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub line: LineConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };
        let mut config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var(ENV_LINE_ACCESS_TOKEN) {
            if !token.trim().is_empty() {
                self.line.channel_access_token = token.trim().to_string();
            }
        }
        if let Ok(secret) = std::env::var(ENV_LINE_CHANNEL_SECRET) {
            if !secret.trim().is_empty() {
                self.line.channel_secret = secret.trim().to_string();
            }
        }
    }

    /// Startup checks that cannot be expressed as defaults.
    pub fn validate(&self) -> Result<()> {
        if self.line.channel_access_token.trim().is_empty() {
            bail!(
                "LINE channel access token is not set. \
                 Set [line] channel_access_token in the config file or \
                 export {ENV_LINE_ACCESS_TOKEN}."
            );
        }
        if self.line.channel_secret.trim().is_empty() {
            bail!(
                "LINE channel secret is not set. \
                 Set [line] channel_secret in the config file or \
                 export {ENV_LINE_CHANNEL_SECRET}."
            );
        }
        Ok(())
    }
}

// ── Server ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

// ── LINE credentials ────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LineConfig {
    #[serde(default)]
    pub channel_access_token: String,
    #[serde(default)]
    pub channel_secret: String,
}

// ── Auth tuning ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Takeover code lifetime (seconds).
    #[serde(default = "default_otp_ttl")]
    pub otp_ttl_secs: u64,
    /// Wrong-code attempts before the requester is suspended.
    #[serde(default = "default_otp_max_attempts")]
    pub otp_max_attempts: u32,
    /// Inactivity after which a live binding is auto-logged-out (seconds).
    #[serde(default = "default_idle_window")]
    pub idle_window_secs: u64,
    /// Suspension handed to OTP abusers (seconds).
    #[serde(default = "default_abuse_suspension")]
    pub abuse_suspension_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            otp_ttl_secs: default_otp_ttl(),
            otp_max_attempts: default_otp_max_attempts(),
            idle_window_secs: default_idle_window(),
            abuse_suspension_secs: default_abuse_suspension(),
        }
    }
}

fn default_otp_ttl() -> u64 {
    600 // 10 minutes
}

fn default_otp_max_attempts() -> u32 {
    2
}

fn default_idle_window() -> u64 {
    3600 // 1 hour
}

fn default_abuse_suspension() -> u64 {
    1800 // 30 minutes
}

// ── Storage ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the member and suspension databases.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    directories::UserDirs::new()
        .map(|dirs| dirs.home_dir().join(".shiokaze"))
        .unwrap_or_else(|| PathBuf::from(".shiokaze"))
}
