use std::env;
use std::path::PathBuf;

use crate::error::ConfigError;

const DEFAULT_PORT: u16 = 50000;
const MIN_SESSION_SECRET_BYTES: usize = 32;

/// Process configuration, read once from the environment at startup.
///
/// A missing or malformed mandatory variable turns into a fatal
/// [`ConfigError`]; the caller is expected to exit non-zero on failure.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the Proxmox API, e.g. `https://pve.example:8006`.
    pub proxmox_url: String,
    /// API token identity, `user@realm!tokenid`. Optional; when absent the
    /// portal can only act with per-user ticket credentials.
    pub api_token_name: Option<String>,
    pub api_token_value: Option<String>,
    /// Verify the upstream TLS certificate. Defaults to true.
    pub verify_ssl: bool,
    /// bcrypt hash the admin login password is checked against.
    pub admin_password_hash: String,
    /// Key material for signing session cookies. At least 32 bytes.
    pub session_secret: String,
    pub port: u16,
    pub log_level: String,
    /// Overrides the Domain attribute on the upstream console cookie.
    pub cookie_domain: Option<String>,
    /// Location of the persisted settings document.
    pub settings_path: PathBuf,
    /// Enables HSTS and other production-only hardening.
    pub production: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let proxmox_url = require("PROXMOX_URL")?;

        let api_token_name = optional("PROXMOX_API_TOKEN_NAME");
        let api_token_value = optional("PROXMOX_API_TOKEN_VALUE");
        if api_token_name.is_some() != api_token_value.is_some() {
            return Err(ConfigError::InvalidVar {
                name: "PROXMOX_API_TOKEN_NAME",
                reason: "token name and value must be set together".into(),
            });
        }

        let verify_ssl = match optional("PROXMOX_VERIFY_SSL").as_deref() {
            None => true,
            Some(v) => parse_bool("PROXMOX_VERIFY_SSL", v)?,
        };

        let admin_password_hash = require("ADMIN_PASSWORD_HASH")?;
        if !admin_password_hash.starts_with("$2") {
            return Err(ConfigError::InvalidVar {
                name: "ADMIN_PASSWORD_HASH",
                reason: "expected a bcrypt hash".into(),
            });
        }

        let session_secret = require("SESSION_SECRET")?;
        if session_secret.len() < MIN_SESSION_SECRET_BYTES {
            return Err(ConfigError::InvalidVar {
                name: "SESSION_SECRET",
                reason: format!("must be at least {} bytes", MIN_SESSION_SECRET_BYTES),
            });
        }

        let port = match optional("PORT") {
            None => DEFAULT_PORT,
            Some(v) => v.parse().map_err(|_| ConfigError::InvalidVar {
                name: "PORT",
                reason: format!("not a valid port number: {}", v),
            })?,
        };

        Ok(Self {
            proxmox_url,
            api_token_name,
            api_token_value,
            verify_ssl,
            admin_password_hash,
            session_secret,
            port,
            log_level: optional("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            cookie_domain: optional("PROXMOX_COOKIE_DOMAIN"),
            settings_path: optional("PVMSS_SETTINGS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("settings.json")),
            production: optional("APP_ENV").as_deref() == Some("production"),
        })
    }

    /// True when an API token identity is configured for the shared client.
    pub fn has_api_token(&self) -> bool {
        self.api_token_name.is_some() && self.api_token_value.is_some()
    }
}

fn require(name: &'static str) -> Result<String, ConfigError> {
    match env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::MissingVar(name)),
    }
}

fn optional(name: &'static str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidVar {
            name,
            reason: format!("not a boolean: {}", value),
        }),
    }
}
