// Copyright (c) 2025 sbksba
//
// This software is licensed under the terms of the MIT License.
// See the LICENSE file in the project root for the full license text.
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};

pub const DEFAULT_DATABASE_URL: &str = "sqlite://database/taskbell.db";
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";
pub const DEFAULT_TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Runtime configuration, read from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL. The file is created if missing.
    pub database_url: String,
    /// Address the HTTP API listens on.
    pub bind_addr: SocketAddr,
    /// Telegram bot token. Notifications are only logged when absent.
    pub telegram_token: Option<String>,
    /// Base URL of the Telegram Bot API.
    pub telegram_api_base: String,
    pub scheduler: SchedulerConfig,
}

/// Polling and timeout settings of the scheduler loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Sleep between cycles when the last cycle found candidate tasks.
    pub active_interval: Duration,
    /// Sleep between cycles when nothing was pending.
    pub idle_interval: Duration,
    /// Upper bound for a single store call or notification send.
    pub io_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            active_interval: Duration::from_secs(60),
            idle_interval: Duration::from_secs(600),
            io_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            telegram_token: None,
            telegram_api_base: DEFAULT_TELEGRAM_API_BASE.to_string(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl Config {
    /// Reads the configuration from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    /// Unset or empty keys fall back to defaults; malformed values are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = SchedulerConfig::default();

        let bind_addr = get("TASKBELL_BIND_ADDR")
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string())
            .parse::<SocketAddr>()
            .context("TASKBELL_BIND_ADDR is not a valid socket address")?;

        let scheduler = SchedulerConfig {
            active_interval: secs(get("TASKBELL_ACTIVE_POLL_SECS"), "TASKBELL_ACTIVE_POLL_SECS")?
                .unwrap_or(defaults.active_interval),
            idle_interval: secs(get("TASKBELL_IDLE_POLL_SECS"), "TASKBELL_IDLE_POLL_SECS")?
                .unwrap_or(defaults.idle_interval),
            io_timeout: secs(get("TASKBELL_IO_TIMEOUT_SECS"), "TASKBELL_IO_TIMEOUT_SECS")?
                .unwrap_or(defaults.io_timeout),
        };

        Ok(Self {
            database_url: get("TASKBELL_DATABASE_URL")
                .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            bind_addr,
            telegram_token: get("TELEGRAM_BOT_TOKEN"),
            telegram_api_base: get("TELEGRAM_API_BASE")
                .unwrap_or_else(|| DEFAULT_TELEGRAM_API_BASE.to_string()),
            scheduler,
        })
    }
}

fn secs(raw: Option<String>, key: &str) -> Result<Option<Duration>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let value: u64 = raw
        .trim()
        .parse()
        .with_context(|| format!("{key} must be a whole number of seconds, got '{raw}'"))?;
    if value == 0 {
        anyhow::bail!("{key} must be greater than zero");
    }
    Ok(Some(Duration::from_secs(value)))
}
