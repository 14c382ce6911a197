use std::{fmt::Display, str::FromStr, time::Duration};

use anyhow::{anyhow, bail, Context};

use crate::rooms::SlotWindow;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    pub window: SlotWindow,
    pub write_timeout: Duration,
    pub outbox_capacity: usize,
    pub session_minutes: i64,
    pub trust_identity_headers: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite://haggle.db?mode=rwc".to_owned(),
            host: "0.0.0.0".to_owned(),
            port: 8080,
            window: SlotWindow::default(),
            write_timeout: Duration::from_millis(5000),
            outbox_capacity: 64,
            session_minutes: 30,
            trust_identity_headers: false,
        }
    }
}

impl Config {
    /// Reads the process environment, after loading `.env` if there is one.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| dotenv::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Config::default();
        let window = SlotWindow {
            first_hour: parsed(&lookup, "HAGGLE_FIRST_HOUR", defaults.window.first_hour)?,
            last_hour: parsed(&lookup, "HAGGLE_LAST_HOUR", defaults.window.last_hour)?,
            horizon_days: parsed(&lookup, "HAGGLE_HORIZON_DAYS", defaults.window.horizon_days)?,
        };
        if window.first_hour > window.last_hour || window.last_hour > 23 {
            bail!(
                "bookable hours {}..={} must lie within 0..=23 and not be reversed",
                window.first_hour,
                window.last_hour
            );
        }
        if window.horizon_days == 0 {
            bail!("HAGGLE_HORIZON_DAYS must be at least 1");
        }

        let outbox_capacity = parsed(&lookup, "HAGGLE_OUTBOX_CAPACITY", defaults.outbox_capacity)?;
        if outbox_capacity == 0 {
            bail!("HAGGLE_OUTBOX_CAPACITY must be at least 1");
        }

        Ok(Config {
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            host: lookup("HOST").unwrap_or(defaults.host),
            port: parsed(&lookup, "PORT", defaults.port)?,
            window,
            write_timeout: Duration::from_millis(parsed(&lookup, "HAGGLE_WRITE_TIMEOUT_MS", 5000)?),
            outbox_capacity,
            session_minutes: parsed(&lookup, "HAGGLE_SESSION_MINUTES", defaults.session_minutes)?,
            trust_identity_headers: parsed(
                &lookup,
                "HAGGLE_TRUST_IDENTITY_HEADERS",
                defaults.trust_identity_headers,
            )?,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|err| anyhow!("{err}"))
            .with_context(|| format!("invalid {key}={raw}")),
    }
}
