//! Typed key/value settings backed by the store's `config` table.

use std::collections::BTreeMap;
use std::time::Duration;

use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{Error, Result};

/// Recognised keys and their defaults. Unknown keys are accepted for
/// forward-compatibility but ignored by the core.
const DEFAULTS: &[(&str, &str)] = &[
    ("max_retries", "3"),
    ("backoff_base", "2"),
    ("poll_interval_ms", "500"),
    ("default_timeout_secs", "60"),
];

/// Typed view over the configuration table.
///
/// Defaults for recognised keys are materialised into the table on first
/// read, so `config show` reflects what the workers will actually use.
#[derive(Clone)]
pub struct Config {
    pool: SqlitePool,
}

/// Snapshot of the recognised settings, loaded once per worker or
/// supervisor start.
#[derive(Debug, Clone, Copy)]
pub struct Settings {
    /// Default retry ceiling for jobs that omit their own.
    pub max_retries: i64,
    /// Base of the exponential backoff, in seconds.
    pub backoff_base: f64,
    /// Sleep between empty claim attempts.
    pub poll_interval: Duration,
    /// Wall-clock limit for jobs that omit `timeout_secs`.
    pub default_timeout: Duration,
}

impl Config {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Config { pool }
    }

    /// Reads a key, materialising the default for recognised keys that have
    /// never been written.
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let stored = sqlx::query_scalar::<_, String>("SELECT value FROM config WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(value) = stored {
            return Ok(Some(value));
        }

        let Some((_, default)) = DEFAULTS.iter().find(|(name, _)| *name == key) else {
            return Ok(None);
        };
        sqlx::query("INSERT OR IGNORE INTO config (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(*default)
            .execute(&self.pool)
            .await?;
        debug!(key, value = default, "materialised config default");
        Ok(Some((*default).to_string()))
    }

    /// Writes a key, validating values for recognised keys first.
    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        validate(key, value)?;
        sqlx::query(
            r"
            INSERT INTO config (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            ",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Every stored key/value pair, with recognised defaults materialised.
    pub async fn all(&self) -> Result<BTreeMap<String, String>> {
        for (key, _) in DEFAULTS {
            self.get(key).await?;
        }
        let rows = sqlx::query_as::<_, (String, String)>("SELECT key, value FROM config")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().collect())
    }

    /// Loads the typed settings snapshot.
    pub async fn settings(&self) -> Result<Settings> {
        Ok(Settings {
            max_retries: self.required_parsed("max_retries").await?,
            backoff_base: self.required_parsed("backoff_base").await?,
            poll_interval: Duration::from_millis(
                self.required_parsed::<u64>("poll_interval_ms").await?,
            ),
            default_timeout: Duration::from_secs(
                self.required_parsed::<u64>("default_timeout_secs").await?,
            ),
        })
    }

    async fn required_parsed<T: std::str::FromStr>(&self, key: &str) -> Result<T> {
        // Recognised keys always resolve via the defaults table.
        let value = self
            .get(key)
            .await?
            .ok_or_else(|| Error::InvalidInput(format!("config {key} is not set")))?;
        value
            .parse()
            .map_err(|_| Error::InvalidInput(format!("config {key} holds non-numeric value {value:?}")))
    }
}

fn validate(key: &str, value: &str) -> Result<()> {
    let numeric = |what: &str| {
        Error::InvalidInput(format!("config {key} requires {what}, got {value:?}"))
    };
    match key {
        "max_retries" => {
            value
                .parse::<i64>()
                .ok()
                .filter(|n| *n >= 0)
                .ok_or_else(|| numeric("an integer >= 0"))?;
        }
        "backoff_base" => {
            value
                .parse::<f64>()
                .ok()
                .filter(|n| *n > 1.0)
                .ok_or_else(|| numeric("a number > 1"))?;
        }
        "poll_interval_ms" | "default_timeout_secs" => {
            value
                .parse::<i64>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| numeric("an integer > 0"))?;
        }
        _ => {}
    }
    Ok(())
}
