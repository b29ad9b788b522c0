use chrono_tz::Tz;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::rodalies::HttpFetcher;
use crate::rodalies::departures::DEFAULT_LIMIT;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Runtime settings, read from the environment (and `.env` when present).
#[derive(Debug, Clone)]
pub struct Config {
    pub gtfs_url: String,
    pub data_dir: PathBuf,
    pub tmp_archive: PathBuf,
    pub fetch_timeout: Duration,
    pub default_limit: usize,
    pub timezone: Tz,
    pub bind_addr: String,
}

impl Config {
    const DEFAULT_DATA_DIR: &'static str = "data/rodalies/gtfs";
    const DEFAULT_TMP_ARCHIVE: &'static str = "data/rodalies/temp_gtfs.zip";
    const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 60;
    const DEFAULT_BIND_ADDR: &'static str = "0.0.0.0:8080";

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let value = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let fetch_timeout = match lookup("RODALIES_FETCH_TIMEOUT_SECS") {
            Some(raw) => Duration::from_secs(parse_positive("RODALIES_FETCH_TIMEOUT_SECS", &raw)? as u64),
            None => Duration::from_secs(Self::DEFAULT_FETCH_TIMEOUT_SECS),
        };

        let default_limit = match lookup("RODALIES_DEFAULT_LIMIT") {
            Some(raw) => parse_positive("RODALIES_DEFAULT_LIMIT", &raw)?,
            None => DEFAULT_LIMIT,
        };

        let timezone = match lookup("RODALIES_TIMEZONE") {
            Some(raw) => raw.parse::<Tz>().map_err(|e| ConfigError::Invalid {
                key: "RODALIES_TIMEZONE",
                value: raw.clone(),
                reason: e.to_string(),
            })?,
            None => chrono_tz::Europe::Madrid,
        };

        Ok(Config {
            gtfs_url: value("RODALIES_GTFS_URL", HttpFetcher::DEFAULT_URL),
            data_dir: PathBuf::from(value("RODALIES_DATA_DIR", Self::DEFAULT_DATA_DIR)),
            tmp_archive: PathBuf::from(value("RODALIES_TMP_ZIP", Self::DEFAULT_TMP_ARCHIVE)),
            fetch_timeout,
            default_limit,
            timezone,
            bind_addr: value("BIND_ADDR", Self::DEFAULT_BIND_ADDR),
        })
    }

    pub fn fetcher(&self) -> HttpFetcher {
        HttpFetcher::new(self.gtfs_url.clone(), self.tmp_archive.clone(), self.fetch_timeout)
    }
}

fn parse_positive(key: &'static str, raw: &str) -> Result<usize, ConfigError> {
    match raw.trim().parse::<usize>() {
        Ok(0) => Err(ConfigError::Invalid {
            key,
            value: raw.to_string(),
            reason: "must be greater than zero".to_string(),
        }),
        Ok(parsed) => Ok(parsed),
        Err(e) => Err(ConfigError::Invalid {
            key,
            value: raw.to_string(),
            reason: e.to_string(),
        }),
    }
}
