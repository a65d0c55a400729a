use std::time::Duration;

use anyhow::{bail, Context};

pub const API_URL_VAR: &str = "DASHBOARD_API_URL";
pub const TIMEOUT_VAR: &str = "DASHBOARD_TIMEOUT_SECS";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_PREVIEW_LIMIT: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub api_url: String,
    pub request_timeout: Duration,
    pub preview_limit: usize,
}

impl Config {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            request_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            preview_limit: DEFAULT_PREVIEW_LIMIT,
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any key lookup, so tests don't touch the process env.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let api_url = lookup(API_URL_VAR)
            .filter(|value| !value.trim().is_empty())
            .with_context(|| format!("{API_URL_VAR} must point at the dashboard API"))?;
        let mut config = Self::new(api_url);
        if let Some(raw) = lookup(TIMEOUT_VAR) {
            let secs: u64 = raw
                .trim()
                .parse()
                .with_context(|| format!("{TIMEOUT_VAR} must be a whole number of seconds"))?;
            config.request_timeout = Duration::from_secs(secs);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.api_url.starts_with("http://") || self.api_url.starts_with("https://")) {
            bail!("api url '{}' must start with http:// or https://", self.api_url);
        }
        if self.request_timeout.is_zero() {
            bail!("request timeout must be positive");
        }
        if self.preview_limit == 0 {
            bail!("preview limit must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn reads_url_and_timeout() {
        let config = Config::from_lookup(lookup(&[
            (API_URL_VAR, "http://localhost:7000"),
            (TIMEOUT_VAR, "12"),
        ]))
        .unwrap();
        assert_eq!(config.api_url, "http://localhost:7000");
        assert_eq!(config.request_timeout, Duration::from_secs(12));
        assert_eq!(config.preview_limit, DEFAULT_PREVIEW_LIMIT);
    }

    #[test]
    fn missing_url_is_an_error() {
        let err = Config::from_lookup(lookup(&[])).unwrap_err();
        assert!(err.to_string().contains(API_URL_VAR));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(Config::from_lookup(lookup(&[(API_URL_VAR, "localhost:7000")])).is_err());
        assert!(Config::from_lookup(lookup(&[
            (API_URL_VAR, "http://localhost:7000"),
            (TIMEOUT_VAR, "soon"),
        ]))
        .is_err());
        assert!(Config::from_lookup(lookup(&[
            (API_URL_VAR, "http://localhost:7000"),
            (TIMEOUT_VAR, "0"),
        ]))
        .is_err());
    }
}
