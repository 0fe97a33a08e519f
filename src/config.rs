use std::time::Duration;

use anyhow::{bail, Result};

use crate::database_ops::keyforge::ingest::RunSettings;
use crate::database_ops::keyforge::provider::{KeyforgeClient, RetryPolicy, DEFAULT_BASE_URL};
use crate::util::env::{env_opt, env_parse};

/// Everything a sync run needs apart from the database session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub base_url: String,
    pub page_size: u32,
    pub pages_per_run: u32,
    pub page_delay: Duration,
    pub http_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let run = RunSettings::default();
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            page_size: 10,
            pages_per_run: run.pages_per_run,
            page_delay: run.page_delay,
            http_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

impl SyncConfig {
    /// Defaults overridden by `KEYFORGE_*` variables (after loading `.env`).
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            base_url: env_opt("KEYFORGE_BASE_URL").unwrap_or(d.base_url),
            page_size: env_parse("KEYFORGE_PAGE_SIZE", d.page_size),
            pages_per_run: env_parse("KEYFORGE_PAGES_PER_RUN", d.pages_per_run),
            page_delay: Duration::from_secs(env_parse(
                "KEYFORGE_PAGE_DELAY_SECS",
                d.page_delay.as_secs(),
            )),
            http_timeout: Duration::from_secs(env_parse(
                "KEYFORGE_HTTP_TIMEOUT_SECS",
                d.http_timeout.as_secs(),
            )),
            retry: RetryPolicy {
                max_attempts: env_parse("KEYFORGE_MAX_ATTEMPTS", d.retry.max_attempts),
                backoff: Duration::from_millis(env_parse(
                    "KEYFORGE_BACKOFF_MS",
                    d.retry.backoff.as_millis() as u64,
                )),
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            bail!("page size must be at least 1");
        }
        if self.pages_per_run == 0 {
            bail!("pages per run must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            bail!("max attempts must be at least 1");
        }
        if self.http_timeout.is_zero() {
            bail!("http timeout must be positive");
        }
        Ok(())
    }

    pub fn run_settings(&self) -> RunSettings {
        RunSettings {
            pages_per_run: self.pages_per_run,
            page_delay: self.page_delay,
        }
    }

    pub fn build_client(&self) -> Result<KeyforgeClient> {
        Ok(
            KeyforgeClient::new(Some(&self.base_url), self.page_size, self.http_timeout)?
                .with_retry(self.retry),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_catalog_pacing() {
        let cfg = SyncConfig::default();
        assert_eq!(cfg.page_size, 10);
        assert_eq!(cfg.pages_per_run, 200);
        assert_eq!(cfg.page_delay, Duration::from_secs(10));
        assert_eq!(cfg.retry.max_attempts, 1);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_zero_bounds() {
        let cfg = SyncConfig {
            page_size: 0,
            ..SyncConfig::default()
        };
        assert!(cfg.validate().is_err());
        let cfg = SyncConfig {
            pages_per_run: 0,
            ..SyncConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn env_overrides_defaults() {
        std::env::set_var("KEYFORGE_PAGES_PER_RUN", "25");
        std::env::set_var("KEYFORGE_MAX_ATTEMPTS", "3");
        let cfg = SyncConfig::from_env();
        std::env::remove_var("KEYFORGE_PAGES_PER_RUN");
        std::env::remove_var("KEYFORGE_MAX_ATTEMPTS");
        assert_eq!(cfg.pages_per_run, 25);
        assert_eq!(cfg.retry.max_attempts, 3);
    }
}
