//! Runtime settings assembled from the environment (`.env` honored).

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::database_ops::db::Db;
use crate::database_ops::square::{SquareAdapter, SquareAdapterConfig, SquareClient, SquareClientConfig};
use crate::error::PosError;
use crate::net::{RateLimiter, RateLimiterConfig, RetryConfig, RetryPolicy};
use crate::orchestrator::{OrchestratorConfig, SyncOrchestrator};
use crate::transform::{DataTransformer, TransformConfig};
use crate::util::env::{db_url, env_opt, env_parse};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    pub square: SquareClientConfig,
    pub limiter: RateLimiterConfig,
    pub retry: RetryConfig,
    pub adapter: SquareAdapterConfig,
    pub transform: TransformConfig,
    pub orchestrator: OrchestratorConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://pos_sync.db".to_string(),
            db_max_connections: 5,
            square: SquareClientConfig::default(),
            limiter: RateLimiterConfig::default(),
            retry: RetryConfig::default(),
            adapter: SquareAdapterConfig::default(),
            transform: TransformConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

fn ms(key: &str, default: Duration) -> Duration {
    Duration::from_millis(env_parse(key, default.as_millis() as u64))
}

fn hours(key: &str, default: i64) -> Result<chrono::Duration, PosError> {
    let n = env_parse(key, default);
    chrono::Duration::try_hours(n).ok_or_else(|| PosError::Config(format!("{key} out of range: {n}")))
}

fn days(key: &str, default: i64) -> Result<chrono::Duration, PosError> {
    let n = env_parse(key, default);
    chrono::Duration::try_days(n).ok_or_else(|| PosError::Config(format!("{key} out of range: {n}")))
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, PosError> {
        let d = Self::default();
        let cfg = Self {
            database_url: db_url(),
            db_max_connections: env_parse("POS_SYNC_DB_MAX_CONNECTIONS", d.db_max_connections),
            square: SquareClientConfig {
                base_url: env_opt("SQUARE_BASE_URL").unwrap_or(d.square.base_url),
                api_version: env_opt("SQUARE_API_VERSION").unwrap_or(d.square.api_version),
                timeout: Duration::from_secs(env_parse(
                    "SQUARE_HTTP_TIMEOUT_SECS",
                    d.square.timeout.as_secs(),
                )),
            },
            limiter: RateLimiterConfig {
                capacity: env_parse("POS_SYNC_RATE_LIMIT_CAPACITY", d.limiter.capacity),
                refill_interval: ms("POS_SYNC_RATE_LIMIT_INTERVAL_MS", d.limiter.refill_interval),
            },
            retry: RetryConfig {
                max_retries: env_parse("POS_SYNC_MAX_RETRIES", d.retry.max_retries),
                base_delay: ms("POS_SYNC_RETRY_BASE_MS", d.retry.base_delay),
                max_delay: ms("POS_SYNC_RETRY_MAX_MS", d.retry.max_delay),
                jitter: ms("POS_SYNC_RETRY_JITTER_MS", d.retry.jitter),
            },
            adapter: SquareAdapterConfig {
                inventory_batch_size: env_parse(
                    "POS_SYNC_INVENTORY_BATCH_SIZE",
                    d.adapter.inventory_batch_size,
                ),
                catalog_page_limit: env_parse("POS_SYNC_CATALOG_PAGE_LIMIT", d.adapter.catalog_page_limit),
                order_page_limit: env_parse("POS_SYNC_ORDER_PAGE_LIMIT", d.adapter.order_page_limit),
            },
            transform: TransformConfig {
                batch_size: env_parse("POS_SYNC_TRANSFORM_BATCH_SIZE", d.transform.batch_size),
            },
            orchestrator: OrchestratorConfig {
                staleness_threshold: hours(
                    "POS_SYNC_STALENESS_HOURS",
                    d.orchestrator.staleness_threshold.num_hours(),
                )?,
                order_lookback: days(
                    "POS_SYNC_ORDER_LOOKBACK_DAYS",
                    d.orchestrator.order_lookback.num_days(),
                )?,
                max_error_rate: env_parse("POS_SYNC_MAX_ERROR_RATE", d.orchestrator.max_error_rate),
            },
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), PosError> {
        if self.limiter.capacity == 0 || self.limiter.refill_interval.is_zero() {
            return Err(PosError::Config("rate limit capacity and interval must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.orchestrator.max_error_rate) {
            return Err(PosError::Config(format!(
                "max error rate must be within [0, 1], got {}",
                self.orchestrator.max_error_rate
            )));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(PosError::Config("retry base delay exceeds max delay".into()));
        }
        if self.orchestrator.staleness_threshold <= chrono::Duration::zero() {
            return Err(PosError::Config("staleness threshold must be positive".into()));
        }
        if self.orchestrator.order_lookback <= chrono::Duration::zero() {
            return Err(PosError::Config("order lookback must be positive".into()));
        }
        Ok(())
    }

    pub async fn connect_db(&self) -> Result<Db, PosError> {
        Db::connect(&self.database_url, self.db_max_connections).await
    }

    /// Wire client, limiter, retry policy, adapter and transformer around `db`.
    pub fn build_orchestrator(&self, db: Db) -> Result<SyncOrchestrator, PosError> {
        let client = SquareClient::new(self.square.clone())?;
        let limiter = RateLimiter::new(self.limiter.clone())?;
        let retry = RetryPolicy::new(self.retry.clone());
        let adapter = SquareAdapter::new(db.clone(), client, limiter, retry, self.adapter.clone());
        let transformer = DataTransformer::new(db.clone(), self.transform.clone());
        info!(
            base_url = %self.square.base_url,
            capacity = self.limiter.capacity,
            max_retries = self.retry.max_retries,
            inventory_batch_size = adapter.config().inventory_batch_size,
            "sync orchestrator configured"
        );
        Ok(SyncOrchestrator::new(
            db,
            Arc::new(adapter),
            transformer,
            self.orchestrator.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Tests that touch POS_SYNC_* vars read by `from_env` run one at a time.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_validate() {
        let cfg = SyncConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.limiter.capacity, 10);
        assert_eq!(cfg.retry.max_retries, 3);
        assert_eq!(cfg.adapter.inventory_batch_size, 100);
        assert_eq!(cfg.transform.batch_size, 500);
    }

    #[test]
    fn rejects_out_of_range_error_rate() {
        let mut cfg = SyncConfig::default();
        cfg.orchestrator.max_error_rate = 1.5;
        assert!(matches!(cfg.validate(), Err(PosError::Config(_))));
    }

    #[test]
    fn error_rate_from_env_is_range_checked() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        std::env::set_var("POS_SYNC_MAX_ERROR_RATE", "2.0");
        let out = SyncConfig::from_env();
        std::env::remove_var("POS_SYNC_MAX_ERROR_RATE");
        assert!(matches!(out, Err(PosError::Config(_))));
    }

    #[test]
    fn out_of_range_durations_are_config_errors() {
        std::env::set_var("POS_SYNC_TEST_HUGE_HOURS", i64::MAX.to_string());
        std::env::set_var("POS_SYNC_TEST_HUGE_DAYS", i64::MAX.to_string());
        assert!(matches!(hours("POS_SYNC_TEST_HUGE_HOURS", 24), Err(PosError::Config(_))));
        assert!(matches!(days("POS_SYNC_TEST_HUGE_DAYS", 30), Err(PosError::Config(_))));
        assert_eq!(hours("POS_SYNC_TEST_UNSET_HOURS", 24).unwrap(), chrono::Duration::hours(24));
        std::env::remove_var("POS_SYNC_TEST_HUGE_HOURS");
        std::env::remove_var("POS_SYNC_TEST_HUGE_DAYS");
    }

    #[test]
    fn env_overrides_are_applied() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        std::env::set_var("POS_SYNC_RATE_LIMIT_CAPACITY", "4");
        std::env::set_var("POS_SYNC_RETRY_JITTER_MS", "250");
        let cfg = SyncConfig::from_env().unwrap();
        assert_eq!(cfg.limiter.capacity, 4);
        assert_eq!(cfg.retry.jitter, Duration::from_millis(250));
        std::env::remove_var("POS_SYNC_RATE_LIMIT_CAPACITY");
        std::env::remove_var("POS_SYNC_RETRY_JITTER_MS");
    }

    #[tokio::test]
    async fn builds_orchestrator_over_memory_db() {
        let db = Db::in_memory().await.unwrap();
        let orch = SyncConfig::default().build_orchestrator(db).unwrap();
        let report = orch.validate_transformation(1).await.unwrap();
        assert_eq!(report.tier1_items, 0);
    }
}
