//! Per-connection sync-and-transform pipeline plus the read-only status,
//! statistics and validation queries over both tiers.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use serde::Serialize;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::database_ops::connections::{self, Connection};
use crate::database_ops::db::Db;
use crate::database_ops::provider::{HealthStatus, InventorySyncReport, OrderSyncReport, PosAdapter};
use crate::database_ops::purge::{self, DeletionCounts};
use crate::database_ops::square::store::{self, Scope, Tier1Counts, CATALOG_TABLES};
use crate::database_ops::unified;
use crate::error::PosError;
use crate::transform::{DataTransformer, TransformOptions, TransformReport};

/// Coverage below this share of Tier-1 items is an incomplete transformation.
pub const VALIDATION_THRESHOLD_PERCENT: i64 = 95;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub staleness_threshold: Duration,
    pub order_lookback: Duration,
    pub max_error_rate: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            staleness_threshold: Duration::hours(24),
            order_lookback: Duration::days(30),
            max_error_rate: 0.05,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    /// Only pull catalog objects changed since `last_sync_at`.
    pub incremental: bool,
    /// Map to Tier-2 but do not write it.
    pub dry_run: bool,
    pub clear_before_sync: bool,
    pub transform: bool,
    pub include_orders: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            incremental: false,
            dry_run: false,
            clear_before_sync: false,
            transform: true,
            include_orders: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Clear,
    Sync,
    Transform,
    Complete,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Clear => "clear",
            Phase::Sync => "sync",
            Phase::Transform => "transform",
            Phase::Complete => "complete",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunError {
    pub phase: Phase,
    pub kind: &'static str,
    pub message: String,
    pub retryable: bool,
}

impl RunError {
    fn new(phase: Phase, err: &PosError) -> Self {
        Self {
            phase,
            kind: err.kind(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

/// Outcome of one `sync_and_transform` run.
#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub run_id: Uuid,
    pub connection_id: i64,
    pub restaurant_id: i64,
    pub status: RunStatus,
    pub phase: Phase,
    pub incremental: bool,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cleared: Option<DeletionCounts>,
    pub inventory: Option<InventorySyncReport>,
    pub orders: Option<OrderSyncReport>,
    pub catalog_transform: Option<TransformReport>,
    pub sales_transform: Option<TransformReport>,
    pub warnings: Vec<String>,
    pub errors: Vec<RunError>,
}

impl SyncResult {
    fn start(conn: &Connection, opts: &SyncOptions) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            connection_id: conn.id,
            restaurant_id: conn.restaurant_id,
            status: RunStatus::Running,
            phase: Phase::Sync,
            incremental: opts.incremental,
            dry_run: opts.dry_run,
            started_at: Utc::now(),
            finished_at: None,
            cleared: None,
            inventory: None,
            orders: None,
            catalog_transform: None,
            sales_transform: None,
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }
}

/// Per-connection entry returned by `sync_all_active`.
#[derive(Debug, Serialize)]
pub struct RunOutcome {
    pub connection_id: i64,
    pub ok: bool,
    pub result: Option<SyncResult>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct Tier2Counts {
    pub inventory_items: i64,
    pub sales_transactions: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub connection_id: i64,
    pub restaurant_id: i64,
    pub is_active: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub latest_tier1_update: Option<DateTime<Utc>>,
    pub tier1: Tier1Counts,
    pub tier2: Tier2Counts,
    pub sync_needed: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub restaurant_id: i64,
    pub tier1: Tier1Counts,
    pub tier2: Tier2Counts,
    /// Tier-2 inventory items per Tier-1 catalog item; `None` when Tier-1 is empty.
    pub item_coverage: Option<f64>,
    pub sales_coverage: Option<f64>,
    pub items_by_category: BTreeMap<String, i64>,
    pub latest_tier2_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Valid,
    NotTransformed,
    Incomplete,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub restaurant_id: i64,
    pub status: ValidationStatus,
    pub tier1_items: i64,
    pub tier2_items: i64,
    pub message: String,
}

fn ratio(num: i64, den: i64) -> Option<f64> {
    (den > 0).then(|| num as f64 / den as f64)
}

/// `sync_needed` and why, given a connection's stamp and its newest Tier-1 write.
fn needs_sync(
    last_sync_at: Option<DateTime<Utc>>,
    latest_tier1: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    staleness: Duration,
) -> Option<String> {
    let Some(last) = last_sync_at else {
        return Some("never synced".to_string());
    };
    if latest_tier1.is_some_and(|t| t > last) {
        return Some("tier-1 data newer than last sync".to_string());
    }
    if now - last > staleness {
        return Some(format!("last sync older than {}h", staleness.num_hours()));
    }
    None
}

fn classify_coverage(tier1: i64, tier2: i64) -> ValidationStatus {
    if tier1 == 0 {
        ValidationStatus::Valid
    } else if tier2 == 0 {
        ValidationStatus::NotTransformed
    } else if tier2 * 100 >= tier1 * VALIDATION_THRESHOLD_PERCENT {
        ValidationStatus::Valid
    } else {
        ValidationStatus::Incomplete
    }
}

#[derive(Clone)]
pub struct SyncOrchestrator {
    db: Db,
    adapter: Arc<dyn PosAdapter>,
    transformer: Arc<DataTransformer>,
    config: OrchestratorConfig,
}

impl SyncOrchestrator {
    pub fn new(
        db: Db,
        adapter: Arc<dyn PosAdapter>,
        transformer: DataTransformer,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            db,
            adapter,
            transformer: Arc::new(transformer),
            config,
        }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Mark the run failed and wrap it into the error returned to the caller.
    fn fail(&self, mut result: SyncResult, err: PosError) -> PosError {
        let phase = result.phase;
        error!(
            run_id = %result.run_id,
            connection_id = result.connection_id,
            %phase,
            kind = err.kind(),
            error = %err,
            "sync run failed"
        );
        let retryable = err.is_retryable();
        result.errors.push(RunError::new(phase, &err));
        result.status = RunStatus::Failed;
        result.finished_at = Some(Utc::now());
        PosError::Sync {
            message: format!("{phase} phase failed for connection {}: {err}", result.connection_id),
            retryable,
            result: Some(Box::new(result)),
        }
    }

    #[instrument(skip(self, opts), fields(run_id = tracing::field::Empty))]
    pub async fn sync_and_transform(
        &self,
        connection_id: i64,
        opts: SyncOptions,
    ) -> Result<SyncResult, PosError> {
        let conn = connections::load_connection(&self.db, connection_id).await?;
        let mut result = SyncResult::start(&conn, &opts);
        tracing::Span::current().record("run_id", tracing::field::display(result.run_id));
        info!(
            restaurant_id = conn.restaurant_id,
            incremental = opts.incremental,
            dry_run = opts.dry_run,
            clear = opts.clear_before_sync,
            "sync run starting"
        );

        if opts.clear_before_sync {
            result.phase = Phase::Clear;
            match purge::clear_provider_data(&self.db, conn.restaurant_id, self.adapter.provider()).await {
                Ok(counts) => result.cleared = Some(counts),
                Err(e) => return Err(self.fail(result, e.into())),
            }
        }

        result.phase = Phase::Sync;
        // A clear wipes Tier-1, so an incremental listing would miss everything unchanged.
        let since = conn.last_sync_at.filter(|_| opts.incremental && !opts.clear_before_sync);
        match self.adapter.sync_inventory(&conn, since).await {
            Ok(report) => result.inventory = Some(report),
            Err(e) => return Err(self.fail(result, e)),
        }

        if opts.include_orders {
            let end = Utc::now();
            let start = since.unwrap_or(end - self.config.order_lookback);
            match self.adapter.sync_orders(&conn, start, end).await {
                Ok(report) => result.orders = Some(report),
                Err(e) => return Err(self.fail(result, e)),
            }
        }

        if opts.transform {
            result.phase = Phase::Transform;
            if let Err(e) = self.run_transform(&conn, &opts, &mut result).await {
                warn!(kind = e.kind(), error = %e, "transform phase failed; keeping synced data");
                result.warnings.push(format!("transform phase failed: {e}"));
                result.errors.push(RunError::new(Phase::Transform, &e));
            }
        }

        result.phase = Phase::Complete;
        result.status = RunStatus::Completed;
        result.finished_at = Some(Utc::now());
        info!(
            warnings = result.warnings.len(),
            elapsed_ms = (Utc::now() - result.started_at).num_milliseconds(),
            "sync run completed"
        );
        Ok(result)
    }

    async fn run_transform(
        &self,
        conn: &Connection,
        opts: &SyncOptions,
        result: &mut SyncResult,
    ) -> Result<(), PosError> {
        let topts = TransformOptions {
            dry_run: opts.dry_run,
        };
        let ceiling = self.config.max_error_rate;

        let items = store::catalog_items_synced_since(&self.db, conn.id, result.started_at).await?;
        let report = self
            .transformer
            .transform_catalog_items(&items, conn.restaurant_id, topts)
            .await?;
        if report.exceeds(ceiling) {
            result.warnings.push(format!(
                "catalog transform error rate {:.1}% exceeds ceiling {:.1}%",
                report.error_rate * 100.0,
                ceiling * 100.0
            ));
        }
        result.catalog_transform = Some(report);

        if opts.include_orders {
            let lines = store::line_items_synced_since(&self.db, conn.id, result.started_at).await?;
            let report = self
                .transformer
                .transform_order_line_items(&lines, conn.restaurant_id, topts)
                .await?;
            if report.exceeds(ceiling) {
                result.warnings.push(format!(
                    "sales transform error rate {:.1}% exceeds ceiling {:.1}%",
                    report.error_rate * 100.0,
                    ceiling * 100.0
                ));
            }
            result.sales_transform = Some(report);
        }
        Ok(())
    }

    /// Run every active connection as its own task. One failure does not affect the others.
    pub async fn sync_all_active(&self, opts: SyncOptions) -> Result<Vec<RunOutcome>, PosError> {
        let conns = connections::list_active_connections(&self.db).await?;
        info!(connections = conns.len(), "syncing all active connections");
        let ids: Vec<i64> = conns.iter().map(|c| c.id).collect();
        let tasks = ids.iter().map(|&connection_id| {
            let this = self.clone();
            tokio::spawn(async move { this.sync_and_transform(connection_id, opts).await })
        });

        let mut outcomes = Vec::with_capacity(ids.len());
        for (connection_id, joined) in ids.iter().copied().zip(join_all(tasks).await) {
            match joined {
                Ok(Ok(result)) => outcomes.push(RunOutcome {
                    connection_id,
                    ok: true,
                    result: Some(result),
                    error: None,
                }),
                Ok(Err(e)) => {
                    let error = Some(e.to_string());
                    let result = match e {
                        PosError::Sync { result, .. } => result.map(|r| *r),
                        _ => None,
                    };
                    outcomes.push(RunOutcome {
                        connection_id,
                        ok: false,
                        result,
                        error,
                    });
                }
                Err(join_err) => {
                    error!(connection_id, error = %join_err, "sync task panicked");
                    outcomes.push(RunOutcome {
                        connection_id,
                        ok: false,
                        result: None,
                        error: Some(format!("sync task aborted: {join_err}")),
                    });
                }
            }
        }
        Ok(outcomes)
    }

    pub async fn get_sync_status(&self, connection_id: i64) -> Result<StatusReport, PosError> {
        let conn = connections::load_connection(&self.db, connection_id).await?;
        let provider = self.adapter.provider();
        let tier1 = store::tier1_counts(&self.db, Scope::Connection(conn.id)).await?;
        let latest = store::latest_tier1_update(&self.db, Scope::Connection(conn.id), &CATALOG_TABLES).await?;
        let tier2 = Tier2Counts {
            inventory_items: unified::count_inventory_items(&self.db, conn.restaurant_id, provider).await?,
            sales_transactions: unified::count_sales_transactions(&self.db, conn.restaurant_id, provider)
                .await?,
        };
        let reason = needs_sync(conn.last_sync_at, latest, Utc::now(), self.config.staleness_threshold);
        Ok(StatusReport {
            connection_id: conn.id,
            restaurant_id: conn.restaurant_id,
            is_active: conn.is_active(),
            last_sync_at: conn.last_sync_at,
            latest_tier1_update: latest,
            tier1,
            tier2,
            sync_needed: reason.is_some(),
            reason,
        })
    }

    pub async fn get_transformation_stats(&self, restaurant_id: i64) -> Result<StatsReport, PosError> {
        let provider = self.adapter.provider();
        let tier1 = store::tier1_counts(&self.db, Scope::Restaurant(restaurant_id)).await?;
        let tier2 = Tier2Counts {
            inventory_items: unified::count_inventory_items(&self.db, restaurant_id, provider).await?,
            sales_transactions: unified::count_sales_transactions(&self.db, restaurant_id, provider).await?,
        };
        Ok(StatsReport {
            restaurant_id,
            tier1,
            tier2,
            item_coverage: ratio(tier2.inventory_items, tier1.catalog_items),
            sales_coverage: ratio(tier2.sales_transactions, tier1.order_line_items),
            items_by_category: unified::inventory_items_by_category(&self.db, restaurant_id, provider).await?,
            latest_tier2_update: unified::latest_tier2_update(&self.db, restaurant_id, provider).await?,
        })
    }

    pub async fn validate_transformation(&self, restaurant_id: i64) -> Result<ValidationReport, PosError> {
        let tier1 = store::tier1_counts(&self.db, Scope::Restaurant(restaurant_id))
            .await?
            .catalog_items;
        let tier2 = unified::count_inventory_items(&self.db, restaurant_id, self.adapter.provider()).await?;
        let status = classify_coverage(tier1, tier2);
        let message = match status {
            ValidationStatus::Valid if tier1 == 0 => "no tier-1 items to transform".to_string(),
            ValidationStatus::Valid => format!("{tier2}/{tier1} items transformed"),
            ValidationStatus::NotTransformed => format!("{tier1} tier-1 items, none transformed"),
            ValidationStatus::Incomplete => format!(
                "{tier2}/{tier1} items transformed, below {VALIDATION_THRESHOLD_PERCENT}%"
            ),
        };
        Ok(ValidationReport {
            restaurant_id,
            status,
            tier1_items: tier1,
            tier2_items: tier2,
            message,
        })
    }

    /// Remove both tiers of this provider's data for a restaurant, atomically.
    pub async fn clear_data(&self, restaurant_id: i64) -> Result<DeletionCounts, PosError> {
        Ok(purge::clear_provider_data(&self.db, restaurant_id, self.adapter.provider()).await?)
    }

    pub async fn health_check(&self, connection_id: i64) -> Result<HealthStatus, PosError> {
        let conn = connections::load_connection(&self.db, connection_id).await?;
        Ok(self.adapter.health_check(&conn).await)
    }

    pub fn teardown(&self) {
        self.adapter.teardown();
        info!("orchestrator torn down");
    }
}
