//! Tier-1 -> Tier-2 transformation.
//!
//! Single-record failures are collected in the report and never abort the
//! batch. Whether the resulting error rate is acceptable is the caller's call
//! (see [`TransformReport::exceeds`]).

pub mod inventory;
pub mod sales;

use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::database_ops::db::Db;
use crate::database_ops::square::store::{self, SquareCatalogItem, SquareOrderLineItem};
use crate::database_ops::unified::{self, UpsertOutcome};
use crate::error::PosError;
use crate::normalization::{CategoryMapper, UnitMapper};
use inventory::{map_catalog_item, CatalogLookups};
use sales::{line_item_source_id, map_line_item};

#[derive(Debug, Clone, Copy, Default)]
pub struct TransformOptions {
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct TransformConfig {
    /// Progress-logging granularity only.
    pub batch_size: usize,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self { batch_size: 500 }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TransformError {
    pub source_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TransformReport {
    pub total: usize,
    pub success_count: usize,
    pub error_count: usize,
    pub created: usize,
    pub updated: usize,
    pub error_rate: f64,
    pub dry_run: bool,
    pub errors: Vec<TransformError>,
}

impl TransformReport {
    fn new(total: usize, dry_run: bool) -> Self {
        Self {
            total,
            dry_run,
            ..Default::default()
        }
    }

    fn record_error(&mut self, source_id: impl Into<String>, reason: impl Into<String>) {
        self.error_count += 1;
        self.errors.push(TransformError {
            source_id: source_id.into(),
            reason: reason.into(),
        });
    }

    fn record_success(&mut self, outcome: Option<UpsertOutcome>) {
        self.success_count += 1;
        match outcome {
            Some(UpsertOutcome::Inserted) => self.created += 1,
            Some(UpsertOutcome::Updated) => self.updated += 1,
            None => {}
        }
    }

    fn finish(mut self) -> Self {
        self.error_rate = if self.total == 0 {
            0.0
        } else {
            self.error_count as f64 / self.total as f64
        };
        self
    }

    pub fn exceeds(&self, ceiling: f64) -> bool {
        self.error_rate > ceiling
    }
}

pub struct DataTransformer {
    db: Db,
    categories: CategoryMapper,
    units: UnitMapper,
    config: TransformConfig,
}

impl DataTransformer {
    pub fn new(db: Db, config: TransformConfig) -> Self {
        Self::with_mappers(db, config, CategoryMapper::with_defaults(), UnitMapper::with_defaults())
    }

    pub fn with_mappers(
        db: Db,
        mut config: TransformConfig,
        categories: CategoryMapper,
        units: UnitMapper,
    ) -> Self {
        config.batch_size = config.batch_size.max(1);
        Self {
            db,
            categories,
            units,
            config,
        }
    }

    async fn load_lookups(&self, connection_id: i64) -> Result<CatalogLookups, PosError> {
        Ok(CatalogLookups {
            category_names: store::category_names(&self.db, connection_id).await?,
            in_stock: store::in_stock_quantities(&self.db, connection_id).await?,
        })
    }

    #[instrument(skip(self, items), fields(total = items.len()))]
    pub async fn transform_catalog_items(
        &self,
        items: &[SquareCatalogItem],
        restaurant_id: i64,
        opts: TransformOptions,
    ) -> Result<TransformReport, PosError> {
        let mut lookups: HashMap<i64, CatalogLookups> = HashMap::new();
        for item in items {
            if !lookups.contains_key(&item.connection_id) {
                let loaded = self.load_lookups(item.connection_id).await?;
                lookups.insert(item.connection_id, loaded);
            }
        }

        let mut report = TransformReport::new(items.len(), opts.dry_run);
        for (batch_no, batch) in items.chunks(self.config.batch_size).enumerate() {
            for item in batch {
                let source_id = &item.square_catalog_object_id;
                let Some(lk) = lookups.get(&item.connection_id) else {
                    report.record_error(source_id, "lookups unavailable");
                    continue;
                };
                let mapped =
                    match map_catalog_item(item, restaurant_id, lk, &self.categories, &self.units) {
                        Ok(m) => m,
                        Err(reason) => {
                            debug!(source_id = %source_id, reason = %reason, "catalog item rejected");
                            report.record_error(source_id, reason);
                            continue;
                        }
                    };
                if opts.dry_run {
                    report.record_success(None);
                    continue;
                }
                match unified::upsert_inventory_item(&self.db, &mapped).await {
                    Ok(outcome) => report.record_success(Some(outcome)),
                    Err(e) => {
                        warn!(source_id = %source_id, error = %e, "inventory item upsert failed");
                        report.record_error(source_id, e.to_string());
                    }
                }
            }
            debug!(
                batch = batch_no + 1,
                processed = report.success_count + report.error_count,
                total = report.total,
                "catalog transform progress"
            );
        }

        let report = report.finish();
        info!(
            restaurant_id,
            total = report.total,
            success = report.success_count,
            errors = report.error_count,
            error_rate = report.error_rate,
            dry_run = opts.dry_run,
            "catalog items transformed"
        );
        Ok(report)
    }

    #[instrument(skip(self, lines), fields(total = lines.len()))]
    pub async fn transform_order_line_items(
        &self,
        lines: &[SquareOrderLineItem],
        restaurant_id: i64,
        opts: TransformOptions,
    ) -> Result<TransformReport, PosError> {
        let mut report = TransformReport::new(lines.len(), opts.dry_run);
        for (batch_no, batch) in lines.chunks(self.config.batch_size).enumerate() {
            for line in batch {
                let mapped = match map_line_item(line, restaurant_id) {
                    Ok(m) => m,
                    Err(reason) => {
                        report.record_error(line_item_source_id(line), reason);
                        continue;
                    }
                };
                if opts.dry_run {
                    report.record_success(None);
                    continue;
                }
                match unified::upsert_sales_transaction(&self.db, &mapped).await {
                    Ok(outcome) => report.record_success(Some(outcome)),
                    Err(e) => {
                        warn!(source_id = %mapped.source_pos_id, error = %e, "sales upsert failed");
                        report.record_error(mapped.source_pos_id.clone(), e.to_string());
                    }
                }
            }
            debug!(batch = batch_no + 1, total = report.total, "line item transform progress");
        }

        let report = report.finish();
        info!(
            restaurant_id,
            total = report.total,
            success = report.success_count,
            errors = report.error_count,
            error_rate = report.error_rate,
            "order line items transformed"
        );
        Ok(report)
    }
}
