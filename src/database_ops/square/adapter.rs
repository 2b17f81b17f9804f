use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::client::SquareClient;
use super::models::{
    next_cursor, BatchRetrieveCountsRequest, CatalogObject, InventoryCount, Order,
    SearchCatalogRequest, SearchOrdersRequest, OBJECT_TYPE_CATEGORY, OBJECT_TYPE_ITEM,
};
use super::store;
use crate::database_ops::connections::{self, Connection, PROVIDER_SQUARE};
use crate::database_ops::db::Db;
use crate::database_ops::provider::{
    HealthStatus, InventorySyncReport, ItemError, OrderSyncReport, PosAdapter,
};
use crate::error::{ApiError, PosError};
use crate::net::{RateLimiter, RateLimiterStats, RetryPolicy, RetryStats};

/// Square's hard cap on ids per inventory batch-retrieve call.
pub const MAX_INVENTORY_BATCH: usize = 100;

#[derive(Debug, Clone)]
pub struct SquareAdapterConfig {
    pub inventory_batch_size: usize,
    pub catalog_page_limit: u32,
    pub order_page_limit: u32,
}

impl Default for SquareAdapterConfig {
    fn default() -> Self {
        Self {
            inventory_batch_size: MAX_INVENTORY_BATCH,
            catalog_page_limit: 100,
            order_page_limit: 100,
        }
    }
}

pub struct SquareAdapter {
    db: Db,
    client: SquareClient,
    limiter: Arc<RateLimiter>,
    retry: Arc<RetryPolicy>,
    config: SquareAdapterConfig,
}

fn ensure_usable(conn: &Connection) -> Result<(), PosError> {
    if !conn.is_active() {
        return Err(PosError::Auth(format!("connection {} is inactive", conn.id)));
    }
    if conn.is_token_expired() {
        return Err(PosError::Token(format!(
            "access token for connection {} has expired",
            conn.id
        )));
    }
    Ok(())
}

fn describe_raw(raw: &Value, fallback_type: &str) -> (String, String) {
    let id = raw
        .get("id")
        .or_else(|| raw.get("catalog_object_id"))
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let object_type = raw
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or(fallback_type)
        .to_string();
    (id, object_type)
}

impl SquareAdapter {
    pub fn new(
        db: Db,
        client: SquareClient,
        limiter: RateLimiter,
        retry: RetryPolicy,
        mut config: SquareAdapterConfig,
    ) -> Self {
        config.inventory_batch_size = config.inventory_batch_size.clamp(1, MAX_INVENTORY_BATCH);
        Self {
            db,
            client,
            limiter: Arc::new(limiter),
            retry: Arc::new(retry),
            config,
        }
    }

    pub fn config(&self) -> &SquareAdapterConfig {
        &self.config
    }

    pub fn limiter_stats(&self) -> RateLimiterStats {
        self.limiter.stats()
    }

    pub fn retry_stats(&self) -> RetryStats {
        self.retry.stats()
    }

    /// Every outbound call: retry around (throttle, then call).
    async fn call<T, F, Fut>(&self, conn: &Connection, op: &str, f: F) -> Result<T, ApiError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let key = conn.limiter_key();
        let key = key.as_str();
        let limiter = &self.limiter;
        let f = &f;
        self.retry
            .execute_with_retry(op, move || async move {
                limiter.acquire_token(key).await;
                f().await
            })
            .await
    }

    async fn resolve_locations(&self, conn: &Connection) -> Result<Vec<String>, PosError> {
        if let Some(loc) = conn.location_id.as_deref().filter(|l| !l.is_empty()) {
            return Ok(vec![loc.to_string()]);
        }
        let client = &self.client;
        let token = conn.access_token.as_str();
        let locations = self
            .call(conn, "locations.list", move || client.list_locations(token))
            .await?;
        let ids: Vec<String> = locations
            .into_iter()
            .filter(|l| l.is_active())
            .map(|l| l.id)
            .collect();
        if ids.is_empty() {
            warn!(connection_id = conn.id, "no active locations");
        }
        Ok(ids)
    }

    /// Persist one catalog object. Failures land in `report.errors`.
    async fn store_catalog_object(
        &self,
        conn: &Connection,
        raw: &Value,
        synced_at: DateTime<Utc>,
        report: &mut InventorySyncReport,
        trackable: &mut Vec<String>,
        seen: &mut HashSet<String>,
    ) {
        let obj: CatalogObject = match serde_json::from_value(raw.clone()) {
            Ok(obj) => obj,
            Err(e) => {
                let (id, object_type) = describe_raw(raw, "UNKNOWN");
                warn!(connection_id = conn.id, object_id = %id, error = %e, "malformed catalog object");
                report.errors.push(ItemError::new(id, object_type, format!("malformed object: {e}")));
                return;
            }
        };
        let db = &self.db;
        let location = conn.location_id.as_deref();
        let obj_ref = &obj;
        let result = match obj.object_type.as_str() {
            OBJECT_TYPE_CATEGORY => self
                .retry
                .execute_with_retry("square_categories.upsert", move || {
                    store::upsert_category(db, conn.id, location, obj_ref, raw, synced_at)
                })
                .await
                .map(|_| report.categories += 1),
            OBJECT_TYPE_ITEM => self
                .retry
                .execute_with_retry("square_catalog_items.upsert", move || {
                    store::upsert_catalog_item(db, conn.id, location, obj_ref, raw, synced_at)
                })
                .await
                .map(|_| {
                    report.items += 1;
                    if obj.is_deleted {
                        return;
                    }
                    if let Some(data) = &obj.item_data {
                        report.variations += data.variations.len();
                        for v in data.variations.iter().filter(|v| v.is_trackable()) {
                            if seen.insert(v.id.clone()) {
                                trackable.push(v.id.clone());
                            }
                        }
                    }
                }),
            other => {
                debug!(object_type = other, object_id = %obj.id, "skipping catalog object");
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!(connection_id = conn.id, object_id = %obj.id, error = %e, "catalog upsert failed");
            report
                .errors
                .push(ItemError::new(obj.id.clone(), obj.object_type.clone(), e.to_string()));
        }
    }

    async fn sync_catalog(
        &self,
        conn: &Connection,
        since: Option<DateTime<Utc>>,
        synced_at: DateTime<Utc>,
        report: &mut InventorySyncReport,
    ) -> Result<Vec<String>, PosError> {
        let client = &self.client;
        let token = conn.access_token.as_str();
        let mut trackable = Vec::new();
        let mut seen = HashSet::new();
        let mut seen_cursors = HashSet::new();
        let mut cursor: Option<String> = None;
        loop {
            let req = SearchCatalogRequest {
                object_types: vec![OBJECT_TYPE_ITEM.to_string(), OBJECT_TYPE_CATEGORY.to_string()],
                cursor: cursor.clone(),
                begin_time: since.map(|t| t.to_rfc3339()),
                include_deleted_objects: since.is_some(),
                limit: Some(self.config.catalog_page_limit),
            };
            let req = &req;
            let page = self
                .call(conn, "catalog.search", move || client.search_catalog(token, req))
                .await?;
            report.pages += 1;
            debug!(page = report.pages, objects = page.objects.len(), "catalog page");
            if page.objects.is_empty() {
                break;
            }
            for raw in &page.objects {
                self.store_catalog_object(conn, raw, synced_at, report, &mut trackable, &mut seen)
                    .await;
            }
            match next_cursor(page.cursor.as_ref(), &mut seen_cursors) {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(trackable)
    }

    async fn sync_counts(
        &self,
        conn: &Connection,
        variation_ids: &[String],
        locations: &[String],
        synced_at: DateTime<Utc>,
        report: &mut InventorySyncReport,
    ) -> Result<(), PosError> {
        let client = &self.client;
        let token = conn.access_token.as_str();
        let db = &self.db;
        for chunk in variation_ids.chunks(self.config.inventory_batch_size) {
            report.batches += 1;
            let mut seen_cursors = HashSet::new();
            let mut cursor: Option<String> = None;
            loop {
                let req = BatchRetrieveCountsRequest {
                    catalog_object_ids: chunk.to_vec(),
                    location_ids: locations.to_vec(),
                    cursor: cursor.clone(),
                };
                let req = &req;
                let page = self
                    .call(conn, "inventory.batch_retrieve", move || {
                        client.batch_retrieve_inventory_counts(token, req)
                    })
                    .await?;
                for raw in &page.counts {
                    let count: InventoryCount = match serde_json::from_value(raw.clone()) {
                        Ok(c) => c,
                        Err(e) => {
                            let (id, _) = describe_raw(raw, "INVENTORY_COUNT");
                            report.errors.push(ItemError::new(
                                id,
                                "INVENTORY_COUNT",
                                format!("malformed count: {e}"),
                            ));
                            continue;
                        }
                    };
                    let count_ref = &count;
                    match self
                        .retry
                        .execute_with_retry("square_inventory_counts.upsert", move || {
                            store::upsert_inventory_count(db, conn.id, count_ref, raw, synced_at)
                        })
                        .await
                    {
                        Ok(()) => report.inventory_counts += 1,
                        Err(e) => {
                            warn!(object_id = %count.catalog_object_id, error = %e, "count upsert failed");
                            report.errors.push(ItemError::new(
                                count.catalog_object_id.clone(),
                                "INVENTORY_COUNT",
                                e.to_string(),
                            ));
                        }
                    }
                }
                match next_cursor(page.cursor.as_ref(), &mut seen_cursors) {
                    Some(next) if !page.counts.is_empty() => cursor = Some(next),
                    _ => break,
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PosAdapter for SquareAdapter {
    fn provider(&self) -> &'static str {
        PROVIDER_SQUARE
    }

    #[instrument(skip(self, conn), fields(connection_id = conn.id, restaurant_id = conn.restaurant_id))]
    async fn sync_inventory(
        &self,
        conn: &Connection,
        since: Option<DateTime<Utc>>,
    ) -> Result<InventorySyncReport, PosError> {
        ensure_usable(conn)?;
        let started = Utc::now();
        let mut report = InventorySyncReport {
            incremental: since.is_some(),
            ..Default::default()
        };
        info!(incremental = report.incremental, "inventory sync starting");

        let locations = self.resolve_locations(conn).await?;
        report.locations = locations.clone();

        let trackable = self.sync_catalog(conn, since, started, &mut report).await?;
        self.sync_counts(conn, &trackable, &locations, started, &mut report)
            .await?;

        connections::update_last_sync_at(&self.db, conn.id, started).await?;
        info!(
            categories = report.categories,
            items = report.items,
            variations = report.variations,
            inventory_counts = report.inventory_counts,
            pages = report.pages,
            batches = report.batches,
            errors = report.errors.len(),
            elapsed_ms = (Utc::now() - started).num_milliseconds(),
            "inventory sync finished"
        );
        Ok(report)
    }

    #[instrument(skip(self, conn), fields(connection_id = conn.id))]
    async fn sync_orders(
        &self,
        conn: &Connection,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<OrderSyncReport, PosError> {
        ensure_usable(conn)?;
        let synced_at = Utc::now();
        let mut report = OrderSyncReport::default();
        let locations = self.resolve_locations(conn).await?;
        if locations.is_empty() {
            return Ok(report);
        }

        let client = &self.client;
        let token = conn.access_token.as_str();
        let db = &self.db;
        let mut seen_cursors = HashSet::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut req = SearchOrdersRequest::updated_between(
                locations.clone(),
                start,
                end,
                self.config.order_page_limit,
            );
            req.cursor = cursor.clone();
            let req = &req;
            let page = self
                .call(conn, "orders.search", move || client.search_orders(token, req))
                .await?;
            report.pages += 1;
            if page.orders.is_empty() {
                break;
            }
            for raw in &page.orders {
                let order: Order = match serde_json::from_value(raw.clone()) {
                    Ok(o) => o,
                    Err(e) => {
                        let (id, _) = describe_raw(raw, "ORDER");
                        report
                            .errors
                            .push(ItemError::new(id, "ORDER", format!("malformed order: {e}")));
                        continue;
                    }
                };
                let order_ref = &order;
                match self
                    .retry
                    .execute_with_retry("square_orders.upsert", move || {
                        store::upsert_order(db, conn.id, order_ref, raw, synced_at)
                    })
                    .await
                {
                    Ok(lines) => {
                        report.orders += 1;
                        report.line_items += lines;
                    }
                    Err(e) => {
                        warn!(order_id = %order.id, error = %e, "order upsert failed");
                        report
                            .errors
                            .push(ItemError::new(order.id.clone(), "ORDER", e.to_string()));
                    }
                }
            }
            match next_cursor(page.cursor.as_ref(), &mut seen_cursors) {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        info!(
            orders = report.orders,
            line_items = report.line_items,
            pages = report.pages,
            errors = report.errors.len(),
            "order sync finished"
        );
        Ok(report)
    }

    async fn health_check(&self, conn: &Connection) -> HealthStatus {
        if let Err(e) = ensure_usable(conn) {
            return HealthStatus::unhealthy(e.to_string());
        }
        let client = &self.client;
        let token = conn.access_token.as_str();
        match self
            .call(conn, "merchants.retrieve", move || client.retrieve_merchant(token))
            .await
        {
            Ok(merchant) => HealthStatus::healthy(merchant.id),
            Err(e) => {
                let err = PosError::from(e);
                warn!(connection_id = conn.id, kind = err.kind(), error = %err, "health check failed");
                HealthStatus::unhealthy(err.to_string())
            }
        }
    }

    fn teardown(&self) {
        self.limiter.clear_all();
    }
}
