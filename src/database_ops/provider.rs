//! Adapter contract shared by POS providers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::connections::Connection;
use crate::error::PosError;

/// One object that could not be synced. The rest of the run continues.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ItemError {
    pub object_id: String,
    pub object_type: String,
    pub message: String,
}

impl ItemError {
    pub fn new(object_id: impl Into<String>, object_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            object_id: object_id.into(),
            object_type: object_type.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct InventorySyncReport {
    pub locations: Vec<String>,
    pub categories: usize,
    pub items: usize,
    pub variations: usize,
    pub inventory_counts: usize,
    pub pages: usize,
    pub batches: usize,
    pub incremental: bool,
    pub errors: Vec<ItemError>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OrderSyncReport {
    pub orders: usize,
    pub line_items: usize,
    pub pages: usize,
    pub errors: Vec<ItemError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub reason: Option<String>,
    pub merchant_id: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl HealthStatus {
    pub fn healthy(merchant_id: impl Into<String>) -> Self {
        Self {
            healthy: true,
            reason: None,
            merchant_id: Some(merchant_id.into()),
            checked_at: Utc::now(),
        }
    }

    pub fn unhealthy(reason: impl Into<String>) -> Self {
        Self {
            healthy: false,
            reason: Some(reason.into()),
            merchant_id: None,
            checked_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait PosAdapter: Send + Sync {
    /// Value stored in `source_pos_provider` and `pos_connections.provider`.
    fn provider(&self) -> &'static str;

    /// Pull catalog and inventory counts into Tier-1. `since` makes the
    /// catalog listing incremental.
    async fn sync_inventory(
        &self,
        conn: &Connection,
        since: Option<DateTime<Utc>>,
    ) -> Result<InventorySyncReport, PosError>;

    /// Pull orders updated in `[start, end]` into Tier-1.
    async fn sync_orders(
        &self,
        conn: &Connection,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<OrderSyncReport, PosError>;

    /// Never errors; failures are reported as an unhealthy status.
    async fn health_check(&self, conn: &Connection) -> HealthStatus;

    /// Drop per-connection throttling state.
    fn teardown(&self) {}
}
