//! Operator-initiated removal of a restaurant's provider data, both tiers at once.

use serde::Serialize;
use tracing::{info, instrument};

use super::db::Db;

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct DeletionCounts {
    pub sales_transactions: u64,
    pub inventory_items: u64,
    pub order_line_items: u64,
    pub orders: u64,
    pub inventory_counts: u64,
    pub catalog_items: u64,
    pub categories: u64,
}

impl DeletionCounts {
    pub fn total(&self) -> u64 {
        self.sales_transactions
            + self.inventory_items
            + self.order_line_items
            + self.orders
            + self.inventory_counts
            + self.catalog_items
            + self.categories
    }
}

/// Delete Tier-2 rows sourced from `provider`, then every Tier-1 row owned by
/// the restaurant's `provider` connections. All or nothing.
#[instrument(skip(db))]
pub async fn clear_provider_data(
    db: &Db,
    restaurant_id: i64,
    provider: &str,
) -> Result<DeletionCounts, sqlx::Error> {
    let mut tx = db.pool.begin().await?;
    let mut counts = DeletionCounts::default();

    for (table, slot) in [
        ("sales_transactions", &mut counts.sales_transactions),
        ("inventory_items", &mut counts.inventory_items),
    ] {
        *slot = sqlx::query(&format!(
            "DELETE FROM {table} WHERE restaurant_id = ? AND source_pos_provider = ?"
        ))
        .bind(restaurant_id)
        .bind(provider)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    }

    for (table, slot) in [
        ("square_order_line_items", &mut counts.order_line_items),
        ("square_orders", &mut counts.orders),
        ("square_inventory_counts", &mut counts.inventory_counts),
        ("square_catalog_items", &mut counts.catalog_items),
        ("square_categories", &mut counts.categories),
    ] {
        *slot = sqlx::query(&format!(
            "DELETE FROM {table} WHERE connection_id IN \
             (SELECT id FROM pos_connections WHERE restaurant_id = ? AND provider = ?)"
        ))
        .bind(restaurant_id)
        .bind(provider)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    }

    tx.commit().await?;
    info!(restaurant_id, provider, deleted = counts.total(), "cleared provider data");
    Ok(counts)
}
