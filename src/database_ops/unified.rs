//! Tier-2 persistence: provider-neutral rows keyed by
//! (restaurant_id, source_pos_provider, source_pos_id).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::types::Json;

use super::db::Db;

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct InventoryItem {
    pub restaurant_id: i64,
    pub name: String,
    pub category: String,
    pub unit: String,
    pub sku: Option<String>,
    pub current_quantity: f64,
    pub unit_cost: Option<f64>,
    pub is_active: bool,
    pub source_pos_provider: String,
    pub source_pos_id: String,
    pub source_pos_metadata: Json<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct SalesTransaction {
    pub restaurant_id: i64,
    pub order_id: String,
    pub item_name: String,
    pub catalog_object_id: Option<String>,
    pub quantity: f64,
    pub unit_price: Option<f64>,
    pub total_amount: Option<f64>,
    pub currency: Option<String>,
    pub sold_at: Option<DateTime<Utc>>,
    pub source_pos_provider: String,
    pub source_pos_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

async fn exists(db: &Db, table: &str, restaurant_id: i64, provider: &str, source_id: &str) -> Result<bool, sqlx::Error> {
    let found: Option<i64> = sqlx::query_scalar(&format!(
        "SELECT id FROM {table} WHERE restaurant_id = ? AND source_pos_provider = ? AND source_pos_id = ?"
    ))
    .bind(restaurant_id)
    .bind(provider)
    .bind(source_id)
    .fetch_optional(&db.pool)
    .await?;
    Ok(found.is_some())
}

pub async fn upsert_inventory_item(db: &Db, item: &InventoryItem) -> Result<UpsertOutcome, sqlx::Error> {
    let existed = exists(
        db,
        "inventory_items",
        item.restaurant_id,
        &item.source_pos_provider,
        &item.source_pos_id,
    )
    .await?;
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO inventory_items \
         (restaurant_id, name, category, unit, sku, current_quantity, unit_cost, is_active, \
          source_pos_provider, source_pos_id, source_pos_metadata, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (restaurant_id, source_pos_provider, source_pos_id) DO UPDATE SET \
           name = excluded.name, category = excluded.category, unit = excluded.unit, sku = excluded.sku, \
           current_quantity = excluded.current_quantity, unit_cost = excluded.unit_cost, \
           is_active = excluded.is_active, source_pos_metadata = excluded.source_pos_metadata, \
           updated_at = excluded.updated_at",
    )
    .bind(item.restaurant_id)
    .bind(&item.name)
    .bind(&item.category)
    .bind(&item.unit)
    .bind(&item.sku)
    .bind(item.current_quantity)
    .bind(item.unit_cost)
    .bind(item.is_active)
    .bind(&item.source_pos_provider)
    .bind(&item.source_pos_id)
    .bind(&item.source_pos_metadata)
    .bind(now)
    .bind(now)
    .execute(&db.pool)
    .await?;
    Ok(if existed {
        UpsertOutcome::Updated
    } else {
        UpsertOutcome::Inserted
    })
}

pub async fn upsert_sales_transaction(db: &Db, tx: &SalesTransaction) -> Result<UpsertOutcome, sqlx::Error> {
    let existed = exists(
        db,
        "sales_transactions",
        tx.restaurant_id,
        &tx.source_pos_provider,
        &tx.source_pos_id,
    )
    .await?;
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO sales_transactions \
         (restaurant_id, order_id, item_name, catalog_object_id, quantity, unit_price, total_amount, \
          currency, sold_at, source_pos_provider, source_pos_id, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (restaurant_id, source_pos_provider, source_pos_id) DO UPDATE SET \
           order_id = excluded.order_id, item_name = excluded.item_name, \
           catalog_object_id = excluded.catalog_object_id, quantity = excluded.quantity, \
           unit_price = excluded.unit_price, total_amount = excluded.total_amount, \
           currency = excluded.currency, sold_at = excluded.sold_at, updated_at = excluded.updated_at",
    )
    .bind(tx.restaurant_id)
    .bind(&tx.order_id)
    .bind(&tx.item_name)
    .bind(&tx.catalog_object_id)
    .bind(tx.quantity)
    .bind(tx.unit_price)
    .bind(tx.total_amount)
    .bind(&tx.currency)
    .bind(tx.sold_at)
    .bind(&tx.source_pos_provider)
    .bind(&tx.source_pos_id)
    .bind(now)
    .bind(now)
    .execute(&db.pool)
    .await?;
    Ok(if existed {
        UpsertOutcome::Updated
    } else {
        UpsertOutcome::Inserted
    })
}

pub async fn find_inventory_item(
    db: &Db,
    restaurant_id: i64,
    provider: &str,
    source_id: &str,
) -> Result<Option<InventoryItem>, sqlx::Error> {
    sqlx::query_as::<_, InventoryItem>(
        "SELECT restaurant_id, name, category, unit, sku, current_quantity, unit_cost, is_active, \
         source_pos_provider, source_pos_id, source_pos_metadata FROM inventory_items \
         WHERE restaurant_id = ? AND source_pos_provider = ? AND source_pos_id = ?",
    )
    .bind(restaurant_id)
    .bind(provider)
    .bind(source_id)
    .fetch_optional(&db.pool)
    .await
}

pub async fn count_inventory_items(db: &Db, restaurant_id: i64, provider: &str) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM inventory_items WHERE restaurant_id = ? AND source_pos_provider = ?",
    )
    .bind(restaurant_id)
    .bind(provider)
    .fetch_one(&db.pool)
    .await
}

pub async fn count_sales_transactions(db: &Db, restaurant_id: i64, provider: &str) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM sales_transactions WHERE restaurant_id = ? AND source_pos_provider = ?",
    )
    .bind(restaurant_id)
    .bind(provider)
    .fetch_one(&db.pool)
    .await
}

pub async fn inventory_items_by_category(
    db: &Db,
    restaurant_id: i64,
    provider: &str,
) -> Result<BTreeMap<String, i64>, sqlx::Error> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT category, COUNT(*) FROM inventory_items \
         WHERE restaurant_id = ? AND source_pos_provider = ? GROUP BY category",
    )
    .bind(restaurant_id)
    .bind(provider)
    .fetch_all(&db.pool)
    .await?;
    Ok(rows.into_iter().collect())
}

/// Latest `updated_at` across both Tier-2 tables.
pub async fn latest_tier2_update(
    db: &Db,
    restaurant_id: i64,
    provider: &str,
) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
    let mut latest = None;
    for table in ["inventory_items", "sales_transactions"] {
        let ts: Option<DateTime<Utc>> = sqlx::query_scalar(&format!(
            "SELECT updated_at FROM {table} WHERE restaurant_id = ? AND source_pos_provider = ? \
             ORDER BY updated_at DESC LIMIT 1"
        ))
        .bind(restaurant_id)
        .bind(provider)
        .fetch_optional(&db.pool)
        .await?;
        latest = latest.max(ts);
    }
    Ok(latest)
}
