//! Tier-1 persistence: provider-exact rows keyed by Square object ids.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::types::Json;

use super::models::{
    parse_quantity, CatalogObject, CatalogVariation, InventoryCount, Order, STATE_IN_STOCK,
};
use crate::database_ops::db::Db;

/// Tier-1 tables in dependency-safe delete order.
pub const TIER1_TABLES: [&str; 5] = [
    "square_order_line_items",
    "square_orders",
    "square_inventory_counts",
    "square_catalog_items",
    "square_categories",
];

/// Tables refreshed by an inventory sync, i.e. the ones `last_sync_at` vouches for.
pub const CATALOG_TABLES: [&str; 3] = [
    "square_categories",
    "square_catalog_items",
    "square_inventory_counts",
];

/// Which connections a Tier-1 query covers.
#[derive(Debug, Clone, Copy)]
pub enum Scope {
    Connection(i64),
    Restaurant(i64),
}

impl Scope {
    fn filter(self) -> &'static str {
        match self {
            Scope::Connection(_) => "connection_id = ?",
            Scope::Restaurant(_) => {
                "connection_id IN (SELECT id FROM pos_connections WHERE restaurant_id = ?)"
            }
        }
    }

    fn value(self) -> i64 {
        match self {
            Scope::Connection(id) | Scope::Restaurant(id) => id,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SquareCatalogItem {
    pub id: i64,
    pub connection_id: i64,
    pub location_id: Option<String>,
    pub square_catalog_object_id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub category_id: Option<String>,
    pub variations: Json<Vec<CatalogVariation>>,
    pub is_deleted: bool,
    pub version: Option<i64>,
    pub square_updated_at: Option<DateTime<Utc>>,
    pub last_synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SquareOrderLineItem {
    pub id: i64,
    pub connection_id: i64,
    pub square_order_id: String,
    pub uid: String,
    pub catalog_object_id: Option<String>,
    pub name: Option<String>,
    pub variation_name: Option<String>,
    pub quantity: String,
    pub base_price_amount: Option<i64>,
    pub gross_sales_amount: Option<i64>,
    pub currency: Option<String>,
    pub order_closed_at: Option<DateTime<Utc>>,
    pub last_synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct Tier1Counts {
    pub categories: i64,
    pub catalog_items: i64,
    pub inventory_counts: i64,
    pub orders: i64,
    pub order_line_items: i64,
}

pub async fn upsert_category(
    db: &Db,
    connection_id: i64,
    location_id: Option<&str>,
    obj: &CatalogObject,
    raw: &Value,
    synced_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    let name = obj.category_data.as_ref().and_then(|c| c.name.clone());
    sqlx::query(
        "INSERT INTO square_categories \
         (connection_id, location_id, square_catalog_object_id, name, is_deleted, version, raw_data, square_updated_at, last_synced_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (connection_id, square_catalog_object_id) DO UPDATE SET \
           location_id = excluded.location_id, name = excluded.name, is_deleted = excluded.is_deleted, \
           version = excluded.version, raw_data = excluded.raw_data, \
           square_updated_at = excluded.square_updated_at, last_synced_at = excluded.last_synced_at",
    )
    .bind(connection_id)
    .bind(location_id)
    .bind(&obj.id)
    .bind(name)
    .bind(obj.is_deleted)
    .bind(obj.version)
    .bind(Json(raw))
    .bind(obj.updated_at)
    .bind(synced_at)
    .execute(&db.pool)
    .await?;
    Ok(())
}

pub async fn upsert_catalog_item(
    db: &Db,
    connection_id: i64,
    location_id: Option<&str>,
    obj: &CatalogObject,
    raw: &Value,
    synced_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    let data = obj.item_data.as_ref();
    let variations: Vec<CatalogVariation> = data.map(|d| d.variations.clone()).unwrap_or_default();
    sqlx::query(
        "INSERT INTO square_catalog_items \
         (connection_id, location_id, square_catalog_object_id, name, description, category_id, variations, \
          is_deleted, version, raw_data, square_updated_at, last_synced_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (connection_id, square_catalog_object_id) DO UPDATE SET \
           location_id = excluded.location_id, name = excluded.name, description = excluded.description, \
           category_id = excluded.category_id, variations = excluded.variations, is_deleted = excluded.is_deleted, \
           version = excluded.version, raw_data = excluded.raw_data, \
           square_updated_at = excluded.square_updated_at, last_synced_at = excluded.last_synced_at",
    )
    .bind(connection_id)
    .bind(location_id)
    .bind(&obj.id)
    .bind(data.and_then(|d| d.name.clone()))
    .bind(data.and_then(|d| d.description.clone()))
    .bind(data.and_then(|d| d.primary_category_id().map(str::to_string)))
    .bind(Json(variations))
    .bind(obj.is_deleted)
    .bind(obj.version)
    .bind(Json(raw))
    .bind(obj.updated_at)
    .bind(synced_at)
    .execute(&db.pool)
    .await?;
    Ok(())
}

pub async fn upsert_inventory_count(
    db: &Db,
    connection_id: i64,
    count: &InventoryCount,
    raw: &Value,
    synced_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    let quantity = count.quantity.as_deref().and_then(parse_quantity);
    sqlx::query(
        "INSERT INTO square_inventory_counts \
         (connection_id, square_catalog_object_id, catalog_object_type, location_id, state, quantity, calculated_at, raw_data, last_synced_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (connection_id, square_catalog_object_id, location_id, state) DO UPDATE SET \
           catalog_object_type = excluded.catalog_object_type, quantity = excluded.quantity, \
           calculated_at = excluded.calculated_at, raw_data = excluded.raw_data, last_synced_at = excluded.last_synced_at",
    )
    .bind(connection_id)
    .bind(&count.catalog_object_id)
    .bind(&count.catalog_object_type)
    .bind(&count.location_id)
    .bind(&count.state)
    .bind(quantity)
    .bind(count.calculated_at)
    .bind(Json(raw))
    .bind(synced_at)
    .execute(&db.pool)
    .await?;
    Ok(())
}

/// Upsert an order and its line items together. Returns the number of line items written.
pub async fn upsert_order(
    db: &Db,
    connection_id: i64,
    order: &Order,
    raw: &Value,
    synced_at: DateTime<Utc>,
) -> Result<usize, sqlx::Error> {
    let mut tx = db.pool.begin().await?;
    let total = order.total_money.as_ref();
    sqlx::query(
        "INSERT INTO square_orders \
         (connection_id, location_id, square_order_id, state, total_money_amount, currency, \
          square_created_at, square_updated_at, closed_at, raw_data, last_synced_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (connection_id, square_order_id) DO UPDATE SET \
           location_id = excluded.location_id, state = excluded.state, \
           total_money_amount = excluded.total_money_amount, currency = excluded.currency, \
           square_created_at = excluded.square_created_at, square_updated_at = excluded.square_updated_at, \
           closed_at = excluded.closed_at, raw_data = excluded.raw_data, last_synced_at = excluded.last_synced_at",
    )
    .bind(connection_id)
    .bind(&order.location_id)
    .bind(&order.id)
    .bind(&order.state)
    .bind(total.and_then(|m| m.amount))
    .bind(total.and_then(|m| m.currency.clone()))
    .bind(order.created_at)
    .bind(order.updated_at)
    .bind(order.closed_at)
    .bind(Json(raw))
    .bind(synced_at)
    .execute(&mut *tx)
    .await?;

    for line in &order.line_items {
        let line_raw = serde_json::to_value(line).unwrap_or(Value::Null);
        let base = line.base_price_money.as_ref();
        let gross = line.gross_sales_money.as_ref().or(line.total_money.as_ref());
        let currency = base
            .and_then(|m| m.currency.clone())
            .or_else(|| gross.and_then(|m| m.currency.clone()));
        sqlx::query(
            "INSERT INTO square_order_line_items \
             (connection_id, square_order_id, uid, catalog_object_id, name, variation_name, quantity, \
              base_price_amount, gross_sales_amount, currency, order_closed_at, raw_data, last_synced_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (connection_id, square_order_id, uid) DO UPDATE SET \
               catalog_object_id = excluded.catalog_object_id, name = excluded.name, \
               variation_name = excluded.variation_name, quantity = excluded.quantity, \
               base_price_amount = excluded.base_price_amount, gross_sales_amount = excluded.gross_sales_amount, \
               currency = excluded.currency, order_closed_at = excluded.order_closed_at, \
               raw_data = excluded.raw_data, last_synced_at = excluded.last_synced_at",
        )
        .bind(connection_id)
        .bind(&order.id)
        .bind(&line.uid)
        .bind(&line.catalog_object_id)
        .bind(&line.name)
        .bind(&line.variation_name)
        .bind(&line.quantity)
        .bind(base.and_then(|m| m.amount))
        .bind(gross.and_then(|m| m.amount))
        .bind(currency)
        .bind(order.closed_at.or(order.updated_at))
        .bind(Json(line_raw))
        .bind(synced_at)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(order.line_items.len())
}

const SELECT_ITEM: &str = "SELECT id, connection_id, location_id, square_catalog_object_id, name, description, \
     category_id, variations, is_deleted, version, square_updated_at, last_synced_at FROM square_catalog_items";

/// Items written for `connection_id` at or after `since` (i.e. by the current run).
pub async fn catalog_items_synced_since(
    db: &Db,
    connection_id: i64,
    since: DateTime<Utc>,
) -> Result<Vec<SquareCatalogItem>, sqlx::Error> {
    sqlx::query_as::<_, SquareCatalogItem>(&format!(
        "{SELECT_ITEM} WHERE connection_id = ? AND last_synced_at >= ? ORDER BY id"
    ))
    .bind(connection_id)
    .bind(since)
    .fetch_all(&db.pool)
    .await
}

pub async fn catalog_items(db: &Db, scope: Scope) -> Result<Vec<SquareCatalogItem>, sqlx::Error> {
    sqlx::query_as::<_, SquareCatalogItem>(&format!("{SELECT_ITEM} WHERE {} ORDER BY id", scope.filter()))
        .bind(scope.value())
        .fetch_all(&db.pool)
        .await
}

const SELECT_LINE_ITEM: &str = "SELECT id, connection_id, square_order_id, uid, catalog_object_id, name, \
     variation_name, quantity, base_price_amount, gross_sales_amount, currency, order_closed_at, last_synced_at \
     FROM square_order_line_items";

pub async fn line_items_synced_since(
    db: &Db,
    connection_id: i64,
    since: DateTime<Utc>,
) -> Result<Vec<SquareOrderLineItem>, sqlx::Error> {
    sqlx::query_as::<_, SquareOrderLineItem>(&format!(
        "{SELECT_LINE_ITEM} WHERE connection_id = ? AND last_synced_at >= ? ORDER BY id"
    ))
    .bind(connection_id)
    .bind(since)
    .fetch_all(&db.pool)
    .await
}

/// Category object id -> display name for one connection.
pub async fn category_names(db: &Db, connection_id: i64) -> Result<HashMap<String, String>, sqlx::Error> {
    let rows: Vec<(String, Option<String>)> = sqlx::query_as(
        "SELECT square_catalog_object_id, name FROM square_categories WHERE connection_id = ? AND is_deleted = 0",
    )
    .bind(connection_id)
    .fetch_all(&db.pool)
    .await?;
    Ok(rows
        .into_iter()
        .filter_map(|(id, name)| name.map(|n| (id, n)))
        .collect())
}

/// Variation id -> summed IN_STOCK quantity across locations for one connection.
pub async fn in_stock_quantities(db: &Db, connection_id: i64) -> Result<HashMap<String, f64>, sqlx::Error> {
    let rows: Vec<(String, Option<f64>)> = sqlx::query_as(
        "SELECT square_catalog_object_id, SUM(quantity) FROM square_inventory_counts \
         WHERE connection_id = ? AND state = ? GROUP BY square_catalog_object_id",
    )
    .bind(connection_id)
    .bind(STATE_IN_STOCK)
    .fetch_all(&db.pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|(id, qty)| (id, qty.unwrap_or(0.0)))
        .collect())
}

pub async fn tier1_counts(db: &Db, scope: Scope) -> Result<Tier1Counts, sqlx::Error> {
    async fn count(db: &Db, table: &str, scope: Scope) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table} WHERE {}", scope.filter()))
            .bind(scope.value())
            .fetch_one(&db.pool)
            .await
    }
    Ok(Tier1Counts {
        categories: count(db, "square_categories", scope).await?,
        catalog_items: count(db, "square_catalog_items", scope).await?,
        inventory_counts: count(db, "square_inventory_counts", scope).await?,
        orders: count(db, "square_orders", scope).await?,
        order_line_items: count(db, "square_order_line_items", scope).await?,
    })
}

/// Most recent `last_synced_at` across `tables` in scope.
pub async fn latest_tier1_update(
    db: &Db,
    scope: Scope,
    tables: &[&str],
) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
    let mut latest: Option<DateTime<Utc>> = None;
    for table in tables {
        let ts: Option<DateTime<Utc>> = sqlx::query_scalar(&format!(
            "SELECT last_synced_at FROM {table} WHERE {} ORDER BY last_synced_at DESC LIMIT 1",
            scope.filter()
        ))
        .bind(scope.value())
        .fetch_optional(&db.pool)
        .await?;
        latest = latest.max(ts);
    }
    Ok(latest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::connections::{insert_connection, NewConnection};
    use serde_json::json;

    async fn setup() -> (Db, i64) {
        let db = Db::in_memory().await.unwrap();
        let id = insert_connection(
            &db,
            &NewConnection {
                restaurant_id: 7,
                merchant_id: None,
                location_id: Some("L1".into()),
                access_token: "tok".into(),
                token_expires_at: None,
            },
        )
        .await
        .unwrap();
        (db, id)
    }

    fn item(id: &str, name: &str) -> (CatalogObject, Value) {
        let raw = json!({
            "type": "ITEM",
            "id": id,
            "item_data": {
                "name": name,
                "category_id": "CAT1",
                "variations": [{"type": "ITEM_VARIATION", "id": format!("{id}-V1"),
                                "item_variation_data": {"track_inventory": true}}]
            }
        });
        (serde_json::from_value(raw.clone()).unwrap(), raw)
    }

    #[tokio::test]
    async fn item_upsert_is_keyed_by_object_id() {
        let (db, conn) = setup().await;
        let (obj, raw) = item("ITEM1", "Tomatoes");
        upsert_catalog_item(&db, conn, Some("L1"), &obj, &raw, Utc::now()).await.unwrap();
        let (obj2, raw2) = item("ITEM1", "Roma Tomatoes");
        upsert_catalog_item(&db, conn, Some("L1"), &obj2, &raw2, Utc::now()).await.unwrap();

        let items = catalog_items(&db, Scope::Connection(conn)).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name.as_deref(), Some("Roma Tomatoes"));
        assert_eq!(items[0].variations.0.len(), 1);
        assert_eq!(items[0].category_id.as_deref(), Some("CAT1"));
    }

    #[tokio::test]
    async fn counts_and_quantities_by_scope() {
        let (db, conn) = setup().await;
        let now = Utc::now();
        for (loc, qty) in [("L1", "4"), ("L2", "2.5")] {
            let raw = json!({"catalog_object_id": "V1", "state": "IN_STOCK", "location_id": loc, "quantity": qty});
            let count: InventoryCount = serde_json::from_value(raw.clone()).unwrap();
            upsert_inventory_count(&db, conn, &count, &raw, now).await.unwrap();
        }
        let raw = json!({"catalog_object_id": "V1", "state": "WASTE", "location_id": "L1", "quantity": "1"});
        let waste: InventoryCount = serde_json::from_value(raw.clone()).unwrap();
        upsert_inventory_count(&db, conn, &waste, &raw, now).await.unwrap();

        let qty = in_stock_quantities(&db, conn).await.unwrap();
        assert_eq!(qty.get("V1"), Some(&6.5));

        let by_conn = tier1_counts(&db, Scope::Connection(conn)).await.unwrap();
        let by_restaurant = tier1_counts(&db, Scope::Restaurant(7)).await.unwrap();
        assert_eq!(by_conn.inventory_counts, 3);
        assert_eq!(by_conn, by_restaurant);
        assert_eq!(tier1_counts(&db, Scope::Restaurant(8)).await.unwrap(), Tier1Counts::default());

        let latest = latest_tier1_update(&db, Scope::Restaurant(7), &TIER1_TABLES).await.unwrap();
        assert_eq!(latest.map(|t| t.timestamp_millis()), Some(now.timestamp_millis()));
    }

    #[tokio::test]
    async fn order_upsert_writes_line_items_once() {
        let (db, conn) = setup().await;
        let raw = json!({
            "id": "ORD1",
            "location_id": "L1",
            "state": "COMPLETED",
            "closed_at": "2024-03-01T12:00:00Z",
            "total_money": {"amount": 1200, "currency": "USD"},
            "line_items": [
                {"uid": "a", "name": "Burger", "quantity": "2", "base_price_money": {"amount": 500, "currency": "USD"}},
                {"uid": "b", "name": "Fries", "quantity": "1", "base_price_money": {"amount": 200, "currency": "USD"}}
            ]
        });
        let order: Order = serde_json::from_value(raw.clone()).unwrap();
        let since = Utc::now();
        assert_eq!(upsert_order(&db, conn, &order, &raw, Utc::now()).await.unwrap(), 2);
        assert_eq!(upsert_order(&db, conn, &order, &raw, Utc::now()).await.unwrap(), 2);
        let counts = tier1_counts(&db, Scope::Connection(conn)).await.unwrap();
        assert_eq!(counts.orders, 1);
        assert_eq!(counts.order_line_items, 2);
        let lines = line_items_synced_since(&db, conn, since).await.unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].base_price_amount, Some(500));
    }
}
