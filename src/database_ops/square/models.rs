//! Wire shapes for the Square Connect v2 endpoints we call.
//!
//! Catalog and order payloads are kept as raw `serde_json::Value` on the page
//! level so a single malformed object can be reported without failing the page;
//! the typed structs below are applied per object.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const OBJECT_TYPE_ITEM: &str = "ITEM";
pub const OBJECT_TYPE_CATEGORY: &str = "CATEGORY";
pub const STATE_IN_STOCK: &str = "IN_STOCK";

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct Money {
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogObject {
    #[serde(rename = "type")]
    pub object_type: String,
    pub id: String,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub version: Option<i64>,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub item_data: Option<CatalogItemData>,
    #[serde(default)]
    pub category_data: Option<CatalogCategoryData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogCategoryData {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogItemData {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category_id: Option<String>,
    /// Newer API versions list categories here instead of `category_id`.
    #[serde(default)]
    pub categories: Vec<CategoryRef>,
    #[serde(default)]
    pub variations: Vec<CatalogVariation>,
}

impl CatalogItemData {
    pub fn primary_category_id(&self) -> Option<&str> {
        self.category_id
            .as_deref()
            .or_else(|| self.categories.first().map(|c| c.id.as_str()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CategoryRef {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct CatalogVariation {
    pub id: String,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub item_variation_data: Option<VariationData>,
}

impl CatalogVariation {
    /// Variations with tracking unset are treated as trackable; Square reports counts for them.
    pub fn is_trackable(&self) -> bool {
        !self.is_deleted
            && self
                .item_variation_data
                .as_ref()
                .and_then(|d| d.track_inventory)
                .unwrap_or(true)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct VariationData {
    #[serde(default)]
    pub item_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub price_money: Option<Money>,
    #[serde(default)]
    pub track_inventory: Option<bool>,
    #[serde(default)]
    pub measurement_unit_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchCatalogRequest {
    pub object_types: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    /// RFC 3339; only objects updated after this instant are returned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub begin_time: Option<String>,
    pub include_deleted_objects: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CatalogPage {
    #[serde(default)]
    pub objects: Vec<Value>,
    #[serde(default)]
    pub cursor: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchRetrieveCountsRequest {
    pub catalog_object_ids: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub location_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InventoryCount {
    pub catalog_object_id: String,
    #[serde(default)]
    pub catalog_object_type: Option<String>,
    pub state: String,
    pub location_id: String,
    /// Decimal string, e.g. "12.5".
    #[serde(default)]
    pub quantity: Option<String>,
    #[serde(default)]
    pub calculated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InventoryCountPage {
    #[serde(default)]
    pub counts: Vec<Value>,
    #[serde(default)]
    pub cursor: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Location {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub merchant_id: Option<String>,
}

impl Location {
    pub fn is_active(&self) -> bool {
        self.status
            .as_deref()
            .map(|s| s.eq_ignore_ascii_case("ACTIVE"))
            .unwrap_or(true)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LocationsResponse {
    #[serde(default)]
    pub locations: Vec<Location>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Merchant {
    pub id: String,
    #[serde(default)]
    pub business_name: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MerchantResponse {
    pub merchant: Merchant,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchOrdersRequest {
    pub location_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    pub limit: u32,
    pub query: Value,
}

impl SearchOrdersRequest {
    pub fn updated_between(
        location_ids: Vec<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: u32,
    ) -> Self {
        let query = serde_json::json!({
            "filter": {
                "date_time_filter": {
                    "updated_at": {
                        "start_at": start.to_rfc3339(),
                        "end_at": end.to_rfc3339(),
                    }
                }
            },
            "sort": { "sort_field": "UPDATED_AT", "sort_order": "ASC" }
        });
        Self {
            location_ids,
            cursor: None,
            limit,
            query,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrderPage {
    #[serde(default)]
    pub orders: Vec<Value>,
    #[serde(default)]
    pub cursor: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Order {
    pub id: String,
    pub location_id: String,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_money: Option<Money>,
    #[serde(default)]
    pub line_items: Vec<OrderLineItem>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrderLineItem {
    pub uid: String,
    #[serde(default)]
    pub catalog_object_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub variation_name: Option<String>,
    /// Decimal string.
    pub quantity: String,
    #[serde(default)]
    pub base_price_money: Option<Money>,
    #[serde(default)]
    pub gross_sales_money: Option<Money>,
    #[serde(default)]
    pub total_money: Option<Money>,
}

/// Square error envelope (`{"errors":[{"category","code","detail"}]}`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorEnvelope {
    #[serde(default)]
    pub errors: Vec<ApiErrorDetail>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiErrorDetail {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub detail: Option<String>,
}

/// Cursor acceptance rule shared by every paginated endpoint: anything other
/// than a non-blank, whitespace-free string not already returned in this
/// listing ends the stream.
pub fn next_cursor(raw: Option<&Value>, seen: &mut HashSet<String>) -> Option<String> {
    let s = raw?.as_str()?.trim();
    if s.is_empty() || s.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return None;
    }
    if !seen.insert(s.to_string()) {
        return None;
    }
    Some(s.to_string())
}

/// Parse a Square decimal quantity string.
pub fn parse_quantity(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|q| q.is_finite())
}
