//! Tier-1 catalog item -> Tier-2 inventory item.

use std::collections::HashMap;

use serde_json::json;
use sqlx::types::Json;

use crate::database_ops::connections::PROVIDER_SQUARE;
use crate::database_ops::square::store::SquareCatalogItem;
use crate::database_ops::unified::InventoryItem;
use crate::normalization::{CategoryMapper, UnitMapper};

/// Per-connection lookups loaded once per transform call.
#[derive(Debug, Clone, Default)]
pub struct CatalogLookups {
    /// Square category id -> display name.
    pub category_names: HashMap<String, String>,
    /// Variation id -> summed IN_STOCK quantity.
    pub in_stock: HashMap<String, f64>,
}

/// Minor currency units to major (cents to dollars).
pub fn minor_to_major(amount: i64) -> f64 {
    amount as f64 / 100.0
}

pub fn map_catalog_item(
    item: &SquareCatalogItem,
    restaurant_id: i64,
    lookups: &CatalogLookups,
    categories: &CategoryMapper,
    units: &UnitMapper,
) -> Result<InventoryItem, String> {
    let name = item
        .name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| "missing item name".to_string())?;

    let category_name = item
        .category_id
        .as_deref()
        .and_then(|id| lookups.category_names.get(id))
        .map(String::as_str);
    let category = categories.map(category_name);

    let variations: Vec<_> = item.variations.0.iter().filter(|v| !v.is_deleted).collect();
    let data: Vec<_> = variations
        .iter()
        .filter_map(|v| v.item_variation_data.as_ref())
        .collect();

    let unit = units.map(
        data.iter()
            .map(|d| d.measurement_unit_id.as_deref())
            .chain(data.iter().map(|d| d.name.as_deref())),
    );

    let sku = data
        .iter()
        .filter_map(|d| d.sku.as_deref())
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string);

    let unit_cost = match data
        .iter()
        .find_map(|d| d.price_money.as_ref().and_then(|m| m.amount))
    {
        Some(amount) if amount < 0 => return Err(format!("negative price {amount}")),
        Some(amount) => Some(minor_to_major(amount)),
        None => None,
    };

    let current_quantity = variations
        .iter()
        .filter_map(|v| lookups.in_stock.get(&v.id))
        .sum::<f64>();

    Ok(InventoryItem {
        restaurant_id,
        name: name.to_string(),
        category,
        unit,
        sku,
        current_quantity,
        unit_cost,
        is_active: !item.is_deleted,
        source_pos_provider: PROVIDER_SQUARE.to_string(),
        source_pos_id: item.square_catalog_object_id.clone(),
        source_pos_metadata: Json(json!({
            "connection_id": item.connection_id,
            "location_id": item.location_id,
            "category_id": item.category_id,
            "variation_ids": variations.iter().map(|v| v.id.as_str()).collect::<Vec<_>>(),
            "version": item.version,
        })),
    })
}
