//! Tier-1 order line item -> Tier-2 sales transaction.

use crate::database_ops::connections::PROVIDER_SQUARE;
use crate::database_ops::square::models::parse_quantity;
use crate::database_ops::square::store::SquareOrderLineItem;
use crate::database_ops::unified::SalesTransaction;

use super::inventory::minor_to_major;

/// Line item uids are only unique within their order.
pub fn line_item_source_id(line: &SquareOrderLineItem) -> String {
    format!("{}:{}", line.square_order_id, line.uid)
}

pub fn map_line_item(line: &SquareOrderLineItem, restaurant_id: i64) -> Result<SalesTransaction, String> {
    let quantity = parse_quantity(&line.quantity)
        .filter(|q| *q >= 0.0)
        .ok_or_else(|| format!("invalid quantity {:?}", line.quantity))?;
    let item_name = [line.name.as_deref(), line.variation_name.as_deref()]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|n| !n.is_empty())
        .ok_or_else(|| "missing item name".to_string())?;

    let unit_price = line.base_price_amount.map(minor_to_major);
    let total_amount = line
        .gross_sales_amount
        .map(minor_to_major)
        .or_else(|| unit_price.map(|p| p * quantity));

    Ok(SalesTransaction {
        restaurant_id,
        order_id: line.square_order_id.clone(),
        item_name: item_name.to_string(),
        catalog_object_id: line.catalog_object_id.clone(),
        quantity,
        unit_price,
        total_amount,
        currency: line.currency.clone(),
        sold_at: line.order_closed_at,
        source_pos_provider: PROVIDER_SQUARE.to_string(),
        source_pos_id: line_item_source_id(line),
    })
}
