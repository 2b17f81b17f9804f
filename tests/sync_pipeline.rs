use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pos_sync_engine::database_ops::connections::{self, insert_connection, Connection, NewConnection};
use pos_sync_engine::database_ops::square::store::{self, Scope};
use pos_sync_engine::database_ops::square::{
    SquareAdapter, SquareAdapterConfig, SquareClient, SquareClientConfig,
};
use pos_sync_engine::database_ops::{unified, Db, PosAdapter};
use pos_sync_engine::net::{RateLimiter, RateLimiterConfig, RetryConfig, RetryPolicy};
use pos_sync_engine::orchestrator::{OrchestratorConfig, SyncOrchestrator};
use pos_sync_engine::transform::{DataTransformer, TransformConfig};
use pos_sync_engine::{PosError, RunStatus, SyncOptions};
use serde_json::{json, Value};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

const CATALOG: &str = "/v2/catalog/search";
const COUNTS: &str = "/v2/inventory/counts/batch-retrieve";
const ORDERS: &str = "/v2/orders/search";

struct Harness {
    db: Db,
    adapter: Arc<SquareAdapter>,
    conn: Connection,
}

async fn harness(server: &MockServer, location: Option<&str>) -> Harness {
    let db = Db::in_memory().await.unwrap();
    let id = insert_connection(
        &db,
        &NewConnection {
            restaurant_id: 77,
            merchant_id: Some("M1".into()),
            location_id: location.map(str::to_string),
            access_token: "test-token".into(),
            token_expires_at: None,
        },
    )
    .await
    .unwrap();
    let client = SquareClient::new(SquareClientConfig {
        base_url: server.uri(),
        ..SquareClientConfig::default()
    })
    .unwrap();
    let limiter = RateLimiter::new(RateLimiterConfig {
        capacity: 1000,
        refill_interval: Duration::from_secs(1),
    })
    .unwrap();
    let retry = RetryPolicy::new(RetryConfig {
        max_retries: 2,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        jitter: Duration::ZERO,
    });
    let adapter = SquareAdapter::new(db.clone(), client, limiter, retry, SquareAdapterConfig::default());
    let conn = connections::load_connection(&db, id).await.unwrap();
    Harness {
        db,
        adapter: Arc::new(adapter),
        conn,
    }
}

fn item(id: &str, name: &str, variation_ids: &[String]) -> Value {
    let variations: Vec<Value> = variation_ids
        .iter()
        .map(|v| {
            json!({
                "type": "ITEM_VARIATION",
                "id": v,
                "item_variation_data": {
                    "item_id": id,
                    "name": "Per lb",
                    "price_money": {"amount": 325, "currency": "USD"}
                }
            })
        })
        .collect();
    json!({
        "type": "ITEM",
        "id": id,
        "updated_at": "2024-03-01T10:00:00Z",
        "version": 1,
        "item_data": {"name": name, "category_id": "CAT1", "variations": variations}
    })
}

fn category() -> Value {
    json!({"type": "CATEGORY", "id": "CAT1", "category_data": {"name": "Produce"}})
}

fn count(variation_id: &str, qty: &str) -> Value {
    json!({
        "catalog_object_id": variation_id,
        "catalog_object_type": "ITEM_VARIATION",
        "state": "IN_STOCK",
        "location_id": "L1",
        "quantity": qty,
        "calculated_at": "2024-03-01T10:00:00Z"
    })
}

fn body(req: &Request) -> Value {
    serde_json::from_slice(&req.body).unwrap_or(Value::Null)
}

async fn mount_simple_catalog(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path(CATALOG))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "objects": [
                category(),
                item("ITEM1", "Tomatoes", &["V1".to_string()]),
                item("ITEM2", "Basil", &["V2".to_string()]),
            ]
        })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path(COUNTS))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "counts": [count("V1", "12"), count("V2", "3.5")]
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn repeated_sync_is_idempotent() {
    let server = MockServer::start().await;
    mount_simple_catalog(&server).await;
    let h = harness(&server, Some("L1")).await;

    let first = h.adapter.sync_inventory(&h.conn, None).await.unwrap();
    let after_first = store::tier1_counts(&h.db, Scope::Connection(h.conn.id)).await.unwrap();
    let second = h.adapter.sync_inventory(&h.conn, None).await.unwrap();
    let after_second = store::tier1_counts(&h.db, Scope::Connection(h.conn.id)).await.unwrap();

    assert_eq!(first.items, 2);
    assert_eq!(first.categories, 1);
    assert_eq!(first.inventory_counts, 2);
    assert_eq!(second.items, first.items);
    assert_eq!(after_first, after_second);
    assert_eq!(after_second.catalog_items, 2);
    assert_eq!(after_second.inventory_counts, 2);
    assert!(first.errors.is_empty());
}

#[tokio::test]
async fn one_bad_item_does_not_abort_the_run() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CATALOG))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "objects": [
                item("ITEM1", "Tomatoes", &["V1".to_string()]),
                {"type": "ITEM", "id": "BROKEN", "item_data": {"variations": "not-a-list"}},
                item("ITEM3", "Onions", &["V3".to_string()]),
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(COUNTS))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"counts": []})))
        .mount(&server)
        .await;
    let h = harness(&server, Some("L1")).await;

    let report = h.adapter.sync_inventory(&h.conn, None).await.unwrap();
    assert_eq!(report.items, 2);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].object_id, "BROKEN");
    assert_eq!(report.errors[0].object_type, "ITEM");
}

/// Make every Tier-1 insert of `id` into `table` fail inside SQLite.
async fn fail_inserts(db: &Db, table: &str, column: &str, id: &str) {
    let ddl = format!(
        "CREATE TRIGGER fail_{table} BEFORE INSERT ON {table} \
         WHEN NEW.{column} = '{id}' BEGIN SELECT RAISE(ABORT, 'boom'); END"
    );
    sqlx::query(&ddl).execute(&db.pool).await.unwrap();
}

#[tokio::test]
async fn failing_item_upsert_does_not_abort_the_run() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CATALOG))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "objects": [
                item("ITEM1", "Tomatoes", &["V1".to_string()]),
                item("ITEM2", "Basil", &["V2".to_string()]),
                item("ITEM3", "Onions", &["V3".to_string()]),
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(COUNTS))
        .and(|req: &Request| {
            body(req)["catalog_object_ids"]
                .as_array()
                .map(|ids| ids.len() == 2 && !ids.contains(&json!("V2")))
                .unwrap_or(false)
        })
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"counts": []})))
        .expect(1)
        .mount(&server)
        .await;
    let h = harness(&server, Some("L1")).await;
    fail_inserts(&h.db, "square_catalog_items", "square_catalog_object_id", "ITEM2").await;

    let report = h.adapter.sync_inventory(&h.conn, None).await.unwrap();
    assert_eq!(report.items, 2);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].object_id, "ITEM2");
    assert_eq!(report.errors[0].object_type, "ITEM");
    assert!(report.errors[0].message.contains("boom"));
    let counts = store::tier1_counts(&h.db, Scope::Connection(h.conn.id)).await.unwrap();
    assert_eq!(counts.catalog_items, 2);
    let conn = connections::load_connection(&h.db, h.conn.id).await.unwrap();
    assert!(conn.last_sync_at.is_some());
}

#[tokio::test]
async fn failing_count_upsert_is_reported_per_variation() {
    let server = MockServer::start().await;
    mount_simple_catalog(&server).await;
    let h = harness(&server, Some("L1")).await;
    fail_inserts(&h.db, "square_inventory_counts", "square_catalog_object_id", "V2").await;

    let report = h.adapter.sync_inventory(&h.conn, None).await.unwrap();
    assert_eq!(report.items, 2);
    assert_eq!(report.inventory_counts, 1);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].object_id, "V2");
    assert_eq!(report.errors[0].object_type, "INVENTORY_COUNT");
}

fn order(id: &str) -> Value {
    json!({
        "id": id,
        "location_id": "L1",
        "state": "COMPLETED",
        "closed_at": "2024-03-02T18:30:00Z",
        "line_items": [
            {"uid": format!("{id}-li"), "catalog_object_id": "V1", "name": "Tomatoes", "quantity": "1",
             "base_price_money": {"amount": 325, "currency": "USD"}}
        ]
    })
}

fn order_window() -> (DateTime<Utc>, DateTime<Utc>) {
    let end = Utc::now();
    (end - chrono::Duration::days(30), end)
}

#[tokio::test]
async fn order_sync_follows_cursor_pages() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(ORDERS))
        .and(|req: &Request| body(req).get("cursor").is_none())
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "orders": [order("ORD1"), order("ORD2")],
            "cursor": "orders-2"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(ORDERS))
        .and(body_partial_json(json!({"cursor": "orders-2"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "orders": [order("ORD3")]
        })))
        .expect(1)
        .mount(&server)
        .await;
    let h = harness(&server, Some("L1")).await;
    let (start, end) = order_window();

    let report = h.adapter.sync_orders(&h.conn, start, end).await.unwrap();
    assert_eq!(report.pages, 2);
    assert_eq!(report.orders, 3);
    assert_eq!(report.line_items, 3);
    assert!(report.errors.is_empty());
    let counts = store::tier1_counts(&h.db, Scope::Connection(h.conn.id)).await.unwrap();
    assert_eq!(counts.orders, 3);
}

#[tokio::test]
async fn failing_order_upsert_does_not_abort_order_sync() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(ORDERS))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "orders": [order("ORD1"), order("ORD2"), order("ORD3")]
        })))
        .mount(&server)
        .await;
    let h = harness(&server, Some("L1")).await;
    fail_inserts(&h.db, "square_orders", "square_order_id", "ORD2").await;
    let (start, end) = order_window();

    let report = h.adapter.sync_orders(&h.conn, start, end).await.unwrap();
    assert_eq!(report.orders, 2);
    assert_eq!(report.line_items, 2);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].object_id, "ORD2");
    assert_eq!(report.errors[0].object_type, "ORDER");
    let counts = store::tier1_counts(&h.db, Scope::Connection(h.conn.id)).await.unwrap();
    assert_eq!(counts.orders, 2);
    assert_eq!(counts.order_line_items, 2);
}

#[tokio::test]
async fn incremental_sync_sends_begin_time() {
    let server = MockServer::start().await;
    let since: DateTime<Utc> = "2024-03-01T00:00:00Z".parse().unwrap();
    Mock::given(method("POST"))
        .and(path(CATALOG))
        .and(body_partial_json(json!({"begin_time": since.to_rfc3339()})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"objects": []})))
        .expect(1)
        .mount(&server)
        .await;
    let h = harness(&server, Some("L1")).await;
    let report = h.adapter.sync_inventory(&h.conn, Some(since)).await.unwrap();
    assert!(report.incremental);
    assert_eq!(report.pages, 1);
}

#[tokio::test]
async fn full_sync_omits_begin_time() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CATALOG))
        .and(|req: &Request| body(req).get("begin_time").is_none())
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"objects": []})))
        .expect(1)
        .mount(&server)
        .await;
    let h = harness(&server, Some("L1")).await;
    let report = h.adapter.sync_inventory(&h.conn, None).await.unwrap();
    assert!(!report.incremental);
}

#[tokio::test]
async fn inventory_counts_are_fetched_in_batches_of_100() {
    let server = MockServer::start().await;
    let ids: Vec<String> = (0..250).map(|i| format!("VAR{i:03}")).collect();
    Mock::given(method("POST"))
        .and(path(CATALOG))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "objects": [item("BIG", "Everything", &ids)]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(COUNTS))
        .and(|req: &Request| {
            body(req)["catalog_object_ids"]
                .as_array()
                .map(|ids| !ids.is_empty() && ids.len() <= 100)
                .unwrap_or(false)
        })
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"counts": []})))
        .expect(3)
        .mount(&server)
        .await;
    let h = harness(&server, Some("L1")).await;

    let report = h.adapter.sync_inventory(&h.conn, None).await.unwrap();
    assert_eq!(report.variations, 250);
    assert_eq!(report.batches, 3);
}

#[tokio::test]
async fn pagination_stops_on_malformed_cursor() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CATALOG))
        .and(|req: &Request| body(req).get("cursor").is_none())
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "objects": [item("ITEM1", "Tomatoes", &["V1".to_string()])],
            "cursor": "page-2"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(CATALOG))
        .and(body_partial_json(json!({"cursor": "page-2"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "objects": [item("ITEM2", "Basil", &["V2".to_string()])],
            "cursor": "not a cursor"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(COUNTS))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"counts": []})))
        .mount(&server)
        .await;
    let h = harness(&server, Some("L1")).await;

    let report = h.adapter.sync_inventory(&h.conn, None).await.unwrap();
    assert_eq!(report.pages, 2);
    assert_eq!(report.items, 2);
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CATALOG))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(CATALOG))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"objects": []})))
        .expect(1)
        .mount(&server)
        .await;
    let h = harness(&server, Some("L1")).await;

    h.adapter.sync_inventory(&h.conn, None).await.unwrap();
    let stats = h.adapter.retry_stats();
    assert_eq!(stats.total_retries, 2);
    assert_eq!(stats.retries_by_status.get(&503), Some(&2));
    assert!(h.adapter.limiter_stats().total_requests >= 3);
}

#[tokio::test]
async fn unauthorized_is_a_token_error_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CATALOG))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "errors": [{"category": "AUTHENTICATION_ERROR", "code": "ACCESS_TOKEN_EXPIRED", "detail": "expired"}]
        })))
        .expect(1)
        .mount(&server)
        .await;
    let h = harness(&server, Some("L1")).await;

    let err = h.adapter.sync_inventory(&h.conn, None).await.unwrap_err();
    assert!(matches!(err, PosError::Token(_)), "{err:?}");
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn total_failure_leaves_last_sync_at_untouched() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CATALOG))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;
    let h = harness(&server, Some("L1")).await;

    let err = h.adapter.sync_inventory(&h.conn, None).await.unwrap_err();
    assert!(err.is_retryable());
    let conn = connections::load_connection(&h.db, h.conn.id).await.unwrap();
    assert!(conn.last_sync_at.is_none());
}

#[tokio::test]
async fn successful_sync_stamps_last_sync_at() {
    let server = MockServer::start().await;
    mount_simple_catalog(&server).await;
    let h = harness(&server, Some("L1")).await;
    let before = Utc::now();
    h.adapter.sync_inventory(&h.conn, None).await.unwrap();
    let conn = connections::load_connection(&h.db, h.conn.id).await.unwrap();
    let stamped = conn.last_sync_at.expect("stamped");
    assert!(stamped >= before);
}

#[tokio::test]
async fn unbound_connection_resolves_active_locations() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/locations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "locations": [
                {"id": "L1", "name": "Main", "status": "ACTIVE"},
                {"id": "L9", "name": "Closed", "status": "INACTIVE"}
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(CATALOG))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "objects": [item("ITEM1", "Tomatoes", &["V1".to_string()])]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(COUNTS))
        .and(body_partial_json(json!({"location_ids": ["L1"]})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"counts": [count("V1", "2")]})))
        .expect(1)
        .mount(&server)
        .await;
    let h = harness(&server, None).await;

    let report = h.adapter.sync_inventory(&h.conn, None).await.unwrap();
    assert_eq!(report.locations, vec!["L1".to_string()]);
    assert_eq!(report.inventory_counts, 1);
}

#[tokio::test]
async fn health_check_reports_instead_of_failing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/merchants/me"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "merchant": {"id": "M1", "business_name": "Cafe"}
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/merchants/me"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;
    let h = harness(&server, Some("L1")).await;

    let ok = h.adapter.health_check(&h.conn).await;
    assert!(ok.healthy);
    assert_eq!(ok.merchant_id.as_deref(), Some("M1"));

    let bad = h.adapter.health_check(&h.conn).await;
    assert!(!bad.healthy);
    assert!(bad.reason.unwrap_or_default().contains("auth"));
}

#[tokio::test]
async fn health_check_retries_transient_failures() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/merchants/me"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/merchants/me"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "merchant": {"id": "M1", "business_name": "Cafe"}
        })))
        .expect(1)
        .mount(&server)
        .await;
    let h = harness(&server, Some("L1")).await;

    let status = h.adapter.health_check(&h.conn).await;
    assert!(status.healthy, "{:?}", status.reason);
    assert_eq!(h.adapter.retry_stats().total_retries, 1);
    assert_eq!(h.adapter.limiter_stats().total_requests, 2);
}

fn orchestrator(h: &Harness) -> SyncOrchestrator {
    SyncOrchestrator::new(
        h.db.clone(),
        h.adapter.clone(),
        DataTransformer::new(h.db.clone(), TransformConfig::default()),
        OrchestratorConfig::default(),
    )
}

#[tokio::test]
async fn orchestrated_run_fills_both_tiers() {
    let server = MockServer::start().await;
    mount_simple_catalog(&server).await;
    Mock::given(method("POST"))
        .and(path(ORDERS))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "orders": [{
                "id": "ORD1",
                "location_id": "L1",
                "state": "COMPLETED",
                "closed_at": "2024-03-02T18:30:00Z",
                "line_items": [
                    {"uid": "li-1", "catalog_object_id": "V1", "name": "Tomatoes", "quantity": "2",
                     "base_price_money": {"amount": 325, "currency": "USD"}}
                ]
            }]
        })))
        .mount(&server)
        .await;
    let h = harness(&server, Some("L1")).await;
    let orch = orchestrator(&h);

    let result = orch
        .sync_and_transform(
            h.conn.id,
            SyncOptions {
                include_orders: true,
                ..SyncOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.orders.as_ref().map(|o| o.line_items), Some(1));
    assert_eq!(result.sales_transform.as_ref().map(|t| t.success_count), Some(1));

    let tomato = unified::find_inventory_item(&h.db, 77, "square", "ITEM1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tomato.current_quantity, 12.0);
    assert_eq!(tomato.unit_cost, Some(3.25));
    assert_eq!(tomato.category, "produce");
    assert_eq!(tomato.unit, "lb");

    let validation = orch.validate_transformation(77).await.unwrap();
    assert_eq!(validation.tier2_items, 2);
    let status = orch.get_sync_status(h.conn.id).await.unwrap();
    assert!(!status.sync_needed, "{:?}", status.reason);
    assert_eq!(status.tier2.sales_transactions, 1);
}

#[tokio::test]
async fn orchestrated_sync_failure_carries_partial_result() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CATALOG))
        .respond_with(ResponseTemplate::new(400))
        .mount(&server)
        .await;
    let h = harness(&server, Some("L1")).await;
    let orch = orchestrator(&h);

    let err = orch
        .sync_and_transform(h.conn.id, SyncOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PosError::Sync { .. }));
    assert!(!err.is_retryable());
    let partial = err.sync_result().expect("partial result");
    assert_eq!(partial.status, RunStatus::Failed);
    assert!(partial.catalog_transform.is_none());
    orch.teardown();
    assert_eq!(h.adapter.limiter_stats().active_buckets, 0);
}
