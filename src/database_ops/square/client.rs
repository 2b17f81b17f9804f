use std::time::{Duration, Instant};

use reqwest::header::{HeaderValue, ACCEPT, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::models::{
    BatchRetrieveCountsRequest, CatalogPage, ErrorEnvelope, InventoryCountPage, Location,
    LocationsResponse, Merchant, MerchantResponse, OrderPage, SearchCatalogRequest,
    SearchOrdersRequest,
};
use crate::error::{ApiError, PosError};

pub const DEFAULT_BASE_URL: &str = "https://connect.squareup.com";
pub const DEFAULT_API_VERSION: &str = "2024-01-18";

fn truncate_for_log(mut s: String, max_len: usize) -> String {
    if s.len() > max_len {
        let mut cut = max_len;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push('…');
    }
    s
}

#[derive(Debug, Clone)]
pub struct SquareClientConfig {
    pub base_url: String,
    pub api_version: String,
    pub timeout: Duration,
}

impl Default for SquareClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Thin Square Connect v2 client. Every method is a single HTTP exchange;
/// throttling and retries are layered on by the adapter.
#[derive(Debug, Clone)]
pub struct SquareClient {
    base_url: String,
    api_version: String,
    http: Client,
}

impl SquareClient {
    pub fn new(cfg: SquareClientConfig) -> Result<Self, PosError> {
        let base_url = cfg.base_url.trim_end_matches('/').to_string();
        if url::Url::parse(&base_url).is_err() {
            return Err(PosError::Config(format!("invalid square base url: {base_url}")));
        }
        let http = Client::builder()
            .user_agent("pos-sync-engine/0.1")
            .timeout(cfg.timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| PosError::Config(format!("failed to build http client: {e}")))?;
        Ok(Self {
            base_url,
            api_version: cfg.api_version,
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authed(&self, req: RequestBuilder, token: &str) -> RequestBuilder {
        req.bearer_auth(token)
            .header("Square-Version", &self.api_version)
            .header(ACCEPT, HeaderValue::from_static("application/json"))
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
    }

    async fn send<T: DeserializeOwned>(&self, op: &str, req: RequestBuilder) -> Result<T, ApiError> {
        let t0 = Instant::now();
        debug!(op, "square request");
        let resp = req.send().await.map_err(|e| {
            warn!(op, error = %e, "square transport error");
            ApiError::from(e)
        })?;
        let status = resp.status();
        let retry_after = retry_after(&resp);
        let body = resp.text().await?;
        let elapsed_ms = t0.elapsed().as_millis() as u64;
        info!(op, status = status.as_u16(), body_len = body.len(), elapsed_ms, "square response");

        if !status.is_success() {
            let detail = serde_json::from_str::<ErrorEnvelope>(&body)
                .ok()
                .and_then(|env| env.errors.into_iter().next())
                .map(|e| {
                    format!(
                        "{}: {}",
                        e.code.unwrap_or_else(|| "UNKNOWN".into()),
                        e.detail.unwrap_or_default()
                    )
                })
                .unwrap_or_else(|| truncate_for_log(body, 300));
            return Err(ApiError::Http {
                status: status.as_u16(),
                body: detail,
                retry_after,
            });
        }
        serde_json::from_str(&body).map_err(ApiError::from)
    }

    /// POST /v2/catalog/search
    pub async fn search_catalog(
        &self,
        token: &str,
        body: &SearchCatalogRequest,
    ) -> Result<CatalogPage, ApiError> {
        let req = self.authed(self.http.post(self.url("/v2/catalog/search")), token).json(body);
        self.send("catalog.search", req).await
    }

    /// POST /v2/inventory/counts/batch-retrieve
    pub async fn batch_retrieve_inventory_counts(
        &self,
        token: &str,
        body: &BatchRetrieveCountsRequest,
    ) -> Result<InventoryCountPage, ApiError> {
        if body.catalog_object_ids.len() > 100 {
            return Err(ApiError::InvalidRequest(format!(
                "batch-retrieve accepts at most 100 ids, got {}",
                body.catalog_object_ids.len()
            )));
        }
        let req = self
            .authed(self.http.post(self.url("/v2/inventory/counts/batch-retrieve")), token)
            .json(body);
        self.send("inventory.batch_retrieve", req).await
    }

    /// GET /v2/locations
    pub async fn list_locations(&self, token: &str) -> Result<Vec<Location>, ApiError> {
        let req = self.authed(self.http.get(self.url("/v2/locations")), token);
        let resp: LocationsResponse = self.send("locations.list", req).await?;
        Ok(resp.locations)
    }

    /// GET /v2/merchants/me
    pub async fn retrieve_merchant(&self, token: &str) -> Result<Merchant, ApiError> {
        let req = self.authed(self.http.get(self.url("/v2/merchants/me")), token);
        let resp: MerchantResponse = self.send("merchants.me", req).await?;
        Ok(resp.merchant)
    }

    /// POST /v2/orders/search
    pub async fn search_orders(
        &self,
        token: &str,
        body: &SearchOrdersRequest,
    ) -> Result<OrderPage, ApiError> {
        let req = self.authed(self.http.post(self.url("/v2/orders/search")), token).json(body);
        self.send("orders.search", req).await
    }
}

fn retry_after(resp: &Response) -> Option<Duration> {
    resp.headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
