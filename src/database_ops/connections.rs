//! Read side of the POS connection rows plus the post-sync timestamp hook.
//!
//! Connections are created and refreshed by the OAuth flow, which lives outside
//! this crate. `insert_connection` exists for operators and tests.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, instrument};

use super::db::Db;
use crate::error::PosError;

pub const PROVIDER_SQUARE: &str = "square";

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Connection {
    pub id: i64,
    pub restaurant_id: i64,
    pub provider: String,
    pub merchant_id: Option<String>,
    pub location_id: Option<String>,
    #[serde(skip_serializing)]
    pub access_token: String,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
}

impl Connection {
    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn is_token_expired(&self) -> bool {
        self.token_expires_at
            .map(|exp| exp <= Utc::now())
            .unwrap_or(false)
    }

    /// Key used for the per-connection rate-limiter bucket.
    pub fn limiter_key(&self) -> String {
        format!("{}:{}", self.provider, self.id)
    }
}

#[derive(Debug, Clone)]
pub struct NewConnection {
    pub restaurant_id: i64,
    pub merchant_id: Option<String>,
    pub location_id: Option<String>,
    pub access_token: String,
    pub token_expires_at: Option<DateTime<Utc>>,
}

const SELECT_CONNECTION: &str = "SELECT id, restaurant_id, provider, merchant_id, location_id, \
     access_token, token_expires_at, is_active, last_sync_at FROM pos_connections";

#[instrument(skip(db))]
pub async fn load_connection(db: &Db, connection_id: i64) -> Result<Connection, PosError> {
    sqlx::query_as::<_, Connection>(&format!("{SELECT_CONNECTION} WHERE id = ?"))
        .bind(connection_id)
        .fetch_optional(&db.pool)
        .await?
        .ok_or_else(|| PosError::NotFound(format!("pos connection {connection_id}")))
}

pub async fn list_active_connections(db: &Db) -> Result<Vec<Connection>, PosError> {
    let rows = sqlx::query_as::<_, Connection>(&format!(
        "{SELECT_CONNECTION} WHERE is_active = 1 AND provider = ? ORDER BY id"
    ))
    .bind(PROVIDER_SQUARE)
    .fetch_all(&db.pool)
    .await?;
    Ok(rows)
}

/// Persistence hook for the post-sync timestamp.
pub async fn update_last_sync_at(
    db: &Db,
    connection_id: i64,
    at: DateTime<Utc>,
) -> Result<(), PosError> {
    let res = sqlx::query("UPDATE pos_connections SET last_sync_at = ?, updated_at = ? WHERE id = ?")
        .bind(at)
        .bind(Utc::now())
        .bind(connection_id)
        .execute(&db.pool)
        .await?;
    if res.rows_affected() == 0 {
        return Err(PosError::NotFound(format!("pos connection {connection_id}")));
    }
    debug!(connection_id, last_sync_at = %at, "stamped last_sync_at");
    Ok(())
}

pub async fn insert_connection(db: &Db, new: &NewConnection) -> Result<i64, PosError> {
    let now = Utc::now();
    let res = sqlx::query(
        "INSERT INTO pos_connections \
         (restaurant_id, provider, merchant_id, location_id, access_token, token_expires_at, is_active, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)",
    )
    .bind(new.restaurant_id)
    .bind(PROVIDER_SQUARE)
    .bind(&new.merchant_id)
    .bind(&new.location_id)
    .bind(&new.access_token)
    .bind(new.token_expires_at)
    .bind(now)
    .bind(now)
    .execute(&db.pool)
    .await?;
    Ok(res.last_insert_rowid())
}
