pub mod connections;
pub mod db;
pub mod provider;
pub mod purge;
pub mod square;
pub mod unified;

pub use db::Db;
pub use provider::{HealthStatus, InventorySyncReport, ItemError, OrderSyncReport, PosAdapter};
