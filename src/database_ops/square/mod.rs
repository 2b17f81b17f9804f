//! Square Connect v2: HTTP client, wire models, Tier-1 store and the adapter
//! that ties them together.

pub mod adapter;
pub mod client;
pub mod models;
pub mod store;

pub use adapter::{SquareAdapter, SquareAdapterConfig, MAX_INVENTORY_BATCH};
pub use client::{SquareClient, SquareClientConfig};
