//! POS sync engine: pulls Square catalog, inventory and order data into a raw
//! (Tier-1) store and transforms it into provider-neutral (Tier-2) records.

pub mod config;
pub mod database_ops;
pub mod error;
pub mod logging;
pub mod net;
pub mod normalization;
pub mod orchestrator;
pub mod transform;

pub mod util {
    pub mod env;
}

pub use config::SyncConfig;
pub use error::{ApiError, PosError};
pub use orchestrator::{
    Phase, RunStatus, StatsReport, StatusReport, SyncOptions, SyncOrchestrator, SyncResult,
    ValidationReport, ValidationStatus,
};
