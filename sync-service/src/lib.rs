pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod metrics_server;
pub mod observability;
pub mod reconcile;
pub mod remote;

pub use engine::{ConflictResolution, EngineConfig, SyncEngine, SyncPhase, SyncPolicy, SyncReport};
pub use error::SyncError;
pub use executor::{BatchConfig, BatchOutcome, Progress};
pub use reconcile::{Comparison, Relation, SyncItem};
