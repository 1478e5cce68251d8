//! Application layer: detection, classification, distribution and the
//! services behind the HTTP API.

pub mod classifier;
pub mod crank;
pub mod dispatcher;
pub mod filter;
pub mod service;
pub mod state;
pub mod watcher;

pub use classifier::PaymentClassifier;
pub use crank::{CrankConfig, CrankSummary, StaleDistributionCrank, spawn_crank};
pub use dispatcher::{DispatcherConfig, DistributionDispatcher, spawn_dispatcher};
pub use filter::TransferFilter;
pub use service::OracleService;
pub use state::AppState;
pub use watcher::{NetworkWatcher, WatcherConfig, spawn_watchers};
