//! Persistence for the payment ledger.

pub mod postgres;

pub use postgres::{PostgresConfig, PostgresLedger};
