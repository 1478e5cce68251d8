//! Cross-chain payment oracle.
//!
//! Watches treasury addresses on several EVM networks, records each incoming
//! payment exactly once, and distributes the purchased token on the home
//! chain.

pub mod api;
pub mod app;
pub mod domain;
pub mod infra;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
