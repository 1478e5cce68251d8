//! Application state management.

use std::sync::Arc;

use super::service::OracleService;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<OracleService>,
    /// Bearer token for `/admin` routes; admin routes are open when unset
    pub admin_token: Option<String>,
}

impl AppState {
    #[must_use]
    pub fn new(service: Arc<OracleService>) -> Self {
        Self {
            service,
            admin_token: None,
        }
    }

    /// Require `token` on admin routes (builder pattern)
    #[must_use]
    pub fn with_admin_token(mut self, token: Option<String>) -> Self {
        self.admin_token = token.filter(|t| !t.is_empty());
        self
    }
}
