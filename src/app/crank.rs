//! Stale distribution crank.
//!
//! Picks up records left in `distributing` by a worker that crashed or lost
//! its connection mid-attempt, and settles them through the dispatcher.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::dispatcher::DistributionDispatcher;
use crate::domain::{AppError, PaymentLedger, PaymentStatus};

/// Configuration for the stale distribution crank
#[derive(Debug, Clone)]
pub struct CrankConfig {
    /// Interval between sweeps
    pub poll_interval: Duration,
    /// Records untouched for this many seconds are considered abandoned
    pub stale_after_secs: i64,
    /// Maximum records settled per sweep
    pub batch_size: i64,
    pub enabled: bool,
}

impl Default for CrankConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            stale_after_secs: 300,
            batch_size: 20,
            enabled: true,
        }
    }
}

impl CrankConfig {
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            poll_interval: std::env::var("CRANK_POLL_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.poll_interval),
            stale_after_secs: std::env::var("CRANK_STALE_AFTER_SECS")
                .ok()
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(defaults.stale_after_secs),
            batch_size: std::env::var("CRANK_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(defaults.batch_size),
            enabled: std::env::var("ENABLE_STALE_CRANK")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.enabled),
        }
    }

    /// A record must outlive a full confirmation wait before it counts as stale
    #[must_use]
    pub fn at_least(mut self, confirmation_timeout: Duration) -> Self {
        let floor = i64::try_from(confirmation_timeout.as_secs().saturating_mul(2)).unwrap_or(i64::MAX);
        self.stale_after_secs = self.stale_after_secs.max(floor);
        self
    }
}

/// Counts from one sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CrankSummary {
    pub distributed: usize,
    pub retried: usize,
    pub failed: usize,
    pub errors: usize,
}

pub struct StaleDistributionCrank {
    ledger: Arc<dyn PaymentLedger>,
    dispatcher: Arc<DistributionDispatcher>,
    config: CrankConfig,
}

impl StaleDistributionCrank {
    pub fn new(
        ledger: Arc<dyn PaymentLedger>,
        dispatcher: Arc<DistributionDispatcher>,
        config: CrankConfig,
    ) -> Self {
        Self {
            ledger,
            dispatcher,
            config,
        }
    }

    /// Settle one batch of abandoned `distributing` records
    pub async fn sweep(&self) -> Result<CrankSummary, AppError> {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.config.stale_after_secs);
        let stale = self
            .ledger
            .find_stale_distributing(cutoff, self.config.batch_size)
            .await?;

        let mut summary = CrankSummary::default();
        if stale.is_empty() {
            debug!("No stale distributions");
            return Ok(summary);
        }
        info!(count = stale.len(), "Settling stale distributions");

        for record in stale {
            match self.dispatcher.resolve_stale(&record).await {
                Ok(PaymentStatus::Distributed) => summary.distributed += 1,
                Ok(PaymentStatus::Failed) => summary.failed += 1,
                Ok(_) => summary.retried += 1,
                Err(e) => {
                    warn!(
                        network = %record.network,
                        tx_hash = %record.source_tx_hash,
                        error = %e,
                        "Failed to settle stale distribution"
                    );
                    summary.errors += 1;
                }
            }
        }

        info!(
            distributed = summary.distributed,
            retried = summary.retried,
            failed = summary.failed,
            errors = summary.errors,
            "Stale distribution sweep complete"
        );
        Ok(summary)
    }

    /// Sweep at startup and then on every interval until shutdown
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            poll_secs = self.config.poll_interval.as_secs(),
            stale_after_secs = self.config.stale_after_secs,
            "Stale distribution crank started"
        );
        let mut interval = tokio::time::interval(self.config.poll_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Stale distribution sweep failed");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Stale distribution crank shutting down");
                        break;
                    }
                }
            }
        }
    }
}

pub fn spawn_crank(crank: StaleDistributionCrank) -> (JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(crank.run(shutdown_rx));
    (handle, shutdown_tx)
}
