//! PostgreSQL payment ledger implementation.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgPool, Row, postgres::PgPoolOptions, postgres::PgRow};
use tracing::{info, instrument};

use crate::domain::{
    AggregateStats, Anomaly, AppError, BlockCheckpoint, DatabaseError, InsertOutcome, PaymentKey,
    PaymentLedger, PaymentRecord, PaymentStatus, StatsBreakdown, normalize_hex,
};

const RECORD_COLUMNS: &str = r#"
    network, source_tx_hash, buyer_address, treasury_address, payment_token,
    token_contract, raw_amount, payment_amount, token_price_usd, target_price_usd,
    usd_value, target_amount, status, distribution_tx_hash,
    pending_distribution_tx_hash, pending_distribution_raw_tx, block_number,
    attempt_count, last_error, next_retry_at, created_at, updated_at
"#;

/// PostgreSQL connection pool configuration
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(3),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

impl PostgresConfig {
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_connections: std::env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),
            min_connections: std::env::var("DATABASE_MIN_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.min_connections),
            ..defaults
        }
    }
}

/// Payment ledger backed by PostgreSQL with connection pooling
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    /// Connect with custom pool configuration
    pub async fn new(database_url: &str, config: PostgresConfig) -> Result<Self, AppError> {
        info!("Connecting to PostgreSQL...");
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .max_lifetime(config.max_lifetime)
            .connect(database_url)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Connection(e.to_string())))?;
        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    pub async fn with_defaults(database_url: &str) -> Result<Self, AppError> {
        Self::new(database_url, PostgresConfig::default()).await
    }

    /// Wrap an existing pool
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run database migrations using sqlx migrate
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Migration(e.to_string())))?;
        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get the underlying connection pool (for testing)
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_record(row: &PgRow) -> Result<PaymentRecord, AppError> {
        let status: String = row.get("status");
        Ok(PaymentRecord {
            network: row.get("network"),
            source_tx_hash: row.get("source_tx_hash"),
            buyer_address: row.get("buyer_address"),
            treasury_address: row.get("treasury_address"),
            payment_token: row.get("payment_token"),
            token_contract: row.get("token_contract"),
            raw_amount: row.get("raw_amount"),
            payment_amount: row.get("payment_amount"),
            token_price_usd: row.get("token_price_usd"),
            target_price_usd: row.get("target_price_usd"),
            usd_value: row.get("usd_value"),
            target_amount: row.get("target_amount"),
            status: status
                .parse()
                .map_err(|e: String| AppError::Database(DatabaseError::Query(e)))?,
            distribution_tx_hash: row.get("distribution_tx_hash"),
            pending_distribution_tx_hash: row.get("pending_distribution_tx_hash"),
            pending_distribution_raw_tx: row.get("pending_distribution_raw_tx"),
            block_number: row.get("block_number"),
            attempt_count: row.get("attempt_count"),
            last_error: row.get("last_error"),
            next_retry_at: row.get("next_retry_at"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn row_to_anomaly(row: &PgRow) -> Result<Anomaly, AppError> {
        let kind: String = row.get("kind");
        Ok(Anomaly {
            id: row.get("id"),
            network: row.get("network"),
            source_tx_hash: row.get("source_tx_hash"),
            block_number: row.get("block_number"),
            kind: kind
                .parse()
                .map_err(|e: String| AppError::Database(DatabaseError::Query(e)))?,
            detail: row.get("detail"),
            created_at: row.get("created_at"),
        })
    }

    /// Explain why a guarded update matched no row
    async fn transition_error(&self, key: &PaymentKey, target: PaymentStatus) -> AppError {
        match self.get_payment(key).await {
            Ok(Some(record)) => AppError::InvalidTransition {
                from: record.status,
                to: target,
            },
            Ok(None) => AppError::Database(DatabaseError::NotFound(key.to_string())),
            Err(e) => e,
        }
    }
}

fn query_error(e: sqlx::Error) -> AppError {
    AppError::Database(DatabaseError::from(e))
}

fn to_i64(value: u64, field: &str) -> Result<i64, AppError> {
    i64::try_from(value)
        .map_err(|_| AppError::Database(DatabaseError::Query(format!("{} out of range", field))))
}

#[async_trait]
impl PaymentLedger for PostgresLedger {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Connection(e.to_string())))?;
        Ok(())
    }

    #[instrument(skip(self, record), fields(network = %record.network, tx_hash = %record.source_tx_hash))]
    async fn upsert_detected(&self, record: &PaymentRecord) -> Result<InsertOutcome, AppError> {
        let sql = format!(
            r#"
            INSERT INTO payment_records ({RECORD_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                    $15, $16, $17, $18, $19, $20, $21, $22)
            ON CONFLICT (network, source_tx_hash) DO NOTHING
            RETURNING {RECORD_COLUMNS}
            "#
        );
        let inserted = sqlx::query(&sql)
            .bind(&record.network)
            .bind(&record.source_tx_hash)
            .bind(&record.buyer_address)
            .bind(&record.treasury_address)
            .bind(&record.payment_token)
            .bind(&record.token_contract)
            .bind(&record.raw_amount)
            .bind(record.payment_amount)
            .bind(record.token_price_usd)
            .bind(record.target_price_usd)
            .bind(record.usd_value)
            .bind(record.target_amount)
            .bind(record.status.as_str())
            .bind(&record.distribution_tx_hash)
            .bind(&record.pending_distribution_tx_hash)
            .bind(&record.pending_distribution_raw_tx)
            .bind(record.block_number)
            .bind(record.attempt_count)
            .bind(&record.last_error)
            .bind(record.next_retry_at)
            .bind(record.created_at)
            .bind(record.updated_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error)?;

        if let Some(row) = inserted {
            return Ok(InsertOutcome::Inserted(Self::row_to_record(&row)?));
        }

        let existing = self
            .get_payment(&record.key())
            .await?
            .ok_or_else(|| AppError::Database(DatabaseError::NotFound(record.key().to_string())))?;
        Ok(InsertOutcome::AlreadyExists(existing))
    }

    #[instrument(skip(self))]
    async fn claim_for_distribution(&self) -> Result<Option<PaymentRecord>, AppError> {
        let sql = format!(
            r#"
            UPDATE payment_records
            SET status = 'distributing', updated_at = NOW()
            WHERE (network, source_tx_hash) IN (
                SELECT network, source_tx_hash
                FROM payment_records
                WHERE status = 'confirmed'
                  AND (next_retry_at IS NULL OR next_retry_at <= NOW())
                ORDER BY created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
              AND status = 'confirmed'
            RETURNING {RECORD_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error)?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    #[instrument(skip(self, raw_transaction))]
    async fn record_broadcast(
        &self,
        key: &PaymentKey,
        tx_hash: &str,
        raw_transaction: &str,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE payment_records
            SET pending_distribution_tx_hash = $3,
                pending_distribution_raw_tx = $4,
                updated_at = NOW()
            WHERE network = $1 AND source_tx_hash = $2 AND status = 'distributing'
            "#,
        )
        .bind(&key.network)
        .bind(&key.source_tx_hash)
        .bind(tx_hash)
        .bind(raw_transaction)
        .execute(&self.pool)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(key, PaymentStatus::Distributing).await);
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn clear_broadcast(&self, key: &PaymentKey, tx_hash: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE payment_records
            SET pending_distribution_tx_hash = NULL,
                pending_distribution_raw_tx = NULL,
                updated_at = NOW()
            WHERE network = $1 AND source_tx_hash = $2
              AND status = 'distributing'
              AND pending_distribution_tx_hash = $3
            "#,
        )
        .bind(&key.network)
        .bind(&key.source_tx_hash)
        .bind(tx_hash)
        .execute(&self.pool)
        .await
        .map_err(query_error)?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn mark_distributed(&self, key: &PaymentKey, tx_hash: &str) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE payment_records
            SET status = 'distributed',
                distribution_tx_hash = $3,
                next_retry_at = NULL,
                updated_at = NOW()
            WHERE network = $1 AND source_tx_hash = $2 AND status = 'distributing'
            "#,
        )
        .bind(&key.network)
        .bind(&key.source_tx_hash)
        .bind(tx_hash)
        .execute(&self.pool)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(key, PaymentStatus::Distributed).await);
        }
        Ok(())
    }

    #[instrument(skip(self, error))]
    async fn mark_retry(
        &self,
        key: &PaymentKey,
        error: &str,
        max_attempts: i32,
        next_retry_at: DateTime<Utc>,
    ) -> Result<PaymentStatus, AppError> {
        let row = sqlx::query(
            r#"
            UPDATE payment_records
            SET attempt_count = attempt_count + 1,
                last_error = $3,
                status = CASE WHEN attempt_count + 1 >= $4 THEN 'failed' ELSE 'confirmed' END,
                next_retry_at = CASE WHEN attempt_count + 1 >= $4 THEN NULL ELSE $5 END,
                updated_at = NOW()
            WHERE network = $1 AND source_tx_hash = $2 AND status = 'distributing'
            RETURNING status
            "#,
        )
        .bind(&key.network)
        .bind(&key.source_tx_hash)
        .bind(error)
        .bind(max_attempts)
        .bind(next_retry_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_error)?;

        match row {
            Some(row) => {
                let status: String = row.get("status");
                status
                    .parse()
                    .map_err(|e: String| AppError::Database(DatabaseError::Query(e)))
            }
            None => Err(self.transition_error(key, PaymentStatus::Confirmed).await),
        }
    }

    #[instrument(skip(self))]
    async fn get_payment(&self, key: &PaymentKey) -> Result<Option<PaymentRecord>, AppError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM payment_records WHERE network = $1 AND source_tx_hash = $2"
        );
        let row = sqlx::query(&sql)
            .bind(&key.network)
            .bind(&key.source_tx_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error)?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    #[instrument(skip(self))]
    async fn get_by_tx_hash(&self, tx_hash: &str) -> Result<Option<PaymentRecord>, AppError> {
        let sql = format!(
            r#"
            SELECT {RECORD_COLUMNS} FROM payment_records
            WHERE source_tx_hash = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#
        );
        let row = sqlx::query(&sql)
            .bind(normalize_hex(tx_hash))
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error)?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    #[instrument(skip(self))]
    async fn get_by_user(&self, buyer_address: &str) -> Result<Vec<PaymentRecord>, AppError> {
        let sql = format!(
            r#"
            SELECT {RECORD_COLUMNS} FROM payment_records
            WHERE LOWER(buyer_address) = LOWER($1)
            ORDER BY created_at DESC
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(buyer_address.trim())
            .fetch_all(&self.pool)
            .await
            .map_err(query_error)?;

        rows.iter().map(Self::row_to_record).collect()
    }

    #[instrument(skip(self))]
    async fn get_by_status(
        &self,
        status: PaymentStatus,
        limit: i64,
    ) -> Result<Vec<PaymentRecord>, AppError> {
        let sql = format!(
            r#"
            SELECT {RECORD_COLUMNS} FROM payment_records
            WHERE status = $1
            ORDER BY updated_at DESC
            LIMIT $2
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(limit.clamp(1, 500))
            .fetch_all(&self.pool)
            .await
            .map_err(query_error)?;

        rows.iter().map(Self::row_to_record).collect()
    }

    #[instrument(skip(self))]
    async fn get_from_block(
        &self,
        network: &str,
        from_block: u64,
    ) -> Result<Vec<PaymentRecord>, AppError> {
        let sql = format!(
            r#"
            SELECT {RECORD_COLUMNS} FROM payment_records
            WHERE network = $1 AND block_number >= $2
            ORDER BY block_number ASC, source_tx_hash ASC
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(network)
            .bind(to_i64(from_block, "block_number")?)
            .fetch_all(&self.pool)
            .await
            .map_err(query_error)?;

        rows.iter().map(Self::row_to_record).collect()
    }

    #[instrument(skip(self))]
    async fn get_aggregate_stats(&self) -> Result<AggregateStats, AppError> {
        let rows = sqlx::query(
            r#"
            SELECT network,
                   payment_token,
                   COUNT(*) AS payments,
                   COALESCE(SUM(usd_value), 0) AS usd_raised,
                   COALESCE(SUM(target_amount) FILTER (WHERE status = 'distributed'), 0)
                       AS target_distributed
            FROM payment_records
            GROUP BY network, payment_token
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(query_error)?;

        let mut stats = AggregateStats::default();
        let mut by_network: BTreeMap<String, StatsBreakdown> = BTreeMap::new();
        let mut by_token: BTreeMap<String, StatsBreakdown> = BTreeMap::new();

        for row in &rows {
            let network: String = row.get("network");
            let token: String = row.get("payment_token");
            let payments: i64 = row.get("payments");
            let usd_raised: Decimal = row.get("usd_raised");
            let distributed: Decimal = row.get("target_distributed");

            stats.total_payments += payments;
            stats.total_usd_raised += usd_raised;
            stats.total_target_distributed += distributed;
            for slice in [
                by_network.entry(network).or_default(),
                by_token.entry(token).or_default(),
            ] {
                slice.payments += payments;
                slice.usd_raised += usd_raised;
                slice.target_distributed += distributed;
            }
        }

        stats.by_network = by_network;
        stats.by_token = by_token;
        Ok(stats)
    }

    #[instrument(skip(self))]
    async fn find_stale_distributing(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PaymentRecord>, AppError> {
        let sql = format!(
            r#"
            SELECT {RECORD_COLUMNS} FROM payment_records
            WHERE status = 'distributing' AND updated_at < $1
            ORDER BY updated_at ASC
            LIMIT $2
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(older_than)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(query_error)?;

        rows.iter().map(Self::row_to_record).collect()
    }

    #[instrument(skip(self))]
    async fn get_checkpoint(&self, network: &str) -> Result<Option<BlockCheckpoint>, AppError> {
        let row = sqlx::query(
            r#"
            SELECT network, block_number, block_hash, updated_at
            FROM network_checkpoints
            WHERE network = $1
            "#,
        )
        .bind(network)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_error)?;

        row.map(|row| {
            let block_number: i64 = row.get("block_number");
            Ok::<_, AppError>(BlockCheckpoint {
                network: row.get("network"),
                block_number: u64::try_from(block_number).map_err(|_| {
                    AppError::Database(DatabaseError::Query(format!(
                        "negative checkpoint {}",
                        block_number
                    )))
                })?,
                block_hash: row.get("block_hash"),
                updated_at: row.get("updated_at"),
            })
        })
        .transpose()
    }

    #[instrument(skip(self, checkpoint), fields(network = %checkpoint.network, block = checkpoint.block_number))]
    async fn save_checkpoint(&self, checkpoint: &BlockCheckpoint) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO network_checkpoints (network, block_number, block_hash, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (network) DO UPDATE
            SET block_number = EXCLUDED.block_number,
                block_hash = EXCLUDED.block_hash,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&checkpoint.network)
        .bind(to_i64(checkpoint.block_number, "block_number")?)
        .bind(&checkpoint.block_hash)
        .bind(checkpoint.updated_at)
        .execute(&self.pool)
        .await
        .map_err(query_error)?;
        Ok(())
    }

    #[instrument(skip(self, anomaly), fields(network = %anomaly.network, kind = %anomaly.kind))]
    async fn record_anomaly(&self, anomaly: &Anomaly) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO payment_anomalies
                (id, network, source_tx_hash, block_number, kind, detail, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (network, source_tx_hash, kind)
                WHERE source_tx_hash IS NOT NULL
                DO NOTHING
            "#,
        )
        .bind(anomaly.id)
        .bind(&anomaly.network)
        .bind(&anomaly.source_tx_hash)
        .bind(anomaly.block_number)
        .bind(anomaly.kind.as_str())
        .bind(&anomaly.detail)
        .bind(anomaly.created_at)
        .execute(&self.pool)
        .await
        .map_err(query_error)?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn list_anomalies(&self, limit: i64) -> Result<Vec<Anomaly>, AppError> {
        let rows = sqlx::query(
            r#"
            SELECT id, network, source_tx_hash, block_number, kind, detail, created_at
            FROM payment_anomalies
            ORDER BY created_at DESC, id DESC
            LIMIT $1
            "#,
        )
        .bind(limit.clamp(1, 500))
        .fetch_all(&self.pool)
        .await
        .map_err(query_error)?;

        rows.iter().map(Self::row_to_anomaly).collect()
    }
}
