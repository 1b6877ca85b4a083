//! Storage sink: idempotent upserts of enriched transactions keyed by `transaction_id`.

use crate::config::HistoryConfig;
use crate::error::{HistoryError, StorageError};
use crate::history::{HistoryLookup, UserHistory};
use crate::router::{RoutingDecision, StorageTier};
use crate::store::{format_time, Database};
use crate::types::transaction::{EnrichedTransaction, Location};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use rusqlite::{params, OptionalExtension};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::str::FromStr;
use tracing::debug;

/// Result of an upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// A record with the same transaction id was overwritten
    Updated,
}

/// Destination for enriched transactions. Writes must be idempotent.
#[async_trait]
pub trait StorageSink: Send + Sync {
    async fn upsert(
        &self,
        tx: &EnrichedTransaction,
        decision: &RoutingDecision,
    ) -> Result<UpsertOutcome, StorageError>;
}

/// A stored row, as read back for inspection
#[derive(Debug, Clone)]
pub struct StoredTransaction {
    pub tier: StorageTier,
    pub partition_key: String,
    pub record: EnrichedTransaction,
}

/// SQLite-backed sink with one table per tier.
///
/// Also serves as the recent-activity lookup, reading the hot tier.
#[derive(Clone)]
pub struct SqliteTransactionStore {
    db: Database,
    history: HistoryConfig,
}

impl SqliteTransactionStore {
    pub fn new(db: Database, history: HistoryConfig) -> Self {
        Self { db, history }
    }

    /// Look up a stored transaction in either tier
    pub async fn get(&self, transaction_id: &str) -> Result<Option<StoredTransaction>, StorageError> {
        let transaction_id = transaction_id.to_string();
        self.db
            .call(move |conn| {
                for tier in [StorageTier::Hot, StorageTier::Cold] {
                    let sql = format!(
                        "SELECT partition_key, record FROM {} WHERE transaction_id = ?1",
                        tier.table()
                    );
                    let row: Option<(String, String)> = conn
                        .query_row(&sql, [&transaction_id], |row| Ok((row.get(0)?, row.get(1)?)))
                        .optional()?;
                    if let Some((partition_key, record)) = row {
                        return Ok(Some(StoredTransaction {
                            tier,
                            partition_key,
                            record: serde_json::from_str(&record)?,
                        }));
                    }
                }
                Ok(None)
            })
            .await
    }

    /// Number of rows in a tier
    pub async fn count(&self, tier: StorageTier) -> Result<usize, StorageError> {
        self.db
            .call(move |conn| {
                let sql = format!("SELECT COUNT(*) FROM {}", tier.table());
                let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
                Ok(count as usize)
            })
            .await
    }
}

#[async_trait]
impl StorageSink for SqliteTransactionStore {
    async fn upsert(
        &self,
        tx: &EnrichedTransaction,
        decision: &RoutingDecision,
    ) -> Result<UpsertOutcome, StorageError> {
        let record = serde_json::to_string(tx)?;
        let location = tx
            .event
            .location
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let transaction_id = tx.event.transaction_id.clone();
        let user_id = tx.event.user_id.clone();
        let amount = tx.event.amount.to_string();
        let event_time = format_time(&tx.event.timestamp);
        let processed_at = format_time(&tx.processed_at);
        let category = tx.category.as_str();
        let risk_score = tx.risk_score as i64;
        let risk_bucket = tx.risk_bucket.as_str();
        let tier = decision.tier;
        let partition_key = decision.partition_key.clone();

        let outcome = self
            .db
            .call(move |conn| {
                let txn = conn.transaction()?;

                // A record re-routed to the other tier must not survive there
                let moved = txn.execute(
                    &format!("DELETE FROM {} WHERE transaction_id = ?1", tier.other().table()),
                    [&transaction_id],
                )?;
                let existing: bool = txn
                    .query_row(
                        &format!("SELECT 1 FROM {} WHERE transaction_id = ?1", tier.table()),
                        [&transaction_id],
                        |_| Ok(true),
                    )
                    .optional()?
                    .unwrap_or(false);

                txn.execute(
                    &format!(
                        "INSERT INTO {} (transaction_id, user_id, partition_key, amount, location,
                             event_time, category, risk_score, risk_bucket, record, processed_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                         ON CONFLICT(transaction_id) DO UPDATE SET
                             user_id = excluded.user_id,
                             partition_key = excluded.partition_key,
                             amount = excluded.amount,
                             location = excluded.location,
                             event_time = excluded.event_time,
                             category = excluded.category,
                             risk_score = excluded.risk_score,
                             risk_bucket = excluded.risk_bucket,
                             record = excluded.record,
                             processed_at = excluded.processed_at",
                        tier.table()
                    ),
                    params![
                        transaction_id,
                        user_id,
                        partition_key,
                        amount,
                        location,
                        event_time,
                        category,
                        risk_score,
                        risk_bucket,
                        record,
                        processed_at
                    ],
                )?;
                txn.commit()?;

                Ok(if existing || moved > 0 {
                    UpsertOutcome::Updated
                } else {
                    UpsertOutcome::Inserted
                })
            })
            .await?;

        debug!(
            transaction_id = %tx.event.transaction_id,
            tier = %decision.tier,
            partition_key = %decision.partition_key,
            outcome = ?outcome,
            "Upserted transaction"
        );
        Ok(outcome)
    }
}

#[async_trait]
impl HistoryLookup for SqliteTransactionStore {
    async fn recent_activity(
        &self,
        user_id: &str,
        excluding: &str,
    ) -> Result<UserHistory, HistoryError> {
        let user_id = user_id.to_string();
        let excluding = excluding.to_string();
        let now = Utc::now();
        let lookback_start = format_time(&(now - Duration::days(self.history.lookback_days)));
        let velocity_start =
            format_time(&(now - Duration::minutes(self.history.velocity_window_minutes)));
        let max_samples = self.history.max_samples as i64;

        let history = self
            .db
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT amount, location FROM hot_transactions
                     WHERE user_id = ?1 AND event_time >= ?2 AND transaction_id != ?4
                     ORDER BY event_time DESC
                     LIMIT ?3",
                )?;
                let rows = stmt
                    .query_map(params![user_id, lookback_start, max_samples, excluding], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                let mut history = UserHistory::default();
                for (amount, location) in rows {
                    let amount = Decimal::from_str(&amount)
                        .map_err(|e| StorageError::Corrupt(format!("amount '{}': {}", amount, e)))?;
                    if let Some(value) = amount.to_f64() {
                        history.amounts.push(value);
                    }
                    if let Some(location) = location {
                        let location: Location = serde_json::from_str(&location)?;
                        if !history.locations.contains(&location) {
                            history.locations.push(location);
                        }
                    }
                }

                let recent: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM hot_transactions
                     WHERE user_id = ?1 AND event_time >= ?2 AND transaction_id != ?3",
                    params![user_id, velocity_start, excluding],
                    |row| row.get(0),
                )?;
                history.recent_count = recent as u32;
                Ok(history)
            })
            .await?;

        Ok(history)
    }
}
