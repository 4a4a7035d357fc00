//! Storage seams for the legacy flat rate table and the normalized schema.
//!
//! Both schemas are reached through async traits that hand out boxed transactions, so the
//! cleanup engine runs unchanged against Postgres or the in-memory adapters used in tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use eggrates_core::{CityEntity, CityStatePair, CitySummary, NormalizedRate, PairSummary, RateRecord};
use thiserror::Error;

pub mod memory;
pub mod postgres;

pub use memory::{MemoryNormalized, MemoryPrimary};
pub use postgres::PgStorage;

pub const CRATE_NAME: &str = "eggrates-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("write conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("injected failure on write #{0}")]
    InjectedFailure(usize),
    #[error("database error: {0}")]
    Sqlx(sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db)
                if db.is_unique_violation() || db.is_foreign_key_violation() =>
            {
                StoreError::Conflict(db.message().to_string())
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Unavailable(err.to_string())
            }
            _ => StoreError::Sqlx(err),
        }
    }
}

/// Read access plus transactions over the legacy `egg_rates` table.
#[async_trait]
pub trait PrimaryStore: Send + Sync {
    /// One summary per distinct (city, state) label, ordered by city then state.
    async fn pair_summaries(&self) -> Result<Vec<PairSummary>, StoreError>;

    async fn rates_for_pair(&self, city: &str, state: &str) -> Result<Vec<RateRecord>, StoreError>;

    async fn begin(&self) -> Result<Box<dyn PrimaryTx>, StoreError>;

    /// Canonical pairs queued for projection into the normalized schema, ordered.
    async fn pending_sync(&self) -> Result<Vec<CityStatePair>, StoreError>;

    /// Drops the given pairs from the sync outbox once they have been projected.
    async fn clear_sync(&self, pairs: &[CityStatePair]) -> Result<u64, StoreError>;
}

/// Writes inside one primary transaction. Dropping without commit discards them.
#[async_trait]
pub trait PrimaryTx: Send {
    async fn rates_for_pair(&mut self, city: &str, state: &str)
        -> Result<Vec<RateRecord>, StoreError>;

    async fn rate_exists(
        &mut self,
        city: &str,
        state: &str,
        date: NaiveDate,
    ) -> Result<bool, StoreError>;

    async fn insert_rate(
        &mut self,
        city: &str,
        state: &str,
        date: NaiveDate,
        rate: f64,
    ) -> Result<i64, StoreError>;

    /// Overwrites the rate of every row matching (city, state, date).
    async fn update_rate(
        &mut self,
        city: &str,
        state: &str,
        date: NaiveDate,
        rate: f64,
    ) -> Result<u64, StoreError>;

    async fn delete_pair(&mut self, city: &str, state: &str) -> Result<u64, StoreError>;

    async fn rename_pair(&mut self, from_city: &str, to_city: &str, state: &str)
        -> Result<u64, StoreError>;

    /// Queues a pair in the sync outbox; it becomes visible only if this transaction commits.
    async fn enqueue_sync(&mut self, pair: &CityStatePair) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Read access plus transactions over states, cities and `egg_rates_normalized`.
#[async_trait]
pub trait NormalizedStore: Send + Sync {
    async fn city_summaries(&self) -> Result<Vec<CitySummary>, StoreError>;

    async fn begin(&self) -> Result<Box<dyn NormalizedTx>, StoreError>;
}

#[async_trait]
pub trait NormalizedTx: Send {
    /// All city entities ordered by id.
    async fn cities(&mut self) -> Result<Vec<CityEntity>, StoreError>;

    async fn rename_city(&mut self, city_id: i64, name: &str) -> Result<(), StoreError>;

    async fn rates_for_city(&mut self, city_id: i64) -> Result<Vec<NormalizedRate>, StoreError>;

    async fn move_rate(&mut self, rate_id: i64, to_city_id: i64) -> Result<(), StoreError>;

    async fn delete_rate(&mut self, rate_id: i64) -> Result<(), StoreError>;

    async fn delete_city(&mut self, city_id: i64) -> Result<(), StoreError>;

    /// Id of the state with this name, creating it on first reference.
    async fn ensure_state(&mut self, name: &str) -> Result<i64, StoreError>;

    /// Lowest id among cities with (name, state_id), creating one if none exists.
    async fn ensure_city(&mut self, name: &str, state_id: i64) -> Result<i64, StoreError>;

    async fn upsert_rate(&mut self, city_id: i64, date: NaiveDate, rate: f64)
        -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Explicit handle to both schemas, passed into every cleanup component.
#[derive(Clone)]
pub struct Storage {
    pub primary: Arc<dyn PrimaryStore>,
    pub normalized: Arc<dyn NormalizedStore>,
}

impl Storage {
    pub fn new(
        primary: impl PrimaryStore + 'static,
        normalized: impl NormalizedStore + 'static,
    ) -> Self {
        Self {
            primary: Arc::new(primary),
            normalized: Arc::new(normalized),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }
}
