//! In-memory adapters. A transaction works on a snapshot taken at `begin` and swaps it
//! back on commit, so readers only ever observe committed state.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::NaiveDate;
use eggrates_core::{
    CityEntity, CityStatePair, CitySummary, NormalizedRate, PairSummary, RateRecord, StateEntity,
};

use crate::{NormalizedStore, NormalizedTx, PrimaryStore, PrimaryTx, StoreError};

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, StoreError> {
    mutex
        .lock()
        .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
}

#[derive(Debug, Clone, Default)]
struct PrimaryData {
    next_id: i64,
    rows: BTreeMap<i64, RateRecord>,
    outbox: BTreeSet<CityStatePair>,
}

impl PrimaryData {
    fn insert(&mut self, city: &str, state: &str, date: NaiveDate, rate: f64) -> i64 {
        self.next_id += 1;
        let id = self.next_id;
        self.rows.insert(
            id,
            RateRecord {
                id,
                city: city.to_string(),
                state: state.to_string(),
                date,
                rate,
            },
        );
        id
    }

    fn rows_for(&self, city: &str, state: &str) -> Vec<RateRecord> {
        let mut rows = self
            .rows
            .values()
            .filter(|r| r.city == city && r.state == state)
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| a.date.cmp(&b.date).then(a.id.cmp(&b.id)));
        rows
    }
}

#[derive(Debug, Default)]
struct PrimaryInner {
    data: PrimaryData,
    fail_on_write: Option<usize>,
    unavailable: bool,
}

/// Shared-handle in-memory `egg_rates` table; clones see the same rows.
#[derive(Debug, Clone, Default)]
pub struct MemoryPrimary {
    inner: Arc<Mutex<PrimaryInner>>,
}

impl MemoryPrimary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, city: &str, state: &str, date: NaiveDate, rate: f64) -> i64 {
        match self.inner.lock() {
            Ok(mut inner) => inner.data.insert(city, state, date, rate),
            Err(poisoned) => poisoned.into_inner().data.insert(city, state, date, rate),
        }
    }

    /// Committed rows ordered by id.
    pub fn rows(&self) -> Vec<RateRecord> {
        match self.inner.lock() {
            Ok(inner) => inner.data.rows.values().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().data.rows.values().cloned().collect(),
        }
    }

    /// Makes the `n`th write (1-based) of the next transaction fail.
    pub fn fail_on_write(&self, n: usize) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fail_on_write = Some(n);
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.unavailable = unavailable;
        }
    }

    fn check_available(inner: &PrimaryInner) -> Result<(), StoreError> {
        if inner.unavailable {
            return Err(StoreError::Unavailable("primary store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PrimaryStore for MemoryPrimary {
    async fn pair_summaries(&self) -> Result<Vec<PairSummary>, StoreError> {
        let inner = lock(&self.inner)?;
        Self::check_available(&inner)?;

        let mut grouped: BTreeMap<(String, String), PairSummary> = BTreeMap::new();
        for row in inner.data.rows.values() {
            let entry = grouped
                .entry((row.city.clone(), row.state.clone()))
                .or_insert_with(|| PairSummary {
                    city: row.city.clone(),
                    state: row.state.clone(),
                    rate_count: 0,
                    earliest_date: None,
                    latest_date: None,
                });
            entry.rate_count += 1;
            entry.earliest_date = Some(entry.earliest_date.map_or(row.date, |d| d.min(row.date)));
            entry.latest_date = Some(entry.latest_date.map_or(row.date, |d| d.max(row.date)));
        }
        Ok(grouped.into_values().collect())
    }

    async fn rates_for_pair(&self, city: &str, state: &str) -> Result<Vec<RateRecord>, StoreError> {
        let inner = lock(&self.inner)?;
        Self::check_available(&inner)?;
        Ok(inner.data.rows_for(city, state))
    }

    async fn begin(&self) -> Result<Box<dyn PrimaryTx>, StoreError> {
        let mut inner = lock(&self.inner)?;
        Self::check_available(&inner)?;
        Ok(Box::new(MemoryPrimaryTx {
            shared: Arc::clone(&self.inner),
            working: inner.data.clone(),
            writes: 0,
            fail_on_write: inner.fail_on_write.take(),
        }))
    }

    async fn pending_sync(&self) -> Result<Vec<CityStatePair>, StoreError> {
        let inner = lock(&self.inner)?;
        Self::check_available(&inner)?;
        Ok(inner.data.outbox.iter().cloned().collect())
    }

    async fn clear_sync(&self, pairs: &[CityStatePair]) -> Result<u64, StoreError> {
        let mut inner = lock(&self.inner)?;
        Self::check_available(&inner)?;
        let mut cleared = 0;
        for pair in pairs {
            if inner.data.outbox.remove(pair) {
                cleared += 1;
            }
        }
        Ok(cleared)
    }
}

struct MemoryPrimaryTx {
    shared: Arc<Mutex<PrimaryInner>>,
    working: PrimaryData,
    writes: usize,
    fail_on_write: Option<usize>,
}

impl MemoryPrimaryTx {
    fn record_write(&mut self) -> Result<(), StoreError> {
        self.writes += 1;
        if self.fail_on_write == Some(self.writes) {
            return Err(StoreError::InjectedFailure(self.writes));
        }
        Ok(())
    }
}

#[async_trait]
impl PrimaryTx for MemoryPrimaryTx {
    async fn rates_for_pair(
        &mut self,
        city: &str,
        state: &str,
    ) -> Result<Vec<RateRecord>, StoreError> {
        Ok(self.working.rows_for(city, state))
    }

    async fn rate_exists(
        &mut self,
        city: &str,
        state: &str,
        date: NaiveDate,
    ) -> Result<bool, StoreError> {
        Ok(self
            .working
            .rows
            .values()
            .any(|r| r.city == city && r.state == state && r.date == date))
    }

    async fn insert_rate(
        &mut self,
        city: &str,
        state: &str,
        date: NaiveDate,
        rate: f64,
    ) -> Result<i64, StoreError> {
        self.record_write()?;
        Ok(self.working.insert(city, state, date, rate))
    }

    async fn update_rate(
        &mut self,
        city: &str,
        state: &str,
        date: NaiveDate,
        rate: f64,
    ) -> Result<u64, StoreError> {
        self.record_write()?;
        let mut updated = 0;
        for row in self.working.rows.values_mut() {
            if row.city == city && row.state == state && row.date == date {
                row.rate = rate;
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn delete_pair(&mut self, city: &str, state: &str) -> Result<u64, StoreError> {
        self.record_write()?;
        let before = self.working.rows.len();
        self.working
            .rows
            .retain(|_, r| !(r.city == city && r.state == state));
        Ok((before - self.working.rows.len()) as u64)
    }

    async fn rename_pair(
        &mut self,
        from_city: &str,
        to_city: &str,
        state: &str,
    ) -> Result<u64, StoreError> {
        self.record_write()?;
        let mut renamed = 0;
        for row in self.working.rows.values_mut() {
            if row.city == from_city && row.state == state {
                row.city = to_city.to_string();
                renamed += 1;
            }
        }
        Ok(renamed)
    }

    async fn enqueue_sync(&mut self, pair: &CityStatePair) -> Result<(), StoreError> {
        self.working.outbox.insert(pair.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        let mut inner = lock(&this.shared)?;
        MemoryPrimary::check_available(&inner)?;
        inner.data = this.working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
struct NormalizedData {
    next_state_id: i64,
    next_city_id: i64,
    next_rate_id: i64,
    states: BTreeMap<i64, StateEntity>,
    cities: BTreeMap<i64, CityEntity>,
    rates: BTreeMap<i64, NormalizedRate>,
}

impl NormalizedData {
    fn insert_state(&mut self, name: &str) -> i64 {
        self.next_state_id += 1;
        let id = self.next_state_id;
        self.states.insert(
            id,
            StateEntity {
                id,
                name: name.to_string(),
            },
        );
        id
    }

    fn insert_city(&mut self, id: i64, name: &str, state_id: i64) -> i64 {
        self.next_city_id = self.next_city_id.max(id);
        self.cities.insert(
            id,
            CityEntity {
                id,
                name: name.to_string(),
                state_id,
            },
        );
        id
    }

    fn upsert_rate(&mut self, city_id: i64, date: NaiveDate, rate: f64) -> i64 {
        if let Some(existing) = self
            .rates
            .values_mut()
            .find(|r| r.city_id == city_id && r.date == date)
        {
            existing.rate = rate;
            return existing.id;
        }
        self.next_rate_id += 1;
        let id = self.next_rate_id;
        self.rates.insert(
            id,
            NormalizedRate {
                id,
                city_id,
                date,
                rate,
            },
        );
        id
    }
}

#[derive(Debug, Default)]
struct NormalizedInner {
    data: NormalizedData,
    failing_commits: usize,
}

/// Shared-handle in-memory states/cities/`egg_rates_normalized`.
#[derive(Debug, Clone, Default)]
pub struct MemoryNormalized {
    inner: Arc<Mutex<NormalizedInner>>,
}

impl MemoryNormalized {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_data<R>(&self, f: impl FnOnce(&mut NormalizedData) -> R) -> R {
        match self.inner.lock() {
            Ok(mut inner) => f(&mut inner.data),
            Err(poisoned) => f(&mut poisoned.into_inner().data),
        }
    }

    pub fn insert_state(&self, name: &str) -> i64 {
        self.with_data(|data| data.insert_state(name))
    }

    pub fn insert_city(&self, name: &str, state_id: i64) -> i64 {
        self.with_data(|data| {
            let id = data.next_city_id + 1;
            data.insert_city(id, name, state_id)
        })
    }

    /// Seeds a city with an explicit id, mirroring legacy rows created by other paths.
    pub fn insert_city_with_id(&self, id: i64, name: &str, state_id: i64) -> i64 {
        self.with_data(|data| data.insert_city(id, name, state_id))
    }

    /// Inserts a rate row without the (city_id, date) upsert rule, so legacy
    /// duplicates can be seeded.
    pub fn insert_rate(&self, city_id: i64, date: NaiveDate, rate: f64) -> i64 {
        self.with_data(|data| {
            data.next_rate_id += 1;
            let id = data.next_rate_id;
            data.rates.insert(
                id,
                NormalizedRate {
                    id,
                    city_id,
                    date,
                    rate,
                },
            );
            id
        })
    }

    pub fn states(&self) -> Vec<StateEntity> {
        self.with_data(|data| data.states.values().cloned().collect())
    }

    pub fn cities(&self) -> Vec<CityEntity> {
        self.with_data(|data| data.cities.values().cloned().collect())
    }

    pub fn rates(&self) -> Vec<NormalizedRate> {
        self.with_data(|data| data.rates.values().cloned().collect())
    }

    /// Makes the next `n` commits fail with an unavailable error.
    pub fn fail_next_commits(&self, n: usize) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.failing_commits = n;
        }
    }
}

#[async_trait]
impl NormalizedStore for MemoryNormalized {
    async fn city_summaries(&self) -> Result<Vec<CitySummary>, StoreError> {
        let inner = lock(&self.inner)?;
        let data = &inner.data;
        let mut out = Vec::with_capacity(data.cities.len());
        for city in data.cities.values() {
            let Some(state) = data.states.get(&city.state_id) else {
                continue;
            };
            let rate_count = data.rates.values().filter(|r| r.city_id == city.id).count();
            out.push(CitySummary {
                id: city.id,
                name: city.name.clone(),
                state_id: city.state_id,
                state_name: state.name.clone(),
                rate_count: rate_count as u64,
            });
        }
        Ok(out)
    }

    async fn begin(&self) -> Result<Box<dyn NormalizedTx>, StoreError> {
        let inner = lock(&self.inner)?;
        Ok(Box::new(MemoryNormalizedTx {
            shared: Arc::clone(&self.inner),
            working: inner.data.clone(),
        }))
    }
}

struct MemoryNormalizedTx {
    shared: Arc<Mutex<NormalizedInner>>,
    working: NormalizedData,
}

#[async_trait]
impl NormalizedTx for MemoryNormalizedTx {
    async fn cities(&mut self) -> Result<Vec<CityEntity>, StoreError> {
        Ok(self.working.cities.values().cloned().collect())
    }

    async fn rename_city(&mut self, city_id: i64, name: &str) -> Result<(), StoreError> {
        let city = self
            .working
            .cities
            .get_mut(&city_id)
            .ok_or_else(|| StoreError::NotFound(format!("city {city_id}")))?;
        city.name = name.to_string();
        Ok(())
    }

    async fn rates_for_city(&mut self, city_id: i64) -> Result<Vec<NormalizedRate>, StoreError> {
        Ok(self
            .working
            .rates
            .values()
            .filter(|r| r.city_id == city_id)
            .cloned()
            .collect())
    }

    async fn move_rate(&mut self, rate_id: i64, to_city_id: i64) -> Result<(), StoreError> {
        let date = self
            .working
            .rates
            .get(&rate_id)
            .map(|r| r.date)
            .ok_or_else(|| StoreError::NotFound(format!("normalized rate {rate_id}")))?;
        if self
            .working
            .rates
            .values()
            .any(|r| r.id != rate_id && r.city_id == to_city_id && r.date == date)
        {
            return Err(StoreError::Conflict(format!(
                "city {to_city_id} already has a rate for that date"
            )));
        }
        let rate = self
            .working
            .rates
            .get_mut(&rate_id)
            .ok_or_else(|| StoreError::NotFound(format!("normalized rate {rate_id}")))?;
        rate.city_id = to_city_id;
        Ok(())
    }

    async fn delete_rate(&mut self, rate_id: i64) -> Result<(), StoreError> {
        self.working.rates.remove(&rate_id);
        Ok(())
    }

    /// Cascades to dependent rates, like the `ON DELETE CASCADE` in the schema.
    async fn delete_city(&mut self, city_id: i64) -> Result<(), StoreError> {
        self.working.cities.remove(&city_id);
        self.working.rates.retain(|_, r| r.city_id != city_id);
        Ok(())
    }

    async fn ensure_state(&mut self, name: &str) -> Result<i64, StoreError> {
        if let Some(state) = self.working.states.values().find(|s| s.name == name) {
            return Ok(state.id);
        }
        Ok(self.working.insert_state(name))
    }

    async fn ensure_city(&mut self, name: &str, state_id: i64) -> Result<i64, StoreError> {
        if let Some(city) = self
            .working
            .cities
            .values()
            .find(|c| c.name == name && c.state_id == state_id)
        {
            return Ok(city.id);
        }
        let id = self.working.next_city_id + 1;
        Ok(self.working.insert_city(id, name, state_id))
    }

    async fn upsert_rate(
        &mut self,
        city_id: i64,
        date: NaiveDate,
        rate: f64,
    ) -> Result<(), StoreError> {
        self.working.upsert_rate(city_id, date, rate);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        let mut inner = lock(&this.shared)?;
        if inner.failing_commits > 0 {
            inner.failing_commits -= 1;
            return Err(StoreError::Unavailable("normalized store offline".to_string()));
        }
        inner.data = this.working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    #[tokio::test]
    async fn uncommitted_writes_are_invisible() {
        let primary = MemoryPrimary::new();
        primary.insert("Pune", "Maharashtra", day(1), 5.5);

        let mut tx = primary.begin().await.unwrap();
        tx.insert_rate("Pune", "Maharashtra", day(2), 5.6).await.unwrap();
        assert_eq!(primary.rows().len(), 1);

        tx.rollback().await.unwrap();
        assert_eq!(primary.rows().len(), 1);

        let mut tx = primary.begin().await.unwrap();
        tx.insert_rate("Pune", "Maharashtra", day(2), 5.6).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(primary.rows().len(), 2);
    }

    #[tokio::test]
    async fn injected_failure_hits_the_requested_write() {
        let primary = MemoryPrimary::new();
        primary.fail_on_write(2);

        let mut tx = primary.begin().await.unwrap();
        tx.insert_rate("Pune", "Maharashtra", day(1), 5.5).await.unwrap();
        let err = tx
            .insert_rate("Pune", "Maharashtra", day(2), 5.6)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InjectedFailure(2)));

        // the injection is consumed by the transaction that hit it
        let mut tx = primary.begin().await.unwrap();
        tx.insert_rate("Pune", "Maharashtra", day(1), 5.5).await.unwrap();
        tx.insert_rate("Pune", "Maharashtra", day(2), 5.6).await.unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn pair_summaries_group_by_label() {
        let primary = MemoryPrimary::new();
        primary.insert("Indore (CC)", "Madhya Pradesh", day(3), 5.0);
        primary.insert("Indore (CC)", "Madhya Pradesh", day(1), 4.8);
        primary.insert("Indore", "Madhya Pradesh", day(2), 4.9);

        let summaries = primary.pair_summaries().await.unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].city, "Indore");
        assert_eq!(summaries[1].rate_count, 2);
        assert_eq!(summaries[1].earliest_date, Some(day(1)));
        assert_eq!(summaries[1].latest_date, Some(day(3)));
    }

    #[tokio::test]
    async fn ensure_city_prefers_lowest_id() {
        let normalized = MemoryNormalized::new();
        let state = normalized.insert_state("Maharashtra");
        normalized.insert_city_with_id(7, "Pune", state);
        normalized.insert_city_with_id(1, "Pune", state);

        let mut tx = normalized.begin().await.unwrap();
        assert_eq!(tx.ensure_city("Pune", state).await.unwrap(), 1);
        let nagpur = tx.ensure_city("Nagpur", state).await.unwrap();
        assert_eq!(nagpur, 8);
        assert_eq!(tx.ensure_state("Maharashtra").await.unwrap(), state);
    }

    #[tokio::test]
    async fn failing_commit_leaves_state_untouched() {
        let normalized = MemoryNormalized::new();
        let state = normalized.insert_state("Odisha");
        normalized.fail_next_commits(1);

        let mut tx = normalized.begin().await.unwrap();
        tx.ensure_city("Brahmapur", state).await.unwrap();
        assert!(tx.commit().await.is_err());
        assert!(normalized.cities().is_empty());
    }

    #[tokio::test]
    async fn sync_outbox_follows_the_transaction() {
        let primary = MemoryPrimary::new();
        let pair = CityStatePair::new("Varanasi", "Uttar Pradesh");

        let mut tx = primary.begin().await.unwrap();
        tx.enqueue_sync(&pair).await.unwrap();
        tx.rollback().await.unwrap();
        assert!(primary.pending_sync().await.unwrap().is_empty());

        let mut tx = primary.begin().await.unwrap();
        tx.enqueue_sync(&pair).await.unwrap();
        tx.enqueue_sync(&pair).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(primary.pending_sync().await.unwrap(), vec![pair.clone()]);

        assert_eq!(primary.clear_sync(&[pair]).await.unwrap(), 1);
        assert!(primary.pending_sync().await.unwrap().is_empty());
    }
}
