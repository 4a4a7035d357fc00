//! Keeps states/cities/`egg_rates_normalized` in line with the primary table.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::sync::Arc;

use eggrates_core::{CityStatePair, NameNormalizer};
use eggrates_storage::{NormalizedStore, NormalizedTx, PrimaryStore, StoreError};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

/// What happens to rates that point at a duplicate city entity being removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollapsePolicy {
    /// Re-point rates at the surviving entity; on a date clash the survivor's row stays.
    #[default]
    Reassign,
    /// Delete the duplicate entity and, through the cascade, its rates.
    DeleteOnly,
}

impl FromStr for CollapsePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reassign" => Ok(Self::Reassign),
            "delete_only" | "delete-only" => Ok(Self::DeleteOnly),
            other => Err(format!("unknown collapse policy {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub normalized_cities_cleaned: u64,
    pub normalized_cities_skipped: u64,
    pub normalized_duplicates_removed: u64,
    pub normalized_rates_reassigned: u64,
    pub normalized_rates_dropped: u64,
    pub rates_projected: u64,
}

pub struct SecondarySync {
    primary: Arc<dyn PrimaryStore>,
    normalized: Arc<dyn NormalizedStore>,
    normalizer: NameNormalizer,
    policy: CollapsePolicy,
}

impl SecondarySync {
    pub fn new(
        primary: Arc<dyn PrimaryStore>,
        normalized: Arc<dyn NormalizedStore>,
        normalizer: NameNormalizer,
        policy: CollapsePolicy,
    ) -> Self {
        Self {
            primary,
            normalized,
            normalizer,
            policy,
        }
    }

    /// Syncs every pair in the primary store's outbox, then clears them. The outbox is
    /// written by the reconciliation transaction, so pairs left behind by a failed sync
    /// are picked up by the next run.
    pub async fn sync_pending(&self) -> Result<SyncReport, StoreError> {
        let pending = self.primary.pending_sync().await?;
        let report = self.sync_normalized(&pending).await?;
        if !pending.is_empty() {
            // already projected; a failed clear only means they are projected again
            if let Err(err) = self.primary.clear_sync(&pending).await {
                warn!(error = %err, pairs = pending.len(), "could not clear the sync outbox");
            }
        }
        Ok(report)
    }

    /// Cleans coded entity names, collapses duplicate entities onto the lowest id, then
    /// projects the primary rows of every `outbox` pair. One transaction; safe to rerun.
    #[instrument(skip_all, fields(outbox = outbox.len(), policy = ?self.policy))]
    pub async fn sync_normalized(&self, outbox: &[CityStatePair]) -> Result<SyncReport, StoreError> {
        let mut tx = self.normalized.begin().await?;
        match self.apply(tx.as_mut(), outbox).await {
            Ok(report) => {
                tx.commit().await?;
                info!(
                    cleaned = report.normalized_cities_cleaned,
                    removed = report.normalized_duplicates_removed,
                    projected = report.rates_projected,
                    "normalized schema synced"
                );
                Ok(report)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "rollback after failed sync also failed");
                }
                Err(err)
            }
        }
    }

    async fn apply(
        &self,
        tx: &mut dyn NormalizedTx,
        outbox: &[CityStatePair],
    ) -> Result<SyncReport, StoreError> {
        let mut report = SyncReport::default();
        self.clean_names(tx, &mut report).await?;
        self.collapse_duplicates(tx, &mut report).await?;
        self.project(tx, outbox, &mut report).await?;
        Ok(report)
    }

    async fn clean_names(
        &self,
        tx: &mut dyn NormalizedTx,
        report: &mut SyncReport,
    ) -> Result<(), StoreError> {
        for city in tx.cities().await? {
            if !self.normalizer.is_coded(&city.name) {
                continue;
            }
            let canonical = self.normalizer.normalize(&city.name);
            if canonical.is_empty() || self.normalizer.is_coded(&canonical) {
                warn!(city_id = city.id, name = %city.name, canonical = %canonical, "skipping city entity without a clean canonical name");
                report.normalized_cities_skipped += 1;
                continue;
            }
            tx.rename_city(city.id, &canonical).await?;
            report.normalized_cities_cleaned += 1;
        }
        Ok(())
    }

    async fn collapse_duplicates(
        &self,
        tx: &mut dyn NormalizedTx,
        report: &mut SyncReport,
    ) -> Result<(), StoreError> {
        // cities() is ordered by id, so the first id per key is the survivor
        let mut by_key: BTreeMap<(String, i64), Vec<i64>> = BTreeMap::new();
        for city in tx.cities().await? {
            by_key
                .entry((city.name, city.state_id))
                .or_default()
                .push(city.id);
        }

        for ids in by_key.into_values().filter(|ids| ids.len() > 1) {
            let survivor = ids[0];
            for &duplicate in &ids[1..] {
                match self.policy {
                    CollapsePolicy::Reassign => {
                        let mut taken: BTreeSet<_> = tx
                            .rates_for_city(survivor)
                            .await?
                            .into_iter()
                            .map(|r| r.date)
                            .collect();
                        for rate in tx.rates_for_city(duplicate).await? {
                            if taken.insert(rate.date) {
                                tx.move_rate(rate.id, survivor).await?;
                                report.normalized_rates_reassigned += 1;
                            } else {
                                tx.delete_rate(rate.id).await?;
                                report.normalized_rates_dropped += 1;
                            }
                        }
                    }
                    CollapsePolicy::DeleteOnly => {
                        report.normalized_rates_dropped +=
                            tx.rates_for_city(duplicate).await?.len() as u64;
                    }
                }
                tx.delete_city(duplicate).await?;
                report.normalized_duplicates_removed += 1;
            }
        }
        Ok(())
    }

    async fn project(
        &self,
        tx: &mut dyn NormalizedTx,
        outbox: &[CityStatePair],
        report: &mut SyncReport,
    ) -> Result<(), StoreError> {
        let pairs: BTreeSet<&CityStatePair> = outbox.iter().collect();
        for pair in pairs {
            let rows = self.primary.rates_for_pair(&pair.city, &pair.state).await?;
            if rows.is_empty() {
                continue;
            }
            let state_id = tx.ensure_state(&pair.state).await?;
            let city_id = tx.ensure_city(&pair.city, state_id).await?;
            for row in rows {
                tx.upsert_rate(city_id, row.date, row.rate).await?;
                report.rates_projected += 1;
            }
        }
        Ok(())
    }
}
