//! Applies detected groups to the primary table inside one transaction.

use std::sync::Arc;

use eggrates_core::{DuplicateGroup, ReconcileAction};
use eggrates_storage::{PrimaryStore, PrimaryTx, StoreError};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::CleanupError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessedDuplicate {
    pub city_with_code: String,
    pub clean_city: String,
    pub state: String,
    pub state_code: Option<String>,
    pub action: ReconcileAction,
    pub rates_moved: u64,
    pub rates_inserted: u64,
    pub rates_overwritten: u64,
    pub records_removed: u64,
    pub records_renamed: u64,
    pub details: Vec<String>,
}

impl ProcessedDuplicate {
    fn for_group(group: &DuplicateGroup) -> Self {
        Self {
            city_with_code: group.coded_city.clone(),
            clean_city: group.canonical_city.clone(),
            state: group.state.clone(),
            state_code: group.state_code.clone(),
            action: group.action(),
            rates_moved: 0,
            rates_inserted: 0,
            rates_overwritten: 0,
            records_removed: 0,
            records_renamed: 0,
            details: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub total_duplicates_found: u64,
    pub cities_merged: u64,
    pub cities_renamed: u64,
    pub rates_consolidated: u64,
    pub records_removed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconciliationReport {
    pub processed: Vec<ProcessedDuplicate>,
    pub statistics: ReconcileStats,
}

pub struct ReconciliationExecutor {
    primary: Arc<dyn PrimaryStore>,
}

impl ReconciliationExecutor {
    pub fn new(primary: Arc<dyn PrimaryStore>) -> Self {
        Self { primary }
    }

    /// All groups commit together or not at all.
    #[instrument(skip_all, fields(groups = groups.len()))]
    pub async fn reconcile(
        &self,
        groups: &[DuplicateGroup],
    ) -> Result<ReconciliationReport, CleanupError> {
        let mut tx = self
            .primary
            .begin()
            .await
            .map_err(|err| CleanupError::Transaction(err.to_string()))?;

        match apply_groups(tx.as_mut(), groups).await {
            Ok(report) => {
                tx.commit()
                    .await
                    .map_err(|err| CleanupError::Transaction(err.to_string()))?;
                info!(
                    merged = report.statistics.cities_merged,
                    renamed = report.statistics.cities_renamed,
                    removed = report.statistics.records_removed,
                    "reconciliation committed"
                );
                Ok(report)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "rollback after failed reconciliation also failed");
                }
                Err(CleanupError::Transaction(err.to_string()))
            }
        }
    }
}

async fn apply_groups(
    tx: &mut dyn PrimaryTx,
    groups: &[DuplicateGroup],
) -> Result<ReconciliationReport, StoreError> {
    let mut report = ReconciliationReport::default();
    report.statistics.total_duplicates_found = groups.len() as u64;

    for group in groups {
        let mut processed = ProcessedDuplicate::for_group(group);
        match group.action() {
            ReconcileAction::Merge => {
                merge_group(tx, group, &mut processed).await?;
                report.statistics.cities_merged += 1;
                report.statistics.rates_consolidated += processed.rates_moved;
                report.statistics.records_removed += processed.records_removed;
            }
            ReconcileAction::Rename => {
                let renamed = tx
                    .rename_pair(&group.coded_city, &group.canonical_city, &group.state)
                    .await?;
                processed.records_renamed = renamed;
                processed.details.push(format!(
                    "Renamed '{}' to '{}' ({renamed} records)",
                    group.coded_city, group.canonical_city
                ));
                report.statistics.cities_renamed += 1;
                report.statistics.rates_consolidated += renamed;
            }
        }
        tx.enqueue_sync(&group.canonical_pair()).await?;
        report.processed.push(processed);
    }

    Ok(report)
}

/// Coded rows win on overlapping dates; they are the more recent imports.
async fn merge_group(
    tx: &mut dyn PrimaryTx,
    group: &DuplicateGroup,
    processed: &mut ProcessedDuplicate,
) -> Result<(), StoreError> {
    let coded_rows = tx.rates_for_pair(&group.coded_city, &group.state).await?;
    for row in &coded_rows {
        if tx
            .rate_exists(&group.canonical_city, &group.state, row.date)
            .await?
        {
            tx.update_rate(&group.canonical_city, &group.state, row.date, row.rate)
                .await?;
            processed.rates_overwritten += 1;
        } else {
            tx.insert_rate(&group.canonical_city, &group.state, row.date, row.rate)
                .await?;
            processed.rates_inserted += 1;
        }
    }
    processed.rates_moved = processed.rates_inserted + processed.rates_overwritten;

    let removed = tx.delete_pair(&group.coded_city, &group.state).await?;
    processed.records_removed = removed;
    processed.details.push(format!(
        "Moved {} rates from '{}' to '{}'",
        processed.rates_moved, group.coded_city, group.canonical_city
    ));
    processed.details.push(format!(
        "Deleted {removed} records for '{}'",
        group.coded_city
    ));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::DuplicateDetector;
    use chrono::NaiveDate;
    use eggrates_core::CityStatePair;
    use eggrates_storage::MemoryPrimary;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    async fn detect(primary: &MemoryPrimary) -> Vec<DuplicateGroup> {
        let pairs = primary
            .pair_summaries()
            .await
            .unwrap()
            .iter()
            .map(|s| s.pair())
            .collect::<Vec<CityStatePair>>();
        DuplicateDetector::default().find_duplicates(&pairs).groups
    }

    fn snapshot(primary: &MemoryPrimary) -> Vec<(String, String, NaiveDate, f64)> {
        let mut rows = primary
            .rows()
            .into_iter()
            .map(|r| (r.city, r.state, r.date, r.rate))
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| (&a.0, &a.1, a.2).cmp(&(&b.0, &b.1, b.2)));
        rows
    }

    #[tokio::test]
    async fn merge_overwrites_with_coded_value() {
        let primary = MemoryPrimary::new();
        primary.insert("Allahabad (CC)", "UP", date("2024-01-01"), 5.0);
        primary.insert("Allahabad", "UP", date("2024-01-01"), 4.5);

        let executor = ReconciliationExecutor::new(Arc::new(primary.clone()));
        let report = executor.reconcile(&detect(&primary).await).await.unwrap();

        assert_eq!(
            snapshot(&primary),
            vec![("Allahabad".to_string(), "UP".to_string(), date("2024-01-01"), 5.0)]
        );
        assert_eq!(report.processed[0].action, ReconcileAction::Merge);
        assert_eq!(report.processed[0].rates_overwritten, 1);
        assert_eq!(report.processed[0].records_removed, 1);
        assert_eq!(
            primary.pending_sync().await.unwrap(),
            vec![CityStatePair::new("Allahabad", "UP")]
        );
    }

    #[tokio::test]
    async fn merge_inserts_missing_dates() {
        let primary = MemoryPrimary::new();
        primary.insert("Chennai (CC)", "Tamil Nadu", date("2024-01-02"), 5.2);
        primary.insert("Chennai (CC)", "Tamil Nadu", date("2024-01-03"), 5.3);
        primary.insert("Chennai", "Tamil Nadu", date("2024-01-01"), 5.1);

        let executor = ReconciliationExecutor::new(Arc::new(primary.clone()));
        let report = executor.reconcile(&detect(&primary).await).await.unwrap();

        let rows = snapshot(&primary);
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.0 == "Chennai"));
        assert_eq!(report.processed[0].rates_inserted, 2);
        assert_eq!(report.statistics.rates_consolidated, 2);
        assert_eq!(report.statistics.records_removed, 2);
    }

    #[tokio::test]
    async fn rename_keeps_row_count() {
        let primary = MemoryPrimary::new();
        let id = primary.insert("Brahmapur (OD)", "Odisha", date("2024-02-01"), 6.0);

        let executor = ReconciliationExecutor::new(Arc::new(primary.clone()));
        let report = executor.reconcile(&detect(&primary).await).await.unwrap();

        let rows = primary.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, id);
        assert_eq!(rows[0].city, "Brahmapur");
        assert_eq!(rows[0].rate, 6.0);
        assert_eq!(report.statistics.cities_renamed, 1);
        assert_eq!(report.statistics.cities_merged, 0);
    }

    #[tokio::test]
    async fn three_state_codes_merge() {
        let primary = MemoryPrimary::new();
        for (city, state) in [
            ("Kolkata", "West Bengal"),
            ("Indore", "Madhya Pradesh"),
            ("Bengaluru", "Karnataka"),
        ] {
            primary.insert(city, state, date("2024-03-01"), 5.0);
        }
        primary.insert("Kolkata (WB)", "West Bengal", date("2024-03-02"), 5.5);
        primary.insert("Indore (CC)", "Madhya Pradesh", date("2024-03-02"), 5.4);
        primary.insert("Bengaluru (CC)", "Karnataka", date("2024-03-01"), 5.3);

        let executor = ReconciliationExecutor::new(Arc::new(primary.clone()));
        let report = executor.reconcile(&detect(&primary).await).await.unwrap();

        assert_eq!(report.statistics.cities_merged, 3);
        assert_eq!(report.statistics.cities_renamed, 0);
        assert!(report
            .processed
            .iter()
            .all(|p| p.action == ReconcileAction::Merge));
    }

    #[tokio::test]
    async fn failure_rolls_back_every_group() {
        let primary = MemoryPrimary::new();
        primary.insert("Allahabad (CC)", "UP", date("2024-01-01"), 5.0);
        primary.insert("Allahabad", "UP", date("2024-01-01"), 4.5);
        primary.insert("Brahmapur (OD)", "Odisha", date("2024-02-01"), 6.0);
        primary.insert("Kanpur (CC)", "UP", date("2024-01-05"), 4.9);
        let before = snapshot(&primary);

        let groups = detect(&primary).await;
        assert_eq!(groups.len(), 3);
        // writes: Allahabad update, Allahabad delete, Brahmapur rename, Kanpur rename
        primary.fail_on_write(4);

        let executor = ReconciliationExecutor::new(Arc::new(primary.clone()));
        let err = executor.reconcile(&groups).await.unwrap_err();
        assert!(matches!(err, CleanupError::Transaction(_)));
        assert_eq!(snapshot(&primary), before);
        assert!(primary.pending_sync().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_run_is_a_no_op() {
        let primary = MemoryPrimary::new();
        primary.insert("Delhi (CC)", "Delhi", date("2024-01-01"), 5.0);
        primary.insert("Delhi (DL)", "Delhi", date("2024-01-01"), 5.1);
        primary.insert("Delhi (DL)", "Delhi", date("2024-01-02"), 5.2);
        primary.insert("Mumbai (CC)", "Maharashtra", date("2024-01-01"), 5.6);
        primary.insert("Mumbai", "Maharashtra", date("2024-01-02"), 5.7);

        let executor = ReconciliationExecutor::new(Arc::new(primary.clone()));
        executor.reconcile(&detect(&primary).await).await.unwrap();
        let after_first = snapshot(&primary);

        let groups = detect(&primary).await;
        assert!(groups.is_empty());
        let report = executor.reconcile(&groups).await.unwrap();
        assert_eq!(report.statistics, ReconcileStats::default());
        assert_eq!(snapshot(&primary), after_first);

        let delhi = after_first
            .iter()
            .filter(|r| r.0 == "Delhi")
            .map(|r| (r.2, r.3))
            .collect::<Vec<_>>();
        assert_eq!(
            delhi,
            vec![(date("2024-01-01"), 5.1), (date("2024-01-02"), 5.2)]
        );
    }
}
