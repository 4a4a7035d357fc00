//! Finds coded (city, state) labels and decides merge vs rename for each.

use std::collections::BTreeSet;

use eggrates_core::{extract_suffix_code, CityStatePair, DuplicateGroup, NameNormalizer};
use serde::Serialize;
use tracing::warn;

/// A coded label that cannot be reconciled, e.g. `(CC)` alone or `Delhi (CC) (DL)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedGroup {
    pub city_with_code: String,
    pub state: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Detection {
    pub groups: Vec<DuplicateGroup>,
    pub skipped: Vec<SkippedGroup>,
}

#[derive(Debug, Clone, Default)]
pub struct DuplicateDetector {
    normalizer: NameNormalizer,
}

impl DuplicateDetector {
    pub fn new(normalizer: NameNormalizer) -> Self {
        Self { normalizer }
    }

    pub fn normalizer(&self) -> &NameNormalizer {
        &self.normalizer
    }

    /// Groups are ordered by canonical name, then state, then coded label. When several
    /// coded labels share a canonical pair with no clean row, the first one renames and
    /// the rest merge into it, so a batch never creates two rows for one date.
    pub fn find_duplicates(&self, pairs: &[CityStatePair]) -> Detection {
        let distinct: BTreeSet<&CityStatePair> = pairs.iter().collect();

        let clean: BTreeSet<(&str, &str)> = distinct
            .iter()
            .copied()
            .filter(|p| !self.normalizer.is_coded(&p.city))
            .map(|p| (p.city.as_str(), p.state.as_str()))
            .collect();

        let mut coded = Vec::new();
        let mut skipped = Vec::new();
        for pair in distinct.iter().copied().filter(|p| self.normalizer.is_coded(&p.city)) {
            let canonical = self.normalizer.normalize(&pair.city);
            let reason = if canonical.is_empty() {
                Some("city name is empty after removing the code suffix")
            } else if self.normalizer.is_coded(&canonical) {
                Some("city name still carries a parenthetical after removing the code suffix")
            } else {
                None
            };
            if let Some(reason) = reason {
                warn!(city = %pair.city, state = %pair.state, canonical = %canonical, "{reason}");
                skipped.push(SkippedGroup {
                    city_with_code: pair.city.clone(),
                    state: pair.state.clone(),
                    reason: reason.to_string(),
                });
                continue;
            }
            coded.push((canonical, pair));
        }
        coded.sort_by(|(ca, pa), (cb, pb)| {
            ca.cmp(cb)
                .then_with(|| pa.state.cmp(&pb.state))
                .then_with(|| pa.city.cmp(&pb.city))
        });

        let mut claimed: BTreeSet<(String, String)> = BTreeSet::new();
        let mut groups = Vec::with_capacity(coded.len());
        for (canonical, pair) in coded {
            let key = (canonical.clone(), pair.state.clone());
            let clean_exists =
                clean.contains(&(canonical.as_str(), pair.state.as_str())) || claimed.contains(&key);
            claimed.insert(key);
            groups.push(DuplicateGroup {
                coded_city: pair.city.clone(),
                canonical_city: canonical,
                state: pair.state.clone(),
                state_code: extract_suffix_code(&pair.city),
                clean_exists,
            });
        }

        Detection { groups, skipped }
    }
}
