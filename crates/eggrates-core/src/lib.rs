//! Core domain model and city-name normalization for Today Egg Rates.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "eggrates-core";

/// The single pattern that decides whether a city label is "coded" and what gets
/// stripped from it. Detection and stripping must never disagree.
pub const CODED_SUFFIX_PATTERN: &str = r"\s*\([^)]*\)\s*";

const STRICT_CODE_PATTERN: &str = r"\(([A-Z]{2})\)";

static DEFAULT_CODED: Lazy<Regex> =
    Lazy::new(|| Regex::new(CODED_SUFFIX_PATTERN).expect("coded suffix pattern compiles"));

static STRICT_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(STRICT_CODE_PATTERN).expect("strict code pattern compiles"));

/// One observation in the legacy flat `egg_rates` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateRecord {
    pub id: i64,
    pub city: String,
    pub state: String,
    pub date: NaiveDate,
    pub rate: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEntity {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CityEntity {
    pub id: i64,
    pub name: String,
    pub state_id: i64,
}

/// Row of `egg_rates_normalized`, keyed by city id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRate {
    pub id: i64,
    pub city_id: i64,
    pub date: NaiveDate,
    pub rate: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CityStatePair {
    pub city: String,
    pub state: String,
}

impl CityStatePair {
    pub fn new(city: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            city: city.into(),
            state: state.into(),
        }
    }
}

/// Aggregate over all primary rows sharing one (city, state) label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairSummary {
    pub city: String,
    pub state: String,
    pub rate_count: u64,
    pub earliest_date: Option<NaiveDate>,
    pub latest_date: Option<NaiveDate>,
}

impl PairSummary {
    pub fn pair(&self) -> CityStatePair {
        CityStatePair::new(self.city.clone(), self.state.clone())
    }
}

/// City entity joined with its state name and dependent rate count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CitySummary {
    pub id: i64,
    pub name: String,
    pub state_id: i64,
    pub state_name: String,
    pub rate_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconcileAction {
    #[serde(rename = "merge_and_remove")]
    Merge,
    #[serde(rename = "rename")]
    Rename,
}

/// A coded (city, state) pair and the canonical name it reconciles into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub coded_city: String,
    pub canonical_city: String,
    pub state: String,
    pub state_code: Option<String>,
    pub clean_exists: bool,
}

impl DuplicateGroup {
    pub fn action(&self) -> ReconcileAction {
        if self.clean_exists {
            ReconcileAction::Merge
        } else {
            ReconcileAction::Rename
        }
    }

    pub fn canonical_pair(&self) -> CityStatePair {
        CityStatePair::new(self.canonical_city.clone(), self.state.clone())
    }
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("invalid coded-suffix pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Detects and strips parenthetical qualifiers such as `(CC)` from city labels.
#[derive(Debug, Clone)]
pub struct NameNormalizer {
    pattern: Regex,
}

impl Default for NameNormalizer {
    fn default() -> Self {
        Self {
            pattern: DEFAULT_CODED.clone(),
        }
    }
}

impl NameNormalizer {
    pub fn new(pattern: &str) -> Result<Self, NormalizeError> {
        let pattern = Regex::new(pattern).map_err(|source| NormalizeError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self { pattern })
    }

    pub fn is_coded(&self, city_label: &str) -> bool {
        self.pattern.is_match(city_label)
    }

    /// Replaces the first coded suffix with a single space and trims the result.
    /// An all-parenthetical label yields an empty string; callers treat that as invalid.
    pub fn normalize(&self, city_label: &str) -> String {
        self.pattern
            .replacen(city_label, 1, " ")
            .trim()
            .to_string()
    }
}

/// [`NameNormalizer::normalize`] with the default pattern.
pub fn normalize(city_label: &str) -> String {
    NameNormalizer::default().normalize(city_label)
}

/// Strict two-letter uppercase code in parentheses, for diagnostics only.
pub fn extract_suffix_code(city_label: &str) -> Option<String> {
    STRICT_CODE
        .captures(city_label)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Public page slug for a canonical city, e.g. `navi-mumbai-egg-rate`.
pub fn city_slug(city: &str) -> String {
    format!("{}-egg-rate", city.to_lowercase().replace(' ', "-"))
}

/// Slug the frontend used to emit for a coded label, e.g. `allahabad-cc-egg-rate`.
pub fn coded_city_slug(city: &str) -> String {
    let flattened = city
        .replace(' ', "-")
        .replace(['(', ')'], "")
        .to_lowercase();
    format!("{flattened}-egg-rate")
}
