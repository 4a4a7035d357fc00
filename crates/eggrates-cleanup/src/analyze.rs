//! Read-only views over both schemas: the cleanup preview, the duplicate analysis and
//! the redirect plan for retired coded-city URLs.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use eggrates_core::{
    city_slug, coded_city_slug, CitySummary, DuplicateGroup, NameNormalizer, PairSummary,
};
use serde::Serialize;
use strsim::jaro_winkler;

use crate::CleanupRules;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CityType {
    HasStateCode,
    Clean,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreviewRow {
    pub city: String,
    pub state: String,
    pub rate_count: u64,
    pub earliest_date: Option<NaiveDate>,
    pub latest_date: Option<NaiveDate>,
    pub city_type: CityType,
    pub clean_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupPreview {
    pub message: String,
    pub instructions: String,
    pub preview: Vec<PreviewRow>,
    pub total_cities_with_issues: usize,
}

/// Coded pairs plus every pair whose city is on the watch-list, coded rows first within
/// each clean name.
pub fn build_preview(
    summaries: &[PairSummary],
    normalizer: &NameNormalizer,
    rules: &CleanupRules,
) -> CleanupPreview {
    let watch: BTreeSet<&str> = rules.watch_cities.iter().map(String::as_str).collect();
    let mut preview = summaries
        .iter()
        .filter_map(|s| {
            let coded = normalizer.is_coded(&s.city);
            if !coded && !watch.contains(s.city.as_str()) {
                return None;
            }
            Some(PreviewRow {
                city: s.city.clone(),
                state: s.state.clone(),
                rate_count: s.rate_count,
                earliest_date: s.earliest_date,
                latest_date: s.latest_date,
                city_type: if coded {
                    CityType::HasStateCode
                } else {
                    CityType::Clean
                },
                clean_name: normalizer.normalize(&s.city),
            })
        })
        .collect::<Vec<_>>();
    preview.sort_by(|a, b| {
        a.clean_name
            .cmp(&b.clean_name)
            .then(a.city_type.cmp(&b.city_type))
            .then_with(|| a.state.cmp(&b.state))
            .then_with(|| a.city.cmp(&b.city))
    });

    CleanupPreview {
        message: "City Duplicates Cleanup Preview".to_string(),
        instructions: "Add ?run=1 to the URL or send a POST request to execute the cleanup"
            .to_string(),
        total_cities_with_issues: preview.len(),
        preview,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AnalysisSummary {
    pub total_cities: u64,
    pub cities_with_codes: u64,
    pub total_rates: u64,
    pub rates_with_coded_cities: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PotentialMerge {
    pub city_with_code: String,
    pub state: String,
    pub coded_rates: u64,
    pub clean_city: Option<String>,
    pub clean_rates: u64,
    pub extracted_clean_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateEntityGroup {
    pub name: String,
    pub state_id: i64,
    pub state_name: String,
    pub survivor_id: i64,
    pub duplicate_ids: Vec<i64>,
    pub dependent_rates: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpellingSuggestion {
    pub state: String,
    pub city_a: String,
    pub city_b: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Recommendations {
    pub immediate_actions: Vec<&'static str>,
    pub affected_features: Vec<&'static str>,
    pub post_cleanup_tasks: Vec<&'static str>,
}

impl Default for Recommendations {
    fn default() -> Self {
        Self {
            immediate_actions: vec![
                "Run city_duplicates_cleanup?run=1 to merge duplicate cities",
                "Back up the database before running the cleanup",
                "Try the cleanup against a staging copy first",
            ],
            affected_features: vec![
                "Sitemap generation may emit duplicate URLs",
                "Web story generation may create conflicting stories",
                "City search may show duplicates",
                "Duplicate content may hurt search ranking",
            ],
            post_cleanup_tasks: vec![
                "Regenerate the sitemap",
                "Regenerate web stories for affected cities",
                "Publish the redirect rules for retired city URLs",
                "Clear caches holding old city names",
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateAnalysis {
    pub summary: AnalysisSummary,
    pub cities_with_state_codes: Vec<PairSummary>,
    pub potential_merges: Vec<PotentialMerge>,
    pub duplicates_found: BTreeMap<String, Vec<PairSummary>>,
    pub normalized_table_issues: Vec<CitySummary>,
    pub duplicate_entities: Vec<DuplicateEntityGroup>,
    pub spelling_suggestions: Vec<SpellingSuggestion>,
    pub recommendations: Recommendations,
}

pub fn analyze(
    summaries: &[PairSummary],
    cities: &[CitySummary],
    normalizer: &NameNormalizer,
    rules: &CleanupRules,
) -> DuplicateAnalysis {
    let (coded, clean): (Vec<&PairSummary>, Vec<&PairSummary>) =
        summaries.iter().partition(|s| normalizer.is_coded(&s.city));

    let summary = AnalysisSummary {
        total_cities: summaries.len() as u64,
        cities_with_codes: coded.len() as u64,
        total_rates: summaries.iter().map(|s| s.rate_count).sum(),
        rates_with_coded_cities: coded.iter().map(|s| s.rate_count).sum(),
    };

    let clean_index: BTreeMap<(&str, &str), &PairSummary> = clean
        .iter()
        .map(|s| ((s.city.as_str(), s.state.as_str()), *s))
        .collect();

    let mut potential_merges = coded
        .iter()
        .map(|s| {
            let extracted = normalizer.normalize(&s.city);
            let clean_match = clean_index.get(&(extracted.as_str(), s.state.as_str()));
            PotentialMerge {
                city_with_code: s.city.clone(),
                state: s.state.clone(),
                coded_rates: s.rate_count,
                clean_city: clean_match.map(|c| c.city.clone()),
                clean_rates: clean_match.map_or(0, |c| c.rate_count),
                extracted_clean_name: extracted,
            }
        })
        .collect::<Vec<_>>();
    potential_merges.sort_by(|a, b| {
        a.extracted_clean_name
            .cmp(&b.extracted_clean_name)
            .then_with(|| a.state.cmp(&b.state))
            .then_with(|| a.city_with_code.cmp(&b.city_with_code))
    });

    let mut duplicates_found = BTreeMap::new();
    for watched in &rules.watch_cities {
        let variants = summaries
            .iter()
            .filter(|s| normalizer.normalize(&s.city) == *watched)
            .cloned()
            .collect::<Vec<_>>();
        if variants.len() > 1 {
            duplicates_found.insert(watched.clone(), variants);
        }
    }

    let mut normalized_table_issues = cities
        .iter()
        .filter(|c| normalizer.is_coded(&c.name))
        .cloned()
        .collect::<Vec<_>>();
    normalized_table_issues.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));

    DuplicateAnalysis {
        summary,
        cities_with_state_codes: coded.into_iter().cloned().collect(),
        potential_merges,
        duplicates_found,
        normalized_table_issues,
        duplicate_entities: duplicate_entities(cities),
        spelling_suggestions: spelling_suggestions(summaries, normalizer, rules.spelling_review_threshold),
        recommendations: Recommendations::default(),
    }
}

fn duplicate_entities(cities: &[CitySummary]) -> Vec<DuplicateEntityGroup> {
    let mut by_key: BTreeMap<(&str, i64), Vec<&CitySummary>> = BTreeMap::new();
    for city in cities {
        by_key
            .entry((city.name.as_str(), city.state_id))
            .or_default()
            .push(city);
    }

    by_key
        .into_values()
        .filter(|group| group.len() > 1)
        .map(|mut group| {
            group.sort_by_key(|c| c.id);
            let survivor = group[0];
            let duplicates = &group[1..];
            DuplicateEntityGroup {
                name: survivor.name.clone(),
                state_id: survivor.state_id,
                state_name: survivor.state_name.clone(),
                survivor_id: survivor.id,
                duplicate_ids: duplicates.iter().map(|c| c.id).collect(),
                dependent_rates: duplicates.iter().map(|c| c.rate_count).sum(),
            }
        })
        .collect()
}

/// Near-identical canonical names within one state, e.g. `Luknow` and `Lucknow`.
/// Review only; these are never merged automatically.
fn spelling_suggestions(
    summaries: &[PairSummary],
    normalizer: &NameNormalizer,
    threshold: f64,
) -> Vec<SpellingSuggestion> {
    let mut by_state: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
    for s in summaries {
        let name = normalizer.normalize(&s.city);
        if !name.is_empty() {
            by_state.entry(s.state.as_str()).or_default().insert(name);
        }
    }

    let mut out = Vec::new();
    for (state, names) in by_state {
        let names = names.into_iter().collect::<Vec<_>>();
        for i in 0..names.len() {
            for j in (i + 1)..names.len() {
                let (a, b) = (&names[i], &names[j]);
                if a.eq_ignore_ascii_case(b) {
                    continue;
                }
                let score = jaro_winkler(&a.to_lowercase(), &b.to_lowercase());
                if score >= threshold {
                    out.push(SpellingSuggestion {
                        state: state.to_string(),
                        city_a: a.clone(),
                        city_b: b.clone(),
                        score,
                    });
                }
            }
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CityRedirect {
    pub old_name: String,
    pub new_name: String,
    pub old_slug: String,
    pub new_slug: String,
    pub old_url: String,
    pub new_url: String,
}

impl CityRedirect {
    pub fn from_names(old_name: &str, new_name: &str) -> Self {
        let old_slug = coded_city_slug(old_name);
        let new_slug = city_slug(new_name);
        Self {
            old_name: old_name.to_string(),
            new_name: new_name.to_string(),
            old_url: format!("/{old_slug}"),
            new_url: format!("/{new_slug}"),
            old_slug,
            new_slug,
        }
    }

    pub fn apache_rule(&self) -> String {
        format!("Redirect 301 {} {}", self.old_url, self.new_url)
    }

    pub fn nginx_rule(&self) -> String {
        format!("location {} {{ return 301 {}; }}", self.old_url, self.new_url)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RedirectPlan {
    pub redirects: Vec<CityRedirect>,
    pub apache_redirects: Vec<String>,
    pub nginx_redirects: Vec<String>,
}

impl RedirectPlan {
    /// One redirect per distinct coded label; the same label in two states maps to
    /// one URL, so only the first is kept.
    pub fn from_groups(groups: &[DuplicateGroup]) -> Self {
        let mut seen = BTreeSet::new();
        let redirects = groups
            .iter()
            .filter(|g| seen.insert(coded_city_slug(&g.coded_city)))
            .map(|g| CityRedirect::from_names(&g.coded_city, &g.canonical_city))
            .collect::<Vec<_>>();
        Self {
            apache_redirects: redirects.iter().map(CityRedirect::apache_rule).collect(),
            nginx_redirects: redirects.iter().map(CityRedirect::nginx_rule).collect(),
            redirects,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(city: &str, state: &str, count: u64) -> PairSummary {
        PairSummary {
            city: city.to_string(),
            state: state.to_string(),
            rate_count: count,
            earliest_date: NaiveDate::from_ymd_opt(2024, 1, 1),
            latest_date: NaiveDate::from_ymd_opt(2024, 1, 31),
        }
    }

    fn city(id: i64, name: &str, state_id: i64, rates: u64) -> CitySummary {
        CitySummary {
            id,
            name: name.to_string(),
            state_id,
            state_name: "Maharashtra".to_string(),
            rate_count: rates,
        }
    }

    #[test]
    fn preview_lists_coded_and_watched_cities() {
        let summaries = vec![
            summary("Allahabad", "Uttar Pradesh", 10),
            summary("Allahabad (CC)", "Uttar Pradesh", 4),
            summary("Pune", "Maharashtra", 30),
            summary("Vizag (Visakhapatnam)", "Andhra Pradesh", 2),
        ];
        let preview = build_preview(&summaries, &NameNormalizer::default(), &CleanupRules::default());

        assert_eq!(preview.total_cities_with_issues, 3);
        assert_eq!(preview.preview[0].city, "Allahabad (CC)");
        assert_eq!(preview.preview[0].city_type, CityType::HasStateCode);
        assert_eq!(preview.preview[1].city, "Allahabad");
        assert_eq!(preview.preview[1].city_type, CityType::Clean);
        assert_eq!(preview.preview[2].clean_name, "Vizag");
    }

    #[test]
    fn analysis_counts_and_pairs() {
        let summaries = vec![
            summary("Chennai", "Tamil Nadu", 10),
            summary("Chennai (CC)", "Tamil Nadu", 3),
            summary("Ranchi (CC)", "Jharkhand", 2),
            summary("Luknow", "Uttar Pradesh", 5),
            summary("Lucknow", "Uttar Pradesh", 7),
        ];
        let cities = vec![
            city(1, "Pune", 4, 3),
            city(7, "Pune", 4, 2),
            city(9, "Mumbai (CC)", 4, 1),
        ];
        let analysis = analyze(
            &summaries,
            &cities,
            &NameNormalizer::default(),
            &CleanupRules::default(),
        );

        assert_eq!(
            analysis.summary,
            AnalysisSummary {
                total_cities: 5,
                cities_with_codes: 2,
                total_rates: 27,
                rates_with_coded_cities: 5,
            }
        );
        assert_eq!(analysis.potential_merges.len(), 2);
        let chennai = &analysis.potential_merges[0];
        assert_eq!(chennai.clean_city.as_deref(), Some("Chennai"));
        assert_eq!(chennai.clean_rates, 10);
        let ranchi = &analysis.potential_merges[1];
        assert_eq!(ranchi.clean_city, None);

        assert_eq!(analysis.duplicates_found["Chennai"].len(), 2);
        assert!(!analysis.duplicates_found.contains_key("Ranchi"));

        assert_eq!(analysis.normalized_table_issues.len(), 1);
        assert_eq!(analysis.duplicate_entities.len(), 1);
        assert_eq!(analysis.duplicate_entities[0].survivor_id, 1);
        assert_eq!(analysis.duplicate_entities[0].duplicate_ids, vec![7]);
        assert_eq!(analysis.duplicate_entities[0].dependent_rates, 2);

        assert_eq!(analysis.spelling_suggestions.len(), 1);
        let suggestion = &analysis.spelling_suggestions[0];
        assert_eq!(
            (suggestion.city_a.as_str(), suggestion.city_b.as_str()),
            ("Lucknow", "Luknow")
        );
    }

    #[test]
    fn watch_list_variants_ignore_spacing_before_the_code() {
        let summaries = vec![
            summary("Indore", "Madhya Pradesh", 8),
            summary("Indore(CC)", "Madhya Pradesh", 2),
            summary("Indore (MP)", "Madhya Pradesh", 1),
            summary("Indorekar", "Madhya Pradesh", 1),
        ];
        let analysis = analyze(&summaries, &[], &NameNormalizer::default(), &CleanupRules::default());
        let cities = analysis.duplicates_found["Indore"]
            .iter()
            .map(|s| s.city.as_str())
            .collect::<Vec<_>>();
        assert_eq!(cities, vec!["Indore", "Indore(CC)", "Indore (MP)"]);
    }

    #[test]
    fn redirects_follow_legacy_slugs() {
        let groups = vec![DuplicateGroup {
            coded_city: "Allahabad (CC)".to_string(),
            canonical_city: "Allahabad".to_string(),
            state: "Uttar Pradesh".to_string(),
            state_code: Some("CC".to_string()),
            clean_exists: true,
        }];
        let plan = RedirectPlan::from_groups(&groups);
        assert_eq!(plan.redirects[0].old_url, "/allahabad-cc-egg-rate");
        assert_eq!(plan.redirects[0].new_url, "/allahabad-egg-rate");
        assert_eq!(
            plan.apache_redirects,
            vec!["Redirect 301 /allahabad-cc-egg-rate /allahabad-egg-rate".to_string()]
        );
        assert_eq!(
            plan.nginx_redirects[0],
            "location /allahabad-cc-egg-rate { return 301 /allahabad-egg-rate; }"
        );
    }
}
