//! Year-blocked fuzzy title matching against the budget table.
//!
//! The candidate pool is an ordered sequence and its order is part of the
//! contract: when two candidates tie on score, the earlier one wins.

use frdd_core::{BudgetMatch, MatchStatus};
use strsim::normalized_levenshtein;
use tracing::debug;

use crate::config::{MatchConfig, SimilarityMeasure};
use crate::tables::BudgetRecord;

const LEADING_ARTICLES: [&str; 3] = ["the ", "a ", "an "];

fn strip_parentheticals(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(open) = rest.find('(') {
        match rest[open..].find(')') {
            Some(close) => {
                out.push_str(&rest[..open]);
                rest = &rest[open + close + 1..];
            }
            None => break,
        }
    }
    out.push_str(rest);
    out
}

/// Canonical form used for every title comparison.
///
/// Lowercases, drops `(...)` annotations, spells out `&`, turns punctuation
/// into spaces, collapses whitespace and strips leading articles. Articles are
/// stripped until none is left, which keeps the function idempotent.
pub fn normalize_title(title: &str) -> String {
    let lowered = title.trim().to_lowercase();
    let without_notes = strip_parentheticals(&lowered).replace('&', "and");
    let spaced: String = without_notes
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' || c.is_whitespace() { c } else { ' ' })
        .collect();
    let mut normalized = spaced.split_whitespace().collect::<Vec<_>>().join(" ");

    while let Some(article) = LEADING_ARTICLES.iter().find(|a| normalized.starts_with(**a)) {
        normalized = normalized[article.len()..].to_string();
    }
    normalized
}

fn sorted_tokens(text: &str) -> String {
    let mut tokens: Vec<&str> = text.split_whitespace().collect();
    tokens.sort_unstable();
    tokens.join(" ")
}

fn longest_common_subsequence(a: &[char], b: &[char]) -> usize {
    let mut previous = vec![0usize; b.len() + 1];
    let mut current = vec![0usize; b.len() + 1];
    for &ca in a {
        for (j, &cb) in b.iter().enumerate() {
            current[j + 1] = if ca == cb {
                previous[j] + 1
            } else {
                current[j].max(previous[j + 1])
            };
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

fn indel_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 100.0;
    }
    200.0 * longest_common_subsequence(&a, &b) as f64 / total as f64
}

/// Word-order-insensitive similarity on a 0-100 scale.
pub fn token_sort_ratio(a: &str, b: &str, measure: SimilarityMeasure) -> f64 {
    let a = sorted_tokens(a);
    let b = sorted_tokens(b);
    match measure {
        SimilarityMeasure::Indel => indel_ratio(&a, &b),
        SimilarityMeasure::Levenshtein => normalized_levenshtein(&a, &b) * 100.0,
    }
}

pub fn classify(score: f64, config: &MatchConfig) -> MatchStatus {
    if score >= config.accept_threshold {
        MatchStatus::Matched
    } else if score >= config.review_threshold {
        MatchStatus::Review
    } else {
        MatchStatus::Unmatched
    }
}

/// One budget-table entry, normalized once up front.
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetCandidate {
    pub title: String,
    pub normalized: String,
    pub release_year: Option<i32>,
    pub production_budget: Option<i64>,
    pub domestic_gross: Option<i64>,
}

impl BudgetCandidate {
    pub fn new(title: impl Into<String>, release_year: Option<i32>) -> Self {
        let title = title.into();
        Self {
            normalized: normalize_title(&title),
            title,
            release_year,
            production_budget: None,
            domestic_gross: None,
        }
    }

    pub fn from_record(record: &BudgetRecord) -> Self {
        Self {
            production_budget: record.production_budget,
            domestic_gross: record.domestic_gross,
            ..Self::new(record.title.clone(), record.release_year)
        }
    }
}

/// Best candidate for one film; transient until absorbed into the film record.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchCandidate<'a> {
    pub candidate: Option<&'a BudgetCandidate>,
    pub score: f64,
    pub status: MatchStatus,
}

impl MatchCandidate<'_> {
    fn unmatched() -> Self {
        Self {
            candidate: None,
            score: 0.0,
            status: MatchStatus::Unmatched,
        }
    }

    pub fn to_budget_match(&self) -> BudgetMatch {
        BudgetMatch {
            matched_title: self.candidate.map(|c| c.title.clone()),
            score: self.score,
            status: self.status,
        }
    }
}

pub struct TitleMatcher<'a> {
    pool: &'a [BudgetCandidate],
    config: &'a MatchConfig,
}

impl<'a> TitleMatcher<'a> {
    pub fn new(pool: &'a [BudgetCandidate], config: &'a MatchConfig) -> Self {
        Self { pool, config }
    }

    fn in_year_block(&self, candidate: &BudgetCandidate, target_year: Option<i32>) -> bool {
        match (target_year, candidate.release_year) {
            (None, _) => true,
            (Some(target), Some(year)) => (year - target).abs() <= self.config.year_tolerance,
            // A candidate with no year cannot be placed near a known year.
            (Some(_), None) => false,
        }
    }

    pub fn best_match(&self, target_title: &str, target_year: Option<i32>) -> MatchCandidate<'a> {
        let target = normalize_title(target_title);
        if target.is_empty() {
            return MatchCandidate::unmatched();
        }

        let mut best: Option<(&'a BudgetCandidate, f64)> = None;
        for candidate in self.pool.iter().filter(|c| self.in_year_block(c, target_year)) {
            let score = token_sort_ratio(&target, &candidate.normalized, self.config.similarity);
            if best.map_or(true, |(_, top)| score > top) {
                best = Some((candidate, score));
            }
        }

        let Some((candidate, score)) = best else {
            debug!(title = target_title, year = ?target_year, "no budget candidates in year block");
            return MatchCandidate::unmatched();
        };
        let status = classify(score, self.config);
        debug!(title = target_title, candidate = %candidate.title, score, %status, "budget match");
        MatchCandidate {
            candidate: Some(candidate),
            score,
            status,
        }
    }
}

/// Matches one title against a pool and reports the outcome.
pub fn match_title(
    target_title: &str,
    target_year: Option<i32>,
    pool: &[BudgetCandidate],
    config: &MatchConfig,
) -> BudgetMatch {
    TitleMatcher::new(pool, config)
        .best_match(target_title, target_year)
        .to_budget_match()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(entries: &[(&str, Option<i32>)]) -> Vec<BudgetCandidate> {
        entries
            .iter()
            .map(|(title, year)| BudgetCandidate::new(*title, *year))
            .collect()
    }

    #[test]
    fn normalization_is_idempotent() {
        for raw in [
            "The Batman",
            "A A Film",
            "Spider-Man: Across the Spider-Verse",
            "Fast & Furious (2009)",
            "  Mission: Impossible - Dead Reckoning Part One (IMAX)  ",
            "Amélie",
            "Unclosed (annotation",
            "An",
            "",
        ] {
            let once = normalize_title(raw);
            assert_eq!(normalize_title(&once), once, "input {raw:?}");
        }
    }

    #[test]
    fn leading_articles_are_stripped() {
        assert_eq!(normalize_title("The Batman"), normalize_title("Batman"));
        assert_eq!(normalize_title("A A Film"), normalize_title("a film"));
        assert_eq!(normalize_title("An Unfinished Life"), "unfinished life");
        assert_eq!(normalize_title("Theater Camp"), "theater camp");
    }

    #[test]
    fn normalization_handles_notes_ampersands_and_punctuation() {
        assert_eq!(normalize_title("Fast & Furious (2009)"), "fast and furious");
        assert_eq!(
            normalize_title("Spider-Man: Across the Spider-Verse"),
            "spider man across the spider verse"
        );
        assert_eq!(normalize_title("Unclosed (annotation"), "unclosed annotation");
    }

    #[test]
    fn token_order_does_not_matter() {
        let score = token_sort_ratio("wars star", "star wars", SimilarityMeasure::Indel);
        assert_eq!(score, 100.0);
        let lev = token_sort_ratio("wars star", "star wars", SimilarityMeasure::Levenshtein);
        assert_eq!(lev, 100.0);
    }

    #[test]
    fn indel_ratio_matches_the_lcs_definition() {
        // lcs("abcd", "abed") = 3, so 2 * 3 / 8.
        assert!((token_sort_ratio("abcd", "abed", SimilarityMeasure::Indel) - 75.0).abs() < 1e-9);
        assert_eq!(token_sort_ratio("abc", "xyz", SimilarityMeasure::Indel), 0.0);
    }

    #[test]
    fn thresholds_partition_the_score_space_at_the_boundaries() {
        let config = MatchConfig::default();
        assert_eq!(classify(85.0, &config), MatchStatus::Matched);
        assert_eq!(classify(84.99, &config), MatchStatus::Review);
        assert_eq!(classify(70.0, &config), MatchStatus::Review);
        assert_eq!(classify(69.0, &config), MatchStatus::Unmatched);
    }

    #[test]
    fn empty_pool_is_unmatched_with_zero_score() {
        let config = MatchConfig::default();
        for title in ["Inside Out 2", "", "The"] {
            let outcome = match_title(title, Some(2024), &[], &config);
            assert_eq!(outcome.status, MatchStatus::Unmatched);
            assert_eq!(outcome.score, 0.0);
            assert_eq!(outcome.matched_title, None);
        }
    }

    #[test]
    fn empty_title_never_matches() {
        let config = MatchConfig::default();
        let candidates = pool(&[("", None), ("Anything", None)]);
        let outcome = match_title("  ( ) ", None, &candidates, &config);
        assert_eq!(outcome.status, MatchStatus::Unmatched);
        assert_eq!(outcome.score, 0.0);
    }

    #[test]
    fn year_block_excludes_distant_and_undated_candidates() {
        let config = MatchConfig::default();
        let candidates = pool(&[("Dune", Some(1984)), ("Dune", None), ("Dune", Some(2021))]);
        let matcher = TitleMatcher::new(&candidates, &config);

        let outcome = matcher.best_match("Dune", Some(2022));
        assert_eq!(outcome.status, MatchStatus::Matched);
        assert_eq!(outcome.candidate.and_then(|c| c.release_year), Some(2021));

        let outcome = matcher.best_match("Dune", Some(2000));
        assert_eq!(outcome.status, MatchStatus::Unmatched);
        assert_eq!(outcome.candidate, None);

        let outcome = matcher.best_match("Dune", None);
        assert_eq!(outcome.candidate.and_then(|c| c.release_year), Some(1984));
    }

    #[test]
    fn ties_go_to_the_first_candidate_in_pool_order() {
        let config = MatchConfig::default();
        let mut candidates = pool(&[("The Flash", Some(2023)), ("Flash", Some(2023))]);
        candidates[0].production_budget = Some(1);
        candidates[1].production_budget = Some(2);
        let outcome = TitleMatcher::new(&candidates, &config).best_match("Flash", Some(2023));
        assert_eq!(outcome.score, 100.0);
        assert_eq!(outcome.candidate.and_then(|c| c.production_budget), Some(1));
    }

    #[test]
    fn near_miss_lands_in_the_review_band() {
        let config = MatchConfig::default();
        let candidates = pool(&[("John Wick 4", Some(2023))]);
        // "4 chapter john wick" against "4 john wick": lcs 11 of 30 chars.
        let outcome = match_title("John Wick: Chapter 4", Some(2023), &candidates, &config);
        assert!((outcome.score - 22.0 / 30.0 * 100.0).abs() < 1e-9);
        assert_eq!(outcome.status, MatchStatus::Review);
        assert_eq!(outcome.matched_title.as_deref(), Some("John Wick 4"));
    }
}
