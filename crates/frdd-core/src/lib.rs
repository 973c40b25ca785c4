//! Core film domain model and provenance types for FRDD.

use std::fmt;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "frdd-core";

/// Release identifier assigned by the box-office ledger (`rl3638199041`).
///
/// The only exact join key across sources. Once a [`FilmRecord`] is created
/// its identifier cannot be changed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReleaseId(String);

impl ReleaseId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReleaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Upstream dataset a value was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceId {
    BoxOfficeIndex,
    BoxOfficeDetail,
    ReviewAggregator,
    BudgetDatabase,
}

impl SourceId {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BoxOfficeIndex => "box_office_index",
            Self::BoxOfficeDetail => "box_office_detail",
            Self::ReviewAggregator => "review_aggregator",
            Self::BudgetDatabase => "budget_database",
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved value plus the source that supplied it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field<T> {
    pub value: Option<T>,
    pub source: Option<SourceId>,
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> Field<T> {
    pub fn empty() -> Self {
        Self {
            value: None,
            source: None,
        }
    }

    pub fn from_source(value: T, source: SourceId) -> Self {
        Self {
            value: Some(value),
            source: Some(source),
        }
    }

    pub fn get(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn is_known(&self) -> bool {
        self.value.is_some()
    }
}

/// Three-way outcome of a fuzzy title match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Matched,
    Review,
    #[default]
    Unmatched,
}

impl MatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Matched => "matched",
            Self::Review => "review",
            Self::Unmatched => "unmatched",
        }
    }
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the review-aggregator page for a film was located.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewMatchMethod {
    DirectUrl,
    Search,
    /// Found again by the second pass over pages that carried no scores.
    RescrapeDirect,
    RescrapeSearch,
    Unmatched,
}

impl ReviewMatchMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DirectUrl => "direct_url",
            Self::Search => "search",
            Self::RescrapeDirect => "rescrape_direct",
            Self::RescrapeSearch => "rescrape_search",
            Self::Unmatched => "unmatched",
        }
    }

    /// Matching strategy to record when a page found by `self` is located again.
    pub fn rescraped(self) -> Self {
        match self {
            Self::DirectUrl | Self::RescrapeDirect => Self::RescrapeDirect,
            Self::Search | Self::RescrapeSearch => Self::RescrapeSearch,
            Self::Unmatched => Self::Unmatched,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "direct_url" => Some(Self::DirectUrl),
            "search" => Some(Self::Search),
            "rescrape_direct" => Some(Self::RescrapeDirect),
            "rescrape_search" => Some(Self::RescrapeSearch),
            "unmatched" => Some(Self::Unmatched),
            _ => None,
        }
    }
}

impl fmt::Display for ReviewMatchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Review score families that act as RDD running variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreKind {
    Critic,
    Audience,
}

impl ScoreKind {
    pub const ALL: [ScoreKind; 2] = [ScoreKind::Critic, ScoreKind::Audience];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critic => "critic",
            Self::Audience => "audience",
        }
    }
}

/// Budget attributes absorbed from the fuzzy matcher's candidate.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BudgetMatch {
    pub matched_title: Option<String>,
    /// Similarity on a 0-100 scale.
    pub score: f64,
    pub status: MatchStatus,
}

/// Analysis variables computed once the study filters have run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DerivedVariables {
    pub critic_centered: Option<i32>,
    pub audience_centered: Option<i32>,
    pub is_fresh_critic: Option<u8>,
    pub is_fresh_audience: Option<u8>,
    pub log_opening_gross: Option<f64>,
    pub log_total_gross: Option<f64>,
    pub log_theaters: Option<f64>,
    pub log_budget: Option<f64>,
    pub release_year: Option<i32>,
    pub release_month: Option<u32>,
    pub in_progress: bool,
}

impl DerivedVariables {
    pub fn centered(&self, kind: ScoreKind) -> Option<i32> {
        match kind {
            ScoreKind::Critic => self.critic_centered,
            ScoreKind::Audience => self.audience_centered,
        }
    }

    pub fn treatment(&self, kind: ScoreKind) -> Option<u8> {
        match kind {
            ScoreKind::Critic => self.is_fresh_critic,
            ScoreKind::Audience => self.is_fresh_audience,
        }
    }
}

/// Ordered merge pipeline states. Each stage consumes the full output of the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStage {
    RawLoaded,
    BomMerged,
    ReviewMerged,
    BudgetMatched,
    Filtered,
    VariablesConstructed,
    Finalized,
}

impl PipelineStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RawLoaded => "RAW_LOADED",
            Self::BomMerged => "BOM_MERGED",
            Self::ReviewMerged => "REVIEW_MERGED",
            Self::BudgetMatched => "BUDGET_MATCHED",
            Self::Filtered => "FILTERED",
            Self::VariablesConstructed => "VARIABLES_CONSTRUCTED",
            Self::Finalized => "FINALIZED",
        }
    }

    pub fn next(self) -> Option<Self> {
        match self {
            Self::RawLoaded => Some(Self::BomMerged),
            Self::BomMerged => Some(Self::ReviewMerged),
            Self::ReviewMerged => Some(Self::BudgetMatched),
            Self::BudgetMatched => Some(Self::Filtered),
            Self::Filtered => Some(Self::VariablesConstructed),
            Self::VariablesConstructed => Some(Self::Finalized),
            Self::Finalized => None,
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One distinct theatrical release, the unit of analysis.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilmRecord {
    release_id: ReleaseId,
    pub title: String,
    /// Year of the ledger listing page the release was found on.
    pub listing_year: Option<i32>,
    pub release_date: Field<NaiveDate>,
    pub opening_gross: Option<i64>,
    pub opening_theaters: Option<i64>,
    pub domestic_gross: Field<i64>,
    pub widest_release: Option<i64>,
    pub max_theaters: Option<i64>,
    pub distributor: Field<String>,
    pub mpaa_rating: Field<String>,
    pub genres: Vec<String>,
    pub critic_score: Option<i32>,
    pub audience_score: Option<i32>,
    pub critic_count: Option<i64>,
    pub audience_count: Option<i64>,
    pub review_genres: Vec<String>,
    /// `None` when the review table had no row for this release.
    pub review_match_method: Option<ReviewMatchMethod>,
    pub review_url: Option<String>,
    pub review_title: Option<String>,
    pub production_budget: Option<i64>,
    pub budget_source_gross: Option<i64>,
    pub budget_match: BudgetMatch,
    pub derived: Option<DerivedVariables>,
}

impl FilmRecord {
    pub fn new(release_id: ReleaseId, title: impl Into<String>) -> Self {
        Self {
            release_id,
            title: title.into(),
            listing_year: None,
            release_date: Field::empty(),
            opening_gross: None,
            opening_theaters: None,
            domestic_gross: Field::empty(),
            widest_release: None,
            max_theaters: None,
            distributor: Field::empty(),
            mpaa_rating: Field::empty(),
            genres: Vec::new(),
            critic_score: None,
            audience_score: None,
            critic_count: None,
            audience_count: None,
            review_genres: Vec::new(),
            review_match_method: None,
            review_url: None,
            review_title: None,
            production_budget: None,
            budget_source_gross: None,
            budget_match: BudgetMatch::default(),
            derived: None,
        }
    }

    pub fn release_id(&self) -> &ReleaseId {
        &self.release_id
    }

    pub fn release_year(&self) -> Option<i32> {
        self.release_date.get().map(|d| d.year())
    }

    pub fn score(&self, kind: ScoreKind) -> Option<i32> {
        match kind {
            ScoreKind::Critic => self.critic_score,
            ScoreKind::Audience => self.audience_score,
        }
    }

    /// Rows a human should look at: no review page, or a borderline budget match.
    pub fn needs_review(&self) -> bool {
        matches!(self.review_match_method, Some(ReviewMatchMethod::Unmatched))
            || self.budget_match.status == MatchStatus::Review
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_id_is_trimmed_and_displayed_verbatim() {
        let id = ReleaseId::new("  rl3638199041 ");
        assert_eq!(id.as_str(), "rl3638199041");
        assert_eq!(id.to_string(), "rl3638199041");
    }

    #[test]
    fn stages_advance_in_fixed_order() {
        let mut stage = PipelineStage::RawLoaded;
        let mut seen = vec![stage];
        while let Some(next) = stage.next() {
            assert!(next > stage);
            seen.push(next);
            stage = next;
        }
        assert_eq!(seen.len(), 7);
        assert_eq!(seen.last(), Some(&PipelineStage::Finalized));
    }

    #[test]
    fn review_flag_covers_unmatched_pages_and_review_band_budgets() {
        let mut film = FilmRecord::new(ReleaseId::new("rl1"), "Film");
        assert!(!film.needs_review());
        film.review_match_method = Some(ReviewMatchMethod::Unmatched);
        assert!(film.needs_review());
        film.review_match_method = Some(ReviewMatchMethod::DirectUrl);
        film.budget_match.status = MatchStatus::Review;
        assert!(film.needs_review());
    }

    #[test]
    fn match_method_parses_its_own_labels() {
        for method in [
            ReviewMatchMethod::DirectUrl,
            ReviewMatchMethod::Search,
            ReviewMatchMethod::RescrapeDirect,
            ReviewMatchMethod::RescrapeSearch,
            ReviewMatchMethod::Unmatched,
        ] {
            assert_eq!(ReviewMatchMethod::parse(method.as_str()), Some(method));
        }
        assert_eq!(ReviewMatchMethod::parse("fuzzy"), None);
    }

    #[test]
    fn rescraped_pages_keep_their_provenance_and_are_not_flagged() {
        assert_eq!(ReviewMatchMethod::DirectUrl.rescraped(), ReviewMatchMethod::RescrapeDirect);
        assert_eq!(ReviewMatchMethod::Search.rescraped(), ReviewMatchMethod::RescrapeSearch);

        let mut film = FilmRecord::new(ReleaseId::new("rl1"), "Film");
        film.review_match_method = ReviewMatchMethod::parse("rescrape_search");
        assert_eq!(film.review_match_method, Some(ReviewMatchMethod::RescrapeSearch));
        assert!(!film.needs_review());
    }
}
