//! Source extractors, the review-page locator, and checkpointed collection runs.

use std::time::Duration;

use chrono::NaiveDate;
use frdd_core::SourceId;
use scraper::{ElementRef, Selector};
use thiserror::Error;

mod box_office;
mod budgets;
mod collect;
mod locator;
mod reviews;

pub use box_office::{BoxOfficeDetailExtractor, BoxOfficeIndexExtractor, DetailFields, DetailRow, IndexRow};
pub use budgets::{BudgetRow, BudgetTableExtractor, BUDGET_ROWS_PER_PAGE};
pub use collect::{
    collect_budgets, collect_details, collect_index, collect_reviews, rescrape_missing_reviews,
    CollectSummary, ReviewTarget, DETAIL_CHECKPOINT_EVERY, REVIEW_CHECKPOINT_EVERY,
};
pub use locator::{
    rescrape_slug_order, score_search_hit, slug_candidates, LocatedPage, ReviewLocator, MIN_SEARCH_SCORE,
};
pub use reviews::{ReviewFields, ReviewPageExtractor, ReviewRow};

pub const CRATE_NAME: &str = "frdd-extract";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid css selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("invalid url: {0}")]
    Url(String),
}

/// Turns one fetched page into flat records. Never fails on page content:
/// a field that cannot be read comes back as `None`.
pub trait SourceExtractor: Send + Sync {
    type Output;

    fn source(&self) -> SourceId;

    fn extract(&self, page: &str) -> Self::Output;
}

/// Base URLs of the upstream sites, overridable for tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEndpoints {
    pub box_office: String,
    pub reviews: String,
    pub budgets: String,
}

impl Default for SourceEndpoints {
    fn default() -> Self {
        Self {
            box_office: "https://www.boxofficemojo.com".to_string(),
            reviews: "https://www.rottentomatoes.com".to_string(),
            budgets: "https://www.the-numbers.com/movie/budgets/all".to_string(),
        }
    }
}

/// Per-source request spacing.
pub fn politeness_interval(source: SourceId) -> Duration {
    match source {
        SourceId::BoxOfficeIndex | SourceId::BoxOfficeDetail => Duration::from_millis(1500),
        SourceId::ReviewAggregator => Duration::from_millis(2000),
        SourceId::BudgetDatabase => Duration::from_millis(1000),
    }
}

const MONEY_PLACEHOLDERS: [&str; 6] = ["", "-", "\u{2013}", "\u{2014}", "n/a", "N/A"];

/// Parses `$154,201,673`, `$1.2B`, `$400M`, `4,440` and similar into whole units.
///
/// Empty text, dashes and `n/a` are unknown values, as is anything unparseable.
pub fn parse_money(text: &str) -> Option<i64> {
    let text = text.trim();
    if MONEY_PLACEHOLDERS.contains(&text) {
        return None;
    }

    let cleaned: String = text.chars().filter(|c| *c != '$' && *c != ',').collect();
    let cleaned = cleaned.trim();
    let (number, multiplier) = match cleaned.chars().last().map(|c| c.to_ascii_uppercase()) {
        Some('B') => (&cleaned[..cleaned.len() - 1], 1_000_000_000.0),
        Some('M') => (&cleaned[..cleaned.len() - 1], 1_000_000.0),
        Some('K') => (&cleaned[..cleaned.len() - 1], 1_000.0),
        _ => (cleaned, 1.0),
    };

    let value = number.trim().parse::<f64>().ok()? * multiplier;
    if !value.is_finite() || value.abs() >= i64::MAX as f64 {
        return None;
    }
    Some(value.trunc() as i64)
}

const DATE_FORMATS: [&str; 4] = ["%b %d, %Y", "%B %d, %Y", "%Y-%m-%d", "%m/%d/%Y"];

/// Parses `Jun 14, 2024`, `June 14, 2024`, `2024-06-14` or `06/14/2024`.
pub fn parse_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(text, format).ok())
}

pub(crate) fn selector(css: &str) -> Result<Selector, ExtractError> {
    Selector::parse(css).map_err(|e| ExtractError::Selector {
        selector: css.to_string(),
        message: e.to_string(),
    })
}

/// Text of every descendant node, trimmed and concatenated.
pub(crate) fn stripped_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("")
}

/// Non-empty trimmed text fragments of an element, in document order.
pub(crate) fn text_parts(element: ElementRef<'_>) -> Vec<String> {
    element
        .text()
        .flat_map(|t| t.split('|'))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

pub(crate) fn non_empty(value: impl Into<String>) -> Option<String> {
    let value = value.into();
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
