use frdd_core::{ReviewMatchMethod, SourceId};
use regex::Regex;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};

use crate::{selector, stripped_text, ExtractError, SourceExtractor};

/// Scores and metadata embedded in a review-aggregator film page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReviewFields {
    pub tomatometer: Option<i32>,
    pub audience_score: Option<i32>,
    pub critic_count: Option<i64>,
    pub audience_count: Option<i64>,
    pub rt_genres: Option<String>,
    pub rt_rating: Option<String>,
    pub rt_title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewRow {
    pub bom_release_id: String,
    pub title_searched: String,
    pub rt_url: Option<String>,
    pub tomatometer: Option<i32>,
    pub audience_score: Option<i32>,
    pub critic_count: Option<i64>,
    pub audience_count: Option<i64>,
    pub rt_genres: Option<String>,
    pub rt_rating: Option<String>,
    pub match_method: ReviewMatchMethod,
    pub rt_title: Option<String>,
}

impl ReviewRow {
    pub fn located(
        bom_release_id: impl Into<String>,
        title_searched: impl Into<String>,
        url: impl Into<String>,
        method: ReviewMatchMethod,
        fields: ReviewFields,
    ) -> Self {
        Self {
            bom_release_id: bom_release_id.into(),
            title_searched: title_searched.into(),
            rt_url: Some(url.into()),
            tomatometer: fields.tomatometer,
            audience_score: fields.audience_score,
            critic_count: fields.critic_count,
            audience_count: fields.audience_count,
            rt_genres: fields.rt_genres,
            rt_rating: fields.rt_rating,
            match_method: method,
            rt_title: fields.rt_title,
        }
    }

    pub fn unmatched(bom_release_id: impl Into<String>, title_searched: impl Into<String>) -> Self {
        Self {
            bom_release_id: bom_release_id.into(),
            title_searched: title_searched.into(),
            rt_url: None,
            tomatometer: None,
            audience_score: None,
            critic_count: None,
            audience_count: None,
            rt_genres: None,
            rt_rating: None,
            match_method: ReviewMatchMethod::Unmatched,
            rt_title: None,
        }
    }
}

/// Reads the JSON blobs the film page embeds for its score widgets.
pub struct ReviewPageExtractor {
    title: Selector,
    critic_score: Regex,
    audience_score: Regex,
    critic_block: Regex,
    audience_block: Regex,
    review_count: Regex,
    rating_count: Regex,
    genres: Regex,
    content_rating: Regex,
}

impl ReviewPageExtractor {
    pub fn new() -> Result<Self, ExtractError> {
        Ok(Self {
            title: selector("title")?,
            critic_score: Regex::new(r#""criticsScore"\s*:\s*\{[^}]*?"score"\s*:\s*"(\d+)""#)?,
            audience_score: Regex::new(r#""audienceScore"\s*:\s*\{[^}]*?"score"\s*:\s*"(\d+)""#)?,
            critic_block: Regex::new(r#""criticsScore"\s*:\s*(\{[^}]+\})"#)?,
            audience_block: Regex::new(r#""audienceScore"\s*:\s*(\{[^}]+\})"#)?,
            review_count: Regex::new(r#""reviewCount"\s*:\s*(\d+)"#)?,
            rating_count: Regex::new(r#""ratingCount"\s*:\s*(\d+)"#)?,
            genres: Regex::new(r#"(?s)"metadataGenres"\s*:\s*\[(.*?)\]"#)?,
            content_rating: Regex::new(r#""contentRating"\s*:\s*"([^"]+)""#)?,
        })
    }

    fn capture_number<T: std::str::FromStr>(pattern: &Regex, haystack: &str) -> Option<T> {
        pattern
            .captures(haystack)
            .and_then(|c| c[1].parse::<T>().ok())
    }

    fn page_title(&self, document: &Html) -> Option<String> {
        let title = document.select(&self.title).next().map(stripped_text)?;
        let before_bar = title.split('|').next().unwrap_or_default().trim();
        if before_bar.is_empty() {
            None
        } else {
            Some(before_bar.to_string())
        }
    }

    fn genres(&self, page: &str) -> Option<String> {
        let inner = self.genres.captures(page)?.get(1)?.as_str();
        match serde_json::from_str::<Vec<String>>(&format!("[{inner}]")) {
            Ok(genres) => Some(genres.join(", ")),
            Err(_) => Some(inner.replace('"', "").trim().to_string()),
        }
    }

    fn audience_count(&self, page: &str) -> Option<i64> {
        let block = self.audience_block.captures(page)?;
        let block = block.get(1)?.as_str();
        Self::capture_number(&self.rating_count, block)
            .or_else(|| Self::capture_number(&self.review_count, block))
    }
}

impl SourceExtractor for ReviewPageExtractor {
    type Output = ReviewFields;

    fn source(&self) -> SourceId {
        SourceId::ReviewAggregator
    }

    fn extract(&self, page: &str) -> ReviewFields {
        let document = Html::parse_document(page);
        let critic_count = self
            .critic_block
            .captures(page)
            .and_then(|c| Self::capture_number(&self.review_count, &c[1]));

        ReviewFields {
            tomatometer: Self::capture_number(&self.critic_score, page),
            audience_score: Self::capture_number(&self.audience_score, page),
            critic_count,
            audience_count: self.audience_count(page),
            rt_genres: self.genres(page),
            rt_rating: self
                .content_rating
                .captures(page)
                .map(|c| c[1].to_string()),
            rt_title: self.page_title(&document),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILM_PAGE: &str = r#"<html><head><title>Inside Out 2 | Rotten Tomatoes</title></head>
        <body><script type="application/json" id="media-scorecard-json">
        {"criticsScore":{"averageRating":"7.2","likedCount":240,"reviewCount":264,"score":"91"},
         "audienceScore":{"averageRating":"4.5","likedCount":5000,"ratingCount":10000,"reviewCount":2500,"score":"95"},
         "metadataGenres":["Kids & Family","Comedy","Adventure"],
         "contentRating":"PG"}
        </script></body></html>"#;

    #[test]
    fn scores_counts_and_metadata_come_from_embedded_json() {
        let extractor = ReviewPageExtractor::new().expect("extractor");
        let fields = extractor.extract(FILM_PAGE);

        assert_eq!(fields.tomatometer, Some(91));
        assert_eq!(fields.audience_score, Some(95));
        assert_eq!(fields.critic_count, Some(264));
        assert_eq!(fields.audience_count, Some(10_000));
        assert_eq!(fields.rt_genres.as_deref(), Some("Kids & Family, Comedy, Adventure"));
        assert_eq!(fields.rt_rating.as_deref(), Some("PG"));
        assert_eq!(fields.rt_title.as_deref(), Some("Inside Out 2"));
    }

    #[test]
    fn audience_count_falls_back_to_review_count() {
        let extractor = ReviewPageExtractor::new().expect("extractor");
        let fields = extractor
            .extract(r#"<script>{"audienceScore":{"reviewCount":812,"score":"70"}}</script>"#);
        assert_eq!(fields.audience_score, Some(70));
        assert_eq!(fields.audience_count, Some(812));
        assert_eq!(fields.tomatometer, None);
        assert_eq!(fields.critic_count, None);
    }

    #[test]
    fn page_without_scores_is_all_unknown() {
        let extractor = ReviewPageExtractor::new().expect("extractor");
        let fields = extractor.extract("<html><body>Not found</body></html>");
        assert_eq!(fields, ReviewFields::default());
    }

    #[test]
    fn unmatched_row_records_the_method() {
        let row = ReviewRow::unmatched("rl1", "Film");
        assert_eq!(row.match_method, ReviewMatchMethod::Unmatched);
        assert_eq!(row.rt_url, None);
    }
}
