use std::collections::HashSet;

use frdd_core::{ReviewMatchMethod, SourceId};
use frdd_storage::{FetchedResponse, PageFetcher};
use regex::Regex;
use reqwest::{StatusCode, Url};
use scraper::{Html, Selector};
use tracing::debug;

use crate::{selector, stripped_text, ExtractError};

/// Search hits scoring below this are not trusted.
pub const MIN_SEARCH_SCORE: i32 = 50;

const SLUG_DROPPED: &[char] = &['"', ':', ',', '.', '!', '?', ';', '(', ')', '[', ']', '{', '}'];

/// Candidate `/m/<slug>` paths for a title, most likely first.
///
/// The site lowercases, joins words with underscores and drops most punctuation.
/// Hyphens are sometimes kept and sometimes turned into underscores, and remakes
/// often carry a `_<year>` suffix, so those variants are tried too.
pub fn slug_candidates(title: &str, year: Option<i32>) -> Vec<String> {
    let mut raw = String::with_capacity(title.len());
    for ch in title.trim().to_lowercase().chars() {
        match ch {
            '&' => raw.push_str("and"),
            '\'' | '\u{2019}' => {}
            c if SLUG_DROPPED.contains(&c) => {}
            c if c.is_whitespace() => raw.push('_'),
            c => raw.push(c),
        }
    }
    let slug = raw
        .split('_')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_");
    if slug.is_empty() {
        return Vec::new();
    }

    let unhyphenated = slug.contains('-').then(|| slug.replace('-', "_"));
    let mut candidates = vec![slug.clone()];
    candidates.extend(unhyphenated.clone());
    if let Some(year) = year {
        candidates.push(format!("{slug}_{year}"));
        if let Some(variant) = &unhyphenated {
            candidates.push(format!("{variant}_{year}"));
        }
    }

    let mut seen = HashSet::new();
    candidates.retain(|c| seen.insert(c.clone()));
    candidates
}

/// [`slug_candidates`] with the year-suffixed variants moved to the front.
pub fn rescrape_slug_order(title: &str, year: Option<i32>) -> Vec<String> {
    let candidates = slug_candidates(title, year);
    let Some(year) = year else {
        return candidates;
    };
    let year = year.to_string();
    let (mut ordered, rest): (Vec<String>, Vec<String>) =
        candidates.into_iter().partition(|slug| slug.contains(&year));
    ordered.extend(rest);
    ordered
}

/// Heuristic relevance of one search hit: exact 100, containment 80, otherwise
/// word overlap scaled to 70, plus 10 when the release year appears in the URL.
pub fn score_search_hit(title: &str, year: Option<i32>, url: &str, link_text: &str) -> i32 {
    let title = title.trim().to_lowercase();
    let text = link_text.trim().to_lowercase();

    let mut score = if text == title {
        100
    } else if text.contains(&title) || title.contains(&text) {
        80
    } else {
        let title_words: HashSet<&str> = title.split_whitespace().collect();
        let text_words: HashSet<&str> = text.split_whitespace().collect();
        if title_words.is_empty() || text_words.is_empty() {
            0
        } else {
            let shared = title_words.intersection(&text_words).count() as f64;
            let overlap = shared / title_words.len().max(text_words.len()) as f64;
            (overlap * 70.0) as i32
        }
    };

    if let Some(year) = year {
        if url.contains(&year.to_string()) {
            score += 10;
        }
    }
    score
}

#[derive(Debug, Clone)]
pub struct LocatedPage {
    pub url: String,
    pub method: ReviewMatchMethod,
    pub response: FetchedResponse,
}

/// Finds the review page for a film: slug candidates first, then the site search.
pub struct ReviewLocator<'a> {
    fetcher: &'a dyn PageFetcher,
    base_url: String,
    film_link: Selector,
    script: Selector,
    film_href: Regex,
    script_slug: Regex,
    min_search_score: i32,
}

impl<'a> ReviewLocator<'a> {
    pub fn new(fetcher: &'a dyn PageFetcher, base_url: &str) -> Result<Self, ExtractError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        Url::parse(&base_url).map_err(|e| ExtractError::Url(format!("{base_url}: {e}")))?;
        Ok(Self {
            fetcher,
            base_url,
            film_link: selector("a[href]")?,
            script: selector("script")?,
            film_href: Regex::new(r"/m/[^/]+")?,
            script_slug: Regex::new(r#""/m/([^"]+)""#)?,
            min_search_score: MIN_SEARCH_SCORE,
        })
    }

    pub fn with_min_search_score(mut self, min_search_score: i32) -> Self {
        self.min_search_score = min_search_score;
        self
    }

    pub async fn locate(&self, title: &str, year: Option<i32>) -> Option<LocatedPage> {
        let any_page = |_: &FetchedResponse| true;
        if let Some(page) = self
            .try_slugs(slug_candidates(title, year), ReviewMatchMethod::DirectUrl, &any_page)
            .await
        {
            return Some(page);
        }
        self.search(title, year, ReviewMatchMethod::Search, &any_page).await
    }

    /// Second pass for a film whose page was found but carried no scores.
    ///
    /// Year-suffixed slugs go first, since a bare slug often names another film
    /// with the same title. A page only counts when `has_scores` accepts it.
    pub async fn relocate(
        &self,
        title: &str,
        year: Option<i32>,
        has_scores: impl Fn(&FetchedResponse) -> bool,
    ) -> Option<LocatedPage> {
        let slugs = rescrape_slug_order(title, year);
        if let Some(page) = self
            .try_slugs(slugs, ReviewMatchMethod::DirectUrl.rescraped(), &has_scores)
            .await
        {
            return Some(page);
        }
        self.search(title, year, ReviewMatchMethod::Search.rescraped(), &has_scores)
            .await
    }

    async fn try_slugs<F: Fn(&FetchedResponse) -> bool>(
        &self,
        slugs: Vec<String>,
        method: ReviewMatchMethod,
        accept: &F,
    ) -> Option<LocatedPage> {
        for slug in slugs {
            let url = format!("{}/m/{}", self.base_url, slug);
            match self.fetcher.fetch_page(SourceId::ReviewAggregator, &url).await {
                Ok(response) if is_film_page(&response) && accept(&response) => {
                    return Some(LocatedPage { url, method, response });
                }
                Ok(response) => {
                    debug!(%url, final_url = %response.final_url, "slug did not land on a usable film page");
                }
                Err(err) => debug!(%url, error = %err, "slug request failed"),
            }
        }
        None
    }

    async fn search<F: Fn(&FetchedResponse) -> bool>(
        &self,
        title: &str,
        year: Option<i32>,
        method: ReviewMatchMethod,
        accept: &F,
    ) -> Option<LocatedPage> {
        let search_url =
            Url::parse_with_params(&format!("{}/search", self.base_url), &[("search", title)])
                .ok()?;
        let response = match self
            .fetcher
            .fetch_page(SourceId::ReviewAggregator, search_url.as_str())
            .await
        {
            Ok(response) if response.status == StatusCode::OK => response,
            Ok(_) => return None,
            Err(err) => {
                debug!(title, error = %err, "search request failed");
                return None;
            }
        };

        let mut best: Option<(String, i32)> = None;
        for (url, text) in self.search_hits(&response.text()) {
            let score = score_search_hit(title, year, &url, &text);
            if score > best.as_ref().map_or(0, |(_, s)| *s) {
                best = Some((url, score));
            }
        }
        let (url, score) = best.filter(|(_, score)| *score >= self.min_search_score)?;
        debug!(title, %url, score, "search picked a film page");

        match self.fetcher.fetch_page(SourceId::ReviewAggregator, &url).await {
            Ok(response) if response.status == StatusCode::OK && accept(&response) => {
                Some(LocatedPage { url, method, response })
            }
            Ok(_) => None,
            Err(err) => {
                debug!(%url, error = %err, "search hit could not be fetched");
                None
            }
        }
    }

    /// `(absolute url, link text)` for every film linked from a search page,
    /// including slugs only present in embedded script data.
    fn search_hits(&self, page: &str) -> Vec<(String, String)> {
        let document = Html::parse_document(page);
        let mut hits: Vec<(String, String)> = Vec::new();

        for link in document.select(&self.film_link) {
            let Some(href) = link.value().attr("href") else {
                continue;
            };
            let text = stripped_text(link);
            if !self.film_href.is_match(href) || text.is_empty() {
                continue;
            }
            let url = if href.starts_with('/') {
                format!("{}{}", self.base_url, href)
            } else {
                href.to_string()
            };
            hits.push((url, text));
        }

        for script in document.select(&self.script) {
            let body: String = script.text().collect();
            for captures in self.script_slug.captures_iter(&body) {
                let slug = &captures[1];
                let url = format!("{}/m/{}", self.base_url, slug);
                if !hits.iter().any(|(known, _)| *known == url) {
                    hits.push((url, slug.replace('_', " ")));
                }
            }
        }
        hits
    }
}

/// A slug hit counts only if it lands on a film page rather than a search redirect.
fn is_film_page(response: &FetchedResponse) -> bool {
    response.status == StatusCode::OK
        && response.final_url.contains("/m/")
        && !response.final_url.contains("search")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use frdd_storage::FetchError;

    use super::*;

    #[derive(Default)]
    struct ScriptedFetcher {
        pages: HashMap<String, FetchedResponse>,
        requested: Mutex<Vec<String>>,
    }

    impl ScriptedFetcher {
        fn page(mut self, url: &str, final_url: &str, body: &str) -> Self {
            self.pages.insert(
                url.to_string(),
                FetchedResponse {
                    status: StatusCode::OK,
                    final_url: final_url.to_string(),
                    body: body.as_bytes().to_vec(),
                },
            );
            self
        }

        fn requested(&self) -> Vec<String> {
            self.requested.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl PageFetcher for ScriptedFetcher {
        async fn fetch_page(&self, _source: SourceId, url: &str) -> Result<FetchedResponse, FetchError> {
            self.requested.lock().expect("lock").push(url.to_string());
            self.pages.get(url).cloned().ok_or_else(|| FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            })
        }
    }

    #[test]
    fn slugs_drop_punctuation_and_join_words() {
        assert_eq!(
            slug_candidates("Spider-Man: No Way Home", Some(2021)),
            vec![
                "spider-man_no_way_home",
                "spider_man_no_way_home",
                "spider-man_no_way_home_2021",
                "spider_man_no_way_home_2021",
            ]
        );
        assert_eq!(
            slug_candidates("Fast & Furious   Presents", None),
            vec!["fast_and_furious_presents"]
        );
        assert_eq!(slug_candidates("Ocean\u{2019}s Eight", None), vec!["oceans_eight"]);
        assert!(slug_candidates("  ?! ", Some(2024)).is_empty());
    }

    #[test]
    fn rescrape_order_tries_year_slugs_first() {
        assert_eq!(
            rescrape_slug_order("Smile", Some(2022)),
            vec!["smile_2022", "smile"]
        );
        assert_eq!(rescrape_slug_order("Smile", None), vec!["smile"]);
    }

    #[test]
    fn search_scores_follow_exact_substring_overlap_order() {
        let url = "https://rt.test/m/the_batman";
        assert_eq!(score_search_hit("The Batman", None, url, "the batman"), 100);
        assert_eq!(score_search_hit("Batman", None, url, "The Batman"), 80);
        assert_eq!(score_search_hit("The Batman", Some(2022), url, "Batman Begins"), 35);
        assert_eq!(
            score_search_hit("Wicked", Some(2024), "https://rt.test/m/wicked_2024", "Wicked"),
            110
        );
        assert_eq!(score_search_hit("Dune", None, url, "Heat"), 0);
    }

    #[tokio::test]
    async fn direct_slug_wins_before_search() {
        let fetcher = ScriptedFetcher::default().page(
            "https://rt.test/m/inside_out_2",
            "https://rt.test/m/inside_out_2",
            r#"{"criticsScore":{"score":"91"}}"#,
        );
        let locator = ReviewLocator::new(&fetcher, "https://rt.test").expect("locator");

        let page = locator.locate("Inside Out 2", Some(2024)).await.expect("located");
        assert_eq!(page.method, ReviewMatchMethod::DirectUrl);
        assert_eq!(page.url, "https://rt.test/m/inside_out_2");
        assert_eq!(fetcher.requested().len(), 1);
    }

    #[tokio::test]
    async fn redirect_to_search_falls_through_to_search_strategy() {
        let fetcher = ScriptedFetcher::default()
            .page(
                "https://rt.test/m/wicked",
                "https://rt.test/search?search=wicked",
                "<html></html>",
            )
            .page(
                "https://rt.test/search?search=Wicked",
                "https://rt.test/search?search=Wicked",
                r#"<html><body>
                    <a href="/m/wicked_1998">Wicked (1998)</a>
                    <script>{"items":[{"url":"/m/wicked_part_i_2024"}]}</script>
                </body></html>"#,
            )
            .page(
                "https://rt.test/m/wicked_part_i_2024",
                "https://rt.test/m/wicked_part_i_2024",
                "<title>Wicked | Rotten Tomatoes</title>",
            );
        let locator = ReviewLocator::new(&fetcher, "https://rt.test").expect("locator");

        let page = locator.locate("Wicked", Some(2024)).await.expect("located");
        assert_eq!(page.method, ReviewMatchMethod::Search);
        assert_eq!(page.url, "https://rt.test/m/wicked_part_i_2024");
        assert_eq!(
            fetcher.requested()[..2],
            [
                "https://rt.test/m/wicked".to_string(),
                "https://rt.test/m/wicked_2024".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn weak_search_hits_leave_the_film_unmatched() {
        let fetcher = ScriptedFetcher::default().page(
            "https://rt.test/search?search=Obscure+Film",
            "https://rt.test/search?search=Obscure+Film",
            r#"<a href="/m/something_else">Something Else Entirely</a>"#,
        );
        let locator = ReviewLocator::new(&fetcher, "https://rt.test").expect("locator");

        assert!(locator.locate("Obscure Film", None).await.is_none());
        assert_eq!(
            fetcher.requested(),
            vec![
                "https://rt.test/m/obscure_film".to_string(),
                "https://rt.test/search?search=Obscure+Film".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn relocate_skips_scoreless_pages_and_marks_the_second_pass() {
        let fetcher = ScriptedFetcher::default()
            .page("https://rt.test/m/nobody_2021", "https://rt.test/m/nobody_2021", "<html>skeleton</html>")
            .page(
                "https://rt.test/m/nobody",
                "https://rt.test/m/nobody",
                r#"{"criticsScore":{"score":"84"}}"#,
            );
        let locator = ReviewLocator::new(&fetcher, "https://rt.test").expect("locator");
        let has_scores = |response: &FetchedResponse| response.text().contains("criticsScore");

        let page = locator
            .relocate("Nobody", Some(2021), has_scores)
            .await
            .expect("relocated");
        assert_eq!(page.method, ReviewMatchMethod::RescrapeDirect);
        assert_eq!(page.url, "https://rt.test/m/nobody");
        assert_eq!(
            fetcher.requested(),
            vec![
                "https://rt.test/m/nobody_2021".to_string(),
                "https://rt.test/m/nobody".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn relocate_falls_back_to_search() {
        let fetcher = ScriptedFetcher::default()
            .page(
                "https://rt.test/search?search=Smile",
                "https://rt.test/search?search=Smile",
                r#"<a href="/m/smile_2022">Smile</a>"#,
            )
            .page(
                "https://rt.test/m/smile_2022",
                "https://rt.test/m/smile_2022",
                r#"{"criticsScore":{"score":"80"}}"#,
            );
        let locator = ReviewLocator::new(&fetcher, "https://rt.test").expect("locator");
        let has_scores = |response: &FetchedResponse| response.text().contains("criticsScore");

        // Without a year only the bare slug is tried, and it does not exist.
        let page = locator.relocate("Smile", None, has_scores).await.expect("relocated");
        assert_eq!(page.method, ReviewMatchMethod::RescrapeSearch);
        assert_eq!(page.url, "https://rt.test/m/smile_2022");
    }
}
