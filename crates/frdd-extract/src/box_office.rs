use frdd_core::SourceId;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{non_empty, parse_money, selector, stripped_text, text_parts, ExtractError, SourceExtractor};

/// One row of a yearly box-office listing page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRow {
    pub bom_release_id: String,
    pub title: String,
    pub gross: Option<i64>,
    pub total_gross: Option<i64>,
    pub max_theaters: Option<i64>,
    /// Month and day only, e.g. `Jun 14`; the year comes from `bom_year`.
    pub release_date_raw: String,
    pub bom_year: i32,
    pub distributor: Option<String>,
    pub release_url: String,
}

pub struct BoxOfficeIndexExtractor {
    year: i32,
    base_url: String,
    table: Selector,
    row: Selector,
    cell: Selector,
    link: Selector,
    release_href: Regex,
}

impl BoxOfficeIndexExtractor {
    pub fn new(year: i32, base_url: &str) -> Result<Self, ExtractError> {
        Ok(Self {
            year,
            base_url: base_url.trim_end_matches('/').to_string(),
            table: selector("table")?,
            row: selector("tr")?,
            cell: selector("td")?,
            link: selector("a")?,
            release_href: Regex::new(r"/release/(rl\d+)/")?,
        })
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn listing_url(&self) -> String {
        format!("{}/year/{}/", self.base_url, self.year)
    }

    fn parse_row(&self, row: ElementRef<'_>) -> Option<IndexRow> {
        let cells: Vec<ElementRef<'_>> = row.select(&self.cell).collect();
        if cells.len() < 10 {
            return None;
        }

        let link = cells[1].select(&self.link).next()?;
        let href = link.value().attr("href").unwrap_or_default();
        let Some(captures) = self.release_href.captures(href) else {
            debug!(href, "listing row without release id");
            return None;
        };
        let release_id = captures[1].to_string();
        let cell = |index: usize| stripped_text(cells[index]);

        Some(IndexRow {
            title: stripped_text(link),
            gross: parse_money(&cell(5)),
            max_theaters: parse_money(&cell(6)),
            total_gross: parse_money(&cell(7)),
            release_date_raw: cell(8),
            bom_year: self.year,
            distributor: non_empty(cell(9)),
            release_url: format!("{}/release/{}/", self.base_url, release_id),
            bom_release_id: release_id,
        })
    }
}

impl SourceExtractor for BoxOfficeIndexExtractor {
    type Output = Vec<IndexRow>;

    fn source(&self) -> SourceId {
        SourceId::BoxOfficeIndex
    }

    fn extract(&self, page: &str) -> Vec<IndexRow> {
        let document = Html::parse_document(page);
        let Some(table) = document.select(&self.table).next() else {
            warn!(year = self.year, "listing page has no table");
            return Vec::new();
        };
        // The first row is the column header.
        table
            .select(&self.row)
            .skip(1)
            .filter_map(|row| self.parse_row(row))
            .collect()
    }
}

/// Fields read from one release detail page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetailFields {
    pub opening_wknd_gross: Option<i64>,
    pub opening_wknd_theaters: Option<i64>,
    pub widest_release: Option<i64>,
    pub domestic_gross: Option<i64>,
    pub mpaa_rating: Option<String>,
    pub genres: Option<String>,
    /// Free text as shown on the page, parsed during the merge.
    pub release_date: Option<String>,
    pub distributor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailRow {
    pub bom_release_id: String,
    pub title: String,
    pub opening_wknd_gross: Option<i64>,
    pub opening_wknd_theaters: Option<i64>,
    pub widest_release: Option<i64>,
    pub domestic_gross: Option<i64>,
    pub mpaa_rating: Option<String>,
    pub genres: Option<String>,
    pub release_date: Option<String>,
    pub distributor: Option<String>,
}

impl DetailRow {
    pub fn new(bom_release_id: impl Into<String>, title: impl Into<String>, fields: DetailFields) -> Self {
        Self {
            bom_release_id: bom_release_id.into(),
            title: title.into(),
            opening_wknd_gross: fields.opening_wknd_gross,
            opening_wknd_theaters: fields.opening_wknd_theaters,
            widest_release: fields.widest_release,
            domestic_gross: fields.domestic_gross,
            mpaa_rating: fields.mpaa_rating,
            genres: fields.genres,
            release_date: fields.release_date,
            distributor: fields.distributor,
        }
    }

    /// Row recorded for a page that could not be fetched.
    pub fn unreachable(bom_release_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self::new(bom_release_id, title, DetailFields::default())
    }
}

pub struct BoxOfficeDetailExtractor {
    span: Selector,
    link: Selector,
    theaters: Regex,
    number: Regex,
    opening_fallback: Regex,
    domestic_fallback: Regex,
    genre_gap: Regex,
    date_href: Regex,
}

impl BoxOfficeDetailExtractor {
    pub fn new() -> Result<Self, ExtractError> {
        Ok(Self {
            span: selector("span")?,
            link: selector("a[href]")?,
            theaters: Regex::new(r"(?i)([\d,]+)\s*theaters?")?,
            number: Regex::new(r"[\d,]+")?,
            opening_fallback: Regex::new(r"(?is)Opening.*?(\$[\d,]+).*?([\d,]+)\s*theaters")?,
            domestic_fallback: Regex::new(r"(?s)Domestic\s*\([^)]*\)\s*\$?([\d,]+)")?,
            genre_gap: Regex::new(r"\s{2,}")?,
            date_href: Regex::new(r"\?date=\d{4}-\d{2}-\d{2}")?,
        })
    }

    /// Text fragments following `label` inside the summary block the label belongs to.
    ///
    /// Summary blocks are a `<span>` label followed by value spans in the same parent div.
    fn summary_parts(&self, document: &Html, label: &str) -> Vec<String> {
        let spans: Vec<ElementRef<'_>> = document.select(&self.span).collect();
        let label_span = spans
            .iter()
            .find(|span| span.text().collect::<String>().trim() == label)
            .or_else(|| spans.iter().find(|span| stripped_text(**span).starts_with(label)));
        let Some(parent) = label_span
            .and_then(|span| span.parent())
            .and_then(ElementRef::wrap)
        else {
            return Vec::new();
        };

        let parts = text_parts(parent);
        match parts.iter().position(|part| part.starts_with(label)) {
            Some(index) => parts[index + 1..].to_vec(),
            None => Vec::new(),
        }
    }

    fn opening(&self, document: &Html, page_text: &str) -> (Option<i64>, Option<i64>) {
        let mut gross = None;
        let mut theaters = None;
        for part in self.summary_parts(document, "Opening") {
            if part.contains('$') {
                gross = parse_money(&part);
            }
            if let Some(captures) = self.theaters.captures(&part) {
                theaters = parse_money(&captures[1]);
            }
        }

        if theaters.is_none() {
            if let Some(captures) = self.opening_fallback.captures(page_text) {
                if gross.is_none() {
                    gross = parse_money(&captures[1]);
                }
                theaters = parse_money(&captures[2]);
            }
        }
        (gross, theaters)
    }

    fn widest_release(&self, document: &Html) -> Option<i64> {
        self.summary_parts(document, "Widest Release")
            .iter()
            .find_map(|part| self.number.find(part))
            .and_then(|m| parse_money(m.as_str()))
    }

    fn domestic_gross(&self, document: &Html, page_text: &str) -> Option<i64> {
        self.summary_parts(document, "Domestic (")
            .iter()
            .find(|part| part.contains('$'))
            .and_then(|part| parse_money(part))
            .or_else(|| {
                self.domestic_fallback
                    .captures(page_text)
                    .and_then(|c| parse_money(&c[1]))
            })
    }

    fn genres(&self, document: &Html) -> Option<String> {
        let mut parts = self.summary_parts(document, "Genres");
        if parts.is_empty() {
            parts = self.summary_parts(document, "Genre");
        }
        let genres: Vec<&str> = parts
            .iter()
            .flat_map(|part| self.genre_gap.split(part))
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .collect();
        if genres.is_empty() {
            None
        } else {
            Some(genres.join(", "))
        }
    }

    fn release_date(&self, document: &Html) -> Option<String> {
        if let Some(first) = self.summary_parts(document, "Release Date").into_iter().next() {
            return Some(first);
        }
        document
            .select(&self.link)
            .find(|a| {
                a.value()
                    .attr("href")
                    .is_some_and(|href| self.date_href.is_match(href))
            })
            .and_then(|a| non_empty(stripped_text(a)))
    }

    fn first_part(&self, document: &Html, label: &str) -> Option<String> {
        self.summary_parts(document, label).into_iter().next()
    }
}

impl SourceExtractor for BoxOfficeDetailExtractor {
    type Output = DetailFields;

    fn source(&self) -> SourceId {
        SourceId::BoxOfficeDetail
    }

    fn extract(&self, page: &str) -> DetailFields {
        let document = Html::parse_document(page);
        let page_text: String = document.root_element().text().collect();
        let (opening_wknd_gross, opening_wknd_theaters) = self.opening(&document, &page_text);

        DetailFields {
            opening_wknd_gross,
            opening_wknd_theaters,
            widest_release: self.widest_release(&document),
            domestic_gross: self.domestic_gross(&document, &page_text),
            mpaa_rating: self.first_part(&document, "MPAA"),
            genres: self.genres(&document),
            release_date: self.release_date(&document),
            distributor: self.first_part(&document, "Distributor"),
        }
    }
}
