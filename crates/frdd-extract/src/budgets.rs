use chrono::Datelike;
use frdd_core::SourceId;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{parse_date, parse_money, selector, stripped_text, ExtractError, SourceExtractor};

/// Rows served per page of the budget table; a shorter page is the last one.
pub const BUDGET_ROWS_PER_PAGE: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetRow {
    pub tn_rank: Option<u32>,
    pub title: String,
    /// ISO date when parseable, otherwise the page text.
    pub release_date: String,
    pub release_year: Option<i32>,
    pub production_budget: Option<i64>,
    pub domestic_gross: Option<i64>,
    pub worldwide_gross: Option<i64>,
}

pub struct BudgetTableExtractor {
    base_url: String,
    table: Selector,
    row: Selector,
    cell: Selector,
}

impl BudgetTableExtractor {
    pub fn new(base_url: &str) -> Result<Self, ExtractError> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            table: selector("table")?,
            row: selector("tr")?,
            cell: selector("td")?,
        })
    }

    /// Pages are addressed by the 1-based rank of their first row.
    pub fn page_url(&self, first_rank: usize) -> String {
        if first_rank <= 1 {
            self.base_url.clone()
        } else {
            format!("{}/{}", self.base_url, first_rank)
        }
    }

    fn parse_row(&self, row: ElementRef<'_>) -> Option<BudgetRow> {
        let cells: Vec<String> = row.select(&self.cell).map(stripped_text).collect();
        if cells.len() < 6 {
            return None;
        }

        let release_date = parse_date(&cells[1]);
        Some(BudgetRow {
            tn_rank: cells[0].parse().ok(),
            title: cells[2].clone(),
            release_date: release_date
                .map(|d| d.to_string())
                .unwrap_or_else(|| cells[1].clone()),
            release_year: release_date.map(|d| d.year()),
            production_budget: parse_money(&cells[3]),
            domestic_gross: parse_money(&cells[4]),
            worldwide_gross: parse_money(&cells[5]),
        })
    }
}

impl SourceExtractor for BudgetTableExtractor {
    type Output = Vec<BudgetRow>;

    fn source(&self) -> SourceId {
        SourceId::BudgetDatabase
    }

    fn extract(&self, page: &str) -> Vec<BudgetRow> {
        let document = Html::parse_document(page);
        let Some(table) = document.select(&self.table).next() else {
            warn!("budget page has no table");
            return Vec::new();
        };
        table
            .select(&self.row)
            .filter_map(|row| self.parse_row(row))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_rows_parse_money_and_release_year() {
        let extractor = BudgetTableExtractor::new("https://tn.test/budgets/all").expect("extractor");
        let rows = extractor.extract(
            r#"<table>
                <tr><th>#</th><th>Release</th><th>Movie</th><th>Budget</th><th>Domestic</th><th>Worldwide</th></tr>
                <tr><td>1</td><td>Dec 9, 2022</td><td><a href="/movie/x">Avatar: The Way of Water</a></td>
                    <td>$460,000,000</td><td>$684,075,767</td><td>$2,320,250,281</td></tr>
                <tr><td>2</td><td>Unknown</td><td>Untitled Project</td><td>$100,000,000</td><td>$0</td><td>$0</td></tr>
            </table>"#,
        );

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].tn_rank, Some(1));
        assert_eq!(rows[0].title, "Avatar: The Way of Water");
        assert_eq!(rows[0].release_date, "2022-12-09");
        assert_eq!(rows[0].release_year, Some(2022));
        assert_eq!(rows[0].production_budget, Some(460_000_000));
        assert_eq!(rows[0].worldwide_gross, Some(2_320_250_281));
        assert_eq!(rows[1].release_date, "Unknown");
        assert_eq!(rows[1].release_year, None);
    }

    #[test]
    fn page_urls_follow_rank_offsets() {
        let extractor = BudgetTableExtractor::new("https://tn.test/budgets/all/").expect("extractor");
        assert_eq!(extractor.page_url(1), "https://tn.test/budgets/all");
        assert_eq!(extractor.page_url(101), "https://tn.test/budgets/all/101");
    }
}
