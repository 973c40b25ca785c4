use std::collections::{HashMap, HashSet};
use std::path::Path;

use chrono::{Datelike, Utc};
use frdd_core::{ReviewMatchMethod, SourceId};
use frdd_storage::{
    read_csv_table, write_csv_table, CheckpointTable, FetchedResponse, PageArchive, PageFetcher,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    parse_date, BoxOfficeDetailExtractor, BoxOfficeIndexExtractor, BudgetTableExtractor,
    DetailRow, IndexRow, ReviewLocator, ReviewPageExtractor, ReviewRow, SourceExtractor,
    BUDGET_ROWS_PER_PAGE,
};

pub const DETAIL_CHECKPOINT_EVERY: usize = 50;
pub const REVIEW_CHECKPOINT_EVERY: usize = 25;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CollectSummary {
    pub attempted: usize,
    /// Pages that could not be fetched, or films whose review page was not found.
    pub failed: usize,
    /// Already present in the checkpoint from an earlier run.
    pub skipped: usize,
    pub rows_written: usize,
}

/// A film to look up on the review site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewTarget {
    pub bom_release_id: String,
    pub title: String,
    pub year: Option<i32>,
}

impl ReviewTarget {
    pub fn from_detail(row: &DetailRow) -> Self {
        Self {
            bom_release_id: row.bom_release_id.clone(),
            title: row.title.clone(),
            year: row
                .release_date
                .as_deref()
                .and_then(parse_date)
                .map(|d| d.year()),
        }
    }

    /// Listing rows only carry a month and day, so the year stays unknown.
    pub fn from_index(row: &IndexRow) -> Self {
        Self {
            bom_release_id: row.bom_release_id.clone(),
            title: row.title.clone(),
            year: None,
        }
    }
}

async fn archive_page(archive: Option<&PageArchive>, source: SourceId, response: &FetchedResponse) {
    let Some(archive) = archive else {
        return;
    };
    if let Err(err) = archive.store_page(Utc::now(), source, &response.body).await {
        warn!(%source, url = %response.final_url, error = %err, "failed to archive page");
    }
}

/// Fetches each yearly listing page and writes the de-duplicated index table.
///
/// A release running across New Year shows up on two yearly pages; the first
/// listing wins.
pub async fn collect_index(
    fetcher: &dyn PageFetcher,
    archive: Option<&PageArchive>,
    base_url: &str,
    years: &[i32],
    out_path: &Path,
) -> anyhow::Result<CollectSummary> {
    let mut summary = CollectSummary::default();
    let mut rows: Vec<IndexRow> = Vec::new();

    for &year in years {
        let extractor = BoxOfficeIndexExtractor::new(year, base_url)?;
        let url = extractor.listing_url();
        summary.attempted += 1;
        match fetcher.fetch_page(extractor.source(), &url).await {
            Ok(response) => {
                archive_page(archive, extractor.source(), &response).await;
                let parsed = extractor.extract(&response.text());
                info!(year, rows = parsed.len(), "parsed listing page");
                rows.extend(parsed);
            }
            Err(err) => {
                warn!(year, %url, error = %err, "listing page fetch failed");
                summary.failed += 1;
            }
        }
    }

    let before = rows.len();
    let mut seen = HashSet::new();
    rows.retain(|row| seen.insert(row.bom_release_id.clone()));
    if rows.len() != before {
        info!(removed = before - rows.len(), "dropped duplicate release ids");
    }

    if rows.is_empty() {
        warn!("no listing rows collected; index table left untouched");
        return Ok(summary);
    }
    write_csv_table(out_path, &rows)?;
    summary.rows_written = rows.len();
    info!(rows = rows.len(), path = %out_path.display(), "index table written");
    Ok(summary)
}

/// Fetches one detail page per listed release, resuming from `out_path`.
pub async fn collect_details(
    fetcher: &dyn PageFetcher,
    archive: Option<&PageArchive>,
    index_rows: &[IndexRow],
    out_path: &Path,
    checkpoint_every: usize,
) -> anyhow::Result<CollectSummary> {
    let extractor = BoxOfficeDetailExtractor::new()?;
    let mut table = CheckpointTable::open(out_path, "bom_release_id")?;
    let mut summary = CollectSummary::default();
    let mut batch: Vec<DetailRow> = Vec::new();

    for row in index_rows {
        if table.is_processed(&row.bom_release_id) {
            summary.skipped += 1;
            continue;
        }
        summary.attempted += 1;

        let detail = match fetcher.fetch_page(extractor.source(), &row.release_url).await {
            Ok(response) => {
                archive_page(archive, extractor.source(), &response).await;
                DetailRow::new(&row.bom_release_id, &row.title, extractor.extract(&response.text()))
            }
            Err(err) => {
                warn!(release_id = %row.bom_release_id, url = %row.release_url, error = %err, "detail page fetch failed");
                summary.failed += 1;
                DetailRow::unreachable(&row.bom_release_id, &row.title)
            }
        };
        batch.push(detail);

        if batch.len() >= checkpoint_every.max(1) {
            table.append(&batch, |r| r.bom_release_id.as_str())?;
            summary.rows_written += batch.len();
            batch.clear();
        }
    }
    table.append(&batch, |r| r.bom_release_id.as_str())?;
    summary.rows_written += batch.len();

    info!(
        attempted = summary.attempted,
        skipped = summary.skipped,
        failed = summary.failed,
        "detail collection finished"
    );
    Ok(summary)
}

/// Locates and reads the review page for each target, resuming from `out_path`.
pub async fn collect_reviews(
    fetcher: &dyn PageFetcher,
    archive: Option<&PageArchive>,
    base_url: &str,
    targets: &[ReviewTarget],
    out_path: &Path,
    checkpoint_every: usize,
) -> anyhow::Result<CollectSummary> {
    let locator = ReviewLocator::new(fetcher, base_url)?;
    let extractor = ReviewPageExtractor::new()?;
    let mut table = CheckpointTable::open(out_path, "bom_release_id")?;
    let mut summary = CollectSummary::default();
    let mut batch: Vec<ReviewRow> = Vec::new();

    for target in targets {
        if table.is_processed(&target.bom_release_id) {
            summary.skipped += 1;
            continue;
        }
        summary.attempted += 1;

        let row = match locator.locate(&target.title, target.year).await {
            Some(page) => {
                archive_page(archive, extractor.source(), &page.response).await;
                let fields = extractor.extract(&page.response.text());
                ReviewRow::located(&target.bom_release_id, &target.title, page.url, page.method, fields)
            }
            None => {
                warn!(release_id = %target.bom_release_id, title = %target.title, "review page not found");
                summary.failed += 1;
                ReviewRow::unmatched(&target.bom_release_id, &target.title)
            }
        };
        batch.push(row);

        if batch.len() >= checkpoint_every.max(1) {
            table.append(&batch, |r| r.bom_release_id.as_str())?;
            summary.rows_written += batch.len();
            batch.clear();
        }
    }
    table.append(&batch, |r| r.bom_release_id.as_str())?;
    summary.rows_written += batch.len();

    info!(
        attempted = summary.attempted,
        matched = summary.attempted - summary.failed,
        unmatched = summary.failed,
        skipped = summary.skipped,
        "review collection finished"
    );
    Ok(summary)
}

/// A review page was found but neither score could be read from it.
fn lacks_scores(row: &ReviewRow) -> bool {
    row.match_method != ReviewMatchMethod::Unmatched
        && row.tomatometer.is_none()
        && row.audience_score.is_none()
}

/// Second pass over `table_path`: relocates films whose page carried no
/// scores and rewrites the table in place.
///
/// Release years come from `targets`, keyed by release id. Recovered rows are
/// tagged `rescrape_direct` or `rescrape_search`; the rest keep their row.
pub async fn rescrape_missing_reviews(
    fetcher: &dyn PageFetcher,
    archive: Option<&PageArchive>,
    base_url: &str,
    targets: &[ReviewTarget],
    table_path: &Path,
) -> anyhow::Result<CollectSummary> {
    let locator = ReviewLocator::new(fetcher, base_url)?;
    let extractor = ReviewPageExtractor::new()?;
    let years: HashMap<&str, i32> = targets
        .iter()
        .filter_map(|t| Some((t.bom_release_id.as_str(), t.year?)))
        .collect();
    let mut rows: Vec<ReviewRow> = read_csv_table(table_path)?;
    let mut summary = CollectSummary::default();
    let mut recovered = 0usize;

    for row in rows.iter_mut().filter(|row| lacks_scores(row)) {
        summary.attempted += 1;
        let id = row.bom_release_id.clone();
        let title = row.title_searched.clone();
        let year = years.get(id.as_str()).copied();
        let has_scores =
            |response: &FetchedResponse| extractor.extract(&response.text()).tomatometer.is_some();

        match locator.relocate(&title, year, has_scores).await {
            Some(page) => {
                archive_page(archive, extractor.source(), &page.response).await;
                let fields = extractor.extract(&page.response.text());
                info!(release_id = %id, method = %page.method, url = %page.url, "review scores recovered");
                *row = ReviewRow::located(id, title, page.url, page.method, fields);
                recovered += 1;
            }
            None => {
                debug!(release_id = %id, %title, "review scores still missing");
                summary.failed += 1;
            }
        }
    }

    if recovered > 0 {
        write_csv_table(table_path, &rows)?;
        summary.rows_written = rows.len();
    }
    info!(
        attempted = summary.attempted,
        recovered,
        still_missing = summary.failed,
        "review rescrape finished"
    );
    Ok(summary)
}

/// Walks the paginated budget table until a short or empty page.
pub async fn collect_budgets(
    fetcher: &dyn PageFetcher,
    archive: Option<&PageArchive>,
    base_url: &str,
    out_path: &Path,
) -> anyhow::Result<CollectSummary> {
    let extractor = BudgetTableExtractor::new(base_url)?;
    let mut summary = CollectSummary::default();
    let mut rows = Vec::new();
    let mut first_rank = 1usize;

    loop {
        let url = extractor.page_url(first_rank);
        summary.attempted += 1;
        let response = match fetcher.fetch_page(extractor.source(), &url).await {
            Ok(response) => response,
            Err(err) => {
                warn!(%url, error = %err, "budget page fetch failed; stopping");
                summary.failed += 1;
                break;
            }
        };
        archive_page(archive, extractor.source(), &response).await;

        let page_rows = extractor.extract(&response.text());
        let count = page_rows.len();
        rows.extend(page_rows);
        if count == 0 {
            info!(first_rank, "budget table exhausted");
            break;
        }
        if count < BUDGET_ROWS_PER_PAGE {
            info!(first_rank, rows = count, "last budget page reached");
            break;
        }
        first_rank += BUDGET_ROWS_PER_PAGE;
    }

    if rows.is_empty() {
        warn!("no budget rows collected; budget table left untouched");
        return Ok(summary);
    }
    write_csv_table(out_path, &rows)?;
    summary.rows_written = rows.len();
    info!(rows = rows.len(), path = %out_path.display(), "budget table written");
    Ok(summary)
}
