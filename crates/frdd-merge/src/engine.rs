//! Staged merge of the raw tables into one row per release.
//!
//! Exact joins are hash joins on the release id; the budget table is the only
//! source linked by title. Every stage consumes the whole output of the one
//! before it.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use frdd_core::{Field, FilmRecord, PipelineStage, ReleaseId, ReviewMatchMethod, SourceId};
use frdd_extract::parse_date;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{MatchConfig, PrecedenceConfig, ResolvedField, StudyConfig};
use crate::matcher::{BudgetCandidate, TitleMatcher};
use crate::study::{apply_filters, construct_variables, FilterOutcome};
use crate::tables::{DetailRecord, IndexRecord, RawTables, ReviewRecord};

/// Takes the value from the first source in `order` that has one.
pub fn resolve<T>(order: &[SourceId], mut value_from: impl FnMut(SourceId) -> Option<T>) -> Field<T> {
    order
        .iter()
        .find_map(|&source| value_from(source).map(|value| Field::from_source(value, source)))
        .unwrap_or_default()
}

/// First row per release id, so a left join never fans out.
fn first_row_per_id<'r, T>(
    rows: &'r [T],
    table: &'static str,
    id_of: impl Fn(&T) -> &str,
) -> HashMap<&'r str, &'r T> {
    let mut by_id: HashMap<&'r str, &'r T> = HashMap::with_capacity(rows.len());
    let mut duplicates = 0usize;
    for row in rows {
        let id = id_of(row).trim();
        if id.is_empty() {
            continue;
        }
        if by_id.contains_key(id) {
            duplicates += 1;
        } else {
            by_id.insert(id, row);
        }
    }
    if duplicates > 0 {
        info!(table, duplicates, "ignored repeated release ids");
    }
    by_id
}

fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|text| {
        text.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

/// The listing only carries month and day; the year comes from the listing page.
fn listing_date(row: &IndexRecord) -> Option<chrono::NaiveDate> {
    let raw = row.release_date_raw.as_deref()?;
    let year = row.bom_year?;
    parse_date(&format!("{raw}, {year}"))
}

fn film_from_box_office(
    row: &IndexRecord,
    detail: Option<&DetailRecord>,
    precedence: &PrecedenceConfig,
) -> FilmRecord {
    let mut film = FilmRecord::new(ReleaseId::new(&row.bom_release_id), row.title.trim());
    film.listing_year = row.bom_year;
    film.max_theaters = row.max_theaters;

    if let Some(detail) = detail {
        film.opening_gross = detail.opening_wknd_gross;
        film.opening_theaters = detail.opening_wknd_theaters;
        film.widest_release = detail.widest_release;
        film.genres = split_list(detail.genres.as_deref());
    }

    film.domestic_gross = resolve(precedence.order(ResolvedField::DomesticGross), |source| match source {
        SourceId::BoxOfficeDetail => detail.and_then(|d| d.domestic_gross),
        SourceId::BoxOfficeIndex => row.total_gross,
        _ => None,
    });
    film.distributor = resolve(precedence.order(ResolvedField::Distributor), |source| match source {
        SourceId::BoxOfficeDetail => detail.and_then(|d| d.distributor.clone()),
        SourceId::BoxOfficeIndex => row.distributor.clone(),
        _ => None,
    });
    film.release_date = resolve(precedence.order(ResolvedField::ReleaseDate), |source| match source {
        SourceId::BoxOfficeDetail => detail.and_then(|d| d.release_date.as_deref()).and_then(parse_date),
        SourceId::BoxOfficeIndex => listing_date(row),
        _ => None,
    });
    // Review-sourced ratings join in the next stage.
    film.mpaa_rating = resolve(precedence.order(ResolvedField::MpaaRating), |source| match source {
        SourceId::BoxOfficeDetail => detail.and_then(|d| d.mpaa_rating.clone()),
        _ => None,
    });
    film
}

/// Left join of the listing index with the detail table.
///
/// The index is de-duplicated on release id first (a release spanning New Year
/// is listed on two yearly pages; the first listing wins).
pub fn merge_box_office(
    index: &[IndexRecord],
    details: &[DetailRecord],
    precedence: &PrecedenceConfig,
) -> Vec<FilmRecord> {
    let details = first_row_per_id(details, "bom_details", |d| d.bom_release_id.as_str());
    let mut seen = HashSet::new();
    let mut films = Vec::with_capacity(index.len());
    let mut skipped = 0usize;

    for row in index {
        let id = row.bom_release_id.trim();
        if id.is_empty() {
            warn!(title = %row.title, "index row without a release id");
            skipped += 1;
            continue;
        }
        if !seen.insert(id) {
            skipped += 1;
            continue;
        }
        films.push(film_from_box_office(row, details.get(id).copied(), precedence));
    }

    let with_detail = films
        .iter()
        .filter(|f| details.contains_key(f.release_id().as_str()))
        .count();
    info!(
        index_rows = index.len(),
        films = films.len(),
        skipped,
        with_detail,
        "box office tables joined"
    );
    films
}

/// Left join of the review table onto the merged box-office rows.
pub fn merge_reviews(
    mut films: Vec<FilmRecord>,
    reviews: &[ReviewRecord],
    precedence: &PrecedenceConfig,
) -> Vec<FilmRecord> {
    let reviews = first_row_per_id(reviews, "rt_scores", |r| r.bom_release_id.as_str());
    let mut joined = 0usize;

    for film in &mut films {
        let review = reviews.get(film.release_id().as_str()).copied();
        if let Some(review) = review {
            joined += 1;
            film.critic_score = review.tomatometer;
            film.audience_score = review.audience_score;
            film.critic_count = review.critic_count;
            film.audience_count = review.audience_count;
            film.review_genres = split_list(review.rt_genres.as_deref());
            film.review_url = review.rt_url.clone();
            film.review_title = review.rt_title.clone();
            let method = review.match_method.as_deref().and_then(|raw| {
                let method = ReviewMatchMethod::parse(raw);
                if method.is_none() {
                    warn!(release_id = %film.release_id(), method = raw, "unknown review match method");
                }
                method
            });
            film.review_match_method = method;
        }

        let detail_rating = match film.mpaa_rating.source {
            Some(SourceId::BoxOfficeDetail) => film.mpaa_rating.value.clone(),
            _ => None,
        };
        film.mpaa_rating = resolve(precedence.order(ResolvedField::MpaaRating), |source| match source {
            SourceId::BoxOfficeDetail => detail_rating.clone(),
            SourceId::ReviewAggregator => review.and_then(|r| r.rt_rating.clone()),
            _ => None,
        });
    }

    info!(films = films.len(), joined, "review table joined");
    films
}

/// Fuzzy-matches every film against the budget pool.
///
/// The best candidate's title and score are always recorded. Its budget is
/// copied when the configured attachment rule allows the match status.
pub fn match_budgets(
    mut films: Vec<FilmRecord>,
    pool: &[BudgetCandidate],
    config: &MatchConfig,
) -> Vec<FilmRecord> {
    let matcher = TitleMatcher::new(pool, config);
    for film in &mut films {
        let outcome = matcher.best_match(&film.title, film.release_year());
        let attach = config.attach_budgets.allows(outcome.status);
        if let Some(candidate) = outcome.candidate.filter(|_| attach) {
            film.production_budget = candidate.production_budget;
            film.budget_source_gross = candidate.domestic_gross;
        }
        film.budget_match = outcome.to_budget_match();
    }

    let tally = status_counts(&films);
    info!(
        films = films.len(),
        pool = pool.len(),
        matched = tally.get("matched").copied().unwrap_or(0),
        review = tally.get("review").copied().unwrap_or(0),
        unmatched = tally.get("unmatched").copied().unwrap_or(0),
        "budget matching finished"
    );
    films
}

fn status_counts(films: &[FilmRecord]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for film in films {
        *counts.entry(film.budget_match.status.to_string()).or_default() += 1;
    }
    counts
}

fn method_counts(films: &[FilmRecord]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for film in films {
        let key = film
            .review_match_method
            .map(|m| m.as_str())
            .unwrap_or("missing");
        *counts.entry(key.to_string()).or_default() += 1;
    }
    counts
}

/// Final, read-only analysis table.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisTable {
    films: Vec<FilmRecord>,
}

impl AnalysisTable {
    pub fn films(&self) -> &[FilmRecord] {
        &self.films
    }

    pub fn len(&self) -> usize {
        self.films.len()
    }

    pub fn is_empty(&self) -> bool {
        self.films.is_empty()
    }

    /// Films a human should check, in table order.
    pub fn needing_review(&self) -> impl Iterator<Item = &FilmRecord> {
        self.films.iter().filter(|f| f.needs_review())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageCount {
    pub stage: PipelineStage,
    pub rows: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InputRowCounts {
    pub index: usize,
    pub details: usize,
    pub reviews: usize,
    pub budgets: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub input_rows: InputRowCounts,
    pub stages: Vec<StageCount>,
    pub filters: Vec<FilterOutcome>,
    pub budget_match_status: BTreeMap<String, usize>,
    pub review_match_method: BTreeMap<String, usize>,
    pub needs_review: usize,
}

struct StageLog {
    current: PipelineStage,
    counts: Vec<StageCount>,
}

impl StageLog {
    fn start(rows: usize) -> Self {
        let stage = PipelineStage::RawLoaded;
        info!(%stage, rows, "merge stage complete");
        Self {
            current: stage,
            counts: vec![StageCount { stage, rows }],
        }
    }

    fn advance(&mut self, stage: PipelineStage, rows: usize) {
        debug_assert_eq!(self.current.next(), Some(stage), "stages run in order");
        let dropped = self.counts.last().map_or(0, |c| c.rows.saturating_sub(rows));
        info!(%stage, rows, dropped, "merge stage complete");
        self.current = stage;
        self.counts.push(StageCount { stage, rows });
    }
}

pub struct MergeOutcome {
    pub table: AnalysisTable,
    pub report: MergeReport,
}

pub struct MergeEngine<'a> {
    study: &'a StudyConfig,
}

impl<'a> MergeEngine<'a> {
    pub fn new(study: &'a StudyConfig) -> Self {
        Self { study }
    }

    /// One full batch pass over the raw tables. Deterministic for a given input.
    pub fn run(&self, raw: &RawTables) -> MergeOutcome {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let precedence = &self.study.precedence;
        let mut stages = StageLog::start(raw.index.len());

        let films = merge_box_office(&raw.index, &raw.details, precedence);
        stages.advance(PipelineStage::BomMerged, films.len());

        let films = merge_reviews(films, &raw.reviews, precedence);
        stages.advance(PipelineStage::ReviewMerged, films.len());

        let pool: Vec<BudgetCandidate> = raw.budgets.iter().map(BudgetCandidate::from_record).collect();
        let films = match_budgets(films, &pool, &self.study.matching);
        stages.advance(PipelineStage::BudgetMatched, films.len());

        let (films, filters) = apply_filters(films, self.study);
        stages.advance(PipelineStage::Filtered, films.len());

        let films = construct_variables(films, self.study);
        stages.advance(PipelineStage::VariablesConstructed, films.len());

        let table = AnalysisTable { films };
        stages.advance(PipelineStage::Finalized, table.len());

        let report = MergeReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            input_rows: InputRowCounts {
                index: raw.index.len(),
                details: raw.details.len(),
                reviews: raw.reviews.len(),
                budgets: raw.budgets.len(),
            },
            stages: stages.counts,
            filters,
            budget_match_status: status_counts(table.films()),
            review_match_method: method_counts(table.films()),
            needs_review: table.needing_review().count(),
        };
        MergeOutcome { table, report }
    }
}
