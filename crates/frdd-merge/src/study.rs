use chrono::{Datelike, Days, NaiveDate};
use frdd_core::{DerivedVariables, FilmRecord};
use serde::Serialize;
use tracing::info;

use crate::config::StudyConfig;

/// Row counts around one inclusion filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilterOutcome {
    pub filter: &'static str,
    pub before: usize,
    pub after: usize,
    pub dropped: usize,
}

fn apply_filter(
    films: Vec<FilmRecord>,
    filter: &'static str,
    keep: impl Fn(&FilmRecord) -> bool,
) -> (Vec<FilmRecord>, FilterOutcome) {
    let before = films.len();
    let kept: Vec<FilmRecord> = films.into_iter().filter(|film| keep(film)).collect();
    let outcome = FilterOutcome {
        filter,
        before,
        after: kept.len(),
        dropped: before - kept.len(),
    };
    info!(filter, before, after = outcome.after, dropped = outcome.dropped, "study filter applied");
    (kept, outcome)
}

/// Date window first, then minimum opening theaters. Unknown values fail both.
pub fn apply_filters(films: Vec<FilmRecord>, study: &StudyConfig) -> (Vec<FilmRecord>, Vec<FilterOutcome>) {
    let (films, by_date) = apply_filter(films, "release_date_window", |film| {
        film.release_date
            .get()
            .is_some_and(|date| (study.start_date..=study.end_date).contains(date))
    });
    let (films, by_theaters) = apply_filter(films, "min_opening_theaters", |film| {
        film.opening_theaters
            .is_some_and(|theaters| theaters >= study.min_opening_theaters)
    });
    (films, vec![by_date, by_theaters])
}

/// Natural log with the input floored at 1.
fn floored_ln(value: Option<i64>) -> Option<f64> {
    value.map(|v| (v.max(1) as f64).ln())
}

fn treatment(score: Option<i32>, cutoff: i32) -> Option<u8> {
    score.map(|s| u8::from(s >= cutoff))
}

/// First release date that counts as still in theaters at the end of the study.
pub fn in_progress_threshold(study: &StudyConfig) -> NaiveDate {
    let window = Days::new(study.in_progress_window_days.max(0).unsigned_abs());
    study
        .end_date
        .checked_sub_days(window)
        .unwrap_or(NaiveDate::MIN)
}

pub fn derive_variables(film: &FilmRecord, study: &StudyConfig) -> DerivedVariables {
    let cutoff = study.fresh_cutoff;
    let release_date = film.release_date.get();
    let in_progress_from = in_progress_threshold(study);

    DerivedVariables {
        critic_centered: film.critic_score.map(|s| s - cutoff),
        audience_centered: film.audience_score.map(|s| s - cutoff),
        is_fresh_critic: treatment(film.critic_score, cutoff),
        is_fresh_audience: treatment(film.audience_score, cutoff),
        log_opening_gross: floored_ln(film.opening_gross),
        log_total_gross: floored_ln(film.domestic_gross.value),
        log_theaters: floored_ln(film.opening_theaters),
        // No budget and a zero budget are different things; neither gets a log.
        log_budget: film
            .production_budget
            .filter(|budget| *budget > 0)
            .map(|budget| (budget as f64).ln()),
        release_year: release_date.map(|d| d.year()),
        release_month: release_date.map(|d| d.month()),
        in_progress: release_date.is_some_and(|d| *d >= in_progress_from),
    }
}

pub fn construct_variables(mut films: Vec<FilmRecord>, study: &StudyConfig) -> Vec<FilmRecord> {
    for film in &mut films {
        film.derived = Some(derive_variables(film, study));
    }
    let in_progress = films
        .iter()
        .filter(|f| f.derived.as_ref().is_some_and(|d| d.in_progress))
        .count();
    info!(rows = films.len(), in_progress, "analysis variables constructed");
    films
}
