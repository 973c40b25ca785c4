//! Merge pipeline: raw source tables in, analysis table and diagnostics out.

pub mod config;
pub mod engine;
pub mod matcher;
pub mod output;
pub mod rdd;
pub mod study;
pub mod tables;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use frdd_storage::{read_csv_table, write_csv_table};
use thiserror::Error;
use tracing::{info, info_span};

pub use config::{
    BudgetAttachment, MatchConfig, PipelineConfig, PrecedenceConfig, ResolvedField, SimilarityMeasure, StudyConfig,
};
pub use engine::{
    match_budgets, merge_box_office, merge_reviews, resolve, AnalysisTable, MergeEngine, MergeOutcome,
    MergeReport, StageCount,
};
pub use matcher::{classify, match_title, normalize_title, token_sort_ratio, BudgetCandidate, MatchCandidate, TitleMatcher};
pub use output::{write_outputs, AnalysisRow, DiagnosticsRow, OutputPaths, ANALYSIS_FILE, DIAGNOSTICS_FILE};
pub use rdd::{
    build_sample, run_specifications, Estimate, Estimator, ParametricRdd, RddOutcome, RddResultRow, RddSample,
    RddSpecification,
};
pub use study::{apply_filters, construct_variables, derive_variables, FilterOutcome};
pub use tables::{InputTable, RawTables};

pub const CRATE_NAME: &str = "frdd-merge";
pub const RDD_RESULTS_FILE: &str = "rdd_results.csv";

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("input table {table} not found at {}", path.display())]
    MissingInput { table: &'static str, path: PathBuf },
    #[error("input table {table} is missing required columns: {}", columns.join(", "))]
    MissingColumns {
        table: &'static str,
        columns: Vec<String>,
    },
    #[error("invalid study config: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),
    #[error("reading {}: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("estimation failed: {0}")]
    Estimation(String),
}

/// Loads the raw tables, runs every stage and writes the outputs.
pub fn run_merge(raw_dir: &Path, processed_dir: &Path, study: &StudyConfig) -> Result<MergeReport> {
    let span = info_span!("merge", raw = %raw_dir.display());
    let _guard = span.enter();

    study.validate()?;
    let raw = RawTables::load(raw_dir)?;
    let MergeOutcome { table, report } = MergeEngine::new(study).run(&raw);
    let paths = write_outputs(processed_dir, &table, &report)?;
    info!(
        run_id = %report.run_id,
        rows = table.len(),
        analysis = %paths.analysis.display(),
        diagnostics = %paths.diagnostics.display(),
        "merge finished"
    );
    Ok(report)
}

pub fn run_merge_from_env() -> Result<MergeReport> {
    let config = PipelineConfig::from_env();
    let study = StudyConfig::load(&config.study_config)
        .with_context(|| format!("loading {}", config.study_config.display()))?;
    run_merge(&config.raw_dir(), &config.processed_dir(), &study)
}

/// Fits every RDD specification on a written analysis table.
pub fn run_estimation(processed_dir: &Path, orders: &[u8], estimator: &dyn Estimator) -> Result<Vec<RddResultRow>> {
    let analysis = processed_dir.join(ANALYSIS_FILE);
    if !analysis.exists() {
        return Err(MergeError::MissingInput {
            table: ANALYSIS_FILE,
            path: analysis,
        }
        .into());
    }
    let rows: Vec<AnalysisRow> = read_csv_table(&analysis)?;
    let results = run_specifications(&rows, &RddSpecification::grid(orders), estimator);

    let out = processed_dir.join(RDD_RESULTS_FILE);
    write_csv_table(&out, &results)?;
    info!(
        specifications = results.len(),
        failed = results.iter().filter(|r| r.error.is_some()).count(),
        path = %out.display(),
        "rdd results written"
    );
    Ok(results)
}
