//! Analysis artifacts written at the end of a merge run. Each run overwrites
//! the previous files.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, Float64Array, Int32Array, Int64Array, RecordBatch, StringArray, UInt8Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::NaiveDate;
use frdd_core::{FilmRecord, MatchStatus, ReviewMatchMethod, SourceId};
use frdd_storage::write_csv_table;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::engine::{AnalysisTable, MergeReport};

pub const ANALYSIS_FILE: &str = "merged_dataset.csv";
pub const DIAGNOSTICS_FILE: &str = "match_diagnostics.csv";
pub const REPORT_FILE: &str = "merge_report.json";
pub const SNAPSHOT_DIR: &str = "snapshots";
pub const PARQUET_FILE: &str = "merged_dataset.parquet";
pub const MANIFEST_FILE: &str = "manifest.json";

/// Flat row of the analysis table, one per film.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRow {
    pub bom_release_id: String,
    pub title: String,
    pub release_date: Option<NaiveDate>,
    pub release_year: Option<i32>,
    pub release_month: Option<u32>,
    pub distributor: Option<String>,
    pub mpaa_rating: Option<String>,
    pub genres: Option<String>,
    pub rt_genres: Option<String>,
    pub opening_wknd_gross: Option<i64>,
    pub opening_wknd_theaters: Option<i64>,
    pub domestic_gross: Option<i64>,
    pub widest_release: Option<i64>,
    pub max_theaters: Option<i64>,
    pub production_budget: Option<i64>,
    pub tomatometer: Option<i32>,
    pub audience_score: Option<i32>,
    pub critic_count: Option<i64>,
    pub audience_count: Option<i64>,
    pub is_fresh_critic: Option<u8>,
    pub is_fresh_audience: Option<u8>,
    pub tomatometer_centered: Option<i32>,
    pub audience_score_centered: Option<i32>,
    pub log_opening_gross: Option<f64>,
    pub log_total_gross: Option<f64>,
    pub log_theaters: Option<f64>,
    pub log_budget: Option<f64>,
    pub in_progress: bool,
    pub match_method: Option<ReviewMatchMethod>,
    pub rt_url: Option<String>,
    pub tn_title_matched: Option<String>,
    pub tn_match_score: f64,
    pub tn_match_status: MatchStatus,
    pub tn_domestic_gross: Option<i64>,
    pub domestic_gross_source: Option<SourceId>,
    pub distributor_source: Option<SourceId>,
    pub release_date_source: Option<SourceId>,
    pub mpaa_rating_source: Option<SourceId>,
}

fn joined(items: &[String]) -> Option<String> {
    if items.is_empty() {
        None
    } else {
        Some(items.join(", "))
    }
}

impl AnalysisRow {
    pub fn from_film(film: &FilmRecord) -> Self {
        let derived = film.derived.clone().unwrap_or_default();
        Self {
            bom_release_id: film.release_id().to_string(),
            title: film.title.clone(),
            release_date: film.release_date.value,
            release_year: derived.release_year,
            release_month: derived.release_month,
            distributor: film.distributor.value.clone(),
            mpaa_rating: film.mpaa_rating.value.clone(),
            genres: joined(&film.genres),
            rt_genres: joined(&film.review_genres),
            opening_wknd_gross: film.opening_gross,
            opening_wknd_theaters: film.opening_theaters,
            domestic_gross: film.domestic_gross.value,
            widest_release: film.widest_release,
            max_theaters: film.max_theaters,
            production_budget: film.production_budget,
            tomatometer: film.critic_score,
            audience_score: film.audience_score,
            critic_count: film.critic_count,
            audience_count: film.audience_count,
            is_fresh_critic: derived.is_fresh_critic,
            is_fresh_audience: derived.is_fresh_audience,
            tomatometer_centered: derived.critic_centered,
            audience_score_centered: derived.audience_centered,
            log_opening_gross: derived.log_opening_gross,
            log_total_gross: derived.log_total_gross,
            log_theaters: derived.log_theaters,
            log_budget: derived.log_budget,
            in_progress: derived.in_progress,
            match_method: film.review_match_method,
            rt_url: film.review_url.clone(),
            tn_title_matched: film.budget_match.matched_title.clone(),
            tn_match_score: film.budget_match.score,
            tn_match_status: film.budget_match.status,
            tn_domestic_gross: film.budget_source_gross,
            domestic_gross_source: film.domestic_gross.source,
            distributor_source: film.distributor.source,
            release_date_source: film.release_date.source,
            mpaa_rating_source: film.mpaa_rating.source,
        }
    }
}

/// One audit row per film; `needs_review` marks the ones to look at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsRow {
    pub bom_release_id: String,
    pub title: String,
    pub release_year: Option<i32>,
    pub tomatometer: Option<i32>,
    pub audience_score: Option<i32>,
    pub match_method: Option<ReviewMatchMethod>,
    pub rt_url: Option<String>,
    pub rt_title: Option<String>,
    pub tn_title_matched: Option<String>,
    pub tn_match_score: f64,
    pub tn_match_status: MatchStatus,
    pub production_budget: Option<i64>,
    pub needs_review: bool,
}

impl DiagnosticsRow {
    pub fn from_film(film: &FilmRecord) -> Self {
        Self {
            bom_release_id: film.release_id().to_string(),
            title: film.title.clone(),
            release_year: film.release_year(),
            tomatometer: film.critic_score,
            audience_score: film.audience_score,
            match_method: film.review_match_method,
            rt_url: film.review_url.clone(),
            rt_title: film.review_title.clone(),
            tn_title_matched: film.budget_match.matched_title.clone(),
            tn_match_score: film.budget_match.score,
            tn_match_status: film.budget_match.status,
            production_budget: film.production_budget,
            needs_review: film.needs_review(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Where a merge run left its files.
#[derive(Debug, Clone, Serialize)]
pub struct OutputPaths {
    pub analysis: PathBuf,
    pub diagnostics: PathBuf,
    pub parquet_manifest: PathBuf,
    pub report: PathBuf,
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

pub fn write_analysis_parquet(path: &Path, rows: &[AnalysisRow]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("bom_release_id", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("release_date", DataType::Utf8, true),
        ArrowField::new("release_year", DataType::Int32, true),
        ArrowField::new("distributor", DataType::Utf8, true),
        ArrowField::new("mpaa_rating", DataType::Utf8, true),
        ArrowField::new("opening_wknd_gross", DataType::Int64, true),
        ArrowField::new("opening_wknd_theaters", DataType::Int64, true),
        ArrowField::new("domestic_gross", DataType::Int64, true),
        ArrowField::new("production_budget", DataType::Int64, true),
        ArrowField::new("tomatometer", DataType::Int32, true),
        ArrowField::new("audience_score", DataType::Int32, true),
        ArrowField::new("is_fresh_critic", DataType::UInt8, true),
        ArrowField::new("is_fresh_audience", DataType::UInt8, true),
        ArrowField::new("tomatometer_centered", DataType::Int32, true),
        ArrowField::new("audience_score_centered", DataType::Int32, true),
        ArrowField::new("log_opening_gross", DataType::Float64, true),
        ArrowField::new("log_total_gross", DataType::Float64, true),
        ArrowField::new("log_theaters", DataType::Float64, true),
        ArrowField::new("log_budget", DataType::Float64, true),
        ArrowField::new("in_progress", DataType::Boolean, false),
        ArrowField::new("match_method", DataType::Utf8, true),
        ArrowField::new("rt_url", DataType::Utf8, true),
        ArrowField::new("tn_match_score", DataType::Float64, false),
        ArrowField::new("tn_match_status", DataType::Utf8, false),
    ]));

    let release_dates: Vec<Option<String>> = rows
        .iter()
        .map(|r| r.release_date.map(|d| d.to_string()))
        .collect();

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(
                rows.iter().map(|r| r.bom_release_id.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(rows.iter().map(|r| r.title.as_str()).collect::<Vec<_>>())),
            Arc::new(StringArray::from(
                release_dates.iter().map(|d| d.as_deref()).collect::<Vec<_>>(),
            )),
            Arc::new(Int32Array::from(rows.iter().map(|r| r.release_year).collect::<Vec<_>>())),
            Arc::new(StringArray::from(
                rows.iter().map(|r| r.distributor.as_deref()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter().map(|r| r.mpaa_rating.as_deref()).collect::<Vec<_>>(),
            )),
            Arc::new(Int64Array::from(rows.iter().map(|r| r.opening_wknd_gross).collect::<Vec<_>>())),
            Arc::new(Int64Array::from(
                rows.iter().map(|r| r.opening_wknd_theaters).collect::<Vec<_>>(),
            )),
            Arc::new(Int64Array::from(rows.iter().map(|r| r.domestic_gross).collect::<Vec<_>>())),
            Arc::new(Int64Array::from(rows.iter().map(|r| r.production_budget).collect::<Vec<_>>())),
            Arc::new(Int32Array::from(rows.iter().map(|r| r.tomatometer).collect::<Vec<_>>())),
            Arc::new(Int32Array::from(rows.iter().map(|r| r.audience_score).collect::<Vec<_>>())),
            Arc::new(UInt8Array::from(rows.iter().map(|r| r.is_fresh_critic).collect::<Vec<_>>())),
            Arc::new(UInt8Array::from(rows.iter().map(|r| r.is_fresh_audience).collect::<Vec<_>>())),
            Arc::new(Int32Array::from(
                rows.iter().map(|r| r.tomatometer_centered).collect::<Vec<_>>(),
            )),
            Arc::new(Int32Array::from(
                rows.iter().map(|r| r.audience_score_centered).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(rows.iter().map(|r| r.log_opening_gross).collect::<Vec<_>>())),
            Arc::new(Float64Array::from(rows.iter().map(|r| r.log_total_gross).collect::<Vec<_>>())),
            Arc::new(Float64Array::from(rows.iter().map(|r| r.log_theaters).collect::<Vec<_>>())),
            Arc::new(Float64Array::from(rows.iter().map(|r| r.log_budget).collect::<Vec<_>>())),
            Arc::new(BooleanArray::from(rows.iter().map(|r| r.in_progress).collect::<Vec<_>>())),
            Arc::new(StringArray::from(
                rows.iter()
                    .map(|r| r.match_method.map(|m| m.as_str()))
                    .collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(rows.iter().map(|r| r.rt_url.as_deref()).collect::<Vec<_>>())),
            Arc::new(Float64Array::from(rows.iter().map(|r| r.tn_match_score).collect::<Vec<_>>())),
            Arc::new(StringArray::from(
                rows.iter().map(|r| r.tn_match_status.as_str()).collect::<Vec<_>>(),
            )),
        ],
    )
    .context("building analysis record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, root: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let sha256 = hex::encode(Sha256::digest(&bytes));
    let rel = path.strip_prefix(root).unwrap_or(path).display().to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

/// Writes the analysis table, diagnostics, parquet snapshot and run report.
pub fn write_outputs(processed_dir: &Path, table: &AnalysisTable, report: &MergeReport) -> Result<OutputPaths> {
    fs::create_dir_all(processed_dir)
        .with_context(|| format!("creating {}", processed_dir.display()))?;

    let rows: Vec<AnalysisRow> = table.films().iter().map(AnalysisRow::from_film).collect();
    let analysis = processed_dir.join(ANALYSIS_FILE);
    write_csv_table(&analysis, &rows)?;

    let diagnostics_rows: Vec<DiagnosticsRow> = table.films().iter().map(DiagnosticsRow::from_film).collect();
    let diagnostics = processed_dir.join(DIAGNOSTICS_FILE);
    write_csv_table(&diagnostics, &diagnostics_rows)?;

    let snapshot_dir = processed_dir.join(SNAPSHOT_DIR);
    fs::create_dir_all(&snapshot_dir).with_context(|| format!("creating {}", snapshot_dir.display()))?;
    let parquet_path = snapshot_dir.join(PARQUET_FILE);
    write_analysis_parquet(&parquet_path, &rows)?;
    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![manifest_entry("merged_dataset", processed_dir, &parquet_path)?],
    };
    let parquet_manifest = snapshot_dir.join(MANIFEST_FILE);
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&parquet_manifest, bytes).with_context(|| format!("writing {}", parquet_manifest.display()))?;

    let report_path = processed_dir.join(REPORT_FILE);
    let bytes = serde_json::to_vec_pretty(report).context("serializing merge report")?;
    fs::write(&report_path, bytes).with_context(|| format!("writing {}", report_path.display()))?;

    info!(
        rows = rows.len(),
        needs_review = report.needs_review,
        dir = %processed_dir.display(),
        "merge outputs written"
    );
    Ok(OutputPaths {
        analysis,
        diagnostics,
        parquet_manifest,
        report: report_path,
    })
}
