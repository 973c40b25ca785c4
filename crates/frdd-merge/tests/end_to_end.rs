use std::fs;
use std::path::Path;

use frdd_core::{MatchStatus, PipelineStage, ReviewMatchMethod};
use frdd_merge::{
    run_estimation, run_merge, AnalysisRow, DiagnosticsRow, MergeError, ParametricRdd, StudyConfig,
    ANALYSIS_FILE, DIAGNOSTICS_FILE, RDD_RESULTS_FILE,
};
use frdd_storage::read_csv_table;
use tempfile::tempdir;

const INDEX_HEADER: &str = "bom_release_id,title,gross,total_gross,max_theaters,release_date_raw,bom_year,distributor,release_url";
const DETAIL_HEADER: &str = "bom_release_id,title,opening_wknd_gross,opening_wknd_theaters,widest_release,domestic_gross,mpaa_rating,genres,release_date,distributor";
const REVIEW_HEADER: &str = "bom_release_id,title_searched,rt_url,tomatometer,audience_score,critic_count,audience_count,rt_genres,rt_rating,match_method,rt_title";
const BUDGET_HEADER: &str = "tn_rank,title,release_date,release_year,production_budget,domestic_gross,worldwide_gross";

fn write_table(dir: &Path, name: &str, header: &str, rows: &[String]) {
    let mut body = String::from(header);
    body.push('\n');
    for row in rows {
        body.push_str(row);
        body.push('\n');
    }
    fs::write(dir.join(name), body).expect("write table");
}

/// Three releases with 700, 500 and unknown opening theaters.
fn write_three_film_fixture(raw: &Path) {
    fs::create_dir_all(raw).expect("raw dir");
    write_table(
        raw,
        "bom_index.csv",
        INDEX_HEADER,
        &[
            "A,Alpha Story,,90000000,3500,Jun 14,2024,Studio A,https://bom.test/release/A/".into(),
            "B,Beta Story,,50000000,2500,Jul 4,2024,Studio B,https://bom.test/release/B/".into(),
            "C,Gamma Story,,1000000,400,Aug 2,2024,Studio C,https://bom.test/release/C/".into(),
        ],
    );
    write_table(
        raw,
        "bom_details.csv",
        DETAIL_HEADER,
        &[
            "A,Alpha Story,30000000,700,3500,95000000,PG-13,\"Drama, Comedy\",\"Jun 14, 2024\",".into(),
            "B,Beta Story,12000000,500,2500,,,Horror,,".into(),
            "C,Gamma Story,,,,,,,,".into(),
        ],
    );
    write_table(
        raw,
        "rt_scores.csv",
        REVIEW_HEADER,
        &[
            "A,Alpha Story,https://rt.test/m/alpha_story,60,72,150,5000,Drama,R,direct_url,Alpha Story".into(),
            "B,Beta Story,,,,,,,,unmatched,".into(),
        ],
    );
    write_table(
        raw,
        "the_numbers_budgets.csv",
        BUDGET_HEADER,
        &[
            "1,Alpha Story,2024-06-14,2024,40000000,95000000,180000000".into(),
            "2,Gamma,2024-08-02,2024,5000000,1000000,2000000".into(),
        ],
    );
}

#[test]
fn theater_floor_keeps_only_the_wide_release() {
    let dir = tempdir().expect("tempdir");
    let raw = dir.path().join("raw");
    let processed = dir.path().join("processed");
    write_three_film_fixture(&raw);

    let report = run_merge(&raw, &processed, &StudyConfig::default()).expect("merge");

    let rows: Vec<AnalysisRow> = read_csv_table(&processed.join(ANALYSIS_FILE)).expect("analysis");
    let ids: Vec<&str> = rows.iter().map(|r| r.bom_release_id.as_str()).collect();
    assert_eq!(ids, vec!["A"]);

    let stage_rows: Vec<(PipelineStage, usize)> = report.stages.iter().map(|s| (s.stage, s.rows)).collect();
    assert_eq!(stage_rows[0], (PipelineStage::RawLoaded, 3));
    assert_eq!(stage_rows[3], (PipelineStage::BudgetMatched, 3));
    assert_eq!(stage_rows[6], (PipelineStage::Finalized, 1));
    assert_eq!(report.filters[0].dropped, 0);
    assert_eq!(report.filters[1].before, 3);
    assert_eq!(report.filters[1].dropped, 2);

    assert!(processed.join("snapshots/merged_dataset.parquet").exists());
    let manifest: serde_json::Value =
        serde_json::from_slice(&fs::read(processed.join("snapshots/manifest.json")).expect("manifest"))
            .expect("manifest json");
    assert_eq!(manifest["files"][0]["path"], "snapshots/merged_dataset.parquet");
    assert_eq!(manifest["files"][0]["sha256"].as_str().map(str::len), Some(64));
    assert!(processed.join("merge_report.json").exists());
}

#[test]
fn score_at_the_cutoff_is_treated_with_zero_distance() {
    let dir = tempdir().expect("tempdir");
    let raw = dir.path().join("raw");
    let processed = dir.path().join("processed");
    write_three_film_fixture(&raw);

    run_merge(&raw, &processed, &StudyConfig::default()).expect("merge");
    let rows: Vec<AnalysisRow> = read_csv_table(&processed.join(ANALYSIS_FILE)).expect("analysis");
    let alpha = &rows[0];

    assert_eq!(alpha.tomatometer, Some(60));
    assert_eq!(alpha.tomatometer_centered, Some(0));
    assert_eq!(alpha.is_fresh_critic, Some(1));
    assert_eq!(alpha.audience_score_centered, Some(12));
    assert_eq!(alpha.domestic_gross, Some(95_000_000));
    assert_eq!(alpha.distributor.as_deref(), Some("Studio A"));
    assert_eq!(alpha.mpaa_rating.as_deref(), Some("PG-13"));
    assert_eq!(alpha.genres.as_deref(), Some("Drama, Comedy"));
    assert_eq!(alpha.production_budget, Some(40_000_000));
    assert_eq!(alpha.tn_match_status, MatchStatus::Matched);
    assert_eq!(alpha.match_method, Some(ReviewMatchMethod::DirectUrl));
    assert_eq!(alpha.rt_url.as_deref(), Some("https://rt.test/m/alpha_story"));
    assert!(alpha.log_budget.is_some());
    assert!(!alpha.in_progress);
}

#[test]
fn rerunning_the_merge_reproduces_the_same_tables() {
    let dir = tempdir().expect("tempdir");
    let raw = dir.path().join("raw");
    let processed = dir.path().join("processed");
    write_three_film_fixture(&raw);

    run_merge(&raw, &processed, &StudyConfig::default()).expect("first run");
    let analysis = fs::read(processed.join(ANALYSIS_FILE)).expect("analysis");
    let diagnostics = fs::read(processed.join(DIAGNOSTICS_FILE)).expect("diagnostics");

    run_merge(&raw, &processed, &StudyConfig::default()).expect("second run");
    assert_eq!(fs::read(processed.join(ANALYSIS_FILE)).expect("analysis"), analysis);
    assert_eq!(fs::read(processed.join(DIAGNOSTICS_FILE)).expect("diagnostics"), diagnostics);
}

#[test]
fn diagnostics_surface_unmatched_review_pages() {
    let dir = tempdir().expect("tempdir");
    let raw = dir.path().join("raw");
    let processed = dir.path().join("processed");
    write_three_film_fixture(&raw);

    let study = StudyConfig {
        min_opening_theaters: 0,
        ..StudyConfig::default()
    };
    let report = run_merge(&raw, &processed, &study).expect("merge");
    let rows: Vec<DiagnosticsRow> = read_csv_table(&processed.join(DIAGNOSTICS_FILE)).expect("diagnostics");

    // C has no theater count at all, so only A and B survive.
    assert_eq!(rows.len(), 2);
    let beta = rows.iter().find(|r| r.bom_release_id == "B").expect("B");
    assert_eq!(beta.match_method, Some(ReviewMatchMethod::Unmatched));
    assert!(beta.needs_review);
    assert_eq!(beta.release_year, Some(2024));
    assert_eq!(report.needs_review, 1);
}

#[test]
fn missing_columns_stop_the_run_before_any_output() {
    let dir = tempdir().expect("tempdir");
    let raw = dir.path().join("raw");
    let processed = dir.path().join("processed");
    write_three_film_fixture(&raw);
    write_table(&raw, "rt_scores.csv", "bom_release_id,title_searched", &["A,Alpha Story".into()]);

    let err = run_merge(&raw, &processed, &StudyConfig::default()).expect_err("schema error");
    match err.downcast_ref::<MergeError>() {
        Some(MergeError::MissingColumns { table, columns }) => {
            assert_eq!(*table, "rt_scores.csv");
            assert_eq!(columns, &vec!["tomatometer", "audience_score", "match_method"]);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(!processed.join(ANALYSIS_FILE).exists());
}

#[test]
fn estimation_runs_every_specification_on_the_written_table() {
    let dir = tempdir().expect("tempdir");
    let raw = dir.path().join("raw");
    let processed = dir.path().join("processed");
    fs::create_dir_all(&raw).expect("raw dir");

    let mut index = Vec::new();
    let mut details = Vec::new();
    let mut reviews = Vec::new();
    let mut budgets = Vec::new();
    for i in 0..40i64 {
        let id = format!("rl{i}");
        let title = format!("Feature Number {i}");
        let score = 40 + i;
        let opening = 5_000_000 + i * 100_000 + if score >= 60 { 2_000_000 } else { 0 } + (i % 3) * 50_000;
        index.push(format!("{id},{title},,{},3000,Jun 14,2024,Studio,", opening * 3));
        details.push(format!(
            "{id},{title},{opening},{},3000,{},PG,Drama,\"Jun 14, 2024\",Studio",
            1000 + i * 10,
            opening * 3
        ));
        reviews.push(format!("{id},{title},,{score},{},10,10,,,direct_url,{title}", 90 - i));
        budgets.push(format!("{},{title},2024-06-14,2024,{},,", i + 1, 20_000_000 + (i % 5) * 1_000_000));
    }
    write_table(&raw, "bom_index.csv", INDEX_HEADER, &index);
    write_table(&raw, "bom_details.csv", DETAIL_HEADER, &details);
    write_table(&raw, "rt_scores.csv", REVIEW_HEADER, &reviews);
    write_table(&raw, "the_numbers_budgets.csv", BUDGET_HEADER, &budgets);

    run_merge(&raw, &processed, &StudyConfig::default()).expect("merge");
    let results = run_estimation(&processed, &[1, 2], &ParametricRdd).expect("estimate");

    assert_eq!(results.len(), 16);
    assert!(processed.join(RDD_RESULTS_FILE).exists());
    assert!(results.iter().all(|r| r.n == 40));
    let critic_opening = results
        .iter()
        .find(|r| r.outcome.as_str() == "log_opening_gross" && r.polynomial_order == 1 && !r.controls)
        .expect("critic opening");
    assert!(critic_opening.coef.is_some_and(|c| c > 0.0));
}
