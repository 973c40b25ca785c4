use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use frdd_core::SourceId;
use frdd_extract::{
    collect_budgets, collect_details, collect_index, collect_reviews, politeness_interval,
    rescrape_missing_reviews, CollectSummary, DetailRow, IndexRow, ReviewTarget, SourceEndpoints,
    DETAIL_CHECKPOINT_EVERY, REVIEW_CHECKPOINT_EVERY,
};
use frdd_merge::{run_estimation, run_merge, InputTable, ParametricRdd, PipelineConfig, StudyConfig};
use frdd_storage::{read_csv_table, HttpClientConfig, HttpFetcher, PageArchive};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "frdd")]
#[command(about = "Fresh-rating discontinuity dataset pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Merge the raw tables into the analysis dataset.
    Merge,
    /// Collect the yearly box-office listing pages.
    CollectIndex {
        /// Listing years; defaults to the study config.
        #[arg(long, value_delimiter = ',')]
        years: Vec<i32>,
    },
    /// Collect one box-office detail page per listed release.
    CollectDetails {
        #[arg(long, default_value_t = DETAIL_CHECKPOINT_EVERY)]
        checkpoint_every: usize,
    },
    /// Locate and collect review pages.
    CollectReviews {
        #[arg(long, default_value_t = REVIEW_CHECKPOINT_EVERY)]
        checkpoint_every: usize,
        /// Search by listing rows even when the detail table exists.
        #[arg(long)]
        from_index: bool,
        /// Revisit located pages that had no scores instead of collecting new ones.
        #[arg(long)]
        rescrape_missing: bool,
    },
    /// Collect the paginated budget table.
    CollectBudgets,
    /// Fit the RDD specifications on the merged dataset.
    Estimate {
        #[arg(long, value_delimiter = ',', default_value = "1,2")]
        orders: Vec<u8>,
    },
    /// Write the default study config.
    InitConfig {
        #[arg(long)]
        path: Option<PathBuf>,
        #[arg(long)]
        force: bool,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

fn fetcher_for(config: &PipelineConfig, source: SourceId) -> Result<HttpFetcher> {
    HttpFetcher::new(HttpClientConfig {
        timeout: config.http_timeout(),
        user_agents: config.user_agents.clone(),
        min_interval: politeness_interval(source),
        ..HttpClientConfig::default()
    })
}

fn raw_table(config: &PipelineConfig, table: InputTable) -> PathBuf {
    config.raw_dir().join(table.file_name())
}

fn load_study(config: &PipelineConfig) -> Result<StudyConfig> {
    StudyConfig::load(&config.study_config)
        .with_context(|| format!("loading {}", config.study_config.display()))
}

fn print_summary(step: &str, summary: &CollectSummary, path: &Path) {
    println!(
        "{step} complete: attempted={} failed={} skipped={} rows_written={} table={}",
        summary.attempted,
        summary.failed,
        summary.skipped,
        summary.rows_written,
        path.display()
    );
}

fn review_targets(config: &PipelineConfig, from_index: bool) -> Result<Vec<ReviewTarget>> {
    let details_path = raw_table(config, InputTable::BoxOfficeDetails);
    if !from_index && details_path.exists() {
        let rows: Vec<DetailRow> = read_csv_table(&details_path)?;
        return Ok(rows.iter().map(ReviewTarget::from_detail).collect());
    }
    let index_path = raw_table(config, InputTable::BoxOfficeIndex);
    if !index_path.exists() {
        bail!("no release table at {}; run collect-index first", index_path.display());
    }
    let rows: Vec<IndexRow> = read_csv_table(&index_path)?;
    Ok(rows.iter().map(ReviewTarget::from_index).collect())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = PipelineConfig::from_env();
    let endpoints = SourceEndpoints::default();
    let archive = PageArchive::new(config.pages_dir());

    match cli.command.unwrap_or(Commands::Merge) {
        Commands::Merge => {
            let study = load_study(&config)?;
            let report = run_merge(&config.raw_dir(), &config.processed_dir(), &study)?;
            let final_rows = report.stages.last().map_or(0, |s| s.rows);
            println!(
                "merge complete: run_id={} films={} needs_review={} output={}",
                report.run_id,
                final_rows,
                report.needs_review,
                config.processed_dir().display()
            );
        }
        Commands::CollectIndex { years } => {
            let years = if years.is_empty() {
                load_study(&config)?.box_office_years
            } else {
                years
            };
            let fetcher = fetcher_for(&config, SourceId::BoxOfficeIndex)?;
            let out = raw_table(&config, InputTable::BoxOfficeIndex);
            let summary = collect_index(&fetcher, Some(&archive), &endpoints.box_office, &years, &out).await?;
            print_summary("collect-index", &summary, &out);
        }
        Commands::CollectDetails { checkpoint_every } => {
            let index_path = raw_table(&config, InputTable::BoxOfficeIndex);
            let index: Vec<IndexRow> = read_csv_table(&index_path)
                .with_context(|| format!("run collect-index before collect-details ({})", index_path.display()))?;
            let fetcher = fetcher_for(&config, SourceId::BoxOfficeDetail)?;
            let out = raw_table(&config, InputTable::BoxOfficeDetails);
            let summary = collect_details(&fetcher, Some(&archive), &index, &out, checkpoint_every).await?;
            print_summary("collect-details", &summary, &out);
        }
        Commands::CollectReviews {
            checkpoint_every,
            from_index,
            rescrape_missing,
        } => {
            let targets = review_targets(&config, from_index)?;
            let fetcher = fetcher_for(&config, SourceId::ReviewAggregator)?;
            let out = raw_table(&config, InputTable::Reviews);
            if rescrape_missing {
                if !out.exists() {
                    bail!("no review table at {}; run collect-reviews first", out.display());
                }
                let summary =
                    rescrape_missing_reviews(&fetcher, Some(&archive), &endpoints.reviews, &targets, &out).await?;
                print_summary("rescrape-reviews", &summary, &out);
            } else {
                let summary = collect_reviews(
                    &fetcher,
                    Some(&archive),
                    &endpoints.reviews,
                    &targets,
                    &out,
                    checkpoint_every,
                )
                .await?;
                print_summary("collect-reviews", &summary, &out);
            }
        }
        Commands::CollectBudgets => {
            let fetcher = fetcher_for(&config, SourceId::BudgetDatabase)?;
            let out = raw_table(&config, InputTable::Budgets);
            let summary = collect_budgets(&fetcher, Some(&archive), &endpoints.budgets, &out).await?;
            print_summary("collect-budgets", &summary, &out);
        }
        Commands::Estimate { orders } => {
            let results = run_estimation(&config.processed_dir(), &orders, &ParametricRdd)?;
            let failed = results.iter().filter(|r| r.error.is_some()).count();
            println!(
                "estimate complete: specifications={} failed={} output={}",
                results.len(),
                failed,
                config.processed_dir().join(frdd_merge::RDD_RESULTS_FILE).display()
            );
        }
        Commands::InitConfig { path, force } => {
            let path = path.unwrap_or_else(|| config.study_config.clone());
            if path.exists() && !force {
                bail!("{} already exists; pass --force to overwrite", path.display());
            }
            let yaml = StudyConfig::default().to_yaml().context("serializing default study config")?;
            std::fs::write(&path, yaml).with_context(|| format!("writing {}", path.display()))?;
            println!("wrote {}", path.display());
        }
    }

    Ok(())
}
