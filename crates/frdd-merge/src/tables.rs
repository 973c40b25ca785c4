//! Raw per-source tables as the collectors write them.
//!
//! Headers are checked once per table before any row is decoded. Cell-level
//! problems (an unparseable number, an empty cell) become `None`.

use std::collections::HashSet;
use std::fs::File;
use std::path::Path;

use serde::{Deserialize, Deserializer};
use tracing::{info, warn};

use crate::MergeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputTable {
    BoxOfficeIndex,
    BoxOfficeDetails,
    Reviews,
    Budgets,
}

impl InputTable {
    pub const ALL: [InputTable; 4] = [
        InputTable::BoxOfficeIndex,
        InputTable::BoxOfficeDetails,
        InputTable::Reviews,
        InputTable::Budgets,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            Self::BoxOfficeIndex => "bom_index.csv",
            Self::BoxOfficeDetails => "bom_details.csv",
            Self::Reviews => "rt_scores.csv",
            Self::Budgets => "the_numbers_budgets.csv",
        }
    }

    pub fn required_columns(self) -> &'static [&'static str] {
        match self {
            Self::BoxOfficeIndex => &[
                "bom_release_id",
                "title",
                "total_gross",
                "max_theaters",
                "release_date_raw",
                "bom_year",
                "distributor",
            ],
            Self::BoxOfficeDetails => &[
                "bom_release_id",
                "opening_wknd_gross",
                "opening_wknd_theaters",
                "widest_release",
                "domestic_gross",
                "mpaa_rating",
                "genres",
                "release_date",
                "distributor",
            ],
            Self::Reviews => &["bom_release_id", "tomatometer", "audience_score", "match_method"],
            Self::Budgets => &["title", "release_year", "production_budget"],
        }
    }
}

/// Every required column absent from `headers`, in declaration order.
pub fn missing_columns(table: InputTable, headers: &csv::StringRecord) -> Vec<String> {
    let present: HashSet<&str> = headers.iter().map(str::trim).collect();
    table
        .required_columns()
        .iter()
        .filter(|column| !present.contains(*column))
        .map(|column| column.to_string())
        .collect()
}

/// Accepts `1234`, `1234.0` and `1.2e3`; anything else is unknown.
fn parse_lenient(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    raw.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn lenient_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(parse_lenient).map(|v| v.trunc() as i64))
}

fn lenient_i32<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i32>, D::Error> {
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw
        .as_deref()
        .and_then(parse_lenient)
        .filter(|v| v.abs() <= i32::MAX as f64)
        .map(|v| v.trunc() as i32))
}

fn trimmed<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty()))
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct IndexRecord {
    pub bom_release_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub total_gross: Option<i64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub max_theaters: Option<i64>,
    #[serde(default, deserialize_with = "trimmed")]
    pub release_date_raw: Option<String>,
    #[serde(default, deserialize_with = "lenient_i32")]
    pub bom_year: Option<i32>,
    #[serde(default, deserialize_with = "trimmed")]
    pub distributor: Option<String>,
    #[serde(default, deserialize_with = "trimmed")]
    pub release_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DetailRecord {
    pub bom_release_id: String,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub opening_wknd_gross: Option<i64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub opening_wknd_theaters: Option<i64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub widest_release: Option<i64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub domestic_gross: Option<i64>,
    #[serde(default, deserialize_with = "trimmed")]
    pub mpaa_rating: Option<String>,
    #[serde(default, deserialize_with = "trimmed")]
    pub genres: Option<String>,
    #[serde(default, deserialize_with = "trimmed")]
    pub release_date: Option<String>,
    #[serde(default, deserialize_with = "trimmed")]
    pub distributor: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ReviewRecord {
    pub bom_release_id: String,
    #[serde(default, deserialize_with = "lenient_i32")]
    pub tomatometer: Option<i32>,
    #[serde(default, deserialize_with = "lenient_i32")]
    pub audience_score: Option<i32>,
    #[serde(default, deserialize_with = "trimmed")]
    pub match_method: Option<String>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub critic_count: Option<i64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub audience_count: Option<i64>,
    #[serde(default, deserialize_with = "trimmed")]
    pub rt_genres: Option<String>,
    #[serde(default, deserialize_with = "trimmed")]
    pub rt_rating: Option<String>,
    #[serde(default, deserialize_with = "trimmed")]
    pub rt_url: Option<String>,
    #[serde(default, deserialize_with = "trimmed")]
    pub rt_title: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BudgetRecord {
    #[serde(default)]
    pub title: String,
    #[serde(default, deserialize_with = "lenient_i32")]
    pub release_year: Option<i32>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub production_budget: Option<i64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub domestic_gross: Option<i64>,
}

/// Reads one input table, failing before any row is decoded if the file or a
/// required column is missing. Rows that cannot be decoded at all are skipped
/// with a warning.
pub fn load_table<T: serde::de::DeserializeOwned>(
    table: InputTable,
    path: &Path,
) -> Result<Vec<T>, MergeError> {
    if !path.exists() {
        return Err(MergeError::MissingInput {
            table: table.file_name(),
            path: path.to_path_buf(),
        });
    }
    let file = File::open(path).map_err(|source| MergeError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::Headers)
        .from_reader(file);
    let headers = reader
        .headers()
        .map_err(|source| MergeError::Csv {
            path: path.to_path_buf(),
            source,
        })?
        .clone();
    let missing = missing_columns(table, &headers);
    if !missing.is_empty() {
        return Err(MergeError::MissingColumns {
            table: table.file_name(),
            columns: missing,
        });
    }

    let mut rows = Vec::new();
    let mut skipped = 0usize;
    for (index, row) in reader.deserialize::<T>().enumerate() {
        match row {
            Ok(row) => rows.push(row),
            Err(err) => {
                warn!(table = table.file_name(), row = index + 1, error = %err, "skipping undecodable row");
                skipped += 1;
            }
        }
    }
    info!(table = table.file_name(), rows = rows.len(), skipped, "input table loaded");
    Ok(rows)
}

/// The four raw inputs of a merge run.
#[derive(Debug, Clone, Default)]
pub struct RawTables {
    pub index: Vec<IndexRecord>,
    pub details: Vec<DetailRecord>,
    pub reviews: Vec<ReviewRecord>,
    pub budgets: Vec<BudgetRecord>,
}

impl RawTables {
    pub fn load(raw_dir: &Path) -> Result<Self, MergeError> {
        Ok(Self {
            index: load_table(InputTable::BoxOfficeIndex, &raw_dir.join(InputTable::BoxOfficeIndex.file_name()))?,
            details: load_table(
                InputTable::BoxOfficeDetails,
                &raw_dir.join(InputTable::BoxOfficeDetails.file_name()),
            )?,
            reviews: load_table(InputTable::Reviews, &raw_dir.join(InputTable::Reviews.file_name()))?,
            budgets: load_table(InputTable::Budgets, &raw_dir.join(InputTable::Budgets.file_name()))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn every_missing_column_is_reported_together() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("bom_details.csv");
        std::fs::write(&path, "bom_release_id,opening_wknd_gross,genres,distributor\nrl1,100,,\n")
            .expect("write");

        let err = load_table::<DetailRecord>(InputTable::BoxOfficeDetails, &path).expect_err("missing");
        match err {
            MergeError::MissingColumns { table, columns } => {
                assert_eq!(table, "bom_details.csv");
                assert_eq!(
                    columns,
                    vec![
                        "opening_wknd_theaters",
                        "widest_release",
                        "domestic_gross",
                        "mpaa_rating",
                        "release_date"
                    ]
                );
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn missing_file_names_the_table() {
        let dir = tempdir().expect("tempdir");
        let err = RawTables::load(dir.path()).expect_err("missing");
        assert!(matches!(err, MergeError::MissingInput { table: "bom_index.csv", .. }));
    }

    #[test]
    fn numeric_cells_are_read_leniently() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("rt_scores.csv");
        std::fs::write(
            &path,
            "bom_release_id,tomatometer,audience_score,match_method,critic_count\n\
             rl1,91.0,,direct_url,264\n\
             rl2,n/a,88,search,\n",
        )
        .expect("write");

        let rows: Vec<ReviewRecord> = load_table(InputTable::Reviews, &path).expect("load");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].tomatometer, Some(91));
        assert_eq!(rows[0].audience_score, None);
        assert_eq!(rows[0].critic_count, Some(264));
        assert_eq!(rows[0].rt_url, None);
        assert_eq!(rows[1].tomatometer, None);
        assert_eq!(rows[1].audience_score, Some(88));
        assert_eq!(rows[1].match_method.as_deref(), Some("search"));
    }

    #[test]
    fn extra_columns_are_ignored() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("the_numbers_budgets.csv");
        std::fs::write(
            &path,
            "tn_rank,title,release_date,release_year,production_budget,domestic_gross,worldwide_gross\n\
             1,Avatar,2022-12-09,2022,460000000,684075767,2320250281\n",
        )
        .expect("write");
        let rows: Vec<BudgetRecord> = load_table(InputTable::Budgets, &path).expect("load");
        assert_eq!(rows[0].title, "Avatar");
        assert_eq!(rows[0].release_year, Some(2022));
        assert_eq!(rows[0].production_budget, Some(460_000_000));
        assert_eq!(rows[0].domestic_gross, Some(684_075_767));
    }

    #[test]
    fn padded_header_names_still_decode() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("the_numbers_budgets.csv");
        std::fs::write(&path, " title , release_year,production_budget \nAvatar,2022,460000000\n").expect("write");

        let rows: Vec<BudgetRecord> = load_table(InputTable::Budgets, &path).expect("load");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].title, "Avatar");
        assert_eq!(rows[0].release_year, Some(2022));
        assert_eq!(rows[0].production_budget, Some(460_000_000));
    }
}
