use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use frdd_core::{MatchStatus, SourceId};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::MergeError;

/// Process-level settings read from the environment.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub study_config: PathBuf,
    pub user_agents: Vec<String>,
    pub http_timeout_secs: u64,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`PipelineConfig::from_env`] with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            data_dir: lookup("FRDD_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            artifacts_dir: lookup("FRDD_ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./artifacts")),
            study_config: lookup("FRDD_STUDY_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./study.yaml")),
            // Comma-separated list; requests rotate through it.
            user_agents: lookup("FRDD_USER_AGENT")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|ua| !ua.is_empty())
                        .map(str::to_string)
                        .collect::<Vec<_>>()
                })
                .filter(|agents| !agents.is_empty())
                .unwrap_or_else(|| vec!["frdd-collector/0.1".to_string()]),
            http_timeout_secs: lookup("FRDD_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        }
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.data_dir.join("raw")
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.data_dir.join("processed")
    }

    pub fn pages_dir(&self) -> PathBuf {
        self.artifacts_dir.join("pages")
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityMeasure {
    /// Insertion/deletion distance ratio, `2 * lcs / (len_a + len_b)`.
    #[default]
    Indel,
    /// Normalized Levenshtein distance.
    Levenshtein,
}

/// Which match outcomes copy the candidate's budget figures onto the film.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetAttachment {
    /// Whatever the status, as long as a candidate was scored.
    #[default]
    BestCandidate,
    ReviewOrBetter,
    MatchedOnly,
}

impl BudgetAttachment {
    pub fn allows(self, status: MatchStatus) -> bool {
        match self {
            Self::BestCandidate => true,
            Self::ReviewOrBetter => status != MatchStatus::Unmatched,
            Self::MatchedOnly => status == MatchStatus::Matched,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MatchConfig {
    pub accept_threshold: f64,
    pub review_threshold: f64,
    pub year_tolerance: i32,
    pub attach_budgets: BudgetAttachment,
    pub similarity: SimilarityMeasure,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            accept_threshold: 85.0,
            review_threshold: 70.0,
            year_tolerance: 1,
            attach_budgets: BudgetAttachment::BestCandidate,
            similarity: SimilarityMeasure::Indel,
        }
    }
}

/// Fields whose value can come from more than one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedField {
    DomesticGross,
    Distributor,
    ReleaseDate,
    MpaaRating,
}

impl ResolvedField {
    pub const ALL: [ResolvedField; 4] = [
        ResolvedField::DomesticGross,
        ResolvedField::Distributor,
        ResolvedField::ReleaseDate,
        ResolvedField::MpaaRating,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DomesticGross => "domestic_gross",
            Self::Distributor => "distributor",
            Self::ReleaseDate => "release_date",
            Self::MpaaRating => "mpaa_rating",
        }
    }

    /// Sources that actually carry a value for this field.
    pub fn providers(self) -> &'static [SourceId] {
        match self {
            Self::DomesticGross | Self::Distributor | Self::ReleaseDate => {
                &[SourceId::BoxOfficeDetail, SourceId::BoxOfficeIndex]
            }
            Self::MpaaRating => &[SourceId::BoxOfficeDetail, SourceId::ReviewAggregator],
        }
    }
}

/// Ordered source preference per field. The first source with a value wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PrecedenceConfig {
    pub domestic_gross: Vec<SourceId>,
    pub distributor: Vec<SourceId>,
    pub release_date: Vec<SourceId>,
    pub mpaa_rating: Vec<SourceId>,
}

impl Default for PrecedenceConfig {
    fn default() -> Self {
        let detail_then_index = vec![SourceId::BoxOfficeDetail, SourceId::BoxOfficeIndex];
        Self {
            domestic_gross: detail_then_index.clone(),
            distributor: detail_then_index.clone(),
            release_date: detail_then_index,
            mpaa_rating: vec![SourceId::BoxOfficeDetail, SourceId::ReviewAggregator],
        }
    }
}

impl PrecedenceConfig {
    pub fn order(&self, field: ResolvedField) -> &[SourceId] {
        match field {
            ResolvedField::DomesticGross => &self.domestic_gross,
            ResolvedField::Distributor => &self.distributor,
            ResolvedField::ReleaseDate => &self.release_date,
            ResolvedField::MpaaRating => &self.mpaa_rating,
        }
    }

    fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for field in ResolvedField::ALL {
            let order = self.order(field);
            if order.is_empty() {
                problems.push(format!("precedence.{} must list at least one source", field.as_str()));
            }
            let mut seen = HashSet::new();
            for source in order {
                if !seen.insert(*source) {
                    problems.push(format!("precedence.{} lists {} twice", field.as_str(), source));
                }
                if !field.providers().contains(source) {
                    problems.push(format!(
                        "precedence.{}: {} does not provide this field",
                        field.as_str(),
                        source
                    ));
                }
            }
        }
        problems
    }
}

/// Study design parameters, loaded from `study.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StudyConfig {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub min_opening_theaters: i64,
    pub fresh_cutoff: i32,
    pub in_progress_window_days: i64,
    pub box_office_years: Vec<i32>,
    #[serde(rename = "match")]
    pub matching: MatchConfig,
    pub precedence: PrecedenceConfig,
}

impl Default for StudyConfig {
    fn default() -> Self {
        Self {
            start_date: NaiveDate::from_ymd_opt(2021, 9, 1).unwrap_or_default(),
            end_date: NaiveDate::from_ymd_opt(2026, 2, 7).unwrap_or_default(),
            min_opening_theaters: 600,
            fresh_cutoff: 60,
            in_progress_window_days: 56,
            box_office_years: (2021..=2026).collect(),
            matching: MatchConfig::default(),
            precedence: PrecedenceConfig::default(),
        }
    }
}

impl StudyConfig {
    /// Reads and validates `path`. A missing file means the defaults.
    pub fn load(path: &Path) -> Result<Self, MergeError> {
        if !path.exists() {
            info!(path = %path.display(), "study config not found; using defaults");
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        }
        let text = std::fs::read_to_string(path).map_err(|source| MergeError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_yaml(&text)
            .map_err(|err| MergeError::InvalidConfig(vec![format!("{}: {err}", path.display())]))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Checks every constraint and reports all violations together.
    pub fn validate(&self) -> Result<(), MergeError> {
        let mut problems = Vec::new();
        if self.start_date > self.end_date {
            problems.push(format!(
                "start_date {} is after end_date {}",
                self.start_date, self.end_date
            ));
        }
        let m = &self.matching;
        if !(0.0..=100.0).contains(&m.review_threshold) {
            problems.push(format!("match.review_threshold {} is outside 0..=100", m.review_threshold));
        }
        if !(0.0..=100.0).contains(&m.accept_threshold) {
            problems.push(format!("match.accept_threshold {} is outside 0..=100", m.accept_threshold));
        }
        if m.review_threshold > m.accept_threshold {
            problems.push(format!(
                "match.review_threshold {} exceeds match.accept_threshold {}",
                m.review_threshold, m.accept_threshold
            ));
        }
        if m.year_tolerance < 0 {
            problems.push(format!("match.year_tolerance {} is negative", m.year_tolerance));
        }
        if self.min_opening_theaters < 0 {
            problems.push(format!("min_opening_theaters {} is negative", self.min_opening_theaters));
        }
        if self.in_progress_window_days < 0 {
            problems.push(format!(
                "in_progress_window_days {} is negative",
                self.in_progress_window_days
            ));
        }
        problems.extend(self.precedence.problems());

        if problems.is_empty() {
            Ok(())
        } else {
            Err(MergeError::InvalidConfig(problems))
        }
    }
}
