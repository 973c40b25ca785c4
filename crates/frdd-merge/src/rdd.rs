//! Regression-discontinuity samples and a parametric estimator.
//!
//! Estimation sits behind [`Estimator`]; the built-in [`ParametricRdd`] fits
//! `y = a + tau*D + b1*x + b2*D*x [+ b3*x^2 + b4*D*x^2] [+ controls]` by OLS
//! with HC1 standard errors and normal confidence intervals.

use std::collections::BTreeSet;

use frdd_core::ScoreKind;
use serde::Serialize;
use tracing::{info, warn};

use crate::output::AnalysisRow;
use crate::MergeError;

const Z_95: f64 = 1.959_963_984_540_054;
const NUMERIC_CONTROLS: [&str; 2] = ["log_budget", "log_theaters"];
const MPAA_REFERENCE: &str = "G";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RddOutcome {
    LogOpeningGross,
    LogTotalGross,
}

impl RddOutcome {
    pub const ALL: [RddOutcome; 2] = [RddOutcome::LogOpeningGross, RddOutcome::LogTotalGross];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::LogOpeningGross => "log_opening_gross",
            Self::LogTotalGross => "log_total_gross",
        }
    }

    /// Films still in theaters have not finished earning.
    pub fn excludes_in_progress(self) -> bool {
        matches!(self, Self::LogTotalGross)
    }

    fn value(self, row: &AnalysisRow) -> Option<f64> {
        match self {
            Self::LogOpeningGross => row.log_opening_gross,
            Self::LogTotalGross => row.log_total_gross,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RddSpecification {
    pub score: ScoreKind,
    pub outcome: RddOutcome,
    /// Adds log budget, log opening theaters, MPAA rating indicators and
    /// release-year indicators as regressors.
    pub with_controls: bool,
    pub polynomial_order: u8,
}

impl RddSpecification {
    /// Every score × outcome × controls × order combination.
    pub fn grid(orders: &[u8]) -> Vec<Self> {
        let mut specs = Vec::new();
        for score in ScoreKind::ALL {
            for outcome in RddOutcome::ALL {
                for &polynomial_order in orders {
                    for with_controls in [false, true] {
                        specs.push(Self {
                            score,
                            outcome,
                            with_controls,
                            polynomial_order,
                        });
                    }
                }
            }
        }
        specs
    }

    fn running(&self, row: &AnalysisRow) -> Option<f64> {
        match self.score {
            ScoreKind::Critic => row.tomatometer_centered,
            ScoreKind::Audience => row.audience_score_centered,
        }
        .map(f64::from)
    }

    fn treatment(&self, row: &AnalysisRow) -> Option<f64> {
        match self.score {
            ScoreKind::Critic => row.is_fresh_critic,
            ScoreKind::Audience => row.is_fresh_audience,
        }
        .map(f64::from)
    }

    fn controls(&self, row: &AnalysisRow) -> Option<Vec<f64>> {
        if !self.with_controls {
            return Some(Vec::new());
        }
        Some(vec![row.log_budget?, row.log_theaters?])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RddObservation {
    pub running: f64,
    pub treatment: f64,
    pub outcome: f64,
    pub controls: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RddSample {
    pub spec: RddSpecification,
    /// Names of the control columns, in the order of `RddObservation::controls`.
    pub control_names: Vec<String>,
    pub observations: Vec<RddObservation>,
}

impl RddSample {
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }
}

fn rating(row: &AnalysisRow) -> Option<&str> {
    row.mpaa_rating.as_deref().map(str::trim).filter(|r| !r.is_empty())
}

/// Indicator columns for the categorical controls. The reference level of
/// each category gets no column; a missing value encodes as all zeros.
#[derive(Debug, Clone, Default, PartialEq)]
struct Dummies {
    mpaa: Vec<String>,
    years: Vec<i32>,
}

impl Dummies {
    /// Levels seen in `rows`. `G` is the rating reference when present,
    /// otherwise the first rating; the earliest year is the year reference.
    fn from_rows<'a>(rows: impl Iterator<Item = &'a AnalysisRow> + Clone) -> Self {
        let ratings: BTreeSet<&str> = rows.clone().filter_map(rating).collect();
        let reference = if ratings.contains(MPAA_REFERENCE) {
            Some(MPAA_REFERENCE)
        } else {
            ratings.first().copied()
        };
        let mpaa = ratings
            .into_iter()
            .filter(|r| Some(*r) != reference)
            .map(str::to_string)
            .collect();
        let years = rows
            .filter_map(|row| row.release_year)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .skip(1)
            .collect();
        Self { mpaa, years }
    }

    fn names(&self) -> impl Iterator<Item = String> + '_ {
        self.mpaa
            .iter()
            .map(|r| format!("mpaa_{r}"))
            .chain(self.years.iter().map(|y| format!("year_{y}")))
    }

    fn encode(&self, row: &AnalysisRow, out: &mut Vec<f64>) {
        let rating = rating(row);
        out.extend(self.mpaa.iter().map(|level| f64::from(u8::from(rating == Some(level.as_str())))));
        out.extend(self.years.iter().map(|year| f64::from(u8::from(row.release_year == Some(*year)))));
    }
}

/// Rows with every value the specification needs; everything else is dropped.
/// Categorical levels come from the rows that survive.
pub fn build_sample(rows: &[AnalysisRow], spec: RddSpecification) -> RddSample {
    let kept: Vec<(&AnalysisRow, RddObservation)> = rows
        .iter()
        .filter(|row| !(spec.outcome.excludes_in_progress() && row.in_progress))
        .filter_map(|row| {
            let obs = RddObservation {
                running: spec.running(row)?,
                treatment: spec.treatment(row)?,
                outcome: spec.outcome.value(row)?,
                controls: spec.controls(row)?,
            };
            Some((row, obs))
        })
        .collect();

    if !spec.with_controls {
        return RddSample {
            spec,
            control_names: Vec::new(),
            observations: kept.into_iter().map(|(_, obs)| obs).collect(),
        };
    }

    let dummies = Dummies::from_rows(kept.iter().map(|(row, _)| *row));
    let control_names = NUMERIC_CONTROLS
        .iter()
        .map(|name| name.to_string())
        .chain(dummies.names())
        .collect();
    let observations = kept
        .into_iter()
        .map(|(row, mut obs)| {
            dummies.encode(row, &mut obs.controls);
            obs
        })
        .collect();
    RddSample {
        spec,
        control_names,
        observations,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Estimate {
    pub coef: f64,
    pub se: f64,
    pub p_value: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
    pub n: usize,
    pub r_squared: f64,
}

pub trait Estimator {
    fn name(&self) -> &'static str;

    /// Effect of crossing the cutoff on the outcome.
    fn estimate(&self, sample: &RddSample) -> Result<Estimate, MergeError>;
}

/// Global polynomial OLS over the full score range.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParametricRdd;

impl ParametricRdd {
    fn design_row(obs: &RddObservation, order: u8) -> Vec<f64> {
        let (x, d) = (obs.running, obs.treatment);
        let mut row = vec![1.0, d, x, d * x];
        if order >= 2 {
            row.push(x * x);
            row.push(d * x * x);
        }
        row.extend_from_slice(&obs.controls);
        row
    }
}

impl Estimator for ParametricRdd {
    fn name(&self) -> &'static str {
        "ols"
    }

    fn estimate(&self, sample: &RddSample) -> Result<Estimate, MergeError> {
        let order = sample.spec.polynomial_order;
        let x: Vec<Vec<f64>> = sample
            .observations
            .iter()
            .map(|obs| Self::design_row(obs, order))
            .collect();
        let y: Vec<f64> = sample.observations.iter().map(|obs| obs.outcome).collect();
        let fit = ols_hc1(&x, &y)?;

        // Column 1 is the treatment indicator.
        let coef = fit.beta[1];
        let se = fit.cov[1][1].max(0.0).sqrt();
        let p_value = if se > 0.0 {
            erfc((coef / se).abs() / std::f64::consts::SQRT_2)
        } else {
            f64::NAN
        };
        Ok(Estimate {
            coef,
            se,
            p_value,
            ci_lower: coef - Z_95 * se,
            ci_upper: coef + Z_95 * se,
            n: y.len(),
            r_squared: fit.r_squared,
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct OlsFit {
    pub beta: Vec<f64>,
    pub cov: Vec<Vec<f64>>,
    pub r_squared: f64,
}

fn invert(mut a: Vec<Vec<f64>>) -> Option<Vec<Vec<f64>>> {
    let n = a.len();
    let mut inv: Vec<Vec<f64>> = (0..n)
        .map(|i| (0..n).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
        .collect();
    let scale = a
        .iter()
        .enumerate()
        .map(|(i, row)| row[i].abs())
        .fold(0.0_f64, f64::max)
        .max(1.0);

    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))?;
        if a[pivot][col].abs() <= scale * 1e-12 {
            return None;
        }
        a.swap(col, pivot);
        inv.swap(col, pivot);

        let p = a[col][col];
        for k in 0..n {
            a[col][k] /= p;
            inv[col][k] /= p;
        }
        let pivot_row = a[col].clone();
        let pivot_inv = inv[col].clone();
        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = a[row][col];
            if factor == 0.0 {
                continue;
            }
            for k in 0..n {
                a[row][k] -= factor * pivot_row[k];
                inv[row][k] -= factor * pivot_inv[k];
            }
        }
    }
    Some(inv)
}

/// Least squares with heteroskedasticity-robust (HC1) covariance.
pub(crate) fn ols_hc1(x: &[Vec<f64>], y: &[f64]) -> Result<OlsFit, MergeError> {
    let n = y.len();
    let k = x.first().map_or(0, Vec::len);
    if k == 0 || n <= k {
        return Err(MergeError::Estimation(format!(
            "{n} observations for {k} regressors"
        )));
    }

    let mut xtx = vec![vec![0.0; k]; k];
    let mut xty = vec![0.0; k];
    for (row, &yi) in x.iter().zip(y) {
        for i in 0..k {
            xty[i] += row[i] * yi;
            for j in 0..k {
                xtx[i][j] += row[i] * row[j];
            }
        }
    }
    let bread = invert(xtx)
        .ok_or_else(|| MergeError::Estimation("design matrix is singular".to_string()))?;
    let beta: Vec<f64> = (0..k)
        .map(|i| (0..k).map(|j| bread[i][j] * xty[j]).sum())
        .collect();

    let residuals: Vec<f64> = x
        .iter()
        .zip(y)
        .map(|(row, &yi)| yi - row.iter().zip(&beta).map(|(a, b)| a * b).sum::<f64>())
        .collect();

    let mut meat = vec![vec![0.0; k]; k];
    for (row, e) in x.iter().zip(&residuals) {
        let e2 = e * e;
        for i in 0..k {
            for j in 0..k {
                meat[i][j] += e2 * row[i] * row[j];
            }
        }
    }
    let correction = n as f64 / (n - k) as f64;
    let half: Vec<Vec<f64>> = (0..k)
        .map(|i| (0..k).map(|j| (0..k).map(|m| bread[i][m] * meat[m][j]).sum()).collect())
        .collect();
    let cov: Vec<Vec<f64>> = (0..k)
        .map(|i| {
            (0..k)
                .map(|j| correction * (0..k).map(|m| half[i][m] * bread[m][j]).sum::<f64>())
                .collect()
        })
        .collect();

    let mean = y.iter().sum::<f64>() / n as f64;
    let total: f64 = y.iter().map(|v| (v - mean).powi(2)).sum();
    let ssr: f64 = residuals.iter().map(|e| e * e).sum();
    let r_squared = if total > 0.0 { 1.0 - ssr / total } else { f64::NAN };

    Ok(OlsFit {
        beta,
        cov,
        r_squared,
    })
}

/// Complementary error function, fractional error below 1.2e-7.
fn erfc(x: f64) -> f64 {
    let z = x.abs();
    let t = 1.0 / (1.0 + 0.5 * z);
    let poly = -z * z - 1.265_512_23
        + t * (1.000_023_68
            + t * (0.374_091_96
                + t * (0.096_784_18
                    + t * (-0.186_288_06
                        + t * (0.278_868_07
                            + t * (-1.135_203_98 + t * (1.488_515_87 + t * (-0.822_152_23 + t * 0.170_872_77))))))));
    let r = t * poly.exp();
    if x >= 0.0 {
        r
    } else {
        2.0 - r
    }
}

fn stars(p_value: f64) -> &'static str {
    if p_value < 0.01 {
        "***"
    } else if p_value < 0.05 {
        "**"
    } else if p_value < 0.10 {
        "*"
    } else {
        ""
    }
}

/// One line of `rdd_results.csv`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RddResultRow {
    pub score: ScoreKind,
    pub outcome: RddOutcome,
    pub method: &'static str,
    pub polynomial_order: u8,
    pub controls: bool,
    pub n: usize,
    pub coef: Option<f64>,
    pub se: Option<f64>,
    pub p_value: Option<f64>,
    pub ci_lower: Option<f64>,
    pub ci_upper: Option<f64>,
    pub r_squared: Option<f64>,
    pub stars: &'static str,
    pub error: Option<String>,
}

/// Runs every specification; a failed fit is recorded with its error.
pub fn run_specifications(
    rows: &[AnalysisRow],
    specs: &[RddSpecification],
    estimator: &dyn Estimator,
) -> Vec<RddResultRow> {
    specs
        .iter()
        .map(|&spec| {
            let sample = build_sample(rows, spec);
            let base = RddResultRow {
                score: spec.score,
                outcome: spec.outcome,
                method: estimator.name(),
                polynomial_order: spec.polynomial_order,
                controls: spec.with_controls,
                n: sample.len(),
                coef: None,
                se: None,
                p_value: None,
                ci_lower: None,
                ci_upper: None,
                r_squared: None,
                stars: "",
                error: None,
            };
            match estimator.estimate(&sample) {
                Ok(est) => {
                    info!(
                        score = spec.score.as_str(),
                        outcome = spec.outcome.as_str(),
                        order = spec.polynomial_order,
                        controls = spec.with_controls,
                        n = est.n,
                        coef = est.coef,
                        p_value = est.p_value,
                        "rdd estimate"
                    );
                    RddResultRow {
                        coef: Some(est.coef),
                        se: Some(est.se),
                        p_value: Some(est.p_value),
                        ci_lower: Some(est.ci_lower),
                        ci_upper: Some(est.ci_upper),
                        r_squared: Some(est.r_squared),
                        stars: stars(est.p_value),
                        ..base
                    }
                }
                Err(err) => {
                    warn!(
                        score = spec.score.as_str(),
                        outcome = spec.outcome.as_str(),
                        n = sample.len(),
                        error = %err,
                        "rdd estimate failed"
                    );
                    RddResultRow {
                        error: Some(err.to_string()),
                        ..base
                    }
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use frdd_core::ReleaseId;

    fn row(centered: i32, outcome: Option<f64>, in_progress: bool) -> AnalysisRow {
        let film = frdd_core::FilmRecord::new(ReleaseId::new("rl"), "Film");
        let mut row = AnalysisRow::from_film(&film);
        row.tomatometer_centered = Some(centered);
        row.is_fresh_critic = Some(u8::from(centered >= 0));
        row.log_opening_gross = outcome;
        row.log_total_gross = outcome;
        row.log_theaters = Some(8.0);
        row.in_progress = in_progress;
        row
    }

    #[test]
    fn grid_covers_every_combination() {
        let specs = RddSpecification::grid(&[1, 2]);
        assert_eq!(specs.len(), 16);
        assert!(specs.iter().any(|s| s.score == ScoreKind::Audience
            && s.outcome == RddOutcome::LogTotalGross
            && s.with_controls
            && s.polynomial_order == 2));
    }

    #[test]
    fn samples_drop_missing_values_and_unfinished_runs() {
        let rows = vec![row(-5, Some(10.0), false), row(3, None, false), row(7, Some(12.0), true)];
        let opening = RddSpecification {
            score: ScoreKind::Critic,
            outcome: RddOutcome::LogOpeningGross,
            with_controls: false,
            polynomial_order: 1,
        };
        assert_eq!(build_sample(&rows, opening).len(), 2);

        let total = RddSpecification {
            outcome: RddOutcome::LogTotalGross,
            ..opening
        };
        assert_eq!(build_sample(&rows, total).len(), 1);

        // No row has a budget, so the controlled sample is empty.
        let controlled = RddSpecification {
            with_controls: true,
            ..opening
        };
        assert!(build_sample(&rows, controlled).is_empty());

        let audience = RddSpecification {
            score: ScoreKind::Audience,
            ..opening
        };
        assert!(build_sample(&rows, audience).is_empty());
    }

    #[test]
    fn controlled_design_adds_rating_and_year_indicators() {
        let levels = [("G", 2022), ("PG-13", 2022), ("R", 2023), ("PG-13", 2023), ("", 2023)];
        let rows: Vec<AnalysisRow> = levels
            .iter()
            .enumerate()
            .map(|(i, &(rating, year))| {
                let mut r = row(i as i32 - 2, Some(10.0), false);
                r.log_budget = Some(17.0);
                r.mpaa_rating = Some(rating.to_string());
                r.release_year = Some(year);
                r
            })
            .collect();
        let spec = RddSpecification {
            score: ScoreKind::Critic,
            outcome: RddOutcome::LogOpeningGross,
            with_controls: true,
            polynomial_order: 1,
        };
        let sample = build_sample(&rows, spec);

        assert_eq!(
            sample.control_names,
            vec!["log_budget", "log_theaters", "mpaa_PG-13", "mpaa_R", "year_2023"]
        );
        // G and 2022 are the reference levels.
        assert_eq!(sample.observations[0].controls, vec![17.0, 8.0, 0.0, 0.0, 0.0]);
        assert_eq!(sample.observations[2].controls, vec![17.0, 8.0, 0.0, 1.0, 1.0]);
        // An empty rating has no indicator set.
        assert_eq!(sample.observations[4].controls, vec![17.0, 8.0, 0.0, 0.0, 1.0]);
        assert_eq!(ParametricRdd::design_row(&sample.observations[1], 1).len(), 9);
        assert_eq!(ParametricRdd::design_row(&sample.observations[1], 2).len(), 11);

        let bare = build_sample(&rows, RddSpecification { with_controls: false, ..spec });
        assert!(bare.control_names.is_empty());
        assert_eq!(ParametricRdd::design_row(&bare.observations[1], 1).len(), 4);
    }

    #[test]
    fn rating_reference_falls_back_to_the_first_level_without_g() {
        let rows: Vec<AnalysisRow> = ["PG", "R", "PG"]
            .iter()
            .enumerate()
            .map(|(i, rating)| {
                let mut r = row(i as i32, Some(10.0), false);
                r.log_budget = Some(17.0);
                r.mpaa_rating = Some(rating.to_string());
                r.release_year = Some(2024);
                r
            })
            .collect();
        let sample = build_sample(
            &rows,
            RddSpecification {
                score: ScoreKind::Critic,
                outcome: RddOutcome::LogOpeningGross,
                with_controls: true,
                polynomial_order: 1,
            },
        );
        assert_eq!(sample.control_names, vec!["log_budget", "log_theaters", "mpaa_R"]);
    }

    #[test]
    fn hc1_matches_the_textbook_mean_case() {
        let x = vec![vec![1.0]; 4];
        let fit = ols_hc1(&x, &[1.0, 2.0, 3.0, 4.0]).expect("fit");
        assert!((fit.beta[0] - 2.5).abs() < 1e-12);
        // Sum of squared residuals 5, scaled by 1 / (n (n - 1)).
        assert!((fit.cov[0][0] - 5.0 / 12.0).abs() < 1e-12);
    }

    #[test]
    fn recovers_a_clean_discontinuity() {
        let rows: Vec<AnalysisRow> = (-20..=20)
            .map(|c| {
                let jump = if c >= 0 { 0.4 } else { 0.0 };
                // Deterministic wobble so the fit is not exact.
                let wobble = if c % 2 == 0 { 0.01 } else { -0.01 };
                row(c, Some(15.0 + 0.02 * f64::from(c) + jump + wobble), false)
            })
            .collect();
        let spec = RddSpecification {
            score: ScoreKind::Critic,
            outcome: RddOutcome::LogOpeningGross,
            with_controls: false,
            polynomial_order: 1,
        };
        let est = ParametricRdd.estimate(&build_sample(&rows, spec)).expect("estimate");
        assert!((est.coef - 0.4).abs() < 0.02, "coef {}", est.coef);
        assert_eq!(est.n, 41);
        assert!(est.p_value < 0.01);
        assert!(est.ci_lower < est.coef && est.coef < est.ci_upper);
        assert!(est.r_squared > 0.9);
    }

    #[test]
    fn too_few_rows_is_an_estimation_error() {
        let rows = vec![row(-1, Some(1.0), false), row(1, Some(2.0), false)];
        let results = run_specifications(
            &rows,
            &[RddSpecification {
                score: ScoreKind::Critic,
                outcome: RddOutcome::LogOpeningGross,
                with_controls: false,
                polynomial_order: 1,
            }],
            &ParametricRdd,
        );
        assert_eq!(results[0].n, 2);
        assert_eq!(results[0].coef, None);
        assert!(results[0].error.is_some());
    }

    #[test]
    fn two_sided_p_values_follow_the_normal_distribution() {
        assert!((erfc(0.0) - 1.0).abs() < 1e-7);
        let p = erfc(Z_95 / std::f64::consts::SQRT_2);
        assert!((p - 0.05).abs() < 1e-6);
        assert_eq!(stars(0.004), "***");
        assert_eq!(stars(0.2), "");
    }
}
