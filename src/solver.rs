//! Per-gene model fitting.
//!
//! The engine only depends on the [`Solver`] trait; [`BestSubsetSolver`] is
//! the default implementation. It enumerates predictor subsets, scores each
//! with a weight-adjusted BIC, fits the winner by ordinary least squares on
//! the centered normal equations, and reports how much explanatory power is
//! lost when each selected predictor is removed.

use faer::linalg::solvers::Solve;
use faer::{Mat, Side};
use itertools::Itertools;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use thiserror::Error;

/// Subset enumeration is exponential in the predictor count, so the number
/// of predictors entering enumeration is hard-capped regardless of the
/// caller's retention bound.
const MAX_ENUMERATED_PREDICTORS: usize = 16;

/// Residual sums of squares below this are floored before taking logs.
const RSS_FLOOR: f64 = f64::MIN_POSITIVE;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SolverError {
    #[error("design covers {design_samples} samples but the response has {response_samples}")]
    SampleMismatch {
        design_samples: usize,
        response_samples: usize,
    },
    #[error("expected {predictors} predictor weights, got {weights}")]
    WeightMismatch { predictors: usize, weights: usize },
    #[error("cannot fit a model with zero samples")]
    NoSamples,
    #[error("non-finite value in the restricted design or response")]
    NonFinite,
    #[error("normal equations could not be factorized for the selected predictor subset")]
    Factorization,
}

/// Coefficients and explanatory-power reductions, both aligned to the rows
/// of the design matrix handed to the solver. Predictors outside the chosen
/// subset report zero in both vectors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubsetFit {
    pub betas: Vec<f64>,
    pub error_reduction: Vec<f64>,
}

/// Contract for the per-gene regression solver.
///
/// `design` is the predictor-by-sample matrix already restricted to the
/// gene's eligible predictors; `weights` carries one preference weight per
/// design row; `max_predictors` bounds how many predictors the fitted model
/// may retain. Implementations must be pure: no shared mutable state across
/// calls, so tasks can run on any worker in any order.
pub trait Solver: Send + Sync {
    fn solve(
        &self,
        design: ArrayView2<'_, f64>,
        response: ArrayView1<'_, f64>,
        weights: &[f64],
        max_predictors: usize,
    ) -> Result<SubsetFit, SolverError>;
}

/// Weighted-BIC best-subset ordinary least squares.
#[derive(Debug, Clone, Copy, Default)]
pub struct BestSubsetSolver;

/// Solves `gram[subset, subset] * beta = rhs[subset]` by Cholesky.
fn solve_subset(
    gram: &Array2<f64>,
    rhs: &[f64],
    members: &[usize],
) -> Result<Vec<f64>, SolverError> {
    let p = members.len();
    let sub = Mat::from_fn(p, p, |a, b| gram[[members[a], members[b]]]);
    let factor = sub
        .as_ref()
        .llt(Side::Lower)
        .map_err(|_| SolverError::Factorization)?;
    let b = Mat::from_fn(p, 1, |a, _| rhs[members[a]]);
    let sol = factor.solve(b.as_ref());
    Ok((0..p).map(|a| sol[(a, 0)]).collect())
}

fn subset_members(mask: u64, retained: &[usize]) -> Vec<usize> {
    (0..retained.len()).filter(|&pos| mask & (1 << pos) != 0).collect()
}

impl Solver for BestSubsetSolver {
    fn solve(
        &self,
        design: ArrayView2<'_, f64>,
        response: ArrayView1<'_, f64>,
        weights: &[f64],
        max_predictors: usize,
    ) -> Result<SubsetFit, SolverError> {
        let k = design.nrows();
        let n = response.len();
        if design.ncols() != n {
            return Err(SolverError::SampleMismatch {
                design_samples: design.ncols(),
                response_samples: n,
            });
        }
        if weights.len() != k {
            return Err(SolverError::WeightMismatch {
                predictors: k,
                weights: weights.len(),
            });
        }
        let zero_fit = SubsetFit {
            betas: vec![0.0; k],
            error_reduction: vec![0.0; k],
        };
        if k == 0 {
            return Ok(zero_fit);
        }
        if n == 0 {
            return Err(SolverError::NoSamples);
        }
        if response.iter().any(|v| !v.is_finite()) || design.iter().any(|v| !v.is_finite()) {
            return Err(SolverError::NonFinite);
        }

        // Center the response and every predictor; the intercept then drops
        // out of the normal equations entirely.
        let y_bar = response.sum() / n as f64;
        let yc: Array1<f64> = response.mapv(|v| v - y_bar);
        let tss = yc.dot(&yc);
        if tss <= 0.0 {
            // Constant response: nothing to explain.
            return Ok(zero_fit);
        }
        let mut xc = design.to_owned();
        for mut row in xc.rows_mut() {
            let mean = row.sum() / n as f64;
            row.mapv_inplace(|v| v - mean);
        }

        // If more predictors are eligible than the retention bound allows,
        // keep the ones most correlated with the response.
        let limit = if max_predictors > MAX_ENUMERATED_PREDICTORS {
            log::warn!(
                "retention bound {max_predictors} exceeds the subset enumeration cap; \
                 clamping to {MAX_ENUMERATED_PREDICTORS}"
            );
            MAX_ENUMERATED_PREDICTORS
        } else {
            max_predictors
        };
        if limit == 0 {
            return Ok(zero_fit);
        }
        let retained: Vec<usize> = if k <= limit {
            (0..k).collect()
        } else {
            let score = |i: usize| {
                let row = xc.row(i);
                let var = row.dot(&row);
                if var > 0.0 { row.dot(&yc).abs() / var.sqrt() } else { 0.0 }
            };
            (0..k)
                .sorted_by(|&a, &b| score(b).total_cmp(&score(a)).then(a.cmp(&b)))
                .take(limit)
                .sorted()
                .collect()
        };
        let m = retained.len();

        let gram = Array2::from_shape_fn((m, m), |(a, b)| {
            xc.row(retained[a]).dot(&xc.row(retained[b]))
        });
        let rhs: Vec<f64> = (0..m).map(|a| xc.row(retained[a]).dot(&yc)).collect();
        let penalty_of = |i: usize| {
            let w = weights[retained[i]];
            if w > 0.0 { 1.0 / w } else { f64::INFINITY }
        };

        // Enumerate every subset of the retained predictors, the empty model
        // included, and keep the lowest weighted BIC. Exact ties go to the
        // smaller subset, then to the earlier enumeration order.
        let ln_n = (n as f64).ln();
        let mut best_mask = 0u64;
        let mut best_bic = n as f64 * (tss.max(RSS_FLOOR) / n as f64).ln();
        let mut best_rss = tss;
        let mut best_beta: Vec<f64> = Vec::new();
        for mask in 1..(1u64 << m) {
            let members = subset_members(mask, &retained);
            let beta = match solve_subset(&gram, &rhs, &members) {
                Ok(beta) => beta,
                // A degenerate subset (e.g. collinear predictors) is simply
                // not a candidate model.
                Err(SolverError::Factorization) => continue,
                Err(e) => return Err(e),
            };
            if beta.iter().any(|b| !b.is_finite()) {
                continue;
            }
            let explained: f64 = members
                .iter()
                .zip(&beta)
                .map(|(&a, b)| b * rhs[a])
                .sum();
            let rss = (tss - explained).max(0.0);
            let penalty: f64 = members.iter().map(|&a| penalty_of(a)).sum();
            let bic = n as f64 * (rss.max(RSS_FLOOR) / n as f64).ln() + ln_n * penalty;
            let better = bic < best_bic
                || (bic == best_bic && mask.count_ones() < best_mask.count_ones());
            if better {
                best_mask = mask;
                best_bic = bic;
                best_rss = rss;
                best_beta = beta;
            }
        }

        let mut fit = zero_fit;
        let members = subset_members(best_mask, &retained);
        for (pos, &a) in members.iter().enumerate() {
            fit.betas[retained[a]] = best_beta[pos];
        }

        // Explanatory-power reduction: refit without each selected predictor
        // and measure the residual increase relative to total variance.
        for (pos, &a) in members.iter().enumerate() {
            let mut reduced = members.clone();
            reduced.remove(pos);
            let rss_without = if reduced.is_empty() {
                tss
            } else {
                let beta = solve_subset(&gram, &rhs, &reduced)?;
                let explained: f64 = reduced
                    .iter()
                    .zip(&beta)
                    .map(|(&b, c)| c * rhs[b])
                    .sum();
                (tss - explained).max(0.0)
            };
            fit.error_reduction[retained[a]] = ((rss_without - best_rss) / tss).max(0.0);
        }

        Ok(fit)
    }
}
