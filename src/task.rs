//! Per-gene regression tasks.
//!
//! A task is one gene's regression problem: its response row, its eligible
//! predictors, and their weights, all drawn from the immutable per-bootstrap
//! [`BatchContext`]. Tasks are independent and order-agnostic; each outcome
//! carries the gene's row index so the orchestrator can reassemble results
//! no matter which worker finished first.

use ahash::AHashMap;
use ndarray::Array2;
use std::sync::Arc;
use thiserror::Error;

use crate::solver::{Solver, SolverError};

/// One progress line per this many genes at `info`; everything else logs at
/// `debug` so massively parallel runs do not flood the log.
pub const PROGRESS_STRIDE: usize = 100;

/// The shared, read-only state for one bootstrap's batch of regressions.
/// Built once by the engine and broadcast (via `Arc` or scatter handles) to
/// every worker; never mutated while a batch is in flight.
pub struct BatchContext {
    /// Predictor-by-sample expression/activity matrix.
    pub design: Array2<f64>,
    /// Gene-by-sample response matrix.
    pub response: Array2<f64>,
    /// Gene-by-predictor eligibility matrix.
    pub pool: Array2<bool>,
    /// Gene-by-predictor preference weights.
    pub weights: Array2<f64>,
    pub genes: Vec<String>,
    pub predictors: Vec<String>,
    /// Retention bound passed through to the solver.
    pub n_sub: usize,
    pub solver: Arc<dyn Solver>,
}

impl BatchContext {
    pub fn gene_count(&self) -> usize {
        self.genes.len()
    }
}

/// A unit of distributable work: the index of one gene row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeneTask {
    pub index: usize,
}

/// Fitted model for one gene. Maps are keyed by predictor column index in
/// the batch's predictor axis and only cover the gene's eligible predictors.
#[derive(Debug, Clone)]
pub struct GeneResult {
    pub index: usize,
    pub betas: AHashMap<usize, f64>,
    pub error_reduction: AHashMap<usize, f64>,
}

/// A single gene's solver failure, tagged with the gene so batch-level
/// reporting can attribute it.
#[derive(Error, Debug, Clone)]
#[error("regression failed for gene '{gene}' (row {index}): {source}")]
pub struct TaskFailure {
    pub index: usize,
    pub gene: String,
    #[source]
    pub source: SolverError,
}

pub type TaskOutcome = Result<GeneResult, TaskFailure>;

/// Runs one gene's regression against the shared batch state.
///
/// Predictors whose pool cell is false are excluded from the design slice
/// entirely rather than zero-weighted, so the solver never sees them.
pub fn run_gene(ctx: &BatchContext, index: usize) -> TaskOutcome {
    let gene = &ctx.genes[index];
    if index % PROGRESS_STRIDE == 0 {
        log::info!("regressing gene '{gene}' ({} of {})", index + 1, ctx.gene_count());
    } else {
        log::debug!("regressing gene '{gene}' ({} of {})", index + 1, ctx.gene_count());
    }

    let eligible: Vec<usize> = (0..ctx.predictors.len())
        .filter(|&j| ctx.pool[[index, j]])
        .collect();
    let n_samples = ctx.design.ncols();
    let sub_design = Array2::from_shape_fn((eligible.len(), n_samples), |(r, c)| {
        ctx.design[[eligible[r], c]]
    });
    let sub_weights: Vec<f64> = eligible.iter().map(|&j| ctx.weights[[index, j]]).collect();
    let response = ctx.response.row(index);

    match ctx
        .solver
        .solve(sub_design.view(), response, &sub_weights, ctx.n_sub)
    {
        Ok(fit) => {
            let mut betas = AHashMap::with_capacity(eligible.len());
            let mut error_reduction = AHashMap::with_capacity(eligible.len());
            for (r, &j) in eligible.iter().enumerate() {
                betas.insert(j, fit.betas[r]);
                error_reduction.insert(j, fit.error_reduction[r]);
            }
            Ok(GeneResult {
                index,
                betas,
                error_reduction,
            })
        }
        Err(source) => Err(TaskFailure {
            index,
            gene: gene.clone(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::BestSubsetSolver;
    use ndarray::{array, Array2};

    fn context() -> BatchContext {
        // Two genes over three predictors and four samples. G1 may only use
        // TF1/TF3; G2 has no eligible predictors at all.
        let design = array![
            [1.0, 2.0, 3.0, 4.0],
            [0.5, 0.5, 0.5, 0.5],
            [4.0, 3.0, 2.0, 1.0]
        ];
        let response = array![[2.0, 4.0, 6.0, 8.0], [1.0, 1.0, 1.0, 1.0]];
        let pool = array![[true, false, true], [false, false, false]];
        let weights = Array2::from_elem((2, 3), 1.0);
        BatchContext {
            design,
            response,
            pool,
            weights,
            genes: vec!["G1".into(), "G2".into()],
            predictors: vec!["TF1".into(), "TF2".into(), "TF3".into()],
            n_sub: 2,
            solver: Arc::new(BestSubsetSolver),
        }
    }

    #[test]
    fn ineligible_predictors_never_appear_in_the_result() {
        let ctx = context();
        let result = run_gene(&ctx, 0).unwrap();
        assert_eq!(result.index, 0);
        assert!(result.betas.contains_key(&0));
        assert!(!result.betas.contains_key(&1));
        assert!(result.betas.contains_key(&2));
    }

    #[test]
    fn empty_pool_row_produces_an_empty_result() {
        let ctx = context();
        let result = run_gene(&ctx, 1).unwrap();
        assert_eq!(result.index, 1);
        assert!(result.betas.is_empty());
        assert!(result.error_reduction.is_empty());
    }
}
