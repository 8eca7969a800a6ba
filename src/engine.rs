//! Bootstrap orchestration.
//!
//! [`BbsrEngine`] owns the full gene-by-predictor matrices for one
//! bootstrap, derives the weight and predictor-pool matrices, fans the
//! per-gene regressions out through its execution controller, and
//! reassembles the gathered outcomes into coefficient and
//! explanatory-power-reduction matrices whose row order always matches the
//! input gene axis, regardless of worker completion order.

use ndarray::Array2;
use std::sync::Arc;
use thiserror::Error;

use crate::controller::{ControllerError, ExecutionController};
use crate::pool::build_predictor_pool;
use crate::solver::{BestSubsetSolver, Solver};
use crate::task::{BatchContext, GeneTask, TaskFailure};
use crate::types::{FailurePolicy, InputError, LabeledMatrix, RegressionSettings};
use crate::weights::build_weight_matrix;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Input(#[from] InputError),
    #[error(transparent)]
    Backend(#[from] ControllerError),
    #[error("batch aborted: {0}")]
    SolverAborted(TaskFailure),
}

/// The assembled output of one bootstrap: coefficients and per-predictor
/// explanatory-power reductions, row-ordered identically to the response
/// gene axis. Genes listed in `failures` have all-zero rows; a zero row is
/// never silently ambiguous.
#[derive(Debug)]
pub struct BootstrapNetwork {
    pub betas: LabeledMatrix,
    pub error_reduction: LabeledMatrix,
    pub failures: Vec<TaskFailure>,
}

/// Bayes best-subset regression engine over a pluggable execution backend.
pub struct BbsrEngine<C> {
    settings: RegressionSettings,
    controller: C,
    solver: Arc<dyn Solver>,
}

impl<C: ExecutionController> BbsrEngine<C> {
    pub fn new(settings: RegressionSettings, controller: C, solver: Arc<dyn Solver>) -> Self {
        Self {
            settings,
            controller,
            solver,
        }
    }

    /// Engine with the built-in weighted-BIC best-subset solver.
    pub fn with_default_solver(settings: RegressionSettings, controller: C) -> Self {
        Self::new(settings, controller, Arc::new(BestSubsetSolver))
    }

    /// Runs one bootstrap.
    ///
    /// `design` is predictors-by-samples, `response` genes-by-samples over
    /// the same sample axis. `relevance` and `priors` may cover larger
    /// identifier sets; they are restricted to the bootstrap's gene and
    /// predictor axes here (pure relabeling, no recomputation).
    pub fn run_bootstrap(
        &mut self,
        design: &LabeledMatrix,
        response: &LabeledMatrix,
        relevance: &LabeledMatrix,
        priors: &LabeledMatrix,
    ) -> Result<BootstrapNetwork, EngineError> {
        design.require_finite("design")?;
        response.require_finite("response")?;
        if design.col_labels() != response.col_labels() {
            return Err(InputError::AxisMismatch {
                left: "design",
                right: "response",
                axis: "sample",
            }
            .into());
        }

        let genes = response.row_labels().to_vec();
        let predictors = design.row_labels().to_vec();

        let weights_full = build_weight_matrix(
            priors,
            self.settings.no_prior_weight,
            self.settings.prior_weight,
        );
        log::debug!(
            "weight matrix built over {} genes x {} predictors",
            weights_full.row_labels().len(),
            weights_full.col_labels().len()
        );

        // Restrict priors, weights, and relevance to this bootstrap's axes.
        let weights = weights_full.select(&genes, &predictors)?;
        let prior = priors.select(&genes, &predictors)?;
        let relevance = relevance.select(&genes, &predictors)?;

        let pool = build_predictor_pool(
            &prior,
            &weights,
            &relevance,
            self.settings.no_prior_weight,
            self.settings.n_sub,
            self.settings.filter_priors_for_relevance,
        )?;
        log::info!(
            "dispatching {} gene regressions over {} predictors ({} eligible pairs)",
            genes.len(),
            predictors.len(),
            pool.iter().filter(|&&b| b).count()
        );

        let ctx = Arc::new(BatchContext {
            design: design.values().clone(),
            response: response.values().clone(),
            pool,
            weights: weights.values().clone(),
            genes: genes.clone(),
            predictors: predictors.clone(),
            n_sub: self.settings.n_sub,
            solver: Arc::clone(&self.solver),
        });
        let tasks: Vec<GeneTask> = (0..genes.len()).map(|index| GeneTask { index }).collect();

        self.controller.connect()?;
        self.controller.sync_processes()?;
        let outcomes = self.controller.map(Arc::clone(&ctx), &tasks)?;

        // Reassemble in gene order using each outcome's embedded index.
        let mut betas = Array2::zeros((genes.len(), predictors.len()));
        let mut error_reduction = Array2::zeros((genes.len(), predictors.len()));
        let mut failures: Vec<TaskFailure> = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(result) => {
                    for (&j, &b) in &result.betas {
                        betas[[result.index, j]] = b;
                    }
                    for (&j, &r) in &result.error_reduction {
                        error_reduction[[result.index, j]] = r;
                    }
                }
                Err(failure) => failures.push(failure),
            }
        }
        failures.sort_by_key(|f| f.index);

        if self.settings.on_solver_failure == FailurePolicy::Abort && !failures.is_empty() {
            return Err(EngineError::SolverAborted(failures.remove(0)));
        }

        Ok(BootstrapNetwork {
            betas: LabeledMatrix::from_validated(genes.clone(), predictors.clone(), betas),
            error_reduction: LabeledMatrix::from_validated(genes, predictors, error_reduction),
            failures,
        })
    }
}
