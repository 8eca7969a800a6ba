//! Predictor pool construction.
//!
//! For every gene, decides which predictors are eligible to enter its
//! regression at all. Eligibility is the union of two signals: prior
//! knowledge (optionally filtered by observed relevance) and a per-gene
//! top-k ranking of the relevance (CLR) matrix. Self-regulation is excluded
//! wherever a gene identifier also appears on the predictor axis.

use ahash::AHashMap;
use itertools::Itertools;
use ndarray::Array2;

use crate::types::{InputError, LabeledMatrix};

/// A relevance cell is selectable only if it is finite and strictly
/// positive. Zero means "no signal"; NaN/inf cells are invalid, never
/// selectable, and excluded from the per-row valid count.
fn relevance_is_valid(v: f64) -> bool {
    v.is_finite() && v > 0.0
}

fn require_aligned(
    a: &LabeledMatrix,
    a_name: &'static str,
    b: &LabeledMatrix,
    b_name: &'static str,
) -> Result<(), InputError> {
    if a.row_labels() != b.row_labels() {
        return Err(InputError::AxisMismatch {
            left: a_name,
            right: b_name,
            axis: "gene",
        });
    }
    if a.col_labels() != b.col_labels() {
        return Err(InputError::AxisMismatch {
            left: a_name,
            right: b_name,
            axis: "predictor",
        });
    }
    Ok(())
}

/// Builds the boolean predictor-pool matrix over axis-aligned prior, weight,
/// and relevance matrices.
///
/// The weight comparison against `no_prior_weight` is written alongside the
/// prior test so that weight matrices built by other means still contribute
/// eligibility; with weights from [`crate::weights::build_weight_matrix`]
/// the two tests are equivalent.
pub fn build_predictor_pool(
    prior: &LabeledMatrix,
    weights: &LabeledMatrix,
    relevance: &LabeledMatrix,
    no_prior_weight: f64,
    n_sub: usize,
    filter_priors_for_relevance: bool,
) -> Result<Array2<bool>, InputError> {
    require_aligned(prior, "prior", weights, "weights")?;
    require_aligned(prior, "prior", relevance, "relevance")?;

    let n_genes = prior.row_labels().len();
    let n_predictors = prior.col_labels().len();
    let prior_v = prior.values();
    let weight_v = weights.values();
    let relevance_v = relevance.values();

    let mut pool = Array2::from_elem((n_genes, n_predictors), false);

    // Prior-based eligibility, optionally intersected with nonzero relevance.
    for ((i, j), cell) in pool.indexed_iter_mut() {
        let mut eligible =
            prior_v[[i, j]] != 0.0 || weight_v[[i, j]] != no_prior_weight;
        if filter_priors_for_relevance {
            eligible = eligible && relevance_v[[i, j]] != 0.0;
        }
        *cell = eligible;
    }

    // Per-gene top-k relevance ranking. Ties resolve to the lower column
    // index so identical inputs always produce identical pools.
    for i in 0..n_genes {
        let ranked: Vec<usize> = (0..n_predictors)
            .filter(|&j| relevance_is_valid(relevance_v[[i, j]]))
            .sorted_by(|&a, &b| {
                relevance_v[[i, b]]
                    .total_cmp(&relevance_v[[i, a]])
                    .then(a.cmp(&b))
            })
            .collect();
        let keep = n_sub.min(n_predictors).min(ranked.len());
        for &j in &ranked[..keep] {
            pool[[i, j]] = true;
        }
    }

    // A gene may not be modeled as regulating itself.
    let col_of: AHashMap<&str, usize> = prior
        .col_labels()
        .iter()
        .enumerate()
        .map(|(j, l)| (l.as_str(), j))
        .collect();
    for (i, gene) in prior.row_labels().iter().enumerate() {
        if let Some(&j) = col_of.get(gene.as_str()) {
            pool[[i, j]] = false;
        }
    }

    Ok(pool)
}
