//! Prior-informed predictor weight matrix.

use crate::types::LabeledMatrix;

/// Maps a prior-knowledge matrix to a two-valued weight matrix: cells with a
/// nonzero prior get `prior_weight`, all others get `no_prior_weight`. The
/// sign and magnitude of the prior are deliberately ignored; only presence
/// matters at this stage.
pub fn build_weight_matrix(
    prior: &LabeledMatrix,
    no_prior_weight: f64,
    prior_weight: f64,
) -> LabeledMatrix {
    let values = prior
        .values()
        .mapv(|p| if p != 0.0 { prior_weight } else { no_prior_weight });
    LabeledMatrix::from_validated(
        prior.row_labels().to_vec(),
        prior.col_labels().to_vec(),
        values,
    )
}
