//! Labeled matrix containers and engine configuration.
//!
//! Every matrix that crosses this crate's boundary carries its own
//! gene/predictor/sample identifier axes. The workflow layer hands us
//! expression, response, prior, and relevance matrices whose axes may only
//! partially overlap; `LabeledMatrix::select` is the restriction step that
//! aligns them to the current bootstrap's active identifier sets before any
//! numeric work happens.

use ahash::AHashMap;
use ndarray::Array2;
use thiserror::Error;

/// Failures in user-provided input. These are never retried; they indicate
/// the workflow layer handed this engine malformed data.
#[derive(Error, Debug)]
pub enum InputError {
    #[error(
        "matrix has shape {nrows}x{ncols} but {rows} row labels and {cols} column labels were supplied"
    )]
    ShapeMismatch {
        rows: usize,
        cols: usize,
        nrows: usize,
        ncols: usize,
    },
    #[error("duplicate {axis} label '{label}'")]
    DuplicateLabel { axis: &'static str, label: String },
    #[error("label '{label}' is not present on the {axis} axis")]
    MissingLabel { axis: &'static str, label: String },
    #[error(
        "non-finite value in '{matrix}' at ({row}, {col}); expression input must be complete and finite"
    )]
    NonFiniteValue {
        matrix: &'static str,
        row: String,
        col: String,
    },
    #[error("'{left}' and '{right}' disagree on the {axis} axis")]
    AxisMismatch {
        left: &'static str,
        right: &'static str,
        axis: &'static str,
    },
}

/// A dense `f64` matrix with owned, uniquely-labeled row and column axes.
///
/// Lookup by label is O(1); `select` produces the sub-matrix for an
/// arbitrary (existing) label subset, preserving the order of the request.
#[derive(Debug, Clone)]
pub struct LabeledMatrix {
    rows: Vec<String>,
    cols: Vec<String>,
    row_index: AHashMap<String, usize>,
    col_index: AHashMap<String, usize>,
    values: Array2<f64>,
}

fn build_index(
    labels: &[String],
    axis: &'static str,
) -> Result<AHashMap<String, usize>, InputError> {
    let mut index = AHashMap::with_capacity(labels.len());
    for (i, label) in labels.iter().enumerate() {
        if index.insert(label.clone(), i).is_some() {
            return Err(InputError::DuplicateLabel {
                axis,
                label: label.clone(),
            });
        }
    }
    Ok(index)
}

impl LabeledMatrix {
    /// Builds a labeled matrix, validating that the label axes agree with
    /// the array shape and contain no duplicates.
    pub fn new(
        rows: Vec<String>,
        cols: Vec<String>,
        values: Array2<f64>,
    ) -> Result<Self, InputError> {
        if values.nrows() != rows.len() || values.ncols() != cols.len() {
            return Err(InputError::ShapeMismatch {
                rows: rows.len(),
                cols: cols.len(),
                nrows: values.nrows(),
                ncols: values.ncols(),
            });
        }
        let row_index = build_index(&rows, "row")?;
        let col_index = build_index(&cols, "column")?;
        Ok(Self {
            rows,
            cols,
            row_index,
            col_index,
            values,
        })
    }

    /// Constructor for axes this crate has already validated (e.g. axes
    /// inherited from an existing `LabeledMatrix`).
    pub(crate) fn from_validated(rows: Vec<String>, cols: Vec<String>, values: Array2<f64>) -> Self {
        debug_assert_eq!(values.nrows(), rows.len());
        debug_assert_eq!(values.ncols(), cols.len());
        let row_index = rows
            .iter()
            .enumerate()
            .map(|(i, l)| (l.clone(), i))
            .collect();
        let col_index = cols
            .iter()
            .enumerate()
            .map(|(i, l)| (l.clone(), i))
            .collect();
        Self {
            rows,
            cols,
            row_index,
            col_index,
            values,
        }
    }

    pub fn row_labels(&self) -> &[String] {
        &self.rows
    }

    pub fn col_labels(&self) -> &[String] {
        &self.cols
    }

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    /// Value at a labeled cell, if both labels exist.
    pub fn get(&self, row: &str, col: &str) -> Option<f64> {
        let i = *self.row_index.get(row)?;
        let j = *self.col_index.get(col)?;
        Some(self.values[[i, j]])
    }

    /// Restricts this matrix to the requested row/column labels, in the
    /// requested order. Pure relabeling: no values are recomputed. A label
    /// absent from this matrix is an `InputError::MissingLabel`.
    pub fn select(&self, rows: &[String], cols: &[String]) -> Result<Self, InputError> {
        let row_ix = rows
            .iter()
            .map(|l| {
                self.row_index
                    .get(l)
                    .copied()
                    .ok_or_else(|| InputError::MissingLabel {
                        axis: "row",
                        label: l.clone(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let col_ix = cols
            .iter()
            .map(|l| {
                self.col_index
                    .get(l)
                    .copied()
                    .ok_or_else(|| InputError::MissingLabel {
                        axis: "column",
                        label: l.clone(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let values =
            Array2::from_shape_fn((rows.len(), cols.len()), |(i, j)| {
                self.values[[row_ix[i], col_ix[j]]]
            });
        Ok(Self::from_validated(rows.to_vec(), cols.to_vec(), values))
    }

    /// Rejects the matrix if any cell is NaN or infinite.
    pub fn require_finite(&self, name: &'static str) -> Result<(), InputError> {
        for ((i, j), &v) in self.values.indexed_iter() {
            if !v.is_finite() {
                return Err(InputError::NonFiniteValue {
                    matrix: name,
                    row: self.rows[i].clone(),
                    col: self.cols[j].clone(),
                });
            }
        }
        Ok(())
    }
}

/// What the batch does when the solver fails for a single gene.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// The failed gene's output rows stay at zero, the failure is recorded
    /// alongside the results, and the rest of the batch completes.
    RecordAndContinue,
    /// The first failure (by gene index) aborts the batch after all tasks
    /// have been gathered and broadcast resources released.
    Abort,
}

/// Scalar configuration for one inference run.
///
/// Precondition: prior-based predictor eligibility is detected by comparing
/// weight cells against `no_prior_weight`, so setting
/// `prior_weight == no_prior_weight` silently disables it. Both default to
/// 1.0, which is the prior-agnostic configuration.
#[derive(Debug, Clone)]
pub struct RegressionSettings {
    /// Maximum number of predictors the solver may retain per gene, and the
    /// per-row cap on relevance-ranked pool entries.
    pub n_sub: usize,
    /// Weight assigned where the prior matrix is nonzero.
    pub prior_weight: f64,
    /// Weight assigned where the prior matrix is zero.
    pub no_prior_weight: f64,
    /// Drop prior-based pool entries whose relevance score is zero.
    pub filter_priors_for_relevance: bool,
    pub on_solver_failure: FailurePolicy,
}

impl Default for RegressionSettings {
    fn default() -> Self {
        Self {
            n_sub: 10,
            prior_weight: 1.0,
            no_prior_weight: 1.0,
            filter_priors_for_relevance: false,
            on_solver_failure: FailurePolicy::RecordAndContinue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn new_rejects_shape_mismatch() {
        let err = LabeledMatrix::new(labels(&["a"]), labels(&["x", "y"]), array![[1.0]]);
        assert!(matches!(err, Err(InputError::ShapeMismatch { .. })));
    }

    #[test]
    fn new_rejects_duplicate_labels() {
        let err = LabeledMatrix::new(
            labels(&["a", "a"]),
            labels(&["x"]),
            array![[1.0], [2.0]],
        );
        assert!(matches!(err, Err(InputError::DuplicateLabel { .. })));
    }

    #[test]
    fn select_reorders_and_restricts() {
        let m = LabeledMatrix::new(
            labels(&["g1", "g2", "g3"]),
            labels(&["t1", "t2"]),
            array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]],
        )
        .unwrap();
        let s = m.select(&labels(&["g3", "g1"]), &labels(&["t2"])).unwrap();
        assert_eq!(s.values(), &array![[6.0], [2.0]]);
        assert_eq!(s.row_labels(), &labels(&["g3", "g1"])[..]);
    }

    #[test]
    fn select_reports_missing_label() {
        let m = LabeledMatrix::new(labels(&["g1"]), labels(&["t1"]), array![[1.0]]).unwrap();
        let err = m.select(&labels(&["g9"]), &labels(&["t1"]));
        assert!(matches!(
            err,
            Err(InputError::MissingLabel { axis: "row", .. })
        ));
    }

    #[test]
    fn require_finite_flags_the_offending_cell() {
        let m = LabeledMatrix::new(
            labels(&["g1", "g2"]),
            labels(&["t1"]),
            array![[1.0], [f64::NAN]],
        )
        .unwrap();
        match m.require_finite("design") {
            Err(InputError::NonFiniteValue { row, .. }) => assert_eq!(row, "g2"),
            other => panic!("expected NonFiniteValue, got {other:?}"),
        }
    }
}
