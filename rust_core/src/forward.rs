//! Forward models mapping an unknown to a predicted observation.

use crate::error::{Error, Result};
use nalgebra::{DMatrix, DVector};
use std::fmt;

/// Maps a parameter vector to predicted observations.
///
/// Models are shared read-only across chains, hence `Send + Sync`.
pub trait ForwardModel: fmt::Debug + Send + Sync {
    fn domain_dim(&self) -> usize;

    fn range_dim(&self) -> usize;

    fn forward(&self, x: &[f64]) -> Vec<f64>;

    /// Jacobian-transpose product `J(x)ᵀ · direction`. `None` when the model
    /// cannot differentiate itself.
    fn gradient(&self, _direction: &[f64], _x: &[f64]) -> Option<Vec<f64>> {
        None
    }

    fn has_gradient(&self) -> bool {
        false
    }

    /// The matrix `A` when the model is `x ↦ A x`.
    fn matrix(&self) -> Option<&DMatrix<f64>> {
        None
    }
}

/// Dense linear model `x ↦ A x`.
#[derive(Debug, Clone)]
pub struct LinearModel {
    matrix: DMatrix<f64>,
}

impl LinearModel {
    pub fn new(matrix: DMatrix<f64>) -> Result<Self> {
        if matrix.nrows() == 0 || matrix.ncols() == 0 {
            return Err(Error::Validation("linear model matrix must be non-empty".to_string()));
        }
        if matrix.iter().any(|v| !v.is_finite()) {
            return Err(Error::Validation("linear model matrix contains non-finite entries".to_string()));
        }
        Ok(Self { matrix })
    }

    pub fn from_row_slice(nrows: usize, ncols: usize, data: &[f64]) -> Result<Self> {
        if data.len() != nrows * ncols {
            return Err(Error::DimensionMismatch {
                name: "matrix".to_string(),
                expected: nrows * ncols,
                actual: data.len(),
            });
        }
        Self::new(DMatrix::from_row_slice(nrows, ncols, data))
    }

    pub fn identity(n: usize) -> Result<Self> {
        Self::new(DMatrix::identity(n, n))
    }
}

impl ForwardModel for LinearModel {
    fn domain_dim(&self) -> usize {
        self.matrix.ncols()
    }

    fn range_dim(&self) -> usize {
        self.matrix.nrows()
    }

    fn forward(&self, x: &[f64]) -> Vec<f64> {
        let y = &self.matrix * DVector::from_column_slice(x);
        y.as_slice().to_vec()
    }

    fn gradient(&self, direction: &[f64], _x: &[f64]) -> Option<Vec<f64>> {
        let g = self.matrix.tr_mul(&DVector::from_column_slice(direction));
        Some(g.as_slice().to_vec())
    }

    fn has_gradient(&self) -> bool {
        true
    }

    fn matrix(&self) -> Option<&DMatrix<f64>> {
        Some(&self.matrix)
    }
}
