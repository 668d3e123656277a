//! Discretization geometries and first-order difference operators.
//!
//! Images are vectorized row-major: pixel `(r, c)` lives at `r * cols + c`.

use crate::error::{Error, Result};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

/// Shape of an unknown signal or image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Geometry {
    Continuous1D(usize),
    Image2D { rows: usize, cols: usize },
}

impl Geometry {
    pub fn dim(&self) -> usize {
        match *self {
            Geometry::Continuous1D(n) => n,
            Geometry::Image2D { rows, cols } => rows * cols,
        }
    }

    /// Cell-centred grid points on [0, 1] along one axis.
    pub fn grid(n: usize) -> Vec<f64> {
        let h = 1.0 / n as f64;
        (0..n).map(|i| (i as f64 + 0.5) * h).collect()
    }
}

/// How differences treat the values just outside the domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoundaryCondition {
    /// Values outside the domain are zero. Full rank.
    #[default]
    Zero,
    /// The domain wraps around. Constants are in the null space.
    Periodic,
    /// No difference across the boundary. Constants are in the null space.
    Neumann,
}

/// Sparse first-order difference operator `D`.
///
/// Each row is a short list of `(column, coefficient)` pairs. For images
/// the horizontal and vertical differences are stacked (anisotropic).
#[derive(Debug, Clone)]
pub struct DifferenceOperator {
    geometry: Geometry,
    bc: BoundaryCondition,
    rows: Vec<Vec<(usize, f64)>>,
}

impl DifferenceOperator {
    pub fn new(geometry: Geometry, bc: BoundaryCondition) -> Result<Self> {
        let mut rows = Vec::new();
        match geometry {
            Geometry::Continuous1D(n) => {
                check_axis(n, bc)?;
                push_line(&mut rows, n, bc, |i| i);
            }
            Geometry::Image2D { rows: nr, cols: nc } => {
                check_axis(nr, bc)?;
                check_axis(nc, bc)?;
                for r in 0..nr {
                    push_line(&mut rows, nc, bc, |c| r * nc + c);
                }
                for c in 0..nc {
                    push_line(&mut rows, nr, bc, |r| r * nc + c);
                }
            }
        }
        Ok(Self { geometry, bc, rows })
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn boundary_condition(&self) -> BoundaryCondition {
        self.bc
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn num_cols(&self) -> usize {
        self.geometry.dim()
    }

    /// Rank of `D` (equivalently of `DᵀD`). The grid graph is connected, so
    /// only the boundary condition matters.
    pub fn rank(&self) -> usize {
        match self.bc {
            BoundaryCondition::Zero => self.num_cols(),
            BoundaryCondition::Periodic | BoundaryCondition::Neumann => self.num_cols() - 1,
        }
    }

    pub fn apply(&self, x: &[f64]) -> Vec<f64> {
        self.rows
            .iter()
            .map(|row| row.iter().map(|&(j, c)| c * x[j]).sum())
            .collect()
    }

    pub fn apply_transpose(&self, r: &[f64]) -> Vec<f64> {
        let mut out = vec![0.0; self.num_cols()];
        for (row, &ri) in self.rows.iter().zip(r.iter()) {
            for &(j, c) in row {
                out[j] += c * ri;
            }
        }
        out
    }

    pub fn to_matrix(&self) -> DMatrix<f64> {
        let mut m = DMatrix::zeros(self.num_rows(), self.num_cols());
        for (i, row) in self.rows.iter().enumerate() {
            for &(j, c) in row {
                m[(i, j)] += c;
            }
        }
        m
    }

    /// `DᵀD` as a dense matrix.
    pub fn structure_matrix(&self) -> DMatrix<f64> {
        let d = self.to_matrix();
        d.transpose() * d
    }
}

fn check_axis(n: usize, bc: BoundaryCondition) -> Result<()> {
    if n == 0 || (n < 2 && bc != BoundaryCondition::Zero) {
        return Err(Error::Validation(format!(
            "difference operator needs at least {} points per axis with {:?} boundary, got {}",
            if bc == BoundaryCondition::Zero { 1 } else { 2 },
            bc,
            n
        )));
    }
    Ok(())
}

/// Append the differences along one line of `n` points; `idx` maps the
/// position on the line to the global index.
fn push_line(rows: &mut Vec<Vec<(usize, f64)>>, n: usize, bc: BoundaryCondition, idx: impl Fn(usize) -> usize) {
    match bc {
        BoundaryCondition::Zero => {
            rows.push(vec![(idx(0), 1.0)]);
            for i in 1..n {
                rows.push(vec![(idx(i), 1.0), (idx(i - 1), -1.0)]);
            }
        }
        BoundaryCondition::Periodic => {
            rows.push(vec![(idx(0), 1.0), (idx(n - 1), -1.0)]);
            for i in 1..n {
                rows.push(vec![(idx(i), 1.0), (idx(i - 1), -1.0)]);
            }
        }
        BoundaryCondition::Neumann => {
            for i in 0..n - 1 {
                rows.push(vec![(idx(i + 1), 1.0), (idx(i), -1.0)]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_bc_1d() {
        let d = DifferenceOperator::new(Geometry::Continuous1D(4), BoundaryCondition::Zero).unwrap();
        assert_eq!(d.num_rows(), 4);
        assert_eq!(d.rank(), 4);
        assert_eq!(d.apply(&[1.0, 3.0, 6.0, 10.0]), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_constants_in_null_space() {
        for bc in [BoundaryCondition::Periodic, BoundaryCondition::Neumann] {
            let d = DifferenceOperator::new(Geometry::Image2D { rows: 3, cols: 4 }, bc).unwrap();
            let out = d.apply(&[2.5; 12]);
            assert!(out.iter().all(|v| v.abs() < 1e-12), "{:?}: {:?}", bc, out);
            assert_eq!(d.rank(), 11);
        }
    }

    #[test]
    fn test_transpose_matches_matrix() {
        let d = DifferenceOperator::new(Geometry::Image2D { rows: 3, cols: 2 }, BoundaryCondition::Zero)
            .unwrap();
        let r: Vec<f64> = (0..d.num_rows()).map(|i| (i as f64 * 0.7).sin()).collect();
        let dense = d.to_matrix().transpose() * nalgebra::DVector::from_vec(r.clone());
        let sparse = d.apply_transpose(&r);
        for (a, b) in dense.iter().zip(sparse.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn test_rejects_degenerate_periodic() {
        assert!(DifferenceOperator::new(Geometry::Continuous1D(1), BoundaryCondition::Periodic).is_err());
        assert!(DifferenceOperator::new(Geometry::Continuous1D(0), BoundaryCondition::Zero).is_err());
    }
}
