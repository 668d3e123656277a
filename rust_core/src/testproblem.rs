//! Synthetic deconvolution problems: a phantom, a blurring operator and
//! noisy data generated from them.
//!
//! The convolution matrix on a grid of `n` cell-centred points with spacing
//! `h = 1/n` is `A[i][j] = h · k(tᵢ − tⱼ)` (zero boundary). 2D blurs are
//! separable, `A = A_rows ⊗ A_cols`, acting on row-major images.

use crate::error::{Error, Result};
use crate::forward::{ForwardModel, LinearModel};
use crate::geometry::Geometry;
use nalgebra::DMatrix;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use statrs::function::gamma::ln_gamma;
use std::f64::consts::PI;
use std::sync::Arc;

/// Exact signals for 1D problems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Phantom1D {
    #[default]
    Gauss,
    Sinc,
    Square,
    Hat,
    Bumps,
    PiecewiseConstant,
}

impl Phantom1D {
    pub fn eval(&self, t: f64) -> f64 {
        match self {
            Phantom1D::Gauss => (-(t - 0.5).powi(2) / (2.0 * 0.1 * 0.1)).exp(),
            Phantom1D::Sinc => {
                let u = 10.0 * (t - 0.5);
                if u.abs() < 1e-12 {
                    1.0
                } else {
                    (PI * u).sin() / (PI * u)
                }
            }
            Phantom1D::Square => indicator(t, 0.3, 0.7),
            Phantom1D::Hat => (1.0 - (t - 0.5).abs() / 0.25).max(0.0),
            Phantom1D::Bumps => [(0.2, 0.8, 0.03), (0.45, 1.0, 0.05), (0.75, 0.6, 0.02)]
                .iter()
                .map(|&(c, a, w)| a * (-(t - c).powi(2) / (2.0 * w * w)).exp())
                .sum(),
            Phantom1D::PiecewiseConstant => {
                0.75 * indicator(t, 0.1, 0.3) + 0.25 * indicator(t, 0.3, 0.5)
                    + indicator(t, 0.6, 0.7)
                    - 0.5 * indicator(t, 0.8, 0.9)
            }
        }
    }
}

fn indicator(t: f64, lo: f64, hi: f64) -> f64 {
    if t >= lo && t < hi {
        1.0
    } else {
        0.0
    }
}

/// Exact images for 2D problems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Phantom2D {
    #[default]
    Square,
    Disk,
    Checkerboard,
}

impl Phantom2D {
    /// Value at row coordinate `s` and column coordinate `t`.
    pub fn eval(&self, s: f64, t: f64) -> f64 {
        match self {
            Phantom2D::Square => indicator(s, 0.3, 0.7) * indicator(t, 0.3, 0.7),
            Phantom2D::Disk => {
                if (s - 0.5).powi(2) + (t - 0.5).powi(2) <= 0.25 * 0.25 {
                    1.0
                } else {
                    0.0
                }
            }
            Phantom2D::Checkerboard => {
                let blocks = (4.0 * s).floor() as i64 + (4.0 * t).floor() as i64;
                (blocks % 2) as f64
            }
        }
    }
}

/// Point spread function of the blur, on a domain of unit length.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Psf {
    Gauss { sigma: f64 },
    /// Heavy-tailed `(1 + (u/σ)²)^(−β)`.
    Moffat { sigma: f64, beta: f64 },
    /// Uniform blur of half-width `radius`.
    Defocus { radius: f64 },
}

impl Default for Psf {
    fn default() -> Self {
        Psf::Gauss { sigma: 0.05 }
    }
}

impl Psf {
    fn validate(&self) -> Result<()> {
        let ok = match *self {
            Psf::Gauss { sigma } => sigma > 0.0,
            Psf::Moffat { sigma, beta } => sigma > 0.0 && beta > 0.5,
            Psf::Defocus { radius } => radius > 0.0,
        };
        if ok {
            Ok(())
        } else {
            Err(Error::Validation(format!("invalid point spread function {:?}", self)))
        }
    }

    /// Normalized kernel value at offset `u`.
    pub fn eval(&self, u: f64) -> f64 {
        match *self {
            Psf::Gauss { sigma } => (-u * u / (2.0 * sigma * sigma)).exp() / (sigma * (2.0 * PI).sqrt()),
            Psf::Moffat { sigma, beta } => {
                let log_norm = ln_gamma(beta) - ln_gamma(beta - 0.5) - (sigma * PI.sqrt()).ln();
                (log_norm - beta * (1.0 + (u / sigma).powi(2)).ln()).exp()
            }
            Psf::Defocus { radius } => {
                if u.abs() <= radius {
                    0.5 / radius
                } else {
                    0.0
                }
            }
        }
    }
}

/// Convolution matrix on `n` cell-centred points.
pub fn convolution_matrix(n: usize, psf: &Psf) -> DMatrix<f64> {
    let t = Geometry::grid(n);
    let h = 1.0 / n as f64;
    DMatrix::from_fn(n, n, |i, j| h * psf.eval(t[i] - t[j]))
}

/// A generated problem: the blur, noisy data and the ground truth.
#[derive(Debug, Clone)]
pub struct TestProblem {
    pub model: Arc<LinearModel>,
    pub data: Vec<f64>,
    pub exact_solution: Vec<f64>,
    pub exact_data: Vec<f64>,
    pub noise_std: f64,
    pub geometry: Geometry,
}

impl TestProblem {
    /// Noise precision `1/σ²` matching the generated data.
    pub fn noise_precision(&self) -> f64 {
        1.0 / (self.noise_std * self.noise_std)
    }

    fn generate(
        matrix: DMatrix<f64>,
        exact_solution: Vec<f64>,
        noise_std: f64,
        seed: u64,
        geometry: Geometry,
    ) -> Result<Self> {
        if !(noise_std > 0.0 && noise_std.is_finite()) {
            return Err(Error::Validation(format!(
                "noise_std must be positive, got {}",
                noise_std
            )));
        }
        let model = Arc::new(LinearModel::new(matrix)?);
        let exact_data = model.forward(&exact_solution);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let data = exact_data
            .iter()
            .map(|b| {
                let e: f64 = StandardNormal.sample(&mut rng);
                b + noise_std * e
            })
            .collect();
        Ok(Self {
            model,
            data,
            exact_solution,
            exact_data,
            noise_std,
            geometry,
        })
    }
}

/// 1D deconvolution of a signal on `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Deconvolution1D {
    pub dim: usize,
    pub phantom: Phantom1D,
    pub psf: Psf,
    pub noise_std: f64,
    pub seed: u64,
}

impl Default for Deconvolution1D {
    fn default() -> Self {
        Self {
            dim: 128,
            phantom: Phantom1D::Gauss,
            psf: Psf::default(),
            noise_std: 0.01,
            seed: 0,
        }
    }
}

impl Deconvolution1D {
    pub fn build(&self) -> Result<TestProblem> {
        if self.dim < 2 {
            return Err(Error::Validation(format!("dim must be at least 2, got {}", self.dim)));
        }
        self.psf.validate()?;
        let exact: Vec<f64> = Geometry::grid(self.dim)
            .into_iter()
            .map(|t| self.phantom.eval(t))
            .collect();
        log::debug!(
            "generating 1D deconvolution: n={}, {:?}, {:?}",
            self.dim,
            self.phantom,
            self.psf
        );
        TestProblem::generate(
            convolution_matrix(self.dim, &self.psf),
            exact,
            self.noise_std,
            self.seed,
            Geometry::Continuous1D(self.dim),
        )
    }
}

/// 2D deconvolution of an image on `[0, 1]²` with a separable Gaussian blur.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Deconvolution2D {
    pub rows: usize,
    pub cols: usize,
    pub phantom: Phantom2D,
    pub sigma: f64,
    pub noise_std: f64,
    pub seed: u64,
}

impl Default for Deconvolution2D {
    fn default() -> Self {
        Self {
            rows: 32,
            cols: 32,
            phantom: Phantom2D::Square,
            sigma: 0.05,
            noise_std: 0.01,
            seed: 0,
        }
    }
}

impl Deconvolution2D {
    pub fn build(&self) -> Result<TestProblem> {
        if self.rows < 2 || self.cols < 2 {
            return Err(Error::Validation(format!(
                "image must be at least 2x2, got {}x{}",
                self.rows, self.cols
            )));
        }
        let psf = Psf::Gauss { sigma: self.sigma };
        psf.validate()?;

        let s = Geometry::grid(self.rows);
        let t = Geometry::grid(self.cols);
        let mut exact = Vec::with_capacity(self.rows * self.cols);
        for &si in &s {
            for &tj in &t {
                exact.push(self.phantom.eval(si, tj));
            }
        }

        let a_rows = convolution_matrix(self.rows, &psf);
        let a_cols = convolution_matrix(self.cols, &psf);
        TestProblem::generate(
            a_rows.kronecker(&a_cols),
            exact,
            self.noise_std,
            self.seed,
            Geometry::Image2D {
                rows: self.rows,
                cols: self.cols,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_psf_kernels_integrate_to_one() {
        for psf in [
            Psf::Gauss { sigma: 0.05 },
            Psf::Moffat { sigma: 0.05, beta: 3.0 },
            Psf::Defocus { radius: 0.1 },
        ] {
            // Midpoint rule on a wide window.
            let n = 40_000;
            let h = 4.0 / n as f64;
            let total: f64 = (0..n).map(|i| h * psf.eval(-2.0 + (i as f64 + 0.5) * h)).sum();
            assert!((total - 1.0).abs() < 1e-3, "{:?} integrates to {}", psf, total);
        }
    }

    #[test]
    fn test_1d_problem_shapes_and_noise() {
        let problem = Deconvolution1D {
            dim: 64,
            phantom: Phantom1D::Square,
            ..Deconvolution1D::default()
        }
        .build()
        .unwrap();
        assert_eq!(problem.model.domain_dim(), 64);
        assert_eq!(problem.data.len(), 64);
        assert_eq!(problem.geometry, Geometry::Continuous1D(64));
        assert_eq!(problem.model.forward(&problem.exact_solution), problem.exact_data);
        assert_relative_eq!(problem.noise_precision(), 1e4, max_relative = 1e-12);

        let resid: f64 = problem
            .data
            .iter()
            .zip(&problem.exact_data)
            .map(|(d, b)| (d - b).powi(2))
            .sum::<f64>()
            / 64.0;
        assert!(resid.sqrt() > 0.005 && resid.sqrt() < 0.02, "noise level {}", resid.sqrt());
    }

    #[test]
    fn test_same_seed_same_data() {
        let cfg = Deconvolution1D {
            dim: 16,
            seed: 3,
            ..Deconvolution1D::default()
        };
        assert_eq!(cfg.build().unwrap().data, cfg.build().unwrap().data);
        let other = Deconvolution1D { seed: 4, ..cfg.clone() };
        assert_ne!(other.build().unwrap().data, cfg.build().unwrap().data);
    }

    #[test]
    fn test_2d_blur_is_separable() {
        let problem = Deconvolution2D {
            rows: 6,
            cols: 4,
            phantom: Phantom2D::Checkerboard,
            ..Deconvolution2D::default()
        }
        .build()
        .unwrap();
        assert_eq!(problem.exact_solution.len(), 24);

        // Blur rows then columns of the image directly.
        let a_r = convolution_matrix(6, &Psf::Gauss { sigma: 0.05 });
        let a_c = convolution_matrix(4, &Psf::Gauss { sigma: 0.05 });
        let x = DMatrix::from_row_slice(6, 4, &problem.exact_solution);
        let blurred = &a_r * x * a_c.transpose();
        for r in 0..6 {
            for c in 0..4 {
                assert_relative_eq!(problem.exact_data[r * 4 + c], blurred[(r, c)], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let bad_psf = Deconvolution1D {
            psf: Psf::Moffat { sigma: 0.05, beta: 0.4 },
            ..Deconvolution1D::default()
        };
        assert!(matches!(bad_psf.build(), Err(Error::Validation(_))));
        let no_noise = Deconvolution1D {
            noise_std: 0.0,
            ..Deconvolution1D::default()
        };
        assert!(no_noise.build().is_err());
    }
}
