//! Bayesian uncertainty quantification for linear inverse problems.
//!
//! Declare a forward model, a likelihood and priors in a [`JointModel`],
//! bind data, and draw posterior samples with [`PosteriorSampler`], which
//! picks a conjugate update or a gradient kernel for each unknown.

pub mod conjugate;
pub mod config;
pub mod density;
pub mod diagnostics;
pub mod distributions;
pub mod error;
pub mod forward;
pub mod geometry;
pub mod graph;
pub mod hmc;
pub mod nuts;
pub mod problem;
pub mod sampler;
pub mod samples;
pub mod testproblem;

pub use config::{GradientKernel, SamplerConfig};
pub use distributions::{Distribution, Gamma, Gaussian, Gmrf, Lmrf, Mean, Param};
pub use error::{Error, Result};
pub use forward::{ForwardModel, LinearModel};
pub use geometry::{BoundaryCondition, DifferenceOperator, Geometry};
pub use graph::{JointModel, Target};
pub use problem::{BayesianProblem, UqOptions, UqReport, VariableSummary};
pub use sampler::{sample, PosteriorSampler, SamplerKind, SamplingPlan};
pub use samples::{SampleSet, VariableSamples};
pub use testproblem::{Deconvolution1D, Deconvolution2D, Phantom1D, Phantom2D, Psf, TestProblem};

// Future: sparse difference and blur operators would let the exact Gaussian
// update scale past a few thousand unknowns.
