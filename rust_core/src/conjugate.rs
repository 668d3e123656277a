//! Closed-form conditional draws for conjugate prior/likelihood pairs.
//!
//! Both kernels draw exactly from the full conditional, so as Gibbs
//! updates they need no tuning and always accept.

use crate::distributions::{Distribution, Mean, Values};
use crate::error::{Error, Result};
use crate::graph::{JointModel, NodeId};
use nalgebra::{DMatrix, DVector};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution as _, Gamma as GammaDist, StandardNormal};

fn state_value<'a>(state: &'a Values, name: &str) -> Result<&'a [f64]> {
    state
        .get(name)
        .map(|v| v.as_slice())
        .ok_or_else(|| Error::UnknownVariable(name.to_string()))
}

// ── Gamma precision ─────────────────────────────────────────────────

/// Gamma prior on a precision or rate used by Gaussian, GMRF or LMRF
/// children. The conditional is `Gamma(a + Σ Δa, b + Σ Δb)`.
#[derive(Debug, Clone)]
pub struct ConjugateGamma {
    node: NodeId,
    shape: f64,
    rate: f64,
    children: Vec<NodeId>,
}

impl ConjugateGamma {
    /// Why `node` does not admit this update, or `None` if it does.
    pub fn unsupported_reason(model: &JointModel, node: NodeId) -> Option<String> {
        let var = model.node(node);
        if !matches!(var.distribution, Distribution::Gamma(_)) {
            return Some(format!("prior is {}, not Gamma", var.distribution.family()));
        }
        for child_id in model.children(node) {
            let child = model.node(child_id);
            let dist = &child.distribution;
            let as_scale = dist.scale_param().and_then(|p| p.var()) == Some(var.name.as_str());
            let as_mean = dist.mean().and_then(|m| m.var()) == Some(var.name.as_str());
            if !as_scale || as_mean {
                return Some(format!(
                    "'{}' uses '{}' other than as its precision/rate",
                    child.name, var.name
                ));
            }
        }
        None
    }

    pub fn new(model: &JointModel, node: NodeId) -> Result<Self> {
        if let Some(reason) = Self::unsupported_reason(model, node) {
            return Err(Error::UnsupportedCombination {
                name: model.node(node).name.clone(),
                reason,
            });
        }
        let (shape, rate) = match &model.node(node).distribution {
            Distribution::Gamma(g) => (g.shape, g.rate),
            _ => unreachable!("checked by unsupported_reason"),
        };
        Ok(Self {
            node,
            shape,
            rate,
            children: model.children(node),
        })
    }

    /// Shape and rate of the full conditional under `state`.
    pub fn conditional(&self, model: &JointModel, state: &Values) -> Result<(f64, f64)> {
        let mut shape = self.shape;
        let mut rate = self.rate;
        for &child_id in &self.children {
            let child = model.node(child_id);
            let value = state_value(state, &child.name)?;
            let (da, db) = child.distribution.scale_statistics(value, state)?;
            shape += da;
            rate += db;
        }
        Ok((shape, rate))
    }

    pub fn sample(&self, model: &JointModel, state: &Values, rng: &mut ChaCha8Rng) -> Result<Vec<f64>> {
        let (shape, rate) = self.conditional(model, state)?;
        let gamma = GammaDist::new(shape, 1.0 / rate).map_err(|e| {
            Error::Computation(format!(
                "invalid Gamma conditional for '{}' (shape={}, rate={}): {}",
                model.node(self.node).name,
                shape,
                rate,
                e
            ))
        })?;
        Ok(vec![gamma.sample(rng)])
    }
}

// ── Linear Gaussian ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct LinearChild {
    node: NodeId,
    /// `Aᵀ S A`
    gram: DMatrix<f64>,
    /// `Aᵀ S`
    at_s: DMatrix<f64>,
}

/// Gaussian or GMRF prior with Gaussian-type children whose mean is linear
/// in the variable. The conditional is `N(Q⁻¹ b, Q⁻¹)` with
/// `Q = τ₀ S₀ + Σ τ_c Aᵀ S_c A` and `b = τ₀ S₀ μ₀ + Σ τ_c Aᵀ S_c y_c`.
#[derive(Debug, Clone)]
pub struct LinearGaussian {
    node: NodeId,
    prior_structure: DMatrix<f64>,
    children: Vec<LinearChild>,
}

impl LinearGaussian {
    pub fn unsupported_reason(model: &JointModel, node: NodeId) -> Option<String> {
        let var = model.node(node);
        if var.distribution.gaussian_structure().is_none() {
            return Some(format!(
                "prior is {}, not Gaussian or GMRF",
                var.distribution.family()
            ));
        }
        for child_id in model.children(node) {
            let child = model.node(child_id);
            let dist = &child.distribution;
            if dist.scale_param().and_then(|p| p.var()) == Some(var.name.as_str()) {
                return Some(format!("'{}' uses '{}' as a precision", child.name, var.name));
            }
            if !matches!(dist, Distribution::Gaussian(_) | Distribution::Gmrf(_)) {
                return Some(format!(
                    "'{}' is {}, not Gaussian or GMRF",
                    child.name,
                    dist.family()
                ));
            }
            match dist.mean() {
                Some(Mean::Forward { model: fwd, .. }) if fwd.matrix().is_some() => {}
                _ => {
                    return Some(format!(
                        "'{}' depends on '{}' through a non-linear forward model",
                        child.name, var.name
                    ))
                }
            }
        }
        None
    }

    pub fn new(model: &JointModel, node: NodeId) -> Result<Self> {
        let var = model.node(node);
        if let Some(reason) = Self::unsupported_reason(model, node) {
            return Err(Error::UnsupportedCombination {
                name: var.name.clone(),
                reason,
            });
        }
        let prior_structure = var
            .distribution
            .gaussian_structure()
            .ok_or_else(|| Error::Computation("missing Gaussian structure".to_string()))?;

        let mut children = Vec::new();
        for child_id in model.children(node) {
            let dist = &model.node(child_id).distribution;
            let a = match dist.mean() {
                Some(Mean::Forward { model: fwd, .. }) => fwd.matrix().cloned(),
                _ => None,
            }
            .ok_or_else(|| Error::Computation("child mean is not a linear model".to_string()))?;
            let s = dist
                .gaussian_structure()
                .ok_or_else(|| Error::Computation("child is not Gaussian".to_string()))?;
            let at_s = a.transpose() * s;
            let gram = &at_s * &a;
            children.push(LinearChild {
                node: child_id,
                gram,
                at_s,
            });
        }

        Ok(Self {
            node,
            prior_structure,
            children,
        })
    }

    /// Precision matrix and linear term of the full conditional.
    pub fn conditional(&self, model: &JointModel, state: &Values) -> Result<(DMatrix<f64>, DVector<f64>)> {
        let prior = &model.node(self.node).distribution;
        let dim = prior.dim();
        let tau0 = scale_of(prior, state)?;
        let mu0 = prior
            .mean()
            .ok_or_else(|| Error::Computation("prior has no mean".to_string()))?
            .resolve(dim, state)?;

        let mut q = &self.prior_structure * tau0;
        let mut b = &self.prior_structure * DVector::from_vec(mu0) * tau0;

        for child in &self.children {
            let c = model.node(child.node);
            let tau = scale_of(&c.distribution, state)?;
            let y = DVector::from_column_slice(state_value(state, &c.name)?);
            q += &child.gram * tau;
            b += &child.at_s * y * tau;
        }
        Ok((q, b))
    }

    pub fn sample(&self, model: &JointModel, state: &Values, rng: &mut ChaCha8Rng) -> Result<Vec<f64>> {
        let (q, b) = self.conditional(model, state)?;
        let name = &model.node(self.node).name;
        let chol = q.cholesky().ok_or_else(|| {
            log::warn!("conditional precision of '{}' is not positive definite", name);
            Error::Computation(format!(
                "conditional precision of '{}' is not positive definite",
                name
            ))
        })?;
        let mean = chol.solve(&b);
        let z = DVector::from_fn(mean.len(), |_, _| {
            let v: f64 = StandardNormal.sample(rng);
            v
        });
        // x = mean + L⁻ᵀ z has covariance (L Lᵀ)⁻¹ = Q⁻¹.
        let noise = chol
            .l()
            .transpose()
            .solve_upper_triangular(&z)
            .ok_or_else(|| Error::Computation(format!("triangular solve failed for '{}'", name)))?;
        Ok((mean + noise).as_slice().to_vec())
    }
}

fn scale_of(dist: &Distribution, state: &Values) -> Result<f64> {
    dist.scale_param()
        .ok_or_else(|| Error::Computation(format!("{} has no precision", dist.family())))?
        .resolve(state)
}
