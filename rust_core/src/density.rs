//! Log densities seen by the gradient-based kernels.
//!
//! A [`ConditionalDensity`] is the full conditional of one variable given
//! the current values of every other variable: its own prior plus every
//! factor in which it appears as a parent. Positive variables are sampled
//! as `q = ln x`, with the Jacobian added to the log density.

use crate::distributions::{Env, Overlay, Support, Values};
use crate::error::{Error, Result};
use crate::graph::{JointModel, NodeId};

/// A differentiable log density on an unconstrained space.
pub trait LogDensity {
    fn dim(&self) -> usize;

    /// Log density and its gradient at `q`.
    fn logp_grad(&self, q: &[f64]) -> Result<(f64, Vec<f64>)>;

    fn logp(&self, q: &[f64]) -> Result<f64> {
        Ok(self.logp_grad(q)?.0)
    }
}

/// Map between the model value of a variable and the sampler's space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    Identity,
    /// `x = exp(q)`, `log|dx/dq| = q`.
    Log,
}

impl Transform {
    pub fn for_support(support: Support) -> Self {
        match support {
            Support::Real => Transform::Identity,
            Support::Positive => Transform::Log,
        }
    }

    pub fn to_model(&self, q: &[f64]) -> Vec<f64> {
        match self {
            Transform::Identity => q.to_vec(),
            Transform::Log => q.iter().map(|v| v.exp()).collect(),
        }
    }

    pub fn to_unconstrained(&self, x: &[f64]) -> Vec<f64> {
        match self {
            Transform::Identity => x.to_vec(),
            Transform::Log => x.iter().map(|v| v.ln()).collect(),
        }
    }
}

/// Full conditional of `node` under `state`.
pub struct ConditionalDensity<'a> {
    model: &'a JointModel,
    node: NodeId,
    children: Vec<NodeId>,
    state: &'a Values,
    transform: Transform,
}

impl<'a> ConditionalDensity<'a> {
    /// `state` must hold a value for every variable in the model.
    pub fn new(model: &'a JointModel, node: NodeId, state: &'a Values) -> Result<Self> {
        for var in model.variables() {
            if !state.contains_key(&var.name) {
                return Err(Error::UnknownVariable(var.name.clone()));
            }
        }
        let var = model.node(node);
        Ok(Self {
            model,
            node,
            children: model.children(node),
            state,
            transform: Transform::for_support(var.distribution.support()),
        })
    }

    pub fn transform(&self) -> Transform {
        self.transform
    }
}

impl LogDensity for ConditionalDensity<'_> {
    fn dim(&self) -> usize {
        self.model.node(self.node).dim()
    }

    fn logp_grad(&self, q: &[f64]) -> Result<(f64, Vec<f64>)> {
        let var = self.model.node(self.node);
        let x = self.transform.to_model(q);
        let env = Overlay {
            base: self.state as &dyn Env,
            name: &var.name,
            value: &x,
        };

        let mut logp = var.distribution.logpdf(&x, &env)?;
        let mut grad = var.distribution.grad(&x, &env)?;

        for &child_id in &self.children {
            let child = self.model.node(child_id);
            let value = env
                .value(&child.name)
                .ok_or_else(|| Error::UnknownVariable(child.name.clone()))?;
            logp += child.distribution.logpdf(value, &env)?;
            let g = child.distribution.grad_wrt(value, &env, &var.name)?;
            for (acc, gi) in grad.iter_mut().zip(g) {
                *acc += gi;
            }
        }

        if self.transform == Transform::Log {
            // Chain rule through x = exp(q), plus d/dq of the Jacobian q.
            for ((gi, &xi), &qi) in grad.iter_mut().zip(x.iter()).zip(q.iter()) {
                *gi = *gi * xi + 1.0;
                logp += qi;
            }
        }

        Ok((logp, grad))
    }
}
