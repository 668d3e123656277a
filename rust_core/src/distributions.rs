use crate::error::{Error, Result};
use crate::forward::ForwardModel;
use crate::geometry::{BoundaryCondition, DifferenceOperator, Geometry};
use nalgebra::DMatrix;
use statrs::function::gamma::ln_gamma;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

const LN_2PI: f64 = 1.837_877_066_409_345_3;

/// Current values of named variables.
pub type Values = HashMap<String, Vec<f64>>;

/// Read access to variable values while evaluating a density.
pub trait Env {
    fn value(&self, name: &str) -> Option<&[f64]>;
}

impl Env for Values {
    fn value(&self, name: &str) -> Option<&[f64]> {
        self.get(name).map(|v| v.as_slice())
    }
}

/// An environment with one variable replaced by a candidate value.
pub struct Overlay<'a> {
    pub base: &'a dyn Env,
    pub name: &'a str,
    pub value: &'a [f64],
}

impl Env for Overlay<'_> {
    fn value(&self, name: &str) -> Option<&[f64]> {
        if name == self.name {
            Some(self.value)
        } else {
            self.base.value(name)
        }
    }
}

fn lookup<'e>(env: &'e dyn Env, name: &str) -> Result<&'e [f64]> {
    env.value(name)
        .ok_or_else(|| Error::UnknownVariable(name.to_string()))
}

// ── Parameters ──────────────────────────────────────────────────────

/// Scalar distribution parameter: a constant or another variable.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Const(f64),
    Var(String),
}

impl Param {
    pub fn resolve(&self, env: &dyn Env) -> Result<f64> {
        match self {
            Param::Const(c) => Ok(*c),
            Param::Var(name) => lookup(env, name)?
                .first()
                .copied()
                .ok_or_else(|| Error::DimensionMismatch {
                    name: name.clone(),
                    expected: 1,
                    actual: 0,
                }),
        }
    }

    pub fn var(&self) -> Option<&str> {
        match self {
            Param::Var(name) => Some(name),
            Param::Const(_) => None,
        }
    }
}

impl From<f64> for Param {
    fn from(v: f64) -> Self {
        Param::Const(v)
    }
}

impl From<&str> for Param {
    fn from(name: &str) -> Self {
        Param::Var(name.to_string())
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Param::Const(c) => write!(f, "{}", c),
            Param::Var(name) => write!(f, "{}", name),
        }
    }
}

/// Location parameter of a vector distribution.
#[derive(Debug, Clone)]
pub enum Mean {
    Zero,
    Scalar(f64),
    Vector(Vec<f64>),
    /// `model(input)`, where `input` is another variable.
    Forward {
        model: Arc<dyn ForwardModel>,
        input: String,
    },
}

impl Mean {
    pub fn forward(model: Arc<dyn ForwardModel>, input: &str) -> Self {
        Mean::Forward {
            model,
            input: input.to_string(),
        }
    }

    pub fn resolve(&self, dim: usize, env: &dyn Env) -> Result<Vec<f64>> {
        match self {
            Mean::Zero => Ok(vec![0.0; dim]),
            Mean::Scalar(c) => Ok(vec![*c; dim]),
            Mean::Vector(v) => Ok(v.clone()),
            Mean::Forward { model, input } => Ok(model.forward(lookup(env, input)?)),
        }
    }

    pub fn var(&self) -> Option<&str> {
        match self {
            Mean::Forward { input, .. } => Some(input),
            _ => None,
        }
    }
}

impl From<f64> for Mean {
    fn from(v: f64) -> Self {
        Mean::Scalar(v)
    }
}

impl From<Vec<f64>> for Mean {
    fn from(v: Vec<f64>) -> Self {
        Mean::Vector(v)
    }
}

impl fmt::Display for Mean {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mean::Zero => write!(f, "0"),
            Mean::Scalar(c) => write!(f, "{}", c),
            Mean::Vector(v) => write!(f, "vec[{}]", v.len()),
            Mean::Forward { input, .. } => write!(f, "A({})", input),
        }
    }
}

/// Support of a distribution, used to pick the sampling transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Support {
    Real,
    Positive,
}

// ── Gaussian (iid precision) ────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Gaussian {
    pub mean: Mean,
    pub precision: Param,
    pub dim: usize,
}

impl Gaussian {
    /// `N(mean, precision⁻¹ I)` over `dim` components.
    pub fn new(mean: impl Into<Mean>, precision: impl Into<Param>, dim: usize) -> Distribution {
        Distribution::Gaussian(Self {
            mean: mean.into(),
            precision: precision.into(),
            dim,
        })
    }
}

// ── Gamma (x > 0) ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Gamma {
    pub shape: f64,
    pub rate: f64,
}

impl Gamma {
    pub fn new(shape: f64, rate: f64) -> Distribution {
        Distribution::Gamma(Self { shape, rate })
    }
}

// ── GMRF (Gaussian on first-order differences) ─────────────────────

#[derive(Debug, Clone)]
pub struct Gmrf {
    pub mean: Mean,
    pub precision: Param,
    pub op: DifferenceOperator,
}

impl Gmrf {
    pub fn new(
        mean: impl Into<Mean>,
        precision: impl Into<Param>,
        geometry: Geometry,
        bc: BoundaryCondition,
    ) -> Result<Distribution> {
        Ok(Distribution::Gmrf(Self {
            mean: mean.into(),
            precision: precision.into(),
            op: DifferenceOperator::new(geometry, bc)?,
        }))
    }
}

// ── LMRF (Laplace on first-order differences) ──────────────────────

/// Parameterized by the rate `λ = 1 / scale`, so a Gamma prior on `λ` is
/// conjugate.
#[derive(Debug, Clone)]
pub struct Lmrf {
    pub location: Mean,
    pub rate: Param,
    pub op: DifferenceOperator,
}

impl Lmrf {
    pub fn new(
        location: impl Into<Mean>,
        rate: impl Into<Param>,
        geometry: Geometry,
        bc: BoundaryCondition,
    ) -> Result<Distribution> {
        Ok(Distribution::Lmrf(Self {
            location: location.into(),
            rate: rate.into(),
            op: DifferenceOperator::new(geometry, bc)?,
        }))
    }
}

// ── Distribution ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum Distribution {
    Gaussian(Gaussian),
    Gamma(Gamma),
    Gmrf(Gmrf),
    Lmrf(Lmrf),
}

impl Distribution {
    pub fn family(&self) -> &'static str {
        match self {
            Distribution::Gaussian(_) => "Gaussian",
            Distribution::Gamma(_) => "Gamma",
            Distribution::Gmrf(_) => "GMRF",
            Distribution::Lmrf(_) => "LMRF",
        }
    }

    pub fn dim(&self) -> usize {
        match self {
            Distribution::Gaussian(d) => d.dim,
            Distribution::Gamma(_) => 1,
            Distribution::Gmrf(d) => d.op.num_cols(),
            Distribution::Lmrf(d) => d.op.num_cols(),
        }
    }

    pub fn support(&self) -> Support {
        match self {
            Distribution::Gamma(_) => Support::Positive,
            _ => Support::Real,
        }
    }

    pub fn mean(&self) -> Option<&Mean> {
        match self {
            Distribution::Gaussian(d) => Some(&d.mean),
            Distribution::Gmrf(d) => Some(&d.mean),
            Distribution::Lmrf(d) => Some(&d.location),
            Distribution::Gamma(_) => None,
        }
    }

    /// Precision (Gaussian, GMRF) or rate (LMRF).
    pub fn scale_param(&self) -> Option<&Param> {
        match self {
            Distribution::Gaussian(d) => Some(&d.precision),
            Distribution::Gmrf(d) => Some(&d.precision),
            Distribution::Lmrf(d) => Some(&d.rate),
            Distribution::Gamma(_) => None,
        }
    }

    /// Names of the variables this distribution is conditioned on.
    pub fn dependencies(&self) -> Vec<&str> {
        let mut deps = Vec::new();
        if let Some(name) = self.mean().and_then(|m| m.var()) {
            deps.push(name);
        }
        if let Some(name) = self.scale_param().and_then(|p| p.var()) {
            if !deps.contains(&name) {
                deps.push(name);
            }
        }
        deps
    }

    /// Checks constant parameters. `owner` names the variable for messages.
    pub fn validate(&self, owner: &str) -> Result<()> {
        let bad = |what: &str, v: f64| {
            Err(Error::Validation(format!(
                "{} for '{}' must be positive and finite, got {}",
                what, owner, v
            )))
        };
        if let Distribution::Gamma(g) = self {
            if !(g.shape > 0.0 && g.shape.is_finite()) {
                return bad("Gamma shape", g.shape);
            }
            if !(g.rate > 0.0 && g.rate.is_finite()) {
                return bad("Gamma rate", g.rate);
            }
        }
        if let Some(Param::Const(c)) = self.scale_param() {
            if !(*c > 0.0 && c.is_finite()) {
                return bad("precision/rate", *c);
            }
        }
        if self.dim() == 0 {
            return Err(Error::Validation(format!("'{}' has zero dimension", owner)));
        }
        Ok(())
    }

    pub fn logpdf(&self, x: &[f64], env: &dyn Env) -> Result<f64> {
        if let Distribution::Gamma(g) = self {
            let v = x[0];
            if v <= 0.0 {
                return Ok(f64::NEG_INFINITY);
            }
            return Ok(g.shape * g.rate.ln() - ln_gamma(g.shape) + (g.shape - 1.0) * v.ln()
                - g.rate * v);
        }
        let tau = self.scale_value(env)?;
        if tau <= 0.0 {
            return Ok(f64::NEG_INFINITY);
        }
        let (da, db) = self.scale_statistics(x, env)?;
        let log_norm = match self {
            Distribution::Lmrf(_) => -da * 2f64.ln(),
            _ => -da * LN_2PI,
        };
        Ok(da * tau.ln() - db * tau + log_norm)
    }

    /// Gradient of `logpdf` with respect to `x`.
    pub fn grad(&self, x: &[f64], env: &dyn Env) -> Result<Vec<f64>> {
        if let Distribution::Gamma(g) = self {
            let v = x[0];
            return Ok(vec![(g.shape - 1.0) / v - g.rate]);
        }
        let sens = self.mean_sensitivity(x, env)?;
        Ok(sens.into_iter().map(|s| -s).collect())
    }

    /// Gradient of `logpdf(x)` with respect to the referenced variable `var`.
    pub fn grad_wrt(&self, x: &[f64], env: &dyn Env, var: &str) -> Result<Vec<f64>> {
        let var_dim = lookup(env, var)?.len();
        let mut grad = vec![0.0; var_dim];

        if let Some(Mean::Forward { model, input }) = self.mean() {
            if input == var {
                let sens = self.mean_sensitivity(x, env)?;
                let g = model.gradient(&sens, lookup(env, input)?).ok_or_else(|| {
                    Error::UnsupportedCombination {
                        name: var.to_string(),
                        reason: "forward model provides no gradient".to_string(),
                    }
                })?;
                for (acc, gi) in grad.iter_mut().zip(g) {
                    *acc += gi;
                }
            }
        }

        if self.scale_param().and_then(|p| p.var()) == Some(var) {
            let tau = self.scale_value(env)?;
            let (da, db) = self.scale_statistics(x, env)?;
            grad[0] += da / tau - db;
        }

        Ok(grad)
    }

    /// `(Δa, Δb)` such that, as a function of the precision/rate `τ`,
    /// `logpdf = Δa·ln τ − Δb·τ + const`.
    pub fn scale_statistics(&self, x: &[f64], env: &dyn Env) -> Result<(f64, f64)> {
        match self {
            Distribution::Gaussian(d) => {
                let mu = d.mean.resolve(d.dim, env)?;
                Ok((0.5 * d.dim as f64, 0.5 * sq_dist(x, &mu)))
            }
            Distribution::Gmrf(d) => {
                let mu = d.mean.resolve(d.op.num_cols(), env)?;
                let dr = d.op.apply(&residual(x, &mu));
                Ok((0.5 * d.op.rank() as f64, 0.5 * dr.iter().map(|v| v * v).sum::<f64>()))
            }
            Distribution::Lmrf(d) => {
                let mu = d.location.resolve(d.op.num_cols(), env)?;
                let dr = d.op.apply(&residual(x, &mu));
                Ok((d.op.rank() as f64, dr.iter().map(|v| v.abs()).sum()))
            }
            Distribution::Gamma(_) => Err(Error::Computation(
                "Gamma has no precision parameter".to_string(),
            )),
        }
    }

    /// `∂ logpdf / ∂ mean`, evaluated at `x`.
    fn mean_sensitivity(&self, x: &[f64], env: &dyn Env) -> Result<Vec<f64>> {
        let tau = self.scale_value(env)?;
        match self {
            Distribution::Gaussian(d) => {
                let mu = d.mean.resolve(d.dim, env)?;
                Ok(residual(x, &mu).into_iter().map(|r| tau * r).collect())
            }
            Distribution::Gmrf(d) => {
                let mu = d.mean.resolve(d.op.num_cols(), env)?;
                let dr = d.op.apply(&residual(x, &mu));
                Ok(d.op.apply_transpose(&dr).into_iter().map(|v| tau * v).collect())
            }
            Distribution::Lmrf(d) => {
                let mu = d.location.resolve(d.op.num_cols(), env)?;
                let signs: Vec<f64> = d
                    .op
                    .apply(&residual(x, &mu))
                    .into_iter()
                    .map(sign)
                    .collect();
                Ok(d.op.apply_transpose(&signs).into_iter().map(|v| tau * v).collect())
            }
            Distribution::Gamma(_) => Err(Error::Computation(
                "Gamma has no location parameter".to_string(),
            )),
        }
    }

    fn scale_value(&self, env: &dyn Env) -> Result<f64> {
        self.scale_param()
            .ok_or_else(|| Error::Computation(format!("{} has no precision parameter", self.family())))?
            .resolve(env)
    }

    /// Precision structure `S` of a Gaussian-type distribution: the
    /// precision matrix is `τ S`.
    pub fn gaussian_structure(&self) -> Option<DMatrix<f64>> {
        match self {
            Distribution::Gaussian(d) => Some(DMatrix::identity(d.dim, d.dim)),
            Distribution::Gmrf(d) => Some(d.op.structure_matrix()),
            _ => None,
        }
    }
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Distribution::Gaussian(d) => write!(f, "Gaussian(mean={}, prec={})", d.mean, d.precision),
            Distribution::Gamma(d) => write!(f, "Gamma(shape={}, rate={})", d.shape, d.rate),
            Distribution::Gmrf(d) => write!(
                f,
                "GMRF(mean={}, prec={}, bc={:?})",
                d.mean,
                d.precision,
                d.op.boundary_condition()
            ),
            Distribution::Lmrf(d) => write!(
                f,
                "LMRF(location={}, rate={}, bc={:?})",
                d.location,
                d.rate,
                d.op.boundary_condition()
            ),
        }
    }
}

fn residual(x: &[f64], mu: &[f64]) -> Vec<f64> {
    x.iter().zip(mu.iter()).map(|(a, b)| a - b).collect()
}

fn sq_dist(x: &[f64], mu: &[f64]) -> f64 {
    x.iter().zip(mu.iter()).map(|(a, b)| (a - b) * (a - b)).sum()
}

fn sign(v: f64) -> f64 {
    if v > 0.0 {
        1.0
    } else if v < 0.0 {
        -1.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::LinearModel;
    use approx::assert_relative_eq;

    fn env(pairs: &[(&str, Vec<f64>)]) -> Values {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn finite_diff(f: impl Fn(&[f64]) -> f64, x: &[f64]) -> Vec<f64> {
        let eps = 1e-6;
        (0..x.len())
            .map(|i| {
                let mut xp = x.to_vec();
                let mut xm = x.to_vec();
                xp[i] += eps;
                xm[i] -= eps;
                (f(&xp) - f(&xm)) / (2.0 * eps)
            })
            .collect()
    }

    #[test]
    fn test_gaussian_logpdf() {
        let d = Gaussian::new(0.0, 1.0, 1);
        let lp = d.logpdf(&[1.5], &Values::new()).unwrap();
        assert_relative_eq!(lp, -0.5 * 1.5_f64.powi(2) - 0.5 * LN_2PI, epsilon = 1e-12);
    }

    #[test]
    fn test_gamma_logpdf() {
        // Gamma(2, 3) at 0.5: 2 ln 3 - ln Γ(2) + ln 0.5 - 1.5
        let d = Gamma::new(2.0, 3.0);
        let lp = d.logpdf(&[0.5], &Values::new()).unwrap();
        assert_relative_eq!(lp, 2.0 * 3f64.ln() + 0.5f64.ln() - 1.5, epsilon = 1e-10);
        assert_eq!(d.logpdf(&[-1.0], &Values::new()).unwrap(), f64::NEG_INFINITY);
    }

    #[test]
    fn test_gradients_match_finite_differences() {
        let a = Arc::new(LinearModel::from_row_slice(3, 3, &[1.0, 0.5, 0.0, 0.2, 1.0, 0.3, 0.0, 0.4, 1.0]).unwrap());
        let geom = Geometry::Continuous1D(3);
        let dists = vec![
            Gaussian::new(Mean::forward(a.clone(), "x"), "s", 3),
            Gmrf::new(Mean::forward(a.clone(), "x"), "s", geom, BoundaryCondition::Zero).unwrap(),
            Lmrf::new(Mean::forward(a, "x"), "s", geom, BoundaryCondition::Neumann).unwrap(),
        ];
        let y = vec![0.3, -1.2, 2.1];
        let x = vec![0.7, -0.4, 1.3];
        let s = 2.5;

        for d in &dists {
            let base = env(&[("x", x.clone()), ("s", vec![s])]);

            let g_self = d.grad(&y, &base).unwrap();
            let fd_self = finite_diff(|v| d.logpdf(v, &base).unwrap(), &y);
            for (a, b) in g_self.iter().zip(fd_self.iter()) {
                assert!((a - b).abs() < 1e-4, "{}: self grad {} vs {}", d.family(), a, b);
            }

            let g_x = d.grad_wrt(&y, &base, "x").unwrap();
            let fd_x = finite_diff(
                |v| d.logpdf(&y, &env(&[("x", v.to_vec()), ("s", vec![s])])).unwrap(),
                &x,
            );
            for (a, b) in g_x.iter().zip(fd_x.iter()) {
                assert!((a - b).abs() < 1e-4, "{}: input grad {} vs {}", d.family(), a, b);
            }

            let g_s = d.grad_wrt(&y, &base, "s").unwrap();
            let fd_s = finite_diff(
                |v| d.logpdf(&y, &env(&[("x", x.clone()), ("s", v.to_vec())])).unwrap(),
                &[s],
            );
            assert!((g_s[0] - fd_s[0]).abs() < 1e-4, "{}: precision grad", d.family());
        }
    }

    #[test]
    fn test_dependencies_and_validation() {
        let a = Arc::new(LinearModel::identity(4).unwrap());
        let d = Gaussian::new(Mean::forward(a, "x"), "s", 4);
        assert_eq!(d.dependencies(), vec!["x", "s"]);
        assert!(Gamma::new(0.0, 1.0).validate("d").is_err());
        assert!(Gaussian::new(0.0, -1.0, 2).validate("x").is_err());
        assert!(Gaussian::new(0.0, 1.0, 2).validate("x").is_ok());
    }

    #[test]
    fn test_missing_reference_is_an_error() {
        let d = Gaussian::new(0.0, "s", 2);
        assert!(matches!(
            d.logpdf(&[0.0, 0.0], &Values::new()),
            Err(Error::UnknownVariable(_))
        ));
    }
}
