//! No-U-Turn Sampler (NUTS) after Hoffman & Gelman (2014) with multinomial
//! sampling (Betancourt 2017), run one transition at a time so it can serve
//! as a block update inside a Gibbs sweep.
//!
//!   - Iterative tree doubling (extend trajectory forward or backward)
//!   - Generalized U-turn criterion on subtrees
//!   - Multinomial candidate selection weighted by exp(-H)
//!   - Divergence detection via energy error threshold
//!   - Max tree depth cap (default 10)

use crate::density::LogDensity;
use crate::error::{Error, Result};
use crate::hmc::{
    check_step_size, check_target_accept, find_reasonable_step_size, DualAveraging,
};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

const MAX_DELTA_H: f64 = 1000.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NutsConfig {
    /// Initial step size; 0 means search for one on the first transition.
    pub step_size: f64,
    pub max_tree_depth: usize,
    pub target_accept: f64,
}

impl Default for NutsConfig {
    fn default() -> Self {
        Self {
            step_size: 0.0,
            max_tree_depth: 10,
            target_accept: 0.80,
        }
    }
}

impl NutsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_tree_depth == 0 {
            return Err(Error::Validation(
                "nuts.max_tree_depth must be at least 1".to_string(),
            ));
        }
        check_step_size("nuts.step_size", self.step_size)?;
        check_target_accept("nuts.target_accept", self.target_accept)
    }
}

/// A point on the Hamiltonian trajectory: (position, momentum, gradient, log-probability).
#[derive(Clone)]
struct PhasePoint {
    q: Vec<f64>,
    p: Vec<f64>,
    grad: Vec<f64>,
    logp: f64,
}

/// Result of building one subtree during the doubling process.
struct TreeResult {
    left: PhasePoint,
    right: PhasePoint,
    proposal: PhasePoint,
    /// Log of the sum of leaf weights (for multinomial combining).
    log_sum_weight: f64,
    depth: usize,
    turning: bool,
    diverging: bool,
}

struct TreeStats {
    diverging: bool,
    mean_accept_prob: f64,
}

/// Leapfrog integration against one target with a diagonal mass matrix.
struct Hamiltonian<'a> {
    target: &'a dyn LogDensity,
    inv_mass: &'a [f64],
}

impl Hamiltonian<'_> {
    fn energy(&self, point: &PhasePoint) -> f64 {
        let ke: f64 = point
            .p
            .iter()
            .zip(self.inv_mass.iter())
            .map(|(&pi, &im)| 0.5 * pi * pi * im)
            .sum();
        -point.logp + ke
    }

    /// Half-step momentum, full-step position, half-step momentum.
    fn leapfrog(&self, point: &PhasePoint, eps: f64) -> Result<PhasePoint> {
        let p_half: Vec<f64> = point
            .p
            .iter()
            .zip(point.grad.iter())
            .map(|(p, g)| p + 0.5 * eps * g)
            .collect();
        let q_new: Vec<f64> = point
            .q
            .iter()
            .zip(p_half.iter().zip(self.inv_mass.iter()))
            .map(|(q, (p, im))| q + eps * im * p)
            .collect();
        let (logp, grad) = self.target.logp_grad(&q_new)?;
        let p_new = p_half
            .iter()
            .zip(grad.iter())
            .map(|(p, g)| p + 0.5 * eps * g)
            .collect();
        Ok(PhasePoint {
            q: q_new,
            p: p_new,
            grad,
            logp,
        })
    }

    /// Build the tree by repeated doubling in a random direction, stopping
    /// at a U-turn, a divergence or the depth cap.
    fn build_tree(
        &self,
        initial: &PhasePoint,
        eps: f64,
        max_depth: usize,
        rng: &mut ChaCha8Rng,
    ) -> Result<(PhasePoint, TreeStats)> {
        let h0 = self.energy(initial);
        let mut left = initial.clone();
        let mut right = initial.clone();
        let mut proposal = initial.clone();
        let mut log_sum_weight = 0.0f64;
        let mut sum_accept_stat = 0.0f64;
        let mut n_accept_stat = 0usize;
        let mut diverging = false;

        for depth in 0..max_depth {
            let forward = rng.gen::<bool>();
            let subtree = if forward {
                self.build_subtree(&right, eps, h0, depth, rng)?
            } else {
                self.build_subtree(&left, -eps, h0, depth, rng)?
            };

            if subtree.diverging {
                diverging = true;
                break;
            }
            if subtree.turning {
                break;
            }

            let accept_prob = (subtree.log_sum_weight - log_sum_weight).min(0.0).exp();
            if rng.gen::<f64>() < accept_prob {
                proposal = subtree.proposal;
            }
            log_sum_weight = log_sum_exp(log_sum_weight, subtree.log_sum_weight);

            let n_leaves = 1usize << subtree.depth;
            sum_accept_stat += subtree.log_sum_weight.exp().min(n_leaves as f64);
            n_accept_stat += n_leaves;

            if forward {
                right = subtree.right;
            } else {
                left = subtree.left;
            }

            if check_uturn(&left, &right, self.inv_mass) {
                break;
            }
        }

        let mean_accept_prob = if n_accept_stat > 0 {
            (sum_accept_stat / n_accept_stat as f64).min(1.0)
        } else {
            0.0
        };
        Ok((
            proposal,
            TreeStats {
                diverging,
                mean_accept_prob,
            },
        ))
    }

    /// Balanced binary subtree of the given depth starting next to `point`.
    fn build_subtree(
        &self,
        point: &PhasePoint,
        eps: f64,
        h0: f64,
        depth: usize,
        rng: &mut ChaCha8Rng,
    ) -> Result<TreeResult> {
        if depth == 0 {
            let next = self.leapfrog(point, eps)?;
            let delta_h = self.energy(&next) - h0;
            let diverging = delta_h > MAX_DELTA_H || !delta_h.is_finite();
            let log_weight = if diverging { f64::NEG_INFINITY } else { -delta_h };
            return Ok(TreeResult {
                left: next.clone(),
                right: next.clone(),
                proposal: next,
                log_sum_weight: log_weight,
                depth: 0,
                turning: false,
                diverging,
            });
        }

        let inner = self.build_subtree(point, eps, h0, depth - 1, rng)?;
        if inner.diverging || inner.turning {
            return Ok(inner);
        }

        let start = if eps > 0.0 { &inner.right } else { &inner.left };
        let outer = self.build_subtree(start, eps, h0, depth - 1, rng)?;
        if outer.diverging {
            return Ok(TreeResult {
                depth,
                diverging: true,
                ..inner
            });
        }

        let log_sum = log_sum_exp(inner.log_sum_weight, outer.log_sum_weight);
        let accept_outer = (outer.log_sum_weight - log_sum).exp();
        let proposal = if rng.gen::<f64>() < accept_outer {
            outer.proposal
        } else {
            inner.proposal
        };

        let (left, right) = if eps > 0.0 {
            (inner.left, outer.right)
        } else {
            (outer.left, inner.right)
        };
        let turning = outer.turning || check_uturn(&left, &right, self.inv_mass);

        Ok(TreeResult {
            left,
            right,
            proposal,
            log_sum_weight: log_sum,
            depth,
            turning,
            diverging: false,
        })
    }
}

/// NUTS transition kernel with step-size and diagonal mass adaptation.
///
/// Adaptation runs during the first `num_warmup` calls to [`NutsKernel::step`]:
///   Phase 1 (15%): step-size adaptation, identity mass matrix
///   Phase 2 (75%): collect positions → diagonal mass matrix
///   Phase 3 (10%): step-size adaptation with the adapted mass matrix
/// Afterwards the kernel is fixed and preserves its target.
#[derive(Debug, Clone)]
pub struct NutsKernel {
    config: NutsConfig,
    num_warmup: usize,
    phase1_end: usize,
    phase2_end: usize,
    step_size: f64,
    adaptation: Option<DualAveraging>,
    /// `M⁻¹`, the estimated posterior variance after adaptation.
    inv_mass_diag: Vec<f64>,
    /// `M^{1/2}`, used to draw momenta.
    mass_sqrt: Vec<f64>,
    window_sum: Vec<f64>,
    window_sq_sum: Vec<f64>,
    window_count: usize,
    iter: usize,
    divergences: usize,
    sum_accept_prob: f64,
}

impl NutsKernel {
    pub fn new(dim: usize, config: &NutsConfig, num_warmup: usize) -> Self {
        Self {
            config: config.clone(),
            num_warmup,
            phase1_end: num_warmup * 15 / 100,
            phase2_end: num_warmup * 90 / 100,
            step_size: config.step_size,
            adaptation: None,
            inv_mass_diag: vec![1.0; dim],
            mass_sqrt: vec![1.0; dim],
            window_sum: vec![0.0; dim],
            window_sq_sum: vec![0.0; dim],
            window_count: 0,
            iter: 0,
            divergences: 0,
            sum_accept_prob: 0.0,
        }
    }

    pub fn step_size(&self) -> f64 {
        self.step_size
    }

    /// Divergent transitions after warmup.
    pub fn divergences(&self) -> usize {
        self.divergences
    }

    /// Mean acceptance statistic over all transitions so far.
    pub fn accept_rate(&self) -> f64 {
        if self.iter == 0 {
            0.0
        } else {
            self.sum_accept_prob / self.iter as f64
        }
    }

    /// One NUTS transition from `q`; returns the next state.
    pub fn step(
        &mut self,
        target: &dyn LogDensity,
        q: &[f64],
        rng: &mut ChaCha8Rng,
    ) -> Result<Vec<f64>> {
        if self.adaptation.is_none() {
            self.config.validate()?;
            if self.step_size <= 0.0 {
                self.step_size = self.initial_step_size(target, q, rng)?;
            }
            self.adaptation = Some(DualAveraging::new(self.step_size, self.config.target_accept));
        }
        let is_warmup = self.iter < self.num_warmup;

        let (logp, grad) = target.logp_grad(q)?;
        let p: Vec<f64> = self
            .mass_sqrt
            .iter()
            .map(|m| {
                let z: f64 = StandardNormal.sample(rng);
                z * m
            })
            .collect();
        let current = PhasePoint {
            q: q.to_vec(),
            p,
            grad,
            logp,
        };

        let ham = Hamiltonian {
            target,
            inv_mass: &self.inv_mass_diag,
        };
        let (proposal, stats) = ham.build_tree(&current, self.step_size, self.config.max_tree_depth, rng)?;

        // The proposal never comes from the diverging subtree, so it is kept.
        if stats.diverging && !is_warmup {
            self.divergences += 1;
        }
        self.sum_accept_prob += stats.mean_accept_prob;
        let next = proposal.q;

        if is_warmup {
            self.adapt(target, &next, stats.mean_accept_prob, rng)?;
        }
        self.iter += 1;
        Ok(next)
    }

    fn adapt(
        &mut self,
        target: &dyn LogDensity,
        q: &[f64],
        accept_stat: f64,
        rng: &mut ChaCha8Rng,
    ) -> Result<()> {
        let iter = self.iter;
        if let Some(da) = self.adaptation.as_mut() {
            self.step_size = da.update(accept_stat);
        }

        if iter >= self.phase1_end && iter < self.phase2_end {
            for (i, &qi) in q.iter().enumerate() {
                self.window_sum[i] += qi;
                self.window_sq_sum[i] += qi * qi;
            }
            self.window_count += 1;
        }

        if iter == self.phase2_end && self.window_count > 10 {
            let n = self.window_count as f64;
            for i in 0..q.len() {
                let mean = self.window_sum[i] / n;
                let var = self.window_sq_sum[i] / n - mean * mean;
                if var > 1e-12 {
                    self.inv_mass_diag[i] = var;
                    self.mass_sqrt[i] = 1.0 / var.sqrt();
                }
            }
            let eps = self.initial_step_size(target, q, rng)?;
            self.step_size = eps;
            self.adaptation = Some(DualAveraging::new(eps, self.config.target_accept));
            log::debug!("NUTS mass matrix adapted from {} draws", self.window_count);
        }

        if iter + 1 == self.num_warmup {
            if let Some(da) = self.adaptation.as_ref() {
                self.step_size = da.final_step_size();
            }
            log::debug!("NUTS step size fixed at {:.3e}", self.step_size);
        }
        Ok(())
    }

    /// Step-size search in the whitened coordinates `q = M^{-1/2} z`.
    /// `mass_sqrt` holds `M^{1/2}`, so `M^{-1/2}` is its reciprocal.
    fn initial_step_size(
        &self,
        target: &dyn LogDensity,
        q: &[f64],
        rng: &mut ChaCha8Rng,
    ) -> Result<f64> {
        let scale: Vec<f64> = self.mass_sqrt.iter().map(|m| 1.0 / m).collect();
        let scaled = Scaled {
            target,
            scale: &scale,
        };
        let z: Vec<f64> = q.iter().zip(self.mass_sqrt.iter()).map(|(q, m)| q * m).collect();
        find_reasonable_step_size(&scaled, &z, rng)
    }
}

/// `target` expressed in the whitened coordinates `q = scale ⊙ z`.
struct Scaled<'a> {
    target: &'a dyn LogDensity,
    scale: &'a [f64],
}

impl LogDensity for Scaled<'_> {
    fn dim(&self) -> usize {
        self.target.dim()
    }

    fn logp_grad(&self, z: &[f64]) -> Result<(f64, Vec<f64>)> {
        let q: Vec<f64> = z.iter().zip(self.scale.iter()).map(|(z, s)| z * s).collect();
        let (lp, g) = self.target.logp_grad(&q)?;
        Ok((lp, g.iter().zip(self.scale.iter()).map(|(g, s)| g * s).collect()))
    }
}

/// Generalized U-turn check: the trajectory is turning if the momentum
/// at either end would decrease the distance between the endpoints.
///
///   (q_right - q_left) · (M⁻¹ p_left) < 0  OR
///   (q_right - q_left) · (M⁻¹ p_right) < 0
fn check_uturn(left: &PhasePoint, right: &PhasePoint, inv_mass: &[f64]) -> bool {
    let mut dot_left = 0.0f64;
    let mut dot_right = 0.0f64;
    for i in 0..left.q.len() {
        let dq = right.q[i] - left.q[i];
        dot_left += dq * (inv_mass[i] * left.p[i]);
        dot_right += dq * (inv_mass[i] * right.p[i]);
    }
    dot_left < 0.0 || dot_right < 0.0
}

fn log_sum_exp(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY && b == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    let max = a.max(b);
    max + ((a - max).exp() + (b - max).exp()).ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    struct CorrelatedNormal {
        rho: f64,
        scale: [f64; 2],
    }

    impl LogDensity for CorrelatedNormal {
        fn dim(&self) -> usize {
            2
        }

        fn logp_grad(&self, q: &[f64]) -> Result<(f64, Vec<f64>)> {
            let a = q[0] / self.scale[0];
            let b = q[1] / self.scale[1];
            let c = 1.0 / (1.0 - self.rho * self.rho);
            let lp = -0.5 * c * (a * a - 2.0 * self.rho * a * b + b * b);
            let ga = -c * (a - self.rho * b) / self.scale[0];
            let gb = -c * (b - self.rho * a) / self.scale[1];
            Ok((lp, vec![ga, gb]))
        }
    }

    #[test]
    fn test_nuts_recovers_moments() {
        let target = CorrelatedNormal {
            rho: 0.6,
            scale: [1.0, 10.0],
        };
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut kernel = NutsKernel::new(2, &NutsConfig::default(), 500);
        let mut q = vec![1.0, 1.0];
        let mut draws = Vec::new();
        for i in 0..2500 {
            q = kernel.step(&target, &q, &mut rng).unwrap();
            if i >= 500 {
                draws.push(q.clone());
            }
        }
        let n = draws.len() as f64;
        for (k, sd) in target.scale.iter().enumerate() {
            let mean = draws.iter().map(|d| d[k]).sum::<f64>() / n;
            let var = draws.iter().map(|d| (d[k] - mean).powi(2)).sum::<f64>() / n;
            assert!(mean.abs() < 0.2 * sd, "mean[{}] = {}", k, mean);
            assert!((var.sqrt() / sd - 1.0).abs() < 0.15, "sd[{}] = {}", k, var.sqrt());
        }
        assert_eq!(kernel.divergences(), 0);
        assert!(kernel.accept_rate() > 0.5);
    }

    #[test]
    fn test_nuts_is_deterministic_for_a_seed() {
        let target = CorrelatedNormal {
            rho: 0.0,
            scale: [1.0, 1.0],
        };
        let run = || {
            let mut rng = ChaCha8Rng::seed_from_u64(11);
            let mut kernel = NutsKernel::new(2, &NutsConfig::default(), 20);
            let mut q = vec![0.0, 0.0];
            for _ in 0..50 {
                q = kernel.step(&target, &q, &mut rng).unwrap();
            }
            q
        };
        assert_eq!(run(), run());
    }

    fn lag1_autocorrelation(x: &[f64]) -> f64 {
        let n = x.len() as f64;
        let mean = x.iter().sum::<f64>() / n;
        let var = x.iter().map(|v| (v - mean).powi(2)).sum::<f64>();
        let cov: f64 = x.windows(2).map(|w| (w[0] - mean) * (w[1] - mean)).sum();
        cov / var
    }

    fn wide_component_trace(kernel: &mut NutsKernel, target: &CorrelatedNormal) -> Vec<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut q = vec![1.0, 1.0];
        let mut trace = Vec::new();
        for i in 0..3000 {
            q = kernel.step(target, &q, &mut rng).unwrap();
            if i >= 1000 {
                trace.push(q[1]);
            }
        }
        trace
    }

    #[test]
    fn test_mass_adaptation_whitens_anisotropic_target() {
        let target = CorrelatedNormal {
            rho: 0.0,
            scale: [1.0, 100.0],
        };

        let mut adapted = NutsKernel::new(2, &NutsConfig::default(), 1000);
        let adapted_trace = wide_component_trace(&mut adapted, &target);

        // Same schedule, but the mass-matrix window never closes.
        let mut identity = NutsKernel::new(2, &NutsConfig::default(), 1000);
        identity.phase2_end = usize::MAX;
        let identity_trace = wide_component_trace(&mut identity, &target);
        assert_eq!(identity.inv_mass_diag, vec![1.0, 1.0]);

        // M⁻¹ tracks the posterior variance [1, 1e4].
        assert!(
            adapted.inv_mass_diag[1] > 1e3,
            "inverse mass should approach the variance, got {:?}",
            adapted.inv_mass_diag
        );
        assert!(adapted.inv_mass_diag[0] < 10.0, "{:?}", adapted.inv_mass_diag);

        let rho_adapted = lag1_autocorrelation(&adapted_trace);
        let rho_identity = lag1_autocorrelation(&identity_trace);
        assert!(
            rho_adapted <= rho_identity,
            "adapted lag-1 {} worse than identity {}",
            rho_adapted,
            rho_identity
        );
        assert!(rho_adapted < 0.5, "adapted lag-1 autocorrelation {}", rho_adapted);
    }

    #[test]
    fn test_zero_tree_depth_is_an_error() {
        let target = CorrelatedNormal {
            rho: 0.0,
            scale: [1.0, 1.0],
        };
        let config = NutsConfig {
            max_tree_depth: 0,
            ..NutsConfig::default()
        };
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let mut kernel = NutsKernel::new(2, &config, 10);
        assert!(matches!(
            kernel.step(&target, &[0.0, 0.0], &mut rng),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_log_sum_exp() {
        assert!((log_sum_exp(0.0, 0.0) - 2f64.ln()).abs() < 1e-12);
        assert_eq!(log_sum_exp(f64::NEG_INFINITY, f64::NEG_INFINITY), f64::NEG_INFINITY);
    }
}
