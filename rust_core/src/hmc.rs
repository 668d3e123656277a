use crate::density::LogDensity;
use crate::error::{Error, Result};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

/// Configuration for the HMC kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HmcConfig {
    /// Initial step size; 0 means search for one on the first transition.
    pub step_size: f64,
    pub num_leapfrog_steps: usize,
    pub target_accept: f64,
}

impl Default for HmcConfig {
    fn default() -> Self {
        Self {
            step_size: 0.0,
            num_leapfrog_steps: 15,
            target_accept: 0.65,
        }
    }
}

impl HmcConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_leapfrog_steps == 0 {
            return Err(Error::Validation(
                "hmc.num_leapfrog_steps must be at least 1".to_string(),
            ));
        }
        check_step_size("hmc.step_size", self.step_size)?;
        check_target_accept("hmc.target_accept", self.target_accept)
    }
}

/// A step size is finite and non-negative; zero requests a search.
pub(crate) fn check_step_size(name: &str, step_size: f64) -> Result<()> {
    if !(step_size.is_finite() && step_size >= 0.0) {
        return Err(Error::Validation(format!(
            "{} must be finite and non-negative, got {}",
            name, step_size
        )));
    }
    Ok(())
}

pub(crate) fn check_target_accept(name: &str, target: f64) -> Result<()> {
    if !(target > 0.0 && target < 1.0) {
        return Err(Error::Validation(format!(
            "{} must lie in (0, 1), got {}",
            name, target
        )));
    }
    Ok(())
}

/// Dual-averaging step-size adaptation (Hoffman & Gelman 2014, §3.2).
#[derive(Debug, Clone)]
pub(crate) struct DualAveraging {
    target_accept: f64,
    mu: f64,
    log_eps_bar: f64,
    h_bar: f64,
    count: u64,
}

impl DualAveraging {
    const GAMMA: f64 = 0.05;
    const T0: f64 = 10.0;
    const KAPPA: f64 = 0.75;

    pub(crate) fn new(step_size: f64, target_accept: f64) -> Self {
        Self {
            target_accept,
            mu: (10.0 * step_size).ln(),
            log_eps_bar: step_size.ln(),
            h_bar: 0.0,
            count: 0,
        }
    }

    /// Feed one acceptance statistic and return the next step size.
    pub(crate) fn update(&mut self, accept_stat: f64) -> f64 {
        self.count += 1;
        let m = self.count as f64;
        let w = 1.0 / (m + Self::T0);
        self.h_bar = (1.0 - w) * self.h_bar + w * (self.target_accept - accept_stat);
        let log_eps = self.mu - (m.sqrt() / Self::GAMMA) * self.h_bar;
        let m_pow = m.powf(-Self::KAPPA);
        self.log_eps_bar = m_pow * log_eps + (1.0 - m_pow) * self.log_eps_bar;
        log_eps.exp()
    }

    /// Step size to freeze once adaptation ends.
    pub(crate) fn final_step_size(&self) -> f64 {
        self.log_eps_bar.exp()
    }
}

/// Hamiltonian Monte Carlo with unit mass and a fixed number of leapfrog
/// steps. The step size adapts while `iter < num_warmup` and is frozen
/// afterwards.
#[derive(Debug, Clone)]
pub struct HmcKernel {
    config: HmcConfig,
    num_warmup: usize,
    step_size: f64,
    adaptation: Option<DualAveraging>,
    iter: usize,
    accepted: u64,
    total: u64,
}

impl HmcKernel {
    pub fn new(config: &HmcConfig, num_warmup: usize) -> Self {
        Self {
            config: config.clone(),
            num_warmup,
            step_size: config.step_size,
            adaptation: None,
            iter: 0,
            accepted: 0,
            total: 0,
        }
    }

    pub fn step_size(&self) -> f64 {
        self.step_size
    }

    pub fn accept_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.accepted as f64 / self.total as f64
        }
    }

    /// One HMC transition from `q`; returns the next state.
    pub fn step(
        &mut self,
        target: &dyn LogDensity,
        q: &[f64],
        rng: &mut ChaCha8Rng,
    ) -> Result<Vec<f64>> {
        if self.adaptation.is_none() {
            self.config.validate()?;
            if self.step_size <= 0.0 {
                self.step_size = find_reasonable_step_size(target, q, rng)?;
            }
            self.adaptation = Some(DualAveraging::new(self.step_size, self.config.target_accept));
        }
        let is_warmup = self.iter < self.num_warmup;
        let dim = q.len();
        // Jitter ±10% so trajectory lengths never lock onto a period.
        let eps = self.step_size * (0.9 + 0.2 * rng.gen::<f64>());

        let (logp_current, grad_current) = target.logp_grad(q)?;
        let p: Vec<f64> = (0..dim).map(|_| StandardNormal.sample(rng)).collect();

        let mut q_prop = q.to_vec();
        let mut p_prop = p.clone();
        let mut grad = grad_current;

        for i in 0..dim {
            p_prop[i] += 0.5 * eps * grad[i];
        }
        let n_steps = self.config.num_leapfrog_steps;
        for step in 0..n_steps {
            for i in 0..dim {
                q_prop[i] += eps * p_prop[i];
            }
            grad = target.logp_grad(&q_prop)?.1;
            if step < n_steps - 1 {
                for i in 0..dim {
                    p_prop[i] += eps * grad[i];
                }
            }
        }
        for i in 0..dim {
            p_prop[i] += 0.5 * eps * grad[i];
        }

        let logp_prop = target.logp(&q_prop)?;
        let ke_current: f64 = p.iter().map(|pi| 0.5 * pi * pi).sum();
        let ke_prop: f64 = p_prop.iter().map(|pi| 0.5 * pi * pi).sum();
        let log_accept_ratio = (logp_prop - ke_prop) - (logp_current - ke_current);
        let accept_prob = if log_accept_ratio.is_finite() {
            log_accept_ratio.min(0.0).exp()
        } else {
            0.0
        };

        self.total += 1;
        let next = if log_accept_ratio.is_finite() && rng.gen::<f64>().ln() < log_accept_ratio {
            self.accepted += 1;
            q_prop
        } else {
            q.to_vec()
        };

        if is_warmup {
            if let Some(da) = self.adaptation.as_mut() {
                self.step_size = da.update(accept_prob);
                if self.iter + 1 == self.num_warmup {
                    self.step_size = da.final_step_size();
                    log::debug!("HMC step size fixed at {:.3e}", self.step_size);
                }
            }
        }
        self.iter += 1;
        Ok(next)
    }
}

/// Heuristic initial step size: double or halve `eps` from 1 until the
/// acceptance probability of one leapfrog step crosses 1/2.
pub(crate) fn find_reasonable_step_size(
    target: &dyn LogDensity,
    q: &[f64],
    rng: &mut ChaCha8Rng,
) -> Result<f64> {
    let dim = q.len();
    let (logp0, grad0) = target.logp_grad(q)?;
    let p0: Vec<f64> = (0..dim).map(|_| StandardNormal.sample(rng)).collect();
    let h0 = -logp0 + p0.iter().map(|p| 0.5 * p * p).sum::<f64>();

    let log_ratio_at = |eps: f64| -> Result<f64> {
        let p_half: Vec<f64> = (0..dim).map(|i| p0[i] + 0.5 * eps * grad0[i]).collect();
        let q1: Vec<f64> = (0..dim).map(|i| q[i] + eps * p_half[i]).collect();
        let (logp1, grad1) = target.logp_grad(&q1)?;
        let ke1: f64 = (0..dim)
            .map(|i| {
                let p = p_half[i] + 0.5 * eps * grad1[i];
                0.5 * p * p
            })
            .sum();
        Ok(h0 - (-logp1 + ke1))
    };

    let threshold = 0.5_f64.ln();
    let mut eps = 1.0;
    let first = log_ratio_at(eps)?;
    let direction = if first.is_finite() && first > threshold { 1.0 } else { -1.0 };

    for _ in 0..50 {
        let lr = log_ratio_at(eps)?;
        if !lr.is_finite() {
            eps *= 0.5;
            if direction > 0.0 {
                break;
            }
            continue;
        }
        if direction > 0.0 && lr < threshold {
            break;
        }
        if direction < 0.0 && lr > threshold {
            break;
        }
        eps *= 2.0_f64.powf(direction);
    }

    Ok(eps.clamp(1e-10, 1e3))
}
