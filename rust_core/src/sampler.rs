use crate::config::{GradientKernel, SamplerConfig};
use crate::conjugate::{ConjugateGamma, LinearGaussian};
use crate::density::{ConditionalDensity, Transform};
use crate::distributions::{Mean, Support, Values};
use crate::error::{Error, Result};
use crate::graph::{JointModel, NodeId};
use crate::hmc::HmcKernel;
use crate::nuts::NutsKernel;
use crate::samples::{SampleSet, VariableSamples};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use std::collections::HashMap;
use std::fmt;

/// Update used for one unknown inside a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SamplerKind {
    /// Exact draw from a Gaussian conditional.
    LinearGaussian,
    /// Exact draw from a Gamma conditional.
    ConjugateGamma,
    Nuts,
    Hmc,
}

impl SamplerKind {
    pub fn is_conjugate(&self) -> bool {
        matches!(self, SamplerKind::LinearGaussian | SamplerKind::ConjugateGamma)
    }
}

impl fmt::Display for SamplerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SamplerKind::LinearGaussian => "LinearGaussian",
            SamplerKind::ConjugateGamma => "ConjugateGamma",
            SamplerKind::Nuts => "NUTS",
            SamplerKind::Hmc => "HMC",
        };
        f.write_str(s)
    }
}

/// Which sampler updates which unknown, in scan order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplingPlan {
    steps: Vec<(String, SamplerKind)>,
}

impl SamplingPlan {
    pub fn kind_of(&self, name: &str) -> Option<SamplerKind> {
        self.steps.iter().find(|(n, _)| n == name).map(|(_, k)| *k)
    }

    /// More than one unknown, so updates alternate within a sweep.
    pub fn is_gibbs(&self) -> bool {
        self.steps.len() > 1
    }

    pub fn scan_order(&self) -> Vec<&str> {
        self.steps.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, SamplerKind)> {
        self.steps.iter()
    }
}

impl fmt::Display for SamplingPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .steps
            .iter()
            .map(|(n, k)| format!("{} ← {}", n, k))
            .collect();
        write!(f, "{}", parts.join(", "))
    }
}

/// Draws from the posterior of a model with bound data.
///
/// Each unknown is assigned the most specific applicable update: a
/// closed-form conditional when the model structure allows one, a gradient
/// kernel otherwise. With several unknowns the updates are combined into a
/// Gibbs sweep.
#[derive(Debug, Clone)]
pub struct PosteriorSampler {
    model: JointModel,
    config: SamplerConfig,
    forced: HashMap<String, SamplerKind>,
    initial: Values,
}

impl PosteriorSampler {
    pub fn new(model: JointModel, config: SamplerConfig) -> Result<Self> {
        if model.observed().next().is_none() {
            return Err(Error::NoObservations);
        }
        if model.unknowns().next().is_none() {
            return Err(Error::NoUnknowns);
        }
        config.validate()?;
        Ok(Self {
            model,
            config,
            forced: HashMap::new(),
            initial: Values::new(),
        })
    }

    pub fn model(&self) -> &JointModel {
        &self.model
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    fn unknown(&self, name: &str) -> Result<NodeId> {
        let var = self.model.require(name)?;
        if var.is_observed() {
            return Err(Error::ObservedVariable(name.to_string()));
        }
        Ok(var.id)
    }

    /// Use `kind` for `name` instead of the automatic choice.
    pub fn with_sampler(mut self, name: &str, kind: SamplerKind) -> Result<Self> {
        let node = self.unknown(name)?;
        if let Some(reason) = unsupported_reason(&self.model, node, kind) {
            return Err(Error::UnsupportedCombination {
                name: name.to_string(),
                reason,
            });
        }
        self.forced.insert(name.to_string(), kind);
        Ok(self)
    }

    /// Start every chain with `name = value`.
    pub fn with_initial(mut self, name: &str, value: Vec<f64>) -> Result<Self> {
        let node = self.unknown(name)?;
        let var = self.model.node(node);
        if value.len() != var.dim() {
            return Err(Error::DimensionMismatch {
                name: name.to_string(),
                expected: var.dim(),
                actual: value.len(),
            });
        }
        let ok = match var.distribution.support() {
            Support::Real => value.iter().all(|v| v.is_finite()),
            Support::Positive => value.iter().all(|v| v.is_finite() && *v > 0.0),
        };
        if !ok {
            return Err(Error::Validation(format!(
                "initial value for '{}' is outside its support",
                name
            )));
        }
        self.initial.insert(name.to_string(), value);
        Ok(self)
    }

    /// Resolve the update for every unknown without sampling.
    pub fn plan(&self) -> Result<SamplingPlan> {
        let steps = scan_order(&self.model)
            .into_iter()
            .map(|node| {
                let name = self.model.node(node).name.clone();
                let kind = match self.forced.get(&name) {
                    Some(&kind) => kind,
                    None => select(&self.model, node, self.config.nonconjugate_kernel)?,
                };
                Ok((name, kind))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(SamplingPlan { steps })
    }

    /// Run all chains and collect the retained draws.
    ///
    /// Chains run in parallel. Chain `c` is seeded with `seed + c` (wrapping), so results
    /// are reproducible regardless of thread scheduling.
    pub fn sample(&self) -> Result<SampleSet> {
        let plan = self.plan()?;
        let config = &self.config;
        log::info!(
            "sampling {} with {} chain(s), {} burn-in + {} × {} sweeps",
            self.model.equation(),
            config.num_chains,
            config.burn_in,
            config.num_samples,
            config.thin
        );
        for (name, kind) in plan.iter() {
            log::info!("  {} ← {}", name, kind);
        }

        if config.num_threads > 0 {
            rayon::ThreadPoolBuilder::new()
                .num_threads(config.num_threads)
                .build_global()
                .ok();
        }

        let updates = plan
            .iter()
            .map(|(name, kind)| Update::new(&self.model, name, *kind, config))
            .collect::<Result<Vec<_>>>()?;
        let initial = self.initial_state();

        let chains: Vec<ChainOutput> = (0..config.num_chains)
            .into_par_iter()
            .map(|chain_idx| {
                let mut rng = ChaCha8Rng::seed_from_u64(config.seed.wrapping_add(chain_idx as u64));
                run_chain(&self.model, updates.clone(), initial.clone(), config, &mut rng)
            })
            .collect::<Result<Vec<_>>>()?;

        let mut variables = Vec::new();
        for var in self.model.unknowns() {
            let Some(slot) = updates.iter().position(|u| u.name == var.name) else {
                continue;
            };
            let mut samples = VariableSamples {
                name: var.name.clone(),
                dim: var.dim(),
                chains: Vec::with_capacity(chains.len()),
                accept_rates: Vec::with_capacity(chains.len()),
                divergences: 0,
                sampler: updates[slot].kind,
            };
            for chain in &chains {
                samples.chains.push(chain.draws[slot].clone());
                samples.accept_rates.push(chain.accept_rates[slot]);
                samples.divergences += chain.divergences[slot];
            }
            if samples.divergences > 0 {
                log::warn!(
                    "{} divergent transitions while sampling '{}'",
                    samples.divergences,
                    var.name
                );
            }
            variables.push(samples);
        }

        log::info!("sampling finished: {} draws per chain", config.num_samples);
        Ok(SampleSet::new(variables))
    }

    /// 1.0 for positive variables and zeros otherwise, unless overridden.
    fn initial_state(&self) -> Values {
        let mut state = self.model.observed_values();
        for var in self.model.unknowns() {
            let value = match self.initial.get(&var.name) {
                Some(v) => v.clone(),
                None => match var.distribution.support() {
                    Support::Positive => vec![1.0; var.dim()],
                    Support::Real => vec![0.0; var.dim()],
                },
            };
            state.insert(var.name.clone(), value);
        }
        state
    }
}

/// Sample the posterior of `model` with automatically selected samplers.
pub fn sample(model: JointModel, config: SamplerConfig) -> Result<SampleSet> {
    PosteriorSampler::new(model, config)?.sample()
}

// ── Selection ───────────────────────────────────────────────────────

/// Declaration order, with positive-support variables (precisions, rates)
/// after the rest.
fn scan_order(model: &JointModel) -> Vec<NodeId> {
    let (positive, real): (Vec<_>, Vec<_>) = model
        .unknowns()
        .partition(|v| v.distribution.support() == Support::Positive);
    real.into_iter().chain(positive).map(|v| v.id).collect()
}

fn select(model: &JointModel, node: NodeId, fallback: GradientKernel) -> Result<SamplerKind> {
    if ConjugateGamma::unsupported_reason(model, node).is_none() {
        return Ok(SamplerKind::ConjugateGamma);
    }
    if LinearGaussian::unsupported_reason(model, node).is_none() {
        return Ok(SamplerKind::LinearGaussian);
    }
    let kind = match fallback {
        GradientKernel::Nuts => SamplerKind::Nuts,
        GradientKernel::Hmc => SamplerKind::Hmc,
    };
    match gradient_reason(model, node) {
        None => Ok(kind),
        Some(reason) => Err(Error::UnsupportedCombination {
            name: model.node(node).name.clone(),
            reason,
        }),
    }
}

fn unsupported_reason(model: &JointModel, node: NodeId, kind: SamplerKind) -> Option<String> {
    match kind {
        SamplerKind::ConjugateGamma => ConjugateGamma::unsupported_reason(model, node),
        SamplerKind::LinearGaussian => LinearGaussian::unsupported_reason(model, node),
        SamplerKind::Nuts | SamplerKind::Hmc => gradient_reason(model, node),
    }
}

/// Gradient kernels need every forward model fed by `node` to expose a
/// gradient.
fn gradient_reason(model: &JointModel, node: NodeId) -> Option<String> {
    let name = &model.node(node).name;
    model.children(node).into_iter().find_map(|child_id| {
        let child = model.node(child_id);
        match child.distribution.mean() {
            Some(Mean::Forward { model: fwd, input }) if input == name && !fwd.has_gradient() => {
                Some(format!(
                    "forward model of '{}' provides no gradient and no conjugate update applies",
                    child.name
                ))
            }
            _ => None,
        }
    })
}

// ── Chains ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Kernel {
    Gamma(ConjugateGamma),
    Linear(LinearGaussian),
    Nuts(NutsKernel),
    Hmc(HmcKernel),
}

/// One entry of the sweep, with its own per-chain kernel state.
#[derive(Debug, Clone)]
struct Update {
    node: NodeId,
    name: String,
    kind: SamplerKind,
    kernel: Kernel,
}

impl Update {
    fn new(model: &JointModel, name: &str, kind: SamplerKind, config: &SamplerConfig) -> Result<Self> {
        let var = model.require(name)?;
        let node = var.id;
        let num_warmup = config.burn_in * config.inner_steps;
        let kernel = match kind {
            SamplerKind::ConjugateGamma => Kernel::Gamma(ConjugateGamma::new(model, node)?),
            SamplerKind::LinearGaussian => Kernel::Linear(LinearGaussian::new(model, node)?),
            SamplerKind::Nuts => Kernel::Nuts(NutsKernel::new(var.dim(), &config.nuts, num_warmup)),
            SamplerKind::Hmc => Kernel::Hmc(HmcKernel::new(&config.hmc, num_warmup)),
        };
        Ok(Self {
            node,
            name: name.to_string(),
            kind,
            kernel,
        })
    }

    fn draw(
        &mut self,
        model: &JointModel,
        state: &Values,
        inner_steps: usize,
        rng: &mut ChaCha8Rng,
    ) -> Result<Vec<f64>> {
        match &mut self.kernel {
            Kernel::Gamma(k) => k.sample(model, state, rng),
            Kernel::Linear(k) => k.sample(model, state, rng),
            Kernel::Nuts(k) => {
                let density = ConditionalDensity::new(model, self.node, state)?;
                let (transform, mut q) = start(&density, state, &self.name)?;
                for _ in 0..inner_steps {
                    q = k.step(&density, &q, rng)?;
                }
                Ok(transform.to_model(&q))
            }
            Kernel::Hmc(k) => {
                let density = ConditionalDensity::new(model, self.node, state)?;
                let (transform, mut q) = start(&density, state, &self.name)?;
                for _ in 0..inner_steps {
                    q = k.step(&density, &q, rng)?;
                }
                Ok(transform.to_model(&q))
            }
        }
    }

    fn accept_rate(&self) -> f64 {
        match &self.kernel {
            Kernel::Gamma(_) | Kernel::Linear(_) => 1.0,
            Kernel::Nuts(k) => k.accept_rate(),
            Kernel::Hmc(k) => k.accept_rate(),
        }
    }

    fn divergences(&self) -> usize {
        match &self.kernel {
            Kernel::Nuts(k) => k.divergences(),
            _ => 0,
        }
    }
}

fn start(density: &ConditionalDensity<'_>, state: &Values, name: &str) -> Result<(Transform, Vec<f64>)> {
    let transform = density.transform();
    let x = state
        .get(name)
        .ok_or_else(|| Error::UnknownVariable(name.to_string()))?;
    Ok((transform, transform.to_unconstrained(x)))
}

struct ChainOutput {
    /// draws[update][draw][component]
    draws: Vec<Vec<Vec<f64>>>,
    accept_rates: Vec<f64>,
    divergences: Vec<usize>,
}

fn run_chain(
    model: &JointModel,
    mut updates: Vec<Update>,
    mut state: Values,
    config: &SamplerConfig,
    rng: &mut ChaCha8Rng,
) -> Result<ChainOutput> {
    let mut draws: Vec<Vec<Vec<f64>>> = vec![Vec::with_capacity(config.num_samples); updates.len()];

    for sweep in 0..config.num_sweeps() {
        for update in updates.iter_mut() {
            let next = update.draw(model, &state, config.inner_steps, rng)?;
            state.insert(update.name.clone(), next);
        }

        let retained = sweep >= config.burn_in && (sweep - config.burn_in) % config.thin == 0;
        if retained {
            for (slot, update) in updates.iter().enumerate() {
                if let Some(v) = state.get(&update.name) {
                    draws[slot].push(v.clone());
                }
            }
        }
        if sweep + 1 == config.burn_in {
            log::debug!("burn-in complete after {} sweeps", config.burn_in);
        }
    }

    Ok(ChainOutput {
        draws,
        accept_rates: updates.iter().map(|u| u.accept_rate()).collect(),
        divergences: updates.iter().map(|u| u.divergences()).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::{Gamma, Gaussian, Gmrf, Lmrf};
    use crate::forward::{ForwardModel, LinearModel};
    use crate::geometry::{BoundaryCondition, Geometry};
    use std::sync::Arc;

    /// Identity forward map that hides its gradient.
    #[derive(Debug)]
    struct Opaque(usize);

    impl ForwardModel for Opaque {
        fn domain_dim(&self) -> usize {
            self.0
        }
        fn range_dim(&self) -> usize {
            self.0
        }
        fn forward(&self, x: &[f64]) -> Vec<f64> {
            x.to_vec()
        }
    }

    fn small_config() -> SamplerConfig {
        SamplerConfig {
            num_samples: 300,
            burn_in: 100,
            ..SamplerConfig::default()
        }
    }

    fn hierarchical(n: usize, lmrf: bool) -> JointModel {
        let a = Arc::new(LinearModel::identity(n).unwrap());
        let geom = Geometry::Continuous1D(n);
        let prior = if lmrf {
            Lmrf::new(0.0, "d", geom, BoundaryCondition::Zero).unwrap()
        } else {
            Gmrf::new(0.0, "d", geom, BoundaryCondition::Zero).unwrap()
        };
        let mut m = JointModel::new();
        m.add_variable("d", Gamma::new(1.0, 1e-4)).unwrap();
        m.add_variable("s", Gamma::new(1.0, 1e-4)).unwrap();
        m.add_variable("x", prior).unwrap();
        m.add_variable("y", Gaussian::new(Mean::forward(a, "x"), "s", n)).unwrap();
        let data: Vec<f64> = (0..n).map(|i| (i as f64 / n as f64 * 3.0).sin()).collect();
        m.observe("y", data).unwrap();
        m
    }

    #[test]
    fn test_plan_for_hierarchical_gmrf() {
        let sampler = PosteriorSampler::new(hierarchical(8, false), small_config()).unwrap();
        let plan = sampler.plan().unwrap();
        assert!(plan.is_gibbs());
        assert_eq!(plan.scan_order(), vec!["x", "d", "s"]);
        assert_eq!(plan.kind_of("x"), Some(SamplerKind::LinearGaussian));
        assert_eq!(plan.kind_of("d"), Some(SamplerKind::ConjugateGamma));
        assert_eq!(plan.kind_of("s"), Some(SamplerKind::ConjugateGamma));
    }

    #[test]
    fn test_plan_for_lmrf_uses_gradient_kernel() {
        let sampler = PosteriorSampler::new(hierarchical(8, true), small_config()).unwrap();
        assert_eq!(sampler.plan().unwrap().kind_of("x"), Some(SamplerKind::Nuts));

        let config = SamplerConfig {
            nonconjugate_kernel: GradientKernel::Hmc,
            ..small_config()
        };
        let sampler = PosteriorSampler::new(hierarchical(8, true), config).unwrap();
        assert_eq!(sampler.plan().unwrap().kind_of("x"), Some(SamplerKind::Hmc));
    }

    #[test]
    fn test_missing_data_or_unknowns_rejected() {
        let mut m = JointModel::new();
        m.add_variable("x", Gaussian::new(0.0, 1.0, 2)).unwrap();
        assert!(matches!(
            PosteriorSampler::new(m.clone(), small_config()),
            Err(Error::NoObservations)
        ));
        m.observe("x", vec![0.0, 0.0]).unwrap();
        assert!(matches!(
            PosteriorSampler::new(m, small_config()),
            Err(Error::NoUnknowns)
        ));
    }

    #[test]
    fn test_forced_samplers_checked() {
        let sampler = PosteriorSampler::new(hierarchical(4, true), small_config()).unwrap();
        assert!(matches!(
            sampler.clone().with_sampler("y", SamplerKind::Nuts),
            Err(Error::ObservedVariable(_))
        ));
        assert!(matches!(
            sampler.clone().with_sampler("x", SamplerKind::LinearGaussian),
            Err(Error::UnsupportedCombination { .. })
        ));
        assert!(matches!(
            sampler.clone().with_sampler("q", SamplerKind::Nuts),
            Err(Error::UnknownVariable(_))
        ));
        let forced = sampler.with_sampler("d", SamplerKind::Nuts).unwrap();
        assert_eq!(forced.plan().unwrap().kind_of("d"), Some(SamplerKind::Nuts));
    }

    #[test]
    fn test_initial_values_validated() {
        let sampler = PosteriorSampler::new(hierarchical(4, false), small_config()).unwrap();
        assert!(sampler.clone().with_initial("d", vec![-1.0]).is_err());
        assert!(sampler.clone().with_initial("x", vec![0.0; 3]).is_err());
        assert!(sampler.with_initial("x", vec![0.5; 4]).is_ok());
    }

    #[test]
    fn test_non_differentiable_forward_unsupported() {
        let mut m = JointModel::new();
        m.add_variable(
            "x",
            Lmrf::new(0.0, 1.0, Geometry::Continuous1D(3), BoundaryCondition::Zero).unwrap(),
        )
        .unwrap();
        m.add_variable("y", Gaussian::new(Mean::forward(Arc::new(Opaque(3)), "x"), 1.0, 3))
            .unwrap();
        m.observe("y", vec![0.0; 3]).unwrap();
        let sampler = PosteriorSampler::new(m, small_config()).unwrap();
        assert!(matches!(
            sampler.plan(),
            Err(Error::UnsupportedCombination { ref name, .. }) if name == "x"
        ));
    }

    #[test]
    fn test_gaussian_mean_recovered_by_exact_and_gradient_kernels() {
        // x ~ N(0, I), y | x ~ N(x, I), y = [2, -2]  =>  E[x | y] = [1, -1]
        let a = Arc::new(LinearModel::identity(2).unwrap());
        let mut m = JointModel::new();
        m.add_variable("x", Gaussian::new(0.0, 1.0, 2)).unwrap();
        m.add_variable("y", Gaussian::new(Mean::forward(a, "x"), 1.0, 2)).unwrap();
        m.observe("y", vec![2.0, -2.0]).unwrap();

        let config = SamplerConfig {
            num_samples: 2000,
            burn_in: 300,
            ..SamplerConfig::default()
        };
        for kind in [SamplerKind::LinearGaussian, SamplerKind::Nuts, SamplerKind::Hmc] {
            let samples = PosteriorSampler::new(m.clone(), config.clone())
                .unwrap()
                .with_sampler("x", kind)
                .unwrap()
                .sample()
                .unwrap();
            let x = samples.get("x").unwrap();
            assert_eq!(x.sampler, kind);
            assert_eq!(x.num_draws(), 2000);
            let mean = x.mean();
            assert!((mean[0] - 1.0).abs() < 0.12, "{}: mean = {:?}", kind, mean);
            assert!((mean[1] + 1.0).abs() < 0.12, "{}: mean = {:?}", kind, mean);
            let sd = x.std();
            assert!((sd[0] - 0.5_f64.sqrt()).abs() < 0.1, "{}: sd = {:?}", kind, sd);
        }
    }

    #[test]
    fn test_positive_variable_sampled_in_log_space() {
        // s ~ Gamma(2, 1), y | s ~ N(0, 1/s) with Σy² = 2.5
        //   =>  s | y ~ Gamma(4, 2.25), mean 16/9
        let mut m = JointModel::new();
        m.add_variable("s", Gamma::new(2.0, 1.0)).unwrap();
        m.add_variable("y", Gaussian::new(0.0, "s", 4)).unwrap();
        m.observe("y", vec![1.0, -1.0, 0.5, -0.5]).unwrap();
        let exact = 4.0 / 2.25;

        let config = SamplerConfig {
            num_samples: 4000,
            burn_in: 500,
            seed: 5,
            ..SamplerConfig::default()
        };
        assert_eq!(
            PosteriorSampler::new(m.clone(), config.clone()).unwrap().plan().unwrap().kind_of("s"),
            Some(SamplerKind::ConjugateGamma)
        );
        for kind in [SamplerKind::ConjugateGamma, SamplerKind::Nuts, SamplerKind::Hmc] {
            let samples = PosteriorSampler::new(m.clone(), config.clone())
                .unwrap()
                .with_sampler("s", kind)
                .unwrap()
                .sample()
                .unwrap();
            let s = samples.get("s").unwrap();
            assert_eq!(s.sampler, kind);
            assert!(s.draws().iter().flatten().all(|v| *v > 0.0), "{} left the support", kind);
            // Dropping the log-Jacobian would target Gamma(3, 2.25), mean 4/3.
            let mean = s.mean()[0];
            assert!((mean - exact).abs() < 0.15, "{}: mean = {}, exact {}", kind, mean, exact);
        }
    }

    #[test]
    fn test_chain_seeds_wrap_at_u64_max() {
        let config = SamplerConfig {
            num_chains: 2,
            num_samples: 20,
            burn_in: 5,
            seed: u64::MAX,
            ..SamplerConfig::default()
        };
        let wrapped = sample(hierarchical(4, false), config.clone()).unwrap();
        let from_zero = sample(
            hierarchical(4, false),
            SamplerConfig {
                num_chains: 1,
                seed: 0,
                ..config
            },
        )
        .unwrap();
        // Chain 1 of the first run is seeded with MAX + 1 = 0.
        assert_eq!(
            wrapped.get("x").unwrap().chains[1],
            from_zero.get("x").unwrap().chains[0]
        );
    }

    #[test]
    fn test_thinning_and_chain_count() {
        let config = SamplerConfig {
            num_chains: 2,
            num_samples: 50,
            burn_in: 10,
            thin: 3,
            ..SamplerConfig::default()
        };
        let samples = sample(hierarchical(6, false), config).unwrap();
        assert_eq!(samples.num_chains(), 2);
        assert_eq!(samples.num_draws(), 50);
        assert_eq!(samples.names(), vec!["d", "s", "x"]);
    }
}
