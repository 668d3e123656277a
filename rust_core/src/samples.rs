use crate::diagnostics::{self, DiagnosticsReport};
use crate::error::{Error, Result};
use crate::sampler::SamplerKind;

/// Retained draws of one variable across all chains.
#[derive(Debug, Clone)]
pub struct VariableSamples {
    pub name: String,
    pub dim: usize,
    /// chains[chain][draw][component]
    pub chains: Vec<Vec<Vec<f64>>>,
    /// Per-chain acceptance rate of the kernel that produced these draws.
    pub accept_rates: Vec<f64>,
    pub divergences: usize,
    pub sampler: SamplerKind,
}

impl VariableSamples {
    pub fn num_chains(&self) -> usize {
        self.chains.len()
    }

    /// Draws per chain.
    pub fn num_draws(&self) -> usize {
        self.chains.first().map_or(0, |c| c.len())
    }

    fn total_draws(&self) -> usize {
        self.chains.iter().map(|c| c.len()).sum()
    }

    /// Posterior mean of each component.
    pub fn mean(&self) -> Vec<f64> {
        let mut sums = vec![0.0; self.dim];
        for draw in self.chains.iter().flatten() {
            for (s, v) in sums.iter_mut().zip(draw) {
                *s += v;
            }
        }
        let n = self.total_draws() as f64;
        sums.iter().map(|s| s / n).collect()
    }

    /// Sample variance of each component.
    pub fn variance(&self) -> Vec<f64> {
        let means = self.mean();
        let mut sum_sq = vec![0.0; self.dim];
        for draw in self.chains.iter().flatten() {
            for ((s, v), m) in sum_sq.iter_mut().zip(draw).zip(&means) {
                let diff = v - m;
                *s += diff * diff;
            }
        }
        let n = self.total_draws();
        let denom = if n > 1 { (n - 1) as f64 } else { 1.0 };
        sum_sq.iter().map(|s| s / denom).collect()
    }

    pub fn std(&self) -> Vec<f64> {
        self.variance().iter().map(|v| v.sqrt()).collect()
    }

    /// Equal-tailed credible interval per component, as (lower, upper).
    pub fn credible_interval(&self, level: f64) -> Result<(Vec<f64>, Vec<f64>)> {
        diagnostics::check_credible_level(level)?;
        let mut lower = Vec::with_capacity(self.dim);
        let mut upper = Vec::with_capacity(self.dim);
        for k in 0..self.dim {
            let values: Vec<f64> = self.chains.iter().flatten().map(|d| d[k]).collect();
            let (lo, hi) = diagnostics::credible_interval(&values, level);
            lower.push(lo);
            upper.push(hi);
        }
        Ok((lower, upper))
    }

    /// Drop the first `burn` draws of each chain and keep every `thin`-th.
    pub fn burnthin(&self, burn: usize, thin: usize) -> Result<VariableSamples> {
        if thin == 0 {
            return Err(Error::Validation("thin must be at least 1".to_string()));
        }
        if burn >= self.num_draws() {
            return Err(Error::Validation(format!(
                "cannot discard {} of {} draws",
                burn,
                self.num_draws()
            )));
        }
        let chains = self
            .chains
            .iter()
            .map(|c| c.iter().skip(burn).step_by(thin).cloned().collect())
            .collect();
        Ok(VariableSamples {
            chains,
            ..self.clone()
        })
    }

    /// Trace of one component, one vector per chain.
    pub fn trace(&self, component: usize) -> Result<Vec<Vec<f64>>> {
        if component >= self.dim {
            return Err(Error::DimensionMismatch {
                name: format!("{}[{}]", self.name, component),
                expected: self.dim,
                actual: component + 1,
            });
        }
        Ok(self
            .chains
            .iter()
            .map(|c| c.iter().map(|d| d[component]).collect())
            .collect())
    }

    /// All draws with chains concatenated.
    pub fn draws(&self) -> Vec<Vec<f64>> {
        self.chains.iter().flatten().cloned().collect()
    }

    pub fn diagnostics(&self, credible_level: f64) -> Result<DiagnosticsReport> {
        diagnostics::check_credible_level(credible_level)?;
        Ok(diagnostics::compute_diagnostics(
            &self.name,
            &self.chains,
            credible_level,
            &self.accept_rates,
            self.divergences,
        ))
    }
}

/// Posterior draws for every unknown, in model declaration order.
#[derive(Debug, Clone, Default)]
pub struct SampleSet {
    variables: Vec<VariableSamples>,
}

impl SampleSet {
    pub(crate) fn new(variables: Vec<VariableSamples>) -> Self {
        Self { variables }
    }

    pub fn names(&self) -> Vec<&str> {
        self.variables.iter().map(|v| v.name.as_str()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&VariableSamples> {
        self.variables.iter().find(|v| v.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &VariableSamples> {
        self.variables.iter()
    }

    /// Number of sampled variables.
    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    pub fn num_chains(&self) -> usize {
        self.variables.first().map_or(0, |v| v.num_chains())
    }

    /// Retained draws per chain.
    pub fn num_draws(&self) -> usize {
        self.variables.first().map_or(0, |v| v.num_draws())
    }

    pub fn sampler_of(&self, name: &str) -> Option<SamplerKind> {
        self.get(name).map(|v| v.sampler)
    }

    /// Diagnostics over all variables, concatenated.
    pub fn diagnostics(&self, credible_level: f64) -> Result<DiagnosticsReport> {
        diagnostics::check_credible_level(credible_level)?;
        let mut report = DiagnosticsReport {
            params: Vec::new(),
            credible_level,
            num_chains: self.num_chains(),
            num_draws: self.num_draws(),
            accept_rates: Vec::new(),
            divergences: 0,
        };
        for v in &self.variables {
            report.merge(v.diagnostics(credible_level)?);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn samples() -> VariableSamples {
        // Two chains of draws [i, -i] for i = 0..10 and 10..20.
        let chains = (0..2)
            .map(|c| {
                (0..10)
                    .map(|i| {
                        let v = (c * 10 + i) as f64;
                        vec![v, -v]
                    })
                    .collect()
            })
            .collect();
        VariableSamples {
            name: "x".to_string(),
            dim: 2,
            chains,
            accept_rates: vec![1.0, 1.0],
            divergences: 0,
            sampler: SamplerKind::LinearGaussian,
        }
    }

    #[test]
    fn test_moments() {
        let s = samples();
        assert_eq!(s.num_draws(), 10);
        let mean = s.mean();
        assert_relative_eq!(mean[0], 9.5);
        assert_relative_eq!(mean[1], -9.5);
        // Variance of 0..20 with n-1 denominator is 35.
        assert_relative_eq!(s.variance()[0], 35.0, epsilon = 1e-12);
        assert_relative_eq!(s.std()[1], 35.0_f64.sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn test_burnthin_per_chain() {
        let s = samples().burnthin(2, 3).unwrap();
        assert_eq!(s.num_draws(), 3);
        assert_eq!(s.trace(0).unwrap(), vec![vec![2.0, 5.0, 8.0], vec![12.0, 15.0, 18.0]]);
        assert!(samples().burnthin(10, 1).is_err());
        assert!(samples().burnthin(0, 0).is_err());
    }

    #[test]
    fn test_interval_and_lookup() {
        let s = samples();
        let (lo, hi) = s.credible_interval(0.9).unwrap();
        assert!(lo[0] < 2.0 && hi[0] > 17.0);
        assert!(s.credible_interval(1.5).is_err());
        assert!(s.trace(2).is_err());
        assert_eq!(s.draws().len(), 20);

        let set = SampleSet::new(vec![s]);
        assert_eq!(set.names(), vec!["x"]);
        assert_eq!(set.sampler_of("x"), Some(SamplerKind::LinearGaussian));
        assert!(set.get("y").is_none());
        assert_eq!(set.diagnostics(0.95).unwrap().params.len(), 2);
        for level in [0.0, 1.0, -0.5, 95.0, f64::NAN] {
            assert!(
                matches!(set.diagnostics(level), Err(Error::Validation(_))),
                "level {} accepted",
                level
            );
        }
    }
}
