//! One-object workflow: a joint model, the name of its likelihood variable
//! and the data bound to it.

use crate::config::SamplerConfig;
use crate::diagnostics::{self, DiagnosticsReport};
use crate::error::{Error, Result};
use crate::graph::JointModel;
use crate::samples::SampleSet;
use crate::sampler::{PosteriorSampler, SamplerKind};
use std::collections::HashMap;

/// Options for [`BayesianProblem::uq`].
#[derive(Debug, Clone)]
pub struct UqOptions {
    /// Reference values to compare the posterior against, by variable name.
    pub exact: HashMap<String, Vec<f64>>,
    pub credible_level: f64,
    pub config: SamplerConfig,
}

impl Default for UqOptions {
    fn default() -> Self {
        Self {
            exact: HashMap::new(),
            credible_level: 0.95,
            config: SamplerConfig::default(),
        }
    }
}

impl UqOptions {
    pub fn with_exact(mut self, name: &str, values: Vec<f64>) -> Self {
        self.exact.insert(name.to_string(), values);
        self
    }
}

/// Posterior summary of one variable.
#[derive(Debug, Clone)]
pub struct VariableSummary {
    pub name: String,
    pub sampler: SamplerKind,
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
    /// `‖mean − exact‖ / ‖exact‖`.
    pub relative_error: Option<f64>,
    /// Fraction of components whose exact value lies in the interval.
    pub coverage: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct UqReport {
    pub samples: SampleSet,
    pub summaries: Vec<VariableSummary>,
    pub diagnostics: DiagnosticsReport,
}

impl UqReport {
    pub fn summary(&self, name: &str) -> Option<&VariableSummary> {
        self.summaries.iter().find(|s| s.name == name)
    }

    pub fn to_table(&self) -> String {
        let mut lines = Vec::new();
        lines.push(format!(
            "{:<10} {:>5} {:<15} {:>12} {:>12} {:>10} {:>9}",
            "Variable", "dim", "sampler", "mean", "std", "rel_err", "coverage"
        ));
        lines.push("─".repeat(79));
        for s in &self.summaries {
            // Vectors are reported by their average component.
            let avg = |v: &[f64]| v.iter().sum::<f64>() / v.len().max(1) as f64;
            let opt = |v: Option<f64>| v.map_or("-".to_string(), |x| format!("{:.4}", x));
            lines.push(format!(
                "{:<10} {:>5} {:<15} {:>12.4e} {:>12.4e} {:>10} {:>9}",
                s.name,
                s.mean.len(),
                s.sampler.to_string(),
                avg(&s.mean),
                avg(&s.std),
                opt(s.relative_error),
                opt(s.coverage),
            ));
        }
        lines.push("─".repeat(79));
        lines.push(format!(
            "{:.0}% credible intervals  │  max R-hat: {:.3}  │  min bulk ESS: {:.0}  │  divergences: {}",
            100.0 * self.diagnostics.credible_level,
            self.diagnostics.max_r_hat(),
            self.diagnostics.min_ess_bulk(),
            self.diagnostics.divergences
        ));
        lines.join("\n")
    }
}

/// A joint model plus the data for its likelihood variable.
#[derive(Debug, Clone)]
pub struct BayesianProblem {
    model: JointModel,
    likelihood: String,
    data: Option<Vec<f64>>,
}

impl BayesianProblem {
    /// `likelihood_name` is the variable the data will be bound to.
    pub fn new(likelihood_name: &str, model: JointModel) -> Result<Self> {
        let var = model.require(likelihood_name)?;
        let data = var.observed.clone();
        Ok(Self {
            model,
            likelihood: likelihood_name.to_string(),
            data,
        })
    }

    pub fn likelihood_name(&self) -> &str {
        &self.likelihood
    }

    pub fn model(&self) -> &JointModel {
        &self.model
    }

    pub fn set_data(&mut self, data: Vec<f64>) -> Result<()> {
        // Validate length and finiteness against the declared variable.
        self.model.condition(&self.likelihood, data.clone())?;
        self.data = Some(data);
        Ok(())
    }

    /// The model conditioned on the data.
    pub fn posterior(&self) -> Result<JointModel> {
        let data = self.data.clone().ok_or(Error::NoObservations)?;
        self.model.condition(&self.likelihood, data)
    }

    pub fn sample_posterior(&self, config: SamplerConfig) -> Result<SampleSet> {
        PosteriorSampler::new(self.posterior()?, config)?.sample()
    }

    /// Sample the posterior and summarize every unknown.
    pub fn uq(&self, options: &UqOptions) -> Result<UqReport> {
        let level = options.credible_level;
        diagnostics::check_credible_level(level)?;
        for (name, values) in &options.exact {
            let var = self.model.require(name)?;
            if values.len() != var.dim() {
                return Err(Error::DimensionMismatch {
                    name: name.clone(),
                    expected: var.dim(),
                    actual: values.len(),
                });
            }
        }

        let samples = self.sample_posterior(options.config.clone())?;
        let mut summaries = Vec::with_capacity(samples.len());
        for v in samples.iter() {
            let mean = v.mean();
            let (lower, upper) = v.credible_interval(level)?;
            let (relative_error, coverage) = match options.exact.get(&v.name) {
                Some(exact) => (
                    Some(relative_error(&mean, exact)),
                    Some(coverage(&lower, &upper, exact)),
                ),
                None => (None, None),
            };
            summaries.push(VariableSummary {
                name: v.name.clone(),
                sampler: v.sampler,
                std: v.std(),
                mean,
                lower,
                upper,
                relative_error,
                coverage,
            });
        }
        let diagnostics = samples.diagnostics(level)?;

        for s in &summaries {
            if let (Some(err), Some(cov)) = (s.relative_error, s.coverage) {
                log::info!(
                    "{}: relative error {:.3}, {:.0}% of exact values inside the {:.0}% interval",
                    s.name,
                    err,
                    100.0 * cov,
                    100.0 * level
                );
            }
        }

        Ok(UqReport {
            samples,
            summaries,
            diagnostics,
        })
    }
}

fn relative_error(estimate: &[f64], exact: &[f64]) -> f64 {
    let diff: f64 = estimate
        .iter()
        .zip(exact)
        .map(|(e, x)| (e - x).powi(2))
        .sum::<f64>()
        .sqrt();
    let norm: f64 = exact.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm > 0.0 {
        diff / norm
    } else {
        diff
    }
}

fn coverage(lower: &[f64], upper: &[f64], exact: &[f64]) -> f64 {
    let inside = exact
        .iter()
        .zip(lower.iter().zip(upper))
        .filter(|(x, (lo, hi))| *lo <= *x && *x <= *hi)
        .count();
    inside as f64 / exact.len().max(1) as f64
}
