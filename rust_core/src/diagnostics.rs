//! MCMC diagnostic computations: R-hat, ESS, MCSE, credible intervals.
//!
//! All algorithms follow the definitions in:
//!   Vehtari et al. (2021) "Rank-normalization, folding, and localization:
//!   An improved R-hat for assessing convergence of MCMC"

use crate::error::{Error, Result};
use statrs::distribution::{ContinuousCDF, Normal};

/// Per-component diagnostic summary.
#[derive(Debug, Clone)]
pub struct ParamDiagnostics {
    /// Variable name, with `[i]` appended for vector components.
    pub name: String,
    pub mean: f64,
    pub std: f64,
    pub lower: f64,
    pub upper: f64,
    pub ess_bulk: f64,
    pub ess_tail: f64,
    pub r_hat: f64,
    pub mcse_mean: f64,
}

/// Diagnostic report for one sampled variable or a whole run.
#[derive(Debug, Clone)]
pub struct DiagnosticsReport {
    pub params: Vec<ParamDiagnostics>,
    pub credible_level: f64,
    pub num_chains: usize,
    pub num_draws: usize,
    pub accept_rates: Vec<f64>,
    pub divergences: usize,
}

impl DiagnosticsReport {
    pub fn merge(&mut self, other: DiagnosticsReport) {
        self.params.extend(other.params);
        self.accept_rates.extend(other.accept_rates);
        self.divergences += other.divergences;
    }

    pub fn max_r_hat(&self) -> f64 {
        self.params
            .iter()
            .map(|p| p.r_hat)
            .filter(|r| r.is_finite())
            .fold(f64::NAN, f64::max)
    }

    pub fn min_ess_bulk(&self) -> f64 {
        self.params
            .iter()
            .map(|p| p.ess_bulk)
            .filter(|e| e.is_finite())
            .fold(f64::NAN, f64::min)
    }

    /// Render the diagnostics as a formatted table string.
    pub fn to_table(&self) -> String {
        let lo_label = format!("{:.1}%", 50.0 * (1.0 - self.credible_level));
        let hi_label = format!("{:.1}%", 50.0 * (1.0 + self.credible_level));
        let mut lines = Vec::new();
        lines.push(format!(
            "{} chains × {} draws per chain",
            self.num_chains, self.num_draws
        ));
        lines.push(String::new());
        lines.push(format!(
            "{:<12} {:>10} {:>10} {:>10} {:>10} {:>9} {:>9} {:>7} {:>10}",
            "Parameter", "mean", "std", lo_label, hi_label, "ess_bulk", "ess_tail", "r_hat", "mcse_mean"
        ));
        lines.push("─".repeat(95));

        for p in &self.params {
            lines.push(format!(
                "{:<12} {:>10.4} {:>10.4} {:>10.4} {:>10.4} {:>9} {:>9} {:>7.3} {:>10.2e}",
                p.name,
                p.mean,
                p.std,
                p.lower,
                p.upper,
                fmt_ess(p.ess_bulk),
                fmt_ess(p.ess_tail),
                p.r_hat,
                p.mcse_mean,
            ));
        }

        lines.push("─".repeat(95));

        if !self.accept_rates.is_empty() {
            let avg_accept: f64 =
                self.accept_rates.iter().sum::<f64>() / self.accept_rates.len() as f64;
            lines.push(format!(
                "Mean accept rate: {:.2}  │  Divergences: {}",
                avg_accept, self.divergences
            ));
        }

        let any_bad_rhat = self.params.iter().any(|p| p.r_hat > 1.05);
        let any_low_ess = self.params.iter().any(|p| p.ess_bulk < 400.0 || p.ess_tail < 400.0);

        if any_bad_rhat {
            lines.push("⚠  Some R-hat values > 1.05; chains may not have converged.".to_string());
        }
        if any_low_ess {
            lines.push("⚠  Some ESS values < 400; consider more samples or thinning.".to_string());
        }
        if self.divergences > 0 {
            lines.push(format!(
                "⚠  {} divergent transitions; results may be unreliable.",
                self.divergences
            ));
        }

        lines.join("\n")
    }
}

fn fmt_ess(ess: f64) -> String {
    if ess.is_finite() {
        format!("{:.0}", ess)
    } else {
        "NaN".to_string()
    }
}

/// Compute diagnostics for every component of samples[chain][draw][component].
///
/// Components of a vector variable are named `name[i]`; a scalar keeps its
/// bare name.
pub fn compute_diagnostics(
    name: &str,
    samples: &[Vec<Vec<f64>>],
    credible_level: f64,
    accept_rates: &[f64],
    divergences: usize,
) -> DiagnosticsReport {
    let n_chains = samples.len();
    let n_draws = samples.first().map_or(0, |c| c.len());
    let dim = samples
        .first()
        .and_then(|c| c.first())
        .map_or(0, |d| d.len());

    let params = (0..dim)
        .map(|k| {
            let chains: Vec<Vec<f64>> = samples
                .iter()
                .map(|chain| chain.iter().map(|draw| draw[k]).collect())
                .collect();
            let label = if dim == 1 {
                name.to_string()
            } else {
                format!("{}[{}]", name, k)
            };
            summarize(&label, &chains, credible_level)
        })
        .collect();

    DiagnosticsReport {
        params,
        credible_level,
        num_chains: n_chains,
        num_draws: n_draws,
        accept_rates: accept_rates.to_vec(),
        divergences,
    }
}

/// Summary of one scalar trace split across chains.
pub fn summarize(name: &str, chains: &[Vec<f64>], credible_level: f64) -> ParamDiagnostics {
    let all: Vec<f64> = chains.iter().flat_map(|c| c.iter().copied()).collect();
    let mean = mean(&all);
    let std = std_dev(&all, mean);
    let (lower, upper) = credible_interval(&all, credible_level);

    let usable = !chains.is_empty() && chains.iter().all(|c| c.len() >= 4);
    let (ess_bulk, ess_tail, r_hat, mcse_mean) = if usable {
        let ess_mean = ess_raw(chains);
        let mcse = if ess_mean > 0.0 {
            std / ess_mean.sqrt()
        } else {
            f64::NAN
        };
        (ess_bulk_chains(chains), ess_tail_chains(chains), r_hat_chains(chains), mcse)
    } else {
        (f64::NAN, f64::NAN, f64::NAN, f64::NAN)
    };

    ParamDiagnostics {
        name: name.to_string(),
        mean,
        std,
        lower,
        upper,
        ess_bulk,
        ess_tail,
        r_hat,
        mcse_mean,
    }
}

pub fn check_credible_level(level: f64) -> Result<()> {
    if !(level > 0.0 && level < 1.0) {
        return Err(Error::Validation(format!(
            "credible level must lie in (0, 1), got {}",
            level
        )));
    }
    Ok(())
}

/// Equal-tailed interval holding `level` of the draws.
pub fn credible_interval(values: &[f64], level: f64) -> (f64, f64) {
    let mut sorted = values.to_vec();
    sorted.sort_unstable_by(|a, b| a.total_cmp(b));
    let alpha = 0.5 * (1.0 - level);
    (quantile_sorted(&sorted, alpha), quantile_sorted(&sorted, 1.0 - alpha))
}

// ── Internal helpers ────────────────────────────────────────────────

fn mean(data: &[f64]) -> f64 {
    if data.is_empty() {
        return f64::NAN;
    }
    data.iter().sum::<f64>() / data.len() as f64
}

fn std_dev(data: &[f64], mean: f64) -> f64 {
    if data.len() < 2 {
        return 0.0;
    }
    let ss: f64 = data.iter().map(|v| (v - mean).powi(2)).sum();
    (ss / (data.len() - 1) as f64).sqrt()
}

fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let idx = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = idx.floor() as usize;
    let hi = (idx.ceil() as usize).min(sorted.len() - 1);
    let frac = idx - lo as f64;
    sorted[lo] * (1.0 - frac) + sorted[hi] * frac
}

/// Within-chain variance `W` and pooled estimate `var⁺` of split chains.
fn variance_components(split: &[Vec<f64>]) -> (f64, f64) {
    let m = split.len() as f64;
    let n = split[0].len() as f64;
    let chain_means: Vec<f64> = split.iter().map(|c| mean(c)).collect();
    let grand_mean = chain_means.iter().sum::<f64>() / m;

    let b = if m > 1.0 {
        n / (m - 1.0)
            * chain_means
                .iter()
                .map(|&cm| (cm - grand_mean).powi(2))
                .sum::<f64>()
    } else {
        0.0
    };
    let w = split
        .iter()
        .zip(&chain_means)
        .map(|(c, &cm)| c.iter().map(|&x| (x - cm).powi(2)).sum::<f64>() / (n - 1.0))
        .sum::<f64>()
        / m;

    (w, (n - 1.0) / n * w + b / n)
}

/// Split R-hat: split each chain in half, treat as 2M chains.
fn r_hat_chains(chains: &[Vec<f64>]) -> f64 {
    let split = split_chains(chains);
    let (w, var_plus) = variance_components(&split);
    if w < 1e-30 {
        return f64::NAN;
    }
    (var_plus / w).sqrt()
}

/// Bulk ESS using rank-normalized values.
fn ess_bulk_chains(chains: &[Vec<f64>]) -> f64 {
    ess_raw(&rank_normalize(chains))
}

/// Tail ESS: minimum of ESS for the 5% and 95% quantile indicators.
fn ess_tail_chains(chains: &[Vec<f64>]) -> f64 {
    let mut sorted: Vec<f64> = chains.iter().flat_map(|c| c.iter().copied()).collect();
    sorted.sort_unstable_by(|a, b| a.total_cmp(b));
    let q05 = quantile_sorted(&sorted, 0.05);
    let q95 = quantile_sorted(&sorted, 0.95);

    let indicator = |pred: &dyn Fn(f64) -> bool| -> Vec<Vec<f64>> {
        chains
            .iter()
            .map(|c| c.iter().map(|&x| if pred(x) { 1.0 } else { 0.0 }).collect())
            .collect()
    };
    let ess_lo = ess_raw(&indicator(&|x: f64| x <= q05));
    let ess_hi = ess_raw(&indicator(&|x: f64| x >= q95));
    ess_lo.min(ess_hi)
}

/// Replace values with normal scores of their pooled ranks.
fn rank_normalize(chains: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let n_chains = chains.len();
    let n_per = chains[0].len();
    let Ok(normal) = Normal::new(0.0, 1.0) else {
        return vec![vec![f64::NAN; n_per]; n_chains];
    };

    let mut indexed: Vec<(f64, usize, usize)> = chains
        .iter()
        .enumerate()
        .flat_map(|(ci, c)| c.iter().enumerate().map(move |(di, &v)| (v, ci, di)))
        .collect();
    indexed.sort_unstable_by(|a, b| a.0.total_cmp(&b.0));
    let total = indexed.len();

    // Average ranks over ties.
    let mut result = vec![vec![0.0; n_per]; n_chains];
    let n_f = total as f64;
    let mut i = 0;
    while i < total {
        let mut j = i;
        while j < total && indexed[j].0 == indexed[i].0 {
            j += 1;
        }
        let avg_rank = (i + j + 1) as f64 / 2.0;
        // Blom offset: Φ⁻¹((r - 3/8) / (N + 1/4))
        let z = normal.inverse_cdf((avg_rank - 0.375) / (n_f + 0.25));
        for &(_, ci, di) in &indexed[i..j] {
            result[ci][di] = z;
        }
        i = j;
    }
    result
}

/// ESS of split chains with Geyer's initial monotone sequence. Autocovariances
/// are computed lag by lag and stop as soon as the sequence truncates.
fn ess_raw(chains: &[Vec<f64>]) -> f64 {
    let split = split_chains(chains);
    let m = split.len() as f64;
    let n = split[0].len();
    let n_f = n as f64;

    let (w, var_plus) = variance_components(&split);
    if w < 1e-30 || var_plus < 1e-30 {
        return f64::NAN;
    }
    let chain_means: Vec<f64> = split.iter().map(|c| mean(c)).collect();

    let rho = |lag: usize| -> f64 {
        let mut acov = 0.0;
        for (chain, &cm) in split.iter().zip(&chain_means) {
            let mut s = 0.0;
            for t in 0..n - lag {
                s += (chain[t] - cm) * (chain[t + lag] - cm);
            }
            acov += s / n_f;
        }
        acov /= m;
        1.0 - (w - acov) / var_plus
    };

    // τ = -1 + 2 Σ_k P_k, P_k = ρ_{2k} + ρ_{2k+1}, positive and non-increasing.
    let mut tau = -1.0;
    let mut prev_pair = f64::INFINITY;
    let mut k = 0;
    while 2 * k + 1 < n {
        let mut pair = rho(2 * k) + rho(2 * k + 1);
        if pair <= 0.0 {
            break;
        }
        if pair > prev_pair {
            pair = prev_pair;
        }
        tau += 2.0 * pair;
        prev_pair = pair;
        k += 1;
    }
    let tau = tau.max(1.0 / (m * n_f).log10().max(1.0));

    m * n_f / tau
}

fn split_chains(chains: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let mut split = Vec::with_capacity(chains.len() * 2);
    for chain in chains {
        let half = chain.len() / 2;
        // Odd lengths drop the middle draw.
        split.push(chain[..half].to_vec());
        split.push(chain[chain.len() - half..].to_vec());
    }
    split
}
