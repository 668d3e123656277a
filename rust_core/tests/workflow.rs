//! End-to-end deconvolution workflows on small problems.

use uqmc_core::distributions::{Gamma, Gaussian, Gmrf, Lmrf};
use uqmc_core::{
    BayesianProblem, BoundaryCondition, Deconvolution1D, Deconvolution2D, Error, JointModel, Mean,
    Param, Phantom1D, PosteriorSampler, SamplerConfig, SamplerKind, Target, TestProblem, UqOptions,
};

const N: usize = 32;

fn problem() -> TestProblem {
    Deconvolution1D {
        dim: N,
        phantom: Phantom1D::Gauss,
        seed: 1,
        ..Deconvolution1D::default()
    }
    .build()
    .unwrap()
}

/// `d ~ Gamma`, `x ~ GMRF(0, d)` or `LMRF(0, d)`, `y ~ N(A x, s)` with `s`
/// either known or Gamma distributed.
fn model(tp: &TestProblem, lmrf: bool, learn_noise: bool) -> JointModel {
    let mut m = JointModel::new();
    m.add_variable("d", Gamma::new(1.0, 1e-4)).unwrap();
    let noise: Param = if learn_noise {
        m.add_variable("s", Gamma::new(1.0, 1e-4)).unwrap();
        "s".into()
    } else {
        tp.noise_precision().into()
    };
    let prior = if lmrf {
        Lmrf::new(0.0, "d", tp.geometry, BoundaryCondition::Zero).unwrap()
    } else {
        Gmrf::new(0.0, "d", tp.geometry, BoundaryCondition::Zero).unwrap()
    };
    m.add_variable("x", prior).unwrap();
    m.add_variable("y", Gaussian::new(Mean::forward(tp.model.clone(), "x"), noise, N))
        .unwrap();
    m
}

fn config(seed: u64) -> SamplerConfig {
    SamplerConfig {
        num_samples: 500,
        burn_in: 100,
        seed,
        ..SamplerConfig::default()
    }
}

fn relative_difference(a: &[f64], b: &[f64]) -> f64 {
    let diff: f64 = a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum::<f64>().sqrt();
    let norm: f64 = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    diff / norm
}

#[test]
fn same_seed_reproduces_draws_and_seeds_agree_on_mean() {
    let tp = problem();
    let posterior = model(&tp, false, false).condition("y", tp.data.clone()).unwrap();

    let run = |seed| {
        PosteriorSampler::new(posterior.clone(), config(seed))
            .unwrap()
            .sample()
            .unwrap()
    };
    let a = run(7);
    let b = run(7);
    let c = run(8);

    let xa = a.get("x").unwrap();
    assert_eq!(xa.sampler, SamplerKind::LinearGaussian);
    assert_eq!(xa.chains, b.get("x").unwrap().chains, "same seed must give identical draws");

    let rel = relative_difference(&xa.mean(), &c.get("x").unwrap().mean());
    assert!(rel < 0.1, "posterior means differ by {} between seeds", rel);
}

#[test]
fn binding_data_reports_posterior_over_unbound_variables() {
    let tp = problem();
    let joint = model(&tp, false, true);
    let posterior = joint.condition("y", tp.data.clone()).unwrap();
    match posterior.target() {
        Target::Posterior { unknowns, observed } => {
            assert_eq!(unknowns, vec!["d", "s", "x"]);
            assert_eq!(observed, vec!["y"]);
        }
        other => panic!("expected a posterior, got {:?}", other),
    }
    assert!(matches!(joint.target(), Target::Joint { .. }));
    assert!(posterior.to_string().starts_with("Posterior("));
}

#[test]
fn hierarchical_model_samples_all_three_unknowns() {
    let tp = problem();
    let posterior = model(&tp, false, true).condition("y", tp.data.clone()).unwrap();
    let sampler = PosteriorSampler::new(posterior, config(3)).unwrap();
    assert!(sampler.plan().unwrap().is_gibbs());

    let samples = sampler.sample().unwrap();
    let mut names = samples.names();
    names.sort();
    assert_eq!(names, vec!["d", "s", "x"]);
    assert_eq!(samples.sampler_of("s"), Some(SamplerKind::ConjugateGamma));
    assert_eq!(samples.sampler_of("d"), Some(SamplerKind::ConjugateGamma));

    // Data were generated with noise precision 1e4.
    let s_mean = samples.get("s").unwrap().mean()[0];
    assert!((1e3..=1e5).contains(&s_mean), "noise precision mean {}", s_mean);
}

#[test]
fn switching_to_lmrf_changes_sampler_for_x() {
    let tp = problem();
    let short = SamplerConfig {
        num_samples: 50,
        burn_in: 50,
        ..SamplerConfig::default()
    };

    let gmrf = model(&tp, false, true).condition("y", tp.data.clone()).unwrap();
    let lmrf = model(&tp, true, true).condition("y", tp.data.clone()).unwrap();

    let gmrf_plan = PosteriorSampler::new(gmrf, short.clone()).unwrap().plan().unwrap();
    assert_eq!(gmrf_plan.kind_of("x"), Some(SamplerKind::LinearGaussian));

    let samples = PosteriorSampler::new(lmrf, short).unwrap().sample().unwrap();
    let x = samples.get("x").unwrap();
    assert_eq!(x.sampler, SamplerKind::Nuts);
    assert_eq!(x.num_draws(), 50);
    assert!(x.mean().iter().all(|v| v.is_finite()));
    assert_eq!(samples.sampler_of("d"), Some(SamplerKind::ConjugateGamma));
}

#[test]
fn uq_on_2d_problem_compares_with_exact_image() {
    let tp = Deconvolution2D {
        rows: 6,
        cols: 6,
        sigma: 0.08,
        noise_std: 0.01,
        ..Deconvolution2D::default()
    }
    .build()
    .unwrap();

    let mut m = JointModel::new();
    m.add_variable("d", Gamma::new(1.0, 1e-4)).unwrap();
    m.add_variable("x", Gmrf::new(0.0, "d", tp.geometry, BoundaryCondition::Zero).unwrap())
        .unwrap();
    m.add_variable(
        "y",
        Gaussian::new(Mean::forward(tp.model.clone(), "x"), tp.noise_precision(), 36),
    )
    .unwrap();

    let mut bp = BayesianProblem::new("y", m).unwrap();
    assert!(matches!(bp.sample_posterior(config(1)), Err(Error::NoObservations)));
    bp.set_data(tp.data.clone()).unwrap();

    let options = UqOptions {
        config: config(1),
        credible_level: 0.9,
        ..UqOptions::default()
    }
    .with_exact("x", tp.exact_solution.clone());
    let report = bp.uq(&options).unwrap();

    let x = report.summary("x").unwrap();
    assert_eq!(x.mean.len(), 36);
    assert!(x.relative_error.unwrap().is_finite());
    let cov = x.coverage.unwrap();
    assert!((0.0..=1.0).contains(&cov));
    assert!(report.summary("d").unwrap().relative_error.is_none());
    assert!(report.to_table().contains("90% credible intervals"));
}

#[test]
fn config_loaded_from_toml_drives_sampling() {
    let config = SamplerConfig::from_toml_str(
        r#"
        num_chains = 2
        num_samples = 40
        burn_in = 20
        thin = 2
        seed = 11
        "#,
    )
    .unwrap();
    let tp = problem();
    let posterior = model(&tp, false, false).condition("y", tp.data.clone()).unwrap();
    let samples = uqmc_core::sample(posterior, config).unwrap();
    assert_eq!(samples.num_chains(), 2);
    assert_eq!(samples.num_draws(), 40);
    assert_eq!(samples.get("x").unwrap().accept_rates, vec![1.0, 1.0]);
}
