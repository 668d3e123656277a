use ndarray::Array2;
use numpy::{IntoPyArray, PyArray1, PyReadonlyArray1, PyReadonlyArray2};
use pyo3::exceptions::{PyTypeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;
use std::sync::Arc;
use uqmc_core::distributions::{Gamma, Gaussian, Gmrf, Lmrf};
use uqmc_core::{
    BoundaryCondition, Deconvolution1D, ForwardModel, Geometry, GradientKernel, JointModel,
    LinearModel, Mean, Param, Phantom1D, Psf, SampleSet, SamplerConfig,
};

fn to_py_err(e: uqmc_core::Error) -> PyErr {
    PyValueError::new_err(e.to_string())
}

/// Dense linear forward operator.
#[pyclass]
#[derive(Debug, Clone)]
struct Operator {
    inner: Arc<LinearModel>,
}

#[pymethods]
impl Operator {
    #[new]
    fn new(matrix: PyReadonlyArray2<'_, f64>) -> PyResult<Self> {
        let view = matrix.as_array();
        let (rows, cols) = view.dim();
        let data: Vec<f64> = view.iter().copied().collect();
        let inner = LinearModel::from_row_slice(rows, cols, &data).map_err(to_py_err)?;
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    #[getter]
    fn shape(&self) -> (usize, usize) {
        (self.inner.range_dim(), self.inner.domain_dim())
    }

    fn apply<'py>(&self, py: Python<'py>, x: PyReadonlyArray1<'_, f64>) -> PyResult<Bound<'py, PyArray1<f64>>> {
        let x = x.as_slice()?;
        if x.len() != self.inner.domain_dim() {
            return Err(PyValueError::new_err(format!(
                "expected a vector of length {}, got {}",
                self.inner.domain_dim(),
                x.len()
            )));
        }
        Ok(PyArray1::from_vec(py, self.inner.forward(x)))
    }

    fn __repr__(&self) -> String {
        let (m, n) = self.shape();
        format!("Operator({} × {})", m, n)
    }
}

fn parse_phantom(name: &str) -> PyResult<Phantom1D> {
    Ok(match name.to_ascii_lowercase().as_str() {
        "gauss" => Phantom1D::Gauss,
        "sinc" => Phantom1D::Sinc,
        "square" => Phantom1D::Square,
        "hat" => Phantom1D::Hat,
        "bumps" => Phantom1D::Bumps,
        "pc" | "piecewise" | "piecewiseconstant" => Phantom1D::PiecewiseConstant,
        other => return Err(PyValueError::new_err(format!("unknown phantom '{}'", other))),
    })
}

fn parse_psf(name: &str, param: f64, beta: f64) -> PyResult<Psf> {
    Ok(match name.to_ascii_lowercase().as_str() {
        "gauss" => Psf::Gauss { sigma: param },
        "moffat" => Psf::Moffat { sigma: param, beta },
        "defocus" => Psf::Defocus { radius: param },
        other => return Err(PyValueError::new_err(format!("unknown psf '{}'", other))),
    })
}

fn parse_bc(name: &str) -> PyResult<BoundaryCondition> {
    Ok(match name.to_ascii_lowercase().as_str() {
        "zero" => BoundaryCondition::Zero,
        "periodic" => BoundaryCondition::Periodic,
        "neumann" => BoundaryCondition::Neumann,
        other => {
            return Err(PyValueError::new_err(format!(
                "unknown boundary condition '{}'",
                other
            )))
        }
    })
}

/// Generate a 1D deconvolution problem.
///
/// Returns a dict with `operator`, `data`, `exact_solution`, `exact_data`
/// and `noise_std`.
#[pyfunction]
#[pyo3(signature = (dim=128, phantom="gauss", psf="gauss", psf_param=0.05, moffat_beta=3.0, noise_std=0.01, seed=0))]
#[allow(clippy::too_many_arguments)]
fn deconvolution_1d<'py>(
    py: Python<'py>,
    dim: usize,
    phantom: &str,
    psf: &str,
    psf_param: f64,
    moffat_beta: f64,
    noise_std: f64,
    seed: u64,
) -> PyResult<Bound<'py, PyDict>> {
    let problem = Deconvolution1D {
        dim,
        phantom: parse_phantom(phantom)?,
        psf: parse_psf(psf, psf_param, moffat_beta)?,
        noise_std,
        seed,
    }
    .build()
    .map_err(to_py_err)?;

    let dict = PyDict::new(py);
    dict.set_item("operator", Py::new(py, Operator { inner: problem.model })?)?;
    dict.set_item("data", PyArray1::from_vec(py, problem.data))?;
    dict.set_item("exact_solution", PyArray1::from_vec(py, problem.exact_solution))?;
    dict.set_item("exact_data", PyArray1::from_vec(py, problem.exact_data))?;
    dict.set_item("noise_std", problem.noise_std)?;
    Ok(dict)
}

/// A number or the name of a declared scalar variable.
fn extract_param(obj: &Bound<'_, PyAny>) -> PyResult<Param> {
    if let Ok(v) = obj.extract::<f64>() {
        Ok(Param::Const(v))
    } else if let Ok(name) = obj.extract::<String>() {
        Ok(Param::Var(name))
    } else {
        Err(PyTypeError::new_err("expected a float or a variable name"))
    }
}

/// A number, a 1-D array, or `operator @ input` when both are given.
fn extract_mean(
    mean: Option<&Bound<'_, PyAny>>,
    operator: Option<PyRef<'_, Operator>>,
    input: Option<&str>,
) -> PyResult<Mean> {
    match (operator, input) {
        (Some(op), Some(input)) => {
            if mean.is_some() {
                return Err(PyValueError::new_err("give either mean or operator/input, not both"));
            }
            return Ok(Mean::forward(op.inner.clone(), input));
        }
        (None, None) => {}
        _ => return Err(PyValueError::new_err("operator and input must be given together")),
    }
    let Some(mean) = mean else {
        return Ok(Mean::Zero);
    };
    if let Ok(v) = mean.extract::<f64>() {
        Ok(Mean::Scalar(v))
    } else if let Ok(v) = mean.extract::<Vec<f64>>() {
        Ok(Mean::Vector(v))
    } else {
        Err(PyTypeError::new_err("mean must be a float or a sequence of floats"))
    }
}

fn geometry(dim: usize, image: Option<(usize, usize)>) -> PyResult<Geometry> {
    match image {
        None => Ok(Geometry::Continuous1D(dim)),
        Some((rows, cols)) if rows * cols == dim => Ok(Geometry::Image2D { rows, cols }),
        Some((rows, cols)) => Err(PyValueError::new_err(format!(
            "image shape {}x{} does not match dim {}",
            rows, cols, dim
        ))),
    }
}

/// Declares variables in order; later declarations may reference earlier
/// ones by name.
#[pyclass]
#[derive(Debug, Clone, Default)]
struct ModelBuilder {
    model: JointModel,
}

#[pymethods]
impl ModelBuilder {
    #[new]
    fn new() -> Self {
        Self::default()
    }

    fn gamma(&mut self, name: &str, shape: f64, rate: f64) -> PyResult<()> {
        self.model
            .add_variable(name, Gamma::new(shape, rate))
            .map_err(to_py_err)?;
        Ok(())
    }

    #[pyo3(signature = (name, precision, dim, mean=None, operator=None, input=None))]
    fn gaussian(
        &mut self,
        name: &str,
        precision: &Bound<'_, PyAny>,
        dim: usize,
        mean: Option<&Bound<'_, PyAny>>,
        operator: Option<PyRef<'_, Operator>>,
        input: Option<&str>,
    ) -> PyResult<()> {
        let mean = extract_mean(mean, operator, input)?;
        self.model
            .add_variable(name, Gaussian::new(mean, extract_param(precision)?, dim))
            .map_err(to_py_err)?;
        Ok(())
    }

    #[pyo3(signature = (name, precision, dim, bc="zero", image=None, mean=None))]
    fn gmrf(
        &mut self,
        name: &str,
        precision: &Bound<'_, PyAny>,
        dim: usize,
        bc: &str,
        image: Option<(usize, usize)>,
        mean: Option<&Bound<'_, PyAny>>,
    ) -> PyResult<()> {
        let dist = Gmrf::new(
            extract_mean(mean, None, None)?,
            extract_param(precision)?,
            geometry(dim, image)?,
            parse_bc(bc)?,
        )
        .map_err(to_py_err)?;
        self.model.add_variable(name, dist).map_err(to_py_err)?;
        Ok(())
    }

    #[pyo3(signature = (name, rate, dim, bc="zero", image=None, location=None))]
    fn lmrf(
        &mut self,
        name: &str,
        rate: &Bound<'_, PyAny>,
        dim: usize,
        bc: &str,
        image: Option<(usize, usize)>,
        location: Option<&Bound<'_, PyAny>>,
    ) -> PyResult<()> {
        let dist = Lmrf::new(
            extract_mean(location, None, None)?,
            extract_param(rate)?,
            geometry(dim, image)?,
            parse_bc(bc)?,
        )
        .map_err(to_py_err)?;
        self.model.add_variable(name, dist).map_err(to_py_err)?;
        Ok(())
    }

    fn observe(&mut self, name: &str, data: PyReadonlyArray1<'_, f64>) -> PyResult<()> {
        self.model
            .observe(name, data.as_slice()?.to_vec())
            .map_err(to_py_err)
    }

    fn __repr__(&self) -> String {
        self.model.to_string()
    }
}

#[pyclass]
struct FitResult {
    samples: SampleSet,
}

#[pymethods]
impl FitResult {
    /// Draws of each variable as a (chains·draws) × dim array.
    fn get_samples<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let dict = PyDict::new(py);
        for v in self.samples.iter() {
            let draws = v.draws();
            let mut arr = Array2::<f64>::zeros((draws.len(), v.dim));
            for (i, draw) in draws.iter().enumerate() {
                for (k, x) in draw.iter().enumerate() {
                    arr[[i, k]] = *x;
                }
            }
            dict.set_item(&v.name, arr.into_pyarray(py))?;
        }
        Ok(dict)
    }

    fn mean<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let dict = PyDict::new(py);
        for v in self.samples.iter() {
            dict.set_item(&v.name, PyArray1::from_vec(py, v.mean()))?;
        }
        Ok(dict)
    }

    fn std<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let dict = PyDict::new(py);
        for v in self.samples.iter() {
            dict.set_item(&v.name, PyArray1::from_vec(py, v.std()))?;
        }
        Ok(dict)
    }

    fn samplers<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let dict = PyDict::new(py);
        for v in self.samples.iter() {
            dict.set_item(&v.name, v.sampler.to_string())?;
        }
        Ok(dict)
    }

    #[pyo3(signature = (credible_level=0.95))]
    fn summary(&self, credible_level: f64) -> PyResult<String> {
        let report = self.samples.diagnostics(credible_level).map_err(to_py_err)?;
        Ok(report.to_table())
    }

    fn __repr__(&self) -> String {
        let parts: Vec<String> = self
            .samples
            .iter()
            .map(|v| format!("  {} (dim {}): {}", v.name, v.dim, v.sampler))
            .collect();
        format!(
            "uqmc FitResult ({} chains × {} draws)\n{}",
            self.samples.num_chains(),
            self.samples.num_draws(),
            parts.join("\n")
        )
    }
}

#[pyfunction]
#[pyo3(signature = (model, data=None, chains=1, samples=1000, burn_in=200, thin=1, seed=42, threads=0, kernel="nuts", config_path=None))]
#[allow(clippy::too_many_arguments)]
fn sample(
    py: Python<'_>,
    model: &ModelBuilder,
    data: Option<&Bound<'_, PyDict>>,
    chains: usize,
    samples: usize,
    burn_in: usize,
    thin: usize,
    seed: u64,
    threads: usize,
    kernel: &str,
    config_path: Option<&str>,
) -> PyResult<FitResult> {
    let mut joint = model.model.clone();
    if let Some(data) = data {
        for (key, value) in data.iter() {
            let name: String = key.extract()?;
            let arr: PyReadonlyArray1<'_, f64> = value.extract()?;
            joint
                .observe(&name, arr.as_slice()?.to_vec())
                .map_err(to_py_err)?;
        }
    }

    let config = match config_path {
        Some(path) => SamplerConfig::from_file(path).map_err(to_py_err)?,
        None => SamplerConfig {
            num_chains: chains,
            num_samples: samples,
            burn_in,
            thin,
            seed,
            num_threads: threads,
            nonconjugate_kernel: match kernel.to_ascii_lowercase().as_str() {
                "nuts" => GradientKernel::Nuts,
                "hmc" => GradientKernel::Hmc,
                other => return Err(PyValueError::new_err(format!("unknown kernel '{}'", other))),
            },
            ..SamplerConfig::default()
        },
    };

    let samples = py
        .allow_threads(|| uqmc_core::sample(joint, config))
        .map_err(to_py_err)?;
    Ok(FitResult { samples })
}

#[pymodule]
fn uqmc(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<Operator>()?;
    m.add_class::<ModelBuilder>()?;
    m.add_class::<FitResult>()?;
    m.add_function(wrap_pyfunction!(deconvolution_1d, m)?)?;
    m.add_function(wrap_pyfunction!(sample, m)?)?;
    Ok(())
}
