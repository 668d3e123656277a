use crate::distributions::{Distribution, Env, Mean, Values};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fmt;

/// Unique identifier for a variable in the joint model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub usize);

/// A named random variable.
#[derive(Debug, Clone)]
pub struct Variable {
    pub id: NodeId,
    pub name: String,
    pub distribution: Distribution,
    /// Bound data; `Some` makes this variable part of the conditioning set.
    pub observed: Option<Vec<f64>>,
}

impl Variable {
    pub fn is_observed(&self) -> bool {
        self.observed.is_some()
    }

    pub fn dim(&self) -> usize {
        self.distribution.dim()
    }
}

/// What a model currently describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Nothing bound: the joint over all variables.
    Joint { variables: Vec<String> },
    /// `p(unknowns | observed)`.
    Posterior {
        unknowns: Vec<String>,
        observed: Vec<String>,
    },
}

/// Directed graph of named random variables.
///
/// Variables are stored in declaration order, and a distribution may only
/// reference variables declared before it, so the order is topological.
#[derive(Debug, Clone, Default)]
pub struct JointModel {
    variables: Vec<Variable>,
    name_to_node: HashMap<String, NodeId>,
}

impl JointModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a variable. Referenced variables must already exist and have
    /// matching dimensions.
    pub fn add_variable(&mut self, name: &str, distribution: Distribution) -> Result<NodeId> {
        if self.name_to_node.contains_key(name) {
            return Err(Error::DuplicateVariable(name.to_string()));
        }
        distribution.validate(name)?;
        self.check_references(name, &distribution)?;

        let id = NodeId(self.variables.len());
        self.name_to_node.insert(name.to_string(), id);
        self.variables.push(Variable {
            id,
            name: name.to_string(),
            distribution,
            observed: None,
        });
        Ok(id)
    }

    fn check_references(&self, owner: &str, dist: &Distribution) -> Result<()> {
        for dep in dist.dependencies() {
            if dep == owner || !self.name_to_node.contains_key(dep) {
                return Err(Error::UndeclaredVariable {
                    name: dep.to_string(),
                    referenced_by: owner.to_string(),
                });
            }
        }

        let dim = dist.dim();
        match dist.mean() {
            Some(Mean::Vector(v)) if v.len() != dim => {
                return Err(Error::DimensionMismatch {
                    name: format!("{} (mean)", owner),
                    expected: dim,
                    actual: v.len(),
                });
            }
            Some(Mean::Forward { model, input }) => {
                let input_dim = self.require(input)?.dim();
                if model.domain_dim() != input_dim {
                    return Err(Error::DimensionMismatch {
                        name: format!("{} (forward model domain)", input),
                        expected: input_dim,
                        actual: model.domain_dim(),
                    });
                }
                if model.range_dim() != dim {
                    return Err(Error::DimensionMismatch {
                        name: format!("{} (forward model range)", owner),
                        expected: dim,
                        actual: model.range_dim(),
                    });
                }
            }
            _ => {}
        }

        if let Some(var) = dist.scale_param().and_then(|p| p.var()) {
            let var_dim = self.require(var)?.dim();
            if var_dim != 1 {
                return Err(Error::DimensionMismatch {
                    name: format!("{} (scalar parameter of {})", var, owner),
                    expected: 1,
                    actual: var_dim,
                });
            }
        }
        Ok(())
    }

    /// Bind `data` to `name` in place.
    pub fn observe(&mut self, name: &str, data: Vec<f64>) -> Result<()> {
        let id = self.node_by_name(name).ok_or_else(|| Error::UnknownVariable(name.to_string()))?;
        let var = &mut self.variables[id.0];
        if data.len() != var.dim() {
            return Err(Error::DimensionMismatch {
                name: name.to_string(),
                expected: var.dim(),
                actual: data.len(),
            });
        }
        if data.iter().any(|v| !v.is_finite()) {
            return Err(Error::Validation(format!("data for '{}' contains non-finite values", name)));
        }
        var.observed = Some(data);
        Ok(())
    }

    /// A copy of this model with `data` bound to `name`.
    pub fn condition(&self, name: &str, data: Vec<f64>) -> Result<JointModel> {
        let mut conditioned = self.clone();
        conditioned.observe(name, data)?;
        Ok(conditioned)
    }

    pub fn target(&self) -> Target {
        let observed: Vec<String> = self.observed().map(|v| v.name.clone()).collect();
        if observed.is_empty() {
            Target::Joint {
                variables: self.variables.iter().map(|v| v.name.clone()).collect(),
            }
        } else {
            Target::Posterior {
                unknowns: self.unknowns().map(|v| v.name.clone()).collect(),
                observed,
            }
        }
    }

    pub fn node_by_name(&self, name: &str) -> Option<NodeId> {
        self.name_to_node.get(name).copied()
    }

    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.node_by_name(name).map(|id| &self.variables[id.0])
    }

    pub(crate) fn require(&self, name: &str) -> Result<&Variable> {
        self.variable(name)
            .ok_or_else(|| Error::UnknownVariable(name.to_string()))
    }

    pub fn node(&self, id: NodeId) -> &Variable {
        &self.variables[id.0]
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    pub fn unknowns(&self) -> impl Iterator<Item = &Variable> {
        self.variables.iter().filter(|v| !v.is_observed())
    }

    pub fn observed(&self) -> impl Iterator<Item = &Variable> {
        self.variables.iter().filter(|v| v.is_observed())
    }

    /// Variables whose distribution references `id`.
    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        let name = &self.variables[id.0].name;
        self.variables
            .iter()
            .filter(|v| v.distribution.dependencies().contains(&name.as_str()))
            .map(|v| v.id)
            .collect()
    }

    pub fn parents(&self, id: NodeId) -> Vec<NodeId> {
        self.variables[id.0]
            .distribution
            .dependencies()
            .into_iter()
            .filter_map(|n| self.node_by_name(n))
            .collect()
    }

    /// Observed values as an environment, to be completed with the unknowns.
    pub fn observed_values(&self) -> Values {
        self.observed()
            .filter_map(|v| v.observed.clone().map(|d| (v.name.clone(), d)))
            .collect()
    }

    /// Joint log density at `env`, which must hold a value for every variable.
    pub fn logpdf(&self, env: &dyn Env) -> Result<f64> {
        let mut total = 0.0;
        for var in &self.variables {
            let x = env
                .value(&var.name)
                .ok_or_else(|| Error::UnknownVariable(var.name.clone()))?;
            total += var.distribution.logpdf(x, env)?;
        }
        Ok(total)
    }

    /// Factorization as text, e.g. `p(d,s,x|y) ∝ p(y|x,s)p(x|d)p(s)p(d)`.
    pub fn equation(&self) -> String {
        let factors: String = self
            .variables
            .iter()
            .rev()
            .map(|v| {
                let deps = v.distribution.dependencies();
                if deps.is_empty() {
                    format!("p({})", v.name)
                } else {
                    format!("p({}|{})", v.name, deps.join(","))
                }
            })
            .collect();

        match self.target() {
            Target::Joint { mut variables } => {
                variables.sort();
                format!("p({}) = {}", variables.join(","), factors)
            }
            Target::Posterior {
                mut unknowns,
                mut observed,
            } => {
                unknowns.sort();
                observed.sort();
                format!("p({}|{}) ∝ {}", unknowns.join(","), observed.join(","), factors)
            }
        }
    }
}

impl fmt::Display for JointModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.target() {
            Target::Joint { .. } => "JointDistribution",
            Target::Posterior { .. } => "Posterior",
        };
        writeln!(f, "{}(", kind)?;
        writeln!(f, "    Equation: {}", self.equation())?;
        writeln!(f, "    Densities:")?;
        for v in &self.variables {
            let tag = if v.is_observed() { " (observed)" } else { "" };
            writeln!(f, "        {} ~ {}{}", v.name, v.distribution, tag)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::{Gamma, Gaussian, Gmrf};
    use crate::forward::LinearModel;
    use crate::geometry::{BoundaryCondition, Geometry};
    use std::sync::Arc;

    fn hierarchical(n: usize) -> JointModel {
        let a = Arc::new(LinearModel::identity(n).unwrap());
        let mut m = JointModel::new();
        m.add_variable("d", Gamma::new(1.0, 1e-4)).unwrap();
        m.add_variable("s", Gamma::new(1.0, 1e-4)).unwrap();
        m.add_variable(
            "x",
            Gmrf::new(0.0, "d", Geometry::Continuous1D(n), BoundaryCondition::Zero).unwrap(),
        )
        .unwrap();
        m.add_variable("y", Gaussian::new(Mean::forward(a, "x"), "s", n)).unwrap();
        m
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut m = JointModel::new();
        m.add_variable("d", Gamma::new(1.0, 1.0)).unwrap();
        assert!(matches!(
            m.add_variable("d", Gamma::new(2.0, 1.0)),
            Err(Error::DuplicateVariable(_))
        ));
    }

    #[test]
    fn test_undeclared_hyperparameter_rejected() {
        let mut m = JointModel::new();
        let err = m.add_variable("x", Gaussian::new(0.0, "d", 3)).unwrap_err();
        assert!(matches!(err, Error::UndeclaredVariable { ref name, .. } if name == "d"));
    }

    #[test]
    fn test_forward_dimension_checked() {
        let a = Arc::new(LinearModel::identity(4).unwrap());
        let mut m = JointModel::new();
        m.add_variable("x", Gaussian::new(0.0, 1.0, 3)).unwrap();
        assert!(matches!(
            m.add_variable("y", Gaussian::new(Mean::forward(a, "x"), 1.0, 4)),
            Err(Error::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_condition_reports_posterior_over_unbound() {
        let joint = hierarchical(5);
        assert!(matches!(joint.target(), Target::Joint { ref variables } if variables.len() == 4));

        let posterior = joint.condition("y", vec![0.1; 5]).unwrap();
        assert_eq!(
            posterior.target(),
            Target::Posterior {
                unknowns: vec!["d".to_string(), "s".to_string(), "x".to_string()],
                observed: vec!["y".to_string()],
            }
        );
        // The joint itself is untouched.
        assert!(joint.variable("y").unwrap().observed.is_none());
        assert_eq!(posterior.equation(), "p(d,s,x|y) ∝ p(y|x,s)p(x|d)p(s)p(d)");
    }

    #[test]
    fn test_observe_checks_length() {
        let mut m = hierarchical(5);
        assert!(matches!(
            m.observe("y", vec![0.0; 4]),
            Err(Error::DimensionMismatch { expected: 5, actual: 4, .. })
        ));
        assert!(matches!(m.observe("z", vec![0.0]), Err(Error::UnknownVariable(_))));
    }

    #[test]
    fn test_children_and_parents() {
        let m = hierarchical(3);
        let x = m.node_by_name("x").unwrap();
        let s = m.node_by_name("s").unwrap();
        let y = m.node_by_name("y").unwrap();
        assert_eq!(m.children(x), vec![y]);
        assert_eq!(m.children(s), vec![y]);
        assert_eq!(m.parents(y), vec![x, s]);
    }
}
