pub mod indirect_response;
pub mod one_compartment;
pub mod three_compartment;
pub mod two_compartment;

use crate::error::{PKError, PKResult};
use crate::simulation::individual::CovariateValue;
use crate::simulation::variability::{ErrorModel, Floor};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Right-hand side `dx = f(t, x, p)`. `p` holds the individual parameters in
/// declaration order; `dx` is zeroed before every call.
pub type DiffEq = Arc<dyn Fn(f64, &[f64], &[f64], &mut [f64]) + Send + Sync>;

/// Initial conditions `x(0) = g(p)`. `x` is zeroed before the call.
pub type Init = Arc<dyn Fn(&[f64], &mut [f64]) + Send + Sync>;

/// Derived output `y = h(x, p)`.
pub type OutputFn = Arc<dyn Fn(&[f64], &[f64]) -> f64 + Send + Sync>;

/// Destructure a parameter slice by position, in the order the parameters
/// were declared on the model.
#[macro_export]
macro_rules! fetch_params {
    ($p:expr, $($name:ident),*) => {
        let p = $p;
        let mut idx = 0;
        $(
            #[allow(unused_variables)]
            let $name = p[idx];
            idx += 1;
        )*
        let _ = idx;
    };
}

#[derive(Debug, Clone, Serialize)]
pub struct Compartment {
    pub name: String,
    pub index: usize,
    /// Amount-type state that must not go meaningfully negative.
    pub nonnegative: bool,
}

/// Scale on which a random effect enters a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EtaScale {
    /// `value * exp(eta)`
    #[default]
    LogNormal,
    /// `value + eta`
    Normal,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParameterSpec {
    pub name: String,
    pub typical: f64,
    pub scale: EtaScale,
    pub bounds: Option<(f64, f64)>,
}

/// Functional form of a covariate effect on a parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CovariateModel {
    /// `value * (cov / reference)^exponent`
    Power { reference: f64, exponent: f64 },
    /// `value * exp(coefficient * (cov - reference))`
    Exponential { reference: f64, coefficient: f64 },
    /// `value * (1 + slope * (cov - reference))`
    Linear { reference: f64, slope: f64 },
    /// `value + slope * (cov - reference)`
    Additive { reference: f64, slope: f64 },
    /// `value * factors[category]`; unlisted categories are the reference (factor 1).
    Categorical { factors: BTreeMap<String, f64> },
}

impl CovariateModel {
    pub fn apply(&self, value: f64, covariate: &CovariateValue) -> PKResult<f64> {
        match (self, covariate) {
            (CovariateModel::Power { reference, exponent }, CovariateValue::Numeric(c)) => {
                Ok(value * (c / reference).powf(*exponent))
            }
            (CovariateModel::Exponential { reference, coefficient }, CovariateValue::Numeric(c)) => {
                Ok(value * (coefficient * (c - reference)).exp())
            }
            (CovariateModel::Linear { reference, slope }, CovariateValue::Numeric(c)) => {
                Ok(value * (1.0 + slope * (c - reference)))
            }
            (CovariateModel::Additive { reference, slope }, CovariateValue::Numeric(c)) => {
                Ok(value + slope * (c - reference))
            }
            (CovariateModel::Categorical { factors }, CovariateValue::Categorical(level)) => {
                Ok(value * factors.get(level).copied().unwrap_or(1.0))
            }
            (CovariateModel::Categorical { .. }, CovariateValue::Numeric(c)) => Err(PKError::config(
                format!("categorical covariate effect applied to numeric value {}", c),
            )),
            (_, CovariateValue::Categorical(level)) => Err(PKError::config(format!(
                "numeric covariate effect applied to category '{}'",
                level
            ))),
        }
    }

    pub fn is_categorical(&self) -> bool {
        matches!(self, CovariateModel::Categorical { .. })
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            CovariateModel::Power { reference, exponent } => {
                if !(reference.is_finite() && *reference > 0.0) {
                    return Err(format!("power reference must be positive, got {}", reference));
                }
                if !exponent.is_finite() {
                    return Err("power exponent must be finite".to_string());
                }
            }
            CovariateModel::Exponential { reference, coefficient: theta }
            | CovariateModel::Linear { reference, slope: theta }
            | CovariateModel::Additive { reference, slope: theta } => {
                if !reference.is_finite() || !theta.is_finite() {
                    return Err("covariate reference and effect must be finite".to_string());
                }
            }
            CovariateModel::Categorical { factors } => {
                if let Some((level, f)) = factors.iter().find(|(_, f)| !f.is_finite()) {
                    return Err(format!("factor for category '{}' is not finite: {}", level, f));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CovariateEffect {
    pub parameter: String,
    pub covariate: String,
    pub model: CovariateModel,
}

/// Inter-individual variability: covariance matrix over the variable
/// parameters, in parameter declaration order.
#[derive(Debug, Clone)]
pub struct RandomEffects {
    names: Vec<String>,
    param_index: Vec<usize>,
    /// Lower-triangular factor with `L * L^T = omega`. Rows and columns of
    /// zero-variance effects are exactly zero.
    cholesky: DMatrix<f64>,
}

impl RandomEffects {
    fn new(names: Vec<String>, param_index: Vec<usize>, omega: DMatrix<f64>) -> PKResult<Self> {
        let n = names.len();
        for i in 0..n {
            for j in 0..n {
                let v = omega[(i, j)];
                if !v.is_finite() {
                    return Err(PKError::config(format!(
                        "omega[{}, {}] is not finite",
                        names[i], names[j]
                    )));
                }
                if (v - omega[(j, i)]).abs() > 1e-12 {
                    return Err(PKError::config("omega matrix is not symmetric"));
                }
            }
            if omega[(i, i)] < 0.0 {
                return Err(PKError::config(format!(
                    "negative variance {} for random effect on {}",
                    omega[(i, i)],
                    names[i]
                )));
            }
        }

        let active: Vec<usize> = (0..n).filter(|&i| omega[(i, i)] > 0.0).collect();
        for i in 0..n {
            if omega[(i, i)] == 0.0 {
                if let Some(j) = (0..n).find(|&j| j != i && omega[(i, j)] != 0.0) {
                    return Err(PKError::config(format!(
                        "covariance between {} and {} declared but {} has zero variance",
                        names[i], names[j], names[i]
                    )));
                }
            }
        }

        let mut cholesky = DMatrix::zeros(n, n);
        if !active.is_empty() {
            let sub = DMatrix::from_fn(active.len(), active.len(), |r, c| omega[(active[r], active[c])]);
            let factor = sub
                .cholesky()
                .ok_or_else(|| PKError::config("omega matrix is not positive definite"))?;
            let l = factor.l();
            for (r, &i) in active.iter().enumerate() {
                for (c, &j) in active.iter().enumerate() {
                    cholesky[(i, j)] = l[(r, c)];
                }
            }
        }

        Ok(Self {
            names,
            param_index,
            cholesky,
        })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Index of the model parameter each random effect applies to.
    pub fn parameter_indices(&self) -> &[usize] {
        &self.param_index
    }

    /// Correlate a vector of independent standard-normal draws: `eta = L z`.
    pub fn correlate(&self, z: &[f64]) -> Vec<f64> {
        let n = self.names.len();
        (0..n)
            .map(|i| (0..=i).map(|j| self.cholesky[(i, j)] * z[j]).sum())
            .collect()
    }
}

#[derive(Clone)]
pub struct OutputDef {
    pub name: String,
    pub nonnegative: bool,
    pub error: Option<ErrorModel>,
    pub floor: Floor,
    func: OutputFn,
}

impl OutputDef {
    pub fn evaluate(&self, x: &[f64], p: &[f64]) -> f64 {
        (self.func)(x, p)
    }
}

impl fmt::Debug for OutputDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputDef")
            .field("name", &self.name)
            .field("nonnegative", &self.nonnegative)
            .field("error", &self.error)
            .field("floor", &self.floor)
            .finish()
    }
}

/// A compartmental model, constructed once and shared read-only by every
/// subject of a run.
#[derive(Clone)]
pub struct ModelDefinition {
    name: String,
    compartments: Vec<Compartment>,
    parameters: Vec<ParameterSpec>,
    covariate_effects: Vec<CovariateEffect>,
    random_effects: RandomEffects,
    diffeq: DiffEq,
    init: Option<Init>,
    outputs: Vec<OutputDef>,
}

impl fmt::Debug for ModelDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelDefinition")
            .field("name", &self.name)
            .field("compartments", &self.compartments)
            .field("parameters", &self.parameters)
            .field("covariate_effects", &self.covariate_effects)
            .field("random_effects", &self.random_effects.names)
            .field("outputs", &self.outputs)
            .finish()
    }
}

impl ModelDefinition {
    pub fn builder(name: impl Into<String>) -> ModelBuilder {
        ModelBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn compartments(&self) -> &[Compartment] {
        &self.compartments
    }

    pub fn n_states(&self) -> usize {
        self.compartments.len()
    }

    pub fn compartment_index(&self, name: &str) -> Option<usize> {
        self.compartments.iter().position(|c| c.name == name)
    }

    pub fn parameters(&self) -> &[ParameterSpec] {
        &self.parameters
    }

    pub fn parameter_names(&self) -> Vec<String> {
        self.parameters.iter().map(|p| p.name.clone()).collect()
    }

    pub fn parameter_index(&self, name: &str) -> Option<usize> {
        self.parameters.iter().position(|p| p.name == name)
    }

    pub fn typical_values(&self) -> Vec<f64> {
        self.parameters.iter().map(|p| p.typical).collect()
    }

    pub fn covariate_effects(&self) -> &[CovariateEffect] {
        &self.covariate_effects
    }

    /// Covariate names the model reads, with whether each is used categorically.
    pub fn referenced_covariates(&self) -> BTreeMap<String, bool> {
        self.covariate_effects
            .iter()
            .map(|e| (e.covariate.clone(), e.model.is_categorical()))
            .collect()
    }

    pub fn random_effects(&self) -> &RandomEffects {
        &self.random_effects
    }

    pub fn outputs(&self) -> &[OutputDef] {
        &self.outputs
    }

    pub fn output_index(&self, name: &str) -> Option<usize> {
        self.outputs.iter().position(|o| o.name == name)
    }

    pub fn initial_state(&self, p: &[f64]) -> Vec<f64> {
        let mut x = vec![0.0; self.compartments.len()];
        if let Some(init) = &self.init {
            init(p, &mut x);
        }
        x
    }

    #[inline]
    pub fn derivative(&self, t: f64, x: &[f64], p: &[f64], dx: &mut [f64]) {
        dx.iter_mut().for_each(|v| *v = 0.0);
        (self.diffeq)(t, x, p, dx);
    }
}

/// Incremental construction of a [`ModelDefinition`]. Problems are collected
/// and reported together by [`ModelBuilder::build`].
pub struct ModelBuilder {
    name: String,
    compartments: Vec<Compartment>,
    parameters: Vec<ParameterSpec>,
    variances: Vec<(String, f64)>,
    covariances: Vec<(String, String, f64)>,
    covariate_effects: Vec<CovariateEffect>,
    diffeq: Option<DiffEq>,
    init: Option<Init>,
    outputs: Vec<OutputDef>,
    errors: Vec<String>,
}

impl ModelBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            compartments: Vec::new(),
            parameters: Vec::new(),
            variances: Vec::new(),
            covariances: Vec::new(),
            covariate_effects: Vec::new(),
            diffeq: None,
            init: None,
            outputs: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn compartment(self, name: impl Into<String>) -> Self {
        self.add_compartment(name.into(), true)
    }

    /// A state that may legitimately take negative values.
    pub fn signed_compartment(self, name: impl Into<String>) -> Self {
        self.add_compartment(name.into(), false)
    }

    fn add_compartment(mut self, name: String, nonnegative: bool) -> Self {
        if self.compartments.iter().any(|c| c.name == name) {
            self.errors.push(format!("duplicate compartment '{}'", name));
        }
        let index = self.compartments.len();
        self.compartments.push(Compartment {
            name,
            index,
            nonnegative,
        });
        self
    }

    pub fn parameter(mut self, name: impl Into<String>, typical: f64) -> Self {
        let name = name.into();
        if self.parameters.iter().any(|p| p.name == name) {
            self.errors.push(format!("duplicate parameter '{}'", name));
        }
        self.parameters.push(ParameterSpec {
            name,
            typical,
            scale: EtaScale::default(),
            bounds: None,
        });
        self
    }

    fn with_parameter(mut self, name: &str, update: impl FnOnce(&mut ParameterSpec)) -> Self {
        match self.parameters.iter_mut().find(|p| p.name == name) {
            Some(p) => update(p),
            None => self.errors.push(format!("unknown parameter '{}'", name)),
        }
        self
    }

    /// Override the typical value of a declared parameter.
    pub fn theta(self, name: &str, typical: f64) -> Self {
        self.with_parameter(name, |p| p.typical = typical)
    }

    pub fn scale(self, name: &str, scale: EtaScale) -> Self {
        self.with_parameter(name, |p| p.scale = scale)
    }

    pub fn bounds(self, name: &str, lower: f64, upper: f64) -> Self {
        self.with_parameter(name, |p| p.bounds = Some((lower, upper)))
    }

    /// Declare a random effect with the given variance.
    pub fn random_effect(mut self, name: impl Into<String>, variance: f64) -> Self {
        let name = name.into();
        match self.variances.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = variance,
            None => self.variances.push((name, variance)),
        }
        self
    }

    pub fn covariance(mut self, first: impl Into<String>, second: impl Into<String>, cov: f64) -> Self {
        self.covariances.push((first.into(), second.into(), cov));
        self
    }

    pub fn covariate_effect(
        mut self,
        parameter: impl Into<String>,
        covariate: impl Into<String>,
        model: CovariateModel,
    ) -> Self {
        self.covariate_effects.push(CovariateEffect {
            parameter: parameter.into(),
            covariate: covariate.into(),
            model,
        });
        self
    }

    pub fn diffeq<F>(mut self, f: F) -> Self
    where
        F: Fn(f64, &[f64], &[f64], &mut [f64]) + Send + Sync + 'static,
    {
        self.diffeq = Some(Arc::new(f));
        self
    }

    pub fn init<F>(mut self, f: F) -> Self
    where
        F: Fn(&[f64], &mut [f64]) + Send + Sync + 'static,
    {
        self.init = Some(Arc::new(f));
        self
    }

    /// A derived output reported with a zero floor on the prediction.
    pub fn output<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&[f64], &[f64]) -> f64 + Send + Sync + 'static,
    {
        self.add_output(name.into(), true, Arc::new(f))
    }

    pub fn signed_output<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&[f64], &[f64]) -> f64 + Send + Sync + 'static,
    {
        self.add_output(name.into(), false, Arc::new(f))
    }

    fn add_output(mut self, name: String, nonnegative: bool, func: OutputFn) -> Self {
        if self.outputs.iter().any(|o| o.name == name) {
            self.errors.push(format!("duplicate output '{}'", name));
        }
        self.outputs.push(OutputDef {
            name,
            nonnegative,
            error: None,
            floor: Floor::None,
            func,
        });
        self
    }

    pub fn error_model(mut self, output: &str, error: ErrorModel) -> Self {
        match self.outputs.iter_mut().find(|o| o.name == output) {
            Some(o) => o.error = Some(error),
            None => self.errors.push(format!("error model for unknown output '{}'", output)),
        }
        self
    }

    pub fn floor(mut self, output: &str, floor: Floor) -> Self {
        match self.outputs.iter_mut().find(|o| o.name == output) {
            Some(o) => o.floor = floor,
            None => self.errors.push(format!("floor for unknown output '{}'", output)),
        }
        self
    }

    pub fn build(self) -> PKResult<ModelDefinition> {
        let mut errors = self.errors;

        if self.compartments.is_empty() {
            errors.push("model declares no compartments".to_string());
        }
        if self.outputs.is_empty() {
            errors.push("model declares no outputs".to_string());
        }
        if self.diffeq.is_none() {
            errors.push("model has no derivative function".to_string());
        }

        for p in &self.parameters {
            if !p.typical.is_finite() {
                errors.push(format!("typical value of {} is not finite", p.name));
            }
            if let Some((lo, hi)) = p.bounds {
                if !(lo <= hi) {
                    errors.push(format!("bounds of {} are inverted: ({}, {})", p.name, lo, hi));
                }
            }
        }

        for eff in &self.covariate_effects {
            if !self.parameters.iter().any(|p| p.name == eff.parameter) {
                errors.push(format!(
                    "covariate effect references unknown parameter '{}'",
                    eff.parameter
                ));
            }
            if let Err(e) = eff.model.validate() {
                errors.push(format!("{} ~ {}: {}", eff.parameter, eff.covariate, e));
            }
        }

        let declared: BTreeSet<&str> = self.variances.iter().map(|(n, _)| n.as_str()).collect();
        for (name, _) in &self.variances {
            if !self.parameters.iter().any(|p| &p.name == name) {
                errors.push(format!("random effect references unknown parameter '{}'", name));
            }
        }
        for (a, b, _) in &self.covariances {
            for n in [a, b] {
                if !declared.contains(n.as_str()) {
                    errors.push(format!("covariance references '{}' which has no variance", n));
                }
            }
            if a == b {
                errors.push(format!("covariance of '{}' with itself; use a variance", a));
            }
        }

        for o in &self.outputs {
            if let Some(err) = &o.error {
                if let Err(e) = err.validate() {
                    errors.push(format!("error model of {}: {}", o.name, e));
                }
            }
            if let Err(e) = o.floor.validate() {
                errors.push(format!("floor of {}: {}", o.name, e));
            }
        }

        if !errors.is_empty() {
            return Err(PKError::Configuration(format!(
                "model '{}': {}",
                self.name,
                errors.join("; ")
            )));
        }

        // Random effects follow parameter declaration order.
        let mut names = Vec::new();
        let mut param_index = Vec::new();
        let mut diag = Vec::new();
        for (i, p) in self.parameters.iter().enumerate() {
            if let Some((_, var)) = self.variances.iter().find(|(n, _)| *n == p.name) {
                names.push(p.name.clone());
                param_index.push(i);
                diag.push(*var);
            }
        }
        let mut omega = DMatrix::from_diagonal(&nalgebra::DVector::from_vec(diag));
        for (a, b, cov) in &self.covariances {
            let i = names.iter().position(|n| n == a);
            let j = names.iter().position(|n| n == b);
            if let (Some(i), Some(j)) = (i, j) {
                omega[(i, j)] = *cov;
                omega[(j, i)] = *cov;
            }
        }
        let random_effects = RandomEffects::new(names, param_index, omega)?;

        let diffeq = self
            .diffeq
            .ok_or_else(|| PKError::config("model has no derivative function"))?;

        let model = ModelDefinition {
            name: self.name,
            compartments: self.compartments,
            parameters: self.parameters,
            covariate_effects: self.covariate_effects,
            random_effects,
            diffeq,
            init: self.init,
            outputs: self.outputs,
        };
        model.check_typical()?;
        Ok(model)
    }
}

impl ModelDefinition {
    /// Evaluate the system once at the typical values so that an ill-formed
    /// model fails at construction, not inside the first subject.
    fn check_typical(&self) -> PKResult<()> {
        let p = self.typical_values();
        let x = self.initial_state(&p);
        if let Some(i) = x.iter().position(|v| !v.is_finite()) {
            return Err(PKError::config(format!(
                "model '{}': initial state of {} is not finite at typical values",
                self.name, self.compartments[i].name
            )));
        }
        let mut dx = vec![0.0; x.len()];
        self.derivative(0.0, &x, &p, &mut dx);
        if let Some(i) = dx.iter().position(|v| !v.is_finite()) {
            return Err(PKError::config(format!(
                "model '{}': derivative of {} is not finite at typical values",
                self.name, self.compartments[i].name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn base() -> ModelBuilder {
        ModelDefinition::builder("test")
            .compartment("central")
            .parameter("CL", 5.0)
            .parameter("V", 50.0)
            .diffeq(|_t, x, p, dx| {
                fetch_params!(p, cl, v);
                dx[0] = -cl / v * x[0];
            })
            .output("CP", |x, p| x[0] / p[1])
    }

    #[test]
    fn test_build_simple_model() {
        let model = base().build().unwrap();
        assert_eq!(model.n_states(), 1);
        assert_eq!(model.parameter_index("V"), Some(1));
        assert_eq!(model.output_index("CP"), Some(0));
        assert!(model.random_effects().is_empty());
    }

    #[test]
    fn test_dangling_references_rejected() {
        let err = base()
            .random_effect("KA", 0.1)
            .covariate_effect("Q", "WT", CovariateModel::Power { reference: 70.0, exponent: 0.75 })
            .build()
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("KA"));
        assert!(msg.contains("Q"));
    }

    #[test]
    fn test_non_positive_definite_omega_rejected() {
        let err = base()
            .random_effect("CL", 0.09)
            .random_effect("V", 0.04)
            .covariance("CL", "V", 0.5)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("positive definite"));
    }

    #[test]
    fn test_negative_variance_rejected() {
        assert!(base().random_effect("CL", -0.1).build().is_err());
    }

    #[test]
    fn test_zero_variance_draws_zero() {
        let model = base()
            .random_effect("CL", 0.09)
            .random_effect("V", 0.0)
            .build()
            .unwrap();
        let eta = model.random_effects().correlate(&[1.0, 2.5]);
        assert_relative_eq!(eta[0], 0.3, epsilon = 1e-12);
        assert_eq!(eta[1], 0.0);
    }

    #[test]
    fn test_correlated_effects_reproduce_covariance() {
        let model = base()
            .random_effect("CL", 0.09)
            .random_effect("V", 0.04)
            .covariance("CL", "V", 0.03)
            .build()
            .unwrap();
        let re = model.random_effects();
        let l = &re.cholesky;
        let rebuilt = l * l.transpose();
        assert_relative_eq!(rebuilt[(0, 1)], 0.03, epsilon = 1e-12);
        assert_relative_eq!(rebuilt[(1, 1)], 0.04, epsilon = 1e-12);
    }

    #[test]
    fn test_covariate_forms() {
        let wt = CovariateValue::Numeric(140.0);
        let power = CovariateModel::Power { reference: 70.0, exponent: 0.75 };
        assert_relative_eq!(power.apply(10.0, &wt).unwrap(), 10.0 * 2f64.powf(0.75));

        let additive = CovariateModel::Additive { reference: 70.0, slope: 0.1 };
        assert_relative_eq!(additive.apply(10.0, &wt).unwrap(), 17.0);

        let mut factors = BTreeMap::new();
        factors.insert("F".to_string(), 0.8);
        let cat = CovariateModel::Categorical { factors };
        let female = CovariateValue::Categorical("F".to_string());
        let male = CovariateValue::Categorical("M".to_string());
        assert_relative_eq!(cat.apply(10.0, &female).unwrap(), 8.0);
        assert_eq!(cat.apply(10.0, &male).unwrap(), 10.0);
        assert!(cat.apply(10.0, &wt).is_err());
    }

    #[test]
    fn test_non_finite_derivative_rejected() {
        let err = base().theta("V", 0.0).build().unwrap_err();
        assert!(err.to_string().contains("not finite"));
    }
}
