use crate::error::{PKError, PKResult};
use crate::models::{CovariateModel, EtaScale, ModelDefinition};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CovariateValue {
    Numeric(f64),
    Categorical(String),
}

impl CovariateValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CovariateValue::Numeric(v) => Some(*v),
            CovariateValue::Categorical(_) => None,
        }
    }
}

/// A virtual subject: covariates plus one sampled random effect per variable
/// parameter. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    id: usize,
    covariates: BTreeMap<String, CovariateValue>,
    etas: Vec<f64>,
}

impl Subject {
    pub fn new(id: usize, covariates: BTreeMap<String, CovariateValue>, etas: Vec<f64>) -> Self {
        Self { id, covariates, etas }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn covariates(&self) -> &BTreeMap<String, CovariateValue> {
        &self.covariates
    }

    pub fn covariate(&self, name: &str) -> Option<&CovariateValue> {
        self.covariates.get(name)
    }

    pub fn etas(&self) -> &[f64] {
        &self.etas
    }
}

/// Fully resolved parameter values for one subject, in model declaration order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndividualParameters {
    names: Vec<String>,
    values: Vec<f64>,
}

impl IndividualParameters {
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.names.iter().position(|n| n == name).map(|i| self.values[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.names.iter().map(String::as_str).zip(self.values.iter().copied())
    }
}

struct ParameterPlan {
    typical: f64,
    scale: EtaScale,
    bounds: Option<(f64, f64)>,
    effects: Vec<(String, CovariateModel)>,
    eta: Option<usize>,
}

/// Combines typical values, covariates and random effects. Holds no mutable
/// state, so one instance serves every subject concurrently.
pub struct Individualizer {
    names: Vec<String>,
    plans: Vec<ParameterPlan>,
    n_eta: usize,
}

impl Individualizer {
    pub fn new(model: &ModelDefinition) -> Self {
        let re = model.random_effects();
        let plans = model
            .parameters()
            .iter()
            .enumerate()
            .map(|(i, spec)| ParameterPlan {
                typical: spec.typical,
                scale: spec.scale,
                bounds: spec.bounds,
                effects: model
                    .covariate_effects()
                    .iter()
                    .filter(|e| e.parameter == spec.name)
                    .map(|e| (e.covariate.clone(), e.model.clone()))
                    .collect(),
                eta: re.parameter_indices().iter().position(|&p| p == i),
            })
            .collect();

        Self {
            names: model.parameter_names(),
            plans,
            n_eta: re.len(),
        }
    }

    /// Covariate effects first, in declaration order, then the random effect,
    /// then the optional bounds.
    pub fn individualize(&self, subject: &Subject) -> PKResult<IndividualParameters> {
        if subject.etas().len() != self.n_eta {
            return Err(PKError::config(format!(
                "subject {} carries {} random effects, model declares {}",
                subject.id(),
                subject.etas().len(),
                self.n_eta
            )));
        }

        let mut values = Vec::with_capacity(self.plans.len());
        for (name, plan) in self.names.iter().zip(&self.plans) {
            let mut value = plan.typical;

            for (covariate, model) in &plan.effects {
                let cov = subject.covariate(covariate).ok_or_else(|| {
                    PKError::config(format!(
                        "subject {} has no covariate '{}' required by {}",
                        subject.id(),
                        covariate,
                        name
                    ))
                })?;
                value = model.apply(value, cov)?;
            }

            if let Some(k) = plan.eta {
                let eta = subject.etas()[k];
                value = match plan.scale {
                    EtaScale::LogNormal => value * eta.exp(),
                    EtaScale::Normal => value + eta,
                };
            }

            if let Some((lower, upper)) = plan.bounds {
                value = value.max(lower).min(upper);
            }

            if !value.is_finite() {
                return Err(PKError::config(format!(
                    "subject {}: individual value of {} is not finite",
                    subject.id(),
                    name
                )));
            }
            values.push(value);
        }

        Ok(IndividualParameters {
            names: self.names.clone(),
            values,
        })
    }
}

/// One-shot individualization without reusing a prepared [`Individualizer`].
pub fn individualize(model: &ModelDefinition, subject: &Subject) -> PKResult<IndividualParameters> {
    Individualizer::new(model).individualize(subject)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputValue {
    pub output: usize,
    pub name: String,
    pub predicted: f64,
    pub observed: Option<f64>,
    pub below_lloq: bool,
}

/// One row per (subject, observation time).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulationRecord {
    pub subject_id: usize,
    pub time: f64,
    pub state: Vec<f64>,
    pub outputs: Vec<OutputValue>,
}

impl SimulationRecord {
    pub fn output(&self, name: &str) -> Option<&OutputValue> {
        self.outputs.iter().find(|o| o.name == name)
    }

    pub fn predicted(&self, name: &str) -> Option<f64> {
        self.output(name).map(|o| o.predicted)
    }

    pub fn observed(&self, name: &str) -> Option<f64> {
        self.output(name).and_then(|o| o.observed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn model() -> ModelDefinition {
        ModelDefinition::builder("test")
            .compartment("central")
            .parameter("CL", 5.0)
            .parameter("V", 50.0)
            .parameter("E0", 10.0)
            .scale("E0", EtaScale::Normal)
            .random_effect("CL", 0.09)
            .random_effect("E0", 4.0)
            .covariate_effect("CL", "WT", CovariateModel::Power { reference: 70.0, exponent: 0.75 })
            .diffeq(|_t, x, p, dx| dx[0] = -p[0] / p[1] * x[0])
            .output("CP", |x, p| x[0] / p[1])
            .build()
            .unwrap()
    }

    fn subject(wt: f64, etas: Vec<f64>) -> Subject {
        let mut cov = BTreeMap::new();
        cov.insert("WT".to_string(), CovariateValue::Numeric(wt));
        Subject::new(1, cov, etas)
    }

    #[test]
    fn test_neutral_subject_gets_typical_values() {
        let m = model();
        let params = individualize(&m, &subject(70.0, vec![0.0, 0.0])).unwrap();
        assert_eq!(params.values(), m.typical_values().as_slice());
    }

    #[test]
    fn test_covariates_then_random_effects() {
        let m = model();
        let params = individualize(&m, &subject(140.0, vec![0.2, -1.5])).unwrap();
        let expected_cl = 5.0 * 2f64.powf(0.75) * 0.2f64.exp();
        assert_relative_eq!(params.get("CL").unwrap(), expected_cl, epsilon = 1e-12);
        assert_eq!(params.get("V"), Some(50.0));
        assert_relative_eq!(params.get("E0").unwrap(), 8.5, epsilon = 1e-12);
    }

    #[test]
    fn test_bounds_clamp_after_random_effect() {
        let m = ModelDefinition::builder("bounded")
            .compartment("central")
            .parameter("CL", 5.0)
            .parameter("V", 50.0)
            .bounds("CL", 1.0, 6.0)
            .random_effect("CL", 0.09)
            .diffeq(|_t, x, p, dx| dx[0] = -p[0] / p[1] * x[0])
            .output("CP", |x, p| x[0] / p[1])
            .build()
            .unwrap();
        let s = Subject::new(3, BTreeMap::new(), vec![1.0]);
        assert_eq!(individualize(&m, &s).unwrap().get("CL"), Some(6.0));
    }

    #[test]
    fn test_missing_covariate_is_an_error() {
        let m = model();
        let s = Subject::new(2, BTreeMap::new(), vec![0.0, 0.0]);
        let err = individualize(&m, &s).unwrap_err();
        assert!(err.to_string().contains("WT"));
    }

    #[test]
    fn test_eta_length_mismatch() {
        let m = model();
        assert!(individualize(&m, &subject(70.0, vec![0.0])).is_err());
    }

    #[test]
    fn test_covariate_value_untagged() {
        let values: BTreeMap<String, CovariateValue> =
            serde_json::from_str(r#"{"WT": 72.5, "SEX": "F"}"#).unwrap();
        assert_eq!(values["WT"], CovariateValue::Numeric(72.5));
        assert_eq!(values["SEX"], CovariateValue::Categorical("F".to_string()));
    }
}
