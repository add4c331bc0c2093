use crate::dosing::{DosingRegimen, RegimenSpec};
use crate::error::{PKError, PKResult};
use crate::models::{
    indirect_response, one_compartment, three_compartment, two_compartment, CovariateModel, EtaScale,
    ModelDefinition,
};
use crate::simulation::integrator::{IntegrationMethod, SolverOptions};
use crate::simulation::population::CovariateDistribution;
use crate::simulation::variability::{ErrorModel, Floor};
use crate::simulation::{RunSettings, StudyDesign};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub model: ModelConfig,
    #[serde(default)]
    pub dosing: Vec<DosingConfig>,
    #[serde(default)]
    pub population: PopulationConfig,
    pub simulation: SimulationConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    OneCompartment,
    TwoCompartment,
    ThreeCompartment,
    IndirectResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub kind: ModelKind,
    /// Adds a first-order depot and `KA`.
    #[serde(default)]
    pub absorption: bool,
    /// Overrides of the library's typical values, plus variability.
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterConfig>,
    #[serde(default)]
    pub correlations: Vec<CorrelationConfig>,
    #[serde(default)]
    pub covariates: Vec<CovariateConfig>,
    #[serde(default)]
    pub error_models: BTreeMap<String, ErrorModel>,
    #[serde(default)]
    pub floors: BTreeMap<String, Floor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterConfig {
    pub theta: f64,                 // Typical value
    pub omega: Option<f64>,         // Inter-individual variance
    #[serde(default)]
    pub scale: EtaScale,
    pub bounds: Option<(f64, f64)>, // Lower and upper bounds
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationConfig {
    pub first: String,
    pub second: String,
    pub covariance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CovariateConfig {
    pub parameter: String,
    pub covariate: String,
    pub model: CovariateModel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DosingConfig {
    pub route: DosingRoute,
    /// Target compartment name; defaults to the route's compartment.
    pub compartment: Option<String>,
    pub amount: f64,
    #[serde(default)]
    pub start: f64,
    #[serde(default)]
    pub ii: f64,
    #[serde(default)]
    pub addl: u32,
    pub lag: Option<f64>,
    pub duration: Option<f64>, // For infusions
    pub bioavailability: Option<f64>,
    /// Numeric covariate the amount is multiplied by (e.g. `WT` for mg/kg).
    pub scale_by: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DosingRoute {
    Oral,
    IvBolus,
    IvInfusion,
}

impl DosingRoute {
    fn default_compartment(&self) -> &'static str {
        match self {
            DosingRoute::Oral => "depot",
            DosingRoute::IvBolus | DosingRoute::IvInfusion => "central",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PopulationConfig {
    #[serde(default)]
    pub covariates: BTreeMap<String, CovariateDistribution>,
    /// Seed of the covariate and random-effect stream.
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "default_subjects")]
    pub subjects: usize,
    pub time_points: Vec<f64>,
    /// Outputs to record; all when absent.
    pub outputs: Option<Vec<String>>,
    pub seed: Option<u64>,
    pub residual_seed: Option<u64>,
    #[serde(default)]
    pub integration_method: IntegrationMethod,
    #[serde(default = "default_rtol")]
    pub rtol: f64,
    #[serde(default = "default_atol")]
    pub atol: f64,
    #[serde(default = "default_step")]
    pub step: f64,
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    pub timeout_secs: Option<f64>,
    #[serde(default = "default_parallel")]
    pub parallel: bool,
    pub threads: Option<usize>,
}

fn default_subjects() -> usize {
    100
}

fn default_rtol() -> f64 {
    SolverOptions::default().rtol
}

fn default_atol() -> f64 {
    SolverOptions::default().atol
}

fn default_step() -> f64 {
    SolverOptions::default().step
}

fn default_max_steps() -> usize {
    SolverOptions::default().max_steps
}

fn default_parallel() -> bool {
    true
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> PKResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(json: &str) -> PKResult<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> PKResult<()> {
        self.validate_model_parameters()?;
        self.validate_dosing()?;

        let sim = &self.simulation;
        if sim.time_points.is_empty() {
            return Err(PKError::config("At least one time point must be specified"));
        }
        if sim.subjects == 0 {
            return Err(PKError::config("At least one subject must be simulated"));
        }
        if let Some(t) = sim.timeout_secs {
            if !(t.is_finite() && t > 0.0) {
                return Err(PKError::config(format!("timeout_secs must be positive, got {}", t)));
            }
        }
        self.solver_options().validate()
    }

    fn validate_model_parameters(&self) -> PKResult<()> {
        for (name, param) in &self.model.parameters {
            if !param.theta.is_finite() {
                return Err(PKError::config(format!("Parameter {} must be finite", name)));
            }
            // Normal-scale parameters (shifts, slopes) may sit below zero.
            if param.scale == EtaScale::LogNormal && param.theta < 0.0 {
                return Err(PKError::config(format!(
                    "Parameter {} is log-normal and must be non-negative, got {}",
                    name, param.theta
                )));
            }
            if let Some(omega) = param.omega {
                if !(omega.is_finite() && omega >= 0.0) {
                    return Err(PKError::config(format!(
                        "Variance of {} must be non-negative, got {}",
                        name, omega
                    )));
                }
            }
        }
        Ok(())
    }

    fn validate_dosing(&self) -> PKResult<()> {
        for dose in &self.dosing {
            if !(dose.amount.is_finite() && dose.amount > 0.0) {
                return Err(PKError::config("Dose amount must be positive"));
            }
            match dose.route {
                DosingRoute::IvInfusion => {
                    if dose.duration.unwrap_or(0.0) <= 0.0 {
                        return Err(PKError::config(
                            "Infusion duration must be specified and positive",
                        ));
                    }
                }
                _ => {
                    if dose.duration.is_some() {
                        return Err(PKError::config(format!(
                            "duration only applies to ivinfusion, not {:?}",
                            dose.route
                        )));
                    }
                }
            }
            if dose.route == DosingRoute::Oral && !self.model.absorption && dose.compartment.is_none() {
                return Err(PKError::config(
                    "Oral dosing requires model.absorption = true (no depot compartment)",
                ));
            }
        }
        Ok(())
    }

    pub fn solver_options(&self) -> SolverOptions {
        let sim = &self.simulation;
        SolverOptions {
            method: sim.integration_method,
            rtol: sim.rtol,
            atol: sim.atol,
            step: sim.step,
            max_steps: sim.max_steps,
            ..SolverOptions::default()
        }
    }

    pub fn run_settings(&self) -> RunSettings {
        let sim = &self.simulation;
        RunSettings {
            solver: self.solver_options(),
            seed: sim.seed,
            population_seed: self.population.seed,
            residual_seed: sim.residual_seed,
            timeout: sim.timeout_secs.map(Duration::from_secs_f64),
            parallel: sim.parallel,
            threads: sim.threads,
        }
    }

    /// Library model with the configured overrides applied.
    pub fn build_model(&self) -> PKResult<ModelDefinition> {
        let m = &self.model;
        let mut builder = match m.kind {
            ModelKind::OneCompartment => one_compartment::builder(m.absorption),
            ModelKind::TwoCompartment => two_compartment::builder(m.absorption),
            ModelKind::ThreeCompartment => three_compartment::builder(m.absorption),
            ModelKind::IndirectResponse => indirect_response::builder(m.absorption),
        };

        for (name, param) in &m.parameters {
            builder = builder.theta(name, param.theta).scale(name, param.scale);
            if let Some(omega) = param.omega {
                builder = builder.random_effect(name.clone(), omega);
            }
            if let Some((lower, upper)) = param.bounds {
                builder = builder.bounds(name, lower, upper);
            }
        }
        for c in &m.correlations {
            builder = builder.covariance(c.first.clone(), c.second.clone(), c.covariance);
        }
        for c in &m.covariates {
            builder = builder.covariate_effect(c.parameter.clone(), c.covariate.clone(), c.model.clone());
        }
        for (output, error) in &m.error_models {
            builder = builder.error_model(output, error.clone());
        }
        for (output, floor) in &m.floors {
            builder = builder.floor(output, floor.clone());
        }
        builder.build()
    }

    pub fn build_design(&self, model: &ModelDefinition) -> PKResult<StudyDesign> {
        let regimens = self
            .dosing
            .iter()
            .map(|d| d.to_regimen(model))
            .collect::<PKResult<Vec<_>>>()?;

        let outputs = match &self.simulation.outputs {
            None => Vec::new(),
            Some(names) => names
                .iter()
                .map(|n| {
                    model
                        .output_index(n)
                        .ok_or_else(|| PKError::config(format!("Unknown output {} for model {}", n, model.name())))
                })
                .collect::<PKResult<Vec<_>>>()?,
        };

        Ok(StudyDesign {
            regimens,
            sample_times: self.simulation.time_points.clone(),
            outputs,
        })
    }
}

impl DosingConfig {
    fn to_regimen(&self, model: &ModelDefinition) -> PKResult<RegimenSpec> {
        let target = self
            .compartment
            .as_deref()
            .unwrap_or_else(|| self.route.default_compartment());
        let compartment = model.compartment_index(target).ok_or_else(|| {
            PKError::config(format!(
                "Dosing compartment {} does not exist in model {}",
                target,
                model.name()
            ))
        })?;

        let mut regimen = match self.duration {
            Some(d) => DosingRegimen::infusion(self.amount, compartment, d),
            None => DosingRegimen::bolus(self.amount, compartment),
        }
        .starting_at(self.start)
        .repeated(self.ii, self.addl);
        if let Some(lag) = self.lag {
            regimen = regimen.with_lag(lag);
        }
        if let Some(f) = self.bioavailability {
            regimen = regimen.with_bioavailability(f);
        }

        Ok(match &self.scale_by {
            Some(cov) => RegimenSpec::scaled(regimen, cov.clone()),
            None => RegimenSpec::fixed(regimen),
        })
    }
}
