pub mod cohort;
pub mod engine;
pub mod individual;
pub mod integrator;
pub mod population;
pub mod variability;

use crate::config::Config;
use crate::dosing::{DosingRegimen, EventScheduler, RegimenSpec};
use crate::error::{FailureKind, PKError, PKResult, SubjectFailure};
use crate::models::ModelDefinition;
use chrono::Utc;
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

pub use cohort::*;
pub use engine::{DoseRecord, Engine, StateAnomaly, SubjectRun};
pub use individual::*;
pub use integrator::{IntegrationMethod, SolverOptions};
pub use population::*;
pub use variability::*;

const POPULATION_STREAM: u64 = 1;
const RESIDUAL_STREAM: u64 = 2;

/// Split a master seed into an independent per-index seed (splitmix64).
pub fn derive_seed(master: u64, index: u64) -> u64 {
    let mut z = master ^ index.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// What every subject receives and when they are sampled.
#[derive(Debug, Clone, PartialEq)]
pub struct StudyDesign {
    pub regimens: Vec<RegimenSpec>,
    pub sample_times: Vec<f64>,
    /// Output indices recorded at each sample; empty records all outputs.
    pub outputs: Vec<usize>,
}

impl StudyDesign {
    pub fn new(regimens: Vec<DosingRegimen>, sample_times: Vec<f64>) -> Self {
        Self {
            regimens: regimens.into_iter().map(RegimenSpec::fixed).collect(),
            sample_times,
            outputs: Vec::new(),
        }
    }

    pub fn with_regimen(mut self, regimen: RegimenSpec) -> Self {
        self.regimens.push(regimen);
        self
    }

    pub fn with_outputs(mut self, outputs: Vec<usize>) -> Self {
        self.outputs = outputs;
        self
    }

    fn validate(&self, model: &ModelDefinition) -> PKResult<()> {
        if let Some(t) = self.sample_times.iter().find(|t| !(t.is_finite() && **t >= 0.0)) {
            return Err(PKError::config(format!("invalid sampling time {}", t)));
        }
        if let Some(o) = self.outputs.iter().find(|&&o| o >= model.outputs().len()) {
            return Err(PKError::config(format!(
                "output index {} out of range for model '{}'",
                o,
                model.name()
            )));
        }
        for spec in &self.regimens {
            if spec.regimen.compartment >= model.n_states() {
                return Err(PKError::config(format!(
                    "regimen targets compartment {} but model '{}' has {}",
                    spec.regimen.compartment,
                    model.name(),
                    model.n_states()
                )));
            }
        }
        Ok(())
    }
}

/// Run controls independent of the model.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    pub solver: SolverOptions,
    /// Master seed; drawn from entropy (and logged) when absent.
    pub seed: Option<u64>,
    pub population_seed: Option<u64>,
    pub residual_seed: Option<u64>,
    pub timeout: Option<Duration>,
    pub parallel: bool,
    /// Dedicated worker pool size; the global pool otherwise.
    pub threads: Option<usize>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            solver: SolverOptions::default(),
            seed: None,
            population_seed: None,
            residual_seed: None,
            timeout: None,
            parallel: true,
            threads: None,
        }
    }
}

impl RunSettings {
    fn validate(&self) -> PKResult<()> {
        self.solver.validate()?;
        if self.threads == Some(0) {
            return Err(PKError::config("threads must be > 0"));
        }
        Ok(())
    }
}

pub struct Simulator {
    model: ModelDefinition,
    individualizer: Individualizer,
    design: StudyDesign,
    settings: RunSettings,
    population: Option<PopulationGenerator>,
    population_seed: u64,
    residual_seed: u64,
}

impl Simulator {
    /// Build from a validated configuration. An explicit `seed` overrides the
    /// one in the configuration.
    pub fn new(config: Config, seed: Option<u64>) -> PKResult<Self> {
        config.validate()?;
        let model = config.build_model()?;
        let design = config.build_design(&model)?;
        let mut settings = config.run_settings();
        if seed.is_some() {
            settings.seed = seed;
        }
        Self::from_parts(model, design, settings)?.with_population(&config.population.covariates)
    }

    pub fn from_parts(model: ModelDefinition, design: StudyDesign, settings: RunSettings) -> PKResult<Self> {
        settings.validate()?;
        design.validate(&model)?;

        let master = match settings.seed {
            Some(s) => s,
            None => {
                let s: u64 = StdRng::from_entropy().gen();
                info!("No seed given; using random seed {}", s);
                s
            }
        };
        let population_seed = settings
            .population_seed
            .unwrap_or_else(|| derive_seed(master, POPULATION_STREAM));
        let residual_seed = settings
            .residual_seed
            .unwrap_or_else(|| derive_seed(master, RESIDUAL_STREAM));

        Ok(Self {
            individualizer: Individualizer::new(&model),
            model,
            design,
            settings,
            population: None,
            population_seed,
            residual_seed,
        })
    }

    /// Attach covariate distributions. Every covariate the model or a
    /// weight-based regimen reads must be generated, with a matching kind.
    pub fn with_population(mut self, covariates: &BTreeMap<String, CovariateDistribution>) -> PKResult<Self> {
        for (name, categorical) in self.model.referenced_covariates() {
            match covariates.get(&name) {
                None => {
                    return Err(PKError::config(format!(
                        "model '{}' uses covariate {} which the population does not generate",
                        self.model.name(),
                        name
                    )))
                }
                Some(dist) if dist.is_categorical() != categorical => {
                    return Err(PKError::config(format!(
                        "covariate {} is {} in the population but used as {} by the model",
                        name,
                        kind_name(dist.is_categorical()),
                        kind_name(categorical)
                    )))
                }
                Some(_) => {}
            }
        }
        for name in self.design.regimens.iter().filter_map(|r| r.scale_by.as_ref()) {
            match covariates.get(name) {
                Some(dist) if !dist.is_categorical() => {}
                _ => {
                    return Err(PKError::config(format!(
                        "dose scaled by {} which is not a generated numeric covariate",
                        name
                    )))
                }
            }
        }

        self.population = Some(PopulationGenerator::new(
            covariates,
            self.model.random_effects(),
            self.population_seed,
        )?);
        Ok(self)
    }

    /// Re-seed residual error only; predictions are unaffected.
    pub fn with_residual_seed(mut self, seed: u64) -> Self {
        self.residual_seed = seed;
        self
    }

    pub fn model(&self) -> &ModelDefinition {
        &self.model
    }

    pub fn design(&self) -> &StudyDesign {
        &self.design
    }

    pub fn population_seed(&self) -> u64 {
        self.population_seed
    }

    pub fn residual_seed(&self) -> u64 {
        self.residual_seed
    }

    pub fn generate_population(&self, n: usize) -> PKResult<Vec<Subject>> {
        let generator = self
            .population
            .as_ref()
            .ok_or_else(|| PKError::config("no population distributions attached"))?;
        Ok(generator.generate(n))
    }

    pub fn simulate_population(&self, n_subjects: usize) -> PKResult<Cohort> {
        let subjects = self.generate_population(n_subjects)?;
        self.simulate_subjects(subjects)
    }

    /// Simulate a given cohort. Per-subject failures are collected in the
    /// result; only an unusable worker pool or duplicate ids fail the call.
    pub fn simulate_subjects(&self, subjects: Vec<Subject>) -> PKResult<Cohort> {
        let mut ids = BTreeSet::new();
        if let Some(dup) = subjects.iter().find(|s| !ids.insert(s.id())) {
            return Err(PKError::config(format!("duplicate subject id {}", dup.id())));
        }

        let started_at = Utc::now();
        let clock = Instant::now();
        let deadline = self.settings.timeout.map(|d| clock + d);
        let total = subjects.len();
        info!(
            "Starting population simulation for {} subjects (population seed {}, residual seed {})",
            total, self.population_seed, self.residual_seed
        );

        let done = AtomicUsize::new(0);
        let simulate = |subject: &Subject| {
            let outcome = self.simulate_with_deadline(subject, deadline);
            let n = done.fetch_add(1, Ordering::Relaxed) + 1;
            if n <= 10 || n % 10 == 0 {
                debug!("Simulated subject {}/{}", n, total);
            }
            outcome
        };
        let work = || {
            if self.settings.parallel {
                subjects
                    .par_iter()
                    .fold(CohortBuffer::default, |buf, s| buf.push(simulate(s)))
                    .reduce(CohortBuffer::default, CohortBuffer::merge)
            } else {
                subjects
                    .iter()
                    .fold(CohortBuffer::default(), |buf, s| buf.push(simulate(s)))
            }
        };
        let buffer = match self.settings.threads {
            Some(n) if self.settings.parallel => rayon::ThreadPoolBuilder::new()
                .num_threads(n)
                .build()
                .map_err(|e| PKError::config(format!("cannot build worker pool: {}", e)))?
                .install(work),
            _ => work(),
        }
        .finish();

        let cancelled = buffer.count(FailureKind::Cancelled);
        if cancelled > 0 {
            warn!(
                "Timeout reached: {} of {} subjects cancelled, returning partial results",
                cancelled, total
            );
        }
        let summary = RunSummary {
            requested: total,
            succeeded: buffer.results.len(),
            failed: buffer.failures.len() - cancelled,
            cancelled,
            timed_out: cancelled > 0,
            started_at,
            elapsed_ms: clock.elapsed().as_millis() as u64,
            population_seed: self.population_seed,
            residual_seed: self.residual_seed,
            completed: buffer.results.iter().map(|r| r.subject_id).collect(),
            failures: buffer.failures.iter().map(|f| f.to_string()).collect(),
        };
        info!(
            "Population simulation completed: {} succeeded, {} failed, {} cancelled in {} ms",
            summary.succeeded, summary.failed, summary.cancelled, summary.elapsed_ms
        );

        Ok(Cohort {
            subjects,
            results: buffer.results,
            failures: buffer.failures,
            summary,
        })
    }

    pub fn simulate_subject(&self, subject: &Subject) -> Result<SubjectResult, SubjectFailure> {
        self.simulate_with_deadline(subject, None)
    }

    fn simulate_with_deadline(
        &self,
        subject: &Subject,
        deadline: Option<Instant>,
    ) -> Result<SubjectResult, SubjectFailure> {
        let outcome = self.run_subject(subject, deadline);
        if let Err(failure) = &outcome {
            if failure.kind != FailureKind::Cancelled {
                warn!("{}", failure);
            }
        }
        outcome
    }

    fn run_subject(&self, subject: &Subject, deadline: Option<Instant>) -> Result<SubjectResult, SubjectFailure> {
        let id = subject.id();
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(SubjectFailure {
                subject_id: id,
                kind: FailureKind::Cancelled,
                reason: "run timeout reached before the subject started".to_string(),
                last_time: None,
            });
        }
        let fail = |kind: FailureKind| move |e: PKError| SubjectFailure::from_error(id, kind, &e);

        let parameters = self
            .individualizer
            .individualize(subject)
            .map_err(fail(FailureKind::Individualization))?;

        let regimens = self
            .design
            .regimens
            .iter()
            .map(|r| r.resolve(subject))
            .collect::<PKResult<Vec<_>>>()
            .map_err(fail(FailureKind::Scheduling))?;
        let events = EventScheduler::new(regimens, self.design.sample_times.clone(), self.design.outputs.clone())
            .map_err(fail(FailureKind::Scheduling))?
            .schedule();

        let run = Engine::new(&self.model, &self.settings.solver)
            .with_deadline(deadline)
            .run(id, &parameters, &events)
            .map_err(fail(FailureKind::Integration))?;

        let mut records = run.records;
        let mut rng = StdRng::seed_from_u64(derive_seed(self.residual_seed, id as u64));
        ObservationModel::observe_records(&self.model, &mut records, &mut rng);

        Ok(SubjectResult {
            subject_id: id,
            parameters,
            doses: run.doses,
            records,
            anomalies: run.anomalies,
        })
    }
}

fn kind_name(categorical: bool) -> &'static str {
    if categorical {
        "categorical"
    } else {
        "numeric"
    }
}
