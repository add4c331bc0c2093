use super::derive_seed;
use crate::error::{PKError, PKResult};
use crate::models::RandomEffects;
use crate::simulation::individual::{CovariateValue, Subject};
use rand::distributions::{Uniform, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, LogNormal, Normal, StandardNormal};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const COVARIATE_STREAM: u64 = 0x636f76;
const ETA_STREAM: u64 = 0x657461;

/// Baseline covariate distribution. Optional `min`/`max` clamp the draw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "distribution", rename_all = "snake_case")]
pub enum CovariateDistribution {
    Normal {
        mean: f64,
        sd: f64,
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    LogNormal {
        median: f64,
        sigma: f64,
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    Uniform {
        min: f64,
        max: f64,
    },
    Categorical {
        categories: Vec<String>,
        weights: Vec<f64>,
    },
    Discrete {
        values: Vec<f64>,
        weights: Vec<f64>,
    },
    Constant {
        value: CovariateValue,
    },
}

impl CovariateDistribution {
    pub fn is_categorical(&self) -> bool {
        match self {
            CovariateDistribution::Categorical { .. } => true,
            CovariateDistribution::Constant { value } => matches!(value, CovariateValue::Categorical(_)),
            _ => false,
        }
    }
}

enum Sampler {
    Normal(Normal<f64>, Option<f64>, Option<f64>),
    LogNormal(LogNormal<f64>, Option<f64>, Option<f64>),
    Uniform(Uniform<f64>),
    Categorical(Vec<String>, WeightedIndex<f64>),
    Discrete(Vec<f64>, WeightedIndex<f64>),
    Constant(CovariateValue),
}

fn clamp(value: f64, min: Option<f64>, max: Option<f64>) -> f64 {
    let value = min.map_or(value, |lo| value.max(lo));
    max.map_or(value, |hi| value.min(hi))
}

fn check_clamp(name: &str, min: Option<f64>, max: Option<f64>) -> PKResult<()> {
    if let (Some(lo), Some(hi)) = (min, max) {
        if !(lo <= hi) {
            return Err(PKError::config(format!(
                "covariate {}: min {} exceeds max {}",
                name, lo, hi
            )));
        }
    }
    Ok(())
}

fn weighted(name: &str, n: usize, weights: &[f64]) -> PKResult<WeightedIndex<f64>> {
    if n == 0 {
        return Err(PKError::config(format!("covariate {}: no levels declared", name)));
    }
    if weights.len() != n {
        return Err(PKError::config(format!(
            "covariate {}: {} levels but {} weights",
            name,
            n,
            weights.len()
        )));
    }
    WeightedIndex::new(weights)
        .map_err(|e| PKError::config(format!("covariate {}: invalid weights: {}", name, e)))
}

impl Sampler {
    fn new(name: &str, dist: &CovariateDistribution) -> PKResult<Self> {
        let bad = |what: &str| PKError::config(format!("covariate {}: {}", name, what));
        let sampler = match dist {
            CovariateDistribution::Normal { mean, sd, min, max } => {
                check_clamp(name, *min, *max)?;
                if !mean.is_finite() {
                    return Err(bad("mean must be finite"));
                }
                let normal = Normal::new(*mean, *sd).map_err(|e| bad(&e.to_string()))?;
                Sampler::Normal(normal, *min, *max)
            }
            CovariateDistribution::LogNormal { median, sigma, min, max } => {
                check_clamp(name, *min, *max)?;
                if !(median.is_finite() && *median > 0.0) {
                    return Err(bad("log-normal median must be positive"));
                }
                let ln = LogNormal::new(median.ln(), *sigma).map_err(|e| bad(&e.to_string()))?;
                Sampler::LogNormal(ln, *min, *max)
            }
            CovariateDistribution::Uniform { min, max } => {
                if !(min.is_finite() && max.is_finite() && min < max) {
                    return Err(bad("uniform bounds must be finite with min < max"));
                }
                Sampler::Uniform(Uniform::new(*min, *max))
            }
            CovariateDistribution::Categorical { categories, weights } => {
                Sampler::Categorical(categories.clone(), weighted(name, categories.len(), weights)?)
            }
            CovariateDistribution::Discrete { values, weights } => {
                if values.iter().any(|v| !v.is_finite()) {
                    return Err(bad("discrete values must be finite"));
                }
                Sampler::Discrete(values.clone(), weighted(name, values.len(), weights)?)
            }
            CovariateDistribution::Constant { value } => Sampler::Constant(value.clone()),
        };
        Ok(sampler)
    }

    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> CovariateValue {
        match self {
            Sampler::Normal(d, min, max) => CovariateValue::Numeric(clamp(d.sample(rng), *min, *max)),
            Sampler::LogNormal(d, min, max) => CovariateValue::Numeric(clamp(d.sample(rng), *min, *max)),
            Sampler::Uniform(d) => CovariateValue::Numeric(d.sample(rng)),
            Sampler::Categorical(levels, w) => CovariateValue::Categorical(levels[w.sample(rng)].clone()),
            Sampler::Discrete(values, w) => CovariateValue::Numeric(values[w.sample(rng)]),
            Sampler::Constant(v) => v.clone(),
        }
    }
}

/// Draws virtual subjects. Subject `i` (id `i + 1`) depends only on the seed
/// and `i`, so any subset can be regenerated independently.
pub struct PopulationGenerator {
    samplers: Vec<(String, Sampler)>,
    random_effects: RandomEffects,
    seed: u64,
}

impl PopulationGenerator {
    /// Every distribution is checked here; an invalid one fails before any
    /// subject is drawn.
    pub fn new(
        covariates: &BTreeMap<String, CovariateDistribution>,
        random_effects: &RandomEffects,
        seed: u64,
    ) -> PKResult<Self> {
        let samplers = covariates
            .iter()
            .map(|(name, dist)| Ok((name.clone(), Sampler::new(name, dist)?)))
            .collect::<PKResult<Vec<_>>>()?;
        Ok(Self {
            samplers,
            random_effects: random_effects.clone(),
            seed,
        })
    }

    pub fn generate_subject(&self, index: usize) -> Subject {
        let mut cov_rng = StdRng::seed_from_u64(derive_seed(derive_seed(self.seed, COVARIATE_STREAM), index as u64));
        let covariates = self
            .samplers
            .iter()
            .map(|(name, sampler)| (name.clone(), sampler.sample(&mut cov_rng)))
            .collect();

        let mut eta_rng = StdRng::seed_from_u64(derive_seed(derive_seed(self.seed, ETA_STREAM), index as u64));
        let z: Vec<f64> = (0..self.random_effects.len())
            .map(|_| eta_rng.sample(StandardNormal))
            .collect();
        let etas = self.random_effects.correlate(&z);

        Subject::new(index + 1, covariates, etas)
    }

    pub fn generate(&self, n: usize) -> Vec<Subject> {
        (0..n).map(|i| self.generate_subject(i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ModelDefinition;

    fn random_effects() -> RandomEffects {
        ModelDefinition::builder("re")
            .compartment("central")
            .parameter("CL", 5.0)
            .parameter("V", 50.0)
            .random_effect("CL", 0.09)
            .random_effect("V", 0.04)
            .covariance("CL", "V", 0.024)
            .diffeq(|_t, x, p, dx| dx[0] = -p[0] / p[1] * x[0])
            .output("CP", |x, p| x[0] / p[1])
            .build()
            .unwrap()
            .random_effects()
            .clone()
    }

    fn covariates() -> BTreeMap<String, CovariateDistribution> {
        let mut c = BTreeMap::new();
        c.insert(
            "WT".to_string(),
            CovariateDistribution::Normal {
                mean: 70.0,
                sd: 15.0,
                min: Some(40.0),
                max: Some(120.0),
            },
        );
        c.insert(
            "SEX".to_string(),
            CovariateDistribution::Categorical {
                categories: vec!["M".to_string(), "F".to_string()],
                weights: vec![0.5, 0.5],
            },
        );
        c.insert("AGE".to_string(), CovariateDistribution::Uniform { min: 18.0, max: 65.0 });
        c
    }

    #[test]
    fn test_generation_is_deterministic() {
        let gen1 = PopulationGenerator::new(&covariates(), &random_effects(), 42).unwrap();
        let gen2 = PopulationGenerator::new(&covariates(), &random_effects(), 42).unwrap();
        assert_eq!(gen1.generate(25), gen2.generate(25));

        let other = PopulationGenerator::new(&covariates(), &random_effects(), 43).unwrap();
        assert_ne!(gen1.generate(5), other.generate(5));
    }

    #[test]
    fn test_subject_independent_of_cohort_size() {
        let gen = PopulationGenerator::new(&covariates(), &random_effects(), 7).unwrap();
        let cohort = gen.generate(10);
        assert_eq!(cohort[6], gen.generate_subject(6));
        assert_eq!(cohort[6].id(), 7);
    }

    #[test]
    fn test_clamped_normal_and_categories() {
        let gen = PopulationGenerator::new(&covariates(), &random_effects(), 1).unwrap();
        for s in gen.generate(500) {
            let wt = s.covariate("WT").and_then(CovariateValue::as_f64).unwrap();
            assert!((40.0..=120.0).contains(&wt));
            let age = s.covariate("AGE").and_then(CovariateValue::as_f64).unwrap();
            assert!((18.0..65.0).contains(&age));
            match s.covariate("SEX") {
                Some(CovariateValue::Categorical(level)) => assert!(level == "M" || level == "F"),
                other => panic!("unexpected SEX value {:?}", other),
            }
            assert_eq!(s.etas().len(), 2);
        }
    }

    #[test]
    fn test_random_effect_covariance() {
        let gen = PopulationGenerator::new(&BTreeMap::new(), &random_effects(), 11).unwrap();
        let subjects = gen.generate(20_000);
        let n = subjects.len() as f64;
        let (mut s00, mut s01, mut s11) = (0.0, 0.0, 0.0);
        for s in &subjects {
            let e = s.etas();
            s00 += e[0] * e[0];
            s01 += e[0] * e[1];
            s11 += e[1] * e[1];
        }
        assert!((s00 / n - 0.09).abs() < 0.005);
        assert!((s11 / n - 0.04).abs() < 0.003);
        assert!((s01 / n - 0.024).abs() < 0.003);
    }

    #[test]
    fn test_invalid_distributions_fail_at_construction() {
        let mut c = BTreeMap::new();
        c.insert(
            "WT".to_string(),
            CovariateDistribution::Normal {
                mean: 70.0,
                sd: -1.0,
                min: None,
                max: None,
            },
        );
        assert!(PopulationGenerator::new(&c, &random_effects(), 1).is_err());

        let mut c = BTreeMap::new();
        c.insert(
            "RACE".to_string(),
            CovariateDistribution::Categorical {
                categories: vec!["A".to_string(), "B".to_string()],
                weights: vec![1.0],
            },
        );
        assert!(PopulationGenerator::new(&c, &random_effects(), 1).is_err());

        let mut c = BTreeMap::new();
        c.insert("AGE".to_string(), CovariateDistribution::Uniform { min: 5.0, max: 5.0 });
        assert!(PopulationGenerator::new(&c, &random_effects(), 1).is_err());
    }

    #[test]
    fn test_distribution_deserialization() {
        let json = r#"{
            "WT": {"distribution": "normal", "mean": 70, "sd": 12, "max": 150},
            "CRCL": {"distribution": "log_normal", "median": 90, "sigma": 0.3},
            "SEX": {"distribution": "categorical", "categories": ["M", "F"], "weights": [0.6, 0.4]}
        }"#;
        let parsed: BTreeMap<String, CovariateDistribution> = serde_json::from_str(json).unwrap();
        assert_eq!(
            parsed["WT"],
            CovariateDistribution::Normal {
                mean: 70.0,
                sd: 12.0,
                min: None,
                max: Some(150.0)
            }
        );
        assert!(parsed["SEX"].is_categorical());
    }
}
