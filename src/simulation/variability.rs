use crate::models::ModelDefinition;
use crate::simulation::individual::SimulationRecord;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

/// NONMEM-style residual error models. Sigmas are standard deviations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ErrorModel {
    /// Y = F * (1 + EPS(1))
    Proportional { sigma: f64 },
    /// Y = F + EPS(1)
    Additive { sigma: f64 },
    /// Y = F * (1 + EPS(1)) + EPS(2)
    Combined { sigma_prop: f64, sigma_add: f64 },
}

impl ErrorModel {
    pub(crate) fn validate(&self) -> Result<(), String> {
        let sigmas = match self {
            ErrorModel::Proportional { sigma } | ErrorModel::Additive { sigma } => vec![*sigma],
            ErrorModel::Combined { sigma_prop, sigma_add } => vec![*sigma_prop, *sigma_add],
        };
        match sigmas.iter().find(|s| !(s.is_finite() && **s >= 0.0)) {
            Some(s) => Err(format!("sigma must be finite and non-negative, got {}", s)),
            None => Ok(()),
        }
    }
}

/// What to do with an observation below the quantification limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlqAction {
    /// Report the limit itself.
    #[default]
    Clamp,
    /// Withhold the observed value; the record stays.
    Omit,
}

/// Rule applied to the noisy value after residual error.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Floor {
    #[default]
    None,
    /// Clamp to a minimum; `value = 0` is the zero floor.
    Minimum { value: f64 },
    /// Lower limit of quantification with a below-limit flag.
    Lloq {
        limit: f64,
        #[serde(default)]
        action: BlqAction,
    },
}

impl Floor {
    pub(crate) fn validate(&self) -> Result<(), String> {
        match self {
            Floor::None => Ok(()),
            Floor::Minimum { value } if value.is_finite() => Ok(()),
            Floor::Lloq { limit, .. } if limit.is_finite() => Ok(()),
            _ => Err("floor value must be finite".to_string()),
        }
    }

    pub fn apply(&self, value: f64) -> Observed {
        match self {
            Floor::None => Observed {
                value: Some(value),
                below_lloq: false,
            },
            Floor::Minimum { value: min } => Observed {
                value: Some(value.max(*min)),
                below_lloq: false,
            },
            Floor::Lloq { limit, action } => {
                if value < *limit {
                    let value = match action {
                        BlqAction::Clamp => Some(*limit),
                        BlqAction::Omit => None,
                    };
                    Observed {
                        value,
                        below_lloq: true,
                    }
                } else {
                    Observed {
                        value: Some(value),
                        below_lloq: false,
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observed {
    pub value: Option<f64>,
    pub below_lloq: bool,
}

fn draw<R: Rng + ?Sized>(sd: f64, rng: &mut R) -> f64 {
    let z: f64 = rng.sample(StandardNormal);
    sd * z
}

pub fn apply_proportional_error<R: Rng + ?Sized>(predicted: f64, sigma: f64, rng: &mut R) -> f64 {
    predicted * (1.0 + draw(sigma, rng))
}

pub fn apply_additive_error<R: Rng + ?Sized>(predicted: f64, sigma: f64, rng: &mut R) -> f64 {
    predicted + draw(sigma, rng)
}

/// Proportional epsilon is drawn before the additive one.
pub fn apply_combined_error<R: Rng + ?Sized>(
    predicted: f64,
    sigma_prop: f64,
    sigma_add: f64,
    rng: &mut R,
) -> f64 {
    let eps_prop = draw(sigma_prop, rng);
    let eps_add = draw(sigma_add, rng);
    predicted * (1.0 + eps_prop) + eps_add
}

/// Turns noiseless predictions into observed values.
pub struct ObservationModel;

impl ObservationModel {
    /// Residual error (if any) followed by the floor rule.
    pub fn observe<R: Rng + ?Sized>(
        noiseless: f64,
        error: Option<&ErrorModel>,
        floor: &Floor,
        rng: &mut R,
    ) -> Observed {
        let noisy = match error {
            None => noiseless,
            Some(ErrorModel::Proportional { sigma }) => apply_proportional_error(noiseless, *sigma, rng),
            Some(ErrorModel::Additive { sigma }) => apply_additive_error(noiseless, *sigma, rng),
            Some(ErrorModel::Combined { sigma_prop, sigma_add }) => {
                apply_combined_error(noiseless, *sigma_prop, *sigma_add, rng)
            }
        };
        floor.apply(noisy)
    }

    /// Fill the observed values of one subject's records, in record order and
    /// output declaration order.
    pub fn observe_records<R: Rng + ?Sized>(
        model: &ModelDefinition,
        records: &mut [SimulationRecord],
        rng: &mut R,
    ) {
        let outputs = model.outputs();
        for record in records.iter_mut() {
            for value in record.outputs.iter_mut() {
                let def = &outputs[value.output];
                let observed = Self::observe(value.predicted, def.error.as_ref(), &def.floor, rng);
                value.observed = observed.value;
                value.below_lloq = observed.below_lloq;
            }
        }
    }
}
