use crate::error::{PKError, PKResult};
use crate::simulation::individual::{CovariateValue, Subject};
use serde::Serialize;
use std::cmp::Ordering;

/// A dose repeated `addl` additional times every `ii` time units.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DosingRegimen {
    pub amount: f64,
    /// Target compartment index.
    pub compartment: usize,
    pub start: f64,
    pub ii: f64,
    pub addl: u32,
    /// Absorption lag; applied by the simulator, not the scheduler.
    pub lag: Option<f64>,
    /// Zero-order input duration. `None` is a bolus.
    pub duration: Option<f64>,
    pub bioavailability: f64,
}

impl DosingRegimen {
    pub fn bolus(amount: f64, compartment: usize) -> Self {
        Self {
            amount,
            compartment,
            start: 0.0,
            ii: 0.0,
            addl: 0,
            lag: None,
            duration: None,
            bioavailability: 1.0,
        }
    }

    pub fn infusion(amount: f64, compartment: usize, duration: f64) -> Self {
        Self {
            duration: Some(duration),
            ..Self::bolus(amount, compartment)
        }
    }

    pub fn starting_at(mut self, start: f64) -> Self {
        self.start = start;
        self
    }

    pub fn repeated(mut self, ii: f64, addl: u32) -> Self {
        self.ii = ii;
        self.addl = addl;
        self
    }

    pub fn with_lag(mut self, lag: f64) -> Self {
        self.lag = Some(lag);
        self
    }

    pub fn with_bioavailability(mut self, f: f64) -> Self {
        self.bioavailability = f;
        self
    }

    fn validate(&self) -> PKResult<()> {
        if !(self.amount.is_finite() && self.amount > 0.0) {
            return Err(PKError::scheduling(format!(
                "dose amount must be finite and positive, got {}",
                self.amount
            )));
        }
        if !(self.start.is_finite() && self.start >= 0.0) {
            return Err(PKError::scheduling(format!(
                "dose start time must be finite and non-negative, got {}",
                self.start
            )));
        }
        if !self.ii.is_finite() || self.ii < 0.0 {
            return Err(PKError::scheduling(format!("negative or invalid dosing interval {}", self.ii)));
        }
        if self.addl > 0 && self.ii <= 0.0 {
            return Err(PKError::scheduling(format!(
                "{} additional doses require a positive interval, got {}",
                self.addl, self.ii
            )));
        }
        if let Some(lag) = self.lag {
            if !(lag.is_finite() && lag >= 0.0) {
                return Err(PKError::scheduling(format!("invalid lag time {}", lag)));
            }
        }
        if let Some(d) = self.duration {
            if !(d.is_finite() && d > 0.0) {
                return Err(PKError::scheduling(format!("infusion duration must be positive, got {}", d)));
            }
        }
        if !(self.bioavailability.is_finite() && self.bioavailability >= 0.0) {
            return Err(PKError::scheduling(format!(
                "invalid bioavailability {}",
                self.bioavailability
            )));
        }
        Ok(())
    }
}

/// A regimen as declared for the whole cohort. With `scale_by` the amount is
/// per unit of that numeric covariate (e.g. mg/kg with `WT`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegimenSpec {
    pub regimen: DosingRegimen,
    pub scale_by: Option<String>,
}

impl RegimenSpec {
    pub fn fixed(regimen: DosingRegimen) -> Self {
        Self {
            regimen,
            scale_by: None,
        }
    }

    pub fn scaled(regimen: DosingRegimen, covariate: impl Into<String>) -> Self {
        Self {
            regimen,
            scale_by: Some(covariate.into()),
        }
    }

    /// The concrete regimen for one subject.
    pub fn resolve(&self, subject: &Subject) -> PKResult<DosingRegimen> {
        let Some(covariate) = &self.scale_by else {
            return Ok(self.regimen.clone());
        };
        let factor = match subject.covariate(covariate) {
            Some(CovariateValue::Numeric(v)) if v.is_finite() => *v,
            Some(other) => {
                return Err(PKError::scheduling(format!(
                    "subject {}: cannot scale dose by {} = {:?}",
                    subject.id(),
                    covariate,
                    other
                )))
            }
            None => {
                return Err(PKError::scheduling(format!(
                    "subject {}: dose scaled by missing covariate {}",
                    subject.id(),
                    covariate
                )))
            }
        };
        Ok(DosingRegimen {
            amount: self.regimen.amount * factor,
            ..self.regimen.clone()
        })
    }
}

/// A concrete administration after addl/ii expansion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Dose {
    pub amount: f64,
    pub compartment: usize,
    pub lag: f64,
    pub duration: Option<f64>,
    pub bioavailability: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observe {
    /// Output indices to record.
    pub outputs: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EventKind {
    Dose(Dose),
    Observe(Observe),
}

impl EventKind {
    fn rank(&self) -> u8 {
        match self {
            EventKind::Dose(_) => 0,
            EventKind::Observe(_) => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    /// Nominal time. Dose lag is not folded in.
    pub time: f64,
    pub kind: EventKind,
    /// Declaration order; the last tie-breaker.
    pub order: usize,
}

impl Event {
    pub fn is_dose(&self) -> bool {
        matches!(self.kind, EventKind::Dose(_))
    }

    /// Ordering used for a subject timeline: time, then DOSE before OBSERVE,
    /// then declaration order.
    pub fn timeline_cmp(&self, other: &Self) -> Ordering {
        self.time
            .total_cmp(&other.time)
            .then(self.kind.rank().cmp(&other.kind.rank()))
            .then(self.order.cmp(&other.order))
    }
}

pub struct EventScheduler {
    regimens: Vec<DosingRegimen>,
    sample_times: Vec<f64>,
    outputs: Vec<usize>,
}

impl EventScheduler {
    /// Fails with [`PKError::Scheduling`] on a malformed regimen or sample time.
    pub fn new(regimens: Vec<DosingRegimen>, sample_times: Vec<f64>, outputs: Vec<usize>) -> PKResult<Self> {
        for regimen in &regimens {
            regimen.validate()?;
        }
        if let Some(t) = sample_times.iter().find(|t| !(t.is_finite() && **t >= 0.0)) {
            return Err(PKError::scheduling(format!("invalid sampling time {}", t)));
        }
        Ok(Self {
            regimens,
            sample_times,
            outputs,
        })
    }

    pub fn schedule(&self) -> Vec<Event> {
        let mut events = Vec::new();
        let mut order = 0;

        for regimen in &self.regimens {
            let dose = Dose {
                amount: regimen.amount,
                compartment: regimen.compartment,
                lag: regimen.lag.unwrap_or(0.0),
                duration: regimen.duration,
                bioavailability: regimen.bioavailability,
            };
            for k in 0..=regimen.addl {
                events.push(Event {
                    time: regimen.start + k as f64 * regimen.ii,
                    kind: EventKind::Dose(dose),
                    order,
                });
                order += 1;
            }
        }

        for &time in &self.sample_times {
            events.push(Event {
                time,
                kind: EventKind::Observe(Observe {
                    outputs: self.outputs.clone(),
                }),
                order,
            });
            order += 1;
        }

        events.sort_by(Event::timeline_cmp);
        events
    }
}

/// Convenience wrapper over [`EventScheduler`].
pub fn schedule(
    regimens: Vec<DosingRegimen>,
    sample_times: Vec<f64>,
    outputs: Vec<usize>,
) -> PKResult<Vec<Event>> {
    Ok(EventScheduler::new(regimens, sample_times, outputs)?.schedule())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dose_times(events: &[Event]) -> Vec<f64> {
        events.iter().filter(|e| e.is_dose()).map(|e| e.time).collect()
    }

    #[test]
    fn test_addl_expansion() {
        let regimen = DosingRegimen::bolus(100.0, 0).repeated(24.0, 3);
        let events = schedule(vec![regimen], vec![], vec![0]).unwrap();
        assert_eq!(events.len(), 4);
        assert_eq!(dose_times(&events), vec![0.0, 24.0, 48.0, 72.0]);
        for e in &events {
            match &e.kind {
                EventKind::Dose(d) => assert_eq!(d.amount, 100.0),
                EventKind::Observe(_) => panic!("unexpected observation"),
            }
        }
    }

    #[test]
    fn test_dose_precedes_coincident_observation() {
        let regimen = DosingRegimen::bolus(100.0, 0).repeated(12.0, 1);
        let events = schedule(vec![regimen], vec![12.0, 0.0, 6.0], vec![0]).unwrap();
        let kinds: Vec<(f64, bool)> = events.iter().map(|e| (e.time, e.is_dose())).collect();
        assert_eq!(
            kinds,
            vec![(0.0, true), (0.0, false), (6.0, false), (12.0, true), (12.0, false)]
        );
    }

    #[test]
    fn test_ties_follow_declaration_order() {
        let a = DosingRegimen::bolus(10.0, 0);
        let b = DosingRegimen::bolus(20.0, 1);
        let events = schedule(vec![a, b], vec![1.0, 1.0], vec![0]).unwrap();
        let amounts: Vec<f64> = events
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::Dose(d) => Some(d.amount),
                _ => None,
            })
            .collect();
        assert_eq!(amounts, vec![10.0, 20.0]);
        let orders: Vec<usize> = events.iter().map(|e| e.order).collect();
        assert_eq!(orders, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_lag_keeps_nominal_time() {
        let regimen = DosingRegimen::bolus(100.0, 0).starting_at(2.0).with_lag(0.5);
        let events = schedule(vec![regimen], vec![], vec![]).unwrap();
        assert_eq!(events[0].time, 2.0);
        match &events[0].kind {
            EventKind::Dose(d) => assert_eq!(d.lag, 0.5),
            _ => panic!("expected dose"),
        }
    }

    #[test]
    fn test_timeline_is_non_decreasing() {
        let regimens = vec![
            DosingRegimen::bolus(50.0, 0).repeated(8.0, 5),
            DosingRegimen::infusion(100.0, 1, 1.5).starting_at(3.0).repeated(12.0, 2),
        ];
        let samples: Vec<f64> = (0..50).map(|i| i as f64 * 0.75).rev().collect();
        let events = schedule(regimens, samples, vec![0]).unwrap();
        assert!(events.windows(2).all(|w| w[0].timeline_cmp(&w[1]) == Ordering::Less));
    }

    #[test]
    fn test_weight_based_amount() {
        use std::collections::BTreeMap;
        let spec = RegimenSpec::scaled(DosingRegimen::bolus(2.0, 0), "WT");
        let mut cov = BTreeMap::new();
        cov.insert("WT".to_string(), CovariateValue::Numeric(80.0));
        let heavy = Subject::new(1, cov, vec![]);
        assert_eq!(spec.resolve(&heavy).unwrap().amount, 160.0);

        let unknown = Subject::new(2, BTreeMap::new(), vec![]);
        assert!(matches!(spec.resolve(&unknown), Err(PKError::Scheduling(_))));

        let mut cov = BTreeMap::new();
        cov.insert("WT".to_string(), CovariateValue::Categorical("heavy".to_string()));
        assert!(spec.resolve(&Subject::new(3, cov, vec![])).is_err());
    }

    #[test]
    fn test_scheduling_conflicts() {
        let negative_ii = DosingRegimen::bolus(100.0, 0).repeated(-24.0, 3);
        assert!(matches!(
            EventScheduler::new(vec![negative_ii], vec![], vec![]),
            Err(PKError::Scheduling(_))
        ));

        let zero_ii = DosingRegimen::bolus(100.0, 0).repeated(0.0, 2);
        assert!(EventScheduler::new(vec![zero_ii], vec![], vec![]).is_err());

        let bad_duration = DosingRegimen::infusion(100.0, 0, 0.0);
        assert!(EventScheduler::new(vec![bad_duration], vec![], vec![]).is_err());

        let ok = DosingRegimen::bolus(100.0, 0);
        assert!(EventScheduler::new(vec![ok], vec![-1.0], vec![]).is_err());

        let empty = DosingRegimen::bolus(0.0, 0);
        assert!(matches!(
            EventScheduler::new(vec![empty], vec![], vec![]),
            Err(PKError::Scheduling(_))
        ));
    }
}
