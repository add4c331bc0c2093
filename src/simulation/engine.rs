use crate::dosing::{Event, EventKind};
use crate::error::{PKError, PKResult};
use crate::models::ModelDefinition;
use crate::simulation::individual::{IndividualParameters, OutputValue, SimulationRecord};
use crate::simulation::integrator::{Integrator, SolverOptions, State};
use log::{debug, warn};
use ode_solvers::System;
use serde::Serialize;
use std::time::Instant;

/// An administered dose as it entered the system.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DoseRecord {
    /// Nominal time from the regimen.
    pub time: f64,
    /// Time the amount actually entered, after lag.
    pub effective_time: f64,
    /// Amount after bioavailability.
    pub amount: f64,
    pub compartment: usize,
    pub duration: Option<f64>,
}

/// A nonnegative compartment observed below zero beyond solver tolerance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateAnomaly {
    pub time: f64,
    pub compartment: String,
    pub value: f64,
}

#[derive(Debug, Clone, Default)]
pub struct SubjectRun {
    pub records: Vec<SimulationRecord>,
    pub doses: Vec<DoseRecord>,
    pub anomalies: Vec<StateAnomaly>,
}

#[derive(Debug, Clone, Copy)]
enum Action {
    Bolus { compartment: usize, amount: f64 },
    RateOn { id: usize, compartment: usize, rate: f64 },
    RateOff { id: usize },
    Observe { event: usize },
}

impl Action {
    // State changes at an instant precede the observation at that instant.
    fn rank(&self) -> u8 {
        match self {
            Action::Observe { .. } => 1,
            _ => 0,
        }
    }
}

struct Timed {
    time: f64,
    order: usize,
    action: Action,
}

struct SubjectSystem<'a> {
    model: &'a ModelDefinition,
    params: &'a [f64],
    rates: &'a [f64],
}

impl System<f64, State> for SubjectSystem<'_> {
    fn system(&self, t: f64, y: &State, dy: &mut State) {
        self.model.derivative(t, y.as_slice(), self.params, dy.as_mut_slice());
        for (d, r) in dy.iter_mut().zip(self.rates) {
            *d += r;
        }
    }
}

/// Relative distance under which two action times are the same instant.
const SAME_INSTANT: f64 = 1e-9;

/// Pull times that differ only by rounding (`3 * 0.1` against `0.3`) onto
/// the earliest time of their cluster. `actions` must be sorted by time.
fn snap_times(actions: &mut [Timed]) {
    let Some(first) = actions.first() else { return };
    let mut anchor = first.time;
    for timed in actions.iter_mut() {
        if timed.time - anchor <= SAME_INSTANT * anchor.abs().max(1.0) {
            timed.time = anchor;
        } else {
            anchor = timed.time;
        }
    }
}

/// Walks one subject's timeline. Borrowed read-only from the cohort, so a
/// single engine serves every worker.
pub struct Engine<'a> {
    model: &'a ModelDefinition,
    options: &'a SolverOptions,
    deadline: Option<Instant>,
}

impl<'a> Engine<'a> {
    pub fn new(model: &'a ModelDefinition, options: &'a SolverOptions) -> Self {
        Self {
            model,
            options,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    fn expand(&self, events: &[Event]) -> PKResult<(Vec<Timed>, Vec<DoseRecord>)> {
        let n_states = self.model.n_states();
        let n_outputs = self.model.outputs().len();
        let mut actions = Vec::with_capacity(events.len() + 4);
        let mut doses = Vec::new();
        let mut infusion = 0;

        for (i, event) in events.iter().enumerate() {
            match &event.kind {
                EventKind::Dose(dose) => {
                    if dose.compartment >= n_states {
                        return Err(PKError::scheduling(format!(
                            "dose at t={} targets compartment {} but model '{}' has {}",
                            event.time,
                            dose.compartment,
                            self.model.name(),
                            n_states
                        )));
                    }
                    let start = event.time + dose.lag;
                    let amount = dose.amount * dose.bioavailability;
                    doses.push(DoseRecord {
                        time: event.time,
                        effective_time: start,
                        amount,
                        compartment: dose.compartment,
                        duration: dose.duration,
                    });
                    match dose.duration {
                        None => actions.push(Timed {
                            time: start,
                            order: event.order,
                            action: Action::Bolus {
                                compartment: dose.compartment,
                                amount,
                            },
                        }),
                        Some(duration) => {
                            actions.push(Timed {
                                time: start,
                                order: event.order,
                                action: Action::RateOn {
                                    id: infusion,
                                    compartment: dose.compartment,
                                    rate: amount / duration,
                                },
                            });
                            actions.push(Timed {
                                time: start + duration,
                                order: event.order,
                                action: Action::RateOff { id: infusion },
                            });
                            infusion += 1;
                        }
                    }
                }
                EventKind::Observe(obs) => {
                    if let Some(&bad) = obs.outputs.iter().find(|&&o| o >= n_outputs) {
                        return Err(PKError::scheduling(format!(
                            "observation at t={} requests output {} but model '{}' has {}",
                            event.time,
                            bad,
                            self.model.name(),
                            n_outputs
                        )));
                    }
                    actions.push(Timed {
                        time: event.time,
                        order: event.order,
                        action: Action::Observe { event: i },
                    });
                }
            }
        }

        actions.sort_by(|a, b| a.time.total_cmp(&b.time));
        snap_times(&mut actions);
        actions.sort_by(|a, b| {
            a.time
                .total_cmp(&b.time)
                .then(a.action.rank().cmp(&b.action.rank()))
                .then(a.order.cmp(&b.order))
        });
        Ok((actions, doses))
    }

    /// Simulate one subject. Negative amounts are reported, never clamped.
    pub fn run(
        &self,
        subject_id: usize,
        params: &IndividualParameters,
        events: &[Event],
    ) -> PKResult<SubjectRun> {
        let model = self.model;
        let p = params.values();
        let n = model.n_states();
        let (actions, doses) = self.expand(events)?;

        let mut x = model.initial_state(p);
        let mut rates = vec![0.0; n];
        let mut active: Vec<(usize, usize, f64)> = Vec::new();
        let mut integrator = Integrator::new(self.options.clone(), self.deadline);
        let mut warned = vec![false; n];
        let mut lowest: Vec<Option<(f64, f64)>> = vec![None; n];
        let mut run = SubjectRun {
            doses,
            ..SubjectRun::default()
        };
        let mut t = actions.first().map_or(0.0, |a| a.time.min(0.0));

        for timed in &actions {
            if timed.time > t {
                let sys = SubjectSystem {
                    model,
                    params: p,
                    rates: &rates,
                };
                integrator.advance(&sys, &mut x, t, timed.time, |ts, xs| self.track_negative(ts, xs, &mut lowest))?;
                t = timed.time;
                self.track_negative(t, &x, &mut lowest);
                self.flush_anomalies(subject_id, &mut lowest, &mut warned, &mut run.anomalies);
            }

            match timed.action {
                Action::Bolus { compartment, amount } => x[compartment] += amount,
                Action::RateOn { id, compartment, rate } => {
                    active.push((id, compartment, rate));
                    recompute_rates(&active, &mut rates);
                }
                Action::RateOff { id } => {
                    active.retain(|&(a, _, _)| a != id);
                    recompute_rates(&active, &mut rates);
                }
                Action::Observe { event } => {
                    let record = self.observe(subject_id, t, &x, p, requested_outputs(&events[event]))?;
                    run.records.push(record);
                }
            }
        }

        debug!(
            "subject {}: {} accepted, {} rejected steps",
            subject_id,
            integrator.accepted_steps(),
            integrator.rejected_steps()
        );
        Ok(run)
    }

    fn observe(
        &self,
        subject_id: usize,
        time: f64,
        x: &[f64],
        p: &[f64],
        requested: &[usize],
    ) -> PKResult<SimulationRecord> {
        let defs = self.model.outputs();
        let indices: Vec<usize> = if requested.is_empty() {
            (0..defs.len()).collect()
        } else {
            requested.to_vec()
        };

        let mut outputs = Vec::with_capacity(indices.len());
        for idx in indices {
            let def = &defs[idx];
            let value = def.evaluate(x, p);
            if !value.is_finite() {
                return Err(PKError::Observation {
                    time,
                    reason: format!("output {} evaluated to {}", def.name, value),
                });
            }
            // Reporting floor for amount-derived outputs; the state keeps its sign.
            let predicted = if def.nonnegative { value.max(0.0) } else { value };
            outputs.push(OutputValue {
                output: idx,
                name: def.name.clone(),
                predicted,
                observed: None,
                below_lloq: false,
            });
        }

        Ok(SimulationRecord {
            subject_id,
            time,
            state: x.to_vec(),
            outputs,
        })
    }

    /// Keep the most negative value per nonnegative compartment beyond
    /// solver tolerance.
    fn track_negative(&self, time: f64, x: &[f64], lowest: &mut [Option<(f64, f64)>]) {
        let scale = x.iter().fold(0.0f64, |m, v| m.max(v.abs()));
        let tolerance = 10.0 * (self.options.atol + self.options.rtol * scale);
        for (i, cmt) in self.model.compartments().iter().enumerate() {
            if cmt.nonnegative && x[i] < -tolerance && lowest[i].map_or(true, |(_, v)| x[i] < v) {
                lowest[i] = Some((time, x[i]));
            }
        }
    }

    /// One anomaly per compartment and segment; one warning per compartment.
    fn flush_anomalies(
        &self,
        subject_id: usize,
        lowest: &mut [Option<(f64, f64)>],
        warned: &mut [bool],
        anomalies: &mut Vec<StateAnomaly>,
    ) {
        for (i, cmt) in self.model.compartments().iter().enumerate() {
            let Some((time, value)) = lowest[i].take() else { continue };
            if !warned[i] {
                warn!(
                    "subject {}: compartment {} went negative ({:.3e}) at t={}",
                    subject_id, cmt.name, value, time
                );
                warned[i] = true;
            }
            anomalies.push(StateAnomaly {
                time,
                compartment: cmt.name.clone(),
                value,
            });
        }
    }
}

fn recompute_rates(active: &[(usize, usize, f64)], rates: &mut [f64]) {
    rates.iter_mut().for_each(|r| *r = 0.0);
    for &(_, compartment, rate) in active {
        rates[compartment] += rate;
    }
}

fn requested_outputs(event: &Event) -> &[usize] {
    match &event.kind {
        EventKind::Observe(obs) => &obs.outputs,
        EventKind::Dose(_) => &[],
    }
}

/// Simulate one subject with default solver settings.
pub fn run(
    model: &ModelDefinition,
    params: &IndividualParameters,
    events: &[Event],
) -> PKResult<SubjectRun> {
    let options = SolverOptions::default();
    Engine::new(model, &options).run(0, params, events)
}


#[cfg(test)]
mod tests {
    use super::testing::predict;
    use super::*;
    use crate::dosing::{schedule, DosingRegimen};
    use crate::simulation::individual::{individualize, Subject};
    use approx::assert_relative_eq;
    use std::collections::BTreeMap;

    fn iv_model() -> ModelDefinition {
        ModelDefinition::builder("iv")
            .compartment("central")
            .parameter("CL", 2.0)
            .parameter("V", 10.0)
            .diffeq(|_t, x, p, dx| {
                crate::fetch_params!(p, cl, v);
                dx[0] = -cl / v * x[0];
            })
            .output("CP", |x, p| x[0] / p[1])
            .build()
            .unwrap()
    }

    fn typical(model: &ModelDefinition) -> IndividualParameters {
        individualize(model, &Subject::new(1, BTreeMap::new(), vec![])).unwrap()
    }

    #[test]
    fn test_observation_at_dose_time_sees_the_dose() {
        let cp = predict(&iv_model(), vec![DosingRegimen::bolus(100.0, 0)], &[0.0, 5.0], "CP");
        assert_relative_eq!(cp[0], 10.0, epsilon = 1e-12);
        assert_relative_eq!(cp[1], 10.0 * (-1.0f64).exp(), max_relative = 1e-6);
    }

    #[test]
    fn test_repeated_doses_superpose() {
        let regimen = DosingRegimen::bolus(100.0, 0).repeated(12.0, 1);
        let cp = predict(&iv_model(), vec![regimen], &[18.0], "CP");
        let expected = 10.0 * ((-0.2f64 * 18.0).exp() + (-0.2f64 * 6.0).exp());
        assert_relative_eq!(cp[0], expected, max_relative = 1e-6);
    }

    #[test]
    fn test_infusion_matches_closed_form() {
        let (cl, ke, rate, dur) = (2.0, 0.2, 50.0, 2.0);
        let regimen = DosingRegimen::infusion(100.0, 0, dur);
        let cp = predict(&iv_model(), vec![regimen], &[1.0, 2.0, 6.0], "CP");
        let during = |t: f64| rate / cl * (1.0 - (-ke * t).exp());
        assert_relative_eq!(cp[0], during(1.0), max_relative = 1e-6);
        assert_relative_eq!(cp[1], during(2.0), max_relative = 1e-6);
        assert_relative_eq!(cp[2], during(2.0) * (-ke * 4.0f64).exp(), max_relative = 1e-6);
    }

    #[test]
    fn test_lag_delays_entry_but_not_nominal_time() {
        let model = iv_model();
        let regimen = DosingRegimen::bolus(100.0, 0).starting_at(1.0).with_lag(0.5);
        let events = schedule(vec![regimen], vec![1.0, 1.25, 1.5, 2.5], vec![]).unwrap();
        let out = run(&model, &typical(&model), &events).unwrap();
        assert_eq!(out.doses[0].time, 1.0);
        assert_eq!(out.doses[0].effective_time, 1.5);
        let cp: Vec<f64> = out.records.iter().map(|r| r.predicted("CP").unwrap()).collect();
        assert_eq!(cp[0], 0.0);
        assert_eq!(cp[1], 0.0);
        assert_relative_eq!(cp[2], 10.0, epsilon = 1e-12);
        assert_relative_eq!(cp[3], 10.0 * (-0.2f64).exp(), max_relative = 1e-6);
    }

    #[test]
    fn test_bioavailability_scales_amount() {
        let regimen = DosingRegimen::bolus(100.0, 0).with_bioavailability(0.6);
        let cp = predict(&iv_model(), vec![regimen], &[0.0], "CP");
        assert_relative_eq!(cp[0], 6.0, epsilon = 1e-12);
    }

    #[test]
    fn test_negative_state_is_reported_not_clamped() {
        let model = ModelDefinition::builder("leak")
            .compartment("central")
            .parameter("K0", 1.0)
            .diffeq(|_t, _x, p, dx| dx[0] = -p[0])
            .output("A", |x, _p| x[0])
            .build()
            .unwrap();
        let events = schedule(vec![DosingRegimen::bolus(1.0, 0)], vec![0.5, 2.0, 3.0], vec![]).unwrap();
        let out = run(&model, &typical(&model), &events).unwrap();
        assert_eq!(out.anomalies.len(), 2);
        assert_relative_eq!(out.records[1].state[0], -1.0, epsilon = 1e-9);
        assert_eq!(out.records[1].predicted("A"), Some(0.0));
        assert_relative_eq!(out.records[0].predicted("A").unwrap(), 0.5, epsilon = 1e-9);
    }

    #[test]
    fn test_dip_between_events_is_reported() {
        // A(t) = -sin(t): negative on (0, pi), back to zero at pi.
        let model = ModelDefinition::builder("dip")
            .compartment("central")
            .parameter("K", 1.0)
            .diffeq(|t, _x, p, dx| dx[0] = -p[0] * t.cos())
            .output("A", |x, _p| x[0])
            .build()
            .unwrap();
        let events = schedule(vec![], vec![0.0, std::f64::consts::PI], vec![]).unwrap();
        let out = run(&model, &typical(&model), &events).unwrap();
        assert_eq!(out.anomalies.len(), 1);
        let dip = &out.anomalies[0];
        assert!(dip.value < -0.9, "lowest value {}", dip.value);
        assert!(dip.time > 1.0 && dip.time < 2.2, "lowest at t={}", dip.time);
        assert!(out.records[1].state[0].abs() < 1e-6);
    }

    #[test]
    fn test_rounded_dose_times_meet_their_samples() {
        // 3 * 0.1 lands on 0.30000000000000004, not on the 0.3 sample.
        let regimen = DosingRegimen::bolus(100.0, 0).repeated(0.1, 3);
        let cp = predict(&iv_model(), vec![regimen], &[0.3, 1.0], "CP");
        let expected = |t: f64| (0..4).map(|k| 10.0 * (-0.2 * (t - 0.1 * k as f64)).exp()).sum::<f64>();
        assert_relative_eq!(cp[0], expected(0.3), max_relative = 1e-6);
        assert_relative_eq!(cp[1], expected(1.0), max_relative = 1e-6);
    }

    #[test]
    fn test_rounded_lag_meets_its_sample() {
        let regimen = DosingRegimen::bolus(100.0, 0).starting_at(0.1).with_lag(0.2);
        let cp = predict(&iv_model(), vec![regimen], &[0.3, 1.0], "CP");
        assert_relative_eq!(cp[0], 10.0, max_relative = 1e-9);
        assert_relative_eq!(cp[1], 10.0 * (-0.2f64 * 0.7).exp(), max_relative = 1e-6);
    }

    #[test]
    fn test_unknown_compartment_is_a_scheduling_error() {
        let model = iv_model();
        let events = schedule(vec![DosingRegimen::bolus(100.0, 3)], vec![1.0], vec![]).unwrap();
        assert!(matches!(
            run(&model, &typical(&model), &events),
            Err(PKError::Scheduling(_))
        ));
    }

    #[test]
    fn test_expired_deadline_cancels() {
        let model = iv_model();
        let options = SolverOptions::default();
        let events = schedule(vec![DosingRegimen::bolus(100.0, 0)], vec![4.0], vec![]).unwrap();
        let result = Engine::new(&model, &options)
            .with_deadline(Some(Instant::now()))
            .run(1, &typical(&model), &events);
        assert!(matches!(result, Err(PKError::Cancelled { .. })));
    }

    #[test]
    fn test_requested_outputs_only() {
        let model = ModelDefinition::builder("two outputs")
            .compartment("central")
            .parameter("CL", 2.0)
            .parameter("V", 10.0)
            .diffeq(|_t, x, p, dx| dx[0] = -p[0] / p[1] * x[0])
            .output("CP", |x, p| x[0] / p[1])
            .output("AMT", |x, _p| x[0])
            .build()
            .unwrap();
        let events = schedule(vec![DosingRegimen::bolus(100.0, 0)], vec![0.0], vec![1]).unwrap();
        let out = run(&model, &typical(&model), &events).unwrap();
        assert_eq!(out.records[0].outputs.len(), 1);
        assert_eq!(out.records[0].predicted("AMT"), Some(100.0));
        assert_eq!(out.records[0].predicted("CP"), None);
    }
}
