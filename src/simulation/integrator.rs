//! Segment integration between events, on top of `ode_solvers`.
//!
//! - [`IntegrationMethod::Dopri45`]: adaptive Dormand–Prince 5(4), the
//!   default for PK/PD systems.
//! - [`IntegrationMethod::Rk4`]: classic fixed-step RK4, for reference runs.
//!
//! Neither touches the sign of the state.

use crate::error::{PKError, PKResult};
use ode_solvers::dop_shared::IntegrationError;
use ode_solvers::{DVector, Dopri5, Rk4, System};
use serde::{Deserialize, Serialize};
use std::time::Instant;

pub type State = DVector<f64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrationMethod {
    #[default]
    Dopri45,
    Rk4,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverOptions {
    pub method: IntegrationMethod,
    pub rtol: f64,
    pub atol: f64,
    /// Step length for [`IntegrationMethod::Rk4`].
    pub step: f64,
    /// Segments shorter than this, relative to `max(1, |t|)`, are skipped.
    pub h_min: f64,
    /// Accepted steps allowed per integration segment.
    pub max_steps: usize,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            method: IntegrationMethod::Dopri45,
            rtol: 1e-8,
            atol: 1e-10,
            step: 0.01,
            h_min: 1e-12,
            max_steps: 100_000,
        }
    }
}

impl SolverOptions {
    pub fn validate(&self) -> PKResult<()> {
        if !(self.rtol.is_finite() && self.rtol > 0.0) {
            return Err(PKError::config("rtol must be finite and > 0"));
        }
        if !(self.atol.is_finite() && self.atol > 0.0) {
            return Err(PKError::config("atol must be finite and > 0"));
        }
        if !(self.step.is_finite() && self.step > 0.0) {
            return Err(PKError::config("rk4 step must be finite and > 0"));
        }
        if !(self.h_min.is_finite() && self.h_min > 0.0) {
            return Err(PKError::config("h_min must be finite and > 0"));
        }
        if self.max_steps == 0 {
            return Err(PKError::config("max_steps must be > 0"));
        }
        Ok(())
    }

    /// Smallest span worth integrating at time `t`.
    pub fn min_span(&self, t: f64) -> f64 {
        self.h_min * t.abs().max(1.0)
    }
}

const DEADLINE_CHECK_EVERY: usize = 32;

fn deadline_passed(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

fn integration_error(error: IntegrationError) -> PKError {
    match error {
        IntegrationError::StepSizeUnderflow { x } => PKError::Integration {
            time: x,
            reason: "step size underflow".to_string(),
        },
        IntegrationError::MaxNumStepReached { x, n_step } => PKError::Integration {
            time: x,
            reason: format!("solver gave up after {} steps", n_step),
        },
        IntegrationError::StiffnessDetected { x } => PKError::Integration {
            time: x,
            reason: "stiffness detected".to_string(),
        },
    }
}

/// Per-segment bookkeeping fed by the solver's step callback.
struct Watch<'w> {
    deadline: Option<Instant>,
    max_steps: usize,
    steps: usize,
    stop: Option<PKError>,
    last: Option<(f64, State)>,
    on_step: &'w mut dyn FnMut(f64, &[f64]),
}

impl Watch<'_> {
    /// Returns `true` to stop the solver.
    fn accept(&mut self, t: f64, y: &State) -> bool {
        self.steps += 1;
        (self.on_step)(t, y.as_slice());
        self.last = Some((t, y.clone()));
        if self.steps >= self.max_steps {
            self.stop = Some(PKError::Integration {
                time: t,
                reason: format!("exceeded {} steps", self.max_steps),
            });
            return true;
        }
        if self.steps % DEADLINE_CHECK_EVERY == 0 && deadline_passed(self.deadline) {
            self.stop = Some(PKError::Cancelled { time: t });
            return true;
        }
        false
    }
}

struct Segment<'s, 'w, S> {
    system: &'s S,
    watch: &'s mut Watch<'w>,
}

impl<S: System<f64, State>> System<f64, State> for Segment<'_, '_, S> {
    fn system(&self, t: f64, y: &State, dy: &mut State) {
        self.system.system(t, y, dy);
    }

    fn solout(&mut self, t: f64, y: &State, _dy: &State) -> bool {
        self.watch.accept(t, y)
    }
}

/// Runs one subject's segments and keeps step statistics.
pub struct Integrator {
    options: SolverOptions,
    deadline: Option<Instant>,
    accepted: usize,
    rejected: usize,
}

impl Integrator {
    pub fn new(options: SolverOptions, deadline: Option<Instant>) -> Self {
        Self {
            options,
            deadline,
            accepted: 0,
            rejected: 0,
        }
    }

    pub fn accepted_steps(&self) -> usize {
        self.accepted
    }

    pub fn rejected_steps(&self) -> usize {
        self.rejected
    }

    /// Integrate `y` from `t0` to `t1` in place, calling `on_step` with the
    /// state after every accepted step.
    pub fn advance<S, F>(&mut self, system: &S, y: &mut [f64], t0: f64, t1: f64, mut on_step: F) -> PKResult<()>
    where
        S: System<f64, State>,
        F: FnMut(f64, &[f64]),
    {
        if t1 < t0 {
            return Err(PKError::Integration {
                time: t0,
                reason: format!("cannot integrate backwards to t={}", t1),
            });
        }
        // Event times that differ only by rounding leave nothing to integrate.
        if t1 - t0 <= self.options.min_span(t0) {
            return Ok(());
        }
        if deadline_passed(self.deadline) {
            return Err(PKError::Cancelled { time: t0 });
        }

        let mut watch = Watch {
            deadline: self.deadline,
            max_steps: self.options.max_steps,
            steps: 0,
            stop: None,
            last: None,
            on_step: &mut on_step,
        };
        let start = State::from_column_slice(y);
        let end = match self.options.method {
            IntegrationMethod::Dopri45 => self.dopri45(system, &mut watch, start, t0, t1)?,
            IntegrationMethod::Rk4 => self.rk4(system, &mut watch, start, t0, t1)?,
        };
        if let Some(stop) = watch.stop {
            return Err(stop);
        }
        let end = end.ok_or_else(|| PKError::Integration {
            time: t0,
            reason: "solver returned no state".to_string(),
        })?;

        if let Some(i) = end.iter().position(|v| !v.is_finite()) {
            return Err(PKError::Integration {
                time: t1,
                reason: format!("state {} became non-finite", i),
            });
        }
        y.copy_from_slice(end.as_slice());
        Ok(())
    }

    fn dopri45<S: System<f64, State>>(
        &mut self,
        system: &S,
        watch: &mut Watch<'_>,
        start: State,
        t0: f64,
        t1: f64,
    ) -> PKResult<Option<State>> {
        let (rtol, atol) = (self.options.rtol, self.options.atol);
        // One dense output interval per segment: only the endpoint is kept.
        let span = t1 - t0;
        let fallback = {
            let segment = Segment { system, watch: &mut *watch };
            let mut stepper = Dopri5::new(segment, t0, t1, span, start, rtol, atol);
            let stats = stepper.integrate().map_err(integration_error)?;
            self.accepted += stats.accepted_steps as usize;
            self.rejected += stats.rejected_steps as usize;
            stepper.y_out().last().cloned()
        };
        Ok(match watch.last.take() {
            Some((t, y)) if (t - t1).abs() <= self.options.min_span(t1) => Some(y),
            _ => fallback,
        })
    }

    fn rk4<S: System<f64, State>>(
        &mut self,
        system: &S,
        watch: &mut Watch<'_>,
        start: State,
        t0: f64,
        t1: f64,
    ) -> PKResult<Option<State>> {
        let span = t1 - t0;
        let h = span / (span / self.options.step).ceil().max(1.0);
        let points: Vec<(f64, State)> = {
            let segment = Segment { system, watch: &mut *watch };
            let mut stepper = Rk4::new(segment, t0, start, t1, h);
            stepper.integrate().map_err(integration_error)?;
            stepper.x_out().iter().copied().zip(stepper.y_out().iter().cloned()).collect()
        };

        // The fixed-step grid can carry one step past t1 through rounding.
        let limit = t1 + self.options.min_span(t1);
        let mut end = None;
        for (t, y) in points.into_iter().skip(1).take_while(|(t, _)| *t <= limit) {
            self.accepted += 1;
            let stop = watch.accept(t, &y);
            end = Some(y);
            if stop {
                break;
            }
        }
        Ok(end)
    }
}
