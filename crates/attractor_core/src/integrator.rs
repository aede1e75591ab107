use crate::events::{crossing_detected, locate_root, Event, EventAction, EventRecord, RootError};
use crate::solvers::{DenseStep, StepController, Tsit5};
use crate::traits::DynamicalSystem;
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Adaptive-step solver settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub abs_tol: f64,
    pub rel_tol: f64,
    /// Budget of step attempts (accepted and rejected) per run.
    pub max_iters: usize,
    pub step_min: f64,
    pub step_max: f64,
    pub initial_step: f64,
    pub safety: f64,
    pub max_growth: f64,
    pub min_shrink: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            abs_tol: 1e-9,
            rel_tol: 1e-9,
            max_iters: 1_000_000,
            step_min: 1e-12,
            step_max: 1.0,
            initial_step: 1e-3,
            safety: 0.9,
            max_growth: 5.0,
            min_shrink: 0.2,
        }
    }
}

impl SolverConfig {
    pub fn validate(&self) -> Result<(), IntegrationError> {
        let invalid = |reason: String| Err(IntegrationError::InvalidConfig(reason));
        if !(self.abs_tol > 0.0) || !(self.rel_tol > 0.0) {
            return invalid(format!(
                "tolerances must be positive (abs_tol = {}, rel_tol = {})",
                self.abs_tol, self.rel_tol
            ));
        }
        if !(self.step_min > 0.0) || !(self.step_min <= self.step_max) {
            return invalid(format!(
                "step bounds must satisfy 0 < step_min <= step_max (got {} and {})",
                self.step_min, self.step_max
            ));
        }
        if !(self.initial_step > 0.0) || !self.initial_step.is_finite() {
            return invalid(format!("initial_step must be positive, got {}", self.initial_step));
        }
        if self.max_iters == 0 {
            return invalid("max_iters must be positive".to_string());
        }
        if !(self.safety > 0.0 && self.safety < 1.0) {
            return invalid(format!("safety must lie in (0, 1), got {}", self.safety));
        }
        if !(self.max_growth > 1.0) {
            return invalid(format!("max_growth must exceed 1, got {}", self.max_growth));
        }
        if !(self.min_shrink > 0.0 && self.min_shrink < 1.0) {
            return invalid(format!("min_shrink must lie in (0, 1), got {}", self.min_shrink));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum IntegrationError {
    #[error("invalid solver configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("exceeded {max_iters} step attempts at t = {t}")]
    MaxIterations { t: f64, max_iters: usize },

    #[error("step size underflow at t = {t}: step {step:e} still fails the error test")]
    StepUnderflow { t: f64, step: f64 },

    #[error("non-finite state reached at t = {t}")]
    NonFiniteState { t: f64 },

    #[error("event {event_index} could not be localized after t = {t}: {source}")]
    EventLocalization {
        t: f64,
        event_index: usize,
        #[source]
        source: RootError,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub accepted_steps: u64,
    pub rejected_steps: u64,
    pub derivative_evals: u64,
    pub events_fired: u64,
}

impl Stats {
    fn absorb(&mut self, other: &Stats) {
        self.accepted_steps += other.accepted_steps;
        self.rejected_steps += other.rejected_steps;
        self.derivative_evals += other.derivative_evals;
        self.events_fired += other.events_fired;
    }
}

/// Time-ordered samples of one integration run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub times: Vec<f64>,
    pub states: Vec<Vec<f64>>,
    pub events: Vec<EventRecord>,
    pub stats: Stats,
    /// Set when an event effect returned `EventAction::Stop`.
    pub stopped_by_event: bool,
}

impl Trajectory {
    pub(crate) fn push(&mut self, t: f64, state: &[f64]) {
        self.times.push(t);
        self.states.push(state.to_vec());
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn samples(&self) -> impl Iterator<Item = (f64, &[f64])> + '_ {
        self.times
            .iter()
            .copied()
            .zip(self.states.iter().map(|s| s.as_slice()))
    }

    pub fn final_time(&self) -> Option<f64> {
        self.times.last().copied()
    }

    pub fn final_state(&self) -> Option<&[f64]> {
        self.states.last().map(|s| s.as_slice())
    }
}

/// Adaptive Tsit5 integrator with event location.
///
/// The integrator remembers the last accepted step size so repeated
/// `advance` calls over short intervals do not restart from `initial_step`.
pub struct Integrator {
    config: SolverConfig,
    controller: StepController,
    stepper: Option<Tsit5>,
    error_components: Option<usize>,
    next_step: Option<f64>,
    stats: Stats,
}

impl Integrator {
    pub fn new(config: SolverConfig) -> Result<Self, IntegrationError> {
        config.validate()?;
        Ok(Self {
            controller: StepController::new(config.safety, config.max_growth, config.min_shrink),
            config,
            stepper: None,
            error_components: None,
            next_step: None,
            stats: Stats::default(),
        })
    }

    /// Restricts error control to the first `components` state entries.
    pub fn with_error_components(mut self, components: usize) -> Self {
        self.error_components = Some(components);
        self
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Counters accumulated over every run of this integrator.
    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Integrates over `span = (t0, t1)`, recording every accepted step and
    /// every event occurrence.
    pub fn integrate<S: DynamicalSystem + ?Sized>(
        &mut self,
        system: &S,
        params: &[f64],
        initial_state: &[f64],
        span: (f64, f64),
        events: &mut [Event],
    ) -> Result<Trajectory, IntegrationError> {
        let (t0, t1) = span;
        let mut t = t0;
        let mut state = initial_state.to_vec();
        let mut trajectory = Trajectory::default();
        trajectory.push(t0, initial_state);

        let stats = self.run(
            system,
            params,
            &mut t,
            &mut state,
            t1,
            events,
            Some(&mut trajectory),
        )?;
        trajectory.stats = stats;
        Ok(trajectory)
    }

    /// Advances `state` in place from `*t` to `t_end` without recording.
    pub fn advance<S: DynamicalSystem + ?Sized>(
        &mut self,
        system: &S,
        params: &[f64],
        t: &mut f64,
        state: &mut [f64],
        t_end: f64,
    ) -> Result<Stats, IntegrationError> {
        self.run(system, params, t, state, t_end, &mut [], None)
    }

    fn validate_inputs<S: DynamicalSystem + ?Sized>(
        &self,
        system: &S,
        t: f64,
        state: &[f64],
        t_end: f64,
    ) -> Result<(), IntegrationError> {
        if state.len() != system.dimension() {
            return Err(IntegrationError::InvalidInput(format!(
                "state has length {} but the system dimension is {}",
                state.len(),
                system.dimension()
            )));
        }
        if !t.is_finite() || !t_end.is_finite() {
            return Err(IntegrationError::InvalidInput(
                "time span must be finite".to_string(),
            ));
        }
        if t_end < t {
            return Err(IntegrationError::InvalidInput(format!(
                "time span must run forward (t0 = {t}, t1 = {t_end})"
            )));
        }
        if state.iter().any(|v| !v.is_finite()) {
            return Err(IntegrationError::InvalidInput(
                "initial state contains non-finite values".to_string(),
            ));
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn run<S: DynamicalSystem + ?Sized>(
        &mut self,
        system: &S,
        params: &[f64],
        t: &mut f64,
        state: &mut [f64],
        t_end: f64,
        events: &mut [Event],
        mut record: Option<&mut Trajectory>,
    ) -> Result<Stats, IntegrationError> {
        self.validate_inputs(system, *t, state, t_end)?;

        let dim = state.len();
        let mut stepper = match self.stepper.take() {
            Some(stepper) if stepper.dimension() == dim => stepper,
            _ => Tsit5::new(dim),
        };
        stepper.invalidate();

        let result = self.drive(
            &mut stepper,
            system,
            params,
            t,
            state,
            t_end,
            events,
            &mut record,
        );
        self.stepper = Some(stepper);

        let (stats, stopped) = result?;
        self.stats.absorb(&stats);
        if let Some(trajectory) = record {
            trajectory.stopped_by_event = stopped;
        }
        Ok(stats)
    }

    #[allow(clippy::too_many_arguments)]
    fn drive<S: DynamicalSystem + ?Sized>(
        &mut self,
        stepper: &mut Tsit5,
        system: &S,
        params: &[f64],
        t: &mut f64,
        state: &mut [f64],
        t_end: f64,
        events: &mut [Event],
        record: &mut Option<&mut Trajectory>,
    ) -> Result<(Stats, bool), IntegrationError> {
        let config = self.config;
        let components = self.error_components.unwrap_or(state.len());
        let mut stats = Stats::default();
        let mut attempts = 0usize;
        let mut h = self
            .next_step
            .unwrap_or(config.initial_step)
            .clamp(config.step_min, config.step_max);
        let mut g_prev: Vec<f64> = events.iter().map(|e| e.condition(*t, state)).collect();
        let end_tol = 4.0 * f64::EPSILON * t_end.abs().max(1.0);

        while *t < t_end {
            let remaining = t_end - *t;
            let last_step = h >= remaining - end_tol;
            let dt = if last_step { remaining } else { h };

            attempts += 1;
            if attempts > config.max_iters {
                return Err(IntegrationError::MaxIterations {
                    t: *t,
                    max_iters: config.max_iters,
                });
            }

            stats.derivative_evals += stepper.attempt(system, params, *t, state, dt);
            let error = stepper.error_norm(state, config.abs_tol, config.rel_tol, components);
            let proposal_finite = stepper.proposal().iter().all(|v| v.is_finite());

            if !(error <= 1.0) || !proposal_finite {
                stats.rejected_steps += 1;
                if dt <= config.step_min {
                    return Err(if proposal_finite {
                        IntegrationError::StepUnderflow { t: *t, step: dt }
                    } else {
                        IntegrationError::NonFiniteState { t: *t }
                    });
                }
                h = (dt * self.controller.shrink(error)).clamp(config.step_min, config.step_max);
                continue;
            }

            let t_new = if last_step { t_end } else { *t + dt };

            if !events.is_empty() {
                let dense = DenseStep::new(
                    *t,
                    state,
                    stepper.start_derivative(),
                    t_new,
                    stepper.proposal(),
                    stepper.end_derivative(),
                );
                let g_new: Vec<f64> = events
                    .iter()
                    .map(|e| e.condition(t_new, stepper.proposal()))
                    .collect();

                if let Some((t_event, fired)) =
                    locate_first_event(events, &dense, &g_prev, &g_new, *t)?
                {
                    let mut event_state = dense.state_at(t_event);
                    if let Some(trajectory) = record.as_deref_mut() {
                        trajectory.push(t_event, &event_state);
                    }
                    let mut stop = false;
                    for index in fired {
                        let before = event_state.clone();
                        let action = events[index].apply(t_event, &mut event_state);
                        stop |= action == EventAction::Stop;
                        stats.events_fired += 1;
                        debug!("event {index} fired at t = {t_event}");
                        if let Some(trajectory) = record.as_deref_mut() {
                            trajectory.events.push(EventRecord {
                                event_index: index,
                                time: t_event,
                                state_before: before,
                                state_after: event_state.clone(),
                            });
                        }
                    }
                    if event_state.iter().any(|v| !v.is_finite()) {
                        return Err(IntegrationError::NonFiniteState { t: t_event });
                    }
                    if let Some(trajectory) = record.as_deref_mut() {
                        trajectory.push(t_event, &event_state);
                    }

                    stats.accepted_steps += 1;
                    *t = t_event;
                    state.copy_from_slice(&event_state);
                    stepper.invalidate();
                    for (g, event) in g_prev.iter_mut().zip(events.iter()) {
                        *g = event.condition(*t, state);
                    }
                    self.next_step = Some(h);
                    if stop {
                        return Ok((stats, true));
                    }
                    continue;
                }
                g_prev = g_new;
            }

            stats.accepted_steps += 1;
            *t = t_new;
            state.copy_from_slice(stepper.proposal());
            stepper.accept();
            if let Some(trajectory) = record.as_deref_mut() {
                trajectory.push(*t, state);
            }

            let proposed = (dt * self.controller.growth(error)).min(config.step_max);
            // A step shortened to hit t_end says nothing about the natural step size.
            h = if last_step && dt < h { h.max(proposed) } else { proposed };
        }

        self.next_step = Some(h);
        Ok((stats, false))
    }
}

/// Finds the earliest crossing inside the step. Returns its time and the
/// indices (ascending) of every event whose crossing falls within its own
/// tolerance of that time.
fn locate_first_event(
    events: &[Event],
    dense: &DenseStep,
    g_prev: &[f64],
    g_new: &[f64],
    t_start: f64,
) -> Result<Option<(f64, Vec<usize>)>, IntegrationError> {
    let mut roots = Vec::new();
    for (index, event) in events.iter().enumerate() {
        if !crossing_detected(g_prev[index], g_new[index], event.direction) {
            continue;
        }
        let mut scratch = vec![0.0; dense.dimension()];
        let root = locate_root(
            |tau| {
                dense.evaluate(tau, &mut scratch);
                event.condition(tau, &scratch)
            },
            dense.t0,
            dense.t1,
            g_prev[index],
            g_new[index],
            event.time_tol,
            event.max_root_iters,
        )
        .map_err(|source| IntegrationError::EventLocalization {
            t: t_start,
            event_index: index,
            source,
        })?;
        roots.push((index, root));
    }

    let Some(earliest) = roots.iter().map(|&(_, r)| r).reduce(f64::min) else {
        return Ok(None);
    };
    let fired = roots
        .iter()
        .filter(|&&(index, root)| root <= earliest + events[index].time_tol)
        .map(|&(index, _)| index)
        .collect();
    Ok(Some((earliest, fired)))
}

/// One-shot integration with a fresh integrator.
pub fn integrate<S: DynamicalSystem + ?Sized>(
    system: &S,
    params: &[f64],
    initial_state: &[f64],
    span: (f64, f64),
    config: &SolverConfig,
    events: &mut [Event],
) -> Result<Trajectory, IntegrationError> {
    Integrator::new(*config)?.integrate(system, params, initial_state, span, events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventDirection;
    use crate::systems::{FnSystem, IntegrateAndFire};
    use approx::assert_relative_eq;

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T, IntegrationError>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = err.to_string();
        assert!(
            message.contains(needle),
            "expected error containing '{needle}', got '{message}'"
        );
    }

    fn constant(_t: f64, _x: &[f64], _p: &[f64], out: &mut [f64]) {
        out.fill(0.0);
    }

    fn decay(_t: f64, x: &[f64], p: &[f64], out: &mut [f64]) {
        out[0] = -p[0] * x[0];
    }

    fn harmonic(_t: f64, x: &[f64], _p: &[f64], out: &mut [f64]) {
        out[0] = x[1];
        out[1] = -x[0];
    }

    fn blow_up(_t: f64, x: &[f64], _p: &[f64], out: &mut [f64]) {
        out[0] = x[0] * x[0];
    }

    #[test]
    fn constant_system_keeps_initial_state() {
        let system = FnSystem::new(3, constant);
        let initial = [1.5, -2.0, 0.25];
        let trajectory =
            integrate(&system, &[], &initial, (0.0, 10.0), &SolverConfig::default(), &mut [])
                .unwrap();
        assert!(trajectory.len() > 1);
        for (_, state) in trajectory.samples() {
            assert_eq!(state, &initial);
        }
        assert_eq!(trajectory.final_time(), Some(10.0));
    }

    #[test]
    fn exponential_decay_meets_tolerance() {
        let system = FnSystem::new(1, decay);
        let config = SolverConfig {
            abs_tol: 1e-10,
            rel_tol: 1e-10,
            ..SolverConfig::default()
        };
        let trajectory = integrate(&system, &[0.5], &[2.0], (0.0, 4.0), &config, &mut []).unwrap();
        let expected = 2.0 * (-2.0f64).exp();
        assert_relative_eq!(trajectory.final_state().unwrap()[0], expected, epsilon = 1e-8);
        for window in trajectory.times.windows(2) {
            assert!(window[1] > window[0]);
        }
        assert!(trajectory.stats.accepted_steps > 0);
    }

    #[test]
    fn advance_reaches_target_in_pieces() {
        let system = FnSystem::new(2, harmonic);
        let mut integrator = Integrator::new(SolverConfig {
            abs_tol: 1e-11,
            rel_tol: 1e-11,
            ..SolverConfig::default()
        })
        .unwrap();
        let mut t = 0.0;
        let mut state = vec![1.0, 0.0];
        for k in 1..=10 {
            integrator
                .advance(&system, &[], &mut t, &mut state, 0.1 * k as f64 * std::f64::consts::PI)
                .unwrap();
        }
        assert_relative_eq!(t, std::f64::consts::PI, epsilon = 1e-12);
        assert_relative_eq!(state[0], -1.0, epsilon = 1e-8);
        assert!(state[1].abs() < 1e-8);
        assert!(integrator.stats().accepted_steps >= 10);
    }

    #[test]
    fn integrate_and_fire_spikes_with_analytic_period() {
        let neuron = IntegrateAndFire::default();
        let current = [2.0];
        let period = neuron.analytic_period(current[0]).unwrap();
        let mut events = vec![neuron.spike_event()];
        let config = SolverConfig {
            abs_tol: 1e-10,
            rel_tol: 1e-10,
            step_max: 0.05,
            ..SolverConfig::default()
        };
        let trajectory = integrate(
            &neuron,
            &current,
            &[neuron.v_rest],
            (0.0, 5.5 * period),
            &config,
            &mut events,
        )
        .unwrap();

        assert_eq!(trajectory.events.len(), 5);
        for (k, record) in trajectory.events.iter().enumerate() {
            assert_relative_eq!(record.time, (k + 1) as f64 * period, epsilon = 1e-7);
            assert_relative_eq!(record.state_before[0], neuron.v_threshold, epsilon = 1e-7);
            assert_eq!(record.state_after[0], neuron.v_rest);
        }
        // Pre- and post-effect samples share the event time.
        let first = trajectory.events[0].time;
        let at_event: Vec<_> = trajectory.samples().filter(|(t, _)| *t == first).collect();
        assert_eq!(at_event.len(), 2);
        assert_eq!(at_event[1].1[0], neuron.v_rest);
        assert!(trajectory.states.iter().all(|s| s[0] <= neuron.v_threshold + 1e-7));
    }

    #[test]
    fn terminal_event_stops_integration() {
        let system = FnSystem::new(2, harmonic);
        let mut events =
            vec![Event::terminal(|_, x: &[f64]| x[0]).with_direction(EventDirection::Falling)];
        let trajectory = integrate(
            &system,
            &[],
            &[1.0, 0.0],
            (0.0, 10.0),
            &SolverConfig::default(),
            &mut events,
        )
        .unwrap();
        assert!(trajectory.stopped_by_event);
        assert_relative_eq!(
            trajectory.final_time().unwrap(),
            std::f64::consts::FRAC_PI_2,
            epsilon = 1e-5
        );
    }

    #[test]
    fn simultaneous_events_apply_in_order() {
        let system = FnSystem::new(2, harmonic);
        let mut events = vec![
            Event::new(|_, x: &[f64]| x[0], |_, x: &mut [f64]| {
                x[1] *= 2.0;
                EventAction::Continue
            })
            .with_direction(EventDirection::Falling),
            Event::new(|_, x: &[f64]| x[0], |_, x: &mut [f64]| {
                x[1] += 1.0;
                EventAction::Stop
            })
            .with_direction(EventDirection::Falling),
        ];
        let trajectory = integrate(
            &system,
            &[],
            &[1.0, 0.0],
            (0.0, 3.0),
            &SolverConfig::default(),
            &mut events,
        )
        .unwrap();
        assert_eq!(trajectory.events.len(), 2);
        assert_eq!(trajectory.events[0].event_index, 0);
        assert_eq!(trajectory.events[1].event_index, 1);
        // y = -1 at the crossing: doubled, then shifted.
        assert_relative_eq!(trajectory.final_state().unwrap()[1], -1.0, epsilon = 1e-5);
    }

    #[test]
    fn iteration_budget_is_enforced() {
        let system = FnSystem::new(1, decay);
        let config = SolverConfig {
            max_iters: 3,
            step_max: 0.01,
            ..SolverConfig::default()
        };
        assert_err_contains(
            integrate(&system, &[1.0], &[1.0], (0.0, 1.0), &config, &mut []),
            "exceeded 3 step attempts",
        );
    }

    #[test]
    fn finite_time_blow_up_underflows_step() {
        let system = FnSystem::new(1, blow_up);
        let config = SolverConfig {
            step_min: 1e-2,
            step_max: 0.1,
            initial_step: 1e-2,
            ..SolverConfig::default()
        };
        let err = integrate(&system, &[], &[1.0], (0.0, 2.0), &config, &mut []).unwrap_err();
        match err {
            IntegrationError::StepUnderflow { t, step } => {
                assert!(t > 0.0 && t < 1.0, "t = {t}");
                assert!(step <= config.step_min);
            }
            other => panic!("expected step underflow, got {other:?}"),
        }
    }

    #[test]
    fn unlocalized_event_halts_at_step_start() {
        let system = FnSystem::new(2, harmonic);
        let mut events = vec![Event::observer(|_, x: &[f64]| x[0])
            .with_direction(EventDirection::Falling)
            .with_time_tolerance(1e-14)
            .with_max_root_iters(1)];
        let config = SolverConfig {
            step_max: 0.25,
            ..SolverConfig::default()
        };
        let err = integrate(&system, &[], &[1.0, 0.0], (0.0, 3.0), &config, &mut events)
            .unwrap_err();
        match err {
            IntegrationError::EventLocalization {
                t,
                event_index,
                source,
            } => {
                let crossing = std::f64::consts::FRAC_PI_2;
                assert_eq!(event_index, 0);
                assert!(t < crossing && t >= crossing - config.step_max, "t = {t}");
                assert!(matches!(
                    source,
                    RootError::NoConvergence { iterations: 1, .. }
                ));
            }
            other => panic!("expected event localization failure, got {other:?}"),
        }
    }

    #[test]
    fn rejects_invalid_configuration_and_input() {
        let bad = SolverConfig {
            abs_tol: 0.0,
            ..SolverConfig::default()
        };
        assert_err_contains(Integrator::new(bad).map(|_| ()), "tolerances must be positive");

        let bad_steps = SolverConfig {
            step_min: 1.0,
            step_max: 0.1,
            ..SolverConfig::default()
        };
        assert_err_contains(Integrator::new(bad_steps).map(|_| ()), "step bounds");

        let system = FnSystem::new(1, decay);
        assert_err_contains(
            integrate(&system, &[1.0], &[1.0], (1.0, 0.0), &SolverConfig::default(), &mut []),
            "must run forward",
        );
        assert_err_contains(
            integrate(&system, &[1.0], &[1.0, 2.0], (0.0, 1.0), &SolverConfig::default(), &mut []),
            "system dimension",
        );
    }
}
