use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Direction of a zero crossing that triggers an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EventDirection {
    /// Condition goes from negative to positive.
    Rising,
    /// Condition goes from positive to negative.
    Falling,
    /// Either direction.
    #[default]
    Either,
}

/// What the integrator does after an event's effect has been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EventAction {
    #[default]
    Continue,
    Stop,
}

pub type ConditionFn = Box<dyn Fn(f64, &[f64]) -> f64 + Send + Sync>;
pub type EffectFn = Box<dyn FnMut(f64, &mut [f64]) -> EventAction + Send>;

pub const DEFAULT_TIME_TOL: f64 = 1e-10;
pub const DEFAULT_MAX_ROOT_ITERS: usize = 100;

/// A state-dependent event: `condition(t, x)` crossing zero in `direction`
/// triggers `effect(t, &mut x)` at the located crossing time.
pub struct Event {
    condition: ConditionFn,
    effect: EffectFn,
    pub direction: EventDirection,
    pub time_tol: f64,
    pub max_root_iters: usize,
}

impl Event {
    pub fn new<C, E>(condition: C, effect: E) -> Self
    where
        C: Fn(f64, &[f64]) -> f64 + Send + Sync + 'static,
        E: FnMut(f64, &mut [f64]) -> EventAction + Send + 'static,
    {
        Self {
            condition: Box::new(condition),
            effect: Box::new(effect),
            direction: EventDirection::Either,
            time_tol: DEFAULT_TIME_TOL,
            max_root_iters: DEFAULT_MAX_ROOT_ITERS,
        }
    }

    /// An event that only records the crossing.
    pub fn observer<C>(condition: C) -> Self
    where
        C: Fn(f64, &[f64]) -> f64 + Send + Sync + 'static,
    {
        Self::new(condition, |_, _| EventAction::Continue)
    }

    /// An event that stops the integration at the crossing.
    pub fn terminal<C>(condition: C) -> Self
    where
        C: Fn(f64, &[f64]) -> f64 + Send + Sync + 'static,
    {
        Self::new(condition, |_, _| EventAction::Stop)
    }

    pub fn with_direction(mut self, direction: EventDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_time_tolerance(mut self, time_tol: f64) -> Self {
        self.time_tol = time_tol;
        self
    }

    pub fn with_max_root_iters(mut self, max_root_iters: usize) -> Self {
        self.max_root_iters = max_root_iters;
        self
    }

    pub fn condition(&self, t: f64, state: &[f64]) -> f64 {
        (self.condition)(t, state)
    }

    pub fn apply(&mut self, t: f64, state: &mut [f64]) -> EventAction {
        (self.effect)(t, state)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("direction", &self.direction)
            .field("time_tol", &self.time_tol)
            .field("max_root_iters", &self.max_root_iters)
            .finish_non_exhaustive()
    }
}

/// Whether the condition changed sign across a step in the given direction.
///
/// A condition that is exactly zero at the start of the step never counts,
/// so an event located on the previous step does not fire twice.
pub fn crossing_detected(g_old: f64, g_new: f64, direction: EventDirection) -> bool {
    if g_old == 0.0 || !g_old.is_finite() || !g_new.is_finite() {
        return false;
    }
    let rising = g_old < 0.0 && g_new >= 0.0;
    let falling = g_old > 0.0 && g_new <= 0.0;
    match direction {
        EventDirection::Rising => rising,
        EventDirection::Falling => falling,
        EventDirection::Either => rising || falling,
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RootError {
    #[error("root not bracketed: f({lower}) = {f_lower}, f({upper}) = {f_upper}")]
    NotBracketed {
        lower: f64,
        upper: f64,
        f_lower: f64,
        f_upper: f64,
    },
    #[error("root finding did not converge in {iterations} iterations (bracket width {width:e})")]
    NoConvergence { iterations: usize, width: f64 },
    #[error("condition returned a non-finite value at t = {t}")]
    NonFinite { t: f64 },
}

/// Brent's method on `[lower, upper]` with `f(lower)` and `f(upper)` of
/// opposite sign (or one of them zero).
///
/// The returned abscissa lies within `tol` of the root and on the `upper`
/// side of it: `f` there is zero or has the sign of `f(upper)`.
pub fn locate_root<F>(
    mut f: F,
    lower: f64,
    upper: f64,
    f_lower: f64,
    f_upper: f64,
    tol: f64,
    max_iters: usize,
) -> Result<f64, RootError>
where
    F: FnMut(f64) -> f64,
{
    if f_upper == 0.0 {
        return Ok(upper);
    }
    if f_lower * f_upper > 0.0 {
        return Err(RootError::NotBracketed {
            lower,
            upper,
            f_lower,
            f_upper,
        });
    }
    let upper_sign = f_upper.signum();

    let (mut a, mut b) = (lower, upper);
    let (mut fa, mut fb) = (f_lower, f_upper);
    let (mut c, mut fc) = (b, fb);
    let mut d = b - a;
    let mut e = d;

    for _ in 0..max_iters {
        if (fb > 0.0 && fc > 0.0) || (fb < 0.0 && fc < 0.0) {
            c = a;
            fc = fa;
            d = b - a;
            e = d;
        }
        if fc.abs() < fb.abs() {
            a = b;
            b = c;
            c = a;
            fa = fb;
            fb = fc;
            fc = fa;
        }

        let tol1 = 2.0 * f64::EPSILON * b.abs() + 0.5 * tol;
        let xm = 0.5 * (c - b);
        if fb == 0.0 {
            return Ok(b);
        }
        if xm.abs() <= tol1 {
            // b and c bracket the root; report the endpoint past it.
            return Ok(if fb.signum() == upper_sign { b } else { c });
        }

        if e.abs() >= tol1 && fa.abs() > fb.abs() {
            let s = fb / fa;
            let (mut p, mut q) = if a == c {
                (2.0 * xm * s, 1.0 - s)
            } else {
                let q = fa / fc;
                let r = fb / fc;
                (
                    s * (2.0 * xm * q * (q - r) - (b - a) * (r - 1.0)),
                    (q - 1.0) * (r - 1.0) * (s - 1.0),
                )
            };
            if p > 0.0 {
                q = -q;
            }
            p = p.abs();
            let bound = (3.0 * xm * q - (tol1 * q).abs()).min((e * q).abs());
            if 2.0 * p < bound {
                e = d;
                d = p / q;
            } else {
                d = xm;
                e = d;
            }
        } else {
            d = xm;
            e = d;
        }

        a = b;
        fa = fb;
        b += if d.abs() > tol1 { d } else { tol1.copysign(xm) };
        fb = f(b);
        if !fb.is_finite() {
            return Err(RootError::NonFinite { t: b });
        }
    }

    Err(RootError::NoConvergence {
        iterations: max_iters,
        width: (c - b).abs(),
    })
}

/// An event occurrence recorded in a trajectory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_index: usize,
    pub time: f64,
    pub state_before: Vec<f64>,
    pub state_after: Vec<f64>,
}
