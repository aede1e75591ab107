pub mod config;
pub mod continuation;
pub mod events;
pub mod integrator;
pub mod lyapunov;
pub mod solvers;
pub mod sweep;
pub mod systems;
/// The `attractor_core` crate is the numerical engine behind Attractor.
///
/// Key components:
/// - **Traits**: `DynamicalSystem` (vector field plus optional Jacobian).
/// - **Integrator**: adaptive Tsit5 with dense output and event location.
/// - **Lyapunov**: variational propagation, QR renormalization, Kaplan-Yorke dimension.
/// - **Sweep**: parallel parameter grids on a rayon pool.
/// - **Continuation**: pseudo-arclength tracking of equilibria and collocated limit cycles.
pub mod traits;
