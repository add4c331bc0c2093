//! Population PK/PD simulation: virtual subjects, individualized parameters,
//! event-driven ODE integration and residual error, producing noiseless
//! predictions next to noisy observations.

pub mod config;
pub mod dosing;
pub mod error;
pub mod models;
pub mod simulation;

pub use config::Config;
pub use dosing::{DosingRegimen, Event, EventKind, EventScheduler, RegimenSpec};
pub use error::{FailureKind, PKError, PKResult, SubjectFailure};
pub use models::{ModelBuilder, ModelDefinition};
pub use simulation::{Cohort, RunSettings, Simulator, StudyDesign};
