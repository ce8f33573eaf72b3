//! Alert evaluation and the control loops that drive every subsystem.

pub mod alert_engine;
pub mod orchestrator;
pub mod scheduler;

pub use alert_engine::{AlertEngine, EvaluationReport};
pub use orchestrator::{Orchestrator, Schedule, Subsystems};
pub use scheduler::{LoopRegistry, LoopStats, Supervisor};

#[cfg(test)]
mod alert_engine_test;
