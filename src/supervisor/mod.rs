// src/supervisor/mod.rs

//! Service orchestration.
//!
//! The pure state machine lives in [`core`]; the async control loop and its
//! caller-facing handle in [`runtime`]. [`pool`] bounds adapter concurrency
//! and serialises calls per service.

pub mod core;
pub mod pool;
pub mod runtime;
pub mod selection;

pub use core::{CoreStep, StopPurpose, SupervisorCommand, SupervisorCore, SupervisorEvent, Transition};
pub use pool::WorkerPool;
pub use runtime::{ServiceResults, Supervisor, SupervisorHandle};
pub use selection::Selection;
