// src/state/mod.rs

//! Service runtime state.
//!
//! - [`instance`] holds the mutable [`ServiceInstance`] the supervisor core
//!   owns.
//! - [`manager`] exposes read-only [`StateSnapshot`]s to everyone else.

pub mod instance;
pub mod manager;

pub use instance::{ServiceInstance, ServiceState};
pub use manager::{StateManager, StateSnapshot};
