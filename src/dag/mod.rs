// src/dag/mod.rs

//! Dependency graph over service ids.

pub mod graph;

pub use graph::DependencyGraph;
