//! Integration tests for tidefs
//!
//! These tests drive the daemon end to end over the simulated swarm
//! backend: namespace resolution, read sessions, lifecycle transitions,
//! and usage accounting.

#[path = "integration/support.rs"]
mod support;

#[path = "integration/lifecycle_transitions.rs"]
mod lifecycle_transitions;
#[path = "integration/namespace_resolution.rs"]
mod namespace_resolution;
#[path = "integration/read_paths.rs"]
mod read_paths;
#[path = "integration/usage_accounting.rs"]
mod usage_accounting;
