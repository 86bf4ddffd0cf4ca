//! Chained structural relaxations driven by an external simulation step.
//!
//! Controllers in [`solvers`] are explicit state machines: each call to
//! [`solvers::Controller::step`] consumes the result of the previous request
//! and returns the next request or the terminal result. [`engine::driver`]
//! realizes those requests through a [`engine::executor::StepExecutor`] and a
//! [`engine::checkpoint::CheckpointStore`].

pub mod analysis;
pub mod core;
pub mod engine;
pub mod error;
pub mod solvers;
