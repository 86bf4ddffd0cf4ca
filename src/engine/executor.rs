use std::path::PathBuf;

use anyhow::Result;
use serde::Serialize;

use crate::core::domain::{Parameters, Phase, StepResult, Structure};

/// Description of one external step, as requested by a controller.
#[derive(Debug, Clone, Serialize)]
pub struct StepRequest {
    pub structure: Structure,
    pub outdir: PathBuf,
    pub phase: Phase,
    /// Relaxation mode asked of the executor. For cell-shape steps this is
    /// the full requested mode, otherwise just the phase itself.
    pub relaxation: Vec<Phase>,
    /// Result to restart from: the immediately preceding step, if any.
    pub restart: Option<StepResult>,
    pub params: Parameters,
}

/// A generic interface for the expensive external simulation step.
/// Implementations must be Thread-Safe (Sync).
pub trait StepExecutor: Send + Sync {
    /// Runs the step in `request.outdir` and returns its result.
    ///
    /// An `Err` means the step could not be run at all. A step that ran but
    /// failed is reported as `Ok` with `success == false`.
    fn execute(&self, request: &StepRequest) -> Result<StepResult>;

    /// Smallest total-energy difference the underlying method resolves (eV).
    fn energy_tolerance(&self) -> f64;

    /// Returns the name of the engine.
    fn name(&self) -> &str;
}
