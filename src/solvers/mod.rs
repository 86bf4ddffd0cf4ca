use std::path::PathBuf;

use crossbeam_channel::Sender;
use uuid::Uuid;

use crate::core::domain::{Phase, StepResult};
use crate::engine::executor::StepRequest;
use crate::error::Result;

/// Terminal output of a controller.
#[derive(Debug, Clone)]
pub struct Outcome {
    /// Authoritative final record, located at the output directory.
    pub result: StepResult,
    /// Executor calls made, the final static one included.
    pub calls_made: usize,
    /// Intermediate trees to delete before the result is published.
    pub discard: Vec<PathBuf>,
}

/// What a controller wants next.
#[derive(Debug, Clone)]
pub enum Action {
    /// Realize this step, then call `step` again with its result.
    Run(StepRequest),
    /// The relaxation is over.
    Done(Outcome),
}

/// A relaxation procedure written as an explicit state machine.
///
/// The first call passes `None`. Every later call must pass the result of the
/// request returned by the previous call. Steps are thus strictly sequential,
/// and dropping a controller midway has no side effect of its own.
pub trait Controller: Send {
    fn step(&mut self, completed: Option<StepResult>) -> Result<Action>;

    /// Identifier of this invocation, attached to every event it emits.
    fn run_id(&self) -> Uuid;
}

/// Events emitted by controllers and the driver to the main thread.
#[derive(Debug, Clone)]
pub enum RelaxEvent {
    /// Diagnostic log message.
    Log { run: Uuid, message: String },

    PhaseEntered { run: Uuid, phase: Phase },

    /// A step was handed to the executor.
    StepRequested { run: Uuid, phase: Phase, location: PathBuf },

    /// A step was answered from an existing checkpoint.
    StepReused { run: Uuid, phase: Phase, location: PathBuf },

    StepCompleted {
        run: Uuid,
        phase: Phase,
        location: PathBuf,
        energy: Option<f64>,
        max_force: f64,
    },

    /// The terminal result was published.
    Finished { run: Uuid, location: PathBuf },
}

/// Optional event sink handed to each controller at construction.
#[derive(Debug, Clone, Default)]
pub struct Reporter {
    tx: Option<Sender<RelaxEvent>>,
}

impl Reporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channel(tx: Sender<RelaxEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    #[inline]
    pub fn send(&self, event: RelaxEvent) {
        if let Some(tx) = &self.tx {
            // A dropped receiver only means nobody is listening.
            let _ = tx.send(event);
        }
    }

    pub fn log(&self, run: Uuid, message: String) {
        log::debug!("[{}] {}", run, message);
        self.send(RelaxEvent::Log { run, message });
    }
}

pub mod convergence;
pub mod epitaxial;
pub mod relax;
pub mod training;
