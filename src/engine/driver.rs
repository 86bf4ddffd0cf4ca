use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};
use rayon::prelude::*;
use uuid::Uuid;

use crate::core::config::{EpitaxialConfig, RelaxConfig};
use crate::core::domain::{StepResult, Structure};
use crate::engine::checkpoint::CheckpointStore;
use crate::engine::executor::{StepExecutor, StepRequest};
use crate::error::{RelaxError, Result};
use crate::solvers::epitaxial::EpitaxialSearchController;
use crate::solvers::relax::RelaxationController;
use crate::solvers::training::TrainingController;
use crate::solvers::{Action, Controller, RelaxEvent, Reporter};

/// Realizes controller requests with an executor, answering already
/// completed steps from the checkpoint store.
///
/// Retrying a failed relaxation is simply running it again with the same
/// output directory: every successful step found in the store is reused.
pub struct Driver {
    executor: Arc<dyn StepExecutor>,
    store: Arc<dyn CheckpointStore>,
    reporter: Reporter,
}

impl Driver {
    pub fn new(executor: Arc<dyn StepExecutor>, store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            executor,
            store,
            reporter: Reporter::new(),
        }
    }

    pub fn with_reporter(mut self, reporter: Reporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Drives `controller` to completion and returns the terminal result.
    pub fn run<C: Controller + ?Sized>(&self, controller: &mut C) -> Result<StepResult> {
        let run = controller.run_id();
        let mut completed = None;
        loop {
            match controller.step(completed.take())? {
                Action::Run(request) => {
                    completed = Some(self.realize(run, &request)?);
                }
                Action::Done(outcome) => {
                    for dir in &outcome.discard {
                        debug!("[{}] removing intermediate steps in {}", run, dir.display());
                        self.store.remove_tree(dir)?;
                    }
                    self.store.store(&outcome.result)?;
                    info!(
                        "[{}] finished in {} calls at {}",
                        run,
                        outcome.calls_made,
                        outcome.result.location.display()
                    );
                    self.reporter.send(RelaxEvent::Finished {
                        run,
                        location: outcome.result.location.clone(),
                    });
                    return Ok(outcome.result);
                }
            }
        }
    }

    fn realize(&self, run: Uuid, request: &StepRequest) -> Result<StepResult> {
        let location = &request.outdir;

        if self.store.exists(location) {
            match self.store.load(location) {
                Ok(result) if result.success => {
                    debug!("[{}] reusing checkpoint at {}", run, location.display());
                    self.reporter.send(RelaxEvent::StepReused {
                        run,
                        phase: request.phase,
                        location: location.clone(),
                    });
                    return Ok(result);
                }
                Ok(_) => debug!(
                    "[{}] stored step at {} failed, running it again",
                    run,
                    location.display()
                ),
                Err(e) => warn!(
                    "[{}] unreadable checkpoint at {} ({}), running it again",
                    run,
                    location.display(),
                    e
                ),
            }
        }

        self.reporter.send(RelaxEvent::StepRequested {
            run,
            phase: request.phase,
            location: location.clone(),
        });

        self.store.mark_running(location)?;
        let executed = self.executor.execute(request);
        self.store.clear_running(location)?;

        let mut result = executed.map_err(|source| RelaxError::Executor {
            location: location.clone(),
            source,
        })?;
        if result.location != *location {
            debug!(
                "[{}] executor reported location {}, storing at {}",
                run,
                result.location.display(),
                location.display()
            );
            result.location = location.clone();
        }
        if result.initial_structure.is_none() {
            result.initial_structure = Some(request.structure.clone());
        }
        self.store.store(&result)?;

        self.reporter.send(RelaxEvent::StepCompleted {
            run,
            phase: request.phase,
            location: location.clone(),
            energy: result.total_energy(),
            max_force: result.max_force(),
        });
        Ok(result)
    }

    /// Staged relaxation of `structure` into `outdir`.
    pub fn relax(&self, structure: &Structure, outdir: &Path, config: &RelaxConfig) -> Result<StepResult> {
        let mut controller = RelaxationController::new(
            structure,
            outdir,
            config,
            self.executor.energy_tolerance(),
            self.reporter.clone(),
        )?;
        self.run(&mut controller)
    }

    /// Interleaved cell-shape/ionic relaxation of `structure` into `outdir`.
    pub fn training(&self, structure: &Structure, outdir: &Path, config: &RelaxConfig) -> Result<StepResult> {
        let mut controller = TrainingController::new(
            structure,
            outdir,
            config,
            self.executor.energy_tolerance(),
            self.reporter.clone(),
        )?;
        self.run(&mut controller)
    }

    /// Epitaxial relaxation of `structure` into `outdir`.
    pub fn epitaxial(
        &self,
        structure: &Structure,
        outdir: &Path,
        config: &EpitaxialConfig,
    ) -> Result<StepResult> {
        let mut controller =
            EpitaxialSearchController::new(structure, outdir, config, self.reporter.clone())?;
        self.run(&mut controller)
    }

    /// Runs independent staged relaxations concurrently.
    ///
    /// Each job gets its own controller and its own copy of `config`; results
    /// come back in job order.
    pub fn relax_batch(
        &self,
        jobs: &[(Structure, PathBuf)],
        config: &RelaxConfig,
    ) -> Vec<Result<StepResult>> {
        jobs.par_iter()
            .map(|(structure, outdir)| self.relax(structure, outdir, config))
            .collect()
    }
}
