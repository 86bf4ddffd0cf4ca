use std::path::{Path, PathBuf};

use log::{debug, warn};
use uuid::Uuid;

use crate::core::config::RelaxConfig;
use crate::core::domain::{Parameters, Phase, StepResult, Structure};
use crate::engine::executor::StepRequest;
use crate::error::{RelaxError, Result};
use crate::solvers::convergence::ConvergencePolicy;
use crate::solvers::{Action, Controller, Outcome, RelaxEvent, Reporter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    CellShape,
    Ionic,
    Extra,
    Static,
    Done,
}

/// The request currently being realized by the caller.
#[derive(Debug, Clone, Copy)]
struct Pending {
    phase: Phase,
    used_first_trial: bool,
}

/// Staged relaxation: cell shape, then ions, then an optional extra phase,
/// then one static calculation in the output directory.
///
/// Each phase is run to convergence before the next one starts. The step
/// counter is shared by all phases, so directories read
/// `relax_cellshape/0`, `relax_cellshape/1`, `relax_ions/2`, ...
pub struct RelaxationController {
    run: Uuid,
    config: RelaxConfig,
    policy: ConvergencePolicy,
    outdir: PathBuf,
    structure: Structure,
    stage: Stage,
    calls_made: usize,
    /// Last relaxation result and the step index it was produced at.
    last: Option<(StepResult, usize)>,
    first_trial: Option<Parameters>,
    phase_converged: bool,
    pending: Option<Pending>,
    entered: Option<Phase>,
    reporter: Reporter,
}

impl RelaxationController {
    /// Prepares a relaxation of `structure` into `outdir`.
    ///
    /// `tolerance` is the executor's intrinsic energy resolution; an energy
    /// criterion below it is rejected here, before any step is requested.
    pub fn new(
        structure: &Structure,
        outdir: impl Into<PathBuf>,
        config: &RelaxConfig,
        tolerance: f64,
        reporter: Reporter,
    ) -> Result<Self> {
        let config = config.clone();
        let policy = ConvergencePolicy::build(
            &config.convergence,
            config.min_steps,
            structure.len(),
            tolerance,
        )?;
        let outdir = outdir.into();
        let run = Uuid::new_v4();

        debug!(
            "[{}] relax entry: outdir={} atoms={} max_calls={} keep_steps={} nofail={} min_steps={} policy={:?} relaxation={:?}",
            run,
            outdir.display(),
            structure.len(),
            config.max_calls,
            config.keep_steps,
            config.tolerate_nonconvergence,
            config.min_steps,
            policy,
            config.relaxation,
        );

        let first_trial = if config.first_trial.is_empty() {
            None
        } else {
            Some(config.first_trial.clone())
        };
        let stage = if config.requests(Phase::CellShape) {
            Stage::CellShape
        } else {
            Stage::Ionic
        };

        Ok(Self {
            run,
            config,
            policy,
            outdir,
            structure: structure.clone(),
            stage,
            calls_made: 0,
            last: None,
            first_trial,
            phase_converged: false,
            pending: None,
            entered: None,
            reporter,
        })
    }

    pub fn outdir(&self) -> &Path {
        &self.outdir
    }

    pub fn calls_made(&self) -> usize {
        self.calls_made
    }

    /// Working structure: the latest relaxed geometry.
    pub fn structure(&self) -> &Structure {
        &self.structure
    }

    fn under_ceiling(&self, allowance: i64) -> bool {
        self.config.max_calls <= 0 || (self.calls_made as i64) < self.config.max_calls + allowance
    }

    fn next_action(&mut self) -> Result<Action> {
        loop {
            match self.stage {
                Stage::CellShape => {
                    if self.config.requests(Phase::CellShape)
                        && !self.phase_converged
                        && self.under_ceiling(0)
                    {
                        return Ok(self.request(Phase::CellShape));
                    }
                    self.finish_phase(Phase::CellShape)?;
                    self.stage = Stage::Ionic;
                }
                Stage::Ionic => {
                    // One extra allowance: cell shape may have used the whole budget.
                    if self.config.requests(Phase::Ionic)
                        && !self.phase_converged
                        && self.under_ceiling(1)
                    {
                        return Ok(self.request(Phase::Ionic));
                    }
                    self.finish_phase(Phase::Ionic)?;
                    self.stage = Stage::Extra;
                }
                Stage::Extra => {
                    if self.config.requests(Phase::ExtraPhase) && self.under_ceiling(2) {
                        return Ok(self.request(Phase::ExtraPhase));
                    }
                    self.stage = Stage::Static;
                }
                Stage::Static => return Ok(self.request(Phase::Static)),
                Stage::Done => return Err(RelaxError::Protocol("relaxation already finished")),
            }
        }
    }

    /// Raises a convergence failure unless the last result converged or
    /// failures are tolerated.
    fn finish_phase(&mut self, phase: Phase) -> Result<()> {
        let converged = match &self.last {
            Some((result, index)) => self.policy.check(Some(result), *index)?,
            None => true,
        };
        if !converged {
            if !self.config.tolerate_nonconvergence {
                return Err(RelaxError::ConvergenceFailure {
                    phase,
                    iterations: self.calls_made,
                });
            }
            warn!(
                "[{}] {} not converged after {} calls, continuing",
                self.run, phase, self.calls_made
            );
        }
        self.phase_converged = false;
        Ok(())
    }

    fn request(&mut self, phase: Phase) -> Action {
        if self.entered != Some(phase) {
            self.entered = Some(phase);
            self.reporter.send(RelaxEvent::PhaseEntered { run: self.run, phase });
        }

        let outdir = match phase.dir_name() {
            Some(dir) => self.outdir.join(dir).join(self.calls_made.to_string()),
            None => self.outdir.clone(),
        };
        let relaxation = match phase {
            Phase::CellShape => self.config.relaxation.clone(),
            other => vec![other],
        };

        let mut params = self.config.params.clone();
        let mut used_first_trial = false;
        if phase != Phase::Static {
            if let Some(overrides) = self.first_trial.take() {
                params.extend(overrides);
                used_first_trial = true;
            }
        }

        self.pending = Some(Pending {
            phase,
            used_first_trial,
        });
        Action::Run(StepRequest {
            structure: self.structure.clone(),
            outdir,
            phase,
            relaxation,
            restart: self.last.as_ref().map(|(r, _)| r.clone()),
            params,
        })
    }

    fn absorb(&mut self, pending: Pending, result: StepResult) -> Result<Option<Outcome>> {
        if !result.success {
            return Err(RelaxError::ExecutionFailure {
                location: result.location,
            });
        }
        self.calls_made += 1;

        if pending.phase == Phase::Static {
            self.stage = Stage::Done;
            let discard = if self.config.keep_steps {
                Vec::new()
            } else {
                [Phase::CellShape, Phase::Ionic]
                    .iter()
                    .filter_map(|p| p.dir_name())
                    .map(|d| self.outdir.join(d))
                    .collect()
            };
            self.reporter.log(
                self.run,
                format!("relaxation finished after {} calls", self.calls_made),
            );
            return Ok(Some(Outcome {
                result,
                calls_made: self.calls_made,
                discard,
            }));
        }

        self.structure = result.structure.clone();
        let index = self.calls_made;

        match pending.phase {
            Phase::ExtraPhase => {
                self.last = Some((result, index));
                self.stage = Stage::Static;
            }
            _ if pending.used_first_trial => {
                // The override step is never trusted to end the phase.
                self.last = Some((result, index));
            }
            phase => {
                let converged = self.policy.check(Some(&result), index)?;
                self.last = Some((result, index));
                if converged {
                    self.reporter.log(
                        self.run,
                        format!("{} converged at step {}", phase, index),
                    );
                    self.phase_converged = true;
                }
            }
        }
        Ok(None)
    }
}

impl Controller for RelaxationController {
    fn step(&mut self, completed: Option<StepResult>) -> Result<Action> {
        match (self.pending, completed) {
            (Some(pending), Some(result)) => {
                self.pending = None;
                if let Some(outcome) = self.absorb(pending, result)? {
                    return Ok(Action::Done(outcome));
                }
            }
            (Some(_), None) => {
                return Err(RelaxError::Protocol("missing result for the outstanding step"))
            }
            (None, Some(_)) => {
                return Err(RelaxError::Protocol("result supplied without a request"))
            }
            (None, None) => {}
        }
        self.next_action()
    }

    fn run_id(&self) -> Uuid {
        self.run
    }
}
