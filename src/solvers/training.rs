use std::path::PathBuf;

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
    Cycle,
    Static,
    Done,
}

/// Interleaved relaxation: every cycle is one cell-shape step immediately
/// followed by one ionic step.
///
/// The cycle's verdict comes from its cell-shape result, checked before the
/// ionic step runs. The first converged cycle still completes its ionic step
/// and then ends the loop. Whether the run converged is decided on that last
/// ionic result.
pub struct TrainingController {
    run: Uuid,
    config: RelaxConfig,
    policy: ConvergencePolicy,
    outdir: PathBuf,
    structure: Structure,
    stage: Stage,
    calls_made: usize,
    last: Option<StepResult>,
    first_trial: Option<Parameters>,
    /// Verdict of the current cycle's cell-shape step.
    cycle_converged: Option<bool>,
    awaiting_ionic: bool,
    pending: Option<Phase>,
    reporter: Reporter,
}

impl TrainingController {
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
            "[{}] training entry: outdir={} max_calls={} nofail={} policy={:?}",
            run,
            outdir.display(),
            config.max_calls,
            config.tolerate_nonconvergence,
            policy
        );

        let first_trial = if config.first_trial.is_empty() {
            None
        } else {
            Some(config.first_trial.clone())
        };

        Ok(Self {
            run,
            config,
            policy,
            outdir,
            structure: structure.clone(),
            stage: Stage::Cycle,
            calls_made: 0,
            last: None,
            first_trial,
            cycle_converged: None,
            awaiting_ionic: false,
            pending: None,
            reporter,
        })
    }

    pub fn calls_made(&self) -> usize {
        self.calls_made
    }

    fn under_ceiling(&self) -> bool {
        self.config.max_calls <= 0 || (self.calls_made as i64) < self.config.max_calls
    }

    fn next_action(&mut self) -> Result<Action> {
        match self.stage {
            Stage::Cycle => {
                if self.awaiting_ionic {
                    return Ok(self.request(Phase::Ionic));
                }
                let converged = self.cycle_converged.unwrap_or(false);
                if !converged && self.under_ceiling() {
                    return Ok(self.request(Phase::CellShape));
                }
                // The loop follows the cell-shape verdicts; the run itself is
                // judged on the last ionic result.
                if !self.policy.check(self.last.as_ref(), self.calls_made)? {
                    if !self.config.tolerate_nonconvergence {
                        return Err(RelaxError::ConvergenceFailure {
                            phase: Phase::CellShape,
                            iterations: self.calls_made,
                        });
                    }
                    warn!(
                        "[{}] training not converged after {} calls, continuing",
                        self.run, self.calls_made
                    );
                }
                self.stage = Stage::Static;
                Ok(self.request(Phase::Static))
            }
            Stage::Static => Ok(self.request(Phase::Static)),
            Stage::Done => Err(RelaxError::Protocol("relaxation already finished")),
        }
    }

    fn request(&mut self, phase: Phase) -> Action {
        let outdir = match phase.dir_name() {
            Some(dir) => self.outdir.join(dir).join(self.calls_made.to_string()),
            None => self.outdir.clone(),
        };
        let relaxation = match phase {
            Phase::CellShape => self.config.relaxation.clone(),
            other => vec![other],
        };
        let mut params = self.config.params.clone();
        if phase == Phase::CellShape {
            if let Some(overrides) = self.first_trial.take() {
                params.extend(overrides);
            }
        }
        if phase != Phase::Ionic {
            self.reporter.send(RelaxEvent::PhaseEntered { run: self.run, phase });
        }

        self.pending = Some(phase);
        Action::Run(StepRequest {
            structure: self.structure.clone(),
            outdir,
            phase,
            relaxation,
            restart: self.last.clone(),
            params,
        })
    }

    fn absorb(&mut self, phase: Phase, result: StepResult) -> Result<Option<Outcome>> {
        if !result.success {
            return Err(RelaxError::ExecutionFailure {
                location: result.location,
            });
        }
        self.calls_made += 1;

        match phase {
            Phase::Static => {
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
                    format!("training finished after {} calls", self.calls_made),
                );
                Ok(Some(Outcome {
                    result,
                    calls_made: self.calls_made,
                    discard,
                }))
            }
            Phase::CellShape => {
                let converged = self.policy.check(Some(&result), self.calls_made)?;
                if converged {
                    self.reporter.log(
                        self.run,
                        format!("cell shape converged at step {}", self.calls_made),
                    );
                }
                self.cycle_converged = Some(converged);
                self.structure = result.structure.clone();
                self.last = Some(result);
                self.awaiting_ionic = true;
                Ok(None)
            }
            _ => {
                self.structure = result.structure.clone();
                self.last = Some(result);
                self.awaiting_ionic = false;
                Ok(None)
            }
        }
    }
}

impl Controller for TrainingController {
    fn step(&mut self, completed: Option<StepResult>) -> Result<Action> {
        match (self.pending, completed) {
            (Some(phase), Some(result)) => {
                self.pending = None;
                if let Some(outcome) = self.absorb(phase, result)? {
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
