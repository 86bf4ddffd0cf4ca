use std::path::PathBuf;

use log::debug;
use nalgebra::Vector3;
use uuid::Uuid;

use crate::core::config::EpitaxialConfig;
use crate::core::domain::{Phase, StepResult, Structure};
use crate::core::strain::{change_structure, strain_key};
use crate::engine::executor::StepRequest;
use crate::error::{RelaxError, Result};
use crate::solvers::{Action, Controller, Outcome, RelaxEvent, Reporter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// Unstrained reference at x = 0.
    Baseline,
    /// Walking outward until the projected stress changes sign.
    Bracket,
    Bisect,
    Final,
    Done,
}

/// A trial point of the search: strain value and its result.
#[derive(Debug, Clone)]
struct Trial {
    x: f64,
    result: StepResult,
}

/// Epitaxial relaxation along a fixed direction `d`.
///
/// The cell may only deform along `d`, which the executor cannot express
/// natively. Instead the strain `x` of `cell + x(d⊗d)·cell` is searched for
/// the zero of the projected stress `dᵀσd`: bracket by walking outward in
/// steps of `initial_step`, then bisect until the energies at both ends of
/// the bracket agree within `epiconv` per atom. Every trial is an ionic
/// relaxation in `relax_ions/<strain>`; the lower-energy end of the final
/// bracket gets one static calculation in the output directory.
pub struct EpitaxialSearchController {
    run: Uuid,
    config: EpitaxialConfig,
    original: Structure,
    direction: Vector3<f64>,
    threshold: f64,
    outdir: PathBuf,
    stage: Stage,
    /// Search direction: +1 expands, -1 contracts.
    sign: f64,
    start: Option<Trial>,
    end: Option<Trial>,
    /// Strain of the outstanding trial request.
    pending_x: Option<f64>,
    awaiting: bool,
    last: Option<StepResult>,
    calls_made: usize,
    reporter: Reporter,
}

impl EpitaxialSearchController {
    pub fn new(
        structure: &Structure,
        outdir: impl Into<PathBuf>,
        config: &EpitaxialConfig,
        reporter: Reporter,
    ) -> Result<Self> {
        let config = config.clone();
        let direction = config.unit_direction().ok_or_else(|| {
            RelaxError::Configuration("epitaxial direction must be a non-zero vector".into())
        })?;
        if !(config.initial_step > 0.0) {
            return Err(RelaxError::Configuration(format!(
                "initial strain step must be positive, got {}",
                config.initial_step
            )));
        }
        if !(config.epiconv > 0.0) || structure.is_empty() {
            return Err(RelaxError::Configuration(
                "epitaxial convergence needs a positive epiconv and a non-empty structure".into(),
            ));
        }

        let threshold = config.epiconv * structure.len() as f64;
        let outdir = outdir.into();
        let run = Uuid::new_v4();
        debug!(
            "[{}] epitaxial entry: outdir={} direction={:?} epiconv={} initial_step={}",
            run,
            outdir.display(),
            direction.as_slice(),
            config.epiconv,
            config.initial_step
        );

        Ok(Self {
            run,
            config,
            original: structure.clone(),
            direction,
            threshold,
            outdir,
            stage: Stage::Baseline,
            sign: 1.0,
            start: None,
            end: None,
            pending_x: None,
            awaiting: false,
            last: None,
            calls_made: 0,
            reporter,
        })
    }

    pub fn calls_made(&self) -> usize {
        self.calls_made
    }

    /// Current bracket as `(x_start, x_end)`, once both ends are known.
    pub fn bracket(&self) -> Option<(f64, f64)> {
        Some((self.start.as_ref()?.x, self.end.as_ref()?.x))
    }

    fn component(&self, result: &StepResult) -> f64 {
        result.projected_stress(&self.direction)
    }

    fn energy(result: &StepResult) -> Result<f64> {
        result.total_energy().ok_or_else(|| RelaxError::MissingEnergy {
            location: result.location.clone(),
        })
    }

    fn trial(&mut self, x: f64) -> Result<Action> {
        if self.config.max_calls > 0 && (self.calls_made as i64) >= self.config.max_calls {
            return Err(RelaxError::ConvergenceFailure {
                phase: Phase::Ionic,
                iterations: self.calls_made,
            });
        }
        self.pending_x = Some(x);
        self.awaiting = true;
        Ok(Action::Run(StepRequest {
            structure: change_structure(&self.original, &self.direction, x),
            outdir: self.outdir.join("relax_ions").join(strain_key(x)),
            phase: Phase::Ionic,
            relaxation: vec![Phase::Ionic],
            restart: self.last.clone(),
            params: self.config.params.clone(),
        }))
    }

    /// Bisects again, or moves to the final static step once the bracket
    /// ends agree in energy.
    fn bisect_or_finish(&mut self) -> Result<Action> {
        let (start, end) = match (&self.start, &self.end) {
            (Some(s), Some(e)) => (s, e),
            _ => return Err(RelaxError::Protocol("bisection without a bracket")),
        };
        let e_start = Self::energy(&start.result)?;
        let e_end = Self::energy(&end.result)?;

        if (e_start - e_end).abs() >= self.threshold {
            let mid = 0.5 * (start.x + end.x);
            return self.trial(mid);
        }

        let best = if e_start > e_end { end } else { start };
        let best = best.clone();
        self.reporter.log(
            self.run,
            format!(
                "epitaxial bracket [{}, {}] converged, relaxed strain {}",
                strain_key(start.x),
                strain_key(end.x),
                strain_key(best.x)
            ),
        );
        self.reporter.send(RelaxEvent::PhaseEntered {
            run: self.run,
            phase: Phase::Static,
        });
        self.stage = Stage::Final;
        self.awaiting = true;
        Ok(Action::Run(StepRequest {
            structure: best.result.structure.clone(),
            outdir: self.outdir.clone(),
            phase: Phase::Static,
            relaxation: vec![Phase::Static],
            restart: Some(best.result),
            params: self.config.params.clone(),
        }))
    }

    fn absorb(&mut self, result: StepResult) -> Result<Action> {
        if !result.success {
            return Err(RelaxError::ExecutionFailure {
                location: result.location,
            });
        }
        self.calls_made += 1;

        if self.stage == Stage::Final {
            self.stage = Stage::Done;
            // The search never ran with the caller's exact structure; the
            // final record must still name it as the initial condition.
            let mut result = result;
            result.initial_structure = Some(self.original.clone());
            return Ok(Action::Done(Outcome {
                result,
                calls_made: self.calls_made,
                discard: Vec::new(),
            }));
        }

        let x = self
            .pending_x
            .take()
            .ok_or(RelaxError::Protocol("trial result without a strain"))?;
        let component = self.component(&result);
        self.last = Some(result.clone());
        let trial = Trial { x, result };

        match self.stage {
            Stage::Baseline => {
                self.sign = if component > 0.0 { 1.0 } else { -1.0 };
                self.start = Some(trial);
                self.stage = Stage::Bracket;
                self.reporter.send(RelaxEvent::PhaseEntered {
                    run: self.run,
                    phase: Phase::Ionic,
                });
                let first = self.config.initial_step * self.sign;
                self.trial(first)
            }
            Stage::Bracket => {
                if self.sign * component > 0.0 {
                    let next = x + self.config.initial_step * self.sign;
                    self.start = Some(trial);
                    self.trial(next)
                } else {
                    self.end = Some(trial);
                    self.stage = Stage::Bisect;
                    debug!("[{}] bracket found: {:?}", self.run, self.bracket());
                    self.bisect_or_finish()
                }
            }
            Stage::Bisect => {
                if self.sign * component > 0.0 {
                    self.start = Some(trial);
                } else {
                    self.end = Some(trial);
                }
                self.bisect_or_finish()
            }
            Stage::Final | Stage::Done => Err(RelaxError::Protocol("unexpected trial result")),
        }
    }
}

impl Controller for EpitaxialSearchController {
    fn step(&mut self, completed: Option<StepResult>) -> Result<Action> {
        match (self.awaiting, completed) {
            (true, Some(result)) => {
                self.awaiting = false;
                self.absorb(result)
            }
            (true, None) => Err(RelaxError::Protocol("missing result for the outstanding step")),
            (false, Some(_)) => Err(RelaxError::Protocol("result supplied without a request")),
            (false, None) => match self.stage {
                Stage::Baseline => self.trial(0.0),
                _ => Err(RelaxError::Protocol("relaxation already finished")),
            },
        }
    }

    fn run_id(&self) -> Uuid {
        self.run
    }
}
