use std::fmt;

use crate::core::config::{ConvergenceFn, Criterion};
use crate::core::domain::StepResult;
use crate::error::{RelaxError, Result};

/// Factor applied to the executor tolerance when no criterion is given.
pub const DEFAULT_TOLERANCE_FACTOR: f64 = 1e1;

#[derive(Clone)]
enum Rule {
    Predicate(ConvergenceFn),
    /// Absolute total-energy gap, already scaled by atom count.
    EnergyGap(f64),
    /// Maximum force magnitude.
    MaxForce(f64),
}

/// Decides whether a completed step may end its phase.
///
/// The criterion is resolved once, here; evaluation never re-inspects it.
#[derive(Clone)]
pub struct ConvergencePolicy {
    rule: Rule,
    min_steps: i64,
}

impl ConvergencePolicy {
    /// Resolves `criterion` for a structure of `atom_count` atoms.
    ///
    /// Fails when a positive energy threshold is below `tolerance`, which the
    /// executor could not resolve anyway.
    pub fn build(
        criterion: &Criterion,
        min_steps: i64,
        atom_count: usize,
        tolerance: f64,
    ) -> Result<Self> {
        let rule = match criterion {
            Criterion::Predicate(f) => Rule::Predicate(f.clone()),
            Criterion::Unset => Rule::EnergyGap(DEFAULT_TOLERANCE_FACTOR * tolerance),
            Criterion::Energy(per_atom) => Rule::EnergyGap(per_atom * atom_count as f64),
            Criterion::Force(f) => Rule::MaxForce(f.abs()),
        };

        if let Rule::EnergyGap(c) = rule {
            if c > 0.0 && c < tolerance {
                return Err(RelaxError::Configuration(format!(
                    "energy convergence criterion ({:e}) is smaller than the executor tolerance ({:e})",
                    c, tolerance
                )));
            }
        }

        Ok(Self { rule, min_steps })
    }

    /// Checks a result produced by the `step_index`-th call (counting from one).
    ///
    /// `None` is converged, so the first step of a run can always proceed.
    /// An unsuccessful result is an error, not a "not yet".
    pub fn check(&self, result: Option<&StepResult>, step_index: usize) -> Result<bool> {
        let Some(result) = result else {
            return Ok(true);
        };
        if !result.success {
            return Err(RelaxError::ExecutionFailure {
                location: result.location.clone(),
            });
        }
        if self.min_steps > 0 && (step_index as i64) < self.min_steps {
            return Ok(false);
        }

        let converged = match &self.rule {
            Rule::Predicate(f) => f(result),
            Rule::EnergyGap(c) => match result.total_energies.as_slice() {
                [.., previous, last] => (last - previous).abs() < *c,
                _ => true,
            },
            Rule::MaxForce(c) => result.max_force() < *c,
        };
        Ok(converged)
    }

    /// Resolved energy threshold, if this is an energy rule.
    pub fn energy_threshold(&self) -> Option<f64> {
        match self.rule {
            Rule::EnergyGap(c) => Some(c),
            _ => None,
        }
    }
}

impl fmt::Debug for ConvergencePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = match &self.rule {
            Rule::Predicate(_) => "predicate".to_string(),
            Rule::EnergyGap(c) => format!("|ΔE| < {:e}", c),
            Rule::MaxForce(c) => format!("max|F| < {:e}", c),
        };
        f.debug_struct("ConvergencePolicy")
            .field("rule", &rule)
            .field("min_steps", &self.min_steps)
            .finish()
    }
}
