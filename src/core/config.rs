use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use nalgebra::Vector3;
use serde::Deserialize;

use crate::core::domain::{Parameters, Phase, StepResult};

/// User-supplied convergence predicate.
pub type ConvergenceFn = Arc<dyn Fn(&StepResult) -> bool + Send + Sync>;

/// How a relaxation decides it may stop.
///
/// From JSON: `null` leaves it unset, a positive number is an energy
/// criterion in eV/atom, a zero or negative number is a force criterion in
/// eV/Å. Predicates are only available from code.
#[derive(Clone, Default, Deserialize)]
#[serde(from = "Option<f64>")]
pub enum Criterion {
    Predicate(ConvergenceFn),
    /// Per-atom energy difference within the last step's trace.
    Energy(f64),
    /// Raw force threshold; its magnitude is used.
    Force(f64),
    /// Ten times the executor's energy tolerance.
    #[default]
    Unset,
}

impl Criterion {
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&StepResult) -> bool + Send + Sync + 'static,
    {
        Criterion::Predicate(Arc::new(f))
    }
}

impl From<Option<f64>> for Criterion {
    fn from(value: Option<f64>) -> Self {
        match value {
            None => Criterion::Unset,
            Some(x) if x > 0.0 => Criterion::Energy(x),
            Some(x) => Criterion::Force(x),
        }
    }
}

impl From<f64> for Criterion {
    fn from(value: f64) -> Self {
        Criterion::from(Some(value))
    }
}

impl fmt::Debug for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Criterion::Predicate(_) => f.write_str("Predicate(<fn>)"),
            Criterion::Energy(x) => write!(f, "Energy({})", x),
            Criterion::Force(x) => write!(f, "Force({})", x),
            Criterion::Unset => f.write_str("Unset"),
        }
    }
}

/// Settings for the staged and training relaxations.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelaxConfig {
    /// Maximum number of executor calls. Zero or negative means unbounded.
    pub max_calls: i64,
    /// When false, intermediate step directories are removed on success.
    pub keep_steps: bool,
    /// Proceed with the latest unconverged result instead of failing.
    pub tolerate_nonconvergence: bool,
    pub convergence: Criterion,
    /// Steps performed before convergence is checked. Negative disables it.
    pub min_steps: i64,
    /// Parameters applied to the very first call only.
    pub first_trial: Parameters,
    /// Requested relaxation phases.
    pub relaxation: Vec<Phase>,
    /// Passed through to the executor on every call.
    pub params: Parameters,
}

impl Default for RelaxConfig {
    fn default() -> Self {
        Self {
            max_calls: 20,
            keep_steps: true,
            tolerate_nonconvergence: false,
            convergence: Criterion::Unset,
            min_steps: -1,
            first_trial: Parameters::new(),
            relaxation: vec![Phase::CellShape, Phase::Ionic],
            params: Parameters::new(),
        }
    }
}

impl RelaxConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    pub fn requests(&self, phase: Phase) -> bool {
        self.relaxation.contains(&phase)
    }
}

/// Settings for the epitaxial strain search.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EpitaxialConfig {
    /// Direction the cell may deform along. Normalized on use.
    pub direction: [f64; 3],
    /// Energy convergence of the bisection, eV/atom.
    pub epiconv: f64,
    /// Strain increment while bracketing.
    pub initial_step: f64,
    /// Maximum number of trial evaluations. Zero or negative means unbounded.
    pub max_calls: i64,
    pub params: Parameters,
}

impl Default for EpitaxialConfig {
    fn default() -> Self {
        Self {
            direction: [0.0, 0.0, 1.0],
            epiconv: 1e-4,
            initial_step: 0.05,
            max_calls: 0,
            params: Parameters::new(),
        }
    }
}

impl EpitaxialConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    /// Unit epitaxial direction, or None for a zero vector.
    pub fn unit_direction(&self) -> Option<Vector3<f64>> {
        let d = Vector3::from(self.direction);
        let n = d.norm();
        if n > 0.0 && n.is_finite() {
            Some(d / n)
        } else {
            None
        }
    }
}
