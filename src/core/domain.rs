use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use nalgebra::{Matrix3, Point3, Vector3};
use serde::{Deserialize, Serialize};

/// Free-form parameters forwarded verbatim to the step executor.
pub type Parameters = BTreeMap<String, serde_json::Value>;

// --- Physics Types ---

/// A single atom of a periodic structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Atom {
    pub species: String,
    pub position: Point3<f64>, // Cartesian, Å
    #[serde(default)]
    pub fixed: bool,
}

impl Atom {
    pub fn new(species: &str, position: Point3<f64>) -> Self {
        Self {
            species: species.to_string(),
            position,
            fixed: false,
        }
    }
}

/// A periodic structure: lattice vectors plus atoms.
///
/// The controllers treat this as a plain value. They clone the caller's
/// structure on entry and only ever replace their working copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Structure {
    pub cell: Matrix3<f64>, // Columns are a, b, c
    pub atoms: Vec<Atom>,
}

impl Structure {
    pub fn new(cell: Matrix3<f64>) -> Self {
        Self { cell, atoms: Vec::new() }
    }

    pub fn with_atom(mut self, species: &str, position: Point3<f64>) -> Self {
        self.atoms.push(Atom::new(species, position));
        self
    }

    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    pub fn volume(&self) -> f64 {
        self.cell.determinant().abs()
    }
}

// --- Phases ---

/// A stage of the relaxation. Decides sub-directory naming and which
/// relaxation mode the executor is asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Phase {
    #[serde(rename = "cellshape")]
    CellShape,
    #[serde(rename = "ionic")]
    Ionic,
    #[serde(rename = "relgw")]
    ExtraPhase,
    #[serde(rename = "static")]
    Static,
}

impl Phase {
    /// Sub-directory holding this phase's steps. Static runs in the output
    /// directory itself.
    pub fn dir_name(&self) -> Option<&'static str> {
        match self {
            Phase::CellShape => Some("relax_cellshape"),
            Phase::Ionic => Some("relax_ions"),
            Phase::ExtraPhase => Some("relax_gwcalc"),
            Phase::Static => None,
        }
    }

    pub fn from_dir_name(name: &str) -> Option<Self> {
        match name {
            "relax_cellshape" => Some(Phase::CellShape),
            "relax_ions" => Some(Phase::Ionic),
            "relax_gwcalc" => Some(Phase::ExtraPhase),
            _ => None,
        }
    }

    /// Phases whose steps live in their own sub-directory trees.
    pub const INTERMEDIATE: [Phase; 3] = [Phase::CellShape, Phase::Ionic, Phase::ExtraPhase];
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::CellShape => "cell-shape",
            Phase::Ionic => "ions",
            Phase::ExtraPhase => "extra phase",
            Phase::Static => "static",
        };
        f.write_str(s)
    }
}

// --- Step Results ---

/// Outcome of one external step. Produced by the executor, never edited by
/// the controllers except for the epitaxial initial-structure patch, which
/// builds a new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub success: bool,
    pub structure: Structure,
    /// Structure the step nominally started from.
    #[serde(default)]
    pub initial_structure: Option<Structure>,
    /// Chronological total energies within this step (eV).
    pub total_energies: Vec<f64>,
    pub forces: Vec<Vector3<f64>>, // eV/Å
    pub stress: Matrix3<f64>,
    pub location: PathBuf,
}

impl StepResult {
    /// Last total energy of the trace.
    pub fn total_energy(&self) -> Option<f64> {
        self.total_energies.last().copied()
    }

    /// Largest per-atom force magnitude. Zero when no forces were reported.
    pub fn max_force(&self) -> f64 {
        self.forces.iter().map(|f| f.norm()).fold(0.0, f64::max)
    }

    /// Stress projected on a unit direction, `dᵀ·σ·d`.
    pub fn projected_stress(&self, direction: &Vector3<f64>) -> f64 {
        direction.dot(&(self.stress * direction))
    }
}
