use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::core::domain::{Parameters, Phase, StepResult, Structure};
use crate::engine::executor::{StepExecutor, StepRequest};

/// Copy of the step description written next to the step's outputs.
pub const INPUT_FILE: &str = "step_input.json";

/// What the external program receives on stdin.
#[derive(Serialize)]
struct ProgramInput<'a> {
    structure: &'a Structure,
    phase: Phase,
    relaxation: &'a [Phase],
    /// Directory of the step to restart from.
    restart: Option<&'a Path>,
    params: &'a Parameters,
}

/// What the external program must print on stdout.
#[derive(Deserialize)]
struct ProgramOutput {
    success: bool,
    /// Final geometry. Omitted when the program does not move atoms.
    #[serde(default)]
    structure: Option<Structure>,
    #[serde(default)]
    total_energies: Vec<f64>,
    #[serde(default)]
    forces: Vec<Vector3<f64>>,
    #[serde(default = "zero_stress")]
    stress: Matrix3<f64>,
}

fn zero_stress() -> Matrix3<f64> {
    Matrix3::zeros()
}

/// Runs an external program once per step, inside the step directory.
/// Streams the step description via stdin and reads the result from stdout.
pub struct ProcessExecutor {
    executable: String,
    args: Vec<String>,
    tolerance: f64,
}

impl ProcessExecutor {
    /// Creates a new executor.
    ///
    /// # Arguments
    /// * `executable` - Program to run for every step.
    /// * `tolerance` - Energy resolution of the program (eV).
    pub fn new(executable: &str, tolerance: f64) -> Self {
        Self {
            executable: executable.to_string(),
            args: Vec::new(),
            tolerance,
        }
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.args.push(arg.to_string());
        self
    }

    fn generate_input(&self, request: &StepRequest) -> Result<String> {
        let input = ProgramInput {
            structure: &request.structure,
            phase: request.phase,
            relaxation: &request.relaxation,
            restart: request.restart.as_ref().map(|r| r.location.as_path()),
            params: &request.params,
        };
        serde_json::to_string_pretty(&input).context("Failed to serialize step input")
    }

    fn run_process(&self, workdir: &Path, input_data: &str) -> Result<String> {
        let mut child = Command::new(&self.executable)
            .args(&self.args)
            .current_dir(workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.executable))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input_data.as_bytes())
                .context("Failed to write step input to stdin")?;
        }

        let output = child
            .wait_with_output()
            .context("Failed to read program output")?;

        if !output.status.success() {
            let err_msg = String::from_utf8_lossy(&output.stderr);
            bail!("{} exited with {}: {}", self.executable, output.status, err_msg.trim());
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn parse_output(&self, stdout: &str, request: &StepRequest) -> Result<StepResult> {
        let parsed: ProgramOutput =
            serde_json::from_str(stdout.trim()).context("Program output is not a valid step result")?;

        let structure = parsed.structure.unwrap_or_else(|| request.structure.clone());
        if structure.len() != request.structure.len() {
            bail!(
                "Atom count mismatch: sent {}, got {}",
                request.structure.len(),
                structure.len()
            );
        }
        if parsed.success && parsed.total_energies.iter().any(|e| !e.is_finite()) {
            bail!("Program reported non-finite total energies");
        }

        Ok(StepResult {
            success: parsed.success,
            structure,
            initial_structure: Some(request.structure.clone()),
            total_energies: parsed.total_energies,
            forces: parsed.forces,
            stress: parsed.stress,
            location: PathBuf::from(&request.outdir),
        })
    }
}

impl StepExecutor for ProcessExecutor {
    fn name(&self) -> &str {
        &self.executable
    }

    fn energy_tolerance(&self) -> f64 {
        self.tolerance
    }

    fn execute(&self, request: &StepRequest) -> Result<StepResult> {
        fs::create_dir_all(&request.outdir)
            .with_context(|| format!("Failed to create {}", request.outdir.display()))?;

        let input_str = self.generate_input(request)?;
        fs::write(request.outdir.join(INPUT_FILE), &input_str)
            .context("Failed to write step input copy")?;

        let output_str = self.run_process(&request.outdir, &input_str)?;
        self.parse_output(&output_str, request)
    }
}
