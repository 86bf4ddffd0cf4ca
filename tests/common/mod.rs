#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use nalgebra::{Matrix3, Point3, Vector3};
use parking_lot::Mutex;

use relax_chain::core::domain::{Phase, StepResult, Structure};
use relax_chain::engine::checkpoint::MemoryStore;
use relax_chain::engine::driver::Driver;
use relax_chain::engine::executor::{StepExecutor, StepRequest};

pub const TOLERANCE: f64 = 1e-4;

type Script = Box<dyn Fn(&StepRequest, usize) -> StepResult + Send + Sync>;

/// Executor answering every request through a closure of
/// `(request, call number)`. Records every request it receives.
pub struct MockExecutor {
    script: Script,
    requests: Mutex<Vec<StepRequest>>,
}

impl MockExecutor {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&StepRequest, usize) -> StepResult + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<StepRequest> {
        self.requests.lock().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn phases(&self) -> Vec<Phase> {
        self.requests.lock().iter().map(|r| r.phase).collect()
    }

    pub fn count(&self, phase: Phase) -> usize {
        self.requests.lock().iter().filter(|r| r.phase == phase).count()
    }
}

impl StepExecutor for MockExecutor {
    fn execute(&self, request: &StepRequest) -> Result<StepResult> {
        let call = {
            let mut requests = self.requests.lock();
            requests.push(request.clone());
            requests.len() - 1
        };
        Ok((self.script)(request, call))
    }

    fn energy_tolerance(&self) -> f64 {
        TOLERANCE
    }

    fn name(&self) -> &str {
        "Mock Executor"
    }
}

/// Two-atom cubic cell of side `a`.
pub fn cubic(a: f64) -> Structure {
    Structure::new(Matrix3::identity() * a)
        .with_atom("Si", Point3::new(0.0, 0.0, 0.0))
        .with_atom("Si", Point3::new(0.25 * a, 0.25 * a, 0.25 * a))
}

/// Strictly decreasing trace of `len` entries whose last gap is `final_gap`.
pub fn trace(len: usize, final_gap: f64) -> Vec<f64> {
    let mut energies: Vec<f64> = (0..len.saturating_sub(1)).map(|i| -10.0 - i as f64).collect();
    let last = energies.last().copied().unwrap_or(-10.0) - final_gap;
    energies.push(last);
    energies
}

/// Successful result echoing the requested structure.
pub fn success(request: &StepRequest, energies: Vec<f64>) -> StepResult {
    StepResult {
        success: true,
        structure: request.structure.clone(),
        initial_structure: None,
        total_energies: energies,
        forces: vec![Vector3::zeros(); request.structure.len()],
        stress: Matrix3::zeros(),
        location: request.outdir.clone(),
    }
}

pub fn failure(request: &StepRequest) -> StepResult {
    StepResult {
        success: false,
        ..success(request, Vec::new())
    }
}

pub fn driver(executor: &Arc<MockExecutor>, store: &Arc<MemoryStore>) -> Driver {
    Driver::new(executor.clone(), store.clone())
}

pub fn relative(path: &Path, outdir: &Path) -> String {
    path.strip_prefix(outdir)
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| path.display().to_string())
}
