use std::cmp::Ordering;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::core::domain::Phase;
use crate::engine::checkpoint::CheckpointStore;
use crate::error::CheckpointError;

/// Summary of one intermediate step of a relaxation.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    pub phase: Phase,
    /// Step index, or strain key for epitaxial trials.
    pub name: String,
    pub location: PathBuf,
    /// None while the step has no stored result yet.
    pub success: Option<bool>,
    pub energy: Option<f64>,
    pub max_force: Option<f64>,
    pub running: bool,
}

/// Intermediate steps found under `outdir`, phase by phase, in step order.
///
/// Directories without a stored result are listed only while they are
/// marked as running.
pub fn details(store: &dyn CheckpointStore, outdir: &Path) -> Result<Vec<StepRecord>, CheckpointError> {
    let mut records = Vec::new();

    for phase in Phase::INTERMEDIATE {
        let Some(dir) = phase.dir_name() else { continue };
        let mut steps = Vec::new();

        for location in store.children(&outdir.join(dir)) {
            let name = match location.file_name() {
                Some(n) => n.to_string_lossy().to_string(),
                None => continue,
            };
            let running = store.is_running(&location);

            let record = if store.exists(&location) {
                let result = store.load(&location)?;
                StepRecord {
                    phase,
                    name,
                    success: Some(result.success),
                    energy: result.total_energy(),
                    max_force: Some(result.max_force()),
                    location,
                    running,
                }
            } else if running {
                StepRecord {
                    phase,
                    name,
                    location,
                    success: None,
                    energy: None,
                    max_force: None,
                    running,
                }
            } else {
                continue;
            };
            steps.push(record);
        }

        steps.sort_by(|a, b| step_order(&a.name, &b.name));
        records.extend(steps);
    }
    Ok(records)
}

/// Numeric order for step indices and strain keys, lexical otherwise.
fn step_order(a: &str, b: &str) -> Ordering {
    match (a.parse::<f64>(), b.parse::<f64>()) {
        (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => a.cmp(b),
    }
}

/// True while the final step or any intermediate step is executing.
pub fn is_running(store: &dyn CheckpointStore, outdir: &Path) -> Result<bool, CheckpointError> {
    if store.is_running(outdir) {
        return Ok(true);
    }
    Ok(details(store, outdir)?.iter().any(|r| r.running))
}

#[derive(Serialize)]
struct Row<'a> {
    phase: &'a str,
    step: &'a str,
    success: Option<bool>,
    energy: Option<f64>,
    max_force: Option<f64>,
    running: bool,
    location: String,
}

/// Writes one CSV row per record, with a header.
pub fn write_csv<W: Write>(records: &[StepRecord], writer: W) -> Result<(), csv::Error> {
    let mut wtr = csv::Writer::from_writer(writer);
    for r in records {
        wtr.serialize(Row {
            phase: r.phase.dir_name().unwrap_or("static"),
            step: &r.name,
            success: r.success,
            energy: r.energy,
            max_force: r.max_force,
            running: r.running,
            location: r.location.display().to_string(),
        })?;
    }
    wtr.flush()?;
    Ok(())
}
