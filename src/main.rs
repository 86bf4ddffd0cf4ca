use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use crossbeam_channel::unbounded;
use log::info;

use relax_chain::analysis::history;
use relax_chain::core::config::{EpitaxialConfig, RelaxConfig};
use relax_chain::core::domain::Structure;
use relax_chain::engine::checkpoint::{CheckpointStore, FsCheckpointStore};
use relax_chain::engine::driver::Driver;
use relax_chain::engine::external::process::ProcessExecutor;
use relax_chain::solvers::{RelaxEvent, Reporter};

// --- CLI Definitions ---

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// Cell shape, then ions, then a static calculation.
    Relax,
    /// Interleaved cell-shape and ionic steps.
    Training,
    /// Strain search along one direction.
    Epitaxial,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Chained structural relaxations around an external step program", long_about = None)]
struct Args {
    /// Relaxation procedure to run
    #[arg(short, long, value_enum, default_value_t = Mode::Relax)]
    mode: Mode,

    /// Input structure (JSON)
    #[arg(short, long)]
    structure: PathBuf,

    /// Output directory; completed steps found there are reused
    #[arg(short, long, default_value = ".")]
    outdir: PathBuf,

    /// Relaxation or epitaxial settings (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Program run for every step
    #[arg(short, long)]
    program: String,

    /// Energy resolution of the step program (eV)
    #[arg(short, long, default_value_t = 1e-4)]
    tolerance: f64,

    /// Write a CSV summary of the intermediate steps here when done
    #[arg(long)]
    history: Option<PathBuf>,
}

fn load_structure(path: &Path) -> Result<Structure> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read structure {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Failed to parse structure {}", path.display()))
}

/// Resolves a program given as a relative path, since steps run inside
/// their own directories.
fn resolve_program(program: &str) -> String {
    let path = PathBuf::from(program);
    if path.components().count() > 1 {
        if let Ok(abs) = path.canonicalize() {
            return abs.display().to_string();
        }
    }
    program.to_string()
}

fn describe(event: &RelaxEvent) -> Option<String> {
    match event {
        RelaxEvent::Log { message, .. } => Some(message.clone()),
        RelaxEvent::PhaseEntered { phase, .. } => Some(format!("entering {} phase", phase)),
        RelaxEvent::StepRequested { location, .. } => Some(format!("running {}", location.display())),
        RelaxEvent::StepReused { location, .. } => {
            Some(format!("reusing completed step {}", location.display()))
        }
        RelaxEvent::StepCompleted {
            location,
            energy,
            max_force,
            ..
        } => Some(format!(
            "done {}: E = {} eV, max|F| = {:.4} eV/Å",
            location.display(),
            energy.map(|e| format!("{:.6}", e)).unwrap_or_else(|| "n/a".into()),
            max_force
        )),
        RelaxEvent::Finished { .. } => None,
    }
}

// --- Main ---

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let structure = load_structure(&args.structure)?;
    std::fs::create_dir_all(&args.outdir)
        .with_context(|| format!("Failed to create {}", args.outdir.display()))?;
    let outdir = args.outdir.canonicalize()?;

    let executor = Arc::new(ProcessExecutor::new(&resolve_program(&args.program), args.tolerance));
    let store: Arc<dyn CheckpointStore> = Arc::new(FsCheckpointStore::new());

    let (tx, rx) = unbounded();
    let driver = Driver::new(executor, store.clone()).with_reporter(Reporter::with_channel(tx));

    let mode = args.mode;
    let config_path = args.config.clone();
    let worker_outdir = outdir.clone();

    // The driver owns the only sender; the event loop ends when it is dropped.
    let worker = thread::Builder::new()
        .name("Relax-Worker".to_string())
        .spawn(move || -> Result<()> {
            let result = match mode {
                Mode::Relax | Mode::Training => {
                    let config = match &config_path {
                        Some(p) => RelaxConfig::from_json_file(p)?,
                        None => RelaxConfig::default(),
                    };
                    if matches!(mode, Mode::Relax) {
                        driver.relax(&structure, &worker_outdir, &config)?
                    } else {
                        driver.training(&structure, &worker_outdir, &config)?
                    }
                }
                Mode::Epitaxial => {
                    let config = match &config_path {
                        Some(p) => EpitaxialConfig::from_json_file(p)?,
                        None => EpitaxialConfig::default(),
                    };
                    driver.epitaxial(&structure, &worker_outdir, &config)?
                }
            };
            info!(
                "final energy: {}",
                result
                    .total_energy()
                    .map(|e| format!("{:.6} eV", e))
                    .unwrap_or_else(|| "n/a".into())
            );
            Ok(())
        })?;

    // Event Loop
    for event in rx {
        if let Some(line) = describe(&event) {
            info!("{}", line);
        }
    }

    let outcome = worker
        .join()
        .map_err(|_| anyhow!("Relaxation worker panicked"))?;

    if let Some(path) = &args.history {
        let records = history::details(store.as_ref(), &outdir)?;
        let file = std::fs::File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        history::write_csv(&records, file)?;
        info!("wrote {} step records to {}", records.len(), path.display());
    }

    outcome
}
