use std::path::PathBuf;
use std::sync::Arc;

use rand::Rng;
use serde_json::json;

use relax_chain::core::config::{Criterion, RelaxConfig};
use relax_chain::core::domain::Phase;
use relax_chain::engine::checkpoint::{CheckpointStore, MemoryStore};
use relax_chain::error::RelaxError;
use relax_chain::solvers::relax::RelaxationController;
use relax_chain::solvers::{Action, Controller, Reporter};

use crate::common::{cubic, driver, failure, relative, success, trace, MockExecutor, TOLERANCE};

mod common;

fn outdir() -> PathBuf {
    PathBuf::from("/runs/si")
}

fn config(convergence: f64) -> RelaxConfig {
    RelaxConfig {
        convergence: Criterion::from(convergence),
        ..Default::default()
    }
}

#[test]
fn converged_trace_stops_each_phase_after_one_step() {
    // Scenario: every step ends with a 1e-3 eV/atom gap, criterion 1e-2 eV/atom.
    let executor = Arc::new(MockExecutor::new(|req, _| success(req, trace(5, 2.0 * 1e-3))));
    let store = Arc::new(MemoryStore::new());

    let result = driver(&executor, &store)
        .relax(&cubic(5.43), &outdir(), &config(1e-2))
        .unwrap();

    assert_eq!(executor.phases(), vec![Phase::CellShape, Phase::Ionic, Phase::Static]);
    assert_eq!(result.location, outdir());
}

#[test]
fn stops_after_the_step_whose_trace_first_satisfies_the_gap() {
    // Per-atom gap halves with each call: 0.1, 0.05, ... first below 1e-2 at call 4.
    let executor = Arc::new(MockExecutor::new(|req, call| {
        let gap = 0.1 / 2f64.powi(call as i32);
        success(req, trace(5, 2.0 * gap))
    }));
    let store = Arc::new(MemoryStore::new());
    let cfg = RelaxConfig {
        max_calls: 10,
        ..config(1e-2)
    };

    driver(&executor, &store)
        .relax(&cubic(5.43), &outdir(), &cfg)
        .unwrap();

    let dirs: Vec<String> = executor
        .requests()
        .iter()
        .map(|r| relative(&r.outdir, &outdir()))
        .collect();
    assert_eq!(
        dirs,
        vec![
            "relax_cellshape/0",
            "relax_cellshape/1",
            "relax_cellshape/2",
            "relax_cellshape/3",
            "relax_cellshape/4",
            "relax_ions/5",
            "",
        ]
    );
    assert!(executor.count(Phase::CellShape) as i64 <= cfg.max_calls);
}

#[test]
fn failed_step_aborts_immediately() {
    let executor = Arc::new(MockExecutor::new(|req, call| {
        if call == 1 {
            failure(req)
        } else {
            success(req, trace(3, 1.0))
        }
    }));
    let store = Arc::new(MemoryStore::new());

    let err = driver(&executor, &store)
        .relax(&cubic(5.43), &outdir(), &config(1e-2))
        .unwrap_err();

    match err {
        RelaxError::ExecutionFailure { location } => {
            assert_eq!(location, outdir().join("relax_cellshape").join("1"))
        }
        other => panic!("expected execution failure, got {:?}", other),
    }
    assert_eq!(executor.calls(), 2);
    assert!(!store.exists(&outdir()));
}

#[test]
fn failed_static_step_is_fatal() {
    let executor = Arc::new(MockExecutor::new(|req, _| {
        if req.phase == Phase::Static {
            failure(req)
        } else {
            success(req, trace(3, 1e-6))
        }
    }));
    let store = Arc::new(MemoryStore::new());

    let err = driver(&executor, &store)
        .relax(&cubic(5.43), &outdir(), &config(1e-2))
        .unwrap_err();
    assert!(matches!(err, RelaxError::ExecutionFailure { .. }));
}

#[test]
fn tolerated_nonconvergence_runs_every_phase() {
    let executor = Arc::new(MockExecutor::new(|req, _| success(req, trace(3, 1.0))));
    let store = Arc::new(MemoryStore::new());
    let cfg = RelaxConfig {
        max_calls: 3,
        tolerate_nonconvergence: true,
        ..config(1e-2)
    };

    let result = driver(&executor, &store)
        .relax(&cubic(5.43), &outdir(), &cfg)
        .unwrap();

    assert_eq!(executor.count(Phase::CellShape), 3);
    assert_eq!(executor.count(Phase::Ionic), 1);
    assert_eq!(executor.count(Phase::Static), 1);
    assert_eq!(result.location, outdir());
}

#[test]
fn nonconvergence_fails_between_phases() {
    let executor = Arc::new(MockExecutor::new(|req, _| success(req, trace(3, 1.0))));
    let store = Arc::new(MemoryStore::new());
    let cfg = RelaxConfig {
        max_calls: 3,
        ..config(1e-2)
    };

    let err = driver(&executor, &store)
        .relax(&cubic(5.43), &outdir(), &cfg)
        .unwrap_err();

    match err {
        RelaxError::ConvergenceFailure { phase, iterations } => {
            assert_eq!(phase, Phase::CellShape);
            assert_eq!(iterations, 3);
        }
        other => panic!("expected convergence failure, got {:?}", other),
    }
    assert_eq!(executor.phases(), vec![Phase::CellShape; 3]);
}

#[test]
fn ionic_nonconvergence_fails_before_static() {
    // Cell shape converges at once, ions never do.
    let executor = Arc::new(MockExecutor::new(|req, _| {
        let gap = if req.phase == Phase::CellShape { 1e-6 } else { 1.0 };
        success(req, trace(3, gap))
    }));
    let store = Arc::new(MemoryStore::new());
    let cfg = RelaxConfig {
        max_calls: 4,
        ..config(1e-2)
    };

    let err = driver(&executor, &store)
        .relax(&cubic(5.43), &outdir(), &cfg)
        .unwrap_err();

    assert!(matches!(
        err,
        RelaxError::ConvergenceFailure { phase: Phase::Ionic, iterations: 5 }
    ));
    assert_eq!(executor.count(Phase::CellShape), 1);
    assert_eq!(executor.count(Phase::Ionic), 4);
    assert_eq!(executor.count(Phase::Static), 0);
}

#[test]
fn phase_ceilings_hold_for_any_budget() {
    let mut rng = rand::thread_rng();
    for _ in 0..20 {
        let max_calls: i64 = rng.gen_range(1..9);
        let executor = Arc::new(MockExecutor::new(|req, _| success(req, trace(3, 1.0))));
        let store = Arc::new(MemoryStore::new());
        let cfg = RelaxConfig {
            max_calls,
            tolerate_nonconvergence: true,
            relaxation: vec![Phase::CellShape, Phase::Ionic, Phase::ExtraPhase],
            ..config(1e-2)
        };

        driver(&executor, &store)
            .relax(&cubic(5.43), &outdir(), &cfg)
            .unwrap();

        assert!(executor.count(Phase::CellShape) as i64 <= max_calls);
        assert!(executor.count(Phase::Ionic) as i64 <= max_calls + 1);
        assert_eq!(executor.count(Phase::ExtraPhase), 1);
        assert_eq!(executor.count(Phase::Static), 1);
        assert_eq!(executor.calls() as i64, max_calls + 3);
    }
}

#[test]
fn ionic_only_mode_skips_cell_shape() {
    let executor = Arc::new(MockExecutor::new(|req, _| success(req, trace(2, 1e-6))));
    let store = Arc::new(MemoryStore::new());
    let cfg = RelaxConfig {
        relaxation: vec![Phase::Ionic],
        ..config(1e-2)
    };

    driver(&executor, &store)
        .relax(&cubic(5.43), &outdir(), &cfg)
        .unwrap();

    let requests = executor.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].outdir, outdir().join("relax_ions").join("0"));
    assert_eq!(requests[0].relaxation, vec![Phase::Ionic]);
}

#[test]
fn cell_shape_steps_request_the_full_mode() {
    let executor = Arc::new(MockExecutor::new(|req, _| success(req, trace(2, 1e-6))));
    let store = Arc::new(MemoryStore::new());

    driver(&executor, &store)
        .relax(&cubic(5.43), &outdir(), &config(1e-2))
        .unwrap();

    let requests = executor.requests();
    assert_eq!(requests[0].relaxation, vec![Phase::CellShape, Phase::Ionic]);
    assert_eq!(requests[1].relaxation, vec![Phase::Ionic]);
    assert_eq!(requests[2].relaxation, vec![Phase::Static]);
}

#[test]
fn min_steps_holds_back_early_convergence() {
    // Every trace is converged; only min_steps keeps the cell shape going.
    let executor = Arc::new(MockExecutor::new(|req, _| success(req, trace(3, 1e-6))));
    let store = Arc::new(MemoryStore::new());
    let cfg = RelaxConfig {
        min_steps: 3,
        ..config(1e-2)
    };

    driver(&executor, &store)
        .relax(&cubic(5.43), &outdir(), &cfg)
        .unwrap();

    // The step index carries into the ionic phase, past min_steps already.
    let dirs: Vec<String> = executor
        .requests()
        .iter()
        .map(|r| relative(&r.outdir, &outdir()))
        .collect();
    assert_eq!(
        dirs,
        vec![
            "relax_cellshape/0",
            "relax_cellshape/1",
            "relax_cellshape/2",
            "relax_ions/3",
            "",
        ]
    );
}

#[test]
fn first_trial_applies_once_and_skips_the_check() {
    let executor = Arc::new(MockExecutor::new(|req, _| success(req, trace(3, 1e-6))));
    let store = Arc::new(MemoryStore::new());
    let mut cfg = config(1e-2);
    cfg.params.insert("encut".into(), json!(1.3));
    cfg.first_trial.insert("kpoints".into(), json!("gamma"));

    driver(&executor, &store)
        .relax(&cubic(5.43), &outdir(), &cfg)
        .unwrap();

    let requests = executor.requests();
    assert_eq!(
        executor.phases(),
        vec![Phase::CellShape, Phase::CellShape, Phase::Ionic, Phase::Static]
    );
    assert_eq!(requests[0].params.get("kpoints"), Some(&json!("gamma")));
    for r in &requests[1..] {
        assert!(r.params.get("kpoints").is_none());
        assert_eq!(r.params.get("encut"), Some(&json!(1.3)));
    }
}

#[test]
fn steps_chain_structures_and_restarts() {
    // Each step shrinks the cell by 1%.
    let executor = Arc::new(MockExecutor::new(|req, call| {
        let mut r = success(req, trace(3, if call < 2 { 1.0 } else { 1e-6 }));
        r.structure.cell *= 0.99;
        r
    }));
    let store = Arc::new(MemoryStore::new());
    let original = cubic(5.43);
    let pristine = original.clone();

    driver(&executor, &store)
        .relax(&original, &outdir(), &config(1e-2))
        .unwrap();

    assert_eq!(original, pristine);
    let requests = executor.requests();
    assert_eq!(requests[0].structure, pristine);
    assert!(requests[0].restart.is_none());
    for pair in requests.windows(2) {
        let restart = pair[1].restart.as_ref().expect("restart from previous step");
        assert_eq!(restart.location, pair[0].outdir);
        assert_eq!(pair[1].structure, restart.structure);
    }
}

#[test]
fn discarding_steps_keeps_only_the_final_record() {
    let executor = Arc::new(MockExecutor::new(|req, call| {
        success(req, trace(3, if call < 2 { 1.0 } else { 1e-6 }))
    }));
    let store = Arc::new(MemoryStore::new());
    let cfg = RelaxConfig {
        keep_steps: false,
        ..config(1e-2)
    };

    driver(&executor, &store)
        .relax(&cubic(5.43), &outdir(), &cfg)
        .unwrap();

    assert_eq!(store.locations(), vec![outdir()]);
}

#[test]
fn kept_steps_are_all_stored() {
    let executor = Arc::new(MockExecutor::new(|req, _| success(req, trace(3, 1e-6))));
    let store = Arc::new(MemoryStore::new());

    driver(&executor, &store)
        .relax(&cubic(5.43), &outdir(), &config(1e-2))
        .unwrap();

    assert_eq!(store.len(), 3);
    assert!(store.exists(&outdir().join("relax_cellshape").join("0")));
    assert!(store.exists(&outdir().join("relax_ions").join("1")));
}

#[test]
fn rerun_reuses_completed_steps() {
    let store = Arc::new(MemoryStore::new());

    let flaky = Arc::new(MockExecutor::new(|req, call| {
        if call == 2 {
            failure(req)
        } else {
            success(req, trace(3, 1.0))
        }
    }));
    assert!(driver(&flaky, &store)
        .relax(&cubic(5.43), &outdir(), &config(1e-2))
        .is_err());

    let steady = Arc::new(MockExecutor::new(|req, _| success(req, trace(3, 1e-6))));
    driver(&steady, &store)
        .relax(&cubic(5.43), &outdir(), &config(1e-2))
        .unwrap();

    // Steps 0 and 1 came from the store; the failed step 2 ran again.
    let first = &steady.requests()[0];
    assert_eq!(first.outdir, outdir().join("relax_cellshape").join("2"));

    let again = Arc::new(MockExecutor::new(|req, _| success(req, trace(3, 1e-6))));
    driver(&again, &store)
        .relax(&cubic(5.43), &outdir(), &config(1e-2))
        .unwrap();
    assert_eq!(again.calls(), 0);
}

#[test]
fn rejects_criterion_below_tolerance_before_any_step() {
    let executor = Arc::new(MockExecutor::new(|req, _| success(req, trace(3, 1e-6))));
    let store = Arc::new(MemoryStore::new());

    let err = driver(&executor, &store)
        .relax(&cubic(5.43), &outdir(), &config(TOLERANCE / 10.0))
        .unwrap_err();

    assert!(matches!(err, RelaxError::Configuration(_)));
    assert_eq!(executor.calls(), 0);
}

#[test]
fn controller_rejects_out_of_order_messages() {
    let mut controller = RelaxationController::new(
        &cubic(5.43),
        outdir(),
        &config(1e-2),
        TOLERANCE,
        Reporter::new(),
    )
    .unwrap();

    let request = match controller.step(None).unwrap() {
        Action::Run(r) => r,
        Action::Done(_) => panic!("relaxation cannot finish before any step"),
    };
    assert!(matches!(
        controller.step(None),
        Err(RelaxError::Protocol(_))
    ));
    // The outstanding request is kept and still accepts its result.
    match controller.step(Some(success(&request, trace(3, 1e-6)))).unwrap() {
        Action::Run(next) => {
            assert_eq!(next.phase, Phase::Ionic);
            assert_eq!(next.outdir, outdir().join("relax_ions").join("1"));
        }
        Action::Done(_) => panic!("ionic phase must follow"),
    }

    let mut fresh = RelaxationController::new(
        &cubic(5.43),
        outdir(),
        &config(1e-2),
        TOLERANCE,
        Reporter::new(),
    )
    .unwrap();
    assert!(matches!(
        fresh.step(Some(success(&request, vec![]))),
        Err(RelaxError::Protocol(_))
    ));
}

#[test]
fn batch_runs_are_independent() {
    let executor = Arc::new(MockExecutor::new(|req, _| success(req, trace(3, 1e-6))));
    let store = Arc::new(MemoryStore::new());
    let jobs: Vec<_> = (0..4)
        .map(|i| (cubic(5.0 + i as f64 * 0.1), outdir().join(format!("job{}", i))))
        .collect();

    let results = driver(&executor, &store).relax_batch(&jobs, &config(1e-2));

    assert_eq!(results.len(), 4);
    for (result, (_, dir)) in results.iter().zip(&jobs) {
        assert_eq!(&result.as_ref().unwrap().location, dir);
    }
    assert_eq!(executor.calls(), 12);
}
