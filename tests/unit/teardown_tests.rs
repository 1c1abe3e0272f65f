//! Unit tests for ordered, best-effort teardown.

use std::sync::{Arc, Mutex};

use kernel_orchestrator::kernel::lifecycle::{
    run_teardown, CloseKernelAction, KeepProcess, TeardownStep,
};
use kernel_orchestrator::{AppError, Result};

fn exploding_step() -> Result<()> {
    panic!("step exploded");
}

#[tokio::test]
async fn steps_run_in_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let step = |name: &'static str| {
        let log = Arc::clone(&log);
        TeardownStep::new(
            name,
            Box::pin(async move {
                log.lock().unwrap().push(name);
                Ok(())
            }),
        )
    };

    let report = run_teardown(vec![step("one"), step("two"), step("three")]).await;

    assert!(report.is_clean());
    assert_eq!(*log.lock().unwrap(), vec!["one", "two", "three"]);
}

#[tokio::test]
async fn errors_and_panics_are_collected_and_later_steps_run() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let last_log = Arc::clone(&log);

    let steps = vec![
        TeardownStep::new(
            "fails",
            Box::pin(async { Err::<(), _>(AppError::Teardown("nope".into())) }),
        ),
        TeardownStep::new(
            "panics",
            Box::pin(async { exploding_step() }),
        ),
        TeardownStep::new(
            "runs",
            Box::pin(async move {
                last_log.lock().unwrap().push("runs");
                Ok(())
            }),
        ),
    ];

    let report = run_teardown(steps).await;

    assert_eq!(*log.lock().unwrap(), vec!["runs"]);
    let names: Vec<&str> = report.failures.iter().map(|(name, _)| *name).collect();
    assert_eq!(names, vec!["fails", "panics"]);
    match &report.failures[1].1 {
        AppError::Teardown(msg) => assert!(msg.contains("step exploded")),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn steps_are_lazy_until_run() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let early = Arc::clone(&log);
    let step = TeardownStep::new(
        "lazy",
        Box::pin(async move {
            early.lock().unwrap().push("ran");
            Ok(())
        }),
    );

    assert!(log.lock().unwrap().is_empty());
    run_teardown(vec![step]).await;
    assert_eq!(*log.lock().unwrap(), vec!["ran"]);
}

#[test]
fn keep_process_close_action_is_a_no_op() {
    KeepProcess.close().expect("no-op close");
}
