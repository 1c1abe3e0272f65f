//! Integration tests for lazily launched sub-kernels.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::test_helpers::{
    start, test_builder, FakeLauncher, FakeTransportFactory, Journal, RecordingCloseAction,
    ScriptedEvaluator,
};
use kernel_orchestrator::kernel::Kernel;
use kernel_orchestrator::AppError;
use serde_json::json;

fn kernel_with(launcher: Arc<FakeLauncher>) -> (Arc<Kernel>, Arc<FakeTransportFactory>) {
    let journal = Journal::default();
    let factory = Arc::new(FakeTransportFactory::new());
    let kernel = test_builder(
        Arc::new(ScriptedEvaluator::new(journal.clone())),
        Arc::clone(&factory),
        RecordingCloseAction::new(journal),
    )
    .sub_kernel_launcher(launcher)
    .build()
    .expect("build");
    (kernel, factory)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creation_yields_one_manager() {
    let launcher = FakeLauncher::new(&["python"], Journal::default());
    let (kernel, _) = kernel_with(launcher);

    let tasks: Vec<_> = (0..32)
        .map(|_| {
            let kernel = Arc::clone(&kernel);
            tokio::spawn(async move { kernel.get_or_create_sub_kernel("python") })
        })
        .collect();

    let mut managers = Vec::new();
    for task in tasks {
        managers.push(task.await.expect("join"));
    }

    let first = &managers[0];
    assert!(managers.iter().all(|m| Arc::ptr_eq(m, first)));
    assert_eq!(first.name(), "python");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_entry_point_requests_launch_once() {
    let launcher = FakeLauncher::new(&["python"], Journal::default());
    let (kernel, _) = kernel_with(Arc::clone(&launcher));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let kernel = Arc::clone(&kernel);
            tokio::spawn(async move { kernel.sub_kernel_entry_point("python").await })
        })
        .collect();
    for task in tasks {
        task.await.expect("join").expect("entry point");
    }

    assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn manager_carries_evaluator_context() {
    let launcher = FakeLauncher::new(&["python"], Journal::default());
    let (kernel, _) = kernel_with(launcher);

    let manager = kernel.get_or_create_sub_kernel("python");
    assert_eq!(manager.context().session_id, "test-session");
    assert!(!manager.is_started(), "launch is lazy");
}

#[tokio::test]
async fn unresolvable_name_is_no_such_sub_kernel() {
    let launcher = FakeLauncher::new(&["python"], Journal::default());
    let (kernel, _) = kernel_with(Arc::clone(&launcher));

    let outcome = kernel.sub_kernel_entry_point("r").await;

    match outcome {
        Err(AppError::NoSuchSubKernel(name)) => assert_eq!(name, "r"),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("expected NoSuchSubKernel"),
    }
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn kernel_without_launcher_has_no_sub_kernels() {
    let journal = Journal::default();
    let kernel = test_builder(
        Arc::new(ScriptedEvaluator::new(journal.clone())),
        Arc::new(FakeTransportFactory::new()),
        RecordingCloseAction::new(journal),
    )
    .build()
    .expect("build");

    let outcome = kernel.sub_kernel_entry_point("python").await;
    assert!(matches!(outcome, Err(AppError::NoSuchSubKernel(_))));
}

#[tokio::test]
async fn entry_point_evaluates_in_sub_kernel() {
    let launcher = FakeLauncher::new(&["python"], Journal::default());
    let (kernel, _) = kernel_with(launcher);

    let entry = kernel.sub_kernel_entry_point("python").await.expect("launch");
    let value = entry.evaluate("1 + 1".into()).await.expect("evaluate");

    assert_eq!(value, json!({ "kernel": "python", "echo": "1 + 1" }));
}

#[tokio::test]
async fn shutdown_closes_every_launched_sub_kernel() {
    let journal = Journal::default();
    let launcher = FakeLauncher::new(&["a", "b", "c"], journal.clone());
    let (kernel, factory) = kernel_with(launcher);
    let runner = start(&kernel, &factory).await;

    kernel.sub_kernel_entry_point("a").await.expect("a");
    kernel.sub_kernel_entry_point("b").await.expect("b");
    // Created but never launched: nothing to shut down.
    kernel.get_or_create_sub_kernel("c");

    kernel.request_stop();
    runner.await.expect("join").expect("clean run");

    let events = journal.events();
    assert!(events.contains(&"subkernel.shutdown:a".to_owned()));
    assert!(events.contains(&"subkernel.shutdown:b".to_owned()));
    assert!(!events.contains(&"subkernel.shutdown:c".to_owned()));

    let closed = kernel.sub_kernel_entry_point("a").await;
    assert!(matches!(closed, Err(AppError::NoSuchSubKernel(_))));
}

#[tokio::test]
async fn one_failing_sub_kernel_does_not_stop_the_others() {
    let journal = Journal::default();
    let launcher = FakeLauncher::with_failing_shutdown(&["a", "b"], &["a"], journal.clone());
    let (kernel, factory) = kernel_with(launcher);
    let runner = start(&kernel, &factory).await;

    kernel.sub_kernel_entry_point("a").await.expect("a");
    kernel.sub_kernel_entry_point("b").await.expect("b");

    kernel.request_stop();
    runner.await.expect("join").expect("clean run");

    let events = journal.events();
    assert!(events.contains(&"subkernel.shutdown:a".to_owned()));
    assert!(events.contains(&"subkernel.shutdown:b".to_owned()));
    assert!(events.contains(&"evaluator.exit".to_owned()));
}
