//! End-to-end scenarios over the engine doubles.

use keel_orchestrator::events::{LifecycleEvent, Operation, UnloadReason};
use keel_orchestrator::{
    GIB, ModelRequest, OrchestratorConfig, OrchestratorError, ProgressReporter,
};
use keel_testing::{
    FakeGraphEngine, FakeTransformerEngine, ModelDir, drain_events, init_tracing,
    orchestrator_with,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn sized(id: &str, path: std::path::PathBuf, gib: u64) -> ModelRequest {
    ModelRequest::new(id, path).with_option("memory_bytes", gib * GIB)
}

#[tokio::test]
async fn test_eviction_frees_only_the_coldest() {
    init_tracing();
    let dir = ModelDir::new();
    let graph = Arc::new(FakeGraphEngine::new());
    let transformer = Arc::new(FakeTransformerEngine::new());
    let config = OrchestratorConfig::default().with_budget(120 * GIB, 100 * GIB, 2 * GIB);
    let orch = orchestrator_with(config, &graph, &transformer);
    let mut rx = orch.subscribe();

    orch.load_model(sized("a", dir.gguf("a"), 50)).await.unwrap();
    orch.load_model(sized("b", dir.gguf("b"), 40)).await.unwrap();
    assert_eq!(orch.get_total_memory_usage(), 90 * GIB);
    drain_events(&mut rx);

    orch.load_model(sized("c", dir.gguf("c"), 35)).await.unwrap();

    assert!(!orch.is_model_loaded("a"));
    assert!(orch.is_model_loaded("b"));
    assert!(orch.is_model_loaded("c"));
    assert_eq!(orch.get_total_memory_usage(), 75 * GIB);
    assert_eq!(transformer.contexts().live(), 2);

    let events = drain_events(&mut rx);
    let names: Vec<_> = events.iter().map(LifecycleEvent::name).collect();
    assert_eq!(names, vec!["model_unloaded", "model_loaded"]);
    match &events[0] {
        LifecycleEvent::ModelUnloaded {
            model_id,
            memory_freed,
            reason,
            ..
        } => {
            assert_eq!(model_id, "a");
            assert_eq!(*memory_freed, 50 * GIB);
            assert_eq!(*reason, UnloadReason::Evicted);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_unrecognized_file_is_rejected_before_construction() {
    let dir = ModelDir::new();
    let graph = Arc::new(FakeGraphEngine::new());
    let transformer = Arc::new(FakeTransformerEngine::new());
    let orch = orchestrator_with(OrchestratorConfig::default(), &graph, &transformer);
    let mut rx = orch.subscribe();

    let err = orch
        .load_model(ModelRequest::new("clip", dir.wav("clip")))
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::UnsupportedFormat { .. }));
    assert!(graph.attempts().is_empty());
    assert!(transformer.weight_params().is_empty());
    assert!(!orch.is_model_loaded("clip"));
    assert_eq!(orch.get_resource_usage().used_bytes, 0);

    let events = drain_events(&mut rx);
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        LifecycleEvent::ModelError {
            operation: Operation::Load,
            ..
        }
    ));
}

#[tokio::test]
async fn test_inference_never_loads_implicitly() {
    let graph = Arc::new(FakeGraphEngine::new());
    let transformer = Arc::new(FakeTransformerEngine::new());
    let orch = orchestrator_with(OrchestratorConfig::default(), &graph, &transformer);
    let mut rx = orch.subscribe();

    let err = orch.infer("never-loaded", "hello").await.unwrap_err();

    assert!(matches!(err, OrchestratorError::ModelNotLoaded(ref id) if id == "never-loaded"));
    assert!(graph.attempts().is_empty());
    assert!(transformer.weight_params().is_empty());
    assert!(drain_events(&mut rx).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_during_construction_leaves_nothing() {
    init_tracing();
    let dir = ModelDir::new();
    let graph = Arc::new(FakeGraphEngine::new());
    let transformer =
        Arc::new(FakeTransformerEngine::new().with_weight_delay(Duration::from_millis(300)));
    let orch = Arc::new(orchestrator_with(
        OrchestratorConfig::default(),
        &graph,
        &transformer,
    ));
    let mut rx = orch.subscribe();

    let ct = CancellationToken::new();
    let path = dir.gguf("slow");
    let task = {
        let orch = Arc::clone(&orch);
        let ct = ct.clone();
        tokio::spawn(async move {
            orch.load_model_with(
                ModelRequest::new("slow", path),
                &ProgressReporter::disabled(),
                &ct,
            )
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    ct.cancel();

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, OrchestratorError::Cancelled));
    assert!(!orch.is_model_loaded("slow"));
    assert_eq!(transformer.weights().created(), 1);
    assert_eq!(transformer.weights().live(), 0);
    assert_eq!(transformer.contexts().live(), 0);
    assert!(orch.weight_arena().is_empty());
    assert_eq!(orch.get_resource_usage().used_bytes, 0);

    // Cancellation is not a failure worth reporting
    assert!(drain_events(&mut rx).is_empty());

    // The id is free to load again
    let handle = orch
        .load_model(ModelRequest::new("slow", dir.gguf("slow")))
        .await
        .unwrap();
    assert_eq!(handle.id, "slow");
}

#[tokio::test]
async fn test_pre_cancelled_load_is_refused() {
    let dir = ModelDir::new();
    let graph = Arc::new(FakeGraphEngine::new());
    let transformer = Arc::new(FakeTransformerEngine::new());
    let orch = orchestrator_with(OrchestratorConfig::default(), &graph, &transformer);

    let ct = CancellationToken::new();
    ct.cancel();
    let err = orch
        .load_model_with(
            ModelRequest::new("m", dir.onnx("m")),
            &ProgressReporter::disabled(),
            &ct,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::Cancelled));
    assert!(graph.attempts().is_empty());
}

#[tokio::test]
async fn test_model_that_can_never_fit() {
    let dir = ModelDir::new();
    let graph = Arc::new(FakeGraphEngine::new());
    let transformer = Arc::new(FakeTransformerEngine::new());
    let config = OrchestratorConfig::default().with_budget(16 * GIB, 12 * GIB, GIB);
    let orch = orchestrator_with(config, &graph, &transformer);

    orch.load_model(sized("small", dir.gguf("small"), 4))
        .await
        .unwrap();
    let err = orch
        .load_model(sized("huge", dir.gguf("huge"), 20))
        .await
        .unwrap_err();

    assert!(err.is_recoverable());
    match err {
        OrchestratorError::InsufficientMemory {
            model_id, required, ..
        } => {
            assert_eq!(model_id, "huge");
            assert_eq!(required, 20 * GIB);
        }
        other => panic!("unexpected error {other:?}"),
    }
    // Futile eviction is skipped
    assert!(orch.is_model_loaded("small"));
}

