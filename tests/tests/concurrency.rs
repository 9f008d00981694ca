//! Concurrent loads, inference gating and admission.

use futures::future::join_all;
use keel_orchestrator::events::{LifecycleEvent, UnloadReason};
use keel_orchestrator::{
    GIB, InferenceInput, ModelOrchestrator, ModelRequest, ModelState, OrchestratorConfig,
    OrchestratorError, ProgressReporter,
};
use keel_testing::{
    FakeGraphEngine, FakeTransformerEngine, ModelDir, drain_events, init_tracing,
    orchestrator_with,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn features() -> InferenceInput {
    InferenceInput::Features {
        data: vec![1.0, 2.0, 3.0],
        shape: None,
    }
}

async fn spawn_infers(
    orch: &Arc<ModelOrchestrator>,
    ids: &[&str],
) -> Vec<Result<keel_orchestrator::InferenceResult, OrchestratorError>> {
    let tasks: Vec<_> = ids
        .iter()
        .map(|id| {
            let orch = Arc::clone(orch);
            let id = id.to_string();
            tokio::spawn(async move { orch.infer(&id, features()).await })
        })
        .collect();
    join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.expect("inference task panicked"))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicate_loads_build_once() {
    init_tracing();
    let dir = ModelDir::new();
    let graph = Arc::new(FakeGraphEngine::new());
    let transformer =
        Arc::new(FakeTransformerEngine::new().with_weight_delay(Duration::from_millis(100)));
    let orch = Arc::new(orchestrator_with(
        OrchestratorConfig::default(),
        &graph,
        &transformer,
    ));
    let path = dir.gguf("llama");

    let tasks: Vec<_> = (0..5)
        .map(|_| {
            let orch = Arc::clone(&orch);
            let path = path.clone();
            tokio::spawn(async move { orch.load_model(ModelRequest::new("llama", path)).await })
        })
        .collect();
    let handles: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    assert!(
        handles
            .iter()
            .all(|h| h.session_id == handles[0].session_id)
    );
    assert_eq!(transformer.weights().created(), 1);
    assert_eq!(transformer.contexts().created(), 1);
    assert_eq!(orch.list_loaded_models().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_loads_respect_budget() {
    init_tracing();
    let dir = ModelDir::new();
    let graph = Arc::new(FakeGraphEngine::new());
    let transformer =
        Arc::new(FakeTransformerEngine::new().with_weight_delay(Duration::from_millis(150)));
    let config = OrchestratorConfig::default().with_budget(10 * GIB, 10 * GIB, GIB);
    let orch = Arc::new(orchestrator_with(config, &graph, &transformer));

    let tasks: Vec<_> = ["a", "b", "c", "d"]
        .into_iter()
        .map(|id| {
            let orch = Arc::clone(&orch);
            let path = dir.gguf(id);
            tokio::spawn(async move {
                orch.load_model(
                    ModelRequest::new(id, path).with_option("memory_bytes", 4 * GIB),
                )
                .await
            })
        })
        .collect();
    let results: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    for result in &results {
        match result {
            Ok(_) | Err(OrchestratorError::InsufficientMemory { .. }) => {}
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }
    assert!(results.iter().any(Result::is_ok));
    // Reserved plus committed bytes never exceed max - buffer (9 GiB)
    assert!(transformer.weights().peak() <= 2);
    assert!(orch.get_total_memory_usage() <= 9 * GIB);
    assert_eq!(
        orch.list_loaded_models().len(),
        transformer.contexts().live()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exclusive_session_serializes_runs() {
    let dir = ModelDir::new();
    let graph = Arc::new(FakeGraphEngine::new().with_run_delay(Duration::from_millis(100)));
    let transformer = Arc::new(FakeTransformerEngine::new());
    let config = OrchestratorConfig::default().with_inference_concurrency(4);
    let orch = Arc::new(orchestrator_with(config, &graph, &transformer));
    orch.load_model(ModelRequest::new("m", dir.onnx("m")))
        .await
        .unwrap();

    let results = spawn_infers(&orch, &["m", "m", "m"]).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(graph.runs().created(), 3);
    assert_eq!(graph.runs().peak(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_safe_session_runs_in_parallel() {
    let dir = ModelDir::new();
    let graph = Arc::new(
        FakeGraphEngine::new()
            .concurrent(true)
            .with_run_delay(Duration::from_millis(200)),
    );
    let transformer = Arc::new(FakeTransformerEngine::new());
    let config = OrchestratorConfig::default().with_inference_concurrency(4);
    let orch = Arc::new(orchestrator_with(config, &graph, &transformer));
    orch.load_model(ModelRequest::new("m", dir.onnx("m")))
        .await
        .unwrap();

    let results = spawn_infers(&orch, &["m", "m", "m"]).await;

    assert!(results.iter().all(Result::is_ok));
    assert!(graph.runs().peak() >= 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_permit_serializes_across_models() {
    let dir = ModelDir::new();
    let graph = Arc::new(
        FakeGraphEngine::new()
            .concurrent(true)
            .with_run_delay(Duration::from_millis(80)),
    );
    let transformer = Arc::new(FakeTransformerEngine::new());
    let config = OrchestratorConfig::default().with_inference_concurrency(1);
    let orch = Arc::new(orchestrator_with(config, &graph, &transformer));
    assert_eq!(orch.inference_capacity(), 1);
    for id in ["a", "b"] {
        orch.load_model(ModelRequest::new(id, dir.onnx(id)).with_size("tiny"))
            .await
            .unwrap();
    }

    let results = spawn_infers(&orch, &["a", "b", "a", "b"]).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(graph.runs().peak(), 1);
}

#[tokio::test]
async fn test_default_capacity_follows_cores() {
    let graph = Arc::new(FakeGraphEngine::new());
    let transformer = Arc::new(FakeTransformerEngine::new());
    let orch = orchestrator_with(OrchestratorConfig::default(), &graph, &transformer);
    // test hardware reports 8 cores
    assert_eq!(orch.inference_capacity(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unload_waits_for_inflight_inference() {
    let dir = ModelDir::new();
    let graph = Arc::new(FakeGraphEngine::new().with_run_delay(Duration::from_millis(300)));
    let transformer = Arc::new(FakeTransformerEngine::new());
    let orch = Arc::new(orchestrator_with(
        OrchestratorConfig::default(),
        &graph,
        &transformer,
    ));
    orch.load_model(ModelRequest::new("m", dir.onnx("m")))
        .await
        .unwrap();

    let inflight = {
        let orch = Arc::clone(&orch);
        tokio::spawn(async move { orch.infer("m", features()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(graph.runs().live(), 1);

    let started = Instant::now();
    assert!(orch.unload_model("m").await);
    assert!(started.elapsed() >= Duration::from_millis(150));

    let result = inflight.await.unwrap().unwrap();
    assert_eq!(result.model_id, "m");
    assert_eq!(graph.sessions().live(), 0);

    let err = orch.infer("m", features()).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::ModelNotLoaded(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_during_generation() {
    let dir = ModelDir::new();
    let graph = Arc::new(FakeGraphEngine::new());
    let transformer =
        Arc::new(FakeTransformerEngine::new().with_token_delay(Duration::from_millis(25)));
    let orch = Arc::new(orchestrator_with(
        OrchestratorConfig::default(),
        &graph,
        &transformer,
    ));
    orch.load_model(ModelRequest::new("chat", dir.gguf("chat")))
        .await
        .unwrap();
    let mut rx = orch.subscribe();

    let prompt = vec!["word"; 40].join(" ");
    let ct = CancellationToken::new();
    let task = {
        let orch = Arc::clone(&orch);
        let ct = ct.clone();
        tokio::spawn(
            async move { orch.infer_with("chat", InferenceInput::Text(prompt), &ct).await },
        )
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    ct.cancel();

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, OrchestratorError::Cancelled));
    assert!(drain_events(&mut rx).is_empty());

    // The context is still usable afterwards
    assert!(orch.is_model_loaded("chat"));
    let result = orch.infer("chat", "short reply").await.unwrap();
    assert_eq!(result.output.as_text(), Some("short reply"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_abandoned_unload_keeps_model_loaded() {
    let dir = ModelDir::new();
    let graph = Arc::new(FakeGraphEngine::new().with_run_delay(Duration::from_millis(300)));
    let transformer = Arc::new(FakeTransformerEngine::new());
    let orch = Arc::new(orchestrator_with(
        OrchestratorConfig::default(),
        &graph,
        &transformer,
    ));
    orch.load_model(ModelRequest::new("m", dir.onnx("m")))
        .await
        .unwrap();
    let usage = orch.get_total_memory_usage();

    let inflight = {
        let orch = Arc::clone(&orch);
        tokio::spawn(async move { orch.infer("m", features()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let abandoned = tokio::time::timeout(Duration::from_millis(20), orch.unload_model("m")).await;
    assert!(abandoned.is_err());
    assert!(orch.is_model_loaded("m"));
    assert_eq!(orch.model_state("m"), ModelState::Ready);
    assert_eq!(orch.get_total_memory_usage(), usage);

    inflight.await.unwrap().unwrap();
    orch.infer("m", features()).await.unwrap();

    assert!(orch.unload_model("m").await);
    assert_eq!(graph.sessions().live(), 0);
    assert_eq!(orch.get_total_memory_usage(), 0);
    orch.load_model(ModelRequest::new("m", dir.onnx("m")))
        .await
        .unwrap();
    assert_eq!(graph.sessions().live(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_abandoned_load_keeps_busy_victim() {
    let dir = ModelDir::new();
    let graph = Arc::new(FakeGraphEngine::new().with_run_delay(Duration::from_millis(300)));
    let transformer = Arc::new(FakeTransformerEngine::new());
    let config = OrchestratorConfig::default().with_budget(10 * GIB, 10 * GIB, GIB);
    let orch = Arc::new(orchestrator_with(config, &graph, &transformer));
    orch.load_model(ModelRequest::new("a", dir.onnx("a")).with_option("memory_bytes", 6 * GIB))
        .await
        .unwrap();

    let inflight = {
        let orch = Arc::clone(&orch);
        tokio::spawn(async move { orch.infer("a", features()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // b needs a evicted, and a is busy
    let b = || ModelRequest::new("b", dir.gguf("b")).with_option("memory_bytes", 6 * GIB);
    let abandoned = tokio::time::timeout(Duration::from_millis(20), orch.load_model(b())).await;
    assert!(abandoned.is_err());
    assert!(orch.is_model_loaded("a"));
    assert_eq!(orch.get_total_memory_usage(), 6 * GIB);
    assert_eq!(orch.get_resource_usage().used_bytes, 6 * GIB);

    inflight.await.unwrap().unwrap();
    orch.load_model(b()).await.unwrap();
    assert!(!orch.is_model_loaded("a"));
    assert_eq!(graph.sessions().live(), 0);
    assert_eq!(orch.get_total_memory_usage(), 6 * GIB);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dropped_inference_holds_gate_until_run_ends() {
    let dir = ModelDir::new();
    let graph = Arc::new(FakeGraphEngine::new().with_run_delay(Duration::from_millis(300)));
    let transformer = Arc::new(FakeTransformerEngine::new());
    let config = OrchestratorConfig::default().with_inference_concurrency(4);
    let orch = Arc::new(orchestrator_with(config, &graph, &transformer));
    orch.load_model(ModelRequest::new("m", dir.onnx("m")))
        .await
        .unwrap();

    let dropped = tokio::time::timeout(Duration::from_millis(30), orch.infer("m", features())).await;
    assert!(dropped.is_err());

    let started = Instant::now();
    orch.infer("m", features()).await.unwrap();
    // Queued behind the orphaned run, never beside it
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(graph.runs().created(), 2);
    assert_eq!(graph.runs().peak(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dropped_inference_stops_generation() {
    let dir = ModelDir::new();
    let graph = Arc::new(FakeGraphEngine::new());
    let transformer =
        Arc::new(FakeTransformerEngine::new().with_token_delay(Duration::from_millis(25)));
    let orch = orchestrator_with(OrchestratorConfig::default(), &graph, &transformer);
    orch.load_model(ModelRequest::new("chat", dir.gguf("chat")))
        .await
        .unwrap();

    let prompt = vec!["word"; 40].join(" ");
    let dropped = tokio::time::timeout(
        Duration::from_millis(60),
        orch.infer("chat", InferenceInput::Text(prompt)),
    )
    .await;
    assert!(dropped.is_err());

    // The orphaned generation gives up at its next token
    let started = Instant::now();
    let result = orch.infer("chat", "ok").await.unwrap();
    assert_eq!(result.output.as_text(), Some("ok"));
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancelled_eviction_keeps_earlier_victims_unloaded() {
    let dir = ModelDir::new();
    let graph = Arc::new(FakeGraphEngine::new().with_run_delay(Duration::from_millis(300)));
    let transformer = Arc::new(FakeTransformerEngine::new());
    let config = OrchestratorConfig::default().with_budget(10 * GIB, 10 * GIB, GIB);
    let orch = Arc::new(orchestrator_with(config, &graph, &transformer));
    orch.load_model(ModelRequest::new("idle", dir.gguf("idle")).with_option("memory_bytes", 3 * GIB))
        .await
        .unwrap();
    orch.load_model(ModelRequest::new("busy", dir.onnx("busy")).with_option("memory_bytes", 3 * GIB))
        .await
        .unwrap();
    let inflight = {
        let orch = Arc::clone(&orch);
        tokio::spawn(async move { orch.infer("busy", features()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut rx = orch.subscribe();

    // 6 + 7 + 1 > 10: both resident models have to go
    let ct = CancellationToken::new();
    let cancel = {
        let ct = ct.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            ct.cancel();
        })
    };
    let err = orch
        .load_model_with(
            ModelRequest::new("big", dir.gguf("big")).with_option("memory_bytes", 7 * GIB),
            &ProgressReporter::disabled(),
            &ct,
        )
        .await
        .unwrap_err();
    cancel.await.unwrap();

    assert!(matches!(err, OrchestratorError::Cancelled));
    assert!(!orch.is_model_loaded("idle"));
    assert!(orch.is_model_loaded("busy"));
    assert!(!orch.is_model_loaded("big"));
    assert_eq!(orch.get_total_memory_usage(), 3 * GIB);
    assert_eq!(transformer.contexts().live(), 0);
    assert!(matches!(
        drain_events(&mut rx).as_slice(),
        [LifecycleEvent::ModelUnloaded {
            reason: UnloadReason::Evicted,
            ..
        }]
    ));

    inflight.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_shutdown_rejects_new_inference() {
    let dir = ModelDir::new();
    let graph = Arc::new(FakeGraphEngine::new());
    let transformer = Arc::new(FakeTransformerEngine::new());
    let orch = orchestrator_with(OrchestratorConfig::default(), &graph, &transformer);
    orch.load_model(ModelRequest::new("m", dir.onnx("m")))
        .await
        .unwrap();

    orch.shutdown().await;

    let err = orch.infer("m", features()).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::ModelNotLoaded(_)));
}
