//! Load/unload lifecycle, accounting and events.

use keel_orchestrator::backend::BackendKind;
use keel_orchestrator::events::{LifecycleEvent, Operation, UnloadReason};
use keel_orchestrator::{
    Accelerator, GIB, HardwareInfo, ModelFormat, ModelParameters, ModelRequest, ModelState,
    OrchestratorConfig, OrchestratorError, ProgressReporter,
};
use keel_testing::{
    FakeGraphEngine, FakeTransformerEngine, ModelDir, drain_events, orchestrator_on,
    orchestrator_with, test_hardware,
};
use serde_json::json;
use std::sync::Arc;

fn fakes() -> (Arc<FakeGraphEngine>, Arc<FakeTransformerEngine>) {
    (
        Arc::new(FakeGraphEngine::new()),
        Arc::new(FakeTransformerEngine::new()),
    )
}

#[tokio::test]
async fn test_load_graph_model() {
    let dir = ModelDir::new();
    let (graph, transformer) = fakes();
    let orch = orchestrator_with(OrchestratorConfig::default(), &graph, &transformer);

    let handle = orch
        .load_model(ModelRequest::new("bge", dir.onnx("bge")).with_size("small"))
        .await
        .unwrap();

    assert_eq!(handle.id, "bge");
    assert_eq!(handle.format, ModelFormat::Onnx);
    assert_eq!(handle.backend, BackendKind::Graph);
    assert_eq!(handle.accelerator, Accelerator::Cpu);
    assert_eq!(handle.state, ModelState::Ready);
    assert_eq!(handle.memory_bytes, 2 * GIB);
    assert!(handle.provider.starts_with("graph"));
    assert_eq!(graph.sessions().live(), 1);
    assert!(orch.is_model_loaded("bge"));
    assert_eq!(orch.get_handle("bge"), Some(handle));
}

#[tokio::test]
async fn test_repeated_load_returns_same_session() {
    let dir = ModelDir::new();
    let (graph, transformer) = fakes();
    let orch = orchestrator_with(OrchestratorConfig::default(), &graph, &transformer);
    let path = dir.gguf("llama");

    let first = orch
        .load_model(ModelRequest::new("llama", &path))
        .await
        .unwrap();
    let (progress, mut rx) = ProgressReporter::channel();
    let second = orch
        .load_model_with(
            ModelRequest::new("llama", &path),
            &progress,
            &Default::default(),
        )
        .await
        .unwrap();

    assert_eq!(first.session_id, second.session_id);
    assert_eq!(transformer.contexts().created(), 1);
    assert_eq!(orch.list_loaded_models().len(), 1);
    let last = std::iter::from_fn(|| rx.try_recv().ok()).last().unwrap();
    assert_eq!(last.fraction, 1.0);
}

#[tokio::test]
async fn test_reload_after_unload_gets_new_session() {
    let dir = ModelDir::new();
    let (graph, transformer) = fakes();
    let orch = orchestrator_with(OrchestratorConfig::default(), &graph, &transformer);
    let path = dir.onnx("m");

    let first = orch.load_model(ModelRequest::new("m", &path)).await.unwrap();
    assert!(orch.unload_model("m").await);
    let second = orch.load_model(ModelRequest::new("m", &path)).await.unwrap();

    assert_ne!(first.session_id, second.session_id);
    assert_eq!(graph.sessions().created(), 2);
    assert_eq!(graph.sessions().live(), 1);
}

#[tokio::test]
async fn test_unload_round_trip_restores_accounting() {
    let dir = ModelDir::new();
    let (graph, transformer) = fakes();
    let orch = orchestrator_with(OrchestratorConfig::default(), &graph, &transformer);

    orch.load_model(ModelRequest::new("base", dir.onnx("base")).with_size("base"))
        .await
        .unwrap();
    let before = orch.get_total_memory_usage();

    orch.load_model(
        ModelRequest::new("chat", dir.gguf("chat"))
            .with_size("7b")
            .with_quantization("q4_k_m"),
    )
    .await
    .unwrap();
    assert!(orch.get_total_memory_usage() > before);

    assert!(orch.unload_model("chat").await);
    assert_eq!(orch.get_total_memory_usage(), before);
    assert_eq!(transformer.contexts().live(), 0);
    assert_eq!(transformer.weights().live(), 0);
    assert!(!orch.unload_model("chat").await);
}

#[tokio::test]
async fn test_shared_weights_released_after_last_unload() {
    let dir = ModelDir::new();
    let (graph, transformer) = fakes();
    let orch = orchestrator_with(OrchestratorConfig::default(), &graph, &transformer);
    let path = dir.gguf("shared");

    let a = orch
        .load_model(ModelRequest::new("chat-a", &path).with_size("small"))
        .await
        .unwrap();
    let b = orch
        .load_model(ModelRequest::new("chat-b", &path).with_size("small"))
        .await
        .unwrap();

    assert_eq!(transformer.weights().created(), 1);
    assert_eq!(transformer.contexts().live(), 2);
    assert_eq!(orch.weight_arena().ref_count(&path), 2);
    // Each entry is charged its full estimate
    assert_eq!(
        orch.get_total_memory_usage(),
        a.memory_bytes + b.memory_bytes
    );

    assert!(orch.unload_model("chat-a").await);
    assert_eq!(transformer.weights().live(), 1);
    assert_eq!(orch.weight_arena().ref_count(&path), 1);

    assert!(orch.unload_model("chat-b").await);
    assert_eq!(transformer.weights().live(), 0);
    assert!(orch.weight_arena().is_empty());
}

#[tokio::test]
async fn test_lru_order_follows_access() {
    let dir = ModelDir::new();
    let (graph, transformer) = fakes();
    let config = OrchestratorConfig::default().with_budget(20 * GIB, 20 * GIB, GIB);
    let orch = orchestrator_with(config, &graph, &transformer);

    for id in ["a", "b", "c"] {
        orch.load_model(ModelRequest::new(id, dir.onnx(id)).with_size("base"))
            .await
            .unwrap();
    }
    // a becomes the most recent
    orch.infer(
        "a",
        keel_orchestrator::InferenceInput::Features {
            data: vec![1.0],
            shape: None,
        },
    )
    .await
    .unwrap();
    let mut rx = orch.subscribe();

    // 12 GiB resident + 8 GiB + 1 GiB buffer: one eviction needed
    orch.load_model(ModelRequest::new("d", dir.onnx("d")).with_size("medium"))
        .await
        .unwrap();

    assert!(orch.is_model_loaded("a"));
    assert!(!orch.is_model_loaded("b"));
    assert!(orch.is_model_loaded("c"));
    let evicted: Vec<_> = drain_events(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            LifecycleEvent::ModelUnloaded { model_id, reason, .. } => Some((model_id, reason)),
            _ => None,
        })
        .collect();
    assert_eq!(evicted, vec![("b".to_string(), UnloadReason::Evicted)]);
}

#[tokio::test]
async fn test_events_for_load_and_unload() {
    let dir = ModelDir::new();
    let (graph, transformer) = fakes();
    let orch = orchestrator_with(OrchestratorConfig::default(), &graph, &transformer);
    let mut rx = orch.subscribe();

    let handle = orch
        .load_model(ModelRequest::new("m", dir.onnx("m")))
        .await
        .unwrap();
    orch.unload_model("m").await;

    let events = drain_events(&mut rx);
    assert_eq!(events.len(), 2);
    match &events[0] {
        LifecycleEvent::ModelLoaded {
            model_id,
            session_id,
            memory_bytes,
            ..
        } => {
            assert_eq!(model_id, "m");
            assert_eq!(session_id, &handle.session_id);
            assert_eq!(*memory_bytes, handle.memory_bytes);
        }
        other => panic!("unexpected event {other:?}"),
    }
    match &events[1] {
        LifecycleEvent::ModelUnloaded {
            model_id,
            memory_freed,
            reason,
            ..
        } => {
            assert_eq!(model_id, "m");
            assert_eq!(*memory_freed, handle.memory_bytes);
            assert_eq!(*reason, UnloadReason::Requested);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_threshold_event_after_load() {
    let dir = ModelDir::new();
    let (graph, transformer) = fakes();
    let config = OrchestratorConfig::default().with_budget(10 * GIB, 5 * GIB, GIB);
    let orch = orchestrator_with(config, &graph, &transformer);
    let mut rx = orch.subscribe();

    orch.load_model(
        ModelRequest::new("big", dir.gguf("big")).with_option("memory_bytes", 6 * GIB),
    )
    .await
    .unwrap();

    let events = drain_events(&mut rx);
    let names: Vec<_> = events.iter().map(LifecycleEvent::name).collect();
    assert_eq!(names, vec!["model_loaded", "resource_threshold_exceeded"]);
    match &events[1] {
        LifecycleEvent::ResourceThresholdExceeded { report, .. } => {
            assert_eq!(report.current_bytes, 6 * GIB);
            assert_eq!(report.threshold_bytes, 5 * GIB);
            assert_eq!(report.max_bytes, 10 * GIB);
            assert!((report.current_percent - 60.0).abs() < 1e-9);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_load_failure_is_reported() {
    let dir = ModelDir::new();
    let graph = Arc::new(FakeGraphEngine::new().failing());
    let transformer = Arc::new(FakeTransformerEngine::new());
    let orch = orchestrator_with(OrchestratorConfig::default(), &graph, &transformer);
    let mut rx = orch.subscribe();

    let err = orch
        .load_model(ModelRequest::new("m", dir.onnx("m")))
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::ModelLoadFailure { .. }));
    assert!(!orch.is_model_loaded("m"));
    assert_eq!(orch.get_resource_usage().used_bytes, 0);
    let events = drain_events(&mut rx);
    assert!(matches!(
        events.as_slice(),
        [LifecycleEvent::ModelError {
            operation: Operation::Load,
            ..
        }]
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_model_state_through_load_attempts() {
    let dir = ModelDir::new();
    let graph = Arc::new(FakeGraphEngine::new());
    let transformer = Arc::new(
        FakeTransformerEngine::new()
            .with_weight_delay(std::time::Duration::from_millis(200))
            .failing_context(),
    );
    let orch = Arc::new(orchestrator_with(
        OrchestratorConfig::default(),
        &graph,
        &transformer,
    ));
    assert_eq!(orch.model_state("m"), ModelState::Unloaded);

    let loading = {
        let orch = Arc::clone(&orch);
        let path = dir.gguf("m");
        tokio::spawn(async move { orch.load_model(ModelRequest::new("m", path)).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(orch.model_state("m"), ModelState::Loading);
    assert!(!orch.is_model_loaded("m"));
    assert!(orch.get_handle("m").is_none());

    assert!(loading.await.unwrap().is_err());
    assert_eq!(orch.model_state("m"), ModelState::Failed);

    // A later successful attempt replaces the failure
    let handle = orch
        .load_model(ModelRequest::new("m", dir.onnx("m")))
        .await
        .unwrap();
    assert_eq!(handle.state, ModelState::Ready);
    assert_eq!(orch.model_state("m"), ModelState::Ready);

    assert!(orch.unload_model("m").await);
    assert_eq!(orch.model_state("m"), ModelState::Unloaded);
}

#[tokio::test]
async fn test_context_failure_releases_weights() {
    let dir = ModelDir::new();
    let graph = Arc::new(FakeGraphEngine::new());
    let transformer = Arc::new(FakeTransformerEngine::new().failing_context());
    let orch = orchestrator_with(OrchestratorConfig::default(), &graph, &transformer);

    let err = orch
        .load_model(ModelRequest::new("m", dir.gguf("m")))
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::ModelLoadFailure { .. }));
    assert_eq!(transformer.weights().created(), 1);
    assert_eq!(transformer.weights().live(), 0);
    assert!(orch.weight_arena().is_empty());
}

#[tokio::test]
async fn test_load_progress_is_monotonic() {
    let dir = ModelDir::new();
    let (graph, transformer) = fakes();
    let orch = orchestrator_with(OrchestratorConfig::default(), &graph, &transformer);
    let (progress, mut rx) = ProgressReporter::channel();

    orch.load_model_with(
        ModelRequest::new("llama", dir.gguf("llama")),
        &progress,
        &Default::default(),
    )
    .await
    .unwrap();

    let fractions: Vec<f32> = std::iter::from_fn(|| rx.try_recv().ok())
        .map(|p| p.fraction)
        .collect();
    assert!(fractions.len() >= 3);
    assert!(fractions.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(fractions.last().copied(), Some(1.0));
}

#[tokio::test]
async fn test_graph_falls_back_to_cpu() {
    let dir = ModelDir::new();
    let graph = Arc::new(FakeGraphEngine::new().failing_on(Accelerator::Cuda));
    let transformer = Arc::new(FakeTransformerEngine::new());
    let hardware = HardwareInfo::cpu_only()
        .with_cpu_cores(8)
        .with_accelerators([Accelerator::Cuda]);
    let orch = orchestrator_on(OrchestratorConfig::default(), hardware, &graph, &transformer);

    let handle = orch
        .load_model(ModelRequest::new("m", dir.onnx("m")))
        .await
        .unwrap();

    assert_eq!(handle.accelerator, Accelerator::Cpu);
    let tried: Vec<_> = graph.attempts().iter().map(|o| o.accelerator).collect();
    assert_eq!(tried, vec![Accelerator::Cuda, Accelerator::Cpu]);
    assert_eq!(graph.sessions().live(), 1);
}

#[tokio::test]
async fn test_transformer_offload_accounting() {
    let dir = ModelDir::new();
    let graph = Arc::new(FakeGraphEngine::new());
    let transformer = Arc::new(FakeTransformerEngine::new().with_block_count(32));
    let hardware = test_hardware().with_accelerators([Accelerator::Cuda]);
    let orch = orchestrator_on(OrchestratorConfig::default(), hardware, &graph, &transformer);

    let handle = orch
        .load_model(
            ModelRequest::new("llama", dir.gguf("llama"))
                .with_gpu_layers(16)
                .with_option("memory_bytes", 32 * GIB),
        )
        .await
        .unwrap();

    assert_eq!(handle.accelerator, Accelerator::Cuda);
    assert_eq!(transformer.weight_params()[0].gpu_layers, 16);
    let usage = orch.get_model_resource_usage("llama").unwrap();
    assert_eq!(usage.memory_bytes, 32 * GIB);
    assert_eq!(usage.accelerator_memory_bytes, 16 * GIB);
}

#[tokio::test]
async fn test_update_parameters() {
    let dir = ModelDir::new();
    let (graph, transformer) = fakes();
    let orch = orchestrator_with(OrchestratorConfig::default(), &graph, &transformer);
    let mut rx = orch.subscribe();

    let missing = orch
        .update_model_parameters("ghost", &ModelParameters::default())
        .unwrap_err();
    assert!(matches!(missing, OrchestratorError::ModelNotLoaded(_)));

    orch.load_model(ModelRequest::new("m", dir.gguf("m")))
        .await
        .unwrap();
    drain_events(&mut rx);

    let bad = ModelParameters {
        temperature: Some(3.5),
        ..Default::default()
    };
    assert!(matches!(
        orch.update_model_parameters("m", &bad),
        Err(OrchestratorError::InvalidRequest(_))
    ));

    let good = ModelParameters {
        max_tokens: Some(2),
        temperature: Some(0.2),
        custom_options: [("stop".to_string(), json!(["\n"]))].into_iter().collect(),
        ..Default::default()
    };
    assert!(orch.update_model_parameters("m", &good).unwrap());

    let result = orch.infer("m", "one two three four").await.unwrap();
    assert_eq!(result.tokens_generated, 2);

    // Caller mistakes are not lifecycle failures
    assert!(drain_events(&mut rx).is_empty());
}

#[tokio::test]
async fn test_optimize_memory_evicts_coldest_third() {
    let dir = ModelDir::new();
    let (graph, transformer) = fakes();
    let orch = orchestrator_with(OrchestratorConfig::default(), &graph, &transformer);
    assert!(!orch.optimize_memory().await);

    for id in ["a", "b", "c"] {
        orch.load_model(ModelRequest::new(id, dir.onnx(id)).with_size("tiny"))
            .await
            .unwrap();
    }
    orch.infer(
        "a",
        keel_orchestrator::InferenceInput::Features {
            data: vec![0.5],
            shape: None,
        },
    )
    .await
    .unwrap();
    let mut rx = orch.subscribe();

    assert!(orch.optimize_memory().await);

    assert!(orch.is_model_loaded("a"));
    assert!(!orch.is_model_loaded("b"));
    assert!(orch.is_model_loaded("c"));
    assert!(matches!(
        drain_events(&mut rx).as_slice(),
        [LifecycleEvent::ModelUnloaded {
            reason: UnloadReason::Optimized,
            ..
        }]
    ));
}

#[tokio::test]
async fn test_stats_and_listing() {
    let dir = ModelDir::new();
    let (graph, transformer) = fakes();
    let orch = orchestrator_with(OrchestratorConfig::default(), &graph, &transformer);

    orch.load_model(ModelRequest::new("embed", dir.onnx("embed")).with_size("tiny"))
        .await
        .unwrap();
    orch.load_model(ModelRequest::new("chat", dir.gguf("chat")).with_size("small"))
        .await
        .unwrap();

    let stats = orch.get_stats();
    assert_eq!(stats.loaded_count, 2);
    assert_eq!(stats.total_memory_bytes, 3 * GIB);
    assert_eq!(
        stats.available_memory_bytes,
        orch.config().max_memory_bytes - 3 * GIB
    );

    let mut ids: Vec<_> = orch.list_loaded_models().into_iter().map(|m| m.id).collect();
    ids.sort();
    assert_eq!(ids, vec!["chat", "embed"]);

    let info = orch.get_model_info("chat").await.unwrap();
    assert_eq!(info.format, Some(ModelFormat::Gguf));
    assert!(orch.get_model_info("ghost").await.is_none());
    assert!(matches!(
        orch.get_model_resource_usage("ghost"),
        Err(OrchestratorError::ModelNotLoaded(_))
    ));
}

#[tokio::test]
async fn test_shutdown_unloads_everything() {
    let dir = ModelDir::new();
    let (graph, transformer) = fakes();
    let orch = orchestrator_with(OrchestratorConfig::default(), &graph, &transformer);
    let mut rx = orch.subscribe();

    orch.load_model(ModelRequest::new("a", dir.onnx("a"))).await.unwrap();
    orch.load_model(ModelRequest::new("b", dir.gguf("b"))).await.unwrap();
    drain_events(&mut rx);

    assert_eq!(orch.shutdown().await, 2);

    assert_eq!(orch.get_total_memory_usage(), 0);
    assert_eq!(graph.sessions().live(), 0);
    assert_eq!(transformer.contexts().live(), 0);
    assert_eq!(transformer.weights().live(), 0);
    let reasons: Vec<_> = drain_events(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            LifecycleEvent::ModelUnloaded { reason, .. } => Some(reason),
            _ => None,
        })
        .collect();
    assert_eq!(reasons, vec![UnloadReason::Shutdown, UnloadReason::Shutdown]);
}
