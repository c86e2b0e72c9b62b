//! End-to-end tests through the public engine API

use std::sync::Arc;

use adalloc_engine::{
    AllocationEngine, EngineConfig, InMemoryEventLog, InMemorySnapshotStore, JsonFileStore,
    JsonlEventLog, LinearModel, ModelStage, OutcomeMetrics, PromotionDecision, SnapshotStore,
    TestSet, VariantId,
};
use adalloc_engine::evaluation::InMemoryArtifactLoader;
use adalloc_engine::types::{FeatureVector, Feedback};
use rand::SeedableRng;
use rand::rngs::StdRng;

fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.decay.enabled = false;
    config.storage.initial_backoff_ms = 1;
    config
}

#[tokio::test]
async fn test_winning_variant_dominates_selection() {
    let engine = AllocationEngine::in_memory(config()).await.unwrap();
    let converted = OutcomeMetrics::with_revenue(50.0);
    for _ in 0..10 {
        engine
            .update_variant("A", 1.0, 10.0, Some(&converted))
            .unwrap();
        engine.update_variant("B", 0.0, 10.0, None).unwrap();
    }

    let mut rng = StdRng::seed_from_u64(7);
    let wins = (0..100)
        .filter(|_| {
            engine
                .select_variant_with_rng(None, &mut rng)
                .unwrap()
                .variant_id
                .as_str()
                == "A"
        })
        .count();
    assert!(wins >= 95, "A selected {wins}/100 times");
    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_updates_are_not_lost() {
    let engine = Arc::new(AllocationEngine::in_memory(config()).await.unwrap());
    let mut tasks = Vec::new();
    for _ in 0..100 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            engine.update_variant("A", 1.0, 1.0, None).unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let stats = engine.get_variant_stats("A").unwrap();
    assert_eq!(stats.alpha, 101.0);
    assert_eq!(stats.beta, 1.0);
    assert!((stats.spend - 100.0).abs() < 1e-9);

    let engine = Arc::into_inner(engine).unwrap();
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_pool_selection_and_unknown_ids() {
    let engine = AllocationEngine::in_memory(config()).await.unwrap();
    engine.register_variant("A").unwrap();
    engine.register_variant("B").unwrap();

    let pool = vec![VariantId::new("B").unwrap()];
    for _ in 0..10 {
        let decision = engine.select_variant(Some(&pool)).unwrap();
        assert_eq!(decision.variant_id.as_str(), "B");
        assert_eq!(decision.candidates, 1);
    }

    let unknown = vec![VariantId::new("Z").unwrap()];
    assert!(engine.select_variant(Some(&unknown)).is_err());
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_state_survives_restart_despite_transient_failures() {
    let snapshots = Arc::new(InMemorySnapshotStore::new());
    let events = Arc::new(InMemoryEventLog::new());

    let engine = AllocationEngine::builder(config())
        .snapshot_store(snapshots.clone())
        .event_log(events.clone())
        .start()
        .await
        .unwrap();

    // Fewer than storage.max_retries, so every batch eventually lands
    snapshots.fail_next_writes(2);
    for _ in 0..3 {
        engine
            .update_variant("A", 1.0, 4.0, Some(&OutcomeMetrics::with_revenue(10.0)))
            .unwrap();
    }
    engine.update_variant("B", 0.0, 4.0, None).unwrap();
    engine
        .feedback(&Feedback {
            ad_id: "ad-9".into(),
            variant_id: VariantId::new("B").unwrap(),
            impressions: 500,
            clicks: 20,
            conversions: 5,
            spend: 12.0,
            revenue: 30.0,
        })
        .await
        .unwrap();
    engine.registry().promote("roas", "m1.json", None).unwrap();
    let stats = engine.shutdown().await.unwrap();
    assert_eq!(stats.write_failures, 0);
    assert_eq!(events.len(), 1);

    let restarted = AllocationEngine::builder(config())
        .snapshot_store(snapshots.clone())
        .start()
        .await
        .unwrap();
    let a = restarted.get_variant_stats("A").unwrap();
    assert_eq!(a.alpha, 4.0);
    assert!((a.revenue - 30.0).abs() < 1e-9);
    let b = restarted.get_variant_stats("B").unwrap();
    assert!((b.alpha - 1.25).abs() < 1e-12);
    assert_eq!(b.clicks, 20);
    assert_eq!(
        restarted.registry().champion("roas").unwrap().artifact_path,
        "m1.json"
    );
    restarted.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_file_backed_engine_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config();
    config.storage.data_dir = dir.path().to_path_buf();

    let engine = AllocationEngine::builder(config.clone())
        .snapshot_store(Arc::new(JsonFileStore::new(dir.path())))
        .event_log(Arc::new(JsonlEventLog::new(config.storage.audit_log_path())))
        .start()
        .await
        .unwrap();
    engine.update_variant("A", 1.0, 2.0, None).unwrap();
    engine
        .feedback(&Feedback {
            ad_id: "ad-1".into(),
            variant_id: VariantId::new("A").unwrap(),
            impressions: 100,
            clicks: 4,
            conversions: 1,
            spend: 3.0,
            revenue: 9.0,
        })
        .await
        .unwrap();
    engine.shutdown().await.unwrap();

    let rows = JsonFileStore::new(dir.path()).load_variants().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert!((rows[0].alpha - 2.25).abs() < 1e-12);

    let logged = std::fs::read_to_string(config.storage.audit_log_path()).unwrap();
    let events = JsonlEventLog::parse(&logged).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "feedback");
    assert_eq!(events[0].metadata.get("variant_id").unwrap(), "A");
}

#[tokio::test]
async fn test_learner_artifact_competes_against_champion() {
    let loader = Arc::new(InMemoryArtifactLoader::new());
    // Champion funds nothing above the threshold
    loader.insert(
        "champion",
        Arc::new(LinearModel {
            weights: FeatureVector::new(),
            bias: -5.0,
        }),
    );
    loader.insert(
        "challenger",
        Arc::new(LinearModel {
            weights: FeatureVector::new(),
            bias: 5.0,
        }),
    );

    let engine = AllocationEngine::builder(config())
        .artifact_loader(loader)
        .start()
        .await
        .unwrap();
    engine.registry().promote("roas", "champion", None).unwrap();

    let test_set = TestSet {
        features: vec![FeatureVector::new(); 3],
        revenue: vec![10.0, 20.0, 30.0],
        spend: vec![5.0, 5.0, 5.0],
    };
    let result = engine
        .evaluate("roas", "champion", "challenger", &test_set)
        .await
        .unwrap();
    assert_eq!(result.decision, PromotionDecision::Promoted);
    assert!((result.challenger_roas - 4.0).abs() < 1e-12);

    let entries = engine.registry().entries("roas");
    let champions = entries
        .iter()
        .filter(|e| e.stage == ModelStage::Champion)
        .count();
    assert_eq!(champions, 1);
    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_persisted_variant_matches_memory_after_racing_update_and_decay() {
    let snapshots = Arc::new(InMemorySnapshotStore::new());
    let engine = Arc::new(
        AllocationEngine::builder(config())
            .snapshot_store(snapshots.clone())
            .start()
            .await
            .unwrap(),
    );

    for _ in 0..20 {
        let mut tasks = Vec::new();
        for t in 0..16 {
            let engine = engine.clone();
            tasks.push(tokio::task::spawn_blocking(move || {
                for _ in 0..300 {
                    if t % 4 == 0 {
                        engine.apply_decay(0.999).unwrap();
                    } else {
                        engine.update_variant("A", 1.0, 1.0, None).unwrap();
                    }
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        engine.flush().await;

        let in_memory = engine.variants().get("A").unwrap();
        let persisted = snapshots.load_variants().await.unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0], in_memory);
    }

    let engine = Arc::into_inner(engine).unwrap();
    engine.shutdown().await.unwrap();
}
