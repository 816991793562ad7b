//! End-to-end scenarios across the registry, file sync, realtime and
//! hydration layers, wired with in-memory collaborators.

use harbor_core::files::{
    BulkEntry, BulkOutcome, FileKind, FileSyncService, HydrationConfig, Hydrator,
    MemoryFileStore, MemoryObjectStorage, RecordsStrategy, SnapshotStrategy, StageOutcome,
    StorageStrategy,
};
use harbor_core::realtime::{
    files_channel, reload_channel, AccessPolicySet, BusConfig, BusReloadPublisher, ChannelBus,
    ConnectionState, EventPayload, HotReloadConfig, HotReloadCoordinator, RateLimitConfig,
    RateLimiter, ReconnectPolicy, Reconnector, Role, Subject,
};
use harbor_core::{
    CoreError, CreateSessionRequest, MemorySessionStore, RegistryConfig, SessionId,
    SessionRegistry, SessionStatus, Unlimited,
};
use harbor_machine::{FakeMachineApi, Provisioner};
use std::sync::Arc;
use std::time::Duration;

fn registry() -> (Arc<FakeMachineApi>, SessionRegistry) {
    let api = Arc::new(FakeMachineApi::new());
    let registry = SessionRegistry::new(
        Arc::new(MemorySessionStore::new()),
        Provisioner::new(api.clone()),
        Arc::new(Unlimited),
        RegistryConfig::builder()
            .preview_domain("preview.example.com")
            .build()
            .unwrap(),
    );
    (api, registry)
}

fn bus() -> ChannelBus {
    ChannelBus::new(
        AccessPolicySet::default(),
        RateLimiter::new(RateLimitConfig::per_second(10)),
        BusConfig::default(),
    )
}

#[tokio::test]
async fn test_free_session_becomes_active_with_preview_url() {
    let (api, registry) = registry();
    let session = registry
        .create_session(CreateSessionRequest {
            project_id: "P1".into(),
            user_id: "U1".into(),
            device_type: "desktop".into(),
            tier: Some("free".into()),
        })
        .await
        .unwrap();

    assert_eq!(session.status, SessionStatus::Active);
    let expected = format!("https://{}-3000.preview.example.com", session.session_id);
    assert_eq!(session.container_url.as_deref(), Some(expected.as_str()));
    assert_eq!(api.call_count("create"), 1);

    let status = registry
        .get_session_status(&session.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status, session);
}

#[tokio::test]
async fn test_destroy_nonexistent_session() {
    let (_, registry) = registry();
    let err = registry
        .destroy_session(&SessionId::from("nonexistent"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::SessionNotFound(_)));
    assert!(registry
        .get_session_status(&SessionId::from("nonexistent"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_upsert_versions_and_conflict() {
    let files = FileSyncService::new(Arc::new(MemoryFileStore::new()));

    let v1 = files.upsert("P1", "a.ts", "v1", FileKind::File, None).await.unwrap();
    assert_eq!(v1.version, 1);
    let v2 = files
        .upsert("P1", "a.ts", "v2", FileKind::File, Some(1))
        .await
        .unwrap();
    assert_eq!(v2.version, 2);

    let err = files
        .upsert("P1", "a.ts", "v3", FileKind::File, Some(1))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoreError::ConcurrencyConflict {
            current_version: Some(2),
            ..
        }
    ));
    let current = files.get("P1", "a.ts", false).await.unwrap().unwrap();
    assert_eq!(current.content.as_deref(), Some("v2"));
}

#[tokio::test]
async fn test_tombstone_hidden_from_listing_but_auditable() {
    let files = FileSyncService::new(Arc::new(MemoryFileStore::new()));
    files.upsert("P1", "a.ts", "a", FileKind::File, None).await.unwrap();
    files.upsert("P1", "b.ts", "b", FileKind::File, None).await.unwrap();
    files.delete("P1", "a.ts", Some(1)).await.unwrap();

    let listed: Vec<_> = files
        .list_current("P1")
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.path)
        .collect();
    assert_eq!(listed, vec!["b.ts"]);

    assert!(files.get("P1", "a.ts", false).await.unwrap().is_none());
    let tomb = files.get("P1", "a.ts", true).await.unwrap().unwrap();
    assert!(tomb.is_tombstone());
    assert_eq!(tomb.version, 2);
}

#[tokio::test]
async fn test_bulk_duplicate_paths_end_at_last_entry() {
    let files = FileSyncService::new(Arc::new(MemoryFileStore::new()));
    let result = files
        .bulk_upsert(
            "P1",
            vec![
                BulkEntry::update("src/a.ts", "one"),
                BulkEntry::update("./src/a.ts", "two"),
                BulkEntry::update("src/b.ts", "b"),
                BulkEntry::update("/src/a.ts", "three"),
            ],
        )
        .await
        .unwrap();

    assert!(result.applied);
    assert_eq!(result.processed, 4);
    assert_eq!(result.upserted, 4);
    let versions: Vec<_> = result
        .results
        .iter()
        .filter(|r| r.path == "src/a.ts")
        .map(|r| r.outcome.clone())
        .collect();
    assert_eq!(
        versions,
        vec![
            BulkOutcome::Applied { version: 1 },
            BulkOutcome::Applied { version: 2 },
            BulkOutcome::Applied { version: 3 },
        ]
    );

    let stored = files.get("P1", "src/a.ts", false).await.unwrap().unwrap();
    assert_eq!((stored.version, stored.content.as_deref()), (3, Some("three")));
}

#[tokio::test]
async fn test_bulk_with_stale_entry_applies_nothing() {
    let files = FileSyncService::new(Arc::new(MemoryFileStore::new()));
    files.upsert("P1", "a.ts", "a", FileKind::File, None).await.unwrap();

    let result = files
        .bulk_upsert(
            "P1",
            vec![
                BulkEntry::update("b.ts", "b"),
                BulkEntry::update("a.ts", "stale").expecting(7),
            ],
        )
        .await
        .unwrap();

    assert!(!result.applied);
    assert_eq!(result.upserted, 0);
    assert_eq!(result.results[0].outcome, BulkOutcome::Skipped);
    assert_eq!(
        result.results[1].outcome,
        BulkOutcome::Conflict {
            current_version: Some(1)
        }
    );
    assert!(files.get("P1", "b.ts", true).await.unwrap().is_none());
}

#[tokio::test]
async fn test_hydration_falls_back_to_storage_when_snapshot_unreachable() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(MemoryObjectStorage::new());
    storage.put("projects/P1/files/index.html", "<h1>stored</h1>");
    storage.put("projects/P1/files/src/main.ts", "console.log(1)");

    let config = HydrationConfig {
        snapshot_attempts: 2,
        attempt_timeout: Duration::from_secs(2),
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(20),
    };
    let hydrator = Hydrator::new()
        .with(SnapshotStrategy::new("http://127.0.0.1:1/P1.tar.gz", config).unwrap())
        .with(StorageStrategy::new(storage));

    let report = hydrator.hydrate("P1", dir.path()).await.unwrap();
    assert_eq!(report.source, "storage");
    assert_eq!(report.files_written, 2);
    assert!(matches!(report.attempts[0].outcome, StageOutcome::Failed(_)));
    assert_eq!(
        std::fs::read_to_string(dir.path().join("index.html")).unwrap(),
        "<h1>stored</h1>"
    );
    assert!(!dir.path().join("package.json").exists());
}

#[tokio::test]
async fn test_hydration_from_exported_snapshot() {
    let files = Arc::new(FileSyncService::new(Arc::new(MemoryFileStore::new())));
    files.upsert("P1", "src/app.ts", "export {}", FileKind::File, None).await.unwrap();
    files.upsert("P1", "gone.ts", "x", FileKind::File, None).await.unwrap();
    files.delete("P1", "gone.ts", None).await.unwrap();
    let archive = files.export_snapshot("P1").await.unwrap();

    let app = axum::Router::new().route(
        "/P1.tar.gz",
        axum::routing::get(move || {
            let body = archive.clone();
            async move { body }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let dir = tempfile::tempdir().unwrap();
    let report = Hydrator::new()
        .with(
            SnapshotStrategy::new(format!("http://{addr}/P1.tar.gz"), HydrationConfig::default())
                .unwrap(),
        )
        .with(RecordsStrategy::new(files.clone()))
        .hydrate("P1", dir.path())
        .await
        .unwrap();

    assert_eq!(report.source, "snapshot");
    assert_eq!(report.files_written, 1);
    assert!(dir.path().join("src/app.ts").exists());
    assert!(!dir.path().join("gone.ts").exists());
}

#[tokio::test(start_paused = true)]
async fn test_burst_of_changes_yields_one_reload() {
    let bus = bus();
    let files = FileSyncService::new(Arc::new(MemoryFileStore::new())).with_bus(bus.clone());
    let viewer = Subject::user("U1").with_role("P1", Role::Viewer);
    let mut file_events = bus.subscribe(&files_channel("P1"), &viewer).unwrap();
    let mut reloads = bus.subscribe(&reload_channel("P1"), &viewer).unwrap();

    let (handle, _task) = HotReloadCoordinator::spawn(
        "P1",
        HotReloadConfig::default(),
        Arc::new(BusReloadPublisher::new(bus.clone(), Subject::system("harbor-agent"))),
        None,
    );

    for i in 0..10 {
        files
            .upsert("P1", &format!("src/c{i}.ts"), format!("v{i}"), FileKind::File, None)
            .await
            .unwrap();
        let message = file_events.recv().await.unwrap();
        let EventPayload::FileUpdate(update) = &message.body else {
            panic!("expected file:update, got {}", message.event_type());
        };
        handle
            .observe(update.file_path.clone(), update.content.as_bytes())
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let message = reloads.recv().await.unwrap();
    let EventPayload::HotReload(reload) = &message.body else {
        panic!("expected hot_reload");
    };
    assert_eq!(reload.changed_files.len(), 10);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(
        tokio::time::timeout(Duration::from_millis(10), reloads.recv())
            .await
            .is_err(),
        "only one reload expected"
    );
}

#[tokio::test(start_paused = true)]
async fn test_publish_rate_limit_window() {
    let bus = ChannelBus::new(
        AccessPolicySet::new(vec![harbor_core::realtime::ChannelAccessPolicy::new(
            "presence:*",
        )
        .rate(RateLimitConfig::new(5, Duration::from_secs(60)))]),
        RateLimiter::default(),
        BusConfig::default(),
    );
    let user = Subject::user("U1");
    let reload = |n: usize| {
        EventPayload::HotReload(harbor_core::realtime::HotReload {
            project_id: "P1".into(),
            changed_files: vec![format!("f{n}")],
            timestamp: chrono::Utc::now(),
        })
    };

    for i in 1..=5 {
        bus.publish("presence:P1", &user, reload(i), Default::default())
            .unwrap_or_else(|e| panic!("request {i}: {e}"));
    }
    let err = bus
        .publish("presence:P1", &user, reload(6), Default::default())
        .unwrap_err();
    let CoreError::RateLimited { retry_after } = err else {
        panic!("expected rate limit, got {err}");
    };
    assert!(retry_after > Duration::ZERO);

    tokio::time::advance(Duration::from_secs(61)).await;
    bus.publish("presence:P1", &user, reload(7), Default::default())
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_stops_at_cap() {
    let policy = ReconnectPolicy {
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(1),
        multiplier: 2.0,
        max_attempts: 3,
    };
    let mut reconnector = Reconnector::new(policy);
    let state = reconnector.watch();

    for _ in 0..3 {
        assert!(reconnector.schedule(|| async {}));
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
    assert!(!reconnector.schedule(|| async {}));
    assert_eq!(*state.borrow(), ConnectionState::Disconnected);
    assert!(!reconnector.has_pending());
    assert_eq!(reconnector.attempts(), 3);
}
