use std::path::PathBuf;
use std::sync::Arc;

use appvault_core::{
    BackupItem, CloudBackend, CompressionKind, DataType, DeviceLayout, InMemoryRemote,
    LocalBackend, OpKind, OperationState, OrchestratorConfig, PrivilegedRunner, ProcessingPhase,
    ScriptedDeviceEnv, SlotSelection, StorageBackend, Store, TargetKind, TaskEvent,
    TaskOrchestrator, import_restore_items,
};
use tempfile::TempDir;

fn tar_available() -> bool {
    std::process::Command::new("tar")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn write_file(path: PathBuf, bytes: &[u8]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, bytes).unwrap();
}

async fn open_store(temp: &TempDir) -> Store {
    Store::open(&temp.path().join("ops.sqlite")).await.unwrap()
}

async fn add_media_item(store: &Store, op_kind: OpKind, name: &str, path: PathBuf) {
    let mut item = BackupItem {
        id: 0,
        op_kind,
        target_kind: TargetKind::Media,
        name: name.to_string(),
        label: name.to_uppercase(),
        path,
        activated: true,
        compression: CompressionKind::Zstd,
        selection: SlotSelection::media_only(),
    };
    store.upsert_item(&mut item).await.unwrap();
}

fn orchestrator(
    store: Store,
    backend: Arc<dyn StorageBackend>,
    op_kind: OpKind,
    target_kind: TargetKind,
    layout: DeviceLayout,
) -> TaskOrchestrator {
    TaskOrchestrator::new(
        store,
        backend,
        Arc::new(ScriptedDeviceEnv::default()),
        PrivilegedRunner::direct(),
        OrchestratorConfig {
            op_kind,
            target_kind,
            layout,
            reset_selection: false,
        },
    )
}

fn drain_events(rx: &mut tokio::sync::mpsc::UnboundedReceiver<TaskEvent>) -> Vec<TaskEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn three_items_with_one_absent_source_all_succeed() {
    if !tar_available() {
        eprintln!("tar not available, skipping");
        return;
    }

    let temp = TempDir::new().unwrap();
    let store = open_store(&temp).await;

    write_file(temp.path().join("src/one/photo.jpg"), &[1u8; 4_000]);
    write_file(temp.path().join("src/three/clip.mp4"), &[3u8; 9_000]);
    // "two" is never created; its slot must end up SKIP, not ERROR.
    for name in ["one", "two", "three"] {
        add_media_item(&store, OpKind::Backup, name, temp.path().join("src").join(name)).await;
    }

    let orch = orchestrator(
        store.clone(),
        Arc::new(LocalBackend::new(temp.path().join("vault"))),
        OpKind::Backup,
        TargetKind::Media,
        DeviceLayout::default(),
    );
    let mut rx = orch.subscribe().unwrap();

    orch.preprocessing().await.unwrap();
    orch.processing().await.unwrap();
    orch.post_processing().await.unwrap();

    let task = orch.task_snapshot().await;
    assert_eq!(task.total_count, 3);
    assert_eq!(task.success_count, 3);
    assert_eq!(task.failure_count, 0);
    assert_eq!(task.processing_index, 3);
    assert!(!task.is_processing);
    assert!(task.end_ms >= task.start_ms);

    let ops = store.items_for_task(task.id).await.unwrap();
    assert_eq!(ops.len(), 3);
    for op in &ops {
        assert!(op.is_success(), "{} failed: {:?}", op.item_name, op.slots);
    }
    let two = ops.iter().find(|op| op.item_name == "two").unwrap();
    assert_eq!(
        two.slot(DataType::Media).unwrap().state,
        OperationState::Skip
    );
    let one = ops.iter().find(|op| op.item_name == "one").unwrap();
    assert_eq!(
        one.slot(DataType::Media).unwrap().state,
        OperationState::Done
    );
    assert!(one.slot(DataType::Media).unwrap().bytes >= 4_000);

    assert!(
        temp.path()
            .join("vault/media/one/media.tar.zst")
            .is_file()
    );
    assert!(
        !temp.path()
            .join("vault/media/two/media.tar.zst")
            .exists()
    );

    let events = drain_events(&mut rx);
    let progress: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            TaskEvent::Progress {
                current_index,
                total,
                item_label,
                ..
            } => Some((*current_index, *total, item_label.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(
        progress,
        vec![
            (0, 3, "ONE".to_string()),
            (1, 3, "TWO".to_string()),
            (2, 3, "THREE".to_string())
        ]
    );
    assert!(matches!(
        events.last(),
        Some(TaskEvent::Finished {
            success_count: 3,
            failure_count: 0,
            ..
        })
    ));
}

#[tokio::test]
async fn package_item_archives_into_layout_subdirs() {
    if !tar_available() {
        eprintln!("tar not available, skipping");
        return;
    }

    let temp = TempDir::new().unwrap();
    let store = open_store(&temp).await;

    let layout = DeviceLayout {
        apk_dir: temp.path().join("dev/app"),
        user_dir: temp.path().join("dev/user"),
        user_de_dir: temp.path().join("dev/user_de"),
        data_dir: temp.path().join("dev/data"),
        obb_dir: temp.path().join("dev/obb"),
        media_dir: temp.path().join("dev/media"),
    };
    write_file(
        temp.path().join("dev/user/com.example.app/prefs.xml"),
        b"<prefs/>",
    );
    // ext-data source stays absent.

    let mut selection = SlotSelection::default();
    selection.apk = false;
    selection.user_de = false;
    selection.obb = false;
    selection.media = false;
    let mut item = BackupItem {
        id: 0,
        op_kind: OpKind::Backup,
        target_kind: TargetKind::Packages,
        name: "com.example.app".to_string(),
        label: "Example".to_string(),
        path: PathBuf::new(),
        activated: true,
        compression: CompressionKind::Zstd,
        selection,
    };
    store.upsert_item(&mut item).await.unwrap();

    let orch = orchestrator(
        store.clone(),
        Arc::new(LocalBackend::new(temp.path().join("vault"))),
        OpKind::Backup,
        TargetKind::Packages,
        layout,
    );
    orch.preprocessing().await.unwrap();
    orch.processing().await.unwrap();
    orch.post_processing().await.unwrap();

    let task = orch.task_snapshot().await;
    assert_eq!((task.success_count, task.failure_count), (1, 0));

    let ops = store.items_for_task(task.id).await.unwrap();
    assert_eq!(ops.len(), 1);
    let op = &ops[0];
    assert!(op.is_success());
    assert_eq!(
        op.slot(DataType::User).unwrap().state,
        OperationState::Done
    );
    assert_eq!(
        op.slot(DataType::Data).unwrap().state,
        OperationState::Skip
    );

    assert!(
        temp.path()
            .join("vault/apps/com.example.app/int_data/user.tar.zst")
            .is_file()
    );
    assert!(
        temp.path()
            .join("vault/apps/com.example.app/manifest.json")
            .is_file()
    );
}

#[tokio::test]
async fn repeated_phase_launches_are_no_ops() {
    if !tar_available() {
        eprintln!("tar not available, skipping");
        return;
    }

    let temp = TempDir::new().unwrap();
    let store = open_store(&temp).await;

    write_file(temp.path().join("src/only/file.txt"), b"once\n");
    add_media_item(&store, OpKind::Backup, "only", temp.path().join("src/only")).await;

    let orch = orchestrator(
        store.clone(),
        Arc::new(LocalBackend::new(temp.path().join("vault"))),
        OpKind::Backup,
        TargetKind::Media,
        DeviceLayout::default(),
    );
    let mut rx = orch.subscribe().unwrap();

    orch.preprocessing().await.unwrap();
    orch.preprocessing().await.unwrap();

    // A double tap: both calls race, exactly one executes the phase body.
    let (a, b) = tokio::join!(orch.processing(), orch.processing());
    a.unwrap();
    b.unwrap();
    orch.processing().await.unwrap();

    orch.post_processing().await.unwrap();
    orch.post_processing().await.unwrap();

    let task = orch.task_snapshot().await;
    assert_eq!(task.total_count, 1);
    assert_eq!(task.success_count, 1);
    assert_eq!(task.processing_index, 1);

    assert_eq!(store.count_item_ops(task.id).await.unwrap(), 1);
    let pre = store
        .processing_info_for_task(task.id, ProcessingPhase::Preprocessing)
        .await
        .unwrap();
    assert_eq!(pre.len(), 2, "preprocessing sub-steps ran twice: {pre:?}");

    let events = drain_events(&mut rx);
    let progress_count = events
        .iter()
        .filter(|e| matches!(e, TaskEvent::Progress { .. }))
        .count();
    assert_eq!(progress_count, 1);
    let finished_count = events
        .iter()
        .filter(|e| matches!(e, TaskEvent::Finished { .. }))
        .count();
    assert_eq!(finished_count, 1);
}

#[tokio::test]
async fn cloud_backup_uploads_archive_and_manifest() {
    if !tar_available() {
        eprintln!("tar not available, skipping");
        return;
    }

    let temp = TempDir::new().unwrap();
    let store = open_store(&temp).await;

    write_file(temp.path().join("src/Pictures/cat.png"), &[9u8; 2_000]);
    add_media_item(
        &store,
        OpKind::Backup,
        "Pictures",
        temp.path().join("src/Pictures"),
    )
    .await;

    let remote = Arc::new(InMemoryRemote::new());
    let backend = Arc::new(CloudBackend::new(
        remote.clone(),
        "device-a",
        temp.path().join("staging"),
    ));

    let orch = orchestrator(
        store.clone(),
        backend,
        OpKind::Backup,
        TargetKind::Media,
        DeviceLayout::default(),
    );
    orch.preprocessing().await.unwrap();
    orch.processing().await.unwrap();
    orch.post_processing().await.unwrap();

    let task = orch.task_snapshot().await;
    assert_eq!((task.success_count, task.failure_count), (1, 0));

    let ops = store.items_for_task(task.id).await.unwrap();
    assert_eq!(
        ops[0].slot(DataType::Media).unwrap().state,
        OperationState::Done
    );

    // Archive plus its restore manifest.
    assert_eq!(remote.uploaded.load(std::sync::atomic::Ordering::Relaxed), 2);
    assert!(
        remote
            .get("device-a/media/Pictures/media.tar.zst")
            .await
            .is_some()
    );
    assert!(
        remote
            .get("device-a/media/Pictures/manifest.json")
            .await
            .is_some()
    );
}

#[tokio::test]
async fn manifest_driven_restore_round_trips() {
    if !tar_available() {
        eprintln!("tar not available, skipping");
        return;
    }

    let temp = TempDir::new().unwrap();
    let vault = temp.path().join("vault");
    let source = temp.path().join("src/Pictures");
    write_file(source.join("cat.png"), &[7u8; 3_000]);
    write_file(source.join("albums/dog.png"), b"woof");

    {
        let store = open_store(&temp).await;
        add_media_item(&store, OpKind::Backup, "Pictures", source.clone()).await;
        let orch = orchestrator(
            store,
            Arc::new(LocalBackend::new(vault.clone())),
            OpKind::Backup,
            TargetKind::Media,
            DeviceLayout::default(),
        );
        orch.preprocessing().await.unwrap();
        orch.processing().await.unwrap();
        orch.post_processing().await.unwrap();
        let task = orch.task_snapshot().await;
        assert_eq!((task.success_count, task.failure_count), (1, 0));
    }

    // Wipe the source, rebuild the selection list from manifests, restore.
    std::fs::remove_dir_all(&source).unwrap();
    assert!(!source.exists());

    let store = Store::open(&temp.path().join("restore.sqlite")).await.unwrap();
    let imported = import_restore_items(&store, &vault, TargetKind::Media)
        .await
        .unwrap();
    assert_eq!(imported, 1);

    let orch = orchestrator(
        store.clone(),
        Arc::new(LocalBackend::new(vault)),
        OpKind::Restore,
        TargetKind::Media,
        DeviceLayout::default(),
    );
    orch.preprocessing().await.unwrap();
    orch.processing().await.unwrap();
    orch.post_processing().await.unwrap();

    let task = orch.task_snapshot().await;
    assert_eq!((task.success_count, task.failure_count), (1, 0));

    assert_eq!(std::fs::read(source.join("cat.png")).unwrap(), vec![7u8; 3_000]);
    assert_eq!(
        std::fs::read(source.join("albums/dog.png")).unwrap(),
        b"woof"
    );
}

#[tokio::test]
async fn failed_substep_is_recorded_and_phase_continues() {
    let temp = TempDir::new().unwrap();
    let store = open_store(&temp).await;

    let env = Arc::new(ScriptedDeviceEnv {
        fail_grant: true,
        ..ScriptedDeviceEnv::default()
    });
    let orch = TaskOrchestrator::new(
        store.clone(),
        Arc::new(LocalBackend::new(temp.path().join("vault"))),
        env.clone(),
        PrivilegedRunner::direct(),
        OrchestratorConfig {
            op_kind: OpKind::Restore,
            target_kind: TargetKind::Media,
            layout: DeviceLayout::default(),
            reset_selection: false,
        },
    );

    orch.preprocessing().await.unwrap();
    orch.processing().await.unwrap();
    orch.post_processing().await.unwrap();

    let task = orch.task_snapshot().await;
    assert!(!task.is_processing);

    let pre = store
        .processing_info_for_task(task.id, ProcessingPhase::Preprocessing)
        .await
        .unwrap();
    assert_eq!(pre.len(), 1);
    assert_eq!(pre[0].state, OperationState::Error);
    assert!(pre[0].log.contains("install permission"));
    assert_eq!(env.grants.load(std::sync::atomic::Ordering::Relaxed), 1);

    let post = store
        .processing_info_for_task(task.id, ProcessingPhase::PostProcessing)
        .await
        .unwrap();
    assert_eq!(post.len(), 1);
    assert_eq!(post[0].state, OperationState::Done);
}

#[tokio::test]
async fn reset_selection_clears_activated_flags() {
    if !tar_available() {
        eprintln!("tar not available, skipping");
        return;
    }

    let temp = TempDir::new().unwrap();
    let store = open_store(&temp).await;

    write_file(temp.path().join("src/notes/a.txt"), b"a");
    add_media_item(&store, OpKind::Backup, "notes", temp.path().join("src/notes")).await;

    let orch = TaskOrchestrator::new(
        store.clone(),
        Arc::new(LocalBackend::new(temp.path().join("vault"))),
        Arc::new(ScriptedDeviceEnv::default()),
        PrivilegedRunner::direct(),
        OrchestratorConfig {
            op_kind: OpKind::Backup,
            target_kind: TargetKind::Media,
            layout: DeviceLayout::default(),
            reset_selection: true,
        },
    );
    orch.preprocessing().await.unwrap();
    orch.processing().await.unwrap();
    orch.post_processing().await.unwrap();

    assert!(
        store
            .activated_items(OpKind::Backup, TargetKind::Media)
            .await
            .unwrap()
            .is_empty()
    );
}
