//! Whole-client dump to the store, then restore into a fresh device.

use std::sync::Arc;

use tempfile::TempDir;
use vgpu_core::checkpoint::snapshot::{encode_full, snapshot_file_name, write_snapshot};
use vgpu_core::checkpoint::{CheckpointScope, CheckpointTask, EngineConfig};
use vgpu_core::device::{Device, SimulatedDevice, DEFAULT_STREAM};
use vgpu_core::handle::record::HandleRecord;
use vgpu_core::handle::{AllocateRequest, HandleResolver, RelatedHandles};
use vgpu_core::{CheckpointEngine, HandleError, HandleRef, HandleStatus, ManagerSet, ResourceKind};
use vgpu_storage::{CheckpointManifest, CheckpointStore, FileSystemCheckpointStore, RestorePipeline, StorageError};

struct Dumped {
    store: FileSystemCheckpointStore,
    manifest: CheckpointManifest,
    buffers: Vec<(HandleRef, Vec<u8>)>,
    module: HandleRef,
}

fn dump(base: &std::path::Path) -> Dumped {
    let store = FileSystemCheckpointStore::new(base, 0);
    let engine = CheckpointEngine::new(EngineConfig::new(store.snapshot_dir()).with_async_commit(false)).unwrap();
    let dev = Arc::new(SimulatedDevice::new(0, 1 << 20));
    let set = ManagerSet::with_default_types(Arc::clone(&dev) as Arc<dyn Device>);
    set.init_all(false).unwrap();

    let ctx = set.primary(ResourceKind::Context).unwrap();
    let related = RelatedHandles::new().with(ResourceKind::Context, ctx);
    let module = set
        .manager(ResourceKind::Module)
        .unwrap()
        .allocate_mocked_resource(&related, AllocateRequest::stateful(96))
        .unwrap();
    let module_addr = module.lock().server_addr().unwrap();
    dev.write(module_addr, 0, &[0xabu8; 96], DEFAULT_STREAM).unwrap();

    let mut buffers = Vec::new();
    for i in 0..3u8 {
        let h = set
            .manager(ResourceKind::Memory)
            .unwrap()
            .allocate_mocked_resource(&related, AllocateRequest::stateful(256))
            .unwrap();
        let data = vec![i + 1; 256];
        dev.write(h.lock().server_addr().unwrap(), 0, &data, DEFAULT_STREAM).unwrap();
        buffers.push((h.lock().handle_ref(), data));
    }

    let task = CheckpointTask {
        scope: CheckpointScope::Full,
        stream: DEFAULT_STREAM,
    };
    let report = engine.execute_sync(&set, &task).unwrap();
    assert_eq!(report.committed, 4);

    let mut records: Vec<HandleRecord> = Vec::new();
    for manager in set.iter() {
        records.extend(manager.records().unwrap());
    }
    let id = store.next_checkpoint_id().unwrap();
    let mut manifest = CheckpointManifest::new(id, 1, report.version);
    for r in &records {
        *manifest.handle_counts.entry(r.kind).or_default() += 1;
    }
    manifest.image_bytes = store.save_image(id, &records).unwrap();
    store.save(&manifest).unwrap();

    let module = module.lock().handle_ref();
    Dumped {
        store,
        manifest,
        buffers,
        module,
    }
}

fn fresh() -> (Arc<SimulatedDevice>, ManagerSet) {
    let dev = Arc::new(SimulatedDevice::new(0, 1 << 20));
    let set = ManagerSet::with_default_types(Arc::clone(&dev) as Arc<dyn Device>);
    set.init_all(true).unwrap();
    (dev, set)
}

#[test]
fn test_restore_rebuilds_client() {
    let dir = TempDir::new().unwrap();
    let dumped = dump(dir.path());
    let manifest = dumped.store.load_latest().unwrap().unwrap();
    assert_eq!(manifest, dumped.manifest);

    let (dev, set) = fresh();
    let image = dumped.store.open_image(&manifest).unwrap();
    let summary = RestorePipeline::new(&set)
        .with_pool_size(2)
        .run(&image, &dumped.store.snapshot_dir())
        .unwrap();

    assert_eq!(summary.restored(), manifest.total_handles());
    assert_eq!(summary.pooled, 2);
    assert_eq!(summary.max_version, manifest.checkpoint_version);

    for (r, data) in &dumped.buffers {
        let h = set.resolve(*r).unwrap();
        let h = h.lock();
        assert_eq!(h.status(), HandleStatus::Active);
        let bytes = dev.read(h.server_addr().unwrap(), 0, 256, DEFAULT_STREAM).unwrap();
        assert_eq!(&bytes, data);
    }

    let ctx = set.primary(ResourceKind::Context).unwrap();
    let ctx = ctx.lock();
    assert!(ctx.children().contains(&dumped.module));
    for (r, _) in &dumped.buffers {
        assert!(ctx.children().contains(r));
    }
}

#[test]
fn test_missing_snapshot_stops_pipeline() {
    let dir = TempDir::new().unwrap();
    let dumped = dump(dir.path());
    std::fs::remove_file(
        dumped
            .store
            .snapshot_dir()
            .join(snapshot_file_name(dumped.module.id, dumped.manifest.checkpoint_version)),
    )
    .unwrap();

    let (_dev, set) = fresh();
    let image = dumped.store.open_image(&dumped.manifest).unwrap();
    let result = RestorePipeline::new(&set).run(&image, &dumped.store.snapshot_dir());
    assert!(matches!(
        result,
        Err(StorageError::Handle(HandleError::RestoreFailed { .. }))
    ));

    // Kinds ahead of the module were restored; the module stays broken and
    // memory was never reached.
    assert_eq!(
        set.primary(ResourceKind::Context).unwrap().lock().status(),
        HandleStatus::Active
    );
    assert_eq!(set.resolve(dumped.module).unwrap().lock().status(), HandleStatus::Broken);
    assert!(set.manager(ResourceKind::Memory).unwrap().is_empty());
}

#[test]
fn test_version_bound_ignores_newer_snapshots() {
    let dir = TempDir::new().unwrap();
    let dumped = dump(dir.path());
    let (r, data) = &dumped.buffers[0];
    let later = dumped.manifest.checkpoint_version + 1;
    write_snapshot(
        &dumped.store.snapshot_dir(),
        r.id,
        later,
        &encode_full(r.id, later, &[0xffu8; 256]),
        false,
    )
    .unwrap();
    let image = dumped.store.open_image(&dumped.manifest).unwrap();

    let (dev, set) = fresh();
    let summary = RestorePipeline::new(&set)
        .with_max_version(Some(dumped.manifest.checkpoint_version))
        .run(&image, &dumped.store.snapshot_dir())
        .unwrap();
    // Later files still move the version counter forward.
    assert_eq!(summary.max_version, later);
    let h = set.resolve(*r).unwrap();
    let addr = h.lock().server_addr().unwrap();
    assert_eq!(&dev.read(addr, 0, 256, DEFAULT_STREAM).unwrap(), data);

    let (dev, set) = fresh();
    RestorePipeline::new(&set).run(&image, &dumped.store.snapshot_dir()).unwrap();
    let h = set.resolve(*r).unwrap();
    let addr = h.lock().server_addr().unwrap();
    assert_eq!(dev.read(addr, 0, 256, DEFAULT_STREAM).unwrap(), vec![0xffu8; 256]);
}
