//! End-to-end workspace tests: submit, run, fault, restore, dump, recover.

use std::path::Path;

use tempfile::TempDir;
use vgpu_core::checkpoint::CheckpointError;
use vgpu_core::handle::HandleExtra;
use vgpu_core::{CheckpointMode, ResourceKind};
use vgpu_daemon::{ApiCall, DaemonConfig, DaemonError, Workspace};
use vgpu_storage::StorageError;

fn config(dir: &Path) -> DaemonConfig {
    DaemonConfig::new(dir).with_device_memory(1 << 20)
}

fn read(ws: &Workspace, client: u64, src: u64, len: u64) -> Vec<u8> {
    ws.submit(client, &ApiCall::MemcpyDtoH { src, len, stream: 0 }).unwrap();
    let mut report = ws.run_pending(client).unwrap();
    assert_eq!(report.reads.len(), 1);
    report.reads.pop().unwrap()
}

#[test]
fn test_fault_and_restore_in_place() {
    let dir = TempDir::new().unwrap();
    let ws = Workspace::new(config(dir.path())).unwrap();
    let client = ws.create_client().unwrap();

    let buf = ws.submit(client, &ApiCall::Malloc { size: 64 }).unwrap().unwrap();
    ws.submit(
        client,
        &ApiCall::MemcpyHtoD {
            dst: buf,
            data: vec![7; 64],
            stream: 0,
        },
    )
    .unwrap();
    let report = ws.run_pending(client).unwrap();
    assert_eq!(report.executed, 2);
    assert_eq!(report.checkpoints, 2);
    ws.flush().unwrap();

    // device, context, default stream, buffer
    assert_eq!(ws.simulate_device_fault(client).unwrap(), 4);
    let summary = ws.restore_client(client).unwrap();
    assert_eq!(summary.restored(), 4);

    assert_eq!(read(&ws, client, buf, 64), vec![7; 64]);
    let counters = ws.counters();
    assert_eq!(counters.ops_submitted, 3);
    assert_eq!(counters.checkpoints_inserted, 2);
    assert_eq!(counters.restores_pooled + counters.restores_rebuilt, 4);
}

#[test]
fn test_interior_copy_offsets() {
    let dir = TempDir::new().unwrap();
    let ws = Workspace::new(config(dir.path()).with_checkpoint_mode(CheckpointMode::Disabled)).unwrap();
    let client = ws.create_client().unwrap();

    let a = ws.submit(client, &ApiCall::Malloc { size: 32 }).unwrap().unwrap();
    let b = ws.submit(client, &ApiCall::Malloc { size: 32 }).unwrap().unwrap();
    ws.submit(
        client,
        &ApiCall::MemcpyHtoD {
            dst: a + 8,
            data: vec![5; 8],
            stream: 0,
        },
    )
    .unwrap();
    ws.submit(
        client,
        &ApiCall::MemcpyDtoD {
            dst: b + 16,
            src: a + 8,
            len: 8,
            stream: 0,
        },
    )
    .unwrap();
    ws.run_pending(client).unwrap();

    let mut expected = vec![0u8; 32];
    expected[16..24].fill(5);
    assert_eq!(read(&ws, client, b, 32), expected);
    assert_eq!(ws.counters().checkpoints_inserted, 0);
}

#[test]
fn test_remove_then_recover_after_restart() {
    let dir = TempDir::new().unwrap();
    let (buf, function) = {
        let ws = Workspace::new(config(dir.path())).unwrap();
        let client = ws.create_client().unwrap();
        let buf = ws.submit(client, &ApiCall::Malloc { size: 32 }).unwrap().unwrap();
        ws.submit(
            client,
            &ApiCall::MemcpyHtoD {
                dst: buf,
                data: vec![3; 32],
                stream: 0,
            },
        )
        .unwrap();
        let module = ws
            .submit(client, &ApiCall::ModuleLoad { image: vec![0xee; 48] })
            .unwrap()
            .unwrap();
        let function = ws
            .submit(
                client,
                &ApiCall::GetFunction {
                    module,
                    name: "scale".into(),
                },
            )
            .unwrap()
            .unwrap();

        let manifest = ws.remove_client(client).unwrap();
        assert_eq!(manifest.client_id, client);
        // device, context, stream, module, function, buffer
        assert_eq!(manifest.total_handles(), 6);
        assert!(matches!(ws.client(client), Err(DaemonError::UnknownClient(_))));
        (buf, function)
    };

    let ws = Workspace::new(config(dir.path())).unwrap();
    let (client, recovered) = ws.recover_client(None).unwrap();
    assert_eq!(recovered.summary.restored(), 6);
    assert_eq!(read(&ws, client, buf, 32), vec![3; 32]);

    let handle = ws.client(client).unwrap();
    let (f, _) = handle.resolve_addr(ResourceKind::Function, function).unwrap();
    assert_eq!(
        f.lock().extra(),
        &HandleExtra::Function {
            name: "scale".into()
        }
    );

    // New handles do not collide with the recovered ones.
    let fresh = ws.submit(client, &ApiCall::Malloc { size: 16 }).unwrap().unwrap();
    assert_ne!(fresh, buf);
    ws.run_pending(client).unwrap();
}

#[test]
fn test_recover_without_checkpoint() {
    let dir = TempDir::new().unwrap();
    let ws = Workspace::new(config(dir.path())).unwrap();
    assert!(matches!(ws.recover_client(None), Err(DaemonError::NoCheckpoint)));
    assert!(matches!(
        ws.recover_client(Some(99)),
        Err(DaemonError::Storage(StorageError::CheckpointNotFound(99)))
    ));
    assert!(ws.client_ids().is_empty());
}

#[test]
fn test_queue_limit_rejects_before_parsing() {
    let dir = TempDir::new().unwrap();
    let ws = Workspace::new(
        config(dir.path())
            .with_checkpoint_mode(CheckpointMode::Disabled)
            .with_max_queued_ops(3),
    )
    .unwrap();
    let client = ws.create_client().unwrap();

    ws.submit(client, &ApiCall::Malloc { size: 8 }).unwrap();
    ws.submit(client, &ApiCall::Malloc { size: 8 }).unwrap();
    assert!(matches!(
        ws.submit(client, &ApiCall::Malloc { size: 8 }),
        Err(DaemonError::Checkpoint(CheckpointError::GraphRejected(_)))
    ));
    let handle = ws.client(client).unwrap();
    assert_eq!(handle.queue().len(), 2);
    assert_eq!(handle.managers().manager(ResourceKind::Memory).unwrap().len(), 2);
}

#[test]
fn test_naive_mode_checkpoints_every_call() {
    let dir = TempDir::new().unwrap();
    let ws = Workspace::new(config(dir.path()).with_checkpoint_mode(CheckpointMode::Naive)).unwrap();
    let client = ws.create_client().unwrap();

    ws.submit(client, &ApiCall::StreamCreate { priority: 1, flags: 0 }).unwrap();
    ws.submit(client, &ApiCall::EventCreate { flags: 2 }).unwrap();
    ws.submit(client, &ApiCall::Deinit).unwrap();
    let report = ws.run_pending(client).unwrap();
    assert_eq!(report.executed, 3);
    assert_eq!(report.checkpoints, 3);
    assert_eq!(ws.counters().checkpoints_inserted, 3);
}

#[test]
fn test_kernel_launch_with_meta_cache() {
    let dir = TempDir::new().unwrap();
    let meta = dir.path().join("kernels.meta");
    std::fs::write(&meta, "axpy|axpy(float*, float*)|2|0|8|8|8|1|0|1|1|0|0|0|0\n").unwrap();
    let ws = Workspace::new(config(&dir.path().join("ckpt")).with_kernel_meta_path(&meta)).unwrap();
    assert_eq!(ws.kernel_meta().len(), 1);
    let client = ws.create_client().unwrap();

    let x = ws.submit(client, &ApiCall::Malloc { size: 64 }).unwrap().unwrap();
    let y = ws.submit(client, &ApiCall::Malloc { size: 64 }).unwrap().unwrap();
    let module = ws
        .submit(client, &ApiCall::ModuleLoad { image: vec![1; 16] })
        .unwrap()
        .unwrap();
    let function = ws
        .submit(
            client,
            &ApiCall::GetFunction {
                module,
                name: "axpy".into(),
            },
        )
        .unwrap()
        .unwrap();
    ws.submit(
        client,
        &ApiCall::LaunchKernel {
            function,
            args: vec![x, y],
            stream: 0,
        },
    )
    .unwrap();

    // x, y, module, then only y for the launch
    let report = ws.run_pending(client).unwrap();
    assert_eq!(report.checkpoints, 4);
    assert_eq!(report.captured, 4);

    assert!(matches!(
        ws.submit(
            client,
            &ApiCall::LaunchKernel {
                function,
                args: vec![x],
                stream: 0,
            },
        ),
        Err(DaemonError::InvalidCall(_))
    ));
}

#[test]
fn test_missing_kernel_meta_is_not_fatal() {
    let dir = TempDir::new().unwrap();
    let ws = Workspace::new(config(dir.path()).with_kernel_meta_path(&dir.path().join("absent.meta"))).unwrap();
    assert!(ws.kernel_meta().is_empty());
}

#[test]
fn test_compact_drops_superseded_snapshots() {
    let dir = TempDir::new().unwrap();
    let ws = Workspace::new(config(dir.path())).unwrap();
    let client = ws.create_client().unwrap();
    let buf = ws.submit(client, &ApiCall::Malloc { size: 64 }).unwrap().unwrap();
    for fill in 1..=3u8 {
        ws.submit(
            client,
            &ApiCall::MemcpyHtoD {
                dst: buf,
                data: vec![fill; 64],
                stream: 0,
            },
        )
        .unwrap();
    }
    ws.run_pending(client).unwrap();
    assert_eq!(ws.compact_snapshots().unwrap(), 3);
}

#[test]
fn test_free_requires_base_address() {
    let dir = TempDir::new().unwrap();
    let ws = Workspace::new(config(dir.path())).unwrap();
    let client = ws.create_client().unwrap();
    let buf = ws.submit(client, &ApiCall::Malloc { size: 64 }).unwrap().unwrap();

    assert!(matches!(
        ws.submit(client, &ApiCall::Free { addr: buf + 4 }),
        Err(DaemonError::InvalidCall(_))
    ));
    ws.submit(client, &ApiCall::Free { addr: buf }).unwrap();
    ws.run_pending(client).unwrap();
    assert!(matches!(
        ws.submit(client, &ApiCall::Free { addr: buf }),
        Err(DaemonError::InvalidCall(_))
    ));
    assert!(matches!(ws.submit(42, &ApiCall::Deinit), Err(DaemonError::UnknownClient(42))));
}

fn fill(ws: &Workspace, client: u64, dst: u64, byte: u8) {
    ws.submit(
        client,
        &ApiCall::MemcpyHtoD {
            dst,
            data: vec![byte; 64],
            stream: 0,
        },
    )
    .unwrap();
    ws.run_pending(client).unwrap();
}

#[test]
fn test_recover_older_checkpoint_after_compaction() {
    let dir = TempDir::new().unwrap();
    let (buf, first, second) = {
        let ws = Workspace::new(config(dir.path())).unwrap();
        let client = ws.create_client().unwrap();
        let buf = ws.submit(client, &ApiCall::Malloc { size: 64 }).unwrap().unwrap();
        fill(&ws, client, buf, 1);
        let first = ws.dump_client(client).unwrap();
        fill(&ws, client, buf, 2);
        let second = ws.dump_client(client).unwrap();
        assert!(second.checkpoint_version > first.checkpoint_version);
        ws.compact_snapshots().unwrap();
        (buf, first, second)
    };

    // Each checkpoint restores the bytes it captured, not the newest ones.
    let ws = Workspace::new(config(dir.path())).unwrap();
    let (client, recovered) = ws.recover_client(Some(first.checkpoint_id)).unwrap();
    assert_eq!(recovered.manifest, first);
    assert_eq!(read(&ws, client, buf, 64), vec![1; 64]);

    let ws = Workspace::new(config(dir.path())).unwrap();
    let (client, _) = ws.recover_client(Some(second.checkpoint_id)).unwrap();
    assert_eq!(read(&ws, client, buf, 64), vec![2; 64]);
}

#[test]
fn test_compact_drops_anchors_of_pruned_checkpoints() {
    let dir = TempDir::new().unwrap();
    let (buf, kept) = {
        let ws = Workspace::new(config(dir.path()).with_max_retained(1)).unwrap();
        let client = ws.create_client().unwrap();
        let buf = ws.submit(client, &ApiCall::Malloc { size: 64 }).unwrap().unwrap();
        fill(&ws, client, buf, 1);
        ws.dump_client(client).unwrap();
        fill(&ws, client, buf, 2);
        let kept = ws.dump_client(client).unwrap();
        assert_eq!(ws.store().list().unwrap().len(), 1);
        assert!(ws.compact_snapshots().unwrap() > 0);
        (buf, kept)
    };

    let ws = Workspace::new(config(dir.path())).unwrap();
    let (client, _) = ws.recover_client(Some(kept.checkpoint_id)).unwrap();
    assert_eq!(read(&ws, client, buf, 64), vec![2; 64]);
}
