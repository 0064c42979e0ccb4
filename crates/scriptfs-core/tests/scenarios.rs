// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! End-to-end request flows through the process-wide runtime.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serial_test::serial;

use scriptfs_core::context::{RequestArgs, RequestContext};
use scriptfs_core::errno::error_record as errno_record;
use scriptfs_core::testing::{MemoryMounter, RecordedReply, RecordingReply, ReplyLog};
use scriptfs_core::{
    BridgeConfig, Completion, DispatcherConfig, HandlerResult, OpTag, Runtime, ScriptEnv,
    ShutdownState, Value, WriteExecutor, WriteJob, WritePayload, WritePriority,
};

const WAIT: Duration = Duration::from_secs(5);

/// Initializes the global runtime with a running dispatcher and tears it
/// down again when dropped.
struct Fixture {
    runtime: &'static Runtime,
}

impl Fixture {
    fn new(config: BridgeConfig) -> Self {
        let runtime = Runtime::global();
        runtime
            .initialize(config, Arc::new(MemoryMounter::new()))
            .unwrap();
        runtime.initialize_dispatcher(None).unwrap();
        Self { runtime }
    }

    fn submit(&self, op: OpTag, args: RequestArgs) -> ReplyLog {
        let (sink, recorded) = RecordingReply::new();
        self.runtime
            .bridge()
            .unwrap()
            .submit(RequestContext::new(op, 1, None, args, sink));
        recorded
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = self.runtime.shutdown();
    }
}

#[test]
#[serial]
fn read_round_trip() {
    let fx = Fixture::new(BridgeConfig::default());
    fx.runtime
        .set_operation_handler("read", |_: &mut ScriptEnv, args: Vec<Value>| -> HandlerResult {
            let ino = args[0].to_u64_lossless("ino").unwrap();
            let opts = &args[2];
            let offset = opts.get("offset").unwrap().to_u64_lossless("offset").unwrap();
            let size = opts.field_u64("size").unwrap();
            if ino == 2 && offset == 0 && size == 5 {
                Ok(Completion::Value(Value::from(b"HELLO".to_vec())))
            } else {
                Err(errno_record(libc::ENOENT))
            }
        })
        .unwrap();

    let recorded = fx.submit(
        OpTag::Read,
        RequestArgs {
            ino: 2,
            offset: 0,
            size: 5,
            ..Default::default()
        },
    );
    assert_eq!(
        recorded.wait(WAIT),
        Some(RecordedReply::Data(b"HELLO".to_vec()))
    );
}

#[test]
#[serial]
fn errno_translation() {
    let fx = Fixture::new(BridgeConfig::default());
    fx.runtime
        .set_operation_handler("getattr", |env: &mut ScriptEnv, _: Vec<Value>| -> HandlerResult {
            Ok(Completion::Deferred(
                env.rejected(Value::object().with("code", "ENOENT")),
            ))
        })
        .unwrap();
    let recorded = fx.submit(OpTag::Getattr, RequestArgs::default());
    assert_eq!(recorded.wait(WAIT), Some(RecordedReply::Error(2)));
}

fn recording_executor() -> (Arc<dyn WriteExecutor>, Arc<Mutex<Vec<Vec<u8>>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let executor: Arc<dyn WriteExecutor> =
        Arc::new(move |job: &WriteJob| -> Result<usize, i32> {
            sink.lock().push(job.bytes().to_vec());
            Ok(job.size)
        });
    (executor, log)
}

#[test]
#[serial]
fn write_ordering() {
    let fx = Fixture::new(BridgeConfig::default());
    for (offset, data) in [(0u64, b"A"), (1, b"B"), (2, b"C")] {
        let id = fx
            .runtime
            .enqueue_write(
                7,
                Some(offset),
                1,
                WritePayload::Owned(data.to_vec()),
                WritePriority::Normal,
                None,
            )
            .unwrap();
        assert_ne!(id, 0);
    }
    let (executor, log) = recording_executor();
    assert_eq!(fx.runtime.process_write_queues(executor).unwrap(), 3);
    assert_eq!(
        *log.lock(),
        vec![b"A".to_vec(), b"B".to_vec(), b"C".to_vec()]
    );
    let stats = fx.runtime.get_write_queue_stats(Some(7)).unwrap();
    assert_eq!(stats[0].bytes_written, 3);
}

#[test]
#[serial]
fn urgent_preemption() {
    let fx = Fixture::new(BridgeConfig::default());
    for i in 0..10u8 {
        fx.runtime
            .enqueue_write(
                9,
                None,
                1,
                WritePayload::Owned(vec![b'0' + i]),
                WritePriority::Normal,
                None,
            )
            .unwrap();
    }
    fx.runtime
        .enqueue_write(
            9,
            None,
            1,
            WritePayload::Owned(b"F".to_vec()),
            WritePriority::Urgent,
            None,
        )
        .unwrap();
    let (executor, log) = recording_executor();
    fx.runtime.process_write_queues(executor).unwrap();

    let log = log.lock();
    let flush_at = log.iter().position(|w| w == b"F").unwrap();
    assert!(flush_at <= 1, "flush ran at position {flush_at}");
    let normals: Vec<u8> = log.iter().filter(|w| *w != b"F").map(|w| w[0]).collect();
    assert_eq!(normals, (0..10u8).map(|i| b'0' + i).collect::<Vec<_>>());
}

#[test]
#[serial]
fn bounded_queue_replies_eagain() {
    let fx = Fixture::new(BridgeConfig {
        dispatcher: DispatcherConfig {
            max_queue_size: 4,
            ..Default::default()
        },
        ..Default::default()
    });
    fx.runtime
        .set_operation_handler("getattr", |_: &mut ScriptEnv, _: Vec<Value>| -> HandlerResult {
            Err(Value::from(libc::EACCES))
        })
        .unwrap();

    // Hold the script thread so nothing completes.
    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);
    fx.runtime
        .script()
        .unwrap()
        .call(move |_| {
            let _ = release_rx.recv();
        })
        .unwrap();

    let logs: Vec<ReplyLog> = (0..5)
        .map(|_| fx.submit(OpTag::Getattr, RequestArgs::default()))
        .collect();
    assert_eq!(
        logs[4].wait(WAIT),
        Some(RecordedReply::Error(libc::EAGAIN))
    );
    for recorded in &logs[..4] {
        assert!(recorded.replies().is_empty());
    }

    release_tx.send(()).unwrap();
    for recorded in &logs[..4] {
        assert_eq!(recorded.wait(WAIT), Some(RecordedReply::Error(libc::EACCES)));
    }
    assert_eq!(fx.runtime.get_dispatcher_stats().unwrap().dropped, 1);
}

#[test]
#[serial]
fn graceful_shutdown_with_in_flight_requests() {
    let fx = Fixture::new(BridgeConfig::default());
    fx.runtime
        .set_operation_handler("access", |_: &mut ScriptEnv, _: Vec<Value>| -> HandlerResult {
            std::thread::sleep(Duration::from_millis(200));
            Ok(Completion::Value(Value::Undefined))
        })
        .unwrap();
    fx.runtime.initialize_shutdown_manager().unwrap();

    let logs: Vec<ReplyLog> = (0..100)
        .map(|_| fx.submit(OpTag::Access, RequestArgs::default()))
        .collect();

    let stats = fx
        .runtime
        .initiate_graceful_shutdown(Some("test"), Some(Duration::from_millis(5000)))
        .unwrap();
    assert_eq!(
        stats.states,
        vec![
            ShutdownState::Running,
            ShutdownState::Draining,
            ShutdownState::Unmounting,
            ShutdownState::Closed
        ]
    );
    assert!(stats.graceful, "failure: {:?}", stats.failure_reason);
    assert_eq!(fx.runtime.get_shutdown_state(), ShutdownState::Closed);
    assert_eq!(fx.runtime.get_write_queue_summary().unwrap().total_queue_size, 0);
    assert_eq!(fx.runtime.get_dispatcher_stats().unwrap().pending, 0);

    // Every request was answered exactly once: completed or cancelled.
    for recorded in &logs {
        assert!(matches!(
            recorded.wait(WAIT),
            Some(RecordedReply::Ok | RecordedReply::Error(libc::ECANCELED))
        ));
    }
    std::thread::sleep(Duration::from_millis(50));
    assert!(logs.iter().all(|p| p.replies().len() == 1));

    // Requests after shutdown never reach a handler.
    let late = fx.submit(OpTag::Access, RequestArgs::default());
    assert_eq!(late.wait(WAIT), Some(RecordedReply::Error(libc::ENODEV)));
}
