// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use crossbeam_channel::bounded;
use parking_lot::Mutex;

use scriptfs_core::context::{RequestArgs, RequestContext};
use scriptfs_core::testing::{RecordedReply, RecordingReply};
use scriptfs_core::{
    Completion, Dispatcher, DispatcherConfig, HandlerRegistry, HandlerResult, OpTag, Priority,
    ScriptEnv, ScriptThread, ShutdownManager, ShutdownObserver, ShutdownState, Value,
    WriteExecutor, WriteJob, WritePayload, WritePriority, WriteQueueConfig, WriteQueueManager,
};

fn started(registry: &Arc<HandlerRegistry>, script: &ScriptThread) -> Arc<Dispatcher> {
    let dispatcher = Dispatcher::new(
        Arc::clone(registry),
        script.handle(),
        DispatcherConfig::default(),
    );
    dispatcher.start().unwrap();
    dispatcher
}

fn tagged(tag: &'static str) -> impl Fn(&mut ScriptEnv, Vec<Value>) -> HandlerResult {
    move |_: &mut ScriptEnv, _: Vec<Value>| -> HandlerResult {
        Ok(Completion::Value(Value::from(tag)))
    }
}

/// Forwards the string payload or the extracted errno; handler results
/// themselves stay on the script thread.
fn outcome_to(
    tx: &crossbeam_channel::Sender<Result<Option<String>, i32>>,
) -> Box<dyn FnOnce(&mut ScriptEnv, HandlerResult) + Send> {
    let send = tx.clone();
    Box::new(move |_: &mut ScriptEnv, result: HandlerResult| {
        let outcome = match result {
            Ok(Completion::Value(Value::String(s))) => Ok(Some(s)),
            Ok(_) => Ok(None),
            Err(reason) => Err(scriptfs_core::errno::extract(&reason)),
        };
        send.send(outcome).unwrap();
    })
}

#[test]
fn racing_replies_deliver_once() {
    for _ in 0..50 {
        let (sink, recorded) = RecordingReply::new();
        let ctx = Arc::new(RequestContext::new(
            OpTag::Getattr,
            1,
            None,
            RequestArgs::default(),
            sink,
        ));
        let barrier = Arc::new(Barrier::new(8));
        let winners = Arc::new(AtomicUsize::new(0));
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let ctx = Arc::clone(&ctx);
                let barrier = Arc::clone(&barrier);
                let winners = Arc::clone(&winners);
                thread::spawn(move || {
                    barrier.wait();
                    let won = if i % 2 == 0 {
                        ctx.reply_error(libc::ENOENT)
                    } else {
                        ctx.reply_ok()
                    };
                    if won {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert_eq!(recorded.replies().len(), 1);
        assert!(ctx.has_replied());
    }
}

#[test]
fn dispatch_sees_handler_registered_before_it() {
    let script = ScriptThread::spawn("props-visibility").unwrap();
    let registry = Arc::new(HandlerRegistry::new());
    let dispatcher = started(&registry, &script);
    let (tx, rx) = bounded(4);

    registry.register(OpTag::Read, Arc::new(tagged("h1")));
    dispatcher.dispatch("read", Vec::new(), Priority::Normal, Some(outcome_to(&tx)));
    let result = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(result, Ok(Some("h1".to_string())));

    registry.remove(OpTag::Read);
    dispatcher.dispatch("read", Vec::new(), Priority::Normal, Some(outcome_to(&tx)));
    // A removed handler is never called.
    let result = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(result, Err(libc::ENOSYS));

    assert!(dispatcher.shutdown(Duration::from_secs(1)));
}

fn recording_executor() -> (Arc<dyn WriteExecutor>, Arc<Mutex<Vec<u8>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let executor: Arc<dyn WriteExecutor> =
        Arc::new(move |job: &WriteJob| -> Result<usize, i32> {
            sink.lock().extend_from_slice(job.bytes());
            Ok(job.size)
        });
    (executor, log)
}

#[test]
fn same_priority_completions_keep_enqueue_order() {
    let queues = WriteQueueManager::default();
    let order = Arc::new(Mutex::new(Vec::new()));
    for i in 0..20u8 {
        let order = Arc::clone(&order);
        queues.enqueue(
            WriteJob::new(3, None, WritePayload::Owned(vec![i]))
                .with_priority(WritePriority::High)
                .on_complete(move |_| order.lock().push(i)),
        );
    }
    let (executor, log) = recording_executor();
    assert_eq!(queues.process_all(executor), 20);
    let expected: Vec<u8> = (0..20).collect();
    assert_eq!(*order.lock(), expected);
    assert_eq!(*log.lock(), expected);
}

#[test]
fn urgent_runs_before_later_normals() {
    let queues = WriteQueueManager::default();
    queues.enqueue(WriteJob::new(5, None, WritePayload::Owned(b"n".to_vec())));
    queues.enqueue(
        WriteJob::new(5, None, WritePayload::Owned(b"U".to_vec()))
            .with_priority(WritePriority::Urgent),
    );
    for chunk in [b"x", b"y"] {
        queues.enqueue(WriteJob::new(5, None, WritePayload::Owned(chunk.to_vec())));
    }
    let (executor, log) = recording_executor();
    queues.process_all(executor);
    assert_eq!(*log.lock(), b"Unxy".to_vec());
}

#[test]
fn full_queue_refuses_without_dropping() {
    let k = 4;
    let mut config = WriteQueueConfig::default();
    config.fd_max_queue_size.insert(9, k);
    let queues = WriteQueueManager::new(config);
    let (tx, rx) = crossbeam_channel::unbounded();

    for i in 0..k {
        let id = queues.enqueue(WriteJob::new(9, None, WritePayload::Owned(vec![i as u8])));
        assert_ne!(id, 0);
    }
    let refused = queues.enqueue(
        WriteJob::new(9, None, WritePayload::Owned(vec![0xff]))
            .on_error(move |code| tx.send(code).unwrap()),
    );
    assert_eq!(refused, 0);
    assert_eq!(rx.try_recv(), Ok(-libc::EAGAIN));
    assert_eq!(queues.queue_size(9), k);

    let (executor, log) = recording_executor();
    assert_eq!(queues.process_all(executor), k);
    assert_eq!(*log.lock(), vec![0, 1, 2, 3]);
    assert_eq!(queues.stats(9).unwrap().rejected, 1);
}

#[derive(Default)]
struct Trace {
    states: Mutex<Vec<ShutdownState>>,
}

impl ShutdownObserver for Trace {
    fn on_phase(&self, phase: ShutdownState) {
        self.states.lock().push(phase);
    }
}

#[test]
fn observed_states_only_move_forward() {
    let manager = Arc::new(ShutdownManager::default());
    let trace = Arc::new(Trace::default());
    let observer: Arc<dyn ShutdownObserver> = trace.clone();
    manager.add_observer(&observer);

    // Force while the graceful sequence is still draining.
    let weak = Arc::downgrade(&manager);
    manager.add_phase_hook(ShutdownState::Draining, move || {
        if let Some(manager) = weak.upgrade() {
            manager.force("race");
        }
    });
    let stats = manager.initiate("test", Duration::from_secs(1)).unwrap();
    assert!(!stats.graceful);

    let full = [
        ShutdownState::Draining,
        ShutdownState::Unmounting,
        ShutdownState::Closed,
    ];
    let seen = trace.states.lock().clone();
    assert!(seen.windows(2).all(|w| w[0] < w[1]), "{seen:?}");
    assert!(seen.iter().all(|s| full.contains(s)));
    assert_eq!(seen, vec![ShutdownState::Draining, ShutdownState::Closed]);
}

#[test]
fn graceful_shutdown_leaves_nothing_pending() {
    let script = ScriptThread::spawn("props-drain").unwrap();
    let registry = Arc::new(HandlerRegistry::new());
    let dispatcher = started(&registry, &script);
    let queues = Arc::new(WriteQueueManager::default());
    let (executor, _log) = recording_executor();
    queues.process_all(executor);
    for fd in 1..4 {
        for _ in 0..5 {
            queues.enqueue(WriteJob::new(fd, None, WritePayload::Owned(vec![fd as u8])));
        }
    }
    let ran = Arc::new(AtomicUsize::new(0));
    for _ in 0..10 {
        let ran = Arc::clone(&ran);
        dispatcher.dispatch_custom(
            "noop",
            Box::new(move |_, _| {
                ran.fetch_add(1, Ordering::SeqCst);
            }),
            Priority::Low,
            None,
        );
    }

    let manager = ShutdownManager::default();
    manager.set_dispatcher(Some(Arc::clone(&dispatcher)));
    manager.set_write_queues(Some(Arc::clone(&queues)));
    let stats = manager.initiate("test", Duration::from_secs(5)).unwrap();

    assert!(stats.graceful);
    assert_eq!(stats.final_state, ShutdownState::Closed);
    assert_eq!(queues.total_queue_size(), 0);
    assert!(queues.all_stats().iter().all(|s| s.queue_size == 0));
    assert_eq!(dispatcher.pending_count(), 0);
    // Accepted dispatcher work ran during draining instead of being cancelled.
    assert_eq!(ran.load(Ordering::SeqCst), 10);
}

#[test]
fn force_cancels_every_queued_job_once() {
    let script = ScriptThread::spawn("props-force").unwrap();
    let registry = Arc::new(HandlerRegistry::new());
    let dispatcher = started(&registry, &script);

    // Occupy the script thread with an in-flight job.
    let (release_tx, release_rx) = bounded::<()>(1);
    let (entered_tx, entered_rx) = bounded::<()>(1);
    dispatcher.dispatch_custom(
        "gate",
        Box::new(move |_, _| {
            entered_tx.send(()).unwrap();
            let _ = release_rx.recv();
        }),
        Priority::Normal,
        None,
    );
    entered_rx.recv_timeout(Duration::from_secs(2)).unwrap();

    let codes = Arc::new(Mutex::new(Vec::new()));
    let ran = Arc::new(AtomicUsize::new(0));
    for _ in 0..12 {
        let codes = Arc::clone(&codes);
        let ran = Arc::clone(&ran);
        let id = dispatcher.dispatch_custom(
            "getattr",
            Box::new(move |_, _| {
                ran.fetch_add(1, Ordering::SeqCst);
            }),
            Priority::Normal,
            Some(Box::new(move |code| codes.lock().push(code))),
        );
        assert_ne!(id, 0);
    }

    let queues = Arc::new(WriteQueueManager::default());
    let write_codes = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..6 {
        let write_codes = Arc::clone(&write_codes);
        queues.enqueue(
            WriteJob::new(2, Some(0), WritePayload::Owned(vec![1]))
                .on_error(move |code| write_codes.lock().push(code)),
        );
    }

    let manager = ShutdownManager::default();
    manager.set_dispatcher(Some(Arc::clone(&dispatcher)));
    manager.set_write_queues(Some(Arc::clone(&queues)));
    let stats = manager.force("test");
    assert!(stats.forced);
    assert_eq!(manager.state(), ShutdownState::Closed);

    release_tx.send(()).unwrap();
    thread::sleep(Duration::from_millis(100));

    assert_eq!(*codes.lock(), vec![-libc::ECANCELED; 12]);
    assert_eq!(*write_codes.lock(), vec![-libc::ECANCELED; 6]);
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(dispatcher.stats().cancelled, 12);
}

#[test]
fn late_rejection_after_reply_is_dropped() {
    let (sink, recorded) = RecordingReply::new();
    let ctx = RequestContext::new(OpTag::Open, 3, None, RequestArgs::default(), sink);
    assert!(ctx.reply_error(libc::EACCES));
    assert!(!ctx.reply_ok());
    assert_eq!(recorded.replies(), vec![RecordedReply::Error(libc::EACCES)]);
}
