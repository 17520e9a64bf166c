//! Integration tests for the integration modes
//!
//! Tests cover:
//! - Direct mode: timer pumping through `update`
//! - Threaded mode: worker start and stop, synchronous and asynchronous
//!   calls, concurrent submitters, queue limits and misuse

mod common;

use common::*;
use ember_embed::{
    EmbedError, IntegrationMode, MemberAccess, Runtime, RuntimeOptions, ValueHandle, WorkerThread,
};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn threaded() -> RuntimeOptions {
    RuntimeOptions {
        mode: IntegrationMode::Threaded,
        ..RuntimeOptions::default()
    }
}

fn start_worker(options: RuntimeOptions) -> WorkerThread {
    WorkerThread::start(loaded(options)).unwrap()
}

fn score_of(rt: &mut Runtime) -> i32 {
    rt.get_static_field("Game", "score").map(|v| v.as_int(-1)).unwrap_or(-1)
}

// ============================================================================
// Direct mode
// ============================================================================

#[test]
fn test_update_runs_due_timers() {
    let mut rt = started(RuntimeOptions::default());
    assert!(!rt.has_pending_work());

    rt.call_static("Game", "scheduleTick", &[&ValueHandle::float(100.0)]).unwrap();
    assert!(rt.has_pending_work());

    assert_eq!(rt.update(0.05).unwrap(), 0);
    assert_eq!(rt.get_static_field("Game", "ticks").unwrap().as_int(-1), 0);

    assert_eq!(rt.update(0.05).unwrap(), 1);
    assert_eq!(rt.get_static_field("Game", "ticks").unwrap().as_int(-1), 1);
    assert!(!rt.has_pending_work());
}

#[test]
fn test_update_argument_and_order_checks() {
    let mut rt = loaded(RuntimeOptions::default());
    assert!(matches!(rt.update(0.016), Err(EmbedError::NotInitialized(_))));

    rt.run_entry().unwrap();
    assert!(matches!(rt.update(-1.0), Err(EmbedError::InvalidArgument(_))));
    assert!(matches!(rt.update(f32::NAN), Err(EmbedError::InvalidArgument(_))));
    assert_eq!(rt.update(0.0).unwrap(), 0);
}

#[test]
fn test_mode_fixed_after_entry() {
    let mut rt = loaded(RuntimeOptions::default());
    rt.set_mode(IntegrationMode::Threaded).unwrap();
    rt.set_mode(IntegrationMode::Direct).unwrap();
    rt.run_entry().unwrap();
    assert!(matches!(
        rt.set_mode(IntegrationMode::Threaded),
        Err(EmbedError::AlreadyInitialized(_))
    ));
    assert_eq!(rt.mode(), IntegrationMode::Direct);
}

// ============================================================================
// Worker lifecycle
// ============================================================================

#[test]
fn test_start_rejects_direct_mode() {
    let failure = WorkerThread::start(loaded(RuntimeOptions::default())).unwrap_err();
    assert!(matches!(failure.error, EmbedError::InvalidArgument(_)));
    let rt = failure.runtime.unwrap();
    assert!(rt.is_loaded());
    assert!(!rt.entry_executed());
}

#[test]
fn test_start_requires_program() {
    let mut rt = Runtime::new(threaded());
    rt.initialize(&[]).unwrap();
    let failure = WorkerThread::start(rt).unwrap_err();
    assert!(matches!(failure.error, EmbedError::NotInitialized(_)));
    assert!(failure.runtime.is_some());
}

#[test]
fn test_worker_runs_entry_and_returns_runtime() {
    let worker = start_worker(threaded());
    assert!(worker.is_running());

    let started = worker
        .call_sync(|rt| rt.get_static_field("Game", "started").map(|v| v.as_bool(false)))
        .unwrap()
        .unwrap();
    assert!(started);

    let mut rt = worker.stop().unwrap();
    assert!(rt.entry_executed());
    assert_eq!(score_of(&mut rt), 0);
}

#[test]
fn test_stop_is_bounded() {
    let worker = start_worker(threaded());
    let begin = Instant::now();
    worker.stop().unwrap();
    assert!(begin.elapsed() < Duration::from_secs(5));
}

// ============================================================================
// Calls
// ============================================================================

#[test]
fn test_sync_calls_run_in_order() {
    let worker = start_worker(threaded());
    for i in 1..=50 {
        let score = worker
            .call_sync(|rt| {
                rt.call_static("Game", "addPoints", &[&ValueHandle::int(1)])?;
                Ok::<_, EmbedError>(score_of(rt))
            })
            .unwrap()
            .unwrap();
        assert_eq!(score, i);
    }
    let mut rt = worker.stop().unwrap();
    assert_eq!(score_of(&mut rt), 50);
}

#[test]
fn test_async_call_completes_on_worker() {
    let worker = start_worker(threaded());
    let (tx, rx) = mpsc::channel();

    worker
        .call_async(
            |rt| {
                rt.call_static("Game", "addPoints", &[&ValueHandle::int(9)]).ok();
                score_of(rt)
            },
            move |_rt, score| {
                tx.send((score, thread::current().name().map(str::to_string))).ok();
            },
        )
        .unwrap();

    let (score, thread_name) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(score, 9);
    assert_eq!(thread_name.as_deref(), Some("ember-worker"));
    worker.stop().unwrap();
}

#[test]
fn test_concurrent_submitters() {
    let worker = start_worker(threaded());
    let threads = 4;
    let calls_each = 25;

    thread::scope(|s| {
        for _ in 0..threads {
            s.spawn(|| {
                for _ in 0..calls_each {
                    worker
                        .call_sync(|rt| rt.call_static("Game", "addPoints", &[&ValueHandle::int(1)]).map(|_| ()))
                        .unwrap()
                        .unwrap();
                }
            });
        }
    });

    let mut rt = worker.stop().unwrap();
    assert_eq!(score_of(&mut rt), threads * calls_each);
}

#[test]
fn test_nested_sync_call_is_rejected() {
    let worker = Arc::new(start_worker(threaded()));
    let inner = Arc::clone(&worker);

    let nested = worker.call_sync(move |_rt| inner.call_sync(|_| ()).err()).unwrap();
    assert!(matches!(nested, Some(EmbedError::WrongThread(_))));

    let worker = Arc::try_unwrap(worker).unwrap();
    worker.stop().unwrap();
}

#[test]
fn test_queue_full() {
    let options = RuntimeOptions {
        queue_capacity: 1,
        ..threaded()
    };
    let worker = start_worker(options);

    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    worker
        .call_async(
            move |_rt| {
                entered_tx.send(()).ok();
                release_rx.recv().ok();
            },
            |_rt, _| {},
        )
        .unwrap();
    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    // The worker is busy; one message fits in the queue
    let (done_tx, done_rx) = mpsc::channel();
    worker.call_async(|_rt| (), move |_rt, _| done_tx.send(()).unwrap_or(())).unwrap();
    assert_eq!(worker.pending(), 1);
    assert!(matches!(
        worker.call_async(|_rt| (), |_rt, _| {}),
        Err(EmbedError::QueueFull(1))
    ));

    release_tx.send(()).unwrap();
    done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    worker.stop().unwrap();
}

#[test]
fn test_worker_survives_panicking_call() {
    let worker = start_worker(threaded());
    let err = worker.call_sync(|_rt| -> i32 { panic!("job failed") }).unwrap_err();
    assert!(matches!(err, EmbedError::Internal(_)));
    assert_eq!(worker.call_sync(|rt| score_of(rt)).unwrap(), 0);
    worker.stop().unwrap();
}
