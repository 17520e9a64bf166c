//! Integration modes
//!
//! In [`IntegrationMode::Direct`] the host thread owns the runtime, calls
//! into it directly and pumps guest timers with [`Runtime::update`].
//!
//! In [`IntegrationMode::Threaded`] a [`WorkerThread`] takes the runtime,
//! runs the entry point on its own thread and then serves a bounded
//! message queue. Other threads submit closures:
//!
//! - [`WorkerThread::call_sync`] blocks until the closure ran and returns
//!   its result;
//! - [`WorkerThread::call_async`] returns immediately; a completion
//!   closure runs on the worker afterwards.
//!
//! Queue, ticket counter and completion map share one mutex. The worker
//! waits on one condition variable, callers on the other.

use crate::error::{EmbedError, Result};
use crate::options::IntegrationMode;
use crate::runtime::{not_initialized, Runtime};
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

// ============================================================================
// Direct mode
// ============================================================================

impl Runtime {
    /// Current integration mode
    pub fn mode(&self) -> IntegrationMode {
        self.mode
    }

    /// Change the integration mode. Only allowed before the entry point runs.
    pub fn set_mode(&mut self, mode: IntegrationMode) -> Result<()> {
        let result = if self.entry_executed() {
            Err(EmbedError::AlreadyInitialized(
                "integration mode must be set before the entry point runs".to_string(),
            ))
        } else {
            self.mode = mode;
            Ok(())
        };
        self.record(result)
    }

    /// Advance guest time by `delta_seconds` and run every timer that
    /// became due. Returns the number of timers run.
    pub fn update(&mut self, delta_seconds: f32) -> Result<usize> {
        self.clear_exception();
        let result = if !delta_seconds.is_finite() || delta_seconds < 0.0 {
            Err(EmbedError::InvalidArgument(format!(
                "update delta must be a non-negative number of seconds, got {}",
                delta_seconds
            )))
        } else {
            match self.vm.as_mut() {
                None => Err(not_initialized()),
                Some(vm) if !vm.entry_executed() => {
                    Err(EmbedError::NotInitialized("entry point has not run".to_string()))
                }
                Some(vm) => {
                    let dt_ms = f64::from(delta_seconds) * 1000.0;
                    vm.with_native_scope(|vm| vm.pump_events(dt_ms)).map_err(EmbedError::from)
                }
            }
        };
        self.record(result)
    }

    /// Whether guest timers are queued
    pub fn has_pending_work(&self) -> bool {
        self.vm.as_ref().map(|vm| vm.has_pending_events()).unwrap_or(false)
    }
}

// ============================================================================
// Worker thread
// ============================================================================

type Job = Box<dyn FnOnce(&mut Runtime) -> Box<dyn Any + Send> + Send>;

enum Message {
    Sync { ticket: u64, job: Job },
    Async { job: Job },
    Stop,
}

enum Completion {
    Done(Box<dyn Any + Send>),
    Dropped,
    Panicked(String),
}

struct QueueState {
    queue: VecDeque<Message>,
    capacity: usize,
    next_ticket: u64,
    completed: FxHashMap<u64, Completion>,
    handoff: Option<Runtime>,
    startup: Option<Result<()>>,
    running: bool,
    stop: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    wake_worker: Condvar,
    wake_caller: Condvar,
}

/// A worker start that failed. The runtime is handed back unless the
/// worker thread itself died.
pub struct StartFailure {
    /// The runtime, unchanged unless the entry point ran and failed
    pub runtime: Option<Runtime>,
    /// Why the worker did not start
    pub error: EmbedError,
}

impl fmt::Debug for StartFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartFailure").field("error", &self.error).finish()
    }
}

impl fmt::Display for StartFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker failed to start: {}", self.error)
    }
}

impl std::error::Error for StartFailure {}

/// Dedicated thread that owns a runtime in threaded mode
pub struct WorkerThread {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<Option<Runtime>>>,
    thread_id: ThreadId,
}

fn fail(runtime: Runtime, error: EmbedError) -> std::result::Result<WorkerThread, StartFailure> {
    Err(StartFailure {
        runtime: Some(runtime),
        error,
    })
}

impl WorkerThread {
    /// Move `runtime` onto a new thread and run its entry point there.
    ///
    /// Blocks until the entry point finished. The runtime must be in
    /// threaded mode with a program loaded and the entry point not yet run.
    pub fn start(runtime: Runtime) -> std::result::Result<Self, StartFailure> {
        if runtime.mode() != IntegrationMode::Threaded {
            return fail(
                runtime,
                EmbedError::InvalidArgument("runtime is not in threaded mode".to_string()),
            );
        }
        if !runtime.is_loaded() {
            return fail(runtime, EmbedError::NotInitialized("no program loaded".to_string()));
        }
        if runtime.entry_executed() {
            return fail(runtime, EmbedError::ThreadAlreadyRunning);
        }

        let capacity = runtime.options().queue_capacity;
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                queue: VecDeque::with_capacity(capacity),
                capacity,
                next_ticket: 1,
                completed: FxHashMap::default(),
                handoff: Some(runtime),
                startup: None,
                running: false,
                stop: false,
            }),
            wake_worker: Condvar::new(),
            wake_caller: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let spawned = thread::Builder::new()
            .name("ember-worker".to_string())
            .spawn(move || worker_main(worker_shared));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                return Err(StartFailure {
                    runtime: shared.state.lock().handoff.take(),
                    error: EmbedError::Internal(format!("failed to spawn worker: {}", err)),
                });
            }
        };
        let thread_id = handle.thread().id();

        let startup = {
            let mut state = shared.state.lock();
            while state.startup.is_none() {
                shared.wake_caller.wait(&mut state);
            }
            state.startup.take()
        };

        match startup {
            Some(Ok(())) => {
                log::info!("worker thread started");
                Ok(Self {
                    shared,
                    handle: Some(handle),
                    thread_id,
                })
            }
            Some(Err(error)) => Err(StartFailure {
                runtime: handle.join().ok().flatten(),
                error,
            }),
            None => Err(StartFailure {
                runtime: None,
                error: EmbedError::Internal("worker reported no startup result".to_string()),
            }),
        }
    }

    /// Whether the worker is serving messages
    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    /// Messages waiting in the queue
    pub fn pending(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    fn check_caller(&self) -> Result<()> {
        if thread::current().id() == self.thread_id {
            return Err(EmbedError::WrongThread(
                "the worker cannot wait on its own queue".to_string(),
            ));
        }
        Ok(())
    }

    /// Run `f` on the worker and wait for its result
    pub fn call_sync<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Runtime) -> R + Send + 'static,
    {
        self.check_caller()?;
        let job: Job = Box::new(move |rt| Box::new(f(rt)) as Box<dyn Any + Send>);

        let completion = {
            let mut state = self.shared.state.lock();
            if !state.running || state.stop {
                return Err(EmbedError::ThreadNotRunning("worker is not running".to_string()));
            }
            if state.queue.len() >= state.capacity {
                return Err(EmbedError::QueueFull(state.capacity));
            }
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            state.queue.push_back(Message::Sync { ticket, job });
            self.shared.wake_worker.notify_one();
            loop {
                if let Some(done) = state.completed.remove(&ticket) {
                    break done;
                }
                self.shared.wake_caller.wait(&mut state);
            }
        };

        match completion {
            Completion::Done(result) => result
                .downcast::<R>()
                .map(|r| *r)
                .map_err(|_| EmbedError::Internal("worker returned an unexpected result type".to_string())),
            Completion::Dropped => Err(EmbedError::ThreadNotRunning(
                "worker stopped before the call ran".to_string(),
            )),
            Completion::Panicked(msg) => Err(EmbedError::Internal(format!("call panicked on the worker: {}", msg))),
        }
    }

    /// Queue `f` on the worker without waiting. `on_complete` runs on the
    /// worker right after `f`, with its result.
    pub fn call_async<R, F, C>(&self, f: F, on_complete: C) -> Result<()>
    where
        R: 'static,
        F: FnOnce(&mut Runtime) -> R + Send + 'static,
        C: FnOnce(&mut Runtime, R) + Send + 'static,
    {
        let job: Job = Box::new(move |rt| {
            let result = f(rt);
            on_complete(rt, result);
            Box::new(()) as Box<dyn Any + Send>
        });
        let mut state = self.shared.state.lock();
        if !state.running || state.stop {
            return Err(EmbedError::ThreadNotRunning("worker is not running".to_string()));
        }
        if state.queue.len() >= state.capacity {
            return Err(EmbedError::QueueFull(state.capacity));
        }
        state.queue.push_back(Message::Async { job });
        self.shared.wake_worker.notify_one();
        Ok(())
    }

    /// Stop the worker and take the runtime back. Messages still queued
    /// are dropped; their synchronous callers get an error.
    pub fn stop(mut self) -> Result<Runtime> {
        self.check_caller()?;
        self.shutdown()
            .ok_or_else(|| EmbedError::Internal("worker exited without its runtime".to_string()))
    }

    fn shutdown(&mut self) -> Option<Runtime> {
        let handle = self.handle.take()?;
        {
            let mut state = self.shared.state.lock();
            state.stop = true;
            state.queue.push_back(Message::Stop);
            self.shared.wake_worker.notify_all();
        }
        match handle.join() {
            Ok(runtime) => {
                log::info!("worker thread stopped");
                runtime
            }
            Err(_) => {
                log::error!("worker thread panicked");
                None
            }
        }
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        if self.handle.is_some() && thread::current().id() != self.thread_id {
            self.shutdown();
        }
    }
}

impl fmt::Debug for WorkerThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerThread")
            .field("thread", &self.thread_id)
            .field("running", &self.is_running())
            .finish()
    }
}

fn panic_text(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn drop_pending(state: &mut QueueState) {
    let mut dropped = 0;
    for message in state.queue.drain(..) {
        match message {
            Message::Sync { ticket, .. } => {
                state.completed.insert(ticket, Completion::Dropped);
                dropped += 1;
            }
            Message::Async { .. } => dropped += 1,
            Message::Stop => {}
        }
    }
    if dropped > 0 {
        log::warn!("worker stopping with {} queued messages dropped", dropped);
    }
}

fn worker_main(shared: Arc<Shared>) -> Option<Runtime> {
    let mut runtime = shared.state.lock().handoff.take()?;

    let startup = catch_unwind(AssertUnwindSafe(|| runtime.run_entry())).unwrap_or_else(|payload| {
        Err(EmbedError::Internal(format!(
            "entry point panicked: {}",
            panic_text(payload.as_ref())
        )))
    });
    let started = startup.is_ok();
    {
        let mut state = shared.state.lock();
        state.running = started;
        state.startup = Some(startup);
        shared.wake_caller.notify_all();
    }
    if !started {
        return Some(runtime);
    }

    loop {
        let message = {
            let mut state = shared.state.lock();
            while state.queue.is_empty() && !state.stop {
                shared.wake_worker.wait(&mut state);
            }
            if state.stop {
                drop_pending(&mut state);
                state.running = false;
                shared.wake_caller.notify_all();
                break;
            }
            state.queue.pop_front()
        };

        match message {
            Some(Message::Sync { ticket, job }) => {
                let completion = match catch_unwind(AssertUnwindSafe(|| job(&mut runtime))) {
                    Ok(result) => Completion::Done(result),
                    Err(payload) => {
                        let msg = panic_text(payload.as_ref());
                        log::error!("synchronous call panicked on the worker: {}", msg);
                        Completion::Panicked(msg)
                    }
                };
                shared.state.lock().completed.insert(ticket, completion);
                shared.wake_caller.notify_all();
            }
            Some(Message::Async { job }) => {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| job(&mut runtime))) {
                    log::error!("asynchronous call panicked on the worker: {}", panic_text(payload.as_ref()));
                }
            }
            Some(Message::Stop) | None => {
                let mut state = shared.state.lock();
                drop_pending(&mut state);
                state.running = false;
                shared.wake_caller.notify_all();
                break;
            }
        }
    }

    Some(runtime)
}
