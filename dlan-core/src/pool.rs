//! Elastic worker-thread pool.
//!
//! Workers are spawned on demand and parked on a condition variable while idle.
//! Completion is posted back over a channel and handled by the pool owner in
//! [`WorkerPool::process_events`], which is where `Runnable::finished` runs and
//! where idle workers above the floor are reclaimed once their lifetime expires.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// Unit of work executed by a pool worker.
pub trait Runnable: Send + 'static {
    /// Called on the worker before `run`.
    fn init(&mut self, _context: &WorkerContext) {}

    /// Executed on the worker thread.
    fn run(&mut self);

    /// Called on the pool owner's context after `run` returned.
    fn finished(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u64);

/// What a runnable knows about the worker executing it.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub id: WorkerId,
    pub thread_name: String,
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("worker pool is shutting down")]
    ShuttingDown,
    #[error("unable to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

enum WorkerEvent {
    Finished(WorkerId),
}

struct Slot {
    work: Option<Box<dyn Runnable>>,
    active: bool,
    to_stop: bool,
}

/// State shared between the pool and one worker thread. Only touched under `slot`.
struct WorkerShared {
    slot: Mutex<Slot>,
    wake: Condvar,
}

impl WorkerShared {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand work to an idle worker. Returns the work back if the worker is busy.
    fn assign(&self, work: Box<dyn Runnable>) -> Result<(), Box<dyn Runnable>> {
        let mut slot = self.lock();
        if slot.active {
            return Err(work);
        }
        slot.work = Some(work);
        slot.active = true;
        self.wake.notify_one();
        Ok(())
    }

    /// Take back the finished work item.
    fn take_finished(&self) -> Option<Box<dyn Runnable>> {
        let mut slot = self.lock();
        if slot.active {
            return None;
        }
        slot.work.take()
    }

    fn stop(&self) {
        let mut slot = self.lock();
        slot.to_stop = true;
        self.wake.notify_one();
    }
}

struct Worker {
    id: WorkerId,
    shared: Arc<WorkerShared>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn(id: WorkerId, events: Sender<WorkerEvent>) -> Result<Self, PoolError> {
        let shared = Arc::new(WorkerShared {
            slot: Mutex::new(Slot {
                work: None,
                active: false,
                to_stop: false,
            }),
            wake: Condvar::new(),
        });
        let context = WorkerContext {
            id,
            thread_name: format!("dlan-worker-{}", id.0),
        };
        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name(context.thread_name.clone())
            .spawn(move || worker_loop(context, thread_shared, events))?;
        Ok(Self {
            id,
            shared,
            handle: Some(handle),
        })
    }

    /// Signal the thread to stop and wait for it.
    fn stop_and_join(mut self) {
        self.shared.stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(worker = ?self.id, "worker thread panicked");
            }
        }
    }
}

fn worker_loop(context: WorkerContext, shared: Arc<WorkerShared>, events: Sender<WorkerEvent>) {
    loop {
        let mut work = {
            let mut slot = shared.lock();
            while !slot.active && !slot.to_stop {
                slot = shared.wake.wait(slot).unwrap_or_else(PoisonError::into_inner);
            }
            if slot.to_stop {
                return;
            }
            slot.work.take()
        };

        if let Some(w) = work.as_mut() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                w.init(&context);
                w.run();
            }));
            if outcome.is_err() {
                warn!(worker = ?context.id, "runnable panicked");
            }
        }

        {
            let mut slot = shared.lock();
            slot.work = work;
            slot.active = false;
        }
        if events.send(WorkerEvent::Finished(context.id)).is_err() {
            return;
        }
    }
}

struct IdleWorker {
    worker: Worker,
    /// `None` once the lifetime expired while at or below the floor.
    expires_at: Option<Instant>,
}

/// Pool of reusable worker threads with an idle floor of `min_workers`.
pub struct WorkerPool {
    min_workers: usize,
    idle_lifetime: Duration,
    next_id: u64,
    active: Vec<Worker>,
    idle: Vec<IdleWorker>,
    events_tx: Sender<WorkerEvent>,
    events_rx: Receiver<WorkerEvent>,
    shutting_down: bool,
}

impl WorkerPool {
    pub fn new(min_workers: usize, idle_lifetime: Duration) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        Self {
            min_workers,
            idle_lifetime,
            next_id: 0,
            active: Vec::new(),
            idle: Vec::new(),
            events_tx,
            events_rx,
            shutting_down: false,
        }
    }

    /// Run `work` on an idle worker, or on a new one if none is idle. Never waits.
    pub fn submit(&mut self, work: Box<dyn Runnable>) -> Result<WorkerId, PoolError> {
        if self.shutting_down {
            return Err(PoolError::ShuttingDown);
        }
        let mut work = work;
        while let Some(idle) = self.idle.pop() {
            match idle.worker.shared.assign(work) {
                Ok(()) => {
                    let id = idle.worker.id;
                    self.active.push(idle.worker);
                    return Ok(id);
                }
                Err(back) => {
                    // Not actually idle; keep it tracked as active.
                    work = back;
                    self.active.push(idle.worker);
                }
            }
        }
        self.next_id += 1;
        let id = WorkerId(self.next_id);
        let worker = Worker::spawn(id, self.events_tx.clone())?;
        debug!(worker = ?id, total = self.worker_count() + 1, "spawned worker");
        if let Err(back) = worker.shared.assign(work) {
            drop(back);
            warn!(worker = ?id, "fresh worker refused work");
        }
        self.active.push(worker);
        Ok(id)
    }

    /// Handle completions and idle expiry. Waits at most `timeout` for the first
    /// completion (or until the next idle deadline). Returns completions handled.
    pub fn process_events(&mut self, timeout: Duration) -> usize {
        let now = Instant::now();
        let mut wait = timeout;
        if let Some(deadline) = self.next_deadline() {
            wait = wait.min(deadline.saturating_duration_since(now));
        }
        let mut handled = 0;
        match self.events_rx.recv_timeout(wait) {
            Ok(event) => {
                self.handle_event(event);
                handled += 1;
            }
            Err(_) => {}
        }
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event);
            handled += 1;
        }
        self.reap_idle(Instant::now());
        handled
    }

    /// Non-blocking variant of [`process_events`](Self::process_events).
    pub fn try_process_events(&mut self) -> usize {
        self.process_events(Duration::ZERO)
    }

    /// Refuse new work and stop idle workers. Active workers finish normally.
    pub fn shutdown(&mut self) {
        self.shutting_down = true;
        for idle in self.idle.drain(..) {
            idle.worker.stop_and_join();
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    pub fn worker_count(&self) -> usize {
        self.active.len() + self.idle.len()
    }

    pub fn min_workers(&self) -> usize {
        self.min_workers
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.idle.iter().filter_map(|w| w.expires_at).min()
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Finished(id) => {
                let Some(pos) = self.active.iter().position(|w| w.id == id) else {
                    return;
                };
                let worker = self.active.remove(pos);
                if let Some(mut work) = worker.shared.take_finished() {
                    if panic::catch_unwind(AssertUnwindSafe(|| work.finished())).is_err() {
                        warn!(worker = ?id, "finished callback panicked");
                    }
                }
                if self.shutting_down {
                    worker.stop_and_join();
                    return;
                }
                self.idle.push(IdleWorker {
                    worker,
                    expires_at: Some(Instant::now() + self.idle_lifetime),
                });
            }
        }
    }

    fn reap_idle(&mut self, now: Instant) {
        let mut i = 0;
        while i < self.idle.len() {
            let expired = matches!(self.idle[i].expires_at, Some(t) if t <= now);
            if !expired {
                i += 1;
                continue;
            }
            if self.worker_count() > self.min_workers {
                let idle = self.idle.remove(i);
                debug!(worker = ?idle.worker.id, "stopping idle worker");
                idle.worker.stop_and_join();
            } else {
                self.idle[i].expires_at = None;
                i += 1;
            }
        }
    }
}

/// Stops idle workers; waits for active ones to return from `run` (they are not interrupted).
impl Drop for WorkerPool {
    fn drop(&mut self) {
        for idle in self.idle.drain(..) {
            idle.worker.stop_and_join();
        }
        for worker in self.active.drain(..) {
            worker.stop_and_join();
        }
    }
}
