//! Module with the worker thread pool that services [`Job`]s.
//!
//! The [`Server`] adds a job (a [`Channel`] with a request ready) to the
//! [`ThreadedTaskDispatcher`] using [`Dispatch::add_task`], one of the worker
//! threads will then call [`Job::service`].
//!
//! [`Server`]: crate::Server
//! [`Channel`]: crate::Channel

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use std::{fmt, io, thread};

use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, trace, warn};

use crate::error::convert_panic;

/// Unit of work run on a worker thread.
pub trait Job: Send + Sync {
    /// Do the work.
    ///
    /// Called on a worker thread.
    fn service(&self);

    /// Called on the thread that adds the job, before it's visible to the
    /// worker threads.
    ///
    /// If this returns an error the job is cancelled and never serviced.
    fn defer(&self) -> io::Result<()> {
        Ok(())
    }

    /// Called when the job is removed from the queue without being serviced.
    fn cancel(&self) {}
}

/// Something that can run [`Job`]s.
pub trait Dispatch: Send + Sync {
    /// Add `job` to the queue.
    ///
    /// Returns an error if [`Job::defer`] failed, in which case the job is
    /// cancelled.
    fn add_task(&self, job: Arc<dyn Job>) -> io::Result<()>;
}

/// Item in the queue, `None` tells a worker thread to stop.
type QueueItem = Option<Arc<dyn Job>>;

/// Thread pool with an unbounded work queue.
pub struct ThreadedTaskDispatcher {
    sender: Sender<QueueItem>,
    receiver: Receiver<QueueItem>,
    shared: Arc<Shared>,
    spawner: Spawner,
}

/// Data shared between the dispatcher and the worker threads.
struct Shared {
    state: Mutex<State>,
    /// Notified when a worker thread stops.
    thread_exit: Condvar,
    /// Number of worker threads currently servicing a job.
    active: AtomicUsize,
}

struct State {
    /// Worker slot id -> thread handle (if spawned as thread).
    threads: BTreeMap<usize, Option<thread::JoinHandle<()>>>,
    /// Number of stop signals (`None`s) in the queue.
    stop_count: usize,
}

/// How worker threads are started.
enum Spawner {
    Threads,
    /// Only record the slot ids, no thread is started.
    #[cfg(test)]
    Record(Arc<Mutex<Vec<usize>>>),
}

impl ThreadedTaskDispatcher {
    /// Create a new dispatcher without worker threads.
    ///
    /// Use [`ThreadedTaskDispatcher::set_thread_count`] to start worker
    /// threads.
    pub fn new() -> ThreadedTaskDispatcher {
        ThreadedTaskDispatcher::with_spawner(Spawner::Threads)
    }

    fn with_spawner(spawner: Spawner) -> ThreadedTaskDispatcher {
        let (sender, receiver) = crossbeam_channel::unbounded();
        ThreadedTaskDispatcher {
            sender,
            receiver,
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    threads: BTreeMap::new(),
                    stop_count: 0,
                }),
                thread_exit: Condvar::new(),
                active: AtomicUsize::new(0),
            }),
            spawner,
        }
    }

    /// Set the number of worker threads to `count`.
    ///
    /// When increasing the number of threads new threads are started using
    /// the lowest unused slot ids. When decreasing the number of threads
    /// a stop signal is queued for each thread that needs to stop, workers
    /// finish the job they're servicing before stopping.
    pub fn set_thread_count(&self, count: usize) -> io::Result<()> {
        let mut state = self.shared.lock();
        let mut running = state.threads.len().saturating_sub(state.stop_count);
        let mut id = 0;
        while running < count {
            while state.threads.contains_key(&id) {
                id += 1;
            }
            let handle = self.spawn(id)?;
            let _ = state.threads.insert(id, handle);
            running += 1;
            id += 1;
        }

        if running > count {
            let stop = running - count;
            debug!(stop = stop; "stopping worker threads");
            for _ in 0..stop {
                // Can't fail as we hold a receiver ourselves.
                let _ = self.sender.send(None);
            }
            state.stop_count += stop;
        }
        Ok(())
    }

    fn spawn(&self, id: usize) -> io::Result<Option<thread::JoinHandle<()>>> {
        match &self.spawner {
            Spawner::Threads => {
                let receiver = self.receiver.clone();
                let shared = self.shared.clone();
                thread::Builder::new()
                    .name(format!("hearth-worker-{id}"))
                    .spawn(move || worker(id, &receiver, &shared))
                    .map(Some)
            }
            #[cfg(test)]
            Spawner::Record(ids) => {
                ids.lock().unwrap().push(id);
                Ok(None)
            }
        }
    }

    /// Returns the number of worker threads currently servicing a job.
    pub fn active_count(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Returns the number of items (jobs and stop signals) in the queue.
    pub fn queue_len(&self) -> usize {
        self.receiver.len()
    }

    /// Shutdown the dispatcher.
    ///
    /// If `cancel_pending` is `true` all jobs still in the queue are cancelled
    /// (see [`Job::cancel`]), otherwise they're serviced before the worker
    /// threads stop. Waits up to `timeout` for all worker threads to stop.
    ///
    /// Returns `true` if all worker threads stopped, `false` if some are still
    /// running after `timeout`.
    pub fn shutdown(&self, cancel_pending: bool, timeout: Duration) -> bool {
        if cancel_pending {
            let mut cancelled = 0;
            let mut stops = 0;
            while let Ok(item) = self.receiver.try_recv() {
                match item {
                    Some(job) => {
                        job.cancel();
                        cancelled += 1;
                    }
                    None => stops += 1,
                }
            }
            if cancelled != 0 {
                warn!(cancelled = cancelled; "cancelling pending tasks");
            }
            let mut state = self.shared.lock();
            state.stop_count = state.stop_count.saturating_sub(stops);
        }

        if let Err(err) = self.set_thread_count(0) {
            // Can't happen, stopping threads doesn't spawn any.
            error!(error:% = err; "failed to stop worker threads");
        }

        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        while !state.threads.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                warn!(threads = state.threads.len(); "worker thread(s) still running after shutdown");
                return false;
            }
            state = self
                .shared
                .thread_exit
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

impl Default for ThreadedTaskDispatcher {
    fn default() -> ThreadedTaskDispatcher {
        ThreadedTaskDispatcher::new()
    }
}

impl Dispatch for ThreadedTaskDispatcher {
    fn add_task(&self, job: Arc<dyn Job>) -> io::Result<()> {
        if let Err(err) = job.defer() {
            job.cancel();
            return Err(err);
        }
        // Can't fail as we hold a receiver ourselves.
        let _ = self.sender.send(Some(job));

        let queue_size = self.receiver.len();
        let state = self.shared.lock();
        let idle = (state.threads.len().saturating_sub(state.stop_count))
            .saturating_sub(self.shared.active.load(Ordering::Acquire));
        if queue_size > idle {
            warn!(target: "hearth::queue", depth = queue_size - idle; "task queue depth");
        }
        Ok(())
    }
}

impl fmt::Debug for ThreadedTaskDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("ThreadedTaskDispatcher")
            .field("threads", &state.threads.keys().collect::<Vec<_>>())
            .field("stop_count", &state.stop_count)
            .field("active", &self.shared.active.load(Ordering::Relaxed))
            .field("queue_len", &self.receiver.len())
            .finish()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Worker thread main loop.
fn worker(id: usize, receiver: &Receiver<QueueItem>, shared: &Shared) {
    debug!(worker_id = id; "starting worker thread");
    // Receiving only fails if the dispatcher is dropped.
    while let Ok(Some(job)) = receiver.recv() {
        let _ = shared.active.fetch_add(1, Ordering::AcqRel);
        trace!(worker_id = id; "servicing task");
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| job.service())) {
            let msg = convert_panic(panic);
            error!(worker_id = id; "task panicked: {msg}");
        }
        let _ = shared.active.fetch_sub(1, Ordering::AcqRel);
    }

    let mut state = shared.lock();
    // If the dispatcher was dropped the stop signal was never send.
    state.stop_count = state.stop_count.saturating_sub(1);
    // Dropping the `JoinHandle` detaches the (our) thread.
    drop(state.threads.remove(&id));
    drop(state);
    shared.thread_exit.notify_all();
    debug!(worker_id = id; "stopping worker thread");
}
