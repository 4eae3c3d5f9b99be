//! Per-stage request queue and worker pool.
//!
//! - Pending requests live in a deque; the stage discipline decides whether
//!   workers take the newest (LIFO) or the oldest (FIFO) request
//! - Every enqueue submits exactly one work ticket to the pool
//! - `drain_and_cancel` empties the deque and the ticket backlog in one
//!   critical section and hands the orphaned requests back to the caller
//! - Workers run at the lowest scheduling priority

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::request::LoadRequest;
use crate::config::MAX_WORKERS;
use crate::models::{QueueDiscipline, Stage};

/// How long an idle worker waits before re-checking shutdown and pool size.
const IDLE_POLL_MS: u64 = 100;

/// Runs one dequeued request on a worker thread.
pub type StageHandler = Arc<dyn Fn(LoadRequest) + Send + Sync>;

struct Shared {
    stage: Stage,
    discipline: QueueDiscipline,
    pending: Mutex<VecDeque<LoadRequest>>,
    ticket_tx: Sender<()>,
    ticket_rx: Receiver<()>,
    handler: StageHandler,
    shutdown: AtomicBool,
    target_workers: AtomicUsize,
    live_workers: AtomicUsize,
    /// Workers holding a request (or about to take one).
    active: AtomicUsize,
}

impl Shared {
    fn pop(&self) -> Option<LoadRequest> {
        let mut pending = self.pending.lock();
        match self.discipline {
            QueueDiscipline::Lifo => pending.pop_back(),
            QueueDiscipline::Fifo => pending.pop_front(),
        }
    }

    /// Lets one worker exit when the pool is larger than requested.
    fn retire_if_surplus(&self) -> bool {
        let target = self.target_workers.load(Ordering::Acquire);
        self.live_workers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live > target).then(|| live - 1)
            })
            .is_ok()
    }
}

pub struct StageQueue {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    next_worker_id: AtomicUsize,
}

impl StageQueue {
    pub fn new<F>(stage: Stage, workers: usize, handler: F) -> Self
    where
        F: Fn(LoadRequest) + Send + Sync + 'static,
    {
        let (ticket_tx, ticket_rx) = flume::unbounded();
        let queue = Self {
            shared: Arc::new(Shared {
                stage,
                discipline: stage.discipline(),
                pending: Mutex::new(VecDeque::new()),
                ticket_tx,
                ticket_rx,
                handler: Arc::new(handler),
                shutdown: AtomicBool::new(false),
                target_workers: AtomicUsize::new(0),
                live_workers: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
            }),
            workers: Mutex::new(Vec::new()),
            next_worker_id: AtomicUsize::new(0),
        };
        queue.set_workers(workers);
        debug!(%stage, workers = queue.worker_count(), "Started stage queue");
        queue
    }

    pub fn stage(&self) -> Stage {
        self.shared.stage
    }

    /// Appends a request and schedules one unit of work. Never blocks on
    /// the workers.
    ///
    /// Returns false once the queue has been shut down.
    pub fn enqueue(&self, request: LoadRequest) -> bool {
        let mut pending = self.shared.pending.lock();
        // Checked under the lock; shutdown flips the flag under it too.
        if self.shared.shutdown.load(Ordering::Acquire) {
            return false;
        }

        trace!(stage = %self.shared.stage, ?request, "Enqueued");
        pending.push_back(request);
        // Sent under the lock so drain_and_cancel sees both or neither.
        self.shared.ticket_tx.send(()).is_ok()
    }

    /// Removes every pending request and cancels the pool backlog.
    ///
    /// Returns the orphaned requests in queue order so the caller can reset
    /// their loading state. Requests already taken by a worker are not
    /// affected.
    pub fn drain_and_cancel(&self) -> Vec<LoadRequest> {
        let mut pending = self.shared.pending.lock();
        let orphaned: Vec<LoadRequest> = pending.drain(..).collect();
        let cancelled = self.shared.ticket_rx.drain().count();
        drop(pending);

        if !orphaned.is_empty() {
            debug!(
                stage = %self.shared.stage,
                orphaned = orphaned.len(),
                cancelled,
                "Drained stage queue"
            );
        }
        orphaned
    }

    /// Number of requests waiting for a worker.
    pub fn len(&self) -> usize {
        self.shared.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.pending.lock().is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Whether requests are pending or being processed.
    pub fn is_busy(&self) -> bool {
        self.active_count() > 0 || !self.is_empty()
    }

    pub fn worker_count(&self) -> usize {
        self.shared.target_workers.load(Ordering::Acquire)
    }

    /// Grows or shrinks the pool. Surplus workers exit after their current
    /// request.
    pub fn set_workers(&self, count: usize) {
        let count = count.clamp(1, MAX_WORKERS);
        self.shared.target_workers.store(count, Ordering::Release);

        let mut workers = self.workers.lock();
        workers.retain(|handle| !handle.is_finished());

        while self.shared.live_workers.load(Ordering::Acquire) < count {
            self.shared.live_workers.fetch_add(1, Ordering::AcqRel);
            let worker_id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
            let shared = Arc::clone(&self.shared);

            let handle = thread::Builder::new()
                .name(format!("{}-worker-{}", self.shared.stage, worker_id))
                .spawn(move || worker_loop(worker_id, shared))
                .expect("Failed to spawn stage worker");
            workers.push(handle);
        }
    }

    /// Stops the workers and waits for them to finish their current request.
    /// Pending requests are left in the deque for `drain_and_cancel`; no
    /// enqueue succeeds afterwards.
    pub fn shutdown(&self) {
        {
            let _pending = self.shared.pending.lock();
            if self.shared.shutdown.swap(true, Ordering::AcqRel) {
                return;
            }
        }
        debug!(stage = %self.shared.stage, "Shutting down stage queue");

        let current = thread::current().id();
        let handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for handle in handles {
            // A worker may end up dropping the pipeline itself.
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
    }
}

impl Drop for StageQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Worker thread loop.
fn worker_loop(worker_id: usize, shared: Arc<Shared>) {
    lower_thread_priority();
    debug!(stage = %shared.stage, worker_id, "Stage worker started");

    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            shared.live_workers.fetch_sub(1, Ordering::AcqRel);
            break;
        }
        if shared.retire_if_surplus() {
            break;
        }

        match shared
            .ticket_rx
            .recv_timeout(Duration::from_millis(IDLE_POLL_MS))
        {
            Ok(()) => {
                // Counted before the pop so the stage never looks idle while
                // a request is in hand.
                shared.active.fetch_add(1, Ordering::AcqRel);
                if let Some(request) = shared.pop() {
                    let handler = Arc::clone(&shared.handler);
                    let result = catch_unwind(AssertUnwindSafe(move || handler(request)));
                    if result.is_err() {
                        warn!(stage = %shared.stage, worker_id, "Stage handler panicked");
                    }
                }
                shared.active.fetch_sub(1, Ordering::AcqRel);
            }
            Err(flume::RecvTimeoutError::Timeout) => continue,
            Err(flume::RecvTimeoutError::Disconnected) => {
                shared.live_workers.fetch_sub(1, Ordering::AcqRel);
                break;
            }
        }
    }

    debug!(stage = %shared.stage, worker_id, "Stage worker stopped");
}

/// Decode work must not compete with the display thread.
#[cfg(target_os = "linux")]
fn lower_thread_priority() {
    // On Linux PRIO_PROCESS with id 0 applies to the calling thread only.
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS as _, 0, 19) };
    if rc != 0 {
        trace!("Could not lower worker thread priority");
    }
}

#[cfg(not(target_os = "linux"))]
fn lower_thread_priority() {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ImageQuality, Photo};
    use std::path::PathBuf;
    use std::time::Instant;

    fn request(name: &str) -> LoadRequest {
        let photo = Arc::new(Photo::new(PathBuf::from(format!("/p/{name}")), 1, 1));
        LoadRequest::image(photo, ImageQuality::Thumb)
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    /// Queue whose single worker blocks until `release` receives.
    fn blocked_queue(stage: Stage) -> (StageQueue, Arc<Mutex<Vec<String>>>, Sender<()>) {
        let order = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&order);
        let (release_tx, release_rx) = flume::unbounded::<()>();
        let queue = StageQueue::new(stage, 1, move |req: LoadRequest| {
            let name = req.photo().file_name();
            if name == "blocker" {
                let _ = release_rx.recv();
            }
            sink.lock().push(name);
        });
        (queue, order, release_tx)
    }

    #[test]
    fn test_fifo_order() {
        let (queue, order, release) = blocked_queue(Stage::Thumbnail);
        queue.enqueue(request("blocker"));
        assert!(wait_until(|| queue.is_empty()));

        for name in ["a", "b", "c"] {
            queue.enqueue(request(name));
        }
        release.send(()).unwrap();

        assert!(wait_until(|| order.lock().len() == 4));
        assert_eq!(*order.lock(), vec!["blocker", "a", "b", "c"]);
    }

    #[test]
    fn test_lifo_order() {
        let (queue, order, release) = blocked_queue(Stage::Exif);
        queue.enqueue(request("blocker"));
        assert!(wait_until(|| queue.is_empty()));

        for name in ["a", "b", "c"] {
            queue.enqueue(request(name));
        }
        release.send(()).unwrap();

        assert!(wait_until(|| order.lock().len() == 4));
        assert_eq!(*order.lock(), vec!["blocker", "c", "b", "a"]);
    }

    #[test]
    fn test_drain_and_cancel_returns_pending() {
        let (queue, order, release) = blocked_queue(Stage::Original);
        queue.enqueue(request("blocker"));
        assert!(wait_until(|| queue.is_empty()));

        queue.enqueue(request("a"));
        queue.enqueue(request("b"));
        assert_eq!(queue.len(), 2);

        let orphaned = queue.drain_and_cancel();
        let names: Vec<String> = orphaned.iter().map(|r| r.photo().file_name()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(queue.is_empty());

        release.send(()).unwrap();
        assert!(wait_until(|| !queue.is_busy()));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(*order.lock(), vec!["blocker"]);

        // The queue keeps working after a drain.
        queue.enqueue(request("c"));
        assert!(wait_until(|| order.lock().len() == 2));
    }

    #[test]
    fn test_panicking_handler_keeps_worker_alive() {
        let done = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&done);
        let queue = StageQueue::new(Stage::Thumbnail, 1, move |req: LoadRequest| {
            if req.photo().file_name() == "boom" {
                panic!("decoder exploded");
            }
            counter.fetch_add(1, Ordering::SeqCst);
        });

        queue.enqueue(request("boom"));
        queue.enqueue(request("ok"));
        assert!(wait_until(|| done.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn test_resize_pool() {
        let queue = StageQueue::new(Stage::Thumbnail, 3, |_req: LoadRequest| {});
        assert_eq!(queue.worker_count(), 3);

        queue.set_workers(1);
        assert!(wait_until(
            || queue.shared.live_workers.load(Ordering::Acquire) == 1
        ));

        queue.set_workers(2);
        assert_eq!(queue.shared.live_workers.load(Ordering::Acquire), 2);
    }

    #[test]
    fn test_enqueue_after_shutdown_is_rejected() {
        let queue = StageQueue::new(Stage::HighQuality, 1, |_req: LoadRequest| {});
        queue.shutdown();
        assert!(!queue.enqueue(request("a")));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_shutdown_leaves_pending_for_drain() {
        let (queue, order, release) = blocked_queue(Stage::Thumbnail);
        queue.enqueue(request("blocker"));
        assert!(wait_until(|| queue.is_empty()));
        queue.enqueue(request("a"));

        thread::scope(|s| {
            s.spawn(|| queue.shutdown());
            assert!(wait_until(|| queue.shared.shutdown.load(Ordering::Acquire)));
            assert!(!queue.enqueue(request("late")));
            release.send(()).unwrap();
        });

        let names: Vec<String> = queue
            .drain_and_cancel()
            .iter()
            .map(|r| r.photo().file_name())
            .collect();
        assert_eq!(names, vec!["a"]);
        assert_eq!(*order.lock(), vec!["blocker"]);
    }
}
