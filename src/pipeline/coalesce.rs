//! Coalesces bursts of refresh triggers into single runs.
//!
//! Each `trigger` bumps a generation counter. A dedicated thread runs the job
//! and, when it finishes, compares the generation it started from with the
//! current one: if the counter moved the job runs once more, otherwise the
//! coalescer goes idle. Any number of triggers during a run cost one rerun.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use flume::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, trace};

struct State {
    generation: AtomicU64,
    /// Generation observed at the start of the last completed run.
    completed: AtomicU64,
    scheduled: AtomicBool,
    runs: AtomicU64,
}

pub struct Coalescer {
    state: Arc<State>,
    wake_tx: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Coalescer {
    pub fn new<F>(name: &str, job: F) -> Self
    where
        F: Fn() + Send + 'static,
    {
        let state = Arc::new(State {
            generation: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            scheduled: AtomicBool::new(false),
            runs: AtomicU64::new(0),
        });
        let (wake_tx, wake_rx) = flume::unbounded();

        let thread_state = Arc::clone(&state);
        let handle = thread::Builder::new()
            .name(format!("{name}-coalescer"))
            .spawn(move || run_loop(thread_state, wake_rx, job))
            .expect("Failed to spawn coalescer thread");

        Self {
            state,
            wake_tx: Mutex::new(Some(wake_tx)),
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Requests a run. Returns the new generation.
    pub fn trigger(&self) -> u64 {
        let generation = self.state.generation.fetch_add(1, Ordering::AcqRel) + 1;
        if !self.state.scheduled.swap(true, Ordering::AcqRel) {
            if let Some(tx) = self.wake_tx.lock().as_ref() {
                let _ = tx.send(());
            }
        }
        generation
    }

    pub fn generation(&self) -> u64 {
        self.state.generation.load(Ordering::Acquire)
    }

    /// Whether every trigger so far has been followed by a completed run.
    pub fn is_idle(&self) -> bool {
        !self.state.scheduled.load(Ordering::Acquire)
            && self.state.completed.load(Ordering::Acquire) == self.generation()
    }

    /// Number of times the job has run.
    pub fn runs(&self) -> u64 {
        self.state.runs.load(Ordering::Acquire)
    }

    /// Stops the thread after any scheduled run.
    pub fn stop(&self) {
        self.wake_tx.lock().take();
        if let Some(handle) = self.handle.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for Coalescer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop<F: Fn()>(state: Arc<State>, wake_rx: Receiver<()>, job: F) {
    while wake_rx.recv().is_ok() {
        loop {
            let started = state.generation.load(Ordering::Acquire);
            job();
            state.runs.fetch_add(1, Ordering::AcqRel);
            state.completed.store(started, Ordering::Release);

            if state.generation.load(Ordering::Acquire) != started {
                trace!(started, "Generation moved during run, running again");
                continue;
            }

            state.scheduled.store(false, Ordering::Release);
            // A trigger between the check and the store saw `scheduled` set
            // and sent no wake-up; pick it up here.
            if state.generation.load(Ordering::Acquire) != started
                && !state.scheduled.swap(true, Ordering::AcqRel)
            {
                continue;
            }
            break;
        }
    }
    debug!("Coalescer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

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

    #[test]
    fn test_single_trigger_runs_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let coalescer = Coalescer::new("test", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        coalescer.trigger();
        assert!(wait_until(|| coalescer.is_idle()));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_burst_during_run_costs_one_rerun() {
        let (entered_tx, entered_rx) = flume::unbounded::<()>();
        let (release_tx, release_rx) = flume::unbounded::<()>();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);

        let coalescer = Coalescer::new("test", move || {
            let _ = entered_tx.send(());
            let _ = release_rx.recv();
            counter.fetch_add(1, Ordering::SeqCst);
        });

        coalescer.trigger();
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // Burst while the first run is blocked.
        for _ in 0..10 {
            coalescer.trigger();
        }

        release_tx.send(()).unwrap();
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        release_tx.send(()).unwrap();

        assert!(wait_until(|| coalescer.is_idle()));
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(coalescer.generation(), 11);
    }

    #[test]
    fn test_triggers_after_idle_run_again() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let coalescer = Coalescer::new("test", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        coalescer.trigger();
        assert!(wait_until(|| coalescer.is_idle()));
        coalescer.trigger();
        assert!(wait_until(|| coalescer.is_idle() && coalescer.runs() == 2));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
