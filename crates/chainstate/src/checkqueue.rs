//! A fixed pool of worker threads draining a shared queue of checks, with a
//! batch guard the submitting thread closes to collect the verdict.
//!
//! Checks must be side-effect-free; the only observable output is the first
//! failure. Once a check fails, the rest of the batch is skipped.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// A unit of deferred verification.
pub trait QueueCheck: Send + 'static {
    type Error: Send + 'static;

    fn execute(self) -> Result<(), Self::Error>;
}

struct QueueState<T: QueueCheck> {
    queue: VecDeque<T>,
    /// Checks queued or currently executing for the open batch.
    pending: usize,
    failure: Option<T::Error>,
    shutdown: bool,
}

struct QueueShared<T: QueueCheck> {
    state: Mutex<QueueState<T>>,
    /// Wakes workers when checks arrive or shutdown begins.
    worker_cv: Condvar,
    /// Wakes the submitting thread when the batch drains.
    master_cv: Condvar,
}

pub struct CheckQueue<T: QueueCheck> {
    shared: Arc<QueueShared<T>>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: QueueCheck> CheckQueue<T> {
    /// Spawns `worker_count` threads. Zero is legal: every check then runs on
    /// the submitting thread inside [`BatchGuard::complete`].
    pub fn new(worker_count: usize) -> Self {
        let shared = Arc::new(QueueShared {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                pending: 0,
                failure: None,
                shutdown: false,
            }),
            worker_cv: Condvar::new(),
            master_cv: Condvar::new(),
        });
        let workers = (0..worker_count)
            .map(|i| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("scriptcheck.{i}"))
                    .spawn(move || worker_loop(shared))
                    .expect("spawn script check worker")
            })
            .collect();
        Self { shared, workers }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Opens a batch. Only one batch may be open at a time; the validation
    /// thread is the sole submitter.
    pub fn start_batch(&self) -> BatchGuard<'_, T> {
        BatchGuard {
            queue: self,
            completed: false,
        }
    }

    fn push(&self, checks: Vec<T>) {
        if checks.is_empty() {
            return;
        }
        let mut state = self.shared.state.lock().expect("check queue lock");
        state.pending += checks.len();
        state.queue.extend(checks);
        drop(state);
        self.shared.worker_cv.notify_all();
    }

    /// Runs remaining checks on the calling thread, then blocks until the
    /// batch has fully drained. Returns the first failure, if any.
    fn wait(&self) -> Result<(), T::Error> {
        let mut state = self.shared.state.lock().expect("check queue lock");
        loop {
            if let Some(check) = state.queue.pop_front() {
                let skip = state.failure.is_some();
                drop(state);
                let result = if skip { Ok(()) } else { check.execute() };
                state = self.shared.state.lock().expect("check queue lock");
                if let Err(err) = result {
                    state.failure.get_or_insert(err);
                }
                state.pending -= 1;
                continue;
            }
            if state.pending == 0 {
                break;
            }
            state = self
                .shared
                .master_cv
                .wait(state)
                .expect("check queue lock");
        }
        match state.failure.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl<T: QueueCheck> Drop for CheckQueue<T> {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().expect("check queue lock");
            state.shutdown = true;
        }
        self.shared.worker_cv.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop<T: QueueCheck>(shared: Arc<QueueShared<T>>) {
    let mut state = shared.state.lock().expect("check queue lock");
    loop {
        if state.shutdown {
            return;
        }
        if let Some(check) = state.queue.pop_front() {
            let skip = state.failure.is_some();
            drop(state);
            let result = if skip { Ok(()) } else { check.execute() };
            state = shared.state.lock().expect("check queue lock");
            if let Err(err) = result {
                state.failure.get_or_insert(err);
            }
            state.pending -= 1;
            if state.pending == 0 {
                shared.master_cv.notify_all();
            }
            continue;
        }
        state = shared.worker_cv.wait(state).expect("check queue lock");
    }
}

/// Scope of one batch. `complete` returns the verdict; dropping without
/// completing drains the batch and discards it.
pub struct BatchGuard<'a, T: QueueCheck> {
    queue: &'a CheckQueue<T>,
    completed: bool,
}

impl<T: QueueCheck> BatchGuard<'_, T> {
    pub fn add(&mut self, checks: Vec<T>) {
        self.queue.push(checks);
    }

    pub fn complete(mut self) -> Result<(), T::Error> {
        self.completed = true;
        self.queue.wait()
    }
}

impl<T: QueueCheck> Drop for BatchGuard<'_, T> {
    fn drop(&mut self) {
        if !self.completed {
            let _ = self.queue.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TestCheck {
        ok: bool,
        executed: Arc<AtomicUsize>,
    }

    impl QueueCheck for TestCheck {
        type Error = &'static str;

        fn execute(self) -> Result<(), Self::Error> {
            self.executed.fetch_add(1, Ordering::SeqCst);
            if self.ok {
                Ok(())
            } else {
                Err("check failed")
            }
        }
    }

    fn batch_of(count: usize, bad: Option<usize>, executed: &Arc<AtomicUsize>) -> Vec<TestCheck> {
        (0..count)
            .map(|i| TestCheck {
                ok: bad != Some(i),
                executed: Arc::clone(executed),
            })
            .collect()
    }

    #[test]
    fn all_pass_with_workers() {
        let queue = CheckQueue::new(3);
        let executed = Arc::new(AtomicUsize::new(0));
        let mut guard = queue.start_batch();
        guard.add(batch_of(100, None, &executed));
        assert_eq!(guard.complete(), Ok(()));
        assert_eq!(executed.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn single_failure_fails_batch() {
        let queue = CheckQueue::new(2);
        let executed = Arc::new(AtomicUsize::new(0));
        let mut guard = queue.start_batch();
        guard.add(batch_of(50, Some(25), &executed));
        assert_eq!(guard.complete(), Err("check failed"));
    }

    #[test]
    fn zero_workers_runs_inline() {
        let queue = CheckQueue::new(0);
        let executed = Arc::new(AtomicUsize::new(0));
        let mut guard = queue.start_batch();
        guard.add(batch_of(10, None, &executed));
        assert_eq!(guard.complete(), Ok(()));
        assert_eq!(executed.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn sequential_batches_reuse_pool() {
        let queue = CheckQueue::new(2);
        let executed = Arc::new(AtomicUsize::new(0));
        for round in 0..5 {
            let mut guard = queue.start_batch();
            guard.add(batch_of(20, None, &executed));
            guard.add(batch_of(20, (round == 3).then_some(7), &executed));
            let result = guard.complete();
            assert_eq!(result.is_err(), round == 3);
        }
    }

    #[test]
    fn empty_batch_completes() {
        let queue: CheckQueue<TestCheck> = CheckQueue::new(2);
        let guard = queue.start_batch();
        assert_eq!(guard.complete(), Ok(()));
    }
}
