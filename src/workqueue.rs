//! Deferred background execution.
//!
//! The notification path never runs controller logic inline; it queues a job
//! here and returns. A `WorkQueue` owns one worker thread and a deadline-
//! ordered job heap, so delayed jobs (the pacing tick) and immediate jobs
//! (recovery cycles) share one executor per concern. Jobs queued on the same
//! queue run strictly one at a time.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct TimedJob {
    at: Instant,
    seq: u64,
    job: Job,
}

// BinaryHeap is a max-heap; invert the ordering so the earliest deadline
// (FIFO among equal deadlines) is at the top.
impl PartialEq for TimedJob {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for TimedJob {}

impl PartialOrd for TimedJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimedJob {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.at, other.seq).cmp(&(self.at, self.seq))
    }
}

struct State {
    heap: BinaryHeap<TimedJob>,
    next_seq: u64,
    shutdown: bool,
}

struct Shared {
    state: Mutex<State>,
    cv: Condvar,
}

/// A single-threaded deferred work queue.
pub struct WorkQueue {
    shared: Arc<Shared>,
    worker: Option<thread::JoinHandle<()>>,
}

impl WorkQueue {
    /// Create a work queue whose worker thread carries `name`.
    ///
    /// # Errors
    /// Fails when the worker thread cannot be spawned.
    pub fn new(name: &str) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                heap: BinaryHeap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            cv: Condvar::new(),
        });

        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || Self::run(worker_shared))?;

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    fn run(shared: Arc<Shared>) {
        let mut state = shared.state.lock().unwrap();
        loop {
            if state.shutdown {
                return;
            }
            let now = Instant::now();
            match state.heap.peek().map(|timed| timed.at) {
                None => {
                    state = shared.cv.wait(state).unwrap();
                }
                Some(at) if at <= now => {
                    let job = state.heap.pop().unwrap().job;
                    drop(state);
                    job();
                    state = shared.state.lock().unwrap();
                }
                Some(at) => {
                    state = shared.cv.wait_timeout(state, at - now).unwrap().0;
                }
            }
        }
    }

    /// Queue a job to run as soon as the worker is free.
    ///
    /// Returns false when the queue has shut down.
    pub fn queue<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.queue_delayed(Duration::ZERO, job)
    }

    /// Queue a job to run no earlier than `delay` from now.
    ///
    /// Returns false when the queue has shut down.
    pub fn queue_delayed<F>(&self, delay: Duration, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock().unwrap();
        if state.shutdown {
            return false;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(TimedJob {
            at: Instant::now() + delay,
            seq,
            job: Box::new(job),
        });
        drop(state);
        self.shared.cv.notify_one();
        true
    }

    /// Number of jobs waiting to run.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().unwrap().heap.len()
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
            state.heap.clear();
        }
        self.shared.cv.notify_all();
        if let Some(worker) = self.worker.take() {
            // A job may hold the last owner of this queue; never join the
            // worker from itself.
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn test_jobs_run_in_queue_order() {
        let wq = WorkQueue::new("test-wq").unwrap();
        let (tx, rx) = mpsc::channel();
        for i in 0..8 {
            let tx = tx.clone();
            wq.queue(move || tx.send(i).unwrap());
        }
        let got: Vec<i32> = (0..8).map(|_| rx.recv().unwrap()).collect();
        assert_eq!(got, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_delayed_job_waits() {
        let wq = WorkQueue::new("test-wq").unwrap();
        let (tx, rx) = mpsc::channel();
        let start = Instant::now();
        wq.queue_delayed(Duration::from_millis(20), move || {
            tx.send(start.elapsed()).unwrap()
        });
        let elapsed = rx.recv().unwrap();
        assert!(elapsed >= Duration::from_millis(20));
    }

    #[test]
    fn test_earlier_deadline_runs_first() {
        let wq = WorkQueue::new("test-wq").unwrap();
        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        wq.queue_delayed(Duration::from_millis(30), move || tx2.send("late").unwrap());
        wq.queue_delayed(Duration::from_millis(5), move || tx.send("early").unwrap());
        assert_eq!(rx.recv().unwrap(), "early");
        assert_eq!(rx.recv().unwrap(), "late");
    }

    #[test]
    fn test_drop_discards_pending_jobs() {
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let wq = WorkQueue::new("test-wq").unwrap();
            let ran = ran.clone();
            wq.queue_delayed(Duration::from_secs(60), move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
