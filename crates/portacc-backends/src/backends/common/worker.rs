//! Single-consumer FIFO worker thread behind the asynchronous CPU queue.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use portacc_core::FailurePolicy;

use crate::error::{escalate, panic_message, BackendError, Result};

/// A unit of queued work.
pub(crate) enum Job {
    /// Skipped once the worker is faulted.
    Work(Box<dyn FnOnce() -> Result<()> + Send>),
    /// Always runs, so waiters parked on it are released after a fault.
    Notify(Box<dyn FnOnce() + Send>),
}

#[derive(Default)]
struct WorkerState {
    jobs: VecDeque<Job>,
    running: bool,
    shutdown: bool,
    fault: Option<Arc<BackendError>>,
}

impl WorkerState {
    fn idle(&self) -> bool {
        self.jobs.is_empty() && !self.running
    }
}

struct WorkerShared {
    name: String,
    policy: FailurePolicy,
    state: Mutex<WorkerState>,
    work_cv: Condvar,
    idle_cv: Condvar,
}

pub(crate) struct FifoWorker {
    shared: Arc<WorkerShared>,
    thread: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl FifoWorker {
    pub(crate) fn spawn(name: &str, policy: FailurePolicy) -> Result<Self> {
        let shared = Arc::new(WorkerShared {
            name: name.to_string(),
            policy,
            state: Mutex::new(WorkerState::default()),
            work_cv: Condvar::new(),
            idle_cv: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker_loop(&worker_shared))
            .map_err(|source| BackendError::ThreadSpawn {
                what: name.to_string(),
                source,
            })?;
        Ok(Self {
            shared,
            thread_id: thread.thread().id(),
            thread: Some(thread),
        })
    }

    pub(crate) fn submit(&self, job: Job) -> Result<()> {
        let mut state = self.shared.state.lock();
        if let (Some(fault), Job::Work(_)) = (&state.fault, &job) {
            return Err(self.faulted(fault));
        }
        state.jobs.push_back(job);
        self.shared.work_cv.notify_one();
        Ok(())
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.shared.state.lock().idle()
    }

    /// Block until drained; reports a recorded fault.
    pub(crate) fn wait(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        while !state.idle() {
            self.shared.idle_cv.wait(&mut state);
        }
        match &state.fault {
            Some(fault) => Err(self.faulted(fault)),
            None => Ok(()),
        }
    }

    pub(crate) fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while !state.idle() {
            if self.shared.idle_cv.wait_until(&mut state, deadline).timed_out() && !state.idle() {
                return Ok(false);
            }
        }
        match &state.fault {
            Some(fault) => Err(self.faulted(fault)),
            None => Ok(true),
        }
    }

    pub(crate) fn fault(&self) -> Option<Arc<BackendError>> {
        self.shared.state.lock().fault.clone()
    }

    fn faulted(&self, fault: &Arc<BackendError>) -> BackendError {
        BackendError::QueueFaulted {
            queue: self.shared.name.clone(),
            source: Arc::clone(fault),
        }
    }
}

impl Drop for FifoWorker {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.work_cv.notify_all();
        // a job holding the last queue handle drops it on the worker itself
        if thread::current().id() == self.thread_id {
            return;
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!(worker = %self.shared.name, "queue worker thread panicked");
            }
        }
    }
}

fn worker_loop(shared: &WorkerShared) {
    tracing::debug!(worker = %shared.name, "queue worker started");
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if let Some(job) = state.jobs.pop_front() {
                    state.running = true;
                    break job;
                }
                if state.shutdown {
                    tracing::debug!(worker = %shared.name, "queue worker stopped");
                    return;
                }
                shared.work_cv.wait(&mut state);
            }
        };

        let outcome = match job {
            Job::Work(work) => {
                if shared.state.lock().fault.is_some() {
                    Ok(())
                } else {
                    panic::catch_unwind(AssertUnwindSafe(work)).unwrap_or_else(|payload| {
                        Err(BackendError::HostTaskFailed {
                            queue: shared.name.clone(),
                            message: panic_message(payload.as_ref()),
                        })
                    })
                }
            }
            Job::Notify(notify) => {
                notify();
                Ok(())
            }
        };

        let mut state = shared.state.lock();
        if let Err(err) = outcome {
            let err = escalate(shared.policy, err);
            tracing::debug!(worker = %shared.name, discarded = state.jobs.len(), "queue faulted");
            state.jobs.retain(|job| matches!(job, Job::Notify(_)));
            state.fault = Some(Arc::new(err));
        }
        state.running = false;
        if state.idle() {
            shared.idle_cv.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn work(f: impl FnOnce() -> Result<()> + Send + 'static) -> Job {
        Job::Work(Box::new(f))
    }

    #[test]
    fn test_jobs_run_in_submission_order() {
        let worker = FifoWorker::spawn("test-fifo", FailurePolicy::Propagate).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..50 {
            let log = Arc::clone(&log);
            worker
                .submit(work(move || {
                    log.lock().push(i);
                    Ok(())
                }))
                .unwrap();
        }
        worker.wait().unwrap();
        assert_eq!(*log.lock(), (0..50).collect::<Vec<_>>());
        assert!(worker.is_idle());
    }

    #[test]
    fn test_fault_discards_work_but_runs_notifications() {
        let worker = FifoWorker::spawn("test-fault", FailurePolicy::Propagate).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let notified = Arc::new(AtomicUsize::new(0));

        worker
            .submit(work(|| Err(BackendError::kernel_failed("k", "acc", "boom"))))
            .unwrap();
        let r = Arc::clone(&ran);
        let _ = worker.submit(work(move || {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        let n = Arc::clone(&notified);
        worker
            .submit(Job::Notify(Box::new(move || {
                n.fetch_add(1, Ordering::SeqCst);
            })))
            .unwrap();

        let err = worker.wait().unwrap_err();
        assert!(matches!(err, BackendError::QueueFaulted { .. }));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        assert!(worker.submit(work(|| Ok(()))).is_err());
    }

    #[test]
    fn test_panicking_job_is_reported() {
        let worker = FifoWorker::spawn("test-panic", FailurePolicy::Propagate).unwrap();
        worker.submit(work(|| panic!("host task blew up"))).unwrap();
        let err = worker.wait().unwrap_err();
        assert!(err.to_string().contains("host task blew up"));
    }

    #[test]
    fn test_wait_timeout_reports_pending_work() {
        let worker = FifoWorker::spawn("test-timeout", FailurePolicy::Propagate).unwrap();
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let job_gate = Arc::clone(&gate);
        worker
            .submit(work(move || {
                let (open, cv) = &*job_gate;
                let mut open = open.lock();
                while !*open {
                    cv.wait(&mut open);
                }
                Ok(())
            }))
            .unwrap();

        assert!(!worker.wait_timeout(Duration::from_millis(20)).unwrap());
        *gate.0.lock() = true;
        gate.1.notify_all();
        assert!(worker.wait_timeout(Duration::from_secs(10)).unwrap());
    }
}
