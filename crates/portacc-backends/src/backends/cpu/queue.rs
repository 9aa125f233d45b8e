//! Host queues.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use portacc_core::{FailurePolicy, RuntimeConfig};
use portacc_tracing::performance::record_transfer;

use super::{DevCpu, DrainQueue};
use crate::backend::{Acc, Enqueue, MemSpace, Queue, TaskHost, WaitEvent};
use crate::backends::common::host_mem::{copy_host, set_host};
use crate::backends::common::worker::{FifoWorker, Job};
use crate::error::{escalate, panic_message, BackendError, Result};
use crate::event::Event;
use crate::kernel::{run_task, validate_launch, TaskKernel};
use crate::mem::{TaskCopy, TaskSet};

fn ensure_host(queue: &str, spaces: &[MemSpace]) -> Result<()> {
    match spaces.iter().find(|space| **space != MemSpace::Host) {
        Some(space) => Err(portacc_core::Error::UnsupportedMemSpace {
            queue: queue.to_string(),
            space: space.to_string(),
        }
        .into()),
        None => Ok(()),
    }
}

fn run_copy<const D: usize>(task: &TaskCopy<D>) -> Result<()> {
    let start = Instant::now();
    // SAFETY: both regions were checked against their views and the task
    // keeps the views alive.
    unsafe { copy_host(task) };
    record_transfer(task.bytes(), "host_to_host", start.elapsed().as_micros() as u64);
    Ok(())
}

fn run_set<const D: usize>(task: &TaskSet<D>) -> Result<()> {
    // SAFETY: as in `run_copy`.
    unsafe { set_host(task) };
    Ok(())
}

fn run_host(queue: &str, task: TaskHost) -> Result<()> {
    let name = task.name();
    panic::catch_unwind(AssertUnwindSafe(|| task.run())).map_err(|payload| {
        tracing::debug!(task = name, "host task panicked");
        BackendError::HostTaskFailed {
            queue: queue.to_string(),
            message: panic_message(payload.as_ref()),
        }
    })
}

// ============================================================================
// Synchronous queue
// ============================================================================

struct CpuSyncImpl {
    dev: DevCpu,
    policy: FailurePolicy,
    exec: Mutex<()>,
    in_flight: AtomicUsize,
    fault: Mutex<Option<Arc<BackendError>>>,
}

impl CpuSyncImpl {
    const NAME: &'static str = "QueueCpuSync";

    fn check_fault(&self) -> Result<()> {
        match &*self.fault.lock() {
            Some(fault) => Err(BackendError::QueueFaulted {
                queue: Self::NAME.to_string(),
                source: Arc::clone(fault),
            }),
            None => Ok(()),
        }
    }

    /// Run `op` to completion on the calling thread, in order with other
    /// callers sharing this queue.
    fn run(&self, op: impl FnOnce() -> Result<()>) -> Result<()> {
        self.check_fault()?;
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let result = {
            let _exec = self.exec.lock();
            self.check_fault().and_then(|()| op())
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result.map_err(|err| self.fail(err))
    }

    fn fail(&self, err: BackendError) -> BackendError {
        if err.is_config_error() || matches!(err, BackendError::QueueFaulted { .. }) {
            return err;
        }
        let fault = Arc::new(escalate(self.policy, err));
        *self.fault.lock() = Some(Arc::clone(&fault));
        BackendError::QueueFaulted {
            queue: Self::NAME.to_string(),
            source: fault,
        }
    }
}

impl DrainQueue for CpuSyncImpl {
    fn drain(&self) -> Result<()> {
        drop(self.exec.lock());
        self.check_fault()
    }
}

/// Runs every task on the enqueuing thread before `enqueue` returns.
#[derive(Clone)]
pub struct QueueCpuSync {
    inner: Arc<CpuSyncImpl>,
}

impl QueueCpuSync {
    /// Queue with the globally configured failure policy.
    pub fn new(dev: &DevCpu) -> Self {
        Self::with_policy(dev, RuntimeConfig::global().failure_policy)
    }

    pub fn with_policy(dev: &DevCpu, policy: FailurePolicy) -> Self {
        let inner = Arc::new(CpuSyncImpl {
            dev: dev.clone(),
            policy,
            exec: Mutex::new(()),
            in_flight: AtomicUsize::new(0),
            fault: Mutex::new(None),
        });
        let drain: Arc<dyn DrainQueue> = inner.clone();
        dev.register_queue(Arc::downgrade(&drain));
        tracing::debug!(%policy, "created QueueCpuSync");
        Self { inner }
    }
}

impl PartialEq for QueueCpuSync {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for QueueCpuSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueCpuSync")
            .field("policy", &self.inner.policy)
            .field("faulted", &self.inner.fault.lock().is_some())
            .finish()
    }
}

impl Queue for QueueCpuSync {
    type Dev = DevCpu;

    fn dev(&self) -> DevCpu {
        self.inner.dev.clone()
    }

    fn empty(&self) -> bool {
        self.inner.in_flight.load(Ordering::SeqCst) == 0
    }

    fn wait(&self) -> Result<()> {
        self.inner.drain()
    }

    fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        match self.inner.exec.try_lock_for(timeout) {
            Some(guard) => {
                drop(guard);
                self.inner.check_fault().map(|()| true)
            }
            None => Ok(false),
        }
    }

    fn is_blocking(&self) -> bool {
        true
    }

    fn failure_policy(&self) -> FailurePolicy {
        self.inner.policy
    }
}

impl<A, const D: usize, F, Args> Enqueue<TaskKernel<A, D, F, Args>> for QueueCpuSync
where
    A: Acc<D, Dev = DevCpu>,
    F: Fn(&A, Args) + Send + Sync + 'static,
    Args: Clone + Send + Sync + 'static,
{
    fn enqueue(&self, task: TaskKernel<A, D, F, Args>) -> Result<()> {
        validate_launch(&self.inner.dev, &task)?;
        tracing::debug!(kernel = task.kernel_name(), acc = %A::acc_name(), "running kernel");
        self.inner.run(|| run_task(&self.inner.dev, &task))
    }
}

impl<const D: usize> Enqueue<TaskCopy<D>> for QueueCpuSync {
    fn enqueue(&self, task: TaskCopy<D>) -> Result<()> {
        ensure_host(CpuSyncImpl::NAME, &[task.dst().space, task.src().space])?;
        self.inner.run(|| run_copy(&task))
    }
}

impl<const D: usize> Enqueue<TaskSet<D>> for QueueCpuSync {
    fn enqueue(&self, task: TaskSet<D>) -> Result<()> {
        ensure_host(CpuSyncImpl::NAME, &[task.dst().space])?;
        self.inner.run(|| run_set(&task))
    }
}

impl Enqueue<TaskHost> for QueueCpuSync {
    fn enqueue(&self, task: TaskHost) -> Result<()> {
        self.inner.run(|| run_host(CpuSyncImpl::NAME, task))
    }
}

impl Enqueue<Event> for QueueCpuSync {
    fn enqueue(&self, event: Event) -> Result<()> {
        let _exec = self.inner.exec.lock();
        let ticket = event.record();
        event.complete(ticket);
        Ok(())
    }
}

impl WaitEvent for QueueCpuSync {
    fn wait_for(&self, event: &Event) -> Result<()> {
        event.wait_ticket(event.last_ticket());
        Ok(())
    }
}

// ============================================================================
// Asynchronous queue
// ============================================================================

struct CpuAsyncImpl {
    dev: DevCpu,
    policy: FailurePolicy,
    worker: FifoWorker,
}

impl CpuAsyncImpl {
    const NAME: &'static str = "QueueCpuAsync";

    fn submit(&self, work: impl FnOnce() -> Result<()> + Send + 'static) -> Result<()> {
        self.worker.submit(Job::Work(Box::new(work)))
    }
}

impl DrainQueue for CpuAsyncImpl {
    fn drain(&self) -> Result<()> {
        self.worker.wait()
    }
}

/// Hands every task to a dedicated worker thread and returns immediately.
///
/// Tasks run one at a time in submission order. Dropping the last handle
/// waits for the queued tasks to finish.
#[derive(Clone)]
pub struct QueueCpuAsync {
    inner: Arc<CpuAsyncImpl>,
}

impl QueueCpuAsync {
    pub fn new(dev: &DevCpu) -> Result<Self> {
        Self::with_policy(dev, RuntimeConfig::global().failure_policy)
    }

    pub fn with_policy(dev: &DevCpu, policy: FailurePolicy) -> Result<Self> {
        let worker = FifoWorker::spawn("portacc-cpu-queue", policy)?;
        let inner = Arc::new(CpuAsyncImpl {
            dev: dev.clone(),
            policy,
            worker,
        });
        let drain: Arc<dyn DrainQueue> = inner.clone();
        dev.register_queue(Arc::downgrade(&drain));
        tracing::debug!(%policy, "created QueueCpuAsync");
        Ok(Self { inner })
    }
}

impl PartialEq for QueueCpuAsync {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for QueueCpuAsync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueCpuAsync")
            .field("policy", &self.inner.policy)
            .field("idle", &self.inner.worker.is_idle())
            .field("faulted", &self.inner.worker.fault().is_some())
            .finish()
    }
}

impl Queue for QueueCpuAsync {
    type Dev = DevCpu;

    fn dev(&self) -> DevCpu {
        self.inner.dev.clone()
    }

    fn empty(&self) -> bool {
        self.inner.worker.is_idle()
    }

    fn wait(&self) -> Result<()> {
        self.inner.worker.wait()
    }

    fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        self.inner.worker.wait_timeout(timeout)
    }

    fn is_blocking(&self) -> bool {
        false
    }

    fn failure_policy(&self) -> FailurePolicy {
        self.inner.policy
    }
}

impl<A, const D: usize, F, Args> Enqueue<TaskKernel<A, D, F, Args>> for QueueCpuAsync
where
    A: Acc<D, Dev = DevCpu>,
    F: Fn(&A, Args) + Send + Sync + 'static,
    Args: Clone + Send + Sync + 'static,
{
    fn enqueue(&self, task: TaskKernel<A, D, F, Args>) -> Result<()> {
        validate_launch(&self.inner.dev, &task)?;
        tracing::debug!(kernel = task.kernel_name(), acc = %A::acc_name(), "queued kernel");
        let dev = self.inner.dev.clone();
        self.inner.submit(move || run_task(&dev, &task))
    }
}

impl<const D: usize> Enqueue<TaskCopy<D>> for QueueCpuAsync {
    fn enqueue(&self, task: TaskCopy<D>) -> Result<()> {
        ensure_host(CpuAsyncImpl::NAME, &[task.dst().space, task.src().space])?;
        self.inner.submit(move || run_copy(&task))
    }
}

impl<const D: usize> Enqueue<TaskSet<D>> for QueueCpuAsync {
    fn enqueue(&self, task: TaskSet<D>) -> Result<()> {
        ensure_host(CpuAsyncImpl::NAME, &[task.dst().space])?;
        self.inner.submit(move || run_set(&task))
    }
}

impl Enqueue<TaskHost> for QueueCpuAsync {
    fn enqueue(&self, task: TaskHost) -> Result<()> {
        self.inner.submit(move || run_host(CpuAsyncImpl::NAME, task))
    }
}

impl Enqueue<Event> for QueueCpuAsync {
    fn enqueue(&self, event: Event) -> Result<()> {
        let ticket = event.record();
        self.inner.worker.submit(Job::Notify(Box::new(move || event.complete(ticket))))
    }
}

impl WaitEvent for QueueCpuAsync {
    fn wait_for(&self, event: &Event) -> Result<()> {
        let ticket = event.last_ticket();
        let event = event.clone();
        self.inner.submit(move || {
            event.wait_ticket(ticket);
            Ok(())
        })
    }
}
