//! Queues on emulated devices.
//!
//! Both queue kinds own one runtime stream. The asynchronous queue returns
//! once the runtime accepted the work; the synchronous one additionally
//! synchronises the stream before `enqueue` returns. Every runtime call is
//! issued with the queue's device made current for the calling thread.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use portacc_core::{FailurePolicy, RuntimeConfig};

use super::bridge::{CallbackBridge, FaultSlot};
use super::runtime::{EmuError, EmuRuntime, ScopedDevice};
use super::stream::Stream;
use super::transfer::{issue_copy, issue_set};
use super::DevEmu;
use crate::backend::{Acc, Dim3, Enqueue, MemSpace, Queue, TaskHost, WaitEvent};
use crate::error::{escalate, BackendError, Result};
use crate::event::Event;
use crate::kernel::{run_task, validate_launch, TaskKernel};
use crate::mem::{TaskCopy, TaskSet};
use crate::rt_check;

struct QueueEmuImpl {
    name: &'static str,
    dev: DevEmu,
    stream: Stream,
    bridge: Mutex<Option<CallbackBridge>>,
    policy: FailurePolicy,
    blocking: bool,
    fault: FaultSlot,
}

impl QueueEmuImpl {
    fn new(dev: &DevEmu, policy: FailurePolicy, blocking: bool, name: &'static str) -> Result<Self> {
        let rt = dev.runtime();
        let _scope = rt_check!("emu", "set_device", ScopedDevice::new(rt, dev.id()))?;
        let stream = rt_check!("emu", "stream_create", rt.stream_create())?;
        tracing::debug!(queue = name, device = dev.id(), stream = stream.id(), %policy, "created emulated queue");
        Ok(Self {
            name,
            dev: dev.clone(),
            stream,
            bridge: Mutex::new(None),
            policy,
            blocking,
            fault: FaultSlot::default(),
        })
    }

    fn check_fault(&self) -> Result<()> {
        match &*self.fault.lock() {
            Some(fault) => Err(BackendError::QueueFaulted {
                queue: self.name.to_string(),
                source: Arc::clone(fault),
            }),
            None => Ok(()),
        }
    }

    fn fail(&self, err: BackendError) -> BackendError {
        if err.is_config_error() || matches!(err, BackendError::QueueFaulted { .. }) {
            return err;
        }
        let fault = Arc::new(escalate(self.policy, err));
        let fault = Arc::clone(self.fault.lock().get_or_insert(fault));
        BackendError::QueueFaulted {
            queue: self.name.to_string(),
            source: fault,
        }
    }

    /// Issue runtime calls with the queue's device current.
    fn issue(&self, issue: impl FnOnce(&EmuRuntime, &Stream) -> Result<()>) -> Result<()> {
        let rt: &EmuRuntime = self.dev.runtime();
        let _scope = rt_check!("emu", "set_device", ScopedDevice::new(rt, self.dev.id()))?;
        issue(rt, &self.stream)
    }

    fn submit(&self, issue: impl FnOnce(&EmuRuntime, &Stream) -> Result<()>) -> Result<()> {
        self.check_fault()?;
        self.issue(issue)
            .and_then(|()| if self.blocking { self.sync() } else { Ok(()) })
            .map_err(|err| self.fail(err))
    }

    /// Translate a sticky stream error, preferring the fault recorded by the
    /// failing task.
    fn stream_error(&self, op: &'static str, err: EmuError) -> BackendError {
        self.check_fault()
            .err()
            .unwrap_or_else(|| BackendError::runtime("emu", op, err, file!(), line!()))
    }

    fn sync(&self) -> Result<()> {
        match self.dev.runtime().stream_synchronize(&self.stream) {
            Ok(()) => self.check_fault(),
            Err(err) => Err(self.stream_error("stream_synchronize", err)),
        }
    }

    fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        let drained = match self.dev.runtime().stream_wait_timeout(&self.stream, timeout) {
            Ok(false) => Ok(false),
            Ok(true) => self.check_fault().map(|()| true),
            Err(err) => Err(self.stream_error("stream_wait_timeout", err)),
        };
        drained.map_err(|err| self.fail(err))
    }

    fn empty(&self) -> bool {
        self.dev.runtime().stream_query(&self.stream).unwrap_or(true)
    }

    fn enqueue_kernel<A, const D: usize, F, Args>(&self, task: TaskKernel<A, D, F, Args>) -> Result<()>
    where
        A: Acc<D, Dev = DevEmu>,
        F: Fn(&A, Args) + Send + Sync + 'static,
        Args: Clone + Send + Sync + 'static,
    {
        validate_launch(&self.dev, &task)?;
        let work_div = *task.work_div();
        let grid = Dim3::from_vec(work_div.grid_block_extent());
        let block = Dim3::from_vec(work_div.block_thread_extent());
        let shared = task.dyn_shared_mem_bytes();
        tracing::debug!(kernel = task.kernel_name(), acc = %A::acc_name(), %grid, %block, "launching kernel");

        let dev = self.dev.clone();
        let fault = Arc::clone(&self.fault);
        let policy = self.policy;
        let body = Box::new(move || {
            run_task(&dev, &task).map_err(|err| {
                let message = err.to_string();
                let err = escalate(policy, err);
                fault.lock().get_or_insert(Arc::new(err));
                EmuError::LaunchFailure(message)
            })
        });
        self.submit(|rt, stream| rt_check!("emu", "launch_kernel", rt.launch_kernel(stream, grid, block, shared, body)))
    }

    fn enqueue_copy<const D: usize>(&self, task: TaskCopy<D>) -> Result<()> {
        self.submit(|rt, stream| {
            rt_check!("emu", "memcpy", issue_copy(rt, stream, &task))?;
            retain(rt, stream, task)
        })
    }

    fn enqueue_set<const D: usize>(&self, task: TaskSet<D>) -> Result<()> {
        if task.dst().space == MemSpace::Host {
            return Err(portacc_core::Error::UnsupportedMemSpace {
                queue: self.name.to_string(),
                space: MemSpace::Host.to_string(),
            }
            .into());
        }
        self.submit(|rt, stream| {
            rt_check!("emu", "memset", issue_set(rt, stream, &task))?;
            retain(rt, stream, task)
        })
    }

    fn enqueue_host(&self, task: TaskHost) -> Result<()> {
        self.submit(|rt, stream| {
            let mut slot = self.bridge.lock();
            if slot.is_none() {
                *slot = Some(CallbackBridge::spawn(self.name, Arc::clone(&self.fault), self.policy)?);
            }
            match &*slot {
                Some(bridge) => bridge.submit(rt, stream, task),
                None => Ok(()),
            }
        })
    }

    fn enqueue_event(&self, event: Event) -> Result<()> {
        let ticket = event.record();
        let completer = event.clone();
        let added = self.issue(|rt, stream| {
            rt_check!(
                "emu",
                "stream_add_callback",
                rt.stream_add_callback(stream, Box::new(move |_| completer.complete(ticket)))
            )
        });
        if let Err(err) = added {
            event.complete(ticket);
            return Err(self.fail(err));
        }
        if self.blocking {
            self.sync().map_err(|err| self.fail(err))?;
        }
        Ok(())
    }

    fn wait_for(&self, event: &Event) -> Result<()> {
        let ticket = event.last_ticket();
        if self.blocking {
            event.wait_ticket(ticket);
            return Ok(());
        }
        let event = event.clone();
        self.submit(|rt, stream| {
            rt_check!(
                "emu",
                "stream_wait_event",
                rt.stream_push_work(
                    stream,
                    Box::new(move || {
                        event.wait_ticket(ticket);
                        Ok(())
                    }),
                )
            )
        })
    }
}

/// Keep `task`'s buffers alive until the stream has passed it.
fn retain<T: Send + 'static>(rt: &EmuRuntime, stream: &Stream, task: T) -> Result<()> {
    rt_check!(
        "emu",
        "stream_add_callback",
        rt.stream_add_callback(stream, Box::new(move |_| drop(task)))
    )
}

macro_rules! emu_queue {
    ($(#[$meta:meta])* $queue:ident, blocking = $blocking:expr) => {
        $(#[$meta])*
        #[derive(Clone)]
        pub struct $queue {
            inner: Arc<QueueEmuImpl>,
        }

        impl $queue {
            /// Queue with the globally configured failure policy.
            pub fn new(dev: &DevEmu) -> Result<Self> {
                Self::with_policy(dev, RuntimeConfig::global().failure_policy)
            }

            pub fn with_policy(dev: &DevEmu, policy: FailurePolicy) -> Result<Self> {
                let inner = QueueEmuImpl::new(dev, policy, $blocking, stringify!($queue))?;
                Ok(Self { inner: Arc::new(inner) })
            }
        }

        impl PartialEq for $queue {
            fn eq(&self, other: &Self) -> bool {
                Arc::ptr_eq(&self.inner, &other.inner)
            }
        }

        impl fmt::Debug for $queue {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($queue))
                    .field("device", &self.inner.dev.id())
                    .field("stream", &self.inner.stream.id())
                    .field("policy", &self.inner.policy)
                    .field("faulted", &self.inner.fault.lock().is_some())
                    .finish()
            }
        }

        impl Queue for $queue {
            type Dev = DevEmu;

            fn dev(&self) -> DevEmu {
                self.inner.dev.clone()
            }

            fn empty(&self) -> bool {
                self.inner.empty()
            }

            fn wait(&self) -> Result<()> {
                self.inner.sync().map_err(|err| self.inner.fail(err))
            }

            fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
                self.inner.wait_timeout(timeout)
            }

            fn is_blocking(&self) -> bool {
                $blocking
            }

            fn failure_policy(&self) -> FailurePolicy {
                self.inner.policy
            }
        }

        impl<A, const D: usize, F, Args> Enqueue<TaskKernel<A, D, F, Args>> for $queue
        where
            A: Acc<D, Dev = DevEmu>,
            F: Fn(&A, Args) + Send + Sync + 'static,
            Args: Clone + Send + Sync + 'static,
        {
            fn enqueue(&self, task: TaskKernel<A, D, F, Args>) -> Result<()> {
                self.inner.enqueue_kernel(task)
            }
        }

        impl<const D: usize> Enqueue<TaskCopy<D>> for $queue {
            fn enqueue(&self, task: TaskCopy<D>) -> Result<()> {
                self.inner.enqueue_copy(task)
            }
        }

        impl<const D: usize> Enqueue<TaskSet<D>> for $queue {
            fn enqueue(&self, task: TaskSet<D>) -> Result<()> {
                self.inner.enqueue_set(task)
            }
        }

        impl Enqueue<TaskHost> for $queue {
            fn enqueue(&self, task: TaskHost) -> Result<()> {
                self.inner.enqueue_host(task)
            }
        }

        impl Enqueue<Event> for $queue {
            fn enqueue(&self, event: Event) -> Result<()> {
                self.inner.enqueue_event(event)
            }
        }

        impl WaitEvent for $queue {
            fn wait_for(&self, event: &Event) -> Result<()> {
                self.inner.wait_for(event)
            }
        }
    };
}

emu_queue!(
    /// Emulated-device queue whose `enqueue` returns after the task has
    /// completed.
    QueueEmuSync,
    blocking = true
);

emu_queue!(
    /// Emulated-device queue backed by one runtime stream; `enqueue` returns
    /// as soon as the work is queued.
    QueueEmuAsync,
    blocking = false
);
