//! Host tasks on emulated streams.
//!
//! Stream callbacks may not call into the runtime, but a host task is
//! arbitrary user code that may well enqueue more work. The bridge moves the
//! task body to a dedicated thread: the stream callback only signals the
//! bridge thread and then holds the stream until the task has finished, so
//! the task stays ordered with the surrounding device work.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::{Condvar, Mutex};
use portacc_core::FailurePolicy;

use super::runtime::{EmuError, EmuRuntime};
use super::stream::Stream;
use crate::backend::TaskHost;
use crate::error::{escalate, panic_message, BackendError, Result};
use crate::rt_check;

pub(crate) type FaultSlot = Arc<Mutex<Option<Arc<BackendError>>>>;

#[derive(Default)]
struct HandshakeState {
    /// `Some(run)` once the stream reached the task.
    notified: Option<bool>,
    done: bool,
    failed: bool,
}

/// Rendezvous between the stream callback and the bridge thread.
#[derive(Default)]
struct Handshake {
    state: Mutex<HandshakeState>,
    cv: Condvar,
}

impl Handshake {
    fn notify(&self, run: bool) {
        self.state.lock().notified = Some(run);
        self.cv.notify_all();
    }

    fn wait_notified(&self) -> bool {
        let mut state = self.state.lock();
        loop {
            if let Some(run) = state.notified {
                return run;
            }
            self.cv.wait(&mut state);
        }
    }

    fn finish(&self, failed: bool) {
        let mut state = self.state.lock();
        state.done = true;
        state.failed = failed;
        self.cv.notify_all();
    }

    fn failed(&self) -> bool {
        self.state.lock().failed
    }

    fn wait_done(&self) {
        let mut state = self.state.lock();
        while !state.done {
            self.cv.wait(&mut state);
        }
    }
}

struct BridgeJob {
    handshake: Arc<Handshake>,
    task: TaskHost,
}

pub(crate) struct CallbackBridge {
    tx: Option<Sender<BridgeJob>>,
    thread: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl CallbackBridge {
    pub(crate) fn spawn(queue: &'static str, fault: FaultSlot, policy: FailurePolicy) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<BridgeJob>();
        let thread = thread::Builder::new()
            .name("portacc-emu-host-tasks".to_string())
            .spawn(move || {
                for job in rx {
                    let mut failed = false;
                    if job.handshake.wait_notified() {
                        let name = job.task.name();
                        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| job.task.run())) {
                            let err = escalate(
                                policy,
                                BackendError::HostTaskFailed {
                                    queue: queue.to_string(),
                                    message: panic_message(payload.as_ref()),
                                },
                            );
                            tracing::debug!(task = name, "host task panicked");
                            fault.lock().get_or_insert(Arc::new(err));
                            failed = true;
                        }
                    } else {
                        tracing::debug!(task = job.task.name(), "skipping host task after stream error");
                    }
                    job.handshake.finish(failed);
                }
            })
            .map_err(|source| BackendError::ThreadSpawn {
                what: "emulated host task bridge".to_string(),
                source,
            })?;
        Ok(Self {
            tx: Some(tx),
            thread_id: thread.thread().id(),
            thread: Some(thread),
        })
    }

    /// Order `task` on `stream`. A failing task leaves the stream in its
    /// error state, so later work on it is skipped.
    pub(crate) fn submit(&self, runtime: &EmuRuntime, stream: &Stream, task: TaskHost) -> Result<()> {
        let handshake = Arc::new(Handshake::default());
        let tx = self.tx.as_ref().ok_or_else(|| {
            BackendError::runtime("emu", "host_task", "host task bridge is shut down", file!(), line!())
        })?;
        tx.send(BridgeJob {
            handshake: Arc::clone(&handshake),
            task,
        })
        .map_err(|_| BackendError::runtime("emu", "host_task", "host task bridge stopped", file!(), line!()))?;

        let on_stream = Arc::clone(&handshake);
        let added = rt_check!(
            "emu",
            "stream_add_callback",
            runtime.stream_add_callback(
                stream,
                Box::new(move |status| {
                    on_stream.notify(status.is_ok());
                    on_stream.wait_done();
                }),
            )
        );
        if added.is_err() {
            // the bridge thread would otherwise wait forever
            handshake.notify(false);
            return added;
        }
        rt_check!(
            "emu",
            "host_task",
            runtime.stream_push_work(
                stream,
                Box::new(move || {
                    if handshake.failed() {
                        return Err(EmuError::LaunchFailure("host task failed".to_string()));
                    }
                    Ok(())
                }),
            )
        )
    }
}

impl Drop for CallbackBridge {
    fn drop(&mut self) {
        drop(self.tx.take());
        if thread::current().id() == self.thread_id {
            return;
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("host task bridge thread panicked");
            }
        }
    }
}
