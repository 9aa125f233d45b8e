//! Streams of the emulated runtime.
//!
//! A stream is a FIFO of operations executed by one worker thread. A failing
//! operation leaves a sticky error on the stream: later work is skipped and
//! the error is reported by every synchronisation call. Callbacks still run
//! and receive the stream status, so nothing waiting on them can hang.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::runtime::{in_callback, set_thread_device, EmuError, EmuResult, EmuRuntime};
use crate::error::panic_message;

pub(crate) type StreamWork = Box<dyn FnOnce() -> EmuResult<()> + Send>;
pub type StreamCallback = Box<dyn FnOnce(EmuResult<()>) + Send>;

pub(crate) enum StreamOp {
    /// Device work; skipped once the stream has an error.
    Work(StreamWork),
    /// Host callback; always runs and receives the stream status.
    Notify(StreamCallback),
}

#[derive(Default)]
struct StreamState {
    ops: VecDeque<StreamOp>,
    busy: bool,
    error: Option<EmuError>,
    shutdown: bool,
}

pub(crate) struct StreamShared {
    id: u64,
    device: usize,
    state: Mutex<StreamState>,
    work_cv: Condvar,
    idle_cv: Condvar,
}

impl StreamShared {
    pub(crate) fn device(&self) -> usize {
        self.device
    }

    fn status(state: &StreamState) -> EmuResult<()> {
        state.error.clone().map_or(Ok(()), Err)
    }

    pub(crate) fn wait_idle(&self) -> EmuResult<()> {
        let mut state = self.state.lock();
        while state.busy || !state.ops.is_empty() {
            self.idle_cv.wait(&mut state);
        }
        Self::status(&state)
    }

    fn wait_idle_for(&self, timeout: Duration) -> EmuResult<bool> {
        let mut state = self.state.lock();
        while state.busy || !state.ops.is_empty() {
            if self.idle_cv.wait_for(&mut state, timeout).timed_out() {
                return Ok(false);
            }
        }
        Self::status(&state).map(|()| true)
    }

    fn run(self: Arc<Self>) {
        set_thread_device(self.device);
        loop {
            let op = {
                let mut state = self.state.lock();
                loop {
                    if let Some(op) = state.ops.pop_front() {
                        state.busy = true;
                        break op;
                    }
                    if state.shutdown {
                        return;
                    }
                    self.work_cv.wait(&mut state);
                }
            };

            match op {
                StreamOp::Work(work) => {
                    if self.state.lock().error.is_none() {
                        let result = panic::catch_unwind(AssertUnwindSafe(work))
                            .unwrap_or_else(|payload| Err(EmuError::LaunchFailure(panic_message(payload.as_ref()))));
                        if let Err(err) = result {
                            tracing::debug!(stream = self.id, error = %err, "stream entered error state");
                            self.state.lock().error.get_or_insert(err);
                        }
                    }
                }
                StreamOp::Notify(callback) => {
                    let status = Self::status(&self.state.lock());
                    let outcome = in_callback(|| panic::catch_unwind(AssertUnwindSafe(|| callback(status))));
                    if let Err(payload) = outcome {
                        tracing::error!(stream = self.id, message = %panic_message(payload.as_ref()), "stream callback panicked");
                    }
                }
            }

            let mut state = self.state.lock();
            state.busy = false;
            if state.ops.is_empty() {
                self.idle_cv.notify_all();
            }
        }
    }
}

/// Handle to one stream. Dropping it lets queued operations finish in the
/// background.
pub struct Stream {
    shared: Arc<StreamShared>,
}

impl Stream {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Device the stream was created on.
    pub fn device(&self) -> usize {
        self.shared.device
    }

    pub(crate) fn push(&self, op: StreamOp) {
        let mut state = self.shared.state.lock();
        state.ops.push_back(op);
        self.shared.work_cv.notify_one();
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.work_cv.notify_all();
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.shared.id)
            .field("device", &self.shared.device)
            .finish()
    }
}

impl EmuRuntime {
    /// Create a stream on the current device.
    pub fn stream_create(&self) -> EmuResult<Stream> {
        let device = self.get_device()?;
        let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(StreamShared {
            id,
            device,
            state: Mutex::new(StreamState::default()),
            work_cv: Condvar::new(),
            idle_cv: Condvar::new(),
        });
        let worker = Arc::clone(&shared);
        thread::Builder::new()
            .name(format!("portacc-emu-stream-{id}"))
            .spawn(move || worker.run())
            .map_err(|err| EmuError::ResourceExhausted(format!("stream worker: {err}")))?;

        let mut streams = self.streams.lock();
        streams.retain(|s| s.strong_count() > 0);
        streams.push(Arc::downgrade(&shared));
        tracing::trace!(stream = id, device, "created stream");
        Ok(Stream { shared })
    }

    /// `Ok(true)` when every operation on `stream` has completed.
    pub fn stream_query(&self, stream: &Stream) -> EmuResult<bool> {
        self.check_callback()?;
        let state = stream.shared.state.lock();
        StreamShared::status(&state)?;
        Ok(!state.busy && state.ops.is_empty())
    }

    pub fn stream_synchronize(&self, stream: &Stream) -> EmuResult<()> {
        self.check_callback()?;
        stream.shared.wait_idle()
    }

    /// `Ok(false)` when `stream` has not drained within `timeout`.
    pub fn stream_wait_timeout(&self, stream: &Stream, timeout: Duration) -> EmuResult<bool> {
        self.check_callback()?;
        stream.shared.wait_idle_for(timeout)
    }

    /// Run `callback` on the stream thread once all earlier operations have
    /// finished. The callback must not call back into the runtime.
    pub fn stream_add_callback(&self, stream: &Stream, callback: StreamCallback) -> EmuResult<()> {
        self.check_callback()?;
        stream.push(StreamOp::Notify(callback));
        Ok(())
    }
}
