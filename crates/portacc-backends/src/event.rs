//! Completion markers for cross-queue ordering.
//!
//! Enqueuing an [`Event`] records a new ticket; the ticket completes once
//! every task enqueued before it on that queue has finished. Waiting always
//! targets the most recent recording at the time of the call.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::backend::Device;

#[derive(Default)]
struct EventState {
    recorded: u64,
    completed: u64,
}

struct EventInner {
    dev_name: String,
    state: Mutex<EventState>,
    cv: Condvar,
}

/// A device-agnostic completion marker.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    pub fn new<Dev: Device>(dev: &Dev) -> Self {
        Self {
            inner: Arc::new(EventInner {
                dev_name: dev.name(),
                state: Mutex::new(EventState::default()),
                cv: Condvar::new(),
            }),
        }
    }

    /// True when the most recent recording has completed, or the event was
    /// never recorded.
    pub fn is_complete(&self) -> bool {
        let state = self.inner.state.lock();
        state.completed >= state.recorded
    }

    /// Block until the most recent recording completes.
    pub fn wait(&self) {
        let ticket = self.inner.state.lock().recorded;
        self.wait_ticket(ticket);
    }

    /// Like [`wait`](Self::wait); returns false on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        let ticket = state.recorded;
        while state.completed < ticket {
            if self.inner.cv.wait_until(&mut state, deadline).timed_out() {
                return state.completed >= ticket;
            }
        }
        true
    }

    /// Start a new recording and return its ticket.
    pub(crate) fn record(&self) -> u64 {
        let mut state = self.inner.state.lock();
        state.recorded += 1;
        state.recorded
    }

    /// Ticket of the most recent recording.
    pub(crate) fn last_ticket(&self) -> u64 {
        self.inner.state.lock().recorded
    }

    pub(crate) fn complete(&self, ticket: u64) {
        let mut state = self.inner.state.lock();
        state.completed = state.completed.max(ticket);
        self.inner.cv.notify_all();
    }

    pub(crate) fn wait_ticket(&self, ticket: u64) {
        let mut state = self.inner.state.lock();
        while state.completed < ticket {
            self.inner.cv.wait(&mut state);
        }
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Event")
            .field("dev", &self.inner.dev_name)
            .field("recorded", &state.recorded)
            .field("completed", &state.completed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::cpu::DevCpu;
    use std::thread;

    #[test]
    fn test_unrecorded_event_is_complete() {
        let event = Event::new(&DevCpu::get());
        assert!(event.is_complete());
        event.wait();
    }

    #[test]
    fn test_completion_tracks_latest_ticket() {
        let event = Event::new(&DevCpu::get());
        let first = event.record();
        let second = event.record();
        event.complete(first);
        assert!(!event.is_complete());
        event.complete(second);
        assert!(event.is_complete());
    }

    #[test]
    fn test_wait_blocks_until_completed() {
        let event = Event::new(&DevCpu::get());
        let ticket = event.record();
        let completer = event.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            completer.complete(ticket);
        });
        event.wait();
        assert!(event.is_complete());
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_timeout_expires() {
        let event = Event::new(&DevCpu::get());
        event.record();
        assert!(!event.wait_timeout(Duration::from_millis(5)));
    }
}
