use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Error as IoError, ErrorKind as IoErrorKind};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use super::RawCmEvent;

struct State {
    events: VecDeque<RawCmEvent>,
    closed: bool,
}

struct ChannelInner {
    state: Mutex<State>,
    cond: Condvar,
}

/// Connection manager event channel.
///
/// Identifiers created on a channel, and the children a listener spawns,
/// report their events here in the order they happen.
#[derive(Clone)]
pub struct EventChannel {
    inner: Arc<ChannelInner>,
}

impl fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("EventChannel<{:p}>", Arc::as_ptr(&self.inner)))
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl EventChannel {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                state: Mutex::new(State {
                    events: VecDeque::new(),
                    closed: false,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Block until the next event arrives.
    ///
    /// Fails with `BrokenPipe` once the channel is closed and every queued
    /// event has been taken.
    pub fn get_event(&self) -> io::Result<RawCmEvent> {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(event) = state.events.pop_front() {
                return Ok(event);
            }
            if state.closed {
                return Err(IoError::new(
                    IoErrorKind::BrokenPipe,
                    "event channel closed",
                ));
            }
            self.inner.cond.wait(&mut state);
        }
    }

    /// Take the next event if one is queued.
    pub fn try_get_event(&self) -> Option<RawCmEvent> {
        self.inner.state.lock().events.pop_front()
    }

    /// Close the channel. Queued events can still be taken.
    pub fn close(&self) {
        self.inner.state.lock().closed = true;
        self.inner.cond.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub(crate) fn push(&self, event: RawCmEvent) {
        let mut state = self.inner.state.lock();
        if state.closed {
            log::debug!("dropping {} on closed channel", event.kind);
            return;
        }
        log::trace!("{:?}: {}", event.id, event.kind);
        state.events.push_back(event);
        drop(state);
        self.inner.cond.notify_one();
    }
}
