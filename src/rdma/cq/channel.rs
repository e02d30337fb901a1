use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Error as IoError, ErrorKind as IoErrorKind};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};

use super::{Cq, CqInner};
use crate::rdma::context::Context;

struct ChannelState {
    events: VecDeque<Weak<CqInner>>,
    closed: bool,
}

struct ChannelInner {
    ctx: Context,
    state: Mutex<ChannelState>,
    cond: Condvar,
}

/// Completion event channel.
///
/// An armed [`Cq`] posts one event here when its next completion arrives;
/// [`CompChannel::get_cq_event`] blocks until such an event is available.
#[derive(Clone)]
pub struct CompChannel {
    inner: Arc<ChannelInner>,
}

impl fmt::Debug for CompChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompChannel")
            .field("dev", &self.inner.ctx.name())
            .finish()
    }
}

impl CompChannel {
    /// Create a completion channel on the given device.
    pub fn new(ctx: &Context) -> io::Result<Self> {
        Ok(Self {
            inner: Arc::new(ChannelInner {
                ctx: ctx.clone(),
                state: Mutex::new(ChannelState {
                    events: VecDeque::new(),
                    closed: false,
                }),
                cond: Condvar::new(),
            }),
        })
    }

    /// Get the underlying [`Context`].
    pub fn context(&self) -> &Context {
        &self.inner.ctx
    }

    /// Block until a CQ reports an event, and return that CQ.
    ///
    /// Every returned event must eventually be acknowledged with
    /// [`Cq::ack_events`]. Fails with `BrokenPipe` once the channel is closed
    /// and no events remain.
    pub fn get_cq_event(&self) -> io::Result<Cq> {
        let mut state = self.inner.state.lock();
        loop {
            while let Some(event) = state.events.pop_front() {
                // Events of destroyed CQs are dropped.
                if let Some(inner) = event.upgrade() {
                    let cq = Cq::from_inner(inner);
                    cq.mark_event_delivered();
                    return Ok(cq);
                }
            }
            if state.closed {
                return Err(IoError::new(
                    IoErrorKind::BrokenPipe,
                    "completion channel closed",
                ));
            }
            self.inner.cond.wait(&mut state);
        }
    }

    /// Close the channel, waking up every blocked waiter.
    pub fn close(&self) {
        self.inner.state.lock().closed = true;
        self.inner.cond.notify_all();
    }

    pub(crate) fn notify(&self, cq: Weak<CqInner>) {
        let mut state = self.inner.state.lock();
        if state.closed {
            return;
        }
        state.events.push_back(cq);
        drop(state);
        self.inner.cond.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::Fabric;
    use crate::rdma::cq::{Wc, WcOpcode, WcStatus};
    use std::net::{IpAddr, Ipv4Addr};
    use std::thread;

    fn context() -> Context {
        let fabric = Fabric::new();
        fabric
            .add_nic("soft0", IpAddr::V4(Ipv4Addr::LOCALHOST))
            .unwrap();
        Context::open(&fabric, None).unwrap()
    }

    fn wc(wr_id: u64) -> Wc {
        Wc::new(wr_id, WcStatus::Success, WcOpcode::Recv, 0, 1)
    }

    #[test]
    fn test_event_only_when_armed() {
        let ctx = context();
        let chan = CompChannel::new(&ctx).unwrap();
        let cq = Cq::new(&ctx, 16, Some(&chan)).unwrap();

        // Not armed: nothing reaches the channel.
        cq.push(wc(1));
        chan.close();
        assert!(chan.get_cq_event().is_err());
        assert_eq!(cq.poll().unwrap().len(), 1);
    }

    #[test]
    fn test_one_event_per_arm() {
        let ctx = context();
        let chan = CompChannel::new(&ctx).unwrap();
        let cq = Cq::new(&ctx, 16, Some(&chan)).unwrap();

        cq.req_notify().unwrap();
        cq.push(wc(1));
        cq.push(wc(2));

        let got = chan.get_cq_event().unwrap();
        assert!(got.same_as(&cq));
        assert_eq!(cq.unacked_events(), 1);
        cq.ack_events(1);
        assert_eq!(cq.unacked_events(), 0);

        // The second completion did not produce another event.
        chan.close();
        assert!(chan.get_cq_event().is_err());
    }

    #[test]
    fn test_blocked_waiter_wakes_up() {
        let ctx = context();
        let chan = CompChannel::new(&ctx).unwrap();
        let cq = Cq::new(&ctx, 16, Some(&chan)).unwrap();
        cq.req_notify().unwrap();

        let waiter = {
            let chan = chan.clone();
            thread::spawn(move || chan.get_cq_event().map(|cq| cq.poll().unwrap().len()))
        };
        cq.push(wc(9));
        assert_eq!(waiter.join().unwrap().unwrap(), 1);
    }
}
