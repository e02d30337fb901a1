//! Completion queue, completion channel, and work completion.

mod channel;
mod wc;

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Error as IoError};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

pub use self::channel::*;
pub use self::wc::*;
use super::context::Context;

/// Shared state behind every handle of one CQ.
pub(crate) struct CqInner {
    ctx: Context,
    id: u32,
    capacity: u32,
    entries: Mutex<VecDeque<Wc>>,
    channel: Option<CompChannel>,
    armed: AtomicBool,
    unacked: AtomicU32,
    overrun: AtomicBool,
}

/// Completion queue: a bounded FIFO of [`Wc`]s filled by the device.
///
/// Clones are handles to one queue.
#[derive(Clone)]
pub struct Cq {
    inner: Arc<CqInner>,
}

impl fmt::Debug for Cq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("Cq<{}>", self.inner.id))
    }
}

impl Cq {
    /// Depth used when the caller has no better number.
    pub const DEFAULT_CQ_DEPTH: u32 = 128;

    /// Create a CQ holding up to `capacity` completions.
    ///
    /// If `channel` is given, the CQ reports to it once armed with
    /// [`Cq::req_notify`].
    pub fn new(
        ctx: &Context,
        capacity: u32,
        channel: Option<&CompChannel>,
    ) -> Result<Cq, CqCreationError> {
        let max_capacity = ctx.attr().max_cqe;
        if capacity > max_capacity {
            return Err(CqCreationError::TooManyCqes(max_capacity));
        }
        if capacity == 0 {
            return Err(CqCreationError::IoError(IoError::new(
                io::ErrorKind::InvalidInput,
                "CQ capacity must be positive",
            )));
        }

        Ok(Self {
            inner: Arc::new(CqInner {
                ctx: ctx.clone(),
                id: ctx.fabric().next_object_id(),
                capacity,
                entries: Mutex::new(VecDeque::with_capacity(capacity as usize)),
                channel: channel.cloned(),
                armed: AtomicBool::new(false),
                unacked: AtomicU32::new(0),
                overrun: AtomicBool::new(false),
            }),
        })
    }

    pub(crate) fn from_inner(inner: Arc<CqInner>) -> Self {
        Self { inner }
    }

    pub fn context(&self) -> &Context {
        &self.inner.ctx
    }

    /// Most completions the queue holds before it overruns.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.inner.capacity
    }

    /// Whether a completion was ever dropped because the queue was full.
    #[inline]
    pub fn overrun(&self) -> bool {
        self.inner.overrun.load(Ordering::Acquire)
    }

    /// Number of channel events delivered for this CQ but not acknowledged.
    #[inline]
    pub fn unacked_events(&self) -> u32 {
        self.inner.unacked.load(Ordering::Acquire)
    }

    /// Request a notification on the completion channel for the next
    /// completion added to this CQ.
    ///
    /// Completions already in the queue do not trigger a notification, so
    /// the usual pattern is to re-arm first and drain afterwards. Every
    /// completion notifies; there is no solicited-only arming.
    pub fn req_notify(&self) -> io::Result<()> {
        if self.inner.channel.is_none() {
            return Err(IoError::new(
                io::ErrorKind::InvalidInput,
                "CQ has no completion channel",
            ));
        }
        self.inner.armed.store(true, Ordering::Release);
        Ok(())
    }

    /// Acknowledge `num` events previously returned by
    /// [`CompChannel::get_cq_event`] for this CQ.
    pub fn ack_events(&self, num: u32) {
        let _ = self
            .inner
            .unacked
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(num))
            });
    }

    /// Take every queued completion without blocking.
    ///
    /// Statuses are not checked here.
    #[inline]
    pub fn poll(&self) -> io::Result<Vec<Wc>> {
        self.poll_some(self.capacity())
    }

    /// Take at most `num` queued completions without blocking.
    #[inline]
    pub fn poll_some(&self, num: u32) -> io::Result<Vec<Wc>> {
        let mut entries = self.inner.entries.lock();
        let n = entries.len().min(num as usize);
        Ok(entries.drain(..n).collect())
    }

    /// Take the oldest completion, if any.
    #[inline]
    pub fn poll_one(&self) -> io::Result<Option<Wc>> {
        Ok(self.inner.entries.lock().pop_front())
    }

    /// Fill the front of `wc` with queued completions and return how many
    /// were written. Slots past that count keep their old contents.
    #[inline]
    pub fn poll_into(&self, wc: &mut [Wc]) -> io::Result<u32> {
        let mut entries = self.inner.entries.lock();
        let mut polled = 0;
        for slot in wc.iter_mut() {
            let Some(entry) = entries.pop_front() else {
                break;
            };
            *slot = entry;
            polled += 1;
        }
        Ok(polled)
    }

    /// Spin until a completion shows up and take it. Its status is not checked.
    pub fn poll_one_blocking(&self) -> io::Result<Wc> {
        loop {
            if let Some(wc) = self.poll_one()? {
                return Ok(wc);
            }
            std::hint::spin_loop();
        }
    }

    /// Append a completion, as the NIC does when a work request finishes.
    pub(crate) fn push(&self, wc: Wc) {
        {
            let mut entries = self.inner.entries.lock();
            if entries.len() >= self.inner.capacity as usize {
                if !self.inner.overrun.swap(true, Ordering::AcqRel) {
                    log::error!("{:?} overrun, dropping completion {:?}", self, wc);
                }
                return;
            }
            entries.push_back(wc);
        }

        if self.inner.armed.swap(false, Ordering::AcqRel) {
            if let Some(channel) = self.inner.channel.as_ref() {
                channel.notify(Arc::downgrade(&self.inner));
            }
        }
    }

    pub(crate) fn mark_event_delivered(&self) {
        self.inner.unacked.fetch_add(1, Ordering::AcqRel);
    }

    #[cfg(test)]
    pub(crate) fn same_as(&self, other: &Cq) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// CQ creation error type.
#[derive(Debug, Error)]
pub enum CqCreationError {
    /// The device rejected the request.
    #[error("I/O error from the device")]
    IoError(#[from] IoError),

    /// The capacity of the CQ is larger than the device's maximum allowed
    /// capacity, which is contained in the error.
    #[error("CQ capacity too large (maximum: {0})")]
    TooManyCqes(u32),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::Fabric;
    use std::net::{IpAddr, Ipv4Addr};

    fn context() -> Context {
        let fabric = Fabric::new();
        fabric
            .add_nic("soft0", IpAddr::V4(Ipv4Addr::LOCALHOST))
            .unwrap();
        Context::open(&fabric, None).unwrap()
    }

    fn wc(wr_id: u64) -> Wc {
        Wc::new(wr_id, WcStatus::Success, WcOpcode::Send, 0, 1)
    }

    #[test]
    fn test_capacity_limits() {
        let ctx = context();
        let max = ctx.attr().max_cqe;
        assert!(matches!(
            Cq::new(&ctx, max + 1, None),
            Err(CqCreationError::TooManyCqes(m)) if m == max
        ));
        assert!(Cq::new(&ctx, 0, None).is_err());
    }

    #[test]
    fn test_poll_order_and_overrun() {
        let ctx = context();
        let cq = Cq::new(&ctx, 2, None).unwrap();
        cq.push(wc(1));
        cq.push(wc(2));
        cq.push(wc(3));
        assert!(cq.overrun());

        let polled = cq.poll().unwrap();
        assert_eq!(polled.iter().map(Wc::wr_id).collect::<Vec<_>>(), vec![1, 2]);
        assert!(cq.poll_one().unwrap().is_none());
    }

    #[test]
    fn test_poll_into() {
        let ctx = context();
        let cq = Cq::new(&ctx, 8, None).unwrap();
        cq.push(wc(1));
        cq.push(wc(2));

        let mut buf = [wc(0); 4];
        assert_eq!(cq.poll_into(&mut buf).unwrap(), 2);
        assert_eq!(buf[1].wr_id(), 2);
        assert_eq!(buf[2].wr_id(), 0);
    }

    #[test]
    fn test_req_notify_needs_channel() {
        let ctx = context();
        let cq = Cq::new(&ctx, 8, None).unwrap();
        assert!(cq.req_notify().is_err());
    }
}
