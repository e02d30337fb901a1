//! Background completion polling.
//!
//! A [`CompletionPoller`] owns one completion channel and the CQ that
//! reports to it. Its loop waits for a completion event, acknowledges it,
//! re-arms the CQ, and then drains every ready completion into a
//! [`CompletionSink`], in the order the device produced them. Since the
//! poller is the only consumer of its CQ, sink invocations never overlap.

use std::io;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use thiserror::Error;

use crate::rdma::cq::{CompChannel, Cq, Wc, WcStatus};

/// Completion poller error type.
#[derive(Debug, Error)]
pub enum PollerError {
    #[error("I/O error while polling completions")]
    Io(#[from] io::Error),

    /// A work request completed with a non-success status.
    #[error("work request {wr_id} failed: {status} ({})", .status.code())]
    Completion { wr_id: u64, status: WcStatus },

    /// Nobody consumes the delivered completions anymore.
    #[error("completion sink disconnected")]
    SinkClosed,
}

/// Consumer of the completions a [`CompletionPoller`] discovers.
pub trait CompletionSink {
    /// Handle one completion. An error stops the poller.
    fn deliver(&mut self, wc: Wc) -> Result<(), PollerError>;
}

/// Forward completions to another thread as they are.
impl CompletionSink for mpsc::Sender<Wc> {
    fn deliver(&mut self, wc: Wc) -> Result<(), PollerError> {
        self.send(wc).map_err(|_| PollerError::SinkClosed)
    }
}

/// Event-driven completion poller.
pub struct CompletionPoller<S> {
    channel: CompChannel,
    cq: Cq,
    sink: S,
}

impl<S: CompletionSink> CompletionPoller<S> {
    pub fn new(channel: CompChannel, cq: Cq, sink: S) -> Self {
        Self { channel, cq, sink }
    }

    /// Run the poller on a dedicated thread named `cq-poller`.
    pub fn spawn(self) -> io::Result<JoinHandle<Result<(), PollerError>>>
    where
        S: Send + 'static,
    {
        self.spawn_then(|_| ())
    }

    /// Like [`CompletionPoller::spawn`], with `on_exit` seeing the poller's
    /// result on the poller thread before it is returned to the joiner.
    pub fn spawn_then<F>(self, on_exit: F) -> io::Result<JoinHandle<Result<(), PollerError>>>
    where
        S: Send + 'static,
        F: FnOnce(&Result<(), PollerError>) + Send + 'static,
    {
        thread::Builder::new()
            .name("cq-poller".to_owned())
            .spawn(move || {
                let res = self.run();
                on_exit(&res);
                res
            })
    }

    /// Run the poller on the current thread.
    ///
    /// Returns `Ok(())` once the completion channel is closed, or the first
    /// error raised by the sink.
    pub fn run(mut self) -> Result<(), PollerError> {
        // Completions queued before the first wait would never raise an event.
        let cq = self.cq.clone();
        cq.req_notify()?;
        self.drain(&cq)?;

        loop {
            let cq = match self.channel.get_cq_event() {
                Ok(cq) => cq,
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    log::debug!("completion channel closed, poller exits");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            cq.ack_events(1);
            cq.req_notify()?;
            self.drain(&cq)?;
        }
    }

    fn drain(&mut self, cq: &Cq) -> Result<(), PollerError> {
        while let Some(wc) = cq.poll_one()? {
            log::trace!("polled {:?}", wc);
            self.sink.deliver(wc)?;
        }
        Ok(())
    }
}
