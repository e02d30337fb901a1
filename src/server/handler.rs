use std::sync::mpsc::Sender;
use std::sync::Arc;

use super::conn::Connection;
use super::table::{ConnHandle, ConnTable};
use crate::poller::{CompletionSink, PollerError};
use crate::rdma::cq::{Wc, WcOpcode, WcStatus};

/// Observable milestones of a [`ConnectionServer`](super::ConnectionServer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Resources are built and the receive is posted; accepting follows.
    ReceivePosted { handle: ConnHandle },

    /// The connection is up; the diagnostic send is posted next.
    Established { handle: ConnHandle },

    /// A message from the peer landed in the receive region.
    Received { handle: ConnHandle, message: String },

    SendCompleted { handle: ConnHandle },

    /// The peer disconnected and the connection's resources are released.
    Disconnected { handle: ConnHandle },

    /// The server or its poller hit an unrecoverable error.
    Fatal { reason: String },
}

#[derive(Clone, Default)]
pub(crate) struct NoticeBoard {
    tx: Option<Sender<Notice>>,
}

impl NoticeBoard {
    pub fn new(tx: Option<Sender<Notice>>) -> Self {
        Self { tx }
    }

    pub fn publish(&self, notice: Notice) {
        if let Some(tx) = &self.tx {
            // A gone observer is not an error.
            let _ = tx.send(notice);
        }
    }
}

/// Completion handler of a server: interprets every completion of the
/// shared CQ against the connection its work request ID names.
pub struct ConnectionHandler {
    table: Arc<ConnTable<Connection>>,
    notices: NoticeBoard,
    repost: bool,
}

impl ConnectionHandler {
    pub(crate) fn new(table: Arc<ConnTable<Connection>>, notices: NoticeBoard, repost: bool) -> Self {
        Self {
            table,
            notices,
            repost,
        }
    }

    fn on_receive(&self, handle: ConnHandle) -> Result<(), PollerError> {
        let Some(conn) = self.table.get(handle) else {
            log::warn!("receive completed for released {:?}", handle);
            return Ok(());
        };

        let message = conn.received_message();
        log::info!("received message: {}", message);
        if self.repost {
            conn.post_receive()?;
        }
        self.notices.publish(Notice::Received { handle, message });
        Ok(())
    }
}

impl CompletionSink for ConnectionHandler {
    fn deliver(&mut self, wc: Wc) -> Result<(), PollerError> {
        let handle = ConnHandle::from_wr_id(wc.wr_id());
        if let Err(status) = wc.ok() {
            if status == WcStatus::WrFlushErr {
                log::debug!("{:?} of {:?} flushed", wc.opcode(), handle);
                return Ok(());
            }
            log::error!(
                "completion of {:?} ({:?}) failed: {} ({})",
                handle,
                wc.opcode(),
                status,
                status.code()
            );
            let err = PollerError::Completion {
                wr_id: wc.wr_id(),
                status,
            };
            self.notices.publish(Notice::Fatal {
                reason: err.to_string(),
            });
            return Err(err);
        }

        match wc.opcode() {
            WcOpcode::Recv => self.on_receive(handle)?,
            WcOpcode::Send => {
                log::info!("send completed successfully.");
                self.notices.publish(Notice::SendCompleted { handle });
            }
            opcode => log::debug!("ignoring {:?} completion of {:?}", opcode, handle),
        }
        Ok(())
    }
}
