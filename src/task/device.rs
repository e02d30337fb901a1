use std::io::{self, Error as IoError, ErrorKind as IoErrorKind};
use std::net::IpAddr;

use super::sgl::{Segment, MAX_SGES};
use super::TaskError;
use crate::ctrl::{RemoteBufferDescriptor, TaskFlags, TaskOp};
use crate::fabric::Fabric;
use crate::rdma::context::Context;
use crate::rdma::cq::{Cq, Wc, WcStatus};
use crate::rdma::mr::{Buffer, MemoryKind, Mr, MrSlice, Permission, Slicing};
use crate::rdma::pd::Pd;
use crate::rdma::qp::{Qp, QpCaps, QpEndpoint, QpType};

/// Most completions one poll returns.
pub const POLL_BATCH: usize = 10;

/// Outcome of one submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub wr_id: u64,
    pub status: WcStatus,
}

impl From<Wc> for Completion {
    fn from(wc: Wc) -> Self {
        Self {
            wr_id: wc.wr_id(),
            status: wc.status(),
        }
    }
}

/// Memory a device registered for one-sided access by its peers.
pub trait TaskBuffer {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` over the buffer contents.
    fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R;

    /// Run `f` over the buffer contents, mutably.
    fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R;

    /// Copy of the first `n` bytes, for diagnostics.
    fn head(&self, n: usize) -> Vec<u8> {
        self.read(|bytes| bytes[..n.min(bytes.len())].to_vec())
    }
}

/// A buffer registered on the soft provider for local and remote access.
pub struct RdmaBuffer {
    mr: Mr,
}

impl TaskBuffer for RdmaBuffer {
    fn len(&self) -> usize {
        self.mr.len()
    }

    fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        self.mr.read(f)
    }

    fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        self.mr.write(f)
    }
}

impl RdmaBuffer {
    pub fn kind(&self) -> MemoryKind {
        self.mr.kind()
    }

    pub fn mr(&self) -> &Mr {
        &self.mr
    }

    /// Deregister and take back the memory.
    pub fn dereg(self) -> Buffer {
        self.mr.dereg()
    }

    fn slices(&self, segments: &[Segment]) -> io::Result<Vec<MrSlice<'_>>> {
        if segments.is_empty() {
            return Ok(vec![self.mr.as_slice()]);
        }
        segments
            .iter()
            .map(|seg| {
                self.mr.slice(seg.offset, seg.len).ok_or_else(|| {
                    IoError::new(
                        IoErrorKind::InvalidInput,
                        format!("segment {:?} exceeds the buffer", seg),
                    )
                })
            })
            .collect()
    }
}

/// One one-sided operation between a local buffer and a described remote
/// buffer.
pub struct RdmaTask<'a, B = RdmaBuffer> {
    pub remote: RemoteBufferDescriptor,
    pub local: &'a B,

    /// Local scatter/gather list. Empty means the whole buffer.
    pub segments: &'a [Segment],
    pub flags: TaskFlags,

    /// Reported back in the task's [`Completion`].
    pub wr_id: u64,
}

impl<B> Clone for RdmaTask<'_, B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B> Copy for RdmaTask<'_, B> {}

/// What the transfer loop needs from a device: registered buffers it can
/// describe to peers, and signaled one-sided operations on them.
///
/// [`RdmaDevice`] implements it over the soft provider. With the `verbs`
/// feature, `verbs::VerbsDevice` implements it over libibverbs.
pub trait OneSidedDevice {
    type Buffer: TaskBuffer;

    /// Allocate `size` bytes of the given kind and register them for local
    /// write and remote read and write.
    fn alloc_buffer(&self, size: usize, kind: MemoryKind) -> Result<Self::Buffer, TaskError>;

    /// Export the descriptor peers use to target `buf` on this device.
    fn descriptor(&self, buf: &Self::Buffer) -> Result<RemoteBufferDescriptor, TaskError>;

    /// Post the task's read or write, signaled.
    fn submit(&self, task: &RdmaTask<'_, Self::Buffer>) -> Result<(), TaskError>;

    /// Non-blockingly take up to `max` completions.
    fn poll_completions(&self, max: usize) -> Result<Vec<Completion>, TaskError>;

    /// Bring the device back to a usable state after a failed completion.
    fn reset(&self) -> Result<(), TaskError>;
}

impl<D: OneSidedDevice + ?Sized> OneSidedDevice for &D {
    type Buffer = D::Buffer;

    fn alloc_buffer(&self, size: usize, kind: MemoryKind) -> Result<Self::Buffer, TaskError> {
        (**self).alloc_buffer(size, kind)
    }

    fn descriptor(&self, buf: &Self::Buffer) -> Result<RemoteBufferDescriptor, TaskError> {
        (**self).descriptor(buf)
    }

    fn submit(&self, task: &RdmaTask<'_, Self::Buffer>) -> Result<(), TaskError> {
        (**self).submit(task)
    }

    fn poll_completions(&self, max: usize) -> Result<Vec<Completion>, TaskError> {
        (**self).poll_completions(max)
    }

    fn reset(&self) -> Result<(), TaskError> {
        (**self).reset()
    }
}

/// An opened device with a DC initiator QP and its CQ.
///
/// The QP also serves as the target other peers address when they access
/// buffers registered here.
pub struct RdmaDevice {
    pd: Pd,
    cq: Cq,
    qp: Qp,
}

impl RdmaDevice {
    /// Open the device owning `addr`; the unspecified address picks the first.
    pub fn open(fabric: &Fabric, addr: IpAddr) -> Result<Self, TaskError> {
        let ctx = Context::open_by_addr(fabric, addr).map_err(TaskError::Device)?;
        let pd = Pd::new(&ctx).map_err(TaskError::Device)?;
        let cq = Cq::new(&ctx, Cq::DEFAULT_CQ_DEPTH, None)?;
        let qp = Qp::builder()
            .send_cq(&cq)
            .recv_cq(&cq)
            .caps(QpCaps::for_dc(MAX_SGES as u32))
            .qp_type(QpType::Dc)
            .sq_sig_all(false)
            .build(&pd)?;
        qp.activate().map_err(TaskError::Device)?;
        log::debug!("opened {} for one-sided tasks, qpn {:#x}", ctx.name(), qp.qp_num());
        Ok(Self { pd, cq, qp })
    }

    pub fn context(&self) -> &Context {
        self.pd.context()
    }

    pub fn qp(&self) -> &Qp {
        &self.qp
    }

    pub fn endpoint(&self) -> QpEndpoint {
        self.qp.endpoint()
    }

    /// Register `buf` for local write and remote read and write.
    pub fn register(&self, buf: Buffer) -> Result<RdmaBuffer, TaskError> {
        let perm = Permission::LOCAL_WRITE | Permission::REMOTE_READ | Permission::REMOTE_WRITE;
        let mr = Mr::reg(&self.pd, buf, perm).map_err(TaskError::Device)?;
        Ok(RdmaBuffer { mr })
    }
}

impl OneSidedDevice for RdmaDevice {
    type Buffer = RdmaBuffer;

    fn alloc_buffer(&self, size: usize, kind: MemoryKind) -> Result<RdmaBuffer, TaskError> {
        let buf = Buffer::alloc(size, kind).map_err(TaskError::Device)?;
        self.register(buf)
    }

    fn descriptor(&self, buf: &RdmaBuffer) -> Result<RemoteBufferDescriptor, TaskError> {
        Ok(RemoteBufferDescriptor::new(
            &buf.mr.as_remote(),
            &self.endpoint(),
        )?)
    }

    fn submit(&self, task: &RdmaTask<'_>) -> Result<(), TaskError> {
        let submit_err = |source| TaskError::Submit {
            wr_id: task.wr_id,
            source,
        };
        let local = task.local.slices(task.segments).map_err(submit_err)?;
        let remote = task.remote.remote();
        let target = task.remote.endpoint();

        match task.flags.op() {
            TaskOp::Read => self
                .qp
                .read(&local, &remote, Some(&target), task.wr_id, true),
            TaskOp::Write => self
                .qp
                .write(&local, &remote, Some(&target), task.wr_id, true),
        }
        .map_err(submit_err)
    }

    fn poll_completions(&self, max: usize) -> Result<Vec<Completion>, TaskError> {
        let wcs = self.cq.poll_some(max as u32)?;
        Ok(wcs.into_iter().map(Completion::from).collect())
    }

    fn reset(&self) -> Result<(), TaskError> {
        self.qp.recover().map_err(TaskError::Device)?;
        let stale = self.cq.poll()?;
        log::debug!(
            "device reset, QP back in {}, {} stale completions dropped",
            self.qp.state(),
            stale.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::qp::QpState;

    fn devices() -> (Fabric, RdmaDevice, RdmaDevice) {
        let fabric = Fabric::new();
        fabric.add_nic("soft0", "10.0.0.1".parse().unwrap()).unwrap();
        fabric.add_nic("soft1", "10.0.0.2".parse().unwrap()).unwrap();
        let a = RdmaDevice::open(&fabric, "10.0.0.1".parse().unwrap()).unwrap();
        let b = RdmaDevice::open(&fabric, "10.0.0.2".parse().unwrap()).unwrap();
        (fabric, a, b)
    }

    #[test]
    fn test_write_then_read() {
        let (_fabric, local, remote) = devices();
        let src = local.alloc_buffer(256, MemoryKind::Host).unwrap();
        let dst = remote.alloc_buffer(256, MemoryKind::Device(0)).unwrap();
        src.write(|b| b.fill(0xab));
        let desc = remote.descriptor(&dst).unwrap();

        let task = RdmaTask {
            remote: desc,
            local: &src,
            segments: &[],
            flags: TaskFlags::for_op(TaskOp::Write),
            wr_id: 7,
        };
        local.submit(&task).unwrap();
        assert_eq!(
            local.poll_completions(POLL_BATCH).unwrap(),
            vec![Completion { wr_id: 7, status: WcStatus::Success }]
        );
        assert!(dst.read(|b| b.iter().all(|&x| x == 0xab)));

        dst.write(|b| b[..64].fill(0x11));
        let segments = [Segment { offset: 0, len: 64 }];
        let task = RdmaTask {
            flags: TaskFlags::for_op(TaskOp::Read),
            segments: &segments,
            wr_id: 8,
            ..task
        };
        local.submit(&task).unwrap();
        assert_eq!(local.poll_completions(POLL_BATCH).unwrap()[0].status, WcStatus::Success);
        assert_eq!(src.head(3), vec![0x11; 3]);
        assert_eq!(src.read(|b| b[64]), 0xab);
    }

    #[test]
    fn test_failure_and_reset() {
        let (_fabric, local, remote) = devices();
        let src = local.alloc_buffer(256, MemoryKind::Host).unwrap();
        let dst = remote.alloc_buffer(128, MemoryKind::Host).unwrap();
        let desc = remote.descriptor(&dst).unwrap();

        // Local buffer is larger than the remote one.
        let task = RdmaTask {
            remote: desc,
            local: &src,
            segments: &[],
            flags: TaskFlags::for_op(TaskOp::Write),
            wr_id: 1,
        };
        local.submit(&task).unwrap();
        assert_eq!(
            local.poll_completions(POLL_BATCH).unwrap()[0].status,
            WcStatus::RemAccessErr
        );
        assert_eq!(local.qp().state(), QpState::Error);

        // Posting in ERR flushes.
        local.submit(&task).unwrap();
        assert_eq!(
            local.poll_completions(POLL_BATCH).unwrap()[0].status,
            WcStatus::WrFlushErr
        );

        local.reset().unwrap();
        assert_eq!(local.qp().state(), QpState::Rts);
        let segments = [Segment { offset: 0, len: 128 }];
        local
            .submit(&RdmaTask {
                segments: &segments,
                ..task
            })
            .unwrap();
        assert_eq!(
            local.poll_completions(POLL_BATCH).unwrap()[0].status,
            WcStatus::Success
        );
    }

    #[test]
    fn test_segment_out_of_buffer() {
        let (_fabric, local, remote) = devices();
        let src = local.alloc_buffer(64, MemoryKind::Host).unwrap();
        let desc = remote
            .descriptor(&remote.alloc_buffer(64, MemoryKind::Host).unwrap())
            .unwrap();
        let segments = [Segment { offset: 64, len: 64 }];
        let err = local
            .submit(&RdmaTask {
                remote: desc,
                local: &src,
                segments: &segments,
                flags: TaskFlags::default(),
                wr_id: 3,
            })
            .unwrap_err();
        assert!(matches!(err, TaskError::Submit { wr_id: 3, .. }));
    }
}
