//! Memory buffers and registrations.

mod buffer;
mod mr_slice;
mod perm;
mod remote;
mod slicing;

use std::fmt;
use std::io::{self, Error as IoError, ErrorKind as IoErrorKind};
use std::sync::Arc;

use parking_lot::Mutex;

pub use self::buffer::*;
pub use self::mr_slice::*;
pub use self::perm::*;
pub use self::remote::*;
pub use self::slicing::*;
use super::pd::Pd;
use crate::fabric::MemCore;

/// Local memory region.
///
/// A memory region owns the [`Buffer`] registered to the RDMA device; the
/// device accesses the bytes on behalf of local work requests and, when the
/// permissions allow it, of remote peers holding the rkey. The buffer is
/// handed back on [`Mr::dereg`], or freed together with the region on drop.
pub struct Mr {
    pd: Pd,
    mem: Arc<MemCore>,
    registered: bool,
}

impl fmt::Debug for Mr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mr")
            .field("addr", &format_args!("{:#x}", self.mem.addr))
            .field("len", &self.mem.len)
            .field("lkey", &self.mem.lkey)
            .field("perm", &self.mem.perm)
            .finish()
    }
}

impl Mr {
    /// Register a memory region with the given protection domain.
    pub fn reg(pd: &Pd, buf: Buffer, perm: Permission) -> io::Result<Self> {
        let ctx = pd.context();
        if buf.len() as u64 > ctx.attr().max_mr_size {
            return Err(IoError::new(
                IoErrorKind::InvalidInput,
                format!("region of {} bytes exceeds device limit", buf.len()),
            ));
        }

        let fabric = ctx.fabric();
        let key = fabric.alloc_key();
        let (bytes, kind) = buf.into_parts();
        let mem = Arc::new(MemCore {
            addr: fabric.alloc_addr(bytes.len()),
            len: bytes.len(),
            lkey: key,
            rkey: key,
            perm,
            pd: pd.id(),
            nic: ctx.nic_index(),
            kind,
            bytes: Mutex::new(bytes),
        });
        fabric.register_mem(mem.clone());

        Ok(Self {
            pd: pd.clone(),
            mem,
            registered: true,
        })
    }

    /// Get the protection domain this region is registered on.
    #[inline]
    pub fn pd(&self) -> &Pd {
        &self.pd
    }

    /// Get the start address of the region in the device address space.
    #[inline]
    pub fn addr(&self) -> u64 {
        self.mem.addr
    }

    /// Get the length of the registered memory area.
    #[allow(clippy::len_without_is_empty)]
    #[inline]
    pub fn len(&self) -> usize {
        self.mem.len
    }

    /// Get the local key of the memory region.
    #[inline]
    pub fn lkey(&self) -> u32 {
        self.mem.lkey
    }

    /// Get the remote key of the memory region.
    #[inline]
    pub fn rkey(&self) -> u32 {
        self.mem.rkey
    }

    /// Get the access permissions the region was registered with.
    #[inline]
    pub fn perm(&self) -> Permission {
        self.mem.perm
    }

    /// Get the kind of memory backing this region.
    #[inline]
    pub fn kind(&self) -> MemoryKind {
        self.mem.kind
    }

    /// Run `f` over the registered bytes.
    ///
    /// The device cannot touch the bytes while `f` runs.
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.mem.bytes.lock())
    }

    /// Run `f` over the registered bytes, mutably.
    ///
    /// The device cannot touch the bytes while `f` runs.
    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.mem.bytes.lock())
    }

    /// View this local memory region as a remote memory region for RDMA access
    /// from remote peers.
    #[inline]
    pub fn as_remote(&self) -> MrRemote {
        MrRemote {
            addr: self.addr(),
            len: self.len(),
            rkey: self.rkey(),
        }
    }

    /// Deregister the region and take back its buffer.
    pub fn dereg(mut self) -> Buffer {
        self.release()
    }

    pub(crate) fn core(&self) -> &Arc<MemCore> {
        &self.mem
    }

    fn release(&mut self) -> Buffer {
        self.registered = false;
        self.pd.context().fabric().unregister_mem(self.mem.rkey);
        let bytes = std::mem::take(&mut *self.mem.bytes.lock());
        Buffer::from_parts(bytes, self.mem.kind)
    }
}

impl Drop for Mr {
    fn drop(&mut self) {
        if self.registered {
            drop(self.release());
        }
    }
}

impl<'s> Slicing<'s> for Mr {
    type Output = MrSlice<'s>;

    #[inline]
    fn addr(&'s self) -> u64 {
        self.mem.addr
    }

    #[inline]
    fn len(&'s self) -> usize {
        self.mem.len
    }

    #[inline]
    fn slice_within(&'s self, offset: usize, len: usize) -> Self::Output {
        MrSlice::new(self, offset, len)
    }
}
