use std::sync::Arc;

use parking_lot::Mutex;

use crate::rdma::mr::{MemoryKind, Permission};

/// Backing store of one memory registration.
///
/// The bytes are taken out on deregistration, after which every access to
/// the region fails its bounds check.
pub(crate) struct MemCore {
    pub addr: u64,
    pub len: usize,
    pub lkey: u32,
    pub rkey: u32,
    pub perm: Permission,
    pub pd: u32,
    pub nic: usize,
    pub kind: MemoryKind,
    pub bytes: Mutex<Box<[u8]>>,
}

impl MemCore {
    /// Translate a virtual address range into an offset within the region.
    pub fn offset_of(&self, addr: u64, len: usize) -> Option<usize> {
        let end = addr.checked_add(len as u64)?;
        if addr < self.addr || end > self.addr + self.len as u64 {
            return None;
        }
        Some((addr - self.addr) as usize)
    }

    /// Copy `len` bytes at `offset` out of the region.
    pub fn gather(&self, offset: usize, len: usize) -> Option<Vec<u8>> {
        let bytes = self.bytes.lock();
        let end = offset.checked_add(len)?;
        bytes.get(offset..end).map(<[u8]>::to_vec)
    }

    /// Copy `data` into the region at `offset`.
    pub fn scatter(&self, offset: usize, data: &[u8]) -> bool {
        let mut bytes = self.bytes.lock();
        let Some(end) = offset.checked_add(data.len()) else {
            return false;
        };
        match bytes.get_mut(offset..end) {
            Some(dst) => {
                dst.copy_from_slice(data);
                true
            }
            None => false,
        }
    }
}

/// One scatter/gather element of a posted work request.
#[derive(Clone)]
pub(crate) struct Sge {
    pub mem: Arc<MemCore>,
    pub offset: usize,
    pub len: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(len: usize) -> MemCore {
        MemCore {
            addr: 0x10000,
            len,
            lkey: 1,
            rkey: 1,
            perm: Permission::LOCAL_WRITE,
            pd: 1,
            nic: 0,
            kind: MemoryKind::Host,
            bytes: Mutex::new(vec![0u8; len].into_boxed_slice()),
        }
    }

    #[test]
    fn test_offset_of_bounds() {
        let mem = region(64);
        assert_eq!(mem.offset_of(0x10000, 64), Some(0));
        assert_eq!(mem.offset_of(0x10010, 16), Some(16));
        assert_eq!(mem.offset_of(0x10010, 64), None);
        assert_eq!(mem.offset_of(0xffff, 1), None);
        assert_eq!(mem.offset_of(u64::MAX, 2), None);
    }

    #[test]
    fn test_scatter_gather() {
        let mem = region(8);
        assert!(mem.scatter(2, &[1, 2, 3]));
        assert!(!mem.scatter(6, &[1, 2, 3]));
        assert_eq!(mem.gather(1, 4), Some(vec![0, 1, 2, 3]));
        assert_eq!(mem.gather(7, 2), None);

        // Deregistered regions have no bytes left.
        *mem.bytes.lock() = Box::default();
        assert_eq!(mem.gather(0, 1), None);
    }
}
