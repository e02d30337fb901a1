use serde::{Deserialize, Serialize};

use super::{MrSlice, Slicing};

/// A peer's registered range as seen from here: where it lives in the
/// peer's device address space and the rkey that unlocks it.
///
/// Holds no local resources. A remote slice is just a narrower `addr` and
/// `len` under the same rkey.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MrRemote {
    pub addr: u64,
    pub len: usize,
    pub rkey: u32,
}

impl MrRemote {
    pub fn new(addr: u64, len: usize, rkey: u32) -> Self {
        Self { addr, len, rkey }
    }

    /// A zero range under rkey 0, which no registration ever gets.
    pub fn dummy() -> Self {
        Self::default()
    }
}

impl<'s> Slicing<'s> for MrRemote {
    type Output = Self;

    fn addr(&'s self) -> u64 {
        self.addr
    }

    fn len(&'s self) -> usize {
        self.len
    }

    fn slice_within(&'s self, offset: usize, len: usize) -> Self::Output {
        Self {
            addr: self.addr + offset as u64,
            len,
            ..*self
        }
    }
}

/// Publish part of a local region to peers.
impl From<MrSlice<'_>> for MrRemote {
    fn from(slice: MrSlice<'_>) -> Self {
        Self::new(slice.addr(), slice.len(), slice.mr().rkey())
    }
}
