use std::ops::{Bound, RangeBounds};

use super::*;

/// Byte ranges of a registered region, addressed by offset, by range or by
/// device virtual address.
///
/// Every accessor checks bounds against [`Slicing::len`]; an empty slice
/// must still start inside the region. Implemented for [`Mr`], [`MrSlice`]
/// and [`MrRemote`] only.
#[allow(private_bounds)]
#[allow(clippy::len_without_is_empty)]
pub trait Slicing<'s>: sealed::Sealed {
    type Output: 's;

    /// Device virtual address of the first byte.
    fn addr(&'s self) -> u64;

    fn len(&'s self) -> usize;

    #[doc(hidden)]
    fn slice_within(&'s self, offset: usize, len: usize) -> Self::Output;

    /// The whole range.
    fn as_slice(&'s self) -> Self::Output {
        self.slice_within(0, self.len())
    }

    /// `len` bytes starting `offset` bytes in.
    fn slice(&'s self, offset: usize, len: usize) -> Option<Self::Output> {
        let end = offset.checked_add(len)?;
        (offset < self.len() && end <= self.len()).then(|| self.slice_within(offset, len))
    }

    fn slice_by_range(&'s self, range: impl RangeBounds<usize>) -> Option<Self::Output> {
        let start = match range.start_bound() {
            Bound::Included(&s) => s,
            Bound::Excluded(&s) => s.checked_add(1)?,
            Bound::Unbounded => 0,
        };
        let end = match range.end_bound() {
            Bound::Included(&e) => e.checked_add(1)?,
            Bound::Excluded(&e) => e,
            Bound::Unbounded => self.len(),
        };
        self.slice(start, end.checked_sub(start)?)
    }

    /// `len` bytes starting at device address `addr`.
    fn slice_by_addr(&'s self, addr: u64, len: usize) -> Option<Self::Output> {
        let offset = addr.checked_sub(self.addr())?;
        self.slice(usize::try_from(offset).ok()?, len)
    }
}

mod sealed {
    pub trait Sealed {}

    impl Sealed for super::Mr {}
    impl Sealed for super::MrSlice<'_> {}
    impl Sealed for super::MrRemote {}
}
