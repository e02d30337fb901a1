use std::fmt;

use super::{Mr, Slicing};
use crate::fabric::Sge;

/// A byte range of a local region, as a work request carries it in its
/// scatter/gather list.
///
/// **Subtyping:** [`MrSlice<'a>`] is *covariant* over `'a`.
#[derive(Clone, Copy)]
pub struct MrSlice<'a> {
    mr: &'a Mr,
    offset: usize,
    len: usize,
}

impl fmt::Debug for MrSlice<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MrSlice<lkey {:#x}>[{}..{}]",
            self.mr.lkey(),
            self.offset,
            self.offset + self.len
        )
    }
}

impl<'a> MrSlice<'a> {
    pub(crate) fn new(mr: &'a Mr, offset: usize, len: usize) -> Self {
        Self { mr, offset, len }
    }

    #[inline]
    pub fn mr(&self) -> &'a Mr {
        self.mr
    }

    /// Offset of the first byte within the region.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub(crate) fn to_sge(self) -> Sge {
        Sge {
            mem: self.mr.core().clone(),
            offset: self.offset,
            len: self.len,
        }
    }
}

impl<'a, 's> Slicing<'s> for MrSlice<'a>
where
    'a: 's,
{
    type Output = MrSlice<'s>;

    fn addr(&'s self) -> u64 {
        self.mr.addr() + self.offset as u64
    }

    fn len(&'s self) -> usize {
        self.len
    }

    fn slice_within(&'s self, offset: usize, len: usize) -> Self::Output {
        MrSlice::new(self.mr, self.offset + offset, len)
    }
}
