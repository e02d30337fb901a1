use std::fmt;
use std::ops::{BitOr, BitOrAssign, Sub};

use serde::{Deserialize, Serialize};

/// Access rights of a memory region, as `ibv_access_flags` bits.
///
/// Local read is always granted: the device may gather from any region for
/// sends and RDMA writes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Permission(u32);

impl Permission {
    pub const EMPTY: Self = Self(0);

    /// Receives and RDMA reads may scatter into the region.
    pub const LOCAL_WRITE: Self = Self(1);
    pub const REMOTE_WRITE: Self = Self(1 << 1);
    pub const REMOTE_READ: Self = Self(1 << 2);
    pub const REMOTE_ATOMIC: Self = Self(1 << 3);

    const NAMED: [(Self, &'static str); 4] = [
        (Self::LOCAL_WRITE, "LOCAL_WRITE"),
        (Self::REMOTE_WRITE, "REMOTE_WRITE"),
        (Self::REMOTE_READ, "REMOTE_READ"),
        (Self::REMOTE_ATOMIC, "REMOTE_ATOMIC"),
    ];

    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn bits(self) -> u32 {
        self.0
    }
}

/// Everything.
impl Default for Permission {
    fn default() -> Self {
        Self::NAMED.iter().fold(Self::EMPTY, |acc, (p, _)| acc | *p)
    }
}

impl fmt::Debug for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::EMPTY {
            return f.write_str("Permission(EMPTY)");
        }
        let mut names = Self::NAMED
            .iter()
            .filter(|(p, _)| self.contains(*p))
            .map(|(_, name)| *name);
        f.write_str("Permission(")?;
        if let Some(first) = names.next() {
            f.write_str(first)?;
        }
        for name in names {
            write!(f, " | {}", name)?;
        }
        f.write_str(")")
    }
}

impl BitOr for Permission {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Permission {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Drop the rights of `rhs`.
impl Sub for Permission {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self(self.0 & !rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_ops() {
        let p = Permission::LOCAL_WRITE | Permission::REMOTE_READ;
        assert!(p.contains(Permission::LOCAL_WRITE));
        assert!(!p.contains(Permission::REMOTE_WRITE));
        assert!(p.contains(Permission::EMPTY));
        assert_eq!(p - Permission::LOCAL_WRITE, Permission::REMOTE_READ);
        assert_eq!(Permission::default().bits(), 0b1111);
    }

    #[test]
    fn test_debug_names() {
        assert_eq!(format!("{:?}", Permission::EMPTY), "Permission(EMPTY)");
        let p = Permission::REMOTE_READ | Permission::LOCAL_WRITE;
        assert_eq!(format!("{:?}", p), "Permission(LOCAL_WRITE | REMOTE_READ)");
    }
}
