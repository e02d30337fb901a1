use std::fmt;
use std::io::{self, Error as IoError, ErrorKind as IoErrorKind};
use std::net::IpAddr;
use std::sync::Arc;

use regex::Regex;

use super::gid::Gid;
use crate::fabric::{DeviceAttr, Fabric, Nic};

struct ContextInner {
    fabric: Fabric,
    nic: Arc<Nic>,
}

impl fmt::Debug for ContextInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("dev", &self.nic.name())
            .field("gid", &self.nic.gid())
            .finish()
    }
}

/// Device context.
///
/// This type is a simple wrapper of an `Arc`. Opening the same device twice
/// yields two handles that compare equal, since equality is defined on the
/// underlying device rather than on the handle.
#[derive(Debug, Clone)]
#[repr(transparent)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Open a device on the given fabric.
    ///
    /// If `dev_name` is `None`, the first device found is used. Otherwise, the
    /// first device whose name matches `dev_name` is used. Regular expressions
    /// are supported (e.g., `soft[0-9]+`).
    pub fn open(fabric: &Fabric, dev_name: Option<&str>) -> io::Result<Self> {
        let nic = match dev_name {
            None => fabric.find_nic(|_| true),
            Some(name) => {
                let pattern = Regex::new(&format!("^(?:{})$", name)).map_err(|e| {
                    IoError::new(IoErrorKind::InvalidInput, format!("bad device name: {}", e))
                })?;
                fabric.find_nic(|nic| pattern.is_match(nic.name()))
            }
        };
        let nic = nic.ok_or_else(|| IoError::new(IoErrorKind::NotFound, "device not found"))?;
        Ok(Self::from_nic(fabric, nic))
    }

    /// Open the device that owns the given local address.
    ///
    /// An unspecified address (`0.0.0.0` or `::`) selects the first device.
    pub fn open_by_addr(fabric: &Fabric, addr: IpAddr) -> io::Result<Self> {
        let nic = fabric.nic_by_addr(addr).ok_or_else(|| {
            IoError::new(
                IoErrorKind::AddrNotAvailable,
                format!("no device bound to {}", addr),
            )
        })?;
        Ok(Self::from_nic(fabric, nic))
    }

    pub(crate) fn from_nic(fabric: &Fabric, nic: Arc<Nic>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                fabric: fabric.clone(),
                nic,
            }),
        }
    }

    /// Get the device name.
    #[inline]
    pub fn name(&self) -> &str {
        self.inner.nic.name()
    }

    /// Get the IP address of the device.
    #[inline]
    pub fn addr(&self) -> IpAddr {
        self.inner.nic.addr()
    }

    /// Get the LID of the device port.
    #[inline]
    pub fn lid(&self) -> u16 {
        self.inner.nic.lid()
    }

    /// Get the GID of the device port.
    #[inline]
    pub fn gid(&self) -> Gid {
        self.inner.nic.gid()
    }

    /// Get the device attributes.
    #[inline]
    pub fn attr(&self) -> &DeviceAttr {
        self.inner.nic.attr()
    }

    /// Get the fabric this device is attached to.
    #[inline]
    pub fn fabric(&self) -> &Fabric {
        &self.inner.fabric
    }

    /// Whether both handles refer to the same underlying device.
    pub fn same_device(&self, other: &Context) -> bool {
        self.inner.fabric.same_as(&other.inner.fabric)
            && self.inner.nic.index() == other.inner.nic.index()
    }

    pub(crate) fn nic_index(&self) -> usize {
        self.inner.nic.index()
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        self.same_device(other)
    }
}

impl Eq for Context {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn two_nics() -> Fabric {
        let fabric = Fabric::new();
        fabric
            .add_nic("soft0", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)))
            .unwrap();
        fabric
            .add_nic("soft1", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)))
            .unwrap();
        fabric
    }

    #[test]
    fn test_open_by_name() {
        let fabric = two_nics();
        let ctx = Context::open(&fabric, Some("soft1")).unwrap();
        assert_eq!(ctx.name(), "soft1");
        assert_eq!(ctx.lid(), 2);

        let ctx = Context::open(&fabric, Some("soft[0-9]")).unwrap();
        assert_eq!(ctx.name(), "soft0");

        let err = Context::open(&fabric, Some("mlx5_0")).unwrap_err();
        assert_eq!(err.kind(), IoErrorKind::NotFound);
    }

    #[test]
    fn test_same_device() {
        let fabric = two_nics();
        let a = Context::open(&fabric, None).unwrap();
        let b = Context::open_by_addr(&fabric, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))).unwrap();
        let c = Context::open(&fabric, Some("soft1")).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);

        // Same name on another fabric is another device.
        let other = two_nics();
        let d = Context::open(&other, None).unwrap();
        assert_ne!(a, d);
    }
}
