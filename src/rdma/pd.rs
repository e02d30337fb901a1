use std::fmt;
use std::io;
use std::sync::Arc;

use super::context::Context;

struct PdInner {
    ctx: Context,
    id: u32,
}

/// Protection domain.
///
/// Memory regions and queue pairs can only reference each other when they
/// are created on the same protection domain.
#[derive(Clone)]
pub struct Pd {
    inner: Arc<PdInner>,
}

impl fmt::Debug for Pd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("Pd<{}@{}>", self.inner.id, self.inner.ctx.name()))
    }
}

impl Pd {
    /// Allocate a new protection domain on the given device.
    pub fn new(ctx: &Context) -> io::Result<Self> {
        let id = ctx.fabric().next_object_id();
        Ok(Self {
            inner: Arc::new(PdInner {
                ctx: ctx.clone(),
                id,
            }),
        })
    }

    /// Get the underlying [`Context`].
    #[inline]
    pub fn context(&self) -> &Context {
        &self.inner.ctx
    }

    #[inline]
    pub(crate) fn id(&self) -> u32 {
        self.inner.id
    }
}

impl PartialEq for Pd {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Pd {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::Fabric;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_alloc() {
        let fabric = Fabric::new();
        fabric
            .add_nic("soft0", IpAddr::V4(Ipv4Addr::LOCALHOST))
            .unwrap();
        let ctx = Context::open(&fabric, None).unwrap();
        let pd = Pd::new(&ctx).unwrap();
        let other = Pd::new(&ctx).unwrap();
        assert_eq!(pd.context(), &ctx);
        assert_ne!(pd, other);
        assert_eq!(pd, pd.clone());
    }
}
