use std::sync::Arc;

use crate::cm::CmError;
use crate::rdma::context::Context;
use crate::rdma::cq::{CompChannel, Cq};
use crate::rdma::pd::Pd;

/// Device resources shared by every connection of a server: the protection
/// domain, one CQ for all queue pairs, and the channel that CQ reports to.
///
/// Immutable once built.
#[derive(Debug)]
pub struct DeviceContext {
    ctx: Context,
    pd: Pd,
    cq: Cq,
    channel: CompChannel,
}

impl DeviceContext {
    /// Build the resources on `verbs` and arm the CQ.
    pub fn build(verbs: &Context, cq_depth: u32) -> Result<Self, CmError> {
        let pd = Pd::new(verbs)?;
        let channel = CompChannel::new(verbs)?;
        let cq = Cq::new(verbs, cq_depth, Some(&channel))?;
        cq.req_notify()?;
        log::debug!("built device context on {}", verbs.name());
        Ok(Self {
            ctx: verbs.clone(),
            pd,
            cq,
            channel,
        })
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn pd(&self) -> &Pd {
        &self.pd
    }

    pub fn cq(&self) -> &Cq {
        &self.cq
    }

    pub fn channel(&self) -> &CompChannel {
        &self.channel
    }
}

/// Holder of the one [`DeviceContext`] a server may have.
///
/// The context is built on the first connection request, because a
/// listener bound to the wildcard address has no device until then.
#[derive(Debug, Default)]
pub struct DeviceSlot {
    dev: Option<Arc<DeviceContext>>,
}

impl DeviceSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<&Arc<DeviceContext>> {
        self.dev.as_ref()
    }

    /// Return the context for `verbs`, building it if this is the first
    /// request. The flag tells whether it was built by this call.
    ///
    /// Requests arriving on any other device fail with
    /// [`CmError::ForeignDevice`].
    pub fn get_or_build(
        &mut self,
        verbs: &Context,
        cq_depth: u32,
    ) -> Result<(Arc<DeviceContext>, bool), CmError> {
        if let Some(dev) = &self.dev {
            if !dev.context().same_device(verbs) {
                return Err(CmError::ForeignDevice {
                    have: dev.context().name().to_owned(),
                    got: verbs.name().to_owned(),
                });
            }
            return Ok((dev.clone(), false));
        }

        let dev = Arc::new(DeviceContext::build(verbs, cq_depth)?);
        self.dev = Some(dev.clone());
        Ok((dev, true))
    }
}
