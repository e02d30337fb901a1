use std::collections::HashMap;
use std::ffi::CStr;
use std::fmt;
use std::io::{self, Error as IoError, ErrorKind as IoErrorKind};
use std::os::raw::c_int;
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::{mem, slice};

use parking_lot::Mutex;
use regex::Regex;

use super::sys::*;
use crate::ctrl::{RemoteBufferDescriptor, TaskOp};
use crate::rdma::cq::WcStatus;
use crate::rdma::gid::Gid;
use crate::rdma::mr::{MemoryKind, MrRemote};
use crate::rdma::qp::QpEndpoint;
use crate::task::{
    Completion, OneSidedDevice, RdmaTask, Segment, TaskBuffer, TaskError, MAX_SGES, POLL_BATCH,
};

/// Access key of every DC target this crate creates. Initiators present it
/// with each request.
pub const DC_ACCESS_KEY: u64 = 0x1ee7_a5a5_0000_4d43;

const CQ_DEPTH: c_int = 128;
const SQ_DEPTH: u32 = 64;

/// A verbs object, destroyed with `free` on drop.
struct Owned<T> {
    ptr: NonNull<T>,
    free: unsafe extern "C" fn(*mut T) -> c_int,
    what: &'static str,
}

// SAFETY: libibverbs objects may be used and destroyed from any thread.
unsafe impl<T> Send for Owned<T> {}
unsafe impl<T> Sync for Owned<T> {}

impl<T> Owned<T> {
    /// Take ownership of what a create call returned; null means it failed
    /// and `errno` says why.
    fn new(ptr: *mut T, free: unsafe extern "C" fn(*mut T) -> c_int, what: &'static str) -> io::Result<Self> {
        match NonNull::new(ptr) {
            Some(ptr) => Ok(Self { ptr, free, what }),
            None => {
                let err = IoError::last_os_error();
                log::error!("failed to create {}: {}", what, err);
                Err(err)
            }
        }
    }

    #[inline]
    fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }
}

impl<T> Drop for Owned<T> {
    fn drop(&mut self) {
        // SAFETY: the pointer came from the matching create call and is
        // destroyed exactly once.
        let rc = unsafe { (self.free)(self.ptr.as_ptr()) };
        if rc != 0 {
            log::warn!("failed to destroy {}: {}", self.what, IoError::from_raw_os_error(rc));
        }
    }
}

fn check(rc: c_int, what: &str) -> io::Result<()> {
    if rc == 0 {
        return Ok(());
    }
    let err = IoError::from_raw_os_error(rc.abs());
    log::error!("{} failed: {}", what, err);
    Err(err)
}

/// Open the first device whose name fully matches `dev_name`, or the first
/// device if none is given.
fn open_context(dev_name: Option<&str>) -> io::Result<(Owned<ibv_context>, String)> {
    let pattern = dev_name
        .map(|name| Regex::new(&format!("^(?:{})$", name)))
        .transpose()
        .map_err(|e| IoError::new(IoErrorKind::InvalidInput, format!("bad device name: {}", e)))?;

    let mut num = 0;
    // SAFETY: FFI.
    let list = unsafe { ibv_get_device_list(&mut num) };
    if list.is_null() {
        return Err(IoError::last_os_error());
    }

    // SAFETY: the list holds `num` valid device pointers until it is freed.
    let devices = unsafe { slice::from_raw_parts(list, num.max(0) as usize) };
    let found = devices.iter().copied().find_map(|dev| {
        // SAFETY: device names are NUL-terminated and live with the list.
        let name = unsafe { CStr::from_ptr(ibv_get_device_name(dev)) }
            .to_string_lossy()
            .into_owned();
        match &pattern {
            Some(pattern) if !pattern.is_match(&name) => None,
            _ => Some((dev, name)),
        }
    });

    let res = match found {
        // SAFETY: FFI on a listed device.
        Some((dev, name)) => Owned::new(unsafe { ibv_open_device(dev) }, ibv_close_device, "device context")
            .map(|ctx| (ctx, name)),
        None => Err(IoError::new(IoErrorKind::NotFound, "device not found")),
    };
    // SAFETY: an opened context stays valid after the list is freed.
    unsafe { ibv_free_device_list(list) };
    res
}

/// Create a DC queue pair of the given kind. Targets need an SRQ; initiators
/// get the extended send operations for reads and writes.
fn create_dc(
    ctx: &Owned<ibv_context>,
    pd: &Owned<ibv_pd>,
    cq: &Owned<ibv_cq>,
    srq: Option<&Owned<ibv_srq>>,
    max_sge: u32,
) -> io::Result<Owned<ibv_qp>> {
    // SAFETY: POD type.
    let mut attr: ibv_qp_init_attr_ex = unsafe { mem::zeroed() };
    attr.qp_type = IBV_QPT_DRIVER;
    attr.send_cq = cq.as_ptr();
    attr.recv_cq = cq.as_ptr();
    attr.pd = pd.as_ptr();
    attr.comp_mask = IBV_QP_INIT_ATTR_PD;

    let dc_type = match srq {
        Some(srq) => {
            attr.srq = srq.as_ptr();
            MLX5DV_DCTYPE_DCT
        }
        None => {
            attr.cap.max_send_wr = SQ_DEPTH;
            attr.cap.max_send_sge = max_sge;
            attr.comp_mask |= IBV_QP_INIT_ATTR_SEND_OPS_FLAGS;
            attr.send_ops_flags = (IBV_QP_EX_WITH_RDMA_WRITE | IBV_QP_EX_WITH_RDMA_READ) as u64;
            MLX5DV_DCTYPE_DCI
        }
    };

    // SAFETY: POD type.
    let mut dv: mlx5dv_qp_init_attr = unsafe { mem::zeroed() };
    dv.comp_mask = MLX5DV_QP_INIT_ATTR_MASK_DC as u64;
    dv.dc_init_attr = mlx5dv_dc_init_attr {
        dc_type,
        dct_access_key: DC_ACCESS_KEY,
    };

    // SAFETY: FFI with initialized attributes.
    let qp = unsafe { mlx5dv_create_qp(ctx.as_ptr(), &mut attr, &mut dv) };
    Owned::new(qp, ibv_destroy_qp, "DC QP")
}

struct DeviceInner {
    // Field order is destruction order.
    ahs: Mutex<HashMap<(u16, Gid), Owned<ibv_ah>>>,
    post: Mutex<()>,
    ops: DcSendOps,
    qpx: NonNull<ibv_qp_ex>,
    mqpx: NonNull<mlx5dv_qp_ex>,
    dci: Owned<ibv_qp>,
    dct: Owned<ibv_qp>,
    _srq: Owned<ibv_srq>,
    cq: Owned<ibv_cq>,
    pd: Owned<ibv_pd>,
    _ctx: Owned<ibv_context>,

    name: String,
    port_num: u8,
    gid_index: u8,
    lid: u16,
    gid: Gid,
    mtu: ibv_mtu,
    max_sge: u32,
    max_rd_atomic: u8,
}

// SAFETY: the extended QP views are only used under the `post` lock; every
// other object is thread safe in libibverbs.
unsafe impl Send for DeviceInner {}
unsafe impl Sync for DeviceInner {}

impl DeviceInner {
    fn ah_attr(&self, dlid: u16, dgid: Gid) -> ibv_ah_attr {
        // SAFETY: POD type.
        let mut attr: ibv_ah_attr = unsafe { mem::zeroed() };
        attr.dlid = dlid;
        attr.port_num = self.port_num;
        if !dgid.is_zero() {
            attr.is_global = 1;
            attr.grh.dgid.raw = dgid.to_u128().to_be_bytes();
            attr.grh.sgid_index = self.gid_index;
            attr.grh.hop_limit = 64;
        }
        attr
    }

    fn modify(&self, qp: &Owned<ibv_qp>, attr: &mut ibv_qp_attr, mask: ibv_qp_attr_mask, what: &str) -> io::Result<()> {
        // SAFETY: FFI.
        check(unsafe { ibv_modify_qp(qp.as_ptr(), attr, mask as c_int) }, what)
    }

    fn bring_up_dct(&self) -> io::Result<()> {
        // SAFETY: POD type.
        let mut attr: ibv_qp_attr = unsafe { mem::zeroed() };
        attr.qp_state = IBV_QPS_INIT;
        attr.pkey_index = 0;
        attr.port_num = self.port_num;
        attr.qp_access_flags = IBV_ACCESS_REMOTE_WRITE | IBV_ACCESS_REMOTE_READ;
        self.modify(
            &self.dct,
            &mut attr,
            IBV_QP_STATE | IBV_QP_PKEY_INDEX | IBV_QP_PORT | IBV_QP_ACCESS_FLAGS,
            "DCT to INIT",
        )?;

        attr.qp_state = IBV_QPS_RTR;
        attr.path_mtu = self.mtu;
        attr.min_rnr_timer = 12;
        attr.ah_attr = self.ah_attr(self.lid, self.gid);
        self.modify(
            &self.dct,
            &mut attr,
            IBV_QP_STATE | IBV_QP_MIN_RNR_TIMER | IBV_QP_AV | IBV_QP_PATH_MTU,
            "DCT to RTR",
        )
    }

    fn bring_up_dci(&self) -> io::Result<()> {
        // SAFETY: POD type.
        let mut attr: ibv_qp_attr = unsafe { mem::zeroed() };
        attr.qp_state = IBV_QPS_INIT;
        attr.pkey_index = 0;
        attr.port_num = self.port_num;
        self.modify(
            &self.dci,
            &mut attr,
            IBV_QP_STATE | IBV_QP_PKEY_INDEX | IBV_QP_PORT,
            "DCI to INIT",
        )?;

        attr.qp_state = IBV_QPS_RTR;
        attr.path_mtu = self.mtu;
        self.modify(&self.dci, &mut attr, IBV_QP_STATE | IBV_QP_PATH_MTU, "DCI to RTR")?;

        attr.qp_state = IBV_QPS_RTS;
        attr.timeout = 14;
        attr.retry_cnt = 7;
        attr.rnr_retry = 7;
        attr.sq_psn = 0;
        attr.max_rd_atomic = self.max_rd_atomic;
        self.modify(
            &self.dci,
            &mut attr,
            IBV_QP_STATE
                | IBV_QP_TIMEOUT
                | IBV_QP_RETRY_CNT
                | IBV_QP_RNR_RETRY
                | IBV_QP_SQ_PSN
                | IBV_QP_MAX_QP_RD_ATOMIC,
            "DCI to RTS",
        )
    }

    fn endpoint(&self) -> QpEndpoint {
        QpEndpoint {
            gid: self.gid,
            lid: self.lid,
            // SAFETY: the QP outlives `self`.
            qpn: unsafe { (*self.dct.as_ptr()).qp_num },
        }
    }

    /// Address handle of the port `ep` lives on, created on first use.
    fn ah_for(&self, ep: &QpEndpoint) -> io::Result<*mut ibv_ah> {
        let mut ahs = self.ahs.lock();
        if let Some(ah) = ahs.get(&(ep.lid, ep.gid)) {
            return Ok(ah.as_ptr());
        }
        let mut attr = self.ah_attr(ep.lid, ep.gid);
        // SAFETY: FFI.
        let ah = Owned::new(unsafe { ibv_create_ah(self.pd.as_ptr(), &mut attr) }, ibv_destroy_ah, "AH")?;
        let ptr = ah.as_ptr();
        ahs.insert((ep.lid, ep.gid), ah);
        Ok(ptr)
    }

    fn post(&self, task: &RdmaTask<'_, VerbsBuffer>) -> io::Result<()> {
        let sges = task.local.sges(task.segments)?;
        if sges.len() > self.max_sge as usize {
            return Err(IoError::new(
                IoErrorKind::InvalidInput,
                format!("{} segments exceed the device limit of {}", sges.len(), self.max_sge),
            ));
        }
        let remote = task.remote.remote();
        let ah = self.ah_for(&task.remote.endpoint())?;
        let qpn = task.remote.endpoint().qpn;

        let ops = self.ops;
        let qpx = self.qpx.as_ptr();
        let _post = self.post.lock();
        // SAFETY: the send path is serialized by `post`, and `sges` outlives
        // the posting sequence.
        let rc = unsafe {
            (ops.start)(qpx);
            (*qpx).wr_id = task.wr_id;
            (*qpx).wr_flags = IBV_SEND_SIGNALED;
            match task.flags.op() {
                TaskOp::Read => (ops.rdma_read)(qpx, remote.rkey, remote.addr),
                TaskOp::Write => (ops.rdma_write)(qpx, remote.rkey, remote.addr),
            }
            (ops.set_dc_addr)(self.mqpx.as_ptr(), ah, qpn, DC_ACCESS_KEY);
            (ops.set_sge_list)(qpx, sges.len(), sges.as_ptr());
            (ops.complete)(qpx)
        };
        check(rc, "posting a DC work request")
    }
}

/// A host buffer registered on a [`VerbsDevice`] for local write and remote
/// read and write.
pub struct VerbsBuffer {
    // Deregistered before the memory goes away.
    _mr: Owned<ibv_mr>,
    mem: Mutex<Box<[u8]>>,
    addr: u64,
    lkey: u32,
    rkey: u32,
    dev: Arc<DeviceInner>,
}

impl fmt::Debug for VerbsBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerbsBuffer")
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("len", &self.len())
            .field("rkey", &format_args!("{:#x}", self.rkey))
            .finish()
    }
}

impl TaskBuffer for VerbsBuffer {
    fn len(&self) -> usize {
        self.mem.lock().len()
    }

    fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.mem.lock())
    }

    fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.mem.lock())
    }
}

impl VerbsBuffer {
    #[inline]
    pub fn lkey(&self) -> u32 {
        self.lkey
    }

    #[inline]
    pub fn rkey(&self) -> u32 {
        self.rkey
    }

    fn sge(&self, offset: usize, len: usize) -> io::Result<ibv_sge> {
        let in_bounds = offset.checked_add(len).is_some_and(|end| end <= self.len());
        let length = u32::try_from(len).ok().filter(|_| in_bounds).ok_or_else(|| {
            IoError::new(
                IoErrorKind::InvalidInput,
                format!("segment {}+{} exceeds the buffer", offset, len),
            )
        })?;
        Ok(ibv_sge {
            addr: self.addr + offset as u64,
            length,
            lkey: self.lkey,
        })
    }

    fn sges(&self, segments: &[Segment]) -> io::Result<Vec<ibv_sge>> {
        if segments.is_empty() {
            return Ok(vec![self.sge(0, self.len())?]);
        }
        segments.iter().map(|seg| self.sge(seg.offset, seg.len)).collect()
    }
}

/// An opened verbs device with a DC target peers address and a DC initiator
/// that reaches them, sharing one CQ.
///
/// Clones refer to the same device.
#[derive(Clone)]
pub struct VerbsDevice {
    inner: Arc<DeviceInner>,
}

impl fmt::Debug for VerbsDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerbsDevice")
            .field("name", &self.inner.name)
            .field("port_num", &self.inner.port_num)
            .field("endpoint", &self.inner.endpoint())
            .finish()
    }
}

impl VerbsDevice {
    /// Open the device whose name fully matches `dev_name` (a regex), or the
    /// first one, and bring up its DC queue pairs on the given port and GID.
    pub fn open(dev_name: Option<&str>, port_num: u8, gid_index: u8) -> Result<Self, TaskError> {
        let dev = Self::open_inner(dev_name, port_num, gid_index).map_err(TaskError::Device)?;
        log::debug!(
            "opened {} for one-sided tasks, {}",
            dev.inner.name,
            dev.inner.endpoint()
        );
        Ok(dev)
    }

    fn open_inner(dev_name: Option<&str>, port_num: u8, gid_index: u8) -> io::Result<Self> {
        let (ctx, name) = open_context(dev_name)?;

        // SAFETY: POD type.
        let mut dev_attr: ibv_device_attr = unsafe { mem::zeroed() };
        // SAFETY: FFI.
        check(unsafe { ibv_query_device(ctx.as_ptr(), &mut dev_attr) }, "ibv_query_device")?;
        if port_num == 0 || port_num > dev_attr.phys_port_cnt {
            return Err(IoError::new(
                IoErrorKind::InvalidInput,
                format!("{} has no port {}", name, port_num),
            ));
        }

        // SAFETY: POD type.
        let mut port_attr: ibv_port_attr = unsafe { mem::zeroed() };
        // SAFETY: FFI; the compat struct is a prefix of `ibv_port_attr`.
        check(
            unsafe { ibv_query_port(ctx.as_ptr(), port_num, (&mut port_attr as *mut ibv_port_attr).cast()) },
            "ibv_query_port",
        )?;
        if port_attr.state != IBV_PORT_ACTIVE {
            return Err(IoError::new(
                IoErrorKind::NotConnected,
                format!("port {} of {} is not active", port_num, name),
            ));
        }

        // SAFETY: POD type.
        let mut raw_gid: ibv_gid = unsafe { mem::zeroed() };
        // SAFETY: FFI.
        check(
            unsafe { ibv_query_gid(ctx.as_ptr(), port_num, gid_index as c_int, &mut raw_gid) },
            "ibv_query_gid",
        )?;
        // SAFETY: every bit pattern is a valid byte array.
        let gid = Gid::from_u128(u128::from_be_bytes(unsafe { raw_gid.raw }));

        // SAFETY: FFI on an open context.
        let pd = Owned::new(unsafe { ibv_alloc_pd(ctx.as_ptr()) }, ibv_dealloc_pd, "PD")?;
        let cq = Owned::new(
            // SAFETY: FFI on an open context.
            unsafe { ibv_create_cq(ctx.as_ptr(), CQ_DEPTH, ptr::null_mut(), ptr::null_mut(), 0) },
            ibv_destroy_cq,
            "CQ",
        )?;

        // The target never receives, but DC targets require an SRQ.
        // SAFETY: POD type.
        let mut srq_attr: ibv_srq_init_attr = unsafe { mem::zeroed() };
        srq_attr.attr.max_wr = 1;
        srq_attr.attr.max_sge = 1;
        // SAFETY: FFI on a live PD.
        let srq = Owned::new(unsafe { ibv_create_srq(pd.as_ptr(), &mut srq_attr) }, ibv_destroy_srq, "SRQ")?;

        let max_sge = (dev_attr.max_sge.max(1) as u32).min(MAX_SGES as u32);
        let dct = create_dc(&ctx, &pd, &cq, Some(&srq), max_sge)?;
        let dci = create_dc(&ctx, &pd, &cq, None, max_sge)?;

        let unsupported = |what: &str| IoError::new(IoErrorKind::Unsupported, format!("{} has no {}", name, what));
        // SAFETY: FFI on a QP created with send ops flags.
        let qpx = NonNull::new(unsafe { ibv_qp_to_qp_ex(dci.as_ptr()) }).ok_or_else(|| unsupported("extended QP"))?;
        // SAFETY: FFI on an mlx5 extended QP.
        let mqpx = NonNull::new(unsafe { mlx5dv_qp_ex_from_ibv_qp_ex(qpx.as_ptr()) })
            .ok_or_else(|| unsupported("mlx5 extended QP"))?;
        // SAFETY: both views live as long as the DCI.
        let ops = unsafe { DcSendOps::of(qpx.as_ptr(), mqpx.as_ptr()) }?;

        let inner = DeviceInner {
            ahs: Mutex::new(HashMap::new()),
            post: Mutex::new(()),
            ops,
            qpx,
            mqpx,
            dci,
            dct,
            _srq: srq,
            cq,
            pd,
            _ctx: ctx,
            name,
            port_num,
            gid_index,
            lid: port_attr.lid,
            gid,
            mtu: port_attr.active_mtu,
            max_sge,
            max_rd_atomic: dev_attr.max_qp_rd_atom.clamp(1, 16) as u8,
        };
        inner.bring_up_dct()?;
        inner.bring_up_dci()?;
        Ok(Self { inner: Arc::new(inner) })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Where peers send requests for buffers registered here.
    pub fn endpoint(&self) -> QpEndpoint {
        self.inner.endpoint()
    }

    /// Take every completion still queued, discarding them.
    fn drain(&self) -> io::Result<usize> {
        let mut drained = 0;
        loop {
            let n = self.poll_raw(POLL_BATCH)?.len();
            if n == 0 {
                return Ok(drained);
            }
            drained += n;
        }
    }

    fn poll_raw(&self, max: usize) -> io::Result<Vec<ibv_wc>> {
        // SAFETY: POD type.
        let mut wc = vec![unsafe { mem::zeroed::<ibv_wc>() }; max];
        // SAFETY: `wc` has room for `max` entries.
        let n = unsafe { poll_cq(self.inner.cq.as_ptr(), max as c_int, wc.as_mut_ptr()) }?;
        wc.truncate(n);
        Ok(wc)
    }
}

impl OneSidedDevice for VerbsDevice {
    type Buffer = VerbsBuffer;

    fn alloc_buffer(&self, size: usize, kind: MemoryKind) -> Result<VerbsBuffer, TaskError> {
        if let MemoryKind::Device(id) = kind {
            return Err(TaskError::Device(IoError::new(
                IoErrorKind::Unsupported,
                format!("accelerator memory (device {}) cannot be registered here", id),
            )));
        }
        if size == 0 {
            return Err(TaskError::Device(IoError::new(
                IoErrorKind::InvalidInput,
                "cannot register an empty buffer",
            )));
        }

        let mut bytes = vec![0u8; size].into_boxed_slice();
        let access = IBV_ACCESS_LOCAL_WRITE | IBV_ACCESS_REMOTE_READ | IBV_ACCESS_REMOTE_WRITE;
        let mr = Owned::new(
            // SAFETY: the memory stays put while registered; it is owned by
            // the buffer and freed after the MR.
            unsafe { ibv_reg_mr(self.inner.pd.as_ptr(), bytes.as_mut_ptr().cast(), size, access as c_int) },
            ibv_dereg_mr,
            "MR",
        )
        .map_err(TaskError::Device)?;
        // SAFETY: the MR is live.
        let (addr, lkey, rkey) = unsafe {
            let raw = &*mr.as_ptr();
            (raw.addr as u64, raw.lkey, raw.rkey)
        };
        Ok(VerbsBuffer {
            _mr: mr,
            mem: Mutex::new(bytes),
            addr,
            lkey,
            rkey,
            dev: self.inner.clone(),
        })
    }

    fn descriptor(&self, buf: &VerbsBuffer) -> Result<RemoteBufferDescriptor, TaskError> {
        let remote = MrRemote::new(buf.addr, buf.len(), buf.rkey);
        Ok(RemoteBufferDescriptor::new(&remote, &self.endpoint())?)
    }

    fn submit(&self, task: &RdmaTask<'_, VerbsBuffer>) -> Result<(), TaskError> {
        let submit_err = |source| TaskError::Submit {
            wr_id: task.wr_id,
            source,
        };
        if !Arc::ptr_eq(&task.local.dev, &self.inner) {
            return Err(submit_err(IoError::new(
                IoErrorKind::InvalidInput,
                "buffer is registered on another device",
            )));
        }
        self.inner.post(task).map_err(submit_err)
    }

    fn poll_completions(&self, max: usize) -> Result<Vec<Completion>, TaskError> {
        let wc = self.poll_raw(max).map_err(TaskError::Device)?;
        Ok(wc
            .iter()
            .map(|wc| Completion {
                wr_id: wc.wr_id,
                status: WcStatus::from_code(wc.status),
            })
            .collect())
    }

    /// Take the initiator through RESET and back to RTS, then drop whatever
    /// completions the failure left behind.
    fn reset(&self) -> Result<(), TaskError> {
        // SAFETY: POD type.
        let mut attr: ibv_qp_attr = unsafe { mem::zeroed() };
        attr.qp_state = IBV_QPS_RESET;
        self.inner
            .modify(&self.inner.dci, &mut attr, IBV_QP_STATE, "DCI to RESET")
            .and_then(|_| self.inner.bring_up_dci())
            .and_then(|_| self.drain())
            .map(|drained| log::debug!("reset {}, dropped {} completions", self.inner.name, drained))
            .map_err(TaskError::Device)
    }
}
