//! Generated libibverbs and mlx5dv bindings, and the calls the headers only
//! provide as inline functions.

#![allow(non_snake_case)]
#![allow(non_camel_case_types)]
#![allow(non_upper_case_globals)]
#![allow(dead_code)]
#![allow(deref_nullptr)]
#![allow(clippy::missing_safety_doc)]
#![allow(clippy::too_many_arguments)]

use std::io;

include!(concat!(env!("OUT_DIR"), "/verbs_bindings.rs"));

/// `struct mlx5dv_dc_init_attr`.
///
/// Newer headers put the access key in an anonymous union with the DCI
/// stream settings. The key is at offset 8 in both layouts.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct mlx5dv_dc_init_attr {
    pub dc_type: mlx5dv_dc_type,
    pub dct_access_key: u64,
}

fn missing(op: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!("provider does not implement {}", op),
    )
}

/// `ibv_poll_cq`: poll at most `num_entries` completions into `wc`.
#[inline]
pub unsafe fn poll_cq(cq: *mut ibv_cq, num_entries: i32, wc: *mut ibv_wc) -> io::Result<usize> {
    let poll = (*(*cq).context).ops.poll_cq.ok_or_else(|| missing("poll_cq"))?;
    let n = poll(cq, num_entries, wc);
    usize::try_from(n).map_err(|_| io::Error::other(format!("ibv_poll_cq failed ({})", n)))
}

/// The extended send path of a DC initiator: `ibv_wr_*` on the QP and
/// `mlx5dv_wr_set_dc_addr` on its mlx5 view.
#[derive(Clone, Copy)]
pub struct DcSendOps {
    pub start: unsafe extern "C" fn(*mut ibv_qp_ex),
    pub rdma_read: unsafe extern "C" fn(*mut ibv_qp_ex, u32, u64),
    pub rdma_write: unsafe extern "C" fn(*mut ibv_qp_ex, u32, u64),
    pub set_sge_list: unsafe extern "C" fn(*mut ibv_qp_ex, usize, *const ibv_sge),
    pub complete: unsafe extern "C" fn(*mut ibv_qp_ex) -> ::std::os::raw::c_int,
    pub set_dc_addr: unsafe extern "C" fn(*mut mlx5dv_qp_ex, *mut ibv_ah, u32, u64),
}

impl DcSendOps {
    /// Look the calls up once; they do not change for the QP's lifetime.
    pub unsafe fn of(qpx: *mut ibv_qp_ex, mqpx: *mut mlx5dv_qp_ex) -> io::Result<Self> {
        Ok(Self {
            start: (*qpx).wr_start.ok_or_else(|| missing("wr_start"))?,
            rdma_read: (*qpx).wr_rdma_read.ok_or_else(|| missing("wr_rdma_read"))?,
            rdma_write: (*qpx).wr_rdma_write.ok_or_else(|| missing("wr_rdma_write"))?,
            set_sge_list: (*qpx).wr_set_sge_list.ok_or_else(|| missing("wr_set_sge_list"))?,
            complete: (*qpx).wr_complete.ok_or_else(|| missing("wr_complete"))?,
            set_dc_addr: (*mqpx).wr_set_dc_addr.ok_or_else(|| missing("wr_set_dc_addr"))?,
        })
    }
}
