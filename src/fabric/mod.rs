//! In-process RDMA provider.
//!
//! A [`Fabric`] is a registry of software NICs together with every memory
//! registration and queue pair created on them. The verbs types in
//! [`crate::rdma`] and the connection manager in [`crate::cm`] are built on
//! top of it, so that the whole stack (connection setup, completion
//! notification, two-sided and one-sided data movement) runs without RDMA
//! hardware while keeping the checks a real NIC applies: memory keys,
//! protection domains, access permissions, and queue states.
//!
//! Every `Fabric` is independent; cloning one yields another handle to the
//! same registry.

mod engine;
mod memory;

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io::{self, Error as IoError, ErrorKind as IoErrorKind};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

pub(crate) use self::engine::*;
pub(crate) use self::memory::*;
use crate::cm::CmIdInner;
use crate::rdma::gid::Gid;
use crate::rdma::qp::{QpCore, QpEndpoint};

/// Device capabilities advertised by every software NIC.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceAttr {
    /// Maximum number of entries in one completion queue.
    pub max_cqe: u32,

    /// Maximum number of outstanding work requests on any work queue.
    pub max_qp_wr: u32,

    /// Maximum number of scatter/gather elements per work request.
    pub max_sge: u32,

    /// Largest memory region that can be registered.
    pub max_mr_size: u64,
}

impl Default for DeviceAttr {
    fn default() -> Self {
        Self {
            max_cqe: 65535,
            max_qp_wr: 8192,
            max_sge: 512,
            max_mr_size: 1 << 40,
        }
    }
}

/// A software NIC attached to a fabric.
#[derive(Debug)]
pub struct Nic {
    index: usize,
    name: String,
    addr: IpAddr,
    lid: u16,
    gid: Gid,
    attr: DeviceAttr,
}

impl Nic {
    /// Device name, e.g. `soft0`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// IP address the device answers to.
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// Local identifier of the device port.
    pub fn lid(&self) -> u16 {
        self.lid
    }

    /// GID of the device port, derived from its IP address.
    pub fn gid(&self) -> Gid {
        self.gid
    }

    /// Device capabilities.
    pub fn attr(&self) -> &DeviceAttr {
        &self.attr
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }
}

/// Snapshot of the fabric-wide operation counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FabricStats {
    pub regs: u64,
    pub deregs: u64,
    pub sends: u64,
    pub reads: u64,
    pub writes: u64,
    pub failed: u64,
    pub bytes: u64,
}

#[derive(Default)]
struct Counters {
    regs: AtomicU64,
    deregs: AtomicU64,
    sends: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    failed: AtomicU64,
    bytes: AtomicU64,
}

/// First virtual address handed out to a registration.
const ADDR_BASE: u64 = 0x7f00_0000_0000;

/// Registration addresses are page aligned.
const ADDR_ALIGN: u64 = 4096;

/// First port handed out to identifiers bound to port 0.
const EPHEMERAL_PORT_BASE: u16 = 49152;

pub(crate) struct FabricInner {
    nics: RwLock<Vec<Arc<Nic>>>,
    regions: Mutex<HashMap<u32, Arc<MemCore>>>,
    qps: Mutex<HashMap<u32, Weak<QpCore>>>,
    ports: Mutex<HashMap<u16, Weak<CmIdInner>>>,

    next_key: AtomicU32,
    next_qpn: AtomicU32,
    next_addr: AtomicU64,
    next_obj: AtomicU32,
    next_port: AtomicU32,
    counters: Counters,
}

/// A set of software NICs that can reach each other.
#[derive(Clone)]
pub struct Fabric {
    inner: Arc<FabricInner>,
}

impl Fabric {
    /// Create an empty fabric with no NICs attached.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FabricInner {
                nics: RwLock::new(Vec::new()),
                regions: Mutex::new(HashMap::new()),
                qps: Mutex::new(HashMap::new()),
                ports: Mutex::new(HashMap::new()),
                next_key: AtomicU32::new(0x1000),
                next_qpn: AtomicU32::new(0x100),
                next_addr: AtomicU64::new(ADDR_BASE),
                next_obj: AtomicU32::new(1),
                next_port: AtomicU32::new(0),
                counters: Counters::default(),
            }),
        }
    }

    /// Attach a NIC with the given device name and IP address.
    ///
    /// Names and addresses must be unique within the fabric.
    pub fn add_nic(&self, name: &str, addr: IpAddr) -> io::Result<()> {
        let mut nics = self.inner.nics.write();
        if nics.iter().any(|nic| nic.name == name || nic.addr == addr) {
            return Err(IoError::new(
                IoErrorKind::AlreadyExists,
                format!("device {} ({}) already attached", name, addr),
            ));
        }

        let index = nics.len();
        nics.push(Arc::new(Nic {
            index,
            name: name.to_owned(),
            addr,
            lid: (index + 1) as u16,
            gid: Gid::from(addr),
            attr: DeviceAttr::default(),
        }));
        log::debug!("attached soft device {} at {}", name, addr);
        Ok(())
    }

    /// All attached NICs, in attachment order.
    pub fn nics(&self) -> Vec<Arc<Nic>> {
        self.inner.nics.read().clone()
    }

    /// Operation counters accumulated since the fabric was created.
    pub fn stats(&self) -> FabricStats {
        let c = &self.inner.counters;
        FabricStats {
            regs: c.regs.load(Ordering::Relaxed),
            deregs: c.deregs.load(Ordering::Relaxed),
            sends: c.sends.load(Ordering::Relaxed),
            reads: c.reads.load(Ordering::Relaxed),
            writes: c.writes.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            bytes: c.bytes.load(Ordering::Relaxed),
        }
    }

    /// Whether two handles refer to the same fabric.
    pub fn same_as(&self, other: &Fabric) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for Fabric {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry access for the verbs and connection-manager layers.
impl Fabric {
    pub(crate) fn nic_by_addr(&self, addr: IpAddr) -> Option<Arc<Nic>> {
        let nics = self.inner.nics.read();
        if addr.is_unspecified() {
            return nics.first().cloned();
        }
        nics.iter().find(|nic| nic.addr == addr).cloned()
    }

    pub(crate) fn nic_by_lid(&self, lid: u16) -> Option<Arc<Nic>> {
        self.inner.nics.read().iter().find(|nic| nic.lid == lid).cloned()
    }

    pub(crate) fn find_nic(&self, pred: impl Fn(&Nic) -> bool) -> Option<Arc<Nic>> {
        self.inner.nics.read().iter().find(|nic| pred(nic)).cloned()
    }

    pub(crate) fn next_object_id(&self) -> u32 {
        self.inner.next_obj.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn alloc_key(&self) -> u32 {
        self.inner.next_key.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn alloc_qpn(&self) -> u32 {
        self.inner.next_qpn.fetch_add(1, Ordering::Relaxed) & QpEndpoint::QPN_MASK
    }

    pub(crate) fn alloc_addr(&self, len: usize) -> u64 {
        let span = (len as u64).div_ceil(ADDR_ALIGN).max(1) * ADDR_ALIGN;
        self.inner.next_addr.fetch_add(span, Ordering::Relaxed)
    }

    pub(crate) fn register_mem(&self, mem: Arc<MemCore>) {
        self.inner.counters.regs.fetch_add(1, Ordering::Relaxed);
        self.inner.regions.lock().insert(mem.rkey, mem);
    }

    pub(crate) fn unregister_mem(&self, rkey: u32) -> Option<Arc<MemCore>> {
        let mem = self.inner.regions.lock().remove(&rkey);
        if mem.is_some() {
            self.inner.counters.deregs.fetch_add(1, Ordering::Relaxed);
        }
        mem
    }

    pub(crate) fn mem(&self, rkey: u32) -> Option<Arc<MemCore>> {
        self.inner.regions.lock().get(&rkey).cloned()
    }

    pub(crate) fn register_qp(&self, qpn: u32, qp: Weak<QpCore>) {
        self.inner.qps.lock().insert(qpn, qp);
    }

    pub(crate) fn unregister_qp(&self, qpn: u32) {
        self.inner.qps.lock().remove(&qpn);
    }

    pub(crate) fn qp(&self, qpn: u32) -> Option<Arc<QpCore>> {
        self.inner.qps.lock().get(&qpn).and_then(Weak::upgrade)
    }

    /// Reserve a port for a connection identifier.
    /// Port 0 picks the next free ephemeral port.
    pub(crate) fn bind_port(&self, port: u16, id: Weak<CmIdInner>) -> io::Result<u16> {
        let mut ports = self.inner.ports.lock();
        ports.retain(|_, id| id.strong_count() > 0);

        if port != 0 {
            if ports.contains_key(&port) {
                return Err(IoError::new(
                    IoErrorKind::AddrInUse,
                    format!("port {} already bound", port),
                ));
            }
            ports.insert(port, id);
            return Ok(port);
        }

        let span = (u16::MAX - EPHEMERAL_PORT_BASE) as u32 + 1;
        for _ in 0..span {
            let offset = self.inner.next_port.fetch_add(1, Ordering::Relaxed) % span;
            let candidate = EPHEMERAL_PORT_BASE + offset as u16;
            if let Entry::Vacant(e) = ports.entry(candidate) {
                e.insert(id);
                return Ok(candidate);
            }
        }
        Err(IoError::new(
            IoErrorKind::AddrNotAvailable,
            "no ephemeral port available",
        ))
    }

    pub(crate) fn release_port(&self, port: u16) {
        let mut ports = self.inner.ports.lock();
        if ports.get(&port).is_some_and(|id| id.strong_count() == 0) {
            ports.remove(&port);
        }
    }

    pub(crate) fn port_owner(&self, port: u16) -> Option<Arc<CmIdInner>> {
        self.inner.ports.lock().get(&port).and_then(Weak::upgrade)
    }

    pub(crate) fn count_op(&self, op: OpKind, bytes: usize) {
        let c = &self.inner.counters;
        match op {
            OpKind::Send => c.sends.fetch_add(1, Ordering::Relaxed),
            OpKind::Read => c.reads.fetch_add(1, Ordering::Relaxed),
            OpKind::Write => c.writes.fetch_add(1, Ordering::Relaxed),
        };
        c.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn count_failure(&self) {
        self.inner.counters.failed.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_add_nic_rejects_duplicates() {
        let fabric = Fabric::new();
        let addr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        fabric.add_nic("soft0", addr).unwrap();

        let err = fabric.add_nic("soft0", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(err.unwrap_err().kind(), IoErrorKind::AlreadyExists);
        let err = fabric.add_nic("soft1", addr);
        assert_eq!(err.unwrap_err().kind(), IoErrorKind::AlreadyExists);

        let nics = fabric.nics();
        assert_eq!(nics.len(), 1);
        assert_eq!(nics[0].lid(), 1);
        assert_eq!(nics[0].gid(), Gid::from(addr));
    }

    #[test]
    fn test_unspecified_addr_picks_first_nic() {
        let fabric = Fabric::new();
        fabric
            .add_nic("soft0", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)))
            .unwrap();
        fabric
            .add_nic("soft1", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)))
            .unwrap();

        let nic = fabric.nic_by_addr(IpAddr::V4(Ipv4Addr::UNSPECIFIED)).unwrap();
        assert_eq!(nic.name(), "soft0");
        let nic = fabric.nic_by_addr(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))).unwrap();
        assert_eq!(nic.name(), "soft1");
        assert!(fabric.nic_by_addr(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3))).is_none());
    }

    #[test]
    fn test_alloc_addr_is_page_aligned() {
        let fabric = Fabric::new();
        let a = fabric.alloc_addr(1);
        let b = fabric.alloc_addr(5000);
        let c = fabric.alloc_addr(10);
        assert_eq!(a % ADDR_ALIGN, 0);
        assert_eq!(b, a + ADDR_ALIGN);
        assert_eq!(c, b + 2 * ADDR_ALIGN);
    }
}
