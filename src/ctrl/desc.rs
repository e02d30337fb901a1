use std::fmt;
use std::str::FromStr;

use super::ProtoError;
use crate::rdma::gid::Gid;
use crate::rdma::mr::MrRemote;
use crate::rdma::qp::QpEndpoint;

/// Length of the descriptor text.
pub const DESC_STR_LEN: usize = 81;

/// Length of the descriptor payload on the wire: the text and a NUL.
pub const DESC_WIRE_LEN: usize = DESC_STR_LEN + 1;

/// Everything a peer needs to target a registered buffer with one-sided
/// operations: the region and the QP the operations must address.
///
/// Its text form is `addr:len:rkey:lid:qpn:gid_valid:gid` in fixed-width
/// lowercase hex, e.g.
/// `0102030405060708:01020304:01020304:0102:010203:1:0102030405060708090a0b0c0d0e0f10`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteBufferDescriptor {
    pub addr: u64,
    pub len: u32,
    pub rkey: u32,
    pub lid: u16,

    /// QP number; only the low 24 bits are meaningful.
    pub qpn: u32,
    pub gid: Option<Gid>,
}

impl RemoteBufferDescriptor {
    /// Describe `remote` as reachable through `ep`.
    ///
    /// Fails if the region length does not fit 32 bits or the QP number does
    /// not fit 24 bits.
    pub fn new(remote: &MrRemote, ep: &QpEndpoint) -> Result<Self, ProtoError> {
        let len = u32::try_from(remote.len).map_err(|_| {
            ProtoError::MalformedDescriptor(format!("region length {} too large", remote.len))
        })?;
        if !ep.qpn_fits() {
            return Err(ProtoError::MalformedDescriptor(format!(
                "QP number {:#x} exceeds 24 bits",
                ep.qpn
            )));
        }
        Ok(Self {
            addr: remote.addr,
            len,
            rkey: remote.rkey,
            lid: ep.lid,
            qpn: ep.qpn,
            gid: (!ep.gid.is_zero()).then_some(ep.gid),
        })
    }

    /// The described region.
    pub fn remote(&self) -> MrRemote {
        MrRemote::new(self.addr, self.len as usize, self.rkey)
    }

    /// The QP one-sided operations must address.
    pub fn endpoint(&self) -> QpEndpoint {
        QpEndpoint {
            gid: self.gid.unwrap_or_default(),
            lid: self.lid,
            qpn: self.qpn,
        }
    }

    /// The wire payload: text plus NUL.
    pub fn to_wire(&self) -> [u8; DESC_WIRE_LEN] {
        let mut wire = [0u8; DESC_WIRE_LEN];
        wire[..DESC_STR_LEN].copy_from_slice(self.to_string().as_bytes());
        wire
    }

    /// Parse a wire payload. Text after the first NUL is ignored.
    pub fn from_wire(payload: &[u8]) -> Result<Self, ProtoError> {
        let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
        let text = std::str::from_utf8(&payload[..end])
            .map_err(|_| ProtoError::MalformedDescriptor("not ASCII".to_owned()))?;
        text.parse()
    }
}

impl fmt::Display for RemoteBufferDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:016x}:{:08x}:{:08x}:{:04x}:{:06x}:{}:{:032x}",
            self.addr,
            self.len,
            self.rkey,
            self.lid,
            self.qpn & QpEndpoint::QPN_MASK,
            self.gid.is_some() as u8,
            self.gid.unwrap_or_default().to_u128()
        )
    }
}

/// Parse one fixed-width hex column.
fn column(text: &str, width: usize, name: &str) -> Result<u128, ProtoError> {
    if text.len() != width || !text.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ProtoError::MalformedDescriptor(format!(
            "{} must be {} hex digits, got {:?}",
            name, width, text
        )));
    }
    u128::from_str_radix(text, 16)
        .map_err(|e| ProtoError::MalformedDescriptor(format!("{}: {}", name, e)))
}

impl FromStr for RemoteBufferDescriptor {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cols = s.split(':').collect::<Vec<_>>();
        let [addr, len, rkey, lid, qpn, gid_valid, gid] = cols[..] else {
            return Err(ProtoError::MalformedDescriptor(format!(
                "expected 7 columns, got {}",
                cols.len()
            )));
        };

        let gid_valid = match gid_valid {
            "0" => false,
            "1" => true,
            other => {
                return Err(ProtoError::MalformedDescriptor(format!(
                    "gid_valid must be 0 or 1, got {:?}",
                    other
                )))
            }
        };
        let gid = Gid::from_u128(column(gid, 32, "gid")?);

        // Column widths bound every value to its field type.
        Ok(Self {
            addr: column(addr, 16, "addr")? as u64,
            len: column(len, 8, "len")? as u32,
            rkey: column(rkey, 8, "rkey")? as u32,
            lid: column(lid, 4, "lid")? as u16,
            qpn: column(qpn, 6, "qpn")? as u32,
            gid: gid_valid.then_some(gid),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str =
        "0102030405060708:01020304:01020304:0102:010203:1:0102030405060708090a0b0c0d0e0f10";

    #[test]
    fn test_sample_text() {
        assert_eq!(SAMPLE.len(), DESC_STR_LEN);
        let desc = SAMPLE.parse::<RemoteBufferDescriptor>().unwrap();
        assert_eq!(desc.addr, 0x0102030405060708);
        assert_eq!(desc.len, 0x01020304);
        assert_eq!(desc.lid, 0x0102);
        assert_eq!(desc.qpn, 0x010203);
        assert_eq!(
            desc.gid.unwrap().to_u128(),
            0x0102030405060708090a0b0c0d0e0f10
        );
        assert_eq!(desc.to_string(), SAMPLE);
    }

    #[test]
    fn test_wire_form() {
        let desc = SAMPLE.parse::<RemoteBufferDescriptor>().unwrap();
        let wire = desc.to_wire();
        assert_eq!(wire[DESC_STR_LEN], 0);
        assert_eq!(RemoteBufferDescriptor::from_wire(&wire).unwrap(), desc);
    }

    #[test]
    fn test_gid_invalid() {
        let remote = MrRemote::new(0x1000, 64, 7);
        let ep = QpEndpoint {
            gid: Gid::default(),
            lid: 3,
            qpn: 0x11,
        };
        let desc = RemoteBufferDescriptor::new(&remote, &ep).unwrap();
        assert!(desc.gid.is_none());
        assert!(desc.to_string().contains(":0:"));
        assert_eq!(desc.remote(), remote);
        assert_eq!(desc.endpoint(), ep);
    }

    #[test]
    fn test_malformed() {
        for bad in [
            "",
            "0102030405060708:01020304:01020304:0102:010203:1",
            "0102030405060708:01020304:01020304:0102:010203:2:0102030405060708090a0b0c0d0e0f10",
            "010203040506070:01020304:01020304:0102:010203:1:0102030405060708090a0b0c0d0e0f10",
            "0102030405060708:0102030g:01020304:0102:010203:1:0102030405060708090a0b0c0d0e0f10",
        ] {
            assert!(
                matches!(
                    bad.parse::<RemoteBufferDescriptor>(),
                    Err(ProtoError::MalformedDescriptor(_))
                ),
                "{:?} parsed",
                bad
            );
        }

        let ep = QpEndpoint {
            qpn: 0x100_0000,
            ..QpEndpoint::default()
        };
        assert!(RemoteBufferDescriptor::new(&MrRemote::dummy(), &ep).is_err());
    }
}
