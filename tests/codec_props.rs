//! Property tests for the control-plane codec.

use std::io::Cursor;

use proptest::prelude::*;
use rdmatask::ctrl::*;
use rdmatask::Gid;

fn any_descriptor() -> impl Strategy<Value = RemoteBufferDescriptor> {
    (
        any::<u64>(),
        any::<u32>(),
        any::<u32>(),
        any::<u16>(),
        0u32..=0xff_ffff,
        prop::option::of(1u128..),
    )
        .prop_map(|(addr, len, rkey, lid, qpn, gid)| RemoteBufferDescriptor {
            addr,
            len,
            rkey,
            lid,
            qpn,
            gid: gid.map(Gid::from_u128),
        })
}

proptest! {
    #[test]
    fn test_length_prefix_matches_payload(len in 0usize..=MAX_PAYLOAD_LEN, fill in any::<u8>()) {
        let payload = vec![fill; len];
        let mut buf = vec![0u8; encoded_len(len)];
        let n = encode_field(&mut buf, FieldType::TaskAttributes, &payload).unwrap();
        prop_assert_eq!(n, FIELD_HEADER_LEN + len);
        prop_assert_eq!(buf[0], FieldType::TaskAttributes as u8);
        prop_assert_eq!(u16::from_le_bytes([buf[1], buf[2]]) as usize, len);

        let (ty, decoded, consumed) = decode_field(&buf).unwrap();
        prop_assert_eq!(ty, FieldType::TaskAttributes);
        prop_assert_eq!(decoded.len(), len);
        prop_assert_eq!(consumed, n);
    }

    #[test]
    fn test_truncated_field_is_rejected(
        payload in prop::collection::vec(any::<u8>(), 1..512),
        cut in any::<prop::sample::Index>(),
    ) {
        let mut buf = vec![0u8; encoded_len(payload.len())];
        let n = encode_field(&mut buf, FieldType::RemoteBufferDescriptor, &payload).unwrap();
        let keep = cut.index(n);

        let decoded = decode_field(&buf[..keep]);
        let is_short = matches!(decoded, Err(ProtoError::ShortRead { .. }));
        prop_assert!(is_short);
        let streamed = read_field(&mut Cursor::new(&buf[..keep]), MAX_PAYLOAD_LEN);
        let is_short = matches!(streamed, Err(ProtoError::ShortRead { .. }));
        prop_assert!(is_short);
    }

    #[test]
    fn test_oversized_payload_is_rejected(extra in 1usize..1024) {
        let payload = vec![0u8; MAX_PAYLOAD_LEN + extra];
        let mut buf = vec![0u8; FIELD_HEADER_LEN + payload.len()];
        let encoded = encode_field(&mut buf, FieldType::TaskAttributes, &payload);
        let too_long = matches!(encoded, Err(ProtoError::PayloadTooLong(_)));
        prop_assert!(too_long);
    }

    #[test]
    fn test_descriptor_text(desc in any_descriptor()) {
        let text = desc.to_string();
        prop_assert_eq!(text.len(), DESC_STR_LEN);
        prop_assert!(text.bytes().all(|b| b == b':' || b.is_ascii_digit() || (b'a'..=b'f').contains(&b)));
        prop_assert_eq!(text.parse::<RemoteBufferDescriptor>().unwrap(), desc);
    }

    #[test]
    fn test_descriptor_masks_qpn(desc in any_descriptor(), high in 1u32..=0xff) {
        let wide = RemoteBufferDescriptor { qpn: desc.qpn | (high << 24), ..desc };
        let parsed = RemoteBufferDescriptor::from_wire(&wide.to_wire()).unwrap();
        prop_assert_eq!(parsed.qpn, desc.qpn);
    }

    #[test]
    fn test_package_over_stream(desc in any_descriptor(), bits in any::<u32>()) {
        let package = ControlPackage::new(desc, TaskFlags::from_bits(bits));
        let mut wire = Vec::new();
        package.write_to(&mut wire).unwrap();
        prop_assert_eq!(wire.len(), ControlPackage::encoded_len());

        let read = ControlPackage::read_from(&mut Cursor::new(&wire)).unwrap();
        prop_assert_eq!(read, package);
        let op = if bits & TaskFlags::READ != 0 { TaskOp::Read } else { TaskOp::Write };
        prop_assert_eq!(read.flags.op(), op);
    }
}
