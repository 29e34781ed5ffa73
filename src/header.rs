//! # Wire Header Codec
//!
//! Encoding and decoding of the fixed message header that precedes every
//! payload on the wire. All multi-byte numeric fields transit in network
//! byte order. The header is always manipulated in place inside the
//! transport buffer; nothing in this module allocates.
//!
//! ## Frame layout
//!
//! ```text
//! | transport prefix (9) | header (181/245) | trace | d1 | d2 | payload |
//! ```
//!
//! The transport prefix carries the total frame length twice: once in
//! native byte order (legacy senders) and once in network order, followed
//! by a single marker byte. When the marker is present a receiver must
//! prefer the network-order value.
//!
//! Header versions 1, 2 and 3 are recognised on receive; version 3 is
//! always emitted. The only layout difference is the source IP field,
//! which exists in version 3 only.

/// Protocol version stamped into outgoing headers.
pub const MSG_VER: u32 = 3;

/// Space reserved in the header for the user transaction id.
pub const MAX_XID: usize = 32;
/// Space reserved for the sender-assigned id.
pub const MAX_SID: usize = 32;
/// Space reserved for the managed element id.
pub const MAX_MEID: usize = 32;
/// Max length of the sender `host:port` strings (allows bracketed IPv6).
pub const MAX_SRC: usize = 64;

/// Header flag: message was sent with a blocking call and expects a reply.
pub const HFL_CALL_MSG: u8 = 0x04;

/// Bytes of data-1 area we emit; byte 0 carries the call id.
pub const DEF_D1_LEN: usize = 4;
/// Index of the call id within the d1 area.
pub const D1_CALLID_IDX: usize = 0;
/// Call id value meaning "not a call"; such messages queue normally.
pub const NO_CALL_ID: u8 = 0;

/// Length of the transport prefix: two 4-byte sizes plus the marker.
pub const TP_SZFIELD_LEN: usize = 9;
/// Marker byte indicating that the network-order size field is present.
pub const TP_SZ_MARKER: u8 = 0xff;

/// Sentinel subscription id meaning "unset".
pub const UNSET_SUBID: i32 = -1;
/// Sentinel message type used in freshly allocated buffers.
pub const UNSET_MSGTYPE: i32 = -1;

// field offsets from the start of the header (after the transport prefix)
const OFF_VER: usize = 0;
const OFF_MTYPE: usize = 4;
const OFF_PLEN: usize = 8;
const OFF_FLAGS: usize = 12;
const OFF_D1LEN: usize = 13;
const OFF_D2LEN: usize = 14;
const OFF_TRLEN: usize = 15;
const OFF_SUBID: usize = 17;
const OFF_XID: usize = 21;
const OFF_SID: usize = 53;
const OFF_SRC: usize = 85;
const OFF_SRCIP: usize = 149;

/// Base header length for version 3 (includes the source IP field).
pub const HDR_BASE_V3: usize = OFF_SRCIP + MAX_SRC + MAX_MEID;
/// Base header length for versions 1 and 2 (no source IP field).
pub const HDR_BASE_V1: usize = OFF_SRCIP + MAX_MEID;

/// Per-version field placement. Only the tail of the header moves.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Layout {
    pub base: usize,
    pub srcip: Option<usize>,
    pub meid: usize,
}

pub(crate) fn layout(version: u32) -> Layout {
    match version {
        1 | 2 => Layout {
            base: HDR_BASE_V1,
            srcip: None,
            meid: OFF_SRCIP,
        },
        _ => Layout {
            base: HDR_BASE_V3,
            srcip: Some(OFF_SRCIP),
            meid: OFF_SRCIP + MAX_SRC,
        },
    }
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_be_bytes());
}

/// Decode the header version, repairing the version-1 endianness quirk.
///
/// Version 1 senders stored the version field in host order. If the raw
/// bytes read as a native-order 1 but not a network-order 1, the buffer is
/// from such a sender; the field is rewritten in network order so that any
/// clone of this buffer carries a clean header.
pub fn decode_version(buf: &mut [u8]) -> u32 {
    if buf.len() < 4 {
        return 0;
    }
    let native = u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let net = get_u32(buf, OFF_VER);
    if native == 1 && net != 1 {
        put_u32(buf, OFF_VER, 1);
        return 1;
    }
    net
}

/// Total header length: base for the version plus trace, d1 and d2 areas.
pub fn header_len(buf: &[u8]) -> usize {
    let ver = get_u32(buf, OFF_VER);
    layout(ver).base + trace_len(buf) + d1_len(buf) + d2_len(buf)
}

/// Initialise a fresh header: version, identity, unset routing fields.
///
/// Flags are cleared, `sub_id` is set to the unset sentinel and the trace
/// and d1 lengths are recorded so that payload offsets are stable from the
/// moment of allocation.
pub fn fill_defaults(buf: &mut [u8], src: &str, srcip: &str, tr_len: usize, d1: usize) {
    for b in buf[..HDR_BASE_V3].iter_mut() {
        *b = 0;
    }
    put_u32(buf, OFF_VER, MSG_VER);
    put_u32(buf, OFF_MTYPE, UNSET_MSGTYPE as u32);
    put_u32(buf, OFF_SUBID, UNSET_SUBID as u32);
    buf[OFF_D1LEN] = d1 as u8;
    buf[OFF_TRLEN..OFF_TRLEN + 2].copy_from_slice(&(tr_len as u16).to_be_bytes());
    copy_str(buf, OFF_SRC, MAX_SRC, src.as_bytes());
    copy_str(buf, OFF_SRCIP, MAX_SRC, srcip.as_bytes());
}

/// Bounded copy of a NUL terminated string field; always terminates.
fn copy_str(buf: &mut [u8], off: usize, max: usize, src: &[u8]) {
    let n = src.len().min(max - 1);
    buf[off..off + n].copy_from_slice(&src[..n]);
    for b in buf[off + n..off + max].iter_mut() {
        *b = 0;
    }
}

/// Read a NUL terminated string field as a lossy owned string.
fn read_str(buf: &[u8], off: usize, max: usize) -> String {
    let field = &buf[off..off + max];
    let end = field.iter().position(|b| *b == 0).unwrap_or(max);
    String::from_utf8_lossy(&field[..end]).into_owned()
}

pub fn get_mtype(buf: &[u8]) -> i32 {
    get_u32(buf, OFF_MTYPE) as i32
}

pub fn set_mtype(buf: &mut [u8], v: i32) {
    put_u32(buf, OFF_MTYPE, v as u32);
}

pub fn get_sub_id(buf: &[u8]) -> i32 {
    get_u32(buf, OFF_SUBID) as i32
}

pub fn set_sub_id(buf: &mut [u8], v: i32) {
    put_u32(buf, OFF_SUBID, v as u32);
}

pub fn get_plen(buf: &[u8]) -> usize {
    get_u32(buf, OFF_PLEN) as usize
}

pub fn set_plen(buf: &mut [u8], v: usize) {
    put_u32(buf, OFF_PLEN, v as u32);
}

pub fn get_flags(buf: &[u8]) -> u8 {
    buf[OFF_FLAGS]
}

pub fn set_flags(buf: &mut [u8], v: u8) {
    buf[OFF_FLAGS] = v;
}

pub fn trace_len(buf: &[u8]) -> usize {
    u16::from_be_bytes([buf[OFF_TRLEN], buf[OFF_TRLEN + 1]]) as usize
}

pub(crate) fn set_trace_len(buf: &mut [u8], v: usize) {
    buf[OFF_TRLEN..OFF_TRLEN + 2].copy_from_slice(&(v as u16).to_be_bytes());
}

pub fn d1_len(buf: &[u8]) -> usize {
    buf[OFF_D1LEN] as usize
}

pub fn d2_len(buf: &[u8]) -> usize {
    buf[OFF_D2LEN] as usize
}

/// The call id lives in the first byte of the d1 area. `NO_CALL_ID` (and a
/// zero length d1 area) means the message is not a call response.
pub fn get_call_id(buf: &[u8]) -> u8 {
    let ver = get_u32(buf, OFF_VER);
    let d1 = d1_len(buf);
    if d1 == 0 {
        return NO_CALL_ID;
    }
    let off = layout(ver).base + trace_len(buf) + D1_CALLID_IDX;
    buf[off]
}

pub fn set_call_id(buf: &mut [u8], id: u8) {
    let ver = get_u32(buf, OFF_VER);
    if d1_len(buf) == 0 {
        return;
    }
    let off = layout(ver).base + trace_len(buf) + D1_CALLID_IDX;
    buf[off] = id;
}

pub fn xid(buf: &[u8]) -> &[u8] {
    &buf[OFF_XID..OFF_XID + MAX_XID]
}

pub fn xid_mut(buf: &mut [u8]) -> &mut [u8] {
    &mut buf[OFF_XID..OFF_XID + MAX_XID]
}

pub fn sid(buf: &[u8]) -> &[u8] {
    &buf[OFF_SID..OFF_SID + MAX_SID]
}

pub fn get_src(buf: &[u8]) -> String {
    read_str(buf, OFF_SRC, MAX_SRC)
}

pub fn set_src(buf: &mut [u8], src: &str) {
    copy_str(buf, OFF_SRC, MAX_SRC, src.as_bytes());
}

/// Source IP is carried from version 3 on; older headers yield `None`.
pub fn get_srcip(buf: &[u8]) -> Option<String> {
    let ver = get_u32(buf, OFF_VER);
    layout(ver).srcip.map(|off| read_str(buf, off, MAX_SRC))
}

pub fn set_srcip(buf: &mut [u8], srcip: &str) {
    let ver = get_u32(buf, OFF_VER);
    if let Some(off) = layout(ver).srcip {
        copy_str(buf, off, MAX_SRC, srcip.as_bytes());
    }
}

pub fn meid(buf: &[u8]) -> &[u8] {
    let ver = get_u32(buf, OFF_VER);
    let l = layout(ver);
    &buf[l.meid..l.meid + MAX_MEID]
}

pub fn meid_mut(buf: &mut [u8]) -> &mut [u8] {
    let ver = get_u32(buf, OFF_VER);
    let l = layout(ver);
    &mut buf[l.meid..l.meid + MAX_MEID]
}

/// Offset of the trace area within the header.
pub(crate) fn trace_off(buf: &[u8]) -> usize {
    let ver = get_u32(buf, OFF_VER);
    layout(ver).base
}

/// Stamp the transport prefix: native-order size, network-order size, marker.
pub fn write_tp_prefix(frame: &mut [u8], total: usize) {
    let v = total as u32;
    frame[0..4].copy_from_slice(&v.to_ne_bytes());
    frame[4..8].copy_from_slice(&v.to_be_bytes());
    frame[8] = TP_SZ_MARKER;
}

/// Extract the frame size from a transport prefix.
///
/// When the marker byte is present the network-order copy is authoritative;
/// otherwise the sender predates the marker and the native-order value is
/// used as stored.
pub fn extract_mlen(prefix: &[u8]) -> usize {
    if prefix[8] == TP_SZ_MARKER {
        u32::from_be_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]) as usize
    } else {
        u32::from_ne_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh(tr: usize, d1: usize) -> Vec<u8> {
        let mut b = vec![0u8; HDR_BASE_V3 + tr + d1 + 64];
        fill_defaults(&mut b, "host-a:4560", "10.0.0.9:4560", tr, d1);
        b
    }

    #[test]
    fn defaults_round_trip() {
        let b = fresh(0, DEF_D1_LEN);
        assert_eq!(decode_version(&mut b.clone()), MSG_VER);
        assert_eq!(get_mtype(&b), UNSET_MSGTYPE);
        assert_eq!(get_sub_id(&b), UNSET_SUBID);
        assert_eq!(get_flags(&b), 0);
        assert_eq!(get_src(&b), "host-a:4560");
        assert_eq!(get_srcip(&b).unwrap(), "10.0.0.9:4560");
        assert_eq!(header_len(&b), HDR_BASE_V3 + DEF_D1_LEN);
    }

    #[test]
    fn field_round_trip() {
        let mut b = fresh(16, DEF_D1_LEN);
        set_mtype(&mut b, 1007);
        set_sub_id(&mut b, -1);
        set_plen(&mut b, 2048);
        set_flags(&mut b, HFL_CALL_MSG);
        set_call_id(&mut b, 42);
        xid_mut(&mut b).copy_from_slice(&[7u8; MAX_XID]);
        meid_mut(&mut b)[..4].copy_from_slice(b"gnb1");
        set_src(&mut b, "sender:1234");
        set_srcip(&mut b, "192.168.7.7:1234");

        assert_eq!(get_mtype(&b), 1007);
        assert_eq!(get_sub_id(&b), -1);
        assert_eq!(get_plen(&b), 2048);
        assert_eq!(get_flags(&b), HFL_CALL_MSG);
        assert_eq!(get_call_id(&b), 42);
        assert_eq!(xid(&b), &[7u8; MAX_XID][..]);
        assert_eq!(&meid(&b)[..4], b"gnb1");
        assert_eq!(get_src(&b), "sender:1234");
        assert_eq!(get_srcip(&b).unwrap(), "192.168.7.7:1234");
        assert_eq!(header_len(&b), HDR_BASE_V3 + 16 + DEF_D1_LEN);
    }

    #[test]
    fn v1_host_order_version_is_repaired() {
        let mut b = vec![0u8; HDR_BASE_V1];
        b[0..4].copy_from_slice(&1u32.to_ne_bytes());
        let ver = decode_version(&mut b);
        assert_eq!(ver, 1);
        // the field must now be clean network order for downstream cloning
        assert_eq!(u32::from_be_bytes([b[0], b[1], b[2], b[3]]), 1);
        assert_eq!(header_len(&b), HDR_BASE_V1);
        assert!(get_srcip(&b).is_none());
    }

    #[test]
    fn prefix_marker_selects_network_order() {
        let mut p = [0u8; TP_SZFIELD_LEN];
        write_tp_prefix(&mut p, 600);
        assert_eq!(extract_mlen(&p), 600);

        // legacy sender: native order only, no marker
        let mut legacy = [0u8; TP_SZFIELD_LEN];
        legacy[0..4].copy_from_slice(&321u32.to_ne_bytes());
        assert_eq!(extract_mlen(&legacy), 321);
    }

    #[test]
    fn long_identity_is_truncated_with_terminator() {
        let mut b = fresh(0, DEF_D1_LEN);
        let long = "x".repeat(MAX_SRC + 20);
        set_src(&mut b, &long);
        let got = get_src(&b);
        assert_eq!(got.len(), MAX_SRC - 1);
    }
}
