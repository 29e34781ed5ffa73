//! # Message Buffer
//!
//! The handle through which applications touch a message: routing fields,
//! typed accessors over the header, and the payload itself. A buffer owns
//! its transport backing store (`tp_buf`), a single allocation holding the
//! transport prefix, the wire header, the trace/d1/d2 areas and the
//! payload. Accessors borrow into that allocation; nothing is copied until
//! the caller asks for it.
//!
//! Buffers received from the wire carry the connection they arrived on
//! (`rts_fd`) so a reply can be returned to the sender without a route
//! table lookup.

use crate::error::{ErrorKind, MsgState};
use crate::header::{
    self, DEF_D1_LEN, HDR_BASE_V1, HDR_BASE_V3, MAX_XID, TP_SZFIELD_LEN, UNSET_MSGTYPE,
    UNSET_SUBID,
};
use crossbeam::queue::ArrayQueue;
use tracing::debug;

bitflags::bitflags! {
    /// Private per-buffer flags.
    pub(crate) struct MbufFlags: u32 {
        /// Buffer was allocated by this library and is directly sendable.
        const ZEROCOPY = 0x01;
        /// Send must not allocate a replacement buffer on success.
        const NOALLOC  = 0x02;
        /// Buffer was received; our identity must overlay src on send.
        const ADDSRC   = 0x04;
        /// Oversized buffer; never returned to the free pool.
        const HUGE     = 0x10;
    }
}

/// A message buffer.
///
/// `mtype` and `sub_id` select the route on send; `len` is the number of
/// payload bytes in use. The remaining capacity of the payload area is
/// available through [`MsgBuf::payload_size`].
#[derive(Debug)]
pub struct MsgBuf {
    pub mtype: i32,
    pub sub_id: i32,
    len: usize,
    /// Receive-path state; `Trunc` marks a capped payload length.
    pub state: MsgState,
    /// Raw OS error recorded by the last transport operation, 0 if none.
    pub tp_state: i32,
    pub(crate) flags: MbufFlags,
    pub(crate) rts_fd: Option<u64>,
    tp_buf: Vec<u8>,
}

impl MsgBuf {
    /// Allocate a sendable buffer with the given payload capacity.
    ///
    /// `recycled` may supply a transport buffer from the free pool; it is
    /// resized as needed. The header is stamped with the context identity
    /// and the unset routing sentinels.
    pub(crate) fn alloc(
        recycled: Option<Vec<u8>>,
        payload: usize,
        tr_len: usize,
        src: &str,
        srcip: &str,
    ) -> MsgBuf {
        let total = TP_SZFIELD_LEN + HDR_BASE_V3 + tr_len + DEF_D1_LEN + payload;
        let mut buf = recycled.unwrap_or_default();
        buf.resize(total, 0);

        let hdr = &mut buf[TP_SZFIELD_LEN..];
        header::fill_defaults(hdr, src, srcip, tr_len, DEF_D1_LEN);
        // trace and d1 areas must start clean; a pooled buffer may hold
        // a previous message's call id
        for b in hdr[HDR_BASE_V3..HDR_BASE_V3 + tr_len + DEF_D1_LEN].iter_mut() {
            *b = 0;
        }

        MsgBuf {
            mtype: UNSET_MSGTYPE,
            sub_id: UNSET_SUBID,
            len: 0,
            state: MsgState::Ok,
            tp_state: 0,
            flags: MbufFlags::ZEROCOPY,
            rts_fd: None,
            tp_buf: buf,
        }
    }

    /// Wrap a complete raw frame handed up by the reassembler.
    ///
    /// Decodes the header (fixing the v1 endianness quirk in place),
    /// captures the routing fields and applies the truncation check: a
    /// declared payload length larger than the received buffer caps `len`
    /// and marks the buffer `Trunc`.
    pub(crate) fn from_raw(mut raw: Vec<u8>, fd: u64, huge: bool) -> Option<MsgBuf> {
        if raw.len() < TP_SZFIELD_LEN + HDR_BASE_V1 {
            debug!("inbound frame too small to hold a header: {} bytes", raw.len());
            return None;
        }

        let hdr = &mut raw[TP_SZFIELD_LEN..];
        let ver = header::decode_version(hdr);
        if !(1..=3).contains(&ver) {
            debug!("inbound frame with unknown header version {}", ver);
            return None;
        }

        let hdr_len = header::header_len(hdr);
        if raw.len() < TP_SZFIELD_LEN + hdr_len {
            return None;
        }

        let hdr = &raw[TP_SZFIELD_LEN..];
        let plen = header::get_plen(hdr);
        let mtype = header::get_mtype(hdr);
        let sub_id = if ver >= 2 { header::get_sub_id(hdr) } else { UNSET_SUBID };

        let avail = raw.len() - TP_SZFIELD_LEN - hdr_len;
        let (len, state) = if plen > avail {
            (avail, MsgState::Trunc)
        } else {
            (plen, MsgState::Ok)
        };

        let mut flags = MbufFlags::ZEROCOPY | MbufFlags::ADDSRC;
        if huge {
            flags |= MbufFlags::HUGE;
        }

        Some(MsgBuf {
            mtype,
            sub_id,
            len,
            state,
            tp_state: 0,
            flags,
            rts_fd: Some(fd),
            tp_buf: raw,
        })
    }

    // ---- geometry -----------------------------------------------------

    pub(crate) fn hdr(&self) -> &[u8] {
        &self.tp_buf[TP_SZFIELD_LEN..]
    }

    pub(crate) fn hdr_mut(&mut self) -> &mut [u8] {
        &mut self.tp_buf[TP_SZFIELD_LEN..]
    }

    pub(crate) fn header_len(&self) -> usize {
        header::header_len(self.hdr())
    }

    fn payload_off(&self) -> usize {
        TP_SZFIELD_LEN + self.header_len()
    }

    /// Total size of the transport allocation.
    pub fn alloc_len(&self) -> usize {
        self.tp_buf.len()
    }

    /// Maximum payload bytes this buffer can carry.
    pub fn payload_size(&self) -> usize {
        self.tp_buf.len() - self.payload_off()
    }

    /// Payload bytes in use.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set the in-use payload length; clamped to capacity.
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.payload_size());
    }

    // ---- payload ------------------------------------------------------

    /// The whole payload area; the first [`len`](MsgBuf::len) bytes hold data.
    pub fn payload(&self) -> &[u8] {
        &self.tp_buf[self.payload_off()..]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let off = self.payload_off();
        &mut self.tp_buf[off..]
    }

    /// Copy bytes into the payload, setting `len`.
    ///
    /// When the source exceeds the payload capacity exactly the capacity is
    /// copied and `Overflow` is reported.
    pub fn bytes2payload(&mut self, src: &[u8]) -> Result<usize, ErrorKind> {
        let cap = self.payload_size();
        let over = src.len() > cap;
        let n = src.len().min(cap);
        let off = self.payload_off();
        self.tp_buf[off..off + n].copy_from_slice(&src[..n]);
        self.len = n;
        if over {
            Err(ErrorKind::Overflow)
        } else {
            Ok(n)
        }
    }

    /// Copy a string and its terminator into the payload.
    pub fn str2payload(&mut self, s: &str) -> Result<usize, ErrorKind> {
        let mut v = Vec::with_capacity(s.len() + 1);
        v.extend_from_slice(s.as_bytes());
        v.push(0);
        self.bytes2payload(&v)
    }

    // ---- transaction id -----------------------------------------------

    /// The fixed 32-byte transaction id area.
    pub fn xaction(&self) -> &[u8] {
        header::xid(self.hdr())
    }

    /// Copy the transaction id into an owned array.
    pub fn get_xact(&self) -> [u8; MAX_XID] {
        let mut out = [0u8; MAX_XID];
        out.copy_from_slice(self.xaction());
        out
    }

    /// Set transaction id bytes; a long source is truncated at field size
    /// and `Overflow` reported after the copy.
    pub fn bytes2xact(&mut self, src: &[u8]) -> Result<usize, ErrorKind> {
        copy_field(header::xid_mut(self.hdr_mut()), src)
    }

    /// Set the transaction id from a string, terminator included.
    ///
    /// Fails with `Overflow` (copying nothing) if the string plus its
    /// terminator does not fit.
    pub fn str2xact(&mut self, s: &str) -> Result<(), ErrorKind> {
        copy_field_str(header::xid_mut(self.hdr_mut()), s)
    }

    // ---- managed element id -------------------------------------------

    /// The managed element id as a string, trailing NULs trimmed.
    pub fn get_meid(&self) -> String {
        field_to_string(header::meid(self.hdr()))
    }

    pub fn bytes2meid(&mut self, src: &[u8]) -> Result<usize, ErrorKind> {
        copy_field(header::meid_mut(self.hdr_mut()), src)
    }

    pub fn str2meid(&mut self, s: &str) -> Result<(), ErrorKind> {
        copy_field_str(header::meid_mut(self.hdr_mut()), s)
    }

    // ---- identity -----------------------------------------------------

    /// Sender identity (`host:port`) as carried in the header.
    pub fn get_src(&self) -> String {
        header::get_src(self.hdr())
    }

    /// Sender IP identity; absent on pre-v3 headers.
    pub fn get_srcip(&self) -> Option<String> {
        header::get_srcip(self.hdr())
    }

    // ---- trace area ---------------------------------------------------

    pub fn trace_len(&self) -> usize {
        header::trace_len(self.hdr())
    }

    /// Borrow the trace bytes.
    pub fn get_trace(&self) -> &[u8] {
        let off = TP_SZFIELD_LEN + header::trace_off(self.hdr());
        let n = self.trace_len();
        &self.tp_buf[off..off + n]
    }

    /// Install trace data, resizing the trace area when the size differs.
    ///
    /// A resize rebuilds the transport buffer: header and d1/d2 areas are
    /// carried over and the in-use payload bytes are preserved. Returns
    /// the number of trace bytes copied.
    pub fn set_trace(&mut self, data: &[u8]) -> usize {
        if data.len() != self.trace_len() {
            self.resize_trace(data.len());
        }
        let off = TP_SZFIELD_LEN + header::trace_off(self.hdr());
        self.tp_buf[off..off + data.len()].copy_from_slice(data);
        data.len()
    }

    fn resize_trace(&mut self, new_tr: usize) {
        let old_tr = self.trace_len();
        let base = header::trace_off(self.hdr());
        let d12 = self.header_len() - base - old_tr;
        let pay_cap = self.payload_size();
        let old_pay_off = self.payload_off();

        let total = TP_SZFIELD_LEN + base + new_tr + d12 + pay_cap;
        let mut nb = vec![0u8; total];

        // fixed header
        nb[TP_SZFIELD_LEN..TP_SZFIELD_LEN + base]
            .copy_from_slice(&self.tp_buf[TP_SZFIELD_LEN..TP_SZFIELD_LEN + base]);
        header::set_trace_len(&mut nb[TP_SZFIELD_LEN..], new_tr);
        // d1/d2 move to follow the new trace area
        let old_d12_off = TP_SZFIELD_LEN + base + old_tr;
        let new_d12_off = TP_SZFIELD_LEN + base + new_tr;
        nb[new_d12_off..new_d12_off + d12]
            .copy_from_slice(&self.tp_buf[old_d12_off..old_d12_off + d12]);
        // in-use payload survives the move
        let new_pay_off = new_d12_off + d12;
        nb[new_pay_off..new_pay_off + self.len]
            .copy_from_slice(&self.tp_buf[old_pay_off..old_pay_off + self.len]);

        self.tp_buf = nb;
    }

    // ---- call id ------------------------------------------------------

    pub(crate) fn call_id(&self) -> u8 {
        header::get_call_id(self.hdr())
    }

    pub(crate) fn set_call_id(&mut self, id: u8) {
        header::set_call_id(self.hdr_mut(), id);
    }

    pub(crate) fn hdr_flags(&self) -> u8 {
        header::get_flags(self.hdr())
    }

    pub(crate) fn set_hdr_flags(&mut self, flags: u8) {
        header::set_flags(self.hdr_mut(), flags);
    }

    // ---- reallocation -------------------------------------------------

    /// Grow the payload area to at least `payload_len` bytes in place.
    ///
    /// A request no larger than the current capacity leaves the buffer
    /// unchanged. When the buffer is rebuilt, `copy` selects whether the
    /// old payload (and the `mtype`/`sub_id`/`len` fields describing it)
    /// survive; without `copy` the routing fields reset to the unset
    /// sentinels so stale values cannot be sent by accident. The header,
    /// and with it the return-to-sender identity, always survives.
    pub fn realloc_payload(&mut self, payload_len: usize, copy: bool) {
        let old_cap = self.payload_size();
        if payload_len <= old_cap {
            return;
        }

        let hdr_len = self.header_len();
        let keep = TP_SZFIELD_LEN + hdr_len + if copy { old_cap } else { 0 };
        let mut nb = vec![0u8; TP_SZFIELD_LEN + hdr_len + payload_len];
        nb[..keep].copy_from_slice(&self.tp_buf[..keep]);

        if !copy {
            self.mtype = UNSET_MSGTYPE;
            self.sub_id = UNSET_SUBID;
            self.len = 0;
        }
        self.tp_buf = nb;
    }

    /// Clone this buffer with a payload area of at least `payload_len`.
    ///
    /// The original is left untouched. `copy` carries the payload and its
    /// describing fields into the clone as for [`realloc_payload`].
    ///
    /// [`realloc_payload`]: MsgBuf::realloc_payload
    pub fn clone_payload(&self, payload_len: usize, copy: bool) -> MsgBuf {
        let old_cap = self.payload_size();
        let hdr_len = self.header_len();
        let new_cap = payload_len.max(old_cap);

        let keep = TP_SZFIELD_LEN + hdr_len + if copy { old_cap } else { 0 };
        let mut nb = vec![0u8; TP_SZFIELD_LEN + hdr_len + new_cap];
        nb[..keep].copy_from_slice(&self.tp_buf[..keep]);

        let (mtype, sub_id, len) = if copy {
            (self.mtype, self.sub_id, self.len)
        } else {
            (UNSET_MSGTYPE, UNSET_SUBID, 0)
        };

        MsgBuf {
            mtype,
            sub_id,
            len,
            state: self.state,
            tp_state: 0,
            flags: MbufFlags::ZEROCOPY,
            rts_fd: self.rts_fd,
            tp_buf: nb,
        }
    }

    /// Full duplicate used when one message fans out to several groups.
    pub(crate) fn clone_msg(&self) -> MsgBuf {
        MsgBuf {
            mtype: self.mtype,
            sub_id: self.sub_id,
            len: self.len,
            state: self.state,
            tp_state: 0,
            flags: (self.flags & !MbufFlags::NOALLOC) | MbufFlags::ZEROCOPY,
            rts_fd: self.rts_fd,
            tp_buf: self.tp_buf.clone(),
        }
    }

    // ---- send plumbing ------------------------------------------------

    /// Stamp the routing fields and the transport prefix for the wire.
    pub(crate) fn seal(&mut self) {
        let total = self.tp_buf.len();
        let (mtype, sub_id, len) = (self.mtype, self.sub_id, self.len);
        let hdr = self.hdr_mut();
        header::set_mtype(hdr, mtype);
        header::set_sub_id(hdr, sub_id);
        header::set_plen(hdr, len);
        header::write_tp_prefix(&mut self.tp_buf, total);
    }

    /// Surrender the transport buffer to the writer.
    pub(crate) fn tp_take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.tp_buf)
    }

    /// Reattach a transport buffer after a failed hand-off.
    pub(crate) fn tp_restore(&mut self, buf: Vec<u8>) {
        self.tp_buf = buf;
    }

    pub(crate) fn into_tp_buf(self) -> Vec<u8> {
        self.tp_buf
    }
}

fn field_to_string(field: &[u8]) -> String {
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Bounded byte copy into a fixed header field; truncates and reports
/// `Overflow` when the source is too large.
fn copy_field(dest: &mut [u8], src: &[u8]) -> Result<usize, ErrorKind> {
    let over = src.len() > dest.len();
    let n = src.len().min(dest.len());
    dest[..n].copy_from_slice(&src[..n]);
    if over {
        Err(ErrorKind::Overflow)
    } else {
        Ok(n)
    }
}

/// String copy into a fixed field, terminator included; refuses a string
/// that cannot fit with its terminator.
fn copy_field_str(dest: &mut [u8], s: &str) -> Result<(), ErrorKind> {
    if s.len() > dest.len() - 1 {
        return Err(ErrorKind::Overflow);
    }
    dest[..s.len()].copy_from_slice(s.as_bytes());
    for b in dest[s.len()..].iter_mut() {
        *b = 0;
    }
    Ok(())
}

/// Free list of transport buffers.
///
/// Released buffers are recycled into future allocations when capacity
/// permits; oversized (`HUGE`) buffers are never pooled so a burst of big
/// messages cannot pin memory.
pub(crate) struct BufPool {
    q: ArrayQueue<Vec<u8>>,
}

impl BufPool {
    pub(crate) fn new(capacity: usize) -> BufPool {
        BufPool {
            q: ArrayQueue::new(capacity),
        }
    }

    pub(crate) fn take(&self) -> Option<Vec<u8>> {
        self.q.pop()
    }

    /// Offer a buffer back; dropped on the floor when the pool is full.
    pub(crate) fn give(&self, buf: Vec<u8>) {
        let _ = self.q.push(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{MAX_MEID, MAX_SRC};

    fn mk(payload: usize) -> MsgBuf {
        MsgBuf::alloc(None, payload, 0, "me:4560", "127.0.0.1:4560")
    }

    #[test]
    fn alloc_geometry() {
        let m = mk(512);
        assert_eq!(m.payload_size(), 512);
        assert_eq!(m.len(), 0);
        assert_eq!(m.mtype, UNSET_MSGTYPE);
        assert_eq!(m.sub_id, UNSET_SUBID);
        assert_eq!(m.get_src(), "me:4560");
        assert_eq!(m.call_id(), 0);
    }

    #[test]
    fn payload_copy_and_overflow() {
        let mut m = mk(8);
        assert_eq!(m.bytes2payload(b"abc"), Ok(3));
        assert_eq!(&m.payload()[..3], b"abc");
        assert_eq!(m.len(), 3);

        let err = m.bytes2payload(b"0123456789").unwrap_err();
        assert_eq!(err, ErrorKind::Overflow);
        assert_eq!(m.len(), 8);
        assert_eq!(&m.payload()[..8], b"01234567");
    }

    #[test]
    fn xact_and_meid_fields() {
        let mut m = mk(16);
        m.str2xact("txn-0001").unwrap();
        assert_eq!(&m.get_xact()[..8], b"txn-0001");
        assert_eq!(m.get_xact()[8], 0);

        m.str2meid("meid-42").unwrap();
        assert_eq!(m.get_meid(), "meid-42");

        let long = "m".repeat(MAX_MEID + 4);
        assert_eq!(m.str2meid(&long), Err(ErrorKind::Overflow));
        // bytes variant truncates instead
        assert_eq!(m.bytes2meid(long.as_bytes()), Err(ErrorKind::Overflow));
        assert_eq!(m.get_meid().len(), MAX_MEID);
    }

    #[test]
    fn realloc_smaller_is_noop() {
        let mut m = mk(128);
        m.mtype = 9;
        m.sub_id = 3;
        m.bytes2payload(b"keep").unwrap();
        let before = m.alloc_len();

        m.realloc_payload(64, false);
        assert_eq!(m.alloc_len(), before);
        assert_eq!(m.mtype, 9);
        assert_eq!(&m.payload()[..4], b"keep");
    }

    #[test]
    fn realloc_grow_with_copy_preserves_fields() {
        let mut m = mk(16);
        m.mtype = 11;
        m.sub_id = 2;
        m.bytes2payload(b"payload!").unwrap();

        m.realloc_payload(4096, true);
        assert!(m.payload_size() >= 4096);
        assert_eq!(m.mtype, 11);
        assert_eq!(m.sub_id, 2);
        assert_eq!(m.len(), 8);
        assert_eq!(&m.payload()[..8], b"payload!");
    }

    #[test]
    fn realloc_grow_without_copy_resets_fields() {
        let mut m = mk(16);
        m.mtype = 11;
        m.sub_id = 2;
        m.str2meid("still-here").unwrap();
        m.bytes2payload(b"payload!").unwrap();

        m.realloc_payload(1024, false);
        assert_eq!(m.mtype, UNSET_MSGTYPE);
        assert_eq!(m.sub_id, UNSET_SUBID);
        assert_eq!(m.len(), 0);
        // header content survives so the buffer can still be returned to sender
        assert_eq!(m.get_meid(), "still-here");
    }

    #[test]
    fn clone_leaves_original_untouched() {
        let mut m = mk(16);
        m.mtype = 5;
        m.bytes2payload(b"orig").unwrap();

        let c = m.clone_payload(512, true);
        assert!(c.payload_size() >= 512);
        assert_eq!(c.mtype, 5);
        assert_eq!(&c.payload()[..4], b"orig");
        assert_eq!(m.payload_size(), 16);
        assert_eq!(&m.payload()[..4], b"orig");
        assert_eq!(m.mtype, 5);
    }

    #[test]
    fn trace_resize_preserves_payload_and_call_id() {
        let mut m = mk(32);
        m.mtype = 3;
        m.set_call_id(9);
        m.bytes2payload(b"carried across").unwrap();

        assert_eq!(m.set_trace(b"trace-bytes"), 11);
        assert_eq!(m.trace_len(), 11);
        assert_eq!(m.get_trace(), b"trace-bytes");
        assert_eq!(&m.payload()[..14], b"carried across");
        assert_eq!(m.call_id(), 9);
        assert_eq!(m.payload_size(), 32);

        // same-size set does not rebuild
        let before = m.alloc_len();
        assert_eq!(m.set_trace(b"TRACE-BYTES"), 11);
        assert_eq!(m.alloc_len(), before);
        assert_eq!(m.get_trace(), b"TRACE-BYTES");
    }

    #[test]
    fn seal_then_reparse() {
        let mut m = mk(64);
        m.mtype = 77;
        m.sub_id = -1;
        m.str2xact("roundtrip-xid").unwrap();
        m.bytes2payload(b"ping").unwrap();
        m.seal();

        let raw = m.into_tp_buf();
        assert_eq!(crate::header::extract_mlen(&raw), raw.len());

        let got = MsgBuf::from_raw(raw, 7, false).unwrap();
        assert_eq!(got.mtype, 77);
        assert_eq!(got.sub_id, -1);
        assert_eq!(got.len(), 4);
        assert_eq!(&got.payload()[..4], b"ping");
        assert_eq!(&got.get_xact()[..13], b"roundtrip-xid");
        assert_eq!(got.rts_fd, Some(7));
        assert_eq!(got.state, MsgState::Ok);
    }

    #[test]
    fn truncated_frame_caps_len() {
        let mut m = mk(64);
        m.mtype = 1;
        m.bytes2payload(&[9u8; 64]).unwrap();
        m.seal();
        let mut raw = m.into_tp_buf();
        raw.truncate(raw.len() - 32); // lose half the payload in transit
        let raw_len = raw.len();
        crate::header::write_tp_prefix(&mut raw, raw_len);

        let got = MsgBuf::from_raw(raw, 1, false).unwrap();
        assert_eq!(got.state, MsgState::Trunc);
        assert_eq!(got.len(), 32);
    }

    #[test]
    fn pool_recycles_buffers() {
        let pool = BufPool::new(2);
        assert!(pool.take().is_none());
        pool.give(vec![0u8; 64]);
        let m = MsgBuf::alloc(pool.take(), 16, 0, "a:1", "1.2.3.4:1");
        assert_eq!(m.payload_size(), 16);
        assert!(pool.take().is_none());
    }

    #[test]
    fn long_src_identity_truncates() {
        let m = MsgBuf::alloc(None, 4, 0, &"h".repeat(MAX_SRC * 2), "ip");
        assert_eq!(m.get_src().len(), MAX_SRC - 1);
    }
}
