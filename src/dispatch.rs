//! # Dispatcher
//!
//! Classification of completed inbound frames. Runs on the connection
//! reader tasks, so everything here must be quick and must never block:
//! queue inserts are try-only and chute delivery is a store plus a signal.
//!
//! A frame is either a call response, delivered straight to the chute of
//! the caller waiting for it, or normal traffic queued on the receive
//! ring. Messages that were themselves *sent* as a call (the call flag is
//! on) are requests arriving at a server and queue normally; only the
//! reply direction uses chutes.

use crate::context::Inner;
use crate::header::HFL_CALL_MSG;
use crate::mbuf::MsgBuf;
use crate::river::ACCUM_FUDGE;
use tracing::{debug, error};

/// Handle one complete raw frame from a connection.
pub(crate) fn dispatch(inner: &Inner, raw: Vec<u8>, fd: u64) {
    let huge = raw.len() > inner.max_ibm() + ACCUM_FUDGE;
    let msg = match MsgBuf::from_raw(raw, fd, huge) {
        Some(m) => m,
        None => return, // not a parseable message; already logged
    };

    if msg.hdr_flags() & HFL_CALL_MSG != 0 {
        // a request sent via call on the far side; the reply path will
        // find its way back through rts
        queue_normal(inner, msg);
        return;
    }

    let call_id = msg.call_id();
    if call_id == 0 {
        queue_normal(inner, msg);
        return;
    }

    debug!(call_id, fd, "delivering call response to chute");
    // the waiter vets the transaction id in its own thread
    inner.chutes().get(call_id).deliver(msg);
}

/// Queue normal traffic; a full ring drops the message with one warning.
pub(crate) fn queue_normal(inner: &Inner, msg: MsgBuf) {
    if let Err(e) = inner.ring_push(msg) {
        inner.release(e);
        if inner.note_ring_drop() {
            error!("application is not receiving fast enough; messages dropping");
        }
    }
}
