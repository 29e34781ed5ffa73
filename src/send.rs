//! # Send Engine
//!
//! Route selection and the non-blocking hand-off to a connection's writer.
//! A message type with several round-robin groups is a limited fanout: one
//! endpoint from every group receives a copy, with the message cloned
//! ahead of each non-final send because a surrendered buffer cannot be
//! reused.
//!
//! The hand-off itself never blocks on the network. A full writer queue is
//! the transient-failure signal; the retry budget spins on it, yielding
//! the processor for a microsecond between spin epochs, before giving up
//! with a retryable state.

use crate::context::Inner;
use crate::endpoint::{Endpoint, EPSC_FAIL, EPSC_GOOD, EPSC_TRANS};
use crate::error::{ErrorKind, SendError};
use crate::header::HFL_CALL_MSG;
use crate::mbuf::{MbufFlags, MsgBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Hand-off attempts per spin epoch before the processor is yielded.
pub(crate) const SPIN_RETRIES: u32 = 1000;
/// Attempts allowed when the caller asked for a zero retry budget.
pub(crate) const FAST_FAIL_RETRIES: u32 = 100;

/// Push a sealed frame onto a connection's writer queue.
///
/// `retries` counts spin epochs: within an epoch the hand-off is retried
/// back to back; between epochs the thread sleeps one microsecond. A
/// budget of zero fast-fails after a short spin. On failure the message is
/// handed back intact so the caller may retry the identical buffer.
pub(crate) fn transmit(
    tx: &mpsc::Sender<Vec<u8>>,
    mut msg: MsgBuf,
    retries: i32,
) -> Result<(), (MsgBuf, ErrorKind, i32)> {
    msg.seal();

    let mut spin = SPIN_RETRIES;
    let mut epochs = retries;
    if epochs == 0 {
        spin = FAST_FAIL_RETRIES;
        epochs = 1;
    }

    let mut frame = msg.tp_take();
    loop {
        match tx.try_send(frame) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Full(f)) => {
                frame = f;
                spin -= 1;
                if spin == 0 {
                    epochs -= 1;
                    if epochs <= 0 {
                        msg.tp_restore(frame);
                        msg.tp_state = libc::EAGAIN;
                        return Err((msg, ErrorKind::Retry, libc::EAGAIN));
                    }
                    std::thread::sleep(Duration::from_micros(1));
                    spin = SPIN_RETRIES;
                }
            }
            Err(TrySendError::Closed(f)) => {
                msg.tp_restore(f);
                msg.tp_state = libc::EPIPE;
                return Err((msg, ErrorKind::SendFailed, libc::EPIPE));
            }
        }
    }
}

/// Send one message to one endpoint, opening the connection if required.
///
/// On success a replacement buffer is allocated for the caller unless the
/// message carried the no-alloc flag. Endpoint counters reflect the
/// outcome of every attempt.
pub(crate) fn send_via_ep(
    inner: &Arc<Inner>,
    ep: &Arc<Endpoint>,
    mut msg: MsgBuf,
    retries: i32,
) -> Result<Option<MsgBuf>, SendError> {
    if !ep.is_open() && !crate::context::link2(inner, ep) {
        msg.tp_state = libc::ENXIO;
        return Err(SendError::with_tp(ErrorKind::NoEndpoint, libc::ENXIO, msg));
    }

    let (_fd, tx) = match ep.sender() {
        Some(s) => s,
        None => {
            msg.tp_state = libc::ENXIO;
            return Err(SendError::with_tp(ErrorKind::NoEndpoint, libc::ENXIO, msg));
        }
    };

    let noalloc = msg.flags.contains(MbufFlags::NOALLOC);
    let tr_len = msg.trace_len();
    let pay_cap = msg.payload_size();

    match transmit(&tx, msg, retries) {
        Ok(()) => {
            ep.bump(EPSC_GOOD);
            if noalloc {
                Ok(None)
            } else {
                Ok(Some(inner.alloc_like(pay_cap, tr_len)))
            }
        }
        Err((m, kind, tp)) => {
            match kind {
                ErrorKind::Retry => ep.bump(EPSC_TRANS),
                _ => {
                    ep.bump(EPSC_FAIL);
                    ep.mark_closed();
                }
            }
            Err(SendError::with_tp(kind, tp, m))
        }
    }
}

/// The routed send: key lookup, group fanout, per-group endpoint pick.
///
/// `max_to` is the retry budget; negative selects the context default.
/// When the entry fans out to several groups the returned state is OK if
/// at least one group accepted the message, otherwise the last failure
/// wins, mirroring the behaviour applications already depend on.
pub(crate) fn mtosend(
    inner: &Arc<Inner>,
    mut msg: MsgBuf,
    max_to: i32,
) -> Result<Option<MsgBuf>, SendError> {
    let retries = if max_to < 0 {
        inner.send_retries()
    } else {
        max_to
    };

    if msg.flags.contains(MbufFlags::ADDSRC) {
        // reused receive buffer: the source fields must become ours
        inner.stamp_identity(&mut msg);
    }

    let rt = match inner.route_table() {
        Some(rt) => rt,
        None => {
            if inner.warnings() {
                warn!("no route table yet; message cannot be routed");
            }
            msg.tp_state = libc::ENXIO;
            return Err(SendError::with_tp(ErrorKind::NoEndpoint, libc::ENXIO, msg));
        }
    };

    let rte = match rt.get_rte(msg.sub_id, msg.mtype, true) {
        Some(rte) => rte,
        None => {
            if inner.warnings() {
                warn!(mtype = msg.mtype, sub_id = msg.sub_id, "no endpoint for message");
            }
            msg.tp_state = libc::ENXIO;
            return Err(SendError::with_tp(ErrorKind::NoEndpoint, libc::ENXIO, msg));
        }
    };

    // no round-robin groups: the MEID field names the destination
    if rte.groups.is_empty() {
        let meid = msg.get_meid();
        let ep = match rt.get_meid_owner(&meid) {
            Some(ep) => ep,
            None => {
                debug!(meid = meid.as_str(), "no owner endpoint for meid");
                msg.tp_state = libc::ENXIO;
                return Err(SendError::with_tp(ErrorKind::NoEndpoint, libc::ENXIO, msg));
            }
        };
        return send_via_ep(inner, &ep, msg, retries);
    }

    let ngroups = rte.groups.len();
    let mut ok_sends = 0usize;
    let mut last_err: Option<SendError> = None;
    let mut current = msg;

    for (gi, group) in rte.groups.iter().enumerate() {
        let more = gi + 1 < ngroups;

        let ep = match group.select() {
            Some(ep) => ep,
            None => {
                debug!(group = gi, "nothing in round robin group");
                if !more {
                    break;
                }
                continue;
            }
        };

        if more {
            // this buffer is surrendered by the send; clone for the rest
            let clone = current.clone_msg();
            current.flags |= MbufFlags::NOALLOC;
            match send_via_ep(inner, &ep, current, retries) {
                Ok(_) => ok_sends += 1,
                Err(e) => {
                    if let Some(m) = e.msg {
                        inner.release(m);
                    }
                    last_err = Some(SendError {
                        kind: e.kind,
                        tp_state: e.tp_state,
                        msg: None,
                    });
                }
            }
            current = clone;
        } else {
            match send_via_ep(inner, &ep, current, retries) {
                Ok(fresh) => {
                    ok_sends += 1;
                    return Ok(fresh);
                }
                Err(mut e) => {
                    if ok_sends > 0 {
                        // part of the fanout went out; report overall OK
                        if let Some(mut m) = e.msg.take() {
                            m.flags &= !MbufFlags::NOALLOC;
                            return Ok(Some(m));
                        }
                        return Ok(None);
                    }
                    if let Some(m) = e.msg.as_mut() {
                        m.flags &= !MbufFlags::NOALLOC;
                    }
                    return Err(e);
                }
            }
        }
    }

    // the final group had nothing to select; the buffer comes back with
    // the overall outcome
    current.flags &= !MbufFlags::NOALLOC;
    if ok_sends > 0 {
        return Ok(Some(current));
    }
    current.tp_state = libc::ENXIO;
    Err(match last_err {
        Some(mut e) => {
            e.msg = Some(current);
            e
        }
        None => SendError::with_tp(ErrorKind::NoEndpoint, libc::ENXIO, current),
    })
}

/// Clear the call markers so a routed message cannot land in a chute.
pub(crate) fn scrub_call_markers(msg: &mut MsgBuf) {
    let flags = msg.hdr_flags() & !HFL_CALL_MSG;
    msg.set_hdr_flags(flags);
    msg.set_call_id(crate::header::NO_CALL_ID);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg() -> MsgBuf {
        let mut m = MsgBuf::alloc(None, 32, 0, "me:1", "1.1.1.1:1");
        m.mtype = 1;
        m.bytes2payload(b"spin").unwrap();
        m
    }

    #[test]
    fn transmit_delivers_sealed_frame() {
        let (tx, mut rx) = mpsc::channel(4);
        transmit(&tx, msg(), 1).unwrap();
        let frame = rx.try_recv().unwrap();
        assert_eq!(crate::header::extract_mlen(&frame), frame.len());
    }

    #[test]
    fn retry_budget_is_bounded_and_preserves_message() {
        // queue with no reader and a single slot: always full after one
        let (tx, _rx) = mpsc::channel(1);
        tx.try_send(vec![0u8; 4]).unwrap();

        let mut m = msg();
        m.str2xact("keep-me").unwrap();

        let start = std::time::Instant::now();
        let (back, kind, tp) = transmit(&tx, m, 2).unwrap_err();
        assert_eq!(kind, ErrorKind::Retry);
        assert_eq!(tp, libc::EAGAIN);
        // budget: 2 epochs of spinning, then give up; this must be quick
        assert!(start.elapsed() < Duration::from_secs(1));
        // the buffer survives intact for a caller retry
        assert_eq!(&back.get_xact()[..7], b"keep-me");
        assert_eq!(&back.payload()[..4], b"spin");
    }

    #[test]
    fn zero_budget_fast_fails() {
        let (tx, _rx) = mpsc::channel(1);
        tx.try_send(vec![0u8; 4]).unwrap();
        let (_m, kind, _tp) = transmit(&tx, msg(), 0).unwrap_err();
        assert_eq!(kind, ErrorKind::Retry);
    }

    #[test]
    fn closed_queue_is_a_hard_failure() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let (_m, kind, tp) = transmit(&tx, msg(), 1).unwrap_err();
        assert_eq!(kind, ErrorKind::SendFailed);
        assert_eq!(tp, libc::EPIPE);
    }

    #[test]
    fn scrub_clears_call_markers() {
        let mut m = msg();
        m.set_hdr_flags(HFL_CALL_MSG);
        m.set_call_id(9);
        scrub_call_markers(&mut m);
        assert_eq!(m.hdr_flags() & HFL_CALL_MSG, 0);
        assert_eq!(m.call_id(), crate::header::NO_CALL_ID);
    }
}
