//! # Chutes
//!
//! Correlation slots for the multi-threaded call feature. A fixed arena of
//! slots is allocated with the context so the hot path never allocates:
//! the caller parks on its slot's condvar, the receive side drops the
//! response into the slot and signals. Exactly two threads ever touch a
//! slot during a transaction, so a mutex plus condvar per slot is all the
//! coordination required.
//!
//! Slot 0 is reserved (the ring monitor in the original design) and slot 1
//! belongs to the legacy single-threaded call; application call ids run
//! from 2 through [`MAX_CALL_ID`].

use crate::header::MAX_XID;
use crate::mbuf::MsgBuf;
use parking_lot::{Condvar, Mutex};
use std::time::Instant;

/// Largest call id usable with `mt_call`; the id travels in one byte.
pub const MAX_CALL_ID: u8 = 255;

/// Call id reserved for the legacy blocking `call`.
pub(crate) const LEGACY_CALL_ID: u8 = 1;

struct Slot {
    mbuf: Option<MsgBuf>,
    expect: [u8; MAX_XID],
}

/// One correlation slot: a parked caller and the response that wakes it.
pub(crate) struct Chute {
    slot: Mutex<Slot>,
    barrier: Condvar,
}

impl Chute {
    fn new() -> Chute {
        Chute {
            slot: Mutex::new(Slot {
                mbuf: None,
                expect: [0u8; MAX_XID],
            }),
            barrier: Condvar::new(),
        }
    }

    /// Arm the slot for a new transaction: record the transaction id we
    /// will wait for and flush any stale response left by a timed-out
    /// predecessor. Returns the stale buffer, if any, for release.
    pub(crate) fn arm(&self, expect: &[u8]) -> Option<MsgBuf> {
        let mut s = self.slot.lock();
        let n = expect.len().min(MAX_XID);
        s.expect = [0u8; MAX_XID];
        s.expect[..n].copy_from_slice(&expect[..n]);
        s.mbuf.take()
    }

    /// Receive side: publish the response, then signal the waiter.
    ///
    /// The store happens under the slot lock before the notify, giving the
    /// release/acquire pairing the waiting thread depends on.
    pub(crate) fn deliver(&self, m: MsgBuf) {
        let mut s = self.slot.lock();
        s.mbuf = Some(m);
        drop(s);
        self.barrier.notify_one();
    }

    /// Park until a response with the armed transaction id arrives or the
    /// deadline passes. Responses carrying any other id are handed to
    /// `discard` and the wait continues on the original deadline.
    pub(crate) fn wait(
        &self,
        deadline: Option<Instant>,
        mut discard: impl FnMut(MsgBuf),
    ) -> Option<MsgBuf> {
        let mut s = self.slot.lock();
        loop {
            if let Some(m) = s.mbuf.take() {
                if m.xaction() == &s.expect[..] {
                    return Some(m);
                }
                discard(m);
                continue;
            }

            match deadline {
                Some(d) => {
                    if self.barrier.wait_until(&mut s, d).timed_out() {
                        return None;
                    }
                }
                None => self.barrier.wait(&mut s),
            }
        }
    }
}

/// The fixed chute arena.
pub(crate) struct ChuteTable {
    chutes: Vec<Chute>,
}

impl ChuteTable {
    pub(crate) fn new() -> ChuteTable {
        let chutes = (0..=MAX_CALL_ID as usize).map(|_| Chute::new()).collect();
        ChuteTable { chutes }
    }

    pub(crate) fn get(&self, call_id: u8) -> &Chute {
        &self.chutes[call_id as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn msg_with_xid(xid: &str) -> MsgBuf {
        let mut m = MsgBuf::alloc(None, 16, 0, "a:1", "1.1.1.1:1");
        m.str2xact(xid).unwrap();
        m
    }

    #[test]
    fn matched_response_wakes_waiter() {
        let t = Arc::new(ChuteTable::new());
        let expect = msg_with_xid("match-me").get_xact();
        t.get(7).arm(&expect);

        let t2 = t.clone();
        let h = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            t2.get(7).deliver(msg_with_xid("match-me"));
        });

        let got = t
            .get(7)
            .wait(Some(Instant::now() + Duration::from_secs(2)), |_| {})
            .expect("waiter should receive the response");
        assert_eq!(&got.get_xact()[..8], b"match-me");
        h.join().unwrap();
    }

    #[test]
    fn mismatched_response_is_discarded_and_wait_continues() {
        let t = Arc::new(ChuteTable::new());
        let expect = msg_with_xid("wanted").get_xact();
        t.get(9).arm(&expect);

        let t2 = t.clone();
        let h = std::thread::spawn(move || {
            t2.get(9).deliver(msg_with_xid("stray"));
            std::thread::sleep(Duration::from_millis(30));
            t2.get(9).deliver(msg_with_xid("wanted"));
        });

        let mut strays = 0;
        let got = t
            .get(9)
            .wait(Some(Instant::now() + Duration::from_secs(2)), |_| strays += 1)
            .expect("matched response expected");
        assert_eq!(strays, 1);
        assert_eq!(&got.get_xact()[..6], b"wanted");
        h.join().unwrap();
    }

    #[test]
    fn timeout_returns_none() {
        let t = ChuteTable::new();
        t.get(2).arm(&[1u8; MAX_XID]);
        let got = t
            .get(2)
            .wait(Some(Instant::now() + Duration::from_millis(25)), |_| {});
        assert!(got.is_none());
    }

    #[test]
    fn arm_flushes_stale_response() {
        let t = ChuteTable::new();
        t.get(3).arm(&[9u8; MAX_XID]);
        t.get(3).deliver(msg_with_xid("late"));
        let stale = t.get(3).arm(&[8u8; MAX_XID]);
        assert!(stale.is_some());
    }
}
