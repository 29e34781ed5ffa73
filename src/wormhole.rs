//! # Wormholes
//!
//! A wormhole is a direct channel to a named target, bypassing route table
//! selection entirely. Unlike routed endpoints, which connect lazily on
//! the first send, a wormhole dials its target when opened so the caller
//! learns about an unreachable peer up front.
//!
//! Closing a wormhole only releases the application's handle; the
//! underlying connection stays up because routed traffic may share it.

use crate::context::Context;
use crate::endpoint::Endpoint;
use crate::error::{SendError, WormholeError};
use crate::header::NO_CALL_ID;
use crate::mbuf::MsgBuf;
use crate::send;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Handle returned by [`Context::wh_open`]; a small index into the
/// per-context wormhole pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Whid(pub usize);

/// The per-context pool of open wormholes.
pub(crate) struct WhPool {
    eps: Mutex<Vec<Option<Arc<Endpoint>>>>,
}

impl WhPool {
    pub(crate) fn new() -> WhPool {
        WhPool {
            eps: Mutex::new(Vec::new()),
        }
    }

    fn get(&self, whid: Whid) -> Result<Arc<Endpoint>, WormholeError> {
        let eps = self.eps.lock();
        if eps.is_empty() {
            return Err(WormholeError::NotOpen);
        }
        eps.get(whid.0)
            .and_then(|slot| slot.clone())
            .ok_or(WormholeError::BadId(whid.0))
    }

    /// Record the endpoint, reusing its existing slot or the first hole.
    fn insert(&self, ep: &Arc<Endpoint>) -> Whid {
        let mut eps = self.eps.lock();
        let mut hole = None;
        for (i, slot) in eps.iter().enumerate() {
            match slot {
                Some(have) if Arc::ptr_eq(have, ep) => return Whid(i),
                None if hole.is_none() => hole = Some(i),
                _ => {}
            }
        }
        match hole {
            Some(i) => {
                eps[i] = Some(ep.clone());
                Whid(i)
            }
            None => {
                eps.push(Some(ep.clone()));
                Whid(eps.len() - 1)
            }
        }
    }

    fn clear(&self, whid: Whid) {
        let mut eps = self.eps.lock();
        if let Some(slot) = eps.get_mut(whid.0) {
            *slot = None;
        }
    }
}

impl Context {
    /// Open a direct channel to `target` (`host:port`), dialing eagerly.
    ///
    /// Opening the same target twice returns the same id. The id indexes a
    /// small per-context pool and stays valid until [`Context::wh_close`].
    pub fn wh_open(&self, target: &str) -> Result<Whid, WormholeError> {
        if target.is_empty() {
            return Err(WormholeError::BadTarget);
        }

        let ep = self
            .inner
            .registry()
            .ensure(target)
            .ok_or(WormholeError::BadTarget)?;

        if !crate::context::link2(&self.inner, &ep) {
            return Err(WormholeError::Connect {
                target: target.to_string(),
            });
        }

        let whid = self.inner.wormholes.insert(&ep);
        debug!(whid = whid.0, target, "wormhole opened");
        Ok(whid)
    }

    /// Send directly through an open wormhole.
    ///
    /// The call id is blotted out so the message queues normally on the
    /// receiving side. A closed connection is redialed before the send.
    pub fn wh_send_msg(&self, whid: Whid, mut msg: MsgBuf) -> Result<MsgBuf, SendError> {
        let ep = match self.inner.wormholes.get(whid) {
            Ok(ep) => ep,
            Err(e) => {
                return Err(SendError::new(e.into(), msg));
            }
        };

        msg.set_call_id(NO_CALL_ID);
        send::send_via_ep(&self.inner, &ep, msg, self.inner.send_retries())
            .map(|fresh| fresh.unwrap_or_else(|| self.alloc_msg(0)))
    }

    /// Release a wormhole id. The underlying connection is left alone.
    pub fn wh_close(&self, whid: Whid) {
        self.inner.wormholes.clear(whid);
    }

    /// Report whether the wormhole's connection is currently open.
    pub fn wh_state(&self, whid: Whid) -> Result<(), WormholeError> {
        let ep = self.inner.wormholes.get(whid)?;
        if ep.is_open() {
            Ok(())
        } else {
            Err(WormholeError::NotConnected)
        }
    }
}

impl From<WormholeError> for crate::error::ErrorKind {
    fn from(e: WormholeError) -> Self {
        match e {
            WormholeError::NotOpen => crate::error::ErrorKind::NoWhOpen,
            WormholeError::BadId(_) => crate::error::ErrorKind::BadWhId,
            WormholeError::NotConnected => crate::error::ErrorKind::NoEndpoint,
            WormholeError::Connect { .. } => crate::error::ErrorKind::NoEndpoint,
            WormholeError::BadTarget => crate::error::ErrorKind::BadArg,
        }
    }
}
