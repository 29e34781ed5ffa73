//! # Endpoint Registry
//!
//! An endpoint is a remote `host:port` with a lazily opened TCP
//! connection. Endpoints are owned by a registry on the context and live
//! for the life of the process; route tables, the MEID map and wormholes
//! all hold shared references into the registry, so a table swap can never
//! invalidate an endpoint someone is still sending to.
//!
//! Name resolution is deferred to the connect attempt, which means a name
//! that did not resolve when the route table arrived gets another chance
//! every time the endpoint is (re)opened.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Index of the successful-send counter.
pub(crate) const EPSC_GOOD: usize = 0;
/// Index of the hard-failure counter.
pub(crate) const EPSC_FAIL: usize = 1;
/// Index of the transient-failure counter.
pub(crate) const EPSC_TRANS: usize = 2;

/// Connection state guarded by the endpoint gate.
#[derive(Default)]
pub(crate) struct Link {
    pub open: bool,
    pub fd: Option<u64>,
    /// Frame queue drained by the connection's writer task.
    pub tx: Option<mpsc::Sender<Vec<u8>>>,
}

/// A remote peer. See the module docs for ownership rules.
pub struct Endpoint {
    name: String,
    pub(crate) link: Mutex<Link>,
    /// Log-once latch: set when the next failure should be reported.
    notify: AtomicBool,
    counts: [AtomicU64; 3],
}

impl Endpoint {
    fn new(name: &str) -> Endpoint {
        Endpoint {
            name: name.to_string(),
            link: Mutex::new(Link::default()),
            notify: AtomicBool::new(true),
            counts: [AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_open(&self) -> bool {
        self.link.lock().open
    }

    /// Snapshot of the open connection's id and frame queue.
    pub(crate) fn sender(&self) -> Option<(u64, mpsc::Sender<Vec<u8>>)> {
        let l = self.link.lock();
        match (&l.tx, l.fd) {
            (Some(tx), Some(fd)) if l.open => Some((fd, tx.clone())),
            _ => None,
        }
    }

    /// Disconnect notification: next send attempt must reconnect.
    pub(crate) fn mark_closed(&self) {
        let mut l = self.link.lock();
        l.open = false;
        l.fd = None;
        l.tx = None;
    }

    /// True when this failure should be logged; arms the recovery notice.
    pub(crate) fn should_notify_failure(&self) -> bool {
        self.notify.swap(false, Ordering::Relaxed)
    }

    /// True when a success ends a reported failure streak.
    pub(crate) fn note_success(&self) -> bool {
        !self.notify.swap(true, Ordering::Relaxed)
    }

    pub(crate) fn bump(&self, which: usize) {
        self.counts[which].fetch_add(1, Ordering::Relaxed);
    }

    /// Send counters as (good, hard_fail, transient_fail).
    pub fn send_counts(&self) -> (u64, u64, u64) {
        (
            self.counts[EPSC_GOOD].load(Ordering::Relaxed),
            self.counts[EPSC_FAIL].load(Ordering::Relaxed),
            self.counts[EPSC_TRANS].load(Ordering::Relaxed),
        )
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Name keyed owner of every endpoint the context knows about.
///
/// Entries are only ever added; a "deleted" endpoint simply stops being
/// referenced by route tables and sits closed in the registry.
pub(crate) struct EndpointRegistry {
    map: RwLock<HashMap<String, Arc<Endpoint>>>,
}

impl EndpointRegistry {
    pub(crate) fn new() -> EndpointRegistry {
        EndpointRegistry {
            map: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch the endpoint for a name, creating it on first reference.
    pub(crate) fn ensure(&self, name: &str) -> Option<Arc<Endpoint>> {
        if name.is_empty() {
            return None;
        }
        if let Some(ep) = self.map.read().get(name) {
            return Some(ep.clone());
        }
        let mut w = self.map.write();
        Some(
            w.entry(name.to_string())
                .or_insert_with(|| Arc::new(Endpoint::new(name)))
                .clone(),
        )
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<Endpoint>> {
        self.map.read().get(name).cloned()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.map.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_creates_once() {
        let reg = EndpointRegistry::new();
        let a = reg.ensure("host-a:4560").unwrap();
        let b = reg.ensure("host-a:4560").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.len(), 1);
        assert!(reg.ensure("").is_none());
        assert!(reg.get("missing:1").is_none());
    }

    #[test]
    fn notify_latch_cycles() {
        let reg = EndpointRegistry::new();
        let ep = reg.ensure("h:1").unwrap();

        assert!(ep.should_notify_failure()); // first failure reported
        assert!(!ep.should_notify_failure()); // streak stays quiet
        assert!(ep.note_success()); // recovery after a reported failure
        assert!(!ep.note_success()); // plain success is silent
        assert!(ep.should_notify_failure());
    }

    #[test]
    fn closed_endpoint_has_no_sender() {
        let reg = EndpointRegistry::new();
        let ep = reg.ensure("h:2").unwrap();
        assert!(ep.sender().is_none());

        let (tx, _rx) = mpsc::channel(4);
        {
            let mut l = ep.link.lock();
            l.open = true;
            l.fd = Some(9);
            l.tx = Some(tx);
        }
        assert!(ep.sender().is_some());
        ep.mark_closed();
        assert!(ep.sender().is_none());
        let (g, f, t) = ep.send_counts();
        assert_eq!((g, f, t), (0, 0, 0));
    }
}
