//! # Route Table
//!
//! The keyed map that turns `(message type, subscription id)` into a set of
//! candidate endpoints. Tables are immutable once published: the assembler
//! builds a replacement off to the side and swaps it in with a single
//! pointer store, so readers never observe a half-built table. The
//! generation being replaced parks in an `old` slot for one more publish,
//! and shared ownership keeps any generation a reader still holds alive
//! until the last reference drops.
//!
//! Entries may be shared between generations (partial updates clone the
//! whole entry set); the reference counting the original did by hand falls
//! out of `Arc` here.

pub(crate) mod assembler;
pub(crate) mod collector;

use crate::endpoint::Endpoint;
use crate::header::UNSET_SUBID;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Pack a subscription id and message type into the table key.
///
/// An unset sub id maps to the all-ones high word so that type-only
/// entries occupy a distinct key space.
pub(crate) fn build_rt_key(sub_id: i32, mtype: i32) -> u64 {
    if sub_id == UNSET_SUBID {
        0xffffffff_00000000 | (mtype as u32 as u64)
    } else {
        ((sub_id as u32 as u64) << 32) | (mtype as u32 as u64)
    }
}

/// An ordered set of endpoints sharing traffic for one entry.
///
/// Selection is a lock-free fetch-add over the member count. Under racing
/// senders the index can skip or repeat a member; that costs at most one
/// uneven pick and is accepted in exchange for a lock-free hot path.
pub(crate) struct RrGroup {
    epts: Vec<Arc<Endpoint>>,
    ep_idx: AtomicU32,
}

impl RrGroup {
    pub(crate) fn new(epts: Vec<Arc<Endpoint>>) -> RrGroup {
        RrGroup {
            epts,
            ep_idx: AtomicU32::new(0),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.epts.is_empty()
    }

    /// Pick the next endpoint in rotation; `None` for an empty group.
    ///
    /// A single-member group never touches the rotation counter.
    pub(crate) fn select(&self) -> Option<Arc<Endpoint>> {
        match self.epts.len() {
            0 => None,
            1 => Some(self.epts[0].clone()),
            n => {
                let idx = self.ep_idx.fetch_add(1, Ordering::Relaxed) as usize % n;
                Some(self.epts[idx].clone())
            }
        }
    }
}

/// One route table entry: the groups that receive a matching message.
///
/// An entry with no groups is a `%meid` entry; the destination comes from
/// the message's MEID field instead of round-robin selection.
pub(crate) struct RouteEntry {
    pub key: u64,
    /// Message type kept for diagnostics.
    pub mtype: i32,
    pub groups: Vec<RrGroup>,
}

/// One generation of routing state.
pub(crate) struct RouteTable {
    entries: HashMap<u64, Arc<RouteEntry>>,
    /// MEID owner map: managed element id to owning endpoint.
    meids: HashMap<String, Arc<Endpoint>>,
    /// Records ingested while this table was under construction.
    pub(crate) updates: u32,
    /// MEID records ingested while under construction.
    pub(crate) mupdates: u32,
}

impl RouteTable {
    pub(crate) fn new() -> RouteTable {
        RouteTable {
            entries: HashMap::new(),
            meids: HashMap::new(),
            updates: 0,
            mupdates: 0,
        }
    }

    /// New-table clone: MEID mappings carry forward, entries start empty.
    pub(crate) fn clone_endpoints(&self) -> RouteTable {
        RouteTable {
            entries: HashMap::new(),
            meids: self.meids.clone(),
            updates: 0,
            mupdates: 0,
        }
    }

    /// Update clone: everything carries forward so records not mentioned
    /// in the update survive.
    pub(crate) fn clone_all(&self) -> RouteTable {
        RouteTable {
            entries: self.entries.clone(),
            meids: self.meids.clone(),
            updates: 0,
            mupdates: 0,
        }
    }

    pub(crate) fn insert(&mut self, entry: RouteEntry) {
        self.entries.insert(entry.key, Arc::new(entry));
    }

    pub(crate) fn remove(&mut self, key: u64) -> bool {
        self.entries.remove(&key).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Entry lookup with the type-only fallback rule.
    ///
    /// When no entry matches the full key and the caller allows it, a
    /// second probe with the sub id cleared finds the type-wide entry; an
    /// exact `(sub id, type)` entry always wins over the fallback.
    pub(crate) fn get_rte(&self, sub_id: i32, mtype: i32, try_alt: bool) -> Option<Arc<RouteEntry>> {
        let key = build_rt_key(sub_id, mtype);
        if let Some(rte) = self.entries.get(&key) {
            return Some(rte.clone());
        }
        if try_alt && sub_id != UNSET_SUBID {
            let alt = build_rt_key(UNSET_SUBID, mtype);
            return self.entries.get(&alt).cloned();
        }
        None
    }

    pub(crate) fn set_meid_owner(&mut self, meid: &str, ep: Arc<Endpoint>) {
        self.meids.insert(meid.to_string(), ep);
    }

    pub(crate) fn del_meid(&mut self, meid: &str) {
        self.meids.remove(meid);
    }

    pub(crate) fn get_meid_owner(&self, meid: &str) -> Option<Arc<Endpoint>> {
        self.meids.get(meid).cloned()
    }

    pub(crate) fn meid_count(&self) -> usize {
        self.meids.len()
    }

    /// Dump the table at debug level, one line per entry and endpoint.
    pub(crate) fn log_stats(&self) {
        for e in self.entries.values() {
            tracing::debug!(
                key = %format_args!("{:016x}", e.key),
                mtype = e.mtype,
                groups = e.groups.len(),
                "rte"
            );
            for g in &e.groups {
                for ep in &g.epts {
                    let (good, hard, transient) = ep.send_counts();
                    tracing::debug!(
                        target = ep.name(),
                        open = ep.is_open(),
                        good,
                        hard,
                        transient,
                        "endpoint"
                    );
                }
            }
        }
        for (meid, ep) in &self.meids {
            tracing::debug!(meid = meid.as_str(), owner = ep.name(), "meid");
        }
    }
}

/// The published generations: the active table plus the one it replaced.
///
/// Only the assembler writes here; readers clone the active `Arc` and work
/// from that snapshot.
#[derive(Default)]
pub(crate) struct TableSet {
    pub current: Option<Arc<RouteTable>>,
    pub old: Option<Arc<RouteTable>>,
}

impl TableSet {
    /// Atomic publish: the active table ages into the old slot and the
    /// generation that was old is released.
    pub(crate) fn publish(&mut self, table: RouteTable) {
        self.old = self.current.take();
        self.current = Some(Arc::new(table));
    }
}
