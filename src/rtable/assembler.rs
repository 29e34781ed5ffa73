//! # Route Table Assembler
//!
//! Parses the record stream sent by the route manager (or read from a seed
//! file) and builds replacement route tables off to the side. A table
//! under construction is invisible to senders until its `end` record
//! arrives with a matching record count; only then is it published. A
//! `start` record arriving while another table is still open discards the
//! incomplete table and reports the failure back to the sender.
//!
//! Record grammar (pipe delimited, one record per line, `#` comments):
//!
//! ```text
//! newrt | start | <table_id>
//! newrt | end   | <record_count>
//! rte   | <mtype>[,sender]... | <ep>,<ep>[;<ep>...] [| <sub_id>]
//! mse   | <mtype>[,sender]... | <sub_id> | <ep>,<ep>[;<ep>...]
//! del   | <mtype>[,sender]... | <sub_id>
//! update| start|end ...          (partial update; unmentioned entries survive)
//! meid_map | start|end ...
//! mme_ar | <owner_ep> | <meid> <meid> ...
//! mme_del| <meid> <meid> ...
//! ```
//!
//! The special endpoint list `%meid` creates an entry with no round-robin
//! groups; such messages route by the MEID owner map instead.

use crate::endpoint::EndpointRegistry;
use crate::header::UNSET_SUBID;
use crate::rtable::{build_rt_key, RouteEntry, RouteTable, RrGroup, TableSet};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Ack callback: `(ok, table_id, reason)`. The collector wires this to a
/// message back to the route manager; seed-file loads pass a no-op.
pub(crate) type AckFn<'a> = dyn FnMut(bool, Option<&str>, &str) + 'a;

/// The slice of context state the assembler works against.
pub(crate) struct RtHost {
    pub registry: Arc<EndpointRegistry>,
    pub tables: Arc<RwLock<TableSet>>,
    pub ready: Arc<AtomicBool>,
    /// Our `host:port` identity, matched against record sender filters.
    pub my_name: String,
    /// Interface addresses (`addr:port`), for sender filters and for
    /// dropping ourselves out of round-robin groups.
    pub ip_list: Vec<String>,
}

impl RtHost {
    fn is_me(&self, token: &str) -> bool {
        token == self.my_name || self.ip_list.iter().any(|ip| ip == token)
    }

    /// Sender filter: ingest when there is no filter, or when our name or
    /// one of our addresses appears in it.
    fn filter_passes(&self, filter: Option<&str>) -> bool {
        match filter {
            None => true,
            Some(list) => list.split(',').map(str::trim).any(|t| self.is_me(t)),
        }
    }

    fn current(&self) -> Option<Arc<RouteTable>> {
        self.tables.read().current.clone()
    }

    fn publish(&self, table: RouteTable) {
        self.tables.write().publish(table);
    }
}

struct Pending {
    table: RouteTable,
    id: Option<String>,
}

/// Record parser and table-under-construction state.
pub(crate) struct Assembler {
    pending: Option<Pending>,
}

impl Assembler {
    pub(crate) fn new() -> Assembler {
        Assembler { pending: None }
    }

    /// Feed a block of newline separated records.
    pub(crate) fn consume_text(&mut self, host: &RtHost, text: &str, ack: &mut AckFn<'_>) {
        for line in text.lines() {
            self.consume(host, line, ack);
        }
    }

    /// Feed one record.
    pub(crate) fn consume(&mut self, host: &RtHost, line: &str, ack: &mut AckFn<'_>) {
        let line = clip(line);
        if line.is_empty() || line.starts_with('#') {
            return;
        }

        let toks: Vec<&str> = line.split('|').map(clip).collect();
        match toks[0] {
            "newrt" if toks.len() >= 2 => match toks[1] {
                "start" => self.start_table(host, toks.get(2), false, ack),
                "end" => self.end_table(host, toks.get(2), true, ack),
                other => warn!("unrecognised newrt action: {}", other),
            },
            "update" if toks.len() >= 2 => match toks[1] {
                // partial update: unmentioned entries must survive, so the
                // build starts from a full clone; no acks on this path
                "start" => self.start_table(host, toks.get(2), true, &mut |_, _, _| {}),
                "end" => self.end_table(host, toks.get(2), false, &mut |_, _, _| {}),
                other => warn!("unrecognised update action: {}", other),
            },
            "rte" if toks.len() >= 3 => {
                if self.pending.is_none() {
                    return; // record outside start/end; ignore quietly
                }
                let sub_id = toks
                    .get(3)
                    .and_then(|t| t.parse().ok())
                    .unwrap_or(UNSET_SUBID);
                self.build_entry(host, toks[1], sub_id, toks[2]);
                self.bump_updates();
            }
            "mse" if toks.len() >= 4 => {
                if self.pending.is_none() {
                    return;
                }
                let sub_id = toks[2].parse().unwrap_or(UNSET_SUBID);
                self.build_entry(host, toks[1], sub_id, toks[3]);
                self.bump_updates();
            }
            "del" if toks.len() >= 3 => {
                if self.pending.is_none() {
                    return;
                }
                let sub_id = toks[2].parse().unwrap_or(UNSET_SUBID);
                self.trash_entry(host, toks[1], sub_id);
                self.bump_updates();
            }
            "meid_map" if toks.len() >= 2 => self.meid_record(host, &toks, ack),
            "mme_ar" if toks.len() >= 3 => {
                if let Some(p) = self.pending.as_mut() {
                    for meid in toks[2].split_whitespace() {
                        match host.registry.ensure(toks[1]) {
                            Some(ep) => p.table.set_meid_owner(meid, ep),
                            None => warn!("unable to create an endpoint for meid owner: {}", toks[1]),
                        }
                    }
                    p.table.mupdates += 1;
                }
            }
            "mme_del" if toks.len() >= 2 => {
                if let Some(p) = self.pending.as_mut() {
                    for meid in toks[1].split_whitespace() {
                        p.table.del_meid(meid);
                    }
                    p.table.mupdates += 1;
                }
            }
            other => debug!("unrecognised route table request: {}", other),
        }
    }

    fn bump_updates(&mut self) {
        if let Some(p) = self.pending.as_mut() {
            p.table.updates += 1;
        }
    }

    fn start_table(
        &mut self,
        host: &RtHost,
        id: Option<&&str>,
        clone_all: bool,
        ack: &mut AckFn<'_>,
    ) {
        if let Some(stale) = self.pending.take() {
            debug!("new table started; dropping incomplete table");
            ack(false, stale.id.as_deref(), "table not complete");
        }

        let table = match (host.current(), clone_all) {
            (Some(cur), true) => cur.clone_all(),
            (Some(cur), false) => cur.clone_endpoints(),
            (None, _) => RouteTable::new(),
        };

        self.pending = Some(Pending {
            table,
            id: id.map(|s| s.to_string()),
        });
    }

    fn end_table(&mut self, host: &RtHost, count: Option<&&str>, ack_ok: bool, ack: &mut AckFn<'_>) {
        let p = match self.pending.take() {
            Some(p) => p,
            None => {
                debug!("end of route table noticed, but one was not started");
                return;
            }
        };

        if let Some(expected) = count.and_then(|c| c.parse::<u32>().ok()) {
            if p.table.updates != expected {
                warn!(
                    "route table update had wrong number of records: received {} expected {}",
                    p.table.updates, expected
                );
                let reason = format!(
                    "missing table records: expected {} got {}",
                    expected, p.table.updates
                );
                ack(false, p.id.as_deref(), &reason);
                return;
            }
        }

        info!(
            entries = p.table.len(),
            meids = p.table.meid_count(),
            table_id = p.id.as_deref().unwrap_or(""),
            "route table published"
        );
        host.publish(p.table);
        host.ready.store(true, Ordering::Release);
        if ack_ok {
            ack(true, p.id.as_deref(), "");
        }
    }

    fn meid_record(&mut self, host: &RtHost, toks: &[&str], ack: &mut AckFn<'_>) {
        match toks[1] {
            "start" => {
                if let Some(stale) = self.pending.take() {
                    debug!("meid map start: dropping incomplete table");
                    ack(false, stale.id.as_deref(), "table not complete");
                }
                let table = host
                    .current()
                    .map(|cur| cur.clone_all())
                    .unwrap_or_else(RouteTable::new);
                self.pending = Some(Pending {
                    table,
                    id: toks.get(2).map(|s| s.to_string()),
                });
            }
            "end" => {
                let p = match self.pending.take() {
                    Some(p) => p,
                    None => return,
                };
                if let Some(expected) = toks.get(2).and_then(|c| c.parse::<u32>().ok()) {
                    if p.table.mupdates != expected {
                        warn!(
                            "meid map update had wrong number of records: received {} expected {}",
                            p.table.mupdates, expected
                        );
                        let reason = format!(
                            "missing table records: expected {} got {}",
                            expected, p.table.mupdates
                        );
                        ack(false, p.id.as_deref(), &reason);
                        return;
                    }
                }
                info!(meids = p.table.meid_count(), "meid map published");
                host.publish(p.table);
                ack(true, p.id.as_deref(), "");
            }
            other => warn!("unrecognised meid_map action: {}", other),
        }
    }

    /// Ingest an `rte`/`mse` record body into the pending table.
    fn build_entry(&mut self, host: &RtHost, ts_field: &str, sub_id: i32, rr_field: &str) {
        let (mtype_txt, filter) = match ts_field.split_once(',') {
            Some((m, f)) => (m.trim(), Some(f)),
            None => (ts_field, None),
        };
        if !host.filter_passes(filter) {
            debug!("entry not included, sender not matched: {}", ts_field);
            return;
        }

        let mtype: i32 = mtype_txt.parse().unwrap_or(0);
        let key = build_rt_key(sub_id, mtype);

        let group_fields: Vec<&str> = rr_field.split(';').map(clip).collect();
        let groups = if group_fields.first() == Some(&"%meid") {
            Vec::new() // destination comes from the message MEID
        } else {
            group_fields
                .iter()
                .map(|gf| {
                    let epts = gf
                        .split(',')
                        .map(str::trim)
                        .filter(|t| !t.is_empty() && !host.is_me(t))
                        .filter_map(|t| host.registry.ensure(t))
                        .collect();
                    RrGroup::new(epts)
                })
                .collect()
        };

        debug!(mtype, sub_id, key, ngroups = groups.len(), "route table entry created");
        if let Some(p) = self.pending.as_mut() {
            p.table.insert(RouteEntry { key, mtype, groups });
        }
    }

    /// Ingest a `del` record: drop the key from the pending table.
    fn trash_entry(&mut self, host: &RtHost, ts_field: &str, sub_id: i32) {
        let (mtype_txt, filter) = match ts_field.split_once(',') {
            Some((m, f)) => (m.trim(), Some(f)),
            None => (ts_field, None),
        };
        if !host.filter_passes(filter) {
            debug!("delete skipped, sender not matched: {}", ts_field);
            return;
        }

        let mtype: i32 = mtype_txt.parse().unwrap_or(0);
        let key = build_rt_key(sub_id, mtype);
        if let Some(p) = self.pending.as_mut() {
            if !p.table.remove(key) {
                debug!(mtype, sub_id, "delete could not find entry");
            }
        }
    }
}

/// Trim whitespace and a trailing comment (a `#` opening a word).
fn clip(field: &str) -> &str {
    let mut s = field.trim();
    if let Some(at) = s.find('#') {
        if at == 0 || s.as_bytes()[at - 1].is_ascii_whitespace() {
            s = s[..at].trim_end();
        }
    }
    s
}
