//! # Route Table Collector
//!
//! The background thread that keeps the route table fresh. Two modes:
//!
//! - **Static**: no route manager is configured; the seed file named by
//!   `RMR_SEED_RT` is re-read once a minute so route edits on disk take
//!   effect on a live process. No acks are sent for file loads.
//! - **Dynamic**: a private context is opened on the control port and a
//!   wormhole dialed to the route manager. Tables are requested on a
//!   cadence; records arrive as ordinary messages and every completed (or
//!   rejected) table is acknowledged back to the sender via
//!   return-to-sender, so the manager can use a call to push updates.
//!
//! The collector is an ordinary user of the public API; everything it does
//! an application could do through [`Context::load_route_table`].

use crate::config::STATIC_POLL_SECS;
use crate::context::{Context, Inner, InitFlags, DEF_MAX_MSG_SIZE};
use crate::header::UNSET_SUBID;
use crate::logging::read_vlevel;
use crate::mbuf::MsgBuf;
use crate::rtable::assembler::{Assembler, RtHost};
use crate::utils;
use crate::wormhole::Whid;
use std::fs;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Message type carrying route table records.
pub(crate) const RMRRM_TABLE_DATA: i32 = 20;
/// Message type of our table request.
pub(crate) const RMRRM_REQ_TABLE: i32 = 21;
/// Message type of the table state (ack/nack) report.
pub(crate) const RMRRM_TABLE_STATE: i32 = 22;

/// Seconds between reconnect attempts to the route manager.
const RECONNECT_PAUSE: u64 = 2;

pub(crate) fn run(inner: Arc<Inner>) {
    match inner.cfg.rtg_svc.clone() {
        None => run_static(&inner),
        Some(addr) => run_dynamic(&inner, &addr),
    }
    debug!("route table collector exiting");
}

fn refresh_vlevel(inner: &Inner) -> i32 {
    let v = inner
        .cfg
        .vctl_file
        .as_deref()
        .map(read_vlevel)
        .unwrap_or(0);
    inner.vlevel.store(v, Ordering::Relaxed);
    v
}

/// Read the seed file, if one is named, into the assembler. File loads
/// never ack: there is nobody to ack to.
fn read_seed(inner: &Inner, host: &RtHost, asm: &mut Assembler) {
    let path = match &inner.cfg.seed_rt {
        Some(p) => p,
        None => return,
    };
    match fs::read_to_string(path) {
        Ok(text) => {
            if !text.is_empty() && !text.ends_with('\n') {
                warn!(
                    "seed route table not newline terminated (file missing final newline?): {}",
                    path.display()
                );
            }
            asm.consume_text(host, &text, &mut |_, _, _| {});
            debug!("seed route table parsed: {}", path.display());
        }
        Err(e) => {
            warn!("seed route table could not be opened: {}: {}", path.display(), e);
        }
    }
}

fn sleep_interruptible(inner: &Inner, secs: u64) {
    for _ in 0..secs {
        if inner.shutdown.load(Ordering::Relaxed) {
            return;
        }
        std::thread::sleep(Duration::from_secs(1));
    }
}

fn run_static(inner: &Inner) {
    info!("route table collector running in static file mode");
    let host = inner.rt_host();
    let mut asm = Assembler::new();

    while !inner.shutdown.load(Ordering::Relaxed) {
        refresh_vlevel(inner);
        read_seed(inner, &host, &mut asm);
        log_table_stats(inner);
        sleep_interruptible(inner, STATIC_POLL_SECS);
    }
}

/// Verbose-mode table dump, driven by the control-file level.
fn log_table_stats(inner: &Inner) {
    if inner.vlevel.load(Ordering::Relaxed) > 0 {
        if let Some(rt) = inner.route_table() {
            rt.log_stats();
        }
    }
}

fn run_dynamic(inner: &Inner, rtg_addr: &str) {
    let host = inner.rt_host();
    let mut asm = Assembler::new();

    // seed once so routing can start before the manager answers
    refresh_vlevel(inner);
    read_seed(inner, &host, &mut asm);

    let pctx = match Context::init(
        Some(inner.cfg.ctl_port),
        DEF_MAX_MSG_SIZE,
        InitFlags::NOTHREAD,
    ) {
        Ok(c) => c,
        Err(e) => {
            error!("unable to open private context for route collector: {}", e);
            return;
        }
    };

    info!(
        "route table collector talking to {} from control port {}",
        rtg_addr, inner.cfg.ctl_port
    );

    let freq = Duration::from_secs(inner.cfg.rtreq_freq.max(1));
    let mut whid: Option<Whid> = None;
    let mut last_req: Option<Instant> = None;

    while !inner.shutdown.load(Ordering::Relaxed) {
        refresh_vlevel(inner);

        if whid.is_none() {
            match pctx.wh_open(rtg_addr) {
                Ok(id) => {
                    whid = Some(id);
                    last_req = None; // request immediately on a new session
                }
                Err(e) => {
                    debug!("route manager not reachable ({}); will retry", e);
                    sleep_interruptible(inner, RECONNECT_PAUSE);
                    continue;
                }
            }
        }

        if let Some(id) = whid {
            let due = last_req.map(|t| t.elapsed() >= freq).unwrap_or(true);
            if due {
                if send_update_req(&pctx, inner, id) {
                    last_req = Some(Instant::now());
                } else {
                    pctx.wh_close(id);
                    whid = None;
                    continue;
                }
            }
        }

        match pctx.torcv_msg(1000) {
            Ok(msg) => {
                handle_table_msg(&pctx, &host, &mut asm, whid, msg);
                log_table_stats(inner);
            }
            Err(e) if e.kind == crate::error::ErrorKind::Timeout => {}
            Err(e) => {
                debug!("collector receive failed: {}", e);
                sleep_interruptible(inner, 1);
            }
        }
    }
}

/// Ask the route manager for a table: `"<name> ts=<seconds>\n"`.
fn send_update_req(pctx: &Context, inner: &Inner, whid: Whid) -> bool {
    let mut msg = pctx.alloc_msg(1024);
    msg.mtype = RMRRM_REQ_TABLE;
    msg.sub_id = 0;
    let payload = format!("{} ts={}\n", inner.my_name(), utils::current_timestamp_secs());
    if msg.str2payload(&payload).is_err() {
        pctx.free_msg(msg);
        return false;
    }

    info!("requesting table: ({})", payload.trim_end());
    match pctx.wh_send_msg(whid, msg) {
        Ok(fresh) => {
            pctx.free_msg(fresh);
            true
        }
        Err(e) => {
            info!("table request send failed: {}", e.kind);
            if let Some(m) = e.into_msg() {
                pctx.free_msg(m);
            }
            false
        }
    }
}

/// Ingest one message worth of table records, acking through the message
/// itself so the response reaches the thread that sent the request.
fn handle_table_msg(
    pctx: &Context,
    host: &RtHost,
    asm: &mut Assembler,
    whid: Option<Whid>,
    msg: MsgBuf,
) {
    if msg.mtype != RMRRM_TABLE_DATA {
        debug!(mtype = msg.mtype, "collector ignoring unexpected message");
        pctx.free_msg(msg);
        return;
    }

    let text = String::from_utf8_lossy(&msg.payload()[..msg.len()]).into_owned();
    let mut carrier = Some(msg);

    asm.consume_text(host, &text, &mut |ok, table_id, reason| {
        send_rt_ack(pctx, whid, &mut carrier, ok, table_id, reason);
    });

    if let Some(m) = carrier.take() {
        pctx.free_msg(m);
    }
}

/// Report table state to the route manager: `"OK <id>\n"` or
/// `"ERR <id> <reason>\n"`. The first ack of a message rides back via
/// return-to-sender; any further acks use the wormhole.
fn send_rt_ack(
    pctx: &Context,
    whid: Option<Whid>,
    carrier: &mut Option<MsgBuf>,
    ok: bool,
    table_id: Option<&str>,
    reason: &str,
) {
    let state = if ok { "OK" } else { "ERR" };
    let id = table_id.unwrap_or("<id-missing>");
    let payload = if reason.is_empty() {
        format!("{} {}\n", state, id)
    } else {
        format!("{} {} {}\n", state, id, reason)
    };

    info!("sending table state: ({})", payload.trim_end());

    match carrier.take() {
        Some(mut m) => {
            m.realloc_payload(1024, false);
            m.mtype = RMRRM_TABLE_STATE;
            m.sub_id = UNSET_SUBID;
            if m.str2payload(&payload).is_err() {
                pctx.free_msg(m);
                return;
            }
            match pctx.rts_msg(m) {
                Ok(fresh) => pctx.free_msg(fresh),
                Err(e) => {
                    warn!("unable to send table state: {}", e.kind);
                    if let Some(m) = e.into_msg() {
                        pctx.free_msg(m);
                    }
                }
            }
        }
        None => {
            let id = match whid {
                Some(id) => id,
                None => return,
            };
            let mut m = pctx.alloc_msg(1024);
            m.mtype = RMRRM_TABLE_STATE;
            m.sub_id = UNSET_SUBID;
            if m.str2payload(&payload).is_err() {
                pctx.free_msg(m);
                return;
            }
            match pctx.wh_send_msg(id, m) {
                Ok(fresh) => pctx.free_msg(fresh),
                Err(e) => {
                    warn!("unable to send table state: {}", e.kind);
                    if let Some(m) = e.into_msg() {
                        pctx.free_msg(m);
                    }
                }
            }
        }
    }
}
