//! # Context and Public API
//!
//! The context is the single top-level object: it owns the listen socket,
//! the async I/O plane, the route table generations, the endpoint
//! registry, the receive ring and the chute arena. Applications create one
//! with [`Context::init`] and drive everything through its methods.
//!
//! ## Threading shape
//!
//! ```text
//! user threads ──► send_msg/rts/mt_call ──► per-connection writer queues
//!                                             (writer tasks drain to TCP)
//! accept task  ──► reader task per conn ──► reassembler ──► dispatcher
//!                                             ├─► receive ring (rcv_msg)
//!                                             └─► chutes (mt_call waiters)
//! collector thread ──► assembler ──► atomic table publish
//! ```
//!
//! The public calls are blocking and safe from any number of application
//! threads. Internally a Tokio runtime owns the sockets: one reader and
//! one writer task per connection, in the same shape for dialed and
//! accepted connections, so return-to-sender traffic flows back over the
//! connection a message arrived on.

use crate::chute::{ChuteTable, LEGACY_CALL_ID};
use crate::config::Config;
use crate::dispatch;
use crate::endpoint::{Endpoint, EndpointRegistry};
use crate::error::{CallError, ErrorKind, InitError, MsgState, RecvError, SendError};
use crate::header::{self, HFL_CALL_MSG, MAX_SRC, MAX_XID};
use crate::mbuf::{BufPool, MbufFlags, MsgBuf};
use crate::river::River;
use crate::rtable::assembler::{Assembler, RtHost};
use crate::rtable::{RouteTable, TableSet};
use crate::send::{self, transmit};
use crate::utils;
use crate::wormhole::WhPool;
use crossbeam::channel as ring;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Default max message size when the caller passes zero.
pub const DEF_MAX_MSG_SIZE: usize = 4096;

const RING_SIZE: usize = 4096;
const POOL_SIZE: usize = 128;
/// Frames a connection's writer queue holds before senders see pushback.
const CONN_QUEUE: usize = 64;
const READ_CHUNK: usize = 8192;
const SOCK_BUF_SIZE: usize = 256 * 1024;

bitflags::bitflags! {
    /// Flags accepted by [`Context::init`].
    pub struct InitFlags: u32 {
        /// Do not start the route table collector thread. The application
        /// (or a test) becomes responsible for seeding tables itself.
        const NOTHREAD = 0x01;
    }
}

pub(crate) struct ConnHandle {
    pub tx: mpsc::Sender<Vec<u8>>,
    pub peer: String,
}

/// Process-wide state shared by API calls, I/O tasks and the collector.
pub(crate) struct Inner {
    pub(crate) cfg: Config,
    my_name: String,
    my_ip: String,
    ip_list: Vec<String>,
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    registry: Arc<EndpointRegistry>,
    tables: Arc<RwLock<TableSet>>,
    rt_ready: Arc<AtomicBool>,
    ring_tx: ring::Sender<MsgBuf>,
    ring_rx: ring::Receiver<MsgBuf>,
    pool: BufPool,
    chutes: ChuteTable,
    conns: Mutex<HashMap<u64, ConnHandle>>,
    fd2ep: Mutex<HashMap<u64, Arc<Endpoint>>>,
    next_fd: AtomicU64,
    pub(crate) wormholes: WhPool,
    send_retries: AtomicI32,
    trace_data_len: AtomicUsize,
    max_plen: usize,
    max_ibm: usize,
    warnings: bool,
    pub(crate) shutdown: AtomicBool,
    ring_warned: AtomicBool,
    pub(crate) vlevel: AtomicI32,
}

impl Inner {
    pub(crate) fn my_name(&self) -> &str {
        &self.my_name
    }

    pub(crate) fn max_ibm(&self) -> usize {
        self.max_ibm
    }

    pub(crate) fn warnings(&self) -> bool {
        self.warnings
    }

    pub(crate) fn send_retries(&self) -> i32 {
        self.send_retries.load(Ordering::Relaxed)
    }

    pub(crate) fn chutes(&self) -> &ChuteTable {
        &self.chutes
    }

    /// Snapshot of the active route table generation.
    pub(crate) fn route_table(&self) -> Option<Arc<RouteTable>> {
        self.tables.read().current.clone()
    }

    pub(crate) fn rt_host(&self) -> RtHost {
        RtHost {
            registry: self.registry.clone(),
            tables: self.tables.clone(),
            ready: self.rt_ready.clone(),
            my_name: self.my_name.clone(),
            ip_list: self.ip_list.clone(),
        }
    }

    pub(crate) fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    pub(crate) fn ring_push(&self, msg: MsgBuf) -> Result<(), MsgBuf> {
        self.ring_tx.try_send(msg).map_err(|e| e.into_inner())
    }

    pub(crate) fn note_ring_drop(&self) -> bool {
        !self.ring_warned.swap(true, Ordering::Relaxed)
    }

    /// Return a buffer's backing store to the free pool.
    pub(crate) fn release(&self, msg: MsgBuf) {
        if !msg.flags.contains(MbufFlags::HUGE) {
            self.pool.give(msg.into_tp_buf());
        }
    }

    /// Allocate with explicit payload and trace geometry.
    pub(crate) fn alloc_like(&self, payload: usize, tr_len: usize) -> MsgBuf {
        MsgBuf::alloc(self.pool.take(), payload, tr_len, &self.my_name, &self.my_ip)
    }

    /// Overlay the source fields with our identity.
    pub(crate) fn stamp_identity(&self, msg: &mut MsgBuf) {
        header::set_src(msg.hdr_mut(), &self.my_name);
        header::set_srcip(msg.hdr_mut(), &self.my_ip);
    }

    pub(crate) fn conn_sender(&self, fd: u64) -> Option<mpsc::Sender<Vec<u8>>> {
        self.conns.lock().get(&fd).map(|c| c.tx.clone())
    }

    /// Disconnect callback: unindex the connection and force the owning
    /// endpoint (if any) to reconnect on its next send.
    pub(crate) fn on_disconnect(&self, fd: u64) {
        let conn = self.conns.lock().remove(&fd);
        let ep = { self.fd2ep.lock().remove(&fd) };
        if let Some(ep) = ep {
            debug!(fd, target = ep.name(), "connection was closed");
            ep.mark_closed();
        } else if let Some(c) = conn {
            debug!(fd, peer = c.peer.as_str(), "inbound connection closed");
        }
    }

    fn take_runtime(&self) -> Option<Runtime> {
        self.runtime.lock().take()
    }
}

/// Wire a connected stream into the I/O plane: allocate its id, start
/// its reader and writer tasks, and index it for return-to-sender.
pub(crate) fn install_conn(
    inner: &Arc<Inner>,
    stream: TcpStream,
    ep: Option<&Arc<Endpoint>>,
) -> (u64, mpsc::Sender<Vec<u8>>) {
    let sock = socket2::SockRef::from(&stream);
    let _ = sock.set_nodelay(true);
    let _ = sock.set_recv_buffer_size(SOCK_BUF_SIZE);
    let _ = sock.set_send_buffer_size(SOCK_BUF_SIZE);

    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();
    let fd = inner.next_fd.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = mpsc::channel(CONN_QUEUE);

    inner.conns.lock().insert(
        fd,
        ConnHandle {
            tx: tx.clone(),
            peer: peer.clone(),
        },
    );
    if let Some(ep) = ep {
        inner.fd2ep.lock().insert(fd, ep.clone());
    }

    debug!(fd, peer = peer.as_str(), "connection installed");
    let (rh, wh) = stream.into_split();
    inner.handle.spawn(conn_reader(inner.clone(), fd, rh));
    inner.handle.spawn(conn_writer(fd, rx, wh));
    (fd, tx)
}

/// Open the endpoint's connection if it is not already open.
///
/// Serialised per endpoint by its gate so racing senders cannot dial
/// twice. A failure streak logs once; the first success after a reported
/// failure logs the recovery.
///
/// Must be called from an application thread, never from inside an I/O
/// task.
pub(crate) fn link2(inner: &Arc<Inner>, ep: &Arc<Endpoint>) -> bool {
    let mut link = ep.link.lock();
    if link.open {
        return true;
    }

    let target = ep.name().to_string();
    if !target.contains(':') {
        if ep.should_notify_failure() {
            warn!("unable to create link: bad target: {}", target);
        }
        return false;
    }

    match inner.handle.block_on(TcpStream::connect(target.as_str())) {
        Ok(stream) => {
            let (fd, tx) = install_conn(inner, stream, Some(ep));
            link.open = true;
            link.fd = Some(fd);
            link.tx = Some(tx);
            if ep.note_success() {
                info!("connection finally established with target: {}", target);
            }
            true
        }
        Err(e) => {
            if ep.should_notify_failure() {
                warn!("unable to connect to target: {}: {}", target, e);
            }
            false
        }
    }
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "accepted connection");
                install_conn(&inner, stream, None);
            }
            Err(e) => {
                if !inner.shutdown.load(Ordering::Relaxed) {
                    error!("listener accept failed: {}", e);
                }
                break;
            }
        }
    }
}

async fn conn_reader(inner: Arc<Inner>, fd: u64, mut half: OwnedReadHalf) {
    let mut river = River::new(inner.max_ibm(), fd);
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut complete = Vec::new();

    loop {
        match half.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                river.on_data(&chunk[..n], &mut complete);
                for raw in complete.drain(..) {
                    dispatch::dispatch(&inner, raw, fd);
                }
            }
            Err(e) => {
                debug!(fd, "connection read failed: {}", e);
                break;
            }
        }
    }
    river.on_disconnect();
    inner.on_disconnect(fd);
}

async fn conn_writer(fd: u64, mut rx: mpsc::Receiver<Vec<u8>>, mut half: OwnedWriteHalf) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = half.write_all(&frame).await {
            debug!(fd, "connection write failed: {}", e);
            break;
        }
    }
}

/// The message routing context. See the module docs for the overall shape.
pub struct Context {
    pub(crate) inner: Arc<Inner>,
}

impl Context {
    /// Initialise the routing environment.
    ///
    /// Opens the listen socket on `port` (default 4560) on the interface
    /// named by `RMR_BIND_IF`, derives the sender identity, and starts the
    /// I/O plane. Unless [`InitFlags::NOTHREAD`] is given, the route table
    /// collector thread is started as well: static seed-file polling when
    /// `RMR_RTG_SVC` disables the route manager, the full request/ack
    /// protocol otherwise.
    ///
    /// `max_msg_size` bounds inbound messages (plus reassembly slack) and
    /// sets the default payload allocation; zero selects the default.
    pub fn init(
        port: Option<u16>,
        max_msg_size: usize,
        flags: InitFlags,
    ) -> Result<Context, InitError> {
        let cfg = Config::from_env(port);
        let port = cfg.port;

        let host = match cfg.src_id.clone() {
            Some(id) => id,
            None => utils::local_host_name().ok_or(InitError::NoHostName)?,
        };
        // an identity given with a port is used verbatim
        let my_name = if host.contains(':') {
            host
        } else {
            format!("{}:{}", host, port)
        };
        if my_name.len() >= MAX_SRC {
            return Err(InitError::IdentityTooLong(my_name));
        }

        let ip_list = utils::interface_ips(port, &cfg.bind_if);
        let my_ip = if cfg.name_only {
            my_name.clone()
        } else {
            utils::default_ip(&ip_list).unwrap_or_else(|| my_name.clone())
        };

        let runtime = Builder::new_multi_thread()
            .enable_all()
            .thread_name("msg-router-io")
            .build()
            .map_err(InitError::Runtime)?;
        let handle = runtime.handle().clone();

        let bind_ip: IpAddr = cfg.bind_if.parse().unwrap_or_else(|_| {
            if cfg.bind_if != "0.0.0.0" {
                warn!(
                    "bind interface {} is not an address; binding all interfaces",
                    cfg.bind_if
                );
            }
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        });
        let bind = SocketAddr::new(bind_ip, port);
        let listener = handle
            .block_on(TcpListener::bind(bind))
            .map_err(|e| InitError::Bind {
                bind: bind.to_string(),
                source: e,
            })?;

        let max_plen = if max_msg_size > 0 {
            max_msg_size
        } else {
            DEF_MAX_MSG_SIZE
        };

        let (ring_tx, ring_rx) = ring::bounded(RING_SIZE);
        let inner = Arc::new(Inner {
            my_name: my_name.clone(),
            my_ip,
            ip_list,
            runtime: Mutex::new(Some(runtime)),
            handle,
            registry: Arc::new(EndpointRegistry::new()),
            tables: Arc::new(RwLock::new(TableSet::default())),
            rt_ready: Arc::new(AtomicBool::new(false)),
            ring_tx,
            ring_rx,
            pool: BufPool::new(POOL_SIZE),
            chutes: ChuteTable::new(),
            conns: Mutex::new(HashMap::new()),
            fd2ep: Mutex::new(HashMap::new()),
            next_fd: AtomicU64::new(1),
            wormholes: WhPool::new(),
            send_retries: AtomicI32::new(1),
            trace_data_len: AtomicUsize::new(0),
            max_plen,
            max_ibm: max_plen,
            warnings: cfg.warnings,
            shutdown: AtomicBool::new(false),
            ring_warned: AtomicBool::new(false),
            vlevel: AtomicI32::new(0),
            cfg,
        });

        info!("message routing library listening on {} as {}", bind, my_name);
        inner.handle.spawn(accept_loop(inner.clone(), listener));

        if !flags.contains(InitFlags::NOTHREAD) {
            let for_rtc = inner.clone();
            if let Err(e) = std::thread::Builder::new()
                .name("msg-router-rtc".to_string())
                .spawn(move || crate::rtable::collector::run(for_rtc))
            {
                warn!("unable to start route table collector thread: {}", e);
            }
        }

        Ok(Context { inner })
    }

    /// Our `host:port` identity as written into outgoing headers.
    pub fn my_name(&self) -> &str {
        self.inner.my_name()
    }

    /// True once a route table has been received and published.
    pub fn ready(&self) -> bool {
        self.inner.rt_ready.load(Ordering::Acquire)
    }

    /// Set the default send retry budget (see [`Context::mtosend_msg`]).
    pub fn set_stimeout(&self, time: i32) {
        self.inner.send_retries.store(time.max(0), Ordering::Relaxed);
    }

    /// Set the trace data length allocated in future message buffers.
    pub fn init_trace(&self, size: usize) {
        self.inner.trace_data_len.store(size, Ordering::Relaxed);
    }

    // ---- allocation ---------------------------------------------------

    /// Allocate a sendable message with `size` payload bytes (0 selects
    /// the context default).
    pub fn alloc_msg(&self, size: usize) -> MsgBuf {
        let payload = if size > 0 { size } else { self.inner.max_plen };
        let tr = self.inner.trace_data_len.load(Ordering::Relaxed);
        self.inner.alloc_like(payload, tr)
    }

    /// Allocate with caller-provided trace data instead of the default
    /// trace size.
    pub fn tralloc_msg(&self, size: usize, tr_data: &[u8]) -> MsgBuf {
        let payload = if size > 0 { size } else { self.inner.max_plen };
        let mut m = self.inner.alloc_like(payload, tr_data.len());
        m.set_trace(tr_data);
        m
    }

    /// Release a message; its backing store feeds future allocations when
    /// pool capacity permits.
    pub fn free_msg(&self, msg: MsgBuf) {
        self.inner.release(msg);
    }

    // ---- send family --------------------------------------------------

    /// Route and send with the context default retry budget.
    pub fn send_msg(&self, mut msg: MsgBuf) -> Result<MsgBuf, SendError> {
        send::scrub_call_markers(&mut msg);
        self.finish_send(send::mtosend(&self.inner, msg, -1))
    }

    /// Route and send with an explicit retry budget.
    ///
    /// A budget of 0 spins briefly without yielding; `n > 0` spins n
    /// epochs with a microsecond yield between them; negative selects the
    /// context default.
    pub fn mtosend_msg(&self, mut msg: MsgBuf, max_to: i32) -> Result<MsgBuf, SendError> {
        send::scrub_call_markers(&mut msg);
        self.finish_send(send::mtosend(&self.inner, msg, max_to))
    }

    fn finish_send(
        &self,
        res: Result<Option<MsgBuf>, SendError>,
    ) -> Result<MsgBuf, SendError> {
        res.map(|fresh| fresh.unwrap_or_else(|| self.alloc_msg(0)))
    }

    /// Return a message to its sender.
    ///
    /// The connection the message arrived on is used when still open;
    /// otherwise the sender is looked up by its IP identity, then by its
    /// name. The source fields are overlaid with our identity for the
    /// flight and restored on the returned buffer, so the buffer can be
    /// returned to the sender again.
    pub fn rts_msg(&self, mut msg: MsgBuf) -> Result<MsgBuf, SendError> {
        let inner = &self.inner;

        // returned messages must never land in a chute; the call id stays
        // so that an mt_call response finds its chute on the caller side
        let flags = msg.hdr_flags() & !HFL_CALL_MSG;
        msg.set_hdr_flags(flags);

        let hold_src = msg.get_src();
        let hold_ip = msg.get_srcip();
        let rts_fd = msg.rts_fd;
        let tr_len = msg.trace_len();
        let pay_cap = msg.payload_size();

        inner.stamp_identity(&mut msg);

        let sent = if let Some(tx) = rts_fd.and_then(|fd| inner.conn_sender(fd)) {
            match transmit(&tx, msg, inner.send_retries()) {
                Ok(()) => Ok(Some(inner.alloc_like(pay_cap, tr_len))),
                Err((m, kind, tp)) => Err(SendError::with_tp(kind, tp, m)),
            }
        } else {
            // connection is gone; fall back to identity routing
            let name = hold_ip.clone().filter(|s| !s.is_empty()).unwrap_or_else(|| hold_src.clone());
            match inner.registry().ensure(&name) {
                Some(ep) => send::send_via_ep(inner, &ep, msg, inner.send_retries()),
                None => Err(SendError::with_tp(ErrorKind::NoEndpoint, libc::ENXIO, msg)),
            }
        };

        match sent {
            Ok(fresh) => {
                let mut m = fresh.unwrap_or_else(|| inner.alloc_like(pay_cap, tr_len));
                header::set_src(m.hdr_mut(), &hold_src);
                if let Some(ip) = &hold_ip {
                    header::set_srcip(m.hdr_mut(), ip);
                }
                m.flags |= MbufFlags::ADDSRC;
                m.rts_fd = rts_fd;
                Ok(m)
            }
            Err(mut e) => {
                if let Some(m) = e.msg.as_mut() {
                    header::set_src(m.hdr_mut(), &hold_src);
                    if let Some(ip) = &hold_ip {
                        header::set_srcip(m.hdr_mut(), ip);
                    }
                    m.flags |= MbufFlags::ADDSRC;
                }
                Err(e)
            }
        }
    }

    // ---- receive family -----------------------------------------------

    /// Block until the next queued message arrives.
    pub fn rcv_msg(&self) -> Result<MsgBuf, RecvError> {
        self.inner
            .ring_rx
            .recv()
            .map_err(|_| RecvError::new(ErrorKind::RcvFailed))
    }

    /// Timed receive. `ms_to` of zero polls; negative blocks forever.
    ///
    /// The deadline is absolute: queued wake-ups and spurious returns do
    /// not extend the wait.
    pub fn torcv_msg(&self, ms_to: i64) -> Result<MsgBuf, RecvError> {
        if ms_to < 0 {
            return self.rcv_msg();
        }
        if ms_to == 0 {
            return match self.inner.ring_rx.try_recv() {
                Ok(m) => Ok(m),
                Err(ring::TryRecvError::Empty) => Err(RecvError::new(ErrorKind::Timeout)),
                Err(ring::TryRecvError::Disconnected) => {
                    Err(RecvError::new(ErrorKind::RcvFailed))
                }
            };
        }

        let deadline = Instant::now() + Duration::from_millis(ms_to as u64);
        match self.inner.ring_rx.recv_deadline(deadline) {
            Ok(m) => Ok(m),
            Err(ring::RecvTimeoutError::Timeout) => Err(RecvError::new(ErrorKind::Timeout)),
            Err(ring::RecvTimeoutError::Disconnected) => {
                Err(RecvError::new(ErrorKind::RcvFailed))
            }
        }
    }

    /// Legacy correlated receive over the normal ring.
    ///
    /// Messages whose transaction id does not begin with `expect` are
    /// pushed back onto the ring; after `allow2queue` of those the wait
    /// gives up with a timeout.
    pub fn rcv_specific(&self, expect: &[u8], allow2queue: usize) -> Result<MsgBuf, RecvError> {
        if expect.is_empty() {
            return self.rcv_msg();
        }
        let n = expect.len().min(MAX_XID);

        let mut queued = 0;
        while queued < allow2queue {
            let m = self.rcv_msg()?;
            if m.xaction()[..n] == expect[..n] {
                debug!(queued, "rcv_specific matched");
                return Ok(m);
            }
            if self.inner.ring_push(m).is_err() {
                return Err(RecvError::new(ErrorKind::RcvFailed));
            }
            queued += 1;
        }
        Err(RecvError::new(ErrorKind::Timeout))
    }

    // ---- call family --------------------------------------------------

    /// Correlated request/response with explicit chute id.
    ///
    /// `call_id` must be between 2 and 255; each concurrent caller uses
    /// its own id. The message's transaction id is what the response must
    /// carry. `ms_to` bounds the wait; negative waits forever.
    pub fn mt_call(&self, msg: MsgBuf, call_id: u8, ms_to: i64) -> Result<MsgBuf, CallError> {
        if call_id < 2 {
            return Err(CallError::with_msg(ErrorKind::BadArg, msg));
        }
        self.mt_call_inner(msg, call_id, ms_to)
    }

    /// Legacy single-threaded call: reserved chute, one second deadline.
    pub fn call(&self, msg: MsgBuf) -> Result<MsgBuf, CallError> {
        self.mt_call_inner(msg, LEGACY_CALL_ID, 1000)
    }

    fn mt_call_inner(&self, mut msg: MsgBuf, call_id: u8, ms_to: i64) -> Result<MsgBuf, CallError> {
        let inner = &self.inner;
        let chute = inner.chutes().get(call_id);

        // a response that straggled in after a previous timeout dies here
        if let Some(stale) = chute.arm(msg.xaction()) {
            inner.release(stale);
        }

        msg.set_hdr_flags(msg.hdr_flags() | HFL_CALL_MSG);
        msg.set_call_id(call_id);
        msg.flags |= MbufFlags::NOALLOC;

        // deadline covers send plus wait, computed before either
        let deadline = if ms_to >= 0 {
            Some(Instant::now() + Duration::from_millis(ms_to as u64))
        } else {
            None
        };

        if let Err(mut e) = send::mtosend(inner, msg, 0) {
            return match e.msg.take() {
                Some(mut m) => {
                    m.flags &= !MbufFlags::NOALLOC;
                    Err(CallError::with_msg(e.kind, m))
                }
                None => Err(CallError::new(e.kind)),
            };
        }

        match chute.wait(deadline, |stray| inner.release(stray)) {
            Some(mut m) => {
                m.state = MsgState::Ok;
                Ok(m)
            }
            None => Err(CallError::new(ErrorKind::Timeout)),
        }
    }

    // ---- route table --------------------------------------------------

    /// Feed route table records directly, bypassing the collector.
    ///
    /// The text uses the same record grammar as the route manager and the
    /// seed file; a complete `start`..`end` sequence publishes a table.
    /// Useful for tests and for applications that manage their own
    /// routing.
    pub fn load_route_table(&self, text: &str) {
        let host = self.inner.rt_host();
        let mut asm = Assembler::new();
        asm.consume_text(&host, text, &mut |_, _, _| {});
    }

    // ---- shutdown -----------------------------------------------------

    /// Stop the context: collector and I/O tasks exit, the listen socket
    /// closes. Messages already queued remain readable.
    pub fn close(&self) {
        self.inner.shutdown.store(true, Ordering::Relaxed);
        if let Some(rt) = self.inner.take_runtime() {
            rt.shutdown_background();
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.close();
    }
}
