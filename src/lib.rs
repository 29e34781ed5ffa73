//! # msg-router
//!
//! A message-routing transport library: applications link it to exchange
//! discrete, typed messages with peers over TCP, where the destination of
//! each message is chosen from a dynamically updated route table keyed on
//! `(message type, subscription id)` rather than by an address the sender
//! supplies.
//!
//! The library offers non-blocking send with round-robin distribution,
//! blocking and timed receive, correlated request/response with
//! transaction-id matching, direct point-to-point channels (wormholes),
//! and return-to-sender on previously received messages. Route tables are
//! pushed by a route manager service (or seeded from a file) and swap in
//! atomically under live traffic.
//!
//! ```no_run
//! use msg_router::{Context, InitFlags};
//!
//! let ctx = Context::init(Some(4560), 0, InitFlags::empty())?;
//! let mut msg = ctx.alloc_msg(256);
//! msg.mtype = 1001;
//! msg.str2payload("hello out there")?;
//! let _next = ctx.send_msg(msg);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod error;
pub mod header;
pub mod logging;
pub mod mbuf;
pub mod utils;

mod chute;
mod context;
mod dispatch;
mod endpoint;
mod river;
mod rtable;
mod send;
mod wormhole;

pub use chute::MAX_CALL_ID;
pub use context::{Context, InitFlags, DEF_MAX_MSG_SIZE};
pub use error::{CallError, ErrorKind, InitError, MsgState, RecvError, SendError, WormholeError};
pub use logging::init_logging;
pub use mbuf::MsgBuf;
pub use wormhole::Whid;

/// The current version of the library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values.
pub mod defaults {
    pub use crate::config::{DEF_COMM_PORT, DEF_CTL_PORT, DEF_RTG_SVC, DEF_RTREQ_FREQ};
    pub use crate::context::DEF_MAX_MSG_SIZE;
}
