//! # Error Model
//!
//! Structured errors for every public operation. The original design used a
//! thread-local error indicator next to a state code carried in the message
//! buffer; here each API returns a `Result` and the transport-specific
//! diagnostic integer rides along in a `tp_state` field (the raw OS error
//! where one exists, zero otherwise).
//!
//! Send-type failures hand the message buffer back inside the error so the
//! caller can retry or release it; the buffer is never silently lost.

use crate::mbuf::MsgBuf;
use thiserror::Error;

/// Failure kinds surfaced to applications.
///
/// These cover every non-OK condition the library reports; the per-call
/// error structs below narrow which kinds a given operation can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorKind {
    #[error("argument was missing, out of range, or unusable")]
    BadArg,
    #[error("no endpoint could be selected for the message")]
    NoEndpoint,
    #[error("message had no payload")]
    Empty,
    #[error("message did not contain a valid header")]
    NoHeader,
    #[error("send failed")]
    SendFailed,
    #[error("unable to send call message")]
    CallFailed,
    #[error("no wormholes are open")]
    NoWhOpen,
    #[error("wormhole id is not valid")]
    BadWhId,
    #[error("operation would overrun a buffer or field")]
    Overflow,
    #[error("transient transport failure; retry the operation")]
    Retry,
    #[error("receive failed")]
    RcvFailed,
    #[error("operation timed out")]
    Timeout,
    #[error("message has no transport buffer")]
    Unset,
    #[error("received message was truncated")]
    Trunc,
    #[error("initialisation failed")]
    InitFailed,
    #[error("operation is not supported")]
    NotSupported,
}

/// Receive-path state recorded on a message buffer.
///
/// `Trunc` flags a message whose declared payload length exceeded the
/// received buffer; the length is capped and the payload is usable up to
/// the capped length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MsgState {
    /// Buffer allocated but not yet populated by a receive or send.
    #[default]
    Unset,
    Ok,
    Trunc,
}

/// Error returned by the send-family calls.
///
/// The message buffer is returned in `msg` whenever it survived the failure
/// (always, except for argument errors where no buffer was supplied). On
/// `Retry` the buffer is intact and may be resent as is.
#[derive(Debug, Error)]
#[error("send error: {kind}")]
pub struct SendError {
    pub kind: ErrorKind,
    /// Raw OS error from the transport layer, zero when not applicable.
    pub tp_state: i32,
    pub msg: Option<MsgBuf>,
}

impl SendError {
    pub(crate) fn new(kind: ErrorKind, msg: MsgBuf) -> Self {
        SendError {
            kind,
            tp_state: 0,
            msg: Some(msg),
        }
    }

    pub(crate) fn with_tp(kind: ErrorKind, tp_state: i32, msg: MsgBuf) -> Self {
        SendError {
            kind,
            tp_state,
            msg: Some(msg),
        }
    }

    /// Take the failed message back for retry or release.
    pub fn into_msg(self) -> Option<MsgBuf> {
        self.msg
    }
}

/// Error returned by the receive-family calls.
#[derive(Debug, Error)]
#[error("receive error: {kind}")]
pub struct RecvError {
    pub kind: ErrorKind,
}

impl RecvError {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        RecvError { kind }
    }
}

/// Error returned by `mt_call` and the legacy `call` wrapper.
///
/// A send-stage failure carries the original request buffer back so the
/// caller may retry the call.
#[derive(Debug, Error)]
#[error("call error: {kind}")]
pub struct CallError {
    pub kind: ErrorKind,
    pub msg: Option<MsgBuf>,
}

impl CallError {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        CallError { kind, msg: None }
    }

    pub(crate) fn with_msg(kind: ErrorKind, msg: MsgBuf) -> Self {
        CallError {
            kind,
            msg: Some(msg),
        }
    }
}

/// Errors from wormhole management calls.
#[derive(Debug, Error)]
pub enum WormholeError {
    #[error("no wormholes are open")]
    NotOpen,
    #[error("wormhole id {0} is not valid")]
    BadId(usize),
    #[error("endpoint connection is not open")]
    NotConnected,
    #[error("unable to connect to {target}")]
    Connect { target: String },
    #[error("target was empty or unusable")]
    BadTarget,
}

/// Errors from context initialisation.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("unable to bind listen socket on {bind}: {source}")]
    Bind {
        bind: String,
        source: std::io::Error,
    },
    #[error("unable to start the async runtime: {0}")]
    Runtime(std::io::Error),
    #[error("local host name could not be determined")]
    NoHostName,
    #[error("identity {0} exceeds the header source field")]
    IdentityTooLong(String),
}
