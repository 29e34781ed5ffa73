//! # Stream Reassembler
//!
//! TCP delivers a byte stream; message boundaries arrive wherever the
//! kernel felt like splitting them. Each connection owns a `River` which
//! accumulates inbound chunks and recovers the length-prefixed frames,
//! regardless of how the 9-byte transport prefix or the body were split
//! across reads. A single chunk may also complete several frames; the
//! reassembler loops until the input is exhausted.
//!
//! A frame whose declared size exceeds the accumulator capacity is
//! consumed from the stream and discarded, with a single warning per
//! connection; the following frame parses normally.

use crate::header::{extract_mlen, TP_SZFIELD_LEN};
use tracing::warn;

/// Extra accumulator room beyond the configured max inbound payload.
pub(crate) const ACCUM_FUDGE: usize = 1024;
/// Frame size floor; anything smaller than the prefix itself is garbage.
const MIN_FRAME: usize = TP_SZFIELD_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RiverState {
    /// No data seen yet; accumulator is allocated on the first chunk.
    New,
    /// Mid-stream, accumulating normally.
    Good,
    /// Stream integrity lost; resynchronise before accumulating again.
    Reset,
}

/// Per-connection reassembly state.
#[derive(Debug)]
pub(crate) struct River {
    state: RiverState,
    accum: Vec<u8>,
    /// Insert point: bytes of the current frame already buffered.
    ipt: usize,
    /// Declared size of the frame in progress; `None` until the prefix is whole.
    msg_size: Option<usize>,
    /// Skip the body of the current frame instead of buffering it.
    drop: bool,
    /// One-shot oversize warning latch.
    notified: bool,
    nbytes: usize,
    fd: u64,
}

impl River {
    pub(crate) fn new(max_ibm: usize, fd: u64) -> River {
        River {
            state: RiverState::New,
            accum: Vec::new(),
            ipt: 0,
            msg_size: None,
            drop: false,
            notified: false,
            nbytes: max_ibm + ACCUM_FUDGE,
            fd,
        }
    }

    /// Feed one chunk from the transport; completed frames land in `out`.
    pub(crate) fn on_data(&mut self, buf: &[u8], out: &mut Vec<Vec<u8>>) {
        if buf.is_empty() {
            return;
        }

        if self.state != RiverState::Good {
            if self.state == RiverState::New {
                self.accum = vec![0u8; self.nbytes];
            }
            // Reset drops whatever was buffered; future work could hunt
            // for the next marker instead
            self.ipt = 0;
            self.msg_size = None;
            self.drop = false;
            self.state = RiverState::Good;
        }

        let mut bidx = 0usize;
        let mut remain = buf.len();

        while remain > 0 {
            let size = match self.msg_size {
                Some(s) => s,
                None => {
                    // the prefix itself may straddle chunk boundaries
                    let need = TP_SZFIELD_LEN - self.ipt;
                    if need > remain {
                        self.accum[self.ipt..self.ipt + remain]
                            .copy_from_slice(&buf[bidx..bidx + remain]);
                        self.ipt += remain;
                        return;
                    }

                    let size = if self.ipt > 0 {
                        self.accum[self.ipt..self.ipt + need]
                            .copy_from_slice(&buf[bidx..bidx + need]);
                        self.ipt += need;
                        bidx += need;
                        remain -= need;
                        extract_mlen(&self.accum)
                    } else {
                        // prefix is wholly inside this chunk; it is copied
                        // with the body below
                        extract_mlen(&buf[bidx..bidx + TP_SZFIELD_LEN])
                    };

                    if size < MIN_FRAME {
                        warn!(fd = self.fd, size, "nonsense frame size on stream; resetting flow");
                        self.state = RiverState::Reset;
                        return;
                    }

                    if size > self.nbytes {
                        if !self.notified {
                            warn!(
                                fd = self.fd,
                                size,
                                max = self.nbytes,
                                "message larger than allocated buffer arrived; dropping"
                            );
                            self.notified = true;
                        }
                        self.drop = true;
                    }

                    self.msg_size = Some(size);
                    size
                }
            };

            if size > self.ipt + remain {
                // frame incomplete; buffer what we have and wait for more
                if !self.drop {
                    self.accum[self.ipt..self.ipt + remain]
                        .copy_from_slice(&buf[bidx..bidx + remain]);
                }
                self.ipt += remain;
                remain = 0;
            } else {
                let need = size - self.ipt;
                if !self.drop {
                    self.accum[self.ipt..size].copy_from_slice(&buf[bidx..bidx + need]);
                    out.push(self.accum[..size].to_vec());
                }

                self.msg_size = None;
                self.ipt = 0;
                self.drop = false;
                bidx += need;
                remain -= need;
            }
        }
    }

    /// Connection went away; nothing buffered survives.
    pub(crate) fn on_disconnect(&mut self) {
        self.state = RiverState::Reset;
        self.ipt = 0;
        self.msg_size = None;
    }
}
