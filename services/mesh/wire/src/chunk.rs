//! Message fragmentation for small link writes.
//!
//! A logical message larger than one link write is sent as a first fragment
//! carrying the full [`PacketHeader`] followed by continuation fragments
//! carrying a one-byte [`ContinuationHeader`]. Every fragment but the last
//! has its `fragmented` flag set.
//!
//! The receiving side keeps one [`Reassembler`] per link. A chunk is taken as
//! a new first fragment when nothing is being reassembled or when its message
//! type differs from the message in progress; otherwise it continues the
//! message in progress. A new first fragment silently replaces an incomplete
//! message, so a partial message is never delivered.

use bytes::{BufMut, Bytes, BytesMut};
use smallvec::SmallVec;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::header::{
    ContinuationHeader, PacketHeader, CONTINUATION_HEADER_SIZE, PACKET_HEADER_SIZE,
};
use crate::WireError;

/// Link write unit of the original radio stack
pub const DEFAULT_WRITE_UNIT: usize = 20;

/// Default limit for a reassembled message
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 2048;

/// Default lifetime of an incomplete message
pub const DEFAULT_REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Encoded fragments of one logical message
pub type Fragments = SmallVec<[Bytes; 4]>;

/// Splits logical messages into link writes
#[derive(Debug, Clone, Copy)]
pub struct Fragmenter {
    write_unit: usize,
}

impl Fragmenter {
    /// Create a fragmenter for a link write unit; it must exceed the header size
    pub fn new(write_unit: usize) -> Result<Self, WireError> {
        if write_unit <= PACKET_HEADER_SIZE {
            return Err(WireError::InvalidWriteUnit(write_unit));
        }
        Ok(Self { write_unit })
    }

    /// Link write unit in bytes
    pub fn write_unit(&self) -> usize {
        self.write_unit
    }

    /// Payload bytes carried by the first fragment
    pub fn first_capacity(&self) -> usize {
        self.write_unit - PACKET_HEADER_SIZE
    }

    /// Payload bytes carried by each continuation fragment
    pub fn continuation_capacity(&self) -> usize {
        self.write_unit - CONTINUATION_HEADER_SIZE
    }

    /// Number of link writes needed for a payload of `len` bytes
    pub fn fragment_count(&self, len: usize) -> usize {
        let rest = len.saturating_sub(self.first_capacity());
        1 + rest.div_ceil(self.continuation_capacity())
    }

    /// Split a payload into link writes
    ///
    /// The `fragmented` flag of `header` is ignored and recomputed.
    pub fn fragment(&self, header: PacketHeader, payload: &[u8]) -> Fragments {
        let mut fragments = Fragments::new();

        let first_len = payload.len().min(self.first_capacity());
        let mut first = header;
        first.fragmented = payload.len() > first_len;

        let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE + first_len);
        first.encode(&mut buf);
        buf.put_slice(&payload[..first_len]);
        fragments.push(buf.freeze());

        let mut offset = first_len;
        while offset < payload.len() {
            let end = (offset + self.continuation_capacity()).min(payload.len());
            let continuation = ContinuationHeader::new(end < payload.len(), header.message_type);

            let mut buf = BytesMut::with_capacity(CONTINUATION_HEADER_SIZE + end - offset);
            continuation.encode(&mut buf);
            buf.put_slice(&payload[offset..end]);
            fragments.push(buf.freeze());

            offset = end;
        }

        trace!(
            "Fragmented type {} message of {} bytes into {} writes",
            header.message_type,
            payload.len(),
            fragments.len()
        );
        fragments
    }
}

/// A complete message delivered by the reassembler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalMessage {
    /// Header of the first fragment, with `fragmented` cleared
    pub header: PacketHeader,
    /// Concatenated payload of all fragments
    pub payload: Bytes,
}

/// Limits applied while reassembling
#[derive(Debug, Clone, Copy)]
pub struct ReassemblyConfig {
    /// Largest payload accepted for one logical message
    pub max_message_size: usize,
    /// Incomplete messages older than this are dropped by [`Reassembler::expire`]
    pub timeout: Duration,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            timeout: DEFAULT_REASSEMBLY_TIMEOUT,
        }
    }
}

#[derive(Debug)]
enum ReassemblyState {
    Idle,
    Collecting {
        header: PacketHeader,
        buf: BytesMut,
        started: Instant,
    },
    /// Rejected message whose remaining fragments are dropped
    Discarding { message_type: u8, started: Instant },
}

/// Per-link reassembly context
///
/// While a message is being collected, a chunk counts as a new first
/// fragment only if its type differs from that message. The wire carries
/// nothing else to tell the two apart, so a same-type message that starts
/// mid-reassembly is taken as a continuation: its header bytes and payload
/// are appended to the old message, which is then delivered as one payload.
#[derive(Debug)]
pub struct Reassembler {
    config: ReassemblyConfig,
    state: ReassemblyState,
}

impl Reassembler {
    /// Create a reassembler
    pub fn new(config: ReassemblyConfig) -> Self {
        Self {
            config,
            state: ReassemblyState::Idle,
        }
    }

    /// Whether a message is partially received
    pub fn in_progress(&self) -> bool {
        !matches!(self.state, ReassemblyState::Idle)
    }

    /// Drop any partial message
    pub fn reset(&mut self) {
        self.state = ReassemblyState::Idle;
    }

    /// Drop a partial message older than the configured timeout
    pub fn expire(&mut self, now: Instant) -> bool {
        let started = match &self.state {
            ReassemblyState::Idle => return false,
            ReassemblyState::Collecting { started, .. }
            | ReassemblyState::Discarding { started, .. } => *started,
        };
        if now.saturating_duration_since(started) >= self.config.timeout {
            debug!("Reassembly timed out after {:?}", self.config.timeout);
            self.reset();
            true
        } else {
            false
        }
    }

    /// Feed one link write
    ///
    /// Returns the logical message once its last fragment has arrived.
    pub fn push(&mut self, chunk: Bytes, now: Instant) -> Result<Option<LogicalMessage>, WireError> {
        let lead = ContinuationHeader::peek(&chunk)?;

        let continues = match &self.state {
            ReassemblyState::Idle => false,
            ReassemblyState::Collecting { header, .. } => header.message_type == lead.message_type,
            ReassemblyState::Discarding { message_type, .. } => *message_type == lead.message_type,
        };

        if continues {
            self.push_continuation(lead, chunk)
        } else {
            self.push_first(chunk, now)
        }
    }

    fn push_first(&mut self, chunk: Bytes, now: Instant) -> Result<Option<LogicalMessage>, WireError> {
        if chunk.len() < PACKET_HEADER_SIZE {
            return Err(WireError::MalformedHeader {
                needed: PACKET_HEADER_SIZE,
                got: chunk.len(),
            });
        }

        let mut header = PacketHeader::decode(&mut &chunk[..])?;
        if self.in_progress() {
            warn!(
                "New type {} message from node {} replaces an incomplete message",
                header.message_type, header.sender
            );
            self.reset();
        }

        let payload = chunk.slice(PACKET_HEADER_SIZE..);
        if payload.len() > self.config.max_message_size {
            return Err(self.overflow(header.fragmented, header.message_type, payload.len(), now));
        }

        if !header.fragmented {
            return Ok(Some(LogicalMessage { header, payload }));
        }

        trace!(
            "Started reassembly of type {} from node {}",
            header.message_type,
            header.sender
        );
        header.fragmented = false;
        let mut buf = BytesMut::with_capacity(payload.len() * 2);
        buf.extend_from_slice(&payload);
        self.state = ReassemblyState::Collecting {
            header,
            buf,
            started: now,
        };
        Ok(None)
    }

    fn push_continuation(
        &mut self,
        lead: ContinuationHeader,
        chunk: Bytes,
    ) -> Result<Option<LogicalMessage>, WireError> {
        let state = std::mem::replace(&mut self.state, ReassemblyState::Idle);
        match state {
            ReassemblyState::Discarding {
                message_type,
                started,
            } => {
                if lead.fragmented {
                    self.state = ReassemblyState::Discarding {
                        message_type,
                        started,
                    };
                }
                trace!("Dropped continuation of a rejected message");
                Ok(None)
            }
            ReassemblyState::Collecting {
                header,
                mut buf,
                started,
            } => {
                let data = &chunk[CONTINUATION_HEADER_SIZE..];
                let size = buf.len() + data.len();
                if size > self.config.max_message_size {
                    return Err(self.overflow(lead.fragmented, header.message_type, size, started));
                }
                buf.extend_from_slice(data);

                if lead.fragmented {
                    self.state = ReassemblyState::Collecting {
                        header,
                        buf,
                        started,
                    };
                    return Ok(None);
                }

                trace!(
                    "Reassembled type {} message of {} bytes",
                    header.message_type,
                    buf.len()
                );
                Ok(Some(LogicalMessage {
                    header,
                    payload: buf.freeze(),
                }))
            }
            ReassemblyState::Idle => Ok(None),
        }
    }

    /// Reject the current message and drop its remaining fragments
    fn overflow(&mut self, more: bool, message_type: u8, size: usize, started: Instant) -> WireError {
        warn!(
            "Dropping type {} message: {} bytes exceeds limit of {}",
            message_type, size, self.config.max_message_size
        );
        self.state = if more {
            ReassemblyState::Discarding {
                message_type,
                started,
            }
        } else {
            ReassemblyState::Idle
        };
        WireError::ReassemblyOverflow {
            size,
            max: self.config.max_message_size,
        }
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(ReassemblyConfig::default())
    }
}
