//! The wire format of segments. All numbers are in network byte order (BE).
//!
//! ```ascii
//! 0: flags (8 bits):
//!    * bit 0-2: kind of segment:
//!      * 000 DATA
//!      * 001 ACK
//!      * 010 CLOSE
//!      * 011 HELLO
//!    * bit 3: RTT - DATA: an RTT probe timestamp follows the header
//!                   ACK: an echoed RTT probe timestamp follows the header
//!    * bit 4: RX_PORTAL_SZ - ACK only: the receiver's window occupancy is present
//!    * bit 5-7: unused, must be 0
//! 1: sequence number (u32). ACK segments are not sequenced and carry 0 here.
//!
//! DATA:
//! 5: RTT probe timestamp (u16, low 16 bits of the sender's millisecond clock) if RTT is set
//! *: payload
//!
//! ACK:
//! 5: echoed RTT probe timestamp (u16) if RTT is set
//! *: receive window occupancy in bytes (u32) if RX_PORTAL_SZ is set
//! *: number of acknowledged ranges (varint)
//! *: (repeated) first and last acknowledged sequence number of a range (u32, u32), inclusive
//!
//! CLOSE, HELLO: [no payload]
//! ```

use std::fmt::{Debug, Formatter};
use std::mem::size_of;
use std::sync::Arc;
use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use crate::buffers::buffer_pool::BufferPool;
use crate::buffers::fixed_buffer::SharedBuf;
use crate::error::{TransportError, TransportResult};

pub const HEADER_LEN: usize = 5;
pub const RTT_PROBE_LEN: usize = 2;

/// Upper bound for the number of sequence numbers covered by a single ACK range. Ranges are
///  processed sequence number by sequence number, so this bounds the work a single datagram
///  can cause.
pub const MAX_ACK_RANGE_SPAN: u32 = 1 << 16;

const KIND_MASK: u8 = 0b0000_0111;
const KIND_DATA: u8 = 0;
const KIND_ACK: u8 = 1;
const KIND_CLOSE: u8 = 2;
const KIND_HELLO: u8 = 3;
const FLAG_RTT: u8 = 0b0000_1000;
const FLAG_RX_PORTAL_SZ: u8 = 0b0001_0000;
const FLAGS_UNUSED: u8 = 0b1110_0000;

/// A closed range of acknowledged sequence numbers, with wrap-around semantics
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AckRange {
    pub start: u32,
    pub end: u32,
}

impl AckRange {
    pub fn new(start: u32, end: u32) -> AckRange {
        AckRange { start, end }
    }

    pub fn single(seq: u32) -> AckRange {
        AckRange { start: seq, end: seq }
    }

    /// number of sequence numbers in the range
    pub fn span(&self) -> u64 {
        self.end.wrapping_sub(self.start) as u64 + 1
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> {
        let start = self.start;
        (0..self.span()).map(move |offs| start.wrapping_add(offs as u32))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SegmentKind {
    Data {
        rtt_probe: Option<u16>,
    },
    Ack {
        ranges: Vec<AckRange>,
        rx_portal_sz: Option<u32>,
        rtt_echo: Option<u16>,
    },
    Close,
    Hello,
}

impl SegmentKind {
    fn flags(&self) -> u8 {
        match self {
            SegmentKind::Data { rtt_probe } => KIND_DATA | rtt_flag(rtt_probe),
            SegmentKind::Ack { rx_portal_sz, rtt_echo, .. } => {
                let rx_flag = if rx_portal_sz.is_some() { FLAG_RX_PORTAL_SZ } else { 0 };
                KIND_ACK | rtt_flag(rtt_echo) | rx_flag
            }
            SegmentKind::Close => KIND_CLOSE,
            SegmentKind::Hello => KIND_HELLO,
        }
    }
}

fn rtt_flag(rtt: &Option<u16>) -> u8 {
    if rtt.is_some() { FLAG_RTT } else { 0 }
}

/// A segment together with the pool buffer holding its wire representation. The segment owns
///  one reference to that buffer; it is released when the segment is dropped.
pub struct Segment {
    pub seq: u32,
    pub kind: SegmentKind,
    wire: SharedBuf,
    payload_offset: usize,
}

impl Debug for Segment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Segment{{seq:{}, kind:{:?}, len:{}}}", self.seq, self.kind, self.wire.len())
    }
}

impl Segment {
    pub fn new_data(seq: u32, rtt_probe: Option<u16>, payload: &[u8], pool: &Arc<BufferPool>) -> TransportResult<Segment> {
        Self::encode(seq, SegmentKind::Data { rtt_probe }, payload, pool)
    }

    pub fn new_ack(ranges: Vec<AckRange>, rx_portal_sz: Option<u32>, rtt_echo: Option<u16>, pool: &Arc<BufferPool>) -> TransportResult<Segment> {
        Self::encode(0, SegmentKind::Ack { ranges, rx_portal_sz, rtt_echo }, &[], pool)
    }

    pub fn new_close(seq: u32, pool: &Arc<BufferPool>) -> TransportResult<Segment> {
        Self::encode(seq, SegmentKind::Close, &[], pool)
    }

    pub fn new_hello(seq: u32, pool: &Arc<BufferPool>) -> TransportResult<Segment> {
        Self::encode(seq, SegmentKind::Hello, &[], pool)
    }

    fn encoded_len(kind: &SegmentKind, payload: &[u8]) -> usize {
        HEADER_LEN + match kind {
            SegmentKind::Data { rtt_probe } => {
                rtt_probe.map(|_| RTT_PROBE_LEN).unwrap_or(0) + payload.len()
            }
            SegmentKind::Ack { ranges, rx_portal_sz, rtt_echo } => {
                rtt_echo.map(|_| RTT_PROBE_LEN).unwrap_or(0)
                    + rx_portal_sz.map(|_| size_of::<u32>()).unwrap_or(0)
                    + 10 // upper bound for the varint range count
                    + ranges.len() * 2 * size_of::<u32>()
            }
            SegmentKind::Close | SegmentKind::Hello => 0,
        }
    }

    fn encode(seq: u32, kind: SegmentKind, payload: &[u8], pool: &Arc<BufferPool>) -> TransportResult<Segment> {
        if Self::encoded_len(&kind, payload) > pool.buf_size() {
            return Err(TransportError::InternalConsistency(format!(
                "{:?} segment with {} payload bytes does not fit a pool buffer of {} bytes", kind, payload.len(), pool.buf_size()
            )));
        }

        let mut buf = pool.acquire();
        buf.put_u8(kind.flags());
        buf.put_u32(seq);

        match &kind {
            SegmentKind::Data { rtt_probe } => {
                if let Some(ts) = rtt_probe {
                    buf.put_u16(*ts);
                }
                buf.put_slice(payload);
            }
            SegmentKind::Ack { ranges, rx_portal_sz, rtt_echo } => {
                if let Some(ts) = rtt_echo {
                    buf.put_u16(*ts);
                }
                if let Some(sz) = rx_portal_sz {
                    buf.put_u32(*sz);
                }
                buf.put_usize_varint(ranges.len());
                for range in ranges {
                    buf.put_u32(range.start);
                    buf.put_u32(range.end);
                }
            }
            SegmentKind::Close | SegmentKind::Hello => {}
        }

        let payload_offset = buf.len() - payload.len();
        Ok(Segment {
            seq,
            kind,
            wire: buf.freeze(),
            payload_offset,
        })
    }

    /// Parses a received datagram. The resulting segment takes over the buffer reference, and
    ///  its payload is a view into that buffer.
    pub fn decode(wire: SharedBuf) -> TransportResult<Segment> {
        let (seq, kind, payload_offset) = {
            let mut parse_buf: &[u8] = wire.as_ref();

            ensure_remaining(parse_buf, HEADER_LEN, "header")?;
            let flags = parse_buf.get_u8();
            let seq = parse_buf.get_u32();

            if flags & FLAGS_UNUSED != 0 {
                return Err(TransportError::malformed(format!("unused flag bits set: {:#010b}", flags)));
            }
            if flags & FLAG_RX_PORTAL_SZ != 0 && flags & KIND_MASK != KIND_ACK {
                return Err(TransportError::malformed("receive window size on a segment other than ACK"));
            }

            let kind = match flags & KIND_MASK {
                KIND_DATA => {
                    let rtt_probe = Self::decode_rtt(&mut parse_buf, flags)?;
                    SegmentKind::Data { rtt_probe }
                }
                KIND_ACK => Self::decode_ack(&mut parse_buf, flags)?,
                KIND_CLOSE => SegmentKind::Close,
                KIND_HELLO => SegmentKind::Hello,
                other => return Err(TransportError::malformed(format!("unknown segment kind {}", other))),
            };

            if !matches!(kind, SegmentKind::Data { .. }) {
                if flags & FLAG_RTT != 0 && !matches!(kind, SegmentKind::Ack { .. }) {
                    return Err(TransportError::malformed("RTT flag on a segment without RTT field"));
                }
                if parse_buf.has_remaining() {
                    return Err(TransportError::malformed(format!("{} unexpected trailing bytes", parse_buf.remaining())));
                }
            }

            (seq, kind, wire.len() - parse_buf.remaining())
        };

        Ok(Segment {
            seq,
            kind,
            wire,
            payload_offset,
        })
    }

    fn decode_rtt(parse_buf: &mut &[u8], flags: u8) -> TransportResult<Option<u16>> {
        if flags & FLAG_RTT == 0 {
            return Ok(None);
        }
        ensure_remaining(parse_buf, RTT_PROBE_LEN, "RTT timestamp")?;
        Ok(Some(parse_buf.get_u16()))
    }

    fn decode_ack(parse_buf: &mut &[u8], flags: u8) -> TransportResult<SegmentKind> {
        let rtt_echo = Self::decode_rtt(parse_buf, flags)?;

        let rx_portal_sz = if flags & FLAG_RX_PORTAL_SZ != 0 {
            ensure_remaining(parse_buf, size_of::<u32>(), "receive window size")?;
            Some(parse_buf.get_u32())
        }
        else {
            None
        };

        let num_ranges = parse_buf.try_get_usize_varint()
            .map_err(|_| TransportError::malformed("invalid ACK range count"))?;
        ensure_remaining(parse_buf, num_ranges.saturating_mul(2 * size_of::<u32>()), "ACK ranges")?;

        let mut ranges = Vec::with_capacity(num_ranges);
        for _ in 0..num_ranges {
            let range = AckRange::new(parse_buf.get_u32(), parse_buf.get_u32());
            if range.span() > MAX_ACK_RANGE_SPAN as u64 {
                return Err(TransportError::malformed(format!("ACK range {:?} exceeds the maximum span", range)));
            }
            ranges.push(range);
        }

        Ok(SegmentKind::Ack { ranges, rx_portal_sz, rtt_echo })
    }

    /// The segment's complete wire representation; cloning it takes a buffer reference
    pub fn wire(&self) -> &SharedBuf {
        &self.wire
    }

    pub fn payload(&self) -> &[u8] {
        &self.wire.as_ref()[self.payload_offset..]
    }

    /// The number of payload bytes this segment occupies in the peer's receive window: payload
    ///  only, excluding header and RTT probe.
    pub fn as_data_size(&self) -> TransportResult<usize> {
        match self.kind {
            SegmentKind::Data { .. } => Ok(self.payload().len()),
            SegmentKind::Close => Ok(0),
            SegmentKind::Ack { .. } | SegmentKind::Hello => Err(TransportError::InternalConsistency(format!(
                "no data size for segment {:?}", self
            ))),
        }
    }
}

fn ensure_remaining(buf: &[u8], required: usize, what: &str) -> TransportResult<()> {
    if buf.remaining() < required {
        return Err(TransportError::malformed(format!(
            "truncated {}: {} bytes required, {} remaining", what, required, buf.remaining()
        )));
    }
    Ok(())
}
