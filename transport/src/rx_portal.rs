use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, trace};
use crate::config::Profile;
use crate::error::{TransportError, TransportResult};
use crate::instrument::TransportInstrument;
use crate::segment::{Segment, SegmentKind};
use crate::sequence::seq_at_or_after;

/// What to acknowledge for a received segment
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RxAck {
    pub seq: u32,
    pub rtt_echo: Option<u16>,
    pub rx_portal_sz: usize,
}

struct RxPortalInner {
    /// sequence number of the next segment to be delivered
    next_seq: u32,
    out_of_order: BTreeMap<u32, Segment>,
    out_of_order_sz: usize,
    /// delivered, but not (completely) read yet
    readable: VecDeque<Segment>,
    read_offset: usize,
    readable_sz: usize,
    /// the peer's Close was delivered
    eof: bool,
    aborted: bool,
    /// receive window occupancy last reported to the peer
    advertised_sz: usize,
}

impl RxPortalInner {
    fn rx_portal_sz(&self) -> usize {
        self.out_of_order_sz + self.readable_sz
    }

    fn deliver_in_order(&mut self) -> bool {
        let mut delivered = false;
        while let Some(segment) = self.out_of_order.remove(&self.next_seq) {
            self.next_seq = self.next_seq.wrapping_add(1);
            delivered = true;

            let payload_len = segment.payload().len();
            match segment.kind {
                SegmentKind::Close => {
                    debug!("delivering close #{}", segment.seq);
                    self.eof = true;
                }
                _ => {
                    self.out_of_order_sz -= payload_len;
                    if payload_len > 0 {
                        self.readable_sz += payload_len;
                        self.readable.push_back(segment);
                    }
                }
            }
        }
        delivered
    }

    /// copies as much readable data into `buf` as fits
    fn copy_readable(&mut self, buf: &mut [u8]) -> usize {
        let mut n = 0;
        while n < buf.len() {
            let Some(front) = self.readable.front() else {
                break;
            };
            let available = &front.payload()[self.read_offset..];
            let chunk_len = available.len().min(buf.len() - n);
            buf[n..n + chunk_len].copy_from_slice(&available[..chunk_len]);
            n += chunk_len;

            if chunk_len == available.len() {
                self.readable.pop_front();
                self.read_offset = 0;
            }
            else {
                self.read_offset += chunk_len;
            }
        }
        self.readable_sz -= n;
        n
    }
}

/// The receiving half of a connection: it puts received segments back in order, holding back
///  segments that arrive ahead of a gap, and hands their payload to readers.
///
/// The number of bytes held here (out of order or delivered but not read) is the receive
///  window occupancy that is reported to the peer with every ack.
pub struct RxPortal {
    inner: Mutex<RxPortalInner>,
    readable: Notify,
    peer: SocketAddr,
    profile: Arc<Profile>,
    instrument: Arc<dyn TransportInstrument>,
}

impl RxPortal {
    pub fn new(start_seq: u32, peer: SocketAddr, profile: Arc<Profile>, instrument: Arc<dyn TransportInstrument>) -> RxPortal {
        RxPortal {
            inner: Mutex::new(RxPortalInner {
                next_seq: start_seq,
                out_of_order: BTreeMap::new(),
                out_of_order_sz: 0,
                readable: VecDeque::new(),
                read_offset: 0,
                readable_sz: 0,
                eof: false,
                aborted: false,
                advertised_sz: 0,
            }),
            readable: Notify::new(),
            peer,
            profile,
            instrument,
        }
    }

    /// Takes a received Data or Close segment, returning the ack to send for it - or `None` if
    ///  the segment was dropped without acknowledging it, leaving it to the peer to retransmit.
    pub async fn rx(&self, segment: Segment) -> Option<RxAck> {
        let rtt_echo = match segment.kind {
            SegmentKind::Data { rtt_probe } => rtt_probe,
            SegmentKind::Close => None,
            SegmentKind::Ack { .. } | SegmentKind::Hello => {
                debug!("rx portal received {:?} - ignoring", segment);
                return None;
            }
        };
        let seq = segment.seq;

        let mut inner = self.inner.lock().await;
        if inner.aborted {
            return None;
        }

        if !seq_at_or_after(seq, inner.next_seq) || inner.out_of_order.contains_key(&seq) {
            trace!("#{} was received before - acknowledging again", seq);
        }
        else {
            let payload_len = segment.payload().len();
            if inner.rx_portal_sz() + payload_len > self.profile.rx_buffer_sz {
                debug!("rx portal for {:?} is full - dropping #{}", self.peer, seq);
                return None;
            }
            if seq != inner.next_seq && inner.out_of_order.len() >= self.profile.reads_q_len {
                debug!("too many segments out of order for {:?} - dropping #{}", self.peer, seq);
                return None;
            }

            trace!("received #{} with {} bytes", seq, payload_len);
            inner.out_of_order.insert(seq, segment);
            inner.out_of_order_sz += payload_len;

            if inner.deliver_in_order() {
                self.readable.notify_waiters();
            }
            self.instrument.rx_portal_sz_changed(self.peer, inner.rx_portal_sz());
        }

        let rx_portal_sz = inner.rx_portal_sz();
        inner.advertised_sz = rx_portal_sz;
        Some(RxAck { seq, rtt_echo, rx_portal_sz })
    }

    /// Reads received data into `buf`, waiting until data is available. `Ok(0)` signals that
    ///  the peer closed the connection and everything was read.
    ///
    /// The second value is the receive window occupancy to report to the peer, if reading
    ///  changed it enough for a sender to be potentially waiting for it.
    pub async fn read(&self, buf: &mut [u8]) -> TransportResult<(usize, Option<usize>)> {
        let mut inner = self.inner.lock().await;
        loop {
            if inner.aborted {
                return Err(TransportError::ConnectionClosed);
            }

            if inner.readable_sz > 0 && !buf.is_empty() {
                let n = inner.copy_readable(buf);
                let rx_portal_sz = inner.rx_portal_sz();
                self.instrument.rx_portal_sz_changed(self.peer, rx_portal_sz);

                let freed = inner.advertised_sz.saturating_sub(rx_portal_sz);
                let window_update = if freed >= self.profile.max_segment_sz || (rx_portal_sz == 0 && freed > 0) {
                    inner.advertised_sz = rx_portal_sz;
                    Some(rx_portal_sz)
                }
                else {
                    None
                };
                return Ok((n, window_update));
            }

            if inner.eof || buf.is_empty() {
                return Ok((0, None));
            }

            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            drop(inner);
            notified.await;
            inner = self.inner.lock().await;
        }
    }

    /// `true` once the peer's Close was delivered
    pub async fn is_eof(&self) -> bool {
        self.inner.lock().await.eof
    }

    pub async fn rx_portal_sz(&self) -> usize {
        self.inner.lock().await.rx_portal_sz()
    }

    /// The current occupancy, recorded as reported to the peer
    pub async fn advertise(&self) -> usize {
        let mut inner = self.inner.lock().await;
        inner.advertised_sz = inner.rx_portal_sz();
        inner.advertised_sz
    }

    pub async fn abort(&self) {
        {
            let mut inner = self.inner.lock().await;
            inner.aborted = true;
            inner.out_of_order.clear();
            inner.out_of_order_sz = 0;
            inner.readable.clear();
            inner.readable_sz = 0;
            inner.read_offset = 0;
        }
        self.readable.notify_waiters();
    }
}
