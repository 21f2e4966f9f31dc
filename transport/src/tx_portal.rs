//! The sending half of a connection.
//!
//! The portal is the window of bytes that may be in flight (sent but not acknowledged) at any
//!  given time. Its capacity adapts to the network in the spirit of TCP's congestion avoidance:
//!  it grows additively with successfully acknowledged bytes, and it shrinks multiplicatively
//!  when duplicate acks or retransmissions pile up. Admission is further limited by the peer's
//!  advertised receive window occupancy.
//!
//! All mutable state (including the retransmission monitor) lives behind a single lock. Writers
//!  that do not fit into the portal wait on a broadcast notification that is triggered by every
//!  event that may free capacity, and then re-check their admission condition.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, trace, warn};
use crate::buffers::buffer_pool::BufferPool;
use crate::buffers::fixed_buffer::SharedBuf;
use crate::config::Profile;
use crate::error::{TransportError, TransportResult};
use crate::instrument::TransportInstrument;
use crate::retx_monitor::RetxMonitor;
use crate::segment::{AckRange, Segment, RTT_PROBE_LEN};
use crate::send_pipeline::SendSocket;
use crate::sequence::Sequence;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TxPortalState {
    Open,
    /// A Close segment with this sequence number was sent and is waiting for its ack
    CloseWait(u32),
    Closed,
    Aborted,
}

/// A snapshot of a portal's internals
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxPortalStats {
    pub state: TxPortalState,
    pub capacity: usize,
    pub tx_portal_sz: usize,
    pub rx_portal_sz: Option<usize>,
    pub num_in_flight: usize,
    pub success_ct: u32,
    pub success_accum: usize,
    pub dup_ack_ct: u32,
    pub retx_ct: u32,
    pub retx_add_ms: u64,
    pub rtt_ms: Option<u64>,
}

struct TxPortalInner {
    state: TxPortalState,
    in_flight: BTreeMap<u32, Segment>,
    capacity: usize,
    /// sum of the data sizes of all segments in `in_flight`
    tx_portal_sz: usize,
    /// `None` until the peer reports its receive window occupancy for the first time
    rx_portal_sz: Option<usize>,
    success_ct: u32,
    success_accum: usize,
    dup_ack_ct: u32,
    retx_ct: u32,
    last_rtt_probe: Instant,
    /// when to ask the peer for its receive window next, while stalled on it
    window_query_at: Option<Instant>,
    monitor: RetxMonitor,
    profile: Arc<Profile>,
    peer: SocketAddr,
    instrument: Arc<dyn TransportInstrument>,
}

impl TxPortalInner {
    fn ensure_open(&self) -> TransportResult<()> {
        match self.state {
            TxPortalState::Open => Ok(()),
            _ => Err(TransportError::ConnectionClosed),
        }
    }

    fn can_admit(&self, segment_sz: usize) -> bool {
        let capacity = self.capacity as i64;
        let local_headroom = capacity - (self.tx_portal_sz + segment_sz) as i64;
        let remote_headroom = capacity - self.rx_portal_sz.map(|sz| sz as i64).unwrap_or(-1);
        local_headroom.min(remote_headroom) >= 0
    }

    fn is_rtt_probe_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_rtt_probe) > self.profile.rtt_probe_interval()
    }

    fn process_acks(&mut self, ranges: &[AckRange]) -> TransportResult<()> {
        for range in ranges {
            for seq in range.iter() {
                match self.in_flight.remove(&seq) {
                    Some(segment) => {
                        self.monitor.remove(seq);
                        let sz = segment.as_data_size()?;
                        self.tx_portal_sz = self.tx_portal_sz.checked_sub(sz)
                            .ok_or_else(|| TransportError::InternalConsistency(format!(
                                "ack for #{} with {} bytes exceeds tx portal size {}", seq, sz, self.tx_portal_sz
                            )))?;
                        trace!("ack for #{}: {} bytes", seq, sz);
                        drop(segment);

                        self.successful_ack(sz);

                        if self.state == TxPortalState::CloseWait(seq) {
                            debug!("close for {:?} acknowledged", self.peer);
                            self.state = TxPortalState::Closed;
                        }
                    }
                    None => self.duplicate_ack(seq),
                }
            }
        }
        Ok(())
    }

    fn successful_ack(&mut self, sz: usize) {
        self.success_ct += 1;
        self.success_accum += sz;
        if self.success_ct >= self.profile.tx_portal_increase_thresh {
            let increase = (self.success_accum as f64 * self.profile.tx_portal_increase_scale).round() as usize;
            self.update_capacity(self.capacity.saturating_add(increase));
            self.success_ct = 0;
            self.success_accum = 0;
        }
    }

    fn duplicate_ack(&mut self, seq: u32) {
        trace!("duplicate ack for #{}", seq);
        self.dup_ack_ct += 1;
        self.success_ct = 0;
        if self.dup_ack_ct >= self.profile.tx_portal_dup_ack_thresh {
            self.update_capacity((self.capacity as f64 * self.profile.tx_portal_dup_ack_capacity_scale) as usize);
            self.monitor.relax_timeout();
            self.dup_ack_ct = 0;
            self.success_accum = (self.success_accum as f64 * self.profile.tx_portal_dup_ack_success_scale) as usize;
        }
        self.instrument.duplicate_ack(self.peer, seq);
    }

    fn retx(&mut self) {
        self.retx_ct += 1;
        self.success_ct = 0;
        if self.retx_ct >= self.profile.tx_portal_retx_thresh {
            self.update_capacity((self.capacity as f64 * self.profile.tx_portal_retx_capacity_scale) as usize);
            self.retx_ct = 0;
            self.success_accum = (self.success_accum as f64 * self.profile.tx_portal_retx_success_scale) as usize;
        }
    }

    fn update_capacity(&mut self, new_capacity: usize) {
        let new_capacity = new_capacity.clamp(self.profile.tx_portal_min_sz, self.profile.tx_portal_max_sz);
        if new_capacity != self.capacity {
            debug!("tx portal capacity for {:?}: {} -> {}", self.peer, self.capacity, new_capacity);
            self.capacity = new_capacity;
            self.instrument.tx_portal_capacity_changed(self.peer, new_capacity);
        }
    }

    /// Admission is blocked by the peer's receive window, and with nothing in flight there is no
    ///  ack coming that would report the window opening
    fn is_stalled_on_peer_window(&self) -> bool {
        self.state == TxPortalState::Open
            && self.in_flight.is_empty()
            && self.rx_portal_sz.is_some_and(|sz| sz > self.capacity)
    }

    /// Window queries start one retransmission timeout after the portal stalls, and repeat with
    ///  that interval until the window opens
    fn is_window_query_due(&mut self, now: Instant) -> bool {
        if !self.is_stalled_on_peer_window() {
            self.window_query_at = None;
            return false;
        }

        let next = now + self.monitor.timeout(0);
        match self.window_query_at {
            Some(due) if now < due => false,
            Some(_) => {
                self.window_query_at = Some(next);
                true
            }
            None => {
                self.window_query_at = Some(next);
                false
            }
        }
    }

    /// The retransmission timer is needed as long as there is something left to retransmit
    fn needs_retx_timer(&self) -> bool {
        match self.state {
            TxPortalState::Aborted => false,
            TxPortalState::Closed => !self.in_flight.is_empty(),
            TxPortalState::Open | TxPortalState::CloseWait(_) => true,
        }
    }
}

pub struct TxPortal {
    inner: Mutex<TxPortalInner>,
    ready: Notify,
    socket: Arc<dyn SendSocket>,
    pool: Arc<BufferPool>,
    peer: SocketAddr,
    profile: Arc<Profile>,
    instrument: Arc<dyn TransportInstrument>,
    epoch: Instant,
}

impl TxPortal {
    pub fn new(
        socket: Arc<dyn SendSocket>,
        peer: SocketAddr,
        profile: Arc<Profile>,
        pool: Arc<BufferPool>,
        instrument: Arc<dyn TransportInstrument>,
    ) -> Arc<TxPortal> {
        let now = Instant::now();
        Arc::new(TxPortal {
            inner: Mutex::new(TxPortalInner {
                state: TxPortalState::Open,
                in_flight: BTreeMap::new(),
                capacity: profile.tx_portal_start_sz,
                tx_portal_sz: 0,
                rx_portal_sz: None,
                success_ct: 0,
                success_accum: 0,
                dup_ack_ct: 0,
                retx_ct: 0,
                last_rtt_probe: now,
                window_query_at: None,
                monitor: RetxMonitor::new(&profile),
                profile: profile.clone(),
                peer,
                instrument: instrument.clone(),
            }),
            ready: Notify::new(),
            socket,
            pool,
            peer,
            profile,
            instrument,
            epoch: now,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// The clock used for RTT probes: the low 16 bits of the milliseconds since the portal was
    ///  created. Only differences of probe timestamps are meaningful, and they wrap around.
    fn probe_clock(&self, now: Instant) -> u16 {
        now.saturating_duration_since(self.epoch).as_millis() as u16
    }

    /// Sends `payload` in segments of at most `max_segment_sz` bytes, waiting for portal capacity
    ///  as needed. Returns the number of bytes sent, which is all of them unless an error occurs.
    pub async fn tx(&self, payload: &[u8], seq: &Sequence) -> TransportResult<usize> {
        let mut n = 0;
        while n < payload.len() {
            let (segment_seq, wire, segment_sz) = self.admit(&payload[n..], seq).await?;
            self.send(segment_seq, &wire).await?;
            self.instrument.wire_message_tx(self.peer, segment_seq, wire.len());
            n += segment_sz;
        }
        Ok(n)
    }

    /// Waits until a segment with the start of `data` fits into the portal, and registers it as
    ///  in flight
    async fn admit(&self, data: &[u8], seq: &Sequence) -> TransportResult<(u32, SharedBuf, usize)> {
        let mut inner = self.inner.lock().await;
        loop {
            inner.ensure_open()?;

            let with_rtt_probe = inner.is_rtt_probe_due(Instant::now());
            let max_payload = if with_rtt_probe {
                self.profile.max_segment_sz - RTT_PROBE_LEN
            }
            else {
                self.profile.max_segment_sz
            };
            let segment_sz = data.len().min(max_payload);

            if inner.can_admit(segment_sz) {
                let now = Instant::now();
                let rtt_probe = if with_rtt_probe {
                    inner.last_rtt_probe = now;
                    Some(self.probe_clock(now))
                }
                else {
                    None
                };

                let segment = Segment::new_data(seq.next(), rtt_probe, &data[..segment_sz], &self.pool)?;
                let segment_seq = segment.seq;
                let wire = segment.wire().clone();

                let inner = &mut *inner;
                inner.in_flight.insert(segment_seq, segment);
                inner.tx_portal_sz += segment_sz;
                inner.monitor.add(segment_seq, now);
                self.instrument.tx_portal_sz_changed(self.peer, inner.tx_portal_sz);
                trace!("admitted #{} with {} bytes to {:?}, tx portal size is {}", segment_seq, segment_sz, self.peer, inner.tx_portal_sz);

                return Ok((segment_seq, wire, segment_sz));
            }

            trace!("waiting for tx portal capacity: {} bytes", segment_sz);
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            drop(inner);
            notified.await;
            inner = self.inner.lock().await;
        }
    }

    async fn send(&self, seq: u32, wire: &SharedBuf) -> TransportResult<()> {
        if let Err(e) = self.socket.send_packet(self.peer, wire.as_ref()).await {
            error!("error sending #{} to {:?}: {}", seq, self.peer, e);
            return Err(TransportError::Io(e));
        }
        Ok(())
    }

    /// Processes acknowledged sequence number ranges. Sequence numbers that are not in flight
    ///  count as duplicate acks. Blocked writers are woken afterwards in any case.
    pub async fn ack(&self, ranges: &[AckRange]) -> TransportResult<()> {
        let result = {
            let mut inner = self.inner.lock().await;
            let prev_tx_portal_sz = inner.tx_portal_sz;
            let result = inner.process_acks(ranges);
            if inner.tx_portal_sz != prev_tx_portal_sz {
                self.instrument.tx_portal_sz_changed(self.peer, inner.tx_portal_sz);
            }
            result
        };

        self.ready.notify_waiters();
        result
    }

    /// Applies the receive window occupancy advertised by the peer
    pub async fn update_rx_portal_sz(&self, rx_portal_sz: usize) {
        let mut inner = self.inner.lock().await;
        inner.rx_portal_sz = Some(rx_portal_sz);
        self.instrument.tx_portal_rx_sz_changed(self.peer, rx_portal_sz);
        self.ready.notify_waiters();
    }

    /// Registers a round trip time sample from a probe timestamp echoed by the peer
    pub async fn rtt(&self, probe_ts: u16) {
        let mut inner = self.inner.lock().await;
        let rtt_ms = self.probe_clock(Instant::now()).wrapping_sub(probe_ts);
        trace!("rtt sample for {:?}: {}ms", self.peer, rtt_ms);
        inner.monitor.update_rtt_ms(rtt_ms);
        self.instrument.new_rtt(self.peer, rtt_ms);
    }

    /// Sends a Close segment, unless one was sent before. Writers waiting for capacity fail.
    pub async fn close(&self, seq: &Sequence) -> TransportResult<()> {
        let (close_seq, wire) = {
            let mut inner = self.inner.lock().await;
            match inner.state {
                TxPortalState::Aborted => return Err(TransportError::ConnectionClosed),
                TxPortalState::CloseWait(_) | TxPortalState::Closed => return Ok(()),
                TxPortalState::Open => {}
            }

            let segment = Segment::new_close(seq.next(), &self.pool)?;
            let close_seq = segment.seq;
            let wire = segment.wire().clone();

            let inner = &mut *inner;
            inner.in_flight.insert(close_seq, segment);
            inner.monitor.add(close_seq, Instant::now());
            inner.state = TxPortalState::CloseWait(close_seq);
            debug!("closing tx portal for {:?} with #{}", self.peer, close_seq);
            (close_seq, wire)
        };
        self.ready.notify_waiters();

        self.send(close_seq, &wire).await?;
        self.instrument.wire_message_tx(self.peer, close_seq, wire.len());
        Ok(())
    }

    /// Terminates the portal without a close handshake, releasing all segments in flight
    pub async fn abort(&self) {
        {
            let mut inner = self.inner.lock().await;
            if inner.state == TxPortalState::Aborted {
                return;
            }
            debug!("aborting tx portal for {:?} with {} segments in flight", self.peer, inner.in_flight.len());
            inner.state = TxPortalState::Aborted;
            inner.in_flight.clear();
            inner.monitor.clear();
            inner.tx_portal_sz = 0;
        }
        self.ready.notify_waiters();
    }

    pub async fn state(&self) -> TxPortalState {
        self.inner.lock().await.state
    }

    pub async fn stats(&self) -> TxPortalStats {
        let inner = self.inner.lock().await;
        TxPortalStats {
            state: inner.state,
            capacity: inner.capacity,
            tx_portal_sz: inner.tx_portal_sz,
            rx_portal_sz: inner.rx_portal_sz,
            num_in_flight: inner.in_flight.len(),
            success_ct: inner.success_ct,
            success_accum: inner.success_accum,
            dup_ack_ct: inner.dup_ack_ct,
            retx_ct: inner.retx_ct,
            retx_add_ms: inner.monitor.retx_add_ms(),
            rtt_ms: inner.monitor.rtt_ms(),
        }
    }

    /// Retransmits all segments whose timeout expired, and queries the peer's receive window if
    ///  the portal is stalled on it. Returns `false` once the retransmission timer is not needed
    ///  anymore.
    pub async fn on_retx_tick(&self) -> bool {
        let now = Instant::now();
        let (resend, window_query, keep_running) = {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;

            let mut resend = Vec::new();
            for seq in inner.monitor.expired(now) {
                match inner.in_flight.get(&seq) {
                    Some(segment) => resend.push((seq, segment.wire().clone())),
                    None => {
                        warn!("retransmission monitor has #{} which is not in flight - skipping", seq);
                        inner.monitor.remove(seq);
                    }
                }
            }
            for _ in &resend {
                inner.retx();
            }
            (resend, inner.is_window_query_due(now), inner.needs_retx_timer())
        };

        for (seq, wire) in resend {
            debug!("retransmitting #{} to {:?}", seq, self.peer);
            // a failed retransmission is retried with the next timeout
            if self.send(seq, &wire).await.is_ok() {
                self.instrument.wire_message_retx(self.peer, seq, wire.len());
            }
        }
        if window_query {
            self.send_window_query().await;
        }
        keep_running
    }

    /// A window query is an ack without ranges and without optional fields. The peer answers it
    ///  with its current receive window occupancy.
    async fn send_window_query(&self) {
        debug!("tx portal for {:?} is stalled on the peer's receive window - querying", self.peer);
        match Segment::new_ack(Vec::new(), None, None, &self.pool) {
            Ok(query) => {
                if let Err(e) = self.socket.send_packet(self.peer, query.wire().as_ref()).await {
                    warn!("error sending window query to {:?}: {}", self.peer, e);
                }
            }
            Err(e) => error!("error creating window query for {:?}: {}", self.peer, e),
        }
    }

    /// Spawns the task driving retransmissions. It ends when the portal is aborted, when it is
    ///  closed with nothing left in flight, or when the portal is dropped.
    pub fn spawn_retx_task(self: &Arc<Self>) -> JoinHandle<()> {
        let portal: Weak<TxPortal> = Arc::downgrade(self);
        let mut ticks = interval(self.profile.retx_tick());
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let peer = self.peer;

        tokio::spawn(async move {
            loop {
                ticks.tick().await;
                let Some(tx_portal) = portal.upgrade() else {
                    break;
                };
                if !tx_portal.on_retx_tick().await {
                    break;
                }
            }
            debug!("retransmission timer for {:?} finished", peer);
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use mockall::predicate::{always, eq};
    use rstest::rstest;
    use tokio::time::{advance, sleep};
    use crate::instrument::{MockTransportInstrument, NoopInstrument};
    use crate::send_pipeline::MockSendSocket;
    use super::*;

    type Sent = Arc<std::sync::Mutex<Vec<Vec<u8>>>>;

    fn peer() -> SocketAddr {
        SocketAddr::from(([1, 2, 3, 4], 9))
    }

    fn recording_socket() -> (MockSendSocket, Sent) {
        let sent: Sent = Default::default();
        let sent2 = sent.clone();
        let mut socket = MockSendSocket::new();
        socket.expect_send_packet()
            .returning(move |to, buf| {
                assert_eq!(to, peer());
                sent2.lock().unwrap().push(buf.to_vec());
                Ok(())
            });
        (socket, sent)
    }

    fn profile() -> Profile {
        Profile {
            seq_random: false,
            max_segment_sz: 1000,
            ..Profile::default()
        }
    }

    struct Fixture {
        portal: Arc<TxPortal>,
        seq: Sequence,
        sent: Sent,
        pool: Arc<BufferPool>,
    }

    fn fixture_with(profile: Profile, instrument: Arc<dyn TransportInstrument>) -> Fixture {
        let (socket, sent) = recording_socket();
        let pool = BufferPool::new(profile.pool_buffer_sz, 16);
        let portal = TxPortal::new(Arc::new(socket), peer(), Arc::new(profile), pool.clone(), instrument);
        Fixture { portal, seq: Sequence::new(0), sent, pool }
    }

    fn fixture(profile: Profile) -> Fixture {
        fixture_with(profile, Arc::new(NoopInstrument))
    }

    /// tx portal size must always be the sum of the data sizes of all segments in flight
    async fn assert_tx_portal_sz_consistent(portal: &TxPortal) {
        let inner = portal.inner.lock().await;
        let sum: usize = inner.in_flight.values()
            .map(|s| s.as_data_size().unwrap())
            .sum();
        assert_eq!(inner.tx_portal_sz, sum);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tx_splits_into_segments() {
        let f = fixture(profile());

        assert_eq!(f.portal.tx(&[7; 2500], &f.seq).await.unwrap(), 2500);

        let sent = f.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 3);
        assert_eq!(&sent[0][..6], &[0, 0,0,0,0, 7]);
        assert_eq!(sent[0].len(), 5 + 1000);
        assert_eq!(&sent[1][..5], &[0, 0,0,0,1]);
        assert_eq!(sent[2].len(), 5 + 500);

        let stats = f.portal.stats().await;
        assert_eq!(stats.tx_portal_sz, 2500);
        assert_eq!(stats.num_in_flight, 3);
        assert_eq!(f.pool.outstanding(), 3);
        assert_tx_portal_sz_consistent(&f.portal).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_tx_empty() {
        let f = fixture(profile());
        assert_eq!(f.portal.tx(&[], &f.seq).await.unwrap(), 0);
        assert!(f.sent.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tx_with_rtt_probe() {
        let f = fixture(profile());

        advance(Duration::from_millis(51)).await;
        f.portal.tx(&[1; 1500], &f.seq).await.unwrap();
        advance(Duration::from_millis(20)).await;
        f.portal.tx(&[2; 10], &f.seq).await.unwrap();

        let sent = f.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 3);
        // the probe takes 2 bytes from the segment's payload
        assert_eq!(&sent[0][..8], &[8, 0,0,0,0, 0,51, 1]);
        assert_eq!(sent[0].len(), 5 + 2 + 998);
        assert_eq!(&sent[1][..5], &[0, 0,0,0,1]);
        assert_eq!(sent[1].len(), 5 + 502);
        assert_eq!(&sent[2][..6], &[0, 0,0,0,2, 2]);

        assert_eq!(f.portal.stats().await.tx_portal_sz, 1510);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_releases_segments() {
        let f = fixture(profile());
        f.portal.tx(&[7; 2500], &f.seq).await.unwrap();

        f.portal.ack(&[AckRange::new(0, 1)]).await.unwrap();
        let stats = f.portal.stats().await;
        assert_eq!(stats.tx_portal_sz, 500);
        assert_eq!(stats.num_in_flight, 1);
        assert_eq!(stats.success_ct, 2);
        assert_eq!(stats.success_accum, 2000);
        assert_tx_portal_sz_consistent(&f.portal).await;

        f.portal.ack(&[AckRange::single(2)]).await.unwrap();
        assert_eq!(f.portal.stats().await.tx_portal_sz, 0);
        assert_eq!(f.pool.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_ack() {
        let f = fixture(profile());
        f.portal.tx(&[7; 1500], &f.seq).await.unwrap();
        f.portal.ack(&[AckRange::single(0)]).await.unwrap();
        assert_eq!(f.portal.stats().await.success_ct, 1);

        f.portal.ack(&[AckRange::single(0), AckRange::single(99)]).await.unwrap();

        let stats = f.portal.stats().await;
        assert_eq!(stats.dup_ack_ct, 2);
        assert_eq!(stats.success_ct, 0);
        assert_eq!(stats.tx_portal_sz, 500);
        assert_eq!(stats.num_in_flight, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_unchanged_below_increase_thresh() {
        let f = fixture(Profile {
            max_segment_sz: 16384,
            ..profile()
        });

        for i in 0..64u32 {
            f.portal.tx(&[1; 16384], &f.seq).await.unwrap();
            f.portal.ack(&[AckRange::single(i)]).await.unwrap();
            assert_eq!(f.portal.stats().await.capacity, 16384);
        }
        assert_eq!(f.portal.stats().await.success_ct, 64);

        for i in 64..223u32 {
            f.portal.tx(&[1; 16384], &f.seq).await.unwrap();
            f.portal.ack(&[AckRange::single(i)]).await.unwrap();
        }
        assert_eq!(f.portal.stats().await.capacity, 16384);

        f.portal.tx(&[1; 16384], &f.seq).await.unwrap();
        f.portal.ack(&[AckRange::single(223)]).await.unwrap();

        let stats = f.portal.stats().await;
        assert_eq!(stats.capacity, 16384 + 224 * 16384);
        assert_eq!(stats.success_ct, 0);
        assert_eq!(stats.success_accum, 0);
    }

    #[rstest]
    #[case::plain(1.0, 20_000, 20_000 + 2997)]
    #[case::scaled(1.5, 20_000, 20_000 + 4496)]
    #[case::rounded(0.1, 20_000, 20_000 + 300)]
    #[case::clamped(1.0, 4_095_900, 4_096_000)]
    fn test_capacity_increase(#[case] increase_scale: f64, #[case] start_sz: usize, #[case] expected: usize) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async {
            let f = fixture(Profile {
                tx_portal_start_sz: start_sz,
                tx_portal_increase_thresh: 3,
                tx_portal_increase_scale: increase_scale,
                ..profile()
            });

            f.portal.tx(&[1; 999], &f.seq).await.unwrap();
            f.portal.tx(&[1; 999], &f.seq).await.unwrap();
            f.portal.ack(&[AckRange::new(0, 1)]).await.unwrap();
            assert_eq!(f.portal.stats().await.capacity, start_sz);

            f.portal.tx(&[1; 999], &f.seq).await.unwrap();
            f.portal.ack(&[AckRange::single(2)]).await.unwrap();
            assert_eq!(f.portal.stats().await.capacity, expected);
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_dup_ack_decrease() {
        let mut instrument = MockTransportInstrument::new();
        instrument.expect_duplicate_ack()
            .times(65)
            .return_const(());
        instrument.expect_tx_portal_capacity_changed()
            .once()
            .with(eq(peer()), eq(90_000))
            .return_const(());
        let f = fixture_with(Profile {
            tx_portal_start_sz: 100_000,
            ..profile()
        }, Arc::new(instrument));

        {
            let mut inner = f.portal.inner.lock().await;
            inner.success_accum = 1000;
        }

        for _ in 0..63 {
            f.portal.ack(&[AckRange::single(5)]).await.unwrap();
        }
        assert_eq!(f.portal.stats().await.capacity, 100_000);

        f.portal.ack(&[AckRange::single(5)]).await.unwrap();
        let stats = f.portal.stats().await;
        assert_eq!(stats.capacity, 90_000);
        assert_eq!(stats.dup_ack_ct, 0);
        assert_eq!(stats.success_accum, 900);
        assert_eq!(stats.retx_add_ms, 110);

        f.portal.ack(&[AckRange::single(5)]).await.unwrap();
        assert_eq!(f.portal.stats().await.dup_ack_ct, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dup_ack_decrease_clamped_at_min() {
        let mut instrument = MockTransportInstrument::new();
        instrument.expect_duplicate_ack()
            .return_const(());
        instrument.expect_tx_portal_capacity_changed()
            .never();
        let f = fixture_with(profile(), Arc::new(instrument));

        f.portal.ack(&[AckRange::new(100, 163)]).await.unwrap();
        let stats = f.portal.stats().await;
        assert_eq!(stats.capacity, 16384);
        assert_eq!(stats.dup_ack_ct, 0);
        assert_eq!(stats.retx_add_ms, 110);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retransmission() {
        let f = fixture(profile());
        f.portal.tx(&[3; 10], &f.seq).await.unwrap();

        advance(Duration::from_millis(299)).await;
        assert!(f.portal.on_retx_tick().await);
        assert_eq!(f.sent.lock().unwrap().len(), 1);

        advance(Duration::from_millis(1)).await;
        assert!(f.portal.on_retx_tick().await);
        {
            let sent = f.sent.lock().unwrap();
            assert_eq!(sent.len(), 2);
            assert_eq!(sent[0], sent[1]);
        }
        assert_eq!(f.portal.stats().await.retx_ct, 1);

        // backoff: the next timeout is scaled
        advance(Duration::from_millis(449)).await;
        f.portal.on_retx_tick().await;
        assert_eq!(f.sent.lock().unwrap().len(), 2);
        advance(Duration::from_millis(1)).await;
        f.portal.on_retx_tick().await;
        assert_eq!(f.sent.lock().unwrap().len(), 3);
        assert_eq!(f.portal.stats().await.retx_ct, 2);

        f.portal.ack(&[AckRange::single(0)]).await.unwrap();
        advance(Duration::from_secs(10)).await;
        f.portal.on_retx_tick().await;
        assert_eq!(f.sent.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retx_decrease() {
        let f = fixture(Profile {
            tx_portal_start_sz: 100_000,
            tx_portal_retx_thresh: 2,
            ..profile()
        });
        for _ in 0..3 {
            f.portal.tx(&[3; 10], &f.seq).await.unwrap();
        }
        {
            let mut inner = f.portal.inner.lock().await;
            inner.success_accum = 1000;
        }

        advance(Duration::from_millis(300)).await;
        f.portal.on_retx_tick().await;

        let sent = f.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 6);
        assert_eq!(&sent[3..], &sent[..3]);

        let stats = f.portal.stats().await;
        assert_eq!(stats.capacity, 75_000);
        assert_eq!(stats.retx_ct, 1);
        assert_eq!(stats.success_accum, 825);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocks_on_capacity() {
        let f = fixture(profile());
        f.portal.tx(&[1; 16384], &f.seq).await.unwrap();
        assert_eq!(f.portal.stats().await.num_in_flight, 17);

        let portal = f.portal.clone();
        let writer = tokio::spawn(async move {
            portal.tx(&[2; 100], &Sequence::new(1000)).await
        });

        sleep(Duration::from_millis(10)).await;
        assert!(!writer.is_finished());

        // duplicate acks wake the writer, but do not free capacity
        f.portal.ack(&[AckRange::single(500)]).await.unwrap();
        sleep(Duration::from_millis(10)).await;
        assert!(!writer.is_finished());

        f.portal.ack(&[AckRange::single(16)]).await.unwrap();
        assert_eq!(writer.await.unwrap().unwrap(), 100);
        assert_eq!(f.portal.stats().await.tx_portal_sz, 16384 - 384 + 100);
        assert_tx_portal_sz_consistent(&f.portal).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocks_on_rx_portal_sz() {
        let f = fixture(profile());
        f.portal.update_rx_portal_sz(16385).await;

        let portal = f.portal.clone();
        let writer = tokio::spawn(async move {
            portal.tx(&[2; 100], &Sequence::new(0)).await
        });

        sleep(Duration::from_millis(10)).await;
        assert!(!writer.is_finished());

        f.portal.update_rx_portal_sz(16384).await;
        assert_eq!(writer.await.unwrap().unwrap(), 100);
        assert_eq!(f.portal.stats().await.rx_portal_sz, Some(16384));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_query_while_stalled_on_rx_portal_sz() {
        let f = fixture(profile());
        f.portal.update_rx_portal_sz(20_000).await;

        // the first tick schedules the query one retransmission timeout ahead
        assert!(f.portal.on_retx_tick().await);
        advance(Duration::from_millis(299)).await;
        f.portal.on_retx_tick().await;
        assert!(f.sent.lock().unwrap().is_empty());

        advance(Duration::from_millis(1)).await;
        f.portal.on_retx_tick().await;
        assert_eq!(f.sent.lock().unwrap().clone(), vec![vec![1, 0,0,0,0, 0]]);

        advance(Duration::from_millis(300)).await;
        f.portal.on_retx_tick().await;
        assert_eq!(f.sent.lock().unwrap().len(), 2);

        f.portal.update_rx_portal_sz(0).await;
        advance(Duration::from_millis(1000)).await;
        f.portal.on_retx_tick().await;
        assert_eq!(f.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_window_query_with_segments_in_flight() {
        let f = fixture(profile());
        f.portal.tx(&[1; 10], &f.seq).await.unwrap();
        f.portal.update_rx_portal_sz(20_000).await;

        f.portal.on_retx_tick().await;
        advance(Duration::from_millis(310)).await;
        f.portal.on_retx_tick().await;

        // the original segment and its retransmission, no window query
        let sent = f.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], sent[1]);
        assert_eq!(sent[0][0], 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_idempotent() {
        let f = fixture(profile());
        f.portal.tx(&[1; 10], &f.seq).await.unwrap();

        f.portal.close(&f.seq).await.unwrap();
        f.portal.close(&f.seq).await.unwrap();
        assert_eq!(f.portal.state().await, TxPortalState::CloseWait(1));
        {
            let sent = f.sent.lock().unwrap();
            assert_eq!(sent.len(), 2);
            assert_eq!(sent[1], vec![2, 0,0,0,1]);
        }
        assert_eq!(f.seq.peek(), 2);

        assert!(matches!(f.portal.tx(&[1], &f.seq).await, Err(TransportError::ConnectionClosed)));

        // ack for a different sequence number does not complete the close
        f.portal.ack(&[AckRange::single(0)]).await.unwrap();
        assert_eq!(f.portal.state().await, TxPortalState::CloseWait(1));

        f.portal.ack(&[AckRange::single(1)]).await.unwrap();
        assert_eq!(f.portal.state().await, TxPortalState::Closed);
        f.portal.close(&f.seq).await.unwrap();
        assert_eq!(f.sent.lock().unwrap().len(), 2);

        assert!(!f.portal.on_retx_tick().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_retransmitted() {
        let f = fixture(profile());
        f.portal.close(&f.seq).await.unwrap();

        advance(Duration::from_millis(300)).await;
        assert!(f.portal.on_retx_tick().await);
        let sent = f.sent.lock().unwrap().clone();
        assert_eq!(sent, vec![vec![2, 0,0,0,0], vec![2, 0,0,0,0]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_releases_blocked_writer() {
        let f = fixture(profile());
        f.portal.tx(&[1; 16384], &f.seq).await.unwrap();

        let portal = f.portal.clone();
        let writer = tokio::spawn(async move {
            portal.tx(&[2; 100], &Sequence::new(1000)).await
        });
        sleep(Duration::from_millis(10)).await;

        f.portal.close(&f.seq).await.unwrap();
        assert!(matches!(writer.await.unwrap(), Err(TransportError::ConnectionClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort() {
        let f = fixture(profile());
        f.portal.tx(&[1; 16384], &f.seq).await.unwrap();

        let portal = f.portal.clone();
        let writer = tokio::spawn(async move {
            portal.tx(&[2; 100], &Sequence::new(1000)).await
        });
        sleep(Duration::from_millis(10)).await;

        f.portal.abort().await;
        assert!(matches!(writer.await.unwrap(), Err(TransportError::ConnectionClosed)));
        assert_eq!(f.pool.outstanding(), 0);
        let stats = f.portal.stats().await;
        assert_eq!(stats.state, TxPortalState::Aborted);
        assert_eq!(stats.tx_portal_sz, 0);
        assert_eq!(stats.num_in_flight, 0);

        assert!(matches!(f.portal.close(&f.seq).await, Err(TransportError::ConnectionClosed)));
        assert!(!f.portal.on_retx_tick().await);
    }

    #[rstest]
    #[case::plain(30, 0, 30)]
    #[case::wrapped(30, 65530, 36)]
    fn test_rtt(#[case] elapsed_ms: u64, #[case] probe_ts: u16, #[case] expected: u64) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async {
            let f = fixture(profile());
            advance(Duration::from_millis(elapsed_ms)).await;
            f.portal.rtt(probe_ts).await;
            assert_eq!(f.portal.stats().await.rtt_ms, Some(expected));
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_inconsistent_size() {
        let f = fixture(profile());
        f.portal.tx(&[1; 10], &f.seq).await.unwrap();
        f.portal.inner.lock().await.tx_portal_sz = 5;

        assert!(matches!(f.portal.ack(&[AckRange::single(0)]).await, Err(TransportError::InternalConsistency(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_segment_without_data_size() {
        let f = fixture(profile());
        let hello = Segment::new_hello(4, &f.pool).unwrap();
        f.portal.inner.lock().await.in_flight.insert(4, hello);

        assert!(matches!(f.portal.ack(&[AckRange::single(4)]).await, Err(TransportError::InternalConsistency(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_error() {
        let mut socket = MockSendSocket::new();
        socket.expect_send_packet()
            .returning(|_, _| Err(std::io::Error::new(std::io::ErrorKind::Other, "unreachable")));
        let profile = Arc::new(profile());
        let pool = BufferPool::new(profile.pool_buffer_sz, 4);
        let portal = TxPortal::new(Arc::new(socket), peer(), profile, pool, Arc::new(NoopInstrument));

        assert!(matches!(portal.tx(&[1; 10], &Sequence::new(0)).await, Err(TransportError::Io(_))));

        // the segment stays in flight for retransmission
        assert_eq!(portal.stats().await.num_in_flight, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retx_task_ends_on_abort() {
        let f = fixture(profile());
        let handle = f.portal.spawn_retx_task();

        sleep(Duration::from_millis(100)).await;
        assert!(!handle.is_finished());

        f.portal.abort().await;
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retx_task_ends_on_drop() {
        let f = fixture(profile());
        let handle = f.portal.spawn_retx_task();
        drop(f.portal);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_instrument_tx_portal_sz() {
        let mut instrument = MockTransportInstrument::new();
        instrument.expect_tx_portal_sz_changed()
            .with(always(), eq(10))
            .once()
            .return_const(());
        instrument.expect_tx_portal_sz_changed()
            .with(always(), eq(0))
            .once()
            .return_const(());
        instrument.expect_wire_message_tx()
            .with(eq(peer()), eq(0), eq(15))
            .once()
            .return_const(());
        let f = fixture_with(profile(), Arc::new(instrument));

        f.portal.tx(&[1; 10], &f.seq).await.unwrap();
        f.portal.ack(&[AckRange::single(0)]).await.unwrap();
    }
}
