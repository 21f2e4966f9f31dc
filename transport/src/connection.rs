use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};
use crate::buffers::buffer_pool::BufferPool;
use crate::config::Profile;
use crate::error::TransportResult;
use crate::instrument::TransportInstrument;
use crate::rx_portal::{RxAck, RxPortal};
use crate::segment::{AckRange, Segment, SegmentKind};
use crate::send_pipeline::SendSocket;
use crate::sequence::Sequence;
use crate::tx_portal::{TxPortal, TxPortalState, TxPortalStats};

/// A reliable, ordered byte stream to a single peer, combining a [TxPortal] for sending with an
///  [RxPortal] for receiving.
///
/// A connection should be closed (or aborted) explicitly: its end point keeps it registered
///  until both directions are finished.
pub struct Connection {
    tx_portal: Arc<TxPortal>,
    rx_portal: RxPortal,
    seq: Sequence,
    hello_seq: u32,
    socket: Arc<dyn SendSocket>,
    pool: Arc<BufferPool>,
    peer: SocketAddr,
    local_addr: SocketAddr,
    instrument: Arc<dyn TransportInstrument>,
    /// held for the whole of a `write()`
    write_lock: tokio::sync::Mutex<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        for handle in self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner).drain(..) {
            handle.abort();
        }
    }
}

impl Connection {
    /// `seq` is this side's sequence after its Hello was taken from it, `peer_hello_seq` is the
    ///  sequence number of the peer's Hello.
    pub(crate) fn new(
        socket: Arc<dyn SendSocket>,
        peer: SocketAddr,
        local_addr: SocketAddr,
        profile: Arc<Profile>,
        pool: Arc<BufferPool>,
        instrument: Arc<dyn TransportInstrument>,
        seq: Sequence,
        hello_seq: u32,
        peer_hello_seq: u32,
    ) -> Arc<Connection> {
        let tx_portal = TxPortal::new(socket.clone(), peer, profile.clone(), pool.clone(), instrument.clone());
        let retx_handle = tx_portal.spawn_retx_task();

        Arc::new(Connection {
            tx_portal,
            rx_portal: RxPortal::new(peer_hello_seq.wrapping_add(1), peer, profile, instrument.clone()),
            seq,
            hello_seq,
            socket,
            pool,
            peer,
            local_addr,
            instrument,
            write_lock: tokio::sync::Mutex::new(()),
            tasks: Mutex::new(vec![retx_handle]),
        })
    }

    /// ties a task's lifetime to the connection
    pub(crate) fn register_task(&self, handle: JoinHandle<()>) {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).push(handle);
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Sends all of `data`, waiting for window capacity as necessary. Concurrent writes are
    ///  serialized, each one's data is contiguous in the stream.
    pub async fn write(&self, data: &[u8]) -> TransportResult<usize> {
        let _write_guard = self.write_lock.lock().await;
        self.tx_portal.tx(data, &self.seq).await
    }

    /// Reads received data, waiting until some is available. `Ok(0)` means the peer closed its
    ///  sending direction and all its data was read.
    pub async fn read(&self, buf: &mut [u8]) -> TransportResult<usize> {
        let (n, window_update) = self.rx_portal.read(buf).await?;
        if let Some(rx_portal_sz) = window_update {
            trace!("advertising rx portal size {} to {:?}", rx_portal_sz, self.peer);
            self.send_ack(Vec::new(), Some(rx_portal_sz), None).await;
        }
        Ok(n)
    }

    /// Closes the sending direction. Reading remains possible until the peer closes its direction.
    pub async fn close(&self) -> TransportResult<()> {
        self.tx_portal.close(&self.seq).await
    }

    /// Terminates the connection immediately, discarding all data in flight and unread data
    pub async fn abort(&self) {
        debug!("aborting connection to {:?}", self.peer);
        self.tx_portal.abort().await;
        self.rx_portal.abort().await;
    }

    /// `true` if both directions are closed, or if the connection was aborted
    pub async fn is_finished(&self) -> bool {
        match self.tx_portal.state().await {
            TxPortalState::Aborted => true,
            TxPortalState::Closed => self.rx_portal.is_eof().await,
            TxPortalState::Open | TxPortalState::CloseWait(_) => false,
        }
    }

    pub async fn tx_stats(&self) -> TxPortalStats {
        self.tx_portal.stats().await
    }

    /// bytes received from the peer but not read yet, including data buffered out of order
    pub async fn rx_portal_sz(&self) -> usize {
        self.rx_portal.rx_portal_sz().await
    }

    pub(crate) async fn send_hello(&self) {
        match Segment::new_hello(self.hello_seq, &self.pool) {
            Ok(hello) => {
                if let Err(e) = self.socket.send_packet(self.peer, hello.wire().as_ref()).await {
                    error!("error sending hello to {:?}: {}", self.peer, e);
                }
            }
            Err(e) => error!("error creating hello for {:?}: {}", self.peer, e),
        }
    }

    /// Dispatches a segment received from this connection's peer
    pub(crate) async fn on_segment(&self, segment: Segment) {
        self.instrument.wire_message_rx(self.peer, segment.seq, segment.wire().len());

        match segment.kind {
            SegmentKind::Data { .. } | SegmentKind::Close => {
                if let Some(RxAck { seq, rtt_echo, rx_portal_sz }) = self.rx_portal.rx(segment).await {
                    self.send_ack(vec![AckRange::single(seq)], Some(rx_portal_sz), rtt_echo).await;
                }
            }
            SegmentKind::Ack { ranges, rx_portal_sz: None, rtt_echo: None } if ranges.is_empty() => {
                trace!("window query from {:?}", self.peer);
                self.send_window_update().await;
            }
            SegmentKind::Ack { ranges, rx_portal_sz, rtt_echo } => {
                if let Some(probe_ts) = rtt_echo {
                    self.tx_portal.rtt(probe_ts).await;
                }
                if let Err(e) = self.tx_portal.ack(&ranges).await {
                    error!("error processing ack from {:?}: {}", self.peer, e);
                }
                if let Some(rx_portal_sz) = rx_portal_sz {
                    self.tx_portal.update_rx_portal_sz(rx_portal_sz as usize).await;
                }
            }
            SegmentKind::Hello => {
                trace!("repeated hello from {:?}", self.peer);
            }
        }
    }

    /// Reports the current receive window occupancy to the peer
    pub(crate) async fn send_window_update(&self) {
        let rx_portal_sz = self.rx_portal.advertise().await;
        self.send_ack(Vec::new(), Some(rx_portal_sz), None).await;
    }

    async fn send_ack(&self, ranges: Vec<AckRange>, rx_portal_sz: Option<usize>, rtt_echo: Option<u16>) {
        let rx_portal_sz = rx_portal_sz.map(|sz| sz.min(u32::MAX as usize) as u32);
        let ack = match Segment::new_ack(ranges, rx_portal_sz, rtt_echo, &self.pool) {
            Ok(ack) => ack,
            Err(e) => {
                error!("error creating ack for {:?}: {}", self.peer, e);
                return;
            }
        };

        // a lost ack is recovered by the peer's retransmission
        if let Err(e) = self.socket.send_packet(self.peer, ack.wire().as_ref()).await {
            warn!("error sending ack to {:?}: {}", self.peer, e);
        }
    }
}
