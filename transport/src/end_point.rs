use std::collections::hash_map::Entry;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Weak};
use anyhow::{anyhow, bail};
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, span, trace, warn, Instrument, Level, Span};
use crate::buffers::buffer_pool::BufferPool;
use crate::config::Profile;
use crate::connection::Connection;
use crate::error::{TransportError, TransportResult};
use crate::instrument::{instrument_for_name, TransportInstrument};
use crate::segment::{AckRange, Segment, SegmentKind};
use crate::send_pipeline::{bind_udp_socket, SendSocket};
use crate::sequence::Sequence;

/// Everything the connections of one UDP socket share
struct EndPointContext {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    profile: Arc<Profile>,
    pool: Arc<BufferPool>,
    instrument: Arc<dyn TransportInstrument>,
}

impl EndPointContext {
    fn new(socket: UdpSocket, profile: Profile) -> anyhow::Result<EndPointContext> {
        let Some(instrument) = instrument_for_name(&profile.instrument) else {
            bail!("unknown instrument {:?}", profile.instrument);
        };
        let local_addr = socket.local_addr()?;
        Ok(EndPointContext {
            socket: Arc::new(socket),
            local_addr,
            pool: BufferPool::new(profile.pool_buffer_sz, profile.pool_max_buffers),
            profile: Arc::new(profile),
            instrument,
        })
    }

    fn send_socket(&self) -> Arc<dyn SendSocket> {
        self.socket.clone()
    }

    fn new_connection(&self, peer: SocketAddr, seq: Sequence, hello_seq: u32, peer_hello_seq: u32) -> Arc<Connection> {
        Connection::new(
            self.send_socket(),
            peer,
            self.local_addr,
            self.profile.clone(),
            self.pool.clone(),
            self.instrument.clone(),
            seq,
            hello_seq,
            peer_hello_seq,
        )
    }

    /// Receives the next datagram into a pool buffer and decodes it. Malformed datagrams are
    ///  reported and skipped.
    async fn recv_segment(&self) -> (SocketAddr, Segment) {
        loop {
            let mut buf = self.pool.acquire();
            buf.maximize_len();
            let (num_read, from) = match self.socket.recv_from(buf.as_mut()).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };
            buf.truncate(num_read);

            match Segment::decode(buf.freeze()) {
                Ok(segment) => {
                    trace!("received {:?} from {:?}", segment, from);
                    return (from, segment);
                }
                Err(e) => {
                    debug!("dropping datagram from {:?}: {}", from, e);
                    self.instrument.malformed_segment(from, &e.to_string());
                }
            }
        }
    }

    /// Acknowledges a Close without a connection. This happens when the ack for a peer's Close
    ///  got lost after the connection was finished locally.
    async fn ack_stale_close(&self, peer: SocketAddr, seq: u32) {
        debug!("acknowledging close #{} from {:?} without connection", seq, peer);
        match Segment::new_ack(vec![AckRange::single(seq)], None, None, &self.pool) {
            Ok(ack) => {
                if let Err(e) = self.socket.send_packet(peer, ack.wire().as_ref()).await {
                    warn!("error sending ack to {:?}: {}", peer, e);
                }
            }
            Err(e) => error!("error creating ack for {:?}: {}", peer, e),
        }
    }
}

/// A connection in the listener's demultiplexing table
struct PeerEntry {
    connection: Arc<Connection>,
    /// the dialer sent something other than Hello, confirming the handshake
    established: bool,
    created_at: Instant,
}

/// Accepts connections on a UDP socket. All connections share the socket, incoming datagrams
///  are dispatched to connections based on their sender's address.
///
/// A connection is offered to [Listener::accept] once the dialer confirms the handshake. The
///  receive loop periodically removes finished connections and connections whose handshake
///  was not confirmed within `connect_timeout_ms`.
pub struct Listener {
    local_addr: SocketAddr,
    accept_rx: Mutex<mpsc::Receiver<Arc<Connection>>>,
    recv_handle: JoinHandle<()>,
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.recv_handle.abort();
    }
}

impl Listener {
    pub async fn bind(addr: SocketAddr, profile: Profile) -> anyhow::Result<Listener> {
        profile.validate()?;

        let socket = bind_udp_socket(addr, &profile)?;
        let ctx = Arc::new(EndPointContext::new(socket, profile)?);
        info!("listening on {:?}", ctx.local_addr);

        let (accept_tx, accept_rx) = mpsc::channel(ctx.profile.accept_q_len);
        let local_addr = ctx.local_addr;
        let recv_handle = tokio::spawn(Self::recv_loop(ctx, accept_tx));

        Ok(Listener {
            local_addr,
            accept_rx: Mutex::new(accept_rx),
            recv_handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits for the next incoming connection
    pub async fn accept(&self) -> TransportResult<Arc<Connection>> {
        self.accept_rx.lock().await
            .recv().await
            .ok_or(TransportError::ConnectionClosed)
    }

    async fn recv_loop(ctx: Arc<EndPointContext>, accept_tx: mpsc::Sender<Arc<Connection>>) {
        info!("starting receive loop");

        let mut connections: FxHashMap<SocketAddr, PeerEntry> = FxHashMap::default();
        let mut sweep_ticks = interval(ctx.profile.retx_start());
        sweep_ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                (from, segment) = ctx.recv_segment() => {
                    let span = span!(Level::TRACE, "segment_received", peer = %from, seq = segment.seq);
                    Self::on_segment(&ctx, &mut connections, &accept_tx, from, segment)
                        .instrument(span)
                        .await;
                }
                _ = sweep_ticks.tick() => {
                    Self::sweep(&ctx, &mut connections).await;
                }
            }
        }
    }

    async fn on_segment(
        ctx: &EndPointContext,
        connections: &mut FxHashMap<SocketAddr, PeerEntry>,
        accept_tx: &mpsc::Sender<Arc<Connection>>,
        from: SocketAddr,
        segment: Segment,
    ) {
        match connections.entry(from) {
            Entry::Occupied(mut e) => {
                let connection = e.get().connection.clone();
                if segment.kind == SegmentKind::Hello {
                    debug!("repeated hello from {:?} - replying again", from);
                    connection.send_hello().await;
                    return;
                }

                connection.on_segment(segment).instrument(Span::current()).await;

                if !e.get().established {
                    e.get_mut().established = true;
                    if let Err(err) = accept_tx.try_send(connection.clone()) {
                        warn!("unable to accept connection from {:?}: {}", from, err);
                        connection.abort().await;
                        e.remove();
                        return;
                    }
                    info!("accepted connection from {:?}", from);
                }

                if connection.is_finished().await {
                    debug!("connection to {:?} is finished", from);
                    e.remove();
                }
            }
            Entry::Vacant(e) => {
                match segment.kind {
                    SegmentKind::Hello => {
                        let seq = Sequence::for_profile(ctx.profile.seq_random);
                        let hello_seq = seq.next();
                        let connection = ctx.new_connection(from, seq, hello_seq, segment.seq);

                        debug!("hello from {:?} - waiting for the handshake to be confirmed", from);
                        connection.send_hello().await;
                        e.insert(PeerEntry {
                            connection,
                            established: false,
                            created_at: Instant::now(),
                        });
                    }
                    SegmentKind::Close => ctx.ack_stale_close(from, segment.seq).await,
                    _ => debug!("{:?} from {:?} without connection - dropping", segment, from),
                }
            }
        }
    }

    /// Removes finished connections, and drops connections whose handshake was not confirmed in
    ///  time. Unconfirmed connections repeat their Hello in case it was lost.
    async fn sweep(ctx: &EndPointContext, connections: &mut FxHashMap<SocketAddr, PeerEntry>) {
        let mut stale = Vec::new();
        for (&peer, entry) in connections.iter() {
            if entry.established {
                if entry.connection.is_finished().await {
                    debug!("connection to {:?} is finished", peer);
                    stale.push(peer);
                }
            }
            else if entry.created_at.elapsed() > ctx.profile.connect_timeout() {
                debug!("handshake with {:?} was not confirmed - dropping connection", peer);
                entry.connection.abort().await;
                stale.push(peer);
            }
            else {
                entry.connection.send_hello().await;
            }
        }

        for peer in stale {
            connections.remove(&peer);
        }
    }
}

/// Connects to a [Listener], retrying the handshake every `retx_start_ms` until it succeeds or
///  `connect_timeout_ms` elapses. The handshake is confirmed to the listener with a window update.
pub async fn dial(addr: SocketAddr, profile: Profile) -> anyhow::Result<Arc<Connection>> {
    profile.validate()?;

    let bind_addr = if addr.is_ipv4() {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    }
    else {
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
    };
    let socket = bind_udp_socket(bind_addr, &profile)?;
    let ctx = Arc::new(EndPointContext::new(socket, profile)?);
    debug!("dialing {:?} from {:?}", addr, ctx.local_addr);

    let seq = Sequence::for_profile(ctx.profile.seq_random);
    let hello_seq = seq.next();

    let peer_hello_seq = timeout(ctx.profile.connect_timeout(), handshake(&ctx, addr, hello_seq))
        .await
        .map_err(|_| anyhow!("timeout connecting to {:?}", addr))??;
    info!("connected to {:?}", addr);

    let connection = ctx.new_connection(addr, seq, hello_seq, peer_hello_seq);
    // confirms the handshake to the listener
    connection.send_window_update().await;
    let recv_handle = tokio::spawn(dialer_recv_loop(ctx, addr, Arc::downgrade(&connection)));
    connection.register_task(recv_handle);
    Ok(connection)
}

/// sends Hello until the peer replies with its own Hello, returning that Hello's sequence number
async fn handshake(ctx: &EndPointContext, addr: SocketAddr, hello_seq: u32) -> anyhow::Result<u32> {
    let hello = Segment::new_hello(hello_seq, &ctx.pool)?;
    let mut retry = interval(ctx.profile.retx_start());

    loop {
        select! {
            _ = retry.tick() => {
                trace!("sending hello #{} to {:?}", hello_seq, addr);
                ctx.socket.send_packet(addr, hello.wire().as_ref()).await?;
            }
            (from, segment) = ctx.recv_segment() => {
                if from == addr && segment.kind == SegmentKind::Hello {
                    return Ok(segment.seq);
                }
                debug!("received {:?} from {:?} during handshake - dropping", segment, from);
            }
        }
    }
}

async fn dialer_recv_loop(ctx: Arc<EndPointContext>, peer: SocketAddr, connection: Weak<Connection>) {
    loop {
        let (from, segment) = ctx.recv_segment().await;
        if from != peer {
            debug!("received datagram from unexpected sender {:?} - dropping", from);
            continue;
        }

        let Some(connection) = connection.upgrade() else {
            break;
        };
        if segment.kind == SegmentKind::Hello {
            // the listener repeats its Hello until it receives something from us
            trace!("repeated hello from {:?} - confirming again", peer);
            connection.send_window_update().await;
            continue;
        }

        let span = span!(Level::TRACE, "segment_received", %peer, seq = segment.seq);
        connection.on_segment(segment).instrument(span).await;
        if connection.is_finished().await {
            debug!("connection to {:?} is finished", peer);
            break;
        }
    }
    debug!("receive loop for {:?} finished", peer);
}
