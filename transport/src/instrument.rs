use std::net::SocketAddr;
use std::sync::Arc;
#[cfg(test)] use mockall::automock;
use tracing::trace;

/// Receives a connection's events, e.g. for metrics or debugging. Calls are made while the
///  portal's lock is held, so implementations must return quickly and must not block.
///
/// All methods default to doing nothing.
#[cfg_attr(test, automock)]
pub trait TransportInstrument: Send + Sync + 'static {
    fn tx_portal_capacity_changed(&self, _peer: SocketAddr, _capacity: usize) {}
    fn tx_portal_sz_changed(&self, _peer: SocketAddr, _tx_portal_sz: usize) {}
    fn tx_portal_rx_sz_changed(&self, _peer: SocketAddr, _rx_portal_sz: usize) {}
    fn duplicate_ack(&self, _peer: SocketAddr, _seq: u32) {}
    fn wire_message_tx(&self, _peer: SocketAddr, _seq: u32, _len: usize) {}
    fn wire_message_retx(&self, _peer: SocketAddr, _seq: u32, _len: usize) {}
    fn wire_message_rx(&self, _peer: SocketAddr, _seq: u32, _len: usize) {}
    fn new_rtt(&self, _peer: SocketAddr, _rtt_ms: u16) {}
    fn rx_portal_sz_changed(&self, _peer: SocketAddr, _rx_portal_sz: usize) {}
    fn malformed_segment(&self, _peer: SocketAddr, _reason: &str) {}
}

pub struct NoopInstrument;
impl TransportInstrument for NoopInstrument {}

/// Emits every event as a `trace` level log entry
pub struct TracingInstrument;
impl TransportInstrument for TracingInstrument {
    fn tx_portal_capacity_changed(&self, peer: SocketAddr, capacity: usize) {
        trace!(%peer, capacity, "tx portal capacity changed");
    }
    fn tx_portal_sz_changed(&self, peer: SocketAddr, tx_portal_sz: usize) {
        trace!(%peer, tx_portal_sz, "tx portal size changed");
    }
    fn tx_portal_rx_sz_changed(&self, peer: SocketAddr, rx_portal_sz: usize) {
        trace!(%peer, rx_portal_sz, "peer rx portal size changed");
    }
    fn duplicate_ack(&self, peer: SocketAddr, seq: u32) {
        trace!(%peer, seq, "duplicate ack");
    }
    fn wire_message_tx(&self, peer: SocketAddr, seq: u32, len: usize) {
        trace!(%peer, seq, len, "tx");
    }
    fn wire_message_retx(&self, peer: SocketAddr, seq: u32, len: usize) {
        trace!(%peer, seq, len, "retx");
    }
    fn wire_message_rx(&self, peer: SocketAddr, seq: u32, len: usize) {
        trace!(%peer, seq, len, "rx");
    }
    fn new_rtt(&self, peer: SocketAddr, rtt_ms: u16) {
        trace!(%peer, rtt_ms, "rtt sample");
    }
    fn rx_portal_sz_changed(&self, peer: SocketAddr, rx_portal_sz: usize) {
        trace!(%peer, rx_portal_sz, "rx portal size changed");
    }
    fn malformed_segment(&self, peer: SocketAddr, reason: &str) {
        trace!(%peer, reason, "malformed segment");
    }
}

/// Looks up an instrument by the name used in [Profile::instrument](crate::config::Profile::instrument)
pub fn instrument_for_name(name: &str) -> Option<Arc<dyn TransportInstrument>> {
    match name {
        "none" => Some(Arc::new(NoopInstrument)),
        "trace" => Some(Arc::new(TracingInstrument)),
        _ => None,
    }
}
