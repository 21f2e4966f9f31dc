//! A reliable, ordered byte stream transport on top of UDP, with congestion-style adaptive
//!  window control.
//!
//! ## Design goals
//!
//! * Connections are point-to-point byte streams between two UDP endpoints
//!   * a [end_point::Listener] handles all connections through a single UDP socket,
//!      demultiplexing by peer address
//!   * [end_point::dial] uses a dedicated ephemeral UDP socket per connection
//! * Every segment carries a 32 bit sequence number; sequence numbers wrap around, all
//!    comparisons are wrap-around safe
//! * Data is split into segments that fit into a single datagram, avoiding IP-level fragmentation
//!   * configured maximum segment size, since path MTU discovery does not work reliably
//! * Every segment is acknowledged individually with a *range* of sequence numbers; senders
//!    retransmit unacknowledged segments with exponential backoff
//! * The amount of unacknowledged data (the *tx portal*) is bounded by an adaptive *capacity*
//!   * additive increase after a number of successful acks
//!   * multiplicative decrease on duplicate acks and on retransmissions
//!   * the receiver's advertised window (*rx portal size*) is a second upper bound
//! * Round trip time is measured with a 16 bit millisecond timestamp that the receiver echoes
//! * Closing is per direction: a Close segment is sequenced and acknowledged like data
//! * explicitly *not* part of this: stream multiplexing, NAT traversal
//! * encryption is layered on top: [stream::ConnectionStream] exposes a connection through tokio's
//!    I/O traits, and [secure] runs TLS over it
//!
//! ## Segment
//!
//! All numbers in network byte order (BE):
//!
//! ```ascii
//! 0:  flags (8 bits):
//!     * bit 0-2: kind of segment:
//!       * 000 DATA
//!       * 001 ACK
//!       * 010 CLOSE
//!       * 011 HELLO
//!     * bit 3: RTT - an RTT probe (DATA) or echo (ACK) follows the header
//!     * bit 4: RX_PORTAL_SZ - the receiver's window occupancy follows (ACK only)
//!     * bit 5-7: unused, must be 0
//! 1:  sequence number (u32). Always 0 for ACK.
//! ```
//!
//! *DATA*
//!
//! ```ascii
//! 0: RTT probe (u16) - only if the RTT flag is set: millis since the sender's start, truncated
//! *: payload, up to the end of the datagram
//! ```
//!
//! *ACK*
//!
//! ```ascii
//! 0: RTT echo (u16) - only if the RTT flag is set: the probe value being echoed
//! *: rx portal size (u32) - only if the RX_PORTAL_SZ flag is set
//! *: number of ranges (varint)
//! *: (repeated) first and last acknowledged sequence number of a range (u32, u32), inclusive
//! ```
//!
//! An ACK without ranges is a pure window update. An ACK with neither ranges nor optional fields
//!  is a window query: a sender that is blocked by the peer's window with nothing in flight
//!  sends it periodically, and the peer answers with a window update.
//!
//! *CLOSE*, *HELLO*
//!
//! ```ascii
//! [no payload]
//! ```
//!
//! HELLO is exchanged when a connection is established: the dialer repeats its HELLO until
//!  the listener replies with its own, and confirms with a window update. The listener repeats
//!  its HELLO until it receives the confirmation. Each side's first DATA segment has the
//!  sequence number following its HELLO's.

pub mod buffers;
pub mod config;
pub mod connection;
pub mod end_point;
pub mod error;
pub mod instrument;
mod retx_monitor;
pub mod rtt;
mod rx_portal;
pub mod secure;
pub mod segment;
pub mod send_pipeline;
pub mod sequence;
pub mod stream;
pub mod tx_portal;

pub use config::Profile;
pub use connection::Connection;
pub use end_point::{dial, Listener};
pub use error::{TransportError, TransportResult};
pub use stream::ConnectionStream;
