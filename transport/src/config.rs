use std::fmt::{Display, Formatter};
use std::path::Path;
use std::time::Duration;
use anyhow::{bail, Context};
use serde::Deserialize;
use crate::instrument::instrument_for_name;
use crate::segment::{HEADER_LEN, RTT_PROBE_LEN};

/// The largest UDP payload that fits into an IPV4 datagram
const MAX_UDP_PAYLOAD: usize = 65507;

/// Tunable parameters of a connection. A profile is read once (typically from a TOML file), validated,
///  and then shared immutably by all parts of a connection.
///
/// Every field has a default, so a TOML document needs to contain only the fields that deviate
///  from them. Unknown fields are rejected to catch typos early.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Profile {
    /// Start each direction's sequence numbers at a random value rather than at 0
    pub seq_random: bool,

    /// Initial capacity of the transmit portal in bytes
    pub tx_portal_start_sz: usize,
    pub tx_portal_min_sz: usize,
    pub tx_portal_max_sz: usize,

    /// Number of consecutive successful acks after which capacity is increased by the number of
    ///  bytes they acknowledged, scaled by `tx_portal_increase_scale`
    pub tx_portal_increase_thresh: u32,
    pub tx_portal_increase_scale: f64,

    /// Number of duplicate acks after which capacity is scaled by `tx_portal_dup_ack_capacity_scale`
    pub tx_portal_dup_ack_thresh: u32,
    pub tx_portal_dup_ack_capacity_scale: f64,
    pub tx_portal_dup_ack_success_scale: f64,

    /// Number of retransmissions after which capacity is scaled by `tx_portal_retx_capacity_scale`
    pub tx_portal_retx_thresh: u32,
    pub tx_portal_retx_capacity_scale: f64,
    pub tx_portal_retx_success_scale: f64,

    /// Retransmission timeout before the first RTT sample is available
    pub retx_start_ms: u64,
    /// Factor applied to the averaged RTT, and once more for every retry of the same segment
    pub retx_scale: f64,
    /// Added to the retransmission timeout. This is the starting point of a connection's
    ///  self-tuning backoff: it grows on every decrease triggered by duplicate acks.
    pub retx_add_ms: u64,
    /// Granularity of the retransmission timer
    pub retx_tick_ms: u64,

    /// Minimum interval between two RTT probes embedded in data segments
    pub rtt_probe_ms: u64,
    /// Number of RTT samples that are averaged
    pub rtt_probe_avg_ct: usize,

    /// Maximum number of bytes per data segment, including the RTT probe but excluding the header.
    ///  Together with the header, this must fit into a single UDP datagram without IP
    ///  fragmentation on all routes between the peers.
    pub max_segment_sz: usize,

    pub pool_buffer_sz: usize,
    /// Number of idle buffers kept in the pool
    pub pool_max_buffers: usize,

    /// Receive window of a connection in bytes. This is also requested as the UDP socket's
    ///  receive buffer size.
    pub rx_buffer_sz: usize,
    /// Requested as the UDP socket's send buffer size
    pub tx_buffer_sz: usize,

    /// Expected number of segments in flight per connection, used for pre-allocation
    pub tx_portal_tree_len: usize,
    pub reads_q_len: usize,
    pub accept_q_len: usize,

    pub connect_timeout_ms: u64,

    /// Name of the instrumentation receiving a connection's events: `none` or `trace`
    pub instrument: String,
}

impl Default for Profile {
    fn default() -> Self {
        Profile {
            seq_random: true,
            tx_portal_start_sz: 16384,
            tx_portal_min_sz: 16384,
            tx_portal_max_sz: 4096000,
            tx_portal_increase_thresh: 224,
            tx_portal_increase_scale: 1.0,
            tx_portal_dup_ack_thresh: 64,
            tx_portal_dup_ack_capacity_scale: 0.9,
            tx_portal_dup_ack_success_scale: 0.9,
            tx_portal_retx_thresh: 64,
            tx_portal_retx_capacity_scale: 0.75,
            tx_portal_retx_success_scale: 0.825,
            retx_start_ms: 200,
            retx_scale: 1.5,
            retx_add_ms: 100,
            retx_tick_ms: 10,
            rtt_probe_ms: 50,
            rtt_probe_avg_ct: 8,
            max_segment_sz: 1420,
            pool_buffer_sz: 64 * 1024,
            pool_max_buffers: 4096,
            rx_buffer_sz: 16_000_000,
            tx_buffer_sz: 16_000_000,
            tx_portal_tree_len: 1024,
            reads_q_len: 1024,
            accept_q_len: 1024,
            connect_timeout_ms: 5000,
            instrument: "none".to_string(),
        }
    }
}

impl Profile {
    pub fn from_toml_str(s: &str) -> anyhow::Result<Profile> {
        let profile: Profile = toml::from_str(s)?;
        profile.validate()?;
        Ok(profile)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Profile> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("error reading profile {:?}", path))?;
        Self::from_toml_str(&s)
            .with_context(|| format!("invalid profile {:?}", path))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tx_portal_min_sz > self.tx_portal_max_sz {
            bail!("invalid 'tx_portal_min_sz': {} is bigger than 'tx_portal_max_sz' ({})", self.tx_portal_min_sz, self.tx_portal_max_sz);
        }
        if self.tx_portal_start_sz < self.tx_portal_min_sz || self.tx_portal_start_sz > self.tx_portal_max_sz {
            bail!("invalid 'tx_portal_start_sz': {} is outside [{}, {}]", self.tx_portal_start_sz, self.tx_portal_min_sz, self.tx_portal_max_sz);
        }

        Self::check_positive("tx_portal_increase_thresh", self.tx_portal_increase_thresh as u64)?;
        Self::check_positive("tx_portal_dup_ack_thresh", self.tx_portal_dup_ack_thresh as u64)?;
        Self::check_positive("tx_portal_retx_thresh", self.tx_portal_retx_thresh as u64)?;

        if !(self.tx_portal_increase_scale > 0.0) {
            bail!("invalid 'tx_portal_increase_scale': {} must be positive", self.tx_portal_increase_scale);
        }
        Self::check_decrease_scale("tx_portal_dup_ack_capacity_scale", self.tx_portal_dup_ack_capacity_scale)?;
        Self::check_decrease_scale("tx_portal_dup_ack_success_scale", self.tx_portal_dup_ack_success_scale)?;
        Self::check_decrease_scale("tx_portal_retx_capacity_scale", self.tx_portal_retx_capacity_scale)?;
        Self::check_decrease_scale("tx_portal_retx_success_scale", self.tx_portal_retx_success_scale)?;

        if !(self.retx_scale >= 1.0) {
            bail!("invalid 'retx_scale': {} must be at least 1.0", self.retx_scale);
        }
        Self::check_positive("retx_start_ms", self.retx_start_ms)?;
        Self::check_positive("retx_tick_ms", self.retx_tick_ms)?;
        Self::check_positive("rtt_probe_avg_ct", self.rtt_probe_avg_ct as u64)?;

        if self.max_segment_sz <= RTT_PROBE_LEN {
            bail!("invalid 'max_segment_sz': {} leaves no room for payload", self.max_segment_sz);
        }
        if self.max_segment_sz + HEADER_LEN > MAX_UDP_PAYLOAD {
            bail!("invalid 'max_segment_sz': {} does not fit into a UDP datagram", self.max_segment_sz);
        }
        if self.max_segment_sz > self.tx_portal_min_sz {
            bail!("invalid 'max_segment_sz': {} is bigger than 'tx_portal_min_sz' ({}), which can block transmission", self.max_segment_sz, self.tx_portal_min_sz);
        }
        if self.max_segment_sz > self.rx_buffer_sz {
            bail!("invalid 'max_segment_sz': {} is bigger than 'rx_buffer_sz' ({})", self.max_segment_sz, self.rx_buffer_sz);
        }
        if self.pool_buffer_sz < self.max_segment_sz + HEADER_LEN {
            bail!("invalid 'pool_buffer_sz': {} cannot hold a segment of 'max_segment_sz' ({}) plus header", self.pool_buffer_sz, self.max_segment_sz);
        }

        Self::check_positive("tx_portal_tree_len", self.tx_portal_tree_len as u64)?;
        Self::check_positive("reads_q_len", self.reads_q_len as u64)?;
        Self::check_positive("accept_q_len", self.accept_q_len as u64)?;
        Self::check_positive("connect_timeout_ms", self.connect_timeout_ms)?;

        if instrument_for_name(&self.instrument).is_none() {
            bail!("invalid 'instrument': unknown instrument {:?}", self.instrument);
        }

        Ok(())
    }

    fn check_positive(name: &str, value: u64) -> anyhow::Result<()> {
        if value == 0 {
            bail!("invalid '{}': must be positive", name);
        }
        Ok(())
    }

    fn check_decrease_scale(name: &str, value: f64) -> anyhow::Result<()> {
        if !(value > 0.0 && value <= 1.0) {
            bail!("invalid '{}': {} is outside (0.0, 1.0]", name, value);
        }
        Ok(())
    }

    pub fn retx_start(&self) -> Duration {
        Duration::from_millis(self.retx_start_ms)
    }

    pub fn retx_tick(&self) -> Duration {
        Duration::from_millis(self.retx_tick_ms)
    }

    pub fn rtt_probe_interval(&self) -> Duration {
        Duration::from_millis(self.rtt_probe_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Display for Profile {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "profile {{")?;
        writeln!(f, "\t{:<34} {}", "seq_random", self.seq_random)?;
        writeln!(f, "\t{:<34} {}", "tx_portal_start_sz", self.tx_portal_start_sz)?;
        writeln!(f, "\t{:<34} {}", "tx_portal_min_sz", self.tx_portal_min_sz)?;
        writeln!(f, "\t{:<34} {}", "tx_portal_max_sz", self.tx_portal_max_sz)?;
        writeln!(f, "\t{:<34} {}", "tx_portal_increase_thresh", self.tx_portal_increase_thresh)?;
        writeln!(f, "\t{:<34} {:.4}", "tx_portal_increase_scale", self.tx_portal_increase_scale)?;
        writeln!(f, "\t{:<34} {}", "tx_portal_dup_ack_thresh", self.tx_portal_dup_ack_thresh)?;
        writeln!(f, "\t{:<34} {:.4}", "tx_portal_dup_ack_capacity_scale", self.tx_portal_dup_ack_capacity_scale)?;
        writeln!(f, "\t{:<34} {:.4}", "tx_portal_dup_ack_success_scale", self.tx_portal_dup_ack_success_scale)?;
        writeln!(f, "\t{:<34} {}", "tx_portal_retx_thresh", self.tx_portal_retx_thresh)?;
        writeln!(f, "\t{:<34} {:.4}", "tx_portal_retx_capacity_scale", self.tx_portal_retx_capacity_scale)?;
        writeln!(f, "\t{:<34} {:.4}", "tx_portal_retx_success_scale", self.tx_portal_retx_success_scale)?;
        writeln!(f, "\t{:<34} {}", "retx_start_ms", self.retx_start_ms)?;
        writeln!(f, "\t{:<34} {:.4}", "retx_scale", self.retx_scale)?;
        writeln!(f, "\t{:<34} {}", "retx_add_ms", self.retx_add_ms)?;
        writeln!(f, "\t{:<34} {}", "retx_tick_ms", self.retx_tick_ms)?;
        writeln!(f, "\t{:<34} {}", "rtt_probe_ms", self.rtt_probe_ms)?;
        writeln!(f, "\t{:<34} {}", "rtt_probe_avg_ct", self.rtt_probe_avg_ct)?;
        writeln!(f, "\t{:<34} {}", "max_segment_sz", self.max_segment_sz)?;
        writeln!(f, "\t{:<34} {}", "pool_buffer_sz", self.pool_buffer_sz)?;
        writeln!(f, "\t{:<34} {}", "pool_max_buffers", self.pool_max_buffers)?;
        writeln!(f, "\t{:<34} {}", "rx_buffer_sz", self.rx_buffer_sz)?;
        writeln!(f, "\t{:<34} {}", "tx_buffer_sz", self.tx_buffer_sz)?;
        writeln!(f, "\t{:<34} {}", "tx_portal_tree_len", self.tx_portal_tree_len)?;
        writeln!(f, "\t{:<34} {}", "reads_q_len", self.reads_q_len)?;
        writeln!(f, "\t{:<34} {}", "accept_q_len", self.accept_q_len)?;
        writeln!(f, "\t{:<34} {}", "connect_timeout_ms", self.connect_timeout_ms)?;
        writeln!(f, "\t{:<34} {}", "instrument", self.instrument)?;
        write!(f, "}}")
    }
}
