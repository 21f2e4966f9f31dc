use std::time::Duration;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, trace};
use crate::config::Profile;
use crate::rtt::RttEstimator;
use crate::sequence::seq_cmp;

/// Increment of the retransmission timeout each time duplicate acks cause a capacity decrease
pub const DUP_ACK_RETX_ADD_MS: u64 = 10;

/// Upper bound for the retransmission timeout, no matter how often a segment was retried
pub const MAX_RETX_TIMEOUT_MS: u64 = 30_000;

struct RetxEntry {
    sent_at: Instant,
    retries: u32,
}

/// Keeps track of the send time of every segment in flight, determining which of them are due
///  for retransmission.
///
/// The monitor has no synchronization of its own: it lives inside the transmit portal's state
///  and is protected by the portal's lock, so that registering / removing a segment is atomic
///  with the portal's bookkeeping for that segment.
pub struct RetxMonitor {
    in_flight: FxHashMap<u32, RetxEntry>,
    rtt: RttEstimator,
    retx_start_ms: u64,
    retx_scale: f64,
    retx_add_ms: u64,
}

impl RetxMonitor {
    pub fn new(profile: &Profile) -> RetxMonitor {
        let mut in_flight = FxHashMap::default();
        in_flight.reserve(profile.tx_portal_tree_len);

        RetxMonitor {
            in_flight,
            rtt: RttEstimator::new(profile.rtt_probe_avg_ct),
            retx_start_ms: profile.retx_start_ms,
            retx_scale: profile.retx_scale,
            retx_add_ms: profile.retx_add_ms,
        }
    }

    pub fn add(&mut self, seq: u32, now: Instant) {
        trace!("monitoring #{} for retransmission", seq);
        self.in_flight.insert(seq, RetxEntry { sent_at: now, retries: 0 });
    }

    pub fn remove(&mut self, seq: u32) -> bool {
        self.in_flight.remove(&seq).is_some()
    }

    pub fn clear(&mut self) {
        self.in_flight.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    pub fn update_rtt_ms(&mut self, rtt_ms: u16) {
        self.rtt.add_sample(rtt_ms);
    }

    pub fn rtt_ms(&self) -> Option<u64> {
        self.rtt.rtt_ms()
    }

    /// Adds [DUP_ACK_RETX_ADD_MS] to the retransmission timeout for the rest of the connection's
    ///  lifetime
    pub fn relax_timeout(&mut self) {
        self.retx_add_ms += DUP_ACK_RETX_ADD_MS;
        debug!("relaxing retransmission timeout: retx_add_ms is now {}", self.retx_add_ms);
    }

    pub fn retx_add_ms(&self) -> u64 {
        self.retx_add_ms
    }

    /// The time a segment waits for its ack after its `retries`th retransmission
    pub fn timeout(&self, retries: u32) -> Duration {
        let base_ms = match self.rtt.rtt_ms() {
            Some(rtt_ms) => rtt_ms as f64 * self.retx_scale,
            None => self.retx_start_ms as f64,
        } + self.retx_add_ms as f64;

        let timeout_ms = (base_ms * self.retx_scale.powi(retries as i32))
            .min(MAX_RETX_TIMEOUT_MS as f64);
        Duration::from_millis(timeout_ms.round() as u64)
    }

    /// Returns the segments whose timeout expired, in the order they were originally sent. They
    ///  are considered retransmitted at `now`, i.e. their timeout starts over with one more retry.
    pub fn expired(&mut self, now: Instant) -> Vec<u32> {
        let timeouts = (0..=self.max_retries())
            .map(|retries| self.timeout(retries))
            .collect::<Vec<_>>();

        let mut result = self.in_flight.iter_mut()
            .filter(|(_, entry)| now.saturating_duration_since(entry.sent_at) >= timeouts[entry.retries as usize])
            .map(|(&seq, entry)| {
                entry.retries += 1;
                entry.sent_at = now;
                seq
            })
            .collect::<Vec<_>>();

        result.sort_by(|&a, &b| seq_cmp(a, b));
        result
    }

    fn max_retries(&self) -> u32 {
        self.in_flight.values()
            .map(|e| e.retries)
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn monitor() -> RetxMonitor {
        RetxMonitor::new(&Profile::default())
    }

    #[rstest]
    #[case::no_rtt(None, 0, 300)]
    #[case::no_rtt_first_retry(None, 1, 450)]
    #[case::no_rtt_second_retry(None, 2, 675)]
    #[case::rtt(Some(40), 0, 160)]
    #[case::rtt_retry(Some(40), 1, 240)]
    #[case::capped(None, 30, MAX_RETX_TIMEOUT_MS)]
    fn test_timeout(#[case] rtt_ms: Option<u16>, #[case] retries: u32, #[case] expected_ms: u64) {
        let mut monitor = monitor();
        if let Some(rtt_ms) = rtt_ms {
            monitor.update_rtt_ms(rtt_ms);
        }
        assert_eq!(monitor.timeout(retries), Duration::from_millis(expected_ms));
    }

    #[test]
    fn test_relax_timeout() {
        let mut monitor = monitor();
        monitor.relax_timeout();
        monitor.relax_timeout();
        assert_eq!(monitor.retx_add_ms(), 120);
        assert_eq!(monitor.timeout(0), Duration::from_millis(320));
    }

    #[test]
    fn test_add_remove() {
        let mut monitor = monitor();
        let now = Instant::now();
        monitor.add(1, now);
        monitor.add(2, now);
        assert_eq!(monitor.len(), 2);

        assert!(monitor.remove(1));
        assert!(!monitor.remove(1));
        assert!(!monitor.remove(3));
        assert_eq!(monitor.len(), 1);

        monitor.clear();
        assert!(monitor.is_empty());
    }

    #[test]
    fn test_expired() {
        let mut monitor = monitor();
        let start = Instant::now();
        monitor.add(u32::MAX, start);
        monitor.add(0, start);
        monitor.add(1, start + Duration::from_millis(100));

        assert!(monitor.expired(start + Duration::from_millis(299)).is_empty());
        assert_eq!(monitor.expired(start + Duration::from_millis(300)), vec![u32::MAX, 0]);

        // #1 is due now, the others were retried and wait 450ms
        assert_eq!(monitor.expired(start + Duration::from_millis(400)), vec![1]);
        assert!(monitor.expired(start + Duration::from_millis(749)).is_empty());
        assert_eq!(monitor.expired(start + Duration::from_millis(750)), vec![u32::MAX, 0]);
        assert_eq!(monitor.expired(start + Duration::from_millis(850)), vec![1]);
    }

    #[test]
    fn test_expired_removed_segment() {
        let mut monitor = monitor();
        let start = Instant::now();
        monitor.add(5, start);
        monitor.remove(5);
        assert!(monitor.expired(start + Duration::from_secs(10)).is_empty());
    }
}
