/// Rolling average over the most recent round trip time samples (in milliseconds) reported by
///  echoed RTT probes.
pub struct RttEstimator {
    samples: Vec<u16>,
    next: usize,
    max_samples: usize,
    cached_sum: u64,
}

impl RttEstimator {
    pub fn new(max_samples: usize) -> RttEstimator {
        let max_samples = max_samples.max(1);
        RttEstimator {
            samples: Vec::with_capacity(max_samples),
            next: 0,
            max_samples,
            cached_sum: 0,
        }
    }

    pub fn add_sample(&mut self, rtt_ms: u16) {
        if self.samples.len() < self.max_samples {
            self.samples.push(rtt_ms);
        }
        else {
            self.cached_sum -= self.samples[self.next] as u64;
            self.samples[self.next] = rtt_ms;
            self.next = (self.next + 1) % self.max_samples;
        }
        self.cached_sum += rtt_ms as u64;
    }

    /// `None` until the first sample was added
    pub fn rtt_ms(&self) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.cached_sum / self.samples.len() as u64)
    }

    pub fn num_samples(&self) -> usize {
        self.samples.len()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::empty(3, vec![], None)]
    #[case::single(3, vec![10], Some(10))]
    #[case::growing(3, vec![10, 20], Some(15))]
    #[case::full(3, vec![10, 20, 30], Some(20))]
    #[case::evicting(3, vec![10, 20, 30, 60], Some(36))]
    #[case::evicting_wrapped(2, vec![1, 2, 3, 4, 5], Some(4))]
    #[case::zero_max_samples(0, vec![7, 9], Some(9))]
    fn test_rtt_ms(#[case] max_samples: usize, #[case] samples: Vec<u16>, #[case] expected: Option<u64>) {
        let mut rtt = RttEstimator::new(max_samples);
        for s in samples {
            rtt.add_sample(s);
        }
        assert_eq!(rtt.rtt_ms(), expected);
    }

    #[test]
    fn test_num_samples_is_bounded() {
        let mut rtt = RttEstimator::new(4);
        for s in 0..100 {
            rtt.add_sample(s);
        }
        assert_eq!(rtt.num_samples(), 4);
        assert_eq!(rtt.rtt_ms(), Some((96 + 97 + 98 + 99) / 4));
    }
}
