use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicU32, Ordering};

/// Source of the sequence numbers for one direction of a connection. Sequence numbers are
///  wrap-around, so 0 follows after FFFFFFFF.
#[derive(Debug)]
pub struct Sequence {
    next: AtomicU32,
}

impl Sequence {
    pub fn new(start: u32) -> Sequence {
        Sequence {
            next: AtomicU32::new(start),
        }
    }

    pub fn random() -> Sequence {
        Sequence::new(rand::random())
    }

    pub fn for_profile(seq_random: bool) -> Sequence {
        if seq_random {
            Sequence::random()
        }
        else {
            Sequence::new(0)
        }
    }

    pub fn next(&self) -> u32 {
        self.next.fetch_add(1, Ordering::AcqRel)
    }

    pub fn peek(&self) -> u32 {
        self.next.load(Ordering::Acquire)
    }
}

/// `true` if `seq` is `base` or comes after it, interpreting the difference with wrap-around
///  semantics (i.e. at most half the sequence number space ahead)
pub fn seq_at_or_after(seq: u32, base: u32) -> bool {
    seq.wrapping_sub(base) < 0x8000_0000
}

/// Orders sequence numbers by their position in the (wrap-around) sequence
pub fn seq_cmp(a: u32, b: u32) -> CmpOrdering {
    if a == b {
        CmpOrdering::Equal
    }
    else if seq_at_or_after(a, b) {
        CmpOrdering::Greater
    }
    else {
        CmpOrdering::Less
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_next() {
        let seq = Sequence::new(5);
        assert_eq!(seq.next(), 5);
        assert_eq!(seq.next(), 6);
        assert_eq!(seq.peek(), 7);
    }

    #[test]
    fn test_next_wraps() {
        let seq = Sequence::new(u32::MAX);
        assert_eq!(seq.next(), u32::MAX);
        assert_eq!(seq.next(), 0);
    }

    #[test]
    fn test_for_profile_not_random() {
        assert_eq!(Sequence::for_profile(false).peek(), 0);
    }

    #[rstest]
    #[case::same(5, 5, true)]
    #[case::after(6, 5, true)]
    #[case::before(4, 5, false)]
    #[case::after_wrapped(2, u32::MAX - 2, true)]
    #[case::before_wrapped(u32::MAX - 2, 2, false)]
    #[case::half_space(0x8000_0000, 0, false)]
    fn test_seq_at_or_after(#[case] seq: u32, #[case] base: u32, #[case] expected: bool) {
        assert_eq!(seq_at_or_after(seq, base), expected);
    }

    #[test]
    fn test_seq_cmp_sort() {
        let mut seqs = vec![1, u32::MAX, 0, u32::MAX - 1, 2];
        seqs.sort_by(|&a, &b| seq_cmp(a, b));
        assert_eq!(seqs, vec![u32::MAX - 1, u32::MAX, 0, 1, 2]);
    }
}
