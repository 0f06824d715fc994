use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Strictly increasing sequence numbers that stay ahead of earlier runs.
///
/// Each value is `max(now_ms, last + 1)`, so a restarted process continues
/// above the numbers it published before, given a sane clock.
#[derive(Debug, Default)]
pub(crate) struct IncreasingSequence {
    last: Mutex<i64>,
}

impl IncreasingSequence {
    pub(crate) fn next(&self) -> i64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or(0);
        let mut last = self.last.lock();
        *last = now.max(last.saturating_add(1));
        *last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_values_strictly_increase() {
        let sequence = IncreasingSequence::default();
        let values: Vec<i64> = (0..1000).map(|_| sequence.next()).collect();
        assert!(values.windows(2).all(|w| w[0] < w[1]));
        assert!(values[0] > 1_600_000_000_000, "sequence starts at wall clock time");
    }
}
