//! Randomized sleeps for retry backoff and inter-chunk pacing.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Uniform-ish duration in `[min_us, max_us]` microseconds.
pub fn random_between(min_us: u64, max_us: u64) -> Duration {
    if max_us <= min_us {
        return Duration::from_micros(min_us);
    }
    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u64(SEQUENCE.fetch_add(1, Ordering::Relaxed));
    if let Ok(now) = SystemTime::now().duration_since(UNIX_EPOCH) {
        hasher.write_u128(now.as_nanos());
    }
    let span = max_us - min_us + 1;
    Duration::from_micros(min_us + hasher.finish() % span)
}

/// Sleep for a random time in `[min_us, max_us]`; no-op when both are zero.
pub fn sleep_range_us(min_us: u64, max_us: u64) {
    if max_us == 0 {
        return;
    }
    thread::sleep(random_between(min_us, max_us));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_between_bounds() {
        for _ in 0..200 {
            let d = random_between(5000, 10000);
            assert!(d >= Duration::from_micros(5000));
            assert!(d <= Duration::from_micros(10000));
        }
    }

    #[test]
    fn test_degenerate_window() {
        assert_eq!(random_between(7, 7), Duration::from_micros(7));
        assert_eq!(random_between(9, 3), Duration::from_micros(9));
    }
}
