//! Interval scaling and jitter for periodic cluster-wide work.

use std::time::Duration;

use rand::Rng;

/// Cluster size up to which intervals are not scaled.
const SCALE_THRESHOLD: usize = 128;

/// Scale `interval` with the cluster size so that aggregate load on the
/// servers stays roughly flat: one extra multiple per doubling beyond
/// [`SCALE_THRESHOLD`] members.
pub fn ae_scale(interval: Duration, members: usize) -> Duration {
    if members <= SCALE_THRESHOLD {
        return interval;
    }
    let multiplier = ((members as f64).log2() - (SCALE_THRESHOLD as f64).log2()).ceil() + 1.0;
    interval.mul_f64(multiplier)
}

/// A uniformly random duration in `[0, interval)`.
pub fn random_stagger(interval: Duration) -> Duration {
    let nanos = interval.as_nanos().min(u64::MAX as u128) as u64;
    if nanos == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(rand::thread_rng().gen_range(0..nanos))
}
