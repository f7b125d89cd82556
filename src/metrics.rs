//! Synthesized lock statistics for the `top` command. Tools like mongostat
//! expect non-zero read/write lock figures; the values are cosmetic, bounded,
//! and injectable so tests can pin them.

use rand::Rng;

pub trait MetricsSource: Send + Sync {
    /// Microseconds attributed to one lock bucket, in 800..1200.
    fn lock_time(&self) -> i64;
    /// Operation count attributed to one lock bucket, in 10..100.
    fn lock_count(&self) -> i64;
}

pub struct RandomMetrics;

impl MetricsSource for RandomMetrics {
    fn lock_time(&self) -> i64 {
        rand::thread_rng().gen_range(800..1200)
    }

    fn lock_count(&self) -> i64 {
        rand::thread_rng().gen_range(10..100)
    }
}

/// Deterministic source for tests.
pub struct FixedMetrics {
    pub time: i64,
    pub count: i64,
}

impl MetricsSource for FixedMetrics {
    fn lock_time(&self) -> i64 {
        self.time
    }

    fn lock_count(&self) -> i64 {
        self.count
    }
}
