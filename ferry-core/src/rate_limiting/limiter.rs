use std::fmt::Debug;
use std::num::NonZeroU32;
use std::time::Duration;

use ferry_common::{BurstTolerance, FerryError};
use governor::clock::{Clock, QuantaClock};
use governor::{DefaultDirectRateLimiter, Quota};

use super::{assert_valid_quota, RateLimiterDirection, SharedFerryRateLimiter};

struct Bucket {
    limiter: DefaultDirectRateLimiter,
    bytes_per_second: NonZeroU32,
    burst: NonZeroU32,
}

impl Bucket {
    fn new(bytes_per_second: NonZeroU32, tolerance: BurstTolerance) -> Self {
        let burst = bytes_per_second.saturating_mul(
            NonZeroU32::new(tolerance.multiplier()).unwrap_or(NonZeroU32::MIN),
        );
        Self {
            limiter: DefaultDirectRateLimiter::direct(
                Quota::per_second(bytes_per_second).allow_burst(burst),
            ),
            bytes_per_second,
            burst,
        }
    }
}

/// Token buckets for both directions of every socket of one engine context.
///
/// Only ever used through [SharedFerryRateLimiter] so that it sits behind a
/// sync mutex which cannot be held across an await. A `tokio::sync::Mutex`
/// here would deadlock the read and write halves of a split stream when
/// both have a pending wait.
pub struct FerryRateLimiter {
    inbound: Option<Bucket>,
    outbound: Option<Bucket>,
}

impl Debug for FerryRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FerryRateLimiter")
            .field("inbound", &self.inbound.as_ref().map(|b| b.bytes_per_second))
            .field("outbound", &self.outbound.as_ref().map(|b| b.bytes_per_second))
            .finish()
    }
}

impl FerryRateLimiter {
    pub fn unlimited() -> SharedFerryRateLimiter {
        Self {
            inbound: None,
            outbound: None,
        }
        .share()
    }

    #[allow(clippy::new_ret_no_self)]
    pub fn new(
        inbound: Option<u32>,
        outbound: Option<u32>,
        tolerance: BurstTolerance,
    ) -> Result<SharedFerryRateLimiter, FerryError> {
        let mut limiter = Self {
            inbound: None,
            outbound: None,
        };
        limiter.replace(inbound, outbound, tolerance)?;
        Ok(limiter.share())
    }

    /// Installs new limits. `None` removes the limit of that direction.
    pub fn replace(
        &mut self,
        inbound: Option<u32>,
        outbound: Option<u32>,
        tolerance: BurstTolerance,
    ) -> Result<(), FerryError> {
        let make = |bps: Option<u32>| -> Result<Option<Bucket>, FerryError> {
            bps.map(|b| Ok(Bucket::new(assert_valid_quota(b)?, tolerance)))
                .transpose()
        };
        self.inbound = make(inbound)?;
        self.outbound = make(outbound)?;
        Ok(())
    }

    fn bucket(&self, direction: RateLimiterDirection) -> Option<&Bucket> {
        match direction {
            RateLimiterDirection::Read => self.inbound.as_ref(),
            RateLimiterDirection::Write => self.outbound.as_ref(),
        }
    }

    pub fn bytes_per_second(&self, direction: RateLimiterDirection) -> Option<NonZeroU32> {
        self.bucket(direction).map(|b| b.bytes_per_second)
    }

    /// Largest single I/O that can ever be admitted in one go.
    pub fn max_chunk(&self, direction: RateLimiterDirection) -> Option<usize> {
        self.bucket(direction).map(|b| b.burst.get() as usize)
    }

    /// Consumes `bytes` tokens if they are available and returns `None`,
    /// otherwise leaves the bucket untouched and returns how long to wait
    /// before trying again.
    #[must_use = "Must use the wait time"]
    pub fn bytes_ready_at(
        &self,
        direction: RateLimiterDirection,
        bytes: usize,
    ) -> Result<Option<Duration>, FerryError> {
        let Some(bucket) = self.bucket(direction) else {
            return Ok(None);
        };
        let bytes = u32::try_from(bytes).unwrap_or(u32::MAX).min(bucket.burst.get());
        let Some(bytes) = NonZeroU32::new(bytes) else {
            return Ok(None);
        };
        match bucket
            .limiter
            .check_n(bytes)
            .map_err(|_| FerryError::RateLimiterInsufficientCapacity)?
        {
            Ok(()) => Ok(None),
            Err(not_until) => Ok(Some(
                not_until.wait_time_from(QuantaClock::default().now()),
            )),
        }
    }

    fn share(self) -> SharedFerryRateLimiter {
        SharedFerryRateLimiter::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_never_waits() {
        let limiter = FerryRateLimiter::unlimited();
        let guard = limiter.lock();
        assert_eq!(
            guard
                .bytes_ready_at(RateLimiterDirection::Read, 1 << 30)
                .unwrap(),
            None
        );
        assert_eq!(guard.max_chunk(RateLimiterDirection::Write), None);
    }

    #[test]
    fn burst_follows_tolerance() {
        let limiter =
            FerryRateLimiter::new(Some(1000), None, BurstTolerance::VeryHigh).unwrap();
        let guard = limiter.lock();
        assert_eq!(guard.max_chunk(RateLimiterDirection::Read), Some(5000));
        assert_eq!(guard.max_chunk(RateLimiterDirection::Write), None);
    }

    #[test]
    fn exhausted_bucket_reports_wait() {
        let limiter = FerryRateLimiter::new(None, Some(1000), BurstTolerance::Normal).unwrap();
        let guard = limiter.lock();
        assert_eq!(
            guard
                .bytes_ready_at(RateLimiterDirection::Write, 1000)
                .unwrap(),
            None
        );
        let wait = guard
            .bytes_ready_at(RateLimiterDirection::Write, 500)
            .unwrap()
            .unwrap();
        assert!(wait > Duration::from_millis(100));
        assert!(wait <= Duration::from_millis(600));
    }

    #[test]
    fn zero_quota_is_rejected() {
        assert!(matches!(
            FerryRateLimiter::new(Some(0), None, BurstTolerance::Normal),
            Err(FerryError::RateLimiterInvalidQuota(0))
        ));
    }
}
