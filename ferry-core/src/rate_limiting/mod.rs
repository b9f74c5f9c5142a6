use std::num::NonZeroU32;

use ferry_common::FerryError;

mod limiter;
mod registry;
mod shared_limiter;
mod stream;

pub use limiter::FerryRateLimiter;
pub use registry::RateLimiterRegistry;
pub use shared_limiter::SharedFerryRateLimiter;
pub use stream::RateLimitedStream;

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum RateLimiterDirection {
    /// Bytes received from the server
    Read,
    /// Bytes sent to the server
    Write,
}

pub fn assert_valid_quota(v: u32) -> Result<NonZeroU32, FerryError> {
    NonZeroU32::new(v).ok_or(FerryError::RateLimiterInvalidQuota(v))
}
