use std::sync::Arc;

use ferry_common::{BurstTolerance, FerryError, OptionId, Options};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{FerryRateLimiter, SharedFerryRateLimiter};

/// Owns the limiter shared by every socket of one engine context and keeps
/// it in sync with the speed limit options.
pub struct RateLimiterRegistry {
    options: Arc<Options>,
    global_rate_limiter: SharedFerryRateLimiter,
}

impl RateLimiterRegistry {
    pub fn new(options: Arc<Options>) -> Result<Self, FerryError> {
        let this = Self {
            options,
            global_rate_limiter: FerryRateLimiter::unlimited(),
        };
        this.refresh()?;
        Ok(this)
    }

    pub fn global(&self) -> SharedFerryRateLimiter {
        self.global_rate_limiter.clone()
    }

    fn quotas(&self) -> (Option<u32>, Option<u32>, BurstTolerance) {
        if !self.options.get_bool(OptionId::SpeedLimitEnable) {
            return (None, None, BurstTolerance::Normal);
        }
        let kib = |id| {
            let v = self.options.get_int(id);
            (v > 0).then(|| u32::try_from(v.saturating_mul(1024)).unwrap_or(u32::MAX))
        };
        (
            kib(OptionId::SpeedLimitInbound),
            kib(OptionId::SpeedLimitOutbound),
            BurstTolerance::from_option(self.options.get_int(OptionId::SpeedLimitBurstTolerance)),
        )
    }

    pub fn refresh(&self) -> Result<(), FerryError> {
        let (inbound, outbound, tolerance) = self.quotas();
        debug!(?inbound, ?outbound, ?tolerance, "Updating speed limits");
        self.global_rate_limiter
            .lock()
            .replace(inbound, outbound, tolerance)
    }

    /// Re-reads the limits whenever an option changes.
    pub fn watch(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::downgrade(self);
        let mut rx = self.options.subscribe();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let Some(this) = this.upgrade() else {
                    break;
                };
                if let Err(error) = this.refresh() {
                    warn!(%error, "Could not apply speed limits");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limiting::RateLimiterDirection;

    #[test]
    fn limits_follow_options() {
        let options = Arc::new(Options::new());
        let registry = RateLimiterRegistry::new(options.clone()).unwrap();
        let limiter = registry.global();
        assert!(limiter.same_as(&registry.global()));
        assert!(limiter
            .lock()
            .bytes_per_second(RateLimiterDirection::Read)
            .is_none());

        options.set_int(OptionId::SpeedLimitEnable, 1).unwrap();
        options.set_int(OptionId::SpeedLimitInbound, 10).unwrap();
        options.set_int(OptionId::SpeedLimitOutbound, 0).unwrap();
        registry.refresh().unwrap();

        let guard = limiter.lock();
        assert_eq!(
            guard
                .bytes_per_second(RateLimiterDirection::Read)
                .map(|v| v.get()),
            Some(10 * 1024)
        );
        assert!(guard.bytes_per_second(RateLimiterDirection::Write).is_none());
    }

    #[tokio::test]
    async fn watcher_picks_up_changes() {
        let options = Arc::new(Options::new());
        let registry = Arc::new(RateLimiterRegistry::new(options.clone()).unwrap());
        let _watcher = registry.watch();

        options.set_int(OptionId::SpeedLimitEnable, 1).unwrap();
        for _ in 0..50 {
            if registry
                .global()
                .lock()
                .bytes_per_second(RateLimiterDirection::Read)
                .is_some()
            {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("limits were not refreshed");
    }
}
