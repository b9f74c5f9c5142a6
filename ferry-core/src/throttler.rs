use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Hosts that asked to be left alone for a while, e.g. through an HTTP
/// `Retry-After` header.
#[derive(Default, Debug)]
pub struct Throttler {
    hosts: Mutex<HashMap<String, Instant>>,
}

impl Throttler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn throttle(&self, host: &str, backoff: Duration) {
        let until = Instant::now() + backoff;
        #[allow(clippy::unwrap_used, reason = "panic on poison")]
        let mut hosts = self.hosts.lock().unwrap();
        let entry = hosts.entry(host.to_ascii_lowercase()).or_insert(until);
        if *entry < until {
            *entry = until;
        }
    }

    /// Time left before `host` may be contacted again.
    pub fn get_throttle(&self, host: &str) -> Option<Duration> {
        let now = Instant::now();
        #[allow(clippy::unwrap_used, reason = "panic on poison")]
        let mut hosts = self.hosts.lock().unwrap();
        hosts.retain(|_, until| *until > now);
        hosts
            .get(&host.to_ascii_lowercase())
            .map(|until| until.duration_since(now))
    }
}
