use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ferry_common::{DirectoryCache, FerryError, MemoryDirectoryCache, OptionId, Options};
use ferry_tls::TrustedCertificates;

use crate::activity::ActivityLogger;
use crate::buffer_pool::BufferPool;
use crate::capabilities::CapabilityCache;
use crate::lock_manager::OpLockManager;
use crate::rate_limiting::RateLimiterRegistry;
use crate::throttler::Throttler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyStatus {
    Trusted,
    Unknown,
    /// A different key was trusted for this host before
    Changed,
}

/// SSH host keys the user accepted, by host and port.
#[derive(Debug, Default)]
pub struct HostKeyStore {
    keys: Mutex<HashMap<(String, u16), String>>,
}

impl HostKeyStore {
    pub fn check(&self, host: &str, port: u16, fingerprint: &str) -> HostKeyStatus {
        #[allow(clippy::unwrap_used, reason = "panic on poison")]
        let keys = self.keys.lock().unwrap();
        match keys.get(&(host.to_ascii_lowercase(), port)) {
            Some(known) if known == fingerprint => HostKeyStatus::Trusted,
            Some(_) => HostKeyStatus::Changed,
            None => HostKeyStatus::Unknown,
        }
    }

    pub fn trust(&self, host: &str, port: u16, fingerprint: &str) {
        #[allow(clippy::unwrap_used, reason = "panic on poison")]
        let mut keys = self.keys.lock().unwrap();
        keys.insert((host.to_ascii_lowercase(), port), fingerprint.to_owned());
    }
}

/// The services shared by every control socket and transfer of one
/// engine context.
#[derive(Clone)]
pub struct EngineContext {
    pub options: Arc<Options>,
    pub directory_cache: Arc<dyn DirectoryCache>,
    pub lock_manager: Arc<OpLockManager>,
    pub throttler: Arc<Throttler>,
    pub capabilities: Arc<CapabilityCache>,
    pub rate_limiters: Arc<RateLimiterRegistry>,
    pub activity: Arc<ActivityLogger>,
    pub buffer_pool: BufferPool,
    pub trusted_certificates: TrustedCertificates,
    pub host_keys: Arc<HostKeyStore>,
}

impl EngineContext {
    /// Uses an in-memory directory cache unless `directory_cache` is given.
    pub fn new(
        options: Arc<Options>,
        directory_cache: Option<Arc<dyn DirectoryCache>>,
    ) -> Result<Self, FerryError> {
        let buffer_count = options.get_int(OptionId::BufferCount) as usize;
        let buffer_size = options.get_int(OptionId::BufferSize) as usize;
        Ok(Self {
            rate_limiters: Arc::new(RateLimiterRegistry::new(options.clone())?),
            directory_cache: directory_cache
                .unwrap_or_else(|| Arc::new(MemoryDirectoryCache::new())),
            lock_manager: OpLockManager::new(),
            throttler: Arc::new(Throttler::new()),
            capabilities: Arc::new(CapabilityCache::new()),
            activity: Arc::new(ActivityLogger::new()),
            buffer_pool: BufferPool::new(buffer_count, buffer_size),
            trusted_certificates: TrustedCertificates::default(),
            host_keys: Arc::new(HostKeyStore::default()),
            options,
        })
    }
}
