use std::collections::HashMap;
use std::sync::RwLock;

use ferry_common::ServerKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Server mishandles `REST` beyond 2 GiB
    ResumeBug2Gb,
    /// Server mishandles `REST` beyond 4 GiB
    ResumeBug4Gb,
    RestStream,
    Size,
    Mdtm,
    Mfmt,
    Mlsd,
    Utf8,
    Epsv,
    Clnt,
    ListHiddenFiles,
    /// Data connections resumed the control connection's TLS session
    TlsResumption,
    /// `TYPE` command the server accepted last
    TransferType,
    Timezone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CapabilityState {
    #[default]
    Unknown,
    Yes,
    No,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct Entry {
    state: CapabilityState,
    value: Option<String>,
}

/// Facts learned about servers. Entries stay for the lifetime of the
/// engine context and are keyed by host, port and protocol.
#[derive(Debug, Default)]
pub struct CapabilityCache {
    entries: RwLock<HashMap<(ServerKey, Capability), Entry>>,
}

impl CapabilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, server: &ServerKey, capability: Capability) -> CapabilityState {
        self.get_with_value(server, capability).0
    }

    pub fn get_with_value(
        &self,
        server: &ServerKey,
        capability: Capability,
    ) -> (CapabilityState, Option<String>) {
        #[allow(clippy::unwrap_used, reason = "panic on poison")]
        let entries = self.entries.read().unwrap();
        entries
            .get(&(server.clone(), capability))
            .map(|e| (e.state, e.value.clone()))
            .unwrap_or_default()
    }

    pub fn set(&self, server: &ServerKey, capability: Capability, state: CapabilityState) {
        self.set_with_value(server, capability, state, None)
    }

    pub fn set_with_value(
        &self,
        server: &ServerKey,
        capability: Capability,
        state: CapabilityState,
        value: Option<String>,
    ) {
        #[allow(clippy::unwrap_used, reason = "panic on poison")]
        let mut entries = self.entries.write().unwrap();
        entries.insert((server.clone(), capability), Entry { state, value });
    }
}
