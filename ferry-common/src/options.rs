use std::collections::HashMap;
use std::sync::RwLock;

use tokio::sync::watch;

use crate::FerryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionId {
    /// Idle timeout in seconds, 0 disables it
    Timeout,
    UsePassive,
    LimitPorts,
    LimitPortsLow,
    LimitPortsHigh,
    /// Address announced in `PORT`/`EPRT`, empty for the local address
    ExternalIp,
    /// Connect to the control host instead of an unroutable `PASV` address
    PasvReplyFallback,
    SpeedLimitEnable,
    /// KiB/s
    SpeedLimitInbound,
    /// KiB/s
    SpeedLimitOutbound,
    /// 0 normal, 1 high, 2 very high
    SpeedLimitBurstTolerance,
    BufferCount,
    BufferSize,
    Preallocate,
    /// Minutes, 0 disables TCP keepalive
    TcpKeepaliveInterval,
    FtpSendKeepalive,
    /// 0 none, 1 HTTP CONNECT, 2 SOCKS5
    ProxyType,
    ProxyHost,
    ProxyPort,
    ProxyUser,
    ProxyPass,
    /// 0 to 4
    LoggingDebugLevel,
    LoggingRawListing,
    SftpHelper,
    StorjHelper,
    HttpMaxRedirects,
    PreserveTimestamps,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    Int(i64),
    String(String),
}

impl OptionId {
    pub const ALL: [OptionId; 27] = [
        OptionId::Timeout,
        OptionId::UsePassive,
        OptionId::LimitPorts,
        OptionId::LimitPortsLow,
        OptionId::LimitPortsHigh,
        OptionId::ExternalIp,
        OptionId::PasvReplyFallback,
        OptionId::SpeedLimitEnable,
        OptionId::SpeedLimitInbound,
        OptionId::SpeedLimitOutbound,
        OptionId::SpeedLimitBurstTolerance,
        OptionId::BufferCount,
        OptionId::BufferSize,
        OptionId::Preallocate,
        OptionId::TcpKeepaliveInterval,
        OptionId::FtpSendKeepalive,
        OptionId::ProxyType,
        OptionId::ProxyHost,
        OptionId::ProxyPort,
        OptionId::ProxyUser,
        OptionId::ProxyPass,
        OptionId::LoggingDebugLevel,
        OptionId::LoggingRawListing,
        OptionId::SftpHelper,
        OptionId::StorjHelper,
        OptionId::HttpMaxRedirects,
        OptionId::PreserveTimestamps,
    ];

    pub fn default_value(&self) -> OptionValue {
        use OptionValue::{Int, String as Str};
        match self {
            OptionId::Timeout => Int(20),
            OptionId::UsePassive => Int(1),
            OptionId::LimitPorts => Int(0),
            OptionId::LimitPortsLow => Int(6000),
            OptionId::LimitPortsHigh => Int(7000),
            OptionId::ExternalIp => Str(String::new()),
            OptionId::PasvReplyFallback => Int(1),
            OptionId::SpeedLimitEnable => Int(0),
            OptionId::SpeedLimitInbound => Int(1000),
            OptionId::SpeedLimitOutbound => Int(100),
            OptionId::SpeedLimitBurstTolerance => Int(0),
            OptionId::BufferCount => Int(4),
            OptionId::BufferSize => Int(128 * 1024),
            OptionId::Preallocate => Int(0),
            OptionId::TcpKeepaliveInterval => Int(15),
            OptionId::FtpSendKeepalive => Int(0),
            OptionId::ProxyType => Int(0),
            OptionId::ProxyHost => Str(String::new()),
            OptionId::ProxyPort => Int(0),
            OptionId::ProxyUser => Str(String::new()),
            OptionId::ProxyPass => Str(String::new()),
            OptionId::LoggingDebugLevel => Int(0),
            OptionId::LoggingRawListing => Int(0),
            OptionId::SftpHelper => Str("ferry-sftp".into()),
            OptionId::StorjHelper => Str("ferry-storj".into()),
            OptionId::HttpMaxRedirects => Int(6),
            OptionId::PreserveTimestamps => Int(0),
        }
    }

    fn clamp(&self, v: i64) -> i64 {
        match self {
            OptionId::Timeout => v.clamp(0, 9999),
            OptionId::LimitPortsLow | OptionId::LimitPortsHigh | OptionId::ProxyPort => {
                v.clamp(0, 65535)
            }
            OptionId::SpeedLimitBurstTolerance => v.clamp(0, 2),
            OptionId::BufferCount => v.clamp(1, 20),
            OptionId::BufferSize => v.clamp(4096, 4 * 1024 * 1024),
            OptionId::LoggingDebugLevel => v.clamp(0, 4),
            OptionId::HttpMaxRedirects => v.clamp(0, 100),
            _ => v.max(0),
        }
    }
}

/// Changes on every successful [Options::set].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OptionsGeneration(pub u64);

/// Process-wide typed option store with change notification.
pub struct Options {
    values: RwLock<HashMap<OptionId, OptionValue>>,
    generation: watch::Sender<OptionsGeneration>,
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}

impl Options {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(OptionsGeneration::default());
        Self {
            values: RwLock::new(
                OptionId::ALL
                    .iter()
                    .map(|id| (*id, id.default_value()))
                    .collect(),
            ),
            generation,
        }
    }

    fn get(&self, id: OptionId) -> OptionValue {
        #[allow(clippy::unwrap_used, reason = "panic on poison")]
        let values = self.values.read().unwrap();
        values.get(&id).cloned().unwrap_or_else(|| id.default_value())
    }

    pub fn get_int(&self, id: OptionId) -> i64 {
        match self.get(id) {
            OptionValue::Int(v) => v,
            OptionValue::String(s) => s.trim().parse().unwrap_or(0),
        }
    }

    pub fn get_bool(&self, id: OptionId) -> bool {
        self.get_int(id) != 0
    }

    pub fn get_string(&self, id: OptionId) -> String {
        match self.get(id) {
            OptionValue::Int(v) => v.to_string(),
            OptionValue::String(s) => s,
        }
    }

    /// Stores a value. Integers are clamped to the option's range; a value
    /// of the other type is rejected.
    pub fn set(&self, id: OptionId, value: OptionValue) -> Result<(), FerryError> {
        let value = match (id.default_value(), value) {
            (OptionValue::Int(_), OptionValue::Int(v)) => OptionValue::Int(id.clamp(v)),
            (OptionValue::String(_), OptionValue::String(s)) => OptionValue::String(s),
            _ => return Err(FerryError::OptionType(id)),
        };
        {
            #[allow(clippy::unwrap_used, reason = "panic on poison")]
            let mut values = self.values.write().unwrap();
            if values.get(&id) == Some(&value) {
                return Ok(());
            }
            values.insert(id, value);
        }
        self.generation.send_modify(|g| g.0 += 1);
        Ok(())
    }

    pub fn set_int(&self, id: OptionId, value: i64) -> Result<(), FerryError> {
        self.set(id, OptionValue::Int(value))
    }

    pub fn set_string(&self, id: OptionId, value: impl Into<String>) -> Result<(), FerryError> {
        self.set(id, OptionValue::String(value.into()))
    }

    pub fn subscribe(&self) -> watch::Receiver<OptionsGeneration> {
        self.generation.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_types() {
        let options = Options::new();
        assert_eq!(options.get_int(OptionId::HttpMaxRedirects), 6);
        assert!(options.get_bool(OptionId::UsePassive));
        assert_eq!(options.get_string(OptionId::SftpHelper), "ferry-sftp");
        assert!(matches!(
            options.set_string(OptionId::Timeout, "x"),
            Err(FerryError::OptionType(OptionId::Timeout))
        ));
    }

    #[test]
    fn values_are_clamped() {
        let options = Options::new();
        options.set_int(OptionId::SpeedLimitBurstTolerance, 9).unwrap();
        assert_eq!(options.get_int(OptionId::SpeedLimitBurstTolerance), 2);
        options.set_int(OptionId::BufferCount, 0).unwrap();
        assert_eq!(options.get_int(OptionId::BufferCount), 1);
    }

    #[test]
    fn subscribers_see_changes() {
        let options = Options::new();
        let mut rx = options.subscribe();
        assert!(!rx.has_changed().unwrap());
        options.set_int(OptionId::Timeout, 30).unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().0, 1);
        // Same value again is not a change
        options.set_int(OptionId::Timeout, 30).unwrap();
        assert!(!rx.has_changed().unwrap());
    }
}
