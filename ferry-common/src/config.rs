use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{FerryError, OptionId, Options, Secret};

const fn _default_true() -> bool {
    true
}

const fn _default_false() -> bool {
    false
}

#[inline]
fn _default_timeout() -> Duration {
    Duration::from_secs(20)
}

#[inline]
fn _default_tcp_keepalive() -> Duration {
    Duration::from_secs(15 * 60)
}

const fn _default_inbound_kib() -> u32 {
    1000
}

const fn _default_outbound_kib() -> u32 {
    100
}

const fn _default_buffer_count() -> u32 {
    4
}

const fn _default_buffer_size() -> u32 {
    128 * 1024
}

const fn _default_max_redirects() -> u32 {
    6
}

#[inline]
fn _default_sftp_helper() -> String {
    "ferry-sftp".to_owned()
}

#[inline]
fn _default_storj_helper() -> String {
    "ferry-storj".to_owned()
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ConnectionConfig {
    /// Zero disables the idle timeout
    #[serde(default = "_default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    #[serde(default = "_default_true")]
    pub passive: bool,

    #[serde(default = "_default_true")]
    pub pasv_reply_fallback: bool,

    #[serde(default = "_default_tcp_keepalive", with = "humantime_serde")]
    pub tcp_keepalive: Duration,

    #[serde(default = "_default_false")]
    pub ftp_keepalive: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            timeout: _default_timeout(),
            passive: true,
            pasv_reply_fallback: true,
            tcp_keepalive: _default_tcp_keepalive(),
            ftp_keepalive: false,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ActiveModeConfig {
    #[serde(default)]
    pub port_range: Option<(u16, u16)>,

    #[serde(default)]
    pub external_ip: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BurstTolerance {
    #[default]
    Normal,
    High,
    VeryHigh,
}

impl BurstTolerance {
    pub fn from_option(v: i64) -> Self {
        match v {
            1 => BurstTolerance::High,
            2 => BurstTolerance::VeryHigh,
            _ => BurstTolerance::Normal,
        }
    }

    pub fn multiplier(&self) -> u32 {
        match self {
            BurstTolerance::Normal => 1,
            BurstTolerance::High => 2,
            BurstTolerance::VeryHigh => 5,
        }
    }

    fn as_option(&self) -> i64 {
        match self {
            BurstTolerance::Normal => 0,
            BurstTolerance::High => 1,
            BurstTolerance::VeryHigh => 2,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SpeedLimitConfig {
    #[serde(default = "_default_false")]
    pub enable: bool,

    #[serde(default = "_default_inbound_kib")]
    pub inbound_kib: u32,

    #[serde(default = "_default_outbound_kib")]
    pub outbound_kib: u32,

    #[serde(default)]
    pub burst_tolerance: BurstTolerance,
}

impl Default for SpeedLimitConfig {
    fn default() -> Self {
        Self {
            enable: false,
            inbound_kib: _default_inbound_kib(),
            outbound_kib: _default_outbound_kib(),
            burst_tolerance: BurstTolerance::Normal,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BufferConfig {
    #[serde(default = "_default_buffer_count")]
    pub count: u32,

    #[serde(default = "_default_buffer_size")]
    pub size: u32,

    #[serde(default = "_default_false")]
    pub preallocate: bool,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            count: _default_buffer_count(),
            size: _default_buffer_size(),
            preallocate: false,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProxyKind {
    Http,
    Socks5,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ProxyConfig {
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: Secret<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub debug_level: u8,

    #[serde(default = "_default_false")]
    pub raw_listing: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HelperConfig {
    #[serde(default = "_default_sftp_helper")]
    pub sftp: String,

    #[serde(default = "_default_storj_helper")]
    pub storj: String,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            sftp: _default_sftp_helper(),
            storj: _default_storj_helper(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HttpConfig {
    #[serde(default = "_default_max_redirects")]
    pub max_redirects: u32,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            max_redirects: _default_max_redirects(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct TransferConfig {
    #[serde(default = "_default_false")]
    pub preserve_timestamps: bool,
}

/// On-disk configuration, applied to an [Options] store on startup.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct FerryConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub active_mode: ActiveModeConfig,

    #[serde(default)]
    pub speed_limits: SpeedLimitConfig,

    #[serde(default)]
    pub buffers: BufferConfig,

    #[serde(default)]
    pub proxy: Option<ProxyConfig>,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub helpers: HelperConfig,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub transfers: TransferConfig,
}

impl FerryConfig {
    pub fn validate(&self) -> Result<(), String> {
        if let Some((low, high)) = self.active_mode.port_range {
            if low == 0 || low > high {
                return Err(format!("invalid active mode port range {low}-{high}"));
            }
        }
        if self.buffers.count == 0 {
            return Err("buffer count must be at least 1".into());
        }
        if self.speed_limits.enable
            && (self.speed_limits.inbound_kib == 0 || self.speed_limits.outbound_kib == 0)
        {
            return Err("speed limits must be greater than zero when enabled".into());
        }
        if let Some(proxy) = &self.proxy {
            if proxy.host.is_empty() || proxy.port == 0 {
                return Err("proxy host and port are required".into());
            }
        }
        Ok(())
    }

    pub fn apply(&self, options: &Options) -> Result<(), FerryError> {
        let b = |v: bool| v as i64;
        options.set_int(OptionId::Timeout, self.connection.timeout.as_secs() as i64)?;
        options.set_int(OptionId::UsePassive, b(self.connection.passive))?;
        options.set_int(
            OptionId::PasvReplyFallback,
            b(self.connection.pasv_reply_fallback),
        )?;
        options.set_int(
            OptionId::TcpKeepaliveInterval,
            (self.connection.tcp_keepalive.as_secs() / 60) as i64,
        )?;
        options.set_int(OptionId::FtpSendKeepalive, b(self.connection.ftp_keepalive))?;

        match self.active_mode.port_range {
            Some((low, high)) => {
                options.set_int(OptionId::LimitPorts, 1)?;
                options.set_int(OptionId::LimitPortsLow, low as i64)?;
                options.set_int(OptionId::LimitPortsHigh, high as i64)?;
            }
            None => options.set_int(OptionId::LimitPorts, 0)?,
        }
        options.set_string(
            OptionId::ExternalIp,
            self.active_mode.external_ip.clone().unwrap_or_default(),
        )?;

        options.set_int(OptionId::SpeedLimitEnable, b(self.speed_limits.enable))?;
        options.set_int(
            OptionId::SpeedLimitInbound,
            self.speed_limits.inbound_kib as i64,
        )?;
        options.set_int(
            OptionId::SpeedLimitOutbound,
            self.speed_limits.outbound_kib as i64,
        )?;
        options.set_int(
            OptionId::SpeedLimitBurstTolerance,
            self.speed_limits.burst_tolerance.as_option(),
        )?;

        options.set_int(OptionId::BufferCount, self.buffers.count as i64)?;
        options.set_int(OptionId::BufferSize, self.buffers.size as i64)?;
        options.set_int(OptionId::Preallocate, b(self.buffers.preallocate))?;

        match &self.proxy {
            Some(proxy) => {
                let kind = match proxy.kind {
                    ProxyKind::Http => 1,
                    ProxyKind::Socks5 => 2,
                };
                options.set_int(OptionId::ProxyType, kind)?;
                options.set_string(OptionId::ProxyHost, proxy.host.clone())?;
                options.set_int(OptionId::ProxyPort, proxy.port as i64)?;
                options.set_string(OptionId::ProxyUser, proxy.user.clone())?;
                options.set_string(
                    OptionId::ProxyPass,
                    proxy.password.expose_secret().clone(),
                )?;
            }
            None => options.set_int(OptionId::ProxyType, 0)?,
        }

        options.set_int(
            OptionId::LoggingDebugLevel,
            self.logging.debug_level as i64,
        )?;
        options.set_int(OptionId::LoggingRawListing, b(self.logging.raw_listing))?;
        options.set_string(OptionId::SftpHelper, self.helpers.sftp.clone())?;
        options.set_string(OptionId::StorjHelper, self.helpers.storj.clone())?;
        options.set_int(OptionId::HttpMaxRedirects, self.http.max_redirects as i64)?;
        options.set_int(
            OptionId::PreserveTimestamps,
            b(self.transfers.preserve_timestamps),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config: FerryConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.connection.timeout, Duration::from_secs(20));
        assert_eq!(config.http.max_redirects, 6);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn apply_sets_options() {
        let config: FerryConfig = serde_json::from_str(
            r#"{
                "connection": {"timeout": "45s", "passive": false},
                "active_mode": {"port_range": [50000, 50100]},
                "speed_limits": {"enable": true, "inbound_kib": 64, "burst_tolerance": "very_high"},
                "proxy": {"kind": "socks5", "host": "proxy.local", "port": 1080}
            }"#,
        )
        .unwrap();
        let options = Options::new();
        config.apply(&options).unwrap();
        assert_eq!(options.get_int(OptionId::Timeout), 45);
        assert!(!options.get_bool(OptionId::UsePassive));
        assert_eq!(options.get_int(OptionId::LimitPortsLow), 50000);
        assert_eq!(options.get_int(OptionId::SpeedLimitInbound), 64);
        assert_eq!(options.get_int(OptionId::SpeedLimitBurstTolerance), 2);
        assert_eq!(options.get_int(OptionId::ProxyType), 2);
        assert_eq!(options.get_string(OptionId::ProxyHost), "proxy.local");
    }

    #[test]
    fn invalid_port_range() {
        let mut config = FerryConfig::default();
        config.active_mode.port_range = Some((7000, 6000));
        assert!(config.validate().is_err());
    }

    #[test]
    fn burst_tiers() {
        assert_eq!(BurstTolerance::from_option(0).multiplier(), 1);
        assert_eq!(BurstTolerance::from_option(1).multiplier(), 2);
        assert_eq!(BurstTolerance::from_option(2).multiplier(), 5);
    }
}
