use std::net::IpAddr;

use data_encoding::BASE64;
use ferry_common::{OptionId, Options, ProxyKind, Secret};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("proxy sent an invalid reply")]
    InvalidReply,
    #[error("proxy requires authentication")]
    AuthenticationRequired,
    #[error("proxy authentication failed")]
    AuthenticationFailed,
    #[error("proxy refused the connection: {0}")]
    Refused(String),
    #[error("host name too long for the proxy")]
    HostTooLong,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySettings {
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Secret<String>,
}

impl ProxySettings {
    pub fn from_options(options: &Options) -> Option<Self> {
        let kind = match options.get_int(OptionId::ProxyType) {
            1 => ProxyKind::Http,
            2 => ProxyKind::Socks5,
            _ => return None,
        };
        let host = options.get_string(OptionId::ProxyHost);
        let port = u16::try_from(options.get_int(OptionId::ProxyPort)).ok()?;
        if host.is_empty() || port == 0 {
            return None;
        }
        Some(Self {
            kind,
            host,
            port,
            user: options.get_string(OptionId::ProxyUser),
            password: Secret::new(options.get_string(OptionId::ProxyPass)),
        })
    }

    /// Asks the proxy on `stream` to connect to `host:port`.
    pub async fn handshake<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        stream: &mut S,
        host: &str,
        port: u16,
    ) -> Result<(), ProxyError> {
        debug!(proxy = ?self.kind, %host, port, "Proxy handshake");
        match self.kind {
            ProxyKind::Http => self.http_connect(stream, host, port).await,
            ProxyKind::Socks5 => self.socks5_connect(stream, host, port).await,
        }
    }

    async fn http_connect<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        stream: &mut S,
        host: &str,
        port: u16,
    ) -> Result<(), ProxyError> {
        let authority = match host.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => format!("[{host}]:{port}"),
            _ => format!("{host}:{port}"),
        };
        let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
        if !self.user.is_empty() {
            let credentials = format!("{}:{}", self.user, self.password.expose_secret());
            request.push_str(&format!(
                "Proxy-Authorization: Basic {}\r\n",
                BASE64.encode(credentials.as_bytes())
            ));
        }
        request.push_str("\r\n");
        stream.write_all(request.as_bytes()).await?;

        // read byte-wise so nothing past the header is consumed
        let mut header = Vec::new();
        while !header.ends_with(b"\r\n\r\n") {
            if header.len() > 16 * 1024 {
                return Err(ProxyError::InvalidReply);
            }
            header.push(stream.read_u8().await?);
        }
        let header = String::from_utf8_lossy(&header);
        let status_line = header.lines().next().unwrap_or_default();
        let code = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|c| c.parse::<u16>().ok())
            .ok_or(ProxyError::InvalidReply)?;
        match code {
            200..=299 => Ok(()),
            407 => Err(ProxyError::AuthenticationRequired),
            _ => Err(ProxyError::Refused(status_line.to_owned())),
        }
    }

    async fn socks5_connect<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        stream: &mut S,
        host: &str,
        port: u16,
    ) -> Result<(), ProxyError> {
        let with_auth = !self.user.is_empty();
        if with_auth {
            stream.write_all(&[5, 2, 0, 2]).await?;
        } else {
            stream.write_all(&[5, 1, 0]).await?;
        }
        let mut choice = [0u8; 2];
        stream.read_exact(&mut choice).await?;
        match choice {
            [5, 0] => {}
            [5, 2] if with_auth => {
                let user = self.user.as_bytes();
                let pass = self.password.expose_secret().as_bytes();
                if user.len() > 255 || pass.len() > 255 {
                    return Err(ProxyError::AuthenticationFailed);
                }
                let mut auth = vec![1, user.len() as u8];
                auth.extend_from_slice(user);
                auth.push(pass.len() as u8);
                auth.extend_from_slice(pass);
                stream.write_all(&auth).await?;
                let mut status = [0u8; 2];
                stream.read_exact(&mut status).await?;
                if status[1] != 0 {
                    return Err(ProxyError::AuthenticationFailed);
                }
            }
            [5, 0xff] => return Err(ProxyError::AuthenticationRequired),
            _ => return Err(ProxyError::InvalidReply),
        }

        let mut request = vec![5, 1, 0];
        match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => {
                request.push(1);
                request.extend_from_slice(&ip.octets());
            }
            Ok(IpAddr::V6(ip)) => {
                request.push(4);
                request.extend_from_slice(&ip.octets());
            }
            Err(_) => {
                let name = host.as_bytes();
                if name.len() > 255 {
                    return Err(ProxyError::HostTooLong);
                }
                request.push(3);
                request.push(name.len() as u8);
                request.extend_from_slice(name);
            }
        }
        request.extend_from_slice(&port.to_be_bytes());
        stream.write_all(&request).await?;

        let mut reply = [0u8; 4];
        stream.read_exact(&mut reply).await?;
        if reply[0] != 5 {
            return Err(ProxyError::InvalidReply);
        }
        if reply[1] != 0 {
            return Err(ProxyError::Refused(socks5_error(reply[1]).to_owned()));
        }
        let skip = match reply[3] {
            1 => 4,
            4 => 16,
            3 => stream.read_u8().await? as usize,
            _ => return Err(ProxyError::InvalidReply),
        };
        let mut bound = vec![0u8; skip + 2];
        stream.read_exact(&mut bound).await?;
        Ok(())
    }
}

fn socks5_error(code: u8) -> &'static str {
    match code {
        1 => "general failure",
        2 => "connection not allowed by ruleset",
        3 => "network unreachable",
        4 => "host unreachable",
        5 => "connection refused",
        6 => "TTL expired",
        7 => "command not supported",
        8 => "address type not supported",
        _ => "unknown error",
    }
}
