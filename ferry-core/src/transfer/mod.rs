//! Data connections of FTP and friends: one socket per transfer attempt,
//! streaming between the network and a [Reader](crate::aio::Reader) or
//! [Writer](crate::aio::Writer).

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use bytes::Bytes;
use ferry_common::TransferStatusManager;
use ferry_tls::TlsClient;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::aio::{Reader, Writer};
use crate::capabilities::CapabilityState;
use crate::connection::StreamLayers;
use crate::control_socket::ControlEvent;
use crate::proxy::ProxySettings;

mod task;

/// Iterations of the copy loop before the task yields to the scheduler.
pub const MAX_ITERATIONS_PER_YIELD: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    List,
    Download,
    Upload,
    /// Download of the last byte(s) of a file to detect broken `REST`
    ResumeTest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEndReason {
    Successful,
    Timeout,
    /// Data connection or network error
    TransferFailure,
    /// Local read or write error, retrying will not help
    TransferFailureCritical,
    PreTransferCommandFailure,
    TransferCommandFailure,
    TransferCommandFailureImmediate,
    FailedResumeTest,
    FailedTlsResumption,
    Canceled,
}

#[derive(Debug)]
pub enum TransferEvent {
    /// The data connection is up and the copy loop is running.
    Started { tls_resumed: Option<bool> },
    /// TLS session was not resumed and nothing is known about the server.
    /// The task waits for [TransferSocket::confirm_insecure].
    ResumptionUnknown,
    /// The data connection resumed the control connection's session for
    /// the first time.
    ResumptionSeen,
    Ended {
        reason: TransferEndReason,
        transferred: u64,
        /// Received data of [TransferKind::List] and [TransferKind::ResumeTest]
        data: Option<Bytes>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumptionVerdict {
    Proceed,
    ProceedAndRemember,
    Fail,
    AskUser,
}

/// Decides whether a data connection's TLS session is acceptable.
///
/// A server announcing the resumption ALPN must resume. Otherwise a
/// server that resumed before must keep doing so, and one about which
/// nothing is known needs the user's consent to go on without.
pub fn resumption_verdict(
    alpn_required: bool,
    known: CapabilityState,
    resumed: bool,
) -> ResumptionVerdict {
    if resumed {
        return match known {
            CapabilityState::Yes => ResumptionVerdict::Proceed,
            _ => ResumptionVerdict::ProceedAndRemember,
        };
    }
    if alpn_required {
        return ResumptionVerdict::Fail;
    }
    match known {
        CapabilityState::Yes => ResumptionVerdict::Fail,
        CapabilityState::No => ResumptionVerdict::Proceed,
        CapabilityState::Unknown => ResumptionVerdict::AskUser,
    }
}

pub enum DataEndpoint {
    /// Connect to the server
    Passive { host: String, port: u16 },
    /// Wait for the server to connect
    Active(std::net::TcpListener),
}

pub struct DataTls {
    pub client: TlsClient,
    pub host: String,
    pub alpn_required: bool,
    pub known: CapabilityState,
}

pub struct TransferParams {
    pub kind: TransferKind,
    pub endpoint: DataEndpoint,
    pub source_address: Option<IpAddr>,
    pub proxy: Option<ProxySettings>,
    pub tls: Option<DataTls>,
    pub ascii: bool,
    pub reader: Option<Box<dyn Reader>>,
    pub writer: Option<Box<dyn Writer>>,
    pub layers: StreamLayers,
    pub status: Option<TransferStatusManager>,
    pub timeout: Option<Duration>,
    pub keepalive: Option<Duration>,
}

/// Listens for an active-mode data connection, inside `range` when given.
pub fn bind_active(
    address: IpAddr,
    range: Option<(u16, u16)>,
) -> std::io::Result<std::net::TcpListener> {
    let Some((low, high)) = range.filter(|(low, high)| low <= high && *low > 0) else {
        return std::net::TcpListener::bind(SocketAddr::new(address, 0));
    };
    let count = u32::from(high - low) + 1;
    let start = rand::thread_rng().gen_range(0..count);
    let mut last_error = None;
    for i in 0..count {
        let port = low + ((start + i) % count) as u16;
        match std::net::TcpListener::bind(SocketAddr::new(address, port)) {
            Ok(listener) => return Ok(listener),
            Err(error) => last_error = Some(error),
        }
    }
    Err(last_error.unwrap_or_else(|| std::io::ErrorKind::AddrInUse.into()))
}

/// Handle to a running data connection. Dropping it tears the connection
/// down; the owner still receives exactly one
/// [TransferEvent::Ended] for it unless the event loop is gone.
pub struct TransferSocket {
    id: u64,
    task: JoinHandle<()>,
    confirm: Option<oneshot::Sender<bool>>,
}

impl TransferSocket {
    pub fn spawn(params: TransferParams, events: mpsc::UnboundedSender<ControlEvent>) -> Self {
        let id = crate::connection::next_connection_id();
        let (confirm, confirm_rx) = oneshot::channel();
        debug!(transfer = id, kind = ?params.kind, "Starting data connection");
        let guard = task::EndGuard::new(id, events);
        let task = tokio::spawn(task::run(guard, params, confirm_rx));
        Self {
            id,
            task,
            confirm: Some(confirm),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Answer to [TransferEvent::ResumptionUnknown].
    pub fn confirm_insecure(&mut self, allow: bool) {
        if let Some(confirm) = self.confirm.take() {
            let _ = confirm.send(allow);
        }
    }
}

impl Drop for TransferSocket {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn resumption_policy() {
        use CapabilityState::*;
        use ResumptionVerdict::*;
        assert_eq!(resumption_verdict(true, Unknown, true), ProceedAndRemember);
        assert_eq!(resumption_verdict(false, Yes, true), Proceed);
        assert_eq!(resumption_verdict(true, No, false), Fail);
        assert_eq!(resumption_verdict(false, Yes, false), Fail);
        assert_eq!(resumption_verdict(false, No, false), Proceed);
        assert_eq!(resumption_verdict(false, Unknown, false), AskUser);
    }

    #[test]
    fn active_port_stays_in_range() {
        let listener = bind_active(Ipv4Addr::LOCALHOST.into(), Some((40000, 40100))).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!((40000..=40100).contains(&port));
    }
}
