use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::{
    CommandId, LogMessage, Reply, Secret, Server, ServerPath, TransferDirection, TransferStatus,
};

#[derive(Debug, Clone)]
pub enum Notification {
    LogMessage(LogMessage),
    OperationFinished {
        command: CommandId,
        reply: Reply,
    },
    /// `None` once the transfer is over
    TransferStatus(Option<TransferStatus>),
    DirectoryListing {
        path: ServerPath,
        primary: bool,
        failed: bool,
    },
    AsyncRequest(AsyncRequest),
    Encryption(EncryptionDetails),
    LocalDirCreated(PathBuf),
    /// The effective server identity differs from what was asked for,
    /// e.g. after falling back from TLS to plain FTP
    ServerChanged(Server),
}

/// Receiver of everything the engine reports to its caller.
pub trait NotificationSink: Send + Sync {
    fn post(&self, notification: Notification);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileExistsAction {
    Overwrite,
    OverwriteNewer,
    OverwriteSizeDiffers,
    Resume,
    Rename,
    Skip,
}

#[derive(Debug, Clone)]
pub struct FileExistsRequest {
    pub direction: TransferDirection,
    pub local: String,
    pub local_size: Option<u64>,
    pub local_time: Option<DateTime<Utc>>,
    pub remote_path: ServerPath,
    pub remote_file: String,
    pub remote_size: Option<u64>,
    pub remote_time: Option<DateTime<Utc>>,
    pub can_resume: bool,
}

#[derive(Debug, Clone)]
pub struct HostKeyRequest {
    pub host: String,
    pub port: u16,
    pub fingerprint: String,
    /// A different key was trusted before
    pub changed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub subject: String,
    pub issuer: String,
    pub serial: String,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
    pub alt_names: Vec<String>,
    /// Lowercase hex SHA-256 of the DER encoding, colon separated
    pub fingerprint_sha256: String,
    pub self_signed: bool,
}

#[derive(Debug, Clone)]
pub struct CertificateRequest {
    pub host: String,
    pub port: u16,
    pub chain: Vec<CertificateInfo>,
    /// Why the system trust store rejected the chain
    pub verification_error: Option<String>,
    pub protocol_version: String,
    pub cipher: String,
}

#[derive(Debug, Clone)]
pub struct InteractiveLoginRequest {
    pub challenge: String,
    pub is_password_prompt: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsecureReason {
    /// The server offers no TLS at all
    PlainFtp,
    /// TLS is used but data connections cannot be tied to the control
    /// connection by session resumption
    NoDataChannelResumption,
}

#[derive(Debug, Clone)]
pub struct InsecureConnectionRequest {
    pub server: Server,
    pub reason: InsecureReason,
}

#[derive(Debug, Clone)]
pub enum AsyncRequestKind {
    FileExists(FileExistsRequest),
    HostKey(HostKeyRequest),
    Certificate(CertificateRequest),
    InteractiveLogin(InteractiveLoginRequest),
    InsecureConnection(InsecureConnectionRequest),
}

#[derive(Debug, Clone)]
pub enum AsyncReply {
    FileExists {
        action: FileExistsAction,
        /// New remote or local name for `FileExistsAction::Rename`
        new_name: Option<String>,
    },
    HostKey {
        trust: bool,
        always: bool,
    },
    Certificate {
        trust: bool,
        always: bool,
    },
    InteractiveLogin(Option<Secret<String>>),
    InsecureConnection {
        allow: bool,
    },
}

/// A question to the caller that blocks the current operation until the
/// request is handed back with `reply` filled in.
#[derive(Debug, Clone)]
pub struct AsyncRequest {
    pub id: u64,
    pub kind: AsyncRequestKind,
    pub reply: Option<AsyncReply>,
}

impl AsyncRequest {
    pub fn answer(mut self, reply: AsyncReply) -> Self {
        self.reply = Some(reply);
        self
    }

    /// The reply is of the variant this request asks for.
    pub fn reply_matches(&self) -> bool {
        matches!(
            (&self.kind, &self.reply),
            (AsyncRequestKind::FileExists(_), Some(AsyncReply::FileExists { .. }))
                | (AsyncRequestKind::HostKey(_), Some(AsyncReply::HostKey { .. }))
                | (
                    AsyncRequestKind::Certificate(_),
                    Some(AsyncReply::Certificate { .. })
                )
                | (
                    AsyncRequestKind::InteractiveLogin(_),
                    Some(AsyncReply::InteractiveLogin(_))
                )
                | (
                    AsyncRequestKind::InsecureConnection(_),
                    Some(AsyncReply::InsecureConnection { .. })
                )
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncryptionDetails {
    pub protocol: String,
    pub key_exchange: String,
    pub cipher: String,
    pub mac: String,
    pub host_key: Option<String>,
    pub certificates: Vec<CertificateInfo>,
    pub session_resumed: bool,
}
