use std::fmt;
use std::path::PathBuf;

use bitflags::bitflags;

use crate::{FileExistsAction, MemoryFile, ServerPath, Site};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandId {
    None,
    Connect,
    Disconnect,
    List,
    FileTransfer,
    Mkdir,
    RemoveDir,
    Delete,
    Rename,
    Chmod,
    RawCommand,
    /// Internal sub-operations that never reach the caller
    Private1,
    Private2,
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandId::None => "none",
            CommandId::Connect => "connect",
            CommandId::Disconnect => "disconnect",
            CommandId::List => "list",
            CommandId::FileTransfer => "transfer",
            CommandId::Mkdir => "mkdir",
            CommandId::RemoveDir => "rmdir",
            CommandId::Delete => "delete",
            CommandId::Rename => "rename",
            CommandId::Chmod => "chmod",
            CommandId::RawCommand => "raw",
            CommandId::Private1 => "private1",
            CommandId::Private2 => "private2",
        };
        f.write_str(name)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ListFlags: u32 {
        /// Always fetch from the server
        const REFRESH = 1 << 0;
        /// Only fetch if the cache has nothing usable
        const AVOID = 1 << 1;
        /// List the current directory if the requested one fails
        const FALLBACK_CURRENT = 1 << 2;
        /// The path might be a link to a file
        const LINK = 1 << 3;
        const CLEAR_CACHE = 1 << 4;
    }
}

#[derive(Debug, Clone)]
pub struct ListCommand {
    pub path: ServerPath,
    pub subdir: String,
    pub flags: ListFlags,
}

impl ListCommand {
    pub fn new(path: ServerPath) -> Self {
        Self {
            path,
            subdir: String::new(),
            flags: ListFlags::empty(),
        }
    }

    pub fn current() -> Self {
        Self::new(ServerPath::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Download,
    Upload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferMode {
    #[default]
    Binary,
    Ascii,
}

#[derive(Debug, Clone, Default)]
pub struct TransferSettings {
    pub mode: TransferMode,
    /// Answer to a file-exists conflict decided up front; `None` asks the
    /// caller through an async request.
    pub on_exists: Option<FileExistsAction>,
    pub preserve_timestamp: bool,
}

#[derive(Debug, Clone)]
pub enum LocalEndpoint {
    File(PathBuf),
    Memory(MemoryFile),
}

impl fmt::Display for LocalEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalEndpoint::File(path) => write!(f, "{}", path.display()),
            LocalEndpoint::Memory(_) => f.write_str("<memory>"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileTransferCommand {
    pub local: LocalEndpoint,
    pub remote_path: ServerPath,
    pub remote_file: String,
    pub direction: TransferDirection,
    pub settings: TransferSettings,
}

impl FileTransferCommand {
    pub fn download(
        remote_path: ServerPath,
        remote_file: impl Into<String>,
        local: LocalEndpoint,
    ) -> Self {
        Self {
            local,
            remote_path,
            remote_file: remote_file.into(),
            direction: TransferDirection::Download,
            settings: TransferSettings::default(),
        }
    }

    pub fn upload(
        local: LocalEndpoint,
        remote_path: ServerPath,
        remote_file: impl Into<String>,
    ) -> Self {
        Self {
            local,
            remote_path,
            remote_file: remote_file.into(),
            direction: TransferDirection::Upload,
            settings: TransferSettings::default(),
        }
    }

    pub fn is_download(&self) -> bool {
        self.direction == TransferDirection::Download
    }
}

#[derive(Debug, Clone)]
pub enum Command {
    Connect {
        site: Site,
        retry_connecting: bool,
    },
    Disconnect,
    List(ListCommand),
    FileTransfer(FileTransferCommand),
    Mkdir {
        path: ServerPath,
    },
    RemoveDir {
        path: ServerPath,
        subdir: String,
    },
    Delete {
        path: ServerPath,
        files: Vec<String>,
    },
    Rename {
        from_path: ServerPath,
        from_file: String,
        to_path: ServerPath,
        to_file: String,
    },
    Chmod {
        path: ServerPath,
        file: String,
        permission: String,
    },
    RawCommand(String),
}

impl Command {
    pub fn id(&self) -> CommandId {
        match self {
            Command::Connect { .. } => CommandId::Connect,
            Command::Disconnect => CommandId::Disconnect,
            Command::List(_) => CommandId::List,
            Command::FileTransfer(_) => CommandId::FileTransfer,
            Command::Mkdir { .. } => CommandId::Mkdir,
            Command::RemoveDir { .. } => CommandId::RemoveDir,
            Command::Delete { .. } => CommandId::Delete,
            Command::Rename { .. } => CommandId::Rename,
            Command::Chmod { .. } => CommandId::Chmod,
            Command::RawCommand(_) => CommandId::RawCommand,
        }
    }

    /// Rejects commands that could never succeed, before they reach a
    /// protocol.
    pub fn is_valid(&self) -> bool {
        match self {
            Command::Connect { site, .. } => !site.server.host.is_empty(),
            Command::Disconnect => true,
            Command::List(cmd) => cmd.subdir.is_empty() || !cmd.path.is_empty(),
            Command::FileTransfer(cmd) => {
                !cmd.remote_path.is_empty() && !cmd.remote_file.is_empty()
            }
            Command::Mkdir { path } => !path.is_empty() && path.has_parent(),
            Command::RemoveDir { path, subdir } => !path.is_empty() && !subdir.is_empty(),
            Command::Delete { path, files } => !path.is_empty() && !files.is_empty(),
            Command::Rename {
                from_path,
                from_file,
                to_path,
                to_file,
            } => {
                !from_path.is_empty()
                    && !to_path.is_empty()
                    && !from_file.is_empty()
                    && !to_file.is_empty()
            }
            Command::Chmod {
                path,
                file,
                permission,
            } => !path.is_empty() && !file.is_empty() && !permission.is_empty(),
            Command::RawCommand(cmd) => !cmd.trim().is_empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validity() {
        assert!(!Command::RawCommand("  ".into()).is_valid());
        assert!(Command::RawCommand("SITE HELP".into()).is_valid());
        assert!(!Command::Mkdir {
            path: ServerPath::root()
        }
        .is_valid());
        assert!(Command::Mkdir {
            path: ServerPath::parse("/a/b").unwrap()
        }
        .is_valid());
        assert!(!Command::Delete {
            path: ServerPath::root(),
            files: vec![]
        }
        .is_valid());
    }

    #[test]
    fn ids() {
        let cmd = Command::FileTransfer(FileTransferCommand::download(
            ServerPath::root(),
            "a",
            LocalEndpoint::Memory(MemoryFile::new()),
        ));
        assert_eq!(cmd.id(), CommandId::FileTransfer);
        assert_eq!(cmd.id().to_string(), "transfer");
    }
}
