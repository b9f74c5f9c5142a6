use chrono::{DateTime, NaiveDateTime, Utc};
use ferry_common::{
    AsyncReply, AsyncRequest, AsyncRequestKind, CommandId, DirEntry, FileExistsAction,
    FileExistsRequest, FileTransferCommand, ListCommand, ListFlags, LocalEndpoint, MessageType,
    Notification, OptionId, Reply, ReplyFlags, TransferMode,
};
use ferry_core::aio::{ReaderFactory, WriterFactory};
use ferry_core::capabilities::{Capability, CapabilityState};
use ferry_core::lock_manager::LockReason;
use ferry_core::operation::{OpMeta, Operation};
use ferry_core::transfer::{TransferEndReason, TransferKind};

use super::{log_unexpected, op_meta, send_command, ChangeDirOp, ListOp, MkdirOp};
use super::{RawTransferOp, RawTransferRequest};
use crate::session::{FtpContext, FtpSession};

const TWO_GB: u64 = 1 << 31;
const FOUR_GB: u64 = 1 << 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    WaitCwd,
    WaitMkdir,
    Lookup,
    WaitList,
    Size,
    WaitSize,
    Mdtm,
    WaitMdtm,
    FileExists,
    WaitFileExists,
    Transfer,
    WaitResumeTest,
    WaitTransfer,
    WaitMfmt,
}

enum Local {
    Source(ReaderFactory),
    Target(WriterFactory),
}

/// Downloads or uploads one file, deciding on resume, overwrite or skip
/// first.
pub struct FileTransferOp {
    meta: OpMeta,
    state: State,
    command: FileTransferCommand,
    local: Local,
    remote_size: Option<u64>,
    remote_time: Option<DateTime<Utc>>,
    /// The file is known not to exist on the server
    remote_missing: bool,
    list_tried: bool,
    mkdir_tried: bool,
    resume: bool,
    resume_tested: bool,
    offset: u64,
}

impl FileTransferOp {
    pub fn new(command: FileTransferCommand) -> Self {
        let local = if command.is_download() {
            Local::Target(WriterFactory::new(command.local.clone()))
        } else {
            Local::Source(ReaderFactory::new(command.local.clone()))
        };
        Self {
            meta: OpMeta::new("transfer", CommandId::FileTransfer),
            state: State::Init,
            command,
            local,
            remote_size: None,
            remote_time: None,
            remote_missing: false,
            list_tried: false,
            mkdir_tried: false,
            resume: false,
            resume_tested: false,
            offset: 0,
        }
    }

    fn name(&self) -> &str {
        &self.command.remote_file
    }

    fn local_size(&self) -> Option<u64> {
        match &self.local {
            Local::Source(reader) => reader.size(),
            Local::Target(writer) => writer.size(),
        }
    }

    fn local_time(&self) -> Option<DateTime<Utc>> {
        match &self.local {
            Local::Source(reader) => reader.mtime(),
            Local::Target(writer) => writer.mtime(),
        }
    }

    fn local_target(&self) -> Option<WriterFactory> {
        match &self.local {
            Local::Target(writer) => Some(writer.clone()),
            Local::Source(_) => None,
        }
    }

    fn local_name(&self) -> String {
        match &self.local {
            Local::Source(reader) => reader.name(),
            Local::Target(writer) => writer.name(),
        }
    }

    fn preserve_timestamp(&self, cx: &FtpContext) -> bool {
        self.command.settings.preserve_timestamp
            || cx.options().get_bool(OptionId::PreserveTimestamps)
    }

    /// Takes size and time from a cached listing. `false` if the cache
    /// cannot tell.
    fn lookup(&mut self, cx: &FtpContext) -> Result<bool, Reply> {
        let Some(key) = cx.server_key() else {
            return Ok(false);
        };
        let found =
            cx.engine
                .directory_cache
                .lookup_file(&key, &self.command.remote_path, self.name());
        if !found.dir_existed {
            return Ok(false);
        }
        let listing_unsure = cx
            .engine
            .directory_cache
            .lookup(&key, &self.command.remote_path)
            .is_some_and(|l| l.unsure);
        match found.entry {
            Some(entry) if entry.is_dir => {
                cx.log.error(format!("{} is a directory", self.name()));
                Err(Reply::CRITICAL_ERROR)
            }
            Some(entry) if !entry.unsure && found.matched_case => {
                self.remote_size = u64::try_from(entry.size).ok();
                self.remote_time = entry.time;
                Ok(true)
            }
            None if !listing_unsure => {
                self.remote_missing = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Whether both sides have the file.
    fn conflict(&self) -> bool {
        match &self.local {
            Local::Target(writer) => {
                let exists = match self.local_size() {
                    Some(size) => writer.is_file() || size > 0,
                    None => false,
                };
                exists && !self.remote_missing
            }
            Local::Source(_) => !self.remote_missing && self.remote_size.is_some(),
        }
    }

    fn decide(&mut self, action: FileExistsAction, new_name: Option<String>, cx: &FtpContext) -> Reply {
        let download = self.command.is_download();
        let overwrite = match action {
            FileExistsAction::Overwrite => true,
            FileExistsAction::OverwriteNewer => {
                let (source, target) = if download {
                    (self.remote_time, self.local_time())
                } else {
                    (self.local_time(), self.remote_time)
                };
                match (source, target) {
                    (Some(source), Some(target)) => source > target,
                    _ => true,
                }
            }
            FileExistsAction::OverwriteSizeDiffers => self.local_size() != self.remote_size,
            FileExistsAction::Resume => {
                self.resume = true;
                true
            }
            FileExistsAction::Rename => {
                let Some(new_name) = new_name.filter(|n| !n.is_empty()) else {
                    return Reply::ERROR | ReplyFlags::INTERNALERROR;
                };
                return self.rename(new_name, cx);
            }
            FileExistsAction::Skip => false,
        };
        if !overwrite {
            cx.log.status(format!("Skipping {}", self.name()));
            return Reply::OK;
        }
        self.state = State::Transfer;
        Reply::CONTINUE
    }

    fn rename(&mut self, new_name: String, cx: &FtpContext) -> Reply {
        if self.command.is_download() {
            let LocalEndpoint::File(path) = &self.command.local else {
                return Reply::ERROR | ReplyFlags::INTERNALERROR;
            };
            let renamed = LocalEndpoint::File(path.with_file_name(new_name));
            self.command.local = renamed.clone();
            self.local = Local::Target(
                WriterFactory::new(renamed)
                    .with_preallocation(cx.options().get_bool(OptionId::Preallocate)),
            );
            self.state = State::FileExists;
        } else {
            self.command.remote_file = new_name;
            self.remote_size = None;
            self.remote_time = None;
            self.remote_missing = false;
            self.list_tried = false;
            self.state = State::Lookup;
        }
        Reply::CONTINUE
    }

    fn start_download(&mut self, session: &mut FtpSession, cx: &mut FtpContext) -> Reply {
        let Some(writer) = self.local_target() else {
            return Reply::ERROR | ReplyFlags::INTERNALERROR;
        };
        self.offset = 0;
        if self.resume {
            let have = writer.size().unwrap_or(0);
            match self.remote_size {
                Some(size) if have > size => {
                    cx.log.status("Local file is larger than the remote one, restarting");
                }
                Some(size) if have == size => {
                    cx.log.status("File is already complete");
                    return Reply::OK;
                }
                _ => self.offset = have,
            }
        }
        if self.offset > 0 && !self.resume_tested {
            if let Some(reply) = self.resume_test(session, cx) {
                return reply;
            }
        }

        match writer.ensure_parent_dir() {
            Ok(Some(created)) => cx.post(Notification::LocalDirCreated(created)),
            Ok(None) => {}
            Err(error) => {
                cx.log.error(format!("Could not create local directory: {error}"));
                return Reply::CRITICAL_ERROR | ReplyFlags::WRITEFAILED;
            }
        }
        let target = match writer.open(self.offset, self.remote_size, cx.pool()) {
            Ok(target) => target,
            Err(error) => {
                cx.log
                    .error(format!("Could not open {} for writing: {error}", writer.name()));
                return Reply::CRITICAL_ERROR | ReplyFlags::WRITEFAILED;
            }
        };
        let request = RawTransferRequest {
            kind: TransferKind::Download,
            command: format!("RETR {}", self.name()),
            offset: self.offset,
            ascii: self.command.settings.mode == TransferMode::Ascii,
            reader: None,
            writer: Some(target),
            total: self.remote_size.map(|s| s as i64).unwrap_or(-1),
        };
        cx.log.status(format!(
            "Starting download of {}",
            self.command.remote_path.format_filename(self.name())
        ));
        self.state = State::WaitTransfer;
        cx.push(Box::new(RawTransferOp::new(request)));
        Reply::CONTINUE
    }

    /// Checks that `REST` works beyond 2 or 4 GiB before resuming there.
    /// `None` if no test is needed.
    fn resume_test(&mut self, session: &mut FtpSession, cx: &mut FtpContext) -> Option<Reply> {
        let size = self.remote_size?;
        let capability = if size >= FOUR_GB {
            Capability::ResumeBug4Gb
        } else if size >= TWO_GB {
            Capability::ResumeBug2Gb
        } else {
            return None;
        };
        match session.capability(cx, capability) {
            CapabilityState::No => None,
            CapabilityState::Yes => {
                cx.log
                    .error("Server does not support resuming files of this size");
                Some(Reply::CRITICAL_ERROR)
            }
            CapabilityState::Unknown => {
                let request = RawTransferRequest {
                    kind: TransferKind::ResumeTest,
                    command: format!("RETR {}", self.name()),
                    offset: size - 1,
                    ascii: false,
                    reader: None,
                    writer: None,
                    total: -1,
                };
                self.state = State::WaitResumeTest;
                cx.push(Box::new(RawTransferOp::new(request)));
                Some(Reply::CONTINUE)
            }
        }
    }

    fn start_upload(&mut self, session: &mut FtpSession, cx: &mut FtpContext) -> Reply {
        let Local::Source(reader) = &self.local else {
            return Reply::ERROR | ReplyFlags::INTERNALERROR;
        };
        let local_size = reader.size();
        self.offset = 0;
        if self.resume {
            match (self.remote_size, local_size) {
                (Some(remote), Some(local)) if remote == local => {
                    cx.log.status("File is already complete");
                    return Reply::OK;
                }
                (Some(remote), Some(local)) if remote < local => self.offset = remote,
                _ => {}
            }
        }
        let rest_stream = session.capability(cx, Capability::RestStream) == CapabilityState::Yes;
        let (command, rest) = if self.offset == 0 {
            ("STOR", 0)
        } else if rest_stream {
            ("STOR", self.offset)
        } else {
            ("APPE", 0)
        };
        let source = match reader.open(self.offset, cx.pool()) {
            Ok(source) => source,
            Err(error) => {
                cx.log
                    .error(format!("Could not open {} for reading: {error}", reader.name()));
                return Reply::CRITICAL_ERROR;
            }
        };
        let request = RawTransferRequest {
            kind: TransferKind::Upload,
            command: format!("{command} {}", self.name()),
            offset: rest,
            ascii: self.command.settings.mode == TransferMode::Ascii,
            reader: Some(source),
            writer: None,
            total: local_size.map(|s| s as i64).unwrap_or(-1),
        };
        cx.log.status(format!(
            "Starting upload of {}",
            self.command.remote_path.format_filename(self.name())
        ));
        self.state = State::WaitTransfer;
        cx.push(Box::new(RawTransferOp::new(request)));
        Reply::CONTINUE
    }

    fn transfer_done(&mut self, result: Reply, transferred: u64, session: &mut FtpSession, cx: &mut FtpContext) -> Reply {
        let key = cx.server_key();
        let cache = &cx.engine.directory_cache;
        if !result.is_ok() {
            if let (Some(key), false) = (&key, self.command.is_download()) {
                cache.invalidate_file(key, &self.command.remote_path, self.name());
            }
            return result;
        }
        cx.log.status(format!(
            "File transfer successful, transferred {transferred} bytes"
        ));
        match &self.local {
            Local::Target(writer) => {
                if let Some(time) = self.remote_time.filter(|_| self.preserve_timestamp(cx)) {
                    if let Err(error) = writer.set_mtime(time) {
                        cx.log.log(
                            MessageType::DebugWarning,
                            format!("Could not set modification time: {error}"),
                        );
                    }
                }
                Reply::OK
            }
            Local::Source(reader) => {
                if let Some(key) = &key {
                    let mut entry = DirEntry::file(
                        self.name(),
                        reader.size().map(|s| s as i64).unwrap_or(-1),
                    );
                    entry.time = reader.mtime();
                    cache.update_file(key, &self.command.remote_path, entry);
                }
                let mtime = reader.mtime().filter(|_| self.preserve_timestamp(cx));
                match mtime {
                    Some(time)
                        if session.capability(cx, Capability::Mfmt) == CapabilityState::Yes =>
                    {
                        self.state = State::WaitMfmt;
                        let command =
                            format!("MFMT {} {}", time.format("%Y%m%d%H%M%S"), self.name());
                        send_command(session, cx, &self.meta, &command)
                    }
                    _ => Reply::OK,
                }
            }
        }
    }
}

/// Time of a `213` reply to `MDTM`, e.g. `20240102030405` or
/// `20240102030405.123`.
pub fn parse_mdtm(text: &str) -> Option<DateTime<Utc>> {
    let digits = text.trim().split('.').next()?;
    let time = NaiveDateTime::parse_from_str(digits, "%Y%m%d%H%M%S").ok()?;
    Some(time.and_utc())
}

impl Operation<FtpSession> for FileTransferOp {
    op_meta!();

    fn send(&mut self, session: &mut FtpSession, cx: &mut FtpContext) -> Reply {
        match self.state {
            State::Init => {
                let path = self.command.remote_path.clone();
                if !cx.try_lock(&mut self.meta, LockReason::Transfer, &path, false) {
                    return Reply::WOULDBLOCK;
                }
                if let Local::Target(writer) = &self.local {
                    let preallocate = cx.options().get_bool(OptionId::Preallocate);
                    self.local = Local::Target(writer.clone().with_preallocation(preallocate));
                }
                self.state = State::WaitCwd;
                cx.push(Box::new(ChangeDirOp::new(path, "")));
                Reply::CONTINUE
            }
            State::Lookup => match self.lookup(cx) {
                Err(reply) => reply,
                Ok(true) => {
                    self.state = State::FileExists;
                    Reply::CONTINUE
                }
                Ok(false) if !self.list_tried => {
                    self.list_tried = true;
                    self.state = State::WaitList;
                    let mut list = ListCommand::new(self.command.remote_path.clone());
                    list.flags = ListFlags::REFRESH;
                    cx.push(Box::new(ListOp::new(list)));
                    Reply::CONTINUE
                }
                Ok(false) => {
                    self.state = State::Size;
                    Reply::CONTINUE
                }
            },
            State::Size => {
                if session.capability(cx, Capability::Size) == CapabilityState::No {
                    self.state = State::Mdtm;
                    return Reply::CONTINUE;
                }
                self.state = State::WaitSize;
                let command = format!("SIZE {}", self.name());
                send_command(session, cx, &self.meta, &command)
            }
            State::Mdtm => {
                if session.capability(cx, Capability::Mdtm) != CapabilityState::Yes {
                    self.state = State::FileExists;
                    return Reply::CONTINUE;
                }
                self.state = State::WaitMdtm;
                let command = format!("MDTM {}", self.name());
                send_command(session, cx, &self.meta, &command)
            }
            State::FileExists => {
                if !self.command.is_download() && self.remote_missing {
                    self.state = State::Transfer;
                    return Reply::CONTINUE;
                }
                if self.command.is_download() && self.remote_missing {
                    cx.log.error(format!("{}: no such file", self.name()));
                    return Reply::ERROR;
                }
                if !self.conflict() {
                    self.state = State::Transfer;
                    return Reply::CONTINUE;
                }
                if let Some(action) = self.command.settings.on_exists {
                    return self.decide(action, None, cx);
                }
                self.state = State::WaitFileExists;
                let request = FileExistsRequest {
                    direction: self.command.direction,
                    local: self.local_name(),
                    local_size: self.local_size(),
                    local_time: self.local_time(),
                    remote_path: self.command.remote_path.clone(),
                    remote_file: self.command.remote_file.clone(),
                    remote_size: self.remote_size,
                    remote_time: self.remote_time,
                    can_resume: self.command.settings.mode == TransferMode::Binary,
                };
                cx.request(&mut self.meta, AsyncRequestKind::FileExists(request))
            }
            State::Transfer => {
                if self.command.is_download() {
                    self.start_download(session, cx)
                } else {
                    self.start_upload(session, cx)
                }
            }
            State::WaitCwd
            | State::WaitMkdir
            | State::WaitList
            | State::WaitSize
            | State::WaitMdtm
            | State::WaitFileExists
            | State::WaitResumeTest
            | State::WaitTransfer
            | State::WaitMfmt => Reply::WOULDBLOCK,
        }
    }

    fn parse_response(&mut self, session: &mut FtpSession, cx: &mut FtpContext) -> Reply {
        let reply = session.take_reply();
        match self.state {
            State::WaitSize => {
                if reply.code == 213 {
                    self.remote_size = reply.text().trim().parse().ok();
                } else if reply.code == 550 && !self.command.is_download() {
                    self.remote_missing = true;
                } else if matches!(reply.code, 500 | 502) {
                    session.set_capability(cx, Capability::Size, CapabilityState::No);
                }
                self.state = State::Mdtm;
                Reply::CONTINUE
            }
            State::WaitMdtm => {
                if reply.code == 213 {
                    self.remote_time = parse_mdtm(reply.text());
                }
                self.state = State::FileExists;
                Reply::CONTINUE
            }
            State::WaitMfmt => {
                if !reply.is_success() {
                    cx.log.log(
                        MessageType::DebugWarning,
                        "Server did not accept the modification time",
                    );
                }
                Reply::OK
            }
            state => {
                log_unexpected(cx, state);
                Reply::ERROR
            }
        }
    }

    fn subcommand_result(
        &mut self,
        result: Reply,
        child: &dyn Operation<FtpSession>,
        session: &mut FtpSession,
        cx: &mut FtpContext,
    ) -> Reply {
        match self.state {
            State::WaitCwd => {
                if result.is_ok() {
                    self.state = State::Lookup;
                    return Reply::CONTINUE;
                }
                if self.command.is_download()
                    || self.mkdir_tried
                    || result.has(ReplyFlags::DISCONNECTED)
                {
                    return result;
                }
                self.mkdir_tried = true;
                self.state = State::WaitMkdir;
                cx.push(Box::new(MkdirOp::new(self.command.remote_path.clone())));
                Reply::CONTINUE
            }
            State::WaitMkdir => {
                if !result.is_ok() {
                    return result;
                }
                // The new directory is empty
                self.remote_missing = true;
                self.state = State::Transfer;
                Reply::CONTINUE
            }
            State::WaitList => {
                if result.has(ReplyFlags::DISCONNECTED) {
                    return result;
                }
                self.state = State::Lookup;
                Reply::CONTINUE
            }
            State::WaitResumeTest => {
                let Some(test) = child.downcast_ref::<RawTransferOp>() else {
                    return Reply::ERROR | ReplyFlags::INTERNALERROR;
                };
                if result.has(ReplyFlags::DISCONNECTED) {
                    return result;
                }
                let capability = match self.remote_size {
                    Some(size) if size >= FOUR_GB => Capability::ResumeBug4Gb,
                    _ => Capability::ResumeBug2Gb,
                };
                let received = test.data().map(|d| d.len()).unwrap_or_default();
                if test.end_reason() == Some(TransferEndReason::Successful) && received == 1 {
                    session.set_capability(cx, capability, CapabilityState::No);
                    self.resume_tested = true;
                    self.state = State::Transfer;
                    return Reply::CONTINUE;
                }
                if received > 1 {
                    session.set_capability(cx, capability, CapabilityState::Yes);
                }
                cx.log.error("Server does not support resuming files of this size");
                Reply::CRITICAL_ERROR
            }
            State::WaitTransfer => {
                let transferred = child
                    .downcast_ref::<RawTransferOp>()
                    .map(|t| t.transferred())
                    .unwrap_or_default();
                self.transfer_done(result, transferred, session, cx)
            }
            state => {
                log_unexpected(cx, state);
                Reply::ERROR | ReplyFlags::INTERNALERROR
            }
        }
    }

    fn on_async_reply(
        &mut self,
        request: AsyncRequest,
        _session: &mut FtpSession,
        cx: &mut FtpContext,
    ) -> Reply {
        match request.reply {
            Some(AsyncReply::FileExists { action, new_name }) => self.decide(action, new_name, cx),
            _ => Reply::ERROR | ReplyFlags::INTERNALERROR,
        }
    }

    fn reset(&mut self, result: Reply, session: &mut FtpSession, _cx: &mut FtpContext) -> Reply {
        if !result.is_ok() {
            session.abandon_replies();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn mdtm_replies() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).single();
        assert_eq!(parse_mdtm("20240102030405"), expected);
        assert_eq!(parse_mdtm("20240102030405.123"), expected);
        assert_eq!(parse_mdtm("yesterday"), None);
    }
}
