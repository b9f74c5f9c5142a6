use chrono::{DateTime, Utc};
use ferry_common::{
    AsyncReply, AsyncRequest, AsyncRequestKind, CommandId, DirEntry, FerryError,
    FileExistsAction, FileExistsRequest, FileTransferCommand, ListCommand, ListFlags,
    LocalEndpoint, MessageType, Notification, OptionId, Reply, ReplyFlags, TransferMode,
};
use ferry_core::aio::{ReaderFactory, WriterFactory};
use ferry_core::helper_process::{HelperIo, IoStep};
use ferry_core::lock_manager::LockReason;
use ferry_core::operation::{OpMeta, Operation};

use super::{
    drain, log_unexpected, op_meta, reset_on_error, result_of, send_command, ListOp,
};
use crate::event::{quote, SftpEvent};
use crate::session::{SftpContext, SftpSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    Lookup,
    WaitList,
    FileExists,
    WaitFileExists,
    Transfer,
    WaitTransfer,
    WaitMtime,
}

enum Local {
    Source(ReaderFactory),
    Target(WriterFactory),
}

/// Moves one file through the helper with `get` or `put`. The bytes never
/// cross the pipe: the helper reads and writes pool buffers in the shared
/// region.
pub struct FileTransferOp {
    meta: OpMeta,
    state: State,
    command: FileTransferCommand,
    local: Local,
    remote_size: Option<u64>,
    remote_time: Option<DateTime<Utc>>,
    remote_missing: bool,
    list_tried: bool,
    resume: bool,
    offset: u64,
    /// Bytes already reported to the status manager
    reported: u64,
    local_done: bool,
    remote_done: bool,
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
            resume: false,
            offset: 0,
            reported: 0,
            local_done: false,
            remote_done: false,
        }
    }

    fn name(&self) -> &str {
        &self.command.remote_file
    }

    fn remote(&self) -> String {
        self.command.remote_path.format_filename(self.name())
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

    fn preserve_timestamp(&self, cx: &SftpContext) -> bool {
        self.command.settings.preserve_timestamp
            || cx.options().get_bool(OptionId::PreserveTimestamps)
    }

    /// Size and time from the cache. `None` if the cache cannot tell.
    fn lookup(&mut self, cx: &SftpContext) -> Option<Reply> {
        let key = cx.server_key()?;
        let found = cx
            .engine
            .directory_cache
            .lookup_file(&key, &self.command.remote_path, self.name());
        if !found.dir_existed {
            return None;
        }
        match found.entry {
            Some(entry) if entry.is_dir => {
                cx.log.error(format!("{} is a directory", self.name()));
                Some(Reply::CRITICAL_ERROR)
            }
            Some(entry) if !entry.unsure => {
                self.remote_size = u64::try_from(entry.size).ok();
                self.remote_time = entry.time;
                Some(Reply::CONTINUE)
            }
            None => {
                self.remote_missing = true;
                Some(Reply::CONTINUE)
            }
            Some(_) => None,
        }
    }

    fn conflict(&self) -> bool {
        match &self.local {
            Local::Target(writer) => {
                let exists = self
                    .local_size()
                    .is_some_and(|size| writer.is_file() || size > 0);
                exists && !self.remote_missing
            }
            Local::Source(_) => !self.remote_missing && self.remote_size.is_some(),
        }
    }

    fn check_exists(&mut self, cx: &mut SftpContext) -> Reply {
        if self.command.is_download() && self.remote_missing {
            cx.log.error(format!("{}: no such file", self.remote()));
            return Reply::ERROR;
        }
        if !self.conflict() {
            self.state = State::Transfer;
            return Reply::CONTINUE;
        }
        if let Some(action) = self.command.settings.on_exists {
            return self.decide(action, None, cx);
        }
        let (local, local_size, local_time) = match &self.local {
            Local::Source(reader) => (reader.name(), reader.size(), reader.mtime()),
            Local::Target(writer) => (writer.name(), writer.size(), writer.mtime()),
        };
        self.state = State::WaitFileExists;
        let request = FileExistsRequest {
            direction: self.command.direction,
            local,
            local_size,
            local_time,
            remote_path: self.command.remote_path.clone(),
            remote_file: self.command.remote_file.clone(),
            remote_size: self.remote_size,
            remote_time: self.remote_time,
            can_resume: self.command.settings.mode == TransferMode::Binary,
        };
        cx.request(&mut self.meta, AsyncRequestKind::FileExists(request))
    }

    fn decide(&mut self, action: FileExistsAction, new_name: Option<String>, cx: &SftpContext) -> Reply {
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
                if download {
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
                return Reply::CONTINUE;
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

    fn start(&mut self, session: &mut SftpSession, cx: &mut SftpContext) -> Reply {
        self.offset = 0;
        if self.resume {
            let local = self.local_size();
            let (have, want) = if self.command.is_download() {
                (local, self.remote_size)
            } else {
                (self.remote_size, local)
            };
            match (have, want) {
                (Some(have), Some(want)) if have == want => {
                    cx.log.status("File is already complete");
                    return Reply::OK;
                }
                (Some(have), Some(want)) if have > want => {
                    cx.log.status("Target is larger than the source, restarting");
                }
                (Some(have), _) => self.offset = have,
                (None, _) => {}
            }
        }
        let verb = if self.command.is_download() {
            if let Local::Target(writer) = &self.local {
                match writer.ensure_parent_dir() {
                    Ok(Some(created)) => cx.post(Notification::LocalDirCreated(created)),
                    Ok(None) => {}
                    Err(error) => {
                        cx.log.error(format!("Could not create local directory: {error}"));
                        return Reply::CRITICAL_ERROR | ReplyFlags::WRITEFAILED;
                    }
                }
            }
            cx.log.status(format!("Starting download of {}", self.remote()));
            "get"
        } else {
            cx.log.status(format!("Starting upload of {}", self.remote()));
            "put"
        };
        self.state = State::WaitTransfer;
        let command = format!("{verb} {} {}", quote(&self.remote()), self.offset);
        send_command(session, cx, &self.meta, &command)
    }

    /// The helper opened the remote file; `size` is the remote size for
    /// downloads.
    fn open(&mut self, size: Option<u64>, session: &mut SftpSession, cx: &mut SftpContext) -> Reply {
        if size.is_some() && self.command.is_download() {
            self.remote_size = size;
        }
        let io = match &self.local {
            Local::Target(writer) => match writer.open(self.offset, self.remote_size, cx.pool()) {
                Ok(target) => HelperIo::download(target),
                Err(error) => {
                    cx.log
                        .error(format!("Could not open {} for writing: {error}", writer.name()));
                    return Reply::CRITICAL_ERROR | ReplyFlags::WRITEFAILED;
                }
            },
            Local::Source(reader) => match reader.open(self.offset, cx.pool()) {
                Ok(source) => HelperIo::upload(source),
                Err(error) => {
                    cx.log
                        .error(format!("Could not open {} for reading: {error}", reader.name()));
                    return Reply::CRITICAL_ERROR;
                }
            },
        };
        let total = match &self.local {
            Local::Target(_) => self.remote_size,
            Local::Source(_) => self.local_size(),
        };
        cx.status.init(
            total.map(|s| s as i64).unwrap_or(-1),
            self.offset as i64,
            false,
        );
        cx.status.set_start_time();
        session.start_io(io);
        let step = session.with_io(cx, |io, region, waiter| io.next_buffer(0, region, waiter));
        self.on_step(step, session, cx)
    }

    fn on_step(
        &mut self,
        step: Result<IoStep, FerryError>,
        session: &mut SftpSession,
        cx: &mut SftpContext,
    ) -> Reply {
        let transferred = session.io().map(HelperIo::transferred).unwrap_or(self.reported);
        if transferred > self.reported {
            if self.reported == 0 {
                cx.status.set_made_progress();
            }
            cx.status.update((transferred - self.reported) as i64);
            self.reported = transferred;
        }
        match step {
            Err(error) => {
                cx.log.error(format!("Local file error: {error}"));
                if self.command.is_download() {
                    Reply::ERROR | ReplyFlags::WRITEFAILED
                } else {
                    Reply::ERROR
                }
            }
            Ok(IoStep::Answer(_)) | Ok(IoStep::Wait) => Reply::WOULDBLOCK,
            Ok(IoStep::Done) => {
                self.local_done = true;
                self.finish_if_complete(session, cx)
            }
        }
    }

    fn finish_if_complete(&mut self, session: &mut SftpSession, cx: &mut SftpContext) -> Reply {
        if !self.local_done || !self.remote_done {
            return Reply::WOULDBLOCK;
        }
        session.finish_io();
        cx.status.flush();
        cx.log.status(format!(
            "File transfer successful, transferred {} bytes",
            self.reported
        ));
        let (size, mtime) = match &self.local {
            Local::Target(writer) => {
                if let Some(time) = self.remote_time.filter(|_| self.preserve_timestamp(cx)) {
                    if let Err(error) = writer.set_mtime(time) {
                        cx.log.log(
                            MessageType::DebugWarning,
                            format!("Could not set modification time: {error}"),
                        );
                    }
                }
                return Reply::OK;
            }
            Local::Source(reader) => (reader.size(), reader.mtime()),
        };
        if let Some(key) = cx.server_key() {
            let mut entry = DirEntry::file(self.name(), size.map(|s| s as i64).unwrap_or(-1));
            entry.time = mtime;
            cx.engine
                .directory_cache
                .update_file(&key, &self.command.remote_path, entry);
        }
        match mtime.filter(|_| self.preserve_timestamp(cx)) {
            Some(time) => {
                self.state = State::WaitMtime;
                let command = format!("mtime {} {}", quote(&self.remote()), time.timestamp());
                send_command(session, cx, &self.meta, &command)
            }
            None => Reply::OK,
        }
    }

    fn on_event(&mut self, event: SftpEvent, session: &mut SftpSession, cx: &mut SftpContext) -> Reply {
        match (self.state, event) {
            (State::WaitTransfer, SftpEvent::IoOpen { size }) => self.open(size, session, cx),
            (State::WaitTransfer, SftpEvent::IoNextBuf(written)) => {
                let step = session.with_io(cx, |io, region, waiter| {
                    io.next_buffer(written, region, waiter)
                });
                self.on_step(step, session, cx)
            }
            (State::WaitTransfer, SftpEvent::IoFinalize(written)) => {
                let step = session.with_io(cx, |io, region, waiter| {
                    io.finalize(written, region, waiter)
                });
                self.on_step(step, session, cx)
            }
            (State::WaitTransfer, SftpEvent::Done(outcome)) => {
                let result = result_of(outcome);
                if !result.is_ok() {
                    return result;
                }
                self.remote_done = true;
                if session.io().is_none() {
                    // The helper had nothing to move
                    self.local_done = true;
                }
                self.finish_if_complete(session, cx)
            }
            (State::WaitMtime, SftpEvent::Done(outcome)) => {
                if !result_of(outcome).is_ok() {
                    cx.log.log(
                        MessageType::DebugWarning,
                        "Server did not accept the modification time",
                    );
                }
                Reply::OK
            }
            (State::WaitTransfer, SftpEvent::Reply(text)) => {
                cx.log.log(MessageType::Response, text);
                Reply::WOULDBLOCK
            }
            (_, event) => {
                log_unexpected(cx, &event);
                Reply::WOULDBLOCK
            }
        }
    }
}

impl Operation<SftpSession> for FileTransferOp {
    op_meta!();

    fn send(&mut self, session: &mut SftpSession, cx: &mut SftpContext) -> Reply {
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
                self.state = State::Lookup;
                Reply::CONTINUE
            }
            State::Lookup => match self.lookup(cx) {
                Some(reply) if reply.is_continue() => {
                    self.state = State::FileExists;
                    Reply::CONTINUE
                }
                Some(reply) => reply,
                None if !self.list_tried => {
                    self.list_tried = true;
                    self.state = State::WaitList;
                    let mut list = ListCommand::new(self.command.remote_path.clone());
                    list.flags = ListFlags::REFRESH;
                    cx.push(Box::new(ListOp::new(list)));
                    Reply::CONTINUE
                }
                None => {
                    self.state = State::FileExists;
                    Reply::CONTINUE
                }
            },
            State::FileExists => self.check_exists(cx),
            State::Transfer => self.start(session, cx),
            State::WaitList | State::WaitFileExists | State::WaitTransfer | State::WaitMtime => {
                Reply::WOULDBLOCK
            }
        }
    }

    fn parse_response(&mut self, session: &mut SftpSession, cx: &mut SftpContext) -> Reply {
        if session.io_waiting() {
            let step = session.with_io(cx, |io, region, waiter| {
                Ok(io.resume(region, waiter)?.unwrap_or(IoStep::Wait))
            });
            let reply = self.on_step(step, session, cx);
            if !reply.would_block() {
                return reply;
            }
        }
        drain(session, cx, |event, session, cx| self.on_event(event, session, cx))
    }

    fn subcommand_result(
        &mut self,
        result: Reply,
        _child: &dyn Operation<SftpSession>,
        _session: &mut SftpSession,
        _cx: &mut SftpContext,
    ) -> Reply {
        if result.has(ReplyFlags::DISCONNECTED) {
            return result;
        }
        self.state = State::Lookup;
        Reply::CONTINUE
    }

    fn on_async_reply(
        &mut self,
        request: AsyncRequest,
        _session: &mut SftpSession,
        cx: &mut SftpContext,
    ) -> Reply {
        match (self.state, request.reply) {
            (State::WaitFileExists, Some(AsyncReply::FileExists { action, new_name })) => {
                self.decide(action, new_name, cx)
            }
            _ => Reply::ERROR | ReplyFlags::INTERNALERROR,
        }
    }

    fn reset(&mut self, result: Reply, session: &mut SftpSession, cx: &mut SftpContext) -> Reply {
        session.finish_io();
        if !result.is_ok() && !self.command.is_download() {
            if let Some(key) = cx.server_key() {
                cx.engine
                    .directory_cache
                    .invalidate_file(&key, &self.command.remote_path, self.name());
            }
        }
        reset_on_error(result, session, cx)
    }
}
