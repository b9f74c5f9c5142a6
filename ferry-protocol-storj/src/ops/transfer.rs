use chrono::{DateTime, Utc};
use ferry_common::{
    AsyncReply, AsyncRequest, AsyncRequestKind, CommandId, DirEntry, FerryError,
    FileExistsAction, FileExistsRequest, FileTransferCommand, ListCommand, ListFlags,
    MessageType, Notification, OptionId, Reply, ReplyFlags,
};
use ferry_core::aio::{ReaderFactory, WriterFactory};
use ferry_core::helper_process::{HelperIo, IoStep};
use ferry_core::lock_manager::LockReason;
use ferry_core::operation::{OpMeta, Operation};

use super::{
    bucket_and_key, drain, log_unexpected, op_meta, reset_on_error, result_of, send_command,
    ListOp,
};
use crate::event::{quote, StorjEvent};
use crate::session::{StorjContext, StorjSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    Lookup,
    WaitList,
    FileExists,
    WaitFileExists,
    Transfer,
    WaitTransfer,
}

enum Local {
    Source(ReaderFactory),
    Target(WriterFactory),
}

/// Downloads or uploads one object through pool buffers lent to the
/// helper. Objects are written in one piece, so only downloads resume.
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

    fn local_size(&self) -> Option<u64> {
        match &self.local {
            Local::Source(reader) => reader.size(),
            Local::Target(writer) => writer.size(),
        }
    }

    fn lookup(&mut self, cx: &StorjContext) -> Option<Reply> {
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

    fn check_exists(&mut self, cx: &mut StorjContext) -> Reply {
        let (conflict, local, local_time) = match &self.local {
            Local::Target(writer) => (
                !self.remote_missing && writer.size().is_some_and(|s| s > 0 || writer.is_file()),
                writer.name(),
                writer.mtime(),
            ),
            Local::Source(reader) => (
                !self.remote_missing && self.remote_size.is_some(),
                reader.name(),
                reader.mtime(),
            ),
        };
        if self.command.is_download() && self.remote_missing {
            cx.log.error(format!("{}: no such object", self.name()));
            return Reply::ERROR;
        }
        if !conflict {
            self.state = State::Transfer;
            return Reply::CONTINUE;
        }
        if let Some(action) = self.command.settings.on_exists {
            return self.decide(action, cx);
        }
        self.state = State::WaitFileExists;
        let request = FileExistsRequest {
            direction: self.command.direction,
            local,
            local_size: self.local_size(),
            local_time,
            remote_path: self.command.remote_path.clone(),
            remote_file: self.command.remote_file.clone(),
            remote_size: self.remote_size,
            remote_time: self.remote_time,
            can_resume: self.command.is_download(),
        };
        cx.request(&mut self.meta, AsyncRequestKind::FileExists(request))
    }

    fn decide(&mut self, action: FileExistsAction, cx: &StorjContext) -> Reply {
        let overwrite = match action {
            FileExistsAction::Overwrite => true,
            FileExistsAction::OverwriteSizeDiffers => self.local_size() != self.remote_size,
            FileExistsAction::OverwriteNewer => {
                let local_time = match &self.local {
                    Local::Source(reader) => reader.mtime(),
                    Local::Target(writer) => writer.mtime(),
                };
                match (local_time, self.remote_time) {
                    (Some(local), Some(remote)) if self.command.is_download() => remote > local,
                    (Some(local), Some(remote)) => local > remote,
                    _ => true,
                }
            }
            FileExistsAction::Resume => {
                self.resume = self.command.is_download();
                true
            }
            FileExistsAction::Rename => {
                cx.log.error("Renaming on conflict is not supported for Storj");
                return Reply::ERROR | ReplyFlags::NOTSUPPORTED;
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

    fn start(&mut self, session: &mut StorjSession, cx: &mut StorjContext) -> Reply {
        let Some((bucket, key)) = bucket_and_key(&self.command.remote_path, self.name()) else {
            cx.log.error("Files can only be stored inside a bucket");
            return Reply::CRITICAL_ERROR;
        };
        self.offset = 0;
        if self.resume {
            match (self.local_size(), self.remote_size) {
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
        let command = match &self.local {
            Local::Target(writer) => {
                match writer.ensure_parent_dir() {
                    Ok(Some(created)) => cx.post(Notification::LocalDirCreated(created)),
                    Ok(None) => {}
                    Err(error) => {
                        cx.log.error(format!("Could not create local directory: {error}"));
                        return Reply::CRITICAL_ERROR | ReplyFlags::WRITEFAILED;
                    }
                }
                format!("get {} {} {}", quote(&bucket), quote(&key), self.offset)
            }
            Local::Source(_) => format!("put {} {}", quote(&bucket), quote(&key)),
        };
        self.state = State::WaitTransfer;
        send_command(session, cx, &self.meta, &command)
    }

    fn open(&mut self, size: Option<u64>, session: &mut StorjSession, cx: &mut StorjContext) -> Reply {
        if size.is_some() && self.command.is_download() {
            self.remote_size = size;
        }
        let (io, total) = match &self.local {
            Local::Target(writer) => {
                match writer.open(self.offset, self.remote_size, cx.pool()) {
                    Ok(target) => (HelperIo::download(target), self.remote_size),
                    Err(error) => {
                        cx.log.error(format!(
                            "Could not open {} for writing: {error}",
                            writer.name()
                        ));
                        return Reply::CRITICAL_ERROR | ReplyFlags::WRITEFAILED;
                    }
                }
            }
            Local::Source(reader) => match reader.open(0, cx.pool()) {
                Ok(source) => (HelperIo::upload(source), reader.size()),
                Err(error) => {
                    cx.log.error(format!(
                        "Could not open {} for reading: {error}",
                        reader.name()
                    ));
                    return Reply::CRITICAL_ERROR;
                }
            },
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
        session: &mut StorjSession,
        cx: &mut StorjContext,
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
                match self.local {
                    Local::Target(_) => Reply::ERROR | ReplyFlags::WRITEFAILED,
                    Local::Source(_) => Reply::ERROR,
                }
            }
            Ok(IoStep::Answer(_)) | Ok(IoStep::Wait) => Reply::WOULDBLOCK,
            Ok(IoStep::Done) => {
                self.local_done = true;
                self.finish_if_complete(session, cx)
            }
        }
    }

    fn finish_if_complete(&mut self, session: &mut StorjSession, cx: &mut StorjContext) -> Reply {
        if !self.local_done || !self.remote_done {
            return Reply::WOULDBLOCK;
        }
        session.finish_io();
        cx.status.flush();
        cx.log.status(format!(
            "File transfer successful, transferred {} bytes",
            self.reported
        ));
        if let (Local::Source(reader), Some(key)) = (&self.local, cx.server_key()) {
            let mut entry = DirEntry::file(
                self.name(),
                reader.size().map(|s| s as i64).unwrap_or(-1),
            );
            entry.time = Some(Utc::now());
            cx.engine
                .directory_cache
                .update_file(&key, &self.command.remote_path, entry);
        }
        Reply::OK
    }

    fn on_event(&mut self, event: StorjEvent, session: &mut StorjSession, cx: &mut StorjContext) -> Reply {
        match (self.state, event) {
            (State::WaitTransfer, StorjEvent::IoOpen { size }) => self.open(size, session, cx),
            (State::WaitTransfer, StorjEvent::IoNextBuf(written)) => {
                let step = session.with_io(cx, |io, region, waiter| {
                    io.next_buffer(written, region, waiter)
                });
                self.on_step(step, session, cx)
            }
            (State::WaitTransfer, StorjEvent::IoFinalize(written)) => {
                let step = session
                    .with_io(cx, |io, region, waiter| io.finalize(written, region, waiter));
                self.on_step(step, session, cx)
            }
            (State::WaitTransfer, StorjEvent::Done(outcome)) => {
                let result = result_of(outcome);
                if !result.is_ok() {
                    return result;
                }
                self.remote_done = true;
                if session.io().is_none() {
                    self.local_done = true;
                }
                self.finish_if_complete(session, cx)
            }
            (_, StorjEvent::Reply(text)) => {
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

impl Operation<StorjSession> for FileTransferOp {
    op_meta!();

    fn send(&mut self, session: &mut StorjSession, cx: &mut StorjContext) -> Reply {
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
            State::WaitList | State::WaitFileExists | State::WaitTransfer => Reply::WOULDBLOCK,
        }
    }

    fn parse_response(&mut self, session: &mut StorjSession, cx: &mut StorjContext) -> Reply {
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
        _child: &dyn Operation<StorjSession>,
        _session: &mut StorjSession,
        _cx: &mut StorjContext,
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
        _session: &mut StorjSession,
        cx: &mut StorjContext,
    ) -> Reply {
        match (self.state, request.reply) {
            (State::WaitFileExists, Some(AsyncReply::FileExists { action, .. })) => {
                self.decide(action, cx)
            }
            _ => Reply::ERROR | ReplyFlags::INTERNALERROR,
        }
    }

    fn reset(&mut self, result: Reply, session: &mut StorjSession, cx: &mut StorjContext) -> Reply {
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
