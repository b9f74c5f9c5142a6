use ferry_common::{
    AsyncReply, AsyncRequest, AsyncRequestKind, CommandId, FileExistsAction, FileExistsRequest,
    FileTransferCommand, LocalEndpoint, OptionId, Reply, ReplyFlags, TransferMode,
};
use ferry_core::aio::{ReaderFactory, WriterFactory};
use ferry_core::operation::{OpMeta, Operation};
use http::Method;
use url::Url;

use super::{op_meta, BodyTarget, RequestOp};
use crate::request::HttpRequest;
use crate::session::{HttpContext, HttpOp, HttpSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    FileExists,
    WaitFileExists,
    Request,
    WaitRequest,
}

/// Downloads with GET, uploads with PUT.
pub struct FileTransferOp {
    meta: OpMeta,
    state: State,
    command: FileTransferCommand,
    offset: u64,
}

impl FileTransferOp {
    pub fn new(command: FileTransferCommand) -> Self {
        Self {
            meta: OpMeta::new("FileTransferOp", CommandId::FileTransfer),
            state: State::FileExists,
            command,
            offset: 0,
        }
    }

    fn writer(&self, cx: &HttpContext) -> WriterFactory {
        WriterFactory::new(self.command.local.clone())
            .with_preallocation(cx.options().get_bool(OptionId::Preallocate))
    }

    fn url(&self, cx: &HttpContext) -> Option<Url> {
        let server = cx.server.as_ref()?;
        let mut url = Url::parse(&format!(
            "{}://{}/",
            server.protocol.scheme(),
            server.authority()
        ))
        .ok()?;
        url.set_path(
            &self
                .command
                .remote_path
                .format_filename(&self.command.remote_file),
        );
        Some(url)
    }

    fn check_exists(&mut self, cx: &mut HttpContext) -> Reply {
        if !self.command.is_download() {
            self.state = State::Request;
            return Reply::CONTINUE;
        }
        let writer = self.writer(cx);
        let exists = match writer.size() {
            Some(size) => writer.is_file() || size > 0,
            None => false,
        };
        if !exists {
            self.state = State::Request;
            return Reply::CONTINUE;
        }
        if let Some(action) = self.command.settings.on_exists {
            return self.decide(action, None, cx);
        }
        self.state = State::WaitFileExists;
        let request = FileExistsRequest {
            direction: self.command.direction,
            local: writer.name(),
            local_size: writer.size(),
            local_time: writer.mtime(),
            remote_path: self.command.remote_path.clone(),
            remote_file: self.command.remote_file.clone(),
            remote_size: None,
            remote_time: None,
            can_resume: self.command.settings.mode == TransferMode::Binary,
        };
        cx.request(&mut self.meta, AsyncRequestKind::FileExists(request))
    }

    /// The remote side is unknown before the request, so every overwrite
    /// variant overwrites.
    fn decide(&mut self, action: FileExistsAction, new_name: Option<String>, cx: &HttpContext) -> Reply {
        match action {
            FileExistsAction::Overwrite
            | FileExistsAction::OverwriteNewer
            | FileExistsAction::OverwriteSizeDiffers => {}
            FileExistsAction::Resume => {
                self.offset = self.writer(cx).size().unwrap_or(0);
            }
            FileExistsAction::Rename => {
                let Some(new_name) = new_name.filter(|n| !n.is_empty()) else {
                    return Reply::ERROR | ReplyFlags::INTERNALERROR;
                };
                let LocalEndpoint::File(path) = &self.command.local else {
                    return Reply::ERROR | ReplyFlags::INTERNALERROR;
                };
                self.command.local = LocalEndpoint::File(path.with_file_name(new_name));
                self.state = State::FileExists;
                return Reply::CONTINUE;
            }
            FileExistsAction::Skip => {
                cx.log
                    .status(format!("Skipping {}", self.command.remote_file));
                return Reply::OK;
            }
        }
        self.state = State::Request;
        Reply::CONTINUE
    }

    fn request(&mut self, cx: &mut HttpContext) -> Reply {
        let Some(url) = self.url(cx) else {
            cx.log.error("Cannot build a URL for the remote file");
            return Reply::ERROR | ReplyFlags::INTERNALERROR;
        };
        let op: HttpOp = if self.command.is_download() {
            let mut request = HttpRequest::new(Method::GET, url);
            request.set_range(self.offset);
            let target = BodyTarget::Writer {
                factory: self.writer(cx),
                offset: self.offset,
            };
            Box::new(RequestOp::new(request, target))
        } else {
            let mut request = HttpRequest::new(Method::PUT, url);
            request.body = Some(ReaderFactory::new(self.command.local.clone()));
            Box::new(RequestOp::new(request, BodyTarget::Discard))
        };
        self.state = State::WaitRequest;
        cx.push(op);
        Reply::CONTINUE
    }
}

impl Operation<HttpSession> for FileTransferOp {
    op_meta!();

    fn send(&mut self, _session: &mut HttpSession, cx: &mut HttpContext) -> Reply {
        match self.state {
            State::FileExists => self.check_exists(cx),
            State::Request => self.request(cx),
            State::WaitFileExists | State::WaitRequest => Reply::WOULDBLOCK,
        }
    }

    fn subcommand_result(
        &mut self,
        result: Reply,
        child: &dyn Operation<HttpSession>,
        _session: &mut HttpSession,
        cx: &mut HttpContext,
    ) -> Reply {
        if !result.is_ok() {
            return result;
        }
        let preserve = self.command.settings.preserve_timestamp
            || cx.options().get_bool(OptionId::PreserveTimestamps);
        if self.command.is_download() && preserve {
            let time = child
                .downcast_ref::<RequestOp>()
                .and_then(|op| op.response())
                .and_then(|response| response.last_modified());
            if let Some(time) = time {
                if let Err(error) = self.writer(cx).set_mtime(time) {
                    cx.log
                        .debug(format!("Could not set modification time: {error}"));
                }
            }
        }
        Reply::OK
    }

    fn on_async_reply(
        &mut self,
        request: AsyncRequest,
        _session: &mut HttpSession,
        cx: &mut HttpContext,
    ) -> Reply {
        match (self.state, request.reply) {
            (State::WaitFileExists, Some(AsyncReply::FileExists { action, new_name })) => {
                self.decide(action, new_name, cx)
            }
            _ => Reply::ERROR | ReplyFlags::INTERNALERROR,
        }
    }
}
