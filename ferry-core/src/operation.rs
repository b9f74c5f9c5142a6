//! Steps of an operation in flight on a control socket.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ferry_common::{
    AsyncRequest, AsyncRequestKind, CommandId, Credentials, MessageType, Notification,
    NotificationSink, Reply, Server, ServerKey, ServerPath, TransferStatusManager,
};
use tokio::sync::mpsc;

use crate::connection::StreamLayers;
use crate::context::EngineContext;
use crate::control_socket::{ControlEvent, EngineState};
use crate::lock_manager::{LockReason, LockWaker, OpLock};
use crate::logging::Logger;
use crate::transfer::TransferEvent;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Bookkeeping every operation carries besides its own state.
#[derive(Debug)]
pub struct OpMeta {
    pub name: &'static str,
    pub command: CommandId,
    pub lock: Option<OpLock>,
    /// Level at which the commands this operation sends are logged
    pub send_log_level: MessageType,
    /// Set when the operation was created from a caller's command
    pub top_level: bool,
    /// Id of the async request the operation waits for
    pub async_request: Option<u64>,
    /// Set while the operation sleeps on purpose, e.g. for a server's
    /// `Retry-After`. The idle timeout does not apply then.
    pub sleeping: bool,
}

impl OpMeta {
    pub fn new(name: &'static str, command: CommandId) -> Self {
        Self {
            name,
            command,
            lock: None,
            send_log_level: MessageType::Command,
            top_level: false,
            async_request: None,
            sleeping: false,
        }
    }

    pub fn waiting_for_lock(&self) -> bool {
        self.lock.as_ref().is_some_and(|l| l.waiting())
    }

    pub fn waiting_for_async_request(&self) -> bool {
        self.async_request.is_some()
    }

    /// Whether the idle timeout is suspended for this operation.
    pub fn idle_exempt(&self) -> bool {
        self.sleeping || self.waiting_for_lock() || self.waiting_for_async_request()
    }
}

/// One step of a multi-step operation, driven by its
/// [ControlSocket](crate::control_socket::ControlSocket). Only the top of
/// the stack is ever called.
///
/// Every method answers with a [Reply]: `CONTINUE` calls [Operation::send]
/// again right away, `WOULDBLOCK` suspends until an event arrives and
/// anything else pops the operation.
pub trait Operation<S>: AsAny + Send {
    fn meta(&self) -> &OpMeta;

    fn meta_mut(&mut self) -> &mut OpMeta;

    fn send(&mut self, session: &mut S, cx: &mut OpContext<S>) -> Reply;

    /// A complete response for this operation is waiting in the session.
    fn parse_response(&mut self, _session: &mut S, cx: &mut OpContext<S>) -> Reply {
        cx.log
            .log(MessageType::DebugWarning, "Unexpected response for the current operation");
        Reply::ERROR | ferry_common::ReplyFlags::INTERNALERROR
    }

    /// A sub-operation this one pushed has finished with `result`.
    fn subcommand_result(
        &mut self,
        result: Reply,
        _child: &dyn Operation<S>,
        _session: &mut S,
        _cx: &mut OpContext<S>,
    ) -> Reply {
        if result.is_ok() {
            Reply::CONTINUE
        } else {
            result
        }
    }

    /// The caller answered the async request this operation waits for.
    fn on_async_reply(
        &mut self,
        _request: AsyncRequest,
        _session: &mut S,
        _cx: &mut OpContext<S>,
    ) -> Reply {
        Reply::ERROR | ferry_common::ReplyFlags::INTERNALERROR
    }

    fn on_transfer_event(
        &mut self,
        _event: TransferEvent,
        _session: &mut S,
        _cx: &mut OpContext<S>,
    ) -> Reply {
        Reply::WOULDBLOCK
    }

    /// The operation is about to be popped with `result`. Must not push.
    fn reset(&mut self, result: Reply, _session: &mut S, _cx: &mut OpContext<S>) -> Reply {
        result
    }
}

impl<S: 'static> dyn Operation<S> {
    pub fn downcast_ref<T: Operation<S>>(&self) -> Option<&T> {
        self.as_any().downcast_ref()
    }
}

/// Everything an operation may touch besides its own state and the
/// protocol session.
pub struct OpContext<S> {
    pub engine: EngineContext,
    pub log: Logger,
    pub events: mpsc::UnboundedSender<ControlEvent>,
    pub status: TransferStatusManager,
    pub layers: StreamLayers,
    pub server: Option<Server>,
    pub credentials: Credentials,
    /// Lock owner id of this socket
    pub owner: u64,
    pub(crate) sink: Arc<dyn NotificationSink>,
    pub(crate) state: Arc<EngineState>,
    lock_waker: LockWaker,
    pushed: Option<Box<dyn Operation<S>>>,
}

impl<S> OpContext<S> {
    pub(crate) fn new(
        engine: EngineContext,
        log: Logger,
        events: mpsc::UnboundedSender<ControlEvent>,
        sink: Arc<dyn NotificationSink>,
        state: Arc<EngineState>,
        status: TransferStatusManager,
        layers: StreamLayers,
    ) -> Self {
        let owner = crate::connection::next_connection_id();
        let lock_waker: LockWaker = {
            let events = events.clone();
            Arc::new(move |id| {
                let _ = events.send(ControlEvent::LockGranted(id));
            })
        };
        Self {
            status,
            engine,
            log,
            events,
            layers,
            server: None,
            credentials: Credentials::default(),
            owner,
            sink,
            state,
            lock_waker,
            pushed: None,
        }
    }

    /// Makes `op` the new top of the stack once the current call returns.
    /// Return `CONTINUE` to start it right away.
    pub fn push(&mut self, op: Box<dyn Operation<S>>) {
        debug_assert!(self.pushed.is_none(), "one push per call");
        self.pushed = Some(op);
    }

    pub(crate) fn take_pushed(&mut self) -> Option<Box<dyn Operation<S>>> {
        self.pushed.take()
    }

    pub fn server_key(&self) -> Option<ServerKey> {
        self.server.as_ref().map(|s| s.key())
    }

    pub fn post(&self, notification: Notification) {
        self.sink.post(notification);
    }

    /// Acquires a path lock for `meta`, or checks the one requested
    /// earlier. `false` means the operation must return `WOULDBLOCK`; a
    /// [ControlEvent::LockGranted] resumes it.
    pub fn try_lock(
        &mut self,
        meta: &mut OpMeta,
        reason: LockReason,
        path: &ServerPath,
        inclusive: bool,
    ) -> bool {
        if let Some(lock) = &meta.lock {
            return !lock.waiting();
        }
        let Some(server) = self.server_key() else {
            return true;
        };
        let lock = self.engine.lock_manager.lock(
            self.owner,
            &self.lock_waker,
            server,
            reason,
            path.clone(),
            inclusive,
        );
        let granted = !lock.waiting();
        if !granted {
            self.log.log(
                MessageType::DebugVerbose,
                format!("Waiting for lock on {path} ({reason:?})"),
            );
        }
        meta.lock = Some(lock);
        granted
    }

    /// Asks the caller a question. The operation waits with `WOULDBLOCK`
    /// until [Operation::on_async_reply] is called.
    pub fn request(&mut self, meta: &mut OpMeta, kind: AsyncRequestKind) -> Reply {
        let id = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
        meta.async_request = Some(id);
        self.sink.post(Notification::AsyncRequest(AsyncRequest {
            id,
            kind,
            reply: None,
        }));
        Reply::WOULDBLOCK
    }

    pub fn pool(&self) -> &crate::buffer_pool::BufferPool {
        &self.engine.buffer_pool
    }

    pub fn options(&self) -> &ferry_common::Options {
        &self.engine.options
    }

    pub fn notify_listing(&self, path: ServerPath, primary: bool, failed: bool) {
        self.post(Notification::DirectoryListing {
            path,
            primary,
            failed,
        });
    }
}
