//! The operation stack of one connection and the single point every
//! event of that connection is dispatched through.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ferry_common::{
    AsyncRequest, Command, CommandId, MessageType, Notification, NotificationSink, OptionId,
    Protocol, Reply, ReplyFlags, TransferStatusManager,
};
use tokio::sync::mpsc;
use tracing::{debug, info_span, warn, Span};

use crate::connection::{SocketEvent, StreamLayers};
use crate::context::EngineContext;
use crate::helper_process::HelperEvent;
use crate::logging::Logger;
use crate::operation::{OpContext, Operation};
use crate::transfer::TransferEvent;

/// Wake sources of a control socket. They all arrive through one channel
/// per socket and are handled by [ControlSocketDriver::dispatch].
#[derive(Debug)]
pub enum ControlEvent {
    Socket { conn: u64, event: SocketEvent },
    Helper { process: u64, event: HelperEvent },
    Transfer { id: u64, event: TransferEvent },
    LockGranted(u64),
    BufferAvailable,
    AsyncReply(AsyncRequest),
    /// Continue the current operation
    Resume,
    Timer,
}

/// What a session made of an event.
#[derive(Debug)]
pub enum SessionAction {
    /// A complete response for the current operation is buffered
    ParseResponse,
    Transfer(TransferEvent),
    Resume,
    Disconnected(Reply),
}

/// Protocol-specific state shared by all operations of one connection:
/// the connection itself, receive buffers, negotiated features.
pub trait ProtocolSession: Send + Sized + 'static {
    fn create_operation(
        &mut self,
        command: Command,
        cx: &mut OpContext<Self>,
    ) -> Result<Box<dyn Operation<Self>>, Reply>;

    fn handle_event(
        &mut self,
        event: ControlEvent,
        cx: &mut OpContext<Self>,
    ) -> Option<SessionAction>;

    /// Further actions from data buffered by [ProtocolSession::handle_event],
    /// e.g. the second of two replies that arrived in one read.
    fn next_action(&mut self, _cx: &mut OpContext<Self>) -> Option<SessionAction> {
        None
    }

    /// Called every second. `idle` is set when no operation is running.
    fn on_timer(&mut self, _idle: bool, _cx: &mut OpContext<Self>) {}

    fn is_connected(&self) -> bool;

    fn close(&mut self, cx: &mut OpContext<Self>);
}

#[derive(Debug, Default)]
struct StateInner {
    current: Option<CommandId>,
    connected: bool,
}

/// What the facade needs to answer `execute` without waiting for the
/// event loop.
#[derive(Debug, Default)]
pub struct EngineState {
    inner: Mutex<StateInner>,
}

impl EngineState {
    fn lock(&self) -> std::sync::MutexGuard<'_, StateInner> {
        #[allow(clippy::unwrap_used, reason = "panic on poison")]
        self.inner.lock().unwrap()
    }

    /// Admits `command` or tells why it cannot run now.
    pub fn begin(&self, command: &Command) -> Reply {
        let mut state = self.lock();
        if state.current.is_some() {
            return Reply::error(ReplyFlags::BUSY);
        }
        match command {
            Command::Connect { .. } if state.connected => {
                return Reply::error(ReplyFlags::ALREADYCONNECTED)
            }
            Command::Connect { .. } => {}
            Command::Disconnect if !state.connected => return Reply::OK,
            _ if !state.connected => return Reply::error(ReplyFlags::NOTCONNECTED),
            _ => {}
        }
        state.current = Some(command.id());
        Reply::WOULDBLOCK
    }

    pub fn current(&self) -> Option<CommandId> {
        self.lock().current
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.lock().connected = connected;
    }

    pub(crate) fn finish(&self, connected: bool) {
        let mut state = self.lock();
        state.current = None;
        state.connected = connected;
    }
}

/// Object-safe face of a [ControlSocket], as used by the engine loop.
pub trait ControlSocketDriver: Send {
    fn protocol(&self) -> Option<Protocol>;

    /// Runs a command admitted by [EngineState::begin].
    fn execute(&mut self, command: Command);

    fn dispatch(&mut self, event: ControlEvent);

    fn cancel(&mut self);

    fn is_connected(&self) -> bool;
}

/// Everything a protocol needs to build a control socket.
pub struct SocketSetup {
    pub engine: EngineContext,
    pub sink: Arc<dyn NotificationSink>,
    pub state: Arc<EngineState>,
    pub status: TransferStatusManager,
    pub events: mpsc::UnboundedSender<ControlEvent>,
}

pub trait ControlSocketFactory: Send + Sync {
    fn supports(&self, protocol: Protocol) -> bool;

    fn create(&self, protocol: Protocol, setup: SocketSetup) -> Box<dyn ControlSocketDriver>;
}

pub struct ControlSocket<S: ProtocolSession> {
    stack: Vec<Box<dyn Operation<S>>>,
    session: S,
    cx: OpContext<S>,
    span: Span,
}

impl<S: ProtocolSession> ControlSocket<S> {
    pub fn new(session: S, setup: SocketSetup) -> Self {
        let log = Logger::new(setup.sink.clone(), setup.engine.options.clone(), "control");
        let layers = StreamLayers {
            activity: setup.engine.activity.clone(),
            clock: Default::default(),
            limiter: setup.engine.rate_limiters.global(),
        };
        let cx = OpContext::new(
            setup.engine,
            log,
            setup.events,
            setup.sink,
            setup.state,
            setup.status,
            layers,
        );
        Self {
            stack: vec![],
            session,
            cx,
            span: Span::none(),
        }
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn context(&self) -> &OpContext<S> {
        &self.cx
    }

    fn push(&mut self, op: Box<dyn Operation<S>>) {
        debug!(operation = op.meta().name, depth = self.stack.len(), "Push");
        self.cx.layers.clock.touch();
        self.stack.push(op);
    }

    /// Installs an operation the last call pushed.
    fn after_call(&mut self, reply: Reply) -> Reply {
        let Some(child) = self.cx.take_pushed() else {
            return reply;
        };
        if reply.is_continue() || reply.would_block() {
            self.push(child);
            Reply::CONTINUE
        } else {
            warn!(
                operation = child.meta().name,
                %reply,
                "Dropping sub-operation pushed by a finishing operation"
            );
            reply
        }
    }

    fn send_current(&mut self) -> Reply {
        let Some(op) = self.stack.last_mut() else {
            return Reply::WOULDBLOCK;
        };
        if op.meta().waiting_for_lock() || op.meta().waiting_for_async_request() {
            return Reply::WOULDBLOCK;
        }
        let reply = op.send(&mut self.session, &mut self.cx);
        self.after_call(reply)
    }

    fn send_next(&mut self) {
        let reply = self.send_current();
        self.process(reply);
    }

    /// Acts on the reply of the top operation until something blocks.
    fn process(&mut self, mut reply: Reply) {
        loop {
            if self.stack.is_empty() {
                return;
            }
            match reply.kind() {
                ferry_common::ReplyKind::WouldBlock => return,
                ferry_common::ReplyKind::Continue => reply = self.send_current(),
                _ if reply.has(ReplyFlags::DISCONNECTED) => {
                    self.abort(reply);
                    return;
                }
                _ => match self.pop(reply) {
                    Some(next) => reply = next,
                    None => return,
                },
            }
        }
    }

    /// Pops the top operation. Returns the parent's verdict on the result,
    /// `None` if the stack is now empty.
    fn pop(&mut self, result: Reply) -> Option<Reply> {
        let mut op = self.stack.pop()?;
        let result = op.reset(result, &mut self.session, &mut self.cx);
        if self.cx.take_pushed().is_some() {
            warn!(operation = op.meta().name, "Operation pushed while being reset");
        }
        op.meta_mut().lock = None;
        debug!(operation = op.meta().name, %result, "Pop");

        let top_level = op.meta().top_level.then_some(op.meta().command);
        let next = match self.stack.last_mut() {
            Some(parent) => {
                let reply = parent.subcommand_result(result, &*op, &mut self.session, &mut self.cx);
                Some(reply)
            }
            None => None,
        };
        drop(op);
        if let Some(command) = top_level {
            self.finish(command, result);
        }
        next.map(|reply| self.after_call(reply))
    }

    /// Unwinds the whole stack with `reply`.
    fn abort(&mut self, reply: Reply) {
        let mut finished = None;
        while let Some(mut op) = self.stack.pop() {
            let result = op.reset(reply, &mut self.session, &mut self.cx);
            let _ = self.cx.take_pushed();
            debug!(operation = op.meta().name, %result, "Unwind");
            if op.meta().top_level {
                finished = Some((op.meta().command, result));
            }
        }
        if reply.has(ReplyFlags::DISCONNECTED) {
            self.session.close(&mut self.cx);
        }
        match finished {
            Some((command, result)) => self.finish(command, result),
            None => self.cx.state.set_connected(self.session.is_connected()),
        }
    }

    fn finish(&mut self, command: CommandId, reply: Reply) {
        self.log_result(reply);
        self.cx.status.reset();
        self.cx.state.finish(self.session.is_connected());
        self.cx.post(Notification::OperationFinished { command, reply });
    }

    fn log_result(&self, reply: Reply) {
        let log = &self.cx.log;
        if reply.has(ReplyFlags::CANCELED) {
            log.error("Interrupted by user");
        } else if reply.has(ReplyFlags::TIMEOUT) {
            log.error("Connection timed out");
        } else if reply.is_critical() {
            log.error("Critical error");
        } else if reply.is_error() {
            log.log(MessageType::DebugInfo, format!("Operation failed: {reply}"));
        }
    }

    fn run_action(&mut self, action: SessionAction) {
        match action {
            SessionAction::ParseResponse => {
                let Some(op) = self.stack.last_mut() else {
                    self.cx
                        .log
                        .log(MessageType::DebugInfo, "Response without an operation");
                    return;
                };
                let reply = op.parse_response(&mut self.session, &mut self.cx);
                let reply = self.after_call(reply);
                self.process(reply);
            }
            SessionAction::Transfer(event) => {
                let Some(op) = self.stack.last_mut() else {
                    return;
                };
                let reply = op.on_transfer_event(event, &mut self.session, &mut self.cx);
                let reply = self.after_call(reply);
                self.process(reply);
            }
            SessionAction::Resume => self.send_next(),
            SessionAction::Disconnected(reply) => {
                if self.stack.is_empty() {
                    self.cx.log.status("Connection closed by server");
                    self.session.close(&mut self.cx);
                    self.cx.state.set_connected(false);
                } else {
                    self.abort(reply | ReplyFlags::DISCONNECTED);
                }
            }
        }
    }

    fn on_async_reply(&mut self, request: AsyncRequest) {
        let Some(op) = self.stack.last_mut() else {
            return;
        };
        if op.meta().async_request != Some(request.id) {
            self.cx.log.log(
                MessageType::DebugWarning,
                format!("Ignoring reply to stale request {}", request.id),
            );
            return;
        }
        op.meta_mut().async_request = None;
        self.cx.layers.clock.touch();
        let reply = if request.reply_matches() {
            op.on_async_reply(request, &mut self.session, &mut self.cx)
        } else {
            Reply::ERROR | ReplyFlags::INTERNALERROR
        };
        let reply = self.after_call(reply);
        self.process(reply);
    }

    fn on_timer(&mut self) {
        let Some(op) = self.stack.last() else {
            self.session.on_timer(true, &mut self.cx);
            return;
        };
        if op.meta().idle_exempt() {
            return;
        }
        let timeout = self.cx.options().get_int(OptionId::Timeout);
        if timeout > 0 {
            let timeout = Duration::from_secs(timeout as u64);
            if self.cx.layers.clock.idle_for() >= timeout {
                self.cx.log.error(format!(
                    "No activity for {} seconds, giving up",
                    timeout.as_secs()
                ));
                self.abort(Reply::ERROR | ReplyFlags::TIMEOUT | ReplyFlags::DISCONNECTED);
                return;
            }
        }
        self.session.on_timer(false, &mut self.cx);
    }

    fn disconnect(&mut self) {
        if !self.stack.is_empty() {
            self.abort(Reply::ERROR | ReplyFlags::CANCELED | ReplyFlags::DISCONNECTED);
        }
        self.session.close(&mut self.cx);
        self.cx.log.status("Disconnected from server");
        self.finish(CommandId::Disconnect, Reply::OK);
    }
}

impl<S: ProtocolSession> ControlSocketDriver for ControlSocket<S> {
    fn protocol(&self) -> Option<Protocol> {
        self.cx.server.as_ref().map(|s| s.protocol)
    }

    fn execute(&mut self, command: Command) {
        let id = command.id();
        match &command {
            Command::Disconnect => return self.disconnect(),
            Command::Connect { site, .. } => {
                self.span = info_span!("socket", server = %site.server);
                self.cx.server = Some(site.server.clone());
                self.cx.credentials = site.credentials.clone();
                self.cx.log = self.cx.log.with_tag(&site.server.to_string());
            }
            _ => {}
        }
        let _span = self.span.clone().entered();
        match self.session.create_operation(command, &mut self.cx) {
            Ok(mut op) => {
                let meta = op.meta_mut();
                meta.top_level = true;
                meta.command = id;
                self.push(op);
                self.send_next();
            }
            Err(reply) => {
                if reply.has(ReplyFlags::NOTSUPPORTED) {
                    self.cx.log.error("Command not supported by this protocol");
                }
                self.finish(id, reply);
            }
        }
    }

    fn dispatch(&mut self, event: ControlEvent) {
        let _span = self.span.clone().entered();
        match event {
            ControlEvent::LockGranted(id) => {
                let granted = self
                    .stack
                    .last()
                    .and_then(|op| op.meta().lock.as_ref())
                    .is_some_and(|lock| lock.id() == id);
                if granted {
                    self.cx.layers.clock.touch();
                    self.send_next();
                }
            }
            ControlEvent::AsyncReply(request) => self.on_async_reply(request),
            ControlEvent::Timer => self.on_timer(),
            ControlEvent::Resume => self.send_next(),
            event => {
                let mut action = self.session.handle_event(event, &mut self.cx);
                while let Some(a) = action {
                    self.run_action(a);
                    action = self.session.next_action(&mut self.cx);
                }
            }
        }
    }

    fn cancel(&mut self) {
        let _span = self.span.clone().entered();
        let Some(bottom) = self.stack.first() else {
            return;
        };
        let mut reply = Reply::ERROR | ReplyFlags::CANCELED;
        if bottom.meta().command == CommandId::Connect {
            reply |= ReplyFlags::DISCONNECTED;
        }
        self.abort(reply);
    }

    fn is_connected(&self) -> bool {
        self.session.is_connected()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    use ferry_common::{Options, Server, ServerPath, Site};

    use super::*;
    use crate::lock_manager::LockReason;
    use crate::operation::OpMeta;

    #[derive(Default)]
    struct Sink(StdMutex<Vec<Notification>>);

    impl NotificationSink for Sink {
        fn post(&self, notification: Notification) {
            self.0.lock().unwrap().push(notification);
        }
    }

    impl Sink {
        fn finished(&self) -> Vec<(CommandId, Reply)> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .filter_map(|n| match n {
                    Notification::OperationFinished { command, reply } => Some((*command, *reply)),
                    _ => None,
                })
                .collect()
        }
    }

    /// Records every call so tests can check the order of steps.
    #[derive(Default)]
    struct Fake {
        connected: bool,
        trace: Vec<String>,
        responses: VecDeque<u32>,
        response: Option<u32>,
    }

    struct Connect {
        meta: OpMeta,
    }

    impl Operation<Fake> for Connect {
        fn meta(&self) -> &OpMeta {
            &self.meta
        }
        fn meta_mut(&mut self) -> &mut OpMeta {
            &mut self.meta
        }
        fn send(&mut self, session: &mut Fake, _cx: &mut OpContext<Fake>) -> Reply {
            session.connected = true;
            Reply::OK
        }
    }

    /// Pushes a child in state 1, then waits for a response in state 2.
    struct Parent {
        meta: OpMeta,
        state: u32,
    }

    impl Operation<Fake> for Parent {
        fn meta(&self) -> &OpMeta {
            &self.meta
        }
        fn meta_mut(&mut self) -> &mut OpMeta {
            &mut self.meta
        }
        fn send(&mut self, session: &mut Fake, cx: &mut OpContext<Fake>) -> Reply {
            session.trace.push(format!("parent send {}", self.state));
            match self.state {
                0 => {
                    self.state = 1;
                    Reply::CONTINUE
                }
                1 => {
                    cx.push(Box::new(Child {
                        meta: OpMeta::new("child", CommandId::Private1),
                    }));
                    Reply::CONTINUE
                }
                _ => Reply::WOULDBLOCK,
            }
        }
        fn parse_response(&mut self, session: &mut Fake, _cx: &mut OpContext<Fake>) -> Reply {
            session.trace.push(format!("parent response {}", self.state));
            match session.response.take() {
                Some(200) => Reply::OK,
                _ => Reply::ERROR,
            }
        }
        fn subcommand_result(
            &mut self,
            result: Reply,
            child: &dyn Operation<Fake>,
            session: &mut Fake,
            _cx: &mut OpContext<Fake>,
        ) -> Reply {
            session.trace.push(format!(
                "parent sees {} {result} in state {}",
                child.meta().name,
                self.state
            ));
            assert!(child.downcast_ref::<Child>().is_some());
            self.state = 2;
            if result.is_ok() {
                Reply::WOULDBLOCK
            } else {
                result
            }
        }
    }

    struct Child {
        meta: OpMeta,
    }

    impl Operation<Fake> for Child {
        fn meta(&self) -> &OpMeta {
            &self.meta
        }
        fn meta_mut(&mut self) -> &mut OpMeta {
            &mut self.meta
        }
        fn send(&mut self, session: &mut Fake, _cx: &mut OpContext<Fake>) -> Reply {
            session.trace.push("child send".into());
            Reply::WOULDBLOCK
        }
        fn parse_response(&mut self, session: &mut Fake, _cx: &mut OpContext<Fake>) -> Reply {
            session.trace.push("child response".into());
            match session.response.take() {
                Some(code) if code < 400 => Reply::OK,
                _ => Reply::ERROR,
            }
        }
    }

    /// Waits for a lock on `/dir` before finishing.
    struct Locking {
        meta: OpMeta,
    }

    impl Operation<Fake> for Locking {
        fn meta(&self) -> &OpMeta {
            &self.meta
        }
        fn meta_mut(&mut self) -> &mut OpMeta {
            &mut self.meta
        }
        fn send(&mut self, _session: &mut Fake, cx: &mut OpContext<Fake>) -> Reply {
            let path = ServerPath::parse("/dir").unwrap();
            if !cx.try_lock(&mut self.meta, LockReason::List, &path, false) {
                return Reply::WOULDBLOCK;
            }
            Reply::OK
        }
    }

    impl ProtocolSession for Fake {
        fn create_operation(
            &mut self,
            command: Command,
            _cx: &mut OpContext<Self>,
        ) -> Result<Box<dyn Operation<Self>>, Reply> {
            match command {
                Command::Connect { .. } => Ok(Box::new(Connect {
                    meta: OpMeta::new("connect", CommandId::Connect),
                })),
                Command::RawCommand(_) => Ok(Box::new(Parent {
                    meta: OpMeta::new("parent", CommandId::RawCommand),
                    state: 0,
                })),
                Command::List(_) => Ok(Box::new(Locking {
                    meta: OpMeta::new("list", CommandId::List),
                })),
                _ => Err(Reply::error(ReplyFlags::NOTSUPPORTED)),
            }
        }

        fn handle_event(
            &mut self,
            event: ControlEvent,
            cx: &mut OpContext<Self>,
        ) -> Option<SessionAction> {
            match event {
                ControlEvent::Socket {
                    event: SocketEvent::Closed(_),
                    ..
                } => Some(SessionAction::Disconnected(Reply::ERROR)),
                _ => self.next_action(cx),
            }
        }

        fn next_action(&mut self, _cx: &mut OpContext<Self>) -> Option<SessionAction> {
            self.response = self.responses.pop_front();
            self.response.map(|_| SessionAction::ParseResponse)
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn close(&mut self, _cx: &mut OpContext<Self>) {
            self.connected = false;
        }
    }

    fn socket(engine: EngineContext) -> (ControlSocket<Fake>, Arc<Sink>, Arc<EngineState>) {
        let sink = Arc::new(Sink::default());
        let state = Arc::new(EngineState::default());
        let (events, _rx) = mpsc::unbounded_channel();
        let socket = ControlSocket::new(
            Fake::default(),
            SocketSetup {
                engine,
                sink: sink.clone(),
                state: state.clone(),
                status: TransferStatusManager::new(None),
                events,
            },
        );
        (socket, sink, state)
    }

    fn connect(socket: &mut ControlSocket<Fake>, state: &EngineState) {
        let command = Command::Connect {
            site: Site {
                server: Server::new(Protocol::Ftp, "example.com", 21),
                credentials: Default::default(),
                remote_path: None,
            },
            retry_connecting: false,
        };
        assert!(state.begin(&command).would_block());
        socket.execute(command);
        assert!(state.is_connected());
    }

    fn data() -> ControlEvent {
        ControlEvent::Socket {
            conn: 1,
            event: SocketEvent::Data(bytes::Bytes::new()),
        }
    }

    #[tokio::test]
    async fn sub_operation_resolves_before_parent_resumes() {
        let engine = EngineContext::new(Arc::new(Options::new()), None).unwrap();
        let (mut socket, sink, state) = socket(engine);
        connect(&mut socket, &state);

        let command = Command::RawCommand("X".into());
        assert!(state.begin(&command).would_block());
        assert!(state.begin(&command).has(ReplyFlags::BUSY));
        socket.execute(command);
        assert_eq!(socket.depth(), 2);

        socket.session.responses.push_back(250);
        socket.dispatch(data());
        assert_eq!(socket.depth(), 1);
        socket.session.responses.push_back(200);
        socket.dispatch(data());
        assert_eq!(socket.depth(), 0);

        assert_eq!(
            socket.session.trace,
            vec![
                "parent send 0",
                "parent send 1",
                "child send",
                "child response",
                "parent sees child OK in state 1",
                "parent response 2",
            ]
        );
        assert_eq!(
            sink.finished(),
            vec![
                (CommandId::Connect, Reply::OK),
                (CommandId::RawCommand, Reply::OK)
            ]
        );
        assert_eq!(state.current(), None);
    }

    #[tokio::test]
    async fn child_error_propagates_to_parent() {
        let engine = EngineContext::new(Arc::new(Options::new()), None).unwrap();
        let (mut socket, sink, state) = socket(engine);
        connect(&mut socket, &state);
        let command = Command::RawCommand("X".into());
        state.begin(&command);
        socket.execute(command);
        socket.session.responses.push_back(550);
        socket.dispatch(data());
        assert_eq!(socket.depth(), 0);
        assert_eq!(sink.finished().last(), Some(&(CommandId::RawCommand, Reply::ERROR)));
        assert!(state.is_connected());
    }

    #[tokio::test]
    async fn disconnect_unwinds_everything() {
        let engine = EngineContext::new(Arc::new(Options::new()), None).unwrap();
        let (mut socket, sink, state) = socket(engine);
        connect(&mut socket, &state);
        let command = Command::RawCommand("X".into());
        state.begin(&command);
        socket.execute(command);
        socket.dispatch(ControlEvent::Socket {
            conn: 1,
            event: SocketEvent::Closed(None),
        });
        assert_eq!(socket.depth(), 0);
        let (_, reply) = *sink.finished().last().unwrap();
        assert!(reply.is_error() && reply.has(ReplyFlags::DISCONNECTED));
        assert!(!state.is_connected());
        assert!(state
            .begin(&Command::RawCommand("X".into()))
            .has(ReplyFlags::NOTCONNECTED));
    }

    #[tokio::test]
    async fn cancel_while_waiting_for_lock_releases_it() {
        let engine = EngineContext::new(Arc::new(Options::new()), None).unwrap();
        let (mut second, sink, second_state) = socket(engine.clone());
        connect(&mut second, &second_state);

        // A conflicting lock held by another owner
        let server = Server::new(Protocol::Ftp, "example.com", 21).key();
        let noop: crate::lock_manager::LockWaker = Arc::new(|_| {});
        let held = engine.lock_manager.lock(
            0,
            &noop,
            server,
            LockReason::List,
            ServerPath::parse("/dir").unwrap(),
            false,
        );

        let list = Command::List(ferry_common::ListCommand::current());
        second_state.begin(&list);
        second.execute(list);
        assert_eq!(second.depth(), 1);
        assert_eq!(engine.lock_manager.lock_count(), 2);

        second.cancel();
        assert_eq!(second.depth(), 0);
        assert_eq!(engine.lock_manager.lock_count(), 1);
        let (command, reply) = *sink.finished().last().unwrap();
        assert_eq!(command, CommandId::List);
        assert!(reply.is_error() && reply.has(ReplyFlags::CANCELED));
        assert!(!reply.has(ReplyFlags::DISCONNECTED));
        drop(held);
        assert_eq!(engine.lock_manager.lock_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timer_fails_the_operation() {
        let options = Arc::new(Options::new());
        options.set_int(OptionId::Timeout, 5).unwrap();
        let engine = EngineContext::new(options, None).unwrap();
        let (mut socket, sink, state) = socket(engine);
        connect(&mut socket, &state);
        let command = Command::RawCommand("X".into());
        state.begin(&command);
        socket.execute(command);

        tokio::time::advance(Duration::from_secs(3)).await;
        socket.dispatch(ControlEvent::Timer);
        assert_eq!(socket.depth(), 2);
        tokio::time::advance(Duration::from_secs(3)).await;
        socket.dispatch(ControlEvent::Timer);
        assert_eq!(socket.depth(), 0);
        let (_, reply) = *sink.finished().last().unwrap();
        assert!(reply.has(ReplyFlags::TIMEOUT));
        assert!(!state.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn sleeping_operations_do_not_time_out() {
        let options = Arc::new(Options::new());
        options.set_int(OptionId::Timeout, 5).unwrap();
        let engine = EngineContext::new(options, None).unwrap();
        let (mut socket, sink, state) = socket(engine);
        connect(&mut socket, &state);
        let command = Command::RawCommand("X".into());
        state.begin(&command);
        socket.execute(command);
        socket.stack.last_mut().unwrap().meta_mut().sleeping = true;

        tokio::time::advance(Duration::from_secs(20)).await;
        socket.dispatch(ControlEvent::Timer);
        assert_eq!(socket.depth(), 2);
        assert_eq!(sink.finished().len(), 1);

        socket.stack.last_mut().unwrap().meta_mut().sleeping = false;
        socket.dispatch(ControlEvent::Timer);
        assert_eq!(socket.depth(), 0);
        let (_, reply) = *sink.finished().last().unwrap();
        assert!(reply.has(ReplyFlags::TIMEOUT));
    }

    #[tokio::test]
    async fn unsupported_commands_finish_immediately() {
        let engine = EngineContext::new(Arc::new(Options::new()), None).unwrap();
        let (mut socket, sink, state) = socket(engine);
        connect(&mut socket, &state);
        let command = Command::Mkdir {
            path: ServerPath::parse("/a").unwrap(),
        };
        state.begin(&command);
        socket.execute(command);
        let (command, reply) = *sink.finished().last().unwrap();
        assert_eq!(command, CommandId::Mkdir);
        assert!(reply.has(ReplyFlags::NOTSUPPORTED));
        assert_eq!(state.current(), None);
    }
}
