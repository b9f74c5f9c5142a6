//! The facade a caller drives: commands in, notifications out.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ferry_common::{
    AsyncRequest, Command, Notification, NotificationSink, Reply, ReplyFlags, TransferStatus,
    TransferStatusManager,
};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::context::EngineContext;
use crate::control_socket::{
    ControlEvent, ControlSocketDriver, ControlSocketFactory, EngineState, SocketSetup,
};

/// Notifications waiting for the caller. A wake-up is signalled for every
/// post; the caller drains the queue after each.
#[derive(Default)]
pub struct NotificationQueue {
    queue: Mutex<VecDeque<Notification>>,
    notify: Notify,
}

impl NotificationQueue {
    pub fn pop(&self) -> Option<Notification> {
        #[allow(clippy::unwrap_used, reason = "panic on poison")]
        self.queue.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        #[allow(clippy::unwrap_used, reason = "panic on poison")]
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn notified(&self) {
        self.notify.notified().await
    }
}

impl NotificationSink for NotificationQueue {
    fn post(&self, notification: Notification) {
        {
            #[allow(clippy::unwrap_used, reason = "panic on poison")]
            self.queue.lock().unwrap().push_back(notification);
        }
        self.notify.notify_one();
    }
}

enum EngineCommand {
    Execute(Command),
    Cancel,
    AsyncReply(AsyncRequest),
}

/// One connection's worth of engine. All control socket code runs on a
/// single task; the methods here only queue work for it.
pub struct Engine {
    tx: mpsc::UnboundedSender<EngineCommand>,
    queue: Arc<NotificationQueue>,
    state: Arc<EngineState>,
    status: TransferStatusManager,
    factory: Arc<dyn ControlSocketFactory>,
    task: JoinHandle<()>,
    limiter_watch: JoinHandle<()>,
}

impl Engine {
    pub fn spawn(context: EngineContext, factory: Arc<dyn ControlSocketFactory>) -> Self {
        let queue = Arc::new(NotificationQueue::default());
        let state = Arc::new(EngineState::default());
        let status = TransferStatusManager::new(Some(queue.clone()));
        let (tx, rx) = mpsc::unbounded_channel();
        let limiter_watch = context.rate_limiters.watch();

        let event_loop = EventLoop {
            context,
            factory: factory.clone(),
            sink: queue.clone(),
            state: state.clone(),
            status: status.clone(),
            socket: None,
        };
        let task = tokio::spawn(event_loop.run(rx));
        Self {
            tx,
            queue,
            state,
            status,
            factory,
            task,
            limiter_watch,
        }
    }

    /// `WOULDBLOCK` once the command is under way; its
    /// [Notification::OperationFinished] follows. Anything else is the
    /// final answer.
    pub fn execute(&self, command: Command) -> Reply {
        if !command.is_valid() {
            return Reply::error(ReplyFlags::SYNTAXERROR);
        }
        if let Command::Connect { site, .. } = &command {
            if !self.factory.supports(site.server.protocol) {
                return Reply::error(ReplyFlags::NOTSUPPORTED);
            }
        }
        let reply = self.state.begin(&command);
        if !reply.would_block() {
            return reply;
        }
        if self.tx.send(EngineCommand::Execute(command)).is_err() {
            self.state.finish(false);
            return Reply::error(ReplyFlags::INTERNALERROR);
        }
        reply
    }

    pub fn next_notification(&self) -> Option<Notification> {
        self.queue.pop()
    }

    /// Resolves once notifications may be waiting.
    pub async fn notified(&self) {
        self.queue.notified().await
    }

    /// Hands back an [Notification::AsyncRequest] with its reply filled in.
    pub fn set_async_request_reply(&self, request: AsyncRequest) -> bool {
        if request.reply.is_none() {
            return false;
        }
        self.tx.send(EngineCommand::AsyncReply(request)).is_ok()
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(EngineCommand::Cancel);
    }

    /// The status of the running transfer and whether it changed since
    /// the last call.
    pub fn transfer_status(&self) -> (TransferStatus, bool) {
        self.status.get()
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    pub fn is_busy(&self) -> bool {
        self.state.current().is_some()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.task.abort();
        self.limiter_watch.abort();
    }
}

struct EventLoop {
    context: EngineContext,
    factory: Arc<dyn ControlSocketFactory>,
    sink: Arc<NotificationQueue>,
    state: Arc<EngineState>,
    status: TransferStatusManager,
    socket: Option<(
        Box<dyn ControlSocketDriver>,
        mpsc::UnboundedReceiver<ControlEvent>,
    )>,
}

impl EventLoop {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<EngineCommand>) {
        let mut timer = tokio::time::interval(Duration::from_secs(1));
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = next_event(&mut self.socket) => {
                    if let Some((socket, _)) = &mut self.socket {
                        socket.dispatch(event);
                    }
                }
                _ = timer.tick() => {
                    self.status.flush();
                    if let Some((socket, _)) = &mut self.socket {
                        socket.dispatch(ControlEvent::Timer);
                    }
                }
            }
        }
        debug!("Engine event loop finished");
    }

    fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Execute(command) => {
                if let Command::Connect { site, .. } = &command {
                    let reuse = self
                        .socket
                        .as_ref()
                        .is_some_and(|(s, _)| s.protocol() == Some(site.server.protocol));
                    if !reuse {
                        self.socket = Some(self.create_socket(site.server.protocol));
                    }
                }
                match &mut self.socket {
                    Some((socket, _)) => socket.execute(command),
                    None => {
                        warn!("Command without a control socket");
                        self.state.finish(false);
                        self.sink.post(Notification::OperationFinished {
                            command: command.id(),
                            reply: Reply::error(ReplyFlags::NOTCONNECTED),
                        });
                    }
                }
            }
            EngineCommand::Cancel => {
                if let Some((socket, _)) = &mut self.socket {
                    socket.cancel();
                }
            }
            EngineCommand::AsyncReply(request) => {
                if let Some((socket, _)) = &mut self.socket {
                    socket.dispatch(ControlEvent::AsyncReply(request));
                }
            }
        }
    }

    fn create_socket(
        &self,
        protocol: ferry_common::Protocol,
    ) -> (
        Box<dyn ControlSocketDriver>,
        mpsc::UnboundedReceiver<ControlEvent>,
    ) {
        let (events, rx) = mpsc::unbounded_channel();
        let socket = self.factory.create(
            protocol,
            SocketSetup {
                engine: self.context.clone(),
                sink: self.sink.clone(),
                state: self.state.clone(),
                status: self.status.clone(),
                events,
            },
        );
        (socket, rx)
    }
}

async fn next_event(
    socket: &mut Option<(
        Box<dyn ControlSocketDriver>,
        mpsc::UnboundedReceiver<ControlEvent>,
    )>,
) -> Option<ControlEvent> {
    match socket {
        Some((_, rx)) => rx.recv().await,
        None => std::future::pending().await,
    }
}
