use std::sync::Arc;

use anyhow::{bail, Context, Result};
use console::Term;
use ferry_common::{
    Command, CommandId, LogonType, MessageType, Notification, Options, Reply, ReplyFlags, Secret,
    ServerKey, ServerPath, Site, TransferStatus,
};
use ferry_core::{Engine, EngineContext};
use tracing::*;

use crate::prompt::Prompter;
use crate::protocols::AllProtocols;

/// What a finished command left behind besides its reply.
#[derive(Debug)]
pub struct Outcome {
    pub reply: Reply,
    /// Path of the primary listing the command produced
    pub listing: Option<ServerPath>,
    /// Server responses, in order
    pub responses: Vec<String>,
}

impl Outcome {
    pub fn check(self, what: &str) -> Result<Self> {
        if self.reply.is_ok() {
            return Ok(self);
        }
        bail!("{what} failed: {}", self.reply)
    }
}

/// Runs commands one at a time against a single site.
pub struct Client {
    engine: Engine,
    context: EngineContext,
    site: Site,
    server_key: ServerKey,
    prompter: Box<dyn Prompter>,
    progress: Option<Term>,
}

impl Client {
    pub fn new(options: Options, mut site: Site, prompter: Box<dyn Prompter>) -> Result<Self> {
        if site.credentials.logon_type == LogonType::Ask
            && site.credentials.password.expose_secret().is_empty()
        {
            let prompt = format!("Password for {}@{}", site.server.user, site.server.host);
            if let Some(password) = prompter.password(&prompt)? {
                site.credentials.logon_type = LogonType::Normal;
                site.credentials.password = Secret::new(password);
            }
        }

        let context = EngineContext::new(Arc::new(options), None)
            .context("Could not set up the engine")?;
        let engine = Engine::spawn(context.clone(), Arc::new(AllProtocols));
        let server_key = site.server.key();
        Ok(Self {
            engine,
            context,
            site,
            server_key,
            prompter,
            progress: console::user_attended_stderr().then(Term::stderr),
        })
    }

    pub fn site(&self) -> &Site {
        &self.site
    }

    pub fn context(&self) -> &EngineContext {
        &self.context
    }

    /// Identity the directory cache knows the server by.
    pub fn server_key(&self) -> &ServerKey {
        &self.server_key
    }

    pub async fn connect(&mut self) -> Result<()> {
        info!(server = %self.site.server, "Connecting");
        self.execute(Command::Connect {
            site: self.site.clone(),
            retry_connecting: true,
        })
        .await?
        .check("Connecting")?;
        Ok(())
    }

    pub async fn disconnect(&mut self) -> Result<()> {
        self.execute(Command::Disconnect).await?;
        Ok(())
    }

    /// Runs `command`, reconnecting and retrying once if the connection
    /// was lost underneath it.
    pub async fn run(&mut self, command: Command) -> Result<Outcome> {
        let outcome = self.execute(command.clone()).await?;
        if !should_retry(command.id(), outcome.reply) {
            return Ok(outcome);
        }
        warn!(command = %command.id(), "Connection lost, reconnecting");
        self.connect().await?;
        self.execute(command).await
    }

    async fn execute(&mut self, command: Command) -> Result<Outcome> {
        let id = command.id();
        debug!(command = %id, "Executing");
        let reply = self.engine.execute(command);
        if !reply.would_block() {
            return Ok(Outcome {
                reply,
                listing: None,
                responses: vec![],
            });
        }
        self.wait(id).await
    }

    async fn wait(&mut self, id: CommandId) -> Result<Outcome> {
        let mut listing = None;
        let mut responses = vec![];
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let mut canceled = false;

        loop {
            while let Some(notification) = self.engine.next_notification() {
                match notification {
                    Notification::OperationFinished { command, reply } if command == id => {
                        self.clear_progress();
                        return Ok(Outcome {
                            reply,
                            listing,
                            responses,
                        });
                    }
                    Notification::OperationFinished { command, .. } => {
                        debug!(%command, "Stray completion");
                    }
                    Notification::LogMessage(message) => {
                        if message.kind == MessageType::Response {
                            responses.push(message.text);
                        }
                    }
                    Notification::TransferStatus(status) => match status {
                        Some(status) => self.show_progress(&status),
                        None => self.clear_progress(),
                    },
                    Notification::DirectoryListing {
                        path,
                        primary,
                        failed,
                    } => {
                        if primary && !failed {
                            listing = Some(path);
                        }
                    }
                    Notification::AsyncRequest(request) => {
                        self.clear_progress();
                        let reply = match self.prompter.answer(&request.kind) {
                            Ok(reply) => reply,
                            Err(error) => {
                                error!(%error, "Could not answer the server");
                                self.engine.cancel();
                                continue;
                            }
                        };
                        if !self.engine.set_async_request_reply(request.answer(reply)) {
                            warn!("The engine went away before the answer arrived");
                        }
                    }
                    Notification::Encryption(details) => {
                        info!(
                            protocol = %details.protocol,
                            cipher = %details.cipher,
                            resumed = details.session_resumed,
                            "Connection is encrypted"
                        );
                    }
                    Notification::ServerChanged(server) => {
                        info!(%server, "Server changed");
                        self.server_key = server.key();
                    }
                    Notification::LocalDirCreated(path) => {
                        debug!(path = %path.display(), "Created local directory");
                    }
                }
            }

            tokio::select! {
                _ = self.engine.notified() => {}
                result = &mut ctrl_c, if !canceled => {
                    result.context("Could not listen for Ctrl-C")?;
                    warn!("Cancelling");
                    self.engine.cancel();
                    canceled = true;
                }
            }
        }
    }

    fn show_progress(&self, status: &TransferStatus) {
        let (Some(term), Some(line)) = (&self.progress, progress_line(status)) else {
            return;
        };
        let _ = term.clear_line();
        let _ = term.write_str(&line);
    }

    fn clear_progress(&self) {
        if let Some(term) = &self.progress {
            let _ = term.clear_line();
        }
    }
}

/// A lost connection gets one more try, unless the user gave up or the
/// login itself is what failed.
pub fn should_retry(command: CommandId, reply: Reply) -> bool {
    command != CommandId::Connect
        && command != CommandId::Disconnect
        && reply.is_error()
        && reply.has(ReplyFlags::DISCONNECTED)
        && !reply.has(ReplyFlags::CANCELED)
        && !reply.has(ReplyFlags::PASSWORDFAILED)
}

fn progress_line(status: &TransferStatus) -> Option<String> {
    if status.is_empty() || status.list {
        return None;
    }
    let done = status.current_offset;
    Some(if status.total_size > 0 {
        format!(
            "{done} / {} bytes ({}%)",
            status.total_size,
            done.saturating_mul(100) / status.total_size
        )
    } else {
        format!("{done} bytes")
    })
}
