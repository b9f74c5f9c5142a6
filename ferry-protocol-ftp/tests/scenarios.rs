use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ferry_common::{
    AsyncReply, AsyncRequestKind, Command, CommandId, Credentials, DirEntry, DirectoryListing,
    FileExistsAction, FileTransferCommand, InsecureReason, ListCommand, LocalEndpoint, MemoryFile,
    Notification, Options, Protocol, Reply, ReplyFlags, Server, ServerPath, Site,
};
use ferry_core::capabilities::{Capability, CapabilityState};
use ferry_core::lock_manager::{LockReason, LockWaker};
use ferry_core::{Engine, EngineContext};
use ferry_protocol_ftp::FtpFactory;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

/// What the fake server announces and serves.
#[derive(Clone, Default)]
struct Script {
    features: Vec<&'static str>,
    /// `LIST` output for every directory
    listing: String,
}

#[derive(Clone, Default)]
struct Recorded {
    commands: Arc<Mutex<Vec<String>>>,
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl Recorded {
    fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    fn verbs(&self) -> Vec<String> {
        self.commands()
            .iter()
            .map(|c| c.split(' ').next().unwrap_or_default().to_owned())
            .collect()
    }
}

async fn reply(stream: &mut (impl AsyncWriteExt + Unpin), text: &str) {
    stream.write_all(text.as_bytes()).await.unwrap();
    stream.write_all(b"\r\n").await.unwrap();
}

async fn serve(listener: TcpListener, script: Script, recorded: Recorded) {
    let Ok((stream, _)) = listener.accept().await else {
        return;
    };
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    let mut cwd = "/".to_owned();
    let mut data: Option<TcpListener> = None;
    let mut rest = 0usize;

    reply(&mut write, "220 fake server ready").await;
    while let Ok(Some(line)) = lines.next_line().await {
        recorded.commands.lock().unwrap().push(line.clone());
        let (verb, arg) = line.split_once(' ').unwrap_or((line.as_str(), ""));
        match verb.to_ascii_uppercase().as_str() {
            "AUTH" => reply(&mut write, "502 Not here").await,
            "USER" => reply(&mut write, "331 Password required").await,
            "PASS" => reply(&mut write, "230 Logged in").await,
            "FEAT" => {
                let mut text = "211-Features:\r\n".to_owned();
                for feature in &script.features {
                    text.push_str(&format!(" {feature}\r\n"));
                }
                text.push_str("211 End");
                reply(&mut write, &text).await;
            }
            "PWD" => reply(&mut write, &format!("257 \"{cwd}\" is current")).await,
            "CWD" => {
                cwd = if arg.starts_with('/') {
                    arg.to_owned()
                } else {
                    format!("{}/{arg}", cwd.trim_end_matches('/'))
                };
                reply(&mut write, "250 OK").await;
            }
            "TYPE" | "CLNT" | "OPTS" => reply(&mut write, "200 OK").await,
            "REST" => {
                rest = arg.parse().unwrap_or(0);
                reply(&mut write, "350 Restarting").await;
            }
            "PASV" => {
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let port = listener.local_addr().unwrap().port();
                data = Some(listener);
                let text = format!(
                    "227 Entering Passive Mode (127,0,0,1,{},{})",
                    port >> 8,
                    port & 0xff
                );
                reply(&mut write, &text).await;
            }
            "LIST" | "MLSD" | "RETR" | "STOR" | "APPE" => {
                let Some(listener) = data.take() else {
                    reply(&mut write, "425 Use PASV first").await;
                    continue;
                };
                reply(&mut write, "150 Opening data connection").await;
                let (mut conn, _) = listener.accept().await.unwrap();
                let name = arg.rsplit(' ').next().unwrap_or_default().to_owned();
                let offset = std::mem::take(&mut rest);
                match verb {
                    "LIST" | "MLSD" => conn.write_all(script.listing.as_bytes()).await.unwrap(),
                    "RETR" => {
                        let contents = recorded
                            .files
                            .lock()
                            .unwrap()
                            .get(&name)
                            .cloned()
                            .unwrap_or_default();
                        // Offsets past the end wrap to the start, like a
                        // server with 32-bit file offsets
                        let start = if offset <= contents.len() { offset } else { 0 };
                        conn.write_all(&contents[start..]).await.unwrap();
                    }
                    _ => {
                        let mut received = vec![];
                        conn.read_to_end(&mut received).await.unwrap();
                        let mut files = recorded.files.lock().unwrap();
                        let file = files.entry(name).or_default();
                        match verb {
                            "APPE" => {}
                            _ => file.truncate(offset),
                        }
                        file.extend_from_slice(&received);
                    }
                }
                drop(conn);
                reply(&mut write, "226 Transfer complete").await;
            }
            "QUIT" => {
                reply(&mut write, "221 Bye").await;
                break;
            }
            _ => reply(&mut write, "502 Command not implemented").await,
        }
    }
}

async fn fake_server(script: Script) -> (u16, Recorded) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let recorded = Recorded::default();
    tokio::spawn(serve(listener, script, recorded.clone()));
    (port, recorded)
}

fn site(protocol: Protocol, port: u16) -> Site {
    Site {
        server: Server::new(protocol, "127.0.0.1", port).with_user("user"),
        credentials: Credentials::password("secret"),
        remote_path: None,
    }
}

fn connect_command(protocol: Protocol, port: u16) -> Command {
    Command::Connect {
        site: site(protocol, port),
        retry_connecting: false,
    }
}

fn dir() -> ServerPath {
    ServerPath::parse("/dir").unwrap()
}

async fn finished(engine: &Engine) -> (CommandId, Reply) {
    let wait = async {
        loop {
            while let Some(notification) = engine.next_notification() {
                if let Notification::OperationFinished { command, reply } = notification {
                    return (command, reply);
                }
            }
            engine.notified().await;
        }
    };
    tokio::time::timeout(Duration::from_secs(10), wait)
        .await
        .unwrap()
}

async fn connected(script: Script) -> (Engine, EngineContext, u16, Recorded) {
    let (port, recorded) = fake_server(script).await;
    let context = EngineContext::new(Arc::new(Options::new()), None).unwrap();
    let engine = Engine::spawn(context.clone(), Arc::new(FtpFactory));
    assert!(engine
        .execute(connect_command(Protocol::InsecureFtp, port))
        .would_block());
    assert_eq!(finished(&engine).await, (CommandId::Connect, Reply::OK));
    (engine, context, port, recorded)
}

#[tokio::test]
async fn login_sequence() {
    let script = Script {
        features: vec!["UTF8", "SIZE"],
        ..Default::default()
    };
    let (engine, _, _, recorded) = connected(script).await;
    assert!(engine.is_connected());
    assert_eq!(
        recorded.commands(),
        vec!["USER user", "PASS secret", "FEAT", "OPTS UTF8 ON"]
    );
}

#[tokio::test]
async fn download_with_cached_size_skips_size_and_mdtm() {
    let script = Script {
        features: vec!["SIZE", "MDTM"],
        ..Default::default()
    };
    let (engine, context, port, recorded) = connected(script).await;
    recorded
        .files
        .lock()
        .unwrap()
        .insert("a.txt".into(), b"0123456789".to_vec());

    let key = site(Protocol::InsecureFtp, port).server.key();
    context.directory_cache.store(
        &key,
        DirectoryListing::new(dir(), vec![DirEntry::file("a.txt", 10)]),
    );

    let target = MemoryFile::new();
    let command = FileTransferCommand::download(dir(), "a.txt", LocalEndpoint::Memory(target.clone()));
    assert!(engine.execute(Command::FileTransfer(command)).would_block());
    assert_eq!(finished(&engine).await, (CommandId::FileTransfer, Reply::OK));

    assert_eq!(&target.contents()[..], b"0123456789");
    let verbs = recorded.verbs();
    assert!(verbs.contains(&"RETR".to_owned()));
    assert!(!verbs.contains(&"SIZE".to_owned()));
    assert!(!verbs.contains(&"MDTM".to_owned()));
}

#[tokio::test]
async fn resumed_upload_from_zero_uses_stor() {
    let script = Script {
        features: vec!["REST STREAM", "SIZE"],
        listing: "-rw-r--r--   1 user  group         0 Jan 01  2024 up.txt\r\n".into(),
        ..Default::default()
    };
    let (engine, _, _, recorded) = connected(script).await;

    let source = MemoryFile::from_bytes(b"hello");
    let mut command = FileTransferCommand::upload(LocalEndpoint::Memory(source), dir(), "up.txt");
    command.settings.on_exists = Some(FileExistsAction::Resume);
    assert!(engine.execute(Command::FileTransfer(command)).would_block());
    assert_eq!(finished(&engine).await, (CommandId::FileTransfer, Reply::OK));

    let verbs = recorded.verbs();
    assert!(verbs.contains(&"LIST".to_owned()));
    assert!(verbs.contains(&"STOR".to_owned()));
    assert!(!verbs.contains(&"APPE".to_owned()));
    assert!(!verbs.contains(&"REST".to_owned()));
    assert_eq!(
        recorded.files.lock().unwrap().get("up.txt").map(Vec::as_slice),
        Some(&b"hello"[..])
    );
}

/// Caches `file` with `size` bytes in [dir] and resumes a download of it
/// into `local`.
async fn resume_download(
    engine: &Engine,
    context: &EngineContext,
    port: u16,
    file: &str,
    size: i64,
    local: &MemoryFile,
) -> Reply {
    let key = site(Protocol::InsecureFtp, port).server.key();
    context.directory_cache.store(
        &key,
        DirectoryListing::new(dir(), vec![DirEntry::file(file, size)]),
    );
    let mut command =
        FileTransferCommand::download(dir(), file, LocalEndpoint::Memory(local.clone()));
    command.settings.on_exists = Some(FileExistsAction::Resume);
    assert!(engine.execute(Command::FileTransfer(command)).would_block());
    let (command, reply) = finished(engine).await;
    assert_eq!(command, CommandId::FileTransfer);
    reply
}

#[tokio::test]
async fn resuming_a_complete_download_moves_nothing() {
    let (engine, context, port, recorded) = connected(Script::default()).await;
    recorded
        .files
        .lock()
        .unwrap()
        .insert("a.txt".into(), b"0123456789".to_vec());

    let local = MemoryFile::from_bytes(b"0123456789");
    let reply = resume_download(&engine, &context, port, "a.txt", 10, &local).await;
    assert_eq!(reply, Reply::OK);
    assert_eq!(&local.contents()[..], b"0123456789");
    let verbs = recorded.verbs();
    assert!(!verbs.contains(&"REST".to_owned()));
    assert!(!verbs.contains(&"RETR".to_owned()));
}

#[tokio::test]
async fn resumed_download_sends_rest_first() {
    let (engine, context, port, recorded) = connected(Script::default()).await;
    recorded
        .files
        .lock()
        .unwrap()
        .insert("a.txt".into(), b"0123456789".to_vec());

    let local = MemoryFile::from_bytes(b"01234");
    let reply = resume_download(&engine, &context, port, "a.txt", 10, &local).await;
    assert_eq!(reply, Reply::OK);
    assert_eq!(&local.contents()[..], b"0123456789");

    let commands = recorded.commands();
    let rest = commands.iter().position(|c| c == "REST 5").unwrap();
    let retr = commands.iter().position(|c| c == "RETR a.txt").unwrap();
    assert!(rest < retr);
    assert!(commands[rest + 1..retr].iter().all(|c| !c.starts_with("REST")));
}

/// Resumes `hello` onto a 2 byte `up.txt`.
async fn resume_upload(features: Vec<&'static str>) -> Recorded {
    let script = Script {
        features,
        listing: "-rw-r--r--   1 user  group         2 Jan 01  2024 up.txt\r\n".into(),
    };
    let (engine, _, _, recorded) = connected(script).await;
    recorded
        .files
        .lock()
        .unwrap()
        .insert("up.txt".into(), b"he".to_vec());

    let source = MemoryFile::from_bytes(b"hello");
    let mut command = FileTransferCommand::upload(LocalEndpoint::Memory(source), dir(), "up.txt");
    command.settings.on_exists = Some(FileExistsAction::Resume);
    assert!(engine.execute(Command::FileTransfer(command)).would_block());
    assert_eq!(finished(&engine).await, (CommandId::FileTransfer, Reply::OK));
    assert_eq!(
        recorded.files.lock().unwrap().get("up.txt").map(Vec::as_slice),
        Some(&b"hello"[..])
    );
    recorded
}

#[tokio::test]
async fn resumed_upload_appends_without_rest_stream() {
    let recorded = resume_upload(vec!["SIZE"]).await;
    let commands = recorded.commands();
    assert!(commands.contains(&"APPE up.txt".to_owned()));
    assert!(!recorded.verbs().contains(&"STOR".to_owned()));
    assert!(!recorded.verbs().contains(&"REST".to_owned()));
}

#[tokio::test]
async fn resumed_upload_uses_rest_with_rest_stream() {
    let recorded = resume_upload(vec!["REST STREAM", "SIZE"]).await;
    let commands = recorded.commands();
    let rest = commands.iter().position(|c| c == "REST 2").unwrap();
    let stor = commands.iter().position(|c| c == "STOR up.txt").unwrap();
    assert!(rest < stor);
    assert!(!recorded.verbs().contains(&"APPE".to_owned()));
}

#[tokio::test]
async fn large_file_resume_bugs_are_remembered() {
    let (engine, context, port, recorded) = connected(Script::default()).await;
    let key = site(Protocol::InsecureFtp, port).server.key();
    for name in ["a.iso", "b.iso", "c.iso"] {
        recorded
            .files
            .lock()
            .unwrap()
            .insert(name.into(), b"whole file".to_vec());
    }
    let retrs = |recorded: &Recorded| {
        recorded
            .verbs()
            .iter()
            .filter(|v| v.as_str() == "RETR")
            .count()
    };

    // The server answers the last byte of a 3 GiB file with all of it
    let local = MemoryFile::from_bytes(b"01234");
    let reply = resume_download(&engine, &context, port, "a.iso", 3 << 30, &local).await;
    assert!(reply.is_error());
    assert!(recorded.commands().contains(&format!("REST {}", (3u64 << 30) - 1)));
    assert_eq!(retrs(&recorded), 1);
    assert_eq!(
        context.capabilities.get(&key, Capability::ResumeBug2Gb),
        CapabilityState::Yes
    );
    assert_eq!(
        context.capabilities.get(&key, Capability::ResumeBug4Gb),
        CapabilityState::Unknown
    );

    // Known now, so no second test
    let local = MemoryFile::from_bytes(b"01234");
    let reply = resume_download(&engine, &context, port, "b.iso", 5 << 29, &local).await;
    assert!(reply.is_error());
    assert_eq!(retrs(&recorded), 1);

    // Beyond 4 GiB is a separate fact
    let local = MemoryFile::from_bytes(b"01234");
    let reply = resume_download(&engine, &context, port, "c.iso", 5 << 30, &local).await;
    assert!(reply.is_error());
    assert_eq!(retrs(&recorded), 2);
    assert_eq!(
        context.capabilities.get(&key, Capability::ResumeBug4Gb),
        CapabilityState::Yes
    );
}

#[tokio::test]
async fn cancel_while_waiting_for_lock() {
    let (engine, context, port, recorded) = connected(Script::default()).await;

    let noop: LockWaker = Arc::new(|_| {});
    let held = context.lock_manager.lock(
        0,
        &noop,
        site(Protocol::InsecureFtp, port).server.key(),
        LockReason::List,
        dir(),
        false,
    );
    assert!(engine
        .execute(Command::List(ListCommand::new(dir())))
        .would_block());
    tokio::time::timeout(Duration::from_secs(10), async {
        while context.lock_manager.lock_count() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    engine.cancel();
    let (command, reply) = finished(&engine).await;
    assert_eq!(command, CommandId::List);
    assert!(reply.is_error() && reply.has(ReplyFlags::CANCELED));
    assert_eq!(context.lock_manager.lock_count(), 1);
    assert!(!recorded.verbs().contains(&"LIST".to_owned()));
    drop(held);
    assert_eq!(context.lock_manager.lock_count(), 0);
}

#[tokio::test]
async fn listing_fills_the_cache() {
    let script = Script {
        listing: concat!(
            "drwxr-xr-x   2 user  group      4096 Mar 03  2023 sub\r\n",
            "-rw-r--r--   1 user  group       123 Mar 03  2023 file.bin\r\n",
        )
        .into(),
        ..Default::default()
    };
    let (engine, context, port, _) = connected(script).await;

    assert!(engine
        .execute(Command::List(ListCommand::new(dir())))
        .would_block());
    assert_eq!(finished(&engine).await, (CommandId::List, Reply::OK));

    let key = site(Protocol::InsecureFtp, port).server.key();
    let listing = context.directory_cache.lookup(&key, &dir()).unwrap();
    assert_eq!(listing.entries.len(), 2);
    let file = context.directory_cache.lookup_file(&key, &dir(), "file.bin");
    assert_eq!(file.entry.map(|e| e.size), Some(123));
}

#[tokio::test]
async fn plain_ftp_fallback_asks_first() {
    let (port, recorded) = fake_server(Script::default()).await;
    let context = EngineContext::new(Arc::new(Options::new()), None).unwrap();
    let engine = Engine::spawn(context, Arc::new(FtpFactory));
    assert!(engine
        .execute(connect_command(Protocol::Ftp, port))
        .would_block());

    let mut changed = None;
    let result = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            while let Some(notification) = engine.next_notification() {
                match notification {
                    Notification::AsyncRequest(request) => {
                        let AsyncRequestKind::InsecureConnection(ref insecure) = request.kind
                        else {
                            panic!("unexpected request {request:?}");
                        };
                        assert_eq!(insecure.reason, InsecureReason::PlainFtp);
                        let answer =
                            request.answer(AsyncReply::InsecureConnection { allow: true });
                        assert!(engine.set_async_request_reply(answer));
                    }
                    Notification::ServerChanged(server) => changed = Some(server),
                    Notification::OperationFinished { command, reply } => {
                        return (command, reply);
                    }
                    _ => {}
                }
            }
            engine.notified().await;
        }
    })
    .await
    .unwrap();

    assert_eq!(result, (CommandId::Connect, Reply::OK));
    assert_eq!(changed.map(|s| s.protocol), Some(Protocol::InsecureFtp));
    assert_eq!(recorded.verbs()[0], "AUTH");
}

#[tokio::test]
async fn raw_command_result() {
    let (engine, _, _, recorded) = connected(Script::default()).await;
    assert!(engine
        .execute(Command::RawCommand("SITE HELP".into()))
        .would_block());
    let (command, reply) = finished(&engine).await;
    assert_eq!(command, CommandId::RawCommand);
    assert!(reply.is_error());
    assert_eq!(recorded.commands().last().map(String::as_str), Some("SITE HELP"));
}

