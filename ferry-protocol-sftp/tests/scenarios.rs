#![cfg(target_os = "linux")]

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ferry_common::{
    AsyncReply, AsyncRequestKind, Command, CommandId, Credentials, FileTransferCommand,
    ListCommand, LocalEndpoint, MemoryFile, Notification, OptionId, Options, Protocol, Reply,
    ReplyFlags, Server, ServerPath, Site,
};
use ferry_core::{Engine, EngineContext};
use ferry_protocol_sftp::SftpFactory;
use tempfile::TempDir;

/// A helper speaking just enough of the protocol. Record types are single
/// characters: `0` reply, `1` done, `8` list entry, `9` host key, `;`
/// password, `>` kex, `A`/`B` ciphers, `F` open, `G` next buffer, `H`
/// finalize.
const HELPER: &str = r#"#!/bin/sh
DIR='@DIR@'
SHM=/proc/self/fd/$FERRY_SHM_FD
printf '0\nprotocol_version=1 fake\n'
while IFS= read -r line; do
  echo "$line" >> "$DIR/commands"
  case "$line" in
    open*)
      printf '9\n127.0.0.1 22\nSHA256:fakekey\n'
      read -r answer
      if [ "$answer" != y ]; then printf '1\n0\n'; continue; fi
      printf ';\nPassword:\n'
      read -r password
      printf '%s' "$password" > "$DIR/password"
      printf '>\ncurve25519-sha256\nA\naes256-gcm\nB\naes256-gcm\n'
      printf '1\n1\n' ;;
    pwd) printf '0\n"/home/test"\n1\n1\n' ;;
    cd*) printf '1\n1\n' ;;
    ls)
      printf '8\n-rw-r--r-- 1 test users 5 Jan 1 2024 hello.txt\n1704067200\nhello.txt\n'
      printf '8\ndrwxr-xr-x 2 test users 4096 Jan 1 2024 sub\n\nsub\n'
      printf '1\n1\n' ;;
    get*)
      printf 'F\n5\n'
      read -r range
      range=${range#-}
      printf 'hello' | dd of="$SHM" bs=1 seek="${range%% *}" conv=notrunc 2>/dev/null
      printf 'H\n5\n1\n1\n' ;;
    put*)
      printf 'F\n\n'
      : > "$DIR/uploaded"
      while read -r range; do
        range=${range#-}
        len=${range#* }
        [ "$len" = 0 ] && break
        dd if="$SHM" bs=1 skip="${range%% *}" count="$len" 2>/dev/null >> "$DIR/uploaded"
        printf 'G\n0\n'
      done
      printf 'H\n0\n1\n1\n' ;;
    mkdir*)
      n=$(grep -c '^mkdir' "$DIR/commands")
      if [ "$n" -eq 1 ]; then printf '1\n0\n'; else printf '1\n1\n'; fi ;;
    *) printf '1\n0\n' ;;
  esac
done
"#;

struct FakeHelper {
    dir: TempDir,
}

impl FakeHelper {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let script = HELPER.replace("@DIR@", &dir.path().display().to_string());
        let path = dir.path().join("ferry-sftp");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        Self { dir }
    }

    fn program(&self) -> PathBuf {
        self.dir.path().join("ferry-sftp")
    }

    fn read(&self, name: &str) -> String {
        std::fs::read_to_string(self.dir.path().join(name)).unwrap_or_default()
    }

    fn commands(&self) -> Vec<String> {
        self.read("commands").lines().map(str::to_owned).collect()
    }
}

fn site() -> Site {
    Site {
        server: Server::new(Protocol::Sftp, "127.0.0.1", 22).with_user("test"),
        credentials: Credentials::password("secret"),
        remote_path: None,
    }
}

fn home() -> ServerPath {
    ServerPath::parse("/home/test").unwrap()
}

fn engine(helper: &FakeHelper) -> (Engine, EngineContext) {
    let options = Options::new();
    options
        .set_string(OptionId::SftpHelper, helper.program().display().to_string())
        .unwrap();
    let context = EngineContext::new(Arc::new(options), None).unwrap();
    let engine = Engine::spawn(context.clone(), Arc::new(SftpFactory));
    (engine, context)
}

/// Runs until the current command finishes, answering host key prompts
/// with `trust` and collecting everything else.
async fn run(engine: &Engine, trust: bool) -> (CommandId, Reply, Vec<Notification>) {
    let wait = async {
        let mut seen = vec![];
        loop {
            while let Some(notification) = engine.next_notification() {
                match notification {
                    Notification::OperationFinished { command, reply } => {
                        return (command, reply, seen);
                    }
                    Notification::AsyncRequest(request)
                        if matches!(request.kind, AsyncRequestKind::HostKey(_)) =>
                    {
                        let answer = request.clone().answer(AsyncReply::HostKey {
                            trust,
                            always: true,
                        });
                        assert!(engine.set_async_request_reply(answer));
                        seen.push(Notification::AsyncRequest(request));
                    }
                    other => seen.push(other),
                }
            }
            engine.notified().await;
        }
    };
    tokio::time::timeout(Duration::from_secs(10), wait)
        .await
        .unwrap()
}

async fn connected(helper: &FakeHelper) -> (Engine, EngineContext) {
    let (engine, context) = engine(helper);
    assert!(engine
        .execute(Command::Connect {
            site: site(),
            retry_connecting: false
        })
        .would_block());
    let (command, reply, _) = run(&engine, true).await;
    assert_eq!((command, reply), (CommandId::Connect, Reply::OK));
    (engine, context)
}

#[tokio::test]
async fn login_reports_encryption_and_working_directory() {
    let helper = FakeHelper::new();
    let (engine, context) = engine(&helper);
    assert!(engine
        .execute(Command::Connect {
            site: site(),
            retry_connecting: false
        })
        .would_block());
    let (command, reply, seen) = run(&engine, true).await;
    assert_eq!((command, reply), (CommandId::Connect, Reply::OK));

    let encryption = seen
        .iter()
        .find_map(|n| match n {
            Notification::Encryption(details) => Some(details.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(encryption.protocol, "SSH");
    assert_eq!(encryption.key_exchange, "curve25519-sha256");
    assert_eq!(encryption.cipher, "aes256-gcm");

    assert_eq!(helper.read("password"), "secret");
    assert_eq!(helper.commands()[0], "open \"127.0.0.1\" 22 \"test\"");
    assert!(helper.commands().contains(&"pwd".to_owned()));
    assert_eq!(
        context.host_keys.check("127.0.0.1", 22, "SHA256:fakekey"),
        ferry_core::HostKeyStatus::Trusted
    );
}

#[tokio::test]
async fn trusted_host_key_is_not_asked_again() {
    let helper = FakeHelper::new();
    let (engine, context) = engine(&helper);
    context.host_keys.trust("127.0.0.1", 22, "SHA256:fakekey");
    assert!(engine
        .execute(Command::Connect {
            site: site(),
            retry_connecting: false
        })
        .would_block());
    let (_, reply, seen) = run(&engine, false).await;
    assert_eq!(reply, Reply::OK);
    assert!(!seen
        .iter()
        .any(|n| matches!(n, Notification::AsyncRequest(_))));
}

#[tokio::test]
async fn rejected_host_key_disconnects() {
    let helper = FakeHelper::new();
    let (engine, _) = engine(&helper);
    assert!(engine
        .execute(Command::Connect {
            site: site(),
            retry_connecting: false
        })
        .would_block());
    let (command, reply, _) = run(&engine, false).await;
    assert_eq!(command, CommandId::Connect);
    assert!(reply.is_critical() && reply.has(ReplyFlags::DISCONNECTED));
    assert!(!engine.is_connected());
}

#[tokio::test]
async fn missing_helper_fails_to_connect() {
    let options = Options::new();
    options
        .set_string(OptionId::SftpHelper, "/nonexistent/ferry-sftp")
        .unwrap();
    let context = EngineContext::new(Arc::new(options), None).unwrap();
    let engine = Engine::spawn(context, Arc::new(SftpFactory));
    assert!(engine
        .execute(Command::Connect {
            site: site(),
            retry_connecting: false
        })
        .would_block());
    let (_, reply, _) = run(&engine, true).await;
    assert!(reply.is_critical());
}

#[tokio::test]
async fn listing_fills_the_cache() {
    let helper = FakeHelper::new();
    let (engine, context) = connected(&helper).await;

    assert!(engine
        .execute(Command::List(ListCommand::new(home())))
        .would_block());
    let (command, reply, seen) = run(&engine, true).await;
    assert_eq!((command, reply), (CommandId::List, Reply::OK));
    assert!(seen.iter().any(|n| matches!(
        n,
        Notification::DirectoryListing { path, failed: false, .. } if *path == home()
    )));

    let key = site().server.key();
    let listing = context.directory_cache.lookup(&key, &home()).unwrap();
    assert_eq!(listing.entries.len(), 2);
    let file = &listing.entries[0];
    assert_eq!((file.name.as_str(), file.size), ("hello.txt", 5));
    assert_eq!(file.time.map(|t| t.timestamp()), Some(1704067200));
    assert!(listing.entries[1].is_dir);
    // Already in /home/test after connecting
    assert!(!helper.commands().iter().any(|c| c.starts_with("cd ")));
}

#[tokio::test]
async fn download_goes_through_the_shared_region() {
    let helper = FakeHelper::new();
    let (engine, _) = connected(&helper).await;

    let target = MemoryFile::new();
    let command =
        FileTransferCommand::download(home(), "hello.txt", LocalEndpoint::Memory(target.clone()));
    assert!(engine.execute(Command::FileTransfer(command)).would_block());
    let (command, reply, _) = run(&engine, true).await;
    assert_eq!((command, reply), (CommandId::FileTransfer, Reply::OK));
    assert_eq!(&target.contents()[..], b"hello");
    assert!(helper
        .commands()
        .contains(&"get \"/home/test/hello.txt\" 0".to_owned()));
}

#[tokio::test]
async fn upload_goes_through_the_shared_region() {
    let helper = FakeHelper::new();
    let (engine, context) = connected(&helper).await;

    let source = MemoryFile::from_bytes(b"uploaded bytes");
    let command = FileTransferCommand::upload(LocalEndpoint::Memory(source), home(), "new.txt");
    assert!(engine.execute(Command::FileTransfer(command)).would_block());
    let (command, reply, _) = run(&engine, true).await;
    assert_eq!((command, reply), (CommandId::FileTransfer, Reply::OK));
    assert_eq!(helper.read("uploaded"), "uploaded bytes");

    let key = site().server.key();
    let found = context
        .directory_cache
        .lookup_file(&key, &home(), "new.txt");
    assert_eq!(found.entry.map(|e| e.size), Some(14));
}

#[tokio::test]
async fn mkdir_creates_missing_parents() {
    let helper = FakeHelper::new();
    let (engine, _) = connected(&helper).await;

    let path = ServerPath::parse("/a/b").unwrap();
    assert!(engine.execute(Command::Mkdir { path }).would_block());
    let (command, reply, _) = run(&engine, true).await;
    assert_eq!((command, reply), (CommandId::Mkdir, Reply::OK));
    let mkdirs: Vec<String> = helper
        .commands()
        .into_iter()
        .filter(|c| c.starts_with("mkdir"))
        .collect();
    assert_eq!(
        mkdirs,
        vec!["mkdir \"/a/b\"", "mkdir \"/a\"", "mkdir \"/a/b\""]
    );
}

#[tokio::test]
async fn raw_commands_are_not_supported() {
    let helper = FakeHelper::new();
    let (engine, _) = connected(&helper).await;
    engine.execute(Command::RawCommand("stat x".into()));
    let (command, reply, _) = run(&engine, true).await;
    assert_eq!(command, CommandId::RawCommand);
    assert!(reply.has(ReplyFlags::NOTSUPPORTED));
    assert!(engine.is_connected());
}
