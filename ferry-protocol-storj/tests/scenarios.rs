#![cfg(target_os = "linux")]

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;

use ferry_common::{
    Command, CommandId, Credentials, FileTransferCommand, ListCommand, LocalEndpoint, MemoryFile,
    Notification, OptionId, Options, Protocol, Reply, ReplyFlags, Server, ServerPath, Site,
};
use ferry_core::{Engine, EngineContext};
use ferry_protocol_storj::StorjFactory;
use tempfile::TempDir;

/// `8` list entry, `9` open, `:` next buffer, `;` finalize.
const HELPER: &str = r#"#!/bin/sh
DIR='@DIR@'
SHM=/proc/self/fd/$FERRY_SHM_FD
printf '0\nprotocol_version=1\n'
while IFS= read -r line; do
  echo "$line" >> "$DIR/commands"
  case "$line" in
    'pass "wrong"') printf '1\n1\n'; failed=1 ;;
    validate) if [ -n "$failed" ]; then printf '1\n0\n'; else printf '1\n1\n'; fi ;;
    host*|key*|pass*) printf '1\n1\n' ;;
    'list "" ""')
      printf '8\nphotos/\n-1\n\n8\nbackups/\n-1\n\n1\n1\n' ;;
    'list "photos" ""')
      printf '8\n2024/\n-1\n\n8\nhello.txt\n5\n1704067200\n1\n1\n' ;;
    get*)
      printf '9\n5\n'
      read -r range
      range=${range#-}
      printf 'hello' | dd of="$SHM" bs=1 seek="${range%% *}" conv=notrunc 2>/dev/null
      printf ';\n5\n1\n1\n' ;;
    put*)
      printf '9\n\n'
      : > "$DIR/uploaded"
      while read -r range; do
        range=${range#-}
        len=${range#* }
        [ "$len" = 0 ] && break
        dd if="$SHM" bs=1 skip="${range%% *}" count="$len" 2>/dev/null >> "$DIR/uploaded"
        printf ':\n0\n'
      done
      printf ';\n0\n1\n1\n' ;;
    mk*|rm*) printf '1\n1\n' ;;
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
        let path = dir.path().join("ferry-storj");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        Self { dir }
    }

    fn read(&self, name: &str) -> String {
        std::fs::read_to_string(self.dir.path().join(name)).unwrap_or_default()
    }

    fn commands(&self) -> Vec<String> {
        self.read("commands").lines().map(str::to_owned).collect()
    }

    fn engine(&self) -> (Engine, EngineContext) {
        let options = Options::new();
        options
            .set_string(
                OptionId::StorjHelper,
                self.dir.path().join("ferry-storj").display().to_string(),
            )
            .unwrap();
        let context = EngineContext::new(Arc::new(options), None).unwrap();
        let engine = Engine::spawn(context.clone(), Arc::new(StorjFactory));
        (engine, context)
    }
}

fn site(passphrase: &str) -> Site {
    Site {
        server: Server::new(Protocol::Storj, "satellite.example", 7777).with_user("apikey"),
        credentials: Credentials::password(passphrase),
        remote_path: None,
    }
}

fn photos() -> ServerPath {
    ServerPath::parse("/photos").unwrap()
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

async fn connected(helper: &FakeHelper) -> (Engine, EngineContext) {
    let (engine, context) = helper.engine();
    assert!(engine
        .execute(Command::Connect {
            site: site("secret"),
            retry_connecting: false,
        })
        .would_block());
    assert_eq!(finished(&engine).await, (CommandId::Connect, Reply::OK));
    (engine, context)
}

#[tokio::test]
async fn login_sends_credentials_then_validates() {
    let helper = FakeHelper::new();
    let (engine, _) = connected(&helper).await;
    assert!(engine.is_connected());
    assert_eq!(
        helper.commands(),
        vec![
            "host \"satellite.example:7777\"",
            "key \"apikey\"",
            "pass \"secret\"",
            "validate"
        ]
    );
}

#[tokio::test]
async fn rejected_passphrase() {
    let helper = FakeHelper::new();
    let (engine, _) = helper.engine();
    engine.execute(Command::Connect {
        site: site("wrong"),
        retry_connecting: false,
    });
    let (command, reply) = finished(&engine).await;
    assert_eq!(command, CommandId::Connect);
    assert!(reply.is_critical());
    assert!(reply.has(ReplyFlags::PASSWORDFAILED | ReplyFlags::DISCONNECTED));
    assert!(!engine.is_connected());
}

#[tokio::test]
async fn root_lists_buckets_and_buckets_list_objects() {
    let helper = FakeHelper::new();
    let (engine, context) = connected(&helper).await;
    let key = site("secret").server.key();

    engine.execute(Command::List(ListCommand::current()));
    assert_eq!(finished(&engine).await, (CommandId::List, Reply::OK));
    let root = context
        .directory_cache
        .lookup(&key, &ServerPath::root())
        .unwrap();
    let buckets: Vec<&str> = root.entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(buckets, vec!["photos", "backups"]);
    assert!(root.entries.iter().all(|e| e.is_dir));

    engine.execute(Command::List(ListCommand::new(photos())));
    assert_eq!(finished(&engine).await, (CommandId::List, Reply::OK));
    let listing = context.directory_cache.lookup(&key, &photos()).unwrap();
    assert_eq!(listing.entries.len(), 2);
    assert!(listing.entries[0].is_dir);
    assert_eq!(listing.entries[1].size, 5);
}

#[tokio::test]
async fn download_and_upload() {
    let helper = FakeHelper::new();
    let (engine, _) = connected(&helper).await;

    let target = MemoryFile::new();
    let download =
        FileTransferCommand::download(photos(), "hello.txt", LocalEndpoint::Memory(target.clone()));
    engine.execute(Command::FileTransfer(download));
    assert_eq!(finished(&engine).await, (CommandId::FileTransfer, Reply::OK));
    assert_eq!(&target.contents()[..], b"hello");
    assert!(helper
        .commands()
        .contains(&"get \"photos\" \"hello.txt\" 0".to_owned()));

    let source = MemoryFile::from_bytes(b"fresh object");
    let upload = FileTransferCommand::upload(LocalEndpoint::Memory(source), photos(), "new.txt");
    engine.execute(Command::FileTransfer(upload));
    assert_eq!(finished(&engine).await, (CommandId::FileTransfer, Reply::OK));
    assert_eq!(helper.read("uploaded"), "fresh object");
}

#[tokio::test]
async fn objects_need_a_bucket() {
    let helper = FakeHelper::new();
    let (engine, _) = connected(&helper).await;
    let source = MemoryFile::from_bytes(b"x");
    let upload =
        FileTransferCommand::upload(LocalEndpoint::Memory(source), ServerPath::root(), "x.txt");
    engine.execute(Command::FileTransfer(upload));
    let (_, reply) = finished(&engine).await;
    assert!(reply.is_critical());
    assert!(!helper.commands().iter().any(|c| c.starts_with("put")));
}

#[tokio::test]
async fn directories_map_to_buckets_and_prefixes() {
    let helper = FakeHelper::new();
    let (engine, _) = connected(&helper).await;

    engine.execute(Command::Mkdir {
        path: ServerPath::parse("/archive").unwrap(),
    });
    assert_eq!(finished(&engine).await, (CommandId::Mkdir, Reply::OK));
    engine.execute(Command::Mkdir {
        path: ServerPath::parse("/photos/2025").unwrap(),
    });
    assert_eq!(finished(&engine).await, (CommandId::Mkdir, Reply::OK));
    engine.execute(Command::RemoveDir {
        path: photos(),
        subdir: "2024".into(),
    });
    assert_eq!(finished(&engine).await, (CommandId::RemoveDir, Reply::OK));
    engine.execute(Command::Delete {
        path: photos(),
        files: vec!["hello.txt".into()],
    });
    assert_eq!(finished(&engine).await, (CommandId::Delete, Reply::OK));

    let commands = helper.commands();
    assert_eq!(
        &commands[4..],
        [
            "mkbucket \"archive\"",
            "mkd \"photos\" \"2025/\"",
            "rmd \"photos\" \"2024/\"",
            "rm \"photos\" \"hello.txt\"",
        ]
    );
}

#[tokio::test]
async fn rename_is_not_supported() {
    let helper = FakeHelper::new();
    let (engine, _) = connected(&helper).await;
    engine.execute(Command::Rename {
        from_path: photos(),
        from_file: "a".into(),
        to_path: photos(),
        to_file: "b".into(),
    });
    let (command, reply) = finished(&engine).await;
    assert_eq!(command, CommandId::Rename);
    assert!(reply.has(ReplyFlags::NOTSUPPORTED));
}
