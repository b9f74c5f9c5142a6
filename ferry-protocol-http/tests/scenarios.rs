use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ferry_common::{
    Command, CommandId, Credentials, FileExistsAction, FileTransferCommand, LocalEndpoint,
    MemoryFile, Notification, OptionId, Options, Protocol, Reply, Server, ServerPath, Site,
};
use ferry_core::{Engine, EngineContext};
use ferry_protocol_http::HttpFactory;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

#[derive(Debug, Clone)]
struct Seen {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
    /// 1-based index of the connection the request came in on
    connection: usize,
}

type Handler = Arc<dyn Fn(&Seen) -> String + Send + Sync>;

#[derive(Clone, Default)]
struct Recorded(Arc<Mutex<Vec<Seen>>>);

impl Recorded {
    fn requests(&self) -> Vec<Seen> {
        self.0.lock().unwrap().clone()
    }

    fn paths(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.path).collect()
    }

    fn connections(&self) -> usize {
        self.requests()
            .iter()
            .map(|r| r.connection)
            .max()
            .unwrap_or(0)
    }
}

async fn handle(stream: TcpStream, connection: usize, handler: Handler, recorded: Recorded) {
    let mut stream = BufReader::new(stream);
    loop {
        let mut line = String::new();
        if stream.read_line(&mut line).await.unwrap_or(0) == 0 {
            return;
        }
        let mut parts = line.trim_end().splitn(3, ' ');
        let method = parts.next().unwrap_or_default().to_owned();
        let path = parts.next().unwrap_or_default().to_owned();

        let mut headers = HashMap::new();
        loop {
            let mut header = String::new();
            stream.read_line(&mut header).await.unwrap();
            let header = header.trim_end();
            if header.is_empty() {
                break;
            }
            if let Some((name, value)) = header.split_once(':') {
                headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_owned());
            }
        }
        let length = headers
            .get("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let mut body = vec![0; length];
        stream.read_exact(&mut body).await.unwrap();

        let request = Seen {
            method,
            path,
            headers,
            body,
            connection,
        };
        let response = handler(&request);
        recorded.0.lock().unwrap().push(request);
        stream.get_mut().write_all(response.as_bytes()).await.unwrap();
        if response.to_ascii_lowercase().contains("connection: close") {
            return;
        }
    }
}

async fn fake_server(handler: impl Fn(&Seen) -> String + Send + Sync + 'static) -> (u16, Recorded) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let recorded = Recorded::default();
    let handler: Handler = Arc::new(handler);
    let seen = recorded.clone();
    tokio::spawn(async move {
        let mut connection = 0;
        while let Ok((stream, _)) = listener.accept().await {
            connection += 1;
            tokio::spawn(handle(stream, connection, handler.clone(), seen.clone()));
        }
    });
    (port, recorded)
}

fn ok(body: &str) -> String {
    format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{body}", body.len())
}

fn root() -> ServerPath {
    ServerPath::parse("/").unwrap()
}

async fn finished(engine: &Engine) -> (CommandId, Reply) {
    let (command, reply, _) = finished_with_log(engine).await;
    (command, reply)
}

/// Also returns the text of every log message seen on the way.
async fn finished_with_log(engine: &Engine) -> (CommandId, Reply, Vec<String>) {
    let wait = async {
        let mut log = vec![];
        loop {
            while let Some(notification) = engine.next_notification() {
                match notification {
                    Notification::OperationFinished { command, reply } => {
                        return (command, reply, log)
                    }
                    Notification::LogMessage(message) => log.push(message.text),
                    _ => {}
                }
            }
            engine.notified().await;
        }
    };
    tokio::time::timeout(Duration::from_secs(10), wait)
        .await
        .unwrap()
}

async fn connected(port: u16) -> (Engine, EngineContext) {
    connected_with(port, Options::new()).await
}

async fn connected_with(port: u16, options: Options) -> (Engine, EngineContext) {
    let context = EngineContext::new(Arc::new(options), None).unwrap();
    let engine = Engine::spawn(context.clone(), Arc::new(HttpFactory));
    let site = Site {
        server: Server::new(Protocol::Http, "127.0.0.1", port),
        credentials: Credentials::anonymous(),
        remote_path: None,
    };
    assert!(engine
        .execute(Command::Connect {
            site,
            retry_connecting: false
        })
        .would_block());
    assert_eq!(finished(&engine).await, (CommandId::Connect, Reply::OK));
    (engine, context)
}

async fn download(engine: &Engine, file: &str, target: &MemoryFile) -> Reply {
    let command = FileTransferCommand::download(root(), file, LocalEndpoint::Memory(target.clone()));
    assert!(engine.execute(Command::FileTransfer(command)).would_block());
    let (command, reply) = finished(engine).await;
    assert_eq!(command, CommandId::FileTransfer);
    reply
}

#[tokio::test]
async fn redirect_is_followed_once() {
    let (port, recorded) = fake_server(|request| match request.path.as_str() {
        "/old" => format!(
            "HTTP/1.1 301 Moved Permanently\r\nLocation: http://{}/new\r\nContent-Length: 0\r\n\r\n",
            request.headers["host"]
        ),
        _ => ok("hello"),
    })
    .await;
    let (engine, _) = connected(port).await;

    let target = MemoryFile::new();
    let command =
        FileTransferCommand::download(root(), "old", LocalEndpoint::Memory(target.clone()));
    assert!(engine.execute(Command::FileTransfer(command)).would_block());
    let (command, reply, log) = finished_with_log(&engine).await;
    assert_eq!((command, reply), (CommandId::FileTransfer, Reply::OK));

    assert_eq!(&target.contents()[..], b"hello");
    assert_eq!(recorded.paths(), vec!["/old", "/new"]);
    assert_eq!(recorded.connections(), 1);
    let redirects: Vec<_> = log.iter().filter(|l| l.starts_with("Redirected to")).collect();
    assert_eq!(redirects.len(), 1);
    assert!(redirects[0].ends_with("/new (redirect 1)"));
}

#[tokio::test]
async fn too_many_redirects() {
    let (port, recorded) = fake_server(|request| {
        format!(
            "HTTP/1.1 302 Found\r\nLocation: {}x\r\nContent-Length: 0\r\n\r\n",
            request.path
        )
    })
    .await;
    let (engine, _) = connected(port).await;

    let command =
        FileTransferCommand::download(root(), "loop", LocalEndpoint::Memory(MemoryFile::new()));
    assert!(engine.execute(Command::FileTransfer(command)).would_block());
    let (_, reply, log) = finished_with_log(&engine).await;
    assert!(reply.is_error());
    assert_eq!(recorded.requests().len(), 6);
    assert!(log.iter().any(|l| l.ends_with("(redirect 5)")));
    assert!(log.iter().any(|l| l == "Too many redirects"));
}

#[tokio::test]
async fn resume_sends_range() {
    let (port, recorded) = fake_server(|request| match request.headers.get("range") {
        Some(range) if range == "bytes=5-" => {
            "HTTP/1.1 206 Partial Content\r\nContent-Range: bytes 5-9/10\r\nContent-Length: 5\r\n\r\n56789"
                .to_owned()
        }
        _ => ok("0123456789"),
    })
    .await;
    let (engine, _) = connected(port).await;

    let target = MemoryFile::from_bytes(b"01234");
    let mut command =
        FileTransferCommand::download(root(), "file", LocalEndpoint::Memory(target.clone()));
    command.settings.on_exists = Some(FileExistsAction::Resume);
    assert!(engine.execute(Command::FileTransfer(command)).would_block());
    assert_eq!(finished(&engine).await, (CommandId::FileTransfer, Reply::OK));

    assert_eq!(&target.contents()[..], b"0123456789");
    assert_eq!(
        recorded.requests()[0].headers.get("range").map(String::as_str),
        Some("bytes=5-")
    );
}

#[tokio::test]
async fn ignored_range_restarts_from_zero() {
    let (port, _) = fake_server(|_| ok("0123456789")).await;
    let (engine, _) = connected(port).await;

    let target = MemoryFile::from_bytes(b"xxxxx");
    let mut command =
        FileTransferCommand::download(root(), "file", LocalEndpoint::Memory(target.clone()));
    command.settings.on_exists = Some(FileExistsAction::Resume);
    assert!(engine.execute(Command::FileTransfer(command)).would_block());
    assert_eq!(finished(&engine).await, (CommandId::FileTransfer, Reply::OK));
    assert_eq!(&target.contents()[..], b"0123456789");
}

#[tokio::test]
async fn chunked_body() {
    let (port, _) = fake_server(|_| {
        "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n"
            .to_owned()
    })
    .await;
    let (engine, _) = connected(port).await;

    let target = MemoryFile::new();
    assert_eq!(download(&engine, "c", &target).await, Reply::OK);
    assert_eq!(&target.contents()[..], b"hello world");
}

#[tokio::test]
async fn not_found_is_an_error() {
    let (port, _) = fake_server(|_| {
        "HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\n\r\nnot found".to_owned()
    })
    .await;
    let (engine, _) = connected(port).await;

    let target = MemoryFile::new();
    assert!(download(&engine, "missing", &target).await.is_error());
    assert!(target.contents().is_empty());
}

#[tokio::test]
async fn retry_after_throttles_the_host() {
    let (port, _) = fake_server(|_| {
        "HTTP/1.1 503 Service Unavailable\r\nRetry-After: 120\r\nContent-Length: 0\r\n\r\n"
            .to_owned()
    })
    .await;
    let (engine, context) = connected(port).await;

    assert!(download(&engine, "busy", &MemoryFile::new()).await.is_error());
    let delay = context.throttler.get_throttle("127.0.0.1").unwrap();
    assert!(delay > Duration::from_secs(100));
}

#[tokio::test]
async fn waiting_out_a_throttle_is_not_idleness() {
    let (port, recorded) = fake_server(|_| ok("hello")).await;
    let options = Options::new();
    options.set_int(OptionId::Timeout, 2).unwrap();
    let (engine, context) = connected_with(port, options).await;
    context
        .throttler
        .throttle("127.0.0.1", Duration::from_secs(4));

    let target = MemoryFile::new();
    assert_eq!(download(&engine, "late", &target).await, Reply::OK);
    assert_eq!(&target.contents()[..], b"hello");
    assert_eq!(recorded.requests().len(), 1);
}

#[tokio::test]
async fn upload_puts_the_body() {
    let (port, recorded) = fake_server(|_| {
        "HTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n".to_owned()
    })
    .await;
    let (engine, _) = connected(port).await;

    let source = MemoryFile::from_bytes(b"payload");
    let command = FileTransferCommand::upload(LocalEndpoint::Memory(source), root(), "up.bin");
    assert!(engine.execute(Command::FileTransfer(command)).would_block());
    assert_eq!(finished(&engine).await, (CommandId::FileTransfer, Reply::OK));

    let request = &recorded.requests()[0];
    assert_eq!(request.method, "PUT");
    assert_eq!(request.path, "/up.bin");
    assert_eq!(request.body, b"payload");
}

#[tokio::test]
async fn keep_alive_reuses_the_connection() {
    let (port, recorded) = fake_server(|_| ok("x")).await;
    let (engine, _) = connected(port).await;

    for name in ["a", "b"] {
        assert_eq!(download(&engine, name, &MemoryFile::new()).await, Reply::OK);
    }
    assert_eq!(recorded.connections(), 1);
}

#[tokio::test]
async fn connection_close_reads_until_eof() {
    let (port, recorded) = fake_server(|_| {
        "HTTP/1.1 200 OK\r\nConnection: close\r\n\r\nuntil the end".to_owned()
    })
    .await;
    let (engine, _) = connected(port).await;

    let first = MemoryFile::new();
    assert_eq!(download(&engine, "a", &first).await, Reply::OK);
    assert_eq!(&first.contents()[..], b"until the end");
    assert_eq!(download(&engine, "b", &MemoryFile::new()).await, Reply::OK);
    assert_eq!(recorded.connections(), 2);
}
