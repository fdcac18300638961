//! Helpers for tests that talk to a live chat listener over loopback.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lanchat_shared::constants::{DEFAULT_HISTORY_LIMIT, MAX_PERSIST_BYTES};
use lanchat_store::Database;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

use crate::auth::AuthGate;
use crate::hub::Hub;
use crate::persist::{Persistence, SharedDb};
use crate::session::{serve, ChatContext};
use crate::unread::UnreadTracker;

const LINE_TIMEOUT: Duration = Duration::from_secs(5);
const QUIET_PERIOD: Duration = Duration::from_millis(300);

pub struct TestServer {
    pub addr: SocketAddr,
    pub ctx: Arc<ChatContext>,
    pub db: SharedDb,
}

pub async fn start_server(gate: AuthGate) -> TestServer {
    let db: SharedDb = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
    let persist = Persistence::spawn(db.clone(), MAX_PERSIST_BYTES);
    let unread = Arc::new(UnreadTracker::durable(
        Arc::new(persist.clone()),
        Vec::new(),
    ));
    let hub = Arc::new(Hub::new("general", persist, unread));
    let ctx = Arc::new(ChatContext::new(hub, gate, DEFAULT_HISTORY_LIMIT));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, ctx.clone()));

    TestServer { addr, ctx, db }
}

/// A raw line-protocol client.
pub struct LineClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl LineClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, writer) = stream.into_split();
        Self {
            lines: BufReader::new(read).lines(),
            writer,
        }
    }

    pub async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    /// Write raw bytes, newline included by the caller.
    pub async fn send_bytes(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
    }

    /// Read until a line starting with `prefix` arrives and return it.
    pub async fn expect(&mut self, prefix: &str) -> String {
        let wait = async {
            loop {
                match self.lines.next_line().await.unwrap() {
                    Some(line) if line.starts_with(prefix) => return line,
                    Some(_) => continue,
                    None => panic!("connection closed while waiting for {prefix:?}"),
                }
            }
        };
        match tokio::time::timeout(LINE_TIMEOUT, wait).await {
            Ok(line) => line,
            Err(_) => panic!("timed out waiting for {prefix:?}"),
        }
    }

    /// Fail if a line containing `needle` arrives within a short window.
    pub async fn assert_silent(&mut self, needle: &str) {
        let deadline = tokio::time::Instant::now() + QUIET_PERIOD;
        while let Ok(next) = tokio::time::timeout_at(deadline, self.lines.next_line()).await {
            match next {
                Ok(Some(line)) => assert!(!line.contains(needle), "unexpected line: {line}"),
                _ => return,
            }
        }
    }

    /// The server closes the socket; any queued lines are skipped.
    pub async fn expect_closed(&mut self) {
        let wait = async {
            loop {
                match self.lines.next_line().await {
                    Ok(Some(_)) => continue,
                    Ok(None) | Err(_) => return,
                }
            }
        };
        if tokio::time::timeout(LINE_TIMEOUT, wait).await.is_err() {
            panic!("connection was not closed");
        }
    }
}
