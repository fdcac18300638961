//! Line-protocol connections to a lanchat server.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use lanchat_shared::auth::hmac_hex;
use lanchat_shared::protocol::{AuthAttempt, Command, ServerLine};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::TransferError;

/// How the endpoint proves who it is, matching the server's configured
/// scheme.
#[derive(Clone, Default)]
pub enum Credentials {
    /// The server runs without authentication.
    #[default]
    None,
    /// `AUTH <user> <timestamp> <hmac>` computed from a shared secret.
    Hmac { secret: String },
    /// `AUTH <secret>` for servers that still accept the bare secret.
    SharedSecret(String),
    /// `AUTH_JWT <token>` with a token issued out of band.
    Token(String),
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Credentials::None => "None",
            Credentials::Hmac { .. } => "Hmac",
            Credentials::SharedSecret(_) => "SharedSecret",
            Credentials::Token(_) => "Token",
        };
        f.write_str(kind)
    }
}

impl Credentials {
    fn auth_command(&self, user: &str) -> Result<Option<Command>, TransferError> {
        let attempt = match self {
            Credentials::None => return Ok(None),
            Credentials::Hmac { secret } => {
                let timestamp = Utc::now().timestamp().to_string();
                let mac = hmac_hex(secret, user, &timestamp)?;
                AuthAttempt::Hmac {
                    user: user.to_string(),
                    timestamp,
                    mac,
                }
            }
            Credentials::SharedSecret(secret) => AuthAttempt::Legacy {
                secret: secret.clone(),
            },
            Credentials::Token(token) => AuthAttempt::Token(token.clone()),
        };
        Ok(Some(Command::Auth(attempt)))
    }
}

/// Who to connect as, and where.
#[derive(Debug, Clone)]
pub struct Identity {
    pub server: SocketAddr,
    pub user: String,
    pub room: String,
    pub avatar: Option<String>,
    pub credentials: Credentials,
}

/// Write side of a connection. Clones share the socket; each line is
/// written whole.
#[derive(Clone)]
pub struct LineSender {
    inner: Arc<Mutex<OwnedWriteHalf>>,
}

impl LineSender {
    pub async fn send_line(&self, line: &str) -> Result<(), TransferError> {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        let mut socket = self.inner.lock().await;
        socket.write_all(&buf).await?;
        Ok(())
    }

    pub async fn send(&self, command: &Command) -> Result<(), TransferError> {
        self.send_line(&command.to_string()).await
    }

    /// Half-close the socket. Lines already written are still delivered.
    pub async fn shutdown(&self) {
        let mut socket = self.inner.lock().await;
        if let Err(e) = socket.shutdown().await {
            debug!(error = %e, "shutdown of line sender failed");
        }
    }
}

/// Read side of a connection.
pub struct LineReader {
    lines: Lines<BufReader<OwnedReadHalf>>,
}

impl LineReader {
    /// Next raw line, `None` once the server closed the connection.
    pub async fn next_raw(&mut self) -> Result<Option<String>, TransferError> {
        Ok(self.lines.next_line().await?)
    }

    pub async fn next(&mut self) -> Result<Option<ServerLine>, TransferError> {
        Ok(self.next_raw().await?.map(|line| ServerLine::parse(&line)))
    }
}

pub struct Connection {
    pub sender: LineSender,
    pub reader: LineReader,
}

/// Connect and run the handshake: `HELLO`, then `AUTH` if credentials are
/// configured. With `lane` set the connection is announced as an auxiliary
/// transfer lane.
pub async fn connect(identity: &Identity, lane: bool) -> Result<Connection, TransferError> {
    let stream = TcpStream::connect(identity.server).await?;
    stream.set_nodelay(true)?;
    let (read, write) = stream.into_split();

    let sender = LineSender {
        inner: Arc::new(Mutex::new(write)),
    };
    let reader = LineReader {
        lines: BufReader::new(read).lines(),
    };

    let hello = Command::Hello {
        user: identity.user.clone(),
        room: Some(identity.room.clone()),
        avatar: if lane { None } else { identity.avatar.clone() },
        lane,
    };
    sender.send(&hello).await?;
    if let Some(auth) = identity.credentials.auth_command(&identity.user)? {
        sender.send(&auth).await?;
    }
    debug!(server = %identity.server, user = %identity.user, lane, "connected");

    Ok(Connection { sender, reader })
}
