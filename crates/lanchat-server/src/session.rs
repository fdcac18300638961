//! Chat listener and per-connection Session Handler.
//!
//! Each accepted socket gets a reader loop (this module) and a writer task
//! that drains the connection's outbound queue. The reader classifies lines,
//! runs the handshake and auth state machine, and dispatches commands to the
//! hub in arrival order.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lanchat_shared::constants::MAX_HISTORY_LIMIT;
use lanchat_shared::protocol::{ack_line, pong_line, AuthAttempt, Command, Envelope, Notice, Target};
use lanchat_shared::{ConversationId, ProtocolError};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth::AuthGate;
use crate::error::SessionError;
use crate::hub::{ConnHandle, ConnId, Hub, Outbound};

/// How long a closing connection may spend flushing queued lines.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Back-off after a failed `accept`, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Everything a session needs from the rest of the server.
pub struct ChatContext {
    pub hub: Arc<Hub>,
    pub gate: AuthGate,
    pub history_limit: usize,
    next_id: AtomicU64,
}

impl ChatContext {
    pub fn new(hub: Arc<Hub>, gate: AuthGate, history_limit: usize) -> Self {
        Self {
            hub,
            gate,
            history_limit,
            next_id: AtomicU64::new(1),
        }
    }

    fn next_conn_id(&self) -> ConnId {
        ConnId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// Accept chat connections forever, one task per connection.
pub async fn serve(listener: TcpListener, ctx: Arc<ChatContext>) {
    match listener.local_addr() {
        Ok(addr) => info!(addr = %addr, auth = ctx.gate.scheme(), "chat listener ready"),
        Err(e) => warn!(error = %e, "chat listener has no local address"),
    }

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        let ctx = ctx.clone();
        tokio::spawn(async move {
            handle_connection(stream, peer, ctx).await;
        });
    }
}

/// Drive one connection until the peer disconnects or the hub closes it.
pub async fn handle_connection(stream: TcpStream, peer: SocketAddr, ctx: Arc<ChatContext>) {
    let id = ctx.next_conn_id();
    if let Err(e) = stream.set_nodelay(true) {
        debug!(conn = %id, error = %e, "could not set TCP_NODELAY");
    }
    let (read_half, write_half) = stream.into_split();
    let (handle, rx) = ConnHandle::new(id, peer);
    let mut writer = tokio::spawn(write_loop(write_half, rx));

    debug!(conn = %id, peer = %peer, "connection accepted");

    let mut session = Session::new(handle.clone(), ctx.clone());
    match session.run(BufReader::new(read_half)).await {
        Ok(()) => debug!(conn = %id, "connection closed"),
        Err(e) => debug!(conn = %id, error = %e, "connection ended"),
    }

    ctx.hub.leave(id);
    handle.close();
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        warn!(conn = %id, "writer did not drain in time");
        writer.abort();
    }
}

async fn write_loop(mut socket: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Line(mut line) => {
                line.push('\n');
                if socket.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
            Outbound::Close => break,
        }
    }
    let _ = socket.shutdown().await;
}

enum Flow {
    Continue,
    Close,
}

/// Identity requested by `HELLO` (or implied by the first non-HELLO line).
#[derive(Debug, Clone)]
struct Requested {
    user: String,
    room: String,
    avatar: Option<String>,
    lane: bool,
}

struct Session {
    handle: ConnHandle,
    ctx: Arc<ChatContext>,
    requested: Option<Requested>,
    authenticated: bool,
}

impl Session {
    fn new(handle: ConnHandle, ctx: Arc<ChatContext>) -> Self {
        Self {
            handle,
            ctx,
            requested: None,
            authenticated: false,
        }
    }

    async fn run<R>(&mut self, reader: R) -> Result<(), SessionError>
    where
        R: AsyncBufRead + Unpin,
    {
        let shutdown = self.handle.shutdown_signal();
        let mut reader = reader;
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let read = tokio::select! {
                _ = shutdown.notified() => return Ok(()),
                read = reader.read_until(b'\n', &mut buf) => read?,
            };
            if read == 0 {
                return Ok(());
            }
            let flow = match std::str::from_utf8(&buf) {
                Ok(line) => self.on_line(line.trim_end_matches('\n')).await,
                Err(_) => self.on_garbled_line(&buf),
            };
            if let Flow::Close = flow {
                return Ok(());
            }
        }
    }

    /// A line that is not UTF-8 is ignored like any other malformed line;
    /// its `SEQ` envelope, if readable, is still acknowledged.
    fn on_garbled_line(&self, raw: &[u8]) -> Flow {
        debug!(conn = %self.handle.id(), len = raw.len(), "ignoring line that is not UTF-8");
        let lossy = String::from_utf8_lossy(raw);
        if let Some(seq) = Envelope::split(lossy.trim_end()).seq {
            self.handle.send(ack_line(seq));
        }
        Flow::Continue
    }

    async fn on_line(&mut self, raw: &str) -> Flow {
        let raw = raw.trim_end_matches('\r');
        if raw.trim().is_empty() {
            return Flow::Continue;
        }
        let envelope = Envelope::split(raw);
        let flow = self.dispatch(Command::parse(envelope.body)).await;
        if let Some(seq) = envelope.seq {
            self.handle.send(ack_line(seq));
        }
        flow
    }

    async fn dispatch(&mut self, parsed: Result<Command, ProtocolError>) -> Flow {
        if self.requested.is_none() {
            match parsed {
                Ok(Command::NameCheck { room, user }) => {
                    self.answer_name_check(room, user);
                    return Flow::Close;
                }
                Ok(Command::Hello {
                    user,
                    room,
                    avatar,
                    lane,
                }) => {
                    let room = room.unwrap_or_else(|| self.ctx.hub.default_room().to_string());
                    return self.handshake(Requested {
                        user,
                        room,
                        avatar,
                        lane,
                    });
                }
                _ => {
                    let implicit = Requested {
                        user: self.handle.addr().ip().to_string(),
                        room: self.ctx.hub.default_room().to_string(),
                        avatar: None,
                        lane: false,
                    };
                    debug!(conn = %self.handle.id(), user = %implicit.user, "implicit join");
                    if let Flow::Close = self.handshake(implicit) {
                        return Flow::Close;
                    }
                }
            }
        }

        let command = match parsed {
            Ok(command) => command,
            Err(e) => {
                debug!(conn = %self.handle.id(), error = %e, "ignoring line");
                return Flow::Continue;
            }
        };

        match command {
            Command::Ping(token) => {
                self.handle.send(pong_line(&token));
            }
            Command::Auth(attempt) => return self.authenticate(&attempt),
            _ if !self.authenticated => {
                debug!(conn = %self.handle.id(), "dropping command before authentication");
            }
            Command::Pong(_) => {}
            Command::Hello {
                user,
                room,
                avatar,
                lane,
            } => {
                let room = room.unwrap_or_else(|| self.ctx.hub.default_room().to_string());
                self.requested = Some(Requested {
                    user,
                    room,
                    avatar,
                    lane,
                });
                return self.register();
            }
            Command::NameCheck { room, user } => self.answer_name_check(room, user),
            Command::Msg(text) => {
                self.ctx.hub.broadcast_text(self.handle.id(), &text);
            }
            Command::Dm { target, text } => {
                self.ctx.hub.send_dm(self.handle.id(), &target, &text);
            }
            Command::Hist { target, limit } => self.replay_history(target, limit).await,
            Command::Unread => {
                if let Some((_, user)) = self.ctx.hub.session(self.handle.id()) {
                    let counts = self.ctx.hub.unread().snapshot(&user);
                    self.handle.send(Notice::Unread(counts).to_string());
                }
            }
            Command::Read(target) => {
                if let Some((conversation, user)) = self.resolve(&target) {
                    self.ctx.hub.unread().reset(&user, &conversation);
                }
            }
            Command::Avatar(file) => {
                self.ctx.hub.set_avatar(self.handle.id(), &file);
            }
            Command::AvatarUpload { file, mime, data } => {
                if !self
                    .ctx
                    .hub
                    .set_avatar_data(self.handle.id(), &file, &mime, &data)
                {
                    debug!(conn = %self.handle.id(), "avatar upload rejected");
                }
            }
            Command::AvatarReq(user) => {
                if let Some(notice) = self.ctx.hub.avatar_data(&user) {
                    self.handle.send(notice.to_string());
                }
            }
        }
        Flow::Continue
    }

    fn answer_name_check(&self, room: String, user: String) {
        let available = !self.ctx.hub.is_name_taken(&room, &user);
        self.handle.send(
            Notice::NameCheck {
                room,
                user,
                available,
            }
            .to_string(),
        );
    }

    fn handshake(&mut self, requested: Requested) -> Flow {
        self.requested = Some(requested);
        if self.ctx.gate.is_open() {
            self.authenticated = true;
        }
        if self.authenticated {
            self.register()
        } else {
            debug!(conn = %self.handle.id(), scheme = self.ctx.gate.scheme(), "awaiting credentials");
            Flow::Continue
        }
    }

    fn authenticate(&mut self, attempt: &AuthAttempt) -> Flow {
        if self.authenticated {
            debug!(conn = %self.handle.id(), "already authenticated, ignoring AUTH");
            return Flow::Continue;
        }
        let hello_user = self
            .requested
            .as_ref()
            .map(|r| r.user.clone())
            .unwrap_or_default();

        match self.ctx.gate.verify(attempt, &hello_user) {
            Ok(user) => {
                info!(conn = %self.handle.id(), user = %user, scheme = self.ctx.gate.scheme(), "authenticated");
                self.authenticated = true;
                if let Some(requested) = self.requested.as_mut() {
                    requested.user = user;
                }
                self.register()
            }
            Err(e) => {
                let e = SessionError::AuthRejected(e);
                warn!(conn = %self.handle.id(), peer = %self.handle.addr(), error = %e, "authentication failed");
                Flow::Continue
            }
        }
    }

    /// Put the session into its requested room, evicting older sessions of
    /// the same user first.
    fn register(&mut self) -> Flow {
        let Some(requested) = self.requested.clone() else {
            return Flow::Continue;
        };
        let hub = &self.ctx.hub;

        if !requested.lane && hub.admits(&requested.room, &requested.user) {
            hub.kick(&requested.user, self.handle.id());
        }
        match hub.join(
            &self.handle,
            &requested.user,
            &requested.room,
            requested.avatar.as_deref(),
            requested.lane,
        ) {
            Ok(()) => Flow::Continue,
            Err(e) => {
                let notice = Notice::error(e.code(), Some(e.room().to_string()));
                let e = SessionError::Hub(e);
                warn!(conn = %self.handle.id(), user = %requested.user, error = %e, "join refused");
                self.handle.send(notice.to_string());
                Flow::Close
            }
        }
    }

    /// The conversation a `HIST`/`READ` target names, with the session's
    /// username.
    fn resolve(&self, target: &Target) -> Option<(ConversationId, String)> {
        let (room, user) = self.ctx.hub.session(self.handle.id())?;
        let conversation = match target {
            Target::Group => ConversationId::group(&room),
            Target::Dm(peer) => ConversationId::dm(&user, peer),
        };
        Some((conversation, user))
    }

    async fn replay_history(&self, target: Target, limit: Option<usize>) {
        let Some((conversation, _)) = self.resolve(&target) else {
            return;
        };
        let limit = limit
            .unwrap_or(self.ctx.history_limit)
            .min(MAX_HISTORY_LIMIT);

        let records = match self
            .ctx
            .hub
            .persistence()
            .load_recent(&conversation, limit)
            .await
        {
            Ok(records) => records,
            Err(e) => {
                warn!(conv = %conversation, error = %e, "history load failed");
                Vec::new()
            }
        };

        for record in &records {
            self.handle.send(
                Notice::History {
                    conversation: conversation.clone(),
                    timestamp: record.created_at.timestamp(),
                    sender: record.sender.clone(),
                    text: record.text.clone(),
                }
                .to_string(),
            );
        }
        self.handle.send(
            Notice::HistoryEnd {
                conversation,
                count: records.len(),
            }
            .to_string(),
        );
    }
}
