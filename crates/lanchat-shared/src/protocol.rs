//! The newline-terminated UTF-8 control protocol.
//!
//! Client lines are classified once into a [`Command`] so the session state
//! machine never prefix-matches raw text. Server output is either a chat line
//! (`user> text`, `[DM] FROM ...`, `[DM] TO ...`), a correlation reply
//! (`ACK`, `PONG`) or a `[SYS]` [`Notice`]. Endpoints read it back through
//! [`ServerLine::parse`].

use std::fmt;

use crate::constants::{LANE_MARKER, SYS_PREFIX};
use crate::error::ProtocolError;
use crate::types::ConversationId;

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

/// Which conversation a `HIST` or `READ` refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// The session's current room.
    Group,
    /// The DM conversation with the named peer.
    Dm(String),
}

/// A credential presented with `AUTH` or `AUTH_JWT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthAttempt {
    /// `AUTH <user> <timestamp> <hex-hmac>`
    Hmac {
        user: String,
        timestamp: String,
        mac: String,
    },
    /// `AUTH <secret>`, kept for older clients.
    Legacy { secret: String },
    /// `AUTH_JWT <header>.<payload>.<signature>`
    Token(String),
}

/// A classified client line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Hello {
        user: String,
        room: Option<String>,
        avatar: Option<String>,
        lane: bool,
    },
    NameCheck {
        room: String,
        user: String,
    },
    Auth(AuthAttempt),
    Ping(String),
    Pong(String),
    Msg(String),
    Dm {
        target: String,
        text: String,
    },
    Hist {
        target: Target,
        limit: Option<usize>,
    },
    Unread,
    Read(Target),
    Avatar(String),
    AvatarUpload {
        file: String,
        mime: String,
        data: String,
    },
    AvatarReq(String),
}

/// A line with its optional `SEQ <n>` wrapper peeled off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope<'a> {
    pub seq: Option<u64>,
    pub body: &'a str,
}

impl<'a> Envelope<'a> {
    /// Split `SEQ <n> <body>` into its parts. Lines without a well-formed
    /// envelope come back with `seq: None` and the whole line as body.
    pub fn split(line: &'a str) -> Self {
        if let Some(rest) = line.strip_prefix("SEQ ") {
            let (num, body) = split_token(rest);
            if let Ok(seq) = num.parse::<u64>() {
                return Self {
                    seq: Some(seq),
                    body,
                };
            }
        }
        Self {
            seq: None,
            body: line,
        }
    }
}

/// Split off the first space-delimited token. The remainder keeps its
/// internal spacing so free text survives intact.
fn split_token(s: &str) -> (&str, &str) {
    match s.split_once(' ') {
        Some((head, rest)) => (head, rest),
        None => (s, ""),
    }
}

fn required<'a>(value: &'a str, name: &'static str) -> Result<&'a str, ProtocolError> {
    if value.is_empty() {
        Err(ProtocolError::MissingArgument(name))
    } else {
        Ok(value)
    }
}

fn parse_limit(raw: Option<&str>) -> Result<Option<usize>, ProtocolError> {
    match raw {
        None => Ok(None),
        Some(v) => v
            .parse::<usize>()
            .map(Some)
            .map_err(|_| ProtocolError::InvalidNumber {
                field: "limit",
                value: v.to_string(),
            }),
    }
}

fn parse_target<'a>(
    mut parts: impl Iterator<Item = &'a str>,
    name: &'static str,
) -> Result<(Target, Option<&'a str>), ProtocolError> {
    match parts.next() {
        Some(kind) if kind.eq_ignore_ascii_case("GROUP") => Ok((Target::Group, parts.next())),
        Some(kind) if kind.eq_ignore_ascii_case("DM") => {
            let peer = parts.next().ok_or(ProtocolError::MissingArgument(name))?;
            Ok((Target::Dm(peer.to_string()), parts.next()))
        }
        _ => Err(ProtocolError::MissingArgument(name)),
    }
}

impl Command {
    /// Classify one line body (envelope already removed).
    pub fn parse(body: &str) -> Result<Self, ProtocolError> {
        let body = body.trim_end_matches(['\r', '\n']);
        if body.trim().is_empty() {
            return Err(ProtocolError::Empty);
        }
        let (head, rest) = split_token(body);

        match head {
            "HELLO" => {
                let mut tokens: Vec<&str> = rest.split_whitespace().collect();
                let lane = tokens.len() > 2 && tokens.last() == Some(&LANE_MARKER);
                if lane {
                    tokens.pop();
                }
                let user = tokens.first().ok_or(ProtocolError::MissingArgument("HELLO"))?;
                Ok(Command::Hello {
                    user: user.to_string(),
                    room: tokens.get(1).map(|r| r.to_string()),
                    avatar: tokens
                        .get(2)
                        .filter(|a| **a != "-")
                        .map(|a| a.to_string()),
                    lane,
                })
            }
            "NAME_CHECK" => {
                let mut parts = rest.split_whitespace();
                let room = parts.next().ok_or(ProtocolError::MissingArgument("NAME_CHECK"))?;
                let user = parts.next().ok_or(ProtocolError::MissingArgument("NAME_CHECK"))?;
                Ok(Command::NameCheck {
                    room: room.to_string(),
                    user: user.to_string(),
                })
            }
            "AUTH" => {
                let tokens: Vec<&str> = rest.split_whitespace().collect();
                match tokens.as_slice() {
                    [user, timestamp, mac] => Ok(Command::Auth(AuthAttempt::Hmac {
                        user: user.to_string(),
                        timestamp: timestamp.to_string(),
                        mac: mac.to_string(),
                    })),
                    [] => Err(ProtocolError::MissingArgument("AUTH")),
                    _ => Ok(Command::Auth(AuthAttempt::Legacy {
                        secret: rest.trim().to_string(),
                    })),
                }
            }
            "AUTH_JWT" => {
                let token = required(rest.trim(), "AUTH_JWT")?;
                Ok(Command::Auth(AuthAttempt::Token(token.to_string())))
            }
            "PING" => Ok(Command::Ping(rest.to_string())),
            "PONG" => Ok(Command::Pong(rest.to_string())),
            "MSG" => Ok(Command::Msg(required(rest, "MSG")?.to_string())),
            "DM" => {
                let (target, text) = split_token(rest);
                let target = required(target, "DM")?;
                let text = required(text, "DM")?;
                Ok(Command::Dm {
                    target: target.to_string(),
                    text: text.to_string(),
                })
            }
            "HIST" => {
                let (target, limit) = parse_target(rest.split_whitespace(), "HIST")?;
                Ok(Command::Hist {
                    target,
                    limit: parse_limit(limit)?,
                })
            }
            "UNREAD" => Ok(Command::Unread),
            "READ" => {
                let (target, _) = parse_target(rest.split_whitespace(), "READ")?;
                Ok(Command::Read(target))
            }
            "AVATAR" => Ok(Command::Avatar(required(rest.trim(), "AVATAR")?.to_string())),
            "AVATAR_UPLOAD" => {
                let mut parts = rest.split_whitespace();
                let file = parts.next().ok_or(ProtocolError::MissingArgument("AVATAR_UPLOAD"))?;
                let mime = parts.next().ok_or(ProtocolError::MissingArgument("AVATAR_UPLOAD"))?;
                let data = parts.next().ok_or(ProtocolError::MissingArgument("AVATAR_UPLOAD"))?;
                Ok(Command::AvatarUpload {
                    file: file.to_string(),
                    mime: mime.to_string(),
                    data: data.to_string(),
                })
            }
            "AVATAR_REQ" => Ok(Command::AvatarReq(
                required(rest.trim(), "AVATAR_REQ")?.to_string(),
            )),
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Group => f.write_str("GROUP"),
            Target::Dm(peer) => write!(f, "DM {peer}"),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Hello {
                user,
                room,
                avatar,
                lane,
            } => {
                write!(f, "HELLO {user}")?;
                if let Some(room) = room {
                    write!(f, " {room}")?;
                    match (avatar, lane) {
                        (Some(avatar), _) => write!(f, " {avatar}")?,
                        (None, true) => f.write_str(" -")?,
                        (None, false) => {}
                    }
                    if *lane {
                        write!(f, " {LANE_MARKER}")?;
                    }
                }
                Ok(())
            }
            Command::NameCheck { room, user } => write!(f, "NAME_CHECK {room} {user}"),
            Command::Auth(AuthAttempt::Hmac {
                user,
                timestamp,
                mac,
            }) => write!(f, "AUTH {user} {timestamp} {mac}"),
            Command::Auth(AuthAttempt::Legacy { secret }) => write!(f, "AUTH {secret}"),
            Command::Auth(AuthAttempt::Token(token)) => write!(f, "AUTH_JWT {token}"),
            Command::Ping(token) => write!(f, "PING {token}"),
            Command::Pong(token) => write!(f, "PONG {token}"),
            Command::Msg(text) => write!(f, "MSG {text}"),
            Command::Dm { target, text } => write!(f, "DM {target} {text}"),
            Command::Hist { target, limit } => match limit {
                Some(n) => write!(f, "HIST {target} {n}"),
                None => write!(f, "HIST {target}"),
            },
            Command::Unread => f.write_str("UNREAD"),
            Command::Read(target) => write!(f, "READ {target}"),
            Command::Avatar(file) => write!(f, "AVATAR {file}"),
            Command::AvatarUpload { file, mime, data } => {
                write!(f, "AVATAR_UPLOAD {file} {mime} {data}")
            }
            Command::AvatarReq(user) => write!(f, "AVATAR_REQ {user}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

/// One entry of a `USERS` roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub user: String,
    pub avatar: Option<String>,
}

/// A `[SYS]` notice emitted by the hub or a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Join {
        room: String,
        user: String,
        avatar: Option<String>,
    },
    Leave {
        room: String,
        user: String,
    },
    Users {
        room: String,
        users: Vec<RosterEntry>,
    },
    RoomName {
        room: String,
        name: String,
    },
    Avatar {
        user: String,
        file: String,
    },
    AvatarData {
        user: String,
        file: String,
        mime: String,
        data: String,
    },
    History {
        conversation: ConversationId,
        timestamp: i64,
        sender: String,
        text: String,
    },
    HistoryEnd {
        conversation: ConversationId,
        count: usize,
    },
    Unread(Vec<(ConversationId, u64)>),
    Error {
        code: String,
        detail: Option<String>,
    },
    KickedLoginConflict,
    NameCheck {
        room: String,
        user: String,
        available: bool,
    },
}

impl Notice {
    pub fn error(code: &str, detail: Option<String>) -> Self {
        Notice::Error {
            code: code.to_string(),
            detail,
        }
    }

    /// Parse the part of a line after `[SYS] `.
    pub fn parse(rest: &str) -> Option<Self> {
        let (kind, args) = split_token(rest);
        let mut parts = args.split_whitespace();
        let notice = match kind {
            "JOIN" => Notice::Join {
                room: parts.next()?.to_string(),
                user: parts.next()?.to_string(),
                avatar: parts.next().map(str::to_string),
            },
            "LEAVE" => Notice::Leave {
                room: parts.next()?.to_string(),
                user: parts.next()?.to_string(),
            },
            "USERS" => {
                let room = parts.next()?.to_string();
                let users = parts
                    .next()
                    .unwrap_or("")
                    .split(',')
                    .filter(|e| !e.is_empty())
                    .map(|e| match e.split_once(':') {
                        Some((user, avatar)) => RosterEntry {
                            user: user.to_string(),
                            avatar: Some(avatar.to_string()),
                        },
                        None => RosterEntry {
                            user: e.to_string(),
                            avatar: None,
                        },
                    })
                    .collect();
                Notice::Users { room, users }
            }
            "ROOM_NAME" => {
                let (room, name) = split_token(args);
                Notice::RoomName {
                    room: room.to_string(),
                    name: name.to_string(),
                }
            }
            "AVATAR" => Notice::Avatar {
                user: parts.next()?.to_string(),
                file: parts.next()?.to_string(),
            },
            "AVATAR_DATA" => Notice::AvatarData {
                user: parts.next()?.to_string(),
                file: parts.next()?.to_string(),
                mime: parts.next()?.to_string(),
                data: parts.next()?.to_string(),
            },
            "HISTORY" => {
                let (conv, rest) = split_token(args);
                let (ts, rest) = split_token(rest);
                let (sender, text) = split_token(rest);
                Notice::History {
                    conversation: ConversationId::from_raw(conv),
                    timestamp: ts.parse().ok()?,
                    sender: sender.to_string(),
                    text: text.to_string(),
                }
            }
            "HISTORY_END" => Notice::HistoryEnd {
                conversation: ConversationId::from_raw(parts.next()?),
                count: parts.next()?.parse().ok()?,
            },
            "UNREAD" => Notice::Unread(
                parts
                    .filter_map(|pair| {
                        let (conv, n) = pair.rsplit_once('=')?;
                        Some((ConversationId::from_raw(conv), n.parse().ok()?))
                    })
                    .collect(),
            ),
            "ERROR" => {
                let (code, detail) = split_token(args);
                Notice::Error {
                    code: code.to_string(),
                    detail: (!detail.is_empty()).then(|| detail.to_string()),
                }
            }
            "KICKED_LOGIN_CONFLICT" => Notice::KickedLoginConflict,
            "NAME_CHECK" => Notice::NameCheck {
                room: parts.next()?.to_string(),
                user: parts.next()?.to_string(),
                available: parts.next()? == "AVAILABLE",
            },
            _ => return None,
        };
        Some(notice)
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(SYS_PREFIX)?;
        match self {
            Notice::Join { room, user, avatar } => match avatar {
                Some(avatar) => write!(f, "JOIN {room} {user} {avatar}"),
                None => write!(f, "JOIN {room} {user}"),
            },
            Notice::Leave { room, user } => write!(f, "LEAVE {room} {user}"),
            Notice::Users { room, users } => {
                write!(f, "USERS {room} ")?;
                for (i, entry) in users.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    f.write_str(&entry.user)?;
                    if let Some(avatar) = &entry.avatar {
                        write!(f, ":{avatar}")?;
                    }
                }
                Ok(())
            }
            Notice::RoomName { room, name } => write!(f, "ROOM_NAME {room} {name}"),
            Notice::Avatar { user, file } => write!(f, "AVATAR {user} {file}"),
            Notice::AvatarData {
                user,
                file,
                mime,
                data,
            } => write!(f, "AVATAR_DATA {user} {file} {mime} {data}"),
            Notice::History {
                conversation,
                timestamp,
                sender,
                text,
            } => write!(f, "HISTORY {conversation} {timestamp} {sender} {text}"),
            Notice::HistoryEnd {
                conversation,
                count,
            } => write!(f, "HISTORY_END {conversation} {count}"),
            Notice::Unread(counts) => {
                f.write_str("UNREAD")?;
                for (conv, n) in counts {
                    write!(f, " {conv}={n}")?;
                }
                Ok(())
            }
            Notice::Error { code, detail } => match detail {
                Some(detail) => write!(f, "ERROR {code} {detail}"),
                None => write!(f, "ERROR {code}"),
            },
            Notice::KickedLoginConflict => f.write_str("KICKED_LOGIN_CONFLICT"),
            Notice::NameCheck {
                room,
                user,
                available,
            } => {
                let verdict = if *available { "AVAILABLE" } else { "TAKEN" };
                write!(f, "NAME_CHECK {room} {user} {verdict}")
            }
        }
    }
}

pub fn group_line(user: &str, text: &str) -> String {
    format!("{user}> {text}")
}

pub fn dm_from_line(origin: &str, text: &str) -> String {
    format!("[DM] FROM {origin} {text}")
}

pub fn dm_to_line(target: &str, text: &str) -> String {
    format!("[DM] TO {target} {text}")
}

pub fn ack_line(seq: u64) -> String {
    format!("ACK {seq}")
}

pub fn pong_line(token: &str) -> String {
    format!("PONG {token}")
}

/// A line received from the server, as seen by an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerLine {
    Ack(u64),
    Ping(String),
    Pong(String),
    Notice(Notice),
    Group { from: String, text: String },
    DmFrom { from: String, text: String },
    DmTo { to: String, text: String },
    Other(String),
}

impl ServerLine {
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);

        if let Some(rest) = line.strip_prefix(SYS_PREFIX) {
            return match Notice::parse(rest) {
                Some(notice) => ServerLine::Notice(notice),
                None => ServerLine::Other(line.to_string()),
            };
        }
        if let Some(rest) = line.strip_prefix("[DM] FROM ") {
            let (from, text) = split_token(rest);
            return ServerLine::DmFrom {
                from: from.to_string(),
                text: text.to_string(),
            };
        }
        if let Some(rest) = line.strip_prefix("[DM] TO ") {
            let (to, text) = split_token(rest);
            return ServerLine::DmTo {
                to: to.to_string(),
                text: text.to_string(),
            };
        }
        if let Some(n) = line.strip_prefix("ACK ") {
            if let Ok(seq) = n.trim().parse() {
                return ServerLine::Ack(seq);
            }
        }
        if let Some(token) = line.strip_prefix("PONG ") {
            return ServerLine::Pong(token.to_string());
        }
        if let Some(token) = line.strip_prefix("PING ") {
            return ServerLine::Ping(token.to_string());
        }
        if let Some((from, text)) = line.split_once("> ") {
            if !from.is_empty() && !from.contains(' ') {
                return ServerLine::Group {
                    from: from.to_string(),
                    text: text.to_string(),
                };
            }
        }
        ServerLine::Other(line.to_string())
    }
}
