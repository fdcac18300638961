//! Room and presence registry.
//!
//! One mutex guards every map. Operations compute what each connection
//! should receive while holding it, then release the lock and push lines
//! into the connections' outbound queues. Those queues are unbounded and
//! drained by per-connection writer tasks, so a slow or dead peer never
//! stalls the registry or other recipients.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use base64::Engine;
use lanchat_shared::protocol::{dm_from_line, dm_to_line, group_line, Notice, RosterEntry};
use lanchat_shared::transfer::{is_bulk_payload, is_transfer_payload, CHUNK_ENGINE};
use lanchat_shared::ConversationId;
use lanchat_store::Room;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info};

use crate::error::HubError;
use crate::persist::Persistence;
use crate::unread::UnreadTracker;

// ---------------------------------------------------------------------------
// Connection handles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
pub enum Outbound {
    Line(String),
    /// Flush what is queued, then shut the socket down.
    Close,
}

/// The write side of a connection as seen by everyone but its own session.
#[derive(Debug, Clone)]
pub struct ConnHandle {
    id: ConnId,
    addr: SocketAddr,
    tx: mpsc::UnboundedSender<Outbound>,
    shutdown: Arc<Notify>,
}

impl ConnHandle {
    pub fn new(id: ConnId, addr: SocketAddr) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            id,
            addr,
            tx,
            shutdown: Arc::new(Notify::new()),
        };
        (handle, rx)
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Queue a line. Returns `false` if the connection is already gone.
    pub fn send(&self, line: impl Into<String>) -> bool {
        self.tx.send(Outbound::Line(line.into())).is_ok()
    }

    /// Ask the connection to flush and close, and wake its read loop.
    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
        self.shutdown.notify_one();
    }

    pub fn shutdown_signal(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

struct Member {
    handle: ConnHandle,
    username: String,
    /// Auxiliary transfer connection: routed like its owner, invisible to
    /// presence and never a delivery target.
    lane: bool,
}

struct RoomState {
    display_name: String,
    acl: Option<HashSet<String>>,
    members: BTreeMap<ConnId, Member>,
}

impl RoomState {
    fn open(id: &str) -> Self {
        Self {
            display_name: id.to_string(),
            acl: None,
            members: BTreeMap::new(),
        }
    }

    fn admits(&self, username: &str) -> bool {
        self.acl.as_ref().map_or(true, |acl| acl.contains(username))
    }
}

/// Avatar bytes keyed by content hash.
struct AvatarBlob {
    mime: String,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct HubState {
    rooms: HashMap<String, RoomState>,
    /// Reverse index: connection -> room.
    conns: HashMap<ConnId, String>,
    /// username -> avatar file name.
    avatars: HashMap<String, String>,
    /// username -> hash into `avatar_blobs`.
    avatar_refs: HashMap<String, String>,
    avatar_blobs: HashMap<String, AvatarBlob>,
}

impl HubState {
    fn room_mut(&mut self, room: &str) -> &mut RoomState {
        self.rooms
            .entry(room.to_string())
            .or_insert_with(|| RoomState::open(room))
    }

    /// Non-lane handles and the roster of a room.
    fn presence(&self, room: &str) -> (Vec<ConnHandle>, Vec<RosterEntry>) {
        let Some(state) = self.rooms.get(room) else {
            return (Vec::new(), Vec::new());
        };
        let mut handles = Vec::new();
        let mut roster = Vec::new();
        let mut seen = HashSet::new();
        for member in state.members.values().filter(|m| !m.lane) {
            handles.push(member.handle.clone());
            if seen.insert(member.username.as_str()) {
                roster.push(RosterEntry {
                    user: member.username.clone(),
                    avatar: self.avatars.get(&member.username).cloned(),
                });
            }
        }
        (handles, roster)
    }

    fn detach(&mut self, conn: ConnId) -> Option<(String, Member)> {
        let room = self.conns.remove(&conn)?;
        let member = self.rooms.get_mut(&room)?.members.remove(&conn)?;
        Some((room, member))
    }

    /// Tell the rest of the room that `member` left.
    fn announce_departure(&self, room: &str, member: &Member, outbox: &mut Outbox) {
        if member.lane {
            return;
        }
        let (handles, roster) = self.presence(room);
        outbox.to_all(
            &handles,
            Notice::Leave {
                room: room.to_string(),
                user: member.username.clone(),
            },
        );
        outbox.to_all(
            &handles,
            Notice::Users {
                room: room.to_string(),
                users: roster,
            },
        );
    }

    fn announce_roster(&self, room: &str, outbox: &mut Outbox) {
        let (handles, roster) = self.presence(room);
        outbox.to_all(
            &handles,
            Notice::Users {
                room: room.to_string(),
                users: roster,
            },
        );
    }

    /// Remove every member of `room` matching `evict`, sending each one
    /// `notice` before closing it. The rest of the room sees them leave.
    fn evict_where(
        &mut self,
        room: &str,
        evict: impl Fn(&Member) -> bool,
        notice: &Notice,
        outbox: &mut Outbox,
    ) -> usize {
        let victims: Vec<ConnId> = match self.rooms.get(room) {
            Some(state) => state
                .members
                .iter()
                .filter(|(_, m)| evict(m))
                .map(|(id, _)| *id)
                .collect(),
            None => return 0,
        };
        let mut departed = Vec::new();
        for id in &victims {
            if let Some((_, member)) = self.detach(*id) {
                outbox.push(&member.handle, notice);
                outbox.close(&member.handle);
                if !member.lane {
                    departed.push(member.username);
                }
            }
        }
        if !departed.is_empty() {
            let (handles, _) = self.presence(room);
            for user in departed {
                outbox.to_all(
                    &handles,
                    Notice::Leave {
                        room: room.to_string(),
                        user,
                    },
                );
            }
            self.announce_roster(room, outbox);
        }
        victims.len()
    }
}

/// Lines and closes computed under the lock, executed after it.
#[derive(Default)]
struct Outbox {
    lines: Vec<(ConnHandle, String)>,
    closes: Vec<ConnHandle>,
}

impl Outbox {
    fn push(&mut self, handle: &ConnHandle, line: impl ToString) {
        self.lines.push((handle.clone(), line.to_string()));
    }

    fn to_all(&mut self, handles: &[ConnHandle], line: impl ToString) {
        let line = line.to_string();
        for handle in handles {
            self.lines.push((handle.clone(), line.clone()));
        }
    }

    fn close(&mut self, handle: &ConnHandle) {
        self.closes.push(handle.clone());
    }

    fn deliver(self) {
        for (handle, line) in self.lines {
            handle.send(line);
        }
        for handle in self.closes {
            handle.close();
        }
    }
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

pub struct Hub {
    state: Mutex<HubState>,
    default_room: String,
    persist: Persistence,
    unread: Arc<UnreadTracker>,
}

impl Hub {
    pub fn new(default_room: &str, persist: Persistence, unread: Arc<UnreadTracker>) -> Self {
        let mut state = HubState::default();
        state.room_mut(default_room);
        Self {
            state: Mutex::new(state),
            default_room: default_room.to_string(),
            persist,
            unread,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn default_room(&self) -> &str {
        &self.default_room
    }

    pub fn persistence(&self) -> &Persistence {
        &self.persist
    }

    pub fn unread(&self) -> &UnreadTracker {
        &self.unread
    }

    /// Seed room definitions loaded from the store.
    pub fn load_rooms(&self, rooms: &[Room]) {
        let mut state = self.lock();
        for room in rooms {
            let acl = if room.id == self.default_room {
                None
            } else {
                room.members.as_ref().map(|m| m.iter().cloned().collect())
            };
            let entry = state.room_mut(&room.id);
            entry.display_name = room.name.clone();
            entry.acl = acl;
        }
        debug!(count = rooms.len(), "room definitions loaded");
    }

    // ------------------------------------------------------------------
    // Presence
    // ------------------------------------------------------------------

    /// Register `handle` as `username` in `room`, leaving any room it was
    /// in before. Refused without side effects when the room's membership
    /// set excludes the user.
    pub fn join(
        &self,
        handle: &ConnHandle,
        username: &str,
        room: &str,
        avatar: Option<&str>,
        lane: bool,
    ) -> Result<(), HubError> {
        let mut outbox = Outbox::default();
        {
            let mut state = self.lock();
            if let Some(existing) = state.rooms.get(room) {
                if !existing.admits(username) {
                    return Err(HubError::AclDenied(room.to_string()));
                }
            }

            if let Some((old_room, member)) = state.detach(handle.id) {
                state.announce_departure(&old_room, &member, &mut outbox);
            }
            if let Some(file) = avatar {
                state.avatars.insert(username.to_string(), file.to_string());
            }

            let target = state.room_mut(room);
            target.members.insert(
                handle.id,
                Member {
                    handle: handle.clone(),
                    username: username.to_string(),
                    lane,
                },
            );
            let display_name = target.display_name.clone();
            state.conns.insert(handle.id, room.to_string());

            if !lane {
                outbox.push(
                    handle,
                    Notice::RoomName {
                        room: room.to_string(),
                        name: display_name,
                    },
                );
                let (handles, roster) = state.presence(room);
                outbox.to_all(
                    &handles,
                    Notice::Join {
                        room: room.to_string(),
                        user: username.to_string(),
                        avatar: state.avatars.get(username).cloned(),
                    },
                );
                outbox.to_all(
                    &handles,
                    Notice::Users {
                        room: room.to_string(),
                        users: roster,
                    },
                );
            }
        }
        outbox.deliver();

        if lane {
            debug!(conn = %handle.id, user = %username, room = %room, "transfer lane joined");
        } else {
            info!(conn = %handle.id, user = %username, room = %room, "joined");
            self.persist.register_user(username);
        }
        Ok(())
    }

    /// Deregister a connection. Returns `true` if it was registered.
    pub fn leave(&self, conn: ConnId) -> bool {
        let mut outbox = Outbox::default();
        let left = {
            let mut state = self.lock();
            match state.detach(conn) {
                Some((room, member)) => {
                    state.announce_departure(&room, &member, &mut outbox);
                    Some((room, member.username))
                }
                None => None,
            }
        };
        outbox.deliver();

        match left {
            Some((room, user)) => {
                debug!(conn = %conn, user = %user, room = %room, "left");
                true
            }
            None => false,
        }
    }

    /// Evict every live session of `username` except `keep`, in every room,
    /// after sending each `KICKED_LOGIN_CONFLICT`. Transfer lanes are left
    /// alone.
    pub fn kick(&self, username: &str, keep: ConnId) -> usize {
        let mut outbox = Outbox::default();
        let mut kicked = 0;
        {
            let mut state = self.lock();
            let rooms: Vec<String> = state.rooms.keys().cloned().collect();
            for room in rooms {
                kicked += state.evict_where(
                    &room,
                    |m| !m.lane && m.username == username && m.handle.id != keep,
                    &Notice::KickedLoginConflict,
                    &mut outbox,
                );
            }
        }
        outbox.deliver();

        if kicked > 0 {
            info!(user = %username, sessions = kicked, "kicked on login conflict");
        }
        kicked
    }

    /// Whether `room` would let `username` in. Unknown rooms are open.
    pub fn admits(&self, room: &str, username: &str) -> bool {
        self.lock().rooms.get(room).map_or(true, |r| r.admits(username))
    }

    /// Whether a visible session named `username` is present in `room`.
    pub fn is_name_taken(&self, room: &str, username: &str) -> bool {
        let state = self.lock();
        state.rooms.get(room).map_or(false, |r| {
            r.members
                .values()
                .any(|m| !m.lane && m.username == username)
        })
    }

    /// `(room, username)` of a registered connection.
    pub fn session(&self, conn: ConnId) -> Option<(String, String)> {
        let state = self.lock();
        let room = state.conns.get(&conn)?;
        let member = state.rooms.get(room)?.members.get(&conn)?;
        Some((room.clone(), member.username.clone()))
    }

    pub fn users(&self, room: &str) -> Vec<RosterEntry> {
        self.lock().presence(room).1
    }

    pub fn online_count(&self, room: &str) -> usize {
        self.lock().presence(room).0.len()
    }

    // ------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------

    /// Deliver `user> text` to everyone in the origin's room except the
    /// origin's own sessions. Returns `false` if the origin is not
    /// registered.
    pub fn broadcast_text(&self, origin: ConnId, text: &str) -> bool {
        let (room, user, recipients) = {
            let state = self.lock();
            let Some(room) = state.conns.get(&origin) else {
                return false;
            };
            let Some(room_state) = state.rooms.get(room) else {
                return false;
            };
            let Some(sender) = room_state.members.get(&origin) else {
                return false;
            };
            let recipients: Vec<(ConnHandle, String)> = room_state
                .members
                .iter()
                .filter(|(id, m)| **id != origin && !m.lane && m.username != sender.username)
                .map(|(_, m)| (m.handle.clone(), m.username.clone()))
                .collect();
            (room.clone(), sender.username.clone(), recipients)
        };

        let conversation = ConversationId::group(&room);
        self.persist.save(&conversation, &user, text);

        let line = group_line(&user, text);
        for (handle, _) in &recipients {
            handle.send(line.clone());
        }
        if !is_transfer_payload(text) {
            let mut counted = HashSet::new();
            for (_, name) in &recipients {
                if counted.insert(name.as_str()) {
                    self.unread.increment(name, &conversation);
                }
            }
        }
        true
    }

    /// Deliver a DM to `target`'s sessions in the origin's room and echo it
    /// back to the origin. Nobody else sees it. Returns `false` if the
    /// origin is not registered.
    pub fn send_dm(&self, origin: ConnId, target: &str, text: &str) -> bool {
        let (user, origin_handle, targets) = {
            let state = self.lock();
            let Some(room) = state.conns.get(&origin) else {
                return false;
            };
            let Some(room_state) = state.rooms.get(room) else {
                return false;
            };
            let Some(sender) = room_state.members.get(&origin) else {
                return false;
            };
            let targets: Vec<ConnHandle> = room_state
                .members
                .iter()
                .filter(|(id, m)| **id != origin && !m.lane && m.username == target)
                .map(|(_, m)| m.handle.clone())
                .collect();
            (sender.username.clone(), sender.handle.clone(), targets)
        };

        let conversation = ConversationId::dm(&user, target);
        self.persist.save(&conversation, &user, text);

        let line = dm_from_line(&user, text);
        for handle in &targets {
            handle.send(line.clone());
        }
        if !is_bulk_payload(text) {
            origin_handle.send(dm_to_line(target, text));
        }
        if !is_transfer_payload(text) && target != user {
            self.unread.increment(target, &conversation);
        }
        true
    }

    // ------------------------------------------------------------------
    // Avatars
    // ------------------------------------------------------------------

    /// Record the avatar file name of the origin's user and re-announce
    /// the roster.
    pub fn set_avatar(&self, origin: ConnId, file: &str) -> bool {
        let mut outbox = Outbox::default();
        {
            let mut state = self.lock();
            let Some((room, user)) = Self::locate(&state, origin) else {
                return false;
            };
            state.avatars.insert(user.clone(), file.to_string());
            Self::announce_avatar(&state, &room, &user, file, &mut outbox);
        }
        outbox.deliver();
        true
    }

    /// Store avatar bytes for the origin's user. Returns `false` when the
    /// origin is not registered or the payload is not base64.
    pub fn set_avatar_data(&self, origin: ConnId, file: &str, mime: &str, data: &str) -> bool {
        let Ok(bytes) = CHUNK_ENGINE.decode(data.trim()) else {
            return false;
        };
        let hash = blake3::hash(&bytes).to_hex().to_string();

        let mut outbox = Outbox::default();
        {
            let mut state = self.lock();
            let Some((room, user)) = Self::locate(&state, origin) else {
                return false;
            };
            state
                .avatar_blobs
                .entry(hash.clone())
                .or_insert_with(|| AvatarBlob {
                    mime: mime.to_string(),
                    bytes,
                });
            state.avatar_refs.insert(user.clone(), hash);
            state.avatars.insert(user.clone(), file.to_string());
            Self::announce_avatar(&state, &room, &user, file, &mut outbox);
        }
        outbox.deliver();
        true
    }

    /// The cached avatar of `user`, ready to send.
    pub fn avatar_data(&self, user: &str) -> Option<Notice> {
        let state = self.lock();
        let hash = state.avatar_refs.get(user)?;
        let blob = state.avatar_blobs.get(hash)?;
        let file = state.avatars.get(user).cloned().unwrap_or_else(|| hash.clone());
        Some(Notice::AvatarData {
            user: user.to_string(),
            file,
            mime: blob.mime.clone(),
            data: CHUNK_ENGINE.encode(&blob.bytes),
        })
    }

    fn locate(state: &HubState, conn: ConnId) -> Option<(String, String)> {
        let room = state.conns.get(&conn)?;
        let member = state.rooms.get(room)?.members.get(&conn)?;
        Some((room.clone(), member.username.clone()))
    }

    fn announce_avatar(state: &HubState, room: &str, user: &str, file: &str, outbox: &mut Outbox) {
        let (handles, roster) = state.presence(room);
        outbox.to_all(
            &handles,
            Notice::Avatar {
                user: user.to_string(),
                file: file.to_string(),
            },
        );
        outbox.to_all(
            &handles,
            Notice::Users {
                room: room.to_string(),
                users: roster,
            },
        );
    }

    // ------------------------------------------------------------------
    // Administration
    // ------------------------------------------------------------------

    fn guard_default(&self, room: &str) -> Result<(), HubError> {
        if room == self.default_room {
            Err(HubError::ProtectedRoom(room.to_string()))
        } else {
            Ok(())
        }
    }

    /// Create or replace a room definition.
    pub fn define_room(
        &self,
        room: &str,
        name: &str,
        members: Option<Vec<String>>,
    ) -> Result<(), HubError> {
        self.guard_default(room)?;
        let mut outbox = Outbox::default();
        {
            let mut state = self.lock();
            Self::apply_name(&mut state, room, name, &mut outbox);
            Self::apply_acl(&mut state, room, members, &mut outbox);
        }
        outbox.deliver();
        info!(room = %room, "room defined");
        Ok(())
    }

    pub fn rename_room(&self, room: &str, name: &str) -> Result<(), HubError> {
        self.guard_default(room)?;
        let mut outbox = Outbox::default();
        Self::apply_name(&mut self.lock(), room, name, &mut outbox);
        outbox.deliver();
        Ok(())
    }

    /// Replace a room's membership set. `None` opens it. Members that are
    /// no longer admitted are disconnected.
    pub fn set_room_members(
        &self,
        room: &str,
        members: Option<Vec<String>>,
    ) -> Result<usize, HubError> {
        self.guard_default(room)?;
        let mut outbox = Outbox::default();
        let evicted = Self::apply_acl(&mut self.lock(), room, members, &mut outbox);
        outbox.deliver();
        if evicted > 0 {
            info!(room = %room, evicted, "members removed by ACL change");
        }
        Ok(evicted)
    }

    /// Drop a room, disconnecting everyone in it.
    pub fn delete_room(&self, room: &str) -> Result<usize, HubError> {
        self.guard_default(room)?;
        let mut outbox = Outbox::default();
        let evicted = {
            let mut state = self.lock();
            let notice = Notice::error("ROOM_DELETED", Some(room.to_string()));
            let n = state.evict_where(room, |_| true, &notice, &mut outbox);
            state.rooms.remove(room);
            n
        };
        outbox.deliver();
        info!(room = %room, evicted, "room deleted");
        Ok(evicted)
    }

    /// Disconnect every session of a deleted user and forget their avatar
    /// and unread counters.
    pub fn evict_user(&self, username: &str) -> usize {
        let mut outbox = Outbox::default();
        let mut evicted = 0;
        {
            let mut state = self.lock();
            let notice = Notice::error("USER_DELETED", None);
            let rooms: Vec<String> = state.rooms.keys().cloned().collect();
            for room in rooms {
                evicted += state.evict_where(&room, |m| m.username == username, &notice, &mut outbox);
            }
            state.avatars.remove(username);
            state.avatar_refs.remove(username);
        }
        outbox.deliver();
        self.unread.forget_user(username);
        info!(user = %username, evicted, "user deleted");
        evicted
    }

    fn apply_name(state: &mut HubState, room: &str, name: &str, outbox: &mut Outbox) {
        let entry = state.room_mut(room);
        if entry.display_name == name {
            return;
        }
        entry.display_name = name.to_string();
        let (handles, _) = state.presence(room);
        outbox.to_all(
            &handles,
            Notice::RoomName {
                room: room.to_string(),
                name: name.to_string(),
            },
        );
    }

    fn apply_acl(
        state: &mut HubState,
        room: &str,
        members: Option<Vec<String>>,
        outbox: &mut Outbox,
    ) -> usize {
        let acl: Option<HashSet<String>> = members.map(|m| m.into_iter().collect());
        let entry = state.room_mut(room);
        entry.acl = acl.clone();
        let Some(acl) = acl else {
            return 0;
        };
        let notice = Notice::error("ACL_REVOKED", Some(room.to_string()));
        state.evict_where(room, |m| !acl.contains(&m.username), &notice, outbox)
    }
}
