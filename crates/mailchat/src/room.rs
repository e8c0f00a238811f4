use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chatproto::{Message, DEFAULT_ROOM};
use tokio::sync::RwLock;

use crate::session::Session;

/// Replayed history covers at most this much wall time.
pub const HISTORY_WINDOW: Duration = Duration::from_secs(5 * 60);

const HISTORY_HEADER: &str = "--- History (last 5 min) ---";
const HISTORY_FOOTER: &str = "----------------------------";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomKind {
    Public,
    Private,
}

impl RoomKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RoomKind::Public => "public",
            RoomKind::Private => "private",
        }
    }
}

#[derive(Debug)]
struct HistoryItem {
    line: String,
    at: Instant,
}

#[derive(Default)]
struct RoomInner {
    members: HashMap<String, Arc<Session>>,
    history: Vec<HistoryItem>,
}

/// A chat room: a membership set plus a sliding-window line buffer.
///
/// Mutations (join, leave, broadcast) run under the exclusive guard, and the
/// fan-out happens inside it, so every member observes the same broadcast
/// order and a joiner's history replay can never interleave with a live
/// broadcast.
pub struct Room {
    name: String,
    kind: RoomKind,
    inner: RwLock<RoomInner>,
}

impl Room {
    pub fn new(name: impl Into<String>, kind: RoomKind) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            kind,
            inner: RwLock::new(RoomInner::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> RoomKind {
        self.kind
    }

    /// Insert `session` into the room, replaying any still-live history to it
    /// first. The member is only visible to broadcasts after the replay, so
    /// it sees: history, then its own join confirmation, then live traffic.
    pub async fn add_member(&self, session: Arc<Session>) {
        let mut inner = self.inner.write().await;

        prune(&mut inner.history, Instant::now());

        if !inner.history.is_empty() {
            let _ = session.send(Message::system(HISTORY_HEADER).format()).await;
            for item in &inner.history {
                let _ = session.send(item.line.clone()).await;
            }
            let _ = session.send(Message::system(HISTORY_FOOTER).format()).await;
        }

        let username = session.username().unwrap_or_default();
        inner.members.insert(username, session);
    }

    /// Drop a member. The caller owns any departure broadcast.
    pub async fn remove_member(&self, username: &str) {
        self.inner.write().await.members.remove(username);
    }

    /// Send `msg` to every member except `exclude_username`; the empty string
    /// excludes nobody. The formatted line is recorded in history either way.
    /// Per-peer delivery is best-effort; a dead peer is skipped and will be
    /// cleaned up by its own connection handler.
    pub async fn broadcast(&self, msg: &Message, exclude_username: &str) {
        let line = msg.format();
        let mut inner = self.inner.write().await;

        let now = Instant::now();
        inner.history.push(HistoryItem {
            line: line.clone(),
            at: now,
        });
        prune(&mut inner.history, now);

        for (username, member) in &inner.members {
            if username != exclude_username {
                let _ = member.send(line.clone()).await;
            }
        }
    }

    /// Broadcast including the sender, so it sees its own line echoed.
    pub async fn broadcast_to_all(&self, msg: &Message) {
        self.broadcast(msg, "").await;
    }

    pub async fn has_member(&self, username: &str) -> bool {
        self.inner.read().await.members.contains_key(username)
    }

    pub async fn member_count(&self) -> usize {
        self.inner.read().await.members.len()
    }

    pub async fn member_names(&self) -> Vec<String> {
        self.inner.read().await.members.keys().cloned().collect()
    }

    pub async fn members(&self) -> Vec<Arc<Session>> {
        self.inner.read().await.members.values().cloned().collect()
    }
}

/// Drop history that has aged out of the window.
///
/// Invariant after the call: every remaining item is younger than the
/// window. The all-old case clears in one shot; the mixed case compacts to
/// the live tail; the all-live case touches nothing.
fn prune(history: &mut Vec<HistoryItem>, now: Instant) {
    let Some(cutoff) = now.checked_sub(HISTORY_WINDOW) else {
        // Process younger than the window; nothing can have expired.
        return;
    };

    if history.last().is_some_and(|last| last.at < cutoff) {
        history.clear();
    } else if history.first().is_some_and(|first| first.at < cutoff) {
        history.retain(|item| item.at > cutoff);
    }
}

/// Process-wide room registry. `#general` is seeded Public at construction
/// and never reaped; every user-created room is Private and is removed once
/// its last member leaves.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    default_room: Arc<Room>,
}

impl RoomManager {
    pub fn new() -> Arc<Self> {
        let default_room = Room::new(DEFAULT_ROOM, RoomKind::Public);
        let mut rooms = HashMap::new();
        rooms.insert(DEFAULT_ROOM.to_string(), Arc::clone(&default_room));
        Arc::new(Self {
            rooms: RwLock::new(rooms),
            default_room,
        })
    }

    pub fn default_room(&self) -> Arc<Room> {
        Arc::clone(&self.default_room)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(name).cloned()
    }

    /// Get-or-create. New rooms are always Private; only the seeded default
    /// is Public.
    pub async fn create(&self, name: &str) -> Arc<Room> {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(name) {
            return Arc::clone(room);
        }
        let room = Room::new(name, RoomKind::Private);
        rooms.insert(name.to_string(), Arc::clone(&room));
        room
    }

    /// Add `session` to an existing room and point its `current_room` there.
    /// The caller owns the join broadcast, so history replay (inside
    /// `add_member`) reaches the joiner before its join notification.
    pub async fn join(&self, name: &str, session: Arc<Session>) -> anyhow::Result<()> {
        let room = self
            .get(name)
            .await
            .ok_or_else(|| anyhow::anyhow!("room '{name}' does not exist"))?;
        room.add_member(Arc::clone(&session)).await;
        session.set_current_room(Some(name.to_string()));
        Ok(())
    }

    /// Remove `session` from its current room (if any) and reap the room if
    /// it is Private and now empty.
    pub async fn leave(&self, session: &Session) {
        let Some(current) = session.current_room() else {
            return;
        };
        let Some(room) = self.get(&current).await else {
            return;
        };

        let username = session.username().unwrap_or_default();
        room.remove_member(&username).await;
        session.set_current_room(None);

        if room.kind() == RoomKind::Private {
            let mut rooms = self.rooms.write().await;
            // Re-check emptiness under the registry guard; a concurrent join
            // may have repopulated the room.
            if room.member_count().await == 0 {
                rooms.remove(&current);
            }
        }
    }

    pub async fn room_names(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }

    pub async fn room_info(&self, name: &str) -> Option<(RoomKind, usize)> {
        let room = self.get(name).await?;
        let count = room.member_count().await;
        Some((room.kind(), count))
    }
}
