//! Group chat (MUC) membership tracking.
//!
//! Joins are confirmed by the room reflecting the occupant's own presence
//! (XEP-0045 status code 110) and rejected by an error presence from the
//! room JID. The registry owns all memberships for a connection and the
//! waiters for joins still in flight; the dispatch loop feeds it every
//! inbound presence.

use std::collections::HashMap;
use std::sync::Mutex;

use jid::{BareJid, Jid};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use xmpp_parsers::muc::user::{MucUser, Status};
use xmpp_parsers::presence::{Presence, Type as PresenceType};

use crate::error::{ClientError, RoomJoinCondition};

/// Membership in a single chat room. At most one per room per connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomMembership {
    /// The room's bare JID
    pub room: BareJid,
    /// The nickname occupied in the room
    pub nickname: String,
    /// Whether the server has confirmed the join
    pub joined: bool,
}

struct PendingJoin {
    nickname: String,
    waiter: oneshot::Sender<Result<RoomMembership, ClientError>>,
}

#[derive(Default)]
struct RegistryInner {
    rooms: HashMap<BareJid, RoomMembership>,
    pending: HashMap<BareJid, PendingJoin>,
}

/// Registry of room memberships and in-flight joins for one connection.
#[derive(Default)]
pub(crate) struct RoomRegistry {
    inner: Mutex<RegistryInner>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an in-flight join and return the receiver the caller
    /// awaits. A second concurrent join for the same room is misuse.
    pub fn begin_join(
        &self,
        room: BareJid,
        nickname: String,
    ) -> Result<oneshot::Receiver<Result<RoomMembership, ClientError>>, ClientError> {
        let mut inner = self.inner.lock().expect("room registry lock poisoned");
        if inner.pending.contains_key(&room) {
            return Err(ClientError::protocol(format!(
                "a join for room {} is already in flight",
                room
            )));
        }

        let (tx, rx) = oneshot::channel();
        inner.pending.insert(
            room,
            PendingJoin {
                nickname,
                waiter: tx,
            },
        );
        Ok(rx)
    }

    /// Drop an in-flight join (cancelled or its send failed).
    pub fn abort_join(&self, room: &BareJid) {
        let mut inner = self.inner.lock().expect("room registry lock poisoned");
        inner.pending.remove(room);
    }

    /// Current membership for a room, if joined.
    pub fn membership(&self, room: &BareJid) -> Option<RoomMembership> {
        let inner = self.inner.lock().expect("room registry lock poisoned");
        inner.rooms.get(room).cloned()
    }

    /// Whether a joined membership exists for the room.
    pub fn is_joined(&self, room: &BareJid) -> bool {
        self.membership(room).map(|m| m.joined).unwrap_or(false)
    }

    /// All currently joined rooms.
    pub fn joined_rooms(&self) -> Vec<RoomMembership> {
        let inner = self.inner.lock().expect("room registry lock poisoned");
        inner.rooms.values().cloned().collect()
    }

    /// Remove a membership (leave). Idempotent.
    pub fn remove(&self, room: &BareJid) -> Option<RoomMembership> {
        let mut inner = self.inner.lock().expect("room registry lock poisoned");
        inner.rooms.remove(room)
    }

    /// Route an inbound presence stanza: confirm or reject in-flight
    /// joins, and track membership loss.
    pub fn handle_presence(&self, presence: &Presence) {
        let Some(from) = presence.from.clone() else {
            return;
        };
        let (room, nick) = split_occupant_jid(from);

        match presence.type_ {
            PresenceType::Error => self.handle_join_error(&room, presence),
            PresenceType::None => self.handle_available(&room, nick, presence),
            PresenceType::Unavailable => self.handle_unavailable(&room, nick, presence),
            _ => {}
        }
    }

    fn handle_join_error(&self, room: &BareJid, presence: &Presence) {
        let mut inner = self.inner.lock().expect("room registry lock poisoned");
        let Some(pending) = inner.pending.remove(room) else {
            debug!(room = %room, "error presence for room with no join in flight");
            return;
        };

        let condition = presence_error_condition(presence)
            .map(|name| RoomJoinCondition::from_condition_name(&name))
            .unwrap_or_else(|| RoomJoinCondition::Other("undefined-condition".to_string()));

        warn!(room = %room, condition = %condition, "room rejected join");
        let _ = pending.waiter.send(Err(ClientError::RoomJoin {
            room: room.clone(),
            condition,
        }));
    }

    fn handle_available(&self, room: &BareJid, nick: Option<String>, presence: &Presence) {
        let is_self = is_self_presence(presence);

        let mut inner = self.inner.lock().expect("room registry lock poisoned");
        let confirms_pending = match inner.pending.get(room) {
            Some(pending) => is_self || nick.as_deref() == Some(pending.nickname.as_str()),
            None => false,
        };

        if confirms_pending {
            let pending = inner
                .pending
                .remove(room)
                .expect("pending join checked above");
            let membership = RoomMembership {
                room: room.clone(),
                nickname: pending.nickname,
                joined: true,
            };
            inner.rooms.insert(room.clone(), membership.clone());
            debug!(room = %room, nick = %membership.nickname, "joined room");
            let _ = pending.waiter.send(Ok(membership));
        }
    }

    fn handle_unavailable(&self, room: &BareJid, nick: Option<String>, presence: &Presence) {
        let is_self = is_self_presence(presence);

        let mut inner = self.inner.lock().expect("room registry lock poisoned");
        let our_nick = inner.rooms.get(room).map(|m| m.nickname.clone());
        if is_self || (our_nick.is_some() && nick == our_nick) {
            if inner.rooms.remove(room).is_some() {
                debug!(room = %room, "left room");
            }
        }
    }

    /// Tear down: fail every in-flight join and forget all memberships.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("room registry lock poisoned");
        for (_, pending) in inner.pending.drain() {
            let _ = pending.waiter.send(Err(ClientError::Disconnected));
        }
        inner.rooms.clear();
    }
}

/// Split `room@domain/nick` into the room bare JID and the nickname.
fn split_occupant_jid(jid: Jid) -> (BareJid, Option<String>) {
    match jid.try_into_full() {
        Ok(full) => {
            let nick = full.resource().to_string();
            (full.to_bare(), Some(nick))
        }
        Err(bare) => (bare, None),
    }
}

/// Whether the presence carries the MUC self-presence status (code 110).
fn is_self_presence(presence: &Presence) -> bool {
    presence
        .payloads
        .iter()
        .find_map(|el| MucUser::try_from(el.clone()).ok())
        .map(|muc_user| muc_user.status.contains(&Status::SelfPresence))
        .unwrap_or(false)
}

/// The condition element name inside an error presence, skipping the
/// optional `<text/>` child.
fn presence_error_condition(presence: &Presence) -> Option<String> {
    presence
        .payloads
        .iter()
        .find(|el| el.name() == "error")
        .and_then(|error| {
            error
                .children()
                .find(|child| child.name() != "text")
                .map(|child| child.name().to_string())
        })
}
