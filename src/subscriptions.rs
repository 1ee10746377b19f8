//! Run-room subscription registry.
//!
//! The registry holds the rooms this session *should* be in. It is the only
//! source the connection manager consults when (re)joining: after a reconnect
//! every room is marked unjoined and the connection's I/O task replays them
//! all before reporting `Connected`.
//!
//! Rooms are reference counted. Two run views showing the same run share one
//! membership, and `LeaveRunGroup` is only sent when the last one lets go.

use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::model::RunId;

#[derive(Debug, Clone, Copy, Default)]
struct Room {
    refs: usize,
    joined: bool,
}

/// Pending transport work computed from desired vs. joined state.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct RoomDelta {
    pub join: Vec<RunId>,
    pub leave: Vec<RunId>,
}

impl RoomDelta {
    pub fn is_empty(&self) -> bool {
        self.join.is_empty() && self.leave.is_empty()
    }
}

#[derive(Default)]
struct Rooms {
    /// Desired rooms in first-join order.
    desired: IndexMap<RunId, Room>,
    /// Released rooms the server still has us in.
    releasing: Vec<RunId>,
}

/// Rooms the session should be subscribed to.
#[derive(Default)]
pub struct SubscriptionRegistry {
    rooms: Mutex<Rooms>,
    changed: Notify,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a run's room. The transport join happens on the
    /// connection's I/O task, now if connected or on the next connect.
    ///
    /// Returns `true` when this is the first reference to the room.
    pub fn join(&self, run_id: &RunId) -> bool {
        let first = {
            let mut rooms = self.rooms.lock();
            rooms.releasing.retain(|r| r != run_id);
            let room = rooms.desired.entry(run_id.clone()).or_default();
            room.refs += 1;
            room.refs == 1
        };
        if first {
            tracing::debug!(run_id = %run_id, "room subscribed");
            self.changed.notify_one();
        }
        first
    }

    /// Drop one reference to a run's room. Returns `true` when the room was
    /// released (last reference gone).
    pub fn leave(&self, run_id: &RunId) -> bool {
        let released = {
            let mut rooms = self.rooms.lock();
            let Some(room) = rooms.desired.get_mut(run_id) else {
                return false;
            };
            room.refs = room.refs.saturating_sub(1);
            if room.refs > 0 {
                return false;
            }
            let joined = room.joined;
            rooms.desired.shift_remove(run_id);
            if joined {
                rooms.releasing.push(run_id.clone());
            }
            true
        };
        if released {
            tracing::debug!(run_id = %run_id, "room released");
            self.changed.notify_one();
        }
        released
    }

    pub fn is_subscribed(&self, run_id: &RunId) -> bool {
        self.rooms.lock().desired.contains_key(run_id)
    }

    pub fn is_joined(&self, run_id: &RunId) -> bool {
        self.rooms
            .lock()
            .desired
            .get(run_id)
            .is_some_and(|r| r.joined)
    }

    /// Desired rooms in the order they were first joined.
    pub fn rooms(&self) -> Vec<RunId> {
        self.rooms.lock().desired.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.rooms.lock().desired.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The only subscribed room, if exactly one exists. Used to attribute
    /// log events that carry no run id.
    pub fn sole_room(&self) -> Option<RunId> {
        let rooms = self.rooms.lock();
        if rooms.desired.len() == 1 {
            rooms.desired.keys().next().cloned()
        } else {
            None
        }
    }

    /// Resolves when a join or leave needs transport work.
    pub(crate) async fn changed(&self) {
        self.changed.notified().await;
    }

    /// Forget transport membership. Called when a connection is lost: the
    /// server drops group membership with the connection, so nothing is
    /// joined and nothing needs leaving.
    pub(crate) fn reset_joined(&self) {
        let mut rooms = self.rooms.lock();
        for room in rooms.desired.values_mut() {
            room.joined = false;
        }
        rooms.releasing.clear();
    }

    /// Compute what the transport must send to match the desired set.
    pub(crate) fn pending(&self) -> RoomDelta {
        let rooms = self.rooms.lock();
        RoomDelta {
            join: rooms
                .desired
                .iter()
                .filter(|(_, r)| !r.joined)
                .map(|(id, _)| id.clone())
                .collect(),
            leave: rooms.releasing.clone(),
        }
    }

    /// Record that a join was sent on the current connection. Returns
    /// `false` when the room was released while the join was in flight; the
    /// caller then owes the server a leave.
    pub(crate) fn mark_joined(&self, run_id: &RunId) -> bool {
        match self.rooms.lock().desired.get_mut(run_id) {
            Some(room) => {
                room.joined = true;
                true
            }
            None => false,
        }
    }

    /// Record that a leave was sent on the current connection.
    pub(crate) fn mark_left(&self, run_id: &RunId) {
        self.rooms.lock().releasing.retain(|r| r != run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> RunId {
        RunId::from(s)
    }

    #[test]
    fn join_is_deferred_until_marked() {
        let reg = SubscriptionRegistry::new();
        assert!(reg.join(&id("42")));
        assert!(reg.is_subscribed(&id("42")));
        assert!(!reg.is_joined(&id("42")));
        assert_eq!(reg.pending().join, vec![id("42")]);

        assert!(reg.mark_joined(&id("42")));
        assert!(reg.is_joined(&id("42")));
        assert!(reg.pending().is_empty());
    }

    #[test]
    fn shared_room_is_left_by_last_reference() {
        let reg = SubscriptionRegistry::new();
        assert!(reg.join(&id("7")));
        assert!(!reg.join(&id("7")));
        reg.mark_joined(&id("7"));

        assert!(!reg.leave(&id("7")));
        assert!(reg.is_subscribed(&id("7")));
        assert!(reg.pending().is_empty());

        assert!(reg.leave(&id("7")));
        assert!(!reg.is_subscribed(&id("7")));
        assert_eq!(reg.pending().leave, vec![id("7")]);
        reg.mark_left(&id("7"));
        assert!(reg.pending().is_empty());
    }

    #[test]
    fn leaving_an_unjoined_room_sends_nothing() {
        let reg = SubscriptionRegistry::new();
        reg.join(&id("1"));
        assert!(reg.leave(&id("1")));
        assert!(reg.pending().is_empty());
        assert!(!reg.leave(&id("1")));
        assert!(!reg.mark_joined(&id("1")));
    }

    #[test]
    fn reset_marks_every_room_for_replay_in_join_order() {
        let reg = SubscriptionRegistry::new();
        for r in ["3", "1", "2"] {
            reg.join(&id(r));
            reg.mark_joined(&id(r));
        }
        assert!(reg.pending().is_empty());
        reg.reset_joined();
        assert_eq!(reg.pending().join, vec![id("3"), id("1"), id("2")]);
    }

    #[test]
    fn rejoin_cancels_pending_leave() {
        let reg = SubscriptionRegistry::new();
        reg.join(&id("9"));
        reg.mark_joined(&id("9"));
        reg.leave(&id("9"));
        reg.join(&id("9"));
        let delta = reg.pending();
        assert!(delta.leave.is_empty());
        assert_eq!(delta.join, vec![id("9")]);
    }

    #[test]
    fn sole_room_only_when_unambiguous() {
        let reg = SubscriptionRegistry::new();
        assert_eq!(reg.sole_room(), None);
        reg.join(&id("1"));
        assert_eq!(reg.sole_room(), Some(id("1")));
        reg.join(&id("2"));
        assert_eq!(reg.sole_room(), None);
    }
}
