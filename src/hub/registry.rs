use std::collections::HashMap;

use super::connection::{ConnectionHandle, ConnectionId};
use super::messages::{RoomId, UserId};

/// user -> connections and room -> connections
///
/// Only the hub's event loop owns one of these, so it is never mutated
/// concurrently. A connection with a room is listed under its user iff it is
/// listed under its room; connections without a room live in the user map only.
#[derive(Default)]
pub struct Registry {
    users: HashMap<UserId, HashMap<ConnectionId, ConnectionHandle>>,
    rooms: HashMap<RoomId, HashMap<ConnectionId, ConnectionHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, handle: ConnectionHandle) {
        if let Some(room_id) = handle.room_id() {
            self.rooms
                .entry(room_id)
                .or_default()
                .insert(handle.id(), handle.clone());
        }
        self.users
            .entry(handle.user_id())
            .or_default()
            .insert(handle.id(), handle);
    }

    /// Remove from both maps at once, pruning sets left empty
    pub fn remove(&mut self, handle: &ConnectionHandle) -> bool {
        let removed = remove_member(&mut self.users, handle.user_id(), handle.id());
        if let Some(room_id) = handle.room_id() {
            remove_member(&mut self.rooms, room_id, handle.id());
        }
        removed
    }

    pub fn contains(&self, handle: &ConnectionHandle) -> bool {
        self.users
            .get(&handle.user_id())
            .is_some_and(|connections| connections.contains_key(&handle.id()))
    }

    pub fn room_members(&self, room_id: RoomId) -> Vec<ConnectionHandle> {
        self.rooms
            .get(&room_id)
            .map(|connections| connections.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn user_connections(&self, user_id: UserId) -> Vec<ConnectionHandle> {
        self.users
            .get(&user_id)
            .map(|connections| connections.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn connection_count(&self) -> usize {
        self.users.values().map(HashMap::len).sum()
    }

    /// Empty the registry, returning every connection it held
    pub fn drain(&mut self) -> Vec<ConnectionHandle> {
        self.rooms.clear();
        self.users
            .drain()
            .flat_map(|(_, connections)| connections.into_values())
            .collect()
    }

    /// Both maps agree and hold no empty sets
    pub fn is_consistent(&self) -> bool {
        let users_ok = self.users.iter().all(|(user_id, connections)| {
            !connections.is_empty()
                && connections.values().all(|handle| {
                    handle.user_id() == *user_id
                        && handle.room_id().map_or(true, |room_id| {
                            self.rooms
                                .get(&room_id)
                                .is_some_and(|members| members.contains_key(&handle.id()))
                        })
                })
        });

        let rooms_ok = self.rooms.iter().all(|(room_id, members)| {
            !members.is_empty()
                && members.values().all(|handle| {
                    handle.room_id() == Some(*room_id)
                        && self
                            .users
                            .get(&handle.user_id())
                            .is_some_and(|connections| connections.contains_key(&handle.id()))
                })
        });

        users_ok && rooms_ok
    }
}

fn remove_member<K: std::hash::Hash + Eq>(
    map: &mut HashMap<K, HashMap<ConnectionId, ConnectionHandle>>,
    key: K,
    id: ConnectionId,
) -> bool {
    let Some(members) = map.get_mut(&key) else {
        return false;
    };
    let removed = members.remove(&id).is_some();
    if members.is_empty() {
        map.remove(&key);
    }
    removed
}
