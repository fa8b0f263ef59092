//! Public Lobby State
//!
//! The replicated document every client sees:
//! `{ players: {id: Player}, rooms: {id: Room}, tournaments: {roomId: Tournament} }`.
//! Field-level sets rely on the document eliding unchanged values, so
//! syncing a whole entity only logs what actually moved.

use serde::Serialize;
use serde_json::{json, Value};
use tracing::error;

use crate::game::state::PlayerId;
use crate::lobby::room::{Player, Room};
use crate::lobby::tournament::Tournament;
use crate::replication::{Instruction, Observed, Path, ReplicationError};

/// Replicated lobby document with a snapshot counter.
#[derive(Debug)]
pub struct PublicState {
    doc: Observed,
    snapshot_id: u64,
}

impl Default for PublicState {
    fn default() -> Self {
        Self::new()
    }
}

fn log_failure<T>(what: &str, result: Result<T, ReplicationError>) {
    if let Err(e) = result {
        error!(error = %e, what, "Public state mutation failed");
    }
}

fn to_value<T: Serialize>(entity: &T) -> Value {
    serde_json::to_value(entity).unwrap_or(Value::Null)
}

impl PublicState {
    pub fn new() -> Self {
        let root = json!({ "players": {}, "rooms": {}, "tournaments": {} });
        let doc = Observed::wrap(root).unwrap_or_default();
        Self { doc, snapshot_id: 0 }
    }

    fn player_path(id: &PlayerId) -> Path {
        Path::root().key("players").key(id.as_str())
    }

    fn room_path(id: &str) -> Path {
        Path::root().key("rooms").key(id)
    }

    fn tournament_path(room_id: &str) -> Path {
        Path::root().key("tournaments").key(room_id)
    }

    pub fn value(&self) -> &Value {
        self.doc.value()
    }

    /// Sync every top-level field of an object entity at `path`, creating
    /// it if absent. Fields named in `skip` are left alone.
    fn sync_entity(&mut self, path: Path, value: Value, skip: &[&str]) {
        if self.doc.get(&path).is_none() {
            log_failure("create", self.doc.set(&path, value));
            return;
        }
        let Value::Object(fields) = value else {
            log_failure("replace", self.doc.set(&path, value));
            return;
        };
        for (field, v) in fields {
            if skip.contains(&field.as_str()) {
                continue;
            }
            log_failure("field", self.doc.set(&path.clone().key(field), v));
        }
    }

    pub fn sync_player(&mut self, player: &Player) {
        self.sync_entity(Self::player_path(&player.id), to_value(player), &[]);
    }

    pub fn remove_player(&mut self, id: &PlayerId) {
        log_failure("remove player", self.doc.unset(&Self::player_path(id)));
    }

    /// Sync a room. The member list is maintained with array operations.
    pub fn sync_room(&mut self, room: &Room) {
        self.sync_entity(Self::room_path(&room.id), to_value(room), &["players"]);
    }

    pub fn push_room_member(&mut self, room_id: &str, player_id: &PlayerId) {
        let path = Self::room_path(room_id).key("players");
        log_failure("push member", self.doc.push(&path, Value::from(player_id.as_str())));
    }

    pub fn remove_room_member(&mut self, room_id: &str, index: usize) {
        let path = Self::room_path(room_id).key("players");
        log_failure("remove member", self.doc.splice(&path, index, 1, Vec::new()));
    }

    pub fn remove_room(&mut self, room_id: &str) {
        log_failure("remove room", self.doc.unset(&Self::room_path(room_id)));
    }

    /// Replace a tournament subtree when it changed.
    pub fn sync_tournament(&mut self, tournament: &Tournament) {
        let path = Self::tournament_path(&tournament.room_id);
        let value = to_value(tournament);
        if self.doc.get(&path) == Some(&value) {
            return;
        }
        log_failure("tournament", self.doc.overwrite(&path, value));
    }

    pub fn remove_tournament(&mut self, room_id: &str) {
        log_failure("remove tournament", self.doc.unset(&Self::tournament_path(room_id)));
    }

    /// Full document under a fresh, strictly increasing id.
    pub fn snapshot(&mut self) -> (u64, Value) {
        self.snapshot_id += 1;
        (self.snapshot_id, self.doc.value().clone())
    }

    pub fn pending(&self) -> usize {
        self.doc.pending()
    }

    pub fn drain(&mut self) -> Vec<Instruction> {
        self.doc.drain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lobby::room::RoomType;
    use crate::replication::{Action, Replica};
    use std::sync::Arc;

    #[test]
    fn test_field_sync_logs_only_changes() {
        let mut public = PublicState::new();
        let mut room = Room::new("r1".into(), "Room", RoomType::Single, 4);

        public.sync_room(&room);
        assert_eq!(public.drain().len(), 1);

        room.countdown = 90;
        public.sync_room(&room);
        let log = public.drain();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].path, Path::root().key("rooms").key("r1").key("countdown"));

        public.sync_room(&room);
        assert_eq!(public.pending(), 0);
    }

    #[test]
    fn test_member_list_operations() {
        let mut public = PublicState::new();
        let room = Room::new("r1".into(), "Room", RoomType::Single, 4);
        public.sync_room(&room);
        public.push_room_member("r1", &"a".into());
        public.push_room_member("r1", &"b".into());
        public.remove_room_member("r1", 0);

        assert_eq!(public.value()["rooms"]["r1"]["players"], json!(["b"]));
        let log = public.drain();
        assert_eq!(log.last().map(|i| i.action), Some(Action::Splice));
    }

    #[test]
    fn test_snapshot_then_batches_match() {
        let mut public = PublicState::new();
        let mut replica = Replica::new();
        let (id, data) = public.snapshot();
        replica.apply_state(id, None, data);

        let mut player = Player::new("a".into(), "Alice");
        public.sync_player(&player);
        player.ready = true;
        public.sync_player(&player);
        replica.apply_batch(&Arc::new(public.drain()));

        assert_eq!(replica.data(), public.value());
        let (next, _) = public.snapshot();
        assert!(next > id);
    }
}
