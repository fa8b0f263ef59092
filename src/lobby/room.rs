//! Players and Rooms
//!
//! Lobby entities. Both are mirrored into the public document, so their
//! serialized form is the shape clients see.

use serde::{Serialize, Deserialize};

use crate::game::physics::SIDE_COUNT;
use crate::game::scheduler::TickHandle;
use crate::game::state::PlayerId;

/// Room identifier.
pub type RoomId = String;

/// Where a player is in the lobby flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PlayerState {
    /// Connected, not in a room.
    Idle,
    /// In a room, waiting.
    InRoom,
    /// Playing a match.
    InGame,
}

/// A connected player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    /// Player identifier.
    pub id: PlayerId,
    /// Display name.
    pub name: String,
    /// Lobby state.
    pub state: PlayerState,
    /// Room the player is in.
    pub room_id: Option<RoomId>,
    /// Ready flag for the next match.
    pub ready: bool,
    /// Paddle index in the current match.
    pub paddle_index: Option<usize>,
}

impl Player {
    pub fn new(id: PlayerId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            state: PlayerState::Idle,
            room_id: None,
            ready: false,
            paddle_index: None,
        }
    }

    /// Return to the room's waiting state.
    pub fn reset_for_room(&mut self) {
        self.state = PlayerState::InRoom;
        self.ready = false;
        self.paddle_index = None;
    }

    /// Leave the room entirely.
    pub fn reset_to_idle(&mut self) {
        self.state = PlayerState::Idle;
        self.room_id = None;
        self.ready = false;
        self.paddle_index = None;
    }
}

/// Room format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RoomType {
    /// One match for up to four players.
    Single,
    /// Knockout bracket of one-on-one matches.
    Tournament,
}

/// Room lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RoomStatus {
    Waiting,
    Starting,
    InGame,
    Ending,
}

/// Goals scored and conceded by one side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuadrantScore {
    pub scored: u32,
    pub conceded: u32,
}

/// A room.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    /// Room identifier.
    pub id: RoomId,
    /// Display name.
    pub name: String,
    /// Format.
    #[serde(rename = "type")]
    pub room_type: RoomType,
    /// Lifecycle status.
    pub status: RoomStatus,
    /// Members in join order.
    pub players: Vec<PlayerId>,
    /// Capacity.
    pub players_max: usize,
    /// Member playing each side in the current match.
    pub active_players: [Option<PlayerId>; SIDE_COUNT],
    /// Member allowed to start the match.
    pub master_id: Option<PlayerId>,
    /// Per-side score for the current match.
    pub scores: [QuadrantScore; SIDE_COUNT],
    /// Match seconds remaining.
    pub countdown: u32,
    /// Whether the match clock is running.
    pub running: bool,
    /// Bumped whenever pending timers for this room must be discarded.
    #[serde(skip)]
    pub epoch: u64,
    /// Handle of the room's simulator.
    #[serde(skip)]
    pub sim: Option<TickHandle>,
}

impl Room {
    pub fn new(id: RoomId, name: impl Into<String>, room_type: RoomType, players_max: usize) -> Self {
        Self {
            id,
            name: name.into(),
            room_type,
            status: RoomStatus::Waiting,
            players: Vec::new(),
            players_max,
            active_players: Default::default(),
            master_id: None,
            scores: [QuadrantScore::default(); SIDE_COUNT],
            countdown: 0,
            running: false,
            epoch: 0,
            sim: None,
        }
    }

    pub fn is_full(&self) -> bool {
        self.players.len() >= self.players_max
    }

    pub fn contains(&self, player_id: &PlayerId) -> bool {
        self.players.contains(player_id)
    }

    pub fn is_master(&self, player_id: &PlayerId) -> bool {
        self.master_id.as_ref() == Some(player_id)
    }

    /// Whether a match is set up or running.
    pub fn in_match(&self) -> bool {
        matches!(self.status, RoomStatus::Starting | RoomStatus::InGame)
    }

    /// Side `player_id` is playing, if any.
    pub fn active_index(&self, player_id: &PlayerId) -> Option<usize> {
        self.active_players.iter().position(|p| p.as_ref() == Some(player_id))
    }

    pub fn active_count(&self) -> usize {
        self.active_players.iter().flatten().count()
    }

    /// Append a member. The first member becomes master.
    pub fn add_player(&mut self, player_id: PlayerId) {
        if self.master_id.is_none() {
            self.master_id = Some(player_id.clone());
        }
        self.players.push(player_id);
    }

    /// Remove a member, returning their former position in `players`.
    ///
    /// A leaving master hands over to the longest-standing member.
    pub fn remove_player(&mut self, player_id: &PlayerId) -> Option<usize> {
        let index = self.players.iter().position(|p| p == player_id)?;
        self.players.remove(index);

        if self.is_master(player_id) {
            self.master_id = self.players.first().cloned();
        }
        if let Some(side) = self.active_index(player_id) {
            self.active_players[side] = None;
        }
        Some(index)
    }

    /// Clear per-match state.
    pub fn reset_match(&mut self) {
        self.status = RoomStatus::Waiting;
        self.active_players = Default::default();
        self.scores = [QuadrantScore::default(); SIDE_COUNT];
        self.countdown = 0;
        self.running = false;
        self.sim = None;
    }

    /// Record a goal: `target` concedes, `scorer` (if any) scores.
    pub fn record_goal(&mut self, scorer: Option<usize>, target: usize) {
        if let Some(score) = self.scores.get_mut(target) {
            score.conceded += 1;
        }
        if let Some(score) = scorer.and_then(|s| self.scores.get_mut(s)) {
            score.scored += 1;
        }
    }
}
