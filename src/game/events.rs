//! Game Events
//!
//! Player inputs flowing into the simulators and the events the server
//! simulator emits for the room layer to broadcast.

use serde::{Serialize, Deserialize};

use crate::game::physics::BallData;
use crate::game::state::PlayerId;

// =============================================================================
// INPUT EVENTS
// =============================================================================

/// Kind of player event. Movement is the only one today.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Move,
}

/// A client input stamped with its id and the client tick it was taken on.
///
/// Serialized as the `[eventId, tick, kind, payload]` tuple clients send.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(u64, u64, EventKind, i32)", into = "(u64, u64, EventKind, i32)")]
pub struct PlayerEvent {
    pub event_id: u64,
    pub client_tick: u64,
    pub kind: EventKind,
    pub payload: i32,
}

impl PlayerEvent {
    /// Movement event.
    pub fn movement(event_id: u64, client_tick: u64, direction: i32) -> Self {
        Self { event_id, client_tick, kind: EventKind::Move, payload: direction }
    }
}

impl From<(u64, u64, EventKind, i32)> for PlayerEvent {
    fn from((event_id, client_tick, kind, payload): (u64, u64, EventKind, i32)) -> Self {
        Self { event_id, client_tick, kind, payload }
    }
}

impl From<PlayerEvent> for (u64, u64, EventKind, i32) {
    fn from(e: PlayerEvent) -> Self {
        (e.event_id, e.client_tick, e.kind, e.payload)
    }
}

// =============================================================================
// OUTPUT EVENTS
// =============================================================================

/// Per-player authoritative update: `[serverTick, verifiedEventId, positions]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "(u64, u64, [f64; 4])", into = "(u64, u64, [f64; 4])")]
pub struct GameUpdate {
    pub server_tick: u64,
    pub verified_event_id: u64,
    pub positions: [f64; 4],
}

impl From<(u64, u64, [f64; 4])> for GameUpdate {
    fn from((server_tick, verified_event_id, positions): (u64, u64, [f64; 4])) -> Self {
        Self { server_tick, verified_event_id, positions }
    }
}

impl From<GameUpdate> for (u64, u64, [f64; 4]) {
    fn from(u: GameUpdate) -> Self {
        (u.server_tick, u.verified_event_id, u.positions)
    }
}

/// Simulation event payload.
#[derive(Clone, Debug, PartialEq)]
pub enum SimEventData {
    /// Ball truth after a bounce or periodic resync.
    BallSync { ball: BallData },

    /// Ball left the board through `target`'s side.
    Goal { scorer: Option<usize>, target: usize },

    /// New round armed.
    RoundStart { countdown_ticks: u32, direction: [f64; 2] },

    /// Periodic full-state snapshot due.
    FullSnapshot,

    /// Resync for one player.
    Update { player_id: PlayerId, update: GameUpdate },

    /// Match timer expired.
    MatchEnded,
}

/// An event stamped with the server tick it happened on.
#[derive(Clone, Debug, PartialEq)]
pub struct SimEvent {
    pub tick: u64,
    pub data: SimEventData,
}

impl SimEvent {
    pub fn new(tick: u64, data: SimEventData) -> Self {
        Self { tick, data }
    }

    pub fn ball_sync(tick: u64, ball: BallData) -> Self {
        Self::new(tick, SimEventData::BallSync { ball })
    }

    pub fn goal(tick: u64, scorer: Option<usize>, target: usize) -> Self {
        Self::new(tick, SimEventData::Goal { scorer, target })
    }

    pub fn round_start(tick: u64, countdown_ticks: u32, direction: [f64; 2]) -> Self {
        Self::new(tick, SimEventData::RoundStart { countdown_ticks, direction })
    }

    pub fn update(tick: u64, player_id: PlayerId, update: GameUpdate) -> Self {
        Self::new(tick, SimEventData::Update { player_id, update })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_player_event_wire_shape() {
        let event = PlayerEvent::movement(7, 120, -1);
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"[7,120,"move",-1]"#);

        let parsed: PlayerEvent = serde_json::from_str(r#"[8,121,"move",1]"#).unwrap();
        assert_eq!(parsed, PlayerEvent::movement(8, 121, 1));
    }

    #[test]
    fn test_game_update_wire_shape() {
        let update = GameUpdate { server_tick: 40, verified_event_id: 3, positions: [1.0, 0.0, -2.0, 0.0] };
        let json = serde_json::to_value(update).unwrap();
        assert_eq!(json, serde_json::json!([40, 3, [1.0, 0.0, -2.0, 0.0]]));
    }
}
