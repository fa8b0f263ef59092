//! Lobby Module
//!
//! Players, rooms, knockout brackets and the replicated public document.
//! `RoomManager` owns all of it and is driven by the engine task.

pub mod room;
pub mod tournament;
pub mod timers;
pub mod public;
pub mod manager;

pub use room::{Player, PlayerState, Room, RoomId, RoomStatus, RoomType};
pub use tournament::{Match, MatchStage, Tournament};
pub use public::PublicState;
pub use manager::{LobbyError, Outgoing, Recipient, RoomConfig, RoomManager};
