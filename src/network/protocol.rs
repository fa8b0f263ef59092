//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket. Every
//! message is a JSON object whose `event` field names it; payloads use
//! camelCase keys.

use serde::{Serialize, Deserialize};
use serde_json::Value;

use crate::game::events::{GameUpdate, PlayerEvent};
use crate::game::physics::BallData;
use crate::lobby::room::RoomType;
use crate::replication::InstructionBatch;

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ClientMessage {
    /// Authenticate; must be the first message on a connection.
    #[serde(rename = "auth")]
    Auth(AuthRequest),

    /// Create a room and join it.
    #[serde(rename = "room.create")]
    CreateRoom(CreateRoomRequest),

    /// Join a room by id.
    #[serde(rename = "room.join")]
    JoinRoom { id: String },

    /// Join the first open single room, creating one if needed.
    #[serde(rename = "room.join.quick")]
    QuickJoin,

    /// Leave the current room.
    #[serde(rename = "room.leave")]
    LeaveRoom,

    /// Toggle the ready flag.
    #[serde(rename = "player.ready")]
    Ready,

    /// Start the match (room master only).
    #[serde(rename = "game.start")]
    StartGame,

    /// Tick sync. With a client tick the server answers with an adjustment,
    /// without one it answers with its own tick.
    #[serde(rename = "game.tick", rename_all = "camelCase")]
    GameTick {
        #[serde(default)]
        client_tick: Option<u64>,
    },

    /// Player input.
    #[serde(rename = "player.event")]
    PlayerEvent { data: PlayerEvent },

    /// Ping for latency measurement.
    #[serde(rename = "ping")]
    Ping { timestamp: u64 },
}

/// Authentication request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    /// Player id asserted by the client.
    #[serde(default)]
    pub player_id: String,
    /// Display name asserted by the client.
    #[serde(default)]
    pub name: String,
    /// Identity token (JWT). Required when token validation is configured.
    #[serde(default)]
    pub token: Option<String>,
}

/// Room creation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub room_type: RoomType,
    #[serde(default)]
    pub players_max: Option<usize>,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ServerMessage {
    /// Authentication result.
    #[serde(rename = "auth.result")]
    AuthResult(AuthResult),

    /// Full public state snapshot.
    #[serde(rename = "state", rename_all = "camelCase")]
    State { id: u64, user_id: String, data: Value },

    /// Batch of mutations to the public state.
    #[serde(rename = "instruction")]
    Instruction { batch: InstructionBatch },

    /// User-facing notice.
    #[serde(rename = "notice")]
    Notice(Notice),

    /// Paddle index for the coming match.
    #[serde(rename = "player.index")]
    PlayerIndex { index: usize },

    /// An input was rejected.
    #[serde(rename = "packet.dropped", rename_all = "camelCase")]
    PacketDropped { event_id: u64 },

    /// Tick sync answer.
    #[serde(rename = "game.tick")]
    GameTick(TickSync),

    /// Authoritative paddle update.
    #[serde(rename = "game.update")]
    GameUpdate { data: GameUpdate },

    /// Ball truth.
    #[serde(rename = "ball.collision", rename_all = "camelCase")]
    BallCollision { server_tick: u64, ball_data: BallData },

    /// New round armed.
    #[serde(rename = "round.start", rename_all = "camelCase")]
    RoundStart { server_tick: u64, countdown_ticks: u32, direction: [f64; 2] },

    /// Goal scored.
    #[serde(rename = "goal")]
    Goal { scorer: Option<usize>, target: usize },

    /// Pong response.
    #[serde(rename = "pong", rename_all = "camelCase")]
    Pong { timestamp: u64, server_time: u64 },

    /// Protocol or authentication error.
    #[serde(rename = "error")]
    Error(ServerError),

    /// Server is shutting down.
    #[serde(rename = "shutdown")]
    Shutdown { reason: String },
}

/// Authentication result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResult {
    /// Whether auth succeeded.
    pub success: bool,
    /// Player id the connection is bound to.
    pub player_id: Option<String>,
    /// Error message if failed.
    pub error: Option<String>,
    /// Server version.
    pub server_version: String,
}

/// Tick sync answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "value", rename_all = "lowercase")]
pub enum TickSync {
    /// Client should set its tick to `server tick + offset`.
    Set(u64),
    /// Client should shift offset and tick by the delta.
    Adjust(i64),
}

/// Severity of a notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeKind {
    Info,
    Success,
    Error,
}

/// User-facing notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    #[serde(rename = "type")]
    pub kind: NoticeKind,
    pub title: String,
    pub message: String,
}

impl Notice {
    pub fn new(kind: NoticeKind, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self { kind, title: title.into(), message: message.into() }
    }

    pub fn info(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NoticeKind::Info, title, message)
    }

    pub fn success(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NoticeKind::Success, title, message)
    }

    pub fn error(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NoticeKind::Error, title, message)
    }
}

/// Server error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Authentication failed.
    AuthFailed,
    /// Not authenticated.
    NotAuthenticated,
    /// JWT token has expired.
    TokenExpired,
    /// Invalid JWT token (signature, format, claims).
    InvalidToken,
    /// Message could not be parsed.
    InvalidMessage,
    /// Server overloaded.
    ServerOverloaded,
    /// Internal error.
    InternalError,
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    pub fn notice(notice: Notice) -> Self {
        ServerMessage::Notice(notice)
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error(ServerError { code, message: message.into() })
    }
}

// =============================================================================
// TESTS
// =============================================================================
