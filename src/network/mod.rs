//! Network Layer
//!
//! WebSocket server for real-time multiplayer communication.
//! Connection tasks only parse and authenticate; all state lives in the
//! engine task (see [`server::Engine`]).

pub mod auth;
pub mod protocol;
pub mod server;

pub use auth::{authenticate, validate_token, AuthConfig, AuthError, PlayerIdentity, TokenClaims};
pub use protocol::{
    AuthRequest, AuthResult, ClientMessage, CreateRoomRequest, ErrorCode, Notice, NoticeKind,
    ServerError, ServerMessage, TickSync,
};
pub use server::{Engine, EngineCommand, GameServer, GameServerError, ServerConfig};
