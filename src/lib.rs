//! # Quadpong Server
//!
//! Authoritative server for a four-sided paddle arena: up to four players
//! defend one side of a square board each, with a lobby, knockout
//! tournaments and a differentially replicated public state.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     QUADPONG SERVER                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Deterministic primitives                  │
//! │  ├── rng.rs      - Seeded Xorshift128+ PRNG                  │
//! │  └── sizes.rs    - Board geometry constants                  │
//! │                                                              │
//! │  game/           - Simulation (shared by client and server)  │
//! │  ├── physics.rs  - Boxes, collisions, reflection, goals      │
//! │  ├── state.rs    - Core simulation state                     │
//! │  ├── events.rs   - Input and update payloads                 │
//! │  ├── scheduler.rs- Instance registry and drift-free clock    │
//! │  ├── server.rs   - Authoritative simulator                   │
//! │  └── client.rs   - Predicting, reconciling simulator         │
//! │                                                              │
//! │  replication/    - Observed documents and instruction logs   │
//! │                                                              │
//! │  lobby/          - Players, rooms, brackets, timers          │
//! │                                                              │
//! │  network/        - WebSocket server (non-deterministic)      │
//! │  ├── server.rs   - Connections and the engine task           │
//! │  ├── protocol.rs - Message types                             │
//! │  └── auth.rs     - Identity tokens                           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency
//!
//! One engine task owns every room and simulator. Connection tasks hand it
//! commands over a channel, so no lobby or game state is ever shared.

#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod game;
pub mod replication;
pub mod lobby;
pub mod network;

// Re-export commonly used types
pub use core::rng::DeterministicRng;
pub use core::sizes::BoardSizes;
pub use game::state::{PlayerId, SimState};
pub use game::server::ServerSimulator;
pub use game::client::ClientSimulator;
pub use lobby::manager::RoomManager;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Simulation tick rate (Hz)
pub const TICK_RATE: u32 = 60;

/// Match duration in ticks (90 seconds * 60 Hz)
pub const MATCH_DURATION_TICKS: u32 = 5400;
