//! Game Logic Module
//!
//! Deterministic paddle-and-ball simulation shared by server and client.
//!
//! ## Module Structure
//!
//! - `physics`: Board geometry, collision and reflection
//! - `state`: Per-tick simulation core
//! - `events`: Player inputs and simulator output events
//! - `scheduler`: Simulation arena and drift-correcting clock
//! - `server`: Authoritative simulator with event queue
//! - `client`: Predicting simulator with reconciliation

pub mod physics;
pub mod state;
pub mod events;
pub mod scheduler;
pub mod server;
pub mod client;

// Re-export key types
pub use physics::BallData;
pub use state::{PlayerId, SimState, TickError};
pub use events::{PlayerEvent, GameUpdate, SimEvent, SimEventData};
pub use scheduler::{TickScheduler, TickHandle, TickClock};
pub use server::{ServerSimulator, ServerSimConfig};
pub use client::{ClientSimulator, ReconcileConfig};
