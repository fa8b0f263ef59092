//! Core deterministic primitives.
//!
//! Seeded randomness and board geometry constants shared by every layer.

pub mod rng;
pub mod sizes;

// Re-export core types
pub use rng::{DeterministicRng, derive_room_seed};
pub use sizes::BoardSizes;
