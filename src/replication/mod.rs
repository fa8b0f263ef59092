//! Differential State Replication
//!
//! The server mutates an [`Observed`] document; each mutation is logged as
//! an [`Instruction`]. Once per tick the log is drained into a shared
//! [`InstructionBatch`] and broadcast. Clients fold snapshots and batches
//! into a [`Replica`].

pub mod instruction;
pub mod observed;
pub mod replica;

pub use instruction::{Action, ContainerKind, Instruction, InstructionBatch, Path, PathSegment};
pub use observed::{Observed, ReplicationError};
pub use replica::{apply_instruction, Replica};
