//! Client Replica
//!
//! Reducer that rebuilds the public document from `state` snapshots and
//! `instruction` batches.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;

use crate::replication::instruction::{
    self, Action, Instruction, InstructionBatch, Path, PathSegment,
};

/// Client-side mirror of the public document.
#[derive(Debug, Clone)]
pub struct Replica {
    last_id: Option<u64>,
    user_id: Option<String>,
    data: Value,
    last_batch: Option<InstructionBatch>,
}

impl Default for Replica {
    fn default() -> Self {
        Self::new()
    }
}

impl Replica {
    pub fn new() -> Self {
        Self {
            last_id: None,
            user_id: None,
            data: Value::Object(Map::new()),
            last_batch: None,
        }
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn get(&self, path: &Path) -> Option<&Value> {
        instruction::resolve(&self.data, path.segments())
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn last_id(&self) -> Option<u64> {
        self.last_id
    }

    /// Merge a full snapshot. Snapshots with an id at or below the last one
    /// seen are ignored. Returns whether it was applied.
    pub fn apply_state(&mut self, id: u64, user_id: Option<String>, data: Value) -> bool {
        if self.last_id.is_some_and(|last| id <= last) {
            debug!(id, "Ignoring stale snapshot");
            return false;
        }

        self.last_id = Some(id);
        if user_id.is_some() {
            self.user_id = user_id;
        }
        instruction::merge_top_level(&mut self.data, data);
        true
    }

    /// Apply a batch in order. Re-delivery of the same batch is a no-op.
    /// Returns the number of instructions applied.
    pub fn apply_batch(&mut self, batch: &InstructionBatch) -> usize {
        if self.last_batch.as_ref().is_some_and(|last| Arc::ptr_eq(last, batch)) {
            return 0;
        }
        self.last_batch = Some(Arc::clone(batch));

        batch.iter().filter(|ins| apply_instruction(&mut self.data, ins)).count()
    }
}

/// Apply one instruction to a document. Instructions whose target is
/// missing or of the wrong shape are skipped; returns whether it applied.
pub fn apply_instruction(root: &mut Value, ins: &Instruction) -> bool {
    match ins.action {
        Action::Set | Action::Unset | Action::Overwrite => apply_keyed(root, ins),
        Action::Push | Action::Pop | Action::Splice => {
            let Some(Value::Array(arr)) = instruction::resolve_mut(root, ins.path.segments()) else {
                return false;
            };
            match ins.action {
                Action::Push => {
                    arr.push(ins.value.clone().unwrap_or(Value::Null));
                    true
                }
                Action::Pop => {
                    arr.pop();
                    true
                }
                _ => {
                    let Some(Value::Array(args)) = &ins.value else {
                        return false;
                    };
                    let start = args.first().and_then(Value::as_u64).unwrap_or(0) as usize;
                    let delete = args.get(1).and_then(Value::as_u64).unwrap_or(0) as usize;
                    let items = args.iter().skip(2).cloned().collect();
                    instruction::splice_array(arr, start, delete, items);
                    true
                }
            }
        }
    }
}

fn apply_keyed(root: &mut Value, ins: &Instruction) -> bool {
    let value = ins.value.clone().unwrap_or(Value::Null);

    let Some((last, parent)) = ins.path.split_last() else {
        if ins.action == Action::Overwrite {
            instruction::merge_top_level(root, value);
            return true;
        }
        return false;
    };

    match instruction::resolve_mut(root, parent) {
        Some(Value::Object(map)) => {
            let key = instruction::segment_key(last);
            match ins.action {
                Action::Unset => {
                    map.remove(&key);
                }
                _ => {
                    map.insert(key, value);
                }
            }
            true
        }
        Some(Value::Array(arr)) => {
            let PathSegment::Index(index) = *last else {
                return false;
            };
            match ins.action {
                Action::Unset => match arr.get_mut(index) {
                    Some(slot) => *slot = Value::Null,
                    None => return false,
                },
                _ if index < arr.len() => arr[index] = value,
                Action::Set if index == arr.len() => arr.push(value),
                _ => return false,
            }
            true
        }
        _ => false,
    }
}
