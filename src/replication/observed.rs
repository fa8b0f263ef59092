//! Observed Document
//!
//! A JSON document that records every effective mutation as an
//! [`Instruction`]. The log is drained once per tick and broadcast.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::replication::instruction::{
    self, Action, ContainerKind, Instruction, Path, PathSegment,
};

/// Errors raised when a mutation does not fit the document's shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicationError {
    #[error("path not found: {0}")]
    PathNotFound(String),

    #[error("value at {0} is not a container")]
    NotAContainer(String),

    #[error("value at {0} is not an array")]
    NotAnArray(String),

    #[error("index {index} out of bounds at {path}")]
    IndexOutOfBounds { path: String, index: usize },

    #[error("the document root cannot be set or unset")]
    RootMutation,
}

/// A document that logs its own mutations.
#[derive(Debug, Clone)]
pub struct Observed {
    root: Value,
    log: Vec<Instruction>,
}

impl Default for Observed {
    fn default() -> Self {
        Self::new()
    }
}

impl Observed {
    /// Empty object document.
    pub fn new() -> Self {
        Self { root: Value::Object(Map::new()), log: Vec::new() }
    }

    /// Wrap an existing container without logging its contents.
    pub fn wrap(root: Value) -> Result<Self, ReplicationError> {
        match root {
            Value::Object(_) | Value::Array(_) => Ok(Self { root, log: Vec::new() }),
            _ => Err(ReplicationError::NotAContainer(Path::root().to_string())),
        }
    }

    pub fn value(&self) -> &Value {
        &self.root
    }

    pub fn get(&self, path: &Path) -> Option<&Value> {
        instruction::resolve(&self.root, path.segments())
    }

    /// Number of instructions waiting to be drained.
    pub fn pending(&self) -> usize {
        self.log.len()
    }

    /// Take the pending log.
    pub fn drain(&mut self) -> Vec<Instruction> {
        std::mem::take(&mut self.log)
    }

    fn parent_mut<'a>(
        root: &'a mut Value,
        path: &Path,
        parent: &[PathSegment],
    ) -> Result<&'a mut Value, ReplicationError> {
        instruction::resolve_mut(root, parent)
            .ok_or_else(|| ReplicationError::PathNotFound(path.to_string()))
    }

    fn array_mut<'a>(root: &'a mut Value, path: &Path) -> Result<&'a mut Vec<Value>, ReplicationError> {
        match instruction::resolve_mut(root, path.segments()) {
            Some(Value::Array(arr)) => Ok(arr),
            Some(_) => Err(ReplicationError::NotAnArray(path.to_string())),
            None => Err(ReplicationError::PathNotFound(path.to_string())),
        }
    }

    /// Set a key or index. Setting an object key to an equal value records
    /// nothing. Returns whether an instruction was logged.
    pub fn set(&mut self, path: &Path, value: Value) -> Result<bool, ReplicationError> {
        let (last, parent) = path.split_last().ok_or(ReplicationError::RootMutation)?;

        let container = match Self::parent_mut(&mut self.root, path, parent)? {
            Value::Object(map) => {
                let key = instruction::segment_key(last);
                if map.get(&key) == Some(&value) {
                    return Ok(false);
                }
                map.insert(key, value.clone());
                ContainerKind::Object
            }
            Value::Array(arr) => {
                let PathSegment::Index(index) = *last else {
                    return Err(ReplicationError::NotAnArray(path.to_string()));
                };
                match index.cmp(&arr.len()) {
                    std::cmp::Ordering::Less => arr[index] = value.clone(),
                    std::cmp::Ordering::Equal => arr.push(value.clone()),
                    std::cmp::Ordering::Greater => {
                        return Err(ReplicationError::IndexOutOfBounds { path: path.to_string(), index });
                    }
                }
                ContainerKind::Array
            }
            _ => return Err(ReplicationError::NotAContainer(path.to_string())),
        };

        self.log.push(Instruction::new(container, Action::Set, path.clone(), Some(value)));
        Ok(true)
    }

    /// Delete a key, or null out an array slot. Removing a missing object
    /// key records nothing.
    pub fn unset(&mut self, path: &Path) -> Result<bool, ReplicationError> {
        let (last, parent) = path.split_last().ok_or(ReplicationError::RootMutation)?;

        let container = match Self::parent_mut(&mut self.root, path, parent)? {
            Value::Object(map) => {
                if map.remove(&instruction::segment_key(last)).is_none() {
                    return Ok(false);
                }
                ContainerKind::Object
            }
            Value::Array(arr) => {
                let PathSegment::Index(index) = *last else {
                    return Err(ReplicationError::NotAnArray(path.to_string()));
                };
                match arr.get_mut(index) {
                    Some(slot) => *slot = Value::Null,
                    None => return Ok(false),
                }
                ContainerKind::Array
            }
            _ => return Err(ReplicationError::NotAContainer(path.to_string())),
        };

        self.log.push(Instruction::new(container, Action::Unset, path.clone(), None));
        Ok(true)
    }

    /// Append to the array at `path`. Returns the new length.
    pub fn push(&mut self, path: &Path, value: Value) -> Result<usize, ReplicationError> {
        let arr = Self::array_mut(&mut self.root, path)?;
        arr.push(value.clone());
        let len = arr.len();
        self.log.push(Instruction::new(ContainerKind::Array, Action::Push, path.clone(), Some(value)));
        Ok(len)
    }

    /// Remove the last element of the array at `path`. Popping an empty
    /// array records nothing.
    pub fn pop(&mut self, path: &Path) -> Result<Option<Value>, ReplicationError> {
        let arr = Self::array_mut(&mut self.root, path)?;
        let Some(value) = arr.pop() else {
            return Ok(None);
        };
        self.log.push(Instruction::new(ContainerKind::Array, Action::Pop, path.clone(), None));
        Ok(Some(value))
    }

    /// Splice the array at `path`. Returns the removed elements.
    pub fn splice(
        &mut self,
        path: &Path,
        start: usize,
        delete_count: usize,
        items: Vec<Value>,
    ) -> Result<Vec<Value>, ReplicationError> {
        let arr = Self::array_mut(&mut self.root, path)?;

        let mut args = Vec::with_capacity(items.len() + 2);
        args.push(Value::from(start));
        args.push(Value::from(delete_count));
        args.extend(items.iter().cloned());

        let removed = instruction::splice_array(arr, start, delete_count, items);
        self.log.push(Instruction::new(
            ContainerKind::Array,
            Action::Splice,
            path.clone(),
            Some(Value::Array(args)),
        ));
        Ok(removed)
    }

    /// Replace the subtree at `path` wholesale. At the root, object values
    /// are merged key by key.
    pub fn overwrite(&mut self, path: &Path, value: Value) -> Result<(), ReplicationError> {
        let container = match path.split_last() {
            None => {
                instruction::merge_top_level(&mut self.root, value.clone());
                ContainerKind::Object
            }
            Some((last, parent)) => match Self::parent_mut(&mut self.root, path, parent)? {
                Value::Object(map) => {
                    map.insert(instruction::segment_key(last), value.clone());
                    ContainerKind::Object
                }
                Value::Array(arr) => {
                    let PathSegment::Index(index) = *last else {
                        return Err(ReplicationError::NotAnArray(path.to_string()));
                    };
                    match arr.get_mut(index) {
                        Some(slot) => *slot = value.clone(),
                        None => {
                            return Err(ReplicationError::IndexOutOfBounds { path: path.to_string(), index });
                        }
                    }
                    ContainerKind::Array
                }
                _ => return Err(ReplicationError::NotAContainer(path.to_string())),
            },
        };

        self.log.push(Instruction::new(container, Action::Overwrite, path.clone(), Some(value)));
        Ok(())
    }
}
