//! Mutation Instructions
//!
//! The wire form of a single mutation to the replicated document, plus the
//! path and array helpers shared by the recorder and the reducer.

use std::fmt;
use std::sync::Arc;

use serde::{Serialize, Deserialize};
use serde_json::Value;

/// One step into the document: an object key or an array index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

/// Path from the document root.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Path(Vec<PathSegment>);

impl Path {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Extend with an object key.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.0.push(PathSegment::Key(key.into()));
        self
    }

    /// Extend with an array index.
    pub fn index(mut self, index: usize) -> Self {
        self.0.push(PathSegment::Index(index));
        self
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Parent segments and the final segment.
    pub fn split_last(&self) -> Option<(&PathSegment, &[PathSegment])> {
        self.0.split_last()
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("<root>");
        }
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            match segment {
                PathSegment::Key(k) => f.write_str(k)?,
                PathSegment::Index(n) => write!(f, "{n}")?,
            }
        }
        Ok(())
    }
}

/// Container the mutated value lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerKind {
    Object,
    Array,
}

/// Mutation applied at the path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Set,
    Unset,
    Push,
    Pop,
    Splice,
    Overwrite,
}

/// A recorded mutation.
///
/// For `splice` the value is `[start, deleteCount, ...items]`; for `push`
/// it is the pushed item.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    #[serde(rename = "type")]
    pub container: ContainerKind,
    pub action: Action,
    pub path: Path,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl Instruction {
    pub fn new(container: ContainerKind, action: Action, path: Path, value: Option<Value>) -> Self {
        Self { container, action, path, value }
    }
}

/// A drained batch, shared by every recipient of one broadcast.
pub type InstructionBatch = Arc<Vec<Instruction>>;

// =============================================================================
// DOCUMENT HELPERS
// =============================================================================

fn step<'a>(value: &'a Value, segment: &PathSegment) -> Option<&'a Value> {
    match (value, segment) {
        (Value::Object(map), PathSegment::Key(k)) => map.get(k),
        (Value::Array(arr), PathSegment::Index(i)) => arr.get(*i),
        // Numeric-looking keys on objects
        (Value::Object(map), PathSegment::Index(i)) => map.get(&i.to_string()),
        _ => None,
    }
}

fn step_mut<'a>(value: &'a mut Value, segment: &PathSegment) -> Option<&'a mut Value> {
    match (value, segment) {
        (Value::Object(map), PathSegment::Key(k)) => map.get_mut(k),
        (Value::Array(arr), PathSegment::Index(i)) => arr.get_mut(*i),
        (Value::Object(map), PathSegment::Index(i)) => map.get_mut(&i.to_string()),
        _ => None,
    }
}

/// Resolve a path against a document.
pub(crate) fn resolve<'a>(root: &'a Value, segments: &[PathSegment]) -> Option<&'a Value> {
    segments.iter().try_fold(root, |v, s| step(v, s))
}

/// Resolve a path mutably.
pub(crate) fn resolve_mut<'a>(root: &'a mut Value, segments: &[PathSegment]) -> Option<&'a mut Value> {
    segments.iter().try_fold(root, |v, s| step_mut(v, s))
}

/// Object key for a segment.
pub(crate) fn segment_key(segment: &PathSegment) -> String {
    match segment {
        PathSegment::Key(k) => k.clone(),
        PathSegment::Index(i) => i.to_string(),
    }
}

/// Array splice with start and count clamped to the array.
pub(crate) fn splice_array(
    arr: &mut Vec<Value>,
    start: usize,
    delete_count: usize,
    items: Vec<Value>,
) -> Vec<Value> {
    let start = start.min(arr.len());
    let end = start.saturating_add(delete_count).min(arr.len());
    arr.splice(start..end, items).collect()
}

/// Shallow-merge `incoming` into `target` when both are objects; replace
/// otherwise.
pub(crate) fn merge_top_level(target: &mut Value, incoming: Value) {
    match (target, incoming) {
        (Value::Object(dst), Value::Object(src)) => {
            for (k, v) in src {
                dst.insert(k, v);
            }
        }
        (target, incoming) => *target = incoming,
    }
}
