//! Core types for preference synchronization

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Default settings root under which every preference item lives on the PAN.
///
/// Kept byte-for-byte stable so nodes can interoperate with existing deployments.
pub const DEFAULT_SETTINGS_PATH: &str = "/PrefSyncService/data/settings";

/// Reserved payload field carrying the bulk-push tag. Never a real preference key.
pub const KEY_TIMESTAMP: &str = "timestamp";

/// Local marker recording that an initial pull has been requested on this node.
pub const KEY_SYNC_DONE: &str = "PrefListener.sync_done";

/// Identifier of a preference within a store
pub type PreferenceKey = String;

/// A typed preference value.
///
/// Equality is value-and-type equality: `Int(5)` and `Long(5)` are different values.
/// Floats compare by bit pattern, so `NaN` equals itself and `-0.0` differs from `0.0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum PrefValue {
    Bool(bool),
    Float(#[serde(with = "float_repr")] f64),
    Int(i32),
    Long(i64),
    String(String),
    StringSet(BTreeSet<String>),
}

impl PrefValue {
    /// The kind of this value
    pub fn kind(&self) -> ValueKind {
        match self {
            PrefValue::Bool(_) => ValueKind::Bool,
            PrefValue::Float(_) => ValueKind::Float,
            PrefValue::Int(_) => ValueKind::Int,
            PrefValue::Long(_) => ValueKind::Long,
            PrefValue::String(_) => ValueKind::String,
            PrefValue::StringSet(_) => ValueKind::StringSet,
        }
    }

    /// Parse a textual value as the given kind.
    ///
    /// String sets are comma separated; surrounding whitespace of each member is trimmed.
    pub fn parse(kind: ValueKind, raw: &str) -> Result<Self, SyncError> {
        let invalid = |e: &dyn fmt::Display| {
            SyncError::InvalidValue(format!("'{}' is not a valid {}: {}", raw, kind, e))
        };

        let value = match kind {
            ValueKind::Bool => PrefValue::Bool(raw.trim().parse().map_err(|e| invalid(&e))?),
            ValueKind::Float => PrefValue::Float(raw.trim().parse().map_err(|e| invalid(&e))?),
            ValueKind::Int => PrefValue::Int(raw.trim().parse().map_err(|e| invalid(&e))?),
            ValueKind::Long => PrefValue::Long(raw.trim().parse().map_err(|e| invalid(&e))?),
            ValueKind::String => PrefValue::String(raw.to_string()),
            ValueKind::StringSet => PrefValue::StringSet(
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            ),
        };
        Ok(value)
    }
}

impl PartialEq for PrefValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PrefValue::Bool(a), PrefValue::Bool(b)) => a == b,
            (PrefValue::Float(a), PrefValue::Float(b)) => a.to_bits() == b.to_bits(),
            (PrefValue::Int(a), PrefValue::Int(b)) => a == b,
            (PrefValue::Long(a), PrefValue::Long(b)) => a == b,
            (PrefValue::String(a), PrefValue::String(b)) => a == b,
            (PrefValue::StringSet(a), PrefValue::StringSet(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for PrefValue {}

/// JSON has no non-finite numbers; those travel as the strings
/// `"NaN"`, `"Infinity"` and `"-Infinity"`.
mod float_repr {
    use serde::de::{self, Unexpected};
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else if value.is_nan() {
            serializer.serialize_str("NaN")
        } else if value.is_sign_positive() {
            serializer.serialize_str("Infinity")
        } else {
            serializer.serialize_str("-Infinity")
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(n) => Ok(n),
            Repr::Text(text) => match text.as_str() {
                "NaN" => Ok(f64::NAN),
                "Infinity" => Ok(f64::INFINITY),
                "-Infinity" => Ok(f64::NEG_INFINITY),
                other => Err(de::Error::invalid_value(
                    Unexpected::Str(other),
                    &"a number, NaN, Infinity or -Infinity",
                )),
            },
        }
    }
}

impl fmt::Display for PrefValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrefValue::Bool(v) => write!(f, "{}", v),
            PrefValue::Float(v) => write!(f, "{}", v),
            PrefValue::Int(v) => write!(f, "{}", v),
            PrefValue::Long(v) => write!(f, "{}", v),
            PrefValue::String(v) => write!(f, "{:?}", v),
            PrefValue::StringSet(set) => {
                let members: Vec<&str> = set.iter().map(String::as_str).collect();
                write!(f, "[{}]", members.join(", "))
            }
        }
    }
}

impl From<bool> for PrefValue {
    fn from(v: bool) -> Self {
        PrefValue::Bool(v)
    }
}

impl From<f64> for PrefValue {
    fn from(v: f64) -> Self {
        PrefValue::Float(v)
    }
}

impl From<i32> for PrefValue {
    fn from(v: i32) -> Self {
        PrefValue::Int(v)
    }
}

impl From<i64> for PrefValue {
    fn from(v: i64) -> Self {
        PrefValue::Long(v)
    }
}

impl From<&str> for PrefValue {
    fn from(v: &str) -> Self {
        PrefValue::String(v.to_string())
    }
}

impl From<String> for PrefValue {
    fn from(v: String) -> Self {
        PrefValue::String(v)
    }
}

impl From<BTreeSet<String>> for PrefValue {
    fn from(v: BTreeSet<String>) -> Self {
        PrefValue::StringSet(v)
    }
}

/// The six supported value kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Bool,
    Float,
    Int,
    Long,
    String,
    StringSet,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Bool => "bool",
            ValueKind::Float => "float",
            ValueKind::Int => "int",
            ValueKind::Long => "long",
            ValueKind::String => "string",
            ValueKind::StringSet => "set",
        };
        f.write_str(name)
    }
}

impl FromStr for ValueKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bool" | "boolean" => Ok(ValueKind::Bool),
            "float" | "double" => Ok(ValueKind::Float),
            "int" | "int32" => Ok(ValueKind::Int),
            "long" | "int64" => Ok(ValueKind::Long),
            "string" | "str" => Ok(ValueKind::String),
            "set" | "string_set" | "string-set" => Ok(ValueKind::StringSet),
            other => Err(SyncError::InvalidValue(format!("unknown value kind '{}'", other))),
        }
    }
}

/// A queued write: either a value to publish or a tombstone for a removed key
#[derive(Debug, Clone, PartialEq)]
pub enum PendingEntry {
    Put(PrefValue),
    Tombstone,
}

impl From<Option<PrefValue>> for PendingEntry {
    fn from(value: Option<PrefValue>) -> Self {
        match value {
            Some(v) => PendingEntry::Put(v),
            None => PendingEntry::Tombstone,
        }
    }
}

/// Connection state of the transport, as seen by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
        }
    }
}

/// The single deferred action latched while the transport is not connected.
///
/// `FullPull` preempts `FlushQueue`; a latched action is overwritten, never queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PendingAction {
    #[default]
    None,
    FlushQueue,
    FullPull,
}

impl PendingAction {
    /// Combine the latched action with a newly requested one.
    pub fn escalate(self, requested: PendingAction) -> PendingAction {
        match (self, requested) {
            (PendingAction::FullPull, _) | (_, PendingAction::FullPull) => PendingAction::FullPull,
            (PendingAction::FlushQueue, _) | (_, PendingAction::FlushQueue) => {
                PendingAction::FlushQueue
            }
            (PendingAction::None, PendingAction::None) => PendingAction::None,
        }
    }
}

/// Host-supplied predicate deciding which keys participate in sync
pub type SyncFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Build a [`SyncFilter`] from a closure
pub fn sync_filter<F>(f: F) -> SyncFilter
where
    F: Fn(&str) -> bool + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Path of the per-key item for `key` under `root`
pub fn key_path(root: &str, key: &str) -> String {
    format!("{}/{}", root, key)
}

/// Extract the preference key addressed by a per-key item path.
///
/// The inverse of [`key_path`]: everything after `root/` is the key, so a key
/// containing `/` survives the trip. Returns `None` for the root itself
/// (multi-key items carry no single key) and for paths outside the root.
pub fn key_for_path<'a>(root: &str, path: &'a str) -> Option<&'a str> {
    let key = path.strip_prefix(root)?.strip_prefix('/')?;
    if key.is_empty() {
        None
    } else {
        Some(key)
    }
}

/// Whether `path` lies at or under `root`
pub fn is_under_root(root: &str, path: &str) -> bool {
    match path.strip_prefix(root) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}
