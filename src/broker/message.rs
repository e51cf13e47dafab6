//! Message definitions for the broker
//!
//! `Message` is the unit routed by the broker. Once published it is wrapped
//! in an `Arc` and shared read-only with every subscriber it reaches.
//!
//! Notes on fields:
//! - `topic`: dot-segmented routing key
//! - `payload`: a [`Payload`] value graph, frozen to plain data on publish
//! - `id`: opaque unique id; the broker assigns a UUID when left empty
//! - `timestamp`: milliseconds since UNIX epoch; assigned when left at `0`
//! - `retain`: keep as the topic's last value for late subscribers
//! - `reply_to` / `correlation_id`: set on requests, echoed on replies
//! - `headers`: free-form string metadata

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::{Map, Number, Value};

use crate::utils::error::ValidationError;

/// A value carried by a message.
///
/// The plain variants mirror JSON. `Shared` lets one node be referenced from
/// several places (and so can express cycles); `Opaque` stands for a value
/// that has no data representation at all, such as a callable or a native
/// handle. Neither survives validation: cycles and opaque values are
/// rejected, and shared nodes are flattened into plain copies.
#[derive(Clone, Default)]
pub enum Payload {
    #[default]
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    List(Vec<Payload>),
    Map(BTreeMap<String, Payload>),
    Shared(SharedPayload),
    Opaque(Opaque),
}

/// A reference-counted, mutable payload node.
#[derive(Clone, Default)]
pub struct SharedPayload(Arc<RwLock<Payload>>);

impl SharedPayload {
    pub fn new(value: Payload) -> Self {
        Self(Arc::new(RwLock::new(value)))
    }

    /// Replace the node's value. Every holder of this node observes it.
    pub fn set(&self, value: Payload) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = value;
    }

    /// Run `f` against the node's current value.
    pub fn with<R>(&self, f: impl FnOnce(&Payload) -> R) -> R {
        f(&self.0.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Mutate the node in place, e.g. to push a reference to itself.
    pub fn update(&self, f: impl FnOnce(&mut Payload)) {
        f(&mut self.0.write().unwrap_or_else(PoisonError::into_inner));
    }

    fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    pub fn ptr_eq(&self, other: &SharedPayload) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Marker for a non-data value; only its kind is kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opaque {
    pub kind: String,
}

impl Opaque {
    pub fn new(kind: impl Into<String>) -> Self {
        Self { kind: kind.into() }
    }

    pub fn function() -> Self {
        Self::new("function")
    }
}

impl Payload {
    pub fn shared(value: impl Into<Payload>) -> (Payload, SharedPayload) {
        let node = SharedPayload::new(value.into());
        (Payload::Shared(node.clone()), node)
    }

    pub fn map<K, V, I>(entries: I) -> Payload
    where
        K: Into<String>,
        V: Into<Payload>,
        I: IntoIterator<Item = (K, V)>,
    {
        Payload::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Convert to plain JSON, rejecting cycles and non-data values.
    pub fn to_json(&self) -> Result<Value, ValidationError> {
        let mut path = Vec::new();
        let mut ancestors = Vec::new();
        self.walk(&mut path, &mut ancestors)
    }

    fn walk(
        &self,
        path: &mut Vec<String>,
        ancestors: &mut Vec<usize>,
    ) -> Result<Value, ValidationError> {
        match self {
            Payload::Null => Ok(Value::Null),
            Payload::Bool(b) => Ok(Value::Bool(*b)),
            Payload::Integer(i) => Ok(Value::Number((*i).into())),
            Payload::Float(f) => {
                Number::from_f64(*f)
                    .map(Value::Number)
                    .ok_or_else(|| ValidationError::NotSerializable {
                        path: render_path(path),
                        kind: "non-finite number".to_string(),
                    })
            }
            Payload::Text(s) => Ok(Value::String(s.clone())),
            Payload::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    path.push(format!("[{i}]"));
                    out.push(item.walk(path, ancestors)?);
                    path.pop();
                }
                Ok(Value::Array(out))
            }
            Payload::Map(entries) => {
                let mut out = Map::with_capacity(entries.len());
                for (key, item) in entries {
                    path.push(format!(".{key}"));
                    out.insert(key.clone(), item.walk(path, ancestors)?);
                    path.pop();
                }
                Ok(Value::Object(out))
            }
            Payload::Shared(node) => {
                let addr = node.addr();
                // checked before locking, so a cycle never re-enters a held lock
                if ancestors.contains(&addr) {
                    return Err(ValidationError::CyclicReference {
                        path: render_path(path),
                    });
                }
                ancestors.push(addr);
                let result = node.with(|inner| inner.walk(path, ancestors));
                ancestors.pop();
                result
            }
            Payload::Opaque(opaque) => Err(ValidationError::NotSerializable {
                path: render_path(path),
                kind: opaque.kind.clone(),
            }),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Payload::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Payload::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Payload> {
        match self {
            Payload::Map(entries) => entries.get(key),
            _ => None,
        }
    }
}

fn render_path(path: &[String]) -> String {
    if path.is_empty() {
        "$".to_string()
    } else {
        format!("${}", path.concat())
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Null => f.write_str("Null"),
            Payload::Bool(b) => write!(f, "Bool({b})"),
            Payload::Integer(i) => write!(f, "Integer({i})"),
            Payload::Float(x) => write!(f, "Float({x})"),
            Payload::Text(s) => write!(f, "Text({s:?})"),
            Payload::List(items) => f.debug_list().entries(items).finish(),
            Payload::Map(entries) => f.debug_map().entries(entries).finish(),
            // never follow shared nodes here, they may be cyclic
            Payload::Shared(node) => write!(f, "Shared({:#x})", node.addr()),
            Payload::Opaque(o) => write!(f, "Opaque({})", o.kind),
        }
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Payload::Null, Payload::Null) => true,
            (Payload::Bool(a), Payload::Bool(b)) => a == b,
            (Payload::Integer(a), Payload::Integer(b)) => a == b,
            (Payload::Float(a), Payload::Float(b)) => a == b,
            (Payload::Text(a), Payload::Text(b)) => a == b,
            (Payload::List(a), Payload::List(b)) => a == b,
            (Payload::Map(a), Payload::Map(b)) => a == b,
            (Payload::Shared(a), Payload::Shared(b)) => a.ptr_eq(b),
            (Payload::Opaque(a), Payload::Opaque(b)) => a == b,
            _ => false,
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Payload::Null,
            Value::Bool(b) => Payload::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Payload::Integer(i),
                None => Payload::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => Payload::Text(s),
            Value::Array(items) => Payload::List(items.into_iter().map(Payload::from).collect()),
            Value::Object(entries) => Payload::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, Payload::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<bool> for Payload {
    fn from(b: bool) -> Self {
        Payload::Bool(b)
    }
}

impl From<i64> for Payload {
    fn from(i: i64) -> Self {
        Payload::Integer(i)
    }
}

impl From<i32> for Payload {
    fn from(i: i32) -> Self {
        Payload::Integer(i.into())
    }
}

impl From<u32> for Payload {
    fn from(i: u32) -> Self {
        Payload::Integer(i.into())
    }
}

impl From<f64> for Payload {
    fn from(f: f64) -> Self {
        Payload::Float(f)
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::Text(s)
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::Text(s.to_string())
    }
}

impl<T: Into<Payload>> From<Vec<T>> for Payload {
    fn from(items: Vec<T>) -> Self {
        Payload::List(items.into_iter().map(Into::into).collect())
    }
}

impl From<Opaque> for Payload {
    fn from(o: Opaque) -> Self {
        Payload::Opaque(o)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    pub topic: String,
    pub payload: Payload,
    pub id: String,
    pub timestamp: i64,
    pub retain: bool,
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
    pub headers: Option<HashMap<String, String>>,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Payload>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            ..Self::default()
        }
    }

    /// Mark the message as the topic's retained last value.
    pub fn retained(mut self) -> Self {
        self.retain = true;
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.as_ref()?.get(key).map(String::as_str)
    }

    /// True when a responder is expected to answer this message.
    pub fn is_request(&self) -> bool {
        self.reply_to.is_some() && self.correlation_id.is_some()
    }
}
