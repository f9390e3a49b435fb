//! A model of the host's runtime values. Objects, lists and functions are shared references, so a
//! cloned `Value` points at the same thing the host sees, and patches made through one clone are
//! visible through every other.

use std::{fmt, sync::Arc};

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::hook::chain::Slot;

#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    List(List),
    Object(Object),
    Function(Function),
}

/// The broad type of a value, used by structural module filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ValueKind {
    Null,
    Bool,
    Number,
    String,
    List,
    Object,
    Function,
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Number(_) => ValueKind::Number,
            Value::Str(_) => ValueKind::String,
            Value::List(_) => ValueKind::List,
            Value::Object(_) => ValueKind::Object,
            Value::Function(_) => ValueKind::Function,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&List> {
        match self {
            Value::List(list) => Some(list),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(object) => Some(object),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Function> {
        match self {
            Value::Function(function) => Some(function),
            _ => None,
        }
    }

    /// Property lookup that treats anything other than an object as having no properties.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.as_object().and_then(|object| object.get(key))
    }
}

/// Scalars compare by value. Lists, objects and functions compare by identity, as they do in the
/// host.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a.ptr_eq(b),
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            (Value::Function(a), Value::Function(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => fmt::Debug::fmt(b, f),
            Value::Number(n) => fmt::Debug::fmt(n, f),
            Value::Str(s) => fmt::Debug::fmt(s, f),
            Value::List(list) => fmt::Debug::fmt(list, f),
            Value::Object(object) => fmt::Debug::fmt(object, f),
            Value::Function(function) => fmt::Debug::fmt(function, f),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n.into())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<List> for Value {
    fn from(list: List) -> Self {
        Value::List(list)
    }
}

impl From<Object> for Value {
    fn from(object: Object) -> Self {
        Value::Object(object)
    }
}

impl From<Function> for Value {
    fn from(function: Function) -> Self {
        Value::Function(function)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        use serde_json::Value as Json;

        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(b),
            // Every JSON number fits in an f64, if not always exactly.
            Json::Number(n) => Value::Number(n.as_f64().unwrap_or_default()),
            Json::String(s) => Value::Str(s),
            Json::Array(items) => Value::List(items.into_iter().map(Value::from).collect()),
            Json::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(key, value)| (key, Value::from(value)))
                    .collect(),
            ),
        }
    }
}

/// A shared, insertion-ordered property map.
#[derive(Clone, Default)]
pub struct Object(Arc<Mutex<IndexMap<String, Value>>>);

impl Object {
    pub fn new() -> Object {
        Object::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.0.lock().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.lock().insert(key.into(), value.into());
    }

    /// Builder form of `set`, for constructing objects inline.
    pub fn with(self, key: impl Into<String>, value: impl Into<Value>) -> Object {
        self.set(key, value);
        self
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.0.lock().shift_remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.lock().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.0.lock().keys().cloned().collect()
    }

    pub fn entries(&self) -> Vec<(String, Value)> {
        self.0
            .lock()
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ptr_eq(&self, other: &Object) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Replaces `key` only if it still holds `expected`. Returns whether the swap happened.
    pub(crate) fn replace_if(&self, key: &str, expected: &Value, new: Value) -> bool {
        let mut map = self.0.lock();

        match map.get_mut(key) {
            Some(current) if current == expected => {
                *current = new;
                true
            }

            _ => false,
        }
    }
}

impl FromIterator<(String, Value)> for Object {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Object(Arc::new(Mutex::new(iter.into_iter().collect())))
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.entries()).finish()
    }
}

/// A shared, growable list.
#[derive(Clone, Default)]
pub struct List(Arc<Mutex<Vec<Value>>>);

impl List {
    pub fn new() -> List {
        List::default()
    }

    pub fn push(&self, value: impl Into<Value>) {
        self.0.lock().push(value.into());
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.0.lock().get(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Vec<Value> {
        self.0.lock().clone()
    }

    pub fn ptr_eq(&self, other: &List) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl FromIterator<Value> for List {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        List(Arc::new(Mutex::new(iter.into_iter().collect())))
    }
}

impl fmt::Debug for List {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.to_vec()).finish()
    }
}

type NativeFn = dyn Fn(&[Value]) -> eyre::Result<Value> + Send + Sync;

enum Body {
    Native(Box<NativeFn>),

    /// A wrapper installed by the injector. Calls are routed through the slot's patch records.
    Patched(Arc<Slot>),
}

/// A callable host value.
#[derive(Clone)]
pub struct Function(Arc<Body>);

impl Function {
    pub fn new<F>(f: F) -> Function
    where
        F: Fn(&[Value]) -> eyre::Result<Value> + Send + Sync + 'static,
    {
        Function(Arc::new(Body::Native(Box::new(f))))
    }

    pub(crate) fn patched(slot: Arc<Slot>) -> Function {
        Function(Arc::new(Body::Patched(slot)))
    }

    pub fn call(&self, args: &[Value]) -> eyre::Result<Value> {
        match self.0.as_ref() {
            Body::Native(f) => f(args),
            Body::Patched(slot) => slot.invoke(args),
        }
    }

    /// Returns the patch slot if this function is an injector wrapper.
    pub(crate) fn slot(&self) -> Option<&Arc<Slot>> {
        match self.0.as_ref() {
            Body::Native(_) => None,
            Body::Patched(slot) => Some(slot),
        }
    }

    pub fn is_patched(&self) -> bool {
        self.slot().is_some()
    }

    pub fn ptr_eq(&self, other: &Function) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_ref() {
            Body::Native(_) => write!(f, "Function({:p})", Arc::as_ptr(&self.0)),
            Body::Patched(_) => write!(f, "Function({:p}, patched)", Arc::as_ptr(&self.0)),
        }
    }
}
