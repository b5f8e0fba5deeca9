//! Built-in default-setters and coercers, registered into the root
//! [`crate::context::Context`] by default so schema authors can reference
//! them by name without a host having to wire anything up.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::callback::{CallbackError, Coercer, DefaultSetter};
use crate::value::Value;

fn default_list(_doc: &Value) -> Result<Value, CallbackError> {
    Ok(Value::empty_seq())
}

fn default_dict(_doc: &Value) -> Result<Value, CallbackError> {
    Ok(Value::empty_map())
}

fn default_set(_doc: &Value) -> Result<Value, CallbackError> {
    Ok(Value::empty_set())
}

/// `list`, `dict`, `set` — the built-in `default_setter` names.
#[must_use]
pub fn builtin_defaults() -> IndexMap<String, DefaultSetter> {
    let mut m: IndexMap<String, DefaultSetter> = IndexMap::new();
    m.insert("list".to_owned(), Arc::new(default_list));
    m.insert("dict".to_owned(), Arc::new(default_dict));
    m.insert("set".to_owned(), Arc::new(default_set));
    m
}

fn to_list(value: &Value) -> Result<Value, CallbackError> {
    Ok(match value {
        Value::Seq(_) => value.clone(),
        Value::Set(items) => Value::Seq(items.clone()),
        other => Value::Seq(vec![other.clone()]),
    })
}

fn to_set(value: &Value) -> Result<Value, CallbackError> {
    Ok(match value {
        Value::Set(_) => value.clone(),
        Value::Seq(items) => Value::Set(items.clone()),
        other => Value::Set(vec![other.clone()]),
    })
}

#[derive(Debug)]
struct NotStringConvertible(crate::value::TypeName);

impl std::fmt::Display for NotStringConvertible {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} has no string representation", self.0)
    }
}

impl std::error::Error for NotStringConvertible {}

fn to_str(value: &Value) -> Result<Value, CallbackError> {
    let s = match value {
        Value::Str(_) => return Ok(value.clone()),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Null => "null".to_owned(),
        other => return Err(Arc::new(NotStringConvertible(other.shape()))),
    };
    Ok(Value::Str(s))
}

/// `to_list`, `to_set`, `to_str` — the built-in `coerce`/`coerce_post` names.
#[must_use]
pub fn builtin_coerces() -> IndexMap<String, Coercer> {
    let mut m: IndexMap<String, Coercer> = IndexMap::new();
    m.insert("to_list".to_owned(), Arc::new(to_list));
    m.insert("to_set".to_owned(), Arc::new(to_set));
    m.insert("to_str".to_owned(), Arc::new(to_str));
    m
}
