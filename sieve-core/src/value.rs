//! The tagged [`Value`] variant that both schemas and documents are made
//! of, plus the small amount of machinery (`TypeName`, path segments) that
//! the rest of the crate builds on.

use std::{
    any::Any,
    fmt::{self, Debug, Display},
    hash::{Hash, Hasher},
};

use dyn_clone::DynClone;
use indexmap::IndexMap;

/// An application-defined value that the engine passes through untouched.
///
/// `Opaque` exists so a host can stash a value of its own (a pre-parsed
/// date, a handle, whatever) inside a document and have it survive
/// normalization unexamined, the same way `coerce`/`validator` callbacks
/// are allowed to be host-defined without the engine understanding them.
pub trait Opaque: Debug + DynClone + Send + Sync {
    /// Structural equality against another opaque value. Implementations
    /// that cannot meaningfully compare themselves to an arbitrary
    /// `&dyn Opaque` should return `false` rather than panicking.
    fn opaque_eq(&self, other: &dyn Opaque) -> bool;

    /// Downcasting hook, mirroring `std::any::Any`.
    fn as_any(&self) -> &dyn Any;
}

dyn_clone::clone_trait_object!(Opaque);

impl PartialEq for dyn Opaque {
    fn eq(&self, other: &Self) -> bool {
        self.opaque_eq(other)
    }
}

/// One segment of a traversal path: either a map key or a sequence index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    /// A `Value::Map` key.
    Key(String),
    /// A `Value::Seq` index.
    Index(usize),
}

impl Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Key(k) => write!(f, "[{k}]"),
            PathSegment::Index(i) => write!(f, "[{i}]"),
        }
    }
}

/// The path from the root of the document to the value currently under
/// consideration. Carried by [`crate::Context`] and copied verbatim into
/// every [`crate::ValueError`].
pub type Stack = Vec<PathSegment>;

/// Renders a stack the way every error's `Display` impl is required to
/// start: `root[k1][k2]…`.
#[must_use]
pub fn format_stack(stack: &[PathSegment]) -> String {
    let mut out = String::from("root");
    for segment in stack {
        out.push_str(&segment.to_string());
    }
    out
}

/// The closed set of type names recognized by `type` and `when_type_is`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeName {
    /// `none` — matches only `Value::Null`.
    None,
    /// `integer` — matches `Value::Int`.
    Integer,
    /// `float` — matches `Value::Float` *and*, per the documented quirk,
    /// `Value::Int`.
    Float,
    /// `number` — matches `Value::Float` and `Value::Int`, identically to
    /// `float`. Kept as a distinct name because schema authors choose
    /// between them for readability, not semantics.
    Number,
    /// `string` — matches `Value::Str`.
    Str,
    /// `boolean` — matches `Value::Bool`. Does **not** match integers.
    Bool,
    /// `dict` — matches `Value::Map`.
    Dict,
    /// `list` — matches `Value::Seq`.
    List,
    /// `set` — matches `Value::Set`.
    Set,
}

impl TypeName {
    /// Parse a directive-level type name string.
    pub fn parse(name: &str) -> Option<TypeName> {
        Some(match name {
            "none" => TypeName::None,
            "integer" => TypeName::Integer,
            "float" => TypeName::Float,
            "number" => TypeName::Number,
            "string" => TypeName::Str,
            "boolean" => TypeName::Bool,
            "dict" => TypeName::Dict,
            "list" => TypeName::List,
            "set" => TypeName::Set,
            _ => return None,
        })
    }

    /// The wire name of this type, as it would appear in a schema.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TypeName::None => "none",
            TypeName::Integer => "integer",
            TypeName::Float => "float",
            TypeName::Number => "number",
            TypeName::Str => "string",
            TypeName::Bool => "boolean",
            TypeName::Dict => "dict",
            TypeName::List => "list",
            TypeName::Set => "set",
        }
    }

    /// The order in which `when_type_is` tries candidate type names against
    /// a runtime value. Preserved verbatim from the source engine: integers
    /// are preferred over floats/numbers, and booleans are tried last (so a
    /// `when_type_is` choice set containing both `boolean` and `integer`
    /// never misclassifies a bool as an int only because `bool` happens to
    /// coerce to an int in some host language — moot in Rust, but the
    /// ordering is kept for behavioral parity).
    #[must_use]
    pub fn precedence() -> &'static [TypeName] {
        &[
            TypeName::None,
            TypeName::Integer,
            TypeName::Float,
            TypeName::Number,
            TypeName::Dict,
            TypeName::List,
            TypeName::Str,
            TypeName::Bool,
        ]
    }
}

impl Display for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The tagged variant that both schemas and the documents they validate are
/// made of.
///
/// `Map` preserves insertion order (backed by [`IndexMap`]) and its keys are
/// always `String` — there is no "object with arbitrary key type" case, by
/// design: a schema is itself a `Value::Map`, and schema authors write
/// string keys.
#[derive(Debug, Clone)]
pub enum Value {
    /// The absence of a value.
    Null,
    /// A boolean.
    Bool(bool),
    /// A 64-bit signed integer.
    Int(i64),
    /// A 64-bit float.
    Float(f64),
    /// A UTF-8 string.
    Str(String),
    /// An ordered sequence of values.
    Seq(Vec<Value>),
    /// An insertion-ordered mapping from string keys to values.
    Map(IndexMap<String, Value>),
    /// An unordered-semantics collection of values. The engine does not
    /// deduplicate on construction; see the module docs.
    Set(Vec<Value>),
    /// A host-defined passthrough value.
    Opaque(Box<dyn Opaque>),
}

impl Value {
    /// Construct an empty map.
    #[must_use]
    pub fn empty_map() -> Value {
        Value::Map(IndexMap::new())
    }

    /// Construct an empty sequence.
    #[must_use]
    pub fn empty_seq() -> Value {
        Value::Seq(Vec::new())
    }

    /// Construct an empty set.
    #[must_use]
    pub fn empty_set() -> Value {
        Value::Set(Vec::new())
    }

    /// The [`TypeName`] this value's own shape corresponds to (the
    /// "primary" type, ignoring the integer/float/number overlap quirk —
    /// use [`Value::satisfies`] for type-checking).
    #[must_use]
    pub fn shape(&self) -> TypeName {
        match self {
            Value::Null => TypeName::None,
            Value::Bool(_) => TypeName::Bool,
            Value::Int(_) => TypeName::Integer,
            Value::Float(_) => TypeName::Float,
            Value::Str(_) => TypeName::Str,
            Value::Seq(_) => TypeName::List,
            Value::Map(_) => TypeName::Dict,
            Value::Set(_) => TypeName::Set,
            Value::Opaque(_) => TypeName::None,
        }
    }

    /// Whether this value satisfies a `CheckType`/`when_type_is` type name,
    /// including the documented exception that integers also satisfy
    /// `float` and `number`.
    #[must_use]
    pub fn satisfies(&self, want: TypeName) -> bool {
        match (self, want) {
            (Value::Null, TypeName::None) => true,
            (Value::Bool(_), TypeName::Bool) => true,
            (Value::Int(_), TypeName::Integer | TypeName::Float | TypeName::Number) => true,
            (Value::Float(_), TypeName::Float | TypeName::Number) => true,
            (Value::Str(_), TypeName::Str) => true,
            (Value::Seq(_), TypeName::List) => true,
            (Value::Map(_), TypeName::Dict) => true,
            (Value::Set(_), TypeName::Set) => true,
            _ => false,
        }
    }

    /// The length used by `minlength`/`maxlength`: character count for
    /// strings, element count for sequences/sets, entry count for maps.
    /// `None` for scalars for which length has no meaning.
    #[must_use]
    pub fn length(&self) -> Option<usize> {
        match self {
            Value::Str(s) => Some(s.chars().count()),
            Value::Seq(items) => Some(items.len()),
            Value::Set(items) => Some(items.len()),
            Value::Map(map) => Some(map.len()),
            _ => None,
        }
    }

    /// Numeric comparison used by `min`/`max`, honoring the integer/float
    /// overlap: an `Int` and a `Float` bound compare by converting the
    /// integer to `f64`.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            #[allow(clippy::cast_precision_loss)]
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// View this value as a map key lookup of a branch discriminator.
    /// Discriminators must be strings; see `SPEC_FULL.md` §4.1.
    #[must_use]
    pub fn as_discriminator(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Downcast to a `&dyn Opaque`'s inner type, if this is an `Opaque`
    /// holding a `T`.
    #[must_use]
    pub fn downcast_opaque<T: 'static>(&self) -> Option<&T> {
        match self {
            Value::Opaque(o) => o.as_any().downcast_ref::<T>(),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Seq(a), Value::Seq(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Set(a), Value::Set(b)) => a == b,
            (Value::Opaque(a), Value::Opaque(b)) => a.as_ref() == b.as_ref(),
            _ => false,
        }
    }
}
impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Bool(b) => b.hash(state),
            Value::Int(i) => i.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::Str(s) => s.hash(state),
            Value::Seq(items) => items.hash(state),
            Value::Map(map) => {
                for (k, v) in map {
                    k.hash(state);
                    v.hash(state);
                }
            }
            Value::Set(items) => items.hash(state),
            Value::Opaque(_) => {}
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}
impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}
impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}
impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}
impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

/// Error converting a [`serde_json::Value`] into a [`Value`]. JSON has no
/// representation for `Set` or `Opaque`, but every JSON value otherwise has
/// a direct `Value` counterpart, so this conversion is in practice
/// infallible; the error type exists for forward compatibility (e.g. a
/// future JSON extension) rather than because a current failure mode
/// exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FromJsonError;

impl Display for FromJsonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("value could not be converted from JSON")
    }
}
impl std::error::Error for FromJsonError {}

impl TryFrom<serde_json::Value> for Value {
    type Error = FromJsonError;

    fn try_from(json: serde_json::Value) -> Result<Self, Self::Error> {
        Ok(match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(f) = n.as_f64() {
                    Value::Float(f)
                } else {
                    return Err(FromJsonError);
                }
            }
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(items) => Value::Seq(
                items
                    .into_iter()
                    .map(Value::try_from)
                    .collect::<Result<_, _>>()?,
            ),
            serde_json::Value::Object(map) => {
                let mut out = IndexMap::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k, Value::try_from(v)?);
                }
                Value::Map(out)
            }
        })
    }
}

/// Error converting a [`Value`] back to [`serde_json::Value`]: `Set` and
/// `Opaque` have no JSON representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToJsonError {
    /// A `Value::Set` was encountered.
    SetNotRepresentable,
    /// A `Value::Opaque` was encountered.
    OpaqueNotRepresentable,
}

impl Display for ToJsonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToJsonError::SetNotRepresentable => f.write_str("`set` values have no JSON form"),
            ToJsonError::OpaqueNotRepresentable => {
                f.write_str("`opaque` values have no JSON form")
            }
        }
    }
}
impl std::error::Error for ToJsonError {}

impl TryFrom<Value> for serde_json::Value {
    type Error = ToJsonError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Ok(match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Int(i) => serde_json::Value::Number(i.into()),
            Value::Float(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Str(s) => serde_json::Value::String(s),
            Value::Seq(items) => serde_json::Value::Array(
                items
                    .into_iter()
                    .map(serde_json::Value::try_from)
                    .collect::<Result<_, _>>()?,
            ),
            Value::Map(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k, serde_json::Value::try_from(v)?);
                }
                serde_json::Value::Object(out)
            }
            Value::Set(_) => return Err(ToJsonError::SetNotRepresentable),
            Value::Opaque(_) => return Err(ToJsonError::OpaqueNotRepresentable),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_satisfies_float_and_number() {
        let v = Value::Int(3);
        assert!(v.satisfies(TypeName::Integer));
        assert!(v.satisfies(TypeName::Float));
        assert!(v.satisfies(TypeName::Number));
        assert!(!v.satisfies(TypeName::Bool));
    }

    #[test]
    fn boolean_does_not_satisfy_integer() {
        let v = Value::Bool(true);
        assert!(!v.satisfies(TypeName::Integer));
        assert!(v.satisfies(TypeName::Bool));
    }

    #[test]
    fn round_trips_through_json() {
        let json = serde_json::json!({"a": [1, 2.5, "x", null, true]});
        let value = Value::try_from(json.clone()).unwrap();
        let back = serde_json::Value::try_from(value).unwrap();
        assert_eq!(json, back);
    }

    #[test]
    fn format_stack_renders_brackets() {
        let stack = vec![PathSegment::Key("a".into()), PathSegment::Index(2)];
        assert_eq!(format_stack(&stack), "root[a][2]");
    }

    #[test]
    fn type_name_precedence_is_fixed() {
        let order = TypeName::precedence();
        assert_eq!(order[0], TypeName::None);
        assert_eq!(order[1], TypeName::Integer);
        assert_eq!(*order.last().unwrap(), TypeName::Bool);
    }
}
