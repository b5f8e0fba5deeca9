#![doc = include_str!("../README.md")]
#![deny(clippy::all, clippy::pedantic)]
#![allow(
    clippy::module_name_repetitions,
    clippy::result_large_err,
    clippy::large_enum_variant,
    clippy::must_use_candidate
)]

//! Public facade for the `sieve` data-validation and normalization engine.
//!
//! This crate wires together the two halves that do the actual work:
//!
//! - [`sieve_schema::compile`] turns a directive-mapping [`Value`] into a
//!   [`Program`].
//! - [`sieve_core::interpret`] runs a `Program` against a document.
//!
//! Everything here is a thin, ergonomic layer over those two calls: picking
//! the default registries, building the root [`Context`], and unifying
//! [`SchemaError`] and [`ValueError`] into one [`Error`] so a caller doesn't
//! need to know which phase failed.

use std::sync::Arc;

use sieve_core::context::Registries;
pub use sieve_core::{Context, FieldMeta, Instruction, PathSegment, Program, SchemaError, Stack, TypeName, Value, ValueError};
pub use sieve_schema::compile;
/// Wrapper types for embedding a host's own closures (`coerce_registry`
/// entries, `validator`, `choose_schema.function`, …) inside a schema
/// [`Value`] tree. See [`sieve_schema::opaque`] for the full set.
pub use sieve_schema::opaque;

/// Runtime knobs for [`normalize`]/[`normalize_dict`]. See `SPEC_FULL.md`
/// §5 for the semantics of each.
#[derive(Debug, Clone)]
pub struct Options {
    /// Whether a map may carry fields not declared by its `fields`
    /// directive, at the root. Nested `allow_unknown` directives always
    /// override this for their own subtree.
    pub allow_unknown: bool,
    /// The traversal depth at which the interpreter gives up on a
    /// self-referential schema.
    pub max_depth: usize,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            allow_unknown: false,
            max_depth: 1000,
        }
    }
}

/// Unifies the two phases' error types so a caller of [`normalize`] doesn't
/// need to match on which phase produced the failure.
#[derive(Debug, snafu::Snafu)]
pub enum Error {
    /// The schema itself was malformed.
    #[snafu(display("{source}"))]
    Schema {
        /// The underlying compile-time failure.
        source: SchemaError,
    },
    /// The document failed validation/normalization against an otherwise
    /// valid schema.
    #[snafu(display("{source}"))]
    Value {
        /// The underlying runtime failure.
        source: ValueError,
    },
}

impl From<SchemaError> for Error {
    fn from(source: SchemaError) -> Error {
        Error::Schema { source }
    }
}

impl From<ValueError> for Error {
    fn from(source: ValueError) -> Error {
        Error::Value { source }
    }
}

fn root_context(options: &Options) -> Context {
    Context::root(options.allow_unknown, Registries::builtin(), options.max_depth)
}

/// Compile `schema` and run it against `value` in one step.
///
/// Equivalent to `sieve::compile(schema)` followed by
/// `sieve_core::interpret(&program, value, ctx)`, for callers who don't
/// need to cache the compiled [`Program`] across calls. If a schema is
/// going to be reused, prefer [`compile`] once and [`run`] per document —
/// recompiling on every call throws away the whole point of having a
/// two-phase engine.
pub fn normalize(schema: &Value, value: Value, options: &Options) -> Result<Value, Error> {
    let program = compile(schema)?;
    run(&program, value, options)
}

/// Run an already-compiled [`Program`] against `value`.
pub fn run(program: &Program, value: Value, options: &Options) -> Result<Value, Error> {
    sieve_core::interpret(program, value, root_context(options)).map_err(Error::from)
}

/// Compile a `fields`-only schema from a bare `name -> sub-schema` mapping
/// (the legacy dict-of-fields shorthand, with no `type`/`fields` wrapper)
/// and run it against `value`.
///
/// Mirrors the legacy `schema` directive's "mapping without a `type` key
/// means a fields map" heuristic, exposed as a standalone entry point for
/// callers whose top-level documents are always dicts.
pub fn normalize_dict(
    fields: &indexmap::IndexMap<String, Value>,
    value: Value,
    options: &Options,
) -> Result<Value, Error> {
    let schema = Value::Map(indexmap::IndexMap::from([(
        "fields".to_owned(),
        Value::Map(fields.clone()),
    )]));
    normalize(&schema, value, options)
}

#[cfg(feature = "json")]
/// Convenience: compile `schema` from a [`serde_json::Value`] and run it
/// against a [`serde_json::Value`] document, converting the result back to
/// JSON. Fails with [`Error::Value`]-wrapped conversion errors if the
/// normalized output contains a `Value::Set` or `Value::Opaque` (neither
/// has a JSON representation).
pub fn normalize_json(
    schema: &serde_json::Value,
    value: serde_json::Value,
    options: &Options,
) -> Result<serde_json::Value, JsonError> {
    let schema = Value::try_from(schema.clone()).map_err(JsonError::FromJson)?;
    let value = Value::try_from(value).map_err(JsonError::FromJson)?;
    let result = normalize(&schema, value, options).map_err(JsonError::Normalize)?;
    serde_json::Value::try_from(result).map_err(JsonError::ToJson)
}

#[cfg(feature = "json")]
/// Errors specific to the JSON convenience path: either half of the
/// conversion, or normalization itself.
#[derive(Debug)]
pub enum JsonError {
    /// The input schema or document could not be read as a [`Value`].
    FromJson(sieve_core::value::FromJsonError),
    /// Normalization failed.
    Normalize(Error),
    /// The normalized result could not be represented as JSON (it contains
    /// a `set` or an opaque value).
    ToJson(sieve_core::value::ToJsonError),
}

#[cfg(feature = "json")]
impl std::fmt::Display for JsonError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JsonError::FromJson(e) => write!(f, "{e}"),
            JsonError::Normalize(e) => write!(f, "{e}"),
            JsonError::ToJson(e) => write!(f, "{e}"),
        }
    }
}

#[cfg(feature = "json")]
impl std::error::Error for JsonError {}

/// A compiled schema paired with the options it should always run with —
/// convenient when a host has one canonical set of [`Options`] per schema
/// and wants to pass a single value around instead of two.
#[derive(Clone)]
pub struct Validator {
    program: Arc<Program>,
    options: Options,
}

impl Validator {
    /// Compile `schema` once, bundling it with `options`.
    pub fn new(schema: &Value, options: Options) -> Result<Validator, Error> {
        Ok(Validator {
            program: Arc::new(compile(schema)?),
            options,
        })
    }

    /// Run the bundled program against `value`.
    pub fn normalize(&self, value: Value) -> Result<Value, Error> {
        run(&self.program, value, &self.options)
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use super::*;

    #[test]
    fn normalizes_a_simple_dict_schema() {
        let schema = Value::Map(IndexMap::from([(
            "fields".to_owned(),
            Value::Map(IndexMap::from([(
                "name".to_owned(),
                Value::Map(IndexMap::from([("type".to_owned(), Value::Str("string".into()))])),
            )])),
        )]));
        let input = Value::Map(IndexMap::from([("name".to_owned(), Value::Str("a".into()))]));
        let result = normalize(&schema, input.clone(), &Options::default()).unwrap();
        assert_eq!(result, input);
    }

    #[test]
    fn unknown_directive_surfaces_as_schema_error() {
        let schema = Value::Map(IndexMap::from([("bogus".to_owned(), Value::Bool(true))]));
        let err = normalize(&schema, Value::Null, &Options::default()).unwrap_err();
        assert!(matches!(err, Error::Schema { .. }));
    }

    #[test]
    fn bad_value_surfaces_as_value_error() {
        let schema = Value::Map(IndexMap::from([("type".to_owned(), Value::Str("integer".into()))]));
        let err = normalize(&schema, Value::Str("x".into()), &Options::default()).unwrap_err();
        assert!(matches!(err, Error::Value { .. }));
    }

    #[test]
    fn validator_reuses_compiled_program_across_calls() {
        let schema = Value::Map(IndexMap::from([("type".to_owned(), Value::Str("integer".into()))]));
        let validator = Validator::new(&schema, Options::default()).unwrap();
        assert_eq!(validator.normalize(Value::Int(1)).unwrap(), Value::Int(1));
        assert_eq!(validator.normalize(Value::Int(2)).unwrap(), Value::Int(2));
        assert!(validator.normalize(Value::Str("x".into())).is_err());
    }

    #[test]
    fn normalize_dict_applies_legacy_shorthand() {
        let fields = IndexMap::from([(
            "count".to_owned(),
            Value::Map(IndexMap::from([
                ("type".to_owned(), Value::Str("integer".into())),
                ("default".to_owned(), Value::Int(0)),
            ])),
        )]);
        let result = normalize_dict(&fields, Value::empty_map(), &Options::default()).unwrap();
        assert_eq!(
            result,
            Value::Map(IndexMap::from([("count".to_owned(), Value::Int(0))]))
        );
    }
}
