//! The two error hierarchies: [`SchemaError`] (compile-time, programmer
//! errors) and [`ValueError`] (runtime, raised by the interpreter).
//!
//! Every [`ValueError`] variant carries a `stack: Stack` field and renders
//! with a `root[k1][k2]…: message` prefix, per `SPEC_FULL.md` §7.

use snafu::Snafu;

use crate::callback::CallbackError;
use crate::value::{format_stack, Stack, TypeName, Value};

/// Which of the five registries a [`ValueError::RegisteredFunctionNotFound`]
/// lookup failed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryKind {
    /// The schema registry (`registry`, `schema_ref`).
    Schema,
    /// The coercer registry (`coerce_registry`, `coerce`, `coerce_post`).
    Coerce,
    /// The validator registry (`validator_registry`, `validator`).
    Validator,
    /// The default-setter registry (`default_registry`, `default_setter`).
    DefaultSetter,
    /// The context-modifier registry (`modify_context_registry`, `modify_context`).
    ModifyContext,
}

impl std::fmt::Display for RegistryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RegistryKind::Schema => "schema",
            RegistryKind::Coerce => "coerce",
            RegistryKind::Validator => "validator",
            RegistryKind::DefaultSetter => "default_setter",
            RegistryKind::ModifyContext => "modify_context",
        };
        f.write_str(s)
    }
}

/// A compile-time error: the schema itself is malformed. These are
/// programmer errors — they do not depend on the input document at all.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SchemaError {
    /// The schema mapping contained keys that are not recognized
    /// directives (§6 of `SPEC_FULL.md`).
    #[snafu(display(
        "schema has unknown directives: {}",
        directives.join(", ")
    ))]
    UnknownSchemaDirectives {
        /// The offending directive names, in the order they were
        /// encountered.
        directives: Vec<String>,
    },

    /// A directive's value was malformed in a way specific to that
    /// directive (wrong shape, invalid regex, ambiguous branch
    /// definition, …).
    #[snafu(display("invalid schema: {message}"))]
    SimpleSchemaError {
        /// A human-readable description of what was wrong.
        message: String,
    },

    /// The compiler's own recursion guard tripped while resolving nested
    /// schemas. This is distinct from the interpreter's `max_depth`
    /// (§5 of `SPEC_FULL.md`): it bounds *compilation*, which can recurse
    /// through `fields`/`elements`/`anyof`/`oneof` nesting in the raw
    /// schema document itself.
    #[snafu(display("schema nesting exceeds the compiler's recursion limit of {limit}"))]
    RecursionLimitExceeded {
        /// The configured limit that was exceeded.
        limit: usize,
    },
}

/// A runtime error: the input document violated a rule. Raised by the
/// interpreter, never by the compiler.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ValueError {
    /// A required field was missing and had no default.
    #[snafu(display(
        "{}: required field {key:?} not found in {value:?}",
        format_stack(stack)
    ))]
    DictFieldNotFound {
        /// The missing field's name.
        key: String,
        /// The map value that was missing the field.
        value: Box<Value>,
        /// Path to `value`.
        stack: Stack,
    },

    /// `when_key_exists` matched zero of its candidate keys.
    #[snafu(display(
        "{}: expected exactly one of {keys:?} to be present, found none",
        format_stack(stack)
    ))]
    ExpectedOneField {
        /// The candidate keys, in declaration order.
        keys: Vec<String>,
        /// Path to the map that was checked.
        stack: Stack,
    },

    /// `type`/`CheckType` failed.
    #[snafu(display("{}: {value:?} must be of type {type_}", format_stack(stack)))]
    BadType {
        /// The offending value.
        value: Box<Value>,
        /// The type that was required.
        type_: TypeName,
        /// Path to `value`.
        stack: Stack,
    },

    /// No `anyof`/branch candidate matched.
    #[snafu(display(
        "{}: none of {} candidate schemas matched {value:?}",
        format_stack(stack),
        errors.len()
    ))]
    NoneMatched {
        /// The value none of the candidates accepted.
        value: Box<Value>,
        /// The per-candidate failures, in candidate order.
        errors: Vec<ValueError>,
        /// Path to `value`.
        stack: Stack,
    },

    /// `oneof` had more than one matching candidate.
    #[snafu(display(
        "{}: {matched} schemas matched {value:?} in a `oneof`, expected exactly one",
        format_stack(stack)
    ))]
    MoreThanOneMatched {
        /// The value that matched more than one candidate.
        value: Box<Value>,
        /// How many candidates matched.
        matched: usize,
        /// Path to `value`.
        stack: Stack,
    },

    /// `when_type_is` had no branch for the value's runtime type.
    #[snafu(display(
        "{}: no branch matched the runtime type of {value:?}",
        format_stack(stack)
    ))]
    NoTypeMatch {
        /// The value whose type matched no branch.
        value: Box<Value>,
        /// Path to `value`.
        stack: Stack,
    },

    /// `regex` failed to match a string value.
    #[snafu(display(
        "{}: value {value:?} does not match regex {pattern:?}",
        format_stack(stack)
    ))]
    RegexMismatch {
        /// The offending string.
        value: String,
        /// The regex pattern it was checked against.
        pattern: String,
        /// Path to `value`.
        stack: Stack,
    },

    /// `allow_unknown` was false and the map had fields not declared in
    /// `fields`.
    #[snafu(display("{}: map had unknown fields: {fields:?}", format_stack(stack)))]
    UnknownFields {
        /// The unrecognized field names.
        fields: Vec<String>,
        /// Path to the map.
        stack: Stack,
    },

    /// `allowed`/`CheckAllowList` failed, or a branch discriminator did
    /// not match any declared choice.
    #[snafu(display(
        "{}: value {value:?} is not allowed, must be one of {allowed:?}",
        format_stack(stack)
    ))]
    DisallowedValue {
        /// The offending value.
        value: Box<Value>,
        /// The allowed values (or declared branch choices).
        allowed: Vec<Value>,
        /// Path to `value`.
        stack: Stack,
    },

    /// `maxlength` exceeded.
    #[snafu(display(
        "{}: length {length} exceeds max length of {max}",
        format_stack(stack)
    ))]
    MaxLengthExceeded {
        /// The value's actual length.
        length: usize,
        /// The configured maximum.
        max: usize,
        /// Path to the value.
        stack: Stack,
    },

    /// `minlength` not reached.
    #[snafu(display(
        "{}: length {length} is below min length of {min}",
        format_stack(stack)
    ))]
    MinLengthNotReached {
        /// The value's actual length.
        length: usize,
        /// The configured minimum.
        min: usize,
        /// Path to the value.
        stack: Stack,
    },

    /// An `excludes` sibling field was present alongside this one.
    #[snafu(display(
        "{}: because {field:?} is present, field {excluded:?} must be absent",
        format_stack(stack)
    ))]
    DisallowedField {
        /// The field whose presence triggered the exclusion.
        field: String,
        /// The sibling field that must not be present.
        excluded: String,
        /// Path to the enclosing map.
        stack: Stack,
    },

    /// A `validator` callback rejected the value.
    #[snafu(display(
        "{}: custom validator failed for {field:?}: {message}",
        format_stack(stack)
    ))]
    CustomValidatorError {
        /// The field the validator ran against, if any.
        field: Option<String>,
        /// The validator's rejection message.
        message: String,
        /// Path to the value.
        stack: Stack,
    },

    /// `min`/`max`/`CheckBounds` failed.
    #[snafu(display(
        "{}: {value:?} is out of bounds [{min:?}, {max:?}]",
        format_stack(stack)
    ))]
    OutOfBounds {
        /// The offending value.
        value: Box<Value>,
        /// The configured lower bound, if any.
        min: Option<Box<Value>>,
        /// The configured upper bound, if any.
        max: Option<Box<Value>>,
        /// Path to `value`.
        stack: Stack,
    },

    /// A `default_setter` callback returned an error.
    #[snafu(display(
        "{}: default setter for field {key:?} failed: {source}",
        format_stack(stack)
    ))]
    DefaultSetterUnexpectedError {
        /// The field the default-setter was producing a value for.
        key: String,
        /// The underlying failure.
        source: CallbackError,
        /// Path to the enclosing map.
        stack: Stack,
    },

    /// A `validator` callback returned an error (as opposed to rejecting
    /// the value with [`ValueError::CustomValidatorError`]).
    #[snafu(display(
        "{}: validator for field {field:?} malfunctioned: {source}",
        format_stack(stack)
    ))]
    ValidatorUnexpectedError {
        /// The field the validator ran against, if any.
        field: Option<String>,
        /// The underlying failure.
        source: CallbackError,
        /// Path to the value.
        stack: Stack,
    },

    /// A `coerce`/`coerce_post` callback returned an error.
    #[snafu(display("{}: coercion failed: {source}", format_stack(stack)))]
    CoerceUnexpectedError {
        /// The underlying failure.
        source: CallbackError,
        /// Path to the value.
        stack: Stack,
    },

    /// `when_tag_is` referenced a tag that was never set and had no
    /// default.
    #[snafu(display("{}: tag {tag:?} was never set", format_stack(stack)))]
    TagNotFound {
        /// The tag name.
        tag: String,
        /// Path to the value at the point of lookup.
        stack: Stack,
    },

    /// A `fn | name` directive referenced a registry name that could not
    /// be found in either the compile-time or interpret-time registries.
    #[snafu(display(
        "{}: no {kind} named {name:?} is registered",
        format_stack(stack)
    ))]
    RegisteredFunctionNotFound {
        /// Which registry was searched.
        kind: RegistryKind,
        /// The name that was not found.
        name: String,
        /// Path to the value at the point of lookup.
        stack: Stack,
    },

    /// Structural recursion (`fields`/`elements`/`keyschema`/`valueschema`
    /// traversing into another such directive) exceeded the context's
    /// `max_depth`. Distinct from `SchemaError::RecursionLimitExceeded`,
    /// which bounds the *compiler* walking the raw schema document; this
    /// one bounds the *interpreter* walking the value, which is what
    /// actually grows the native call stack for a self-referential schema
    /// applied to deeply nested input.
    #[snafu(display(
        "{}: traversal depth exceeded the configured maximum of {max_depth}",
        format_stack(stack)
    ))]
    MaxDepthExceeded {
        /// The configured limit that was exceeded.
        max_depth: usize,
        /// Path to the value at the point the limit was hit.
        stack: Stack,
    },
}

impl ValueError {
    /// The path stack carried by every variant.
    #[must_use]
    pub fn stack(&self) -> &[crate::value::PathSegment] {
        match self {
            ValueError::DictFieldNotFound { stack, .. }
            | ValueError::ExpectedOneField { stack, .. }
            | ValueError::BadType { stack, .. }
            | ValueError::NoneMatched { stack, .. }
            | ValueError::MoreThanOneMatched { stack, .. }
            | ValueError::NoTypeMatch { stack, .. }
            | ValueError::RegexMismatch { stack, .. }
            | ValueError::UnknownFields { stack, .. }
            | ValueError::DisallowedValue { stack, .. }
            | ValueError::MaxLengthExceeded { stack, .. }
            | ValueError::MinLengthNotReached { stack, .. }
            | ValueError::DisallowedField { stack, .. }
            | ValueError::CustomValidatorError { stack, .. }
            | ValueError::OutOfBounds { stack, .. }
            | ValueError::DefaultSetterUnexpectedError { stack, .. }
            | ValueError::ValidatorUnexpectedError { stack, .. }
            | ValueError::CoerceUnexpectedError { stack, .. }
            | ValueError::TagNotFound { stack, .. }
            | ValueError::RegisteredFunctionNotFound { stack, .. }
            | ValueError::MaxDepthExceeded { stack, .. } => stack,
        }
    }
}
