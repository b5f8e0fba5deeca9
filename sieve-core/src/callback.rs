//! Callback types for the three places a host can plug a function into a
//! schema: coercion, default-setting, and custom validation — plus context
//! modifiers and the `fn | name` duality every one of them is allowed to
//! use on the wire.

use std::fmt::{self, Debug};
use std::sync::Arc;

use crate::context::Context;
use crate::value::Value;

/// The identity of a user callback's failure, carried into the
/// corresponding `*UnexpectedError` variant.
///
/// Rust callbacks don't throw exceptions; they return `Result`. A returned
/// `Err` plays the role the distilled spec calls "a non-value exception
/// raised by user callbacks" — it is always wrapped, never propagated raw.
pub type CallbackError = Arc<dyn std::error::Error + Send + Sync>;

/// `coerce` / `coerce_post`: `Value -> Result<Value, CallbackError>`.
pub type Coercer = Arc<dyn Fn(&Value) -> Result<Value, CallbackError> + Send + Sync>;

/// `default_setter`: given the enclosing document (the map the missing
/// field would live in), produce a default value.
pub type DefaultSetter = Arc<dyn Fn(&Value) -> Result<Value, CallbackError> + Send + Sync>;

/// `modify_context`: `(value, ctx) -> ctx'`. Cannot fail — a context
/// modifier that needs to fail validation should do so via a subsequent
/// `validator` instead.
pub type ModifyContextFn = Arc<dyn Fn(&Value, &Context) -> Context + Send + Sync>;

/// The outcome of a `validator` callback.
pub enum ValidatorOutcome {
    /// The validator rejected the value with a message (`CustomValidatorError`).
    Invalid(String),
    /// The validator itself malfunctioned (`ValidatorUnexpectedError`).
    Unexpected(CallbackError),
}

/// `validator`: `(field, value) -> Result<(), ValidatorOutcome>`. `field`
/// is the name of the enclosing field, if any (the last path segment, when
/// it is a key).
pub type Validator =
    Arc<dyn Fn(Option<&str>, &Value) -> Result<(), ValidatorOutcome> + Send + Sync>;

/// Many directives accept either a literal callback or the name of one
/// registered in a registry, resolved against the live [`Context`] the
/// first time it's needed. See `SPEC_FULL.md` §4.2 item 1 for the
/// compile-time-vs-interpret-time resolution policy.
#[derive(Clone)]
pub enum FnOrName<T> {
    /// Already resolved to a concrete callback, either because it was
    /// passed directly or because the compiler found it in a registry that
    /// was already visible at compile time.
    Direct(T),
    /// Not yet resolved; looked up against the interpreter [`Context`]'s
    /// registries the first time this instruction runs.
    Name(String),
}

impl<T: Debug> Debug for FnOrName<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FnOrName::Direct(t) => f.debug_tuple("Direct").field(t).finish(),
            FnOrName::Name(n) => f.debug_tuple("Name").field(n).finish(),
        }
    }
}

impl<T> FnOrName<T> {
    /// The registered name this refers to, if it is not already resolved.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match self {
            FnOrName::Direct(_) => None,
            FnOrName::Name(n) => Some(n),
        }
    }
}
