//! Core value model, context, instruction set, and interpreter for the
//! `sieve` data-validation and normalization engine.
//!
//! This crate has no notion of "schema directives" at all — that vocabulary
//! belongs to `sieve-schema`, which compiles directive mappings into the
//! [`Program`]s this crate knows how to run. `sieve-core` only knows about:
//!
//! - [`value::Value`], the tagged variant documents and schemas are made of.
//! - [`error`], the two error hierarchies ([`error::SchemaError`] and
//!   [`error::ValueError`]).
//! - [`context::Context`], the immutable, functionally-updated execution
//!   environment threaded through interpretation.
//! - [`instruction::Instruction`] and [`instruction::Program`], the closed
//!   instruction set and its compiled, ordered form.
//! - [`interpreter::interpret`], which runs a `Program` against a value and
//!   a context.

#![allow(
    clippy::module_name_repetitions,
    clippy::large_enum_variant,
    clippy::too_many_arguments
)]

pub mod callback;
pub mod context;
pub mod error;
pub mod instruction;
pub mod interpreter;
pub mod registry;
pub mod value;

pub use context::Context;
pub use error::{SchemaError, ValueError};
pub use instruction::{FieldMeta, Instruction, Program};
pub use interpreter::interpret;
pub use value::{PathSegment, Stack, TypeName, Value};
