//! Schema compiler for `sieve`: turns the directive-mapping vocabulary
//! described in `SPEC_FULL.md` (`type`, `fields`, `elements`, `anyof`,
//! `choose_schema`, registries, …) into a [`sieve_core::Program`] the
//! `sieve-core` interpreter can run against a document.
//!
//! `sieve-schema` owns directive parsing and precedence; it has no
//! traversal logic of its own — that lives in `sieve-core::interpreter`.

pub mod compiler;
pub mod opaque;

pub use compiler::compile;
