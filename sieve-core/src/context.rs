//! The immutable, functionally-updated execution environment threaded
//! through interpretation.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::callback::{Coercer, DefaultSetter, ModifyContextFn, Validator};
use crate::instruction::Program;
use crate::value::{PathSegment, Stack, Value};

/// The five named registries a [`Context`] accumulates as it descends a
/// schema. Stored behind `Arc` so forking a `Context` (e.g. for an `anyof`
/// candidate) is a handful of refcount bumps, not a deep copy.
#[derive(Clone, Default)]
pub struct Registries {
    schemas: Arc<IndexMap<String, Arc<Program>>>,
    defaults: Arc<IndexMap<String, DefaultSetter>>,
    coerces: Arc<IndexMap<String, Coercer>>,
    validators: Arc<IndexMap<String, Validator>>,
    modify_contexts: Arc<IndexMap<String, ModifyContextFn>>,
}

fn merged<V: Clone>(
    base: &Arc<IndexMap<String, V>>,
    additions: &IndexMap<String, V>,
) -> Arc<IndexMap<String, V>> {
    if additions.is_empty() {
        return Arc::clone(base);
    }
    let mut merged = IndexMap::with_capacity(base.len() + additions.len());
    merged.extend(base.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged.extend(additions.iter().map(|(k, v)| (k.clone(), v.clone())));
    Arc::new(merged)
}

impl Registries {
    /// The engine's built-in default-setters (`list`, `dict`, `set`) and
    /// coercers (`to_list`, `to_set`), with empty schema/validator/
    /// modify-context registries. This is what [`Context::root`] is given
    /// unless a host registers something different at the `sieve` facade
    /// level.
    #[must_use]
    pub fn builtin() -> Registries {
        Registries {
            schemas: Arc::new(IndexMap::new()),
            defaults: Arc::new(crate::registry::builtin_defaults()),
            coerces: Arc::new(crate::registry::builtin_coerces()),
            validators: Arc::new(IndexMap::new()),
            modify_contexts: Arc::new(IndexMap::new()),
        }
    }

    /// Schema registry lookup, used by `SchemaReference`/`schema_ref`.
    #[must_use]
    pub fn find_schema(&self, name: &str) -> Option<Arc<Program>> {
        self.schemas.get(name).cloned()
    }

    /// Default-setter registry lookup.
    #[must_use]
    pub fn find_default_setter(&self, name: &str) -> Option<DefaultSetter> {
        self.defaults.get(name).cloned()
    }

    /// Coercer registry lookup.
    #[must_use]
    pub fn find_coerce(&self, name: &str) -> Option<Coercer> {
        self.coerces.get(name).cloned()
    }

    /// Validator registry lookup.
    #[must_use]
    pub fn find_validator(&self, name: &str) -> Option<Validator> {
        self.validators.get(name).cloned()
    }

    /// Context-modifier registry lookup.
    #[must_use]
    pub fn find_modify_context(&self, name: &str) -> Option<ModifyContextFn> {
        self.modify_contexts.get(name).cloned()
    }
}

/// Persistent, per-invocation record of path, flags, registries, and tags.
///
/// Every mutating method returns a *new* `Context`; nothing is ever mutated
/// in place. This is what makes `anyof`/`oneof` backtracking trivial
/// (simply discard the forked context on failure) and lets a compiled
/// [`Program`] be shared across concurrent `normalize` calls safely.
#[derive(Clone)]
pub struct Context {
    stack: Stack,
    allow_unknown: bool,
    registries: Registries,
    tags: Arc<IndexMap<String, Value>>,
    depth: usize,
    max_depth: usize,
}

impl Context {
    /// A fresh root context: empty stack, `allow_unknown` as given, the
    /// provided starting registries (typically the engine's built-ins,
    /// possibly extended by a host), no tags.
    #[must_use]
    pub fn root(allow_unknown: bool, registries: Registries, max_depth: usize) -> Context {
        Context {
            stack: Vec::new(),
            allow_unknown,
            registries,
            tags: Arc::new(IndexMap::new()),
            depth: 0,
            max_depth,
        }
    }

    /// The current path from the document root.
    #[must_use]
    pub fn stack(&self) -> &[PathSegment] {
        &self.stack
    }

    /// Whether unrecognized map fields are passed through rather than
    /// rejected.
    #[must_use]
    pub fn allow_unknown(&self) -> bool {
        self.allow_unknown
    }

    /// The accumulated registries visible at this point in the traversal.
    #[must_use]
    pub fn registries(&self) -> &Registries {
        &self.registries
    }

    /// A new context with the path extended by a map key.
    #[must_use]
    pub fn push_key(&self, key: &str) -> Context {
        let mut stack = self.stack.clone();
        stack.push(PathSegment::Key(key.to_owned()));
        Context {
            stack,
            depth: self.depth + 1,
            ..self.clone()
        }
    }

    /// A new context with the path extended by a sequence index.
    #[must_use]
    pub fn push_index(&self, index: usize) -> Context {
        let mut stack = self.stack.clone();
        stack.push(PathSegment::Index(index));
        Context {
            stack,
            depth: self.depth + 1,
            ..self.clone()
        }
    }

    /// A new context with `allow_unknown` set.
    #[must_use]
    pub fn set_allow_unknown(&self, allow_unknown: bool) -> Context {
        Context {
            allow_unknown,
            ..self.clone()
        }
    }

    /// A new context with `name -> program` merged into the schema
    /// registry.
    #[must_use]
    pub fn register_schemas(&self, additions: &IndexMap<String, Arc<Program>>) -> Context {
        let mut registries = self.registries.clone();
        registries.schemas = merged(&registries.schemas, additions);
        Context { registries, ..self.clone() }
    }

    /// A new context with additional default-setters registered.
    #[must_use]
    pub fn register_defaults(&self, additions: &IndexMap<String, DefaultSetter>) -> Context {
        let mut registries = self.registries.clone();
        registries.defaults = merged(&registries.defaults, additions);
        Context { registries, ..self.clone() }
    }

    /// A new context with additional coercers registered.
    #[must_use]
    pub fn register_coerces(&self, additions: &IndexMap<String, Coercer>) -> Context {
        let mut registries = self.registries.clone();
        registries.coerces = merged(&registries.coerces, additions);
        Context { registries, ..self.clone() }
    }

    /// A new context with additional validators registered.
    #[must_use]
    pub fn register_validators(&self, additions: &IndexMap<String, Validator>) -> Context {
        let mut registries = self.registries.clone();
        registries.validators = merged(&registries.validators, additions);
        Context { registries, ..self.clone() }
    }

    /// A new context with additional context-modifiers registered.
    #[must_use]
    pub fn register_modify_contexts(
        &self,
        additions: &IndexMap<String, ModifyContextFn>,
    ) -> Context {
        let mut registries = self.registries.clone();
        registries.modify_contexts = merged(&registries.modify_contexts, additions);
        Context { registries, ..self.clone() }
    }

    /// A new context with `tag` set to `value`.
    #[must_use]
    pub fn set_tag(&self, tag: &str, value: Value) -> Context {
        let mut tags = (*self.tags).clone();
        tags.insert(tag.to_owned(), value);
        Context {
            tags: Arc::new(tags),
            ..self.clone()
        }
    }

    /// The value of a previously-set tag.
    #[must_use]
    pub fn get_tag(&self, tag: &str) -> Option<&Value> {
        self.tags.get(tag)
    }

    /// The maximum traversal depth this context will allow before
    /// `SchemaError::RecursionLimitExceeded` is raised. See `SPEC_FULL.md`
    /// §5.
    #[must_use]
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// The current traversal depth (number of `push_key`/`push_index`
    /// calls since the root).
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shadowing_prefers_inner_registration() {
        let outer: IndexMap<String, Arc<Program>> =
            IndexMap::from([("x".to_owned(), Arc::new(Program::empty()))]);
        let ctx = Context::root(false, Registries::default(), 1000).register_schemas(&outer);
        let inner_program = Arc::new(Program::empty());
        let inner: IndexMap<String, Arc<Program>> =
            IndexMap::from([("x".to_owned(), Arc::clone(&inner_program))]);
        let ctx = ctx.register_schemas(&inner);
        assert!(Arc::ptr_eq(&ctx.registries().find_schema("x").unwrap(), &inner_program));
    }

    #[test]
    fn push_key_does_not_affect_sibling_contexts() {
        let root = Context::root(false, Registries::default(), 1000);
        let a = root.push_key("a");
        let b = root.push_key("b");
        assert_eq!(a.stack(), &[PathSegment::Key("a".into())]);
        assert_eq!(b.stack(), &[PathSegment::Key("b".into())]);
        assert!(root.stack().is_empty());
    }
}
