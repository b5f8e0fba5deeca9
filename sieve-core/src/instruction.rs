//! The closed instruction set the interpreter executes, and the compiled
//! [`Program`] form a schema turns into.

use std::sync::Arc;

use indexmap::IndexMap;
use regex::Regex;

use crate::callback::{Coercer, DefaultSetter, FnOrName, ModifyContextFn, Validator};
use crate::context::Context;
use crate::error::{RegistryKind, ValueError};
use crate::interpreter::{interpret, Step};
use crate::value::{TypeName, Value};

/// Per-field metadata attached to a [`Program`] when it is used as the
/// value of a `fields` entry. Has no effect when the program is
/// interpreted directly (e.g. as the root program, or as an `elements`
/// schema).
#[derive(Clone, Default)]
pub struct FieldMeta {
    /// Whether the field must be present (absent a default).
    pub required: bool,
    /// The field's default, if any. `None` means "no default configured"
    /// — distinct from a configured default of `Value::Null`.
    pub default: Option<Value>,
    /// A callback (or registry name) producing a default lazily, given the
    /// enclosing document.
    pub default_setter: Option<FnOrName<DefaultSetter>>,
    /// The key this field is renamed to in the output.
    pub rename: Option<String>,
    /// Sibling fields that must be absent when this field is present.
    pub excludes: Vec<String>,
}

/// A compiled schema: an ordered list of instructions plus the field
/// metadata that applies when this program is used as a field's value.
pub struct Program {
    /// The ordered instructions to execute.
    pub instructions: Vec<Instruction>,
    /// Field metadata, used only when this program is a `fields` entry.
    pub field_meta: FieldMeta,
}

impl std::fmt::Debug for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Program")
            .field("instructions", &self.instructions.len())
            .finish()
    }
}

impl Program {
    /// Construct a program from its instructions, with default (inert)
    /// field metadata.
    #[must_use]
    pub fn new(instructions: Vec<Instruction>) -> Program {
        Program {
            instructions,
            field_meta: FieldMeta::default(),
        }
    }

    /// A program with no instructions — interpreting it returns the input
    /// value unchanged.
    #[must_use]
    pub fn empty() -> Program {
        Program::new(Vec::new())
    }
}

/// Where a `schema_ref` (or a recursive/forward `registry` reference)
/// resolves its target schema.
#[derive(Clone)]
pub enum SchemaRef {
    /// Resolved at compile time because the name was already registered.
    Resolved(Arc<Program>),
    /// Not yet resolvable at compile time (forward reference, or a name
    /// registered only at interpret time); looked up against the live
    /// [`Context`] the first time it's needed.
    Named(String),
}

/// A function producing a schema to run dynamically, given the runtime
/// value and context. Must already be compiled — see `SPEC_FULL.md`'s
/// Open Questions for why this crate does not compile schemas on the fly.
pub type DynamicSchemaFn = Arc<dyn Fn(&Value, &Context) -> Arc<Program> + Send + Sync>;

/// The closed set of primitive operations the interpreter executes. See
/// `SPEC_FULL.md` §4.1.
pub enum Instruction {
    /// Merge `name -> program` entries into the schema registry.
    RegisterSchemas(IndexMap<String, Arc<Program>>),
    /// Merge `name -> default-setter` entries into the default registry.
    RegisterDefaults(IndexMap<String, DefaultSetter>),
    /// Merge `name -> coercer` entries into the coerce registry.
    RegisterCoerces(IndexMap<String, Coercer>),
    /// Merge `name -> validator` entries into the validator registry.
    RegisterValidators(IndexMap<String, Validator>),
    /// Merge `name -> context-modifier` entries into the modify-context
    /// registry.
    RegisterModifyContexts(IndexMap<String, ModifyContextFn>),
    /// Set `allow_unknown` for the rest of this program and any sub-programs.
    SetAllowUnknown(bool),
    /// Read `key` out of the current (map) value and store it as `tag`.
    SetTagFromKey {
        /// The tag name to write.
        tag: String,
        /// The field to read from the current value.
        key: String,
    },
    /// Set `tag` to a fixed literal value.
    SetTagFromValue {
        /// The tag name to write.
        tag: String,
        /// The literal value.
        value: Value,
    },
    /// Run a context-modifier callback, replacing the context for the rest
    /// of this program.
    ModifyContext(FnOrName<ModifyContextFn>),
    /// Short-circuit with the input value, unchanged, if it is `Null`.
    SkipIfNull,
    /// Dispatch on a tag's value.
    BranchWhenTagIs {
        /// The tag to read.
        tag: String,
        /// The branch to use if the tag was never set.
        default_choice: Option<Value>,
        /// Branch name (discriminator) -> sub-program.
        branches: IndexMap<String, Arc<Program>>,
    },
    /// Dispatch on the value of a map field.
    BranchWhenKeyIs {
        /// The field to read.
        key: String,
        /// The branch to use if the field is absent.
        default_choice: Option<Value>,
        /// Branch name (discriminator) -> sub-program.
        branches: IndexMap<String, Arc<Program>>,
    },
    /// Dispatch on which of several keys is present in a map.
    BranchWhenKeyExists {
        /// Field name -> sub-program, tried in declaration order.
        branches: IndexMap<String, Arc<Program>>,
    },
    /// Dispatch on the runtime type of the value.
    BranchWhenTypeIs {
        /// Type name -> sub-program.
        branches: IndexMap<TypeName, Arc<Program>>,
    },
    /// Run a dynamically-selected schema, replacing the value with its
    /// result and continuing with the rest of this program.
    ApplyDynamicSchema(DynamicSchemaFn),
    /// Schema-registry lookup (`schema_ref`, or a recursive reference
    /// encountered inside `elements`/`fields`/`anyof`/`oneof`/…).
    SchemaReference(SchemaRef),
    /// Try each candidate in order; the value that results from the first
    /// one to succeed wins.
    AnyOf(Vec<Arc<Program>>),
    /// Try every candidate; exactly one must succeed.
    OneOf(Vec<Arc<Program>>),
    /// The value must be of the given type (with the integer/float/number
    /// overlap quirk).
    CheckType(TypeName),
    /// The value must be one of a fixed allow-list.
    CheckAllowList(Vec<Value>),
    /// The value must fall within `[min, max]` (numeric comparison).
    CheckBounds {
        /// Inclusive lower bound, if any.
        min: Option<Value>,
        /// Inclusive upper bound, if any.
        max: Option<Value>,
    },
    /// The value's length (`Value::length`) must fall within `[min, max]`.
    CheckLength {
        /// Inclusive lower bound, if any.
        min: Option<usize>,
        /// Inclusive upper bound, if any.
        max: Option<usize>,
    },
    /// String values must match a regex; non-string values pass through
    /// unchecked.
    CheckRegex {
        /// The original pattern source, kept for error messages.
        pattern: String,
        /// The compiled pattern.
        regex: Arc<Regex>,
    },
    /// Every element of a sequence must pass a sub-program.
    CheckElements(Arc<Program>),
    /// The value must be a map; check/normalize each declared field.
    CheckFields(IndexMap<String, Arc<Program>>),
    /// Every key of a map, reinterpreted as a `Value::Str`, must pass a
    /// sub-program; the sub-program's (possibly renamed) result becomes
    /// the new key.
    CheckKeys(Arc<Program>),
    /// Every value of a map must pass a sub-program.
    CheckValues(Arc<Program>),
    /// Pre-type-check coercion.
    Coerce(FnOrName<Coercer>),
    /// Post-validation coercion.
    CoercePost(FnOrName<Coercer>),
    /// A custom validator, run against the (possibly already
    /// coerced/checked) value.
    CustomValidator(FnOrName<Validator>),
}

fn resolve_coerce(
    f: &FnOrName<Coercer>,
    ctx: &Context,
    stack_for_error: impl FnOnce() -> crate::value::Stack,
) -> Result<Coercer, ValueError> {
    match f {
        FnOrName::Direct(f) => Ok(Arc::clone(f)),
        FnOrName::Name(name) => {
            ctx.registries()
                .find_coerce(name)
                .ok_or_else(|| ValueError::RegisteredFunctionNotFound {
                    kind: RegistryKind::Coerce,
                    name: name.clone(),
                    stack: stack_for_error(),
                })
        }
    }
}

fn resolve_validator(
    f: &FnOrName<Validator>,
    ctx: &Context,
) -> Result<Validator, ValueError> {
    match f {
        FnOrName::Direct(f) => Ok(Arc::clone(f)),
        FnOrName::Name(name) => ctx.registries().find_validator(name).ok_or_else(|| {
            ValueError::RegisteredFunctionNotFound {
                kind: RegistryKind::Validator,
                name: name.clone(),
                stack: ctx.stack().to_vec(),
            }
        }),
    }
}

fn resolve_modify_context(
    f: &FnOrName<ModifyContextFn>,
    ctx: &Context,
) -> Result<ModifyContextFn, ValueError> {
    match f {
        FnOrName::Direct(f) => Ok(Arc::clone(f)),
        FnOrName::Name(name) => ctx.registries().find_modify_context(name).ok_or_else(|| {
            ValueError::RegisteredFunctionNotFound {
                kind: RegistryKind::ModifyContext,
                name: name.clone(),
                stack: ctx.stack().to_vec(),
            }
        }),
    }
}

fn numeric_cmp(value: &Value, bound: &Value) -> Option<std::cmp::Ordering> {
    value.as_f64()?.partial_cmp(&bound.as_f64()?)
}

/// Guards the four container-traversal instructions against unbounded
/// structural recursion (a self-referential schema applied to deeply
/// nested input), which grows the native call stack one frame per level.
fn check_depth(ctx: &Context) -> Result<(), ValueError> {
    if ctx.depth() >= ctx.max_depth() {
        return Err(ValueError::MaxDepthExceeded {
            max_depth: ctx.max_depth(),
            stack: ctx.stack().to_vec(),
        });
    }
    Ok(())
}

impl Instruction {
    /// Execute this instruction against `value`/`ctx`. See
    /// [`crate::interpreter::interpret`] for how the result is driven.
    pub fn perform(&self, value: Value, ctx: Context) -> Result<Step, ValueError> {
        match self {
            Instruction::RegisterSchemas(m) => {
                Ok(Step::Continue(value, ctx.register_schemas(m)))
            }
            Instruction::RegisterDefaults(m) => {
                Ok(Step::Continue(value, ctx.register_defaults(m)))
            }
            Instruction::RegisterCoerces(m) => {
                Ok(Step::Continue(value, ctx.register_coerces(m)))
            }
            Instruction::RegisterValidators(m) => {
                Ok(Step::Continue(value, ctx.register_validators(m)))
            }
            Instruction::RegisterModifyContexts(m) => {
                Ok(Step::Continue(value, ctx.register_modify_contexts(m)))
            }
            Instruction::SetAllowUnknown(allow) => {
                Ok(Step::Continue(value, ctx.set_allow_unknown(*allow)))
            }
            Instruction::SetTagFromKey { tag, key } => {
                let Value::Map(map) = &value else {
                    return Err(ValueError::BadType {
                        value: Box::new(value),
                        type_: TypeName::Dict,
                        stack: ctx.stack().to_vec(),
                    });
                };
                let tag_value = map.get(key).cloned().unwrap_or(Value::Null);
                let ctx = ctx.set_tag(tag, tag_value);
                Ok(Step::Continue(value, ctx))
            }
            Instruction::SetTagFromValue { tag, value: literal } => {
                let ctx = ctx.set_tag(tag, literal.clone());
                Ok(Step::Continue(value, ctx))
            }
            Instruction::ModifyContext(f) => {
                let f = resolve_modify_context(f, &ctx)?;
                let ctx = f(&value, &ctx);
                Ok(Step::Continue(value, ctx))
            }
            Instruction::SkipIfNull => {
                if matches!(value, Value::Null) {
                    Ok(Step::ShortCircuit(value))
                } else {
                    Ok(Step::Continue(value, ctx))
                }
            }
            Instruction::BranchWhenTagIs {
                tag,
                default_choice,
                branches,
            } => {
                let chosen = match ctx.get_tag(tag) {
                    Some(v) => v.clone(),
                    None => default_choice.clone().ok_or_else(|| ValueError::TagNotFound {
                        tag: tag.clone(),
                        stack: ctx.stack().to_vec(),
                    })?,
                };
                let key = chosen.as_discriminator().ok_or_else(|| {
                    ValueError::DisallowedValue {
                        value: Box::new(chosen.clone()),
                        allowed: branches.keys().map(|k| Value::Str(k.clone())).collect(),
                        stack: ctx.stack().to_vec(),
                    }
                })?;
                let program = branches.get(key).ok_or_else(|| ValueError::DisallowedValue {
                    value: Box::new(chosen.clone()),
                    allowed: branches.keys().map(|k| Value::Str(k.clone())).collect(),
                    stack: ctx.stack().to_vec(),
                })?;
                Ok(Step::TailCall(Arc::clone(program), value, ctx))
            }
            Instruction::BranchWhenKeyIs {
                key,
                default_choice,
                branches,
            } => {
                let Value::Map(map) = &value else {
                    return Err(ValueError::BadType {
                        value: Box::new(value),
                        type_: TypeName::Dict,
                        stack: ctx.stack().to_vec(),
                    });
                };
                let chosen = match map.get(key) {
                    Some(v) => v.clone(),
                    None => default_choice.clone().ok_or_else(|| ValueError::DisallowedValue {
                        value: Box::new(Value::Null),
                        allowed: branches.keys().map(|k| Value::Str(k.clone())).collect(),
                        stack: ctx.stack().to_vec(),
                    })?,
                };
                let discriminator = chosen.as_discriminator().ok_or_else(|| {
                    ValueError::DisallowedValue {
                        value: Box::new(chosen.clone()),
                        allowed: branches.keys().map(|k| Value::Str(k.clone())).collect(),
                        stack: ctx.stack().to_vec(),
                    }
                })?;
                let program =
                    branches
                        .get(discriminator)
                        .ok_or_else(|| ValueError::DisallowedValue {
                            value: Box::new(chosen.clone()),
                            allowed: branches.keys().map(|k| Value::Str(k.clone())).collect(),
                            stack: ctx.stack().to_vec(),
                        })?;
                Ok(Step::TailCall(Arc::clone(program), value, ctx))
            }
            Instruction::BranchWhenKeyExists { branches } => {
                let Value::Map(map) = &value else {
                    return Err(ValueError::BadType {
                        value: Box::new(value),
                        type_: TypeName::Dict,
                        stack: ctx.stack().to_vec(),
                    });
                };
                let mut present = branches.keys().filter(|k| map.contains_key(k.as_str()));
                let Some(first) = present.next() else {
                    return Err(ValueError::ExpectedOneField {
                        keys: branches.keys().cloned().collect(),
                        stack: ctx.stack().to_vec(),
                    });
                };
                if present.next().is_some() {
                    return Err(ValueError::DisallowedField {
                        field: first.clone(),
                        excluded: branches
                            .keys()
                            .find(|k| *k != first && map.contains_key(k.as_str()))
                            .cloned()
                            .unwrap_or_default(),
                        stack: ctx.stack().to_vec(),
                    });
                }
                let program = &branches[first];
                Ok(Step::TailCall(Arc::clone(program), value, ctx))
            }
            Instruction::BranchWhenTypeIs { branches } => {
                for type_name in TypeName::precedence() {
                    if value.satisfies(*type_name) {
                        if let Some(program) = branches.get(type_name) {
                            return Ok(Step::TailCall(Arc::clone(program), value, ctx));
                        }
                    }
                }
                Err(ValueError::NoTypeMatch {
                    value: Box::new(value),
                    stack: ctx.stack().to_vec(),
                })
            }
            Instruction::ApplyDynamicSchema(f) => {
                let program = f(&value, &ctx);
                Ok(Step::TailCall(program, value, ctx))
            }
            Instruction::SchemaReference(r) => {
                let program = match r {
                    SchemaRef::Resolved(p) => Arc::clone(p),
                    SchemaRef::Named(name) => ctx.registries().find_schema(name).ok_or_else(
                        || ValueError::RegisteredFunctionNotFound {
                            kind: RegistryKind::Schema,
                            name: name.clone(),
                            stack: ctx.stack().to_vec(),
                        },
                    )?,
                };
                Ok(Step::TailCall(program, value, ctx))
            }
            Instruction::AnyOf(candidates) => {
                let mut errors = Vec::with_capacity(candidates.len());
                for candidate in candidates {
                    match interpret(candidate, value.clone(), ctx.clone()) {
                        Ok(result) => return Ok(Step::Continue(result, ctx)),
                        Err(e) => errors.push(e),
                    }
                }
                Err(ValueError::NoneMatched {
                    value: Box::new(value),
                    errors,
                    stack: ctx.stack().to_vec(),
                })
            }
            Instruction::OneOf(candidates) => {
                let mut matched = Vec::new();
                let mut errors = Vec::with_capacity(candidates.len());
                for candidate in candidates {
                    match interpret(candidate, value.clone(), ctx.clone()) {
                        Ok(result) => matched.push(result),
                        Err(e) => errors.push(e),
                    }
                }
                match matched.len() {
                    0 => Err(ValueError::NoneMatched {
                        value: Box::new(value),
                        errors,
                        stack: ctx.stack().to_vec(),
                    }),
                    1 => Ok(Step::Continue(matched.into_iter().next().unwrap(), ctx)),
                    n => Err(ValueError::MoreThanOneMatched {
                        value: Box::new(value),
                        matched: n,
                        stack: ctx.stack().to_vec(),
                    }),
                }
            }
            Instruction::CheckType(want) => {
                if value.satisfies(*want) {
                    Ok(Step::Continue(value, ctx))
                } else {
                    Err(ValueError::BadType {
                        value: Box::new(value),
                        type_: *want,
                        stack: ctx.stack().to_vec(),
                    })
                }
            }
            Instruction::CheckAllowList(allowed) => {
                if allowed.contains(&value) {
                    Ok(Step::Continue(value, ctx))
                } else {
                    Err(ValueError::DisallowedValue {
                        value: Box::new(value),
                        allowed: allowed.clone(),
                        stack: ctx.stack().to_vec(),
                    })
                }
            }
            Instruction::CheckBounds { min, max } => {
                if let Some(min) = min {
                    if numeric_cmp(&value, min) == Some(std::cmp::Ordering::Less) {
                        return Err(ValueError::OutOfBounds {
                            value: Box::new(value),
                            min: Some(Box::new(min.clone())),
                            max: max.clone().map(Box::new),
                            stack: ctx.stack().to_vec(),
                        });
                    }
                }
                if let Some(max) = max {
                    if numeric_cmp(&value, max) == Some(std::cmp::Ordering::Greater) {
                        return Err(ValueError::OutOfBounds {
                            value: Box::new(value),
                            min: min.clone().map(Box::new),
                            max: Some(Box::new(max.clone())),
                            stack: ctx.stack().to_vec(),
                        });
                    }
                }
                Ok(Step::Continue(value, ctx))
            }
            Instruction::CheckLength { min, max } => {
                let length = value.length().unwrap_or(0);
                if let Some(max) = max {
                    if length > *max {
                        return Err(ValueError::MaxLengthExceeded {
                            length,
                            max: *max,
                            stack: ctx.stack().to_vec(),
                        });
                    }
                }
                if let Some(min) = min {
                    if length < *min {
                        return Err(ValueError::MinLengthNotReached {
                            length,
                            min: *min,
                            stack: ctx.stack().to_vec(),
                        });
                    }
                }
                Ok(Step::Continue(value, ctx))
            }
            Instruction::CheckRegex { pattern, regex } => {
                if let Value::Str(s) = &value {
                    if !regex.is_match(s) {
                        return Err(ValueError::RegexMismatch {
                            value: s.clone(),
                            pattern: pattern.clone(),
                            stack: ctx.stack().to_vec(),
                        });
                    }
                }
                Ok(Step::Continue(value, ctx))
            }
            Instruction::CheckElements(program) => {
                check_depth(&ctx)?;
                let Value::Seq(items) = value else {
                    return Err(ValueError::BadType {
                        value: Box::new(value),
                        type_: TypeName::List,
                        stack: ctx.stack().to_vec(),
                    });
                };
                let mut out = Vec::with_capacity(items.len());
                for (idx, item) in items.into_iter().enumerate() {
                    out.push(interpret(program, item, ctx.push_index(idx))?);
                }
                Ok(Step::Continue(Value::Seq(out), ctx))
            }
            Instruction::CheckFields(fields) => {
                check_depth(&ctx)?;
                check_fields(fields, value, ctx)
            }
            Instruction::CheckKeys(program) => {
                check_depth(&ctx)?;
                let Value::Map(map) = value else {
                    return Err(ValueError::BadType {
                        value: Box::new(value),
                        type_: TypeName::Dict,
                        stack: ctx.stack().to_vec(),
                    });
                };
                let mut out = IndexMap::with_capacity(map.len());
                for (key, val) in map {
                    let key_ctx = ctx.push_key(&key);
                    let new_key = interpret(program, Value::Str(key), key_ctx)?;
                    let Value::Str(new_key) = new_key else {
                        return Err(ValueError::BadType {
                            value: Box::new(new_key),
                            type_: TypeName::Str,
                            stack: ctx.stack().to_vec(),
                        });
                    };
                    out.insert(new_key, val);
                }
                Ok(Step::Continue(Value::Map(out), ctx))
            }
            Instruction::CheckValues(program) => {
                check_depth(&ctx)?;
                let Value::Map(map) = value else {
                    return Err(ValueError::BadType {
                        value: Box::new(value),
                        type_: TypeName::Dict,
                        stack: ctx.stack().to_vec(),
                    });
                };
                let mut out = IndexMap::with_capacity(map.len());
                for (key, val) in map {
                    let key_ctx = ctx.push_key(&key);
                    let new_val = interpret(program, val, key_ctx)?;
                    out.insert(key, new_val);
                }
                Ok(Step::Continue(Value::Map(out), ctx))
            }
            Instruction::Coerce(f) => {
                let f = resolve_coerce(f, &ctx, || ctx.stack().to_vec())?;
                let coerced = f(&value).map_err(|source| ValueError::CoerceUnexpectedError {
                    source,
                    stack: ctx.stack().to_vec(),
                })?;
                Ok(Step::Continue(coerced, ctx))
            }
            Instruction::CoercePost(f) => {
                let f = resolve_coerce(f, &ctx, || ctx.stack().to_vec())?;
                let coerced = f(&value).map_err(|source| ValueError::CoerceUnexpectedError {
                    source,
                    stack: ctx.stack().to_vec(),
                })?;
                Ok(Step::Continue(coerced, ctx))
            }
            Instruction::CustomValidator(f) => {
                let f = resolve_validator(f, &ctx)?;
                let field = ctx.stack().last().and_then(|seg| match seg {
                    crate::value::PathSegment::Key(k) => Some(k.as_str()),
                    crate::value::PathSegment::Index(_) => None,
                });
                match f(field, &value) {
                    Ok(()) => Ok(Step::Continue(value, ctx)),
                    Err(crate::callback::ValidatorOutcome::Invalid(message)) => {
                        Err(ValueError::CustomValidatorError {
                            field: field.map(str::to_owned),
                            message,
                            stack: ctx.stack().to_vec(),
                        })
                    }
                    Err(crate::callback::ValidatorOutcome::Unexpected(source)) => {
                        Err(ValueError::ValidatorUnexpectedError {
                            field: field.map(str::to_owned),
                            source,
                            stack: ctx.stack().to_vec(),
                        })
                    }
                }
            }
        }
    }
}

fn field_default(
    key: &str,
    meta: &FieldMeta,
    doc: &Value,
    ctx: &Context,
) -> Result<Option<Value>, ValueError> {
    if let Some(default) = &meta.default {
        return Ok(Some(default.clone()));
    }
    let Some(setter) = &meta.default_setter else {
        return Ok(None);
    };
    let setter = match setter {
        FnOrName::Direct(f) => Arc::clone(f),
        FnOrName::Name(name) => {
            ctx.registries()
                .find_default_setter(name)
                .ok_or_else(|| ValueError::RegisteredFunctionNotFound {
                    kind: RegistryKind::DefaultSetter,
                    name: name.clone(),
                    stack: ctx.stack().to_vec(),
                })?
        }
    };
    setter(doc)
        .map(Some)
        .map_err(|source| ValueError::DefaultSetterUnexpectedError {
            key: key.to_owned(),
            source,
            stack: ctx.stack().to_vec(),
        })
}

fn check_fields(
    fields: &IndexMap<String, Arc<Program>>,
    value: Value,
    ctx: Context,
) -> Result<Step, ValueError> {
    let Value::Map(map) = value else {
        return Err(ValueError::BadType {
            value: Box::new(value),
            type_: TypeName::Dict,
            stack: ctx.stack().to_vec(),
        });
    };
    let doc = Value::Map(map.clone());
    let mut out = IndexMap::with_capacity(map.len());

    if !ctx.allow_unknown() {
        let unknown: Vec<String> = map
            .keys()
            .filter(|k| !fields.contains_key(k.as_str()))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(ValueError::UnknownFields {
                fields: unknown,
                stack: ctx.stack().to_vec(),
            });
        }
    } else {
        for (k, v) in &map {
            if !fields.contains_key(k.as_str()) {
                out.insert(k.clone(), v.clone());
            }
        }
    }

    for (key, program) in fields {
        let meta = &program.field_meta;
        let new_key = meta.rename.clone().unwrap_or_else(|| key.clone());
        match map.get(key.as_str()) {
            Some(input) => {
                let result = interpret(program, input.clone(), ctx.push_key(key))?;
                out.insert(new_key, result);
                for excluded in &meta.excludes {
                    if map.contains_key(excluded.as_str()) {
                        return Err(ValueError::DisallowedField {
                            field: key.clone(),
                            excluded: excluded.clone(),
                            stack: ctx.stack().to_vec(),
                        });
                    }
                }
            }
            None => match field_default(key, meta, &doc, &ctx)? {
                Some(default) => {
                    out.insert(new_key, default);
                }
                None => {
                    if meta.required {
                        return Err(ValueError::DictFieldNotFound {
                            key: key.clone(),
                            value: Box::new(doc.clone()),
                            stack: ctx.stack().to_vec(),
                        });
                    }
                }
            },
        }
    }
    Ok(Step::Continue(Value::Map(out), ctx))
}
