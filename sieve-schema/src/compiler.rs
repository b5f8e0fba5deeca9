//! Translates a raw schema [`Value`] into a compiled [`Program`], following
//! the fixed directive precedence order described in `SPEC_FULL.md` §4.2.

use std::sync::Arc;

use indexmap::IndexMap;
use regex::Regex;
use sieve_core::callback::{Coercer, DefaultSetter, FnOrName, ModifyContextFn, Validator};
use sieve_core::error::SchemaError;
use sieve_core::instruction::{FieldMeta, Instruction, Program, SchemaRef};
use sieve_core::value::{TypeName, Value};

use crate::opaque::{
    OpaqueCoercer, OpaqueDefaultSetter, OpaqueDynamicSchema, OpaqueModifyContext, OpaqueValidator,
};

/// The maximum nesting depth the compiler will walk into a raw schema
/// document before giving up. Distinct from the interpreter's `max_depth`
/// (an `Options` knob, bounding *value* traversal) — this one bounds
/// *schema* traversal and is not currently exposed as a knob, since a
/// legitimately authored schema is vastly shallower than this.
const MAX_COMPILE_DEPTH: usize = 128;

/// Per-compilation state: the registries visible so far (for eager,
/// compile-time name resolution) and a recursion guard.
#[derive(Clone)]
struct CompileCtx {
    schemas: IndexMap<String, Arc<Program>>,
    coerces: IndexMap<String, Coercer>,
    validators: IndexMap<String, Validator>,
    modify_contexts: IndexMap<String, ModifyContextFn>,
    defaults: IndexMap<String, DefaultSetter>,
    depth: usize,
}

impl CompileCtx {
    fn new() -> CompileCtx {
        CompileCtx {
            schemas: IndexMap::new(),
            coerces: IndexMap::new(),
            validators: IndexMap::new(),
            modify_contexts: IndexMap::new(),
            defaults: IndexMap::new(),
            depth: 0,
        }
    }

    fn enter(&mut self) -> Result<(), SchemaError> {
        self.depth += 1;
        if self.depth > MAX_COMPILE_DEPTH {
            return Err(SchemaError::RecursionLimitExceeded {
                limit: MAX_COMPILE_DEPTH,
            });
        }
        Ok(())
    }

    fn exit(&mut self) {
        self.depth -= 1;
    }
}

/// Compile a schema document into a program. See `SPEC_FULL.md` §4.2.
pub fn compile(schema: &Value) -> Result<Program, SchemaError> {
    let mut ctx = CompileCtx::new();
    compile_schema(schema, &mut ctx)
}

fn compile_schema(schema: &Value, ctx: &mut CompileCtx) -> Result<Program, SchemaError> {
    ctx.enter()?;
    let result = match schema {
        Value::Str(name) => Ok(Program::new(vec![Instruction::SchemaReference(
            resolve_schema_ref(name, ctx),
        )])),
        Value::Map(map) => compile_map(map, ctx),
        other => Err(SchemaError::SimpleSchemaError {
            message: format!(
                "schema must be a mapping or a string reference, got {}",
                other.shape()
            ),
        }),
    };
    ctx.exit();
    result
}

fn resolve_schema_ref(name: &str, ctx: &CompileCtx) -> SchemaRef {
    match ctx.schemas.get(name) {
        Some(program) => SchemaRef::Resolved(Arc::clone(program)),
        None => SchemaRef::Named(name.to_owned()),
    }
}

const KNOWN_DIRECTIVES: &[&str] = &[
    "type",
    "nullable",
    "required",
    "default",
    "default_setter",
    "rename",
    "excludes",
    "allow_unknown",
    "allowed",
    "min",
    "max",
    "minlength",
    "maxlength",
    "regex",
    "coerce",
    "coerce_post",
    "validator",
    "elements",
    "fields",
    "schema",
    "keyschema",
    "valueschema",
    "anyof",
    "oneof",
    "schema_ref",
    "registry",
    "default_registry",
    "coerce_registry",
    "validator_registry",
    "modify_context_registry",
    "set_tag",
    "modify_context",
    "choose_schema",
    "when_key_is",
    "when_key_exists",
    "metadata",
];

fn check_unknown_directives(map: &IndexMap<String, Value>) -> Result<(), SchemaError> {
    let unknown: Vec<String> = map
        .keys()
        .filter(|k| !KNOWN_DIRECTIVES.contains(&k.as_str()))
        .cloned()
        .collect();
    if unknown.is_empty() {
        Ok(())
    } else {
        Err(SchemaError::UnknownSchemaDirectives { directives: unknown })
    }
}

fn as_map(v: &Value) -> Result<&IndexMap<String, Value>, SchemaError> {
    match v {
        Value::Map(m) => Ok(m),
        other => Err(SchemaError::SimpleSchemaError {
            message: format!("expected a mapping, got {}", other.shape()),
        }),
    }
}

fn as_str(v: &Value) -> Result<&str, SchemaError> {
    match v {
        Value::Str(s) => Ok(s),
        other => Err(SchemaError::SimpleSchemaError {
            message: format!("expected a string, got {}", other.shape()),
        }),
    }
}

fn as_usize(v: &Value) -> Result<usize, SchemaError> {
    match v {
        Value::Int(i) if *i >= 0 => Ok(*i as usize),
        other => Err(SchemaError::SimpleSchemaError {
            message: format!("expected a non-negative integer, got {other:?}"),
        }),
    }
}

fn get_map<'a>(map: &'a IndexMap<String, Value>, key: &str) -> Result<&'a IndexMap<String, Value>, SchemaError> {
    map.get(key)
        .ok_or_else(|| SchemaError::SimpleSchemaError {
            message: format!("missing `{key}`"),
        })
        .and_then(as_map)
}

fn get_str<'a>(map: &'a IndexMap<String, Value>, key: &str) -> Result<&'a str, SchemaError> {
    map.get(key)
        .ok_or_else(|| SchemaError::SimpleSchemaError {
            message: format!("missing `{key}`"),
        })
        .and_then(as_str)
}

fn merge_maps(base: &IndexMap<String, Value>, overlay: &IndexMap<String, Value>) -> IndexMap<String, Value> {
    let mut out = base.clone();
    for (k, v) in overlay {
        out.insert(k.clone(), v.clone());
    }
    out
}

/// `anyof`/`oneof` candidates are compiled against the outer schema's other
/// directives copied in verbatim (SPEC_FULL.md §4.3) — this is the one
/// place a whole-map overlay merge is actually correct, since a candidate
/// is a self-contained schema in its own right, not a set of fields to
/// graft onto a parent's `fields` map.
fn without_keys(map: &IndexMap<String, Value>, keys: &[&str]) -> IndexMap<String, Value> {
    map.iter()
        .filter(|(k, _)| !keys.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn extract_field_meta(map: &IndexMap<String, Value>, ctx: &mut CompileCtx) -> Result<FieldMeta, SchemaError> {
    let required = matches!(map.get("required"), Some(Value::Bool(true)));
    let default = map.get("default").cloned();
    let default_setter = match map.get("default_setter") {
        Some(v) => Some(compile_fn_or_name_default_setter(v, ctx)?),
        None => None,
    };
    let rename = match map.get("rename") {
        Some(v) => Some(as_str(v)?.to_owned()),
        None => None,
    };
    let excludes = match map.get("excludes") {
        Some(Value::Seq(items)) => items
            .iter()
            .map(|v| as_str(v).map(str::to_owned))
            .collect::<Result<Vec<_>, _>>()?,
        Some(Value::Str(s)) => vec![s.clone()],
        Some(other) => {
            return Err(SchemaError::SimpleSchemaError {
                message: format!("`excludes` must be a string or list of strings, got {}", other.shape()),
            })
        }
        None => Vec::new(),
    };
    Ok(FieldMeta {
        required,
        default,
        default_setter,
        rename,
        excludes,
    })
}

fn compile_fn_or_name_coerce(v: &Value, ctx: &CompileCtx) -> Result<FnOrName<Coercer>, SchemaError> {
    match v {
        Value::Str(name) => match ctx.coerces.get(name) {
            Some(f) => Ok(FnOrName::Direct(Arc::clone(f))),
            None => Ok(FnOrName::Name(name.clone())),
        },
        Value::Opaque(_) => v
            .downcast_opaque::<OpaqueCoercer>()
            .map(|w| FnOrName::Direct(Arc::clone(&w.0)))
            .ok_or_else(|| SchemaError::SimpleSchemaError {
                message: "coerce must be a registry name or an opaque coercer".into(),
            }),
        other => Err(SchemaError::SimpleSchemaError {
            message: format!("coerce must be a string name or opaque coercer, got {}", other.shape()),
        }),
    }
}

fn compile_fn_or_name_validator(v: &Value, ctx: &CompileCtx) -> Result<FnOrName<Validator>, SchemaError> {
    match v {
        Value::Str(name) => match ctx.validators.get(name) {
            Some(f) => Ok(FnOrName::Direct(Arc::clone(f))),
            None => Ok(FnOrName::Name(name.clone())),
        },
        Value::Opaque(_) => v
            .downcast_opaque::<OpaqueValidator>()
            .map(|w| FnOrName::Direct(Arc::clone(&w.0)))
            .ok_or_else(|| SchemaError::SimpleSchemaError {
                message: "validator must be a registry name or an opaque validator".into(),
            }),
        other => Err(SchemaError::SimpleSchemaError {
            message: format!("validator must be a string name or opaque validator, got {}", other.shape()),
        }),
    }
}

fn compile_fn_or_name_modify_context(v: &Value, ctx: &CompileCtx) -> Result<FnOrName<ModifyContextFn>, SchemaError> {
    match v {
        Value::Str(name) => match ctx.modify_contexts.get(name) {
            Some(f) => Ok(FnOrName::Direct(Arc::clone(f))),
            None => Ok(FnOrName::Name(name.clone())),
        },
        Value::Opaque(_) => v
            .downcast_opaque::<OpaqueModifyContext>()
            .map(|w| FnOrName::Direct(Arc::clone(&w.0)))
            .ok_or_else(|| SchemaError::SimpleSchemaError {
                message: "modify_context must be a registry name or an opaque context-modifier".into(),
            }),
        other => Err(SchemaError::SimpleSchemaError {
            message: format!(
                "modify_context must be a string name or opaque context-modifier, got {}",
                other.shape()
            ),
        }),
    }
}

fn compile_fn_or_name_default_setter(v: &Value, ctx: &CompileCtx) -> Result<FnOrName<DefaultSetter>, SchemaError> {
    match v {
        Value::Str(name) => match ctx.defaults.get(name) {
            Some(f) => Ok(FnOrName::Direct(Arc::clone(f))),
            None => Ok(FnOrName::Name(name.clone())),
        },
        Value::Opaque(_) => v
            .downcast_opaque::<OpaqueDefaultSetter>()
            .map(|w| FnOrName::Direct(Arc::clone(&w.0)))
            .ok_or_else(|| SchemaError::SimpleSchemaError {
                message: "default_setter must be a registry name or an opaque default-setter".into(),
            }),
        other => Err(SchemaError::SimpleSchemaError {
            message: format!(
                "default_setter must be a string name or opaque default-setter, got {}",
                other.shape()
            ),
        }),
    }
}

fn compile_registries(
    map: &IndexMap<String, Value>,
    ctx: &mut CompileCtx,
    instructions: &mut Vec<Instruction>,
) -> Result<(), SchemaError> {
    if let Some(Value::Map(entries)) = map.get("default_registry") {
        let mut resolved = IndexMap::with_capacity(entries.len());
        for (name, v) in entries {
            let setter = v
                .downcast_opaque::<OpaqueDefaultSetter>()
                .ok_or_else(|| SchemaError::SimpleSchemaError {
                    message: format!("default_registry[{name:?}] must be an opaque default-setter"),
                })?
                .0
                .clone();
            ctx.defaults.insert(name.clone(), Arc::clone(&setter));
            resolved.insert(name.clone(), setter);
        }
        instructions.push(Instruction::RegisterDefaults(resolved));
    }

    if let Some(Value::Map(entries)) = map.get("validator_registry") {
        let mut resolved = IndexMap::with_capacity(entries.len());
        for (name, v) in entries {
            let f = v
                .downcast_opaque::<OpaqueValidator>()
                .ok_or_else(|| SchemaError::SimpleSchemaError {
                    message: format!("validator_registry[{name:?}] must be an opaque validator"),
                })?
                .0
                .clone();
            ctx.validators.insert(name.clone(), Arc::clone(&f));
            resolved.insert(name.clone(), f);
        }
        instructions.push(Instruction::RegisterValidators(resolved));
    }

    if let Some(Value::Map(entries)) = map.get("coerce_registry") {
        let mut resolved = IndexMap::with_capacity(entries.len());
        for (name, v) in entries {
            let f = v
                .downcast_opaque::<OpaqueCoercer>()
                .ok_or_else(|| SchemaError::SimpleSchemaError {
                    message: format!("coerce_registry[{name:?}] must be an opaque coercer"),
                })?
                .0
                .clone();
            ctx.coerces.insert(name.clone(), Arc::clone(&f));
            resolved.insert(name.clone(), f);
        }
        instructions.push(Instruction::RegisterCoerces(resolved));
    }

    if let Some(Value::Map(entries)) = map.get("registry") {
        let mut resolved = IndexMap::with_capacity(entries.len());
        for (name, v) in entries {
            let sub_map = as_map(v)?;
            let program = Arc::new(compile_map(sub_map, ctx)?);
            ctx.schemas.insert(name.clone(), Arc::clone(&program));
            resolved.insert(name.clone(), program);
        }
        instructions.push(Instruction::RegisterSchemas(resolved));
    }

    if let Some(Value::Map(entries)) = map.get("modify_context_registry") {
        let mut resolved = IndexMap::with_capacity(entries.len());
        for (name, v) in entries {
            let f = v
                .downcast_opaque::<OpaqueModifyContext>()
                .ok_or_else(|| SchemaError::SimpleSchemaError {
                    message: format!("modify_context_registry[{name:?}] must be an opaque context-modifier"),
                })?
                .0
                .clone();
            ctx.modify_contexts.insert(name.clone(), Arc::clone(&f));
            resolved.insert(name.clone(), f);
        }
        instructions.push(Instruction::RegisterModifyContexts(resolved));
    }

    Ok(())
}

fn compile_tag_context(
    map: &IndexMap<String, Value>,
    ctx: &CompileCtx,
    instructions: &mut Vec<Instruction>,
) -> Result<(), SchemaError> {
    if let Some(v) = map.get("set_tag") {
        if let Value::Str(s) = v {
            // Bare-string shorthand: the tag name and the source key are
            // the same name.
            instructions.push(Instruction::SetTagFromKey {
                tag: s.clone(),
                key: s.clone(),
            });
        } else {
            let spec = as_map(v)?;
            let tag = get_str(spec, "tag_name")?.to_owned();
            if let Some(key) = spec.get("key") {
                instructions.push(Instruction::SetTagFromKey {
                    tag,
                    key: as_str(key)?.to_owned(),
                });
            } else if let Some(value) = spec.get("value") {
                instructions.push(Instruction::SetTagFromValue {
                    tag,
                    value: value.clone(),
                });
            } else {
                return Err(SchemaError::SimpleSchemaError {
                    message: "`set_tag` requires a `key` or `value` entry".into(),
                });
            }
        }
    }
    if let Some(v) = map.get("modify_context") {
        instructions.push(Instruction::ModifyContext(compile_fn_or_name_modify_context(v, ctx)?));
    }
    Ok(())
}

/// `fields` (or the legacy `schema` shorthand) of the schema enclosing a
/// `when_key_is` branch — the only directive that branch compiler folds
/// into its choices. Any other parent directive (`validator`, `min`, …)
/// is left in place and runs as its own instruction after the branch, the
/// same as it would without branching at all.
fn parent_fields(map: &IndexMap<String, Value>) -> Result<Option<IndexMap<String, Value>>, SchemaError> {
    match map.get("fields").or_else(|| map.get("schema")) {
        Some(v) => Ok(Some(as_map(v)?.clone())),
        None => Ok(None),
    }
}

/// `when_key_is(key, choices, default_choice?)` field-merges the parent's
/// `fields` into each choice's own `fields`, with the choice's entries
/// winning on conflict, and — unless the choice already declares a schema
/// for `key` itself — injects `{key: {allowed: [...choice names]}}` so
/// `CheckFields` enforces that the discriminator only ever holds one of
/// the declared choice values.
fn compile_when_key_is(
    spec: &IndexMap<String, Value>,
    parent_fields: Option<&IndexMap<String, Value>>,
    ctx: &mut CompileCtx,
) -> Result<Instruction, SchemaError> {
    let key = get_str(spec, "key")?.to_owned();
    let choices = get_map(spec, "choices")?;
    let choice_names: Vec<String> = choices.keys().cloned().collect();
    let default_choice = spec.get("default_choice").cloned();
    let mut branches = IndexMap::with_capacity(choices.len());
    for (name, choice_schema) in choices {
        let choice_map = as_map(choice_schema)?;
        let mut choice_fields = match choice_map.get("fields").or_else(|| choice_map.get("schema")) {
            Some(v) => as_map(v)?.clone(),
            None => IndexMap::new(),
        };
        if !choice_fields.contains_key(&key) {
            choice_fields.insert(
                key.clone(),
                Value::Map(IndexMap::from([(
                    "allowed".to_owned(),
                    Value::Seq(choice_names.iter().map(|c| Value::Str(c.clone())).collect()),
                )])),
            );
        }
        let mut merged_fields = parent_fields.cloned().unwrap_or_default();
        for (k, v) in choice_fields {
            merged_fields.insert(k, v);
        }
        let mut merged_choice = choice_map.clone();
        merged_choice.shift_remove("schema");
        merged_choice.insert("fields".to_owned(), Value::Map(merged_fields));
        branches.insert(name.clone(), Arc::new(compile_map(&merged_choice, ctx)?));
    }
    Ok(Instruction::BranchWhenKeyIs {
        key,
        default_choice,
        branches,
    })
}

/// `when_key_exists(choices)` compiles each choice as a wholly independent
/// schema; there is no merging with the enclosing schema's directives.
fn compile_when_key_exists(
    choices: &IndexMap<String, Value>,
    ctx: &mut CompileCtx,
) -> Result<Instruction, SchemaError> {
    let mut branches = IndexMap::with_capacity(choices.len());
    for (name, choice_schema) in choices {
        branches.insert(name.clone(), Arc::new(compile_schema(choice_schema, ctx)?));
    }
    Ok(Instruction::BranchWhenKeyExists { branches })
}

/// `when_tag_is(tag, choices, default_choice?)` — like `when_key_exists`,
/// each choice compiles standalone.
fn compile_when_tag_is(
    spec: &IndexMap<String, Value>,
    ctx: &mut CompileCtx,
) -> Result<Instruction, SchemaError> {
    let tag = get_str(spec, "tag")?.to_owned();
    let choices = get_map(spec, "choices")?;
    let default_choice = spec.get("default_choice").cloned();
    let mut branches = IndexMap::with_capacity(choices.len());
    for (name, choice_schema) in choices {
        branches.insert(name.clone(), Arc::new(compile_schema(choice_schema, ctx)?));
    }
    Ok(Instruction::BranchWhenTagIs {
        tag,
        default_choice,
        branches,
    })
}

fn compile_when_type_is(
    choices: &IndexMap<String, Value>,
    ctx: &mut CompileCtx,
) -> Result<Instruction, SchemaError> {
    let mut branches = IndexMap::with_capacity(choices.len());
    for (type_str, choice_schema) in choices {
        let type_name = TypeName::parse(type_str).ok_or_else(|| SchemaError::SimpleSchemaError {
            message: format!("unknown type name {type_str:?} in when_type_is"),
        })?;
        branches.insert(type_name, Arc::new(compile_schema(choice_schema, ctx)?));
    }
    Ok(Instruction::BranchWhenTypeIs { branches })
}

fn compile_dynamic_schema(value: &Value) -> Result<Instruction, SchemaError> {
    let f = value
        .downcast_opaque::<OpaqueDynamicSchema>()
        .ok_or_else(|| SchemaError::SimpleSchemaError {
            message: "choose_schema.function must be an opaque dynamic-schema callback".into(),
        })?;
    Ok(Instruction::ApplyDynamicSchema(f.0.clone()))
}

/// Outcome of compiling step 7 (branching): the instruction itself, plus
/// whether `fields`/`schema` were folded into the branches and so must be
/// skipped when the remaining directives (steps 8-14) are compiled.
struct Branching {
    instruction: Instruction,
    consumed_fields: bool,
}

fn compile_branching(map: &IndexMap<String, Value>, ctx: &mut CompileCtx) -> Result<Option<Branching>, SchemaError> {
    if let Some(v) = map.get("when_key_is") {
        tracing::warn!("legacy `when_key_is` directive used at the top level of a schema; prefer `choose_schema: {{ when_key_is: ... }}`");
        let instruction = compile_when_key_is(as_map(v)?, parent_fields(map)?.as_ref(), ctx)?;
        return Ok(Some(Branching {
            instruction,
            consumed_fields: true,
        }));
    }
    if let Some(v) = map.get("when_key_exists") {
        tracing::warn!("legacy `when_key_exists` directive used at the top level of a schema; prefer `choose_schema: {{ when_key_exists: ... }}`");
        let instruction = compile_when_key_exists(as_map(v)?, ctx)?;
        return Ok(Some(Branching {
            instruction,
            consumed_fields: false,
        }));
    }
    if let Some(inner_value) = map.get("choose_schema") {
        let inner = as_map(inner_value)?;
        let (inner_key, inner_value) = inner.iter().next().ok_or_else(|| SchemaError::SimpleSchemaError {
            message: "`choose_schema` must have exactly one selector key".into(),
        })?;
        let (instruction, consumed_fields) = match inner_key.as_str() {
            "when_tag_is" => (compile_when_tag_is(as_map(inner_value)?, ctx)?, false),
            "when_key_is" => (
                compile_when_key_is(as_map(inner_value)?, parent_fields(map)?.as_ref(), ctx)?,
                true,
            ),
            "when_key_exists" => (compile_when_key_exists(as_map(inner_value)?, ctx)?, false),
            "when_type_is" => (compile_when_type_is(as_map(inner_value)?, ctx)?, false),
            "function" => (compile_dynamic_schema(inner_value)?, false),
            other => {
                return Err(SchemaError::SimpleSchemaError {
                    message: format!("unknown `choose_schema` selector {other:?}"),
                })
            }
        };
        return Ok(Some(Branching {
            instruction,
            consumed_fields,
        }));
    }
    Ok(None)
}

fn compile_candidates(
    items: &[Value],
    map: &IndexMap<String, Value>,
    ctx: &mut CompileCtx,
) -> Result<Vec<Arc<Program>>, SchemaError> {
    let base = without_keys(map, &["anyof", "oneof"]);
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        // A string candidate is a schema reference, not a sub-schema to
        // merge the outer directives into — there's nothing to merge into
        // an already-named program.
        let program = match item {
            Value::Str(_) => compile_schema(item, ctx)?,
            _ => compile_map(&merge_maps(&base, as_map(item)?), ctx)?,
        };
        out.push(Arc::new(program));
    }
    Ok(out)
}

fn compile_as_fields(inner: &IndexMap<String, Value>, ctx: &mut CompileCtx) -> Result<Instruction, SchemaError> {
    let mut fields = IndexMap::with_capacity(inner.len());
    for (k, sub) in inner {
        fields.insert(k.clone(), Arc::new(compile_schema(sub, ctx)?));
    }
    Ok(Instruction::CheckFields(fields))
}

/// The legacy `schema` directive is ambiguous: `{schema: {foo: {...}}}` means
/// "these are the dict's fields", but `{type: list, schema: {type: ...}}`
/// means "this is the element schema". Mirrors the original disambiguation:
/// try compiling the value as a fields map first; if that fails outright
/// (e.g. a field whose "sub-schema" isn't a map or string reference, as
/// happens when the value is really an element schema with an `anyof`/`oneof`
/// list), fall back to treating it as a single element schema. If both
/// interpretations compile, a `type` key inside the value tips it toward
/// being a standalone element schema rather than a field named `type`.
fn compile_legacy_schema(v: &Value, ctx: &mut CompileCtx) -> Result<Instruction, SchemaError> {
    match v {
        Value::Seq(items) => {
            let elem = items.first().ok_or_else(|| SchemaError::SimpleSchemaError {
                message: "legacy `schema` list form requires one element schema".into(),
            })?;
            Ok(Instruction::CheckElements(Arc::new(compile_schema(elem, ctx)?)))
        }
        Value::Map(inner) => {
            let mut fields_ctx = ctx.clone();
            match compile_as_fields(inner, &mut fields_ctx) {
                Ok(fields_instr) => {
                    let mut elements_ctx = ctx.clone();
                    match compile_schema(v, &mut elements_ctx) {
                        Ok(elements_program) if inner.contains_key("type") => {
                            *ctx = elements_ctx;
                            Ok(Instruction::CheckElements(Arc::new(elements_program)))
                        }
                        _ => {
                            *ctx = fields_ctx;
                            Ok(fields_instr)
                        }
                    }
                }
                Err(_) => {
                    let program = compile_schema(v, ctx)?;
                    Ok(Instruction::CheckElements(Arc::new(program)))
                }
            }
        }
        other => Err(SchemaError::SimpleSchemaError {
            message: format!(
                "legacy `schema` directive must be a mapping or a one-element list, got {}",
                other.shape()
            ),
        }),
    }
}

fn compile_remaining(
    map: &IndexMap<String, Value>,
    skip_fields: bool,
    ctx: &mut CompileCtx,
    instructions: &mut Vec<Instruction>,
) -> Result<(), SchemaError> {
    if let Some(Value::Str(name)) = map.get("schema_ref") {
        instructions.push(Instruction::SchemaReference(resolve_schema_ref(name, ctx)));
    }
    if let Some(Value::Seq(items)) = map.get("oneof") {
        instructions.push(Instruction::OneOf(compile_candidates(items, map, ctx)?));
    }
    if let Some(Value::Seq(items)) = map.get("anyof") {
        instructions.push(Instruction::AnyOf(compile_candidates(items, map, ctx)?));
    }
    if map.contains_key("min") || map.contains_key("max") {
        instructions.push(Instruction::CheckBounds {
            min: map.get("min").cloned(),
            max: map.get("max").cloned(),
        });
    }
    if map.contains_key("minlength") || map.contains_key("maxlength") {
        let min = map.get("minlength").map(as_usize).transpose()?;
        let max = map.get("maxlength").map(as_usize).transpose()?;
        instructions.push(Instruction::CheckLength { min, max });
    }
    if let Some(Value::Str(pattern)) = map.get("regex") {
        let regex = Regex::new(pattern).map_err(|e| SchemaError::SimpleSchemaError {
            message: format!("invalid regex {pattern:?}: {e}"),
        })?;
        instructions.push(Instruction::CheckRegex {
            pattern: pattern.clone(),
            regex: Arc::new(regex),
        });
    }
    if let Some(v) = map.get("elements") {
        instructions.push(Instruction::CheckElements(Arc::new(compile_schema(v, ctx)?)));
    }
    if let Some(v) = map.get("keyschema") {
        instructions.push(Instruction::CheckKeys(Arc::new(compile_schema(v, ctx)?)));
    }
    if let Some(v) = map.get("valueschema") {
        instructions.push(Instruction::CheckValues(Arc::new(compile_schema(v, ctx)?)));
    }
    if let Some(Value::Seq(items)) = map.get("allowed") {
        instructions.push(Instruction::CheckAllowList(items.clone()));
    }
    if !skip_fields {
        if let Some(Value::Map(field_defs)) = map.get("fields") {
            let mut fields = IndexMap::with_capacity(field_defs.len());
            for (k, sub) in field_defs {
                fields.insert(k.clone(), Arc::new(compile_schema(sub, ctx)?));
            }
            instructions.push(Instruction::CheckFields(fields));
        }
        if let Some(v) = map.get("schema") {
            instructions.push(compile_legacy_schema(v, ctx)?);
        }
    }
    if let Some(v) = map.get("validator") {
        instructions.push(Instruction::CustomValidator(compile_fn_or_name_validator(v, ctx)?));
    }
    if let Some(v) = map.get("coerce_post") {
        instructions.push(Instruction::CoercePost(compile_fn_or_name_coerce(v, ctx)?));
    }
    Ok(())
}

fn compile_map(map: &IndexMap<String, Value>, ctx: &mut CompileCtx) -> Result<Program, SchemaError> {
    check_unknown_directives(map)?;
    let field_meta = extract_field_meta(map, ctx)?;

    let mut instructions = Vec::new();
    compile_registries(map, ctx, &mut instructions)?;
    compile_tag_context(map, ctx, &mut instructions)?;
    if let Some(Value::Bool(allow_unknown)) = map.get("allow_unknown") {
        instructions.push(Instruction::SetAllowUnknown(*allow_unknown));
    }
    if matches!(map.get("nullable"), Some(Value::Bool(true))) {
        instructions.push(Instruction::SkipIfNull);
    }
    if let Some(v) = map.get("coerce") {
        instructions.push(Instruction::Coerce(compile_fn_or_name_coerce(v, ctx)?));
    }
    if let Some(Value::Str(t)) = map.get("type") {
        let type_name = TypeName::parse(t).ok_or_else(|| SchemaError::SimpleSchemaError {
            message: format!("unknown type {t:?}"),
        })?;
        instructions.push(Instruction::CheckType(type_name));
    }

    let skip_fields = match compile_branching(map, ctx)? {
        Some(branching) => {
            instructions.push(branching.instruction);
            branching.consumed_fields
        }
        None => false,
    };

    compile_remaining(map, skip_fields, ctx, &mut instructions)?;
    let mut program = Program::new(instructions);
    program.field_meta = field_meta;
    Ok(program)
}

#[cfg(test)]
mod tests {
    use sieve_core::interpret;

    use super::*;

    fn ctx_root() -> sieve_core::Context {
        sieve_core::Context::root(false, sieve_core::context::Registries::builtin(), 1000)
    }

    #[test]
    fn rejects_unknown_directives() {
        let schema = Value::Map(IndexMap::from([("bogus".to_owned(), Value::Bool(true))]));
        let err = compile(&schema).unwrap_err();
        assert!(matches!(err, SchemaError::UnknownSchemaDirectives { .. }));
    }

    #[test]
    fn compiles_type_check() {
        let schema = Value::Map(IndexMap::from([(
            "type".to_owned(),
            Value::Str("integer".into()),
        )]));
        let program = compile(&schema).unwrap();
        let result = interpret(&program, Value::Int(3), ctx_root()).unwrap();
        assert_eq!(result, Value::Int(3));
        let err = interpret(&program, Value::Str("x".into()), ctx_root()).unwrap_err();
        assert!(err.to_string().contains("must be of type integer"));
    }

    #[test]
    fn fields_applies_default_and_rejects_unknown() {
        let schema = Value::Map(IndexMap::from([(
            "fields".to_owned(),
            Value::Map(IndexMap::from([(
                "name".to_owned(),
                Value::Map(IndexMap::from([
                    ("type".to_owned(), Value::Str("string".into())),
                    ("default".to_owned(), Value::Str("anon".into())),
                ])),
            )])),
        )]));
        let program = compile(&schema).unwrap();
        let result = interpret(&program, Value::empty_map(), ctx_root()).unwrap();
        assert_eq!(
            result,
            Value::Map(IndexMap::from([("name".to_owned(), Value::Str("anon".into()))]))
        );

        let input = Value::Map(IndexMap::from([("extra".to_owned(), Value::Int(1))]));
        let err = interpret(&program, input, ctx_root()).unwrap_err();
        assert!(matches!(err, sieve_core::ValueError::UnknownFields { .. }));
    }

    #[test]
    fn legacy_when_key_is_compiles_to_branch() {
        let schema = Value::Map(IndexMap::from([
            (
                "fields".to_owned(),
                Value::Map(IndexMap::from([(
                    "kind".to_owned(),
                    Value::Map(IndexMap::from([("type".to_owned(), Value::Str("string".into()))])),
                )])),
            ),
            (
                "when_key_is".to_owned(),
                Value::Map(IndexMap::from([
                    ("key".to_owned(), Value::Str("kind".into())),
                    (
                        "choices".to_owned(),
                        Value::Map(IndexMap::from([(
                            "a".to_owned(),
                            Value::Map(IndexMap::from([(
                                "fields".to_owned(),
                                Value::Map(IndexMap::from([
                                    (
                                        "kind".to_owned(),
                                        Value::Map(IndexMap::from([(
                                            "type".to_owned(),
                                            Value::Str("string".into()),
                                        )])),
                                    ),
                                    (
                                        "extra".to_owned(),
                                        Value::Map(IndexMap::from([(
                                            "type".to_owned(),
                                            Value::Str("integer".into()),
                                        )])),
                                    ),
                                ])),
                            )])),
                        )])),
                    ),
                ])),
            ),
        ]));
        let program = compile(&schema).unwrap();
        let input = Value::Map(IndexMap::from([
            ("kind".to_owned(), Value::Str("a".into())),
            ("extra".to_owned(), Value::Int(7)),
        ]));
        let result = interpret(&program, input.clone(), ctx_root()).unwrap();
        assert_eq!(result, input);
    }

    #[test]
    fn recursive_registry_schema_resolves_at_runtime() {
        let node = Value::Map(IndexMap::from([
            ("type".to_owned(), Value::Str("dict".into())),
            (
                "fields".to_owned(),
                Value::Map(IndexMap::from([(
                    "child".to_owned(),
                    Value::Map(IndexMap::from([
                        ("nullable".to_owned(), Value::Bool(true)),
                        ("schema_ref".to_owned(), Value::Str("node".into())),
                    ])),
                )])),
            ),
        ]));
        let schema = Value::Map(IndexMap::from([
            (
                "registry".to_owned(),
                Value::Map(IndexMap::from([("node".to_owned(), node)])),
            ),
            ("schema_ref".to_owned(), Value::Str("node".into())),
        ]));
        let program = compile(&schema).unwrap();
        let input = Value::Map(IndexMap::from([(
            "child".to_owned(),
            Value::Map(IndexMap::from([("child".to_owned(), Value::Null)])),
        )]));
        let result = interpret(&program, input.clone(), ctx_root()).unwrap();
        assert_eq!(result, input);
    }

    fn discriminated_union_schema() -> Value {
        Value::Map(IndexMap::from([
            ("type".to_owned(), Value::Str("dict".into())),
            (
                "choose_schema".to_owned(),
                Value::Map(IndexMap::from([(
                    "when_key_is".to_owned(),
                    Value::Map(IndexMap::from([
                        ("key".to_owned(), Value::Str("type".into())),
                        (
                            "choices".to_owned(),
                            Value::Map(IndexMap::from([
                                (
                                    "foo".to_owned(),
                                    Value::Map(IndexMap::from([(
                                        "fields".to_owned(),
                                        Value::Map(IndexMap::from([(
                                            "foo_sibling".to_owned(),
                                            Value::Map(IndexMap::from([(
                                                "type".to_owned(),
                                                Value::Str("string".into()),
                                            )])),
                                        )])),
                                    )])),
                                ),
                                (
                                    "bar".to_owned(),
                                    Value::Map(IndexMap::from([(
                                        "fields".to_owned(),
                                        Value::Map(IndexMap::from([(
                                            "bar_sibling".to_owned(),
                                            Value::Map(IndexMap::from([(
                                                "type".to_owned(),
                                                Value::Str("integer".into()),
                                            )])),
                                        )])),
                                    )])),
                                ),
                            ])),
                        ),
                    ])),
                )])),
            ),
        ]))
    }

    /// Neither choice declares the `type` discriminator in its own
    /// `fields`, and the parent has no `fields` at all to inherit it from
    /// — the compiler must still inject an `allowed` check for it into
    /// each branch, or a well-formed discriminated-union input would fail
    /// with a spurious `UnknownFields`.
    #[test]
    fn when_key_is_injects_discriminator_into_branch_fields() {
        let program = compile(&discriminated_union_schema()).unwrap();
        let input = Value::Map(IndexMap::from([
            ("type".to_owned(), Value::Str("bar".into())),
            ("bar_sibling".to_owned(), Value::Int(37)),
        ]));
        let result = interpret(&program, input.clone(), ctx_root()).unwrap();
        assert_eq!(result, input);
    }

    #[test]
    fn when_key_is_rejects_value_outside_choices() {
        let program = compile(&discriminated_union_schema()).unwrap();
        let input = Value::Map(IndexMap::from([("type".to_owned(), Value::Str("baz".into()))]));
        let err = interpret(&program, input, ctx_root()).unwrap_err();
        assert!(matches!(err, sieve_core::ValueError::DisallowedValue { .. }));
    }

    /// A schema combining `choose_schema` with a trailing `validator`
    /// exercises the non-tail-call path in the interpreter: the branch
    /// instruction isn't the program's last instruction, so its result
    /// must feed the `validator` that follows rather than replace the
    /// whole program.
    #[test]
    fn branching_followed_by_validator_runs_both() {
        let mut schema = as_map(&discriminated_union_schema()).unwrap().clone();
        schema.insert(
            "validator".to_owned(),
            Value::Opaque(Box::new(OpaqueValidator(std::sync::Arc::new(
                |_field: Option<&str>, value: &Value| {
                    let Value::Map(map) = value else {
                        return Ok(());
                    };
                    if map.contains_key("bar_sibling") {
                        Ok(())
                    } else {
                        Err(sieve_core::callback::ValidatorOutcome::Invalid(
                            "bar schemas must carry bar_sibling".into(),
                        ))
                    }
                },
            )))),
        );
        let program = compile(&Value::Map(schema)).unwrap();
        let input = Value::Map(IndexMap::from([
            ("type".to_owned(), Value::Str("bar".into())),
            ("bar_sibling".to_owned(), Value::Int(1)),
        ]));
        let result = interpret(&program, input.clone(), ctx_root()).unwrap();
        assert_eq!(result, input);
    }

    /// `set_tag: "foo"` is shorthand for `set_tag: {tag_name: "foo", key: "foo"}`.
    #[test]
    fn set_tag_bare_string_uses_the_same_name_for_tag_and_key() {
        let schema = Value::Map(IndexMap::from([
            ("set_tag".to_owned(), Value::Str("kind".into())),
            (
                "fields".to_owned(),
                Value::Map(IndexMap::from([
                    ("kind".to_owned(), Value::Map(IndexMap::from([("type".to_owned(), Value::Str("string".into()))]))),
                    (
                        "payload".to_owned(),
                        Value::Map(IndexMap::from([(
                            "choose_schema".to_owned(),
                            Value::Map(IndexMap::from([(
                                "when_tag_is".to_owned(),
                                Value::Map(IndexMap::from([
                                    ("tag".to_owned(), Value::Str("kind".into())),
                                    (
                                        "choices".to_owned(),
                                        Value::Map(IndexMap::from([(
                                            "number".to_owned(),
                                            Value::Map(IndexMap::from([("type".to_owned(), Value::Str("integer".into()))])),
                                        )])),
                                    ),
                                ])),
                            )])),
                        )])),
                    ),
                ])),
            ),
        ]));
        let program = compile(&schema).unwrap();
        let input = Value::Map(IndexMap::from([
            ("kind".to_owned(), Value::Str("number".into())),
            ("payload".to_owned(), Value::Int(7)),
        ]));
        let result = interpret(&program, input.clone(), ctx_root()).unwrap();
        assert_eq!(result, input);
    }
}
