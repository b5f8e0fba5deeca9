//! End-to-end coverage of the documented engine behaviors: the concrete
//! schema/input/output triples a reviewer would reach for first, plus the
//! cross-cutting properties (idempotence, stack fidelity, branch
//! isolation, …) that hold across every schema rather than one in
//! particular.

use std::sync::Arc;

use sieve::{normalize, Options, Value};
use sieve_core::callback::ValidatorOutcome;

fn map(entries: Vec<(&str, Value)>) -> Value {
    Value::Map(entries.into_iter().map(|(k, v)| (k.to_owned(), v)).collect())
}

fn str(s: &str) -> Value {
    Value::Str(s.to_owned())
}

// a. Default + nested normalization.
#[test]
fn default_fills_missing_nested_field() {
    let schema = map(vec![(
        "fields",
        map(vec![("x", map(vec![("type", str("string")), ("default", str(""))]))]),
    )]);
    let result = normalize(&schema, Value::empty_map(), &Options::default()).unwrap();
    assert_eq!(result, map(vec![("x", str(""))]));
}

// b. anyof with a default inside the winning candidate.
fn gradient_or_image_schema() -> Value {
    map(vec![
        ("type", str("dict")),
        (
            "anyof",
            Value::Seq(vec![
                map(vec![("schema", map(vec![("gradient", map(vec![("type", str("string"))]))]))]),
                map(vec![(
                    "schema",
                    map(vec![
                        ("image", map(vec![("type", str("string"))])),
                        ("opacity", map(vec![("type", str("integer")), ("default", Value::Int(100))])),
                    ]),
                )]),
            ]),
        ),
    ])
}

#[test]
fn anyof_picks_first_matching_candidate_and_applies_its_defaults() {
    let schema = gradient_or_image_schema();
    let result = normalize(&schema, map(vec![("image", str("foo"))]), &Options::default()).unwrap();
    assert_eq!(result, map(vec![("image", str("foo")), ("opacity", Value::Int(100))]));

    let result = normalize(&schema, map(vec![("gradient", str("foo"))]), &Options::default()).unwrap();
    assert_eq!(result, map(vec![("gradient", str("foo"))]));
}

// c. Discriminated union via choose_schema.when_key_is.
fn discriminated_union_schema() -> Value {
    map(vec![
        ("type", str("dict")),
        (
            "choose_schema",
            map(vec![(
                "when_key_is",
                map(vec![
                    ("key", str("type")),
                    (
                        "choices",
                        map(vec![
                            ("foo", map(vec![("fields", map(vec![("foo_sibling", map(vec![("type", str("string"))]))]))])),
                            ("bar", map(vec![("fields", map(vec![("bar_sibling", map(vec![("type", str("integer"))]))]))])),
                        ]),
                    ),
                ]),
            )]),
        ),
    ])
}

#[test]
fn discriminated_union_accepts_a_declared_choice() {
    let input = map(vec![("type", str("bar")), ("bar_sibling", Value::Int(37))]);
    let result = normalize(&discriminated_union_schema(), input.clone(), &Options::default()).unwrap();
    assert_eq!(result, input);
}

#[test]
fn discriminated_union_rejects_an_undeclared_choice() {
    let input = map(vec![("type", str("baz"))]);
    let err = normalize(&discriminated_union_schema(), input, &Options::default()).unwrap_err();
    assert!(matches!(err, sieve::Error::Value { .. }));
    assert!(err.to_string().contains("root[type]"));
}

// d. Recursive registry: a schema that refers to itself arbitrarily deep.
#[test]
fn recursive_registry_validates_nested_lists_of_integers() {
    let node = map(vec![
        ("type", str("list")),
        ("schema", map(vec![("anyof", Value::Seq(vec![map(vec![("type", str("integer"))]), str("L")]))])),
    ]);
    let schema = map(vec![("registry", map(vec![("L", node)])), ("schema_ref", str("L"))]);

    let input = Value::Seq(vec![
        Value::Seq(vec![Value::Int(3), Value::Int(4)]),
        Value::Int(5),
        Value::Seq(vec![Value::Int(6), Value::Seq(vec![Value::Int(7)])]),
    ]);
    let result = normalize(&schema, input.clone(), &Options::default()).unwrap();
    assert_eq!(result, input);
}

// e. Rename + coerce.
#[test]
fn rename_applies_after_the_field_subschema_runs() {
    let schema = map(vec![
        ("type", str("dict")),
        (
            "fields",
            map(vec![("foo", map(vec![("rename", str("moo")), ("coerce", str("to_str"))]))]),
        ),
    ]);
    let result = normalize(&schema, map(vec![("foo", Value::Int(2))]), &Options::default()).unwrap();
    assert_eq!(result, map(vec![("moo", str("2"))]));
}

// f. Tag-driven branching.
fn tag_driven_schema() -> Value {
    map(vec![
        ("type", str("dict")),
        ("set_tag", map(vec![("tag_name", str("t")), ("key", str("type"))])),
        (
            "fields",
            map(vec![
                ("type", map(vec![("type", str("string"))])),
                (
                    "payload",
                    map(vec![(
                        "choose_schema",
                        map(vec![(
                            "when_tag_is",
                            map(vec![
                                ("tag", str("t")),
                                ("choices", map(vec![("B", map(vec![("type", str("boolean"))])), ("S", map(vec![("type", str("string"))]))])),
                            ]),
                        )]),
                    )]),
                ),
            ]),
        ),
    ])
}

#[test]
fn tag_set_on_the_document_drives_a_sibling_fields_branch() {
    let input = map(vec![("type", str("B")), ("payload", Value::Bool(true))]);
    let result = normalize(&tag_driven_schema(), input.clone(), &Options::default()).unwrap();
    assert_eq!(result, input);
}

#[test]
fn tag_mismatch_fails_with_the_payload_field_on_the_stack() {
    let input = map(vec![("type", str("B")), ("payload", str("x"))]);
    let err = normalize(&tag_driven_schema(), input, &Options::default()).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("root[payload]"), "unexpected message: {msg}");
}

// --- Universal properties (spec.md §8) ---

#[test]
fn normalization_is_idempotent() {
    let schema = gradient_or_image_schema();
    let once = normalize(&schema, map(vec![("image", str("foo"))]), &Options::default()).unwrap();
    let twice = normalize(&schema, once.clone(), &Options::default()).unwrap();
    assert_eq!(once, twice);
}

#[test]
fn normalization_does_not_mutate_the_input_in_place() {
    let schema = map(vec![(
        "fields",
        map(vec![("name", map(vec![("type", str("string")), ("default", str("anon"))]))]),
    )]);
    let input = Value::empty_map();
    let input_copy = input.clone();
    let _ = normalize(&schema, input, &Options::default()).unwrap();
    assert_eq!(input_copy, Value::empty_map());
}

#[test]
fn error_messages_carry_the_full_key_path() {
    let schema = map(vec![(
        "fields",
        map(vec![("inner", map(vec![("fields", map(vec![("leaf", map(vec![("type", str("integer"))]))]))]))]),
    )]);
    let input = map(vec![("inner", map(vec![("leaf", str("not an int"))]))]);
    let err = normalize(&schema, input, &Options::default()).unwrap_err();
    assert!(err.to_string().starts_with("root[inner][leaf]"));
}

#[test]
fn nested_registry_entry_shadows_the_outer_one_by_name() {
    use sieve::opaque::OpaqueDefaultSetter;

    let outer_zero: sieve_core::callback::DefaultSetter = Arc::new(|_: &Value| Ok(Value::Int(0)));
    let inner_zero: sieve_core::callback::DefaultSetter = Arc::new(|_: &Value| Ok(Value::Int(99)));

    let schema = map(vec![
        (
            "default_registry",
            map(vec![("zero", Value::Opaque(Box::new(OpaqueDefaultSetter(outer_zero))))]),
        ),
        (
            "fields",
            map(vec![
                ("a", map(vec![("type", str("integer")), ("default_setter", str("zero"))])),
                (
                    "nested",
                    map(vec![
                        (
                            "default_registry",
                            map(vec![("zero", Value::Opaque(Box::new(OpaqueDefaultSetter(inner_zero))))]),
                        ),
                        ("fields", map(vec![("b", map(vec![("type", str("integer")), ("default_setter", str("zero"))]))])),
                    ]),
                ),
            ]),
        ),
    ]);

    let input = map(vec![("nested", Value::empty_map())]);
    let result = normalize(&schema, input, &Options::default()).unwrap();
    assert_eq!(result, map(vec![("a", Value::Int(0)), ("nested", map(vec![("b", Value::Int(99))]))]));
}

#[test]
fn anyof_failed_candidate_side_effects_do_not_leak() {
    let schema = map(vec![
        ("type", str("dict")),
        (
            "anyof",
            Value::Seq(vec![
                map(vec![(
                    "fields",
                    map(vec![("kind", map(vec![("type", str("string")), ("allowed", Value::Seq(vec![str("never-matches")]))]))]),
                )]),
                map(vec![("fields", map(vec![("kind", map(vec![("type", str("string"))]))]))]),
            ]),
        ),
    ]);
    let input = map(vec![("kind", str("ok"))]);
    let result = normalize(&schema, input.clone(), &Options::default()).unwrap();
    assert_eq!(result, input);
}

#[test]
fn coerce_runs_before_type_check_not_after() {
    let schema = map(vec![("coerce", str("to_str")), ("type", str("string"))]);
    let result = normalize(&schema, Value::Int(9), &Options::default()).unwrap();
    assert_eq!(result, str("9"));

    let reversed_order_would_fail = map(vec![("type", str("string")), ("coerce", str("to_str"))]);
    let err = normalize(&reversed_order_would_fail, Value::Int(9), &Options::default()).unwrap_err();
    assert!(matches!(err, sieve::Error::Value { .. }));
}

#[test]
fn max_depth_bounds_self_referential_traversal() {
    let node = map(vec![("type", str("list")), ("elements", str("L"))]);
    let schema = map(vec![("registry", map(vec![("L", node)])), ("schema_ref", str("L"))]);

    let mut input = Value::Seq(vec![]);
    for _ in 0..2000 {
        input = Value::Seq(vec![input]);
    }
    let options = Options { allow_unknown: false, max_depth: 50 };
    let err = normalize(&schema, input, &options).unwrap_err();
    assert!(matches!(err, sieve::Error::Value { .. }));
}

#[test]
fn oneof_requires_exactly_one_match() {
    let schema = map(vec![(
        "oneof",
        Value::Seq(vec![map(vec![("type", str("integer"))]), map(vec![("type", str("number"))])]),
    )]);
    // Both candidates match an integer under the documented `number`
    // quirk (it matches `Value::Int` too) — `oneof` demands exactly one.
    let err = normalize(&schema, Value::Int(3), &Options::default()).unwrap_err();
    assert!(matches!(err, sieve::Error::Value { .. }));
}

#[test]
fn custom_validator_failure_surfaces_as_a_value_error() {
    let validator: sieve_core::callback::Validator = Arc::new(|_field: Option<&str>, value: &Value| match value {
        Value::Int(n) if *n % 2 == 0 => Ok(()),
        _ => Err(ValidatorOutcome::Invalid("must be even".into())),
    });
    let schema = map(vec![
        ("type", str("integer")),
        ("validator", Value::Opaque(Box::new(sieve::opaque::OpaqueValidator(validator)))),
    ]);
    assert_eq!(normalize(&schema, Value::Int(4), &Options::default()).unwrap(), Value::Int(4));
    let err = normalize(&schema, Value::Int(3), &Options::default()).unwrap_err();
    assert!(matches!(err, sieve::Error::Value { .. }));
}
