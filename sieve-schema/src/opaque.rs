//! Wrapper [`Opaque`] types letting a host embed real callbacks inside a
//! schema [`Value`] tree — e.g. as the entries of a `coerce_registry`
//! mapping, or as `choose_schema.function`. The wire schema itself stays
//! plain data; these wrappers are how a host-constructed `Value` carries
//! something the engine can't otherwise represent.

use std::any::Any;
use std::fmt;

use sieve_core::callback::{Coercer, DefaultSetter, ModifyContextFn, Validator};
use sieve_core::instruction::DynamicSchemaFn;
use sieve_core::value::Opaque;

macro_rules! opaque_callback {
    ($name:ident, $ty:ty) => {
        /// See the module docs.
        #[derive(Clone)]
        pub struct $name(pub $ty);

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(stringify!($name))
            }
        }

        impl Opaque for $name {
            fn opaque_eq(&self, _other: &dyn Opaque) -> bool {
                false
            }

            fn as_any(&self) -> &dyn Any {
                self
            }
        }
    };
}

opaque_callback!(OpaqueCoercer, Coercer);
opaque_callback!(OpaqueDefaultSetter, DefaultSetter);
opaque_callback!(OpaqueValidator, Validator);
opaque_callback!(OpaqueModifyContext, ModifyContextFn);
opaque_callback!(OpaqueDynamicSchema, DynamicSchemaFn);
