//! Drives a compiled [`Program`] against a value, flattening tail calls
//! (branch dispatch, `schema_ref`, `ApplyDynamicSchema`) into iteration so
//! that deeply recursive/self-referential schemas don't grow the native
//! call stack. See `SPEC_FULL.md` §4.3.

use std::sync::Arc;

use crate::context::Context;
use crate::error::ValueError;
use crate::instruction::Program;
use crate::value::Value;

/// The outcome of running a single [`crate::instruction::Instruction`].
pub enum Step {
    /// Keep going with the rest of the current program.
    Continue(Value, Context),
    /// Stop executing the current program immediately and return this
    /// value (used by `SkipIfNull`).
    ShortCircuit(Value),
    /// Abandon the rest of the current program and continue execution with
    /// a different program instead — a tail call.
    TailCall(Arc<Program>, Value, Context),
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Step::Continue(value, _) => f.debug_tuple("Continue").field(value).finish(),
            Step::ShortCircuit(value) => f.debug_tuple("ShortCircuit").field(value).finish(),
            Step::TailCall(_, value, _) => f.debug_tuple("TailCall").field(value).finish(),
        }
    }
}

/// Run `program` against `value` under `ctx`, returning the normalized
/// value or the first [`ValueError`] raised.
///
/// A `TailCall` (branch dispatch, `schema_ref`, `ApplyDynamicSchema`) is
/// only ever the *last* instruction of a compiled program when the
/// directive that produced it was the only directive present — e.g. a
/// schema that is nothing but a string reference, or `choose_schema` with
/// no trailing `validator`/`coerce_post`/etc. In that case there is
/// nothing left to come back to, so the loop swaps in the new program and
/// restarts the cursor instead of growing the native call stack — this is
/// what keeps a self-referential schema (a list of itself, arbitrarily
/// nested) from recursing natively per level.
///
/// When a `TailCall` is *not* the last instruction — a schema combining
/// `choose_schema` with a trailing `validator`, say — the sub-program's
/// result cannot simply replace the rest of the program, so `interpret` is
/// called recursively for just that sub-program and its returned value
/// feeds the next instruction. The context is left exactly as it was
/// before that instruction; only `value` carries forward, matching how a
/// merged sub-result is folded back into the surrounding program.
pub fn interpret(program: &Program, value: Value, ctx: Context) -> Result<Value, ValueError> {
    let mut instructions: &[crate::instruction::Instruction] = &program.instructions;
    let mut value = value;
    let mut ctx = ctx;
    let mut owned_program;

    let mut cursor = 0usize;
    'outer: loop {
        while cursor < instructions.len() {
            let instruction = &instructions[cursor];
            let step_ctx = ctx.clone();
            match instruction.perform(value, step_ctx)? {
                Step::Continue(v, c) => {
                    value = v;
                    ctx = c;
                    cursor += 1;
                }
                Step::ShortCircuit(v) => {
                    return Ok(v);
                }
                Step::TailCall(next, v, c) => {
                    if cursor + 1 == instructions.len() {
                        owned_program = next;
                        instructions = owned_program.instructions.as_slice();
                        value = v;
                        ctx = c;
                        cursor = 0;
                        continue 'outer;
                    }
                    value = interpret(&next, v, c)?;
                    cursor += 1;
                }
            }
        }
        return Ok(value);
    }
}
