//! Control flow: declarations, assignment, branching, loops, and the
//! return/throw unwinding that stops at the nearest frame boundary.

use crate::{
    error::{ErrorDetails, ErrorKind},
    instruction::Instr,
    program::{AssignTarget, DestructureField, PathSeg, Span, Stmt},
    state::RunState,
    trace::RunTracer,
    value::{Payload, ValueData, ValueSource, WrappedValue, validate_and_coerce},
};

use super::{pop_value, push_stmts};

pub fn declare_var(
    state: &mut RunState,
    name: &str,
    ty: Option<crate::value::DeclaredType>,
    is_const: bool,
    is_private: bool,
    span: Span,
) -> Result<(), ErrorDetails> {
    let value = pop_value(state)?;
    let mut bound = match (&ty, &value.data) {
        (Some(declared), ValueData::Ok(payload)) => {
            match validate_and_coerce(payload.clone(), declared, name, &*state) {
                Ok(coerced) => {
                    let mut v = WrappedValue::wrap(coerced, value.source);
                    v.async_handle = value.async_handle;
                    v
                }
                // A mismatched annotation on a direct literal is a bug in
                // the script itself and fails the run; every other source
                // becomes an errored binding.
                Err(detail) => {
                    if value.source == ValueSource::Literal {
                        return Err(detail.at(state.loc(span)));
                    }
                    WrappedValue::as_error(detail.at(state.loc(span)))
                }
            }
        }
        _ => value,
    };
    bound.declared_type = match ty {
        Some(ty) => Some(ty),
        None if bound.is_errored() => None,
        None => crate::value::infer_declared_type(bound.payload()),
    };
    bound.is_const = is_const;
    bound.is_private = is_private;
    state.last_result = bound.clone();
    state.declare(name, bound).map_err(|d| d.at(state.loc(span)))
}

pub fn declare_destructure(
    state: &mut RunState,
    fields: &[DestructureField],
    span: Span,
) -> Result<(), ErrorDetails> {
    let value = pop_value(state)?;
    state.pending_destructuring = None;
    for field in fields {
        let bound = match &value.data {
            ValueData::Err(detail) => WrappedValue::as_error(detail.clone()),
            ValueData::Ok(Payload::Record(record)) => match record.get(&field.name) {
                Some(payload) => match validate_and_coerce(payload.clone(), &field.ty, &field.name, &*state) {
                    Ok(coerced) => {
                        let mut v = WrappedValue::wrap(coerced, value.source);
                        v.declared_type = Some(field.ty.clone());
                        v
                    }
                    Err(detail) => {
                        if value.source == ValueSource::Literal {
                            return Err(detail.at(state.loc(span)));
                        }
                        WrappedValue::as_error(detail.at(state.loc(span)))
                    }
                },
                None => WrappedValue::as_error(
                    ErrorDetails::value_error(format!("missing field '{}' in destructured value", field.name))
                        .at(state.loc(span)),
                ),
            },
            ValueData::Ok(other) => {
                return Err(ErrorDetails::value_error(format!(
                    "cannot destructure {} into fields",
                    other.type_name()
                ))
                .at(state.loc(span)));
            }
        };
        state.declare(&field.name, bound).map_err(|d| d.at(state.loc(span)))?;
    }
    state.last_result = value;
    Ok(())
}

pub fn assign(state: &mut RunState, target: &AssignTarget, span: Span) -> Result<(), ErrorDetails> {
    let value = pop_value(state)?;
    state.last_result = value.clone();
    if target.path.is_empty() {
        return state.assign_name(&target.root, value).map_err(|d| d.at(state.loc(span)));
    }
    assign_path(state, target, value, span)
}

/// Stores into a field or element of an existing binding. Slices are not
/// assignable.
fn assign_path(
    state: &mut RunState,
    target: &AssignTarget,
    value: WrappedValue,
    span: Span,
) -> Result<(), ErrorDetails> {
    let loc = state.loc(span);
    let Some(root) = state.binding_for_path_mut(&target.root) else {
        return Err(ErrorDetails::undefined(&target.root).at(loc));
    };
    if root.is_const {
        return Err(ErrorDetails::scope_error(format!("cannot assign to constant '{}'", target.root)).at(loc));
    }
    let ValueData::Ok(mut payload) = std::mem::replace(&mut root.data, ValueData::Ok(Payload::Null)) else {
        return Err(ErrorDetails::value_error(format!(
            "cannot assign into errored value '{}'",
            target.root
        ))
        .at(loc));
    };
    let result = write_path(&mut payload, &target.path, value.payload().clone());
    // Reinstall the payload whether or not the path write succeeded.
    let Some(root) = state.binding_for_path_mut(&target.root) else {
        return Err(ErrorDetails::undefined(&target.root).at(loc));
    };
    root.data = ValueData::Ok(payload);
    result.map_err(|d| d.at(loc))
}

fn write_path(payload: &mut Payload, path: &[PathSeg], value: Payload) -> Result<(), ErrorDetails> {
    let Some((head, rest)) = path.split_first() else {
        *payload = value;
        return Ok(());
    };
    match (head, payload) {
        (PathSeg::Field(field), Payload::Record(record)) => {
            if rest.is_empty() {
                record.insert(field.clone(), value);
                Ok(())
            } else {
                let Some(next) = record.get_mut(field) else {
                    return Err(ErrorDetails::value_error(format!("no field '{field}' to assign into")));
                };
                write_path(next, rest, value)
            }
        }
        (PathSeg::Index(i), Payload::Seq(items)) => {
            let len = items.len();
            let idx = if *i < 0 { i + i64::try_from(len).unwrap_or(0) } else { *i };
            let Ok(idx) = usize::try_from(idx) else {
                return Err(ErrorDetails::value_error(format!("index {i} out of range")));
            };
            let Some(slot) = items.get_mut(idx) else {
                return Err(ErrorDetails::value_error(format!("index {i} out of range (len {len})")));
            };
            write_path(slot, rest, value)
        }
        (PathSeg::Slice(..), _) => Err(ErrorDetails::value_error("cannot assign into a slice")),
        (seg, other) => Err(ErrorDetails::value_error(format!(
            "cannot assign into {} with {seg:?}",
            other.type_name()
        ))),
    }
}

pub fn if_branch(
    state: &mut RunState,
    then_body: Vec<Stmt>,
    else_body: Vec<Stmt>,
    span: Span,
) -> Result<(), ErrorDetails> {
    let cond = pop_value(state)?;
    // Conditions are strict: anything but a boolean payload is a hard type
    // error, including errored values.
    let Payload::Bool(flag) = cond.payload() else {
        let got = if cond.is_errored() { "errored value" } else { cond.payload().type_name() };
        return Err(ErrorDetails::value_error(format!("condition must be a boolean, got {got}")).at(state.loc(span)));
    };
    let body = if *flag { then_body } else { else_body };
    state.instruction_stack.push(Instr::ExitBlock);
    state.enter_scope(false);
    push_stmts(state, &body);
    Ok(())
}

pub fn begin_loop(state: &mut RunState, var: String, body: Vec<Stmt>, span: Span) -> Result<(), ErrorDetails> {
    let iterable = pop_value(state)?;
    if let Some(detail) = iterable.error_details() {
        return Err(detail.clone().or_at(&state.loc(span)));
    }
    let items: Vec<Payload> = match iterable.payload() {
        // An integer N iterates the inclusive range 1..N; empty when N < 1.
        Payload::Int(n) => (1..=*n).map(Payload::Int).collect(),
        Payload::Range { start, end } => (*start..=*end).map(Payload::Int).collect(),
        Payload::Seq(items) => items.clone(),
        other => {
            return Err(
                ErrorDetails::value_error(format!("expected array or range, got {}", other.type_name()))
                    .at(state.loc(span)),
            );
        }
    };
    state.instruction_stack.push(Instr::LoopIter {
        var,
        items,
        index: 0,
        body,
        span,
    });
    Ok(())
}

pub fn loop_iter(
    state: &mut RunState,
    var: String,
    items: Vec<Payload>,
    index: usize,
    body: Vec<Stmt>,
    span: Span,
) -> Result<(), ErrorDetails> {
    let Some(item) = items.get(index).cloned() else {
        return Ok(());
    };
    state.instruction_stack.push(Instr::LoopIter {
        var: var.clone(),
        items,
        index: index + 1,
        body: body.clone(),
        span,
    });
    state.instruction_stack.push(Instr::ExitBlock);
    state.enter_scope(true);
    push_stmts(state, &body);
    state
        .declare(&var, WrappedValue::wrap(item, ValueSource::Literal))
        .map_err(|d| d.at(state.loc(span)))
}

/// Unwinds to the nearest frame boundary with the given result value.
/// Inside a function the frame pops and the caller sees the value; at the
/// program top level the run finishes with it.
fn unwind_to_frame_boundary(
    state: &mut RunState,
    result: WrappedValue,
    tracer: &mut impl RunTracer,
) {
    let mut scopes_to_drop = 0usize;
    while let Some(instr) = state.instruction_stack.pop() {
        match instr {
            Instr::PopFrame => {
                let depth = state.call_depth().saturating_sub(1);
                state.pop_frame();
                tracer.on_frame_pop(depth);
                state.last_result = result.clone();
                state.value_stack.push(result);
                return;
            }
            Instr::ExitBlock => scopes_to_drop += 1,
            _ => {}
        }
    }
    // Program boundary: the run's result is the thrown/returned value.
    for _ in 0..scopes_to_drop {
        state.exit_scope();
    }
    state.last_result = result;
}

pub fn return_(
    state: &mut RunState,
    has_value: bool,
    _span: Span,
    tracer: &mut impl RunTracer,
) -> Result<(), ErrorDetails> {
    let value = if has_value { pop_value(state)? } else { WrappedValue::null() };
    unwind_to_frame_boundary(state, value, tracer);
    Ok(())
}

/// `throw expr`: the evaluated message becomes an errored value returned
/// from the enclosing function. No unwinding past that boundary — the
/// caller observes the errored value as if the call returned it.
pub fn throw(state: &mut RunState, span: Span, tracer: &mut impl RunTracer) -> Result<(), ErrorDetails> {
    let message = pop_value(state)?;
    let text = match &message.data {
        ValueData::Err(detail) => detail.message.clone(),
        ValueData::Ok(payload) => payload.display_text(),
    };
    let mut detail = ErrorDetails::new(ErrorKind::UserThrow, text);
    detail.location = Some(state.loc(span));
    unwind_to_frame_boundary(state, WrappedValue::as_error(detail), tracer);
    Ok(())
}

pub fn pop_frame(state: &mut RunState, tracer: &mut impl RunTracer) -> Result<(), ErrorDetails> {
    let depth = state.call_depth().saturating_sub(1);
    state.pop_frame();
    tracer.on_frame_pop(depth);
    // A function body that falls off the end returns null.
    state.last_result = WrappedValue::null();
    state.value_stack.push(WrappedValue::null());
    Ok(())
}
