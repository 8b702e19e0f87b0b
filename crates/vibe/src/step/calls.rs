//! Call dispatch and the instructions that suspend for external service.
//!
//! Resolution order for a call: builtins, then user functions (the current
//! module's when executing module code), then imported names, then a value
//! lookup purely for error reporting. Tools are never directly callable —
//! they only reach execution through a model's tool list.

use crate::{
    builtins::{Builtin, call_builtin},
    error::ErrorDetails,
    host::system_tool_descriptors,
    imports::SYSTEM_UTILS,
    instruction::{AsyncBinding, Instr, ReturnExpectation, StartKind},
    io::PrintWriter,
    program::{AiOpKind, Expr, ExprLoc, FunctionDef, ImportKind, ParamExpr, Span},
    scheduler::{AsyncEntry, StartDescriptor},
    state::{
        AiPending, CompressPending, Frame, HostBlockPending, ImportedHostPending, RunState, Status, ToolPending,
    },
    trace::RunTracer,
    value::{ModelDescriptor, Payload, ValueSource, WrappedValue},
};

use super::{pop_value, push_stmts};

/// Pops `argc` values and returns them in call order.
fn pop_args(state: &mut RunState, argc: usize) -> Result<Vec<WrappedValue>, ErrorDetails> {
    let mut args = Vec::with_capacity(argc);
    for _ in 0..argc {
        args.push(pop_value(state)?);
    }
    args.reverse();
    Ok(args)
}

pub fn call(
    state: &mut RunState,
    name: &str,
    argc: usize,
    span: Span,
    print: &mut impl PrintWriter,
    tracer: &mut impl RunTracer,
) -> Result<(), ErrorDetails> {
    let args = pop_args(state, argc)?;

    if let Some(builtin) = Builtin::from_name(name) {
        match call_builtin(state, builtin, args, span, print) {
            Ok(Some(value)) => {
                state.value_stack.push(value);
                return Ok(());
            }
            // The builtin suspended (ask); the answer arrives on resume.
            Ok(None) => return Ok(()),
            Err(detail) => return Err(detail.or_at(&state.loc(span))),
        }
    }

    let module_path = state.current_frame().and_then(|f| f.module_path.clone());

    // Module code resolves its own functions and imports first.
    if let Some(path) = &module_path {
        if let Some(func) = state.vibe_modules.get(path).and_then(|m| m.functions.get(name)).cloned() {
            return push_function_frame(state, &func, args, Some(path.clone()), span, tracer);
        }
        if let Some(info) = state
            .vibe_modules
            .get(path)
            .and_then(|m| m.imported_names.get(name))
            .cloned()
        {
            return call_imported(state, &info.source_path, info.kind, &info.original_name, args, span, tracer);
        }
    }

    if let Some(func) = state.functions.get(name).cloned() {
        return push_function_frame(state, &func, args, None, span, tracer);
    }

    if let Some(info) = state.imported_names.get(name).cloned() {
        return call_imported(state, &info.source_path, info.kind, &info.original_name, args, span, tracer);
    }

    // Nothing callable: inspect the value for a precise diagnostic.
    if let Some(value) = state.lookup(name) {
        if matches!(value.payload(), Payload::Tool(_)) {
            return Err(
                ErrorDetails::scope_error(format!("Cannot call tool '{name}' directly")).at(state.loc(span)),
            );
        }
        return Err(ErrorDetails::scope_error(format!("'{name}' is not a function")).at(state.loc(span)));
    }
    Err(ErrorDetails::undefined(name).at(state.loc(span)))
}

fn call_imported(
    state: &mut RunState,
    source_path: &str,
    kind: ImportKind,
    original_name: &str,
    args: Vec<WrappedValue>,
    span: Span,
    tracer: &mut impl RunTracer,
) -> Result<(), ErrorDetails> {
    match kind {
        ImportKind::Vibe => {
            let Some(func) = state
                .vibe_modules
                .get(source_path)
                .and_then(|m| m.functions.get(original_name))
                .cloned()
            else {
                return Err(ErrorDetails::scope_error(format!("'{original_name}' is not a function"))
                    .at(state.loc(span)));
            };
            push_function_frame(state, &func, args, Some(source_path.to_owned()), span, tracer)
        }
        ImportKind::Host => {
            state.instruction_stack.push(Instr::PendingImportedHostCall {
                module: source_path.to_owned(),
                function: original_name.to_owned(),
                args,
                span,
            });
            Ok(())
        }
        ImportKind::System => {
            if SYSTEM_UTILS.contains(&original_name) {
                let result = exec_system_util(original_name, &args);
                state.value_stack.push(result);
                return Ok(());
            }
            // Tool-backed system functions go through the driver's tool
            // executor.
            state.instruction_stack.push(Instr::PendingTool {
                name: original_name.to_owned(),
                args,
                span,
            });
            Ok(())
        }
    }
}

/// Pushes an activation frame for a user-defined function and compiles its
/// body. Imported functions carry their module path so free names resolve
/// in their home module.
pub(crate) fn push_function_frame(
    state: &mut RunState,
    func: &FunctionDef,
    args: Vec<WrappedValue>,
    module_path: Option<String>,
    span: Span,
    tracer: &mut impl RunTracer,
) -> Result<(), ErrorDetails> {
    if args.len() != func.params.len() {
        return Err(ErrorDetails::scope_error(format!(
            "function '{}' expects {} arguments, got {}",
            func.name,
            func.params.len(),
            args.len()
        ))
        .at(state.loc(span)));
    }
    state.push_frame(Frame::new(func.name.clone(), module_path));
    tracer.on_frame_push(&func.name, state.call_depth());
    for (param, arg) in func.params.iter().zip(args) {
        state.declare(param, arg)?;
    }
    state.instruction_stack.push(Instr::PopFrame);
    push_stmts(state, &func.body);
    Ok(())
}

/// Which `StartKind` an `async let` initializer schedules, if any. Other
/// initializers degrade to a synchronous binding.
pub fn async_start_kind(init: &ExprLoc) -> Option<StartKind> {
    match &init.expr {
        Expr::Ai { kind, .. } => Some(StartKind::Ai { kind: *kind }),
        Expr::HostBlock { params, body } => Some(StartKind::HostBlock {
            params: params.clone(),
            body: body.clone(),
        }),
        Expr::Call { name, args } => Some(StartKind::Call {
            name: name.clone(),
            argc: args.len(),
        }),
        _ => None,
    }
}

/// Pops model and prompt and validates them for an LM operation.
fn pop_model_and_prompt(
    state: &mut RunState,
    span: Span,
) -> Result<Result<(ModelDescriptor, String), ErrorDetails>, ErrorDetails> {
    let model = pop_value(state)?;
    let prompt = pop_value(state)?;
    // Errored operands propagate to the binding in evaluation order.
    if let Some(detail) = prompt.error_details().or_else(|| model.error_details()) {
        return Ok(Err(detail.clone()));
    }
    let Payload::Model(descriptor) = model.payload() else {
        return Err(ErrorDetails::value_error(format!(
            "expected a model, got {}",
            model.payload().type_name()
        ))
        .at(state.loc(span)));
    };
    let prompt_text = match prompt.payload() {
        Payload::Null => {
            return Err(ErrorDetails::value_error("prompt must not be null").at(state.loc(span)));
        }
        other => other.display_text(),
    };
    Ok(Ok((descriptor.clone(), prompt_text)))
}

pub fn pending_ai(
    state: &mut RunState,
    kind: AiOpKind,
    expectation: ReturnExpectation,
    span: Span,
) -> Result<(), ErrorDetails> {
    let (model, prompt) = match pop_model_and_prompt(state, span)? {
        Ok(pair) => pair,
        Err(detail) => {
            state.value_stack.push(WrappedValue::as_error(detail));
            return Ok(());
        }
    };
    if let ReturnExpectation::Fields(fields) = &expectation {
        state.pending_destructuring = Some(fields.clone());
    }
    state.pending_ai = Some(AiPending {
        kind,
        prompt,
        model,
        expectation,
        span,
    });
    state.status = Status::AwaitingAi;
    Ok(())
}

pub fn pending_host_block(
    state: &mut RunState,
    params: &[ParamExpr],
    body: String,
    span: Span,
) -> Result<(), ErrorDetails> {
    let mut values = pop_args(state, params.len())?;
    if let Some(errored) = values.iter().find(|v| v.is_errored()) {
        let detail = errored.error_details().expect("errored value has details").clone();
        state.value_stack.push(WrappedValue::as_error(detail));
        return Ok(());
    }
    for value in &mut values {
        value.async_handle = None;
    }
    state.pending_host_block = Some(HostBlockPending {
        params: params.iter().map(|p| p.binding_name().to_owned()).collect(),
        body,
        values,
        span,
    });
    state.status = Status::AwaitingHost;
    Ok(())
}

pub fn pending_imported_host_call(
    state: &mut RunState,
    module: String,
    function: String,
    args: Vec<WrappedValue>,
    span: Span,
) -> Result<(), ErrorDetails> {
    if let Some(errored) = args.iter().find(|v| v.is_errored()) {
        let detail = errored.error_details().expect("errored value has details").clone();
        state.value_stack.push(WrappedValue::as_error(detail));
        return Ok(());
    }
    state.pending_imported_host_call = Some(ImportedHostPending {
        module,
        function,
        args,
        span,
    });
    state.status = Status::AwaitingImportedHost;
    Ok(())
}

pub fn pending_tool(
    state: &mut RunState,
    name: String,
    args: Vec<WrappedValue>,
    span: Span,
) -> Result<(), ErrorDetails> {
    if !system_tool_descriptors().iter().any(|t| t.name == name) {
        return Err(ErrorDetails::scope_error(format!("unknown tool '{name}'")).at(state.loc(span)));
    }
    if let Some(errored) = args.iter().find(|v| v.is_errored()) {
        let detail = errored.error_details().expect("errored value has details").clone();
        state.value_stack.push(WrappedValue::as_error(detail));
        return Ok(());
    }
    state.pending_tool = Some(ToolPending { name, args, span });
    state.status = Status::AwaitingTool;
    Ok(())
}

pub fn pending_compress(state: &mut RunState, span: Span) -> Result<(), ErrorDetails> {
    let model = pop_value(state)?;
    if let Some(detail) = model.error_details() {
        state.value_stack.push(WrappedValue::as_error(detail.clone()));
        return Ok(());
    }
    let Payload::Model(descriptor) = model.payload() else {
        return Err(ErrorDetails::value_error(format!(
            "expected a model, got {}",
            model.payload().type_name()
        ))
        .at(state.loc(span)));
    };
    let prompt = compress_prompt(state);
    state.pending_compress = Some(CompressPending {
        model: descriptor.clone(),
        prompt,
        span,
    });
    state.status = Status::AwaitingCompress;
    Ok(())
}

/// Assembles the loop-scope summary prompt from the innermost loop scope,
/// falling back to the innermost scope when no loop is active.
fn compress_prompt(state: &RunState) -> String {
    let scope = state
        .innermost_loop_scope()
        .or_else(|| state.current_frame().and_then(|f| f.scopes.last()));
    let mut lines: Vec<String> = Vec::new();
    if let Some(scope) = scope {
        let mut names: Vec<&String> = scope.vars.keys().collect();
        names.sort();
        for name in names {
            let value = &scope.vars[name];
            lines.push(format!("{name} = {}", value.payload().display_text()));
        }
    }
    format!(
        "Summarize the following loop state compactly, preserving every fact needed to continue the work:\n{}",
        lines.join("\n")
    )
}

pub fn start_async(
    state: &mut RunState,
    binding: AsyncBinding,
    kind: StartKind,
    expectation: ReturnExpectation,
    span: Span,
) -> Result<(), ErrorDetails> {
    let descriptor = match kind {
        StartKind::Ai { kind } => {
            let (model, prompt) = match pop_model_and_prompt(state, span)? {
                Ok(pair) => pair,
                Err(detail) => {
                    bind_immediate(state, &binding, WrappedValue::as_error(detail), span)?;
                    return Ok(());
                }
            };
            let op_id = state.alloc_op_id();
            StartDescriptor::Ai {
                op_id,
                kind,
                prompt,
                model,
                expectation: expectation.clone(),
                context: crate::ai::context::format_local_context(state),
                span,
            }
        }
        StartKind::HostBlock { params, body } => {
            let mut values = pop_args(state, params.len())?;
            if let Some(errored) = values.iter().find(|v| v.is_errored()) {
                let detail = errored.error_details().expect("errored value has details").clone();
                bind_immediate(state, &binding, WrappedValue::as_error(detail), span)?;
                return Ok(());
            }
            for value in &mut values {
                value.async_handle = None;
            }
            let op_id = state.alloc_op_id();
            StartDescriptor::HostBlock {
                op_id,
                params: params.iter().map(|p| p.binding_name().to_owned()).collect(),
                body,
                values,
                span,
            }
        }
        StartKind::Call { name, argc } => {
            let args = pop_args(state, argc)?;
            let op_id = state.alloc_op_id();
            resolve_async_call(state, op_id, &name, args, span)?
        }
    };

    let op_id = descriptor.op_id();
    state.async_ops.insert(
        op_id,
        AsyncEntry::scheduled(op_id, descriptor.kind(), binding.clone(), expectation),
    );
    state.pending_async_ids.insert(op_id);
    state.pending_async_starts.push(descriptor);

    // Bind the declaring variable(s) to the handle; reads join implicitly.
    match binding {
        AsyncBinding::Single { name, ty } => {
            let mut placeholder = WrappedValue::pending(op_id);
            placeholder.declared_type = ty;
            state.declare(&name, placeholder).map_err(|d| d.at(state.loc(span)))?;
            state.async_var_to_op.insert(name, op_id);
        }
        AsyncBinding::Fields(fields) => {
            for field in fields {
                let mut placeholder = WrappedValue::pending(op_id);
                placeholder.declared_type = Some(field.ty.clone());
                state
                    .declare(&field.name, placeholder)
                    .map_err(|d| d.at(state.loc(span)))?;
                state.async_var_to_op.insert(field.name, op_id);
            }
        }
    }
    Ok(())
}

/// Resolves the callee of an asynchronous call start.
fn resolve_async_call(
    state: &mut RunState,
    op_id: crate::scheduler::OpId,
    name: &str,
    args: Vec<WrappedValue>,
    span: Span,
) -> Result<StartDescriptor, ErrorDetails> {
    let module_path = state.current_frame().and_then(|f| f.module_path.clone());
    if let Some(path) = &module_path
        && state.vibe_modules.get(path).is_some_and(|m| m.functions.contains_key(name))
    {
        return Ok(StartDescriptor::VibeFunction {
            op_id,
            function: name.to_owned(),
            args,
            module_path: Some(path.clone()),
            span,
        });
    }
    if state.functions.contains_key(name) {
        return Ok(StartDescriptor::VibeFunction {
            op_id,
            function: name.to_owned(),
            args,
            module_path: None,
            span,
        });
    }
    if let Some(info) = state.imported_names.get(name).cloned() {
        return match info.kind {
            ImportKind::Vibe => Ok(StartDescriptor::VibeFunction {
                op_id,
                function: info.original_name,
                args,
                module_path: Some(info.source_path),
                span,
            }),
            ImportKind::Host => Ok(StartDescriptor::ImportedHostCall {
                op_id,
                module: info.source_path,
                function: info.original_name,
                args,
                span,
            }),
            ImportKind::System => Err(ErrorDetails::scope_error(format!(
                "system function '{name}' cannot be started asynchronously"
            ))
            .at(state.loc(span))),
        };
    }
    Err(ErrorDetails::undefined(name).at(state.loc(span)))
}

/// Declares an async binding with an immediate (already failed) value.
fn bind_immediate(
    state: &mut RunState,
    binding: &AsyncBinding,
    value: WrappedValue,
    span: Span,
) -> Result<(), ErrorDetails> {
    match binding {
        AsyncBinding::Single { name, .. } => {
            state.declare(name, value).map_err(|d| d.at(state.loc(span)))
        }
        AsyncBinding::Fields(fields) => {
            for field in fields {
                state
                    .declare(&field.name, value.clone())
                    .map_err(|d| d.at(state.loc(span)))?;
            }
            Ok(())
        }
    }
}

/// Natively implemented `system/utils` exports.
fn exec_system_util(name: &str, args: &[WrappedValue]) -> WrappedValue {
    if let Some(errored) = args.iter().find(|v| v.is_errored()) {
        return WrappedValue::as_error(errored.error_details().expect("errored value has details").clone());
    }
    let arg = |i: usize| args.get(i).map(WrappedValue::payload);
    let result = match (name, arg(0)) {
        ("len", Some(Payload::Seq(items))) => Ok(Payload::Int(items.len() as i64)),
        ("len", Some(Payload::Text(s))) => Ok(Payload::Int(s.chars().count() as i64)),
        ("len", Some(Payload::Record(record))) => Ok(Payload::Int(record.len() as i64)),
        ("len", Some(other)) => Err(format!("len does not apply to {}", other.type_name())),
        ("keys", Some(Payload::Record(record))) => {
            Ok(Payload::Seq(record.keys().map(|k| Payload::Text(k.clone())).collect()))
        }
        ("keys", Some(other)) => Err(format!("keys requires a record, got {}", other.type_name())),
        ("values", Some(Payload::Record(record))) => Ok(Payload::Seq(record.values().cloned().collect())),
        ("values", Some(other)) => Err(format!("values requires a record, got {}", other.type_name())),
        ("toJson", Some(payload)) => Ok(Payload::Text(
            serde_json::to_string(&payload.to_json()).unwrap_or_default(),
        )),
        ("fromJson", Some(Payload::Text(s))) => match serde_json::from_str::<serde_json::Value>(s) {
            Ok(parsed) => Ok(Payload::from_json(parsed)),
            Err(e) => Err(format!("invalid JSON: {e}")),
        },
        ("fromJson", Some(other)) => Err(format!("fromJson requires text, got {}", other.type_name())),
        (_, None) => Err(format!("{name} is missing its argument")),
        _ => Err(format!("unknown system util '{name}'")),
    };
    match result {
        Ok(payload) => WrappedValue::wrap(payload, ValueSource::ImportedFunction),
        Err(message) => WrappedValue::as_error(ErrorDetails::value_error(message)),
    }
}
