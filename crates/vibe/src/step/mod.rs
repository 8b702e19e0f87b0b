//! The step engine.
//!
//! A single-threaded cooperative driver over the instruction stack: each
//! step pops one instruction, advances state, and may push further
//! instructions. The engine never blocks — when an instruction needs
//! external service it writes the matching pending slot, flips the status
//! to the matching `awaiting_*` value, and returns to the driver.

mod access;
mod binary;
mod calls;
mod control;

use crate::{
    error::ErrorDetails,
    instruction::{AsyncBinding, Instr, ReturnExpectation},
    io::PrintWriter,
    program::{Expr, ExprLoc, Literal, ParamExpr, PathSeg, Stmt},
    state::{RunState, Status},
    trace::RunTracer,
    value::{Payload, ValueSource, WrappedValue},
};

/// Runs the step engine until the program completes, fails, or suspends on
/// a pending operation. Fatal errors land in `state.error_object` with
/// `Status::Error`; the engine itself never panics on script input.
pub fn run_until_pause(state: &mut RunState, print: &mut impl PrintWriter, tracer: &mut impl RunTracer) {
    while state.status == Status::Running {
        let Some(instr) = state.instruction_stack.pop() else {
            // Block boundary: leaving the top level with unjoined async
            // work awaits all of it before the run can complete.
            if state.pending_async_ids.is_empty() {
                state.status = Status::Completed;
            } else {
                let mut ids: Vec<_> = state.pending_async_ids.iter().copied().collect();
                ids.sort_by_key(|id| id.raw());
                state.awaiting_async_ids = ids;
                state.status = Status::AwaitingAsync;
            }
            return;
        };
        tracer.on_instruction(instr.kind_name(), state.call_depth());
        if let Err(detail) = step(state, instr, print, tracer) {
            state.fail(detail);
        }
    }
}

/// Executes one instruction.
fn step(
    state: &mut RunState,
    instr: Instr,
    print: &mut impl PrintWriter,
    tracer: &mut impl RunTracer,
) -> Result<(), ErrorDetails> {
    match instr {
        Instr::Eval(expr) => eval(state, expr),
        Instr::DeclareVar {
            name,
            ty,
            is_const,
            is_private,
            span,
        } => control::declare_var(state, &name, ty, is_const, is_private, span),
        Instr::DeclareDestructure { fields, span } => control::declare_destructure(state, &fields, span),
        Instr::Assign { target, span } => control::assign(state, &target, span),
        Instr::BinaryOp { op, span } => {
            let rhs = pop_value(state)?;
            let lhs = pop_value(state)?;
            let result = binary::apply_binary(op, &lhs, &rhs, state.loc(span));
            state.value_stack.push(result);
            Ok(())
        }
        Instr::UnaryOp { op, span } => {
            let operand = pop_value(state)?;
            let result = binary::apply_unary(op, &operand, state.loc(span));
            state.value_stack.push(result);
            Ok(())
        }
        Instr::MemberAccess { field, span } => access::member_access(state, &field, span),
        Instr::IndexAccess { span } => access::index_access(state, span),
        Instr::SliceOp {
            has_start,
            has_end,
            span,
        } => access::slice_op(state, has_start, has_end, span),
        Instr::MakeRange { span } => access::make_range(state, span),
        Instr::MakeRecord { fields, span } => access::make_record(state, &fields, span),
        Instr::MakeSeq { len, span } => access::make_seq(state, len, span),
        Instr::Interpolate { template, span } => access::interpolate(state, &template, span),
        Instr::Call { name, argc, span } => calls::call(state, &name, argc, span, print, tracer),
        Instr::Return { has_value, span } => control::return_(state, has_value, span, tracer),
        Instr::IfBranch {
            then_body,
            else_body,
            span,
        } => control::if_branch(state, then_body, else_body, span),
        Instr::BeginLoop { var, body, span } => control::begin_loop(state, var, body, span),
        Instr::LoopIter {
            var,
            items,
            index,
            body,
            span,
        } => control::loop_iter(state, var, items, index, body, span),
        Instr::EnterBlock { is_loop } => {
            state.enter_scope(is_loop);
            Ok(())
        }
        Instr::ExitBlock => {
            state.exit_scope();
            Ok(())
        }
        Instr::PopFrame => control::pop_frame(state, tracer),
        Instr::PendingAi { kind, expectation, span } => calls::pending_ai(state, kind, expectation, span),
        Instr::PendingHostBlock { params, body, span } => calls::pending_host_block(state, &params, body, span),
        Instr::PendingImportedHostCall {
            module,
            function,
            args,
            span,
        } => calls::pending_imported_host_call(state, module, function, args, span),
        Instr::PendingTool { name, args, span } => calls::pending_tool(state, name, args, span),
        Instr::PendingCompress { span } => calls::pending_compress(state, span),
        Instr::StartAsync {
            binding,
            kind,
            expectation,
            span,
        } => calls::start_async(state, binding, kind, expectation, span),
        Instr::AwaitAsyncSet { op_ids } => {
            for id in op_ids {
                if !state.awaiting_async_ids.contains(&id) {
                    state.awaiting_async_ids.push(id);
                }
            }
            state.status = Status::AwaitingAsync;
            Ok(())
        }
        Instr::Throw { span } => control::throw(state, span, tracer),
        Instr::Discard => {
            let value = pop_value(state)?;
            state.last_result = value;
            Ok(())
        }
    }
}

/// Enters a user-defined function frame with bound arguments, compiling its
/// body onto the instruction stack. Used by the driver for isolated async
/// invocations.
pub(crate) fn enter_function(
    state: &mut RunState,
    func: &crate::program::FunctionDef,
    args: Vec<WrappedValue>,
    module_path: Option<String>,
    tracer: &mut impl RunTracer,
) -> Result<(), ErrorDetails> {
    calls::push_function_frame(state, func, args, module_path, func.span, tracer)
}

/// Pops the operand-stack top; an empty stack is an engine bug.
pub(crate) fn pop_value(state: &mut RunState) -> Result<WrappedValue, ErrorDetails> {
    state
        .value_stack
        .pop()
        .ok_or_else(|| ErrorDetails::internal("operand stack underflow"))
}

/// Compiles the statements onto the instruction stack, first statement on
/// top.
pub fn push_stmts(state: &mut RunState, stmts: &[Stmt]) {
    for stmt in stmts.iter().rev() {
        push_stmt(state, stmt);
    }
}

fn push_stmt(state: &mut RunState, stmt: &Stmt) {
    match stmt {
        Stmt::Let {
            name,
            ty,
            init,
            is_const,
            is_private,
            is_async,
        } => {
            if *is_async && let Some(kind) = calls::async_start_kind(init) {
                let expectation = ty
                    .clone()
                    .map_or(ReturnExpectation::Untyped, ReturnExpectation::Single);
                state.instruction_stack.push(Instr::StartAsync {
                    binding: AsyncBinding::Single {
                        name: name.clone(),
                        ty: ty.clone(),
                    },
                    kind,
                    expectation,
                    span: init.span,
                });
                push_async_operands(state, init);
                return;
            }
            state.instruction_stack.push(Instr::DeclareVar {
                name: name.clone(),
                ty: ty.clone(),
                is_const: *is_const,
                is_private: *is_private,
                span: init.span,
            });
            push_typed_init(state, init, ty.clone().map_or(ReturnExpectation::Untyped, ReturnExpectation::Single));
        }
        Stmt::LetDestructure { fields, init, is_async } => {
            let expectation = ReturnExpectation::Fields(fields.clone());
            if *is_async && let Some(kind) = calls::async_start_kind(init) {
                state.instruction_stack.push(Instr::StartAsync {
                    binding: AsyncBinding::Fields(fields.clone()),
                    kind,
                    expectation,
                    span: init.span,
                });
                push_async_operands(state, init);
                return;
            }
            state.instruction_stack.push(Instr::DeclareDestructure {
                fields: fields.clone(),
                span: init.span,
            });
            push_typed_init(state, init, expectation);
        }
        Stmt::Assign { target, value } => {
            state.instruction_stack.push(Instr::Assign {
                target: target.clone(),
                span: value.span,
            });
            push_typed_init(state, value, ReturnExpectation::Untyped);
        }
        Stmt::Expr(expr) => {
            state.instruction_stack.push(Instr::Discard);
            push_expr(state, expr);
        }
        Stmt::If {
            cond,
            then_body,
            else_body,
        } => {
            state.instruction_stack.push(Instr::IfBranch {
                then_body: then_body.clone(),
                else_body: else_body.clone(),
                span: cond.span,
            });
            push_expr(state, cond);
        }
        Stmt::For { var, iterable, body } => {
            state.instruction_stack.push(Instr::BeginLoop {
                var: var.clone(),
                body: body.clone(),
                span: iterable.span,
            });
            push_expr(state, iterable);
        }
        Stmt::Return { value, span } => {
            state.instruction_stack.push(Instr::Return {
                has_value: value.is_some(),
                span: *span,
            });
            if let Some(value) = value {
                push_expr(state, value);
            }
        }
        Stmt::Throw { message, span } => {
            state.instruction_stack.push(Instr::Throw { span: *span });
            push_expr(state, message);
        }
    }
}

/// Pushes an initializer that may carry a typed-return expectation into its
/// LM operation. Non-LM initializers compile as plain expressions.
fn push_typed_init(state: &mut RunState, init: &ExprLoc, expectation: ReturnExpectation) {
    match &init.expr {
        Expr::Ai { kind, prompt, model } => {
            state.instruction_stack.push(Instr::PendingAi {
                kind: *kind,
                expectation,
                span: init.span,
            });
            push_expr(state, model);
            push_expr(state, prompt);
        }
        Expr::Compress { model } => {
            state.instruction_stack.push(Instr::PendingCompress { span: init.span });
            push_expr(state, model);
        }
        _ => push_expr(state, init),
    }
}

/// Pushes the synchronous operand evaluations of an `async let`
/// initializer; the `StartAsync` above them pops the results.
fn push_async_operands(state: &mut RunState, init: &ExprLoc) {
    match &init.expr {
        Expr::Ai { prompt, model, .. } => {
            push_expr(state, model);
            push_expr(state, prompt);
        }
        Expr::HostBlock { params, .. } => {
            for param in params.iter().rev() {
                push_param_expr(state, param, init.span);
            }
        }
        Expr::Call { args, .. } => {
            for arg in args.iter().rev() {
                push_expr(state, arg);
            }
        }
        _ => unreachable!("async_start_kind gated the initializer"),
    }
}

/// Compiles one expression onto the instruction stack.
pub(crate) fn push_expr(state: &mut RunState, expr: &ExprLoc) {
    let span = expr.span;
    match &expr.expr {
        Expr::Literal(_) => {
            state.instruction_stack.push(Instr::Eval(expr.clone()));
        }
        Expr::Template(template) => {
            state.instruction_stack.push(Instr::Interpolate {
                template: template.clone(),
                span,
            });
        }
        Expr::Var(_)
        | Expr::Ai { .. }
        | Expr::HostBlock { .. }
        | Expr::Compress { .. } => {
            state.instruction_stack.push(Instr::Eval(expr.clone()));
        }
        Expr::Record(fields) => {
            state.instruction_stack.push(Instr::MakeRecord {
                fields: fields.iter().map(|(name, _)| name.clone()).collect(),
                span,
            });
            for (_, value) in fields.iter().rev() {
                push_expr(state, value);
            }
        }
        Expr::Seq(items) => {
            state.instruction_stack.push(Instr::MakeSeq { len: items.len(), span });
            for item in items.iter().rev() {
                push_expr(state, item);
            }
        }
        Expr::Unary { op, operand } => {
            state.instruction_stack.push(Instr::UnaryOp { op: *op, span });
            push_expr(state, operand);
        }
        Expr::Binary { op, lhs, rhs } => {
            state.instruction_stack.push(Instr::BinaryOp { op: *op, span });
            push_expr(state, rhs);
            push_expr(state, lhs);
        }
        Expr::Member { base, field } => {
            state.instruction_stack.push(Instr::MemberAccess {
                field: field.clone(),
                span,
            });
            push_expr(state, base);
        }
        Expr::Index { base, index } => {
            state.instruction_stack.push(Instr::IndexAccess { span });
            push_expr(state, index);
            push_expr(state, base);
        }
        Expr::SliceOf { base, start, end } => {
            state.instruction_stack.push(Instr::SliceOp {
                has_start: start.is_some(),
                has_end: end.is_some(),
                span,
            });
            if let Some(end) = end {
                push_expr(state, end);
            }
            if let Some(start) = start {
                push_expr(state, start);
            }
            push_expr(state, base);
        }
        Expr::Range { start, end } => {
            state.instruction_stack.push(Instr::MakeRange { span });
            push_expr(state, end);
            push_expr(state, start);
        }
        Expr::Call { name, args } => {
            state.instruction_stack.push(Instr::Call {
                name: name.clone(),
                argc: args.len(),
                span,
            });
            for arg in args.iter().rev() {
                push_expr(state, arg);
            }
        }
    }
}

/// Evaluates the expression forms that need runtime state. Structural forms
/// were already decomposed by [`push_expr`].
fn eval(state: &mut RunState, expr: ExprLoc) -> Result<(), ErrorDetails> {
    let span = expr.span;
    match expr.expr {
        Expr::Literal(ref literal) => {
            let payload = match literal {
                Literal::Null => Payload::Null,
                Literal::Int(i) => Payload::Int(*i),
                Literal::Float(f) => Payload::Float(*f),
                Literal::Bool(b) => Payload::Bool(*b),
                Literal::Text(s) => Payload::Text(s.clone()),
            };
            state.value_stack.push(WrappedValue::wrap(payload, ValueSource::Literal));
            Ok(())
        }
        Expr::Var(ref name) => {
            let Some(value) = state.lookup(name) else {
                if state.functions.contains_key(name.as_str()) {
                    return Err(ErrorDetails::scope_error(format!("'{name}' is a function, not a value"))
                        .at(state.loc(span)));
                }
                return Err(ErrorDetails::undefined(name).at(state.loc(span)));
            };
            let pending = value.async_handle;
            let value = value.clone();
            // Reading a pending value triggers the implicit join: await the
            // handle, then re-evaluate the read.
            if let Some(op_id) = pending {
                state.instruction_stack.push(Instr::Eval(expr.clone()));
                state.instruction_stack.push(Instr::AwaitAsyncSet { op_ids: vec![op_id] });
                return Ok(());
            }
            state.value_stack.push(value);
            Ok(())
        }
        Expr::Ai { kind, prompt, model } => {
            // An LM call in plain expression position has no declared
            // binding, so it expects an untyped response.
            state.instruction_stack.push(Instr::PendingAi {
                kind,
                expectation: ReturnExpectation::Untyped,
                span,
            });
            push_expr(state, &model);
            push_expr(state, &prompt);
            Ok(())
        }
        Expr::HostBlock { params, body } => {
            state.instruction_stack.push(Instr::PendingHostBlock {
                params: params.clone(),
                body,
                span,
            });
            for param in params.iter().rev() {
                push_param_expr(state, param, span);
            }
            Ok(())
        }
        Expr::Compress { model } => {
            state.instruction_stack.push(Instr::PendingCompress { span });
            push_expr(state, &model);
            Ok(())
        }
        other => Err(ErrorDetails::internal(format!(
            "expression reached eval without decomposition: {other:?}"
        ))),
    }
}

/// Compiles a restricted host-block parameter expression: the root
/// identifier followed by member / index / slice segments.
fn push_param_expr(state: &mut RunState, param: &ParamExpr, span: crate::program::Span) {
    let mut expr = Expr::var(param.root.clone()).at(span.line, span.column);
    for seg in &param.path {
        expr = match seg {
            PathSeg::Field(field) => Expr::member(expr, field.clone()).at(span.line, span.column),
            PathSeg::Index(i) => Expr::Index {
                base: Box::new(expr),
                index: Box::new(Expr::int(*i).at(span.line, span.column)),
            }
            .at(span.line, span.column),
            PathSeg::Slice(start, end) => Expr::SliceOf {
                base: Box::new(expr),
                start: start.map(|s| Box::new(Expr::int(s).at(span.line, span.column))),
                end: end.map(|e| Box::new(Expr::int(e).at(span.line, span.column))),
            }
            .at(span.line, span.column),
        };
    }
    push_expr(state, &expr);
}
