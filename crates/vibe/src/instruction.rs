//! The closed instruction union consumed by the step engine.
//!
//! Instructions are tagged records produced from the program tree; each
//! describes one unit of work. The engine pops one instruction per step and
//! may push further instructions (evaluating a binary operator pushes the
//! operand evaluations, then the combine). Instructions own their operands,
//! so a suspended instruction stack serializes with the rest of the state.

use serde::{Deserialize, Serialize};

use crate::{
    program::{AiOpKind, AssignTarget, BinaryOp, DestructureField, ExprLoc, ParamExpr, Span, Stmt, UnaryOp},
    scheduler::OpId,
    value::{DeclaredType, Payload, WrappedValue},
};

/// What shape of value an LM operation is expected to deliver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReturnExpectation {
    /// Plain text response; no return tool required.
    Untyped,
    /// A single typed value, delivered through the return tool as `value`.
    Single(DeclaredType),
    /// A multi-field destructuring, one return-tool call per field.
    Fields(Vec<DestructureField>),
}

impl ReturnExpectation {
    /// Whether the interaction must go through the structured-return tool.
    #[must_use]
    pub fn requires_return_tool(&self) -> bool {
        !matches!(self, Self::Untyped)
    }
}

/// How a scheduled asynchronous start binds its eventual result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AsyncBinding {
    Single {
        name: String,
        ty: Option<DeclaredType>,
    },
    Fields(Vec<DestructureField>),
}

/// The operation an `async let` schedules. Operands are evaluated
/// synchronously before the start is recorded; only the external work is
/// deferred.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StartKind {
    /// `async let x = do/vibe "prompt" model` — pops model and prompt.
    Ai { kind: AiOpKind },
    /// An embedded host block — pops one value per parameter.
    HostBlock { params: Vec<ParamExpr>, body: String },
    /// A function call — pops `argc` arguments; resolution decides whether
    /// it becomes an isolated script-function run or a host-module call.
    Call { name: String, argc: usize },
}

/// One unit of work for the step engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instr {
    /// Evaluate an expression; the result lands on the value stack.
    Eval(ExprLoc),
    /// Pop a value and bind it as a new variable in the current scope.
    DeclareVar {
        name: String,
        ty: Option<DeclaredType>,
        is_const: bool,
        is_private: bool,
        span: Span,
    },
    /// Pop a record and bind each declared field as its own variable.
    DeclareDestructure { fields: Vec<DestructureField>, span: Span },
    /// Pop a value and store it into an existing binding.
    Assign { target: AssignTarget, span: Span },
    /// Pop rhs then lhs, combine.
    BinaryOp { op: BinaryOp, span: Span },
    UnaryOp { op: UnaryOp, span: Span },
    /// Pop a value, push the named member.
    MemberAccess { field: String, span: Span },
    /// Pop index then base, push the element.
    IndexAccess { span: Span },
    /// Pop end (if present), start (if present), then base; push the slice.
    SliceOp {
        has_start: bool,
        has_end: bool,
        span: Span,
    },
    /// Pop end then start, push an inclusive range payload.
    MakeRange { span: Span },
    /// Pop one value per field (last field on top), push a record.
    MakeRecord { fields: Vec<String>, span: Span },
    /// Pop `len` values (last element on top), push a sequence.
    MakeSeq { len: usize, span: Span },
    /// Expand `{name}` placeholders by scope lookup.
    Interpolate { template: String, span: Span },
    /// Pop `argc` arguments and dispatch the named callable.
    Call { name: String, argc: usize, span: Span },
    /// Pop the return value (when present), unwind to the frame boundary.
    Return { has_value: bool, span: Span },
    /// Pop a strict-boolean condition and enter one arm.
    IfBranch {
        then_body: Vec<Stmt>,
        else_body: Vec<Stmt>,
        span: Span,
    },
    /// Pop the evaluated iterable and begin a `for` loop over it.
    BeginLoop {
        var: String,
        body: Vec<Stmt>,
        span: Span,
    },
    /// Advance a loop by one iteration: bind the variable, run the body,
    /// then re-queue itself.
    LoopIter {
        var: String,
        items: Vec<Payload>,
        index: usize,
        body: Vec<Stmt>,
        span: Span,
    },
    /// Push a lexical scope.
    EnterBlock { is_loop: bool },
    /// Pop the innermost lexical scope.
    ExitBlock,
    /// Pop the current activation frame; pushes the implicit null return if
    /// no `return` ran.
    PopFrame,
    /// Pop model then prompt, write the AI pending slot, suspend.
    PendingAi {
        kind: AiOpKind,
        expectation: ReturnExpectation,
        span: Span,
    },
    /// Pop one value per parameter, write the host-block pending slot, suspend.
    PendingHostBlock {
        params: Vec<ParamExpr>,
        body: String,
        span: Span,
    },
    /// Write the imported-host-call pending slot, suspend.
    PendingImportedHostCall {
        module: String,
        function: String,
        args: Vec<WrappedValue>,
        span: Span,
    },
    /// Write the tool pending slot, suspend.
    PendingTool {
        name: String,
        args: Vec<WrappedValue>,
        span: Span,
    },
    /// Pop a model, write the compress pending slot, suspend.
    PendingCompress { span: Span },
    /// Record an asynchronous start and bind the declaring variable(s) to
    /// its handle. Pops the operands its `kind` names.
    StartAsync {
        binding: AsyncBinding,
        kind: StartKind,
        expectation: ReturnExpectation,
        span: Span,
    },
    /// Append the listed operations to the awaiting frontier and suspend.
    AwaitAsyncSet { op_ids: Vec<OpId> },
    /// Pop a message, unwind to the frame boundary with an errored value.
    Throw { span: Span },
    /// Pop and drop the value-stack top (expression statements).
    Discard,
}

impl Instr {
    /// Stable kind name, used by tracers.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Eval(_) => "eval",
            Self::DeclareVar { .. } => "declare_var",
            Self::DeclareDestructure { .. } => "declare_destructure",
            Self::Assign { .. } => "assign",
            Self::BinaryOp { .. } => "binary_op",
            Self::UnaryOp { .. } => "unary_op",
            Self::MemberAccess { .. } => "member_access",
            Self::IndexAccess { .. } => "index_access",
            Self::SliceOp { .. } => "slice",
            Self::MakeRange { .. } => "make_range",
            Self::MakeRecord { .. } => "make_record",
            Self::MakeSeq { .. } => "make_seq",
            Self::Interpolate { .. } => "interpolate",
            Self::Call { .. } => "call",
            Self::Return { .. } => "return",
            Self::IfBranch { .. } => "if_branch",
            Self::BeginLoop { .. } => "begin_loop",
            Self::LoopIter { .. } => "loop_iter",
            Self::EnterBlock { .. } => "enter_block",
            Self::ExitBlock => "exit_block",
            Self::PopFrame => "pop_frame",
            Self::PendingAi { .. } => "pending_ai",
            Self::PendingHostBlock { .. } => "pending_host_block",
            Self::PendingImportedHostCall { .. } => "pending_imported_host_call",
            Self::PendingTool { .. } => "pending_tool",
            Self::PendingCompress { .. } => "pending_compress",
            Self::StartAsync { .. } => "start_async",
            Self::AwaitAsyncSet { .. } => "await_async_set",
            Self::Throw { .. } => "throw",
            Self::Discard => "discard",
        }
    }
}
