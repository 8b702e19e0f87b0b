//! Suspendable execution runtime for the Vibe scripting language.
//!
//! Vibe interleaves ordinary imperative code with calls to language-model
//! providers, embedded host-language blocks, and tool-augmented LM
//! conversations. This crate is the execution core: a step-based
//! interpreter over a pre-parsed program tree that suspends whenever an
//! externally serviced operation is required, a cooperative scheduler for
//! fire-and-forget asynchronous starts with implicit joins, the LM
//! interaction engine, and the wrapped-value model through which failures
//! propagate as first-class values.
//!
//! Parsing, host-language evaluation, provider wire encoders, and tools
//! are external collaborators consumed through the capability traits in
//! [`host`] and [`ai::provider`].
#![expect(clippy::cast_possible_truncation, reason = "numeric narrowing is checked")]
#![expect(clippy::cast_possible_wrap, reason = "length casts stay in i64 range")]

pub mod ai;
mod builtins;
mod driver;
mod error;
pub mod host;
mod imports;
mod instruction;
mod io;
mod program;
mod scheduler;
mod state;
mod step;
pub mod trace;
mod value;

pub use crate::{
    ai::{
        AiConfig, AiOutcome, execute_interaction,
        provider::{ProviderError, ProviderExecutor, ProviderKind, ProviderRegistry, provider_kind},
        request::{
            AiInteraction, AiRequest, AiResponse, ContextChunk, OperationKind, StopReason, TokenUsage,
            ToolCallRequest, ToolOutcome,
        },
        tool_loop::{RETURN_FIELD_TOOL, init_return_tools, reset_return_tools},
    },
    builtins::{ArgSpec, ArgsRegistry, Builtin},
    driver::{Driver, DriverConfig, RunOutcome},
    error::{AiLogContext, ErrorDetails, ErrorKind, RunFailure, SourceLoc},
    host::{
        FnTool, HostBlockEvaluator, HostFailure, HostModuleLoader, Parser, StaticUserInput, ToolCallable,
        ToolContext, ToolRegistry, UserInput, system_tool_descriptors,
    },
    imports::{FsModuleSource, MapModuleSource, ModuleSource, load_imports, normalize_path},
    instruction::{AsyncBinding, Instr, ReturnExpectation, StartKind},
    io::{CollectStringPrint, NoPrint, PrintWriter, StdPrint},
    program::{
        AiOpKind, AssignTarget, BinaryOp, DestructureField, Expr, ExprLoc, FunctionDef, ImportDecl, ImportKind,
        ImportedName, Literal, ParamExpr, PathSeg, Program, Span, Stmt, UnaryOp,
    },
    scheduler::{AsyncEntry, AsyncKind, AsyncStatus, OpId, StartDescriptor},
    state::{Frame, HostModule, RunOptions, RunState, Scope, Status, VibeModule},
    step::run_until_pause,
    trace::{IdCounters, NoopTracer, RecordingTracer, RunTracer, StderrTracer, TraceEvent, TraceRecord},
    value::{
        DeclaredType, ModelDescriptor, NoTypes, Payload, StructuralType, ToolDescriptor, TypeLookup, ValueData,
        ValueSource, WrappedValue, infer_declared_type, propagate_errors, validate_and_coerce,
    },
};
