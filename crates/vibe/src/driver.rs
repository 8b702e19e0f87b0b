//! The driver loop.
//!
//! Owns overall execution: repeatedly runs the step engine until a pending
//! operation appears, services it through the matching capability (LM
//! provider, host evaluator, host module, tool executor, user input), and
//! resumes. Between step bursts it drains scheduled asynchronous starts
//! into live futures and performs joins through the scheduler pool.

use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;

use crate::{
    ai::{
        self, AiConfig,
        provider::ProviderRegistry,
        request::OperationKind,
    },
    error::{ErrorDetails, RunFailure, SourceLoc},
    host::{HostBlockEvaluator, HostFailure, HostModuleLoader, Parser, StaticUserInput, ToolContext, ToolRegistry, UserInput},
    imports::{FsModuleSource, ModuleSource, load_imports},
    instruction::ReturnExpectation,
    io::{PrintWriter, StdPrint},
    program::{FunctionDef, Program},
    scheduler::{InFlightOp, OpPool, StartDescriptor},
    state::{RunOptions, RunState, Status},
    step::{enter_function, run_until_pause},
    trace::{NoopTracer, RunTracer, TraceEvent},
    value::{DeclaredType, Payload, ValueSource, WrappedValue},
};

/// Driver configuration.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub root_dir: std::path::PathBuf,
    /// Bound on simultaneously running async operations.
    pub max_parallel: usize,
    /// Arguments exposed to the program through `args()` / `defineArg`.
    pub program_args: Vec<String>,
    pub ai: AiConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            root_dir: std::path::PathBuf::from("."),
            max_parallel: 4,
            program_args: Vec::new(),
            ai: AiConfig::default(),
        }
    }
}

/// Outcome of a completed run: the final value plus the final state, which
/// carries the AI interaction log.
#[derive(Debug)]
pub struct RunOutcome {
    pub value: WrappedValue,
    pub state: RunState,
}

/// The execution driver. Cheap to clone — capabilities are shared.
#[derive(Clone)]
pub struct Driver {
    parser: Arc<dyn Parser>,
    host_eval: Arc<dyn HostBlockEvaluator>,
    host_loader: Arc<dyn HostModuleLoader>,
    module_source: Arc<dyn ModuleSource>,
    providers: ProviderRegistry,
    tools: ToolRegistry,
    user_input: Arc<dyn UserInput>,
    config: DriverConfig,
}

impl Default for Driver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver {
    /// A driver with stub capabilities: running a program that needs a
    /// capability the embedder never supplied fails with a clear message.
    #[must_use]
    pub fn new() -> Self {
        Self {
            parser: Arc::new(UnsupportedParser),
            host_eval: Arc::new(UnsupportedHostEval),
            host_loader: Arc::new(UnsupportedHostModules),
            module_source: Arc::new(FsModuleSource),
            providers: ProviderRegistry::new(),
            tools: ToolRegistry::new(),
            user_input: Arc::new(StaticUserInput(String::new())),
            config: DriverConfig::default(),
        }
    }

    #[must_use]
    pub fn with_parser(mut self, parser: Arc<dyn Parser>) -> Self {
        self.parser = parser;
        self
    }

    #[must_use]
    pub fn with_host_evaluator(mut self, host_eval: Arc<dyn HostBlockEvaluator>) -> Self {
        self.host_eval = host_eval;
        self
    }

    #[must_use]
    pub fn with_host_modules(mut self, host_loader: Arc<dyn HostModuleLoader>) -> Self {
        self.host_loader = host_loader;
        self
    }

    #[must_use]
    pub fn with_module_source(mut self, module_source: Arc<dyn ModuleSource>) -> Self {
        self.module_source = module_source;
        self
    }

    #[must_use]
    pub fn with_providers(mut self, providers: ProviderRegistry) -> Self {
        self.providers = providers;
        self
    }

    #[must_use]
    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    #[must_use]
    pub fn with_user_input(mut self, user_input: Arc<dyn UserInput>) -> Self {
        self.user_input = user_input;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: DriverConfig) -> Self {
        self.config = config;
        self
    }

    /// Runs a program to completion.
    pub async fn run(
        &self,
        program: &Program,
        print: &mut impl PrintWriter,
        tracer: &mut impl RunTracer,
    ) -> Result<RunOutcome, RunFailure> {
        let options = RunOptions {
            root_dir: self.config.root_dir.clone(),
            max_parallel: self.config.max_parallel,
            program_args: self.config.program_args.clone(),
        };
        let mut state = RunState::create_initial_state(program, options);
        load_imports(
            &mut state,
            program,
            self.parser.as_ref(),
            self.host_loader.as_ref(),
            self.module_source.as_ref(),
        )?;

        let run_id = uuid::Uuid::new_v4().to_string();
        tracer.on_event(TraceEvent::RunStart {
            run_id: run_id.clone(),
            file: state.file.clone(),
        });

        let state = self.drive(state, print, tracer).await;

        let ok = state.status == Status::Completed;
        tracer.on_event(TraceEvent::RunComplete { run_id, ok });

        if ok {
            Ok(RunOutcome {
                value: state.last_result.clone(),
                state,
            })
        } else {
            let detail = state
                .error_object
                .clone()
                .unwrap_or_else(|| ErrorDetails::internal("run ended in error state without detail"));
            Err(RunFailure::from(detail))
        }
    }

    /// The burst/service loop shared by top-level runs and isolated async
    /// invocations. On fatal failure the in-flight pool is dropped,
    /// abandoning the remaining operations.
    async fn drive(
        &self,
        mut state: RunState,
        print: &mut impl PrintWriter,
        tracer: &mut impl RunTracer,
    ) -> RunState {
        let mut pool = OpPool::new();
        loop {
            run_until_pause(&mut state, print, tracer);
            self.drain_starts(&mut state, &mut pool);
            match state.status {
                Status::Running => {}
                Status::Completed | Status::Error => return state,
                Status::AwaitingAi => state = self.service_ai(state, tracer).await,
                Status::AwaitingHost => state = self.service_host_block(state, tracer).await,
                Status::AwaitingImportedHost => state = self.service_imported_host(state, tracer).await,
                Status::AwaitingTool => state = self.service_tool(state, tracer).await,
                Status::AwaitingCompress => state = self.service_compress(state, tracer).await,
                Status::AwaitingUser => state = self.service_user(state).await,
                Status::AwaitingAsync => {
                    let wanted = state.awaiting_async_ids.clone();
                    pool.resolve_set(&mut state, &wanted).await;
                    let all_terminal = wanted
                        .iter()
                        .all(|id| state.async_ops.get(id).is_none_or(|e| e.is_terminal()));
                    if all_terminal {
                        state = state.resume_with_async_results();
                    } else {
                        state.fail(ErrorDetails::internal(
                            "awaited async operation was never started",
                        ));
                    }
                }
            }
        }
    }

    /// Converts scheduled starts into live futures. Log ids are allocated
    /// here, while the state is still at hand.
    fn drain_starts(&self, state: &mut RunState, pool: &mut OpPool) {
        for descriptor in std::mem::take(&mut state.pending_async_starts) {
            let op_id = descriptor.op_id();
            let future = self.start_future(state, descriptor);
            pool.push(InFlightOp { op_id, future });
        }
    }

    fn start_future(
        &self,
        state: &mut RunState,
        descriptor: StartDescriptor,
    ) -> BoxFuture<'static, Result<WrappedValue, ErrorDetails>> {
        let file = state.file.clone();
        match descriptor {
            StartDescriptor::Ai {
                kind,
                prompt,
                model,
                expectation,
                context,
                span,
                ..
            } => {
                let operation = OperationKind::from(kind);
                let id = state.id_counters.next_ai_id(operation);
                let providers = self.providers.clone();
                let tools = self.tools.clone();
                let config = self.config.ai.clone();
                let types = state.type_defs.clone();
                let tool_ctx = ToolContext {
                    root_dir: state.root_dir.clone(),
                };
                let loc = SourceLoc::new(file, span.line, span.column);
                Box::pin(async move {
                    let provider = providers.select(&model).map_err(|d| d.at(loc.clone()))?;
                    let outcome = ai::execute_interaction(
                        provider.as_ref(),
                        operation,
                        &model,
                        &prompt,
                        context,
                        &expectation,
                        &types,
                        &tools,
                        &tool_ctx,
                        &config,
                        id,
                    )
                    .await
                    // Typed-return validation cannot stop a program from
                    // inside a wave; it fails this operation instead.
                    .map_err(|d| d.at(loc))?;
                    Ok(outcome.value)
                })
            }
            StartDescriptor::HostBlock {
                params,
                body,
                values,
                span,
                ..
            } => {
                let host_eval = Arc::clone(&self.host_eval);
                let loc = SourceLoc::new(file, span.line, span.column);
                let json_values: Vec<serde_json::Value> = values.iter().map(|v| v.payload().to_json()).collect();
                Box::pin(async move {
                    match host_eval.eval_host_block(&params, &body, json_values, &loc).await {
                        Ok(result) => Ok(WrappedValue::wrap(Payload::from_json(result), ValueSource::HostBlock)),
                        Err(failure) => Err(failure.into_details(loc)),
                    }
                })
            }
            StartDescriptor::ImportedHostCall {
                module,
                function,
                args,
                span,
                ..
            } => {
                let host_loader = Arc::clone(&self.host_loader);
                let loc = SourceLoc::new(file, span.line, span.column);
                let json_args: Vec<serde_json::Value> = args.iter().map(|v| v.payload().to_json()).collect();
                Box::pin(async move {
                    match host_loader.invoke(&module, &function, json_args).await {
                        Ok(result) => Ok(WrappedValue::wrap(
                            Payload::from_json(result),
                            ValueSource::ImportedFunction,
                        )),
                        Err(failure) => Err(failure.into_details(loc)),
                    }
                })
            }
            StartDescriptor::VibeFunction {
                function,
                args,
                module_path,
                span,
                ..
            } => {
                let loc = SourceLoc::new(file, span.line, span.column);
                let func = match &module_path {
                    Some(path) => state
                        .vibe_modules
                        .get(path)
                        .and_then(|m| m.functions.get(&function))
                        .cloned(),
                    None => state.functions.get(&function).cloned(),
                };
                let Some(func) = func else {
                    return Box::pin(async move {
                        Err(ErrorDetails::scope_error(format!("'{function}' is not a function")).at(loc))
                    });
                };
                let driver = self.clone();
                let isolated = state.clone_for_isolation();
                driver.run_isolated(isolated, func, args, module_path, loc)
            }
        }
    }

    /// Runs a user-defined function body against an isolated state clone.
    /// Only the final value escapes; local mutations are discarded with the
    /// clone. Output from the isolated body goes straight to stdout.
    fn run_isolated(
        self,
        mut state: RunState,
        func: FunctionDef,
        args: Vec<WrappedValue>,
        module_path: Option<String>,
        loc: SourceLoc,
    ) -> BoxFuture<'static, Result<WrappedValue, ErrorDetails>> {
        Box::pin(async move {
            let mut tracer = NoopTracer;
            enter_function(&mut state, &func, args, module_path, &mut tracer).map_err(|d| d.or_at(&loc))?;
            let mut print = StdPrint::default();
            let state = self.drive(state, &mut print, &mut tracer).await;
            match state.status {
                Status::Completed => Ok(state.last_result.clone().with_source(ValueSource::VibeFunction)),
                Status::Error => Err(state
                    .error_object
                    .unwrap_or_else(|| ErrorDetails::internal("isolated run failed without detail"))),
                other => Err(ErrorDetails::internal(format!(
                    "isolated run stopped in unexpected status {other}"
                ))),
            }
        })
    }

    async fn service_ai(&self, mut state: RunState, tracer: &mut impl RunTracer) -> RunState {
        let Some(pending) = state.pending_ai.clone() else {
            state.fail(ErrorDetails::internal("awaiting_ai without a pending descriptor"));
            return state;
        };
        let operation = OperationKind::from(pending.kind);
        let id = state.id_counters.next_ai_id(operation);
        tracer.on_event(TraceEvent::AiStart {
            id: id.clone(),
            operation,
            model: pending.model.name.clone(),
        });
        let loc = state.loc(pending.span);

        let provider = match self.providers.select(&pending.model) {
            Ok(provider) => provider,
            Err(detail) => {
                tracer.on_event(TraceEvent::AiComplete {
                    id,
                    rounds: 0,
                    usage: ai::request::TokenUsage::default(),
                    ok: false,
                });
                return state.resume_with_ai_response(WrappedValue::as_error(detail.at(loc)));
            }
        };

        let context_text = ai::context::format_local_context(&state);
        let tool_ctx = ToolContext {
            root_dir: state.root_dir.clone(),
        };
        let result = ai::execute_interaction(
            provider.as_ref(),
            operation,
            &pending.model,
            &pending.prompt,
            context_text,
            &pending.expectation,
            &state.type_defs,
            &self.tools,
            &tool_ctx,
            &self.config.ai,
            id.clone(),
        )
        .await;

        match result {
            Ok(outcome) => {
                tracer.on_event(TraceEvent::AiComplete {
                    id,
                    rounds: outcome.interaction.rounds,
                    usage: outcome.interaction.usage,
                    ok: !outcome.value.is_errored(),
                });
                state.ai_interactions.push(outcome.interaction);
                let value = annotate_ai_error(outcome.value, &loc);
                state.resume_with_ai_response(value)
            }
            Err(detail) => {
                // Structured-return validation failure is a hard runtime
                // error with the log context attached.
                tracer.on_event(TraceEvent::AiComplete {
                    id,
                    rounds: 0,
                    usage: ai::request::TokenUsage::default(),
                    ok: false,
                });
                state.fail(detail.at(loc));
                state
            }
        }
    }

    async fn service_compress(&self, mut state: RunState, tracer: &mut impl RunTracer) -> RunState {
        let Some(pending) = state.pending_compress.clone() else {
            state.fail(ErrorDetails::internal("awaiting_compress without a pending descriptor"));
            return state;
        };
        let id = state.id_counters.next_ai_id(OperationKind::Compress);
        tracer.on_event(TraceEvent::AiStart {
            id: id.clone(),
            operation: OperationKind::Compress,
            model: pending.model.name.clone(),
        });
        let loc = state.loc(pending.span);

        let provider = match self.providers.select(&pending.model) {
            Ok(provider) => provider,
            Err(detail) => {
                tracer.on_event(TraceEvent::AiComplete {
                    id,
                    rounds: 0,
                    usage: ai::request::TokenUsage::default(),
                    ok: false,
                });
                return state.resume_with_compress_result(WrappedValue::as_error(detail.at(loc)));
            }
        };

        let tool_ctx = ToolContext {
            root_dir: state.root_dir.clone(),
        };
        let result = ai::execute_interaction(
            provider.as_ref(),
            OperationKind::Compress,
            &pending.model,
            &pending.prompt,
            String::new(),
            &ReturnExpectation::Single(DeclaredType::Text),
            &state.type_defs,
            &self.tools,
            &tool_ctx,
            &self.config.ai,
            id.clone(),
        )
        .await;

        match result {
            Ok(outcome) => {
                tracer.on_event(TraceEvent::AiComplete {
                    id,
                    rounds: outcome.interaction.rounds,
                    usage: outcome.interaction.usage,
                    ok: !outcome.value.is_errored(),
                });
                state.ai_interactions.push(outcome.interaction);
                let value = annotate_ai_error(outcome.value, &loc);
                state.resume_with_compress_result(value)
            }
            Err(detail) => {
                tracer.on_event(TraceEvent::AiComplete {
                    id,
                    rounds: 0,
                    usage: ai::request::TokenUsage::default(),
                    ok: false,
                });
                state.fail(detail.at(loc));
                state
            }
        }
    }

    async fn service_host_block(&self, mut state: RunState, tracer: &mut impl RunTracer) -> RunState {
        let Some(pending) = state.pending_host_block.clone() else {
            state.fail(ErrorDetails::internal("awaiting_host without a pending descriptor"));
            return state;
        };
        let id = state.id_counters.next_ts_id();
        tracer.on_event(TraceEvent::TsStart { id: id.clone() });
        let loc = state.loc(pending.span);
        let values: Vec<serde_json::Value> = pending.values.iter().map(|v| v.payload().to_json()).collect();
        let result = self
            .host_eval
            .eval_host_block(&pending.params, &pending.body, values, &loc)
            .await;
        match result {
            Ok(json) => {
                tracer.on_event(TraceEvent::TsComplete { id, ok: true });
                state.resume_with_host_result(WrappedValue::wrap(Payload::from_json(json), ValueSource::HostBlock))
            }
            Err(failure) => {
                // A synchronous host-block failure is fatal; the original
                // stack trace is appended to the formatted error.
                tracer.on_event(TraceEvent::TsComplete { id, ok: false });
                state.fail(failure.into_details(loc));
                state
            }
        }
    }

    async fn service_imported_host(&self, mut state: RunState, tracer: &mut impl RunTracer) -> RunState {
        let Some(pending) = state.pending_imported_host_call.clone() else {
            state.fail(ErrorDetails::internal(
                "awaiting_imported_host without a pending descriptor",
            ));
            return state;
        };
        let id = state.id_counters.next_tsf_id();
        tracer.on_event(TraceEvent::TsStart { id: id.clone() });
        let loc = state.loc(pending.span);
        let args: Vec<serde_json::Value> = pending.args.iter().map(|v| v.payload().to_json()).collect();
        let result = self.host_loader.invoke(&pending.module, &pending.function, args).await;
        match result {
            Ok(json) => {
                tracer.on_event(TraceEvent::TsComplete { id, ok: true });
                state.resume_with_imported_host_result(WrappedValue::wrap(
                    Payload::from_json(json),
                    ValueSource::ImportedFunction,
                ))
            }
            Err(failure) => {
                tracer.on_event(TraceEvent::TsComplete { id, ok: false });
                state.fail(failure.into_details(loc));
                state
            }
        }
    }

    async fn service_tool(&self, mut state: RunState, tracer: &mut impl RunTracer) -> RunState {
        let Some(pending) = state.pending_tool.clone() else {
            state.fail(ErrorDetails::internal("awaiting_tool without a pending descriptor"));
            return state;
        };
        let id = state.id_counters.next_tsf_id();
        tracer.on_event(TraceEvent::ToolStart {
            id: id.clone(),
            name: pending.name.clone(),
        });
        let loc = state.loc(pending.span);
        let args = match pending.args.as_slice() {
            [single] => single.payload().to_json(),
            many => serde_json::Value::Array(many.iter().map(|v| v.payload().to_json()).collect()),
        };
        let ctx = ToolContext {
            root_dir: state.root_dir.clone(),
        };
        let started = Instant::now();
        let result = match self.tools.get(&pending.name) {
            Some(tool) => tool.execute(args, &ctx).await,
            None => Err(format!("no executor registered for tool '{}'", pending.name)),
        };
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let value = match result {
            Ok(json) => {
                tracer.on_event(TraceEvent::ToolComplete {
                    id,
                    name: pending.name.clone(),
                    duration_ms,
                    ok: true,
                });
                WrappedValue::wrap(Payload::from_json(json), ValueSource::ImportedFunction)
            }
            Err(message) => {
                tracer.on_event(TraceEvent::ToolComplete {
                    id,
                    name: pending.name.clone(),
                    duration_ms,
                    ok: false,
                });
                WrappedValue::as_error(ErrorDetails::tool_error(message).at(loc))
            }
        };
        state.resume_with_tool_result(value)
    }

    async fn service_user(&self, mut state: RunState) -> RunState {
        let Some(pending) = state.pending_user.clone() else {
            state.fail(ErrorDetails::internal("awaiting_user without a pending descriptor"));
            return state;
        };
        match self.user_input.prompt(&pending.prompt).await {
            Ok(answer) => state.resume_with_user_input(WrappedValue::wrap(Payload::Text(answer), ValueSource::User)),
            Err(detail) => {
                state.fail(detail.at(state.loc(pending.span)));
                state
            }
        }
    }
}

/// Errored LM values get the call site attached when the engine had none.
fn annotate_ai_error(value: WrappedValue, loc: &SourceLoc) -> WrappedValue {
    if !value.is_errored() {
        return value;
    }
    let Some(detail) = value.error_details() else {
        return value;
    };
    WrappedValue::as_error(detail.clone().or_at(loc))
}

// --- stub capabilities for unconfigured drivers ---

struct UnsupportedParser;

impl Parser for UnsupportedParser {
    fn parse(&self, _source: &str, file: &str) -> Result<Program, ErrorDetails> {
        Err(ErrorDetails::import_error(format!(
            "no parser capability configured (needed for '{file}')"
        )))
    }
}

struct UnsupportedHostEval;

#[async_trait::async_trait]
impl HostBlockEvaluator for UnsupportedHostEval {
    async fn eval_host_block(
        &self,
        _params: &[String],
        _body: &str,
        _values: Vec<serde_json::Value>,
        _location: &SourceLoc,
    ) -> Result<serde_json::Value, HostFailure> {
        Err(HostFailure::new("no host-block evaluator configured"))
    }
}

struct UnsupportedHostModules;

#[async_trait::async_trait]
impl HostModuleLoader for UnsupportedHostModules {
    fn load_host_module(&self, path: &str) -> Result<Vec<String>, ErrorDetails> {
        Err(ErrorDetails::import_error(format!(
            "no host-module loader configured (needed for '{path}')"
        )))
    }

    async fn invoke(
        &self,
        path: &str,
        _function: &str,
        _args: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, HostFailure> {
        Err(HostFailure::new(format!("no host-module loader configured for '{path}'")))
    }
}
