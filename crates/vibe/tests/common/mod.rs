//! Shared helpers for driver-level tests: a scriptable provider double and
//! program-building shorthand.
#![allow(dead_code, reason = "each test binary uses a subset of the helpers")]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use vibe::{
    AiRequest, AiResponse, CollectStringPrint, DeclaredType, Driver, Expr, ExprLoc, NoopTracer, Program,
    ProviderError, ProviderExecutor, ProviderRegistry, RunFailure, RunOutcome, Stmt, TokenUsage, ToolCallRequest,
};

/// Handler signature: (zero-based call index, request) → response.
pub type Handler = dyn Fn(usize, &AiRequest) -> Result<AiResponse, ProviderError> + Send + Sync;

/// A provider double driven by a closure, with optional uniform latency
/// and full request capture.
pub struct MockProvider {
    handler: Box<Handler>,
    latency: Option<Duration>,
    calls: AtomicUsize,
    pub requests: Mutex<Vec<AiRequest>>,
}

impl MockProvider {
    pub fn new(
        handler: impl Fn(usize, &AiRequest) -> Result<AiResponse, ProviderError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            latency: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn with_latency(
        latency: Duration,
        handler: impl Fn(usize, &AiRequest) -> Result<AiResponse, ProviderError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            latency: Some(latency),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn request(&self, index: usize) -> AiRequest {
        self.requests.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl ProviderExecutor for MockProvider {
    async fn execute(&self, request: &AiRequest) -> Result<AiResponse, ProviderError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        (self.handler)(index, request)
    }
}

/// Driver wired to the given provider as the default executor.
pub fn driver_with(provider: Arc<MockProvider>) -> Driver {
    Driver::new().with_providers(ProviderRegistry::new().with_default(provider))
}

/// Runs a program, capturing print output.
pub async fn run_capture(driver: &Driver, program: &Program) -> (Result<RunOutcome, RunFailure>, String) {
    let mut print = CollectStringPrint::new();
    let mut tracer = NoopTracer;
    let result = driver.run(program, &mut print, &mut tracer).await;
    (result, print.into_output())
}

/// `let m: model = { name: "mock", api_key: "key" }`.
pub fn model_decl() -> Stmt {
    Stmt::let_typed(
        "m",
        DeclaredType::Model,
        Expr::Record(vec![
            ("name".to_owned(), Expr::text("mock").at(1, 10)),
            ("api_key".to_owned(), Expr::text("key").at(1, 20)),
        ])
        .at(1, 5),
    )
}

/// A `__vibe_return_field(field, value)` tool call as a provider emits it.
pub fn return_field_call(id: &str, field: &str, value: serde_json::Value) -> ToolCallRequest {
    ToolCallRequest {
        id: id.to_owned(),
        name: vibe::RETURN_FIELD_TOOL.to_owned(),
        input: serde_json::json!({ "field": field, "value": value }),
    }
}

pub fn usage(input: u64, output: u64) -> TokenUsage {
    TokenUsage {
        input_tokens: input,
        output_tokens: output,
        ..TokenUsage::default()
    }
}

/// Shorthand for a spanned expression at line 1.
pub fn e(expr: Expr) -> ExprLoc {
    expr.at(1, 1)
}
