//! Host collaborator capabilities.
//!
//! The runtime consumes these seams rather than implementing them: source
//! parsing, host-block evaluation, host-module loading, tool execution, and
//! user prompting all live on the embedder's side of the boundary. Traits
//! that cross an await point are object-safe via `async_trait` so the
//! driver can hold them behind `Arc<dyn _>`.

use std::path::PathBuf;
use std::sync::Arc;

use ahash::AHashMap;
use async_trait::async_trait;

use crate::{
    error::{ErrorDetails, SourceLoc},
    program::Program,
    value::ToolDescriptor,
};

/// Parser capability: turns source text into a validated program tree with
/// per-node source locations. Used for the main program and for imported
/// Vibe modules.
pub trait Parser: Send + Sync {
    fn parse(&self, source: &str, file: &str) -> Result<Program, ErrorDetails>;
}

/// Failure from host-language execution, carrying the original stack trace
/// referencing the host file.
#[derive(Debug, Clone)]
pub struct HostFailure {
    pub message: String,
    pub stack: Option<String>,
}

impl HostFailure {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    #[must_use]
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Converts into the runtime error shape: vibe location prefixed, host
    /// stack appended.
    #[must_use]
    pub fn into_details(self, location: SourceLoc) -> ErrorDetails {
        let mut detail = ErrorDetails::ts_block_error(self.message).at(location);
        detail.host_stack = self.stack;
        detail
    }
}

/// Host-block evaluator: executes an embedded code fragment in strict mode
/// with the given parameter names bound to the given values, in order.
#[async_trait]
pub trait HostBlockEvaluator: Send + Sync {
    async fn eval_host_block(
        &self,
        params: &[String],
        body: &str,
        values: Vec<serde_json::Value>,
        location: &SourceLoc,
    ) -> Result<serde_json::Value, HostFailure>;
}

/// Host-function loader: resolves a host-language module to its exported
/// names and invokes them on demand.
#[async_trait]
pub trait HostModuleLoader: Send + Sync {
    /// Yields the exported names of the module at `path`.
    fn load_host_module(&self, path: &str) -> Result<Vec<String>, ErrorDetails>;

    /// Invokes one exported function.
    async fn invoke(
        &self,
        path: &str,
        function: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, HostFailure>;
}

/// Execution context passed to tool callables.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub root_dir: PathBuf,
}

/// A callable tool capability. Descriptors advertise the schema; the
/// executor does the work.
#[async_trait]
pub trait ToolCallable: Send + Sync {
    async fn execute(&self, args: serde_json::Value, ctx: &ToolContext) -> Result<serde_json::Value, String>;
}

/// A tool built from a plain function, for tests and simple embedders.
pub struct FnTool<F>(F);

impl<F> FnTool<F>
where
    F: Fn(serde_json::Value) -> Result<serde_json::Value, String> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> ToolCallable for FnTool<F>
where
    F: Fn(serde_json::Value) -> Result<serde_json::Value, String> + Send + Sync,
{
    async fn execute(&self, args: serde_json::Value, _ctx: &ToolContext) -> Result<serde_json::Value, String> {
        (self.0)(args)
    }
}

/// Registry mapping tool names to their executors.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: AHashMap<String, Arc<dyn ToolCallable>>,
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, tool: Arc<dyn ToolCallable>) {
        self.tools.insert(name.into(), tool);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn ToolCallable>> {
        self.tools.get(name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }
}

/// User-input capability, serviced when the program asks a question.
#[async_trait]
pub trait UserInput: Send + Sync {
    async fn prompt(&self, message: &str) -> Result<String, ErrorDetails>;
}

/// A fixed-answer user input, for tests and non-interactive runs.
pub struct StaticUserInput(pub String);

#[async_trait]
impl UserInput for StaticUserInput {
    async fn prompt(&self, _message: &str) -> Result<String, ErrorDetails> {
        Ok(self.0.clone())
    }
}

/// Descriptors for the fixed `system/tools` registry entries. Executors are
/// supplied by the embedder through the [`ToolRegistry`]; the descriptors
/// only advertise what exists.
#[must_use]
pub fn system_tool_descriptors() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor {
            name: "readFile".to_owned(),
            description: "Read a file relative to the project root and return its text.".to_owned(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": { "path": { "type": "string" } },
                "required": ["path"]
            }),
        },
        ToolDescriptor {
            name: "writeFile".to_owned(),
            description: "Write text to a file relative to the project root.".to_owned(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "content": { "type": "string" }
                },
                "required": ["path", "content"]
            }),
        },
        ToolDescriptor {
            name: "listDir".to_owned(),
            description: "List directory entries relative to the project root.".to_owned(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": { "path": { "type": "string" } },
                "required": ["path"]
            }),
        },
    ]
}
