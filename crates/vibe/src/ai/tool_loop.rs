//! The multi-round tool-calling loop and the structured-return protocol.
//!
//! Typed returns must be produced by tool calls to the reserved
//! `__vibe_return_field(field, value)` tool. The return tool is always in
//! the advertised tool list so the list stays stable for prompt caching.
//! Rounds are bounded per operation type; a model that answers in plain
//! text when a typed return is due gets one follow-up nudge per remaining
//! round.

use std::sync::{OnceLock, RwLock};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use indexmap::IndexMap;

use crate::{
    error::{AiLogContext, ErrorDetails},
    host::{ToolContext, ToolRegistry},
    value::ToolDescriptor,
};

use super::{
    provider::ProviderExecutor,
    request::{AiRequest, AiResponse, OperationKind, TokenUsage, ToolCallRequest, ToolOutcome},
    retry::with_retry,
};

/// Name of the reserved structured-return tool.
pub const RETURN_FIELD_TOOL: &str = "__vibe_return_field";

/// Process-wide registry of reserved return tools, behind an explicit
/// initialization routine so tests can reset it.
static RETURN_TOOLS: OnceLock<RwLock<AHashMap<String, ToolDescriptor>>> = OnceLock::new();

fn registry() -> &'static RwLock<AHashMap<String, ToolDescriptor>> {
    RETURN_TOOLS.get_or_init(|| RwLock::new(AHashMap::new()))
}

/// Registers the reserved return tool. Idempotent; called by the engine
/// before every loop so embedders never need to.
pub fn init_return_tools() {
    let mut tools = registry().write().expect("return tool registry poisoned");
    tools
        .entry(RETURN_FIELD_TOOL.to_owned())
        .or_insert_with(return_tool_descriptor);
}

/// Clears the registry. Test hook.
pub fn reset_return_tools() {
    registry().write().expect("return tool registry poisoned").clear();
}

/// Whether a tool call targets a reserved return tool.
#[must_use]
pub fn is_return_tool(name: &str) -> bool {
    registry().read().expect("return tool registry poisoned").contains_key(name)
}

/// Schema of the reserved return tool.
#[must_use]
pub fn return_tool_descriptor() -> ToolDescriptor {
    ToolDescriptor {
        name: RETURN_FIELD_TOOL.to_owned(),
        description: "Deliver one field of the result. Call once per expected field.".to_owned(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "field": { "type": "string", "description": "Name of the field being returned." },
                "value": { "description": "The field's value." }
            },
            "required": ["field", "value"]
        }),
    }
}

/// Round bounds per operation type: one round for plain `do`/`compress`,
/// three when they carry a typed return, ten for `vibe`.
#[must_use]
pub fn max_rounds(operation: OperationKind, has_return_tool: bool) -> u32 {
    match operation {
        OperationKind::Vibe => 10,
        OperationKind::Do | OperationKind::Compress => {
            if has_return_tool {
                3
            } else {
                1
            }
        }
    }
}

/// Retry configuration for provider invocations inside the loop.
#[derive(Debug, Clone)]
pub struct ToolLoopConfig {
    pub max_retries: u32,
    pub retry_base: Duration,
}

impl Default for ToolLoopConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base: Duration::from_millis(250),
        }
    }
}

/// What the loop produced.
#[derive(Debug)]
pub struct ToolLoopOutcome {
    /// Collected return-tool fields, in arrival order.
    pub fields: IndexMap<String, serde_json::Value>,
    /// Text content of the final response.
    pub content: String,
    /// Usage accumulated across every round.
    pub usage: TokenUsage,
    pub rounds: u32,
    /// Recorded missing-return-tool retry attempts.
    pub retries: u32,
    /// Message trace for diagnostics.
    pub log: AiLogContext,
}

impl ToolLoopOutcome {
    /// Whether every expected field arrived.
    #[must_use]
    pub fn collected_all(&self, expected: &[String]) -> bool {
        expected.iter().all(|name| self.fields.contains_key(name))
    }
}

/// Runs the tool loop to completion or round exhaustion. `expected_fields`
/// is empty for untyped calls. Returns the loop outcome, or the provider
/// error detail once retries are exhausted.
pub async fn run_tool_loop(
    provider: &dyn ProviderExecutor,
    mut request: AiRequest,
    expected_fields: &[String],
    tools: &ToolRegistry,
    ctx: &ToolContext,
    config: &ToolLoopConfig,
) -> Result<ToolLoopOutcome, ErrorDetails> {
    init_return_tools();
    let limit = max_rounds(request.operation, !expected_fields.is_empty());
    let mut usage = TokenUsage::default();
    let mut fields: IndexMap<String, serde_json::Value> = IndexMap::new();
    let mut log = AiLogContext::default();
    let mut retries = 0u32;

    let mut response = execute_once(provider, &request, config, &mut log).await?;
    let mut rounds = 1u32;
    usage.accumulate(&response.usage);

    loop {
        if !response.tool_calls.is_empty() {
            let outcomes = execute_tools(&response.tool_calls, &mut fields, tools, ctx).await;
            let satisfied = !expected_fields.is_empty() && expected_fields.iter().all(|f| fields.contains_key(f));
            if satisfied || rounds >= limit {
                break;
            }
            request.previous_tool_calls = response.tool_calls.clone();
            request.tool_results = outcomes;
            request.follow_up_message = None;
        } else if !expected_fields.is_empty() && !expected_fields.iter().all(|f| fields.contains_key(f)) {
            if rounds >= limit {
                break;
            }
            // The model answered in prose; record the attempt and nudge it
            // toward the return tool.
            retries += 1;
            log.messages.push(serde_json::json!({
                "retry": retries,
                "aiResponse": response.content,
            }));
            request.previous_tool_calls.clear();
            request.tool_results.clear();
            request.follow_up_message = Some(format!(
                "You must use the return tools to deliver the result. Call {RETURN_FIELD_TOOL} once for each expected field."
            ));
        } else {
            break;
        }
        response = execute_once(provider, &request, config, &mut log).await?;
        rounds += 1;
        usage.accumulate(&response.usage);
    }

    log.raw_response = Some(response.raw_response.clone());
    Ok(ToolLoopOutcome {
        fields,
        content: response.content,
        usage,
        rounds,
        retries,
        log,
    })
}

async fn execute_once(
    provider: &dyn ProviderExecutor,
    request: &AiRequest,
    config: &ToolLoopConfig,
    log: &mut AiLogContext,
) -> Result<AiResponse, ErrorDetails> {
    log.messages
        .push(serde_json::to_value(request).unwrap_or(serde_json::Value::Null));
    let result = with_retry(config.max_retries, config.retry_base, || provider.execute(request)).await;
    match result {
        Ok(response) => {
            log.messages
                .push(serde_json::to_value(&response).unwrap_or(serde_json::Value::Null));
            Ok(response)
        }
        Err(error) => {
            let detail = ErrorDetails::ai_error(format!("{}: {error}", error.class_name())).with_ai_log(log.clone());
            Err(detail)
        }
    }
}

/// Executes one round of requested tool calls. Return-tool calls collect
/// their field; real tools run through the registry with the run's root
/// directory, recording duration and errors. A failing tool never aborts
/// the round — its error is fed back to the model.
async fn execute_tools(
    calls: &[ToolCallRequest],
    fields: &mut IndexMap<String, serde_json::Value>,
    tools: &ToolRegistry,
    ctx: &ToolContext,
) -> Vec<ToolOutcome> {
    let mut outcomes = Vec::with_capacity(calls.len());
    for call in calls {
        if is_return_tool(&call.name) {
            let field = call
                .input
                .get("field")
                .and_then(|f| f.as_str())
                .unwrap_or("value")
                .to_owned();
            let value = call.input.get("value").cloned().unwrap_or(serde_json::Value::Null);
            fields.insert(field, value);
            outcomes.push(ToolOutcome {
                tool_call_id: call.id.clone(),
                name: call.name.clone(),
                content: serde_json::json!("field recorded"),
                is_error: false,
                duration_ms: 0,
            });
            continue;
        }
        let started = Instant::now();
        let result = match tools.get(&call.name) {
            Some(tool) => tool.execute(call.input.clone(), ctx).await,
            None => Err(format!("unknown tool '{}'", call.name)),
        };
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        match result {
            Ok(content) => outcomes.push(ToolOutcome {
                tool_call_id: call.id.clone(),
                name: call.name.clone(),
                content,
                is_error: false,
                duration_ms,
            }),
            Err(message) => outcomes.push(ToolOutcome {
                tool_call_id: call.id.clone(),
                name: call.name.clone(),
                content: serde_json::Value::String(message),
                is_error: true,
                duration_ms,
            }),
        }
    }
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_limits_by_operation() {
        assert_eq!(max_rounds(OperationKind::Do, false), 1);
        assert_eq!(max_rounds(OperationKind::Do, true), 3);
        assert_eq!(max_rounds(OperationKind::Compress, false), 1);
        assert_eq!(max_rounds(OperationKind::Compress, true), 3);
        assert_eq!(max_rounds(OperationKind::Vibe, false), 10);
        assert_eq!(max_rounds(OperationKind::Vibe, true), 10);
    }

    #[test]
    fn return_tool_registry_resets() {
        init_return_tools();
        assert!(is_return_tool(RETURN_FIELD_TOOL));
        reset_return_tools();
        assert!(!is_return_tool(RETURN_FIELD_TOOL));
        init_return_tools();
        assert!(is_return_tool(RETURN_FIELD_TOOL));
    }
}
