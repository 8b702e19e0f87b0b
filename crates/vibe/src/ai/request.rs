//! Provider-neutral request/response shapes for the LM engine.
//!
//! These are the internal lingua franca — not script-level values, not
//! vendor wire formats. A [`ProviderExecutor`](super::provider::ProviderExecutor)
//! transforms them to whatever its backend speaks; the runtime never
//! depends on wire specifics.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use crate::{program::AiOpKind, value::{ModelDescriptor, ToolDescriptor}};

/// The three operation types the engine issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, IntoStaticStr, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
pub enum OperationKind {
    /// Single-shot prompt; short tool loop only when a typed return is due.
    Do,
    /// Tool-augmented conversation with the full tool loop.
    Vibe,
    /// Loop-scope summarization; always a single `value: text` return.
    Compress,
}

impl From<AiOpKind> for OperationKind {
    fn from(kind: AiOpKind) -> Self {
        match kind {
            AiOpKind::Do => Self::Do,
            AiOpKind::Vibe => Self::Vibe,
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Provider-assigned id correlating the call with its result.
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// Outcome of executing one requested tool call, fed back to the provider
/// on the next round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub tool_call_id: String,
    pub name: String,
    /// Result value, or the error text when `is_error`.
    pub content: serde_json::Value,
    pub is_error: bool,
    /// Wall-clock execution time.
    pub duration_ms: u64,
}

/// One cache-aware chunk of formatted context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextChunk {
    pub text: String,
    /// Marks the chunk a provider may set a cache breakpoint after. Set on
    /// the second-to-last chunk so the final chunk can change without
    /// invalidating the cache.
    pub cache_breakpoint: bool,
}

/// The unified request shape handed to a provider executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiRequest {
    pub operation: OperationKind,
    pub model: ModelDescriptor,
    pub prompt: String,
    /// Formatted local-context prefix.
    pub context_text: String,
    /// The same context split into cache-breakable chunks, for providers
    /// that support breakpoints.
    pub context_chunks: Vec<ContextChunk>,
    /// Tools available this round. Always includes the reserved return tool
    /// when a typed return is expected, and stays stable across rounds.
    pub tools: Vec<ToolDescriptor>,
    /// Tool calls from the previous round, echoed back for conversation
    /// continuity.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub previous_tool_calls: Vec<ToolCallRequest>,
    /// Results for `previous_tool_calls`, in the same order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolOutcome>,
    /// Extra user-turn message appended when re-prompting (retry nudges).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follow_up_message: Option<String>,
    /// Full message-list override; when set, providers ignore prompt and
    /// context and replay this conversation verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages_override: Option<Vec<serde_json::Value>>,
}

impl AiRequest {
    /// A minimal request with no tools or history.
    #[must_use]
    pub fn new(operation: OperationKind, model: ModelDescriptor, prompt: impl Into<String>) -> Self {
        Self {
            operation,
            model,
            prompt: prompt.into(),
            context_text: String::new(),
            context_chunks: Vec::new(),
            tools: Vec::new(),
            previous_tool_calls: Vec::new(),
            tool_results: Vec::new(),
            follow_up_message: None,
            messages_override: None,
        }
    }
}

/// Why the provider stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    End,
    ToolUse,
    Length,
    ContentFilter,
}

/// Token usage for one provider invocation. All counters accumulate across
/// tool-loop rounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_input_tokens: u64,
    pub thinking_tokens: u64,
    pub cache_creation_tokens: u64,
}

impl TokenUsage {
    pub fn accumulate(&mut self, other: &Self) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cached_input_tokens += other.cached_input_tokens;
        self.thinking_tokens += other.thinking_tokens;
        self.cache_creation_tokens += other.cache_creation_tokens;
    }
}

/// Response from a provider executor, already lifted out of wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiResponse {
    /// Concatenated text content.
    pub content: String,
    /// Provider-parsed structured value, when the backend produced one.
    pub parsed_value: Option<serde_json::Value>,
    pub usage: TokenUsage,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    pub stop_reason: StopReason,
    /// The raw provider response, kept for diagnostics.
    pub raw_response: serde_json::Value,
}

impl AiResponse {
    /// A plain text response, as provider test doubles produce it.
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            parsed_value: None,
            usage: TokenUsage::default(),
            tool_calls: Vec::new(),
            stop_reason: StopReason::End,
            raw_response: serde_json::Value::Null,
        }
    }

    /// A tool-use response carrying the given calls.
    #[must_use]
    pub fn tool_use(tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            content: String::new(),
            parsed_value: None,
            usage: TokenUsage::default(),
            tool_calls,
            stop_reason: StopReason::ToolUse,
            raw_response: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }
}

/// One row of the run's AI interaction log. Lives in run state, so no
/// serde field-skipping (state snapshots go through postcard).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiInteraction {
    /// Log id: `do-NNNNNN` / `vibe-NNNNNN`, counters independent per prefix.
    pub id: String,
    pub operation: OperationKind,
    pub model: String,
    /// Provider rounds the tool loop took.
    pub rounds: u32,
    /// Recorded retry attempts (missing-return-tool re-prompts).
    pub retries: u32,
    pub usage: TokenUsage,
    pub duration_ms: u64,
    #[serde(default)]
    pub error: Option<String>,
}
