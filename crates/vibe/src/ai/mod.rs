//! The LM interaction engine.
//!
//! Ties together model lookup, context assembly, provider dispatch, the
//! tool-calling loop, the structured-return protocol with typed
//! validation, and retry policy. Provider failures become errored values
//! on the receiving binding; structured-return validation failures are
//! hard runtime errors carrying the full message trace.

pub mod context;
pub mod provider;
pub mod request;
pub mod retry;
pub mod tool_loop;

use std::time::{Duration, Instant};

use ahash::AHashMap;
use indexmap::IndexMap;

use crate::{
    error::ErrorDetails,
    host::{ToolContext, ToolRegistry},
    instruction::ReturnExpectation,
    value::{DeclaredType, ModelDescriptor, Payload, StructuralType, ValueSource, WrappedValue},
};

use provider::ProviderExecutor;
use request::{AiInteraction, AiRequest, OperationKind};
use tool_loop::{ToolLoopConfig, run_tool_loop, return_tool_descriptor};

/// Engine-level configuration, owned by the driver.
#[derive(Debug, Clone)]
pub struct AiConfig {
    pub max_retries: u32,
    pub retry_base: Duration,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base: Duration::from_millis(250),
        }
    }
}

/// Result of one complete LM interaction.
#[derive(Debug)]
pub struct AiOutcome {
    /// The value for the receiving binding; errored on provider failure.
    pub value: WrappedValue,
    /// Log record for the run's interaction log.
    pub interaction: AiInteraction,
}

/// Executes one LM interaction end to end.
///
/// Returns `Err` only for hard failures (typed-return validation); provider
/// exhaustion comes back as `Ok` with an errored value, per the
/// errors-are-values policy.
#[expect(clippy::too_many_arguments, reason = "the engine seam carries every collaborator")]
pub async fn execute_interaction(
    provider: &dyn ProviderExecutor,
    operation: OperationKind,
    model: &ModelDescriptor,
    prompt: &str,
    context_text: String,
    expectation: &ReturnExpectation,
    types: &AHashMap<String, StructuralType>,
    tools: &ToolRegistry,
    tool_ctx: &ToolContext,
    config: &AiConfig,
    id: String,
) -> Result<AiOutcome, ErrorDetails> {
    let started = Instant::now();
    let expected = expected_fields(expectation);
    let expected_names: Vec<String> = expected.iter().map(|(name, _)| name.clone()).collect();

    let mut request = AiRequest::new(operation, model.clone(), prompt);
    if !expected.is_empty() {
        request.prompt = format!("{}\n\n{}", request.prompt, return_instruction(&expected, types));
    }
    request.context_chunks = context::chunk_context(&context_text);
    request.context_text = context_text;
    // The tool list always carries the return tool so it stays stable for
    // prompt caching, typed return or not.
    request.tools = model.tools.clone();
    request.tools.push(return_tool_descriptor());

    let loop_config = ToolLoopConfig {
        max_retries: config.max_retries,
        retry_base: config.retry_base,
    };
    let outcome = match run_tool_loop(provider, request, &expected_names, tools, tool_ctx, &loop_config).await {
        Ok(outcome) => outcome,
        Err(detail) => {
            // Provider exhausted its retries: the binding gets an errored
            // value preserving the message and diagnostic context.
            let message = detail.message.clone();
            let interaction = AiInteraction {
                id,
                operation,
                model: model.name.clone(),
                rounds: 0,
                retries: config.max_retries,
                usage: request::TokenUsage::default(),
                duration_ms: elapsed_ms(started),
                error: Some(message),
            };
            return Ok(AiOutcome {
                value: WrappedValue::as_error(detail),
                interaction,
            });
        }
    };

    let interaction = AiInteraction {
        id,
        operation,
        model: model.name.clone(),
        rounds: outcome.rounds,
        retries: outcome.retries,
        usage: outcome.usage,
        duration_ms: elapsed_ms(started),
        error: None,
    };

    if expected.is_empty() {
        return Ok(AiOutcome {
            value: WrappedValue::wrap(Payload::Text(outcome.content), ValueSource::Ai),
            interaction,
        });
    }

    // Typed return: every expected field must have arrived through the
    // return tool, and every payload must validate. Both failures are hard
    // errors with the message trace attached.
    let mut record: IndexMap<String, Payload> = IndexMap::new();
    for (name, ty) in &expected {
        let Some(raw) = outcome.fields.get(name) else {
            return Err(ErrorDetails::validation_error(format!(
                "model did not return expected field '{name}'"
            ))
            .with_ai_log(outcome.log));
        };
        let payload = coerce_provider_value(Payload::from_json(raw.clone()), ty);
        match crate::value::validate_and_coerce(payload, ty, name, types) {
            Ok(valid) => {
                record.insert(name.clone(), valid);
            }
            Err(detail) => {
                return Err(ErrorDetails::validation_error(format!(
                    "returned field '{name}' failed validation: {}",
                    detail.message
                ))
                .with_ai_log(outcome.log));
            }
        }
    }

    let payload = if let [(single, _)] = expected.as_slice()
        && single.as_str() == "value"
        && matches!(expectation, ReturnExpectation::Single(_))
    {
        record.shift_remove("value").expect("validated above")
    } else {
        Payload::Record(record)
    };
    Ok(AiOutcome {
        value: WrappedValue::wrap(payload, ValueSource::Ai),
        interaction,
    })
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Expands an expectation into the flat field list the return tool must
/// deliver: a single `value` field, or one field per destructuring name.
fn expected_fields(expectation: &ReturnExpectation) -> Vec<(String, DeclaredType)> {
    match expectation {
        ReturnExpectation::Untyped => Vec::new(),
        ReturnExpectation::Single(ty) => vec![("value".to_owned(), ty.clone())],
        ReturnExpectation::Fields(fields) => fields.iter().map(|f| (f.name.clone(), f.ty.clone())).collect(),
    }
}

/// Renders the return instruction appended to the prompt, listing each
/// expected field with its (recursively expanded) type.
fn return_instruction(expected: &[(String, DeclaredType)], types: &AHashMap<String, StructuralType>) -> String {
    let mut out = String::from(
        "Deliver the result by calling the return tool once per field listed below. Do not answer in prose.\n",
    );
    for (name, ty) in expected {
        out.push_str(&format!("- {name}: {}\n", render_type(ty, types, 0)));
    }
    out
}

/// Renders a type for the prompt, expanding named structural types one
/// level per nesting.
fn render_type(ty: &DeclaredType, types: &AHashMap<String, StructuralType>, depth: usize) -> String {
    // Depth guard against self-referential type definitions.
    if depth > 4 {
        return ty.to_string();
    }
    match ty {
        DeclaredType::Named(name) => match types.get(name) {
            Some(structural) => {
                let fields: Vec<String> = structural
                    .fields
                    .iter()
                    .map(|(field, field_ty)| format!("{field}: {}", render_type(field_ty, types, depth + 1)))
                    .collect();
                format!("{{ {} }}", fields.join(", "))
            }
            None => ty.to_string(),
        },
        DeclaredType::Array(elem) => format!("{}[]", render_type(elem, types, depth + 1)),
        other => other.to_string(),
    }
}

/// Providers sometimes emit typed parameters as strings; coerce those to
/// the expected shape before validation.
fn coerce_provider_value(payload: Payload, ty: &DeclaredType) -> Payload {
    let Payload::Text(text) = &payload else {
        return payload;
    };
    match ty {
        DeclaredType::Number => {
            if let Ok(i) = text.parse::<i64>() {
                Payload::Int(i)
            } else if let Ok(f) = text.parse::<f64>() {
                Payload::Float(f)
            } else {
                payload
            }
        }
        DeclaredType::Boolean => match text.as_str() {
            "true" => Payload::Bool(true),
            "false" => Payload::Bool(false),
            _ => payload,
        },
        DeclaredType::Json | DeclaredType::Array(_) | DeclaredType::Named(_) => {
            match serde_json::from_str::<serde_json::Value>(text) {
                Ok(parsed) => Payload::from_json(parsed),
                Err(_) => payload,
            }
        }
        _ => payload,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn coerce_provider_strings() {
        assert_eq!(
            coerce_provider_value(Payload::Text("30".into()), &DeclaredType::Number),
            Payload::Int(30)
        );
        assert_eq!(
            coerce_provider_value(Payload::Text("true".into()), &DeclaredType::Boolean),
            Payload::Bool(true)
        );
        assert_eq!(
            coerce_provider_value(Payload::Text("plain".into()), &DeclaredType::Text),
            Payload::Text("plain".into())
        );
        assert!(matches!(
            coerce_provider_value(Payload::Text("[1,2]".into()), &DeclaredType::Array(Box::new(DeclaredType::Number))),
            Payload::Seq(_)
        ));
    }

    #[test]
    fn render_type_expands_named() {
        let mut types = AHashMap::new();
        types.insert(
            "Person".to_owned(),
            StructuralType {
                name: "Person".to_owned(),
                fields: vec![
                    ("name".to_owned(), DeclaredType::Text),
                    ("age".to_owned(), DeclaredType::Number),
                ],
            },
        );
        assert_eq!(
            render_type(&DeclaredType::Named("Person".to_owned()), &types, 0),
            "{ name: text, age: number }"
        );
    }
}
