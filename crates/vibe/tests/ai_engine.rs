//! Driver-level tests of the LM engine: the structured-return protocol,
//! the tool loop, retry nudges, usage accounting, and error policy.

mod common;

use std::sync::Arc;

use common::{MockProvider, driver_with, e, model_decl, return_field_call, run_capture, usage};
use pretty_assertions::assert_eq;
use vibe::{
    AiOpKind, AiResponse, DeclaredType, DestructureField, ErrorKind, Expr, FnTool, Payload, Program, ProviderError,
    Status, Stmt, ToolCallRequest, ToolRegistry,
};

fn do_expr(prompt: &str) -> vibe::ExprLoc {
    e(Expr::ai(AiOpKind::Do, e(Expr::text(prompt)), e(Expr::var("m"))))
}

#[tokio::test]
async fn untyped_do_returns_text() {
    let provider = MockProvider::new(|_, _| Ok(AiResponse::text("plain answer")));
    let driver = driver_with(provider.clone());
    let p = Program::new("main.vibe").with_statements(vec![
        model_decl(),
        Stmt::let_untyped("r", do_expr("say something")),
    ]);
    let (result, _) = run_capture(&driver, &p).await;
    let outcome = result.unwrap();
    assert_eq!(
        *outcome.state.lookup("r").unwrap().payload(),
        Payload::Text("plain answer".to_owned())
    );
    assert_eq!(outcome.state.lookup("r").unwrap().source, vibe::ValueSource::Ai);
    // Untyped do is a single round.
    assert_eq!(provider.call_count(), 1);
    // The tool list still carried the return tool, for cache stability.
    let request = provider.request(0);
    assert!(request.tools.iter().any(|t| t.name == vibe::RETURN_FIELD_TOOL));
}

#[tokio::test]
async fn structured_return_with_destructuring() {
    let provider = MockProvider::new(|_, _| {
        Ok(AiResponse::tool_use(vec![
            return_field_call("tc1", "name", serde_json::json!("Alice")),
            return_field_call("tc2", "age", serde_json::json!(30)),
        ]))
    });
    let driver = driver_with(provider.clone());
    let p = Program::new("main.vibe").with_statements(vec![
        model_decl(),
        Stmt::LetDestructure {
            fields: vec![
                DestructureField {
                    name: "name".to_owned(),
                    ty: DeclaredType::Text,
                },
                DestructureField {
                    name: "age".to_owned(),
                    ty: DeclaredType::Number,
                },
            ],
            init: do_expr("get_person"),
            is_async: true,
        },
        Stmt::let_untyped("n", e(Expr::var("name"))),
        Stmt::let_untyped("a", e(Expr::var("age"))),
    ]);
    let (result, _) = run_capture(&driver, &p).await;
    let outcome = result.unwrap();
    assert_eq!(outcome.state.status, Status::Completed);
    let n = outcome.state.lookup("n").unwrap();
    assert_eq!(*n.payload(), Payload::Text("Alice".to_owned()));
    assert_eq!(n.declared_type, Some(DeclaredType::Text));
    let a = outcome.state.lookup("a").unwrap();
    assert_eq!(*a.payload(), Payload::Int(30));
    assert_eq!(a.declared_type, Some(DeclaredType::Number));
}

#[tokio::test]
async fn missing_return_tool_is_retried_once() {
    // Round 1 answers in prose; round 2 uses the return tool properly.
    let provider = MockProvider::new(|index, _| {
        if index == 0 {
            Ok(AiResponse::text("the answer is forty-two").with_usage(usage(10, 5)))
        } else {
            Ok(
                AiResponse::tool_use(vec![return_field_call("tc1", "value", serde_json::json!(42))])
                    .with_usage(usage(7, 3)),
            )
        }
    });
    let driver = driver_with(provider.clone());
    let p = Program::new("main.vibe").with_statements(vec![
        model_decl(),
        Stmt::let_typed("x", DeclaredType::Number, do_expr("answer")),
    ]);
    let (result, _) = run_capture(&driver, &p).await;
    let outcome = result.unwrap();
    assert_eq!(*outcome.state.lookup("x").unwrap().payload(), Payload::Int(42));

    // The follow-up nudge named the return tools.
    let second = provider.request(1);
    assert!(
        second
            .follow_up_message
            .as_deref()
            .is_some_and(|m| m.contains("return tools")),
        "expected a return-tool nudge"
    );

    // One retry recorded; usage accumulated across both rounds.
    let interaction = &outcome.state.ai_interactions[0];
    assert_eq!(interaction.rounds, 2);
    assert_eq!(interaction.retries, 1);
    assert_eq!(interaction.usage.input_tokens, 17);
    assert_eq!(interaction.usage.output_tokens, 8);
}

#[tokio::test]
async fn typed_string_payloads_are_coerced() {
    let provider = MockProvider::new(|_, _| {
        Ok(AiResponse::tool_use(vec![return_field_call(
            "tc1",
            "value",
            serde_json::json!("30"),
        )]))
    });
    let driver = driver_with(provider);
    let p = Program::new("main.vibe").with_statements(vec![
        model_decl(),
        Stmt::let_typed("n", DeclaredType::Number, do_expr("count")),
    ]);
    let (result, _) = run_capture(&driver, &p).await;
    assert_eq!(*result.unwrap().state.lookup("n").unwrap().payload(), Payload::Int(30));
}

#[tokio::test]
async fn validation_failure_is_fatal_with_log_context() {
    let provider = MockProvider::new(|_, _| {
        Ok(AiResponse::tool_use(vec![return_field_call(
            "tc1",
            "value",
            serde_json::json!("not a number"),
        )]))
    });
    let driver = driver_with(provider);
    let p = Program::new("main.vibe").with_statements(vec![
        model_decl(),
        Stmt::let_typed("n", DeclaredType::Number, do_expr("count")),
    ]);
    let (result, _) = run_capture(&driver, &p).await;
    let failure = result.unwrap_err();
    assert_eq!(failure.detail.kind, ErrorKind::ValidationError);
    assert!(failure.detail.ai_log.is_some(), "diagnostic log context attached");
}

#[tokio::test]
async fn provider_exhaustion_becomes_errored_value() {
    let provider = MockProvider::new(|_, _| Err(ProviderError::AuthFailed("bad key".to_owned())));
    let driver = driver_with(provider);
    let p = Program::new("main.vibe").with_statements(vec![
        model_decl(),
        Stmt::let_untyped("r", do_expr("hi")),
        Stmt::let_untyped("after", e(Expr::int(1))),
    ]);
    let (result, _) = run_capture(&driver, &p).await;
    let outcome = result.unwrap();
    assert_eq!(outcome.state.status, Status::Completed);
    let r = outcome.state.lookup("r").unwrap();
    assert!(r.is_errored());
    let detail = r.error_details().unwrap();
    assert_eq!(detail.kind, ErrorKind::AIError);
    assert!(detail.message.contains("AuthFailed"));
    assert!(detail.ai_log.is_some());
    // Execution continued past the errored binding.
    assert_eq!(*outcome.state.lookup("after").unwrap().payload(), Payload::Int(1));
}

#[tokio::test]
async fn vibe_loop_executes_tools_and_feeds_results_back() {
    let provider = MockProvider::new(|index, request| {
        if index == 0 {
            Ok(AiResponse::tool_use(vec![ToolCallRequest {
                id: "tc1".to_owned(),
                name: "lookup".to_owned(),
                input: serde_json::json!({ "key": "city" }),
            }]))
        } else {
            // The tool result from the previous round came back.
            let fed_back = request
                .tool_results
                .iter()
                .any(|r| r.name == "lookup" && r.content == serde_json::json!("Paris"));
            assert!(fed_back, "tool result was not fed back");
            Ok(AiResponse::text("the city is Paris"))
        }
    });
    let mut tools = ToolRegistry::new();
    tools.register(
        "lookup",
        Arc::new(FnTool::new(|args| {
            assert_eq!(args["key"], "city");
            Ok(serde_json::json!("Paris"))
        })),
    );
    let driver = driver_with(provider.clone()).with_tools(tools);

    let p = Program::new("main.vibe").with_statements(vec![
        model_decl(),
        Stmt::let_untyped(
            "r",
            e(Expr::ai(AiOpKind::Vibe, e(Expr::text("find the city")), e(Expr::var("m")))),
        ),
    ]);
    let (result, _) = run_capture(&driver, &p).await;
    let outcome = result.unwrap();
    assert_eq!(
        *outcome.state.lookup("r").unwrap().payload(),
        Payload::Text("the city is Paris".to_owned())
    );
    assert_eq!(provider.call_count(), 2);
    assert_eq!(outcome.state.ai_interactions[0].rounds, 2);
}

#[tokio::test]
async fn retryable_provider_errors_are_retried() {
    let provider = MockProvider::new(|index, _| {
        if index == 0 {
            Err(ProviderError::RateLimited)
        } else {
            Ok(AiResponse::text("recovered"))
        }
    });
    let driver = driver_with(provider.clone());
    let p = Program::new("main.vibe").with_statements(vec![
        model_decl(),
        Stmt::let_untyped("r", do_expr("hi")),
    ]);
    let (result, _) = run_capture(&driver, &p).await;
    assert_eq!(
        *result.unwrap().state.lookup("r").unwrap().payload(),
        Payload::Text("recovered".to_owned())
    );
    assert_eq!(provider.call_count(), 2);
}

#[tokio::test]
async fn compress_summarizes_the_loop_scope() {
    let provider = MockProvider::new(|_, request| {
        assert_eq!(request.operation, vibe::OperationKind::Compress);
        assert!(request.prompt.contains("Summarize"), "{}", request.prompt);
        assert!(request.prompt.contains("item ="), "loop binding in prompt: {}", request.prompt);
        Ok(AiResponse::tool_use(vec![return_field_call(
            "tc1",
            "value",
            serde_json::json!("three items processed"),
        )]))
    });
    let driver = driver_with(provider.clone());
    let p = Program::new("main.vibe").with_statements(vec![
        model_decl(),
        Stmt::let_untyped("summary", e(Expr::text(""))),
        Stmt::For {
            var: "item".to_owned(),
            iterable: e(Expr::range(e(Expr::int(1)), e(Expr::int(3)))),
            body: vec![Stmt::assign(
                "summary",
                e(Expr::Compress {
                    model: Box::new(e(Expr::var("m"))),
                }),
            )],
        },
    ]);
    let (result, _) = run_capture(&driver, &p).await;
    let outcome = result.unwrap();
    assert_eq!(
        *outcome.state.lookup("summary").unwrap().payload(),
        Payload::Text("three items processed".to_owned())
    );
    assert_eq!(provider.call_count(), 3);
    // Compression shares the do- id counter.
    assert!(outcome.state.ai_interactions[0].id.starts_with("do-"));
}

#[tokio::test]
async fn interaction_log_records_ids_and_models() {
    let provider = MockProvider::new(|_, _| Ok(AiResponse::text("ok")));
    let driver = driver_with(provider);
    let p = Program::new("main.vibe").with_statements(vec![
        model_decl(),
        Stmt::let_untyped("a", do_expr("one")),
        Stmt::let_untyped("b", do_expr("two")),
    ]);
    let (result, _) = run_capture(&driver, &p).await;
    let outcome = result.unwrap();
    let ids: Vec<&str> = outcome.state.ai_interactions.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, vec!["do-000001", "do-000002"]);
    assert!(outcome.state.ai_interactions.iter().all(|i| i.model == "mock"));
}
