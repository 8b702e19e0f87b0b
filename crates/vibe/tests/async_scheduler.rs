//! Driver-level tests of asynchronous starts: wave parallelism, implicit
//! joins, isolation of concurrent function bodies, and failure containment.

mod common;

use std::time::{Duration, Instant};

use common::{MockProvider, driver_with, e, model_decl, run_capture};
use pretty_assertions::assert_eq;
use vibe::{
    AiOpKind, AiResponse, BinaryOp, Driver, Expr, FunctionDef, Payload, Program, ProviderError, Span, Status, Stmt,
};

fn ai_let(name: &str, prompt: &str) -> Stmt {
    Stmt::let_async(
        name,
        None,
        e(Expr::ai(AiOpKind::Do, e(Expr::text(prompt)), e(Expr::var("m")))),
    )
}

#[tokio::test]
async fn three_parallel_starts_overlap() {
    // Each call takes 75 ms; three sequential calls would need 225 ms.
    let provider = MockProvider::with_latency(Duration::from_millis(75), |_, request| {
        Ok(AiResponse::text(match request.prompt.as_str() {
            "p1" => "r1",
            "p2" => "r2",
            _ => "r3",
        }))
    });
    let driver = driver_with(provider.clone());
    let p = Program::new("main.vibe").with_statements(vec![
        model_decl(),
        ai_let("a", "p1"),
        ai_let("b", "p2"),
        ai_let("c", "p3"),
        Stmt::let_untyped(
            "total",
            e(Expr::binary(
                BinaryOp::Add,
                e(Expr::binary(BinaryOp::Add, e(Expr::var("a")), e(Expr::var("b")))),
                e(Expr::var("c")),
            )),
        ),
    ]);

    let started = Instant::now();
    let (result, _) = run_capture(&driver, &p).await;
    let elapsed = started.elapsed();

    let outcome = result.unwrap();
    assert_eq!(outcome.state.status, Status::Completed);
    // Results concatenate in declaration order regardless of completion order.
    assert_eq!(
        *outcome.state.lookup("total").unwrap().payload(),
        Payload::Text("r1r2r3".to_owned())
    );
    assert_eq!(provider.call_count(), 3);
    assert!(
        elapsed < Duration::from_millis(200),
        "three 75 ms starts should overlap, took {elapsed:?}"
    );
}

#[tokio::test]
async fn unread_starts_join_at_the_block_boundary() {
    let provider = MockProvider::new(|_, _| Ok(AiResponse::text("done")));
    let driver = driver_with(provider.clone());
    let p = Program::new("main.vibe").with_statements(vec![
        model_decl(),
        ai_let("fire_and_forget", "p"),
        Stmt::let_untyped("x", e(Expr::int(1))),
    ]);
    let (result, _) = run_capture(&driver, &p).await;
    let outcome = result.unwrap();
    assert_eq!(outcome.state.status, Status::Completed);
    // The run did not finish before the start was serviced.
    assert_eq!(provider.call_count(), 1);
    assert!(outcome.state.pending_async_ids.is_empty());
}

#[tokio::test]
async fn isolated_invocation_discards_local_mutations() {
    let p = Program::new("main.vibe")
        .with_functions(vec![FunctionDef {
            name: "bump".to_owned(),
            params: vec![],
            body: vec![
                Stmt::assign(
                    "counter",
                    e(Expr::binary(BinaryOp::Add, e(Expr::var("counter")), e(Expr::int(1)))),
                ),
                Stmt::Return {
                    value: Some(e(Expr::int(5))),
                    span: Span::new(3, 5),
                },
            ],
            is_private: false,
            span: Span::new(1, 1),
        }])
        .with_statements(vec![
            Stmt::let_untyped("counter", e(Expr::int(0))),
            Stmt::let_async("v", None, e(Expr::call("bump", vec![]))),
            Stmt::let_untyped(
                "r",
                e(Expr::binary(BinaryOp::Add, e(Expr::var("v")), e(Expr::int(1)))),
            ),
        ]);
    let (result, _) = run_capture(&Driver::new(), &p).await;
    let outcome = result.unwrap();
    assert_eq!(*outcome.state.lookup("r").unwrap().payload(), Payload::Int(6));
    // The isolated body's write to the global is invisible here.
    assert_eq!(*outcome.state.lookup("counter").unwrap().payload(), Payload::Int(0));
}

#[tokio::test]
async fn one_failed_start_does_not_abort_its_wave() {
    let provider = MockProvider::new(|_, request| {
        if request.prompt == "bad" {
            Err(ProviderError::AuthFailed("key rejected".to_owned()))
        } else {
            Ok(AiResponse::text("fine"))
        }
    });
    let driver = driver_with(provider.clone());
    let p = Program::new("main.vibe").with_statements(vec![
        model_decl(),
        ai_let("good", "ok"),
        ai_let("broken", "bad"),
        Stmt::let_untyped("g", e(Expr::var("good"))),
        Stmt::let_untyped("b", e(Expr::var("broken"))),
    ]);
    let (result, _) = run_capture(&driver, &p).await;
    let outcome = result.unwrap();
    assert_eq!(outcome.state.status, Status::Completed);
    assert_eq!(
        *outcome.state.lookup("g").unwrap().payload(),
        Payload::Text("fine".to_owned())
    );
    let broken = outcome.state.lookup("b").unwrap();
    assert!(broken.is_errored());
    assert!(broken.error_details().unwrap().message.contains("key rejected"));
}

#[tokio::test]
async fn async_function_result_keeps_declaration_semantics() {
    // An async start on a pure function behaves like the sync call, only
    // joined later.
    let p = Program::new("main.vibe")
        .with_functions(vec![FunctionDef {
            name: "double".to_owned(),
            params: vec!["n".to_owned()],
            body: vec![Stmt::Return {
                value: Some(e(Expr::binary(BinaryOp::Mul, e(Expr::var("n")), e(Expr::int(2))))),
                span: Span::new(2, 5),
            }],
            is_private: false,
            span: Span::new(1, 1),
        }])
        .with_statements(vec![
            Stmt::let_async("a", None, e(Expr::call("double", vec![e(Expr::int(21))]))),
            Stmt::let_untyped("out", e(Expr::var("a"))),
        ]);
    let (result, _) = run_capture(&Driver::new(), &p).await;
    let outcome = result.unwrap();
    let out = outcome.state.lookup("out").unwrap();
    assert_eq!(*out.payload(), Payload::Int(42));
    assert_eq!(out.source, vibe::ValueSource::VibeFunction);
}
