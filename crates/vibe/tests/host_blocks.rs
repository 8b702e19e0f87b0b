//! Embedded host blocks and imported host-language functions: parameter
//! binding, sync-fatal vs async-errored failure policy, and the stack-trace
//! error format.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use common::{e, run_capture};
use pretty_assertions::assert_eq;
use vibe::{
    Driver, ErrorDetails, ErrorKind, Expr, HostBlockEvaluator, HostFailure, HostModuleLoader, ImportDecl,
    ImportKind, ImportedName, ParamExpr, PathSeg, Payload, Program, SourceLoc, Span, Status, Stmt,
};

/// Evaluator double: `sum` adds its numeric parameters; `boom` throws with
/// a host stack trace; anything else echoes its parameter names.
struct ScriptedEvaluator;

#[async_trait]
impl HostBlockEvaluator for ScriptedEvaluator {
    async fn eval_host_block(
        &self,
        params: &[String],
        body: &str,
        values: Vec<serde_json::Value>,
        _location: &SourceLoc,
    ) -> Result<serde_json::Value, HostFailure> {
        match body.trim() {
            "sum" => {
                let total: i64 = values.iter().filter_map(serde_json::Value::as_i64).sum();
                Ok(serde_json::json!(total))
            }
            "boom" => Err(HostFailure::new("kaboom").with_stack("at eval (block.ts:2:5)")),
            _ => Ok(serde_json::json!(params.join(","))),
        }
    }
}

fn host_driver() -> Driver {
    Driver::new().with_host_evaluator(Arc::new(ScriptedEvaluator))
}

fn block(params: Vec<ParamExpr>, body: &str) -> Expr {
    Expr::HostBlock {
        params,
        body: body.to_owned(),
    }
}

#[tokio::test]
async fn host_block_receives_parameter_values_in_order() {
    let p = Program::new("main.vibe").with_statements(vec![
        Stmt::let_untyped("a", e(Expr::int(30))),
        Stmt::let_untyped("b", e(Expr::int(12))),
        Stmt::let_untyped(
            "r",
            e(block(vec![ParamExpr::name("a"), ParamExpr::name("b")], "sum")),
        ),
    ]);
    let (result, _) = run_capture(&host_driver(), &p).await;
    let outcome = result.unwrap();
    let r = outcome.state.lookup("r").unwrap();
    assert_eq!(*r.payload(), Payload::Int(42));
    assert_eq!(r.source, vibe::ValueSource::HostBlock);
}

#[tokio::test]
async fn host_block_params_support_paths_slices_and_aliases() {
    let p = Program::new("main.vibe").with_statements(vec![
        Stmt::let_untyped(
            "obj",
            e(Expr::Record(vec![(
                "nums".to_owned(),
                e(Expr::Seq(vec![e(Expr::int(40)), e(Expr::int(2)), e(Expr::int(99))])),
            )])),
        ),
        Stmt::let_untyped(
            "r",
            e(block(
                vec![
                    ParamExpr {
                        alias: Some("first".to_owned()),
                        root: "obj".to_owned(),
                        path: vec![PathSeg::Field("nums".to_owned()), PathSeg::Index(0)],
                    },
                    ParamExpr {
                        alias: None,
                        root: "obj".to_owned(),
                        path: vec![PathSeg::Field("nums".to_owned()), PathSeg::Index(-2)],
                    },
                ],
                "sum",
            )),
        ),
    ]);
    let (result, _) = run_capture(&host_driver(), &p).await;
    assert_eq!(*result.unwrap().state.lookup("r").unwrap().payload(), Payload::Int(42));
}

#[tokio::test]
async fn sync_host_block_failure_is_fatal_with_stack_trace() {
    let p = Program::new("main.vibe").with_statements(vec![Stmt::let_untyped(
        "r",
        block(vec![], "boom").at(4, 9),
    )]);
    let (result, _) = run_capture(&host_driver(), &p).await;
    let failure = result.unwrap_err();
    assert_eq!(failure.detail.kind, ErrorKind::TsBlockError);
    let formatted = failure.to_string();
    assert!(formatted.starts_with("[main.vibe:4:9] kaboom"), "{formatted}");
    assert!(formatted.contains("TypeScript stack trace:\nat eval (block.ts:2:5)"), "{formatted}");
}

#[tokio::test]
async fn async_host_block_failure_becomes_an_errored_value() {
    let p = Program::new("main.vibe").with_statements(vec![
        Stmt::let_async("r", None, e(block(vec![], "boom"))),
        Stmt::let_untyped("flag", e(Expr::member(e(Expr::var("r")), "err"))),
        Stmt::let_untyped("after", e(Expr::int(1))),
    ]);
    let (result, _) = run_capture(&host_driver(), &p).await;
    let outcome = result.unwrap();
    assert_eq!(outcome.state.status, Status::Completed);
    assert_eq!(*outcome.state.lookup("flag").unwrap().payload(), Payload::Bool(true));
    let r = outcome.state.lookup("r").unwrap();
    assert_eq!(r.error_details().unwrap().kind, ErrorKind::TsBlockError);
    assert_eq!(*outcome.state.lookup("after").unwrap().payload(), Payload::Int(1));
}

/// Host-module double exporting a single `greet` function.
struct GreeterModule;

#[async_trait]
impl HostModuleLoader for GreeterModule {
    fn load_host_module(&self, path: &str) -> Result<Vec<String>, ErrorDetails> {
        if path.ends_with("helpers.ts") {
            Ok(vec!["greet".to_owned()])
        } else {
            Err(ErrorDetails::import_error(format!("no host module '{path}'")))
        }
    }

    async fn invoke(
        &self,
        _path: &str,
        function: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, HostFailure> {
        match function {
            "greet" => {
                let name = args.first().and_then(|a| a.as_str()).unwrap_or("world");
                Ok(serde_json::json!(format!("hello {name}")))
            }
            other => Err(HostFailure::new(format!("no export '{other}'"))),
        }
    }
}

#[tokio::test]
async fn imported_host_function_invokes_through_the_loader() {
    let mut p = Program::new("main.vibe").with_statements(vec![Stmt::let_untyped(
        "greeting",
        e(Expr::call("greet", vec![e(Expr::text("vibe"))])),
    )]);
    p.imports.push(ImportDecl {
        names: vec![ImportedName::plain("greet")],
        path: "helpers.ts".to_owned(),
        kind: ImportKind::Host,
        span: Span::default(),
    });
    let driver = Driver::new().with_host_modules(Arc::new(GreeterModule));
    let (result, _) = run_capture(&driver, &p).await;
    let outcome = result.unwrap();
    let greeting = outcome.state.lookup("greeting").unwrap();
    assert_eq!(*greeting.payload(), Payload::Text("hello vibe".to_owned()));
    assert_eq!(greeting.source, vibe::ValueSource::ImportedFunction);
}

#[tokio::test]
async fn missing_host_export_fails_at_import_time() {
    let mut p = Program::new("main.vibe");
    p.imports.push(ImportDecl {
        names: vec![ImportedName::plain("absent")],
        path: "helpers.ts".to_owned(),
        kind: ImportKind::Host,
        span: Span::default(),
    });
    let driver = Driver::new().with_host_modules(Arc::new(GreeterModule));
    let (result, _) = run_capture(&driver, &p).await;
    let failure = result.unwrap_err();
    assert!(failure.detail.message.contains("no export named 'absent'"));
}
