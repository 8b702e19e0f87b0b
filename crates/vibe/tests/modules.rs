//! Module isolation: imported functions resolve free names in their home
//! module, never the caller's.

mod common;

use std::sync::Arc;

use common::{e, run_capture};
use pretty_assertions::assert_eq;
use vibe::{
    Driver, ErrorDetails, Expr, FunctionDef, ImportDecl, ImportKind, ImportedName, MapModuleSource, Parser, Payload,
    Program, Span, Stmt,
};

/// Parser double that ignores source text and returns prebuilt trees.
struct FixedParser(ahash::AHashMap<String, Program>);

impl Parser for FixedParser {
    fn parse(&self, _source: &str, file: &str) -> Result<Program, ErrorDetails> {
        self.0
            .get(file)
            .cloned()
            .ok_or_else(|| ErrorDetails::import_error(format!("no fixture for '{file}'")))
    }
}

fn module_a() -> Program {
    let mut p = Program::new("a.vibe");
    p.statements.push(Stmt::Let {
        name: "x".to_owned(),
        ty: None,
        init: e(Expr::text("A")),
        is_const: true,
        is_private: false,
        is_async: false,
    });
    p.functions.push(FunctionDef {
        name: "getX".to_owned(),
        params: vec![],
        body: vec![Stmt::Return {
            value: Some(e(Expr::var("x"))),
            span: Span::new(2, 5),
        }],
        is_private: false,
        span: Span::new(1, 1),
    });
    p
}

fn driver_with_module_a() -> Driver {
    let mut fixtures = ahash::AHashMap::new();
    fixtures.insert("a.vibe".to_owned(), module_a());
    let mut sources = MapModuleSource::default();
    sources.0.insert("a.vibe".to_owned(), String::new());
    Driver::new()
        .with_parser(Arc::new(FixedParser(fixtures)))
        .with_module_source(Arc::new(sources))
}

#[tokio::test]
async fn imported_function_reads_its_own_module_globals() {
    let mut p = Program::new("main.vibe").with_statements(vec![
        Stmt::Let {
            name: "x".to_owned(),
            ty: None,
            init: e(Expr::text("MAIN")),
            is_const: true,
            is_private: false,
            is_async: false,
        },
        Stmt::let_untyped("r", e(Expr::call("getX", vec![]))),
    ]);
    p.imports.push(ImportDecl {
        names: vec![ImportedName::plain("getX")],
        path: "a.vibe".to_owned(),
        kind: ImportKind::Vibe,
        span: Span::default(),
    });

    let (result, _) = run_capture(&driver_with_module_a(), &p).await;
    let outcome = result.unwrap();
    assert_eq!(
        *outcome.state.lookup("r").unwrap().payload(),
        Payload::Text("A".to_owned())
    );
    // The caller's own binding is untouched.
    assert_eq!(
        *outcome.state.lookup("x").unwrap().payload(),
        Payload::Text("MAIN".to_owned())
    );
}

#[tokio::test]
async fn imported_value_resolves_from_exports() {
    let mut p = Program::new("main.vibe").with_statements(vec![Stmt::let_untyped("copy", e(Expr::var("x")))]);
    p.imports.push(ImportDecl {
        names: vec![ImportedName {
            name: "x".to_owned(),
            alias: Some("x".to_owned()),
        }],
        path: "a.vibe".to_owned(),
        kind: ImportKind::Vibe,
        span: Span::default(),
    });

    let (result, _) = run_capture(&driver_with_module_a(), &p).await;
    assert_eq!(
        *result.unwrap().state.lookup("copy").unwrap().payload(),
        Payload::Text("A".to_owned())
    );
}

#[tokio::test]
async fn private_module_functions_are_not_importable() {
    let mut module = module_a();
    module.functions[0].is_private = true;
    let mut fixtures = ahash::AHashMap::new();
    fixtures.insert("a.vibe".to_owned(), module);
    let mut sources = MapModuleSource::default();
    sources.0.insert("a.vibe".to_owned(), String::new());
    let driver = Driver::new()
        .with_parser(Arc::new(FixedParser(fixtures)))
        .with_module_source(Arc::new(sources));

    let mut p = Program::new("main.vibe");
    p.imports.push(ImportDecl {
        names: vec![ImportedName::plain("getX")],
        path: "a.vibe".to_owned(),
        kind: ImportKind::Vibe,
        span: Span::default(),
    });
    let (result, _) = run_capture(&driver, &p).await;
    let failure = result.unwrap_err();
    assert!(failure.detail.message.contains("no export named 'getX'"));
}
