//! Import resolution.
//!
//! Runs before stepping begins: walks import statements depth-first,
//! detects cycles with a visiting set keyed by normalized absolute path,
//! and populates the module registries. Import problems are always fatal —
//! they surface before any statement executes.
//!
//! Module top-levels are restricted to constant declarations and function
//! definitions; their globals are folded at load time so module loading
//! never needs the step engine.

use std::path::{Component, Path, PathBuf};

use ahash::AHashSet;

use crate::{
    error::{ErrorDetails, RunFailure},
    host::{HostModuleLoader, Parser, system_tool_descriptors},
    program::{Expr, ExprLoc, ImportDecl, ImportKind, Literal, Program, Stmt, UnaryOp},
    state::{HostModule, ImportedNameInfo, RunState, VibeModule},
    value::{Payload, ValueSource, WrappedValue, validate_and_coerce},
};

/// Names that are auto-imported and can never be imported explicitly.
const CORE_BUILTINS: &[&str] = &["print", "env", "args", "hasArg", "defineArg", "ask"];

/// Exported names of the `system/utils` registry module.
pub const SYSTEM_UTILS: &[&str] = &["len", "keys", "values", "toJson", "fromJson"];

/// Source-reading seam so tests can load modules without touching disk.
pub trait ModuleSource: Send + Sync {
    fn read(&self, path: &Path) -> Result<String, ErrorDetails>;
}

/// Reads module sources from the filesystem.
pub struct FsModuleSource;

impl ModuleSource for FsModuleSource {
    fn read(&self, path: &Path) -> Result<String, ErrorDetails> {
        std::fs::read_to_string(path)
            .map_err(|e| ErrorDetails::import_error(format!("cannot read module '{}': {e}", path.display())))
    }
}

/// Map-backed module source, for tests.
#[derive(Default)]
pub struct MapModuleSource(pub ahash::AHashMap<String, String>);

impl ModuleSource for MapModuleSource {
    fn read(&self, path: &Path) -> Result<String, ErrorDetails> {
        let key = path.to_string_lossy();
        self.0
            .get(key.as_ref())
            .cloned()
            .ok_or_else(|| ErrorDetails::import_error(format!("cannot read module '{key}': not found")))
    }
}

/// Normalizes `.` and `..` segments without filesystem access, so module
/// cache keys are stable.
#[must_use]
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Loads every import of the program, depth-first. Fatal on cycles, unknown
/// system modules, missing exports, and attempts to import core builtins.
pub fn load_imports(
    state: &mut RunState,
    program: &Program,
    parser: &dyn Parser,
    host_loader: &dyn HostModuleLoader,
    source: &dyn ModuleSource,
) -> Result<(), RunFailure> {
    let base_dir = state.root_dir.clone();
    let mut visiting = AHashSet::new();
    let mut names = std::mem::take(&mut state.imported_names);
    for decl in &program.imports {
        load_one(state, decl, &base_dir, parser, host_loader, source, &mut visiting, &mut names)?;
    }
    state.imported_names = names;
    Ok(())
}

#[expect(clippy::too_many_arguments, reason = "recursive loader threads all registries")]
fn load_one(
    state: &mut RunState,
    decl: &ImportDecl,
    base_dir: &Path,
    parser: &dyn Parser,
    host_loader: &dyn HostModuleLoader,
    source: &dyn ModuleSource,
    visiting: &mut AHashSet<String>,
    names: &mut ahash::AHashMap<String, ImportedNameInfo>,
) -> Result<(), RunFailure> {
    for imported in &decl.names {
        if CORE_BUILTINS.contains(&imported.name.as_str()) {
            return Err(ErrorDetails::import_error(format!(
                "'{}' is a core builtin and cannot be imported",
                imported.name
            ))
            .into());
        }
    }
    match decl.kind {
        ImportKind::System => load_system(state, decl, names),
        ImportKind::Host => load_host(state, decl, base_dir, host_loader, names),
        ImportKind::Vibe => {
            let path = normalize_path(&base_dir.join(&decl.path));
            load_vibe_module(state, &path, parser, host_loader, source, visiting)?;
            let key = path.to_string_lossy().into_owned();
            let module = &state.vibe_modules[&key];
            for imported in &decl.names {
                let is_export = module.exports.contains(&imported.name);
                if !is_export {
                    return Err(ErrorDetails::import_error(format!(
                        "module '{}' has no export named '{}'",
                        decl.path, imported.name
                    ))
                    .into());
                }
                names.insert(
                    imported.local_name().to_owned(),
                    ImportedNameInfo {
                        source_path: key.clone(),
                        kind: ImportKind::Vibe,
                        original_name: imported.name.clone(),
                    },
                );
            }
            Ok(())
        }
    }
}

fn load_system(
    state: &mut RunState,
    decl: &ImportDecl,
    names: &mut ahash::AHashMap<String, ImportedNameInfo>,
) -> Result<(), RunFailure> {
    let exports: Vec<String> = match decl.path.as_str() {
        "system/utils" => SYSTEM_UTILS.iter().map(|s| (*s).to_owned()).collect(),
        "system/tools" => system_tool_descriptors().into_iter().map(|t| t.name).collect(),
        other => {
            return Err(ErrorDetails::import_error(format!("unknown system module '{other}'")).into());
        }
    };
    for imported in &decl.names {
        if !exports.contains(&imported.name) {
            return Err(ErrorDetails::import_error(format!(
                "system module '{}' has no export named '{}'",
                decl.path, imported.name
            ))
            .into());
        }
        names.insert(
            imported.local_name().to_owned(),
            ImportedNameInfo {
                source_path: decl.path.clone(),
                kind: ImportKind::System,
                original_name: imported.name.clone(),
            },
        );
        // Tool imports are also readable as tool values so scripts can put
        // them in a model's tool list. Calling a variable that holds one is
        // rejected at step time.
        if decl.path == "system/tools"
            && let Some(descriptor) = system_tool_descriptors().into_iter().find(|t| t.name == imported.name)
        {
            let mut value = WrappedValue::wrap(Payload::Tool(descriptor), ValueSource::ImportedFunction);
            value.is_const = true;
            if let Some(root) = state.call_stack.first_mut()
                && let Some(scope) = root.scopes.first_mut()
            {
                scope.vars.entry(imported.local_name().to_owned()).or_insert(value);
            }
        }
    }
    state
        .host_modules
        .entry(decl.path.clone())
        .or_insert_with(|| HostModule { exports });
    Ok(())
}

fn load_host(
    state: &mut RunState,
    decl: &ImportDecl,
    base_dir: &Path,
    host_loader: &dyn HostModuleLoader,
    names: &mut ahash::AHashMap<String, ImportedNameInfo>,
) -> Result<(), RunFailure> {
    let path = normalize_path(&base_dir.join(&decl.path));
    let key = path.to_string_lossy().into_owned();
    if !state.host_modules.contains_key(&key) {
        let exports = host_loader.load_host_module(&key)?;
        state.host_modules.insert(key.clone(), HostModule { exports });
    }
    let module = &state.host_modules[&key];
    for imported in &decl.names {
        if !module.exports.contains(&imported.name) {
            return Err(ErrorDetails::import_error(format!(
                "host module '{}' has no export named '{}'",
                decl.path, imported.name
            ))
            .into());
        }
        names.insert(
            imported.local_name().to_owned(),
            ImportedNameInfo {
                source_path: key.clone(),
                kind: ImportKind::Host,
                original_name: imported.name.clone(),
            },
        );
    }
    Ok(())
}

fn load_vibe_module(
    state: &mut RunState,
    path: &Path,
    parser: &dyn Parser,
    host_loader: &dyn HostModuleLoader,
    source: &dyn ModuleSource,
    visiting: &mut AHashSet<String>,
) -> Result<(), RunFailure> {
    let key = path.to_string_lossy().into_owned();
    if state.vibe_modules.contains_key(&key) {
        return Ok(());
    }
    if !visiting.insert(key.clone()) {
        return Err(ErrorDetails::import_error(format!("cyclic import involving '{key}'")).into());
    }

    let text = source.read(path)?;
    let program = parser.parse(&text, &key)?;

    // Load the module's own imports first (depth-first), into its private
    // name registry.
    let module_dir = path.parent().map_or_else(PathBuf::new, Path::to_path_buf);
    let mut module_names = ahash::AHashMap::new();
    for decl in &program.imports {
        load_one(
            state,
            decl,
            &module_dir,
            parser,
            host_loader,
            source,
            visiting,
            &mut module_names,
        )?;
    }

    let mut module = VibeModule {
        file: key.clone(),
        imported_names: module_names,
        ..VibeModule::default()
    };
    for ty in &program.type_defs {
        state.type_defs.entry(ty.name.clone()).or_insert_with(|| ty.clone());
    }
    for func in &program.functions {
        if !func.is_private {
            module.exports.insert(func.name.clone());
        }
        module.functions.insert(func.name.clone(), func.clone());
    }
    for stmt in &program.statements {
        fold_module_stmt(state, &mut module, stmt, &key)?;
    }

    visiting.remove(&key);
    state.vibe_modules.insert(key, module);
    Ok(())
}

/// Evaluates one module top-level statement at load time. Only constant
/// declarations are allowed; anything effectful belongs in a function.
fn fold_module_stmt(
    state: &RunState,
    module: &mut VibeModule,
    stmt: &Stmt,
    module_path: &str,
) -> Result<(), RunFailure> {
    let Stmt::Let {
        name,
        ty,
        init,
        is_const,
        is_private,
        is_async,
    } = stmt
    else {
        return Err(ErrorDetails::import_error(format!(
            "module '{module_path}' top level must contain only constant declarations and functions"
        ))
        .into());
    };
    if *is_async {
        return Err(ErrorDetails::import_error(format!(
            "module '{module_path}' cannot start async work at top level"
        ))
        .into());
    }
    let Some(payload) = fold_const_expr(init) else {
        return Err(ErrorDetails::import_error(format!(
            "module '{module_path}' global '{name}' must have a constant initializer"
        ))
        .into());
    };
    // Declared-type mismatch on a literal is fatal, same as in main code.
    let payload = match ty {
        Some(declared) => validate_and_coerce(payload, declared, name, state).map_err(RunFailure::from)?,
        None => payload,
    };
    let mut value = WrappedValue::wrap(payload, ValueSource::Literal);
    value.declared_type = ty.clone();
    value.is_const = *is_const;
    value.is_private = *is_private;
    if !is_private {
        module.exports.insert(name.clone());
    }
    module.globals.insert(name.clone(), value);
    Ok(())
}

/// Constant-folds a literal expression: literals, records and sequences of
/// literals, negation, and placeholder-free templates.
fn fold_const_expr(expr: &ExprLoc) -> Option<Payload> {
    match &expr.expr {
        Expr::Literal(Literal::Null) => Some(Payload::Null),
        Expr::Literal(Literal::Int(i)) => Some(Payload::Int(*i)),
        Expr::Literal(Literal::Float(f)) => Some(Payload::Float(*f)),
        Expr::Literal(Literal::Bool(b)) => Some(Payload::Bool(*b)),
        Expr::Literal(Literal::Text(s)) => Some(Payload::Text(s.clone())),
        Expr::Template(t) if !t.contains('{') => Some(Payload::Text(t.clone())),
        Expr::Unary {
            op: UnaryOp::Neg,
            operand,
        } => match fold_const_expr(operand)? {
            Payload::Int(i) => Some(Payload::Int(-i)),
            Payload::Float(f) => Some(Payload::Float(-f)),
            _ => None,
        },
        Expr::Record(fields) => {
            let mut record = indexmap::IndexMap::new();
            for (name, value) in fields {
                record.insert(name.clone(), fold_const_expr(value)?);
            }
            Some(Payload::Record(record))
        }
        Expr::Seq(items) => {
            let folded: Option<Vec<Payload>> = items.iter().map(fold_const_expr).collect();
            folded.map(Payload::Seq)
        }
        Expr::Range { start, end } => match (fold_const_expr(start)?, fold_const_expr(end)?) {
            (Payload::Int(a), Payload::Int(b)) => Some(Payload::Range { start: a, end: b }),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::program::{ImportedName, Span};

    struct StubParser;

    impl Parser for StubParser {
        fn parse(&self, source: &str, file: &str) -> Result<Program, ErrorDetails> {
            // Micro-format for tests: each line `const NAME = "TEXT"` or
            // `import NAME from PATH`.
            let mut program = Program::new(file);
            for line in source.lines().filter(|l| !l.trim().is_empty()) {
                let parts: Vec<&str> = line.split_whitespace().collect();
                match parts.as_slice() {
                    ["const", name, "=", rest] => {
                        program.statements.push(Stmt::Let {
                            name: (*name).to_owned(),
                            ty: None,
                            init: Expr::text(rest.trim_matches('"')).at(1, 1),
                            is_const: true,
                            is_private: false,
                            is_async: false,
                        });
                    }
                    ["import", name, "from", path] => {
                        program.imports.push(ImportDecl {
                            names: vec![ImportedName::plain(*name)],
                            path: (*path).to_owned(),
                            kind: ImportKind::Vibe,
                            span: Span::default(),
                        });
                    }
                    other => panic!("unparseable test line: {other:?}"),
                }
            }
            Ok(program)
        }
    }

    struct NoHostModules;

    #[async_trait::async_trait]
    impl HostModuleLoader for NoHostModules {
        fn load_host_module(&self, path: &str) -> Result<Vec<String>, ErrorDetails> {
            Err(ErrorDetails::import_error(format!("no host module '{path}'")))
        }

        async fn invoke(
            &self,
            _path: &str,
            _function: &str,
            _args: Vec<serde_json::Value>,
        ) -> Result<serde_json::Value, crate::host::HostFailure> {
            unreachable!("tests never invoke host modules")
        }
    }

    fn import_of(name: &str, path: &str, kind: ImportKind) -> ImportDecl {
        ImportDecl {
            names: vec![ImportedName::plain(name)],
            path: path.to_owned(),
            kind,
            span: Span::default(),
        }
    }

    #[test]
    fn loads_module_globals_and_exports() {
        let mut state = RunState::empty_for_tests();
        let mut program = Program::new("main.vibe");
        program.imports.push(import_of("greeting", "lib.vibe", ImportKind::Vibe));

        let mut sources = MapModuleSource::default();
        sources.0.insert("lib.vibe".to_owned(), "const greeting = \"hello\"".to_owned());

        load_imports(&mut state, &program, &StubParser, &NoHostModules, &sources).unwrap();
        let module = &state.vibe_modules["lib.vibe"];
        assert!(module.exports.contains("greeting"));
        assert_eq!(
            *module.globals["greeting"].payload(),
            Payload::Text("hello".to_owned())
        );
        assert_eq!(state.imported_names["greeting"].original_name, "greeting");
    }

    #[test]
    fn cyclic_import_is_fatal() {
        let mut state = RunState::empty_for_tests();
        let mut program = Program::new("main.vibe");
        program.imports.push(import_of("a", "a.vibe", ImportKind::Vibe));

        let mut sources = MapModuleSource::default();
        sources.0.insert(
            "a.vibe".to_owned(),
            "import b from b.vibe\nconst a = \"A\"".to_owned(),
        );
        sources.0.insert(
            "b.vibe".to_owned(),
            "import a from a.vibe\nconst b = \"B\"".to_owned(),
        );

        let err = load_imports(&mut state, &program, &StubParser, &NoHostModules, &sources).unwrap_err();
        assert!(err.detail.message.contains("cyclic import"), "{}", err.detail.message);
    }

    #[test]
    fn unknown_system_module_is_fatal() {
        let mut state = RunState::empty_for_tests();
        let mut program = Program::new("main.vibe");
        program
            .imports
            .push(import_of("nope", "system", ImportKind::System));
        let err =
            load_imports(&mut state, &program, &StubParser, &NoHostModules, &MapModuleSource::default()).unwrap_err();
        assert!(err.detail.message.contains("unknown system module"));
    }

    #[test]
    fn importing_core_builtin_is_fatal() {
        let mut state = RunState::empty_for_tests();
        let mut program = Program::new("main.vibe");
        program
            .imports
            .push(import_of("print", "system/utils", ImportKind::System));
        let err =
            load_imports(&mut state, &program, &StubParser, &NoHostModules, &MapModuleSource::default()).unwrap_err();
        assert!(err.detail.message.contains("core builtin"));
    }

    #[test]
    fn missing_export_is_fatal() {
        let mut state = RunState::empty_for_tests();
        let mut program = Program::new("main.vibe");
        program.imports.push(import_of("absent", "lib.vibe", ImportKind::Vibe));
        let mut sources = MapModuleSource::default();
        sources.0.insert("lib.vibe".to_owned(), "const greeting = \"hi\"".to_owned());
        let err = load_imports(&mut state, &program, &StubParser, &NoHostModules, &sources).unwrap_err();
        assert!(err.detail.message.contains("no export named 'absent'"));
    }

    #[test]
    fn system_tools_import_resolves() {
        let mut state = RunState::empty_for_tests();
        let mut program = Program::new("main.vibe");
        program
            .imports
            .push(import_of("readFile", "system/tools", ImportKind::System));
        load_imports(&mut state, &program, &StubParser, &NoHostModules, &MapModuleSource::default()).unwrap();
        assert_eq!(state.imported_names["readFile"].kind, ImportKind::System);
    }

    #[test]
    fn normalize_path_collapses_dots() {
        assert_eq!(
            normalize_path(Path::new("a/b/../c/./d.vibe")),
            PathBuf::from("a/c/d.vibe")
        );
    }
}
