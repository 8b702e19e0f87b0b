//! The pre-parsed program tree the runtime consumes.
//!
//! Parsing and semantic analysis are external collaborators: a parser
//! capability produces this tree with per-node source spans already
//! validated. The runtime never sees source text except for embedded
//! host-block bodies and template strings, which it carries verbatim.

use serde::{Deserialize, Serialize};

use crate::value::{DeclaredType, StructuralType};

/// Source position of a node, 1-based. The owning [`Program`] carries the
/// file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Span {
    pub line: u32,
    pub column: u32,
}

impl Span {
    #[must_use]
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

/// Binary operators. Logical `and`/`or` operate on strict booleans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    /// Operator spelling for error messages.
    #[must_use]
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Mod => "%",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::And => "and",
            Self::Or => "or",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Not,
}

/// Literal values as they appear in source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

/// The two prompt-driven LM operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AiOpKind {
    /// Single-shot prompt, optionally with a typed return.
    Do,
    /// Tool-augmented conversation with a longer tool loop.
    Vibe,
}

/// One segment of a restricted parameter path: `.field`, `[i]`, or `[a:b]`.
///
/// Indexes are signed; negative values index from the end. Slices follow
/// half-open semantics with either bound optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathSeg {
    Field(String),
    Index(i64),
    Slice(Option<i64>, Option<i64>),
}

/// A restricted host-block parameter expression: a root identifier followed
/// by dotted / indexed / sliced segments, optionally renamed with `alias=`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamExpr {
    /// Name the value is exposed under inside the block. Defaults to the
    /// root identifier when no alias is given.
    pub alias: Option<String>,
    pub root: String,
    pub path: Vec<PathSeg>,
}

impl ParamExpr {
    #[must_use]
    pub fn name(root: impl Into<String>) -> Self {
        Self {
            alias: None,
            root: root.into(),
            path: Vec::new(),
        }
    }

    /// The parameter name passed to the host evaluator.
    #[must_use]
    pub fn binding_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.root)
    }
}

/// An expression with its source span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExprLoc {
    pub expr: Expr,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Literal(Literal),
    /// A template string with `{name}` placeholders expanded by scope
    /// lookup; dot-paths and bracket indexing honored, undefined paths left
    /// literal.
    Template(String),
    Var(String),
    Record(Vec<(String, ExprLoc)>),
    Seq(Vec<ExprLoc>),
    Unary {
        op: UnaryOp,
        operand: Box<ExprLoc>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<ExprLoc>,
        rhs: Box<ExprLoc>,
    },
    Member {
        base: Box<ExprLoc>,
        field: String,
    },
    Index {
        base: Box<ExprLoc>,
        index: Box<ExprLoc>,
    },
    SliceOf {
        base: Box<ExprLoc>,
        start: Option<Box<ExprLoc>>,
        end: Option<Box<ExprLoc>>,
    },
    /// `a..b` — evaluates to a range payload, iterated inclusively.
    Range {
        start: Box<ExprLoc>,
        end: Box<ExprLoc>,
    },
    Call {
        name: String,
        args: Vec<ExprLoc>,
    },
    /// `do "prompt" model` / `vibe "prompt" model`.
    Ai {
        kind: AiOpKind,
        prompt: Box<ExprLoc>,
        model: Box<ExprLoc>,
    },
    /// An embedded host-language block with its parameter expressions.
    HostBlock {
        params: Vec<ParamExpr>,
        body: String,
    },
    /// `compress model` — summarize the innermost loop scope.
    Compress {
        model: Box<ExprLoc>,
    },
}

impl Expr {
    #[must_use]
    pub fn at(self, line: u32, column: u32) -> ExprLoc {
        ExprLoc {
            expr: self,
            span: Span::new(line, column),
        }
    }

    #[must_use]
    pub fn int(value: i64) -> Self {
        Self::Literal(Literal::Int(value))
    }

    #[must_use]
    pub fn float(value: f64) -> Self {
        Self::Literal(Literal::Float(value))
    }

    #[must_use]
    pub fn bool(value: bool) -> Self {
        Self::Literal(Literal::Bool(value))
    }

    #[must_use]
    pub fn text(value: impl Into<String>) -> Self {
        Self::Literal(Literal::Text(value.into()))
    }

    #[must_use]
    pub fn null() -> Self {
        Self::Literal(Literal::Null)
    }

    #[must_use]
    pub fn var(name: impl Into<String>) -> Self {
        Self::Var(name.into())
    }

    #[must_use]
    pub fn binary(op: BinaryOp, lhs: ExprLoc, rhs: ExprLoc) -> Self {
        Self::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    #[must_use]
    pub fn call(name: impl Into<String>, args: Vec<ExprLoc>) -> Self {
        Self::Call {
            name: name.into(),
            args,
        }
    }

    #[must_use]
    pub fn range(start: ExprLoc, end: ExprLoc) -> Self {
        Self::Range {
            start: Box::new(start),
            end: Box::new(end),
        }
    }

    #[must_use]
    pub fn member(base: ExprLoc, field: impl Into<String>) -> Self {
        Self::Member {
            base: Box::new(base),
            field: field.into(),
        }
    }

    #[must_use]
    pub fn ai(kind: AiOpKind, prompt: ExprLoc, model: ExprLoc) -> Self {
        Self::Ai {
            kind,
            prompt: Box::new(prompt),
            model: Box::new(model),
        }
    }
}

/// Assignment target: a root name plus optional field/index path.
/// Slices are not assignable and are rejected at step time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignTarget {
    pub root: String,
    pub path: Vec<PathSeg>,
}

impl AssignTarget {
    #[must_use]
    pub fn name(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            path: Vec::new(),
        }
    }
}

/// One destructuring field of `let {name: type, ...} = ...`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestructureField {
    pub name: String,
    pub ty: DeclaredType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    Let {
        name: String,
        ty: Option<DeclaredType>,
        init: ExprLoc,
        is_const: bool,
        is_private: bool,
        /// `async let` — schedule the initializer and continue.
        is_async: bool,
    },
    /// `let {a: text, b: number} = ...` — multi-field structured binding.
    LetDestructure {
        fields: Vec<DestructureField>,
        init: ExprLoc,
        is_async: bool,
    },
    Assign {
        target: AssignTarget,
        value: ExprLoc,
    },
    Expr(ExprLoc),
    If {
        cond: ExprLoc,
        then_body: Vec<Stmt>,
        else_body: Vec<Stmt>,
    },
    For {
        var: String,
        iterable: ExprLoc,
        body: Vec<Stmt>,
    },
    Return {
        value: Option<ExprLoc>,
        span: Span,
    },
    Throw {
        message: ExprLoc,
        span: Span,
    },
}

impl Stmt {
    /// `let name = init` with no annotations.
    #[must_use]
    pub fn let_untyped(name: impl Into<String>, init: ExprLoc) -> Self {
        Self::Let {
            name: name.into(),
            ty: None,
            init,
            is_const: false,
            is_private: false,
            is_async: false,
        }
    }

    /// `let name: ty = init`.
    #[must_use]
    pub fn let_typed(name: impl Into<String>, ty: DeclaredType, init: ExprLoc) -> Self {
        Self::Let {
            name: name.into(),
            ty: Some(ty),
            init,
            is_const: false,
            is_private: false,
            is_async: false,
        }
    }

    /// `async let name = init`.
    #[must_use]
    pub fn let_async(name: impl Into<String>, ty: Option<DeclaredType>, init: ExprLoc) -> Self {
        Self::Let {
            name: name.into(),
            ty,
            init,
            is_const: false,
            is_private: false,
            is_async: true,
        }
    }

    #[must_use]
    pub fn assign(name: impl Into<String>, value: ExprLoc) -> Self {
        Self::Assign {
            target: AssignTarget::name(name),
            value,
        }
    }
}

/// A user-defined function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
    pub is_private: bool,
    pub span: Span,
}

/// Where an import resolves from, decided by the parser from the path shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportKind {
    /// Another Vibe script, loaded and cached by absolute path.
    Vibe,
    /// A host-language module, loaded through the host-module capability.
    Host,
    /// A fixed registry entry (`system/utils`, `system/tools`).
    System,
}

/// One imported name, optionally renamed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportedName {
    pub name: String,
    pub alias: Option<String>,
}

impl ImportedName {
    #[must_use]
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
        }
    }

    #[must_use]
    pub fn local_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportDecl {
    pub names: Vec<ImportedName>,
    pub path: String,
    pub kind: ImportKind,
    pub span: Span,
}

/// A fully parsed, validated program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    /// Script file name, used in error locations.
    pub file: String,
    pub imports: Vec<ImportDecl>,
    pub type_defs: Vec<StructuralType>,
    pub functions: Vec<FunctionDef>,
    pub statements: Vec<Stmt>,
}

impl Program {
    /// An empty program for the given file, to be filled by a builder or a
    /// deserializer.
    #[must_use]
    pub fn new(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            imports: Vec::new(),
            type_defs: Vec::new(),
            functions: Vec::new(),
            statements: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_statements(mut self, statements: Vec<Stmt>) -> Self {
        self.statements = statements;
        self
    }

    #[must_use]
    pub fn with_functions(mut self, functions: Vec<FunctionDef>) -> Self {
        self.functions = functions;
        self
    }
}
