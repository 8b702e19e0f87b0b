//! Error model for the runtime.
//!
//! Errors come in two strengths. A *fatal* error stops the program with
//! `Status::Error` and surfaces through [`RunFailure`]. An *errored value*
//! turns the offending binding into a wrapped value whose error detail is
//! observable from script code via `.err` / `.errDetails`, and execution
//! continues. Only scope, import, validation, and synchronous host-block
//! failures are fatal; LM, tool, and async host failures become errored
//! values at the binding site.

use std::fmt::{self, Display, Write};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

/// Classification of a runtime error.
///
/// Uses strum derives for automatic `Display`, `FromStr`, and `Into<&'static str>`
/// implementations. The string form is what script code reads from
/// `.errDetails.type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Failed coercion, arithmetic on null or errored operands, non-boolean condition.
    ValueError,
    /// Undefined name, calling a non-function, calling a tool directly.
    ScopeError,
    /// Missing export, unknown system module, cyclic import.
    ImportError,
    /// An embedded host-language block threw.
    TsBlockError,
    /// Provider failure that exhausted retries.
    AIError,
    /// A structured return failed its declared type check.
    ValidationError,
    /// `throw` from script code.
    UserThrow,
    /// A tool invocation threw.
    ToolError,
    /// Internal invariant violation in the runtime itself.
    InternalError,
    /// Controlled process exit requested by `defineArg` (`--help`, missing required).
    Exit,
}

/// Source position within a script file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLoc {
    /// Script file the error originated in.
    pub file: String,
    /// 1-based line.
    pub line: u32,
    /// 1-based column.
    pub column: u32,
}

impl SourceLoc {
    pub fn new(file: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            file: file.into(),
            line,
            column,
        }
    }
}

impl Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// Diagnostic context attached to errors produced by the LM engine.
///
/// Carries the message sequence and raw provider response so that a failed
/// interaction can be written to a diagnostic file by the embedder. Script
/// code never observes this directly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AiLogContext {
    /// Serialized request/response messages, in exchange order.
    pub messages: Vec<serde_json::Value>,
    /// The raw final provider response, when one was received.
    pub raw_response: Option<serde_json::Value>,
}

/// Full detail of a runtime error.
///
/// This is the payload of errored wrapped values and of fatal failures
/// alike; the two differ only in how the step engine routes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Human-readable message. What `.errDetails.message` reads.
    pub message: String,
    /// Error classification. What `.errDetails.type` reads.
    pub kind: ErrorKind,
    /// Script location the error is attributed to, when known.
    pub location: Option<SourceLoc>,
    /// Original host-language stack trace, for host-block errors.
    pub host_stack: Option<String>,
    /// Diagnostic attachment for LM failures.
    pub ai_log: Option<AiLogContext>,
    /// Requested process exit code, for `ErrorKind::Exit` only.
    pub exit_code: Option<i32>,
}

impl ErrorDetails {
    /// Creates an error detail with just a kind and message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind,
            location: None,
            host_stack: None,
            ai_log: None,
            exit_code: None,
        }
    }

    /// Attaches a source location, replacing any previous one.
    #[must_use]
    pub fn at(mut self, location: SourceLoc) -> Self {
        self.location = Some(location);
        self
    }

    /// Attaches a source location if none is set yet.
    #[must_use]
    pub fn or_at(mut self, location: &SourceLoc) -> Self {
        if self.location.is_none() {
            self.location = Some(location.clone());
        }
        self
    }

    /// Attaches the original host-language stack trace.
    #[must_use]
    pub fn with_host_stack(mut self, stack: impl Into<String>) -> Self {
        self.host_stack = Some(stack.into());
        self
    }

    /// Attaches LM diagnostic context.
    #[must_use]
    pub fn with_ai_log(mut self, log: AiLogContext) -> Self {
        self.ai_log = Some(log);
        self
    }

    /// Formats the error the way the driver surfaces fatal failures:
    /// `[<file>:<line>:<col>] <message>`, with the host stack trace appended
    /// when one was captured.
    #[must_use]
    pub fn format(&self) -> String {
        let mut out = String::new();
        if let Some(loc) = &self.location {
            let _ = write!(out, "[{loc}] ");
        }
        out.push_str(&self.message);
        if let Some(stack) = &self.host_stack {
            let _ = write!(out, "\nTypeScript stack trace:\n{stack}");
        }
        out
    }

    // --- constructors for the common kinds, mirroring how the step engine raises them ---

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValueError, message)
    }

    pub fn scope_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ScopeError, message)
    }

    pub fn undefined(name: &str) -> Self {
        Self::new(ErrorKind::ScopeError, format!("undefined '{name}'"))
    }

    pub fn import_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ImportError, message)
    }

    pub fn ts_block_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TsBlockError, message)
    }

    pub fn ai_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AIError, message)
    }

    pub fn validation_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationError, message)
    }

    pub fn user_throw(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UserThrow, message)
    }

    pub fn tool_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ToolError, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }

    /// Controlled exit with the given process code (used by `defineArg`).
    pub fn exit(code: i32, message: impl Into<String>) -> Self {
        let mut detail = Self::new(ErrorKind::Exit, message);
        detail.exit_code = Some(code);
        detail
    }
}

impl Display for ErrorDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// A fatal runtime failure, surfaced by the driver when `Status::Error` is
/// reached or when the run cannot start at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    /// The underlying error detail.
    pub detail: ErrorDetails,
}

impl RunFailure {
    pub fn new(detail: ErrorDetails) -> Self {
        Self { detail }
    }

    /// The process exit code this failure maps to. Controlled exits carry
    /// their own code; every other fatal error maps to 1.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.detail.exit_code.unwrap_or(1)
    }
}

impl Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.detail.format())
    }
}

impl std::error::Error for RunFailure {}

impl From<ErrorDetails> for RunFailure {
    fn from(detail: ErrorDetails) -> Self {
        Self::new(detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_includes_location_prefix() {
        let detail = ErrorDetails::value_error("bad input").at(SourceLoc::new("main.vibe", 3, 7));
        assert_eq!(detail.format(), "[main.vibe:3:7] bad input");
    }

    #[test]
    fn format_appends_host_stack() {
        let detail = ErrorDetails::ts_block_error("boom")
            .at(SourceLoc::new("main.vibe", 1, 1))
            .with_host_stack("at eval (block.ts:2:5)");
        assert_eq!(
            detail.format(),
            "[main.vibe:1:1] boom\nTypeScript stack trace:\nat eval (block.ts:2:5)"
        );
    }

    #[test]
    fn kind_round_trips_through_strings() {
        for kind in [ErrorKind::ValueError, ErrorKind::AIError, ErrorKind::TsBlockError] {
            let s = kind.to_string();
            assert_eq!(s.parse::<ErrorKind>().unwrap(), kind);
        }
    }

    #[test]
    fn exit_failure_carries_code() {
        let failure = RunFailure::from(ErrorDetails::exit(0, "help requested"));
        assert_eq!(failure.exit_code(), 0);
        let failure = RunFailure::from(ErrorDetails::scope_error("undefined 'x'"));
        assert_eq!(failure.exit_code(), 1);
    }
}
