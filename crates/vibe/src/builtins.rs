//! Auto-imported builtins.
//!
//! `print`, `env`, `args`, `hasArg`, `defineArg`, and `ask` need no import;
//! the call dispatcher checks this table before user functions. Program
//! arguments support positional access by integer index and `--flag` /
//! `--flag=value` access by name; `defineArg` adds typed coercion, a
//! `--help` schema printout, and a once-only warning for unknown flags.

use std::borrow::Cow;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::EnumString;

use crate::{
    error::ErrorDetails,
    io::PrintWriter,
    program::Span,
    state::{RunState, Status, UserPending},
    value::{DeclaredType, Payload, ValueSource, WrappedValue},
};

/// The builtin function table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
pub enum Builtin {
    #[strum(serialize = "print")]
    Print,
    #[strum(serialize = "env")]
    Env,
    #[strum(serialize = "args")]
    Args,
    #[strum(serialize = "hasArg")]
    HasArg,
    #[strum(serialize = "defineArg")]
    DefineArg,
    #[strum(serialize = "ask")]
    Ask,
}

impl Builtin {
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::from_str(name).ok()
    }
}

/// One schema row registered by `defineArg`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgSpec {
    pub name: String,
    pub ty: DeclaredType,
    pub description: String,
    pub required: bool,
    pub default: Option<Payload>,
}

/// Program-argument state: the raw argument vector plus the schema
/// accumulated from `defineArg` calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArgsRegistry {
    raw: Vec<String>,
    defined: Vec<ArgSpec>,
    warned_unknown: bool,
}

impl ArgsRegistry {
    #[must_use]
    pub fn new(raw: Vec<String>) -> Self {
        Self {
            raw,
            defined: Vec::new(),
            warned_unknown: false,
        }
    }

    /// All program arguments in their original order.
    #[must_use]
    pub fn all(&self) -> Vec<Payload> {
        self.raw.iter().map(|a| Payload::Text(a.clone())).collect()
    }

    /// Element at index `n`, or null when out of range.
    #[must_use]
    pub fn positional(&self, n: i64) -> Payload {
        usize::try_from(n)
            .ok()
            .and_then(|i| self.raw.get(i))
            .map_or(Payload::Null, |a| Payload::Text(a.clone()))
    }

    /// Value of `--name X` or `--name=X`. A bare `--name` (trailing, or
    /// followed by another flag) and `--name=` both yield the empty string.
    /// Absent flags yield `None`.
    #[must_use]
    pub fn flag(&self, name: &str) -> Option<String> {
        let bare = format!("--{name}");
        let eq_prefix = format!("--{name}=");
        let mut iter = self.raw.iter().peekable();
        while let Some(arg) = iter.next() {
            if let Some(rest) = arg.strip_prefix(&eq_prefix) {
                return Some(rest.to_owned());
            }
            if *arg == bare {
                return match iter.peek() {
                    Some(next) if !next.starts_with("--") => Some((*next).clone()),
                    _ => Some(String::new()),
                };
            }
        }
        None
    }

    /// Whether `--name` or `--name=...` appears at all.
    #[must_use]
    pub fn has_flag(&self, name: &str) -> bool {
        self.flag(name).is_some()
    }

    /// Whether `--help` was passed.
    #[must_use]
    pub fn wants_help(&self) -> bool {
        self.has_flag("help")
    }

    pub fn define(&mut self, spec: ArgSpec) {
        self.defined.retain(|s| s.name != spec.name);
        self.defined.push(spec);
    }

    /// Flags present on the command line but not declared via `defineArg`.
    #[must_use]
    pub fn unknown_flags(&self) -> Vec<String> {
        self.raw
            .iter()
            .filter_map(|a| a.strip_prefix("--"))
            .map(|a| a.split('=').next().unwrap_or(a).to_owned())
            .filter(|name| name != "help" && !self.defined.iter().any(|s| s.name == *name))
            .collect()
    }

    /// Renders the `--help` schema.
    #[must_use]
    pub fn help_text(&self) -> String {
        let mut out = String::from("Arguments:\n");
        for spec in &self.defined {
            let req = if spec.required { " (required)" } else { "" };
            let default = spec
                .default
                .as_ref()
                .map(|d| format!(" [default: {}]", d.display_text()))
                .unwrap_or_default();
            out.push_str(&format!(
                "  --{} <{}>{req}{default}\n      {}\n",
                spec.name, spec.ty, spec.description
            ));
        }
        out
    }

    /// Warns to stderr about unknown flags, once per run. Called on the
    /// first `args()` access.
    pub fn warn_unknown_once(&mut self) {
        if self.warned_unknown {
            return;
        }
        self.warned_unknown = true;
        let unknown = self.unknown_flags();
        if !unknown.is_empty() {
            eprintln!("warning: unknown flags: {}", unknown.join(", "));
        }
    }
}

/// Coerces a raw flag string to a declared argument type. Providers of
/// arguments are shells, so everything arrives as text.
fn coerce_arg(raw: &str, ty: &DeclaredType, name: &str) -> Result<Payload, ErrorDetails> {
    match ty {
        DeclaredType::Text => Ok(Payload::Text(raw.to_owned())),
        DeclaredType::Number => {
            if let Ok(i) = raw.parse::<i64>() {
                Ok(Payload::Int(i))
            } else if let Ok(f) = raw.parse::<f64>() {
                if f.is_finite() {
                    Ok(Payload::Float(f))
                } else {
                    Err(ErrorDetails::value_error(format!("--{name} is not a finite number")))
                }
            } else {
                Err(ErrorDetails::value_error(format!("--{name} expects a number, got '{raw}'")))
            }
        }
        DeclaredType::Boolean => match raw {
            // Bare presence of a boolean flag means true.
            "" | "true" => Ok(Payload::Bool(true)),
            "false" => Ok(Payload::Bool(false)),
            other => Err(ErrorDetails::value_error(format!(
                "--{name} expects true or false, got '{other}'"
            ))),
        },
        DeclaredType::Json => match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(v) => Ok(Payload::from_json(v)),
            Err(e) => Err(ErrorDetails::value_error(format!("--{name} is not valid JSON: {e}"))),
        },
        other => Err(ErrorDetails::value_error(format!(
            "--{name}: unsupported argument type {other}"
        ))),
    }
}

fn expect_text(args: &[WrappedValue], index: usize, builtin: &str) -> Result<String, ErrorDetails> {
    match args.get(index).map(WrappedValue::payload) {
        Some(Payload::Text(s)) => Ok(s.clone()),
        Some(other) => Err(ErrorDetails::value_error(format!(
            "{builtin} expects text for argument {index}, got {}",
            other.type_name()
        ))),
        None => Err(ErrorDetails::value_error(format!(
            "{builtin} is missing argument {index}"
        ))),
    }
}

/// Executes a builtin call. Returns `Some(result)` for synchronous
/// builtins; `ask` suspends by writing the user pending slot and returns
/// `None`.
pub fn call_builtin(
    state: &mut RunState,
    builtin: Builtin,
    args: Vec<WrappedValue>,
    span: Span,
    print: &mut impl PrintWriter,
) -> Result<Option<WrappedValue>, ErrorDetails> {
    match builtin {
        Builtin::Print => {
            for (i, arg) in args.iter().enumerate() {
                if i > 0 {
                    print.push(' ');
                }
                print.write(Cow::Owned(arg.payload().display_text()));
            }
            print.push('\n');
            Ok(Some(WrappedValue::null()))
        }
        Builtin::Env => {
            let name = expect_text(&args, 0, "env")?;
            let value = match std::env::var(&name) {
                Ok(v) => Payload::Text(v),
                Err(_) => args.get(1).map_or(Payload::Null, |d| d.payload().clone()),
            };
            Ok(Some(WrappedValue::wrap(value, ValueSource::User)))
        }
        Builtin::Args => {
            state.args.warn_unknown_once();
            let payload = match args.first().map(WrappedValue::payload) {
                None => Payload::Seq(state.args.all()),
                Some(Payload::Int(n)) => state.args.positional(*n),
                Some(Payload::Text(name)) => state
                    .args
                    .flag(name)
                    .map_or(Payload::Null, Payload::Text),
                Some(other) => {
                    return Err(ErrorDetails::value_error(format!(
                        "args expects an integer index or flag name, got {}",
                        other.type_name()
                    )));
                }
            };
            Ok(Some(WrappedValue::wrap(payload, ValueSource::User)))
        }
        Builtin::HasArg => {
            let name = expect_text(&args, 0, "hasArg")?;
            Ok(Some(WrappedValue::wrap(
                Payload::Bool(state.args.has_flag(&name)),
                ValueSource::User,
            )))
        }
        Builtin::DefineArg => {
            let name = expect_text(&args, 0, "defineArg")?;
            let ty_text = expect_text(&args, 1, "defineArg")?;
            let ty = ty_text.parse::<DeclaredType>()?;
            let description = expect_text(&args, 2, "defineArg")?;
            let required = matches!(args.get(3).map(WrappedValue::payload), Some(Payload::Bool(true)));
            let default = args.get(4).map(|v| v.payload().clone()).filter(|p| !p.is_null());

            state.args.define(ArgSpec {
                name: name.clone(),
                ty: ty.clone(),
                description,
                required,
                default: default.clone(),
            });

            if state.args.wants_help() {
                print.write(Cow::Owned(state.args.help_text()));
                return Err(ErrorDetails::exit(1, "help requested"));
            }

            let payload = match state.args.flag(&name) {
                Some(raw) => coerce_arg(&raw, &ty, &name)?,
                None => match default {
                    Some(d) => d,
                    None if required => {
                        return Err(ErrorDetails::exit(2, format!("missing required argument --{name}")));
                    }
                    None => Payload::Null,
                },
            };
            let mut value = WrappedValue::wrap(payload, ValueSource::User);
            value.declared_type = Some(ty);
            Ok(Some(value))
        }
        Builtin::Ask => {
            let prompt = expect_text(&args, 0, "ask")?;
            state.pending_user = Some(UserPending { prompt, span });
            state.status = Status::AwaitingUser;
            Ok(None)
        }
    }
}
