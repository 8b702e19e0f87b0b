//! Member access, indexing, slicing, constructors, and template
//! interpolation.

use indexmap::IndexMap;

use crate::{
    error::ErrorDetails,
    instruction::Instr,
    program::Span,
    scheduler::OpId,
    state::RunState,
    value::{Payload, ValueSource, WrappedValue},
};

use super::pop_value;

/// Materializes the `.err` / `.errDetails` sugar and record member reads.
/// Field access on errored values returns null except `.err` and
/// `.errDetails.*`; missing record fields read as null.
pub fn member_access(state: &mut RunState, field: &str, _span: Span) -> Result<(), ErrorDetails> {
    let base = pop_value(state)?;
    let result = match field {
        "err" => Payload::Bool(base.is_errored()),
        "errDetails" => match base.error_details() {
            Some(detail) => {
                let mut record = IndexMap::new();
                record.insert("message".to_owned(), Payload::Text(detail.message.clone()));
                record.insert("type".to_owned(), Payload::Text(detail.kind.to_string()));
                record.insert(
                    "location".to_owned(),
                    detail
                        .location
                        .as_ref()
                        .map_or(Payload::Null, |l| Payload::Text(l.to_string())),
                );
                Payload::Record(record)
            }
            None => Payload::Null,
        },
        _ if base.is_errored() => Payload::Null,
        _ => payload_member(base.payload(), field),
    };
    state.value_stack.push(WrappedValue::wrap(result, base.source));
    Ok(())
}

/// Reads a member out of a payload. Models and tools expose their
/// descriptor fields; anything without that member reads as null.
fn payload_member(payload: &Payload, field: &str) -> Payload {
    match payload {
        Payload::Record(record) => record.get(field).cloned().unwrap_or(Payload::Null),
        Payload::Model(_) | Payload::Tool(_) => match payload.to_json() {
            serde_json::Value::Object(map) => map.get(field).cloned().map_or(Payload::Null, Payload::from_json),
            _ => Payload::Null,
        },
        Payload::Range { start, end } => match field {
            "start" => Payload::Int(*start),
            "end" => Payload::Int(*end),
            _ => Payload::Null,
        },
        _ => Payload::Null,
    }
}

pub fn index_access(state: &mut RunState, span: Span) -> Result<(), ErrorDetails> {
    let index = pop_value(state)?;
    let base = pop_value(state)?;
    if let Some(detail) = base.error_details().or_else(|| index.error_details()) {
        state.value_stack.push(WrappedValue::as_error(detail.clone()));
        return Ok(());
    }
    let result = match (base.payload(), index.payload()) {
        (Payload::Seq(items), Payload::Int(i)) => resolve_index(*i, items.len())
            .and_then(|idx| items.get(idx))
            .cloned()
            .unwrap_or(Payload::Null),
        (Payload::Text(s), Payload::Int(i)) => {
            let chars: Vec<char> = s.chars().collect();
            resolve_index(*i, chars.len())
                .and_then(|idx| chars.get(idx))
                .map_or(Payload::Null, |c| Payload::Text(c.to_string()))
        }
        (Payload::Record(record), Payload::Text(key)) => record.get(key).cloned().unwrap_or(Payload::Null),
        (b, i) => {
            let detail = ErrorDetails::value_error(format!(
                "cannot index {} with {}",
                b.type_name(),
                i.type_name()
            ))
            .at(state.loc(span));
            state.value_stack.push(WrappedValue::as_error(detail));
            return Ok(());
        }
    };
    state.value_stack.push(WrappedValue::wrap(result, base.source));
    Ok(())
}

/// Maps a possibly-negative index to an offset; negative indexes from the
/// end.
fn resolve_index(i: i64, len: usize) -> Option<usize> {
    let len_i = i64::try_from(len).ok()?;
    let idx = if i < 0 { i + len_i } else { i };
    if (0..len_i).contains(&idx) {
        usize::try_from(idx).ok()
    } else {
        None
    }
}

pub fn slice_op(state: &mut RunState, has_start: bool, has_end: bool, span: Span) -> Result<(), ErrorDetails> {
    let end = if has_end { Some(pop_value(state)?) } else { None };
    let start = if has_start { Some(pop_value(state)?) } else { None };
    let base = pop_value(state)?;

    for operand in [Some(&base), start.as_ref(), end.as_ref()].into_iter().flatten() {
        if let Some(detail) = operand.error_details() {
            state.value_stack.push(WrappedValue::as_error(detail.clone()));
            return Ok(());
        }
    }
    let bound = |v: Option<&WrappedValue>| -> Result<Option<i64>, ErrorDetails> {
        match v.map(WrappedValue::payload) {
            None => Ok(None),
            Some(Payload::Int(i)) => Ok(Some(*i)),
            Some(other) => Err(ErrorDetails::value_error(format!(
                "slice bounds must be integers, got {}",
                other.type_name()
            ))
            .at(state.loc(span))),
        }
    };
    let (start, end) = match (bound(start.as_ref()), bound(end.as_ref())) {
        (Ok(s), Ok(e)) => (s, e),
        (Err(detail), _) | (_, Err(detail)) => {
            state.value_stack.push(WrappedValue::as_error(detail));
            return Ok(());
        }
    };

    let result = match base.payload() {
        Payload::Seq(items) => {
            let (from, to) = slice_bounds(start, end, items.len());
            Payload::Seq(items[from..to].to_vec())
        }
        Payload::Text(s) => {
            let chars: Vec<char> = s.chars().collect();
            let (from, to) = slice_bounds(start, end, chars.len());
            Payload::Text(chars[from..to].iter().collect())
        }
        other => {
            let detail = ErrorDetails::value_error(format!("cannot slice {}", other.type_name())).at(state.loc(span));
            state.value_stack.push(WrappedValue::as_error(detail));
            return Ok(());
        }
    };
    state.value_stack.push(WrappedValue::wrap(result, base.source));
    Ok(())
}

/// Python-style half-open slice bounds: open ends, negative indexes from
/// the end, out-of-range clamped.
fn slice_bounds(start: Option<i64>, end: Option<i64>, len: usize) -> (usize, usize) {
    let len_i = i64::try_from(len).unwrap_or(i64::MAX);
    let clamp = |i: i64| -> usize {
        let idx = if i < 0 { i + len_i } else { i };
        usize::try_from(idx.clamp(0, len_i)).unwrap_or(0)
    };
    let from = start.map_or(0, clamp);
    let to = end.map_or(len, clamp);
    (from, to.max(from))
}

pub fn make_range(state: &mut RunState, span: Span) -> Result<(), ErrorDetails> {
    let end = pop_value(state)?;
    let start = pop_value(state)?;
    if let Some(detail) = start.error_details().or_else(|| end.error_details()) {
        state.value_stack.push(WrappedValue::as_error(detail.clone()));
        return Ok(());
    }
    let result = match (start.payload(), end.payload()) {
        (Payload::Int(a), Payload::Int(b)) => {
            WrappedValue::wrap(Payload::Range { start: *a, end: *b }, ValueSource::Literal)
        }
        (a, b) => WrappedValue::as_error(
            ErrorDetails::value_error(format!(
                "range bounds must be integers, got {} and {}",
                a.type_name(),
                b.type_name()
            ))
            .at(state.loc(span)),
        ),
    };
    state.value_stack.push(result);
    Ok(())
}

pub fn make_record(state: &mut RunState, fields: &[String], _span: Span) -> Result<(), ErrorDetails> {
    let mut values = Vec::with_capacity(fields.len());
    for _ in 0..fields.len() {
        values.push(pop_value(state)?);
    }
    values.reverse();
    if let Some(errored) = values.iter().find(|v| v.is_errored()) {
        let detail = errored.error_details().expect("errored value has details").clone();
        state.value_stack.push(WrappedValue::as_error(detail));
        return Ok(());
    }
    let record: IndexMap<String, Payload> = fields
        .iter()
        .cloned()
        .zip(values.into_iter().map(|v| v.payload().clone()))
        .collect();
    state
        .value_stack
        .push(WrappedValue::wrap(Payload::Record(record), ValueSource::Literal));
    Ok(())
}

pub fn make_seq(state: &mut RunState, len: usize, _span: Span) -> Result<(), ErrorDetails> {
    let mut values = Vec::with_capacity(len);
    for _ in 0..len {
        values.push(pop_value(state)?);
    }
    values.reverse();
    if let Some(errored) = values.iter().find(|v| v.is_errored()) {
        let detail = errored.error_details().expect("errored value has details").clone();
        state.value_stack.push(WrappedValue::as_error(detail));
        return Ok(());
    }
    let items: Vec<Payload> = values.into_iter().map(|v| v.payload().clone()).collect();
    state
        .value_stack
        .push(WrappedValue::wrap(Payload::Seq(items), ValueSource::Literal));
    Ok(())
}

/// Executes an interpolation instruction, re-suspending when a referenced
/// variable is still pending.
pub fn interpolate(state: &mut RunState, template: &str, span: Span) -> Result<(), ErrorDetails> {
    match interpolate_now(state, template) {
        InterpOutcome::Done(text) => {
            state
                .value_stack
                .push(WrappedValue::wrap(Payload::Text(text), ValueSource::Literal));
            Ok(())
        }
        InterpOutcome::NeedJoin(op_ids) => {
            state.instruction_stack.push(Instr::Interpolate {
                template: template.to_owned(),
                span,
            });
            state.instruction_stack.push(Instr::AwaitAsyncSet { op_ids });
            Ok(())
        }
    }
}

pub enum InterpOutcome {
    Done(String),
    NeedJoin(Vec<OpId>),
}

/// Expands `{name}` placeholders by scope lookup. Dot-paths and bracket
/// indexing are honored; undefined paths leave the placeholder literal.
/// `{{` and `}}` escape literal braces.
pub fn interpolate_now(state: &RunState, template: &str) -> InterpOutcome {
    let mut out = String::with_capacity(template.len());
    let mut pending = Vec::new();
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut content = String::new();
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == '}' {
                        closed = true;
                        break;
                    }
                    content.push(inner);
                }
                if !closed {
                    out.push('{');
                    out.push_str(&content);
                    continue;
                }
                match expand_placeholder(state, &content) {
                    Expanded::Text(text) => out.push_str(&text),
                    Expanded::Undefined => {
                        out.push('{');
                        out.push_str(&content);
                        out.push('}');
                    }
                    Expanded::Pending(op_id) => {
                        if !pending.contains(&op_id) {
                            pending.push(op_id);
                        }
                    }
                }
            }
            other => out.push(other),
        }
    }
    if pending.is_empty() {
        InterpOutcome::Done(out)
    } else {
        InterpOutcome::NeedJoin(pending)
    }
}

enum Expanded {
    Text(String),
    Undefined,
    Pending(OpId),
}

/// Resolves one placeholder path: `name`, `name.field.deep`, `name[0]`,
/// `name["key"]`, and chains of those.
fn expand_placeholder(state: &RunState, content: &str) -> Expanded {
    let mut segments = parse_path(content);
    let Some(PathPiece::Name(root)) = segments.first().cloned() else {
        return Expanded::Undefined;
    };
    let Some(value) = state.lookup(&root) else {
        return Expanded::Undefined;
    };
    if let Some(op_id) = value.async_handle {
        return Expanded::Pending(op_id);
    }
    segments.remove(0);
    let mut current = value.payload().clone();
    for segment in segments {
        current = match (&segment, &current) {
            (PathPiece::Name(field), _) => payload_member(&current, field),
            (PathPiece::Index(i), Payload::Seq(items)) => resolve_index(*i, items.len())
                .and_then(|idx| items.get(idx))
                .cloned()
                .unwrap_or(Payload::Null),
            (PathPiece::Key(key), Payload::Record(record)) => record.get(key).cloned().unwrap_or(Payload::Null),
            _ => return Expanded::Undefined,
        };
        if current.is_null() {
            return Expanded::Undefined;
        }
    }
    Expanded::Text(current.display_text())
}

#[derive(Clone)]
enum PathPiece {
    Name(String),
    Index(i64),
    Key(String),
}

fn parse_path(content: &str) -> Vec<PathPiece> {
    let mut pieces = Vec::new();
    let mut rest = content.trim();
    let mut first = true;
    while !rest.is_empty() {
        if let Some(stripped) = rest.strip_prefix('.') {
            rest = stripped;
        } else if let Some(stripped) = rest.strip_prefix('[') {
            let Some(close) = stripped.find(']') else {
                return Vec::new();
            };
            let inner = stripped[..close].trim();
            if let Ok(i) = inner.parse::<i64>() {
                pieces.push(PathPiece::Index(i));
            } else {
                let key = inner.trim_matches(|c| c == '"' || c == '\'');
                pieces.push(PathPiece::Key(key.to_owned()));
            }
            rest = &stripped[close + 1..];
            first = false;
            continue;
        } else if !first {
            return Vec::new();
        }
        let end = rest
            .find(|c| c == '.' || c == '[')
            .unwrap_or(rest.len());
        let name = &rest[..end];
        if name.is_empty() {
            return Vec::new();
        }
        pieces.push(PathPiece::Name(name.to_owned()));
        rest = &rest[end..];
        first = false;
    }
    pieces
}
