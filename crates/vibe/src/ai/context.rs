//! Local-context assembly for LM requests.
//!
//! Collects the current frame's parameters and local bindings into context
//! entries, serializes them into a prefix text, and splits that text into
//! cache-breakable chunks for providers that support breakpoints.

use serde::{Deserialize, Serialize};

use crate::{
    state::RunState,
    value::{ValueSource, WrappedValue},
};

use super::request::ContextChunk;

/// Rough character-per-token ratio for the chunking heuristic. Approximate
/// by design; providers count tokens, we only aim near the target.
const CHARS_PER_TOKEN: usize = 4;

/// Target tokens per cache chunk.
const TOKENS_PER_CHUNK: usize = 5_000;

/// One context entry: a binding visible from the suspension point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub name: String,
    /// Declared type tag, when the binding carries one.
    pub ty: Option<String>,
    pub value: String,
    pub source: ValueSource,
}

/// Collects the current frame's bindings, outermost scope first so inner
/// shadowing wins in the rendered text. Pending and errored bindings are
/// skipped — neither has a payload worth showing the model.
#[must_use]
pub fn build_local_context(state: &RunState) -> Vec<ContextEntry> {
    let mut entries: Vec<ContextEntry> = Vec::new();
    let Some(frame) = state.current_frame() else {
        return entries;
    };
    for scope in &frame.scopes {
        let mut names: Vec<&String> = scope.vars.keys().collect();
        names.sort();
        for name in names {
            let value: &WrappedValue = &scope.vars[name];
            if value.is_pending() || value.is_errored() {
                continue;
            }
            entries.retain(|e| e.name != *name);
            entries.push(ContextEntry {
                name: name.clone(),
                ty: value.declared_type.as_ref().map(ToString::to_string),
                value: value.payload().display_text(),
                source: value.source,
            });
        }
    }
    entries
}

/// Serializes context entries into the request prefix text.
#[must_use]
pub fn format_context(entries: &[ContextEntry]) -> String {
    if entries.is_empty() {
        return String::new();
    }
    let mut out = String::from("Current variables in scope:\n");
    for entry in entries {
        match &entry.ty {
            Some(ty) => out.push_str(&format!("{} ({ty}): {}\n", entry.name, entry.value)),
            None => out.push_str(&format!("{}: {}\n", entry.name, entry.value)),
        }
    }
    out
}

/// Convenience: assemble and format in one step.
#[must_use]
pub fn format_local_context(state: &RunState) -> String {
    format_context(&build_local_context(state))
}

/// Splits context text into chunks of roughly [`TOKENS_PER_CHUNK`] tokens,
/// breaking on line boundaries. The cache breakpoint lands on the
/// second-to-last chunk so the last chunk may change without invalidating
/// the cache.
#[must_use]
pub fn chunk_context(text: &str) -> Vec<ContextChunk> {
    let limit = TOKENS_PER_CHUNK * CHARS_PER_TOKEN;
    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    for line in text.split_inclusive('\n') {
        if !current.is_empty() && current.len() + line.len() > limit {
            chunks.push(std::mem::take(&mut current));
        }
        current.push_str(line);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    let breakpoint = chunks.len().checked_sub(2);
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, text)| ContextChunk {
            text,
            cache_breakpoint: Some(i) == breakpoint,
        })
        .collect()
}
