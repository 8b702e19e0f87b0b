//! Execution tracing and the verbose-log event stream.
//!
//! A trait-based tracing system with zero-cost abstraction: with
//! [`NoopTracer`] every hook compiles away through monomorphization. The
//! driver and LM engine emit structured event records (`run_start`,
//! `ai_start`/`ai_complete`, `ts_start`/`ts_complete`,
//! `tool_start`/`tool_complete`) with monotonic sequence numbers; operation
//! ids carry the `do-NNNNNN` / `vibe-NNNNNN` / `ts-NNNNNN` / `tsf-NNNNNN`
//! prefixes with independent counters.

use serde::{Deserialize, Serialize};

use crate::ai::request::{OperationKind, TokenUsage};

/// Independent id counters for verbose-log event ids. Stored in run state
/// so ids stay stable across suspend/resume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdCounters {
    do_ops: u32,
    vibe_ops: u32,
    ts_blocks: u32,
    ts_functions: u32,
}

impl IdCounters {
    /// Next id for an LM operation: `do-NNNNNN` or `vibe-NNNNNN`.
    /// Compression shares the `do` counter.
    pub fn next_ai_id(&mut self, operation: OperationKind) -> String {
        match operation {
            OperationKind::Do | OperationKind::Compress => {
                self.do_ops += 1;
                format!("do-{:06}", self.do_ops)
            }
            OperationKind::Vibe => {
                self.vibe_ops += 1;
                format!("vibe-{:06}", self.vibe_ops)
            }
        }
    }

    /// Next id for a host block: `ts-NNNNNN`.
    pub fn next_ts_id(&mut self) -> String {
        self.ts_blocks += 1;
        format!("ts-{:06}", self.ts_blocks)
    }

    /// Next id for an imported host-function call: `tsf-NNNNNN`.
    pub fn next_tsf_id(&mut self) -> String {
        self.ts_functions += 1;
        format!("tsf-{:06}", self.ts_functions)
    }
}

/// One verbose-log event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceEvent {
    RunStart {
        run_id: String,
        file: String,
    },
    RunComplete {
        run_id: String,
        ok: bool,
    },
    AiStart {
        id: String,
        operation: OperationKind,
        model: String,
    },
    AiComplete {
        id: String,
        rounds: u32,
        usage: TokenUsage,
        ok: bool,
    },
    TsStart {
        id: String,
    },
    TsComplete {
        id: String,
        ok: bool,
    },
    ToolStart {
        id: String,
        name: String,
    },
    ToolComplete {
        id: String,
        name: String,
        duration_ms: u64,
        ok: bool,
    },
}

/// A recorded event with its monotonic sequence number and wall-clock stamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub seq: u64,
    pub at: chrono::DateTime<chrono::Utc>,
    pub event: TraceEvent,
}

/// Trait for run tracing.
///
/// All methods have default no-op implementations, so [`NoopTracer`]
/// requires zero lines of code and compiles to zero instructions. The
/// driver carries the tracer as a type parameter, so the compiler inlines
/// and eliminates no-op calls.
pub trait RunTracer {
    /// A verbose-log event was emitted.
    fn on_event(&mut self, _event: TraceEvent) {}

    /// Called before each instruction step. The hottest hook.
    #[inline(always)]
    fn on_instruction(&mut self, _kind: &'static str, _frame_depth: usize) {}

    /// A call frame was pushed. Together with [`on_frame_pop`](Self::on_frame_pop)
    /// this exposes the call depth a debugger's step-over needs to skip
    /// function bodies.
    fn on_frame_push(&mut self, _name: &str, _depth: usize) {}

    /// A call frame was popped.
    fn on_frame_pop(&mut self, _depth: usize) {}
}

/// Zero-cost no-op tracer, the production default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

impl RunTracer for NoopTracer {}

/// Records every event with sequence numbers, for tests and log sinks.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    records: Vec<TraceRecord>,
    next_seq: u64,
    /// Frame depth transitions, for step-over verification.
    depth_log: Vec<usize>,
}

impl RecordingTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn records(&self) -> &[TraceRecord] {
        &self.records
    }

    #[must_use]
    pub fn depth_log(&self) -> &[usize] {
        &self.depth_log
    }

    #[must_use]
    pub fn into_records(self) -> Vec<TraceRecord> {
        self.records
    }
}

impl RunTracer for RecordingTracer {
    fn on_event(&mut self, event: TraceEvent) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.records.push(TraceRecord {
            seq,
            at: chrono::Utc::now(),
            event,
        });
    }

    fn on_frame_push(&mut self, _name: &str, depth: usize) {
        self.depth_log.push(depth);
    }

    fn on_frame_pop(&mut self, depth: usize) {
        self.depth_log.push(depth);
    }
}

/// Human-readable event log to stderr.
#[derive(Debug, Default)]
pub struct StderrTracer {
    next_seq: u64,
}

impl StderrTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunTracer for StderrTracer {
    fn on_event(&mut self, event: TraceEvent) {
        let seq = self.next_seq;
        self.next_seq += 1;
        eprintln!("[{seq:06}] {event:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_counters_are_independent() {
        let mut counters = IdCounters::default();
        assert_eq!(counters.next_ai_id(OperationKind::Do), "do-000001");
        assert_eq!(counters.next_ai_id(OperationKind::Vibe), "vibe-000001");
        assert_eq!(counters.next_ai_id(OperationKind::Do), "do-000002");
        assert_eq!(counters.next_ts_id(), "ts-000001");
        assert_eq!(counters.next_tsf_id(), "tsf-000001");
        assert_eq!(counters.next_ts_id(), "ts-000002");
    }

    #[test]
    fn recording_tracer_assigns_monotonic_seq() {
        let mut tracer = RecordingTracer::new();
        tracer.on_event(TraceEvent::RunStart {
            run_id: "r".into(),
            file: "f".into(),
        });
        tracer.on_event(TraceEvent::RunComplete {
            run_id: "r".into(),
            ok: true,
        });
        let seqs: Vec<u64> = tracer.records().iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![0, 1]);
    }
}
