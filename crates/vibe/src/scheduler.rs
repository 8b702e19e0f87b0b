//! Cooperative scheduling of asynchronous operations.
//!
//! The step engine is strictly sequential; concurrency exists only while the
//! driver awaits outstanding external operations between step bursts. An
//! `async let` records a start descriptor and binds its variable to an
//! [`OpId`]; no work begins until the driver drains the descriptors into
//! futures. At a join point the pool resolves futures in FIFO waves of at
//! most `max_parallel`, so earlier starts dispatch first and the cap bounds
//! how many operations run simultaneously. A failure in one operation never
//! aborts the rest of its wave.

use std::collections::VecDeque;

use futures::future::{BoxFuture, join_all};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use crate::{
    error::ErrorDetails,
    instruction::{AsyncBinding, ReturnExpectation},
    program::{AiOpKind, Span},
    state::RunState,
    value::{ModelDescriptor, WrappedValue},
};

/// Unique identifier for asynchronous operations.
///
/// Sequential integers allocated by the run state. Used to correlate a
/// pending variable with its scheduler entry when the driver resolves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpId(u32);

impl OpId {
    #[inline]
    #[must_use]
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    #[inline]
    #[must_use]
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// What kind of external work an async entry represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, IntoStaticStr, Serialize, Deserialize)]
#[strum(serialize_all = "kebab-case")]
pub enum AsyncKind {
    Ai,
    HostBlock,
    ImportedHost,
    VibeFunction,
}

/// Lifecycle of an async entry. `Scheduled` until the driver begins its
/// wave, terminal at `Completed` / `Failed`, removed from the table on join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum AsyncStatus {
    Scheduled,
    Running,
    Completed,
    Failed,
}

/// One row of the async operation table.
///
/// The in-flight future itself lives in the driver's [`OpPool`], never in
/// state, so suspended state stays serializable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncEntry {
    pub op_id: OpId,
    pub kind: AsyncKind,
    pub status: AsyncStatus,
    /// Resolved value, set when `status == Completed`.
    pub value: Option<WrappedValue>,
    /// Failure detail, set when `status == Failed`.
    pub error: Option<ErrorDetails>,
    /// How the result binds back into the declaring scope.
    pub binding: AsyncBinding,
    /// Expected return shape for AI starts.
    pub expectation: ReturnExpectation,
}

impl AsyncEntry {
    #[must_use]
    pub fn scheduled(op_id: OpId, kind: AsyncKind, binding: AsyncBinding, expectation: ReturnExpectation) -> Self {
        Self {
            op_id,
            kind,
            status: AsyncStatus::Scheduled,
            value: None,
            error: None,
            binding,
            expectation,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, AsyncStatus::Completed | AsyncStatus::Failed)
    }
}

/// A scheduled start that has not yet been converted into a running
/// operation. Operands were evaluated synchronously when the start was
/// recorded; the descriptor owns everything the driver needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StartDescriptor {
    Ai {
        op_id: OpId,
        kind: AiOpKind,
        prompt: String,
        model: ModelDescriptor,
        expectation: ReturnExpectation,
        /// Context text assembled from the declaring frame at start time.
        context: String,
        span: Span,
    },
    HostBlock {
        op_id: OpId,
        params: Vec<String>,
        body: String,
        values: Vec<WrappedValue>,
        span: Span,
    },
    ImportedHostCall {
        op_id: OpId,
        module: String,
        function: String,
        args: Vec<WrappedValue>,
        span: Span,
    },
    /// A user-defined function run to completion in an isolated state clone.
    VibeFunction {
        op_id: OpId,
        function: String,
        args: Vec<WrappedValue>,
        module_path: Option<String>,
        span: Span,
    },
}

impl StartDescriptor {
    #[must_use]
    pub fn op_id(&self) -> OpId {
        match self {
            Self::Ai { op_id, .. }
            | Self::HostBlock { op_id, .. }
            | Self::ImportedHostCall { op_id, .. }
            | Self::VibeFunction { op_id, .. } => *op_id,
        }
    }

    #[must_use]
    pub fn kind(&self) -> AsyncKind {
        match self {
            Self::Ai { .. } => AsyncKind::Ai,
            Self::HostBlock { .. } => AsyncKind::HostBlock,
            Self::ImportedHostCall { .. } => AsyncKind::ImportedHost,
            Self::VibeFunction { .. } => AsyncKind::VibeFunction,
        }
    }
}

/// An operation the driver has converted into a live future.
pub struct InFlightOp {
    pub op_id: OpId,
    pub future: BoxFuture<'static, Result<WrappedValue, ErrorDetails>>,
}

/// Driver-owned pool of in-flight operations, resolved in FIFO waves.
#[derive(Default)]
pub struct OpPool {
    queue: VecDeque<InFlightOp>,
}

impl OpPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: InFlightOp) {
        self.queue.push_back(op);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Resolves waves from the front of the queue until every operation in
    /// `wanted` is terminal, recording outcomes into the state's async
    /// table. Operations ahead of the wanted set in the queue resolve too —
    /// starts scheduled earlier are dispatched first.
    pub async fn resolve_set(&mut self, state: &mut RunState, wanted: &[OpId]) {
        let max_parallel = state.max_parallel.max(1);
        let mut outstanding: Vec<OpId> = wanted
            .iter()
            .copied()
            .filter(|id| state.async_ops.get(id).is_some_and(|e| !e.is_terminal()))
            .collect();

        while !outstanding.is_empty() && !self.queue.is_empty() {
            let wave_len = self.queue.len().min(max_parallel);
            let mut ids = Vec::with_capacity(wave_len);
            let mut futures = Vec::with_capacity(wave_len);
            for _ in 0..wave_len {
                let op = self.queue.pop_front().expect("wave_len bounded by queue len");
                ids.push(op.op_id);
                futures.push(op.future);
            }
            for id in &ids {
                if let Some(entry) = state.async_ops.get_mut(id) {
                    entry.status = AsyncStatus::Running;
                }
            }
            let results = join_all(futures).await;
            for (id, result) in ids.into_iter().zip(results) {
                if let Some(entry) = state.async_ops.get_mut(&id) {
                    match result {
                        Ok(value) => {
                            entry.status = AsyncStatus::Completed;
                            entry.value = Some(value);
                        }
                        Err(detail) => {
                            entry.status = AsyncStatus::Failed;
                            entry.error = Some(detail);
                        }
                    }
                }
                outstanding.retain(|o| *o != id);
            }
        }
    }

    /// Resolves everything still in flight — the block-boundary join.
    pub async fn resolve_all(&mut self, state: &mut RunState) {
        let all: Vec<OpId> = self.queue.iter().map(|op| op.op_id).collect();
        self.resolve_set(state, &all).await;
    }
}
