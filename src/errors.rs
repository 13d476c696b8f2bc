// =============================================================================
// Engine error taxonomy
// =============================================================================
//
// The core distinguishes five error kinds (spec.md §7) so that the
// ingestion pipeline's state machine can decide retry-with-backoff vs.
// fail-startup vs. discard-and-count without string-matching messages.
// Outer glue (collaborator implementations, `main.rs`) still uses
// `anyhow::Result` with `.context(...)`, the teacher's own convention —
// `EngineError` only sits at the core's API boundary.
// =============================================================================

use thiserror::Error;

use crate::types::SeriesKey;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A bar or trade field was non-finite, non-positive where required, or
    /// otherwise malformed. The input is rejected; no state mutates.
    #[error("invalid input for {key}: {reason}")]
    InvalidInput { key: SeriesKey, reason: String },

    /// A collaborator port (bar/signal/streak store, exchange source)
    /// failed. `transient == true` means the pipeline should retry with
    /// backoff during LIVE, or the whole process should fail during
    /// startup; `transient == false` means the failure is not worth
    /// retrying (e.g. a 4xx from the exchange).
    #[error("port failure ({port}): {source}")]
    PortFailure {
        port: &'static str,
        transient: bool,
        #[source]
        source: anyhow::Error,
    },

    /// A core invariant was violated (e.g. two ACTIVE signals for the same
    /// key, a streak mutation from a filtered-out candidate). Fatal — the
    /// core stops and surfaces a diagnostic event.
    #[error("invariant violated for {key}: {detail}")]
    InvariantViolation { key: SeriesKey, detail: String },

    /// An observer callback panicked or returned an error. Isolated: other
    /// observers still run, and this error is logged, not propagated.
    #[error("observer callback failed: {0}")]
    ObserverCallback(String),

    /// A bar arrived with `open_time` at or before the last processed
    /// checkpoint during LIVE. Discarded; the checkpoint does not advance.
    #[error("stale bar for {key} at {open_time}")]
    StaleBar { key: SeriesKey, open_time: i64 },
}

impl EngineError {
    /// Whether the pipeline should retry this failure with backoff rather
    /// than treating it as immediately fatal.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::PortFailure { transient: true, .. })
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
