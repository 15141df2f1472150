//! The error taxonomy of the reactive engine.

/// Everything that can go wrong inside the engine.
///
/// Errors raised by the scheduler while it is draining a batch surface as the
/// return value of the write (or [`batch`](crate::batch) call) that opened the
/// batch, after the pending queue has been cleared and the active-effect stack
/// restored.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A cyclic dependency between effects was detected.
    ///
    /// Raised by the `has` re-entry guard, or by the scheduler under the
    /// `Throw` and `Strict` cycle policies. The payload lists the effects on
    /// the cycle, in trigger order.
    #[error("cyclic effect dependency: {cycle:?}")]
    CycleDetected {
        /// Labels of the effects forming the cycle.
        cycle: Vec<String>,
    },

    /// A single batch executed more effect runs than `max_effect_chain`.
    #[error("effect chain exceeded {limit} steps in one batch")]
    MaxDepthExceeded {
        /// The configured chain limit.
        limit: usize,
    },

    /// One effect was re-queued more than `max_trigger_per_batch` times
    /// within a single batch.
    #[error("effect re-triggered more than {limit} times in one batch")]
    MaxReactionExceeded {
        /// The configured per-effect trigger limit.
        limit: usize,
    },

    /// A write was attempted while a computed-only effect was running.
    #[error("write attempted inside a computed effect")]
    WriteInComputed,

    /// An async effect run was canceled because a newer trigger arrived
    /// before its future settled (`AsyncMode::Cancel`).
    #[error("async effect run canceled by a newer trigger")]
    EffectCanceled,

    /// Internal bookkeeping corruption. The engine must be considered
    /// unsafe to use once this has been observed.
    #[error("reactive bookkeeping corrupted: {0}")]
    Tracking(String),

    /// A user effect panicked while the scheduler was draining a batch. The
    /// queue is discarded and the panic message preserved.
    #[error("effect failed during batch: {0}")]
    BrokenEffects(String),

    /// A [`when`](crate::when) predicate did not become truthy before its
    /// deadline.
    #[error("predicate did not become truthy before the deadline")]
    TimeoutExpired,

    /// [`deep_watch`](crate::deep_watch) was called on a value that is not a
    /// reactive-eligible composite.
    #[error("deep watch target must be a reactive composite")]
    BadTarget,

    /// An operation that requires an active effect was called outside of one.
    #[error("no effect is currently active")]
    NoActiveEffect,
}

/// Alias for `Result` with the crate's [`Error`] type.
pub type Result<T, E = Error> = std::result::Result<T, E>;
