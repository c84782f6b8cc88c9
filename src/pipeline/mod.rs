//! Decision debouncing and the event-processing engine.
//!
//! ```text
//! EmotionEvent ──► [PolicyEngine] ──► [DecisionHold] ──► decision change
//!       ▲                                  │                  │
//!   Input Channel                     held_until          Fan-out
//! ```
//!
//! The hold suppresses flapping: once a mode change is presented it stays
//! current for at least the hold duration, same-mode refreshes extend the
//! hold, and an opposite-mode decision preempts it immediately. Hold expiry
//! is bookkeeping only and never reverts the decision.

pub mod engine;
pub mod hold;

pub use engine::{PipelineEngine, PipelineHandle, PipelineState};
pub use hold::{DecisionHold, HoldPhase};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("no policy engine configured")]
    MissingPolicy,
    #[error("task error: {0}")]
    Task(String),
}
