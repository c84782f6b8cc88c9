//! Mapping of emotion readings onto drive-mode decisions.
//!
//! The policy is a total, side-effect-free function over a configurable table.
//! Everything stateful (debouncing, holding, delivery) lives downstream in the
//! pipeline; this module only answers "what mode does this reading call for".

pub mod engine;

pub use engine::{PolicyEngine, PolicyTable};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::bus::event::EmotionLabel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriveMode {
    Normal,
    Restricted,
}

impl fmt::Display for DriveMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Restricted => write!(f, "restricted"),
        }
    }
}

/// One drive-mode decision. Created by the policy engine, superseded by the
/// next decision, never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriveModeDecision {
    pub mode: DriveMode,
    pub triggering_emotion: EmotionLabel,
    pub effective_from: DateTime<Utc>,
    pub reason: String,
}
