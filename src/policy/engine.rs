//! Table-driven policy engine.
//!
//! `decide` is deliberately a pure function: no clocks, no channels, no
//! logging side effects on the decision path. That keeps the mapping
//! exhaustively testable against the table.

use std::collections::HashMap;

use crate::bus::event::{EmotionEvent, EmotionLabel};

use super::{DriveMode, DriveModeDecision};

/// Mapping from emotion labels to drive modes.
///
/// Labels absent from the table produce no decision. The default table keeps
/// distress emotions restrictive and calm ones permissive; configuration
/// overrides can extend or change individual entries.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    entries: HashMap<EmotionLabel, DriveMode>,
}

impl Default for PolicyTable {
    fn default() -> Self {
        let entries = HashMap::from([
            (EmotionLabel::Sad, DriveMode::Restricted),
            (EmotionLabel::Angry, DriveMode::Restricted),
            (EmotionLabel::Fearful, DriveMode::Restricted),
            (EmotionLabel::Neutral, DriveMode::Normal),
            (EmotionLabel::Happy, DriveMode::Normal),
        ]);
        Self { entries }
    }
}

impl PolicyTable {
    pub fn with_overrides(mut self, overrides: &HashMap<EmotionLabel, DriveMode>) -> Self {
        for (label, mode) in overrides {
            if *label == EmotionLabel::Unknown {
                continue;
            }
            self.entries.insert(*label, *mode);
        }
        self
    }

    pub fn mode_for(&self, label: EmotionLabel) -> Option<DriveMode> {
        self.entries.get(&label).copied()
    }
}

pub struct PolicyEngine {
    table: PolicyTable,
    confidence_threshold: f32,
    history_window: usize,
}

impl PolicyEngine {
    pub fn new(table: PolicyTable, confidence_threshold: f32, history_window: usize) -> Self {
        Self {
            table,
            confidence_threshold,
            history_window,
        }
    }

    pub fn confidence_threshold(&self) -> f32 {
        self.confidence_threshold
    }

    pub fn history_window(&self) -> usize {
        self.history_window
    }

    /// Maps one reading (plus optional recent history) to a decision.
    ///
    /// Returns `None` when the reading is below the confidence threshold,
    /// carries an unrecognized label, or resolves to a label the table does
    /// not map. With `history_window == 0` the output depends on the current
    /// reading alone.
    pub fn decide(
        &self,
        event: &EmotionEvent,
        history: &[EmotionEvent],
    ) -> Option<DriveModeDecision> {
        if event.confidence < self.confidence_threshold {
            return None;
        }

        let (label, smoothed) = if self.history_window > 0 {
            (self.majority_label(event, history), true)
        } else {
            (event.label, false)
        };

        if label == EmotionLabel::Unknown {
            return None;
        }
        let mode = self.table.mode_for(label)?;

        let reason = if smoothed && label != event.label {
            format!("driver appears {} across recent readings", label)
        } else {
            format!(
                "driver appears {} (confidence {:.2})",
                label, event.confidence
            )
        };

        Some(DriveModeDecision {
            mode,
            triggering_emotion: label,
            effective_from: event.timestamp,
            reason,
        })
    }

    /// Majority label over the current reading plus the trailing window of
    /// at-or-above-threshold readings. Ties resolve toward the newest reading.
    fn majority_label(&self, event: &EmotionEvent, history: &[EmotionEvent]) -> EmotionLabel {
        let mut counts: HashMap<EmotionLabel, usize> = HashMap::new();
        *counts.entry(event.label).or_insert(0) += 1;
        for past in history.iter().rev().take(self.history_window) {
            if past.confidence >= self.confidence_threshold {
                *counts.entry(past.label).or_insert(0) += 1;
            }
        }

        let best = counts.values().copied().max().unwrap_or(0);
        if counts.get(&event.label) == Some(&best) {
            return event.label;
        }
        // Newest occurrence among the tied leaders wins.
        for past in history.iter().rev() {
            if counts.get(&past.label) == Some(&best) {
                return past.label;
            }
        }
        event.label
    }
}
