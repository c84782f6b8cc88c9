//! # Notification Fan-out
//!
//! Delivers decision-change notifications to 0..N display subscribers, each
//! independently. The producer never blocks: every subscriber owns a bounded
//! backlog, overflow drops that subscriber's oldest entry (never anyone
//! else's), and a subscriber that keeps overflowing is marked lagging and
//! eventually evicted.
//!
//! Subscribers own no pipeline state; they are pure consumers of
//! [`DriveModeDecision`](crate::policy::DriveModeDecision) changes, delivered
//! in emission order from the moment they subscribed.

pub mod dispatcher;

pub use dispatcher::{
    DecisionFanout, DecisionStream, FanoutError, SubscriberHandle, SubscriberStatus,
};
