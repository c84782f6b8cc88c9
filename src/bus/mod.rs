//! # Event Bus Module
//!
//! MQTT client functionality for the drive-mode pipeline. This module owns the
//! single long-lived broker connection, decodes inbound emotion-classification
//! payloads, and survives broker outages with exponential-backoff reconnects.
//!
//! ## Why This Module Exists
//!
//! The emotion classifier is an external producer that publishes readings over
//! MQTT. Everything downstream of the wire belongs to the pipeline; everything
//! up to and including payload decoding belongs here. The module provides:
//! - One long-lived broker connection with automatic recovery
//! - At-least-once delivery of decoded [`EmotionEvent`]s while connected
//! - A `watch`-observable connection status for observability collaborators
//! - Optional republishing of drive-mode decisions to an outbound topic
//!
//! ## Module Architecture
//!
//! ```text
//! bus/
//! ├── config.rs - Broker address, topics, and reconnect backoff
//! ├── event.rs  - EmotionEvent representation and payload decoding
//! └── client.rs - Connection task, reconnect loop, and handles
//! ```
//!
//! ## Delivery Guarantees
//!
//! Subscriptions use QoS at-least-once, so an event may be delivered more than
//! once but is never silently skipped while the connection is up. Events that
//! arrive while the connection is down are lost, not buffered; the reconnect
//! loop restores the subscription but makes no attempt to replay the gap.
//!
//! Malformed payloads are logged and counted, never propagated: a garbage
//! message on the topic must not disturb the current drive-mode decision.

pub mod client;
pub mod config;
pub mod event;

pub use client::{BusStatus, ConnectionState, DecisionPublisher, EventBusError, EventBusHandle};
pub use config::{BusConfig, ReconnectBackoff};
pub use event::{EmotionEvent, EmotionLabel, EventDecodeError};
