//! Pipeline engine with statum state machine for decision processing.
//!
//! Implements a 5-state lifecycle with compile-time state safety. The engine
//! runs in its own tokio task, draining emotion events from the bus channel
//! and pushing decision changes into the fan-out.
//!
//! # State Machine
//!
//! ```text
//! Initializing ──► Configured ──► Active ──► Deactivating ──► Deactivated
//!                     │              │           ▲
//!                     └──────────────┘           │
//!                       (activate)          (shutdown)
//! ```
//!
//! # Architecture
//!
//! ```text
//! EmotionEvent ──► [PolicyEngine] ──► [DecisionHold] ──► DriveModeDecision
//!       ▲                                                      │
//!   Input Channel                                         [Fan-out]
//! ```

use std::sync::Arc;
use std::time::Duration;

use statum::{machine, state};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::event::EmotionEvent;
use crate::fanout::DecisionFanout;
use crate::pipeline::hold::DecisionHold;
use crate::pipeline::PipelineError;
use crate::policy::{DriveModeDecision, PolicyEngine};

/// How often the hold is nudged so expiry never goes stale between events.
const EXPIRY_TICK: Duration = Duration::from_secs(1);

/// States for pipeline engine lifecycle using statum
#[state]
#[derive(Debug, Clone)]
pub enum PipelineState {
    Initializing, // Setting up engine structure
    Configured,   // Policy loaded and validated
    Active,       // Processing events in main loop
    Deactivating, // Shutting down gracefully
    Deactivated,  // Fully stopped, ready for cleanup
}

/// Pipeline engine with compile-time state safety via statum
///
/// Owns the event receiver and drives policy and hold; each state has
/// specific allowed operations enforced at compile time.
#[machine]
pub struct PipelineEngine<S: PipelineState> {
    event_receiver: mpsc::Receiver<EmotionEvent>,
    fanout: Arc<DecisionFanout>,
    hold: Arc<DecisionHold>,
    policy: Option<PolicyEngine>,
    history: Vec<EmotionEvent>,
    name: String,
}

impl PipelineEngine<Initializing> {
    pub fn create(
        event_receiver: mpsc::Receiver<EmotionEvent>,
        fanout: Arc<DecisionFanout>,
        hold: Arc<DecisionHold>,
        name: String,
    ) -> Self {
        info!("Initializing pipeline engine: {}", name);

        Self::new(
            event_receiver,
            fanout,
            hold,
            None,       // policy
            Vec::new(), // history
            name,
        )
    }

    /// Configures the engine with a policy and transitions to Configured.
    pub fn configure(
        mut self,
        policy: PolicyEngine,
    ) -> Result<PipelineEngine<Configured>, PipelineError> {
        info!("Configuring pipeline engine: {}", self.name);

        let threshold = policy.confidence_threshold();
        if !(0.0..=1.0).contains(&threshold) {
            error!("Confidence threshold {} outside 0.0..=1.0", threshold);
            return Err(PipelineError::Configuration(format!(
                "confidence threshold {} outside 0.0..=1.0",
                threshold
            )));
        }

        debug!(
            "Policy configured: threshold={}, history_window={}",
            threshold,
            policy.history_window()
        );
        self.policy = Some(policy);

        Ok(self.transition())
    }
}

impl PipelineEngine<Configured> {
    pub fn activate(self) -> PipelineEngine<Active> {
        info!("Activating pipeline engine: {}", self.name);
        self.transition()
    }
}

impl PipelineEngine<Active> {
    /// Runs one event through policy and hold.
    ///
    /// Returns the decision change to deliver, if any. Low-confidence and
    /// unmapped readings, and same-mode refreshes, all come back as `None`.
    fn process_event(
        &mut self,
        event: EmotionEvent,
    ) -> Result<Option<DriveModeDecision>, PipelineError> {
        let policy = self.policy.as_ref().ok_or(PipelineError::MissingPolicy)?;

        let decision = policy.decide(&event, &self.history);
        self.remember(event);

        match decision {
            Some(decision) => Ok(self.hold.submit(decision)),
            None => Ok(None),
        }
    }

    fn remember(&mut self, event: EmotionEvent) {
        let window = self
            .policy
            .as_ref()
            .map(|p| p.history_window())
            .unwrap_or(0);
        if window == 0 {
            return;
        }
        self.history.push(event);
        if self.history.len() > window {
            let excess = self.history.len() - window;
            self.history.drain(..excess);
        }
    }

    fn deliver(&self, change: DriveModeDecision) {
        info!(
            mode = %change.mode,
            trigger = %change.triggering_emotion,
            "drive mode changed: {}",
            change.reason
        );
        let delivered = self.fanout.publish(change);
        debug!("decision delivered to {} subscriber(s)", delivered);
    }

    /// Main processing loop with graceful shutdown support.
    ///
    /// Runs until the shutdown signal fires or the event channel closes. A
    /// periodic tick evaluates hold expiry so `current_decision()` readers
    /// never see a hold more than one tick past its deadline.
    pub async fn run_until_shutdown(
        mut self,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) -> Result<PipelineEngine<Deactivating>, PipelineError> {
        info!("Starting decision loop for: {}", self.name);
        let mut expiry_tick = tokio::time::interval(EXPIRY_TICK);

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Shutdown signal received for: {}", self.name);
                    break;
                }

                maybe_event = self.event_receiver.recv() => {
                    match maybe_event {
                        Some(event) => match self.process_event(event) {
                            Ok(Some(change)) => self.deliver(change),
                            Ok(None) => {}
                            Err(e) => error!("Error processing event: {}", e),
                        },
                        None => {
                            warn!("Event channel closed, stopping pipeline: {}", self.name);
                            break;
                        }
                    }
                }

                _ = expiry_tick.tick() => {
                    self.hold.current_decision();
                }
            }
        }

        info!("Transitioning to Deactivating state: {}", self.name);
        Ok(self.transition())
    }
}

impl PipelineEngine<Deactivating> {
    /// Final bookkeeping before the task ends.
    pub async fn shutdown(self) -> PipelineEngine<Deactivated> {
        info!("Shutting down pipeline engine: {}", self.name);
        self.transition()
    }
}

impl PipelineEngine<Deactivated> {}

/// Handle for managing the pipeline engine in a tokio task
///
/// Handles task spawning, graceful shutdown, and resource cleanup.
#[derive(Debug)]
pub struct PipelineHandle {
    pub name: String,

    task_handle: Option<JoinHandle<Result<(), PipelineError>>>,

    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl PipelineHandle {
    /// Creates, configures and activates an engine, then spawns its loop.
    pub fn start(
        name: String,
        event_receiver: mpsc::Receiver<EmotionEvent>,
        fanout: Arc<DecisionFanout>,
        hold: Arc<DecisionHold>,
        policy: PolicyEngine,
    ) -> Result<Self, PipelineError> {
        let engine_name = name.clone();
        let engine = PipelineEngine::create(event_receiver, fanout, hold, engine_name.clone())
            .configure(policy)?;

        let active_engine = engine.activate();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task_handle = tokio::spawn(async move {
            info!("Spawning running engine: {}", engine_name);
            match active_engine.run_until_shutdown(shutdown_rx).await {
                Ok(deactivating_engine) => {
                    info!("Engine entering deactivating state: {}", engine_name);
                    let _ = deactivating_engine.shutdown().await;
                    Ok(())
                }
                Err(e) => {
                    error!("Error running engine: {} - {}", engine_name, e);
                    Err(e)
                }
            }
        });

        Ok(Self {
            name,
            task_handle: Some(task_handle),
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// Gracefully shuts down the engine and waits for task completion.
    pub async fn shutdown(&mut self) -> Result<(), PipelineError> {
        debug!("Sending shutdown signal to engine: {}", self.name);

        if let Some(tx) = self.shutdown_tx.take() {
            if tx.send(()).is_err() {
                warn!("Engine task already terminated: {}", self.name);
            }
        }

        if let Some(handle) = self.task_handle.take() {
            match handle.await {
                Ok(result) => {
                    debug!("Engine task completed: {}", self.name);
                    result
                }
                Err(e) => {
                    error!("Engine task panicked: {} - {}", self.name, e);
                    Err(PipelineError::Task(format!("engine task panicked: {}", e)))
                }
            }
        } else {
            debug!("Engine already shut down: {}", self.name);
            Ok(())
        }
    }
}
