use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use drivestate::bus::EventBusHandle;
use drivestate::fanout::DecisionFanout;
use drivestate::pipeline::{DecisionHold, PipelineHandle};
use drivestate::policy::{PolicyEngine, PolicyTable};
use drivestate::settings::Settings;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let settings = Settings::load()?;
    info!(
        broker = %settings.broker.address,
        topic = %settings.broker.topic,
        "starting drivestate"
    );

    let fanout = Arc::new(DecisionFanout::new(
        settings.fanout.queue_capacity,
        settings.fanout.max_lag_strikes,
    ));
    let hold = Arc::new(DecisionHold::new(settings.hold.duration_ms));
    let policy = PolicyEngine::new(
        PolicyTable::default().with_overrides(&settings.policy.override_table()),
        settings.policy.confidence_threshold,
        settings.policy.history_window,
    );

    let (event_tx, event_rx) = mpsc::channel(1000);

    let mut bus = EventBusHandle::connect(settings.broker.clone(), event_tx)
        .map_err(|e| eyre!("failed to start event bus: {}", e))?;

    let mut pipeline = PipelineHandle::start(
        "drive-mode".to_string(),
        event_rx,
        fanout.clone(),
        hold.clone(),
        policy,
    )
    .map_err(|e| eyre!("failed to start pipeline: {}", e))?;

    // Console display collaborator: renders decision changes, owns no state.
    let (display_handle, mut display_stream) = fanout.subscribe();
    let display_task = tokio::spawn(async move {
        loop {
            match display_stream.recv().await {
                Ok(decision) => info!(
                    mode = %decision.mode,
                    "drive mode alert: {}",
                    decision.reason
                ),
                Err(e) => {
                    debug!("display stream ended: {}", e);
                    break;
                }
            }
        }
    });

    // Republish decision changes for external cluster displays.
    if let Some(publisher) = bus.decision_publisher() {
        let (_republish_handle, mut republish_stream) = fanout.subscribe();
        tokio::spawn(async move {
            while let Ok(decision) = republish_stream.recv().await {
                if let Err(e) = publisher.publish(&decision).await {
                    warn!("failed to republish decision: {}", e);
                }
            }
        });
    }

    let mut status_rx = bus.status();
    tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            let status = status_rx.borrow().clone();
            debug!(
                state = ?status.connection_state,
                received = status.events_received,
                discarded = status.events_discarded,
                "bus status"
            );
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    fanout.unsubscribe(&display_handle);
    pipeline
        .shutdown()
        .await
        .map_err(|e| eyre!("pipeline shutdown failed: {}", e))?;
    bus.shutdown().await;
    let _ = display_task.await;

    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
