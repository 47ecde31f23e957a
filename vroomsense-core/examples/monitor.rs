//! Capture from the default microphone and print classification events.
//!
//! ```sh
//! cargo run --example monitor
//! ```
//!
//! Ctrl-C stops the session and runs finalize inference on the buffered
//! window before exiting.

use std::sync::Arc;

use vroomsense_core::{
    CaptureConfig, HttpDispatcher, MicSourceFactory, SessionController, SessionState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,vroomsense_core=debug".into()),
        )
        .init();

    let config = CaptureConfig::default();
    let sources = Arc::new(MicSourceFactory::new(config.sample_rate));
    let sink = Arc::new(HttpDispatcher::new(&config)?);
    let outcomes = sink.outcomes();

    let controller = Arc::new(SessionController::new(config, sources, sink));

    let mut alerts = controller.subscribe_alerts();
    let mut quiet = controller.subscribe_quiet();
    let mut status = controller.subscribe_status();

    controller.start()?;
    println!("recording; press Ctrl-C to stop");

    // Streaming-flush results arrive on the dispatcher's outcome channel.
    {
        let controller = Arc::clone(&controller);
        std::thread::spawn(move || {
            for outcome in outcomes.iter() {
                controller.handle_outcome(outcome, true);
            }
        });
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = alerts.recv() => {
                if let Ok(alert) = event {
                    println!(
                        "[alert #{:>3}] {} from the {} ({:.1}%)",
                        alert.seq, alert.vehicle_type, alert.direction, alert.confidence * 100.0
                    );
                }
            }
            event = quiet.recv() => {
                if let Ok(q) = event {
                    println!("[quiet] too quiet to classify (streak {})", q.streak);
                }
            }
            event = status.recv() => {
                if let Ok(s) = event {
                    match s.detail {
                        Some(detail) => println!("[status] {:?}: {detail}", s.state),
                        None => println!("[status] {:?}", s.state),
                    }
                }
            }
        }
    }

    let controller_stop = Arc::clone(&controller);
    let outcome = tokio::task::spawn_blocking(move || controller_stop.stop()).await??;
    if let Some(outcome) = outcome {
        println!("final classification: {outcome:?}");
    }
    debug_assert_eq!(controller.state(), SessionState::Idle);
    Ok(())
}
