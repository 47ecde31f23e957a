//! Recording session state machine.
//!
//! ```text
//! IDLE --start()--> RECORDING --stop()--> PROCESSING --finalize--> IDLE
//!                       |
//!                  every snapshot_interval: hot-swap the engine and
//!                  submit the halted window for continuous inference
//! ```
//!
//! A snapshot never clears buffered audio the user hears as "the
//! recording": the outgoing engine's final window is what gets uploaded,
//! and the replacement engine starts before the old one releases the
//! device. All swaps and the final stop are serialized through one gate so
//! a slow inference round trip can never interleave with a stop.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::{
    audio::SourceFactory,
    buffering::window::AudioWindow,
    engine::{CaptureConfig, CaptureEngine},
    error::{Result, VroomError},
    events::{
        AlertEvent, CompanionNotifier, LevelEvent, QuietAudioEvent, SessionState,
        SessionStatusEvent,
    },
    upload::{InferenceOutcome, UploadSink},
};

/// Bound on halting an engine during a swap or stop. Generous: the loop
/// notices the flag within one read iteration.
const HALT_TIMEOUT: Duration = Duration::from_secs(2);

const BROADCAST_CAPACITY: usize = 256;

struct SessionInner {
    state: SessionState,
    engine: Option<CaptureEngine>,
    quiet_streak: u32,
    generation: u64,
}

/// Owns the capture engine and drives the session lifecycle.
///
/// Create one with [`SessionController::new`], wrap it in an `Arc`, and
/// call [`start`](Self::start) from within a tokio runtime.
pub struct SessionController {
    config: CaptureConfig,
    sources: Arc<dyn SourceFactory>,
    sink: Arc<dyn UploadSink>,
    notifier: Option<Arc<dyn CompanionNotifier>>,
    inner: Mutex<SessionInner>,
    /// Serializes snapshot swaps against each other and against `stop()`.
    swap_gate: Mutex<()>,
    status_tx: broadcast::Sender<SessionStatusEvent>,
    alert_tx: broadcast::Sender<AlertEvent>,
    quiet_tx: broadcast::Sender<QuietAudioEvent>,
    level_tx: broadcast::Sender<LevelEvent>,
    alert_seq: AtomicU64,
    /// Bumped on every start and stop; the periodic tick task exits as soon
    /// as the epoch it was spawned under is no longer current, so a ticker
    /// can never outlive its own session into the next one.
    ticker_epoch: AtomicU64,
}

impl SessionController {
    pub fn new(
        config: CaptureConfig,
        sources: Arc<dyn SourceFactory>,
        sink: Arc<dyn UploadSink>,
    ) -> Self {
        let (status_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (alert_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (quiet_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (level_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            config,
            sources,
            sink,
            notifier: None,
            inner: Mutex::new(SessionInner {
                state: SessionState::Idle,
                engine: None,
                quiet_streak: 0,
                generation: 0,
            }),
            swap_gate: Mutex::new(()),
            status_tx,
            alert_tx,
            quiet_tx,
            level_tx,
            alert_seq: AtomicU64::new(0),
            ticker_epoch: AtomicU64::new(0),
        }
    }

    /// Attach a device-side notifier invoked for every notify-worthy alert.
    pub fn with_notifier(mut self, notifier: Arc<dyn CompanionNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn quiet_streak(&self) -> u32 {
        self.inner.lock().quiet_streak
    }

    /// Monotonic engine generation, bumped on every start and swap.
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<SessionStatusEvent> {
        self.status_tx.subscribe()
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<AlertEvent> {
        self.alert_tx.subscribe()
    }

    pub fn subscribe_quiet(&self) -> broadcast::Receiver<QuietAudioEvent> {
        self.quiet_tx.subscribe()
    }

    pub fn subscribe_levels(&self) -> broadcast::Receiver<LevelEvent> {
        self.level_tx.subscribe()
    }

    /// IDLE → RECORDING: spawn the first engine and the periodic snapshot
    /// task. Errors if a session is already active.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if inner.state != SessionState::Idle {
                return Err(VroomError::AlreadyRecording);
            }
            let next_gen = inner.generation + 1;
            let engine = self.spawn_engine(next_gen)?;
            inner.generation = next_gen;
            inner.engine = Some(engine);
            inner.quiet_streak = 0;
            inner.state = SessionState::Recording;
        }
        self.emit_status(SessionState::Recording, None);

        let epoch = self.ticker_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(controller.config.snapshot_interval);
            // The first tick of a tokio interval completes immediately;
            // consume it so the first swap lands one full period in.
            interval.tick().await;
            loop {
                interval.tick().await;
                // A stale epoch means this session already stopped; a quick
                // restart must not inherit the old ticker.
                if controller.ticker_epoch.load(Ordering::SeqCst) != epoch
                    || controller.state() != SessionState::Recording
                {
                    break;
                }
                let tick_ref = Arc::clone(&controller);
                if tokio::task::spawn_blocking(move || tick_ref.tick()).await.is_err() {
                    warn!("snapshot tick task panicked");
                }
            }
            debug!("periodic snapshot task exited");
        });
        Ok(())
    }

    /// One periodic snapshot: hot-swap the engine and submit the halted
    /// window for continuous inference. Skipped when a previous swap or a
    /// stop still holds the gate.
    pub fn tick(self: &Arc<Self>) {
        let Some(_gate) = self.swap_gate.try_lock() else {
            debug!("snapshot tick skipped; swap already in progress");
            return;
        };

        let window = {
            let mut inner = self.inner.lock();
            if inner.state != SessionState::Recording {
                return;
            }

            // A faulted engine gets one restart instead of a swap.
            if let Some(fault) = inner.engine.as_ref().and_then(CaptureEngine::fault) {
                warn!(error = %fault, "capture engine faulted; restarting");
                if let Some(old) = inner.engine.take() {
                    old.release();
                }
                let next_gen = inner.generation + 1;
                match self.spawn_engine(next_gen) {
                    Ok(engine) => {
                        inner.generation = next_gen;
                        inner.engine = Some(engine);
                        info!(generation = next_gen, "capture engine restarted after fault");
                    }
                    Err(e) => {
                        self.fail_session(&mut inner, format!("capture restart failed: {e}"));
                    }
                }
                return;
            }

            let Some(old) = inner.engine.take() else {
                return;
            };
            let window = match old.halt(HALT_TIMEOUT) {
                Ok(window) => Some(window),
                Err(e) => {
                    warn!(error = %e, "halt failed during snapshot swap");
                    None
                }
            };

            // Replacement comes up before the old engine lets the device go.
            let next_gen = inner.generation + 1;
            match self.spawn_engine(next_gen) {
                Ok(engine) => {
                    inner.generation = next_gen;
                    inner.engine = Some(engine);
                    old.release();
                }
                Err(e) => {
                    warn!(error = %e, "replacement engine failed to start; retrying once");
                    old.release();
                    match self.spawn_engine(next_gen) {
                        Ok(engine) => {
                            inner.generation = next_gen;
                            inner.engine = Some(engine);
                        }
                        Err(e) => {
                            self.fail_session(
                                &mut inner,
                                format!("could not restart capture: {e}"),
                            );
                            return;
                        }
                    }
                }
            }
            window
        };

        let Some(window) = window else { return };
        if window.is_empty() {
            debug!("snapshot window empty; nothing to submit");
            return;
        }

        let outcome_rx = self.sink.submit_snapshot(window);
        let controller = Arc::clone(self);
        let timeout = self.config.finalize_timeout;
        tokio::task::spawn_blocking(move || match outcome_rx.recv_timeout(timeout) {
            Ok(outcome) => controller.handle_outcome(outcome, true),
            Err(_) => warn!("continuous snapshot inference timed out"),
        });
    }

    /// RECORDING → PROCESSING → IDLE: halt the engine, run finalize
    /// inference on the buffered window, and report the outcome.
    ///
    /// A stop while already idle (or mid-finalize) is a no-op returning
    /// `Ok(None)`.
    pub fn stop(&self) -> Result<Option<InferenceOutcome>> {
        let _gate = self.swap_gate.lock();

        let engine = {
            let mut inner = self.inner.lock();
            if inner.state != SessionState::Recording {
                return Ok(None);
            }
            inner.state = SessionState::Processing;
            // Invalidate the ticker in the same critical section as the
            // state transition: no further swap may fire for this session.
            self.ticker_epoch.fetch_add(1, Ordering::SeqCst);
            inner.engine.take()
        };
        self.emit_status(SessionState::Processing, None);

        let window = match engine {
            Some(engine) => {
                let halted = engine.halt(HALT_TIMEOUT);
                engine.release();
                match halted {
                    Ok(window) => Some(window),
                    Err(e) => {
                        error!(error = %e, "engine refused to halt on stop");
                        self.finish_idle();
                        return Err(e);
                    }
                }
            }
            None => None,
        };

        let outcome = match window.filter(|w| !w.is_empty()) {
            Some(window) => self.finalize(window),
            None => InferenceOutcome::Error("no buffered audio to finalize".into()),
        };

        self.handle_outcome(outcome.clone(), false);
        self.finish_idle();
        Ok(Some(outcome))
    }

    fn finalize(&self, window: AudioWindow) -> InferenceOutcome {
        info!(samples = window.len(), "submitting final window for inference");
        let outcome_rx = self.sink.submit_snapshot(window);
        match outcome_rx.recv_timeout(self.config.finalize_timeout) {
            Ok(outcome) => outcome,
            Err(_) => InferenceOutcome::Error("finalize inference timed out".into()),
        }
    }

    /// Apply one inference outcome to session state and the event streams.
    ///
    /// `continuous` distinguishes periodic-snapshot results from the final
    /// stop result; continuous errors are logged but never surface.
    pub fn handle_outcome(&self, outcome: InferenceOutcome, continuous: bool) {
        match outcome {
            InferenceOutcome::QuietAudio => {
                let streak = {
                    let mut inner = self.inner.lock();
                    inner.quiet_streak += 1;
                    inner.quiet_streak
                };
                if streak <= self.config.max_quiet_notifications {
                    info!(streak, "window too quiet to classify");
                    let _ = self.quiet_tx.send(QuietAudioEvent { streak });
                } else {
                    debug!(streak, "quiet notification suppressed");
                }
            }
            InferenceOutcome::Success(result) => {
                self.inner.lock().quiet_streak = 0;
                info!(
                    vehicle_type = %result.vehicle_type,
                    direction = %result.direction,
                    confidence = result.confidence,
                    should_notify = result.should_notify,
                    "inference result"
                );
                if result.should_notify {
                    let seq = self.alert_seq.fetch_add(1, Ordering::Relaxed);
                    let _ = self.alert_tx.send(AlertEvent {
                        seq,
                        vehicle_type: result.vehicle_type.clone(),
                        direction: result.direction.clone(),
                        confidence: result.confidence,
                    });
                    if let Some(notifier) = &self.notifier {
                        notifier.alert(&result.vehicle_type, &result.direction);
                    }
                }
            }
            InferenceOutcome::Error(reason) => {
                if continuous {
                    warn!(%reason, "continuous inference attempt failed");
                } else {
                    warn!(%reason, "finalize inference failed");
                }
            }
        }
    }

    fn spawn_engine(&self, generation: u64) -> Result<CaptureEngine> {
        CaptureEngine::spawn(
            &self.config,
            generation,
            Arc::clone(&self.sources),
            Arc::clone(&self.sink),
            self.level_tx.clone(),
        )
    }

    /// Unrecoverable capture failure: drop the engine, go idle, and emit
    /// exactly one fatal status event.
    fn fail_session(&self, inner: &mut SessionInner, reason: String) {
        error!(%reason, "recording session aborted");
        self.ticker_epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(engine) = inner.engine.take() {
            engine.release();
        }
        inner.state = SessionState::Idle;
        let _ = self.status_tx.send(SessionStatusEvent {
            state: SessionState::Idle,
            detail: Some(reason),
        });
    }

    fn finish_idle(&self) {
        self.inner.lock().state = SessionState::Idle;
        self.emit_status(SessionState::Idle, None);
    }

    fn emit_status(&self, state: SessionState, detail: Option<String>) {
        let _ = self.status_tx.send(SessionStatusEvent { state, detail });
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if let Some(engine) = self.inner.lock().engine.take() {
            engine.release();
        }
    }
}
