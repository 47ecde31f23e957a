//! End-to-end session exercises against scripted sources and a fake
//! inference backend. No microphone or network involved.

use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver};
use parking_lot::Mutex;

use vroomsense_core::audio::{ReadOutcome, SampleSource, SourceFactory};
use vroomsense_core::buffering::window::AudioWindow;
use vroomsense_core::events::Direction;
use vroomsense_core::{
    CaptureConfig, InferenceOutcome, InferenceResult, SessionController, SessionState,
    UploadSink, VroomError,
};

/// Constant-amplitude stereo source pacing reads at wall-clock speed.
struct ToneSource {
    amplitude: i16,
    sample_rate: u32,
}

impl SampleSource for ToneSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read_chunk(&mut self, max_frames: usize) -> Result<ReadOutcome, VroomError> {
        std::thread::sleep(Duration::from_millis(1));
        let frames = max_frames.min(40);
        let mut chunk = Vec::with_capacity(frames * 2);
        for _ in 0..frames {
            chunk.push(self.amplitude);
            chunk.push(self.amplitude / 2);
        }
        Ok(ReadOutcome::Frames(chunk))
    }
}

/// Factory that can be scripted to fail on specific `create` calls,
/// counting attempts along the way.
struct ToneFactory {
    amplitude: i16,
    sample_rate: u32,
    fail_calls: Vec<usize>,
    calls: AtomicUsize,
}

impl ToneFactory {
    fn new(amplitude: i16, sample_rate: u32) -> Self {
        Self {
            amplitude,
            sample_rate,
            fail_calls: Vec::new(),
            calls: AtomicUsize::new(0),
        }
    }

    fn failing_on(mut self, calls: &[usize]) -> Self {
        self.fail_calls = calls.to_vec();
        self
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl SourceFactory for ToneFactory {
    fn create(&self) -> Result<Box<dyn SampleSource>, VroomError> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        if self.fail_calls.contains(&call) {
            return Err(VroomError::DeviceInit(format!("scripted failure on call {call}")));
        }
        Ok(Box::new(ToneSource {
            amplitude: self.amplitude,
            sample_rate: self.sample_rate,
        }))
    }
}

/// Records submissions and answers each snapshot from a scripted reply
/// queue (falling back to `QuietAudio` when the script runs dry).
#[derive(Default)]
struct FakeBackend {
    streams: Mutex<Vec<AudioWindow>>,
    snapshots: Mutex<Vec<AudioWindow>>,
    replies: Mutex<VecDeque<InferenceOutcome>>,
}

impl FakeBackend {
    fn push_reply(&self, outcome: InferenceOutcome) {
        self.replies.lock().push_back(outcome);
    }

    fn snapshot_count(&self) -> usize {
        self.snapshots.lock().len()
    }
}

impl UploadSink for FakeBackend {
    fn submit_stream(&self, window: AudioWindow) {
        self.streams.lock().push(window);
    }

    fn submit_snapshot(&self, window: AudioWindow) -> Receiver<InferenceOutcome> {
        self.snapshots.lock().push(window);
        let reply = self
            .replies
            .lock()
            .pop_front()
            .unwrap_or(InferenceOutcome::QuietAudio);
        let (tx, rx) = bounded(1);
        tx.send(reply).expect("reply receiver alive");
        rx
    }
}

/// Small window and a short snapshot period so everything happens within
/// a few hundred milliseconds.
fn fast_config() -> CaptureConfig {
    CaptureConfig {
        sample_rate: 800,
        window_seconds: 1,
        rms_window_size: 1_000_000,
        base_gain: 1.0,
        snapshot_interval: Duration::from_millis(60),
        finalize_timeout: Duration::from_secs(2),
        ..CaptureConfig::default()
    }
}

fn siren(confidence: f64, should_notify: bool) -> InferenceOutcome {
    InferenceOutcome::Success(InferenceResult {
        vehicle_type: "Ambulance".into(),
        direction: Direction::Right,
        confidence,
        should_notify,
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn recording_streams_full_windows_and_stop_finalizes() {
    let factory = Arc::new(ToneFactory::new(200, 800));
    let backend = Arc::new(FakeBackend::default());
    backend.push_reply(siren(0.99, true));

    let controller = Arc::new(SessionController::new(
        fast_config(),
        Arc::clone(&factory) as Arc<dyn SourceFactory>,
        Arc::clone(&backend) as Arc<dyn UploadSink>,
    ));
    let mut alert_rx = controller.subscribe_alerts();

    controller.start().expect("session starts");
    assert_eq!(controller.state(), SessionState::Recording);

    // Enough wall time for the 800-sample ring to fill and flush.
    tokio::time::sleep(Duration::from_millis(120)).await;

    let stop = {
        let controller = Arc::clone(&controller);
        tokio::task::spawn_blocking(move || controller.stop())
            .await
            .expect("stop task")
    };
    let outcome = stop.expect("stop succeeds").expect("session was active");
    assert!(matches!(outcome, InferenceOutcome::Success(_) | InferenceOutcome::QuietAudio));
    assert_eq!(controller.state(), SessionState::Idle);

    let streams = backend.streams.lock();
    assert!(!streams.is_empty(), "continuous flushes happened while recording");
    for window in streams.iter() {
        assert_eq!(window.len(), 800);
        assert_eq!(window.sample_rate(), 800);
    }
    drop(streams);

    assert!(backend.snapshot_count() >= 1, "stop submitted the final window");
    if let Ok(alert) = alert_rx.try_recv() {
        assert_eq!(alert.vehicle_type, "Ambulance");
        assert_eq!(alert.direction, Direction::Right);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn periodic_ticks_swap_engines_without_stopping_the_session() {
    let factory = Arc::new(ToneFactory::new(50, 800));
    let backend = Arc::new(FakeBackend::default());

    let controller = Arc::new(SessionController::new(
        fast_config(),
        Arc::clone(&factory) as Arc<dyn SourceFactory>,
        Arc::clone(&backend) as Arc<dyn UploadSink>,
    ));

    controller.start().expect("session starts");
    let start_generation = controller.generation();

    // Several snapshot periods; each tick retires one engine and starts
    // the next.
    tokio::time::sleep(Duration::from_millis(260)).await;

    assert_eq!(controller.state(), SessionState::Recording);
    assert!(
        controller.generation() > start_generation,
        "snapshot ticks must advance the engine generation"
    );
    assert!(factory.call_count() >= 2, "each swap opens a fresh source");
    assert!(backend.snapshot_count() >= 1, "halted windows were submitted");

    let controller_stop = Arc::clone(&controller);
    tokio::task::spawn_blocking(move || controller_stop.stop())
        .await
        .expect("stop task")
        .expect("stop succeeds");
}

#[tokio::test(flavor = "multi_thread")]
async fn swap_failure_retries_once_and_keeps_recording() {
    // Call 1 opens the first engine; call 2 (the replacement) fails, and
    // the retry on call 3 succeeds.
    let factory = Arc::new(ToneFactory::new(50, 800).failing_on(&[2]));
    let backend = Arc::new(FakeBackend::default());

    let controller = Arc::new(SessionController::new(
        fast_config(),
        Arc::clone(&factory) as Arc<dyn SourceFactory>,
        Arc::clone(&backend) as Arc<dyn UploadSink>,
    ));

    controller.start().expect("session starts");
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(
        controller.state(),
        SessionState::Recording,
        "a single swap failure must not end the session"
    );
    assert!(factory.call_count() >= 3, "failed swap retried with a fresh source");

    let controller_stop = Arc::clone(&controller);
    tokio::task::spawn_blocking(move || controller_stop.stop())
        .await
        .expect("stop task")
        .expect("stop succeeds");
}

#[tokio::test(flavor = "multi_thread")]
async fn swap_failure_with_failed_retry_aborts_with_one_fatal_status() {
    // The replacement and its retry both fail.
    let factory = Arc::new(ToneFactory::new(50, 800).failing_on(&[2, 3]));
    let backend = Arc::new(FakeBackend::default());

    let controller = Arc::new(SessionController::new(
        fast_config(),
        Arc::clone(&factory) as Arc<dyn SourceFactory>,
        Arc::clone(&backend) as Arc<dyn UploadSink>,
    ));
    let mut status_rx = controller.subscribe_status();

    controller.start().expect("session starts");
    tokio::time::sleep(Duration::from_millis(250)).await;

    assert_eq!(controller.state(), SessionState::Idle, "session aborted to idle");

    let mut fatal_details = 0;
    while let Ok(event) = status_rx.try_recv() {
        if event.state == SessionState::Idle && event.detail.is_some() {
            fatal_details += 1;
        }
    }
    assert_eq!(fatal_details, 1, "exactly one fatal status event");

    assert!(matches!(controller.stop(), Ok(None)), "stop after abort is a no-op");
}

#[tokio::test(flavor = "multi_thread")]
async fn starting_twice_is_rejected() {
    let factory = Arc::new(ToneFactory::new(50, 800));
    let backend = Arc::new(FakeBackend::default());

    let controller = Arc::new(SessionController::new(
        fast_config(),
        factory as Arc<dyn SourceFactory>,
        backend as Arc<dyn UploadSink>,
    ));

    controller.start().expect("first start succeeds");
    let err = controller.start().expect_err("second start rejected");
    assert!(matches!(err, VroomError::AlreadyRecording));

    let controller_stop = Arc::clone(&controller);
    tokio::task::spawn_blocking(move || controller_stop.stop())
        .await
        .expect("stop task")
        .expect("stop succeeds");
}

#[tokio::test(flavor = "multi_thread")]
async fn restarting_within_one_interval_leaves_a_single_ticker() {
    let factory = Arc::new(ToneFactory::new(50, 800));
    let backend = Arc::new(FakeBackend::default());

    let config = CaptureConfig {
        snapshot_interval: Duration::from_millis(100),
        ..fast_config()
    };
    let controller = Arc::new(SessionController::new(
        config,
        Arc::clone(&factory) as Arc<dyn SourceFactory>,
        Arc::clone(&backend) as Arc<dyn UploadSink>,
    ));

    // Stop and restart well inside one snapshot period: the first
    // session's ticker has not fired yet when the second session begins.
    controller.start().expect("first start");
    tokio::time::sleep(Duration::from_millis(30)).await;
    let controller_stop = Arc::clone(&controller);
    tokio::task::spawn_blocking(move || controller_stop.stop())
        .await
        .expect("stop task")
        .expect("stop succeeds");

    tokio::time::sleep(Duration::from_millis(30)).await;
    controller.start().expect("second start");
    let generation_at_restart = controller.generation();

    tokio::time::sleep(Duration::from_millis(450)).await;

    // One ticker on a 100 ms period performs at most 4-5 swaps in 450 ms;
    // a leaked ticker from the first session would roughly double that.
    let swaps = controller.generation() - generation_at_restart;
    assert!(
        swaps <= 5,
        "swap cadence exceeds a single ticker: {swaps} swaps in 450 ms"
    );
    assert!(swaps >= 2, "the surviving ticker must still be swapping");

    let controller_stop = Arc::clone(&controller);
    tokio::task::spawn_blocking(move || controller_stop.stop())
        .await
        .expect("stop task")
        .expect("stop succeeds");
}

#[tokio::test(flavor = "multi_thread")]
async fn quiet_replies_from_continuous_inference_raise_the_streak() {
    let factory = Arc::new(ToneFactory::new(10, 800));
    let backend = Arc::new(FakeBackend::default());
    // Script runs dry immediately, so every snapshot answers QuietAudio.

    let controller = Arc::new(SessionController::new(
        fast_config(),
        factory as Arc<dyn SourceFactory>,
        Arc::clone(&backend) as Arc<dyn UploadSink>,
    ));
    let mut quiet_rx = controller.subscribe_quiet();

    controller.start().expect("session starts");
    tokio::time::sleep(Duration::from_millis(260)).await;

    let controller_stop = Arc::clone(&controller);
    tokio::task::spawn_blocking(move || controller_stop.stop())
        .await
        .expect("stop task")
        .expect("stop succeeds");

    assert!(controller.quiet_streak() >= 1, "quiet replies accumulate");
    let first = quiet_rx.try_recv().expect("first quiet event visible");
    assert_eq!(first.streak, 1);
}
