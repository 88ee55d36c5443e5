use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use iq_analyzer::input::{SyntheticSource, Tone};
use iq_analyzer::{Command, Event, RecordKind, ScanOutcome, ScanParams, Session, SessionConfig, SessionError, SignalClass};

const RATE: u32 = 1_024_000;
const WAIT: Duration = Duration::from_secs(10);

fn config() -> SessionConfig {
    let mut cfg = SessionConfig {
        block_len: 1024,
        playback: false,
        ..SessionConfig::default()
    };
    cfg.tuning.center_freq = 100_000_000.0;
    cfg.tuning.sample_rate = RATE;
    cfg
}

fn scan_params() -> ScanParams {
    ScanParams {
        start_hz: 100_000_000.0,
        end_hz: 101_000_000.0,
        step_hz: 100_000.0,
        settle: Duration::from_millis(1),
        threshold_db: -60.0,
    }
}

/// Wait for the first event matching `pred`, discarding the rest.
fn wait_for<F>(events: &Receiver<Event>, mut pred: F) -> Option<Event>
where
    F: FnMut(&Event) -> bool,
{
    let deadline = Instant::now() + WAIT;
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match events.recv_timeout(left) {
            Ok(event) if pred(&event) => return Some(event),
            Ok(_) => {}
            Err(_) => return None,
        }
    }
    None
}

fn wait_until<F: FnMut() -> bool>(mut cond: F) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn spectrum_shows_the_tone() {
    let source = SyntheticSource::new(1024)
        .with_tone(Tone::new(100_250_000.0, 0.5))
        .with_noise(1e-3);
    let session = Session::spawn(config(), Box::new(source)).unwrap();

    assert!(wait_until(|| session.latest_spectrum().is_some()));
    let frame = session.latest_spectrum().unwrap();
    assert_eq!(frame.bin_count(), 1024);
    let (bin, power) = frame.peak();
    assert!((frame.frequency_of(bin) - 100_250_000.0).abs() <= frame.resolution);
    assert!(power > -10.0);
    assert!(wait_until(|| session.stats().audio_frames > 0));
    session.shutdown();
}

#[test]
fn scan_owns_the_source_until_it_finishes() {
    let source = SyntheticSource::new(1024)
        .with_tone(Tone::new(100_500_000.0, 0.5))
        .with_noise(1e-3);
    let session = Session::spawn(config(), Box::new(source)).unwrap();
    let events = session.events().clone();

    session.start_scan(scan_params()).unwrap();
    assert!(session.is_scanning());
    assert!(matches!(session.start_scan(scan_params()), Err(SessionError::ScanActive)));
    let mut tuning = config().tuning;
    tuning.center_freq = 145_000_000.0;
    assert!(matches!(session.tune(tuning), Err(SessionError::ScanActive)));

    let finished = wait_for(&events, |e| matches!(e, Event::ScanFinished { .. })).expect("scan never finished");
    let Event::ScanFinished { results, outcome } = finished else {
        unreachable!()
    };
    assert_eq!(outcome, ScanOutcome::Completed);
    assert_eq!(results.len(), 1, "{:?}", results);
    assert!((results[0].frequency - 100_500_000.0).abs() <= 50_000.0);
    assert_eq!(results[0].class, SignalClass::Carrier);

    // listening resumes on the original channel
    let tuned = wait_for(&events, |e| matches!(e, Event::Tuned(_)));
    assert!(matches!(tuned, Some(Event::Tuned(t)) if t.center_freq == 100_000_000.0));
    assert!(!session.is_scanning());
    session.tune(tuning).unwrap();
    session.shutdown();
}

#[test]
fn scan_can_be_cancelled() {
    let source = SyntheticSource::new(1024);
    let session = Session::spawn(config(), Box::new(source)).unwrap();
    let events = session.events().clone();

    let params = ScanParams {
        end_hz: 200_000_000.0,
        settle: Duration::from_millis(5),
        ..scan_params()
    };
    session.start_scan(params).unwrap();
    assert!(wait_for(&events, |e| matches!(e, Event::ScanProgress(_))).is_some());
    session.cancel_scan().unwrap();

    let finished = wait_for(&events, |e| matches!(e, Event::ScanFinished { .. }));
    assert!(matches!(
        finished,
        Some(Event::ScanFinished {
            outcome: ScanOutcome::Cancelled,
            ..
        })
    ));
    session.shutdown();
}

#[test]
fn device_failure_recovers_on_retune() {
    let source = SyntheticSource::new(1024).with_failure_after(3);
    let session = Session::spawn(config(), Box::new(source)).unwrap();
    let events = session.events().clone();

    assert!(wait_for(&events, |e| matches!(e, Event::DeviceFailed(_))).is_some());
    let stalled = session.stats().blocks_read;
    assert_eq!(stalled, 3);

    session.tune(config().tuning).unwrap();
    assert!(wait_for(&events, |e| matches!(e, Event::Tuned(_))).is_some());
    assert!(wait_until(|| session.stats().blocks_read > stalled));
    session.shutdown();
}

#[test]
fn iq_recording_produces_a_readable_file() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = SessionConfig {
        output_dir: dir.path().to_path_buf(),
        ..config()
    };
    let source = SyntheticSource::new(1024).with_tone(Tone::new(100_010_000.0, 0.5));
    let session = Session::spawn(cfg, Box::new(source)).unwrap();
    let events = session.events().clone();

    session.send(Command::StartRecording(RecordKind::Iq)).unwrap();
    assert!(wait_for(&events, |e| matches!(e, Event::RecordingStarted { kind: RecordKind::Iq, .. })).is_some());
    let start = session.stats().blocks_read;
    assert!(wait_until(|| session.stats().blocks_read > start + 4));
    session.send(Command::StopRecording(RecordKind::Iq)).unwrap();

    let stopped = wait_for(&events, |e| matches!(e, Event::RecordingStopped { kind: RecordKind::Iq, .. }));
    let Some(Event::RecordingStopped { path, .. }) = stopped else {
        panic!("recording never stopped");
    };
    session.shutdown();

    let (samples, rate) = iq_analyzer::input::wav::read_iq_wav(&path).unwrap();
    assert_eq!(rate, RATE);
    assert!(samples.len() >= 4 * 1024);
    assert_eq!(samples.len() % 1024, 0);
}

#[test]
fn audio_recording_is_stereo_at_audio_rate() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = SessionConfig {
        output_dir: dir.path().to_path_buf(),
        ..config()
    };
    let source = SyntheticSource::new(1024).with_tone(Tone::new(100_001_000.0, 0.5));
    let session = Session::spawn(cfg, Box::new(source)).unwrap();
    let events = session.events().clone();

    session.send(Command::StartRecording(RecordKind::Audio)).unwrap();
    assert!(wait_for(&events, |e| matches!(e, Event::RecordingStarted { kind: RecordKind::Audio, .. })).is_some());
    let start = session.stats().audio_frames;
    assert!(wait_until(|| session.stats().audio_frames > start + 480));
    session.send(Command::StopRecording(RecordKind::Audio)).unwrap();

    let stopped = wait_for(&events, |e| matches!(e, Event::RecordingStopped { kind: RecordKind::Audio, .. }));
    let Some(Event::RecordingStopped { path, .. }) = stopped else {
        panic!("recording never stopped");
    };
    session.shutdown();

    let reader = hound::WavReader::open(&path).unwrap();
    assert_eq!(reader.spec().channels, 2);
    assert_eq!(reader.spec().sample_rate, 48_000);
    assert!(reader.duration() > 0);
}

#[test]
fn raw_tune_during_scan_is_rejected() {
    let source = SyntheticSource::new(1024);
    let session = Session::spawn(config(), Box::new(source)).unwrap();
    let events = session.events().clone();

    let params = ScanParams {
        end_hz: 200_000_000.0,
        settle: Duration::from_millis(5),
        ..scan_params()
    };
    session.start_scan(params).unwrap();
    let mut tuning = config().tuning;
    tuning.center_freq = 433_920_000.0;
    session.send(Command::Tune(tuning)).unwrap();

    let rejected = wait_for(&events, |e| matches!(e, Event::TuneRejected(_)));
    assert!(matches!(rejected, Some(Event::TuneRejected(t)) if t.center_freq == 433_920_000.0));
    session.cancel_scan().unwrap();
    assert!(wait_for(&events, |e| matches!(e, Event::ScanFinished { .. })).is_some());
    session.shutdown();
}

#[test]
fn aborted_scan_leaves_source_down_until_retuned() {
    let mut cfg = config();
    cfg.tuning.sample_rate = 48_000;
    cfg.pace = true;
    let source = SyntheticSource::new(1024).with_failure_after(8);
    let session = Session::spawn(cfg.clone(), Box::new(source)).unwrap();
    let events = session.events().clone();

    session.start_scan(scan_params()).unwrap();
    let finished = wait_for(&events, |e| matches!(e, Event::ScanFinished { .. }));
    assert!(matches!(
        finished,
        Some(Event::ScanFinished {
            outcome: ScanOutcome::Aborted(_),
            ..
        })
    ));

    // no retune behind the caller's back
    let mut after = Vec::new();
    let deadline = Instant::now() + Duration::from_millis(300);
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        if let Ok(event) = events.recv_timeout(left) {
            after.push(event);
        }
    }
    assert!(after.iter().any(|e| matches!(e, Event::DeviceFailed(_))), "{:?}", after);
    assert!(!after.iter().any(|e| matches!(e, Event::Tuned(_))), "{:?}", after);
    let stalled = session.stats().blocks_read;
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(session.stats().blocks_read, stalled);

    session.tune(cfg.tuning).unwrap();
    assert!(wait_for(&events, |e| matches!(e, Event::Tuned(_))).is_some());
    assert!(wait_until(|| session.stats().blocks_read > stalled));
    session.shutdown();
}
