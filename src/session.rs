//! Session orchestration.
//!
//! Two threads: acquisition (source, spectrum, scanner, IQ recorder) and
//! audio (demodulator chain and sink). Blocks cross over a bounded channel
//! and are dropped when the audio side lags. The outside world talks to the
//! session through [`Command`]s and listens to [`Event`]s.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};

use crate::audio::{AudioSink, ExportChannel, ExportState, Playback};
use crate::config::SessionConfig;
use crate::demod::{AgcParams, DemodMode, DemodStatus, DemodulatorChain, AUDIO_RATE};
use crate::error::SessionError;
use crate::input::{SampleBlock, SampleSource, Tuning};
use crate::output::IqRecorder;
use crate::scanner::{ScanParams, ScanProgress, ScanResult, ScanStatus, Scanner};
use crate::spectrum::{Accumulation, SpectrumEngine, SpectrumFrame, WindowKind};

/// Wait for commands while the source is down
const IDLE_WAIT: Duration = Duration::from_millis(100);
const AUDIO_WAIT: Duration = Duration::from_millis(50);
const EVENT_QUEUE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// Demodulated stereo audio
    Audio,
    /// Raw IQ blocks
    Iq,
}

#[derive(Debug, Clone)]
pub enum Command {
    Tune(Tuning),
    SetMode(DemodMode),
    SetAgc(AgcParams),
    SetWindow(WindowKind),
    SetAccumulation(Accumulation),
    ResetPeakHold,
    StartScan(ScanParams),
    CancelScan,
    SetPlayback(bool),
    SetExport(bool),
    StartRecording(RecordKind),
    StopRecording(RecordKind),
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    Completed,
    Cancelled,
    Aborted(String),
}

#[derive(Debug, Clone)]
pub enum Event {
    Tuned(Tuning),
    /// Manual tuning arrived while a scan owned the source
    TuneRejected(Tuning),
    DeviceFailed(String),
    ScanStarted(ScanParams),
    ScanRejected(String),
    ScanProgress(ScanProgress),
    ScanFinished {
        results: Vec<ScanResult>,
        outcome: ScanOutcome,
    },
    RecordingStarted {
        kind: RecordKind,
        path: PathBuf,
    },
    RecordingStopped {
        kind: RecordKind,
        path: PathBuf,
    },
    RecordingFailed {
        kind: RecordKind,
        reason: String,
    },
    ExportStateChanged(ExportState),
    PlaybackUnavailable(String),
}

/// Commands the acquisition thread hands to the audio thread
enum AudioCommand {
    SetMode(DemodMode),
    SetAgc(AgcParams),
    SetPlayback(bool),
    SetExport(bool),
    StartRecording,
    StopRecording,
    Shutdown,
}

impl AudioCommand {
    /// Split off the commands the audio thread owns.
    fn from_command(cmd: Command) -> Result<Self, Command> {
        match cmd {
            Command::SetMode(mode) => Ok(AudioCommand::SetMode(mode)),
            Command::SetAgc(params) => Ok(AudioCommand::SetAgc(params)),
            Command::SetPlayback(on) => Ok(AudioCommand::SetPlayback(on)),
            Command::SetExport(on) => Ok(AudioCommand::SetExport(on)),
            Command::StartRecording(RecordKind::Audio) => Ok(AudioCommand::StartRecording),
            Command::StopRecording(RecordKind::Audio) => Ok(AudioCommand::StopRecording),
            other => Err(other),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    blocks_read: AtomicU64,
    blocks_dropped: AtomicU64,
    audio_frames: AtomicU64,
}

/// Throughput counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub blocks_read: u64,
    /// Blocks the audio thread could not keep up with
    pub blocks_dropped: u64,
    pub audio_frames: u64,
}

/// Handle on a running session. Dropping it shuts both threads down.
pub struct Session {
    commands: Sender<Command>,
    events: Receiver<Event>,
    spectrum: Arc<Mutex<Option<SpectrumFrame>>>,
    scanning: Arc<AtomicBool>,
    counters: Arc<Counters>,
    demod: DemodStatus,
    acquisition: Option<JoinHandle<()>>,
    audio: Option<JoinHandle<()>>,
}

impl Session {
    /// Configure `source` and start the acquisition and audio threads.
    pub fn spawn(config: SessionConfig, mut source: Box<dyn SampleSource>) -> Result<Self, SessionError> {
        config.validate()?;
        source.configure(&config.tuning)?;
        log::info!(
            "Session on {}: {:.6} MHz, {} Hz, {}, blocks of {}",
            source.describe(),
            config.tuning.center_freq / 1e6,
            config.tuning.sample_rate,
            config.demod.mode,
            config.block_len
        );

        let (cmd_tx, cmd_rx) = unbounded();
        let (audio_tx, audio_rx) = unbounded();
        let (block_tx, block_rx) = bounded(config.audio_queue_blocks);
        let (event_tx, event_rx) = bounded(EVENT_QUEUE);

        let spectrum = Arc::new(Mutex::new(None));
        let scanning = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(Counters::default());

        let chain = DemodulatorChain::new(config.demod);
        let demod = chain.status();

        let audio_config = config.clone();
        let audio_events = event_tx.clone();
        let audio_counters = Arc::clone(&counters);
        let audio = std::thread::Builder::new().name("audio".into()).spawn(move || {
            let sink = build_sink(&audio_config, &audio_events);
            AudioPath {
                chain,
                sink,
                output_dir: audio_config.output_dir.clone(),
                playback_frames: audio_config.playback_buffer_frames,
                blocks: block_rx,
                commands: audio_rx,
                events: audio_events,
                counters: audio_counters,
                center_freq: audio_config.tuning.center_freq,
                export_state: None,
            }
            .run()
        })?;

        let acquisition = Acquisition {
            engine: SpectrumEngine::new(config.fft_size()),
            scanner: Scanner::new(config.scan),
            config,
            source,
            iq_recorder: None,
            healthy: true,
            commands: cmd_rx,
            audio_tx,
            blocks_tx: block_tx,
            events: event_tx,
            spectrum: Arc::clone(&spectrum),
            scanning: Arc::clone(&scanning),
            counters: Arc::clone(&counters),
        };
        let acquisition = std::thread::Builder::new()
            .name("acquisition".into())
            .spawn(move || acquisition.run())?;

        Ok(Self {
            commands: cmd_tx,
            events: event_rx,
            spectrum,
            scanning,
            counters,
            demod,
            acquisition: Some(acquisition),
            audio: Some(audio),
        })
    }

    pub fn send(&self, cmd: Command) -> Result<(), SessionError> {
        self.commands.send(cmd).map_err(|_| SessionError::Disconnected)
    }

    /// Retune the source. Refused while a scan owns it.
    pub fn tune(&self, tuning: Tuning) -> Result<(), SessionError> {
        if self.is_scanning() {
            return Err(SessionError::ScanActive);
        }
        tuning.validate()?;
        self.send(Command::Tune(tuning))
    }

    pub fn set_mode(&self, mode: DemodMode) -> Result<(), SessionError> {
        self.send(Command::SetMode(mode))
    }

    pub fn start_scan(&self, params: ScanParams) -> Result<(), SessionError> {
        params.validate()?;
        if self.scanning.swap(true, Ordering::SeqCst) {
            return Err(SessionError::ScanActive);
        }
        self.send(Command::StartScan(params))
    }

    pub fn cancel_scan(&self) -> Result<(), SessionError> {
        self.send(Command::CancelScan)
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    /// Most recent spectrum frame, if any block has been read yet.
    pub fn latest_spectrum(&self) -> Option<SpectrumFrame> {
        self.spectrum.lock().ok().and_then(|slot| slot.clone())
    }

    /// Live AGC gain and mode.
    pub fn demod_status(&self) -> DemodStatus {
        self.demod.clone()
    }

    pub fn events(&self) -> &Receiver<Event> {
        &self.events
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            blocks_read: self.counters.blocks_read.load(Ordering::Relaxed),
            blocks_dropped: self.counters.blocks_dropped.load(Ordering::Relaxed),
            audio_frames: self.counters.audio_frames.load(Ordering::Relaxed),
        }
    }

    /// Stop both threads and wait for them.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        for handle in [self.acquisition.take(), self.audio.take()].into_iter().flatten() {
            if handle.join().is_err() {
                log::error!("session thread panicked");
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Acquisition {
    config: SessionConfig,
    source: Box<dyn SampleSource>,
    engine: SpectrumEngine,
    scanner: Scanner,
    iq_recorder: Option<IqRecorder>,
    /// False after a device error until a retune succeeds
    healthy: bool,
    commands: Receiver<Command>,
    audio_tx: Sender<AudioCommand>,
    blocks_tx: Sender<SampleBlock>,
    events: Sender<Event>,
    spectrum: Arc<Mutex<Option<SpectrumFrame>>>,
    scanning: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl Acquisition {
    fn run(mut self) {
        log::info!("Acquisition started on {}", self.source.describe());
        while self.drain_commands() {
            if self.healthy {
                self.acquire();
            }
        }
        self.stop_iq_recording();
        let _ = self.audio_tx.send(AudioCommand::Shutdown);
        log::info!("Acquisition stopped");
    }

    fn emit(&self, event: Event) {
        if let Err(TrySendError::Full(event)) = self.events.try_send(event) {
            log::debug!("event queue full, dropped {:?}", event);
        }
    }

    /// Handle pending commands. Returns false once shutdown is requested.
    fn drain_commands(&mut self) -> bool {
        if !self.healthy {
            match self.commands.recv_timeout(IDLE_WAIT) {
                Ok(cmd) => {
                    if !self.handle(cmd) {
                        return false;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return false,
            }
        }
        loop {
            match self.commands.try_recv() {
                Ok(cmd) => {
                    if !self.handle(cmd) {
                        return false;
                    }
                }
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn handle(&mut self, cmd: Command) -> bool {
        let cmd = match AudioCommand::from_command(cmd) {
            Ok(audio) => {
                let _ = self.audio_tx.send(audio);
                return true;
            }
            Err(cmd) => cmd,
        };
        match cmd {
            Command::Tune(tuning) => self.retune(tuning),
            Command::SetWindow(window) => self.config.window = window,
            Command::SetAccumulation(accumulation) => {
                self.config.accumulation = accumulation;
                self.engine.reset();
            }
            Command::ResetPeakHold => self.engine.reset(),
            Command::StartScan(params) => return self.scan(params),
            Command::CancelScan => log::debug!("no scan to cancel"),
            Command::StartRecording(_) => self.start_iq_recording(),
            Command::StopRecording(_) => self.stop_iq_recording(),
            Command::Shutdown => return false,
            Command::SetMode(_) | Command::SetAgc(_) | Command::SetPlayback(_) | Command::SetExport(_) => {}
        }
        true
    }

    fn acquire(&mut self) {
        let started = Instant::now();
        let block = match self.source.read_block() {
            Ok(block) => block,
            Err(e) => {
                self.healthy = false;
                self.emit(Event::DeviceFailed(e.to_string()));
                return;
            }
        };
        self.counters.blocks_read.fetch_add(1, Ordering::Relaxed);

        let frame = self.engine.compute(&block, self.config.window, self.config.accumulation);
        if let Ok(mut slot) = self.spectrum.lock() {
            *slot = Some(frame);
        }

        let failed = match self.iq_recorder.as_mut() {
            Some(rec) => rec.write_block(&block).err(),
            None => None,
        };
        if let Some(e) = failed {
            log::warn!("IQ recording stopped: {}", e);
            if let Some(rec) = self.iq_recorder.take() {
                let _ = rec.finish();
            }
            self.emit(Event::RecordingFailed {
                kind: RecordKind::Iq,
                reason: e.to_string(),
            });
        }

        let duration = Duration::from_secs_f64(block.duration_secs());
        if let Err(TrySendError::Full(_)) = self.blocks_tx.try_send(block) {
            let dropped = self.counters.blocks_dropped.fetch_add(1, Ordering::Relaxed) + 1;
            log::debug!("audio path behind, {} block(s) dropped", dropped);
        }

        if self.config.pace {
            if let Some(rest) = duration.checked_sub(started.elapsed()) {
                std::thread::sleep(rest);
            }
        }
    }

    fn retune(&mut self, tuning: Tuning) {
        match self.source.configure(&tuning) {
            Ok(()) => {
                self.config.tuning = tuning;
                self.healthy = true;
                self.engine.reset();
                log::info!("Tuned to {:.6} MHz", tuning.center_freq / 1e6);
                self.emit(Event::Tuned(tuning));
            }
            Err(e) => {
                self.healthy = false;
                self.emit(Event::DeviceFailed(e.to_string()));
            }
        }
    }

    /// Run a sweep. Commands keep flowing between steps: cancel stops it,
    /// tuning is refused, audio commands pass through and the rest waits
    /// until the sweep is over.
    fn scan(&mut self, params: ScanParams) -> bool {
        if let Err(e) = params.validate() {
            self.scanning.store(false, Ordering::SeqCst);
            self.emit(Event::ScanRejected(e.to_string()));
            return true;
        }
        self.scanning.store(true, Ordering::SeqCst);
        self.scanner.set_params(params);
        self.emit(Event::ScanStarted(params));

        let base = self.config.tuning;
        let mut shutdown = false;
        let mut deferred = Vec::new();
        let commands = &self.commands;
        let events = &self.events;
        let audio_tx = &self.audio_tx;

        let report = self
            .scanner
            .run(self.source.as_mut(), &mut self.engine, &base, |progress| {
                let _ = events.try_send(Event::ScanProgress(*progress));
                let mut keep_going = true;
                loop {
                    let cmd = match commands.try_recv() {
                        Ok(cmd) => cmd,
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => {
                            shutdown = true;
                            return false;
                        }
                    };
                    let cmd = match AudioCommand::from_command(cmd) {
                        Ok(audio) => {
                            let _ = audio_tx.send(audio);
                            continue;
                        }
                        Err(cmd) => cmd,
                    };
                    match cmd {
                        Command::CancelScan => keep_going = false,
                        Command::Shutdown => {
                            shutdown = true;
                            keep_going = false;
                        }
                        Command::Tune(tuning) => {
                            log::warn!("Tune to {:.6} MHz refused during scan", tuning.center_freq / 1e6);
                            let _ = events.try_send(Event::TuneRejected(tuning));
                        }
                        Command::StartScan(_) => log::warn!("Scan already running"),
                        other => deferred.push(other),
                    }
                }
                keep_going
            });

        let (outcome, failure) = match report.status {
            ScanStatus::Completed => (ScanOutcome::Completed, None),
            ScanStatus::Cancelled => (ScanOutcome::Cancelled, None),
            ScanStatus::Aborted(e) => (ScanOutcome::Aborted(e.to_string()), Some(e)),
        };
        self.scanning.store(false, Ordering::SeqCst);
        self.emit(Event::ScanFinished {
            results: report.results,
            outcome,
        });
        if shutdown {
            return false;
        }

        match failure {
            // the source stays down until the caller retunes it
            Some(e) => {
                self.healthy = false;
                self.emit(Event::DeviceFailed(e.to_string()));
            }
            // back to where the listener was
            None => self.retune(base),
        }
        for cmd in deferred {
            if !self.handle(cmd) {
                return false;
            }
        }
        true
    }

    fn start_iq_recording(&mut self) {
        self.stop_iq_recording();
        let tuning = self.config.tuning;
        match IqRecorder::create(
            &self.config.output_dir,
            self.config.iq_format,
            tuning.sample_rate,
            tuning.center_freq,
        ) {
            Ok(rec) => {
                let path = rec.path().to_path_buf();
                self.iq_recorder = Some(rec);
                self.emit(Event::RecordingStarted {
                    kind: RecordKind::Iq,
                    path,
                });
            }
            Err(e) => {
                log::warn!("Cannot start IQ recording: {}", e);
                self.emit(Event::RecordingFailed {
                    kind: RecordKind::Iq,
                    reason: e.to_string(),
                });
            }
        }
    }

    fn stop_iq_recording(&mut self) {
        let Some(rec) = self.iq_recorder.take() else {
            return;
        };
        match rec.finish() {
            Ok(path) => self.emit(Event::RecordingStopped {
                kind: RecordKind::Iq,
                path,
            }),
            Err(e) => self.emit(Event::RecordingFailed {
                kind: RecordKind::Iq,
                reason: e.to_string(),
            }),
        }
    }
}

struct AudioPath {
    chain: DemodulatorChain,
    sink: AudioSink,
    output_dir: PathBuf,
    playback_frames: usize,
    blocks: Receiver<SampleBlock>,
    commands: Receiver<AudioCommand>,
    events: Sender<Event>,
    counters: Arc<Counters>,
    center_freq: f64,
    export_state: Option<ExportState>,
}

impl AudioPath {
    fn run(mut self) {
        log::info!("Audio path started ({} Hz stereo)", AUDIO_RATE);
        'outer: loop {
            loop {
                match self.commands.try_recv() {
                    Ok(AudioCommand::Shutdown) | Err(TryRecvError::Disconnected) => break 'outer,
                    Ok(cmd) => self.handle(cmd),
                    Err(TryRecvError::Empty) => break,
                }
            }

            match self.blocks.recv_timeout(AUDIO_WAIT) {
                Ok(block) => {
                    self.center_freq = block.center_freq;
                    let frames = DemodulatorChain::frames_for(&block);
                    let frame = self.chain.process(&block, frames);
                    self.sink.push(&frame);
                    self.counters.audio_frames.fetch_add(frames as u64, Ordering::Relaxed);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            let state = self.sink.poll();
            if state != self.export_state {
                self.export_state = state;
                if let Some(state) = state {
                    let _ = self.events.try_send(Event::ExportStateChanged(state));
                }
            }
        }
        self.sink.shutdown();
        log::info!("Audio path stopped");
    }

    fn handle(&mut self, cmd: AudioCommand) {
        match cmd {
            AudioCommand::SetMode(mode) => self.chain.set_mode(mode),
            AudioCommand::SetAgc(params) => self.chain.set_agc(params),
            AudioCommand::SetPlayback(false) => self.sink.set_playback(None),
            AudioCommand::SetPlayback(true) => {
                if !self.sink.playback_enabled() {
                    let playback = open_playback(self.playback_frames, &self.events);
                    self.sink.set_playback(playback);
                }
            }
            AudioCommand::SetExport(on) => self.sink.set_export_enabled(on),
            AudioCommand::StartRecording => {
                let event = match self.sink.start_recording(&self.output_dir, AUDIO_RATE, self.center_freq) {
                    Ok(path) => Event::RecordingStarted {
                        kind: RecordKind::Audio,
                        path,
                    },
                    Err(e) => Event::RecordingFailed {
                        kind: RecordKind::Audio,
                        reason: e.to_string(),
                    },
                };
                let _ = self.events.try_send(event);
            }
            AudioCommand::StopRecording => {
                if let Ok(path) = self.sink.stop_recording() {
                    let _ = self.events.try_send(Event::RecordingStopped {
                        kind: RecordKind::Audio,
                        path,
                    });
                }
            }
            AudioCommand::Shutdown => {}
        }
    }
}

fn build_sink(config: &SessionConfig, events: &Sender<Event>) -> AudioSink {
    let playback = if config.playback {
        open_playback(config.playback_buffer_frames, events)
    } else {
        None
    };

    #[cfg(unix)]
    let export = config.export_fifo.as_ref().map(|path| {
        let mut channel = ExportChannel::new(Arc::new(crate::audio::FifoTarget::new(path)));
        channel.enable();
        channel
    });
    #[cfg(not(unix))]
    let export: Option<ExportChannel> = {
        if config.export_fifo.is_some() {
            log::warn!("Export FIFO is only available on unix");
        }
        None
    };

    AudioSink::new(playback, export)
}

#[cfg(feature = "playback")]
fn open_playback(capacity_frames: usize, events: &Sender<Event>) -> Option<Playback> {
    match Playback::open_default(AUDIO_RATE, capacity_frames) {
        Ok(playback) => Some(playback),
        Err(e) => {
            log::warn!("Playback unavailable: {}", e);
            let _ = events.try_send(Event::PlaybackUnavailable(e.to_string()));
            None
        }
    }
}

#[cfg(not(feature = "playback"))]
fn open_playback(_capacity_frames: usize, events: &Sender<Event>) -> Option<Playback> {
    let reason = "built without the `playback` feature";
    log::warn!("Playback unavailable: {}", reason);
    let _ = events.try_send(Event::PlaybackUnavailable(reason.into()));
    None
}
