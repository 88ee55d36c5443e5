//! Export of demodulated audio to an external decoder process.
//!
//! The stream is always 22 050 Hz, signed 16-bit little-endian mono no
//! matter what the playback side uses. Opening the channel may block until
//! a consumer shows up, so it runs on a helper thread and the owner polls.
//! Once attached, PCM goes through a bounded queue to a writer thread; a
//! consumer that stops reading costs dropped audio, never a stalled caller.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};

use super::AudioFrame;

pub const EXPORT_RATE: u32 = 22_050;
/// How long a close waits for an abandoned open to give up its writer
const ABANDON_WAIT: Duration = Duration::from_secs(1);
/// Frames queued for the writer thread before new ones are dropped
pub const EXPORT_QUEUE_FRAMES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportState {
    Idle,
    Opening,
    Attached,
    Closing,
}

/// Something an external consumer attaches to.
pub trait ExportTarget: Send + Sync {
    /// Block until a consumer attaches and return the write end.
    fn open(&self) -> io::Result<Box<dyn Write + Send>>;

    /// Unblock a pending [`open`](Self::open) that is being abandoned.
    fn cancel(&self) {}

    fn describe(&self) -> String;
}

/// Named pipe on the local filesystem (created on first open).
#[cfg(unix)]
pub struct FifoTarget {
    path: PathBuf,
}

#[cfg(unix)]
impl FifoTarget {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_fifo(&self) -> io::Result<()> {
        use nix::errno::Errno;
        use nix::sys::stat::Mode;

        match nix::unistd::mkfifo(self.path.as_path(), Mode::S_IRUSR | Mode::S_IWUSR) {
            Ok(()) => {
                log::info!("Created FIFO {}", self.path.display());
                Ok(())
            }
            Err(Errno::EEXIST) => Ok(()),
            Err(e) => Err(io::Error::from(e)),
        }
    }
}

#[cfg(unix)]
impl ExportTarget for FifoTarget {
    fn open(&self) -> io::Result<Box<dyn Write + Send>> {
        self.ensure_fifo()?;
        // blocks until a reader opens the other end
        let file = std::fs::OpenOptions::new().write(true).open(&self.path)?;
        Ok(Box::new(io::BufWriter::new(file)))
    }

    fn cancel(&self) {
        use nix::fcntl::OFlag;
        use std::os::unix::fs::OpenOptionsExt;

        // A momentary reader releases a writer stuck in open().
        let _ = std::fs::OpenOptions::new()
            .read(true)
            .custom_flags(OFlag::O_NONBLOCK.bits())
            .open(&self.path);
    }

    fn describe(&self) -> String {
        format!("FIFO {}", self.path.display())
    }
}

/// Continuous linear resampler from the stereo frame rate to the export
/// rate, mixing to mono.
#[derive(Debug, Clone)]
struct MonoDownsampler {
    /// Read position relative to the current block; -1 addresses `prev`
    pos: f64,
    prev: f32,
}

impl Default for MonoDownsampler {
    fn default() -> Self {
        Self { pos: 0.0, prev: 0.0 }
    }
}

impl MonoDownsampler {
    fn process(&mut self, frame: &AudioFrame, out_rate: u32) -> Vec<i16> {
        let mono: Vec<f32> = frame.samples.chunks_exact(2).map(|lr| 0.5 * (lr[0] + lr[1])).collect();
        if mono.is_empty() || frame.sample_rate == 0 {
            return Vec::new();
        }
        let step = frame.sample_rate as f64 / out_rate as f64;
        let n = mono.len();
        let at = |idx: isize| if idx < 0 { self.prev } else { mono[idx as usize] };

        let mut out = Vec::with_capacity((n as f64 / step) as usize + 1);
        let mut pos = self.pos;
        while pos <= (n - 1) as f64 {
            let i = pos.floor() as isize;
            let frac = (pos - i as f64) as f32;
            let a = at(i);
            let b = if i + 1 < n as isize { at(i + 1) } else { a };
            let s = a + (b - a) * frac;
            out.push((s.clamp(-1.0, 1.0) * 32767.0).round() as i16);
            pos += step;
        }
        self.pos = pos - n as f64;
        self.prev = mono[n - 1];
        out
    }
}

/// Attached consumer: the queue into its writer thread and what comes back.
struct ExportLink {
    pcm: Sender<Vec<u8>>,
    failed: Receiver<io::Error>,
    done: Receiver<()>,
}

impl ExportLink {
    fn spawn(mut writer: Box<dyn Write + Send>) -> io::Result<Self> {
        let (pcm, queue) = bounded::<Vec<u8>>(EXPORT_QUEUE_FRAMES);
        let (failed_tx, failed) = bounded(1);
        let (done_tx, done) = bounded(1);
        std::thread::Builder::new().name("export-write".into()).spawn(move || {
            for chunk in queue.iter() {
                if let Err(e) = writer.write_all(&chunk).and_then(|_| writer.flush()) {
                    let _ = failed_tx.send(e);
                    break;
                }
            }
            let _ = done_tx.send(());
        })?;
        Ok(Self { pcm, failed, done })
    }
}

/// Four-state export channel. Never blocks the caller.
pub struct ExportChannel {
    target: Arc<dyn ExportTarget>,
    state: ExportState,
    enabled: bool,
    pending: Option<Receiver<io::Result<Box<dyn Write + Send>>>>,
    closing: Option<Receiver<()>>,
    link: Option<ExportLink>,
    downsampler: MonoDownsampler,
    samples_written: u64,
    samples_dropped: u64,
}

impl ExportChannel {
    pub fn new(target: Arc<dyn ExportTarget>) -> Self {
        Self {
            target,
            state: ExportState::Idle,
            enabled: false,
            pending: None,
            closing: None,
            link: None,
            downsampler: MonoDownsampler::default(),
            samples_written: 0,
            samples_dropped: 0,
        }
    }

    pub fn state(&self) -> ExportState {
        self.state
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Samples handed to the consumer's queue
    pub fn samples_written(&self) -> u64 {
        self.samples_written
    }

    /// Samples discarded because the consumer fell behind
    pub fn samples_dropped(&self) -> u64 {
        self.samples_dropped
    }

    pub fn describe(&self) -> String {
        self.target.describe()
    }

    pub fn enable(&mut self) {
        self.enabled = true;
        if self.state == ExportState::Idle {
            self.start_open();
        }
    }

    /// Close regardless of attachment; the channel passes through Closing.
    pub fn disable(&mut self) {
        self.enabled = false;
        match self.state {
            ExportState::Opening => {
                let pending = self.pending.take();
                let target = Arc::clone(&self.target);
                self.spawn_closer(move || {
                    target.cancel();
                    if let Some(rx) = pending {
                        // drop the late writer, if any
                        let _ = rx.recv_timeout(ABANDON_WAIT);
                    }
                });
            }
            ExportState::Attached => {
                let link = self.link.take();
                self.spawn_closer(move || {
                    if let Some(ExportLink { pcm, done, .. }) = link {
                        // closing the queue lets the writer drain and exit;
                        // a consumer that never reads leaves it behind
                        drop(pcm);
                        let _ = done.recv_timeout(ABANDON_WAIT);
                    }
                });
            }
            ExportState::Idle | ExportState::Closing => {}
        }
    }

    fn start_open(&mut self) {
        let (tx, rx) = bounded(1);
        let target = Arc::clone(&self.target);
        let spawned = std::thread::Builder::new()
            .name("export-open".into())
            .spawn(move || {
                let _ = tx.send(target.open());
            });
        match spawned {
            Ok(_) => {
                log::info!("Export channel waiting for a consumer on {}", self.target.describe());
                self.pending = Some(rx);
                self.state = ExportState::Opening;
            }
            Err(e) => {
                log::warn!("Export channel could not start opener: {}", e);
                self.enabled = false;
                self.state = ExportState::Idle;
            }
        }
    }

    fn spawn_closer<F: FnOnce() + Send + 'static>(&mut self, work: F) {
        let (tx, rx) = bounded(1);
        let spawned = std::thread::Builder::new()
            .name("export-close".into())
            .spawn(move || {
                work();
                let _ = tx.send(());
            });
        if spawned.is_ok() {
            self.closing = Some(rx);
            self.state = ExportState::Closing;
        } else {
            self.state = ExportState::Idle;
        }
    }

    /// Advance the state machine. Call once per processing cycle.
    pub fn poll(&mut self) -> ExportState {
        match self.state {
            ExportState::Opening => {
                let result = match &self.pending {
                    Some(rx) => rx.try_recv(),
                    None => Err(TryRecvError::Disconnected),
                };
                match result {
                    Err(TryRecvError::Empty) => {}
                    Ok(Ok(writer)) => {
                        self.pending = None;
                        match ExportLink::spawn(writer) {
                            Ok(link) => {
                                self.link = Some(link);
                                self.downsampler = MonoDownsampler::default();
                                self.state = ExportState::Attached;
                                log::info!("Export consumer attached to {}", self.target.describe());
                            }
                            Err(e) => {
                                log::warn!("Export channel could not start writer: {}", e);
                                self.enabled = false;
                                self.state = ExportState::Idle;
                            }
                        }
                    }
                    Ok(Err(e)) => {
                        log::warn!("Export channel open failed: {}", e);
                        self.pending = None;
                        self.enabled = false;
                        self.state = ExportState::Idle;
                    }
                    Err(TryRecvError::Disconnected) => {
                        self.pending = None;
                        self.enabled = false;
                        self.state = ExportState::Idle;
                    }
                }
            }
            ExportState::Closing => {
                let done = match &self.closing {
                    Some(rx) => !matches!(rx.try_recv(), Err(TryRecvError::Empty)),
                    None => true,
                };
                if done {
                    self.closing = None;
                    self.state = ExportState::Idle;
                    log::info!("Export channel closed");
                    if self.enabled {
                        self.start_open();
                    }
                }
            }
            ExportState::Attached => {
                let failure = match &self.link {
                    Some(link) => match link.failed.try_recv() {
                        Ok(e) => Some(e),
                        Err(TryRecvError::Empty) => None,
                        Err(TryRecvError::Disconnected) => Some(io::Error::from(io::ErrorKind::BrokenPipe)),
                    },
                    None => Some(io::Error::from(io::ErrorKind::NotConnected)),
                };
                if let Some(e) = failure {
                    self.detach(e);
                }
            }
            ExportState::Idle => {}
        }
        self.state
    }

    fn detach(&mut self, e: io::Error) {
        log::warn!("Export consumer detached ({}), channel idle", e);
        self.link = None;
        self.enabled = false;
        self.state = ExportState::Idle;
    }

    /// Queue a frame for the consumer if one is attached. A full queue drops
    /// the frame; a failed consumer drops the channel back to Idle and leaves
    /// it disabled (noticed here or on the next [`poll`](Self::poll)).
    pub fn write(&mut self, frame: &AudioFrame) {
        if self.state != ExportState::Attached {
            return;
        }
        let pcm = self.downsampler.process(frame, EXPORT_RATE);
        let count = pcm.len() as u64;
        let bytes: Vec<u8> = pcm.iter().flat_map(|s| s.to_le_bytes()).collect();

        let sent = match &self.link {
            Some(link) => link.pcm.try_send(bytes),
            None => Err(TrySendError::Disconnected(bytes)),
        };
        match sent {
            Ok(()) => self.samples_written += count,
            Err(TrySendError::Full(_)) => {
                self.samples_dropped += count;
                log::debug!("export consumer behind, {} samples dropped", self.samples_dropped);
            }
            Err(TrySendError::Disconnected(_)) => {
                let e = self
                    .link
                    .as_ref()
                    .and_then(|link| link.failed.try_recv().ok())
                    .unwrap_or_else(|| io::Error::from(io::ErrorKind::BrokenPipe));
                self.detach(e);
            }
        }
    }
}

impl Drop for ExportChannel {
    fn drop(&mut self) {
        if self.state == ExportState::Opening {
            self.target.cancel();
        }
    }
}
