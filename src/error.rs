use std::io;
use thiserror::Error;

/// Acquisition or tuning failure reported by a [`SampleSource`](crate::input::SampleSource).
///
/// After any of these the source is unusable until it is configured again.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device disconnected: {0}")]
    Disconnected(String),

    #[error("timed out waiting for samples after {0} ms")]
    Timeout(u64),

    #[error("unsupported configuration: {0}")]
    Unsupported(String),

    #[error("source is unusable until reconfigured")]
    Unusable,

    #[error("device I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DeviceError {
    /// Map a read error from a byte stream onto the device taxonomy.
    pub fn from_read(err: io::Error, timeout_ms: u64) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => DeviceError::Disconnected(err.to_string()),
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => DeviceError::Timeout(timeout_ms),
            _ => DeviceError::Io(err),
        }
    }
}

/// Failure while creating or writing a recording file.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("recording I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("WAV encoding error: {0}")]
    Wav(#[from] hound::Error),

    #[error("no recording in progress")]
    NotRecording,
}

/// Failure to bring up the live audio output.
#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("no default output device")]
    NoDevice,

    #[error("audio device error: {0}")]
    Device(String),

    #[error("unsupported output sample format {0}")]
    UnsupportedFormat(String),
}

/// Failure of a session-level request.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("a scan is in progress; manual tuning is locked")]
    ScanActive,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid scan range: {0}")]
    InvalidScan(String),

    #[error("session thread is no longer running")]
    Disconnected,

    #[error("session I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Record(#[from] RecordError),
}

pub type DeviceResult<T> = Result<T, DeviceError>;
