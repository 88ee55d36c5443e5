//! Sample acquisition: the [`SampleSource`] contract and its implementations.

#[cfg(feature = "hardware")]
pub mod rtlsdr;
pub mod stream;
pub mod synthetic;
pub mod wav;

pub use stream::{StreamFormat, TcpSource};
pub use synthetic::{SyntheticSource, Tone};
pub use wav::WavSource;

use crate::error::{DeviceError, DeviceResult};
use chrono::{DateTime, Local};
use rustfft::num_complex::Complex;
use serde::{Deserialize, Serialize};

/// IQ sample pair (In-phase = `re`, Quadrature = `im`)
pub type IqSample = Complex<f32>;

/// Front-end tuning parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tuning {
    /// Requested center frequency in Hz
    pub center_freq: f64,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Tuner gain in dB, `None` for automatic
    pub gain: Option<f32>,
    /// Oscillator correction in parts per million
    pub ppm_correction: f64,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            center_freq: 100_000_000.0,
            sample_rate: 1_024_000,
            gain: None,
            ppm_correction: 0.0,
        }
    }
}

impl Tuning {
    /// Frequency actually programmed into the tuner once ppm correction is applied.
    pub fn effective_frequency(&self) -> f64 {
        self.center_freq * (1.0 + self.ppm_correction / 1e6)
    }

    pub fn with_center(self, center_freq: f64) -> Self {
        Self { center_freq, ..self }
    }

    /// Reject parameters no front-end can honor.
    pub fn validate(&self) -> DeviceResult<()> {
        if !self.center_freq.is_finite() || self.center_freq <= 0.0 {
            return Err(DeviceError::Unsupported(format!(
                "center frequency {} Hz",
                self.center_freq
            )));
        }
        if self.sample_rate == 0 {
            return Err(DeviceError::Unsupported("sample rate 0 Hz".into()));
        }
        if !self.ppm_correction.is_finite() || self.ppm_correction.abs() > 1000.0 {
            return Err(DeviceError::Unsupported(format!(
                "ppm correction {}",
                self.ppm_correction
            )));
        }
        Ok(())
    }
}

/// One fixed-length block of samples tagged with its acquisition context
#[derive(Debug, Clone)]
pub struct SampleBlock {
    pub samples: Vec<IqSample>,
    pub sample_rate: u32,
    pub center_freq: f64,
    pub timestamp: DateTime<Local>,
}

impl SampleBlock {
    pub fn new(samples: Vec<IqSample>, tuning: &Tuning) -> Self {
        Self {
            samples,
            sample_rate: tuning.sample_rate,
            center_freq: tuning.center_freq,
            timestamp: Local::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate.max(1) as f64
    }
}

/// Abstraction over a tunable radio front-end.
///
/// Implementations never retry internally. After a failed `configure` or
/// `read_block` every further read fails with [`DeviceError::Unusable`] until
/// `configure` succeeds again.
pub trait SampleSource: Send {
    /// Tune the front-end. The effective frequency is
    /// `center_freq * (1 + ppm_correction / 1e6)`.
    fn configure(&mut self, tuning: &Tuning) -> DeviceResult<()>;

    /// Read one block of exactly [`block_len`](Self::block_len) samples.
    fn read_block(&mut self) -> DeviceResult<SampleBlock>;

    /// Samples per block, fixed for the session.
    fn block_len(&self) -> usize;

    /// Current tuning, if configured.
    fn tuning(&self) -> Option<Tuning>;

    fn describe(&self) -> String;
}

/// Tuning and health bookkeeping shared by the source implementations.
#[derive(Debug, Default, Clone)]
pub(crate) struct SourceState {
    tuning: Option<Tuning>,
    usable: bool,
}

impl SourceState {
    pub(crate) fn accept(&mut self, tuning: &Tuning) {
        self.tuning = Some(*tuning);
        self.usable = true;
    }

    /// Tuning to read with, or `Unusable` after a failure.
    pub(crate) fn ready(&self) -> DeviceResult<Tuning> {
        match self.tuning {
            Some(t) if self.usable => Ok(t),
            _ => Err(DeviceError::Unusable),
        }
    }

    pub(crate) fn tuning(&self) -> Option<Tuning> {
        self.tuning
    }

    /// Mark the source failed and hand the error back for propagation.
    pub(crate) fn fail(&mut self, err: DeviceError) -> DeviceError {
        log::error!("sample source failed: {}", err);
        self.usable = false;
        err
    }
}
