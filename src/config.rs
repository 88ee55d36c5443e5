use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::demod::DemodConfig;
use crate::error::SessionError;
use crate::input::Tuning;
use crate::output::IqFormat;
use crate::scanner::ScanParams;
use crate::spectrum::{marker_width_bins, Accumulation, WindowKind};

/// Everything a session runs with. The session owns its copy; whoever wants
/// to persist settings serializes this structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub tuning: Tuning,
    /// Samples per acquisition block; also sets the spectrum bin count
    pub block_len: usize,
    pub window: WindowKind,
    pub accumulation: Accumulation,
    /// Channel bandwidth shown around the center marker
    pub bandwidth_hz: f64,
    /// Share of `bandwidth_hz` the center marker spans
    pub marker_fraction: f64,
    pub demod: DemodConfig,
    pub scan: ScanParams,
    pub playback: bool,
    /// Playback ring size in stereo frames
    pub playback_buffer_frames: usize,
    /// Named pipe for the export channel; enabled at start when set
    pub export_fifo: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub iq_format: IqFormat,
    /// Blocks queued between acquisition and demodulation before dropping
    pub audio_queue_blocks: usize,
    /// Sleep between blocks to emulate real time (file and synthetic sources)
    pub pace: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tuning: Tuning::default(),
            block_len: 16_384,
            window: WindowKind::Hamming,
            accumulation: Accumulation::Instantaneous,
            bandwidth_hz: 12_500.0,
            marker_fraction: 1.0,
            demod: DemodConfig::default(),
            scan: ScanParams::default(),
            playback: true,
            playback_buffer_frames: 48_000,
            export_fifo: None,
            output_dir: PathBuf::from("./recordings"),
            iq_format: IqFormat::Float32,
            audio_queue_blocks: 8,
            pace: false,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), SessionError> {
        self.tuning.validate()?;
        if self.block_len == 0 {
            return Err(SessionError::InvalidConfig("block length of 0 samples".into()));
        }
        if self.audio_queue_blocks == 0 {
            return Err(SessionError::InvalidConfig("audio queue of 0 blocks".into()));
        }
        Ok(())
    }

    /// Spectrum bins per frame: the block length, rounded up to a power of
    /// two for the transform.
    pub fn fft_size(&self) -> usize {
        self.block_len.max(1).next_power_of_two()
    }

    /// Spectrum bin spacing at the configured rate.
    pub fn resolution_hz(&self) -> f64 {
        self.tuning.sample_rate as f64 / self.fft_size() as f64
    }

    /// Width of the center marker in bins.
    pub fn marker_width_bins(&self) -> f64 {
        marker_width_bins(self.marker_fraction, self.bandwidth_hz, self.resolution_hz())
    }
}
