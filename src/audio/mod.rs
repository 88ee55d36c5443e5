//! Audio delivery: live playback, the export channel and the audio recorder.

pub mod export;
pub mod playback;

pub use export::{ExportChannel, ExportState, ExportTarget, EXPORT_RATE};
#[cfg(unix)]
pub use export::FifoTarget;
pub use playback::Playback;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::RecordError;
use crate::output::AudioRecorder;

/// Every audio frame is interleaved stereo
pub const CHANNELS: usize = 2;

/// Interleaved stereo samples (L, R, L, R, ...) at `sample_rate`
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn silence(frames: usize, sample_rate: u32) -> Self {
        Self {
            samples: vec![0.0; frames * CHANNELS],
            sample_rate,
        }
    }

    /// Duplicate a mono signal onto both channels.
    pub fn from_mono(mono: &[f32], sample_rate: u32) -> Self {
        Self {
            samples: mono.iter().flat_map(|&s| [s, s]).collect(),
            sample_rate,
        }
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / CHANNELS
    }

    pub fn rms(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        (self.samples.iter().map(|s| s * s).sum::<f32>() / self.samples.len() as f32).sqrt()
    }
}

/// Fan-out of demodulated audio. Each output can be toggled independently;
/// a failing output never stops the others.
pub struct AudioSink {
    playback: Option<Playback>,
    export: Option<ExportChannel>,
    recorder: Option<AudioRecorder>,
    level: f32,
}

impl AudioSink {
    pub fn new(playback: Option<Playback>, export: Option<ExportChannel>) -> Self {
        Self {
            playback,
            export,
            recorder: None,
            level: 0.0,
        }
    }

    pub fn push(&mut self, frame: &AudioFrame) {
        self.level = frame.rms();

        if let Some(playback) = self.playback.as_mut() {
            playback.push(frame);
        }
        if let Some(export) = self.export.as_mut() {
            export.write(frame);
        }
        let failed = match self.recorder.as_mut() {
            Some(rec) => rec.write(frame).err(),
            None => None,
        };
        if let Some(e) = failed {
            log::warn!("Audio recording stopped: {}", e);
            if let Some(rec) = self.recorder.take() {
                let _ = rec.finish();
            }
        }
    }

    /// Advance the export state machine. Call once per cycle.
    pub fn poll(&mut self) -> Option<ExportState> {
        self.export.as_mut().map(ExportChannel::poll)
    }

    pub fn set_playback(&mut self, playback: Option<Playback>) {
        self.playback = playback;
    }

    pub fn playback_enabled(&self) -> bool {
        self.playback.is_some()
    }

    pub fn playback_dropped(&self) -> u64 {
        self.playback.as_ref().map_or(0, Playback::dropped)
    }

    /// Replace the export channel; the old one is closed.
    pub fn set_export_target(&mut self, target: Arc<dyn ExportTarget>) {
        if let Some(mut old) = self.export.take() {
            old.disable();
        }
        self.export = Some(ExportChannel::new(target));
    }

    pub fn set_export_enabled(&mut self, enabled: bool) {
        match self.export.as_mut() {
            Some(ch) if enabled => ch.enable(),
            Some(ch) => ch.disable(),
            None if enabled => log::warn!("No export target configured"),
            None => {}
        }
    }

    pub fn export_state(&self) -> Option<ExportState> {
        self.export.as_ref().map(ExportChannel::state)
    }

    pub fn start_recording(&mut self, dir: &Path, sample_rate: u32, center_freq: f64) -> Result<PathBuf, RecordError> {
        if let Some(old) = self.recorder.take() {
            old.finish()?;
        }
        let rec = AudioRecorder::create(dir, sample_rate, center_freq)?;
        let path = rec.path().to_path_buf();
        self.recorder = Some(rec);
        Ok(path)
    }

    pub fn stop_recording(&mut self) -> Result<PathBuf, RecordError> {
        self.recorder.take().ok_or(RecordError::NotRecording)?.finish()
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.is_some()
    }

    /// RMS of the last frame pushed.
    pub fn level(&self) -> f32 {
        self.level
    }

    /// Close every output.
    pub fn shutdown(&mut self) {
        if let Some(export) = self.export.as_mut() {
            export.disable();
        }
        if let Some(rec) = self.recorder.take() {
            if let Err(e) = rec.finish() {
                log::warn!("Closing audio recording failed: {}", e);
            }
        }
        self.playback = None;
    }
}

#[cfg(test)]
mod tests {
    use super::export::tests::{poll_until, wait_until, LoopbackTarget};
    use super::*;
    use crate::demod::{DemodConfig, DemodulatorChain};
    use crate::input::{IqSample, SampleBlock, Tuning};

    #[test]
    fn from_mono_duplicates_channels() {
        let frame = AudioFrame::from_mono(&[0.1, 0.2], 48_000);
        assert_eq!(frame.samples, vec![0.1, 0.1, 0.2, 0.2]);
        assert_eq!(frame.frames(), 2);
    }

    #[test]
    fn broken_export_does_not_disturb_the_rest() {
        let target = LoopbackTarget::new();
        let (playback, mut consumer) = Playback::detached(48_000);
        let mut sink = AudioSink::new(Some(playback), Some(ExportChannel::new(target.clone())));
        let mut chain = DemodulatorChain::new(DemodConfig::default());
        let tuning = Tuning {
            sample_rate: 48_000,
            ..Tuning::default()
        };

        sink.set_export_enabled(true);
        assert_eq!(sink.export_state(), Some(ExportState::Opening));
        target.attach();
        let export = sink.export.as_mut().unwrap();
        assert!(poll_until(export, ExportState::Attached));

        target.break_pipe();
        for n in 0..5 {
            let samples = (0..480)
                .map(|k| {
                    let p = 0.2 * (n * 480 + k) as f32;
                    IqSample::new(p.cos(), p.sin())
                })
                .collect();
            let block = SampleBlock::new(samples, &tuning);
            let frame = chain.process(&block, 480);
            sink.push(&frame);
            sink.poll();
        }
        assert!(wait_until(|| sink.poll() == Some(ExportState::Idle)));
        let mut queued = 0;
        while consumer.pop().is_some() {
            queued += 1;
        }
        assert_eq!(queued, 5 * 480 * 2);
    }

    #[test]
    fn recording_toggles() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = AudioSink::new(None, None);
        assert!(matches!(sink.stop_recording(), Err(RecordError::NotRecording)));
        let path = sink.start_recording(dir.path(), 48_000, 145e6).unwrap();
        sink.push(&AudioFrame::silence(100, 48_000));
        assert!(sink.is_recording());
        assert_eq!(sink.stop_recording().unwrap(), path);
        assert_eq!(hound::WavReader::open(&path).unwrap().duration(), 100);
    }
}
