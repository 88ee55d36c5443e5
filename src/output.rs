use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use hound::{SampleFormat, WavSpec, WavWriter};
use serde::{Deserialize, Serialize};

use crate::audio::{AudioFrame, CHANNELS};
use crate::error::RecordError;
use crate::input::{IqSample, SampleBlock};

/// Scale for int16 IQ, leaving some headroom below full scale
const IQ_INT16_SCALE: f32 = 32000.0;

type FileWriter = WavWriter<BufWriter<File>>;

/// Sample encoding for raw IQ recordings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IqFormat {
    /// Stereo int16 PCM, compatible with URH and most tools
    Int16,
    /// Stereo float32, compatible with inspectrum and SDR++
    Float32,
}

impl IqFormat {
    fn spec(&self, sample_rate: u32) -> WavSpec {
        match self {
            IqFormat::Int16 => WavSpec {
                channels: 2,
                sample_rate,
                bits_per_sample: 16,
                sample_format: SampleFormat::Int,
            },
            IqFormat::Float32 => WavSpec {
                channels: 2,
                sample_rate,
                bits_per_sample: 32,
                sample_format: SampleFormat::Float,
            },
        }
    }
}

fn write_iq_samples<W>(writer: &mut WavWriter<W>, samples: &[IqSample], format: IqFormat) -> Result<(), RecordError>
where
    W: std::io::Write + std::io::Seek,
{
    match format {
        IqFormat::Int16 => {
            for sample in samples {
                let i = (sample.re * IQ_INT16_SCALE).clamp(-32768.0, 32767.0) as i16;
                let q = (sample.im * IQ_INT16_SCALE).clamp(-32768.0, 32767.0) as i16;
                writer.write_sample(i)?;
                writer.write_sample(q)?;
            }
        }
        IqFormat::Float32 => {
            for sample in samples {
                writer.write_sample(sample.re)?;
                writer.write_sample(sample.im)?;
            }
        }
    }
    Ok(())
}

/// Generate a recording filename from its kind, tuned frequency and start time
pub fn generate_filename(kind: &str, center_freq: f64, start: DateTime<Local>) -> String {
    format!(
        "{}_{:.6}MHz_{}.wav",
        kind,
        center_freq / 1e6,
        start.format("%Y-%m-%d_%H-%M-%S-%3f")
    )
}

/// Maximum `_N` suffixes tried when a recording name is already taken
const MAX_NAME_SUFFIX: u32 = 1000;

fn create_in(dir: &Path, kind: &str, center_freq: f64, spec: WavSpec) -> Result<(FileWriter, PathBuf), RecordError> {
    std::fs::create_dir_all(dir)?;
    let name = generate_filename(kind, center_freq, Local::now());
    let (file, path) = create_unique(dir, &name)?;
    let writer = WavWriter::new(BufWriter::new(file), spec)?;
    log::info!(
        "Recording {} to {} ({} Hz, {} ch)",
        kind,
        path.display(),
        spec.sample_rate,
        spec.channels
    );
    Ok((writer, path))
}

/// Create `name` in `dir`, or `name` with a `_N` suffix if it exists.
fn create_unique(dir: &Path, name: &str) -> Result<(File, PathBuf), RecordError> {
    let stem = name.strip_suffix(".wav").unwrap_or(name);
    for n in 0..MAX_NAME_SUFFIX {
        let path = if n == 0 {
            dir.join(name)
        } else {
            dir.join(format!("{}_{}.wav", stem, n))
        };
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((file, path)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(io::Error::new(io::ErrorKind::AlreadyExists, format!("no free name for {} in {}", name, dir.display())).into())
}

/// Streaming recorder for demodulated stereo audio (int16)
pub struct AudioRecorder {
    writer: FileWriter,
    path: PathBuf,
    frames: u64,
}

impl AudioRecorder {
    pub fn create(dir: &Path, sample_rate: u32, center_freq: f64) -> Result<Self, RecordError> {
        let spec = WavSpec {
            channels: CHANNELS as u16,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let (writer, path) = create_in(dir, "audio", center_freq, spec)?;
        Ok(Self { writer, path, frames: 0 })
    }

    pub fn write(&mut self, frame: &AudioFrame) -> Result<(), RecordError> {
        for &s in &frame.samples {
            self.writer.write_sample((s.clamp(-1.0, 1.0) * 32767.0) as i16)?;
        }
        self.frames += frame.frames() as u64;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Patch the header and close the file.
    pub fn finish(self) -> Result<PathBuf, RecordError> {
        self.writer.finalize()?;
        log::info!("Recording closed: {} ({} frames)", self.path.display(), self.frames);
        Ok(self.path)
    }
}

/// Streaming recorder for raw IQ blocks, I on the left channel and Q on the right
pub struct IqRecorder {
    writer: FileWriter,
    path: PathBuf,
    format: IqFormat,
    sample_rate: u32,
    samples: u64,
}

impl IqRecorder {
    pub fn create(dir: &Path, format: IqFormat, sample_rate: u32, center_freq: f64) -> Result<Self, RecordError> {
        let (writer, path) = create_in(dir, "iq", center_freq, format.spec(sample_rate))?;
        Ok(Self {
            writer,
            path,
            format,
            sample_rate,
            samples: 0,
        })
    }

    pub fn write_block(&mut self, block: &SampleBlock) -> Result<(), RecordError> {
        if block.sample_rate != self.sample_rate {
            log::warn!(
                "IQ block at {} Hz does not match recording rate {} Hz, skipped",
                block.sample_rate,
                self.sample_rate
            );
            return Ok(());
        }
        write_iq_samples(&mut self.writer, &block.samples, self.format)?;
        self.samples += block.len() as u64;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn finish(self) -> Result<PathBuf, RecordError> {
        self.writer.finalize()?;
        log::info!("IQ recording closed: {} ({} samples)", self.path.display(), self.samples);
        Ok(self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::Tuning;
    use chrono::TimeZone;
    use hound::WavReader;

    #[test]
    fn filename_carries_frequency_and_time() {
        let t = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(
            generate_filename("iq", 433_920_000.0, t),
            "iq_433.920000MHz_2024-03-09_14-05-07-000.wav"
        );
        let later = t + chrono::Duration::milliseconds(250);
        assert_eq!(
            generate_filename("audio", 100e6, later),
            "audio_100.000000MHz_2024-03-09_14-05-07-250.wav"
        );
    }

    #[test]
    fn back_to_back_recordings_get_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let t = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        let name = generate_filename("iq", 433_920_000.0, t);
        let (_, first) = create_unique(dir.path(), &name).unwrap();
        let (_, second) = create_unique(dir.path(), &name).unwrap();
        assert_ne!(first, second);
        assert!(second.to_string_lossy().ends_with("-000_1.wav"), "{}", second.display());

        let a = IqRecorder::create(dir.path(), IqFormat::Int16, 48_000, 100e6).unwrap();
        let b = IqRecorder::create(dir.path(), IqFormat::Int16, 48_000, 100e6).unwrap();
        assert_ne!(a.path(), b.path());
        let (a, b) = (a.finish().unwrap(), b.finish().unwrap());
        assert!(a.exists() && b.exists());
    }

    #[test]
    fn audio_recording_has_stereo_header() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = AudioRecorder::create(dir.path(), 48_000, 100e6).unwrap();
        rec.write(&AudioFrame::from_mono(&[0.5, -0.5, 2.0], 48_000)).unwrap();
        let path = rec.finish().unwrap();

        let mut reader = WavReader::open(&path).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 2);
        assert_eq!(spec.sample_rate, 48_000);
        assert_eq!(spec.bits_per_sample, 16);
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![16383, 16383, -16383, -16383, 32767, 32767]);
    }

    #[test]
    fn iq_recording_streams_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let tuning = Tuning {
            sample_rate: 96_000,
            ..Tuning::default()
        };
        let mut rec = IqRecorder::create(dir.path(), IqFormat::Float32, 96_000, tuning.center_freq).unwrap();
        let block = SampleBlock::new(vec![IqSample::new(0.25, -0.75); 64], &tuning);
        rec.write_block(&block).unwrap();
        rec.write_block(&block).unwrap();
        assert_eq!(rec.samples(), 128);
        let path = rec.finish().unwrap();

        let (samples, rate) = crate::input::wav::read_iq_wav(&path).unwrap();
        assert_eq!(rate, 96_000);
        assert_eq!(samples.len(), 128);
        assert_eq!(samples[5], IqSample::new(0.25, -0.75));
    }

    #[test]
    fn int16_iq_keeps_headroom() {
        let dir = tempfile::tempdir().unwrap();
        let tuning = Tuning {
            sample_rate: 48_000,
            ..Tuning::default()
        };
        let mut rec = IqRecorder::create(dir.path(), IqFormat::Int16, 48_000, tuning.center_freq).unwrap();
        rec.write_block(&SampleBlock::new(vec![IqSample::new(1.0, -1.0)], &tuning)).unwrap();
        let path = rec.finish().unwrap();
        let mut reader = WavReader::open(&path).unwrap();
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![32000, -32000]);
    }
}
