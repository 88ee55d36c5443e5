use hound::{SampleFormat, WavReader};
use std::io::Read;
use std::path::Path;

use super::{IqSample, SampleBlock, SampleSource, SourceState, Tuning};
use crate::error::{DeviceError, DeviceResult};

/// Read IQ samples from an SDR++ style WAV file
/// IQ is stored as stereo: I=left channel, Q=right channel
pub fn read_iq_wav<P: AsRef<Path>>(path: P) -> DeviceResult<(Vec<IqSample>, u32)> {
    let reader = WavReader::open(path).map_err(wav_error)?;
    let spec = reader.spec();

    if spec.channels != 2 {
        return Err(DeviceError::Unsupported(format!(
            "expected stereo WAV (I/Q), got {} channels",
            spec.channels
        )));
    }

    let samples = match spec.sample_format {
        SampleFormat::Float => read_float_samples(reader)?,
        SampleFormat::Int => read_int_samples(reader, spec.bits_per_sample)?,
    };

    Ok((samples, spec.sample_rate))
}

fn wav_error(err: hound::Error) -> DeviceError {
    match err {
        hound::Error::IoError(e) => DeviceError::Io(e),
        other => DeviceError::Unsupported(other.to_string()),
    }
}

fn read_float_samples<R: Read>(mut reader: WavReader<R>) -> DeviceResult<Vec<IqSample>> {
    let mut samples = Vec::new();
    let mut iter = reader.samples::<f32>();

    while let (Some(i_result), Some(q_result)) = (iter.next(), iter.next()) {
        let i = i_result.map_err(wav_error)?;
        let q = q_result.map_err(wav_error)?;
        samples.push(IqSample::new(i, q));
    }

    Ok(samples)
}

fn read_int_samples<R: Read>(mut reader: WavReader<R>, bits: u16) -> DeviceResult<Vec<IqSample>> {
    let mut samples = Vec::new();
    let max_val = (1i64 << (bits.clamp(1, 32) - 1)) as f32;

    let mut iter = reader.samples::<i32>();

    while let (Some(i_result), Some(q_result)) = (iter.next(), iter.next()) {
        let i = i_result.map_err(wav_error)? as f32 / max_val;
        let q = q_result.map_err(wav_error)? as f32 / max_val;
        samples.push(IqSample::new(i, q));
    }

    Ok(samples)
}

/// Plays back an IQ recording as if it were a live front-end.
///
/// A recording cannot be retuned: any center frequency is accepted as a label,
/// but the sample rate must match the file.
pub struct WavSource {
    samples: Vec<IqSample>,
    file_rate: u32,
    position: usize,
    block_len: usize,
    looping: bool,
    state: SourceState,
}

impl WavSource {
    pub fn open<P: AsRef<Path>>(path: P, block_len: usize, looping: bool) -> DeviceResult<Self> {
        let (samples, file_rate) = read_iq_wav(&path)?;
        log::info!(
            "Loaded {} IQ samples at {} Hz ({:.2}s) from {}",
            samples.len(),
            file_rate,
            samples.len() as f32 / file_rate.max(1) as f32,
            path.as_ref().display()
        );
        Ok(Self::from_samples(samples, file_rate, block_len, looping))
    }

    pub fn from_samples(samples: Vec<IqSample>, file_rate: u32, block_len: usize, looping: bool) -> Self {
        Self {
            samples,
            file_rate,
            position: 0,
            block_len: block_len.max(1),
            looping,
            state: SourceState::default(),
        }
    }

    pub fn file_rate(&self) -> u32 {
        self.file_rate
    }
}

impl SampleSource for WavSource {
    fn configure(&mut self, tuning: &Tuning) -> DeviceResult<()> {
        tuning.validate()?;
        if tuning.sample_rate != self.file_rate {
            return Err(self.state.fail(DeviceError::Unsupported(format!(
                "recording is {} Hz, requested {} Hz",
                self.file_rate, tuning.sample_rate
            ))));
        }
        self.state.accept(tuning);
        Ok(())
    }

    fn read_block(&mut self) -> DeviceResult<SampleBlock> {
        let tuning = self.state.ready()?;

        if self.samples.is_empty() {
            return Err(self.state.fail(DeviceError::Disconnected("recording is empty".into())));
        }

        let mut block = Vec::with_capacity(self.block_len);
        while block.len() < self.block_len {
            if self.position >= self.samples.len() {
                if !self.looping {
                    return Err(self.state.fail(DeviceError::Disconnected("end of recording".into())));
                }
                self.position = 0;
            }
            let take = (self.block_len - block.len()).min(self.samples.len() - self.position);
            block.extend_from_slice(&self.samples[self.position..self.position + take]);
            self.position += take;
        }

        Ok(SampleBlock::new(block, &tuning))
    }

    fn block_len(&self) -> usize {
        self.block_len
    }

    fn tuning(&self) -> Option<Tuning> {
        self.state.tuning()
    }

    fn describe(&self) -> String {
        format!("IQ recording ({} Hz)", self.file_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::{IqFormat, IqRecorder};

    fn tuning(rate: u32) -> Tuning {
        Tuning {
            sample_rate: rate,
            ..Tuning::default()
        }
    }

    #[test]
    fn reads_back_written_recording() {
        let dir = tempfile::tempdir().unwrap();
        let samples: Vec<IqSample> = (0..100).map(|n| IqSample::new(n as f32 / 100.0, -0.25)).collect();
        let mut rec = IqRecorder::create(dir.path(), IqFormat::Float32, 48_000, 100e6).unwrap();
        rec.write_block(&SampleBlock::new(samples, &tuning(48_000))).unwrap();
        let path = rec.finish().unwrap();

        let mut src = WavSource::open(&path, 40, false).unwrap();
        assert_eq!(src.file_rate(), 48_000);
        src.configure(&tuning(48_000)).unwrap();
        let first = src.read_block().unwrap();
        assert_eq!(first.len(), 40);
        assert!((first.samples[10].re - 0.10).abs() < 1e-6);
        assert!((first.samples[10].im + 0.25).abs() < 1e-6);
    }

    #[test]
    fn end_of_recording_is_a_disconnect() {
        let samples = vec![IqSample::new(0.1, 0.1); 50];
        let mut src = WavSource::from_samples(samples, 8_000, 40, false);
        src.configure(&tuning(8_000)).unwrap();
        assert!(src.read_block().is_ok());
        assert!(matches!(src.read_block(), Err(DeviceError::Disconnected(_))));
        assert!(matches!(src.read_block(), Err(DeviceError::Unusable)));
    }

    #[test]
    fn looping_wraps_around() {
        let samples: Vec<IqSample> = (0..50).map(|n| IqSample::new(n as f32, 0.0)).collect();
        let mut src = WavSource::from_samples(samples, 8_000, 40, true);
        src.configure(&tuning(8_000)).unwrap();
        src.read_block().unwrap();
        let second = src.read_block().unwrap();
        assert_eq!(second.samples[0].re, 40.0);
        assert_eq!(second.samples[10].re, 0.0);
    }

    #[test]
    fn mismatched_rate_is_unsupported() {
        let mut src = WavSource::from_samples(vec![IqSample::new(0.0, 0.0); 10], 8_000, 4, true);
        assert!(matches!(src.configure(&tuning(48_000)), Err(DeviceError::Unsupported(_))));
    }
}
