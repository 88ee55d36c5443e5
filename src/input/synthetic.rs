use std::f64::consts::TAU;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{IqSample, SampleBlock, SampleSource, SourceState, Tuning};
use crate::error::{DeviceError, DeviceResult};

/// A carrier at an absolute RF frequency
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tone {
    pub frequency: f64,
    pub amplitude: f32,
}

impl Tone {
    pub fn new(frequency: f64, amplitude: f32) -> Self {
        Self { frequency, amplitude }
    }
}

/// Signal generator standing in for a front-end.
///
/// Tones are placed at absolute frequencies; only those inside the tuned
/// bandwidth show up in a block. `oscillator_ppm` models a drifting local
/// oscillator which the tuning's ppm correction is expected to cancel.
pub struct SyntheticSource {
    tones: Vec<Tone>,
    phases: Vec<f64>,
    noise_amplitude: f32,
    oscillator_ppm: f64,
    max_sample_rate: u32,
    block_len: usize,
    rng: StdRng,
    /// Successful reads left before a simulated unplug
    reads_left: Option<usize>,
    state: SourceState,
}

impl SyntheticSource {
    pub fn new(block_len: usize) -> Self {
        Self {
            tones: Vec::new(),
            phases: Vec::new(),
            noise_amplitude: 0.0,
            oscillator_ppm: 0.0,
            max_sample_rate: 3_200_000,
            block_len: block_len.max(1),
            rng: StdRng::seed_from_u64(0x5eed),
            reads_left: None,
            state: SourceState::default(),
        }
    }

    pub fn with_tone(mut self, tone: Tone) -> Self {
        self.tones.push(tone);
        self.phases.push(0.0);
        self
    }

    pub fn with_noise(mut self, amplitude: f32) -> Self {
        self.noise_amplitude = amplitude.max(0.0);
        self
    }

    pub fn with_oscillator_error(mut self, ppm: f64) -> Self {
        self.oscillator_ppm = ppm;
        self
    }

    pub fn with_max_sample_rate(mut self, rate: u32) -> Self {
        self.max_sample_rate = rate;
        self
    }

    /// Unplug after `reads` more successful reads.
    pub fn with_failure_after(mut self, reads: usize) -> Self {
        self.reads_left = Some(reads);
        self
    }

    /// Make the next read fail as if the device were unplugged.
    pub fn disconnect(&mut self) {
        self.reads_left = Some(0);
    }

    /// Frequency the simulated oscillator actually sits on for a tuning.
    fn local_oscillator(&self, tuning: &Tuning) -> f64 {
        tuning.effective_frequency() / (1.0 + self.oscillator_ppm / 1e6)
    }
}

impl SampleSource for SyntheticSource {
    fn configure(&mut self, tuning: &Tuning) -> DeviceResult<()> {
        tuning.validate()?;
        if tuning.sample_rate > self.max_sample_rate {
            return Err(self.state.fail(DeviceError::Unsupported(format!(
                "sample rate {} Hz exceeds {} Hz",
                tuning.sample_rate, self.max_sample_rate
            ))));
        }
        self.state.accept(tuning);
        Ok(())
    }

    fn read_block(&mut self) -> DeviceResult<SampleBlock> {
        let tuning = self.state.ready()?;
        match self.reads_left {
            Some(0) => {
                self.reads_left = None;
                return Err(self
                    .state
                    .fail(DeviceError::Disconnected("synthetic source unplugged".into())));
            }
            Some(n) => self.reads_left = Some(n - 1),
            None => {}
        }

        let rate = tuning.sample_rate as f64;
        let lo = self.local_oscillator(&tuning);
        let mut samples = vec![IqSample::new(0.0, 0.0); self.block_len];

        for (tone, phase) in self.tones.iter().zip(self.phases.iter_mut()) {
            let offset = tone.frequency - lo;
            if offset.abs() >= rate / 2.0 {
                continue;
            }
            let step = TAU * offset / rate;
            for s in samples.iter_mut() {
                *s += IqSample::new(
                    tone.amplitude * phase.cos() as f32,
                    tone.amplitude * phase.sin() as f32,
                );
                *phase = (*phase + step) % TAU;
            }
        }

        if self.noise_amplitude > 0.0 {
            let a = self.noise_amplitude;
            for s in samples.iter_mut() {
                *s += IqSample::new(self.rng.gen_range(-a..a), self.rng.gen_range(-a..a));
            }
        }

        Ok(SampleBlock::new(samples, &tuning))
    }

    fn block_len(&self) -> usize {
        self.block_len
    }

    fn tuning(&self) -> Option<Tuning> {
        self.state.tuning()
    }

    fn describe(&self) -> String {
        format!("synthetic ({} tone(s))", self.tones.len())
    }
}
