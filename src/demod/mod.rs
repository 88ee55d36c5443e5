//! Channel demodulation: IQ clean-up, per-mode detector, resampling to the
//! audio rate, voice band-pass, AGC and stereo expansion.

pub mod agc;
pub mod filter;
pub mod iq;

pub use agc::{Agc, AgcParams};
pub use iq::{IqBalance, IqFrontEnd};

use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::audio::AudioFrame;
use crate::input::{IqSample, SampleBlock};
use filter::{BiquadCascade, BlockResampler, DcBlocker, Deemphasis};

/// Output rate of every [`AudioFrame`] the chain produces
pub const AUDIO_RATE: u32 = 48_000;
pub const VOICE_LOW_HZ: f64 = 300.0;
pub const VOICE_HIGH_HZ: f64 = 3_000.0;

const NFM_DEVIATION_HZ: f64 = 5_000.0;
const WFM_DEVIATION_HZ: f64 = 75_000.0;
const WFM_DEEMPHASIS_SECS: f64 = 75e-6;
/// SSB passband is 0..3 kHz on the selected side; the product detector
/// shifts its middle to DC before filtering
const SSB_SHIFT_HZ: f64 = 1_500.0;
const ANTI_ALIAS_HZ: f64 = 16_000.0;
/// Mean block power below which the input is treated as silence
const MIN_BLOCK_POWER: f32 = 1e-18;
const AM_DC_POLE: f32 = 0.999;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DemodMode {
    Am,
    Nfm,
    Wfm,
    Usb,
    Lsb,
    Raw,
}

impl DemodMode {
    pub const ALL: [DemodMode; 6] = [
        DemodMode::Am,
        DemodMode::Nfm,
        DemodMode::Wfm,
        DemodMode::Usb,
        DemodMode::Lsb,
        DemodMode::Raw,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DemodMode::Am => "AM",
            DemodMode::Nfm => "NFM",
            DemodMode::Wfm => "WFM",
            DemodMode::Usb => "USB",
            DemodMode::Lsb => "LSB",
            DemodMode::Raw => "RAW",
        }
    }

    fn to_index(self) -> u8 {
        match self {
            DemodMode::Am => 0,
            DemodMode::Nfm => 1,
            DemodMode::Wfm => 2,
            DemodMode::Usb => 3,
            DemodMode::Lsb => 4,
            DemodMode::Raw => 5,
        }
    }

    fn from_index(index: u8) -> Self {
        Self::ALL.get(index as usize).copied().unwrap_or(DemodMode::Raw)
    }
}

impl fmt::Display for DemodMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DemodMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "am" => Ok(DemodMode::Am),
            "nfm" | "fm" => Ok(DemodMode::Nfm),
            "wfm" => Ok(DemodMode::Wfm),
            "usb" => Ok(DemodMode::Usb),
            "lsb" => Ok(DemodMode::Lsb),
            "raw" => Ok(DemodMode::Raw),
            other => Err(format!("invalid mode '{}'. Use: am, nfm, wfm, usb, lsb, raw", other)),
        }
    }
}

/// Demodulator settings pushed in by the session
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DemodConfig {
    pub mode: DemodMode,
    pub agc: AgcParams,
    pub iq_balance: IqBalance,
    /// Re-estimate the IQ balance from every block
    pub auto_iq: bool,
}

impl Default for DemodConfig {
    fn default() -> Self {
        Self {
            mode: DemodMode::Nfm,
            agc: AgcParams::default(),
            iq_balance: IqBalance::default(),
            auto_iq: false,
        }
    }
}

/// Read-only view of the chain for status displays
#[derive(Debug, Clone)]
pub struct DemodStatus {
    gain_bits: Arc<AtomicU32>,
    mode: Arc<AtomicU8>,
}

impl DemodStatus {
    fn new(mode: DemodMode, gain: f32) -> Self {
        Self {
            gain_bits: Arc::new(AtomicU32::new(gain.to_bits())),
            mode: Arc::new(AtomicU8::new(mode.to_index())),
        }
    }

    pub fn gain(&self) -> f32 {
        f32::from_bits(self.gain_bits.load(Ordering::Relaxed))
    }

    pub fn gain_db(&self) -> f32 {
        20.0 * self.gain().max(1e-12).log10()
    }

    pub fn mode(&self) -> DemodMode {
        DemodMode::from_index(self.mode.load(Ordering::Relaxed))
    }

    fn publish(&self, mode: DemodMode, gain: f32) {
        self.gain_bits.store(gain.to_bits(), Ordering::Relaxed);
        self.mode.store(mode.to_index(), Ordering::Relaxed);
    }
}

/// Which half of the spectrum the product detector keeps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sideband {
    Upper,
    Lower,
}

/// Per-mode detector and the history it carries between blocks
#[derive(Debug, Clone)]
enum Detector {
    Envelope {
        dc: DcBlocker,
    },
    Discriminator {
        last: IqSample,
        scale: f32,
        deemphasis: Option<Deemphasis>,
    },
    Product {
        sideband: Sideband,
        lpf_re: BiquadCascade,
        lpf_im: BiquadCascade,
        phase: f64,
        step: f64,
    },
    Passthrough,
}

impl Detector {
    fn new(mode: DemodMode, sample_rate: f64) -> Self {
        match mode {
            DemodMode::Am => Detector::Envelope {
                dc: DcBlocker::new(AM_DC_POLE),
            },
            DemodMode::Nfm => Self::discriminator(sample_rate, NFM_DEVIATION_HZ, false),
            DemodMode::Wfm => Self::discriminator(sample_rate, WFM_DEVIATION_HZ, true),
            DemodMode::Usb => Self::product(sample_rate, Sideband::Upper),
            DemodMode::Lsb => Self::product(sample_rate, Sideband::Lower),
            DemodMode::Raw => Detector::Passthrough,
        }
    }

    fn discriminator(sample_rate: f64, deviation: f64, deemphasis: bool) -> Self {
        Detector::Discriminator {
            last: IqSample::new(0.0, 0.0),
            scale: (sample_rate / (2.0 * PI * deviation)) as f32,
            deemphasis: deemphasis.then(|| Deemphasis::new(sample_rate, WFM_DEEMPHASIS_SECS)),
        }
    }

    fn product(sample_rate: f64, sideband: Sideband) -> Self {
        Detector::Product {
            sideband,
            lpf_re: BiquadCascade::lowpass(sample_rate, SSB_SHIFT_HZ),
            lpf_im: BiquadCascade::lowpass(sample_rate, SSB_SHIFT_HZ),
            phase: 0.0,
            step: 2.0 * PI * SSB_SHIFT_HZ / sample_rate,
        }
    }

    fn detect(&mut self, samples: &[IqSample]) -> Vec<f32> {
        match self {
            Detector::Envelope { dc } => samples.iter().map(|s| dc.process(s.norm())).collect(),

            Detector::Discriminator { last, scale, deemphasis } => samples
                .iter()
                .map(|&s| {
                    let product = s * last.conj();
                    *last = s;
                    // phase of a vanishing vector is noise
                    let phase = if product.norm_sqr() > 1e-24 { product.arg() } else { 0.0 };
                    let audio = phase * *scale;
                    match deemphasis {
                        Some(de) => de.process(audio),
                        None => audio,
                    }
                })
                .collect(),

            Detector::Product { sideband, lpf_re, lpf_im, phase, step } => {
                // USB content sits above the carrier: shift down, filter, shift back.
                let sign = match sideband {
                    Sideband::Upper => -1.0,
                    Sideband::Lower => 1.0,
                };
                samples
                    .iter()
                    .map(|s| {
                        let (sin, cos) = (sign * *phase).sin_cos();
                        let re = s.re as f64 * cos - s.im as f64 * sin;
                        let im = s.re as f64 * sin + s.im as f64 * cos;
                        let fre = lpf_re.process(re);
                        let fim = lpf_im.process(im);
                        // back-shift, real part only
                        let out = fre * cos + fim * sin;
                        *phase = (*phase + *step) % (2.0 * PI);
                        out as f32
                    })
                    .collect()
            }

            Detector::Passthrough => samples.iter().map(|s| s.re).collect(),
        }
    }
}

/// Stateful demodulator. Owns every filter and the AGC; nothing outside it
/// mutates that state.
pub struct DemodulatorChain {
    config: DemodConfig,
    input_rate: u32,
    front_end: IqFrontEnd,
    detector: Detector,
    anti_alias: BiquadCascade,
    resampler: BlockResampler,
    voice: BiquadCascade,
    agc: Agc,
    status: DemodStatus,
}

impl DemodulatorChain {
    pub fn new(config: DemodConfig) -> Self {
        let agc = Agc::new(config.agc);
        let status = DemodStatus::new(config.mode, agc.gain());
        let input_rate = AUDIO_RATE;
        Self {
            front_end: IqFrontEnd::new(config.iq_balance, config.auto_iq),
            detector: Detector::new(config.mode, input_rate as f64),
            anti_alias: BiquadCascade::lowpass(input_rate as f64, ANTI_ALIAS_HZ),
            resampler: BlockResampler::default(),
            voice: BiquadCascade::bandpass(AUDIO_RATE as f64, VOICE_LOW_HZ, VOICE_HIGH_HZ),
            agc,
            status,
            input_rate,
            config,
        }
    }

    pub fn mode(&self) -> DemodMode {
        self.config.mode
    }

    pub fn gain(&self) -> f32 {
        self.agc.gain()
    }

    pub fn config(&self) -> &DemodConfig {
        &self.config
    }

    /// Cloneable read-only handle on gain and mode.
    pub fn status(&self) -> DemodStatus {
        self.status.clone()
    }

    /// Switch mode. Filter and AGC history are cleared before the next block.
    pub fn set_mode(&mut self, mode: DemodMode) {
        if mode == self.config.mode {
            return;
        }
        log::info!("Demodulator mode {} -> {}", self.config.mode, mode);
        self.config.mode = mode;
        self.reset();
    }

    pub fn set_agc(&mut self, params: AgcParams) {
        self.config.agc = params;
        self.agc.set_params(params);
        self.status.publish(self.config.mode, self.agc.gain());
    }

    /// Drop all history: detector, filters, resampler and AGC.
    pub fn reset(&mut self) {
        self.rebuild(self.input_rate);
        self.front_end.reset();
        self.resampler.reset();
        self.voice.reset();
        self.agc.reset();
        self.status.publish(self.config.mode, self.agc.gain());
    }

    fn rebuild(&mut self, input_rate: u32) {
        self.input_rate = input_rate;
        self.detector = Detector::new(self.config.mode, input_rate as f64);
        self.anti_alias = BiquadCascade::lowpass(input_rate as f64, ANTI_ALIAS_HZ);
    }

    /// Number of audio frames that cover `block` at [`AUDIO_RATE`].
    pub fn frames_for(block: &SampleBlock) -> usize {
        if block.sample_rate == 0 {
            return 0;
        }
        (block.len() as f64 * AUDIO_RATE as f64 / block.sample_rate as f64).round() as usize
    }

    /// Demodulate one block into exactly `frames` stereo frames. Degenerate
    /// input produces silence instead of an error.
    pub fn process(&mut self, block: &SampleBlock, frames: usize) -> AudioFrame {
        if frames == 0 || block.is_empty() || block.sample_rate == 0 {
            return AudioFrame::silence(frames, AUDIO_RATE);
        }
        if block.samples.iter().any(|s| !s.re.is_finite() || !s.im.is_finite()) {
            log::debug!("non-finite samples in block, emitting silence");
            return AudioFrame::silence(frames, AUDIO_RATE);
        }
        let power = block.samples.iter().map(|s| s.norm_sqr()).sum::<f32>() / block.len() as f32;
        if power < MIN_BLOCK_POWER {
            return AudioFrame::silence(frames, AUDIO_RATE);
        }

        if block.sample_rate != self.input_rate {
            log::debug!("Demodulator input rate {} -> {} Hz", self.input_rate, block.sample_rate);
            self.rebuild(block.sample_rate);
        }

        let corrected = self.front_end.process(&block.samples);
        let mut detected = self.detector.detect(&corrected);

        if !self.anti_alias.process_block(&mut detected) {
            return self.recover(frames);
        }
        let mut audio = self.resampler.process(&detected, frames);
        if !self.voice.process_block(&mut audio) {
            return self.recover(frames);
        }

        let gain = self.agc.process(&mut audio, frames as f32 / AUDIO_RATE as f32);
        self.status.publish(self.config.mode, gain);

        AudioFrame::from_mono(&audio, AUDIO_RATE)
    }

    fn recover(&mut self, frames: usize) -> AudioFrame {
        log::warn!("{} filter went unstable, resetting", self.config.mode);
        self.reset();
        AudioFrame::silence(frames, AUDIO_RATE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::Tuning;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn block(samples: Vec<IqSample>, rate: u32) -> SampleBlock {
        let tuning = Tuning {
            sample_rate: rate,
            ..Tuning::default()
        };
        SampleBlock::new(samples, &tuning)
    }

    /// AM carrier of amplitude `amp` with a 1 kHz tone at 50% depth
    fn am_block(amp: f32, start: usize, len: usize, rate: u32) -> SampleBlock {
        let samples = (start..start + len)
            .map(|n| {
                let t = n as f32 / rate as f32;
                let env = amp * (1.0 + 0.5 * (2.0 * std::f32::consts::PI * 1000.0 * t).sin());
                IqSample::new(env, 0.0)
            })
            .collect();
        block(samples, rate)
    }

    #[test]
    fn zero_input_gives_zero_stereo_in_every_mode() {
        for mode in DemodMode::ALL {
            let mut chain = DemodulatorChain::new(DemodConfig {
                mode,
                ..DemodConfig::default()
            });
            let zeros = block(vec![IqSample::new(0.0, 0.0); 1024], 1_024_000);
            let frame = chain.process(&zeros, 48);
            assert_eq!(frame.frames(), 48, "{}", mode);
            assert_eq!(frame.samples.len(), 96);
            assert!(frame.samples.iter().all(|&x| x == 0.0), "{}", mode);
        }
    }

    #[test]
    fn non_finite_and_empty_blocks_are_silenced() {
        let mut chain = DemodulatorChain::new(DemodConfig::default());
        let mut samples = vec![IqSample::new(0.5, 0.5); 256];
        samples[10] = IqSample::new(f32::NAN, 0.0);
        let frame = chain.process(&block(samples, 48_000), 256);
        assert!(frame.samples.iter().all(|&x| x == 0.0));
        let frame = chain.process(&block(Vec::new(), 48_000), 10);
        assert_eq!(frame.frames(), 10);
    }

    #[test]
    fn frame_length_follows_request() {
        let mut chain = DemodulatorChain::new(DemodConfig {
            mode: DemodMode::Am,
            ..DemodConfig::default()
        });
        let b = am_block(0.5, 0, 2048, 1_024_000);
        let frames = DemodulatorChain::frames_for(&b);
        assert_eq!(frames, 96);
        let frame = chain.process(&b, frames);
        assert_eq!(frame.frames(), 96);
        assert!(frame.samples.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn am_tone_is_heard_on_both_channels() {
        let mut chain = DemodulatorChain::new(DemodConfig {
            mode: DemodMode::Am,
            ..DemodConfig::default()
        });
        let mut last = AudioFrame::silence(0, AUDIO_RATE);
        for i in 0..50 {
            last = chain.process(&am_block(0.2, i * 1024, 1024, 48_000), 1024);
        }
        let left: Vec<f32> = last.samples.iter().step_by(2).copied().collect();
        let right: Vec<f32> = last.samples.iter().skip(1).step_by(2).copied().collect();
        assert_eq!(left, right);
        let rms = (left.iter().map(|x| x * x).sum::<f32>() / left.len() as f32).sqrt();
        assert!(rms > 0.05, "rms {}", rms);
    }

    #[test]
    fn nfm_tone_demodulates() {
        let rate = 48_000;
        let mut chain = DemodulatorChain::new(DemodConfig::default());
        let mut phase = 0.0f32;
        let mut last = AudioFrame::silence(0, AUDIO_RATE);
        for blk in 0..40 {
            let samples = (0..1024)
                .map(|n| {
                    let t = (blk * 1024 + n) as f32 / rate as f32;
                    let inst = 3_000.0 * (2.0 * std::f32::consts::PI * 800.0 * t).sin();
                    phase += 2.0 * std::f32::consts::PI * inst / rate as f32;
                    IqSample::new(phase.cos(), phase.sin())
                })
                .collect();
            last = chain.process(&block(samples, rate), 1024);
        }
        assert!(last.samples.iter().any(|x| x.abs() > 0.05));
        assert!(last.samples.iter().all(|x| x.abs() <= 1.0));
    }

    #[test]
    fn agc_stays_bounded_and_never_rises_on_a_loud_step() {
        let params = AgcParams::default();
        let mut chain = DemodulatorChain::new(DemodConfig {
            mode: DemodMode::Am,
            ..DemodConfig::default()
        });
        let status = chain.status();
        let mut rng = StdRng::seed_from_u64(42);
        for i in 0..1000 {
            let amp = 10f32.powf(rng.gen_range(-4.0..0.0));
            chain.process(&am_block(amp, i * 960, 960, 48_000), 960);
            let gain = status.gain();
            assert!(gain >= params.gain_min && gain <= params.gain_max, "block {} gain {}", i, gain);
        }

        chain.reset();
        for i in 0..20 {
            chain.process(&am_block(0.001, i * 960, 960, 48_000), 960);
        }
        let before = status.gain();
        chain.process(&am_block(0.5, 20 * 960, 960, 48_000), 960);
        assert!(status.gain() <= before, "{} -> {}", before, status.gain());
    }

    #[test]
    fn mode_switch_resets_history() {
        let mut chain = DemodulatorChain::new(DemodConfig {
            mode: DemodMode::Am,
            ..DemodConfig::default()
        });
        for i in 0..20 {
            chain.process(&am_block(0.001, i * 960, 960, 48_000), 960);
        }
        assert!(chain.gain() != 1.0);
        chain.set_mode(DemodMode::Usb);
        assert_eq!(chain.gain(), 1.0);
        assert_eq!(chain.status().mode(), DemodMode::Usb);
    }

    #[test]
    fn mode_names_parse() {
        for mode in DemodMode::ALL {
            assert_eq!(mode.as_str().parse::<DemodMode>(), Ok(mode));
        }
        assert!("cw".parse::<DemodMode>().is_err());
    }
}
