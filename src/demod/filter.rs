//! Stateful building blocks for the audio path. All history survives across
//! blocks until `reset` is called.

use std::f64::consts::PI;

/// Q factors of the two sections of a 4th-order Butterworth response
const BUTTERWORTH_Q4: [f64; 2] = [0.541_196_1, 1.306_563];

/// Second-order IIR section, transposed direct form II
#[derive(Debug, Clone)]
pub struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
    z1: f64,
    z2: f64,
}

impl Biquad {
    fn passthrough() -> Self {
        Self::normalized(1.0, 0.0, 0.0, 1.0, 0.0, 0.0)
    }

    fn normalized(b0: f64, b1: f64, b2: f64, a0: f64, a1: f64, a2: f64) -> Self {
        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
            z1: 0.0,
            z2: 0.0,
        }
    }

    fn valid_cutoff(sample_rate: f64, cutoff: f64) -> bool {
        sample_rate > 0.0 && cutoff > 0.0 && cutoff < 0.49 * sample_rate
    }

    pub fn lowpass(sample_rate: f64, cutoff: f64, q: f64) -> Self {
        if !Self::valid_cutoff(sample_rate, cutoff) {
            return Self::passthrough();
        }
        let w0 = 2.0 * PI * cutoff / sample_rate;
        let (sin, cos) = w0.sin_cos();
        let alpha = sin / (2.0 * q);
        Self::normalized((1.0 - cos) / 2.0, 1.0 - cos, (1.0 - cos) / 2.0, 1.0 + alpha, -2.0 * cos, 1.0 - alpha)
    }

    pub fn highpass(sample_rate: f64, cutoff: f64, q: f64) -> Self {
        if !Self::valid_cutoff(sample_rate, cutoff) {
            return Self::passthrough();
        }
        let w0 = 2.0 * PI * cutoff / sample_rate;
        let (sin, cos) = w0.sin_cos();
        let alpha = sin / (2.0 * q);
        Self::normalized((1.0 + cos) / 2.0, -(1.0 + cos), (1.0 + cos) / 2.0, 1.0 + alpha, -2.0 * cos, 1.0 - alpha)
    }

    #[inline]
    pub fn process(&mut self, x: f64) -> f64 {
        let y = self.b0 * x + self.z1;
        self.z1 = self.b1 * x - self.a1 * y + self.z2;
        self.z2 = self.b2 * x - self.a2 * y;
        y
    }

    pub fn reset(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }
}

/// Chain of biquad sections applied in order
#[derive(Debug, Clone, Default)]
pub struct BiquadCascade {
    stages: Vec<Biquad>,
}

impl BiquadCascade {
    /// 4th-order Butterworth low-pass.
    pub fn lowpass(sample_rate: f64, cutoff: f64) -> Self {
        Self {
            stages: BUTTERWORTH_Q4.iter().map(|&q| Biquad::lowpass(sample_rate, cutoff, q)).collect(),
        }
    }

    /// 4th-order Butterworth high-pass followed by a 4th-order low-pass.
    pub fn bandpass(sample_rate: f64, low: f64, high: f64) -> Self {
        let mut stages: Vec<Biquad> = BUTTERWORTH_Q4
            .iter()
            .map(|&q| Biquad::highpass(sample_rate, low, q))
            .collect();
        stages.extend(BUTTERWORTH_Q4.iter().map(|&q| Biquad::lowpass(sample_rate, high, q)));
        Self { stages }
    }

    #[inline]
    pub fn process(&mut self, x: f64) -> f64 {
        self.stages.iter_mut().fold(x, |acc, s| s.process(acc))
    }

    /// Filter in place. Returns `false` if the output went non-finite, in
    /// which case the caller must discard the block and reset.
    pub fn process_block(&mut self, block: &mut [f32]) -> bool {
        let mut finite = true;
        for x in block.iter_mut() {
            let y = self.process(*x as f64);
            finite &= y.is_finite();
            *x = y as f32;
        }
        finite
    }

    pub fn reset(&mut self) {
        self.stages.iter_mut().for_each(Biquad::reset);
    }
}

/// One-pole DC blocker: y[n] = x[n] - x[n-1] + r*y[n-1]
#[derive(Debug, Clone)]
pub struct DcBlocker {
    r: f32,
    x1: f32,
    y1: f32,
}

impl DcBlocker {
    pub fn new(r: f32) -> Self {
        Self {
            r: r.clamp(0.9, 0.9999),
            x1: 0.0,
            y1: 0.0,
        }
    }

    #[inline]
    pub fn process(&mut self, x: f32) -> f32 {
        let y = x - self.x1 + self.r * self.y1;
        self.x1 = x;
        self.y1 = y;
        y
    }

    pub fn reset(&mut self) {
        self.x1 = 0.0;
        self.y1 = 0.0;
    }
}

/// Single-pole de-emphasis network with time constant `tau` seconds
#[derive(Debug, Clone)]
pub struct Deemphasis {
    alpha: f32,
    y1: f32,
}

impl Deemphasis {
    pub fn new(sample_rate: f64, tau: f64) -> Self {
        let alpha = (-1.0 / (tau * sample_rate.max(1.0))).exp() as f32;
        Self { alpha, y1: 0.0 }
    }

    #[inline]
    pub fn process(&mut self, x: f32) -> f32 {
        self.y1 = (1.0 - self.alpha) * x + self.alpha * self.y1;
        self.y1
    }

    pub fn reset(&mut self) {
        self.y1 = 0.0;
    }
}

/// Linear-interpolating resampler that turns any input block into exactly
/// the requested number of output samples, carrying the last input sample
/// over so consecutive blocks join without a seam.
#[derive(Debug, Clone, Default)]
pub struct BlockResampler {
    last: f32,
}

impl BlockResampler {
    pub fn process(&mut self, input: &[f32], out_len: usize) -> Vec<f32> {
        if input.is_empty() {
            return vec![0.0; out_len];
        }
        let step = input.len() as f64 / out_len.max(1) as f64;
        let at = |idx: usize| if idx == 0 { self.last } else { input[idx - 1] };

        let out = (0..out_len)
            .map(|k| {
                let pos = (k + 1) as f64 * step;
                let i = (pos.floor() as usize).min(input.len());
                let frac = (pos - i as f64) as f32;
                let a = at(i);
                let b = if i < input.len() { input[i] } else { a };
                a + (b - a) * frac
            })
            .collect();

        self.last = input[input.len() - 1];
        out
    }

    pub fn reset(&mut self) {
        self.last = 0.0;
    }
}
