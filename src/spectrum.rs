use crate::input::{IqSample, SampleBlock};
use chrono::{DateTime, Local};
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::f32::consts::PI;
use std::ops::Range;
use std::sync::Arc;

/// Lowest value any bin can report, so every frame stays finite
pub const FLOOR_DB: f32 = -160.0;
const FLOOR_POWER: f32 = 1e-16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowKind {
    Rectangular,
    Hann,
    Hamming,
    Blackman,
}

impl WindowKind {
    pub fn coefficients(&self, size: usize) -> Vec<f32> {
        match self {
            WindowKind::Rectangular => vec![1.0; size],
            WindowKind::Hann => cosine_window(size, 0.5, 0.5, 0.0),
            WindowKind::Hamming => cosine_window(size, 0.54, 0.46, 0.0),
            WindowKind::Blackman => blackman_window(size),
        }
    }
}

/// Generate Blackman window coefficients
/// Better sidelobe suppression (-58 dB) than Hann (-31 dB) at cost of wider main lobe
pub fn blackman_window(size: usize) -> Vec<f32> {
    cosine_window(size, 0.42, 0.5, 0.08)
}

fn cosine_window(size: usize, a0: f32, a1: f32, a2: f32) -> Vec<f32> {
    if size < 2 {
        return vec![1.0; size];
    }
    (0..size)
        .map(|n| {
            let x = n as f32 / (size - 1) as f32;
            a0 - a1 * (2.0 * PI * x).cos() + a2 * (4.0 * PI * x).cos()
        })
        .collect()
}

/// How successive frames are combined
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Accumulation {
    /// Last frame only
    Instantaneous,
    /// Exponential average, `alpha` is the weight of the newest frame
    Exponential { alpha: f32 },
    /// Plain mean over the last `frames` frames
    RunningMean { frames: usize },
    /// Bin-wise maximum until [`SpectrumEngine::reset`]
    PeakHold,
}

/// Power spectrum of one acquisition cycle
#[derive(Debug, Clone)]
pub struct SpectrumFrame {
    /// Bin magnitudes in dB
    pub bins: Vec<f32>,
    /// Frequency of bin 0 in Hz
    pub start_freq: f64,
    /// Bin spacing in Hz
    pub resolution: f64,
    pub center_freq: f64,
    /// Frames folded into this one since the last reset
    pub accumulated: u32,
    pub timestamp: DateTime<Local>,
}

impl SpectrumFrame {
    pub fn bin_count(&self) -> usize {
        self.bins.len()
    }

    pub fn frequency_of(&self, bin: usize) -> f64 {
        self.start_freq + bin as f64 * self.resolution
    }

    pub fn bin_of(&self, freq: f64) -> Option<usize> {
        let idx = ((freq - self.start_freq) / self.resolution).round();
        (idx >= 0.0 && (idx as usize) < self.bins.len()).then_some(idx as usize)
    }

    /// Strongest bin as (index, dB)
    pub fn peak(&self) -> (usize, f32) {
        peak_in(&self.bins, 0..self.bins.len())
    }

    /// Bins whose frequency lies within `half_span` Hz of `freq`.
    pub fn bins_around(&self, freq: f64, half_span: f64) -> Range<usize> {
        let lo = ((freq - half_span - self.start_freq) / self.resolution).ceil().max(0.0) as usize;
        let hi = ((freq + half_span - self.start_freq) / self.resolution).floor() as isize + 1;
        let hi = hi.clamp(0, self.bins.len() as isize) as usize;
        lo.min(hi)..hi
    }

    /// Strongest bin inside a frequency span, if the span covers any bin.
    pub fn channel_peak(&self, freq: f64, half_span: f64) -> Option<(usize, f32)> {
        let range = self.bins_around(freq, half_span);
        (!range.is_empty()).then(|| peak_in(&self.bins, range))
    }

    /// Width of the contiguous region around `peak_bin` staying within
    /// `drop_db` of the peak, in Hz.
    pub fn occupied_bandwidth(&self, peak_bin: usize, drop_db: f32) -> f64 {
        let Some(&peak) = self.bins.get(peak_bin) else {
            return 0.0;
        };
        let limit = peak - drop_db;
        let mut lo = peak_bin;
        while lo > 0 && self.bins[lo - 1] > limit {
            lo -= 1;
        }
        let mut hi = peak_bin;
        while hi + 1 < self.bins.len() && self.bins[hi + 1] > limit {
            hi += 1;
        }
        (hi - lo + 1) as f64 * self.resolution
    }

    /// Geometric over arithmetic mean of linear power (1.0 = white noise, →0 = tonal).
    pub fn spectral_flatness(&self, range: Range<usize>) -> f32 {
        let hi = range.end.min(self.bins.len());
        let lo = range.start.min(hi);
        let bins = &self.bins[lo..hi];
        if bins.is_empty() {
            return 0.0;
        }
        let n = bins.len() as f32;
        let log_mean = bins.iter().map(|db| db / 10.0 * std::f32::consts::LN_10).sum::<f32>() / n;
        let mean = bins.iter().map(|db| 10f32.powf(db / 10.0)).sum::<f32>() / n;
        if mean <= 0.0 {
            return 0.0;
        }
        (log_mean.exp() / mean).clamp(0.0, 1.0)
    }
}

fn peak_in(bins: &[f32], range: Range<usize>) -> (usize, f32) {
    bins[range.clone()]
        .iter()
        .enumerate()
        .fold((range.start, f32::NEG_INFINITY), |best, (i, &db)| {
            if db > best.1 {
                (range.start + i, db)
            } else {
                best
            }
        })
}

/// Width in bins of the renderer's center marker: the displayed share of the
/// configured bandwidth divided by the bin resolution.
pub fn marker_width_bins(display_fraction: f64, bandwidth: f64, resolution: f64) -> f64 {
    if resolution <= 0.0 {
        return 0.0;
    }
    display_fraction * bandwidth / resolution
}

/// Windowed FFT power spectrum with frame accumulation.
///
/// The bin count is fixed at construction; shorter blocks are zero-padded
/// and longer ones truncated.
pub struct SpectrumEngine {
    size: usize,
    fft: Arc<dyn Fft<f32>>,
    window_kind: WindowKind,
    window: Vec<f32>,
    window_sum: f32,
    accumulation: Accumulation,
    /// Accumulated linear power, unshifted
    accum: Vec<f32>,
    history: VecDeque<Vec<f32>>,
    accumulated: u32,
    scratch: Vec<Complex<f32>>,
}

impl SpectrumEngine {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(size);
        let window_kind = WindowKind::Hamming;
        let window = window_kind.coefficients(size);
        let window_sum = window.iter().sum();
        Self {
            size,
            fft,
            window_kind,
            window,
            window_sum,
            accumulation: Accumulation::Instantaneous,
            accum: vec![0.0; size],
            history: VecDeque::new(),
            accumulated: 0,
            scratch: vec![Complex::new(0.0, 0.0); size],
        }
    }

    pub fn bin_count(&self) -> usize {
        self.size
    }

    /// Forget accumulated history (clears peak-hold and averages).
    pub fn reset(&mut self) {
        self.accum.iter_mut().for_each(|p| *p = 0.0);
        self.history.clear();
        self.accumulated = 0;
    }

    pub fn compute(&mut self, block: &SampleBlock, window: WindowKind, accumulation: Accumulation) -> SpectrumFrame {
        if window != self.window_kind {
            self.window_kind = window;
            self.window = window.coefficients(self.size);
            self.window_sum = self.window.iter().sum();
        }
        if accumulation != self.accumulation {
            self.accumulation = accumulation;
            self.reset();
        }

        let power = self.power_spectrum(&block.samples);
        self.accumulate(power);

        let mut bins: Vec<f32> = self.accum.iter().map(|&p| to_db(p)).collect();
        let rate = block.sample_rate.max(1) as f64;
        let resolution = rate / self.size as f64;
        // fft-shift: 0 Hz offset in the middle
        bins.rotate_right(self.size / 2);
        let start_freq = block.center_freq - (self.size / 2) as f64 * resolution;

        SpectrumFrame {
            bins,
            start_freq,
            resolution,
            center_freq: block.center_freq,
            accumulated: self.accumulated,
            timestamp: block.timestamp,
        }
    }

    /// Normalized linear power per bin: a full-scale complex tone reads 1.0.
    fn power_spectrum(&mut self, samples: &[IqSample]) -> Vec<f32> {
        for (i, slot) in self.scratch.iter_mut().enumerate() {
            let s = samples.get(i).copied().unwrap_or_default();
            let s = if s.re.is_finite() && s.im.is_finite() { s } else { Complex::new(0.0, 0.0) };
            *slot = s * self.window[i];
        }
        self.fft.process(&mut self.scratch);

        let norm = self.window_sum * self.window_sum;
        if norm <= 0.0 {
            return vec![0.0; self.size];
        }
        self.scratch.iter().map(|c| c.norm_sqr() / norm).collect()
    }

    fn accumulate(&mut self, power: Vec<f32>) {
        self.accumulated = self.accumulated.saturating_add(1);
        match self.accumulation {
            Accumulation::Instantaneous => self.accum = power,
            Accumulation::Exponential { alpha } => {
                if self.accumulated == 1 {
                    self.accum = power;
                } else {
                    let alpha = alpha.clamp(0.0, 1.0);
                    for (acc, p) in self.accum.iter_mut().zip(power) {
                        *acc += alpha * (p - *acc);
                    }
                }
            }
            Accumulation::RunningMean { frames } => {
                self.history.push_back(power);
                while self.history.len() > frames.max(1) {
                    self.history.pop_front();
                }
                let n = self.history.len() as f32;
                for (i, acc) in self.accum.iter_mut().enumerate() {
                    *acc = self.history.iter().map(|h| h[i]).sum::<f32>() / n;
                }
            }
            Accumulation::PeakHold => {
                for (acc, p) in self.accum.iter_mut().zip(power) {
                    *acc = acc.max(p);
                }
            }
        }
    }
}

fn to_db(power: f32) -> f32 {
    if power > FLOOR_POWER {
        10.0 * power.log10()
    } else {
        FLOOR_DB
    }
}
