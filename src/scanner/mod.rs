//! Frequency sweep: retune, settle, measure, classify.

pub mod classify;

pub use classify::{classify, modulation_index, SignalClass, SignalFeatures};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::error::{DeviceError, SessionError};
use crate::input::{SampleSource, Tuning};
use crate::spectrum::{Accumulation, SpectrumEngine, WindowKind};

/// Upper bound on the number of retunes in one sweep
pub const MAX_SCAN_STEPS: usize = 100_000;

/// Sweep definition
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanParams {
    pub start_hz: f64,
    pub end_hz: f64,
    pub step_hz: f64,
    /// Wait after each retune before samples are trusted
    pub settle: Duration,
    /// In-channel peak power that counts as a signal
    pub threshold_db: f32,
}

impl Default for ScanParams {
    fn default() -> Self {
        Self {
            start_hz: 88_000_000.0,
            end_hz: 108_000_000.0,
            step_hz: 100_000.0,
            settle: Duration::from_millis(50),
            threshold_db: -60.0,
        }
    }
}

impl ScanParams {
    pub fn validate(&self) -> Result<(), SessionError> {
        let finite = self.start_hz.is_finite() && self.end_hz.is_finite() && self.step_hz.is_finite();
        if !finite || self.start_hz <= 0.0 || self.end_hz < self.start_hz || self.step_hz <= 0.0 {
            return Err(SessionError::InvalidScan(format!(
                "{} - {} Hz in steps of {} Hz",
                self.start_hz, self.end_hz, self.step_hz
            )));
        }
        let count = self.step_count();
        if count > MAX_SCAN_STEPS as f64 {
            return Err(SessionError::InvalidScan(format!(
                "{:.0} steps exceeds the limit of {}",
                count, MAX_SCAN_STEPS
            )));
        }
        Ok(())
    }

    fn step_count(&self) -> f64 {
        // tolerate float error on the last step
        ((self.end_hz - self.start_hz) / self.step_hz + 1e-9).floor() + 1.0
    }

    /// Step frequencies from start to end inclusive.
    pub fn steps(&self) -> Vec<f64> {
        if self.validate().is_err() {
            return Vec::new();
        }
        let count = self.step_count() as usize;
        (0..count).map(|i| self.start_hz + i as f64 * self.step_hz).collect()
    }
}

/// One detected signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    /// Frequency of the strongest bin in the channel
    pub frequency: f64,
    pub power_db: f32,
    pub bandwidth_hz: f64,
    pub class: SignalClass,
    pub timestamp: DateTime<Local>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanProgress {
    pub index: usize,
    pub total: usize,
    pub frequency: f64,
}

#[derive(Debug)]
pub enum ScanStatus {
    Completed,
    Cancelled,
    /// The source failed mid-sweep; results cover the steps before it
    Aborted(DeviceError),
}

#[derive(Debug)]
pub struct ScanReport {
    pub results: Vec<ScanResult>,
    pub status: ScanStatus,
}

/// Runs sweeps against a borrowed source and spectrum engine. The mutable
/// borrow of the source for the whole sweep is what keeps manual tuning out.
pub struct Scanner {
    params: ScanParams,
    cancel: Arc<AtomicBool>,
    last_results: Vec<ScanResult>,
}

impl Scanner {
    pub fn new(params: ScanParams) -> Self {
        Self {
            params,
            cancel: Arc::new(AtomicBool::new(false)),
            last_results: Vec::new(),
        }
    }

    pub fn params(&self) -> &ScanParams {
        &self.params
    }

    pub fn set_params(&mut self, params: ScanParams) {
        self.params = params;
    }

    /// Flag checked between steps; setting it stops the running sweep.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Results of the most recent sweep, partial if it was cut short.
    pub fn last_results(&self) -> &[ScanResult] {
        &self.last_results
    }

    /// Sweep the configured range. `between_steps` runs before every step
    /// and returning `false` cancels the sweep like the cancel flag does.
    pub fn run<F>(
        &mut self,
        source: &mut dyn SampleSource,
        engine: &mut SpectrumEngine,
        base: &Tuning,
        mut between_steps: F,
    ) -> ScanReport
    where
        F: FnMut(&ScanProgress) -> bool,
    {
        let params = self.params;
        let steps = params.steps();
        let half_channel = params.step_hz / 2.0;
        let mut hits = Vec::new();

        log::info!(
            "Scanning {:.3} - {:.3} MHz, {} steps of {:.1} kHz, threshold {:.1} dB",
            params.start_hz / 1e6,
            params.end_hz / 1e6,
            steps.len(),
            params.step_hz / 1e3,
            params.threshold_db
        );

        let mut status = ScanStatus::Completed;
        for (index, &frequency) in steps.iter().enumerate() {
            let progress = ScanProgress {
                index,
                total: steps.len(),
                frequency,
            };
            if self.cancel.load(Ordering::SeqCst) || !between_steps(&progress) {
                log::info!("Scan cancelled at {:.3} MHz", frequency / 1e6);
                status = ScanStatus::Cancelled;
                break;
            }

            match measure(source, engine, &base.with_center(frequency), &params, half_channel) {
                Ok(Some(hit)) => {
                    log::debug!(
                        "hit at {:.4} MHz: {:.1} dB, {:.1} kHz, {}",
                        hit.frequency / 1e6,
                        hit.power_db,
                        hit.bandwidth_hz / 1e3,
                        hit.class
                    );
                    hits.push(hit);
                }
                Ok(None) => {}
                Err(e) => {
                    log::error!("Scan aborted at {:.3} MHz: {}", frequency / 1e6, e);
                    status = ScanStatus::Aborted(e);
                    break;
                }
            }
        }

        self.cancel.store(false, Ordering::SeqCst);
        let results = merge_adjacent(hits, params.step_hz);
        log::info!("Scan finished with {} signal(s)", results.len());
        self.last_results = results.clone();
        ScanReport { results, status }
    }
}

fn measure(
    source: &mut dyn SampleSource,
    engine: &mut SpectrumEngine,
    tuning: &Tuning,
    params: &ScanParams,
    half_channel: f64,
) -> Result<Option<ScanResult>, DeviceError> {
    source.configure(tuning)?;
    if !params.settle.is_zero() {
        std::thread::sleep(params.settle);
    }
    // first block after a retune may still carry the old frequency
    source.read_block()?;
    let block = source.read_block()?;

    engine.reset();
    let frame = engine.compute(&block, WindowKind::Hamming, Accumulation::Instantaneous);
    let Some((bin, power_db)) = frame.channel_peak(tuning.center_freq, half_channel) else {
        return Ok(None);
    };
    if power_db < params.threshold_db {
        return Ok(None);
    }

    let features = SignalFeatures {
        bandwidth_hz: frame.occupied_bandwidth(bin, classify::BANDWIDTH_DROP_DB),
        resolution_hz: frame.resolution,
        flatness: frame.spectral_flatness(frame.bins_around(tuning.center_freq, half_channel)),
        modulation_index: modulation_index(&block.samples),
    };
    Ok(Some(ScanResult {
        frequency: frame.frequency_of(bin),
        power_db,
        bandwidth_hz: features.bandwidth_hz,
        class: classify(&features),
        timestamp: Local::now(),
    }))
}

/// Collapse hits closer than `spacing`, keeping the stronger of each pair.
pub fn merge_adjacent(mut hits: Vec<ScanResult>, spacing: f64) -> Vec<ScanResult> {
    hits.sort_by(|a, b| a.frequency.total_cmp(&b.frequency));
    let mut merged: Vec<ScanResult> = Vec::with_capacity(hits.len());
    for hit in hits {
        match merged.last_mut() {
            Some(prev) if hit.frequency - prev.frequency < spacing => {
                if hit.power_db > prev.power_db {
                    *prev = hit;
                }
            }
            _ => merged.push(hit),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{SyntheticSource, Tone};

    const RATE: u32 = 1_024_000;

    fn base() -> Tuning {
        Tuning {
            sample_rate: RATE,
            ..Tuning::default()
        }
    }

    fn params() -> ScanParams {
        ScanParams {
            start_hz: 100_000_000.0,
            end_hz: 101_000_000.0,
            step_hz: 100_000.0,
            settle: Duration::ZERO,
            threshold_db: -60.0,
        }
    }

    fn hit(frequency: f64, power_db: f32) -> ScanResult {
        ScanResult {
            frequency,
            power_db,
            bandwidth_hz: 0.0,
            class: SignalClass::Unknown,
            timestamp: Local::now(),
        }
    }

    #[test]
    fn steps_cover_range_inclusive() {
        let steps = params().steps();
        assert_eq!(steps.len(), 11);
        assert_eq!(steps[0], 100_000_000.0);
        assert!((steps[10] - 101_000_000.0).abs() < 1e-3);
        let backwards = ScanParams {
            end_hz: 99e6,
            ..params()
        };
        assert!(backwards.validate().is_err());
        assert!(backwards.steps().is_empty());
    }

    #[test]
    fn oversized_sweep_is_rejected() {
        let fine = ScanParams {
            start_hz: 24_000_000.0,
            end_hz: 1_024_000_000.0,
            step_hz: 1.0,
            ..params()
        };
        assert!(matches!(fine.validate(), Err(SessionError::InvalidScan(_))));
        assert!(fine.steps().is_empty());

        let at_limit = ScanParams {
            end_hz: 100_000_000.0 + (MAX_SCAN_STEPS - 1) as f64 * 10.0,
            step_hz: 10.0,
            ..params()
        };
        assert!(at_limit.validate().is_ok());
        assert_eq!(at_limit.steps().len(), MAX_SCAN_STEPS);
    }

    #[test]
    fn single_peak_yields_single_result() {
        let mut source = SyntheticSource::new(1024)
            .with_tone(Tone::new(100_500_000.0, 0.5))
            .with_noise(1e-3);
        let mut engine = SpectrumEngine::new(1024);
        let mut scanner = Scanner::new(params());

        let report = scanner.run(&mut source, &mut engine, &base(), |_| true);
        assert!(matches!(report.status, ScanStatus::Completed));
        assert_eq!(report.results.len(), 1, "{:?}", report.results);
        let result = &report.results[0];
        assert!((result.frequency - 100_500_000.0).abs() <= 50_000.0);
        assert!(result.power_db > -10.0);
        assert_eq!(result.class, SignalClass::Carrier);
        assert_eq!(scanner.last_results(), &report.results[..]);
    }

    #[test]
    fn cancel_between_steps_keeps_partial_results() {
        let mut source = SyntheticSource::new(1024)
            .with_tone(Tone::new(100_100_000.0, 0.5))
            .with_tone(Tone::new(100_700_000.0, 0.5));
        let mut engine = SpectrumEngine::new(1024);
        let mut scanner = Scanner::new(params());

        let report = scanner.run(&mut source, &mut engine, &base(), |p| p.index < 5);
        assert!(matches!(report.status, ScanStatus::Cancelled));
        assert_eq!(report.results.len(), 1);
        assert!((report.results[0].frequency - 100_100_000.0).abs() <= 50_000.0);
        assert_eq!(scanner.last_results().len(), 1);
    }

    #[test]
    fn cancel_flag_stops_before_first_step() {
        let mut source = SyntheticSource::new(256);
        let mut engine = SpectrumEngine::new(256);
        let mut scanner = Scanner::new(params());
        let cancel = scanner.cancel_handle();
        let report = scanner.run(&mut source, &mut engine, &base(), |_| {
            cancel.store(true, Ordering::SeqCst);
            true
        });
        // the callback runs after the flag check, so step 0 still happens
        assert!(matches!(report.status, ScanStatus::Cancelled));
        assert!(report.results.is_empty());
    }

    #[test]
    fn device_failure_aborts_with_partial_list() {
        let mut source = SyntheticSource::new(1024)
            .with_tone(Tone::new(100_100_000.0, 0.5))
            .with_failure_after(4);
        let mut engine = SpectrumEngine::new(1024);
        let mut scanner = Scanner::new(params());

        let report = scanner.run(&mut source, &mut engine, &base(), |_| true);
        assert!(matches!(report.status, ScanStatus::Aborted(DeviceError::Disconnected(_))));
        assert_eq!(report.results.len(), 1);
        assert!(source.read_block().is_err());
    }

    #[test]
    fn adjacent_hits_merge_to_the_stronger() {
        let merged = merge_adjacent(
            vec![hit(100.2e6, -30.0), hit(100.0e6, -40.0), hit(100.05e6, -20.0), hit(100.4e6, -50.0)],
            100_000.0,
        );
        let freqs: Vec<f64> = merged.iter().map(|r| r.frequency).collect();
        assert_eq!(freqs, vec![100.05e6, 100.2e6, 100.4e6]);
    }
}
