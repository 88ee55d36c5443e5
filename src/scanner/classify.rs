//! Heuristic signal classification from spectral shape and modulation.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::input::IqSample;

/// Spectral flatness above which a channel is called noise. A single
/// periodogram of white noise reads about 0.56, a carrier close to 0.
pub const NOISE_FLATNESS: f32 = 0.5;
pub const WIDEBAND_FM_MIN_HZ: f64 = 150_000.0;
pub const NARROWBAND_FM_HZ: (f64, f64) = (8_000.0, 16_000.0);
/// NFM shows little amplitude variation relative to its phase activity
pub const NARROWBAND_FM_MAX_INDEX: f32 = 0.3;
pub const AM_HZ: (f64, f64) = (8_000.0, 10_000.0);
pub const SSB_HZ: (f64, f64) = (2_000.0, 3_000.0);
pub const CARRIER_MAX_HZ: f64 = 2_000.0;
/// Anything no wider than this many bins is below the analysis resolution
pub const UNRESOLVED_BINS: f64 = 3.0;
/// Bandwidth is measured down to this many dB below the peak
pub const BANDWIDTH_DROP_DB: f32 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalClass {
    Noise,
    WidebandFm,
    NarrowbandFm,
    Am,
    Ssb,
    Carrier,
    Unknown,
}

impl fmt::Display for SignalClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SignalClass::Noise => "noise",
            SignalClass::WidebandFm => "WFM",
            SignalClass::NarrowbandFm => "NFM",
            SignalClass::Am => "AM",
            SignalClass::Ssb => "SSB",
            SignalClass::Carrier => "carrier",
            SignalClass::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Measurements the classifier works from
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalFeatures {
    /// Occupied bandwidth at [`BANDWIDTH_DROP_DB`]
    pub bandwidth_hz: f64,
    /// Bin spacing of the spectrum the bandwidth came from
    pub resolution_hz: f64,
    /// Spectral flatness of the channel, 0..1
    pub flatness: f32,
    /// See [`modulation_index`]
    pub modulation_index: f32,
}

/// Phase activity over amplitude activity: `var(Δphase) / var(|x|)`.
/// Constant-envelope FM scores high, AM low.
pub fn modulation_index(samples: &[IqSample]) -> f32 {
    if samples.len() < 3 {
        return 0.0;
    }
    let dphase: Vec<f32> = samples.windows(2).map(|w| (w[1] * w[0].conj()).arg()).collect();
    let envelope: Vec<f32> = samples.iter().map(|s| s.norm()).collect();
    variance(&dphase) / (variance(&envelope) + 1e-10)
}

fn variance(x: &[f32]) -> f32 {
    let n = x.len() as f32;
    let mean = x.iter().sum::<f32>() / n;
    x.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n
}

pub fn classify(f: &SignalFeatures) -> SignalClass {
    let bw = f.bandwidth_hz;
    let within = |(lo, hi): (f64, f64)| bw >= lo && bw <= hi;

    if f.flatness > NOISE_FLATNESS {
        SignalClass::Noise
    } else if bw >= WIDEBAND_FM_MIN_HZ {
        SignalClass::WidebandFm
    } else if bw <= UNRESOLVED_BINS * f.resolution_hz {
        SignalClass::Carrier
    } else if within(NARROWBAND_FM_HZ) && f.modulation_index < NARROWBAND_FM_MAX_INDEX {
        SignalClass::NarrowbandFm
    } else if within(AM_HZ) {
        SignalClass::Am
    } else if within(SSB_HZ) {
        SignalClass::Ssb
    } else if bw < CARRIER_MAX_HZ {
        SignalClass::Carrier
    } else {
        SignalClass::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(bandwidth_hz: f64, flatness: f32, modulation_index: f32) -> SignalFeatures {
        SignalFeatures {
            bandwidth_hz,
            resolution_hz: 100.0,
            flatness,
            modulation_index,
        }
    }

    #[test]
    fn decision_table() {
        assert_eq!(classify(&features(12_000.0, 0.9, 0.0)), SignalClass::Noise);
        assert_eq!(classify(&features(180_000.0, 0.1, 5.0)), SignalClass::WidebandFm);
        assert_eq!(classify(&features(12_000.0, 0.1, 0.1)), SignalClass::NarrowbandFm);
        assert_eq!(classify(&features(9_000.0, 0.1, 0.1)), SignalClass::NarrowbandFm);
        assert_eq!(classify(&features(9_000.0, 0.1, 2.0)), SignalClass::Am);
        assert_eq!(classify(&features(2_500.0, 0.1, 0.0)), SignalClass::Ssb);
        assert_eq!(classify(&features(800.0, 0.05, 0.0)), SignalClass::Carrier);
        assert_eq!(classify(&features(40_000.0, 0.2, 0.0)), SignalClass::Unknown);
    }

    #[test]
    fn unresolved_width_is_a_carrier() {
        let f = SignalFeatures {
            bandwidth_hz: 3_000.0,
            resolution_hz: 1_000.0,
            flatness: 0.01,
            modulation_index: 0.0,
        };
        assert_eq!(classify(&f), SignalClass::Carrier);
    }

    #[test]
    fn modulation_index_separates_am_from_fm() {
        let fm: Vec<IqSample> = (0..4096)
            .map(|n| {
                let ph = 3.0 * (n as f32 * 0.01).sin();
                IqSample::new(ph.cos(), ph.sin())
            })
            .collect();
        let am: Vec<IqSample> = (0..4096)
            .map(|n| IqSample::new(1.0 + 0.5 * (n as f32 * 0.01).sin(), 0.0))
            .collect();
        assert!(modulation_index(&fm) > 10.0);
        assert!(modulation_index(&am) < 0.01);
    }
}
