use serde::{Deserialize, Serialize};

use super::filter::DcBlocker;
use crate::input::IqSample;

/// Limits on what the estimator may report before it is considered garbage
const ALPHA_RANGE: (f32, f32) = (0.5, 2.0);
const MAX_SIN_PHI: f32 = 0.5;
/// Weight of each new block estimate in the running correction
const ESTIMATE_SMOOTHING: f32 = 0.1;
const DC_POLE: f32 = 0.9995;

/// Amplitude and phase imbalance between the I and Q rails.
///
/// `alpha` is the I/Q gain ratio and `sin_phi` the sine of the quadrature
/// skew. The identity correction is `alpha = 1, sin_phi = 0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IqBalance {
    pub alpha: f32,
    pub sin_phi: f32,
}

impl Default for IqBalance {
    fn default() -> Self {
        Self { alpha: 1.0, sin_phi: 0.0 }
    }
}

impl IqBalance {
    /// Measure imbalance from one block. `None` when the block has no energy
    /// on either rail.
    pub fn estimate(samples: &[IqSample]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let n = samples.len() as f32;
        let (mut ii, mut qq, mut iq) = (0.0f32, 0.0f32, 0.0f32);
        for s in samples {
            ii += s.re * s.re;
            qq += s.im * s.im;
            iq += s.re * s.im;
        }
        let (ii, qq, iq) = (ii / n, qq / n, iq / n);
        if !(ii > 1e-20 && qq > 1e-20) || !(ii + qq).is_finite() {
            return None;
        }
        let alpha = (ii / qq).sqrt();
        let sin_phi = iq / (ii * qq).sqrt();
        Some(Self { alpha, sin_phi }.clamped())
    }

    fn clamped(self) -> Self {
        Self {
            alpha: self.alpha.clamp(ALPHA_RANGE.0, ALPHA_RANGE.1),
            sin_phi: self.sin_phi.clamp(-MAX_SIN_PHI, MAX_SIN_PHI),
        }
    }

    /// Apply the affine correction to one sample.
    #[inline]
    pub fn correct(&self, s: IqSample) -> IqSample {
        let cos_phi = (1.0 - self.sin_phi * self.sin_phi).sqrt();
        let i = s.re / self.alpha;
        let q = (s.im - self.sin_phi * i) / cos_phi;
        IqSample::new(i, q)
    }
}

/// DC removal followed by I/Q imbalance correction.
#[derive(Debug, Clone)]
pub struct IqFrontEnd {
    balance: IqBalance,
    auto: bool,
    dc_i: DcBlocker,
    dc_q: DcBlocker,
}

impl IqFrontEnd {
    pub fn new(balance: IqBalance, auto: bool) -> Self {
        Self {
            balance: balance.clamped(),
            auto,
            dc_i: DcBlocker::new(DC_POLE),
            dc_q: DcBlocker::new(DC_POLE),
        }
    }

    pub fn balance(&self) -> IqBalance {
        self.balance
    }

    pub fn reset(&mut self) {
        self.dc_i.reset();
        self.dc_q.reset();
    }

    pub fn process(&mut self, samples: &[IqSample]) -> Vec<IqSample> {
        let centered: Vec<IqSample> = samples
            .iter()
            .map(|s| IqSample::new(self.dc_i.process(s.re), self.dc_q.process(s.im)))
            .collect();

        if self.auto {
            if let Some(est) = IqBalance::estimate(&centered) {
                self.balance = IqBalance {
                    alpha: self.balance.alpha + ESTIMATE_SMOOTHING * (est.alpha - self.balance.alpha),
                    sin_phi: self.balance.sin_phi + ESTIMATE_SMOOTHING * (est.sin_phi - self.balance.sin_phi),
                }
                .clamped();
            }
        }

        let balance = self.balance;
        centered.into_iter().map(|s| balance.correct(s)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn skewed(alpha: f32, phi: f32, len: usize) -> Vec<IqSample> {
        (0..len)
            .map(|n| {
                let t = 2.0 * PI * 0.01 * n as f32;
                IqSample::new(alpha * t.cos(), (t + phi).sin())
            })
            .collect()
    }

    #[test]
    fn identity_leaves_samples_alone() {
        let s = IqSample::new(0.3, -0.7);
        assert_eq!(IqBalance::default().correct(s), s);
    }

    #[test]
    fn estimate_recovers_gain_and_phase() {
        let est = IqBalance::estimate(&skewed(1.2, 0.1, 10_000)).unwrap();
        assert!((est.alpha - 1.2).abs() < 0.02, "alpha {}", est.alpha);
        // I*Q correlation of cos(t)*sin(t+phi) gives sin(phi)
        assert!((est.sin_phi - 0.1f32.sin()).abs() < 0.02, "sin_phi {}", est.sin_phi);
    }

    #[test]
    fn correction_restores_quadrature() {
        let samples = skewed(1.2, 0.1, 10_000);
        let bal = IqBalance::estimate(&samples).unwrap();
        let fixed: Vec<IqSample> = samples.iter().map(|&s| bal.correct(s)).collect();
        let after = IqBalance::estimate(&fixed).unwrap();
        assert!((after.alpha - 1.0).abs() < 0.02);
        assert!(after.sin_phi.abs() < 0.02);
    }

    #[test]
    fn silent_block_has_no_estimate() {
        assert!(IqBalance::estimate(&[IqSample::new(0.0, 0.0); 64]).is_none());
        assert!(IqBalance::estimate(&[]).is_none());
    }
}
