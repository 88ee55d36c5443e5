use serde::{Deserialize, Serialize};

/// Attack time constant: how fast gain drops when the signal gets louder
pub const AGC_ATTACK_SECS: f32 = 0.010;
/// Decay time constant: how fast gain recovers when the signal gets quieter
pub const AGC_DECAY_SECS: f32 = 0.500;
/// RMS the loop steers the audio toward
pub const AGC_TARGET_RMS: f32 = 0.25;
pub const AGC_GAIN_MIN: f32 = 0.01;
pub const AGC_GAIN_MAX: f32 = 1000.0;
/// Below this RMS the block is treated as silence and gain is held
const AGC_SILENCE_RMS: f32 = 1e-7;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AgcParams {
    pub enabled: bool,
    pub target_rms: f32,
    pub attack_secs: f32,
    pub decay_secs: f32,
    pub gain_min: f32,
    pub gain_max: f32,
    /// Gain used while the loop is disabled
    pub manual_gain: f32,
}

impl Default for AgcParams {
    fn default() -> Self {
        Self {
            enabled: true,
            target_rms: AGC_TARGET_RMS,
            attack_secs: AGC_ATTACK_SECS,
            decay_secs: AGC_DECAY_SECS,
            gain_min: AGC_GAIN_MIN,
            gain_max: AGC_GAIN_MAX,
            manual_gain: 1.0,
        }
    }
}

impl AgcParams {
    fn clamp(&self, gain: f32) -> f32 {
        let (lo, hi) = if self.gain_min <= self.gain_max {
            (self.gain_min, self.gain_max)
        } else {
            (self.gain_max, self.gain_min)
        };
        if gain.is_finite() {
            gain.clamp(lo, hi)
        } else {
            lo
        }
    }
}

/// Block-rate automatic gain control.
///
/// An RMS envelope follows the input with separate attack and decay rates
/// and the gain chases `target / envelope`. On a block louder than the one
/// before it the gain may only fall or hold.
#[derive(Debug, Clone)]
pub struct Agc {
    params: AgcParams,
    gain: f32,
    envelope: Option<f32>,
    /// RMS of the previous block, silence included
    last_level: Option<f32>,
}

impl Agc {
    pub fn new(params: AgcParams) -> Self {
        let mut agc = Self {
            params,
            gain: 1.0,
            envelope: None,
            last_level: None,
        };
        agc.reset();
        agc
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn params(&self) -> &AgcParams {
        &self.params
    }

    pub fn set_params(&mut self, params: AgcParams) {
        self.params = params;
        self.gain = self.params.clamp(self.gain);
    }

    pub fn reset(&mut self) {
        self.envelope = None;
        self.last_level = None;
        self.gain = self.params.clamp(if self.params.enabled { 1.0 } else { self.params.manual_gain });
    }

    /// Update the gain from this block and apply it in place (output is
    /// limited to ±1). `block_secs` is the block duration.
    pub fn process(&mut self, block: &mut [f32], block_secs: f32) -> f32 {
        if block.is_empty() {
            return self.gain;
        }

        if !self.params.enabled {
            self.gain = self.params.clamp(self.params.manual_gain);
        } else {
            let level = (block.iter().map(|x| x * x).sum::<f32>() / block.len() as f32).sqrt();
            if level.is_finite() {
                let rising = self.last_level.is_some_and(|last| level > last);
                if level > AGC_SILENCE_RMS {
                    self.update(level, rising, block_secs);
                }
                self.last_level = Some(level);
            }
        }

        for x in block.iter_mut() {
            *x = (*x * self.gain).clamp(-1.0, 1.0);
        }
        self.gain
    }

    fn update(&mut self, level: f32, rising: bool, block_secs: f32) {
        let attack = smoothing(block_secs, self.params.attack_secs);
        let decay = smoothing(block_secs, self.params.decay_secs);

        let envelope = match self.envelope {
            None => level,
            Some(env) => {
                let coeff = if level > env { attack } else { decay };
                env + coeff * (level - env)
            }
        };
        self.envelope = Some(envelope);

        let desired = self.params.clamp(self.params.target_rms / envelope);
        let coeff = if desired < self.gain { attack } else { decay };
        let mut next = self.gain + coeff * (desired - self.gain);
        if rising {
            next = next.min(self.gain);
        }
        self.gain = self.params.clamp(next);
    }
}

/// One-pole smoothing coefficient for a step of `dt` with time constant `tau`.
fn smoothing(dt: f32, tau: f32) -> f32 {
    if tau <= 0.0 {
        return 1.0;
    }
    (1.0 - (-dt.max(0.0) / tau).exp()).clamp(0.0, 1.0)
}
