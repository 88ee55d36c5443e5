//! Live playback: a lock-free ring between the demodulation thread and the
//! output device callback.

use ringbuf::{HeapConsumer, HeapProducer, HeapRb};

use super::{AudioFrame, CHANNELS};
#[cfg(feature = "playback")]
use crate::error::PlaybackError;

pub struct Playback {
    producer: HeapProducer<f32>,
    dropped: u64,
    #[cfg(feature = "playback")]
    _stream: Option<cpal::Stream>,
}

impl Playback {
    /// Ring of `capacity_frames` stereo frames with the consumer end handed
    /// back to the caller instead of a device.
    pub fn detached(capacity_frames: usize) -> (Self, HeapConsumer<f32>) {
        let ring = HeapRb::<f32>::new(capacity_frames.max(1) * CHANNELS);
        let (producer, consumer) = ring.split();
        let playback = Self {
            producer,
            dropped: 0,
            #[cfg(feature = "playback")]
            _stream: None,
        };
        (playback, consumer)
    }

    /// Open the default output device at `sample_rate` and start draining.
    #[cfg(feature = "playback")]
    pub fn open_default(sample_rate: u32, capacity_frames: usize) -> Result<Self, PlaybackError> {
        use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

        let host = cpal::default_host();
        let device = host.default_output_device().ok_or(PlaybackError::NoDevice)?;
        let supported = device
            .default_output_config()
            .map_err(|e| PlaybackError::Device(e.to_string()))?;
        let mut cfg = supported.config();
        cfg.sample_rate.0 = sample_rate;
        let channels = cfg.channels as usize;

        let (mut playback, mut consumer) = Self::detached(capacity_frames);
        let err_fn = |e| log::warn!("output stream error: {}", e);

        let stream = match supported.sample_format() {
            cpal::SampleFormat::F32 => device.build_output_stream(
                &cfg,
                move |out: &mut [f32], _| drain_into(out, channels, &mut consumer, |s| s),
                err_fn,
                None,
            ),
            cpal::SampleFormat::I16 => device.build_output_stream(
                &cfg,
                move |out: &mut [i16], _| {
                    drain_into(out, channels, &mut consumer, |s| (s * 32767.0) as i16)
                },
                err_fn,
                None,
            ),
            cpal::SampleFormat::U16 => device.build_output_stream(
                &cfg,
                move |out: &mut [u16], _| {
                    drain_into(out, channels, &mut consumer, |s| ((s * 0.5 + 0.5) * 65535.0) as u16)
                },
                err_fn,
                None,
            ),
            other => return Err(PlaybackError::UnsupportedFormat(format!("{:?}", other))),
        }
        .map_err(|e| PlaybackError::Device(e.to_string()))?;

        stream.play().map_err(|e| PlaybackError::Device(e.to_string()))?;
        log::info!(
            "Playback on '{}' at {} Hz, {} channels",
            device.name().unwrap_or_default(),
            sample_rate,
            channels
        );
        playback._stream = Some(stream);
        Ok(playback)
    }

    /// Queue a frame. Samples that do not fit are dropped and counted.
    pub fn push(&mut self, frame: &AudioFrame) -> usize {
        let written = self.producer.push_slice(&frame.samples);
        let lost = frame.samples.len() - written;
        if lost > 0 {
            self.dropped += lost as u64;
            log::debug!("playback ring full, dropped {} samples", lost);
        }
        written
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Samples waiting for the device.
    pub fn queued(&self) -> usize {
        self.producer.len()
    }
}

/// Fill a device buffer from the stereo ring. Extra device channels get the
/// mono mix; an underrun plays silence.
#[cfg_attr(not(feature = "playback"), allow(dead_code))]
fn drain_into<T: Copy>(
    out: &mut [T],
    channels: usize,
    consumer: &mut HeapConsumer<f32>,
    convert: impl Fn(f32) -> T,
) {
    let channels = channels.max(1);
    for frame in out.chunks_mut(channels) {
        let left = consumer.pop().unwrap_or(0.0);
        let right = consumer.pop().unwrap_or(left);
        for (ch, slot) in frame.iter_mut().enumerate() {
            let s = match (ch, channels) {
                (_, 1) => 0.5 * (left + right),
                (0, _) => left,
                (1, _) => right,
                _ => 0.5 * (left + right),
            };
            *slot = convert(s.clamp(-1.0, 1.0));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_is_counted() {
        let (mut playback, mut consumer) = Playback::detached(4);
        let frame = AudioFrame::from_mono(&[0.1, 0.2, 0.3], 48_000);
        assert_eq!(playback.push(&frame), 6);
        assert_eq!(playback.push(&frame), 2);
        assert_eq!(playback.dropped(), 4);
        assert_eq!(consumer.pop(), Some(0.1));
    }

    #[test]
    fn drain_maps_stereo_onto_device_channels() {
        let (mut playback, mut consumer) = Playback::detached(8);
        playback.push(&AudioFrame {
            samples: vec![0.5, -0.5],
            sample_rate: 48_000,
        });
        let mut out = [9.0f32; 6];
        drain_into(&mut out, 3, &mut consumer, |s| s);
        assert_eq!(out, [0.5, -0.5, 0.0, 0.0, 0.0, 0.0]);
    }
}
