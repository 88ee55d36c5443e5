//! RTL-SDR hardware source.
//!
//! The `rtlsdr` device handle is not `Send`, so it lives entirely on a worker
//! thread; tuning requests and sample blocks cross over channels.

use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use super::{IqSample, SampleBlock, SampleSource, SourceState, Tuning};
use crate::error::{DeviceError, DeviceResult};

/// RTL2832U tuners cover roughly this span
const MIN_FREQ_HZ: f64 = 24_000_000.0;
const MAX_FREQ_HZ: f64 = 1_766_000_000.0;
const MAX_SAMPLE_RATE: u32 = 3_200_000;

enum Request {
    Configure(Tuning, Sender<Result<(), String>>),
    /// Sequence number and sample count
    Read(u64, usize),
    Stop,
}

/// Worker answer to a [`Request::Read`]
struct Reply {
    seq: u64,
    result: Result<Vec<IqSample>, String>,
}

/// Information about an RTL-SDR device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub index: u32,
    pub name: String,
    pub serial: String,
}

/// Enumerate available RTL-SDR devices.
pub fn list_devices() -> Vec<DeviceInfo> {
    let count = rtlsdr::get_device_count();
    let mut devices = Vec::new();
    for i in 0..count {
        if let Ok(usb_strings) = rtlsdr::get_device_usb_strings(i) {
            devices.push(DeviceInfo {
                index: i as u32,
                name: rtlsdr::get_device_name(i),
                serial: usb_strings.serial,
            });
        }
    }
    devices
}

pub struct RtlSdrSource {
    requests: Sender<Request>,
    blocks: Receiver<Reply>,
    worker: Option<JoinHandle<()>>,
    /// Sequence number of the last read requested
    seq: u64,
    block_len: usize,
    timeout: Duration,
    state: SourceState,
    index: u32,
}

impl RtlSdrSource {
    pub fn open(index: u32, block_len: usize, timeout: Duration) -> DeviceResult<Self> {
        let (req_tx, req_rx) = bounded::<Request>(4);
        let (block_tx, block_rx) = bounded(2);
        let (init_tx, init_rx) = bounded::<Result<(), String>>(1);

        let worker = std::thread::Builder::new()
            .name(format!("rtlsdr-{}", index))
            .spawn(move || {
                let mut device = match rtlsdr::open(index as i32) {
                    Ok(dev) => {
                        let _ = init_tx.send(Ok(()));
                        dev
                    }
                    Err(e) => {
                        let _ = init_tx.send(Err(format!("failed to open RTL-SDR {}: {:?}", index, e)));
                        return;
                    }
                };

                for request in req_rx.iter() {
                    match request {
                        Request::Configure(tuning, reply) => {
                            let result = apply_tuning(&mut device, &tuning);
                            let _ = reply.send(result);
                        }
                        Request::Read(seq, samples) => {
                            // u8 interleaved I, Q
                            let result = device
                                .read_sync(samples * 2)
                                .map(|buf| {
                                    buf.chunks_exact(2)
                                        .map(|c| {
                                            IqSample::new(
                                                (c[0] as f32 - 127.5) / 127.5,
                                                (c[1] as f32 - 127.5) / 127.5,
                                            )
                                        })
                                        .collect()
                                })
                                .map_err(|e| format!("{:?}", e));
                            if block_tx.send(Reply { seq, result }).is_err() {
                                break;
                            }
                        }
                        Request::Stop => break,
                    }
                }
                log::info!("RTL-SDR {} closed", index);
            })?;

        match init_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(DeviceError::Disconnected(e)),
            Err(_) => return Err(DeviceError::Timeout(5_000)),
        }
        log::info!("RTL-SDR device {} opened", index);

        Ok(Self {
            requests: req_tx,
            blocks: block_rx,
            worker: Some(worker),
            seq: 0,
            block_len: block_len.max(1),
            timeout,
            state: SourceState::default(),
            index,
        })
    }
}

fn apply_tuning(device: &mut rtlsdr::RTLSDRDevice, tuning: &Tuning) -> Result<(), String> {
    let freq = tuning.effective_frequency().round() as u32;
    device.set_sample_rate(tuning.sample_rate).map_err(|e| format!("sample rate: {:?}", e))?;
    device.set_center_freq(freq).map_err(|e| format!("center frequency: {:?}", e))?;
    match tuning.gain {
        None => device.set_tuner_gain_mode(false).map_err(|e| format!("gain mode: {:?}", e))?,
        Some(db) => {
            device.set_tuner_gain_mode(true).map_err(|e| format!("gain mode: {:?}", e))?;
            device
                .set_tuner_gain((db * 10.0).round() as i32)
                .map_err(|e| format!("gain: {:?}", e))?;
        }
    }
    device.reset_buffer().map_err(|e| format!("reset buffer: {:?}", e))?;
    log::info!(
        "RTL-SDR tuned: {:.6} MHz (effective), {:.3} MS/s, gain {:?}",
        freq as f64 / 1e6,
        tuning.sample_rate as f64 / 1e6,
        tuning.gain
    );
    Ok(())
}

impl SampleSource for RtlSdrSource {
    fn configure(&mut self, tuning: &Tuning) -> DeviceResult<()> {
        tuning.validate()?;
        let freq = tuning.effective_frequency();
        if !(MIN_FREQ_HZ..=MAX_FREQ_HZ).contains(&freq) || tuning.sample_rate > MAX_SAMPLE_RATE {
            return Err(self.state.fail(DeviceError::Unsupported(format!(
                "{:.3} MHz at {} Hz is outside the RTL-SDR range",
                freq / 1e6,
                tuning.sample_rate
            ))));
        }

        let (reply_tx, reply_rx) = bounded(1);
        self.requests
            .send(Request::Configure(*tuning, reply_tx))
            .map_err(|_| self.state.fail(DeviceError::Disconnected("RTL-SDR worker exited".into())))?;
        match reply_rx.recv_timeout(self.timeout) {
            Ok(Ok(())) => {
                self.state.accept(tuning);
                Ok(())
            }
            Ok(Err(e)) => Err(self.state.fail(DeviceError::Unsupported(e))),
            Err(_) => Err(self.state.fail(DeviceError::Timeout(self.timeout.as_millis() as u64))),
        }
    }

    fn read_block(&mut self) -> DeviceResult<SampleBlock> {
        let tuning = self.state.ready()?;
        self.seq += 1;
        if self.requests.send(Request::Read(self.seq, self.block_len)).is_err() {
            return Err(self.state.fail(DeviceError::Disconnected("RTL-SDR worker exited".into())));
        }
        match recv_reply(&self.blocks, self.seq, self.timeout) {
            Ok(Ok(mut samples)) => {
                samples.resize(self.block_len, IqSample::new(0.0, 0.0));
                Ok(SampleBlock::new(samples, &tuning))
            }
            Ok(Err(e)) => Err(self.state.fail(DeviceError::Disconnected(e))),
            Err(RecvTimeoutError::Timeout) => {
                Err(self.state.fail(DeviceError::Timeout(self.timeout.as_millis() as u64)))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(self.state.fail(DeviceError::Disconnected("RTL-SDR worker exited".into())))
            }
        }
    }

    fn block_len(&self) -> usize {
        self.block_len
    }

    fn tuning(&self) -> Option<Tuning> {
        self.state.tuning()
    }

    fn describe(&self) -> String {
        format!("RTL-SDR #{}", self.index)
    }
}

/// Wait for the answer to read `seq`. Late answers to reads that already
/// timed out are discarded, so no block from before a retune leaks through.
fn recv_reply(
    blocks: &Receiver<Reply>,
    seq: u64,
    timeout: Duration,
) -> Result<Result<Vec<IqSample>, String>, RecvTimeoutError> {
    let deadline = Instant::now() + timeout;
    loop {
        let reply = blocks.recv_timeout(deadline.saturating_duration_since(Instant::now()))?;
        if reply.seq == seq {
            return Ok(reply.result);
        }
        log::debug!("discarding stale RTL-SDR block #{}", reply.seq);
    }
}

impl Drop for RtlSdrSource {
    fn drop(&mut self) {
        let _ = self.requests.send(Request::Stop);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
