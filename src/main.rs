use clap::Parser;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use iq_analyzer::input::{StreamFormat, SyntheticSource, TcpSource, Tone, WavSource};
use iq_analyzer::output::IqFormat;
use iq_analyzer::{Command, DemodMode, Event, RecordKind, SampleSource, ScanParams, Session, SessionConfig};

const STREAM_TIMEOUT: Duration = Duration::from_secs(5);
const STATUS_INTERVAL: Duration = Duration::from_secs(2);

/// Spectrum analyzer, demodulator and frequency scanner for IQ sources
#[derive(Parser, Debug)]
#[command(name = "iq-analyzer")]
#[command(version, about, long_about = None)]
struct Args {
    /// IQ WAV recording to play back (looped)
    #[arg(value_name = "INPUT")]
    input_file: Option<PathBuf>,

    /// Connect to SDR++ Network Sink (TCP) for live streaming
    #[arg(short, long, value_name = "HOST:PORT")]
    stream: Option<String>,

    /// Generated test signal instead of a receiver
    #[arg(long)]
    synthetic: bool,

    /// Synthetic tone frequency in MHz (repeatable; default center + 25 kHz)
    #[arg(long, value_name = "MHZ")]
    tone: Vec<f64>,

    /// RTL-SDR device index
    #[cfg(feature = "hardware")]
    #[arg(short, long)]
    device: Option<u32>,

    /// List attached RTL-SDR devices and exit
    #[cfg(feature = "hardware")]
    #[arg(long)]
    list_devices: bool,

    /// Center frequency in MHz
    #[arg(short, long, default_value = "100.0")]
    freq: f64,

    /// Sample rate for stream and synthetic mode (Hz)
    #[arg(short, long, default_value = "1024000")]
    rate: u32,

    /// Stream format: int8, int16, int32, float32
    #[arg(long, default_value = "float32")]
    format: String,

    /// Tuner gain in dB (automatic when omitted)
    #[arg(short, long)]
    gain: Option<f32>,

    /// Oscillator correction in ppm
    #[arg(long, default_value = "0", allow_hyphen_values = true)]
    ppm: f64,

    /// Demodulation mode: am, nfm, wfm, usb, lsb, raw
    #[arg(short, long, default_value = "nfm")]
    mode: DemodMode,

    /// Scan a range instead of listening, in MHz
    #[arg(long, value_name = "START:END")]
    scan: Option<String>,

    /// Scan step in kHz
    #[arg(long, default_value = "100")]
    step: f64,

    /// Wait after each scan retune in milliseconds
    #[arg(long, default_value = "50")]
    settle_ms: u64,

    /// Scan detection threshold in dB
    #[arg(long, default_value = "-60", allow_hyphen_values = true)]
    threshold: f32,

    /// Named pipe for exported audio (22050 Hz mono s16le)
    #[arg(long, value_name = "PATH")]
    export_fifo: Option<PathBuf>,

    /// Record demodulated audio
    #[arg(long)]
    record_audio: bool,

    /// Record raw IQ
    #[arg(long)]
    record_iq: bool,

    /// Output int16 IQ WAV (for URH) instead of float32 (for inspectrum)
    #[arg(long)]
    int16: bool,

    /// Output directory for recordings
    #[arg(short, long, default_value = "./recordings")]
    output_dir: PathBuf,

    /// Do not play audio on the default output device
    #[arg(long)]
    no_playback: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter))
        .format_timestamp_millis()
        .init();

    #[cfg(feature = "hardware")]
    if args.list_devices {
        list_devices();
        return Ok(());
    }

    let sources = [args.input_file.is_some(), args.stream.is_some(), args.synthetic, has_device(&args)];
    match sources.iter().filter(|&&s| s).count() {
        0 => {
            eprintln!("Error: Must specify an input file, --stream <host:port>, --synthetic or --device");
            std::process::exit(1);
        }
        1 => {}
        _ => {
            eprintln!("Error: Specify only one source");
            std::process::exit(1);
        }
    }

    let mut config = SessionConfig::default();
    config.tuning.center_freq = args.freq * 1e6;
    config.tuning.sample_rate = args.rate;
    config.tuning.gain = args.gain;
    config.tuning.ppm_correction = args.ppm;
    config.demod.mode = args.mode;
    config.playback = !args.no_playback;
    config.export_fifo = args.export_fifo.clone();
    config.output_dir = args.output_dir.clone();
    config.iq_format = if args.int16 { IqFormat::Int16 } else { IqFormat::Float32 };

    let source = open_source(&args, &mut config)?;

    if args.record_audio || args.record_iq {
        std::fs::create_dir_all(&args.output_dir)?;
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let session = Session::spawn(config, source)?;
    let events = session.events().clone();

    if let Some(range) = &args.scan {
        let (start, end) = parse_range(range)?;
        let params = ScanParams {
            start_hz: start * 1e6,
            end_hz: end * 1e6,
            step_hz: args.step * 1e3,
            settle: Duration::from_millis(args.settle_ms),
            threshold_db: args.threshold,
        };
        session.start_scan(params)?;
        run_scan(&session, &events, &running)?;
        session.shutdown();
        return Ok(());
    }

    if args.record_audio {
        session.send(Command::StartRecording(RecordKind::Audio))?;
    }
    if args.record_iq {
        session.send(Command::StartRecording(RecordKind::Iq))?;
    }

    println!("Listening on {:.6} MHz ({}), Ctrl+C to stop", args.freq, args.mode);
    let mut last_status = Instant::now();
    while running.load(Ordering::SeqCst) {
        match events.recv_timeout(Duration::from_millis(200)) {
            Ok(event) => report(&event, args.verbose),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if last_status.elapsed() >= STATUS_INTERVAL {
            last_status = Instant::now();
            print_status(&session);
        }
    }

    println!("\nStopping...");
    session.send(Command::StopRecording(RecordKind::Audio))?;
    session.send(Command::StopRecording(RecordKind::Iq))?;
    let stats = session.stats();
    session.shutdown();
    for event in events.try_iter() {
        report(&event, args.verbose);
    }
    println!(
        "{} blocks read, {} dropped by the audio path",
        stats.blocks_read, stats.blocks_dropped
    );

    Ok(())
}

#[cfg(feature = "hardware")]
fn has_device(args: &Args) -> bool {
    args.device.is_some()
}

#[cfg(not(feature = "hardware"))]
fn has_device(_args: &Args) -> bool {
    false
}

fn open_source(args: &Args, config: &mut SessionConfig) -> Result<Box<dyn SampleSource>, Box<dyn std::error::Error>> {
    let block_len = config.block_len;

    if let Some(path) = &args.input_file {
        let source = WavSource::open(path, block_len, true)?;
        // a recording dictates its own rate
        config.tuning.sample_rate = source.file_rate();
        config.pace = true;
        return Ok(Box::new(source));
    }

    if let Some(addr) = &args.stream {
        let format: StreamFormat = args.format.parse().map_err(|e: String| {
            eprintln!("Error: Invalid format '{}'. Use: int8, int16, int32, float32", args.format);
            e
        })?;
        return Ok(Box::new(TcpSource::connect(addr, format, args.rate, block_len, STREAM_TIMEOUT)?));
    }

    if args.synthetic {
        let mut source = SyntheticSource::new(block_len).with_noise(0.01);
        if args.tone.is_empty() {
            source = source.with_tone(Tone::new(config.tuning.center_freq + 25_000.0, 0.5));
        }
        for &mhz in &args.tone {
            source = source.with_tone(Tone::new(mhz * 1e6, 0.5));
        }
        config.pace = true;
        return Ok(Box::new(source));
    }

    open_device(args, block_len)
}

#[cfg(feature = "hardware")]
fn open_device(args: &Args, block_len: usize) -> Result<Box<dyn SampleSource>, Box<dyn std::error::Error>> {
    let index = args.device.unwrap_or(0);
    let source = iq_analyzer::input::rtlsdr::RtlSdrSource::open(index, block_len, STREAM_TIMEOUT)?;
    Ok(Box::new(source))
}

#[cfg(feature = "hardware")]
fn list_devices() {
    let devices = iq_analyzer::input::rtlsdr::list_devices();
    if devices.is_empty() {
        println!("No RTL-SDR devices found");
        return;
    }
    for dev in devices {
        println!("{:>3}  {}  (serial {})", dev.index, dev.name, dev.serial);
    }
}

#[cfg(not(feature = "hardware"))]
fn open_device(_args: &Args, _block_len: usize) -> Result<Box<dyn SampleSource>, Box<dyn std::error::Error>> {
    Err("built without the `hardware` feature".into())
}

fn parse_range(range: &str) -> Result<(f64, f64), Box<dyn std::error::Error>> {
    let (start, end) = range
        .split_once(':')
        .ok_or_else(|| format!("scan range '{}' is not START:END", range))?;
    Ok((start.trim().parse()?, end.trim().parse()?))
}

fn run_scan(
    session: &Session,
    events: &Receiver<Event>,
    running: &AtomicBool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut cancel_sent = false;
    loop {
        if !running.load(Ordering::SeqCst) && !cancel_sent {
            session.cancel_scan()?;
            cancel_sent = true;
        }
        let event = match events.recv_timeout(Duration::from_millis(200)) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return Err("session ended before the scan finished".into()),
        };
        match event {
            Event::ScanProgress(p) => {
                log::debug!("step {}/{} at {:.3} MHz", p.index + 1, p.total, p.frequency / 1e6)
            }
            Event::ScanFinished { results, outcome } => {
                println!("\nScan {:?}: {} signal(s)", outcome, results.len());
                println!("{:>14}  {:>8}  {:>10}  {}", "MHz", "dB", "BW kHz", "class");
                for r in &results {
                    println!(
                        "{:>14.6}  {:>8.1}  {:>10.1}  {}",
                        r.frequency / 1e6,
                        r.power_db,
                        r.bandwidth_hz / 1e3,
                        r.class
                    );
                }
                return Ok(());
            }
            other => report(&other, true),
        }
    }
}

fn report(event: &Event, verbose: bool) {
    match event {
        Event::RecordingStarted { kind, path } => println!("Recording {:?} to {}", kind, path.display()),
        Event::RecordingStopped { kind, path } => println!("Saved {:?} recording: {}", kind, path.display()),
        Event::RecordingFailed { kind, reason } => eprintln!("{:?} recording failed: {}", kind, reason),
        Event::DeviceFailed(reason) => eprintln!("Device error: {}", reason),
        Event::PlaybackUnavailable(reason) => eprintln!("No playback: {}", reason),
        Event::ExportStateChanged(state) if verbose => println!("Export {:?}", state),
        _ => {}
    }
}

fn print_status(session: &Session) {
    let demod = session.demod_status();
    let Some(frame) = session.latest_spectrum() else {
        return;
    };
    let (bin, power) = frame.peak();
    println!(
        "peak {:.4} MHz {:.1} dB | {} gain {:.1} dB",
        frame.frequency_of(bin) / 1e6,
        power,
        demod.mode(),
        demod.gain_db()
    );
}
