use std::io::{self, BufReader, Read};
use std::net::TcpStream;
use std::str::FromStr;
use std::time::Duration;

use super::{IqSample, SampleBlock, SampleSource, SourceState, Tuning};
use crate::error::{DeviceError, DeviceResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFormat {
    Int8,
    Int16,
    Int32,
    Float32,
}

impl StreamFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            StreamFormat::Int8 => 2,    // I + Q = 2 bytes
            StreamFormat::Int16 => 4,   // I + Q = 4 bytes
            StreamFormat::Int32 => 8,   // I + Q = 8 bytes
            StreamFormat::Float32 => 8, // I + Q = 8 bytes
        }
    }

    /// Decode interleaved little-endian I/Q bytes into samples.
    pub fn decode(&self, buffer: &[u8]) -> Vec<IqSample> {
        match self {
            StreamFormat::Int8 => buffer
                .chunks_exact(2)
                .map(|chunk| {
                    let i = (chunk[0] as i8) as f32 / 128.0;
                    let q = (chunk[1] as i8) as f32 / 128.0;
                    IqSample::new(i, q)
                })
                .collect(),
            StreamFormat::Int16 => buffer
                .chunks_exact(4)
                .map(|chunk| {
                    let i = i16::from_le_bytes([chunk[0], chunk[1]]) as f32 / 32768.0;
                    let q = i16::from_le_bytes([chunk[2], chunk[3]]) as f32 / 32768.0;
                    IqSample::new(i, q)
                })
                .collect(),
            StreamFormat::Int32 => buffer
                .chunks_exact(8)
                .map(|chunk| {
                    let i = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f32 / 2147483648.0;
                    let q = i32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]) as f32 / 2147483648.0;
                    IqSample::new(i, q)
                })
                .collect(),
            StreamFormat::Float32 => buffer
                .chunks_exact(8)
                .map(|chunk| {
                    let i = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    let q = f32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]);
                    IqSample::new(i, q)
                })
                .collect(),
        }
    }
}

impl FromStr for StreamFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "int8" => Ok(StreamFormat::Int8),
            "int16" => Ok(StreamFormat::Int16),
            "int32" => Ok(StreamFormat::Int32),
            "float32" => Ok(StreamFormat::Float32),
            other => Err(format!("invalid format '{}'. Use: int8, int16, int32, float32", other)),
        }
    }
}

/// Connect to an SDR++ IQ exporter (network sink) via TCP
///
/// The remote end decides frequency and rate; `configure` only accepts the
/// rate the stream was announced with and keeps the center frequency as a label.
pub struct TcpSource {
    reader: BufReader<Box<dyn Read + Send>>,
    format: StreamFormat,
    stream_rate: u32,
    block_len: usize,
    timeout_ms: u64,
    /// Bytes of the block in progress; survives a timed-out read so the
    /// stream keeps its sample alignment
    partial: Vec<u8>,
    state: SourceState,
    addr: String,
}

impl TcpSource {
    pub fn connect(
        addr: &str,
        format: StreamFormat,
        stream_rate: u32,
        block_len: usize,
        timeout: Duration,
    ) -> DeviceResult<Self> {
        let stream = TcpStream::connect(addr)
            .map_err(|e| DeviceError::Disconnected(format!("{}: {}", addr, e)))?;
        stream.set_read_timeout(Some(timeout))?;
        log::info!("Connected to IQ stream at {} ({:?}, {} Hz)", addr, format, stream_rate);
        let mut source = Self::from_reader(Box::new(stream), format, stream_rate, block_len);
        source.timeout_ms = timeout.as_millis() as u64;
        source.addr = addr.to_string();
        Ok(source)
    }

    /// Wrap any byte stream carrying interleaved IQ.
    pub fn from_reader(
        reader: Box<dyn Read + Send>,
        format: StreamFormat,
        stream_rate: u32,
        block_len: usize,
    ) -> Self {
        Self {
            reader: BufReader::new(reader),
            format,
            stream_rate,
            block_len: block_len.max(1),
            timeout_ms: 0,
            partial: Vec::new(),
            state: SourceState::default(),
            addr: String::from("<reader>"),
        }
    }
}

impl SampleSource for TcpSource {
    fn configure(&mut self, tuning: &Tuning) -> DeviceResult<()> {
        tuning.validate()?;
        if tuning.sample_rate != self.stream_rate {
            return Err(self.state.fail(DeviceError::Unsupported(format!(
                "stream runs at {} Hz, requested {} Hz",
                self.stream_rate, tuning.sample_rate
            ))));
        }
        self.state.accept(tuning);
        Ok(())
    }

    fn read_block(&mut self) -> DeviceResult<SampleBlock> {
        let tuning = self.state.ready()?;
        let want = self.block_len * self.format.bytes_per_sample();
        let mut chunk = [0u8; 8192];

        while self.partial.len() < want {
            let room = (want - self.partial.len()).min(chunk.len());
            match self.reader.read(&mut chunk[..room]) {
                Ok(0) => {
                    let eof = io::Error::from(io::ErrorKind::UnexpectedEof);
                    return Err(self.state.fail(DeviceError::from_read(eof, self.timeout_ms)));
                }
                Ok(n) => self.partial.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(self.state.fail(DeviceError::from_read(e, self.timeout_ms))),
            }
        }

        let samples = self.format.decode(&self.partial);
        self.partial.clear();
        Ok(SampleBlock::new(samples, &tuning))
    }

    fn block_len(&self) -> usize {
        self.block_len
    }

    fn tuning(&self) -> Option<Tuning> {
        self.state.tuning()
    }

    fn describe(&self) -> String {
        format!("IQ stream {} ({:?})", self.addr, self.format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn tuning(rate: u32) -> Tuning {
        Tuning {
            sample_rate: rate,
            ..Tuning::default()
        }
    }

    #[test]
    fn decodes_int16_pairs() {
        let bytes = [0x00, 0x40, 0x00, 0xC0];
        let samples = StreamFormat::Int16.decode(&bytes);
        assert_eq!(samples.len(), 1);
        assert!((samples[0].re - 0.5).abs() < 1e-6);
        assert!((samples[0].im + 0.5).abs() < 1e-6);
    }

    #[test]
    fn parses_format_names() {
        assert_eq!("FLOAT32".parse::<StreamFormat>(), Ok(StreamFormat::Float32));
        assert!("complex64".parse::<StreamFormat>().is_err());
    }

    #[test]
    fn eof_marks_source_disconnected() {
        let bytes: Vec<u8> = std::iter::repeat(0x40).take(32).collect();
        let mut src = TcpSource::from_reader(Box::new(Cursor::new(bytes)), StreamFormat::Int8, 48_000, 8);
        src.configure(&tuning(48_000)).unwrap();
        let block = src.read_block().unwrap();
        assert_eq!(block.len(), 8);
        assert!((block.samples[0].re - 0.5).abs() < 1e-6);
        src.read_block().unwrap();
        assert!(matches!(src.read_block(), Err(DeviceError::Disconnected(_))));
        assert!(matches!(src.read_block(), Err(DeviceError::Unusable)));
    }

    /// Replays a script of reads, one entry per call.
    struct Scripted(std::collections::VecDeque<io::Result<Vec<u8>>>);

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.pop_front() {
                Some(Ok(bytes)) => {
                    let n = bytes.len().min(buf.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    if n < bytes.len() {
                        self.0.push_front(Ok(bytes[n..].to_vec()));
                    }
                    Ok(n)
                }
                Some(Err(e)) => Err(e),
                None => Ok(0),
            }
        }
    }

    #[test]
    fn timeout_mid_sample_keeps_alignment() {
        // I = +0.5, Q = -0.5 as int16 LE, repeated
        let pair = [0x00u8, 0x40, 0x00, 0xC0];
        let stream: Vec<u8> = pair.iter().copied().cycle().take(4 * 16).collect();
        let script = vec![
            Ok(stream[..3].to_vec()),
            Err(io::Error::from(io::ErrorKind::TimedOut)),
            Ok(stream[3..].to_vec()),
        ];
        let reader = Scripted(script.into_iter().collect());
        let mut src = TcpSource::from_reader(Box::new(reader), StreamFormat::Int16, 48_000, 4);
        src.configure(&tuning(48_000)).unwrap();

        assert!(matches!(src.read_block(), Err(DeviceError::Timeout(_))));
        assert!(matches!(src.read_block(), Err(DeviceError::Unusable)));
        src.configure(&tuning(48_000)).unwrap();

        for _ in 0..4 {
            let block = src.read_block().unwrap();
            assert_eq!(block.len(), 4);
            for s in &block.samples {
                assert!((s.re - 0.5).abs() < 1e-6 && (s.im + 0.5).abs() < 1e-6, "{:?}", s);
            }
        }
    }
}
