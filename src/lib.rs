//! Real-time IQ analysis: spectrum, demodulation, audio delivery and
//! frequency scanning over a pluggable sample source.

pub mod audio;
pub mod config;
pub mod demod;
pub mod error;
pub mod input;
pub mod output;
pub mod scanner;
pub mod session;
pub mod spectrum;

pub use config::SessionConfig;
pub use demod::{DemodMode, DemodulatorChain};
pub use error::{DeviceError, PlaybackError, RecordError, SessionError};
pub use input::{IqSample, SampleBlock, SampleSource, Tuning};
pub use scanner::{ScanParams, ScanResult, Scanner, SignalClass};
pub use session::{Command, Event, RecordKind, ScanOutcome, Session};
pub use spectrum::{SpectrumEngine, SpectrumFrame};
