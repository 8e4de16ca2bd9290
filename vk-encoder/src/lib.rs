#![doc = include_str!("../README.md")]

pub mod bitstream;
pub mod config;
pub mod dpb;
pub mod driver;
pub mod encoder;
pub mod gop;
pub mod pool;
pub mod source;

pub use config::{Codec, EncoderConfig, RateControl, TuningMode};
pub use encoder::{EncodeError, EncodeStats, VideoEncoder};
pub use gop::{FrameType, GopPosition, GopState, GopStructure};
pub use source::{FrameSource, RawFrame, YuvFileSource};
