//! Encode a raw planar YUV file into Annex-B / IVF output.
//!
//! Runs the full pipeline against the mock driver, which stands in for a
//! real `EncodeDriver` backend; device and queue discovery live outside
//! this crate.

use std::fs::File;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use vk_encoder::driver::mock::MockDriver;
use vk_encoder::source::{FrameSource, YuvFileSource};
use vk_encoder::{Codec, EncoderConfig, RateControl, VideoEncoder};

#[derive(Parser)]
#[command(about = "Encode a raw YUV file with the Vulkan Video pipeline")]
struct Args {
    /// Input file with planar 4:2:0 frames.
    input: PathBuf,
    /// Output bitstream (Annex-B for H.26x, IVF for AV1).
    output: PathBuf,

    #[arg(long, default_value = "h264")]
    codec: Codec,
    #[arg(long)]
    width: u32,
    #[arg(long)]
    height: u32,

    #[arg(long, default_value_t = 16)]
    gop_frame_count: u8,
    #[arg(long, default_value_t = 60)]
    idr_period: u32,
    #[arg(long, default_value_t = 0)]
    b_frames: u8,
    #[arg(long)]
    closed_gop: bool,

    /// Average bitrate in bits per second; constant QP when absent.
    #[arg(long)]
    bitrate: Option<u64>,
    #[arg(long, default_value_t = 30)]
    fps: u32,
    /// Encode at most this many frames.
    #[arg(long)]
    frames: Option<u64>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().init();

    let args = Args::parse();

    let mut config = EncoderConfig::new(args.codec, args.width, args.height);
    config.gop.gop_frame_count = args.gop_frame_count;
    config.gop.idr_period = args.idr_period;
    config.gop.consecutive_b_frames = args.b_frames;
    config.gop.closed_gop = args.closed_gop;
    config.frame_rate_numerator = args.fps;
    if let Some(bitrate) = args.bitrate {
        config.rate_control = RateControl::Vbr {
            average_bitrate: bitrate,
            max_bitrate: 0,
        };
    }

    let mut source = YuvFileSource::open(&args.input, config.input)
        .with_context(|| format!("opening {}", args.input.display()))?;
    let num_frames = args
        .frames
        .map_or(source.frame_count(), |n| n.min(source.frame_count()));
    config.num_frames = num_frames;

    let output = File::create(&args.output)
        .with_context(|| format!("creating {}", args.output.display()))?;

    let mut encoder = VideoEncoder::new(MockDriver::new(), config, output)?;
    for i in 0..num_frames {
        let frame = source.load_frame(i)?;
        encoder.encode_frame(&frame)?;
    }
    let (_driver, _file, stats) = encoder.finish()?;

    eprintln!(
        "encoded {} frames ({} emitted, {} corrupted, {} bytes)",
        stats.frames_in, stats.frames_out, stats.corrupted_frames, stats.bytes_written
    );
    Ok(())
}
