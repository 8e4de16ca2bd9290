//! Encoder configuration.

use ash::vk;
use thiserror::Error;

use crate::gop::FrameType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    H264,
    H265,
    Av1,
}

impl Codec {
    pub fn name(self) -> &'static str {
        match self {
            Codec::H264 => "h264",
            Codec::H265 => "h265",
            Codec::Av1 => "av1",
        }
    }
}

impl std::str::FromStr for Codec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "h264" | "avc" => Ok(Codec::H264),
            "h265" | "hevc" => Ok(Codec::H265),
            "av1" => Ok(Codec::Av1),
            other => Err(ConfigError::UnknownCodec(other.to_owned())),
        }
    }
}

/// The rate control algorithm the hardware should run.
///
/// `EncoderDefault` defers to the implementation default, which on many
/// drivers behaves like `Disabled`; prefer an explicit mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateControl {
    /// Constant-QP encoding using the configured per-type QP values.
    Disabled,
    /// Whatever the driver picks.
    EncoderDefault,
    /// Constant bitrate; `max_bitrate` is pinned to `average_bitrate`.
    Cbr { average_bitrate: u64 },
    /// Variable bitrate around an average with a ceiling.
    Vbr {
        average_bitrate: u64,
        max_bitrate: u64,
    },
}

impl RateControl {
    pub fn to_vk(self) -> vk::VideoEncodeRateControlModeFlagsKHR {
        match self {
            RateControl::Disabled => vk::VideoEncodeRateControlModeFlagsKHR::DISABLED,
            RateControl::EncoderDefault => vk::VideoEncodeRateControlModeFlagsKHR::DEFAULT,
            RateControl::Cbr { .. } => vk::VideoEncodeRateControlModeFlagsKHR::CBR,
            RateControl::Vbr { .. } => vk::VideoEncodeRateControlModeFlagsKHR::VBR,
        }
    }

    /// (average, max, hrd) bitrates with the conventional derivations for
    /// missing values.
    pub fn derived_bitrates(self) -> Option<(u64, u64, u64)> {
        match self {
            RateControl::Cbr { average_bitrate } => {
                Some((average_bitrate, average_bitrate, average_bitrate))
            }
            RateControl::Vbr {
                average_bitrate,
                max_bitrate,
            } => {
                let max = if max_bitrate == 0 {
                    average_bitrate * 3
                } else {
                    max_bitrate
                };
                Some((average_bitrate, max, max))
            }
            _ => None,
        }
    }
}

/// Constant-QP values applied when rate control is disabled. For AV1 these
/// are q-indices (0..255) rather than H.26x QPs.
#[derive(Debug, Clone, Copy)]
pub struct ConstQp {
    pub qp_intra: u32,
    pub qp_inter_p: u32,
    pub qp_inter_b: u32,
}

impl ConstQp {
    pub fn for_type(&self, ty: FrameType) -> u32 {
        match ty {
            FrameType::B => self.qp_inter_b,
            FrameType::P => self.qp_inter_p,
            _ => self.qp_intra,
        }
    }
}

impl Default for ConstQp {
    fn default() -> Self {
        ConstQp {
            qp_intra: 26,
            qp_inter_p: 28,
            qp_inter_b: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TuningMode {
    #[default]
    Default,
    HighQuality,
    LowLatency,
    UltraLowLatency,
    Lossless,
}

impl TuningMode {
    pub fn to_vk(self) -> vk::VideoEncodeTuningModeKHR {
        match self {
            TuningMode::Default => vk::VideoEncodeTuningModeKHR::DEFAULT,
            TuningMode::HighQuality => vk::VideoEncodeTuningModeKHR::HIGH_QUALITY,
            TuningMode::LowLatency => vk::VideoEncodeTuningModeKHR::LOW_LATENCY,
            TuningMode::UltraLowLatency => vk::VideoEncodeTuningModeKHR::ULTRA_LOW_LATENCY,
            TuningMode::Lossless => vk::VideoEncodeTuningModeKHR::LOSSLESS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChromaSubsampling {
    Monochrome,
    Yuv420,
    Yuv422,
    Yuv444,
}

/// Source video geometry and sample layout (§ frame-source contract).
#[derive(Debug, Clone, Copy)]
pub struct InputFormat {
    pub width: u32,
    pub height: u32,
    pub bit_depth: u32,
    pub chroma: ChromaSubsampling,
}

impl InputFormat {
    pub fn vk_format(&self) -> Result<vk::Format, ConfigError> {
        match (self.chroma, self.bit_depth) {
            (ChromaSubsampling::Yuv420, 8) => Ok(vk::Format::G8_B8R8_2PLANE_420_UNORM),
            (ChromaSubsampling::Yuv420, 10) => {
                Ok(vk::Format::G10X6_B10X6R10X6_2PLANE_420_UNORM_3PACK16)
            }
            (ChromaSubsampling::Yuv420, 12) => {
                Ok(vk::Format::G12X4_B12X4R12X4_2PLANE_420_UNORM_3PACK16)
            }
            (ChromaSubsampling::Yuv422, 8) => Ok(vk::Format::G8_B8R8_2PLANE_422_UNORM),
            (ChromaSubsampling::Yuv444, 8) => Ok(vk::Format::G8_B8_R8_3PLANE_444_UNORM),
            _ => Err(ConfigError::UnsupportedFormat {
                chroma: self.chroma,
                bit_depth: self.bit_depth,
            }),
        }
    }

    /// Bytes of one whole frame in the source file.
    pub fn frame_size(&self) -> usize {
        let bytes_per_sample = self.bit_depth.div_ceil(8) as usize;
        let luma = self.width as usize * self.height as usize;
        let chroma = match self.chroma {
            ChromaSubsampling::Monochrome => 0,
            ChromaSubsampling::Yuv420 => luma / 2,
            ChromaSubsampling::Yuv422 => luma,
            ChromaSubsampling::Yuv444 => luma * 2,
        };
        (luma + chroma) * bytes_per_sample
    }
}

/// GOP structure parameters, consumed by [`crate::gop::GopStructure`].
#[derive(Debug, Clone)]
pub struct GopConfig {
    pub gop_frame_count: u8,
    /// 0 means a single IDR at the start of the stream.
    pub idr_period: u32,
    pub consecutive_b_frames: u8,
    pub temporal_layer_count: u8,
    pub closed_gop: bool,
    pub pre_idr_anchor_type: FrameType,
    pub last_frame_type: FrameType,
}

impl Default for GopConfig {
    fn default() -> Self {
        GopConfig {
            gop_frame_count: 16,
            idr_period: 60,
            consecutive_b_frames: 0,
            temporal_layer_count: 1,
            closed_gop: false,
            pre_idr_anchor_type: FrameType::P,
            last_frame_type: FrameType::P,
        }
    }
}

/// AV1 in-loop tool toggles. Each tool can run with the built-in per-type
/// defaults or with caller-provided parameters applied to every picture.
#[derive(Debug, Clone, Default)]
pub struct Av1Features {
    pub enable_tiles: bool,
    pub custom_tiles: Option<crate::encoder::av1::Av1TileInfo>,
    pub enable_quant: bool,
    pub custom_quant: Option<crate::encoder::av1::Av1Quantization>,
    pub enable_loop_filter: bool,
    pub custom_loop_filter: Option<crate::encoder::av1::Av1LoopFilter>,
    pub enable_cdef: bool,
    pub custom_cdef: Option<crate::encoder::av1::Av1Cdef>,
    pub enable_loop_restoration: bool,
    pub custom_loop_restoration: Option<crate::encoder::av1::Av1LoopRestoration>,
}

/// Per-block delta-QP / emphasis map fed alongside each frame.
#[derive(Debug, Clone)]
pub struct QpMapConfig {
    pub path: std::path::PathBuf,
    pub texel_width: u32,
    pub texel_height: u32,
}

#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub codec: Codec,
    pub input: InputFormat,

    pub encode_width: u32,
    pub encode_height: u32,
    pub encode_offset_x: u32,
    pub encode_offset_y: u32,
    pub max_width: u32,
    pub max_height: u32,

    pub start_frame: u64,
    /// 0 means "until the source runs out".
    pub num_frames: u64,

    pub gop: GopConfig,
    pub rate_control: RateControl,
    pub const_qp: ConstQp,
    pub min_qp: Option<i32>,
    pub max_qp: Option<i32>,
    pub frame_rate_numerator: u32,
    pub frame_rate_denominator: u32,

    pub quality_level: u32,
    pub tuning_mode: TuningMode,

    pub av1: Av1Features,
    pub qp_map: Option<QpMapConfig>,

    /// Round-robin submissions over all available encode queues.
    pub enable_hw_load_balancing: bool,

    pub num_input_images: usize,
    pub num_bitstream_buffers: usize,
    pub num_batches: usize,
    pub batch_size: usize,
}

impl EncoderConfig {
    pub fn new(codec: Codec, width: u32, height: u32) -> Self {
        EncoderConfig {
            codec,
            input: InputFormat {
                width,
                height,
                bit_depth: 8,
                chroma: ChromaSubsampling::Yuv420,
            },
            encode_width: width,
            encode_height: height,
            encode_offset_x: 0,
            encode_offset_y: 0,
            max_width: width,
            max_height: height,
            start_frame: 0,
            num_frames: 0,
            gop: GopConfig::default(),
            rate_control: RateControl::Disabled,
            const_qp: ConstQp::default(),
            min_qp: None,
            max_qp: None,
            frame_rate_numerator: 30,
            frame_rate_denominator: 1,
            quality_level: 0,
            tuning_mode: TuningMode::Default,
            av1: Av1Features::default(),
            qp_map: None,
            enable_hw_load_balancing: false,
            num_input_images: 4,
            num_bitstream_buffers: 8,
            num_batches: 2,
            batch_size: 8,
        }
    }

    pub fn coded_extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.encode_width,
            height: self.encode_height,
        }
    }

    pub fn max_coded_extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.max_width.max(self.encode_width),
            height: self.max_height.max(self.encode_height),
        }
    }

    /// DPB slots the session must provide for the configured GOP shape.
    pub fn max_dpb_slots(&self) -> usize {
        match self.codec {
            // Eight virtual buffers plus in-flight reconstructions.
            Codec::Av1 => crate::dpb::av1::NUM_REF_FRAMES + 2,
            _ => {
                let anchors = if self.gop.consecutive_b_frames > 0 { 3 } else { 2 };
                anchors + 2
            }
        }
    }

    /// Sized so load/record can run ahead of submit/assemble across the
    /// full B-run depth.
    pub fn frame_info_pool_size(&self) -> usize {
        self.num_input_images + 2 * self.gop.consecutive_b_frames as usize + 2
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.input.width == 0 || self.input.height == 0 {
            return Err(ConfigError::BadDimensions {
                width: self.input.width,
                height: self.input.height,
            });
        }
        if self.encode_width + self.encode_offset_x > self.input.width
            || self.encode_height + self.encode_offset_y > self.input.height
        {
            return Err(ConfigError::BadDimensions {
                width: self.encode_width + self.encode_offset_x,
                height: self.encode_height + self.encode_offset_y,
            });
        }
        if self.gop.gop_frame_count == 0 {
            return Err(ConfigError::BadGop("gop_frame_count must be at least 1"));
        }
        if self.gop.idr_period > 0 && u32::from(self.gop.gop_frame_count) > self.gop.idr_period {
            return Err(ConfigError::BadGop(
                "idr_period must cover at least one whole GOP",
            ));
        }
        if !matches!(
            self.gop.pre_idr_anchor_type,
            FrameType::P | FrameType::I
        ) {
            return Err(ConfigError::BadGop("pre-IDR anchor must be P or I"));
        }
        if let RateControl::Cbr { average_bitrate } = self.rate_control {
            if average_bitrate == 0 {
                return Err(ConfigError::BadBitrate);
            }
        }
        if let RateControl::Vbr {
            average_bitrate, ..
        } = self.rate_control
        {
            if average_bitrate == 0 {
                return Err(ConfigError::BadBitrate);
            }
        }
        if let (Some(min), Some(max)) = (self.min_qp, self.max_qp) {
            if min > max {
                return Err(ConfigError::BadQpRange { min, max });
            }
        }
        if self.frame_rate_numerator == 0 || self.frame_rate_denominator == 0 {
            return Err(ConfigError::BadFrameRate);
        }
        if self.num_input_images == 0 || self.num_bitstream_buffers == 0 || self.batch_size == 0 {
            return Err(ConfigError::BadPoolSizing);
        }
        // A full B-run plus its anchor must fit in the input pool or the
        // pipeline deadlocks waiting on itself.
        if self.num_input_images <= self.gop.consecutive_b_frames as usize {
            return Err(ConfigError::BadPoolSizing);
        }
        self.input.vk_format().map(|_| ())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown codec {0:?}")]
    UnknownCodec(String),
    #[error("invalid dimensions {width}x{height}")]
    BadDimensions { width: u32, height: u32 },
    #[error("invalid GOP structure: {0}")]
    BadGop(&'static str),
    #[error("bitrate-based rate control requires a nonzero average bitrate")]
    BadBitrate,
    #[error("invalid QP clamp range {min}..{max}")]
    BadQpRange { min: i32, max: i32 },
    #[error("frame rate must be nonzero")]
    BadFrameRate,
    #[error("pool sizes must be nonzero")]
    BadPoolSizing,
    #[error("unsupported input format: {chroma:?} at {bit_depth} bpp")]
    UnsupportedFormat {
        chroma: ChromaSubsampling,
        bit_depth: u32,
    },
}
