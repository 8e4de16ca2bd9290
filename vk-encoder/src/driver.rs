//! Hardware driver surface.
//!
//! The encoder core records codec-agnostic submission descriptors; a driver
//! implementation translates them into `vkCmdBeginVideoCodingKHR` /
//! `vkCmdEncodeVideoKHR` chains and owns every device object behind the
//! opaque ids handed out here. [`mock::MockDriver`] implements the same
//! surface without hardware for tests and bring-up.

use ash::vk;
use bytes::Bytes;
use thiserror::Error;

use crate::config::{Codec, TuningMode};
use crate::encoder::av1::{Av1EncodeInfo, Av1ReferenceInfo, Av1SequenceHeader};
use crate::encoder::h264::H264EncodeInfo;
use crate::encoder::h265::H265EncodeInfo;

pub mod mock;

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);
    };
}

id_type!(
    /// A `VkVideoSessionKHR` owned by the driver.
    VideoSessionId
);
id_type!(
    /// A `VkVideoSessionParametersKHR` owned by the driver.
    SessionParametersId
);
id_type!(
    /// A recorded command buffer.
    CommandBufferId
);
id_type!(
    /// A fence signaled on submission completion.
    FenceId
);
id_type!(
    /// A `VkBuffer` with host-visible backing.
    BufferId
);
id_type!(
    /// A `VkImageView` over a coded picture.
    ImageViewId
);

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("vulkan call failed: {0:?}")]
    Vk(vk::Result),
    #[error("encode queue is full")]
    QueueFull,
    #[error("unknown driver object id")]
    InvalidId,
    #[error("{0}")]
    Backend(String),
}

/// One bindable picture: an image view plus the coded rectangle inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PictureResource {
    pub image_view: ImageViewId,
    pub coded_offset: vk::Offset2D,
    pub coded_extent: vk::Extent2D,
    pub base_array_layer: u32,
}

/// Codec-specific std reference info bound to a DPB slot.
#[derive(Debug, Clone, Copy)]
pub enum CodecReferenceInfo {
    H264(vk::native::StdVideoEncodeH264ReferenceInfo),
    H265(vk::native::StdVideoEncodeH265ReferenceInfo),
    Av1(Av1ReferenceInfo),
}

/// A DPB slot binding. `slot_index` is -1 for the inactive placeholder
/// required at the head of the begin-coding array.
#[derive(Debug, Clone)]
pub struct ReferenceSlot {
    pub slot_index: i32,
    pub resource: PictureResource,
    pub std_info: Option<CodecReferenceInfo>,
}

/// Codec headers used to create the session parameters object.
#[derive(Debug, Clone)]
pub enum CodecHeaders {
    H264 {
        sps: vk::native::StdVideoH264SequenceParameterSet,
        pps: vk::native::StdVideoH264PictureParameterSet,
    },
    H265 {
        sps: vk::native::StdVideoH265SequenceParameterSet,
        pps: vk::native::StdVideoH265PictureParameterSet,
    },
    Av1 {
        sequence_header: Av1SequenceHeader,
    },
}

impl CodecHeaders {
    pub fn codec(&self) -> Codec {
        match self {
            CodecHeaders::H264 { .. } => Codec::H264,
            CodecHeaders::H265 { .. } => Codec::H265,
            CodecHeaders::Av1 { .. } => Codec::Av1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SessionCreateInfo {
    pub codec: Codec,
    pub max_coded_extent: vk::Extent2D,
    pub picture_format: vk::Format,
    pub reference_picture_format: vk::Format,
    pub max_dpb_slots: u32,
    pub max_active_references: u32,
    pub tuning_mode: TuningMode,
}

/// Flattened rate-control state attached to begin/control commands.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateControlState {
    pub mode: vk::VideoEncodeRateControlModeFlagsKHR,
    pub average_bitrate: u64,
    pub max_bitrate: u64,
    pub virtual_buffer_size_ms: u32,
    pub initial_virtual_buffer_size_ms: u32,
    pub frame_rate_numerator: u32,
    pub frame_rate_denominator: u32,
    pub gop_frame_count: u32,
    pub idr_period: u32,
    pub consecutive_b_frame_count: u32,
    pub temporal_layer_count: u32,
    pub min_qp: Option<i32>,
    pub max_qp: Option<i32>,
    pub quality_level: u32,
}

/// `vkCmdControlVideoCodingKHR` payloads.
#[derive(Debug, Clone)]
pub enum CodingControl {
    Reset,
    RateControl(RateControlState),
    QualityLevel(u32),
}

/// Everything `vkCmdBeginVideoCodingKHR` needs.
#[derive(Debug, Clone)]
pub struct BeginCodingInfo {
    pub session: VideoSessionId,
    pub parameters: SessionParametersId,
    pub reference_slots: Vec<ReferenceSlot>,
    pub rate_control: Option<RateControlState>,
}

/// Codec-specific picture info attached to the encode command.
#[derive(Debug, Clone)]
pub enum CodecEncodeInfo {
    H264(H264EncodeInfo),
    H265(H265EncodeInfo),
    Av1(Box<Av1EncodeInfo>),
}

/// The complete per-picture submission descriptor produced by the
/// per-frame assembler.
#[derive(Debug, Clone)]
pub struct EncodeInfo {
    pub src_picture_resource: PictureResource,
    /// Reconstruction slot; `None` for non-reference pictures.
    pub setup_reference_slot: Option<ReferenceSlot>,
    /// Active references, excluding the setup placeholder.
    pub reference_slots: Vec<ReferenceSlot>,
    pub dst_buffer: BufferId,
    pub dst_buffer_offset: u64,
    pub dst_buffer_range: u64,
    pub query_slot: u32,
    pub codec: CodecEncodeInfo,
}

#[derive(Debug, Clone, Copy)]
pub struct QueueSubmission<'a> {
    pub command_buffers: &'a [CommandBufferId],
    /// Timeline value to wait for (compute pre-processing hand-off).
    pub wait_semaphore_value: Option<u64>,
    pub signal_semaphore_value: Option<u64>,
    pub fence: Option<FenceId>,
    /// Encode queue index, for round-robin hardware load balancing.
    pub queue_index: u32,
}

/// Video-encode-feedback query readback, one slot per in-flight frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryResult {
    pub bitstream_start_offset: u32,
    pub bitstream_size: u32,
    pub status: vk::QueryResultStatusKHR,
}

/// Raw layout of the feedback readback, for casting mapped query memory.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct EncodeFeedback {
    pub offset: u32,
    pub bytes_written: u32,
    pub status_raw: i32,
}

impl EncodeFeedback {
    pub fn to_result(self) -> QueryResult {
        QueryResult {
            bitstream_start_offset: self.offset,
            bitstream_size: self.bytes_written,
            status: vk::QueryResultStatusKHR::from_raw(self.status_raw),
        }
    }
}

/// The five-operation hardware contract, plus the resource factories the
/// pools are filled from.
pub trait EncodeDriver {
    fn create_video_session(
        &mut self,
        info: &SessionCreateInfo,
    ) -> Result<VideoSessionId, DriverError>;

    /// A session reset drops all hardware reference state; used on the
    /// recovery path before the next IDR.
    fn reset_video_session(&mut self, session: VideoSessionId) -> Result<(), DriverError>;

    fn create_session_parameters(
        &mut self,
        session: VideoSessionId,
        headers: &CodecHeaders,
        quality_level: u32,
    ) -> Result<SessionParametersId, DriverError>;

    /// Non-VCL header prelude (SPS/PPS or sequence header OBU) as encoded
    /// by the implementation.
    fn get_encoded_parameters(
        &mut self,
        parameters: SessionParametersId,
        sps_id: u8,
        pps_id: u8,
    ) -> Result<Bytes, DriverError>;

    fn create_images(
        &mut self,
        count: u32,
        format: vk::Format,
        extent: vk::Extent2D,
        usage: vk::ImageUsageFlags,
    ) -> Result<Vec<PictureResource>, DriverError>;

    fn create_bitstream_buffer(&mut self, size: u64) -> Result<BufferId, DriverError>;

    fn create_fence(&mut self) -> Result<FenceId, DriverError>;

    /// Copy one raw frame's planes into an input image.
    fn upload_frame(
        &mut self,
        target: &PictureResource,
        planes: &[&[u8]],
        strides: &[u32],
    ) -> Result<(), DriverError>;

    fn begin_command_buffer(&mut self) -> Result<CommandBufferId, DriverError>;
    fn end_command_buffer(&mut self, cmd: CommandBufferId) -> Result<(), DriverError>;

    fn cmd_pipeline_barrier(
        &mut self,
        cmd: CommandBufferId,
        image_view: ImageViewId,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) -> Result<(), DriverError>;

    fn cmd_begin_video_coding(
        &mut self,
        cmd: CommandBufferId,
        info: &BeginCodingInfo,
    ) -> Result<(), DriverError>;

    fn cmd_control_video_coding(
        &mut self,
        cmd: CommandBufferId,
        control: &CodingControl,
    ) -> Result<(), DriverError>;

    fn cmd_encode_video(
        &mut self,
        cmd: CommandBufferId,
        info: &EncodeInfo,
    ) -> Result<(), DriverError>;

    fn cmd_end_video_coding(&mut self, cmd: CommandBufferId) -> Result<(), DriverError>;

    fn submit(&mut self, submission: &QueueSubmission<'_>) -> Result<(), DriverError>;

    /// Number of hardware encode queues available for load balancing.
    fn encode_queue_count(&self) -> u32 {
        1
    }

    /// Returns whether the fence signaled within the timeout.
    fn wait_fence(&mut self, fence: FenceId, timeout_ns: u64) -> Result<bool, DriverError>;
    fn reset_fence(&mut self, fence: FenceId) -> Result<(), DriverError>;

    fn query_results(&mut self, query_slot: u32) -> Result<QueryResult, DriverError>;

    /// Read back encoded bytes from a host-visible bitstream buffer.
    fn read_bitstream(
        &mut self,
        buffer: BufferId,
        offset: u64,
        size: u64,
    ) -> Result<Bytes, DriverError>;

    /// Block until all submitted work completed (abort path).
    fn wait_idle(&mut self) -> Result<(), DriverError>;
}
