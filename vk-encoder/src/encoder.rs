//! The staged encode pipeline.
//!
//! A single producer thread advances pictures through LoadFrame →
//! ProcessDpb → RecordCmdBuffer → SubmitToQueue → AssembleBitstream while
//! the hardware runs asynchronously. B pictures are held until their
//! forward anchor arrives, then the whole run is processed in encode order;
//! the assemble stage re-emits output in display order for AV1 (including
//! synthesized show_existing_frame records) and encode order for H.26x.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;

use ash::vk;
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::bitstream::{AnnexBWriter, IvfConfig, IvfWriter};
use crate::config::{Codec, ConfigError, EncoderConfig, RateControl};
use crate::dpb::DpbError;
use crate::dpb::av1::Av1ReferenceCaps;
use crate::driver::{
    BeginCodingInfo, CodingControl, DriverError, EncodeDriver, QueueSubmission,
    RateControlState, ReferenceSlot, SessionCreateInfo, SessionParametersId, VideoSessionId,
};
use crate::gop::{FrameType, GopState, GopStructure};
use crate::pool::{BitstreamBuffer, BitstreamBufferPool, ImagePool};
use crate::source::RawFrame;

pub mod av1;
pub mod frame;
pub mod h264;
pub mod h265;

use av1::Av1State;
use frame::{FrameInfo, FrameInfoPool, FrameState};
use h264::H264State;
use h265::H265State;

const FENCE_TIMEOUT_NS: u64 = 100_000_000;
const FENCE_RETRIES: u32 = 5;
const MIN_BITSTREAM_BUFFER_SIZE: u64 = 2 << 20;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Dpb(#[from] DpbError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0} pool exhausted with nothing left to drain")]
    PoolExhausted(&'static str),
    #[error("picture has no input image bound")]
    MissingInput,
    #[error("reference slot {0} has no backing image")]
    MissingReference(usize),
    #[error("encoder was cancelled")]
    Cancelled,
}

/// A generation of session parameters. Old generations stay alive while
/// any in-flight picture still borrows them.
#[derive(Debug)]
pub struct SessionParams {
    pub id: SessionParametersId,
    pub generation: u32,
}

#[derive(Debug)]
enum CodecState {
    H264(H264State),
    H265(H265State),
    Av1(Av1State),
}

impl CodecState {
    fn new(config: &EncoderConfig) -> Result<Self, EncodeError> {
        Ok(match config.codec {
            Codec::H264 => CodecState::H264(H264State::new(config)?),
            Codec::H265 => CodecState::H265(H265State::new(config)?),
            Codec::Av1 => CodecState::Av1(Av1State::new(config, &Av1ReferenceCaps::default())?),
        })
    }

    fn headers(&self) -> crate::driver::CodecHeaders {
        match self {
            CodecState::H264(s) => s.headers(),
            CodecState::H265(s) => s.headers(),
            CodecState::Av1(s) => s.headers(),
        }
    }

    fn process_dpb(
        &mut self,
        frame: &mut FrameInfo,
        config: &EncoderConfig,
        dpb_images: &ImagePool,
    ) -> Result<(), EncodeError> {
        match self {
            CodecState::H264(s) => s.process_dpb(frame, config, dpb_images),
            CodecState::H265(s) => s.process_dpb(frame, config, dpb_images),
            CodecState::Av1(s) => s.process_dpb(frame, config, dpb_images),
        }
    }

    /// Flag references admitted at or after `timestamp` as corrupted.
    fn invalidate_references(&mut self, timestamp: u64) {
        match self {
            CodecState::H264(s) => s.invalidate_references(timestamp),
            CodecState::H265(s) => s.invalidate_references(timestamp),
            CodecState::Av1(s) => s.dpb.invalidate_references(timestamp),
        }
    }
}

enum OutputSink<W: Write> {
    AnnexB(AnnexBWriter<W>),
    Ivf {
        writer: IvfWriter<W>,
        /// Payloads of unshown frames, flushed with the next shown frame.
        pending: Vec<Bytes>,
    },
}

/// Counters reported when the pipeline finishes.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncodeStats {
    pub frames_in: u64,
    pub frames_out: u64,
    pub corrupted_frames: u64,
    pub bytes_written: u64,
}

pub struct VideoEncoder<D: EncodeDriver, W: Write> {
    config: EncoderConfig,
    driver: D,

    gop: GopStructure,
    gop_state: GopState,
    codec: CodecState,

    session: VideoSessionId,
    session_params: Arc<SessionParams>,
    rate_control: Option<RateControlState>,
    rate_control_pending: bool,

    frame_infos: FrameInfoPool,
    input_images: ImagePool,
    dpb_images: ImagePool,
    bitstream_buffers: BitstreamBufferPool,

    output: OutputSink<W>,

    input_counter: u64,
    num_frames: u64,
    timeline_counter: u64,
    next_queue_index: u32,

    /// Loaded B pictures waiting for their forward anchor.
    pending_bs: Vec<FrameInfo>,
    /// Recorded chains not yet handed to the hardware.
    recorded: Vec<FrameInfo>,
    recorded_count: usize,
    /// Submitted batches awaiting assembly, oldest first.
    submitted: VecDeque<Vec<FrameInfo>>,

    force_idr: bool,
    cancelled: bool,
    stats: EncodeStats,
}

impl<D: EncodeDriver, W: Write> VideoEncoder<D, W> {
    pub fn new(mut driver: D, config: EncoderConfig, output: W) -> Result<Self, EncodeError> {
        config.validate()?;

        let codec = CodecState::new(&config)?;

        let session = driver.create_video_session(&SessionCreateInfo {
            codec: config.codec,
            max_coded_extent: config.max_coded_extent(),
            picture_format: config.input.vk_format()?,
            reference_picture_format: config.input.vk_format()?,
            max_dpb_slots: config.max_dpb_slots() as u32,
            max_active_references: config.max_dpb_slots() as u32 - 1,
            tuning_mode: config.tuning_mode,
        })?;
        let params_id =
            driver.create_session_parameters(session, &codec.headers(), config.quality_level)?;

        let input_images = ImagePool::new(driver.create_images(
            config.num_input_images as u32,
            config.input.vk_format()?,
            config.coded_extent(),
            vk::ImageUsageFlags::VIDEO_ENCODE_SRC_KHR | vk::ImageUsageFlags::TRANSFER_DST,
        )?);
        let dpb_images = ImagePool::new(driver.create_images(
            config.max_dpb_slots() as u32 + 1,
            config.input.vk_format()?,
            config.coded_extent(),
            vk::ImageUsageFlags::VIDEO_ENCODE_DPB_KHR,
        )?);

        let buffer_size =
            BitstreamBufferPool::buffer_size(config.coded_extent(), MIN_BITSTREAM_BUFFER_SIZE);
        let mut buffers = Vec::with_capacity(config.num_bitstream_buffers);
        for _ in 0..config.num_bitstream_buffers {
            buffers.push(BitstreamBuffer {
                buffer: driver.create_bitstream_buffer(buffer_size)?,
                size: buffer_size,
                fence: driver.create_fence()?,
            });
        }
        let bitstream_buffers = BitstreamBufferPool::new(buffers);

        let frame_infos = FrameInfoPool::new(config.frame_info_pool_size());

        let output = match config.codec {
            Codec::Av1 => OutputSink::Ivf {
                writer: IvfWriter::new(
                    output,
                    IvfConfig {
                        width: config.encode_width as u16,
                        height: config.encode_height as u16,
                        frame_rate_numerator: config.frame_rate_numerator,
                        frame_rate_denominator: config.frame_rate_denominator,
                        frame_count: config.num_frames as u32,
                    },
                ),
                pending: Vec::new(),
            },
            _ => OutputSink::AnnexB(AnnexBWriter::new(output)),
        };

        let mut gop = GopStructure::new(
            config.gop.gop_frame_count,
            config.gop.idr_period,
            config.gop.consecutive_b_frames,
            config.gop.temporal_layer_count,
            config.gop.last_frame_type,
            config.gop.pre_idr_anchor_type,
            config.gop.closed_gop,
        );
        if config.num_frames > 0 {
            gop.clamp_to_stream_length(config.num_frames);
        }

        let rate_control = Self::build_rate_control(&config);

        Ok(VideoEncoder {
            num_frames: config.num_frames,
            gop,
            gop_state: GopState::default(),
            codec,
            session,
            session_params: Arc::new(SessionParams {
                id: params_id,
                generation: 0,
            }),
            rate_control,
            rate_control_pending: true,
            frame_infos,
            input_images,
            dpb_images,
            bitstream_buffers,
            output,
            input_counter: 0,
            timeline_counter: 0,
            next_queue_index: 0,
            pending_bs: Vec::new(),
            recorded: Vec::new(),
            recorded_count: 0,
            submitted: VecDeque::new(),
            force_idr: false,
            cancelled: false,
            stats: EncodeStats::default(),
            config,
            driver,
        })
    }

    fn build_rate_control(config: &EncoderConfig) -> Option<RateControlState> {
        let (average, max) = match config.rate_control.derived_bitrates() {
            Some((average, max, _hrd)) => (average, max),
            None if config.rate_control == RateControl::EncoderDefault => return None,
            None => (0, 0),
        };
        Some(RateControlState {
            mode: config.rate_control.to_vk(),
            average_bitrate: average,
            max_bitrate: max,
            virtual_buffer_size_ms: 1000,
            initial_virtual_buffer_size_ms: 0,
            frame_rate_numerator: config.frame_rate_numerator,
            frame_rate_denominator: config.frame_rate_denominator,
            gop_frame_count: u32::from(config.gop.gop_frame_count),
            idr_period: if config.gop.idr_period > 0 {
                config.gop.idr_period
            } else {
                u32::from(config.gop.gop_frame_count)
            },
            consecutive_b_frame_count: u32::from(config.gop.consecutive_b_frames),
            temporal_layer_count: u32::from(config.gop.temporal_layer_count),
            min_qp: config.min_qp,
            max_qp: config.max_qp,
            quality_level: config.quality_level,
        })
    }

    pub fn stats(&self) -> EncodeStats {
        self.stats
    }

    /// Stop accepting input. In-flight pictures still drain on `finish`.
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    /// Push the next frame in input order through the pipeline.
    pub fn encode_frame(&mut self, raw: &RawFrame) -> Result<(), EncodeError> {
        if self.cancelled {
            return Err(EncodeError::Cancelled);
        }

        if self.force_idr {
            // Drop the broken prediction chain; the next picture opens a
            // fresh IDR sequence against a reset session and a new
            // parameters generation. The old generation stays alive while
            // in-flight pictures still borrow it.
            self.driver.reset_video_session(self.session)?;
            let params_id = self.driver.create_session_parameters(
                self.session,
                &self.codec.headers(),
                self.config.quality_level,
            )?;
            self.session_params = Arc::new(SessionParams {
                id: params_id,
                generation: self.session_params.generation + 1,
            });
            self.gop_state = GopState::default();
            self.rate_control_pending = true;
            self.force_idr = false;
        }

        let frames_left = if self.num_frames > 0 {
            (self.num_frames.saturating_sub(self.input_counter))
                .clamp(1, u64::from(u32::MAX)) as u32
        } else {
            u32::MAX
        };
        let (pos, is_idr) = self.gop.position(&mut self.gop_state, frames_left);

        let mut frame = self.acquire_frame_info()?;
        frame.state = FrameState::Loaded;
        frame.gop = pos;
        frame.is_idr = is_idr;
        frame.is_reference = pos.is_reference();
        frame.input_order_num = self.input_counter;
        frame.timestamp = raw.timestamp;
        frame.last_frame = self.num_frames > 0 && self.input_counter + 1 == self.num_frames;
        frame.session_params = Some(self.session_params.clone());
        self.input_counter += 1;
        self.stats.frames_in += 1;

        match &mut self.codec {
            CodecState::Av1(s) => s.on_frame_loaded(&mut frame),
            _ => frame.pic_order_cnt = 2 * pos.input_order as i32,
        }

        let src = self.acquire_input_image()?;
        let planes: Vec<&[u8]> = raw.planes.iter().map(|p| p.as_ref()).collect();
        self.driver
            .upload_frame(&src.resource(), &planes, &raw.strides)?;
        frame.src_image = Some(src);

        let bitstream = self.acquire_bitstream()?;
        frame.fence = Some(bitstream.buffer().fence);
        frame.bitstream = Some(bitstream);

        if is_idr {
            frame.prelude = self.driver.get_encoded_parameters(
                self.session_params.id,
                0,
                0,
            )?;
        }

        if pos.picture_type == FrameType::B {
            // Deferred until the forward anchor arrives.
            self.pending_bs.push(frame);
            return Ok(());
        }

        self.enqueue_anchor(frame)
    }

    /// Chain the deferred B-run behind its anchor and run the whole chain
    /// through ProcessDpb + RecordCmd in encode order.
    fn enqueue_anchor(&mut self, mut anchor: FrameInfo) -> Result<(), EncodeError> {
        anchor.dependants = std::mem::take(&mut self.pending_bs);

        // A reordered AV1 anchor is coded unshown; a synthesized
        // show_existing_frame record displays it at its output position.
        if self.config.codec == Codec::Av1 && !anchor.dependants.is_empty() {
            let mut shown = self.acquire_frame_info()?;
            shown.state = FrameState::Loaded;
            shown.gop = anchor.gop;
            shown.is_idr = false;
            shown.is_reference = false;
            shown.input_order_num = anchor.input_order_num;
            shown.timestamp = anchor.timestamp;
            shown.pic_order_cnt = anchor.pic_order_cnt;
            shown.av1.show_existing_frame = true;
            shown.av1.overlay_frame = true;
            anchor.dependants.push(shown);
        }

        if let Err(err) = self.process_chain(&mut anchor) {
            for dep in std::mem::take(&mut anchor.dependants) {
                self.frame_infos.release(dep);
            }
            self.frame_infos.release(anchor);
            return Err(err);
        }

        self.recorded_count += 1 + anchor.dependants.len();
        self.recorded.push(anchor);

        if self.recorded_count >= self.config.batch_size {
            self.submit_batch()?;
            if self.submitted.len() >= self.config.num_batches {
                self.assemble_oldest_batch()?;
            }
        }
        Ok(())
    }

    fn process_chain(&mut self, anchor: &mut FrameInfo) -> Result<(), EncodeError> {
        self.process_and_record(anchor)?;
        let mut dependants = std::mem::take(&mut anchor.dependants);
        let result = dependants
            .iter_mut()
            .try_for_each(|dep| self.process_and_record(dep));
        anchor.dependants = dependants;
        result
    }

    fn process_and_record(&mut self, frame: &mut FrameInfo) -> Result<(), EncodeError> {
        if let Err(err) = self
            .codec
            .process_dpb(frame, &self.config, &self.dpb_images)
        {
            // A reference-management failure poisons the whole sequence.
            error!(input_order = frame.gop.input_order, %err, "DPB processing failed, forcing IDR");
            self.force_idr = true;
            return Err(err);
        }

        if frame.av1.show_existing_frame {
            // Header-only record; nothing reaches the hardware.
            frame.state = FrameState::Enqueued;
            return Ok(());
        }

        let cmd = self.driver.begin_command_buffer()?;

        for image in [frame.src_image.as_ref(), frame.setup_image.as_ref()]
            .into_iter()
            .flatten()
        {
            let required = image.required_layout();
            if image.layout() != required {
                self.driver
                    .cmd_pipeline_barrier(cmd, image.image_view(), image.layout(), required)?;
                image.set_layout(required);
            }
        }

        let begin_info = {
            let encode_info = frame.encode_info.as_ref().ok_or(EncodeError::MissingInput)?;
            // The begin array leads with the inactive placeholder the
            // encode's setup slot will occupy.
            let mut begin_slots = Vec::with_capacity(encode_info.reference_slots.len() + 1);
            if let Some(setup) = &encode_info.setup_reference_slot {
                begin_slots.push(ReferenceSlot {
                    slot_index: -1,
                    resource: setup.resource,
                    std_info: None,
                });
            }
            begin_slots.extend(encode_info.reference_slots.iter().cloned());
            BeginCodingInfo {
                session: self.session,
                parameters: self.session_params.id,
                reference_slots: begin_slots,
                rate_control: self.rate_control,
            }
        };
        self.driver.cmd_begin_video_coding(cmd, &begin_info)?;

        if frame.is_idr && self.rate_control_pending {
            frame.control_cmds.push(CodingControl::Reset);
            frame
                .control_cmds
                .push(CodingControl::QualityLevel(self.config.quality_level));
            if let Some(rc) = self.rate_control {
                frame.control_cmds.push(CodingControl::RateControl(rc));
            }
            self.rate_control_pending = false;
        }
        for control in &frame.control_cmds {
            self.driver.cmd_control_video_coding(cmd, control)?;
        }

        let encode_info = frame.encode_info.as_ref().ok_or(EncodeError::MissingInput)?;
        self.driver.cmd_encode_video(cmd, encode_info)?;
        self.driver.cmd_end_video_coding(cmd)?;
        self.driver.end_command_buffer(cmd)?;

        frame.begin_info = Some(begin_info);
        frame.cmd_buffer = Some(cmd);
        frame.state = FrameState::Enqueued;
        Ok(())
    }

    fn submit_batch(&mut self) -> Result<(), EncodeError> {
        if self.recorded.is_empty() {
            return Ok(());
        }
        let mut batch = std::mem::take(&mut self.recorded);
        self.recorded_count = 0;

        for chain in &mut batch {
            self.submit_chain(chain)?;
        }
        self.submitted.push_back(batch);
        Ok(())
    }

    fn submit_chain(&mut self, chain: &mut FrameInfo) -> Result<(), EncodeError> {
        self.submit_one(chain)?;
        let mut dependants = std::mem::take(&mut chain.dependants);
        for dep in &mut dependants {
            self.submit_one(dep)?;
        }
        chain.dependants = dependants;
        Ok(())
    }

    fn submit_one(&mut self, frame: &mut FrameInfo) -> Result<(), EncodeError> {
        let Some(cmd) = frame.cmd_buffer else {
            // show_existing_frame records skip the hardware entirely.
            frame.state = FrameState::Submitted;
            return Ok(());
        };

        self.timeline_counter += 1;
        frame.timeline_value = self.timeline_counter;

        let queue_count = self.driver.encode_queue_count().max(1);
        let queue_index = if self.config.enable_hw_load_balancing && queue_count > 1 {
            let index = self.next_queue_index;
            self.next_queue_index = (self.next_queue_index + 1) % queue_count;
            index
        } else {
            0
        };

        self.driver.submit(&QueueSubmission {
            command_buffers: &[cmd],
            wait_semaphore_value: None,
            signal_semaphore_value: Some(frame.timeline_value),
            fence: frame.fence,
            queue_index,
        })?;
        frame.state = FrameState::Submitted;
        Ok(())
    }

    fn assemble_oldest_batch(&mut self) -> Result<(), EncodeError> {
        let Some(batch) = self.submitted.pop_front() else {
            return Ok(());
        };
        for chain in batch {
            self.assemble_chain(chain)?;
        }
        Ok(())
    }

    fn assemble_chain(&mut self, mut chain: FrameInfo) -> Result<(), EncodeError> {
        self.assemble_one(&mut chain)?;
        for mut dep in std::mem::take(&mut chain.dependants) {
            self.assemble_one(&mut dep)?;
            self.frame_infos.release(dep);
        }
        self.frame_infos.release(chain);
        Ok(())
    }

    fn assemble_one(&mut self, frame: &mut FrameInfo) -> Result<(), EncodeError> {
        debug_assert_eq!(frame.state, FrameState::Submitted);

        if frame.av1.show_existing_frame {
            let CodecState::Av1(av1) = &self.codec else {
                return Err(EncodeError::MissingInput);
            };
            let header = av1.show_existing_header(frame);
            if let OutputSink::Ivf { writer, .. } = &mut self.output {
                writer.write_frame(frame.input_order_num, &[&header])?;
                self.stats.bytes_written += header.len() as u64 + 14;
            }
            frame.state = FrameState::Assembled;
            self.stats.frames_out += 1;
            return Ok(());
        }

        let fence = frame.fence.ok_or(EncodeError::MissingInput)?;
        let mut signaled = false;
        for attempt in 0..FENCE_RETRIES {
            if self.driver.wait_fence(fence, FENCE_TIMEOUT_NS)? {
                signaled = true;
                break;
            }
            debug!(
                input_order = frame.gop.input_order,
                attempt, "encode fence not signaled yet"
            );
        }

        if !signaled {
            warn!(
                input_order = frame.gop.input_order,
                "persistent fence timeout, dropping picture as corrupted"
            );
            self.driver.reset_fence(fence)?;
            self.corrupt_frame(frame);
            frame.state = FrameState::Assembled;
            return Ok(());
        }

        let result = self.driver.query_results(frame.query_slot())?;
        if result.status != vk::QueryResultStatusKHR::COMPLETE {
            warn!(
                input_order = frame.gop.input_order,
                status = ?result.status,
                "encode query reported failure, marking reference corrupted"
            );
            self.driver.reset_fence(fence)?;
            self.corrupt_frame(frame);
            frame.state = FrameState::Assembled;
            return Ok(());
        }

        let encode_info = frame.encode_info.as_ref().ok_or(EncodeError::MissingInput)?;
        let payload = self.driver.read_bitstream(
            encode_info.dst_buffer,
            u64::from(result.bitstream_start_offset),
            u64::from(result.bitstream_size),
        )?;
        self.driver.reset_fence(fence)?;

        match &mut self.output {
            OutputSink::AnnexB(writer) => {
                writer.write_frame(&[&frame.prelude, &payload])?;
                self.stats.bytes_written += (frame.prelude.len() + payload.len()) as u64;
            }
            OutputSink::Ivf { writer, pending } => {
                if frame.av1.show_frame {
                    let mut parts: Vec<&[u8]> = Vec::with_capacity(pending.len() + 2);
                    if !frame.prelude.is_empty() {
                        parts.push(&frame.prelude);
                    }
                    for held in pending.iter() {
                        parts.push(held);
                    }
                    parts.push(&payload);
                    let size: usize = parts.iter().map(|p| p.len()).sum();
                    writer.write_frame(frame.input_order_num, &parts)?;
                    pending.clear();
                    self.stats.bytes_written += size as u64 + 14;
                } else {
                    // Unshown pictures ride in the next shown frame's
                    // temporal unit.
                    if frame.prelude.is_empty() {
                        pending.push(payload);
                    } else {
                        let mut merged =
                            Vec::with_capacity(frame.prelude.len() + payload.len());
                        merged.extend_from_slice(&frame.prelude);
                        merged.extend_from_slice(&payload);
                        pending.push(Bytes::from(merged));
                    }
                }
            }
        }

        frame.state = FrameState::Assembled;
        self.stats.frames_out += 1;
        Ok(())
    }

    /// Drop the picture's reference admission and flag downstream ref-list
    /// builds to route around it. Anything admitted after it may depend on
    /// it transitively, so the whole tail since its timestamp is suspect.
    fn corrupt_frame(&mut self, frame: &mut FrameInfo) {
        frame.corrupted = true;
        self.stats.corrupted_frames += 1;
        if frame.is_reference {
            self.codec.invalidate_references(frame.timestamp);
        }
        if frame.is_idr {
            // The whole sequence seeds from this picture; start over.
            self.force_idr = true;
        }
    }

    fn acquire_frame_info(&mut self) -> Result<FrameInfo, EncodeError> {
        loop {
            if let Some(frame) = self.frame_infos.try_acquire() {
                return Ok(frame);
            }
            self.drain_for_capacity("frame contexts")?;
        }
    }

    fn acquire_input_image(&mut self) -> Result<crate::pool::ImageHandle, EncodeError> {
        loop {
            if let Some(image) = self
                .input_images
                .acquire(vk::ImageLayout::VIDEO_ENCODE_SRC_KHR)
            {
                return Ok(image);
            }
            self.drain_for_capacity("input images")?;
        }
    }

    fn acquire_bitstream(&mut self) -> Result<crate::pool::BitstreamHandle, EncodeError> {
        loop {
            if let Some(buffer) = self.bitstream_buffers.acquire() {
                return Ok(buffer);
            }
            self.drain_for_capacity("bitstream buffers")?;
        }
    }

    /// Backpressure: make progress on the downstream stages to return
    /// resources. Fails only when every stage is empty, which means the
    /// pools are simply too small for the configured pipeline depth.
    fn drain_for_capacity(&mut self, what: &'static str) -> Result<(), EncodeError> {
        if !self.submitted.is_empty() {
            self.assemble_oldest_batch()
        } else if !self.recorded.is_empty() {
            self.submit_batch()?;
            self.assemble_oldest_batch()
        } else {
            Err(EncodeError::PoolExhausted(what))
        }
    }

    /// Drain everything and return the driver, the output writer and the
    /// run's statistics.
    pub fn finish(mut self) -> Result<(D, W, EncodeStats), EncodeError> {
        // With an honest frames_left contract the sequencer terminated all
        // B-runs; anything left is coded as a non-reference P.
        if !self.pending_bs.is_empty() {
            warn!(
                pending = self.pending_bs.len(),
                "input ended inside a B-run, coding leftovers as non-reference P"
            );
            for frame in &mut self.pending_bs {
                frame.gop.picture_type = FrameType::P;
                frame.is_reference = false;
            }
            let mut leftovers = std::mem::take(&mut self.pending_bs);
            for mut frame in leftovers.drain(..) {
                self.process_and_record(&mut frame)?;
                self.recorded_count += 1;
                self.recorded.push(frame);
            }
        }

        self.submit_batch()?;
        while !self.submitted.is_empty() {
            self.assemble_oldest_batch()?;
        }

        match &mut self.output {
            OutputSink::AnnexB(writer) => writer.flush()?,
            OutputSink::Ivf { writer, pending } => {
                if !pending.is_empty() {
                    warn!("unshown frames left at end of stream");
                }
                writer.flush()?;
            }
        }

        info!(
            frames_in = self.stats.frames_in,
            frames_out = self.stats.frames_out,
            corrupted = self.stats.corrupted_frames,
            bytes = self.stats.bytes_written,
            "encode finished"
        );

        let writer = match self.output {
            OutputSink::AnnexB(writer) => writer.into_inner(),
            OutputSink::Ivf { writer, .. } => writer.into_inner(),
        };
        Ok((self.driver, writer, self.stats))
    }

    /// Forced abort: drop everything still queued and wait for the
    /// hardware before the pools are torn down.
    pub fn abort(mut self) -> Result<EncodeStats, EncodeError> {
        self.pending_bs.clear();
        self.recorded.clear();
        self.recorded_count = 0;
        while let Some(batch) = self.submitted.pop_front() {
            for mut chain in batch {
                for dep in std::mem::take(&mut chain.dependants) {
                    self.frame_infos.release(dep);
                }
                self.frame_infos.release(chain);
            }
        }
        self.driver.wait_idle()?;
        Ok(self.stats)
    }

    /// The driver, for inspection after the pipeline is done with it.
    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }
}
