//! A hardware-free driver implementation.
//!
//! Records every command it is handed, synthesizes deterministic encoded
//! payloads, and lets tests inject query failures and fence timeouts for
//! the pipeline's recovery paths.

use ash::vk;
use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};

use super::{
    BeginCodingInfo, BufferId, CodecHeaders, CodingControl, CommandBufferId, DriverError,
    EncodeDriver, EncodeInfo, FenceId, ImageViewId, PictureResource, QueryResult,
    QueueSubmission, SessionCreateInfo, SessionParametersId, VideoSessionId,
};

/// Recorded command-buffer contents, kept for assertions.
#[derive(Debug, Clone)]
pub enum RecordedCommand {
    Barrier {
        image_view: ImageViewId,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    },
    BeginCoding(BeginCodingInfo),
    Control(CodingControl),
    Encode(EncodeInfo),
    EndCoding,
}

#[derive(Debug, Default)]
struct CommandBufferState {
    commands: Vec<RecordedCommand>,
    ended: bool,
}

pub const MOCK_H26X_PRELUDE: &[u8] = &[0x00, 0x00, 0x00, 0x01, 0x67, 0x64, 0x00, 0x29];
pub const MOCK_AV1_SEQ_OBU: &[u8] = &[0x0a, 0x04, 0x00, 0x00, 0x00, 0x42];

#[derive(Debug, Default)]
pub struct MockDriver {
    next_id: u64,
    command_buffers: FxHashMap<u64, CommandBufferState>,
    fences: FxHashMap<u64, bool>,
    buffers: FxHashMap<u64, Vec<u8>>,
    query_results: FxHashMap<u32, QueryResult>,
    headers: FxHashMap<u64, CodecHeaders>,

    /// Encode ops in submission order, flattened across command buffers.
    pub submitted_encodes: Vec<EncodeInfo>,
    /// Every submission's queue index, for load-balancing assertions.
    pub submission_queues: Vec<u32>,
    /// All commands in submission order.
    pub submitted_commands: Vec<RecordedCommand>,
    pub session_resets: usize,

    encode_counter: u64,
    encode_queue_count: u32,
    encoded_frame_size: u32,
    fail_query_at: FxHashSet<u64>,
    hang_fence_at: FxHashSet<u64>,
    hung_fences: FxHashSet<u64>,
}

impl MockDriver {
    pub fn new() -> Self {
        MockDriver {
            next_id: 1,
            encode_queue_count: 1,
            encoded_frame_size: 192,
            ..MockDriver::default()
        }
    }

    pub fn with_queue_count(count: u32) -> Self {
        MockDriver {
            encode_queue_count: count,
            ..MockDriver::new()
        }
    }

    /// The nth encode operation (0-based, in encode order) reports a failed
    /// query status.
    pub fn inject_query_error_at(&mut self, nth_encode: u64) {
        self.fail_query_at.insert(nth_encode);
    }

    /// The nth encode operation's fence never signals.
    pub fn inject_fence_timeout_at(&mut self, nth_encode: u64) {
        self.hang_fence_at.insert(nth_encode);
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn cmd(&mut self, cmd: CommandBufferId) -> Result<&mut CommandBufferState, DriverError> {
        self.command_buffers
            .get_mut(&cmd.0)
            .ok_or(DriverError::InvalidId)
    }
}

impl EncodeDriver for MockDriver {
    fn create_video_session(
        &mut self,
        _info: &SessionCreateInfo,
    ) -> Result<VideoSessionId, DriverError> {
        Ok(VideoSessionId(self.alloc_id()))
    }

    fn reset_video_session(&mut self, _session: VideoSessionId) -> Result<(), DriverError> {
        self.session_resets += 1;
        Ok(())
    }

    fn create_session_parameters(
        &mut self,
        _session: VideoSessionId,
        headers: &CodecHeaders,
        _quality_level: u32,
    ) -> Result<SessionParametersId, DriverError> {
        let id = self.alloc_id();
        self.headers.insert(id, headers.clone());
        Ok(SessionParametersId(id))
    }

    fn get_encoded_parameters(
        &mut self,
        parameters: SessionParametersId,
        _sps_id: u8,
        _pps_id: u8,
    ) -> Result<Bytes, DriverError> {
        let headers = self.headers.get(&parameters.0).ok_or(DriverError::InvalidId)?;
        Ok(match headers {
            CodecHeaders::Av1 { .. } => Bytes::from_static(MOCK_AV1_SEQ_OBU),
            _ => Bytes::from_static(MOCK_H26X_PRELUDE),
        })
    }

    fn create_images(
        &mut self,
        count: u32,
        _format: vk::Format,
        extent: vk::Extent2D,
        _usage: vk::ImageUsageFlags,
    ) -> Result<Vec<PictureResource>, DriverError> {
        Ok((0..count)
            .map(|_| PictureResource {
                image_view: ImageViewId(self.alloc_id()),
                coded_offset: vk::Offset2D::default(),
                coded_extent: extent,
                base_array_layer: 0,
            })
            .collect())
    }

    fn create_bitstream_buffer(&mut self, size: u64) -> Result<BufferId, DriverError> {
        let id = self.alloc_id();
        self.buffers.insert(id, vec![0; size as usize]);
        Ok(BufferId(id))
    }

    fn create_fence(&mut self) -> Result<FenceId, DriverError> {
        let id = self.alloc_id();
        self.fences.insert(id, false);
        Ok(FenceId(id))
    }

    fn upload_frame(
        &mut self,
        _target: &PictureResource,
        _planes: &[&[u8]],
        _strides: &[u32],
    ) -> Result<(), DriverError> {
        Ok(())
    }

    fn begin_command_buffer(&mut self) -> Result<CommandBufferId, DriverError> {
        let id = self.alloc_id();
        self.command_buffers.insert(id, CommandBufferState::default());
        Ok(CommandBufferId(id))
    }

    fn end_command_buffer(&mut self, cmd: CommandBufferId) -> Result<(), DriverError> {
        self.cmd(cmd)?.ended = true;
        Ok(())
    }

    fn cmd_pipeline_barrier(
        &mut self,
        cmd: CommandBufferId,
        image_view: ImageViewId,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) -> Result<(), DriverError> {
        self.cmd(cmd)?.commands.push(RecordedCommand::Barrier {
            image_view,
            old_layout,
            new_layout,
        });
        Ok(())
    }

    fn cmd_begin_video_coding(
        &mut self,
        cmd: CommandBufferId,
        info: &BeginCodingInfo,
    ) -> Result<(), DriverError> {
        self.cmd(cmd)?
            .commands
            .push(RecordedCommand::BeginCoding(info.clone()));
        Ok(())
    }

    fn cmd_control_video_coding(
        &mut self,
        cmd: CommandBufferId,
        control: &CodingControl,
    ) -> Result<(), DriverError> {
        self.cmd(cmd)?
            .commands
            .push(RecordedCommand::Control(control.clone()));
        Ok(())
    }

    fn cmd_encode_video(
        &mut self,
        cmd: CommandBufferId,
        info: &EncodeInfo,
    ) -> Result<(), DriverError> {
        self.cmd(cmd)?
            .commands
            .push(RecordedCommand::Encode(info.clone()));
        Ok(())
    }

    fn cmd_end_video_coding(&mut self, cmd: CommandBufferId) -> Result<(), DriverError> {
        self.cmd(cmd)?.commands.push(RecordedCommand::EndCoding);
        Ok(())
    }

    fn submit(&mut self, submission: &QueueSubmission<'_>) -> Result<(), DriverError> {
        self.submission_queues.push(submission.queue_index);

        for cmd in submission.command_buffers {
            let state = self
                .command_buffers
                .remove(&cmd.0)
                .ok_or(DriverError::InvalidId)?;
            if !state.ended {
                return Err(DriverError::Backend(
                    "submitted an open command buffer".into(),
                ));
            }

            for command in state.commands {
                if let RecordedCommand::Encode(info) = &command {
                    let n = self.encode_counter;
                    self.encode_counter += 1;

                    let size = self.encoded_frame_size + (n % 7) as u32;
                    let offset = info.dst_buffer_offset as u32;
                    let status = if self.fail_query_at.contains(&n) {
                        vk::QueryResultStatusKHR::ERROR
                    } else {
                        vk::QueryResultStatusKHR::COMPLETE
                    };

                    // Deterministic payload so container layers can be
                    // checked byte-for-byte.
                    if let Some(data) = self.buffers.get_mut(&info.dst_buffer.0) {
                        let start = offset as usize;
                        let end = (start + size as usize).min(data.len());
                        for (i, byte) in data[start..end].iter_mut().enumerate() {
                            *byte = (n as u8) ^ (i as u8);
                        }
                    }

                    self.query_results.insert(
                        info.query_slot,
                        QueryResult {
                            bitstream_start_offset: offset,
                            bitstream_size: size,
                            status,
                        },
                    );

                    if self.hang_fence_at.contains(&n) {
                        if let Some(fence) = submission.fence {
                            self.hung_fences.insert(fence.0);
                        }
                    }

                    self.submitted_encodes.push(info.clone());
                }
                self.submitted_commands.push(command);
            }
        }

        if let Some(fence) = submission.fence {
            if !self.hung_fences.contains(&fence.0) {
                self.fences.insert(fence.0, true);
            }
        }
        Ok(())
    }

    fn encode_queue_count(&self) -> u32 {
        self.encode_queue_count
    }

    fn wait_fence(&mut self, fence: FenceId, _timeout_ns: u64) -> Result<bool, DriverError> {
        if self.hung_fences.contains(&fence.0) {
            return Ok(false);
        }
        Ok(*self.fences.get(&fence.0).ok_or(DriverError::InvalidId)?)
    }

    fn reset_fence(&mut self, fence: FenceId) -> Result<(), DriverError> {
        self.hung_fences.remove(&fence.0);
        self.fences.insert(fence.0, false);
        Ok(())
    }

    fn query_results(&mut self, query_slot: u32) -> Result<QueryResult, DriverError> {
        Ok(self
            .query_results
            .get(&query_slot)
            .copied()
            .unwrap_or(QueryResult {
                bitstream_start_offset: 0,
                bitstream_size: 0,
                status: vk::QueryResultStatusKHR::NOT_READY,
            }))
    }

    fn read_bitstream(
        &mut self,
        buffer: BufferId,
        offset: u64,
        size: u64,
    ) -> Result<Bytes, DriverError> {
        let data = self.buffers.get(&buffer.0).ok_or(DriverError::InvalidId)?;
        let start = offset as usize;
        let end = (start + size as usize).min(data.len());
        Ok(Bytes::copy_from_slice(&data[start..end]))
    }

    fn wait_idle(&mut self) -> Result<(), DriverError> {
        Ok(())
    }
}
