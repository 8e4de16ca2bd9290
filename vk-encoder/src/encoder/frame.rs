//! Per-picture context objects.
//!
//! A [`FrameInfo`] owns every resource one in-flight picture touches: the
//! input image, the reconstruction slot, all referenced DPB images, the
//! output buffer, and the recorded commands. Resetting it drops the handles
//! and is what ultimately returns pool slots: a DPB admission is released
//! exactly when the last pending picture referencing it has assembled.

use std::sync::Arc;

use bytes::Bytes;

use crate::driver::{BeginCodingInfo, CodingControl, CommandBufferId, EncodeInfo, FenceId};
use crate::gop::GopPosition;
use crate::pool::{BitstreamHandle, ImageHandle};

use super::SessionParams;

/// Pipeline progress of one picture. Transitions are strictly forward
/// until reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameState {
    #[default]
    New,
    Loaded,
    Enqueued,
    Submitted,
    Assembled,
}

/// AV1-only control fields carried alongside the picture.
#[derive(Debug, Clone, Default)]
pub struct Av1FrameFields {
    pub show_existing_frame: bool,
    pub overlay_frame: bool,
    pub frame_to_show_buf_id: i32,
    pub shown_key_frame_or_switch: bool,
    pub show_frame: bool,
    pub current_frame_id: u32,
}

#[derive(derivative::Derivative)]
#[derivative(Debug)]
pub struct FrameInfo {
    query_slot: u32,

    pub state: FrameState,
    pub gop: GopPosition,
    /// Global input counter, monotonic across IDR sequences.
    pub input_order_num: u64,
    pub timestamp: u64,
    /// Codec POC value (doubled input order for H.26x, display order for
    /// AV1).
    pub pic_order_cnt: i32,
    pub is_idr: bool,
    pub is_reference: bool,
    pub last_frame: bool,
    pub corrupted: bool,

    pub av1: Av1FrameFields,

    #[derivative(Debug = "ignore")]
    pub src_image: Option<ImageHandle>,
    #[derivative(Debug = "ignore")]
    pub setup_image: Option<ImageHandle>,
    #[derivative(Debug = "ignore")]
    pub reference_images: Vec<ImageHandle>,
    #[derivative(Debug = "ignore")]
    pub bitstream: Option<BitstreamHandle>,
    pub cmd_buffer: Option<CommandBufferId>,
    pub fence: Option<FenceId>,
    /// Timeline value ordering an optional compute pre-process before the
    /// encode submission.
    pub timeline_value: u64,

    #[derivative(Debug = "ignore")]
    pub session_params: Option<Arc<SessionParams>>,
    /// Non-VCL header bytes emitted in front of this picture's payload.
    pub prelude: Bytes,

    pub begin_info: Option<BeginCodingInfo>,
    pub control_cmds: Vec<CodingControl>,
    pub encode_info: Option<EncodeInfo>,

    /// Pictures that must not emit before this one: the deferred B-run
    /// behind an anchor, plus any synthesized show_existing_frame record.
    pub dependants: Vec<FrameInfo>,
}

impl FrameInfo {
    fn new(query_slot: u32) -> Self {
        FrameInfo {
            query_slot,
            state: FrameState::New,
            gop: GopPosition::default(),
            input_order_num: 0,
            timestamp: 0,
            pic_order_cnt: 0,
            is_idr: false,
            is_reference: false,
            last_frame: false,
            corrupted: false,
            av1: Av1FrameFields::default(),
            src_image: None,
            setup_image: None,
            reference_images: Vec::with_capacity(16),
            bitstream: None,
            cmd_buffer: None,
            fence: None,
            timeline_value: 0,
            session_params: None,
            prelude: Bytes::new(),
            begin_info: None,
            control_cmds: Vec::new(),
            encode_info: None,
            dependants: Vec::new(),
        }
    }

    pub fn query_slot(&self) -> u32 {
        self.query_slot
    }

    /// Idempotent; drops every owned handle so pool slots can be reused.
    pub fn reset(&mut self) {
        self.state = FrameState::New;
        self.gop = GopPosition::default();
        self.input_order_num = 0;
        self.timestamp = 0;
        self.pic_order_cnt = 0;
        self.is_idr = false;
        self.is_reference = false;
        self.last_frame = false;
        self.corrupted = false;
        self.av1 = Av1FrameFields::default();
        self.src_image = None;
        self.setup_image = None;
        self.reference_images.clear();
        self.bitstream = None;
        self.cmd_buffer = None;
        self.fence = None;
        self.timeline_value = 0;
        self.session_params = None;
        self.prelude = Bytes::new();
        self.begin_info = None;
        self.control_cmds.clear();
        self.encode_info = None;
        debug_assert!(self.dependants.is_empty());
        self.dependants.clear();
    }
}

/// Bounded pool of reusable frame contexts. Exhaustion is the pipeline's
/// backpressure signal. Query slots are owned here, one per context, so
/// their ids stay stable for the life of the pipeline instance.
#[derive(Debug)]
pub struct FrameInfoPool {
    free: Vec<FrameInfo>,
    capacity: usize,
}

impl FrameInfoPool {
    pub fn new(capacity: usize) -> Self {
        FrameInfoPool {
            free: (0..capacity as u32).map(FrameInfo::new).collect(),
            capacity,
        }
    }

    pub fn try_acquire(&mut self) -> Option<FrameInfo> {
        self.free.pop()
    }

    pub fn release(&mut self, mut frame: FrameInfo) {
        frame.reset();
        self.free.push(frame);
        debug_assert!(self.free.len() <= self.capacity);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.capacity - self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_exhausts_and_recycles() {
        let mut pool = FrameInfoPool::new(2);
        let a = pool.try_acquire().unwrap();
        let mut b = pool.try_acquire().unwrap();
        assert!(pool.try_acquire().is_none());
        assert_eq!(pool.in_flight(), 2);

        b.state = FrameState::Loaded;
        b.input_order_num = 42;
        pool.release(b);
        let b2 = pool.try_acquire().unwrap();
        // Reset cleared everything.
        assert_eq!(b2.state, FrameState::New);
        assert_eq!(b2.input_order_num, 0);

        pool.release(a);
        pool.release(b2);
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn query_slots_are_distinct() {
        let mut pool = FrameInfoPool::new(3);
        let a = pool.try_acquire().unwrap();
        let b = pool.try_acquire().unwrap();
        let c = pool.try_acquire().unwrap();
        let mut slots = vec![a.query_slot(), b.query_slot(), c.query_slot()];
        slots.sort_unstable();
        slots.dedup();
        assert_eq!(slots.len(), 3);
    }
}
