//! H.264 decoded picture buffer.
//!
//! Implements the reference bookkeeping of ITU-T H.264 clauses 8.2.1
//! (picture order count), 8.2.4 (picture numbers and reference list
//! initialization) and 8.2.5 (reference marking, sliding window and MMCO),
//! plus the C.4 removal/bumping rules, for both frame and field coding.

use ash::vk;
use tracing::warn;

use super::{DpbError, Marking, RefPicLists};
use crate::gop::FrameType;
use crate::pool::ImageHandle;

pub const MAX_DPB_SLOTS: usize = 16;
/// Index of the working entry holding the picture being coded before it is
/// committed to a real slot.
const WORKING: usize = MAX_DPB_SLOTS;

const INF_MIN: i32 = i32::MIN;
const INF_MAX: i32 = i32::MAX;

/// H.264 POC derivation mode carried in the SPS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PocType {
    Type0,
    Type2,
}

/// The SPS fields the DPB depends on.
#[derive(Debug, Clone, Copy)]
pub struct H264DpbConfig {
    pub max_num_ref_frames: u32,
    pub log2_max_frame_num: u32,
    pub log2_max_pic_order_cnt_lsb: u32,
    pub poc_type: PocType,
    pub gaps_in_frame_num_allowed: bool,
    pub num_ref_idx_l0_default_active: u32,
    pub num_ref_idx_l1_default_active: u32,
}

impl H264DpbConfig {
    fn max_frame_num(&self) -> i32 {
        1 << self.log2_max_frame_num
    }

    fn max_poc_lsb(&self) -> i32 {
        1 << self.log2_max_pic_order_cnt_lsb
    }
}

/// Everything the DPB needs to know about the picture being coded.
#[derive(Debug, Clone, Copy)]
pub struct H264PictureDesc {
    pub picture_type: FrameType,
    pub frame_num: u32,
    /// pic_order_cnt_lsb as it will appear in the slice header.
    pub pic_order_cnt_lsb: i32,
    pub idr: bool,
    pub is_reference: bool,
    pub field_pic: bool,
    pub bottom_field: bool,
    pub long_term_reference: bool,
    pub adaptive_ref_pic_marking: bool,
    pub no_output_of_prior_pics: bool,
    pub timestamp: u64,
}

#[derive(Debug, Default, Clone)]
pub struct DpbEntryH264 {
    top_present: bool,
    bottom_present: bool,
    top_needed_for_output: bool,
    bottom_needed_for_output: bool,
    top_decoded_first: bool,
    reference_picture: bool,
    complementary_field_pair: bool,
    not_existing: bool,
    corrupted: bool,

    pub top_field_marking: Marking,
    pub bottom_field_marking: Marking,
    long_term_frame_idx: i32,

    top_foc: i32,
    bottom_foc: i32,

    frame_num: u32,
    pic_order_cnt: i32,

    frame_num_wrap: i32,
    top_pic_num: i32,
    bottom_pic_num: i32,
    top_long_term_pic_num: i32,
    bottom_long_term_pic_num: i32,

    image: Option<ImageHandle>,
    timestamp: u64,
}

impl DpbEntryH264 {
    fn empty(&self) -> bool {
        !self.top_present && !self.bottom_present
    }

    fn is_short(&self) -> bool {
        self.top_field_marking == Marking::ShortTerm
            || self.bottom_field_marking == Marking::ShortTerm
    }

    fn is_long(&self) -> bool {
        self.top_field_marking == Marking::LongTerm
            || self.bottom_field_marking == Marking::LongTerm
    }

    fn is_frame_short(&self) -> bool {
        self.top_field_marking == Marking::ShortTerm
            && self.bottom_field_marking == Marking::ShortTerm
    }

    fn is_frame_long(&self) -> bool {
        self.top_field_marking == Marking::LongTerm
            && self.bottom_field_marking == Marking::LongTerm
    }

    pub fn is_active_reference(&self) -> bool {
        self.is_short() || self.is_long()
    }

    pub fn frame_num(&self) -> u32 {
        self.frame_num
    }

    pub fn pic_order_cnt(&self) -> i32 {
        self.pic_order_cnt
    }

    pub fn is_corrupted(&self) -> bool {
        self.corrupted
    }

    fn release_image(&mut self) {
        self.image = None;
    }

    /// Frame buffers neither needed for output nor used for reference
    /// become empty.
    fn try_empty(&mut self) {
        let top_done = !self.top_present
            || (!self.top_needed_for_output && self.top_field_marking == Marking::Unused);
        let bottom_done = !self.bottom_present
            || (!self.bottom_needed_for_output && self.bottom_field_marking == Marking::Unused);
        if top_done && bottom_done {
            self.top_present = false;
            self.bottom_present = false;
            self.release_image();
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct H264Dpb {
    entries: Vec<DpbEntryH264>,
    max_dpb_size: usize,
    current: usize,

    max_long_term_frame_idx: i32,
    prev_pic_order_cnt_msb: i32,
    prev_pic_order_cnt_lsb: i32,
    prev_frame_num_offset: i32,
    prev_frame_num: u32,
    prev_ref_frame_num: u32,

    last_idr_timestamp: u64,
}

impl H264Dpb {
    pub fn new() -> Self {
        let mut dpb = H264Dpb::default();
        dpb.sequence_start(MAX_DPB_SLOTS);
        dpb
    }

    /// Reset all state for a new encode session.
    pub fn sequence_start(&mut self, max_dpb_size: usize) {
        self.entries = vec![DpbEntryH264::default(); MAX_DPB_SLOTS + 1];
        self.max_dpb_size = max_dpb_size.min(MAX_DPB_SLOTS);
        self.current = WORKING;
        self.max_long_term_frame_idx = -1;
        self.prev_pic_order_cnt_msb = 0;
        self.prev_pic_order_cnt_lsb = 0;
        self.prev_frame_num_offset = 0;
        self.prev_frame_num = 0;
        self.prev_ref_frame_num = 0;
        self.last_idr_timestamp = 0;
    }

    pub fn max_dpb_size(&self) -> usize {
        self.max_dpb_size
    }

    /// Begin a picture: fill frame_num gaps, detect complementary field
    /// pairs, stage the working entry and derive POC / PicNum values.
    /// Returns the staging index (`MAX_DPB_SLOTS` until the picture is
    /// committed to a slot by [`Self::picture_end`]).
    pub fn picture_start(
        &mut self,
        cfg: &H264DpbConfig,
        pic: &H264PictureDesc,
    ) -> Result<usize, DpbError> {
        self.fill_frame_num_gaps(cfg, pic);

        let cur = &self.entries[self.current];
        let single_field = cur.top_present ^ cur.bottom_present;
        let opposite_parity = (cur.top_present && pic.bottom_field)
            || (cur.bottom_present && pic.field_pic && !pic.bottom_field);
        let pairable = (!cur.reference_picture && !pic.is_reference)
            || (cur.reference_picture
                && pic.is_reference
                && cur.frame_num == pic.frame_num
                && !pic.idr);

        if single_field && pic.field_pic && opposite_parity && pairable {
            // Second field of a complementary field pair fills the other
            // half of the previous picture's entry.
            self.entries[self.current].complementary_field_pair = true;
        } else {
            self.current = WORKING;
            let entry = &mut self.entries[WORKING];
            entry.top_present = false;
            entry.bottom_present = false;
            entry.top_needed_for_output = false;
            entry.bottom_needed_for_output = false;
            entry.top_field_marking = Marking::Unused;
            entry.bottom_field_marking = Marking::Unused;
            entry.reference_picture = pic.is_reference;
            entry.top_decoded_first = !pic.bottom_field;
            entry.complementary_field_pair = false;
            entry.not_existing = false;
            entry.corrupted = false;
            entry.frame_num = pic.frame_num;
            entry.timestamp = pic.timestamp;
            entry.release_image();
            if pic.idr {
                self.last_idr_timestamp = pic.timestamp;
            }
        }

        self.calculate_poc(cfg, pic);
        self.calculate_pic_num(cfg, pic);

        Ok(self.current)
    }

    /// Commit the current picture: run reference marking, apply the C.4
    /// removal rules and store the reconstructed image in its slot.
    /// Returns the committed slot index, or `MAX_DPB_SLOTS` for a
    /// non-reference picture that does not stay in the buffer.
    pub fn picture_end(
        &mut self,
        cfg: &H264DpbConfig,
        pic: &H264PictureDesc,
        image: Option<ImageHandle>,
        marking_ops: &[vk::native::StdVideoEncodeH264RefPicMarkingEntry],
    ) -> Result<usize, DpbError> {
        if self.entries[self.current].complementary_field_pair {
            let e = &mut self.entries[self.current];
            e.pic_order_cnt = e.top_foc.min(e.bottom_foc);
        }

        if pic.is_reference {
            self.decoded_ref_pic_marking(cfg, pic, marking_ops)?;
        }

        // C.4.4: removal before possible insertion of the current picture.
        // Nothing is kept for display, so prior pictures are flushed outright.
        if pic.idr {
            for i in 0..MAX_DPB_SLOTS {
                let e = &mut self.entries[i];
                e.top_field_marking = Marking::Unused;
                e.bottom_field_marking = Marking::Unused;
                e.top_present = false;
                e.bottom_present = false;
                e.top_needed_for_output = false;
                e.bottom_needed_for_output = false;
                e.release_image();
            }
        }

        // C.4.5
        if pic.is_reference {
            if self.entries[self.current].empty() || self.current == WORKING {
                while self.is_full() {
                    self.bump(true);
                }
                let slot = self.find_empty_slot().ok_or(DpbError::Full)?;
                if slot != self.current {
                    self.entries[slot] = self.entries[self.current].clone();
                    self.current = slot;
                }
            }
            let e = &mut self.entries[self.current];
            if !pic.field_pic || !pic.bottom_field {
                e.top_present = true;
                e.top_needed_for_output = true;
            }
            if !pic.field_pic || pic.bottom_field {
                e.bottom_present = true;
                e.bottom_needed_for_output = true;
            }
        } else if self.current != WORKING {
            // Second field of a complementary non-reference pair.
            let e = &mut self.entries[self.current];
            e.top_present = true;
            e.bottom_present = true;
            e.top_needed_for_output = true;
            e.bottom_needed_for_output = true;
        }
        // A plain non-reference picture is emitted immediately and never
        // occupies a slot.

        if self.current != WORKING {
            self.entries[self.current].image = image;
            Ok(self.current)
        } else {
            Ok(WORKING)
        }
    }

    // 8.2.5.2
    fn fill_frame_num_gaps(&mut self, cfg: &H264DpbConfig, pic: &H264PictureDesc) {
        let max_frame_num = cfg.max_frame_num() as u32;

        if pic.idr {
            self.prev_ref_frame_num = 0;
        }

        if pic.frame_num != self.prev_ref_frame_num
            && pic.frame_num != (self.prev_ref_frame_num + 1) % max_frame_num
        {
            if !cfg.gaps_in_frame_num_allowed {
                warn!(
                    frame_num = pic.frame_num,
                    prev_ref_frame_num = self.prev_ref_frame_num,
                    "gap in frame_num not allowed by the active SPS"
                );
            } else {
                let mut unused = (self.prev_ref_frame_num + 1) % max_frame_num;
                while unused != pic.frame_num {
                    let gap_pic = H264PictureDesc {
                        frame_num: unused,
                        field_pic: false,
                        bottom_field: false,
                        is_reference: true,
                        idr: false,
                        adaptive_ref_pic_marking: false,
                        ..*pic
                    };

                    while self.is_full() {
                        self.bump(true);
                    }
                    let Some(slot) = self.find_empty_slot() else {
                        warn!("could not allocate a slot for a non-existing frame");
                        break;
                    };
                    self.current = slot;
                    let entry = &mut self.entries[slot];
                    *entry = DpbEntryH264 {
                        frame_num: unused,
                        ..DpbEntryH264::default()
                    };

                    if cfg.poc_type != PocType::Type0 {
                        self.calculate_poc(cfg, &gap_pic);
                    }
                    self.calculate_pic_num(cfg, &gap_pic);
                    self.sliding_window(cfg, &gap_pic);

                    let entry = &mut self.entries[slot];
                    entry.top_field_marking = Marking::ShortTerm;
                    entry.bottom_field_marking = Marking::ShortTerm;
                    entry.reference_picture = true;
                    entry.not_existing = true;
                    entry.top_present = true;
                    entry.bottom_present = true;
                    entry.top_needed_for_output = false;
                    entry.bottom_needed_for_output = false;

                    for i in 0..MAX_DPB_SLOTS {
                        self.entries[i].try_empty();
                    }

                    self.prev_ref_frame_num = unused;
                    unused = (unused + 1) % max_frame_num;
                }
            }
        }

        if pic.is_reference {
            self.prev_ref_frame_num = pic.frame_num;
        }
    }

    fn is_full(&self) -> bool {
        self.entries[..self.max_dpb_size].iter().all(|e| !e.empty())
    }

    fn find_empty_slot(&self) -> Option<usize> {
        self.entries[..self.max_dpb_size].iter().position(|e| e.empty())
    }

    /// C.4.5.3: emit the picture with the smallest output POC and free its
    /// buffer if it is no longer referenced.
    fn bump(&mut self, always: bool) {
        let mut poc_min = INF_MAX;
        let mut min_idx: Option<usize> = None;
        for (i, e) in self.entries[..MAX_DPB_SLOTS].iter().enumerate() {
            if e.top_present && e.top_needed_for_output && e.top_foc < poc_min {
                poc_min = e.top_foc;
                min_idx = Some(i);
            }
            if e.bottom_present && e.bottom_needed_for_output && e.bottom_foc < poc_min {
                poc_min = e.bottom_foc;
                min_idx = Some(i);
            }
        }

        if let Some(i) = min_idx {
            let e = &mut self.entries[i];
            e.top_needed_for_output = false;
            e.bottom_needed_for_output = false;
            e.try_empty();
            return;
        }

        if always {
            // Nothing left to output; evict the lowest-POC entry outright to
            // avoid deadlocking admission.
            let mut poc_min = INF_MAX;
            let mut min_idx = 0;
            for (i, e) in self.entries[..MAX_DPB_SLOTS].iter().enumerate() {
                if e.top_present && e.top_foc <= poc_min {
                    poc_min = e.top_foc;
                    min_idx = i;
                }
                if e.bottom_present && e.bottom_foc <= poc_min {
                    poc_min = e.bottom_foc;
                    min_idx = i;
                }
            }
            let e = &mut self.entries[min_idx];
            e.top_present = false;
            e.bottom_present = false;
            e.release_image();
        }
    }

    // 8.2.5, 8.2.5.1
    fn decoded_ref_pic_marking(
        &mut self,
        cfg: &H264DpbConfig,
        pic: &H264PictureDesc,
        marking_ops: &[vk::native::StdVideoEncodeH264RefPicMarkingEntry],
    ) -> Result<(), DpbError> {
        if pic.idr {
            for i in 0..MAX_DPB_SLOTS {
                self.entries[i].top_field_marking = Marking::Unused;
                self.entries[i].bottom_field_marking = Marking::Unused;
            }
            let cur = &mut self.entries[self.current];
            let marking = if pic.long_term_reference {
                cur.long_term_frame_idx = 0;
                self.max_long_term_frame_idx = 0;
                Marking::LongTerm
            } else {
                self.max_long_term_frame_idx = -1;
                Marking::ShortTerm
            };
            if !pic.field_pic || !pic.bottom_field {
                cur.top_field_marking = marking;
            }
            if !pic.field_pic || pic.bottom_field {
                cur.bottom_field_marking = marking;
            }
            return Ok(());
        }

        if !pic.adaptive_ref_pic_marking {
            self.sliding_window(cfg, pic);
        } else {
            self.adaptive_marking(pic, marking_ops)?;
        }

        // Mark current as short-term where not already marked long-term.
        let cur = &mut self.entries[self.current];
        if (!pic.field_pic || !pic.bottom_field) && cur.top_field_marking == Marking::Unused {
            cur.top_field_marking = Marking::ShortTerm;
        }
        if (!pic.field_pic || pic.bottom_field) && cur.bottom_field_marking == Marking::Unused {
            cur.bottom_field_marking = Marking::ShortTerm;
        }
        Ok(())
    }

    // 8.2.5.3
    fn sliding_window(&mut self, cfg: &H264DpbConfig, pic: &H264PictureDesc) {
        let cur = &self.entries[self.current];
        if pic.field_pic
            && ((!pic.bottom_field && cur.bottom_field_marking == Marking::ShortTerm)
                || (pic.bottom_field && cur.top_field_marking == Marking::ShortTerm))
        {
            // Second field of a complementary reference pair inherits the
            // short-term marking.
            let cur = &mut self.entries[self.current];
            if !pic.bottom_field {
                cur.top_field_marking = Marking::ShortTerm;
            } else {
                cur.bottom_field_marking = Marking::ShortTerm;
            }
            return;
        }

        let mut imin = None;
        let mut min_frame_num_wrap = 65536;
        let mut num_short = 0u32;
        let mut num_long = 0u32;
        for (i, e) in self.entries[..MAX_DPB_SLOTS].iter().enumerate() {
            if e.is_short() {
                num_short += 1;
                if e.frame_num_wrap < min_frame_num_wrap {
                    imin = Some(i);
                    min_frame_num_wrap = e.frame_num_wrap;
                }
            }
            if e.is_long() {
                num_long += 1;
            }
        }

        if num_short + num_long >= cfg.max_num_ref_frames {
            if let Some(i) = (num_short > 0).then_some(imin).flatten() {
                self.entries[i].top_field_marking = Marking::Unused;
                self.entries[i].bottom_field_marking = Marking::Unused;
            } else {
                warn!(
                    num_short,
                    num_long,
                    max = cfg.max_num_ref_frames,
                    "sliding window found no short-term picture to evict"
                );
            }
        }
    }

    // 8.2.5.4
    fn adaptive_marking(
        &mut self,
        pic: &H264PictureDesc,
        ops: &[vk::native::StdVideoEncodeH264RefPicMarkingEntry],
    ) -> Result<(), DpbError> {
        use vk::native::*;

        let curr_pic_num: i32 = if !pic.field_pic {
            pic.frame_num as i32
        } else {
            2 * pic.frame_num as i32 + 1
        };

        for op in ops {
            match op.memory_management_control_operation {
                StdVideoH264MemMgmtControlOp_STD_VIDEO_H264_MEM_MGMT_CONTROL_OP_END => break,
                StdVideoH264MemMgmtControlOp_STD_VIDEO_H264_MEM_MGMT_CONTROL_OP_UNMARK_SHORT_TERM => {
                    // 8.2.5.4.1
                    let pic_num_x = curr_pic_num - (op.difference_of_pic_nums_minus1 as i32 + 1);
                    for e in &mut self.entries[..MAX_DPB_SLOTS] {
                        if e.top_field_marking == Marking::ShortTerm && e.top_pic_num == pic_num_x {
                            e.top_field_marking = Marking::Unused;
                        }
                        if e.bottom_field_marking == Marking::ShortTerm
                            && e.bottom_pic_num == pic_num_x
                        {
                            e.bottom_field_marking = Marking::Unused;
                        }
                    }
                }
                StdVideoH264MemMgmtControlOp_STD_VIDEO_H264_MEM_MGMT_CONTROL_OP_UNMARK_LONG_TERM => {
                    // 8.2.5.4.2
                    let n = op.long_term_pic_num as i32;
                    for e in &mut self.entries[..MAX_DPB_SLOTS] {
                        if e.top_field_marking == Marking::LongTerm && e.top_long_term_pic_num == n {
                            e.top_field_marking = Marking::Unused;
                        }
                        if e.bottom_field_marking == Marking::LongTerm
                            && e.bottom_long_term_pic_num == n
                        {
                            e.bottom_field_marking = Marking::Unused;
                        }
                    }
                }
                StdVideoH264MemMgmtControlOp_STD_VIDEO_H264_MEM_MGMT_CONTROL_OP_MARK_LONG_TERM => {
                    // 8.2.5.4.3
                    let pic_num_x = curr_pic_num - (op.difference_of_pic_nums_minus1 as i32 + 1);
                    let idx = op.long_term_frame_idx as i32;
                    for e in &mut self.entries[..MAX_DPB_SLOTS] {
                        if e.top_field_marking == Marking::LongTerm
                            && e.long_term_frame_idx == idx
                            && !(e.bottom_field_marking == Marking::ShortTerm
                                && e.bottom_pic_num == pic_num_x)
                        {
                            e.top_field_marking = Marking::Unused;
                        }
                        if e.bottom_field_marking == Marking::LongTerm
                            && e.long_term_frame_idx == idx
                            && !(e.top_field_marking == Marking::ShortTerm
                                && e.top_pic_num == pic_num_x)
                        {
                            e.bottom_field_marking = Marking::Unused;
                        }
                        if e.top_field_marking == Marking::ShortTerm && e.top_pic_num == pic_num_x {
                            e.top_field_marking = Marking::LongTerm;
                            e.long_term_frame_idx = idx;
                            Self::update_long_term_pic_nums(e, pic);
                        }
                        if e.bottom_field_marking == Marking::ShortTerm
                            && e.bottom_pic_num == pic_num_x
                        {
                            e.bottom_field_marking = Marking::LongTerm;
                            e.long_term_frame_idx = idx;
                            Self::update_long_term_pic_nums(e, pic);
                        }
                    }
                }
                StdVideoH264MemMgmtControlOp_STD_VIDEO_H264_MEM_MGMT_CONTROL_OP_SET_MAX_LONG_TERM_INDEX => {
                    // 8.2.5.4.4
                    self.max_long_term_frame_idx = op.max_long_term_frame_idx_plus1 as i32 - 1;
                    for e in &mut self.entries[..MAX_DPB_SLOTS] {
                        if e.top_field_marking == Marking::LongTerm
                            && e.long_term_frame_idx > self.max_long_term_frame_idx
                        {
                            e.top_field_marking = Marking::Unused;
                        }
                        if e.bottom_field_marking == Marking::LongTerm
                            && e.long_term_frame_idx > self.max_long_term_frame_idx
                        {
                            e.bottom_field_marking = Marking::Unused;
                        }
                    }
                }
                StdVideoH264MemMgmtControlOp_STD_VIDEO_H264_MEM_MGMT_CONTROL_OP_UNMARK_ALL => {
                    // 8.2.5.4.5
                    for e in &mut self.entries[..MAX_DPB_SLOTS] {
                        e.top_field_marking = Marking::Unused;
                        e.bottom_field_marking = Marking::Unused;
                    }
                    self.max_long_term_frame_idx = -1;
                    let cur = &mut self.entries[self.current];
                    cur.frame_num = 0;
                    cur.top_foc -= cur.pic_order_cnt;
                    cur.bottom_foc -= cur.pic_order_cnt;
                    cur.pic_order_cnt = 0;
                }
                StdVideoH264MemMgmtControlOp_STD_VIDEO_H264_MEM_MGMT_CONTROL_OP_MARK_CURRENT_AS_LONG_TERM => {
                    // 8.2.5.4.6
                    let idx = op.long_term_frame_idx as i32;
                    let current = self.current;
                    for (i, e) in self.entries[..MAX_DPB_SLOTS].iter_mut().enumerate() {
                        if i == current {
                            continue;
                        }
                        if e.top_field_marking == Marking::LongTerm && e.long_term_frame_idx == idx {
                            e.top_field_marking = Marking::Unused;
                        }
                        if e.bottom_field_marking == Marking::LongTerm
                            && e.long_term_frame_idx == idx
                        {
                            e.bottom_field_marking = Marking::Unused;
                        }
                    }
                    let cur = &mut self.entries[current];
                    if !pic.field_pic || !pic.bottom_field {
                        cur.top_field_marking = Marking::LongTerm;
                    }
                    if !pic.field_pic || pic.bottom_field {
                        cur.bottom_field_marking = Marking::LongTerm;
                    }
                    cur.long_term_frame_idx = idx;
                    Self::update_long_term_pic_nums(cur, pic);
                }
                _ => return Err(DpbError::InvalidMarking),
            }
        }
        Ok(())
    }

    fn update_long_term_pic_nums(e: &mut DpbEntryH264, pic: &H264PictureDesc) {
        if !pic.field_pic {
            e.top_long_term_pic_num = e.long_term_frame_idx; // (8-30)
            e.bottom_long_term_pic_num = e.long_term_frame_idx;
        } else if !pic.bottom_field {
            e.top_long_term_pic_num = 2 * e.long_term_frame_idx + 1; // (8-33)
            e.bottom_long_term_pic_num = 2 * e.long_term_frame_idx; // (8-34)
        } else {
            e.top_long_term_pic_num = 2 * e.long_term_frame_idx; // (8-34)
            e.bottom_long_term_pic_num = 2 * e.long_term_frame_idx + 1; // (8-33)
        }
    }

    // 8.2.1
    fn calculate_poc(&mut self, cfg: &H264DpbConfig, pic: &H264PictureDesc) {
        match cfg.poc_type {
            PocType::Type0 => self.calculate_poc_type0(cfg, pic),
            PocType::Type2 => self.calculate_poc_type2(cfg, pic),
        }
        let cur = &mut self.entries[self.current];
        if !pic.field_pic || cur.complementary_field_pair {
            cur.pic_order_cnt = cur.top_foc.min(cur.bottom_foc);
        } else if !pic.bottom_field {
            cur.pic_order_cnt = cur.top_foc;
        } else {
            cur.pic_order_cnt = cur.bottom_foc;
        }
    }

    // 8.2.1.1
    fn calculate_poc_type0(&mut self, cfg: &H264DpbConfig, pic: &H264PictureDesc) {
        if pic.idr {
            self.prev_pic_order_cnt_msb = 0;
            self.prev_pic_order_cnt_lsb = 0;
        }

        let max_poc_lsb = cfg.max_poc_lsb();
        let lsb = pic.pic_order_cnt_lsb;
        let pic_order_cnt_msb = if lsb < self.prev_pic_order_cnt_lsb
            && (self.prev_pic_order_cnt_lsb - lsb) >= max_poc_lsb / 2
        {
            self.prev_pic_order_cnt_msb + max_poc_lsb
        } else if lsb > self.prev_pic_order_cnt_lsb
            && (lsb - self.prev_pic_order_cnt_lsb) > max_poc_lsb / 2
        {
            self.prev_pic_order_cnt_msb - max_poc_lsb
        } else {
            self.prev_pic_order_cnt_msb
        };

        let cur = &mut self.entries[self.current];
        if !pic.field_pic || !pic.bottom_field {
            cur.top_foc = pic_order_cnt_msb + lsb; // (8-4)
        }
        if !pic.field_pic || pic.bottom_field {
            cur.bottom_foc = pic_order_cnt_msb + lsb; // (8-5)
        }

        if pic.is_reference {
            self.prev_pic_order_cnt_msb = pic_order_cnt_msb;
            self.prev_pic_order_cnt_lsb = lsb;
        }
    }

    // 8.2.1.3
    fn calculate_poc_type2(&mut self, cfg: &H264DpbConfig, pic: &H264PictureDesc) {
        let max_frame_num = cfg.max_frame_num();

        let frame_num_offset = if pic.idr {
            0
        } else if self.prev_frame_num > pic.frame_num {
            self.prev_frame_num_offset + max_frame_num
        } else {
            self.prev_frame_num_offset
        };

        let temp_poc = if pic.idr {
            0
        } else if !pic.is_reference {
            2 * (frame_num_offset + pic.frame_num as i32) - 1
        } else {
            2 * (frame_num_offset + pic.frame_num as i32)
        };

        let cur = &mut self.entries[self.current];
        if !pic.field_pic {
            cur.top_foc = temp_poc;
            cur.bottom_foc = temp_poc;
        } else if pic.bottom_field {
            cur.bottom_foc = temp_poc;
        } else {
            cur.top_foc = temp_poc;
        }

        self.prev_frame_num_offset = frame_num_offset;
        self.prev_frame_num = pic.frame_num;
    }

    // 8.2.4.1
    fn calculate_pic_num(&mut self, cfg: &H264DpbConfig, pic: &H264PictureDesc) {
        let max_frame_num = cfg.max_frame_num();
        for e in &mut self.entries[..MAX_DPB_SLOTS] {
            e.frame_num_wrap = if e.frame_num > pic.frame_num {
                e.frame_num as i32 - max_frame_num // (8-28)
            } else {
                e.frame_num as i32
            };

            if !pic.field_pic {
                e.top_pic_num = e.frame_num_wrap; // (8-29)
                e.bottom_pic_num = e.frame_num_wrap;
                e.top_long_term_pic_num = e.long_term_frame_idx; // (8-30)
                e.bottom_long_term_pic_num = e.long_term_frame_idx;
            } else if !pic.bottom_field {
                e.top_pic_num = 2 * e.frame_num_wrap + 1; // (8-31)
                e.bottom_pic_num = 2 * e.frame_num_wrap; // (8-32)
                e.top_long_term_pic_num = 2 * e.long_term_frame_idx + 1;
                e.bottom_long_term_pic_num = 2 * e.long_term_frame_idx;
            } else {
                e.top_pic_num = 2 * e.frame_num_wrap; // (8-32)
                e.bottom_pic_num = 2 * e.frame_num_wrap + 1; // (8-31)
                e.top_long_term_pic_num = 2 * e.long_term_frame_idx;
                e.bottom_long_term_pic_num = 2 * e.long_term_frame_idx + 1;
            }
        }
    }

    /// Build the initial reference lists for the current picture, optionally
    /// skipping corrupted entries, then apply any list-modification
    /// commands so the result matches what a decoder derives.
    pub fn ref_pic_lists(
        &self,
        cfg: &H264DpbConfig,
        pic: &H264PictureDesc,
        list0_mods: &[vk::native::StdVideoEncodeH264RefListModEntry],
        skip_corrupted: bool,
    ) -> RefPicLists {
        let (mut l0, mut l1) = self.ref_pic_list_initialization(pic, skip_corrupted);

        if !skip_corrupted && !list0_mods.is_empty() {
            self.ref_pic_list_modification(cfg, pic, &mut l0, list0_mods);
        }

        let max_l0 = if pic.picture_type == FrameType::B {
            // Multiple L0 references give little for bipredicted pictures.
            1
        } else {
            cfg.num_ref_idx_l0_default_active as usize
        };
        l0.truncate(max_l0.max(1));
        l1.truncate((cfg.num_ref_idx_l1_default_active as usize).max(1));

        RefPicLists { l0, l1 }
    }

    // 8.2.4.2
    fn ref_pic_list_initialization(
        &self,
        pic: &H264PictureDesc,
        skip_corrupted: bool,
    ) -> (Vec<u8>, Vec<u8>) {
        match (pic.picture_type, pic.field_pic) {
            (FrameType::P, false) => (self.init_p_frame(skip_corrupted), Vec::new()),
            (FrameType::P, true) => (
                self.init_p_field(pic.bottom_field, skip_corrupted),
                Vec::new(),
            ),
            (FrameType::B, false) => self.init_b_frame(skip_corrupted),
            (FrameType::B, true) => self.init_b_field(pic, skip_corrupted),
            _ => (Vec::new(), Vec::new()),
        }
    }

    // 8.2.4.2.1
    fn init_p_frame(&self, skip_corrupted: bool) -> Vec<u8> {
        let mut l0 = self.sorted_desc(INF_MAX, skip_corrupted, |e| {
            e.is_frame_short().then_some(e.top_pic_num)
        });
        l0.extend(self.sorted_asc(INF_MIN, skip_corrupted, |e| {
            e.is_frame_long().then_some(e.top_long_term_pic_num)
        }));
        l0
    }

    // 8.2.4.2.2
    fn init_p_field(&self, bottom: bool, skip_corrupted: bool) -> Vec<u8> {
        let shorts = self.sorted_desc(INF_MAX, skip_corrupted, |e| {
            e.is_short().then_some(e.frame_num_wrap)
        });
        let longs = self.sorted_asc(INF_MIN, skip_corrupted, |e| {
            e.is_long().then_some(e.long_term_frame_idx)
        });
        let mut l0 = self.interleave_fields(&shorts, bottom);
        l0.extend(self.interleave_fields(&longs, bottom));
        l0
    }

    // 8.2.4.2.3
    fn init_b_frame(&self, skip_corrupted: bool) -> (Vec<u8>, Vec<u8>) {
        let curr_poc = self.entries[self.current].pic_order_cnt;

        let mut l0 = self.sorted_desc(curr_poc, skip_corrupted, |e| {
            e.is_frame_short().then_some(e.pic_order_cnt)
        });
        l0.extend(self.sorted_asc(curr_poc, skip_corrupted, |e| {
            e.is_frame_short().then_some(e.pic_order_cnt)
        }));
        l0.extend(self.sorted_asc(INF_MIN, skip_corrupted, |e| {
            e.is_frame_long().then_some(e.top_long_term_pic_num)
        }));

        let mut l1 = self.sorted_asc(curr_poc, skip_corrupted, |e| {
            e.is_frame_short().then_some(e.pic_order_cnt)
        });
        l1.extend(self.sorted_desc(curr_poc, skip_corrupted, |e| {
            e.is_frame_short().then_some(e.pic_order_cnt)
        }));
        l1.extend(self.sorted_asc(INF_MIN, skip_corrupted, |e| {
            e.is_frame_long().then_some(e.top_long_term_pic_num)
        }));

        Self::swap_if_identical(&mut l1, &l0);
        (l0, l1)
    }

    // 8.2.4.2.4
    fn init_b_field(&self, pic: &H264PictureDesc, skip_corrupted: bool) -> (Vec<u8>, Vec<u8>) {
        let cur = &self.entries[self.current];
        let curr_poc = if !pic.bottom_field {
            cur.top_foc
        } else {
            cur.bottom_foc
        };

        let mut frames0 = self.sorted_desc(curr_poc, skip_corrupted, |e| {
            e.is_short().then_some(e.pic_order_cnt)
        });
        frames0.extend(self.sorted_asc(curr_poc, skip_corrupted, |e| {
            e.is_short().then_some(e.pic_order_cnt)
        }));

        let mut frames1 = self.sorted_asc(curr_poc, skip_corrupted, |e| {
            e.is_short().then_some(e.pic_order_cnt)
        });
        frames1.extend(self.sorted_desc(curr_poc, skip_corrupted, |e| {
            e.is_short().then_some(e.pic_order_cnt)
        }));

        let longs = self.sorted_asc(INF_MIN, skip_corrupted, |e| {
            e.is_long().then_some(e.long_term_frame_idx)
        });

        let mut l0 = self.interleave_fields(&frames0, pic.bottom_field);
        l0.extend(self.interleave_fields(&longs, pic.bottom_field));
        let mut l1 = self.interleave_fields(&frames1, pic.bottom_field);
        l1.extend(self.interleave_fields(&longs, pic.bottom_field));

        Self::swap_if_identical(&mut l1, &l0);
        (l0, l1)
    }

    fn swap_if_identical(l1: &mut [u8], l0: &[u8]) {
        if l1.len() > 1 && l0 == &*l1 {
            l1.swap(0, 1);
        }
    }

    // 8.2.4.2.5: alternate same-parity and opposite-parity fields taken from
    // the ordered frame list.
    fn interleave_fields(&self, frames: &[u8], bottom_first: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(frames.len());
        let mut bottom = bottom_first;
        let mut k_top = 0usize;
        let mut k_bottom = 0usize;
        while k_top < frames.len() || k_bottom < frames.len() {
            if !bottom {
                while k_top < frames.len()
                    && self.entries[frames[k_top] as usize].top_field_marking == Marking::Unused
                {
                    k_top += 1;
                }
                if k_top < frames.len() {
                    out.push(frames[k_top]);
                    k_top += 1;
                }
            } else {
                while k_bottom < frames.len()
                    && self.entries[frames[k_bottom] as usize].bottom_field_marking
                        == Marking::Unused
                {
                    k_bottom += 1;
                }
                if k_bottom < frames.len() {
                    out.push(frames[k_bottom]);
                    k_bottom += 1;
                }
            }
            bottom = !bottom;
            if k_top >= frames.len() && k_bottom >= frames.len() {
                break;
            }
        }
        out
    }

    fn sorted_desc(
        &self,
        bound: i32,
        skip_corrupted: bool,
        key: impl Fn(&DpbEntryH264) -> Option<i32>,
    ) -> Vec<u8> {
        let mut candidates: Vec<(i32, u8)> = self.entries[..MAX_DPB_SLOTS]
            .iter()
            .enumerate()
            .filter(|(_, e)| !(skip_corrupted && e.corrupted))
            .filter_map(|(i, e)| key(e).map(|v| (v, i as u8)))
            .filter(|&(v, _)| v <= bound)
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        candidates.into_iter().map(|(_, i)| i).collect()
    }

    fn sorted_asc(
        &self,
        bound: i32,
        skip_corrupted: bool,
        key: impl Fn(&DpbEntryH264) -> Option<i32>,
    ) -> Vec<u8> {
        let mut candidates: Vec<(i32, u8)> = self.entries[..MAX_DPB_SLOTS]
            .iter()
            .enumerate()
            .filter(|(_, e)| !(skip_corrupted && e.corrupted))
            .filter_map(|(i, e)| key(e).map(|v| (v, i as u8)))
            .filter(|&(v, _)| v > bound)
            .collect();
        candidates.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        candidates.into_iter().map(|(_, i)| i).collect()
    }

    // 8.2.4.3: apply short-term list modification commands.
    fn ref_pic_list_modification(
        &self,
        cfg: &H264DpbConfig,
        pic: &H264PictureDesc,
        l0: &mut Vec<u8>,
        mods: &[vk::native::StdVideoEncodeH264RefListModEntry],
    ) {
        use vk::native::*;

        let max_pic_num = cfg.max_frame_num();
        let mut pic_num_pred = pic.frame_num as i32 % max_pic_num;
        let mut ref_idx = 0usize;

        for m in mods {
            let pic_num_no_wrap = match m.modification_of_pic_nums_idc {
                StdVideoH264ModificationOfPicNumsIdc_STD_VIDEO_H264_MODIFICATION_OF_PIC_NUMS_IDC_SHORT_TERM_SUBTRACT => {
                    let d = m.abs_diff_pic_num_minus1 as i32 + 1;
                    if pic_num_pred - d < 0 {
                        pic_num_pred - d + max_pic_num
                    } else {
                        pic_num_pred - d
                    }
                }
                StdVideoH264ModificationOfPicNumsIdc_STD_VIDEO_H264_MODIFICATION_OF_PIC_NUMS_IDC_SHORT_TERM_ADD => {
                    let d = m.abs_diff_pic_num_minus1 as i32 + 1;
                    if pic_num_pred + d >= max_pic_num {
                        pic_num_pred + d - max_pic_num
                    } else {
                        pic_num_pred + d
                    }
                }
                _ => break,
            };
            pic_num_pred = pic_num_no_wrap;
            let pic_num = if pic_num_no_wrap > pic.frame_num as i32 {
                pic_num_no_wrap - max_pic_num
            } else {
                pic_num_no_wrap
            };

            if let Some(found) = self.entries[..MAX_DPB_SLOTS]
                .iter()
                .position(|e| e.is_frame_short() && e.top_pic_num == pic_num)
            {
                let found = found as u8;
                if let Some(at) = l0.iter().position(|&x| x == found) {
                    l0.remove(at);
                }
                let at = ref_idx.min(l0.len());
                l0.insert(at, found);
                ref_idx += 1;
            }
        }
    }

    /// Synthesize the L0 modification commands that keep only non-corrupted
    /// references, so a decoder derives the same cleaned-up list.
    pub fn reordering_commands(
        &self,
        cfg: &H264DpbConfig,
        pic: &H264PictureDesc,
    ) -> Vec<vk::native::StdVideoEncodeH264RefListModEntry> {
        use vk::native::*;

        let mut ops = Vec::new();
        if !self.need_to_reorder() {
            return ops;
        }

        let clean = self.ref_pic_list_initialization(pic, true).0;
        let max_pic_num = self.max_pic_num(cfg);
        let mut pic_num_pred = pic.frame_num as i32 % max_pic_num;

        let (num_short, _) = self.num_ref_frames();
        if num_short > 0 {
            for &idx in &clean {
                let pic_num = self.entries[idx as usize].top_pic_num;
                let diff = pic_num - pic_num_pred;
                let mut entry: StdVideoEncodeH264RefListModEntry =
                    unsafe { std::mem::zeroed() };
                if diff <= 0 {
                    entry.modification_of_pic_nums_idc =
                        StdVideoH264ModificationOfPicNumsIdc_STD_VIDEO_H264_MODIFICATION_OF_PIC_NUMS_IDC_SHORT_TERM_SUBTRACT;
                    entry.abs_diff_pic_num_minus1 = if diff == 0 {
                        (max_pic_num - 1) as u16
                    } else {
                        (-diff - 1) as u16
                    };
                } else {
                    entry.modification_of_pic_nums_idc =
                        StdVideoH264ModificationOfPicNumsIdc_STD_VIDEO_H264_MODIFICATION_OF_PIC_NUMS_IDC_SHORT_TERM_ADD;
                    entry.abs_diff_pic_num_minus1 = (diff - 1) as u16;
                }
                ops.push(entry);
                pic_num_pred = pic_num;
            }
        }

        let mut end: StdVideoEncodeH264RefListModEntry = unsafe { std::mem::zeroed() };
        end.modification_of_pic_nums_idc =
            StdVideoH264ModificationOfPicNumsIdc_STD_VIDEO_H264_MODIFICATION_OF_PIC_NUMS_IDC_END;
        ops.push(end);
        ops
    }

    fn max_pic_num(&self, cfg: &H264DpbConfig) -> i32 {
        cfg.max_frame_num()
    }

    /// Any active reference flagged corrupted forces list reordering.
    pub fn need_to_reorder(&self) -> bool {
        self.entries[..MAX_DPB_SLOTS]
            .iter()
            .any(|e| e.is_active_reference() && e.corrupted)
    }

    /// Flag every reference admitted since `timestamp` as corrupted.
    pub fn invalidate_references(&mut self, timestamp: u64) {
        for e in &mut self.entries[..MAX_DPB_SLOTS] {
            if e.is_active_reference() && e.timestamp >= timestamp {
                e.corrupted = true;
            }
        }
    }

    pub fn mark_corrupted(&mut self, dpb_idx: usize) {
        if let Some(e) = self.entries.get_mut(dpb_idx) {
            e.corrupted = true;
        }
    }

    pub fn num_ref_frames(&self) -> (u32, u32) {
        let mut short = 0;
        let mut long = 0;
        for e in &self.entries[..MAX_DPB_SLOTS] {
            if e.is_short() {
                short += 1;
            }
            if e.is_long() {
                long += 1;
            }
        }
        (short, long)
    }

    /// Current picture's coded frame_num / POC after any MMCO rebasing.
    pub fn current_frame_num_poc(&self) -> (u32, i32) {
        let cur = &self.entries[self.current];
        (cur.frame_num, cur.pic_order_cnt)
    }

    pub fn entry(&self, dpb_idx: usize) -> Option<&DpbEntryH264> {
        self.entries.get(dpb_idx)
    }

    pub fn image(&self, dpb_idx: usize) -> Option<ImageHandle> {
        self.entries.get(dpb_idx).and_then(|e| e.image.clone())
    }

    pub fn timestamp(&self, dpb_idx: usize) -> u64 {
        self.entries[dpb_idx].timestamp
    }

    /// Bitmask of slots holding active references.
    pub fn used_slots_mask(&self) -> u32 {
        let mut mask = 0;
        for (i, e) in self.entries[..MAX_DPB_SLOTS].iter().enumerate() {
            if e.is_active_reference() {
                mask |= 1 << i;
            }
        }
        mask
    }

    pub fn fill_std_reference_info(
        &self,
        dpb_idx: usize,
    ) -> vk::native::StdVideoEncodeH264ReferenceInfo {
        let e = &self.entries[dpb_idx];
        let long_term = e.is_frame_long();
        vk::native::StdVideoEncodeH264ReferenceInfo {
            flags: vk::native::StdVideoEncodeH264ReferenceInfoFlags {
                _bitfield_align_1: [],
                _bitfield_1: vk::native::StdVideoEncodeH264ReferenceInfoFlags::new_bitfield_1(
                    0,
                    long_term as u32,
                ),
            },
            primary_pic_type: vk::native::StdVideoH264PictureType_STD_VIDEO_H264_PICTURE_TYPE_P,
            FrameNum: e.frame_num,
            PicOrderCnt: e.pic_order_cnt,
            long_term_pic_num: if long_term { e.top_long_term_pic_num as u16 } else { 0 },
            long_term_frame_idx: if long_term { e.long_term_frame_idx as u16 } else { 0 },
            temporal_id: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(max_refs: u32) -> H264DpbConfig {
        H264DpbConfig {
            max_num_ref_frames: max_refs,
            log2_max_frame_num: 8,
            log2_max_pic_order_cnt_lsb: 8,
            poc_type: PocType::Type0,
            gaps_in_frame_num_allowed: true,
            num_ref_idx_l0_default_active: 16,
            num_ref_idx_l1_default_active: 16,
        }
    }

    fn frame(frame_num: u32, poc_lsb: i32, ty: FrameType, is_ref: bool) -> H264PictureDesc {
        H264PictureDesc {
            picture_type: ty,
            frame_num,
            pic_order_cnt_lsb: poc_lsb,
            idr: ty == FrameType::Idr,
            is_reference: is_ref,
            field_pic: false,
            bottom_field: false,
            long_term_reference: false,
            adaptive_ref_pic_marking: false,
            no_output_of_prior_pics: false,
            timestamp: frame_num as u64,
        }
    }

    fn admit(dpb: &mut H264Dpb, cfg: &H264DpbConfig, pic: &H264PictureDesc) -> usize {
        dpb.picture_start(cfg, pic).unwrap();
        dpb.picture_end(cfg, pic, None, &[]).unwrap()
    }

    #[test]
    fn idr_clears_all_markings() {
        let cfg = cfg(4);
        let mut dpb = H264Dpb::new();
        admit(&mut dpb, &cfg, &frame(0, 0, FrameType::Idr, true));
        admit(&mut dpb, &cfg, &frame(1, 2, FrameType::P, true));
        admit(&mut dpb, &cfg, &frame(2, 4, FrameType::P, true));
        assert_eq!(dpb.num_ref_frames(), (3, 0));

        admit(&mut dpb, &cfg, &frame(0, 0, FrameType::Idr, true));
        assert_eq!(dpb.num_ref_frames(), (1, 0));
    }

    #[test]
    fn sliding_window_keeps_exactly_max_refs() {
        // IPPP with max_num_ref_frames = 3 over a ten-frame sequence.
        let cfg = cfg(3);
        let mut dpb = H264Dpb::new();
        admit(&mut dpb, &cfg, &frame(0, 0, FrameType::Idr, true));
        for n in 1..10u32 {
            admit(&mut dpb, &cfg, &frame(n, 2 * n as i32, FrameType::P, true));
            let (short, long) = dpb.num_ref_frames();
            assert!(short + long <= 3, "frame {n}: {short}+{long}");
            if n >= 2 {
                assert_eq!(short + long, 3, "frame {n}");
            }
        }

        // The three survivors are the most recent frames (largest
        // frameNumWrap values survived each eviction).
        let mut frame_nums: Vec<u32> = (0..MAX_DPB_SLOTS)
            .filter(|&i| dpb.entry(i).unwrap().is_active_reference())
            .map(|i| dpb.entry(i).unwrap().frame_num())
            .collect();
        frame_nums.sort_unstable();
        assert_eq!(frame_nums, vec![7, 8, 9]);
    }

    #[test]
    fn frame_num_gaps_synthesize_references() {
        // Skip frame_num 3 and 4; the gap entries must run the sliding
        // window and keep the DPB at capacity.
        let cfg = cfg(3);
        let mut dpb = H264Dpb::new();
        admit(&mut dpb, &cfg, &frame(0, 0, FrameType::Idr, true));
        admit(&mut dpb, &cfg, &frame(1, 2, FrameType::P, true));
        admit(&mut dpb, &cfg, &frame(2, 4, FrameType::P, true));
        admit(&mut dpb, &cfg, &frame(5, 10, FrameType::P, true));

        let (short, long) = dpb.num_ref_frames();
        assert_eq!(short + long, 3);
        let mut frame_nums: Vec<u32> = (0..MAX_DPB_SLOTS)
            .filter(|&i| dpb.entry(i).unwrap().is_active_reference())
            .map(|i| dpb.entry(i).unwrap().frame_num())
            .collect();
        frame_nums.sort_unstable();
        // 3 and 4 were synthesized; sliding window evicted 1 and 2.
        assert_eq!(frame_nums, vec![3, 4, 5]);
    }

    #[test]
    fn p_list_sorted_by_descending_pic_num() {
        let cfg = cfg(4);
        let mut dpb = H264Dpb::new();
        admit(&mut dpb, &cfg, &frame(0, 0, FrameType::Idr, true));
        admit(&mut dpb, &cfg, &frame(1, 2, FrameType::P, true));
        admit(&mut dpb, &cfg, &frame(2, 4, FrameType::P, true));

        let pic = frame(3, 6, FrameType::P, true);
        let mut probe = dpb.clone();
        probe.picture_start(&cfg, &pic).unwrap();
        let lists = probe.ref_pic_lists(&cfg, &pic, &[], false);
        let pic_nums: Vec<u32> = lists
            .l0
            .iter()
            .map(|&i| probe.entry(i as usize).unwrap().frame_num())
            .collect();
        assert_eq!(pic_nums, vec![2, 1, 0]);
        assert!(lists.l1.is_empty());
    }

    #[test]
    fn b_lists_split_around_current_poc() {
        let cfg = cfg(4);
        let mut dpb = H264Dpb::new();
        // POCs 0 and 6 admitted, B at POC 2.
        admit(&mut dpb, &cfg, &frame(0, 0, FrameType::Idr, true));
        admit(&mut dpb, &cfg, &frame(1, 6, FrameType::P, true));

        let pic = frame(2, 2, FrameType::B, false);
        let mut probe = dpb.clone();
        probe.picture_start(&cfg, &pic).unwrap();
        let lists = probe.ref_pic_lists(&cfg, &pic, &[], false);

        let poc = |i: &u8| probe.entry(*i as usize).unwrap().pic_order_cnt();
        assert_eq!(lists.l0.first().map(poc), Some(0));
        assert_eq!(lists.l1.first().map(poc), Some(6));
    }

    #[test]
    fn corrupted_reference_triggers_reorder_commands() {
        let cfg = cfg(4);
        let mut dpb = H264Dpb::new();
        admit(&mut dpb, &cfg, &frame(0, 0, FrameType::Idr, true));
        let slot = admit(&mut dpb, &cfg, &frame(1, 2, FrameType::P, true));
        admit(&mut dpb, &cfg, &frame(2, 4, FrameType::P, true));

        assert!(!dpb.need_to_reorder());
        dpb.mark_corrupted(slot);
        assert!(dpb.need_to_reorder());

        let pic = frame(3, 6, FrameType::P, true);
        let mut probe = dpb.clone();
        probe.picture_start(&cfg, &pic).unwrap();
        let ops = probe.reordering_commands(&cfg, &pic);
        // At least one modification plus the end marker.
        assert!(ops.len() > 1);

        // The cleaned-up list excludes the corrupted slot.
        let lists = probe.ref_pic_lists(&cfg, &pic, &[], true);
        assert!(!lists.l0.contains(&(slot as u8)));
    }

    #[test]
    fn mmco_unmark_short_term() {
        use vk::native::*;

        let cfg = cfg(4);
        let mut dpb = H264Dpb::new();
        admit(&mut dpb, &cfg, &frame(0, 0, FrameType::Idr, true));
        admit(&mut dpb, &cfg, &frame(1, 2, FrameType::P, true));

        // MMCO 1: unmark frame_num 0 (difference_of_pic_nums_minus1 = 1).
        let mut op: StdVideoEncodeH264RefPicMarkingEntry = unsafe { std::mem::zeroed() };
        op.memory_management_control_operation =
            StdVideoH264MemMgmtControlOp_STD_VIDEO_H264_MEM_MGMT_CONTROL_OP_UNMARK_SHORT_TERM;
        op.difference_of_pic_nums_minus1 = 1;
        let mut end: StdVideoEncodeH264RefPicMarkingEntry = unsafe { std::mem::zeroed() };
        end.memory_management_control_operation =
            StdVideoH264MemMgmtControlOp_STD_VIDEO_H264_MEM_MGMT_CONTROL_OP_END;

        let mut pic = frame(2, 4, FrameType::P, true);
        pic.adaptive_ref_pic_marking = true;
        dpb.picture_start(&cfg, &pic).unwrap();
        dpb.picture_end(&cfg, &pic, None, &[op, end]).unwrap();

        let frame_nums: Vec<u32> = (0..MAX_DPB_SLOTS)
            .filter(|&i| dpb.entry(i).unwrap().is_active_reference())
            .map(|i| dpb.entry(i).unwrap().frame_num())
            .collect();
        assert!(!frame_nums.contains(&0));
        assert!(frame_nums.contains(&1));
        assert!(frame_nums.contains(&2));
    }

    #[test]
    fn mmco_mark_current_long_term() {
        use vk::native::*;

        let cfg = cfg(4);
        let mut dpb = H264Dpb::new();
        admit(&mut dpb, &cfg, &frame(0, 0, FrameType::Idr, true));

        let mut mark: StdVideoEncodeH264RefPicMarkingEntry = unsafe { std::mem::zeroed() };
        mark.memory_management_control_operation =
            StdVideoH264MemMgmtControlOp_STD_VIDEO_H264_MEM_MGMT_CONTROL_OP_SET_MAX_LONG_TERM_INDEX;
        mark.max_long_term_frame_idx_plus1 = 1;
        let mut cur_long: StdVideoEncodeH264RefPicMarkingEntry = unsafe { std::mem::zeroed() };
        cur_long.memory_management_control_operation =
            StdVideoH264MemMgmtControlOp_STD_VIDEO_H264_MEM_MGMT_CONTROL_OP_MARK_CURRENT_AS_LONG_TERM;
        cur_long.long_term_frame_idx = 0;
        let mut end: StdVideoEncodeH264RefPicMarkingEntry = unsafe { std::mem::zeroed() };
        end.memory_management_control_operation =
            StdVideoH264MemMgmtControlOp_STD_VIDEO_H264_MEM_MGMT_CONTROL_OP_END;

        let mut pic = frame(1, 2, FrameType::P, true);
        pic.adaptive_ref_pic_marking = true;
        dpb.picture_start(&cfg, &pic).unwrap();
        let slot = dpb.picture_end(&cfg, &pic, None, &[mark, cur_long, end]).unwrap();

        let e = dpb.entry(slot).unwrap();
        assert_eq!(e.top_field_marking, Marking::LongTerm);
        assert_eq!(e.bottom_field_marking, Marking::LongTerm);
        let info = dpb.fill_std_reference_info(slot);
        assert_eq!(info.FrameNum, 1);
    }

    #[test]
    fn field_pair_shares_one_slot() {
        let cfg = cfg(4);
        let mut dpb = H264Dpb::new();
        admit(&mut dpb, &cfg, &frame(0, 0, FrameType::Idr, true));

        let mut top = frame(1, 2, FrameType::P, true);
        top.field_pic = true;
        let slot_top = admit(&mut dpb, &cfg, &top);

        let mut bottom = top;
        bottom.bottom_field = true;
        let slot_bottom = admit(&mut dpb, &cfg, &bottom);

        assert_eq!(slot_top, slot_bottom);
        let (short, _) = dpb.num_ref_frames();
        assert_eq!(short, 2);
    }
}

