//! GOP structure sequencing.
//!
//! Maps a monotonic input-frame stream onto picture types and encode order
//! for an arbitrary (gop length, IDR period, consecutive-B count) structure,
//! including the irregular tail runs before IDR boundaries, closed-GOP
//! boundaries and the end of the stream.

use std::fmt;

/// Picture type produced by the sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    P,
    B,
    I,
    Idr,
    IntraRefresh,
}

impl FrameType {
    pub fn name(self) -> &'static str {
        match self {
            FrameType::P => "P",
            FrameType::B => "B",
            FrameType::I => "I",
            FrameType::Idr => "IDR",
            FrameType::IntraRefresh => "INTRA_REFRESH",
        }
    }

    /// Intra-coded picture types start a new prediction chain.
    pub fn is_intra(self) -> bool {
        matches!(self, FrameType::I | FrameType::Idr | FrameType::IntraRefresh)
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-position flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GopFlags(u32);

impl GopFlags {
    /// The frame is a reference.
    pub const IS_REF: GopFlags = GopFlags(1 << 0);
    /// Last reference of a closed GOP (promoted anchors and IDRs).
    pub const CLOSE_GOP: GopFlags = GopFlags(1 << 1);
    /// Part of an irregular GOP tail (truncated B-run or promoted anchor).
    pub const NONUNIFORM_GOP: GopFlags = GopFlags(1 << 2);

    pub fn contains(self, other: GopFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: GopFlags) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for GopFlags {
    type Output = GopFlags;

    fn bitor(self, rhs: GopFlags) -> GopFlags {
        GopFlags(self.0 | rhs.0)
    }
}

/// Mutable sequencing state. All fields are counted from the most recent
/// IDR and reset whenever one is produced.
#[derive(Debug, Clone, Default)]
pub struct GopState {
    pub position_in_input_order: u32,
    pub last_ref_in_input_order: u32,
    pub last_ref_in_encode_order: u32,
    started: bool,
}

/// The position of one input frame within the GOP structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GopPosition {
    /// Input (display) order within the IDR sequence.
    pub input_order: u32,
    /// Encode order within the IDR sequence.
    pub encode_order: u32,
    /// Position within the current GOP cycle, in input order.
    pub in_gop: u8,
    /// Length of the containing B-run, -1 for non-B pictures.
    pub num_b_frames: i8,
    /// Position inside the B-run, -1 for non-B pictures.
    pub b_frame_pos: i8,
    pub picture_type: FrameType,
    pub flags: GopFlags,
}

impl Default for GopPosition {
    fn default() -> Self {
        GopPosition::new(0)
    }
}

impl GopPosition {
    fn new(input_order: u32) -> Self {
        GopPosition {
            input_order,
            encode_order: 0,
            in_gop: 0,
            num_b_frames: -1,
            b_frame_pos: -1,
            picture_type: FrameType::P,
            flags: GopFlags::default(),
        }
    }

    pub fn is_reference(&self) -> bool {
        self.flags.contains(GopFlags::IS_REF)
    }
}

/// Immutable GOP structure configuration.
#[derive(Debug, Clone)]
pub struct GopStructure {
    gop_frame_count: u8,
    consecutive_b_frame_count: u8,
    idr_period: u32,
    temporal_layer_count: u8,
    closed_gop: bool,
    pre_idr_anchor_type: FrameType,
    last_frame_type: FrameType,
}

impl GopStructure {
    pub fn new(
        gop_frame_count: u8,
        idr_period: u32,
        consecutive_b_frame_count: u8,
        temporal_layer_count: u8,
        last_frame_type: FrameType,
        pre_idr_anchor_type: FrameType,
        closed_gop: bool,
    ) -> Self {
        debug_assert!(gop_frame_count > 0);
        GopStructure {
            gop_frame_count,
            consecutive_b_frame_count,
            idr_period,
            temporal_layer_count,
            closed_gop,
            pre_idr_anchor_type,
            last_frame_type,
        }
    }

    pub fn gop_frame_count(&self) -> u8 {
        self.gop_frame_count
    }

    pub fn consecutive_b_frame_count(&self) -> u8 {
        self.consecutive_b_frame_count
    }

    /// 0 means an unbounded sequence with a single leading IDR.
    pub fn idr_period(&self) -> u32 {
        self.idr_period
    }

    pub fn temporal_layer_count(&self) -> u8 {
        self.temporal_layer_count
    }

    pub fn is_closed_gop(&self) -> bool {
        self.closed_gop
    }

    /// Clamp the structure to a known stream length.
    pub fn clamp_to_stream_length(&mut self, num_frames: u64) {
        self.gop_frame_count = self.gop_frame_count.min(num_frames.min(255) as u8);
        if self.idr_period > 0 {
            self.idr_period = self.idr_period.min(num_frames.min(u32::MAX as u64) as u32);
        }
    }

    /// Number of DPB slots the structure needs: one forward anchor plus one
    /// backward anchor per active B-run, plus the working picture.
    pub fn required_dpb_size(&self) -> usize {
        if self.consecutive_b_frame_count > 0 { 3 } else { 2 }
    }

    /// Advance `state` by one input frame and return its position.
    ///
    /// `frames_left` counts the current frame and everything after it;
    /// the sequencer uses it to terminate B-runs that would otherwise run
    /// past the end of the stream. Returns `(position, starts_idr_sequence)`.
    pub fn position(&self, state: &mut GopState, frames_left: u32) -> (GopPosition, bool) {
        let mut pos = GopPosition::new(state.position_in_input_order);

        let first_frame = !state.started;
        state.started = true;

        if first_frame
            || (self.idr_period > 0 && state.position_in_input_order % self.idr_period == 0)
        {
            pos.picture_type = FrameType::Idr;
            pos.input_order = 0;
            pos.encode_order = 0;
            pos.flags.insert(GopFlags::IS_REF | GopFlags::CLOSE_GOP);
            state.last_ref_in_input_order = 0;
            state.last_ref_in_encode_order = 0;
            state.position_in_input_order = 1;
            return (pos, true);
        }

        let p = state.position_in_input_order;
        let gop = u32::from(self.gop_frame_count);
        let b_count = u32::from(self.consecutive_b_frame_count);
        pos.input_order = p;
        pos.in_gop = (p % gop) as u8;

        let in_gop = p % gop;
        if in_gop == 0 {
            pos.picture_type = FrameType::I;
        } else if in_gop % (b_count + 1) == 0 {
            pos.picture_type = FrameType::P;
        } else {
            self.classify_b_candidate(state, frames_left, &mut pos);
        }

        if frames_left == 1 && pos.picture_type == FrameType::P {
            pos.picture_type = self.last_frame_type;
        }

        if pos.picture_type == FrameType::B {
            pos.encode_order = p + 1;
            pos.b_frame_pos = (p - state.last_ref_in_input_order - 1) as i8;
        } else {
            // A reference follows the B-run that displays before it.
            pos.encode_order = state.last_ref_in_input_order + 1;
            pos.flags.insert(GopFlags::IS_REF);
            state.last_ref_in_input_order = p;
            state.last_ref_in_encode_order = pos.encode_order;
        }

        state.position_in_input_order += 1;
        (pos, false)
    }

    /// Decide what a would-be B frame actually is: a plain B, a B in a
    /// truncated tail run, or the promoted anchor terminating the run.
    fn classify_b_candidate(&self, state: &mut GopState, frames_left: u32, pos: &mut GopPosition) {
        let p = state.position_in_input_order;
        let gop = u32::from(self.gop_frame_count);
        let b_count = u32::from(self.consecutive_b_frame_count);
        let last_ref = state.last_ref_in_input_order;

        // A B-run needs a forward anchor it can reference. Boundaries an
        // anchor may not cross: the next IDR, the start of the next closed
        // GOP, and the end of the stream.
        let mut boundary = p.saturating_add(frames_left);
        if self.idr_period > 0 {
            boundary = boundary.min(p + (self.idr_period - p % self.idr_period));
        }
        if self.closed_gop {
            boundary = boundary.min(p + (gop - p % gop));
        }

        // Nearest following position that the plain rules would make a
        // reference: a P at the next (b_count+1) cycle position, or the I
        // opening the next GOP. One of the two occurs within b_count+1 steps.
        let mut anchor = boundary;
        for q in (p + 1)..=(p + b_count + 1) {
            if q % gop == 0 || (q % gop) % (b_count + 1) == 0 {
                anchor = q;
                break;
            }
        }

        if anchor < boundary {
            pos.picture_type = FrameType::B;
            pos.num_b_frames = (anchor - last_ref - 1) as i8;
        } else if p + 1 == boundary {
            // The slot just before the boundary is promoted to an anchor so
            // that the shortened run in front of it still has a forward
            // reference.
            pos.picture_type = if frames_left == 1 {
                self.last_frame_type
            } else {
                self.pre_idr_anchor_type
            };
            pos.flags.insert(GopFlags::CLOSE_GOP | GopFlags::NONUNIFORM_GOP);
            return;
        } else {
            pos.picture_type = FrameType::B;
            pos.num_b_frames = (boundary - last_ref - 2) as i8;
        }

        if pos.num_b_frames != self.consecutive_b_frame_count as i8 {
            pos.flags.insert(GopFlags::NONUNIFORM_GOP);
        }
    }
}
