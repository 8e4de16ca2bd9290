//! AV1 decoded picture buffer.
//!
//! AV1 names its references (LAST..ALTREF) through a level of indirection:
//! each name maps to one of eight virtual buffers, and each virtual buffer
//! maps to a reconstructed picture slot. Coding a frame refreshes a subset
//! of the virtual buffers (refresh_frame_flags) and may rotate the name →
//! buffer mapping so that, for example, the newest picture always answers
//! to LAST.

use crate::config::TuningMode;
use crate::gop::FrameType;
use crate::pool::ImageHandle;

use super::DpbError;

/// Number of virtual reference buffers in the AV1 frame header.
pub const NUM_REF_FRAMES: usize = 8;
/// Number of nameable references per frame (LAST..ALTREF).
pub const REFS_PER_FRAME: usize = 7;
/// Reconstruction slots: the eight virtual buffers plus in-flight pictures.
pub const BUFFER_POOL_MAX_SIZE: usize = 10;

pub const ORDER_HINT_BITS: u32 = 7;
/// primary_ref_frame value meaning "no CDF inheritance".
pub const PRIMARY_REF_NONE: u8 = 7;

const INVALID: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Av1FrameType {
    #[default]
    Key,
    Inter,
    IntraOnly,
    Switch,
}

impl Av1FrameType {
    pub fn is_intra(self) -> bool {
        matches!(self, Av1FrameType::Key | Av1FrameType::IntraOnly)
    }
}

/// AV1 reference names. The discriminants match the frame-header encoding
/// (0 = INTRA_FRAME .. 7 = ALTREF_FRAME).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Av1ReferenceName {
    Intra = 0,
    Last = 1,
    Last2 = 2,
    Last3 = 3,
    Golden = 4,
    Bwdref = 5,
    Altref2 = 6,
    Altref = 7,
}

impl Av1ReferenceName {
    pub const INTER_NAMES: [Av1ReferenceName; REFS_PER_FRAME] = [
        Av1ReferenceName::Last,
        Av1ReferenceName::Last2,
        Av1ReferenceName::Last3,
        Av1ReferenceName::Golden,
        Av1ReferenceName::Bwdref,
        Av1ReferenceName::Altref2,
        Av1ReferenceName::Altref,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Zero-based index into per-frame reference arrays (LAST = 0).
    pub fn inter_index(self) -> usize {
        debug_assert!(self != Av1ReferenceName::Intra);
        self as usize - 1
    }

    pub fn from_index(i: usize) -> Option<Av1ReferenceName> {
        match i {
            0 => Some(Av1ReferenceName::Intra),
            1 => Some(Av1ReferenceName::Last),
            2 => Some(Av1ReferenceName::Last2),
            3 => Some(Av1ReferenceName::Last3),
            4 => Some(Av1ReferenceName::Golden),
            5 => Some(Av1ReferenceName::Bwdref),
            6 => Some(Av1ReferenceName::Altref2),
            7 => Some(Av1ReferenceName::Altref),
            _ => None,
        }
    }
}

/// Update classes a coded frame falls into, derived from its reference
/// name and overlay status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameUpdateType {
    Kf,
    Lf,
    Gf,
    Arf,
    Overlay,
    IntnlOverlay,
    IntnlArf,
    Bwd,
    None,
}

/// Primary-reference classes used to track CDF ancestry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum PrimaryRefType {
    Regular = 0,
    Arf = 1,
    Overlay = 2,
    Gld = 3,
    Brf = 4,
    IntArf = 5,
}

const MAX_PRI_REF_TYPES: usize = 6;

/// The subset of `VkVideoEncodeAV1CapabilitiesKHR` the reference logic
/// depends on. Masks are indexed by (reference name - LAST).
#[derive(Debug, Clone, Copy)]
pub struct Av1ReferenceCaps {
    pub max_single_reference_count: u32,
    pub single_reference_name_mask: u32,
    pub max_unidirectional_compound_reference_count: u32,
    pub max_unidirectional_compound_group1_reference_count: u32,
    pub unidirectional_compound_reference_name_mask: u32,
    pub max_bidirectional_compound_reference_count: u32,
    pub max_bidirectional_compound_group1_reference_count: u32,
    pub max_bidirectional_compound_group2_reference_count: u32,
    pub bidirectional_compound_reference_name_mask: u32,
}

impl Default for Av1ReferenceCaps {
    fn default() -> Self {
        // Everything allowed; real values come from the capability query.
        Av1ReferenceCaps {
            max_single_reference_count: 1,
            single_reference_name_mask: 0x7f,
            max_unidirectional_compound_reference_count: 2,
            max_unidirectional_compound_group1_reference_count: 2,
            unidirectional_compound_reference_name_mask: 0x7f,
            max_bidirectional_compound_reference_count: 2,
            max_bidirectional_compound_group1_reference_count: 1,
            max_bidirectional_compound_group2_reference_count: 1,
            bidirectional_compound_reference_name_mask: 0x7f,
        }
    }
}

/// Prediction structure the assembled frame will use, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Av1PredictionMode {
    BidirectionalCompound,
    UnidirectionalCompound,
    SingleReference,
    IntraOnly,
}

/// Reference info serialized into the hardware DPB slot descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Av1ReferenceInfo {
    pub ref_frame_id: u32,
    pub frame_type: Av1FrameType,
    pub order_hint: u8,
}

#[derive(Debug, Default, Clone)]
struct DpbEntryAv1 {
    ref_count: u32,
    frame_id: u32,
    pic_order_cnt: u32,
    frame_type: Av1FrameType,
    ref_name: Option<Av1ReferenceName>,
    corrupted: bool,
    image: Option<ImageHandle>,
    timestamp: u64,
}

#[derive(Debug, Clone)]
pub struct Av1Dpb {
    dpb: Vec<DpbEntryAv1>,
    max_dpb_size: usize,
    caps: Av1ReferenceCaps,

    max_ref_frames_l0: usize,
    max_ref_frames_l1: usize,
    num_ref_frames_l0: usize,
    num_ref_frames_l1: usize,

    num_refs_in_group1: usize,
    num_refs_in_group2: usize,
    refs_in_group1: [usize; REFS_PER_FRAME],
    refs_in_group2: [usize; REFS_PER_FRAME],

    /// reference name (minus LAST) → dpb index for the current picture.
    ref_name_to_dpb: [i32; REFS_PER_FRAME],
    /// reference name → virtual buffer id.
    ref_buf_id_map: [i32; NUM_REF_FRAMES],
    /// virtual buffer id → dpb index.
    ref_frame_dpb_id_map: [i32; NUM_REF_FRAMES],
    primary_ref_buf_id_map: [i32; MAX_PRI_REF_TYPES],
    primary_ref_dpb_idx: i32,
    ref_buf_update_flag: u32,
    last_last_ref_name_in_use: Option<Av1ReferenceName>,

    last_key_frame_timestamp: u64,
}

impl Default for Av1Dpb {
    fn default() -> Self {
        Av1Dpb {
            dpb: vec![DpbEntryAv1::default(); BUFFER_POOL_MAX_SIZE + 1],
            max_dpb_size: 0,
            caps: Av1ReferenceCaps::default(),
            max_ref_frames_l0: 0,
            max_ref_frames_l1: 0,
            num_ref_frames_l0: 0,
            num_ref_frames_l1: 0,
            num_refs_in_group1: 0,
            num_refs_in_group2: 0,
            refs_in_group1: [0; REFS_PER_FRAME],
            refs_in_group2: [0; REFS_PER_FRAME],
            ref_name_to_dpb: [INVALID; REFS_PER_FRAME],
            ref_buf_id_map: [INVALID; NUM_REF_FRAMES],
            ref_frame_dpb_id_map: [INVALID; NUM_REF_FRAMES],
            primary_ref_buf_id_map: [INVALID; MAX_PRI_REF_TYPES],
            primary_ref_dpb_idx: INVALID,
            ref_buf_update_flag: 0,
            last_last_ref_name_in_use: None,
            last_key_frame_timestamp: 0,
        }
    }
}

impl Av1Dpb {
    pub fn new() -> Self {
        Av1Dpb::default()
    }

    pub fn sequence_start(
        &mut self,
        caps: &Av1ReferenceCaps,
        max_dpb_size: usize,
        num_b_frames: u32,
        _tuning: TuningMode,
        _quality_level: u32,
    ) {
        // TODO: derive the L0/L1 caps from tuning mode and quality level
        // instead of the fixed 4/3 split.
        *self = Av1Dpb::default();
        debug_assert!(max_dpb_size <= BUFFER_POOL_MAX_SIZE);
        debug_assert!(max_dpb_size >= NUM_REF_FRAMES);
        self.max_dpb_size = max_dpb_size.min(BUFFER_POOL_MAX_SIZE);
        self.caps = *caps;

        self.max_ref_frames_l0 = 4;
        self.max_ref_frames_l1 = 3;

        for i in 0..NUM_REF_FRAMES {
            self.ref_buf_id_map[i] = i as i32;
        }

        self.last_last_ref_name_in_use = Some(if num_b_frames == 0 {
            Av1ReferenceName::Golden
        } else {
            Av1ReferenceName::Last3
        });
    }

    pub fn max_dpb_size(&self) -> usize {
        self.max_dpb_size
    }

    /// Pick the reference name of a new picture. An explicit request mask
    /// (bits by reference name) wins; plain references become LAST and
    /// non-reference pictures stay unnamed.
    pub fn assign_reference_name(
        &self,
        picture_type: FrameType,
        requested_names: u32,
        is_reference: bool,
    ) -> Option<Av1ReferenceName> {
        if picture_type == FrameType::Idr
            || requested_names & (1 << Av1ReferenceName::Intra.index()) != 0
        {
            Some(Av1ReferenceName::Intra)
        } else if requested_names & (1 << Av1ReferenceName::Altref.index()) != 0 {
            Some(Av1ReferenceName::Altref)
        } else if requested_names & (1 << Av1ReferenceName::Altref2.index()) != 0 {
            Some(Av1ReferenceName::Altref2)
        } else if requested_names & (1 << Av1ReferenceName::Bwdref.index()) != 0 {
            Some(Av1ReferenceName::Bwdref)
        } else if requested_names & (1 << Av1ReferenceName::Golden.index()) != 0 {
            Some(Av1ReferenceName::Golden)
        } else if is_reference {
            Some(Av1ReferenceName::Last)
        } else {
            None
        }
    }

    pub fn frame_update_type(
        &self,
        ref_name: Option<Av1ReferenceName>,
        overlay: bool,
    ) -> FrameUpdateType {
        match ref_name {
            Some(Av1ReferenceName::Altref2) => {
                if overlay {
                    FrameUpdateType::IntnlOverlay
                } else {
                    FrameUpdateType::IntnlArf
                }
            }
            Some(Av1ReferenceName::Bwdref) => {
                if overlay {
                    FrameUpdateType::IntnlOverlay
                } else {
                    FrameUpdateType::Bwd
                }
            }
            Some(Av1ReferenceName::Altref) => {
                if overlay {
                    FrameUpdateType::Overlay
                } else {
                    FrameUpdateType::Arf
                }
            }
            Some(Av1ReferenceName::Golden) => FrameUpdateType::Gf,
            None => FrameUpdateType::None,
            _ => FrameUpdateType::Lf,
        }
    }

    /// Allocate a reconstruction slot for the picture, or bump the shown
    /// picture's refcount for show_existing_frame.
    pub fn picture_start(
        &mut self,
        frame_type: Av1FrameType,
        ref_name: Option<Av1ReferenceName>,
        pic_order_cnt: u32,
        frame_id: u32,
        timestamp: u64,
        show_existing_frame: bool,
        frame_to_show_buf_id: i32,
    ) -> Result<usize, DpbError> {
        if show_existing_frame {
            let dpb_idx = self.ref_buf_dpb_id(frame_to_show_buf_id);
            if dpb_idx < 0 {
                return Err(DpbError::BadSlot(frame_to_show_buf_id as usize));
            }
            self.dpb[dpb_idx as usize].ref_count += 1;
            return Ok(dpb_idx as usize);
        }

        let slot = self.dpb[..self.max_dpb_size]
            .iter()
            .position(|e| e.ref_count == 0)
            .ok_or(DpbError::Full)?;

        let entry = &mut self.dpb[slot];
        debug_assert!(entry.image.is_none());
        entry.frame_id = frame_id;
        entry.pic_order_cnt = pic_order_cnt;
        entry.frame_type = frame_type;
        entry.ref_name = ref_name;
        entry.corrupted = false;
        entry.timestamp = timestamp;
        entry.ref_count = 1;
        if frame_type == Av1FrameType::Key {
            self.last_key_frame_timestamp = timestamp;
        }
        Ok(slot)
    }

    /// Commit the picture: bind the reconstructed image, update the
    /// virtual-buffer maps and drop the working reference.
    #[allow(clippy::too_many_arguments)]
    pub fn picture_end(
        &mut self,
        dpb_idx: usize,
        image: Option<ImageHandle>,
        show_existing_frame: bool,
        shown_key_frame_or_switch: bool,
        error_resilient: bool,
        overlay: bool,
        ref_name: Option<Av1ReferenceName>,
        update_type: FrameUpdateType,
    ) -> Result<(), DpbError> {
        if dpb_idx >= self.max_dpb_size {
            return Err(DpbError::BadSlot(dpb_idx));
        }
        if !show_existing_frame {
            self.dpb[dpb_idx].image = image;
        }

        self.update_ref_frame_dpb_id_map(dpb_idx);
        self.update_primary_ref_buf_id_map(ref_name, show_existing_frame, error_resilient, overlay);
        self.update_ref_buf_id_map(shown_key_frame_or_switch, show_existing_frame, ref_name, update_type);

        self.release(dpb_idx);
        Ok(())
    }

    /// Compute the virtual-buffer refresh mask for the picture; must run
    /// between picture_start and picture_end.
    pub fn configure_ref_buf_update(
        &mut self,
        shown_key_frame_or_switch: bool,
        show_existing_frame: bool,
        update_type: FrameUpdateType,
    ) {
        if shown_key_frame_or_switch {
            self.ref_buf_update_flag = 0xff;
            return;
        }
        if show_existing_frame || update_type == FrameUpdateType::None {
            self.ref_buf_update_flag = 0;
            return;
        }

        let last_flag = self
            .last_last_ref_name_in_use
            .map(|n| 1u32 << n.index())
            .unwrap_or(0);
        let flag = |n: Av1ReferenceName| 1u32 << n.index();

        self.ref_buf_update_flag = match update_type {
            FrameUpdateType::Kf => {
                last_flag
                    | flag(Av1ReferenceName::Golden)
                    | flag(Av1ReferenceName::Altref2)
                    | flag(Av1ReferenceName::Altref)
            }
            FrameUpdateType::Lf => last_flag,
            FrameUpdateType::Gf => last_flag | flag(Av1ReferenceName::Golden),
            FrameUpdateType::Overlay => last_flag,
            FrameUpdateType::Arf => flag(Av1ReferenceName::Altref),
            FrameUpdateType::IntnlOverlay => last_flag,
            FrameUpdateType::IntnlArf => flag(Av1ReferenceName::Altref2),
            FrameUpdateType::Bwd => flag(Av1ReferenceName::Bwdref),
            FrameUpdateType::None => 0,
        };
    }

    /// refresh_frame_flags for the frame header: the refresh mask mapped
    /// through the current name → virtual buffer assignment.
    pub fn refresh_frame_flags(
        &self,
        shown_key_frame_or_switch: bool,
        show_existing_frame: bool,
    ) -> u8 {
        if shown_key_frame_or_switch {
            return 0xff;
        }
        if show_existing_frame {
            return 0;
        }
        let mut flags = 0u8;
        for i in 0..NUM_REF_FRAMES {
            if self.ref_buf_update_flag & (1 << i) != 0 {
                let Some(name) = Av1ReferenceName::from_index(i) else {
                    continue;
                };
                let buf_id = self.ref_buf_id(name);
                if buf_id >= 0 {
                    flags |= 1 << buf_id;
                }
            }
        }
        flags
    }

    pub fn ref_frame_dpb_id(&self, name: Av1ReferenceName) -> i32 {
        if name == Av1ReferenceName::Intra {
            return INVALID;
        }
        let buf_id = self.ref_buf_id_map[name.index()];
        if (0..NUM_REF_FRAMES as i32).contains(&buf_id) {
            self.ref_frame_dpb_id_map[buf_id as usize]
        } else {
            INVALID
        }
    }

    pub fn ref_buf_id(&self, name: Av1ReferenceName) -> i32 {
        if name == Av1ReferenceName::Intra {
            return INVALID;
        }
        self.ref_buf_id_map[name.index()]
    }

    pub fn ref_buf_dpb_id(&self, buf_id: i32) -> i32 {
        if (0..NUM_REF_FRAMES as i32).contains(&buf_id) {
            self.ref_frame_dpb_id_map[buf_id as usize]
        } else {
            INVALID
        }
    }

    /// Virtual buffer holding the picture with the given display order, for
    /// synthesized show_existing_frame headers.
    pub fn overlay_ref_buf_id(&self, pic_order_cnt: u32) -> i32 {
        for i in 0..NUM_REF_FRAMES {
            let Some(name) = Av1ReferenceName::from_index(i) else {
                continue;
            };
            let buf_id = if name == Av1ReferenceName::Intra {
                self.ref_buf_id_map[0]
            } else {
                self.ref_buf_id(name)
            };
            if !(0..NUM_REF_FRAMES as i32).contains(&buf_id) {
                continue;
            }
            let dpb_id = self.ref_frame_dpb_id_map[buf_id as usize];
            if !(0..self.max_dpb_size as i32).contains(&dpb_id) {
                continue;
            }
            let entry = &self.dpb[dpb_id as usize];
            if entry.ref_count > 0 && entry.pic_order_cnt == pic_order_cnt {
                return buf_id;
            }
        }
        INVALID
    }

    pub fn primary_ref_type(
        &self,
        ref_name: Option<Av1ReferenceName>,
        error_resilient: bool,
        overlay: bool,
    ) -> PrimaryRefType {
        let backward = self.max_ref_frames_l1 > 0;
        match ref_name {
            Some(Av1ReferenceName::Intra) => {
                if backward {
                    PrimaryRefType::Brf
                } else {
                    PrimaryRefType::Regular
                }
            }
            _ if error_resilient => {
                if backward {
                    PrimaryRefType::Brf
                } else {
                    PrimaryRefType::Regular
                }
            }
            _ if overlay => PrimaryRefType::Overlay,
            Some(Av1ReferenceName::Altref) => PrimaryRefType::Arf,
            Some(Av1ReferenceName::Altref2) => PrimaryRefType::IntArf,
            Some(Av1ReferenceName::Golden) => PrimaryRefType::Gld,
            Some(Av1ReferenceName::Bwdref) => PrimaryRefType::Brf,
            _ => {
                if backward {
                    PrimaryRefType::IntArf
                } else {
                    PrimaryRefType::Regular
                }
            }
        }
    }

    fn primary_ref_buf_id(&self, primary_type: PrimaryRefType) -> i32 {
        let id = self.primary_ref_buf_id_map[primary_type as usize];
        if id != INVALID {
            return id;
        }
        if primary_type == PrimaryRefType::IntArf {
            self.primary_ref_buf_id_map[PrimaryRefType::Arf as usize]
        } else if self.max_ref_frames_l1 > 0 {
            self.primary_ref_buf_id_map[PrimaryRefType::Brf as usize]
        } else {
            self.primary_ref_buf_id_map[PrimaryRefType::Regular as usize]
        }
    }

    /// primary_ref_frame for the frame header (LAST-relative index, or
    /// [`PRIMARY_REF_NONE`]). Tracks the resolved dpb index internally for
    /// the CDF-only insertion path.
    pub fn primary_ref_frame(
        &mut self,
        frame_type: Av1FrameType,
        ref_name: Option<Av1ReferenceName>,
        error_resilient: bool,
        overlay: bool,
    ) -> u8 {
        self.primary_ref_dpb_idx = INVALID;

        if frame_type.is_intra() || error_resilient {
            return PRIMARY_REF_NONE;
        }

        let primary_type = self.primary_ref_type(ref_name, error_resilient, overlay);
        let buf_id = self.primary_ref_buf_id(primary_type);
        let dpb_idx = self.ref_buf_dpb_id(buf_id);

        if buf_id == INVALID || dpb_idx == INVALID || self.dpb[dpb_idx as usize].ref_count == 0 {
            return PRIMARY_REF_NONE;
        }
        if self.dpb[dpb_idx as usize].corrupted {
            // A corrupted CDF source would desync the entropy coder.
            return PRIMARY_REF_NONE;
        }

        for name in Av1ReferenceName::INTER_NAMES {
            if self.ref_buf_id(name) == buf_id {
                self.primary_ref_dpb_idx = dpb_idx;
                return name.inter_index() as u8;
            }
        }
        PRIMARY_REF_NONE
    }

    pub fn primary_ref_dpb_idx(&self) -> i32 {
        self.primary_ref_dpb_idx
    }

    fn update_ref_frame_dpb_id_map(&mut self, dpb_idx: usize) {
        for i in 0..NUM_REF_FRAMES {
            if (self.ref_buf_update_flag >> i) & 1 == 1 {
                let buf_id = self.ref_buf_id_map[i];
                if !(0..NUM_REF_FRAMES as i32).contains(&buf_id) {
                    continue;
                }
                let old = self.ref_frame_dpb_id_map[buf_id as usize];
                if old != INVALID {
                    self.release(old as usize);
                }
                self.ref_frame_dpb_id_map[buf_id as usize] = dpb_idx as i32;
                debug_assert!(self.dpb[dpb_idx].ref_count <= NUM_REF_FRAMES as u32);
                self.dpb[dpb_idx].ref_count += 1;
            }
        }
    }

    fn update_primary_ref_buf_id_map(
        &mut self,
        ref_name: Option<Av1ReferenceName>,
        show_existing_frame: bool,
        error_resilient: bool,
        overlay: bool,
    ) {
        if show_existing_frame {
            return;
        }
        let primary_type = self.primary_ref_type(ref_name, error_resilient, overlay);
        // If several buffers refresh, any one of them carries the CDF.
        for name in Av1ReferenceName::INTER_NAMES {
            if self.ref_buf_update_flag & (1 << name.index()) != 0 {
                self.primary_ref_buf_id_map[primary_type as usize] = self.ref_buf_id(name);
                break;
            }
        }
    }

    fn update_ref_buf_id_map(
        &mut self,
        shown_key_frame_or_switch: bool,
        show_existing_frame: bool,
        ref_name: Option<Av1ReferenceName>,
        update_type: FrameUpdateType,
    ) {
        // The virtual mapping is untouched for shown key frames, S-frames
        // and pictures that refresh nothing.
        if shown_key_frame_or_switch || update_type == FrameUpdateType::None {
            return;
        }
        let Some(last_last) = self.last_last_ref_name_in_use else {
            return;
        };

        let mut new_map = self.ref_buf_id_map;

        if update_type == FrameUpdateType::Overlay {
            // A true overlay refreshes GOLDEN and rotates the
            // {last_last, GOLDEN, ALTREF} triangle: the shown GOLDEN becomes
            // the new ALTREF and the old ALTREF the new GOLDEN.
            new_map[last_last.index()] = self.ref_buf_id_map[Av1ReferenceName::Golden.index()];
            new_map[Av1ReferenceName::Golden.index()] =
                self.ref_buf_id_map[Av1ReferenceName::Altref.index()];
            new_map[Av1ReferenceName::Altref.index()] = self.ref_buf_id_map[last_last.index()];
        } else if update_type == FrameUpdateType::IntnlOverlay && show_existing_frame {
            if let Some(name) = ref_name {
                new_map[last_last.index()] = self.ref_buf_id_map[name.index()];
                new_map[name.index()] = self.ref_buf_id_map[last_last.index()];
            }
        }

        if matches!(
            update_type,
            FrameUpdateType::Lf
                | FrameUpdateType::Gf
                | FrameUpdateType::IntnlOverlay
                | FrameUpdateType::Overlay
        ) && last_last > Av1ReferenceName::Last
        {
            // Shift the LAST..last_last window by one so the oldest LAST
            // slides out and the refreshed buffer becomes the new LAST.
            new_map[Av1ReferenceName::Last.index()] = new_map[last_last.index()];
            for name in Av1ReferenceName::Last2.index()..=last_last.index() {
                new_map[name] = self.ref_buf_id_map[name - 1];
            }
        }

        self.ref_buf_id_map = new_map;
    }

    /// Partition the active references into the past (group 1) and future
    /// (group 2) groups relative to the current display order, map them back
    /// to reference names, and cap the counts.
    pub fn setup_reference_frame_groups(
        &mut self,
        picture_type: FrameType,
        frame_type: Av1FrameType,
        cur_pic_order_cnt: u32,
        skip_corrupted: bool,
    ) {
        self.num_ref_frames_l0 = 0;
        self.num_ref_frames_l1 = 0;
        self.num_refs_in_group1 = 0;
        self.num_refs_in_group2 = 0;
        self.ref_name_to_dpb = [INVALID; REFS_PER_FRAME];

        if frame_type.is_intra() {
            return;
        }

        for name in Av1ReferenceName::INTER_NAMES {
            self.ref_name_to_dpb[name.inter_index()] = self.ref_frame_dpb_id(name);
        }

        let mut past: Vec<(u32, usize)> = Vec::new();
        let mut future: Vec<(u32, usize)> = Vec::new();
        for (dpb_id, e) in self.dpb[..self.max_dpb_size].iter().enumerate() {
            if e.ref_count == 0 || (skip_corrupted && e.corrupted) {
                continue;
            }
            if e.pic_order_cnt < cur_pic_order_cnt {
                past.push((e.pic_order_cnt, dpb_id));
            } else {
                future.push((e.pic_order_cnt, dpb_id));
            }
        }
        // Past sorted newest-first, future sorted nearest-first.
        past.sort_by(|a, b| b.0.cmp(&a.0));
        future.sort_by(|a, b| a.0.cmp(&b.0));

        self.num_ref_frames_l0 = past.len().min(self.max_ref_frames_l0);
        self.num_ref_frames_l1 = if picture_type == FrameType::P {
            0
        } else {
            future.len().min(self.max_ref_frames_l1)
        };

        // Pick the strongest prediction arrangement the capabilities allow
        // and honor its supported-name mask while mapping dpb slots back to
        // reference names.
        let supported_mask = if picture_type == FrameType::B {
            if self.caps.max_bidirectional_compound_reference_count > 0 {
                self.caps.bidirectional_compound_reference_name_mask
            } else {
                self.caps.unidirectional_compound_reference_name_mask
                    & ((1 << (Av1ReferenceName::Golden.inter_index() + 1)) - 1)
            }
        } else if self.caps.max_unidirectional_compound_reference_count > 0 {
            self.caps.unidirectional_compound_reference_name_mask
                & ((1 << (Av1ReferenceName::Golden.inter_index() + 1)) - 1)
        } else {
            self.caps.single_reference_name_mask
        };
        debug_assert!(supported_mask != 0);

        let mut num = 0;
        for &(_, dpb_id) in &past {
            if num >= self.num_ref_frames_l0 {
                break;
            }
            let found = [
                Av1ReferenceName::Last,
                Av1ReferenceName::Last2,
                Av1ReferenceName::Last3,
                Av1ReferenceName::Golden,
            ]
            .into_iter()
            .find(|name| {
                supported_mask & (1 << name.inter_index()) != 0
                    && self.ref_name_to_dpb[name.inter_index()] == dpb_id as i32
            });
            if let Some(name) = found {
                self.refs_in_group1[num] = name.inter_index();
                num += 1;
            }
        }
        self.num_refs_in_group1 = num;

        let mut num = 0;
        for &(_, dpb_id) in &future {
            if num >= self.num_ref_frames_l1 {
                break;
            }
            let found = [
                Av1ReferenceName::Bwdref,
                Av1ReferenceName::Altref2,
                Av1ReferenceName::Altref,
            ]
            .into_iter()
            .find(|name| {
                supported_mask & (1 << name.inter_index()) != 0
                    && self.ref_name_to_dpb[name.inter_index()] == dpb_id as i32
            });
            if let Some(name) = found {
                self.refs_in_group2[num] = name.inter_index();
                num += 1;
            }
        }
        self.num_refs_in_group2 = num;
    }

    /// Resolve the prediction mode from the populated groups and the
    /// reference names the frame actually bound, degrading to what the
    /// capabilities support.
    pub fn prediction_mode(
        &self,
        picture_type: FrameType,
        last_present: bool,
        bwd_present: bool,
        alt_present: bool,
    ) -> Av1PredictionMode {
        let mut mode = if picture_type.is_intra() {
            Av1PredictionMode::IntraOnly
        } else if self.num_refs_in_group1 > 0 && self.num_refs_in_group2 > 0 {
            Av1PredictionMode::BidirectionalCompound
        } else if (last_present && self.num_refs_in_group1 >= 2) || (bwd_present && alt_present) {
            Av1PredictionMode::UnidirectionalCompound
        } else {
            Av1PredictionMode::SingleReference
        };

        if mode == Av1PredictionMode::BidirectionalCompound
            && self.caps.max_bidirectional_compound_reference_count == 0
        {
            mode = Av1PredictionMode::UnidirectionalCompound;
        }
        if mode == Av1PredictionMode::UnidirectionalCompound
            && self.caps.max_unidirectional_compound_reference_count == 0
        {
            mode = Av1PredictionMode::SingleReference;
        }
        if mode == Av1PredictionMode::SingleReference
            && self.caps.max_single_reference_count == 0
        {
            mode = Av1PredictionMode::IntraOnly;
        }
        mode
    }

    pub fn num_refs_l1(&self) -> usize {
        self.num_ref_frames_l1
    }

    pub fn num_refs_in_group(&self, group: usize) -> usize {
        if group == 0 {
            self.num_refs_in_group1
        } else {
            self.num_refs_in_group2
        }
    }

    /// (reference name inter-index, dpb index) of the i-th reference in the
    /// given group.
    pub fn group_ref(&self, group: usize, i: usize) -> (usize, i32) {
        let name_minus_1 = if group == 0 {
            self.refs_in_group1[i]
        } else {
            self.refs_in_group2[i]
        };
        (name_minus_1, self.ref_name_to_dpb[name_minus_1])
    }

    pub fn dpb_idx_for_ref_index(&self, name_minus_1: usize) -> i32 {
        self.ref_name_to_dpb[name_minus_1]
    }

    pub fn image(&self, dpb_idx: usize) -> Option<ImageHandle> {
        self.dpb.get(dpb_idx).and_then(|e| e.image.clone())
    }

    pub fn frame_type(&self, dpb_idx: usize) -> Av1FrameType {
        self.dpb[dpb_idx].frame_type
    }

    pub fn ref_name_of(&self, dpb_idx: usize) -> Option<Av1ReferenceName> {
        self.dpb[dpb_idx].ref_name
    }

    pub fn frame_id(&self, dpb_idx: usize) -> u32 {
        self.dpb[dpb_idx].frame_id
    }

    pub fn pic_order_cnt(&self, dpb_idx: usize) -> u32 {
        self.dpb[dpb_idx].pic_order_cnt
    }

    pub fn ref_count(&self, dpb_idx: usize) -> u32 {
        self.dpb[dpb_idx].ref_count
    }

    pub fn mark_corrupted(&mut self, dpb_idx: usize) {
        if let Some(e) = self.dpb.get_mut(dpb_idx) {
            e.corrupted = true;
        }
    }

    /// Flag every reference admitted since `timestamp` as corrupted.
    pub fn invalidate_references(&mut self, timestamp: u64) {
        for e in &mut self.dpb {
            if e.ref_count > 0 && e.timestamp >= timestamp {
                e.corrupted = true;
            }
        }
    }

    pub fn is_corrupted(&self, dpb_idx: usize) -> bool {
        self.dpb[dpb_idx].corrupted
    }

    pub fn fill_std_reference_info(&self, dpb_idx: usize) -> Av1ReferenceInfo {
        let e = &self.dpb[dpb_idx];
        Av1ReferenceInfo {
            ref_frame_id: 0,
            frame_type: e.frame_type,
            order_hint: (e.pic_order_cnt % (1 << ORDER_HINT_BITS)) as u8,
        }
    }

    /// order hints of all eight virtual buffers, for ref_order_hint[].
    pub fn ref_order_hints(&self) -> [u8; NUM_REF_FRAMES] {
        let mut hints = [0u8; NUM_REF_FRAMES];
        for (buf_id, hint) in hints.iter_mut().enumerate() {
            let dpb_id = self.ref_frame_dpb_id_map[buf_id];
            if (0..self.max_dpb_size as i32).contains(&dpb_id) {
                *hint = (self.dpb[dpb_id as usize].pic_order_cnt % (1 << ORDER_HINT_BITS)) as u8;
            }
        }
        hints
    }

    fn release(&mut self, dpb_idx: usize) {
        let e = &mut self.dpb[dpb_idx];
        debug_assert!(e.ref_count > 0);
        if e.ref_count > 0 {
            e.ref_count -= 1;
            if e.ref_count == 0 {
                e.image = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dpb_with_key() -> Av1Dpb {
        let mut dpb = Av1Dpb::new();
        dpb.sequence_start(
            &Av1ReferenceCaps::default(),
            NUM_REF_FRAMES + 1,
            2,
            TuningMode::Default,
            0,
        );

        // Shown key frame refreshes all eight virtual buffers.
        let slot = dpb
            .picture_start(Av1FrameType::Key, Some(Av1ReferenceName::Intra), 0, 0, 0, false, -1)
            .unwrap();
        dpb.configure_ref_buf_update(true, false, FrameUpdateType::Kf);
        assert_eq!(dpb.refresh_frame_flags(true, false), 0xff);
        dpb.picture_end(
            slot,
            None,
            false,
            true,
            false,
            false,
            Some(Av1ReferenceName::Intra),
            FrameUpdateType::Kf,
        )
        .unwrap();
        dpb
    }

    #[test]
    fn key_frame_occupies_all_virtual_buffers() {
        let dpb = dpb_with_key();
        for name in Av1ReferenceName::INTER_NAMES {
            assert_eq!(dpb.ref_frame_dpb_id(name), 0, "{name:?}");
        }
        // One reference per virtual buffer; the working ref was dropped.
        assert_eq!(dpb.ref_count(0), 8);
    }

    #[test]
    fn last_frame_update_rotates_last_window() {
        let mut dpb = dpb_with_key();

        let slot = dpb
            .picture_start(Av1FrameType::Inter, Some(Av1ReferenceName::Last), 1, 1, 1, false, -1)
            .unwrap();
        let update = dpb.frame_update_type(Some(Av1ReferenceName::Last), false);
        assert_eq!(update, FrameUpdateType::Lf);
        dpb.configure_ref_buf_update(false, false, update);
        let refresh = dpb.refresh_frame_flags(false, false);
        // Exactly one buffer refreshes for an LF update.
        assert_eq!(refresh.count_ones(), 1);
        dpb.picture_end(
            slot,
            None,
            false,
            false,
            false,
            false,
            Some(Av1ReferenceName::Last),
            update,
        )
        .unwrap();

        // The freshly coded picture is now LAST; the key frame slid to
        // LAST2 and still answers to GOLDEN.
        assert_eq!(dpb.ref_frame_dpb_id(Av1ReferenceName::Last), slot as i32);
        assert_eq!(dpb.ref_frame_dpb_id(Av1ReferenceName::Last2), 0);
        assert_eq!(dpb.ref_frame_dpb_id(Av1ReferenceName::Golden), 0);
    }

    #[test]
    fn groups_partition_past_and_future() {
        let mut dpb = dpb_with_key();

        // Code an ALTREF anchor at display order 4 (unshown).
        let slot = dpb
            .picture_start(Av1FrameType::Inter, Some(Av1ReferenceName::Altref), 4, 1, 1, false, -1)
            .unwrap();
        dpb.configure_ref_buf_update(false, false, FrameUpdateType::Arf);
        dpb.picture_end(
            slot,
            None,
            false,
            false,
            false,
            false,
            Some(Av1ReferenceName::Altref),
            FrameUpdateType::Arf,
        )
        .unwrap();

        // A B picture between the key frame and the ALTREF sees one past
        // and one future reference.
        dpb.setup_reference_frame_groups(FrameType::B, Av1FrameType::Inter, 2, false);
        assert_eq!(dpb.num_refs_in_group(0), 1);
        assert_eq!(dpb.num_refs_in_group(1), 1);
        assert_eq!(
            dpb.prediction_mode(FrameType::B, true, false, true),
            Av1PredictionMode::BidirectionalCompound
        );

        let (name_idx, dpb_id) = dpb.group_ref(1, 0);
        assert_eq!(name_idx, Av1ReferenceName::Altref.inter_index());
        assert_eq!(dpb_id, slot as i32);
    }

    #[test]
    fn p_pictures_use_no_future_references() {
        let mut dpb = dpb_with_key();
        dpb.setup_reference_frame_groups(FrameType::P, Av1FrameType::Inter, 2, false);
        assert_eq!(dpb.num_refs_in_group(1), 0);
        assert_eq!(
            dpb.prediction_mode(FrameType::P, true, false, false),
            Av1PredictionMode::SingleReference
        );
    }

    #[test]
    fn primary_ref_survives_intra_only_after_key() {
        let mut dpb = dpb_with_key();

        // INTRA_ONLY carries no primary reference itself...
        let primary =
            dpb.primary_ref_frame(Av1FrameType::IntraOnly, Some(Av1ReferenceName::Intra), false, false);
        assert_eq!(primary, PRIMARY_REF_NONE);

        let slot = dpb
            .picture_start(Av1FrameType::IntraOnly, Some(Av1ReferenceName::Intra), 1, 1, 1, false, -1)
            .unwrap();
        let update = dpb.frame_update_type(Some(Av1ReferenceName::Intra), false);
        dpb.configure_ref_buf_update(false, false, update);
        let refresh = dpb.refresh_frame_flags(false, false);
        // ...and must leave buffers holding the key frame so a later inter
        // picture can still address a CDF ancestor.
        assert_ne!(refresh, 0xff);
        assert_ne!(refresh, 0);
        dpb.picture_end(
            slot,
            None,
            false,
            false,
            false,
            false,
            Some(Av1ReferenceName::Intra),
            update,
        )
        .unwrap();

        // The key frame is still mapped by at least one virtual buffer.
        assert!(
            Av1ReferenceName::INTER_NAMES
                .iter()
                .any(|&n| dpb.ref_frame_dpb_id(n) == 0)
        );
        // And the CDF ancestry chain resolves for the next backward frame.
        let primary =
            dpb.primary_ref_frame(Av1FrameType::Inter, Some(Av1ReferenceName::Bwdref), false, false);
        assert_ne!(primary, PRIMARY_REF_NONE);
    }

    #[test]
    fn show_existing_bumps_refcount_only() {
        let mut dpb = dpb_with_key();

        let slot = dpb
            .picture_start(Av1FrameType::Inter, Some(Av1ReferenceName::Altref), 4, 1, 1, false, -1)
            .unwrap();
        dpb.configure_ref_buf_update(false, false, FrameUpdateType::Arf);
        dpb.picture_end(
            slot,
            None,
            false,
            false,
            false,
            false,
            Some(Av1ReferenceName::Altref),
            FrameUpdateType::Arf,
        )
        .unwrap();
        let count_before = dpb.ref_count(slot);

        let buf_id = dpb.overlay_ref_buf_id(4);
        assert!(buf_id >= 0);
        let shown = dpb
            .picture_start(Av1FrameType::Inter, None, 4, 1, 2, true, buf_id)
            .unwrap();
        assert_eq!(shown, slot);
        assert_eq!(dpb.ref_count(slot), count_before + 1);

        dpb.configure_ref_buf_update(false, true, FrameUpdateType::IntnlOverlay);
        assert_eq!(dpb.refresh_frame_flags(false, true), 0);
        let shown_name = dpb.ref_name_of(shown);
        dpb.picture_end(
            shown,
            None,
            true,
            false,
            false,
            true,
            shown_name,
            FrameUpdateType::IntnlOverlay,
        )
        .unwrap();
        assert_eq!(dpb.ref_count(slot), count_before);
    }

    #[test]
    fn corrupted_primary_falls_back_to_none() {
        let mut dpb = dpb_with_key();
        dpb.mark_corrupted(0);
        let primary =
            dpb.primary_ref_frame(Av1FrameType::Inter, Some(Av1ReferenceName::Last), false, false);
        assert_eq!(primary, PRIMARY_REF_NONE);
    }
}
