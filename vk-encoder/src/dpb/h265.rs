//! H.265 decoded picture buffer.
//!
//! Shares the admission/marking/list skeleton of the H.264 buffer but with
//! POC-only reference numbering: no frame_num arithmetic, no field halves
//! and no MMCO commands. Eviction follows the short-term window by oldest
//! POC, and corrupted entries are excluded on request exactly as for H.264.

use ash::vk;

use super::{DpbError, Marking, RefPicLists};
use crate::gop::FrameType;
use crate::pool::ImageHandle;

pub const MAX_DPB_SLOTS: usize = 16;

#[derive(Debug, Clone, Copy)]
pub struct H265DpbConfig {
    pub max_num_ref_frames: u32,
    pub log2_max_pic_order_cnt_lsb: u32,
    pub num_ref_idx_l0_default_active: u32,
    pub num_ref_idx_l1_default_active: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct H265PictureDesc {
    pub picture_type: FrameType,
    pub pic_order_cnt: i32,
    pub idr: bool,
    pub is_reference: bool,
    pub long_term_reference: bool,
    pub timestamp: u64,
}

#[derive(Debug, Default, Clone)]
pub struct DpbEntryH265 {
    occupied: bool,
    pub marking: Marking,
    pic_order_cnt: i32,
    corrupted: bool,
    image: Option<ImageHandle>,
    timestamp: u64,
}

impl DpbEntryH265 {
    pub fn is_active_reference(&self) -> bool {
        self.occupied && self.marking.is_reference()
    }

    pub fn pic_order_cnt(&self) -> i32 {
        self.pic_order_cnt
    }

    pub fn is_corrupted(&self) -> bool {
        self.corrupted
    }
}

#[derive(Debug, Default, Clone)]
pub struct H265Dpb {
    entries: Vec<DpbEntryH265>,
    max_dpb_size: usize,
    current_poc: i32,
}

impl H265Dpb {
    pub fn new() -> Self {
        let mut dpb = H265Dpb::default();
        dpb.sequence_start(MAX_DPB_SLOTS);
        dpb
    }

    pub fn sequence_start(&mut self, max_dpb_size: usize) {
        self.entries = vec![DpbEntryH265::default(); MAX_DPB_SLOTS];
        self.max_dpb_size = max_dpb_size.min(MAX_DPB_SLOTS);
        self.current_poc = 0;
    }

    pub fn max_dpb_size(&self) -> usize {
        self.max_dpb_size
    }

    /// Stage the picture; records its POC for list construction.
    pub fn picture_start(
        &mut self,
        _cfg: &H265DpbConfig,
        pic: &H265PictureDesc,
    ) -> Result<(), DpbError> {
        self.current_poc = pic.pic_order_cnt;
        Ok(())
    }

    /// Commit the picture: IDR flushes all markings, reference pictures
    /// evict the oldest short-term entry when the window is exceeded and
    /// take a free slot. Returns the slot, or `None` for non-references.
    pub fn picture_end(
        &mut self,
        cfg: &H265DpbConfig,
        pic: &H265PictureDesc,
        image: Option<ImageHandle>,
    ) -> Result<Option<usize>, DpbError> {
        if pic.idr {
            for e in &mut self.entries {
                e.marking = Marking::Unused;
                e.occupied = false;
                e.image = None;
            }
        }

        if !pic.is_reference {
            return Ok(None);
        }

        let (short, long) = self.num_ref_frames();
        if short + long >= cfg.max_num_ref_frames {
            // Short-term window: drop the oldest POC.
            let oldest = self
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.occupied && e.marking == Marking::ShortTerm)
                .min_by_key(|(_, e)| e.pic_order_cnt)
                .map(|(i, _)| i);
            if let Some(i) = oldest {
                self.entries[i].marking = Marking::Unused;
                self.entries[i].occupied = false;
                self.entries[i].image = None;
            }
        }

        let slot = self
            .entries[..self.max_dpb_size]
            .iter()
            .position(|e| !e.occupied)
            .ok_or(DpbError::Full)?;

        self.entries[slot] = DpbEntryH265 {
            occupied: true,
            marking: if pic.long_term_reference {
                Marking::LongTerm
            } else {
                Marking::ShortTerm
            },
            pic_order_cnt: pic.pic_order_cnt,
            corrupted: false,
            image,
            timestamp: pic.timestamp,
        };
        Ok(Some(slot))
    }

    /// L0 = POC below current descending then long-term ascending; for B
    /// pictures L1 mirrors around the current POC.
    pub fn ref_pic_lists(
        &self,
        cfg: &H265DpbConfig,
        pic: &H265PictureDesc,
        skip_corrupted: bool,
    ) -> RefPicLists {
        let mut below: Vec<(i32, u8)> = Vec::new();
        let mut above: Vec<(i32, u8)> = Vec::new();
        let mut long: Vec<(i32, u8)> = Vec::new();
        for (i, e) in self.entries.iter().enumerate() {
            if !e.is_active_reference() || (skip_corrupted && e.corrupted) {
                continue;
            }
            match e.marking {
                Marking::ShortTerm if e.pic_order_cnt < pic.pic_order_cnt => {
                    below.push((e.pic_order_cnt, i as u8));
                }
                Marking::ShortTerm => above.push((e.pic_order_cnt, i as u8)),
                Marking::LongTerm => long.push((e.pic_order_cnt, i as u8)),
                Marking::Unused => {}
            }
        }
        below.sort_by(|a, b| b.0.cmp(&a.0));
        above.sort_by(|a, b| a.0.cmp(&b.0));
        long.sort_by(|a, b| a.0.cmp(&b.0));

        let mut lists = RefPicLists::default();
        match pic.picture_type {
            FrameType::P => {
                lists.l0.extend(below.iter().map(|&(_, i)| i));
                lists.l0.extend(long.iter().map(|&(_, i)| i));
                lists
                    .l0
                    .truncate((cfg.num_ref_idx_l0_default_active as usize).max(1));
            }
            FrameType::B => {
                lists.l0.extend(below.iter().map(|&(_, i)| i));
                lists.l0.extend(above.iter().map(|&(_, i)| i));
                lists.l0.extend(long.iter().map(|&(_, i)| i));

                lists.l1.extend(above.iter().map(|&(_, i)| i));
                lists.l1.extend(below.iter().map(|&(_, i)| i));
                lists.l1.extend(long.iter().map(|&(_, i)| i));

                if lists.l1.len() > 1 && lists.l0 == lists.l1 {
                    lists.l1.swap(0, 1);
                }
                lists.l0.truncate(1);
                lists
                    .l1
                    .truncate((cfg.num_ref_idx_l1_default_active as usize).max(1));
            }
            _ => {}
        }
        lists
    }

    pub fn need_to_reorder(&self) -> bool {
        self.entries
            .iter()
            .any(|e| e.is_active_reference() && e.corrupted)
    }

    pub fn invalidate_references(&mut self, timestamp: u64) {
        for e in &mut self.entries {
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
        for e in &self.entries {
            match (e.occupied, e.marking) {
                (true, Marking::ShortTerm) => short += 1,
                (true, Marking::LongTerm) => long += 1,
                _ => {}
            }
        }
        (short, long)
    }

    pub fn entry(&self, dpb_idx: usize) -> Option<&DpbEntryH265> {
        self.entries.get(dpb_idx)
    }

    pub fn image(&self, dpb_idx: usize) -> Option<ImageHandle> {
        self.entries.get(dpb_idx).and_then(|e| e.image.clone())
    }

    pub fn used_slots_mask(&self) -> u32 {
        let mut mask = 0;
        for (i, e) in self.entries.iter().enumerate() {
            if e.is_active_reference() {
                mask |= 1 << i;
            }
        }
        mask
    }

    pub fn fill_std_reference_info(
        &self,
        dpb_idx: usize,
    ) -> vk::native::StdVideoEncodeH265ReferenceInfo {
        let e = &self.entries[dpb_idx];
        let mut info: vk::native::StdVideoEncodeH265ReferenceInfo = unsafe { std::mem::zeroed() };
        info.flags
            .set_used_for_long_term_reference((e.marking == Marking::LongTerm) as u32);
        info.pic_type = vk::native::StdVideoH265PictureType_STD_VIDEO_H265_PICTURE_TYPE_P;
        info.PicOrderCntVal = e.pic_order_cnt;
        info.TemporalId = 0;
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> H265DpbConfig {
        H265DpbConfig {
            max_num_ref_frames: 3,
            log2_max_pic_order_cnt_lsb: 8,
            num_ref_idx_l0_default_active: 16,
            num_ref_idx_l1_default_active: 16,
        }
    }

    fn pic(poc: i32, ty: FrameType, is_ref: bool) -> H265PictureDesc {
        H265PictureDesc {
            picture_type: ty,
            pic_order_cnt: poc,
            idr: ty == FrameType::Idr,
            is_reference: is_ref,
            long_term_reference: false,
            timestamp: poc as u64,
        }
    }

    fn admit(dpb: &mut H265Dpb, p: &H265PictureDesc) -> Option<usize> {
        dpb.picture_start(&cfg(), p).unwrap();
        dpb.picture_end(&cfg(), p, None).unwrap()
    }

    #[test]
    fn window_evicts_oldest_poc() {
        let mut dpb = H265Dpb::new();
        admit(&mut dpb, &pic(0, FrameType::Idr, true));
        for n in 1..6 {
            admit(&mut dpb, &pic(2 * n, FrameType::P, true));
            let (s, l) = dpb.num_ref_frames();
            assert!(s + l <= 3);
        }
        let pocs: Vec<i32> = (0..MAX_DPB_SLOTS)
            .filter_map(|i| dpb.entry(i))
            .filter(|e| e.is_active_reference())
            .map(|e| e.pic_order_cnt())
            .collect();
        let mut sorted = pocs.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![6, 8, 10]);
    }

    #[test]
    fn b_lists_mirror_around_current() {
        let mut dpb = H265Dpb::new();
        admit(&mut dpb, &pic(0, FrameType::Idr, true));
        admit(&mut dpb, &pic(8, FrameType::P, true));

        let b = pic(4, FrameType::B, false);
        dpb.picture_start(&cfg(), &b).unwrap();
        let lists = dpb.ref_pic_lists(&cfg(), &b, false);
        let poc = |i: &u8| dpb.entry(*i as usize).unwrap().pic_order_cnt();
        assert_eq!(lists.l0.first().map(poc), Some(0));
        assert_eq!(lists.l1.first().map(poc), Some(8));
    }

    #[test]
    fn corrupted_entries_skipped_on_request() {
        let mut dpb = H265Dpb::new();
        admit(&mut dpb, &pic(0, FrameType::Idr, true));
        let slot = admit(&mut dpb, &pic(2, FrameType::P, true)).unwrap();
        dpb.mark_corrupted(slot);
        assert!(dpb.need_to_reorder());

        let p = pic(4, FrameType::P, true);
        let lists = dpb.ref_pic_lists(&cfg(), &p, true);
        assert!(!lists.l0.contains(&(slot as u8)));
    }

    #[test]
    fn idr_flushes_markings() {
        let mut dpb = H265Dpb::new();
        admit(&mut dpb, &pic(0, FrameType::Idr, true));
        admit(&mut dpb, &pic(2, FrameType::P, true));
        admit(&mut dpb, &pic(0, FrameType::Idr, true));
        assert_eq!(dpb.num_ref_frames(), (1, 0));
    }
}
