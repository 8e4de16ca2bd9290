//! H.264 session parameters and per-frame submission assembly.

use ash::vk;

use crate::config::{EncoderConfig, RateControl};
use crate::dpb::h264::{H264Dpb, H264DpbConfig, H264PictureDesc, MAX_DPB_SLOTS, PocType};
use crate::driver::{CodecEncodeInfo, CodecHeaders, CodecReferenceInfo, EncodeInfo, ReferenceSlot};
use crate::gop::FrameType;
use crate::pool::ImagePool;

use super::{EncodeError, frame::FrameInfo};

const MACROBLOCK_SIZE: u32 = 16;
const LOG2_MAX_FRAME_NUM: u32 = 8;
const LOG2_MAX_PIC_ORDER_CNT_LSB: u32 = 8;
pub const MAX_REFERENCES: usize = 16;

/// Reference list state serialized into the picture's slice headers.
#[derive(Debug, Clone, Default)]
pub struct H264RefListsInfo {
    pub ref_pic_list0: [u8; 32],
    pub ref_pic_list1: [u8; 32],
    pub num_ref_idx_l0_active_minus1: u8,
    pub num_ref_idx_l1_active_minus1: u8,
    pub ref_pic_list_modification_flag_l0: bool,
    pub list0_mod_ops: Vec<vk::native::StdVideoEncodeH264RefListModEntry>,
    pub list1_mod_ops: Vec<vk::native::StdVideoEncodeH264RefListModEntry>,
    pub marking_ops: Vec<vk::native::StdVideoEncodeH264RefPicMarkingEntry>,
}

#[derive(Debug, Clone)]
pub struct H264SliceInfo {
    pub slice_type: FrameType,
    pub constant_qp: i32,
    pub disable_deblocking_filter_idc: u32,
    pub cabac_init_idc: u32,
    pub num_ref_idx_active_override: bool,
}

/// Codec payload of one H.264 encode submission.
#[derive(Debug, Clone)]
pub struct H264EncodeInfo {
    pub idr: bool,
    pub is_reference: bool,
    pub long_term_reference: bool,
    pub adaptive_ref_pic_marking: bool,
    pub seq_parameter_set_id: u8,
    pub pic_parameter_set_id: u8,
    pub idr_pic_id: u16,
    pub primary_pic_type: FrameType,
    pub frame_num: u32,
    pub pic_order_cnt: i32,
    pub temporal_id: u8,
    pub ref_lists: H264RefListsInfo,
    pub slice: H264SliceInfo,
}

pub(crate) fn sps(
    config: &EncoderConfig,
) -> Result<vk::native::StdVideoH264SequenceParameterSet, EncodeError> {
    let width = config.encode_width;
    let height = config.encode_height;
    let aligned_width = width.next_multiple_of(MACROBLOCK_SIZE);
    let aligned_height = height.next_multiple_of(MACROBLOCK_SIZE);

    let has_b_frames = config.gop.consecutive_b_frames > 0;
    let cropped = aligned_width != width || aligned_height != height;

    Ok(vk::native::StdVideoH264SequenceParameterSet {
        flags: vk::native::StdVideoH264SpsFlags {
            _bitfield_align_1: [0; 0],
            __bindgen_padding_0: 0,
            _bitfield_1: vk::native::StdVideoH264SpsFlags::new_bitfield_1(
                0,
                0,
                0,
                0,
                0,
                (!has_b_frames) as u32, // constraint_set5: no B slices
                1,                      // direct_8x8_inference
                0,
                1, // frame_mbs_only
                0,
                0,
                0,
                0,
                cropped as u32,
                0,
                0,
            ),
        },
        profile_idc: vk::native::StdVideoH264ProfileIdc_STD_VIDEO_H264_PROFILE_IDC_HIGH,
        level_idc: vk::native::StdVideoH264LevelIdc_STD_VIDEO_H264_LEVEL_IDC_4_1,
        chroma_format_idc:
            vk::native::StdVideoH264ChromaFormatIdc_STD_VIDEO_H264_CHROMA_FORMAT_IDC_420,
        seq_parameter_set_id: 0,
        bit_depth_luma_minus8: (config.input.bit_depth - 8) as u8,
        bit_depth_chroma_minus8: (config.input.bit_depth - 8) as u8,
        log2_max_frame_num_minus4: (LOG2_MAX_FRAME_NUM - 4) as u8,
        pic_order_cnt_type: vk::native::StdVideoH264PocType_STD_VIDEO_H264_POC_TYPE_0,
        offset_for_non_ref_pic: 0,
        offset_for_top_to_bottom_field: 0,
        log2_max_pic_order_cnt_lsb_minus4: (LOG2_MAX_PIC_ORDER_CNT_LSB - 4) as u8,
        num_ref_frames_in_pic_order_cnt_cycle: 0,
        max_num_ref_frames: config.max_dpb_slots().min(MAX_REFERENCES) as u8 - 1,
        reserved1: 0,
        pic_width_in_mbs_minus1: aligned_width / MACROBLOCK_SIZE - 1,
        pic_height_in_map_units_minus1: aligned_height / MACROBLOCK_SIZE - 1,
        // 4:2:0 crop units are two samples in each direction.
        frame_crop_left_offset: 0,
        frame_crop_right_offset: (aligned_width - width) / 2,
        frame_crop_top_offset: 0,
        frame_crop_bottom_offset: (aligned_height - height) / 2,
        reserved2: 0,
        pOffsetForRefFrame: std::ptr::null(),
        pScalingLists: std::ptr::null(),
        pSequenceParameterSetVui: std::ptr::null(),
    })
}

pub(crate) fn pps(config: &EncoderConfig) -> vk::native::StdVideoH264PictureParameterSet {
    vk::native::StdVideoH264PictureParameterSet {
        flags: vk::native::StdVideoH264PpsFlags {
            __bindgen_padding_0: [0; 3],
            _bitfield_align_1: [],
            _bitfield_1: vk::native::StdVideoH264PpsFlags::new_bitfield_1(
                0, 0, 0, 1, // deblocking filter control present
                0, 0, 1, // entropy coding: CABAC
                0,
            ),
        },
        seq_parameter_set_id: 0,
        pic_parameter_set_id: 0,
        num_ref_idx_l0_default_active_minus1: 0,
        num_ref_idx_l1_default_active_minus1: 0,
        weighted_bipred_idc:
            vk::native::StdVideoH264WeightedBipredIdc_STD_VIDEO_H264_WEIGHTED_BIPRED_IDC_DEFAULT,
        pic_init_qp_minus26: config.const_qp.qp_intra as i8 - 26,
        pic_init_qs_minus26: 0,
        chroma_qp_index_offset: 0,
        second_chroma_qp_index_offset: 0,
        pScalingLists: std::ptr::null(),
    }
}

/// Per-session H.264 encoder state: the active parameter sets, the DPB and
/// the frame_num / idr_pic_id counters.
#[derive(Debug)]
pub struct H264State {
    pub dpb: H264Dpb,
    dpb_cfg: H264DpbConfig,
    sps: vk::native::StdVideoH264SequenceParameterSet,
    pps: vk::native::StdVideoH264PictureParameterSet,
    frame_num_syntax: u32,
    idr_pic_id: u32,
}

impl H264State {
    pub fn new(config: &EncoderConfig) -> Result<Self, EncodeError> {
        let sps = sps(config)?;
        let pps = pps(config);
        let mut dpb = H264Dpb::new();
        dpb.sequence_start(config.max_dpb_slots());
        Ok(H264State {
            dpb,
            dpb_cfg: H264DpbConfig {
                max_num_ref_frames: u32::from(sps.max_num_ref_frames),
                log2_max_frame_num: LOG2_MAX_FRAME_NUM,
                log2_max_pic_order_cnt_lsb: LOG2_MAX_PIC_ORDER_CNT_LSB,
                poc_type: PocType::Type0,
                gaps_in_frame_num_allowed: false,
                num_ref_idx_l0_default_active: u32::from(pps.num_ref_idx_l0_default_active_minus1)
                    + 1,
                num_ref_idx_l1_default_active: u32::from(pps.num_ref_idx_l1_default_active_minus1)
                    + 1,
            },
            sps,
            pps,
            frame_num_syntax: 0,
            idr_pic_id: 0,
        })
    }

    pub fn headers(&self) -> CodecHeaders {
        CodecHeaders::H264 {
            sps: self.sps,
            pps: self.pps,
        }
    }

    /// Admit the picture into the DPB, build its reference lists and bake
    /// the full submission descriptor into `frame.encode_info`.
    pub fn process_dpb(
        &mut self,
        frame: &mut FrameInfo,
        config: &EncoderConfig,
        dpb_images: &ImagePool,
    ) -> Result<(), EncodeError> {
        let picture_type = frame.gop.picture_type;

        if frame.is_idr {
            self.frame_num_syntax = 0;
        }
        let max_frame_num = 1u32 << LOG2_MAX_FRAME_NUM;
        let max_poc_lsb = 1i32 << LOG2_MAX_PIC_ORDER_CNT_LSB;

        let pic = H264PictureDesc {
            picture_type,
            frame_num: self.frame_num_syntax % max_frame_num,
            pic_order_cnt_lsb: frame.pic_order_cnt & (max_poc_lsb - 1),
            idr: frame.is_idr,
            is_reference: frame.is_reference,
            field_pic: false,
            bottom_field: false,
            long_term_reference: false,
            adaptive_ref_pic_marking: false,
            no_output_of_prior_pics: false,
            timestamp: frame.timestamp,
        };
        if frame.is_reference {
            self.frame_num_syntax = self.frame_num_syntax.wrapping_add(1);
        }

        if frame.is_reference {
            frame.setup_image = Some(
                dpb_images
                    .acquire(vk::ImageLayout::VIDEO_ENCODE_DPB_KHR)
                    .ok_or(EncodeError::PoolExhausted("DPB images"))?,
            );
        }

        self.dpb.picture_start(&self.dpb_cfg, &pic)?;

        // A corrupted active reference forces a list-modification sequence
        // so the decoder derives the same cleaned-up list.
        let mut ref_lists_info = H264RefListsInfo::default();
        if self.dpb.need_to_reorder()
            && matches!(picture_type, FrameType::P | FrameType::B)
        {
            ref_lists_info.list0_mod_ops = self.dpb.reordering_commands(&self.dpb_cfg, &pic);
            ref_lists_info.ref_pic_list_modification_flag_l0 =
                !ref_lists_info.list0_mod_ops.is_empty();
        }

        let lists = self.dpb.ref_pic_lists(
            &self.dpb_cfg,
            &pic,
            &ref_lists_info.list0_mod_ops,
            self.dpb.need_to_reorder(),
        );

        ref_lists_info.ref_pic_list0 = [u8::MAX; 32];
        ref_lists_info.ref_pic_list1 = [u8::MAX; 32];
        for (dst, src) in ref_lists_info.ref_pic_list0.iter_mut().zip(&lists.l0) {
            *dst = *src;
        }
        for (dst, src) in ref_lists_info.ref_pic_list1.iter_mut().zip(&lists.l1) {
            *dst = *src;
        }
        ref_lists_info.num_ref_idx_l0_active_minus1 = lists.l0.len().saturating_sub(1) as u8;
        ref_lists_info.num_ref_idx_l1_active_minus1 = lists.l1.len().saturating_sub(1) as u8;

        let num_ref_idx_active_override = match picture_type {
            FrameType::B => {
                ref_lists_info.num_ref_idx_l0_active_minus1
                    != self.pps.num_ref_idx_l0_default_active_minus1
                    || ref_lists_info.num_ref_idx_l1_active_minus1
                        != self.pps.num_ref_idx_l1_default_active_minus1
            }
            FrameType::P => {
                ref_lists_info.num_ref_idx_l0_active_minus1
                    != self.pps.num_ref_idx_l0_default_active_minus1
            }
            _ => false,
        };

        // frame_num / POC may have been rebased by marking operations.
        let (frame_num, pic_order_cnt) = self.dpb.current_frame_num_poc();

        let setup_slot_idx = self.dpb.picture_end(
            &self.dpb_cfg,
            &pic,
            frame.setup_image.clone(),
            &ref_lists_info.marking_ops,
        )?;

        let mut reference_slots = Vec::with_capacity(lists.l0.len() + lists.l1.len());
        for &slot in lists.l0.iter().chain(&lists.l1) {
            let image = self
                .dpb
                .image(slot as usize)
                .ok_or(EncodeError::MissingReference(slot as usize))?;
            // The same picture appearing in both lists is bound once.
            if reference_slots
                .iter()
                .any(|r: &ReferenceSlot| r.slot_index == i32::from(slot))
            {
                continue;
            }
            reference_slots.push(ReferenceSlot {
                slot_index: i32::from(slot),
                resource: image.resource(),
                std_info: Some(CodecReferenceInfo::H264(
                    self.dpb.fill_std_reference_info(slot as usize),
                )),
            });
            frame.reference_images.push(image);
        }

        let setup_reference_slot = if frame.is_reference && setup_slot_idx < MAX_DPB_SLOTS {
            let image = frame
                .setup_image
                .as_ref()
                .ok_or(EncodeError::MissingReference(setup_slot_idx))?;
            Some(ReferenceSlot {
                slot_index: setup_slot_idx as i32,
                resource: image.resource(),
                std_info: Some(CodecReferenceInfo::H264(
                    self.dpb.fill_std_reference_info(setup_slot_idx),
                )),
            })
        } else {
            None
        };

        let constant_qp = if config.rate_control == RateControl::Disabled {
            config.const_qp.for_type(picture_type) as i32
        } else {
            0
        };

        let idr_pic_id = if frame.is_idr {
            let id = (self.idr_pic_id & 1) as u16;
            self.idr_pic_id = self.idr_pic_id.wrapping_add(1);
            id
        } else {
            0
        };

        let src_image = frame
            .src_image
            .as_ref()
            .ok_or(EncodeError::MissingInput)?;
        let bitstream = frame
            .bitstream
            .as_ref()
            .ok_or(EncodeError::PoolExhausted("bitstream buffers"))?
            .buffer();

        frame.encode_info = Some(EncodeInfo {
            src_picture_resource: src_image.resource(),
            setup_reference_slot,
            reference_slots,
            dst_buffer: bitstream.buffer,
            dst_buffer_offset: 0,
            dst_buffer_range: bitstream.size,
            query_slot: frame.query_slot(),
            codec: CodecEncodeInfo::H264(H264EncodeInfo {
                idr: frame.is_idr,
                is_reference: frame.is_reference,
                long_term_reference: false,
                adaptive_ref_pic_marking: !ref_lists_info.marking_ops.is_empty(),
                seq_parameter_set_id: self.sps.seq_parameter_set_id,
                pic_parameter_set_id: self.pps.pic_parameter_set_id,
                idr_pic_id,
                primary_pic_type: picture_type,
                frame_num,
                pic_order_cnt,
                temporal_id: 0,
                ref_lists: ref_lists_info,
                slice: H264SliceInfo {
                    slice_type: picture_type,
                    constant_qp,
                    disable_deblocking_filter_idc: 0,
                    cabac_init_idc: 0,
                    num_ref_idx_active_override,
                },
            }),
        });

        Ok(())
    }

    /// On a corrupted reference, the chain around it is unusable.
    pub fn invalidate_references(&mut self, timestamp: u64) {
        self.dpb.invalidate_references(timestamp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Codec;
    use crate::driver::PictureResource;
    use crate::encoder::frame::FrameInfoPool;
    use crate::gop::{GopState, GopStructure};
    use crate::pool::{BitstreamBuffer, BitstreamBufferPool};

    fn image_pool(n: usize) -> ImagePool {
        ImagePool::new(
            (0..n)
                .map(|i| PictureResource {
                    image_view: crate::driver::ImageViewId(100 + i as u64),
                    coded_offset: vk::Offset2D::default(),
                    coded_extent: vk::Extent2D {
                        width: 64,
                        height: 64,
                    },
                    base_array_layer: 0,
                })
                .collect(),
        )
    }

    fn bitstream_pool(n: usize) -> BitstreamBufferPool {
        BitstreamBufferPool::new(
            (0..n)
                .map(|i| BitstreamBuffer {
                    buffer: crate::driver::BufferId(i as u64 + 1),
                    size: 1 << 16,
                    fence: crate::driver::FenceId(i as u64 + 1),
                })
                .collect(),
        )
    }

    #[test]
    fn ipp_sequence_descriptors() {
        let config = EncoderConfig::new(Codec::H264, 64, 64);
        let mut state = H264State::new(&config).unwrap();
        let structure = GopStructure::new(8, 16, 0, 1, FrameType::P, FrameType::P, false);
        let mut gop_state = GopState::default();

        let inputs = image_pool(4);
        let dpb_images = image_pool(4);
        let bitstreams = bitstream_pool(4);
        let mut frames = FrameInfoPool::new(4);

        let mut descriptors = Vec::new();
        for i in 0..3u32 {
            let (pos, is_idr) = structure.position(&mut gop_state, 100 - i);
            let mut frame = frames.try_acquire().unwrap();
            frame.gop = pos;
            frame.is_idr = is_idr;
            frame.is_reference = pos.is_reference();
            frame.pic_order_cnt = 2 * pos.input_order as i32;
            frame.timestamp = u64::from(i);
            frame.src_image = inputs.acquire(vk::ImageLayout::VIDEO_ENCODE_SRC_KHR);
            frame.bitstream = bitstreams.acquire();

            state.process_dpb(&mut frame, &config, &dpb_images).unwrap();
            descriptors.push(frame.encode_info.clone().unwrap());
            frames.release(frame);
        }

        // IDR: no references, setup slot present.
        assert!(descriptors[0].reference_slots.is_empty());
        let setup0 = descriptors[0].setup_reference_slot.as_ref().unwrap();

        // Second frame references the IDR's slot.
        assert_eq!(descriptors[1].reference_slots.len(), 1);
        assert_eq!(
            descriptors[1].reference_slots[0].slot_index,
            setup0.slot_index
        );

        match &descriptors[2].codec {
            CodecEncodeInfo::H264(info) => {
                assert_eq!(info.frame_num, 2);
                assert_eq!(info.pic_order_cnt, 4);
                assert!(!info.idr);
            }
            other => panic!("wrong codec payload: {other:?}"),
        }
    }

    #[test]
    fn sps_crops_unaligned_dimensions() {
        let config = EncoderConfig::new(Codec::H264, 1920, 1080);
        let sps = sps(&config).unwrap();
        assert_eq!(sps.pic_width_in_mbs_minus1, 1920 / 16 - 1);
        // 1080 rounds up to 1088 with a 4-line bottom crop in chroma units.
        assert_eq!(sps.pic_height_in_map_units_minus1, 1088 / 16 - 1);
        assert_eq!(sps.frame_crop_bottom_offset, 4);
    }
}
