//! H.265 session parameters and per-frame submission assembly.

use ash::vk;

use crate::config::{EncoderConfig, RateControl};
use crate::dpb::h265::{H265Dpb, H265DpbConfig, H265PictureDesc};
use crate::driver::{CodecEncodeInfo, CodecHeaders, CodecReferenceInfo, EncodeInfo, ReferenceSlot};
use crate::gop::FrameType;
use crate::pool::ImagePool;

use super::{EncodeError, frame::FrameInfo};

const CTB_SIZE: u32 = 64;
const LOG2_MAX_PIC_ORDER_CNT_LSB: u32 = 8;
pub const MAX_REFERENCES: usize = 15;

#[derive(Debug, Clone, Default)]
pub struct H265RefListsInfo {
    pub ref_pic_list0: [u8; 15],
    pub ref_pic_list1: [u8; 15],
    pub num_ref_idx_l0_active_minus1: u8,
    pub num_ref_idx_l1_active_minus1: u8,
}

/// Codec payload of one H.265 encode submission.
#[derive(Debug, Clone)]
pub struct H265EncodeInfo {
    pub idr: bool,
    pub is_reference: bool,
    pub sps_id: u8,
    pub pps_id: u8,
    pub picture_type: FrameType,
    pub pic_order_cnt: i32,
    pub temporal_id: u8,
    pub constant_qp: i32,
    pub ref_lists: H265RefListsInfo,
}

pub(crate) fn sps(
    config: &EncoderConfig,
) -> Result<vk::native::StdVideoH265SequenceParameterSet, EncodeError> {
    let mut sps: vk::native::StdVideoH265SequenceParameterSet = unsafe { std::mem::zeroed() };
    sps.flags.set_sps_temporal_mvp_enabled_flag(0);
    sps.flags.set_sample_adaptive_offset_enabled_flag(1);
    sps.flags.set_sps_sub_layer_ordering_info_present_flag(0);
    sps.flags.set_long_term_ref_pics_present_flag(0);
    sps.chroma_format_idc =
        vk::native::StdVideoH265ChromaFormatIdc_STD_VIDEO_H265_CHROMA_FORMAT_IDC_420;
    // Coded dimensions round up to the CTB grid; conformance window crops.
    let aligned_width = config.encode_width.next_multiple_of(CTB_SIZE);
    let aligned_height = config.encode_height.next_multiple_of(CTB_SIZE);
    sps.pic_width_in_luma_samples = aligned_width;
    sps.pic_height_in_luma_samples = aligned_height;
    if aligned_width != config.encode_width || aligned_height != config.encode_height {
        sps.flags.set_conformance_window_flag(1);
        sps.conf_win_right_offset = (aligned_width - config.encode_width) / 2;
        sps.conf_win_bottom_offset = (aligned_height - config.encode_height) / 2;
    }
    sps.sps_video_parameter_set_id = 0;
    sps.sps_seq_parameter_set_id = 0;
    sps.bit_depth_luma_minus8 = (config.input.bit_depth - 8) as u8;
    sps.bit_depth_chroma_minus8 = (config.input.bit_depth - 8) as u8;
    sps.log2_max_pic_order_cnt_lsb_minus4 = (LOG2_MAX_PIC_ORDER_CNT_LSB - 4) as u8;
    sps.log2_min_luma_coding_block_size_minus3 = 0;
    sps.log2_diff_max_min_luma_coding_block_size = 3;
    sps.log2_min_luma_transform_block_size_minus2 = 0;
    sps.log2_diff_max_min_luma_transform_block_size = 3;
    sps.max_transform_hierarchy_depth_inter = 3;
    sps.max_transform_hierarchy_depth_intra = 3;
    Ok(sps)
}

pub(crate) fn pps(config: &EncoderConfig) -> vk::native::StdVideoH265PictureParameterSet {
    let mut pps: vk::native::StdVideoH265PictureParameterSet = unsafe { std::mem::zeroed() };
    pps.flags.set_cu_qp_delta_enabled_flag(1);
    pps.pps_pic_parameter_set_id = 0;
    pps.pps_seq_parameter_set_id = 0;
    pps.sps_video_parameter_set_id = 0;
    pps.num_ref_idx_l0_default_active_minus1 = 0;
    pps.num_ref_idx_l1_default_active_minus1 = 0;
    pps.init_qp_minus26 = config.const_qp.qp_intra as i8 - 26;
    pps
}

#[derive(Debug)]
pub struct H265State {
    pub dpb: H265Dpb,
    dpb_cfg: H265DpbConfig,
    sps: vk::native::StdVideoH265SequenceParameterSet,
    pps: vk::native::StdVideoH265PictureParameterSet,
}

impl H265State {
    pub fn new(config: &EncoderConfig) -> Result<Self, EncodeError> {
        let sps = sps(config)?;
        let pps = pps(config);
        let mut dpb = H265Dpb::new();
        dpb.sequence_start(config.max_dpb_slots());
        Ok(H265State {
            dpb,
            dpb_cfg: H265DpbConfig {
                max_num_ref_frames: config.max_dpb_slots() as u32 - 1,
                log2_max_pic_order_cnt_lsb: LOG2_MAX_PIC_ORDER_CNT_LSB,
                num_ref_idx_l0_default_active: u32::from(pps.num_ref_idx_l0_default_active_minus1)
                    + 1,
                num_ref_idx_l1_default_active: u32::from(pps.num_ref_idx_l1_default_active_minus1)
                    + 1,
            },
            sps,
            pps,
        })
    }

    pub fn headers(&self) -> CodecHeaders {
        CodecHeaders::H265 {
            sps: self.sps,
            pps: self.pps,
        }
    }

    pub fn process_dpb(
        &mut self,
        frame: &mut FrameInfo,
        config: &EncoderConfig,
        dpb_images: &ImagePool,
    ) -> Result<(), EncodeError> {
        let picture_type = frame.gop.picture_type;
        let max_poc_lsb = 1i32 << LOG2_MAX_PIC_ORDER_CNT_LSB;

        let pic = H265PictureDesc {
            picture_type,
            pic_order_cnt: frame.pic_order_cnt & (max_poc_lsb - 1),
            idr: frame.is_idr,
            is_reference: frame.is_reference,
            long_term_reference: false,
            timestamp: frame.timestamp,
        };

        if frame.is_reference {
            frame.setup_image = Some(
                dpb_images
                    .acquire(vk::ImageLayout::VIDEO_ENCODE_DPB_KHR)
                    .ok_or(EncodeError::PoolExhausted("DPB images"))?,
            );
        }

        self.dpb.picture_start(&self.dpb_cfg, &pic)?;

        let lists = self
            .dpb
            .ref_pic_lists(&self.dpb_cfg, &pic, self.dpb.need_to_reorder());

        let mut ref_lists_info = H265RefListsInfo {
            ref_pic_list0: [u8::MAX; 15],
            ref_pic_list1: [u8::MAX; 15],
            num_ref_idx_l0_active_minus1: lists.l0.len().saturating_sub(1) as u8,
            num_ref_idx_l1_active_minus1: lists.l1.len().saturating_sub(1) as u8,
        };
        for (dst, src) in ref_lists_info.ref_pic_list0.iter_mut().zip(&lists.l0) {
            *dst = *src;
        }
        for (dst, src) in ref_lists_info.ref_pic_list1.iter_mut().zip(&lists.l1) {
            *dst = *src;
        }

        let mut reference_slots = Vec::with_capacity(lists.l0.len() + lists.l1.len());
        for &slot in lists.l0.iter().chain(&lists.l1) {
            let image = self
                .dpb
                .image(slot as usize)
                .ok_or(EncodeError::MissingReference(slot as usize))?;
            if reference_slots
                .iter()
                .any(|r: &ReferenceSlot| r.slot_index == i32::from(slot))
            {
                continue;
            }
            reference_slots.push(ReferenceSlot {
                slot_index: i32::from(slot),
                resource: image.resource(),
                std_info: Some(CodecReferenceInfo::H265(
                    self.dpb.fill_std_reference_info(slot as usize),
                )),
            });
            frame.reference_images.push(image);
        }

        let setup_slot_idx = self
            .dpb
            .picture_end(&self.dpb_cfg, &pic, frame.setup_image.clone())?;

        let setup_reference_slot = match (frame.is_reference, setup_slot_idx) {
            (true, Some(slot)) => {
                let image = frame
                    .setup_image
                    .as_ref()
                    .ok_or(EncodeError::MissingReference(slot))?;
                Some(ReferenceSlot {
                    slot_index: slot as i32,
                    resource: image.resource(),
                    std_info: Some(CodecReferenceInfo::H265(
                        self.dpb.fill_std_reference_info(slot),
                    )),
                })
            }
            _ => None,
        };

        let constant_qp = if config.rate_control == RateControl::Disabled {
            config.const_qp.for_type(picture_type) as i32
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
            codec: CodecEncodeInfo::H265(H265EncodeInfo {
                idr: frame.is_idr,
                is_reference: frame.is_reference,
                sps_id: self.sps.sps_seq_parameter_set_id,
                pps_id: self.pps.pps_pic_parameter_set_id,
                picture_type,
                pic_order_cnt: pic.pic_order_cnt,
                temporal_id: 0,
                constant_qp,
                ref_lists: ref_lists_info,
            }),
        });

        Ok(())
    }

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
    use crate::pool::{BitstreamBuffer, BitstreamBufferPool};

    #[test]
    fn ctb_alignment_sets_conformance_window() {
        let config = EncoderConfig::new(Codec::H265, 1920, 1080);
        let sps = sps(&config).unwrap();
        assert_eq!(sps.pic_width_in_luma_samples, 1920);
        assert_eq!(sps.pic_height_in_luma_samples, 1088);
        assert_eq!(sps.conf_win_bottom_offset, 4);
    }

    #[test]
    fn idr_then_p_reference_binding() {
        let config = EncoderConfig::new(Codec::H265, 64, 64);
        let mut state = H265State::new(&config).unwrap();

        let inputs = ImagePool::new(
            (0..2)
                .map(|i| PictureResource {
                    image_view: crate::driver::ImageViewId(10 + i),
                    coded_offset: vk::Offset2D::default(),
                    coded_extent: vk::Extent2D {
                        width: 64,
                        height: 64,
                    },
                    base_array_layer: 0,
                })
                .collect(),
        );
        let dpb_images = ImagePool::new(
            (0..4)
                .map(|i| PictureResource {
                    image_view: crate::driver::ImageViewId(20 + i),
                    coded_offset: vk::Offset2D::default(),
                    coded_extent: vk::Extent2D {
                        width: 64,
                        height: 64,
                    },
                    base_array_layer: 0,
                })
                .collect(),
        );
        let bitstreams = BitstreamBufferPool::new(vec![
            BitstreamBuffer {
                buffer: crate::driver::BufferId(1),
                size: 1 << 16,
                fence: crate::driver::FenceId(1),
            },
            BitstreamBuffer {
                buffer: crate::driver::BufferId(2),
                size: 1 << 16,
                fence: crate::driver::FenceId(2),
            },
        ]);
        let mut frames = FrameInfoPool::new(2);

        let mut idr = frames.try_acquire().unwrap();
        idr.is_idr = true;
        idr.is_reference = true;
        idr.gop.picture_type = FrameType::Idr;
        idr.src_image = inputs.acquire(vk::ImageLayout::VIDEO_ENCODE_SRC_KHR);
        idr.bitstream = bitstreams.acquire();
        state.process_dpb(&mut idr, &config, &dpb_images).unwrap();
        let idr_slot = idr
            .encode_info
            .as_ref()
            .unwrap()
            .setup_reference_slot
            .as_ref()
            .unwrap()
            .slot_index;
        frames.release(idr);

        let mut p = frames.try_acquire().unwrap();
        p.is_reference = true;
        p.gop.picture_type = FrameType::P;
        p.pic_order_cnt = 2;
        p.src_image = inputs.acquire(vk::ImageLayout::VIDEO_ENCODE_SRC_KHR);
        p.bitstream = bitstreams.acquire();
        state.process_dpb(&mut p, &config, &dpb_images).unwrap();

        let info = p.encode_info.as_ref().unwrap();
        assert_eq!(info.reference_slots.len(), 1);
        assert_eq!(info.reference_slots[0].slot_index, idr_slot);
        match &info.codec {
            CodecEncodeInfo::H265(h265) => {
                assert_eq!(h265.pic_order_cnt, 2);
                assert_eq!(h265.ref_lists.num_ref_idx_l0_active_minus1, 0);
            }
            other => panic!("wrong codec payload: {other:?}"),
        }
        frames.release(p);
    }
}
