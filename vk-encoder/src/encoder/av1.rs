//! AV1 sequence header, frame-header construction and per-frame submission
//! assembly, including synthesized show_existing_frame records for frames
//! coded ahead of their display position.

use ash::vk;
use bytes::Bytes;
use tracing::debug;

use crate::bitstream;
use crate::config::{EncoderConfig, RateControl};
use crate::dpb::av1::{
    Av1Dpb, Av1FrameType, Av1PredictionMode, Av1ReferenceCaps, Av1ReferenceName,
    NUM_REF_FRAMES, ORDER_HINT_BITS, PRIMARY_REF_NONE, REFS_PER_FRAME,
};
use crate::driver::{CodecEncodeInfo, CodecHeaders, CodecReferenceInfo, EncodeInfo, ReferenceSlot};
use crate::gop::FrameType;
use crate::pool::ImagePool;

use super::{EncodeError, frame::FrameInfo};

pub use crate::dpb::av1::Av1ReferenceInfo;

const FRAME_ID_BITS: u32 = 15;
const DELTA_FRAME_ID_BITS: u32 = 14;

/// Sequence header fields the frame layer depends on. The driver encodes
/// the full OBU through the session-parameters object.
#[derive(Debug, Clone, Copy)]
pub struct Av1SequenceHeader {
    pub seq_profile: u8,
    pub max_frame_width: u32,
    pub max_frame_height: u32,
    pub order_hint_bits: u32,
    pub enable_order_hint: bool,
    pub frame_id_numbers_present: bool,
    pub delta_frame_id_length: u32,
    pub additional_frame_id_length: u32,
    pub enable_cdef: bool,
    pub enable_restoration: bool,
    pub timing_info_present: bool,
    pub equal_picture_interval: bool,
    pub decoder_model_info_present: bool,
    pub frame_presentation_time_length: u32,
}

impl Av1SequenceHeader {
    pub fn new(config: &EncoderConfig) -> Self {
        Av1SequenceHeader {
            seq_profile: 0,
            max_frame_width: config.max_coded_extent().width,
            max_frame_height: config.max_coded_extent().height,
            order_hint_bits: ORDER_HINT_BITS,
            enable_order_hint: true,
            frame_id_numbers_present: false,
            delta_frame_id_length: DELTA_FRAME_ID_BITS,
            additional_frame_id_length: FRAME_ID_BITS - DELTA_FRAME_ID_BITS,
            enable_cdef: config.av1.enable_cdef,
            enable_restoration: config.av1.enable_loop_restoration,
            timing_info_present: false,
            equal_picture_interval: true,
            decoder_model_info_present: false,
            frame_presentation_time_length: 0,
        }
    }

    pub fn frame_id_bits(&self) -> u32 {
        self.delta_frame_id_length + self.additional_frame_id_length
    }
}

/// Tile layout, either uniform or explicitly sized in superblocks.
#[derive(Debug, Clone, Default)]
pub struct Av1TileInfo {
    pub uniform_tile_spacing: bool,
    pub tile_cols: u8,
    pub tile_rows: u8,
    pub width_in_sbs_minus_1: Vec<u16>,
    pub height_in_sbs_minus_1: Vec<u16>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Av1Quantization {
    pub base_q_idx: u8,
    pub delta_q_y_dc: i8,
    pub delta_q_u_dc: i8,
    pub delta_q_u_ac: i8,
    pub delta_q_v_dc: i8,
    pub delta_q_v_ac: i8,
    pub using_qmatrix: bool,
    pub qm_y: u8,
    pub qm_u: u8,
    pub qm_v: u8,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Av1LoopFilter {
    pub loop_filter_level: [u8; 4],
    pub loop_filter_sharpness: u8,
    pub delta_enabled: bool,
    pub delta_update: bool,
    /// Bitmask of entries in `ref_deltas` that carry an update.
    pub update_ref_delta: u8,
    pub ref_deltas: [i8; 8],
    pub update_mode_delta: u8,
    pub mode_deltas: [i8; 2],
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Av1Cdef {
    pub damping_minus_3: u8,
    pub bits: u8,
    pub y_pri_strength: [u8; 8],
    pub y_sec_strength: [u8; 8],
    pub uv_pri_strength: [u8; 8],
    pub uv_sec_strength: [u8; 8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Av1RestorationType {
    #[default]
    None,
    Wiener,
    Sgrproj,
    Switchable,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Av1LoopRestoration {
    pub restoration_type: [Av1RestorationType; 3],
    pub restoration_size: [u16; 3],
}

/// Rate-control grouping of the picture, mirroring the per-type budget
/// split of the hardware rate controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateControlGroup {
    Intra,
    Predictive,
    Bipredictive,
}

/// Codec payload of one AV1 encode submission.
#[derive(Debug, Clone)]
pub struct Av1EncodeInfo {
    pub frame_type: Av1FrameType,
    pub ref_name: Option<Av1ReferenceName>,
    pub order_hint: u8,
    pub current_frame_id: u32,
    pub refresh_frame_flags: u8,
    pub primary_ref_frame: u8,
    pub error_resilient_mode: bool,
    pub show_frame: bool,
    pub showable_frame: bool,
    pub ref_frame_idx: [i8; REFS_PER_FRAME],
    pub ref_order_hint: [u8; NUM_REF_FRAMES],
    pub delta_frame_id_minus_1: [u32; REFS_PER_FRAME],
    /// Reference name → DPB slot, -1 when the name is inactive.
    pub reference_name_slot_indices: [i32; REFS_PER_FRAME],
    pub prediction_mode: Av1PredictionMode,
    pub rate_control_group: RateControlGroup,
    pub primary_reference_cdf_only: bool,
    pub constant_q_index: u8,
    pub uses_loop_restoration: bool,
    pub uses_chroma_loop_restoration: bool,
    pub tile: Option<Av1TileInfo>,
    pub quantization: Option<Av1Quantization>,
    pub loop_filter: Option<Av1LoopFilter>,
    pub cdef: Option<Av1Cdef>,
    pub loop_restoration: Option<Av1LoopRestoration>,
}

#[derive(Debug)]
pub struct Av1State {
    pub dpb: Av1Dpb,
    seq: Av1SequenceHeader,
    last_key_frame_order_hint: u32,
    num_b_frames_to_encode: u32,
}

impl Av1State {
    pub fn new(config: &EncoderConfig, caps: &Av1ReferenceCaps) -> Result<Self, EncodeError> {
        let seq = Av1SequenceHeader::new(config);
        let mut dpb = Av1Dpb::new();
        dpb.sequence_start(
            caps,
            config.max_dpb_slots(),
            u32::from(config.gop.consecutive_b_frames),
            config.tuning_mode,
            config.quality_level,
        );
        Ok(Av1State {
            dpb,
            seq,
            last_key_frame_order_hint: 0,
            num_b_frames_to_encode: 0,
        })
    }

    pub fn headers(&self) -> CodecHeaders {
        CodecHeaders::Av1 {
            sequence_header: self.seq,
        }
    }

    pub fn sequence_header(&self) -> &Av1SequenceHeader {
        &self.seq
    }

    /// Called in input order as frames are loaded, before any deferral.
    pub fn on_frame_loaded(&mut self, frame: &mut FrameInfo) {
        if frame.gop.picture_type == FrameType::B {
            self.num_b_frames_to_encode += 1;
        }
        if frame.gop.picture_type == FrameType::Idr {
            self.last_key_frame_order_hint = frame.gop.input_order;
        }
        // Display order is tracked relative to the last key frame.
        frame.pic_order_cnt =
            (frame.gop.input_order - self.last_key_frame_order_hint) as i32;
    }

    /// Admit the picture, compute reference names / virtual-buffer updates
    /// and bake the submission descriptor. show_existing_frame pictures
    /// update the DPB maps but produce no descriptor.
    pub fn process_dpb(
        &mut self,
        frame: &mut FrameInfo,
        config: &EncoderConfig,
        dpb_images: &ImagePool,
    ) -> Result<(), EncodeError> {
        let pic_order_cnt = frame.pic_order_cnt as u32;

        // Reference-name request mask: open-GOP I pictures coded in display
        // position stay INTRA; anchors carrying a deferred B-run become the
        // backward ALTREF, and plain P chains refresh GOLDEN.
        let mut requested = 0u32;
        if frame.gop.picture_type != FrameType::B {
            if frame.gop.picture_type.is_intra()
                && frame.gop.input_order == frame.gop.encode_order
            {
                requested = 1 << Av1ReferenceName::Intra.index();
            } else if config.gop.consecutive_b_frames > 0 {
                requested = if self.num_b_frames_to_encode == 0 {
                    1 << Av1ReferenceName::Golden.index()
                } else {
                    1 << Av1ReferenceName::Altref.index()
                };
            }
        }

        let mut ref_name =
            self.dpb
                .assign_reference_name(frame.gop.picture_type, requested, frame.is_reference);

        let mut info = self.initialize_frame_header(frame, config, &mut ref_name)?;

        if !frame.av1.show_existing_frame {
            self.dpb.setup_reference_frame_groups(
                frame.gop.picture_type,
                info.frame_type,
                pic_order_cnt,
                true,
            );
            // A B picture without any future reference degrades to P.
            if frame.gop.picture_type == FrameType::B && self.dpb.num_refs_l1() == 0 {
                debug!(
                    input_order = frame.gop.input_order,
                    "no backward reference available, coding B picture as P"
                );
                frame.gop.picture_type = FrameType::P;
                self.num_b_frames_to_encode = self.num_b_frames_to_encode.saturating_sub(1);
            }
        }

        let update_type = self.dpb.frame_update_type(ref_name, frame.av1.overlay_frame);

        let dpb_idx = self.dpb.picture_start(
            info.frame_type,
            ref_name,
            pic_order_cnt,
            info.current_frame_id,
            frame.timestamp,
            frame.av1.show_existing_frame,
            frame.av1.frame_to_show_buf_id,
        )?;

        self.dpb.configure_ref_buf_update(
            frame.av1.shown_key_frame_or_switch,
            frame.av1.show_existing_frame,
            update_type,
        );
        info.refresh_frame_flags = self.dpb.refresh_frame_flags(
            frame.av1.shown_key_frame_or_switch,
            frame.av1.show_existing_frame,
        );

        if frame.av1.show_existing_frame {
            self.dpb.picture_end(
                dpb_idx,
                None,
                true,
                frame.av1.shown_key_frame_or_switch,
                info.error_resilient_mode,
                frame.av1.overlay_frame,
                ref_name,
                update_type,
            )?;
            return Ok(());
        }

        // The reconstruction is stored whenever some virtual buffer will
        // reference it.
        if frame.is_reference || info.refresh_frame_flags != 0 {
            frame.setup_image = Some(
                dpb_images
                    .acquire(vk::ImageLayout::VIDEO_ENCODE_DPB_KHR)
                    .ok_or(EncodeError::PoolExhausted("DPB images"))?,
            );
        }

        let setup_reference_slot = frame.setup_image.as_ref().map(|image| ReferenceSlot {
            slot_index: dpb_idx as i32,
            resource: image.resource(),
            std_info: Some(CodecReferenceInfo::Av1(Av1ReferenceInfo {
                ref_frame_id: 0,
                frame_type: info.frame_type,
                order_hint: info.order_hint,
            })),
        });

        // Bind every group reference once, recording the name → slot map.
        let mut reference_slots: Vec<ReferenceSlot> = Vec::new();
        let mut primary_ref_cdf_only = info.primary_ref_frame != PRIMARY_REF_NONE;
        for group in 0..2 {
            for i in 0..self.dpb.num_refs_in_group(group) {
                let (name_minus_1, dpb_id) = self.dpb.group_ref(group, i);
                if dpb_id < 0 {
                    continue;
                }
                debug_assert_eq!(info.reference_name_slot_indices[name_minus_1], -1);
                info.reference_name_slot_indices[name_minus_1] = dpb_id;

                if info.primary_ref_frame != PRIMARY_REF_NONE
                    && name_minus_1 == info.primary_ref_frame as usize
                {
                    primary_ref_cdf_only = false;
                }

                let image = self
                    .dpb
                    .image(dpb_id as usize)
                    .ok_or(EncodeError::MissingReference(dpb_id as usize))?;
                if reference_slots.iter().any(|r| r.slot_index == dpb_id) {
                    continue;
                }
                reference_slots.push(ReferenceSlot {
                    slot_index: dpb_id,
                    resource: image.resource(),
                    std_info: Some(CodecReferenceInfo::Av1(
                        self.dpb.fill_std_reference_info(dpb_id as usize),
                    )),
                });
                frame.reference_images.push(image);
            }
        }

        let last_present =
            info.reference_name_slot_indices[Av1ReferenceName::Last.inter_index()] != -1;
        let bwd_present =
            info.reference_name_slot_indices[Av1ReferenceName::Bwdref.inter_index()] != -1;
        let alt_present =
            info.reference_name_slot_indices[Av1ReferenceName::Altref.inter_index()] != -1;
        info.prediction_mode = self.dpb.prediction_mode(
            frame.gop.picture_type,
            last_present,
            bwd_present,
            alt_present,
        );

        // A primary reference used only to seed the CDF still has to be
        // visible to the hardware, without counting as a prediction source.
        if info.primary_ref_frame != PRIMARY_REF_NONE && primary_ref_cdf_only {
            let dpb_id = self.dpb.dpb_idx_for_ref_index(info.primary_ref_frame as usize);
            if dpb_id >= 0 {
                let image = self
                    .dpb
                    .image(dpb_id as usize)
                    .ok_or(EncodeError::MissingReference(dpb_id as usize))?;
                info.reference_name_slot_indices[info.primary_ref_frame as usize] = dpb_id;
                if !reference_slots.iter().any(|r| r.slot_index == dpb_id) {
                    reference_slots.push(ReferenceSlot {
                        slot_index: dpb_id,
                        resource: image.resource(),
                        std_info: Some(CodecReferenceInfo::Av1(
                            self.dpb.fill_std_reference_info(dpb_id as usize),
                        )),
                    });
                    frame.reference_images.push(image);
                }
            }
        }
        info.primary_reference_cdf_only = primary_ref_cdf_only;

        info.rate_control_group = match frame.gop.picture_type {
            FrameType::P => RateControlGroup::Predictive,
            FrameType::B => RateControlGroup::Bipredictive,
            _ => RateControlGroup::Intra,
        };

        if config.rate_control == RateControl::Disabled {
            info.constant_q_index = config.const_qp.for_type(frame.gop.picture_type) as u8;
            if let Some(quant) = &mut info.quantization {
                quant.base_q_idx = info.constant_q_index;
            }
        }

        self.dpb.picture_end(
            dpb_idx,
            frame.setup_image.clone(),
            false,
            frame.av1.shown_key_frame_or_switch,
            info.error_resilient_mode,
            frame.av1.overlay_frame,
            ref_name,
            update_type,
        )?;

        if frame.gop.picture_type == FrameType::B {
            debug_assert!(self.num_b_frames_to_encode > 0);
            self.num_b_frames_to_encode = self.num_b_frames_to_encode.saturating_sub(1);
        }

        let src_image = frame
            .src_image
            .as_ref()
            .ok_or(EncodeError::MissingInput)?;
        let bitstream = frame
            .bitstream
            .as_ref()
            .ok_or(EncodeError::PoolExhausted("bitstream buffers"))?
            .buffer();

        frame.av1.show_frame = info.show_frame;
        frame.encode_info = Some(EncodeInfo {
            src_picture_resource: src_image.resource(),
            setup_reference_slot,
            reference_slots,
            dst_buffer: bitstream.buffer,
            dst_buffer_offset: 0,
            dst_buffer_range: bitstream.size,
            query_slot: frame.query_slot(),
            codec: CodecEncodeInfo::Av1(Box::new(info)),
        });

        Ok(())
    }

    /// Frame-header initialization: frame type, show flags, per-type tool
    /// defaults and the primary reference. For overlay pictures the header
    /// re-targets the shown buffer.
    fn initialize_frame_header(
        &mut self,
        frame: &mut FrameInfo,
        config: &EncoderConfig,
        ref_name: &mut Option<Av1ReferenceName>,
    ) -> Result<Av1EncodeInfo, EncodeError> {
        let pic_order_cnt = frame.pic_order_cnt as u32;

        let mut frame_type = match frame.gop.picture_type {
            FrameType::Idr => Av1FrameType::Key,
            FrameType::I | FrameType::IntraRefresh => Av1FrameType::IntraOnly,
            _ => Av1FrameType::Inter,
        };
        let mut current_frame_id =
            (frame.gop.encode_order as u64 % (1u64 << self.seq.frame_id_bits())) as u32;

        if frame.av1.overlay_frame {
            debug_assert!(frame.av1.show_existing_frame);
            let buf_id = self.dpb.overlay_ref_buf_id(pic_order_cnt);
            if buf_id < 0 {
                return Err(EncodeError::MissingReference(pic_order_cnt as usize));
            }
            frame.av1.frame_to_show_buf_id = buf_id;
            let dpb_id = self.dpb.ref_buf_dpb_id(buf_id);
            *ref_name = self.dpb.ref_name_of(dpb_id as usize);
            frame_type = self.dpb.frame_type(dpb_id as usize);
            current_frame_id = self.dpb.frame_id(dpb_id as usize);
        }

        // Backward-named pictures are coded unshown and displayed later
        // through a show_existing_frame record.
        let show_frame = !(matches!(
            ref_name,
            Some(Av1ReferenceName::Bwdref)
                | Some(Av1ReferenceName::Altref2)
                | Some(Av1ReferenceName::Altref)
        ) && !frame.av1.overlay_frame);
        let showable_frame = if show_frame {
            frame_type != Av1FrameType::Key
        } else {
            true
        };
        let error_resilient_mode = frame_type == Av1FrameType::Key && show_frame;
        frame.av1.shown_key_frame_or_switch = (frame_type == Av1FrameType::Key && show_frame)
            || frame_type == Av1FrameType::Switch;
        frame.av1.current_frame_id = current_frame_id;

        let mut info = Av1EncodeInfo {
            frame_type,
            ref_name: *ref_name,
            order_hint: (pic_order_cnt % (1 << self.seq.order_hint_bits)) as u8,
            current_frame_id,
            refresh_frame_flags: 0,
            primary_ref_frame: PRIMARY_REF_NONE,
            error_resilient_mode,
            show_frame,
            showable_frame,
            ref_frame_idx: [-1; REFS_PER_FRAME],
            ref_order_hint: [0; NUM_REF_FRAMES],
            delta_frame_id_minus_1: [0; REFS_PER_FRAME],
            reference_name_slot_indices: [-1; REFS_PER_FRAME],
            prediction_mode: Av1PredictionMode::IntraOnly,
            rate_control_group: RateControlGroup::Intra,
            primary_reference_cdf_only: false,
            constant_q_index: 0,
            uses_loop_restoration: false,
            uses_chroma_loop_restoration: false,
            tile: None,
            quantization: None,
            loop_filter: None,
            cdef: None,
            loop_restoration: None,
        };

        if !frame.av1.show_existing_frame
            && matches!(frame_type, Av1FrameType::Inter | Av1FrameType::Switch)
        {
            for name in Av1ReferenceName::INTER_NAMES {
                if self.seq.frame_id_numbers_present {
                    let dpb_id = self.dpb.ref_frame_dpb_id(name);
                    if dpb_id >= 0 {
                        let bits = self.seq.frame_id_bits();
                        let delta = (current_frame_id
                            .wrapping_sub(self.dpb.frame_id(dpb_id as usize))
                            .wrapping_add(1 << bits))
                            % (1 << bits);
                        info.delta_frame_id_minus_1[name.inter_index()] =
                            delta.saturating_sub(1);
                    }
                }
                info.ref_frame_idx[name.inter_index()] = self.dpb.ref_buf_id(name) as i8;
            }
            info.ref_order_hint = self.dpb.ref_order_hints();
        }

        info.primary_ref_frame = self.dpb.primary_ref_frame(
            frame_type,
            *ref_name,
            error_resilient_mode,
            frame.av1.overlay_frame,
        );

        let picture_type = frame.gop.picture_type;
        if config.av1.enable_tiles {
            info.tile = Some(config.av1.custom_tiles.clone().unwrap_or(Av1TileInfo {
                uniform_tile_spacing: true,
                tile_cols: 2,
                tile_rows: 2,
                width_in_sbs_minus_1: Vec::new(),
                height_in_sbs_minus_1: Vec::new(),
            }));
        }
        if config.av1.enable_quant {
            info.quantization = Some(config.av1.custom_quant.unwrap_or(Av1Quantization {
                base_q_idx: match picture_type {
                    FrameType::P => 131,
                    FrameType::B => 147,
                    _ => 114,
                },
                ..Av1Quantization::default()
            }));
        }
        if config.av1.enable_loop_filter {
            info.loop_filter = Some(config.av1.custom_loop_filter.unwrap_or_else(|| {
                let level = match picture_type {
                    FrameType::Idr => 11,
                    FrameType::I | FrameType::IntraRefresh => 15,
                    FrameType::P => 18,
                    FrameType::B => 23,
                };
                let mut ref_deltas = [0i8; 8];
                ref_deltas[0] = 1;
                ref_deltas[4] = -1;
                ref_deltas[6] = -1;
                ref_deltas[7] = -1;
                Av1LoopFilter {
                    loop_filter_level: [level, level, level, level],
                    loop_filter_sharpness: 0,
                    delta_enabled: true,
                    delta_update: true,
                    update_ref_delta: 0xd1,
                    ref_deltas,
                    update_mode_delta: 0,
                    mode_deltas: [0; 2],
                }
            }));
        }
        if config.av1.enable_cdef {
            info.cdef = Some(config.av1.custom_cdef.unwrap_or(Av1Cdef {
                damping_minus_3: 2,
                bits: 2,
                y_pri_strength: [0, 2, 4, 9, 0, 0, 0, 0],
                y_sec_strength: [0; 8],
                uv_pri_strength: [0; 8],
                uv_sec_strength: [0; 8],
            }));
        }
        if config.av1.enable_loop_restoration {
            let lr = config
                .av1
                .custom_loop_restoration
                .unwrap_or(Av1LoopRestoration {
                    restoration_type: [
                        Av1RestorationType::Sgrproj,
                        Av1RestorationType::None,
                        Av1RestorationType::None,
                    ],
                    restoration_size: [1, 0, 0],
                });
            for (plane, ty) in lr.restoration_type.iter().enumerate() {
                if *ty != Av1RestorationType::None {
                    info.uses_loop_restoration = true;
                    if plane > 0 {
                        info.uses_chroma_loop_restoration = true;
                    }
                }
            }
            info.loop_restoration = Some(lr);
        }

        Ok(info)
    }

    /// Frame-header OBU bytes for a show_existing_frame record.
    pub fn show_existing_header(&self, frame: &FrameInfo) -> Bytes {
        let presentation_time = (self.seq.decoder_model_info_present
            && !self.seq.equal_picture_interval)
            .then_some((frame.timestamp, self.seq.frame_presentation_time_length));
        let frame_id = self
            .seq
            .frame_id_numbers_present
            .then_some((frame.av1.current_frame_id, self.seq.frame_id_bits()));
        bitstream::show_existing_frame_obu(
            (frame.av1.frame_to_show_buf_id & 7) as u8,
            presentation_time,
            frame_id,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Codec;
    use crate::driver::{BufferId, FenceId, ImageViewId, PictureResource};
    use crate::encoder::frame::FrameInfoPool;
    use crate::gop::{GopState, GopStructure};
    use crate::pool::{BitstreamBuffer, BitstreamBufferPool};

    struct Fixture {
        config: EncoderConfig,
        state: Av1State,
        inputs: ImagePool,
        dpb_images: ImagePool,
        bitstreams: BitstreamBufferPool,
        frames: FrameInfoPool,
    }

    fn fixture() -> Fixture {
        let mut config = EncoderConfig::new(Codec::Av1, 64, 64);
        config.gop.consecutive_b_frames = 2;
        let state = Av1State::new(&config, &Av1ReferenceCaps::default()).unwrap();
        let images = |base: u64, n: u64| {
            ImagePool::new(
                (0..n)
                    .map(|i| PictureResource {
                        image_view: ImageViewId(base + i),
                        coded_offset: vk::Offset2D::default(),
                        coded_extent: vk::Extent2D {
                            width: 64,
                            height: 64,
                        },
                        base_array_layer: 0,
                    })
                    .collect(),
            )
        };
        Fixture {
            inputs: images(100, 8),
            dpb_images: images(200, 12),
            bitstreams: BitstreamBufferPool::new(
                (0..8)
                    .map(|i| BitstreamBuffer {
                        buffer: BufferId(i + 1),
                        size: 1 << 16,
                        fence: FenceId(i + 1),
                    })
                    .collect(),
            ),
            frames: FrameInfoPool::new(8),
            config,
            state,
        }
    }

    fn load(fx: &mut Fixture, pos: crate::gop::GopPosition, is_idr: bool) -> FrameInfo {
        let mut frame = fx.frames.try_acquire().unwrap();
        frame.gop = pos;
        frame.is_idr = is_idr;
        frame.is_reference = pos.is_reference();
        frame.timestamp = u64::from(pos.input_order);
        frame.src_image = fx.inputs.acquire(vk::ImageLayout::VIDEO_ENCODE_SRC_KHR);
        frame.bitstream = fx.bitstreams.acquire();
        fx.state.on_frame_loaded(&mut frame);
        frame
    }

    fn av1_info(frame: &FrameInfo) -> &Av1EncodeInfo {
        match &frame.encode_info.as_ref().unwrap().codec {
            CodecEncodeInfo::Av1(info) => info,
            other => panic!("wrong codec payload: {other:?}"),
        }
    }

    #[test]
    fn key_frame_header() {
        let mut fx = fixture();
        let structure = GopStructure::new(8, 0, 2, 1, FrameType::P, FrameType::P, false);
        let mut gop_state = GopState::default();
        let (pos, is_idr) = structure.position(&mut gop_state, 100);

        let mut frame = load(&mut fx, pos, is_idr);
        let config = fx.config.clone();
        fx.state
            .process_dpb(&mut frame, &config, &fx.dpb_images)
            .unwrap();

        let info = av1_info(&frame);
        assert_eq!(info.frame_type, Av1FrameType::Key);
        assert!(info.show_frame);
        assert!(info.error_resilient_mode);
        assert_eq!(info.refresh_frame_flags, 0xff);
        assert_eq!(info.primary_ref_frame, PRIMARY_REF_NONE);
        assert_eq!(info.prediction_mode, Av1PredictionMode::IntraOnly);
        assert!(frame.encode_info.as_ref().unwrap().reference_slots.is_empty());
    }

    #[test]
    fn deferred_anchor_becomes_unshown_altref() {
        let mut fx = fixture();
        let structure = GopStructure::new(8, 0, 2, 1, FrameType::P, FrameType::P, false);
        let mut gop_state = GopState::default();

        // IDR at 0, B at 1 and 2, anchor P at 3.
        let (idr_pos, _) = structure.position(&mut gop_state, 100);
        let (b1_pos, _) = structure.position(&mut gop_state, 99);
        let (b2_pos, _) = structure.position(&mut gop_state, 98);
        let (p_pos, _) = structure.position(&mut gop_state, 97);
        assert_eq!(p_pos.picture_type, FrameType::P);
        assert_eq!(p_pos.encode_order, 1);

        let mut idr = load(&mut fx, idr_pos, true);
        let config = fx.config.clone();
        fx.state.process_dpb(&mut idr, &config, &fx.dpb_images).unwrap();

        let mut b1 = load(&mut fx, b1_pos, false);
        let mut b2 = load(&mut fx, b2_pos, false);

        // The anchor is processed before its B-run (encode order).
        let mut anchor = load(&mut fx, p_pos, false);
        fx.state
            .process_dpb(&mut anchor, &config, &fx.dpb_images)
            .unwrap();
        let info = av1_info(&anchor);
        assert_eq!(info.ref_name, Some(Av1ReferenceName::Altref));
        assert!(!info.show_frame);
        assert!(info.showable_frame);

        // The B picture sees both the key frame and the ALTREF anchor.
        fx.state.process_dpb(&mut b1, &config, &fx.dpb_images).unwrap();
        let info = av1_info(&b1);
        assert_eq!(info.prediction_mode, Av1PredictionMode::BidirectionalCompound);
        let alt_slot =
            info.reference_name_slot_indices[Av1ReferenceName::Altref.inter_index()];
        assert!(alt_slot >= 0);

        fx.state.process_dpb(&mut b2, &config, &fx.dpb_images).unwrap();

        for f in [idr, b1, b2, anchor] {
            fx.frames.release(f);
        }
    }

    #[test]
    fn show_existing_frame_updates_maps_without_descriptor() {
        let mut fx = fixture();
        let structure = GopStructure::new(8, 0, 2, 1, FrameType::P, FrameType::P, false);
        let mut gop_state = GopState::default();

        let (idr_pos, _) = structure.position(&mut gop_state, 100);
        let (_b1_pos, _) = structure.position(&mut gop_state, 99);
        let (_b2_pos, _) = structure.position(&mut gop_state, 98);
        let (p_pos, _) = structure.position(&mut gop_state, 97);

        let mut idr = load(&mut fx, idr_pos, true);
        let config = fx.config.clone();
        fx.state.process_dpb(&mut idr, &config, &fx.dpb_images).unwrap();

        let mut anchor = load(&mut fx, p_pos, false);
        fx.state
            .process_dpb(&mut anchor, &config, &fx.dpb_images)
            .unwrap();

        // Synthesized display record for the anchor.
        let mut shown = fx.frames.try_acquire().unwrap();
        shown.gop = anchor.gop;
        shown.pic_order_cnt = anchor.pic_order_cnt;
        shown.timestamp = anchor.timestamp;
        shown.av1.show_existing_frame = true;
        shown.av1.overlay_frame = true;
        fx.state
            .process_dpb(&mut shown, &config, &fx.dpb_images)
            .unwrap();

        assert!(shown.encode_info.is_none());
        assert!(shown.av1.frame_to_show_buf_id >= 0);
        let header = fx.state.show_existing_header(&shown);
        // obu header + size + one payload byte.
        assert_eq!(header.len(), 3);

        for f in [idr, anchor, shown] {
            fx.frames.release(f);
        }
    }
}
