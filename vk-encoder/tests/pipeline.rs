//! End-to-end pipeline runs against the mock driver.

use bytes::Bytes;
use vk_encoder::config::{Codec, EncoderConfig};
use vk_encoder::driver::CodecEncodeInfo;
use vk_encoder::driver::mock::{MOCK_H26X_PRELUDE, MockDriver};
use vk_encoder::gop::{FrameType, GopState, GopStructure};
use vk_encoder::source::RawFrame;
use vk_encoder::{EncodeError, VideoEncoder};

const W: u32 = 64;
const H: u32 = 64;

fn raw_frame(i: u64) -> RawFrame {
    let luma = vec![i as u8; (W * H) as usize];
    let chroma = vec![i as u8; (W * H / 4) as usize];
    RawFrame {
        planes: vec![
            Bytes::from(luma),
            Bytes::from(chroma.clone()),
            Bytes::from(chroma),
        ],
        strides: vec![W, W / 2, W / 2],
        timestamp: i,
    }
}

fn run(
    mut driver: MockDriver,
    mut config: EncoderConfig,
    num_frames: u64,
    setup: impl FnOnce(&mut MockDriver),
) -> (MockDriver, Vec<u8>, vk_encoder::EncodeStats) {
    setup(&mut driver);
    config.num_frames = num_frames;
    let mut encoder = VideoEncoder::new(driver, config, Vec::new()).unwrap();
    for i in 0..num_frames {
        encoder.encode_frame(&raw_frame(i)).unwrap();
    }
    encoder.finish().unwrap()
}

/// Input orders of submitted pictures, recovered from the codec POC.
fn submitted_inputs(driver: &MockDriver, codec: Codec) -> Vec<u32> {
    driver
        .submitted_encodes
        .iter()
        .map(|info| match (&info.codec, codec) {
            (CodecEncodeInfo::H264(h264), Codec::H264) => h264.pic_order_cnt as u32 / 2,
            (CodecEncodeInfo::H265(h265), Codec::H265) => h265.pic_order_cnt as u32 / 2,
            (CodecEncodeInfo::Av1(av1), Codec::Av1) => u32::from(av1.order_hint),
            other => panic!("unexpected payload: {other:?}"),
        })
        .collect()
}

/// Expected submission order: every reference drains the B-run loaded
/// before it, i.e. pictures sorted by encode order within each sequence.
fn expected_submission_order(config: &EncoderConfig, num_frames: u64) -> Vec<u32> {
    let structure = GopStructure::new(
        config.gop.gop_frame_count,
        config.gop.idr_period,
        config.gop.consecutive_b_frames,
        config.gop.temporal_layer_count,
        config.gop.last_frame_type,
        config.gop.pre_idr_anchor_type,
        config.gop.closed_gop,
    );
    let mut state = GopState::default();
    let mut pending: Vec<u32> = Vec::new();
    let mut order = Vec::new();
    for i in 0..num_frames {
        let (pos, _) = structure.position(&mut state, (num_frames - i) as u32);
        if pos.picture_type == FrameType::B {
            pending.push(pos.input_order);
        } else {
            order.push(pos.input_order);
            order.append(&mut pending);
        }
    }
    order.append(&mut pending);
    order
}

#[test]
fn h264_ipp_stream_layout() {
    let config = EncoderConfig::new(Codec::H264, W, H);
    let (driver, output, stats) = run(MockDriver::new(), config, 10, |_| {});

    assert_eq!(stats.frames_in, 10);
    assert_eq!(stats.frames_out, 10);
    assert_eq!(stats.corrupted_frames, 0);
    assert_eq!(driver.submitted_encodes.len(), 10);

    // The stream leads with the non-VCL prelude of the first IDR.
    assert_eq!(&output[..MOCK_H26X_PRELUDE.len()], MOCK_H26X_PRELUDE);
    assert!(output.len() > MOCK_H26X_PRELUDE.len());
}

#[test]
fn h264_submission_follows_encode_order() {
    let mut config = EncoderConfig::new(Codec::H264, W, H);
    config.gop.gop_frame_count = 8;
    config.gop.idr_period = 16;
    config.gop.consecutive_b_frames = 2;
    let num_frames = 20;

    let expected = expected_submission_order(&config, num_frames);
    let (driver, _, stats) = run(MockDriver::new(), config, num_frames, |_| {});

    assert_eq!(stats.frames_out, num_frames);
    assert_eq!(submitted_inputs(&driver, Codec::H264), expected);
}

#[test]
fn b_frames_submit_after_their_anchor() {
    let mut config = EncoderConfig::new(Codec::H264, W, H);
    config.gop.gop_frame_count = 8;
    config.gop.idr_period = 0;
    config.gop.consecutive_b_frames = 3;
    let num_frames = 17;

    let codec = config.codec;
    let expected = expected_submission_order(&config, num_frames);
    let (driver, _, _) = run(MockDriver::new(), config, num_frames, |_| {});
    let inputs = submitted_inputs(&driver, codec);
    assert_eq!(inputs, expected);

    // Every B picture submits after exactly one later input: its forward
    // anchor, the nearest following reference.
    for (i, &input) in inputs.iter().enumerate() {
        let later_before: Vec<u32> = inputs[..i].iter().copied().filter(|&a| a > input).collect();
        if let Some(&anchor) = later_before.first() {
            assert_eq!(later_before.len(), 1, "picture {input}");
            assert_eq!(
                anchor,
                inputs[..i].iter().copied().filter(|&a| a > input).min().unwrap(),
                "picture {input} must follow only its anchor {anchor}"
            );
        }
    }
}

#[test]
fn h265_end_to_end() {
    let mut config = EncoderConfig::new(Codec::H265, W, H);
    config.gop.gop_frame_count = 8;
    config.gop.idr_period = 16;
    config.gop.consecutive_b_frames = 1;
    let num_frames = 12;

    let expected = expected_submission_order(&config, num_frames);
    let (driver, output, stats) = run(MockDriver::new(), config, num_frames, |_| {});

    assert_eq!(stats.frames_out, num_frames);
    assert_eq!(submitted_inputs(&driver, Codec::H265), expected);
    assert_eq!(&output[..MOCK_H26X_PRELUDE.len()], MOCK_H26X_PRELUDE);
}

/// Parse the IVF container into (pts, payload) pairs.
fn parse_ivf(output: &[u8]) -> Vec<(u64, Vec<u8>)> {
    assert_eq!(&output[0..4], b"DKIF");
    assert_eq!(&output[8..12], b"AV01");
    let mut frames = Vec::new();
    let mut offset = 32;
    while offset < output.len() {
        let size = u32::from_le_bytes(output[offset..offset + 4].try_into().unwrap()) as usize;
        let pts_lo = u32::from_le_bytes(output[offset + 4..offset + 8].try_into().unwrap());
        let pts_hi = u32::from_le_bytes(output[offset + 8..offset + 12].try_into().unwrap());
        let pts = u64::from(pts_lo) | (u64::from(pts_hi) << 32);
        let payload = output[offset + 12..offset + 12 + size].to_vec();
        // Every temporal unit opens with the temporal delimiter OBU.
        assert_eq!(&payload[..2], &[0x12, 0x00]);
        frames.push((pts, payload));
        offset += 12 + size;
    }
    frames
}

#[test]
fn av1_emits_display_order_with_show_existing() {
    let mut config = EncoderConfig::new(Codec::Av1, W, H);
    config.gop.gop_frame_count = 8;
    config.gop.idr_period = 0;
    config.gop.consecutive_b_frames = 2;
    let num_frames = 12;

    let (_driver, output, stats) = run(MockDriver::new(), config, num_frames, |_| {});

    // Flushing drains every B-run: one container frame per input, counting
    // the synthesized show_existing_frame records.
    assert_eq!(stats.frames_out, num_frames);
    let frames = parse_ivf(&output);
    assert_eq!(frames.len(), num_frames as usize);

    // Display order: pts strictly ascending 0..n.
    let pts: Vec<u64> = frames.iter().map(|(pts, _)| *pts).collect();
    assert_eq!(pts, (0..num_frames).collect::<Vec<_>>());

    // The reordered anchors show up as tiny frame-header-only records
    // (TD + 3-byte OBU) at their display positions.
    let show_existing: Vec<u64> = frames
        .iter()
        .filter(|(_, payload)| payload.len() == 5 && payload[2] == 0x1a)
        .map(|(pts, _)| *pts)
        .collect();
    assert_eq!(show_existing, vec![3, 6, 8, 11]);
}

#[test]
fn av1_without_b_frames_has_no_show_existing() {
    let mut config = EncoderConfig::new(Codec::Av1, W, H);
    config.gop.gop_frame_count = 8;
    config.gop.idr_period = 0;
    config.gop.consecutive_b_frames = 0;
    let num_frames = 8;

    let (_driver, output, stats) = run(MockDriver::new(), config, num_frames, |_| {});
    assert_eq!(stats.frames_out, num_frames);
    let frames = parse_ivf(&output);
    assert_eq!(frames.len(), num_frames as usize);
    assert!(frames.iter().all(|(_, payload)| payload.len() > 5));
}

#[test]
fn corrupted_reference_triggers_list_modification() {
    let mut config = EncoderConfig::new(Codec::H264, W, H);
    config.gop.gop_frame_count = 16;
    config.gop.idr_period = 0;
    config.gop.consecutive_b_frames = 0;
    // Assemble every picture as soon as it is submitted so the corruption
    // is known before the next picture builds its lists.
    config.batch_size = 1;
    config.num_batches = 1;
    let num_frames = 5;

    let (driver, _, stats) = run(MockDriver::new(), config, num_frames, |driver| {
        // Second picture (the first P) fails its feedback query.
        driver.inject_query_error_at(1);
    });

    assert_eq!(stats.corrupted_frames, 1);
    assert_eq!(stats.frames_out, num_frames - 1);

    let corrupted_slot = match &driver.submitted_encodes[1].codec {
        CodecEncodeInfo::H264(_) => driver.submitted_encodes[1]
            .setup_reference_slot
            .as_ref()
            .unwrap()
            .slot_index,
        other => panic!("unexpected payload: {other:?}"),
    };

    // Every later P routes around the corrupted slot and carries the
    // synthesized modification commands for the decoder.
    for info in &driver.submitted_encodes[2..] {
        match &info.codec {
            CodecEncodeInfo::H264(h264) => {
                assert!(h264.ref_lists.ref_pic_list_modification_flag_l0);
                assert!(!h264.ref_lists.list0_mod_ops.is_empty());
                let active = usize::from(h264.ref_lists.num_ref_idx_l0_active_minus1) + 1;
                assert!(
                    !h264.ref_lists.ref_pic_list0[..active]
                        .contains(&(corrupted_slot as u8))
                );
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }
}

#[test]
fn fence_timeout_corrupts_picture_and_continues() {
    let mut config = EncoderConfig::new(Codec::H264, W, H);
    config.batch_size = 1;
    config.num_batches = 1;
    let num_frames = 6;

    let (_driver, _, stats) = run(MockDriver::new(), config, num_frames, |driver| {
        driver.inject_fence_timeout_at(2);
    });

    assert_eq!(stats.frames_in, num_frames);
    assert_eq!(stats.corrupted_frames, 1);
    assert_eq!(stats.frames_out, num_frames - 1);
}

#[test]
fn corrupted_idr_forces_session_reset() {
    let mut config = EncoderConfig::new(Codec::H264, W, H);
    config.batch_size = 1;
    config.num_batches = 1;
    let num_frames = 4;

    let (driver, _, stats) = run(MockDriver::new(), config, num_frames, |driver| {
        driver.inject_query_error_at(0);
    });

    assert_eq!(stats.corrupted_frames, 1);
    // The sequence restarted from a fresh IDR on a reset session.
    assert_eq!(driver.session_resets, 1);
    match &driver.submitted_encodes[1].codec {
        CodecEncodeInfo::H264(h264) => assert!(h264.idr),
        other => panic!("unexpected payload: {other:?}"),
    }
}

#[test]
fn hw_load_balancing_round_robins_queues() {
    let mut config = EncoderConfig::new(Codec::H264, W, H);
    config.enable_hw_load_balancing = true;
    let num_frames = 6;

    let (driver, _, _) = run(MockDriver::with_queue_count(2), config, num_frames, |_| {});
    assert_eq!(driver.submission_queues.len(), num_frames as usize);
    for (i, queue) in driver.submission_queues.iter().enumerate() {
        assert_eq!(*queue, (i % 2) as u32);
    }
}

#[test]
fn cancel_rejects_further_input() {
    let config = EncoderConfig::new(Codec::H264, W, H);
    let mut encoder = VideoEncoder::new(MockDriver::new(), config, Vec::new()).unwrap();
    encoder.encode_frame(&raw_frame(0)).unwrap();
    encoder.cancel();
    assert!(matches!(
        encoder.encode_frame(&raw_frame(1)),
        Err(EncodeError::Cancelled)
    ));
    // In-flight pictures still drain.
    let (_, _, stats) = encoder.finish().unwrap();
    assert_eq!(stats.frames_out, 1);
}

#[test]
fn unknown_stream_length_drains_leftover_b_run() {
    let mut config = EncoderConfig::new(Codec::H264, W, H);
    config.gop.gop_frame_count = 8;
    config.gop.idr_period = 0;
    config.gop.consecutive_b_frames = 2;
    config.num_frames = 0; // length not known up front

    let mut encoder = VideoEncoder::new(MockDriver::new(), config, Vec::new()).unwrap();
    // Ends mid-B-run: 0 IDR, 1 B, 2 B with no anchor arriving.
    for i in 0..3 {
        encoder.encode_frame(&raw_frame(i)).unwrap();
    }
    let (_, _, stats) = encoder.finish().unwrap();
    assert_eq!(stats.frames_in, 3);
    assert_eq!(stats.frames_out, 3);
}
