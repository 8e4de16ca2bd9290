//! Bitstream output: a small MSB-first bit writer, AV1 OBU synthesis for
//! show_existing_frame headers, and the IVF / Annex-B file payload layers.

use std::io::{self, Write};

use bytes::{BufMut, Bytes, BytesMut};

/// MSB-first bit writer with uleb128 and trailing-bit support.
#[derive(Debug, Default)]
pub struct BitWriter {
    buffer: BytesMut,
    byte: u8,
    bit_count: u8,
}

impl BitWriter {
    pub fn new() -> Self {
        BitWriter::default()
    }

    pub fn put_bits(&mut self, code: u32, len: u32) {
        debug_assert!(len <= 32);
        for i in (0..len).rev() {
            let bit = ((code >> i) & 1) as u8;
            self.byte = (self.byte << 1) | bit;
            self.bit_count += 1;
            if self.bit_count == 8 {
                self.buffer.put_u8(self.byte);
                self.byte = 0;
                self.bit_count = 0;
            }
        }
    }

    /// A 1 bit followed by zero padding up to the byte boundary.
    pub fn put_trailing_bits(&mut self) {
        self.put_bits(1, 1);
        if self.bit_count > 0 {
            self.byte <<= 8 - self.bit_count;
            self.buffer.put_u8(self.byte);
            self.byte = 0;
            self.bit_count = 0;
        }
    }

    /// Byte-aligned little-endian base-128 length.
    pub fn put_uleb128(&mut self, mut value: u32) {
        debug_assert_eq!(self.bit_count, 0);
        while value >> 7 != 0 {
            self.buffer.put_u8(0x80 | (value & 0x7f) as u8);
            value >>= 7;
        }
        self.buffer.put_u8(value as u8);
    }

    pub fn finish(self) -> Bytes {
        debug_assert_eq!(self.bit_count, 0, "unflushed bits");
        self.buffer.freeze()
    }
}

/// AV1 temporal delimiter OBU.
pub const TEMPORAL_DELIMITER_OBU: [u8; 2] = [0x12, 0x00];

const OBU_FRAME_HEADER: u32 = 3;

/// Synthesize a complete frame-header OBU carrying show_existing_frame=1.
///
/// `presentation_time` is (value, bit length) when the sequence signals
/// decoder model timing with unequal picture intervals; `frame_id` is
/// (value, bit length) when frame id numbers are present.
pub fn show_existing_frame_obu(
    frame_to_show_map_idx: u8,
    presentation_time: Option<(u64, u32)>,
    frame_id: Option<(u32, u32)>,
) -> Bytes {
    let mut payload = BitWriter::new();
    payload.put_bits(1, 1); // show_existing_frame
    payload.put_bits(u32::from(frame_to_show_map_idx) & 7, 3);
    if let Some((time, bits)) = presentation_time {
        let mask = (1u64 << bits) - 1;
        payload.put_bits((time & mask) as u32, bits);
    }
    if let Some((id, bits)) = frame_id {
        payload.put_bits(id, bits);
    }
    payload.put_trailing_bits();
    let payload = payload.finish();

    let mut header = BitWriter::new();
    header.put_bits(0, 1); // obu_forbidden_bit
    header.put_bits(OBU_FRAME_HEADER, 4); // obu_type
    header.put_bits(0, 1); // obu_extension_flag
    header.put_bits(1, 1); // obu_has_size_field
    header.put_bits(0, 1); // obu_reserved_1bit
    header.put_uleb128(payload.len() as u32);
    let header = header.finish();

    let mut obu = BytesMut::with_capacity(header.len() + payload.len());
    obu.extend_from_slice(&header);
    obu.extend_from_slice(&payload);
    obu.freeze()
}

#[derive(Debug, Clone, Copy)]
pub struct IvfConfig {
    pub width: u16,
    pub height: u16,
    pub frame_rate_numerator: u32,
    pub frame_rate_denominator: u32,
    pub frame_count: u32,
}

/// IVF container: a 32-byte file header and a 12-byte header per frame.
/// Every written frame is prefixed with a temporal delimiter OBU.
#[derive(Debug)]
pub struct IvfWriter<W: Write> {
    writer: W,
    config: IvfConfig,
    wrote_file_header: bool,
}

impl<W: Write> IvfWriter<W> {
    pub fn new(writer: W, config: IvfConfig) -> Self {
        IvfWriter {
            writer,
            config,
            wrote_file_header: false,
        }
    }

    fn write_file_header(&mut self) -> io::Result<()> {
        let mut header = [0u8; 32];
        header[0..4].copy_from_slice(b"DKIF");
        header[4..6].copy_from_slice(&0u16.to_le_bytes()); // version
        header[6..8].copy_from_slice(&32u16.to_le_bytes()); // header size
        header[8..12].copy_from_slice(b"AV01");
        header[12..14].copy_from_slice(&self.config.width.to_le_bytes());
        header[14..16].copy_from_slice(&self.config.height.to_le_bytes());
        header[16..20].copy_from_slice(&self.config.frame_rate_numerator.to_le_bytes());
        header[20..24].copy_from_slice(&self.config.frame_rate_denominator.to_le_bytes());
        header[24..28].copy_from_slice(&self.config.frame_count.to_le_bytes());
        self.writer.write_all(&header)
    }

    /// One IVF frame: the temporal delimiter plus all provided OBU parts.
    pub fn write_frame(&mut self, pts: u64, parts: &[&[u8]]) -> io::Result<()> {
        if !self.wrote_file_header {
            self.write_file_header()?;
            self.wrote_file_header = true;
        }

        let size = TEMPORAL_DELIMITER_OBU.len() + parts.iter().map(|p| p.len()).sum::<usize>();
        let mut frame_header = [0u8; 12];
        frame_header[0..4].copy_from_slice(&(size as u32).to_le_bytes());
        frame_header[4..8].copy_from_slice(&((pts & 0xffff_ffff) as u32).to_le_bytes());
        frame_header[8..12].copy_from_slice(&((pts >> 32) as u32).to_le_bytes());
        self.writer.write_all(&frame_header)?;
        self.writer.write_all(&TEMPORAL_DELIMITER_OBU)?;
        for part in parts {
            self.writer.write_all(part)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Raw Annex-B payloads: header prelude bytes followed by VCL bytes, in the
/// order the frames were assembled.
#[derive(Debug)]
pub struct AnnexBWriter<W: Write> {
    writer: W,
}

impl<W: Write> AnnexBWriter<W> {
    pub fn new(writer: W) -> Self {
        AnnexBWriter { writer }
    }

    pub fn write_frame(&mut self, parts: &[&[u8]]) -> io::Result<()> {
        for part in parts {
            self.writer.write_all(part)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_are_msb_first() {
        let mut w = BitWriter::new();
        w.put_bits(0b101, 3);
        w.put_bits(0b0, 1);
        w.put_bits(0b1111, 4);
        assert_eq!(&w.finish()[..], &[0b1010_1111]);
    }

    #[test]
    fn trailing_bits_pad_to_byte() {
        let mut w = BitWriter::new();
        w.put_bits(0b1, 1);
        w.put_trailing_bits();
        // 1, then the stop bit, then zero padding.
        assert_eq!(&w.finish()[..], &[0b1100_0000]);
    }

    #[test]
    fn uleb128_small_and_multibyte() {
        let mut w = BitWriter::new();
        w.put_uleb128(0x7f);
        assert_eq!(&w.finish()[..], &[0x7f]);

        let mut w = BitWriter::new();
        w.put_uleb128(0x80);
        assert_eq!(&w.finish()[..], &[0x80, 0x01]);

        let mut w = BitWriter::new();
        w.put_uleb128(0x3fff);
        assert_eq!(&w.finish()[..], &[0xff, 0x7f]);
    }

    #[test]
    fn show_existing_obu_layout() {
        let obu = show_existing_frame_obu(5, None, None);
        // obu_header: type FRAME_HEADER (3), has_size set.
        assert_eq!(obu[0], 0b0_0011_0_1_0);
        // one payload byte.
        assert_eq!(obu[1], 1);
        // payload: show_existing=1, map idx 101, trailing 1, padding.
        assert_eq!(obu[2], 0b1_101_1000);
        assert_eq!(obu.len(), 3);
    }

    #[test]
    fn show_existing_obu_with_frame_id() {
        // 16 frame id bits push the payload to three bytes.
        let obu = show_existing_frame_obu(2, None, Some((0xabcd, 16)));
        assert_eq!(obu[1], 3);
        assert_eq!(obu[2], 0b1_010_1010); // 1, 010, id[15:12] = 1010
        assert_eq!(obu[3], 0b1011_1100); // id[11:4]
        assert_eq!(obu[4], 0b1101_1000); // id[3:0], trailing 1, padding
    }

    #[test]
    fn ivf_layout() {
        let config = IvfConfig {
            width: 320,
            height: 240,
            frame_rate_numerator: 30,
            frame_rate_denominator: 1,
            frame_count: 2,
        };
        let mut writer = IvfWriter::new(Vec::new(), config);
        writer.write_frame(0, &[&[0xaa; 4]]).unwrap();
        writer.write_frame(1, &[&[0xbb; 2], &[0xcc; 2]]).unwrap();
        let out = writer.into_inner();

        assert_eq!(&out[0..4], b"DKIF");
        assert_eq!(&out[8..12], b"AV01");
        assert_eq!(u16::from_le_bytes([out[12], out[13]]), 320);
        assert_eq!(u32::from_le_bytes([out[24], out[25], out[26], out[27]]), 2);

        // First frame header: size = 2 (TD) + 4 payload, pts 0.
        let frame0 = &out[32..];
        assert_eq!(u32::from_le_bytes(frame0[0..4].try_into().unwrap()), 6);
        assert_eq!(&frame0[12..14], &TEMPORAL_DELIMITER_OBU);
        assert_eq!(&frame0[14..18], &[0xaa; 4]);

        // Second frame directly follows.
        let frame1 = &frame0[18..];
        assert_eq!(u32::from_le_bytes(frame1[0..4].try_into().unwrap()), 6);
        assert_eq!(u32::from_le_bytes(frame1[4..8].try_into().unwrap()), 1);
        assert_eq!(&frame1[14..18], &[0xbb, 0xbb, 0xcc, 0xcc]);
    }
}
