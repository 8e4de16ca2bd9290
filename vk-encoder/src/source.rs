//! Frame source contract and a planar raw-YUV file reader for the demos.

use std::fs;
use std::path::Path;

use bytes::Bytes;
use thiserror::Error;

use crate::config::{ChromaSubsampling, InputFormat};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("frame {requested} out of range ({available} available)")]
    OutOfRange { requested: u64, available: u64 },
    #[error("file size is not a whole number of frames")]
    TruncatedFile,
}

/// One decoded frame: planes laid out to match the codec input format
/// (G8_B8R8 for 8-bit 4:2:0; 10/12-bit variants packed in 16-bit words).
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub planes: Vec<Bytes>,
    pub strides: Vec<u32>,
    pub timestamp: u64,
}

/// Anything that can hand the pipeline frames by input order.
pub trait FrameSource {
    fn frame_count(&self) -> u64;
    fn load_frame(&mut self, input_order: u64) -> Result<RawFrame, SourceError>;
}

/// Planar YUV file reader (I420-style layout, one frame after another).
#[derive(Debug)]
pub struct YuvFileSource {
    data: Bytes,
    format: InputFormat,
    frame_count: u64,
}

impl YuvFileSource {
    pub fn open(path: &Path, format: InputFormat) -> Result<Self, SourceError> {
        let data = Bytes::from(fs::read(path)?);
        Self::from_bytes(data, format)
    }

    pub fn from_bytes(data: Bytes, format: InputFormat) -> Result<Self, SourceError> {
        let frame_size = format.frame_size() as u64;
        if data.len() as u64 % frame_size != 0 {
            return Err(SourceError::TruncatedFile);
        }
        let frame_count = data.len() as u64 / frame_size;
        Ok(YuvFileSource {
            data,
            format,
            frame_count,
        })
    }

    fn plane_sizes(&self) -> Vec<(usize, u32)> {
        let bytes_per_sample = self.format.bit_depth.div_ceil(8) as usize;
        let luma_stride = self.format.width as usize * bytes_per_sample;
        let luma = luma_stride * self.format.height as usize;
        match self.format.chroma {
            ChromaSubsampling::Monochrome => vec![(luma, luma_stride as u32)],
            ChromaSubsampling::Yuv420 => {
                let chroma_stride = luma_stride / 2;
                let chroma = luma / 4;
                vec![
                    (luma, luma_stride as u32),
                    (chroma, chroma_stride as u32),
                    (chroma, chroma_stride as u32),
                ]
            }
            ChromaSubsampling::Yuv422 => {
                let chroma_stride = luma_stride / 2;
                let chroma = luma / 2;
                vec![
                    (luma, luma_stride as u32),
                    (chroma, chroma_stride as u32),
                    (chroma, chroma_stride as u32),
                ]
            }
            ChromaSubsampling::Yuv444 => vec![
                (luma, luma_stride as u32),
                (luma, luma_stride as u32),
                (luma, luma_stride as u32),
            ],
        }
    }
}

impl FrameSource for YuvFileSource {
    fn frame_count(&self) -> u64 {
        self.frame_count
    }

    fn load_frame(&mut self, input_order: u64) -> Result<RawFrame, SourceError> {
        if input_order >= self.frame_count {
            return Err(SourceError::OutOfRange {
                requested: input_order,
                available: self.frame_count,
            });
        }

        let frame_size = self.format.frame_size();
        let mut offset = input_order as usize * frame_size;
        let mut planes = Vec::new();
        let mut strides = Vec::new();
        for (size, stride) in self.plane_sizes() {
            planes.push(self.data.slice(offset..offset + size));
            strides.push(stride);
            offset += size;
        }

        Ok(RawFrame {
            planes,
            strides,
            timestamp: input_order,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format() -> InputFormat {
        InputFormat {
            width: 4,
            height: 2,
            bit_depth: 8,
            chroma: ChromaSubsampling::Yuv420,
        }
    }

    #[test]
    fn slices_planes_per_frame() {
        // Two 4x2 frames: 8 luma + 2 + 2 chroma bytes each.
        let data: Vec<u8> = (0..24).collect();
        let mut source = YuvFileSource::from_bytes(Bytes::from(data), format()).unwrap();
        assert_eq!(source.frame_count(), 2);

        let frame = source.load_frame(1).unwrap();
        assert_eq!(frame.planes.len(), 3);
        assert_eq!(frame.planes[0].len(), 8);
        assert_eq!(frame.planes[0][0], 12);
        assert_eq!(frame.planes[1].len(), 2);
        assert_eq!(frame.strides, vec![4, 2, 2]);
    }

    #[test]
    fn rejects_partial_frames() {
        let data = vec![0u8; 13];
        assert!(matches!(
            YuvFileSource::from_bytes(Bytes::from(data), format()),
            Err(SourceError::TruncatedFile)
        ));
    }

    #[test]
    fn out_of_range_is_reported() {
        let data = vec![0u8; 12];
        let mut source = YuvFileSource::from_bytes(Bytes::from(data), format()).unwrap();
        assert!(matches!(
            source.load_frame(1),
            Err(SourceError::OutOfRange { .. })
        ));
    }
}
