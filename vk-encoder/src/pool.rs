//! Bounded resource pools.
//!
//! Every pooled resource is an arena slot addressed by index and guarded by
//! a per-slot atomic reference count. Users hold opaque cloneable handles;
//! the slot returns to the free set when the last handle drops. DPB slots
//! reference image slots, frame contexts reference DPB and image slots, and
//! nothing references a frame context, so no cycles can form.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU32, Ordering},
};

use ash::vk;

use crate::driver::{BufferId, FenceId, ImageViewId, PictureResource};

/// One image slot shared between the DPB manager and in-flight frames.
#[derive(Debug)]
struct ImageSlot {
    refcount: AtomicU32,
    resource: PictureResource,
    /// Layout the image is actually in, updated when a barrier is recorded.
    layout: Mutex<vk::ImageLayout>,
    /// Layout the next user needs before first command-buffer use.
    required_layout: Mutex<vk::ImageLayout>,
}

#[derive(Debug)]
struct ImagePoolShared {
    slots: Box<[ImageSlot]>,
    // Serializes acquisition; releases are atomic decrements.
    acquire_lock: Mutex<()>,
}

/// Bounded pool of encode input or DPB reconstruction images.
#[derive(Debug, Clone)]
pub struct ImagePool {
    shared: Arc<ImagePoolShared>,
}

impl ImagePool {
    pub fn new(resources: Vec<PictureResource>) -> Self {
        let slots = resources
            .into_iter()
            .map(|resource| ImageSlot {
                refcount: AtomicU32::new(0),
                resource,
                layout: Mutex::new(vk::ImageLayout::UNDEFINED),
                required_layout: Mutex::new(vk::ImageLayout::UNDEFINED),
            })
            .collect();

        ImagePool {
            shared: Arc::new(ImagePoolShared {
                slots,
                acquire_lock: Mutex::new(()),
            }),
        }
    }

    /// Claim any free slot, recording the layout it must be transitioned to
    /// before its first use in a command buffer. Returns `None` when every
    /// slot is still referenced (pipeline backpressure).
    pub fn acquire(&self, target_layout: vk::ImageLayout) -> Option<ImageHandle> {
        let _guard = self.shared.acquire_lock.lock().unwrap();
        for (index, slot) in self.shared.slots.iter().enumerate() {
            if slot
                .refcount
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                *slot.required_layout.lock().unwrap() = target_layout;
                return Some(ImageHandle {
                    shared: self.shared.clone(),
                    index: index as u32,
                });
            }
        }
        None
    }

    pub fn slot_count(&self) -> usize {
        self.shared.slots.len()
    }

    pub fn free_count(&self) -> usize {
        self.shared
            .slots
            .iter()
            .filter(|s| s.refcount.load(Ordering::Acquire) == 0)
            .count()
    }
}

/// Shared, refcounted reference to one image slot.
#[derive(Debug)]
pub struct ImageHandle {
    shared: Arc<ImagePoolShared>,
    index: u32,
}

impl ImageHandle {
    /// Pool-wide slot index, serialized into hardware descriptors.
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn resource(&self) -> PictureResource {
        self.shared.slots[self.index as usize].resource
    }

    pub fn image_view(&self) -> ImageViewId {
        self.shared.slots[self.index as usize].resource.image_view
    }

    pub fn layout(&self) -> vk::ImageLayout {
        *self.shared.slots[self.index as usize].layout.lock().unwrap()
    }

    /// Layout this acquisition asked for.
    pub fn required_layout(&self) -> vk::ImageLayout {
        *self.shared.slots[self.index as usize]
            .required_layout
            .lock()
            .unwrap()
    }

    /// Record a layout change performed by a barrier. Only one pipeline
    /// stage transitions a given slot at a time.
    pub fn set_layout(&self, layout: vk::ImageLayout) {
        *self.shared.slots[self.index as usize].layout.lock().unwrap() = layout;
    }
}

impl Clone for ImageHandle {
    fn clone(&self) -> Self {
        self.shared.slots[self.index as usize]
            .refcount
            .fetch_add(1, Ordering::AcqRel);
        ImageHandle {
            shared: self.shared.clone(),
            index: self.index,
        }
    }
}

impl Drop for ImageHandle {
    fn drop(&mut self) {
        let prev = self.shared.slots[self.index as usize]
            .refcount
            .fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
    }
}

/// One host-visible output buffer together with the query slot and fence
/// that report on it.
#[derive(Debug, Clone, Copy)]
pub struct BitstreamBuffer {
    pub buffer: BufferId,
    pub size: u64,
    pub fence: FenceId,
}

#[derive(Debug)]
struct BitstreamSlot {
    refcount: AtomicU32,
    buffer: BitstreamBuffer,
}

#[derive(Debug)]
struct BitstreamPoolShared {
    slots: Box<[BitstreamSlot]>,
    acquire_lock: Mutex<()>,
}

/// Bounded pool of output bitstream buffers.
#[derive(Debug, Clone)]
pub struct BitstreamBufferPool {
    shared: Arc<BitstreamPoolShared>,
}

impl BitstreamBufferPool {
    /// Buffers are sized for a worst-case 4:2:0 frame plus headroom, or the
    /// configured minimum if that is larger.
    pub fn buffer_size(coded_extent: vk::Extent2D, configured_min: u64) -> u64 {
        let frame = u64::from(coded_extent.width) * u64::from(coded_extent.height) * 3 / 2;
        (frame + frame / 2).max(configured_min)
    }

    pub fn new(buffers: Vec<BitstreamBuffer>) -> Self {
        let slots = buffers
            .into_iter()
            .map(|buffer| BitstreamSlot {
                refcount: AtomicU32::new(0),
                buffer,
            })
            .collect();

        BitstreamBufferPool {
            shared: Arc::new(BitstreamPoolShared {
                slots,
                acquire_lock: Mutex::new(()),
            }),
        }
    }

    pub fn acquire(&self) -> Option<BitstreamHandle> {
        let _guard = self.shared.acquire_lock.lock().unwrap();
        for (index, slot) in self.shared.slots.iter().enumerate() {
            if slot
                .refcount
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(BitstreamHandle {
                    shared: self.shared.clone(),
                    index: index as u32,
                });
            }
        }
        None
    }

    pub fn slot_count(&self) -> usize {
        self.shared.slots.len()
    }
}

/// Shared, refcounted reference to one bitstream buffer slot.
#[derive(Debug)]
pub struct BitstreamHandle {
    shared: Arc<BitstreamPoolShared>,
    index: u32,
}

impl BitstreamHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn buffer(&self) -> BitstreamBuffer {
        self.shared.slots[self.index as usize].buffer
    }
}

impl Clone for BitstreamHandle {
    fn clone(&self) -> Self {
        self.shared.slots[self.index as usize]
            .refcount
            .fetch_add(1, Ordering::AcqRel);
        BitstreamHandle {
            shared: self.shared.clone(),
            index: self.index,
        }
    }
}

impl Drop for BitstreamHandle {
    fn drop(&mut self) {
        let prev = self.shared.slots[self.index as usize]
            .refcount
            .fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::ImageViewId;

    fn test_pool(n: usize) -> ImagePool {
        let resources = (0..n)
            .map(|i| PictureResource {
                image_view: ImageViewId(i as u64 + 1),
                coded_offset: vk::Offset2D::default(),
                coded_extent: vk::Extent2D {
                    width: 64,
                    height: 64,
                },
                base_array_layer: 0,
            })
            .collect();
        ImagePool::new(resources)
    }

    #[test]
    fn slot_reusable_only_at_refcount_zero() {
        let pool = test_pool(2);
        let a = pool.acquire(vk::ImageLayout::VIDEO_ENCODE_DPB_KHR).unwrap();
        let b = pool.acquire(vk::ImageLayout::VIDEO_ENCODE_DPB_KHR).unwrap();
        assert!(pool.acquire(vk::ImageLayout::VIDEO_ENCODE_DPB_KHR).is_none());

        let a2 = a.clone();
        drop(a);
        // Still referenced through the clone.
        assert!(pool.acquire(vk::ImageLayout::VIDEO_ENCODE_DPB_KHR).is_none());

        drop(a2);
        let c = pool.acquire(vk::ImageLayout::VIDEO_ENCODE_SRC_KHR).unwrap();
        assert_eq!(c.required_layout(), vk::ImageLayout::VIDEO_ENCODE_SRC_KHR);
        // The actual layout only changes when a barrier is recorded.
        assert_eq!(c.layout(), vk::ImageLayout::UNDEFINED);
        c.set_layout(vk::ImageLayout::VIDEO_ENCODE_SRC_KHR);
        assert_eq!(c.layout(), vk::ImageLayout::VIDEO_ENCODE_SRC_KHR);
        drop(b);
        drop(c);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn indices_are_stable_and_distinct() {
        let pool = test_pool(3);
        let a = pool.acquire(vk::ImageLayout::GENERAL).unwrap();
        let b = pool.acquire(vk::ImageLayout::GENERAL).unwrap();
        assert_ne!(a.index(), b.index());
        assert_eq!(a.resource().image_view, ImageViewId(u64::from(a.index()) + 1));
    }

    #[test]
    fn bitstream_pool_round_trip() {
        let buffers = (0..2)
            .map(|i| BitstreamBuffer {
                buffer: BufferId(i + 1),
                size: 1 << 20,
                fence: FenceId(i + 1),
            })
            .collect();
        let pool = BitstreamBufferPool::new(buffers);
        let a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        drop(a);
        assert!(pool.acquire().is_some());
    }

    #[test]
    fn buffer_sizing_has_headroom_and_floor() {
        let extent = vk::Extent2D {
            width: 1920,
            height: 1080,
        };
        let frame = 1920u64 * 1080 * 3 / 2;
        assert_eq!(
            BitstreamBufferPool::buffer_size(extent, 0),
            frame + frame / 2
        );
        assert_eq!(
            BitstreamBufferPool::buffer_size(extent, 64 << 20),
            64 << 20
        );
    }
}
