//! Frame accounting.
//!
//! The frame table keeps one status bit per physical frame and is the single authority on
//! whether a frame may be handed out for a user mapping. Frames below the first free frame
//! hold the kernel image, boot data and the hashed page table itself, and are permanently
//! unavailable.

use alloc::vec::Vec;

use spin::Mutex;

use crate::{FrameNumber, VmError};

const WORD_BITS: usize = u64::BITS as usize;

/// Errors that can occur during frame allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Every frame is reserved or in use.
    OutOfMemory,
}

impl From<AllocError> for VmError {
    fn from(_: AllocError) -> Self {
        VmError::OutOfMemory
    }
}

/// Bitmap of frame availability: a set bit means the frame is available.
struct FrameBitmap {
    words: Vec<u64>,
    total: usize,
    first_free: usize,
    available: usize,
    /// Where the next search starts; allocation is next-fit.
    hint: usize,
}

impl FrameBitmap {
    fn is_available(&self, frame: usize) -> bool {
        frame < self.total && self.words[frame / WORD_BITS] & (1 << (frame % WORD_BITS)) != 0
    }

    fn set(&mut self, frame: usize, available: bool) {
        let mask = 1 << (frame % WORD_BITS);
        if available {
            self.words[frame / WORD_BITS] |= mask;
        } else {
            self.words[frame / WORD_BITS] &= !mask;
        }
    }

    /// Finds an available frame at or after `start`, skipping empty words.
    fn find_from(&self, start: usize) -> Option<usize> {
        let mut frame = start;
        while frame < self.total {
            let word = self.words[frame / WORD_BITS] >> (frame % WORD_BITS);
            if word == 0 {
                frame = (frame / WORD_BITS + 1) * WORD_BITS;
                continue;
            }
            let candidate = frame + word.trailing_zeros() as usize;
            return (candidate < self.total).then_some(candidate);
        }
        None
    }
}

/// Tracks which physical frames are available to the virtual memory manager.
///
/// All methods take the table's own lock, so the frame table may be used from any thread.
/// When both locks are needed, the hashed page table lock is always taken first.
pub struct FrameTable {
    inner: Mutex<FrameBitmap>,
}

impl FrameTable {
    /// Creates a frame table covering `total` frames, with every frame below `first_free`
    /// reserved.
    pub fn new(total: usize, first_free: FrameNumber) -> Self {
        let first_free = first_free.as_usize().min(total);
        let mut bitmap = FrameBitmap {
            words: alloc::vec![0; total.div_ceil(WORD_BITS)],
            total,
            first_free,
            available: 0,
            hint: first_free,
        };
        for frame in first_free..total {
            bitmap.set(frame, true);
        }
        bitmap.available = total - first_free;

        log::debug!(
            "frame table: {} frames, {} reserved, {} available",
            total,
            first_free,
            bitmap.available
        );

        Self {
            inner: Mutex::new(bitmap),
        }
    }

    /// Allocates one frame.
    pub fn allocate(&self) -> Result<FrameNumber, AllocError> {
        let mut bitmap = self.inner.lock();
        if bitmap.available == 0 {
            return Err(AllocError::OutOfMemory);
        }

        let hint = bitmap.hint;
        let frame = bitmap
            .find_from(hint)
            .or_else(|| bitmap.find_from(bitmap.first_free))
            .ok_or(AllocError::OutOfMemory)?;

        bitmap.set(frame, false);
        bitmap.available -= 1;
        bitmap.hint = frame + 1;
        Ok(FrameNumber::new(frame))
    }

    /// Returns a frame to the table.
    ///
    /// Returns false, and changes nothing, if the frame is reserved, out of range or
    /// already available.
    pub fn deallocate(&self, frame: FrameNumber) -> bool {
        let mut bitmap = self.inner.lock();
        let index = frame.as_usize();
        if index < bitmap.first_free || index >= bitmap.total {
            log::error!("attempt to free reserved or unknown frame {}", frame);
            return false;
        }
        if bitmap.is_available(index) {
            log::error!("double free of frame {}", frame);
            return false;
        }

        bitmap.set(index, true);
        bitmap.available += 1;
        true
    }

    /// Returns whether a frame is currently available.
    pub fn is_available(&self, frame: FrameNumber) -> bool {
        self.inner.lock().is_available(frame.as_usize())
    }

    /// Returns the number of available frames.
    pub fn available(&self) -> usize {
        self.inner.lock().available
    }

    /// Returns the total number of frames, reserved ones included.
    pub fn total(&self) -> usize {
        self.inner.lock().total
    }

    /// Returns the first frame that is not permanently reserved.
    pub fn first_free(&self) -> FrameNumber {
        FrameNumber::new(self.inner.lock().first_free)
    }
}
