//! Boot-time configuration of the virtual memory manager.

use crate::address::PAGE_SIZE;
use crate::address_space::{USER_SPACE_END, USER_STACK_PAGES, USER_STACK_TOP};
use crate::{FrameNumber, VirtualAddress, VmError, VmResult};

/// Hashed page table slots per physical frame, keeping the load factor at or below one half.
pub const DEFAULT_HPT_RATIO: usize = 2;

/// Parameters for [`crate::Vm::bootstrap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// First frame not occupied by the kernel image and boot data.
    pub first_free_frame: FrameNumber,
    /// Hashed page table slots per physical frame.
    pub hpt_ratio: usize,
    /// Explicit hashed page table capacity, overriding `hpt_ratio`.
    pub hpt_capacity: Option<usize>,
    /// Top of every user stack.
    pub stack_top: VirtualAddress,
    /// Pages reserved below the stack top.
    pub stack_pages: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            first_free_frame: FrameNumber::new(0),
            hpt_ratio: DEFAULT_HPT_RATIO,
            hpt_capacity: None,
            stack_top: USER_STACK_TOP,
            stack_pages: USER_STACK_PAGES,
        }
    }
}

impl VmConfig {
    pub fn with_first_free_frame(mut self, frame: FrameNumber) -> Self {
        self.first_free_frame = frame;
        self
    }

    pub fn with_hpt_ratio(mut self, ratio: usize) -> Self {
        self.hpt_ratio = ratio;
        self
    }

    pub fn with_hpt_capacity(mut self, capacity: usize) -> Self {
        self.hpt_capacity = Some(capacity);
        self
    }

    pub fn with_stack(mut self, top: VirtualAddress, pages: usize) -> Self {
        self.stack_top = top;
        self.stack_pages = pages;
        self
    }

    /// Returns the hashed page table capacity for a machine with `frames` frames.
    pub fn hpt_capacity_for(&self, frames: usize) -> usize {
        self.hpt_capacity
            .unwrap_or_else(|| frames.saturating_mul(self.hpt_ratio))
    }

    /// Checks the configuration for a machine with `frames` frames.
    pub fn validate(&self, frames: usize) -> VmResult<()> {
        if frames == 0 || self.hpt_capacity_for(frames) == 0 {
            return Err(VmError::InvalidArgument);
        }
        let stack_size = self
            .stack_pages
            .checked_mul(PAGE_SIZE)
            .ok_or(VmError::InvalidArgument)?;
        if self.stack_pages == 0
            || !self.stack_top.is_aligned(PAGE_SIZE)
            || self.stack_top > USER_SPACE_END
            || self.stack_top.as_usize() < stack_size
        {
            return Err(VmError::InvalidArgument);
        }
        Ok(())
    }
}
