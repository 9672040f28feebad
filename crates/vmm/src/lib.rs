#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Polaris Virtual Memory Manager (VMM)
//!
//! The Polaris Virtual Memory Manager (VMM) is the translation core of the Polaris kernel on
//! machines with a software-refilled translation cache. It provides:
//!
//! - A single hashed page table, shared by every address space, mapping an
//!   (address-space id, virtual page) pair to a physical frame.
//! - Frame accounting for the frames that back user pages.
//! - Address spaces made of regions, declared by the program loader.
//! - Resolution of translation faults, with pages backed lazily on first touch.
//! - The address space lifecycle: create, copy for fork, destroy, activate and deactivate.
//! - Software emulation of memory and the translation cache for testing in non-kernel
//!   environments.

extern crate alloc;

mod address;
mod address_space;
mod arch;
mod config;
mod error;
mod fault;
mod frame_table;
mod hpt;
mod numbers;
mod tlb;
mod vm;


pub use address::{AddressTranslator, PAGE_FRAME, PAGE_SHIFT, PAGE_SIZE, PhysicalAddress, VirtualAddress};
pub use address_space::{
    Access, AddressSpace, AsId, IdAllocator, Region, USER_SPACE_END, USER_STACK_PAGES,
    USER_STACK_TOP,
};
pub use arch::software::SoftwareTlb;
pub use arch::{interrupts_enabled, without_interrupts};
pub use config::{DEFAULT_HPT_RATIO, VmConfig};
pub use error::{EFAULT, EINVAL, ENOMEM, VmError, VmResult};
pub use fault::{FaultKind, Resolution};
pub use frame_table::{AllocError, FrameTable};
pub use hpt::{HashedPageTable, HptError, PageKey, Translation};
pub use numbers::{FrameNumber, PageNumber};
pub use tlb::{EntryFlags, MAX_FRAMES, TranslationCache};
pub use vm::{Vm, VmStats};
