// SPDX-License-Identifier: MPL-2.0

//! Register layouts of the two DART generations and the access path to them.
//!
//! Every register of a DART sub-unit is a 32-bit word. The offsets below are
//! relative to the start of one sub-unit's register window.

use alloc::sync::Arc;
use core::ptr::NonNull;

use bitflags::bitflags;
use volatile::VolatilePtr;

/// The size of the register window of one sub-unit.
pub const REGISTER_WINDOW_SIZE: usize = 0x4000;

/// Registers of the first-generation (A10-era) DART.
pub(crate) mod v0 {
    pub const TLB_OP: usize = 0x0000;
    pub const TLB_OP_FLUSH: u32 = 1 << 1;
    pub const TLB_OP_BUSY: u32 = 1 << 3;
    pub const TLB_OP_SID_SHIFT: u32 = 8;

    /// Translation enables, 8 bits per SID with TXEN at bit 7 of each byte.
    pub const CONFIG: usize = 0x000C;

    pub const ERROR_STATUS: usize = 0x0010;
    pub const ERROR_AXI_REQ0: usize = 0x0014;
    pub const ERROR_AXI_REQ1: usize = 0x0018;
    pub const ERROR_ADDRESS: usize = 0x001C;
    pub const DIAG_CONFIG: usize = 0x0020;
    pub const UNKNOWN_24: usize = 0x0024;
    pub const UNKNOWN_2C: usize = 0x002C;
    pub const FETCH_CONFIG: usize = 0x0030;

    pub const TLB_MISS: usize = 0x007C;
    pub const TLB_WAIT: usize = 0x0080;
    pub const TLB_HIT: usize = 0x0084;
    pub const ST_MISS: usize = 0x0088;
    pub const ST_WAIT: usize = 0x008C;
    pub const ST_HIT: usize = 0x0090;

    pub const TTBR_VALID: u32 = 1 << 31;
    pub const TTBR_MASK: u32 = 0x00FF_FFFF;

    pub const TLB_STATUS: usize = 0x1000;
    pub const NR_TLB_UNKNOWN: usize = 6;

    /// The number of SIDs the generation can tell apart.
    pub const NR_SIDS: usize = 4;

    pub const fn config_txen(sid: usize) -> u32 {
        1 << (sid * 8 + 7)
    }

    pub const fn ttbr(sid: usize, slot: usize) -> usize {
        0x0040 + 16 * sid + 4 * slot
    }

    pub const fn tlb_unknown(idx: usize) -> usize {
        0x1004 + 4 * idx
    }
}

/// Registers of the second-generation (M1-era) DART.
pub(crate) mod v1 {
    pub const TLB_OP: usize = 0x0020;
    pub const TLB_OP_OPMASK: u32 = 0xFFF << 20;
    pub const TLB_OP_FLUSH: u32 = 1 << 20;
    pub const TLB_OP_BUSY: u32 = 1 << 2;
    pub const TLB_OP_SIDMASK: usize = 0x0034;

    pub const ERROR_STATUS: usize = 0x0040;
    pub const ERROR_ADDRESS_LO: usize = 0x0050;
    pub const ERROR_ADDRESS_HI: usize = 0x0054;

    pub const CONFIG_TXEN: u32 = 1 << 7;

    pub const TTBR_VALID: u32 = 1 << 31;
    pub const TTBR_MASK: u32 = 0x0FFF_FFFF;

    pub const NR_SIDS: usize = 16;
    /// Remap targets are packed four bytes per word.
    pub const NR_REMAP_WORDS: usize = NR_SIDS / 4;

    pub const fn sid_remap(word: usize) -> usize {
        0x0080 + 4 * word
    }

    pub const fn config(sid: usize) -> usize {
        0x0100 + 4 * sid
    }

    pub const fn ttbr(sid: usize, slot: usize) -> usize {
        0x0200 + 16 * sid + 4 * slot
    }
}

/// TTBR fields hold the physical frame number of a 4 KiB granule, whatever
/// the DART page size is.
pub(crate) const TTBR_SHIFT: u32 = 12;

/// The number of TTBR slots per SID. Each slot covers a quarter of the L1
/// index space.
pub(crate) const NR_TTBR_SLOTS: usize = 4;

bitflags! {
    /// The error status reported by a second-generation sub-unit.
    pub struct ErrorFlags: u32 {
        /// The TTBR selected by the access is not valid.
        const TTBR_INVALID =        1 << 0;
        /// The L1 entry walked by the access is not valid.
        const L2E_INVALID =         1 << 1;
        /// The final PTE is not valid.
        const PTE_INVALID =         1 << 2;
        const WRITE_PROT =          1 << 3;
        const READ_PROT =           1 << 4;
        const AXI_SLV_DECODE =      1 << 5;
        const AXI_SLV_ERR =         1 << 6;
        const REGION_PROT =         1 << 7;
        const CTRR_WRITE_PROT =     1 << 8;
        const UNKNOWN =             1 << 9;
        const APF_REJECT =          1 << 11;
        /// Set while an error is latched.
        const FLAG =                1 << 31;
    }
}

/// Accessor of the register window of one DART sub-unit.
///
/// All hardware access of this crate goes through this trait, so that the
/// engine can be driven by real MMIO as well as by a simulated device.
pub trait RegisterIo: Send + Sync {
    /// Reads the 32-bit register at `offset` bytes into the window.
    fn read_u32(&self, offset: usize) -> u32;

    /// Writes the 32-bit register at `offset` bytes into the window.
    fn write_u32(&self, offset: usize, value: u32);
}

impl<T: RegisterIo + ?Sized> RegisterIo for Arc<T> {
    fn read_u32(&self, offset: usize) -> u32 {
        (**self).read_u32(offset)
    }

    fn write_u32(&self, offset: usize, value: u32) {
        (**self).write_u32(offset, value);
    }
}

/// A memory-mapped register window.
#[derive(Debug)]
pub struct IoMem {
    base: NonNull<u8>,
    size: usize,
}

// SAFETY: `IoMem` only performs volatile accesses to device memory, and the
// DART serializes them under its instance lock.
unsafe impl Send for IoMem {}
// SAFETY: See above.
unsafe impl Sync for IoMem {}

impl IoMem {
    /// Creates a register window of `size` bytes starting at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be the virtual address of a mapped, uncached MMIO region
    /// of at least `size` bytes that stays mapped for the lifetime of the
    /// returned object, and no one else may access that region.
    pub unsafe fn new(base: NonNull<u8>, size: usize) -> Self {
        Self { base, size }
    }

    /// Returns the size of the window in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    fn register(&self, offset: usize) -> VolatilePtr<'_, u32> {
        assert!(
            offset % 4 == 0 && offset + 4 <= self.size,
            "register offset {:#x} is outside the window",
            offset
        );
        // SAFETY: The offset is aligned and within the window, which the
        // constructor's caller guarantees to be valid MMIO.
        unsafe { VolatilePtr::new(self.base.add(offset).cast::<u32>()) }
    }
}

impl RegisterIo for IoMem {
    fn read_u32(&self, offset: usize) -> u32 {
        self.register(offset).read()
    }

    fn write_u32(&self, offset: usize, value: u32) {
        self.register(offset).write(value);
    }
}
