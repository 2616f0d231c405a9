// SPDX-License-Identifier: MPL-2.0

//! Memory shared between the CPU and the DART's table walker.

use alloc::alloc::{Layout, alloc_zeroed, dealloc};
use core::{
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::Paddr;

/// A physically contiguous, zero-initialized region visible to the DART.
///
/// The region is viewed as an array of 64-bit table entries. Entries are
/// accessed with volatile operations because the hardware walks them
/// concurrently with the CPU.
#[derive(Debug)]
pub struct DmaSegment {
    vaddr: NonNull<u8>,
    paddr: Paddr,
    nbytes: usize,
}

// SAFETY: A segment is plain memory; the DART only touches its entries under
// the instance lock.
unsafe impl Send for DmaSegment {}
// SAFETY: See above.
unsafe impl Sync for DmaSegment {}

impl DmaSegment {
    /// Wraps a region handed out by a [`DmaAllocator`].
    ///
    /// # Safety
    ///
    /// `vaddr` must point to `nbytes` bytes of readable and writable memory,
    /// aligned to 8 bytes, whose device-visible physical address is `paddr`.
    /// The memory must stay valid until the segment is returned to the
    /// allocator that produced it.
    pub unsafe fn new(vaddr: NonNull<u8>, paddr: Paddr, nbytes: usize) -> Self {
        Self {
            vaddr,
            paddr,
            nbytes,
        }
    }

    /// Returns the virtual address of the region.
    pub fn vaddr(&self) -> NonNull<u8> {
        self.vaddr
    }

    /// Returns the device-visible physical address of the region.
    pub fn paddr(&self) -> Paddr {
        self.paddr
    }

    /// Returns the size of the region in bytes.
    pub fn nbytes(&self) -> usize {
        self.nbytes
    }

    /// Returns the number of 64-bit entries in the region.
    pub fn nr_entries(&self) -> usize {
        self.nbytes / size_of::<u64>()
    }

    /// Reads the entry at `idx`.
    ///
    /// # Panics
    ///
    /// Panics if `idx` is out of bounds.
    pub fn read_entry(&self, idx: usize) -> u64 {
        assert!(idx < self.nr_entries());
        // SAFETY: The index is within the region, which is valid and aligned
        // as the constructor's caller guarantees.
        unsafe { self.vaddr.cast::<u64>().add(idx).read_volatile() }
    }

    /// Writes the entry at `idx`.
    ///
    /// # Panics
    ///
    /// Panics if `idx` is out of bounds.
    pub fn write_entry(&self, idx: usize, value: u64) {
        assert!(idx < self.nr_entries());
        // SAFETY: See `read_entry`.
        unsafe { self.vaddr.cast::<u64>().add(idx).write_volatile(value) };
    }
}

/// A provider of DMA-coherent memory for page tables.
pub trait DmaAllocator: Send + Sync {
    /// Allocates `nbytes` of zeroed, physically contiguous memory that the
    /// device can access coherently.
    ///
    /// The region must be aligned to at least 4 KiB. Returns `None` if the
    /// memory is exhausted. This method may block.
    fn alloc_coherent(&self, nbytes: usize) -> Option<DmaSegment>;

    /// Returns a region to the allocator.
    ///
    /// # Safety
    ///
    /// `segment` must have been returned by [`Self::alloc_coherent`] of the
    /// same allocator and must no longer be referenced by any table or
    /// register.
    unsafe fn free_coherent(&self, segment: DmaSegment);

    /// Returns the log2 of the system's native allocation granularity.
    ///
    /// DART page sizes smaller than this are grouped so that one allocation
    /// backs several second-level tables.
    fn page_shift(&self) -> u32 {
        12
    }
}

/// A [`DmaAllocator`] for kernels that map all physical memory linearly.
///
/// Regions come from the global heap and their physical address is their
/// virtual address minus a fixed offset. An optional byte budget caps the
/// memory in use at any time.
#[derive(Debug)]
pub struct LinearDmaAllocator {
    phys_offset: u64,
    page_shift: u32,
    budget: Option<usize>,
    live_bytes: AtomicUsize,
    live_segments: AtomicUsize,
}

impl LinearDmaAllocator {
    /// Creates an allocator whose heap lives at `phys_offset` above its
    /// physical address.
    pub const fn new(phys_offset: u64) -> Self {
        Self {
            phys_offset,
            page_shift: 12,
            budget: None,
            live_bytes: AtomicUsize::new(0),
            live_segments: AtomicUsize::new(0),
        }
    }

    /// Sets the native page granularity.
    ///
    /// The default value is 12.
    pub fn native_page_shift(&mut self, page_shift: u32) -> &mut Self {
        self.page_shift = page_shift;
        self
    }

    /// Caps the number of bytes that may be allocated at the same time.
    ///
    /// There is no cap by default.
    pub fn byte_budget(&mut self, budget: usize) -> &mut Self {
        self.budget = Some(budget);
        self
    }

    /// Returns the number of bytes currently allocated.
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    /// Returns the number of segments currently allocated.
    pub fn live_segments(&self) -> usize {
        self.live_segments.load(Ordering::Relaxed)
    }

    fn layout(&self, nbytes: usize) -> Option<Layout> {
        Layout::from_size_align(nbytes, 1usize << self.page_shift).ok()
    }

    fn charge(&self, nbytes: usize) -> bool {
        self.live_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |live| {
                let live = live.checked_add(nbytes)?;
                match self.budget {
                    Some(budget) if live > budget => None,
                    _ => Some(live),
                }
            })
            .is_ok()
    }

    fn uncharge(&self, nbytes: usize) {
        self.live_bytes.fetch_sub(nbytes, Ordering::Relaxed);
    }
}

impl DmaAllocator for LinearDmaAllocator {
    fn alloc_coherent(&self, nbytes: usize) -> Option<DmaSegment> {
        if nbytes == 0 {
            return None;
        }
        let layout = self.layout(nbytes)?;
        if !self.charge(nbytes) {
            return None;
        }
        // SAFETY: The layout has a non-zero size.
        let Some(vaddr) = NonNull::new(unsafe { alloc_zeroed(layout) }) else {
            self.uncharge(nbytes);
            return None;
        };
        let Some(paddr) = (vaddr.as_ptr() as u64).checked_sub(self.phys_offset) else {
            // SAFETY: The pointer was just allocated with this layout.
            unsafe { dealloc(vaddr.as_ptr(), layout) };
            self.uncharge(nbytes);
            return None;
        };
        self.live_segments.fetch_add(1, Ordering::Relaxed);
        // SAFETY: The memory is freshly allocated, zeroed, page aligned and
        // linearly mapped at `phys_offset`.
        Some(unsafe { DmaSegment::new(vaddr, paddr, nbytes) })
    }

    unsafe fn free_coherent(&self, segment: DmaSegment) {
        let Some(layout) = self.layout(segment.nbytes()) else {
            return;
        };
        // SAFETY: The caller guarantees that the segment was allocated by
        // `alloc_coherent`, which used the same layout.
        unsafe { dealloc(segment.vaddr().as_ptr(), layout) };
        self.uncharge(segment.nbytes());
        self.live_segments.fetch_sub(1, Ordering::Relaxed);
    }

    fn page_shift(&self) -> u32 {
        self.page_shift
    }
}
