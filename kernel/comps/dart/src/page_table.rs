// SPDX-License-Identifier: MPL-2.0

//! The two-level translation tables of a DART instance.
//!
//! Each SID owns a first-level (L1) table of `page_size / 2` entries, which
//! the hardware reaches through four TTBR slots of one page each. Every L1
//! entry points to a second-level (L2) table of one page, whose entries map
//! one DART page each.
//!
//! The hardware L1 table lives in DMA memory. Next to it, a software array
//! records which L2 allocation backs each L1 slot group. Tables only ever
//! grow: nothing is freed while the instance is alive.

use alloc::vec::Vec;
use core::fmt;

use crate::{
    Daddr, Paddr,
    config::{MAX_SID, Sid},
    dma::DmaSegment,
    registers::NR_TTBR_SLOTS,
};

/// A page table entry, at either level.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct Pte(u64);

impl Pte {
    pub(crate) const STATE_MASK: u64 = 0b11;
    pub(crate) const STATE_VALID: u64 = 0b11;
    /// The state of a first-generation L1 entry that points to an L2 table.
    pub(crate) const STATE_NEXT_V0: u64 = 0b11;
    /// The state of a second-generation L1 entry that points to an L2 table.
    pub(crate) const STATE_NEXT_V1: u64 = 0b1011;
    pub(crate) const ADDR_MASK: u64 = 0xF_FFFF_F000;

    pub(crate) const INVALID: Self = Self(0);

    /// Creates a leaf entry mapping the page at `paddr`.
    pub(crate) const fn page(paddr: Paddr) -> Self {
        Self((paddr & Self::ADDR_MASK) | Self::STATE_VALID)
    }

    /// Creates an L1 entry pointing to the L2 table at `paddr`.
    pub(crate) const fn table(paddr: Paddr, next_flag: u64) -> Self {
        Self((paddr & Self::ADDR_MASK) | next_flag)
    }

    pub(crate) const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub(crate) const fn raw(self) -> u64 {
        self.0
    }

    pub(crate) const fn is_present(self) -> bool {
        self.0 & Self::STATE_MASK != 0
    }

    pub(crate) const fn paddr(self) -> Paddr {
        self.0 & Self::ADDR_MASK
    }
}

impl fmt::Debug for Pte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pte({:#x})", self.0)
    }
}

/// The index arithmetic of the tables for one page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Geometry {
    page_bits: u32,
    /// L2 tables are allocated in groups of `1 << group_shift`, so that one
    /// allocation never falls below the allocator's granularity.
    group_shift: u32,
}

impl Geometry {
    pub(crate) fn new(page_bits: u32, alloc_page_shift: u32) -> Self {
        Self {
            page_bits,
            group_shift: alloc_page_shift.saturating_sub(page_bits),
        }
    }

    pub(crate) fn page_size(&self) -> u64 {
        1 << self.page_bits
    }

    /// Returns the number of entries of an L2 table.
    pub(crate) fn nr_l2_entries(&self) -> usize {
        1 << (self.page_bits - 3)
    }

    /// Returns the number of entries of an L1 table, across all TTBR slots.
    pub(crate) fn nr_l1_entries(&self) -> usize {
        NR_TTBR_SLOTS * self.nr_l2_entries()
    }

    pub(crate) fn l1_index(&self, daddr: Daddr) -> usize {
        (daddr >> (2 * self.page_bits - 3)) as usize & (self.nr_l1_entries() - 1)
    }

    pub(crate) fn l2_index(&self, daddr: Daddr) -> usize {
        (daddr >> self.page_bits) as usize & (self.nr_l2_entries() - 1)
    }

    /// Returns the first L1 index of the group containing `l1_index`.
    pub(crate) fn group_base(&self, l1_index: usize) -> usize {
        (l1_index >> self.group_shift) << self.group_shift
    }

    /// Returns the number of L1 slots one L2 allocation backs.
    pub(crate) fn group_len(&self) -> usize {
        1 << self.group_shift
    }

    pub(crate) fn l1_bytes(&self) -> usize {
        NR_TTBR_SLOTS << self.page_bits
    }

    pub(crate) fn l2_group_bytes(&self) -> usize {
        (1usize << self.page_bits) << self.group_shift
    }

    fn nr_groups(&self) -> usize {
        self.nr_l1_entries() >> self.group_shift
    }
}

/// The position of one leaf entry.
///
/// A slot stays meaningful across lock releases because tables are never
/// freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PteSlot {
    sid: Sid,
    group: usize,
    index: usize,
}

/// The outcome of a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Walk {
    Found(PteSlot),
    /// The SID has no L1 table.
    NoRoot,
    /// The L1 slot group has no L2 allocation.
    NoTable { group: usize },
}

/// The tables of one SID.
#[derive(Debug)]
pub(crate) struct ShadowRoot {
    hw: DmaSegment,
    /// The L2 allocation of each L1 slot group.
    groups: Vec<Option<DmaSegment>>,
}

impl ShadowRoot {
    /// Wraps a zeroed hardware L1 table, or returns it back if the software
    /// array cannot be allocated.
    pub(crate) fn new(hw: DmaSegment, geometry: &Geometry) -> Result<Self, DmaSegment> {
        let mut groups = Vec::new();
        if groups.try_reserve_exact(geometry.nr_groups()).is_err() {
            return Err(hw);
        }
        groups.resize_with(geometry.nr_groups(), || None);
        Ok(Self { hw, groups })
    }

    pub(crate) fn paddr(&self) -> Paddr {
        self.hw.paddr()
    }

    /// Returns the hardware table of a root that was never installed.
    pub(crate) fn into_segment(self) -> DmaSegment {
        debug_assert!(self.groups.iter().all(Option::is_none));
        self.hw
    }
}

/// The tables of all SIDs of one instance.
pub(crate) struct ShadowTables {
    geometry: Geometry,
    next_flag: u64,
    roots: [Option<ShadowRoot>; MAX_SID],
}

impl ShadowTables {
    pub(crate) fn new(geometry: Geometry, next_flag: u64) -> Self {
        Self {
            geometry,
            next_flag,
            roots: core::array::from_fn(|_| None),
        }
    }

    pub(crate) fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Finds the leaf entry of `daddr` without creating anything.
    pub(crate) fn walk(&self, sid: Sid, daddr: Daddr) -> Walk {
        let Some(root) = &self.roots[sid.index()] else {
            return Walk::NoRoot;
        };
        let l1_index = self.geometry.l1_index(daddr);
        let group = self.geometry.group_base(l1_index);
        if root.groups[group >> self.geometry.group_shift].is_none() {
            return Walk::NoTable { group };
        }
        let index =
            (l1_index - group) * self.geometry.nr_l2_entries() + self.geometry.l2_index(daddr);
        Walk::Found(PteSlot { sid, group, index })
    }

    pub(crate) fn root(&self, sid: Sid) -> Option<&ShadowRoot> {
        self.roots[sid.index()].as_ref()
    }

    /// Installs the L1 table of `sid` unless one exists.
    ///
    /// Returns the losing table if another one was installed first.
    pub(crate) fn install_root(&mut self, sid: Sid, root: ShadowRoot) -> Result<Paddr, ShadowRoot> {
        let entry = &mut self.roots[sid.index()];
        if entry.is_some() {
            return Err(root);
        }
        Ok(entry.insert(root).paddr())
    }

    /// Installs the L2 allocation of the L1 slot group starting at `group`
    /// unless one exists, pointing every L1 entry of the group into it.
    ///
    /// Returns the losing allocation if another one was installed first or
    /// if the SID has no L1 table.
    pub(crate) fn install_group(
        &mut self,
        sid: Sid,
        group: usize,
        l2: DmaSegment,
    ) -> Result<(), DmaSegment> {
        let geometry = self.geometry;
        let next_flag = self.next_flag;
        let Some(root) = self.roots[sid.index()].as_mut() else {
            return Err(l2);
        };
        let entry = &mut root.groups[group >> geometry.group_shift];
        if entry.is_some() {
            return Err(l2);
        }
        for offset in 0..geometry.group_len() {
            let l2_paddr = l2.paddr() + offset as u64 * geometry.page_size();
            root.hw
                .write_entry(group + offset, Pte::table(l2_paddr, next_flag).raw());
        }
        *entry = Some(l2);
        Ok(())
    }

    pub(crate) fn read(&self, slot: PteSlot) -> Pte {
        Pte::from_raw(self.l2(slot).read_entry(slot.index))
    }

    pub(crate) fn write(&self, slot: PteSlot, pte: Pte) {
        self.l2(slot).write_entry(slot.index, pte.raw());
    }

    fn l2(&self, slot: PteSlot) -> &DmaSegment {
        let group = self.roots[slot.sid.index()]
            .as_ref()
            .and_then(|root| root.groups[slot.group >> self.geometry.group_shift].as_ref());
        match group {
            Some(l2) => l2,
            // Slots are only handed out for installed tables, which are never
            // removed.
            None => unreachable!("stale PTE slot {:?}", slot),
        }
    }
}
