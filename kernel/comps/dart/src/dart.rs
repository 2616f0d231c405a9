// SPDX-License-Identifier: MPL-2.0

//! A DART instance.

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::ops::RangeInclusive;

use log::{debug, error, info};
use spin::{Mutex, MutexGuard};

use crate::{
    Daddr, DartConfig, DartError, DartSettings, Paddr, Result,
    config::Sid,
    dma::{DmaAllocator, DmaSegment},
    fault::{FaultQueue, FaultRecord},
    page_table::{Geometry, Pte, PteSlot, ShadowRoot, ShadowTables, Walk},
    registers::RegisterIo,
    version::{DartVersion, PerfCounters, RemapWords, SubUnit},
};

/// The page sizes the DART can map, as a bitmap of sizes in bytes.
const PGSIZE_BITMAP: u64 = !0x3FFF;

/// One DART, i.e., one or two register windows that translate the DMA of a
/// group of devices.
///
/// All table updates and register accesses of an instance are serialized
/// by one lock. The lock is only released while memory for a new table is
/// being allocated.
///
/// Tables are never freed. Dropping an instance leaks them, since the
/// hardware may still walk them.
pub struct Dart {
    version: DartVersion,
    settings: DartSettings,
    allocator: Arc<dyn DmaAllocator>,
    nr_sub_units: usize,
    state: Mutex<DartState>,
}

struct DartState {
    units: Vec<SubUnit>,
    tables: ShadowTables,
    is_init: bool,
    remap: Option<RemapWords>,
    faults: FaultQueue,
}

impl Dart {
    /// Creates an instance over the given register windows.
    ///
    /// `sub_units` holds the register windows in hardware order, "DART"
    /// first. The hardware is left untouched until the first device is
    /// attached.
    pub fn new(
        version: DartVersion,
        sub_units: Vec<Box<dyn RegisterIo>>,
        config: &DartConfig,
        allocator: Arc<dyn DmaAllocator>,
    ) -> Result<Arc<Self>> {
        let settings = config.resolve(version)?;
        if sub_units.len() < version.min_sub_units() {
            return Err(DartError::MissingSubUnit);
        }
        if sub_units.len() > version.max_sub_units() {
            return Err(DartError::InvalidConfig);
        }

        let nr_sub_units = sub_units.len();
        let units = sub_units
            .into_iter()
            .enumerate()
            .map(|(index, regs)| SubUnit::new(index, regs))
            .collect();
        let geometry = Geometry::new(settings.page_bits(), allocator.page_shift());
        let tables = ShadowTables::new(geometry, version.pte_next_flag());

        info!(
            "{}: {:?} with {} sub-unit(s), {:#x} byte pages, SID mask {:#x}{}",
            settings.name(),
            version,
            nr_sub_units,
            settings.page_size(),
            settings.sid_mask(),
            if settings.is_pcie() { ", PCIe" } else { "" }
        );

        Ok(Arc::new(Self {
            version,
            settings,
            allocator,
            nr_sub_units,
            state: Mutex::new(DartState {
                units,
                tables,
                is_init: false,
                remap: None,
                faults: FaultQueue::new(),
            }),
        }))
    }

    pub fn version(&self) -> DartVersion {
        self.version
    }

    pub fn settings(&self) -> &DartSettings {
        &self.settings
    }

    pub fn nr_sub_units(&self) -> usize {
        self.nr_sub_units
    }

    /// Returns the device address window that the instance translates.
    pub fn aperture(&self) -> RangeInclusive<Daddr> {
        if self.settings.is_pcie() {
            self.version.pcie_aperture()
        } else {
            self.version.system_aperture()
        }
    }

    /// Returns whether table walks snoop the CPU caches.
    pub fn is_cache_coherent(&self) -> bool {
        true
    }

    /// Returns the supported mapping sizes as a bitmap of sizes in bytes.
    pub fn pgsize_bitmap(&self) -> u64 {
        PGSIZE_BITMAP
    }

    /// Returns whether the first-use hardware initialization has completed.
    pub fn is_initialized(&self) -> bool {
        self.state.lock().is_init
    }

    /// Returns the SID remap words written at initialization, if any.
    pub fn remap_words(&self) -> Option<RemapWords> {
        self.state.lock().remap
    }

    /// Maps a SID onto the SID whose tables it uses.
    pub(crate) fn table_sid(&self, sid: Sid) -> Sid {
        if self.settings.is_pcie() {
            Sid::ZERO
        } else {
            sid
        }
    }

    /// Initializes the hardware on first use and turns on translation for
    /// `sid`.
    pub(crate) fn prepare_sid(&self, sid: Sid) -> Result<()> {
        let mut state = self.state.lock();
        if !state.is_init {
            self.init_hardware(&mut state)?;
        }
        let sid = self.table_sid(sid);
        for unit in state.units.iter() {
            if let Err(readback) = self.version.enable_sid(unit, sid) {
                error!(
                    "{}: {}: failed to enable SID {}, read back {:#010x}",
                    self.settings.name(),
                    unit.name(),
                    sid,
                    readback
                );
            }
        }
        Ok(())
    }

    fn init_hardware(&self, state: &mut DartState) -> Result<()> {
        let remap = match state.units.first() {
            Some(first) => self.version.remap_words(first, self.settings.remap()),
            None => return Err(DartError::MissingSubUnit),
        };
        state.remap = Some(remap);

        let mut result = Ok(());
        for unit in state.units.iter() {
            let initialized = self.version.init_subunit(
                unit,
                &remap,
                self.settings.sid_mask(),
                self.settings.flush_poll_limit(),
            );
            if let Err(err) = initialized {
                error!("{}: {}: initialization failed: {}", self.settings.name(), unit.name(), err);
                result = result.and(Err(err));
            }
        }
        result?;

        state.is_init = true;
        info!("{}: hardware initialized", self.settings.name());
        Ok(())
    }

    /// Invalidates the TLB entries of the SIDs in `sid_mask` on every
    /// sub-unit.
    ///
    /// Every sub-unit is flushed even if an earlier one times out; the first
    /// error is returned.
    pub fn flush(&self, sid_mask: u32) -> Result<()> {
        let state = self.state.lock();
        self.flush_locked(&state, sid_mask)
    }

    pub(crate) fn flush_sid(&self, sid: Sid) -> Result<()> {
        self.flush(self.table_sid(sid).mask())
    }

    fn flush_locked(&self, state: &DartState, sid_mask: u32) -> Result<()> {
        let mut result = Ok(());
        for unit in state.units.iter() {
            let flushed =
                self.version
                    .flush_tlb(unit, sid_mask, self.settings.flush_poll_limit());
            if let Err(err) = flushed {
                error!(
                    "{}: {}: TLB flush of SID mask {:#x} failed: {}",
                    self.settings.name(),
                    unit.name(),
                    sid_mask,
                    err
                );
                result = result.and(Err(err));
            }
        }
        result
    }

    /// Maps `len` bytes at `daddr` to the physical memory at `paddr`.
    ///
    /// Addresses below the IOVA offset are ignored. A failure leaves the
    /// pages mapped before it in place.
    pub(crate) fn map(&self, sid: Sid, daddr: Daddr, paddr: Paddr, len: usize) -> Result<()> {
        let Some(daddr) = daddr.checked_sub(self.settings.iova_offset()) else {
            return Ok(());
        };
        let sid = self.table_sid(sid);

        let mut state = self.state.lock();
        for (page, page_paddr) in self.pages(daddr, paddr, len) {
            let (guard, slot) = self.create_pte(state, sid, page)?;
            state = guard;
            state.tables.write(slot, Pte::page(page_paddr));
        }
        Ok(())
    }

    /// Unmaps `len` bytes at `daddr` and returns the number of bytes
    /// unmapped.
    pub(crate) fn unmap(&self, sid: Sid, daddr: Daddr, len: usize) -> usize {
        let Some(daddr) = daddr.checked_sub(self.settings.iova_offset()) else {
            return 0;
        };
        let sid = self.table_sid(sid);

        let state = self.state.lock();
        for (page, _) in self.pages(daddr, 0, len) {
            if let Walk::Found(slot) = state.tables.walk(sid, page) {
                state.tables.write(slot, Pte::INVALID);
            }
        }
        len
    }

    /// Translates `daddr`, returning 0 if it is not mapped.
    pub(crate) fn iova_to_phys(&self, sid: Sid, daddr: Daddr) -> Paddr {
        let Some(table_daddr) = daddr.checked_sub(self.settings.iova_offset()) else {
            return 0;
        };
        let sid = self.table_sid(sid);

        let state = self.state.lock();
        let Walk::Found(slot) = state.tables.walk(sid, table_daddr) else {
            return 0;
        };
        let pte = state.tables.read(slot);
        if !pte.is_present() {
            return 0;
        }
        pte.paddr() | (daddr & (self.settings.page_size() - 1))
    }

    /// Iterates over the pages intersecting `[daddr, daddr + len)`, along
    /// with the physical page each one maps to.
    fn pages(&self, daddr: Daddr, paddr: Paddr, len: usize) -> impl Iterator<Item = (Daddr, Paddr)> {
        let page_mask = self.settings.page_size() - 1;
        let first = daddr & !page_mask;
        let end = if len == 0 {
            first
        } else {
            daddr.saturating_add(len as u64)
        };
        let paddr = paddr & !page_mask;
        (first..end)
            .step_by(self.settings.page_size() as usize)
            .map(move |page| (page, paddr.wrapping_add(page - first)))
    }

    /// Finds the leaf entry of `daddr`, creating the tables on the way.
    fn create_pte<'a>(
        &'a self,
        mut state: MutexGuard<'a, DartState>,
        sid: Sid,
        daddr: Daddr,
    ) -> Result<(MutexGuard<'a, DartState>, PteSlot)> {
        loop {
            let walk = state.tables.walk(sid, daddr);
            state = match walk {
                Walk::Found(slot) => return Ok((state, slot)),
                Walk::NoRoot => self.grow_root(state, sid, daddr)?,
                Walk::NoTable { group } => self.grow_group(state, sid, daddr, group)?,
            };
        }
    }

    /// Allocates the L1 table of `sid` with the lock released, then
    /// installs it unless another thread did so meanwhile.
    fn grow_root<'a>(
        &'a self,
        state: MutexGuard<'a, DartState>,
        sid: Sid,
        daddr: Daddr,
    ) -> Result<MutexGuard<'a, DartState>> {
        let geometry = *state.tables.geometry();
        drop(state);

        let Some(hw) = self.allocator.alloc_coherent(geometry.l1_bytes()) else {
            return self.relock_after_failure(sid, daddr, Walk::NoRoot, "L1 table");
        };
        let root = match ShadowRoot::new(hw, &geometry) {
            Ok(root) => root,
            Err(hw) => {
                self.free(hw);
                return self.relock_after_failure(sid, daddr, Walk::NoRoot, "L1 array");
            }
        };

        let mut state = self.state.lock();
        match state.tables.install_root(sid, root) {
            Ok(paddr) => {
                for unit in state.units.iter() {
                    self.version
                        .program_ttbr(unit, sid, paddr, self.settings.page_size());
                }
                debug!("{}: SID {} L1 table at {:#x}", self.settings.name(), sid, paddr);
            }
            Err(loser) => {
                debug!("{}: SID {} L1 table raced, dropping {:#x}", self.settings.name(), sid, loser.paddr());
                self.free(loser.into_segment());
            }
        }
        Ok(state)
    }

    /// Allocates the L2 tables of one L1 slot group with the lock released,
    /// then installs them unless another thread did so meanwhile.
    fn grow_group<'a>(
        &'a self,
        state: MutexGuard<'a, DartState>,
        sid: Sid,
        daddr: Daddr,
        group: usize,
    ) -> Result<MutexGuard<'a, DartState>> {
        let nbytes = state.tables.geometry().l2_group_bytes();
        drop(state);

        let Some(l2) = self.allocator.alloc_coherent(nbytes) else {
            return self.relock_after_failure(sid, daddr, Walk::NoTable { group }, "L2 table");
        };
        let paddr = l2.paddr();

        let mut state = self.state.lock();
        match state.tables.install_group(sid, group, l2) {
            Ok(()) => debug!(
                "{}: SID {} L2 table for slot {} at {:#x}",
                self.settings.name(),
                sid,
                group,
                paddr
            ),
            Err(loser) => {
                debug!(
                    "{}: SID {} L2 table for slot {} raced, dropping {:#x}",
                    self.settings.name(),
                    sid,
                    group,
                    paddr
                );
                self.free(loser);
            }
        }
        Ok(state)
    }

    /// Re-takes the lock after allocating a `what` failed.
    ///
    /// Another thread may have installed the missing level while the lock
    /// was released, in which case the walk goes on with its table.
    fn relock_after_failure<'a>(
        &'a self,
        sid: Sid,
        daddr: Daddr,
        missing: Walk,
        what: &str,
    ) -> Result<MutexGuard<'a, DartState>> {
        let state = self.state.lock();
        if state.tables.walk(sid, daddr) != missing {
            return Ok(state);
        }
        drop(state);
        error!(
            "{}: no memory for the {} of SID {} at {:#x}",
            self.settings.name(),
            what,
            sid,
            daddr
        );
        Err(DartError::OutOfMemory)
    }

    fn free(&self, segment: DmaSegment) {
        // SAFETY: The segment came from this allocator and was never linked
        // into a table or written to a register.
        unsafe { self.allocator.free_coherent(segment) };
    }

    /// Reads and clears the error status of every sub-unit.
    ///
    /// This is the body of the instance's interrupt handler. Faults are
    /// logged and queued for [`Self::take_faults`]. Returns the number of
    /// faults found.
    pub fn handle_irq(&self) -> usize {
        let mut state = self.state.lock();
        let DartState { units, faults, .. } = &mut *state;

        let mut nr_faults = 0;
        for unit in units.iter() {
            if let Some(fault) = self.version.decode_error(unit) {
                error!("{}: translation fault: {}", self.settings.name(), fault);
                faults.push(fault);
                nr_faults += 1;
            }
        }
        nr_faults
    }

    /// Takes the faults queued by [`Self::handle_irq`], oldest first.
    pub fn take_faults(&self) -> Vec<FaultRecord> {
        let mut state = self.state.lock();
        let nr_faults = state.faults.len();
        if nr_faults != 0 {
            debug!("{}: taking {} queued fault(s)", self.settings.name(), nr_faults);
        }
        state.faults.take().into()
    }

    /// Reads the performance counters of a sub-unit.
    ///
    /// Only first-generation hardware has them.
    pub fn perf_counters(&self, sub_unit: usize) -> Option<PerfCounters> {
        let state = self.state.lock();
        let unit = state.units.get(sub_unit)?;
        self.version.perf_counters(unit)
    }
}

impl core::fmt::Debug for Dart {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Dart")
            .field("version", &self.version)
            .field("settings", &self.settings)
            .field("nr_sub_units", &self.nr_sub_units)
            .finish_non_exhaustive()
    }
}
