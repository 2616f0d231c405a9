// SPDX-License-Identifier: MPL-2.0

//! The per-generation hardware operations.
//!
//! Two DART generations share one software model but disagree on register
//! offsets, field widths, the number of SIDs and the number of cooperating
//! sub-units. [`DartVersion`] is a closed set of the two; every operation
//! dispatches with a `match` on it.

use alloc::boxed::Box;
use core::ops::RangeInclusive;

use bit_field::BitField;

use crate::{
    Daddr, DartError, Paddr, Result,
    config::{Sid, SidRemap},
    fault::{FaultDetail, FaultRecord},
    page_table::Pte,
    registers::{ErrorFlags, NR_TTBR_SLOTS, RegisterIo, TTBR_SHIFT, v0, v1},
};

/// The names of the sub-units, by index.
const SUB_UNIT_NAMES: [&str; MAX_SUB_UNITS] = ["DART", "SMMU"];

/// The largest number of sub-units any generation has.
pub const MAX_SUB_UNITS: usize = 2;

/// A DART hardware generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DartVersion {
    /// The first generation, found on A10-era SoCs.
    V0,
    /// The second generation, found on M1-era SoCs.
    V1,
}

impl DartVersion {
    /// Looks up the generation of a firmware compatible string.
    pub fn from_compatible(compatible: &str) -> Option<Self> {
        match compatible {
            "apple,dart-a10" => Some(Self::V0),
            "apple,dart-m1" | "apple,dart" => Some(Self::V1),
            _ => None,
        }
    }

    /// Returns the number of SIDs the generation can tell apart.
    pub const fn nr_sids(self) -> usize {
        match self {
            Self::V0 => v0::NR_SIDS,
            Self::V1 => v1::NR_SIDS,
        }
    }

    /// Returns the number of register windows an instance needs at least.
    pub const fn min_sub_units(self) -> usize {
        1
    }

    /// Returns the number of register windows an instance may have.
    pub const fn max_sub_units(self) -> usize {
        match self {
            Self::V0 => 1,
            Self::V1 => 2,
        }
    }

    /// Returns the offset between device addresses and the tables' zero
    /// point on a PCIe instance.
    pub const fn pcie_iova_offset(self) -> u64 {
        match self {
            Self::V0 => 0x8000_0000,
            Self::V1 => 0,
        }
    }

    /// Returns the translatable window of a PCIe instance.
    pub const fn pcie_aperture(self) -> RangeInclusive<Daddr> {
        match self {
            Self::V0 => 0x8000_0000..=0xBBFF_FFFF,
            Self::V1 => 0x0010_0000..=0x3FEF_FFFF,
        }
    }

    /// Returns the translatable window of a system instance.
    pub const fn system_aperture(self) -> RangeInclusive<Daddr> {
        0x0000_4000..=0xFFFF_FFFF
    }

    /// Returns the state bits of an L1 entry that points to an L2 table.
    pub const fn pte_next_flag(self) -> u64 {
        match self {
            Self::V0 => Pte::STATE_NEXT_V0,
            Self::V1 => Pte::STATE_NEXT_V1,
        }
    }

    const fn ttbr_mask(self) -> u32 {
        match self {
            Self::V0 => v0::TTBR_MASK,
            Self::V1 => v1::TTBR_MASK,
        }
    }

    const fn ttbr_valid(self) -> u32 {
        match self {
            Self::V0 => v0::TTBR_VALID,
            Self::V1 => v1::TTBR_VALID,
        }
    }

    const fn ttbr(self, sid: usize, slot: usize) -> usize {
        match self {
            Self::V0 => v0::ttbr(sid, slot),
            Self::V1 => v1::ttbr(sid, slot),
        }
    }

    /// Encodes the value of a TTBR slot pointing at `paddr`.
    pub fn encode_ttbr(self, paddr: Paddr) -> u32 {
        (((paddr >> TTBR_SHIFT) as u32) & self.ttbr_mask()) | self.ttbr_valid()
    }

    /// Reads and clears the error status of a sub-unit.
    ///
    /// Returns `None` if no error is latched.
    pub(crate) fn decode_error(self, unit: &SubUnit) -> Option<FaultRecord> {
        match self {
            Self::V0 => {
                let status = unit.read(v0::ERROR_STATUS);
                if status == 0 {
                    return None;
                }
                let tlb_status = unit.read(v0::TLB_STATUS);
                let axi_req = [unit.read(v0::ERROR_AXI_REQ0), unit.read(v0::ERROR_AXI_REQ1)];
                let address = unit.read(v0::ERROR_ADDRESS) as u64;

                unit.write(v0::ERROR_STATUS, status);
                unit.write(v0::TLB_STATUS, tlb_status);

                Some(FaultRecord::new(
                    unit.index(),
                    status,
                    address,
                    FaultDetail::V0 {
                        axi_req,
                        tlb_status,
                    },
                ))
            }
            Self::V1 => {
                let status = unit.read(v1::ERROR_STATUS);
                if status == 0 {
                    return None;
                }
                let address = unit.read(v1::ERROR_ADDRESS_LO) as u64
                    | (unit.read(v1::ERROR_ADDRESS_HI) as u64) << 32;

                unit.write(v1::ERROR_STATUS, status);

                Some(FaultRecord::new(
                    unit.index(),
                    status,
                    address,
                    FaultDetail::V1 {
                        flags: ErrorFlags::from_bits_truncate(status),
                        sid: status.get_bits(24..28) as u8,
                    },
                ))
            }
        }
    }

    /// Invalidates the TLB entries of the SIDs in `sid_mask` and waits for
    /// the sub-unit to finish, polling at most `poll_limit` times.
    pub(crate) fn flush_tlb(self, unit: &SubUnit, sid_mask: u32, poll_limit: usize) -> Result<()> {
        match self {
            Self::V0 => {
                let sid_mask = sid_mask & ((1 << v0::NR_SIDS) - 1);
                unit.write(
                    v0::TLB_OP,
                    v0::TLB_OP_FLUSH | (sid_mask << v0::TLB_OP_SID_SHIFT),
                );
                poll_until(poll_limit, || unit.read(v0::TLB_OP) & v0::TLB_OP_BUSY == 0)
            }
            Self::V1 => {
                unit.write(v1::TLB_OP_SIDMASK, sid_mask);
                unit.write(v1::TLB_OP, v1::TLB_OP_FLUSH);
                poll_until(poll_limit, || {
                    let status = unit.read(v1::TLB_OP);
                    status & v1::TLB_OP_OPMASK == 0 || status & v1::TLB_OP_BUSY == 0
                })
            }
        }
    }

    /// Points the four TTBR slots of `sid` at the hardware L1 table at
    /// `paddr`, one DART page per slot.
    pub(crate) fn program_ttbr(self, unit: &SubUnit, sid: Sid, paddr: Paddr, page_size: u64) {
        for slot in 0..NR_TTBR_SLOTS {
            let slot_paddr = paddr + slot as u64 * page_size;
            unit.write(self.ttbr(sid.index(), slot), self.encode_ttbr(slot_paddr));
        }
    }

    /// Turns on translation for `sid`, unless it is already on.
    ///
    /// On failure, returns the enable register as read back.
    pub(crate) fn enable_sid(self, unit: &SubUnit, sid: Sid) -> core::result::Result<(), u32> {
        match self {
            Self::V0 => {
                let txen = v0::config_txen(sid.index());
                let config = unit.read(v0::CONFIG);
                if config & txen != 0 {
                    return Ok(());
                }
                unit.write(v0::CONFIG, config | txen);
                let readback = unit.read(v0::CONFIG);
                if readback & txen == 0 {
                    return Err(readback);
                }
            }
            Self::V1 => {
                let reg = v1::config(sid.index());
                if unit.read(reg) == v1::CONFIG_TXEN {
                    return Ok(());
                }
                unit.write(reg, v1::CONFIG_TXEN);
                let readback = unit.read(reg);
                if readback != v1::CONFIG_TXEN {
                    return Err(readback);
                }
            }
        }
        Ok(())
    }

    /// Computes the remap words of a second-generation instance.
    ///
    /// The hardware's current words are read from `unit` and the configured
    /// remaps are overlaid, one byte per SID. The result is meant to be
    /// computed once and written to every sub-unit.
    pub(crate) fn remap_words(self, unit: &SubUnit, remap: &SidRemap) -> RemapWords {
        let mut words = [0u32; v1::NR_REMAP_WORDS];
        if self == Self::V0 {
            return RemapWords(words);
        }
        for (idx, word) in words.iter_mut().enumerate() {
            *word = unit.read(v1::sid_remap(idx));
        }
        for (source, target) in remap.iter() {
            let lsb = (source.index() % 4) * 8;
            words[source.index() / 4].set_bits(lsb..lsb + 8, target.index() as u32);
        }
        RemapWords(words)
    }

    /// Brings a sub-unit into a known state on the first use of an
    /// instance.
    pub(crate) fn init_subunit(
        self,
        unit: &SubUnit,
        remap: &RemapWords,
        sid_mask: u32,
        poll_limit: usize,
    ) -> Result<()> {
        match self {
            Self::V0 => {
                unit.write(v0::UNKNOWN_24, 0x0020_FFFC);
                unit.write(v0::UNKNOWN_2C, 0);
                for sid in 0..v0::NR_SIDS {
                    for slot in 0..NR_TTBR_SLOTS {
                        unit.write(v0::ttbr(sid, slot), 0);
                    }
                }
                unit.write(v0::FETCH_CONFIG, 0x000E_0303);
                unit.write(v0::DIAG_CONFIG, 0x0000_0100);
                for idx in 0..v0::NR_TLB_UNKNOWN {
                    unit.write(v0::tlb_unknown(idx), 0);
                }
                unit.write(v0::TLB_STATUS, 0x03F3_FFFF);

                self.flush_tlb(unit, 0xF, poll_limit)
            }
            Self::V1 => {
                for (idx, word) in remap.0.iter().enumerate() {
                    unit.write(v1::sid_remap(idx), *word);
                }
                let sids = || (0..v1::NR_SIDS).filter(|sid| sid_mask & (1 << sid) != 0);
                for sid in sids() {
                    for slot in 0..NR_TTBR_SLOTS {
                        unit.write(v1::ttbr(sid, slot), 0);
                    }
                }

                let flushed = self.flush_tlb(unit, 0xFFFF_FFFF, poll_limit);

                for sid in sids() {
                    unit.write(v1::config(sid), v1::CONFIG_TXEN);
                }
                flushed
            }
        }
    }

    /// Reads the TLB and stream-table performance counters of a
    /// first-generation sub-unit.
    pub(crate) fn perf_counters(self, unit: &SubUnit) -> Option<PerfCounters> {
        match self {
            Self::V0 => Some(PerfCounters {
                tlb_miss: unit.read(v0::TLB_MISS),
                tlb_wait: unit.read(v0::TLB_WAIT),
                tlb_hit: unit.read(v0::TLB_HIT),
                st_miss: unit.read(v0::ST_MISS),
                st_wait: unit.read(v0::ST_WAIT),
                st_hit: unit.read(v0::ST_HIT),
            }),
            Self::V1 => None,
        }
    }
}

fn poll_until(limit: usize, mut done: impl FnMut() -> bool) -> Result<()> {
    for _ in 0..limit {
        if done() {
            return Ok(());
        }
        core::hint::spin_loop();
    }
    Err(DartError::HardwareTimeout)
}

/// The SID remap register contents of a second-generation instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemapWords([u32; v1::NR_REMAP_WORDS]);

impl RemapWords {
    /// Returns the register words.
    pub fn words(&self) -> &[u32] {
        &self.0
    }
}

/// The performance counters of a first-generation sub-unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerfCounters {
    pub tlb_miss: u32,
    pub tlb_wait: u32,
    pub tlb_hit: u32,
    pub st_miss: u32,
    pub st_wait: u32,
    pub st_hit: u32,
}

/// One register window of an instance.
pub(crate) struct SubUnit {
    index: usize,
    regs: Box<dyn RegisterIo>,
}

impl SubUnit {
    pub(crate) fn new(index: usize, regs: Box<dyn RegisterIo>) -> Self {
        Self { index, regs }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn name(&self) -> &'static str {
        sub_unit_name(self.index)
    }

    fn read(&self, offset: usize) -> u32 {
        self.regs.read_u32(offset)
    }

    fn write(&self, offset: usize, value: u32) {
        self.regs.write_u32(offset, value);
    }
}

/// Returns the name of the sub-unit at `index`.
pub(crate) fn sub_unit_name(index: usize) -> &'static str {
    SUB_UNIT_NAMES.get(index).copied().unwrap_or("?")
}

#[cfg(test)]
mod test {
    use alloc::sync::Arc;

    use super::*;
    use crate::test_util::MockRegisters;

    fn new_unit(version: DartVersion) -> (Arc<MockRegisters>, SubUnit) {
        let regs = Arc::new(MockRegisters::new(version));
        (regs.clone(), SubUnit::new(0, Box::new(regs)))
    }

    fn sid(raw: u32) -> Sid {
        Sid::new(raw).unwrap()
    }

    #[test]
    fn compatible_strings() {
        assert_eq!(DartVersion::from_compatible("apple,dart-a10"), Some(DartVersion::V0));
        assert_eq!(DartVersion::from_compatible("apple,dart-m1"), Some(DartVersion::V1));
        assert_eq!(DartVersion::from_compatible("apple,dart"), Some(DartVersion::V1));
        assert_eq!(DartVersion::from_compatible("apple,t8110-dart"), None);
    }

    #[test]
    fn ttbr_encoding_differs_in_frame_width() {
        let paddr = 0x12_3456_7000;
        assert_eq!(DartVersion::V0.encode_ttbr(paddr), 0x8023_4567);
        assert_eq!(DartVersion::V1.encode_ttbr(paddr), 0x8123_4567);
    }

    #[test]
    fn program_ttbr_writes_four_consecutive_pages() {
        for version in [DartVersion::V0, DartVersion::V1] {
            let (regs, unit) = new_unit(version);
            version.program_ttbr(&unit, sid(2), 0x8_0000_0000, 0x4000);
            let slots: alloc::vec::Vec<_> = (0..NR_TTBR_SLOTS)
                .map(|slot| regs.peek(version.ttbr(2, slot)))
                .collect();
            for (slot, value) in slots.iter().enumerate() {
                assert_eq!(
                    *value,
                    version.encode_ttbr(0x8_0000_0000 + slot as u64 * 0x4000)
                );
            }
        }
    }

    #[test]
    fn v0_flush_writes_mask_and_flush_bit() {
        let (regs, unit) = new_unit(DartVersion::V0);
        DartVersion::V0.flush_tlb(&unit, 0b0100, 10).unwrap();
        assert_eq!(regs.writes_to(v0::TLB_OP), [v0::TLB_OP_FLUSH | 0b0100 << 8]);
    }

    #[test]
    fn v1_flush_writes_mask_then_op() {
        let (regs, unit) = new_unit(DartVersion::V1);
        DartVersion::V1.flush_tlb(&unit, 0x8000, 10).unwrap();
        assert_eq!(regs.writes_to(v1::TLB_OP_SIDMASK), [0x8000]);
        assert_eq!(regs.writes_to(v1::TLB_OP), [v1::TLB_OP_FLUSH]);
    }

    #[test]
    fn stuck_flush_times_out() {
        for version in [DartVersion::V0, DartVersion::V1] {
            let (regs, unit) = new_unit(version);
            regs.set_busy(true);
            assert_eq!(
                version.flush_tlb(&unit, 1, 100),
                Err(DartError::HardwareTimeout)
            );
            assert!(regs.busy_polls() >= 100);
        }
    }

    #[test]
    fn enable_is_idempotent() {
        for version in [DartVersion::V0, DartVersion::V1] {
            let (regs, unit) = new_unit(version);
            version.enable_sid(&unit, sid(1)).unwrap();
            let writes = regs.nr_writes();
            version.enable_sid(&unit, sid(1)).unwrap();
            assert_eq!(regs.nr_writes(), writes);
        }
    }

    #[test]
    fn v0_enable_keeps_other_sids() {
        let (regs, unit) = new_unit(DartVersion::V0);
        DartVersion::V0.enable_sid(&unit, sid(0)).unwrap();
        DartVersion::V0.enable_sid(&unit, sid(3)).unwrap();
        assert_eq!(regs.peek(v0::CONFIG), 0x8000_0080);
    }

    #[test]
    fn enable_reports_readback_mismatch() {
        let (regs, unit) = new_unit(DartVersion::V1);
        regs.pin(v1::config(4), 0);
        assert_eq!(DartVersion::V1.enable_sid(&unit, sid(4)), Err(0));
    }

    #[test]
    fn remap_words_overlay_hardware_values() {
        let (regs, unit) = new_unit(DartVersion::V1);
        regs.poke(v1::sid_remap(0), 0x0302_0100);
        regs.poke(v1::sid_remap(1), 0x0706_0504);
        let mut remap = SidRemap::identity();
        remap.set(sid(1), sid(9));
        remap.set(sid(7), sid(0));
        let words = DartVersion::V1.remap_words(&unit, &remap);
        assert_eq!(words.words()[0], 0x0302_0900);
        assert_eq!(words.words()[1], 0x0006_0504);
        assert_eq!(words.words()[2], 0);
    }

    #[test]
    fn v1_init_resets_masked_sids() {
        let (regs, unit) = new_unit(DartVersion::V1);
        regs.poke(v1::ttbr(0, 0), 0xFFFF_FFFF);
        regs.poke(v1::ttbr(5, 0), 0xFFFF_FFFF);
        let remap = DartVersion::V1.remap_words(&unit, &SidRemap::identity());
        DartVersion::V1.init_subunit(&unit, &remap, 0b11, 10).unwrap();

        assert_eq!(regs.peek(v1::ttbr(0, 0)), 0);
        assert_eq!(regs.peek(v1::ttbr(5, 0)), 0xFFFF_FFFF);
        assert_eq!(regs.writes_to(v1::TLB_OP_SIDMASK), [0xFFFF_FFFF]);
        assert_eq!(regs.peek(v1::config(0)), v1::CONFIG_TXEN);
        assert_eq!(regs.peek(v1::config(1)), v1::CONFIG_TXEN);
        assert_eq!(regs.peek(v1::config(2)), 0);
    }

    #[test]
    fn v0_init_writes_reset_values() {
        let (regs, unit) = new_unit(DartVersion::V0);
        regs.poke(v0::ttbr(3, 3), 0x8000_1234);
        DartVersion::V0
            .init_subunit(&unit, &RemapWords::default(), 0xF, 10)
            .unwrap();
        assert_eq!(regs.peek(v0::UNKNOWN_24), 0x0020_FFFC);
        assert_eq!(regs.peek(v0::FETCH_CONFIG), 0x000E_0303);
        assert_eq!(regs.peek(v0::DIAG_CONFIG), 0x100);
        assert_eq!(regs.peek(v0::TLB_STATUS), 0x03F3_FFFF);
        assert_eq!(regs.peek(v0::ttbr(3, 3)), 0);
        assert_eq!(regs.writes_to(v0::TLB_OP), [v0::TLB_OP_FLUSH | 0xF << 8]);
    }

    #[test]
    fn v1_decode_clears_status() {
        let (regs, unit) = new_unit(DartVersion::V1);
        assert!(DartVersion::V1.decode_error(&unit).is_none());

        regs.poke(v1::ERROR_STATUS, 0x8300_0004);
        regs.poke(v1::ERROR_ADDRESS_LO, 0x1234_5000);
        regs.poke(v1::ERROR_ADDRESS_HI, 0x2);
        let fault = DartVersion::V1.decode_error(&unit).unwrap();
        assert_eq!(fault.address(), 0x2_1234_5000);
        assert_eq!(
            fault.detail(),
            &FaultDetail::V1 {
                flags: ErrorFlags::FLAG | ErrorFlags::PTE_INVALID,
                sid: 3,
            }
        );
        assert_eq!(regs.writes_to(v1::ERROR_STATUS), [0x8300_0004]);
    }

    #[test]
    fn v0_decode_collects_axi_requests() {
        let (regs, unit) = new_unit(DartVersion::V0);
        regs.poke(v0::ERROR_STATUS, 0x10);
        regs.poke(v0::TLB_STATUS, 0x3);
        regs.poke(v0::ERROR_AXI_REQ0, 0xAA);
        regs.poke(v0::ERROR_AXI_REQ1, 0xBB);
        regs.poke(v0::ERROR_ADDRESS, 0xF000_0000);
        let fault = DartVersion::V0.decode_error(&unit).unwrap();
        assert_eq!(fault.status(), 0x10);
        assert_eq!(fault.address(), 0xF000_0000);
        assert_eq!(
            fault.detail(),
            &FaultDetail::V0 {
                axi_req: [0xAA, 0xBB],
                tlb_status: 0x3,
            }
        );
        assert_eq!(regs.writes_to(v0::TLB_STATUS), [0x3]);
    }

    #[test]
    fn perf_counters_only_on_v0() {
        let (regs, unit) = new_unit(DartVersion::V0);
        regs.poke(v0::TLB_HIT, 42);
        assert_eq!(DartVersion::V0.perf_counters(&unit).unwrap().tlb_hit, 42);
        let (_, unit) = new_unit(DartVersion::V1);
        assert!(DartVersion::V1.perf_counters(&unit).is_none());
    }
}
