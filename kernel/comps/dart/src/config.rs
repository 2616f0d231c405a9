// SPDX-License-Identifier: MPL-2.0

//! Per-instance configuration.

use alloc::{
    string::{String, ToString},
    vec::Vec,
};
use core::fmt;

use crate::{DartError, DartVersion, Result};

/// The largest number of SIDs any DART generation supports.
pub const MAX_SID: usize = 16;

/// The accepted range of DART page sizes, in bits.
pub const PAGE_BITS_RANGE: core::ops::RangeInclusive<u32> = 12..=16;

/// A stream ID, i.e., the tag that selects a per-device page table.
///
/// A `Sid` is always below [`MAX_SID`], so it can index per-SID arrays.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sid(u8);

impl Sid {
    pub const ZERO: Self = Self(0);

    /// Creates a SID, or returns `None` if `raw` is not below [`MAX_SID`].
    pub const fn new(raw: u32) -> Option<Self> {
        if (raw as usize) < MAX_SID {
            Some(Self(raw as u8))
        } else {
            None
        }
    }

    /// Returns the SID as an array index.
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Returns the single-bit mask selecting this SID.
    pub const fn mask(self) -> u32 {
        1 << self.0
    }
}

impl fmt::Debug for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sid({:#x})", self.0)
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Options for creating a [`Dart`] instance.
///
/// The options mirror the firmware description of one DART node. They are
/// validated once, when the instance is created.
///
/// [`Dart`]: crate::Dart
#[derive(Debug, Clone)]
pub struct DartConfig {
    name: String,
    page_bits: u32,
    sid_mask: u32,
    pcie: bool,
    sid_remap: Vec<(u32, u32)>,
    flush_poll_limit: usize,
}

impl DartConfig {
    /// Creates options with every setting at its default value.
    pub fn new() -> Self {
        Self {
            name: "dart".to_string(),
            page_bits: 12,
            sid_mask: 0xF,
            pcie: false,
            sid_remap: Vec::new(),
            flush_poll_limit: 1_000_000,
        }
    }

    /// Sets the name used in log messages.
    ///
    /// The default value is `"dart"`.
    pub fn name(&mut self, name: &str) -> &mut Self {
        self.name = name.to_string();
        self
    }

    /// Sets the log2 of the DART page size.
    ///
    /// The default value is 12 (4 KiB pages).
    pub fn page_bits(&mut self, page_bits: u32) -> &mut Self {
        self.page_bits = page_bits;
        self
    }

    /// Sets the bitmask of SIDs that devices may use.
    ///
    /// The default value is `0xF`.
    pub fn sid_mask(&mut self, sid_mask: u32) -> &mut Self {
        self.sid_mask = sid_mask;
        self
    }

    /// Sets whether the DART sits in front of a PCIe root complex.
    ///
    /// A PCIe DART funnels all downstream functions through SID 0 and
    /// translates a generation-specific window. The default value is `false`.
    pub fn pcie(&mut self, pcie: bool) -> &mut Self {
        self.pcie = pcie;
        self
    }

    /// Adds a remapping of the `source` SID onto the `target` SID.
    ///
    /// Remaps only take effect on second-generation hardware.
    pub fn sid_remap(&mut self, source: u32, target: u32) -> &mut Self {
        self.sid_remap.push((source, target));
        self
    }

    /// Adds the remappings of a flattened `(source, target)` cell list.
    ///
    /// Fails if the list has an odd length or names a SID out of range, in
    /// which case no remapping is added.
    pub fn sid_remap_cells(&mut self, cells: &[u32]) -> Result<&mut Self> {
        if cells.len() % 2 != 0
            || cells.iter().any(|&sid| Sid::new(sid).is_none())
        {
            return Err(DartError::InvalidConfig);
        }
        for pair in cells.chunks_exact(2) {
            self.sid_remap.push((pair[0], pair[1]));
        }
        Ok(self)
    }

    /// Sets how many times a TLB flush polls the busy bit before giving up.
    ///
    /// The default value is 1,000,000.
    pub fn flush_poll_limit(&mut self, limit: usize) -> &mut Self {
        self.flush_poll_limit = limit;
        self
    }

    /// Validates the options against a hardware generation.
    pub(crate) fn resolve(&self, version: DartVersion) -> Result<DartSettings> {
        if !PAGE_BITS_RANGE.contains(&self.page_bits) {
            return Err(DartError::InvalidConfig);
        }
        let width_mask = ((1u64 << version.nr_sids()) - 1) as u32;
        if self.sid_mask == 0 || self.sid_mask & !width_mask != 0 {
            return Err(DartError::InvalidConfig);
        }
        if self.flush_poll_limit == 0 {
            return Err(DartError::InvalidConfig);
        }

        let mut remap = SidRemap::identity();
        for &(source, target) in self.sid_remap.iter() {
            let (Some(source), Some(target)) = (Sid::new(source), Sid::new(target)) else {
                return Err(DartError::InvalidConfig);
            };
            remap.set(source, target);
        }

        let iova_offset = if self.pcie {
            version.pcie_iova_offset()
        } else {
            0
        };

        Ok(DartSettings {
            name: self.name.clone(),
            page_bits: self.page_bits,
            sid_mask: self.sid_mask,
            pcie: self.pcie,
            iova_offset,
            remap,
            flush_poll_limit: self.flush_poll_limit,
        })
    }
}

impl Default for DartConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// A SID remapping table. Entries without a remap hold [`SidRemap::NONE`].
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SidRemap([u8; MAX_SID]);

impl SidRemap {
    /// The marker of a SID that is not remapped.
    pub const NONE: u8 = 0xFF;

    /// Creates a table without any remapping.
    pub const fn identity() -> Self {
        Self([Self::NONE; MAX_SID])
    }

    /// Remaps `source` onto `target`.
    pub fn set(&mut self, source: Sid, target: Sid) {
        self.0[source.index()] = target.0;
    }

    /// Returns the remap target of `source`, if any.
    pub fn target(&self, source: Sid) -> Option<Sid> {
        match self.0[source.index()] {
            Self::NONE => None,
            raw => Sid::new(raw as u32),
        }
    }

    /// Iterates over all `(source, target)` remappings.
    pub fn iter(&self) -> impl Iterator<Item = (Sid, Sid)> + '_ {
        (0..MAX_SID as u32)
            .filter_map(Sid::new)
            .filter_map(|source| Some((source, self.target(source)?)))
    }
}

impl fmt::Debug for SidRemap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

/// The validated settings of one instance.
#[derive(Debug, Clone)]
pub struct DartSettings {
    name: String,
    page_bits: u32,
    sid_mask: u32,
    pcie: bool,
    iova_offset: u64,
    remap: SidRemap,
    flush_poll_limit: usize,
}

impl DartSettings {
    /// Returns the name used in log messages.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the log2 of the DART page size.
    pub fn page_bits(&self) -> u32 {
        self.page_bits
    }

    /// Returns the DART page size in bytes.
    pub fn page_size(&self) -> u64 {
        1 << self.page_bits
    }

    /// Returns the bitmask of usable SIDs.
    pub fn sid_mask(&self) -> u32 {
        self.sid_mask
    }

    /// Returns whether the SID is enabled in the SID mask.
    pub fn has_sid(&self, sid: Sid) -> bool {
        self.sid_mask & sid.mask() != 0
    }

    /// Returns whether the instance serves a PCIe root complex.
    pub fn is_pcie(&self) -> bool {
        self.pcie
    }

    /// Returns the distance between device-visible addresses and the zero
    /// point of the translation tables.
    pub fn iova_offset(&self) -> u64 {
        self.iova_offset
    }

    /// Returns the SID remapping table.
    pub fn remap(&self) -> &SidRemap {
        &self.remap
    }

    /// Returns the number of busy-bit polls of a TLB flush.
    pub fn flush_poll_limit(&self) -> usize {
        self.flush_poll_limit
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let settings = DartConfig::new().resolve(DartVersion::V1).unwrap();
        assert_eq!(settings.page_bits(), 12);
        assert_eq!(settings.page_size(), 4096);
        assert_eq!(settings.sid_mask(), 0xF);
        assert!(!settings.is_pcie());
        assert_eq!(settings.iova_offset(), 0);
        assert_eq!(settings.remap(), &SidRemap::identity());
    }

    #[test]
    fn pcie_mode_takes_generation_offset() {
        let mut config = DartConfig::new();
        config.pcie(true);
        assert_eq!(
            config.resolve(DartVersion::V0).unwrap().iova_offset(),
            0x8000_0000
        );
        assert_eq!(config.resolve(DartVersion::V1).unwrap().iova_offset(), 0);
    }

    #[test]
    fn rejects_bad_page_bits() {
        for bits in [0, 11, 17] {
            let mut config = DartConfig::new();
            config.page_bits(bits);
            assert_eq!(
                config.resolve(DartVersion::V1).unwrap_err(),
                DartError::InvalidConfig
            );
        }
    }

    #[test]
    fn sid_mask_must_fit_generation() {
        let mut config = DartConfig::new();
        config.sid_mask(0x1F);
        assert_eq!(
            config.resolve(DartVersion::V0).unwrap_err(),
            DartError::InvalidConfig
        );
        assert!(config.resolve(DartVersion::V1).is_ok());

        config.sid_mask(0);
        assert!(config.resolve(DartVersion::V1).is_err());
    }

    #[test]
    fn remap_cells() {
        let mut config = DartConfig::new();
        config.sid_remap_cells(&[1, 5, 2, 15]).unwrap();
        let settings = config.resolve(DartVersion::V1).unwrap();
        let remap = settings.remap();
        assert_eq!(remap.target(Sid::new(1).unwrap()), Sid::new(5));
        assert_eq!(remap.target(Sid::new(2).unwrap()), Sid::new(15));
        assert_eq!(remap.target(Sid::new(0).unwrap()), None);
        assert_eq!(remap.iter().count(), 2);
    }

    #[test]
    fn malformed_remap_cells_are_rejected() {
        let mut config = DartConfig::new();
        assert_eq!(
            config.sid_remap_cells(&[1, 2, 3]).unwrap_err(),
            DartError::InvalidConfig
        );
        assert_eq!(
            config.sid_remap_cells(&[1, 16]).unwrap_err(),
            DartError::InvalidConfig
        );
        assert_eq!(
            config.resolve(DartVersion::V1).unwrap().remap(),
            &SidRemap::identity()
        );
    }

    #[test]
    fn sid_bounds() {
        assert!(Sid::new(15).is_some());
        assert!(Sid::new(16).is_none());
        assert_eq!(Sid::new(3).unwrap().mask(), 0b1000);
    }
}
