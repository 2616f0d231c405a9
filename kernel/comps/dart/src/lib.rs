// SPDX-License-Identifier: MPL-2.0

//! The driver of the Apple Device Address Resolution Table (DART).
//!
//! A DART is the IOMMU in front of the DMA masters of Apple SoCs. Every
//! device issues its DMA with a stream ID (SID), and each SID selects its own
//! two-level translation table. This crate manages those tables and the
//! TLB and enable registers of the two hardware generations, and exposes
//! them through [`Domain`]s, i.e., device address spaces.
//!
//! The crate does not discover hardware by itself. The caller supplies the
//! register windows of each instance as [`RegisterIo`] objects and the
//! memory for the tables through a [`DmaAllocator`]:
//!
//! ```ignore
//! let dart = Dart::new(version, vec![Box::new(regs)], &config, allocator)?;
//! let device = Device::new(DeviceId(0), Some(DeviceBinding::new(&dart, 1)?));
//! let domain = Domain::new();
//! domain.attach(&device)?;
//! domain.map(0x10_0000, paddr, 0x4000)?;
//! domain.iotlb_sync_map(0x10_0000, 0x4000)?;
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod config;
mod dart;
mod dma;
mod domain;
mod error;
mod fault;
mod page_table;
mod registers;
#[cfg(test)]
mod test_util;
mod version;

pub use self::{
    config::{DartConfig, DartSettings, MAX_SID, PAGE_BITS_RANGE, Sid, SidRemap},
    dart::Dart,
    dma::{DmaAllocator, DmaSegment, LinearDmaAllocator},
    domain::{Device, DeviceBinding, DeviceId, Domain, DomainGeometry},
    error::{DartError, Result},
    fault::{FAULT_QUEUE_CAPACITY, FaultDetail, FaultRecord},
    registers::{ErrorFlags, IoMem, REGISTER_WINDOW_SIZE, RegisterIo},
    version::{DartVersion, MAX_SUB_UNITS, PerfCounters, RemapWords},
};

/// A physical address.
pub type Paddr = u64;

/// A device address, i.e., an address that a device puts on the bus.
pub type Daddr = u64;
