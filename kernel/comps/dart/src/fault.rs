// SPDX-License-Identifier: MPL-2.0

//! Translation faults reported by the hardware.

use alloc::collections::VecDeque;
use core::fmt;

use log::warn;

use crate::{registers::ErrorFlags, version::sub_unit_name};

/// The number of faults kept for [`Dart::take_faults`] before the oldest
/// ones are dropped.
///
/// [`Dart::take_faults`]: crate::Dart::take_faults
pub const FAULT_QUEUE_CAPACITY: usize = 64;

/// A decoded error report of one sub-unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultRecord {
    sub_unit: usize,
    status: u32,
    address: u64,
    detail: FaultDetail,
}

/// The generation-specific part of a [`FaultRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultDetail {
    V0 {
        /// The two AXI request words latched with the error.
        axi_req: [u32; 2],
        tlb_status: u32,
    },
    V1 {
        flags: ErrorFlags,
        /// The SID of the faulting access.
        sid: u8,
    },
}

impl FaultRecord {
    pub(crate) fn new(sub_unit: usize, status: u32, address: u64, detail: FaultDetail) -> Self {
        Self {
            sub_unit,
            status,
            address,
            detail,
        }
    }

    /// Returns the index of the sub-unit that reported the fault.
    pub fn sub_unit(&self) -> usize {
        self.sub_unit
    }

    /// Returns the name of the sub-unit that reported the fault.
    pub fn sub_unit_name(&self) -> &'static str {
        sub_unit_name(self.sub_unit)
    }

    /// Returns the raw error status word.
    pub fn status(&self) -> u32 {
        self.status
    }

    /// Returns the device address of the faulting access.
    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn detail(&self) -> &FaultDetail {
        &self.detail
    }

    /// Returns the SID of the faulting access, if the hardware reports it.
    pub fn sid(&self) -> Option<u8> {
        match self.detail {
            FaultDetail::V0 { .. } => None,
            FaultDetail::V1 { sid, .. } => Some(sid),
        }
    }

    /// Returns whether the access hit a missing table or page entry.
    pub fn is_translation_fault(&self) -> bool {
        match self.detail {
            FaultDetail::V0 { .. } => false,
            FaultDetail::V1 { flags, .. } => flags.intersects(
                ErrorFlags::TTBR_INVALID | ErrorFlags::L2E_INVALID | ErrorFlags::PTE_INVALID,
            ),
        }
    }
}

impl fmt::Display for FaultRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: status {:#010x} at {:#x}",
            self.sub_unit_name(),
            self.status,
            self.address
        )?;
        match self.detail {
            FaultDetail::V0 {
                axi_req,
                tlb_status,
            } => write!(
                f,
                ", axi {:#010x} {:#010x}, tlb status {:#010x}",
                axi_req[0], axi_req[1], tlb_status
            ),
            FaultDetail::V1 { flags, sid } => write!(f, ", sid {} ({:?})", sid, flags),
        }
    }
}

/// The faults reported but not yet taken.
#[derive(Debug, Default)]
pub(crate) struct FaultQueue {
    records: VecDeque<FaultRecord>,
}

impl FaultQueue {
    pub(crate) const fn new() -> Self {
        Self {
            records: VecDeque::new(),
        }
    }

    /// Queues a fault, dropping the oldest one if the queue is full.
    pub(crate) fn push(&mut self, record: FaultRecord) {
        if self.records.len() >= FAULT_QUEUE_CAPACITY {
            if let Some(dropped) = self.records.pop_front() {
                warn!("fault queue full, dropping {}", dropped);
            }
        }
        if self.records.try_reserve(1).is_err() {
            warn!("no memory to queue fault {}", record);
            return;
        }
        self.records.push_back(record);
    }

    pub(crate) fn take(&mut self) -> VecDeque<FaultRecord> {
        core::mem::take(&mut self.records)
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn record(address: u64) -> FaultRecord {
        FaultRecord::new(
            0,
            0x8000_0002,
            address,
            FaultDetail::V1 {
                flags: ErrorFlags::FLAG | ErrorFlags::L2E_INVALID,
                sid: 1,
            },
        )
    }

    #[test]
    fn queue_drops_oldest() {
        let mut queue = FaultQueue::new();
        for address in 0..(FAULT_QUEUE_CAPACITY as u64 + 3) {
            queue.push(record(address));
        }
        assert_eq!(queue.len(), FAULT_QUEUE_CAPACITY);
        let records = queue.take();
        assert_eq!(records.front().unwrap().address(), 3);
        assert_eq!(
            records.back().unwrap().address(),
            FAULT_QUEUE_CAPACITY as u64 + 2
        );
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn translation_faults() {
        let fault = record(0x1000);
        assert!(fault.is_translation_fault());
        assert_eq!(fault.sid(), Some(1));
        assert_eq!(fault.sub_unit_name(), "DART");

        let fault = FaultRecord::new(
            1,
            0x10,
            0,
            FaultDetail::V0 {
                axi_req: [0, 0],
                tlb_status: 0,
            },
        );
        assert!(!fault.is_translation_fault());
        assert_eq!(fault.sid(), None);
        assert_eq!(fault.sub_unit_name(), "SMMU");
    }
}
