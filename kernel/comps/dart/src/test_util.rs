// SPDX-License-Identifier: MPL-2.0

//! A memory-backed register window for unit tests.

use alloc::{collections::BTreeMap, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use spin::Mutex;

use crate::{
    DartVersion,
    registers::{REGISTER_WINDOW_SIZE, RegisterIo, v0, v1},
};

/// Registers that read back what was written, with a log of all writes.
///
/// The TLB operation register can be made to report busy forever, and
/// single registers can be pinned to a fixed read value.
pub(crate) struct MockRegisters {
    words: Vec<AtomicU32>,
    writes: Mutex<Vec<(usize, u32)>>,
    pinned: Mutex<BTreeMap<usize, u32>>,
    tlb_op: usize,
    busy_bits: u32,
    busy: AtomicBool,
    busy_polls: AtomicUsize,
}

impl MockRegisters {
    pub(crate) fn new(version: DartVersion) -> Self {
        let (tlb_op, busy_bits) = match version {
            DartVersion::V0 => (v0::TLB_OP, v0::TLB_OP_BUSY),
            DartVersion::V1 => (v1::TLB_OP, v1::TLB_OP_BUSY | v1::TLB_OP_FLUSH),
        };
        Self {
            words: (0..REGISTER_WINDOW_SIZE / 4).map(|_| AtomicU32::new(0)).collect(),
            writes: Mutex::new(Vec::new()),
            pinned: Mutex::new(BTreeMap::new()),
            tlb_op,
            busy_bits,
            busy: AtomicBool::new(false),
            busy_polls: AtomicUsize::new(0),
        }
    }

    /// Reads a register without going through the device path.
    pub(crate) fn peek(&self, offset: usize) -> u32 {
        self.words[offset / 4].load(Ordering::Relaxed)
    }

    /// Sets a register without logging a write.
    pub(crate) fn poke(&self, offset: usize, value: u32) {
        self.words[offset / 4].store(value, Ordering::Relaxed);
    }

    /// Makes reads of `offset` return `value`, whatever is written.
    pub(crate) fn pin(&self, offset: usize, value: u32) {
        self.pinned.lock().insert(offset, value);
    }

    pub(crate) fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::Relaxed);
    }

    pub(crate) fn busy_polls(&self) -> usize {
        self.busy_polls.load(Ordering::Relaxed)
    }

    pub(crate) fn nr_writes(&self) -> usize {
        self.writes.lock().len()
    }

    /// Returns the values written to `offset`, oldest first.
    pub(crate) fn writes_to(&self, offset: usize) -> Vec<u32> {
        self.writes
            .lock()
            .iter()
            .filter(|(written, _)| *written == offset)
            .map(|(_, value)| *value)
            .collect()
    }
}

impl RegisterIo for MockRegisters {
    fn read_u32(&self, offset: usize) -> u32 {
        if let Some(value) = self.pinned.lock().get(&offset) {
            return *value;
        }
        let value = self.peek(offset);
        if offset == self.tlb_op && self.busy.load(Ordering::Relaxed) {
            self.busy_polls.fetch_add(1, Ordering::Relaxed);
            return value | self.busy_bits;
        }
        value
    }

    fn write_u32(&self, offset: usize, value: u32) {
        self.writes.lock().push((offset, value));
        self.poke(offset, value);
    }
}
