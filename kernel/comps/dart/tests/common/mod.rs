// SPDX-License-Identifier: MPL-2.0

#![expect(dead_code)]

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicU32, Ordering},
};

use dart_iommu::{
    Dart, DartConfig, DartVersion, Device, DeviceBinding, DeviceId, LinearDmaAllocator,
    REGISTER_WINDOW_SIZE, RegisterIo,
};

pub const V0_TLB_OP: usize = 0x0;
pub const V0_CONFIG: usize = 0xC;
pub const V1_TLB_OP: usize = 0x20;
pub const V1_TLB_OP_SIDMASK: usize = 0x34;
pub const V1_ERROR_STATUS: usize = 0x40;
pub const V1_ERROR_ADDRESS_LO: usize = 0x50;
pub const V1_ERROR_ADDRESS_HI: usize = 0x54;

pub fn v0_ttbr(sid: usize, slot: usize) -> usize {
    0x40 + 16 * sid + 4 * slot
}

pub fn v1_ttbr(sid: usize, slot: usize) -> usize {
    0x200 + 16 * sid + 4 * slot
}

pub fn v1_config(sid: usize) -> usize {
    0x100 + 4 * sid
}

/// A register window backed by plain memory.
///
/// The flush and enable protocols of both generations complete on plain
/// memory, so the window behaves like idle hardware unless it is told to
/// stay busy.
pub struct SimRegisters {
    words: Vec<AtomicU32>,
    writes: Mutex<Vec<(usize, u32)>>,
    busy: AtomicBool,
}

impl SimRegisters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            words: (0..REGISTER_WINDOW_SIZE / 4)
                .map(|_| AtomicU32::new(0))
                .collect(),
            writes: Mutex::new(Vec::new()),
            busy: AtomicBool::new(false),
        })
    }

    pub fn peek(&self, offset: usize) -> u32 {
        self.words[offset / 4].load(Ordering::SeqCst)
    }

    pub fn poke(&self, offset: usize, value: u32) {
        self.words[offset / 4].store(value, Ordering::SeqCst);
    }

    /// Makes the TLB operation register of either generation report busy.
    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
    }

    pub fn writes_to(&self, offset: usize) -> Vec<u32> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(written, _)| *written == offset)
            .map(|(_, value)| *value)
            .collect()
    }

    pub fn clear_log(&self) {
        self.writes.lock().unwrap().clear();
    }
}

impl RegisterIo for SimRegisters {
    fn read_u32(&self, offset: usize) -> u32 {
        let value = self.peek(offset);
        if self.busy.load(Ordering::SeqCst) && (offset == V0_TLB_OP || offset == V1_TLB_OP) {
            // Busy on V0, busy with a pending flush on V1.
            return value | 1 << 3 | 1 << 2 | 1 << 20;
        }
        value
    }

    fn write_u32(&self, offset: usize, value: u32) {
        self.writes.lock().unwrap().push((offset, value));
        self.poke(offset, value);
    }
}

pub struct TestDart {
    pub dart: Arc<Dart>,
    pub regs: Vec<Arc<SimRegisters>>,
    pub allocator: Arc<LinearDmaAllocator>,
}

impl TestDart {
    pub fn device(&self, id: u64, sid: u32) -> Device {
        Device::new(
            DeviceId(id),
            Some(DeviceBinding::new(&self.dart, sid).unwrap()),
        )
    }
}

pub fn new_dart(
    version: DartVersion,
    nr_sub_units: usize,
    config: &DartConfig,
    allocator: LinearDmaAllocator,
) -> TestDart {
    let regs: Vec<_> = (0..nr_sub_units).map(|_| SimRegisters::new()).collect();
    let allocator = Arc::new(allocator);
    let dart = Dart::new(
        version,
        regs.iter()
            .map(|regs| Box::new(regs.clone()) as Box<dyn RegisterIo>)
            .collect(),
        config,
        allocator.clone(),
    )
    .unwrap();
    TestDart {
        dart,
        regs,
        allocator,
    }
}

pub fn default_dart(version: DartVersion) -> TestDart {
    new_dart(version, 1, &DartConfig::new(), LinearDmaAllocator::new(0))
}
