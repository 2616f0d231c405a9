// SPDX-License-Identifier: MPL-2.0

//! Address spaces and the devices attached to them.

use alloc::{sync::Arc, vec::Vec};
use core::{fmt, ops::RangeInclusive};

use log::info;
use spin::{Mutex, Once};

use crate::{Daddr, Dart, DartError, Paddr, Result, config::Sid};

/// An identifier the caller assigns to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub u64);

/// The DART instance and SID a device issues its DMA through.
///
/// A binding is resolved once from the firmware description of the device
/// and never changes afterwards.
#[derive(Clone)]
pub struct DeviceBinding {
    dart: Arc<Dart>,
    sid: Sid,
}

impl DeviceBinding {
    /// Binds a device to `sid` of `dart`.
    ///
    /// Fails with [`DartError::InvalidSid`] if the SID is beyond what the
    /// hardware generation supports or is not enabled in the instance's SID
    /// mask.
    pub fn new(dart: &Arc<Dart>, sid: u32) -> Result<Self> {
        let sid = Sid::new(sid)
            .filter(|sid| sid.index() < dart.version().nr_sids())
            .filter(|sid| dart.settings().has_sid(*sid))
            .ok_or(DartError::InvalidSid)?;
        Ok(Self {
            dart: dart.clone(),
            sid,
        })
    }

    pub fn dart(&self) -> &Arc<Dart> {
        &self.dart
    }

    pub fn sid(&self) -> Sid {
        self.sid
    }
}

impl fmt::Debug for DeviceBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBinding")
            .field("dart", &self.dart.settings().name())
            .field("sid", &self.sid)
            .finish()
    }
}

/// A DMA-capable device.
#[derive(Debug, Clone)]
pub struct Device {
    id: DeviceId,
    binding: Option<DeviceBinding>,
}

impl Device {
    /// Creates a device. `binding` is `None` if no DART was found for it.
    pub fn new(id: DeviceId, binding: Option<DeviceBinding>) -> Self {
        Self { id, binding }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn binding(&self) -> Option<&DeviceBinding> {
        self.binding.as_ref()
    }
}

/// The addressable range of a bound domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainGeometry {
    aperture: RangeInclusive<Daddr>,
    force_aperture: bool,
}

impl DomainGeometry {
    /// Returns the device addresses that the domain can map.
    pub fn aperture(&self) -> &RangeInclusive<Daddr> {
        &self.aperture
    }

    /// Returns whether accesses outside the aperture are blocked.
    pub fn force_aperture(&self) -> bool {
        self.force_aperture
    }
}

struct DomainBinding {
    dart: Arc<Dart>,
    sid: Sid,
    geometry: DomainGeometry,
}

/// A device address space.
///
/// A domain starts unbound. The first device attached binds it to the
/// device's DART instance and SID for the rest of its life; later devices
/// must share both. While unbound, mapping and flushing do nothing.
pub struct Domain {
    binding: Once<DomainBinding>,
    devices: Mutex<Vec<DeviceId>>,
}

impl Domain {
    pub const fn new() -> Self {
        Self {
            binding: Once::new(),
            devices: Mutex::new(Vec::new()),
        }
    }

    /// Attaches a device, binding the domain on first use.
    ///
    /// The DART instance is initialized the first time any of its domains
    /// gets a device, and translation is turned on for the device's SID.
    ///
    /// # Errors
    ///
    /// - [`DartError::NoDevice`] if the device has no binding.
    /// - [`DartError::IncompatibleHardware`] if the domain is bound to
    ///   another instance.
    /// - [`DartError::ConflictingAddressSpace`] if the domain is bound to
    ///   another SID. On a PCIe instance every device counts as SID 0.
    /// - [`DartError::HardwareTimeout`] if initializing the instance fails.
    pub fn attach(&self, device: &Device) -> Result<()> {
        let Some(requested) = device.binding() else {
            return Err(DartError::NoDevice);
        };

        // Functions behind a PCIe root complex all share the tables of SID 0.
        let sid = requested.dart.table_sid(requested.sid);
        let bound = self.binding.call_once(|| DomainBinding {
            dart: requested.dart.clone(),
            sid,
            geometry: DomainGeometry {
                aperture: requested.dart.aperture(),
                force_aperture: true,
            },
        });
        if !Arc::ptr_eq(&bound.dart, &requested.dart) {
            return Err(DartError::IncompatibleHardware);
        }
        if bound.sid != sid {
            return Err(DartError::ConflictingAddressSpace);
        }

        bound.dart.prepare_sid(bound.sid)?;

        let mut devices = self.devices.lock();
        if !devices.contains(&device.id()) {
            devices
                .try_reserve(1)
                .map_err(|_| DartError::OutOfMemory)?;
            devices.push(device.id());
        }
        info!(
            "{}: attached device {:?} with SID {} as SID {}",
            bound.dart.settings().name(),
            device.id(),
            requested.sid,
            bound.sid
        );
        Ok(())
    }

    /// Detaches a device.
    ///
    /// The domain stays bound and keeps its mappings. Detaching a device that
    /// is not attached does nothing.
    pub fn detach(&self, device: &Device) {
        self.devices.lock().retain(|id| *id != device.id());
    }

    /// Maps `len` bytes of device addresses at `daddr` to the physical memory
    /// at `paddr`.
    ///
    /// Every page that intersects the range is mapped. Device addresses below
    /// the instance's IOVA offset are silently skipped.
    ///
    /// # Errors
    ///
    /// Fails with [`DartError::OutOfMemory`] if a table cannot be allocated.
    /// The pages mapped before the failure stay mapped.
    pub fn map(&self, daddr: Daddr, paddr: Paddr, len: usize) -> Result<()> {
        match self.binding.get() {
            Some(bound) => bound.dart.map(bound.sid, daddr, paddr, len),
            None => Ok(()),
        }
    }

    /// Unmaps `len` bytes of device addresses at `daddr`.
    ///
    /// Returns `len`, or 0 if the domain is unbound or `daddr` is below the
    /// instance's IOVA offset. Unmapping pages that are not mapped is fine.
    pub fn unmap(&self, daddr: Daddr, len: usize) -> usize {
        match self.binding.get() {
            Some(bound) => bound.dart.unmap(bound.sid, daddr, len),
            None => 0,
        }
    }

    /// Translates a device address, returning 0 if it is not mapped.
    pub fn iova_to_phys(&self, daddr: Daddr) -> Paddr {
        match self.binding.get() {
            Some(bound) => bound.dart.iova_to_phys(bound.sid, daddr),
            None => 0,
        }
    }

    /// Invalidates all cached translations of the domain.
    pub fn flush_iotlb_all(&self) -> Result<()> {
        self.flush()
    }

    /// Makes earlier unmappings visible to the hardware.
    pub fn iotlb_sync(&self) -> Result<()> {
        self.flush()
    }

    /// Makes a fresh mapping visible to the hardware.
    ///
    /// The whole SID is flushed whatever the range is.
    pub fn iotlb_sync_map(&self, _daddr: Daddr, _len: usize) -> Result<()> {
        self.flush()
    }

    fn flush(&self) -> Result<()> {
        match self.binding.get() {
            Some(bound) => bound.dart.flush_sid(bound.sid),
            None => Ok(()),
        }
    }

    /// Returns the addressable range, or `None` while the domain is unbound.
    pub fn geometry(&self) -> Option<&DomainGeometry> {
        self.binding.get().map(|bound| &bound.geometry)
    }

    pub fn dart(&self) -> Option<&Arc<Dart>> {
        self.binding.get().map(|bound| &bound.dart)
    }

    pub fn sid(&self) -> Option<Sid> {
        self.binding.get().map(|bound| bound.sid)
    }

    /// Returns the attached devices, in attach order.
    pub fn devices(&self) -> Vec<DeviceId> {
        self.devices.lock().clone()
    }
}

impl Default for Domain {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Domain")
            .field("sid", &self.sid())
            .field("devices", &*self.devices.lock())
            .finish_non_exhaustive()
    }
}
