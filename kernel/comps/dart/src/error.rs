// SPDX-License-Identifier: MPL-2.0

use core::fmt;

/// An enumeration representing possible errors of DART operations.
///
/// Faults reported by the hardware itself are not errors of this kind; they
/// are decoded into [`FaultRecord`]s instead.
///
/// [`FaultRecord`]: crate::FaultRecord
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DartError {
    /// A shadow table, a hardware table or bookkeeping memory could not be
    /// allocated.
    OutOfMemory,
    /// The domain is already bound to a different DART instance.
    IncompatibleHardware,
    /// The domain is already bound to a different SID.
    ConflictingAddressSpace,
    /// The device has no resolved DART binding.
    NoDevice,
    /// A sub-unit did not finish a TLB flush within the poll limit.
    HardwareTimeout,
    /// The SID is out of range or not enabled in the instance's SID mask.
    InvalidSid,
    /// The instance configuration is invalid.
    InvalidConfig,
    /// A mandatory register window was not supplied.
    MissingSubUnit,
}

impl fmt::Display for DartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::OutOfMemory => "out of memory",
            Self::IncompatibleHardware => "domain is bound to a different DART",
            Self::ConflictingAddressSpace => "domain is bound to a different SID",
            Self::NoDevice => "device has no DART binding",
            Self::HardwareTimeout => "TLB flush timed out",
            Self::InvalidSid => "invalid stream ID",
            Self::InvalidConfig => "invalid DART configuration",
            Self::MissingSubUnit => "missing DART register window",
        };
        f.write_str(msg)
    }
}

impl core::error::Error for DartError {}

/// The result type of DART operations.
pub type Result<T> = core::result::Result<T, DartError>;
