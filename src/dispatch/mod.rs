//! Host feature detection.
//!
//! Provides the process-wide `DeviceProfile` and the `may_use` query the
//! reducers and injectors consult when picking a code generation target.

pub mod device_profile;

pub use device_profile::{DeviceProfile, IsaLevel, ISA_ENV};

use std::sync::OnceLock;

static PROFILE: OnceLock<DeviceProfile> = OnceLock::new();

/// Get the global device profile (detected once, cached for process lifetime).
pub fn device_profile() -> &'static DeviceProfile {
    PROFILE.get_or_init(DeviceProfile::detect)
}

/// Whether generated code for `isa` may run on this host.
#[inline]
pub fn may_use(isa: IsaLevel) -> bool {
    device_profile().may_use(isa)
}

/// Best native level available (or `Portable`).
#[inline]
pub fn best_isa() -> IsaLevel {
    device_profile().isa
}
