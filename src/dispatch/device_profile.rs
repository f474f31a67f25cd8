//! Host CPU profile used to pick a code generation target.
//!
//! Detection runs once; `JITKERN_ISA` may cap the level (never raise it).

/// ISA level for dispatch decisions.
///
/// Ordered: a level implies every level below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IsaLevel {
    /// No native code path; kernels run on the portable interpreter.
    Portable,
    Avx2,
    Avx512,
}

impl IsaLevel {
    /// Vector length in bytes for native code at this level.
    #[inline]
    pub fn vlen(self) -> usize {
        match self {
            IsaLevel::Portable => 64,
            IsaLevel::Avx2 => 32,
            IsaLevel::Avx512 => 64,
        }
    }

    /// Parse an override value such as `avx2`.
    pub fn parse(s: &str) -> Option<IsaLevel> {
        match s.trim().to_ascii_lowercase().as_str() {
            "portable" | "scalar" | "none" => Some(IsaLevel::Portable),
            "avx2" => Some(IsaLevel::Avx2),
            "avx512" | "avx512f" | "avx512_core" => Some(IsaLevel::Avx512),
            _ => None,
        }
    }
}

impl std::fmt::Display for IsaLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IsaLevel::Portable => "portable",
            IsaLevel::Avx2 => "avx2",
            IsaLevel::Avx512 => "avx512",
        };
        f.write_str(s)
    }
}

/// Name of the environment variable capping the ISA level.
pub const ISA_ENV: &str = "JITKERN_ISA";

/// Host profile: usable ISA level plus thread counts for the reducers.
#[derive(Debug, Clone)]
pub struct DeviceProfile {
    /// Level reported by the hardware.
    pub detected_isa: IsaLevel,
    /// Level after applying the environment cap.
    pub isa: IsaLevel,
    /// Logical cores visible to this process.
    pub logical_cores: usize,
}

impl DeviceProfile {
    /// Detect the current hardware and apply `JITKERN_ISA`.
    pub fn detect() -> Self {
        let detected_isa = detect_isa_level();
        let cap = std::env::var(ISA_ENV).ok();
        let isa = apply_isa_cap(detected_isa, cap.as_deref());
        let logical_cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        log::debug!("device profile: detected {detected_isa}, using {isa}, {logical_cores} cores");
        DeviceProfile {
            detected_isa,
            isa,
            logical_cores,
        }
    }

    /// Whether code for `isa` may run on this host.
    #[inline]
    pub fn may_use(&self, isa: IsaLevel) -> bool {
        isa <= self.isa
    }
}

/// Clamp `detected` by an optional override string.
pub(crate) fn apply_isa_cap(detected: IsaLevel, cap: Option<&str>) -> IsaLevel {
    match cap {
        None => detected,
        Some(raw) => match IsaLevel::parse(raw) {
            Some(level) if level <= detected => level,
            Some(level) => {
                log::warn!("{ISA_ENV}={raw}: {level} not available on this host, using {detected}");
                detected
            }
            None => {
                log::warn!("{ISA_ENV}={raw}: unknown ISA level, ignored");
                detected
            }
        },
    }
}

fn detect_isa_level() -> IsaLevel {
    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx512f") {
            return IsaLevel::Avx512;
        }
        if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
            return IsaLevel::Avx2;
        }
    }
    IsaLevel::Portable
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_profile() {
        let profile = DeviceProfile::detect();
        assert!(profile.logical_cores >= 1);
        assert!(profile.isa <= profile.detected_isa);
        assert!(profile.may_use(IsaLevel::Portable));
    }

    #[test]
    fn test_isa_cap() {
        assert_eq!(apply_isa_cap(IsaLevel::Avx512, Some("avx2")), IsaLevel::Avx2);
        assert_eq!(apply_isa_cap(IsaLevel::Avx2, Some("avx512")), IsaLevel::Avx2);
        assert_eq!(apply_isa_cap(IsaLevel::Avx2, Some("bogus")), IsaLevel::Avx2);
        assert_eq!(apply_isa_cap(IsaLevel::Avx2, Some("portable")), IsaLevel::Portable);
        assert_eq!(apply_isa_cap(IsaLevel::Avx2, None), IsaLevel::Avx2);
    }

    #[test]
    fn test_isa_ordering() {
        assert!(IsaLevel::Portable < IsaLevel::Avx2);
        assert!(IsaLevel::Avx2 < IsaLevel::Avx512);
        assert_eq!(IsaLevel::Avx2.vlen(), 32);
    }
}
