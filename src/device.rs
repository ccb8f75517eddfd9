use std::{fmt, path::Path};

use serde::Serialize;

/// Compute device the backend is placed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Discrete GPU (CUDA).
    Cuda,
    /// Secondary accelerator (Apple MPS).
    Mps,
    Cpu,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceKind::Cuda => "cuda",
            DeviceKind::Mps => "mps",
            DeviceKind::Cpu => "cpu",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    /// Whatever the backend ships with, usually half precision.
    BackendDefault,
    /// Force f32.
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceProfile {
    pub kind: DeviceKind,
    pub precision: Precision,
}

/// What the host offers. Split out so the selection policy can be tested
/// without real hardware.
pub trait HostProbe {
    fn cuda_available(&self) -> bool;
    fn mps_available(&self) -> bool;
    fn sandboxed(&self) -> bool;
}

pub struct SystemProbe;

impl HostProbe for SystemProbe {
    #[cfg(feature = "tch-backend")]
    fn cuda_available(&self) -> bool {
        tch::Cuda::is_available()
    }

    #[cfg(not(feature = "tch-backend"))]
    fn cuda_available(&self) -> bool {
        false
    }

    #[cfg(feature = "tch-backend")]
    fn mps_available(&self) -> bool {
        tch::utils::has_mps()
    }

    #[cfg(not(feature = "tch-backend"))]
    fn mps_available(&self) -> bool {
        false
    }

    fn sandboxed(&self) -> bool {
        // MPS is not reachable from inside a container.
        Path::new("/.dockerenv").exists()
    }
}

pub fn select_device() -> DeviceProfile {
    select_device_with(&SystemProbe)
}

pub fn select_device_with(probe: &impl HostProbe) -> DeviceProfile {
    if probe.cuda_available() {
        DeviceProfile {
            kind: DeviceKind::Cuda,
            precision: Precision::BackendDefault,
        }
    } else if probe.mps_available() && !probe.sandboxed() {
        DeviceProfile {
            kind: DeviceKind::Mps,
            precision: Precision::BackendDefault,
        }
    } else {
        DeviceProfile {
            kind: DeviceKind::Cpu,
            precision: Precision::Full,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeHost {
        cuda: bool,
        mps: bool,
        sandboxed: bool,
    }

    impl HostProbe for FakeHost {
        fn cuda_available(&self) -> bool {
            self.cuda
        }
        fn mps_available(&self) -> bool {
            self.mps
        }
        fn sandboxed(&self) -> bool {
            self.sandboxed
        }
    }

    #[test]
    fn cuda_wins_over_everything() {
        let profile = select_device_with(&FakeHost {
            cuda: true,
            mps: true,
            sandboxed: true,
        });
        assert_eq!(profile.kind, DeviceKind::Cuda);
        assert_eq!(profile.precision, Precision::BackendDefault);
    }

    #[test]
    fn mps_used_outside_containers() {
        let profile = select_device_with(&FakeHost {
            cuda: false,
            mps: true,
            sandboxed: false,
        });
        assert_eq!(profile.kind, DeviceKind::Mps);
        assert_eq!(profile.precision, Precision::BackendDefault);
    }

    #[test]
    fn mps_skipped_inside_containers() {
        let profile = select_device_with(&FakeHost {
            cuda: false,
            mps: true,
            sandboxed: true,
        });
        assert_eq!(profile.kind, DeviceKind::Cpu);
    }

    #[test]
    fn cpu_always_forces_full_precision() {
        let profile = select_device_with(&FakeHost {
            cuda: false,
            mps: false,
            sandboxed: false,
        });
        assert_eq!(
            profile,
            DeviceProfile {
                kind: DeviceKind::Cpu,
                precision: Precision::Full,
            }
        );
    }
}
