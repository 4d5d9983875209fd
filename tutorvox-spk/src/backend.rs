//! Compute backend probing and weight precision selection

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::{debug, info};

/// Hardware path the model runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeBackend {
    /// GPU-accelerated execution
    Accelerated,
    /// Portable CPU execution
    Portable,
}

impl fmt::Display for ComputeBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputeBackend::Accelerated => f.write_str("accelerated"),
            ComputeBackend::Portable => f.write_str("portable"),
        }
    }
}

/// Numeric representation of the model weights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Fp32,
    Fp16,
    Q8,
    Q4,
}

impl Precision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Precision::Fp32 => "fp32",
            Precision::Fp16 => "fp16",
            Precision::Q8 => "q8",
            Precision::Q4 => "q4",
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which precision to load on each backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrecisionPolicy {
    pub accelerated: Precision,
    pub portable: Precision,
}

impl Default for PrecisionPolicy {
    fn default() -> Self {
        Self {
            accelerated: Precision::Fp32,
            portable: Precision::Q8,
        }
    }
}

impl PrecisionPolicy {
    pub fn precision_for(&self, backend: ComputeBackend) -> Precision {
        match backend {
            ComputeBackend::Accelerated => self.accelerated,
            ComputeBackend::Portable => self.portable,
        }
    }
}

/// Backend and precision chosen for one load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExecutionProfile {
    pub backend: ComputeBackend,
    pub precision: Precision,
}

impl ExecutionProfile {
    pub fn resolve(backend: ComputeBackend, policy: &PrecisionPolicy) -> Self {
        Self {
            backend,
            precision: policy.precision_for(backend),
        }
    }
}

/// Detects which compute backend the host offers
#[async_trait]
pub trait BackendProbe: Send + Sync {
    async fn probe(&self) -> ComputeBackend;
}

/// Named check for one accelerated runtime on the host
pub type Detector = (&'static str, fn() -> bool);

/// Probes the host for an accelerated compute path.
///
/// An explicit override wins. Otherwise each detector is asked in turn and
/// the portable path is used when none of them finds a device.
pub struct HostBackendProbe {
    backend_override: Option<ComputeBackend>,
    detectors: Vec<Detector>,
}

impl HostBackendProbe {
    pub fn new(backend_override: Option<ComputeBackend>) -> Self {
        Self::with_detectors(backend_override, default_detectors())
    }

    pub fn with_detectors(backend_override: Option<ComputeBackend>, detectors: Vec<Detector>) -> Self {
        Self {
            backend_override,
            detectors,
        }
    }

    fn detect(&self) -> ComputeBackend {
        match self.detectors.iter().find(|(_, available)| available()) {
            Some((name, _)) => {
                info!(runtime = *name, "Accelerated compute detected");
                ComputeBackend::Accelerated
            }
            None => ComputeBackend::Portable,
        }
    }
}

fn default_detectors() -> Vec<Detector> {
    let mut detectors: Vec<Detector> = Vec::new();
    #[cfg(all(feature = "metal", target_os = "macos"))]
    detectors.push(("metal", metal_available));
    detectors.push(("cuda", cuda_available));
    detectors
}

#[cfg(all(feature = "metal", target_os = "macos"))]
fn metal_available() -> bool {
    metal::Device::system_default().is_some()
}

/// NVIDIA driver loaded with at least one device node
fn cuda_available() -> bool {
    Path::new("/proc/driver/nvidia/version").exists() && Path::new("/dev/nvidia0").exists()
}

#[async_trait]
impl BackendProbe for HostBackendProbe {
    async fn probe(&self) -> ComputeBackend {
        let backend = match self.backend_override {
            Some(backend) => {
                debug!(%backend, "Compute backend forced by configuration");
                backend
            }
            None => self.detect(),
        };
        debug!(%backend, "Compute backend probed");
        backend
    }
}
