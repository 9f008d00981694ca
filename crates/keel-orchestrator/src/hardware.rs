//! Hardware detection for accelerator selection
//!
//! Detects available accelerators in priority order:
//! CUDA (NVIDIA) → ROCm (AMD) → CoreML (Apple) → DirectML (Windows) → Vulkan → CPU
//!
//! Detection uses filesystem probes and process checks rather than
//! linking to GPU libraries at compile time, so the orchestrator stays
//! usable on machines without any native runtime installed.

use serde::{Deserialize, Serialize};
use std::path::Path;
use sysinfo::{MemoryRefreshKind, RefreshKind, System};

use crate::types::AcceleratorFlags;

/// Hardware path used to run a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Accelerator {
    /// NVIDIA CUDA
    Cuda,
    /// AMD ROCm
    Rocm,
    /// Apple CoreML / Metal
    CoreMl,
    /// DirectML on Windows, any DX12 GPU
    DirectMl,
    /// Vulkan compute, cross-vendor
    Vulkan,
    /// Always available, lowest throughput
    Cpu,
}

impl Accelerator {
    /// Vendor-specific GPU paths, tried before generic ones.
    pub fn is_vendor_gpu(self) -> bool {
        matches!(self, Accelerator::Cuda | Accelerator::Rocm | Accelerator::CoreMl)
    }

    pub fn is_gpu(self) -> bool {
        !matches!(self, Accelerator::Cpu)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Accelerator::Cuda => "cuda",
            Accelerator::Rocm => "rocm",
            Accelerator::CoreMl => "coreml",
            Accelerator::DirectMl => "directml",
            Accelerator::Vulkan => "vulkan",
            Accelerator::Cpu => "cpu",
        }
    }
}

impl std::fmt::Display for Accelerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Accelerator::Cuda => write!(f, "CUDA"),
            Accelerator::Rocm => write!(f, "ROCm"),
            Accelerator::CoreMl => write!(f, "CoreML"),
            Accelerator::DirectMl => write!(f, "DirectML"),
            Accelerator::Vulkan => write!(f, "Vulkan"),
            Accelerator::Cpu => write!(f, "CPU"),
        }
    }
}

impl std::str::FromStr for Accelerator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cuda" => Ok(Accelerator::Cuda),
            "rocm" => Ok(Accelerator::Rocm),
            "coreml" | "metal" => Ok(Accelerator::CoreMl),
            "directml" | "dml" => Ok(Accelerator::DirectMl),
            "vulkan" => Ok(Accelerator::Vulkan),
            "cpu" => Ok(Accelerator::Cpu),
            other => Err(format!("unknown accelerator '{other}'")),
        }
    }
}

/// Information about the detected hardware environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareInfo {
    /// All accelerators detected, best first, `Cpu` always last
    pub accelerators: Vec<Accelerator>,
    /// Estimated VRAM in bytes (0 when unknown or CPU-only)
    pub vram_bytes: u64,
    /// Total system RAM in bytes
    pub total_ram_bytes: u64,
    /// Available system RAM in bytes at detection time
    pub available_ram_bytes: u64,
    /// Number of logical CPU cores
    pub cpu_cores: usize,
}

impl HardwareInfo {
    /// Detect available hardware.
    ///
    /// Runs synchronously; call from a blocking context or `spawn_blocking`.
    pub fn detect() -> Self {
        let mut accelerators = Vec::new();

        let cuda_vram = detect_cuda();
        if cuda_vram.is_some() {
            accelerators.push(Accelerator::Cuda);
        }

        let rocm_vram = detect_rocm();
        if rocm_vram.is_some() {
            accelerators.push(Accelerator::Rocm);
        }

        if detect_coreml() {
            accelerators.push(Accelerator::CoreMl);
        }

        if detect_directml() {
            accelerators.push(Accelerator::DirectMl);
        }

        if detect_vulkan() {
            accelerators.push(Accelerator::Vulkan);
        }

        accelerators.push(Accelerator::Cpu);

        let (total_ram_bytes, available_ram_bytes) = system_memory();

        Self {
            accelerators,
            vram_bytes: cuda_vram.or(rocm_vram).unwrap_or(0),
            total_ram_bytes,
            available_ram_bytes,
            cpu_cores: num_cpus(),
        }
    }

    /// A CPU-only description of this machine, skipping GPU probes.
    pub fn cpu_only() -> Self {
        let (total_ram_bytes, available_ram_bytes) = system_memory();
        Self {
            accelerators: vec![Accelerator::Cpu],
            vram_bytes: 0,
            total_ram_bytes,
            available_ram_bytes,
            cpu_cores: num_cpus(),
        }
    }

    /// Replace the detected accelerator list. `Cpu` is appended if missing.
    pub fn with_accelerators(mut self, accelerators: impl IntoIterator<Item = Accelerator>) -> Self {
        let mut list: Vec<Accelerator> = Vec::new();
        for acc in accelerators {
            if acc != Accelerator::Cpu && !list.contains(&acc) {
                list.push(acc);
            }
        }
        list.push(Accelerator::Cpu);
        self.accelerators = list;
        self
    }

    pub fn with_cpu_cores(mut self, cores: usize) -> Self {
        self.cpu_cores = cores.max(1);
        self
    }

    /// Best available accelerator.
    pub fn primary(&self) -> Accelerator {
        self.accelerators.first().copied().unwrap_or(Accelerator::Cpu)
    }

    /// True when any non-CPU accelerator is present.
    pub fn has_accelerator(&self) -> bool {
        self.accelerators.iter().any(|a| a.is_gpu())
    }

    pub fn supports(&self, accelerator: Accelerator) -> bool {
        self.accelerators.contains(&accelerator)
    }

    /// Accelerators to try for a graph session: the explicit preference
    /// first, then vendor GPUs, then generic GPUs, CPU always last.
    pub fn graph_preference(&self, preferred: Option<Accelerator>) -> Vec<Accelerator> {
        let mut order = Vec::new();
        if let Some(p) = preferred {
            order.push(p);
        }
        let vendor = self.accelerators.iter().copied().filter(|a| a.is_vendor_gpu());
        let generic = self
            .accelerators
            .iter()
            .copied()
            .filter(|a| a.is_gpu() && !a.is_vendor_gpu());
        for acc in vendor.chain(generic) {
            if !order.contains(&acc) {
                order.push(acc);
            }
        }
        order.retain(|a| *a != Accelerator::Cpu);
        order.push(Accelerator::Cpu);
        order
    }

    /// Default number of concurrently admitted inferences.
    pub fn compute_units(&self) -> usize {
        (self.cpu_cores / 2).max(1)
    }

    pub fn flags(&self) -> AcceleratorFlags {
        AcceleratorFlags {
            cuda: self.supports(Accelerator::Cuda),
            rocm: self.supports(Accelerator::Rocm),
            coreml: self.supports(Accelerator::CoreMl),
            directml: self.supports(Accelerator::DirectMl),
            vulkan: self.supports(Accelerator::Vulkan),
        }
    }

    /// Human readable name of the primary device.
    pub fn device_name(&self) -> String {
        match self.primary() {
            Accelerator::Cpu => format!("CPU ({} cores)", self.cpu_cores),
            other => format!("{other} GPU"),
        }
    }
}

/// Current `(total, available)` system RAM in bytes.
pub fn system_memory() -> (u64, u64) {
    let mut sys =
        System::new_with_specifics(RefreshKind::new().with_memory(MemoryRefreshKind::everything()));
    sys.refresh_memory();
    (sys.total_memory(), sys.available_memory())
}

// ============================================================================
// Accelerator detection helpers
// ============================================================================

/// Returns estimated VRAM in bytes if CUDA is available, None otherwise.
///
/// Requires the `/dev/nvidia0` device node; VRAM comes from `nvidia-smi`.
fn detect_cuda() -> Option<u64> {
    if !Path::new("/dev/nvidia0").exists() {
        return None;
    }

    let output = match std::process::Command::new("nvidia-smi")
        .args(["--query-gpu=memory.total", "--format=csv,noheader,nounits"])
        .output()
    {
        Ok(output) if output.status.success() => output,
        // Device node exists but nvidia-smi is missing or failed
        _ => return Some(0),
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    // nvidia-smi returns MiB
    let mib = stdout
        .lines()
        .next()
        .and_then(|line| line.trim().parse::<u64>().ok())
        .unwrap_or(0);
    Some(mib * 1024 * 1024)
}

/// Returns estimated VRAM in bytes if ROCm is available, None otherwise.
///
/// Requires `/dev/kfd`; VRAM comes from `rocm-smi --showmeminfo vram --csv`.
fn detect_rocm() -> Option<u64> {
    if !Path::new("/dev/kfd").exists() {
        return None;
    }

    let output = match std::process::Command::new("rocm-smi")
        .args(["--showmeminfo", "vram", "--csv"])
        .output()
    {
        Ok(output) if output.status.success() => output,
        _ => return Some(0),
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    // rocm-smi CSV: GPU,VRAM Total Memory (B),VRAM Used Memory (B)
    for line in stdout.lines().skip(1) {
        let parts: Vec<&str> = line.split(',').collect();
        if parts.len() >= 2 {
            if let Ok(bytes) = parts[1].trim().parse::<u64>() {
                return Some(bytes);
            }
        }
    }

    Some(0)
}

fn detect_coreml() -> bool {
    cfg!(all(target_os = "macos", target_arch = "aarch64"))
}

fn detect_directml() -> bool {
    cfg!(target_os = "windows")
}

/// Returns true if any Vulkan-capable GPU is available.
///
/// Checks the DRM render node first, then `vulkaninfo --summary`.
fn detect_vulkan() -> bool {
    if Path::new("/dev/dri/renderD128").exists() {
        return true;
    }

    std::process::Command::new("vulkaninfo")
        .arg("--summary")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
