//! `keel hardware` command implementation

use crate::output::{OutputFormat, emit};
use colored::Colorize;
use keel_orchestrator::HardwareInfo;
use keel_orchestrator::storage::format_bytes;
use serde::Serialize;

#[derive(Debug, Serialize)]
struct HardwareReport {
    device: String,
    accelerators: Vec<String>,
    vram: String,
    total_ram: String,
    available_ram: String,
    cpu_cores: usize,
    compute_units: usize,
}

/// Execute the `keel hardware` command
pub fn run(output: OutputFormat) -> anyhow::Result<()> {
    let hw = HardwareInfo::detect();
    let report = HardwareReport {
        device: hw.device_name(),
        accelerators: hw.accelerators.iter().map(|a| a.to_string()).collect(),
        vram: format_bytes(hw.vram_bytes),
        total_ram: format_bytes(hw.total_ram_bytes),
        available_ram: format_bytes(hw.available_ram_bytes),
        cpu_cores: hw.cpu_cores,
        compute_units: hw.compute_units(),
    };

    emit(&report, output, |r| {
        println!();
        println!("  {}", "Hardware".bold());
        println!("    Device:        {}", r.device.cyan());
        println!("    Accelerators:  {}", r.accelerators.join(", ").yellow());
        println!("    VRAM:          {}", r.vram);
        println!("    RAM:           {} available of {}", r.available_ram, r.total_ram);
        println!("    CPU cores:     {} ({} inference slots)", r.cpu_cores, r.compute_units);
        println!();
    })
}
