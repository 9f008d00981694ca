//! `keel estimate` command implementation

use crate::output::{OutputFormat, emit};
use colored::Colorize;
use keel_orchestrator::ModelRequest;
use keel_orchestrator::resources::{SizeClass, estimate_footprint, quantization_multiplier};
use keel_orchestrator::storage::format_bytes;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct Estimate {
    pub size: Option<String>,
    pub quantization: Option<String>,
    pub multiplier: f64,
    pub footprint_bytes: u64,
    pub footprint: String,
    pub gpu_layers: u32,
}

pub fn estimate(size: Option<&str>, quant: Option<&str>) -> Estimate {
    let mut request = ModelRequest::new("estimate", "");
    request.size = size.map(str::to_string);
    request.quantization = quant.map(str::to_string);

    let footprint_bytes = estimate_footprint(&request);
    let gpu_layers = size
        .and_then(SizeClass::parse)
        .unwrap_or(SizeClass::Medium)
        .gpu_layers();
    Estimate {
        size: request.size,
        quantization: request.quantization,
        multiplier: quantization_multiplier(quant),
        footprint_bytes,
        footprint: format_bytes(footprint_bytes),
        gpu_layers,
    }
}

/// Execute the `keel estimate` command
pub fn run(size: Option<&str>, quant: Option<&str>, output: OutputFormat) -> anyhow::Result<()> {
    emit(&estimate(size, quant), output, |e| {
        println!("  Footprint:  {}", e.footprint.yellow());
        println!("  Multiplier: {}", e.multiplier);
        println!("  GPU layers: {} (when an accelerator is present)", e.gpu_layers);
    })
}
