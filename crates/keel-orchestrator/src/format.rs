//! Model file format detection.
//!
//! Classification is extension-first and falls back to a header probe of at
//! most [`PROBE_LEN`] bytes. Detection never fails: unreadable or
//! unrecognised files are [`ModelFormat::Unknown`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Maximum number of header bytes inspected.
pub const PROBE_LEN: usize = 16;

/// GGUF magic as stored on disk.
const GGUF_MAGIC: &[u8; 4] = b"GGUF";

/// Legacy GGML magics, little-endian u32 on disk (`ggml`, `ggmf`, `ggjt`).
const GGML_MAGICS: [u32; 3] = [0x6767_6d6c, 0x6767_6d66, 0x6767_6a74];

/// Binary family of a model file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFormat {
    Onnx,
    Gguf,
    Ggml,
    Unknown,
}

impl ModelFormat {
    /// Formats served by the quantized transformer backend.
    pub fn is_transformer(self) -> bool {
        matches!(self, ModelFormat::Gguf | ModelFormat::Ggml)
    }

    pub fn is_graph(self) -> bool {
        matches!(self, ModelFormat::Onnx)
    }

    pub fn is_known(self) -> bool {
        !matches!(self, ModelFormat::Unknown)
    }
}

impl fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Onnx => write!(f, "onnx"),
            Self::Gguf => write!(f, "gguf"),
            Self::Ggml => write!(f, "ggml"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Stateless detector over file extension and header magic.
#[derive(Debug, Clone, Copy, Default)]
pub struct FormatDetector;

impl FormatDetector {
    pub fn new() -> Self {
        Self
    }

    /// Classify `path`.
    pub fn detect(&self, path: &Path) -> ModelFormat {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());

        match ext.as_deref() {
            Some("onnx") => return ModelFormat::Onnx,
            Some("gguf") => return ModelFormat::Gguf,
            Some("ggml") | Some("bin") => {
                let header = read_header(path);
                if is_ggml(&header) {
                    return ModelFormat::Ggml;
                }
                return classify_header(&header);
            }
            _ => {}
        }

        classify_header(&read_header(path))
    }

    /// Classify raw header bytes without touching the filesystem.
    pub fn detect_bytes(&self, header: &[u8]) -> ModelFormat {
        classify_header(header)
    }
}

/// Convenience wrapper over [`FormatDetector::detect`].
pub fn detect(path: impl AsRef<Path>) -> ModelFormat {
    FormatDetector.detect(path.as_ref())
}

fn read_header(path: &Path) -> Vec<u8> {
    let mut buf = Vec::with_capacity(PROBE_LEN);
    match File::open(path) {
        Ok(file) => {
            if let Err(e) = file.take(PROBE_LEN as u64).read_to_end(&mut buf) {
                tracing::debug!(path = %path.display(), error = %e, "header probe failed");
                buf.clear();
            }
        }
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "header probe could not open file");
        }
    }
    buf
}

/// Probe order is fixed: ONNX, GGUF, GGML.
fn classify_header(header: &[u8]) -> ModelFormat {
    if is_onnx(header) {
        ModelFormat::Onnx
    } else if is_gguf(header) {
        ModelFormat::Gguf
    } else if is_ggml(header) {
        ModelFormat::Ggml
    } else {
        ModelFormat::Unknown
    }
}

fn is_gguf(header: &[u8]) -> bool {
    header.len() >= 4 && &header[..4] == GGUF_MAGIC
}

fn is_ggml(header: &[u8]) -> bool {
    if header.len() < 4 {
        return false;
    }
    let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    GGML_MAGICS.contains(&magic)
}

/// `ModelProto` starts with `ir_version` (field 1, varint) followed by a
/// length-delimited field such as `producer_name` or `graph`.
fn is_onnx(header: &[u8]) -> bool {
    if header.first() != Some(&0x08) {
        return false;
    }
    let mut pos = 1;
    let mut ir_version: u64 = 0;
    let mut shift = 0;
    loop {
        let Some(&byte) = header.get(pos) else {
            return false;
        };
        ir_version |= u64::from(byte & 0x7f) << shift;
        pos += 1;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 14 {
            return false;
        }
    }
    if ir_version == 0 || ir_version > 64 {
        return false;
    }
    let Some(&tag) = header.get(pos) else {
        return false;
    };
    let field = tag >> 3;
    tag & 0x07 == 2 && (2..=20).contains(&field)
}
