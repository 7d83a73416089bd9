use crate::errors::{Result, RmbgError};
use clap::{Parser, ValueEnum};
use std::path::{Path, PathBuf};

pub const DEFAULT_MODEL_PATH: &str = "rmbg-1.4.onnx";

/// Compute device for inference.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum Device {
    /// Use CUDA when it can be registered, otherwise the CPU
    #[default]
    Auto,
    /// Require CUDA
    Cuda,
    /// CPU only
    Cpu,
}

/// Mask produced when the model returns the same score for every pixel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum DegeneratePolicy {
    /// Keep the whole image
    #[default]
    Opaque,
    /// Make the whole image transparent
    Transparent,
    /// Count the file as failed
    Fail,
}

#[derive(Parser, Clone, Debug)]
#[command(version, about = "Remove image backgrounds in bulk with RMBG-1.4", long_about = None)]
pub struct Config {
    /// Directory scanned recursively for jpg, jpeg, png, webp and avif files
    pub input_dir: PathBuf,

    /// Output directory [default: <input_dir>_no_bg next to the input]
    pub output_dir: Option<PathBuf>,

    #[arg(short, long, default_value = DEFAULT_MODEL_PATH)]
    pub model_path: PathBuf,

    #[arg(long, value_enum, default_value_t = Device::Auto)]
    pub device: Device,

    #[arg(short, long, default_value_t = 0)]
    pub device_id: i32,

    #[arg(long, value_enum, default_value_t = DegeneratePolicy::Opaque)]
    pub on_degenerate: DegeneratePolicy,
}

impl Config {
    /// The explicit output directory, or `<input_dir>_no_bg` beside `input_dir`.
    pub fn resolve_output_dir(&self, input_dir: &Path) -> PathBuf {
        match &self.output_dir {
            Some(dir) => dir.clone(),
            None => default_output_dir(input_dir),
        }
    }
}

/// Canonical path of an existing input directory. Failing to resolve a path
/// that exists is reported as an I/O error, not as a missing input.
pub fn resolve_input_dir(input_dir: &Path) -> Result<PathBuf> {
    if !input_dir.exists() {
        return Err(RmbgError::InputNotFound {
            path: input_dir.to_path_buf(),
        });
    }
    if !input_dir.is_dir() {
        return Err(RmbgError::InputNotDirectory {
            path: input_dir.to_path_buf(),
        });
    }
    Ok(input_dir.canonicalize()?)
}

pub fn default_output_dir(input_dir: &Path) -> PathBuf {
    let name = input_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "images".to_string());
    input_dir
        .parent()
        .unwrap_or(input_dir)
        .join(format!("{name}_no_bg"))
}

#[derive(Parser, Clone, Debug)]
#[command(version, about = "Export the RMBG-1.4 graph to an ONNX file", long_about = None)]
pub struct ExportConfig {
    /// Destination file
    #[arg(default_value = DEFAULT_MODEL_PATH)]
    pub output: PathBuf,

    /// Source model to export
    #[arg(short, long)]
    pub model_path: PathBuf,

    #[arg(long, default_value_t = 14)]
    pub opset: u32,

    #[arg(long, value_enum, default_value_t = Device::Cpu)]
    pub device: Device,

    #[arg(short, long, default_value_t = 0)]
    pub device_id: i32,
}
