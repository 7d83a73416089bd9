use crate::errors::{Result, RmbgError};
use crate::traits::GraphExporter;
use ndarray::Array4;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const MIB: u64 = 1024 * 1024;

/// What the exported graph must look like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportOptions {
    pub input_name: String,
    pub output_name: String,
    pub opset_version: u32,
    /// `[batch, channels, height, width]` of the synthetic input.
    pub input_shape: [usize; 4],
    /// Axes left symbolic in the exported graph. Only the batch axis is.
    pub dynamic_axes: Vec<usize>,
    /// Files below this many bytes are probably truncated.
    pub min_size: u64,
    /// Files above this many bytes probably carry unused weights.
    pub max_size: u64,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            input_name: "input".to_string(),
            output_name: "output".to_string(),
            opset_version: 14,
            input_shape: [1, 3, 1024, 1024],
            dynamic_axes: vec![0],
            min_size: 10 * MIB,
            max_size: 200 * MIB,
        }
    }
}

impl ExportOptions {
    pub fn with_opset(mut self, opset_version: u32) -> Self {
        self.opset_version = opset_version;
        self
    }

    pub fn is_dynamic(&self, axis: usize) -> bool {
        self.dynamic_axes.contains(&axis)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeCheck {
    Normal,
    TooSmall,
    TooLarge,
}

impl SizeCheck {
    pub const fn classify(size: u64, options: &ExportOptions) -> Self {
        if size < options.min_size {
            Self::TooSmall
        } else if size > options.max_size {
            Self::TooLarge
        } else {
            Self::Normal
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportReport {
    pub path: PathBuf,
    pub size: u64,
    pub size_check: SizeCheck,
}

/// Exports the graph once with a zero-filled sample of `options.input_shape`
/// and checks the size of the written file.
///
/// An unusual size is only reported as a warning.
pub fn export_model<E: GraphExporter + ?Sized>(
    exporter: &E,
    options: &ExportOptions,
    destination: &Path,
) -> Result<ExportReport> {
    let export_failure = |reason: String| RmbgError::ExportFailure {
        path: destination.to_path_buf(),
        reason,
    };

    if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
        if !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| export_failure(e.to_string()))?;
            info!("Created output directory {}", parent.display());
        }
    }

    let [batch, channels, height, width] = options.input_shape;
    let sample = Array4::<f32>::zeros((batch, channels, height, width));

    info!(
        "Exporting graph to {} (opset {})",
        destination.display(),
        options.opset_version
    );
    exporter
        .export_graph(sample.view(), options, destination)
        .map_err(|e| match e {
            RmbgError::ExportFailure { .. } => e,
            other => export_failure(other.to_string()),
        })?;

    let size = fs::metadata(destination)
        .map_err(|e| export_failure(e.to_string()))?
        .len();
    let size_check = SizeCheck::classify(size, options);
    let size_mib = size as f64 / MIB as f64;
    match size_check {
        SizeCheck::TooSmall => warn!("Exported model is only {size_mib:.2} MiB, it may be truncated"),
        SizeCheck::TooLarge => warn!("Exported model is {size_mib:.2} MiB, it may contain unused weights"),
        SizeCheck::Normal => info!("Exported model is {size_mib:.2} MiB"),
    }

    Ok(ExportReport {
        path: destination.to_path_buf(),
        size,
        size_check,
    })
}
