use std::path::PathBuf;
use thiserror::Error;

/// Error kinds for background removal and model export.
///
/// `InputNotFound`, `InputNotDirectory`, `ModelLoadFailure` and `ExportFailure`
/// end a run. Everything raised while handling a single file is recovered by
/// [`crate::batch::BatchProcessor`] and recorded in the run report.
#[derive(Error, Debug)]
pub enum RmbgError {
    #[error("Input directory does not exist: {path:?}")]
    InputNotFound { path: PathBuf },

    #[error("Input path is not a directory: {path:?}")]
    InputNotDirectory { path: PathBuf },

    #[error("Cannot read image {path:?}")]
    UnreadableImage {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Inference failed: {reason}")]
    InferenceFailure { reason: String },

    #[error("Cannot write {path:?}")]
    WriteFailure {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Model load failed ({path:?}): {reason}")]
    ModelLoadFailure { path: PathBuf, reason: String },

    #[error("Export to {path:?} failed: {reason}")]
    ExportFailure { path: PathBuf, reason: String },

    #[error("Model output range is degenerate (min {min}, max {max})")]
    DegenerateOutputRange { min: f32, max: f32 },

    #[error("Invalid tensor: {reason}")]
    InvalidTensor { reason: String },

    #[error("Mask is {actual:?} but image is {expected:?}")]
    MaskDimensionMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },

    #[error("{path:?} is not inside the input directory {root:?}")]
    OutsideInputRoot { path: PathBuf, root: PathBuf },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RmbgError>;

impl RmbgError {
    pub(crate) fn write_failure<E>(path: impl Into<PathBuf>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::WriteFailure {
            path: path.into(),
            source: Box::new(source),
        }
    }

    pub(crate) fn invalid_tensor(reason: impl Into<String>) -> Self {
        Self::InvalidTensor {
            reason: reason.into(),
        }
    }
}

/// Errors from a running session surface as inference failures. Load-time
/// errors are mapped explicitly to `ModelLoadFailure` where they happen.
impl From<ort::Error> for RmbgError {
    fn from(err: ort::Error) -> Self {
        Self::InferenceFailure {
            reason: err.to_string(),
        }
    }
}

impl From<ndarray::ShapeError> for RmbgError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::InvalidTensor {
            reason: err.to_string(),
        }
    }
}
