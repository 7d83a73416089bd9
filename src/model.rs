use std::fs;
use std::path::{Path, PathBuf};

use crate::{
    config::Device,
    errors::{Result, RmbgError},
    export::ExportOptions,
    traits::{GraphExporter, SegmentationModel},
};
use ndarray::prelude::*;
use ort::value::TensorRef;
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProviderDispatch},
    session::{builder::SessionBuilder, Session},
};
use parking_lot::Mutex;
use tracing::{debug, info};

/// Spatial size used when the model declares dynamic height or width.
pub const DEFAULT_IMAGE_SIZE: usize = 1024;

/// `ModelProto.opset_import`
const OPSET_IMPORT_FIELD: u64 = 8;

/// RMBG-1.4 (or any compatible ONNX segmentation model) run by ONNX Runtime.
pub struct OnnxModel {
    path: PathBuf,
    image_size: (usize, usize),
    signature: GraphSignature,
    output_shape: Vec<i64>,
    bytes: Vec<u8>,
    session: Mutex<Session>,
}

/// The parts of a loaded graph an export is checked against.
#[derive(Debug, Clone, PartialEq, Eq)]
struct GraphSignature {
    input_name: String,
    output_name: String,
    input_shape: Vec<i64>,
    /// Version of the default (`ai.onnx`) operator set.
    opset: Option<i64>,
}

enum Field<'a> {
    Varint(u64),
    Bytes(&'a [u8]),
    Fixed,
}

fn read_varint(bytes: &[u8], pos: &mut usize) -> Option<u64> {
    let mut value = 0u64;
    for shift in (0..64).step_by(7) {
        let byte = *bytes.get(*pos)?;
        *pos += 1;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
    }
    None
}

/// Walks the top-level fields of a protobuf message. `None` on malformed input.
fn scan_fields<'a>(bytes: &'a [u8], mut visit: impl FnMut(u64, Field<'a>)) -> Option<()> {
    let mut pos = 0;
    while pos < bytes.len() {
        let key = read_varint(bytes, &mut pos)?;
        let field = match key & 0x7 {
            0 => Field::Varint(read_varint(bytes, &mut pos)?),
            1 => {
                pos = pos.checked_add(8)?;
                Field::Fixed
            }
            2 => {
                let len = usize::try_from(read_varint(bytes, &mut pos)?).ok()?;
                let end = pos.checked_add(len)?;
                let payload = bytes.get(pos..end)?;
                pos = end;
                Field::Bytes(payload)
            }
            5 => {
                pos = pos.checked_add(4)?;
                Field::Fixed
            }
            _ => return None,
        };
        if pos > bytes.len() {
            return None;
        }
        visit(key >> 3, field);
    }
    Some(())
}

/// Reads the default-domain opset version from a serialized ONNX model.
fn default_opset(model: &[u8]) -> Option<i64> {
    let mut opset = None;
    scan_fields(model, |number, field| {
        let Field::Bytes(entry) = field else { return };
        if number != OPSET_IMPORT_FIELD {
            return;
        }
        let mut domain: &[u8] = b"";
        let mut version = None;
        let parsed = scan_fields(entry, |n, f| match (n, f) {
            (1, Field::Bytes(d)) => domain = d,
            (2, Field::Varint(v)) => version = i64::try_from(v).ok(),
            _ => {}
        });
        if parsed.is_some() && (domain.is_empty() || domain == b"ai.onnx") {
            opset = version.or(opset);
        }
    })?;
    opset
}

fn execution_providers(device: Device, device_id: i32) -> Vec<ExecutionProviderDispatch> {
    match device {
        Device::Auto => vec![CUDAExecutionProvider::default()
            .with_device_id(device_id)
            .build()],
        Device::Cuda => vec![CUDAExecutionProvider::default()
            .with_device_id(device_id)
            .build()
            .error_on_failure()],
        Device::Cpu => Vec::new(),
    }
}

fn spatial_dim(shape: &[i64], axis: usize) -> usize {
    shape
        .get(axis)
        .and_then(|&d| usize::try_from(d).ok())
        .filter(|&d| d > 0)
        .unwrap_or(DEFAULT_IMAGE_SIZE)
}

impl OnnxModel {
    pub fn new(model_path: &Path, device: Device, device_id: i32) -> Result<Self> {
        let load_failure = |reason: String| RmbgError::ModelLoadFailure {
            path: model_path.to_path_buf(),
            reason,
        };

        let bytes = fs::read(model_path).map_err(|e| load_failure(e.to_string()))?;
        let mut session = SessionBuilder::new()
            .map_err(|e| load_failure(format!("session builder: {e}")))?
            .with_execution_providers(execution_providers(device, device_id))
            .map_err(|e| load_failure(format!("execution providers: {e}")))?
            .with_memory_pattern(true)
            .map_err(|e| load_failure(format!("memory pattern: {e}")))?
            .commit_from_memory(&bytes)
            .map_err(|e| load_failure(e.to_string()))?;

        let input = session
            .inputs
            .first()
            .ok_or_else(|| load_failure("model has no inputs".to_string()))?;
        let output = session
            .outputs
            .first()
            .ok_or_else(|| load_failure("model has no outputs".to_string()))?;
        let input_shape = input
            .input_type
            .tensor_shape()
            .map(|shape| shape.to_vec())
            .ok_or_else(|| load_failure("model input is not a tensor".to_string()))?;
        let output_shape = output
            .output_type
            .tensor_shape()
            .map(|shape| shape.to_vec())
            .unwrap_or_default();
        let input_name = input.name.clone();
        let output_name = output.name.clone();
        let opset = default_opset(&bytes);
        let image_size = (spatial_dim(&input_shape, 2), spatial_dim(&input_shape, 3));
        debug!(
            "Model input {input_name} {input_shape:?}, output {output_name} {output_shape:?}, opset {opset:?}"
        );

        // warm up
        let data = Array4::<f32>::zeros((1, 3, image_size.0, image_size.1));
        let warm_up = TensorRef::from_array_view(&data).map_err(|e| load_failure(e.to_string()))?;
        session
            .run(ort::inputs![input_name.as_str() => warm_up])
            .map_err(|e| load_failure(format!("warm-up run: {e}")))?;

        info!(
            "Loaded {} ({}x{}, device {device:?})",
            model_path.display(),
            image_size.0,
            image_size.1
        );

        Ok(Self {
            path: model_path.to_path_buf(),
            image_size,
            signature: GraphSignature {
                input_name,
                output_name,
                input_shape,
                opset,
            },
            output_shape,
            bytes,
            session: Mutex::new(session),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn check_graph(
    signature: &GraphSignature,
    sample: ArrayView4<f32>,
    options: &ExportOptions,
) -> Result<()> {
    let fail = |reason: String| RmbgError::InvalidTensor { reason };
    if signature.input_name != options.input_name || signature.output_name != options.output_name {
        return Err(fail(format!(
            "graph is {} -> {}, expected {} -> {}",
            signature.input_name, signature.output_name, options.input_name, options.output_name
        )));
    }
    if signature.opset != Some(i64::from(options.opset_version)) {
        return Err(fail(format!(
            "graph imports opset {:?}, expected {}",
            signature.opset, options.opset_version
        )));
    }
    if signature.input_shape.len() != options.input_shape.len() {
        return Err(fail(format!(
            "graph input has rank {}, expected {}",
            signature.input_shape.len(),
            options.input_shape.len()
        )));
    }
    if sample.shape() != &options.input_shape[..] {
        return Err(fail(format!(
            "sample shape {:?} differs from {:?}",
            sample.shape(),
            options.input_shape
        )));
    }
    for (axis, (&declared, &expected)) in
        signature.input_shape.iter().zip(&options.input_shape).enumerate()
    {
        let symbolic = declared < 0;
        let matches = if options.is_dynamic(axis) {
            symbolic || declared == expected as i64
        } else {
            declared == expected as i64
        };
        if !matches {
            return Err(fail(format!(
                "input axis {axis} is {declared}, expected {}",
                if options.is_dynamic(axis) {
                    "symbolic".to_string()
                } else {
                    expected.to_string()
                }
            )));
        }
    }
    Ok(())
}

impl SegmentationModel for OnnxModel {
    fn input_size(&self) -> (usize, usize) {
        self.image_size
    }

    fn infer(&self, tensor: ArrayView4<f32>) -> Result<Array4<f32>> {
        let mut binding = self.session.lock();
        let outputs = binding.run(ort::inputs![
            self.signature.input_name.as_str() => TensorRef::from_array_view(&tensor.as_standard_layout())?
        ])?;
        Ok(outputs[self.signature.output_name.as_str()]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix4>()?
            .to_owned())
    }
}

impl GraphExporter for OnnxModel {
    /// Writes the loaded graph after checking it against `options` and running
    /// `sample` through it.
    fn export_graph(
        &self,
        sample: ArrayView4<f32>,
        options: &ExportOptions,
        destination: &Path,
    ) -> Result<()> {
        check_graph(&self.signature, sample, options)?;
        let output = self.infer(sample)?;
        debug!(
            "Sample output {:?} (declared {:?})",
            output.shape(),
            self.output_shape
        );

        fs::write(destination, &self.bytes).map_err(|e| RmbgError::ExportFailure {
            path: destination.to_path_buf(),
            reason: e.to_string(),
        })
    }
}
