use crate::codec::{self, image_size};
use crate::compositor::composite;
use crate::config::DegeneratePolicy;
use crate::discovery::discover;
use crate::errors::{Result, RmbgError};
use crate::traits::SegmentationModel;
use image::{DynamicImage, ImageError, ImageFormat, ImageReader, RgbaImage};
use indicatif::ProgressBar;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Extension of every written file. Transparency needs an alpha-capable format.
pub const OUTPUT_EXTENSION: &str = "png";

/// Steps a file goes through. A failure names the step it happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Resolve,
    Read,
    Encode,
    Infer,
    Decode,
    Composite,
    Write,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Resolve => "resolve",
            Self::Read => "read",
            Self::Encode => "encode",
            Self::Infer => "infer",
            Self::Decode => "decode",
            Self::Composite => "composite",
            Self::Write => "write",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub input: PathBuf,
    /// `None` when the input does not live under the input root.
    pub output: Option<PathBuf>,
}

/// Input files of one run paired with the files they are written to.
#[derive(Debug, Clone, Default)]
pub struct BatchManifest {
    input_root: PathBuf,
    entries: Vec<ManifestEntry>,
}

impl BatchManifest {
    /// Mirrors each input's path relative to `input_root` under
    /// `output_root`, with the extension forced to png.
    ///
    /// Inputs differing only in extension (`a.jpg`, `a.png`) share an output;
    /// the later one in the manifest wins.
    pub fn plan(inputs: Vec<PathBuf>, input_root: &Path, output_root: &Path) -> Self {
        let mut planned = HashSet::new();
        let entries = inputs
            .into_iter()
            .map(|input| {
                let output = output_path(&input, input_root, output_root).ok();
                if let Some(path) = &output {
                    if !planned.insert(path.clone()) {
                        warn!(
                            "{} overwrites an earlier output at {}",
                            input.display(),
                            path.display()
                        );
                    }
                }
                ManifestEntry { input, output }
            })
            .collect();
        Self {
            input_root: input_root.to_path_buf(),
            entries,
        }
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub fn output_path(input: &Path, input_root: &Path, output_root: &Path) -> Result<PathBuf> {
    let relative = input
        .strip_prefix(input_root)
        .map_err(|_| RmbgError::OutsideInputRoot {
            path: input.to_path_buf(),
            root: input_root.to_path_buf(),
        })?;
    Ok(output_root
        .join(relative)
        .with_extension(OUTPUT_EXTENSION))
}

#[derive(Debug)]
pub struct FileFailure {
    pub path: PathBuf,
    pub stage: Stage,
    pub error: RmbgError,
}

impl fmt::Display for FileFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.path.display(), self.stage, self.error)
    }
}

/// Outcome of a run. `succeeded + failed + skipped` equals the manifest size;
/// `skipped` is only non-zero after cancellation.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub failures: Vec<FileFailure>,
}

impl BatchReport {
    pub const fn total(&self) -> usize {
        self.succeeded + self.failed + self.skipped
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "succeeded: {}, failed: {}", self.succeeded, self.failed)?;
        if self.skipped > 0 {
            write!(f, ", skipped: {}", self.skipped)?;
        }
        Ok(())
    }
}

/// Decodes by content, falling back to the extension when the content is not
/// recognized.
fn read_image(path: &Path) -> Result<DynamicImage> {
    let unreadable = |source: ImageError| RmbgError::UnreadableImage {
        path: path.to_path_buf(),
        source,
    };
    ImageReader::open(path)
        .and_then(|reader| reader.with_guessed_format())
        .map_err(|e| unreadable(ImageError::IoError(e)))?
        .decode()
        .map_err(unreadable)
}

/// Runs encode, inference, decode and composite on one decoded image.
pub fn remove_background<M: SegmentationModel + ?Sized>(
    model: &M,
    image: &DynamicImage,
    policy: DegeneratePolicy,
) -> std::result::Result<RgbaImage, (Stage, RmbgError)> {
    let tensor = codec::encode_image(image, model.input_size()).map_err(|e| (Stage::Encode, e))?;
    let raw = model.infer(tensor.view()).map_err(|e| (Stage::Infer, e))?;
    let mask = codec::decode(raw.view(), image_size(image), policy).map_err(|e| (Stage::Decode, e))?;
    composite(image, &mask).map_err(|e| (Stage::Composite, e))
}

/// Sequential batch runner. Holds the loaded model for the whole run.
pub struct BatchProcessor<'m, M: SegmentationModel + ?Sized> {
    model: &'m M,
    policy: DegeneratePolicy,
    cancellation: Option<CancellationToken>,
    progress: Option<ProgressBar>,
}

impl<'m, M: SegmentationModel + ?Sized> BatchProcessor<'m, M> {
    pub const fn new(model: &'m M) -> Self {
        Self {
            model,
            policy: DegeneratePolicy::Opaque,
            cancellation: None,
            progress: None,
        }
    }

    pub const fn with_degenerate_policy(mut self, policy: DegeneratePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Checked before each file. Files left when it fires are skipped.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Validates the input directory, then discovers, plans and runs. Output
    /// directories are created per file, so an unwritable output root shows up
    /// as `Write` failures in the report.
    pub fn process_directory(&self, input_root: &Path, output_root: &Path) -> Result<BatchReport> {
        if !input_root.exists() {
            return Err(RmbgError::InputNotFound {
                path: input_root.to_path_buf(),
            });
        }
        if !input_root.is_dir() {
            return Err(RmbgError::InputNotDirectory {
                path: input_root.to_path_buf(),
            });
        }

        let inputs = discover(input_root);
        if inputs.is_empty() {
            info!("No supported images found in {}", input_root.display());
            return Ok(BatchReport::default());
        }

        info!(
            "Found {} images, writing to {}",
            inputs.len(),
            output_root.display()
        );

        let manifest = BatchManifest::plan(inputs, input_root, output_root);
        Ok(self.run(&manifest))
    }

    pub fn run(&self, manifest: &BatchManifest) -> BatchReport {
        let mut report = BatchReport::default();
        if let Some(progress) = &self.progress {
            progress.set_length(manifest.len() as u64);
        }

        for (index, entry) in manifest.entries().iter().enumerate() {
            if self
                .cancellation
                .as_ref()
                .is_some_and(CancellationToken::is_cancelled)
            {
                report.skipped = manifest.len() - index;
                warn!("Cancelled, skipping {} remaining files", report.skipped);
                break;
            }

            match self.process_entry(entry, &manifest.input_root) {
                Ok(output) => {
                    debug!("{} -> {}", entry.input.display(), output.display());
                    report.succeeded += 1;
                }
                Err((stage, error)) => {
                    let failure = FileFailure {
                        path: entry.input.clone(),
                        stage,
                        error,
                    };
                    warn!("Failed to process {failure}");
                    report.failures.push(failure);
                    report.failed += 1;
                }
            }

            if let Some(progress) = &self.progress {
                progress.inc(1);
            }
        }

        info!("Batch finished: {report}");
        report
    }

    fn process_entry(
        &self,
        entry: &ManifestEntry,
        input_root: &Path,
    ) -> std::result::Result<PathBuf, (Stage, RmbgError)> {
        let output = entry.output.clone().ok_or_else(|| {
            (
                Stage::Resolve,
                RmbgError::OutsideInputRoot {
                    path: entry.input.clone(),
                    root: input_root.to_path_buf(),
                },
            )
        })?;

        let image = read_image(&entry.input).map_err(|e| (Stage::Read, e))?;

        let cutout = remove_background(self.model, &image, self.policy)?;

        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| (Stage::Write, RmbgError::write_failure(parent, e)))?;
        }
        cutout
            .save_with_format(&output, ImageFormat::Png)
            .map_err(|e| (Stage::Write, RmbgError::write_failure(&output, e)))?;

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{ConstantModel, FailingModel, LuminanceModel};
    use image::{GenericImageView, Rgb, RgbImage};
    use tempfile::TempDir;

    fn write_image(path: &Path, width: u32, height: u32) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        RgbImage::from_fn(width, height, |x, y| Rgb([(x * 7) as u8, (y * 5) as u8, 90]))
            .save(path)
            .map_err(|e| RmbgError::write_failure(path, e))
    }

    #[test]
    fn test_output_path_forces_png() -> Result<()> {
        let output = output_path(
            Path::new("/in/sub/foo.JPG"),
            Path::new("/in"),
            Path::new("/out"),
        )?;
        assert_eq!(output, Path::new("/out/sub/foo.png"));
        Ok(())
    }

    #[test]
    fn test_output_path_outside_root() {
        assert!(matches!(
            output_path(Path::new("/elsewhere/a.png"), Path::new("/in"), Path::new("/out")),
            Err(RmbgError::OutsideInputRoot { .. })
        ));
    }

    #[test]
    fn test_plan_keeps_colliding_outputs() {
        let manifest = BatchManifest::plan(
            vec![PathBuf::from("/in/a.jpg"), PathBuf::from("/in/a.png")],
            Path::new("/in"),
            Path::new("/out"),
        );
        assert_eq!(manifest.len(), 2);
        assert!(manifest
            .entries()
            .iter()
            .all(|e| e.output.as_deref() == Some(Path::new("/out/a.png"))));
    }

    #[test]
    fn test_read_image_guesses_format_from_content() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("photo.jpg");
        RgbImage::new(6, 3)
            .save_with_format(&path, ImageFormat::Png)
            .map_err(|e| RmbgError::write_failure(&path, e))?;

        assert_eq!(read_image(&path)?.dimensions(), (6, 3));
        Ok(())
    }

    #[test]
    fn test_read_missing_file_is_unreadable() {
        assert!(matches!(
            read_image(Path::new("does/not/exist.png")),
            Err(RmbgError::UnreadableImage { .. })
        ));
    }

    #[test]
    fn test_remove_background_keeps_resolution() {
        let model = LuminanceModel::new(64);
        for (width, height) in [(1, 1), (3, 200), (97, 41), (64, 64)] {
            let image = DynamicImage::ImageRgb8(RgbImage::new(width, height));
            let output = remove_background(&model, &image, DegeneratePolicy::Opaque).unwrap();
            assert_eq!(output.dimensions(), (width, height));
        }
    }

    #[test]
    fn test_stage_of_inference_failure() {
        let image = DynamicImage::ImageRgb8(RgbImage::new(8, 8));
        let err = remove_background(&FailingModel::new(32), &image, DegeneratePolicy::Opaque)
            .unwrap_err();
        assert_eq!(err.0, Stage::Infer);
    }

    #[test]
    fn test_degenerate_fail_policy_fails_decode() {
        let image = DynamicImage::ImageRgb8(RgbImage::new(8, 8));
        let err = remove_background(&ConstantModel::new(32, 1.0), &image, DegeneratePolicy::Fail)
            .unwrap_err();
        assert_eq!(err.0, Stage::Decode);
        assert!(matches!(err.1, RmbgError::DegenerateOutputRange { .. }));
    }

    #[test]
    fn test_run_isolates_failures() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let input_dir = temp_dir.path().join("input");
        let output_dir = temp_dir.path().join("output");

        write_image(&input_dir.join("a.png"), 20, 10)?;
        fs::write(input_dir.join("b.jpg"), b"not an image")?;
        write_image(&input_dir.join("nested/c.png"), 5, 30)?;

        let model = LuminanceModel::new(32);
        let report = BatchProcessor::new(&model).process_directory(&input_dir, &output_dir)?;

        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.total(), 3);
        assert_eq!(report.failures[0].stage, Stage::Read);
        assert_eq!(report.failures[0].path, input_dir.join("b.jpg"));
        assert!(output_dir.join("a.png").exists());
        assert!(output_dir.join("nested/c.png").exists());
        assert!(!output_dir.join("b.png").exists());
        Ok(())
    }

    #[test]
    fn test_entry_outside_root_fails_resolve() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let stray = temp_dir.path().join("stray.png");
        write_image(&stray, 4, 4)?;

        let manifest = BatchManifest::plan(
            vec![stray],
            &temp_dir.path().join("input"),
            &temp_dir.path().join("output"),
        );
        let model = LuminanceModel::new(16);
        let report = BatchProcessor::new(&model).run(&manifest);

        assert_eq!(report.failed, 1);
        assert_eq!(report.failures[0].stage, Stage::Resolve);
        Ok(())
    }

    #[test]
    fn test_cancelled_run_skips_remaining() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let input_dir = temp_dir.path().join("input");
        write_image(&input_dir.join("a.png"), 4, 4)?;
        write_image(&input_dir.join("b.png"), 4, 4)?;

        let token = CancellationToken::new();
        token.cancel();

        let model = LuminanceModel::new(16);
        let report = BatchProcessor::new(&model)
            .with_cancellation(token)
            .process_directory(&input_dir, &temp_dir.path().join("output"))?;

        assert_eq!(report.succeeded + report.failed, 0);
        assert_eq!(report.skipped, 2);
        Ok(())
    }

    struct CancellingModel {
        inner: LuminanceModel,
        token: CancellationToken,
    }

    impl SegmentationModel for CancellingModel {
        fn input_size(&self) -> (usize, usize) {
            self.inner.input_size()
        }

        fn infer(&self, tensor: ndarray::ArrayView4<f32>) -> Result<ndarray::Array4<f32>> {
            self.token.cancel();
            self.inner.infer(tensor)
        }
    }

    #[test]
    fn test_cancel_during_run_finishes_current_file() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let input_dir = temp_dir.path().join("input");
        let output_dir = temp_dir.path().join("output");
        for name in ["a.png", "b.png", "c.png"] {
            write_image(&input_dir.join(name), 4, 4)?;
        }

        let token = CancellationToken::new();
        let model = CancellingModel {
            inner: LuminanceModel::new(16),
            token: token.clone(),
        };
        let report = BatchProcessor::new(&model)
            .with_cancellation(token)
            .process_directory(&input_dir, &output_dir)?;

        assert_eq!((report.succeeded, report.failed, report.skipped), (1, 0, 2));
        assert!(output_dir.join("a.png").exists());
        assert!(!output_dir.join("b.png").exists());
        Ok(())
    }

    #[test]
    fn test_missing_and_non_directory_input() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let model = LuminanceModel::new(16);
        let processor = BatchProcessor::new(&model);
        let output_dir = temp_dir.path().join("output");

        let missing = processor.process_directory(&temp_dir.path().join("nope"), &output_dir);
        assert!(matches!(missing, Err(RmbgError::InputNotFound { .. })));

        let file = temp_dir.path().join("file.png");
        write_image(&file, 2, 2)?;
        let not_dir = processor.process_directory(&file, &output_dir);
        assert!(matches!(not_dir, Err(RmbgError::InputNotDirectory { .. })));
        Ok(())
    }
}
