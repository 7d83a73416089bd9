use anyhow::Result;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::error;

use rmbg_rs::{cancel_on_ctrl_c, init_tracing, resolve_input_dir, BatchProcessor, Config, OnnxModel};

fn main() -> Result<()> {
    init_tracing();
    let config = Config::parse();

    let input_dir = resolve_input_dir(&config.input_dir)?;
    let output_dir = config.resolve_output_dir(&input_dir);

    let model = OnnxModel::new(&config.model_path, config.device, config.device_id)?;

    let progress_bar = ProgressBar::new(0);
    progress_bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec} {eta})",
        )?
        .progress_chars("#>-"),
    );

    let report = BatchProcessor::new(&model)
        .with_degenerate_policy(config.on_degenerate)
        .with_progress(progress_bar.clone())
        .with_cancellation(cancel_on_ctrl_c()?)
        .process_directory(&input_dir, &output_dir)?;
    progress_bar.finish_and_clear();

    for failure in &report.failures {
        error!("{failure}");
    }
    println!("Done! {report}");
    println!("Output: {}", output_dir.display());

    Ok(())
}
