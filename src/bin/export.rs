use anyhow::{Context, Result};
use clap::Parser;

use rmbg_rs::{export_model, init_tracing, ExportConfig, ExportOptions, OnnxModel};

fn main() -> Result<()> {
    init_tracing();
    let config = ExportConfig::parse();

    let model = OnnxModel::new(&config.model_path, config.device, config.device_id)?;
    let options = ExportOptions::default().with_opset(config.opset);

    let report = export_model(&model, &options, &config.output)
        .with_context(|| format!("Failed to export {}", model.path().display()))?;

    println!(
        "Exported {} ({:.2} MiB, opset {})",
        report.path.display(),
        report.size as f64 / (1024.0 * 1024.0),
        options.opset_version
    );
    Ok(())
}
