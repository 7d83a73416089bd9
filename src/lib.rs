pub mod batch;
pub mod codec;
pub mod compositor;
pub mod config;
pub mod discovery;
pub mod errors;
pub mod export;
pub mod model;
pub mod traits;

pub mod mocks;

pub use batch::{remove_background, BatchManifest, BatchProcessor, BatchReport, FileFailure, Stage};
pub use codec::{decode, encode, encode_image};
pub use compositor::composite;
pub use config::{resolve_input_dir, Config, DegeneratePolicy, Device, ExportConfig};
pub use discovery::{discover, is_supported_image};
pub use errors::{Result, RmbgError};
pub use export::{export_model, ExportOptions, ExportReport, SizeCheck};
pub use model::OnnxModel;
pub use traits::*;

/// Installs the `tracing` subscriber used by both binaries. `RUST_LOG`
/// overrides the default `info` level.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Returns a token that is cancelled on the first Ctrl-C. The signal is
/// awaited on its own thread, so a batch stops after its current file.
pub fn cancel_on_ctrl_c() -> std::io::Result<tokio_util::sync::CancellationToken> {
    let token = tokio_util::sync::CancellationToken::new();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let cancel = token.clone();
    std::thread::Builder::new()
        .name("ctrl-c".to_string())
        .spawn(move || {
            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupted, stopping after the current file");
                    cancel.cancel();
                }
            });
        })?;
    Ok(token)
}
