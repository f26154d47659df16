use std::fs::OpenOptions;

use tracing::Level;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::prelude::*;

/// Initialize tracing output.
///
/// Log path: FENCE_LOG env var > ~/.fence/fence.log > stderr fallback.
/// Debug mode raises the stderr level so proxy verdicts and the composed
/// launcher argv become visible.
pub fn init_tracing(debug: bool) {
    let log_path = std::env::var("FENCE_LOG").ok().unwrap_or_else(|| {
        dirs::home_dir()
            .map(|h| h.join(".fence").join("fence.log"))
            .unwrap_or_else(|| std::path::PathBuf::from("fence.log"))
            .to_string_lossy()
            .into_owned()
    });

    let log_file = std::path::Path::new(&log_path)
        .parent()
        .and_then(|parent| std::fs::create_dir_all(parent).ok())
        .and_then(|_| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)
                .ok()
        });

    let file_layer: Option<Box<dyn Layer<_> + Send + Sync>> = log_file.map(|file| {
        tracing_subscriber::fmt::layer()
            .with_writer(file)
            .with_ansi(false)
            .with_filter(LevelFilter::from_level(Level::DEBUG))
            .boxed()
    });

    let stderr_level = if debug { Level::DEBUG } else { Level::WARN };
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .with_filter(LevelFilter::from_level(stderr_level))
        .boxed();

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .init()
}
