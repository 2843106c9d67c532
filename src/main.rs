use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, Level};

use batch_classify::{ClassificationPipeline, Config};

fn main() -> Result<()> {
    let config = Config::parse();
    init_tracing(config.verbose);

    let pipeline = ClassificationPipeline::with_onnx_model(config.clone())
        .with_context(|| format!("Failed to load model {}", config.model.display()))?;

    let predictions = pipeline.run().context("Classification failed")?;
    info!("Done: {} prediction(s)", predictions.len());

    Ok(())
}

// Logs go to stderr so `--stdout` output stays valid JSON.
fn init_tracing(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
