//! SAP Pipeline entry point

use std::path::PathBuf;
use std::sync::Arc;
use tracing::Level;
use sap_pipeline::{MemoryBroker, Pipeline, PipelineConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();
    let config_path = if args.len() > 1 {
        PathBuf::from(&args[1])
    } else {
        PathBuf::from("pipeline.toml")
    };

    // Load configuration
    let config = if config_path.exists() {
        PipelineConfig::from_file(&config_path)?
    } else {
        eprintln!("Configuration file not found: {}", config_path.display());
        eprintln!("Creating default configuration...");
        let config = PipelineConfig::default();
        config.to_file(&config_path)?;
        eprintln!("Default configuration saved to {}", config_path.display());
        config
    };

    // Both tiers share one in-process broker
    let broker = MemoryBroker::for_uri(&config.broker.uri)?;

    // Create and run the pipeline
    let pipeline = Pipeline::new(config, Arc::new(broker))?;
    pipeline.run().await?;

    Ok(())
}
