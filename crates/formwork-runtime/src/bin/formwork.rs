//! Formwork CLI
//!
//! Runs one objective through the engine and prints the final answer,
//! or the failure reason together with the last document state.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use formwork_config::{load_config, FormworkConfig};
use formwork_core::registry::CapabilityRegistry;
use formwork_llm::openai::{OpenAiGenerator, OpenAiGeneratorConfig};
use formwork_runtime::{ControlState, Pipeline};
use formwork_stores::FileStrategyLibrary;
use formwork_tools::register_builtin_tools;

#[derive(Debug, Parser)]
#[command(name = "formwork", about = "Multi-stage task engine over a shared document")]
struct Args {
    /// The objective to work on.
    objective: String,

    /// Additional context appended to the objective section.
    #[arg(long)]
    context: Option<String>,

    /// Path to a YAML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Strategy library file, overriding the configured path.
    #[arg(long)]
    library: Option<PathBuf>,

    /// Disable the watcher monitor for this run.
    #[arg(long)]
    no_watcher: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => FormworkConfig::default(),
    };
    if args.no_watcher {
        config.watcher.enabled = false;
    }

    let api_key = std::env::var(&config.provider.api_key_env).unwrap_or_default();
    if api_key.trim().is_empty() {
        tracing::warn!(
            env = %config.provider.api_key_env,
            "API key variable is empty; requests will be unauthenticated"
        );
    }
    let generator = OpenAiGenerator::new(OpenAiGeneratorConfig {
        api_key,
        model: config.provider.model.clone(),
        base_url: config.provider.base_url.clone(),
        temperature: config.provider.temperature,
        timeout_secs: config.provider.timeout_secs,
    })?;

    let library_path = args
        .library
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.library.path));
    let library = FileStrategyLibrary::open(library_path).await?;

    let mut registry = CapabilityRegistry::new();
    register_builtin_tools(&mut registry)?;

    let pipeline = Pipeline::builder(Arc::new(generator))
        .with_config(config)
        .with_library(Arc::new(library))
        .with_registry(registry)
        .build();

    let report = pipeline.run(&args.objective, args.context.as_deref()).await?;

    match report.state {
        ControlState::Done => {
            println!("{}", report.final_answer().unwrap_or(""));
            Ok(())
        }
        _ => {
            eprintln!("run failed: {}", report.halt.summary());
            eprintln!("\nlast document state:\n\n{}", report.document.render());
            std::process::exit(1);
        }
    }
}
