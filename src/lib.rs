pub mod cli;
pub mod config;
pub mod jsonl;
pub mod llm;
pub mod models;
pub mod pipeline;
pub mod processor;

use cli::Args;
use config::Config;
use llm::BackendError;
use llm::ollama::{ model_matches, OllamaClient };
use log::{ info, warn };
use pipeline::{ create_output, open_input, Pipeline, PipelineError, RunSummary };
use processor::TurnProcessor;
use std::sync::Arc;

pub async fn run(args: Args) -> Result<RunSummary, PipelineError> {
    let mut config = Config::load(args.config.as_deref())?;
    args.apply_overrides(&mut config);
    config.validate()?;

    info!("--- Run Configuration ---");
    info!("Model: {}", args.model);
    info!("Input: {}", args.input.display());
    info!("Output: {}", args.output.display());
    info!("Ollama Host: {}", config.api_host);
    info!(
        "Sampling: temperature={}, top_p={}, top_k={}, max_tokens={}",
        config.temperature,
        config.top_p,
        config.top_k,
        config.max_tokens
    );
    info!("Batch Size: {}", config.batch_size);
    info!("Retry Attempts: {}", config.retry_attempts);
    info!("Timeout: {}s", config.timeout);
    info!("Multi-turn Context: {}", config.multi_turn);
    info!("On Failure: {}", config.on_failure);
    info!("-------------------------");

    let reader = open_input(&args.input)?;

    let client = OllamaClient::from_config(&config);
    if args.skip_model_check {
        info!("Skipping model availability check");
    } else {
        ensure_model(&client, &args.model, args.pull).await?;
    }

    let mut writer = create_output(&args.output)?;
    let processor = TurnProcessor::new(Arc::new(client), Arc::new(config), args.model.clone());
    let summary = Pipeline::new(processor).run(reader, &mut writer).await?;

    info!(
        "Done: {} read, {} written, {} skipped, {} annotated",
        summary.read,
        summary.written,
        summary.skipped,
        summary.annotated
    );
    if summary.read == 0 {
        warn!("Input file {} contained no records", args.input.display());
    }
    Ok(summary)
}

async fn ensure_model(client: &OllamaClient, model: &str, pull: bool) -> Result<(), PipelineError> {
    let backend_err = |source: BackendError| PipelineError::Backend {
        host: client.base_url().to_string(),
        source,
    };
    let installed = client.list_models().await.map_err(backend_err)?;
    if installed.iter().any(|name| model_matches(name, model)) {
        info!("Model '{}' is available", model);
        return Ok(());
    }
    if pull {
        warn!("Model '{}' is not installed, pulling it", model);
        client.pull_model(model).await.map_err(backend_err)?;
        info!("Model '{}' pulled", model);
        return Ok(());
    }
    Err(PipelineError::ModelUnavailable {
        model: model.to_string(),
        host: client.base_url().to_string(),
        installed: if installed.is_empty() { "none".to_string() } else { installed.join(", ") },
    })
}
