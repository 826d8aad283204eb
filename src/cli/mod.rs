use clap::Parser;
use std::path::PathBuf;
use crate::config::{ Config, FailurePolicy };

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Generate model responses for every prompt in a JSONL file", long_about = None)]
pub struct Args {
    // --- Run Args ---
    /// Ollama model used for generation (e.g., llama3, qwen2.5:7b)
    #[arg(long, env = "OLLAMA_MODEL")]
    pub model: String,

    /// Input JSONL file, one {"id", "role", "text"} record per line
    #[arg(long)]
    pub input: PathBuf,

    /// Output JSONL file. Created or truncated.
    #[arg(long)]
    pub output: PathBuf,

    /// Optional JSON config file overriding the default generation and retry settings
    #[arg(long, env = "SYNTH_CONFIG")]
    pub config: Option<PathBuf>,

    // --- Ollama Args ---
    /// Base URL of the Ollama server. Overrides `api_host` from the config file.
    #[arg(long, env = "OLLAMA_HOST")]
    pub host: Option<String>,

    /// Pull the model when it is not installed on the server
    #[arg(long, default_value = "false")]
    pub pull: bool,

    /// Do not ask the server whether the model is installed before starting
    #[arg(long, default_value = "false")]
    pub skip_model_check: bool,

    // --- Overrides ---
    /// Maximum number of records processed concurrently
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Total attempts per record for timeouts, connection and server errors
    #[arg(long)]
    pub retry_attempts: Option<u32>,

    /// What to do with a record that fails after all attempts (abort, skip, annotate)
    #[arg(long)]
    pub on_failure: Option<FailurePolicy>,

    /// Send earlier turns of each record to the model as chat history
    #[arg(long, default_value = "false")]
    pub multi_turn: bool,

    // --- General App Args ---
    /// Enable debug logging/output
    #[arg(long, env = "DEBUG", default_value = "false")]
    pub debug: bool,
}

impl Args {
    /// Applies command-line overrides on top of the file/default config.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(host) = &self.host {
            config.api_host = host.clone();
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(retry_attempts) = self.retry_attempts {
            config.retry_attempts = retry_attempts;
        }
        if let Some(policy) = self.on_failure {
            config.on_failure = policy;
        }
        if self.multi_turn {
            config.multi_turn = true;
        }
    }
}
