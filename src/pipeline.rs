use crate::config::{ ConfigError, FailurePolicy };
use crate::jsonl::{ RecordError, RecordReader, RecordWriter };
use crate::llm::BackendError;
use crate::processor::{ ProcessError, TurnProcessor };
use futures::stream::{ self, StreamExt };
use log::{ info, warn };
use std::fs::File;
use std::io::{ self, BufRead, BufReader, BufWriter, Write };
use std::path::{ Path, PathBuf };
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)] Config(#[from] ConfigError),
    #[error("Cannot open input file '{}': {source}", .path.display())] OpenInput {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Cannot create output file '{}': {source}", .path.display())] CreateOutput {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)] Record(#[from] RecordError),
    #[error(transparent)] Process(#[from] ProcessError),
    #[error("Failed to write output: {0}")] Write(#[from] io::Error),
    #[error("Model '{model}' is not available on {host} (installed: {installed})")] ModelUnavailable {
        model: String,
        host: String,
        installed: String,
    },
    #[error("Ollama at {host} is unreachable: {source}")] Backend {
        host: String,
        #[source]
        source: BackendError,
    },
}

impl PipelineError {
    /// One-line description for the error stream: kind, record id when
    /// there is one, and cause.
    pub fn diagnostic(&self) -> String {
        match self {
            PipelineError::Process(e) =>
                format!(
                    "error: record {}: {} ({}): {}",
                    e.id(),
                    e.kind(),
                    e.backend_error().kind(),
                    e.backend_error()
                ),
            PipelineError::Record(e @ RecordError::Malformed { .. }) => format!("error: MalformedRecord: {}", e),
            PipelineError::Record(e @ RecordError::Read { .. }) => format!("error: IoError: {}", e),
            PipelineError::Config(e) => format!("error: ConfigError: {}", e),
            PipelineError::OpenInput { .. } | PipelineError::CreateOutput { .. } | PipelineError::Write(_) =>
                format!("error: IoError: {}", self),
            PipelineError::ModelUnavailable { .. } => format!("error: ModelUnavailable: {}", self),
            PipelineError::Backend { source, .. } => format!("error: {}: {}", source.kind(), self),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub read: usize,
    pub written: usize,
    pub skipped: usize,
    pub annotated: usize,
}

pub fn open_input(path: &Path) -> Result<RecordReader<BufReader<File>>, PipelineError> {
    RecordReader::open(path).map_err(|source| PipelineError::OpenInput {
        path: path.to_path_buf(),
        source,
    })
}

pub fn create_output(path: &Path) -> Result<RecordWriter<BufWriter<File>>, PipelineError> {
    RecordWriter::create(path).map_err(|source| PipelineError::CreateOutput {
        path: path.to_path_buf(),
        source,
    })
}

/// Streams records through the processor with at most `batch_size` in
/// flight and writes results strictly in input order.
pub struct Pipeline {
    processor: Arc<TurnProcessor>,
    batch_size: usize,
    policy: FailurePolicy,
}

impl Pipeline {
    pub fn new(processor: TurnProcessor) -> Self {
        let batch_size = processor.config().batch_size.max(1);
        let policy = processor.config().on_failure;
        Self {
            processor: Arc::new(processor),
            batch_size,
            policy,
        }
    }

    pub async fn run<R: BufRead, W: Write>(
        &self,
        reader: RecordReader<R>,
        writer: &mut RecordWriter<W>
    ) -> Result<RunSummary, PipelineError> {
        let mut summary = RunSummary::default();

        // `buffered` polls up to `batch_size` futures at once but yields them
        // in the order they were pulled from the reader.
        let outcomes = stream
            ::iter(reader)
            .map(|item| {
                let processor = Arc::clone(&self.processor);
                async move {
                    let record = item?;
                    let outcome = processor.process(&record).await;
                    Ok::<_, RecordError>((record, outcome))
                }
            })
            .buffered(self.batch_size);
        futures::pin_mut!(outcomes);

        while let Some(item) = outcomes.next().await {
            let (mut record, outcome) = item?;
            summary.read += 1;
            match outcome {
                Ok(output) => {
                    writer.write(&output)?;
                    summary.written += 1;
                }
                Err(err) =>
                    match self.policy {
                        FailurePolicy::Abort => {
                            return Err(err.into());
                        }
                        FailurePolicy::Skip => {
                            warn!("Skipping record {}: {}", record.id, err);
                            summary.skipped += 1;
                        }
                        FailurePolicy::Annotate => {
                            warn!("Writing record {} with error annotation: {}", record.id, err);
                            record.annotate(err.to_failure());
                            writer.write(&record)?;
                            summary.annotated += 1;
                        }
                    }
            }
            if summary.read % 100 == 0 {
                info!("Processed {} records", summary.read);
            }
        }

        Ok(summary)
    }
}
