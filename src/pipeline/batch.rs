//! Extraction orchestration: prompt → decode → normalize → provenance,
//! for one report or a directory of reports.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use thiserror::Error;

use crate::models::ReportExtraction;
use crate::pipeline::backend::{BackendRegistry, ConfigError, GenerationOptions, TextGenerator};
use crate::pipeline::decode::{ConstrainedDecoder, DecodeError, RetryPolicy};
use crate::pipeline::postprocess::normalize;
use crate::pipeline::prompt::{build_prompt, PROMPT_VERSION};

/// Default model for extraction runs.
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize extraction: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl PipelineError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Settings for an extraction run.
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub model: String,
    pub generation: GenerationOptions,
    pub prompt_version: String,
    pub retry: RetryPolicy,
    /// Worker threads sharing the model's single backend.
    pub workers: usize,
    /// Input file extension, without the dot.
    pub extension: String,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            generation: GenerationOptions::default(),
            prompt_version: PROMPT_VERSION.to_string(),
            retry: RetryPolicy::default(),
            workers: 1,
            extension: "txt".to_string(),
        }
    }
}

/// A report that produced no output.
#[derive(Debug, Clone)]
pub struct FailedReport {
    pub file: PathBuf,
    pub error: String,
}

/// Outcome of a batch run.
#[derive(Debug, Default)]
pub struct BatchSummary {
    /// Output files written, in input order.
    pub written: Vec<PathBuf>,
    pub failed: Vec<FailedReport>,
}

impl BatchSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Extract, normalize and stamp provenance for one report.
pub fn extract_from_text<G: TextGenerator + ?Sized>(
    report_text: &str,
    generator: &G,
    options: &ExtractOptions,
) -> Result<ReportExtraction, DecodeError> {
    let messages = build_prompt(report_text, &options.prompt_version);
    let decoder = ConstrainedDecoder::new(generator, options.retry);
    let extraction = decoder.decode(&messages, &options.generation)?;
    Ok(normalize(extraction).with_provenance(generator.model_name(), &options.prompt_version))
}

/// Input files with the configured extension, sorted by name.
pub fn list_reports(in_dir: &Path, extension: &str) -> Result<Vec<PathBuf>, PipelineError> {
    let mut files = Vec::new();
    for entry in fs::read_dir(in_dir).map_err(|e| PipelineError::io(in_dir, e))? {
        let path = entry.map_err(|e| PipelineError::io(in_dir, e))?.path();
        let matches = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(extension));
        if matches && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn output_path(out_dir: &Path, input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    out_dir.join(format!("{stem}.json"))
}

/// Split inputs into the ones to process and the ones whose output name an
/// earlier input already claimed (`a.txt` and `a.TXT` both map to `a.json`).
fn claim_output_names(
    out_dir: &Path,
    files: &[PathBuf],
) -> (Vec<usize>, Vec<(usize, Result<PathBuf, String>)>) {
    let mut owners: HashMap<PathBuf, &Path> = HashMap::new();
    let mut jobs = Vec::with_capacity(files.len());
    let mut collisions = Vec::new();
    for (idx, input) in files.iter().enumerate() {
        let out = output_path(out_dir, input);
        match owners.get(&out) {
            Some(owner) => {
                let error = format!(
                    "output {} is already written for {}",
                    out.display(),
                    owner.display()
                );
                tracing::warn!(file = %input.display(), error = %error, "Skipping report");
                collisions.push((idx, Err(error)));
            }
            None => {
                owners.insert(out, input);
                jobs.push(idx);
            }
        }
    }
    (jobs, collisions)
}

fn process_file<G: TextGenerator + ?Sized>(
    input: &Path,
    out_dir: &Path,
    generator: &G,
    options: &ExtractOptions,
) -> Result<PathBuf, PipelineError> {
    let text = fs::read_to_string(input).map_err(|e| PipelineError::io(input, e))?;
    let extraction = extract_from_text(&text, generator, options)?;
    let out = output_path(out_dir, input);
    let json = serde_json::to_string_pretty(&extraction)?;
    fs::write(&out, json).map_err(|e| PipelineError::io(&out, e))?;
    Ok(out)
}

/// Extract every report in `in_dir` into `out_dir` with one generator.
///
/// Failures are logged and recorded; the batch continues.
pub fn batch_extract<G: TextGenerator + ?Sized>(
    in_dir: &Path,
    out_dir: &Path,
    generator: &G,
    options: &ExtractOptions,
) -> Result<BatchSummary, PipelineError> {
    fs::create_dir_all(out_dir).map_err(|e| PipelineError::io(out_dir, e))?;
    let files = list_reports(in_dir, &options.extension)?;
    let (jobs, collisions) = claim_output_names(out_dir, &files);
    let workers = options.workers.clamp(1, jobs.len().max(1));

    tracing::info!(
        model = generator.model_name(),
        files = files.len(),
        workers,
        "Starting batch extraction"
    );

    let next = AtomicUsize::new(0);
    let results: Mutex<Vec<(usize, Result<PathBuf, String>)>> = Mutex::new(collisions);

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                let Some(&idx) = jobs.get(next.fetch_add(1, Ordering::SeqCst)) else {
                    break;
                };
                let input = &files[idx];

                let start = Instant::now();
                let outcome = process_file(input, out_dir, generator, options);
                let elapsed_ms = start.elapsed().as_millis() as u64;
                let file = input.display().to_string();

                let outcome = match outcome {
                    Ok(out) => {
                        tracing::info!(file = %file, elapsed_ms, "Processed report");
                        Ok(out)
                    }
                    Err(e) => {
                        tracing::warn!(file = %file, elapsed_ms, error = %e, "Report extraction failed");
                        Err(e.to_string())
                    }
                };
                results
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push((idx, outcome));
            });
        }
    });

    let mut results = results.into_inner().unwrap_or_else(|e| e.into_inner());
    results.sort_by_key(|(idx, _)| *idx);

    let mut summary = BatchSummary::default();
    for (idx, outcome) in results {
        match outcome {
            Ok(out) => summary.written.push(out),
            Err(error) => summary.failed.push(FailedReport {
                file: files[idx].clone(),
                error,
            }),
        }
    }

    tracing::info!(
        written = summary.written.len(),
        failed = summary.failed.len(),
        "Batch extraction finished"
    );
    Ok(summary)
}

/// Resolve the model's backend from `registry` and run a batch with it.
pub fn run_batch(
    registry: &BackendRegistry,
    in_dir: &Path,
    out_dir: &Path,
    options: &ExtractOptions,
) -> Result<BatchSummary, PipelineError> {
    let backend = registry.get_or_create(&options.model)?;
    batch_extract(in_dir, out_dir, backend.as_ref(), options)
}
