pub mod config;
pub mod models;
pub mod pipeline;

pub use models::{
    BodyRegion, Certainty, FindingType, Laterality, Lesion, MeasureAxis, Modality,
    ReportExtraction, SizeMm, Summary, SCHEMA_VERSION,
};
pub use pipeline::backend::{
    builtin_models, Backend, BackendError, BackendKind, BackendRegistry, BackendSettings,
    ConfigError, GenerationOptions, ModelConfig, TextGenerator,
};
pub use pipeline::batch::{
    batch_extract, extract_from_text, run_batch, BatchSummary, ExtractOptions, PipelineError,
};
pub use pipeline::decode::{repair_json, ConstrainedDecoder, DecodeError, RetryPolicy};
pub use pipeline::evaluation::{evaluate, EvalError, EvaluationReport};
pub use pipeline::postprocess::normalize;
pub use pipeline::prompt::{build_prompt, PROMPT_VERSION};
pub use pipeline::prompt_templates::{formatter_for, ChatMessage, PromptFormatter, Role};
pub use pipeline::schema::{json_schema, validate, SchemaError, SchemaViolation};
