pub mod schema;
pub mod prompt_templates;
pub mod backend;
pub mod prompt;
pub mod decode; // Parse, repair, validate, retry
pub mod postprocess;
pub mod evaluation;
pub mod batch;
