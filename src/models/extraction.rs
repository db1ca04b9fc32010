use serde::{Deserialize, Serialize};

use super::enums::{BodyRegion, Modality};
use super::lesion::Lesion;

/// Version tag of the extraction schema. Bump on any field change.
pub const SCHEMA_VERSION: &str = "1.0";

fn default_body_region() -> Option<BodyRegion> {
    Some(BodyRegion::Unknown)
}

fn default_schema_version() -> String {
    SCHEMA_VERSION.to_string()
}

/// Per-report aggregate fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    #[serde(default)]
    pub modality: Modality,
    #[serde(default = "default_body_region")]
    pub body_region: Option<BodyRegion>,
    /// Stage text only when explicitly stated in the report.
    #[serde(default)]
    pub tn_stage_reported: Option<String>,
    /// Derived by the postprocessor.
    #[serde(default)]
    pub metastasis_present: Option<bool>,
    /// Derived by the postprocessor.
    #[serde(default)]
    pub total_lesion_count: Option<u32>,
}

impl Default for Summary {
    fn default() -> Self {
        Self {
            modality: Modality::Unknown,
            body_region: default_body_region(),
            tn_stage_reported: None,
            metastasis_present: None,
            total_lesion_count: None,
        }
    }
}

/// Root object of one report's extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportExtraction {
    #[serde(default)]
    pub patient_id: Option<String>,
    #[serde(default)]
    pub study_date: Option<String>,
    #[serde(default)]
    pub report_id: Option<String>,
    pub summary: Summary,
    pub lesions: Vec<Lesion>,

    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub prompt_version: Option<String>,
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
}

impl ReportExtraction {
    pub fn new(summary: Summary, lesions: Vec<Lesion>) -> Self {
        Self {
            patient_id: None,
            study_date: None,
            report_id: None,
            summary,
            lesions,
            model_name: None,
            prompt_version: None,
            schema_version: default_schema_version(),
        }
    }

    /// Stamp provenance fields after validation.
    pub fn with_provenance(mut self, model_name: &str, prompt_version: &str) -> Self {
        self.model_name = Some(model_name.to_string());
        self.prompt_version = Some(prompt_version.to_string());
        self
    }
}
