//! Versioned JSON Schema for `ReportExtraction` and its validator.
//!
//! The schema is written out by hand next to the data model rather than
//! derived from it. Enumeration values come from the model enums' `ALL`
//! lists, and a test keeps property names in step with the serde field names.
//! Any field change must bump `SCHEMA_VERSION`.

use std::collections::HashSet;
use std::fmt;
use std::sync::LazyLock;

use serde_json::{json, Value};

use crate::models::{
    BodyRegion, Certainty, FindingType, Laterality, MeasureAxis, Modality, ReportExtraction,
    SCHEMA_VERSION,
};

/// Title of the root schema; also the name used for native structured output.
pub const SCHEMA_TITLE: &str = "ReportExtraction";

// ──────────────────────────────────────────────
// Errors
// ──────────────────────────────────────────────

/// One violated constraint, located by JSON pointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    pub path: String,
    pub message: String,
}

impl SchemaViolation {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = if self.path.is_empty() { "/" } else { &self.path };
        write!(f, "{path}: {}", self.message)
    }
}

/// Every constraint a document violated, not just the first.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub struct SchemaError {
    pub violations: Vec<SchemaViolation>,
}

impl SchemaError {
    pub fn single(violation: SchemaViolation) -> Self {
        Self {
            violations: vec![violation],
        }
    }

    /// True if any violation is reported at exactly `path`.
    pub fn has_violation_at(&self, path: &str) -> bool {
        self.violations.iter().any(|v| v.path == path)
    }
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} schema violation(s): ", self.violations.len())?;
        for (i, violation) in self.violations.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{violation}")?;
        }
        Ok(())
    }
}

// ──────────────────────────────────────────────
// Schema description
// ──────────────────────────────────────────────

fn nullable_string(description: &str) -> Value {
    json!({ "type": ["string", "null"], "description": description })
}

fn nullable_enum(values: &[&str], default: &str) -> Value {
    let mut allowed: Vec<Value> = values.iter().map(|v| json!(v)).collect();
    allowed.push(Value::Null);
    json!({ "enum": allowed, "default": default })
}

fn lesion_schema() -> Value {
    json!({
        "type": "object",
        "title": "Lesion",
        "required": ["lesion_id", "body_site"],
        "properties": {
            "lesion_id": { "type": "string", "description": "Stable identifier within the report" },
            "finding_type": { "enum": FindingType::ALL, "default": "indeterminate" },
            "body_site": { "type": "string", "description": "Normalized organ/site" },
            "metastatic_site": nullable_string("If met, specify organ/site"),
            "is_node": { "type": "boolean", "default": false },
            "node_station": nullable_string("If node, LN station (e.g., 4R)"),
            "laterality": nullable_enum(Laterality::ALL, "unknown"),
            "measure_axis": nullable_enum(MeasureAxis::ALL, "unknown"),
            "size_mm": {
                "type": ["integer", "null"],
                "minimum": 0,
                "description": "Size in millimeters"
            },
            "certainty": nullable_enum(Certainty::ALL, "present"),
            "date_relative": nullable_string("e.g., 'increased from 12 to 18 mm since 06/2023'"),
            "note": nullable_string("Free-text note"),
            "evidence_span": nullable_string("Verbatim supporting text from the report")
        }
    })
}

fn summary_schema() -> Value {
    json!({
        "type": "object",
        "title": "Summary",
        "properties": {
            "modality": { "enum": Modality::ALL, "default": "UNKNOWN" },
            "body_region": nullable_enum(BodyRegion::ALL, "UNKNOWN"),
            "tn_stage_reported": nullable_string("Stage only if explicit in text"),
            "metastasis_present": { "type": ["boolean", "null"] },
            "total_lesion_count": { "type": ["integer", "null"], "minimum": 0 }
        }
    })
}

/// The machine-checkable schema, used for validation and embedded in prompts.
pub fn json_schema() -> Value {
    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "title": SCHEMA_TITLE,
        "type": "object",
        "required": ["summary", "lesions"],
        "properties": {
            "patient_id": nullable_string("Patient identifier if stated"),
            "study_date": nullable_string("Study date if stated"),
            "report_id": nullable_string("Report identifier if stated"),
            "summary": { "$ref": "#/$defs/Summary" },
            "lesions": { "type": "array", "items": { "$ref": "#/$defs/Lesion" } },
            "model_name": nullable_string("Injected after extraction"),
            "prompt_version": nullable_string("Injected after extraction"),
            "schema_version": { "const": SCHEMA_VERSION, "default": SCHEMA_VERSION }
        },
        "$defs": {
            "Lesion": lesion_schema(),
            "Summary": summary_schema()
        }
    })
}

// ──────────────────────────────────────────────
// Validation
// ──────────────────────────────────────────────

static VALIDATOR: LazyLock<jsonschema::Validator> = LazyLock::new(|| {
    jsonschema::validator_for(&json_schema()).expect("static extraction schema compiles")
});

/// Validate a JSON document, collecting every violation.
pub fn validate(value: &Value) -> Result<(), SchemaError> {
    let mut violations: Vec<SchemaViolation> = VALIDATOR
        .iter_errors(value)
        .map(|e| SchemaViolation::new(e.instance_path.to_string(), e.to_string()))
        .collect();

    violations.extend(duplicate_lesion_ids(value));

    if violations.is_empty() {
        Ok(())
    } else {
        Err(SchemaError { violations })
    }
}

/// Validate and convert into the typed model.
pub fn validate_extraction(value: Value) -> Result<ReportExtraction, SchemaError> {
    validate(&value)?;
    serde_json::from_value(value)
        .map_err(|e| SchemaError::single(SchemaViolation::new("", e.to_string())))
}

/// Lesion identifiers must be unique within a report.
fn duplicate_lesion_ids(value: &Value) -> Vec<SchemaViolation> {
    let Some(lesions) = value.get("lesions").and_then(Value::as_array) else {
        return vec![];
    };

    let mut seen = HashSet::new();
    let mut violations = Vec::new();
    for (idx, lesion) in lesions.iter().enumerate() {
        if let Some(id) = lesion.get("lesion_id").and_then(Value::as_str) {
            if !seen.insert(id) {
                violations.push(SchemaViolation::new(
                    format!("/lesions/{idx}/lesion_id"),
                    format!("duplicate lesion_id '{id}'"),
                ));
            }
        }
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Lesion, SizeMm, Summary};
    use std::collections::BTreeSet;

    fn property_names(schema: &Value) -> BTreeSet<String> {
        schema["properties"]
            .as_object()
            .unwrap()
            .keys()
            .cloned()
            .collect()
    }

    fn object_keys(value: &Value) -> BTreeSet<String> {
        value.as_object().unwrap().keys().cloned().collect()
    }

    fn full_extraction() -> ReportExtraction {
        let mut lesion = Lesion::new("L1", FindingType::Metastasis, "liver")
            .with_metastatic_site("liver")
            .with_node_station("4R")
            .with_size_mm(9)
            .unwrap()
            .with_evidence("9 mm lesion in the liver");
        lesion.date_relative = Some("new since 06/2023".into());
        lesion.note = Some("segment 6".into());
        let mut extraction = ReportExtraction::new(
            Summary {
                modality: Modality::Ct,
                body_region: Some(BodyRegion::ChestAbdomenPelvis),
                tn_stage_reported: Some("T2N1".into()),
                metastasis_present: Some(true),
                total_lesion_count: Some(1),
            },
            vec![lesion],
        );
        extraction.patient_id = Some("P1".into());
        extraction.with_provenance("gpt-4o-mini", "v1")
    }

    #[test]
    fn schema_properties_match_model_fields() {
        let schema = json_schema();
        let value = serde_json::to_value(full_extraction()).unwrap();

        assert_eq!(property_names(&schema), object_keys(&value));
        assert_eq!(
            property_names(&schema["$defs"]["Summary"]),
            object_keys(&value["summary"])
        );
        assert_eq!(
            property_names(&schema["$defs"]["Lesion"]),
            object_keys(&value["lesions"][0])
        );
    }

    #[test]
    fn schema_is_versioned_and_titled() {
        let schema = json_schema();
        assert_eq!(schema["title"], SCHEMA_TITLE);
        assert_eq!(schema["properties"]["schema_version"]["const"], SCHEMA_VERSION);
    }

    #[test]
    fn serialized_extraction_round_trips_through_validation() {
        let original = full_extraction();
        let value = serde_json::to_value(&original).unwrap();
        let parsed = validate_extraction(value).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn minimal_document_is_valid() {
        let value = json!({
            "summary": {"modality": "CT", "body_region": "CAP", "metastasis_present": true, "total_lesion_count": 2},
            "lesions": [
                {"lesion_id": "L1", "finding_type": "primary", "body_site": "lung", "size_mm": 28},
                {"lesion_id": "L2", "finding_type": "ln", "body_site": "mediastinum", "is_node": true, "node_station": "4R", "size_mm": 12}
            ]
        });
        let parsed = validate_extraction(value).unwrap();
        assert_eq!(parsed.lesions[1].size_mm.map(SizeMm::get), Some(12));
    }

    #[test]
    fn negative_size_fails_validation() {
        let value = json!({
            "summary": {},
            "lesions": [{"lesion_id": "L1", "body_site": "lung", "size_mm": -1}]
        });
        let err = validate(&value).unwrap_err();
        assert!(err.has_violation_at("/lesions/0/size_mm"), "{err}");
    }

    #[test]
    fn zero_size_passes_validation() {
        let value = json!({
            "summary": {},
            "lesions": [{"lesion_id": "L1", "body_site": "lung", "size_mm": 0}]
        });
        assert!(validate(&value).is_ok());
    }

    #[test]
    fn reports_every_violation() {
        let value = json!({
            "summary": {"modality": "PET"},
            "lesions": [
                {"lesion_id": "L1", "finding_type": "tumour", "size_mm": -3},
                {"lesion_id": "L1", "body_site": "liver"}
            ]
        });
        let err = validate(&value).unwrap_err();
        assert!(err.has_violation_at("/summary/modality"), "{err}");
        assert!(err.has_violation_at("/lesions/0/finding_type"), "{err}");
        assert!(err.has_violation_at("/lesions/0/size_mm"), "{err}");
        assert!(err.has_violation_at("/lesions/0"), "missing body_site: {err}");
        assert!(err.has_violation_at("/lesions/1/lesion_id"), "duplicate id: {err}");
        assert!(err.violations.len() >= 5);
    }

    #[test]
    fn missing_root_fields_are_reported() {
        let err = validate(&json!({})).unwrap_err();
        assert_eq!(err.violations.len(), 2, "{err}");
    }

    #[test]
    fn wrong_schema_version_is_rejected() {
        let value = json!({"summary": {}, "lesions": [], "schema_version": "2.0"});
        let err = validate(&value).unwrap_err();
        assert!(err.has_violation_at("/schema_version"));
    }

    #[test]
    fn error_display_lists_paths() {
        let err = SchemaError {
            violations: vec![
                SchemaViolation::new("/a", "bad"),
                SchemaViolation::new("", "worse"),
            ],
        };
        assert_eq!(err.to_string(), "2 schema violation(s): /a: bad; /: worse");
    }
}
