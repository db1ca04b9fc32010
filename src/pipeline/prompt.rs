use serde_json::{json, Value};

use crate::pipeline::prompt_templates::ChatMessage;
use crate::pipeline::schema::json_schema;

/// Default prompt version tag, persisted with every extraction.
pub const PROMPT_VERSION: &str = "v1";

pub const SYSTEM_PROMPT: &str = r#"You are a meticulous clinical information extraction system.
Extract ONLY facts that are explicitly stated in the report. Do not infer.
Return STRICT JSON that conforms to the provided JSON Schema. Use millimeters for size.
If a field is not stated, omit it rather than guessing.
For lymph nodes, record the SHORT AXIS in mm when available. Include an evidence_span for each numeric or categorical value when possible."#;

const CONVENTIONS: &str = r#"CONVENTIONS:
1. Sizes are integers in millimeters. Convert centimeters (2.1 cm -> 21).
2. Omit any field the report does not state. Never guess.
3. Lymph nodes: set is_node true, record node_station when given, and use the short axis.
4. evidence_span is copied verbatim from the report, not paraphrased.
5. Assign lesion_id values L1, L2, ... in order of appearance. Never reuse an id.
6. Output the JSON object only, with no prose and no markdown fences."#;

/// One fixed few-shot pair: a sample report and its complete extraction.
pub struct FewShotExample {
    pub report: &'static str,
    pub extraction: Value,
}

/// Ordered few-shot exemplars. Every extraction must validate against the schema.
pub fn few_shot_examples() -> Vec<FewShotExample> {
    vec![
        FewShotExample {
            report: "EXAM: CT CHEST/ABDOMEN/PELVIS WITH IV CONTRAST\n\
                     IMPRESSION:\n\
                     1. Left upper lobe mass measures 28 mm (previously 22 mm).\n\
                     2. Enlarged right paratracheal node (station 4R) short axis 12 mm.\n\
                     3. New 9 mm hypodense lesion in segment 6 of the liver, suspicious for metastasis.",
            extraction: json!({
                "summary": {
                    "modality": "CT",
                    "body_region": "CAP",
                    "tn_stage_reported": null,
                    "metastasis_present": true,
                    "total_lesion_count": 3
                },
                "lesions": [
                    {
                        "lesion_id": "L1",
                        "finding_type": "primary",
                        "body_site": "lung upper lobe",
                        "is_node": false,
                        "laterality": "left",
                        "measure_axis": "longest",
                        "size_mm": 28,
                        "certainty": "present",
                        "date_relative": "increased from 22 mm",
                        "evidence_span": "Left upper lobe mass measures 28 mm"
                    },
                    {
                        "lesion_id": "L2",
                        "finding_type": "ln",
                        "body_site": "mediastinum",
                        "is_node": true,
                        "node_station": "4R",
                        "laterality": "right",
                        "measure_axis": "short_axis",
                        "size_mm": 12,
                        "certainty": "present",
                        "evidence_span": "right paratracheal node (station 4R) short axis 12 mm"
                    },
                    {
                        "lesion_id": "L3",
                        "finding_type": "met",
                        "body_site": "liver",
                        "metastatic_site": "liver",
                        "is_node": false,
                        "size_mm": 9,
                        "certainty": "possible",
                        "evidence_span": "New 9 mm hypodense lesion in segment 6 of the liver, suspicious for metastasis"
                    }
                ]
            }),
        },
        FewShotExample {
            report: "EXAM: MRI ABDOMEN WITHOUT AND WITH CONTRAST\n\
                     FINDINGS:\n\
                     Right kidney: enhancing interpolar mass measuring 3.2 cm, consistent with renal cell carcinoma.\n\
                     Liver: 6 mm T2-hyperintense focus in segment 4, most consistent with a simple cyst. Metastasis is unlikely.\n\
                     No retroperitoneal lymphadenopathy.",
            extraction: json!({
                "summary": {
                    "modality": "MRI",
                    "body_region": "A",
                    "metastasis_present": false,
                    "total_lesion_count": 2
                },
                "lesions": [
                    {
                        "lesion_id": "L1",
                        "finding_type": "primary",
                        "body_site": "kidney",
                        "laterality": "right",
                        "measure_axis": "longest",
                        "size_mm": 32,
                        "certainty": "present",
                        "evidence_span": "enhancing interpolar mass measuring 3.2 cm, consistent with renal cell carcinoma"
                    },
                    {
                        "lesion_id": "L2",
                        "finding_type": "benign",
                        "body_site": "liver",
                        "size_mm": 6,
                        "certainty": "present",
                        "note": "simple cyst; metastasis unlikely",
                        "evidence_span": "6 mm T2-hyperintense focus in segment 4, most consistent with a simple cyst"
                    }
                ]
            }),
        },
    ]
}

/// The system message: instructions, conventions, schema and version tag.
pub fn system_message(prompt_version: &str) -> String {
    format!(
        "{SYSTEM_PROMPT}\n\n{CONVENTIONS}\n\nJSON Schema:\n{:#}\n\nPROMPT_VERSION={prompt_version}",
        json_schema()
    )
}

/// Build the full message list for one report.
pub fn build_prompt(report_text: &str, prompt_version: &str) -> Vec<ChatMessage> {
    let examples = few_shot_examples();
    let mut messages = Vec::with_capacity(examples.len() * 2 + 2);

    messages.push(ChatMessage::system(system_message(prompt_version)));
    for example in examples {
        messages.push(ChatMessage::user(example.report));
        messages.push(ChatMessage::assistant(example.extraction.to_string()));
    }
    messages.push(ChatMessage::user(report_text));

    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::postprocess::normalize;
    use crate::pipeline::prompt_templates::Role;
    use crate::pipeline::schema::{validate, validate_extraction};

    #[test]
    fn layout_is_system_pairs_then_report() {
        let messages = build_prompt("CT head: no acute findings.", PROMPT_VERSION);
        let pairs = few_shot_examples().len();
        assert_eq!(messages.len(), 2 + pairs * 2);
        assert_eq!(messages[0].role, Role::System);
        for i in 0..pairs {
            assert_eq!(messages[1 + 2 * i].role, Role::User);
            assert_eq!(messages[2 + 2 * i].role, Role::Assistant);
        }
        let last = messages.last().unwrap();
        assert_eq!(last.role, Role::User);
        assert_eq!(last.content, "CT head: no acute findings.");
    }

    #[test]
    fn system_message_embeds_schema_and_version() {
        let system = system_message("v7");
        assert!(system.contains("millimeters"));
        assert!(system.contains("\"title\": \"ReportExtraction\""));
        assert!(system.ends_with("PROMPT_VERSION=v7"));
    }

    #[test]
    fn every_exemplar_validates() {
        for example in few_shot_examples() {
            if let Err(e) = validate(&example.extraction) {
                panic!("exemplar invalid: {e}");
            }
        }
    }

    #[test]
    fn exemplars_are_already_normalized() {
        for example in few_shot_examples() {
            let extraction = validate_extraction(example.extraction.clone()).unwrap();
            assert_eq!(normalize(extraction.clone()), extraction);
        }
    }

    #[test]
    fn assistant_turns_are_json() {
        let messages = build_prompt("x", PROMPT_VERSION);
        for msg in messages.iter().filter(|m| m.role == Role::Assistant) {
            let value: Value = serde_json::from_str(&msg.content).unwrap();
            assert!(value.get("lesions").is_some());
        }
    }
}
