//! Evaluator: scores a directory of predicted extractions against references.
//!
//! Documents are read loosely as JSON values so that partially valid or
//! older-schema files can still be scored.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Default tolerance for the size hit rate (mm).
pub const DEFAULT_TOLERANCE_MM: f64 = 2.0;

/// Lesion fields counted for slot presence.
const SLOTS: &[&str] = &["body_site", "node_station", "finding_type"];

#[derive(Error, Debug)]
pub enum EvalError {
    #[error("Prediction and reference files must match by name (only in predictions: {only_in_predictions:?}; only in references: {only_in_references:?})")]
    FilenameMismatch {
        only_in_predictions: Vec<String>,
        only_in_references: Vec<String>,
    },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Aggregate metrics over all document pairs.
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationReport {
    pub documents: usize,
    /// Agreement on `summary.metastasis_present`; missing counts as false.
    pub doc_accuracy_mets_present: f64,
    /// Mean absolute size error over paired lesions; NaN (null in JSON) without sized pairs.
    pub size_mae_mm: f64,
    pub tolerance_mm: f64,
    /// Share of sized pairs within `tolerance_mm`; `None` without sized pairs.
    pub size_within_tolerance: Option<f64>,
    pub matched_pairs: usize,
    pub sized_pairs: usize,
    /// `<slot>_pred` / `<slot>_true` presence counts plus `doc_total` / `doc_correct`.
    pub counts: BTreeMap<String, u64>,
}

/// (finding_type, lowercased body_site, lowercased node_station)
type MatchKey = (Option<String>, String, String);

fn lower_field(lesion: &Value, field: &str) -> String {
    lesion
        .get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_lowercase()
}

fn match_key(lesion: &Value) -> MatchKey {
    (
        lesion
            .get("finding_type")
            .and_then(Value::as_str)
            .map(str::to_string),
        lower_field(lesion, "body_site"),
        lower_field(lesion, "node_station"),
    )
}

fn lesions(doc: &Value) -> &[Value] {
    doc.get("lesions")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn metastasis_present(doc: &Value) -> bool {
    doc.get("summary")
        .and_then(|s| s.get("metastasis_present"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn size_mm(lesion: &Value) -> Option<f64> {
    lesion.get("size_mm").and_then(Value::as_f64)
}

/// Greedy one-to-one pairing in predicted order: each prediction takes the
/// first still-unmatched reference with an equal key.
pub fn pair_lesions<'a>(pred: &'a [Value], refs: &'a [Value]) -> Vec<(&'a Value, &'a Value)> {
    let ref_keys: Vec<MatchKey> = refs.iter().map(match_key).collect();
    let mut used = vec![false; refs.len()];
    let mut pairs = Vec::new();

    for p in pred {
        let key = match_key(p);
        let hit = ref_keys
            .iter()
            .enumerate()
            .find(|(i, k)| !used[*i] && **k == key)
            .map(|(i, _)| i);
        if let Some(i) = hit {
            used[i] = true;
            pairs.push((p, &refs[i]));
        }
    }
    pairs
}

/// Absolute size differences of pairs where both sides carry a size.
fn size_errors(pairs: &[(&Value, &Value)]) -> Vec<f64> {
    pairs
        .iter()
        .filter_map(|(p, r)| Some((size_mm(p)? - size_mm(r)?).abs()))
        .collect()
}

fn slot_present(lesion: &Value, slot: &str) -> bool {
    match lesion.get(slot) {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.is_empty() && s != "unknown",
        Some(_) => true,
    }
}

fn load_dir_json(dir: &Path) -> Result<BTreeMap<String, Value>, EvalError> {
    let io_err = |source: std::io::Error| EvalError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut docs = BTreeMap::new();
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };
        let text = fs::read_to_string(&path).map_err(|source| EvalError::Io {
            path: path.clone(),
            source,
        })?;
        let value = serde_json::from_str(&text).map_err(|source| EvalError::Json {
            path: path.clone(),
            source,
        })?;
        docs.insert(name, value);
    }
    Ok(docs)
}

/// Score every prediction file against the reference file of the same name.
pub fn evaluate(pred_dir: &Path, ref_dir: &Path, tolerance_mm: f64) -> Result<EvaluationReport, EvalError> {
    let predictions = load_dir_json(pred_dir)?;
    let references = load_dir_json(ref_dir)?;

    let pred_names: BTreeSet<&String> = predictions.keys().collect();
    let ref_names: BTreeSet<&String> = references.keys().collect();
    if pred_names != ref_names {
        return Err(EvalError::FilenameMismatch {
            only_in_predictions: pred_names.difference(&ref_names).map(|s| s.to_string()).collect(),
            only_in_references: ref_names.difference(&pred_names).map(|s| s.to_string()).collect(),
        });
    }

    let mut counts: BTreeMap<String, u64> = BTreeMap::new();
    let mut bump = |key: String, by: u64| *counts.entry(key).or_default() += by;

    let mut errors = Vec::new();
    let mut matched_pairs = 0;

    for (name, pred) in &predictions {
        let reference = &references[name];

        bump("doc_total".into(), 1);
        bump(
            "doc_correct".into(),
            u64::from(metastasis_present(pred) == metastasis_present(reference)),
        );

        let pairs = pair_lesions(lesions(pred), lesions(reference));
        matched_pairs += pairs.len();
        errors.extend(size_errors(&pairs));

        for slot in SLOTS {
            let have = |doc: &Value| lesions(doc).iter().filter(|l| slot_present(l, slot)).count() as u64;
            bump(format!("{slot}_pred"), have(pred));
            bump(format!("{slot}_true"), have(reference));
        }
    }

    let documents = predictions.len();
    let doc_correct = counts.get("doc_correct").copied().unwrap_or(0);
    let sized_pairs = errors.len();
    let hits = errors.iter().filter(|e| **e <= tolerance_mm).count();

    let report = EvaluationReport {
        documents,
        doc_accuracy_mets_present: doc_correct as f64 / documents as f64,
        size_mae_mm: if sized_pairs == 0 {
            f64::NAN
        } else {
            errors.iter().sum::<f64>() / sized_pairs as f64
        },
        tolerance_mm,
        size_within_tolerance: (sized_pairs > 0).then(|| hits as f64 / sized_pairs as f64),
        matched_pairs,
        sized_pairs,
        counts,
    };

    tracing::info!(
        documents,
        matched_pairs,
        sized_pairs,
        accuracy = report.doc_accuracy_mets_present,
        "Evaluation complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write(dir: &Path, name: &str, value: &Value) {
        fs::write(dir.join(name), value.to_string()).unwrap();
    }

    fn lesion(ft: &str, site: &str, size: Option<i64>) -> Value {
        json!({"lesion_id": "x", "finding_type": ft, "body_site": site, "size_mm": size})
    }

    #[test]
    fn first_unmatched_reference_wins() {
        let pred = vec![lesion("ln", "mediastinum", Some(10))];
        let refs = vec![
            lesion("ln", "Mediastinum", Some(13)),
            lesion("ln", "mediastinum", Some(10)),
        ];
        let pairs = pair_lesions(&pred, &refs);
        assert_eq!(pairs.len(), 1);
        let errors = size_errors(&pairs);
        assert_eq!(errors, vec![3.0]);
    }

    #[test]
    fn pairing_is_one_to_one() {
        let pred = vec![lesion("met", "liver", Some(5)), lesion("met", "liver", Some(7))];
        let refs = vec![lesion("met", "liver", Some(5))];
        assert_eq!(pair_lesions(&pred, &refs).len(), 1);
    }

    #[test]
    fn node_station_is_part_of_the_key() {
        let mut a = lesion("ln", "mediastinum", None);
        a["node_station"] = json!("4R");
        let mut b = lesion("ln", "mediastinum", None);
        b["node_station"] = json!("7");
        assert!(pair_lesions(&[a.clone()], &[b]).is_empty());
        let mut c = lesion("ln", "mediastinum", None);
        c["node_station"] = json!("4r");
        assert_eq!(pair_lesions(&[a], &[c]).len(), 1);
    }

    #[test]
    fn mismatched_filenames_fail_before_metrics() {
        let pred = tempfile::tempdir().unwrap();
        let refs = tempfile::tempdir().unwrap();
        write(pred.path(), "a.json", &json!({"lesions": []}));
        write(refs.path(), "b.json", &json!({"lesions": []}));

        match evaluate(pred.path(), refs.path(), DEFAULT_TOLERANCE_MM) {
            Err(EvalError::FilenameMismatch {
                only_in_predictions,
                only_in_references,
            }) => {
                assert_eq!(only_in_predictions, vec!["a.json".to_string()]);
                assert_eq!(only_in_references, vec!["b.json".to_string()]);
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
    }

    #[test]
    fn computes_metrics_over_directories() {
        let pred = tempfile::tempdir().unwrap();
        let refs = tempfile::tempdir().unwrap();

        write(
            pred.path(),
            "r1.json",
            &json!({"summary": {"metastasis_present": true}, "lesions": [
                lesion("met", "liver", Some(10)),
                lesion("primary", "lung", Some(30)),
            ]}),
        );
        write(
            refs.path(),
            "r1.json",
            &json!({"summary": {"metastasis_present": true}, "lesions": [
                lesion("met", "Liver", Some(13)),
                lesion("primary", "lung", Some(29)),
            ]}),
        );
        // Missing flag on the prediction side counts as false.
        write(pred.path(), "r2.json", &json!({"lesions": [lesion("benign", "kidney", None)]}));
        write(
            refs.path(),
            "r2.json",
            &json!({"summary": {"metastasis_present": true}, "lesions": [lesion("benign", "kidney", Some(4))]}),
        );
        fs::write(pred.path().join("notes.txt"), "ignored").unwrap();

        let report = evaluate(pred.path(), refs.path(), DEFAULT_TOLERANCE_MM).unwrap();
        assert_eq!(report.documents, 2);
        assert_eq!(report.doc_accuracy_mets_present, 0.5);
        assert_eq!(report.matched_pairs, 3);
        assert_eq!(report.sized_pairs, 2);
        assert_eq!(report.size_mae_mm, 2.0);
        assert_eq!(report.size_within_tolerance, Some(0.5));
        assert_eq!(report.counts["body_site_pred"], 3);
        assert_eq!(report.counts["node_station_true"], 0);
        assert_eq!(report.counts["doc_correct"], 1);
    }

    #[test]
    fn no_sized_pairs_gives_nan_and_none() {
        let pred = tempfile::tempdir().unwrap();
        let refs = tempfile::tempdir().unwrap();
        write(pred.path(), "r.json", &json!({"lesions": [lesion("met", "bone", None)]}));
        write(refs.path(), "r.json", &json!({"lesions": [lesion("met", "bone", None)]}));

        let report = evaluate(pred.path(), refs.path(), 2.0).unwrap();
        assert!(report.size_mae_mm.is_nan());
        assert_eq!(report.size_within_tolerance, None);
        assert_eq!(report.doc_accuracy_mets_present, 1.0);

        let json = serde_json::to_value(&report).unwrap();
        assert!(json["size_mae_mm"].is_null());
    }

    #[test]
    fn unknown_slot_values_are_absent() {
        let l = json!({"finding_type": "unknown", "body_site": "", "node_station": null});
        for slot in SLOTS {
            assert!(!slot_present(&l, slot));
        }
    }
}
