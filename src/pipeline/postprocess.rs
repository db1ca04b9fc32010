use std::sync::LazyLock;

use regex::Regex;

use crate::models::{Lesion, ReportExtraction, SizeMm};

/// Sizes above this many "mm" are never reinterpreted as centimeters.
const CM_CONFUSION_MAX: u32 = 10;

static CM_MEASUREMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*(?:cm|centimet(?:er|re)s?)\b").expect("static regex")
});

/// Numerals stated in centimeters within `text`.
fn cm_numerals(text: &str) -> Vec<f64> {
    CM_MEASUREMENT
        .captures_iter(text)
        .filter_map(|caps| caps.get(1)?.as_str().parse().ok())
        .collect()
}

/// The evidence states centimeters but `size_mm` still holds a small raw numeral.
///
/// A size that already equals ten times a stated cm value is taken as
/// converted, which keeps the rule idempotent.
fn needs_cm_conversion(lesion: &Lesion) -> bool {
    let (Some(size), Some(evidence)) = (lesion.size_mm, lesion.evidence_span.as_deref()) else {
        return false;
    };
    let mm = size.get();
    if mm > CM_CONFUSION_MAX {
        return false;
    }
    let numerals = cm_numerals(evidence);
    let mm = f64::from(mm);
    !numerals.is_empty() && !numerals.iter().any(|n| (n * 10.0 - mm).abs() < 1e-6)
}

/// Normalize units and recompute derived summary fields. Pure and idempotent.
pub fn normalize(mut extraction: ReportExtraction) -> ReportExtraction {
    for lesion in &mut extraction.lesions {
        if needs_cm_conversion(lesion) {
            if let Some(size) = lesion.size_mm {
                let converted = SizeMm::clamped(i64::from(size.get()) * 10);
                tracing::debug!(
                    lesion_id = %lesion.lesion_id,
                    from = size.get(),
                    to = converted.get(),
                    "Converted centimeter size to millimeters"
                );
                lesion.size_mm = Some(converted);
            }
        }
    }

    extraction.summary.total_lesion_count = Some(extraction.lesions.len() as u32);
    extraction.summary.metastasis_present =
        Some(extraction.lesions.iter().any(Lesion::is_metastasis));
    extraction
}
