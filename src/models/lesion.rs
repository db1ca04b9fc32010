use std::fmt;

use serde::{Deserialize, Serialize};

use super::enums::{Certainty, FindingType, Laterality, MeasureAxis};
use crate::pipeline::schema::{SchemaError, SchemaViolation};

/// A lesion size in whole millimeters. Negative values are unrepresentable.
///
/// Deserializes from any integral JSON number, so `12.0` reads as 12 mm just
/// as the schema's `integer` type accepts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "serde_json::Number", into = "i64")]
pub struct SizeMm(u32);

impl SizeMm {
    /// Validate a raw millimeter value.
    pub fn new(mm: i64) -> Result<Self, SchemaError> {
        u32::try_from(mm).map(Self).map_err(|_| {
            SchemaError::single(SchemaViolation::new(
                "/size_mm",
                format!("size_mm must be a non-negative integer number of millimeters, got {mm}"),
            ))
        })
    }

    /// Clamp an arbitrary computed value into range (negatives become zero).
    pub fn clamped(mm: i64) -> Self {
        Self(mm.clamp(0, i64::from(u32::MAX)) as u32)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl TryFrom<i64> for SizeMm {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value).map_err(|e| e.to_string())
    }
}

impl TryFrom<serde_json::Number> for SizeMm {
    type Error = String;

    fn try_from(value: serde_json::Number) -> Result<Self, Self::Error> {
        if let Some(mm) = value.as_i64() {
            return Self::try_from(mm);
        }
        match value.as_f64() {
            Some(mm) if mm.fract() == 0.0 && mm >= i64::MIN as f64 && mm <= i64::MAX as f64 => {
                Self::try_from(mm as i64)
            }
            _ => Err(format!("size_mm must be a whole number of millimeters, got {value}")),
        }
    }
}

impl From<SizeMm> for i64 {
    fn from(size: SizeMm) -> Self {
        i64::from(size.0)
    }
}

impl fmt::Display for SizeMm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} mm", self.0)
    }
}

fn default_laterality() -> Option<Laterality> {
    Some(Laterality::Unknown)
}

fn default_measure_axis() -> Option<MeasureAxis> {
    Some(MeasureAxis::Unknown)
}

fn default_certainty() -> Option<Certainty> {
    Some(Certainty::Present)
}

/// One discrete clinical finding extracted from a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lesion {
    /// Stable identifier within the report (`L1`, `L2`, ...).
    pub lesion_id: String,
    #[serde(default)]
    pub finding_type: FindingType,
    /// Organ or site as written, e.g. "lung upper lobe".
    pub body_site: String,
    /// Target organ when the finding is a metastasis.
    #[serde(default)]
    pub metastatic_site: Option<String>,
    #[serde(default)]
    pub is_node: bool,
    /// Lymph node station, e.g. "4R".
    #[serde(default)]
    pub node_station: Option<String>,
    #[serde(default = "default_laterality")]
    pub laterality: Option<Laterality>,
    #[serde(default = "default_measure_axis")]
    pub measure_axis: Option<MeasureAxis>,
    #[serde(default)]
    pub size_mm: Option<SizeMm>,
    #[serde(default = "default_certainty")]
    pub certainty: Option<Certainty>,
    /// Interval change note, e.g. "increased from 12 to 18 mm since 06/2023".
    #[serde(default)]
    pub date_relative: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
    /// Verbatim supporting text from the report.
    #[serde(default)]
    pub evidence_span: Option<String>,
}

impl Lesion {
    pub fn new(lesion_id: &str, finding_type: FindingType, body_site: &str) -> Self {
        Self {
            lesion_id: lesion_id.to_string(),
            finding_type,
            body_site: body_site.to_string(),
            metastatic_site: None,
            is_node: false,
            node_station: None,
            laterality: default_laterality(),
            measure_axis: default_measure_axis(),
            size_mm: None,
            certainty: default_certainty(),
            date_relative: None,
            note: None,
            evidence_span: None,
        }
    }

    /// Set the size, rejecting negative millimeter values.
    pub fn with_size_mm(mut self, mm: i64) -> Result<Self, SchemaError> {
        self.size_mm = Some(SizeMm::new(mm)?);
        Ok(self)
    }

    pub fn with_evidence(mut self, span: &str) -> Self {
        self.evidence_span = Some(span.to_string());
        self
    }

    pub fn with_node_station(mut self, station: &str) -> Self {
        self.is_node = true;
        self.node_station = Some(station.to_string());
        self
    }

    pub fn with_laterality(mut self, laterality: Laterality) -> Self {
        self.laterality = Some(laterality);
        self
    }

    pub fn with_measure_axis(mut self, axis: MeasureAxis) -> Self {
        self.measure_axis = Some(axis);
        self
    }

    pub fn with_certainty(mut self, certainty: Certainty) -> Self {
        self.certainty = Some(certainty);
        self
    }

    pub fn with_metastatic_site(mut self, site: &str) -> Self {
        self.metastatic_site = Some(site.to_string());
        self
    }

    pub fn is_metastasis(&self) -> bool {
        self.finding_type == FindingType::Metastasis
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_size_is_rejected() {
        let result = Lesion::new("L1", FindingType::Primary, "lung").with_size_mm(-1);
        let err = result.unwrap_err();
        assert_eq!(err.violations.len(), 1);
        assert_eq!(err.violations[0].path, "/size_mm");
    }

    #[test]
    fn zero_size_is_accepted() {
        let lesion = Lesion::new("L1", FindingType::Primary, "lung")
            .with_size_mm(0)
            .unwrap();
        assert_eq!(lesion.size_mm.map(SizeMm::get), Some(0));
    }

    #[test]
    fn negative_size_fails_deserialization() {
        let json = r#"{"lesion_id": "L1", "body_site": "liver", "size_mm": -4}"#;
        assert!(serde_json::from_str::<Lesion>(json).is_err());
    }

    #[test]
    fn integral_float_size_is_accepted() {
        let json = r#"{"lesion_id": "L1", "body_site": "liver", "size_mm": 12.0}"#;
        let lesion: Lesion = serde_json::from_str(json).unwrap();
        assert_eq!(lesion.size_mm.map(SizeMm::get), Some(12));
    }

    #[test]
    fn fractional_or_out_of_range_size_is_rejected() {
        for size in ["12.5", "-3.0", "1e12"] {
            let json = format!(r#"{{"lesion_id": "L1", "body_site": "liver", "size_mm": {size}}}"#);
            assert!(serde_json::from_str::<Lesion>(&json).is_err(), "{size} accepted");
        }
    }

    #[test]
    fn missing_optional_fields_take_defaults() {
        let lesion: Lesion =
            serde_json::from_str(r#"{"lesion_id": "L2", "body_site": "mediastinum"}"#).unwrap();
        assert_eq!(lesion.finding_type, FindingType::Indeterminate);
        assert_eq!(lesion.laterality, Some(Laterality::Unknown));
        assert_eq!(lesion.measure_axis, Some(MeasureAxis::Unknown));
        assert_eq!(lesion.certainty, Some(Certainty::Present));
        assert!(!lesion.is_node);
        assert!(lesion.size_mm.is_none());
    }

    #[test]
    fn size_serializes_as_plain_integer() {
        let lesion = Lesion::new("L1", FindingType::LymphNode, "mediastinum")
            .with_node_station("4R")
            .with_size_mm(12)
            .unwrap();
        let value = serde_json::to_value(&lesion).unwrap();
        assert_eq!(value["size_mm"], 12);
        assert_eq!(value["finding_type"], "ln");
        assert_eq!(value["is_node"], true);
    }

    #[test]
    fn clamped_maps_negative_to_zero() {
        assert_eq!(SizeMm::clamped(-7).get(), 0);
        assert_eq!(SizeMm::clamped(25).get(), 25);
    }
}
