use std::fmt;

use serde::{Deserialize, Serialize};

/// Error returned when a string is not one of an enum's wire values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {field} value '{value}'")]
pub struct InvalidEnumValue {
    pub field: String,
    pub value: String,
}

/// Macro to generate enum with as_str + std::str::FromStr pattern.
///
/// The wire strings double as the enumeration values of the JSON Schema,
/// so `ALL` must list every variant.
macro_rules! str_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $s)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [&'static str] = &[$($s),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = InvalidEnumValue;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(InvalidEnumValue {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

str_enum!(
    /// Clinical category of a lesion.
    FindingType {
        Primary => "primary",
        LymphNode => "ln",
        Metastasis => "met",
        Indeterminate => "indeterminate",
        Benign => "benign",
    }
);

str_enum!(Laterality {
    Left => "left",
    Right => "right",
    Midline => "midline",
    Bilateral => "bilateral",
    Unknown => "unknown",
});

str_enum!(
    /// Which diameter a size refers to. Nodes are conventionally sized on the short axis.
    MeasureAxis {
        Longest => "longest",
        ShortAxis => "short_axis",
        Perpendicular => "perpendicular",
        Unknown => "unknown",
    }
);

str_enum!(Certainty {
    Present => "present",
    Possible => "possible",
    Unlikely => "unlikely",
});

str_enum!(Modality {
    Ct => "CT",
    PetCt => "PETCT",
    Mri => "MRI",
    Xr => "XR",
    Us => "US",
    Unknown => "UNKNOWN",
});

str_enum!(
    /// Scanned region: chest, abdomen, pelvis, chest/abdomen/pelvis, whole body.
    BodyRegion {
        Chest => "C",
        Abdomen => "A",
        Pelvis => "P",
        ChestAbdomenPelvis => "CAP",
        WholeBody => "WB",
        Unknown => "UNKNOWN",
    }
);

impl Default for FindingType {
    fn default() -> Self {
        Self::Indeterminate
    }
}

impl Default for Laterality {
    fn default() -> Self {
        Self::Unknown
    }
}

impl Default for MeasureAxis {
    fn default() -> Self {
        Self::Unknown
    }
}

impl Default for Certainty {
    fn default() -> Self {
        Self::Present
    }
}

impl Default for Modality {
    fn default() -> Self {
        Self::Unknown
    }
}

impl Default for BodyRegion {
    fn default() -> Self {
        Self::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn finding_type_round_trip() {
        for (variant, s) in [
            (FindingType::Primary, "primary"),
            (FindingType::LymphNode, "ln"),
            (FindingType::Metastasis, "met"),
            (FindingType::Indeterminate, "indeterminate"),
            (FindingType::Benign, "benign"),
        ] {
            assert_eq!(variant.as_str(), s);
            assert_eq!(FindingType::from_str(s).unwrap(), variant);
        }
    }

    #[test]
    fn modality_uses_uppercase_codes() {
        assert_eq!(Modality::PetCt.as_str(), "PETCT");
        assert_eq!(serde_json::to_string(&Modality::Mri).unwrap(), "\"MRI\"");
        let parsed: Modality = serde_json::from_str("\"US\"").unwrap();
        assert_eq!(parsed, Modality::Us);
    }

    #[test]
    fn body_region_serde_matches_as_str() {
        for s in BodyRegion::ALL {
            let parsed = BodyRegion::from_str(s).unwrap();
            let json = serde_json::to_string(&parsed).unwrap();
            assert_eq!(json, format!("\"{s}\""));
        }
    }

    #[test]
    fn all_lists_cover_every_variant() {
        assert_eq!(FindingType::ALL.len(), 5);
        assert_eq!(Laterality::ALL.len(), 5);
        assert_eq!(MeasureAxis::ALL.len(), 4);
        assert_eq!(Certainty::ALL.len(), 3);
        assert_eq!(Modality::ALL.len(), 6);
        assert_eq!(BodyRegion::ALL.len(), 6);
    }

    #[test]
    fn invalid_value_names_field() {
        let err = Laterality::from_str("sideways").unwrap_err();
        assert_eq!(err.field, "Laterality");
        assert_eq!(err.value, "sideways");
        assert!(err.to_string().contains("sideways"));
    }

    #[test]
    fn defaults_match_unknown_conventions() {
        assert_eq!(FindingType::default(), FindingType::Indeterminate);
        assert_eq!(Laterality::default(), Laterality::Unknown);
        assert_eq!(MeasureAxis::default(), MeasureAxis::Unknown);
        assert_eq!(Certainty::default(), Certainty::Present);
        assert_eq!(Modality::default(), Modality::Unknown);
        assert_eq!(BodyRegion::default(), BodyRegion::Unknown);
    }
}
