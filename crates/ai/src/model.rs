//! Recognition model catalogue and job priority.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use plansight_core::{DomainError, DomainResult};

/// Recognition models served by the worker fleet.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    /// Symbol / object detection on drawings (doors, fixtures, equipment).
    SymbolDetection,
    /// OCR over title blocks, annotations and schedules.
    TextExtraction,
    /// Per-layer analysis of CAD drawings.
    LayerAnalysis,
    /// Dimension line and measurement extraction.
    DimensionExtraction,
    /// Rule-based compliance checking on top of detections.
    ComplianceCheck,
    /// All of the above in a single pass.
    FullAnalysis,
}

const RASTER: &[&str] = &["image/png", "image/jpeg", "image/tiff", "image/webp"];
const PDF: &[&str] = &["application/pdf"];
const CAD: &[&str] = &[
    "image/vnd.dwg",
    "application/acad",
    "application/dxf",
    "image/vnd.dxf",
];

impl ModelType {
    pub const ALL: [ModelType; 6] = [
        ModelType::SymbolDetection,
        ModelType::TextExtraction,
        ModelType::LayerAnalysis,
        ModelType::DimensionExtraction,
        ModelType::ComplianceCheck,
        ModelType::FullAnalysis,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::SymbolDetection => "symbol_detection",
            ModelType::TextExtraction => "text_extraction",
            ModelType::LayerAnalysis => "layer_analysis",
            ModelType::DimensionExtraction => "dimension_extraction",
            ModelType::ComplianceCheck => "compliance_check",
            ModelType::FullAnalysis => "full_analysis",
        }
    }

    /// Default worker endpoint path (appended to the worker base URL).
    pub fn default_endpoint(&self) -> &'static str {
        match self {
            ModelType::SymbolDetection => "/api/v1/detect/symbols",
            ModelType::TextExtraction => "/api/v1/ocr",
            ModelType::LayerAnalysis => "/api/v1/analyze/layers",
            ModelType::DimensionExtraction => "/api/v1/extract/dimensions",
            ModelType::ComplianceCheck => "/api/v1/compliance",
            ModelType::FullAnalysis => "/api/v1/analyze",
        }
    }

    /// Whether this model can process a subject of the given MIME type.
    pub fn accepts_mime(&self, mime_type: &str) -> bool {
        let mime = mime_type.trim().to_ascii_lowercase();
        let mime = mime.split(';').next().unwrap_or_default().trim();
        let in_set = |set: &[&str]| set.contains(&mime);

        match self {
            ModelType::LayerAnalysis => in_set(CAD) || in_set(PDF),
            ModelType::TextExtraction | ModelType::DimensionExtraction => {
                in_set(RASTER) || in_set(PDF)
            }
            ModelType::SymbolDetection | ModelType::ComplianceCheck | ModelType::FullAnalysis => {
                in_set(RASTER) || in_set(PDF) || in_set(CAD)
            }
        }
    }

    /// Rejects a model/format pairing the worker cannot process.
    pub fn check_compatible(&self, mime_type: &str) -> DomainResult<()> {
        if self.accepts_mime(mime_type) {
            Ok(())
        } else {
            Err(DomainError::validation(format!(
                "model '{}' does not support subject format '{}'",
                self.as_str(),
                mime_type
            )))
        }
    }
}

impl core::fmt::Display for ModelType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModelType::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown model type: {s}")))
    }
}

/// Scheduling priority: 1 (critical) through 5 (low). Lower runs first.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const CRITICAL: Priority = Priority(1);
    pub const HIGH: Priority = Priority(2);
    pub const NORMAL: Priority = Priority(3);
    pub const MODERATE: Priority = Priority(4);
    pub const LOW: Priority = Priority(5);

    pub const MIN_VALUE: u8 = 1;
    pub const MAX_VALUE: u8 = 5;

    pub fn new(value: u8) -> DomainResult<Self> {
        if (Self::MIN_VALUE..=Self::MAX_VALUE).contains(&value) {
            Ok(Self(value))
        } else {
            Err(DomainError::validation(format!(
                "priority must be between {} and {}, got {value}",
                Self::MIN_VALUE,
                Self::MAX_VALUE
            )))
        }
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl TryFrom<u8> for Priority {
    type Error = DomainError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(value: Priority) -> Self {
        value.0
    }
}

impl core::fmt::Display for Priority {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_analysis_rejects_raster_images() {
        assert!(ModelType::LayerAnalysis.accepts_mime("image/vnd.dwg"));
        assert!(ModelType::LayerAnalysis.accepts_mime("application/pdf"));
        assert!(matches!(
            ModelType::LayerAnalysis.check_compatible("image/png"),
            Err(DomainError::Validation(_))
        ));
    }

    #[test]
    fn mime_matching_ignores_case_and_parameters() {
        assert!(ModelType::TextExtraction.accepts_mime("Application/PDF; charset=binary"));
        assert!(!ModelType::TextExtraction.accepts_mime("application/dxf"));
    }

    #[test]
    fn model_type_parses_from_wire_name() {
        for model in ModelType::ALL {
            assert_eq!(model.as_str().parse::<ModelType>().unwrap(), model);
        }
        assert!("segmentation".parse::<ModelType>().is_err());
    }

    #[test]
    fn priority_domain_is_bounded() {
        assert!(Priority::new(0).is_err());
        assert!(Priority::new(6).is_err());
        assert_eq!(Priority::new(1).unwrap(), Priority::CRITICAL);
        assert!(Priority::CRITICAL < Priority::LOW);
        assert_eq!(Priority::default(), Priority::NORMAL);
    }

    #[test]
    fn priority_deserialization_validates_range() {
        let ok: Priority = serde_json::from_str("2").unwrap();
        assert_eq!(ok, Priority::HIGH);
        assert!(serde_json::from_str::<Priority>("9").is_err());
    }
}
