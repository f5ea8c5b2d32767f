//! Canonical recognition result model.
//!
//! Every worker response, whatever field names it used, is normalized into
//! `RecognitionResult` (see `ingest`). Nothing downstream reads raw worker
//! JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::JobId;
use crate::model::ModelType;

/// Axis-aligned box in drawing/pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// One recognized object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    /// Confidence in [0, 1].
    pub confidence: f64,
    pub bbox: Option<BoundingBox>,
    pub layer: Option<String>,
}

/// Aggregated view of one drawing layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerAnalysis {
    pub layer: String,
    pub object_count: u32,
    pub recognized_types: Vec<String>,
    pub confidence: f64,
}

/// A measurement read off the drawing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dimension {
    pub label: Option<String>,
    pub value: f64,
    pub unit: Option<String>,
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingSeverity {
    Info,
    Warning,
    Critical,
}

impl FindingSeverity {
    /// Lenient parse of the severity spellings workers have used.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "critical" | "error" | "high" | "fail" | "failed" | "violation" => Self::Critical,
            "warning" | "warn" | "medium" | "moderate" => Self::Warning,
            _ => Self::Info,
        }
    }
}

/// Outcome of one compliance rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceFinding {
    pub rule: String,
    pub severity: FindingSeverity,
    pub message: String,
    pub passed: bool,
}

/// Aggregate statistics over a result.
///
/// Confidence aggregates are 0 when there are no detections.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResultStatistics {
    pub count: usize,
    pub confidence_min: f64,
    pub confidence_avg: f64,
    pub confidence_max: f64,
    pub processing_time_ms: u64,
    pub model_version: Option<String>,
}

impl ResultStatistics {
    pub fn from_detections(
        detections: &[Detection],
        processing_time_ms: u64,
        model_version: Option<String>,
    ) -> Self {
        let confidences: Vec<f64> = detections
            .iter()
            .map(|d| d.confidence)
            .filter(|c| c.is_finite())
            .collect();

        let (min, avg, max) = if confidences.is_empty() {
            (0.0, 0.0, 0.0)
        } else {
            let min = confidences.iter().copied().fold(f64::INFINITY, f64::min);
            let max = confidences.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let avg = confidences.iter().sum::<f64>() / confidences.len() as f64;
            (min, avg, max)
        };

        Self {
            count: detections.len(),
            confidence_min: min,
            confidence_avg: avg,
            confidence_max: max,
            processing_time_ms,
            model_version,
        }
    }
}

/// The canonical result stored on a completed job.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RecognitionResult {
    pub detections: Vec<Detection>,
    pub extracted_text: Option<String>,
    pub layers: Vec<LayerAnalysis>,
    pub dimensions: Vec<Dimension>,
    pub compliance: Vec<ComplianceFinding>,
    pub statistics: ResultStatistics,
}

impl RecognitionResult {
    /// Distinct detection labels, sorted.
    pub fn recognized_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.detections.iter().map(|d| d.label.clone()).collect();
        types.sort();
        types.dedup();
        types
    }

    pub fn failed_checks(&self) -> impl Iterator<Item = &ComplianceFinding> {
        self.compliance.iter().filter(|f| !f.passed)
    }
}

const TEXT_EXCERPT_CHARS: usize = 2_000;

/// Digest of a result written back onto the subject record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub job_id: JobId,
    pub model_type: ModelType,
    pub detection_count: usize,
    pub recognized_types: Vec<String>,
    pub layers: Vec<LayerAnalysis>,
    pub text_excerpt: Option<String>,
    pub failed_compliance_checks: usize,
    pub average_confidence: f64,
    pub model_version: Option<String>,
    pub processed_at: DateTime<Utc>,
}

impl ResultSummary {
    pub fn from_result(
        job_id: JobId,
        model_type: ModelType,
        result: &RecognitionResult,
        processed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            model_type,
            detection_count: result.statistics.count,
            recognized_types: result.recognized_types(),
            layers: result.layers.clone(),
            text_excerpt: result
                .extracted_text
                .as_ref()
                .map(|t| t.chars().take(TEXT_EXCERPT_CHARS).collect()),
            failed_compliance_checks: result.failed_checks().count(),
            average_confidence: result.statistics.confidence_avg,
            model_version: result.statistics.model_version.clone(),
            processed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn detection(label: &str, confidence: f64) -> Detection {
        Detection {
            label: label.to_string(),
            confidence,
            bbox: None,
            layer: None,
        }
    }

    #[test]
    fn empty_detections_yield_zero_confidence() {
        let stats = ResultStatistics::from_detections(&[], 120, None);

        assert_eq!(stats.count, 0);
        assert_eq!(stats.confidence_min, 0.0);
        assert_eq!(stats.confidence_avg, 0.0);
        assert_eq!(stats.confidence_max, 0.0);
        assert_eq!(stats.processing_time_ms, 120);
    }

    #[test]
    fn statistics_aggregate_confidence() {
        let detections = vec![detection("door", 0.5), detection("window", 0.9), detection("door", 0.7)];
        let stats = ResultStatistics::from_detections(&detections, 0, Some("v2".into()));

        assert_eq!(stats.count, 3);
        assert_eq!(stats.confidence_min, 0.5);
        assert_eq!(stats.confidence_max, 0.9);
        assert!((stats.confidence_avg - 0.7).abs() < 1e-9);
    }

    #[test]
    fn summary_truncates_text_and_counts_failures() {
        let result = RecognitionResult {
            detections: vec![detection("door", 0.8), detection("door", 0.6)],
            extracted_text: Some("x".repeat(5_000)),
            compliance: vec![
                ComplianceFinding {
                    rule: "egress-width".into(),
                    severity: FindingSeverity::Critical,
                    message: "too narrow".into(),
                    passed: false,
                },
                ComplianceFinding {
                    rule: "stair-rise".into(),
                    severity: FindingSeverity::Info,
                    message: "ok".into(),
                    passed: true,
                },
            ],
            ..Default::default()
        };

        let summary =
            ResultSummary::from_result(JobId::new(), ModelType::FullAnalysis, &result, Utc::now());

        assert_eq!(summary.recognized_types, vec!["door".to_string()]);
        assert_eq!(summary.text_excerpt.unwrap().len(), TEXT_EXCERPT_CHARS);
        assert_eq!(summary.failed_compliance_checks, 1);
    }

    proptest! {
        #[test]
        fn confidence_aggregates_are_ordered_and_finite(
            confidences in prop::collection::vec(0.0f64..=1.0, 0..50)
        ) {
            let detections: Vec<Detection> =
                confidences.iter().map(|c| detection("x", *c)).collect();
            let stats = ResultStatistics::from_detections(&detections, 0, None);

            prop_assert!(stats.confidence_min.is_finite());
            prop_assert!(stats.confidence_avg.is_finite());
            prop_assert!(stats.confidence_max.is_finite());
            prop_assert!(stats.confidence_min <= stats.confidence_avg + 1e-12);
            prop_assert!(stats.confidence_avg <= stats.confidence_max + 1e-12);
        }
    }
}
