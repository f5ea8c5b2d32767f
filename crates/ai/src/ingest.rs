//! Worker response normalization.
//!
//! Recognition workers have shipped several response shapes over time
//! (`detections` vs `objects` vs `predictions`, `bbox` as an object or as a
//! `[x1, y1, x2, y2]` array, confidences as fractions or percentages, ...).
//! This module is the only place that knows about those aliases; it maps any
//! accepted shape onto `RecognitionResult`.
//!
//! Malformed entries inside an otherwise valid response are skipped rather
//! than failing the whole ingestion.

use std::borrow::Cow;
use std::collections::BTreeMap;

use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

use crate::result::{
    BoundingBox, ComplianceFinding, Detection, Dimension, FindingSeverity, LayerAnalysis,
    RecognitionResult, ResultStatistics,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IngestError {
    #[error("worker response is not a JSON object (got {0})")]
    NotAnObject(&'static str),
}

const ENVELOPE_KEYS: &[&str] = &["result", "results", "data"];
const DETECTION_KEYS: &[&str] = &["detections", "objects", "detected_objects", "detectedObjects", "predictions"];
const LABEL_KEYS: &[&str] = &["label", "class", "class_name", "className", "type", "category", "name"];
const CONFIDENCE_KEYS: &[&str] = &["confidence", "score", "probability", "conf"];
const BBOX_KEYS: &[&str] = &["bbox", "bounding_box", "boundingBox", "box"];
const LAYER_KEYS: &[&str] = &["layer", "layer_name", "layerName"];
const TEXT_KEYS: &[&str] = &["extracted_text", "extractedText", "text", "ocr_text", "ocrText", "full_text"];
const TEXT_BLOCK_KEYS: &[&str] = &["text_blocks", "textBlocks", "ocr_results", "lines"];
const LAYERS_KEYS: &[&str] = &["layers", "layer_analysis", "layerAnalysis", "layer_results"];
const DIMENSION_KEYS: &[&str] = &["dimensions", "measurements", "dims"];
const COMPLIANCE_KEYS: &[&str] = &[
    "compliance",
    "compliance_findings",
    "complianceFindings",
    "compliance_results",
    "violations",
];
const PROCESSING_MS_KEYS: &[&str] = &["processing_time_ms", "processingTimeMs", "inference_time_ms", "duration_ms"];
const PROCESSING_SECS_KEYS: &[&str] = &["processing_time_seconds", "processing_time_s", "processingTime"];
const MODEL_VERSION_KEYS: &[&str] = &["model_version", "modelVersion", "version"];

/// Normalize a raw worker response body into the canonical result.
pub fn normalize_response(raw: &JsonValue) -> Result<RecognitionResult, IngestError> {
    let root = raw.as_object().ok_or(IngestError::NotAnObject(kind_of(raw)))?;
    let body = unwrap_envelope(root);
    let body: &Map<String, JsonValue> = &body;

    let detections: Vec<Detection> = field(body, DETECTION_KEYS)
        .and_then(JsonValue::as_array)
        .map(|items| items.iter().filter_map(parse_detection).collect())
        .unwrap_or_default();

    let extracted_text = parse_text(body);

    let layers = match field(body, LAYERS_KEYS) {
        Some(value) => parse_layers(value),
        None => derive_layers(&detections),
    };

    let dimensions = field(body, DIMENSION_KEYS)
        .and_then(JsonValue::as_array)
        .map(|items| items.iter().filter_map(parse_dimension).collect())
        .unwrap_or_default();

    let compliance = parse_compliance(body);

    let processing_time_ms = field(body, PROCESSING_MS_KEYS)
        .and_then(as_f64)
        .or_else(|| field(body, PROCESSING_SECS_KEYS).and_then(as_f64).map(|s| s * 1000.0))
        .filter(|ms| ms.is_finite() && *ms >= 0.0)
        .map(|ms| ms.round() as u64)
        .unwrap_or(0);

    let model_version = field(body, MODEL_VERSION_KEYS).and_then(as_string);

    let statistics = ResultStatistics::from_detections(&detections, processing_time_ms, model_version);

    Ok(RecognitionResult {
        detections,
        extracted_text,
        layers,
        dimensions,
        compliance,
        statistics,
    })
}

fn kind_of(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// `{ "result": { ... } }` style wrappers.
///
/// Fields beside the envelope (`model_version`, `text`, ...) are kept unless
/// the wrapped object carries its own value for them.
fn unwrap_envelope(root: &Map<String, JsonValue>) -> Cow<'_, Map<String, JsonValue>> {
    if DETECTION_KEYS.iter().any(|k| root.contains_key(*k)) {
        return Cow::Borrowed(root);
    }
    let Some(inner) = ENVELOPE_KEYS
        .iter()
        .find_map(|k| root.get(*k).and_then(JsonValue::as_object))
    else {
        return Cow::Borrowed(root);
    };

    let mut merged = inner.clone();
    for (key, value) in root {
        if !ENVELOPE_KEYS.contains(&key.as_str()) && !merged.contains_key(key) {
            merged.insert(key.clone(), value.clone());
        }
    }
    Cow::Owned(merged)
}

fn field<'a>(obj: &'a Map<String, JsonValue>, keys: &[&str]) -> Option<&'a JsonValue> {
    keys.iter()
        .find_map(|k| obj.get(*k).filter(|v| !v.is_null()))
}

fn as_f64(value: &JsonValue) -> Option<f64> {
    let parsed: Option<f64> = match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

fn as_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_string_list(value: &JsonValue) -> Vec<String> {
    match value {
        JsonValue::Array(items) => items.iter().filter_map(as_string).collect(),
        JsonValue::String(s) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

/// Fractions pass through; values in (1, 100] are read as percentages.
fn normalize_confidence(raw: f64) -> f64 {
    let value = if raw > 1.0 && raw <= 100.0 { raw / 100.0 } else { raw };
    value.clamp(0.0, 1.0)
}

fn parse_detection(value: &JsonValue) -> Option<Detection> {
    let obj = value.as_object()?;
    let label = field(obj, LABEL_KEYS).and_then(as_string)?;
    let confidence = field(obj, CONFIDENCE_KEYS)
        .and_then(as_f64)
        .map(normalize_confidence)
        .unwrap_or(0.0);

    Some(Detection {
        label,
        confidence,
        bbox: field(obj, BBOX_KEYS).and_then(parse_bbox),
        layer: field(obj, LAYER_KEYS).and_then(as_string),
    })
}

fn parse_bbox(value: &JsonValue) -> Option<BoundingBox> {
    match value {
        JsonValue::Array(items) if items.len() == 4 => {
            let v: Vec<f64> = items.iter().filter_map(as_f64).collect();
            if v.len() != 4 {
                return None;
            }
            corners(v[0], v[1], v[2], v[3])
        }
        JsonValue::Object(obj) => {
            let num = |keys: &[&str]| field(obj, keys).and_then(as_f64);
            if let (Some(x), Some(y), Some(w), Some(h)) = (
                num(&["x", "left"]),
                num(&["y", "top"]),
                num(&["width", "w"]),
                num(&["height", "h"]),
            ) {
                return (w >= 0.0 && h >= 0.0).then_some(BoundingBox { x, y, width: w, height: h });
            }
            match (
                num(&["x1", "xmin", "x_min"]),
                num(&["y1", "ymin", "y_min"]),
                num(&["x2", "xmax", "x_max"]),
                num(&["y2", "ymax", "y_max"]),
            ) {
                (Some(x1), Some(y1), Some(x2), Some(y2)) => corners(x1, y1, x2, y2),
                _ => None,
            }
        }
        _ => None,
    }
}

fn corners(x1: f64, y1: f64, x2: f64, y2: f64) -> Option<BoundingBox> {
    (x2 >= x1 && y2 >= y1).then_some(BoundingBox {
        x: x1,
        y: y1,
        width: x2 - x1,
        height: y2 - y1,
    })
}

fn parse_text(body: &Map<String, JsonValue>) -> Option<String> {
    if let Some(text) = field(body, TEXT_KEYS).and_then(JsonValue::as_str) {
        let text = text.trim();
        if !text.is_empty() {
            return Some(text.to_string());
        }
    }

    let blocks = field(body, TEXT_BLOCK_KEYS).and_then(JsonValue::as_array)?;
    let lines: Vec<&str> = blocks
        .iter()
        .filter_map(|b| match b {
            JsonValue::String(s) => Some(s.as_str()),
            JsonValue::Object(o) => field(o, &["text", "content", "value"]).and_then(JsonValue::as_str),
            _ => None,
        })
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    (!lines.is_empty()).then(|| lines.join("\n"))
}

fn parse_layers(value: &JsonValue) -> Vec<LayerAnalysis> {
    match value {
        JsonValue::Array(items) => items
            .iter()
            .filter_map(|item| {
                let obj = item.as_object()?;
                let name = field(obj, &["layer", "name", "layer_name", "layerName"]).and_then(as_string)?;
                Some(parse_layer_body(name, obj))
            })
            .collect(),
        // `{ "A-WALL": { ... }, "A-DOOR": { ... } }`
        JsonValue::Object(map) => map
            .iter()
            .filter_map(|(name, body)| Some(parse_layer_body(name.clone(), body.as_object()?)))
            .collect(),
        _ => Vec::new(),
    }
}

fn parse_layer_body(layer: String, obj: &Map<String, JsonValue>) -> LayerAnalysis {
    let object_count = match field(obj, &["object_count", "objectCount", "count", "objects"]) {
        Some(JsonValue::Array(items)) => items.len() as u32,
        Some(other) => as_f64(other).filter(|n| *n >= 0.0).map(|n| n as u32).unwrap_or(0),
        None => 0,
    };
    let recognized_types = field(obj, &["recognized_types", "recognizedTypes", "types", "classes"])
        .map(as_string_list)
        .unwrap_or_default();
    let confidence = field(obj, &["confidence", "avg_confidence", "score"])
        .and_then(as_f64)
        .map(normalize_confidence)
        .unwrap_or(0.0);

    LayerAnalysis {
        layer,
        object_count,
        recognized_types,
        confidence,
    }
}

/// Group detections by their `layer` attribute when the worker sent no layer block.
fn derive_layers(detections: &[Detection]) -> Vec<LayerAnalysis> {
    let mut groups: BTreeMap<&str, Vec<&Detection>> = BTreeMap::new();
    for d in detections {
        if let Some(layer) = d.layer.as_deref() {
            groups.entry(layer).or_default().push(d);
        }
    }

    groups
        .into_iter()
        .map(|(layer, members)| {
            let mut types: Vec<String> = members.iter().map(|d| d.label.clone()).collect();
            types.sort();
            types.dedup();
            let confidence = members.iter().map(|d| d.confidence).sum::<f64>() / members.len() as f64;
            LayerAnalysis {
                layer: layer.to_string(),
                object_count: members.len() as u32,
                recognized_types: types,
                confidence,
            }
        })
        .collect()
}

fn parse_dimension(value: &JsonValue) -> Option<Dimension> {
    match value {
        JsonValue::Number(_) => Some(Dimension {
            label: None,
            value: as_f64(value)?,
            unit: None,
            confidence: None,
        }),
        JsonValue::Object(obj) => Some(Dimension {
            label: field(obj, &["label", "name", "type"]).and_then(as_string),
            value: field(obj, &["value", "measurement", "length"]).and_then(as_f64)?,
            unit: field(obj, &["unit", "units"]).and_then(as_string),
            confidence: field(obj, CONFIDENCE_KEYS).and_then(as_f64).map(normalize_confidence),
        }),
        _ => None,
    }
}

fn parse_compliance(body: &Map<String, JsonValue>) -> Vec<ComplianceFinding> {
    let Some((key, value)) = COMPLIANCE_KEYS
        .iter()
        .find_map(|k| body.get(*k).filter(|v| !v.is_null()).map(|v| (*k, v)))
    else {
        return Vec::new();
    };

    // Entries listed under "violations" failed unless they say otherwise.
    let default_passed = key != "violations";

    let items = match value {
        JsonValue::Array(items) => items.as_slice(),
        JsonValue::Object(obj) => match field(obj, &["findings", "results", "checks"]) {
            Some(JsonValue::Array(items)) => items.as_slice(),
            _ => return Vec::new(),
        },
        _ => return Vec::new(),
    };

    items
        .iter()
        .filter_map(|item| {
            let obj = item.as_object()?;
            let rule = field(obj, &["rule", "rule_id", "ruleId", "code", "check"]).and_then(as_string)?;
            let passed = match field(obj, &["passed", "compliant", "status"]) {
                Some(JsonValue::Bool(b)) => *b,
                Some(JsonValue::String(s)) => matches!(
                    s.to_ascii_lowercase().as_str(),
                    "pass" | "passed" | "ok" | "compliant"
                ),
                _ => default_passed,
            };
            let severity = field(obj, &["severity", "level"])
                .and_then(JsonValue::as_str)
                .map(FindingSeverity::parse_lenient)
                .unwrap_or(if passed { FindingSeverity::Info } else { FindingSeverity::Warning });
            let message = field(obj, &["message", "description", "detail"])
                .and_then(as_string)
                .unwrap_or_default();

            Some(ComplianceFinding {
                rule,
                severity,
                message,
                passed,
            })
        })
        .collect()
}
