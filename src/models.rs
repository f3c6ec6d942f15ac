use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::artifact::ModelHandle;
use crate::features::{FeatureKind, ValidationError, ValidationReason};
use crate::inference::{RiskBand, RiskFactor, RiskPrediction, RiskThresholds};

// ============ Request Models ============

/// A single typed attribute value of a business profile.
///
/// The wire format only allows flat scalars; nested arrays and objects are
/// rejected while decoding the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Boolean(bool),
    Number(f64),
    Text(String),
}

impl AttributeValue {
    /// Name of the JSON type, used in validation messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            AttributeValue::Boolean(_) => "boolean",
            AttributeValue::Number(_) => "number",
            AttributeValue::Text(_) => "string",
        }
    }
}

/// A business profile decoded from the wire payload.
///
/// Attributes map to `None` when the caller sent an explicit `null`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BusinessProfileRequest {
    attributes: BTreeMap<String, Option<AttributeValue>>,
}

/// Reasons a raw payload cannot become a [`BusinessProfileRequest`].
#[derive(Debug, thiserror::Error)]
pub enum ProfileDecodeError {
    #[error("request body must be a JSON object, found {0}")]
    NotAnObject(&'static str),
    #[error(transparent)]
    Field(#[from] ValidationError),
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl BusinessProfileRequest {
    /// Decodes a raw JSON payload into a typed profile.
    ///
    /// The payload must be an object whose values are scalars or `null`.
    pub fn from_json(payload: Value) -> Result<Self, ProfileDecodeError> {
        let object = match payload {
            Value::Object(object) => object,
            other => return Err(ProfileDecodeError::NotAnObject(json_type_name(&other))),
        };

        let mut attributes = BTreeMap::new();
        for (name, value) in object {
            let decoded = match value {
                Value::Null => None,
                Value::Bool(b) => Some(AttributeValue::Boolean(b)),
                Value::Number(n) => match n.as_f64() {
                    Some(f) => Some(AttributeValue::Number(f)),
                    None => {
                        return Err(ValidationError::new(name, ValidationReason::NotFinite).into())
                    }
                },
                Value::String(s) => Some(AttributeValue::Text(s)),
                ref nested @ (Value::Array(_) | Value::Object(_)) => {
                    let found = json_type_name(nested);
                    return Err(ValidationError::new(
                        name,
                        ValidationReason::TypeMismatch {
                            expected: "scalar",
                            found,
                        },
                    )
                    .into());
                }
            };
            attributes.insert(name, decoded);
        }

        Ok(Self { attributes })
    }

    /// Builds a profile from already-typed attributes.
    pub fn from_attributes<I, K>(attributes: I) -> Self
    where
        I: IntoIterator<Item = (K, AttributeValue)>,
        K: Into<String>,
    {
        Self {
            attributes: attributes
                .into_iter()
                .map(|(k, v)| (k.into(), Some(v)))
                .collect(),
        }
    }

    /// Returns the value for `name`, treating an explicit `null` as absent.
    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name).and_then(Option::as_ref)
    }

    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

/// Body of `POST /predict/batch`.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchPredictionRequest {
    /// Raw records; each one is decoded and validated independently.
    pub records: Vec<Value>,
}

// ============ Response Models ============

/// Scoring outcome for one profile, without request-level metadata.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredRecord {
    /// Model probability of the business being high risk, in [0, 1].
    pub probability: f64,
    /// Probability as a rounded percentage (0-100).
    pub score: u8,
    pub label: RiskBand,
    /// Human-readable band name, e.g. "Medium Risk".
    pub risk_level: &'static str,
    /// Key risk drivers, strongest first.
    pub factors: Vec<RiskFactor>,
}

impl From<&RiskPrediction> for ScoredRecord {
    fn from(prediction: &RiskPrediction) -> Self {
        Self {
            probability: prediction.probability,
            score: (prediction.probability * 100.0).round().clamp(0.0, 100.0) as u8,
            label: prediction.label,
            risk_level: prediction.label.display_name(),
            factors: prediction.factors.clone(),
        }
    }
}

/// Response of `POST /predict`.
#[derive(Debug, Clone, Serialize)]
pub struct PredictionResponse {
    pub request_id: Uuid,
    #[serde(flatten)]
    pub result: ScoredRecord,
    pub model_version: String,
    pub artifact_sha256: String,
    pub scored_at: DateTime<Utc>,
}

impl PredictionResponse {
    pub fn new(request_id: Uuid, prediction: &RiskPrediction, model: &ModelHandle) -> Self {
        Self {
            request_id,
            result: ScoredRecord::from(prediction),
            model_version: prediction.model_version.clone(),
            artifact_sha256: model.sha256().to_string(),
            scored_at: Utc::now(),
        }
    }
}

/// Per-record outcome inside a batch response.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum BatchItemResult {
    Scored {
        index: usize,
        prediction: ScoredRecord,
    },
    Rejected {
        index: usize,
        error: ErrorBody,
    },
}

impl BatchItemResult {
    pub fn is_scored(&self) -> bool {
        matches!(self, BatchItemResult::Scored { .. })
    }
}

/// Response of `POST /predict/batch`.
#[derive(Debug, Clone, Serialize)]
pub struct BatchPredictionResponse {
    pub request_id: Uuid,
    pub model_version: String,
    pub artifact_sha256: String,
    pub scored_at: DateTime<Utc>,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub results: Vec<BatchItemResult>,
}

impl BatchPredictionResponse {
    pub fn new(request_id: Uuid, model: &ModelHandle, results: Vec<BatchItemResult>) -> Self {
        let succeeded = results.iter().filter(|r| r.is_scored()).count();
        Self {
            request_id,
            model_version: model.model_version().to_string(),
            artifact_sha256: model.sha256().to_string(),
            scored_at: Utc::now(),
            total: results.len(),
            succeeded,
            failed: results.len() - succeeded,
            results,
        }
    }
}

/// Structured error returned for every failed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

/// Response of `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// One of "starting", "ready" or "failed".
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Schema entry exposed by `GET /model`.
#[derive(Debug, Clone, Serialize)]
pub struct FeatureInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub optional: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub categories: Option<Vec<String>>,
}

/// Response of `GET /model`: everything an auditor needs to pin a prediction
/// to the artifact that produced it.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfoResponse {
    pub model_version: String,
    pub trained_at: DateTime<Utc>,
    pub format_version: u32,
    pub objective: String,
    pub artifact_sha256: String,
    pub num_trees: usize,
    pub thresholds: RiskThresholds,
    pub features: Vec<FeatureInfo>,
}

impl From<&ModelHandle> for ModelInfoResponse {
    fn from(model: &ModelHandle) -> Self {
        let features = model
            .schema()
            .features()
            .iter()
            .map(|spec| FeatureInfo {
                name: spec.name.clone(),
                kind: spec.kind.type_name(),
                optional: spec.is_optional(),
                categories: match &spec.kind {
                    FeatureKind::Categorical { categories } => {
                        Some(categories.keys().cloned().collect())
                    }
                    _ => None,
                },
            })
            .collect();

        Self {
            model_version: model.model_version().to_string(),
            trained_at: model.trained_at(),
            format_version: model.format_version(),
            objective: model.objective().to_string(),
            artifact_sha256: model.sha256().to_string(),
            num_trees: model.forest().num_trees(),
            thresholds: *model.thresholds(),
            features,
        }
    }
}
