//! Feature vectorization.
//!
//! Maps a [`BusinessProfileRequest`] onto the fixed-order numeric vector the
//! model was trained on. Every substitution (imputation) is declared in the
//! artifact schema; nothing here invents a default.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::LazyLock;

use crate::models::{AttributeValue, BusinessProfileRequest};

static FEATURE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("valid feature name regex"));

/// Training-time transform of a single feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeatureKind {
    /// Identity transform on a JSON number.
    Numeric,
    /// `true -> 1.0`, `false -> 0.0`.
    Boolean,
    /// Fixed category -> code mapping. Keys are lowercase.
    Categorical { categories: BTreeMap<String, f64> },
}

impl FeatureKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            FeatureKind::Numeric => "numeric",
            FeatureKind::Boolean => "boolean",
            FeatureKind::Categorical { .. } => "categorical",
        }
    }

    fn expected_wire_type(&self) -> &'static str {
        match self {
            FeatureKind::Numeric => "number",
            FeatureKind::Boolean => "boolean",
            FeatureKind::Categorical { .. } => "string",
        }
    }
}

/// One schema entry: name, transform and optional imputation value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSpec {
    pub name: String,
    #[serde(flatten)]
    pub kind: FeatureKind,
    /// Raw value substituted when the attribute is absent or `null`.
    /// Features without one are required.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impute: Option<AttributeValue>,
}

impl FeatureSpec {
    pub fn is_optional(&self) -> bool {
        self.impute.is_some()
    }

    /// Applies the training-time transform to a raw attribute value.
    pub fn encode(&self, value: &AttributeValue) -> Result<f64, ValidationReason> {
        let encoded = match (&self.kind, value) {
            (FeatureKind::Numeric, AttributeValue::Number(n)) => *n,
            (FeatureKind::Boolean, AttributeValue::Boolean(b)) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            (FeatureKind::Categorical { categories }, AttributeValue::Text(raw)) => {
                let normalized = raw.trim().to_lowercase();
                *categories
                    .get(&normalized)
                    .ok_or_else(|| ValidationReason::UnknownCategory { value: raw.clone() })?
            }
            (kind, other) => {
                return Err(ValidationReason::TypeMismatch {
                    expected: kind.expected_wire_type(),
                    found: other.type_name(),
                })
            }
        };

        if !encoded.is_finite() {
            return Err(ValidationReason::NotFinite);
        }
        Ok(encoded)
    }
}

/// Ordered feature schema embedded in the model artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSchema {
    features: Vec<FeatureSpec>,
    names: HashSet<String>,
}

impl FeatureSchema {
    /// Validates and builds a schema.
    ///
    /// Names must be unique snake_case identifiers, categorical vocabularies
    /// non-empty with lowercase keys and finite codes, and every imputation
    /// value must encode through its own feature's transform.
    pub fn new(features: Vec<FeatureSpec>) -> Result<Self, SchemaError> {
        let mut names = HashSet::with_capacity(features.len());

        for spec in &features {
            if !FEATURE_NAME.is_match(&spec.name) {
                return Err(SchemaError::InvalidName(spec.name.clone()));
            }
            if !names.insert(spec.name.clone()) {
                return Err(SchemaError::DuplicateFeature(spec.name.clone()));
            }

            if let FeatureKind::Categorical { categories } = &spec.kind {
                if categories.is_empty() {
                    return Err(SchemaError::EmptyVocabulary(spec.name.clone()));
                }
                for (category, code) in categories {
                    if category.trim() != category || category.to_lowercase() != *category {
                        return Err(SchemaError::UnnormalizedCategory {
                            feature: spec.name.clone(),
                            category: category.clone(),
                        });
                    }
                    if !code.is_finite() {
                        return Err(SchemaError::NonFiniteCode {
                            feature: spec.name.clone(),
                            category: category.clone(),
                        });
                    }
                }
            }

            if let Some(impute) = &spec.impute {
                spec.encode(impute)
                    .map_err(|reason| SchemaError::InvalidImpute {
                        feature: spec.name.clone(),
                        reason,
                    })?;
            }
        }

        Ok(Self { features, names })
    }

    pub fn features(&self) -> &[FeatureSpec] {
        &self.features
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.features.iter().map(|f| f.name.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

/// What to do with request attributes the schema does not know.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownFields {
    #[default]
    Reject,
    Ignore,
}

/// Fixed-order numeric encoding of a business profile.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector(Vec<f64>);

impl FeatureVector {
    pub fn new(values: Vec<f64>) -> Self {
        Self(values)
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Why a single field failed validation.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationReason {
    Missing,
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
    UnknownCategory {
        value: String,
    },
    NotFinite,
    UnknownField,
}

impl fmt::Display for ValidationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationReason::Missing => write!(f, "required field is missing"),
            ValidationReason::TypeMismatch { expected, found } => {
                write!(f, "expected {}, found {}", expected, found)
            }
            ValidationReason::UnknownCategory { value } => {
                write!(f, "unknown category '{}'", value)
            }
            ValidationReason::NotFinite => write!(f, "value must be a finite number"),
            ValidationReason::UnknownField => write!(f, "field is not part of the model schema"),
        }
    }
}

/// Defects of the feature schema embedded in an artifact.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaError {
    #[error("feature name '{0}' is not a snake_case identifier")]
    InvalidName(String),
    #[error("duplicate feature '{0}'")]
    DuplicateFeature(String),
    #[error("categorical feature '{0}' has no categories")]
    EmptyVocabulary(String),
    #[error("category '{category}' of '{feature}' must be trimmed lowercase")]
    UnnormalizedCategory { feature: String, category: String },
    #[error("category '{category}' of '{feature}' has a non-finite code")]
    NonFiniteCode { feature: String, category: String },
    #[error("imputation value of '{feature}' is invalid: {reason}")]
    InvalidImpute {
        feature: String,
        reason: ValidationReason,
    },
}

/// A caller-supplied field failed schema checks.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid field '{field}': {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: ValidationReason,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: ValidationReason) -> Self {
        Self {
            field: field.into(),
            reason,
        }
    }
}

/// Encodes `profile` in schema order.
///
/// Fails on the first offending field in schema order. Unknown attributes are
/// checked after all schema features when `unknown` is [`UnknownFields::Reject`].
pub fn vectorize(
    profile: &BusinessProfileRequest,
    schema: &FeatureSchema,
    unknown: UnknownFields,
) -> Result<FeatureVector, ValidationError> {
    let mut values = Vec::with_capacity(schema.len());

    for spec in schema.features() {
        let encoded = match (profile.get(&spec.name), &spec.impute) {
            (Some(value), _) => spec.encode(value),
            (None, Some(default)) => spec.encode(default),
            (None, None) => Err(ValidationReason::Missing),
        };
        values.push(encoded.map_err(|reason| ValidationError::new(&spec.name, reason))?);
    }

    if unknown == UnknownFields::Reject {
        if let Some(name) = profile.attribute_names().find(|n| !schema.contains(n)) {
            return Err(ValidationError::new(name, ValidationReason::UnknownField));
        }
    }

    Ok(FeatureVector(values))
}
