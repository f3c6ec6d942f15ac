//! Tree-ensemble scoring and risk banding.

use serde::{Deserialize, Serialize};

use crate::artifact::ModelHandle;
use crate::features::FeatureVector;

/// Risk category derived from the model probability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskBand {
    Low,
    Medium,
    High,
}

impl RiskBand {
    pub fn display_name(&self) -> &'static str {
        match self {
            RiskBand::Low => "Low Risk",
            RiskBand::Medium => "Medium Risk",
            RiskBand::High => "High Risk",
        }
    }
}

/// Band boundaries shipped inside the artifact.
///
/// `p <= low_max` is low risk, `p >= high_min` is high risk, anything in
/// between is medium.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskThresholds {
    pub low_max: f64,
    pub high_min: f64,
}

impl RiskThresholds {
    pub fn validate(&self) -> bool {
        self.low_max.is_finite()
            && self.high_min.is_finite()
            && 0.0 <= self.low_max
            && self.low_max < self.high_min
            && self.high_min <= 1.0
    }

    pub fn band(&self, probability: f64) -> RiskBand {
        if probability <= self.low_max {
            RiskBand::Low
        } else if probability >= self.high_min {
            RiskBand::High
        } else {
            RiskBand::Medium
        }
    }
}

/// One regression tree in XGBoost's flat array layout.
///
/// Node `i` is a leaf when `left_children[i] == -1`. Internal nodes send a
/// row left when `(x[split_indices[i]] as f32) < split_conditions[i]`.
/// Thresholds are single precision, as XGBoost trains and stores them.
///
/// `base_weights` optionally carries the expected value of every node and
/// only feeds [`Tree::contributions`]. Without it internal nodes count as 0.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Tree {
    left_children: Vec<i32>,
    right_children: Vec<i32>,
    split_indices: Vec<u32>,
    split_conditions: Vec<f32>,
    leaf_values: Vec<f64>,
    #[serde(default)]
    base_weights: Vec<f64>,
}

impl Tree {
    /// Structural checks that make [`Tree::leaf_value`] panic-free and
    /// terminating: children point strictly forward and in range.
    pub(crate) fn validate(&self, num_features: usize) -> Result<(), String> {
        let n = self.left_children.len();
        if n == 0 {
            return Err("tree has no nodes".to_string());
        }
        if self.right_children.len() != n
            || self.split_indices.len() != n
            || self.split_conditions.len() != n
            || self.leaf_values.len() != n
        {
            return Err(format!("tree arrays disagree on node count {}", n));
        }
        if !self.base_weights.is_empty() && self.base_weights.len() != n {
            return Err(format!(
                "tree has {} base weights for {} nodes",
                self.base_weights.len(),
                n
            ));
        }
        if self.base_weights.iter().any(|w| !w.is_finite()) {
            return Err("tree has a non-finite base weight".to_string());
        }

        for node in 0..n {
            let (left, right) = (self.left_children[node], self.right_children[node]);
            if left == -1 && right == -1 {
                if !self.leaf_values[node].is_finite() {
                    return Err(format!("leaf {} has a non-finite value", node));
                }
                continue;
            }
            for child in [left, right] {
                if child < 0 || child as usize <= node || child as usize >= n {
                    return Err(format!("node {} has invalid child {}", node, child));
                }
            }
            if self.split_indices[node] as usize >= num_features {
                return Err(format!(
                    "node {} splits on feature {} but the schema has {}",
                    node, self.split_indices[node], num_features
                ));
            }
            if !self.split_conditions[node].is_finite() {
                return Err(format!("node {} has a non-finite split condition", node));
            }
        }
        Ok(())
    }

    pub fn num_nodes(&self) -> usize {
        self.left_children.len()
    }

    fn is_leaf(&self, node: usize) -> bool {
        self.left_children[node] < 0
    }

    fn next_node(&self, node: usize, x: &[f64]) -> usize {
        let feature = self.split_indices[node] as usize;
        if (x[feature] as f32) < self.split_conditions[node] {
            self.left_children[node] as usize
        } else {
            self.right_children[node] as usize
        }
    }

    /// Expected value of a node: the leaf value for leaves, the base weight
    /// (or 0) for internal nodes.
    fn node_value(&self, node: usize) -> f64 {
        if self.is_leaf(node) {
            self.leaf_values[node]
        } else {
            self.base_weights.get(node).copied().unwrap_or(0.0)
        }
    }

    fn leaf_value(&self, x: &[f64]) -> f64 {
        let mut node = 0usize;
        while !self.is_leaf(node) {
            node = self.next_node(node, x);
        }
        self.leaf_values[node]
    }

    /// Path attribution: every split on the decision path credits its
    /// feature with the change in node value it caused. Adds the credits to
    /// `out` and returns the root value, so that root value plus credits
    /// equals the leaf value.
    pub(crate) fn contributions(&self, x: &[f64], out: &mut [f64]) -> f64 {
        let mut node = 0usize;
        while !self.is_leaf(node) {
            let child = self.next_node(node, x);
            out[self.split_indices[node] as usize] +=
                self.node_value(child) - self.node_value(node);
            node = child;
        }
        self.node_value(0)
    }
}

/// Additive decomposition of a margin over the features.
#[derive(Debug, Clone, PartialEq)]
pub struct Contributions {
    /// Base margin plus the root value of every tree.
    pub bias: f64,
    /// One entry per schema feature, in schema order.
    pub per_feature: Vec<f64>,
}

/// Additive tree ensemble with a logistic link.
#[derive(Debug, Clone, PartialEq)]
pub struct Forest {
    base_margin: f64,
    trees: Vec<Tree>,
}

impl Forest {
    /// `base_score` is in probability space, as XGBoost stores it.
    pub(crate) fn new(base_score: f64, trees: Vec<Tree>) -> Self {
        let p = base_score.clamp(1e-7, 1.0 - 1e-7);
        Self {
            base_margin: (p / (1.0 - p)).ln(),
            trees,
        }
    }

    pub fn num_trees(&self) -> usize {
        self.trees.len()
    }

    /// Raw margin: base margin plus every tree's leaf, summed in tree order.
    pub fn margin(&self, x: &[f64]) -> f64 {
        self.trees
            .iter()
            .fold(self.base_margin, |acc, tree| acc + tree.leaf_value(x))
    }

    /// Splits the margin of `x` into a bias and per-feature contributions.
    /// `bias + per_feature.sum()` equals [`Forest::margin`] up to rounding.
    pub fn contributions(&self, x: &[f64]) -> Contributions {
        let mut per_feature = vec![0.0; x.len()];
        let bias = self
            .trees
            .iter()
            .fold(self.base_margin, |acc, tree| {
                acc + tree.contributions(x, &mut per_feature)
            });
        Contributions { bias, per_feature }
    }
}

fn sigmoid(margin: f64) -> f64 {
    1.0 / (1.0 + (-margin).exp())
}

/// Number of risk drivers reported with each prediction.
pub const MAX_FACTORS: usize = 3;

/// Whether a feature pushed the margin towards or away from high risk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorDirection {
    IncreasesRisk,
    DecreasesRisk,
}

/// One key risk driver of a prediction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskFactor {
    pub feature: String,
    /// Contribution to the margin (log-odds).
    pub contribution: f64,
    pub direction: FactorDirection,
}

/// Outcome of scoring one feature vector.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskPrediction {
    pub probability: f64,
    pub label: RiskBand,
    pub model_version: String,
    /// Largest non-zero contributions by magnitude, ties in schema order.
    pub factors: Vec<RiskFactor>,
}

fn top_factors(contributions: &Contributions, model: &ModelHandle) -> Vec<RiskFactor> {
    let mut ranked: Vec<(&str, f64)> = model
        .schema()
        .names()
        .zip(contributions.per_feature.iter().copied())
        .filter(|(_, c)| *c != 0.0)
        .collect();
    // stable: equal magnitudes keep schema order
    ranked.sort_by(|a, b| b.1.abs().total_cmp(&a.1.abs()));

    ranked
        .into_iter()
        .take(MAX_FACTORS)
        .map(|(name, contribution)| RiskFactor {
            feature: name.to_string(),
            contribution,
            direction: if contribution > 0.0 {
                FactorDirection::IncreasesRisk
            } else {
                FactorDirection::DecreasesRisk
            },
        })
        .collect()
}

/// Invariant violations inside the engine. Each one means the code and the
/// deployed artifact disagree, not that the caller did something wrong.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InternalScoringError {
    #[error("feature vector has {actual} values but the model schema has {expected}")]
    FeatureCountMismatch { expected: usize, actual: usize },
    #[error("feature '{name}' at position {index} is not finite")]
    NonFiniteFeature { index: usize, name: String },
    #[error("model produced a non-finite margin")]
    NonFiniteMargin,
}

/// Scores `vector` against `model`. Pure: identical inputs give bit-identical
/// outputs.
pub fn predict(
    vector: &FeatureVector,
    model: &ModelHandle,
) -> Result<RiskPrediction, InternalScoringError> {
    let schema = model.schema();
    if vector.len() != schema.len() {
        return Err(InternalScoringError::FeatureCountMismatch {
            expected: schema.len(),
            actual: vector.len(),
        });
    }
    if let Some((index, name)) = vector
        .as_slice()
        .iter()
        .zip(schema.names())
        .enumerate()
        .find(|(_, (value, _))| !value.is_finite())
        .map(|(index, (_, name))| (index, name))
    {
        return Err(InternalScoringError::NonFiniteFeature {
            index,
            name: name.to_string(),
        });
    }

    let margin = model.forest().margin(vector.as_slice());
    if !margin.is_finite() {
        return Err(InternalScoringError::NonFiniteMargin);
    }

    let contributions = model.forest().contributions(vector.as_slice());
    let probability = sigmoid(margin).clamp(0.0, 1.0);
    Ok(RiskPrediction {
        probability,
        label: model.thresholds().band(probability),
        model_version: model.model_version().to_string(),
        factors: top_factors(&contributions, model),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{ArtifactPins, ModelHandle};

    const ARTIFACT: &str = r#"{
        "format_version": 1,
        "model_version": "unit-1",
        "trained_at": "2024-06-01T12:00:00Z",
        "objective": "binary:logistic",
        "base_score": 0.5,
        "thresholds": {"low_max": 0.3, "high_min": 0.7},
        "features": [
            {"name": "revenue", "type": "numeric"},
            {"name": "defaulted", "type": "boolean"}
        ],
        "trees": [
            {
                "left_children": [1, -1, -1],
                "right_children": [2, -1, -1],
                "split_indices": [1, 0, 0],
                "split_conditions": [0.5, 0.0, 0.0],
                "leaf_values": [0.0, -1.0, 1.5]
            },
            {
                "left_children": [1, -1, -1],
                "right_children": [2, -1, -1],
                "split_indices": [0, 0, 0],
                "split_conditions": [1000.0, 0.0, 0.0],
                "leaf_values": [0.0, 0.5, -0.25]
            }
        ]
    }"#;

    fn model() -> ModelHandle {
        ModelHandle::from_bytes(ARTIFACT.as_bytes(), &ArtifactPins::default()).unwrap()
    }

    #[test]
    fn test_margin_sums_leaves() {
        let m = model();
        // defaulted -> 1.5, revenue >= 1000 -> -0.25
        let margin = m.forest().margin(&[5000.0, 1.0]);
        assert!((margin - 1.25).abs() < 1e-12);
        // not defaulted -> -1.0, revenue < 1000 -> 0.5
        let margin = m.forest().margin(&[10.0, 0.0]);
        assert!((margin + 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_predict_bands() {
        let m = model();

        let high = predict(&FeatureVector::new(vec![5000.0, 1.0]), &m).unwrap();
        assert!((high.probability - sigmoid(1.25)).abs() < 1e-12);
        assert_eq!(high.label, RiskBand::High);
        assert_eq!(high.model_version, "unit-1");

        let low = predict(&FeatureVector::new(vec![5000.0, 0.0]), &m).unwrap();
        assert_eq!(low.label, RiskBand::Low);

        let medium = predict(&FeatureVector::new(vec![10.0, 0.0]), &m).unwrap();
        assert_eq!(medium.label, RiskBand::Medium);
    }

    #[test]
    fn test_length_mismatch_is_internal_error() {
        let err = predict(&FeatureVector::new(vec![1.0]), &model()).unwrap_err();
        assert_eq!(
            err,
            InternalScoringError::FeatureCountMismatch {
                expected: 2,
                actual: 1
            }
        );
    }

    #[test]
    fn test_non_finite_feature_is_internal_error() {
        let err = predict(&FeatureVector::new(vec![f64::NAN, 0.0]), &model()).unwrap_err();
        assert_eq!(
            err,
            InternalScoringError::NonFiniteFeature {
                index: 0,
                name: "revenue".to_string()
            }
        );
    }

    #[test]
    fn test_threshold_boundaries() {
        let t = RiskThresholds {
            low_max: 0.3,
            high_min: 0.7,
        };
        assert_eq!(t.band(0.0), RiskBand::Low);
        assert_eq!(t.band(0.3), RiskBand::Low);
        assert_eq!(t.band(0.31), RiskBand::Medium);
        assert_eq!(t.band(0.7), RiskBand::High);
        assert_eq!(t.band(1.0), RiskBand::High);
    }

    #[test]
    fn test_threshold_validation() {
        let ok = RiskThresholds {
            low_max: 0.2,
            high_min: 0.8,
        };
        assert!(ok.validate());

        let inverted = RiskThresholds {
            low_max: 0.8,
            high_min: 0.2,
        };
        assert!(!inverted.validate());

        let out_of_range = RiskThresholds {
            low_max: 0.2,
            high_min: 1.5,
        };
        assert!(!out_of_range.validate());
    }

    #[test]
    fn test_tree_validation_rejects_backward_edges() {
        let tree = Tree {
            left_children: vec![1, 0, -1],
            right_children: vec![2, 2, -1],
            split_indices: vec![0, 0, 0],
            split_conditions: vec![1.0, 1.0, 0.0],
            leaf_values: vec![0.0, 0.0, 1.0],
            base_weights: vec![],
        };
        assert!(tree.validate(1).is_err());
    }

    #[test]
    fn test_tree_validation_rejects_unknown_feature() {
        let tree = Tree {
            left_children: vec![1, -1, -1],
            right_children: vec![2, -1, -1],
            split_indices: vec![3, 0, 0],
            split_conditions: vec![1.0, 0.0, 0.0],
            leaf_values: vec![0.0, 1.0, 2.0],
            base_weights: vec![],
        };
        assert!(tree.validate(2).is_err());
        assert!(tree.validate(4).is_ok());
    }

    #[test]
    fn test_split_compares_in_single_precision() {
        let m = model();
        // 999.99999 rounds to 1000.0 as f32, so it goes right like 1000.0
        let at_threshold = m.forest().margin(&[1000.0, 0.0]);
        let within_f32_rounding = m.forest().margin(&[999.99999, 0.0]);
        assert_eq!(at_threshold.to_bits(), within_f32_rounding.to_bits());
        // clearly below the threshold still goes left
        let below = m.forest().margin(&[999.9, 0.0]);
        assert!((below + 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_contributions_sum_to_margin() {
        let m = model();
        for x in [[5000.0, 1.0], [10.0, 0.0], [999.99, 1.0], [1000.0, 0.0]] {
            let c = m.forest().contributions(&x);
            let total = c.bias + c.per_feature.iter().sum::<f64>();
            assert!((total - m.forest().margin(&x)).abs() < 1e-12);
        }
    }

    #[test]
    fn test_contributions_use_base_weights() {
        let tree = Tree {
            left_children: vec![1, -1, -1],
            right_children: vec![2, -1, -1],
            split_indices: vec![1, 0, 0],
            split_conditions: vec![0.5, 0.0, 0.0],
            leaf_values: vec![0.0, -1.0, 1.5],
            base_weights: vec![0.25, -1.0, 1.5],
        };
        let mut out = vec![0.0; 2];
        let root = tree.contributions(&[0.0, 1.0], &mut out);
        assert_eq!(root, 0.25);
        assert_eq!(out, vec![0.0, 1.25]);
        assert_eq!(root + out[1], tree.leaf_value(&[0.0, 1.0]));
    }

    #[test]
    fn test_factors_ranked_by_magnitude() {
        let m = model();
        // defaulted -> +1.5 on `defaulted`, revenue >= 1000 -> -0.25 on `revenue`
        let p = predict(&FeatureVector::new(vec![5000.0, 1.0]), &m).unwrap();
        let names: Vec<&str> = p.factors.iter().map(|f| f.feature.as_str()).collect();
        assert_eq!(names, vec!["defaulted", "revenue"]);
        assert_eq!(p.factors[0].direction, FactorDirection::IncreasesRisk);
        assert_eq!(p.factors[1].direction, FactorDirection::DecreasesRisk);
        assert!((p.factors[0].contribution - 1.5).abs() < 1e-12);
    }
}
