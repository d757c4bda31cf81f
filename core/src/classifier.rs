//! Pre-fitted classifiers.
//!
//! Models are trained offline and exported as JSON. Three families are
//! understood, selected by the `kind` tag:
//!
//! ```text
//! {"kind": "logistic_regression", "coefficients": [[..], ..], "intercepts": [..]}
//! {"kind": "decision_tree", "n_classes": 3, "tree": {"nodes": [..]}}
//! {"kind": "random_forest", "n_classes": 3, "trees": [{"nodes": [..]}, ..]}
//! ```
//!
//! Tree nodes are either splits (`{"feature", "threshold", "left", "right"}`,
//! left when `x[feature] <= threshold`) or leaves (`{"value": [..]}`, class
//! counts or weights). Children always come after their parent in `nodes`.

use serde::{Deserialize, Serialize};

/// Anything that turns one feature vector into per-class probabilities.
pub trait Classifier: Send + Sync + std::fmt::Debug {
    /// Number of classes in the probability vector.
    fn n_classes(&self) -> usize;

    /// Feature count the model was fitted on, when the artifact records it.
    fn n_features(&self) -> Option<usize>;

    fn predict_proba(&self, features: &[f64]) -> Result<Vec<f64>, InferenceError>;
}

/// Structural problems found while validating a loaded model.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ModelError {
    #[error("model has no classes")]
    NoClasses,

    #[error("logistic regression has {coefficients} coefficient rows but {intercepts} intercepts")]
    InterceptMismatch {
        coefficients: usize,
        intercepts: usize,
    },

    #[error("coefficient row {row} has {found} weights, expected {expected}")]
    RaggedCoefficients {
        row: usize,
        expected: usize,
        found: usize,
    },

    #[error("random forest has no trees")]
    NoTrees,

    #[error("tree {tree} has no nodes")]
    EmptyTree { tree: usize },

    #[error("tree {tree} node {node} points at child {child}, which must follow it and exist")]
    BadChild {
        tree: usize,
        node: usize,
        child: usize,
    },

    #[error("tree {tree} leaf {node} has {found} class weights, expected {expected}")]
    LeafWidth {
        tree: usize,
        node: usize,
        expected: usize,
        found: usize,
    },

    #[error("tree {tree} leaf {node} has negative or zero total weight")]
    InvalidLeaf { tree: usize, node: usize },

    #[error("tree {tree} node {node} splits on feature {feature}, beyond the {n_features} fitted features")]
    SplitFeature {
        tree: usize,
        node: usize,
        feature: usize,
        n_features: usize,
    },
}

/// Failures while scoring a single row.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InferenceError {
    #[error("X has {found} features, but the classifier expects {expected}")]
    ShapeMismatch { expected: usize, found: usize },

    #[error("tree splits on feature {feature}, but X has only {found} features")]
    FeatureOutOfRange { feature: usize, found: usize },

    #[error("classifier produced a non-finite probability")]
    NonFiniteProbability,

    #[error("tree traversal reached missing node {node}")]
    MissingNode { node: usize },
}

/// Any model family that can be stored in the system bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClassifierModel {
    LogisticRegression(LogisticRegression),
    DecisionTree(DecisionTreeClassifier),
    RandomForest(RandomForest),
}

impl ClassifierModel {
    /// Check the model's internal consistency; called once after loading.
    pub fn validate(&self) -> Result<(), ModelError> {
        match self {
            Self::LogisticRegression(model) => model.validate(),
            Self::DecisionTree(model) => model.validate(),
            Self::RandomForest(model) => model.validate(),
        }
    }

    fn inner(&self) -> &dyn Classifier {
        match self {
            Self::LogisticRegression(model) => model,
            Self::DecisionTree(model) => model,
            Self::RandomForest(model) => model,
        }
    }
}

impl Classifier for ClassifierModel {
    fn n_classes(&self) -> usize {
        self.inner().n_classes()
    }

    fn n_features(&self) -> Option<usize> {
        self.inner().n_features()
    }

    fn predict_proba(&self, features: &[f64]) -> Result<Vec<f64>, InferenceError> {
        let proba = self.inner().predict_proba(features)?;
        if proba.iter().any(|p| !p.is_finite()) {
            return Err(InferenceError::NonFiniteProbability);
        }
        Ok(proba)
    }
}

// ── Logistic regression ──────────────────────────────────────────────────

/// Linear model; one coefficient row per class, or a single row for a
/// binary problem where the row scores the positive class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticRegression {
    pub coefficients: Vec<Vec<f64>>,
    pub intercepts: Vec<f64>,
}

impl LogisticRegression {
    fn width(&self) -> usize {
        self.coefficients.first().map_or(0, Vec::len)
    }

    fn validate(&self) -> Result<(), ModelError> {
        if self.coefficients.is_empty() {
            return Err(ModelError::NoClasses);
        }
        if self.coefficients.len() != self.intercepts.len() {
            return Err(ModelError::InterceptMismatch {
                coefficients: self.coefficients.len(),
                intercepts: self.intercepts.len(),
            });
        }
        let expected = self.width();
        if let Some((row, found)) = self
            .coefficients
            .iter()
            .map(Vec::len)
            .enumerate()
            .find(|(_, len)| *len != expected)
        {
            return Err(ModelError::RaggedCoefficients {
                row,
                expected,
                found,
            });
        }
        Ok(())
    }
}

impl Classifier for LogisticRegression {
    fn n_classes(&self) -> usize {
        match self.coefficients.len() {
            1 => 2,
            n => n,
        }
    }

    fn n_features(&self) -> Option<usize> {
        Some(self.width())
    }

    fn predict_proba(&self, features: &[f64]) -> Result<Vec<f64>, InferenceError> {
        let expected = self.width();
        if features.len() != expected {
            return Err(InferenceError::ShapeMismatch {
                expected,
                found: features.len(),
            });
        }

        let scores: Vec<f64> = self
            .coefficients
            .iter()
            .zip(&self.intercepts)
            .map(|(row, intercept)| {
                row.iter().zip(features).map(|(w, x)| w * x).sum::<f64>() + intercept
            })
            .collect();

        if let [score] = scores.as_slice() {
            let positive = 1.0 / (1.0 + (-score).exp());
            return Ok(vec![1.0 - positive, positive]);
        }
        Ok(softmax(&scores))
    }
}

fn softmax(scores: &[f64]) -> Vec<f64> {
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
    let total: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}

// ── Trees ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TreeNode {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        value: Vec<f64>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTree {
    pub nodes: Vec<TreeNode>,
}

impl DecisionTree {
    fn validate(
        &self,
        tree: usize,
        n_classes: usize,
        n_features: Option<usize>,
    ) -> Result<(), ModelError> {
        if self.nodes.is_empty() {
            return Err(ModelError::EmptyTree { tree });
        }
        for (node, entry) in self.nodes.iter().enumerate() {
            match entry {
                TreeNode::Split {
                    feature,
                    left,
                    right,
                    ..
                } => {
                    for &child in [left, right] {
                        if child <= node || child >= self.nodes.len() {
                            return Err(ModelError::BadChild { tree, node, child });
                        }
                    }
                    if let Some(n_features) = n_features
                        && *feature >= n_features
                    {
                        return Err(ModelError::SplitFeature {
                            tree,
                            node,
                            feature: *feature,
                            n_features,
                        });
                    }
                }
                TreeNode::Leaf { value } => {
                    if value.len() != n_classes {
                        return Err(ModelError::LeafWidth {
                            tree,
                            node,
                            expected: n_classes,
                            found: value.len(),
                        });
                    }
                    let total: f64 = value.iter().sum();
                    if value.iter().any(|v| *v < 0.0) || total <= 0.0 || !total.is_finite() {
                        return Err(ModelError::InvalidLeaf { tree, node });
                    }
                }
            }
        }
        Ok(())
    }

    /// Leaf distribution reached by `features`, normalised to sum to one.
    fn leaf_proba(&self, features: &[f64]) -> Result<Vec<f64>, InferenceError> {
        let mut idx = 0;
        loop {
            match self.nodes.get(idx) {
                Some(TreeNode::Leaf { value }) => {
                    let total: f64 = value.iter().sum();
                    return Ok(value.iter().map(|v| v / total).collect());
                }
                Some(TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                }) => {
                    let x = features
                        .get(*feature)
                        .ok_or(InferenceError::FeatureOutOfRange {
                            feature: *feature,
                            found: features.len(),
                        })?;
                    idx = if *x <= *threshold { *left } else { *right };
                }
                None => return Err(InferenceError::MissingNode { node: idx }),
            }
        }
    }
}

fn check_width(n_features: Option<usize>, features: &[f64]) -> Result<(), InferenceError> {
    match n_features {
        Some(expected) if expected != features.len() => Err(InferenceError::ShapeMismatch {
            expected,
            found: features.len(),
        }),
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTreeClassifier {
    pub n_classes: usize,
    #[serde(default)]
    pub n_features: Option<usize>,
    pub tree: DecisionTree,
}

impl DecisionTreeClassifier {
    fn validate(&self) -> Result<(), ModelError> {
        if self.n_classes == 0 {
            return Err(ModelError::NoClasses);
        }
        self.tree.validate(0, self.n_classes, self.n_features)
    }
}

impl Classifier for DecisionTreeClassifier {
    fn n_classes(&self) -> usize {
        self.n_classes
    }

    fn n_features(&self) -> Option<usize> {
        self.n_features
    }

    fn predict_proba(&self, features: &[f64]) -> Result<Vec<f64>, InferenceError> {
        check_width(self.n_features, features)?;
        self.tree.leaf_proba(features)
    }
}

/// Bagged trees; probabilities are the mean of the trees' leaf distributions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    pub n_classes: usize,
    #[serde(default)]
    pub n_features: Option<usize>,
    pub trees: Vec<DecisionTree>,
}

impl RandomForest {
    fn validate(&self) -> Result<(), ModelError> {
        if self.n_classes == 0 {
            return Err(ModelError::NoClasses);
        }
        if self.trees.is_empty() {
            return Err(ModelError::NoTrees);
        }
        self.trees
            .iter()
            .enumerate()
            .try_for_each(|(idx, tree)| tree.validate(idx, self.n_classes, self.n_features))
    }
}

impl Classifier for RandomForest {
    fn n_classes(&self) -> usize {
        self.n_classes
    }

    fn n_features(&self) -> Option<usize> {
        self.n_features
    }

    fn predict_proba(&self, features: &[f64]) -> Result<Vec<f64>, InferenceError> {
        check_width(self.n_features, features)?;
        let mut sum = vec![0.0; self.n_classes];
        for tree in &self.trees {
            for (acc, p) in sum.iter_mut().zip(tree.leaf_proba(features)?) {
                *acc += p;
            }
        }
        let n_trees = self.trees.len() as f64;
        Ok(sum.into_iter().map(|p| p / n_trees).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn assert_close(actual: &[f64], expected: &[f64]) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1e-9, "{actual:?} != {expected:?}");
        }
    }

    fn stump(feature: usize, threshold: f64, left: Vec<f64>, right: Vec<f64>) -> DecisionTree {
        DecisionTree {
            nodes: vec![
                TreeNode::Split {
                    feature,
                    threshold,
                    left: 1,
                    right: 2,
                },
                TreeNode::Leaf { value: left },
                TreeNode::Leaf { value: right },
            ],
        }
    }

    #[test]
    fn multinomial_logistic_is_softmax() {
        let model = LogisticRegression {
            coefficients: vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![0.0, 0.0]],
            intercepts: vec![0.0, 0.0, 0.0],
        };
        model.validate().unwrap();
        let proba = model.predict_proba(&[0.0, 0.0]).unwrap();
        assert_close(&proba, &[1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0]);

        let proba = model.predict_proba(&[2.0, 0.0]).unwrap();
        assert!(proba[0] > proba[1]);
        assert!((proba.iter().sum::<f64>() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn binary_logistic_scores_positive_class() {
        let model = LogisticRegression {
            coefficients: vec![vec![1.0]],
            intercepts: vec![0.0],
        };
        assert_eq!(model.n_classes(), 2);
        assert_close(&model.predict_proba(&[0.0]).unwrap(), &[0.5, 0.5]);
    }

    #[test]
    fn logistic_rejects_wrong_width() {
        let model = LogisticRegression {
            coefficients: vec![vec![1.0, 2.0]],
            intercepts: vec![0.0],
        };
        assert_eq!(
            model.predict_proba(&[1.0]).unwrap_err(),
            InferenceError::ShapeMismatch {
                expected: 2,
                found: 1
            }
        );
    }

    #[test]
    fn logistic_validation() {
        let ragged = LogisticRegression {
            coefficients: vec![vec![1.0, 2.0], vec![1.0]],
            intercepts: vec![0.0, 0.0],
        };
        assert!(matches!(
            ragged.validate(),
            Err(ModelError::RaggedCoefficients { row: 1, .. })
        ));

        let missing = LogisticRegression {
            coefficients: vec![vec![1.0]],
            intercepts: vec![],
        };
        assert!(matches!(
            missing.validate(),
            Err(ModelError::InterceptMismatch { .. })
        ));
    }

    #[test]
    fn forest_averages_normalised_leaves() {
        let forest = RandomForest {
            n_classes: 2,
            n_features: Some(1),
            trees: vec![
                stump(0, 50.0, vec![8.0, 2.0], vec![1.0, 3.0]),
                stump(0, 70.0, vec![1.0, 0.0], vec![0.0, 1.0]),
            ],
        };
        forest.validate().unwrap();

        assert_close(&forest.predict_proba(&[40.0]).unwrap(), &[0.9, 0.1]);
        assert_close(&forest.predict_proba(&[60.0]).unwrap(), &[0.625, 0.375]);
        assert_close(&forest.predict_proba(&[90.0]).unwrap(), &[0.125, 0.875]);
    }

    #[test]
    fn split_threshold_is_inclusive_on_the_left() {
        let tree = DecisionTreeClassifier {
            n_classes: 2,
            n_features: None,
            tree: stump(0, 1.5, vec![1.0, 0.0], vec![0.0, 1.0]),
        };
        assert_close(&tree.predict_proba(&[1.5]).unwrap(), &[1.0, 0.0]);
    }

    #[test]
    fn tree_validation_rejects_backward_children() {
        let tree = DecisionTreeClassifier {
            n_classes: 2,
            n_features: None,
            tree: DecisionTree {
                nodes: vec![
                    TreeNode::Split {
                        feature: 0,
                        threshold: 0.0,
                        left: 1,
                        right: 0,
                    },
                    TreeNode::Leaf {
                        value: vec![1.0, 0.0],
                    },
                ],
            },
        };
        assert_eq!(
            tree.validate(),
            Err(ModelError::BadChild {
                tree: 0,
                node: 0,
                child: 0
            })
        );
    }

    #[test]
    fn tree_validation_rejects_bad_leaves() {
        let forest = RandomForest {
            n_classes: 3,
            n_features: None,
            trees: vec![stump(0, 0.0, vec![1.0, 0.0, 0.0], vec![1.0, 0.0])],
        };
        assert!(matches!(
            forest.validate(),
            Err(ModelError::LeafWidth { node: 2, .. })
        ));

        let forest = RandomForest {
            n_classes: 2,
            n_features: None,
            trees: vec![stump(0, 0.0, vec![0.0, 0.0], vec![1.0, 0.0])],
        };
        assert!(matches!(
            forest.validate(),
            Err(ModelError::InvalidLeaf { node: 1, .. })
        ));
    }

    #[test]
    fn split_on_missing_feature_is_an_inference_error() {
        let tree = DecisionTreeClassifier {
            n_classes: 2,
            n_features: None,
            tree: stump(3, 0.0, vec![1.0, 0.0], vec![0.0, 1.0]),
        };
        assert_eq!(
            tree.predict_proba(&[0.0]).unwrap_err(),
            InferenceError::FeatureOutOfRange {
                feature: 3,
                found: 1
            }
        );
    }

    #[test]
    fn models_deserialize_from_tagged_json() {
        let json = r#"{
            "kind": "random_forest",
            "n_classes": 2,
            "trees": [
                {"nodes": [
                    {"feature": 0, "threshold": 10.0, "left": 1, "right": 2},
                    {"value": [3.0, 1.0]},
                    {"value": [0.0, 2.0]}
                ]}
            ]
        }"#;
        let model: ClassifierModel = serde_json::from_str(json).unwrap();
        model.validate().unwrap();
        assert_eq!(model.n_classes(), 2);
        assert_eq!(model.n_features(), None);
        assert_close(&model.predict_proba(&[5.0]).unwrap(), &[0.75, 0.25]);

        let json = r#"{"kind": "logistic_regression", "coefficients": [[0.5]], "intercepts": [0.0]}"#;
        let model: ClassifierModel = serde_json::from_str(json).unwrap();
        assert_eq!(model.n_features(), Some(1));
    }
}
