//! Prompt complexity and intent classification.
//!
//! Analyses a prompt and produces a complexity tier, a score in
//! `[0, 100]`, a confidence, and an intent. Two paths exist:
//!
//! | Path        | Tier source                          | Confidence |
//! |-------------|--------------------------------------|------------|
//! | `heuristic` | Fixed-weight sum of the 15 features  | 0.65       |
//! | `model`     | Learned 5-way probability distribution | max prob |
//!
//! The learned path is loaded best-effort at startup; any failure falls
//! back silently to the heuristic. Classification never fails a request.

pub mod features;
pub mod intent;

pub use features::FeatureVector;
pub use intent::Intent;

use crate::GatewayError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::debug;

/// Coarse difficulty bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Trivial,
    Simple,
    Moderate,
    Complex,
    Expert,
}

impl Tier {
    /// Bucket a `[0, 100]` score.
    pub fn from_score(score: f64) -> Self {
        if score <= 10.0 {
            Tier::Trivial
        } else if score <= 25.0 {
            Tier::Simple
        } else if score <= 50.0 {
            Tier::Moderate
        } else if score <= 75.0 {
            Tier::Complex
        } else {
            Tier::Expert
        }
    }

    /// Index into a 5-way probability distribution.
    pub fn from_index(idx: usize) -> Self {
        match idx {
            0 => Tier::Trivial,
            1 => Tier::Simple,
            2 => Tier::Moderate,
            3 => Tier::Complex,
            _ => Tier::Expert,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Trivial => "trivial",
            Tier::Simple => "simple",
            Tier::Moderate => "moderate",
            Tier::Complex => "complex",
            Tier::Expert => "expert",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which classification path produced the tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassifyMethod {
    Heuristic,
    Model,
}

impl ClassifyMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassifyMethod::Heuristic => "heuristic",
            ClassifyMethod::Model => "model",
        }
    }
}

/// Full classification of one prompt.
#[derive(Debug, Clone, Serialize)]
pub struct Classification {
    pub tier: Tier,
    /// Complexity score in `[0, 100]`.
    pub score: f64,
    /// Confidence in the tier assignment, `[0, 1]`.
    pub confidence: f64,
    pub intent: Intent,
    pub intent_confidence: f64,
    pub features: FeatureVector,
    pub method: ClassifyMethod,
}

/// Heuristic feature weights. Order matches
/// [`FeatureVector::to_array`]; the weights sum to 1 so the weighted sum
/// lands in `[0, 1]` before scaling to `[0, 100]`.
const HEURISTIC_WEIGHTS: [f64; 15] = [
    0.10, // char_count
    0.08, // word_count
    0.05, // sentence_count
    0.05, // avg_word_length
    0.05, // avg_sentence_length
    0.03, // type_token_ratio
    0.15, // code_indicator
    0.08, // question_depth
    0.06, // structural_complexity
    0.12, // tech_density
    0.10, // reasoning_density
    0.05, // specificity
    0.02, // prior_reference
    0.03, // numerical_density
    0.03, // large_numbers
];

const HEURISTIC_CONFIDENCE: f64 = 0.65;

/// A learned tier model: feature vector in, 5-way distribution out.
pub trait TierModel: Send + Sync {
    fn predict(&self, features: &[f64; 15]) -> [f64; 5];
}

/// Linear-softmax tier model loadable from a JSON weight file.
///
/// Stand-in for the exported classifier weights; the feature contract is
/// identical to the heuristic path so the two are interchangeable.
#[derive(Debug, Clone, Deserialize)]
pub struct LinearTierModel {
    /// One weight row per tier, 15 columns each.
    pub weights: Vec<Vec<f64>>,
    pub biases: Vec<f64>,
}

impl LinearTierModel {
    /// Load and validate a weight file.
    pub fn load(path: &Path) -> Result<Self, GatewayError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::Config(format!("classifier weights unreadable: {e}")))?;
        let model: LinearTierModel = serde_json::from_str(&raw)
            .map_err(|e| GatewayError::Config(format!("classifier weights malformed: {e}")))?;
        if model.weights.len() != 5
            || model.biases.len() != 5
            || model.weights.iter().any(|row| row.len() != 15)
        {
            return Err(GatewayError::Config(
                "classifier weights must be 5x15 with 5 biases".to_string(),
            ));
        }
        Ok(model)
    }
}

impl TierModel for LinearTierModel {
    fn predict(&self, features: &[f64; 15]) -> [f64; 5] {
        let mut logits = [0.0f64; 5];
        for (i, row) in self.weights.iter().enumerate() {
            logits[i] = self.biases[i]
                + row
                    .iter()
                    .zip(features.iter())
                    .map(|(w, x)| w * x)
                    .sum::<f64>();
        }
        softmax(logits)
    }
}

fn softmax(logits: [f64; 5]) -> [f64; 5] {
    let max = logits.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    let mut out = [0.0f64; 5];
    for (o, e) in out.iter_mut().zip(exps) {
        *o = e / sum;
    }
    out
}

/// The prompt classifier. Cheap to construct; holds an optional learned
/// model behind a trait object.
pub struct Classifier {
    model: Option<Box<dyn TierModel>>,
}

impl Classifier {
    /// Heuristic-only classifier.
    pub fn heuristic() -> Self {
        Self { model: None }
    }

    /// Classifier backed by a learned tier model.
    pub fn with_model(model: Box<dyn TierModel>) -> Self {
        Self { model: Some(model) }
    }

    /// Try to load learned weights; fall back silently to the heuristic.
    pub fn from_weight_path(path: Option<&str>) -> Self {
        match path {
            Some(p) => match LinearTierModel::load(Path::new(p)) {
                Ok(model) => {
                    debug!(path = p, "learned tier classifier loaded");
                    Self::with_model(Box::new(model))
                }
                Err(e) => {
                    debug!(path = p, error = %e, "classifier load failed, using heuristic");
                    Self::heuristic()
                }
            },
            None => Self::heuristic(),
        }
    }

    /// Classify a prompt. Pure: no shared state, never fails.
    pub fn classify(&self, prompt: &str) -> Classification {
        let features = features::extract(prompt);
        let (intent, intent_confidence) = intent::detect(prompt);

        let (tier, score, confidence, method) = match &self.model {
            Some(model) => {
                let probs = model.predict(&features.to_array());
                let (idx, max) = probs.iter().enumerate().fold(
                    (0usize, f64::MIN),
                    |acc, (i, p)| if *p > acc.1 { (i, *p) } else { acc },
                );
                (
                    Tier::from_index(idx),
                    (max * 100.0).round(),
                    max,
                    ClassifyMethod::Model,
                )
            }
            None => {
                let weighted: f64 = features
                    .to_array()
                    .iter()
                    .zip(HEURISTIC_WEIGHTS.iter())
                    .map(|(f, w)| f * w)
                    .sum();
                let score = (weighted * 100.0).round();
                (
                    Tier::from_score(score),
                    score,
                    HEURISTIC_CONFIDENCE,
                    ClassifyMethod::Heuristic,
                )
            }
        };

        Classification {
            tier,
            score,
            confidence,
            intent,
            intent_confidence,
            features,
            method,
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
