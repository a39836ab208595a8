//! Inference-only linear text model.
//!
//! The artifact is a JSON document of per-label token weights and a bias.
//! Features are lowercase unigrams and bigrams, counted once per message.
//! Scores go through a softmax, so confidences are probabilities over the
//! labels present in the artifact.
//!
//! ```json
//! {
//!   "labels": {
//!     "rejection": { "bias": -0.4, "weights": { "unfortunately": 2.3, "move forward": 1.1 } }
//!   },
//!   "companies": [ { "name": "Acme Corp", "prior": 0.8 } ]
//! }
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tracing::info;

use crate::error::ClassifierError;
use crate::pipeline::classifier::{CompanyPrediction, Prediction, StatisticalClassifier};
use crate::pipeline::types::Label;

#[derive(Debug, Clone, Default, Deserialize)]
struct LabelWeights {
    #[serde(default)]
    bias: f32,
    #[serde(default)]
    weights: HashMap<String, f32>,
}

#[derive(Debug, Clone, Deserialize)]
struct CompanyEntry {
    name: String,
    prior: f32,
}

#[derive(Debug, Clone, Deserialize)]
struct Artifact {
    labels: BTreeMap<Label, LabelWeights>,
    #[serde(default)]
    companies: Vec<CompanyEntry>,
}

struct CompanyEntity {
    name: String,
    prior: f32,
    matcher: Regex,
}

/// Linear classifier loaded from a JSON artifact.
pub struct LinearTextModel {
    labels: Vec<(Label, LabelWeights)>,
    companies: Vec<CompanyEntity>,
}

impl LinearTextModel {
    /// Load an artifact. A missing or unreadable file is `Unavailable`.
    pub fn load(path: &Path) -> Result<Self, ClassifierError> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            ClassifierError::Unavailable(format!("model artifact {}: {e}", path.display()))
        })?;
        let model = Self::from_json(&json)?;
        info!(
            path = %path.display(),
            labels = model.labels.len(),
            companies = model.companies.len(),
            "Statistical model loaded"
        );
        Ok(model)
    }

    pub fn from_json(json: &str) -> Result<Self, ClassifierError> {
        let artifact: Artifact = serde_json::from_str(json)
            .map_err(|e| ClassifierError::Unavailable(format!("invalid model artifact: {e}")))?;
        if artifact.labels.len() < 2 {
            return Err(ClassifierError::Unavailable(
                "model artifact needs at least two labels".into(),
            ));
        }

        let companies = artifact
            .companies
            .into_iter()
            .filter(|c| !c.name.trim().is_empty())
            .map(|c| {
                let pattern = format!(r"(?i)\b{}\b", regex::escape(c.name.trim()));
                let matcher = Regex::new(&pattern)
                    .map_err(|e| ClassifierError::Unavailable(format!("company '{}': {e}", c.name)))?;
                Ok(CompanyEntity {
                    name: c.name.trim().to_string(),
                    prior: c.prior.clamp(0.0, 1.0),
                    matcher,
                })
            })
            .collect::<Result<Vec<_>, ClassifierError>>()?;

        Ok(Self {
            labels: artifact.labels.into_iter().collect(),
            companies,
        })
    }

    fn scores(&self, text: &str) -> Vec<(Label, f32)> {
        let features = features(text);
        let logits: Vec<(Label, f32)> = self
            .labels
            .iter()
            .map(|(label, w)| {
                let sum: f32 = features
                    .iter()
                    .filter_map(|f| w.weights.get(f.as_str()))
                    .sum();
                (*label, w.bias + sum)
            })
            .collect();
        softmax(&logits)
    }
}

#[async_trait]
impl StatisticalClassifier for LinearTextModel {
    async fn classify(&self, text: &str) -> Result<Prediction, ClassifierError> {
        let scores = self.scores(text);
        let (label, confidence) = scores
            .iter()
            .copied()
            .fold(None, |best: Option<(Label, f32)>, (label, p)| match best {
                Some((_, best_p)) if best_p >= p => best,
                _ => Some((label, p)),
            })
            .ok_or_else(|| ClassifierError::Inference("model produced no scores".into()))?;
        Ok(Prediction {
            label,
            confidence,
            scores: scores.into_iter().collect(),
        })
    }

    async fn predict_company(
        &self,
        text: &str,
    ) -> Result<Option<CompanyPrediction>, ClassifierError> {
        let best = self
            .companies
            .iter()
            .filter_map(|c| c.matcher.find(text).map(|m| (m.start(), c)))
            .min_by(|(a_pos, a), (b_pos, b)| {
                a_pos
                    .cmp(b_pos)
                    .then(b.prior.total_cmp(&a.prior))
            })
            .map(|(_, c)| CompanyPrediction {
                name: c.name.clone(),
                confidence: c.prior,
            });
        Ok(best)
    }
}

/// Lowercase unigrams and bigrams, de-duplicated.
fn features(text: &str) -> HashSet<String> {
    let tokens: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .map(|t| t.trim_matches('\'').to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    let mut features: HashSet<String> = tokens.iter().cloned().collect();
    for pair in tokens.windows(2) {
        features.insert(format!("{} {}", pair[0], pair[1]));
    }
    features
}

fn softmax(logits: &[(Label, f32)]) -> Vec<(Label, f32)> {
    let max = logits
        .iter()
        .map(|(_, l)| *l)
        .fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<(Label, f32)> = logits.iter().map(|(label, l)| (*label, (l - max).exp())).collect();
    let total: f32 = exps.iter().map(|(_, e)| e).sum();
    exps.into_iter().map(|(label, e)| (label, e / total)).collect()
}
