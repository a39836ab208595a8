//! Message classification — rule/model merge plus ordered overrides.
//!
//! The statistical model is consumed through [`StatisticalClassifier`]. A
//! rule label wins when its confidence is at least the model's; otherwise
//! the model label is taken. Overrides then run in table order, each one
//! appending its id to the result.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ClassifierError;
use crate::pipeline::alias::resolve_alias;
use crate::pipeline::patterns::PatternStore;
use crate::pipeline::rules::RuleHit;
use crate::pipeline::types::{
    ClassificationResult, ClassificationSource, CompanyResolution, CorrelationDecision, Label,
    RawMessage,
};

/// A label prediction from the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: Label,
    /// Calibrated probability of `label`.
    pub confidence: f32,
    /// Probability per label.
    #[serde(default)]
    pub scores: BTreeMap<Label, f32>,
}

/// A company entity predicted by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyPrediction {
    pub name: String,
    pub confidence: f32,
}

/// Inference contract for the statistical classifier.
#[async_trait]
pub trait StatisticalClassifier: Send + Sync {
    /// Predict a label for subject + body text.
    async fn classify(&self, text: &str) -> Result<Prediction, ClassifierError>;

    /// Predict the company a message concerns, if the model supports it.
    async fn predict_company(
        &self,
        _text: &str,
    ) -> Result<Option<CompanyPrediction>, ClassifierError> {
        Ok(None)
    }
}

/// Classifier that is never available. Runs rely on rules alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullClassifier;

#[async_trait]
impl StatisticalClassifier for NullClassifier {
    async fn classify(&self, _text: &str) -> Result<Prediction, ClassifierError> {
        Err(ClassifierError::Unavailable("no model configured".into()))
    }
}

/// Model output for one message, with availability recorded for the trace.
#[derive(Debug, Clone, Default)]
pub struct ModelSignal {
    pub available: bool,
    pub prediction: Option<Prediction>,
}

impl ModelSignal {
    pub fn confidence(&self) -> f32 {
        self.prediction.as_ref().map(|p| p.confidence).unwrap_or(0.0)
    }
}

/// Everything an override may look at.
pub struct OverrideContext<'a> {
    pub message: &'a RawMessage,
    pub patterns: &'a PatternStore,
    /// Company resolved before overrides run.
    pub provisional: &'a CompanyResolution,
    pub correlation: &'a CorrelationDecision,
    pub min_model_confidence: f32,
}

type OverrideFn = fn(&ClassificationResult, &OverrideContext<'_>) -> Option<Label>;

/// Overrides in evaluation order.
const OVERRIDES: &[(&str, OverrideFn)] = &[
    ("low_model_confidence", low_model_confidence),
    ("internal_referral", internal_referral),
    ("correlated_follow_up", correlated_follow_up),
];

fn low_model_confidence(result: &ClassificationResult, ctx: &OverrideContext<'_>) -> Option<Label> {
    let weak = result.source == ClassificationSource::Model
        && result.label != Label::Other
        && result.confidence < ctx.min_model_confidence;
    weak.then_some(Label::Other)
}

/// A colleague introducing the user to someone at their own company is
/// not recruiting traffic.
fn internal_referral(result: &ClassificationResult, ctx: &OverrideContext<'_>) -> Option<Label> {
    if !matches!(result.label, Label::HeadHunter | Label::InterviewInvite) {
        return None;
    }
    if !ctx.provisional.is_resolved() {
        return None;
    }
    let sender_company = ctx
        .patterns
        .company_for_domain(&ctx.message.sender_domain)
        .and_then(|name| resolve_alias(name, &ctx.patterns.aliases))?;
    if sender_company.as_str() != ctx.provisional.canonical {
        return None;
    }
    let text = ctx.message.classifier_text();
    ctx.patterns
        .has_referral_marker(&text)
        .then_some(Label::Other)
}

fn correlated_follow_up(result: &ClassificationResult, ctx: &OverrideContext<'_>) -> Option<Label> {
    if result.label != Label::Noise {
        return None;
    }
    match ctx.correlation {
        CorrelationDecision::Existing { prior_label, .. } if *prior_label != Label::Noise => {
            Some(*prior_label)
        }
        CorrelationDecision::Existing { .. } => Some(Label::Other),
        CorrelationDecision::New { .. } => None,
    }
}

/// Merges rule and model output into one classification.
pub struct MessageClassifier {
    model: Arc<dyn StatisticalClassifier>,
    min_model_confidence: f32,
}

impl MessageClassifier {
    pub fn new(model: Arc<dyn StatisticalClassifier>, min_model_confidence: f32) -> Self {
        Self {
            model,
            min_model_confidence,
        }
    }

    pub fn model(&self) -> &Arc<dyn StatisticalClassifier> {
        &self.model
    }

    pub fn min_model_confidence(&self) -> f32 {
        self.min_model_confidence
    }

    /// Ask the model for a label. Failures degrade to "no prediction".
    pub async fn predict(&self, message: &RawMessage) -> ModelSignal {
        match self.model.classify(&message.classifier_text()).await {
            Ok(prediction) => ModelSignal {
                available: true,
                prediction: Some(prediction),
            },
            Err(ClassifierError::Unavailable(reason)) => {
                debug!(id = %message.id, reason = %reason, "Classifier unavailable, using rules only");
                ModelSignal::default()
            }
            Err(e) => {
                warn!(id = %message.id, error = %e, "Classifier failed, using rules only");
                ModelSignal {
                    available: true,
                    prediction: None,
                }
            }
        }
    }

    /// Pick between rule and model output. Rules win ties.
    pub fn merge(rule: Option<&RuleHit>, model: &ModelSignal) -> ClassificationResult {
        let model_confidence = model.confidence();
        if let Some(hit) = rule.filter(|hit| hit.confidence >= model_confidence) {
            return ClassificationResult::new(
                hit.label,
                hit.confidence,
                ClassificationSource::Rule(hit.rule_id.clone()),
            );
        }
        match &model.prediction {
            Some(p) => ClassificationResult::new(p.label, p.confidence, ClassificationSource::Model),
            None => ClassificationResult::abstain(),
        }
    }

    /// Run the override table in order.
    pub fn apply_overrides(&self, result: &mut ClassificationResult, ctx: &OverrideContext<'_>) {
        for (id, check) in OVERRIDES {
            if let Some(label) = check(result, ctx) {
                debug!(
                    id = %ctx.message.id,
                    rule = %id,
                    from = %result.label,
                    to = %label,
                    "Classification override applied"
                );
                result.apply_override(id, label);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::pipeline::types::{CorrelationKey, ResolutionTier};

    const DOC: &str = r#"{
        "known": ["Eclypsium"],
        "domain_to_company": {"eclypsium.com": "Eclypsium", "cgi.com": "CGI"},
        "aliases": {"CGI": "CGI Inc."},
        "labels": {"rejection": ["unfortunately"]}
    }"#;

    struct FixedModel(Result<Prediction, ClassifierError>);

    #[async_trait]
    impl StatisticalClassifier for FixedModel {
        async fn classify(&self, _text: &str) -> Result<Prediction, ClassifierError> {
            match &self.0 {
                Ok(p) => Ok(p.clone()),
                Err(ClassifierError::Unavailable(r)) => Err(ClassifierError::Unavailable(r.clone())),
                Err(ClassifierError::Inference(r)) => Err(ClassifierError::Inference(r.clone())),
            }
        }
    }

    fn prediction(label: Label, confidence: f32) -> Prediction {
        Prediction {
            label,
            confidence,
            scores: BTreeMap::from([(label, confidence)]),
        }
    }

    fn signal(label: Label, confidence: f32) -> ModelSignal {
        ModelSignal {
            available: true,
            prediction: Some(prediction(label, confidence)),
        }
    }

    fn hit(label: Label, confidence: f32) -> RuleHit {
        RuleHit {
            rule_id: "label.test#0".into(),
            label,
            confidence,
        }
    }

    fn make_message(sender: &str, subject: &str, body: &str) -> RawMessage {
        RawMessage {
            id: "m-1".into(),
            sender: sender.into(),
            sender_domain: sender.rsplit_once('@').map(|(_, d)| d.to_string()).unwrap_or_default(),
            subject: subject.into(),
            body: body.into(),
            html: None,
            headers: BTreeMap::new(),
            thread_id: "t".into(),
            received_at: Utc::now(),
        }
    }

    fn resolved(canonical: &str) -> CompanyResolution {
        CompanyResolution {
            raw_name: canonical.into(),
            canonical: canonical.into(),
            tier: ResolutionTier::Domain,
            confidence: 0.9,
            inherited: false,
            ats_fallback: None,
        }
    }

    fn classifier() -> MessageClassifier {
        MessageClassifier::new(Arc::new(NullClassifier), 0.55)
    }

    #[test]
    fn rule_wins_ties() {
        let result = MessageClassifier::merge(
            Some(&hit(Label::Rejection, 0.85)),
            &signal(Label::InterviewInvite, 0.85),
        );
        assert_eq!(result.label, Label::Rejection);
        assert_eq!(result.source, ClassificationSource::Rule("label.test#0".into()));
    }

    #[test]
    fn stronger_model_beats_rule() {
        let result = MessageClassifier::merge(
            Some(&hit(Label::Rejection, 0.85)),
            &signal(Label::InterviewInvite, 0.93),
        );
        assert_eq!(result.label, Label::InterviewInvite);
        assert_eq!(result.source, ClassificationSource::Model);
    }

    #[test]
    fn unavailable_model_keeps_rule_confidence() {
        let result = MessageClassifier::merge(Some(&hit(Label::Noise, 0.9)), &ModelSignal::default());
        assert_eq!(result.label, Label::Noise);
        assert_eq!(result.confidence, 0.9);
    }

    #[test]
    fn both_abstain_is_other() {
        let result = MessageClassifier::merge(None, &ModelSignal::default());
        assert_eq!(result, ClassificationResult::abstain());
    }

    #[tokio::test]
    async fn predict_degrades_on_errors() {
        let msg = make_message("a@b.com", "s", "b");

        let unavailable = MessageClassifier::new(Arc::new(NullClassifier), 0.55);
        let sig = unavailable.predict(&msg).await;
        assert!(!sig.available);
        assert!(sig.prediction.is_none());

        let failing = MessageClassifier::new(
            Arc::new(FixedModel(Err(ClassifierError::Inference("boom".into())))),
            0.55,
        );
        let sig = failing.predict(&msg).await;
        assert!(sig.available);
        assert_eq!(sig.confidence(), 0.0);

        let working = MessageClassifier::new(
            Arc::new(FixedModel(Ok(prediction(Label::Rejection, 0.7)))),
            0.55,
        );
        assert_eq!(working.predict(&msg).await.confidence(), 0.7);
    }

    #[test]
    fn low_model_confidence_demotes_to_other() {
        let patterns = PatternStore::from_json(DOC).unwrap();
        let msg = make_message("x@y.com", "Hello", "Something");
        let provisional = CompanyResolution::abstain();
        let correlation = CorrelationDecision::New { window_days: 365 };
        let ctx = OverrideContext {
            message: &msg,
            patterns: &patterns,
            provisional: &provisional,
            correlation: &correlation,
            min_model_confidence: 0.55,
        };

        let mut result = MessageClassifier::merge(None, &signal(Label::HeadHunter, 0.4));
        classifier().apply_overrides(&mut result, &ctx);
        assert_eq!(result.label, Label::Other);
        assert_eq!(result.overrides, vec!["low_model_confidence"]);
        assert_eq!(result.pre_override_label, Some(Label::HeadHunter));
    }

    #[test]
    fn internal_referral_needs_all_three_conditions() {
        let patterns = PatternStore::from_json(DOC).unwrap();
        let correlation = CorrelationDecision::New { window_days: 365 };
        let provisional = resolved("Eclypsium");

        let msg = make_message(
            "john@eclypsium.com",
            "Intro: Kelly <> Stas",
            "I'd like to introduce you to Kelly on our platform team.",
        );
        let ctx = OverrideContext {
            message: &msg,
            patterns: &patterns,
            provisional: &provisional,
            correlation: &correlation,
            min_model_confidence: 0.55,
        };
        let mut result = MessageClassifier::merge(None, &signal(Label::InterviewInvite, 0.8));
        classifier().apply_overrides(&mut result, &ctx);
        assert_eq!(result.label, Label::Other);
        assert_eq!(result.overrides, vec!["internal_referral"]);

        // No referral marker: label stands.
        let plain = make_message("john@eclypsium.com", "Chat", "Are you free to talk?");
        let ctx = OverrideContext { message: &plain, ..ctx };
        let mut result = MessageClassifier::merge(None, &signal(Label::InterviewInvite, 0.8));
        classifier().apply_overrides(&mut result, &ctx);
        assert_eq!(result.label, Label::InterviewInvite);
        assert!(result.overrides.is_empty());

        // Different provisional company: label stands.
        let other_company = resolved("Dragos");
        let ctx = OverrideContext {
            message: &msg,
            provisional: &other_company,
            ..ctx
        };
        let mut result = MessageClassifier::merge(None, &signal(Label::HeadHunter, 0.8));
        classifier().apply_overrides(&mut result, &ctx);
        assert_eq!(result.label, Label::HeadHunter);
    }

    #[test]
    fn internal_referral_compares_alias_resolved_names() {
        let patterns = PatternStore::from_json(DOC).unwrap();
        let correlation = CorrelationDecision::New { window_days: 365 };
        let provisional = resolved("CGI Inc.");
        let msg = make_message("ana@cgi.com", "Referral", "I referred you for the role.");
        let ctx = OverrideContext {
            message: &msg,
            patterns: &patterns,
            provisional: &provisional,
            correlation: &correlation,
            min_model_confidence: 0.55,
        };
        let mut result =
            MessageClassifier::merge(Some(&hit(Label::HeadHunter, 0.85)), &ModelSignal::default());
        classifier().apply_overrides(&mut result, &ctx);
        assert_eq!(result.label, Label::Other);
    }

    #[test]
    fn correlated_noise_takes_prior_label() {
        let patterns = PatternStore::from_json(DOC).unwrap();
        let msg = make_message("jane@dragos.com", "Following up", "newsletter");
        let provisional = CompanyResolution::abstain();
        let correlation = CorrelationDecision::Existing {
            key: CorrelationKey::Sender("jane@dragos.com".into()),
            prior_message_id: "m0".into(),
            age_days: 40,
            company: Some("Dragos".into()),
            prior_label: Label::HeadHunter,
            window_days: 365,
        };
        let ctx = OverrideContext {
            message: &msg,
            patterns: &patterns,
            provisional: &provisional,
            correlation: &correlation,
            min_model_confidence: 0.55,
        };
        let mut result = MessageClassifier::merge(None, &signal(Label::Noise, 0.9));
        classifier().apply_overrides(&mut result, &ctx);
        assert_eq!(result.label, Label::HeadHunter);
        assert_eq!(result.overrides, vec!["correlated_follow_up"]);
    }

    #[test]
    fn correlated_noise_with_noise_prior_becomes_other() {
        let patterns = PatternStore::from_json(DOC).unwrap();
        let msg = make_message("jane@dragos.com", "Hi", "hi");
        let provisional = CompanyResolution::abstain();
        let correlation = CorrelationDecision::Existing {
            key: CorrelationKey::SenderDomain("dragos.com".into()),
            prior_message_id: "m0".into(),
            age_days: 3,
            company: None,
            prior_label: Label::Noise,
            window_days: 365,
        };
        let ctx = OverrideContext {
            message: &msg,
            patterns: &patterns,
            provisional: &provisional,
            correlation: &correlation,
            min_model_confidence: 0.55,
        };
        let mut result = MessageClassifier::merge(None, &signal(Label::Noise, 0.9));
        classifier().apply_overrides(&mut result, &ctx);
        assert_eq!(result.label, Label::Other);
    }
}
