//! Company resolution — four tiers, first non-empty wins, then alias lookup.
//!
//! 1. whitelist: known names in the rule candidate, subject, then body
//! 2. domain map: sender domain and parents, Reply-To, List-Unsubscribe
//! 3. model entity prediction above the confidence floor
//! 4. rule candidate or body regex capture
//!
//! Every accepted name passes through [`resolve_alias`] before it leaves
//! this module. Resolution is pure; persistence happens in the pipeline.

use tracing::debug;

use crate::pipeline::alias::{CanonicalName, resolve_alias};
use crate::pipeline::classifier::StatisticalClassifier;
use crate::pipeline::extract::header_domains;
use crate::pipeline::patterns::PatternStore;
use crate::pipeline::rules::CompanyHit;
use crate::pipeline::types::{CompanyResolution, RawMessage, ResolutionTier};

pub const WHITELIST_CONFIDENCE: f32 = 0.95;
pub const DOMAIN_CONFIDENCE: f32 = 0.90;
pub const BODY_REGEX_CONFIDENCE: f32 = 0.60;

/// A provisional company with its canonical identity.
#[derive(Debug, Clone)]
pub struct ResolvedCompany {
    pub resolution: CompanyResolution,
    /// Present exactly when `resolution` is resolved.
    pub canonical: Option<CanonicalName>,
    /// Tier attempts in order, e.g. `domain:hit(cgi.com)`.
    pub attempts: Vec<String>,
}

impl ResolvedCompany {
    fn abstain(attempts: Vec<String>, ats_fallback: Option<String>) -> Self {
        Self {
            resolution: CompanyResolution {
                ats_fallback,
                ..CompanyResolution::abstain()
            },
            canonical: None,
            attempts,
        }
    }
}

struct TierHit {
    tier: ResolutionTier,
    raw_name: String,
    confidence: f32,
}

/// Resolves the provisional company for one message.
pub struct CompanyResolver<'a> {
    patterns: &'a PatternStore,
    model: &'a dyn StatisticalClassifier,
    confidence_floor: f32,
}

impl<'a> CompanyResolver<'a> {
    pub fn new(
        patterns: &'a PatternStore,
        model: &'a dyn StatisticalClassifier,
        confidence_floor: f32,
    ) -> Self {
        Self {
            patterns,
            model,
            confidence_floor,
        }
    }

    pub async fn resolve(&self, message: &RawMessage, rule: Option<&CompanyHit>) -> ResolvedCompany {
        let mut attempts = Vec::new();
        let mut ats_fallback = None;

        let hit = match self.whitelist(message, rule) {
            Some(hit) => Some(hit),
            None => {
                attempts.push("whitelist:miss".into());
                match self.domain(message, &mut attempts, &mut ats_fallback) {
                    Some(hit) => Some(hit),
                    None => match self.statistical(message, &mut attempts).await {
                        Some(hit) => Some(hit),
                        None => self.body_regex(message, rule),
                    },
                }
            }
        };

        let Some(hit) = hit else {
            attempts.push("body_regex:miss".into());
            return ResolvedCompany::abstain(attempts, ats_fallback);
        };
        attempts.push(format!("{}:hit({})", hit.tier.name(), hit.raw_name));

        let Some(canonical) = resolve_alias(&hit.raw_name, &self.patterns.aliases) else {
            return ResolvedCompany::abstain(attempts, ats_fallback);
        };
        debug!(
            id = %message.id,
            tier = hit.tier.as_u8(),
            raw = %hit.raw_name,
            canonical = %canonical,
            "Company resolved"
        );

        ResolvedCompany {
            resolution: CompanyResolution {
                raw_name: hit.raw_name,
                canonical: canonical.as_str().to_string(),
                tier: hit.tier,
                confidence: hit.confidence,
                inherited: false,
                ats_fallback: None,
            },
            canonical: Some(canonical),
            attempts,
        }
    }

    fn whitelist(&self, message: &RawMessage, rule: Option<&CompanyHit>) -> Option<TierHit> {
        let hit = |name: &str| TierHit {
            tier: ResolutionTier::Whitelist,
            raw_name: name.to_string(),
            confidence: WHITELIST_CONFIDENCE,
        };

        if let Some(name) = rule.and_then(|r| self.patterns.known_company(&r.name)) {
            return Some(hit(name));
        }
        [message.subject.as_str(), message.body.as_str()]
            .into_iter()
            .find_map(|text| self.earliest_known(text))
            .map(hit)
    }

    /// Earliest verbatim known name in `text`; ties go to the longer name.
    fn earliest_known(&self, text: &str) -> Option<&str> {
        self.patterns
            .known
            .iter()
            .filter_map(|k| {
                let caps = k.matcher.captures(text)?;
                let m = caps.get(1)?;
                Some((m.start(), k.name.as_str()))
            })
            .min_by(|(a_pos, a), (b_pos, b)| a_pos.cmp(b_pos).then(b.len().cmp(&a.len())))
            .map(|(_, name)| name)
    }

    fn domain(
        &self,
        message: &RawMessage,
        attempts: &mut Vec<String>,
        ats_fallback: &mut Option<String>,
    ) -> Option<TierHit> {
        let mut domains = Vec::new();
        if !message.sender_domain.is_empty() {
            domains.push(message.sender_domain.clone());
        }
        for header in ["reply-to", "list-unsubscribe"] {
            if let Some(value) = message.header(header) {
                domains.extend(header_domains(value));
            }
        }

        for domain in &domains {
            if let Some(ats) = self.patterns.ats_domain(domain) {
                attempts.push(format!("domain:ats({domain})"));
                ats_fallback.get_or_insert_with(|| format!("via {}", ats_display_name(ats)));
                continue;
            }
            if self.patterns.is_headhunter_domain(domain) {
                attempts.push(format!("domain:headhunter({domain})"));
                continue;
            }
            if let Some(company) = self.patterns.company_for_domain(domain) {
                return Some(TierHit {
                    tier: ResolutionTier::Domain,
                    raw_name: company.to_string(),
                    confidence: DOMAIN_CONFIDENCE,
                });
            }
        }
        attempts.push("domain:miss".into());
        None
    }

    async fn statistical(&self, message: &RawMessage, attempts: &mut Vec<String>) -> Option<TierHit> {
        let prediction = match self.model.predict_company(&message.classifier_text()).await {
            Ok(Some(p)) => p,
            Ok(None) => {
                attempts.push("statistical:miss".into());
                return None;
            }
            Err(e) => {
                debug!(id = %message.id, error = %e, "Company prediction unavailable");
                attempts.push("statistical:unavailable".into());
                return None;
            }
        };
        if prediction.confidence < self.confidence_floor {
            attempts.push(format!("statistical:below_floor({:.2})", prediction.confidence));
            return None;
        }
        let Some(name) = self.patterns.clean_company(&prediction.name) else {
            attempts.push("statistical:denied".into());
            return None;
        };
        Some(TierHit {
            tier: ResolutionTier::Statistical,
            raw_name: name,
            confidence: prediction.confidence,
        })
    }

    fn body_regex(&self, message: &RawMessage, rule: Option<&CompanyHit>) -> Option<TierHit> {
        let hit = |name: String| TierHit {
            tier: ResolutionTier::BodyRegex,
            raw_name: name,
            confidence: BODY_REGEX_CONFIDENCE,
        };
        if let Some(rule) = rule {
            return Some(hit(rule.name.clone()));
        }
        let text = message.classifier_text();
        self.patterns.company_patterns.iter().find_map(|regex| {
            let caps = regex.captures(&text)?;
            let raw = caps.name("company").or_else(|| caps.get(1))?;
            self.patterns.clean_company(raw.as_str()).map(hit)
        })
    }
}

/// `greenhouse.io` → `Greenhouse`.
fn ats_display_name(domain: &str) -> String {
    let label = domain.split('.').next().unwrap_or(domain);
    let mut chars = label.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
