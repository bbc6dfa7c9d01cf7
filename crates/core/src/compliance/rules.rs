use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{ComplianceConfig, TenantOverrides};
use crate::domain::compliance::{Severity, ViolationType};

pub const FAIR_HOUSING_REMEDIATION: &str = "Describe the property and its features, not who \
     should live there. Never reference race, color, religion, sex, handicap, familial status \
     or national origin.";
/// Words that, right after a keyword, mean it is not an opt-out.
const OPT_OUT_CONTINUATIONS: &[&str] = &["BY", "IN", "AT", "OVER", "UP", "OF"];

pub const OPT_OUT_REMEDIATION: &str =
    "Recipient has opted out. Send only transactional replies or route to a human agent.";

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("invalid fair-housing pattern `{pattern}`: {source}")]
    InvalidPattern { pattern: String, source: regex::Error },
}

/// Declarative rule, as written in configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleSpec {
    RecordingNotice { text: String },
    AiDisclosure { text: String },
    FairHousing { patterns: Vec<String> },
    OptOutPromotional { markers: Vec<String> },
    BlockedPhrase { phrase: String },
}

#[derive(Clone, Debug)]
pub enum ComplianceRule {
    RecordingNotice { text: String },
    AiDisclosure { text: String },
    FairHousing { patterns: Vec<Regex> },
    OptOutPromotional { markers: Vec<String> },
    BlockedPhrase { phrase: String },
}

impl ComplianceRule {
    pub fn compile(spec: RuleSpec) -> Result<Self, RuleError> {
        Ok(match spec {
            RuleSpec::RecordingNotice { text } => Self::RecordingNotice { text },
            RuleSpec::AiDisclosure { text } => Self::AiDisclosure { text },
            RuleSpec::FairHousing { patterns } => Self::FairHousing {
                patterns: patterns
                    .into_iter()
                    .map(|pattern| {
                        RegexBuilder::new(&pattern)
                            .case_insensitive(true)
                            .build()
                            .map_err(|source| RuleError::InvalidPattern { pattern, source })
                    })
                    .collect::<Result<_, _>>()?,
            },
            RuleSpec::OptOutPromotional { markers } => Self::OptOutPromotional {
                markers: markers.into_iter().map(|marker| marker.to_lowercase()).collect(),
            },
            RuleSpec::BlockedPhrase { phrase } => Self::BlockedPhrase { phrase: phrase.to_lowercase() },
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::RecordingNotice { .. } => "recording_notice",
            Self::AiDisclosure { .. } => "ai_disclosure",
            Self::FairHousing { .. } => "fair_housing",
            Self::OptOutPromotional { .. } => "opt_out_promotional",
            Self::BlockedPhrase { .. } => "blocked_phrase",
        }
    }

    pub fn violation_type(&self) -> ViolationType {
        match self {
            Self::RecordingNotice { .. } => ViolationType::RecordingConsentMissing,
            Self::AiDisclosure { .. } => ViolationType::BotDisclosureMissing,
            Self::FairHousing { .. } => ViolationType::FairHousingRisk,
            Self::OptOutPromotional { .. } => ViolationType::OptOutIgnored,
            Self::BlockedPhrase { .. } => ViolationType::Other,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::RecordingNotice { .. } => Severity::Medium,
            Self::AiDisclosure { .. } => Severity::Low,
            Self::FairHousing { .. } => Severity::Critical,
            Self::OptOutPromotional { .. } => Severity::High,
            Self::BlockedPhrase { .. } => Severity::Medium,
        }
    }
}

/// Ordered, compiled rules for one tenant plus the text used around them.
#[derive(Clone, Debug)]
pub struct RuleSet {
    pub rules: Vec<ComplianceRule>,
    pub opt_out_keywords: Vec<String>,
    pub opt_out_confirmation: String,
    pub sms_max_chars: usize,
}

impl RuleSet {
    pub fn specs(config: &ComplianceConfig, overrides: Option<&TenantOverrides>) -> Vec<RuleSpec> {
        let disclosure = overrides
            .and_then(|overrides| overrides.ai_disclosure_text.clone())
            .unwrap_or_else(|| config.ai_disclosure_text.clone());

        let mut specs = vec![
            RuleSpec::RecordingNotice { text: config.recording_notice_text.clone() },
            RuleSpec::AiDisclosure { text: disclosure },
            RuleSpec::FairHousing {
                patterns: config
                    .fair_housing_patterns
                    .iter()
                    .chain(overrides.into_iter().flat_map(|overrides| &overrides.fair_housing_patterns))
                    .cloned()
                    .collect(),
            },
            RuleSpec::OptOutPromotional { markers: config.promotional_markers.clone() },
        ];
        if let Some(overrides) = overrides {
            specs.extend(
                overrides
                    .blocked_phrases
                    .iter()
                    .map(|phrase| RuleSpec::BlockedPhrase { phrase: phrase.clone() }),
            );
        }
        specs
    }

    pub fn compile(
        config: &ComplianceConfig,
        overrides: Option<&TenantOverrides>,
    ) -> Result<Self, RuleError> {
        let rules = Self::specs(config, overrides)
            .into_iter()
            .map(ComplianceRule::compile)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            rules,
            opt_out_keywords: config
                .opt_out_keywords
                .iter()
                .map(|keyword| opt_out_words(keyword).join(" "))
                .filter(|keyword| !keyword.is_empty())
                .collect(),
            opt_out_confirmation: config.opt_out_confirmation.clone(),
            sms_max_chars: config.sms_max_chars,
        })
    }

    /// Keyword an inbound message opts out with, if any. Keywords match as whole words anywhere
    /// in the message, ignoring case and punctuation, unless the next word turns them into an
    /// everyday phrase ("stop by", "end up").
    pub fn opt_out_keyword(&self, inbound: &str) -> Option<&str> {
        let words = opt_out_words(inbound);
        self.opt_out_keywords
            .iter()
            .find(|keyword| {
                let phrase: Vec<&str> = keyword.split_whitespace().collect();
                words.windows(phrase.len()).enumerate().any(|(start, window)| {
                    window.iter().zip(&phrase).all(|(word, expected)| word == expected)
                        && !words
                            .get(start + phrase.len())
                            .is_some_and(|next| OPT_OUT_CONTINUATIONS.contains(&next.as_str()))
                })
            })
            .map(String::as_str)
    }
}

fn opt_out_words(text: &str) -> Vec<String> {
    text.split(|ch: char| !ch.is_alphanumeric() && ch != '\'')
        .map(|word| word.trim_matches('\'').to_uppercase())
        .filter(|word| !word.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{ComplianceRule, RuleError, RuleSet, RuleSpec};
    use crate::config::{ComplianceConfig, TenantOverrides};

    #[test]
    fn tenant_overrides_replace_disclosure_and_append_blocked_phrases() {
        let overrides = TenantOverrides {
            ai_disclosure_text: Some("Automated assistant for Acme Realty.".to_owned()),
            blocked_phrases: vec!["Guaranteed appreciation".to_owned()],
            ..TenantOverrides::default()
        };
        let rules = RuleSet::compile(&ComplianceConfig::default(), Some(&overrides)).expect("compile");

        let names: Vec<&str> = rules.rules.iter().map(ComplianceRule::name).collect();
        assert_eq!(
            names,
            vec!["recording_notice", "ai_disclosure", "fair_housing", "opt_out_promotional", "blocked_phrase"]
        );
        assert!(matches!(
            &rules.rules[1],
            ComplianceRule::AiDisclosure { text } if text.starts_with("Automated assistant")
        ));
        assert!(matches!(
            &rules.rules[4],
            ComplianceRule::BlockedPhrase { phrase } if phrase == "guaranteed appreciation"
        ));
    }

    #[test]
    fn invalid_pattern_is_reported() {
        let error = ComplianceRule::compile(RuleSpec::FairHousing { patterns: vec!["(".to_owned()] })
            .expect_err("bad pattern");
        assert!(matches!(error, RuleError::InvalidPattern { ref pattern, .. } if pattern == "("));
    }

    #[test]
    fn opt_out_keywords_match_whole_words_anywhere() {
        let rules = RuleSet::compile(&ComplianceConfig::default(), None).expect("compile");

        assert_eq!(rules.opt_out_keyword("STOP"), Some("STOP"));
        assert_eq!(rules.opt_out_keyword("Stop texting me"), Some("STOP"));
        assert_eq!(rules.opt_out_keyword("please unsubscribe me"), Some("UNSUBSCRIBE"));
        assert_eq!(rules.opt_out_keyword("STOP!! wrong number"), Some("STOP"));
        assert_eq!(rules.opt_out_keyword("I'd like to opt-out."), Some("OPT OUT"));
        assert_eq!(rules.opt_out_keyword("  unsubscribe please! "), Some("UNSUBSCRIBE"));
    }

    #[test]
    fn everyday_phrases_are_not_opt_outs() {
        let rules = RuleSet::compile(&ComplianceConfig::default(), None).expect("compile");

        assert_eq!(rules.opt_out_keyword("can you stop by the open house?"), None);
        assert_eq!(rules.opt_out_keyword("I'll stop in Saturday"), None);
        assert_eq!(rules.opt_out_keyword("we may end up renting first"), None);
        assert_eq!(rules.opt_out_keyword("is the showing at the end of the month?"), None);
        assert_eq!(rules.opt_out_keyword("unstoppable market right now"), None);
        assert_eq!(rules.opt_out_keyword("stop by, then STOP texting"), Some("STOP"));
    }

    #[test]
    fn rule_specs_deserialize_from_tagged_toml() {
        let spec: RuleSpec = toml::from_str("kind = \"blocked_phrase\"\nphrase = \"cash only\"")
            .expect("parse");
        assert_eq!(spec, RuleSpec::BlockedPhrase { phrase: "cash only".to_owned() });
    }
}
