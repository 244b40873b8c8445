//! Risk-keyword classification.
//!
//! Three ordered keyword sets (CRITICAL, HIGH, MEDIUM); the first set with a
//! match decides the level. Strong negative sentiment lifts a LOW result to
//! MEDIUM. Categories come from a fixed lookup so dashboards can group
//! detections without parsing keywords.

use vox_core::types::RiskLevel;

/// Sentiment at or below this lifts LOW to MEDIUM.
const NEGATIVE_LIFT_THRESHOLD: f64 = -0.6;

/// Numeric base score per level, bumped by negative sentiment and clamped to
/// [0, 1]. The intervention predicate compares this against the agent's
/// auto-handoff threshold.
fn base_score(level: RiskLevel) -> f64 {
    match level {
        RiskLevel::Low => 0.1,
        RiskLevel::Medium => 0.4,
        RiskLevel::High => 0.7,
        RiskLevel::Critical => 0.95,
    }
}

/// One classification outcome.
#[derive(Debug, Clone)]
pub struct RiskScore {
    pub level: RiskLevel,
    pub score: f64,
    pub matched_keywords: Vec<String>,
    pub category: String,
}

#[derive(Debug, Clone)]
pub struct RiskClassifier {
    critical: Vec<String>,
    high: Vec<String>,
    medium: Vec<String>,
}

impl Default for RiskClassifier {
    fn default() -> Self {
        Self {
            critical: to_owned(&[
                "sue",
                "lawsuit",
                "lawyer",
                "attorney",
                "legal action",
                "suicide",
                "hurt myself",
                "kill",
                "emergency",
            ]),
            high: to_owned(&[
                "manager",
                "supervisor",
                "real person",
                "human being",
                "speak to a human",
                "cancel my account",
                "close my account",
                "scam",
                "fraud",
            ]),
            medium: to_owned(&[
                "cancel",
                "refund",
                "complaint",
                "unacceptable",
                "competitor",
                "switch provider",
                "terrible service",
            ]),
        }
    }
}

impl RiskClassifier {
    /// Build from the agent's guardian config row; empty lists fall back to
    /// the defaults for that tier.
    pub fn from_keywords(
        critical: Vec<String>,
        high: Vec<String>,
        medium: Vec<String>,
    ) -> Self {
        let defaults = Self::default();
        Self {
            critical: non_empty_or(critical, defaults.critical),
            high: non_empty_or(high, defaults.high),
            medium: non_empty_or(medium, defaults.medium),
        }
    }

    /// Classify one utterance. `sentiment` is the compound score of the same
    /// text.
    pub fn classify(&self, text: &str, sentiment: f64) -> RiskScore {
        let normalized = normalize(text);

        // First non-empty match wins, highest tier first.
        let tiers: [(&[String], RiskLevel); 3] = [
            (&self.critical, RiskLevel::Critical),
            (&self.high, RiskLevel::High),
            (&self.medium, RiskLevel::Medium),
        ];

        for (keywords, level) in tiers {
            let matched: Vec<String> = keywords
                .iter()
                .filter(|k| contains_keyword(&normalized, k))
                .cloned()
                .collect();
            if !matched.is_empty() {
                let category = category_of(&matched[0]);
                let score = (base_score(level) + negative_bump(sentiment)).min(1.0);
                return RiskScore {
                    level,
                    score,
                    matched_keywords: matched,
                    category,
                };
            }
        }

        // No keyword hit: LOW, lifted to MEDIUM on strong negative sentiment.
        let level = if sentiment <= NEGATIVE_LIFT_THRESHOLD {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };
        RiskScore {
            level,
            score: (base_score(level) + negative_bump(sentiment)).min(1.0),
            matched_keywords: Vec::new(),
            category: "general".to_string(),
        }
    }
}

fn negative_bump(sentiment: f64) -> f64 {
    if sentiment < 0.0 {
        sentiment.abs() * 0.2
    } else {
        0.0
    }
}

/// Fixed keyword → category lookup.
fn category_of(keyword: &str) -> String {
    let category = match keyword {
        "sue" | "lawsuit" | "lawyer" | "attorney" | "legal action" => "legal_threat",
        "suicide" | "hurt myself" | "kill" | "emergency" => "safety_concern",
        "manager" | "supervisor" | "real person" | "human being" | "speak to a human" => {
            "escalation_request"
        }
        "cancel" | "cancel my account" | "close my account" | "refund" | "competitor"
        | "switch provider" => "churn_risk",
        "scam" | "fraud" => "trust_concern",
        _ => "general",
    };
    category.to_string()
}

fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push(' ');
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            out.extend(ch.to_lowercase());
        } else {
            out.push(' ');
        }
    }
    out.push(' ');
    out
}

/// Word-boundary keyword match: "sue" hits "sue you", not "pursue".
fn contains_keyword(normalized: &str, keyword: &str) -> bool {
    let needle = format!(" {} ", normalize(keyword).trim());
    normalized.contains(&needle)
}

fn to_owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn non_empty_or(items: Vec<String>, fallback: Vec<String>) -> Vec<String> {
    if items.is_empty() {
        fallback
    } else {
        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sue_is_critical_legal_threat() {
        let score = RiskClassifier::default()
            .classify("I'm going to sue you if this isn't fixed.", -0.4);
        assert_eq!(score.level, RiskLevel::Critical);
        assert_eq!(score.matched_keywords, vec!["sue"]);
        assert_eq!(score.category, "legal_threat");
        assert!(score.score >= 0.95);
    }

    #[test]
    fn word_boundaries_prevent_substring_hits() {
        let score = RiskClassifier::default().classify("I will pursue other options", 0.0);
        assert_eq!(score.level, RiskLevel::Low);
        assert!(score.matched_keywords.is_empty());
    }

    #[test]
    fn first_nonempty_tier_wins() {
        // both "sue" (critical) and "manager" (high) present → critical
        let score = RiskClassifier::default().classify("get me a manager or I sue", 0.0);
        assert_eq!(score.level, RiskLevel::Critical);
    }

    #[test]
    fn escalation_request_category() {
        let score = RiskClassifier::default().classify("let me speak to a manager", 0.0);
        assert_eq!(score.level, RiskLevel::High);
        assert_eq!(score.category, "escalation_request");
    }

    #[test]
    fn strong_negative_sentiment_lifts_low_to_medium() {
        let classifier = RiskClassifier::default();
        let calm = classifier.classify("the weather is fine", 0.0);
        assert_eq!(calm.level, RiskLevel::Low);

        let seething = classifier.classify("everything about this experience", -0.8);
        assert_eq!(seething.level, RiskLevel::Medium);
    }

    #[test]
    fn custom_keywords_replace_defaults_per_tier() {
        let classifier = RiskClassifier::from_keywords(
            vec!["chargeback".into()],
            vec![],
            vec![],
        );
        let score = classifier.classify("I will file a chargeback", 0.0);
        assert_eq!(score.level, RiskLevel::Critical);
        // high tier kept its defaults
        let score = classifier.classify("give me a manager", 0.0);
        assert_eq!(score.level, RiskLevel::High);
    }

    #[test]
    fn multiword_keywords_match() {
        let score = RiskClassifier::default().classify("I will take legal action now", 0.0);
        assert_eq!(score.level, RiskLevel::Critical);
        assert_eq!(score.matched_keywords, vec!["legal action"]);
    }
}
