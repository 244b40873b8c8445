//! Deterministic lexical sentiment scoring.
//!
//! A compact valence lexicon with negation flips and booster scaling,
//! normalised into a compound score in [-1, +1] by x / √(x² + α). The same
//! text always produces the same score, which is what makes the guardian's
//! running mean testable.

/// Normalisation constant for the compound score.
const ALPHA: f64 = 15.0;
/// Scalar applied to a term's valence when a negator precedes it.
const NEGATION_FACTOR: f64 = -0.74;
/// Valence added (or subtracted for negative terms) by an intensifier.
const BOOST: f64 = 0.293;
/// How many preceding tokens are scanned for negators and boosters.
const LOOKBACK: usize = 3;

/// (term, valence) pairs, sorted by term for binary search. Valences follow
/// the usual -4..+4 convention of lexicon-based sentiment scoring.
const LEXICON: &[(&str, f64)] = &[
    ("amazing", 2.8),
    ("angry", -2.3),
    ("annoyed", -1.8),
    ("appreciate", 1.8),
    ("awesome", 3.1),
    ("awful", -2.0),
    ("bad", -2.5),
    ("broken", -1.8),
    ("cancel", -1.3),
    ("complaint", -1.6),
    ("disappointed", -2.1),
    ("disgusted", -2.4),
    ("excellent", 2.7),
    ("fail", -2.3),
    ("failed", -2.3),
    ("fantastic", 2.6),
    ("frustrated", -2.1),
    ("furious", -2.9),
    ("glad", 1.7),
    ("good", 1.9),
    ("great", 3.1),
    ("happy", 2.7),
    ("hate", -2.7),
    ("help", 1.2),
    ("helpful", 1.8),
    ("horrible", -2.5),
    ("love", 3.2),
    ("nice", 1.8),
    ("outraged", -2.7),
    ("perfect", 2.7),
    ("pleased", 1.9),
    ("problem", -1.4),
    ("refund", -0.9),
    ("resolved", 1.5),
    ("ridiculous", -1.9),
    ("scam", -2.9),
    ("sue", -1.9),
    ("terrible", -2.1),
    ("thank", 1.9),
    ("thanks", 1.9),
    ("unacceptable", -2.4),
    ("upset", -1.9),
    ("useless", -1.9),
    ("waste", -1.8),
    ("wonderful", 2.7),
    ("works", 1.2),
    ("worst", -3.1),
    ("wrong", -1.6),
];

const NEGATORS: &[&str] = &[
    "not", "no", "never", "neither", "nobody", "none", "cannot", "cant", "dont", "wont", "isnt",
    "wasnt", "shouldnt", "couldnt", "didnt", "doesnt",
];

const BOOSTERS: &[&str] = &[
    "very", "really", "extremely", "absolutely", "completely", "totally", "so", "incredibly",
];

fn valence(token: &str) -> Option<f64> {
    LEXICON
        .binary_search_by(|(term, _)| term.cmp(&token))
        .ok()
        .map(|i| LEXICON[i].1)
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|t| !t.is_empty())
        .map(|t| t.replace('\'', "").to_lowercase())
        .collect()
}

/// Compound sentiment of one utterance, in [-1, +1].
pub fn compound_score(text: &str) -> f64 {
    let tokens = tokenize(text);
    let mut total = 0.0;

    for (i, token) in tokens.iter().enumerate() {
        let Some(mut v) = valence(token) else {
            continue;
        };

        let window_start = i.saturating_sub(LOOKBACK);
        let window = &tokens[window_start..i];
        for prior in window {
            if BOOSTERS.contains(&prior.as_str()) {
                v += if v >= 0.0 { BOOST } else { -BOOST };
            }
        }
        if window.iter().any(|t| NEGATORS.contains(&t.as_str())) {
            v *= NEGATION_FACTOR;
        }

        total += v;
    }

    if total == 0.0 {
        return 0.0;
    }
    let compound = total / (total * total + ALPHA).sqrt();
    compound.clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexicon_is_sorted_for_binary_search() {
        for pair in LEXICON.windows(2) {
            assert!(pair[0].0 < pair[1].0, "{} >= {}", pair[0].0, pair[1].0);
        }
    }

    #[test]
    fn neutral_text_scores_zero() {
        assert_eq!(compound_score("the package arrives on Tuesday"), 0.0);
        assert_eq!(compound_score(""), 0.0);
    }

    #[test]
    fn polarity_matches_content() {
        assert!(compound_score("this is great, thank you so much") > 0.3);
        assert!(compound_score("this is terrible and I am furious") < -0.3);
    }

    #[test]
    fn negation_flips_polarity() {
        let plain = compound_score("this is good");
        let negated = compound_score("this is not good");
        assert!(plain > 0.0);
        assert!(negated < 0.0);
    }

    #[test]
    fn boosters_intensify() {
        let plain = compound_score("I am upset");
        let boosted = compound_score("I am extremely upset");
        assert!(boosted < plain);
    }

    #[test]
    fn score_is_deterministic_and_bounded() {
        let text = "I absolutely hate this useless broken terrible horrible worst scam";
        let a = compound_score(text);
        let b = compound_score(text);
        assert_eq!(a, b);
        assert!((-1.0..=1.0).contains(&a));
        assert!(a < -0.8);
    }
}
