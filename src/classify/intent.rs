//! Intent detection.
//!
//! Seven categories; each non-general category carries a keyword list and
//! a regex list. A keyword hit scores 1, a regex hit scores 2; the argmax
//! category wins when its score is positive, otherwise the prompt is
//! `general`.

use crate::config::Strength;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

/// Detected prompt intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Code,
    Math,
    Analysis,
    Creative,
    Translation,
    Qa,
    General,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Code => "code",
            Intent::Math => "math",
            Intent::Analysis => "analysis",
            Intent::Creative => "creative",
            Intent::Translation => "translation",
            Intent::Qa => "qa",
            Intent::General => "general",
        }
    }

    /// Model strengths the router should favor for this intent.
    pub fn required_strengths(&self) -> &'static [Strength] {
        match self {
            Intent::Code => &[Strength::Code, Strength::Reasoning],
            Intent::Math => &[Strength::Math, Strength::Reasoning],
            Intent::Analysis => &[Strength::Analysis, Strength::Reasoning],
            Intent::Creative => &[Strength::Creative],
            Intent::Translation => &[Strength::Translation],
            Intent::Qa => &[Strength::Qa, Strength::Summarization],
            Intent::General => &[],
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct IntentRule {
    intent: Intent,
    keywords: &'static [&'static str],
    patterns: Vec<Regex>,
}

fn compile(sources: &[&str]) -> Vec<Regex> {
    sources
        .iter()
        .map(|s| Regex::new(s).expect("intent regex is valid"))
        .collect()
}

static RULES: LazyLock<Vec<IntentRule>> = LazyLock::new(|| {
    vec![
        IntentRule {
            intent: Intent::Code,
            keywords: &[
                "code", "function", "debug", "compile", "refactor", "implement", "bug",
                "script", "class", "api",
            ],
            patterns: compile(&[r"```", r"\bdef\s+\w+", r"\bfn\s+\w+", r"\bconst\s+\w+\s*="]),
        },
        IntentRule {
            intent: Intent::Math,
            keywords: &[
                "calculate",
                "compute",
                "solve",
                "equation",
                "integral",
                "derivative",
                "probability",
                "variance",
                "estimator",
                "theorem",
                "proof",
                "matrix",
            ],
            patterns: compile(&[
                r"\d+\s*[-+*/^]\s*\d+",
                r"\b(sin|cos|tan|log|ln|exp)\b",
                r"\bd/dx\b",
            ]),
        },
        IntentRule {
            intent: Intent::Analysis,
            keywords: &[
                "analyze",
                "analysis",
                "compare",
                "evaluate",
                "assess",
                "pros and cons",
                "trade-off",
                "tradeoff",
                "implications",
            ],
            patterns: compile(&[
                r"\bcompare\s+\w+\s+(and|vs|versus)\b",
                r"\bwhat\s+are\s+the\s+(implications|consequences)\b",
            ]),
        },
        IntentRule {
            intent: Intent::Creative,
            keywords: &[
                "story",
                "poem",
                "haiku",
                "creative",
                "fiction",
                "imagine",
                "brainstorm",
                "slogan",
                "lyrics",
            ],
            patterns: compile(&[r"\bwrite\s+a\s+(story|poem|song|haiku)\b", r"\bonce\s+upon\b"]),
        },
        IntentRule {
            intent: Intent::Translation,
            keywords: &[
                "translate",
                "translation",
                "in spanish",
                "in french",
                "in german",
                "in japanese",
                "in chinese",
            ],
            patterns: compile(&[
                r"\btranslate\b.+\b(to|into)\s+\w+",
                r"\bhow\s+do\s+you\s+say\b",
            ]),
        },
        IntentRule {
            intent: Intent::Qa,
            keywords: &[
                "what is", "what are", "who is", "who was", "when did", "where is",
                "how many", "define", "explain",
            ],
            patterns: compile(&[r"^\s*(what|who|when|where|why|how)\b", r"\?\s*$"]),
        },
    ]
});

/// Detect the prompt intent and a confidence in `[0, 1]`.
///
/// Confidence is the winning category's share of the total score across
/// all categories; zero total means `general` with zero confidence.
pub fn detect(prompt: &str) -> (Intent, f64) {
    let lower = prompt.to_lowercase();

    let mut best: Option<(Intent, u32)> = None;
    let mut total = 0u32;

    for rule in RULES.iter() {
        let keyword_hits = rule.keywords.iter().filter(|k| lower.contains(*k)).count() as u32;
        let regex_hits = rule.patterns.iter().filter(|p| p.is_match(&lower)).count() as u32;
        let score = keyword_hits + 2 * regex_hits;
        total += score;
        match best {
            Some((_, s)) if s >= score => {}
            _ => best = Some((rule.intent, score)),
        }
    }

    match best {
        Some((intent, score)) if score > 0 => (intent, score as f64 / total as f64),
        _ => (Intent::General, 0.0),
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_code_intent() {
        let (intent, conf) = detect("Debug this function:\n```rust\nfn main() {}\n```");
        assert_eq!(intent, Intent::Code);
        assert!(conf > 0.0 && conf <= 1.0);
    }

    #[test]
    fn test_detect_math_intent() {
        let (intent, _) = detect(
            "Derive the asymptotic variance of the maximum-likelihood estimator \
             for a Pareto distribution",
        );
        assert_eq!(intent, Intent::Math);
    }

    #[test]
    fn test_detect_translation_intent() {
        let (intent, _) = detect("Translate 'good morning' into Spanish");
        assert_eq!(intent, Intent::Translation);
    }

    #[test]
    fn test_detect_creative_intent() {
        let (intent, _) = detect("Write a poem about the sea");
        assert_eq!(intent, Intent::Creative);
    }

    #[test]
    fn test_detect_qa_intent() {
        let (intent, _) = detect("What is the capital of France?");
        assert_eq!(intent, Intent::Qa);
    }

    #[test]
    fn test_no_signals_is_general_with_zero_confidence() {
        let (intent, conf) = detect("zzz qqq vvv");
        assert_eq!(intent, Intent::General);
        assert_eq!(conf, 0.0);
    }

    #[test]
    fn test_regex_hits_weigh_double() {
        // One regex hit (fenced block) should beat a single keyword elsewhere
        let (intent, _) = detect("```\nexplain\n```");
        assert_eq!(intent, Intent::Code);
    }

    #[test]
    fn test_confidence_is_winner_share_of_total() {
        // "explain" hits qa keyword only; single-category total → confidence 1.0
        let (intent, conf) = detect("explain this please");
        assert_eq!(intent, Intent::Qa);
        assert!((conf - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_first_category_wins_ties() {
        // Zero-score tie is general; equal positive scores resolve to the
        // earlier category in rule order.
        let (intent, _) = detect("implement the equation");
        // code: "implement" = 1; math: "equation" = 1 → code listed first
        assert_eq!(intent, Intent::Code);
    }

    #[test]
    fn test_required_strengths_mapping() {
        assert_eq!(
            Intent::Math.required_strengths(),
            &[Strength::Math, Strength::Reasoning]
        );
        assert!(Intent::General.required_strengths().is_empty());
    }
}
