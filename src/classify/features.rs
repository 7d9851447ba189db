//! Prompt feature extraction.
//!
//! Produces the 15-value feature vector consumed by both the heuristic
//! tier scorer and the learned classifier. Every feature is normalized to
//! `[0, 1]` by a fixed cap so the two paths share one contract.

use regex::Regex;
use std::sync::LazyLock;

/// Technical-jargon lexicon for the tech-density feature.
const TECH_TERMS: &[&str] = &[
    "algorithm",
    "architecture",
    "implementation",
    "optimization",
    "performance",
    "scalability",
    "concurrency",
    "asynchronous",
    "middleware",
    "microservice",
    "database",
    "schema",
    "encryption",
    "authentication",
    "authorization",
    "infrastructure",
    "deployment",
    "configuration",
    "abstraction",
    "inheritance",
    "polymorphism",
    "encapsulation",
    "normalization",
    "denormalization",
    "serialization",
    "deserialization",
];

/// Phrases that signal multi-step reasoning demands.
const REASONING_PHRASES: &[&str] = &[
    "step-by-step",
    "explain why",
    "reason through",
    "think about",
    "consider",
    "analyze",
    "evaluate",
    "compare and contrast",
    "what are the implications",
    "how would you approach",
    "design a system",
];

const CONSTRAINT_WORDS: &[&str] = &[
    "must",
    "should",
    "exactly",
    "precisely",
    "no more than",
    "at least",
    "between",
];

const FORMAT_WORDS: &[&str] = &[
    "json", "xml", "csv", "markdown", "table", "list", "bullet", "format as", "output as",
];

const PRIOR_REFERENCE_WORDS: &[&str] = &[
    "above",
    "previous",
    "earlier",
    "you said",
    "you mentioned",
    "as i said",
];

static DIGIT_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+").expect("digit-run regex is valid"));

/// The 15 normalized features, in model input order.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct FeatureVector {
    pub char_count: f64,
    pub word_count: f64,
    pub sentence_count: f64,
    pub avg_word_length: f64,
    pub avg_sentence_length: f64,
    pub type_token_ratio: f64,
    pub code_indicator: f64,
    pub question_depth: f64,
    pub structural_complexity: f64,
    pub tech_density: f64,
    pub reasoning_density: f64,
    pub specificity: f64,
    pub prior_reference: f64,
    pub numerical_density: f64,
    pub large_numbers: f64,
}

impl FeatureVector {
    /// Flatten to the array shape the learned classifier consumes.
    pub fn to_array(&self) -> [f64; 15] {
        [
            self.char_count,
            self.word_count,
            self.sentence_count,
            self.avg_word_length,
            self.avg_sentence_length,
            self.type_token_ratio,
            self.code_indicator,
            self.question_depth,
            self.structural_complexity,
            self.tech_density,
            self.reasoning_density,
            self.specificity,
            self.prior_reference,
            self.numerical_density,
            self.large_numbers,
        ]
    }
}

/// Extract the feature vector from a raw prompt.
pub fn extract(prompt: &str) -> FeatureVector {
    let lower = prompt.to_lowercase();
    let words: Vec<&str> = prompt.split_whitespace().collect();
    let sentences = sentence_count(prompt);

    let char_count = cap(prompt.chars().count() as f64 / 5000.0);
    let word_count = cap(words.len() as f64 / 1000.0);
    let sentence_count_n = cap(sentences as f64 / 50.0);

    let total_word_len: usize = words.iter().map(|w| w.chars().count()).sum();
    let avg_word_length = cap(total_word_len as f64 / words.len().max(1) as f64 / 12.0);
    let avg_sentence_length = cap(words.len() as f64 / sentences.max(1) as f64 / 40.0);

    let mut unique: Vec<String> = words.iter().map(|w| w.to_lowercase()).collect();
    unique.sort_unstable();
    unique.dedup();
    let type_token_ratio = unique.len() as f64 / words.len().max(1) as f64;

    let fence_count = prompt.matches("```").count() / 2;
    let backticks = prompt.matches('`').count();
    let code_indicator = if fence_count > 0 {
        1.0
    } else if backticks >= 2 {
        0.5
    } else {
        0.0
    };

    let question_depth = cap(prompt.matches('?').count() as f64 / 3.0);

    let mut bullets = 0usize;
    let mut numbered = 0usize;
    for line in prompt.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('-') || trimmed.starts_with('*') || trimmed.starts_with('•') {
            bullets += 1;
        } else if trimmed.chars().next().is_some_and(|c| c.is_ascii_digit()) {
            numbered += 1;
        }
    }
    let structural_complexity = cap((bullets + numbered) as f64 / 5.0);

    let tech_hits = TECH_TERMS.iter().filter(|t| lower.contains(*t)).count();
    let tech_density = cap(tech_hits as f64 / 5.0);

    let reasoning_hits = REASONING_PHRASES
        .iter()
        .filter(|p| lower.contains(*p))
        .count();
    let reasoning_density = cap(reasoning_hits as f64 / 3.0);

    let has_constraints = CONSTRAINT_WORDS.iter().any(|w| lower.contains(w));
    let has_format = FORMAT_WORDS.iter().any(|w| lower.contains(w));
    let specificity = if has_constraints { 0.5 } else { 0.0 } + if has_format { 0.5 } else { 0.0 };

    let prior_reference = if PRIOR_REFERENCE_WORDS.iter().any(|w| lower.contains(w)) {
        1.0
    } else {
        0.0
    };

    let mut runs = 0usize;
    let mut large_numbers = 0.0;
    for m in DIGIT_RUNS.find_iter(prompt) {
        runs += 1;
        // Runs too long for u64 are certainly large
        let is_large = m
            .as_str()
            .parse::<u64>()
            .map(|n| n > 1000)
            .unwrap_or(m.as_str().len() > 4);
        if is_large {
            large_numbers = 1.0;
        }
    }
    let numerical_density = cap(runs as f64 / 10.0);

    FeatureVector {
        char_count,
        word_count,
        sentence_count: sentence_count_n,
        avg_word_length,
        avg_sentence_length,
        type_token_ratio,
        code_indicator,
        question_depth,
        structural_complexity,
        tech_density,
        reasoning_density,
        specificity,
        prior_reference,
        numerical_density,
        large_numbers,
    }
}

/// Count sentences: `!` and `?` fold into `.`, then non-empty segments.
fn sentence_count(prompt: &str) -> usize {
    prompt
        .replace(['!', '?'], ".")
        .split('.')
        .filter(|s| !s.trim().is_empty())
        .count()
}

fn cap(value: f64) -> f64 {
    value.min(1.0)
}

// ── Tests ──────────────────────────────────────────────────────────────
