//! Gateway configuration: environment wiring, the static model catalog,
//! and the routing strategy weight profiles.
//!
//! ## Environment Variables
//!
//! - `OPENAI_API_KEY`, `ANTHROPIC_API_KEY`, `GEMINI_API_KEY`,
//!   `GROQ_API_KEY`, `COHERE_API_KEY`: upstream credentials. A missing key
//!   switches that provider off; if all are absent the gateway runs in mock
//!   mode and serves canned completions.
//! - `FRACTAL_HOST` / `FRACTAL_PORT`: bind address (default `0.0.0.0:8080`)
//! - `FRACTAL_DB_PATH`: SQLite database file (default `fractal.db`)
//! - `FRACTAL_CLASSIFIER_PATH`: optional learned tier-classifier weights

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Providers
// ============================================================================

/// Upstream vendors the gateway can dispatch to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Anthropic,
    Gemini,
    Groq,
    Cohere,
    /// Local canned-completion backend used when no upstream key is set.
    Mock,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Gemini => "gemini",
            Provider::Groq => "groq",
            Provider::Cohere => "cohere",
            Provider::Mock => "mock",
        }
    }

    /// All real upstream providers, in catalog order.
    pub fn upstreams() -> &'static [Provider] {
        &[
            Provider::OpenAi,
            Provider::Anthropic,
            Provider::Gemini,
            Provider::Groq,
            Provider::Cohere,
        ]
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "openai" => Ok(Provider::OpenAi),
            "anthropic" => Ok(Provider::Anthropic),
            "gemini" => Ok(Provider::Gemini),
            "groq" => Ok(Provider::Groq),
            "cohere" => Ok(Provider::Cohere),
            "mock" => Ok(Provider::Mock),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

// ============================================================================
// Model catalog
// ============================================================================

/// Capability tags a model can carry; matched against the detected intent
/// when computing the quality-match score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strength {
    Code,
    Math,
    Reasoning,
    Analysis,
    Creative,
    Translation,
    Qa,
    Summarization,
}

/// One entry in the static model catalog. Immutable at runtime; live
/// latency/reliability observations are blended in by the router, never
/// written back here.
#[derive(Debug, Clone, Serialize)]
pub struct ModelEntry {
    pub id: &'static str,
    pub provider: Provider,
    /// USD per 1M input tokens.
    pub input_cost_per_1m: f64,
    /// USD per 1M output tokens.
    pub output_cost_per_1m: f64,
    /// Baseline latency used until live benchmarks accumulate.
    pub avg_latency_ms: f64,
    /// Baseline reliability in [0, 1].
    pub reliability: f64,
    /// Relative energy intensity per token (dimensionless, >= 0).
    pub energy_intensity: f64,
    /// Intrinsic quality score, 0–100.
    pub quality_score: f64,
    pub strengths: &'static [Strength],
}

impl ModelEntry {
    /// Averaged per-1M-token cost used by the router's cost axis.
    pub fn avg_cost(&self) -> f64 {
        (self.input_cost_per_1m + self.output_cost_per_1m) / 2.0
    }

    /// Dollar cost of a completed request given actual token counts.
    pub fn cost_for(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        input_tokens as f64 / 1_000_000.0 * self.input_cost_per_1m
            + output_tokens as f64 / 1_000_000.0 * self.output_cost_per_1m
    }
}

/// The static model catalog. Insertion order is significant: router ties
/// break toward earlier entries.
pub const CATALOG: &[ModelEntry] = &[
    ModelEntry {
        id: "gpt-4o",
        provider: Provider::OpenAi,
        input_cost_per_1m: 2.50,
        output_cost_per_1m: 10.00,
        avg_latency_ms: 1200.0,
        reliability: 0.97,
        energy_intensity: 0.60,
        quality_score: 95.0,
        strengths: &[Strength::Code, Strength::Reasoning, Strength::Analysis],
    },
    ModelEntry {
        id: "gpt-4o-mini",
        provider: Provider::OpenAi,
        input_cost_per_1m: 0.15,
        output_cost_per_1m: 0.60,
        avg_latency_ms: 700.0,
        reliability: 0.97,
        energy_intensity: 0.15,
        quality_score: 82.0,
        strengths: &[Strength::Qa, Strength::Summarization, Strength::Code],
    },
    ModelEntry {
        id: "claude-sonnet-4",
        provider: Provider::Anthropic,
        input_cost_per_1m: 3.00,
        output_cost_per_1m: 15.00,
        avg_latency_ms: 1500.0,
        reliability: 0.96,
        energy_intensity: 0.65,
        quality_score: 96.0,
        strengths: &[
            Strength::Code,
            Strength::Reasoning,
            Strength::Analysis,
            Strength::Creative,
        ],
    },
    ModelEntry {
        id: "claude-3-5-haiku",
        provider: Provider::Anthropic,
        input_cost_per_1m: 0.80,
        output_cost_per_1m: 4.00,
        avg_latency_ms: 600.0,
        reliability: 0.97,
        energy_intensity: 0.20,
        quality_score: 85.0,
        strengths: &[Strength::Qa, Strength::Summarization, Strength::Translation],
    },
    ModelEntry {
        id: "gemini-1.5-pro",
        provider: Provider::Gemini,
        input_cost_per_1m: 1.25,
        output_cost_per_1m: 5.00,
        avg_latency_ms: 1400.0,
        reliability: 0.94,
        energy_intensity: 0.50,
        quality_score: 90.0,
        strengths: &[Strength::Reasoning, Strength::Math, Strength::Analysis],
    },
    ModelEntry {
        id: "gemini-2.0-flash",
        provider: Provider::Gemini,
        input_cost_per_1m: 0.10,
        output_cost_per_1m: 0.40,
        avg_latency_ms: 500.0,
        reliability: 0.95,
        energy_intensity: 0.10,
        quality_score: 80.0,
        strengths: &[Strength::Qa, Strength::Translation, Strength::Summarization],
    },
    ModelEntry {
        id: "llama-3.3-70b-versatile",
        provider: Provider::Groq,
        input_cost_per_1m: 0.59,
        output_cost_per_1m: 0.79,
        avg_latency_ms: 300.0,
        reliability: 0.93,
        energy_intensity: 0.08,
        quality_score: 78.0,
        strengths: &[Strength::Code, Strength::Qa],
    },
    ModelEntry {
        id: "llama-3.1-8b-instant",
        provider: Provider::Groq,
        input_cost_per_1m: 0.05,
        output_cost_per_1m: 0.08,
        avg_latency_ms: 150.0,
        reliability: 0.93,
        energy_intensity: 0.03,
        quality_score: 62.0,
        strengths: &[Strength::Qa, Strength::Summarization],
    },
    ModelEntry {
        id: "command-r-plus",
        provider: Provider::Cohere,
        input_cost_per_1m: 2.50,
        output_cost_per_1m: 10.00,
        avg_latency_ms: 900.0,
        reliability: 0.92,
        energy_intensity: 0.40,
        quality_score: 84.0,
        strengths: &[Strength::Analysis, Strength::Qa, Strength::Summarization],
    },
    ModelEntry {
        id: "command-r",
        provider: Provider::Cohere,
        input_cost_per_1m: 0.15,
        output_cost_per_1m: 0.60,
        avg_latency_ms: 500.0,
        reliability: 0.92,
        energy_intensity: 0.15,
        quality_score: 72.0,
        strengths: &[Strength::Qa, Strength::Translation],
    },
];

/// Look up a catalog entry by model id.
pub fn find_model(id: &str) -> Option<&'static ModelEntry> {
    CATALOG.iter().find(|m| m.id == id)
}

// ============================================================================
// Routing strategies
// ============================================================================

/// Named routing objective. Each strategy is a fixed six-axis weight
/// profile; the weights always sum to 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    #[default]
    CostFirst,
    GreenFirst,
    PerformanceFirst,
    Balanced,
}

/// Per-axis weights applied to the normalized component scores.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StrategyWeights {
    pub cost: f64,
    pub quality: f64,
    pub latency: f64,
    pub energy: f64,
    pub reliability: f64,
    pub rl: f64,
}

impl Strategy {
    pub fn weights(&self) -> StrategyWeights {
        match self {
            Strategy::CostFirst => StrategyWeights {
                cost: 0.35,
                quality: 0.20,
                latency: 0.10,
                energy: 0.10,
                reliability: 0.10,
                rl: 0.15,
            },
            Strategy::GreenFirst => StrategyWeights {
                cost: 0.10,
                quality: 0.15,
                latency: 0.10,
                energy: 0.35,
                reliability: 0.10,
                rl: 0.20,
            },
            Strategy::PerformanceFirst => StrategyWeights {
                cost: 0.05,
                quality: 0.35,
                latency: 0.20,
                energy: 0.05,
                reliability: 0.20,
                rl: 0.15,
            },
            Strategy::Balanced => StrategyWeights {
                cost: 0.20,
                quality: 0.20,
                latency: 0.15,
                energy: 0.15,
                reliability: 0.15,
                rl: 0.15,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::CostFirst => "cost-first",
            Strategy::GreenFirst => "green-first",
            Strategy::PerformanceFirst => "performance-first",
            Strategy::Balanced => "balanced",
        }
    }

    pub fn all() -> &'static [Strategy] {
        &[
            Strategy::CostFirst,
            Strategy::GreenFirst,
            Strategy::PerformanceFirst,
            Strategy::Balanced,
        ]
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cost-first" => Ok(Strategy::CostFirst),
            "green-first" => Ok(Strategy::GreenFirst),
            "performance-first" => Ok(Strategy::PerformanceFirst),
            "balanced" => Ok(Strategy::Balanced),
            other => Err(format!("unknown strategy: {other}")),
        }
    }
}

// ============================================================================
// Gateway configuration
// ============================================================================

/// Runtime configuration assembled from the environment at startup.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub db_path: String,
    /// Optional path to learned classifier weights; `None` means the
    /// heuristic tier path is used.
    pub classifier_path: Option<String>,
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub groq_api_key: Option<String>,
    pub cohere_api_key: Option<String>,
}

impl GatewayConfig {
    /// Build configuration from environment variables.
    pub fn from_env() -> Self {
        let port = std::env::var("FRACTAL_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);

        Self {
            host: std::env::var("FRACTAL_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port,
            db_path: std::env::var("FRACTAL_DB_PATH").unwrap_or_else(|_| "fractal.db".to_string()),
            classifier_path: std::env::var("FRACTAL_CLASSIFIER_PATH").ok(),
            openai_api_key: non_empty_env("OPENAI_API_KEY"),
            anthropic_api_key: non_empty_env("ANTHROPIC_API_KEY"),
            gemini_api_key: non_empty_env("GEMINI_API_KEY"),
            groq_api_key: non_empty_env("GROQ_API_KEY"),
            cohere_api_key: non_empty_env("COHERE_API_KEY"),
        }
    }

    pub fn api_key_for(&self, provider: Provider) -> Option<&str> {
        match provider {
            Provider::OpenAi => self.openai_api_key.as_deref(),
            Provider::Anthropic => self.anthropic_api_key.as_deref(),
            Provider::Gemini => self.gemini_api_key.as_deref(),
            Provider::Groq => self.groq_api_key.as_deref(),
            Provider::Cohere => self.cohere_api_key.as_deref(),
            Provider::Mock => None,
        }
    }

    /// True when no upstream has a credential; the gateway then serves
    /// canned completions through the mock provider.
    pub fn mock_mode(&self) -> bool {
        Provider::upstreams()
            .iter()
            .all(|p| self.api_key_for(*p).is_none())
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

// ── Tests ──────────────────────────────────────────────────────────────
