//! Model routing.
//!
//! The [`ModelRouter`] takes a prompt classification, a tenant strategy,
//! and live signals (bandit scores, benchmark observations, breaker
//! states, allowlists) and produces an ordered candidate list with a
//! six-axis score breakdown for each model.

mod router;

pub use router::{ModelRouter, RouteDecision, RouteQuery, ScoreBreakdown, ScoredModel};
