//! Turn free-form generated text into a validated structure.
//!
//! The cascade, first success wins:
//!
//! 1. each extraction strategy in [`strategies::STRATEGIES`], its value
//!    decoded against the expected shape by [`schema::decode`]
//! 2. negative-result phrasing, which yields an empty but valid result
//! 3. names lifted out of prose
//! 4. the canonical fallback
//!
//! [`normalize`] never fails; callers always get something renderable and
//! learn how it was obtained from [`NormalizeOutcome`].

pub mod prose;
pub mod schema;
mod strategies;

pub use schema::{
    decode, Decoded, InfluenceNode, InfluenceTree, ItemKind, RecommendationItem, Recommendations,
    Reject, MAX_CHILDREN, MAX_DIRECT_NODES, MAX_FLAT_NODES, MAX_ITEMS,
};
pub use strategies::{balanced_end, extract_json_fragment, fix_json_issues, strip_markdown_fences};

use crate::subject::Shape;
use crate::util::truncate_str;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Description given to records synthesized from prose.
pub const PROSE_DESCRIPTION: &str = "Mentioned in the generated response.";

/// How a normalized result was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizeOutcome {
    /// JSON found and at least structurally valid
    Parsed,
    /// The response said nothing was found
    Empty,
    /// Names recovered from prose
    Prose,
    /// Placeholder records explaining the failure
    Fallback,
}

impl NormalizeOutcome {
    /// Worth keeping in the durable tier and charging quota for.
    pub fn is_cacheable(&self) -> bool {
        !matches!(self, NormalizeOutcome::Fallback)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub decoded: Decoded,
    pub outcome: NormalizeOutcome,
    /// Winning extraction strategy, when JSON was found.
    pub strategy: Option<&'static str>,
}

impl Normalized {
    fn new(decoded: Decoded, outcome: NormalizeOutcome) -> Self {
        Self {
            decoded,
            outcome,
            strategy: None,
        }
    }
}

pub fn normalize(raw: &str, shape: Shape) -> Normalized {
    if let Some((strategy, decoded)) = run_strategies(raw, shape) {
        tracing::debug!(strategy, records = decoded.len(), "normalized generated text");
        return Normalized {
            decoded,
            outcome: NormalizeOutcome::Parsed,
            strategy: Some(strategy),
        };
    }

    if prose::is_negative_result(raw) {
        tracing::debug!("generated text reports no results");
        return Normalized::new(empty(shape), NormalizeOutcome::Empty);
    }

    let names = prose::extract_names(raw);
    if !names.is_empty() {
        tracing::debug!(names = names.len(), "recovered names from prose");
        return Normalized::new(from_names(names, shape), NormalizeOutcome::Prose);
    }

    tracing::debug!(
        preview = truncate_str(raw.trim(), 120),
        "no usable structure in generated text, using fallback"
    );
    Normalized::new(fallback(shape), NormalizeOutcome::Fallback)
}

fn run_strategies(raw: &str, shape: Shape) -> Option<(&'static str, Decoded)> {
    strategies::STRATEGIES.iter().find_map(|&(name, strategy)| {
        let value: Value = strategy(raw, shape)?;
        match decode(&value, shape) {
            Ok(decoded) => Some((name, decoded)),
            Err(reason) => {
                tracing::debug!(strategy = name, ?reason, "extracted JSON rejected");
                None
            }
        }
    })
}

fn empty(shape: Shape) -> Decoded {
    match shape {
        Shape::Recommendations => Decoded::Items(Vec::new()),
        Shape::Influences => Decoded::Nodes(Vec::new()),
    }
}

fn from_names(names: Vec<String>, shape: Shape) -> Decoded {
    match shape {
        Shape::Recommendations => Decoded::Items(
            names
                .into_iter()
                .map(|name| RecommendationItem::artist(name, PROSE_DESCRIPTION))
                .collect(),
        ),
        Shape::Influences => Decoded::Nodes(
            names
                .into_iter()
                .map(|name| InfluenceNode {
                    impact: Some(PROSE_DESCRIPTION.to_string()),
                    ..InfluenceNode::named(name)
                })
                .collect(),
        ),
    }
}

/// The always-valid placeholder for `shape`: two records whose text
/// explains that nothing could be recovered.
pub fn fallback(shape: Shape) -> Decoded {
    match shape {
        Shape::Recommendations => Decoded::Items(vec![
            RecommendationItem::artist(
                "Recommendations unavailable",
                "The generated response could not be read. Try again later.",
            ),
            RecommendationItem::artist(
                "Explore similar artists",
                "Browse the catalog for related artists while recommendations are unavailable.",
            ),
        ]),
        Shape::Influences => Decoded::Nodes(vec![
            InfluenceNode {
                impact: Some("The generated response could not be read. Try again later.".into()),
                ..InfluenceNode::named("Influences unavailable")
            },
            InfluenceNode {
                impact: Some("Influence data could not be retrieved for this artist.".into()),
                ..InfluenceNode::named("Unknown influence")
            },
        ]),
    }
}
