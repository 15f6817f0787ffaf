//! Encore library crate
//!
//! Artist recommendations served from a two-tier cache, generated on a miss
//! by an LLM behind a per-identity quota, and normalized from whatever text
//! the model returns into a validated list or influence tree.

pub mod cache;
pub mod catalog;
pub mod config;
pub mod error;
pub mod generate;
pub mod keyring;
pub mod normalize;
pub mod pipeline;
pub mod quota;
pub mod store;
pub mod subject;
pub mod tree;
pub mod util;

pub use error::PipelineError;
pub use pipeline::{Pipeline, PipelineSettings, RecommendationRequest, RecommendationResult};
pub use subject::{Identity, Shape, Subject};
