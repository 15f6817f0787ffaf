//! Subjects, identities and cache key derivation.
//!
//! A subject is the artist a request concerns. It is addressed by name, by
//! catalog id, or both; every cache key is derived from the normalized form
//! so that `"Miles Davis"`, `"miles davis"` and `" Miles  Davis "` land on
//! the same entry.

use crate::util::collapse_whitespace;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The artist a request is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub name: Option<String>,
    pub catalog_id: Option<String>,
}

impl Subject {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            catalog_id: None,
        }
    }

    pub fn by_catalog_id(id: impl Into<String>) -> Self {
        Self {
            name: None,
            catalog_id: Some(id.into()),
        }
    }

    pub fn with_catalog_id(mut self, id: impl Into<String>) -> Self {
        self.catalog_id = Some(id.into());
        self
    }

    /// Parse CLI/API input. `id:<catalog id>` and `spotify:artist:<id>` address
    /// the catalog directly, anything else is a name.
    pub fn parse(input: &str) -> Self {
        let trimmed = input.trim();
        if let Some(id) = trimmed
            .strip_prefix("id:")
            .or_else(|| trimmed.strip_prefix("spotify:artist:"))
        {
            return Self::by_catalog_id(id.trim());
        }
        Self::named(trimmed)
    }

    /// Display name, falling back to the catalog id.
    pub fn label(&self) -> &str {
        self.name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .or(self.catalog_id.as_deref())
            .unwrap_or("")
    }

    /// Normalized key. Names win over ids so a subject resolved later by id
    /// still hits entries written under its name.
    pub fn key(&self) -> SubjectKey {
        match self.name.as_deref().filter(|n| !n.trim().is_empty()) {
            Some(name) => SubjectKey::from_name(name),
            None => SubjectKey::from_catalog_id(self.catalog_id.as_deref().unwrap_or("")),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.label().trim().is_empty()
    }
}

/// Case- and whitespace-insensitive subject identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubjectKey(String);

impl SubjectKey {
    pub fn from_name(name: &str) -> Self {
        Self(normalize_name(name))
    }

    pub fn from_catalog_id(id: &str) -> Self {
        Self(format!("id:{}", normalize_name(id)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key for one cache tier entry; namespaced by shape so a subject's
    /// recommendations and its influence tree never collide.
    pub fn cache_key(&self, shape: Shape) -> String {
        format!("{}:{}", shape.as_str(), self.0)
    }
}

impl fmt::Display for SubjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercase and collapse whitespace.
pub fn normalize_name(name: &str) -> String {
    collapse_whitespace(name).to_lowercase()
}

/// Structure a request wants back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shape {
    /// Flat list of artists, albums and songs
    Recommendations,
    /// Two-generation influence tree
    Influences,
}

impl Shape {
    pub fn as_str(&self) -> &'static str {
        match self {
            Shape::Recommendations => "recommendations",
            Shape::Influences => "influences",
        }
    }
}

/// Who is asking.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    Anonymous,
    User(String),
}

impl Identity {
    pub fn user(id: impl Into<String>) -> Self {
        let id = id.into();
        if id.trim().is_empty() {
            Identity::Anonymous
        } else {
            Identity::User(id.trim().to_string())
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Identity::Anonymous => None,
            Identity::User(id) => Some(id),
        }
    }
}

/// Catalog view of an artist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ArtistProfile {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub popularity: Option<u32>,
    #[serde(default)]
    pub followers: Option<u64>,
    #[serde(default)]
    pub external_url: Option<String>,
}

impl ArtistProfile {
    /// Minimal profile for a subject the catalog could not resolve.
    pub fn from_subject(subject: &Subject) -> Self {
        Self {
            id: subject.catalog_id.clone(),
            name: subject.label().trim().to_string(),
            ..Self::default()
        }
    }

    pub fn primary_genre(&self) -> Option<&str> {
        self.genres.first().map(String::as_str)
    }
}
