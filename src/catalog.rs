//! Catalog service: artist lookup by name or id.
//!
//! The pipeline treats the catalog as unreliable; every error here is
//! logged by the caller and degrades to a profile built from the request.

use crate::error::CatalogError;
use crate::subject::{normalize_name, ArtistProfile};
use crate::util::truncate_str;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use url::Url;

const TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
const API_BASE: &str = "https://api.spotify.com/v1";

/// Spotify caps search pages at 50.
const MAX_SEARCH_LIMIT: usize = 50;

/// Refresh tokens this long before Spotify says they expire.
const TOKEN_SLACK: Duration = Duration::from_secs(60);

#[async_trait]
pub trait CatalogService: Send + Sync {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<ArtistProfile>, CatalogError>;

    /// `Ok(None)` when the id is unknown.
    async fn get_by_id(&self, id: &str) -> Result<Option<ArtistProfile>, CatalogError>;

    /// Best match for a name: an exact (case-insensitive) match, else the top hit.
    async fn search_by_name(&self, name: &str) -> Result<Option<ArtistProfile>, CatalogError> {
        let results = self.search(name, 5).await?;
        Ok(best_match(name, results))
    }
}

pub fn best_match(name: &str, mut results: Vec<ArtistProfile>) -> Option<ArtistProfile> {
    let wanted = normalize_name(name);
    let exact = results
        .iter()
        .position(|artist| normalize_name(&artist.name) == wanted);
    match exact {
        Some(i) => Some(results.swap_remove(i)),
        None => results.into_iter().next(),
    }
}

/// Spotify Web API catalog using the client-credentials flow.
pub struct SpotifyCatalog {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    token: Mutex<Option<(String, Instant)>>,
}

impl SpotifyCatalog {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token: Mutex::new(None),
        }
    }

    pub fn from_credentials(
        client_id: Option<String>,
        client_secret: Option<String>,
    ) -> Result<Self, CatalogError> {
        match (client_id, client_secret) {
            (Some(id), Some(secret)) if !id.trim().is_empty() && !secret.trim().is_empty() => {
                Ok(Self::new(id, secret))
            }
            _ => Err(CatalogError::MissingCredentials),
        }
    }

    async fn access_token(&self) -> Result<String, CatalogError> {
        let mut cached = self.token.lock().await;
        if let Some((token, expires_at)) = cached.as_ref() {
            if Instant::now() < *expires_at {
                return Ok(token.clone());
            }
        }

        let response = self
            .http
            .post(TOKEN_URL)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body("grant_type=client_credentials")
            .send()
            .await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        if !(200..300).contains(&status) {
            return Err(CatalogError::HttpStatus {
                status,
                body: truncate_str(&text, 200).to_string(),
            });
        }

        let token: TokenResponse = serde_json::from_str(&text)
            .map_err(|e| CatalogError::InvalidResponse(e.to_string()))?;
        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_SLACK);
        *cached = Some((token.access_token.clone(), Instant::now() + lifetime));
        Ok(token.access_token)
    }

    /// GET an API path; `Ok(None)` on 404 and on Spotify's 400 for malformed ids.
    async fn get_json(&self, url: Url) -> Result<Option<String>, CatalogError> {
        let token = self.access_token().await?;
        let response = self.http.get(url).bearer_auth(token).send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        match status {
            200..=299 => Ok(Some(text)),
            400 | 404 => Ok(None),
            _ => Err(CatalogError::HttpStatus {
                status,
                body: truncate_str(&text, 200).to_string(),
            }),
        }
    }
}

#[async_trait]
impl CatalogService for SpotifyCatalog {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<ArtistProfile>, CatalogError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let limit = limit.clamp(1, MAX_SEARCH_LIMIT).to_string();
        let url = Url::parse_with_params(
            &format!("{API_BASE}/search"),
            &[("q", query), ("type", "artist"), ("limit", limit.as_str())],
        )
        .map_err(|e| CatalogError::InvalidResponse(e.to_string()))?;

        let Some(text) = self.get_json(url).await? else {
            return Ok(Vec::new());
        };
        let parsed: SearchResponse = serde_json::from_str(&text)
            .map_err(|e| CatalogError::InvalidResponse(e.to_string()))?;
        Ok(parsed.artists.items.into_iter().map(Into::into).collect())
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<ArtistProfile>, CatalogError> {
        let mut url = Url::parse(API_BASE).map_err(|e| CatalogError::InvalidResponse(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| CatalogError::InvalidResponse("base url cannot have paths".into()))?
            .extend(["artists", id.trim()]);

        let Some(text) = self.get_json(url).await? else {
            return Ok(None);
        };
        let artist: SpotifyArtist = serde_json::from_str(&text)
            .map_err(|e| CatalogError::InvalidResponse(e.to_string()))?;
        Ok(Some(artist.into()))
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Deserialize)]
struct SearchResponse {
    artists: Paging,
}

#[derive(Deserialize)]
struct Paging {
    #[serde(default)]
    items: Vec<SpotifyArtist>,
}

#[derive(Deserialize)]
struct SpotifyArtist {
    id: String,
    name: String,
    #[serde(default)]
    images: Vec<Image>,
    #[serde(default)]
    genres: Vec<String>,
    popularity: Option<u32>,
    followers: Option<Followers>,
    external_urls: Option<ExternalUrls>,
}

#[derive(Deserialize)]
struct Image {
    url: String,
}

#[derive(Deserialize)]
struct Followers {
    total: Option<u64>,
}

#[derive(Deserialize)]
struct ExternalUrls {
    spotify: Option<String>,
}

impl From<SpotifyArtist> for ArtistProfile {
    fn from(artist: SpotifyArtist) -> Self {
        ArtistProfile {
            id: Some(artist.id),
            name: artist.name,
            images: artist.images.into_iter().map(|i| i.url).collect(),
            genres: artist.genres,
            popularity: artist.popularity,
            followers: artist.followers.and_then(|f| f.total),
            external_url: artist.external_urls.and_then(|u| u.spotify),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(name: &str) -> ArtistProfile {
        ArtistProfile {
            name: name.into(),
            ..ArtistProfile::default()
        }
    }

    #[test]
    fn best_match_prefers_exact_name() {
        let results = vec![profile("Steven Wilson Band"), profile("steven wilson")];
        assert_eq!(
            best_match("Steven  Wilson", results).unwrap().name,
            "steven wilson"
        );
    }

    #[test]
    fn best_match_falls_back_to_top_hit() {
        let results = vec![profile("Porcupine Tree"), profile("Blackfield")];
        assert_eq!(
            best_match("Steven Wilson", results).unwrap().name,
            "Porcupine Tree"
        );
        assert!(best_match("anyone", Vec::new()).is_none());
    }

    #[test]
    fn spotify_artist_maps_to_profile() {
        let json = r#"{
            "artists": {"items": [{
                "id": "4X42BfuhWCAZ2swiVze9O0",
                "name": "Steven Wilson",
                "images": [{"url": "https://i.scdn.co/image/a", "height": 640}],
                "genres": ["progressive rock", "art rock"],
                "popularity": 58,
                "followers": {"href": null, "total": 512345},
                "external_urls": {"spotify": "https://open.spotify.com/artist/4X42"}
            }]}
        }"#;
        let parsed: SearchResponse = serde_json::from_str(json).unwrap();
        let artist: ArtistProfile = parsed.artists.items.into_iter().next().unwrap().into();
        assert_eq!(artist.name, "Steven Wilson");
        assert_eq!(artist.primary_genre(), Some("progressive rock"));
        assert_eq!(artist.followers, Some(512345));
        assert_eq!(artist.images.len(), 1);
    }

    #[test]
    fn missing_credentials_are_rejected() {
        assert!(matches!(
            SpotifyCatalog::from_credentials(Some("id".into()), None),
            Err(CatalogError::MissingCredentials)
        ));
        assert!(SpotifyCatalog::from_credentials(Some("id".into()), Some("secret".into())).is_ok());
    }
}
