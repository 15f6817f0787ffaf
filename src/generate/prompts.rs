use crate::subject::{ArtistProfile, Shape};

pub const RECOMMENDATIONS_SYSTEM: &str = r#"You are a music critic recommending what a listener should hear next.

OUTPUT FORMAT (JSON array, no prose):
[
  {
    "name": "Artist, album or song title",
    "kind": "artist" | "album" | "song",
    "description": "One or two sentences on why it fits",
    "year": "2015",
    "month": "02",
    "source": "Where the recommendation comes from, if any",
    "sourceUrl": "https://..."
  }
]

RULES:
- Between 6 and 12 entries
- "kind" must be exactly one of artist, album, song
- Every entry needs a name, a kind and a description
- year, month, source and sourceUrl are optional; omit them rather than guessing
- Never recommend the artist the listener asked about
- If you know of nothing relevant, reply with an empty array []"#;

pub const INFLUENCES_SYSTEM: &str = r#"You are a music historian tracing an artist's influences back two generations.

OUTPUT FORMAT (JSON object, no prose):
{
  "root": { "name": "The artist asked about", "genre": "primary genre", "era": "active period" },
  "influences": [
    {
      "name": "Direct influence",
      "genre": "genre",
      "era": "e.g. Late 1960s-1970s",
      "impact": "What this artist took from them",
      "connection": "How the influence shows",
      "children": [
        { "name": "Earlier influence", "genre": "genre", "era": "era", "impact": "..." }
      ]
    }
  ]
}

RULES:
- 3 to 6 direct influences, each with at most 3 children
- Children are influences of the direct influence, not of the root
- Do not nest deeper than children
- If you know of nothing relevant, reply with {"root": {...}, "influences": []}"#;

pub fn system_prompt(shape: Shape) -> &'static str {
    match shape {
        Shape::Recommendations => RECOMMENDATIONS_SYSTEM,
        Shape::Influences => INFLUENCES_SYSTEM,
    }
}

/// User prompt carrying what the catalog knows about the artist.
pub fn user_prompt(shape: Shape, artist: &ArtistProfile) -> String {
    let mut prompt = match shape {
        Shape::Recommendations => format!("ARTIST: {}\n", artist.name),
        Shape::Influences => format!("TRACE THE INFLUENCES OF: {}\n", artist.name),
    };

    if !artist.genres.is_empty() {
        prompt.push_str(&format!("GENRES: {}\n", artist.genres.join(", ")));
    }
    if let Some(popularity) = artist.popularity {
        prompt.push_str(&format!("POPULARITY (0-100): {}\n", popularity));
    }

    prompt.push_str(match shape {
        Shape::Recommendations => "\nRecommend artists, albums and songs for a fan of this artist.",
        Shape::Influences => "\nBuild the influence tree.",
    });
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_prompt_includes_catalog_context() {
        let artist = ArtistProfile {
            name: "Steven Wilson".into(),
            genres: vec!["progressive rock".into(), "art rock".into()],
            popularity: Some(61),
            ..ArtistProfile::default()
        };
        let prompt = user_prompt(Shape::Influences, &artist);
        assert!(prompt.contains("Steven Wilson"));
        assert!(prompt.contains("progressive rock, art rock"));
        assert!(prompt.contains("61"));
    }

    #[test]
    fn bare_profile_still_names_the_artist() {
        let artist = ArtistProfile {
            name: "Low".into(),
            ..ArtistProfile::default()
        };
        let prompt = user_prompt(Shape::Recommendations, &artist);
        assert!(prompt.starts_with("ARTIST: Low"));
        assert!(!prompt.contains("GENRES"));
    }

    #[test]
    fn system_prompt_differs_per_shape() {
        assert!(system_prompt(Shape::Influences).contains("\"root\""));
        assert!(system_prompt(Shape::Recommendations).contains("\"kind\""));
    }
}
