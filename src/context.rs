//! Classification of playback contexts by URI.
//!
//! A context is what playback draws its tracks from. Albums, playlists and
//! shows end; radio stations and autoplay keep going; searches are a
//! snapshot of results.

use std::fmt;

/// Kind of collection a playback context URI points to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PlaybackContext {
    /// Ends after its last item.
    Finite { uri: String },

    /// Generates items as it goes.
    Infinite { uri: String },

    /// Results of a search query.
    Search { uri: String, query: String },
}

impl PlaybackContext {
    /// Classifies a context URI.
    #[must_use]
    pub fn classify(uri: &str) -> Self {
        let uri_owned = uri.to_owned();

        if let Some(query) = uri.strip_prefix("spotify:search:") {
            return Self::Search {
                uri: uri_owned,
                query: url::form_urlencoded::parse(query.as_bytes())
                    .map(|(key, value)| {
                        if value.is_empty() {
                            key.into_owned()
                        } else {
                            format!("{key}={value}")
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("&"),
            };
        }

        let mut segments = uri.split(':');
        let infinite = segments.next() == Some("spotify")
            && matches!(
                segments.next(),
                Some("station" | "radio" | "autoplay" | "dailymix" | "app")
            );
        if infinite || uri.contains(":station:") {
            Self::Infinite { uri: uri_owned }
        } else {
            Self::Finite { uri: uri_owned }
        }
    }

    #[must_use]
    pub fn uri(&self) -> &str {
        match self {
            Self::Finite { uri } | Self::Infinite { uri } | Self::Search { uri, .. } => uri,
        }
    }

    #[must_use]
    pub fn is_finite(&self) -> bool {
        !matches!(self, Self::Infinite { .. })
    }
}

impl fmt::Display for PlaybackContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Finite { uri } => write!(f, "finite context {uri}"),
            Self::Infinite { uri } => write!(f, "infinite context {uri}"),
            Self::Search { query, .. } => write!(f, "search for {query}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collections_are_finite() {
        for uri in [
            "spotify:album:2up3OPMp9Tb4dAKM2erWXQ",
            "spotify:playlist:37i9dQZF1DXcBWIGoYBM5M",
            "spotify:user:alice:collection",
            "spotify:show:5CfCWKI5pZ28U0uOzXkDHe",
        ] {
            let context = PlaybackContext::classify(uri);
            assert!(matches!(context, PlaybackContext::Finite { .. }), "{uri}");
            assert_eq!(context.uri(), uri);
        }
    }

    #[test]
    fn stations_are_infinite() {
        for uri in [
            "spotify:station:track:4uLU6hMCjMI75M1A2tKUQC",
            "spotify:radio:artist:0OdUWJ0sBjDrqHygGUXeCF",
            "spotify:user:alice:station:playlist:37i9dQZF1DX",
        ] {
            let context = PlaybackContext::classify(uri);
            assert!(!context.is_finite(), "{uri}");
        }
    }

    #[test]
    fn searches_keep_their_query() {
        let context = PlaybackContext::classify("spotify:search:daft+punk");
        assert_eq!(
            context,
            PlaybackContext::Search {
                uri: "spotify:search:daft+punk".to_owned(),
                query: "daft punk".to_owned(),
            }
        );
    }
}
