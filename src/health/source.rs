use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An upstream music-data provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Spotify,
    Lastfm,
    Youtube,
    Deezer,
}

/// Selection order used when the caller does not give one.
pub const DEFAULT_PREFERENCE: [Source; 4] = [
    Source::Spotify,
    Source::Lastfm,
    Source::Youtube,
    Source::Deezer,
];

impl Source {
    pub const ALL: [Source; 4] = DEFAULT_PREFERENCE;

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Spotify => "spotify",
            Source::Lastfm => "lastfm",
            Source::Youtube => "youtube",
            Source::Deezer => "deezer",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown source: {0}")]
pub struct UnknownSource(pub String);

impl FromStr for Source {
    type Err = UnknownSource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "spotify" => Ok(Source::Spotify),
            "lastfm" | "last.fm" | "last-fm" => Ok(Source::Lastfm),
            "youtube" | "youtube-music" | "youtube_music" | "ytmusic" => Ok(Source::Youtube),
            "deezer" => Ok(Source::Deezer),
            _ => Err(UnknownSource(s.to_string())),
        }
    }
}
