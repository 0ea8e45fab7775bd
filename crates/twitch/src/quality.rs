//! Stream quality selection against a usher master playlist.

use m3u8_rs::MasterPlaylist;
use tracing::debug;

use crate::error::TwitchApiError;

/// Requested rendition. Twitch names the source rendition `chunked` and the
/// rest `[resolution]p[framerate]` (`720p60`, `480p30`, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Quality {
    Source,
    Worst,
    Named(String),
}

impl Quality {
    pub fn parse(value: &str) -> Self {
        match value {
            "best" | "source" | "chunked" => Self::Source,
            "worst" => Self::Worst,
            other => Self::Named(other.to_string()),
        }
    }
}

impl std::fmt::Display for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Source => f.write_str("source"),
            Self::Worst => f.write_str("worst"),
            Self::Named(name) => f.write_str(name),
        }
    }
}

/// Picks the variant uri matching the requested quality.
///
/// Named qualities match the variant's VIDEO group id; when no exact match
/// exists, a variant with the same resolution prefix is accepted before
/// falling back to source. Variants are listed best-first by Twitch, so
/// source is the first entry and worst the last.
pub fn select_variant(
    master: &MasterPlaylist,
    quality: &Quality,
) -> Result<String, TwitchApiError> {
    if master.variants.is_empty() {
        return Err(TwitchApiError::QualityUnavailable {
            requested: quality.to_string(),
        });
    }

    let uri = match quality {
        Quality::Source => master.variants[0].uri.clone(),
        Quality::Worst => {
            // the trailing audio_only rendition is not a video quality
            master
                .variants
                .iter()
                .rev()
                .find(|v| v.video.as_deref() != Some("audio_only"))
                .unwrap_or(&master.variants[master.variants.len() - 1])
                .uri
                .clone()
        }
        Quality::Named(name) => {
            let exact = master
                .variants
                .iter()
                .find(|v| v.video.as_deref() == Some(name.as_str()));

            match exact {
                Some(v) => v.uri.clone(),
                None => {
                    let resolution = name.split('p').next().unwrap_or(name);
                    let close = master.variants.iter().find(|v| {
                        v.video
                            .as_deref()
                            .is_some_and(|g| g.split('p').next() == Some(resolution))
                    });
                    match close {
                        Some(v) => {
                            debug!(requested = %name, matched = ?v.video, "exact quality unavailable, matched by resolution");
                            v.uri.clone()
                        }
                        None => {
                            debug!(requested = %name, "requested quality unavailable, defaulting to source");
                            master.variants[0].uri.clone()
                        }
                    }
                }
            }
        }
    };

    Ok(uri)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASTER: &str = "#EXTM3U\n\
#EXT-X-MEDIA:TYPE=VIDEO,GROUP-ID=\"chunked\",NAME=\"1080p60 (source)\",AUTOSELECT=YES,DEFAULT=YES\n\
#EXT-X-STREAM-INF:BANDWIDTH=6000000,RESOLUTION=1920x1080,CODECS=\"avc1.64002A,mp4a.40.2\",VIDEO=\"chunked\"\n\
https://example.invalid/chunked/index-dvr.m3u8\n\
#EXT-X-MEDIA:TYPE=VIDEO,GROUP-ID=\"720p60\",NAME=\"720p60\",AUTOSELECT=YES,DEFAULT=YES\n\
#EXT-X-STREAM-INF:BANDWIDTH=3000000,RESOLUTION=1280x720,CODECS=\"avc1.4D401F,mp4a.40.2\",VIDEO=\"720p60\"\n\
https://example.invalid/720p60/index-dvr.m3u8\n\
#EXT-X-MEDIA:TYPE=VIDEO,GROUP-ID=\"160p30\",NAME=\"160p\",AUTOSELECT=YES,DEFAULT=YES\n\
#EXT-X-STREAM-INF:BANDWIDTH=200000,RESOLUTION=284x160,CODECS=\"avc1.4D400C,mp4a.40.2\",VIDEO=\"160p30\"\n\
https://example.invalid/160p30/index-dvr.m3u8\n";

    fn master() -> MasterPlaylist {
        m3u8_rs::parse_master_playlist_res(MASTER.as_bytes()).unwrap()
    }

    #[test]
    fn source_takes_first_variant() {
        let uri = select_variant(&master(), &Quality::Source).unwrap();
        assert!(uri.contains("/chunked/"));
    }

    #[test]
    fn worst_takes_last_variant() {
        let uri = select_variant(&master(), &Quality::Worst).unwrap();
        assert!(uri.contains("/160p30/"));
    }

    #[test]
    fn named_matches_group_id() {
        let uri = select_variant(&master(), &Quality::Named("720p60".into())).unwrap();
        assert!(uri.contains("/720p60/"));
    }

    #[test]
    fn named_falls_back_to_resolution_then_source() {
        let uri = select_variant(&master(), &Quality::Named("720p30".into())).unwrap();
        assert!(uri.contains("/720p60/"));

        let uri = select_variant(&master(), &Quality::Named("1440p60".into())).unwrap();
        assert!(uri.contains("/chunked/"));
    }

    #[test]
    fn parse_aliases() {
        assert_eq!(Quality::parse("best"), Quality::Source);
        assert_eq!(Quality::parse("worst"), Quality::Worst);
        assert_eq!(Quality::parse("480p30"), Quality::Named("480p30".into()));
    }
}
