//! VOD segment acquisition.
//!
//! Diffs the VOD playlist against the parts directory and downloads whatever
//! is missing through a bounded worker pool. For a VOD whose broadcast is
//! still live the diff re-runs on a fixed cadence, then once more after the
//! playlist has settled.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use twitch_api::{ApiClient, Channel, Quality, Vod};

use crate::error::{ArchiveError, Result};
use crate::paths::{parts_dir, safe_move, scan_completed_ids, segment_file_name, staging_dir};

/// Seconds a VOD must have existed before its playlist is trustworthy.
const AVAILABILITY_DELAY_SECS: i64 = 300;

/// Re-diff cadence while the backing broadcast is live.
const LIVE_RECHECK: Duration = Duration::from_secs(60);

/// Settling time between the broadcast ending and the final pass.
const FINAL_PASS_DELAY: Duration = Duration::from_secs(300);

const MAX_ATTEMPTS: u32 = 5;

/// One entry of a VOD media playlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistSegment {
    pub id: u64,
    pub uri: String,
    pub muted: bool,
}

/// Parses a playlist uri of the form `1234.ts` or `1234-muted.ts`.
fn parse_segment_entry(uri: &str) -> Option<PlaylistSegment> {
    let stem = uri.strip_suffix(".ts")?;
    let muted = stem.ends_with("-muted");
    let id_part = stem.strip_suffix("-muted").unwrap_or(stem);
    Some(PlaylistSegment {
        id: id_part.parse().ok()?,
        uri: uri.to_string(),
        muted,
    })
}

/// The playlist directory an index url's entries are relative to.
fn base_url_of(index_url: &str) -> String {
    match index_url.rfind('/') {
        Some(pos) => index_url[..=pos].to_string(),
        None => index_url.to_string(),
    }
}

pub struct VodDownloader {
    api: ApiClient,
    vod: Vod,
    quality: Quality,
    output_dir: PathBuf,
    threads: usize,
    staging_key: u64,
    index_url: Option<String>,
    segments: Vec<PlaylistSegment>,
    muted_ids: BTreeSet<u64>,
    cancel: CancellationToken,
}

impl VodDownloader {
    pub fn new(
        api: ApiClient,
        vod: Vod,
        quality: Quality,
        output_dir: PathBuf,
        threads: usize,
        cancel: CancellationToken,
    ) -> Self {
        let staging_key = vod.stream_id.unwrap_or(vod.vod_id);
        Self {
            api,
            vod,
            quality,
            output_dir,
            threads: threads.max(1),
            staging_key,
            index_url: None,
            segments: Vec::new(),
            muted_ids: BTreeSet::new(),
            cancel,
        }
    }

    /// The VOD with its duration as refreshed from the playlist.
    pub fn vod(&self) -> &Vod {
        &self.vod
    }

    /// Segment ids the playlist advertises as muted. Valid after a pass.
    pub fn muted_ids(&self) -> &BTreeSet<u64> {
        &self.muted_ids
    }

    pub fn index_url(&self) -> Option<&str> {
        self.index_url.as_deref()
    }

    /// Downloads every missing segment once. For VODs with a live broadcast
    /// behind them, prefer [`Self::run`].
    pub async fn download(&mut self) -> Result<()> {
        self.wait_until_available().await?;
        if self.refresh_playlist().await?.is_gone() {
            return Ok(());
        }
        self.download_missing().await
    }

    /// Full acquisition: an initial pass, re-passes while the broadcast is
    /// live, and a final pass once the playlist has settled.
    pub async fn run(&mut self, channel: Option<Channel>) -> Result<()> {
        self.download().await?;

        if let Some(mut channel) = channel {
            while self.broadcast_live(&mut channel).await? {
                debug!(vod_id = self.vod.vod_id, "broadcast still live, re-checking playlist");
                self.sleep(LIVE_RECHECK).await?;
                if self.refresh_playlist().await?.is_gone() {
                    return Ok(());
                }
                self.download_missing().await?;
            }

            info!(vod_id = self.vod.vod_id, "broadcast over, waiting for playlist to settle");
            self.sleep(FINAL_PASS_DELAY).await?;
            if self.refresh_playlist().await?.is_gone() {
                return Ok(());
            }
            self.download_missing().await?;
        }
        Ok(())
    }

    async fn broadcast_live(&self, channel: &mut Channel) -> Result<bool> {
        let live = match channel.refresh(&self.api).await? {
            Some(broadcast) => self
                .vod
                .stream_id
                .is_none_or(|id| id == broadcast.stream_id),
            None => false,
        };
        Ok(live)
    }

    /// Young VODs advertise incomplete playlists; hold off until the VOD has
    /// existed long enough.
    async fn wait_until_available(&self) -> Result<()> {
        let age = self.vod.seconds_since_live();
        if age < AVAILABILITY_DELAY_SECS {
            let wait = (AVAILABILITY_DELAY_SECS - age) as u64;
            info!(vod_id = self.vod.vod_id, wait, "vod too fresh, delaying download");
            self.sleep(Duration::from_secs(wait)).await?;
        }
        Ok(())
    }

    async fn sleep(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ArchiveError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Re-resolves the playlist, refreshing the segment list, muted ids and
    /// the VOD duration.
    async fn refresh_playlist(&mut self) -> Result<PlaylistState> {
        let resolved = match self.resolve_playlist().await {
            Ok(state) => state,
            Err(ArchiveError::Api(e)) if e.is_gone() => {
                self.mark_gone().await?;
                return Ok(PlaylistState::Gone);
            }
            Err(e) => return Err(e),
        };
        Ok(resolved)
    }

    async fn resolve_playlist(&mut self) -> Result<PlaylistState> {
        let index_url = match &self.index_url {
            Some(url) => url.clone(),
            None => {
                let url = self.vod.index_url(&self.api, &self.quality).await?;
                self.index_url = Some(url.clone());
                url
            }
        };
        let text = self.vod.playlist_text(&self.api, &index_url).await?;
        let playlist = m3u8_rs::parse_media_playlist_res(text.as_bytes())
            .map_err(|e| ArchiveError::merge(format!("unreadable vod playlist: {e}")))?;

        let base = base_url_of(&index_url);
        self.segments = playlist
            .segments
            .iter()
            .filter_map(|s| parse_segment_entry(&s.uri))
            .map(|mut s| {
                s.uri = format!("{base}{}", s.uri);
                s
            })
            .collect();
        self.muted_ids = self
            .segments
            .iter()
            .filter(|s| s.muted)
            .map(|s| s.id)
            .collect();
        debug!(
            vod_id = self.vod.vod_id,
            segments = self.segments.len(),
            muted = self.muted_ids.len(),
            "vod playlist refreshed"
        );
        Ok(PlaylistState::Available)
    }

    /// The source disappearing mid-download (deleted or sub-only VOD) is an
    /// end condition: whatever is on disk gets merged, and length
    /// verification is waived through an `.ignorelength` marker.
    async fn mark_gone(&self) -> Result<()> {
        warn!(vod_id = self.vod.vod_id, "vod gone upstream, keeping what was downloaded");
        fs::create_dir_all(&self.output_dir).await?;
        fs::write(self.output_dir.join(".ignorelength"), b"").await?;
        Ok(())
    }

    async fn download_missing(&mut self) -> Result<()> {
        let completed: BTreeSet<u64> =
            scan_completed_ids(&self.output_dir).await?.into_iter().collect();
        let missing: Vec<PlaylistSegment> = self
            .segments
            .iter()
            .filter(|s| !completed.contains(&s.id))
            .cloned()
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        info!(vod_id = self.vod.vod_id, count = missing.len(), "downloading missing segments");

        let staging = staging_dir(self.staging_key);
        fs::create_dir_all(&staging).await?;
        fs::create_dir_all(parts_dir(&self.output_dir)).await?;

        let semaphore = Arc::new(Semaphore::new(self.threads));
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();
        for segment in missing {
            let permit = semaphore.clone().acquire_owned().await.expect("semaphore open");
            let api = self.api.clone();
            let staged = staging.join(segment_file_name(segment.id));
            let final_path = parts_dir(&self.output_dir).join(segment_file_name(segment.id));
            let cancel = self.cancel.clone();
            tasks.spawn(async move {
                let _permit = permit;
                if cancel.is_cancelled() {
                    return Err(ArchiveError::Cancelled);
                }
                download_one(&api, &segment, &staged, &final_path).await
            });
        }

        let mut gone = false;
        while let Some(joined) = tasks.join_next().await {
            match join_outcome(joined) {
                Ok(()) => {}
                Err(e) if e.is_gone() => gone = true,
                Err(e) => {
                    tasks.abort_all();
                    return Err(e);
                }
            }
        }

        if gone {
            self.mark_gone().await?;
        }
        Ok(())
    }
}

enum PlaylistState {
    Available,
    Gone,
}

impl PlaylistState {
    fn is_gone(&self) -> bool {
        matches!(self, Self::Gone)
    }
}

/// Maps a worker's join result onto the download outcome. A panicking
/// worker surfaces as an error the caller can handle instead of unwinding
/// past the coordinator.
fn join_outcome(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Err(ArchiveError::Cancelled),
        Err(e) => Err(ArchiveError::WorkerFailed {
            reason: e.to_string(),
        }),
    }
}

async fn download_one(
    api: &ApiClient,
    segment: &PlaylistSegment,
    staged: &Path,
    final_path: &Path,
) -> Result<()> {
    let mut last_err = None;
    for attempt in 1..=MAX_ATTEMPTS {
        match fetch_to(api, &segment.uri, staged).await {
            Ok(()) => {
                safe_move(staged, final_path).await?;
                return Ok(());
            }
            Err(e) => {
                if e.is_gone() {
                    return Err(e);
                }
                warn!(id = segment.id, attempt, error = %e, "segment fetch failed");
                last_err = Some(e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
    debug!(id = segment.id, error = ?last_err, "segment fetch exhausted");
    Err(ArchiveError::SegmentDownload {
        id: segment.id,
        attempts: MAX_ATTEMPTS,
    })
}

async fn fetch_to(api: &ApiClient, uri: &str, staged: &Path) -> Result<()> {
    let bytes = api.get_bytes(uri).await?;
    let mut file = fs::File::create(staged).await?;
    file.write_all(&bytes).await?;
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn playlist_entries_parse() {
        assert_eq!(
            parse_segment_entry("1234.ts"),
            Some(PlaylistSegment {
                id: 1234,
                uri: "1234.ts".into(),
                muted: false
            })
        );
        assert_eq!(
            parse_segment_entry("98-muted.ts"),
            Some(PlaylistSegment {
                id: 98,
                uri: "98-muted.ts".into(),
                muted: true
            })
        );
        assert_eq!(parse_segment_entry("thumb0.jpg"), None);
        assert_eq!(parse_segment_entry("not-a-number.ts"), None);
    }

    #[test]
    fn base_url_strips_index_name() {
        assert_eq!(
            base_url_of("https://example.com/vods/abc/chunked/index-dvr.m3u8"),
            "https://example.com/vods/abc/chunked/"
        );
    }

    #[tokio::test]
    async fn panicked_worker_surfaces_as_error() {
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();
        tasks.spawn(async { panic!("worker blew up") });
        let joined = tasks.join_next().await.unwrap();
        assert!(matches!(
            join_outcome(joined),
            Err(ArchiveError::WorkerFailed { .. })
        ));
    }

    #[tokio::test]
    async fn aborted_worker_maps_to_cancelled() {
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();
        tasks.spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        tasks.abort_all();
        let joined = tasks.join_next().await.unwrap();
        assert!(matches!(join_outcome(joined), Err(ArchiveError::Cancelled)));
    }
}
