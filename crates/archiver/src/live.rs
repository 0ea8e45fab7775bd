//! Live broadcast capture.
//!
//! Polls the live media playlist on a fixed cadence, feeds advertised parts
//! through the [`SegmentAligner`] and downloads each segment as it fills.
//! Ends when the playlist goes away or the channel stops advertising new
//! parts and a metadata re-check confirms the broadcast is over.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use twitch_api::{ApiClient, Channel, Chapter, Quality, TwitchApiError, Vod};

use crate::error::{ArchiveError, Result};
use crate::part::{AlignMode, LiveSegment, Part, SegmentAligner};
use crate::paths::{parts_dir, safe_move, scan_completed_ids, segment_file_name, staging_dir};

/// Playlist poll cadence. Twitch advertises a new ~2s part roughly this
/// often.
const POLL_INTERVAL: Duration = Duration::from_secs(4);

/// Playlist and segment fetch attempts before giving up.
const MAX_ATTEMPTS: u32 = 5;

/// Delay before re-polling a playlist that 404s on a broadcast that has not
/// produced parts yet.
const PLAYLIST_GRACE: Duration = Duration::from_secs(5);

/// Silence on the playlist longer than this triggers a liveness re-check.
const STALE_AFTER: Duration = Duration::from_secs(20);

enum Advertised {
    Parts(Vec<Part>),
    Offline,
}

/// Captures a single live broadcast into the parts directory.
pub struct LiveCapture {
    api: ApiClient,
    channel: Channel,
    stream_id: u64,
    output_dir: PathBuf,
    staging_key: u64,
    index_url: String,
    aligner: SegmentAligner,
    advertised_urls: HashSet<String>,
    chapter_marks: Vec<(String, u64)>,
    cancel: CancellationToken,
}

impl LiveCapture {
    /// Resolves the live playlist for the channel's current broadcast and
    /// prepares capture into `output_dir`. Segment numbering resumes after
    /// whatever the parts directory already holds.
    pub async fn new(
        api: ApiClient,
        channel: Channel,
        vod: &Vod,
        quality: &Quality,
        mode: AlignMode,
        output_dir: PathBuf,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let Some(broadcast) = channel.broadcast.clone() else {
            return Err(ArchiveError::StreamOffline);
        };
        let index_url = channel.stream_index_url(&api, quality).await?;

        let existing = scan_completed_ids(&output_dir).await?;
        let start_id = existing.last().map_or(0, |last| last + 1);
        if start_id > 0 {
            info!(resumed_from = start_id, "resuming live capture");
        }

        let aligner = SegmentAligner::new(vod.created_at, mode, start_id);
        let staging_key = vod.stream_id.unwrap_or(broadcast.stream_id);
        let chapter_marks = if broadcast.game.is_empty() {
            Vec::new()
        } else {
            vec![(broadcast.game.clone(), 0)]
        };

        Ok(Self {
            api,
            stream_id: broadcast.stream_id,
            channel,
            output_dir,
            staging_key,
            index_url,
            aligner,
            advertised_urls: HashSet::new(),
            chapter_marks,
            cancel,
        })
    }

    pub fn mode(&self) -> AlignMode {
        self.aligner.mode()
    }

    /// Runs capture until the broadcast ends or the token is cancelled.
    pub async fn run(&mut self) -> Result<()> {
        self.run_until(None).await
    }

    /// Runs capture for at most `duration`. Used to keep a pre-roll going
    /// while waiting for the broadcast's VOD to appear.
    pub async fn capture_for(&mut self, duration: Duration) -> Result<()> {
        self.run_until(Some(Instant::now() + duration)).await
    }

    async fn run_until(&mut self, deadline: Option<Instant>) -> Result<()> {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_advertised = Instant::now();

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(ArchiveError::Cancelled),
                _ = ticker.tick() => {}
            }
            if let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                return Ok(());
            }

            match self.fetch_advertised_parts().await? {
                Advertised::Offline => break,
                Advertised::Parts(parts) => {
                    let mut saw_new = false;
                    for part in parts {
                        if self.advertised_urls.insert(part.url.clone()) {
                            saw_new = true;
                        }
                        self.aligner.add_part(part)?;
                    }
                    if saw_new {
                        last_advertised = Instant::now();
                    }
                }
            }

            for id in self.aligner.completed_ids() {
                let Some(segment) = self.aligner.pop(id) else { continue };
                if let Err(e) = self.download_segment(&segment).await {
                    error!(id, error = %e, "segment download failed, continuing capture");
                }
            }

            if last_advertised.elapsed() > STALE_AFTER {
                debug!("no new parts advertised, re-checking broadcast");
                if self.broadcast_ended().await? {
                    break;
                }
                last_advertised = Instant::now();
            }
        }

        info!("broadcast ended, finalizing capture");
        self.finalize().await
    }

    /// Fetches the media playlist and extracts its parts. A missing playlist
    /// means the broadcast is over once parts have been seen; before that it
    /// is retried on the assumption the edge has not caught up yet.
    async fn fetch_advertised_parts(&self) -> Result<Advertised> {
        for attempt in 1..=MAX_ATTEMPTS {
            match self.channel.playlist_text(&self.api, &self.index_url).await {
                Ok(text) => {
                    let playlist = m3u8_rs::parse_media_playlist_res(text.as_bytes())
                        .map_err(|e| {
                            TwitchApiError::parse("live media playlist", e.to_string())
                        })?;
                    let parts = playlist
                        .segments
                        .iter()
                        .filter_map(Part::from_media_segment)
                        .collect();
                    return Ok(Advertised::Parts(parts));
                }
                Err(TwitchApiError::NotFound { .. }) => {
                    if self.advertised_urls.is_empty() {
                        debug!(attempt, "playlist not available yet, waiting");
                        tokio::time::sleep(PLAYLIST_GRACE).await;
                    } else {
                        return Ok(Advertised::Offline);
                    }
                }
                Err(e) => {
                    warn!(attempt, error = %e, "playlist fetch failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        Err(ArchiveError::StreamFetch)
    }

    /// Re-checks channel metadata after playlist silence. The broadcast is
    /// over when the channel is offline or already live with a different
    /// stream.
    async fn broadcast_ended(&mut self) -> Result<bool> {
        let game = match self.channel.refresh(&self.api).await? {
            None => return Ok(true),
            Some(broadcast) if broadcast.stream_id != self.stream_id => return Ok(true),
            Some(broadcast) => broadcast.game.clone(),
        };
        self.mark_chapter(game);
        Ok(false)
    }

    fn mark_chapter(&mut self, game: String) {
        if game.is_empty() {
            return;
        }
        if self.chapter_marks.last().is_some_and(|(g, _)| *g == game) {
            return;
        }
        let position = self.elapsed_secs();
        debug!(game = %game, position, "category change observed");
        self.chapter_marks.push((game, position));
    }

    fn elapsed_secs(&self) -> u64 {
        let started = self
            .channel
            .broadcast
            .as_ref()
            .map_or_else(Utc::now, |b| b.started_at);
        (Utc::now() - started).num_seconds().max(0) as u64
    }

    /// Category changes observed during capture, as chapters. Only used for
    /// stream-only archives; vod-backed archives take chapters from the VOD.
    pub fn chapters(&self) -> Vec<Chapter> {
        let end = self.elapsed_secs();
        let mut chapters = Vec::with_capacity(self.chapter_marks.len());
        for (i, (game, position)) in self.chapter_marks.iter().enumerate() {
            let until = self
                .chapter_marks
                .get(i + 1)
                .map_or(end, |(_, next)| *next);
            chapters.push(Chapter {
                description: game.clone(),
                position_secs: *position as f64,
                duration_secs: until.saturating_sub(*position) as f64,
            });
        }
        chapters
    }

    /// Downloads a segment's parts in order into a staging file, then moves
    /// it into the parts directory under its final name.
    async fn download_segment(&self, segment: &LiveSegment) -> Result<()> {
        let staging = staging_dir(self.staging_key);
        fs::create_dir_all(&staging).await?;
        let staged = staging.join(segment_file_name(segment.id));
        let final_path = parts_dir(&self.output_dir).join(segment_file_name(segment.id));

        let mut last_err = None;
        for attempt in 1..=MAX_ATTEMPTS {
            match self.write_parts(&staged, segment).await {
                Ok(()) => {
                    safe_move(&staged, &final_path).await?;
                    debug!(id = segment.id, parts = segment.parts.len(), "segment downloaded");
                    return Ok(());
                }
                Err(e) => {
                    warn!(id = segment.id, attempt, error = %e, "segment download attempt failed");
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        debug!(id = segment.id, error = ?last_err, "segment download exhausted");
        Err(ArchiveError::SegmentDownload {
            id: segment.id,
            attempts: MAX_ATTEMPTS,
        })
    }

    async fn write_parts(&self, staged: &std::path::Path, segment: &LiveSegment) -> Result<()> {
        let mut file = fs::File::create(staged).await?;
        for part in &segment.parts {
            let bytes = self.api.get_bytes(&part.url).await?;
            file.write_all(&bytes).await?;
        }
        file.flush().await?;
        Ok(())
    }

    /// Drains the aligner at end of stream. The trailing in-progress segment
    /// is downloaded best-effort; a short final segment is normal.
    async fn finalize(&mut self) -> Result<()> {
        for id in self.aligner.completed_ids() {
            let Some(segment) = self.aligner.pop(id) else { continue };
            if let Err(e) = self.download_segment(&segment).await {
                error!(id, error = %e, "final segment download failed");
            }
        }
        if let Some(segment) = self.aligner.pop_in_progress() {
            debug!(
                id = segment.id,
                parts = segment.parts.len(),
                "downloading trailing partial segment"
            );
            if let Err(e) = self.download_segment(&segment).await {
                warn!(id = segment.id, error = %e, "trailing segment lost");
            }
        }
        Ok(())
    }
}
