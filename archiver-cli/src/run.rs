//! Orchestration: resolves channels, diffs their VOD listings against the
//! ledger, and archives each missing broadcast under lock. Live broadcasts
//! get a concurrent stream capture next to the VOD download; broadcasts with
//! no VOD at all are captured stream-only.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use archiver_engine::{
    ArchiveError, ChatArchiver, LiveCapture, Merger, Repairer, VodDownloader,
    metadata,
    part::AlignMode,
    paths::{output_dir_name, parts_dir, scan_completed_ids},
};
use archiver_ledger::{
    ArchiveRecord, ArchiveRepository, DownloadGuard, LedgerError, LockKey, MutedSpan,
    SqlxArchiveRepository, open_ledger,
};
use twitch_api::{ApiClient, BroadcastInfo, Channel, Chapter, MutedRange, Quality, Vod};

use crate::args::Args;

/// How long after going live a broadcast may still be waiting for its VOD.
const VOD_GRACE: Duration = Duration::from_secs(120);

/// Pre-roll capture slice between checks for a newly appeared VOD.
const PRE_ROLL_SLICE: Duration = Duration::from_secs(30);

pub async fn run(args: Args) -> anyhow::Result<()> {
    let config_dir = args.config_dir();
    std::fs::create_dir_all(&config_dir)
        .with_context(|| format!("creating config directory {}", config_dir.display()))?;
    let pool = open_ledger(&config_dir.join("vods.db")).await?;
    let repository: Arc<dyn ArchiveRepository> = Arc::new(SqlxArchiveRepository::new(pool));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                cancel.cancel();
            }
        });
    }

    let app = App {
        api: ApiClient::new(reqwest::Client::new()),
        repository,
        quality: Quality::parse(&args.quality),
        lock_dir: config_dir,
        cancel,
        args,
    };

    for vod_id in app.args.vod_ids.clone() {
        if app.cancel.is_cancelled() {
            break;
        }
        let vod = Vod::fetch(&app.api, vod_id).await?;
        app.report(vod_id, app.archive_vod(vod, None).await)?;
    }

    for login in app.args.channels.clone() {
        if app.cancel.is_cancelled() {
            break;
        }
        if let Err(e) = app.archive_channel(&login).await {
            error!(login = %login, error = %e, "channel archiving failed");
        }
    }
    Ok(())
}

struct App {
    api: ApiClient,
    repository: Arc<dyn ArchiveRepository>,
    quality: Quality,
    lock_dir: PathBuf,
    cancel: CancellationToken,
    args: Args,
}

impl App {
    /// Logs skippable outcomes (already archived, locked by another
    /// instance), propagates cancellation, and swallows other per-broadcast
    /// failures so the queue keeps moving.
    fn report(&self, id: u64, result: anyhow::Result<()>) -> anyhow::Result<()> {
        let Err(e) = result else { return Ok(()) };
        if let Some(ledger) = e.downcast_ref::<LedgerError>()
            && ledger.is_skippable()
        {
            info!(id, "skipping broadcast: {ledger}");
            return Ok(());
        }
        if matches!(e.downcast_ref::<ArchiveError>(), Some(ArchiveError::Cancelled)) {
            return Err(e);
        }
        error!(id, error = %e, "broadcast archiving failed");
        Ok(())
    }

    async fn archive_channel(&self, login: &str) -> anyhow::Result<()> {
        let channel = Channel::fetch(&self.api, login).await?;
        info!(login = %channel.login, live = channel.is_live(), "channel resolved");

        let mut live_stream_id = None;
        if let Some(broadcast) = channel.broadcast.clone()
            && !self.args.archive_only
        {
            live_stream_id = Some(broadcast.stream_id);
            let result = self.archive_live(&channel, &broadcast).await;
            self.report(broadcast.stream_id, result)?;
        }

        if self.args.live_only {
            return Ok(());
        }

        let vods = channel.videos(&self.api).await?;
        let archived: HashSet<i64> = self
            .repository
            .archived_stream_ids(&channel.login)
            .await?
            .into_iter()
            .collect();
        debug!(
            login = %channel.login,
            listed = vods.len(),
            archived = archived.len(),
            "diffing channel vods against ledger"
        );

        for mut vod in vods {
            if self.cancel.is_cancelled() {
                break;
            }
            if vod.stream_id.is_none() {
                // processing thumbnail; the seek-preview url still knows
                if let Err(e) = vod.resolve_stream_id(&self.api).await {
                    warn!(vod_id = vod.vod_id, error = %e, "stream id resolution failed");
                }
            }
            // the live broadcast's vod was handled above
            if vod.stream_id.is_some() && vod.stream_id == live_stream_id {
                continue;
            }
            if let Some(id) = vod.stream_id
                && archived.contains(&(id as i64))
            {
                // possibly only one format is archived; the guard decides
                debug!(vod_id = vod.vod_id, "broadcast already in ledger");
            }
            let vod_id = vod.vod_id;
            let result = self.archive_vod(vod, None).await;
            self.report(vod_id, result)?;
        }
        Ok(())
    }

    /// A live broadcast with a VOD behind it is archived like any other VOD,
    /// plus a concurrent live capture. Without a VOD it is captured from the
    /// stream alone, watching for a VOD to appear during the grace period.
    async fn archive_live(
        &self,
        channel: &Channel,
        broadcast: &BroadcastInfo,
    ) -> anyhow::Result<()> {
        if let Some(vod_id) = channel.broadcast_vod_id(&self.api).await? {
            let vod = Vod::fetch(&self.api, vod_id).await?;
            if vod.is_paired_with(broadcast) {
                return self.archive_vod(vod, Some(channel.clone())).await;
            }
            debug!(vod_id, "latest vod belongs to an earlier broadcast");
        }
        self.archive_stream_only(channel, broadcast).await
    }

    async fn archive_stream_only(
        &self,
        channel: &Channel,
        broadcast: &BroadcastInfo,
    ) -> anyhow::Result<()> {
        let placeholder = Vod::from_broadcast(channel, broadcast);
        let guard = DownloadGuard::begin(
            self.repository.clone(),
            &self.lock_dir,
            LockKey::StreamOnly(broadcast.stream_id),
            broadcast.stream_id as i64,
            true,
            false,
        )
        .await?;

        let output_dir = self.output_dir(&placeholder);
        tokio::fs::create_dir_all(parts_dir(&output_dir)).await?;
        info!(
            login = %channel.login,
            stream_id = broadcast.stream_id,
            "capturing live broadcast without a vod"
        );

        let mut capture = LiveCapture::new(
            self.api.clone(),
            channel.clone(),
            &placeholder,
            &self.quality,
            AlignMode::Aligned,
            output_dir.clone(),
            self.cancel.clone(),
        )
        .await?;

        // pre-roll in slices while the broadcast is young enough that a VOD
        // may still appear. Pre-roll numbering keys on the broadcast start
        // while the VOD numbers from its own creation time, so the buffer is
        // discarded the moment a paired VOD shows up
        while placeholder.seconds_since_live() < VOD_GRACE.as_secs() as i64 {
            capture.capture_for(PRE_ROLL_SLICE).await?;
            if let Some(vod_id) = channel.broadcast_vod_id(&self.api).await? {
                let vod = Vod::fetch(&self.api, vod_id).await?;
                if vod.is_paired_with(broadcast) {
                    info!(vod_id, "vod appeared, discarding pre-roll and archiving the vod");
                    drop(guard);
                    tokio::fs::remove_dir_all(&output_dir).await?;
                    return self.archive_vod(vod, Some(channel.clone())).await;
                }
            }
        }

        // no VOD is coming; aligned numbering no longer matters
        match capture.run().await {
            Ok(()) => {}
            Err(ArchiveError::UnsupportedPartDuration) => {
                warn!("part durations defeat alignment, restarting sequentially");
                let mut channel = channel.clone();
                channel.refresh(&self.api).await?;
                if channel.broadcast.as_ref().map(|b| b.stream_id)
                    == Some(broadcast.stream_id)
                {
                    capture = LiveCapture::new(
                        self.api.clone(),
                        channel,
                        &placeholder,
                        &self.quality,
                        AlignMode::Sequential,
                        output_dir.clone(),
                        self.cancel.clone(),
                    )
                    .await?;
                    capture.run().await?;
                }
            }
            Err(e) => return Err(e.into()),
        }

        metadata::write_chapter_files(&output_dir, &capture.chapters()).await?;
        // stream captures have no authoritative duration or repair source
        tokio::fs::write(output_dir.join(".ignorelength"), b"").await?;

        let completed = scan_completed_ids(&output_dir).await?;
        let elapsed = placeholder.seconds_since_live().max(0) as u64;
        let merger = Merger::new(&output_dir, elapsed).ignore_corrupt(true);
        merger.merge(&completed).await?;
        merger.verify_length().await?;
        merger.cleanup(broadcast.stream_id).await?;

        let mut record = archive_record(&placeholder, &[], &capture.chapters());
        record.duration = elapsed as i64;
        record.video_archived = true;
        guard.finish(&record).await?;
        Ok(())
    }

    /// Archives one VOD-backed broadcast: video (with optional concurrent
    /// live capture) and chat, as requested, then records it in the ledger.
    async fn archive_vod(&self, mut vod: Vod, live: Option<Channel>) -> anyhow::Result<()> {
        if vod.stream_id.is_none()
            && let Err(e) = vod.resolve_stream_id(&self.api).await
        {
            warn!(vod_id = vod.vod_id, error = %e, "stream id resolution failed");
        }
        // broadcasts predating stream ids key on the vod id in both columns
        let stream_id = vod.stream_id.unwrap_or(vod.vod_id) as i64;

        let guard = DownloadGuard::begin(
            self.repository.clone(),
            &self.lock_dir,
            LockKey::Vod(vod.vod_id),
            stream_id,
            self.args.want_video(),
            self.args.want_chat(),
        )
        .await?;
        // the ledger row may already cover one format; only produce the rest
        let (want_video, want_chat) =
            guard.missing_formats(self.args.want_video(), self.args.want_chat());

        let output_dir = self.output_dir(&vod);
        tokio::fs::create_dir_all(&output_dir).await?;
        info!(
            vod_id = vod.vod_id,
            title = %vod.title,
            live = live.is_some(),
            "archiving broadcast"
        );

        let muted_ranges = match vod.muted_segment_ranges(&self.api).await {
            Ok(ranges) => ranges,
            Err(e) => {
                warn!(vod_id = vod.vod_id, error = %e, "muted segment lookup failed");
                Vec::new()
            }
        };
        let chapters = vod.chapters(&self.api).await.unwrap_or_default();

        let video_task = async {
            if !want_video {
                return Ok::<_, anyhow::Error>(None);
            }
            let final_vod = self
                .archive_video(&vod, live.clone(), &output_dir, &muted_ranges, &chapters)
                .await?;
            Ok(Some(final_vod))
        };
        let chat_task = async {
            if !want_chat {
                return Ok::<_, anyhow::Error>(());
            }
            let mut chat = ChatArchiver::new(
                self.api.clone(),
                vod.vod_id,
                output_dir.clone(),
                self.cancel.clone(),
            );
            chat.run(live.clone()).await?;
            Ok(())
        };

        let (video_result, chat_result) = tokio::join!(video_task, chat_task);
        let final_vod = video_result?.unwrap_or_else(|| vod.clone());
        chat_result?;

        let mut record = archive_record(&final_vod, &muted_ranges, &chapters);
        record.video_archived = want_video;
        record.chat_archived = want_chat;
        guard.finish(&record).await?;
        info!(vod_id = vod.vod_id, "broadcast archived");
        Ok(())
    }

    /// Video side of a broadcast: acquisition, merge, conversion, bounded
    /// repair, verification and cleanup. Returns the VOD with its duration
    /// as refreshed from the playlist.
    async fn archive_video(
        &self,
        vod: &Vod,
        live: Option<Channel>,
        output_dir: &std::path::Path,
        muted_ranges: &[MutedRange],
        chapters: &[Chapter],
    ) -> anyhow::Result<Vod> {
        tokio::fs::create_dir_all(parts_dir(output_dir)).await?;
        metadata::write_chapter_files(output_dir, chapters).await?;
        metadata::write_vod_json(output_dir, vod, muted_ranges).await?;
        metadata::download_thumbnail(&self.api, vod, output_dir).await?;

        let mut downloader = VodDownloader::new(
            self.api.clone(),
            vod.clone(),
            self.quality.clone(),
            output_dir.to_path_buf(),
            self.args.threads,
            self.cancel.clone(),
        );

        if let Some(channel) = live.clone() {
            // capture the stream alongside the vod download; segments the
            // capture lands are ones the vod diff never has to fetch
            let capture = LiveCapture::new(
                self.api.clone(),
                channel.clone(),
                vod,
                &self.quality,
                AlignMode::Aligned,
                output_dir.to_path_buf(),
                self.cancel.clone(),
            )
            .await;
            match capture {
                Ok(mut capture) => {
                    let (capture_result, download_result) =
                        tokio::join!(capture.run(), downloader.run(Some(channel)));
                    match capture_result {
                        Ok(()) | Err(ArchiveError::UnsupportedPartDuration) => {}
                        Err(ArchiveError::Cancelled) => return Err(ArchiveError::Cancelled.into()),
                        // the vod download covers whatever the capture missed
                        Err(e) => warn!(error = %e, "live capture failed"),
                    }
                    download_result?;
                }
                Err(e) => {
                    warn!(error = %e, "live capture unavailable, vod download only");
                    downloader.run(Some(channel)).await?;
                }
            }
        } else {
            downloader.run(None).await?;
        }

        let staging_key = vod.stream_id.unwrap_or(vod.vod_id);
        let mut muted_ids: std::collections::BTreeSet<u64> =
            downloader.muted_ids().iter().copied().collect();
        for range in muted_ranges {
            muted_ids.extend(range.segment_ids());
        }

        let final_vod = downloader.vod().clone();
        let mut merger =
            Merger::new(output_dir, final_vod.duration).with_muted_ids(muted_ids.iter().copied());
        let completed = scan_completed_ids(output_dir).await?;
        match merger.merge(&completed).await {
            Ok(()) => {}
            Err(ArchiveError::CorruptParts { ids }) => {
                let mut repairer = Repairer::new(
                    self.api.clone(),
                    downloader.index_url().map(str::to_string),
                    output_dir,
                    staging_key,
                    muted_ids,
                );
                let mut repair_vod = final_vod.clone();
                repairer
                    .repair_and_merge(&mut repair_vod, &mut merger, ids)
                    .await?;
            }
            Err(e) => return Err(e.into()),
        }

        merger.verify_length().await?;
        merger.cleanup(staging_key).await?;
        Ok(final_vod)
    }

    fn output_dir(&self, vod: &Vod) -> PathBuf {
        self.args
            .directory
            .join(&vod.channel_login)
            .join(output_dir_name(&vod.title, vod.created_at, vod.vod_id))
    }
}

fn archive_record(vod: &Vod, muted: &[MutedRange], chapters: &[Chapter]) -> ArchiveRecord {
    let spans: Vec<MutedSpan> = muted
        .iter()
        .map(|m| MutedSpan {
            offset: m.offset,
            duration: m.duration,
        })
        .collect();
    let chapter_listing = chapters
        .iter()
        .map(|c| format!("{}s {}", c.position_secs as u64, c.description))
        .collect::<Vec<_>>()
        .join("\n");

    let mut record = ArchiveRecord {
        vod_id: vod.vod_id as i64,
        stream_id: vod.stream_id.unwrap_or(vod.vod_id) as i64,
        user_id: vod.channel_id as i64,
        user_login: vod.channel_login.clone(),
        title: vod.title.clone(),
        created_at: vod.created_at,
        published_at: vod.published_at,
        thumbnail_url: vod.thumbnail_url.clone(),
        duration: vod.duration as i64,
        chapters: chapter_listing,
        muted_segments: "[]".into(),
        video_archived: false,
        chat_archived: false,
    };
    record.set_muted_spans(&spans);
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn record_carries_vod_identity_and_muted_spans() {
        let vod = Vod {
            vod_id: 100,
            stream_id: Some(200),
            channel_id: 7,
            channel_login: "somestreamer".into(),
            title: "a broadcast".into(),
            description: String::new(),
            created_at: Utc::now(),
            published_at: Utc::now(),
            duration: 3600,
            thumbnail_url: String::new(),
            view_count: 0,
            game: "Tetris".into(),
        };
        let muted = [MutedRange {
            offset: 60,
            duration: 30,
        }];
        let chapters = [Chapter {
            description: "Tetris".into(),
            position_secs: 0.0,
            duration_secs: 3600.0,
        }];

        let record = archive_record(&vod, &muted, &chapters);
        assert_eq!(record.vod_id, 100);
        assert_eq!(record.stream_id, 200);
        assert_eq!(record.user_login, "somestreamer");
        assert_eq!(
            record.muted_spans(),
            vec![MutedSpan {
                offset: 60,
                duration: 30
            }]
        );
        assert_eq!(record.chapters, "0s Tetris");
        assert!(!record.video_archived);
    }

    #[test]
    fn vods_without_stream_id_key_on_vod_id() {
        let vod = Vod {
            vod_id: 100,
            stream_id: None,
            channel_id: 7,
            channel_login: "somestreamer".into(),
            title: String::new(),
            description: String::new(),
            created_at: Utc::now(),
            published_at: Utc::now(),
            duration: 0,
            thumbnail_url: String::new(),
            view_count: 0,
            game: String::new(),
        };
        let record = archive_record(&vod, &[], &[]);
        assert_eq!(record.stream_id, 100);
    }
}
