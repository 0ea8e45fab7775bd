//! Merging downloaded segments into `merged.ts`, conversion to `vod.mp4`
//! and duration verification.
//!
//! Conversion watches ffmpeg's stderr as it runs: `time=` lines drive
//! progress, `Packet corrupt` lines are mapped back to segment ids through
//! the stream's dts offset. Corrupt ids outside the muted whitelist abort
//! the conversion so the repair pass can re-fetch them.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;

use regex::Regex;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, error, info, warn};

use crate::error::{ArchiveError, Result};
use crate::paths::{parts_dir, segment_file_name, staging_dir};
use crate::process::tokio_command;

/// MPEG-TS dts ticks per second.
const TIMESCALE: f64 = 90_000.0;

/// The 33-bit dts counter wraps ~26.5 hours in. Constants observed from
/// Twitch streams crossing the boundary: the last pre-wrap packet dts, the
/// tick gap between consecutive packets, and the magnitude of the first
/// post-wrap (negative) dts.
const DTS_WRAP_LAST: i64 = 8_585_279_910;
const DTS_WRAP_STEP: i64 = 2_970;
const DTS_WRAP_UNDERFLOW: i64 = 4_651_712;

/// Output seconds after which the wraparound correction may apply.
const DTS_WRAP_MIN_SECS: u64 = 95_320;

/// Allowed deviation between converted and expected duration.
const DURATION_TOLERANCE_SECS: i64 = 2;

/// How the completed segments will be merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergePlan {
    /// All ids `0..=max` present; plain byte concatenation.
    Concat { ids: Vec<u64> },
    /// Gaps present; ffmpeg's concat demuxer regenerates timestamps across
    /// them.
    Demux { ids: Vec<u64>, missing: BTreeSet<u64> },
}

impl MergePlan {
    pub fn for_ids(completed: &[u64]) -> Result<Self> {
        let Some(&max) = completed.iter().max() else {
            return Err(ArchiveError::merge("no completed segments to merge"));
        };
        let mut ids: Vec<u64> = completed.to_vec();
        ids.sort_unstable();
        ids.dedup();

        let present: BTreeSet<u64> = ids.iter().copied().collect();
        let missing: BTreeSet<u64> = (0..=max).filter(|id| !present.contains(id)).collect();

        if missing.is_empty() {
            Ok(Self::Concat { ids })
        } else {
            Ok(Self::Demux { ids, missing })
        }
    }

    pub fn ids(&self) -> &[u64] {
        match self {
            Self::Concat { ids } | Self::Demux { ids, .. } => ids,
        }
    }
}

pub struct Merger {
    output_dir: PathBuf,
    expected_duration: u64,
    muted_ids: BTreeSet<u64>,
    /// Unaligned stream captures have no VOD to repair from; corrupt
    /// packets are tolerated instead of reported.
    ignore_corrupt: bool,
}

impl Merger {
    pub fn new(output_dir: &Path, expected_duration: u64) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
            expected_duration,
            muted_ids: BTreeSet::new(),
            ignore_corrupt: false,
        }
    }

    pub fn with_muted_ids(mut self, ids: impl IntoIterator<Item = u64>) -> Self {
        self.muted_ids = ids.into_iter().collect();
        self
    }

    pub fn set_muted_ids(&mut self, ids: impl IntoIterator<Item = u64>) {
        self.muted_ids = ids.into_iter().collect();
    }

    pub fn ignore_corrupt(mut self, ignore: bool) -> Self {
        self.ignore_corrupt = ignore;
        self
    }

    fn merged_path(&self) -> PathBuf {
        self.output_dir.join("merged.ts")
    }

    fn mp4_path(&self) -> PathBuf {
        self.output_dir.join("vod.mp4")
    }

    fn part_path(&self, id: u64) -> PathBuf {
        parts_dir(&self.output_dir).join(segment_file_name(id))
    }

    /// Merges the given completed segment ids and converts the result to
    /// mp4. Fails with [`ArchiveError::CorruptParts`] when repairable
    /// corruption is detected.
    pub async fn merge(&self, completed: &[u64]) -> Result<()> {
        let plan = MergePlan::for_ids(completed)?;
        info!(segments = plan.ids().len(), "merging downloaded segments");
        self.combine(&plan).await?;
        info!("converting merged stream to mp4");
        self.convert().await
    }

    async fn combine(&self, plan: &MergePlan) -> Result<()> {
        match plan {
            MergePlan::Concat { ids } => {
                let mut merged = fs::File::create(self.merged_path()).await?;
                for &id in ids {
                    let mut part = fs::File::open(self.part_path(id)).await?;
                    tokio::io::copy(&mut part, &mut merged).await?;
                }
                merged.flush().await?;
                Ok(())
            }
            MergePlan::Demux { ids, missing } => {
                warn!(?missing, "segment gaps present, merging with ffmpeg");
                self.combine_with_ffmpeg(ids).await
            }
        }
    }

    async fn combine_with_ffmpeg(&self, ids: &[u64]) -> Result<()> {
        let list_path = parts_dir(&self.output_dir).join("segments.txt");
        let mut listing = String::new();
        for &id in ids {
            listing.push_str(&format!("file '{}'\n", self.part_path(id).display()));
        }
        fs::write(&list_path, listing).await?;

        let mut child = tokio_command("ffmpeg")
            .args(["-hide_banner", "-fflags", "+genpts", "-f", "concat", "-safe", "0", "-y", "-i"])
            .arg(&list_path)
            .args(["-c", "copy"])
            .arg(self.merged_path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ArchiveError::merge(format!("failed to spawn ffmpeg: {e}")))?;

        let stderr = child.stderr.take().expect("stderr piped");
        let mut lines = BufReader::new(stderr).lines();
        while let Some(line) = lines.next_line().await? {
            if let Some(secs) = parse_progress_secs(&line) {
                debug!(secs, expected = self.expected_duration, "merge progress");
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(ArchiveError::merge(format!(
                "ffmpeg concat exited with {status}"
            )));
        }
        Ok(())
    }

    async fn convert(&self) -> Result<()> {
        let dts_offset = self.dts_offset().await?;

        let chapters_path = parts_dir(&self.output_dir).join("chapters.txt");
        let mut cmd = tokio_command("ffmpeg");
        cmd.args(["-hide_banner", "-y", "-i"]).arg(self.merged_path());
        if fs::try_exists(&chapters_path).await.unwrap_or(false) {
            cmd.arg("-i").arg(&chapters_path).args(["-map_metadata", "1"]);
        }
        cmd.args(["-c:a", "copy", "-c:v", "copy"]).arg(self.mp4_path());

        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ArchiveError::convert(format!("failed to spawn ffmpeg: {e}")))?;

        let stderr = child.stderr.take().expect("stderr piped");
        let mut lines = BufReader::new(stderr).lines();

        let mut ffmpeg_log = String::new();
        let mut corrupt_ids: BTreeSet<u64> = BTreeSet::new();
        let mut cur_secs: u64 = 0;

        while let Some(line) = lines.next_line().await? {
            ffmpeg_log.push_str(&line);
            ffmpeg_log.push('\n');

            if let Some(secs) = parse_progress_secs(&line) {
                cur_secs = secs;
                debug!(secs, expected = self.expected_duration, "convert progress");
            } else if line.contains("Packet corrupt") && !self.ignore_corrupt {
                let dts = parse_corrupt_dts(&line).ok_or_else(|| {
                    ArchiveError::convert(
                        "corrupt packet at unknown timestamp; delete the parts directory and re-archive",
                    )
                })?;
                let id = corrupt_segment_id(dts, dts_offset, cur_secs);
                if self.muted_ids.contains(&id) {
                    debug!(id, "corrupt packet inside muted range, ignoring");
                } else {
                    error!(id, dts, "corrupt packet encountered");
                    corrupt_ids.insert(id);
                }
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            let log_path = parts_dir(&self.output_dir).join("ffmpeg.log");
            if let Err(e) = fs::write(&log_path, &ffmpeg_log).await {
                warn!(error = %e, "failed to write ffmpeg log");
            }
            error!(path = %log_path.display(), "ffmpeg exited with error, output dumped");
            return Err(ArchiveError::convert(format!(
                "ffmpeg exited with {status}; delete the parts directory and re-archive"
            )));
        }

        if !corrupt_ids.is_empty() {
            return Err(ArchiveError::CorruptParts { ids: corrupt_ids });
        }
        Ok(())
    }

    /// dts of the broadcast's first tick, derived from the earliest part on
    /// disk: its container start time minus its position on the timeline,
    /// in dts ticks.
    async fn dts_offset(&self) -> Result<f64> {
        let ids = crate::paths::scan_completed_ids(&self.output_dir).await?;
        let Some(&first) = ids.first() else {
            return Err(ArchiveError::merge("no parts available to probe dts offset"));
        };
        let path = self.part_path(first);

        let output = tokio_command("ffprobe")
            .args(["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams"])
            .arg(&path)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ArchiveError::convert(format!("failed to spawn ffprobe: {e}")))?;

        let parsed: serde_json::Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| ArchiveError::convert(format!("unreadable ffprobe output: {e}")))?;
        let start_time: f64 = parsed["format"]["start_time"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ArchiveError::convert("ffprobe output missing start_time"))?;

        Ok((start_time - (first as f64) * 10.0) * TIMESCALE)
    }

    /// Checks the converted file's duration against the expected length.
    /// A `.ignorelength` marker (written when the source vanished mid
    /// download) skips the check.
    pub async fn verify_length(&self) -> Result<()> {
        if fs::try_exists(self.output_dir.join(".ignorelength"))
            .await
            .unwrap_or(false)
        {
            debug!("length marker present, skipping verification");
            return Ok(());
        }

        let output = tokio_command("ffprobe")
            .args(["-v", "quiet", "-i"])
            .arg(self.mp4_path())
            .args([
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ArchiveError::convert(format!("failed to spawn ffprobe: {e}")))?;
        if !output.status.success() {
            return Err(ArchiveError::convert("ffprobe duration probe failed"));
        }

        let actual: u64 = String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse::<f64>()
            .map(|d| d as u64)
            .map_err(|_| ArchiveError::convert("unreadable duration from ffprobe"))?;

        verify_duration(self.expected_duration, actual)
    }

    /// Removes the transitional artifacts once the output is verified.
    pub async fn cleanup(&self, staging_key: u64) -> Result<()> {
        debug!("removing segment parts and merge intermediates");
        let _ = fs::remove_file(self.merged_path()).await;
        let _ = fs::remove_dir_all(parts_dir(&self.output_dir)).await;
        let _ = fs::remove_dir_all(staging_dir(staging_key)).await;
        Ok(())
    }
}

fn verify_duration(expected: u64, actual: u64) -> Result<()> {
    let delta = actual as i64 - expected as i64;
    if delta.abs() <= DURATION_TOLERANCE_SECS {
        Ok(())
    } else {
        Err(ArchiveError::Verification { expected, actual })
    }
}

static PROGRESS_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"time=(\d+):(\d{2}):(\d{2})").unwrap());

static CORRUPT_DTS_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"dts = (-?\d+)\)").unwrap());

/// Extracts the output position in seconds from an ffmpeg progress line.
fn parse_progress_secs(line: &str) -> Option<u64> {
    let caps = PROGRESS_REGEX.captures(line)?;
    let h: u64 = caps[1].parse().ok()?;
    let m: u64 = caps[2].parse().ok()?;
    let s: u64 = caps[3].parse().ok()?;
    Some(h * 3600 + m * 60 + s)
}

/// Extracts the dts from a `Packet corrupt` line. Returns `None` for
/// packets without a timestamp (`NOPTS`).
fn parse_corrupt_dts(line: &str) -> Option<i64> {
    let caps = CORRUPT_DTS_REGEX.captures(line)?;
    caps[1].parse().ok()
}

/// Maps a corrupt packet's dts onto a ten-second segment id.
///
/// Past the 33-bit wrap point (reached ~26.5h in), a small dts belongs to
/// the post-wrap era and is shifted by one full counter period before the
/// offset is applied.
fn corrupt_segment_id(dts: i64, dts_offset: f64, cur_secs: u64) -> u64 {
    let effective = if cur_secs > DTS_WRAP_MIN_SECS && dts < DTS_WRAP_LAST {
        dts as f64 + (DTS_WRAP_LAST + DTS_WRAP_STEP + DTS_WRAP_UNDERFLOW) as f64 - dts_offset
    } else {
        dts as f64 - dts_offset
    };
    let id = (effective / TIMESCALE / 10.0).floor();
    if id < 0.0 { 0 } else { id as u64 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_ids_concat() {
        let plan = MergePlan::for_ids(&[0, 1, 2, 3]).unwrap();
        assert_eq!(
            plan,
            MergePlan::Concat {
                ids: vec![0, 1, 2, 3]
            }
        );
    }

    #[test]
    fn gapped_ids_demux() {
        let plan = MergePlan::for_ids(&[0, 1, 3]).unwrap();
        match plan {
            MergePlan::Demux { ids, missing } => {
                assert_eq!(ids, vec![0, 1, 3]);
                assert_eq!(missing, BTreeSet::from([2]));
            }
            other => panic!("expected demux plan, got {other:?}"),
        }
    }

    #[test]
    fn missing_leading_segment_demuxes() {
        assert!(matches!(
            MergePlan::for_ids(&[1, 2]).unwrap(),
            MergePlan::Demux { .. }
        ));
        assert!(MergePlan::for_ids(&[]).is_err());
    }

    #[test]
    fn duration_tolerance_is_two_seconds() {
        assert!(verify_duration(100, 100).is_ok());
        assert!(verify_duration(100, 102).is_ok());
        assert!(verify_duration(100, 98).is_ok());
        assert!(matches!(
            verify_duration(100, 103),
            Err(ArchiveError::Verification {
                expected: 100,
                actual: 103
            })
        ));
        assert!(verify_duration(100, 97).is_err());
    }

    #[test]
    fn progress_line_parses() {
        let line = "frame= 1000 fps=25 q=-1.0 size=  10kB time=01:02:03.45 bitrate= 100kbits/s";
        assert_eq!(parse_progress_secs(line), Some(3723));
        assert_eq!(parse_progress_secs("no timestamps here"), None);
    }

    #[test]
    fn corrupt_line_parses_dts() {
        let line = "[mpegts @ 0x55] Packet corrupt (stream = 0, dts = 5529600000).";
        assert_eq!(parse_corrupt_dts(line), Some(5_529_600_000));
        let nopts = "[mpegts @ 0x55] Packet corrupt (stream = 0, dts = NOPTS).";
        assert_eq!(parse_corrupt_dts(nopts), None);
    }

    #[test]
    fn corrupt_id_from_dts() {
        // offset 0: dts of 90000 ticks/s, 10s per segment
        assert_eq!(corrupt_segment_id(5_529_600_000, 0.0, 100), 6144);
        // offset shifts the mapping
        assert_eq!(corrupt_segment_id(900_000 * 11, 900_000.0, 100), 10);
    }

    #[test]
    fn corrupt_id_past_wrap_point() {
        // a small dts late in a >26h stream belongs after the wrap
        let id = corrupt_segment_id(0, 0.0, DTS_WRAP_MIN_SECS + 1);
        let expected =
            (((DTS_WRAP_LAST + DTS_WRAP_STEP + DTS_WRAP_UNDERFLOW) as f64) / 90_000.0 / 10.0)
                .floor() as u64;
        assert_eq!(id, expected);

        // before the wrap threshold the plain mapping applies
        assert_eq!(corrupt_segment_id(0, 0.0, 1000), 0);
    }
}
