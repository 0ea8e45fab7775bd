//! Live part ingestion and segment alignment.
//!
//! A live playlist advertises ~2 second parts; Twitch's VOD of the same
//! broadcast stores ~10 second segments of five parts each. The aligner
//! groups incoming parts into segments numbered the way the VOD will number
//! them, so a capture finished from both sides lines up file for file.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use m3u8_rs::MediaSegment;

use crate::error::{ArchiveError, Result};

/// Parts per full live segment.
pub const PARTS_PER_SEGMENT: usize = 5;

/// Empirical offset between a part's program date and the broadcast start
/// used when deriving segment ids. Fixed by observation against Twitch's own
/// VOD numbering; not derived, and not assumed valid elsewhere.
pub const ALIGNMENT_OFFSET_SECS: f64 = 4.0;

/// Nominal live part duration. Streams advertising other durations cannot be
/// aligned.
const NOMINAL_PART_SECS: f64 = 2.0;

/// One advertised live part.
#[derive(Debug, Clone, PartialEq)]
pub struct Part {
    pub url: String,
    pub timestamp: DateTime<Utc>,
    pub duration: f64,
    pub is_ad: bool,
}

impl Part {
    /// Builds a part from a playlist entry. Entries without a program date
    /// cannot be placed on the broadcast timeline and are skipped.
    /// Twitch titles stream content `live`; anything else is an ad break.
    pub fn from_media_segment(segment: &MediaSegment) -> Option<Self> {
        let timestamp = segment.program_date_time?.with_timezone(&Utc);
        Some(Self {
            url: segment.uri.clone(),
            timestamp,
            duration: segment.duration as f64,
            is_ad: segment.title.as_deref().map(str::trim) != Some("live"),
        })
    }
}

/// A live segment being assembled out of parts.
#[derive(Debug, Clone)]
pub struct LiveSegment {
    pub id: u64,
    pub parts: Vec<Part>,
    pub duration: f64,
}

impl LiveSegment {
    fn new(id: u64) -> Self {
        Self {
            id,
            parts: Vec::with_capacity(PARTS_PER_SEGMENT),
            duration: 0.0,
        }
    }

    fn push(&mut self, part: Part) {
        self.duration += part.duration;
        self.parts.push(part);
    }

    pub fn is_full(&self) -> bool {
        self.parts.len() >= PARTS_PER_SEGMENT
    }
}

/// Segment numbering strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignMode {
    /// Derive ids from part timestamps so they match the VOD's numbering.
    Aligned,
    /// Number segments in arrival order. Used when no VOD will ever exist or
    /// when the stream's part durations defeat alignment.
    Sequential,
}

/// Groups advertised parts into download-ready segments.
pub struct SegmentAligner {
    created_at: DateTime<Utc>,
    mode: AlignMode,
    current_id: u64,
    segments: BTreeMap<u64, LiveSegment>,
    seen_urls: HashSet<String>,
    unsupported_urls: HashSet<String>,
}

impl SegmentAligner {
    pub fn new(created_at: DateTime<Utc>, mode: AlignMode, start_id: u64) -> Self {
        Self {
            created_at,
            mode,
            current_id: start_id,
            segments: BTreeMap::new(),
            seen_urls: HashSet::new(),
            unsupported_urls: HashSet::new(),
        }
    }

    pub fn mode(&self) -> AlignMode {
        self.mode
    }

    fn aligned_id(&self, part: &Part) -> u64 {
        let elapsed = (part.timestamp - self.created_at).num_milliseconds() as f64 / 1000.0;
        let id = ((ALIGNMENT_OFFSET_SECS + elapsed) / 10.0).floor();
        if id < 0.0 { 0 } else { id as u64 }
    }

    /// Ingests one advertised part.
    ///
    /// Ads are dropped, re-advertised urls are ignored, and in aligned mode
    /// more than two parts of non-nominal duration abort with
    /// [`ArchiveError::UnsupportedPartDuration`] (the last part or two of a
    /// broadcast legitimately run short, hence the allowance).
    pub fn add_part(&mut self, part: Part) -> Result<()> {
        if part.is_ad {
            tracing::debug!(timestamp = %part.timestamp, "ignoring advertisement part");
            return Ok(());
        }
        if !self.seen_urls.insert(part.url.clone()) {
            return Ok(());
        }

        if self.mode == AlignMode::Aligned && part.duration != NOMINAL_PART_SECS {
            tracing::debug!(duration = part.duration, "part with unsupported duration");
            self.unsupported_urls.insert(part.url.clone());
            if self.unsupported_urls.len() > 2 {
                return Err(ArchiveError::UnsupportedPartDuration);
            }
        }

        let id = match self.mode {
            AlignMode::Aligned => self.aligned_id(&part),
            AlignMode::Sequential => self.current_id,
        };

        let segment = self
            .segments
            .entry(id)
            .or_insert_with(|| LiveSegment::new(id));
        segment.push(part);

        if segment.is_full() {
            self.current_id = self.current_id.max(id) + 1;
        }
        Ok(())
    }

    /// Ids of every segment holding a full complement of parts, ascending.
    pub fn completed_ids(&self) -> Vec<u64> {
        self.segments
            .values()
            .filter(|s| s.is_full())
            .map(|s| s.id)
            .collect()
    }

    /// Removes and returns a segment for download.
    pub fn pop(&mut self, id: u64) -> Option<LiveSegment> {
        self.segments.remove(&id)
    }

    /// The highest incomplete segment, finalized best-effort at end of
    /// stream.
    pub fn pop_in_progress(&mut self) -> Option<LiveSegment> {
        let id = self
            .segments
            .values()
            .filter(|s| !s.is_full())
            .map(|s| s.id)
            .max()?;
        self.segments.remove(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn part(offset_secs: f64, url: &str) -> Part {
        Part {
            url: url.to_string(),
            timestamp: base() + Duration::milliseconds((offset_secs * 1000.0) as i64),
            duration: 2.0,
            is_ad: false,
        }
    }

    fn base() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn aligned_ids_follow_offset_window() {
        let aligner = SegmentAligner::new(base(), AlignMode::Aligned, 0);
        // floor((4 + 8) / 10) = 1
        assert_eq!(aligner.aligned_id(&part(8.0, "u")), 1);
        assert_eq!(aligner.aligned_id(&part(5.9, "u")), 0);
        assert_eq!(aligner.aligned_id(&part(6.0, "u")), 1);
        assert_eq!(aligner.aligned_id(&part(16.0, "u")), 2);
    }

    #[test]
    fn first_five_parts_complete_segment_zero() {
        // program dates trail the broadcast start by the usual 4s skew the
        // alignment offset corrects for
        let mut aligner = SegmentAligner::new(base(), AlignMode::Aligned, 0);
        for (i, offset) in [-4.0, -2.0, 0.0, 2.0, 4.0].iter().enumerate() {
            aligner.add_part(part(*offset, &format!("u{i}"))).unwrap();
        }
        assert_eq!(aligner.completed_ids(), vec![0]);

        // the sixth part opens segment one
        aligner.add_part(part(6.0, "u5")).unwrap();
        let seg = aligner.pop(0).unwrap();
        assert_eq!(seg.parts.len(), 5);
        assert!((seg.duration - 10.0).abs() < f64::EPSILON);
        assert!(aligner.completed_ids().is_empty());
        assert_eq!(aligner.pop_in_progress().unwrap().id, 1);
    }

    #[test]
    fn ids_are_monotonic_for_increasing_timestamps() {
        let aligner = SegmentAligner::new(base(), AlignMode::Aligned, 0);
        let mut last = 0;
        for i in 0..100 {
            let id = aligner.aligned_id(&part(i as f64 * 2.0, "u"));
            assert!(id >= last);
            last = id;
        }
    }

    #[test]
    fn readvertised_urls_are_ignored() {
        let mut aligner = SegmentAligner::new(base(), AlignMode::Aligned, 0);
        aligner.add_part(part(0.0, "same")).unwrap();
        aligner.add_part(part(0.0, "same")).unwrap();
        aligner.add_part(part(2.0, "other")).unwrap();

        let seg = aligner.pop_in_progress().unwrap();
        assert_eq!(seg.parts.len(), 2);
    }

    #[test]
    fn advertisement_parts_are_dropped() {
        let mut aligner = SegmentAligner::new(base(), AlignMode::Aligned, 0);
        let mut ad = part(0.0, "ad");
        ad.is_ad = true;
        aligner.add_part(ad).unwrap();
        assert!(aligner.pop_in_progress().is_none());
    }

    #[test]
    fn sequential_mode_numbers_in_arrival_order() {
        let mut aligner = SegmentAligner::new(base(), AlignMode::Sequential, 3);
        for i in 0..12 {
            // arbitrary timestamps; sequential mode ignores them
            aligner
                .add_part(part(i as f64 * 7.0, &format!("u{i}")))
                .unwrap();
        }
        assert_eq!(aligner.completed_ids(), vec![3, 4]);
        assert_eq!(aligner.pop(3).unwrap().parts.len(), 5);
        assert_eq!(aligner.pop_in_progress().unwrap().parts.len(), 2);
    }

    #[test]
    fn odd_durations_abort_aligned_mode_after_allowance() {
        let mut aligner = SegmentAligner::new(base(), AlignMode::Aligned, 0);
        for i in 0..2 {
            let mut p = part(i as f64 * 2.0, &format!("short{i}"));
            p.duration = 1.5;
            aligner.add_part(p).unwrap();
        }
        // two odd parts tolerated (streams end on short parts)
        let mut third = part(4.0, "short2");
        third.duration = 1.5;
        assert!(matches!(
            aligner.add_part(third),
            Err(ArchiveError::UnsupportedPartDuration)
        ));
    }

    #[test]
    fn sequential_mode_tolerates_odd_durations() {
        let mut aligner = SegmentAligner::new(base(), AlignMode::Sequential, 0);
        for i in 0..6 {
            let mut p = part(i as f64, &format!("u{i}"));
            p.duration = 1.0;
            aligner.add_part(p).unwrap();
        }
        assert_eq!(aligner.completed_ids(), vec![0]);
    }

    #[test]
    fn aligners_with_different_epochs_disagree_on_ids() {
        // broadcast start and vod creation can sit several seconds apart
        // while still pairing; the same part then lands on different ids,
        // which is why a pre-roll buffer cannot feed a vod-numbered archive
        let stream_era = SegmentAligner::new(base(), AlignMode::Aligned, 0);
        let vod_era = SegmentAligner::new(base() + Duration::seconds(6), AlignMode::Aligned, 0);
        let p = part(8.0, "u");
        assert_eq!(stream_era.aligned_id(&p), 1);
        assert_eq!(vod_era.aligned_id(&p), 0);
    }

    #[test]
    fn parts_before_broadcast_start_clamp_to_zero() {
        let aligner = SegmentAligner::new(base(), AlignMode::Aligned, 0);
        assert_eq!(aligner.aligned_id(&part(-8.0, "u")), 0);
    }
}
