//! Bounded corruption repair.
//!
//! When conversion reports corrupt segments, each one is set aside under a
//! `.corrupt` suffix and re-fetched from the VOD playlist. Comparing hashes
//! tells transient local damage (fresh copy differs, keep it) from upstream
//! corruption (fresh copy identical, whitelist the segment as muted). The
//! merge is then retried, at most twice, before giving up.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info, warn};

use twitch_api::{ApiClient, Vod};

use crate::error::{ArchiveError, Result};
use crate::merge::Merger;
use crate::paths::{parts_dir, safe_move, scan_completed_ids, segment_file_name, staging_dir};

/// Merge retries after repair before declaring the parts unrepairable.
const MAX_REPAIR_ROUNDS: u32 = 2;

const MAX_ATTEMPTS: u32 = 5;

pub struct Repairer {
    api: ApiClient,
    index_url: Option<String>,
    output_dir: PathBuf,
    staging_key: u64,
    muted_ids: BTreeSet<u64>,
}

impl Repairer {
    /// `index_url` is the resolved VOD playlist url; repairs without one
    /// (stream-only captures, expired VODs) fail as unrepairable.
    pub fn new(
        api: ApiClient,
        index_url: Option<String>,
        output_dir: &Path,
        staging_key: u64,
        muted_ids: BTreeSet<u64>,
    ) -> Self {
        Self {
            api,
            index_url,
            output_dir: output_dir.to_path_buf(),
            staging_key,
            muted_ids,
        }
    }

    /// Repairs the given corrupt segments and retries the merge, up to
    /// [`MAX_REPAIR_ROUNDS`] times.
    pub async fn repair_and_merge(
        &mut self,
        vod: &mut Vod,
        merger: &mut Merger,
        mut corrupt: BTreeSet<u64>,
    ) -> Result<()> {
        for round in 1..=MAX_REPAIR_ROUNDS {
            info!(round, ids = ?corrupt, "repairing corrupt segments");
            self.refetch(vod, &corrupt).await?;
            merger.set_muted_ids(self.muted_ids.iter().copied());

            let completed = scan_completed_ids(&self.output_dir).await?;
            match merger.merge(&completed).await {
                Ok(()) => return Ok(()),
                Err(ArchiveError::CorruptParts { ids }) => {
                    warn!(round, ids = ?ids, "corruption persists after repair");
                    corrupt = ids;
                }
                Err(e) => return Err(e),
            }
        }
        Err(ArchiveError::Unrepairable { ids: corrupt })
    }

    /// Sets each corrupt part aside and downloads a fresh copy from the
    /// playlist. Segments no longer advertised keep their original file and
    /// are whitelisted instead.
    async fn refetch(&mut self, vod: &mut Vod, corrupt: &BTreeSet<u64>) -> Result<()> {
        let Some(index_url) = self.index_url.clone() else {
            return Err(ArchiveError::Unrepairable {
                ids: corrupt.clone(),
            });
        };

        // resolve the playlist before touching any files; an index gone
        // mid-repair must leave the parts directory intact
        let text = match vod.playlist_text(&self.api, &index_url).await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "vod index unavailable, repair impossible");
                return Err(ArchiveError::Unrepairable {
                    ids: corrupt.clone(),
                });
            }
        };
        let playlist = m3u8_rs::parse_media_playlist_res(text.as_bytes())
            .map_err(|e| ArchiveError::merge(format!("unreadable vod playlist: {e}")))?;
        let base = match index_url.rfind('/') {
            Some(pos) => &index_url[..=pos],
            None => index_url.as_str(),
        };
        let by_id: HashMap<u64, String> = playlist
            .segments
            .iter()
            .filter_map(|s| {
                let stem = s.uri.strip_suffix(".ts")?;
                let id: u64 = stem.strip_suffix("-muted").unwrap_or(stem).parse().ok()?;
                Some((id, format!("{base}{}", s.uri)))
            })
            .collect();

        let staging = staging_dir(self.staging_key);
        fs::create_dir_all(&staging).await?;

        let parts = parts_dir(&self.output_dir);
        for &id in corrupt {
            let part = parts.join(segment_file_name(id));
            let aside = corrupt_path(&part);

            let Some(uri) = by_id.get(&id) else {
                debug!(id, "segment no longer advertised, keeping original");
                self.muted_ids.insert(id);
                continue;
            };

            fs::rename(&part, &aside).await?;
            let staged = staging.join(segment_file_name(id));
            if let Err(e) = self.fetch_with_retry(uri, &staged, id).await {
                fs::rename(&aside, &part).await?;
                return Err(e);
            }
            safe_move(&staged, &part).await?;

            match refetch_outcome(&file_sha256(&part).await?, &file_sha256(&aside).await?) {
                RefetchOutcome::Upstream => {
                    debug!(id, "fresh copy identical, corruption is upstream");
                    self.muted_ids.insert(id);
                }
                RefetchOutcome::LocalRepaired => {
                    debug!(id, "fresh copy differs, local damage repaired");
                }
            }
        }
        Ok(())
    }

    async fn fetch_with_retry(&self, uri: &str, staged: &Path, id: u64) -> Result<()> {
        for attempt in 1..=MAX_ATTEMPTS {
            match self.api.get_bytes(uri).await {
                Ok(bytes) => {
                    fs::write(staged, &bytes).await?;
                    return Ok(());
                }
                Err(e) => {
                    warn!(id, attempt, error = %e, "repair fetch failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        Err(ArchiveError::SegmentDownload {
            id,
            attempts: MAX_ATTEMPTS,
        })
    }
}

fn corrupt_path(part: &Path) -> PathBuf {
    let mut name = part.as_os_str().to_os_string();
    name.push(".corrupt");
    PathBuf::from(name)
}

/// What a re-fetched segment says about the corruption.
#[derive(Debug, PartialEq, Eq)]
enum RefetchOutcome {
    /// Fresh copy identical to the set-aside one; the damage is in the
    /// source and the id joins the muted whitelist so the next merge pass
    /// does not re-flag it.
    Upstream,
    /// Fresh copy differs; the local file was transiently damaged and the
    /// new copy stands.
    LocalRepaired,
}

fn refetch_outcome(fresh_hash: &str, aside_hash: &str) -> RefetchOutcome {
    if fresh_hash == aside_hash {
        RefetchOutcome::Upstream
    } else {
        RefetchOutcome::LocalRepaired
    }
}

async fn file_sha256(path: &Path) -> Result<String> {
    let bytes = fs::read(path).await?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn vod() -> Vod {
        Vod {
            vod_id: 100,
            stream_id: Some(200),
            channel_id: 7,
            channel_login: "somestreamer".into(),
            title: "a broadcast".into(),
            description: String::new(),
            created_at: Utc::now(),
            published_at: Utc::now(),
            duration: 0,
            thumbnail_url: String::new(),
            view_count: 0,
            game: String::new(),
        }
    }

    #[tokio::test]
    async fn missing_index_is_unrepairable_and_leaves_parts_alone() {
        let dir = tempfile::tempdir().unwrap();
        let parts = parts_dir(dir.path());
        fs::create_dir_all(&parts).await.unwrap();
        let part = parts.join(segment_file_name(3));
        fs::write(&part, b"data").await.unwrap();

        let mut repairer = Repairer::new(
            ApiClient::new(reqwest::Client::new()),
            None,
            dir.path(),
            1,
            BTreeSet::new(),
        );
        let err = repairer
            .refetch(&mut vod(), &BTreeSet::from([3]))
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Unrepairable { ids } if ids.contains(&3)));

        // the part stays in place under its original name
        assert!(fs::try_exists(&part).await.unwrap());
        assert!(!fs::try_exists(corrupt_path(&part)).await.unwrap());
    }

    #[test]
    fn corrupt_suffix_appends_to_file_name() {
        let path = Path::new("/out/parts/00042.ts");
        assert_eq!(corrupt_path(path), Path::new("/out/parts/00042.ts.corrupt"));
    }

    #[tokio::test]
    async fn identical_refetch_means_upstream_and_joins_muted_set() {
        let dir = tempfile::tempdir().unwrap();
        let part = dir.path().join("00007.ts");
        let aside = dir.path().join("00007.ts.corrupt");
        fs::write(&part, b"same bytes either side").await.unwrap();
        fs::write(&aside, b"same bytes either side").await.unwrap();

        let outcome = refetch_outcome(
            &file_sha256(&part).await.unwrap(),
            &file_sha256(&aside).await.unwrap(),
        );
        assert_eq!(outcome, RefetchOutcome::Upstream);

        let mut muted: BTreeSet<u64> = BTreeSet::new();
        if outcome == RefetchOutcome::Upstream {
            muted.insert(7);
        }
        assert!(muted.contains(&7));
    }

    #[tokio::test]
    async fn differing_refetch_means_local_damage() {
        let dir = tempfile::tempdir().unwrap();
        let part = dir.path().join("00007.ts");
        let aside = dir.path().join("00007.ts.corrupt");
        fs::write(&part, b"fresh payload").await.unwrap();
        fs::write(&aside, b"damaged payload").await.unwrap();

        assert_eq!(
            refetch_outcome(
                &file_sha256(&part).await.unwrap(),
                &file_sha256(&aside).await.unwrap(),
            ),
            RefetchOutcome::LocalRepaired
        );
    }

    #[tokio::test]
    async fn identical_files_hash_equal() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.ts");
        let b = dir.path().join("b.ts");
        fs::write(&a, b"payload").await.unwrap();
        fs::write(&b, b"payload").await.unwrap();
        assert_eq!(
            file_sha256(&a).await.unwrap(),
            file_sha256(&b).await.unwrap()
        );

        fs::write(&b, b"other").await.unwrap();
        assert_ne!(
            file_sha256(&a).await.unwrap(),
            file_sha256(&b).await.unwrap()
        );
    }
}
