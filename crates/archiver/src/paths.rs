//! Output directory layout and filesystem helpers.
//!
//! The parts directory is the source of truth for completed segments: a file
//! named `NNNNN.ts` exists if and only if that segment is done. Restarted or
//! concurrent capture units reconcile through the directory scan, never
//! through shared memory.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rand::RngExt;
use tokio::fs;

use crate::error::Result;

/// Directory name for a broadcast: `YYYY-MM-DD_HH-MM-SS - title - id`, with
/// `STREAM_ONLY` in place of the id for captures without a VOD.
pub fn output_dir_name(title: &str, created_at: DateTime<Utc>, vod_id: u64) -> String {
    let stamp = created_at.format("%Y-%m-%d_%H-%M-%S");
    let id = if vod_id != 0 {
        vod_id.to_string()
    } else {
        "STREAM_ONLY".to_string()
    };
    format!("{stamp} - {} - {id}", sanitize_file_name(title))
}

/// Replaces characters not allowed in file names on common filesystems.
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '|' | '<' | '>' | '"' | '?' | '*' => '_',
            c if (c as u32) < 0x20 => '_',
            c => c,
        })
        .collect()
}

/// Zero-padded on-disk name for a segment id.
pub fn segment_file_name(id: u64) -> String {
    format!("{id:05}.ts")
}

pub fn parts_dir(output_dir: &Path) -> PathBuf {
    output_dir.join("parts")
}

/// Staging directory for in-flight downloads, keyed per broadcast so
/// concurrent units never collide.
pub fn staging_dir(key: u64) -> PathBuf {
    std::env::temp_dir()
        .join("twitch-archiver")
        .join(key.to_string())
}

/// Segment ids already present in the parts directory.
pub async fn scan_completed_ids(output_dir: &Path) -> Result<Vec<u64>> {
    let dir = parts_dir(output_dir);
    let mut ids = Vec::new();
    let mut entries = match fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(stem) = name.strip_suffix(".ts")
            && let Ok(id) = stem.parse::<u64>()
        {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

/// Moves `src` to `dst`, falling back to copy + remove across filesystems.
/// The copy lands under a temporary name next to `dst` first, so the final
/// name only ever appears fully written.
pub async fn safe_move(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).await?;
    }

    match fs::rename(src, dst).await {
        Ok(()) => Ok(()),
        Err(_) => {
            let tmp_name: String = {
                let token: u64 = rand::rng().random();
                format!(".{token:016x}.tmp")
            };
            let tmp = dst.with_file_name(tmp_name);
            fs::copy(src, &tmp).await?;
            fs::rename(&tmp, dst).await?;
            fs::remove_file(src).await?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-06-01T12:30:05Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn output_dir_name_formats() {
        assert_eq!(
            output_dir_name("my: stream?", created(), 123),
            "2024-06-01_12-30-05 - my_ stream_ - 123"
        );
        assert_eq!(
            output_dir_name("t", created(), 0),
            "2024-06-01_12-30-05 - t - STREAM_ONLY"
        );
    }

    #[test]
    fn segment_names_are_zero_padded() {
        assert_eq!(segment_file_name(0), "00000.ts");
        assert_eq!(segment_file_name(9533), "09533.ts");
    }

    #[tokio::test]
    async fn scan_finds_only_segment_files() {
        let dir = tempfile::tempdir().unwrap();
        let parts = parts_dir(dir.path());
        fs::create_dir_all(&parts).await.unwrap();
        for name in ["00000.ts", "00002.ts", "00002.ts.corrupt", "chapters.txt"] {
            fs::write(parts.join(name), b"x").await.unwrap();
        }

        let ids = scan_completed_ids(dir.path()).await.unwrap();
        assert_eq!(ids, vec![0, 2]);

        let empty = tempfile::tempdir().unwrap();
        assert!(scan_completed_ids(empty.path()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn safe_move_replaces_destination() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.ts");
        let dst = dir.path().join("nested").join("dst.ts");
        fs::write(&src, b"new").await.unwrap();

        safe_move(&src, &dst).await.unwrap();
        assert!(!src.exists());
        assert_eq!(fs::read(&dst).await.unwrap(), b"new");
    }
}
