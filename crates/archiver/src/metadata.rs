//! Sidecar metadata written next to the video: chapter files, the VOD
//! metadata dump and the thumbnail.

use std::path::Path;

use serde::Serialize;
use tokio::fs;
use tracing::{debug, warn};

use twitch_api::{ApiClient, Chapter, MutedRange, Vod};

use crate::error::Result;
use crate::paths::parts_dir;

#[derive(Serialize)]
struct ChapterExport<'a> {
    description: &'a str,
    position: f64,
    duration: f64,
}

#[derive(Serialize)]
struct VodExport<'a> {
    vod_id: u64,
    stream_id: Option<u64>,
    channel_id: u64,
    channel_login: &'a str,
    title: &'a str,
    description: &'a str,
    created_at: String,
    published_at: String,
    duration: u64,
    thumbnail_url: &'a str,
    view_count: u64,
    game: &'a str,
    muted_segments: &'a [MutedRange],
}

/// Writes `chapters.json` beside the video and an ffmetadata `chapters.txt`
/// into the parts directory for the converter to embed.
pub async fn write_chapter_files(output_dir: &Path, chapters: &[Chapter]) -> Result<()> {
    if chapters.is_empty() {
        return Ok(());
    }

    let export: Vec<ChapterExport<'_>> = chapters
        .iter()
        .map(|c| ChapterExport {
            description: &c.description,
            position: c.position_secs,
            duration: c.duration_secs,
        })
        .collect();
    fs::write(
        output_dir.join("chapters.json"),
        serde_json::to_vec_pretty(&export)?,
    )
    .await?;

    fs::create_dir_all(parts_dir(output_dir)).await?;
    fs::write(
        parts_dir(output_dir).join("chapters.txt"),
        ffmetadata_chapters(chapters),
    )
    .await?;
    debug!(count = chapters.len(), "chapter files written");
    Ok(())
}

/// Chapters in ffmetadata form, millisecond timebase.
fn ffmetadata_chapters(chapters: &[Chapter]) -> String {
    let mut out = String::from(";FFMETADATA1\n");
    for chapter in chapters {
        let start = (chapter.position_secs * 1000.0) as u64;
        let end = ((chapter.position_secs + chapter.duration_secs) * 1000.0) as u64;
        out.push_str(&format!(
            "[CHAPTER]\nTIMEBASE=1/1000\nSTART={start}\nEND={end}\ntitle={}\n\n",
            chapter.description
        ));
    }
    out
}

/// Dumps the VOD's metadata to `vod.json`.
pub async fn write_vod_json(output_dir: &Path, vod: &Vod, muted: &[MutedRange]) -> Result<()> {
    let export = VodExport {
        vod_id: vod.vod_id,
        stream_id: vod.stream_id,
        channel_id: vod.channel_id,
        channel_login: &vod.channel_login,
        title: &vod.title,
        description: &vod.description,
        created_at: vod.created_at.to_rfc3339(),
        published_at: vod.published_at.to_rfc3339(),
        duration: vod.duration,
        thumbnail_url: &vod.thumbnail_url,
        view_count: vod.view_count,
        game: &vod.game,
        muted_segments: muted,
    };
    fs::write(
        output_dir.join("vod.json"),
        serde_json::to_vec_pretty(&export)?,
    )
    .await?;
    Ok(())
}

/// Downloads the VOD thumbnail at full size. Best-effort; a VOD still being
/// processed has no thumbnail yet.
pub async fn download_thumbnail(api: &ApiClient, vod: &Vod, output_dir: &Path) -> Result<()> {
    if vod.thumbnail_url.is_empty() || vod.thumbnail_url.contains("404_processing") {
        return Ok(());
    }
    let url = vod.thumbnail_url.replace("90x60", "1920x1080");
    match api.get_bytes(&url).await {
        Ok(bytes) => {
            fs::write(output_dir.join("thumbnail.jpg"), &bytes).await?;
            debug!(vod_id = vod.vod_id, "thumbnail saved");
        }
        Err(e) => warn!(vod_id = vod.vod_id, error = %e, "thumbnail download failed"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ffmetadata_renders_millisecond_chapters() {
        let chapters = vec![
            Chapter {
                description: "Just Chatting".into(),
                position_secs: 0.0,
                duration_secs: 125.5,
            },
            Chapter {
                description: "Deep Rock Galactic".into(),
                position_secs: 125.5,
                duration_secs: 60.0,
            },
        ];
        let text = ffmetadata_chapters(&chapters);
        assert!(text.starts_with(";FFMETADATA1\n"));
        assert!(text.contains("[CHAPTER]\nTIMEBASE=1/1000\nSTART=0\nEND=125500\ntitle=Just Chatting\n"));
        assert!(text.contains("START=125500\nEND=185500\ntitle=Deep Rock Galactic\n"));
    }
}
