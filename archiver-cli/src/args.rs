use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "twitch-archiver",
    version,
    about = "Archives Twitch broadcasts: video and chat, live or after the fact"
)]
pub struct Args {
    /// Channel logins to archive
    #[arg(short, long, value_delimiter = ',')]
    pub channels: Vec<String>,

    /// Individual VOD ids to archive
    #[arg(short = 'i', long = "vod-ids", value_delimiter = ',')]
    pub vod_ids: Vec<u64>,

    /// Root directory archives are written under
    #[arg(short, long, default_value = ".")]
    pub directory: PathBuf,

    /// Directory holding the ledger database and lock files
    /// (defaults to `.twitch-archiver` under the output directory)
    #[arg(long)]
    pub config_dir: Option<PathBuf>,

    /// Stream quality: best, worst, or a named quality such as 720p60
    #[arg(short, long, default_value = "best")]
    pub quality: String,

    /// Archive video (both formats when neither flag is given)
    #[arg(long)]
    pub video: bool,

    /// Archive chat (both formats when neither flag is given)
    #[arg(long)]
    pub chat: bool,

    /// Only capture broadcasts that are currently live
    #[arg(long, conflicts_with = "archive_only")]
    pub live_only: bool,

    /// Only archive finished broadcasts
    #[arg(long)]
    pub archive_only: bool,

    /// Concurrent segment downloads
    #[arg(short, long, default_value_t = 20)]
    pub threads: usize,

    /// Also write logs to this file
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Verbose logging
    #[arg(long)]
    pub debug: bool,
}

impl Args {
    pub fn want_video(&self) -> bool {
        self.video || !self.chat
    }

    pub fn want_chat(&self) -> bool {
        self.chat || !self.video
    }

    pub fn config_dir(&self) -> PathBuf {
        self.config_dir
            .clone()
            .unwrap_or_else(|| self.directory.join(".twitch-archiver"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_formats_by_default() {
        let args = Args::parse_from(["twitch-archiver", "-c", "somestreamer"]);
        assert!(args.want_video());
        assert!(args.want_chat());
    }

    #[test]
    fn explicit_format_excludes_the_other() {
        let args = Args::parse_from(["twitch-archiver", "-c", "somestreamer", "--chat"]);
        assert!(!args.want_video());
        assert!(args.want_chat());

        let args = Args::parse_from(["twitch-archiver", "-c", "somestreamer", "--video"]);
        assert!(args.want_video());
        assert!(!args.want_chat());
    }

    #[test]
    fn live_and_archive_only_conflict() {
        let parsed = Args::try_parse_from([
            "twitch-archiver",
            "-c",
            "somestreamer",
            "--live-only",
            "--archive-only",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn channel_list_splits_on_commas() {
        let args = Args::parse_from(["twitch-archiver", "-c", "one,two", "-i", "10,20"]);
        assert_eq!(args.channels, vec!["one", "two"]);
        assert_eq!(args.vod_ids, vec![10, 20]);
        assert_eq!(args.threads, 20);
    }
}
