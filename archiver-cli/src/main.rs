mod args;
mod run;

use std::path::Path;

use clap::Parser;
use mimalloc::MiMalloc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::args::Args;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(&args)?;

    run::run(args).await
}

fn init_logging(args: &Args) -> anyhow::Result<Option<WorkerGuard>> {
    let default_filter = if args.debug {
        "twitch_archiver=debug,archiver_engine=debug,archiver_ledger=debug,twitch_api=debug,sqlx=warn"
    } else {
        "info,sqlx=warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    match &args.log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
            let file_name = path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("log file path has no file name"))?;
            let appender =
                tracing_appender::rolling::never(dir.unwrap_or(Path::new(".")), file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Ok(Some(guard))
        }
        None => {
            registry.init();
            Ok(None)
        }
    }
}
