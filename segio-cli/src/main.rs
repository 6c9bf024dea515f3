use std::collections::HashMap;
use std::path::PathBuf;
use std::process;

use clap::Parser;
use futures::StreamExt;
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use segio::{DownloadEngine, DownloadOptions, DownloadStatus, EngineConfig};
use tracing::error;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

/// Segmented HTTP media downloader: HLS playlists and ranged MP4/MKV files.
#[derive(Debug, Parser)]
#[command(name = "segio", version, about)]
struct Args {
    /// URL of an M3U8 playlist or an MP4/MKV file.
    url: String,

    /// Output file path.
    #[arg(short, long)]
    output: PathBuf,

    /// Maximum number of segments downloaded concurrently.
    #[arg(short = 'c', long, default_value_t = segio::DEFAULT_SEGMENT_CONCURRENCY)]
    concurrency: usize,

    /// Extra request header as `Name: value`. May be repeated.
    #[arg(short = 'H', long = "header", value_name = "HEADER")]
    headers: Vec<String>,
}

fn parse_headers(raw: &[String]) -> Result<HashMap<String, String>, String> {
    raw.iter()
        .map(|header| {
            header
                .split_once(':')
                .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
                .ok_or_else(|| format!("invalid header `{header}`, expected `Name: value`"))
        })
        .collect()
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    if let Err(code) = run(Args::parse()).await {
        process::exit(code);
    }
}

async fn run(args: Args) -> Result<(), i32> {
    let headers = parse_headers(&args.headers).map_err(|e| {
        error!("{e}");
        2
    })?;
    let engine = DownloadEngine::new(EngineConfig::default()).map_err(|e| {
        error!("failed to build HTTP client: {e}");
        1
    })?;
    engine.init().await;

    let options = DownloadOptions {
        headers,
        max_concurrent_segments: args.concurrency.max(1),
    };
    let id = engine.download(&args.url, args.output.clone(), options).await;

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner} [{bar:30}] {bytes}/{total_bytes} ({msg}) {elapsed}",
        )
        .unwrap()
        .progress_chars("=> "),
    );

    let mut flow = Box::pin(engine.get_progress_flow(&id));
    let final_status = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                bar.set_message("cancelling");
                engine.cancel(&id).await;
            }
            item = flow.next() => {
                let Some(progress) = item else {
                    break DownloadStatus::Failed;
                };
                bar.set_length(progress.total_bytes.max(progress.downloaded_bytes));
                bar.set_position(progress.downloaded_bytes);
                bar.set_message(format!(
                    "{:?}, {}/{} segments",
                    progress.status, progress.downloaded_segments, progress.total_segments
                ));
                if progress.status.is_terminal() {
                    if let Some(err) = &progress.error {
                        error!(
                            code = ?err.code,
                            detail = err.technical_message.as_deref().unwrap_or("-"),
                            "download failed"
                        );
                    }
                    break progress.status;
                }
            }
        }
    };
    engine.join_download(&id).await;
    bar.finish_and_clear();

    match final_status {
        DownloadStatus::Completed => {
            let state = engine.get_state(&id).await;
            let bytes = state.map(|s| s.downloaded_bytes).unwrap_or(0);
            println!(
                "downloaded {} to {}",
                HumanBytes(bytes),
                args.output.display()
            );
            Ok(())
        }
        DownloadStatus::Canceled => Err(130),
        _ => Err(1),
    }
}
