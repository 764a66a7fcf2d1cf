//! Host binary: argument parsing, logging, signal handling and producer
//! wiring around the download engine.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use clap::{ArgGroup, Parser};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

use downpour_engine::{
    DownloadManager, FfmpegRemuxer, HttpConfig, Job, JobSender, ManagerConfig, PacerConfig,
    RateLimit, RemuxRetryPolicy,
};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const DEFAULT_LOG_FILTER: &str = "downpour=info,downpour_engine=info";
const DEBUG_LOG_FILTER: &str = "downpour=debug,downpour_engine=debug";

#[derive(Parser, Debug)]
#[command(
    name = "downpour",
    version,
    about = "Concurrent media downloader with shared rate and cadence governance"
)]
#[command(group = ArgGroup::new("input").required(true).args(["url", "manifest"]))]
struct Args {
    /// Direct media URL to download.
    #[arg(short, long)]
    url: Option<String>,

    /// JSON manifest of jobs: an array of {url, name?, referer?,
    /// headers?, skip_existing?} objects.
    #[arg(short, long)]
    manifest: Option<PathBuf>,

    /// Directory downloads are written to.
    #[arg(short, long, default_value = "downloads")]
    output_dir: PathBuf,

    /// Maximum simultaneous downloads.
    #[arg(short = 'j', long, default_value_t = 5)]
    jobs: usize,

    /// Aggregate rate limit shared by all downloads, e.g. `500k` or
    /// `2M`; `0` disables the cap.
    #[arg(long, default_value = "0")]
    limit_rate: String,

    /// Retries per download on top of the first attempt.
    #[arg(long, default_value_t = 3)]
    retries: u32,

    /// Pause after this many requests; 0 disables the cadence guard.
    #[arg(long, default_value_t = 0)]
    pause_after: u32,

    /// Length of the cadence pause, in seconds.
    #[arg(long, default_value_t = 30)]
    pause_secs: u64,

    /// Download even when the output already exists in the target
    /// directory.
    #[arg(long)]
    no_skip_existing: bool,

    /// Replace existing files at the final path.
    #[arg(long)]
    overwrite: bool,

    /// Referer header sent with every request.
    #[arg(long)]
    referer: Option<String>,

    /// User agent override.
    #[arg(long)]
    user_agent: Option<String>,

    /// Path to the ffmpeg binary used for remuxing segment downloads.
    #[arg(long, default_value = "ffmpeg")]
    ffmpeg: PathBuf,

    /// Re-fetch from the network when a remux fails, instead of
    /// retrying only the remux step.
    #[arg(long)]
    remux_refetch: bool,

    /// Verbose logging.
    #[arg(short, long)]
    debug: bool,
}

/// One entry of the `--manifest` file: the boundary where an external
/// producer hands over fully-formed jobs.
#[derive(Debug, serde::Deserialize)]
struct ManifestEntry {
    url: String,
    /// Output name without extension; derived from the URL when absent.
    name: Option<String>,
    referer: Option<String>,
    #[serde(default)]
    headers: Vec<(String, String)>,
    skip_existing: Option<bool>,
}

fn init_logging(debug: bool) {
    let default = if debug {
        DEBUG_LOG_FILTER
    } else {
        DEFAULT_LOG_FILTER
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.debug);

    match run(args).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            error!("startup failed: {err:#}");
            std::process::exit(2);
        }
    }
}

async fn run(args: Args) -> anyhow::Result<i32> {
    let rate_limit: RateLimit = args
        .limit_rate
        .parse()
        .with_context(|| format!("invalid --limit-rate `{}`", args.limit_rate))?;

    let config = ManagerConfig {
        concurrency: args.jobs,
        retry_budget: args.retries,
        rate_limit,
        pacer: PacerConfig {
            threshold: args.pause_after,
            pause: Duration::from_secs(args.pause_secs),
        },
        skip_existing: !args.no_skip_existing,
        overwrite: args.overwrite,
        remux_retry: if args.remux_refetch {
            RemuxRetryPolicy::Refetch
        } else {
            RemuxRetryPolicy::RemuxOnly
        },
        output_dir: args.output_dir.clone(),
        ..ManagerConfig::default()
    };

    let mut http = HttpConfig::default();
    if let Some(user_agent) = &args.user_agent {
        http.user_agent = user_agent.clone();
    }
    let source = Arc::new(downpour_engine::HttpSource::new(&http)?);

    let remuxer = FfmpegRemuxer::new(&args.ffmpeg);
    match remuxer.version().await {
        Some(version) => info!(version = %version, "ffmpeg available"),
        None => warn!(
            binary = %args.ffmpeg.display(),
            "ffmpeg not found, segment downloads will fail to remux"
        ),
    }

    let (manager, sender) = DownloadManager::new(config, source, Arc::new(remuxer)).await?;

    let token = CancellationToken::new();
    {
        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, stopping");
                token.cancel();
            }
        });
    }

    let runner = tokio::spawn(manager.run(token));

    let producer_failed = match produce_jobs(&args, sender).await {
        Ok(submitted) => {
            info!(submitted, "all jobs submitted");
            false
        }
        Err(err) => {
            error!("producer failed: {err:#}");
            true
        }
    };

    let summary = runner.await.context("scheduler task panicked")?;
    info!(
        completed = summary.completed,
        skipped = summary.skipped,
        failed = summary.failed,
        "done"
    );
    if let Some(err) = &summary.fatal {
        error!(error = %err, "run aborted");
    }

    let mut code = summary.exit_code();
    if producer_failed && code == 0 {
        code = 1;
    }
    Ok(code)
}

/// Feed the queue from the CLI's inputs. The sender is dropped on the
/// way out, which closes the queue.
async fn produce_jobs(args: &Args, sender: JobSender) -> anyhow::Result<u64> {
    let mut submitted = 0;

    if let Some(raw) = &args.url {
        let url: Url = raw.parse().with_context(|| format!("invalid URL `{raw}`"))?;
        let stem = output_stem(&url);
        let mut job = Job::new(url, args.output_dir.join(stem));
        if let Some(referer) = &args.referer {
            job = job.referer(referer);
        }
        sender
            .submit(job)
            .await
            .map_err(|_| anyhow::anyhow!("the run stopped before the job was accepted"))?;
        submitted += 1;
        return Ok(submitted);
    }

    let path = args.manifest.as_ref().expect("clap enforces the input group");
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read manifest `{}`", path.display()))?;
    let entries: Vec<ManifestEntry> = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse manifest `{}`", path.display()))?;
    info!(jobs = entries.len(), "manifest loaded");

    for entry in entries {
        let url: Url = match entry.url.parse() {
            Ok(url) => url,
            Err(e) => {
                warn!(url = %entry.url, error = %e, "skipping invalid manifest URL");
                continue;
            }
        };
        let stem = entry.name.unwrap_or_else(|| output_stem(&url));
        let mut job = Job::new(url, args.output_dir.join(stem));
        if let Some(referer) = entry.referer.or_else(|| args.referer.clone()) {
            job = job.referer(referer);
        }
        for (name, value) in entry.headers {
            job = job.header(name, value);
        }
        if let Some(skip) = entry.skip_existing {
            job = job.skip_if_exists(skip);
        }
        if sender.submit(job).await.is_err() {
            // the run was cancelled or aborted under us
            break;
        }
        submitted += 1;
    }

    Ok(submitted)
}

/// Output name for a job that did not bring its own: the URL's last
/// path segment without its extension, or a timestamp.
fn output_stem(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| !segment.is_empty())
        .map(|segment| match segment.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem.to_owned(),
            _ => segment.to_owned(),
        })
        .unwrap_or_else(timestamp_stem)
}

fn timestamp_stem() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("download_{}", now.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        s.parse().unwrap()
    }

    #[test]
    fn output_stem_strips_the_extension() {
        assert_eq!(output_stem(&url("https://h.example/v/ep01.mp4")), "ep01");
        assert_eq!(output_stem(&url("https://h.example/v/ep01")), "ep01");
        assert_eq!(output_stem(&url("https://h.example/v/.hidden")), ".hidden");
    }

    #[test]
    fn output_stem_falls_back_to_a_timestamp() {
        assert!(output_stem(&url("https://h.example/")).starts_with("download_"));
    }

    #[test]
    fn manifest_entries_parse() {
        let raw = r#"[
            {"url": "https://h.example/v/ep01.mp4"},
            {
                "url": "https://h.example/v/ep02.m3u8",
                "name": "show-s01e02",
                "referer": "https://h.example/watch/2",
                "headers": [["X-Session", "abc"]],
                "skip_existing": false
            }
        ]"#;
        let entries: Vec<ManifestEntry> = serde_json::from_str(raw).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].name.as_deref(), Some("show-s01e02"));
        assert_eq!(entries[1].skip_existing, Some(false));
        assert!(entries[0].headers.is_empty());
    }

    #[test]
    fn args_parse_a_typical_invocation() {
        let args = Args::try_parse_from([
            "downpour",
            "--manifest",
            "jobs.json",
            "-o",
            "out",
            "-j",
            "3",
            "--limit-rate",
            "2M",
            "--pause-after",
            "40",
            "--pause-secs",
            "60",
        ])
        .unwrap();
        assert_eq!(args.jobs, 3);
        assert_eq!(args.pause_after, 40);
        assert!(!args.overwrite);
    }

    #[test]
    fn url_and_manifest_are_mutually_exclusive() {
        assert!(
            Args::try_parse_from([
                "downpour",
                "--url",
                "https://h.example/v.mp4",
                "--manifest",
                "jobs.json"
            ])
            .is_err()
        );
        // one of them is required
        assert!(Args::try_parse_from(["downpour"]).is_err());
    }
}
