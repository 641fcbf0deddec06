use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::choose::ArgsChooser;
use crate::config::{self, SyncConfig};
use crate::error::Result;
use crate::sync::Mode;

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Download the volumes of a work (all unless `--volume` is given).
    Download(DownloadArgs),
    /// Download a chapter range of one volume.
    Chapters(ChaptersArgs),
    /// Fetch new volumes and chapters of a work already in the catalog.
    Update(UpdateArgs),
    /// Fetch new volumes and chapters of every work in the catalog.
    UpdateAll,
}

#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// Directory that receives one sub-directory per work.
    #[arg(long, global = true, default_value = ".")]
    pub output: PathBuf,

    /// Catalog file recording what has been downloaded.
    #[arg(long, global = true, default_value = config::DEFAULT_CATALOG_FILE)]
    pub catalog: PathBuf,

    /// Mirror host, primary first. Repeatable. Falls back to `HAKO2EPUB_HOSTS`
    /// (comma separated), then to the built-in list.
    #[arg(long = "host", global = true, value_name = "HOST")]
    pub hosts: Vec<String>,

    /// Chapters fetched in parallel.
    #[arg(long, global = true, default_value_t = config::DEFAULT_WORKERS)]
    pub workers: usize,

    /// Attempts per host before failing over to the next one.
    #[arg(long, global = true, default_value_t = config::DEFAULT_MAX_ATTEMPTS)]
    pub attempts: u32,

    /// Pause between attempts against the same host.
    #[arg(long, global = true, default_value_t = config::DEFAULT_RETRY_COOLDOWN_SECS)]
    pub retry_cooldown_secs: u64,

    /// Per-request timeout.
    #[arg(long, global = true, default_value_t = config::DEFAULT_REQUEST_TIMEOUT_SECS)]
    pub timeout_secs: u64,

    /// Language tag written into the EPUB metadata.
    #[arg(long, global = true, default_value = "vi")]
    pub lang: String,
}

impl GlobalArgs {
    pub fn sync_config(&self) -> Result<SyncConfig> {
        let mut cfg = SyncConfig {
            output_dir: self.output.clone(),
            catalog_path: self.catalog.clone(),
            workers: self.workers.max(1),
            max_attempts: self.attempts.max(1),
            retry_cooldown: Duration::from_secs(self.retry_cooldown_secs),
            request_timeout: Duration::from_secs(self.timeout_secs.max(1)),
            lang: self.lang.clone(),
            ..SyncConfig::default()
        };
        let hosts = if self.hosts.is_empty() {
            config::hosts_from_env()
        } else {
            Some(self.hosts.clone())
        };
        if let Some(hosts) = hosts {
            cfg = cfg.with_hosts(&hosts)?;
        }
        Ok(cfg)
    }
}

#[derive(Debug, Args)]
pub struct DownloadArgs {
    /// Work page URL.
    pub url: String,

    /// Only these volumes (exact names). Repeatable.
    #[arg(long = "volume", value_name = "NAME")]
    pub volumes: Vec<String>,
}

#[derive(Debug, Args)]
pub struct ChaptersArgs {
    /// Work page URL.
    pub url: String,

    /// Volume to take the chapters from.
    #[arg(long)]
    pub volume: String,

    /// First chapter (default: the first one).
    #[arg(long)]
    pub from: Option<String>,

    /// Last chapter (default: the last one).
    #[arg(long)]
    pub to: Option<String>,
}

#[derive(Debug, Args)]
pub struct UpdateArgs {
    /// Work page URL as recorded in the catalog.
    pub url: String,

    /// Only these volumes (exact names). Repeatable.
    #[arg(long = "volume", value_name = "NAME")]
    pub volumes: Vec<String>,
}

impl Command {
    /// The run mode and the selection it carries.
    pub fn into_mode(self) -> (Mode, ArgsChooser) {
        match self {
            Self::Download(args) => (
                Mode::Download { url: args.url },
                ArgsChooser {
                    volumes: args.volumes,
                    ..ArgsChooser::default()
                },
            ),
            Self::Chapters(args) => (
                Mode::Chapters { url: args.url },
                ArgsChooser {
                    volumes: vec![args.volume],
                    from: args.from,
                    to: args.to,
                },
            ),
            Self::Update(args) => (
                Mode::Update { url: args.url },
                ArgsChooser {
                    volumes: args.volumes,
                    ..ArgsChooser::default()
                },
            ),
            Self::UpdateAll => (Mode::UpdateAll, ArgsChooser::default()),
        }
    }
}
