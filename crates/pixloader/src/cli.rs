//! Exposes the command line application.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use pixloader_service::caching;
use pixloader_service::config::Config;
use pixloader_service::loader::ImageLoader;
use pixloader_service::metrics;
use pixloader_service::types::{Request, TargetSize};

use crate::logging;

/// pixloader commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Load an image through the memory cache, the disk cache and the network.
    Load(LoadArgs),

    /// Clean the local disk cache.
    Cleanup {
        /// Only report what would be removed.
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Debug, Args)]
struct LoadArgs {
    /// URI of the image, `http(s)://` or `file://`.
    uri: String,

    /// Target width to scale the image towards, `0` is unbounded.
    #[arg(long, default_value_t = 0)]
    width: u32,

    /// Target height to scale the image towards, `0` is unbounded.
    #[arg(long, default_value_t = 0)]
    height: u32,

    /// Do not put the decoded image into the memory cache.
    #[arg(long)]
    no_memory_cache: bool,

    /// Neither read nor write the disk cache.
    #[arg(long)]
    no_disk_cache: bool,
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(name = "pixloader", version)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: We are still single-threaded here, the runtime is started further down.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        let hostname = config.metrics.hostname_tag.clone().and_then(|tag| {
            hostname::get()
                .ok()
                .and_then(|s| s.into_string().ok())
                .map(|name| (tag, name))
        });
        tags.extend(hostname);
        metrics::configure_statsd(&config.metrics.prefix, statsd, tags)
            .context("failed to configure statsd")?;
    }

    match cli.command {
        Command::Load(args) => load(config, args).context("failed to load image")?,
        Command::Cleanup { dry_run } => {
            caching::cleanup(config, dry_run).context("failed to clean up caches")?;
        }
    }

    Ok(())
}

fn load(config: Config, args: LoadArgs) -> Result<()> {
    let request = build_request(&config, &args);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    let loaded = runtime.block_on(async {
        let loader = ImageLoader::from_config(&config)?;
        anyhow::Ok(loader.load(&request).await?)
    })?;

    let bitmap = loaded.drawable.bitmap();
    println!(
        "{}: {}x{} ({} bytes) from {}",
        request.uri(),
        bitmap.width(),
        bitmap.height(),
        bitmap.byte_size(),
        loaded.from
    );
    Ok(())
}

fn build_request(config: &Config, args: &LoadArgs) -> Request {
    let mut options = config.default_options();
    options.cache.cache_in_memory &= !args.no_memory_cache;
    options.cache.cache_in_disk &= !args.no_disk_cache;

    Request::new(
        args.uri.clone(),
        TargetSize::new(args.width, args.height),
        options,
    )
}
