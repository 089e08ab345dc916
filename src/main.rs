use clap::Parser;
use photo_manifest::builder::{BuildOptions, Builder, Components};
use photo_manifest::cache::ForceFlags;
use photo_manifest::cluster::{self, WorkerParts};
use photo_manifest::config::{self, BuilderConfig, DispatchMode};
use photo_manifest::progress::ChannelListener;
use photo_manifest::{exif, logging, output};
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

fn version_string() -> &'static str {
    let hash = env!("GIT_HASH");
    if hash.is_empty() {
        env!("CARGO_PKG_VERSION")
    } else {
        // Leaked once at startup
        Box::leak(format!("{} ({hash})", env!("CARGO_PKG_VERSION")).into_boxed_str())
    }
}

#[derive(Parser)]
#[command(name = "photo-manifest")]
#[command(about = "Build an incremental photo manifest from a storage backend")]
#[command(long_about = "\
Build an incremental photo manifest from a storage backend

Lists the configured source, decides per photo whether anything changed since
the last manifest, and (re)computes thumbnails, EXIF, tone, embedded video and
location only where needed. Unchanged photos are copied forward untouched.

Force flags:
  --force              reprocess every photo
  --force-manifest     recompute metadata fields only, keep thumbnails
  --force-thumbnails   re-encode thumbnails only, keep metadata

Run 'photo-manifest --print-stock-config' for a documented builder.toml.")]
#[command(version = version_string())]
struct Cli {
    /// Reprocess every photo
    #[arg(long)]
    force: bool,

    /// Recompute metadata-derived fields for every photo
    #[arg(long)]
    force_manifest: bool,

    /// Re-encode every thumbnail
    #[arg(long)]
    force_thumbnails: bool,

    /// Print the resolved configuration and exit
    #[arg(long)]
    config: bool,

    /// Configuration file
    #[arg(long, default_value = "builder.toml")]
    config_file: PathBuf,

    /// Plain log lines instead of the live status line
    #[arg(long)]
    no_ui: bool,

    /// Print a stock builder.toml with every option documented
    #[arg(long)]
    print_stock_config: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Workers are selected by environment only; they never see the CLI.
    if let Some(index) = cluster::worker_index() {
        return worker_main(index);
    }

    let cli = Cli::parse();
    if cli.print_stock_config {
        print!("{}", config::stock_config_toml());
        return Ok(());
    }

    let config = config::load_config(&cli.config_file)?;
    logging::init(&config.logging.level, cli.verbose, None);
    if cli.config {
        print!("{}", config.to_display_toml()?);
        return Ok(());
    }

    let flags = ForceFlags {
        force: cli.force,
        force_manifest: cli.force_manifest,
        force_thumbnails: cli.force_thumbnails,
    };
    let dispatch = dispatch_description(&config);

    let (tx, rx) = std::sync::mpsc::channel();
    let live = !cli.no_ui && io::stderr().is_terminal();
    let printer = std::thread::spawn(move || output::run_printer(rx, live));

    let builder = Builder::from_config(config)?.with_listener(Arc::new(ChannelListener::new(tx)));
    install_signal_handler(builder.cancel_flag());
    output::print_startup(
        builder.storage().provider().name(),
        exclusion_count(builder.config()),
        builder.plugin_names(),
        &dispatch,
    );

    let result = builder.run(&BuildOptions { flags });
    // Dropping the builder closes the progress channel.
    drop(builder);
    let _ = printer.join();
    result?;
    Ok(())
}

fn worker_main(index: usize) -> Result<(), Box<dyn std::error::Error>> {
    let level = std::env::var(cluster::LOG_LEVEL_ENV).unwrap_or_else(|_| "info".into());
    logging::init(&level, false, Some(index));
    if let Err(e) = ctrlc::set_handler(|| {
        exif::terminate_all();
    }) {
        tracing::warn!(error = %e, "could not install interrupt handler");
    }
    let stdin = io::stdin();
    let stdout = io::stdout();
    cluster::run_worker(index, stdin.lock(), stdout.lock(), |config| {
        WorkerParts::build(config, Components::default())
    })?;
    Ok(())
}

/// First Ctrl-C stops dispatch at the next task boundary and kills running
/// ExifTool children; a second one exits immediately.
fn install_signal_handler(cancel: Arc<AtomicBool>) {
    let result = ctrlc::set_handler(move || {
        if cancel.swap(true, Ordering::SeqCst) {
            // exit() skips destructors; clean up what they would have.
            exif::terminate_all();
            exif::remove_scratch_files();
            std::process::exit(130);
        }
        let killed = exif::terminate_all();
        eprintln!("\nCancelling: waiting for in-flight photos ({killed} metadata processes stopped)");
    });
    if let Err(e) = result {
        tracing::warn!(error = %e, "could not install interrupt handler");
    }
}

fn dispatch_description(config: &BuilderConfig) -> String {
    match config.processing.mode {
        DispatchMode::WorkerPool => format!(
            "worker-pool, {} in flight",
            config::effective_concurrency(&config.processing)
        ),
        DispatchMode::Cluster => format!(
            "cluster, {} workers",
            config::effective_cluster_workers(&config.processing)
        ),
    }
}

fn exclusion_count(config: &BuilderConfig) -> usize {
    let exclude = &config.storage.exclude;
    exclude.prefixes.len() + exclude.patterns.len() + usize::from(exclude.hidden)
}
