//! Run orchestration.
//!
//! One [`Builder::run`] walks this state machine:
//!
//! ```text
//! Idle → ListingFiles → ResolvingLivePhotoPairs → PreparingTasks
//!      → Dispatching(worker-pool | cluster) → Aggregating → SavingManifest → Done
//!                                                   any state → Failed
//! ```
//!
//! ## Steps
//!
//! 1. **Previous manifest**: loaded once into a map by storage key.
//! 2. **Listing**: the storage manager lists every file once, exclusions
//!    already applied. Images and live-photo videos are both derived from
//!    this one listing.
//! 3. **Tasks**: every image becomes a [`BuildTask`] and goes through the
//!    cache engine. Skipped entries are copied into the new manifest as is;
//!    the rest are dispatched.
//! 4. **Dispatch**: a bounded rayon pool in this process, or worker
//!    processes fed from a shared queue (see [`crate::cluster`]). No order is
//!    kept between tasks. Cancellation is checked before each task starts.
//! 5. **Aggregate**: failed tasks are left out of the manifest; previous
//!    entries whose key is no longer listed are counted as deleted.
//! 6. **Save**: items are sorted by capture date, cameras and lenses are
//!    derived, and the file is replaced atomically. Thumbnails no saved
//!    item refers to are removed afterwards, never before.
//!
//! Any error from steps 1-6 moves the run to `Failed`, fires the `OnError`
//! hook and the listener's `on_error`, and is returned. A cancelled run never
//! writes the manifest.

use crate::cache::{self, BuildStats, Decision, ForceFlags};
use crate::cluster::{self, ClusterError};
use crate::config::{self, BuilderConfig, ConfigError, DispatchMode};
use crate::exif::{ExifTool, MetadataExtractor};
use crate::imaging::{ImageBackend, RustBackend};
use crate::manifest::{self, ManifestError};
use crate::naming;
use crate::plugins::{HookContext, HookEvent, Plugin, PluginError, PluginHost, RunScope};
use crate::process::{self, Pipeline, PipelineSettings, TaskOutcome};
use crate::progress::{NoopListener, ProgressListener, Tracker};
use crate::storage::{ExclusionFilter, ProviderRegistry, StorageError, StorageManager, StorageProvider};
use crate::types::{BuildTask, ManifestItem};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),
    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Thread pool error: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error("build cancelled")]
    Cancelled,
}

/// Per-run options from the command line.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub flags: ForceFlags,
}

/// A task that failed and was left out of the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskFailure {
    pub key: String,
    pub error: String,
}

/// What a finished run reports.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSummary {
    pub stats: BuildStats,
    /// Images in the listing.
    pub total: usize,
    /// Entries in the saved manifest.
    pub item_count: usize,
    pub deleted_keys: Vec<String>,
    pub failures: Vec<TaskFailure>,
    pub elapsed_ms: u64,
    pub manifest_path: PathBuf,
}

impl BuildSummary {
    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    ListingFiles,
    ResolvingLivePhotoPairs,
    PreparingTasks,
    Dispatching(DispatchMode),
    Aggregating,
    SavingManifest,
    Done,
    Failed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dispatching(DispatchMode::WorkerPool) => f.write_str("dispatching (worker-pool)"),
            Self::Dispatching(DispatchMode::Cluster) => f.write_str("dispatching (cluster)"),
            other => fmt::Debug::fmt(other, f),
        }
    }
}

/// Collaborators that replace the ones built from config.
#[derive(Default)]
pub struct Components {
    pub provider: Option<Arc<dyn StorageProvider>>,
    pub backend: Option<Arc<dyn ImageBackend>>,
    pub extractor: Option<Arc<dyn MetadataExtractor>>,
    /// Appended after the configured plugins.
    pub plugins: Vec<Arc<dyn Plugin>>,
}

/// Drives one or more runs over the same configuration.
pub struct Builder {
    config: BuilderConfig,
    storage: StorageManager,
    backend: Arc<dyn ImageBackend>,
    extractor: Arc<dyn MetadataExtractor>,
    plugins: PluginHost,
    listener: Arc<dyn ProgressListener>,
    cancel: Arc<AtomicBool>,
    state: Mutex<State>,
    worker_program: Option<PathBuf>,
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("storage", &self.storage)
            .field("plugins", &self.plugins.names())
            .field("state", &self.state())
            .finish()
    }
}

/// ExifTool as configured under `[processing]`.
pub fn default_extractor(config: &BuilderConfig) -> ExifTool {
    ExifTool::new(
        &config.processing.exiftool_path,
        Duration::from_secs(config.processing.exiftool_timeout_secs),
    )
}

impl Builder {
    /// Everything from config: provider registry, plugins, ExifTool.
    pub fn from_config(config: BuilderConfig) -> Result<Self, BuildError> {
        Self::with_components(config, Components::default())
    }

    pub fn with_components(
        config: BuilderConfig,
        components: Components,
    ) -> Result<Self, BuildError> {
        config.validate()?;
        let mut registry = ProviderRegistry::default();
        let plugins = PluginHost::load(&config, &mut registry, components.plugins)?;
        let storage = match components.provider {
            Some(provider) => StorageManager::new(provider)
                .with_filters(ExclusionFilter::from_config(&config.storage.exclude)),
            None => StorageManager::from_config(&config.storage, &registry)?,
        };
        let backend = components
            .backend
            .unwrap_or_else(|| Arc::new(RustBackend::new()));
        let extractor = components
            .extractor
            .unwrap_or_else(|| Arc::new(default_extractor(&config)));
        tracing::debug!(
            provider = storage.provider().name(),
            plugins = ?plugins.names(),
            "builder ready"
        );
        Ok(Self {
            config,
            storage,
            backend,
            extractor,
            plugins,
            listener: Arc::new(NoopListener),
            cancel: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(State::Idle),
            worker_program: None,
        })
    }

    pub fn with_listener(mut self, listener: Arc<dyn ProgressListener>) -> Self {
        self.listener = listener;
        self
    }

    /// Share an externally owned cancel flag (e.g. set from a signal handler).
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Executable started for cluster workers. Defaults to the current one.
    pub fn with_worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = Some(program.into());
        self
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    pub fn storage(&self) -> &StorageManager {
        &self.storage
    }

    pub fn plugin_names(&self) -> &[String] {
        self.plugins.names()
    }

    pub fn state(&self) -> State {
        match self.state.lock() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn transition(&self, next: State) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        tracing::debug!(from = %*state, to = %next, "state");
        *state = next;
    }

    fn check_cancelled(&self) -> Result<(), BuildError> {
        if self.cancel.load(Ordering::SeqCst) {
            Err(BuildError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Run one build.
    pub fn run(&self, options: &BuildOptions) -> Result<BuildSummary, BuildError> {
        let run = RunScope::new();
        let ctx = HookContext {
            config: &self.config,
            storage: &self.storage,
            run: &run,
        };
        let span = tracing::info_span!("build", provider = self.storage.provider().name());
        let _enter = span.enter();
        self.transition(State::Idle);

        match self.execute(options, &ctx) {
            Ok(summary) => {
                self.transition(State::Done);
                self.listener.on_complete(&summary);
                Ok(summary)
            }
            Err(err) => {
                self.transition(State::Failed);
                tracing::error!(error = %err, "build failed");
                let message = err.to_string();
                if let Err(hook_err) = self
                    .plugins
                    .emit(&mut HookEvent::OnError { message: &message }, &ctx)
                {
                    tracing::warn!(error = %hook_err, "error hook failed");
                }
                self.listener.on_error(&err);
                Err(err)
            }
        }
    }

    fn execute(
        &self,
        options: &BuildOptions,
        ctx: &HookContext<'_>,
    ) -> Result<BuildSummary, BuildError> {
        let started = Instant::now();
        let flags = options.flags;
        self.plugins
            .emit(&mut HookEvent::BeforeBuild { options }, ctx)?;

        let manifest_path = self.config.output.manifest_path.clone();
        let mut previous = manifest::index_by_key(manifest::load(&manifest_path)?);
        tracing::info!(entries = previous.len(), "previous manifest loaded");

        self.transition(State::ListingFiles);
        let mut objects = self.storage.list_all_files()?;
        self.plugins
            .emit(&mut HookEvent::AfterListing { objects: &mut objects }, ctx)?;

        self.transition(State::ResolvingLivePhotoPairs);
        let pairs = if self.config.processing.enable_live_photo {
            self.storage.detect_live_photos(&objects)
        } else {
            Default::default()
        };
        tracing::debug!(pairs = pairs.len(), "live photo pairs");

        self.transition(State::PreparingTasks);
        let images: Vec<_> = objects
            .into_iter()
            .filter(|o| naming::is_image_key(&o.key))
            .collect();
        let total = images.len();
        let deleted: Vec<ManifestItem> = {
            let listed: HashSet<&str> = images.iter().map(|o| o.key.as_str()).collect();
            manifest::deleted(&previous, &listed)
                .into_iter()
                .cloned()
                .collect()
        };

        let mut stats = BuildStats::default();
        let mut kept: Vec<ManifestItem> = Vec::new();
        let mut tasks: Vec<BuildTask> = Vec::new();
        let mut decisions: Vec<Decision> = Vec::new();
        for object in images {
            let live_video = pairs.get(&object.key).cloned();
            let existing = previous.remove(&object.key);
            let task = BuildTask {
                object,
                existing,
                live_video,
            };
            let decision = cache::decide(&task, &flags);
            match (decision, task.existing) {
                (Decision::Skipped, Some(existing)) => {
                    tracing::debug!(key = %task.object.key, "unchanged, skipped");
                    stats.record(&decision);
                    kept.push(existing);
                }
                (decision, existing) => {
                    tasks.push(BuildTask { existing, ..task });
                    decisions.push(decision);
                }
            }
        }
        tracing::info!(
            total,
            dispatch = tasks.len(),
            skipped = stats.skipped,
            deleted = deleted.len(),
            "tasks prepared"
        );
        self.plugins
            .emit(&mut HookEvent::BeforeDispatch { tasks: &tasks }, ctx)?;
        self.listener.on_start(tasks.len());
        self.check_cancelled()?;

        let mode = self.config.processing.mode;
        self.transition(State::Dispatching(mode));
        let tracker = Tracker::new(tasks.len(), stats);
        let outcomes = match mode {
            DispatchMode::WorkerPool => {
                self.dispatch_pool(&tasks, &decisions, &flags, ctx, &tracker)?
            }
            DispatchMode::Cluster => {
                self.dispatch_cluster(&tasks, &decisions, &flags, &tracker)?
            }
        };
        self.check_cancelled()?;

        self.transition(State::Aggregating);
        let mut stats = tracker.stats();
        stats.deleted = deleted.len() as u32;
        let mut items = kept;
        let mut failures = Vec::new();
        for outcome in outcomes {
            match outcome {
                TaskOutcome::Done { item, .. } => items.push(*item),
                TaskOutcome::Failed { key, error } => failures.push(TaskFailure { key, error }),
            }
        }
        failures.sort_by(|a, b| a.key.cmp(&b.key));
        self.plugins
            .emit(&mut HookEvent::AfterDispatch { stats: &stats }, ctx)?;

        self.transition(State::SavingManifest);
        let mut built = manifest::assemble(items);
        self.plugins.emit(
            &mut HookEvent::BeforeManifestSave {
                manifest: &mut built,
            },
            ctx,
        )?;
        manifest::save(&built, &manifest_path)?;
        self.plugins.emit(
            &mut HookEvent::AfterManifestSave {
                manifest: &built,
                path: &manifest_path,
            },
            ctx,
        )?;

        // Only a saved manifest may drop thumbnails the previous one names.
        let keep: HashSet<&str> = built.data.iter().map(|i| i.id.as_str()).collect();
        match manifest::remove_orphan_thumbnails(&self.config.output.thumbnail_dir, &keep) {
            Ok(0) => {}
            Ok(removed) => tracing::info!(removed, "orphan thumbnails removed"),
            Err(e) => tracing::warn!(error = %e, "could not clean thumbnail directory"),
        }

        let summary = BuildSummary {
            stats,
            total,
            item_count: built.data.len(),
            deleted_keys: deleted.into_iter().map(|i| i.s3_key).collect(),
            failures,
            elapsed_ms: started.elapsed().as_millis() as u64,
            manifest_path,
        };
        self.plugins
            .emit(&mut HookEvent::AfterBuild { summary: &summary }, ctx)?;
        tracing::info!(
            stats = %summary.stats,
            items = summary.item_count,
            elapsed_ms = summary.elapsed_ms,
            "build complete"
        );
        Ok(summary)
    }

    fn report(&self, tracker: &Tracker, outcome: &TaskOutcome) {
        let decision = match outcome {
            TaskOutcome::Done { decision, .. } => Some(decision),
            TaskOutcome::Failed { .. } => None,
        };
        let snapshot = tracker.finish(outcome.key(), decision);
        self.listener.on_progress(&snapshot);
    }

    fn dispatch_pool(
        &self,
        tasks: &[BuildTask],
        decisions: &[Decision],
        flags: &ForceFlags,
        ctx: &HookContext<'_>,
        tracker: &Tracker,
    ) -> Result<Vec<TaskOutcome>, BuildError> {
        if tasks.is_empty() {
            return Ok(Vec::new());
        }
        let threads = config::effective_concurrency(&self.config.processing).min(tasks.len());
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("photo-worker-{i}"))
            .build()?;
        let settings = PipelineSettings::from_config(&self.config);
        let pipeline = Pipeline {
            storage: &self.storage,
            backend: self.backend.as_ref(),
            extractor: self.extractor.as_ref(),
            settings: &settings,
        };
        tracing::info!(threads, tasks = tasks.len(), "dispatching to worker pool");

        pool.install(|| {
            tasks
                .par_iter()
                .zip(decisions.par_iter())
                .map(|(task, decision)| {
                    self.check_cancelled()?;
                    let outcome =
                        process::run_task(&pipeline, &self.plugins, ctx, task, *decision, flags)?;
                    self.report(tracker, &outcome);
                    Ok(outcome)
                })
                .collect::<Result<Vec<_>, BuildError>>()
        })
    }

    fn dispatch_cluster(
        &self,
        tasks: &[BuildTask],
        decisions: &[Decision],
        flags: &ForceFlags,
        tracker: &Tracker,
    ) -> Result<Vec<TaskOutcome>, BuildError> {
        let program = match &self.worker_program {
            Some(program) => program.clone(),
            None => std::env::current_exe()?,
        };
        let workers = config::effective_cluster_workers(&self.config.processing);
        let result = cluster::dispatch(
            &cluster::ClusterPlan {
                program: &program,
                workers,
                config: &self.config,
                flags: *flags,
                cancel: &self.cancel,
            },
            tasks,
            decisions,
            |outcome| self.report(tracker, outcome),
        );
        match result {
            // Workers get the interrupt too; their exit is part of cancelling.
            Err(_) if self.cancel.load(Ordering::SeqCst) => Err(BuildError::Cancelled),
            other => Ok(other?),
        }
    }
}
