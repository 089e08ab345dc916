//! Multi-process dispatch.
//!
//! In cluster mode the builder starts `N` copies of its own executable with
//! [`WORKER_ENV`] set to the worker index. Each child speaks JSON lines on
//! stdin/stdout; stderr is inherited so worker logs interleave with the
//! parent's.
//!
//! ```text
//! parent → worker   {"type":"init","config":{...},"flags":{...}}
//! worker → parent   {"type":"ready"}
//! parent → worker   {"type":"task","id":3,"task":{...},"decision":{...}}
//! worker → parent   {"type":"result","id":3,"outcome":{...}}
//! parent → worker   {"type":"shutdown"}
//! worker → parent   {"type":"fatal","message":"..."}      on a plugin error
//! ```
//!
//! One parent thread per child pulls task indices from a shared queue and
//! keeps exactly one task in flight on its child, so a slow photo never
//! holds up the others. Workers rebuild storage, plugins and the pipeline
//! from the config they receive; nothing else is shared. Plugins passed to
//! the parent in code are not available inside workers.

use crate::builder::{Components, default_extractor};
use crate::cache::{Decision, ForceFlags};
use crate::config::BuilderConfig;
use crate::exif::MetadataExtractor;
use crate::imaging::{ImageBackend, RustBackend};
use crate::plugins::{HookContext, PluginHost, RunScope};
use crate::process::{self, Pipeline, PipelineSettings, TaskOutcome};
use crate::storage::{ExclusionFilter, ProviderRegistry, StorageManager};
use crate::types::BuildTask;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Set to the worker index in child processes.
pub const WORKER_ENV: &str = "PHOTO_MANIFEST_WORKER";

/// `[logging] level` handed to workers, which log before they get the config.
pub const LOG_LEVEL_ENV: &str = "PHOTO_MANIFEST_LOG_LEVEL";

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("failed to start worker {index}: {source}")]
    Spawn {
        index: usize,
        #[source]
        source: io::Error,
    },
    #[error("worker {index} sent an invalid message: {message}")]
    Protocol { index: usize, message: String },
    #[error("worker {index} failed: {message}")]
    Worker { index: usize, message: String },
    #[error("worker {index} exited unexpectedly")]
    Exited { index: usize },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Messages to a worker.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ToWorker {
    Init {
        config: Box<BuilderConfig>,
        flags: ForceFlags,
    },
    Task {
        id: usize,
        task: Box<BuildTask>,
        decision: Decision,
    },
    Shutdown,
}

/// Messages from a worker.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum FromWorker {
    Ready,
    Result { id: usize, outcome: TaskOutcome },
    Fatal { message: String },
}

/// Worker index from [`WORKER_ENV`], if this process is a worker.
pub fn worker_index() -> Option<usize> {
    std::env::var(WORKER_ENV).ok()?.trim().parse().ok()
}

fn send<W: Write, T: Serialize>(out: &mut W, message: &T) -> Result<(), ClusterError> {
    serde_json::to_writer(&mut *out, message)?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

/// Read one message; `None` at end of input.
fn receive<R: BufRead, T: for<'de> Deserialize<'de>>(input: &mut R) -> Result<Option<T>, ClusterError> {
    let mut line = String::new();
    loop {
        line.clear();
        if input.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        if !line.trim().is_empty() {
            return Ok(Some(serde_json::from_str(line.trim())?));
        }
    }
}

// ============================================================================
// Parent side
// ============================================================================

/// How to run a cluster.
#[derive(Debug)]
pub struct ClusterPlan<'a> {
    pub program: &'a Path,
    pub workers: usize,
    pub config: &'a BuilderConfig,
    pub flags: ForceFlags,
    pub cancel: &'a AtomicBool,
}

struct WorkerProcess {
    index: usize,
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl WorkerProcess {
    fn spawn(plan: &ClusterPlan<'_>, index: usize) -> Result<Self, ClusterError> {
        let mut child = Command::new(plan.program)
            .env(WORKER_ENV, index.to_string())
            .env(LOG_LEVEL_ENV, &plan.config.logging.level)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| ClusterError::Spawn { index, source })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            return Err(ClusterError::Exited { index });
        };
        let mut worker = Self {
            index,
            child,
            stdin,
            stdout: BufReader::new(stdout),
        };
        send(
            &mut worker.stdin,
            &ToWorker::Init {
                config: Box::new(plan.config.clone()),
                flags: plan.flags,
            },
        )?;
        match worker.receive()? {
            FromWorker::Ready => Ok(worker),
            other => Err(worker.unexpected(other)),
        }
    }

    fn receive(&mut self) -> Result<FromWorker, ClusterError> {
        receive(&mut self.stdout)?.ok_or(ClusterError::Exited { index: self.index })
    }

    fn unexpected(&self, message: FromWorker) -> ClusterError {
        match message {
            FromWorker::Fatal { message } => ClusterError::Worker {
                index: self.index,
                message,
            },
            other => ClusterError::Protocol {
                index: self.index,
                message: format!("{other:?}"),
            },
        }
    }

    fn run_task(
        &mut self,
        id: usize,
        task: &BuildTask,
        decision: Decision,
    ) -> Result<TaskOutcome, ClusterError> {
        send(
            &mut self.stdin,
            &ToWorker::Task {
                id,
                task: Box::new(task.clone()),
                decision,
            },
        )?;
        match self.receive()? {
            FromWorker::Result { id: got, outcome } if got == id => Ok(outcome),
            other => Err(self.unexpected(other)),
        }
    }

    fn shutdown(mut self) {
        let _ = send(&mut self.stdin, &ToWorker::Shutdown);
        drop(self.stdin);
        match self.child.wait() {
            Ok(status) if !status.success() => {
                tracing::warn!(worker = self.index, %status, "worker exited with failure");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(worker = self.index, error = %e, "could not reap worker"),
        }
    }

    fn kill(mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Run `tasks` on worker processes. `on_outcome` is called from the
/// parent's per-worker threads as results arrive. Results come back in
/// completion order.
pub fn dispatch<F>(
    plan: &ClusterPlan<'_>,
    tasks: &[BuildTask],
    decisions: &[Decision],
    on_outcome: F,
) -> Result<Vec<TaskOutcome>, ClusterError>
where
    F: Fn(&TaskOutcome) + Sync,
{
    if tasks.is_empty() {
        return Ok(Vec::new());
    }
    let workers = plan.workers.clamp(1, tasks.len());
    tracing::info!(workers, tasks = tasks.len(), "dispatching to cluster");

    let queue: Mutex<VecDeque<usize>> = Mutex::new((0..tasks.len()).collect());
    let results: Mutex<Vec<TaskOutcome>> = Mutex::new(Vec::with_capacity(tasks.len()));
    let abort = AtomicBool::new(false);
    let next = || -> Option<usize> {
        if abort.load(Ordering::SeqCst) || plan.cancel.load(Ordering::SeqCst) {
            return None;
        }
        queue.lock().ok()?.pop_front()
    };

    let drive = |index: usize| -> Result<(), ClusterError> {
        let mut worker = WorkerProcess::spawn(plan, index)?;
        while let Some(id) = next() {
            match worker.run_task(id, &tasks[id], decisions[id]) {
                Ok(outcome) => {
                    on_outcome(&outcome);
                    if let Ok(mut results) = results.lock() {
                        results.push(outcome);
                    }
                }
                Err(e) => {
                    worker.kill();
                    return Err(e);
                }
            }
        }
        worker.shutdown();
        Ok(())
    };

    let errors: Vec<ClusterError> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .map(|index| {
                let drive = &drive;
                let abort = &abort;
                scope.spawn(move || {
                    let result = drive(index);
                    if result.is_err() {
                        abort.store(true, Ordering::SeqCst);
                    }
                    result
                })
            })
            .collect();
        handles
            .into_iter()
            .filter_map(|h| match h.join() {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e),
                Err(_) => Some(ClusterError::Io(io::Error::other("dispatch thread panicked"))),
            })
            .collect()
    });
    if let Some(err) = errors.into_iter().next() {
        return Err(err);
    }
    Ok(results.into_inner().unwrap_or_else(|p| p.into_inner()))
}

// ============================================================================
// Worker side
// ============================================================================

/// What a worker needs to run tasks.
pub struct WorkerParts {
    pub storage: StorageManager,
    pub backend: Arc<dyn ImageBackend>,
    pub extractor: Arc<dyn MetadataExtractor>,
    pub plugins: PluginHost,
}

impl WorkerParts {
    /// Rebuild everything from config, optionally with injected pieces.
    pub fn build(config: &BuilderConfig, components: Components) -> Result<Self, String> {
        let mut registry = ProviderRegistry::default();
        let plugins =
            PluginHost::load(config, &mut registry, components.plugins).map_err(|e| e.to_string())?;
        let storage = match components.provider {
            Some(provider) => StorageManager::new(provider)
                .with_filters(ExclusionFilter::from_config(&config.storage.exclude)),
            None => StorageManager::from_config(&config.storage, &registry)
                .map_err(|e| e.to_string())?,
        };
        Ok(Self {
            storage,
            backend: components
                .backend
                .unwrap_or_else(|| Arc::new(RustBackend::new())),
            extractor: components
                .extractor
                .unwrap_or_else(|| Arc::new(default_extractor(config))),
            plugins,
        })
    }
}

/// Serve tasks until shutdown or end of input.
///
/// `make_parts` turns the received config into the worker's collaborators;
/// the binary passes [`WorkerParts::build`] with default components.
pub fn run_worker<R, W, F>(
    index: usize,
    mut input: R,
    mut output: W,
    make_parts: F,
) -> Result<(), ClusterError>
where
    R: BufRead,
    W: Write,
    F: FnOnce(&BuilderConfig) -> Result<WorkerParts, String>,
{
    let span = tracing::info_span!("worker", worker = index);
    let _enter = span.enter();

    let (config, flags) = match receive::<_, ToWorker>(&mut input)? {
        Some(ToWorker::Init { config, flags }) => (*config, flags),
        Some(ToWorker::Shutdown) | None => return Ok(()),
        Some(other) => {
            let message = format!("expected init, got {other:?}");
            send(&mut output, &FromWorker::Fatal { message: message.clone() })?;
            return Err(ClusterError::Protocol { index, message });
        }
    };
    let parts = match make_parts(&config) {
        Ok(parts) => parts,
        Err(message) => {
            send(&mut output, &FromWorker::Fatal { message: message.clone() })?;
            return Err(ClusterError::Worker { index, message });
        }
    };
    let settings = PipelineSettings::from_config(&config);
    let pipeline = Pipeline {
        storage: &parts.storage,
        backend: parts.backend.as_ref(),
        extractor: parts.extractor.as_ref(),
        settings: &settings,
    };
    let run = RunScope::new();
    let ctx = HookContext {
        config: &config,
        storage: &parts.storage,
        run: &run,
    };
    send(&mut output, &FromWorker::Ready)?;
    tracing::debug!("worker ready");

    let mut served = 0usize;
    while let Some(message) = receive::<_, ToWorker>(&mut input)? {
        match message {
            ToWorker::Task { id, task, decision } => {
                match process::run_task(&pipeline, &parts.plugins, &ctx, &task, decision, &flags) {
                    Ok(outcome) => send(&mut output, &FromWorker::Result { id, outcome })?,
                    Err(e) => {
                        let message = e.to_string();
                        send(&mut output, &FromWorker::Fatal { message: message.clone() })?;
                        return Err(ClusterError::Worker { index, message });
                    }
                }
                served += 1;
            }
            ToWorker::Shutdown => break,
            ToWorker::Init { .. } => {
                let message = "init received twice".to_string();
                send(&mut output, &FromWorker::Fatal { message: message.clone() })?;
                return Err(ClusterError::Protocol { index, message });
            }
        }
    }
    tracing::debug!(served, "worker done");
    Ok(())
}
