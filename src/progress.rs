//! Progress reporting for whatever presents a run.
//!
//! The builder calls a [`ProgressListener`] from worker threads. The
//! console front-end uses [`ChannelListener`], which forwards
//! [`ProgressEvent`]s to a printer thread, so rendering never blocks a
//! worker.

use crate::builder::{BuildError, BuildSummary};
use crate::cache::{BuildStats, Decision};
use serde::Serialize;
use std::sync::Mutex;
use std::sync::mpsc::Sender;

/// Counts after some number of finished tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub total: usize,
    pub completed: usize,
    pub new_count: u32,
    pub processed_count: u32,
    pub skipped_count: u32,
    pub failed_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_key: Option<String>,
}

impl ProgressSnapshot {
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.completed as f64 / self.total as f64
        }
    }
}

/// Receives run progress. Every method defaults to doing nothing.
pub trait ProgressListener: Send + Sync {
    fn on_start(&self, _total: usize) {}
    fn on_progress(&self, _snapshot: &ProgressSnapshot) {}
    fn on_complete(&self, _summary: &BuildSummary) {}
    fn on_error(&self, _error: &BuildError) {}
}

#[derive(Debug, Default)]
pub struct NoopListener;

impl ProgressListener for NoopListener {}

/// Owned form of the listener calls, for sending across threads.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Start { total: usize },
    Progress(ProgressSnapshot),
    Complete(BuildSummary),
    Error(String),
}

/// Forwards every call as a [`ProgressEvent`]. A closed receiver is ignored.
#[derive(Debug)]
pub struct ChannelListener {
    tx: Mutex<Sender<ProgressEvent>>,
}

impl ChannelListener {
    pub fn new(tx: Sender<ProgressEvent>) -> Self {
        Self { tx: Mutex::new(tx) }
    }

    fn send(&self, event: ProgressEvent) {
        if let Ok(tx) = self.tx.lock() {
            let _ = tx.send(event);
        }
    }
}

impl ProgressListener for ChannelListener {
    fn on_start(&self, total: usize) {
        self.send(ProgressEvent::Start { total });
    }

    fn on_progress(&self, snapshot: &ProgressSnapshot) {
        self.send(ProgressEvent::Progress(snapshot.clone()));
    }

    fn on_complete(&self, summary: &BuildSummary) {
        self.send(ProgressEvent::Complete(summary.clone()));
    }

    fn on_error(&self, error: &BuildError) {
        self.send(ProgressEvent::Error(error.to_string()));
    }
}

/// Running totals shared by the dispatch threads.
#[derive(Debug)]
pub struct Tracker {
    total: usize,
    state: Mutex<(usize, BuildStats)>,
}

impl Tracker {
    pub fn new(total: usize, initial: BuildStats) -> Self {
        Self {
            total,
            state: Mutex::new((0, initial)),
        }
    }

    /// Count one finished task. `None` records a failure.
    pub fn finish(&self, key: &str, decision: Option<&Decision>) -> ProgressSnapshot {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.0 += 1;
        match decision {
            Some(d) => state.1.record(d),
            None => state.1.fail(),
        }
        let (completed, stats) = &*state;
        ProgressSnapshot {
            total: self.total,
            completed: *completed,
            new_count: stats.new,
            processed_count: stats.processed,
            skipped_count: stats.skipped,
            failed_count: stats.failed,
            current_key: Some(key.to_string()),
        }
    }

    pub fn stats(&self) -> BuildStats {
        match self.state.lock() {
            Ok(guard) => guard.1.clone(),
            Err(poisoned) => poisoned.into_inner().1.clone(),
        }
    }
}
