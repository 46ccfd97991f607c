use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use json_patch::Patch;
use serde_json::{Value, json};
use utils::msg_store::MsgStore;
use uuid::Uuid;

/// The five forward steps of a transformation run, plus its failure state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskStep {
    Fetching,
    Preparing,
    Processing,
    Saving,
    Completed,
    Failed,
}

impl TaskStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStep::Fetching => "fetching",
            TaskStep::Preparing => "preparing",
            TaskStep::Processing => "processing",
            TaskStep::Saving => "saving",
            TaskStep::Completed => "completed",
            TaskStep::Failed => "failed",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TaskStep::Fetching => "Fetching image",
            TaskStep::Preparing => "Preparing assets",
            TaskStep::Processing => "Transforming image",
            TaskStep::Saving => "Saving result",
            TaskStep::Completed => "Completed",
            TaskStep::Failed => "Failed",
        }
    }

    pub fn percent(&self) -> u8 {
        match self {
            TaskStep::Fetching => 10,
            TaskStep::Preparing => 25,
            TaskStep::Processing => 50,
            TaskStep::Saving => 80,
            TaskStep::Completed => 100,
            TaskStep::Failed => 0,
        }
    }
}

/// One status channel per run, kept only while the run is in flight. The
/// executing task is the only writer; subscribers fold the patches into a
/// snapshot or stream them as SSE. `finish` forgets the run, so terminal
/// status must be answered from the run row instead.
#[derive(Clone, Default)]
pub struct ProgressRegistry {
    runs: Arc<RwLock<HashMap<Uuid, Arc<MsgStore>>>>,
}

impl ProgressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The store for a run, created on first use.
    pub fn store_for(&self, run_id: Uuid) -> Arc<MsgStore> {
        let mut runs = self.runs.write().unwrap();
        runs.entry(run_id)
            .or_insert_with(|| Arc::new(MsgStore::new()))
            .clone()
    }

    pub fn get(&self, run_id: Uuid) -> Option<Arc<MsgStore>> {
        self.runs.read().unwrap().get(&run_id).cloned()
    }

    pub fn report(&self, run_id: Uuid, step: TaskStep) {
        self.push_status(run_id, step, step.label());
    }

    /// Failure report with a caller-supplied short label such as "Edit failed".
    pub fn report_failed(&self, run_id: Uuid, label: &str) {
        self.push_status(run_id, TaskStep::Failed, label);
    }

    /// Closes the run's channel and forgets the run. Nothing may be reported
    /// afterwards; once the last `Arc` to the store drops, attached live
    /// streams end.
    pub fn finish(&self, run_id: Uuid) {
        let store = self.runs.write().unwrap().remove(&run_id);
        if let Some(store) = store {
            store.push_finished();
        }
    }

    /// Folded status document for a run, if the run is known.
    pub fn snapshot(&self, run_id: Uuid) -> Option<Value> {
        self.get(run_id).map(|store| store.current_status())
    }

    fn push_status(&self, run_id: Uuid, step: TaskStep, label: &str) {
        let patch = status_patch(step, label);
        self.store_for(run_id).push_patch(patch);
    }
}

/// A closed channel holding a single terminal report, for subscribers that
/// arrive after the registry has forgotten the run.
pub fn replay_channel(step: TaskStep, label: &str) -> Arc<MsgStore> {
    let store = Arc::new(MsgStore::new());
    store.push_patch(status_patch(step, label));
    store.push_finished();
    store
}

fn status_patch(step: TaskStep, label: &str) -> Patch {
    let ops = json!([
        { "op": "add", "path": "/step", "value": step.as_str() },
        { "op": "add", "path": "/label", "value": label },
        { "op": "add", "path": "/progress_percent", "value": step.percent() },
    ]);
    match serde_json::from_value(ops) {
        Ok(patch) => patch,
        Err(err) => {
            tracing::error!("Failed to build status patch: {err}");
            Patch::default()
        }
    }
}
