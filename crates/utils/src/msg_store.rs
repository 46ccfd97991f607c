use std::{
    collections::VecDeque,
    sync::{OnceLock, RwLock},
};

use axum::response::sse::Event;
use futures::{StreamExt, TryStreamExt};
use json_patch::Patch;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::status_msg::StatusMsg;

const DEFAULT_HISTORY_MAX_BYTES: usize = 512 * 1024;
const DEFAULT_HISTORY_MAX_ENTRIES: usize = 1024;

struct StatusHistoryConfig {
    max_bytes: usize,
    max_entries: usize,
}

static STATUS_HISTORY_CONFIG: OnceLock<StatusHistoryConfig> = OnceLock::new();

fn status_history_config() -> &'static StatusHistoryConfig {
    STATUS_HISTORY_CONFIG.get_or_init(|| {
        let max_bytes =
            read_env_usize("DARKROOM_STATUS_HISTORY_MAX_BYTES", DEFAULT_HISTORY_MAX_BYTES);
        let max_entries = read_env_usize(
            "DARKROOM_STATUS_HISTORY_MAX_ENTRIES",
            DEFAULT_HISTORY_MAX_ENTRIES,
        );

        StatusHistoryConfig {
            max_bytes: normalize_limit(max_bytes, "DARKROOM_STATUS_HISTORY_MAX_BYTES"),
            max_entries: normalize_limit(max_entries, "DARKROOM_STATUS_HISTORY_MAX_ENTRIES"),
        }
    })
}

fn read_env_usize(name: &str, default: usize) -> usize {
    match std::env::var(name) {
        Ok(value) => match value.parse::<usize>() {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::warn!("Invalid {name}='{value}': {err}. Using default {default}.");
                default
            }
        },
        Err(_) => default,
    }
}

fn normalize_limit(value: usize, name: &str) -> usize {
    if value == 0 {
        tracing::warn!("{name} set to 0. Using minimum value 1 instead.");
        1
    } else {
        value
    }
}

#[derive(Clone)]
struct StoredMsg {
    msg: StatusMsg,
    bytes: usize,
}

struct Inner {
    history: VecDeque<StoredMsg>,
    total_bytes: usize,
    finished: bool,
}

/// Per-run status channel: bounded history for late subscribers plus a live
/// broadcast feed. Each run owns exactly one store; it is dropped with the run.
pub struct MsgStore {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<StatusMsg>,
}

impl Default for MsgStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MsgStore {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(10000);
        Self {
            inner: RwLock::new(Inner {
                history: VecDeque::with_capacity(16),
                total_bytes: 0,
                finished: false,
            }),
            sender,
        }
    }

    pub fn push(&self, msg: StatusMsg) {
        let bytes = msg.approx_bytes();

        // Record and broadcast under one lock: a message lands either in a
        // subscriber's history snapshot or on its live feed, never in neither.
        let mut inner = self.inner.write().unwrap();
        if matches!(msg, StatusMsg::Finished) {
            inner.finished = true;
        }
        inner.push_msg(msg.clone(), bytes);
        let _ = self.sender.send(msg);
    }

    pub fn push_patch(&self, patch: Patch) {
        self.push(StatusMsg::JsonPatch(patch));
    }

    pub fn push_finished(&self) {
        self.push(StatusMsg::Finished);
    }

    pub fn get_receiver(&self) -> broadcast::Receiver<StatusMsg> {
        self.sender.subscribe()
    }

    pub fn get_history(&self) -> Vec<StatusMsg> {
        self.inner
            .read()
            .unwrap()
            .history
            .iter()
            .map(|s| s.msg.clone())
            .collect()
    }

    pub fn is_finished(&self) -> bool {
        self.inner.read().unwrap().finished
    }

    /// Folds the recorded patches into the current status document.
    /// The latest patch wins for any field touched more than once.
    pub fn current_status(&self) -> Value {
        let mut doc = Value::Object(serde_json::Map::new());
        for msg in self.get_history() {
            if let StatusMsg::JsonPatch(patch) = &msg
                && let Err(err) = json_patch::patch(&mut doc, patch)
            {
                tracing::warn!("Failed to apply status patch: {err}");
            }
        }
        doc
    }

    /// History then live. Closes after the replay when the run already
    /// finished; the `Finished` marker is the last history element. The live
    /// half ends when the last handle to the store drops.
    pub fn history_plus_stream(
        &self,
    ) -> futures::stream::BoxStream<'static, Result<StatusMsg, std::io::Error>> {
        // Snapshot and subscribe under the same lock so no push can slip
        // between the two.
        let (finished, history, receiver) = {
            let inner = self.inner.read().unwrap();
            let history: Vec<StatusMsg> = inner.history.iter().map(|s| s.msg.clone()).collect();
            (inner.finished, history, self.sender.subscribe())
        };

        let hist = futures::stream::iter(history.into_iter().map(Ok::<_, std::io::Error>));

        if finished {
            Box::pin(hist)
        } else {
            let live = BroadcastStream::new(receiver)
                .filter_map(|res| async move { res.ok().map(Ok::<_, std::io::Error>) });
            Box::pin(hist.chain(live))
        }
    }

    /// Same stream but mapped to `Event` for SSE handlers.
    pub fn sse_stream(&self) -> futures::stream::BoxStream<'static, Result<Event, std::io::Error>> {
        self.history_plus_stream()
            .map_ok(|m| m.to_sse_event())
            .boxed()
    }
}

impl Inner {
    fn push_msg(&mut self, msg: StatusMsg, bytes: usize) {
        let limits = status_history_config();

        while self.history.len() >= limits.max_entries
            || self.total_bytes.saturating_add(bytes) > limits.max_bytes
        {
            if let Some(front) = self.history.pop_front() {
                self.total_bytes = self.total_bytes.saturating_sub(front.bytes);
            } else {
                break;
            }
        }
        self.history.push_back(StoredMsg { msg, bytes });
        self.total_bytes = self.total_bytes.saturating_add(bytes);
    }
}
