use axum::response::sse::Event;
use json_patch::Patch;

/// One message on a run's status channel.
#[derive(Clone, Debug)]
pub enum StatusMsg {
    /// RFC 6902 patch against the run's status document.
    JsonPatch(Patch),
    /// Terminal marker; nothing follows on the channel.
    Finished,
}

impl StatusMsg {
    pub fn to_sse_event(&self) -> Event {
        match self {
            StatusMsg::JsonPatch(patch) => {
                let data =
                    serde_json::to_string(patch).unwrap_or_else(|_| "[]".to_string());
                Event::default().event("json_patch").data(data)
            }
            StatusMsg::Finished => Event::default().event("finished").data("{}"),
        }
    }

    /// Rough in-memory footprint, used for history eviction.
    pub fn approx_bytes(&self) -> usize {
        match self {
            StatusMsg::JsonPatch(patch) => serde_json::to_string(patch)
                .map(|s| s.len())
                .unwrap_or(2),
            StatusMsg::Finished => 8,
        }
    }
}
