use std::sync::atomic::{AtomicUsize, Ordering};

use server_api::{ApiContext, ChatBroadcast};
use tokio::sync::broadcast;

pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    /// Fan-out of formatted chat lines to every open socket.
    pub(crate) lines: broadcast::Sender<ChatBroadcast>,
    pub(crate) connections: AtomicUsize,
    pub(crate) history_replay_limit: Option<u32>,
    pub(crate) end_session_on_disconnect: bool,
}

impl AppState {
    pub(crate) fn new(api: ApiContext) -> Self {
        let (lines, _) = broadcast::channel(256);
        Self {
            api,
            lines,
            connections: AtomicUsize::new(0),
            history_replay_limit: None,
            end_session_on_disconnect: true,
        }
    }

    pub(crate) fn connected(&self) -> usize {
        self.connections.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn disconnected(&self) -> usize {
        self.connections.fetch_sub(1, Ordering::SeqCst).saturating_sub(1)
    }
}
