//! Registry of video contexts for one server.
//!
//! Hands out context ids and keeps the contexts reachable by id so a
//! transport layer can route remote signals (e.g. a client closing its
//! side) to the right session.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use tracing::info;

use crate::video::context::{ContextConfig, VideoContext};
use crate::video::traits::TransportSink;
use crate::video::types::SessionState;

/// Owns the contexts created through it.
pub struct VideoServer {
    config: ContextConfig,
    next_id: AtomicU32,
    contexts: Mutex<HashMap<u32, Arc<VideoContext>>>,
}

impl VideoServer {
    pub fn new(config: ContextConfig) -> Self {
        Self {
            config,
            next_id: AtomicU32::new(1),
            contexts: Mutex::new(HashMap::new()),
        }
    }

    /// Open a new context delivering to `sink`. Requires a Tokio runtime.
    pub fn create_context(&self, sink: Arc<dyn TransportSink>) -> Arc<VideoContext> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let ctx = Arc::new(VideoContext::new(id, sink, self.config.clone()));
        self.contexts.lock().insert(id, Arc::clone(&ctx));
        info!(session = id, "video context created");
        ctx
    }

    pub fn get(&self, id: u32) -> Option<Arc<VideoContext>> {
        self.contexts.lock().get(&id).cloned()
    }

    /// Close and forget one context. Returns `false` for unknown ids.
    pub fn close(&self, id: u32) -> bool {
        let ctx = self.contexts.lock().remove(&id);
        match ctx {
            Some(ctx) => {
                ctx.close();
                true
            }
            None => false,
        }
    }

    /// Close every context.
    pub fn close_all(&self) {
        let contexts: Vec<_> = self.contexts.lock().drain().map(|(_, c)| c).collect();
        for ctx in contexts {
            ctx.close();
        }
    }

    /// Forget contexts that closed on their own (peer or network).
    pub fn prune_closed(&self) -> usize {
        let mut contexts = self.contexts.lock();
        let before = contexts.len();
        contexts.retain(|_, c| c.state() != SessionState::Closed);
        before - contexts.len()
    }

    pub fn len(&self) -> usize {
        self.contexts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for VideoServer {
    fn drop(&mut self) {
        self.close_all();
    }
}
