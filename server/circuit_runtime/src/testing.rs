//! Test doubles shared by the module tests.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::batch::{ComponentDiff, RenderBatch, RenderFrame, RenderTreeEdit};
use crate::dispatch::{ClientProxy, SendError};
use crate::protocol::ClientEnvelope;
use crate::renderer::{RenderError, Renderer};

#[derive(Default)]
pub struct RecordingClient {
    sent: Mutex<Vec<ClientEnvelope>>,
    disconnected: AtomicBool,
    attempts: AtomicUsize,
    refusals: AtomicUsize,
}

impl RecordingClient {
    pub fn sent(&self) -> Vec<ClientEnvelope> {
        self.sent.lock().clone()
    }

    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    /// The next `count` sends fail as if the outbound queue were full.
    pub fn refuse_next(&self, count: usize) {
        self.refusals.store(count, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn invoked_identifiers(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|envelope| match envelope {
                ClientEnvelope::BeginInvokeJs { identifier, .. } => Some(identifier),
                _ => None,
            })
            .collect()
    }

    pub fn batch_ids(&self) -> Vec<u64> {
        self.sent()
            .into_iter()
            .filter_map(|envelope| match envelope {
                ClientEnvelope::RenderBatch { batch_id, .. } => Some(batch_id),
                _ => None,
            })
            .collect()
    }
}

impl ClientProxy for RecordingClient {
    fn send(&self, envelope: ClientEnvelope) -> Result<(), SendError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(SendError::Disconnected);
        }
        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(SendError::QueueFull(0));
        }
        self.sent.lock().push(envelope);
        Ok(())
    }
}

/// Renderer that hands out queued batches and records dispatched events.
#[derive(Clone, Default)]
pub struct ScriptedRenderer {
    pub queued: Arc<Mutex<VecDeque<RenderBatch>>>,
    pub events: Arc<Mutex<Vec<(u32, u64, serde_json::Value)>>>,
    pub disposed: Arc<AtomicBool>,
}

impl ScriptedRenderer {
    pub fn queue_text(&self, content: &str) {
        self.queued.lock().push_back(text_batch(content));
    }
}

impl Renderer for ScriptedRenderer {
    fn compute_next_batch(&mut self) -> Option<RenderBatch> {
        self.queued.lock().pop_front()
    }

    fn dispatch_event(
        &mut self,
        component_id: u32,
        event_handler_id: u64,
        event_args: &serde_json::Value,
    ) -> Result<(), RenderError> {
        if event_handler_id == 0 {
            return Err(RenderError::UnknownEventHandler(event_handler_id));
        }
        self.events
            .lock()
            .push((component_id, event_handler_id, event_args.clone()));
        Ok(())
    }

    fn dispose(&mut self) {
        self.disposed.store(true, Ordering::SeqCst);
    }
}

pub fn text_batch(content: &str) -> RenderBatch {
    let mut batch = RenderBatch::default();
    let frame = batch.push_frame(RenderFrame::Text {
        content: content.to_string(),
    });
    batch.updated_components.push(ComponentDiff {
        component_id: 1,
        edits: vec![RenderTreeEdit::update_text(0, frame)],
    });
    batch
}
