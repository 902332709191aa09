use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender, TrySendError};
use std::time::Duration;
use thiserror::Error;

use crate::batch::{self, BatchError, RenderBatch};
use crate::protocol::{ClientEnvelope, begin_invoke_js_envelope, render_batch_envelope};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("outbound queue full (cap={0})")]
    QueueFull(usize),

    #[error("connection closed")]
    Disconnected,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("render batch rejected: {0}")]
    Batch(#[from] BatchError),

    #[error("send failed: {0}")]
    Send(#[from] SendError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvokeJsError {
    #[error("remote call failed: {0}")]
    Failed(String),

    #[error("timed out waiting for remote reply")]
    TimedOut,

    #[error("invocation abandoned before a reply arrived")]
    Abandoned,

    #[error(transparent)]
    Send(#[from] SendError),
}

/// Handle to the live connection. `Ok` means the message was accepted for
/// delivery; implementations must not block.
pub trait ClientProxy: Send + Sync {
    fn send(&self, envelope: ClientEnvelope) -> Result<(), SendError>;
}

/// Client proxy backed by a bounded queue drained by a writer thread.
pub struct QueuedClientProxy {
    tx: SyncSender<ClientEnvelope>,
    capacity: usize,
    dropped: AtomicU64,
}

impl QueuedClientProxy {
    pub fn new(tx: SyncSender<ClientEnvelope>, capacity: usize) -> Self {
        Self {
            tx,
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl ClientProxy for QueuedClientProxy {
    fn send(&self, envelope: ClientEnvelope) -> Result<(), SendError> {
        let method = envelope.method_name();

        match self.tx.try_send(envelope) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_envelope)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped.is_power_of_two() {
                    log::warn!(
                        "outbound queue full (cap={}); dropped {dropped} message(s), last {method}",
                        self.capacity
                    );
                }
                Err(SendError::QueueFull(self.capacity))
            }
            Err(TrySendError::Disconnected(_envelope)) => Err(SendError::Disconnected),
        }
    }
}

pub type InvocationResult = Result<String, String>;

/// An in-flight remote call awaiting exactly one reply.
#[derive(Debug)]
pub struct PendingInvocation {
    handle: u64,
    rx: mpsc::Receiver<InvocationResult>,
}

impl PendingInvocation {
    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn wait(self, timeout: Duration) -> Result<String, InvokeJsError> {
        match self.rx.recv_timeout(timeout) {
            Ok(Ok(result_json)) => Ok(result_json),
            Ok(Err(message)) => Err(InvokeJsError::Failed(message)),
            Err(RecvTimeoutError::Timeout) => Err(InvokeJsError::TimedOut),
            Err(RecvTimeoutError::Disconnected) => Err(InvokeJsError::Abandoned),
        }
    }
}

/// Outbound half of a circuit: render batches and remote script calls.
pub struct RemoteDispatchChannel {
    client: Arc<dyn ClientProxy>,
    renderer_id: u32,
    last_batch_id: Mutex<u64>,
    next_handle: AtomicU64,
    pending: Mutex<HashMap<u64, mpsc::Sender<InvocationResult>>>,
}

impl RemoteDispatchChannel {
    pub fn new(client: Arc<dyn ClientProxy>, renderer_id: u32) -> Self {
        Self {
            client,
            renderer_id,
            last_batch_id: Mutex::new(0),
            next_handle: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn renderer_id(&self) -> u32 {
        self.renderer_id
    }

    /// Encodes and sends one batch, returning the batch id it was sent under.
    ///
    /// A failed send leaves the id unused. The client is then missing a batch
    /// that later ones build on, so the owning circuit must not send again.
    pub fn send_render_batch(&self, batch: &RenderBatch) -> Result<u64, DispatchError> {
        let bytes = batch::encode(batch)?;

        let mut last_batch_id = self.last_batch_id.lock();
        let batch_id = last_batch_id.wrapping_add(1);
        self.client
            .send(render_batch_envelope(self.renderer_id, batch_id, &bytes))?;
        *last_batch_id = batch_id;

        log::debug!(
            "sent render batch renderer={} batch_id={batch_id} bytes={}",
            self.renderer_id,
            bytes.len()
        );
        Ok(batch_id)
    }

    /// Fire-and-forget remote call. A handle of `0` means no reply is expected.
    pub fn begin_invoke_js(&self, handle: u64, identifier: &str, args_json: &str) {
        if let Err(err) = self
            .client
            .send(begin_invoke_js_envelope(handle, identifier, args_json))
        {
            log::warn!("failed to begin remote call {identifier} (handle={handle}): {err}");
        }
    }

    pub fn invoke_js(
        &self,
        identifier: &str,
        args_json: &str,
    ) -> Result<PendingInvocation, SendError> {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel();
        self.pending.lock().insert(handle, tx);

        if let Err(err) = self
            .client
            .send(begin_invoke_js_envelope(handle, identifier, args_json))
        {
            self.pending.lock().remove(&handle);
            return Err(err);
        }

        Ok(PendingInvocation { handle, rx })
    }

    /// Completes a pending call. Returns `false` when nothing was waiting on
    /// `handle`; such replies are dropped.
    pub fn end_invoke_js(&self, handle: u64, succeeded: bool, result_json: String) -> bool {
        let Some(tx) = self.pending.lock().remove(&handle) else {
            log::warn!("dropping reply for unknown invocation handle={handle}");
            return false;
        };

        let result = if succeeded {
            Ok(result_json)
        } else {
            Err(result_json)
        };

        // The waiter may have given up already.
        let _ = tx.send(result);
        true
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Abandons every pending call; waiters observe `InvokeJsError::Abandoned`.
    pub fn cancel_pending(&self) {
        let abandoned = std::mem::take(&mut *self.pending.lock());
        if !abandoned.is_empty() {
            log::debug!("abandoning {} pending invocation(s)", abandoned.len());
        }
    }
}
