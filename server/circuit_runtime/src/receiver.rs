//! Receiving end of the render batch stream.
//!
//! Batches for one renderer must be applied in the order they were produced,
//! so every `render_batch` envelope carries a `batch_id` that is checked
//! against the last applied one before decoding.

use thiserror::Error;

use crate::batch::{self, BatchError, RenderBatch};
use crate::protocol::{self, ClientEnvelope};

#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error("batch for renderer {actual} received by renderer {expected}")]
    RendererMismatch { expected: u32, actual: u32 },

    #[error("batch out of order: batch_id={batch_id}, expected={expected}")]
    OutOfOrder { batch_id: u64, expected: u64 },

    #[error("batch payload is not valid base64: {0}")]
    Payload(#[from] std::io::Error),

    #[error("malformed batch: {0}")]
    Malformed(#[from] BatchError),

    #[error("envelope is not a render batch")]
    NotABatch,
}

#[derive(Debug, Clone, Default)]
pub struct BatchReceiver {
    renderer_id: Option<u32>,
    last_batch_id: Option<u64>,
}

impl BatchReceiver {
    pub fn new(renderer_id: u32) -> Self {
        Self {
            renderer_id: Some(renderer_id),
            last_batch_id: None,
        }
    }

    pub fn last_batch_id(&self) -> Option<u64> {
        self.last_batch_id
    }

    /// Decodes the next batch. Any error resets the receiver; the sender has
    /// to start a fresh stream before further batches are accepted.
    pub fn receive(&mut self, envelope: &ClientEnvelope) -> Result<RenderBatch, ReceiveError> {
        let result = self.try_receive(envelope);
        if result.is_err() {
            self.reset();
        }
        result
    }

    fn try_receive(&mut self, envelope: &ClientEnvelope) -> Result<RenderBatch, ReceiveError> {
        let ClientEnvelope::RenderBatch {
            renderer_id,
            batch_id,
            batch,
        } = envelope
        else {
            return Err(ReceiveError::NotABatch);
        };

        match self.renderer_id {
            Some(expected) if expected != *renderer_id => {
                return Err(ReceiveError::RendererMismatch {
                    expected,
                    actual: *renderer_id,
                });
            }
            Some(_) => {}
            None => self.renderer_id = Some(*renderer_id),
        }

        validate_batch_id(self.last_batch_id, *batch_id)?;

        let bytes = protocol::decode_batch_payload(batch)?;
        let decoded = batch::decode(&bytes)?;
        self.last_batch_id = Some(*batch_id);
        Ok(decoded)
    }

    pub fn reset(&mut self) {
        self.last_batch_id = None;
    }
}

pub fn validate_batch_id(last_batch_id: Option<u64>, batch_id: u64) -> Result<(), ReceiveError> {
    let expected = match last_batch_id {
        Some(last) => last.wrapping_add(1),
        None => 1,
    };

    if batch_id == expected {
        Ok(())
    } else {
        Err(ReceiveError::OutOfOrder { batch_id, expected })
    }
}
