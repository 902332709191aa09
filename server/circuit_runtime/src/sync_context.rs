//! Single-threaded execution context: one worker thread drains a FIFO of jobs
//! against state it owns exclusively.

use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::thread::{self, JoinHandle, ThreadId};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("execution context is shut down")]
    Closed,

    #[error("job panicked: {0}")]
    Panicked(String),

    #[error("cannot wait on the execution context from its own worker")]
    Reentrant,
}

type Job<S> = Box<dyn FnOnce(&mut S) + Send>;

enum Message<S> {
    Run(Job<S>),
    Shutdown,
}

pub struct SyncContext<S> {
    tx: Mutex<Option<mpsc::Sender<Message<S>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl<S: Send + 'static> SyncContext<S> {
    pub fn spawn(name: impl Into<String>, state: S) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let worker = thread::Builder::new()
            .name(name.into())
            .spawn(move || run_worker(state, rx))?;
        let worker_id = worker.thread().id();

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            worker_id,
        })
    }

    /// Queues `job` behind everything already posted. Never blocks.
    pub fn post<F>(&self, job: F) -> Result<(), ContextError>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.send(Message::Run(Box::new(job)))
    }

    /// Queues `job` and blocks until it has run.
    pub fn invoke<F, T>(&self, job: F) -> Result<T, ContextError>
    where
        F: FnOnce(&mut S) -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.is_worker_thread() {
            return Err(ContextError::Reentrant);
        }

        let (done_tx, done_rx) = mpsc::channel();
        self.post(move |state| {
            let result = panic::catch_unwind(AssertUnwindSafe(|| job(state)))
                .map_err(|payload| ContextError::Panicked(panic_message(payload.as_ref())));
            let _ = done_tx.send(result);
        })?;

        done_rx.recv().map_err(|_| ContextError::Closed)?
    }

    /// Runs `teardown` after the jobs already queued, then stops the worker.
    /// Later calls are no-ops.
    pub fn shutdown<F>(&self, teardown: F)
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        let Some(tx) = self.tx.lock().take() else {
            return;
        };

        if tx.send(Message::Run(Box::new(teardown))).is_err() || tx.send(Message::Shutdown).is_err()
        {
            log::debug!("execution context worker already gone at shutdown");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }

    pub fn is_finished(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .map(JoinHandle::is_finished)
            .unwrap_or(true)
    }

    pub fn is_worker_thread(&self) -> bool {
        thread::current().id() == self.worker_id
    }

    fn send(&self, message: Message<S>) -> Result<(), ContextError> {
        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(ContextError::Closed)?;
        tx.send(message).map_err(|_| ContextError::Closed)
    }
}

fn run_worker<S>(mut state: S, rx: mpsc::Receiver<Message<S>>) {
    for message in rx {
        match message {
            Message::Run(job) => {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| job(&mut state))) {
                    log::error!(
                        "job panicked on execution context: {}",
                        panic_message(payload.as_ref())
                    );
                }
            }
            Message::Shutdown => break,
        }
    }
}

pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
