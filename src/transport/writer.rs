//! Bounded, serialized outbound writer.
//!
//! Commands funnel through one bounded queue drained by a dedicated task, so
//! wire order equals enqueue order regardless of how many callers submit
//! concurrently. `enqueue` never blocks: a full queue or a stopped writer is
//! reported immediately and fails only the originating request.
//!
//! On a send failure the worker reports the error once, stops consuming, and
//! leaves recovery to the disconnect path.

use crate::error::{AriesError, AriesResult};
use crate::transport::LineTransport;
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Callback fired once when the drain task hits a send failure.
pub type WriterErrorHandler = Arc<dyn Fn(AriesError) + Send + Sync>;

pub struct Writer {
    transport: Arc<dyn LineTransport>,
    capacity: usize,
    tx: Mutex<Option<mpsc::Sender<String>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    failed: Arc<AtomicBool>,
    error_handler: Arc<Mutex<Option<WriterErrorHandler>>>,
}

impl Writer {
    pub fn new(transport: Arc<dyn LineTransport>, capacity: usize) -> Self {
        Self {
            transport,
            capacity: capacity.max(1),
            tx: Mutex::new(None),
            worker: Mutex::new(None),
            failed: Arc::new(AtomicBool::new(false)),
            error_handler: Arc::new(Mutex::new(None)),
        }
    }

    /// Register the single error callback. Replaces any previous one.
    pub fn on_error(&self, handler: WriterErrorHandler) {
        *self.error_handler.lock().expect("error handler poisoned") = Some(handler);
    }

    /// Spawn the drain task. Idempotent.
    pub fn start(&self) {
        let mut tx_guard = self.tx.lock().expect("sender poisoned");
        if tx_guard.is_some() {
            return;
        }
        let (tx, mut rx) = mpsc::channel::<String>(self.capacity);
        *tx_guard = Some(tx);
        drop(tx_guard);

        self.failed.store(false, Ordering::SeqCst);
        let transport = Arc::clone(&self.transport);
        let failed = Arc::clone(&self.failed);
        let error_handler = Arc::clone(&self.error_handler);

        let task = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if let Err(e) = transport.send_line(&line).await {
                    warn!("writer send failed: {e}");
                    failed.store(true, Ordering::SeqCst);
                    let handler = error_handler
                        .lock()
                        .expect("error handler poisoned")
                        .clone();
                    if let Some(handler) = handler {
                        handler(e);
                    }
                    break;
                }
            }
            debug!("writer drain task exiting");
        });
        *self.worker.lock().expect("worker poisoned") = Some(task);
    }

    /// Queue one framed line for transmission. Non-blocking.
    pub fn enqueue(&self, line: String) -> AriesResult<()> {
        if self.failed.load(Ordering::SeqCst) {
            return Err(AriesError::WriterStopped);
        }
        let tx = {
            let guard = self.tx.lock().expect("sender poisoned");
            guard.clone()
        };
        let Some(tx) = tx else {
            return Err(AriesError::WriterStopped);
        };
        match tx.try_send(line) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(AriesError::QueueOverflow),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(AriesError::WriterStopped),
        }
    }

    /// Stop the writer. With `flush` the worker drains remaining entries
    /// first; otherwise pending entries are dropped. Idempotent.
    pub async fn stop(&self, flush: bool) {
        self.tx.lock().expect("sender poisoned").take();
        let task = self.worker.lock().expect("worker poisoned").take();
        if let Some(task) = task {
            if flush {
                let _ = task.await;
            } else {
                task.abort();
            }
        }
    }

    /// Whether the drain task halted on a send failure.
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }
}
