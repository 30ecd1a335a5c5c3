//! Request/response correlation.
//!
//! The dispatcher owns a map from correlation key (`CMD:axis`) to an ordered
//! queue of one-shot completion slots. Replies matching a key complete slots
//! strictly FIFO; replies with no matching slot fan out to registered
//! spontaneous handlers on a small worker pool so a slow handler can never
//! stall the line-delivery path.
//!
//! All pending-map operations are synchronous and take one brief mutex; no
//! lock is held across an await or a user callback.

use crate::error::{AriesError, AriesResult};
use crate::protocol::codec::Reply;
use log::{debug, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Workers draining the spontaneous-notification queue.
const DEFAULT_SPONTANEOUS_WORKERS: usize = 2;
/// Bound on queued spontaneous notifications before they are dropped.
const SPONTANEOUS_QUEUE_CAPACITY: usize = 64;

/// Handler invoked for inbound replies that matched no pending request.
pub type SpontaneousHandler = Arc<dyn Fn(&Reply) + Send + Sync>;

type Slot = oneshot::Sender<AriesResult<Reply>>;

/// One-shot handle resolving to the matched reply or a failure.
#[derive(Debug)]
pub struct WaitHandle {
    rx: oneshot::Receiver<AriesResult<Reply>>,
}

impl WaitHandle {
    /// Wait for the slot to resolve.
    pub async fn wait(self) -> AriesResult<Reply> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(AriesError::Cancelled("request slot dropped".into())),
        }
    }

    /// Non-blocking probe. Returns `None` while the request is still in
    /// flight; a dropped dispatcher resolves as cancelled.
    pub fn try_take(&mut self) -> Option<AriesResult<Reply>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                Some(Err(AriesError::Cancelled("request slot dropped".into())))
            }
        }
    }
}

pub struct Dispatcher {
    pending: Mutex<HashMap<String, VecDeque<Slot>>>,
    /// Shared with the worker pool, which snapshots it per notification.
    handlers: Arc<Mutex<Vec<SpontaneousHandler>>>,
    spont_tx: Mutex<Option<mpsc::Sender<Reply>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::with_workers(DEFAULT_SPONTANEOUS_WORKERS)
    }

    pub fn with_workers(worker_count: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Reply>(SPONTANEOUS_QUEUE_CAPACITY);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let handlers: Arc<Mutex<Vec<SpontaneousHandler>>> = Arc::new(Mutex::new(Vec::new()));

        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count.max(1) {
            let rx = Arc::clone(&rx);
            let handlers = Arc::clone(&handlers);
            workers.push(tokio::spawn(async move {
                loop {
                    let reply = { rx.lock().await.recv().await };
                    let Some(reply) = reply else { break };
                    let snapshot: Vec<SpontaneousHandler> =
                        handlers.lock().expect("handler list poisoned").clone();
                    for handler in snapshot {
                        let outcome = std::panic::catch_unwind(
                            std::panic::AssertUnwindSafe(|| handler(&reply)),
                        );
                        if outcome.is_err() {
                            warn!("spontaneous handler panicked on {:?}", reply.raw);
                        }
                    }
                }
            }));
        }

        Self {
            pending: Mutex::new(HashMap::new()),
            handlers,
            spont_tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        }
    }

    /// Register a new completion slot at the tail of `key`'s queue.
    pub fn add_pending(&self, key: &str) -> WaitHandle {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending map poisoned")
            .entry(key.to_string())
            .or_default()
            .push_back(tx);
        WaitHandle { rx }
    }

    /// Complete the head slot for `key` with `reply`. Returns whether a
    /// matching slot existed.
    pub fn try_fulfill(&self, key: &str, reply: &Reply) -> bool {
        let slot = self.pop_front(key);
        match slot {
            Some(tx) => {
                if tx.send(Ok(reply.clone())).is_err() {
                    // The waiter went away without cancelling; the request
                    // still counts as matched.
                    debug!("waiter for {key} dropped before fulfillment");
                }
                true
            }
            None => false,
        }
    }

    /// Fail the head slot for `key`, if any.
    pub fn fail_one(&self, key: &str, err: AriesError) {
        if let Some(tx) = self.pop_front(key) {
            let _ = tx.send(Err(err));
        }
    }

    /// Fail every pending slot and clear the map.
    pub fn fail_all(&self, err: AriesError) {
        let drained: Vec<Slot> = {
            let mut pending = self.pending.lock().expect("pending map poisoned");
            pending.drain().flat_map(|(_, q)| q).collect()
        };
        for tx in drained {
            let _ = tx.send(Err(err.clone()));
        }
    }

    /// Number of slots currently waiting (all keys).
    pub fn pending_len(&self) -> usize {
        self.pending
            .lock()
            .expect("pending map poisoned")
            .values()
            .map(|q| q.len())
            .sum()
    }

    /// Register a handler for replies that match no pending request.
    pub fn register_spontaneous(&self, handler: SpontaneousHandler) {
        self.handlers
            .lock()
            .expect("handler list poisoned")
            .push(handler);
    }

    /// Queue a reply for the spontaneous worker pool. Never blocks; if the
    /// pool is saturated the notification is dropped with a warning.
    pub fn notify_spontaneous(&self, reply: Reply) {
        let tx = self.spont_tx.lock().expect("sender poisoned").clone();
        match tx {
            Some(tx) => {
                if let Err(e) = tx.try_send(reply) {
                    warn!("spontaneous queue full, dropping notification: {e}");
                }
            }
            None => debug!("dispatcher shut down, dropping spontaneous reply"),
        }
    }

    /// Close the notification queue and join the worker pool.
    pub async fn shutdown(&self) {
        self.spont_tx.lock().expect("sender poisoned").take();
        let workers: Vec<JoinHandle<()>> =
            self.workers.lock().expect("worker list poisoned").drain(..).collect();
        for w in workers {
            let _ = w.await;
        }
    }

    fn pop_front(&self, key: &str) -> Option<Slot> {
        let mut pending = self.pending.lock().expect("pending map poisoned");
        let queue = pending.get_mut(key)?;
        let slot = queue.pop_front();
        if queue.is_empty() {
            pending.remove(key);
        }
        slot
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
