//! Request pipeline: user intent to protocol traffic and back.
//!
//! The motor controller composes the transport, the outbound writer and the
//! dispatcher for one connection generation. Commands go out through
//! [`MotorController::send_async`] (fire-and-correlate),
//! [`MotorController::send_sync`] (bounded wait) or
//! [`MotorController::send_async_cb`] (callback delivery with
//! operation-lifecycle signals for movement commands).
//!
//! A stopped controller cannot be restarted; the manager constructs a fresh
//! one per connection generation.

use crate::config::DriverConfig;
use crate::error::{AriesError, AriesResult};
use crate::protocol::codec::{self, Reply};
use crate::protocol::dispatcher::{Dispatcher, SpontaneousHandler, WaitHandle};
use crate::transport::{LineTransport, Writer};
use log::{debug, warn};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Signal fired with the axis number when a movement command starts or its
/// reply handling finishes.
pub type OperationCallback = Arc<dyn Fn(u32) + Send + Sync>;

pub struct MotorController {
    transport: Arc<dyn LineTransport>,
    dispatcher: Arc<Dispatcher>,
    writer: Writer,
    movement_commands: HashSet<String>,
    response_timeout: Duration,
    include_stx: bool,
    on_operation_start: Mutex<Option<OperationCallback>>,
    on_operation_finish: Mutex<Option<OperationCallback>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl MotorController {
    pub fn new(
        transport: Arc<dyn LineTransport>,
        dispatcher: Arc<Dispatcher>,
        config: &DriverConfig,
    ) -> Self {
        let writer = Writer::new(Arc::clone(&transport), config.writer_max_queue);
        Self {
            transport,
            dispatcher,
            writer,
            movement_commands: config.movement_commands.iter().cloned().collect(),
            response_timeout: config.response_timeout(),
            include_stx: config.include_stx,
            on_operation_start: Mutex::new(None),
            on_operation_finish: Mutex::new(None),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// Install operation-lifecycle callbacks. Must be called before `start`
    /// for movement commands to be tracked from the first request.
    pub fn register_operation_callbacks(
        &self,
        on_start: OperationCallback,
        on_finish: OperationCallback,
    ) {
        *self.on_operation_start.lock().expect("callback poisoned") = Some(on_start);
        *self.on_operation_finish.lock().expect("callback poisoned") = Some(on_finish);
    }

    /// Register a handler for replies that match no pending request.
    pub fn register_spontaneous(&self, handler: SpontaneousHandler) {
        self.dispatcher.register_spontaneous(handler);
    }

    /// Wire handlers and bring up the writer. Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        self.writer.start();

        // A writer send failure strands every outstanding waiter; resolve
        // them deterministically and let the disconnect path drive recovery.
        let dispatcher = Arc::clone(&self.dispatcher);
        self.writer.on_error(Arc::new(move |err| {
            warn!("outbound write failed, cancelling pending requests: {err}");
            dispatcher.fail_all(AriesError::Cancelled("write failure".into()));
        }));

        let dispatcher = Arc::clone(&self.dispatcher);
        self.transport.set_line_handler(Some(Arc::new(move |line| {
            match Reply::parse(&line) {
                Ok(reply) => {
                    let key = reply.key();
                    if !dispatcher.try_fulfill(&key, &reply) {
                        if reply.cmd == "SYS" {
                            if let Some(code) = reply.params.first() {
                                match codec::error_text(code) {
                                    Some(text) => debug!("controller notification {code}: {text}"),
                                    None => debug!("controller notification {code}"),
                                }
                            }
                        }
                        dispatcher.notify_spontaneous(reply);
                    }
                }
                Err(e) => warn!("dropping invalid line: {e}"),
            }
        })));

        let dispatcher = Arc::clone(&self.dispatcher);
        self.transport.set_disconnect_handler(Some(Arc::new(move || {
            dispatcher.fail_all(AriesError::Cancelled("disconnected".into()));
        })));
    }

    /// Tear down: handlers unregistered, writer flushed and stopped, every
    /// outstanding request failed. Idempotent; the controller cannot be
    /// restarted afterwards.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.transport.set_line_handler(None);
        self.transport.set_disconnect_handler(None);
        self.writer.stop(true).await;
        self.dispatcher
            .fail_all(AriesError::Cancelled("motor controller stopped".into()));
        self.dispatcher.shutdown().await;
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Submit a command and obtain a handle for its correlated reply.
    ///
    /// Registers the pending slot before the line is queued so a fast reply
    /// can never race past its waiter. An enqueue failure resolves the slot
    /// immediately and surfaces the same error to the caller.
    pub fn send_async(&self, cmd: &str, params: &[String]) -> AriesResult<WaitHandle> {
        if self.stopped.load(Ordering::SeqCst) || !self.started.load(Ordering::SeqCst) {
            return Err(AriesError::WriterStopped);
        }
        if !self.transport.is_connected() {
            return Err(AriesError::NotConnected);
        }

        let line = codec::encode_command(cmd, params, self.include_stx)?;
        let key = codec::request_key(cmd, params);
        let handle = self.dispatcher.add_pending(&key);

        if let Err(e) = self.writer.enqueue(line) {
            self.dispatcher.fail_one(&key, e.clone());
            return Err(e);
        }
        Ok(handle)
    }

    /// Submit a command and wait for its reply, bounded by `timeout`.
    ///
    /// On expiry the pending slot is failed so a late reply routes to the
    /// spontaneous path instead of a stale waiter.
    pub async fn send_sync(
        &self,
        cmd: &str,
        params: &[String],
        timeout: Duration,
    ) -> AriesResult<Reply> {
        let handle = self.send_async(cmd, params)?;
        match tokio::time::timeout(timeout, handle.wait()).await {
            Ok(result) => result,
            Err(_) => {
                let key = codec::request_key(cmd, params);
                self.dispatcher.fail_one(&key, AriesError::Timeout);
                Err(AriesError::Timeout)
            }
        }
    }

    /// `send_sync` with the configured default timeout.
    pub async fn send_sync_default(&self, cmd: &str, params: &[String]) -> AriesResult<Reply> {
        self.send_sync(cmd, params, self.response_timeout).await
    }

    /// Submit a command and route the outcome to `callback`.
    ///
    /// For mnemonics in the movement set whose first parameter parses as an
    /// axis, the start signal fires before the command is queued and the
    /// finish signal fires after the callback returns, on success and error
    /// alike.
    pub fn send_async_cb<F>(&self, cmd: &str, params: &[String], callback: F)
    where
        F: FnOnce(AriesResult<Reply>) + Send + 'static,
    {
        let movement_axis = if self.movement_commands.contains(cmd) {
            params.first().and_then(|p| p.parse::<u32>().ok())
        } else {
            None
        };

        if let Some(axis) = movement_axis {
            self.fire_operation_start(axis);
        }

        match self.send_async(cmd, params) {
            Ok(handle) => {
                let on_finish = self
                    .on_operation_finish
                    .lock()
                    .expect("callback poisoned")
                    .clone();
                tokio::spawn(async move {
                    let result = handle.wait().await;
                    callback(result);
                    if let (Some(axis), Some(on_finish)) = (movement_axis, on_finish) {
                        on_finish(axis);
                    }
                });
            }
            Err(e) => {
                callback(Err(e));
                if let Some(axis) = movement_axis {
                    self.fire_operation_finish(axis);
                }
            }
        }
    }

    fn fire_operation_start(&self, axis: u32) {
        let cb = self
            .on_operation_start
            .lock()
            .expect("callback poisoned")
            .clone();
        if let Some(cb) = cb {
            cb(axis);
        }
    }

    fn fire_operation_finish(&self, axis: u32) {
        let cb = self
            .on_operation_finish
            .lock()
            .expect("callback poisoned")
            .clone();
        if let Some(cb) = cb {
            cb(axis);
        }
    }
}
