//! Connection lifecycle and user-facing API.
//!
//! The manager owns one connection *generation* at a time: a fresh transport,
//! dispatcher, motor controller and poller built per connected lifetime and
//! torn down as a unit. The state cache survives generations so last-known
//! axis state stays observable across reconnects.
//!
//! Polling policy: the poller runs only while at least one movement
//! operation is outstanding. The active-operations counter starts it on the
//! 0 to 1 transition and stops it on 1 to 0; hosts that want continuous
//! background polling can keep an operation open or drive the poller
//! directly.

use crate::config::DriverConfig;
use crate::controller::cache::{AxisState, AxisStatus, StateCache};
use crate::controller::motor::MotorController;
use crate::controller::poller::Poller;
use crate::error::{AriesError, AriesResult};
use crate::protocol::codec::Reply;
use crate::protocol::dispatcher::{Dispatcher, SpontaneousHandler};
use crate::transport::{LineTransport, TcpTransport};
use log::{info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Cadence for checking link health while connected.
const MONITOR_INTERVAL: Duration = Duration::from_millis(500);

/// Callback receiving connection state transitions: `(connected, detail)`.
pub type ConnectionHandler = Arc<dyn Fn(bool, &str) + Send + Sync>;

/// One connected lifetime's component set.
#[derive(Clone)]
struct Generation {
    transport: Arc<TcpTransport>,
    controller: Arc<MotorController>,
    poller: Arc<Poller>,
}

pub struct AriesManager {
    config: DriverConfig,
    cache: Arc<StateCache>,
    generation: Mutex<Option<Generation>>,
    poll_axes: Mutex<Vec<u32>>,
    spontaneous_handlers: Mutex<Vec<SpontaneousHandler>>,
    connection_handlers: Mutex<Vec<ConnectionHandler>>,
    active_operations: AtomicI64,
    stop_requested: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

impl AriesManager {
    pub fn new(config: DriverConfig) -> AriesResult<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            config,
            cache: Arc::new(StateCache::new()),
            generation: Mutex::new(None),
            poll_axes: Mutex::new(Vec::new()),
            spontaneous_handlers: Mutex::new(Vec::new()),
            connection_handlers: Mutex::new(Vec::new()),
            active_operations: AtomicI64::new(0),
            stop_requested: Arc::new(AtomicBool::new(false)),
            stop_notify: Arc::new(Notify::new()),
            reconnect_task: Mutex::new(None),
        }))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Bring the manager up.
    ///
    /// With `auto_reconnect` a background task keeps attempting and
    /// monitoring the connection until [`AriesManager::stop`]; without it a
    /// single connect attempt is made and its result returned.
    pub async fn start(self: &Arc<Self>) -> AriesResult<()> {
        self.stop_requested.store(false, Ordering::SeqCst);
        if !self.config.auto_reconnect {
            return self.connect_once().await;
        }

        let mut task_guard = self.reconnect_task.lock().expect("task slot poisoned");
        if task_guard.is_some() {
            return Ok(());
        }
        let manager = Arc::clone(self);
        *task_guard = Some(tokio::spawn(async move {
            manager.reconnection_loop().await;
        }));
        Ok(())
    }

    /// Attempt a single connection, replacing any existing generation.
    pub async fn connect_once(self: &Arc<Self>) -> AriesResult<()> {
        self.teardown_generation().await;

        let transport = Arc::new(TcpTransport::new());
        transport
            .connect(&self.config.host, self.config.port)
            .await?;

        let dispatcher = Arc::new(Dispatcher::new());
        let controller = Arc::new(MotorController::new(
            Arc::clone(&transport) as Arc<dyn LineTransport>,
            dispatcher,
            &self.config,
        ));
        let poller = Arc::new(Poller::new(
            Arc::clone(&controller),
            Arc::clone(&self.cache),
            self.poll_axes.lock().expect("poll axes poisoned").clone(),
            self.config.poll_interval(),
            self.config.fast_poll_interval(),
        ));

        // Movement lifecycle wiring: start accelerates polling at once;
        // finish settles the cache with final reads, then releases the
        // operation slot. Weak refs keep the generation from owning its
        // owner.
        let weak = Arc::downgrade(self);
        let poller_for_start = Arc::clone(&poller);
        let poller_for_finish = Arc::clone(&poller);
        controller.register_operation_callbacks(
            Arc::new(move |axis| {
                if let Some(manager) = weak.upgrade() {
                    manager.operation_started();
                }
                poller_for_start.notify_operation_started(axis);
            }),
            {
                let weak = Arc::downgrade(self);
                Arc::new(move |axis| {
                    let poller = Arc::clone(&poller_for_finish);
                    let weak = Weak::clone(&weak);
                    tokio::spawn(async move {
                        poller.notify_operation_finished(axis).await;
                        if let Some(manager) = weak.upgrade() {
                            manager.operation_finished();
                        }
                    });
                })
            },
        );

        for handler in self
            .spontaneous_handlers
            .lock()
            .expect("handler list poisoned")
            .iter()
        {
            controller.register_spontaneous(Arc::clone(handler));
        }

        controller.start();
        transport.start().await?;

        let poller_handle = Arc::clone(&poller);
        *self.generation.lock().expect("generation poisoned") = Some(Generation {
            transport,
            controller,
            poller,
        });

        // A reconnect that lands mid-operation resumes fast polling.
        if self.active_operations.load(Ordering::SeqCst) > 0 {
            poller_handle.start();
        }

        info!(
            "connected to {}:{}",
            self.config.host, self.config.port
        );
        self.notify_connection(true, "connected");
        Ok(())
    }

    /// Shut down: cancel the reconnection task, tear down the current
    /// generation and fail every outstanding request.
    pub async fn stop(self: &Arc<Self>) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.stop_notify.notify_waiters();

        let task = self.reconnect_task.lock().expect("task slot poisoned").take();
        if let Some(task) = task {
            let _ = task.await;
        }

        self.teardown_generation().await;
        self.notify_connection(false, "stopped");
    }

    pub fn is_connected(&self) -> bool {
        self.generation
            .lock()
            .expect("generation poisoned")
            .as_ref()
            .map(|g| g.transport.is_connected())
            .unwrap_or(false)
    }

    /// Current generation's motor controller, for advanced direct use.
    pub fn motor_controller(&self) -> Option<Arc<MotorController>> {
        self.generation
            .lock()
            .expect("generation poisoned")
            .as_ref()
            .map(|g| Arc::clone(&g.controller))
    }

    pub fn register_connection_handler(&self, handler: ConnectionHandler) {
        self.connection_handlers
            .lock()
            .expect("handler list poisoned")
            .push(handler);
    }

    /// Register a handler for unsolicited controller messages. Applied to
    /// the current generation and re-applied after every reconnect.
    pub fn register_spontaneous_handler(&self, handler: SpontaneousHandler) {
        self.spontaneous_handlers
            .lock()
            .expect("handler list poisoned")
            .push(Arc::clone(&handler));
        if let Some(controller) = self.motor_controller() {
            controller.register_spontaneous(handler);
        }
    }

    // =========================================================================
    // Movement API
    // =========================================================================

    /// Start an absolute move of `axis` to `position` (pulse units).
    ///
    /// `speed` selects the controller speed table; `response_method` 0 makes
    /// the device reply on completion, 1 acknowledges immediately (any later
    /// completion line then arrives as a spontaneous message). The callback
    /// receives the correlated reply or the failure.
    pub fn move_absolute_async<F>(
        self: &Arc<Self>,
        axis: u32,
        position: i64,
        speed: i32,
        response_method: i32,
        callback: F,
    ) -> AriesResult<()>
    where
        F: FnOnce(AriesResult<Reply>) + Send + 'static,
    {
        self.movement_command("APS", axis, position, speed, response_method, callback)
    }

    /// Start a relative move of `axis` by `delta` pulses.
    pub fn move_relative_async<F>(
        self: &Arc<Self>,
        axis: u32,
        delta: i64,
        speed: i32,
        response_method: i32,
        callback: F,
    ) -> AriesResult<()>
    where
        F: FnOnce(AriesResult<Reply>) + Send + 'static,
    {
        self.movement_command("RPS", axis, delta, speed, response_method, callback)
    }

    /// Start an origin return on `axis`.
    ///
    /// Counts toward operation-lifecycle tracking only when `ORG` is added
    /// to [`DriverConfig::movement_commands`].
    pub fn origin_return_async<F>(
        self: &Arc<Self>,
        axis: u32,
        speed: i32,
        response_method: i32,
        callback: F,
    ) -> AriesResult<()>
    where
        F: FnOnce(AriesResult<Reply>) + Send + 'static,
    {
        let controller = self.connected_controller()?;
        let params = vec![
            axis.to_string(),
            speed.to_string(),
            response_method.to_string(),
        ];
        controller.send_async_cb("ORG", &params, callback);
        Ok(())
    }

    fn movement_command<F>(
        self: &Arc<Self>,
        cmd: &str,
        axis: u32,
        value: i64,
        speed: i32,
        response_method: i32,
        callback: F,
    ) -> AriesResult<()>
    where
        F: FnOnce(AriesResult<Reply>) + Send + 'static,
    {
        let controller = self.connected_controller()?;

        // Optimistic running flag so a UI shows motion before the first poll.
        self.cache.update_running(axis, true, "cmd-started");

        let params = vec![
            axis.to_string(),
            speed.to_string(),
            value.to_string(),
            response_method.to_string(),
        ];
        controller.send_async_cb(cmd, &params, callback);
        Ok(())
    }

    // =========================================================================
    // Reads and parameter writes
    // =========================================================================

    /// Read the absolute position of `axis`, updating the cache.
    pub async fn read_position(&self, axis: u32) -> AriesResult<i64> {
        let controller = self.connected_controller()?;
        let reply = controller
            .send_sync_default("RDP", &[axis.to_string()])
            .await?;
        let position = reply
            .params
            .first()
            .and_then(|p| p.trim().parse::<i64>().ok())
            .ok_or_else(|| {
                AriesError::Protocol(format!("RDP reply without position: {:?}", reply.raw))
            })?;
        self.cache.update_position(axis, position, &reply.raw);
        Ok(position)
    }

    /// Read the detailed status of `axis`, updating the cache.
    pub async fn read_status(&self, axis: u32) -> AriesResult<AxisStatus> {
        let controller = self.connected_controller()?;
        let reply = controller
            .send_sync_default("STR", &[axis.to_string()])
            .await?;
        let status = AxisStatus::from_params(&reply.params).ok_or_else(|| {
            AriesError::Protocol(format!("STR reply missing fields: {:?}", reply.raw))
        })?;
        self.cache.update_status(axis, status, &reply.raw);
        Ok(status)
    }

    /// Write a controller system parameter (`WSY no/value` on `axis`).
    pub async fn set_system(&self, axis: u32, param_no: u32, value: i64) -> AriesResult<Reply> {
        let controller = self.connected_controller()?;
        let params = vec![axis.to_string(), param_no.to_string(), value.to_string()];
        controller.send_sync_default("WSY", &params).await
    }

    /// Read the most recent controller error (`CERR`, axis-less).
    pub async fn read_last_error(&self) -> AriesResult<Reply> {
        let controller = self.connected_controller()?;
        controller.send_sync_default("CERR", &[]).await
    }

    // =========================================================================
    // Polling and state
    // =========================================================================

    pub fn set_poll_axes(&self, axes: Vec<u32>) {
        *self.poll_axes.lock().expect("poll axes poisoned") = axes.clone();
        if let Some(poller) = self.current_poller() {
            poller.set_axes(axes);
        }
    }

    pub fn add_poll_axis(&self, axis: u32) {
        let mut axes = self.poll_axes.lock().expect("poll axes poisoned");
        if !axes.contains(&axis) {
            axes.push(axis);
        }
        drop(axes);
        if let Some(poller) = self.current_poller() {
            poller.add_axis(axis);
        }
    }

    pub fn remove_poll_axis(&self, axis: u32) {
        self.poll_axes
            .lock()
            .expect("poll axes poisoned")
            .retain(|a| *a != axis);
        if let Some(poller) = self.current_poller() {
            poller.remove_axis(axis);
        }
    }

    /// Copy-out view of every cached axis.
    pub fn snapshot_state(&self) -> HashMap<u32, AxisState> {
        self.cache.snapshot()
    }

    /// Number of movement operations currently outstanding.
    pub fn active_operations(&self) -> i64 {
        self.active_operations.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn connected_controller(&self) -> AriesResult<Arc<MotorController>> {
        let generation = self.generation.lock().expect("generation poisoned");
        match generation.as_ref() {
            Some(g) if g.transport.is_connected() => Ok(Arc::clone(&g.controller)),
            _ => Err(AriesError::NotConnected),
        }
    }

    fn current_poller(&self) -> Option<Arc<Poller>> {
        self.generation
            .lock()
            .expect("generation poisoned")
            .as_ref()
            .map(|g| Arc::clone(&g.poller))
    }

    fn operation_started(&self) {
        let previous = self.active_operations.fetch_add(1, Ordering::SeqCst);
        if previous == 0 {
            if let Some(poller) = self.current_poller() {
                poller.start();
            }
        }
    }

    fn operation_finished(&self) {
        let previous = self.active_operations.fetch_sub(1, Ordering::SeqCst);
        if previous <= 1 {
            self.active_operations.store(0, Ordering::SeqCst);
            if let Some(poller) = self.current_poller() {
                let poller = Arc::clone(&poller);
                tokio::spawn(async move { poller.stop().await });
            }
        }
    }

    async fn teardown_generation(&self) {
        let generation = self.generation.lock().expect("generation poisoned").take();
        if let Some(generation) = generation {
            generation.poller.stop().await;
            generation.controller.stop().await;
            generation.transport.stop().await;
        }
    }

    fn notify_connection(&self, connected: bool, detail: &str) {
        let handlers: Vec<ConnectionHandler> = self
            .connection_handlers
            .lock()
            .expect("handler list poisoned")
            .clone();
        for handler in handlers {
            handler(connected, detail);
        }
    }

    async fn reconnection_loop(self: Arc<Self>) {
        loop {
            if self.stop_requested.load(Ordering::SeqCst) {
                break;
            }

            // Stop must win even against a hanging connect attempt.
            let attempt = tokio::select! {
                result = self.connect_once() => result,
                _ = self.stop_notify.notified() => break,
            };

            match attempt {
                Ok(()) => {
                    // Monitor until the link drops or stop is requested.
                    loop {
                        if self.stop_requested.load(Ordering::SeqCst) {
                            return;
                        }
                        if !self.is_connected() {
                            warn!("connection lost, scheduling reconnect");
                            self.notify_connection(false, "connection lost");
                            break;
                        }
                        tokio::select! {
                            _ = tokio::time::sleep(MONITOR_INTERVAL) => {}
                            _ = self.stop_notify.notified() => {}
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        "connect to {}:{} failed: {e}",
                        self.config.host, self.config.port
                    );
                    self.notify_connection(false, &e.to_string());
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_interval()) => {}
                _ = self.stop_notify.notified() => {}
            }
        }
    }
}
