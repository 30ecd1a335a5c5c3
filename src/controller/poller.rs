//! Periodic axis interrogation.
//!
//! A single task wakes on a short tick and, per watched axis, keeps the
//! state cache fresh with `RDP` position reads. Axes with an outstanding
//! operation are polled at the fast cadence, idle axes at the slow one. At
//! most one read is in flight per axis, which bounds pipeline depth no
//! matter how slow the link is.
//!
//! When an operation finishes the poller performs two bounded synchronous
//! reads (`RDP` then `STR`) so the cache settles on the final position and
//! a definitive running flag; failures there are logged, never propagated.

use crate::controller::cache::{AxisStatus, StateCache};
use crate::controller::motor::MotorController;
use crate::protocol::dispatcher::WaitHandle;
use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Scheduler wake-up granularity.
const TICK: Duration = Duration::from_millis(50);
/// Bound on each post-operation final read.
const FINAL_READ_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Poller {
    controller: Arc<MotorController>,
    cache: Arc<StateCache>,
    poll_interval: Duration,
    fast_poll_interval: Duration,
    axes: Mutex<Vec<u32>>,
    last_scheduled: Mutex<HashMap<u32, Instant>>,
    inflight: Mutex<HashMap<u32, WaitHandle>>,
    active: Mutex<HashSet<u32>>,
    running: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    wake: Notify,
}

impl Poller {
    pub fn new(
        controller: Arc<MotorController>,
        cache: Arc<StateCache>,
        axes: Vec<u32>,
        poll_interval: Duration,
        fast_poll_interval: Duration,
    ) -> Self {
        let now = Instant::now();
        let last_scheduled = axes
            .iter()
            .map(|a| (*a, now.checked_sub(poll_interval).unwrap_or(now)))
            .collect();
        Self {
            controller,
            cache,
            poll_interval,
            fast_poll_interval,
            axes: Mutex::new(axes),
            last_scheduled: Mutex::new(last_scheduled),
            inflight: Mutex::new(HashMap::new()),
            active: Mutex::new(HashSet::new()),
            running: AtomicBool::new(false),
            worker: Mutex::new(None),
            wake: Notify::new(),
        }
    }

    /// Begin the poll loop. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let poller = Arc::clone(self);
        let task = tokio::spawn(async move { poller.run_loop().await });
        *self.worker.lock().expect("worker poisoned") = Some(task);
    }

    /// Stop the poll loop and discard in-flight reads. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.wake.notify_waiters();
        let task = self.worker.lock().expect("worker poisoned").take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.inflight.lock().expect("inflight poisoned").clear();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Replace the watched axis list.
    pub fn set_axes(&self, axes: Vec<u32>) {
        let now = Instant::now();
        let mut last = self.last_scheduled.lock().expect("schedule poisoned");
        for axis in &axes {
            last.entry(*axis)
                .or_insert_with(|| now.checked_sub(self.poll_interval).unwrap_or(now));
        }
        *self.axes.lock().expect("axes poisoned") = axes;
    }

    pub fn add_axis(&self, axis: u32) {
        let mut axes = self.axes.lock().expect("axes poisoned");
        if !axes.contains(&axis) {
            axes.push(axis);
            let now = Instant::now();
            self.last_scheduled
                .lock()
                .expect("schedule poisoned")
                .insert(axis, now.checked_sub(self.poll_interval).unwrap_or(now));
        }
    }

    /// Remove an axis from polling, discarding its in-flight read and
    /// active-set membership.
    pub fn remove_axis(&self, axis: u32) {
        self.axes.lock().expect("axes poisoned").retain(|a| *a != axis);
        self.last_scheduled
            .lock()
            .expect("schedule poisoned")
            .remove(&axis);
        self.inflight.lock().expect("inflight poisoned").remove(&axis);
        self.active.lock().expect("active set poisoned").remove(&axis);
    }

    pub fn axes(&self) -> Vec<u32> {
        self.axes.lock().expect("axes poisoned").clone()
    }

    /// Switch an axis to the fast cadence and read it immediately.
    pub fn notify_operation_started(&self, axis: u32) {
        self.active.lock().expect("active set poisoned").insert(axis);
        self.schedule_read(axis);
        self.wake.notify_waiters();
    }

    /// Drop the axis back to the slow cadence and settle the cache with two
    /// bounded final reads. Read failures are logged and swallowed.
    pub async fn notify_operation_finished(&self, axis: u32) {
        self.active.lock().expect("active set poisoned").remove(&axis);

        let axis_param = vec![axis.to_string()];
        match self
            .controller
            .send_sync("RDP", &axis_param, FINAL_READ_TIMEOUT)
            .await
        {
            Ok(reply) => match reply.params.first().and_then(|p| p.trim().parse::<i64>().ok()) {
                Some(pos) => self.cache.update_position(axis, pos, &reply.raw),
                None => self.cache.update_raw(axis, &reply.raw),
            },
            Err(e) => warn!("final position read failed for axis {axis}: {e}"),
        }

        match self
            .controller
            .send_sync("STR", &axis_param, FINAL_READ_TIMEOUT)
            .await
        {
            Ok(reply) => {
                if let Some(status) = AxisStatus::from_params(&reply.params) {
                    self.cache.update_status(axis, status, &reply.raw);
                } else if let Some(drv) =
                    reply.params.first().and_then(|p| p.trim().parse::<i32>().ok())
                {
                    self.cache.update_running(axis, drv != 0, &reply.raw);
                } else {
                    self.cache.update_raw(axis, &reply.raw);
                }
            }
            Err(e) => warn!("final status read failed for axis {axis}: {e}"),
        }

        self.inflight.lock().expect("inflight poisoned").remove(&axis);
    }

    async fn run_loop(self: Arc<Self>) {
        debug!("poller loop started");
        while self.running.load(Ordering::SeqCst) {
            self.reap_completed();

            let axes = self.axes();
            let now = Instant::now();
            for axis in axes {
                let cadence = if self.active.lock().expect("active set poisoned").contains(&axis) {
                    self.fast_poll_interval
                } else {
                    self.poll_interval
                };
                let due = {
                    let last = self.last_scheduled.lock().expect("schedule poisoned");
                    last.get(&axis).map_or(true, |t| now - *t >= cadence)
                };
                if due {
                    self.schedule_read(axis);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(TICK) => {}
                _ = self.wake.notified() => {}
            }
        }
        self.reap_completed();
        debug!("poller loop stopped");
    }

    /// Issue one `RDP` for the axis unless a read is already in flight.
    fn schedule_read(&self, axis: u32) {
        let mut inflight = self.inflight.lock().expect("inflight poisoned");
        if inflight.contains_key(&axis) {
            return;
        }
        match self.controller.send_async("RDP", &[axis.to_string()]) {
            Ok(handle) => {
                inflight.insert(axis, handle);
                self.last_scheduled
                    .lock()
                    .expect("schedule poisoned")
                    .insert(axis, Instant::now());
            }
            Err(e) => debug!("poll read for axis {axis} not sent: {e}"),
        }
    }

    /// Harvest finished in-flight reads into the cache.
    fn reap_completed(&self) {
        let mut inflight = self.inflight.lock().expect("inflight poisoned");
        let mut finished: Vec<(u32, crate::error::AriesResult<crate::protocol::Reply>)> =
            Vec::new();
        inflight.retain(|axis, handle| match handle.try_take() {
            Some(result) => {
                finished.push((*axis, result));
                false
            }
            None => true,
        });
        drop(inflight);

        for (axis, result) in finished {
            match result {
                Ok(reply) => {
                    match reply.params.first().and_then(|p| p.trim().parse::<i64>().ok()) {
                        Some(pos) => self.cache.update_position(axis, pos, &reply.raw),
                        None => self.cache.update_raw(axis, &reply.raw),
                    }
                }
                Err(e) => debug!("poll read for axis {axis} failed: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfig;
    use crate::protocol::Dispatcher;
    use crate::transport::{LineTransport, TcpTransport};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    async fn poller_over_duplex(
        axes: Vec<u32>,
        slow: Duration,
        fast: Duration,
    ) -> (Arc<Poller>, Arc<StateCache>, tokio::io::DuplexStream) {
        let (remote, local) = tokio::io::duplex(4096);
        let transport = Arc::new(TcpTransport::with_stream(local));
        let dispatcher = Arc::new(Dispatcher::new());
        let controller = Arc::new(MotorController::new(
            transport.clone() as Arc<dyn LineTransport>,
            dispatcher,
            &DriverConfig::default(),
        ));
        controller.start();
        transport.start().await.unwrap();

        let cache = Arc::new(StateCache::new());
        let poller = Arc::new(Poller::new(
            controller,
            Arc::clone(&cache),
            axes,
            slow,
            fast,
        ));
        (poller, cache, remote)
    }

    #[tokio::test]
    async fn polls_axis_and_updates_cache() {
        let (poller, cache, remote) =
            poller_over_duplex(vec![1], Duration::from_millis(100), Duration::from_millis(20))
                .await;
        poller.start();

        // Echo every RDP with a fixed position.
        let responder = tokio::spawn(async move {
            let (rh, mut wh) = tokio::io::split(remote);
            let mut lines = BufReader::new(rh).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(axis) = line.strip_prefix("RDP\t") {
                    let reply = format!("C\tRDP{}\t1234\r\n", axis.trim());
                    if wh.write_all(reply.as_bytes()).await.is_err() {
                        break;
                    }
                }
            }
        });

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if cache.get(1).and_then(|s| s.position) == Some(1234) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("cache updated from poll read");

        poller.stop().await;
        responder.abort();
    }

    #[tokio::test]
    async fn at_most_one_read_in_flight_per_axis() {
        // Device never answers, so the first RDP stays in flight.
        let (poller, _cache, remote) =
            poller_over_duplex(vec![7], Duration::from_millis(30), Duration::from_millis(10))
                .await;
        poller.start();

        tokio::time::sleep(Duration::from_millis(300)).await;
        poller.stop().await;

        let (rh, _wh) = tokio::io::split(remote);
        let mut lines = BufReader::new(rh).lines();
        let mut sent = 0;
        while let Ok(Ok(Some(line))) =
            tokio::time::timeout(Duration::from_millis(50), lines.next_line()).await
        {
            assert_eq!(line, "RDP\t7");
            sent += 1;
        }
        assert_eq!(sent, 1, "poller must not pipeline reads for one axis");
    }

    #[tokio::test]
    async fn active_axes_poll_faster() {
        let (poller, _cache, remote) = poller_over_duplex(
            vec![2],
            Duration::from_millis(10_000),
            Duration::from_millis(30),
        )
        .await;
        poller.start();

        let reads = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let reads_clone = Arc::clone(&reads);
        let responder = tokio::spawn(async move {
            let (rh, mut wh) = tokio::io::split(remote);
            let mut lines = BufReader::new(rh).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.starts_with("RDP\t") {
                    let n = reads_clone.fetch_add(1, Ordering::SeqCst) + 1;
                    let reply = format!("C\tRDP2\t{n}\r\n");
                    if wh.write_all(reply.as_bytes()).await.is_err() {
                        break;
                    }
                }
            }
        });

        // First slow-cadence read fires immediately on start; afterwards the
        // axis would wait 10 s. Marking it active must produce more reads.
        tokio::time::sleep(Duration::from_millis(50)).await;
        poller.notify_operation_started(2);
        tokio::time::sleep(Duration::from_millis(300)).await;
        poller.stop().await;
        responder.abort();

        // At 30 ms cadence over 300 ms we expect several reads beyond the
        // initial one.
        assert!(
            reads.load(Ordering::SeqCst) > 2,
            "expected fast-cadence reads, got {}",
            reads.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn operation_finished_runs_final_reads() {
        let (poller, cache, remote) = poller_over_duplex(
            vec![1],
            Duration::from_millis(10_000),
            Duration::from_millis(10_000),
        )
        .await;
        // Poller not started: final reads are independent of the loop.

        let responder = tokio::spawn(async move {
            let (rh, mut wh) = tokio::io::split(remote);
            let mut lines = BufReader::new(rh).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let reply = if line.starts_with("RDP\t") {
                    "C\tRDP1\t1000\r\n".to_string()
                } else if line.starts_with("STR\t") {
                    "C\tSTR1\t0\t0\t0\t0\t0\t0\r\n".to_string()
                } else {
                    continue;
                };
                if wh.write_all(reply.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        poller.notify_operation_finished(1).await;

        let state = cache.get(1).expect("axis cached");
        assert_eq!(state.position, Some(1000));
        assert_eq!(state.running, Some(false));
        assert_eq!(state.status.unwrap().driving_state, 0);
        responder.abort();
    }

    #[tokio::test]
    async fn remove_axis_discards_tracking_state() {
        let (poller, _cache, _remote) =
            poller_over_duplex(vec![1, 2], Duration::from_millis(50), Duration::from_millis(10))
                .await;
        poller.notify_operation_started(2);
        poller.remove_axis(2);
        assert_eq!(poller.axes(), vec![1]);
        assert!(poller.inflight.lock().unwrap().get(&2).is_none());
        assert!(!poller.active.lock().unwrap().contains(&2));
    }
}
