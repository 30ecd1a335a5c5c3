//! Thread-safe last-known-state store for polled axes.
//!
//! The poller writes, user code reads via copy-out `get` / `snapshot`. Every
//! update refreshes the monotonic `updated_at` stamp so consumers can judge
//! freshness. The cache is deliberately never cleared on disconnect: stale
//! state plus its timestamp is more useful to an operator than no state.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

/// Detailed per-axis flags reported by the `STR` status read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AxisStatus {
    /// 0 = stopped, nonzero = driving.
    pub driving_state: i32,
    pub emg_signal: i32,
    pub org_norg_signal: i32,
    pub cw_ccw_limit_signal: i32,
    pub soft_limit_state: i32,
    pub correction_allowable_range: i32,
}

impl AxisStatus {
    /// Parse the six leading `STR` reply fields. Returns `None` when fewer
    /// than six fields are present or any fails to parse.
    pub fn from_params(params: &[String]) -> Option<Self> {
        if params.len() < 6 {
            return None;
        }
        let mut values = [0i32; 6];
        for (slot, param) in values.iter_mut().zip(params.iter()) {
            *slot = param.trim().parse().ok()?;
        }
        Some(Self {
            driving_state: values[0],
            emg_signal: values[1],
            org_norg_signal: values[2],
            cw_ccw_limit_signal: values[3],
            soft_limit_state: values[4],
            correction_allowable_range: values[5],
        })
    }
}

/// Last known state of one axis.
#[derive(Debug, Clone)]
pub struct AxisState {
    /// Absolute position in pulse units.
    pub position: Option<i64>,
    /// Derived from the driving-state field of the last `STR` reply.
    pub running: Option<bool>,
    /// Detailed status from the last full `STR` reply.
    pub status: Option<AxisStatus>,
    /// Raw line behind the most recent update.
    pub raw_last: String,
    /// Monotonic stamp of the most recent update.
    pub updated_at: Instant,
}

impl AxisState {
    fn new() -> Self {
        Self {
            position: None,
            running: None,
            status: None,
            raw_last: String::new(),
            updated_at: Instant::now(),
        }
    }
}

/// Map of axis number to [`AxisState`]; all operations take one brief lock.
#[derive(Default)]
pub struct StateCache {
    inner: Mutex<HashMap<u32, AxisState>>,
}

impl StateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_position(&self, axis: u32, position: i64, raw: &str) {
        self.update_entry(axis, |s| {
            s.position = Some(position);
            s.raw_last = raw.to_string();
        });
    }

    pub fn update_running(&self, axis: u32, running: bool, raw: &str) {
        self.update_entry(axis, |s| {
            s.running = Some(running);
            s.raw_last = raw.to_string();
        });
    }

    pub fn update_status(&self, axis: u32, status: AxisStatus, raw: &str) {
        self.update_entry(axis, |s| {
            s.running = Some(status.driving_state != 0);
            s.status = Some(status);
            s.raw_last = raw.to_string();
        });
    }

    /// Record a line that could not be parsed into a field update.
    pub fn update_raw(&self, axis: u32, raw: &str) {
        self.update_entry(axis, |s| {
            s.raw_last = raw.to_string();
        });
    }

    /// Combined updater for callers holding both fields.
    pub fn update(&self, axis: u32, position: Option<i64>, running: Option<bool>, raw: &str) {
        self.update_entry(axis, |s| {
            if position.is_some() {
                s.position = position;
            }
            if running.is_some() {
                s.running = running;
            }
            s.raw_last = raw.to_string();
        });
    }

    pub fn get(&self, axis: u32) -> Option<AxisState> {
        self.inner
            .lock()
            .expect("state cache poisoned")
            .get(&axis)
            .cloned()
    }

    pub fn snapshot(&self) -> HashMap<u32, AxisState> {
        self.inner.lock().expect("state cache poisoned").clone()
    }

    fn update_entry(&self, axis: u32, apply: impl FnOnce(&mut AxisState)) {
        let mut inner = self.inner.lock().expect("state cache poisoned");
        let entry = inner.entry(axis).or_insert_with(AxisState::new);
        apply(entry);
        entry.updated_at = Instant::now();
    }
}
