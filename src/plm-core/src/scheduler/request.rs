// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Global request scheduler.
//!
//! Holds at most one entry per device that has pending work and services the
//! devices in time order from a single worker task, which is the only place
//! that writes to the transport.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, trace, warn};

use crate::address::DeviceAddress;
use crate::device::Device;
use crate::transport::Transport;

/// Devices ordered by their next service time.
#[derive(Debug)]
pub struct RequestSchedule<T> {
    entries: BTreeMap<(Instant, DeviceAddress), T>,
    index: HashMap<DeviceAddress, Instant>,
}

impl<T> Default for RequestSchedule<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RequestSchedule<T> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            index: HashMap::new(),
        }
    }

    /// Add `address` at `at`, or move its entry earlier.
    ///
    /// An entry that is already due sooner is left alone. Returns true if the
    /// schedule changed.
    pub fn schedule(&mut self, address: DeviceAddress, item: T, at: Instant) -> bool {
        if let Some(&current) = self.index.get(&address) {
            if current <= at {
                return false;
            }
            self.entries.remove(&(current, address));
        }
        self.index.insert(address, at);
        self.entries.insert((at, address), item);
        true
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|(at, _)| *at)
    }

    /// Remove the earliest entry if it is due at `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<(DeviceAddress, T)> {
        let &(at, address) = self.entries.keys().next()?;
        if at > now {
            return None;
        }
        let item = self.entries.remove(&(at, address))?;
        self.index.remove(&address);
        Some((address, item))
    }

    pub fn remove(&mut self, address: DeviceAddress) -> Option<T> {
        let at = self.index.remove(&address)?;
        self.entries.remove(&(at, address))
    }

    pub fn scheduled_at(&self, address: DeviceAddress) -> Option<Instant> {
        self.index.get(&address).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }
}

struct RequestState {
    schedule: RequestSchedule<Arc<Device>>,
    paused: bool,
    stopped: bool,
}

struct Shared {
    state: Mutex<RequestState>,
    wake: Notify,
}

enum Step {
    Service(Arc<Device>),
    Wait(Option<Instant>),
    Exit,
}

/// Handle to the request schedule; clones share the same worker.
#[derive(Clone)]
pub struct RequestScheduler {
    shared: Arc<Shared>,
}

impl Default for RequestScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestScheduler {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(RequestState {
                    schedule: RequestSchedule::new(),
                    paused: false,
                    stopped: false,
                }),
                wake: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RequestState> {
        self.shared
            .state
            .lock()
            .expect("request scheduler mutex poisoned")
    }

    /// Ask for `device` to be serviced no later than `delay` from now.
    pub fn schedule(&self, device: Arc<Device>, delay: Duration) {
        let at = Instant::now() + delay;
        let address = device.address();
        let changed = {
            let mut state = self.lock();
            if state.stopped {
                return;
            }
            state.schedule.schedule(address, device, at)
        };
        if changed {
            trace!("{} scheduled in {} ms", address, delay.as_millis());
            self.shared.wake.notify_one();
        }
    }

    /// Drop the entry for `address`, if any.
    pub fn unschedule(&self, address: DeviceAddress) -> bool {
        self.lock().schedule.remove(address).is_some()
    }

    pub fn is_scheduled(&self, address: DeviceAddress) -> bool {
        self.lock().schedule.scheduled_at(address).is_some()
    }

    /// Stop servicing devices until [`resume`](Self::resume); entries are kept.
    pub fn pause(&self) {
        self.lock().paused = true;
        info!("request scheduler paused");
    }

    pub fn resume(&self) {
        self.lock().paused = false;
        info!("request scheduler resumed");
        self.shared.wake.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    /// Make the worker exit and drop every entry.
    pub fn stop(&self) {
        {
            let mut state = self.lock();
            state.stopped = true;
            state.schedule.clear();
        }
        self.shared.wake.notify_one();
    }

    pub fn len(&self) -> usize {
        self.lock().schedule.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn the worker that owns `transport`.
    pub fn start(&self, transport: Box<dyn Transport>) -> JoinHandle<()> {
        tokio::spawn(run_request_worker(self.clone(), transport))
    }

    fn next_step(&self, now: Instant) -> Step {
        let mut state = self.lock();
        if state.stopped {
            return Step::Exit;
        }
        if state.paused {
            return Step::Wait(None);
        }
        match state.schedule.pop_due(now) {
            Some((_, device)) => Step::Service(device),
            None => Step::Wait(state.schedule.next_deadline()),
        }
    }

    fn reschedule(&self, device: Arc<Device>, at: Instant) {
        let mut state = self.lock();
        if state.stopped {
            return;
        }
        let address = device.address();
        state.schedule.schedule(address, device, at);
    }

    async fn wait(&self, deadline: Option<Instant>) {
        match deadline {
            Some(at) => {
                tokio::select! {
                    _ = time::sleep_until(at) => {}
                    _ = self.shared.wake.notified() => {}
                }
            }
            None => self.shared.wake.notified().await,
        }
    }
}

async fn run_request_worker(scheduler: RequestScheduler, mut transport: Box<dyn Transport>) {
    info!("request worker started ({})", transport.name());
    loop {
        match scheduler.next_step(Instant::now()) {
            Step::Exit => break,
            Step::Wait(deadline) => scheduler.wait(deadline).await,
            Step::Service(device) => {
                let now = Instant::now();
                let dispatch = device.service_next(now);
                if let Some(msg) = &dispatch.msg {
                    debug!("writing {}", msg);
                    if let Err(e) = transport.write(msg).await {
                        warn!("message write failed for {}: {}", msg, e);
                    }
                }
                match dispatch.next {
                    Some(wait) => scheduler.reschedule(device, now + wait),
                    None => trace!("{} request queue drained", device.address()),
                }
            }
        }
    }
    info!("request worker stopped");
}
