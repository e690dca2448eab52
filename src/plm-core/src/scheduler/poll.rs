// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Periodic poll scheduler.
//!
//! Fires each polled device once per interval and keeps every pair of poll
//! firings on the network at least `min_spacing` apart. A firing only
//! enqueues requests; the request scheduler does the writing.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, trace};

use crate::address::DeviceAddress;
use crate::device::Device;

/// Default minimum gap between any two poll firings.
pub const MIN_POLL_SPACING: Duration = Duration::from_millis(2_000);

#[derive(Debug, Clone)]
pub struct PollEntry<T> {
    pub address: DeviceAddress,
    pub item: T,
    pub interval: Duration,
    pub at: Instant,
}

/// Poll entries ordered by firing time.
#[derive(Debug)]
pub struct PollQueue<T> {
    entries: BTreeMap<(Instant, u64), PollEntry<T>>,
    min_spacing: Duration,
    seq: u64,
}

impl<T> PollQueue<T> {
    pub fn new(min_spacing: Duration) -> Self {
        Self {
            entries: BTreeMap::new(),
            min_spacing,
            seq: 0,
        }
    }

    pub fn min_spacing(&self) -> Duration {
        self.min_spacing
    }

    /// Pick a firing time near `desired` that keeps `min_spacing` to every
    /// existing entry.
    pub fn place(&self, desired: Instant) -> Instant {
        let min = self.min_spacing;
        let mut tail = match desired.checked_sub(min) {
            Some(lower) => self
                .entries
                .range((lower, 0)..)
                .map(|((at, _), _)| *at)
                .collect::<Vec<_>>()
                .into_iter(),
            None => self
                .entries
                .keys()
                .map(|(at, _)| *at)
                .collect::<Vec<_>>()
                .into_iter(),
        };

        let Some(first) = tail.next() else {
            return desired;
        };
        if first > desired + min {
            return desired;
        }
        let mut prev = first;
        for next in tail {
            if next.saturating_duration_since(prev) >= min * 2 {
                return prev + min;
            }
            prev = next;
        }
        prev + min
    }

    /// Place and insert an entry; returns the firing time it got.
    pub fn insert(
        &mut self,
        address: DeviceAddress,
        item: T,
        interval: Duration,
        desired: Instant,
    ) -> Instant {
        let at = self.place(desired);
        self.seq += 1;
        self.entries.insert(
            (at, self.seq),
            PollEntry {
                address,
                item,
                interval,
                at,
            },
        );
        at
    }

    /// Remove every entry for `address`; returns how many were removed.
    pub fn remove(&mut self, address: DeviceAddress) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.address != address);
        before - self.entries.len()
    }

    pub fn contains(&self, address: DeviceAddress) -> bool {
        self.entries.values().any(|entry| entry.address == address)
    }

    pub fn pop_due(&mut self, now: Instant) -> Option<PollEntry<T>> {
        let (at, _) = *self.entries.keys().next()?;
        if at > now {
            return None;
        }
        self.entries.pop_first().map(|(_, entry)| entry)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|(at, _)| *at)
    }

    /// Firing times in order.
    pub fn times(&self) -> Vec<Instant> {
        self.entries.keys().map(|(at, _)| *at).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Delay before a device's first poll, spreading devices over one interval.
pub fn stagger_delay(interval: Duration, queue_len: usize, device_count: usize) -> Duration {
    let slots = u32::try_from(queue_len).unwrap_or(u32::MAX);
    let devices = u32::try_from(device_count.max(1)).unwrap_or(u32::MAX);
    interval
        .checked_mul(slots)
        .map(|total| total / devices)
        .unwrap_or(interval)
}

struct PollState {
    queue: PollQueue<Arc<Device>>,
    active: HashSet<DeviceAddress>,
    stopped: bool,
}

struct Shared {
    state: Mutex<PollState>,
    wake: Notify,
}

enum Step {
    Poll(PollEntry<Arc<Device>>),
    Wait(Option<Instant>),
    Exit,
}

#[derive(Clone)]
pub struct PollScheduler {
    shared: Arc<Shared>,
}

impl Default for PollScheduler {
    fn default() -> Self {
        Self::new(MIN_POLL_SPACING)
    }
}

impl PollScheduler {
    pub fn new(min_spacing: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PollState {
                    queue: PollQueue::new(min_spacing),
                    active: HashSet::new(),
                    stopped: false,
                }),
                wake: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PollState> {
        self.shared
            .state
            .lock()
            .expect("poll scheduler mutex poisoned")
    }

    /// Start polling `device` every `interval`.
    ///
    /// Returns the first firing time, or `None` once the scheduler is stopped.
    pub fn start_polling(
        &self,
        device: Arc<Device>,
        interval: Duration,
        device_count: usize,
    ) -> Option<Instant> {
        let now = Instant::now();
        let address = device.address();
        let at = {
            let mut state = self.lock();
            if state.stopped {
                return None;
            }
            state.queue.remove(address);
            let delay = stagger_delay(interval, state.queue.len(), device_count);
            state.active.insert(address);
            let at = state.queue.insert(address, device, interval, now + delay);
            debug!(
                "polling {} every {} ms, first in {} ms",
                address,
                interval.as_millis(),
                at.saturating_duration_since(now).as_millis()
            );
            at
        };
        self.shared.wake.notify_one();
        Some(at)
    }

    pub fn stop_polling(&self, address: DeviceAddress) -> bool {
        let mut state = self.lock();
        let was_active = state.active.remove(&address);
        state.queue.remove(address);
        if was_active {
            debug!("stopped polling {}", address);
        }
        was_active
    }

    pub fn is_polling(&self, address: DeviceAddress) -> bool {
        self.lock().active.contains(&address)
    }

    pub fn queue_size(&self) -> usize {
        self.lock().queue.len()
    }

    /// Firing times currently queued, in order.
    pub fn scheduled_times(&self) -> Vec<Instant> {
        self.lock().queue.times()
    }

    pub fn start(&self) -> JoinHandle<()> {
        tokio::spawn(run_poll_worker(self.clone()))
    }

    pub fn stop(&self) {
        {
            let mut state = self.lock();
            state.stopped = true;
            state.queue.clear();
            state.active.clear();
        }
        self.shared.wake.notify_one();
    }

    fn next_step(&self, now: Instant) -> Step {
        let mut state = self.lock();
        if state.stopped {
            return Step::Exit;
        }
        match state.queue.pop_due(now) {
            Some(entry) => Step::Poll(entry),
            None => Step::Wait(state.queue.next_deadline()),
        }
    }

    fn reinsert(&self, entry: PollEntry<Arc<Device>>) {
        let now = Instant::now();
        let mut state = self.lock();
        if state.stopped || !state.active.contains(&entry.address) {
            return;
        }
        // Restarted while this firing was running.
        if state.queue.contains(entry.address) {
            return;
        }
        let at = state
            .queue
            .insert(entry.address, entry.item, entry.interval, now + entry.interval);
        trace!(
            "next poll of {} in {} ms",
            entry.address,
            at.saturating_duration_since(now).as_millis()
        );
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

async fn run_poll_worker(scheduler: PollScheduler) {
    info!("poll worker started");
    loop {
        match scheduler.next_step(Instant::now()) {
            Step::Exit => break,
            Step::Wait(deadline) => scheduler.wait(deadline).await,
            Step::Poll(entry) => {
                trace!("polling {}", entry.address);
                let enqueued = entry.item.do_poll(Duration::ZERO);
                trace!("{} poll requests for {}", enqueued, entry.address);
                scheduler.reinsert(entry);
            }
        }
    }
    info!("poll worker stopped");
}
