// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! A device on the network and the request queue it owns.

pub mod group;
pub mod query;
pub mod queue;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::address::DeviceAddress;
use crate::feature::{DeviceFeature, FeatureId, QueryStatus};
use crate::message::{Msg, MsgType};
use crate::scheduler::RequestScheduler;

use self::group::{BroadcastStates, GroupStates};
use self::query::{QueryTracker, SlotCheck};
use self::queue::{PendingRequest, RequestQueue};

/// How long a battery device listens after its last message.
pub const AWAKE_TIME: Duration = Duration::from_millis(3_000);
/// Listening window while the device's stay-awake flag is on.
pub const STAY_AWAKE_TIME: Duration = Duration::from_millis(240_000);

/// Outcome of one service pass over a device's queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    /// Message to write, if one was taken off the queue.
    pub msg: Option<Msg>,
    /// When to service the device again; `None` drops it from the schedule.
    pub next: Option<Duration>,
}

impl Dispatch {
    fn idle() -> Self {
        Self {
            msg: None,
            next: None,
        }
    }

    fn retry(wait: Duration) -> Self {
        Self {
            msg: None,
            next: Some(wait),
        }
    }
}

/// What the driver should do with an incoming message after the device saw it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Incoming {
    /// Not a duplicate; hand it to listeners.
    pub publish: bool,
    /// Feature whose query this message completed.
    pub answered: Option<FeatureId>,
}

struct DeviceQueues {
    requests: RequestQueue,
    deferred: RequestQueue,
    query: QueryTracker,
}

#[derive(Default)]
struct DedupStates {
    groups: GroupStates,
    broadcasts: BroadcastStates,
}

pub struct Device {
    address: DeviceAddress,
    features: Vec<DeviceFeature>,
    battery_powered: bool,
    scheduler: RequestScheduler,
    queues: Mutex<DeviceQueues>,
    dedup: Mutex<DedupStates>,
    last_msg_received: Mutex<Instant>,
    stay_awake: AtomicBool,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("address", &self.address)
            .field("features", &self.features.len())
            .field("battery_powered", &self.battery_powered)
            .finish()
    }
}

impl Device {
    pub fn new(
        address: DeviceAddress,
        features: Vec<DeviceFeature>,
        battery_powered: bool,
        scheduler: RequestScheduler,
    ) -> Self {
        let statuses = features.iter().map(DeviceFeature::initial_status).collect();
        Self {
            address,
            features,
            battery_powered,
            scheduler,
            queues: Mutex::new(DeviceQueues {
                requests: RequestQueue::new(),
                deferred: RequestQueue::new(),
                query: QueryTracker::new(statuses),
            }),
            dedup: Mutex::new(DedupStates::default()),
            last_msg_received: Mutex::new(Instant::now()),
            stay_awake: AtomicBool::new(false),
        }
    }

    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    pub fn features(&self) -> &[DeviceFeature] {
        &self.features
    }

    pub fn feature(&self, id: FeatureId) -> Option<&DeviceFeature> {
        self.features.get(id.0)
    }

    pub fn feature_id(&self, name: &str) -> Option<FeatureId> {
        self.features
            .iter()
            .position(|f| f.name() == name)
            .map(FeatureId)
    }

    pub fn is_battery_powered(&self) -> bool {
        self.battery_powered
    }

    /// Only mains-powered devices with features are polled; battery devices
    /// are asleep most of the time and report on their own.
    pub fn is_pollable(&self) -> bool {
        !self.features.is_empty() && !self.battery_powered
    }

    pub fn set_stay_awake(&self, on: bool) {
        self.stay_awake.store(on, Ordering::Relaxed);
    }

    fn queues(&self) -> MutexGuard<'_, DeviceQueues> {
        self.queues.lock().expect("device queue mutex poisoned")
    }

    /// Mains-powered devices are always awake; battery devices only listen
    /// for a short window after they last spoke.
    pub fn is_awake(&self, now: Instant) -> bool {
        if !self.battery_powered {
            return true;
        }
        let window = if self.stay_awake.load(Ordering::Relaxed) {
            STAY_AWAKE_TIME
        } else {
            AWAKE_TIME
        };
        let last = *self
            .last_msg_received
            .lock()
            .expect("device clock mutex poisoned");
        now.saturating_duration_since(last) <= window
    }

    pub fn query_status(&self, feature: FeatureId) -> Option<QueryStatus> {
        self.queues().query.status(feature)
    }

    /// Name of the feature that owns the query slot.
    pub fn feature_queried(&self) -> Option<&str> {
        let id = self.queues().query.feature_queried()?;
        self.feature(id).map(DeviceFeature::name)
    }

    pub fn pending_requests(&self) -> usize {
        self.queues().requests.len()
    }

    pub fn deferred_requests(&self) -> usize {
        self.queues().deferred.len()
    }

    /// Queue `msg` for `feature`, to go out no sooner than `delay` from now.
    ///
    /// A pending request with the same feature and message is replaced.
    pub fn enqueue(self: &Arc<Self>, msg: Msg, feature: FeatureId, delay: Duration) {
        if self.feature(feature).is_none() {
            warn!("{}: enqueue for unknown feature {}", self.address, feature);
            return;
        }
        let now = Instant::now();
        let request = PendingRequest::new(feature, msg, now + delay);
        let direct = !request.msg.is_broadcast();

        if direct && !self.is_awake(now) {
            trace!("{}: deferring request for sleeping device", self.address);
            if self.queues().deferred.push(request) {
                trace!("{}: overwrote deferred request", self.address);
            }
            return;
        }

        {
            let mut queues = self.queues();
            if queues.requests.push(request) {
                trace!("{}: overwrote pending request", self.address);
            }
            if direct {
                queues.query.mark_scheduled(feature);
            }
        }
        trace!("{}: enqueued request with delay {} ms", self.address, delay.as_millis());
        self.scheduler.schedule(Arc::clone(self), delay);
    }

    /// Move every deferred request onto the request queue, due after `delay`.
    pub fn process_deferred(self: &Arc<Self>, delay: Duration) -> usize {
        let expires_at = Instant::now() + delay;
        let moved = {
            let mut queues = self.queues();
            let deferred = queues.deferred.drain();
            let moved = deferred.len();
            for mut request in deferred {
                request.expires_at = expires_at;
                if !request.msg.is_broadcast() {
                    queues.query.mark_scheduled(request.feature);
                }
                queues.requests.push(request);
            }
            moved
        };
        if moved > 0 {
            debug!("{}: replaying {} deferred requests", self.address, moved);
            self.scheduler.schedule(Arc::clone(self), delay);
        }
        moved
    }

    /// Pick the next request to transmit.
    ///
    /// Called only by the request scheduler's worker, which performs the
    /// write after this returns.
    pub fn service_next(&self, now: Instant) -> Dispatch {
        let mut queues = self.queues();
        if queues.requests.is_empty() {
            return Dispatch::idle();
        }

        match queues.query.check(now) {
            SlotCheck::Free => {}
            SlotCheck::Busy(wait) => {
                trace!("{}: query in flight, retry in {} ms", self.address, wait.as_millis());
                return Dispatch::retry(wait);
            }
            SlotCheck::Abandoned(id) => {
                debug!("{}: gave up waiting for {} query", self.address, self.feature_name(id));
            }
        }

        match queues.requests.next_expiration() {
            Some(at) if at > now => return Dispatch::retry(at - now),
            Some(_) => {}
            None => return Dispatch::idle(),
        }
        let Some(request) = queues.requests.pop() else {
            return Dispatch::idle();
        };

        if request.msg.is_broadcast() {
            debug!("{}: request taken off bcast: {}", self.address, request.msg);
        } else {
            debug!(
                "{}: request taken off direct: {} {}",
                self.address,
                self.feature_name(request.feature),
                request.msg
            );
            queues.query.begin(request.feature, request.msg.key(), now);
        }

        let ready = now + request.msg.quiet_time();
        let next = match queues.requests.next_expiration() {
            Some(at) => ready.max(at),
            None => ready,
        };
        Dispatch {
            msg: Some(request.msg),
            next: Some(next - now),
        }
    }

    /// The modem reported `msg` on the wire at `at`.
    pub fn on_sent(&self, msg: &Msg, at: Instant) {
        if self.queues().query.on_sent(&msg.key(), at) {
            debug!("{}: query sent: {}", self.address, msg);
        }
    }

    /// Process a message received from this device.
    pub fn handle_message(self: &Arc<Self>, msg: &Msg, now: Instant) -> Incoming {
        *self
            .last_msg_received
            .lock()
            .expect("device clock mutex poisoned") = now;

        if self.battery_powered && self.deferred_requests() > 0 {
            self.process_deferred(Duration::ZERO);
        }

        let answered = self.match_reply(msg);
        let publish = self.is_new(msg, now);
        if !publish {
            trace!("{}: suppressed duplicate {}", self.address, msg);
        }
        Incoming { publish, answered }
    }

    fn match_reply(&self, msg: &Msg) -> Option<FeatureId> {
        let mut queues = self.queues();
        if msg.is_reply() {
            let ack = msg.is_ack_of_direct();
            let replied = queues.query.on_replied(msg.cmd1, ack)?;
            if !ack {
                debug!("{}: {} query refused", self.address, self.feature_name(replied));
                return Some(replied);
            }
        }

        let (id, key) = queues.query.pending_query()?;
        let feature = self.feature(id)?;
        if !feature.is_answer(msg, key) {
            return None;
        }
        if queues.query.on_answered(id) {
            debug!("{}: {} query answered", self.address, feature.name());
            Some(id)
        } else {
            None
        }
    }

    fn is_new(&self, msg: &Msg, now: Instant) -> bool {
        let mut dedup = self.dedup.lock().expect("device dedup mutex poisoned");
        if let Some((group, kind)) = msg.group_kind() {
            dedup.groups.evaluate(group, kind, msg.cmd1, now)
        } else if msg.msg_type == MsgType::Broadcast {
            dedup.broadcasts.evaluate(msg.cmd1, now)
        } else {
            true
        }
    }

    /// Enqueue a poll of every feature that needs one; returns how many
    /// requests were enqueued.
    ///
    /// Features are spaced by the quiet time of the message before them. If
    /// nothing needed polling the device is pinged instead.
    pub fn do_poll(self: &Arc<Self>, delay: Duration) -> usize {
        if self.deferred_requests() > 0 && self.is_awake(Instant::now()) {
            self.process_deferred(delay);
        }

        let mut spacing = Duration::ZERO;
        let mut enqueued = 0;
        for (idx, feature) in self.features.iter().enumerate() {
            let id = FeatureId(idx);
            if !feature.is_pollable() {
                continue;
            }
            if !feature.poll_always() && self.query_status(id) != Some(QueryStatus::NeverQueried) {
                continue;
            }
            if let Some(msg) = feature.poll_msg(self.address) {
                let quiet = msg.quiet_time();
                self.enqueue(msg, id, delay + spacing);
                spacing += quiet;
                enqueued += 1;
            }
        }

        if enqueued == 0 {
            if let Some(idx) = self.features.iter().position(DeviceFeature::is_ping) {
                if self.poll_feature_id(FeatureId(idx), delay) {
                    enqueued = 1;
                }
            }
        }
        enqueued
    }

    /// Poll a single feature by name.
    pub fn poll_feature(self: &Arc<Self>, name: &str, delay: Duration) -> bool {
        match self.feature_id(name) {
            Some(id) => self.poll_feature_id(id, delay),
            None => {
                warn!("{}: no feature named {}", self.address, name);
                false
            }
        }
    }

    fn poll_feature_id(self: &Arc<Self>, id: FeatureId, delay: Duration) -> bool {
        let Some(msg) = self.feature(id).and_then(|f| f.poll_msg(self.address)) else {
            return false;
        };
        self.enqueue(msg, id, delay);
        true
    }

    /// Drop every pending and deferred request and release the query slot.
    pub fn clear_queues(&self) {
        let mut queues = self.queues();
        trace!("{}: clearing request queues", self.address);
        queues.requests.clear();
        queues.deferred.clear();
        queues.query.reset();
    }

    fn feature_name(&self, id: FeatureId) -> &str {
        self.feature(id).map(DeviceFeature::name).unwrap_or("?")
    }
}
