// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Single-slot query state machine.
//!
//! A device has at most one direct query in flight. The slot records which
//! feature owns it and when it was queued and sent; per-feature statuses
//! stay readable for diagnostics after the slot is released.
//!
//! ```text
//! NEVER_QUERIED -> SCHEDULED -> QUEUED -> SENT -> ACKED -> ANSWERED
//!                                 |         |       |
//!                                 +---------+-------+--> NEVER_QUERIED (timeout)
//! ```

use std::time::Duration;

use tokio::time::Instant;

use crate::feature::{FeatureId, QueryStatus};
use crate::message::MsgKey;

/// Abandon a query still unsent this long after it was queued.
pub const QUEUED_TIMEOUT: Duration = Duration::from_millis(30_000);
/// Abandon a sent query with no ack or answer after this long.
pub const DIRECT_ACK_TIMEOUT: Duration = Duration::from_millis(6_000);
/// Recheck interval while waiting for a queued query to go out.
pub const QUEUED_RETRY: Duration = Duration::from_millis(1_000);
/// Recheck interval while waiting for a reply.
pub const REPLY_RETRY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
struct QuerySlot {
    feature: FeatureId,
    key: MsgKey,
    queued_at: Instant,
    sent_at: Option<Instant>,
}

/// Result of inspecting the query slot before dequeuing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotCheck {
    /// Nothing in flight.
    Free,
    /// A query is still in flight; look again after this long.
    Busy(Duration),
    /// The query in flight timed out and was released.
    Abandoned(FeatureId),
}

#[derive(Debug)]
pub struct QueryTracker {
    statuses: Vec<QueryStatus>,
    slot: Option<QuerySlot>,
}

impl QueryTracker {
    pub fn new(initial: Vec<QueryStatus>) -> Self {
        Self {
            statuses: initial,
            slot: None,
        }
    }

    pub fn status(&self, feature: FeatureId) -> Option<QueryStatus> {
        self.statuses.get(feature.0).copied()
    }

    pub fn feature_queried(&self) -> Option<FeatureId> {
        self.slot.as_ref().map(|s| s.feature)
    }

    pub fn pending_query(&self) -> Option<(FeatureId, &MsgKey)> {
        self.slot.as_ref().map(|s| (s.feature, &s.key))
    }

    fn set_status(&mut self, feature: FeatureId, status: QueryStatus) {
        if let Some(slot) = self.statuses.get_mut(feature.0) {
            *slot = status;
        }
    }

    /// A direct request for `feature` was enqueued.
    pub fn mark_scheduled(&mut self, feature: FeatureId) {
        if self.feature_queried() == Some(feature) {
            return;
        }
        if self.status(feature) == Some(QueryStatus::NotPollable) {
            return;
        }
        self.set_status(feature, QueryStatus::Scheduled);
    }

    /// Inspect the slot at `now`, releasing it if the query timed out or
    /// already completed.
    pub fn check(&mut self, now: Instant) -> SlotCheck {
        let Some(slot) = self.slot.as_ref() else {
            return SlotCheck::Free;
        };
        let feature = slot.feature;
        match self.status(feature) {
            Some(QueryStatus::Queued) => {
                if now.saturating_duration_since(slot.queued_at) > QUEUED_TIMEOUT {
                    self.abandon(feature)
                } else {
                    SlotCheck::Busy(QUEUED_RETRY)
                }
            }
            Some(QueryStatus::Sent | QueryStatus::Acked) => {
                let sent_at = slot.sent_at.unwrap_or(slot.queued_at);
                if now.saturating_duration_since(sent_at) > DIRECT_ACK_TIMEOUT {
                    self.abandon(feature)
                } else {
                    SlotCheck::Busy(REPLY_RETRY)
                }
            }
            _ => {
                // Answered between the reply and this check, or reset elsewhere.
                self.slot = None;
                SlotCheck::Free
            }
        }
    }

    fn abandon(&mut self, feature: FeatureId) -> SlotCheck {
        self.set_status(feature, QueryStatus::NeverQueried);
        self.slot = None;
        SlotCheck::Abandoned(feature)
    }

    /// A direct request was taken off the queue for transmission.
    pub fn begin(&mut self, feature: FeatureId, key: MsgKey, now: Instant) {
        self.set_status(feature, QueryStatus::Queued);
        self.slot = Some(QuerySlot {
            feature,
            key,
            queued_at: now,
            sent_at: None,
        });
    }

    /// The transport confirmed `key` went out at `at`.
    pub fn on_sent(&mut self, key: &MsgKey, at: Instant) -> bool {
        let Some(slot) = self.slot.as_mut() else {
            return false;
        };
        if &slot.key != key || self.statuses.get(slot.feature.0) != Some(&QueryStatus::Queued) {
            return false;
        }
        slot.sent_at = Some(at);
        let feature = slot.feature;
        self.set_status(feature, QueryStatus::Sent);
        true
    }

    /// The device acknowledged (or refused) a direct message with `cmd1`.
    ///
    /// Replies echo the command byte; one that doesn't match the query in
    /// flight belongs to an earlier, abandoned query and is ignored.
    pub fn on_replied(&mut self, cmd1: u8, ack: bool) -> Option<FeatureId> {
        let slot = self.slot.as_ref()?;
        if slot.key.cmd1 != cmd1 {
            return None;
        }
        let feature = slot.feature;
        match (self.status(feature), ack) {
            (Some(QueryStatus::Sent), true) => {
                self.set_status(feature, QueryStatus::Acked);
                Some(feature)
            }
            (Some(QueryStatus::Sent | QueryStatus::Acked), false) => {
                self.complete(feature);
                Some(feature)
            }
            _ => None,
        }
    }

    /// `feature` recognized an incoming message as the answer to its query.
    pub fn on_answered(&mut self, feature: FeatureId) -> bool {
        if self.feature_queried() != Some(feature) {
            return false;
        }
        if !matches!(
            self.status(feature),
            Some(QueryStatus::Sent | QueryStatus::Acked)
        ) {
            return false;
        }
        self.complete(feature);
        true
    }

    fn complete(&mut self, feature: FeatureId) {
        self.set_status(feature, QueryStatus::Answered);
        self.slot = None;
    }

    /// Drop the slot and return every feature to its idle status.
    pub fn reset(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.set_status(slot.feature, QueryStatus::NeverQueried);
        }
        for status in &mut self.statuses {
            if *status == QueryStatus::Scheduled {
                *status = QueryStatus::NeverQueried;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::DeviceAddress;
    use crate::message::Msg;

    const DEV: DeviceAddress = DeviceAddress::new(0x12, 0x34, 0x56);

    fn tracker() -> QueryTracker {
        QueryTracker::new(vec![QueryStatus::NeverQueried, QueryStatus::NeverQueried])
    }

    fn key() -> MsgKey {
        Msg::direct(DEV, 0x19, 0x00).key()
    }

    #[test]
    fn test_full_cycle() {
        let t0 = Instant::now();
        let mut q = tracker();
        let f = FeatureId(0);

        q.mark_scheduled(f);
        assert_eq!(q.status(f), Some(QueryStatus::Scheduled));

        q.begin(f, key(), t0);
        assert_eq!(q.status(f), Some(QueryStatus::Queued));
        assert_eq!(q.feature_queried(), Some(f));

        assert!(q.on_sent(&key(), t0 + Duration::from_millis(50)));
        assert_eq!(q.status(f), Some(QueryStatus::Sent));

        assert_eq!(q.on_replied(0x19, true), Some(f));
        assert_eq!(q.status(f), Some(QueryStatus::Acked));

        assert!(q.on_answered(f));
        assert_eq!(q.status(f), Some(QueryStatus::Answered));
        assert_eq!(q.feature_queried(), None);
        assert_eq!(q.check(t0), SlotCheck::Free);
    }

    #[test]
    fn test_sent_ignores_other_messages() {
        let t0 = Instant::now();
        let mut q = tracker();
        q.begin(FeatureId(0), key(), t0);
        assert!(!q.on_sent(&Msg::direct(DEV, 0x0f, 0x00).key(), t0));
        assert_eq!(q.status(FeatureId(0)), Some(QueryStatus::Queued));
    }

    #[test]
    fn test_queued_timeout_boundary() {
        let t0 = Instant::now();
        let mut q = tracker();
        let f = FeatureId(1);
        q.begin(f, key(), t0);

        assert_eq!(q.check(t0 + Duration::from_millis(29_999)), SlotCheck::Busy(QUEUED_RETRY));
        assert_eq!(q.check(t0 + QUEUED_TIMEOUT), SlotCheck::Busy(QUEUED_RETRY));
        assert_eq!(q.status(f), Some(QueryStatus::Queued));

        assert_eq!(
            q.check(t0 + QUEUED_TIMEOUT + Duration::from_millis(1)),
            SlotCheck::Abandoned(f)
        );
        assert_eq!(q.status(f), Some(QueryStatus::NeverQueried));
        assert_eq!(q.feature_queried(), None);
    }

    #[test]
    fn test_reply_timeout_measured_from_send() {
        let t0 = Instant::now();
        let sent = t0 + Duration::from_millis(20_000);
        let mut q = tracker();
        let f = FeatureId(0);
        q.begin(f, key(), t0);
        q.on_sent(&key(), sent);

        assert_eq!(q.check(sent + Duration::from_millis(5_000)), SlotCheck::Busy(REPLY_RETRY));
        q.on_replied(0x19, true);
        assert_eq!(q.check(sent + DIRECT_ACK_TIMEOUT), SlotCheck::Busy(REPLY_RETRY));
        assert_eq!(
            q.check(sent + DIRECT_ACK_TIMEOUT + Duration::from_millis(1)),
            SlotCheck::Abandoned(f)
        );
        assert_eq!(q.status(f), Some(QueryStatus::NeverQueried));
    }

    #[test]
    fn test_nack_completes_query() {
        let t0 = Instant::now();
        let mut q = tracker();
        let f = FeatureId(0);
        q.begin(f, key(), t0);
        q.on_sent(&key(), t0);
        assert_eq!(q.on_replied(0x19, false), Some(f));
        assert_eq!(q.status(f), Some(QueryStatus::Answered));
        assert_eq!(q.feature_queried(), None);
    }

    #[test]
    fn test_reply_to_other_command_ignored() {
        let t0 = Instant::now();
        let mut q = tracker();
        let f = FeatureId(0);
        q.begin(f, key(), t0);
        q.on_sent(&key(), t0);

        assert_eq!(q.on_replied(0x0f, true), None);
        assert_eq!(q.on_replied(0x0f, false), None);
        assert_eq!(q.status(f), Some(QueryStatus::Sent));
        assert_eq!(q.feature_queried(), Some(f));
    }

    #[test]
    fn test_answer_from_other_feature_ignored() {
        let t0 = Instant::now();
        let mut q = tracker();
        q.begin(FeatureId(0), key(), t0);
        q.on_sent(&key(), t0);
        assert!(!q.on_answered(FeatureId(1)));
        assert_eq!(q.feature_queried(), Some(FeatureId(0)));
    }

    #[test]
    fn test_schedule_does_not_disturb_owner() {
        let t0 = Instant::now();
        let mut q = tracker();
        let f = FeatureId(0);
        q.begin(f, key(), t0);
        q.mark_scheduled(f);
        assert_eq!(q.status(f), Some(QueryStatus::Queued));

        let mut passive = QueryTracker::new(vec![QueryStatus::NotPollable]);
        passive.mark_scheduled(f);
        assert_eq!(passive.status(f), Some(QueryStatus::NotPollable));
    }

    #[test]
    fn test_reset_releases_slot() {
        let t0 = Instant::now();
        let mut q = tracker();
        q.mark_scheduled(FeatureId(1));
        q.begin(FeatureId(0), key(), t0);
        q.reset();
        assert_eq!(q.feature_queried(), None);
        assert_eq!(q.status(FeatureId(0)), Some(QueryStatus::NeverQueried));
        assert_eq!(q.status(FeatureId(1)), Some(QueryStatus::NeverQueried));
    }
}
