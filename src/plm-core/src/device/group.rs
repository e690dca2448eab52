// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Duplicate suppression for unreliable broadcast traffic.
//!
//! A group command arrives as a BCAST, followed by a CLEAN sent directly to
//! each responder, followed by a SUCCESS report. Any of the three can be
//! repeated or lost. [`GroupMessageStateMachine`] tracks the expected next
//! message for one (device, group) pair and decides whether each arrival
//! carries new information.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::message::GroupMessageKind;

/// A repeated BCAST with the same cmd1 inside this window is a duplicate.
pub const GROUP_REPEAT_WINDOW: Duration = Duration::from_millis(30_000);
/// A repeated plain broadcast with the same cmd1 inside this window is a duplicate.
pub const BROADCAST_REPEAT_WINDOW: Duration = Duration::from_millis(2_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GroupState {
    #[default]
    ExpectBcast,
    ExpectClean,
    ExpectSuccess,
}

#[derive(Debug, Clone)]
pub struct GroupMessageStateMachine {
    state: GroupState,
    last_cmd1: u8,
    last_updated: Option<Instant>,
}

impl Default for GroupMessageStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl GroupMessageStateMachine {
    pub fn new() -> Self {
        Self {
            state: GroupState::ExpectBcast,
            last_cmd1: 0,
            last_updated: None,
        }
    }

    pub fn state(&self) -> GroupState {
        self.state
    }

    pub fn last_cmd1(&self) -> u8 {
        self.last_cmd1
    }

    pub fn last_updated(&self) -> Option<Instant> {
        self.last_updated
    }

    /// Advance on an incoming message; returns true if it should be published.
    pub fn action(&mut self, kind: GroupMessageKind, cmd1: u8, now: Instant) -> bool {
        use GroupMessageKind::{Bcast, Clean, Success};
        use GroupState::{ExpectBcast, ExpectClean, ExpectSuccess};

        let (publish, next) = match (self.state, kind) {
            (ExpectBcast, Bcast) => (true, ExpectClean),
            // Missed the BCAST; the CLEAN is the first news of this cycle.
            (ExpectBcast, Clean) => (true, ExpectSuccess),
            (ExpectBcast, Success) => (false, ExpectBcast),

            (ExpectClean, Bcast) => (!self.is_repeat(cmd1, now), ExpectClean),
            (ExpectClean, Clean) => (false, ExpectSuccess),
            // Missed the CLEAN; the cycle is over.
            (ExpectClean, Success) => (false, ExpectBcast),

            // Missed the SUCCESS; this BCAST starts a new cycle.
            (ExpectSuccess, Bcast) => (true, ExpectClean),
            (ExpectSuccess, Clean) => (false, ExpectSuccess),
            (ExpectSuccess, Success) => (false, ExpectBcast),
        };

        self.state = next;
        self.last_cmd1 = cmd1;
        self.last_updated = Some(now);
        publish
    }

    fn is_repeat(&self, cmd1: u8, now: Instant) -> bool {
        match self.last_updated {
            Some(last) => {
                cmd1 == self.last_cmd1
                    && now.saturating_duration_since(last) <= GROUP_REPEAT_WINDOW
            }
            None => false,
        }
    }
}

/// Lazily created state machines, one per group of a device.
#[derive(Debug, Default)]
pub struct GroupStates {
    machines: HashMap<u8, GroupMessageStateMachine>,
}

impl GroupStates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn evaluate(&mut self, group: u8, kind: GroupMessageKind, cmd1: u8, now: Instant) -> bool {
        self.machines
            .entry(group)
            .or_default()
            .action(kind, cmd1, now)
    }

    pub fn state(&self, group: u8) -> Option<GroupState> {
        self.machines.get(&group).map(|m| m.state())
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }
}

/// Suppression of repeated plain (non-group) broadcasts, keyed by cmd1.
#[derive(Debug, Default)]
pub struct BroadcastStates {
    last_seen: HashMap<u8, Instant>,
}

impl BroadcastStates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the broadcast is new.
    pub fn evaluate(&mut self, cmd1: u8, now: Instant) -> bool {
        if let Some(last) = self.last_seen.get(&cmd1) {
            let lapse = now.saturating_duration_since(*last);
            if !lapse.is_zero() && lapse < BROADCAST_REPEAT_WINDOW {
                return false;
            }
        }
        self.last_seen.insert(cmd1, now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use GroupMessageKind::{Bcast, Clean, Success};

    fn machine_in(state: GroupState) -> GroupMessageStateMachine {
        GroupMessageStateMachine {
            state,
            last_cmd1: 0,
            last_updated: None,
        }
    }

    #[test]
    fn test_clean_cycle() {
        let t0 = Instant::now();
        let mut sm = GroupMessageStateMachine::new();

        assert!(sm.action(Bcast, 0x11, t0));
        assert_eq!(sm.state(), GroupState::ExpectClean);

        assert!(!sm.action(Clean, 0x11, t0 + Duration::from_millis(300)));
        assert_eq!(sm.state(), GroupState::ExpectSuccess);

        assert!(!sm.action(Success, 0x06, t0 + Duration::from_millis(600)));
        assert_eq!(sm.state(), GroupState::ExpectBcast);
        assert_eq!(sm.last_cmd1(), 0x06);
        assert_eq!(sm.last_updated(), Some(t0 + Duration::from_millis(600)));
    }

    #[test]
    fn test_repeated_bcast_window() {
        let t0 = Instant::now();
        let mut sm = GroupMessageStateMachine::new();
        assert!(sm.action(Bcast, 0x11, t0));

        let mut duplicate = sm.clone();
        assert!(!duplicate.action(Bcast, 0x11, t0 + Duration::from_millis(5_000)));
        assert_eq!(duplicate.state(), GroupState::ExpectClean);

        let mut late = sm.clone();
        assert!(late.action(Bcast, 0x11, t0 + Duration::from_millis(35_000)));
        assert_eq!(late.state(), GroupState::ExpectClean);

        // A different command is always news.
        assert!(sm.action(Bcast, 0x13, t0 + Duration::from_millis(100)));
    }

    #[test]
    fn test_full_transition_table() {
        use GroupState::{ExpectBcast, ExpectClean, ExpectSuccess};

        let cases = [
            (ExpectBcast, Bcast, true, ExpectClean),
            (ExpectBcast, Clean, true, ExpectSuccess),
            (ExpectBcast, Success, false, ExpectBcast),
            (ExpectClean, Clean, false, ExpectSuccess),
            (ExpectClean, Success, false, ExpectBcast),
            (ExpectSuccess, Bcast, true, ExpectClean),
            (ExpectSuccess, Clean, false, ExpectSuccess),
            (ExpectSuccess, Success, false, ExpectBcast),
        ];
        let now = Instant::now();
        for (from, kind, publish, to) in cases {
            let mut sm = machine_in(from);
            assert_eq!(sm.action(kind, 0x11, now), publish, "{:?} + {:?}", from, kind);
            assert_eq!(sm.state(), to, "{:?} + {:?}", from, kind);
        }
    }

    #[test]
    fn test_groups_are_independent() {
        let t0 = Instant::now();
        let mut states = GroupStates::new();
        assert!(states.is_empty());
        assert!(states.evaluate(1, Bcast, 0x11, t0));
        assert!(states.evaluate(2, Bcast, 0x11, t0));
        assert!(!states.evaluate(1, Bcast, 0x11, t0 + Duration::from_millis(200)));
        assert_eq!(states.len(), 2);
        assert_eq!(states.state(2), Some(GroupState::ExpectClean));
        assert_eq!(states.state(3), None);
    }

    #[test]
    fn test_plain_broadcast_window() {
        let t0 = Instant::now();
        let mut states = BroadcastStates::new();
        assert!(states.evaluate(0x01, t0));
        assert!(!states.evaluate(0x01, t0 + Duration::from_millis(1_500)));
        assert!(states.evaluate(0x02, t0 + Duration::from_millis(1_500)));
        assert!(states.evaluate(0x01, t0 + Duration::from_millis(2_500)));
    }
}
