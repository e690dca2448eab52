// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Per-device pending request queue ordered by expiration time.

use std::collections::{BTreeMap, HashMap};

use tokio::time::Instant;

use crate::feature::FeatureId;
use crate::message::{Msg, MsgKey};

/// A request waiting to be transmitted.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub feature: FeatureId,
    pub msg: Msg,
    pub expires_at: Instant,
}

impl PendingRequest {
    pub fn new(feature: FeatureId, msg: Msg, expires_at: Instant) -> Self {
        Self {
            feature,
            msg,
            expires_at,
        }
    }

    fn identity(&self) -> (FeatureId, MsgKey) {
        (self.feature, self.msg.key())
    }
}

/// Min-queue on expiration time, de-duplicated by request identity.
///
/// Pushing a request whose identity matches a pending one replaces it, and
/// the new expiration wins even when it is later.
#[derive(Debug, Default)]
pub struct RequestQueue {
    entries: BTreeMap<(Instant, u64), PendingRequest>,
    index: HashMap<(FeatureId, MsgKey), (Instant, u64)>,
    seq: u64,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a request; returns true if it replaced an existing one.
    pub fn push(&mut self, request: PendingRequest) -> bool {
        let identity = request.identity();
        let replaced = match self.index.remove(&identity) {
            Some(slot) => self.entries.remove(&slot).is_some(),
            None => false,
        };
        self.seq += 1;
        let slot = (request.expires_at, self.seq);
        self.index.insert(identity, slot);
        self.entries.insert(slot, request);
        replaced
    }

    /// Remove and return the request with the earliest expiration.
    pub fn pop(&mut self) -> Option<PendingRequest> {
        let (_, request) = self.entries.pop_first()?;
        self.index.remove(&request.identity());
        Some(request)
    }

    pub fn next_expiration(&self) -> Option<Instant> {
        self.entries.keys().next().map(|(at, _)| *at)
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

    /// Take every request out in expiration order.
    pub fn drain(&mut self) -> Vec<PendingRequest> {
        self.index.clear();
        std::mem::take(&mut self.entries).into_values().collect()
    }
}
