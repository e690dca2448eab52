// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Driver event notification.
//!
//! Upstream layers register listeners to learn about incoming messages that
//! survived duplicate suppression and about queries that got their answer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::address::DeviceAddress;
use crate::message::Msg;

/// Unique identifier for a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Implementors override only the events they care about.
pub trait DriverListener: Send + Sync {
    /// Called for every incoming message that is not a duplicate.
    fn on_message_published(&self, _device: DeviceAddress, _msg: &Msg) {}

    /// Called when a feature's query completed with an answer or a NACK.
    fn on_query_answered(&self, _device: DeviceAddress, _feature: &str) {}
}

#[derive(Default)]
pub struct DriverEventEmitter {
    listeners: Vec<(ListenerId, Arc<dyn DriverListener>)>,
}

impl DriverEventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns an ID that can be used to unregister the listener.
    pub fn register(&mut self, listener: Arc<dyn DriverListener>) -> ListenerId {
        let id = ListenerId::new();
        self.listeners.push((id, listener));
        id
    }

    pub fn unregister(&mut self, id: ListenerId) {
        self.listeners.retain(|(lid, _)| *lid != id);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn notify_message_published(&self, device: DeviceAddress, msg: &Msg) {
        for (_, listener) in &self.listeners {
            listener.on_message_published(device, msg);
        }
    }

    pub fn notify_query_answered(&self, device: DeviceAddress, feature: &str) {
        for (_, listener) in &self.listeners {
            listener.on_query_answered(device, feature);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        answered: Mutex<Vec<(DeviceAddress, String)>>,
        published: Mutex<Vec<u8>>,
    }

    impl DriverListener for Recorder {
        fn on_message_published(&self, _device: DeviceAddress, msg: &Msg) {
            self.published.lock().expect("mutex poisoned").push(msg.cmd1);
        }

        fn on_query_answered(&self, device: DeviceAddress, feature: &str) {
            self.answered
                .lock()
                .expect("mutex poisoned")
                .push((device, feature.to_string()));
        }
    }

    struct Silent;
    impl DriverListener for Silent {}

    #[test]
    fn test_register_and_notify() {
        let mut emitter = DriverEventEmitter::new();
        let recorder = Arc::new(Recorder::default());
        emitter.register(recorder.clone());
        emitter.register(Arc::new(Silent));
        assert_eq!(emitter.listener_count(), 2);

        let dev = DeviceAddress::new(1, 2, 3);
        emitter.notify_message_published(dev, &Msg::direct(dev, 0x11, 0xff));
        emitter.notify_query_answered(dev, "dimmer");

        assert_eq!(*recorder.published.lock().unwrap(), vec![0x11]);
        assert_eq!(
            *recorder.answered.lock().unwrap(),
            vec![(dev, "dimmer".to_string())]
        );
    }

    #[test]
    fn test_unregister() {
        let mut emitter = DriverEventEmitter::new();
        let recorder = Arc::new(Recorder::default());
        let id = emitter.register(recorder.clone());
        emitter.unregister(id);
        assert_eq!(emitter.listener_count(), 0);

        let dev = DeviceAddress::new(1, 2, 3);
        emitter.notify_query_answered(dev, "dimmer");
        assert!(recorder.answered.lock().unwrap().is_empty());
    }
}
