// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;

use plm_core::transport::{Transport, TransportEvent};
use plm_core::{DeviceAddress, DynResult};

mod loopback;
mod null;

pub use loopback::LoopbackModem;
pub use null::NullTransport;

/// Everything a transport needs to talk back to the driver.
#[derive(Debug, Clone)]
pub struct TransportAccess {
    pub events: mpsc::UnboundedSender<TransportEvent>,
    /// Address the modem uses as sender of its own messages.
    pub modem: DeviceAddress,
    /// Simulated device response latency.
    pub reply_delay: Duration,
}

pub type TransportFactory = fn(TransportAccess) -> DynResult<Box<dyn Transport>>;

/// Named transport factories.
#[derive(Clone)]
pub struct TransportRegistry {
    factories: HashMap<String, TransportFactory>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a factory under a stable name (e.g. "loopback").
    pub fn register_transport(&mut self, name: &str, factory: TransportFactory) {
        self.factories.insert(normalize_name(name), factory);
    }

    pub fn is_transport_registered(&self, name: &str) -> bool {
        self.factories.contains_key(&normalize_name(name))
    }

    pub fn registered_transports(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn build_transport(&self, name: &str, access: TransportAccess) -> DynResult<Box<dyn Transport>> {
        let factory = self
            .factories
            .get(&normalize_name(name))
            .ok_or_else(|| format!("Unknown transport: {}", name))?;
        factory(access)
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize_name(name: &str) -> String {
    name.to_ascii_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

/// Register all built-in transports on a registry.
pub fn register_builtin_transports_on(registry: &mut TransportRegistry) {
    registry.register_transport("loopback", loopback_factory);
    registry.register_transport("null", null_factory);
}

fn loopback_factory(access: TransportAccess) -> DynResult<Box<dyn Transport>> {
    Ok(Box::new(LoopbackModem::new(
        access.events,
        access.modem,
        access.reply_delay,
    )))
}

fn null_factory(access: TransportAccess) -> DynResult<Box<dyn Transport>> {
    Ok(Box::new(NullTransport::new(access.events)))
}
